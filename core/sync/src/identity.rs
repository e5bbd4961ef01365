//! Identity map: which remote record each source record became.
//!
//! The map is a bijection per entity scope. Upserts coalesce any rows that
//! share either the source id or the destination id into a single row, so
//! replaying a creation or re-linking a record never leaves duplicates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info};

use catalogsync_common::{DestinationId, EntityScope, Error, Result, SourceId};

/// One source record linked to one remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub source_id: SourceId,
    pub destination_id: DestinationId,
    pub last_synced_at: DateTime<Utc>,
}

/// Loaded identity map of one scope, indexed by source id.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    by_source: HashMap<SourceId, DestinationId>,
}

impl IdentityMap {
    pub fn get(&self, source_id: &SourceId) -> Option<DestinationId> {
        self.by_source.get(source_id).copied()
    }

    pub fn contains(&self, source_id: &SourceId) -> bool {
        self.by_source.contains_key(source_id)
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    pub fn destination_ids(&self) -> impl Iterator<Item = DestinationId> + '_ {
        self.by_source.values().copied()
    }
}

impl FromIterator<IdentityMapping> for IdentityMap {
    fn from_iter<I: IntoIterator<Item = IdentityMapping>>(iter: I) -> Self {
        Self {
            by_source: iter
                .into_iter()
                .map(|m| (m.source_id, m.destination_id))
                .collect(),
        }
    }
}

/// Persistent identity map.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Every mapping of `scope`.
    async fn mappings(&self, scope: &EntityScope) -> Result<Vec<IdentityMapping>>;

    /// Load `scope` as a lookup map.
    async fn load(&self, scope: &EntityScope) -> Result<IdentityMap> {
        Ok(self.mappings(scope).await?.into_iter().collect())
    }

    /// Link `source_id` to `destination_id`.
    ///
    /// # Postconditions
    /// - Exactly one mapping of `scope` mentions either id, and it pairs them
    async fn upsert(
        &self,
        scope: &EntityScope,
        source_id: &SourceId,
        destination_id: DestinationId,
    ) -> Result<()>;

    /// Drop every mapping of `scope`. Returns how many were removed.
    async fn clear(&self, scope: &EntityScope) -> Result<usize>;
}

/// In-memory identity store for testing.
#[derive(Default)]
pub struct MemoryIdentityStore {
    scopes: RwLock<HashMap<EntityScope, Vec<IdentityMapping>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn mappings(&self, scope: &EntityScope) -> Result<Vec<IdentityMapping>> {
        Ok(self
            .scopes
            .read()
            .await
            .get(scope)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        scope: &EntityScope,
        source_id: &SourceId,
        destination_id: DestinationId,
    ) -> Result<()> {
        let mut scopes = self.scopes.write().await;
        let rows = scopes.entry(scope.clone()).or_default();
        rows.retain(|m| &m.source_id != source_id && m.destination_id != destination_id);
        rows.push(IdentityMapping {
            source_id: source_id.clone(),
            destination_id,
            last_synced_at: Utc::now(),
        });
        Ok(())
    }

    async fn clear(&self, scope: &EntityScope) -> Result<usize> {
        Ok(self
            .scopes
            .write()
            .await
            .remove(scope)
            .map(|rows| rows.len())
            .unwrap_or(0))
    }
}

fn sql_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// SQLite identity store, table `sync_identity`.
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    /// Open or create the identity table in the database at `db_path`.
    ///
    /// # Errors
    /// - `Error::Storage` if the database cannot be opened or migrated
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sql_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_identity (
                scope TEXT NOT NULL,
                source_id TEXT NOT NULL,
                destination_id INTEGER NOT NULL,
                last_synced_at TEXT NOT NULL,
                UNIQUE (scope, source_id),
                UNIQUE (scope, destination_id)
            );
            "#,
        )
        .map_err(sql_err)?;
        info!("Identity store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("identity store lock poisoned".to_string()))?;
        f(&mut conn).map_err(sql_err)
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn mappings(&self, scope: &EntityScope) -> Result<Vec<IdentityMapping>> {
        let rows: Vec<(String, i64, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_id, destination_id, last_synced_at
                 FROM sync_identity WHERE scope = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([scope.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(source_id, destination_id, synced_at)| {
                let last_synced_at = DateTime::parse_from_rfc3339(&synced_at)
                    .map_err(|e| Error::Storage(format!("bad sync time {:?}: {}", synced_at, e)))?
                    .with_timezone(&Utc);
                let destination_id = u64::try_from(destination_id).map_err(|_| {
                    Error::Storage(format!("bad destination id {}", destination_id))
                })?;
                Ok(IdentityMapping {
                    source_id: SourceId::new(source_id),
                    destination_id: DestinationId::new(destination_id),
                    last_synced_at,
                })
            })
            .collect()
    }

    async fn upsert(
        &self,
        scope: &EntityScope,
        source_id: &SourceId,
        destination_id: DestinationId,
    ) -> Result<()> {
        let destination = i64::try_from(destination_id.get())
            .map_err(|_| Error::InvalidInput(format!("destination id {} too large", destination_id)))?;
        let now = Utc::now().to_rfc3339();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT rowid FROM sync_identity
                     WHERE scope = ?1 AND (source_id = ?2 OR destination_id = ?3)
                     ORDER BY rowid",
                )?;
                let ids = stmt
                    .query_map(params![scope.as_str(), source_id.as_str(), destination], |row| {
                        row.get(0)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };

            match existing.split_first() {
                None => {
                    tx.execute(
                        "INSERT INTO sync_identity (scope, source_id, destination_id, last_synced_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![scope.as_str(), source_id.as_str(), destination, now],
                    )?;
                }
                Some((keep, extras)) => {
                    for rowid in extras {
                        tx.execute("DELETE FROM sync_identity WHERE rowid = ?1", [rowid])?;
                    }
                    tx.execute(
                        "UPDATE sync_identity
                         SET source_id = ?1, destination_id = ?2, last_synced_at = ?3
                         WHERE rowid = ?4",
                        params![source_id.as_str(), destination, now, keep],
                    )?;
                    if !extras.is_empty() {
                        debug!(
                            "Coalesced {} stale identity rows for {} {}",
                            extras.len(),
                            scope,
                            source_id
                        );
                    }
                }
            }
            tx.commit()
        })
    }

    async fn clear(&self, scope: &EntityScope) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sync_identity WHERE scope = ?1", [scope.as_str()])
        })
    }
}
