//! Sync state tracking and persistence.
//!
//! The state is a watermark per entity scope. It is read once when a run
//! starts and written only after a fully successful reconciliation pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use catalogsync_common::{EntityScope, Error, Result, Watermark};

/// Watermark record for one entity scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeState {
    pub watermark: Watermark,
    /// Wall-clock time of the run that set the watermark.
    pub updated_at: DateTime<Utc>,
}

/// Watermarks of every entity scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    scopes: BTreeMap<String, ScopeState>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scope: &EntityScope) -> Option<&ScopeState> {
        self.scopes.get(scope.as_str())
    }

    pub fn watermark(&self, scope: &EntityScope) -> Option<&Watermark> {
        self.get(scope).map(|s| &s.watermark)
    }

    /// Move the watermark of `scope` to `watermark`.
    ///
    /// Returns `false` and leaves the state untouched if `watermark` is
    /// older than the stored one. A watermark of a different kind replaces
    /// the stored one.
    pub fn advance(&mut self, scope: &EntityScope, watermark: Watermark) -> bool {
        if let Some(current) = self.scopes.get(scope.as_str()) {
            if current.watermark.compare(&watermark) == Some(Ordering::Greater) {
                warn!(
                    "Refusing to move {} watermark back from {} to {}",
                    scope, current.watermark, watermark
                );
                return false;
            }
        }
        self.scopes.insert(
            scope.as_str().to_string(),
            ScopeState {
                watermark,
                updated_at: Utc::now(),
            },
        );
        true
    }

    /// Forget the watermark of `scope`, so its next run is a first run.
    pub fn reset(&mut self, scope: &EntityScope) -> Option<ScopeState> {
        self.scopes.remove(scope.as_str())
    }

    pub fn scopes(&self) -> impl Iterator<Item = (&str, &ScopeState)> {
        self.scopes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Durable home of the [`SyncState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state. A store that was never saved yields an empty state.
    async fn load(&self) -> Result<SyncState>;

    /// Persist the state atomically: readers see either the old or the new
    /// state, never a partial write.
    async fn save(&self, state: &SyncState) -> Result<()>;
}

/// JSON file state store, written via temp file and rename.
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<SyncState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => SyncState::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting fresh", self.path.display());
                Ok(SyncState::new())
            }
            Err(e) => Err(Error::Storage(format!(
                "Failed to read state file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, state.to_json()?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("State saved to {}", self.path.display());
        Ok(())
    }
}

/// In-memory state store for testing.
#[derive(Default)]
pub struct MemoryStateStore {
    state: RwLock<SyncState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<SyncState> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        *self.state.write().await = state.clone();
        Ok(())
    }
}
