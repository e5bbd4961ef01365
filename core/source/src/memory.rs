//! In-memory source store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use catalogsync_common::{Error, Result, Watermark, WatermarkKind};

use crate::provider::{values_equal, Filter, Row, RowQuery, SourceStore};

/// One version of a row. `valid_to == None` marks the current version.
#[derive(Debug, Clone)]
struct VersionedRow {
    rowid: u64,
    row: Row,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    version_from: i64,
    version_to: Option<i64>,
}

impl VersionedRow {
    fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    fn live_at(&self, at: &Watermark) -> bool {
        match at {
            Watermark::Timestamp(ts) => {
                self.valid_from <= *ts && self.valid_to.is_none_or(|to| to > *ts)
            }
            Watermark::Version(v) => {
                self.version_from <= *v && self.version_to.is_none_or(|to| to > *v)
            }
        }
    }

    fn touched_within(&self, since: &Watermark, until: &Watermark) -> bool {
        match (since, until) {
            (Watermark::Timestamp(since), Watermark::Timestamp(until)) => {
                let within = |t: DateTime<Utc>| t > *since && t <= *until;
                within(self.valid_from) || self.valid_to.is_some_and(within)
            }
            (Watermark::Version(since), Watermark::Version(until)) => {
                let within = |v: i64| v > *since && v <= *until;
                within(self.version_from) || self.version_to.is_some_and(within)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    tracking: bool,
    next_rowid: u64,
    versions: Vec<VersionedRow>,
}

impl Table {
    fn current(&self) -> impl Iterator<Item = &VersionedRow> {
        self.versions.iter().filter(|v| v.is_current())
    }
}

#[derive(Debug)]
struct State {
    tables: HashMap<String, Table>,
    clock: DateTime<Utc>,
    version: i64,
    fail_history: bool,
    unavailable: bool,
}

impl State {
    fn tick(&mut self) {
        self.clock += Duration::seconds(1);
        self.version += 1;
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::Source(format!("no such table: {}", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::Source(format!("no such table: {}", name)))
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Source("source unavailable".to_string()));
        }
        Ok(())
    }

    fn tracked_table(&self, name: &str) -> Result<&Table> {
        let table = self.table(name)?;
        if !table.tracking {
            return Err(Error::Capability(format!(
                "history tracking is not enabled for {}",
                name
            )));
        }
        Ok(table)
    }
}

/// In-memory source store.
///
/// Keeps full row history with a deterministic clock: every mutation moves
/// the clock forward by one second and the change counter by one, so tests
/// can reason about watermarks exactly.
pub struct MemorySource {
    state: RwLock<State>,
}

impl MemorySource {
    /// Create a new empty store. The clock starts at 2026-01-01T00:00:00Z.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                tables: HashMap::new(),
                clock: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default(),
                version: 0,
                fail_history: false,
                unavailable: false,
            }),
        }
    }

    pub async fn create_table(&self, name: &str) {
        let mut state = self.state.write().await;
        state.tables.entry(name.to_string()).or_default();
    }

    /// Start keeping history for `name`. Existing rows become visible at
    /// every earlier watermark.
    pub async fn enable_tracking(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let table = state.table_mut(name)?;
        if table.tracking {
            return Ok(());
        }
        table.tracking = true;
        for version in table.versions.iter_mut() {
            version.valid_from = DateTime::<Utc>::MIN_UTC;
            version.version_from = 0;
        }
        Ok(())
    }

    pub async fn insert(&self, table: &str, row: Row) -> Result<()> {
        let mut state = self.state.write().await;
        state.table(table)?;
        state.tick();
        let (clock, version) = (state.clock, state.version);
        let table = state.table_mut(table)?;
        table.next_rowid += 1;
        let rowid = table.next_rowid;
        table.versions.push(VersionedRow {
            rowid,
            row,
            valid_from: clock,
            valid_to: None,
            version_from: version,
            version_to: None,
        });
        Ok(())
    }

    /// Apply `changes` to every current row matching `filters`.
    /// Returns the number of rows updated.
    pub async fn update(&self, table: &str, filters: &[Filter], changes: Row) -> Result<usize> {
        let mut state = self.state.write().await;
        state.table(table)?;
        state.tick();
        let (clock, version) = (state.clock, state.version);
        let table = state.table_mut(table)?;

        let mut replacements = Vec::new();
        for current in table.versions.iter_mut() {
            if !current.is_current() || !current.row.matches(filters) {
                continue;
            }
            let mut row = current.row.clone();
            row.merge(&changes);
            if table.tracking {
                current.valid_to = Some(clock);
                current.version_to = Some(version);
                replacements.push(VersionedRow {
                    rowid: current.rowid,
                    row,
                    valid_from: clock,
                    valid_to: None,
                    version_from: version,
                    version_to: None,
                });
            } else {
                current.row = row;
                current.valid_from = clock;
                current.version_from = version;
                replacements.push(current.clone());
            }
        }

        let updated = replacements.len();
        if table.tracking {
            table.versions.extend(replacements);
        }
        Ok(updated)
    }

    /// Delete every current row matching `filters`. Returns the number of
    /// rows deleted.
    pub async fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        let mut state = self.state.write().await;
        state.table(table)?;
        state.tick();
        let (clock, version) = (state.clock, state.version);
        let table = state.table_mut(table)?;

        let mut deleted = 0;
        if table.tracking {
            for current in table.versions.iter_mut() {
                if current.is_current() && current.row.matches(filters) {
                    current.valid_to = Some(clock);
                    current.version_to = Some(version);
                    deleted += 1;
                }
            }
        } else {
            let before = table.versions.len();
            table.versions.retain(|v| !v.row.matches(filters));
            deleted = before - table.versions.len();
        }
        Ok(deleted)
    }

    /// Make point-in-time reads of past row state fail with a source error.
    pub async fn set_fail_history(&self, fail: bool) {
        self.state.write().await.fail_history = fail;
    }

    /// Make every read fail with a source error.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

fn contains_value(values: &[Value], value: &Value) -> bool {
    values.iter().any(|v| values_equal(v, value))
}

#[async_trait]
impl SourceStore for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn current_watermark(&self, kind: WatermarkKind) -> Result<Watermark> {
        let state = self.state.read().await;
        state.check_available()?;
        Ok(match kind {
            WatermarkKind::Timestamp => Watermark::Timestamp(state.clock),
            WatermarkKind::Version => Watermark::Version(state.version),
        })
    }

    async fn tracking_enabled(&self, table: &str) -> Result<bool> {
        let state = self.state.read().await;
        state.check_available()?;
        Ok(state.tables.get(table).is_some_and(|t| t.tracking))
    }

    async fn fetch(&self, query: &RowQuery) -> Result<Vec<Row>> {
        query.validate()?;
        let state = self.state.read().await;
        state.check_available()?;

        let base = state.table(&query.table)?;
        let mut candidates: Vec<&VersionedRow> = base
            .current()
            .filter(|v| v.row.matches(&query.filters))
            .filter(|v| match &query.keys {
                Some(keys) => v
                    .row
                    .get(&query.key_column)
                    .is_some_and(|k| contains_value(keys, k)),
                None => true,
            })
            .collect();
        candidates.sort_by_key(|v| v.rowid);

        let mut rows: Vec<Row> = candidates.into_iter().map(|v| v.row.clone()).collect();
        for join in &query.joins {
            let joined = state.table(&join.table)?;
            let mut next = Vec::new();
            for row in &rows {
                let Some(left) = row.get(&join.left_column) else {
                    continue;
                };
                let mut matches: Vec<&VersionedRow> = joined
                    .current()
                    .filter(|v| v.row.matches(&join.filters))
                    .filter(|v| {
                        v.row
                            .get(&join.right_column)
                            .is_some_and(|right| values_equal(left, right))
                    })
                    .collect();
                matches.sort_by_key(|v| v.rowid);
                for matched in matches {
                    let mut merged = row.clone();
                    merged.merge(&matched.row);
                    next.push(merged);
                }
            }
            rows = next;
        }

        Ok(rows)
    }

    async fn changed_keys(
        &self,
        table: &str,
        key_column: &str,
        filters: &[Filter],
        since: &Watermark,
        until: &Watermark,
    ) -> Result<Vec<Value>> {
        let state = self.state.read().await;
        state.check_available()?;
        let table = state.tracked_table(table)?;

        let mut keys: Vec<Value> = Vec::new();
        for version in &table.versions {
            if !version.touched_within(since, until) || !version.row.matches(filters) {
                continue;
            }
            if let Some(key) = version.row.get(key_column) {
                if !contains_value(&keys, key) {
                    keys.push(key.clone());
                }
            }
        }
        Ok(keys)
    }

    async fn row_as_of(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        filters: &[Filter],
        at: &Watermark,
    ) -> Result<Option<Row>> {
        let state = self.state.read().await;
        state.check_available()?;
        if state.fail_history {
            return Err(Error::Source("history read failed".to_string()));
        }
        let table = state.tracked_table(table)?;

        Ok(table
            .versions
            .iter()
            .filter(|v| v.live_at(at) && v.row.matches(filters))
            .find(|v| v.row.get(key_column).is_some_and(|k| values_equal(k, key)))
            .map(|v| v.row.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Join;
    use serde_json::json;

    async fn products() -> MemorySource {
        let source = MemorySource::new();
        source.create_table("products").await;
        source.create_table("product_prices").await;
        source.enable_tracking("products").await.unwrap();
        source.enable_tracking("product_prices").await.unwrap();
        source
            .insert("products", Row::new().with("product_id", 1).with("name", "Chair"))
            .await
            .unwrap();
        source
            .insert(
                "product_prices",
                Row::new()
                    .with("product_id", 1)
                    .with("price_type", 2)
                    .with("value", 10.0),
            )
            .await
            .unwrap();
        source
    }

    #[tokio::test]
    async fn test_fetch_with_join() {
        let source = products().await;
        let query = RowQuery::new("products", "product_id").join(
            Join::new("product_prices", "product_id", "product_id")
                .filter(Filter::eq("price_type", 2)),
        );

        let rows = source.fetch(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].str("name"), Some("Chair"));
        assert_eq!(rows[0].f64("value"), Some(10.0));

        let restricted = query.clone().restrict_to(vec![json!(2)]);
        assert!(source.fetch(&restricted).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changed_keys_window() {
        let source = products().await;
        let before = source.current_watermark(WatermarkKind::Timestamp).await.unwrap();

        source
            .update(
                "products",
                &[Filter::eq("product_id", 1)],
                Row::new().with("name", "Armchair"),
            )
            .await
            .unwrap();
        let after = source.current_watermark(WatermarkKind::Timestamp).await.unwrap();

        let keys = source
            .changed_keys("products", "product_id", &[], &before, &after)
            .await
            .unwrap();
        assert_eq!(keys, vec![json!(1)]);

        let none = source
            .changed_keys("products", "product_id", &[], &after, &after)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_row_as_of_returns_old_state() {
        let source = products().await;
        let before = source.current_watermark(WatermarkKind::Version).await.unwrap();
        source
            .update(
                "products",
                &[Filter::eq("product_id", 1)],
                Row::new().with("name", "Armchair"),
            )
            .await
            .unwrap();

        let old = source
            .row_as_of("products", "product_id", &json!(1), &[], &before)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.str("name"), Some("Chair"));

        let current = source
            .current_row("products", "product_id", &json!(1), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.str("name"), Some("Armchair"));
    }

    #[tokio::test]
    async fn test_deleted_row_is_reported_as_changed() {
        let source = products().await;
        let before = source.current_watermark(WatermarkKind::Version).await.unwrap();
        source
            .delete("products", &[Filter::eq("product_id", 1)])
            .await
            .unwrap();
        let after = source.current_watermark(WatermarkKind::Version).await.unwrap();

        let keys = source
            .changed_keys("products", "product_id", &[], &before, &after)
            .await
            .unwrap();
        assert_eq!(keys, vec![json!(1)]);
        let query = RowQuery::new("products", "product_id");
        assert!(source.fetch(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_untracked_table_lacks_capability() {
        let source = MemorySource::new();
        source.create_table("contacts").await;
        assert!(!source.tracking_enabled("contacts").await.unwrap());

        let wm = Watermark::Version(0);
        let result = source
            .changed_keys("contacts", "contact_id", &[], &wm, &wm)
            .await;
        assert!(matches!(result, Err(Error::Capability(_))));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let source = products().await;
        source.set_fail_history(true).await;
        let wm = Watermark::Version(0);
        assert!(source
            .row_as_of("products", "product_id", &json!(1), &[], &wm)
            .await
            .is_err());
        assert!(source.fetch(&RowQuery::new("products", "product_id")).await.is_ok());

        source.set_unavailable(true).await;
        assert!(source.fetch(&RowQuery::new("products", "product_id")).await.is_err());
    }
}
