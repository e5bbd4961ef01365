//! SQLite-backed source store.
//!
//! History is kept in a companion table `<table>__history` maintained by
//! triggers, one row per version with its validity interval on both the
//! source clock and a global change counter. This gives the same two reads
//! a system-versioned temporal table offers: state as of a point, and the
//! keys touched within a window.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use catalogsync_common::{Error, Result, Watermark, WatermarkKind};

use crate::provider::{validate_identifier, Filter, Row, RowQuery, SourceStore};

const VERSION_TABLE: &str = "_catalogsync_version";
const HISTORY_SUFFIX: &str = "__history";
const HISTORY_META: [&str; 5] = ["_row", "_valid_from", "_valid_to", "_version_from", "_version_to"];
const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";
const BEGINNING_OF_TIME: &str = "0000-01-01T00:00:00.000Z";
const KEY_CHUNK: usize = 500;
const CLOCK_SETTLE_ATTEMPTS: usize = 50;

fn sql_err(err: rusqlite::Error) -> Error {
    Error::Source(err.to_string())
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

fn history_table(table: &str) -> String {
    format!("{}{}", table, HISTORY_SUFFIX)
}

/// Timestamps are stored as millisecond RFC 3339 text so that lexical and
/// chronological order agree.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Source(format!("bad source timestamp {:?}: {}", text, e)))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}

/// Accumulates `?N` placeholders and their parameters.
#[derive(Default)]
struct Params {
    values: Vec<SqlValue>,
}

impl Params {
    fn push(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    fn push_json(&mut self, value: &Value) -> String {
        self.push(to_sql(value))
    }
}

fn filter_clauses(alias: &str, filters: &[Filter], params: &mut Params) -> Result<Vec<String>> {
    filters
        .iter()
        .map(|f| {
            validate_identifier(&f.column)?;
            let placeholder = params.push_json(&f.value);
            Ok(format!("{}.{} = {}", alias, quote(&f.column), placeholder))
        })
        .collect()
}

fn read_rows(
    conn: &Connection,
    sql: &str,
    params: Vec<SqlValue>,
    skip: &[&str],
) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut result = Row::new();
        for (i, name) in names.iter().enumerate() {
            if skip.contains(&name.as_str()) {
                continue;
            }
            result.insert(name.clone(), from_sql(row.get_ref(i)?));
        }
        out.push(result);
    }
    Ok(out)
}

/// SQLite source store.
pub struct SqliteSource {
    conn: Mutex<Connection>,
}

impl SqliteSource {
    /// Open a source database.
    ///
    /// # Errors
    /// - `Error::Source` if the database cannot be opened
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sql_err)?;
        info!("Source database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory source (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Source("source connection lock poisoned".to_string()))?;
        f(&conn).map_err(sql_err)
    }

    /// Source clock in the format history stamps use.
    fn clock(&self) -> Result<String> {
        self.with_conn(|conn| conn.query_row(&format!("SELECT {}", NOW), [], |row| row.get(0)))
    }

    /// Run raw SQL statements against the source.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql))
    }

    fn history_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [history_table(table)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Enable history tracking for `table`.
    ///
    /// Creates the history table, seeds it with the current rows as valid
    /// since the beginning of time, and installs the maintenance triggers.
    /// Calling it again for a tracked table is a no-op.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if `table` is not a valid identifier
    /// - `Error::NotFound` if `table` does not exist
    pub fn enable_tracking(&self, table: &str) -> Result<()> {
        validate_identifier(table)?;

        let columns: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })?;
        if columns.is_empty() {
            return Err(Error::NotFound(format!("table {}", table)));
        }
        for column in &columns {
            validate_identifier(column)?;
        }

        if self.with_conn(|conn| Self::history_exists(conn, table))? {
            debug!("Tracking already enabled for {}", table);
            return Ok(());
        }

        let history = quote(&history_table(table));
        let base = quote(table);
        let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let column_defs = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(",\n    ");
        let prefixed = |prefix: &str| {
            columns
                .iter()
                .map(|c| format!("{}.{}", prefix, quote(c)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let version = format!("(SELECT value FROM {} WHERE id = 1)", VERSION_TABLE);
        let bump = format!("UPDATE {} SET value = value + 1 WHERE id = 1;", VERSION_TABLE);
        let insert_new = format!(
            "INSERT INTO {history} (_row, _valid_from, _valid_to, _version_from, _version_to, {column_list})
             VALUES (NEW.rowid, {NOW}, NULL, {version}, NULL, {new_values});",
            new_values = prefixed("NEW"),
        );
        let close_old = format!(
            "UPDATE {history} SET _valid_to = {NOW}, _version_to = {version}
             WHERE _row = OLD.rowid AND _valid_to IS NULL;"
        );
        let trigger = |event: &str| format!("{}__{}", table, event);

        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {VERSION_TABLE} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO {VERSION_TABLE} (id, value) VALUES (1, 0);

            CREATE TABLE {history} (
                _row INTEGER NOT NULL,
                _valid_from TEXT NOT NULL,
                _valid_to TEXT,
                _version_from INTEGER NOT NULL,
                _version_to INTEGER,
                {column_defs}
            );
            CREATE INDEX {idx_from} ON {history} (_valid_from, _version_from);
            CREATE INDEX {idx_row} ON {history} (_row, _valid_to);

            INSERT INTO {history} (_row, _valid_from, _valid_to, _version_from, _version_to, {column_list})
            SELECT rowid, '{BEGINNING_OF_TIME}', NULL, 0, NULL, {column_list} FROM {base};

            CREATE TRIGGER {t_insert} AFTER INSERT ON {base} BEGIN
                {bump}
                {insert_new}
            END;
            CREATE TRIGGER {t_update} AFTER UPDATE ON {base} BEGIN
                {bump}
                {close_old}
                {insert_new}
            END;
            CREATE TRIGGER {t_delete} AFTER DELETE ON {base} BEGIN
                {bump}
                {close_old}
            END;
            "#,
            idx_from = quote(&format!("{}_valid_from_idx", history_table(table))),
            idx_row = quote(&format!("{}_row_idx", history_table(table))),
            t_insert = quote(&trigger("history_insert")),
            t_update = quote(&trigger("history_update")),
            t_delete = quote(&trigger("history_delete")),
        );

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(&sql)?;
            tx.commit()
        })?;
        info!("History tracking enabled for {}", table);
        Ok(())
    }

    fn history_window(
        since: &Watermark,
        until: &Watermark,
        params: &mut Params,
    ) -> Result<String> {
        let (from_col, to_col, lo, hi) = match (since, until) {
            (Watermark::Timestamp(a), Watermark::Timestamp(b)) => (
                "_valid_from",
                "_valid_to",
                SqlValue::Text(format_timestamp(a)),
                SqlValue::Text(format_timestamp(b)),
            ),
            (Watermark::Version(a), Watermark::Version(b)) => (
                "_version_from",
                "_version_to",
                SqlValue::Integer(*a),
                SqlValue::Integer(*b),
            ),
            _ => {
                return Err(Error::InvalidInput(
                    "change window bounds must share a watermark kind".to_string(),
                ))
            }
        };
        let lo = params.push(lo);
        let hi = params.push(hi);
        Ok(format!(
            "(({from} > {lo} AND {from} <= {hi}) OR ({to} > {lo} AND {to} <= {hi}))",
            from = from_col,
            to = to_col,
        ))
    }

    fn as_of_clause(at: &Watermark, params: &mut Params) -> String {
        let (from_col, to_col, point) = match at {
            Watermark::Timestamp(ts) => ("_valid_from", "_valid_to", SqlValue::Text(format_timestamp(ts))),
            Watermark::Version(v) => ("_version_from", "_version_to", SqlValue::Integer(*v)),
        };
        let point = params.push(point);
        format!(
            "{from} <= {point} AND ({to} IS NULL OR {to} > {point})",
            from = from_col,
            to = to_col,
        )
    }

    fn require_tracking(&self, table: &str) -> Result<()> {
        validate_identifier(table)?;
        if self.with_conn(|conn| Self::history_exists(conn, table))? {
            Ok(())
        } else {
            Err(Error::Capability(format!(
                "history tracking is not enabled for {}",
                table
            )))
        }
    }

    fn fetch_chunk(&self, query: &RowQuery, keys: Option<&[Value]>) -> Result<Vec<Row>> {
        let mut params = Params::default();
        let mut select = vec!["b.*".to_string()];
        let mut joins = Vec::new();
        for (i, join) in query.joins.iter().enumerate() {
            let alias = format!("j{}", i);
            let mut on = vec![format!(
                "{}.{} = b.{}",
                alias,
                quote(&join.right_column),
                quote(&join.left_column)
            )];
            on.extend(filter_clauses(&alias, &join.filters, &mut params)?);
            select.push(format!("{}.*", alias));
            joins.push(format!(
                "JOIN {} AS {} ON {}",
                quote(&join.table),
                alias,
                on.join(" AND ")
            ));
        }

        let mut clauses = filter_clauses("b", &query.filters, &mut params)?;
        if let Some(keys) = keys {
            let placeholders: Vec<String> = keys.iter().map(|k| params.push_json(k)).collect();
            clauses.push(format!(
                "b.{} IN ({})",
                quote(&query.key_column),
                placeholders.join(", ")
            ));
        }

        let mut sql = format!(
            "SELECT {} FROM {} AS b {}",
            select.join(", "),
            quote(&query.table),
            joins.join(" ")
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY b.rowid");
        for i in 0..query.joins.len() {
            sql.push_str(&format!(", j{}.rowid", i));
        }

        self.with_conn(|conn| read_rows(conn, &sql, params.values, &[]))
    }
}

#[async_trait]
impl SourceStore for SqliteSource {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn current_watermark(&self, kind: WatermarkKind) -> Result<Watermark> {
        match kind {
            WatermarkKind::Timestamp => {
                // Stamps have millisecond resolution. Wait for the clock to
                // pass the captured value so that no later write shares it.
                let now = self.clock()?;
                for _ in 0..CLOCK_SETTLE_ATTEMPTS {
                    if self.clock()? > now {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Ok(Watermark::Timestamp(parse_timestamp(&now)?))
            }
            WatermarkKind::Version => {
                let value: Option<i64> = self.with_conn(|conn| {
                    let exists: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        [VERSION_TABLE],
                        |row| row.get(0),
                    )?;
                    if exists == 0 {
                        return Ok(None);
                    }
                    conn.query_row(
                        &format!("SELECT value FROM {} WHERE id = 1", VERSION_TABLE),
                        [],
                        |row| row.get(0),
                    )
                    .optional()
                })?;
                Ok(Watermark::Version(value.unwrap_or(0)))
            }
        }
    }

    async fn tracking_enabled(&self, table: &str) -> Result<bool> {
        validate_identifier(table)?;
        self.with_conn(|conn| Self::history_exists(conn, table))
    }

    async fn fetch(&self, query: &RowQuery) -> Result<Vec<Row>> {
        query.validate()?;
        match &query.keys {
            None => self.fetch_chunk(query, None),
            Some(keys) => {
                let mut rows = Vec::new();
                for chunk in keys.chunks(KEY_CHUNK) {
                    rows.extend(self.fetch_chunk(query, Some(chunk))?);
                }
                Ok(rows)
            }
        }
    }

    async fn changed_keys(
        &self,
        table: &str,
        key_column: &str,
        filters: &[Filter],
        since: &Watermark,
        until: &Watermark,
    ) -> Result<Vec<Value>> {
        self.require_tracking(table)?;
        validate_identifier(key_column)?;

        let mut params = Params::default();
        let mut clauses = vec![Self::history_window(since, until, &mut params)?];
        clauses.extend(filter_clauses("h", filters, &mut params)?);
        let sql = format!(
            "SELECT DISTINCT h.{key} FROM {history} AS h WHERE {where_clause} ORDER BY h.{key}",
            key = quote(key_column),
            history = quote(&history_table(table)),
            where_clause = clauses.join(" AND "),
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let keys = stmt
                .query_map(params_from_iter(params.values), |row| Ok(from_sql(row.get_ref(0)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys.into_iter().filter(|k| !k.is_null()).collect())
        })
    }

    async fn row_as_of(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        filters: &[Filter],
        at: &Watermark,
    ) -> Result<Option<Row>> {
        self.require_tracking(table)?;
        validate_identifier(key_column)?;

        let mut params = Params::default();
        let key_placeholder = params.push_json(key);
        let mut clauses = vec![format!("h.{} = {}", quote(key_column), key_placeholder)];
        clauses.extend(filter_clauses("h", filters, &mut params)?);
        clauses.push(Self::as_of_clause(at, &mut params));
        let sql = format!(
            "SELECT h.* FROM {} AS h WHERE {} ORDER BY h._version_from DESC LIMIT 1",
            quote(&history_table(table)),
            clauses.join(" AND "),
        );

        let rows = self.with_conn(|conn| read_rows(conn, &sql, params.values, &HISTORY_META))?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Join;
    use serde_json::json;

    const SCHEMA: &str = r#"
        CREATE TABLE products (product_id INTEGER PRIMARY KEY, name TEXT, description TEXT);
        CREATE TABLE product_prices (product_id INTEGER, price_type INTEGER, value REAL, rounding REAL);
        INSERT INTO products VALUES (1, 'Chair', 'Oak');
        INSERT INTO product_prices VALUES (1, 2, 10.0, 0.01);
        INSERT INTO product_prices VALUES (1, 1, 8.0, 0.01);
    "#;

    fn source() -> SqliteSource {
        let source = SqliteSource::in_memory().unwrap();
        source.execute_batch(SCHEMA).unwrap();
        source
    }

    async fn tick() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn test_fetch_join_filters() {
        let source = source();
        let query = RowQuery::new("products", "product_id").join(
            Join::new("product_prices", "product_id", "product_id")
                .filter(Filter::eq("price_type", 2)),
        );

        let rows = source.fetch(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].str("name"), Some("Chair"));
        assert_eq!(rows[0].f64("value"), Some(10.0));

        let none = source.fetch(&query.restrict_to(vec![])).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_tracking_capability() {
        let source = source();
        assert!(!source.tracking_enabled("products").await.unwrap());
        assert_eq!(
            source.current_watermark(WatermarkKind::Version).await.unwrap(),
            Watermark::Version(0)
        );

        let wm = Watermark::Version(0);
        let result = source.changed_keys("products", "product_id", &[], &wm, &wm).await;
        assert!(matches!(result, Err(Error::Capability(_))));

        source.enable_tracking("products").unwrap();
        source.enable_tracking("products").unwrap();
        assert!(source.tracking_enabled("products").await.unwrap());
        assert!(matches!(
            source.enable_tracking("missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_by_timestamp() {
        let source = source();
        source.enable_tracking("products").unwrap();
        tick().await;
        let before = source.current_watermark(WatermarkKind::Timestamp).await.unwrap();
        tick().await;

        source
            .execute_batch("UPDATE products SET name = 'Armchair' WHERE product_id = 1")
            .unwrap();
        tick().await;
        let after = source.current_watermark(WatermarkKind::Timestamp).await.unwrap();

        let keys = source
            .changed_keys("products", "product_id", &[], &before, &after)
            .await
            .unwrap();
        assert_eq!(keys, vec![json!(1)]);

        let old = source
            .row_as_of("products", "product_id", &json!(1), &[], &before)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.str("name"), Some("Chair"));
        assert!(old.get("_valid_from").is_none());

        let new = source
            .row_as_of("products", "product_id", &json!(1), &[], &after)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(new.str("name"), Some("Armchair"));
    }

    #[tokio::test]
    async fn test_write_right_after_timestamp_capture_is_in_next_window() {
        let source = source();
        source.enable_tracking("products").unwrap();
        let until = source.current_watermark(WatermarkKind::Timestamp).await.unwrap();
        source
            .execute_batch("UPDATE products SET name = 'Stool' WHERE product_id = 1")
            .unwrap();
        tick().await;
        let next = source.current_watermark(WatermarkKind::Timestamp).await.unwrap();

        let keys = source
            .changed_keys("products", "product_id", &[], &until, &next)
            .await
            .unwrap();
        assert_eq!(keys, vec![json!(1)]);
        assert_eq!(next.compare(&until), Some(std::cmp::Ordering::Greater));
    }

    #[tokio::test]
    async fn test_history_by_version_counter() {
        let source = source();
        source.enable_tracking("product_prices").unwrap();
        let before = source.current_watermark(WatermarkKind::Version).await.unwrap();

        source
            .execute_batch(
                "UPDATE product_prices SET value = 12.0 WHERE product_id = 1 AND price_type = 2;
                 INSERT INTO product_prices VALUES (2, 2, 5.0, 0.01);",
            )
            .unwrap();
        let after = source.current_watermark(WatermarkKind::Version).await.unwrap();
        assert_eq!(after, Watermark::Version(2));

        let filters = [Filter::eq("price_type", 2)];
        let keys = source
            .changed_keys("product_prices", "product_id", &filters, &before, &after)
            .await
            .unwrap();
        assert_eq!(keys, vec![json!(1), json!(2)]);

        let old = source
            .row_as_of("product_prices", "product_id", &json!(1), &filters, &before)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.f64("value"), Some(10.0));

        let absent = source
            .row_as_of("product_prices", "product_id", &json!(2), &filters, &before)
            .await
            .unwrap();
        assert!(absent.is_none());
    }

    #[tokio::test]
    async fn test_deletion_closes_history() {
        let source = source();
        source.enable_tracking("products").unwrap();
        let before = source.current_watermark(WatermarkKind::Version).await.unwrap();
        source
            .execute_batch("DELETE FROM products WHERE product_id = 1")
            .unwrap();
        let after = source.current_watermark(WatermarkKind::Version).await.unwrap();

        let keys = source
            .changed_keys("products", "product_id", &[], &before, &after)
            .await
            .unwrap();
        assert_eq!(keys, vec![json!(1)]);
        assert!(source
            .row_as_of("products", "product_id", &json!(1), &[], &after)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_persistent_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        {
            let source = SqliteSource::open(&path).unwrap();
            source.execute_batch(SCHEMA).unwrap();
            source.enable_tracking("products").unwrap();
        }
        let reopened = SqliteSource::open(&path).unwrap();
        assert!(reopened.tracking_enabled("products").await.unwrap());
    }
}
