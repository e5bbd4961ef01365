//! Source store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use catalogsync_common::{Error, Result, SourceId, Watermark, WatermarkKind};

/// A single source row with named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Column as text; `None` for missing or NULL columns.
    pub fn str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    /// Column as integer, accepting integer-valued reals and numeric text.
    pub fn i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Column as real, accepting numeric text.
    pub fn f64(&self, column: &str) -> Option<f64> {
        match self.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Canonical source id taken from `column`.
    pub fn source_id(&self, column: &str) -> Option<SourceId> {
        self.get(column).and_then(SourceId::from_value)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    /// Copy every column of `other` into this row, overwriting duplicates.
    pub fn merge(&mut self, other: &Row) {
        for (column, value) in &other.columns {
            self.columns.insert(column.clone(), value.clone());
        }
    }

    /// Whether every filter matches this row.
    pub fn matches(&self, filters: &[Filter]) -> bool {
        filters.iter().all(|f| {
            self.get(&f.column)
                .is_some_and(|value| values_equal(value, &f.value))
        })
    }
}

/// Equality that treats `1` and `1.0` as the same value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// Column equality predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Inner join of the base table with `table` on `left_column = right_column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub table: String,
    /// Column of the base table.
    pub left_column: String,
    /// Column of the joined table.
    pub right_column: String,
    /// Predicates applied to the joined table.
    pub filters: Vec<Filter>,
}

impl Join {
    pub fn new(
        table: impl Into<String>,
        left_column: impl Into<String>,
        right_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            left_column: left_column.into(),
            right_column: right_column.into(),
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Structured candidate-row query.
///
/// Entities describe what they read with this type rather than raw SQL so
/// the same description can run against any [`SourceStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowQuery {
    pub table: String,
    pub key_column: String,
    pub joins: Vec<Join>,
    pub filters: Vec<Filter>,
    /// Restrict the result to rows whose key is in this set.
    pub keys: Option<Vec<Value>>,
}

impl RowQuery {
    pub fn new(table: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            joins: Vec::new(),
            filters: Vec::new(),
            keys: None,
        }
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn restrict_to(mut self, keys: Vec<Value>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Validate every identifier the query references.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.key_column)?;
        for filter in &self.filters {
            validate_identifier(&filter.column)?;
        }
        for join in &self.joins {
            validate_identifier(&join.table)?;
            validate_identifier(&join.left_column)?;
            validate_identifier(&join.right_column)?;
            for filter in &join.filters {
                validate_identifier(&filter.column)?;
            }
        }
        Ok(())
    }
}

/// Reject identifiers that could escape quoting in generated SQL.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid identifier: {:?}", name)))
    }
}

/// The relational source the engine reads from.
///
/// Implementations must provide two historical read forms: row state as of
/// a watermark, and the keys touched after a watermark. Both timestamp and
/// version watermarks are accepted; which one is used is a deployment choice
/// made by the change detector.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Store name for logging (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Capture the current position of the source clock or change counter.
    ///
    /// The result becomes the next watermark if the run succeeds, so it must
    /// be captured before any rows are read.
    async fn current_watermark(&self, kind: WatermarkKind) -> Result<Watermark>;

    /// Whether historical tracking is enabled for `table`.
    async fn tracking_enabled(&self, table: &str) -> Result<bool>;

    /// Run a candidate-row query.
    ///
    /// # Errors
    /// - `Error::Source` if the store cannot be queried
    async fn fetch(&self, query: &RowQuery) -> Result<Vec<Row>>;

    /// Distinct `key_column` values of rows in `table` that were written
    /// after `since` and no later than `until`.
    ///
    /// # Errors
    /// - `Error::Capability` if tracking is not enabled for `table`
    async fn changed_keys(
        &self,
        table: &str,
        key_column: &str,
        filters: &[Filter],
        since: &Watermark,
        until: &Watermark,
    ) -> Result<Vec<Value>>;

    /// State of a single row as of `at`, or `None` if it did not exist then.
    ///
    /// # Errors
    /// - `Error::Capability` if tracking is not enabled for `table`
    async fn row_as_of(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        filters: &[Filter],
        at: &Watermark,
    ) -> Result<Option<Row>>;

    /// Current state of a single row.
    async fn current_row(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        filters: &[Filter],
    ) -> Result<Option<Row>> {
        let mut query = RowQuery::new(table, key_column).restrict_to(vec![key.clone()]);
        query.filters = filters.to_vec();
        Ok(self.fetch(&query).await?.into_iter().next())
    }
}
