//! Field-level diff of a record between the last watermark and now.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use catalogsync_common::{Result, Watermark};
use catalogsync_source::{values_equal, Filter, Row, SourceStore};

/// Round `value` to the nearest multiple of `increment`. A non-positive
/// increment leaves the value untouched.
pub fn round_to_increment(value: f64, increment: f64) -> f64 {
    if increment > 0.0 {
        (value / increment).round() * increment
    } else {
        value
    }
}

/// Value in whole cents after rounding to `increment`.
pub fn to_cents(value: f64, increment: f64) -> i64 {
    (round_to_increment(value, increment) * 100.0).round() as i64
}

/// A column whose change makes a record worth sending.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedField {
    /// Compared as stored.
    Column(String),
    /// Price compared in cents after rounding to the increment held in
    /// `increment_column` of the same row.
    Rounded {
        label: String,
        value_column: String,
        increment_column: String,
    },
}

impl TrackedField {
    pub fn column(name: impl Into<String>) -> Self {
        TrackedField::Column(name.into())
    }

    pub fn rounded(
        label: impl Into<String>,
        value_column: impl Into<String>,
        increment_column: impl Into<String>,
    ) -> Self {
        TrackedField::Rounded {
            label: label.into(),
            value_column: value_column.into(),
            increment_column: increment_column.into(),
        }
    }

    /// Name the change is reported under.
    pub fn name(&self) -> &str {
        match self {
            TrackedField::Column(name) => name,
            TrackedField::Rounded { label, .. } => label,
        }
    }

    fn normalize(&self, row: Option<&Row>) -> Value {
        let Some(row) = row else {
            return Value::Null;
        };
        match self {
            TrackedField::Column(name) => row.get(name).cloned().unwrap_or(Value::Null),
            TrackedField::Rounded {
                value_column,
                increment_column,
                ..
            } => match row.f64(value_column) {
                Some(value) => {
                    let increment = row.f64(increment_column).unwrap_or(0.0);
                    Value::from(to_cents(value, increment))
                }
                None => Value::Null,
            },
        }
    }
}

/// One table's worth of tracked fields for a record.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffTarget {
    pub table: String,
    pub key_column: String,
    pub filters: Vec<Filter>,
    pub fields: Vec<TrackedField>,
}

impl DiffTarget {
    pub fn new(table: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            filters: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn field(mut self, field: TrackedField) -> Self {
        self.fields.push(field);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// What a [`FieldDiff`] was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffBasis {
    /// No watermark yet; there is nothing to compare with.
    NoBaseline,
    /// Current state compared with the state as of the watermark.
    Compared,
    /// The historical read failed under force; treat every field as changed.
    Forced,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub basis: DiffBasis,
    pub changes: BTreeMap<String, FieldChange>,
}

impl FieldDiff {
    fn empty(basis: DiffBasis) -> Self {
        Self {
            basis,
            changes: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.changes.contains_key(field)
    }

    /// Whether the diff pins down exactly which fields changed. Otherwise
    /// the caller must send the full payload.
    pub fn is_precise(&self) -> bool {
        self.basis == DiffBasis::Compared
    }

    pub fn changed_fields(&self) -> BTreeSet<String> {
        self.changes.keys().cloned().collect()
    }

    fn merge(&mut self, other: FieldDiff) {
        if other.basis == DiffBasis::Forced {
            self.basis = DiffBasis::Forced;
        }
        self.changes.extend(other.changes);
    }
}

/// Computes [`FieldDiff`]s by reading the source twice: current state and
/// state as of the watermark.
pub struct FieldDiffResolver<'a> {
    source: &'a dyn SourceStore,
}

impl<'a> FieldDiffResolver<'a> {
    pub fn new(source: &'a dyn SourceStore) -> Self {
        Self { source }
    }

    /// Diff one table's tracked fields of record `key`.
    ///
    /// # Errors
    /// - Source errors, unless `force` is set, in which case a
    ///   [`DiffBasis::Forced`] diff is returned instead
    pub async fn diff(
        &self,
        target: &DiffTarget,
        key: &Value,
        watermark: Option<&Watermark>,
        force: bool,
    ) -> Result<FieldDiff> {
        let Some(watermark) = watermark else {
            return Ok(FieldDiff::empty(DiffBasis::NoBaseline));
        };

        let rows = self.read_pair(target, key, watermark).await;
        let (old, new) = match rows {
            Ok(pair) => pair,
            Err(e) if force => {
                warn!(
                    "Historical read of {} {} failed, treating as fully changed: {}",
                    target.table, key, e
                );
                return Ok(FieldDiff::empty(DiffBasis::Forced));
            }
            Err(e) => return Err(e),
        };

        let mut diff = FieldDiff::empty(DiffBasis::Compared);
        for field in &target.fields {
            let old_value = field.normalize(old.as_ref());
            let new_value = field.normalize(new.as_ref());
            if !values_equal(&old_value, &new_value) {
                diff.changes.insert(
                    field.name().to_string(),
                    FieldChange {
                        old: old_value,
                        new: new_value,
                    },
                );
            }
        }
        debug!(
            "{} {}: {} changed fields",
            target.table,
            key,
            diff.changes.len()
        );
        Ok(diff)
    }

    /// Diff several tables contributing to one record and merge the result.
    pub async fn diff_all(
        &self,
        targets: &[DiffTarget],
        key: &Value,
        watermark: Option<&Watermark>,
        force: bool,
    ) -> Result<FieldDiff> {
        let basis = if watermark.is_some() {
            DiffBasis::Compared
        } else {
            DiffBasis::NoBaseline
        };
        let mut merged = FieldDiff::empty(basis);
        for target in targets {
            merged.merge(self.diff(target, key, watermark, force).await?);
        }
        Ok(merged)
    }

    async fn read_pair(
        &self,
        target: &DiffTarget,
        key: &Value,
        watermark: &Watermark,
    ) -> Result<(Option<Row>, Option<Row>)> {
        let old = self
            .source
            .row_as_of(&target.table, &target.key_column, key, &target.filters, watermark)
            .await?;
        let new = self
            .source
            .current_row(&target.table, &target.key_column, key, &target.filters)
            .await?;
        Ok((old, new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_common::WatermarkKind;
    use catalogsync_source::MemorySource;
    use serde_json::json;

    fn price_target() -> DiffTarget {
        DiffTarget::new("product_prices", "product_id")
            .filter(Filter::eq("price_type", 2))
            .field(TrackedField::rounded("regular_price", "value", "rounding"))
    }

    fn name_target() -> DiffTarget {
        DiffTarget::new("products", "product_id")
            .field(TrackedField::column("name"))
            .field(TrackedField::column("description"))
    }

    async fn source() -> MemorySource {
        let source = MemorySource::new();
        source.create_table("products").await;
        source.create_table("product_prices").await;
        source.enable_tracking("products").await.unwrap();
        source.enable_tracking("product_prices").await.unwrap();
        source
            .insert(
                "products",
                Row::new()
                    .with("product_id", 1)
                    .with("name", "Chair")
                    .with("description", "Oak"),
            )
            .await
            .unwrap();
        source
            .insert(
                "product_prices",
                Row::new()
                    .with("product_id", 1)
                    .with("price_type", 2)
                    .with("value", 10.004)
                    .with("rounding", 0.01),
            )
            .await
            .unwrap();
        source
    }

    #[test]
    fn test_rounding() {
        assert_eq!(to_cents(10.004, 0.01), 1000);
        assert_eq!(to_cents(10.006, 0.01), 1001);
        assert_eq!(to_cents(12.3, 0.5), 1250);
        assert_eq!(to_cents(12.346, 0.0), 1235);
        assert!((round_to_increment(7.3, 1.0) - 7.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_no_watermark_means_no_baseline() {
        let source = source().await;
        let resolver = FieldDiffResolver::new(&source);
        let diff = resolver.diff(&name_target(), &json!(1), None, false).await.unwrap();
        assert_eq!(diff.basis, DiffBasis::NoBaseline);
        assert!(diff.is_empty());
        assert!(!diff.is_precise());
    }

    #[tokio::test]
    async fn test_unchanged_record_has_empty_diff() {
        let source = source().await;
        let watermark = source.current_watermark(WatermarkKind::Version).await.unwrap();
        let resolver = FieldDiffResolver::new(&source);

        let diff = resolver
            .diff_all(&[name_target(), price_target()], &json!(1), Some(&watermark), false)
            .await
            .unwrap();
        assert!(diff.is_precise());
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn test_price_change_below_rounding_is_ignored() {
        let source = source().await;
        let watermark = source.current_watermark(WatermarkKind::Timestamp).await.unwrap();
        source
            .update(
                "product_prices",
                &[Filter::eq("product_id", 1)],
                Row::new().with("value", 10.001),
            )
            .await
            .unwrap();
        let resolver = FieldDiffResolver::new(&source);

        let diff = resolver
            .diff(&price_target(), &json!(1), Some(&watermark), false)
            .await
            .unwrap();
        assert!(diff.is_empty());

        source
            .update(
                "product_prices",
                &[Filter::eq("product_id", 1)],
                Row::new().with("value", 12.0),
            )
            .await
            .unwrap();
        let diff = resolver
            .diff(&price_target(), &json!(1), Some(&watermark), false)
            .await
            .unwrap();
        assert_eq!(
            diff.changes.get("regular_price"),
            Some(&FieldChange {
                old: json!(1000),
                new: json!(1200),
            })
        );
    }

    #[tokio::test]
    async fn test_single_field_change() {
        let source = source().await;
        let watermark = source.current_watermark(WatermarkKind::Version).await.unwrap();
        source
            .update(
                "products",
                &[Filter::eq("product_id", 1)],
                Row::new().with("name", "Armchair"),
            )
            .await
            .unwrap();
        let resolver = FieldDiffResolver::new(&source);

        let diff = resolver
            .diff_all(&[name_target(), price_target()], &json!(1), Some(&watermark), false)
            .await
            .unwrap();
        assert_eq!(diff.changed_fields(), ["name".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn test_read_failure_with_and_without_force() {
        let source = source().await;
        let watermark = source.current_watermark(WatermarkKind::Version).await.unwrap();
        source.set_fail_history(true).await;
        let resolver = FieldDiffResolver::new(&source);

        assert!(resolver
            .diff(&name_target(), &json!(1), Some(&watermark), false)
            .await
            .is_err());

        let forced = resolver
            .diff_all(&[name_target(), price_target()], &json!(1), Some(&watermark), true)
            .await
            .unwrap();
        assert_eq!(forced.basis, DiffBasis::Forced);
        assert!(!forced.is_precise());
    }
}
