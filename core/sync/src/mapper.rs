//! Record mapping seam between source rows and remote payloads.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use catalogsync_common::{EntityScope, Result, SyncError, Watermark};
use catalogsync_remote::Payload;
use catalogsync_source::{Row, RowQuery};

use crate::detect::{DetectionStrategy, TrackedTable};
use crate::diff::{DiffTarget, FieldDiff, FieldDiffResolver};

/// What a mapper may consult while building a payload.
pub struct MapContext<'a> {
    /// Baseline to diff against. `None` on full reads.
    pub watermark: Option<&'a Watermark>,
    pub force: bool,
    pub strategy: DetectionStrategy,
    pub resolver: FieldDiffResolver<'a>,
}

impl<'a> MapContext<'a> {
    /// Diff record `key` across `targets` against the run's baseline.
    pub async fn diff(&self, targets: &[DiffTarget], key: &Value) -> Result<FieldDiff> {
        self.resolver
            .diff_all(targets, key, self.watermark, self.force)
            .await
    }

    /// Narrow `payload` to what `diff` says changed.
    ///
    /// `fields_for` translates a changed source field into the payload
    /// fields it feeds. Imprecise diffs (no baseline, forced) keep the full
    /// payload. An empty precise diff keeps the full payload in history
    /// mode; in version-counter mode the record was touched without any
    /// tracked change and the payload becomes a no-op.
    pub fn restrict<F>(&self, payload: Payload, diff: &FieldDiff, fields_for: F) -> Payload
    where
        F: Fn(&str) -> Vec<&'static str>,
    {
        if !diff.is_precise() {
            return payload;
        }
        if diff.is_empty() {
            return match self.strategy {
                DetectionStrategy::History => payload,
                DetectionStrategy::VersionCounter => {
                    debug!("{} touched without tracked changes", payload.natural_key);
                    payload.with_changed(BTreeSet::new())
                }
            };
        }
        let changed = diff
            .changes
            .keys()
            .flat_map(|field| fields_for(field))
            .map(str::to_string)
            .collect();
        payload.with_changed(changed)
    }
}

/// Turns one source row into a payload, or decides to skip it.
///
/// `Ok(None)` is a deliberate skip. `Recoverable` drops the record and
/// the run goes on. `Degraded` drops the record and keeps the watermark
/// where it is so the record is looked at again. `Fatal` aborts the run.
#[async_trait]
pub trait RecordMapper: Send + Sync {
    async fn map(
        &self,
        row: &Row,
        ctx: &MapContext<'_>,
    ) -> std::result::Result<Option<Payload>, SyncError>;
}

/// Everything the engine needs to know about one entity kind.
pub trait SyncEntity: RecordMapper {
    fn scope(&self) -> &EntityScope;

    /// Column of the candidate rows holding the source record id.
    fn id_column(&self) -> &str;

    /// Tables whose changes make a record a candidate.
    fn tracked_tables(&self) -> Vec<TrackedTable>;

    /// Query for every candidate row. The engine narrows it to changed
    /// records on incremental runs.
    fn query(&self) -> RowQuery;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{DiffBasis, FieldChange};
    use catalogsync_common::NaturalKey;
    use catalogsync_source::MemorySource;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn payload() -> Payload {
        Payload::new(
            NaturalKey::Sku("1".to_string()),
            json!({"name": "Chair", "regular_price": "10.00"})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    fn diff(basis: DiffBasis, fields: &[&str]) -> FieldDiff {
        FieldDiff {
            basis,
            changes: fields
                .iter()
                .map(|f| {
                    (
                        f.to_string(),
                        FieldChange {
                            old: json!(1),
                            new: json!(2),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn ctx(source: &MemorySource, strategy: DetectionStrategy) -> MapContext<'_> {
        MapContext {
            watermark: None,
            force: false,
            strategy,
            resolver: FieldDiffResolver::new(source),
        }
    }

    fn same(field: &str) -> Vec<&'static str> {
        match field {
            "name" => vec!["name"],
            "regular_price" => vec!["regular_price"],
            _ => vec![],
        }
    }

    #[test]
    fn test_restrict_to_changed_fields() {
        let source = MemorySource::new();
        let ctx = ctx(&source, DetectionStrategy::History);

        let narrowed = ctx.restrict(payload(), &diff(DiffBasis::Compared, &["name"]), same);
        assert_eq!(narrowed.changed, Some(["name".to_string()].into_iter().collect()));

        let forced = ctx.restrict(payload(), &diff(DiffBasis::Forced, &[]), same);
        assert_eq!(forced.changed, None);
    }

    #[test]
    fn test_empty_diff_depends_on_strategy() {
        let source = MemorySource::new();
        let empty = diff(DiffBasis::Compared, &[]);

        let history = ctx(&source, DetectionStrategy::History).restrict(payload(), &empty, same);
        assert_eq!(history.changed, None);

        let counter =
            ctx(&source, DetectionStrategy::VersionCounter).restrict(payload(), &empty, same);
        assert!(counter.is_noop());
    }
}
