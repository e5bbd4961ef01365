//! Change detection: decides whether a run reads everything or only the
//! records touched since the last watermark.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

use catalogsync_common::{Result, Watermark, WatermarkKind};
use catalogsync_source::{values_equal, Filter, SourceStore};

/// How changes are located in the source. Chosen per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// Per-row validity intervals on the source clock.
    #[default]
    History,
    /// A single store-wide change counter.
    VersionCounter,
}

impl DetectionStrategy {
    pub fn watermark_kind(&self) -> WatermarkKind {
        match self {
            DetectionStrategy::History => WatermarkKind::Timestamp,
            DetectionStrategy::VersionCounter => WatermarkKind::Version,
        }
    }
}

/// A source table whose changes affect an entity.
///
/// `key_column` must hold the entity's record id, so that a change in a
/// satellite table (e.g. a price row) can be attributed to the record.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTable {
    pub table: String,
    pub key_column: String,
    pub filters: Vec<Filter>,
}

impl TrackedTable {
    pub fn new(table: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Why a run reads every candidate row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullReason {
    FirstRun,
    Rebuild,
    CapabilityMissing,
    WatermarkKindChanged,
}

impl fmt::Display for FullReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FullReason::FirstRun => "no previous sync",
            FullReason::Rebuild => "rebuild requested",
            FullReason::CapabilityMissing => "history tracking unavailable",
            FullReason::WatermarkKindChanged => "detection strategy changed",
        };
        write!(f, "{}", reason)
    }
}

/// Query scope of one entity run.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncScope {
    Full { reason: FullReason },
    /// Only records whose id is in `keys` need to be read.
    Incremental { since: Watermark, keys: Vec<Value> },
}

/// Selects the scope of a run from the stored watermark and the source's
/// capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    strategy: DetectionStrategy,
}

impl ChangeDetector {
    pub fn new(strategy: DetectionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> DetectionStrategy {
        self.strategy
    }

    /// Whether every table in `tables` supports historical reads.
    pub async fn is_available(
        &self,
        source: &dyn SourceStore,
        tables: &[TrackedTable],
    ) -> Result<bool> {
        for tracked in tables {
            if !source.tracking_enabled(&tracked.table).await? {
                debug!("History tracking not enabled for {}", tracked.table);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decide the scope of a run.
    ///
    /// `until` is the watermark captured at the start of the run; changes
    /// are looked for in `(watermark, until]`. A missing capability is not
    /// an error: the run is downgraded to a full read with a warning.
    ///
    /// # Errors
    /// - Source errors while probing capability or listing changes
    pub async fn scope(
        &self,
        source: &dyn SourceStore,
        tables: &[TrackedTable],
        watermark: Option<&Watermark>,
        until: &Watermark,
        force_full: bool,
    ) -> Result<SyncScope> {
        if force_full {
            return Ok(SyncScope::Full {
                reason: FullReason::Rebuild,
            });
        }
        let Some(since) = watermark else {
            return Ok(SyncScope::Full {
                reason: FullReason::FirstRun,
            });
        };
        if since.kind() != self.strategy.watermark_kind() || until.kind() != since.kind() {
            warn!(
                "Stored watermark {} does not match the {:?} strategy, reading everything",
                since, self.strategy
            );
            return Ok(SyncScope::Full {
                reason: FullReason::WatermarkKindChanged,
            });
        }
        if !self.is_available(source, tables).await? {
            warn!("History tracking is not enabled on every tracked table, falling back to a full read");
            return Ok(SyncScope::Full {
                reason: FullReason::CapabilityMissing,
            });
        }

        let mut keys: Vec<Value> = Vec::new();
        for tracked in tables {
            let changed = source
                .changed_keys(
                    &tracked.table,
                    &tracked.key_column,
                    &tracked.filters,
                    since,
                    until,
                )
                .await?;
            debug!("{} keys changed in {}", changed.len(), tracked.table);
            for key in changed {
                if !keys.iter().any(|k| values_equal(k, &key)) {
                    keys.push(key);
                }
            }
        }

        info!("Incremental scope since {}: {} candidate records", since, keys.len());
        Ok(SyncScope::Incremental {
            since: since.clone(),
            keys,
        })
    }
}
