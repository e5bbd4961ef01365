//! Sync orchestrator: drives one entity scope from change detection to
//! persisted mappings and an advanced watermark.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use catalogsync_common::{
    EntityScope, NaturalKey, Result, SourceId, SyncError, Watermark,
};
use catalogsync_remote::{BatchApi, Payload, UpdateOp};
use catalogsync_source::{Row, SourceStore};

use crate::detect::{ChangeDetector, DetectionStrategy, FullReason, SyncScope};
use crate::diff::FieldDiffResolver;
use crate::identity::IdentityStore;
use crate::mapper::{MapContext, RecordMapper, SyncEntity};
use crate::reconcile::{BatchReconciler, ReconcileConfig, Reconciliation};
use crate::state::{ScopeState, StateStore};

/// Configuration for the sync engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// How changes are located in the source.
    pub strategy: DetectionStrategy,
    pub reconcile: ReconcileConfig,
}

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Read everything and forget the identity map before reconciling.
    pub rebuild: bool,
    /// Treat records whose history cannot be read as fully changed.
    pub force: bool,
}

/// Phases of one entity run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Scoping,
    Fetching,
    Mapping,
    Reconciling,
    PersistingMappings,
    Success,
    PartialFailure,
}

impl RunPhase {
    fn can_enter(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, Scoping)
                | (Idle, Mapping)
                | (Scoping, Fetching)
                | (Fetching, Mapping)
                | (Mapping, Reconciling)
                | (Mapping, Success)
                | (Mapping, PartialFailure)
                | (Reconciling, PersistingMappings)
                | (PersistingMappings, Success)
                | (PersistingMappings, PartialFailure)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Success | RunPhase::PartialFailure)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Scoping => "scoping",
            RunPhase::Fetching => "fetching",
            RunPhase::Mapping => "mapping",
            RunPhase::Reconciling => "reconciling",
            RunPhase::PersistingMappings => "persisting mappings",
            RunPhase::Success => "success",
            RunPhase::PartialFailure => "partial failure",
        };
        write!(f, "{}", name)
    }
}

/// Tracks the phase of a run and logs every transition.
struct RunTracker<'a> {
    scope: &'a EntityScope,
    phase: RunPhase,
}

impl<'a> RunTracker<'a> {
    fn new(scope: &'a EntityScope) -> Self {
        Self {
            scope,
            phase: RunPhase::Idle,
        }
    }

    fn enter(&mut self, next: RunPhase) {
        if !self.phase.can_enter(next) {
            warn!(scope = %self.scope, "Unexpected transition {} -> {}", self.phase, next);
        }
        debug!(scope = %self.scope, "{} -> {}", self.phase, next);
        self.phase = next;
    }
}

/// Attempted versus succeeded items of one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub attempted: usize,
    pub succeeded: usize,
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.succeeded, self.attempted)
    }
}

/// What one entity run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub scope: EntityScope,
    /// Terminal phase: `Success` or `PartialFailure`.
    pub outcome: RunPhase,
    /// Why the run read every candidate, if it did.
    pub full_reason: Option<FullReason>,
    pub candidates: usize,
    /// Records the mapper chose to skip or rejected as recoverable.
    pub skipped: usize,
    /// Records dropped in a way that must be looked at again.
    pub degraded: usize,
    /// Updates dropped because nothing tracked had changed.
    pub unchanged: usize,
    pub created: Tally,
    pub updated: Tally,
    pub deleted: Tally,
    /// Created remote records that could not be linked to a source record.
    pub inconsistencies: Vec<NaturalKey>,
    /// Set when a dispatch failed and the rest of the work was not sent.
    pub aborted: Option<String>,
    /// Watermark stored by this run.
    pub watermark: Option<Watermark>,
    pub elapsed_ms: u128,
}

impl RunReport {
    pub fn new(scope: &EntityScope) -> Self {
        Self {
            scope: scope.clone(),
            outcome: RunPhase::Success,
            full_reason: None,
            candidates: 0,
            skipped: 0,
            degraded: 0,
            unchanged: 0,
            created: Tally::default(),
            updated: Tally::default(),
            deleted: Tally::default(),
            inconsistencies: Vec::new(),
            aborted: None,
            watermark: None,
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunPhase::Success
    }

    /// Whether remote records may exist that no mapping points at.
    pub fn may_have_orphans(&self) -> bool {
        self.aborted.is_some() || !self.inconsistencies.is_empty()
    }

    fn log_summary(&self) {
        let summary = format!(
            "{}: {} - created {}, updated {}, deleted {}; {} candidates, {} skipped, {} degraded, {} unchanged, {} inconsistencies in {}ms",
            self.scope,
            self.outcome,
            self.created,
            self.updated,
            self.deleted,
            self.candidates,
            self.skipped,
            self.degraded,
            self.unchanged,
            self.inconsistencies.len(),
            self.elapsed_ms
        );
        if self.is_success() {
            info!("{}", summary);
        } else {
            warn!("{}", summary);
        }
    }
}

/// Watermark and mapping count of one scope.
#[derive(Debug, Clone)]
pub struct ScopeStatus {
    pub scope: EntityScope,
    pub state: Option<ScopeState>,
    pub mappings: usize,
}

/// Sync engine for one source store.
///
/// Entities are run one at a time; nothing here is shared between runs
/// other than the stores.
pub struct SyncEngine {
    source: Arc<dyn SourceStore>,
    identities: Arc<dyn IdentityStore>,
    state: Arc<dyn StateStore>,
    detector: ChangeDetector,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn SourceStore>,
        identities: Arc<dyn IdentityStore>,
        state: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            identities,
            state,
            detector: ChangeDetector::new(config.strategy),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn SourceStore> {
        &self.source
    }

    /// Sync one entity scope.
    ///
    /// The upper watermark is captured before anything is read, so changes
    /// landing during the run are picked up by the next one. The stored
    /// watermark moves only when the run succeeds.
    ///
    /// # Errors
    /// - Source, state or identity store failures; the watermark is left
    ///   untouched
    pub async fn sync_entity(
        &self,
        entity: &dyn SyncEntity,
        api: &dyn BatchApi,
        options: SyncOptions,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let scope = entity.scope();
        let mut tracker = RunTracker::new(scope);
        info!(scope = %scope, "Starting sync to {}", api.name());

        tracker.enter(RunPhase::Scoping);
        let mut state = self.state.load().await?;
        let stored = state.watermark(scope).cloned();
        let until = self
            .source
            .current_watermark(self.detector.strategy().watermark_kind())
            .await?;
        let tables = entity.tracked_tables();
        let sync_scope = self
            .detector
            .scope(
                self.source.as_ref(),
                &tables,
                stored.as_ref(),
                &until,
                options.rebuild,
            )
            .await?;

        tracker.enter(RunPhase::Fetching);
        let (rows, since, full_reason) = match sync_scope {
            SyncScope::Full { reason } => {
                info!(scope = %scope, "Full read: {}", reason);
                (self.source.fetch(&entity.query()).await?, None, Some(reason))
            }
            SyncScope::Incremental { since, keys } if keys.is_empty() => {
                info!(scope = %scope, "No changes since {}", since);
                (Vec::new(), Some(since), None)
            }
            SyncScope::Incremental { since, keys } => {
                let query = entity.query().restrict_to(keys);
                (self.source.fetch(&query).await?, Some(since), None)
            }
        };
        debug!(scope = %scope, "Fetched {} candidate rows", rows.len());

        let mut report = self
            .run_tracked(
                &mut tracker,
                scope,
                rows,
                entity.id_column(),
                entity,
                api,
                since.as_ref(),
                options,
            )
            .await?;
        report.full_reason = full_reason;

        if report.is_success() {
            if state.advance(scope, until.clone()) {
                self.state.save(&state).await?;
                report.watermark = Some(until);
            }
        } else {
            warn!(
                scope = %scope,
                "Watermark left at {}; the next run retries these records",
                stored
                    .as_ref()
                    .map(|w| w.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
        }

        report.elapsed_ms = started.elapsed().as_millis();
        report.log_summary();
        Ok(report)
    }

    /// Map, reconcile and link one set of candidate rows.
    ///
    /// An empty candidate set succeeds without contacting the remote. On
    /// `rebuild` the identity map of the scope is cleared first.
    ///
    /// # Errors
    /// - Identity store failures and fatal mapper errors
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        scope: &EntityScope,
        rows: Vec<Row>,
        id_column: &str,
        mapper: &dyn RecordMapper,
        api: &dyn BatchApi,
        watermark: Option<&Watermark>,
        options: SyncOptions,
    ) -> Result<RunReport> {
        let mut tracker = RunTracker::new(scope);
        self.run_tracked(
            &mut tracker,
            scope,
            rows,
            id_column,
            mapper,
            api,
            watermark,
            options,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_tracked(
        &self,
        tracker: &mut RunTracker<'_>,
        scope: &EntityScope,
        rows: Vec<Row>,
        id_column: &str,
        mapper: &dyn RecordMapper,
        api: &dyn BatchApi,
        watermark: Option<&Watermark>,
        options: SyncOptions,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(scope);
        report.candidates = rows.len();

        tracker.enter(RunPhase::Mapping);
        if rows.is_empty() {
            debug!(scope = %scope, "Nothing to map");
            tracker.enter(RunPhase::Success);
            return Ok(report);
        }

        let identities = if options.rebuild {
            let cleared = self.identities.clear(scope).await?;
            info!(scope = %scope, "Rebuild: dropped {} mappings", cleared);
            Default::default()
        } else {
            self.identities.load(scope).await?
        };
        debug!(scope = %scope, "{} known mappings", identities.len());

        let ctx = MapContext {
            watermark,
            force: options.force,
            strategy: self.config.strategy,
            resolver: FieldDiffResolver::new(self.source.as_ref()),
        };

        let mut creations: Vec<Payload> = Vec::new();
        let mut updates: Vec<UpdateOp> = Vec::new();
        let mut pending: HashMap<NaturalKey, SourceId> = HashMap::new();

        for row in &rows {
            let Some(source_id) = row.source_id(id_column) else {
                warn!(scope = %scope, "Row without {}, skipped", id_column);
                report.skipped += 1;
                continue;
            };

            let payload = match mapper.map(row, &ctx).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!(scope = %scope, "{} skipped by mapper", source_id);
                    report.skipped += 1;
                    continue;
                }
                Err(SyncError::Recoverable { record_id, reason }) => {
                    warn!(scope = %scope, "Skipping {}: {}", record_id, reason);
                    report.skipped += 1;
                    continue;
                }
                Err(SyncError::Degraded { record_id, reason }) => {
                    error!(scope = %scope, "Dropping {} for this run: {}", record_id, reason);
                    report.degraded += 1;
                    continue;
                }
                Err(SyncError::Fatal(e)) => {
                    error!(scope = %scope, "Mapping {} failed: {}", source_id, e);
                    return Err(e);
                }
            };

            match identities.get(&source_id) {
                Some(id) if payload.is_noop() => {
                    debug!(scope = %scope, "{} (id {}) unchanged, not sent", source_id, id);
                    report.unchanged += 1;
                }
                Some(id) => updates.push(UpdateOp { id, payload }),
                None => {
                    if let Some(previous) = pending.insert(payload.natural_key.clone(), source_id.clone()) {
                        warn!(
                            scope = %scope,
                            "{} and {} share {}, only one can be created",
                            previous,
                            source_id,
                            payload.natural_key
                        );
                    }
                    creations.push(payload);
                }
            }
        }

        report.created.attempted = creations.len();
        report.updated.attempted = updates.len();

        tracker.enter(RunPhase::Reconciling);
        let result = BatchReconciler::new(api, self.config.reconcile.clone())
            .reconcile(creations, updates, Vec::new())
            .await;
        report.created.succeeded = Reconciliation::succeeded(&result.created);
        report.updated.succeeded = Reconciliation::succeeded(&result.updated);
        report.aborted = result.aborted.clone();

        tracker.enter(RunPhase::PersistingMappings);
        let mut all_ok = result.all_ok && report.degraded == 0;
        for item in result.created.iter().filter(|i| i.is_ok()) {
            let linked = match (&item.natural_key, item.id) {
                (Some(key), Some(id)) => pending.get(key).map(|source_id| (key, source_id, id)),
                _ => None,
            };
            let Some((key, source_id, id)) = linked else {
                error!(
                    scope = %scope,
                    "Created item {:?} (id {:?}) matches no source record",
                    item.natural_key, item.id
                );
                if let Some(key) = &item.natural_key {
                    report.inconsistencies.push(key.clone());
                }
                continue;
            };
            if let Err(e) = self.identities.upsert(scope, source_id, id).await {
                error!(scope = %scope, "Could not link {} to {}: {}", source_id, id, e);
                report.inconsistencies.push(key.clone());
                all_ok = false;
            }
        }

        if result.aborted.is_some() {
            warn!(
                scope = %scope,
                "Run aborted mid-way; remote records created by an unanswered request have no mapping"
            );
        }

        if all_ok {
            tracker.enter(RunPhase::Success);
        } else {
            tracker.enter(RunPhase::PartialFailure);
            report.outcome = RunPhase::PartialFailure;
        }
        Ok(report)
    }

    /// Delete every mapped remote record of the entity, forget the
    /// mappings and the watermark, then sync from scratch.
    ///
    /// If the deletions cannot be dispatched the mappings are kept and the
    /// resync does not happen. Per-item deletion failures do not stop it.
    ///
    /// # Errors
    /// - Store failures, or any error of the resync
    pub async fn regenerate(
        &self,
        entity: &dyn SyncEntity,
        api: &dyn BatchApi,
        options: SyncOptions,
    ) -> Result<RunReport> {
        let scope = entity.scope();
        let identities = self.identities.load(scope).await?;
        let deletions: Vec<_> = identities.destination_ids().collect();
        info!(scope = %scope, "Regenerating: deleting {} remote records", deletions.len());

        let result = BatchReconciler::new(api, self.config.reconcile.clone())
            .reconcile(Vec::new(), Vec::new(), deletions.clone())
            .await;
        let deleted = Tally {
            attempted: deletions.len(),
            succeeded: Reconciliation::succeeded(&result.deleted),
        };

        if let Some(reason) = result.aborted {
            error!(scope = %scope, "Deletion aborted, mappings kept: {}", reason);
            let mut report = RunReport::new(scope);
            report.outcome = RunPhase::PartialFailure;
            report.deleted = deleted;
            report.aborted = Some(reason);
            report.log_summary();
            return Ok(report);
        }
        if deleted.succeeded < deleted.attempted {
            warn!(
                scope = %scope,
                "{} remote records could not be deleted",
                deleted.attempted - deleted.succeeded
            );
        }

        let cleared = self.identities.clear(scope).await?;
        let mut state = self.state.load().await?;
        if state.reset(scope).is_some() {
            self.state.save(&state).await?;
        }
        info!(scope = %scope, "Dropped {} mappings and the watermark", cleared);

        let mut report = self
            .sync_entity(
                entity,
                api,
                SyncOptions {
                    rebuild: false,
                    ..options
                },
            )
            .await?;
        report.deleted = deleted;
        Ok(report)
    }

    /// Current watermark and mapping count of `scope`.
    pub async fn status(&self, scope: &EntityScope) -> Result<ScopeStatus> {
        let state = self.state.load().await?;
        let mappings = self.identities.mappings(scope).await?.len();
        Ok(ScopeStatus {
            scope: scope.clone(),
            state: state.get(scope).cloned(),
            mappings,
        })
    }
}
