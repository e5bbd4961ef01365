//! Catalogsync Sync Engine
//!
//! This module moves records from a source store to a remote catalog:
//! - Change detection against a per-scope watermark (history or version counter)
//! - Field-level diffs so updates carry only what changed
//! - Identity map between source ids and remote ids
//! - Chunked batch reconciliation with retry and backoff
//! - Periodic scheduling of sync cycles

pub mod detect;
pub mod diff;
pub mod engine;
pub mod identity;
pub mod mapper;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use detect::{ChangeDetector, DetectionStrategy, FullReason, SyncScope, TrackedTable};
pub use diff::{
    round_to_increment, to_cents, DiffBasis, DiffTarget, FieldChange, FieldDiff,
    FieldDiffResolver, TrackedField,
};
pub use engine::{EngineConfig, RunPhase, RunReport, ScopeStatus, SyncEngine, SyncOptions, Tally};
pub use identity::{
    IdentityMap, IdentityMapping, IdentityStore, MemoryIdentityStore, SqliteIdentityStore,
};
pub use mapper::{MapContext, RecordMapper, SyncEntity};
pub use reconcile::{BatchReconciler, ReconcileConfig, Reconciliation};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncCycle, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{JsonStateStore, MemoryStateStore, ScopeState, StateStore, SyncState};
