//! Chunked dispatch of creates, updates and deletes to a [`BatchApi`].

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use catalogsync_common::DestinationId;
use catalogsync_remote::{BatchApi, BatchRequest, ItemResult, Payload, UpdateOp};

use crate::retry::{RetryConfig, RetryExecutor};

/// Batching behaviour of the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Ceiling on items per request. The API's own ceiling also applies.
    pub max_batch_items: usize,
    /// Delay between consecutive dispatches.
    pub pause: Duration,
    /// Retry policy applied to each dispatch.
    pub retry: RetryConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_batch_items: 100,
            pause: Duration::from_secs(1),
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Every dispatch went through and every item succeeded.
    pub all_ok: bool,
    pub created: Vec<ItemResult>,
    pub updated: Vec<ItemResult>,
    pub deleted: Vec<ItemResult>,
    /// Requests that went through.
    pub batches: usize,
    /// Set when a dispatch failed and the remaining items were not sent.
    pub aborted: Option<String>,
}

impl Reconciliation {
    pub fn succeeded(items: &[ItemResult]) -> usize {
        items.iter().filter(|i| i.is_ok()).count()
    }
}

/// Splits work into requests no larger than the ceiling and sends them in
/// order: each request takes creations first, then updates, then deletions.
pub struct BatchReconciler<'a> {
    api: &'a dyn BatchApi,
    config: ReconcileConfig,
    retry: RetryExecutor,
}

impl<'a> BatchReconciler<'a> {
    pub fn new(api: &'a dyn BatchApi, config: ReconcileConfig) -> Self {
        let retry = RetryExecutor::new(config.retry.clone());
        Self { api, config, retry }
    }

    fn ceiling(&self) -> usize {
        self.config
            .max_batch_items
            .min(self.api.max_batch_items())
            .max(1)
    }

    /// Send everything, chunked.
    ///
    /// Item failures mark the pass as not ok and the remaining chunks still
    /// go out. A failed dispatch (after retries) stops the pass; results of
    /// the chunks already sent are kept.
    pub async fn reconcile(
        &self,
        creations: Vec<Payload>,
        updates: Vec<UpdateOp>,
        deletions: Vec<DestinationId>,
    ) -> Reconciliation {
        let mut result = Reconciliation {
            all_ok: true,
            ..Default::default()
        };
        let total = creations.len() + updates.len() + deletions.len();
        if total == 0 {
            debug!("Nothing to send to {}", self.api.name());
            return result;
        }

        let ceiling = self.ceiling();
        info!(
            "Sending to {}: {} creations, {} updates, {} deletions in batches of {}",
            self.api.name(),
            creations.len(),
            updates.len(),
            deletions.len(),
            ceiling
        );

        let (mut c, mut u, mut d) = (0, 0, 0);
        while c < creations.len() || u < updates.len() || d < deletions.len() {
            let mut room = ceiling;
            let take_c = room.min(creations.len() - c);
            room -= take_c;
            let take_u = room.min(updates.len() - u);
            room -= take_u;
            let take_d = room.min(deletions.len() - d);

            let request = BatchRequest {
                create: creations[c..c + take_c].to_vec(),
                update: updates[u..u + take_u].to_vec(),
                delete: deletions[d..d + take_d].to_vec(),
            };
            let label = format!("{} batch {}", self.api.name(), result.batches + 1);

            let response = match self
                .retry
                .execute(&label, || self.api.submit(&request))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!("{} failed, remaining items not sent: {}", label, e);
                    result.all_ok = false;
                    result.aborted = Some(e.to_string());
                    break;
                }
            };
            result.batches += 1;

            if response.created.len() != take_c
                || response.updated.len() != take_u
                || response.deleted.len() != take_d
            {
                warn!(
                    "{} answered {}/{}/{} items for {}/{}/{} sent",
                    label,
                    response.created.len(),
                    response.updated.len(),
                    response.deleted.len(),
                    take_c,
                    take_u,
                    take_d
                );
                result.all_ok = false;
            }

            for (kind, items) in [
                ("create", &response.created),
                ("update", &response.updated),
                ("delete", &response.deleted),
            ] {
                for item in items.iter().filter(|i| !i.is_ok()) {
                    error!(
                        "{} {} failed for {} (id {}): {}",
                        label,
                        kind,
                        item.natural_key
                            .as_ref()
                            .map(|k| k.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        item.id.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string()),
                        item.error.as_deref().unwrap_or_default()
                    );
                    result.all_ok = false;
                }
            }

            result.created.extend(response.created);
            result.updated.extend(response.updated);
            result.deleted.extend(response.deleted);
            c += take_c;
            u += take_u;
            d += take_d;

            let more = c < creations.len() || u < updates.len() || d < deletions.len();
            if more && !self.config.pause.is_zero() {
                sleep(self.config.pause).await;
            }
        }

        info!(
            "{}: {}/{} created, {}/{} updated, {}/{} deleted in {} batches",
            self.api.name(),
            Reconciliation::succeeded(&result.created),
            creations.len(),
            Reconciliation::succeeded(&result.updated),
            updates.len(),
            Reconciliation::succeeded(&result.deleted),
            deletions.len(),
            result.batches
        );
        result
    }
}
