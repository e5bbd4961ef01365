//! Periodic and on-demand triggering of sync cycles.
//!
//! Cycles run one after another on the scheduler task, so two cycles never
//! overlap. A tick that comes due while a cycle is still running is
//! delayed, not queued up.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use catalogsync_common::{Error, Result};

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run a cycle now.
    Now,
    /// Shutdown the scheduler.
    Shutdown,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCycle {
    pub entities: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl SyncCycle {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

type Pending = (SyncRequest, oneshot::Sender<Result<SyncCycle>>);

/// Front end for requesting cycles and stopping the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<Pending>,
}

impl SyncScheduler {
    /// Create a scheduler ticking every `period`. `None` disables ticks;
    /// cycles then only run when requested.
    pub fn new(period: Option<Duration>) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        (
            Self { request_tx },
            SyncSchedulerHandle { period, request_rx },
        )
    }

    /// Run a cycle as soon as the current one, if any, finishes.
    pub async fn request_sync(&self) -> Result<SyncCycle> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((SyncRequest::Now, response_tx))
            .await
            .map_err(|_| Error::Unsupported("scheduler not running".to_string()))?;
        response_rx
            .await
            .map_err(|_| Error::Unsupported("scheduler stopped before answering".to_string()))?
    }

    /// Stop the scheduler after the current cycle.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    period: Option<Duration>,
    request_rx: mpsc::Receiver<Pending>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler until shutdown is requested or every
    /// [`SyncScheduler`] is dropped.
    ///
    /// The first tick fires immediately.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncCycle>> + Send,
    {
        let mut ticker = self.period.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut cycles = 0u64;
        info!("Sync scheduler started (period {:?})", self.period);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Now, response_tx)) => {
                            debug!("Processing requested sync");
                            let result = sync_fn().await;
                            cycles += 1;
                            let _ = response_tx.send(result);
                        }
                        Some((SyncRequest::Shutdown, _)) => {
                            info!("Received shutdown request");
                            break;
                        }
                        None => {
                            debug!("All scheduler front ends dropped");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    let started = Instant::now();
                    cycles += 1;
                    match sync_fn().await {
                        Ok(cycle) if cycle.is_success() => {
                            info!(
                                "Cycle {} completed: {} entities in {:?}",
                                cycles, cycle.entities, started.elapsed()
                            );
                        }
                        Ok(cycle) => {
                            warn!(
                                "Cycle {} completed with {}/{} entities failing",
                                cycles, cycle.failed, cycle.entities
                            );
                        }
                        Err(e) => {
                            error!("Cycle {} failed: {}", cycles, e);
                        }
                    }
                }
            }
        }
        info!("Sync scheduler stopped after {} cycles", cycles);
    }

    async fn wait_for_tick(ticker: &mut Option<tokio::time::Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn cycle() -> SyncCycle {
        SyncCycle {
            entities: 3,
            failed: 0,
            duration: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (scheduler, handle) = SyncScheduler::new(None);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let task = tokio::spawn(async move {
            handle
                .run(move || {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(cycle())
                    }
                })
                .await;
        });

        let result = scheduler.request_sync().await.unwrap();
        assert_eq!(result.entities, 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks() {
        let (scheduler, handle) = SyncScheduler::new(Some(Duration::from_secs(60)));
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let task = tokio::spawn(async move {
            handle
                .run(move || {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(cycle())
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_secs(150)).await;
        // immediate tick plus ticks at 60s and 120s
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_scheduler_reports_error() {
        let (scheduler, handle) = SyncScheduler::new(None);
        drop(handle);
        assert!(scheduler.request_sync().await.is_err());
    }
}
