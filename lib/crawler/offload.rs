use std::sync::Arc;

use flume::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::{pause, retry_backoff};
use super::types::OffloadSettings;
use super::CrawlContext;
use crate::alerting::Alert;
use crate::classifier::Outcome;
use crate::server::monitoring::CRAWL_METRICS;

/// An id handed over by a primary worker.
#[derive(Debug, Clone, Copy)]
pub struct OffloadEntry {
    pub instance_id: i64,
    pub started_at: Instant,
    pub offloaded_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadResolution {
    Published,
    NonRaid,
    Blocked,
    Missed,
}

/// Cheap handle primary workers use to enqueue ids for the offload pool.
#[derive(Clone)]
pub struct OffloadHandle {
    sender: flume::Sender<OffloadEntry>,
}

impl OffloadHandle {
    /// Queues an id without waiting. Returns `false` when it was shed.
    ///
    /// Shed ids are already in the missed ledger, so dropping them loses no record.
    pub fn offload(&self, instance_id: i64, started_at: Instant) -> bool {
        let entry = OffloadEntry {
            instance_id,
            started_at,
            offloaded_at: Instant::now(),
        };
        match self.sender.try_send(entry) {
            Ok(()) => {
                if let Some(metrics) = CRAWL_METRICS.get() {
                    metrics.offload_queue_depth.inc();
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                if let Some(metrics) = CRAWL_METRICS.get() {
                    metrics.offload_shed_total.inc();
                }
                tracing::warn!(
                    event = "offload_shed",
                    instance_id,
                    "offload queue full, leaving instance in missed ledger"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!(
                    event = "offload_closed",
                    instance_id,
                    "offload pool stopped, leaving instance in missed ledger"
                );
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// A handle whose queue is read directly instead of by offload workers.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, flume::Receiver<OffloadEntry>) {
        let (sender, receiver) = flume::bounded(capacity);
        (Self { sender }, receiver)
    }
}

/// Running offload workers.
pub struct OffloadPool {
    handles: Vec<JoinHandle<()>>,
}

impl OffloadPool {
    /// Waits for every worker to stop. Workers stop when the shutdown token
    /// fires or every [`OffloadHandle`] is dropped and the queue drains.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(event = "offload_worker_panicked", error = %err);
            }
        }
    }
}

pub fn spawn_offload_pool(
    ctx: Arc<CrawlContext>,
    settings: OffloadSettings,
    shutdown: CancellationToken,
) -> (OffloadHandle, OffloadPool) {
    let (sender, receiver) = flume::bounded(settings.queue_capacity.max(1));

    let handles = (0..settings.workers.max(1))
        .map(|_| {
            let ctx = ctx.clone();
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let entry = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = receiver.recv_async() => match received {
                            Ok(entry) => entry,
                            Err(_) => break,
                        },
                    };
                    if let Some(metrics) = CRAWL_METRICS.get() {
                        metrics.offload_queue_depth.dec();
                    }
                    retry_offloaded(&ctx, &settings, entry).await;
                }
            })
        })
        .collect();

    (OffloadHandle { sender }, OffloadPool { handles })
}

/// Slow retry schedule for one offloaded id.
pub async fn retry_offloaded(
    ctx: &CrawlContext,
    settings: &OffloadSettings,
    entry: OffloadEntry,
) -> OffloadResolution {
    let instance_id = entry.instance_id;
    if !ctx.timings.offload_grace.is_zero() {
        tokio::time::sleep_until(entry.offloaded_at + ctx.timings.offload_grace).await;
    }

    let mut attempt = 0u32;
    while attempt < settings.max_attempts {
        let attempts_label = -(i64::from(attempt) + 1);
        let outcome = ctx.fetch(instance_id, attempts_label).await;

        match &outcome {
            Outcome::Success(report) => match ctx.publisher.publish(report).await {
                Ok(()) => {
                    ctx.observe_report_lag(&outcome, attempts_label, report);
                    tracing::info!(
                        event = "offload_resolved",
                        instance_id,
                        attempts = attempt + 1,
                        elapsed_secs = entry.started_at.elapsed().as_secs(),
                        "offloaded instance published"
                    );
                    return OffloadResolution::Published;
                }
                Err(err) => tracing::warn!(
                    event = "publish_failed",
                    instance_id,
                    error = %err,
                    "failed to publish offloaded report"
                ),
            },
            Outcome::NonRaid(_) => return OffloadResolution::NonRaid,
            Outcome::SystemDisabled => {
                pause(ctx.timings.offload_system_disabled_delay).await;
                continue;
            }
            Outcome::InsufficientPrivileges => {
                ctx.push_blocked(instance_id).await;
                return OffloadResolution::Blocked;
            }
            Outcome::NotFound
            | Outcome::BadFormat(_)
            | Outcome::ExternalError
            | Outcome::RateLimited => {}
        }

        attempt += 1;
        if attempt == settings.warn_at_attempt {
            ctx.alert_in_background(Alert::UnresolvedWarning {
                instance_id,
                elapsed: entry.started_at.elapsed(),
            });
        }
        if attempt < settings.max_attempts {
            pause(retry_backoff(ctx.timings.retry_delay, attempt)).await;
        }
    }

    ctx.record_missed(instance_id).await;
    ctx.alert_in_background(Alert::Unresolved {
        instance_id,
        elapsed: entry.started_at.elapsed(),
    });
    OffloadResolution::Missed
}
