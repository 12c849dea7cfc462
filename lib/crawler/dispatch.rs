use std::sync::Arc;
use std::time::Duration;

use prometheus_client::metrics::gauge::Gauge;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::cursor::Cursor;
use super::offload::OffloadHandle;
use super::worker::{process_instance, Resolution};
use super::CrawlContext;
use crate::alerting::Alert;
use crate::server::monitoring::CRAWL_METRICS;

/// Counts of how each dispatched id ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatched: i64,
    pub published: u64,
    pub non_raid: u64,
    pub blocked: u64,
    pub offloaded: u64,
    pub elapsed: Duration,
}

impl DispatchSummary {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Published => self.published += 1,
            Resolution::NonRaid => self.non_raid += 1,
            Resolution::Blocked => self.blocked += 1,
            Resolution::Offloaded => self.offloaded += 1,
        }
    }

    fn merge(&mut self, other: DispatchSummary) {
        self.published += other.published;
        self.non_raid += other.non_raid;
        self.blocked += other.blocked;
        self.offloaded += other.offloaded;
    }
}

/// The dispatch primitive shared by the cycle controller and the gap detector.
#[derive(Clone)]
pub struct Crawler {
    ctx: Arc<CrawlContext>,
    offload: OffloadHandle,
    cursor: Arc<Cursor>,
}

impl Crawler {
    pub fn new(ctx: Arc<CrawlContext>, offload: OffloadHandle, cursor: Arc<Cursor>) -> Self {
        Self {
            ctx,
            offload,
            cursor,
        }
    }

    pub fn context(&self) -> &Arc<CrawlContext> {
        &self.ctx
    }

    pub fn cursor(&self) -> &Arc<Cursor> {
        &self.cursor
    }

    /// Runs one batch: `workers` tasks drain `period_length` ids taken from the cursor.
    ///
    /// The hand-off channel has no capacity, so each id is only taken from the
    /// cursor once a worker is free to receive it. Returns after every worker exits.
    pub async fn dispatch(&self, workers: usize, period_length: i64) -> DispatchSummary {
        let workers = workers.max(1);
        let started_at = Instant::now();
        self.ctx
            .alerts
            .notify(Alert::WorkersStarting {
                workers,
                period_length,
                cursor: self.cursor.load(),
            })
            .await;

        let (sender, receiver) = flume::bounded::<i64>(0);
        let mut join_set = JoinSet::new();
        for _ in 0..workers {
            let receiver = receiver.clone();
            let ctx = self.ctx.clone();
            let offload = self.offload.clone();
            join_set.spawn(async move {
                let mut tally = DispatchSummary::default();
                while let Ok(instance_id) = receiver.recv_async().await {
                    tally.record(process_instance(&ctx, &offload, instance_id).await);
                }
                tally
            });
        }
        drop(receiver);
        let active = ActiveWorkers::start(
            CRAWL_METRICS.get().map(|metrics| &metrics.active_workers),
            workers as i64,
        );

        let mut summary = DispatchSummary::default();
        for _ in 0..period_length {
            let instance_id = self.cursor.advance();
            if sender.send_async(instance_id).await.is_err() {
                tracing::error!(
                    event = "dispatch_aborted",
                    instance_id,
                    "all workers exited before the batch was dispatched"
                );
                break;
            }
            summary.dispatched += 1;
        }
        drop(sender);

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(tally) => summary.merge(tally),
                Err(err) => tracing::error!(event = "worker_panicked", error = %err),
            }
        }
        drop(active);

        summary.elapsed = started_at.elapsed();
        tracing::info!(
            event = "dispatch_complete",
            workers,
            dispatched = summary.dispatched,
            published = summary.published,
            non_raid = summary.non_raid,
            blocked = summary.blocked,
            offloaded = summary.offloaded,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            cursor = self.cursor.load(),
            "batch drained"
        );
        summary
    }
}

/// Adds a batch's workers to the gauge until dropped. Batches from the
/// controller and the gap detector overlap, so each one only removes its own.
struct ActiveWorkers {
    gauge: Option<Gauge>,
    workers: i64,
}

impl ActiveWorkers {
    fn start(gauge: Option<&Gauge>, workers: i64) -> Self {
        if let Some(gauge) = gauge {
            gauge.inc_by(workers);
        }
        Self {
            gauge: gauge.cloned(),
            workers,
        }
    }
}

impl Drop for ActiveWorkers {
    fn drop(&mut self) {
        if let Some(gauge) = &self.gauge {
            gauge.dec_by(self.workers);
        }
    }
}
