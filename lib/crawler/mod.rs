//! Adaptive crawl over the instance id space.
//!
//! The [`controller`] runs dispatch cycles and retunes them from metrics; the
//! [`gap`] detector watches for holes in the id space and repairs the shared
//! [`Cursor`]. Ids that exhaust their primary retries move to the [`offload`] pool.

pub mod backoff;
pub mod controller;
pub mod cursor;
pub mod dispatch;
pub mod gap;
pub mod offload;
pub mod scaling;
pub mod search;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use chrono::Utc;

use crate::alerting::{Alert, AlertSink};
use crate::classifier::{ActivityReport, Outcome, OutcomeClassifier};
use crate::ledger::MissedLedger;
use crate::queue::{BlockedQueue, Publisher};
use crate::server::monitoring::CRAWL_METRICS;

pub use controller::{CycleController, CycleReport};
pub use cursor::Cursor;
pub use dispatch::{Crawler, DispatchSummary};
pub use gap::{GapAction, GapDetector, GapSettings};
pub use offload::{spawn_offload_pool, OffloadHandle, OffloadPool};
pub use types::{CrawlTimings, CycleConfig, OffloadSettings, WorkerBounds};

/// Collaborators shared by every worker, offload task and the gap search.
pub struct CrawlContext {
    pub classifier: Arc<dyn OutcomeClassifier>,
    pub publisher: Arc<dyn Publisher>,
    pub blocked: Arc<dyn BlockedQueue>,
    pub ledger: Arc<dyn MissedLedger>,
    pub alerts: Arc<dyn AlertSink>,
    pub timings: CrawlTimings,
}

impl CrawlContext {
    /// Fetches once and counts the outcome under the given attempt label.
    pub(crate) async fn fetch(&self, instance_id: i64, attempts_label: i64) -> Outcome {
        let outcome = self.classifier.fetch(instance_id, 0).await;
        if let Some(metrics) = CRAWL_METRICS.get() {
            metrics.record_fetch(&outcome, attempts_label);
        }
        tracing::trace!(
            event = "fetched",
            instance_id,
            attempt = attempts_label,
            outcome = outcome.name()
        );
        outcome
    }

    pub(crate) fn observe_lag(&self, outcome: &Outcome, attempts_label: i64, lag_seconds: f64) {
        if let Some(metrics) = CRAWL_METRICS.get() {
            metrics.observe_lag(outcome, attempts_label, lag_seconds);
        }
    }

    /// Records completion lag for a resolved report, skipping clock-skewed ones.
    pub(crate) fn observe_report_lag(
        &self,
        outcome: &Outcome,
        attempts_label: i64,
        report: &ActivityReport,
    ) {
        if let Some(lag_seconds) = report.observable_lag(Utc::now()) {
            self.observe_lag(outcome, attempts_label, lag_seconds);
        }
    }

    pub(crate) async fn record_missed(&self, instance_id: i64) {
        if let Some(metrics) = CRAWL_METRICS.get() {
            metrics.missed_total.inc();
        }
        if let Err(err) = self.ledger.record_missed(instance_id).await {
            tracing::error!(
                event = "missed_ledger_write_failed",
                instance_id,
                error = %err,
                "failed to record missed instance"
            );
        }
    }

    pub(crate) async fn push_blocked(&self, instance_id: i64) {
        if let Err(err) = self.blocked.push_blocked(instance_id).await {
            tracing::error!(
                event = "blocked_queue_push_failed",
                instance_id,
                error = %err,
                "failed to queue blocked instance"
            );
        }
    }

    /// Sends an alert without waiting for delivery.
    pub(crate) fn alert_in_background(&self, alert: Alert) {
        let alerts = self.alerts.clone();
        tokio::spawn(async move { alerts.notify(alert).await });
    }
}
