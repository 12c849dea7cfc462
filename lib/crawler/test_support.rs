use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;

use super::types::CrawlTimings;
use super::CrawlContext;
use crate::alerting::{Alert, AlertSink};
use crate::classifier::{ActivityReport, Outcome, OutcomeClassifier, RAID_MODE};
use crate::db::{LatestInstance, LatestInstanceLookup, LookupError};
use crate::ledger::{LedgerError, MissedLedger};
use crate::metrics_provider::{MetricsError, MetricsSnapshot, MetricsSource};
use crate::queue::{BlockedQueue, Publisher, QueueError};

pub(crate) fn sample_report(instance_id: i64) -> ActivityReport {
    let completed_at = Utc::now() - ChronoDuration::seconds(30);
    ActivityReport {
        instance_id,
        mode: RAID_MODE,
        started_at: completed_at - ChronoDuration::minutes(20),
        completed_at,
        raw: serde_json::json!({ "activityDetails": { "mode": RAID_MODE } }),
    }
}

pub(crate) fn success(instance_id: i64) -> Outcome {
    Outcome::Success(sample_report(instance_id))
}

/// Serves scripted outcomes per id, then `fallback` once a script runs out.
pub(crate) struct ScriptedClassifier {
    plans: Mutex<HashMap<i64, VecDeque<Outcome>>>,
    call_counts: Mutex<HashMap<i64, u32>>,
    fallback: Outcome,
}

impl ScriptedClassifier {
    pub(crate) fn with_plan(plan: Vec<(i64, Vec<Outcome>)>) -> Self {
        Self::with_fallback(plan, Outcome::NotFound)
    }

    pub(crate) fn with_fallback(plan: Vec<(i64, Vec<Outcome>)>, fallback: Outcome) -> Self {
        let plans = plan
            .into_iter()
            .map(|(id, outcomes)| (id, outcomes.into_iter().collect()))
            .collect();
        Self {
            plans: Mutex::new(plans),
            call_counts: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    pub(crate) fn calls_for(&self, instance_id: i64) -> u32 {
        *self
            .call_counts
            .lock()
            .expect("call_count mutex poisoned")
            .get(&instance_id)
            .unwrap_or(&0)
    }

    pub(crate) fn total_calls(&self) -> u32 {
        self.call_counts
            .lock()
            .expect("call_count mutex poisoned")
            .values()
            .sum()
    }
}

impl OutcomeClassifier for ScriptedClassifier {
    fn fetch<'a>(&'a self, instance_id: i64, _malformed_retry: u32) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            *self
                .call_counts
                .lock()
                .expect("call_count mutex poisoned")
                .entry(instance_id)
                .or_insert(0) += 1;

            let mut plans = self.plans.lock().expect("plans mutex poisoned");
            match plans.get_mut(&instance_id).and_then(VecDeque::pop_front) {
                Some(outcome) => outcome,
                None if matches!(self.fallback, Outcome::Success(_)) => success(instance_id),
                None => self.fallback.clone(),
            }
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingPublisher {
    failures_remaining: Mutex<u32>,
    published: Mutex<Vec<i64>>,
}

impl RecordingPublisher {
    pub(crate) fn failing(times: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(times),
            published: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn published(&self) -> Vec<i64> {
        self.published.lock().expect("published mutex poisoned").clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish<'a>(&'a self, report: &'a ActivityReport) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let mut remaining = self.failures_remaining.lock().expect("failures mutex poisoned");
            if *remaining > 0 {
                *remaining -= 1;
                return Err(QueueError::Config("scripted publish failure".to_string()));
            }
            self.published
                .lock()
                .expect("published mutex poisoned")
                .push(report.instance_id);
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingBlockedQueue {
    ids: Mutex<Vec<i64>>,
}

impl RecordingBlockedQueue {
    pub(crate) fn ids(&self) -> Vec<i64> {
        self.ids.lock().expect("blocked mutex poisoned").clone()
    }
}

impl BlockedQueue for RecordingBlockedQueue {
    fn push_blocked<'a>(&'a self, instance_id: i64) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            self.ids.lock().expect("blocked mutex poisoned").push(instance_id);
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingLedger {
    ranges: Mutex<Vec<(i64, i64)>>,
}

impl RecordingLedger {
    pub(crate) fn missed_ids(&self) -> Vec<i64> {
        self.ranges
            .lock()
            .expect("ledger mutex poisoned")
            .iter()
            .flat_map(|(start, end)| *start..*end)
            .collect()
    }

    pub(crate) fn ranges(&self) -> Vec<(i64, i64)> {
        self.ranges.lock().expect("ledger mutex poisoned").clone()
    }
}

impl MissedLedger for RecordingLedger {
    fn record_missed_range<'a>(
        &'a self,
        start: i64,
        end: i64,
    ) -> BoxFuture<'a, Result<(), LedgerError>> {
        Box::pin(async move {
            self.ranges
                .lock()
                .expect("ledger mutex poisoned")
                .push((start, end));
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub(crate) fn kinds(&self) -> Vec<&'static str> {
        self.alerts
            .lock()
            .expect("alerts mutex poisoned")
            .iter()
            .map(Alert::kind)
            .collect()
    }

    pub(crate) fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().expect("alerts mutex poisoned").clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn notify<'a>(&'a self, alert: Alert) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.alerts.lock().expect("alerts mutex poisoned").push(alert);
        })
    }
}

/// Answers snapshot queries from a queue of snapshots; the last one repeats.
pub(crate) struct ScriptedMetrics {
    snapshots: Mutex<VecDeque<MetricsSnapshot>>,
    current: Mutex<Option<MetricsSnapshot>>,
}

impl ScriptedMetrics {
    pub(crate) fn sequence(snapshots: Vec<MetricsSnapshot>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots.into_iter().collect()),
            current: Mutex::new(None),
        }
    }

    /// A source with no snapshots fails every query.
    pub(crate) fn unavailable() -> Self {
        Self::sequence(Vec::new())
    }
}

impl MetricsSource for ScriptedMetrics {
    fn query_range<'a>(
        &'a self,
        query: &'a str,
        _window_minutes: u32,
    ) -> BoxFuture<'a, Result<Vec<f64>, MetricsError>> {
        Box::pin(async move {
            let mut current = self.current.lock().expect("current mutex poisoned");
            // Every snapshot starts with the lag query.
            if query.starts_with("histogram_quantile") {
                let mut snapshots = self.snapshots.lock().expect("snapshots mutex poisoned");
                if let Some(next) = snapshots.pop_front() {
                    *current = Some(next);
                }
            }
            let snapshot = current.ok_or_else(|| MetricsError::Query("no data".to_string()))?;

            let value = if query.starts_with("histogram_quantile") {
                snapshot.p20_lag_seconds
            } else if query.ends_with("* 60") {
                snapshot.count_404
            } else if query.contains("6|7|8|9|10") {
                snapshot.fraction_error
            } else if query.contains("1|2") {
                snapshot.pgcr_rate
            } else {
                snapshot.fraction_404
            };
            Ok(vec![value])
        })
    }
}

pub(crate) fn metrics_snapshot(fraction_404: f64, count_404: f64) -> MetricsSnapshot {
    MetricsSnapshot {
        p20_lag_seconds: 45.0,
        fraction_404,
        fraction_error: 0.0,
        pgcr_rate: 10.0,
        count_404,
    }
}

pub(crate) struct FixedLatest(pub(crate) i64);

impl LatestInstanceLookup for FixedLatest {
    fn latest_instance<'a>(&'a self) -> BoxFuture<'a, Result<LatestInstance, LookupError>> {
        Box::pin(async move {
            Ok(LatestInstance {
                instance_id: self.0,
                completed_at: Utc::now(),
            })
        })
    }
}

/// Recording collaborators plus a context wired to them with zero delays.
pub(crate) struct Harness {
    pub(crate) classifier: Arc<ScriptedClassifier>,
    pub(crate) publisher: Arc<RecordingPublisher>,
    pub(crate) blocked: Arc<RecordingBlockedQueue>,
    pub(crate) ledger: Arc<RecordingLedger>,
    pub(crate) alerts: Arc<RecordingAlerts>,
}

impl Harness {
    pub(crate) fn new(classifier: ScriptedClassifier) -> Self {
        Self::with_publisher(classifier, RecordingPublisher::default())
    }

    pub(crate) fn with_publisher(
        classifier: ScriptedClassifier,
        publisher: RecordingPublisher,
    ) -> Self {
        Self {
            classifier: Arc::new(classifier),
            publisher: Arc::new(publisher),
            blocked: Arc::new(RecordingBlockedQueue::default()),
            ledger: Arc::new(RecordingLedger::default()),
            alerts: Arc::new(RecordingAlerts::default()),
        }
    }

    pub(crate) fn context(&self) -> Arc<CrawlContext> {
        Arc::new(CrawlContext {
            classifier: self.classifier.clone(),
            publisher: self.publisher.clone(),
            blocked: self.blocked.clone(),
            ledger: self.ledger.clone(),
            alerts: self.alerts.clone(),
            timings: CrawlTimings::immediate(),
        })
    }
}
