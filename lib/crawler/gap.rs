use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::pause;
use super::dispatch::Crawler;
use super::search::search_block_start;
use crate::alerting::Alert;
use crate::db::LatestInstanceLookup;
use crate::metrics_provider::{MetricsProvider, MAX_WINDOW_MINUTES};

/// Thresholds and sizes for gap detection and recovery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapSettings {
    pub min_count_404: f64,
    pub min_fraction_404: f64,
    pub supercharge_workers: usize,
    pub supercharge_period: i64,
    /// Post-supercharge not-found fraction above which the cursor is in a hole.
    pub hole_fraction_404: f64,
    pub search_span: i64,
    /// Distance behind the latest stored id to restart from when the search fails.
    pub runaway_rewind: i64,
}

impl Default for GapSettings {
    fn default() -> Self {
        Self {
            min_count_404: 50.0,
            min_fraction_404: 0.80,
            supercharge_workers: 500,
            supercharge_period: 10_000,
            hole_fraction_404: 0.99,
            search_span: 5_000_000,
            runaway_rewind: 10_000,
        }
    }
}

/// What one gap check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapAction {
    MetricsUnavailable,
    Quiet,
    /// Supercharged and the spike cleared (or could not be re-measured).
    Supercharged,
    Skipped { from: i64, to: i64 },
    Rebased { from: i64, to: i64 },
    /// The search and the latest-id lookup both failed; the cursor is untouched.
    Unrecovered,
}

pub struct GapDetector {
    crawler: Crawler,
    metrics: MetricsProvider,
    lookup: Arc<dyn LatestInstanceLookup>,
    settings: GapSettings,
    shutdown: CancellationToken,
}

impl GapDetector {
    pub fn new(
        crawler: Crawler,
        metrics: MetricsProvider,
        lookup: Arc<dyn LatestInstanceLookup>,
        settings: GapSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            crawler,
            metrics,
            lookup,
            settings,
            shutdown,
        }
    }

    pub async fn run(self) {
        let interval = self.crawler.context().timings.gap_check_interval;
        // A started check runs to completion so a supercharge batch is never abandoned.
        while !self.shutdown.is_cancelled() {
            let action = self.check_once().await;
            tracing::debug!(event = "gap_check", ?action);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = pause(interval) => {}
            }
        }
        tracing::info!(event = "gap_detector_stopped", "gap detector stopped");
    }

    pub async fn check_once(&self) -> GapAction {
        let snapshot = match self.metrics.snapshot(MAX_WINDOW_MINUTES).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    event = "gap_metrics_failed",
                    error = %err,
                    "skipping gap check"
                );
                return GapAction::MetricsUnavailable;
            }
        };

        if !(snapshot.count_404 > self.settings.min_count_404
            && snapshot.fraction_404 > self.settings.min_fraction_404)
        {
            return GapAction::Quiet;
        }

        let alerts = &self.crawler.context().alerts;
        alerts
            .notify(Alert::High404Rate {
                fraction_404: snapshot.fraction_404,
                count_404: snapshot.count_404,
            })
            .await;

        let started_at = Instant::now();
        self.crawler
            .dispatch(
                self.settings.supercharge_workers,
                self.settings.supercharge_period,
            )
            .await;
        let elapsed = started_at.elapsed();

        let after = match self.metrics.snapshot_for_elapsed(elapsed).await {
            Ok(after) => after,
            Err(err) => {
                tracing::warn!(
                    event = "gap_metrics_failed",
                    error = %err,
                    "cannot re-measure after supercharge"
                );
                return GapAction::Supercharged;
            }
        };
        alerts
            .notify(Alert::SuperchargeExit {
                fraction_404: after.fraction_404,
                elapsed,
            })
            .await;

        if after.fraction_404 > self.settings.hole_fraction_404 {
            self.repair().await
        } else {
            GapAction::Supercharged
        }
    }

    /// Moves the cursor past a hole, or back behind the latest stored id.
    async fn repair(&self) -> GapAction {
        let ctx = self.crawler.context();
        let cursor = self.crawler.cursor();
        let from = cursor.load();
        let max = from.saturating_add(self.settings.search_span);

        match search_block_start(ctx.classifier.as_ref(), from, max, &ctx.timings).await {
            Ok(found) => {
                if let Err(err) = ctx.ledger.record_missed_range(from, found).await {
                    tracing::error!(
                        event = "missed_ledger_write_failed",
                        from,
                        to = found,
                        error = %err,
                        "failed to record skipped gap"
                    );
                }
                ctx.alerts.notify(Alert::GapSkip { from, to: found }).await;
                cursor.rebase(found);
                GapAction::Skipped { from, to: found }
            }
            Err(search_err) => {
                tracing::warn!(
                    event = "gap_search_failed",
                    from,
                    max,
                    error = %search_err,
                    "falling back to latest stored instance"
                );
                match self.lookup.latest_instance().await {
                    Ok(latest) => {
                        let to = latest.instance_id - self.settings.runaway_rewind;
                        ctx.alerts.notify(Alert::RunawayRecovery { from, to }).await;
                        cursor.rebase(to);
                        GapAction::Rebased { from, to }
                    }
                    Err(err) => {
                        tracing::error!(
                            event = "runaway_recovery_failed",
                            from,
                            error = %err,
                            "latest instance lookup failed, leaving cursor in place"
                        );
                        GapAction::Unrecovered
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use tokio_util::sync::CancellationToken;

    use super::{GapAction, GapDetector, GapSettings};
    use crate::classifier::{Outcome, OutcomeClassifier};
    use crate::crawler::cursor::Cursor;
    use crate::crawler::dispatch::Crawler;
    use crate::crawler::offload::OffloadHandle;
    use crate::crawler::test_support::{
        metrics_snapshot, success, FixedLatest, Harness, ScriptedClassifier, ScriptedMetrics,
    };
    use crate::crawler::types::CrawlTimings;
    use crate::crawler::CrawlContext;
    use crate::metrics_provider::MetricsProvider;

    fn small_settings() -> GapSettings {
        GapSettings {
            supercharge_workers: 4,
            supercharge_period: 20,
            search_span: 10_000,
            runaway_rewind: 500,
            ..GapSettings::default()
        }
    }

    fn detector(
        harness: &Harness,
        cursor: Arc<Cursor>,
        metrics: ScriptedMetrics,
        latest: i64,
    ) -> GapDetector {
        detector_with(
            harness.context(),
            cursor,
            metrics,
            latest,
            CancellationToken::new(),
        )
    }

    fn detector_with(
        ctx: Arc<CrawlContext>,
        cursor: Arc<Cursor>,
        metrics: ScriptedMetrics,
        latest: i64,
        shutdown: CancellationToken,
    ) -> GapDetector {
        let (offload, queued) = OffloadHandle::detached(1_000);
        // Offloaded ids are not under test here.
        std::mem::forget(queued);
        GapDetector::new(
            Crawler::new(ctx, offload, cursor),
            MetricsProvider::new(Arc::new(metrics)),
            Arc::new(FixedLatest(latest)),
            small_settings(),
            shutdown,
        )
    }

    /// Every id resolves, but only after `delay`.
    struct SlowUpstream {
        delay: Duration,
    }

    impl OutcomeClassifier for SlowUpstream {
        fn fetch<'a>(&'a self, instance_id: i64, _malformed_retry: u32) -> BoxFuture<'a, Outcome> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                success(instance_id)
            })
        }
    }

    /// Everything below `boundary` is missing.
    fn hole_until(boundary: i64) -> ScriptedClassifier {
        ScriptedClassifier::with_fallback(
            (0..boundary)
                .map(|id| (id, vec![Outcome::NotFound; 64]))
                .collect(),
            success(0),
        )
    }

    #[tokio::test]
    async fn quiet_when_404s_are_low() {
        let harness = Harness::new(ScriptedClassifier::with_plan(vec![]));
        let cursor = Arc::new(Cursor::new(100, 0));
        let gap = detector(
            &harness,
            cursor.clone(),
            ScriptedMetrics::sequence(vec![metrics_snapshot(0.9, 20.0)]),
            0,
        );

        assert_eq!(gap.check_once().await, GapAction::Quiet);
        assert_eq!(cursor.load(), 100);
        assert!(harness.alerts.kinds().is_empty());
    }

    #[tokio::test]
    async fn metrics_failure_skips_the_check() {
        let harness = Harness::new(ScriptedClassifier::with_plan(vec![]));
        let gap = detector(
            &harness,
            Arc::new(Cursor::new(0, 0)),
            ScriptedMetrics::unavailable(),
            0,
        );

        assert_eq!(gap.check_once().await, GapAction::MetricsUnavailable);
    }

    #[tokio::test]
    async fn supercharge_that_clears_the_spike_leaves_cursor_advanced() {
        let harness = Harness::new(ScriptedClassifier::with_fallback(vec![], success(0)));
        let cursor = Arc::new(Cursor::new(1_000, 0));
        let gap = detector(
            &harness,
            cursor.clone(),
            ScriptedMetrics::sequence(vec![metrics_snapshot(0.95, 120.0), metrics_snapshot(0.2, 10.0)]),
            0,
        );

        assert_eq!(gap.check_once().await, GapAction::Supercharged);
        assert_eq!(cursor.load(), 1_020);
        assert_eq!(
            harness.alerts.kinds(),
            vec!["high_404_rate", "workers_starting", "supercharge_exit"]
        );
    }

    #[tokio::test]
    async fn persistent_hole_skips_to_first_valid_id() {
        let boundary = 1_337;
        let harness = Harness::new(hole_until(boundary));
        let cursor = Arc::new(Cursor::new(0, 0));
        let gap = detector(
            &harness,
            cursor.clone(),
            ScriptedMetrics::sequence(vec![metrics_snapshot(0.95, 120.0), metrics_snapshot(1.0, 400.0)]),
            0,
        );

        let action = gap.check_once().await;

        assert_eq!(action, GapAction::Skipped { from: 20, to: boundary });
        assert_eq!(cursor.load(), boundary);
        assert!(harness.ledger.ranges().contains(&(20, boundary)));
        assert!(harness.alerts.kinds().contains(&"gap_skip"));
    }

    #[tokio::test]
    async fn failed_search_rebases_behind_latest_stored_id() {
        let harness = Harness::new(ScriptedClassifier::with_plan(vec![]));
        let cursor = Arc::new(Cursor::new(50_000, 0));
        let gap = detector(
            &harness,
            cursor.clone(),
            ScriptedMetrics::sequence(vec![metrics_snapshot(0.95, 120.0), metrics_snapshot(1.0, 400.0)]),
            42_000,
        );

        let action = gap.check_once().await;

        assert_eq!(
            action,
            GapAction::Rebased {
                from: 50_020,
                to: 41_500
            }
        );
        assert_eq!(cursor.load(), 41_500);
        assert_eq!(harness.alerts.kinds().last(), Some(&"runaway_recovery"));
    }

    #[tokio::test]
    async fn shutdown_during_supercharge_lets_the_batch_finish() {
        let harness = Harness::new(ScriptedClassifier::with_plan(vec![]));
        let ctx = Arc::new(CrawlContext {
            classifier: Arc::new(SlowUpstream {
                delay: Duration::from_millis(20),
            }),
            publisher: harness.publisher.clone(),
            blocked: harness.blocked.clone(),
            ledger: harness.ledger.clone(),
            alerts: harness.alerts.clone(),
            timings: CrawlTimings {
                gap_check_interval: Duration::from_secs(1),
                ..CrawlTimings::immediate()
            },
        });
        let cursor = Arc::new(Cursor::new(1_000, 0));
        let shutdown = CancellationToken::new();
        let gap = detector_with(
            ctx,
            cursor.clone(),
            ScriptedMetrics::sequence(vec![metrics_snapshot(0.95, 120.0), metrics_snapshot(0.2, 10.0)]),
            0,
            shutdown.clone(),
        );

        let handle = tokio::spawn(gap.run());
        // Each of the 4 workers needs about 100ms for its 5 ids.
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("gap detector should stop after the batch")
            .expect("gap detector task should not panic");

        assert_eq!(cursor.load(), 1_020);
        let mut published = harness.publisher.published();
        published.sort_unstable();
        assert_eq!(published, (1_001..=1_020).collect::<Vec<_>>());
        assert!(harness.ledger.missed_ids().is_empty());
        assert!(harness.alerts.kinds().contains(&"supercharge_exit"));
    }
}
