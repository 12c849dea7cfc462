use tokio_util::sync::CancellationToken;

use super::dispatch::{Crawler, DispatchSummary};
use super::scaling::{next_cycle_config, Regime};
use super::types::{CycleConfig, WorkerBounds, INITIAL_PERIOD_LENGTH};
use crate::alerting::Alert;
use crate::metrics_provider::MetricsProvider;

/// What one cycle dispatched and what it chose next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub dispatched: DispatchSummary,
    /// `None` when metrics were unavailable and the previous config was kept.
    pub regime: Option<Regime>,
    pub next: CycleConfig,
}

/// Runs dispatch cycles and retunes worker count and batch length between them.
pub struct CycleController {
    crawler: Crawler,
    metrics: MetricsProvider,
    bounds: WorkerBounds,
    config: CycleConfig,
    shutdown: CancellationToken,
}

impl CycleController {
    pub fn new(
        crawler: Crawler,
        metrics: MetricsProvider,
        bounds: WorkerBounds,
        initial_workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            crawler,
            metrics,
            bounds,
            config: CycleConfig {
                worker_count: initial_workers,
                period_length: INITIAL_PERIOD_LENGTH,
            },
            shutdown,
        }
    }

    pub fn config(&self) -> CycleConfig {
        self.config
    }

    pub async fn run(mut self) {
        while !self.shutdown.is_cancelled() {
            self.run_cycle().await;
        }
        tracing::info!(
            event = "controller_stopped",
            cursor = self.crawler.cursor().load(),
            "cycle controller stopped"
        );
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.config.worker_count = self.config.worker_count.max(self.bounds.min);
        let CycleConfig {
            worker_count,
            period_length,
        } = self.config;

        let dispatched = self.crawler.dispatch(worker_count, period_length).await;

        let snapshot = match self.metrics.snapshot_for_elapsed(dispatched.elapsed).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    event = "cycle_metrics_failed",
                    error = %err,
                    workers = worker_count,
                    period_length,
                    "keeping previous cycle config"
                );
                return CycleReport {
                    dispatched,
                    regime: None,
                    next: self.config,
                };
            }
        };

        let (next, regime) = next_cycle_config(self.config, &snapshot, self.bounds);
        self.crawler
            .context()
            .alerts
            .notify(Alert::StatusUpdate {
                snapshot,
                workers: next.worker_count,
                period_length: next.period_length,
                cursor: self.crawler.cursor().load(),
                regime: regime.as_str(),
            })
            .await;

        tracing::info!(
            event = "cycle_retuned",
            regime = regime.as_str(),
            from_workers = worker_count,
            to_workers = next.worker_count,
            from_period = period_length,
            to_period = next.period_length,
            fraction_404 = snapshot.fraction_404,
            p20_lag_seconds = snapshot.p20_lag_seconds,
            pgcr_rate = snapshot.pgcr_rate,
        );
        self.config = next;

        CycleReport {
            dispatched,
            regime: Some(regime),
            next,
        }
    }
}
