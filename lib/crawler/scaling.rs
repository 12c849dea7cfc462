use super::types::{CycleConfig, WorkerBounds, RETRY_DELAY_MS};
use crate::metrics_provider::MetricsSnapshot;

const PROBE_BURST_404: f64 = 0.50;
const PROBE_BURST_PERIOD: i64 = 2_500;
const PROBE_BURST_WORKERS: i64 = 25;

const CATCH_UP_404: f64 = 0.001;
const CATCH_UP_LAG_SECONDS: f64 = 600.0;
const MIN_EFFECTIVE_LAG_SECONDS: f64 = 20.0;
const CATCH_UP_PERIOD_EXPONENT: f64 = 0.824;
const CATCH_UP_MIN_PERIOD: i64 = 10_000;

/// Not-found fraction the steady-state controller steers toward.
pub const TARGET_404: f64 = 0.025;
const DECAY_EXPONENT: f64 = 0.88;
const MAX_DECAY: f64 = 0.65;
const SHORT_PERIOD_404: f64 = 0.075;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Mostly not-found: probably ahead of the head, so take small quick batches.
    ProbeBurst,
    /// Nothing missing or far behind: grow aggressively.
    CatchUp,
    /// Proportional decay toward [`TARGET_404`].
    SteadyState,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::ProbeBurst => "probe_burst",
            Regime::CatchUp => "catch_up",
            Regime::SteadyState => "steady_state",
        }
    }
}

pub fn select_regime(snapshot: &MetricsSnapshot) -> Regime {
    if snapshot.fraction_404 > PROBE_BURST_404 {
        Regime::ProbeBurst
    } else if snapshot.fraction_404 < CATCH_UP_404
        || snapshot.p20_lag_seconds >= CATCH_UP_LAG_SECONDS
    {
        Regime::CatchUp
    } else {
        Regime::SteadyState
    }
}

/// Computes the next cycle from the current one and the latest metrics.
pub fn next_cycle_config(
    current: CycleConfig,
    snapshot: &MetricsSnapshot,
    bounds: WorkerBounds,
) -> (CycleConfig, Regime) {
    let regime = select_regime(snapshot);
    let workers = current.worker_count as f64;

    let (next_workers, next_period) = match regime {
        Regime::ProbeBurst => (PROBE_BURST_WORKERS, PROBE_BURST_PERIOD),
        Regime::CatchUp => {
            let effective_workers = current.worker_count.max(bounds.min) as f64;
            let effective_lag = snapshot.p20_lag_seconds.max(MIN_EFFECTIVE_LAG_SECONDS);

            let backlog = effective_workers * (effective_lag.ceil() - MIN_EFFECTIVE_LAG_SECONDS);
            let period = (backlog.powf(CATCH_UP_PERIOD_EXPONENT).round() as i64)
                .max(CATCH_UP_MIN_PERIOD);
            let next =
                (workers * (1.0 + (effective_lag - MIN_EFFECTIVE_LAG_SECONDS) / 100.0)).ceil();
            (next as i64, period)
        }
        Regime::SteadyState => {
            let adjustment = snapshot.fraction_404 - TARGET_404;
            let decrease = ((adjustment.abs() * RETRY_DELAY_MS as f64 / 8.0).powf(DECAY_EXPONENT)
                / 100.0)
                .min(MAX_DECAY);
            let direction = if adjustment > 0.0 {
                1.0
            } else if adjustment < 0.0 {
                -1.0
            } else {
                0.0
            };
            let next = (workers - direction * decrease * workers).round() as i64;

            let period = if snapshot.pgcr_rate == 0.0 {
                600 * next
            } else if snapshot.fraction_404 >= SHORT_PERIOD_404 {
                (100.0 * snapshot.pgcr_rate).round() as i64
            } else {
                (300.0 * snapshot.pgcr_rate).round() as i64
            };
            (next, period)
        }
    };

    let config = CycleConfig {
        worker_count: bounds.clamp(next_workers),
        period_length: next_period.max(1),
    };
    (config, regime)
}
