pub mod prometheus;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

pub use prometheus::PrometheusClient;

/// Longest trailing window any snapshot looks at.
pub const MAX_WINDOW_MINUTES: u32 = 4;
/// Tail-lag assumed when the lag histogram has no samples.
pub const NO_DATA_LAG_SECONDS: f64 = 900.0;

/// Zero-width range: only the most recent evaluation.
const LATEST_POINT: u32 = 0;

const STATUS_METRIC: &str = "pgcr_crawl_summary_status_total";
const LAG_BUCKET_METRIC: &str = "pgcr_crawl_summary_lag_bucket";

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("metrics backend returned status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("metrics query was rejected: {0}")]
    Query(String),

    #[error("unparseable sample value {0:?}")]
    BadSample(String),
}

/// Range-query access to the metrics backend.
///
/// Returns the samples of the first series, oldest first, at one-minute
/// resolution. A `window_minutes` of 0 asks for the latest point only. An empty
/// vector means the query matched no series.
pub trait MetricsSource: Send + Sync {
    fn query_range<'a>(
        &'a self,
        query: &'a str,
        window_minutes: u32,
    ) -> BoxFuture<'a, Result<Vec<f64>, MetricsError>>;
}

impl<T> MetricsSource for Arc<T>
where
    T: MetricsSource + ?Sized,
{
    fn query_range<'a>(
        &'a self,
        query: &'a str,
        window_minutes: u32,
    ) -> BoxFuture<'a, Result<Vec<f64>, MetricsError>> {
        (**self).query_range(query, window_minutes)
    }
}

/// Feedback signals for one controller decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub p20_lag_seconds: f64,
    pub fraction_404: f64,
    pub fraction_error: f64,
    /// Resolved reports per second.
    pub pgcr_rate: f64,
    /// Not-found outcomes over the window.
    pub count_404: f64,
}

/// Averages samples with weight `index + 1`, so newer samples count more.
///
/// NaN samples are skipped. Returns `None` when nothing usable remains.
pub fn weighted_average(samples: &[f64]) -> Option<f64> {
    let (sum, weight) = samples
        .iter()
        .enumerate()
        .filter(|(_, value)| !value.is_nan())
        .fold((0.0, 0.0), |(sum, weight), (idx, value)| {
            let w = (idx + 1) as f64;
            (sum + value * w, weight + w)
        });

    (weight > 0.0).then(|| sum / weight)
}

/// Window for a snapshot taken after `elapsed`: whole minutes, between 1 and 4.
pub fn window_for_elapsed(elapsed: Duration) -> u32 {
    let minutes = elapsed.as_secs() / 60;
    (minutes.min(u64::from(MAX_WINDOW_MINUTES)) as u32).max(1)
}

/// Derives [`MetricsSnapshot`]s from the crawl's own exported counters.
#[derive(Clone)]
pub struct MetricsProvider {
    source: Arc<dyn MetricsSource>,
}

impl MetricsProvider {
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self { source }
    }

    pub async fn weighted_average(
        &self,
        query: &str,
        window_minutes: u32,
    ) -> Result<Option<f64>, MetricsError> {
        let samples = self.source.query_range(query, window_minutes.max(1)).await?;
        Ok(weighted_average(&samples))
    }

    pub async fn snapshot_for_elapsed(
        &self,
        elapsed: Duration,
    ) -> Result<MetricsSnapshot, MetricsError> {
        self.snapshot(window_for_elapsed(elapsed)).await
    }

    pub async fn snapshot(&self, window_minutes: u32) -> Result<MetricsSnapshot, MetricsError> {
        let window = window_minutes.clamp(1, MAX_WINDOW_MINUTES);

        let p20_lag_seconds = self
            .weighted_average(&p20_lag_query(), window)
            .await?
            .unwrap_or(NO_DATA_LAG_SECONDS);
        let fraction_404 = self
            .weighted_average(&status_fraction_query("3", window), window)
            .await?
            .unwrap_or(0.0);
        let fraction_error = self
            .weighted_average(&status_fraction_query("6|7|8|9|10", window), window)
            .await?
            .unwrap_or(0.0);
        let pgcr_rate = self
            .weighted_average(&status_rate_query("1|2", window), window)
            .await?
            .unwrap_or(0.0);
        let count_404 = self
            .source
            .query_range(&count_404_query(window), LATEST_POINT)
            .await?
            .into_iter()
            .rev()
            .find(|value| !value.is_nan())
            .unwrap_or(0.0);

        let snapshot = MetricsSnapshot {
            p20_lag_seconds,
            fraction_404,
            fraction_error,
            pgcr_rate,
            count_404,
        };
        tracing::debug!(event = "metrics_snapshot", window, ?snapshot, "measured crawl metrics");
        Ok(snapshot)
    }
}

fn p20_lag_query() -> String {
    format!("histogram_quantile(0.20, sum(rate({LAG_BUCKET_METRIC}[2m])) by (le))")
}

fn status_rate_query(statuses: &str, window: u32) -> String {
    format!("sum(rate({STATUS_METRIC}{{status=~\"{statuses}\"}}[{window}m]))")
}

fn status_fraction_query(statuses: &str, window: u32) -> String {
    format!(
        "{} / sum(rate({STATUS_METRIC}[{window}m]))",
        status_rate_query(statuses, window)
    )
}

fn count_404_query(window: u32) -> String {
    format!("{} * {window} * 60", status_rate_query("3", window))
}
