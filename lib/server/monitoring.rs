use crate::build_info;
use crate::classifier::Outcome;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Lag buckets in seconds, from "live" up to a day behind.
pub const LAG_BUCKETS: [f64; 13] = [
    5.0, 15.0, 25.0, 30.0, 35.0, 40.0, 45.0, 60.0, 90.0, 300.0, 1800.0, 14400.0, 86400.0,
];

/// Registers immutable build metadata for `/metrics` scraping.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "atlas_crawler",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

/// `status` is the outcome code; `attempts` is the 1-based attempt number,
/// negated for attempts made by the offload pool.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CrawlStatusLabels {
    pub status: i64,
    pub attempts: i64,
}

fn lag_histogram() -> Histogram {
    Histogram::new(LAG_BUCKETS.into_iter())
}

#[derive(Clone)]
pub struct CrawlMetrics {
    /// One increment per fetch. The controller's feedback queries read this.
    pub status: Family<CrawlStatusLabels, Counter>,
    /// Seconds between an activity completing and the crawl resolving it.
    pub lag: Family<CrawlStatusLabels, Histogram, fn() -> Histogram>,
    pub active_workers: Gauge,
    pub cursor_id: Gauge,
    pub offload_queue_depth: Gauge,
    pub offload_shed_total: Counter,
    pub missed_total: Counter,
}

impl CrawlMetrics {
    fn init() -> Self {
        Self {
            status: Family::default(),
            lag: Family::new_with_constructor(lag_histogram as fn() -> Histogram),
            active_workers: Gauge::default(),
            cursor_id: Gauge::default(),
            offload_queue_depth: Gauge::default(),
            offload_shed_total: Counter::default(),
            missed_total: Counter::default(),
        }
    }

    /// The crawl summary families are registered unprefixed; their names are
    /// part of the feedback queries.
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        registry.register(
            "pgcr_crawl_summary_status",
            "Fetch outcomes by status code and attempt",
            metrics.status.clone(),
        );
        registry.register(
            "pgcr_crawl_summary_lag",
            "Seconds between activity completion and crawl",
            metrics.lag.clone(),
        );

        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "active_workers",
            "Primary workers in the current dispatch",
            metrics.active_workers.clone(),
        );
        sub_registry.register(
            "cursor_id",
            "Last dispatched instance id",
            metrics.cursor_id.clone(),
        );
        sub_registry.register(
            "offload_queue_depth",
            "Ids waiting for an offload worker",
            metrics.offload_queue_depth.clone(),
        );
        sub_registry.register(
            "offload_shed",
            "Ids recorded as missed because the offload queue was full",
            metrics.offload_shed_total.clone(),
        );
        sub_registry.register(
            "missed",
            "Ids written to the missed ledger",
            metrics.missed_total.clone(),
        );
        metrics
    }

    pub fn record_fetch(&self, outcome: &Outcome, attempts: i64) {
        self.status
            .get_or_create(&CrawlStatusLabels {
                status: outcome.status_code(),
                attempts,
            })
            .inc();
    }

    pub fn observe_lag(&self, outcome: &Outcome, attempts: i64, lag_seconds: f64) {
        self.lag
            .get_or_create(&CrawlStatusLabels {
                status: outcome.status_code(),
                attempts,
            })
            .observe(lag_seconds);
    }
}

pub static CRAWL_METRICS: OnceCell<CrawlMetrics> = OnceCell::const_new();
