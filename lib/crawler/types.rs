use std::time::Duration;

pub const MIN_WORKERS: usize = 5;
pub const MAX_WORKERS: usize = 250;
pub const DEV_MAX_WORKERS: usize = 8;
/// Base retry delay in milliseconds. Also feeds the steady-state decay formula.
pub const RETRY_DELAY_MS: u64 = 5500;
pub const INITIAL_PERIOD_LENGTH: i64 = 10_000;

/// Inclusive bounds applied to every worker count the controller adopts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerBounds {
    pub min: usize,
    pub max: usize,
}

impl WorkerBounds {
    pub fn clamp(&self, workers: i64) -> usize {
        let workers = usize::try_from(workers.max(0)).unwrap_or(usize::MAX);
        workers.clamp(self.min, self.max)
    }
}

impl Default for WorkerBounds {
    fn default() -> Self {
        Self {
            min: MIN_WORKERS,
            max: MAX_WORKERS,
        }
    }
}

/// Worker count and batch length for one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    pub worker_count: usize,
    pub period_length: i64,
}

/// Every sleep the crawl loops perform.
///
/// Production uses `Default`; tests use [`CrawlTimings::immediate`] so retry paths run
/// without wall-clock delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlTimings {
    pub retry_delay: Duration,
    /// Multiplied by `error_count²` after a body that failed to decode.
    pub decoding_backoff_unit: Duration,
    pub rate_limited_delay: Duration,
    pub system_disabled_delay: Duration,
    pub offload_grace: Duration,
    pub offload_system_disabled_delay: Duration,
    pub search_system_disabled_delay: Duration,
    pub search_transient_delay: Duration,
    pub gap_check_interval: Duration,
}

impl Default for CrawlTimings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            decoding_backoff_unit: Duration::from_secs(5),
            rate_limited_delay: Duration::from_secs(30),
            system_disabled_delay: Duration::from_secs(45),
            offload_grace: Duration::from_secs(15),
            offload_system_disabled_delay: Duration::from_secs(60),
            search_system_disabled_delay: Duration::from_secs(60),
            search_transient_delay: Duration::from_secs(5),
            gap_check_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CrawlTimings {
    pub fn immediate() -> Self {
        Self {
            retry_delay: Duration::ZERO,
            decoding_backoff_unit: Duration::ZERO,
            rate_limited_delay: Duration::ZERO,
            system_disabled_delay: Duration::ZERO,
            offload_grace: Duration::ZERO,
            offload_system_disabled_delay: Duration::ZERO,
            search_system_disabled_delay: Duration::ZERO,
            search_transient_delay: Duration::ZERO,
            gap_check_interval: Duration::ZERO,
        }
    }
}

/// Shape of the secondary retry pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadSettings {
    pub workers: usize,
    /// Pending entries held before new offloads are shed to the missed ledger.
    pub queue_capacity: usize,
    pub max_attempts: u32,
    /// Attempt number that triggers the "still unresolved" warning.
    pub warn_at_attempt: u32,
}

impl Default for OffloadSettings {
    fn default() -> Self {
        Self {
            workers: 256,
            queue_capacity: 10_000,
            max_attempts: 6,
            warn_at_attempt: 3,
        }
    }
}
