use std::time::Duration;

use rand::Rng;

/// Jittered retry delay for the given zero-based attempt.
///
/// `retry_delay - retry_delay/3 + uniform(0, retry_delay * (attempt + 1))`.
/// The random term is redrawn on every call so concurrent retries spread out.
pub fn retry_backoff(retry_delay: Duration, attempt: u32) -> Duration {
    let base_ms = retry_delay.as_millis() as u64;
    if base_ms == 0 {
        return Duration::ZERO;
    }

    let floor_ms = base_ms - base_ms / 3;
    let spread_ms = base_ms.saturating_mul(u64::from(attempt) + 1);
    let jitter_ms = rand::thread_rng().gen_range(0..spread_ms);
    Duration::from_millis(floor_ms.saturating_add(jitter_ms))
}

/// Delay after the `error_count`-th undecodable body: `unit * error_count²`.
pub fn decoding_backoff(unit: Duration, error_count: u32) -> Duration {
    unit.saturating_mul(error_count.saturating_mul(error_count))
}

/// Sleeps unless the delay is zero, so tests with zeroed timings never yield to the timer.
pub async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
