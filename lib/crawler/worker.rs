use tokio::time::Instant;

use super::backoff::{decoding_backoff, pause, retry_backoff};
use super::offload::OffloadHandle;
use super::CrawlContext;
use crate::classifier::{FormatFault, Outcome};

const NOT_FOUND_LIMIT: u32 = 3;
const ERROR_LIMIT: u32 = 2;

/// How a primary worker finished with one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Published,
    NonRaid,
    Blocked,
    Offloaded,
}

#[derive(Debug, Default)]
struct AttemptState {
    attempt: u32,
    not_found_count: u32,
    error_count: u32,
}

impl AttemptState {
    fn exhausted(&self) -> bool {
        self.not_found_count > NOT_FOUND_LIMIT || self.error_count > ERROR_LIMIT
    }

    fn attempts_label(&self) -> i64 {
        i64::from(self.attempt) + 1
    }
}

/// Drives one id until it is published, dropped as non-raid, blocked, or offloaded.
pub async fn process_instance(
    ctx: &CrawlContext,
    offload: &OffloadHandle,
    instance_id: i64,
) -> Resolution {
    let started_at = Instant::now();
    let mut state = AttemptState::default();

    loop {
        let attempts = state.attempts_label();
        let outcome = ctx.fetch(instance_id, attempts).await;

        match &outcome {
            Outcome::Success(report) => match ctx.publisher.publish(report).await {
                Ok(()) => {
                    ctx.observe_report_lag(&outcome, attempts, report);
                    return Resolution::Published;
                }
                Err(err) => {
                    state.error_count += 1;
                    tracing::warn!(
                        event = "publish_failed",
                        instance_id,
                        error_count = state.error_count,
                        error = %err,
                        "failed to publish report, refetching"
                    );
                }
            },
            Outcome::NonRaid(report) => {
                ctx.observe_report_lag(&outcome, attempts, report);
                return Resolution::NonRaid;
            }
            Outcome::NotFound => state.not_found_count += 1,
            Outcome::SystemDisabled => {
                ctx.observe_lag(&outcome, attempts, 0.0);
                pause(ctx.timings.system_disabled_delay).await;
                continue;
            }
            Outcome::InsufficientPrivileges => {
                ctx.push_blocked(instance_id).await;
                return Resolution::Blocked;
            }
            Outcome::BadFormat(FormatFault::Decoding) => {
                state.error_count += 1;
                pause(decoding_backoff(
                    ctx.timings.decoding_backoff_unit,
                    state.error_count,
                ))
                .await;
            }
            Outcome::RateLimited => {
                state.error_count += 1;
                pause(ctx.timings.rate_limited_delay).await;
            }
            Outcome::BadFormat(FormatFault::Malformed) | Outcome::ExternalError => {
                ctx.record_missed(instance_id).await;
                if state.error_count > 0 {
                    offload.offload(instance_id, started_at);
                    return Resolution::Offloaded;
                }
                state.error_count += 1;
            }
        }

        if state.exhausted() {
            tracing::debug!(
                event = "primary_retries_exhausted",
                instance_id,
                not_found_count = state.not_found_count,
                error_count = state.error_count,
                "handing instance to offload pool"
            );
            ctx.record_missed(instance_id).await;
            offload.offload(instance_id, started_at);
            return Resolution::Offloaded;
        }

        pause(retry_backoff(ctx.timings.retry_delay, state.attempt)).await;
        state.attempt += 1;
    }
}
