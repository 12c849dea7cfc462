pub mod bungie;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;

pub use bungie::{BungieClassifier, ClassifierError};

/// Activity mode id for raids.
pub const RAID_MODE: i64 = 4;

/// A decoded activity report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityReport {
    pub instance_id: i64,
    pub mode: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Upstream payload, published as-is.
    pub raw: serde_json::Value,
}

impl ActivityReport {
    /// Seconds between completion and `now`; negative when the clock is behind upstream.
    pub fn lag_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.completed_at).num_milliseconds() as f64 / 1000.0
    }

    /// Lag worth recording: `None` when completion appears to be in the future.
    pub fn observable_lag(&self, now: DateTime<Utc>) -> Option<f64> {
        Some(self.lag_seconds(now)).filter(|lag| *lag >= 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFault {
    /// The body was not valid JSON. Usually a truncated transfer.
    Decoding,
    /// Valid JSON that is missing fields a report must have.
    Malformed,
}

/// Result of one fetch for one instance id.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ActivityReport),
    NonRaid(ActivityReport),
    NotFound,
    SystemDisabled,
    InsufficientPrivileges,
    BadFormat(FormatFault),
    ExternalError,
    RateLimited,
}

impl Outcome {
    /// Numeric code used for the `status` label of the crawl counters.
    pub fn status_code(&self) -> i64 {
        match self {
            Outcome::Success(_) => 1,
            Outcome::NonRaid(_) => 2,
            Outcome::NotFound => 3,
            Outcome::SystemDisabled => 4,
            Outcome::InsufficientPrivileges => 5,
            Outcome::BadFormat(FormatFault::Malformed) => 6,
            Outcome::BadFormat(FormatFault::Decoding) => 8,
            Outcome::ExternalError => 9,
            Outcome::RateLimited => 10,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::NonRaid(_) => "non_raid",
            Outcome::NotFound => "not_found",
            Outcome::SystemDisabled => "system_disabled",
            Outcome::InsufficientPrivileges => "insufficient_privileges",
            Outcome::BadFormat(FormatFault::Decoding) => "decoding_error",
            Outcome::BadFormat(FormatFault::Malformed) => "malformed",
            Outcome::ExternalError => "external_error",
            Outcome::RateLimited => "rate_limited",
        }
    }
}

/// Fetches and classifies one instance id. Implementations never retry.
///
/// `malformed_retry` asks upstream to bypass its cache for a report that came
/// back malformed earlier; the crawl loops always pass `0`.
pub trait OutcomeClassifier: Send + Sync {
    fn fetch<'a>(&'a self, instance_id: i64, malformed_retry: u32) -> BoxFuture<'a, Outcome>;
}

impl<T> OutcomeClassifier for Arc<T>
where
    T: OutcomeClassifier + ?Sized,
{
    fn fetch<'a>(&'a self, instance_id: i64, malformed_retry: u32) -> BoxFuture<'a, Outcome> {
        (**self).fetch(instance_id, malformed_retry)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{Duration, Utc};

    use super::{ActivityReport, FormatFault, Outcome, RAID_MODE};

    #[test]
    fn status_codes_are_distinct() {
        let outcomes = [
            Outcome::NotFound,
            Outcome::SystemDisabled,
            Outcome::InsufficientPrivileges,
            Outcome::BadFormat(FormatFault::Decoding),
            Outcome::BadFormat(FormatFault::Malformed),
            Outcome::ExternalError,
            Outcome::RateLimited,
        ];
        let codes: HashSet<i64> = outcomes.iter().map(Outcome::status_code).collect();

        assert_eq!(codes.len(), outcomes.len());
        assert!(!codes.contains(&1) && !codes.contains(&2));
        assert_eq!(Outcome::NotFound.status_code(), 3);
    }

    #[test]
    fn clock_skewed_completion_has_no_observable_lag() {
        let now = Utc::now();
        let report = |completed_at| ActivityReport {
            instance_id: 1,
            mode: RAID_MODE,
            started_at: completed_at - Duration::minutes(10),
            completed_at,
            raw: serde_json::Value::Null,
        };

        assert_eq!(report(now + Duration::seconds(3)).observable_lag(now), None);
        assert_eq!(report(now - Duration::seconds(42)).observable_lag(now), Some(42.0));
        assert_eq!(report(now).observable_lag(now), Some(0.0));
    }
}
