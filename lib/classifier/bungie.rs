use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Deserialize;
use thiserror::Error;

use super::{ActivityReport, FormatFault, Outcome, OutcomeClassifier, RAID_MODE};

pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const REPORT_PATH: &str = "/Platform/Destiny2/Stats/PostGameCarnageReport";

const CODE_SUCCESS: i64 = 1;
const CODE_UNHANDLED_EXCEPTION: i64 = 3;
const CODE_SYSTEM_DISABLED: i64 = 5;
const CODE_INSUFFICIENT_PRIVILEGES: i64 = 12;
const CODE_REPORT_NOT_FOUND: i64 = 1653;
const CODE_THROTTLED_BY_GAME_SERVER: i64 = 1672;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid api key header: {0}")]
    ApiKey(#[from] reqwest::header::InvalidHeaderValue),
}

/// Builds the limiter shared by every fetch in the process, retries included.
pub fn build_rate_limiter(requests_per_second: u32) -> GlobalRateLimiter {
    let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
    Arc::new(RateLimiter::direct(Quota::per_second(rps)))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    error_code: i64,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ReportBody {
    period: DateTime<Utc>,
    activity_details: ActivityDetails,
    #[serde(default)]
    entries: Vec<Entry>,
}

#[derive(Deserialize, Debug)]
struct ActivityDetails {
    mode: i64,
}

#[derive(Deserialize, Debug)]
struct Entry {
    values: EntryValues,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EntryValues {
    activity_duration_seconds: Option<StatValue>,
}

#[derive(Deserialize, Debug)]
struct StatValue {
    basic: BasicValue,
}

#[derive(Deserialize, Debug)]
struct BasicValue {
    value: f64,
}

/// Maps one upstream HTTP response to an [`Outcome`].
pub fn classify_response(instance_id: i64, status: u16, body: &[u8]) -> Outcome {
    match status {
        403 | 429 | 503 => return Outcome::RateLimited,
        502 => return Outcome::ExternalError,
        _ => {}
    }

    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(_) if (200..300).contains(&status) => {
            return Outcome::BadFormat(FormatFault::Decoding)
        }
        Err(_) => return Outcome::ExternalError,
    };

    match envelope.error_code {
        CODE_SUCCESS => match envelope.response {
            Some(raw) => decode_report(instance_id, raw),
            None => Outcome::BadFormat(FormatFault::Malformed),
        },
        CODE_REPORT_NOT_FOUND => Outcome::NotFound,
        CODE_SYSTEM_DISABLED => Outcome::SystemDisabled,
        CODE_INSUFFICIENT_PRIVILEGES => Outcome::InsufficientPrivileges,
        CODE_UNHANDLED_EXCEPTION | CODE_THROTTLED_BY_GAME_SERVER => Outcome::ExternalError,
        other => {
            tracing::debug!(
                event = "unknown_error_code",
                instance_id,
                error_code = other,
                "unrecognised upstream error code"
            );
            Outcome::ExternalError
        }
    }
}

fn decode_report(instance_id: i64, raw: serde_json::Value) -> Outcome {
    let body = match ReportBody::deserialize(&raw) {
        Ok(body) => body,
        Err(err) => {
            tracing::debug!(event = "malformed_report", instance_id, error = %err);
            return Outcome::BadFormat(FormatFault::Malformed);
        }
    };

    let duration_seconds = body
        .entries
        .first()
        .and_then(|entry| entry.values.activity_duration_seconds.as_ref())
        .map(|stat| stat.basic.value)
        .unwrap_or(0.0);
    let completed_at =
        body.period + chrono::Duration::milliseconds((duration_seconds * 1000.0) as i64);

    let report = ActivityReport {
        instance_id,
        mode: body.activity_details.mode,
        started_at: body.period,
        completed_at,
        raw,
    };
    if report.mode == RAID_MODE {
        Outcome::Success(report)
    } else {
        Outcome::NonRaid(report)
    }
}

/// Production classifier backed by the public stats API.
pub struct BungieClassifier {
    http: reqwest::Client,
    base_url: String,
    global_rate_limiter: GlobalRateLimiter,
}

impl BungieClassifier {
    pub fn new(
        base_url: impl Into<String>,
        api_key: &str,
        global_rate_limiter: GlobalRateLimiter,
    ) -> Result<Self, ClassifierError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-API-Key", reqwest::header::HeaderValue::from_str(api_key)?);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            global_rate_limiter,
        })
    }

    async fn fetch_once(&self, instance_id: i64, malformed_retry: u32) -> Outcome {
        self.global_rate_limiter.until_ready().await;

        let mut request = self
            .http
            .get(format!("{}{REPORT_PATH}/{instance_id}/", self.base_url));
        if malformed_retry > 0 {
            request = request.query(&[("malformed_retry", malformed_retry)]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return map_transport_error(instance_id, &err),
        };
        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => classify_response(instance_id, status, &body),
            Err(err) => map_transport_error(instance_id, &err),
        }
    }
}

fn map_transport_error(instance_id: i64, err: &reqwest::Error) -> Outcome {
    if let Some(status) = err.status() {
        return classify_response(instance_id, status.as_u16(), &[]);
    }
    if err.is_timeout() {
        tracing::debug!(event = "fetch_timeout", instance_id, "report request timed out");
    } else {
        tracing::warn!(event = "fetch_transport_error", instance_id, error = %err);
    }
    Outcome::ExternalError
}

impl OutcomeClassifier for BungieClassifier {
    fn fetch<'a>(&'a self, instance_id: i64, malformed_retry: u32) -> BoxFuture<'a, Outcome> {
        Box::pin(self.fetch_once(instance_id, malformed_retry))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::classify_response;
    use crate::classifier::{FormatFault, Outcome};

    fn report_body(mode: i64, duration: f64) -> String {
        format!(
            r#"{{"ErrorCode":1,"ErrorStatus":"Success","Response":{{
                "period":"2024-03-01T12:00:00Z",
                "activityDetails":{{"mode":{mode},"instanceId":"14000000001"}},
                "entries":[{{"values":{{"activityDurationSeconds":{{"basic":{{"value":{duration}}}}}}}}}]
            }}}}"#
        )
    }

    #[test]
    fn raid_report_is_success_with_completion_time() {
        let outcome = classify_response(14_000_000_001, 200, report_body(4, 90.0).as_bytes());

        let Outcome::Success(report) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(report.instance_id, 14_000_000_001);
        assert_eq!(
            report.completed_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 30).unwrap()
        );
    }

    #[test]
    fn other_modes_are_non_raid() {
        let outcome = classify_response(7, 200, report_body(5, 10.0).as_bytes());
        assert!(matches!(outcome, Outcome::NonRaid(report) if report.mode == 5));
    }

    #[test]
    fn upstream_error_codes_map_to_outcomes() {
        let cases = [
            (1653, Outcome::NotFound),
            (5, Outcome::SystemDisabled),
            (12, Outcome::InsufficientPrivileges),
            (3, Outcome::ExternalError),
            (1672, Outcome::ExternalError),
            (99999, Outcome::ExternalError),
        ];
        for (code, expected) in cases {
            let body = format!(r#"{{"ErrorCode":{code},"ErrorStatus":"x"}}"#);
            assert_eq!(classify_response(1, 200, body.as_bytes()), expected, "code {code}");
        }
    }

    #[test]
    fn http_statuses_short_circuit_body_parsing() {
        assert_eq!(classify_response(1, 403, b""), Outcome::RateLimited);
        assert_eq!(classify_response(1, 503, b"<html>"), Outcome::RateLimited);
        assert_eq!(classify_response(1, 502, b""), Outcome::ExternalError);
        assert_eq!(classify_response(1, 500, b"oops"), Outcome::ExternalError);
    }

    #[test]
    fn bad_bodies_split_into_decoding_and_malformed() {
        assert_eq!(
            classify_response(1, 200, br#"{"ErrorCode":1,"Respo"#),
            Outcome::BadFormat(FormatFault::Decoding)
        );
        assert_eq!(
            classify_response(1, 200, br#"{"ErrorCode":1}"#),
            Outcome::BadFormat(FormatFault::Malformed)
        );
        assert_eq!(
            classify_response(1, 200, br#"{"ErrorCode":1,"Response":{"period":"nope"}}"#),
            Outcome::BadFormat(FormatFault::Malformed)
        );
    }
}
