use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Serialize;
use thiserror::Error;

use crate::build_info;
use crate::metrics_provider::MetricsSnapshot;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const WEBHOOK_USERNAME: &str = "Atlas";
const UNRESOLVED_WARNING_WAIT: Duration = Duration::from_secs(5);
const UNRESOLVED_WAIT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn color(self) -> u32 {
        match self {
            Severity::Info => 0x3498db,
            Severity::Warning => 0xf1c40f,
            Severity::Critical => 0xe74c3c,
        }
    }
}

/// Operator-facing events emitted by the crawl loops.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    Startup {
        cursor: i64,
        workers: usize,
        period_length: i64,
        dev: bool,
    },
    StatusUpdate {
        snapshot: MetricsSnapshot,
        workers: usize,
        period_length: i64,
        cursor: i64,
        regime: &'static str,
    },
    WorkersStarting {
        workers: usize,
        period_length: i64,
        cursor: i64,
    },
    High404Rate {
        fraction_404: f64,
        count_404: f64,
    },
    SuperchargeExit {
        fraction_404: f64,
        elapsed: Duration,
    },
    RunawayRecovery {
        from: i64,
        to: i64,
    },
    GapSkip {
        from: i64,
        to: i64,
    },
    UnresolvedWarning {
        instance_id: i64,
        elapsed: Duration,
    },
    Unresolved {
        instance_id: i64,
        elapsed: Duration,
    },
}

impl Alert {
    pub fn kind(&self) -> &'static str {
        match self {
            Alert::Startup { .. } => "startup",
            Alert::StatusUpdate { .. } => "status_update",
            Alert::WorkersStarting { .. } => "workers_starting",
            Alert::High404Rate { .. } => "high_404_rate",
            Alert::SuperchargeExit { .. } => "supercharge_exit",
            Alert::RunawayRecovery { .. } => "runaway_recovery",
            Alert::GapSkip { .. } => "gap_skip",
            Alert::UnresolvedWarning { .. } => "unresolved_warning",
            Alert::Unresolved { .. } => "unresolved",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Alert::Startup { .. } | Alert::StatusUpdate { .. } | Alert::WorkersStarting { .. } => {
                Severity::Info
            }
            Alert::High404Rate { .. }
            | Alert::SuperchargeExit { .. }
            | Alert::UnresolvedWarning { .. } => Severity::Warning,
            Alert::RunawayRecovery { .. } | Alert::GapSkip { .. } | Alert::Unresolved { .. } => {
                Severity::Critical
            }
        }
    }

    /// Whether the alert should mention the on-call role.
    pub fn pings_role(&self) -> bool {
        matches!(self, Alert::RunawayRecovery { .. } | Alert::GapSkip { .. })
    }

    /// Per-id alerts share a slow limiter; this is how long one may wait for a slot.
    pub fn throttle_wait(&self) -> Option<Duration> {
        match self {
            Alert::UnresolvedWarning { .. } => Some(UNRESOLVED_WARNING_WAIT),
            Alert::Unresolved { .. } => Some(UNRESOLVED_WAIT),
            _ => None,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Alert::Startup { .. } => "Crawler starting",
            Alert::StatusUpdate { .. } => "Status update",
            Alert::WorkersStarting { .. } => "Workers starting",
            Alert::High404Rate { .. } => "High 404 rate",
            Alert::SuperchargeExit { .. } => "Exiting gap supercharge",
            Alert::RunawayRecovery { .. } => "Runaway recovery",
            Alert::GapSkip { .. } => "Skipping gap",
            Alert::UnresolvedWarning { .. } => "Instance still unresolved",
            Alert::Unresolved { .. } => "Instance unresolved",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Alert::Startup {
                cursor,
                workers,
                period_length,
                dev,
            } => format!(
                "Starting at `{cursor}` with {workers} workers over {period_length} ids{}",
                if *dev { " (dev mode)" } else { "" }
            ),
            Alert::StatusUpdate {
                snapshot,
                workers,
                period_length,
                cursor,
                regime,
            } => format!(
                "Cursor `{cursor}`\n20th percentile lag: {:.0}s\n404 rate: {:.2}%\n\
                 Error rate: {:.2}%\nRate: {:.1}/s\nNext: {workers} workers over \
                 {period_length} ids ({regime})",
                snapshot.p20_lag_seconds,
                snapshot.fraction_404 * 100.0,
                snapshot.fraction_error * 100.0,
                snapshot.pgcr_rate,
            ),
            Alert::WorkersStarting {
                workers,
                period_length,
                cursor,
            } => format!("{workers} workers crawling {period_length} ids after `{cursor}`"),
            Alert::High404Rate {
                fraction_404,
                count_404,
            } => format!(
                "404 rate is {:.2}% ({count_404:.0} not found). Supercharging to probe for a gap.",
                fraction_404 * 100.0
            ),
            Alert::SuperchargeExit {
                fraction_404,
                elapsed,
            } => format!(
                "Supercharge finished after {}s with a 404 rate of {:.2}%",
                elapsed.as_secs(),
                fraction_404 * 100.0
            ),
            Alert::RunawayRecovery { from, to } => format!(
                "No valid instance found after `{from}`. Rebasing to `{to}` from the latest stored instance."
            ),
            Alert::GapSkip { from, to } => format!(
                "Found a gap of {} ids. Skipping from `{from}` to `{to}`.",
                to - from
            ),
            Alert::UnresolvedWarning {
                instance_id,
                elapsed,
            } => format!(
                "Instance `{instance_id}` unresolved after {}s, still retrying",
                elapsed.as_secs()
            ),
            Alert::Unresolved {
                instance_id,
                elapsed,
            } => format!(
                "Instance `{instance_id}` abandoned after {}s and logged as missed",
                elapsed.as_secs()
            ),
        }
    }
}

/// Fire-and-forget alert delivery. Implementations log their own failures.
pub trait AlertSink: Send + Sync {
    fn notify<'a>(&'a self, alert: Alert) -> BoxFuture<'a, ()>;
}

impl<T> AlertSink for Arc<T>
where
    T: AlertSink + ?Sized,
{
    fn notify<'a>(&'a self, alert: Alert) -> BoxFuture<'a, ()> {
        (**self).notify(alert)
    }
}

#[derive(Serialize, Debug)]
struct WebhookPayload {
    username: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    embeds: Vec<Embed>,
}

#[derive(Serialize, Debug)]
struct Embed {
    title: &'static str,
    description: String,
    color: u32,
    timestamp: String,
    footer: Footer,
}

#[derive(Serialize, Debug)]
struct Footer {
    text: String,
}

fn build_payload(alert: &Alert, role_id: Option<&str>) -> WebhookPayload {
    let content = role_id
        .filter(|_| alert.pings_role())
        .map(|role| format!("<@&{role}>"));

    WebhookPayload {
        username: WEBHOOK_USERNAME,
        content,
        embeds: vec![Embed {
            title: alert.title(),
            description: alert.description(),
            color: alert.severity().color(),
            timestamp: Utc::now().to_rfc3339(),
            footer: Footer {
                text: format!("atlas {}", build_info::VERSION_WITH_COMMIT),
            },
        }],
    }
}

type AlertRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Logs every alert and, when a webhook is configured, posts it to Discord.
pub struct DiscordAlerter {
    http: reqwest::Client,
    webhook_url: Option<String>,
    role_id: Option<String>,
    unresolved_limiter: AlertRateLimiter,
}

impl DiscordAlerter {
    pub fn new(webhook_url: Option<String>, role_id: Option<String>) -> Result<Self, AlertError> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            webhook_url,
            role_id,
            unresolved_limiter: RateLimiter::direct(Quota::per_minute(nonzero!(1u32))),
        })
    }

    async fn deliver(&self, alert: Alert) {
        log_alert(&alert);

        let Some(url) = self.webhook_url.as_deref() else {
            return;
        };

        if let Some(wait) = alert.throttle_wait() {
            if tokio::time::timeout(wait, self.unresolved_limiter.until_ready())
                .await
                .is_err()
            {
                tracing::debug!(
                    event = "alert_throttled",
                    kind = alert.kind(),
                    "dropping alert after waiting for a rate limit slot"
                );
                return;
            }
        }

        if let Err(err) = self.post(url, &alert).await {
            tracing::warn!(
                event = "alert_delivery_failed",
                kind = alert.kind(),
                error = %err,
                "failed to deliver alert"
            );
        }
    }

    async fn post(&self, url: &str, alert: &Alert) -> Result<(), AlertError> {
        let payload = build_payload(alert, self.role_id.as_deref());
        let response = self.http.post(url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

fn log_alert(alert: &Alert) {
    let description = alert.description();
    match alert.severity() {
        Severity::Info => {
            tracing::info!(event = "alert", kind = alert.kind(), %description, "{}", alert.title())
        }
        Severity::Warning => {
            tracing::warn!(event = "alert", kind = alert.kind(), %description, "{}", alert.title())
        }
        Severity::Critical => {
            tracing::error!(event = "alert", kind = alert.kind(), %description, "{}", alert.title())
        }
    }
}

impl AlertSink for DiscordAlerter {
    fn notify<'a>(&'a self, alert: Alert) -> BoxFuture<'a, ()> {
        Box::pin(self.deliver(alert))
    }
}
