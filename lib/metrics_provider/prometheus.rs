use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;

use super::{MetricsError, MetricsSource};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STEP_SECONDS: i64 = 60;

#[derive(Deserialize, Debug)]
struct QueryRangeResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<QueryRangeData>,
}

#[derive(Deserialize, Debug)]
struct QueryRangeData {
    #[serde(default)]
    result: Vec<RangeSeries>,
}

#[derive(Deserialize, Debug)]
struct RangeSeries {
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Prometheus HTTP API client for `/api/v1/query_range`.
pub struct PrometheusClient {
    http: reqwest::Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MetricsError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, query: &str, window_minutes: u32) -> Result<Vec<f64>, MetricsError> {
        let end = Utc::now().timestamp();
        let start = end - i64::from(window_minutes) * 60;

        let response = self
            .http
            .get(format!("{}/api/v1/query_range", self.base_url))
            .query(&[
                ("query", query.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("step", STEP_SECONDS.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 400 && status.as_u16() != 422 {
            let body = response.text().await.unwrap_or_default();
            return Err(MetricsError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let payload: QueryRangeResponse = response.json().await?;
        parse_samples(payload)
    }
}

fn parse_samples(payload: QueryRangeResponse) -> Result<Vec<f64>, MetricsError> {
    if payload.status != "success" {
        return Err(MetricsError::Query(
            payload.error.unwrap_or_else(|| payload.status.clone()),
        ));
    }

    let Some(series) = payload.data.and_then(|data| data.result.into_iter().next()) else {
        return Ok(Vec::new());
    };

    series
        .values
        .into_iter()
        .map(|(_, raw)| raw.parse::<f64>().map_err(|_| MetricsError::BadSample(raw)))
        .collect()
}

impl MetricsSource for PrometheusClient {
    fn query_range<'a>(
        &'a self,
        query: &'a str,
        window_minutes: u32,
    ) -> BoxFuture<'a, Result<Vec<f64>, MetricsError>> {
        Box::pin(self.fetch(query, window_minutes))
    }
}
