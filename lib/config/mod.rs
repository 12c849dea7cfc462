use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::cli::Cli;
use crate::crawler::types::{
    OffloadSettings, WorkerBounds, DEV_MAX_WORKERS, MAX_WORKERS, MIN_WORKERS,
};

const DEFAULT_BUNGIE_URL: &str = "https://www.bungie.net";
const DEFAULT_PROMETHEUS_URL: &str = "http://localhost:9090";
const DEFAULT_MISSED_LOG_PATH: &str = "~/.atlas/missed.log";
const DEFAULT_METRICS_PORT: u16 = 8080;
const DEFAULT_FETCH_RPS: u32 = 200;
const DEFAULT_BUFFER: i64 = 10_000;
const DEV_BUFFER: i64 = 100;
const DEV_DEFAULT_SKIP: i64 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnvVar { name: String, value: String },

    #[error("--dev-skip requires --dev")]
    DevSkipWithoutDev,

    #[error("--dev-skip must be at least 1, got {0}")]
    InvalidDevSkip(i64),

    #[error("--workers must be positive")]
    NoWorkers,

    #[error("--workers ({workers}) exceeds the maximum of {max}")]
    TooManyWorkers { workers: usize, max: usize },

    #[error("--max-workers ({max}) is below the minimum of {min}")]
    MaxBelowMin { max: usize, min: usize },

    #[error("--buffer must not be negative, got {0}")]
    NegativeBuffer(i64),
}

/// Process configuration read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub redis_url: String,
    pub bungie_api_key: String,
    pub bungie_url: String,
    pub prometheus_url: String,
    /// Alerts are only logged when no webhook is configured.
    pub webhook_url: Option<String>,
    pub alerts_role_id: Option<String>,
    pub missed_log_path: PathBuf,
    pub metrics_port: u16,
    /// Default: 200
    pub fetch_rps: u32,
    pub offload: OffloadSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
        };
        let optional = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let offload_defaults = OffloadSettings::default();
        let offload = OffloadSettings {
            workers: parse_or(&lookup, "OFFLOAD_WORKERS", offload_defaults.workers)?,
            queue_capacity: parse_or(
                &lookup,
                "OFFLOAD_QUEUE_CAPACITY",
                offload_defaults.queue_capacity,
            )?,
            ..offload_defaults
        };

        Ok(Self {
            db_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            bungie_api_key: required("BUNGIE_API_KEY")?,
            bungie_url: optional("BUNGIE_URL").unwrap_or_else(|| DEFAULT_BUNGIE_URL.to_string()),
            prometheus_url: optional("PROMETHEUS_URL")
                .unwrap_or_else(|| DEFAULT_PROMETHEUS_URL.to_string()),
            webhook_url: optional("ATLAS_WEBHOOK_URL"),
            alerts_role_id: optional("ALERTS_ROLE_ID"),
            missed_log_path: PathBuf::from(
                optional("MISSED_LOG_PATH").unwrap_or_else(|| DEFAULT_MISSED_LOG_PATH.to_string()),
            ),
            metrics_port: parse_or(&lookup, "METRICS_PORT", DEFAULT_METRICS_PORT)?,
            fetch_rps: parse_or(&lookup, "FETCH_RPS", DEFAULT_FETCH_RPS)?,
            offload,
        })
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name).filter(|value| !value.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
        None => Ok(default),
    }
}

/// Crawl knobs after applying the development-mode rules to the raw flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSettings {
    pub initial_workers: usize,
    pub buffer: i64,
    pub target: Option<i64>,
    pub bounds: WorkerBounds,
    /// Ids skipped between dispatches; zero outside development mode.
    pub skip: i64,
    pub dev: bool,
}

impl CrawlSettings {
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let skip = match (cli.dev, cli.dev_skip) {
            (false, Some(_)) => return Err(ConfigError::DevSkipWithoutDev),
            (false, None) => 0,
            (true, None) => DEV_DEFAULT_SKIP,
            (true, Some(stride)) if stride >= 1 => stride - 1,
            (true, Some(stride)) => return Err(ConfigError::InvalidDevSkip(stride)),
        };

        let max = cli
            .max_workers
            .filter(|max| *max > 0)
            .unwrap_or(if cli.dev { DEV_MAX_WORKERS } else { MAX_WORKERS });
        if max < MIN_WORKERS {
            return Err(ConfigError::MaxBelowMin {
                max,
                min: MIN_WORKERS,
            });
        }

        if cli.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let initial_workers = if cli.workers > max {
            if !cli.dev {
                return Err(ConfigError::TooManyWorkers {
                    workers: cli.workers,
                    max,
                });
            }
            tracing::warn!(
                event = "workers_capped",
                requested = cli.workers,
                max,
                "capping worker count in dev mode"
            );
            max
        } else {
            cli.workers
        };

        let buffer = match cli.buffer {
            Some(buffer) if buffer < 0 => return Err(ConfigError::NegativeBuffer(buffer)),
            Some(buffer) => buffer,
            None if cli.dev => DEV_BUFFER,
            None => DEFAULT_BUFFER,
        };

        Ok(Self {
            initial_workers,
            buffer,
            target: cli.target,
            bounds: WorkerBounds {
                min: MIN_WORKERS,
                max,
            },
            skip,
            dev: cli.dev,
        })
    }
}
