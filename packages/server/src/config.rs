use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use distributor::batch::BatchConfig;
use distributor::webhook::WebhookConfig;
use dotenvy::dotenv;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Accepted bearer tokens. Empty disables authentication (development).
    pub api_tokens: Vec<String>,
    pub connection_queue_capacity: usize,
    pub webhook_workers: usize,
    pub webhook_queue_capacity: usize,
    pub webhook_max_attempts: u32,
    pub webhook_base_backoff: Duration,
    pub webhook_max_backoff: Duration,
    pub webhook_request_timeout: Duration,
    pub batch_parallel_ceiling: usize,
    pub batch_max_in_flight: usize,
    pub batch_overall_timeout: Duration,
    pub query_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            port: parsed("PORT", 8080)?,
            api_tokens: env::var("API_TOKENS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            connection_queue_capacity: parsed("CONNECTION_QUEUE_CAPACITY", 256)?,
            webhook_workers: parsed("WEBHOOK_WORKERS", 4)?,
            webhook_queue_capacity: parsed("WEBHOOK_QUEUE_CAPACITY", 1024)?,
            webhook_max_attempts: parsed("WEBHOOK_MAX_ATTEMPTS", 5)?,
            webhook_base_backoff: millis("WEBHOOK_BASE_BACKOFF_MS", 500)?,
            webhook_max_backoff: millis("WEBHOOK_MAX_BACKOFF_MS", 60_000)?,
            webhook_request_timeout: millis("WEBHOOK_REQUEST_TIMEOUT_MS", 10_000)?,
            batch_parallel_ceiling: parsed("BATCH_PARALLEL_CEILING", 8)?,
            batch_max_in_flight: parsed("BATCH_MAX_IN_FLIGHT", 32)?,
            batch_overall_timeout: millis("BATCH_OVERALL_TIMEOUT_MS", 300_000)?,
            query_timeout: millis("QUERY_TIMEOUT_MS", 30_000)?,
        })
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            workers: self.webhook_workers,
            queue_capacity: self.webhook_queue_capacity,
            max_attempts: self.webhook_max_attempts,
            base_backoff: self.webhook_base_backoff,
            max_backoff: self.webhook_max_backoff,
            request_timeout: self.webhook_request_timeout,
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            parallel_ceiling: self.batch_parallel_ceiling,
            per_query_timeout: self.query_timeout,
            max_in_flight: self.batch_max_in_flight,
            default_overall_timeout: self.batch_overall_timeout,
            ..Default::default()
        }
    }
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + ToString,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{name} must be a valid number"))
}

fn millis(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(parsed(name, default)?))
}
