use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

/// Connection settings for a live push gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the gateway's HTTP API
    pub endpoint: String,
    /// Server key sent as a bearer token
    pub server_key: String,
    /// Per-call timeout
    pub timeout: Duration,
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string (unset = in-memory user store)
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Push gateway base URL
    pub push_gateway_url: Option<String>,

    /// Push gateway server key
    pub push_gateway_key: Option<String>,

    /// Timeout for each individual gateway call in seconds (default: 5)
    pub push_gateway_timeout_secs: u64,

    /// Default batch size for bulk sends (default: 100)
    pub bulk_batch_size: usize,

    /// Default delay between bulk batches in milliseconds (default: 1000)
    pub bulk_batch_delay_ms: u64,

    /// IANA timezone used for cron schedules and quiet hours (default: UTC)
    pub scheduler_timezone: String,

    /// Install the built-in reminder jobs at startup (default: true)
    pub scheduler_default_jobs: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            push_gateway_key: std::env::var("PUSH_GATEWAY_KEY").ok(),
            push_gateway_timeout_secs: std::env::var("PUSH_GATEWAY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PUSH_GATEWAY_TIMEOUT_SECS must be a valid u64"))?,
            bulk_batch_size: std::env::var("BULK_BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("BULK_BATCH_SIZE must be a valid usize"))?,
            bulk_batch_delay_ms: std::env::var("BULK_BATCH_DELAY_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("BULK_BATCH_DELAY_MS must be a valid u64"))?,
            scheduler_timezone: std::env::var("SCHEDULER_TIMEZONE")
                .unwrap_or_else(|_| "UTC".to_string()),
            scheduler_default_jobs: std::env::var("SCHEDULER_DEFAULT_JOBS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SCHEDULER_DEFAULT_JOBS must be true or false"))?,
        };

        if config.bulk_batch_size == 0 {
            anyhow::bail!("BULK_BATCH_SIZE must be at least 1");
        }
        config.timezone()?;

        Ok(config)
    }

    /// Gateway settings, or `None` when credentials are absent (simulated mode).
    pub fn gateway(&self) -> Option<GatewayConfig> {
        match (&self.push_gateway_url, &self.push_gateway_key) {
            (Some(endpoint), Some(key)) if !endpoint.is_empty() && !key.is_empty() => {
                Some(GatewayConfig {
                    endpoint: endpoint.trim_end_matches('/').to_string(),
                    server_key: key.clone(),
                    timeout: self.gateway_timeout(),
                })
            }
            _ => None,
        }
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.push_gateway_timeout_secs)
    }

    pub fn bulk_batch_delay(&self) -> Duration {
        Duration::from_millis(self.bulk_batch_delay_ms)
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        self.scheduler_timezone.parse().map_err(|_| {
            anyhow::anyhow!(
                "SCHEDULER_TIMEZONE '{}' is not a valid IANA timezone",
                self.scheduler_timezone
            )
        })
    }
}
