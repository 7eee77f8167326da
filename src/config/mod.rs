use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Take the tenant key from `X-Tenant-Id`. Only safe behind a gateway
    /// that authenticates callers and strips client-supplied copies.
    #[serde(default)]
    pub trust_tenant_header: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trust_tenant_header: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// How long a claimed job stays invisible to other workers.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Fail jobs immediately on 4xx responses other than 408 and 429.
    #[serde(default = "default_true")]
    pub fail_fast_on_client_error: bool,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            timeout_secs: default_timeout(),
            claim_lease_secs: default_claim_lease(),
            user_agent: default_user_agent(),
            fail_fast_on_client_error: true,
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl WebhookConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("webhooks.poll_interval_secs must be greater than 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("webhooks.batch_size must be greater than 0");
        }
        if self.batch_size > 1000 {
            anyhow::bail!("webhooks.batch_size must be 1000 or less");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("webhooks.max_attempts must be greater than 0");
        }
        if self.max_attempts > 30 {
            anyhow::bail!("webhooks.max_attempts must be 30 or less");
        }
        if self.base_delay_secs == 0 {
            anyhow::bail!("webhooks.base_delay_secs must be greater than 0");
        }
        if self
            .base_delay_secs
            .checked_mul(1u64 << self.max_attempts)
            .is_none()
        {
            anyhow::bail!("webhooks.base_delay_secs is too large for the retry schedule");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("webhooks.timeout_secs must be greater than 0");
        }
        if self.claim_lease_secs <= self.timeout_secs {
            anyhow::bail!("webhooks.claim_lease_secs must be longer than webhooks.timeout_secs");
        }
        if self.event_queue_capacity == 0 {
            anyhow::bail!("webhooks.event_queue_capacity must be greater than 0");
        }
        Ok(())
    }
}

/// A (max requests, window) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Exact request paths with their own limit.
    #[serde(default)]
    pub endpoints: HashMap<String, RateLimitRule>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window(),
            sweep_interval_secs: default_sweep_interval(),
            endpoints: HashMap::new(),
        }
    }
}

impl RateLimitSettings {
    pub fn default_rule(&self) -> RateLimitRule {
        RateLimitRule {
            max_requests: self.max_requests,
            window_secs: self.window_secs,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "data/facegate.db".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_batch_size() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    1
}

fn default_timeout() -> u64 {
    10
}

fn default_claim_lease() -> u64 {
    60
}

fn default_user_agent() -> String {
    "FaceGate-Webhook/1.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_max_requests() -> u32 {
    100
}

fn default_window() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    300
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Could not read config file '{}': {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            anyhow::bail!("database.pool_size must be greater than 0");
        }
        self.webhooks.validate()?;
        if self.rate_limit.sweep_interval_secs == 0 {
            anyhow::bail!("rate_limit.sweep_interval_secs must be greater than 0");
        }
        crate::services::rate_limit::RateLimiter::from_settings(&self.rate_limit)?;
        Ok(())
    }
}
