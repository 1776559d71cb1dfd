use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::types::InsightType;

/// Which backends hold the ledger, queue and rate-limit buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// PostgreSQL ledger, Redis queue and buckets. Safe for many processes.
    Postgres,
    /// Everything in process memory. Workers must run in the same process.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!(
                "HERALD_STORAGE must be 'postgres' or 'memory', got '{}'",
                other
            )),
        }
    }
}

/// Token bucket shape for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BucketLimits {
    /// Burst size in tokens.
    pub capacity: f64,
    /// Steady-state tokens added per second.
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub default_limits: BucketLimits,
    /// Tokens normal-priority sends must leave in the bucket for high priority.
    pub high_reserve: f64,
    /// Per-channel bucket overrides keyed by `channel_target`.
    pub overrides: HashMap<String, BucketLimits>,
}

impl RateLimitConfig {
    pub fn limits_for(&self, channel_target: &str) -> BucketLimits {
        self.overrides
            .get(channel_target)
            .copied()
            .unwrap_or(self.default_limits)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limits: BucketLimits {
                capacity: 10.0,
                refill_per_sec: 1.0,
            },
            high_reserve: 2.0,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a notification is dead-lettered.
    pub max_attempts: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ms: u64,
    /// Re-enqueue delay after the local rate limiter denies a send.
    pub throttle_delay_ms: u64,
    pub throttle_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 1_000,
            cap_ms: 300_000,
            jitter_ms: 1_000,
            throttle_delay_ms: 250,
            throttle_jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub idle_poll_ms: u64,
    pub send_timeout_ms: u64,
    /// Run the worker pool and recovery sweep inside the API process.
    pub embedded: bool,
}

impl WorkerConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            idle_poll_ms: 200,
            send_timeout_ms: 10_000,
            embedded: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// High-priority entries a worker may take in a row while normal work waits.
    pub high_weight: u32,
    /// Namespace for Redis keys.
    pub key_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_weight: 4,
            key_prefix: "herald".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    pub interval_secs: u64,
    /// Age after which `pending` and `sending` rows are considered abandoned.
    pub stale_after_secs: u64,
    /// Age after which a `queued` row is assumed to have lost its queue entry.
    pub stale_queued_after_secs: u64,
    pub batch_size: i64,
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stale_after_secs: 120,
            stale_queued_after_secs: 900,
            batch_size: 100,
        }
    }
}

/// Where events without an explicit `channel_target` are sent.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    pub high_priority_channel: String,
    pub normal_priority_channel: String,
    pub type_channels: HashMap<InsightType, String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let type_channels = HashMap::from([
            (
                InsightType::RegulatoryApproval,
                "#regulatory-alerts".to_string(),
            ),
            (InsightType::ClinicalTrial, "#clinical-updates".to_string()),
            (InsightType::MergerAcquisition, "#ma-alerts".to_string()),
            (InsightType::FundingRound, "#funding-news".to_string()),
            (InsightType::Partnership, "#partnerships".to_string()),
            (InsightType::Custom, "#general-alerts".to_string()),
        ]);
        Self {
            high_priority_channel: "#alerts".to_string(),
            normal_priority_channel: "#updates".to_string(),
            type_channels,
        }
    }
}

/// Optional upstream Insight Source polled for new events.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval_secs: u64,
    pub batch_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            poll_interval_secs: 30,
            batch_size: 10,
        }
    }
}

/// Webhook URLs used by the channel client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    pub endpoints: HashMap<String, String>,
    pub default_url: Option<String>,
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub storage: StorageBackend,

    /// PostgreSQL connection string (required for the postgres backend)
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string
    pub redis_url: String,

    /// Address the HTTP API listens on
    pub bind_addr: String,

    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub recovery: RecoveryConfig,
    pub routing: RoutingConfig,
    pub source: SourceConfig,
    pub webhooks: WebhookConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Memory,
            database_url: None,
            db_max_connections: 20,
            redis_url: "redis://localhost:6379".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            recovery: RecoveryConfig::default(),
            routing: RoutingConfig::default(),
            source: SourceConfig::default(),
            webhooks: WebhookConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let storage: StorageBackend = env_parse("HERALD_STORAGE", StorageBackend::Postgres)?;
        let database_url = std::env::var("DATABASE_URL").ok();
        if storage == StorageBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL environment variable is required for the postgres backend");
        }

        let rate_limit = RateLimitConfig {
            default_limits: BucketLimits {
                capacity: env_parse(
                    "RATE_LIMIT_CAPACITY",
                    defaults.rate_limit.default_limits.capacity,
                )?,
                refill_per_sec: env_parse(
                    "RATE_LIMIT_REFILL_PER_SEC",
                    defaults.rate_limit.default_limits.refill_per_sec,
                )?,
            },
            high_reserve: env_parse("RATE_LIMIT_HIGH_RESERVE", defaults.rate_limit.high_reserve)?,
            overrides: match std::env::var("RATE_LIMIT_OVERRIDES") {
                Ok(raw) => parse_bucket_overrides(&raw)?,
                Err(_) => HashMap::new(),
            },
        };

        let retry = RetryConfig {
            max_attempts: env_parse("DELIVERY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_ms: env_parse("RETRY_BASE_MS", defaults.retry.base_ms)?,
            cap_ms: env_parse("RETRY_CAP_MS", defaults.retry.cap_ms)?,
            jitter_ms: env_parse("RETRY_JITTER_MS", defaults.retry.jitter_ms)?,
            throttle_delay_ms: env_parse("THROTTLE_DELAY_MS", defaults.retry.throttle_delay_ms)?,
            throttle_jitter_ms: env_parse(
                "THROTTLE_JITTER_MS",
                defaults.retry.throttle_jitter_ms,
            )?,
        };
        let worker = WorkerConfig {
            pool_size: env_parse("WORKER_POOL_SIZE", defaults.worker.pool_size)?,
            idle_poll_ms: env_parse("WORKER_IDLE_POLL_MS", defaults.worker.idle_poll_ms)?,
            send_timeout_ms: env_parse("SEND_TIMEOUT_MS", defaults.worker.send_timeout_ms)?,
            embedded: env_parse("EMBEDDED_WORKERS", defaults.worker.embedded)?,
        };

        let queue = QueueConfig {
            high_weight: env_parse("QUEUE_HIGH_WEIGHT", defaults.queue.high_weight)?,
            key_prefix: std::env::var("REDIS_KEY_PREFIX").unwrap_or(defaults.queue.key_prefix),
        };

        let recovery = RecoveryConfig {
            interval_secs: env_parse("RECOVERY_INTERVAL_SECS", defaults.recovery.interval_secs)?,
            stale_after_secs: env_parse(
                "RECOVERY_STALE_AFTER_SECS",
                defaults.recovery.stale_after_secs,
            )?,
            stale_queued_after_secs: env_parse(
                "RECOVERY_STALE_QUEUED_AFTER_SECS",
                defaults.recovery.stale_queued_after_secs,
            )?,
            batch_size: defaults.recovery.batch_size,
        };

        let mut routing = defaults.routing;
        if let Ok(channel) = std::env::var("HIGH_PRIORITY_CHANNEL") {
            routing.high_priority_channel = channel;
        }
        if let Ok(channel) = std::env::var("NORMAL_PRIORITY_CHANNEL") {
            routing.normal_priority_channel = channel;
        }
        if let Ok(raw) = std::env::var("INSIGHT_CHANNEL_MAPPINGS") {
            for (insight_type, channel) in parse_pairs(&raw, "INSIGHT_CHANNEL_MAPPINGS")? {
                let insight_type: InsightType = insight_type
                    .parse()
                    .map_err(|e| anyhow::anyhow!("INSIGHT_CHANNEL_MAPPINGS: {}", e))?;
                routing.type_channels.insert(insight_type, channel);
            }
        }

        let source = SourceConfig {
            url: std::env::var("INSIGHT_SOURCE_URL").ok(),
            api_key: std::env::var("INSIGHT_SOURCE_API_KEY").ok(),
            poll_interval_secs: env_parse(
                "POLL_INTERVAL_SECS",
                defaults.source.poll_interval_secs,
            )?,
            batch_size: env_parse("POLL_BATCH_SIZE", defaults.source.batch_size)?,
        };

        let webhooks = WebhookConfig {
            endpoints: match std::env::var("CHANNEL_WEBHOOKS") {
                Ok(raw) => parse_pairs(&raw, "CHANNEL_WEBHOOKS")?.into_iter().collect(),
                Err(_) => HashMap::new(),
            },
            default_url: std::env::var("DEFAULT_WEBHOOK_URL").ok(),
        };

        let config = Self {
            storage,
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            bind_addr: std::env::var("API_BIND_ADDR").unwrap_or(defaults.bind_addr),
            rate_limit,
            retry,
            worker,
            queue,
            recovery,
            routing,
            source,
            webhooks,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which the pipeline could never make progress.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("DELIVERY_MAX_ATTEMPTS must be at least 1");
        }

        check_limits("RATE_LIMIT_CAPACITY", &self.rate_limit.default_limits)?;
        for (channel, limits) in &self.rate_limit.overrides {
            check_limits(&format!("RATE_LIMIT_OVERRIDES entry '{}'", channel), limits)?;
        }

        let stale_queued_ms = self.recovery.stale_queued_after_secs.saturating_mul(1000);
        if self.retry.cap_ms >= stale_queued_ms {
            anyhow::bail!(
                "RETRY_CAP_MS ({}) must be below RECOVERY_STALE_QUEUED_AFTER_SECS ({}s)",
                self.retry.cap_ms,
                self.recovery.stale_queued_after_secs
            );
        }
        Ok(())
    }
}

fn check_limits(name: &str, limits: &BucketLimits) -> anyhow::Result<()> {
    if !limits.capacity.is_finite() || limits.capacity < 1.0 {
        anyhow::bail!("{}: capacity must be at least 1, got {}", name, limits.capacity);
    }
    if !limits.refill_per_sec.is_finite() || limits.refill_per_sec <= 0.0 {
        anyhow::bail!(
            "{}: refill rate must be positive, got {}",
            name,
            limits.refill_per_sec
        );
    }
    Ok(())
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_parse<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Parse `key=value,key=value` lists. Values may themselves contain `=`.
fn parse_pairs(raw: &str, name: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| anyhow::anyhow!("{} entry '{}' must look like key=value", name, item))
        })
        .collect()
}

/// Parse `channel=capacity:refill_per_sec,...`.
fn parse_bucket_overrides(raw: &str) -> anyhow::Result<HashMap<String, BucketLimits>> {
    parse_pairs(raw, "RATE_LIMIT_OVERRIDES")?
        .into_iter()
        .map(|(channel, spec)| {
            let (capacity, refill) = spec.split_once(':').ok_or_else(|| {
                anyhow::anyhow!(
                    "RATE_LIMIT_OVERRIDES value for '{}' must look like capacity:refill",
                    channel
                )
            })?;
            let limits = BucketLimits {
                capacity: capacity.parse().map_err(|_| {
                    anyhow::anyhow!("invalid capacity '{}' for '{}'", capacity, channel)
                })?,
                refill_per_sec: refill.parse().map_err(|_| {
                    anyhow::anyhow!("invalid refill rate '{}' for '{}'", refill, channel)
                })?,
            };
            Ok((channel, limits))
        })
        .collect()
}
