use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use analysis_core::AnalysisMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    // Request admission
    pub max_batch_size: usize,             // 50 symbols
    pub max_concurrent_requests: usize,    // 32 active handles
    pub default_timeout_ms: u64,           // 30s
    pub max_timeout_ms: u64,               // 5min
    pub default_max_results: usize,        // 10

    // Batch engine
    pub batch_window: usize,               // 10 symbols per window
    pub max_concurrent_workers: usize,     // 5 symbols in flight
    pub batch_base_delay_ms: u64,          // 50ms between windows
    pub batch_latency_factor: f64,         // +0.5ms per ms of observed latency
    pub batch_max_delay_ms: u64,           // 2s ceiling
    pub memory_threshold_mb: u64,          // 512MB resident
    pub evict_fraction: f64,               // drop the cheapest 25% on pressure

    // Cache TTLs per mode
    pub cache_ttl_single_secs: u64,        // 1min
    pub cache_ttl_multiple_secs: u64,      // 5min
    pub cache_ttl_sector_secs: u64,        // 15min

    // Handle tracking
    pub stale_handle_secs: u64,            // 5min
    pub sweep_interval_secs: u64,          // 30s

    // Providers
    pub provider_rate_limit: usize,        // 60 requests
    pub provider_rate_window_secs: u64,    // per 60s
    pub provider_timeout_ms: u64,          // 5s

    // Provider endpoints; a missing URL disables that provider
    pub macro_provider_url: Option<String>,
    pub sentiment_provider_url: Option<String>,
    pub esg_provider_url: Option<String>,
    pub short_interest_provider_url: Option<String>,
    pub technical_provider_url: Option<String>,
    pub fundamental_provider_url: Option<String>,
    pub quant_provider_url: Option<String>,
    pub news_provider_url: Option<String>,

    pub redis_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_concurrent_requests: 32,
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            default_max_results: 10,
            batch_window: 10,
            max_concurrent_workers: 5,
            batch_base_delay_ms: 50,
            batch_latency_factor: 0.5,
            batch_max_delay_ms: 2_000,
            memory_threshold_mb: 512,
            evict_fraction: 0.25,
            cache_ttl_single_secs: 60,
            cache_ttl_multiple_secs: 300,
            cache_ttl_sector_secs: 900,
            stale_handle_secs: 300,
            sweep_interval_secs: 30,
            provider_rate_limit: 60,
            provider_rate_window_secs: 60,
            provider_timeout_ms: 5_000,
            macro_provider_url: None,
            sentiment_provider_url: None,
            esg_provider_url: None,
            short_interest_provider_url: None,
            technical_provider_url: None,
            fundamental_provider_url: None,
            quant_provider_url: None,
            news_provider_url: None,
            redis_url: None,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_url(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let config = Self {
            max_batch_size: env_or("ORCH_MAX_BATCH_SIZE", d.max_batch_size)?,
            max_concurrent_requests: env_or("ORCH_MAX_CONCURRENT_REQUESTS", d.max_concurrent_requests)?,
            default_timeout_ms: env_or("ORCH_DEFAULT_TIMEOUT_MS", d.default_timeout_ms)?,
            max_timeout_ms: env_or("ORCH_MAX_TIMEOUT_MS", d.max_timeout_ms)?,
            default_max_results: env_or("ORCH_DEFAULT_MAX_RESULTS", d.default_max_results)?,

            batch_window: env_or("ORCH_BATCH_WINDOW", d.batch_window)?,
            max_concurrent_workers: env_or("ORCH_MAX_CONCURRENT_WORKERS", d.max_concurrent_workers)?,
            batch_base_delay_ms: env_or("ORCH_BATCH_BASE_DELAY_MS", d.batch_base_delay_ms)?,
            batch_latency_factor: env_or("ORCH_BATCH_LATENCY_FACTOR", d.batch_latency_factor)?,
            batch_max_delay_ms: env_or("ORCH_BATCH_MAX_DELAY_MS", d.batch_max_delay_ms)?,
            memory_threshold_mb: env_or("ORCH_MEMORY_THRESHOLD_MB", d.memory_threshold_mb)?,
            evict_fraction: env_or("ORCH_EVICT_FRACTION", d.evict_fraction)?,

            cache_ttl_single_secs: env_or("ORCH_CACHE_TTL_SINGLE_SECS", d.cache_ttl_single_secs)?,
            cache_ttl_multiple_secs: env_or("ORCH_CACHE_TTL_MULTIPLE_SECS", d.cache_ttl_multiple_secs)?,
            cache_ttl_sector_secs: env_or("ORCH_CACHE_TTL_SECTOR_SECS", d.cache_ttl_sector_secs)?,

            stale_handle_secs: env_or("ORCH_STALE_HANDLE_SECS", d.stale_handle_secs)?,
            sweep_interval_secs: env_or("ORCH_SWEEP_INTERVAL_SECS", d.sweep_interval_secs)?,

            provider_rate_limit: env_or("ORCH_PROVIDER_RATE_LIMIT", d.provider_rate_limit)?,
            provider_rate_window_secs: env_or("ORCH_PROVIDER_RATE_WINDOW_SECS", d.provider_rate_window_secs)?,
            provider_timeout_ms: env_or("ORCH_PROVIDER_TIMEOUT_MS", d.provider_timeout_ms)?,

            macro_provider_url: env_url("MACRO_PROVIDER_URL"),
            sentiment_provider_url: env_url("SENTIMENT_PROVIDER_URL"),
            esg_provider_url: env_url("ESG_PROVIDER_URL"),
            short_interest_provider_url: env_url("SHORT_INTEREST_PROVIDER_URL"),
            technical_provider_url: env_url("TECHNICAL_PROVIDER_URL"),
            fundamental_provider_url: env_url("FUNDAMENTAL_PROVIDER_URL"),
            quant_provider_url: env_url("QUANT_PROVIDER_URL"),
            news_provider_url: env_url("NEWS_PROVIDER_URL"),

            redis_url: env_url("REDIS_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be at least 1");
        }
        if self.max_concurrent_requests == 0 {
            bail!("max_concurrent_requests must be at least 1");
        }
        if self.batch_window == 0 || self.max_concurrent_workers == 0 {
            bail!("batch_window and max_concurrent_workers must be at least 1");
        }
        if self.default_timeout_ms == 0 || self.default_timeout_ms > self.max_timeout_ms {
            bail!(
                "default_timeout_ms must be in 1..={} (got {})",
                self.max_timeout_ms,
                self.default_timeout_ms
            );
        }
        if self.default_max_results == 0 {
            bail!("default_max_results must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.evict_fraction) {
            bail!("evict_fraction must be within [0, 1] (got {})", self.evict_fraction);
        }
        if self.batch_latency_factor < 0.0 || !self.batch_latency_factor.is_finite() {
            bail!("batch_latency_factor must be a non-negative number");
        }
        if self.provider_rate_limit == 0 || self.provider_rate_window_secs == 0 {
            bail!("provider rate limit and window must be at least 1");
        }
        Ok(())
    }

    pub fn cache_ttl(&self, mode: AnalysisMode) -> Duration {
        let secs = match mode {
            AnalysisMode::Single => self.cache_ttl_single_secs,
            AnalysisMode::Multiple => self.cache_ttl_multiple_secs,
            AnalysisMode::Sector => self.cache_ttl_sector_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn stale_handle_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_handle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn memory_threshold_bytes(&self) -> u64 {
        self.memory_threshold_mb.saturating_mul(1024 * 1024)
    }
}
