use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::limiter::{RateLimitConfig, RateLimitRule};

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_queue_max_attempts")]
    pub queue_max_attempts: u32,
    #[serde(default = "default_queue_backoff_ms")]
    pub queue_backoff_ms: u64,
    #[serde(default = "default_queue_tick_ms")]
    pub queue_tick_ms: u64,
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    #[serde(default = "default_stale_sweep_ms")]
    pub stale_sweep_ms: u64,
    #[serde(default = "default_limiter_gc_ms")]
    pub limiter_gc_ms: u64,
    #[serde(default = "default_crdt_rule")]
    pub rate_limit_crdt: RateLimitRule,
    #[serde(default = "default_awareness_rule")]
    pub rate_limit_awareness: RateLimitRule,
    #[serde(default = "DocumentBackend::default")]
    pub document_backend: DocumentBackend,
    #[serde(default)]
    pub document_api_url: Option<String>,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            session_ttl_secs: default_session_ttl_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            queue_max_attempts: default_queue_max_attempts(),
            queue_backoff_ms: default_queue_backoff_ms(),
            queue_tick_ms: default_queue_tick_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            stale_sweep_ms: default_stale_sweep_ms(),
            limiter_gc_ms: default_limiter_gc_ms(),
            rate_limit_crdt: default_crdt_rule(),
            rate_limit_awareness: default_awareness_rule(),
            document_backend: DocumentBackend::default(),
            document_api_url: None,
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl HubConfig {
    const BIND_ADDRESS_ENV: &'static str = "COWRITE_BIND_ADDRESS";
    const SESSION_TTL_ENV: &'static str = "COWRITE_SESSION_TTL_SECS";
    const CACHE_TTL_ENV: &'static str = "COWRITE_CACHE_TTL_SECS";
    const QUEUE_MAX_ATTEMPTS_ENV: &'static str = "COWRITE_QUEUE_MAX_ATTEMPTS";
    const QUEUE_BACKOFF_ENV: &'static str = "COWRITE_QUEUE_BACKOFF_MS";
    const QUEUE_TICK_ENV: &'static str = "COWRITE_QUEUE_TICK_MS";
    const JOB_TIMEOUT_ENV: &'static str = "COWRITE_JOB_TIMEOUT_MS";
    const STALE_SWEEP_ENV: &'static str = "COWRITE_STALE_SWEEP_MS";
    const LIMITER_GC_ENV: &'static str = "COWRITE_LIMITER_GC_MS";
    const RATE_LIMIT_CRDT_ENV: &'static str = "COWRITE_RATE_LIMIT_CRDT";
    const RATE_LIMIT_AWARENESS_ENV: &'static str = "COWRITE_RATE_LIMIT_AWARENESS";
    const DOCUMENT_BACKEND_ENV: &'static str = "COWRITE_DOCUMENT_BACKEND";
    const DOCUMENT_API_URL_ENV: &'static str = "COWRITE_DOCUMENT_API_URL";
    const OUTBOUND_BUFFER_ENV: &'static str = "COWRITE_OUTBOUND_BUFFER";

    /// Assemble configuration from the environment. Invalid values refuse
    /// startup rather than run with silently-wrong limits.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = env::var(Self::BIND_ADDRESS_ENV) {
            config.bind_address = addr
                .parse()
                .with_context(|| format!("invalid {}", Self::BIND_ADDRESS_ENV))?;
        }

        read_u64(Self::SESSION_TTL_ENV, &mut config.session_ttl_secs)?;
        read_u64(Self::CACHE_TTL_ENV, &mut config.cache_ttl_secs)?;
        read_u32(Self::QUEUE_MAX_ATTEMPTS_ENV, &mut config.queue_max_attempts)?;
        read_u64(Self::QUEUE_BACKOFF_ENV, &mut config.queue_backoff_ms)?;
        read_u64(Self::QUEUE_TICK_ENV, &mut config.queue_tick_ms)?;
        read_u64(Self::JOB_TIMEOUT_ENV, &mut config.job_timeout_ms)?;
        read_u64(Self::STALE_SWEEP_ENV, &mut config.stale_sweep_ms)?;
        read_u64(Self::LIMITER_GC_ENV, &mut config.limiter_gc_ms)?;

        if let Ok(raw) = env::var(Self::RATE_LIMIT_CRDT_ENV) {
            config.rate_limit_crdt = parse_rule(&raw)
                .with_context(|| format!("invalid {}", Self::RATE_LIMIT_CRDT_ENV))?;
        }
        if let Ok(raw) = env::var(Self::RATE_LIMIT_AWARENESS_ENV) {
            config.rate_limit_awareness = parse_rule(&raw)
                .with_context(|| format!("invalid {}", Self::RATE_LIMIT_AWARENESS_ENV))?;
        }

        if let Ok(backend) = env::var(Self::DOCUMENT_BACKEND_ENV) {
            config.document_backend = DocumentBackend::from_str(&backend)?;
        }
        if let Ok(url) = env::var(Self::DOCUMENT_API_URL_ENV) {
            let trimmed = url.trim().to_owned();
            if !trimmed.is_empty() {
                config.document_api_url = Some(trimmed);
            }
        }

        if let Ok(raw) = env::var(Self::OUTBOUND_BUFFER_ENV) {
            config.outbound_buffer = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {}", Self::OUTBOUND_BUFFER_ENV))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.queue_max_attempts > 0, "queue max attempts must be positive");
        anyhow::ensure!(self.queue_tick_ms > 0, "queue tick must be positive");
        anyhow::ensure!(self.outbound_buffer > 0, "outbound buffer must be positive");
        if self.document_backend == DocumentBackend::Http {
            anyhow::ensure!(
                self.document_api_url.is_some(),
                "{} requires {}",
                Self::DOCUMENT_BACKEND_ENV,
                Self::DOCUMENT_API_URL_ENV
            );
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn queue_backoff(&self) -> Duration {
        Duration::from_millis(self.queue_backoff_ms)
    }

    pub fn queue_tick(&self) -> Duration {
        Duration::from_millis(self.queue_tick_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.stale_sweep_ms)
    }

    pub fn limiter_gc_interval(&self) -> Duration {
        Duration::from_millis(self.limiter_gc_ms)
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.rate_limit_crdt, self.rate_limit_awareness)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentBackend {
    /// In-process document table; the all-in-one deployment.
    Memory,
    /// REST client against a separately deployed document service.
    Http,
}

impl Default for DocumentBackend {
    fn default() -> Self {
        DocumentBackend::Memory
    }
}

impl FromStr for DocumentBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(DocumentBackend::Memory),
            "http" | "rest" => Ok(DocumentBackend::Http),
            other => Err(anyhow::anyhow!(
                "unsupported document backend '{other}' (expected 'memory' or 'http')"
            )),
        }
    }
}

/// Rules come from the environment as `max:window_ms:block_ms`.
fn parse_rule(raw: &str) -> Result<RateLimitRule> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    anyhow::ensure!(
        parts.len() == 3,
        "expected max:window_ms:block_ms, got '{raw}'"
    );
    Ok(RateLimitRule::new(
        parts[0].parse().context("max messages")?,
        parts[1].parse().context("window ms")?,
        parts[2].parse().context("block ms")?,
    ))
}

fn read_u64(var: &str, target: &mut u64) -> Result<()> {
    if let Ok(raw) = env::var(var) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {var} (expected integer)"))?;
    }
    Ok(())
}

fn read_u32(var: &str, target: &mut u32) -> Result<()> {
    if let Ok(raw) = env::var(var) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {var} (expected integer)"))?;
    }
    Ok(())
}

fn default_bind_address() -> SocketAddr {
    "127.0.0.1:8085"
        .parse()
        .expect("default bind address must be valid")
}

fn default_session_ttl_secs() -> u64 {
    300
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_queue_max_attempts() -> u32 {
    3
}

fn default_queue_backoff_ms() -> u64 {
    5000
}

fn default_queue_tick_ms() -> u64 {
    1000
}

fn default_job_timeout_ms() -> u64 {
    30_000
}

fn default_stale_sweep_ms() -> u64 {
    600_000
}

fn default_limiter_gc_ms() -> u64 {
    300_000
}

fn default_crdt_rule() -> RateLimitRule {
    RateLimitConfig::DEFAULT_CRDT
}

fn default_awareness_rule() -> RateLimitRule {
    RateLimitConfig::DEFAULT_AWARENESS
}

fn default_outbound_buffer() -> usize {
    64
}
