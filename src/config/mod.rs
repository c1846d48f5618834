//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. The database URL
//! is wrapped in `secrecy::SecretString` to keep credentials out of logs.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Claim lifecycle knobs shared by the task manager and the reclaim sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimConfig {
    /// How long a claim may sit untouched before the sweep takes it back.
    pub claim_timeout: Duration,
    /// Reclaim sweep period. Always shorter than `claim_timeout`.
    pub sweep_interval: Duration,
    /// A task whose retry count would exceed this is dead-lettered.
    pub max_retries: u32,
    /// Lost races tolerated by one `claim_next` call.
    pub claim_attempts: u32,
    /// Stale claims examined per sweep.
    pub sweep_batch: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            max_retries: 3,
            claim_attempts: 16,
            sweep_batch: 100,
        }
    }
}

impl ClaimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.claim_timeout.is_zero() {
            return Err(Error::Config("CLAIM_TIMEOUT_SECS must be positive".to_string()));
        }
        if self.sweep_interval.is_zero() || self.sweep_interval >= self.claim_timeout {
            return Err(Error::Config(format!(
                "SWEEP_INTERVAL_SECS ({}s) must be positive and shorter than CLAIM_TIMEOUT_SECS ({}s)",
                self.sweep_interval.as_secs(),
                self.claim_timeout.as_secs()
            )));
        }
        if self.claim_attempts == 0 {
            return Err(Error::Config("CLAIM_ATTEMPTS must be at least 1".to_string()));
        }
        if self.sweep_batch == 0 {
            return Err(Error::Config("SWEEP_BATCH must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Queue processor knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// pgmq queue carrying upstream items.
    pub queue_name: String,
    /// Visibility timeout for pgmq reads.
    pub visibility_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            queue_name: "review_items".to_string(),
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("INGEST_POLL_INTERVAL_SECS must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("INGEST_BATCH must be at least 1".to_string()));
        }
        if self.queue_name.trim().is_empty() {
            return Err(Error::Config("INGEST_QUEUE must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Config {
    /// `None` runs against the in-memory store.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub bind_addr: SocketAddr,
    pub claim: ClaimConfig,
    pub ingest: IngestConfig,
    pub session_ttl: Duration,
    pub observer_queue_capacity: usize,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let claim = ClaimConfig {
            claim_timeout: secs(&lookup, "CLAIM_TIMEOUT_SECS", 30 * 60)?,
            sweep_interval: secs(&lookup, "SWEEP_INTERVAL_SECS", 60)?,
            max_retries: parsed(&lookup, "MAX_RETRIES", 3)?,
            claim_attempts: parsed(&lookup, "CLAIM_ATTEMPTS", 16)?,
            sweep_batch: parsed(&lookup, "SWEEP_BATCH", 100)?,
        };
        claim.validate()?;

        let ingest = IngestConfig {
            poll_interval: secs(&lookup, "INGEST_POLL_INTERVAL_SECS", 5)?,
            batch_size: parsed(&lookup, "INGEST_BATCH", 50)?,
            queue_name: lookup("INGEST_QUEUE").unwrap_or_else(|| "review_items".to_string()),
            visibility_timeout: secs(&lookup, "INGEST_VISIBILITY_SECS", 60)?,
        };
        ingest.validate()?;

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .filter(|url| !url.trim().is_empty())
                .map(SecretString::from),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            bind_addr: parsed(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            claim,
            ingest,
            session_ttl: secs(&lookup, "SESSION_TTL_SECS", 8 * 60 * 60)?,
            observer_queue_capacity: parsed(&lookup, "OBSERVER_QUEUE_CAPACITY", 256)?,
            shutdown_grace: secs(&lookup, "SHUTDOWN_GRACE_SECS", 10)?,
        })
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    parsed(lookup, name, default).map(Duration::from_secs)
}
