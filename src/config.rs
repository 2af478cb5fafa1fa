// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::translate::is_cidr;
use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Controller configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster identity baked into every ownership tag
    pub cluster_name: String,
    pub region: String,
    /// Which cloud backend implementation to drive; only `memory` ships in-tree
    pub cloud_backend: String,
    pub workers: usize,
    pub resync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_qps: f64,
    pub rate_limit_burst: u32,
    /// How long a caller may be suspended by the rate limiter before giving up
    pub rate_limit_max_wait: Duration,
    pub call_timeout: Duration,
    pub instance_cache_ttl: Duration,
    pub target_batch_size: usize,
    pub shutdown_grace: Duration,
    pub health_check_source_ranges: Vec<String>,
    pub internal_source_ranges: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster_name: "kubernetes".to_string(),
            region: "local-1".to_string(),
            cloud_backend: "memory".to_string(),
            workers: 4,
            resync_interval: Duration::from_secs(300),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            rate_limit_qps: 10.0,
            rate_limit_burst: 20,
            rate_limit_max_wait: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            instance_cache_ttl: Duration::from_secs(300),
            target_batch_size: 20,
            shutdown_grace: Duration::from_secs(30),
            health_check_source_ranges: vec!["10.0.0.0/8".to_string()],
            internal_source_ranges: vec!["10.0.0.0/8".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let cluster_name = lookup("CLUSTER_NAME").context("CLUSTER_NAME environment variable not set")?;
        if cluster_name.trim().is_empty() {
            bail!("CLUSTER_NAME must not be empty");
        }

        let cloud_backend = lookup("CLOUD_BACKEND").unwrap_or(defaults.cloud_backend);
        if cloud_backend != "memory" {
            bail!("Unsupported CLOUD_BACKEND '{}', expected 'memory'", cloud_backend);
        }

        let workers: usize = parse_or(&lookup, "WORKERS", defaults.workers)?;
        if workers == 0 {
            bail!("WORKERS must be at least 1");
        }
        let target_batch_size: usize = parse_or(&lookup, "TARGET_BATCH_SIZE", defaults.target_batch_size)?;
        if target_batch_size == 0 {
            bail!("TARGET_BATCH_SIZE must be at least 1");
        }
        let rate_limit_qps: f64 = parse_or(&lookup, "CLOUD_RATE_LIMIT_QPS", defaults.rate_limit_qps)?;
        if !(rate_limit_qps > 0.0) {
            bail!("CLOUD_RATE_LIMIT_QPS must be positive");
        }

        Ok(Config {
            cluster_name,
            region: lookup("CLOUD_REGION").unwrap_or(defaults.region),
            cloud_backend,
            workers,
            resync_interval: nonzero(
                "RESYNC_INTERVAL_SECS",
                secs_or(&lookup, "RESYNC_INTERVAL_SECS", defaults.resync_interval)?,
            )?,
            backoff_base: nonzero(
                "BACKOFF_BASE_MS",
                Duration::from_millis(parse_or(
                    &lookup,
                    "BACKOFF_BASE_MS",
                    defaults.backoff_base.as_millis() as u64,
                )?),
            )?,
            backoff_max: nonzero(
                "BACKOFF_MAX_SECS",
                secs_or(&lookup, "BACKOFF_MAX_SECS", defaults.backoff_max)?,
            )?,
            rate_limit_qps,
            rate_limit_burst: parse_or(&lookup, "CLOUD_RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            rate_limit_max_wait: secs_or(&lookup, "CLOUD_RATE_LIMIT_MAX_WAIT_SECS", defaults.rate_limit_max_wait)?,
            call_timeout: nonzero(
                "CLOUD_CALL_TIMEOUT_SECS",
                secs_or(&lookup, "CLOUD_CALL_TIMEOUT_SECS", defaults.call_timeout)?,
            )?,
            instance_cache_ttl: secs_or(&lookup, "INSTANCE_CACHE_TTL_SECS", defaults.instance_cache_ttl)?,
            target_batch_size,
            shutdown_grace: secs_or(&lookup, "SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            health_check_source_ranges: cidrs_or(
                &lookup,
                "HEALTH_CHECK_SOURCE_RANGES",
                defaults.health_check_source_ranges,
            )?,
            internal_source_ranges: cidrs_or(&lookup, "INTERNAL_SOURCE_RANGES", defaults.internal_source_ranges)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value '{}' for {}", raw, key)),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn nonzero(key: &str, value: Duration) -> Result<Duration> {
    if value.is_zero() {
        bail!("{} must be greater than zero", key);
    }
    Ok(value)
}

/// Comma-separated CIDR list; every entry must parse
fn cidrs_or<F>(lookup: &F, key: &str, default: Vec<String>) -> Result<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let ranges: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(bad) = ranges.iter().find(|r| !is_cidr(r)) {
        bail!("Invalid CIDR '{}' in {}", bad, key);
    }
    Ok(ranges)
}
