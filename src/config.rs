use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{DispatchConfig, SchedulerConfig};

/// Process configuration. Read from `MUNINN_*` environment variables or a
/// TOML file with the same field names; every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: Option<String>,
    pub log_level: String,
    pub tick_interval_secs: u64,
    pub max_concurrency: usize,
    pub invocation_timeout_secs: u64,
    pub failure_threshold: u32,
    /// 0 turns cleanup off.
    pub cleanup_interval_secs: u64,
    pub utc_offset_minutes: i32,
    pub notify_webhook_url: Option<String>,
    pub agents_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            log_level: "info".to_string(),
            tick_interval_secs: 60,
            max_concurrency: 8,
            invocation_timeout_secs: 300,
            failure_threshold: 5,
            cleanup_interval_secs: 21_600,
            utc_offset_minutes: 0,
            notify_webhook_url: None,
            agents_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_opt("MUNINN_DATABASE_URL").or_else(|| env_opt("DATABASE_URL")),
            log_level: env_str("MUNINN_LOG_LEVEL", &defaults.log_level),
            tick_interval_secs: env_parse("MUNINN_TICK_INTERVAL_SECS", defaults.tick_interval_secs),
            max_concurrency: env_parse("MUNINN_MAX_CONCURRENCY", defaults.max_concurrency),
            invocation_timeout_secs: env_parse(
                "MUNINN_INVOCATION_TIMEOUT_SECS",
                defaults.invocation_timeout_secs,
            ),
            failure_threshold: env_parse("MUNINN_FAILURE_THRESHOLD", defaults.failure_threshold),
            cleanup_interval_secs: env_parse(
                "MUNINN_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval_secs,
            ),
            utc_offset_minutes: env_parse("MUNINN_UTC_OFFSET_MINUTES", defaults.utc_offset_minutes),
            notify_webhook_url: env_opt("MUNINN_NOTIFY_WEBHOOK_URL"),
            agents_file: env_opt("MUNINN_AGENTS_FILE").map(PathBuf::from),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn utc_offset_secs(&self) -> i64 {
        i64::from(self.utc_offset_minutes) * 60
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs.max(1)),
            utc_offset_secs: self.utc_offset_secs(),
            cleanup_interval: (self.cleanup_interval_secs > 0)
                .then(|| Duration::from_secs(self.cleanup_interval_secs)),
            failure_threshold: self.failure_threshold,
            dispatch: DispatchConfig {
                max_concurrency: self.max_concurrency.max(1),
                invocation_timeout: Duration::from_secs(self.invocation_timeout_secs.max(1)),
            },
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
