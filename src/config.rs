use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::allocator::AllocatorConfig;
use crate::limits::*;

/// Server settings, read once from `SLOTLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub retry_budget: u32,
    pub allocation_timeout: Option<Duration>,
    pub default_slot_minutes: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparsable values fall back to the default, like unset ones.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        Self {
            port: parsed(&lookup, "SLOTLINE_PORT").unwrap_or(5433),
            bind: lookup("SLOTLINE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("SLOTLINE_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("SLOTLINE_PASSWORD").unwrap_or_else(|| "slotline".into()),
            max_connections: parsed(&lookup, "SLOTLINE_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "SLOTLINE_COMPACT_THRESHOLD").unwrap_or(1000),
            tls_cert: lookup("SLOTLINE_TLS_CERT"),
            tls_key: lookup("SLOTLINE_TLS_KEY"),
            metrics_port: parsed(&lookup, "SLOTLINE_METRICS_PORT"),
            retry_budget: parsed(&lookup, "SLOTLINE_RETRY_BUDGET")
                .unwrap_or(DEFAULT_RETRY_BUDGET)
                .clamp(1, MAX_RETRY_BUDGET),
            allocation_timeout: parsed(&lookup, "SLOTLINE_ALLOCATION_TIMEOUT_MS")
                .filter(|&ms: &u64| ms > 0)
                .map(Duration::from_millis),
            default_slot_minutes: parsed(&lookup, "SLOTLINE_DEFAULT_SLOT_MINUTES")
                .filter(|m: &u32| (1..=MAX_SLOT_MINUTES).contains(m))
                .unwrap_or(DEFAULT_SLOT_MINUTES),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotline.wal")
    }

    pub fn allocator(&self) -> AllocatorConfig {
        AllocatorConfig {
            retry_budget: self.retry_budget,
            timeout: self.allocation_timeout,
        }
    }
}
