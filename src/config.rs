use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{EngineSettings, ResolveOptions, DEFAULT_WINDOW_DAYS};
use crate::limits::{MAX_HOLD_TTL_MS, MAX_WINDOW_DAYS};

/// Server settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub window_days: u32,
    pub inclusive_end: bool,
    pub dedup_slots: bool,
    pub recheck_on_submit: bool,
    pub hold_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5480,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            window_days: DEFAULT_WINDOW_DAYS,
            inclusive_end: true,
            dedup_slots: false,
            recheck_on_submit: true,
            hold_ttl: Duration::from_secs(300),
        }
    }
}

/// Unparseable values fall back to the default, with a warning.
fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring unparseable {key}={raw:?}");
            default
        }),
    }
}

/// Like `parsed`, and values outside `range` fall back the same way.
fn bounded<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> T
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let value = parsed(lookup, key, default);
    if range.contains(&value) {
        return value;
    }
    tracing::warn!(
        "ignoring out of range {key}={value} (expected {}..={})",
        range.start(),
        range.end()
    );
    default
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => default,
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                tracing::warn!("ignoring unparseable {key}={v:?}");
                default
            }
        },
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&lookup, "SLOTBOOK_PORT", d.port),
            bind: lookup("SLOTBOOK_BIND").unwrap_or(d.bind),
            data_dir: lookup("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("SLOTBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "SLOTBOOK_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port: lookup("SLOTBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            window_days: bounded(&lookup, "SLOTBOOK_WINDOW_DAYS", d.window_days, 1..=MAX_WINDOW_DAYS),
            inclusive_end: flag(&lookup, "SLOTBOOK_INCLUSIVE_END", d.inclusive_end),
            dedup_slots: flag(&lookup, "SLOTBOOK_DEDUP_SLOTS", d.dedup_slots),
            recheck_on_submit: flag(&lookup, "SLOTBOOK_RECHECK_ON_SUBMIT", d.recheck_on_submit),
            hold_ttl: Duration::from_secs(bounded(
                &lookup,
                "SLOTBOOK_HOLD_TTL_SECS",
                d.hold_ttl.as_secs(),
                1..=(MAX_HOLD_TTL_MS / 1000) as u64,
            )),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            window_days: self.window_days,
            inclusive_end: self.inclusive_end,
            dedup: self.dedup_slots,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings { recheck_on_submit: self.recheck_on_submit }
    }

    pub fn hold_ttl_ms(&self) -> i64 {
        i64::try_from(self.hold_ttl.as_millis()).unwrap_or(i64::MAX)
    }
}
