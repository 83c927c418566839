// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Immutable configuration for the TaleCast coordination service.
//!
//! The configuration is assembled once at startup and threaded through the
//! components by value; there is no hot reload. Values come from three layers,
//! later layers winning:
//!
//! 1. Built-in defaults (the constants documented on each field),
//! 2. an optional JSON file (`--config` on the binary),
//! 3. `TALECAST_*` environment variables.
//!
//! Durations are declared in seconds in the environment
//! (e.g. `TALECAST_WARM_HOLD_SECONDS=900`) and as humantime strings in the
//! file form (e.g. `"15m"`).

pub mod error;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use crate::error::Error;

/// The credit source names accepted in `credit_sources_priority`, which is
/// also the default consumption order.
pub const KNOWN_CREDIT_SOURCES: [&str; 5] = ["event", "monthly", "referral", "add_on", "free"];

/// Root configuration for the service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Inbound HTTP settings.
    pub http: HttpSettings,

    /// Credit pricing and ledger settings.
    pub credits: CreditSettings,

    /// Voice-slot pool settings.
    pub slots: SlotSettings,

    /// Background worker runtime settings.
    pub workers: WorkerSettings,
}

/// Settings for the HTTP front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpSettings {
    /// Address the server binds to.
    pub bind_address: String,

    /// Shared secret expected in `X-Admin-Token` on admin routes.
    ///
    /// An empty token disables the admin surface entirely (all admin routes
    /// answer 403).
    pub admin_token: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_owned(),
            admin_token: String::new(),
        }
    }
}

/// Settings governing credit pricing and lot consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CreditSettings {
    /// Number of story codepoints covered by one credit. Never zero.
    pub unit_size: u32,

    /// Human label for one unit, used in API summaries (e.g. `"minutes"`).
    pub unit_label: String,

    /// Credits granted from the `free` source the first time a user is seen.
    pub initial_credits: i64,

    /// Consumption order of credit sources, earliest consumed first.
    pub sources_priority: Vec<String>,
}

impl Default for CreditSettings {
    fn default() -> Self {
        Self {
            unit_size: 1000,
            unit_label: "stories".to_owned(),
            initial_credits: 0,
            sources_priority: KNOWN_CREDIT_SOURCES.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// Settings for the elastic voice-slot pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SlotSettings {
    /// Maximum number of voices simultaneously occupying a remote slot,
    /// per provider.
    pub slot_limit: usize,

    /// Minimum idle time before a voice becomes eligible for eviction.
    #[serde(with = "humantime_serde")]
    pub warm_hold: Duration,

    /// TTL of the per-voice allocation lock. A stale lock is overridden
    /// once this much time has passed.
    #[serde(with = "humantime_serde")]
    pub slot_lock_ttl: Duration,

    /// Interval between queue-drain beats.
    #[serde(with = "humantime_serde")]
    pub queue_poll_interval: Duration,

    /// Interval between idle-reclaim beats.
    #[serde(with = "humantime_serde")]
    pub reclaim_interval: Duration,

    /// Maximum queue entries dispatched per `process_queue` beat.
    pub max_dispatch_per_cycle: usize,

    /// How long a synthesis worker waits for a voice to become ready
    /// before re-enqueueing itself.
    #[serde(with = "humantime_serde")]
    pub allocation_wait_deadline: Duration,
}

impl Default for SlotSettings {
    fn default() -> Self {
        Self {
            slot_limit: 10,
            warm_hold: Duration::from_secs(900),
            slot_lock_ttl: Duration::from_secs(60),
            queue_poll_interval: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(300),
            max_dispatch_per_cycle: 10,
            allocation_wait_deadline: Duration::from_secs(120),
        }
    }
}

/// Settings for the background worker runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerSettings {
    /// Number of concurrent worker tasks.
    pub worker_count: usize,

    /// Maximum retry attempts for a retryable task failure.
    pub max_retries: u32,

    /// Base delay of the exponential backoff schedule.
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Upper bound on a single backoff delay.
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,

    /// Deadline applied to every remote provider call.
    #[serde(with = "humantime_serde")]
    pub provider_call_timeout: Duration,

    /// Interval between lot-expiration beats.
    #[serde(with = "humantime_serde")]
    pub expire_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            provider_call_timeout: Duration::from_secs(30),
            expire_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Config {
    /// Loads defaults, overlays the optional JSON file, then overlays the
    /// `TALECAST_*` environment, and validates the result.
    pub fn load(file: Option<&Path>) -> Result<Self, Error> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration file (JSON).
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::FileError {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::FileError {
            path: path.display().to_string(),
            details: e.to_string(),
        })
    }

    /// Overlays environment variables onto `self`. The `lookup` indirection
    /// keeps the overlay deterministic under test.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), Error> {
        if let Some(v) = lookup("TALECAST_BIND_ADDRESS") {
            self.http.bind_address = v;
        }
        if let Some(v) = lookup("TALECAST_ADMIN_TOKEN") {
            self.http.admin_token = v;
        }
        if let Some(v) = lookup("TALECAST_CREDITS_UNIT_SIZE") {
            self.credits.unit_size = parse(&v, "TALECAST_CREDITS_UNIT_SIZE")?;
        }
        if let Some(v) = lookup("TALECAST_CREDITS_UNIT_LABEL") {
            self.credits.unit_label = v;
        }
        if let Some(v) = lookup("TALECAST_INITIAL_CREDITS") {
            self.credits.initial_credits = parse(&v, "TALECAST_INITIAL_CREDITS")?;
        }
        if let Some(v) = lookup("TALECAST_CREDIT_SOURCES_PRIORITY") {
            self.credits.sources_priority =
                v.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(v) = lookup("TALECAST_SLOT_LIMIT") {
            self.slots.slot_limit = parse(&v, "TALECAST_SLOT_LIMIT")?;
        }
        if let Some(v) = lookup("TALECAST_WARM_HOLD_SECONDS") {
            self.slots.warm_hold = parse_secs(&v, "TALECAST_WARM_HOLD_SECONDS")?;
        }
        if let Some(v) = lookup("TALECAST_SLOT_LOCK_TTL_SECONDS") {
            self.slots.slot_lock_ttl = parse_secs(&v, "TALECAST_SLOT_LOCK_TTL_SECONDS")?;
        }
        if let Some(v) = lookup("TALECAST_QUEUE_POLL_INTERVAL_SECONDS") {
            self.slots.queue_poll_interval = parse_secs(&v, "TALECAST_QUEUE_POLL_INTERVAL_SECONDS")?;
        }
        if let Some(v) = lookup("TALECAST_RECLAIM_INTERVAL_SECONDS") {
            self.slots.reclaim_interval = parse_secs(&v, "TALECAST_RECLAIM_INTERVAL_SECONDS")?;
        }
        if let Some(v) = lookup("TALECAST_MAX_DISPATCH_PER_CYCLE") {
            self.slots.max_dispatch_per_cycle = parse(&v, "TALECAST_MAX_DISPATCH_PER_CYCLE")?;
        }
        if let Some(v) = lookup("TALECAST_ALLOCATION_WAIT_DEADLINE_SECONDS") {
            self.slots.allocation_wait_deadline =
                parse_secs(&v, "TALECAST_ALLOCATION_WAIT_DEADLINE_SECONDS")?;
        }
        if let Some(v) = lookup("TALECAST_WORKER_COUNT") {
            self.workers.worker_count = parse(&v, "TALECAST_WORKER_COUNT")?;
        }
        if let Some(v) = lookup("TALECAST_MAX_RETRIES") {
            self.workers.max_retries = parse(&v, "TALECAST_MAX_RETRIES")?;
        }
        if let Some(v) = lookup("TALECAST_PROVIDER_CALL_TIMEOUT_SECONDS") {
            self.workers.provider_call_timeout =
                parse_secs(&v, "TALECAST_PROVIDER_CALL_TIMEOUT_SECONDS")?;
        }
        Ok(())
    }

    /// Enforces the cross-field rules no layer may violate.
    pub fn validate(&self) -> Result<(), Error> {
        if self.credits.unit_size == 0 {
            return Err(Error::Validation {
                details: "credits.unit_size must be at least 1".to_owned(),
            });
        }
        if self.slots.slot_limit == 0 {
            return Err(Error::Validation {
                details: "slots.slot_limit must be at least 1".to_owned(),
            });
        }
        if self.slots.max_dispatch_per_cycle == 0 {
            return Err(Error::Validation {
                details: "slots.max_dispatch_per_cycle must be at least 1".to_owned(),
            });
        }
        if self.workers.worker_count == 0 {
            return Err(Error::Validation {
                details: "workers.worker_count must be at least 1".to_owned(),
            });
        }
        if self.credits.initial_credits < 0 {
            return Err(Error::Validation {
                details: "credits.initial_credits must not be negative".to_owned(),
            });
        }
        if self.credits.sources_priority.is_empty() {
            return Err(Error::Validation {
                details: "credits.sources_priority must not be empty".to_owned(),
            });
        }
        for source in &self.credits.sources_priority {
            if !KNOWN_CREDIT_SOURCES.contains(&source.as_str()) {
                return Err(Error::Validation {
                    details: format!("unknown credit source `{source}` in sources_priority"),
                });
            }
        }
        let mut seen = Vec::new();
        for source in &self.credits.sources_priority {
            if seen.contains(&source.as_str()) {
                return Err(Error::Validation {
                    details: format!("duplicate credit source `{source}` in sources_priority"),
                });
            }
            seen.push(source.as_str());
        }
        Ok(())
    }

    /// Position of `source` in the configured consumption order, lower
    /// consumed first. Unlisted sources sort last.
    #[must_use]
    pub fn priority_rank(&self, source: &str) -> usize {
        self.credits
            .sources_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.credits.sources_priority.len())
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::InvalidValue {
        key: key.to_owned(),
        details: e.to_string(),
    })
}

fn parse_secs(value: &str, key: &str) -> Result<Duration, Error> {
    parse::<u64>(value, key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.credits.unit_size, 1000);
        assert_eq!(config.slots.warm_hold, Duration::from_secs(900));
        assert_eq!(config.workers.max_retries, 5);
    }

    #[test]
    fn env_overlay_wins() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "TALECAST_SLOT_LIMIT" => Some("2".to_owned()),
                "TALECAST_WARM_HOLD_SECONDS" => Some("30".to_owned()),
                "TALECAST_CREDIT_SOURCES_PRIORITY" => Some("monthly, free".to_owned()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.slots.slot_limit, 2);
        assert_eq!(config.slots.warm_hold, Duration::from_secs(30));
        assert_eq!(config.credits.sources_priority, vec!["monthly", "free"]);
        config.validate().unwrap();
    }

    #[test]
    fn malformed_env_value_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "TALECAST_SLOT_LIMIT").then(|| "many".to_owned()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidValue { key, .. } if key == "TALECAST_SLOT_LIMIT"));
    }

    #[test]
    fn zero_unit_size_is_rejected() {
        let mut config = Config::default();
        config.credits.unit_size = 0;
        assert!(matches!(config.validate(), Err(Error::Validation { .. })));
    }

    #[test]
    fn unknown_source_is_rejected() {
        let mut config = Config::default();
        config.credits.sources_priority = vec!["monthly".to_owned(), "gold".to_owned()];
        assert!(matches!(config.validate(), Err(Error::Validation { .. })));
    }

    #[test]
    fn priority_rank_follows_configured_order() {
        let mut config = Config::default();
        config.credits.sources_priority = vec!["event".to_owned(), "free".to_owned()];
        assert_eq!(config.priority_rank("event"), 0);
        assert_eq!(config.priority_rank("free"), 1);
        assert_eq!(config.priority_rank("monthly"), 2);
    }
}
