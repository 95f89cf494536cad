//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::TenantId;

/// Tuning knobs of the scheduler and its engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Share of each queue's daily quota held back, in percent.
    pub daily_quota_reserve: u32,
    /// Concurrency cap per queue and request pacing rate.
    pub rate_limit_per_second: u32,
    /// Scheduler tick period in milliseconds.
    pub check_interval_ms: u64,
    /// TTL of a started or resumed task in milliseconds.
    pub task_execution_timeout_ms: u64,
    /// TTL of a suspended task in milliseconds.
    pub task_suspension_timeout_ms: u64,
    /// Retries allowed after the initial attempt.
    pub max_retry_count: u32,
    /// Operation of top-level sync tasks whose completion purges their queue.
    pub root_operation: String,
    /// Log the remaining quota every this many calls.
    pub quota_dump_period: u32,
    /// Channels accepted by worker enqueue requests; empty accepts any.
    pub known_channels: Vec<TenantId>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            daily_quota_reserve: 20,
            rate_limit_per_second: 1,
            check_interval_ms: 1000,
            task_execution_timeout_ms: 5 * 60 * 1000,
            task_suspension_timeout_ms: 3 * 60 * 60 * 1000,
            max_retry_count: 1,
            root_operation: "syncShop".into(),
            quota_dump_period: 5,
            known_channels: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.daily_quota_reserve > 100 {
            return Err("daily_quota_reserve must be within 0..=100".into());
        }
        if self.rate_limit_per_second == 0 {
            return Err("rate_limit_per_second must be greater than 0".into());
        }
        if self.check_interval_ms == 0 {
            return Err("check_interval_ms must be greater than 0".into());
        }
        if self.task_execution_timeout_ms == 0 {
            return Err("task_execution_timeout_ms must be greater than 0".into());
        }
        if self.task_suspension_timeout_ms == 0 {
            return Err("task_suspension_timeout_ms must be greater than 0".into());
        }
        if self.quota_dump_period == 0 {
            return Err("quota_dump_period must be greater than 0".into());
        }
        if self.root_operation.is_empty() {
            return Err("root_operation must not be empty".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `MANAGER_*` environment variables, after
    /// loading a `.env` file if one is present.
    pub fn from_env() -> Result<Self, String> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(format!(".env error: {e}"));
            }
        }
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by the `MANAGER_*` entries of `vars`.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = Self::default();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                "MANAGER_DAILY_QUOTA_RESERVE" => cfg.daily_quota_reserve = parse_var(key.as_ref(), value)?,
                "MANAGER_RATE_LIMIT_PER_SECOND" => cfg.rate_limit_per_second = parse_var(key.as_ref(), value)?,
                "MANAGER_CHECK_INTERVAL_MS" => cfg.check_interval_ms = parse_var(key.as_ref(), value)?,
                "MANAGER_TASK_EXECUTION_TIMEOUT_MS" => {
                    cfg.task_execution_timeout_ms = parse_var(key.as_ref(), value)?;
                }
                "MANAGER_TASK_SUSPENSION_TIMEOUT_MS" => {
                    cfg.task_suspension_timeout_ms = parse_var(key.as_ref(), value)?;
                }
                "MANAGER_MAX_RETRY_COUNT" => cfg.max_retry_count = parse_var(key.as_ref(), value)?,
                "MANAGER_ROOT_OPERATION" => cfg.root_operation = value.to_owned(),
                "MANAGER_QUOTA_DUMP_PERIOD" => cfg.quota_dump_period = parse_var(key.as_ref(), value)?,
                "MANAGER_KNOWN_CHANNELS" => {
                    cfg.known_channels = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| parse_var(key.as_ref(), s))
                        .collect::<Result<_, _>>()?;
                }
                _ => {}
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Tick period.
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Whether worker enqueue requests may name `channel_id`.
    pub fn accepts_channel(&self, channel_id: TenantId) -> bool {
        self.known_channels.is_empty() || self.known_channels.contains(&channel_id)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| format!("{key}: {e}"))
}
