//! Pool configuration structures.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::PoolError;
use crate::core::events::DEFAULT_EVENT_CAPACITY;

/// Default thread-name prefix.
pub const DEFAULT_POOL_NAME: &str = "task-pool";
/// Default delay before a crashed or failed unit is relaunched.
pub const DEFAULT_RESPAWN_BACKOFF_MS: u64 = 50;
/// Default bound on how long shutdown waits for units to exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2000;
/// Default autoscaling floor.
pub const DEFAULT_MIN_UNITS: usize = 2;
/// Default autoscaling ceiling.
pub const DEFAULT_MAX_UNITS: usize = 8;
/// Default control-loop period.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 5000;
/// Default idle window before a unit may be evicted.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Settings shared by every unit a pool launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Thread-name prefix for units and the reactor.
    pub name: String,
    /// Bootstrap modules each unit loads before it reports ready.
    pub imports: Vec<String>,
    /// Stack size for unit threads; the platform default when absent.
    pub thread_stack_size: Option<usize>,
    /// Delay before relaunching a unit after a crash or failed bootstrap.
    pub respawn_backoff_ms: u64,
    /// How long shutdown waits for units to exit before detaching them.
    pub shutdown_timeout_ms: u64,
    /// Buffer size of the event stream.
    pub event_capacity: usize,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_POOL_NAME.to_string(),
            imports: Vec::new(),
            thread_stack_size: None,
            respawn_backoff_ms: DEFAULT_RESPAWN_BACKOFF_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl UnitConfig {
    /// Respawn backoff as a duration.
    #[must_use]
    pub const fn respawn_backoff(&self) -> Duration {
        Duration::from_millis(self.respawn_backoff_ms)
    }

    /// Shutdown wait bound as a duration.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate unit settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than 0".into());
        }
        if self.thread_stack_size == Some(0) {
            return Err("thread_stack_size must be greater than 0".into());
        }
        if let Some(blank) = self.imports.iter().find(|name| name.trim().is_empty()) {
            return Err(format!("import name `{blank}` is blank"));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(name) = env_var("TASK_POOL_NAME") {
            self.name = name;
        }
        if let Some(imports) = env_var("TASK_POOL_IMPORTS") {
            self.imports = imports
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}

/// Configuration for the fixed and reusable pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of units.
    pub size: usize,
    /// Shared unit settings.
    #[serde(flatten)]
    pub unit: UnitConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: num_cpus::get().max(1),
            unit: UnitConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Defaults: one unit per CPU.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the unit count.
    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the thread-name prefix.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.unit.name = name.into();
        self
    }

    /// Set the bootstrap imports.
    #[must_use]
    pub fn with_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unit.imports = imports.into_iter().map(Into::into).collect();
        self
    }

    /// Set the respawn backoff.
    #[must_use]
    pub const fn with_respawn_backoff_ms(mut self, ms: u64) -> Self {
        self.unit.respawn_backoff_ms = ms;
        self
    }

    /// Set the shutdown wait bound.
    #[must_use]
    pub const fn with_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.unit.shutdown_timeout_ms = ms;
        self
    }

    /// Set the unit thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.unit.thread_stack_size = Some(bytes);
        self
    }

    /// Set the event stream buffer size.
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.unit.event_capacity = capacity;
        self
    }

    /// Validate pool configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err("size must be greater than 0".into());
        }
        self.unit.validate()
    }

    /// Validate, converting failures into [`PoolError::InvalidConfig`].
    pub(crate) fn check(&self) -> Result<(), PoolError> {
        self.validate().map_err(PoolError::InvalidConfig)
    }

    /// Parse pool configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `TASK_POOL_*` variables, reading `.env` if present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(size) = parse_env("TASK_POOL_SIZE")? {
            cfg.size = size;
        }
        cfg.unit.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Configuration for the autoscaling pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleConfig {
    /// Floor; also the initial unit count.
    pub min: usize,
    /// Ceiling.
    pub max: usize,
    /// Control-loop period.
    pub check_interval_ms: u64,
    /// Idle window after which a unit may be evicted.
    pub idle_timeout_ms: u64,
    /// Shared unit settings.
    #[serde(flatten)]
    pub unit: UnitConfig,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_UNITS,
            max: DEFAULT_MAX_UNITS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            unit: UnitConfig::default(),
        }
    }
}

impl AutoScaleConfig {
    /// Defaults: between 2 and 8 units.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the floor and ceiling.
    #[must_use]
    pub const fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Set the control-loop period.
    #[must_use]
    pub const fn with_check_interval_ms(mut self, ms: u64) -> Self {
        self.check_interval_ms = ms;
        self
    }

    /// Set the idle window.
    #[must_use]
    pub const fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set the thread-name prefix.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.unit.name = name.into();
        self
    }

    /// Set the bootstrap imports.
    #[must_use]
    pub fn with_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unit.imports = imports.into_iter().map(Into::into).collect();
        self
    }

    /// Set the respawn backoff.
    #[must_use]
    pub const fn with_respawn_backoff_ms(mut self, ms: u64) -> Self {
        self.unit.respawn_backoff_ms = ms;
        self
    }

    /// Set the shutdown wait bound.
    #[must_use]
    pub const fn with_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.unit.shutdown_timeout_ms = ms;
        self
    }

    /// Control-loop period as a duration.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Idle window as a duration.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Validate autoscaling configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.min == 0 {
            return Err("min must be greater than 0".into());
        }
        if self.min > self.max {
            return Err(format!("min ({}) must not exceed max ({})", self.min, self.max));
        }
        if self.check_interval_ms == 0 {
            return Err("check_interval_ms must be greater than 0".into());
        }
        self.unit.validate()
    }

    pub(crate) fn check(&self) -> Result<(), PoolError> {
        self.validate().map_err(PoolError::InvalidConfig)
    }

    /// Parse autoscaling configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `TASK_POOL_*` variables, reading `.env` if present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(min) = parse_env("TASK_POOL_MIN")? {
            cfg.min = min;
        }
        if let Some(max) = parse_env("TASK_POOL_MAX")? {
            cfg.max = max;
        }
        if let Some(ms) = parse_env("TASK_POOL_CHECK_INTERVAL_MS")? {
            cfg.check_interval_ms = ms;
        }
        if let Some(ms) = parse_env("TASK_POOL_IDLE_TIMEOUT_MS")? {
            cfg.idle_timeout_ms = ms;
        }
        cfg.unit.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T>(key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| format!("{key}: invalid value `{raw}`: {e}"))
        })
        .transpose()
}
