//! Build any pool flavor from one registry plus configuration.

use crate::config::{AutoScaleConfig, PoolConfig, UnitConfig};
use crate::core::{
    AutoScalingPool, AutoScalingReusablePool, PoolError, ReusableThread, ReusableThreadPool, Thread,
    ThreadPool, WorkRegistry,
};

/// Collects a name, registry and sizing, then builds the requested flavor.
///
/// The builder's name becomes the thread-name prefix of whatever it builds.
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    name: String,
    registry: WorkRegistry,
    pool: PoolConfig,
    autoscale: AutoScaleConfig,
}

impl PoolBuilder {
    /// Builder with default fixed and autoscaling settings.
    #[must_use]
    pub fn new(name: impl Into<String>, registry: WorkRegistry) -> Self {
        Self {
            name: name.into(),
            registry,
            pool: PoolConfig::default(),
            autoscale: AutoScaleConfig::default(),
        }
    }

    /// Configured pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings used for the fixed-size flavors.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.pool
    }

    /// Settings used for the autoscaling flavors.
    #[must_use]
    pub const fn autoscale_config(&self) -> &AutoScaleConfig {
        &self.autoscale
    }

    /// Replace the fixed-size settings.
    #[must_use]
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Replace the autoscaling settings.
    #[must_use]
    pub fn with_autoscale(mut self, config: AutoScaleConfig) -> Self {
        self.autoscale = config;
        self
    }

    /// Set the unit count of the fixed-size flavors.
    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        self.pool.size = size;
        self
    }

    /// Set bootstrap imports for every flavor.
    #[must_use]
    pub fn with_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let imports: Vec<String> = imports.into_iter().map(Into::into).collect();
        self.pool.unit.imports.clone_from(&imports);
        self.autoscale.unit.imports = imports;
        self
    }

    /// Build a [`ThreadPool`].
    ///
    /// # Errors
    ///
    /// Propagates configuration and spawn failures.
    pub fn build_fixed(&self) -> Result<ThreadPool, PoolError> {
        ThreadPool::new(&self.pool_config(), self.registry.clone())
    }

    /// Build a [`ReusableThreadPool`].
    ///
    /// # Errors
    ///
    /// Propagates configuration and spawn failures.
    pub fn build_reusable(&self) -> Result<ReusableThreadPool, PoolError> {
        ReusableThreadPool::new(&self.pool_config(), self.registry.clone())
    }

    /// Build an [`AutoScalingPool`].
    ///
    /// # Errors
    ///
    /// Propagates configuration and spawn failures.
    pub fn build_autoscaling(&self) -> Result<AutoScalingPool, PoolError> {
        AutoScalingPool::new(&self.autoscale_settings(), self.registry.clone())
    }

    /// Build an [`AutoScalingReusablePool`].
    ///
    /// # Errors
    ///
    /// Propagates configuration and spawn failures.
    pub fn build_autoscaling_reusable(&self) -> Result<AutoScalingReusablePool, PoolError> {
        AutoScalingReusablePool::new(&self.autoscale_settings(), self.registry.clone())
    }

    /// Build a single [`ReusableThread`].
    ///
    /// # Errors
    ///
    /// Propagates configuration and spawn failures.
    pub fn build_thread(&self) -> Result<ReusableThread, PoolError> {
        ReusableThread::new(&self.unit_config(), self.registry.clone())
    }

    /// Build a one-shot [`Thread`] runner.
    ///
    /// # Errors
    ///
    /// Propagates configuration failures.
    pub fn build_oneshot(&self) -> Result<Thread, PoolError> {
        Thread::with_config(self.registry.clone(), self.unit_config())
    }

    fn unit_config(&self) -> UnitConfig {
        UnitConfig {
            name: self.name.clone(),
            ..self.pool.unit.clone()
        }
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool.size,
            unit: self.unit_config(),
        }
    }

    fn autoscale_settings(&self) -> AutoScaleConfig {
        let mut cfg = self.autoscale.clone();
        cfg.unit.name.clone_from(&self.name);
        cfg
    }
}
