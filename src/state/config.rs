//! State controller configuration.
//!
//! Every field has a default, so an empty document (or `StateConfig::default()`)
//! gives an unbounded in-memory cache with no lock timeout.

use std::time::Duration;

use serde::Deserialize;

use crate::store::StoreBackend;
use crate::{MuninnError, Result};

/// Default number of entities buffered between a stream's producer task and
/// its consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Default period of the background sweep of dead references.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Tuning for a [`StateController`](super::StateController).
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Upper bound on waiting for a per-id lock, in milliseconds
    /// (default: wait indefinitely).
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
    /// Stream buffer size (default: 64).
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Provider for model types without a registered one (default: memory).
    #[serde(default)]
    pub store_backend: StoreBackend,
    /// Capacity of each in-memory store (default: unbounded).
    #[serde(default)]
    pub max_models_per_store: Option<u64>,
    /// Period of the sweep that purges dead references on the operation
    /// queue, in milliseconds (default: 60s; `null` disables it).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: Option<u64>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: None,
            stream_buffer: default_stream_buffer(),
            store_backend: StoreBackend::default(),
            max_models_per_store: None,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_stream_buffer() -> usize {
    DEFAULT_STREAM_BUFFER
}

fn default_sweep_interval_ms() -> Option<u64> {
    Some(DEFAULT_SWEEP_INTERVAL_MS)
}

impl StateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_timeout_ms(mut self, millis: u64) -> Self {
        self.lock_timeout_ms = Some(millis);
        self
    }

    pub fn stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size;
        self
    }

    pub fn store_backend(mut self, backend: StoreBackend) -> Self {
        self.store_backend = backend;
        self
    }

    pub fn max_models_per_store(mut self, max: u64) -> Self {
        self.max_models_per_store = Some(max);
        self
    }

    pub fn sweep_interval_ms(mut self, millis: u64) -> Self {
        self.sweep_interval_ms = Some(millis);
        self
    }

    /// Leave dead references to handle drops, lookups and manual sweeps.
    pub fn disable_periodic_sweep(mut self) -> Self {
        self.sweep_interval_ms = None;
        self
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms.map(Duration::from_millis)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.stream_buffer == 0 {
            return Err(MuninnError::Configuration(
                "stream_buffer must be at least 1".to_owned(),
            ));
        }
        if self.max_models_per_store == Some(0) {
            return Err(MuninnError::Configuration(
                "max_models_per_store must be at least 1".to_owned(),
            ));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(MuninnError::Configuration(
                "sweep_interval_ms must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
