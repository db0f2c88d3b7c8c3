//! Pool parameter resolution and the process-wide pool registry.
//!
//! Pool parameters are resolved per client from explicit overrides, then global
//! settings, then built-in defaults. The result is installed into a single
//! process-wide [`PoolRegistry`]: the last client constructed decides the
//! parameters used by every pool created afterwards, whichever client asks.
//! This is shared driver configuration, not per-instance isolation.

use crate::config::Settings;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Max connections in a pool. Further acquisitions wait for a free slot.
pub const POOL_DEFAULT_SIZE: u32 = 16;

/// Milliseconds of idle time before an idle pool is closed.
pub const POOL_DEFAULT_IDLE_TIMEOUT_MS: u64 = 3000;

/// Frequency of idle pool checks, in milliseconds.
pub const POOL_DEFAULT_REAP_INTERVAL_MS: u64 = 1000;

/// TCP keep-alive configuration for backend connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeepAlive {
    pub initial_delay_ms: Option<u64>,
}

/// Explicit per-client pool overrides. Take precedence over global settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOverrides {
    pub size: Option<u32>,
    pub idle_timeout_ms: Option<u64>,
    pub reap_interval_ms: Option<u64>,
}

impl PoolOverrides {
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_idle_timeout_ms(mut self, idle_timeout_ms: u64) -> Self {
        self.idle_timeout_ms = Some(idle_timeout_ms);
        self
    }

    pub fn with_reap_interval_ms(mut self, reap_interval_ms: u64) -> Self {
        self.reap_interval_ms = Some(reap_interval_ms);
        self
    }
}

/// Effective pool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolParams {
    pub size: u32,
    pub idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
    /// None means unlimited.
    pub max_row_size: Option<usize>,
    pub keep_alive: Option<KeepAlive>,
}

impl Default for PoolParams {
    fn default() -> Self {
        Self {
            size: POOL_DEFAULT_SIZE,
            idle_timeout_ms: POOL_DEFAULT_IDLE_TIMEOUT_MS,
            reap_interval_ms: POOL_DEFAULT_REAP_INTERVAL_MS,
            max_row_size: None,
            keep_alive: None,
        }
    }
}

impl PoolParams {
    /// Resolve pool parameters: explicit override, else global setting, else default.
    pub fn resolve(overrides: &PoolOverrides, settings: &Settings) -> Self {
        Self {
            size: overrides
                .size
                .or(settings.db_pool_size)
                .unwrap_or(POOL_DEFAULT_SIZE),
            idle_timeout_ms: overrides
                .idle_timeout_ms
                .or(settings.db_pool_idle_timeout)
                .unwrap_or(POOL_DEFAULT_IDLE_TIMEOUT_MS),
            reap_interval_ms: overrides
                .reap_interval_ms
                .or(settings.db_pool_reap_interval)
                .unwrap_or(POOL_DEFAULT_REAP_INTERVAL_MS),
            max_row_size: settings.db_max_row_size,
            keep_alive: settings.keep_alive(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        // tokio intervals panic on a zero period
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}

/// Process-wide pool configuration.
///
/// Single writer wins: every [`install`](Self::install) replaces the current
/// parameters for all clients sharing the registry. Concurrent installs with
/// different values race, and the last one is kept.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    params: RwLock<PoolParams>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every client in the process.
    pub fn global() -> Arc<PoolRegistry> {
        static REGISTRY: OnceLock<Arc<PoolRegistry>> = OnceLock::new();
        REGISTRY.get_or_init(Default::default).clone()
    }

    /// Install parameters as the process-wide pool configuration.
    pub fn install(&self, params: PoolParams) {
        let previous = match self.params.write() {
            Ok(mut current) => std::mem::replace(&mut *current, params),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), params),
        };

        if previous != params {
            info!(
                size = params.size,
                idle_timeout_ms = params.idle_timeout_ms,
                reap_interval_ms = params.reap_interval_ms,
                max_row_size = ?params.max_row_size,
                "Pool parameters updated"
            );
        } else {
            debug!("Pool parameters unchanged");
        }
    }

    /// Currently installed parameters.
    pub fn current(&self) -> PoolParams {
        match self.params.read() {
            Ok(params) => *params,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
