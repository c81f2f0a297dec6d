//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reducer::ReducerConfig;

/// Configuration for a pool, its statement caches and its reducer
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PoolConfig {
    /// Pool name used in log records
    pub name: String,
    /// Number of objects created up front; the reducer never shrinks below it
    pub initial_size: usize,
    /// Maximum number of objects handed out at once
    pub max_size: usize,
    /// Timeout for acquiring an object from the pool
    pub acquire_timeout: Duration,
    /// Statements cached per connection; 0 disables statement caching
    pub statement_cache_max_size: usize,
    /// Executions taking at least this many milliseconds are logged; negative disables
    pub log_query_execution_longer_than_ms: i64,
    /// Attach the caller's backtrace to slow execution records
    pub log_stack_trace_for_long_query_execution: bool,
    /// Idle reduction schedule
    pub reducer: ReducerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "dbcp".to_string(),
            initial_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            statement_cache_max_size: 0,
            log_query_execution_longer_than_ms: 3000,
            log_stack_trace_for_long_query_execution: false,
            reducer: ReducerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be greater than 0"));
        }
        if self.initial_size > self.max_size {
            return Err(Error::configuration(format!(
                "initial_size ({}) must not exceed max_size ({})",
                self.initial_size, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::configuration(
                "acquire_timeout must be greater than zero",
            ));
        }
        if self.reducer.enabled {
            self.reducer.validate()?;
        }
        Ok(())
    }

    /// Whether connections of this pool cache statements.
    #[must_use]
    pub fn statement_caching(&self) -> bool {
        self.statement_cache_max_size > 0
    }
}
