//! Observation hooks for statement proxies.
//!
//! Slow executions are reported to a [`SlowQueryListener`]; errors raised by
//! a raw statement are reported to an [`ExceptionListener`] before they reach
//! the caller. Listeners observe only: they cannot change a call's outcome.

use std::fmt;
use std::time::Duration;

use crate::error::Error;

// ---------------------------------------------------------------------------
// SlowQuery
// ---------------------------------------------------------------------------

/// A statement execution that took at least the configured threshold.
#[derive(Debug, Clone)]
pub struct SlowQuery {
    /// SQL text with rendered parameter values.
    pub sql: String,
    /// Wall-clock time the execution took.
    pub elapsed: Duration,
    /// Backtrace of the calling code, when enabled.
    pub backtrace: Option<String>,
}

impl SlowQuery {
    /// Elapsed time in whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u128 {
        self.elapsed.as_millis()
    }
}

impl fmt::Display for SlowQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SQL query \"{}\" execution took {}ms",
            self.sql,
            self.elapsed_ms()
        )?;
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\n{backtrace}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Listener traits
// ---------------------------------------------------------------------------

/// Receives slow statement executions.
pub trait SlowQueryListener: Send + Sync {
    /// Called once per execution at or above the threshold.
    fn on_slow_query(&self, query: &SlowQuery);
}

/// Receives errors raised by raw statements.
///
/// Typically implemented by the logical connection owning the statement, so
/// it can decide whether the physical connection is still usable.
pub trait ExceptionListener: Send + Sync {
    /// Called before the error is returned to the caller.
    fn on_exception(&self, error: &Error);
}

// ---------------------------------------------------------------------------
// Built-in listeners
// ---------------------------------------------------------------------------

/// Logs slow executions via `tracing::warn!`.
#[derive(Debug, Clone, Default)]
pub struct TracingSlowQueryLog {
    pool: Option<String>,
}

impl TracingSlowQueryLog {
    /// A log that tags records with the pool name.
    pub fn for_pool(pool: impl Into<String>) -> Self {
        Self {
            pool: Some(pool.into()),
        }
    }
}

impl SlowQueryListener for TracingSlowQueryLog {
    fn on_slow_query(&self, query: &SlowQuery) {
        tracing::warn!(
            pool = self.pool.as_deref().unwrap_or_default(),
            elapsed_ms = query.elapsed_ms() as u64,
            "{query}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_query_display_contains_sql_and_elapsed() {
        let query = SlowQuery {
            sql: "SELECT 1".into(),
            elapsed: Duration::from_millis(150),
            backtrace: None,
        };
        assert_eq!(query.to_string(), "SQL query \"SELECT 1\" execution took 150ms");
    }

    #[test]
    fn slow_query_display_appends_backtrace() {
        let query = SlowQuery {
            sql: "SELECT 1".into(),
            elapsed: Duration::from_millis(5),
            backtrace: Some("at frame 0".into()),
        };
        let shown = query.to_string();
        assert!(shown.ends_with("\nat frame 0"));
    }

    #[test]
    fn tracing_log_accepts_records_without_subscriber() {
        let log = TracingSlowQueryLog::for_pool("p1");
        log.on_slow_query(&SlowQuery {
            sql: "SELECT 1".into(),
            elapsed: Duration::from_millis(1),
            backtrace: None,
        });
    }
}
