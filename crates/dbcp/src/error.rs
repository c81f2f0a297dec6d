//! Error types for statement reuse and pool maintenance
use thiserror::Error;

/// Result type for pool and statement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared by the statement proxy, the cache and the pool reducer
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was invoked on a logically closed statement
    #[error("{resource_type} is closed.")]
    Closed {
        /// Type name of the wrapped raw statement
        resource_type: &'static str,
    },

    /// The database driver reported a failure
    #[error("Driver error: {message}")]
    Driver {
        /// The error message
        message: String,
        /// The underlying driver error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A transient failure inside the object pool
    #[error("Pool '{pool}' error: {reason}")]
    Pool {
        /// The pool name
        pool: String,
        /// The failure reason
        reason: String,
    },

    /// Acquiring an object from the pool timed out
    #[error("Timed out after {timeout_ms}ms waiting for an object from pool '{pool}'")]
    Timeout {
        /// The pool name
        pool: String,
        /// The acquire timeout in milliseconds
        timeout_ms: u64,
    },

    /// Pool or reducer configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal {
        /// The error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a driver error without an underlying source
    pub fn driver<S: Into<String>>(message: S) -> Self {
        Self::Driver {
            message: message.into(),
            source: None,
        }
    }

    /// Create a driver error wrapping the original driver failure
    pub fn driver_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Driver {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a recoverable pool error
    pub fn pool<P: Into<String>, R: Into<String>>(pool: P, reason: R) -> Self {
        Self::Pool {
            pool: pool.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Whether a background pool task may keep running after this error.
    ///
    /// Only pool-originated failures are recoverable; anything else means the
    /// pool is in a state the reducer does not understand.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Pool { .. })
    }

    /// Whether this error was raised because the statement was already closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pool_errors_are_recoverable() {
        assert!(Error::pool("p1", "busy").is_recoverable());
        assert!(!Error::internal("boom").is_recoverable());
        assert!(!Error::driver("connection reset").is_recoverable());
        assert!(!Error::configuration("bad").is_recoverable());
        assert!(
            !Error::Timeout {
                pool: "p1".into(),
                timeout_ms: 10
            }
            .is_recoverable()
        );
    }

    #[test]
    fn closed_message_names_resource_type() {
        let err = Error::Closed {
            resource_type: "my_driver::PgStatement",
        };
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "my_driver::PgStatement is closed.");
    }

    #[test]
    fn driver_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = Error::driver_with_source("write failed", io);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Driver error: write failed");
    }
}
