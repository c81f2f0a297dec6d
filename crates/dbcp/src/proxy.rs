//! Statement proxies.
//!
//! A [`StatementProxy`] wraps one pooled raw statement and implements the same
//! [`Statement`] trait, so a reused statement behaves like a fresh one:
//!
//! - `close` is logical and idempotent. A cache-managed statement goes back
//!   to the cache instead of being closed on the server.
//! - `is_closed` reports the logical state and never reaches the driver.
//! - every other operation fails with [`Error::Closed`] after close.
//! - `cancel` evicts the statement from the cache before forwarding, since a
//!   cancelled statement may be left in an indeterminate state.
//! - `execute*` calls are timed; slow ones are reported to the
//!   [`SlowQueryListener`].
//!
//! Use [`prepare_cached`] to obtain proxies through a [`StatementCache`].

use std::backtrace::Backtrace;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::StatementCache;
use crate::error::{Error, Result};
use crate::key::StatementKey;
use crate::listener::{ExceptionListener, SlowQuery, SlowQueryListener, TracingSlowQueryLog};
use crate::pool::PoolConfig;
use crate::slot::StatementSlot;
use crate::statement::{Connection, ExecuteOutcome, QueryResult, Statement, Value, to_sql_string};

// ---------------------------------------------------------------------------
// ProxySettings
// ---------------------------------------------------------------------------

/// Collaborators and execution-logging settings shared by proxies of a pool.
#[derive(Clone)]
pub struct ProxySettings {
    log_query_execution_longer_than_ms: i64,
    log_stack_trace: bool,
    slow_query_listener: Arc<dyn SlowQueryListener>,
    exception_listener: Option<Arc<dyn ExceptionListener>>,
}

impl ProxySettings {
    /// Settings taken from a pool configuration, logging via `tracing`.
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            log_query_execution_longer_than_ms: config.log_query_execution_longer_than_ms,
            log_stack_trace: config.log_stack_trace_for_long_query_execution,
            slow_query_listener: Arc::new(TracingSlowQueryLog::for_pool(config.name.clone())),
            exception_listener: None,
        }
    }

    /// Report slow executions taking at least `threshold_ms`; negative disables.
    pub fn with_log_threshold_ms(mut self, threshold_ms: i64) -> Self {
        self.log_query_execution_longer_than_ms = threshold_ms;
        self
    }

    /// Attach a backtrace of the caller to slow execution records.
    pub fn with_stack_trace(mut self, enabled: bool) -> Self {
        self.log_stack_trace = enabled;
        self
    }

    /// Replace the slow execution listener.
    pub fn with_slow_query_listener(mut self, listener: Arc<dyn SlowQueryListener>) -> Self {
        self.slow_query_listener = listener;
        self
    }

    /// Report raw statement errors to `listener`.
    pub fn with_exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.exception_listener = Some(listener);
        self
    }

    /// The slow execution threshold, `None` when logging is disabled.
    pub fn log_threshold(&self) -> Option<Duration> {
        u64::try_from(self.log_query_execution_longer_than_ms)
            .ok()
            .map(Duration::from_millis)
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field(
                "log_query_execution_longer_than_ms",
                &self.log_query_execution_longer_than_ms,
            )
            .field("log_stack_trace", &self.log_stack_trace)
            .field("exception_listener", &self.exception_listener.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Execution timing
// ---------------------------------------------------------------------------

/// Parameters bound to a timed execution, rendered only for slow calls.
#[derive(Clone, Copy)]
enum Bound<'a> {
    Params(&'a [Value]),
    Batch(&'a [Vec<Value>]),
}

/// Reports the execution on drop, so the observation is made whether the
/// call returns, fails, panics or is abandoned.
struct ExecutionTimer<'a> {
    started: Instant,
    threshold: Duration,
    sql: &'a str,
    bound: Bound<'a>,
    settings: &'a ProxySettings,
}

impl Drop for ExecutionTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if elapsed < self.threshold {
            return;
        }
        let sql = match self.bound {
            Bound::Params(params) => to_sql_string(self.sql, params),
            Bound::Batch(batch) => format!("{} -- Batch of {} parameter sets", self.sql, batch.len()),
        };
        let backtrace = self
            .settings
            .log_stack_trace
            .then(|| Backtrace::force_capture().to_string());
        self.settings
            .slow_query_listener
            .on_slow_query(&SlowQuery {
                sql,
                elapsed,
                backtrace,
            });
    }
}

// ---------------------------------------------------------------------------
// StatementProxy
// ---------------------------------------------------------------------------

/// Caller-facing handle for a pooled statement.
pub struct StatementProxy<S: Statement> {
    slot: Arc<StatementSlot<S>>,
    cache: Option<Arc<StatementCache<S>>>,
    settings: ProxySettings,
    logically_closed: AtomicBool,
}

impl<S: Statement> StatementProxy<S> {
    /// Wrap `slot`. Pass the cache the slot belongs to, if any.
    pub fn new(
        slot: Arc<StatementSlot<S>>,
        cache: Option<Arc<StatementCache<S>>>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            slot,
            cache,
            settings,
            logically_closed: AtomicBool::new(false),
        }
    }

    /// The slot this proxy owns.
    pub fn slot(&self) -> &Arc<StatementSlot<S>> {
        &self.slot
    }

    /// The wrapped raw statement.
    pub fn target(&self) -> &Arc<S> {
        self.slot.statement()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.logically_closed.load(Ordering::SeqCst) {
            return Err(Error::Closed {
                resource_type: std::any::type_name::<S>(),
            });
        }
        Ok(())
    }

    fn forward<T>(&self, result: Result<T>) -> Result<T> {
        if let (Err(error), Some(listener)) = (&result, &self.settings.exception_listener) {
            listener.on_exception(error);
        }
        result
    }

    async fn process_close(&self) -> Result<()> {
        if self.logically_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.cache.is_some() && self.slot.is_cache_managed() && self.slot.try_release() {
            return Ok(());
        }
        // Unmanaged, or evicted while we held it: no longer cache-resident.
        self.forward(self.target().close().await)
    }

    async fn process_cancel(&self) -> Result<()> {
        if let Some(cache) = &self.cache
            && cache.remove_statement(self.target()).is_some()
        {
            tracing::debug!(
                statement = std::any::type_name::<S>(),
                "Evicted cancelled statement from cache"
            );
        }
        self.forward(self.target().cancel().await)
    }

    async fn process_execute<T, F>(&self, bound: Bound<'_>, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let sql = self.target().sql().unwrap_or_default();
        let _timer = self.settings.log_threshold().map(|threshold| ExecutionTimer {
            started: Instant::now(),
            threshold,
            sql,
            bound,
            settings: &self.settings,
        });
        self.forward(call.await)
    }
}

#[async_trait]
impl<S: Statement> Statement for StatementProxy<S> {
    fn sql(&self) -> Result<&str> {
        self.ensure_open()?;
        self.forward(self.target().sql())
    }

    async fn execute(&self, params: &[Value]) -> Result<ExecuteOutcome> {
        self.ensure_open()?;
        self.process_execute(Bound::Params(params), self.target().execute(params))
            .await
    }

    async fn execute_query(&self, params: &[Value]) -> Result<QueryResult> {
        self.ensure_open()?;
        self.process_execute(Bound::Params(params), self.target().execute_query(params))
            .await
    }

    async fn execute_update(&self, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.process_execute(Bound::Params(params), self.target().execute_update(params))
            .await
    }

    async fn execute_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<u64>> {
        self.ensure_open()?;
        self.process_execute(Bound::Batch(batch), self.target().execute_batch(batch))
            .await
    }

    async fn cancel(&self) -> Result<()> {
        self.ensure_open()?;
        self.process_cancel().await
    }

    async fn close(&self) -> Result<()> {
        self.process_close().await
    }

    fn is_closed(&self) -> bool {
        self.logically_closed.load(Ordering::SeqCst)
    }

    fn set_fetch_size(&self, rows: usize) -> Result<()> {
        self.ensure_open()?;
        self.forward(self.target().set_fetch_size(rows))
    }

    fn set_query_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        self.forward(self.target().set_query_timeout(timeout))
    }

    fn clear_parameters(&self) -> Result<()> {
        self.ensure_open()?;
        self.forward(self.target().clear_parameters())
    }

    fn warnings(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.forward(self.target().warnings())
    }

    fn clear_warnings(&self) -> Result<()> {
        self.ensure_open()?;
        self.forward(self.target().clear_warnings())
    }
}

impl<S: Statement> Drop for StatementProxy<S> {
    fn drop(&mut self) {
        if self.logically_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.cache.is_some() && self.slot.is_cache_managed() && self.slot.try_release() {
            return;
        }
        // Dropped without close: finish the real close in the background.
        let statement = Arc::clone(self.target());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                drop(handle.spawn(async move {
                    if let Err(error) = statement.close().await {
                        tracing::warn!(%error, "Failed to close dropped statement");
                    }
                }));
            }
            Err(_) => tracing::warn!(
                statement = std::any::type_name::<S>(),
                "Statement dropped without close outside a runtime; not closed"
            ),
        }
    }
}

impl<S: Statement> std::fmt::Debug for StatementProxy<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementProxy")
            .field("slot", &self.slot)
            .field("cached", &self.cache.is_some())
            .field("logically_closed", &self.logically_closed.load(Ordering::SeqCst))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

/// Obtain a proxied statement for `key`, reusing a cached one when possible.
///
/// On a cache miss the statement is created through `connection` and
/// registered. Without a cache every statement is unmanaged and really
/// closed on close.
pub async fn prepare_cached<C: Connection>(
    connection: &C,
    cache: Option<&Arc<StatementCache<C::Statement>>>,
    key: StatementKey,
    settings: &ProxySettings,
) -> Result<StatementProxy<C::Statement>> {
    let Some(cache) = cache else {
        let raw = Arc::new(connection.prepare(&key).await?);
        let slot = Arc::new(StatementSlot::unmanaged(raw));
        return Ok(StatementProxy::new(slot, None, settings.clone()));
    };

    if let Some(slot) = cache.try_reuse(&key) {
        tracing::trace!(%key, "Statement cache hit");
        return Ok(StatementProxy::new(slot, Some(Arc::clone(cache)), settings.clone()));
    }

    let raw = Arc::new(connection.prepare(&key).await?);
    let registration = cache.register(key, raw);
    if !registration.is_cached() {
        tracing::trace!("Statement not cached, using it uncached");
    }
    let (slot, evicted) = registration.into_parts();
    if let Some(evicted) = evicted
        && let Err(error) = evicted.destroy().await
    {
        tracing::warn!(%error, "Failed to close evicted statement");
    }
    Ok(StatementProxy::new(slot, Some(Arc::clone(cache)), settings.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotState;
    use crate::testing::{MockConnection, MockStatement, RecordingExceptionListener, RecordingSlowQueryLog};

    fn settings() -> ProxySettings {
        ProxySettings::default().with_log_threshold_ms(-1)
    }

    fn unmanaged(sql: &str) -> StatementProxy<MockStatement> {
        let slot = Arc::new(StatementSlot::unmanaged(Arc::new(MockStatement::new(sql))));
        StatementProxy::new(slot, None, settings())
    }

    #[tokio::test]
    async fn close_is_idempotent_for_unmanaged_statement() {
        let proxy = unmanaged("SELECT 1");
        for _ in 0..3 {
            proxy.close().await.unwrap();
        }
        assert_eq!(proxy.target().close_calls(), 1);
        assert!(proxy.is_closed());
    }

    #[tokio::test]
    async fn operations_after_close_are_rejected() {
        let proxy = unmanaged("SELECT 1");
        proxy.close().await.unwrap();

        let err = proxy.execute_query(&[]).await.unwrap_err();
        assert!(err.is_closed());
        assert!(err.to_string().contains("MockStatement"));
        assert!(proxy.execute(&[]).await.unwrap_err().is_closed());
        assert!(proxy.execute_update(&[]).await.unwrap_err().is_closed());
        assert!(proxy.execute_batch(&[]).await.unwrap_err().is_closed());
        assert!(proxy.cancel().await.unwrap_err().is_closed());
        assert!(proxy.sql().unwrap_err().is_closed());
        assert!(proxy.set_fetch_size(10).unwrap_err().is_closed());
        assert!(proxy.set_query_timeout(None).unwrap_err().is_closed());
        assert!(proxy.clear_parameters().unwrap_err().is_closed());
        assert!(proxy.warnings().unwrap_err().is_closed());
        assert!(proxy.clear_warnings().unwrap_err().is_closed());

        assert_eq!(proxy.target().execute_calls(), 0);
        assert_eq!(proxy.target().cancel_calls(), 0);
        assert!(proxy.is_closed());
    }

    #[tokio::test]
    async fn is_closed_is_not_forwarded() {
        let proxy = unmanaged("SELECT 1");
        proxy.target().close().await.unwrap();
        assert!(proxy.target().is_closed());
        assert!(!proxy.is_closed(), "logical state only");
    }

    #[tokio::test]
    async fn passthrough_calls_reach_the_statement() {
        let proxy = unmanaged("SELECT 1");
        proxy.set_fetch_size(250).unwrap();
        assert_eq!(proxy.target().fetch_size(), 250);
        assert_eq!(proxy.sql().unwrap(), "SELECT 1");
    }

    #[tokio::test]
    async fn close_returns_cached_statement_to_cache() {
        let cache = Arc::new(StatementCache::new(8));
        let conn = MockConnection::new();
        let key = StatementKey::prepared("SELECT 1");

        let proxy = prepare_cached(&conn, Some(&cache), key.clone(), &settings())
            .await
            .unwrap();
        proxy.close().await.unwrap();
        proxy.close().await.unwrap();

        assert_eq!(proxy.slot().state(), Some(SlotState::Available));
        assert_eq!(proxy.target().close_calls(), 0);
        assert!(cache.try_reuse(&key).is_some());
    }

    #[tokio::test]
    async fn forwarded_errors_reach_exception_listener_unchanged() {
        let listener = Arc::new(RecordingExceptionListener::default());
        let slot = Arc::new(StatementSlot::unmanaged(Arc::new(MockStatement::new("SELECT 1"))));
        let proxy = StatementProxy::new(
            slot,
            None,
            settings().with_exception_listener(listener.clone()),
        );
        proxy.target().fail_executions("relation does not exist");

        let err = proxy.execute_query(&[]).await.unwrap_err();
        assert_eq!(err.to_string(), "Driver error: relation does not exist");
        assert_eq!(listener.errors(), vec![err.to_string()]);
    }

    #[tokio::test]
    async fn closed_errors_are_not_reported_to_exception_listener() {
        let listener = Arc::new(RecordingExceptionListener::default());
        let slot = Arc::new(StatementSlot::unmanaged(Arc::new(MockStatement::new("SELECT 1"))));
        let proxy = StatementProxy::new(
            slot,
            None,
            settings().with_exception_listener(listener.clone()),
        );
        proxy.close().await.unwrap();
        let _ = proxy.execute(&[]).await;
        assert!(listener.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_execution_reported_once() {
        let log = Arc::new(RecordingSlowQueryLog::default());
        let proxy = StatementProxy::new(
            Arc::new(StatementSlot::unmanaged(Arc::new(
                MockStatement::new("SELECT pg_sleep(?)").with_latency(Duration::from_millis(150)),
            ))),
            None,
            settings()
                .with_log_threshold_ms(100)
                .with_slow_query_listener(log.clone()),
        );

        proxy.execute_query(&[Value::Double(0.15)]).await.unwrap();

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].sql.contains("SELECT pg_sleep(?)"));
        assert!(records[0].sql.contains("0.15"));
        assert!(records[0].elapsed_ms() >= 150);
        assert!(records[0].backtrace.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_slow_execution_is_still_reported() {
        let log = Arc::new(RecordingSlowQueryLog::default());
        let stmt = MockStatement::new("DELETE FROM t").with_latency(Duration::from_millis(200));
        stmt.fail_executions("lock timeout");
        let proxy = StatementProxy::new(
            Arc::new(StatementSlot::unmanaged(Arc::new(stmt))),
            None,
            settings()
                .with_log_threshold_ms(100)
                .with_slow_query_listener(log.clone()),
        );

        let err = proxy.execute_update(&[]).await.unwrap_err();
        assert_eq!(err.to_string(), "Driver error: lock timeout");
        assert_eq!(log.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stack_trace_attached_when_enabled() {
        let log = Arc::new(RecordingSlowQueryLog::default());
        let proxy = StatementProxy::new(
            Arc::new(StatementSlot::unmanaged(Arc::new(MockStatement::new("SELECT 1")))),
            None,
            settings()
                .with_log_threshold_ms(0)
                .with_stack_trace(true)
                .with_slow_query_listener(log.clone()),
        );
        proxy.execute(&[]).await.unwrap();
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].backtrace.is_some());
    }

    #[test]
    fn negative_threshold_disables_logging() {
        assert_eq!(settings().log_threshold(), None);
        assert_eq!(
            settings().with_log_threshold_ms(0).log_threshold(),
            Some(Duration::ZERO)
        );
    }
}
