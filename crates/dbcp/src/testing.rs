//! Test doubles for statements, connections, listeners and pools.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::key::StatementKey;
use crate::listener::{ExceptionListener, SlowQuery, SlowQueryListener};
use crate::reducer::ObjectPool;
use crate::statement::{Connection, ExecuteOutcome, QueryResult, Statement, Value};

// ---------------------------------------------------------------------------
// MockStatement
// ---------------------------------------------------------------------------

/// In-memory statement recording the calls it receives.
///
/// Queries return a single row echoing the bound parameters, or `1` when
/// there are none. Updates report one affected row per parameter set.
#[derive(Debug, Default)]
pub struct MockStatement {
    sql: String,
    latency: Duration,
    failure: Mutex<Option<String>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    fetch_size: AtomicUsize,
    query_timeout: Mutex<Option<Duration>>,
    warnings: Mutex<Vec<String>>,
}

impl MockStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    /// Every execution takes `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every following execution fail with a driver error.
    pub fn fail_executions(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    pub fn push_warning(&self, warning: impl Into<String>) {
        self.warnings.lock().push(warning.into());
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size.load(Ordering::SeqCst)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        *self.query_timeout.lock()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::driver("statement is closed"));
        }
        Ok(())
    }

    async fn run(&self, params: &[Value]) -> Result<QueryResult> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.check_open()?;
        if let Some(message) = self.failure.lock().clone() {
            return Err(Error::driver(message));
        }
        let row = if params.is_empty() {
            vec![Value::Int(1)]
        } else {
            params.to_vec()
        };
        Ok(QueryResult {
            columns: (1..=row.len()).map(|i| format!("col{i}")).collect(),
            rows: vec![row],
        })
    }
}

#[async_trait]
impl Statement for MockStatement {
    fn sql(&self) -> Result<&str> {
        Ok(&self.sql)
    }

    async fn execute(&self, params: &[Value]) -> Result<ExecuteOutcome> {
        self.run(params).await.map(ExecuteOutcome::Rows)
    }

    async fn execute_query(&self, params: &[Value]) -> Result<QueryResult> {
        self.run(params).await
    }

    async fn execute_update(&self, params: &[Value]) -> Result<u64> {
        self.run(params).await.map(|_| 1)
    }

    async fn execute_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<u64>> {
        self.run(&[]).await.map(|_| vec![1; batch.len()])
    }

    async fn cancel(&self) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.check_open()
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_fetch_size(&self, rows: usize) -> Result<()> {
        self.check_open()?;
        self.fetch_size.store(rows, Ordering::SeqCst);
        Ok(())
    }

    fn set_query_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.check_open()?;
        *self.query_timeout.lock() = timeout;
        Ok(())
    }

    fn clear_parameters(&self) -> Result<()> {
        self.check_open()
    }

    fn warnings(&self) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self.warnings.lock().clone())
    }

    fn clear_warnings(&self) -> Result<()> {
        self.check_open()?;
        self.warnings.lock().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockConnection
// ---------------------------------------------------------------------------

/// Connection producing [`MockStatement`]s.
#[derive(Debug, Default)]
pub struct MockConnection {
    prepare_calls: AtomicUsize,
    latency: Duration,
    failure: Mutex<Option<String>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements created from now on take `latency` per execution.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every following `prepare` fail with a driver error.
    pub fn fail_prepares(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    type Statement = MockStatement;

    async fn prepare(&self, key: &StatementKey) -> Result<MockStatement> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failure.lock().clone() {
            return Err(Error::driver(message));
        }
        Ok(MockStatement::new(key.sql()).with_latency(self.latency))
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Slow query listener keeping every record.
#[derive(Debug, Default)]
pub struct RecordingSlowQueryLog {
    records: Mutex<Vec<SlowQuery>>,
}

impl RecordingSlowQueryLog {
    pub fn records(&self) -> Vec<SlowQuery> {
        self.records.lock().clone()
    }
}

impl SlowQueryListener for RecordingSlowQueryLog {
    fn on_slow_query(&self, query: &SlowQuery) {
        self.records.lock().push(query.clone());
    }
}

/// Exception listener keeping the rendered errors.
#[derive(Debug, Default)]
pub struct RecordingExceptionListener {
    errors: Mutex<Vec<String>>,
}

impl RecordingExceptionListener {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl ExceptionListener for RecordingExceptionListener {
    fn on_exception(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }
}

// ---------------------------------------------------------------------------
// ScriptedPool
// ---------------------------------------------------------------------------

/// Outcome of one scripted `reduce_by` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceStep {
    /// Destroy up to the requested number of idle objects.
    Succeed,
    /// Fail with a pool error when `recoverable`, an internal error otherwise.
    Fail { recoverable: bool },
    /// Panic inside `reduce_by`.
    Panic,
}

/// Counters-only pool for driving a reducer.
///
/// `reduce_by` follows the queued [`ReduceStep`]s, then succeeds.
#[derive(Debug)]
pub struct ScriptedPool {
    idle: AtomicUsize,
    created: AtomicUsize,
    initial_size: usize,
    steps: Mutex<VecDeque<ReduceStep>>,
    requested: Mutex<Vec<usize>>,
    panic_on_sample: AtomicBool,
}

impl ScriptedPool {
    pub fn new(idle: usize, created: usize, initial_size: usize) -> Self {
        Self {
            idle: AtomicUsize::new(idle),
            created: AtomicUsize::new(created),
            initial_size,
            steps: Mutex::new(VecDeque::new()),
            requested: Mutex::new(Vec::new()),
            panic_on_sample: AtomicBool::new(false),
        }
    }

    /// Make every later `sample_idle_count` call panic.
    pub fn panic_on_sample(&self) {
        self.panic_on_sample.store(true, Ordering::SeqCst);
    }

    pub fn push_step(&self, step: ReduceStep) {
        self.steps.lock().push_back(step);
    }

    pub fn set_idle(&self, idle: usize) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    /// Counts passed to `reduce_by`, in call order.
    pub fn requested(&self) -> Vec<usize> {
        self.requested.lock().clone()
    }

    pub fn reduce_calls(&self) -> usize {
        self.requested.lock().len()
    }
}

#[async_trait]
impl ObjectPool for ScriptedPool {
    fn sample_idle_count(&self) -> usize {
        assert!(
            !self.panic_on_sample.load(Ordering::SeqCst),
            "scripted sample_idle_count panic"
        );
        self.idle.load(Ordering::SeqCst)
    }

    fn created_total(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn initial_size(&self) -> usize {
        self.initial_size
    }

    async fn reduce_by(&self, count: usize) -> Result<usize> {
        self.requested.lock().push(count);
        let step = self.steps.lock().pop_front().unwrap_or(ReduceStep::Succeed);
        match step {
            ReduceStep::Succeed => {
                let reduced = count.min(self.idle.load(Ordering::SeqCst));
                self.idle.fetch_sub(reduced, Ordering::SeqCst);
                self.created.fetch_sub(reduced, Ordering::SeqCst);
                Ok(reduced)
            }
            ReduceStep::Fail { recoverable: true } => {
                Err(Error::pool("scripted", "temporarily unavailable"))
            }
            ReduceStep::Fail { recoverable: false } => Err(Error::internal("pool state corrupted")),
            ReduceStep::Panic => panic!("scripted reduce_by panic"),
        }
    }
}
