//! Sampling pool reducer.
//!
//! The [`PoolReducer`] wakes up `samples` times per `time_interval`, records
//! the pool's idle count and, at the end of each interval, asks the pool to
//! destroy the idle objects that stayed unused for the whole interval.
//!
//! A recoverable failure ([`Error::Pool`]) is logged and the reducer keeps
//! going. Any other failure, including a panic inside the pool, stops the
//! reducer for good; the pool itself is unaffected.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on the share of created objects destroyed in one reduction.
pub const MAX_REDUCTION_FRACTION: f64 = 0.2;

// ---------------------------------------------------------------------------
// ReducerConfig
// ---------------------------------------------------------------------------

/// Schedule of the pool reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ReducerConfig {
    /// Whether the pool starts a reducer. Default: true
    pub enabled: bool,
    /// Length of one reduction interval. Default: 60s
    pub time_interval: Duration,
    /// Idle-count samples taken per interval. Default: 20
    pub samples: u32,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time_interval: Duration::from_secs(60),
            samples: 20,
        }
    }
}

impl ReducerConfig {
    /// Validate the schedule, returning an error if any field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.samples == 0 {
            return Err(Error::configuration("reducer samples must be > 0"));
        }
        if self.sample_interval().is_zero() {
            return Err(Error::configuration(
                "reducer time_interval must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Time between two samples.
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        self.time_interval / self.samples.max(1)
    }
}

// ---------------------------------------------------------------------------
// ObjectPool
// ---------------------------------------------------------------------------

/// Sampling and reduction primitives the reducer needs from a pool.
#[async_trait]
pub trait ObjectPool: Send + Sync + 'static {
    /// Number of created objects currently idle. Observation only.
    fn sample_idle_count(&self) -> usize;

    /// Number of objects currently created, idle or in use.
    fn created_total(&self) -> usize;

    /// Size the pool never shrinks below.
    fn initial_size(&self) -> usize;

    /// Destroy up to `count` idle objects, returning how many were destroyed.
    ///
    /// Transient failures are reported as [`Error::Pool`].
    async fn reduce_by(&self, count: usize) -> Result<usize>;

    /// How many objects to destroy given the smallest idle count sampled
    /// over the last interval.
    ///
    /// Destroys at most [`MAX_REDUCTION_FRACTION`] of the created objects
    /// and never goes below [`initial_size`](Self::initial_size).
    fn reduction_for(&self, min_idle: usize) -> usize {
        let created = self.created_total();
        let max_reduction = (created as f64 * MAX_REDUCTION_FRACTION).ceil() as usize;
        let above_floor = created.saturating_sub(self.initial_size());
        min_idle.min(max_reduction).min(above_floor)
    }
}

// ---------------------------------------------------------------------------
// ReducerState
// ---------------------------------------------------------------------------

/// Lifecycle of a [`PoolReducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReducerState {
    /// Waiting for the next sample.
    Running = 0,
    /// Reading the idle count.
    Sampling = 1,
    /// A reduction request is in flight.
    Reducing = 2,
    /// Terminated; no further cycles run.
    Stopped = 3,
}

impl ReducerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Sampling,
            2 => Self::Reducing,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn get(&self) -> ReducerState {
        ReducerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move `from -> to`; a no-op once another party moved the state on.
    fn advance(&self, from: ReducerState, to: ReducerState) {
        let _ = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.0.store(ReducerState::Stopped as u8, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// PoolReducer
// ---------------------------------------------------------------------------

/// Background task shrinking a pool's idle capacity.
pub struct PoolReducer {
    pool_name: String,
    state: Arc<SharedState>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoolReducer {
    /// Spawn the reducer for `pool` on the current tokio runtime.
    ///
    /// Call [`validate`](ReducerConfig::validate) on the config first if you
    /// want early validation; an invalid schedule is clamped to one sample.
    pub fn start<P>(pool: Arc<P>, config: &ReducerConfig, pool_name: impl Into<String>) -> Self
    where
        P: ObjectPool + ?Sized,
    {
        let pool_name = pool_name.into();
        let state = Arc::new(SharedState(AtomicU8::new(ReducerState::Running as u8)));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(
            pool,
            config.sample_interval().max(Duration::from_millis(1)),
            config.samples.max(1),
            pool_name.clone(),
            Arc::clone(&state),
            cancel.clone(),
        ));

        Self {
            pool_name,
            state,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the reducer. Idempotent.
    pub fn terminate(&self) {
        self.state.stop();
        self.cancel.cancel();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReducerState {
        self.state.get()
    }

    /// Whether the reducer has stopped, by request or after a fatal error.
    pub fn is_terminated(&self) -> bool {
        self.state() == ReducerState::Stopped
    }

    /// Name of the reduced pool.
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Wait for the background task to exit.
    ///
    /// Returns immediately if another caller already joined.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            tracing::warn!(pool = %self.pool_name, %error, "Pool reducer task failed");
        }
    }
}

impl Drop for PoolReducer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Display for PoolReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolReducer for pool {}", self.pool_name)
    }
}

impl fmt::Debug for PoolReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolReducer")
            .field("pool_name", &self.pool_name)
            .field("state", &self.state())
            .finish()
    }
}

async fn run<P>(
    pool: Arc<P>,
    sample_interval: Duration,
    samples: u32,
    pool_name: String,
    state: Arc<SharedState>,
    cancel: CancellationToken,
) where
    P: ObjectPool + ?Sized,
{
    let _stop = StopOnExit {
        state: Arc::clone(&state),
        cancel: cancel.clone(),
    };
    let mut taken = 0;
    let mut min_idle = usize::MAX;

    loop {
        tokio::select! {
            () = tokio::time::sleep(sample_interval) => {}
            () = cancel.cancelled() => break,
        }

        state.advance(ReducerState::Running, ReducerState::Sampling);
        min_idle = min_idle.min(pool.sample_idle_count());
        taken += 1;
        if taken < samples {
            state.advance(ReducerState::Sampling, ReducerState::Running);
            continue;
        }

        state.advance(ReducerState::Sampling, ReducerState::Reducing);
        let reduction = pool.reduction_for(min_idle);
        taken = 0;
        min_idle = usize::MAX;

        let outcome = AssertUnwindSafe(pool.reduce_by(reduction))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(reduced)) => {
                tracing::debug!(
                    pool = %pool_name,
                    intended = reduction,
                    actual = reduced,
                    "Pool reduced"
                );
            }
            Ok(Err(error)) if error.is_recoverable() => {
                tracing::warn!(
                    pool = %pool_name,
                    intended = reduction,
                    %error,
                    "While trying to reduce pool"
                );
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    pool = %pool_name,
                    intended = reduction,
                    %error,
                    "While trying to reduce pool; terminating reducer"
                );
                break;
            }
            Err(panic) => {
                tracing::warn!(
                    pool = %pool_name,
                    intended = reduction,
                    panic = panic_message(panic.as_ref()),
                    "Pool panicked while reducing; terminating reducer"
                );
                break;
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        state.advance(ReducerState::Reducing, ReducerState::Running);
    }
}

/// Marks the reducer stopped when `run` exits, including by unwinding.
struct StopOnExit {
    state: Arc<SharedState>,
    cancel: CancellationToken,
}

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.state.stop();
        self.cancel.cancel();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ReduceStep, ScriptedPool};

    /// Advance time in 1-second steps, yielding between each to let
    /// spawned tasks process their timer wakes.
    async fn advance_stepwise(total: Duration) {
        tokio::task::yield_now().await;
        for _ in 0..total.as_secs() {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn config(interval_secs: u64, samples: u32) -> ReducerConfig {
        ReducerConfig {
            enabled: true,
            time_interval: Duration::from_secs(interval_secs),
            samples,
        }
    }

    // -- Config validation --

    #[test]
    fn default_config_is_valid() {
        ReducerConfig::default().validate().unwrap();
        assert_eq!(
            ReducerConfig::default().sample_interval(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn zero_samples_rejected() {
        assert!(config(10, 0).validate().is_err());
    }

    #[test]
    fn zero_interval_rejected() {
        assert!(config(0, 2).validate().is_err());
    }

    // -- Sizing policy --

    #[test]
    fn reduction_capped_by_fraction_of_created() {
        let pool = ScriptedPool::new(10, 20, 0);
        assert_eq!(pool.reduction_for(10), 4);
    }

    #[test]
    fn reduction_capped_by_min_sampled_idle() {
        let pool = ScriptedPool::new(10, 20, 0);
        assert_eq!(pool.reduction_for(1), 1);
    }

    #[test]
    fn reduction_never_goes_below_initial_size() {
        let pool = ScriptedPool::new(3, 5, 4);
        assert_eq!(pool.reduction_for(3), 1);
        let at_floor = ScriptedPool::new(3, 4, 4);
        assert_eq!(at_floor.reduction_for(3), 0);
    }

    // -- Lifecycle --

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn reduces_once_per_interval() {
        let pool = Arc::new(ScriptedPool::new(8, 10, 2));
        let reducer = PoolReducer::start(Arc::clone(&pool), &config(10, 2), "p1");

        advance_stepwise(Duration::from_secs(11)).await;
        assert_eq!(pool.requested(), vec![2]);
        assert_eq!(pool.sample_idle_count(), 6);

        advance_stepwise(Duration::from_secs(10)).await;
        assert_eq!(pool.requested().len(), 2);
        assert!(!reducer.is_terminated());

        reducer.terminate();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn recoverable_error_keeps_reducer_running() {
        let pool = Arc::new(ScriptedPool::new(8, 10, 2));
        pool.push_step(ReduceStep::Fail { recoverable: true });
        let reducer = PoolReducer::start(Arc::clone(&pool), &config(10, 2), "p1");

        advance_stepwise(Duration::from_secs(21)).await;

        assert_eq!(pool.reduce_calls(), 2);
        assert!(!reducer.is_terminated());
        reducer.terminate();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unrecoverable_error_terminates_reducer() {
        let pool = Arc::new(ScriptedPool::new(8, 10, 2));
        pool.push_step(ReduceStep::Fail { recoverable: false });
        let reducer = PoolReducer::start(Arc::clone(&pool), &config(10, 2), "p1");

        advance_stepwise(Duration::from_secs(11)).await;
        assert_eq!(pool.reduce_calls(), 1);
        assert_eq!(reducer.state(), ReducerState::Stopped);

        advance_stepwise(Duration::from_secs(30)).await;
        assert_eq!(pool.reduce_calls(), 1, "no cycles after termination");
        reducer.join().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn panic_in_pool_terminates_reducer() {
        let pool = Arc::new(ScriptedPool::new(8, 10, 2));
        pool.push_step(ReduceStep::Panic);
        let reducer = PoolReducer::start(Arc::clone(&pool), &config(10, 2), "p1");

        advance_stepwise(Duration::from_secs(11)).await;
        assert!(reducer.is_terminated());

        advance_stepwise(Duration::from_secs(20)).await;
        assert_eq!(pool.reduce_calls(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn panic_while_sampling_terminates_reducer() {
        let pool = Arc::new(ScriptedPool::new(8, 10, 2));
        pool.panic_on_sample();
        let reducer = PoolReducer::start(Arc::clone(&pool), &config(10, 2), "p1");
        assert_eq!(reducer.state(), ReducerState::Running);

        advance_stepwise(Duration::from_secs(6)).await;
        assert!(reducer.is_terminated());

        reducer.join().await;
        assert_eq!(reducer.state(), ReducerState::Stopped);
        assert_eq!(pool.reduce_calls(), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn terminate_is_idempotent_and_stops_cycles() {
        let pool = Arc::new(ScriptedPool::new(8, 10, 2));
        let reducer = PoolReducer::start(Arc::clone(&pool), &config(10, 2), "p1");

        reducer.terminate();
        reducer.terminate();
        assert_eq!(reducer.state(), ReducerState::Stopped);

        advance_stepwise(Duration::from_secs(30)).await;
        assert_eq!(pool.reduce_calls(), 0);
        reducer.join().await;
        reducer.join().await;
    }

    #[tokio::test]
    async fn display_names_pool() {
        let pool = Arc::new(ScriptedPool::new(0, 0, 0));
        let reducer = PoolReducer::start(pool, &ReducerConfig::default(), "orders");
        assert_eq!(reducer.to_string(), "PoolReducer for pool orders");
        let debug = format!("{reducer:?}");
        assert!(debug.contains("PoolReducer"));
        reducer.terminate();
    }
}
