//! # dbcp
//!
//! Statement caching and idle reduction for database connection pools.
//!
//! Raw driver statements are handed out through [`StatementProxy`], which
//! makes `close` logical: a cached statement goes back to its connection's
//! [`StatementCache`] and the next caller preparing the same
//! [`StatementKey`] gets it without a server round trip. Proxies time every
//! execution and report slow ones to a [`SlowQueryListener`].
//!
//! A [`PoolReducer`] samples a pool's idle count and periodically asks the
//! pool to destroy the objects that stayed idle; [`Pool`] is a reference
//! pool wiring it up.

pub mod cache;
pub mod connection;
pub mod error;
pub mod key;
pub mod listener;
pub mod pool;
pub mod proxy;
pub mod reducer;
pub mod slot;
pub mod statement;
pub mod testing;

pub use cache::{Registration, StatementCache};
pub use connection::CachingConnection;
pub use error::{Error, Result};
pub use key::{ParamType, StatementKey, StatementMethod};
pub use listener::{ExceptionListener, SlowQuery, SlowQueryListener, TracingSlowQueryLog};
pub use pool::{Manager, Pool, PoolConfig, PoolStats, Pooled};
pub use proxy::{ProxySettings, StatementProxy, prepare_cached};
pub use reducer::{ObjectPool, PoolReducer, ReducerConfig, ReducerState};
pub use slot::{Evicted, SlotState, StatementSlot};
pub use statement::{Connection, ExecuteOutcome, QueryResult, Statement, Value, to_sql_string};
