//! Driver-facing statement and connection traits.
//!
//! [`Statement`] is the operation surface of a raw database statement. The
//! pool never talks to a driver directly: it wraps raw statements in
//! [`StatementProxy`](crate::proxy::StatementProxy), which implements the same
//! trait so callers cannot tell a reused statement from a fresh one.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::key::StatementKey;

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// Text value.
    Text(String),
    /// Binary value.
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names, in select order.
    pub columns: Vec<String>,
    /// Row values, one inner vector per row.
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// A result with no columns and no rows.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Outcome of a generic `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    /// The statement produced rows.
    Rows(QueryResult),
    /// The statement updated rows.
    Updated(u64),
}

/// Operation surface of a database statement.
///
/// Lifecycle operations are `close`, `cancel` and `is_closed`; every
/// `execute*` method runs the statement on the server. The remaining methods
/// adjust statement options.
#[async_trait]
pub trait Statement: Send + Sync + 'static {
    /// The SQL text this statement was created for.
    fn sql(&self) -> Result<&str>;

    /// Execute the statement, returning rows or an update count.
    async fn execute(&self, params: &[Value]) -> Result<ExecuteOutcome>;

    /// Execute the statement as a query.
    async fn execute_query(&self, params: &[Value]) -> Result<QueryResult>;

    /// Execute the statement as an update, returning the affected row count.
    async fn execute_update(&self, params: &[Value]) -> Result<u64>;

    /// Execute the statement once per parameter set.
    async fn execute_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<u64>>;

    /// Ask the server to abandon the statement's in-flight operation.
    async fn cancel(&self) -> Result<()>;

    /// Release the statement on the server.
    async fn close(&self) -> Result<()>;

    /// Whether the statement is closed.
    fn is_closed(&self) -> bool;

    /// Hint for the number of rows fetched per round trip.
    fn set_fetch_size(&self, rows: usize) -> Result<()>;

    /// Limit the time a single execution may take on the server.
    fn set_query_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    /// Clear bound parameter state.
    fn clear_parameters(&self) -> Result<()>;

    /// Warnings reported by the server since the last clear.
    fn warnings(&self) -> Result<Vec<String>>;

    /// Discard reported warnings.
    fn clear_warnings(&self) -> Result<()>;
}

/// A raw database connection that can create statements.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Raw statement type produced by this connection.
    type Statement: Statement;

    /// Create a raw statement for `key`.
    async fn prepare(&self, key: &StatementKey) -> Result<Self::Statement>;
}

/// Render SQL text and bound values for diagnostics.
///
/// Produces `SELECT * FROM t WHERE id = ?` or, with parameters,
/// `SELECT * FROM t WHERE id = ? -- Parameters: [42]`.
pub fn to_sql_string(sql: &str, params: &[Value]) -> String {
    if params.is_empty() {
        return sql.to_string();
    }
    let rendered: Vec<String> = params.iter().map(ToString::to_string).collect();
    format!("{sql} -- Parameters: [{}]", rendered.join(", "))
}
