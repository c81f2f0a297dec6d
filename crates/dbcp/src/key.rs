//! Statement cache keys.
//!
//! A [`StatementKey`] identifies a prepared statement by the operation that
//! produced it: the SQL text, the creation method and the declared parameter
//! types. Two requests with equal keys can share one raw statement.

use std::fmt;

/// How a raw statement was created on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementMethod {
    /// A plain, unprepared statement.
    Create,
    /// A prepared statement.
    Prepare,
    /// A prepared statement returning generated keys.
    PrepareWithKeys,
    /// A stored-procedure call.
    PrepareCall,
}

impl StatementMethod {
    /// Driver-facing name of the creation method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "createStatement",
            Self::Prepare => "prepareStatement",
            Self::PrepareWithKeys => "prepareStatementWithKeys",
            Self::PrepareCall => "prepareCall",
        }
    }
}

impl fmt::Display for StatementMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a statement parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Boolean parameter.
    Bool,
    /// 32-bit integer parameter.
    Int,
    /// 64-bit integer parameter.
    BigInt,
    /// Floating point parameter.
    Double,
    /// Text parameter.
    Text,
    /// Binary parameter.
    Bytes,
    /// Timestamp parameter.
    Timestamp,
    /// Driver-specific type, identified by name.
    Other(String),
}

/// Immutable identity of a cached statement.
///
/// Equal iff the SQL text, the creation method and the ordered parameter
/// types are all equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    sql: String,
    method: StatementMethod,
    param_types: Vec<ParamType>,
}

impl StatementKey {
    /// Create a key from its three components.
    pub fn new(
        sql: impl Into<String>,
        method: StatementMethod,
        param_types: impl Into<Vec<ParamType>>,
    ) -> Self {
        Self {
            sql: sql.into(),
            method,
            param_types: param_types.into(),
        }
    }

    /// Key for a prepared statement without declared parameter types.
    pub fn prepared(sql: impl Into<String>) -> Self {
        Self::new(sql, StatementMethod::Prepare, Vec::new())
    }

    /// The SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The creation method.
    #[must_use]
    pub fn method(&self) -> StatementMethod {
        self.method
    }

    /// The declared parameter types, in order.
    #[must_use]
    pub fn param_types(&self) -> &[ParamType] {
        &self.param_types
    }
}

impl fmt::Display for StatementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?}, {:?})", self.method, self.sql, self.param_types)
    }
}
