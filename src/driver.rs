//! The database side of the pool: traits a non-blocking driver implements.
//!
//! The pool never speaks a wire protocol itself. It opens connections through a
//! [`Driver`], asks each [`Connection`] which I/O direction it needs next, and
//! hands the caller a [`Cursor`] wrapped in a lease once the connection is ready.

use crate::config::ConnectParams;
use crate::error::PoolError;
use crate::reactor::Descriptor;

use std::fmt;

/// What a non-blocking connection needs before it can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
  /// The pending connect or statement has finished.
  Ok,
  NeedRead,
  NeedWrite,
  /// The connection is in an unknown or broken state.
  Error,
}

/// A single SQL value, used both for statement parameters and result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
  Bytes(Vec<u8>),
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => f.write_str("NULL"),
      Value::Bool(b) => write!(f, "{}", b),
      Value::Int(i) => write!(f, "{}", i),
      Value::Float(x) => write!(f, "{}", x),
      Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
      Value::Bytes(bytes) => {
        f.write_str("'\\x")?;
        for byte in bytes {
          write!(f, "{:02x}", byte)?;
        }
        f.write_str("'")
      }
    }
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Int(v)
  }
}

impl From<i32> for Value {
  fn from(v: i32) -> Self {
    Value::Int(i64::from(v))
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Value::Bool(v)
  }
}

impl From<f64> for Value {
  fn from(v: f64) -> Self {
    Value::Float(v)
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::Text(v.to_string())
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::Text(v)
  }
}

impl From<Vec<u8>> for Value {
  fn from(v: Vec<u8>) -> Self {
    Value::Bytes(v)
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self {
    v.map_or(Value::Null, Into::into)
  }
}

pub type Row = Vec<Value>;

/// Result column metadata, as reported after a statement completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
  pub name: String,
  pub type_code: u32,
}

impl Column {
  pub fn new(name: impl Into<String>, type_code: u32) -> Self {
    Self {
      name: name.into(),
      type_code,
    }
  }
}

/// Opens connections. `connect` must not block: it starts the handshake and
/// returns a connection whose `poll` drives the rest of it.
pub trait Driver: Send + Sync + 'static {
  type Connection: Connection;

  fn connect(&self, params: &ConnectParams) -> Result<Self::Connection, PoolError>;
}

/// A non-blocking database connection.
///
/// Methods take `&self`: a connection is shared between the pool, the lease
/// holding it and the poller driving it, so drivers keep their mutable state
/// behind interior mutability.
pub trait Connection: Send + Sync + 'static {
  type Cursor: Cursor;

  /// Advances whatever operation is in flight and reports the next I/O need.
  ///
  /// A statement-level failure surfaces as `Err(PoolError::Query(..))`; a
  /// broken connection as `Ok(PollState::Error)` or a connectivity error.
  fn poll(&self) -> Result<PollState, PoolError>;

  /// The socket the reactor should watch.
  fn descriptor(&self) -> Descriptor;

  fn is_closed(&self) -> bool;

  /// Closes the connection. Must tolerate being called more than once.
  fn close(&self);

  fn cursor(&self) -> Result<Self::Cursor, PoolError>;
}

/// Statement execution and row retrieval on one connection.
///
/// `execute` only submits the statement; the pool polls the connection until
/// the result is available before any fetch is attempted.
pub trait Cursor: Send + 'static {
  fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), PoolError>;

  fn fetch_one(&mut self) -> Result<Option<Row>, PoolError>;

  fn fetch_many(&mut self, size: usize) -> Result<Vec<Row>, PoolError>;

  fn fetch_all(&mut self) -> Result<Vec<Row>, PoolError>;

  /// Column metadata of the last result, `None` when it returned no rows.
  fn description(&self) -> Option<Vec<Column>>;

  /// Rows produced or affected by the last statement, `-1` when unknown.
  fn row_count(&self) -> i64;
}
