use thiserror::Error;

/// Errors that can occur within the `readypool` pool.
///
/// Every failure is delivered through the same completion channel as success,
/// so the enum is `Clone` to let a single driver error fan out to logs and
/// callers alike.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  /// Connect failure, an unknown/error poll state, or a reactor that refused
  /// to watch the connection's descriptor. The connection is closed.
  #[error("Connectivity failure: {0}")]
  Connectivity(String),

  /// Statement-level failure reported by the driver. The connection stays usable.
  #[error("Query failed: {0}")]
  Query(String),

  #[error("Connection is closed")]
  ConnectionClosed,

  #[error("Pool was dropped before the request was admitted")]
  PoolDropped,

  #[error("Invalid pool configuration: {0}")]
  InvalidConfig(String),

  #[error("Completion channel closed before a result was delivered: {0}")]
  ResultChannelError(String),
}

impl PoolError {
  /// Returns `true` for errors that leave the connection unusable.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, PoolError::Connectivity(_) | PoolError::ConnectionClosed)
  }
}

impl From<std::io::Error> for PoolError {
  fn from(err: std::io::Error) -> Self {
    PoolError::Connectivity(err.to_string())
  }
}
