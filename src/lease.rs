use crate::driver::{Column, Connection, Cursor, Driver, Row, Value};
use crate::error::PoolError;
use crate::poller;
use crate::pool::PoolShared;
use crate::reactor::Descriptor;
use crate::request::{ConnectionOf, CursorOf};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A connection checked out of a `ConnectionPool`, together with its cursor.
///
/// The connection goes back to the pool when the lease is dropped or
/// [`release`](Self::release)d. Nothing else returns it: a failed statement
/// leaves the lease, and therefore the connection, with the caller.
pub struct Lease<D: Driver> {
  pub(crate) lease_id: u64,
  pool: Arc<PoolShared<D>>,
  connection: Arc<ConnectionOf<D>>,
  cursor: CursorOf<D>,
  // Set when a statement hit a connectivity failure; the connection is closed at checkin.
  broken: Option<PoolError>,
  connection_warned: AtomicBool,
}

impl<D: Driver> Lease<D> {
  pub(crate) fn new(lease_id: u64, pool: Arc<PoolShared<D>>, connection: Arc<ConnectionOf<D>>, cursor: CursorOf<D>) -> Self {
    Self {
      lease_id,
      pool,
      connection,
      cursor,
      broken: None,
      connection_warned: AtomicBool::new(false),
    }
  }

  /// Returns the pool-unique ID of this lease.
  pub fn id(&self) -> u64 {
    self.lease_id
  }

  pub fn descriptor(&self) -> Descriptor {
    self.connection.descriptor()
  }

  /// Submits `sql` and polls the connection until the result is ready.
  ///
  /// The lease travels with the statement and comes back as the first argument
  /// of `on_done`, so it cannot be reclaimed while the query runs.
  pub fn execute<F>(mut self, sql: &str, params: &[Value], on_done: F)
  where
    F: FnOnce(Lease<D>, Result<(), PoolError>) + Send + 'static,
  {
    debug!(pool_name = %self.pool.pool_name, lease_id = self.lease_id, sql, "Lease: executing statement.");
    if let Err(err) = self.cursor.execute(sql, params) {
      self.note_failure(&err);
      on_done(self, Err(err));
      return;
    }

    let connection = Arc::clone(&self.connection);
    let reactor = Arc::clone(&self.pool.reactor);
    poller::poll_until_ready(connection, reactor, move |outcome| {
      let mut lease = self;
      if let Err(err) = &outcome {
        lease.note_failure(err);
      }
      on_done(lease, outcome)
    });
  }

  /// Async form of [`execute`](Self::execute). On failure the lease is dropped,
  /// which checks its connection back in.
  pub async fn run(self, sql: &str, params: &[Value]) -> Result<Lease<D>, PoolError> {
    let (tx, rx) = oneshot::channel();
    self.execute(sql, params, move |lease, outcome| {
      let _ = tx.send(outcome.map(|()| lease));
    });
    match rx.await {
      Ok(result) => result,
      Err(recv_error) => Err(PoolError::ResultChannelError(recv_error.to_string())),
    }
  }

  pub fn fetch_one(&mut self) -> Result<Option<Row>, PoolError> {
    self.cursor.fetch_one()
  }

  pub fn fetch_many(&mut self, size: usize) -> Result<Vec<Row>, PoolError> {
    self.cursor.fetch_many(size)
  }

  pub fn fetch_all(&mut self) -> Result<Vec<Row>, PoolError> {
    self.cursor.fetch_all()
  }

  pub fn description(&self) -> Option<Vec<Column>> {
    self.cursor.description()
  }

  pub fn row_count(&self) -> i64 {
    self.cursor.row_count()
  }

  /// Direct access to the driver connection.
  ///
  /// Issuing work on it outside [`execute`](Self::execute) can leave the
  /// connection in a state the poller does not expect; the first access on
  /// each lease logs a warning.
  pub fn connection(&self) -> &D::Connection {
    if !self.connection_warned.swap(true, Ordering::Relaxed) {
      warn!(
        pool_name = %self.pool.pool_name,
        lease_id = self.lease_id,
        "Using the connection directly may leave the poller in an inconsistent state."
      );
    }
    &self.connection
  }

  /// Returns the connection to the pool now instead of at end of scope.
  pub fn release(self) {
    debug!(pool_name = %self.pool.pool_name, lease_id = self.lease_id, "Lease: released explicitly.");
  }

  fn note_failure(&mut self, err: &PoolError) {
    if err.is_connectivity() {
      self.broken = Some(err.clone());
    }
  }
}

impl<D: Driver> fmt::Debug for Lease<D> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Lease")
      .field("lease_id", &self.lease_id)
      .field("pool_name", &*self.pool.pool_name)
      .field("descriptor", &self.descriptor())
      .field("broken", &self.broken)
      .finish_non_exhaustive()
  }
}

impl<D: Driver> Drop for Lease<D> {
  fn drop(&mut self) {
    let connection = Arc::clone(&self.connection);
    self.pool.lease_ended(self.lease_id, connection, self.broken.take());
  }
}
