use crate::driver::{Connection, Driver};
use crate::error::PoolError;
use crate::lease::Lease;

use std::fmt;
use std::time::Instant;

/// The callback a caller hands to `ConnectionPool::acquire`.
pub type ReadyCallback<D> = Box<dyn FnOnce(Result<Lease<D>, PoolError>) + Send + 'static>;

pub(crate) type ConnectionOf<D> = <D as Driver>::Connection;
pub(crate) type CursorOf<D> = <<D as Driver>::Connection as Connection>::Cursor;

/// A queued acquisition waiting for admission.
pub(crate) struct PendingRequest<D: Driver> {
  pub(crate) request_id: u64,
  pub(crate) on_ready: ReadyCallback<D>,
  pub(crate) enqueued_at: Instant,
}

impl<D: Driver> fmt::Debug for PendingRequest<D> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PendingRequest")
      .field("request_id", &self.request_id)
      .field("waited", &self.enqueued_at.elapsed())
      .finish_non_exhaustive()
  }
}
