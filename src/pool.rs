use crate::config::{ConnectParams, PoolConfig};
use crate::driver::{Connection, Driver, Value};
use crate::error::PoolError;
use crate::lease::Lease;
use crate::poller;
use crate::reactor::{Descriptor, Reactor};
use crate::request::{ConnectionOf, PendingRequest};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, debug_span, error, info, trace, warn};

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
  pub max_connections: usize,
  /// Connections leased or being established.
  pub owed: usize,
  pub idle: usize,
  pub pending: usize,
  pub outstanding_leases: usize,
  /// Connections opened through the driver over the pool's lifetime.
  pub opened: u64,
  pub closed: bool,
}

struct PoolState<D: Driver> {
  idle: VecDeque<Arc<ConnectionOf<D>>>,
  pending: VecDeque<PendingRequest<D>>,
  owed: usize,
  closed: bool,
}

#[derive(Debug)]
struct OutstandingLease {
  descriptor: Descriptor,
  leased_at: Instant,
}

/// State shared by the pool handle(s) and every lease.
pub(crate) struct PoolShared<D: Driver> {
  pub(crate) pool_name: Arc<String>,
  pub(crate) reactor: Arc<dyn Reactor>,
  max_connections: usize,
  connect_params: ConnectParams,
  driver: D,
  state: Mutex<PoolState<D>>,
  outstanding: DashMap<u64, OutstandingLease>,
  next_request_id: AtomicU64,
  next_lease_id: AtomicU64,
  opened: AtomicU64,
}

/// A bounded pool of non-blocking database connections.
///
/// Requests are admitted in FIFO order while fewer than `max_connections`
/// connections are leased or connecting. Each admitted request reuses the most
/// recently returned idle connection, or opens a new one, polls it until ready
/// and hands the caller a [`Lease`]. Dropping the lease checks the connection in
/// and admits the next request.
pub struct ConnectionPool<D: Driver> {
  shared: Arc<PoolShared<D>>,
}

impl<D: Driver> Clone for ConnectionPool<D> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<D: Driver> fmt::Debug for ConnectionPool<D> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionPool")
      .field("pool_name", &*self.shared.pool_name)
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}

impl<D: Driver> ConnectionPool<D> {
  /// Creates a pool. No connection is opened until the first request.
  ///
  /// The connection parameters are forced into non-blocking mode.
  pub fn new(config: PoolConfig, driver: D, reactor: Arc<dyn Reactor>) -> Result<Self, PoolError> {
    config.validate()?;
    let mut connect_params = config.connect_params;
    connect_params.force_nonblocking();

    info!(pool_name = %config.name, max_connections = config.max_connections, "Connection pool created.");

    Ok(Self {
      shared: Arc::new(PoolShared {
        pool_name: Arc::new(config.name),
        reactor,
        max_connections: config.max_connections,
        connect_params,
        driver,
        state: Mutex::new(PoolState {
          idle: VecDeque::new(),
          pending: VecDeque::new(),
          owed: 0,
          closed: false,
        }),
        outstanding: DashMap::new(),
        next_request_id: AtomicU64::new(0),
        next_lease_id: AtomicU64::new(0),
        opened: AtomicU64::new(0),
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn max_connections(&self) -> usize {
    self.shared.max_connections
  }

  /// Parameters handed to the driver on every connect.
  pub fn connect_params(&self) -> &ConnectParams {
    &self.shared.connect_params
  }

  pub fn driver(&self) -> &D {
    &self.shared.driver
  }

  /// Returns the number of connections currently leased or being established.
  pub fn owed(&self) -> usize {
    self.shared.state.lock().owed
  }

  pub fn idle_count(&self) -> usize {
    self.shared.state.lock().idle.len()
  }

  /// Returns the number of requests waiting for admission.
  pub fn pending_count(&self) -> usize {
    self.shared.state.lock().pending.len()
  }

  pub fn outstanding_leases(&self) -> usize {
    self.shared.outstanding.len()
  }

  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().closed
  }

  pub fn stats(&self) -> PoolStats {
    let state = self.shared.state.lock();
    PoolStats {
      max_connections: self.shared.max_connections,
      owed: state.owed,
      idle: state.idle.len(),
      pending: state.pending.len(),
      outstanding_leases: self.shared.outstanding.len(),
      opened: self.shared.opened.load(AtomicOrdering::Relaxed),
      closed: state.closed,
    }
  }

  /// Requests a lease. `on_ready` receives it once a connection is ready, or the
  /// error that prevented it. Every call reaches `on_ready` exactly once.
  ///
  /// Requests made after [`shutdown`](Self::shutdown) are still served.
  pub fn acquire<F>(&self, on_ready: F)
  where
    F: FnOnce(Result<Lease<D>, PoolError>) + Send + 'static,
  {
    let request_id = self.shared.next_request_id.fetch_add(1, AtomicOrdering::Relaxed);
    let queued = {
      let mut state = self.shared.state.lock();
      state.pending.push_back(PendingRequest {
        request_id,
        on_ready: Box::new(on_ready),
        enqueued_at: Instant::now(),
      });
      state.pending.len()
    };
    debug!(pool_name = %self.shared.pool_name, request_id, queued, "Acquire: request queued.");
    self.shared.process_queue();
  }

  /// Acquires a lease and runs `sql` on it.
  ///
  /// Same as calling [`acquire`](Self::acquire) followed by [`Lease::execute`],
  /// except that a failed statement drops the lease (returning the connection)
  /// before `on_done` sees the error.
  pub fn execute<F>(&self, sql: impl Into<String>, params: Vec<Value>, on_done: F)
  where
    F: FnOnce(Result<Lease<D>, PoolError>) + Send + 'static,
  {
    let sql = sql.into();
    self.acquire(move |acquired| match acquired {
      Ok(lease) => lease.execute(&sql, &params, move |lease, outcome| on_done(outcome.map(|()| lease))),
      Err(err) => on_done(Err(err)),
    });
  }

  /// Async form of [`acquire`](Self::acquire).
  pub async fn lease(&self) -> Result<Lease<D>, PoolError> {
    let (tx, rx) = oneshot::channel();
    self.acquire(move |acquired| {
      // A dropped receiver hands the lease back here, and dropping it checks the connection in.
      let _ = tx.send(acquired);
    });
    Self::await_completion(rx).await
  }

  /// Async form of [`execute`](Self::execute).
  pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<Lease<D>, PoolError> {
    let (tx, rx) = oneshot::channel();
    self.execute(sql, params, move |executed| {
      let _ = tx.send(executed);
    });
    Self::await_completion(rx).await
  }

  async fn await_completion(rx: oneshot::Receiver<Result<Lease<D>, PoolError>>) -> Result<Lease<D>, PoolError> {
    match rx.await {
      Ok(result) => result,
      Err(recv_error) => {
        warn!("Completion channel closed before a lease was delivered: {}", recv_error);
        Err(PoolError::ResultChannelError(recv_error.to_string()))
      }
    }
  }

  /// Closes every idle connection and makes later checkins close rather than
  /// re-idle. Queued requests and live leases are left alone. Idempotent.
  pub fn shutdown(&self) {
    let (drained, already_closed) = {
      let mut state = self.shared.state.lock();
      let already_closed = state.closed;
      state.closed = true;
      let drained: Vec<_> = state.idle.drain(..).collect();
      (drained, already_closed)
    };

    if already_closed {
      info!(pool_name = %self.shared.pool_name, "Shutdown already performed; closing any stragglers.");
    } else {
      info!(
        pool_name = %self.shared.pool_name,
        idle_closed = drained.len(),
        outstanding_leases = self.shared.outstanding.len(),
        "Pool shut down. Checked-out connections will be closed on checkin."
      );
    }
    for connection in drained {
      connection.close();
    }
  }
}

impl<D: Driver> PoolShared<D> {
  /// Admission scan: dispatches pending requests in FIFO order while capacity lasts.
  fn process_queue(self: &Arc<Self>) {
    loop {
      let (request, reused) = {
        let mut state = self.state.lock();
        if state.owed >= self.max_connections {
          trace!(pool_name = %self.pool_name, owed = state.owed, pending = state.pending.len(), "Admission: pool at capacity.");
          break;
        }
        let Some(request) = state.pending.pop_front() else {
          break;
        };
        state.owed += 1;
        (request, state.idle.pop_back())
      };
      self.dispatch(request, reused);
    }
  }

  fn dispatch(self: &Arc<Self>, request: PendingRequest<D>, reused: Option<Arc<ConnectionOf<D>>>) {
    let span = debug_span!("dispatch", pool_name = %self.pool_name, request_id = request.request_id);
    span.in_scope(|| {
      let waited = request.enqueued_at.elapsed();
      let connection = match reused {
        Some(connection) => {
          debug!(fd = connection.descriptor(), ?waited, "Dispatch: reusing idle connection.");
          connection
        }
        None => match self.driver.connect(&self.connect_params) {
          Ok(connection) => {
            self.opened.fetch_add(1, AtomicOrdering::Relaxed);
            let connection = Arc::new(connection);
            debug!(fd = connection.descriptor(), ?waited, "Dispatch: opening new connection.");
            connection
          }
          Err(err) => {
            error!(%err, "Dispatch: connect failed.");
            self.release_slot();
            (request.on_ready)(Err(err));
            return;
          }
        },
      };

      let pool = Arc::clone(self);
      let ready_connection = Arc::clone(&connection);
      poller::poll_until_ready(connection, Arc::clone(&self.reactor), move |outcome| {
        pool.connection_ready(request, ready_connection, outcome);
      });
    });
  }

  fn connection_ready(self: &Arc<Self>, request: PendingRequest<D>, connection: Arc<ConnectionOf<D>>, outcome: Result<(), PoolError>) {
    match outcome.and_then(|()| connection.cursor()) {
      Ok(cursor) => {
        let lease_id = self.next_lease_id.fetch_add(1, AtomicOrdering::Relaxed);
        let descriptor = connection.descriptor();
        self.outstanding.insert(
          lease_id,
          OutstandingLease {
            descriptor,
            leased_at: Instant::now(),
          },
        );
        debug!(
          pool_name = %self.pool_name,
          request_id = request.request_id,
          lease_id,
          fd = descriptor,
          "Connection ready; lease handed out."
        );
        (request.on_ready)(Ok(Lease::new(lease_id, Arc::clone(self), connection, cursor)));
      }
      Err(err) => {
        self.checkin(connection, Some(&err));
        (request.on_ready)(Err(err));
      }
    }
  }

  pub(crate) fn lease_ended(self: &Arc<Self>, lease_id: u64, connection: Arc<ConnectionOf<D>>, broken: Option<PoolError>) {
    match self.outstanding.remove(&lease_id) {
      Some((_, record)) => debug!(
        pool_name = %self.pool_name,
        lease_id,
        fd = record.descriptor,
        held_for = ?record.leased_at.elapsed(),
        "Lease ended; checking connection in."
      ),
      None => warn!(pool_name = %self.pool_name, lease_id, "Lease ended but was not registered as outstanding."),
    }
    self.checkin(connection, broken.as_ref());
  }

  /// Returns a connection: closes it on error or after shutdown, re-idles it otherwise.
  /// Always frees the admission slot and schedules a scan.
  fn checkin(self: &Arc<Self>, connection: Arc<ConnectionOf<D>>, err: Option<&PoolError>) {
    let usable = !connection.is_closed();
    let fd = connection.descriptor();
    let to_close = {
      let mut state = self.state.lock();
      state.owed = state.owed.saturating_sub(1);
      if err.is_some() || state.closed {
        Some(connection)
      } else {
        if usable {
          state.idle.push_back(connection);
        }
        None
      }
    };

    match (err, &to_close) {
      (Some(err), _) => error!(pool_name = %self.pool_name, fd, %err, "Checkin: closing connection after error."),
      (None, Some(_)) => debug!(pool_name = %self.pool_name, fd, "Checkin: pool is shut down; closing connection."),
      (None, None) if usable => trace!(pool_name = %self.pool_name, fd, "Checkin: connection returned to idle."),
      (None, None) => debug!(pool_name = %self.pool_name, fd, "Checkin: connection already closed; discarding."),
    }
    if let Some(connection) = to_close {
      connection.close();
    }
    self.schedule_scan();
  }

  /// Frees an admission slot that never got a connection.
  fn release_slot(self: &Arc<Self>) {
    {
      let mut state = self.state.lock();
      state.owed = state.owed.saturating_sub(1);
    }
    self.schedule_scan();
  }

  fn schedule_scan(self: &Arc<Self>) {
    let pool = Arc::clone(self);
    self.reactor.schedule(Box::new(move || pool.process_queue()));
  }
}

impl<D: Driver> Drop for PoolShared<D> {
  fn drop(&mut self) {
    let state = self.state.get_mut();
    let stranded: Vec<PendingRequest<D>> = state.pending.drain(..).collect();
    let idle: Vec<_> = state.idle.drain(..).collect();
    if !stranded.is_empty() {
      warn!(
        pool_name = %self.pool_name,
        pending = stranded.len(),
        "Pool dropped with requests still queued; failing them."
      );
    }
    trace!(pool_name = %self.pool_name, idle_closed = idle.len(), "Pool state dropped.");
    for connection in idle {
      connection.close();
    }
    for request in stranded {
      (request.on_ready)(Err(PoolError::PoolDropped));
    }
  }
}
