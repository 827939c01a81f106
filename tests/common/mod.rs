#![allow(dead_code)]

//! An in-memory driver whose connections walk a programmable sequence of poll
//! states, plus helpers shared by the integration tests.

use readypool::{
  Column, ConnectParams, Connection, ConnectionPool, Cursor, Descriptor, Driver, Lease, ManualReactor, PollState,
  PoolConfig, PoolError, Row, Value,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub const FIRST_FD: Descriptor = 100;
pub const INT4_OID: u32 = 23;

pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,readypool=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

struct DriverState {
  connect_steps: Vec<PollState>,
  query_steps: Vec<PollState>,
  fail_next_connects: AtomicUsize,
  break_next_connect: AtomicBool,
  next_fd: AtomicI32,
  connections: Mutex<Vec<Arc<ConnectionState>>>,
  seen_params: Mutex<Vec<ConnectParams>>,
}

/// Driver whose connections need a write then a read to connect and a read to
/// answer each statement, unless built with other steps.
#[derive(Clone)]
pub struct ScriptedDriver {
  state: Arc<DriverState>,
}

impl Default for ScriptedDriver {
  fn default() -> Self {
    Self::with_steps(vec![PollState::NeedWrite, PollState::NeedRead], vec![PollState::NeedRead])
  }
}

impl ScriptedDriver {
  pub fn new() -> Self {
    Self::default()
  }

  /// Connections and statements that complete on the first poll.
  pub fn instant() -> Self {
    Self::with_steps(Vec::new(), Vec::new())
  }

  pub fn with_steps(connect_steps: Vec<PollState>, query_steps: Vec<PollState>) -> Self {
    Self {
      state: Arc::new(DriverState {
        connect_steps,
        query_steps,
        fail_next_connects: AtomicUsize::new(0),
        break_next_connect: AtomicBool::new(false),
        next_fd: AtomicI32::new(FIRST_FD),
        connections: Mutex::new(Vec::new()),
        seen_params: Mutex::new(Vec::new()),
      }),
    }
  }

  /// The next `n` calls to `connect` fail outright.
  pub fn fail_next_connects(&self, n: usize) {
    self.state.fail_next_connects.store(n, Ordering::SeqCst);
  }

  /// The next connection reports `PollState::Error` at the end of its handshake.
  pub fn break_next_connect(&self) {
    self.state.break_next_connect.store(true, Ordering::SeqCst);
  }

  /// Number of connections opened so far.
  pub fn connects(&self) -> usize {
    self.state.connections.lock().len()
  }

  pub fn connection(&self, index: usize) -> ConnectionView {
    ConnectionView(Arc::clone(&self.state.connections.lock()[index]))
  }

  pub fn connections(&self) -> Vec<ConnectionView> {
    self.state.connections.lock().iter().cloned().map(ConnectionView).collect()
  }

  pub fn last_params(&self) -> Option<ConnectParams> {
    self.state.seen_params.lock().last().cloned()
  }
}

impl Driver for ScriptedDriver {
  type Connection = ScriptedConnection;

  fn connect(&self, params: &ConnectParams) -> Result<ScriptedConnection, PoolError> {
    self.state.seen_params.lock().push(params.clone());
    let failing = self
      .state
      .fail_next_connects
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if failing {
      return Err(PoolError::Connectivity("could not connect to server: Connection refused".to_string()));
    }

    let mut script: VecDeque<Result<PollState, PoolError>> = self.state.connect_steps.iter().copied().map(Ok).collect();
    if self.state.break_next_connect.swap(false, Ordering::SeqCst) {
      script.push_back(Ok(PollState::Error));
    }

    let state = Arc::new(ConnectionState {
      fd: self.state.next_fd.fetch_add(1, Ordering::SeqCst),
      closed: AtomicBool::new(false),
      close_calls: AtomicUsize::new(0),
      polls: AtomicUsize::new(0),
      script: Mutex::new(script),
      query_steps: self.state.query_steps.clone(),
      fail_next_query: AtomicBool::new(false),
      executed: Mutex::new(Vec::new()),
    });
    self.state.connections.lock().push(Arc::clone(&state));
    Ok(ScriptedConnection { state })
  }
}

struct ConnectionState {
  fd: Descriptor,
  closed: AtomicBool,
  close_calls: AtomicUsize,
  polls: AtomicUsize,
  script: Mutex<VecDeque<Result<PollState, PoolError>>>,
  query_steps: Vec<PollState>,
  fail_next_query: AtomicBool,
  executed: Mutex<Vec<String>>,
}

/// Test-side view of a connection the driver handed out.
#[derive(Clone)]
pub struct ConnectionView(Arc<ConnectionState>);

impl ConnectionView {
  pub fn fd(&self) -> Descriptor {
    self.0.fd
  }

  pub fn is_closed(&self) -> bool {
    self.0.closed.load(Ordering::SeqCst)
  }

  pub fn close_calls(&self) -> usize {
    self.0.close_calls.load(Ordering::SeqCst)
  }

  pub fn polls(&self) -> usize {
    self.0.polls.load(Ordering::SeqCst)
  }

  /// The next statement ends with the connection in an error state.
  pub fn fail_next_query(&self) {
    self.0.fail_next_query.store(true, Ordering::SeqCst);
  }

  pub fn executed(&self) -> Vec<String> {
    self.0.executed.lock().clone()
  }
}

pub struct ScriptedConnection {
  state: Arc<ConnectionState>,
}

impl Connection for ScriptedConnection {
  type Cursor = ScriptedCursor;

  fn poll(&self) -> Result<PollState, PoolError> {
    if self.is_closed() {
      return Err(PoolError::ConnectionClosed);
    }
    self.state.polls.fetch_add(1, Ordering::SeqCst);
    self.state.script.lock().pop_front().unwrap_or(Ok(PollState::Ok))
  }

  fn descriptor(&self) -> Descriptor {
    self.state.fd
  }

  fn is_closed(&self) -> bool {
    self.state.closed.load(Ordering::SeqCst)
  }

  fn close(&self) {
    self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    self.state.closed.store(true, Ordering::SeqCst);
  }

  fn cursor(&self) -> Result<ScriptedCursor, PoolError> {
    if self.is_closed() {
      return Err(PoolError::ConnectionClosed);
    }
    Ok(ScriptedCursor {
      connection: Arc::clone(&self.state),
      rows: VecDeque::new(),
      description: None,
      row_count: -1,
    })
  }
}

pub struct ScriptedCursor {
  connection: Arc<ConnectionState>,
  rows: VecDeque<Row>,
  description: Option<Vec<Column>>,
  row_count: i64,
}

enum Answer {
  Rows(Vec<Column>, Vec<Row>),
  Command(i64),
  Failed(String),
}

fn answer(sql: &str, params: &[Value]) -> Answer {
  let lowered = sql.trim().to_ascii_lowercase();
  if lowered.contains("%s") {
    let columns = (0..params.len()).map(|i| Column::new(format!("col{}", i), 0)).collect();
    return Answer::Rows(columns, vec![params.to_vec()]);
  }
  if let Some(n) = lowered
    .strip_prefix("select generate_series(1, ")
    .and_then(|rest| rest.strip_suffix(')'))
    .and_then(|n| n.parse::<i64>().ok())
  {
    let rows = (1..=n).map(|i| vec![Value::Int(i)]).collect();
    return Answer::Rows(vec![Column::new("generate_series", INT4_OID)], rows);
  }
  if let Some(n) = lowered.strip_prefix("select ").and_then(|n| n.parse::<i64>().ok()) {
    return Answer::Rows(vec![Column::new("?column?", INT4_OID)], vec![vec![Value::Int(n)]]);
  }
  match lowered.split_whitespace().next() {
    Some("insert" | "update" | "delete") => Answer::Command(1),
    Some("begin" | "commit" | "rollback" | "create" | "drop") => Answer::Command(-1),
    _ => Answer::Failed(format!(
      "syntax error at or near \"{}\"",
      sql.split_whitespace().next().unwrap_or_default()
    )),
  }
}

impl Cursor for ScriptedCursor {
  fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), PoolError> {
    if self.connection.closed.load(Ordering::SeqCst) {
      return Err(PoolError::ConnectionClosed);
    }
    self.connection.executed.lock().push(sql.to_string());
    self.rows.clear();
    self.description = None;
    self.row_count = -1;

    let mut script: VecDeque<Result<PollState, PoolError>> =
      self.connection.query_steps.iter().copied().map(Ok).collect();
    if self.connection.fail_next_query.swap(false, Ordering::SeqCst) {
      script.push_back(Ok(PollState::Error));
    } else {
      match answer(sql, params) {
        Answer::Rows(columns, rows) => {
          self.row_count = rows.len() as i64;
          self.description = Some(columns);
          self.rows = rows.into();
        }
        Answer::Command(count) => self.row_count = count,
        Answer::Failed(message) => script.push_back(Err(PoolError::Query(message))),
      }
    }
    *self.connection.script.lock() = script;
    Ok(())
  }

  fn fetch_one(&mut self) -> Result<Option<Row>, PoolError> {
    self.require_result()?;
    Ok(self.rows.pop_front())
  }

  fn fetch_many(&mut self, size: usize) -> Result<Vec<Row>, PoolError> {
    self.require_result()?;
    let take = size.min(self.rows.len());
    Ok(self.rows.drain(..take).collect())
  }

  fn fetch_all(&mut self) -> Result<Vec<Row>, PoolError> {
    self.require_result()?;
    Ok(self.rows.drain(..).collect())
  }

  fn description(&self) -> Option<Vec<Column>> {
    self.description.clone()
  }

  fn row_count(&self) -> i64 {
    self.row_count
  }
}

impl ScriptedCursor {
  fn require_result(&self) -> Result<(), PoolError> {
    match self.description {
      Some(_) => Ok(()),
      None => Err(PoolError::Query("no results to fetch".to_string())),
    }
  }
}

pub type ScriptedLease = Lease<ScriptedDriver>;

/// Leases and errors in the order their callbacks ran, tagged by request.
#[derive(Clone, Default)]
pub struct Collected(Arc<Mutex<Vec<(usize, Result<ScriptedLease, PoolError>)>>>);

impl Collected {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn sink(&self, tag: usize) -> impl FnOnce(Result<ScriptedLease, PoolError>) + Send + 'static {
    let inner = Arc::clone(&self.0);
    move |result| inner.lock().push((tag, result))
  }

  pub fn len(&self) -> usize {
    self.0.lock().len()
  }

  pub fn tags(&self) -> Vec<usize> {
    self.0.lock().iter().map(|(tag, _)| *tag).collect()
  }

  /// Removes and returns the entry for `tag`.
  pub fn take(&self, tag: usize) -> Option<Result<ScriptedLease, PoolError>> {
    let mut entries = self.0.lock();
    let index = entries.iter().position(|(t, _)| *t == tag)?;
    Some(entries.remove(index).1)
  }

  pub fn take_lease(&self, tag: usize) -> ScriptedLease {
    match self.take(tag) {
      Some(Ok(lease)) => lease,
      Some(Err(err)) => panic!("request {} failed: {}", tag, err),
      None => panic!("request {} has not completed", tag),
    }
  }

  pub fn take_error(&self, tag: usize) -> PoolError {
    match self.take(tag) {
      Some(Err(err)) => err,
      Some(Ok(lease)) => panic!("request {} unexpectedly succeeded: {:?}", tag, lease),
      None => panic!("request {} has not completed", tag),
    }
  }
}

pub struct Harness {
  pub pool: ConnectionPool<ScriptedDriver>,
  pub driver: ScriptedDriver,
  pub reactor: Arc<ManualReactor>,
  pub collected: Collected,
}

impl Harness {
  pub fn new(name: &str, max_connections: usize) -> Self {
    Self::with_driver(name, max_connections, ScriptedDriver::new())
  }

  pub fn with_driver(name: &str, max_connections: usize, driver: ScriptedDriver) -> Self {
    setup_tracing_for_test();
    let reactor = Arc::new(ManualReactor::new());
    let config = PoolConfig::new(max_connections)
      .with_name(name)
      .with_param("host", "localhost")
      .with_param("dbname", "readypool_test");
    let pool = ConnectionPool::new(config, driver.clone(), reactor.clone()).unwrap();
    Self {
      pool,
      driver,
      reactor,
      collected: Collected::new(),
    }
  }

  pub fn acquire(&self, tag: usize) {
    self.pool.acquire(self.collected.sink(tag));
  }

  pub fn execute(&self, tag: usize, sql: &str, params: Vec<Value>) {
    self.pool.execute(sql, params, self.collected.sink(tag));
  }

  /// Runs the reactor until no handler or deferred callback is left.
  pub fn settle(&self) {
    self.reactor.run_until_idle();
  }

  /// Runs `sql` on `lease` and settles, returning the lease and the outcome.
  pub fn run_on(&self, lease: ScriptedLease, sql: &str, params: &[Value]) -> (ScriptedLease, Result<(), PoolError>) {
    let done: Arc<Mutex<Option<(ScriptedLease, Result<(), PoolError>)>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&done);
    lease.execute(sql, params, move |lease, outcome| {
      *sink.lock() = Some((lease, outcome));
    });
    self.settle();
    let finished = done.lock().take();
    finished.expect("statement did not complete")
  }
}
