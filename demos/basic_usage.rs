use readypool::{
  Column, ConnectParams, Connection, ConnectionPool, Cursor, Descriptor, Driver, PollState, PoolConfig, PoolError, Row,
  Value,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Connections that live in memory and are always ready. `select` echoes its
/// parameters back as a single row.
#[derive(Default)]
struct EchoDriver {
  next_fd: AtomicI32,
}

impl Driver for EchoDriver {
  type Connection = EchoConnection;

  fn connect(&self, params: &ConnectParams) -> Result<EchoConnection, PoolError> {
    let fd = 1000 + self.next_fd.fetch_add(1, Ordering::Relaxed);
    info!("Connecting fd {} to dbname={:?}", fd, params.get("dbname"));
    Ok(EchoConnection {
      fd,
      closed: AtomicBool::new(false),
    })
  }
}

struct EchoConnection {
  fd: Descriptor,
  closed: AtomicBool,
}

impl Connection for EchoConnection {
  type Cursor = EchoCursor;

  fn poll(&self) -> Result<PollState, PoolError> {
    if self.is_closed() {
      return Err(PoolError::ConnectionClosed);
    }
    Ok(PollState::Ok)
  }

  fn descriptor(&self) -> Descriptor {
    self.fd
  }

  fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
  }

  fn cursor(&self) -> Result<EchoCursor, PoolError> {
    Ok(EchoCursor::default())
  }
}

#[derive(Default)]
struct EchoCursor {
  rows: VecDeque<Row>,
  described: bool,
}

impl Cursor for EchoCursor {
  fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), PoolError> {
    if !sql.trim_start().to_ascii_lowercase().starts_with("select") {
      return Err(PoolError::Query(format!("only select is supported: {}", sql)));
    }
    self.rows = VecDeque::from(vec![params.to_vec()]);
    self.described = true;
    Ok(())
  }

  fn fetch_one(&mut self) -> Result<Option<Row>, PoolError> {
    Ok(self.rows.pop_front())
  }

  fn fetch_many(&mut self, size: usize) -> Result<Vec<Row>, PoolError> {
    let take = size.min(self.rows.len());
    Ok(self.rows.drain(..take).collect())
  }

  fn fetch_all(&mut self) -> Result<Vec<Row>, PoolError> {
    Ok(self.rows.drain(..).collect())
  }

  fn description(&self) -> Option<Vec<Column>> {
    self.described.then(|| vec![Column::new("echo", 0)])
  }

  fn row_count(&self) -> i64 {
    self.rows.len() as i64
  }
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<(), PoolError> {
  use readypool::TokioReactor;

  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  let reactor = Arc::new(TokioReactor::new(tokio::runtime::Handle::current()));
  let config = PoolConfig::new(2)
    .with_name("basic_pool")
    .with_dsn("host=127.0.0.1 dbname=orders")?;
  let pool = ConnectionPool::new(config, EchoDriver::default(), reactor)?;

  let mut tasks = Vec::new();
  for i in 0..5i64 {
    let pool = pool.clone();
    tasks.push(tokio::spawn(async move {
      let mut lease = pool.query("select %s, %s", vec![Value::from(i), Value::from("hello")]).await?;
      // Hold the connection for a moment so later queries have to queue.
      tokio::time::sleep(Duration::from_millis(100)).await;
      let row = lease.fetch_one()?;
      info!("Query {} on lease {} returned {:?}", i, lease.id(), row);
      Ok::<_, PoolError>(())
    }));
  }

  for task in tasks {
    match task.await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => tracing::error!("Query failed: {}", e),
      Err(e) => tracing::error!("Query task panicked: {:?}", e),
    }
  }

  match pool.query("update orders set done = true", vec![]).await {
    Ok(_) => info!("Unexpected success"),
    Err(e) => info!("Rejected as expected: {}", e),
  }

  info!("Pool stats before shutdown: {:?}", pool.stats());
  pool.shutdown();
  info!("Pool stats after shutdown: {:?}", pool.stats());
  info!("--- Basic Usage Example Finished ---");
  Ok(())
}

#[cfg(not(unix))]
fn main() {
  eprintln!("This example needs a unix readiness reactor.");
}
