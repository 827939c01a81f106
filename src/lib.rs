//! A bounded pool of non-blocking database connections driven by a readiness
//! reactor, with FIFO admission and callback or async completion.

mod config;
mod driver;
mod error;
mod lease;
mod manual_reactor;
mod poller;
mod pool;
mod reactor;
mod request;
#[cfg(unix)]
mod tokio_reactor;

pub use config::{ConnectParams, PoolConfig, DEFAULT_MAX_CONNECTIONS, NONBLOCKING_KEY};
pub use driver::{Column, Connection, Cursor, Driver, PollState, Row, Value};
pub use error::PoolError;
pub use lease::Lease;
pub use manual_reactor::ManualReactor;
pub use pool::{ConnectionPool, PoolStats};
pub use reactor::{Descriptor, Interest, Reactor, ReadinessHandler, ScheduledCallback};
pub use request::ReadyCallback;
#[cfg(unix)]
pub use tokio_reactor::TokioReactor;
