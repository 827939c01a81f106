//! Drives one connect or query on a non-blocking connection to completion.
//!
//! Each invocation asks the connection which I/O direction it needs next and
//! translates the answer into a reactor subscription. The completion runs
//! exactly once, after the subscription is gone.

use crate::driver::{Connection, PollState};
use crate::error::PoolError;
use crate::reactor::{Descriptor, Interest, Reactor};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

pub(crate) type PollCompletion = Box<dyn FnOnce(Result<(), PoolError>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
  /// Not subscribed yet. A connection that is ready right away never leaves it
  /// before finishing.
  Started,
  WaitingRead,
  WaitingWrite,
  Failed,
  Done,
}

impl PollerState {
  fn is_finished(self) -> bool {
    matches!(self, PollerState::Failed | PollerState::Done)
  }
}

pub(crate) struct Poller<C: Connection> {
  connection: Arc<C>,
  reactor: Arc<dyn Reactor>,
  fd: Descriptor,
  state: PollerState,
  registered: bool,
  completion: Option<PollCompletion>,
}

/// Polls `connection` until it reports `PollState::Ok` or fails, then calls `completion`.
///
/// The first poll happens before this returns, so a connection with nothing
/// left to do completes synchronously without touching the reactor.
pub(crate) fn poll_until_ready<C, F>(connection: Arc<C>, reactor: Arc<dyn Reactor>, completion: F)
where
  C: Connection,
  F: FnOnce(Result<(), PoolError>) + Send + 'static,
{
  let fd = connection.descriptor();
  let poller = Arc::new(Mutex::new(Poller {
    connection,
    reactor,
    fd,
    state: PollerState::Started,
    registered: false,
    completion: Some(Box::new(completion)),
  }));
  Poller::tick(&poller, Interest::NONE);
}

impl<C: Connection> Poller<C> {
  fn tick(this: &Arc<Mutex<Self>>, events: Interest) {
    let finished = this.lock().advance(this, events);
    if let Some((completion, outcome)) = finished {
      completion(outcome);
    }
  }

  fn advance(&mut self, this: &Arc<Mutex<Self>>, events: Interest) -> Option<(PollCompletion, Result<(), PoolError>)> {
    if self.state.is_finished() {
      trace!(fd = self.fd, ?events, "Poller: ignoring readiness after completion.");
      return None;
    }

    let outcome = match self.connection.poll() {
      Ok(PollState::Ok) => Ok(()),
      Ok(PollState::NeedRead) => match self.watch(this, PollerState::WaitingRead, Interest::READ | Interest::ERROR) {
        Ok(()) => return None,
        Err(err) => Err(err),
      },
      Ok(PollState::NeedWrite) => match self.watch(this, PollerState::WaitingWrite, Interest::WRITE | Interest::ERROR) {
        Ok(()) => return None,
        Err(err) => Err(err),
      },
      Ok(PollState::Error) => Err(PoolError::Connectivity("connection has unknown error state".to_string())),
      Err(err) => Err(err),
    };

    self.finish(outcome)
  }

  fn watch(&mut self, this: &Arc<Mutex<Self>>, next: PollerState, interest: Interest) -> Result<(), PoolError> {
    let fd = self.fd;
    let result = if self.registered {
      self.reactor.update_handler(fd, interest)
    } else {
      let poller = Arc::clone(this);
      self
        .reactor
        .add_handler(fd, interest, Box::new(move |_fd, events| Poller::tick(&poller, events)))
    };
    result.map_err(|err| PoolError::Connectivity(format!("reactor could not watch descriptor {}: {}", fd, err)))?;

    trace!(fd, from = ?self.state, to = ?next, ?interest, "Poller: waiting for readiness.");
    self.registered = true;
    self.state = next;
    Ok(())
  }

  fn finish(&mut self, outcome: Result<(), PoolError>) -> Option<(PollCompletion, Result<(), PoolError>)> {
    if self.registered {
      self.reactor.remove_handler(self.fd);
      self.registered = false;
    }
    self.state = if outcome.is_ok() { PollerState::Done } else { PollerState::Failed };
    trace!(fd = self.fd, state = ?self.state, "Poller: finished.");
    self.completion.take().map(|completion| (completion, outcome))
  }
}

impl<C: Connection> Drop for Poller<C> {
  fn drop(&mut self) {
    // The reactor let go of the handler before the cycle finished.
    if let Some(completion) = self.completion.take() {
      trace!(fd = self.fd, state = ?self.state, "Poller: dropped with the cycle unfinished.");
      self.state = PollerState::Failed;
      completion(Err(PoolError::Connectivity("reactor dropped the readiness handler".to_string())));
    }
  }
}
