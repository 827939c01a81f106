use crate::reactor::{Descriptor, Interest, Reactor, ReadinessHandler, ScheduledCallback};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest as TokioInterest;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::watch;
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Borrowed view of a descriptor owned by the driver. Never closes it.
struct WatchedFd(RawFd);

impl AsFd for WatchedFd {
  fn as_fd(&self) -> BorrowedFd<'_> {
    // SAFETY: a descriptor stays open while it has a handler: the handler owns
    // the poller, which owns the connection. The watcher drops its `AsyncFd`
    // before the handler runs or the task exits.
    unsafe { BorrowedFd::borrow_raw(self.0) }
  }
}

impl AsRawFd for WatchedFd {
  fn as_raw_fd(&self) -> RawFd {
    self.as_fd().as_raw_fd()
  }
}

struct Watcher {
  generation: u64,
  interest_tx: watch::Sender<Interest>,
  // `None` while the handler is running.
  handler: Option<ReadinessHandler>,
}

#[derive(Default)]
struct Watchers {
  entries: HashMap<Descriptor, Watcher>,
  next_generation: u64,
}

enum WatchEvent {
  Ready(Interest),
  InterestChanged,
  Removed,
  RegistrationFailed,
}

/// A [`Reactor`] running on a tokio runtime.
///
/// Each registered descriptor gets a watcher task that waits on a
/// `tokio::io::unix::AsyncFd`. The descriptor is deregistered from the runtime
/// before its handler runs, so a handler may freely remove itself and register
/// the same descriptor again. Scheduled callbacks are spawned as tasks.
#[derive(Clone)]
pub struct TokioReactor {
  runtime: TokioHandle,
  watchers: Arc<Mutex<Watchers>>,
}

impl fmt::Debug for TokioReactor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TokioReactor")
      .field("watched", &self.watchers.lock().entries.len())
      .finish_non_exhaustive()
  }
}

impl TokioReactor {
  pub fn new(runtime: TokioHandle) -> Self {
    Self {
      runtime,
      watchers: Arc::new(Mutex::new(Watchers::default())),
    }
  }

  /// Number of descriptors with a live handler.
  pub fn watched(&self) -> usize {
    self.watchers.lock().entries.len()
  }
}

impl Reactor for TokioReactor {
  fn add_handler(&self, fd: Descriptor, interest: Interest, handler: ReadinessHandler) -> io::Result<()> {
    let (generation, interest_rx) = {
      let mut watchers = self.watchers.lock();
      if watchers.entries.contains_key(&fd) {
        return Err(io::Error::new(
          io::ErrorKind::AlreadyExists,
          format!("descriptor {} already has a handler", fd),
        ));
      }
      watchers.next_generation += 1;
      let generation = watchers.next_generation;
      let (interest_tx, interest_rx) = watch::channel(interest);
      watchers.entries.insert(
        fd,
        Watcher {
          generation,
          interest_tx,
          handler: Some(handler),
        },
      );
      (generation, interest_rx)
    };

    debug!(fd, ?interest, generation, "TokioReactor: watching descriptor.");
    self.runtime.spawn(
      watch_descriptor(fd, generation, Arc::clone(&self.watchers), interest_rx)
        .instrument(debug_span!("readiness_watcher", fd, generation)),
    );
    Ok(())
  }

  fn update_handler(&self, fd: Descriptor, interest: Interest) -> io::Result<()> {
    let watchers = self.watchers.lock();
    match watchers.entries.get(&fd) {
      Some(watcher) => {
        watcher.interest_tx.send_replace(interest);
        trace!(fd, ?interest, "TokioReactor: interest updated.");
        Ok(())
      }
      None => Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("descriptor {} has no handler", fd),
      )),
    }
  }

  fn remove_handler(&self, fd: Descriptor) {
    // Dropping the sender wakes the watcher, which then exits.
    let removed = self.watchers.lock().entries.remove(&fd);
    if removed.is_some() {
      debug!(fd, "TokioReactor: stopped watching descriptor.");
    }
    drop(removed);
  }

  fn schedule(&self, callback: ScheduledCallback) {
    self.runtime.spawn(async move { callback() });
  }
}

fn to_tokio_interest(interest: Interest) -> TokioInterest {
  match (interest.is_readable(), interest.is_writable()) {
    (_, false) => TokioInterest::READABLE,
    (false, true) => TokioInterest::WRITABLE,
    (true, true) => TokioInterest::READABLE | TokioInterest::WRITABLE,
  }
}

async fn wait_for_event(fd: Descriptor, wanted: Interest, interest_rx: &mut watch::Receiver<Interest>) -> WatchEvent {
  let async_fd = match AsyncFd::with_interest(WatchedFd(fd), TokioInterest::READABLE | TokioInterest::WRITABLE) {
    Ok(async_fd) => async_fd,
    Err(err) => {
      warn!(fd, %err, "TokioReactor: could not register descriptor with the runtime.");
      return WatchEvent::RegistrationFailed;
    }
  };

  let event = tokio::select! {
    changed = interest_rx.changed() => match changed {
      Ok(()) => WatchEvent::InterestChanged,
      Err(_) => WatchEvent::Removed,
    },
    guard = async_fd.ready(to_tokio_interest(wanted)) => match guard {
      Ok(guard) => {
        let ready = guard.ready();
        let mut events = Interest::NONE;
        if ready.is_readable() || ready.is_read_closed() {
          events |= Interest::READ;
        }
        if ready.is_writable() || ready.is_write_closed() {
          events |= Interest::WRITE;
        }
        if ready.is_read_closed() || ready.is_write_closed() {
          events |= Interest::ERROR;
        }
        WatchEvent::Ready(events)
      }
      Err(err) => {
        warn!(fd, %err, "TokioReactor: readiness wait failed.");
        WatchEvent::Ready(Interest::ERROR)
      }
    },
  };
  // Deregisters the descriptor before any handler runs.
  drop(async_fd);
  event
}

async fn watch_descriptor(
  fd: Descriptor,
  generation: u64,
  watchers: Arc<Mutex<Watchers>>,
  mut interest_rx: watch::Receiver<Interest>,
) {
  loop {
    let wanted = *interest_rx.borrow_and_update();
    let events = match wait_for_event(fd, wanted, &mut interest_rx).await {
      WatchEvent::InterestChanged => continue,
      WatchEvent::Removed => break,
      WatchEvent::Ready(events) => events,
      WatchEvent::RegistrationFailed => {
        // Unregister first, so whatever the handler tries next fails with NotFound.
        let removed = {
          let mut guard = watchers.lock();
          match guard.entries.get(&fd) {
            Some(watcher) if watcher.generation == generation => guard.entries.remove(&fd),
            _ => None,
          }
        };
        if let Some(mut handler) = removed.and_then(|mut watcher| watcher.handler.take()) {
          handler(fd, Interest::ERROR);
        }
        break;
      }
    };

    trace!(?events, "TokioReactor: descriptor ready.");
    if !deliver(fd, generation, &watchers, events) {
      break;
    }
  }
  trace!("TokioReactor: watcher exiting.");
}

/// Runs the handler of registration `generation`, if it is still current.
/// Returns whether the registration survived the call.
fn deliver(fd: Descriptor, generation: u64, watchers: &Mutex<Watchers>, events: Interest) -> bool {
  let handler = {
    let mut guard = watchers.lock();
    match guard.entries.get_mut(&fd) {
      Some(watcher) if watcher.generation == generation => watcher.handler.take(),
      _ => None,
    }
  };
  let Some(mut handler) = handler else {
    return false;
  };

  handler(fd, events);

  let leftover = {
    let mut guard = watchers.lock();
    let leftover = match guard.entries.get_mut(&fd) {
      Some(watcher) if watcher.generation == generation => {
        watcher.handler = Some(handler);
        None
      }
      _ => Some(handler),
    };
    leftover
  };
  let survived = leftover.is_none();
  drop(leftover);
  survived
}
