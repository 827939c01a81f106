use crate::reactor::{Descriptor, Interest, Reactor, ReadinessHandler, ScheduledCallback};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;

use parking_lot::Mutex;
use tracing::trace;

/// Upper bound on turns taken by [`ManualReactor::run_until_idle`].
const MAX_IDLE_TURNS: usize = 10_000;

struct Registration {
  interest: Interest,
  // `None` while the handler is being invoked.
  handler: Option<ReadinessHandler>,
  generation: u64,
}

#[derive(Default)]
struct ManualState {
  registrations: HashMap<Descriptor, Registration>,
  scheduled: VecDeque<ScheduledCallback>,
  next_generation: u64,
  refuse_registrations: bool,
}

/// A reactor that only does something when told to.
///
/// Readiness is delivered with [`fire`](Self::fire), deferred callbacks run in
/// [`run_scheduled`](Self::run_scheduled). Useful for embedding the pool in an
/// event loop the caller already owns, and for deterministic tests.
#[derive(Default)]
pub struct ManualReactor {
  state: Mutex<ManualState>,
}

impl fmt::Debug for ManualReactor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("ManualReactor")
      .field("registrations", &state.registrations.len())
      .field("scheduled", &state.scheduled.len())
      .finish_non_exhaustive()
  }
}

impl ManualReactor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes every following `add_handler`/`update_handler` fail, as a reactor
  /// out of descriptors would.
  pub fn refuse_registrations(&self, refuse: bool) {
    self.state.lock().refuse_registrations = refuse;
  }

  pub fn is_registered(&self, fd: Descriptor) -> bool {
    self.state.lock().registrations.contains_key(&fd)
  }

  pub fn interest(&self, fd: Descriptor) -> Option<Interest> {
    self.state.lock().registrations.get(&fd).map(|r| r.interest)
  }

  pub fn registered(&self) -> Vec<Descriptor> {
    let mut fds: Vec<Descriptor> = self.state.lock().registrations.keys().copied().collect();
    fds.sort_unstable();
    fds
  }

  pub fn scheduled_count(&self) -> usize {
    self.state.lock().scheduled.len()
  }

  /// Delivers `events` to the handler of `fd` if it is interested in any of them.
  /// Returns whether a handler ran.
  pub fn fire(&self, fd: Descriptor, events: Interest) -> bool {
    let (mut handler, generation, delivered) = {
      let mut state = self.state.lock();
      let Some(registration) = state.registrations.get_mut(&fd) else {
        return false;
      };
      let delivered = Interest::from_bits(events.bits() & registration.interest.bits());
      if delivered.is_empty() {
        return false;
      }
      let Some(handler) = registration.handler.take() else {
        return false;
      };
      (handler, registration.generation, delivered)
    };

    trace!(fd, events = ?delivered, "ManualReactor: dispatching readiness.");
    handler(fd, delivered);

    let leftover = {
      let mut state = self.state.lock();
      let leftover = match state.registrations.get_mut(&fd) {
        Some(registration) if registration.generation == generation && registration.handler.is_none() => {
          registration.handler = Some(handler);
          None
        }
        // Removed or replaced while running.
        _ => Some(handler),
      };
      leftover
    };
    // Dropped outside the lock: a handler may own a lease whose checkin schedules work here.
    drop(leftover);
    true
  }

  /// Fires every registered descriptor with the interest it asked for.
  /// Returns how many handlers ran.
  pub fn fire_all(&self) -> usize {
    let ready: Vec<(Descriptor, Interest)> =
      self.state.lock().registrations.iter().map(|(fd, r)| (*fd, r.interest)).collect();
    ready.into_iter().filter(|(fd, interest)| self.fire(*fd, *interest)).count()
  }

  /// Runs deferred callbacks, including ones scheduled while running, until
  /// none remain. Returns how many ran.
  pub fn run_scheduled(&self) -> usize {
    let mut ran = 0;
    loop {
      let next = self.state.lock().scheduled.pop_front();
      match next {
        Some(callback) => {
          callback();
          ran += 1;
        }
        None => return ran,
      }
    }
  }

  /// One loop iteration: deferred callbacks, then readiness for everything registered.
  /// Returns `false` when there was nothing to do.
  pub fn turn(&self) -> bool {
    let ran = self.run_scheduled();
    let fired = self.fire_all();
    ran + fired > 0
  }

  /// Turns until nothing is left to do, treating every registered descriptor
  /// as ready. Returns the number of turns taken.
  pub fn run_until_idle(&self) -> usize {
    let mut turns = 0;
    while turns < MAX_IDLE_TURNS && self.turn() {
      turns += 1;
    }
    turns
  }
}

impl Reactor for ManualReactor {
  fn add_handler(&self, fd: Descriptor, interest: Interest, handler: ReadinessHandler) -> io::Result<()> {
    let mut state = self.state.lock();
    if state.refuse_registrations {
      return Err(io::Error::other("reactor refused registration"));
    }
    if state.registrations.contains_key(&fd) {
      return Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("descriptor {} already has a handler", fd),
      ));
    }
    state.next_generation += 1;
    let generation = state.next_generation;
    state.registrations.insert(
      fd,
      Registration {
        interest,
        handler: Some(handler),
        generation,
      },
    );
    trace!(fd, ?interest, "ManualReactor: handler added.");
    Ok(())
  }

  fn update_handler(&self, fd: Descriptor, interest: Interest) -> io::Result<()> {
    let mut state = self.state.lock();
    if state.refuse_registrations {
      return Err(io::Error::other("reactor refused registration"));
    }
    match state.registrations.get_mut(&fd) {
      Some(registration) => {
        registration.interest = interest;
        trace!(fd, ?interest, "ManualReactor: handler updated.");
        Ok(())
      }
      None => Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("descriptor {} has no handler", fd),
      )),
    }
  }

  fn remove_handler(&self, fd: Descriptor) {
    let removed = self.state.lock().registrations.remove(&fd);
    if removed.is_some() {
      trace!(fd, "ManualReactor: handler removed.");
    }
    drop(removed);
  }

  fn schedule(&self, callback: ScheduledCallback) {
    self.state.lock().scheduled.push_back(callback);
  }
}
