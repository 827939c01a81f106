//! The event-loop side of the pool.
//!
//! A [`Reactor`] watches descriptors for readiness and runs deferred callbacks.
//! The pool registers a handler per in-flight poll cycle and removes it once
//! the cycle ends; it never blocks waiting for I/O itself.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};

/// A socket descriptor as understood by the reactor.
pub type Descriptor = i32;

/// Set of readiness conditions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
  pub const NONE: Interest = Interest(0);
  pub const READ: Interest = Interest(0b001);
  pub const WRITE: Interest = Interest(0b010);
  pub const ERROR: Interest = Interest(0b100);

  /// Builds a set from raw bits, ignoring unknown ones.
  pub const fn from_bits(bits: u8) -> Interest {
    Interest(bits & 0b111)
  }

  pub const fn bits(self) -> u8 {
    self.0
  }

  pub const fn contains(self, other: Interest) -> bool {
    self.0 & other.0 == other.0
  }

  pub const fn intersects(self, other: Interest) -> bool {
    self.0 & other.0 != 0
  }

  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub const fn is_readable(self) -> bool {
    self.intersects(Interest::READ)
  }

  pub const fn is_writable(self) -> bool {
    self.intersects(Interest::WRITE)
  }

  pub const fn is_error(self) -> bool {
    self.intersects(Interest::ERROR)
  }
}

impl BitOr for Interest {
  type Output = Interest;

  fn bitor(self, rhs: Interest) -> Interest {
    Interest(self.0 | rhs.0)
  }
}

impl BitOrAssign for Interest {
  fn bitor_assign(&mut self, rhs: Interest) {
    self.0 |= rhs.0;
  }
}

impl fmt::Debug for Interest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      return f.write_str("NONE");
    }
    let names = [(Interest::READ, "READ"), (Interest::WRITE, "WRITE"), (Interest::ERROR, "ERROR")];
    let mut first = true;
    for (flag, name) in names {
      if self.intersects(flag) {
        if !first {
          f.write_str(" | ")?;
        }
        f.write_str(name)?;
        first = false;
      }
    }
    Ok(())
  }
}

/// Called by the reactor with the descriptor and the conditions that fired.
pub type ReadinessHandler = Box<dyn FnMut(Descriptor, Interest) + Send + 'static>;

/// A deferred unit of work for [`Reactor::schedule`].
pub type ScheduledCallback = Box<dyn FnOnce() + Send + 'static>;

/// Readiness notification and deferred execution.
///
/// Implementations must not hold internal locks while invoking a handler or a
/// scheduled callback: both routinely call back into the reactor.
pub trait Reactor: Send + Sync + 'static {
  /// Starts watching `fd` for `interest`. A descriptor has at most one handler.
  fn add_handler(&self, fd: Descriptor, interest: Interest, handler: ReadinessHandler) -> io::Result<()>;

  /// Changes the interest of an already registered descriptor.
  fn update_handler(&self, fd: Descriptor, interest: Interest) -> io::Result<()>;

  /// Stops watching `fd`. Removing an unknown descriptor is a no-op.
  fn remove_handler(&self, fd: Descriptor);

  /// Runs `callback` later, on the reactor's own turn.
  fn schedule(&self, callback: ScheduledCallback);
}
