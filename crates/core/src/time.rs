//! Monotonic millisecond time sources.
//!
//! Mesh components never read the wall clock themselves. They take `now`
//! as an argument, and the top-level node reads it from a [`Clock`].

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Milliseconds in one second.
pub const MILLIS_PER_SECOND: u64 = 1000;

/// Source of monotonic milliseconds.
pub trait Clock {
    /// Current time in milliseconds since an arbitrary, fixed origin.
    fn now(&self) -> u64;
}

/// Clock backed by `std::time::Instant`, counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the moment of the call.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulations.
///
/// Clones share the same underlying time, so a harness can keep one
/// handle while a node owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current: Rc<Cell<u64>>,
}

impl ManualClock {
    /// Clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock starting at `millis`.
    pub fn at(millis: u64) -> Self {
        Self {
            current: Rc::new(Cell::new(millis)),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, millis: u64) {
        self.current.set(millis);
    }

    /// Move time forward.
    pub fn advance(&self, millis: u64) {
        self.current.set(self.current.get().saturating_add(millis));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.current.get()
    }
}
