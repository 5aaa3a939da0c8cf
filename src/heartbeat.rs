//! The all-tasks-must-heartbeat rule behind the hardware watchdog.
//!
//! Every long-running task ORs its bit into a shared vector once per loop
//! iteration. The master task checks the vector after each of its own
//! iterations and feeds the hardware watchdog only when every watched task
//! has reported; a single hung task therefore starves the watchdog and the
//! board reboots.

use portable_atomic::{AtomicU8, Ordering};

/// The four watched tasks, one bit each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TaskId {
    Ui = 0,
    CardId = 1,
    CommControl = 2,
    CommReceive = 3,
}

const WATCHED_TASKS: u8 = 0x0F;

/// The shared heartbeat vector.
pub struct Heartbeat {
    vector: AtomicU8,
}

impl Heartbeat {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            vector: AtomicU8::new(0),
        }
    }

    /// Reports one task loop iteration. Callable from any task.
    pub fn mark(&self, task: TaskId) {
        self.vector.fetch_or(1 << task as u8, Ordering::Relaxed);
    }

    /// True when every watched task reported since the last reset; the
    /// vector is cleared only in that case.
    pub fn all_alive(&self) -> bool {
        if self.vector.load(Ordering::Relaxed) & WATCHED_TASKS == WATCHED_TASKS {
            self.vector.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// The hardware watchdog as the master task sees it.
pub trait FeedWatchdog {
    fn feed(&mut self);
}
