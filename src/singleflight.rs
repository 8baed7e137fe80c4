//! Non-blocking single-flight gates.
//!
//! Each logical resource that must not run overlapping passes (one for
//! "sync", one for "build") owns a [`SingleFlight`] instance.  `try_begin`
//! either hands back a guard or reports that a pass is already in flight;
//! the guard releases the gate when dropped, so every exit path -- early
//! `?` returns included -- frees it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

/// A gate that admits at most one holder at a time, without blocking.
#[derive(Debug, Clone)]
pub struct SingleFlight {
    name: &'static str,
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    /// Create a released gate named for its resource (used in logs only).
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attempt to acquire the gate.
    ///
    /// Returns `None` when another holder is active.  Callers decide what
    /// contention means: the synchronizer skips (coalescing), the build
    /// runner reports an error.
    pub fn try_begin(&self) -> Option<SingleFlightGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(gate = self.name, "single-flight gate acquired");
            Some(SingleFlightGuard {
                name: self.name,
                busy: Arc::clone(&self.busy),
            })
        } else {
            debug!(gate = self.name, "single-flight gate busy");
            None
        }
    }

    /// Whether a pass currently holds the gate.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the owning [`SingleFlight`] on drop.
#[derive(Debug)]
pub struct SingleFlightGuard {
    name: &'static str,
    busy: Arc<AtomicBool>,
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        debug!(gate = self.name, "single-flight gate released");
    }
}
