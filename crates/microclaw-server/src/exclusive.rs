//! Exclusive access to the serial link for build/flash runs.
//!
//! The flag has two states, [`ExclusiveState::Idle`] and
//! [`ExclusiveState::Held`]. The only way into `Held` is
//! [`ExclusiveFlag::try_acquire`], which returns an [`ExclusiveGuard`]; the
//! only way back is dropping that guard. Every exit path of an orchestrated
//! run, including early returns and panics, therefore clears the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveState {
    Idle,
    Held,
}

/// Process-wide "build or flash in progress" flag.
#[derive(Debug, Default)]
pub struct ExclusiveFlag {
    held: AtomicBool,
}

impl ExclusiveFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enter the exclusive section, or `None` if someone else is in it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ExclusiveGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                debug!("Exclusive section entered");
                ExclusiveGuard {
                    flag: Arc::clone(self),
                }
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ExclusiveState {
        if self.is_held() {
            ExclusiveState::Held
        } else {
            ExclusiveState::Idle
        }
    }
}

/// Proof of holding the exclusive section. Releases it on drop.
#[derive(Debug)]
pub struct ExclusiveGuard {
    flag: Arc<ExclusiveFlag>,
}

impl ExclusiveGuard {
    /// Whether this guard belongs to `flag`.
    pub fn guards(&self, flag: &Arc<ExclusiveFlag>) -> bool {
        Arc::ptr_eq(&self.flag, flag)
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.flag.held.store(false, Ordering::Release);
        debug!("Exclusive section left");
    }
}
