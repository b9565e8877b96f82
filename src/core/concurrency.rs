//! The two purpose-built synchronisation primitives the node state machine
//! relies on: a reader-biased permit over the view, and a single-slot
//! permit that serialises reshard SWITCH attempts.
//!
//! Both are realised as a small state machine guarded by a short-held
//! `std::sync::Mutex` plus a `tokio::sync::Notify`, rather than a true
//! semaphore-with-negative-count (tokio's `Semaphore` cannot go negative,
//! and the reference protocol this mirrors depends on that).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

/// Reader-biased permit: readers decrement without blocking (and without
/// blocking each other); a writer blocks until no reader holds the permit,
/// then takes it exclusively.
pub struct ViewPermit {
    count: AtomicI64,
    // Serialises transitions on `count`, matching the reference's
    // "view-change mutex" held only for the duration of the +/-1 itself.
    change: Mutex<()>,
    writer_wakeup: Notify,
}

impl ViewPermit {
    pub fn new() -> Self {
        ViewPermit {
            count: AtomicI64::new(1),
            change: Mutex::new(()),
            writer_wakeup: Notify::new(),
        }
    }

    /// Non-blocking. May drive the internal count negative under
    /// concurrent readers; that's the point.
    pub async fn acquire_read(self: &Arc<Self>) -> ReadGuard {
        let _lock = self.change.lock().await;
        self.count.fetch_sub(1, Ordering::SeqCst);
        drop(_lock);
        ReadGuard {
            permit: Arc::clone(self),
        }
    }

    /// Blocks until the count is positive (no readers outstanding), then
    /// takes it down exclusively.
    pub async fn acquire_write(self: &Arc<Self>) -> WriteGuard {
        loop {
            {
                let _lock = self.change.lock().await;
                if self.count.load(Ordering::SeqCst) > 0 {
                    self.count.fetch_sub(1, Ordering::SeqCst);
                    return WriteGuard {
                        permit: Arc::clone(self),
                    };
                }
            }
            self.writer_wakeup.notified().await;
        }
    }

    fn release(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.writer_wakeup.notify_waiters();
    }
}

impl Default for ViewPermit {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReadGuard {
    permit: Arc<ViewPermit>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.permit.release();
    }
}

pub struct WriteGuard {
    permit: Arc<ViewPermit>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.permit.release();
    }
}

/// Single-slot permit serialising reshard SWITCH (and briefly, PREPARE)
/// attempts. `try_acquire` both detects and claims the slot in one step;
/// `wait_for_release` blocks until whoever holds it releases, without
/// itself claiming anything — used by a concurrent SWITCH caller that
/// lost the race and should treat the winner's success as its own.
#[derive(Clone)]
pub struct SwitchPermit {
    inner: Arc<Mutex<()>>,
}

impl SwitchPermit {
    pub fn new() -> Self {
        SwitchPermit {
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.inner).try_lock_owned().ok()
    }

    pub async fn wait_for_release(&self) {
        let _guard = Arc::clone(&self.inner).lock_owned().await;
    }
}

impl Default for SwitchPermit {
    fn default() -> Self {
        Self::new()
    }
}
