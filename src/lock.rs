//! Per-node reader-writer lock.
//!
//! Inserts, point lookups and updates hold a node's read lock; only splits
//! take the write lock. A held guard is the proof that the lock is held:
//! operations that mutate a node's arrays take `&WriteGuard` and the guard
//! releases the lock on drop (panic-safe).
//!
//! ```rust,ignore
//! let read = node.lock().read();
//! // ... claim a slot, publish an entry ...
//! drop(read);
//! ```

use std::fmt;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reader-writer lock guarding one inner node.
pub struct NodeLock {
    inner: RwLock<()>,
}

/// Shared hold on a [`NodeLock`].
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct ReadGuard<'a> {
    lock: &'a NodeLock,
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive hold on a [`NodeLock`].
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct WriteGuard<'a> {
    lock: &'a NodeLock,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl NodeLock {
    /// Unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: RwLock::new(()),
        }
    }

    /// Acquire shared.
    #[inline]
    pub fn read(&self) -> ReadGuard<'_> {
        ReadGuard {
            lock: self,
            _guard: self.inner.read(),
        }
    }

    /// Acquire exclusive.
    #[inline]
    pub fn write(&self) -> WriteGuard<'_> {
        WriteGuard {
            lock: self,
            _guard: self.inner.write(),
        }
    }

    /// Whether any guard is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Whether the write guard is held.
    #[must_use]
    pub fn is_locked_exclusive(&self) -> bool {
        self.inner.is_locked_exclusive()
    }
}

impl Default for NodeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLock")
            .field("locked", &self.is_locked())
            .field("exclusive", &self.is_locked_exclusive())
            .finish()
    }
}

impl ReadGuard<'_> {
    /// Debug-mode check that this guard belongs to `lock`.
    #[inline(always)]
    pub fn assert_holds(&self, lock: &NodeLock) {
        debug_assert!(std::ptr::eq(self.lock, lock), "read guard for a different node");
        debug_assert!(lock.is_locked() && !lock.is_locked_exclusive());
    }
}

impl WriteGuard<'_> {
    /// Debug-mode check that this guard belongs to `lock`.
    #[inline(always)]
    pub fn assert_holds(&self, lock: &NodeLock) {
        debug_assert!(std::ptr::eq(self.lock, lock), "write guard for a different node");
        debug_assert!(lock.is_locked_exclusive());
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadGuard")
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteGuard")
    }
}
