//! Serialized sharing.
//!
//! The allocators are single-threaded objects. [`Serialized`] puts one behind
//! a `parking_lot::Mutex` so it can be shared across threads; every call
//! runs under the lock.

use parking_lot::{Mutex, MutexGuard};

/// An allocator shared under a mutex.
#[derive(Debug, Default)]
pub struct Serialized<T> {
    inner: Mutex<T>,
}

impl<T> Serialized<T> {
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Run `f` with exclusive access.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Lock for a sequence of calls.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Non-blocking variant of [`lock`](Self::lock).
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
