//! Recursive mutual exclusion with scope-bound release.
use core::marker::PhantomData;

use crate::port::PortSync;

/// A recursive mutex.
///
/// The owning thread may lock it again without deadlocking; the lock is
/// released once the matching number of guards have been dropped. Release is
/// tied to [`MutexGuard`], so an unlock by a non-owning thread is not
/// expressible through this interface.
pub struct Mutex<P: PortSync> {
    raw: P::Mutex,
}

impl<P: PortSync> Mutex<P> {
    pub fn new() -> Self {
        Self {
            raw: P::mutex_new(),
        }
    }

    /// Acquire the mutex, blocking until it is available. Thread context,
    /// outside any critical section.
    pub fn lock(&self) -> MutexGuard<'_, P> {
        P::mutex_lock(&self.raw);
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }
}

impl<P: PortSync> Default for Mutex<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a [`Mutex`] locked; dropping it releases one level of ownership.
///
/// Not `Send`: the release must happen on the thread that acquired.
pub struct MutexGuard<'a, P: PortSync> {
    mutex: &'a Mutex<P>,
    _not_send: PhantomData<*mut ()>,
}

impl<P: PortSync> Drop for MutexGuard<'_, P> {
    fn drop(&mut self) {
        P::mutex_unlock(&self.mutex.raw);
    }
}
