//! Queues of blocked threads.
//!
//! A [`ThreadQueue`] is the multi-waiter counterpart of
//! [`ThreadRef`](crate::thread::ThreadRef): any number of threads park on it
//! and an interrupt handler releases them one at a time or all at once. It is
//! backed by a counting semaphore, so a release that arrives while no thread
//! is parked is banked and satisfies the next arrival instead of being lost.
use crate::critical::{CpuLockToken, CriticalGuard};
use crate::error::TimeoutError;
use crate::port::PortSync;
use crate::time::Deadline;

/// A queue of threads waiting for an event.
pub struct ThreadQueue<P: PortSync> {
    waiters: P::Semaphore,
}

impl<P: PortSync> ThreadQueue<P> {
    /// Construct an empty queue with no banked releases.
    pub fn new() -> Self {
        Self {
            waiters: P::semaphore_new(0),
        }
    }

    /// Park the calling thread on the queue until it is released or the
    /// deadline expires.
    ///
    /// The caller holds a critical section; it is exited for the duration of
    /// the wait and re-entered before this returns, in both outcomes.
    ///
    /// With [`Deadline::Immediate`] this consumes a banked release if one is
    /// available and otherwise reports a timeout without blocking.
    pub fn enqueue(
        &self,
        guard: &mut CriticalGuard<P>,
        deadline: Deadline,
    ) -> Result<(), TimeoutError> {
        guard.suspend_while(|| P::semaphore_take(&self.waiters, deadline))
    }

    /// Release the longest-waiting thread, or bank one release if the queue
    /// is empty. Interrupt context, inside a critical section.
    pub fn dequeue_next(&self, _token: &mut CpuLockToken<P>) {
        P::semaphore_give_from_interrupt(&self.waiters);
    }

    /// Release every thread currently parked on the queue.
    ///
    /// Threads that enqueue while the drain is in progress are released as
    /// well; no release is banked for threads that are not waiting. Interrupt
    /// context, inside a critical section.
    pub fn dequeue_all(&self, _token: &mut CpuLockToken<P>) {
        while P::semaphore_waiting(&self.waiters) != 0 {
            P::semaphore_give_from_interrupt(&self.waiters);
        }
    }

    /// The number of threads currently parked on the queue and not yet due
    /// to be released. Callable from any context, inside a critical section.
    pub fn waiting(&self, _token: &CpuLockToken<P>) -> usize {
        P::semaphore_waiting(&self.waiters)
    }
}

impl<P: PortSync> Default for ThreadQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}
