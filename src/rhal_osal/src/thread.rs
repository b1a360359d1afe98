//! Thread suspension with a wake-up payload.
use crate::{
    critical::{CpuLockCell, CpuLockToken, CriticalGuard},
    error::TimeoutError,
    port::{Port, PortThreading},
    time::Deadline,
};

/// A slot denoting "the thread currently blocked waiting here".
///
/// The blocking thread records its own identity immediately before it
/// suspends; exactly one resume operation consumes the record and delivers
/// a payload word. Device drivers embed one of these per pending operation
/// and complete it from the interrupt handler.
pub struct ThreadRef<P: PortThreading> {
    slot: CpuLockCell<P, Option<P::ThreadId>>,
}

impl<P: Port> ThreadRef<P> {
    pub const fn new() -> Self {
        Self {
            slot: CpuLockCell::new(None),
        }
    }

    /// Record the calling thread in the slot and suspend it until a resume
    /// delivers a payload or the deadline expires.
    ///
    /// The caller must be inside a thread-context critical section; the
    /// section is released while the thread is blocked and reacquired
    /// before returning. [`Deadline::Immediate`] does not suspend and
    /// reports a timeout directly. On timeout the slot is cleared and
    /// nothing else happens.
    pub fn suspend(
        &self,
        guard: &mut CriticalGuard<P>,
        deadline: Deadline,
    ) -> Result<u32, TimeoutError> {
        if deadline == Deadline::Immediate {
            return Err(TimeoutError);
        }
        debug_assert!(
            self.slot.read(&**guard).is_none(),
            "another thread is already suspended on this reference"
        );
        self.slot
            .replace(&mut **guard, Some(P::current_thread()));
        let result = guard.suspend_while(|| P::wait_notification(deadline));
        if result.is_err() {
            // Timed out: withdraw the record ourselves.
            self.slot.replace(&mut **guard, None);
        }
        result
    }

    /// Whether a thread is currently recorded in the slot.
    pub fn is_waiting(&self, token: &CpuLockToken<P>) -> bool {
        self.slot.read(token).is_some()
    }

    /// Wake the recorded thread, delivering `value`, and reschedule
    /// immediately. Thread context only.
    ///
    /// Does nothing if no thread is recorded; the waiter may have timed
    /// out concurrently; its record is consumed by the timeout path in that
    /// case.
    pub fn resume(&self, token: &mut CpuLockToken<P>, value: u32) {
        if let Some(thread) = self.slot.replace(&mut *token, None) {
            P::notify(thread, value);
        }
    }

    /// Wake the recorded thread, delivering `value`, without rescheduling;
    /// the interrupt epilogue performs the reschedule.
    pub fn resume_from_interrupt(&self, token: &mut CpuLockToken<P>, value: u32) {
        if let Some(thread) = self.slot.replace(&mut *token, None) {
            P::notify_from_interrupt(thread, value);
        }
    }
}

impl<P: Port> Default for ThreadRef<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Suspend the calling thread for the given number of ticks.
pub fn sleep<P: PortThreading>(ticks: u32) {
    P::sleep(ticks);
}

/// Suspend the calling thread for the specified number of seconds, rounded
/// up to the next tick boundary.
pub fn sleep_secs<P: PortThreading>(secs: u32) {
    P::sleep(crate::time::secs_to_ticks::<P>(secs));
}

/// Suspend the calling thread for the specified number of milliseconds,
/// rounded up to the next tick boundary.
pub fn sleep_millis<P: PortThreading>(millis: u32) {
    P::sleep(crate::time::millis_to_ticks::<P>(millis));
}

/// Suspend the calling thread for the specified number of microseconds,
/// rounded up to the next tick boundary.
pub fn sleep_micros<P: PortThreading>(micros: u32) {
    P::sleep(crate::time::micros_to_ticks::<P>(micros));
}
