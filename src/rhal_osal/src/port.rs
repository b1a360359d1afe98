//! The interface to the underlying kernel.
//!
//! The abstraction layer is defined purely in terms of the semantics the
//! drivers need, not of any one kernel's primitive names. Each supported
//! kernel provides these facilities in its own *port* crate by implementing
//! the traits below on a marker type; all public types in this crate are
//! generic over that type.
//!
//! Implementations over a notification-based kernel and over one with
//! explicit wait objects are both known to fit this contract; the hosted
//! simulator in `rhal_port_std` is a third.
use core::fmt;

use crate::{error::TimeoutError, time::Deadline};

/// Interrupt masking and critical-section entry.
///
/// Thread context and interrupt context use different instruction sequences
/// on the supported cores, so the two entry points are distinct; callers
/// that do not statically know their context go through
/// [`crate::critical::lock_any`], which picks the mechanism at runtime using
/// [`is_interrupt_context`](Self::is_interrupt_context).
pub trait PortInterrupts: 'static + Sized {
    /// Saved interrupt-priority state produced by
    /// [`enter_critical_from_interrupt`](Self::enter_critical_from_interrupt).
    /// The encoding is the port's own business.
    type RawIsrStatus: Copy;

    /// Whether the core is currently servicing any interrupt.
    fn is_interrupt_context() -> bool;

    /// Enter a critical section from thread context.
    ///
    /// Not reentrant. The port should detect nested entry where it can and
    /// treat it as a fatal contract violation.
    fn enter_critical();

    /// Leave a critical section entered by [`enter_critical`](Self::enter_critical).
    fn leave_critical();

    /// Enter a critical section from interrupt context.
    fn enter_critical_from_interrupt() -> Self::RawIsrStatus;

    /// Leave an interrupt-context critical section. If a primitive invoked
    /// inside the section woke a higher-priority thread, the port requests
    /// the context-switch here.
    fn leave_critical_from_interrupt(status: Self::RawIsrStatus);

    /// Globally disable interrupts and report whether they were enabled
    /// before. Used by the context-agnostic lock when running inside an
    /// interrupt handler.
    fn disable_interrupts() -> bool;

    /// Restore the interrupt-enable state saved by
    /// [`disable_interrupts`](Self::disable_interrupts).
    fn restore_interrupts(enabled: bool);

    /// Clear the deferred "a higher-priority thread was woken" flag.
    /// Called at the top of every interrupt handler.
    fn clear_pending_wakeup();

    /// Perform a context-switch yield if the deferred wakeup flag was set
    /// since the last [`clear_pending_wakeup`](Self::clear_pending_wakeup).
    /// Called at the bottom of every interrupt handler.
    fn yield_if_wakeup_pending();
}

/// Thread identity, sticky notifications, and the tick clock.
pub trait PortThreading: PortInterrupts {
    /// The system tick frequency, used by the time conversions in
    /// [`crate::time`].
    const TICK_RATE_HZ: u32;

    /// Identifies a kernel thread. Only ever produced by
    /// [`current_thread`](Self::current_thread) and consumed by the notify
    /// operations.
    type ThreadId: Copy + PartialEq + Eq + fmt::Debug + Send + 'static;

    /// The identity of the calling thread.
    fn current_thread() -> Self::ThreadId;

    /// Discard any notification pending on the calling thread. Invoked when
    /// a thread-context critical section is entered, so that a stale
    /// notification from before the section cannot satisfy a suspension
    /// started inside it.
    fn clear_notification();

    /// Block the calling thread until a notification value arrives or the
    /// deadline expires.
    ///
    /// Notifications are *sticky*: a value delivered while the thread is not
    /// waiting is stored and consumed by the next wait. A later delivery
    /// overwrites an unconsumed one.
    ///
    /// Must be called from thread context, outside any critical section.
    fn wait_notification(deadline: Deadline) -> Result<u32, TimeoutError>;

    /// Deliver a notification value to `thread` and reschedule immediately.
    /// Thread context only.
    fn notify(thread: Self::ThreadId, value: u32);

    /// Deliver a notification value to `thread` without rescheduling; the
    /// interrupt epilogue performs the reschedule. Sets the deferred wakeup
    /// flag if a higher-priority thread became runnable.
    fn notify_from_interrupt(thread: Self::ThreadId, value: u32);

    /// Suspend the calling thread for the given number of ticks.
    fn sleep(ticks: u32);

    /// The number of ticks elapsed since kernel start, wrapping.
    fn tick_count() -> u32;
}

/// Counting semaphores and recursive mutexes.
pub trait PortSync: PortInterrupts {
    /// A counting semaphore. The count represents banked wakeups, not
    /// waiting threads.
    type Semaphore: 'static + Send + Sync;

    fn semaphore_new(count: u32) -> Self::Semaphore;

    /// Acquire one count, blocking up to `deadline`. With
    /// [`Deadline::Immediate`] this is a non-blocking poll.
    fn semaphore_take(sem: &Self::Semaphore, deadline: Deadline) -> Result<(), TimeoutError>;

    /// Post one count. Interrupt-safe, non-blocking; sets the deferred
    /// wakeup flag if a waiter became runnable.
    fn semaphore_give_from_interrupt(sem: &Self::Semaphore);

    /// The number of threads blocked in
    /// [`semaphore_take`](Self::semaphore_take) that are not yet covered by
    /// a posted count.
    fn semaphore_waiting(sem: &Self::Semaphore) -> usize;

    /// A recursive mutex. Unlocking from a thread that does not own it is a
    /// fatal contract violation, which the port must detect.
    type Mutex: 'static + Send + Sync;

    fn mutex_new() -> Self::Mutex;
    fn mutex_lock(mutex: &Self::Mutex);
    fn mutex_unlock(mutex: &Self::Mutex);
}

/// A free-running CPU cycle counter, consumed by
/// [`crate::time::polled_delay`].
pub trait PortCycleCounter: 'static {
    /// The current cycle count, wrapping.
    fn cycle_count() -> u32;
}

/// The complete set of kernel facilities the abstraction layer builds on.
pub trait Port: PortInterrupts + PortThreading + PortSync {}
impl<T: PortInterrupts + PortThreading + PortSync> Port for T {}
