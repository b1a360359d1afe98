//! Critical sections and the token-gated cells they unlock.
//!
//! All shared state that is mutated from both thread and interrupt context
//! lives in [`CpuLockCell`]s. A cell can only be read or written through a
//! [`CpuLockToken`], and the only way to obtain a token is to enter a
//! critical section, so the "mutated only under the critical section"
//! invariant is enforced by the type system rather than by convention.
//!
//! Three entry points exist because the supported cores cannot use the same
//! entry sequence in every context:
//!
//!  - [`lock`]: thread context.
//!  - [`lock_from_interrupt`]: interrupt context.
//!  - [`lock_any`]: context-agnostic; slower, for code paths (such as a
//!    shared ISR demultiplexer's helpers) that do not statically know their
//!    caller's context. Prefer the statically-resolved pair wherever the
//!    context *is* known.
//!
//! The saved status captured on entry is consumed exactly once, on guard
//! drop; its encoding is private to the port and must never be interpreted.
//! Critical sections do not nest through these guards, and a guard must not
//! be held across a blocking call; [`CriticalGuard::suspend_while`] is the
//! single sanctioned escape for the suspend/enqueue primitives.
use core::{marker::PhantomData, ops};
use tokenlock::{SingletonTokenId, UnsyncTokenLock};

use crate::port::PortInterrupts;

pub struct CpuLockTag<P>(PhantomData<P>);

/// The key that "unlocks" [`CpuLockCell`]. Borrowed from the guard types in
/// this module.
pub type CpuLockToken<P> = tokenlock::UnsyncSingletonToken<CpuLockTag<P>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub type CpuLockKeyhole<P> = tokenlock::SingletonTokenId<CpuLockTag<P>>;

/// Cell type holding state that belongs to the critical section of port `P`.
pub struct CpuLockCell<P, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<P>>);

impl<P, T> CpuLockCell<P, T> {
    pub const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(SingletonTokenId::new(), x))
    }
}

impl<P, T: ?Sized> ops::Deref for CpuLockCell<P, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<P>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P, T: ?Sized> ops::DerefMut for CpuLockCell<P, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Construct the singleton token.
///
/// # Safety
///
/// The caller must have just entered a critical section, which guarantees
/// that no other instance of `CpuLockToken<P>` exists.
unsafe fn assume_cpu_lock<P: PortInterrupts>() -> CpuLockToken<P> {
    // Safety: upheld by the caller
    unsafe { CpuLockToken::new_unchecked() }
}

/// Enter a critical section from thread context and get an RAII guard.
///
/// Not reentrant; must be paired (by dropping the guard) and must not be
/// held across a blocking call.
pub fn lock<P: PortInterrupts>() -> CriticalGuard<P> {
    P::enter_critical();
    CriticalGuard {
        // Safety: we just entered the critical section
        token: unsafe { assume_cpu_lock() },
    }
}

/// RAII guard for a thread-context critical section.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub struct CriticalGuard<P: PortInterrupts> {
    token: CpuLockToken<P>,
}

impl<P: PortInterrupts> CriticalGuard<P> {
    /// Release the critical section for the duration of `f`, then reacquire
    /// it.
    ///
    /// This is how the suspend and enqueue primitives block while their
    /// caller logically remains inside a critical section. The closure runs
    /// with the section released, so any state read before the call must be
    /// revalidated afterwards.
    pub fn suspend_while<R>(&mut self, f: impl FnOnce() -> R) -> R {
        P::leave_critical();
        let value = f();
        P::enter_critical();
        value
    }
}

impl<P: PortInterrupts> Drop for CriticalGuard<P> {
    fn drop(&mut self) {
        P::leave_critical();
    }
}

impl<P: PortInterrupts> ops::Deref for CriticalGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: PortInterrupts> ops::DerefMut for CriticalGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Enter a critical section from interrupt context.
pub fn lock_from_interrupt<P: PortInterrupts>() -> IsrCriticalGuard<P> {
    let status = P::enter_critical_from_interrupt();
    IsrCriticalGuard {
        status,
        // Safety: we just entered the critical section
        token: unsafe { assume_cpu_lock() },
    }
}

/// RAII guard for an interrupt-context critical section. Dropping it
/// restores the saved interrupt-priority state and requests the deferred
/// context switch if one became due inside the section.
pub struct IsrCriticalGuard<P: PortInterrupts> {
    status: P::RawIsrStatus,
    token: CpuLockToken<P>,
}

impl<P: PortInterrupts> Drop for IsrCriticalGuard<P> {
    fn drop(&mut self) {
        P::leave_critical_from_interrupt(self.status);
    }
}

impl<P: PortInterrupts> ops::Deref for IsrCriticalGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: PortInterrupts> ops::DerefMut for IsrCriticalGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Enter a critical section from either context.
///
/// Inspects whether the core is servicing an interrupt to decide which
/// underlying mechanism to use. More expensive than [`lock`] or
/// [`lock_from_interrupt`]; use those when the calling context is known.
pub fn lock_any<P: PortInterrupts>() -> AnyContextGuard<P> {
    let status = if P::is_interrupt_context() {
        SavedStatus::Interrupt {
            enabled: P::disable_interrupts(),
        }
    } else {
        P::enter_critical();
        SavedStatus::Thread
    };
    AnyContextGuard {
        status,
        // Safety: we just entered the critical section
        token: unsafe { assume_cpu_lock() },
    }
}

enum SavedStatus {
    Thread,
    Interrupt { enabled: bool },
}

/// RAII guard for a context-agnostic critical section. The captured status
/// is opaque to callers and restored exactly once, on drop.
pub struct AnyContextGuard<P: PortInterrupts> {
    status: SavedStatus,
    token: CpuLockToken<P>,
}

impl<P: PortInterrupts> Drop for AnyContextGuard<P> {
    fn drop(&mut self) {
        match self.status {
            SavedStatus::Thread => P::leave_critical(),
            SavedStatus::Interrupt { enabled } => P::restore_interrupts(enabled),
        }
    }
}

impl<P: PortInterrupts> ops::Deref for AnyContextGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: PortInterrupts> ops::DerefMut for AnyContextGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
