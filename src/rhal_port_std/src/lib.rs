//! Hosted implementation of the `rhal_osal` port traits.
//!
//! [`StdPort`] simulates the kernel facilities on top of `std::thread` so
//! that the abstraction layer and the device drivers can be tested on the
//! build host:
//!
//!  - The global CPU lock is a mutex with an owner record; real host time
//!    stands in for the kernel tick clock (one tick per millisecond).
//!  - Every host thread that touches the port is registered in a slab and
//!    identified by its slab key. A per-thread slot holds the sticky
//!    notification word.
//!  - Interrupt context is a per-thread nesting counter: a "handler" runs on
//!    whatever host thread calls [`simulate_interrupt`], and the port
//!    reports interrupt context while the closure runs.
//!
//! Contract violations (reentrant critical-section entry, unlocking a mutex
//! from a non-owning thread) panic, matching the fatal treatment they get on
//! a real kernel.
use std::{
    cell::Cell,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use slab::Slab;
use spin::mutex::SpinMutex;

use rhal_osal::{
    error::TimeoutError,
    port::{PortCycleCounter, PortInterrupts, PortSync, PortThreading},
    time::Deadline,
};

/// The marker type implementing the port traits for the hosted simulator.
pub struct StdPort;

std::thread_local! {
    static THREAD_KEY: Cell<Option<usize>> = Cell::new(None);
    static INTERRUPT_DEPTH: Cell<u32> = Cell::new(0);
    static WAKEUP_PENDING: Cell<bool> = Cell::new(false);
}

/// Per-thread sticky notification slot.
struct NotifySlot {
    /// The pending notification word. A later delivery overwrites an
    /// unconsumed one.
    pending: Mutex<Option<u32>>,
    condvar: Condvar,
}

impl NotifySlot {
    fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }
}

/// Registered threads. Keys are never reused within a process, so a stale
/// `ThreadId` cannot alias a different thread.
static REGISTRY: Lazy<SpinMutex<Slab<Arc<NotifySlot>>>> =
    Lazy::new(|| SpinMutex::new(Slab::new()));

/// The simulated global CPU lock. Stores the registry key of the owning
/// thread so that reentrant entry can be detected.
struct RawCpuLock {
    owner: Mutex<Option<usize>>,
    condvar: Condvar,
}

static CPU_LOCK: Lazy<RawCpuLock> = Lazy::new(|| RawCpuLock {
    owner: Mutex::new(None),
    condvar: Condvar::new(),
});

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Register the calling thread on first use and return its key.
fn own_key() -> usize {
    THREAD_KEY.with(|cell| match cell.get() {
        Some(key) => key,
        None => {
            let key = REGISTRY.lock().insert(Arc::new(NotifySlot::new()));
            cell.set(Some(key));
            log::trace!("registered host thread as {:?}", key);
            key
        }
    })
}

fn slot_of(thread: usize) -> Arc<NotifySlot> {
    match REGISTRY.lock().get(thread) {
        Some(slot) => Arc::clone(slot),
        None => panic!("notification for an unregistered thread {:?}", thread),
    }
}

fn ticks_to_duration(ticks: u32) -> Duration {
    // One tick per millisecond (`TICK_RATE_HZ == 1000`).
    Duration::from_millis(u64::from(ticks))
}

fn acquire_cpu_lock(me: usize) -> bool {
    let mut owner = CPU_LOCK.owner.lock().unwrap();
    if *owner == Some(me) {
        return false;
    }
    while owner.is_some() {
        owner = CPU_LOCK.condvar.wait(owner).unwrap();
    }
    *owner = Some(me);
    true
}

fn release_cpu_lock(me: usize) {
    let mut owner = CPU_LOCK.owner.lock().unwrap();
    assert_eq!(
        *owner,
        Some(me),
        "critical section left by a thread that does not hold it"
    );
    *owner = None;
    drop(owner);
    CPU_LOCK.condvar.notify_one();
}

impl PortInterrupts for StdPort {
    /// Whether the simulated interrupt masking was actually engaged by this
    /// entry (nested entries observe it already engaged).
    type RawIsrStatus = bool;

    fn is_interrupt_context() -> bool {
        INTERRUPT_DEPTH.with(|depth| depth.get() != 0)
    }

    fn enter_critical() {
        let me = own_key();
        let engaged = acquire_cpu_lock(me);
        assert!(engaged, "critical section entered reentrantly");
        // Entering the section invalidates any notification delivered
        // before it, so a suspension started inside cannot complete early
        // on stale state.
        Self::clear_notification();
        log::trace!("{:?}: entered critical section", me);
    }

    fn leave_critical() {
        let me = own_key();
        release_cpu_lock(me);
        log::trace!("{:?}: left critical section", me);
    }

    fn enter_critical_from_interrupt() -> bool {
        acquire_cpu_lock(own_key())
    }

    fn leave_critical_from_interrupt(engaged: bool) {
        let me = own_key();
        if engaged {
            release_cpu_lock(me);
        }
        if WAKEUP_PENDING.with(|flag| flag.get()) {
            log::trace!("{:?}: wakeup pending at section exit", me);
        }
    }

    fn disable_interrupts() -> bool {
        acquire_cpu_lock(own_key())
    }

    fn restore_interrupts(enabled: bool) {
        if enabled {
            release_cpu_lock(own_key());
        }
    }

    fn clear_pending_wakeup() {
        WAKEUP_PENDING.with(|flag| flag.set(false));
    }

    fn yield_if_wakeup_pending() {
        if WAKEUP_PENDING.with(|flag| flag.replace(false)) {
            log::trace!("deferred context switch");
            std::thread::yield_now();
        }
    }
}

impl PortThreading for StdPort {
    const TICK_RATE_HZ: u32 = 1000;

    type ThreadId = usize;

    fn current_thread() -> usize {
        own_key()
    }

    fn clear_notification() {
        let slot = slot_of(own_key());
        *slot.pending.lock().unwrap() = None;
    }

    fn wait_notification(deadline: Deadline) -> Result<u32, TimeoutError> {
        let slot = slot_of(own_key());
        let mut pending = slot.pending.lock().unwrap();
        let limit = match deadline {
            Deadline::Immediate => return pending.take().ok_or(TimeoutError),
            Deadline::After(ticks) => Some(Instant::now() + ticks_to_duration(ticks)),
            Deadline::Infinite => None,
        };
        loop {
            if let Some(value) = pending.take() {
                return Ok(value);
            }
            pending = match limit {
                None => slot.condvar.wait(pending).unwrap(),
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(TimeoutError);
                    }
                    slot.condvar.wait_timeout(pending, limit - now).unwrap().0
                }
            };
        }
    }

    fn notify(thread: usize, value: u32) {
        let slot = slot_of(thread);
        *slot.pending.lock().unwrap() = Some(value);
        slot.condvar.notify_one();
        log::trace!("notified {:?} with {:#x}", thread, value);
        // Thread-context delivery reschedules immediately.
        std::thread::yield_now();
    }

    fn notify_from_interrupt(thread: usize, value: u32) {
        let slot = slot_of(thread);
        *slot.pending.lock().unwrap() = Some(value);
        slot.condvar.notify_one();
        WAKEUP_PENDING.with(|flag| flag.set(true));
        log::trace!("notified {:?} with {:#x} from interrupt", thread, value);
    }

    fn sleep(ticks: u32) {
        std::thread::sleep(ticks_to_duration(ticks));
    }

    fn tick_count() -> u32 {
        EPOCH.elapsed().as_millis() as u32
    }
}

/// Counting semaphore for [`StdPort`].
pub struct Semaphore {
    state: Mutex<SemState>,
    condvar: Condvar,
}

struct SemState {
    count: u32,
    waiters: usize,
}

/// Recursive mutex for [`StdPort`].
pub struct RecursiveMutex {
    state: Mutex<MutexState>,
    condvar: Condvar,
}

struct MutexState {
    owner: Option<usize>,
    depth: u32,
}

impl PortSync for StdPort {
    type Semaphore = Semaphore;

    fn semaphore_new(count: u32) -> Semaphore {
        Semaphore {
            state: Mutex::new(SemState { count, waiters: 0 }),
            condvar: Condvar::new(),
        }
    }

    fn semaphore_take(sem: &Semaphore, deadline: Deadline) -> Result<(), TimeoutError> {
        let mut state = sem.state.lock().unwrap();
        let limit = match deadline {
            Deadline::Immediate => {
                return if state.count != 0 {
                    state.count -= 1;
                    Ok(())
                } else {
                    Err(TimeoutError)
                };
            }
            Deadline::After(ticks) => Some(Instant::now() + ticks_to_duration(ticks)),
            Deadline::Infinite => None,
        };
        state.waiters += 1;
        let result = loop {
            if state.count != 0 {
                state.count -= 1;
                break Ok(());
            }
            state = match limit {
                None => sem.condvar.wait(state).unwrap(),
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        break Err(TimeoutError);
                    }
                    sem.condvar.wait_timeout(state, limit - now).unwrap().0
                }
            };
        };
        state.waiters -= 1;
        result
    }

    fn semaphore_give_from_interrupt(sem: &Semaphore) {
        let mut state = sem.state.lock().unwrap();
        state.count += 1;
        if state.waiters != 0 {
            WAKEUP_PENDING.with(|flag| flag.set(true));
        }
        drop(state);
        sem.condvar.notify_one();
    }

    fn semaphore_waiting(sem: &Semaphore) -> usize {
        let state = sem.state.lock().unwrap();
        // Waiters already due a posted count do not count as waiting.
        state.waiters.saturating_sub(state.count as usize)
    }

    type Mutex = RecursiveMutex;

    fn mutex_new() -> RecursiveMutex {
        RecursiveMutex {
            state: Mutex::new(MutexState {
                owner: None,
                depth: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    fn mutex_lock(mutex: &RecursiveMutex) {
        let me = own_key();
        let mut state = mutex.state.lock().unwrap();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            state = mutex.condvar.wait(state).unwrap();
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    fn mutex_unlock(mutex: &RecursiveMutex) {
        let me = own_key();
        let mut state = mutex.state.lock().unwrap();
        assert_eq!(
            state.owner,
            Some(me),
            "mutex unlocked by a thread that does not own it"
        );
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            mutex.condvar.notify_one();
        }
    }
}

impl PortCycleCounter for StdPort {
    fn cycle_count() -> u32 {
        // One simulated CPU cycle per nanosecond of host time.
        EPOCH.elapsed().as_nanos() as u32
    }
}

/// Run `body` in simulated interrupt context on the calling thread.
///
/// Only marks the context; the handler bracket
/// ([`rhal_osal::interrupt::scope`]) is still the caller's responsibility,
/// exactly as on hardware.
pub fn simulate_interrupt<R>(body: impl FnOnce() -> R) -> R {
    INTERRUPT_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let value = body();
    INTERRUPT_DEPTH.with(|depth| depth.set(depth.get() - 1));
    value
}

/// Initialize `env_logger` for a test binary. Repeated calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
