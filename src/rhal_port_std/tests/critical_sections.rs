//! Critical sections and token-gated cells over the hosted port.
use rhal_osal::{critical, critical::CpuLockCell, interrupt};
use rhal_port_std::{init_logging, simulate_interrupt, StdPort};

/// A static cell written from thread context is seen, and updatable, from
/// simulated interrupt context.
#[test]
fn cell_is_shared_across_contexts() {
    init_logging();
    static COUNTER: CpuLockCell<StdPort, u32> = CpuLockCell::new(0);
    {
        let mut guard = critical::lock::<StdPort>();
        COUNTER.replace(&mut *guard, 5);
    }
    simulate_interrupt(|| {
        interrupt::scope::<StdPort, _>(|| {
            let mut token = critical::lock_from_interrupt::<StdPort>();
            let value = COUNTER.get(&*token);
            COUNTER.replace(&mut *token, value + 1);
        })
    });
    let guard = critical::lock::<StdPort>();
    assert_eq!(COUNTER.get(&*guard), 6);
}

/// The context-agnostic lock picks the right mechanism in both contexts.
#[test]
fn lock_any_resolves_context() {
    init_logging();
    static CELL: CpuLockCell<StdPort, u32> = CpuLockCell::new(0);
    {
        let mut guard = critical::lock_any::<StdPort>();
        CELL.replace(&mut *guard, 1);
    }
    simulate_interrupt(|| {
        let mut guard = critical::lock_any::<StdPort>();
        let value = CELL.get(&*guard);
        CELL.replace(&mut *guard, value + 1);
    });
    let guard = critical::lock_any::<StdPort>();
    assert_eq!(CELL.get(&*guard), 2);
}

/// Concurrent read-modify-write sequences under the lock never lose an
/// update.
#[test]
fn critical_sections_exclude_each_other() {
    init_logging();
    static TALLY: CpuLockCell<StdPort, u64> = CpuLockCell::new(0);
    const PER_THREAD: u64 = 1000;
    let workers: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                for _ in 0..PER_THREAD {
                    let mut guard = critical::lock::<StdPort>();
                    let value = TALLY.get(&*guard);
                    TALLY.replace(&mut *guard, value + 1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let guard = critical::lock::<StdPort>();
    assert_eq!(TALLY.get(&*guard), 4 * PER_THREAD);
}

/// Entering a thread-context critical section while already inside one is a
/// fatal contract violation.
#[test]
#[should_panic(expected = "reentrantly")]
fn reentrant_lock_panics() {
    init_logging();
    let _outer = critical::lock::<StdPort>();
    let _inner = critical::lock::<StdPort>();
}
