//! Alarm driver for the low-power timer.
//!
//! The timer is a free-running 16-bit counter that keeps counting in the
//! deepest sleep states, so it serves as the system's monotonic clock and
//! wake-up source. Two hardware quirks shape this module:
//!
//!  - The counter runs from an asynchronous clock, so a read can be torn;
//!    it must be read repeatedly until two consecutive reads agree.
//!  - Writes to the compare register cross a clock-domain bridge and only
//!    take effect once the hardware raises a "value loaded" event. Exactly
//!    one write may be in flight, so new targets arriving while a write is
//!    pending are coalesced and issued from the interrupt handler when the
//!    bridge frees up. Only the newest pending target survives.
//!
//! Alarm bookkeeping is a single word in a [`CpuLockCell`]: the 16-bit
//! target plus the `ACTIVE`, `UPDATING`, and `COMPLETING` bits. `UPDATING`
//! and `COMPLETING` are mutually exclusive; either one means the compare
//! write bridge is busy.
//!
//! A full 16-bit wrap of the counter raises the reload event, which extends
//! the counter to 32 bits in software. An alarm target of `0xFFFF` is
//! delivered on that same event, since the compare register cannot reach
//! the reload value.
use bitflags::bitflags;
use rhal_osal::critical::{self, CpuLockCell, CpuLockToken};
use rhal_osal::port::PortInterrupts;

/// The counter's reload value; it wraps to zero after this count.
pub const RELOAD: u16 = 0xFFFF;

bitflags! {
    /// Event flags of the timer, as laid out in its status register.
    pub struct TimerEvents: u32 {
        /// The counter matched the compare register.
        const COMPARE_MATCH = 1 << 0;
        /// The counter matched the reload register and wrapped.
        const RELOAD_MATCH = 1 << 1;
        /// A compare-register write has crossed the clock-domain bridge.
        const COMPARE_LOADED = 1 << 3;
        /// A reload-register write has crossed the clock-domain bridge.
        const RELOAD_LOADED = 1 << 4;
    }
}

/// Raw access to the low-power timer's registers.
pub trait LpTimerHw: Send + Sync + 'static {
    fn enable_clock(&self);
    fn disable_clock(&self);
    /// Program clock source and prescaler. Called once, before the counter
    /// is started.
    fn configure(&self);
    fn start_counter(&self);
    /// One raw counter read. May be torn; see
    /// [`LpTimer::counter`] for the stable-read protocol.
    fn counter(&self) -> u16;
    /// Issue a compare-register write. At most one may be in flight.
    fn write_compare(&self, value: u16);
    fn write_reload(&self, value: u16);
    /// The currently pending event flags, without clearing them.
    fn events(&self) -> TimerEvents;
    /// Clear the given event flags.
    fn acknowledge(&self, events: TimerEvents);
    /// Unmask or mask the compare-match and reload-match events.
    fn set_alarm_events_enabled(&self, enabled: bool);
    fn enable_vector(&self, priority: u32);
    fn disable_vector(&self);
    /// Order the preceding register writes before anything after. No-op on
    /// hosts without the relevant memory system.
    fn barrier(&self);
}

const TARGET_MASK: u32 = 0xFFFF;
/// An alarm is set and will be delivered when the counter reaches the
/// target.
const ACTIVE: u32 = 1 << 16;
/// A newer target is queued behind the in-flight compare write.
const UPDATING: u32 = 1 << 17;
/// A compare write is in flight and no newer target is queued.
const COMPLETING: u32 = 1 << 18;

struct AlarmState {
    word: u32,
    /// Completed 16-bit wraps of the counter, extending it to 32 bits.
    wraps: u32,
}

/// The alarm state machine over one low-power timer instance.
pub struct LpTimer<P: PortInterrupts, Hw: LpTimerHw> {
    hw: Hw,
    state: CpuLockCell<P, AlarmState>,
    /// Invoked from interrupt context, outside the driver's own critical
    /// section, each time an alarm is delivered.
    handler: fn(),
}

impl<P: PortInterrupts, Hw: LpTimerHw> LpTimer<P, Hw> {
    pub const fn new(hw: Hw, handler: fn()) -> Self {
        Self {
            hw,
            state: CpuLockCell::new(AlarmState { word: 0, wraps: 0 }),
            handler,
        }
    }

    /// Bring the timer up: full-range reload, idle compare, counter
    /// running, interrupt vector enabled, no alarm set.
    ///
    /// The register writes are waited out here, so later compare writes
    /// find the bridge free.
    pub fn init(&self, token: &mut CpuLockToken<P>, priority: u32) {
        self.hw.enable_clock();
        self.hw.configure();
        self.hw.write_reload(RELOAD);
        while !self.hw.events().contains(TimerEvents::RELOAD_LOADED) {}
        self.hw.acknowledge(TimerEvents::RELOAD_LOADED);
        self.hw.write_compare(RELOAD);
        while !self.hw.events().contains(TimerEvents::COMPARE_LOADED) {}
        self.hw.acknowledge(TimerEvents::COMPARE_LOADED);
        *self.state.write(token) = AlarmState { word: 0, wraps: 0 };
        self.hw.start_counter();
        self.hw.barrier();
        self.hw.enable_vector(priority);
    }

    /// Shut the timer down.
    pub fn halt(&self, token: &mut CpuLockToken<P>) {
        self.state.write(token).word = 0;
        self.hw.disable_vector();
        self.hw.disable_clock();
    }

    /// A stable read of the raw 16-bit counter. Callable from any context.
    pub fn counter(&self) -> u16 {
        let mut prev = self.hw.counter();
        loop {
            let next = self.hw.counter();
            if next == prev {
                return next;
            }
            prev = next;
        }
    }

    /// The 32-bit extended counter. Must be called inside a critical
    /// section.
    ///
    /// A wrap whose interrupt has not been serviced yet (it may be held off
    /// by the very critical section the caller is in) is accounted for
    /// here, so the returned value never steps backwards.
    pub fn time_now(&self, token: &CpuLockToken<P>) -> u32 {
        let count = self.counter();
        let mut wraps = self.state.read(token).wraps;
        if self.hw.events().contains(TimerEvents::RELOAD_MATCH) && count < RELOAD / 2 {
            // Wrapped, but the interrupt has not run yet.
            wraps = wraps.wrapping_add(1);
        }
        (wraps << 16) | u32::from(count)
    }

    /// Arm the alarm at `target` and unmask its events.
    ///
    /// Stale compare flags from a previous arming are discarded first, so a
    /// match that raced an earlier disarm cannot deliver this alarm before
    /// its own target is reached.
    pub fn start_alarm(&self, token: &mut CpuLockToken<P>, target: u16) {
        let mut stale = TimerEvents::COMPARE_MATCH;
        if self.state.read(token).word & (UPDATING | COMPLETING) == 0 {
            // No write in flight, so a pending loaded flag is stale too.
            stale |= TimerEvents::COMPARE_LOADED;
        }
        self.hw.acknowledge(stale);
        self.hw.set_alarm_events_enabled(true);
        self.set_alarm(token, target);
    }

    /// Move the alarm to `target`.
    ///
    /// If the compare write bridge is free the target goes straight to
    /// hardware. Otherwise it is queued behind the in-flight write,
    /// replacing any previously queued target; the interrupt handler issues
    /// it when the bridge frees up. Any number of retargets while the
    /// bridge is busy thus cost one further hardware write in total.
    pub fn set_alarm(&self, token: &mut CpuLockToken<P>, target: u16) {
        let state = self.state.write(token);
        debug_assert!(state.word & (UPDATING | COMPLETING) != UPDATING | COMPLETING);
        if state.word & (UPDATING | COMPLETING) != 0 {
            state.word = (state.word & !(TARGET_MASK | COMPLETING))
                | u32::from(target)
                | ACTIVE
                | UPDATING;
        } else {
            state.word = (state.word & !TARGET_MASK) | u32::from(target) | ACTIVE | COMPLETING;
            self.hw.write_compare(target);
            self.hw.barrier();
        }
    }

    /// Disarm the alarm and mask its events.
    ///
    /// An in-flight compare write is waited out first, so that its loaded
    /// event cannot arrive later and act on a disarmed alarm's bookkeeping.
    /// Compare flags raised up to this point, including a match that raced
    /// the disarm, are discarded; they belong to the alarm being stopped.
    pub fn stop_alarm(&self, token: &mut CpuLockToken<P>) {
        let state = self.state.write(token);
        if state.word & (UPDATING | COMPLETING) != 0 {
            while !self.hw.events().contains(TimerEvents::COMPARE_LOADED) {}
        }
        self.hw.set_alarm_events_enabled(false);
        self.hw
            .acknowledge(TimerEvents::COMPARE_MATCH | TimerEvents::COMPARE_LOADED);
        state.word = 0;
        self.hw.barrier();
    }

    /// Whether an alarm is armed and awaiting delivery.
    pub fn is_alarm_active(&self, token: &CpuLockToken<P>) -> bool {
        self.state.read(token).word & ACTIVE != 0
    }

    /// The most recently requested alarm target, whether or not it has
    /// reached hardware yet.
    pub fn alarm_target(&self, token: &CpuLockToken<P>) -> u16 {
        (self.state.read(token).word & TARGET_MASK) as u16
    }

    /// Service the timer interrupt.
    ///
    /// Compare-write completion is handled regardless of whether an alarm
    /// is currently armed; a disarm does not lose track of the bridge.
    /// Alarm delivery clears `ACTIVE` before the handler runs, so the alarm
    /// stays disarmed unless the handler arms it again. Must run in
    /// interrupt context, inside the handler bracket.
    pub fn serve_interrupt(&self) {
        let events = self.hw.events();
        self.hw.acknowledge(events);
        let mut deliver = false;
        {
            let mut token = critical::lock_from_interrupt::<P>();
            let state = self.state.write(&mut *token);
            if events.contains(TimerEvents::COMPARE_LOADED) {
                if state.word & UPDATING != 0 {
                    state.word = (state.word & !UPDATING) | COMPLETING;
                    self.hw.write_compare((state.word & TARGET_MASK) as u16);
                    self.hw.barrier();
                } else if state.word & COMPLETING != 0 {
                    state.word &= !COMPLETING;
                }
            }
            if events.contains(TimerEvents::RELOAD_MATCH) {
                state.wraps = state.wraps.wrapping_add(1);
                if state.word & ACTIVE != 0 && state.word & TARGET_MASK == u32::from(RELOAD) {
                    state.word &= !ACTIVE;
                    deliver = true;
                }
            }
            if events.contains(TimerEvents::COMPARE_MATCH) && state.word & ACTIVE != 0 {
                state.word &= !ACTIVE;
                deliver = true;
            }
        }
        if deliver {
            (self.handler)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhal_osal::interrupt;
    use rhal_port_std::{init_logging, simulate_interrupt, StdPort};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::vec;
    use std::vec::Vec;

    struct SimState {
        counter: u16,
        /// Values returned by successive raw counter reads before settling
        /// on `counter`. Simulates torn reads.
        counter_seq: Vec<u16>,
        compare: u16,
        reload: u16,
        events: TimerEvents,
        /// Remaining `events()` polls until a pending compare write
        /// completes. Models the clock-domain bridge delay.
        pending_load: Option<u32>,
        load_delay: u32,
        compare_writes: Vec<u16>,
        alarm_events: bool,
        vector: Option<u32>,
        clock: bool,
        running: bool,
    }

    impl Default for SimState {
        fn default() -> Self {
            Self {
                counter: 0,
                counter_seq: Vec::new(),
                compare: 0,
                reload: 0,
                events: TimerEvents::empty(),
                pending_load: None,
                load_delay: 0,
                compare_writes: Vec::new(),
                alarm_events: false,
                vector: None,
                clock: false,
                running: false,
            }
        }
    }

    #[derive(Default)]
    struct SimTimer(Mutex<SimState>);

    impl SimTimer {
        fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
            f(&mut self.0.lock().unwrap())
        }
    }

    impl LpTimerHw for SimTimer {
        fn enable_clock(&self) {
            self.with(|hw| hw.clock = true);
        }
        fn disable_clock(&self) {
            self.with(|hw| hw.clock = false);
        }
        fn configure(&self) {}
        fn start_counter(&self) {
            self.with(|hw| hw.running = true);
        }
        fn counter(&self) -> u16 {
            self.with(|hw| {
                if hw.counter_seq.is_empty() {
                    hw.counter
                } else {
                    hw.counter_seq.remove(0)
                }
            })
        }
        fn write_compare(&self, value: u16) {
            self.with(|hw| {
                assert!(hw.pending_load.is_none(), "compare write while one is in flight");
                hw.compare = value;
                hw.compare_writes.push(value);
                hw.pending_load = Some(hw.load_delay);
            });
        }
        fn write_reload(&self, value: u16) {
            self.with(|hw| {
                hw.reload = value;
                hw.events |= TimerEvents::RELOAD_LOADED;
            });
        }
        fn events(&self) -> TimerEvents {
            self.with(|hw| {
                match hw.pending_load {
                    Some(0) => {
                        hw.events |= TimerEvents::COMPARE_LOADED;
                        hw.pending_load = None;
                    }
                    Some(n) => hw.pending_load = Some(n - 1),
                    None => {}
                }
                hw.events
            })
        }
        fn acknowledge(&self, events: TimerEvents) {
            self.with(|hw| hw.events &= !events);
        }
        fn set_alarm_events_enabled(&self, enabled: bool) {
            self.with(|hw| hw.alarm_events = enabled);
        }
        fn enable_vector(&self, priority: u32) {
            self.with(|hw| hw.vector = Some(priority));
        }
        fn disable_vector(&self) {
            self.with(|hw| hw.vector = None);
        }
        fn barrier(&self) {}
    }

    fn serve(timer: &LpTimer<StdPort, SimTimer>) {
        simulate_interrupt(|| interrupt::scope::<StdPort, _>(|| timer.serve_interrupt()));
    }

    fn raise(timer: &LpTimer<StdPort, SimTimer>, events: TimerEvents) {
        timer.hw.with(|hw| hw.events |= events);
    }

    fn init_timer(handler: fn()) -> LpTimer<StdPort, SimTimer> {
        let timer = LpTimer::new(SimTimer::default(), handler);
        let mut guard = critical::lock::<StdPort>();
        timer.init(&mut guard, 4);
        timer
    }

    fn no_handler() {}

    /// Bring-up programs the full reload range, parks the compare register,
    /// starts the counter, and leaves no event pending.
    #[test]
    fn init_programs_hardware() {
        init_logging();
        let timer = init_timer(no_handler);
        timer.hw.with(|hw| {
            assert_eq!(hw.reload, RELOAD);
            assert_eq!(hw.compare, RELOAD);
            assert!(hw.running);
            assert!(hw.clock);
            assert_eq!(hw.vector, Some(4));
            assert!(hw.events.is_empty());
        });
        let guard = critical::lock::<StdPort>();
        assert!(!timer.is_alarm_active(&guard));
    }

    /// Retargets arriving while a compare write is in flight are coalesced:
    /// only the newest one reaches hardware, in a single further write.
    #[test]
    fn retargets_coalesce_while_bridge_is_busy() {
        init_logging();
        let timer = init_timer(no_handler);
        timer.hw.with(|hw| hw.load_delay = u32::MAX);
        {
            let mut guard = critical::lock::<StdPort>();
            timer.start_alarm(&mut guard, 0x1000);
            timer.set_alarm(&mut guard, 0x2000);
            timer.set_alarm(&mut guard, 0x3000);
            assert_eq!(timer.alarm_target(&guard), 0x3000);
        }
        // Only the first target went to hardware so far.
        assert_eq!(
            timer.hw.with(|hw| hw.compare_writes.clone()),
            [RELOAD, 0x1000]
        );
        // The bridge frees up: the queued target is issued from the
        // interrupt handler.
        timer.hw.with(|hw| {
            hw.pending_load = None;
            hw.events |= TimerEvents::COMPARE_LOADED;
        });
        serve(&timer);
        assert_eq!(
            timer.hw.with(|hw| hw.compare_writes.clone()),
            [RELOAD, 0x1000, 0x3000]
        );
        // And its own completion closes the pipeline.
        timer.hw.with(|hw| {
            hw.pending_load = None;
            hw.events |= TimerEvents::COMPARE_LOADED;
        });
        serve(&timer);
        let guard = critical::lock::<StdPort>();
        assert!(timer.is_alarm_active(&guard));
        assert_eq!(timer.alarm_target(&guard), 0x3000);
    }

    /// A compare match delivers the alarm exactly once and disarms it.
    #[test]
    fn match_delivers_once() {
        init_logging();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn count() {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }
        let timer = init_timer(count);
        {
            let mut guard = critical::lock::<StdPort>();
            timer.start_alarm(&mut guard, 0x0800);
        }
        raise(&timer, TimerEvents::COMPARE_MATCH);
        serve(&timer);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        {
            let guard = critical::lock::<StdPort>();
            assert!(!timer.is_alarm_active(&guard));
        }
        // A spurious later match on the stale compare value is ignored.
        raise(&timer, TimerEvents::COMPARE_MATCH);
        serve(&timer);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    /// A target equal to the reload value is delivered on the wrap event.
    #[test]
    fn reload_target_delivers_on_wrap() {
        init_logging();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn count() {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }
        let timer = init_timer(count);
        {
            let mut guard = critical::lock::<StdPort>();
            timer.start_alarm(&mut guard, RELOAD);
        }
        raise(&timer, TimerEvents::RELOAD_MATCH);
        serve(&timer);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        let guard = critical::lock::<StdPort>();
        assert!(!timer.is_alarm_active(&guard));
        assert_eq!(timer.time_now(&guard) >> 16, 1);
    }

    /// The extended time never steps backwards across a wrap, even when the
    /// wrap interrupt has not been serviced yet.
    #[test]
    fn time_is_monotonic_across_wrap() {
        init_logging();
        let timer = init_timer(no_handler);
        let guard = critical::lock::<StdPort>();
        timer.hw.with(|hw| hw.counter = 0xFFF0);
        let before = timer.time_now(&guard);
        // The counter wraps while the wrap interrupt is held off.
        timer.hw.with(|hw| {
            hw.counter = 0x0005;
            hw.events |= TimerEvents::RELOAD_MATCH;
        });
        let pending = timer.time_now(&guard);
        assert!(pending > before);
        assert_eq!(pending, 0x0001_0005);
        drop(guard);
        serve(&timer);
        let guard = critical::lock::<StdPort>();
        assert_eq!(timer.time_now(&guard), 0x0001_0005);
    }

    /// Raw counter reads are retried until two consecutive reads agree.
    #[test]
    fn torn_counter_reads_are_retried() {
        init_logging();
        let timer = init_timer(no_handler);
        timer.hw.with(|hw| {
            hw.counter_seq = vec![0x00FF, 0x0100];
            hw.counter = 0x0100;
        });
        assert_eq!(timer.counter(), 0x0100);
    }

    /// Disarming waits out an in-flight compare write, masks the alarm
    /// events, and leaves the state machine idle.
    #[test]
    fn stop_waits_out_the_bridge() {
        init_logging();
        let timer = init_timer(no_handler);
        timer.hw.with(|hw| hw.load_delay = 3);
        let mut guard = critical::lock::<StdPort>();
        timer.start_alarm(&mut guard, 0x4000);
        timer.stop_alarm(&mut guard);
        assert!(!timer.is_alarm_active(&guard));
        timer.hw.with(|hw| {
            assert!(!hw.alarm_events);
            assert!(!hw.events.contains(TimerEvents::COMPARE_LOADED));
            assert!(hw.pending_load.is_none());
        });
        // The bridge is free again for the next arm.
        timer.start_alarm(&mut guard, 0x5000);
        assert!(timer.is_alarm_active(&guard));
    }

    /// A match that races a disarm belongs to the stopped alarm: it must
    /// not be delivered for the next one, which still fires on its own
    /// match.
    #[test]
    fn raced_match_does_not_fire_the_next_alarm() {
        init_logging();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn count() {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }
        let timer = init_timer(count);
        {
            let mut guard = critical::lock::<StdPort>();
            timer.start_alarm(&mut guard, 0x0100);
            // The match fires but its interrupt is held off while the
            // alarm is disarmed and re-armed further out.
            raise(&timer, TimerEvents::COMPARE_MATCH);
            timer.stop_alarm(&mut guard);
            timer.start_alarm(&mut guard, 0x8000);
        }
        serve(&timer);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        {
            let guard = critical::lock::<StdPort>();
            assert!(timer.is_alarm_active(&guard));
        }
        raise(&timer, TimerEvents::COMPARE_MATCH);
        serve(&timer);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    /// A disarm while armed but with the bridge idle needs no waiting.
    #[test]
    fn stop_with_idle_bridge() {
        init_logging();
        let timer = init_timer(no_handler);
        let mut guard = critical::lock::<StdPort>();
        timer.start_alarm(&mut guard, 0x4000);
        // The write completes and its interrupt is serviced.
        drop(guard);
        serve(&timer);
        let mut guard = critical::lock::<StdPort>();
        timer.stop_alarm(&mut guard);
        assert!(!timer.is_alarm_active(&guard));
    }
}
