//! System time, intervals, and polled delays.
//!
//! All time arithmetic is wrapping: the tick counter reaches its maximum
//! and restarts from zero, and every comparison is phrased as a distance
//! from a start point so that it stays correct across the wrap.
use crate::port::{PortCycleCounter, PortThreading};

/// A point in time, in system ticks. Wraps.
pub type SysTime = u32;

/// A time interval, in system ticks.
pub type SysInterval = u32;

/// A bound on a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Do not block; report a timeout (or an immediately available result)
    /// right away.
    Immediate,
    /// Block for at most this many ticks.
    After(SysInterval),
    /// Block until the awaited event arrives.
    Infinite,
}

/// Add an interval to a system time.
#[inline]
pub fn time_add(time: SysTime, interval: SysInterval) -> SysTime {
    time.wrapping_add(interval)
}

/// The interval separating two system times.
#[inline]
pub fn time_diff(start: SysTime, end: SysTime) -> SysInterval {
    end.wrapping_sub(start)
}

/// Whether `time` falls within the window `[start, end)`.
///
/// When `start == end` the whole time range is specified and the result is
/// always `true`. Callable from any context.
#[inline]
pub fn time_is_in_range(time: SysTime, start: SysTime, end: SysTime) -> bool {
    if start == end {
        return true;
    }
    time.wrapping_sub(start) < end.wrapping_sub(start)
}

/// Convert seconds to system ticks.
pub fn secs_to_ticks<P: PortThreading>(secs: u32) -> SysInterval {
    secs.wrapping_mul(P::TICK_RATE_HZ)
}

/// Convert milliseconds to system ticks, rounding up to the next tick
/// boundary.
pub fn millis_to_ticks<P: PortThreading>(millis: u32) -> SysInterval {
    ((millis as u64 * P::TICK_RATE_HZ as u64 + 999) / 1000) as SysInterval
}

/// Convert microseconds to system ticks, rounding up to the next tick
/// boundary.
pub fn micros_to_ticks<P: PortThreading>(micros: u32) -> SysInterval {
    ((micros as u64 * P::TICK_RATE_HZ as u64 + 999_999) / 1_000_000) as SysInterval
}

/// Busy-wait for the given number of CPU cycles.
///
/// The real delay is always a few cycles in excess of the specified value.
/// Callable from any context.
pub fn polled_delay<P: PortCycleCounter>(cycles: u32) {
    let start = P::cycle_count();
    while P::cycle_count().wrapping_sub(start) < cycles {}
}
