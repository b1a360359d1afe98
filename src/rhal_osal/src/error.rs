//! Error types for expected, recoverable conditions.
use core::fmt;

/// A bounded wait expired before the awaited event arrived.
///
/// This is an ordinary outcome, distinct from any wake-up payload; the
/// waiter is removed from the wait structure with no other side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the operation timed out")
    }
}
