//! Operating-system abstraction layer used by the `rhal` device drivers.
//!
//! The drivers in this project are written once and run over more than one
//! RTOS kernel. This crate pins down the behavioral contract they rely on:
//!
//!  - Critical sections usable from thread context, interrupt context, or
//!    code that does not statically know its context ([`critical`]).
//!  - The mandatory interrupt-handler prologue/epilogue bracket
//!    ([`interrupt`]).
//!  - Thread suspension with a wake-up payload ([`thread`]) and counting
//!    wait queues ([`queue`]).
//!  - A recursive mutex ([`mutex`]) and wrapping time arithmetic ([`time`]).
//!
//! The underlying kernel is reached exclusively through the traits in
//! [`port`]. A hosted implementation for running the test suites on std
//! lives in the `rhal_port_std` crate.
//!
//! # Error model
//!
//! Expected conditions (timeouts, resource exhaustion) are reported through
//! `Result`. Contract violations (unbalanced critical sections, unlocking
//! a mutex the caller does not own, out-of-range parameters) are detected
//! by assertions and abort the system by panicking; shared state guarded by
//! interrupt masking cannot be trusted after such a violation, so there is
//! no recovery path.
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod critical;
pub mod error;
pub mod interrupt;
pub mod mutex;
pub mod port;
pub mod queue;
pub mod thread;
pub mod time;

pub use self::{
    error::TimeoutError,
    port::{Port, PortCycleCounter, PortInterrupts, PortSync, PortThreading},
    time::{Deadline, SysInterval, SysTime},
};
