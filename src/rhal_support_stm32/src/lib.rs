//! STM32 shared-resource drivers built on the `rhal_osal` contract.
//!
//!  - [`dma`]: allocator and interrupt demultiplexer for the two DMA
//!    controllers' sixteen streams, which are shared between otherwise
//!    independent peripheral drivers.
//!  - [`lpst`]: alarm state machine over the low-power timer's
//!    free-running 16-bit counter.
//!
//! Hardware access goes through the [`dma::DmaHw`] and [`lpst::LpTimerHw`]
//! traits so that both drivers can be exercised on the build host against
//! simulated registers.
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod dma;
pub mod lpst;
