//! DMA channel allocator and interrupt demultiplexer.
//!
//! The two DMA controllers expose eight streams each, shared by every
//! peripheral driver in the system. This module owns the global allocation
//! state: drivers request a channel (a specific one, or any free one on a
//! given controller), optionally registering a completion callback, and hand
//! it back when their transfer mode shuts down. Controller clocks are gated
//! on the first allocation and off again when the last channel of a
//! controller is released.
//!
//! Channel ownership is witnessed by [`ChannelHandle`], which is not
//! copyable and is consumed by [`Dma::free`]; releasing a channel twice is
//! therefore not expressible.
use core::fmt;

use bitflags::bitflags;
use rhal_osal::critical::{self, CpuLockCell, CpuLockToken};
use rhal_osal::port::PortInterrupts;

/// Total number of DMA channels across both controllers.
pub const CHANNEL_COUNT: usize = 16;

/// Number of DMA controllers.
pub const CONTROLLER_COUNT: usize = 2;

const CHANNELS_PER_CONTROLLER: usize = 8;

/// Which half of a controller's status register file a channel reports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWord {
    /// Channels 0..=3 of the controller.
    Low,
    /// Channels 4..=7 of the controller.
    High,
}

struct ChannelDesc {
    controller: usize,
    vector: u32,
    word: StatusWord,
    /// Bit position of the channel's flag group within the status word.
    shift: u32,
}

/// Per-channel routing: interrupt vector and status-word placement. The
/// flag groups sit at bits 0, 6, 16, and 22 of each 32-bit status word.
static CHANNEL_DESCS: [ChannelDesc; CHANNEL_COUNT] = [
    ChannelDesc { controller: 0, vector: 11, word: StatusWord::Low, shift: 0 },
    ChannelDesc { controller: 0, vector: 12, word: StatusWord::Low, shift: 6 },
    ChannelDesc { controller: 0, vector: 13, word: StatusWord::Low, shift: 16 },
    ChannelDesc { controller: 0, vector: 14, word: StatusWord::Low, shift: 22 },
    ChannelDesc { controller: 0, vector: 15, word: StatusWord::High, shift: 0 },
    ChannelDesc { controller: 0, vector: 16, word: StatusWord::High, shift: 6 },
    ChannelDesc { controller: 0, vector: 17, word: StatusWord::High, shift: 16 },
    ChannelDesc { controller: 0, vector: 47, word: StatusWord::High, shift: 22 },
    ChannelDesc { controller: 1, vector: 56, word: StatusWord::Low, shift: 0 },
    ChannelDesc { controller: 1, vector: 57, word: StatusWord::Low, shift: 6 },
    ChannelDesc { controller: 1, vector: 58, word: StatusWord::Low, shift: 16 },
    ChannelDesc { controller: 1, vector: 59, word: StatusWord::Low, shift: 22 },
    ChannelDesc { controller: 1, vector: 60, word: StatusWord::High, shift: 0 },
    ChannelDesc { controller: 1, vector: 68, word: StatusWord::High, shift: 6 },
    ChannelDesc { controller: 1, vector: 69, word: StatusWord::High, shift: 16 },
    ChannelDesc { controller: 1, vector: 70, word: StatusWord::High, shift: 22 },
];

bitflags! {
    /// Event flags of one channel, as laid out in its status-word flag
    /// group.
    pub struct ChannelFlags: u32 {
        const FIFO_ERROR = 1 << 0;
        const DIRECT_MODE_ERROR = 1 << 2;
        const TRANSFER_ERROR = 1 << 3;
        const HALF_TRANSFER = 1 << 4;
        const TRANSFER_COMPLETE = 1 << 5;
    }
}

/// Completion callback registered at allocation time. Runs in interrupt
/// context with the channel's pending flags already cleared in hardware.
pub type ChannelIsr = fn(param: usize, flags: ChannelFlags);

/// Raw access to the DMA controllers' registers and their NVIC vectors.
///
/// Redundant vector enables and disables must be tolerated.
pub trait DmaHw: Send + Sync + 'static {
    fn read_status(&self, controller: usize, word: StatusWord) -> u32;
    /// Clear the status bits selected by `mask`.
    fn clear_status(&self, controller: usize, word: StatusWord, mask: u32);
    /// Return the channel's stream registers to their reset state.
    fn reset_channel(&self, channel: usize);
    fn enable_clock(&self, controller: usize);
    fn disable_clock(&self, controller: usize);
    fn enable_vector(&self, vector: u32, priority: u32);
    fn disable_vector(&self, vector: u32);
}

/// Which channel an allocation request may be satisfied with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelector {
    /// Exactly this channel.
    Index(usize),
    /// Any free channel on either controller.
    Any,
    /// Any free channel on the given controller.
    AnyOnController(usize),
}

/// Witnesses ownership of an allocated channel. Consumed by [`Dma::free`].
#[derive(Debug)]
#[must_use = "the channel stays allocated until the handle is freed"]
pub struct ChannelHandle {
    channel: usize,
}

impl ChannelHandle {
    /// The global index of the owned channel.
    pub fn channel(&self) -> usize {
        self.channel
    }
}

/// No channel matching the selector was free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoFreeChannel;

impl fmt::Display for NoFreeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no free DMA channel matches the selector")
    }
}

#[derive(Clone, Copy)]
struct Slot {
    isr: Option<ChannelIsr>,
    param: usize,
}

const FREE_SLOT: Slot = Slot { isr: None, param: 0 };

struct DmaState {
    /// One bit per channel, set while allocated.
    allocated: u16,
    slots: [Slot; CHANNEL_COUNT],
}

/// The global DMA allocation state and its hardware backend.
pub struct Dma<P: PortInterrupts, Hw: DmaHw> {
    hw: Hw,
    state: CpuLockCell<P, DmaState>,
}

fn controller_mask(controller: usize) -> u16 {
    0xFF << (controller * CHANNELS_PER_CONTROLLER)
}

impl<P: PortInterrupts, Hw: DmaHw> Dma<P, Hw> {
    pub const fn new(hw: Hw) -> Self {
        Self {
            hw,
            state: CpuLockCell::new(DmaState {
                allocated: 0,
                slots: [FREE_SLOT; CHANNEL_COUNT],
            }),
        }
    }

    /// Discard all allocation records. Called once at system start, before
    /// any driver can hold a handle.
    pub fn init(&self, token: &mut CpuLockToken<P>) {
        let state = self.state.write(token);
        state.allocated = 0;
        state.slots = [FREE_SLOT; CHANNEL_COUNT];
    }

    /// Allocate a channel; the caller is already inside a critical section.
    ///
    /// Channels are scanned in ascending index order and the first free
    /// match is taken, so a given allocation history always yields the same
    /// assignment. Allocating the first channel of a controller turns that
    /// controller's clock on. The channel's stream registers are reset, and
    /// its interrupt vector is enabled at `priority` only when a callback is
    /// registered; polled-mode users leave the vector masked.
    ///
    /// Panics if the selector names a channel or controller that does not
    /// exist.
    pub fn allocate_locked(
        &self,
        token: &mut CpuLockToken<P>,
        selector: ChannelSelector,
        priority: u32,
        isr: Option<ChannelIsr>,
        param: usize,
    ) -> Result<ChannelHandle, NoFreeChannel> {
        let (start, end) = match selector {
            ChannelSelector::Index(channel) => {
                assert!(channel < CHANNEL_COUNT, "DMA channel index out of range");
                (channel, channel + 1)
            }
            ChannelSelector::Any => (0, CHANNEL_COUNT),
            ChannelSelector::AnyOnController(controller) => {
                assert!(controller < CONTROLLER_COUNT, "DMA controller out of range");
                let base = controller * CHANNELS_PER_CONTROLLER;
                (base, base + CHANNELS_PER_CONTROLLER)
            }
        };
        let state = self.state.write(token);
        for channel in start..end {
            if state.allocated & (1 << channel) != 0 {
                continue;
            }
            let desc = &CHANNEL_DESCS[channel];
            if state.allocated & controller_mask(desc.controller) == 0 {
                self.hw.enable_clock(desc.controller);
            }
            state.allocated |= 1 << channel;
            state.slots[channel] = Slot { isr, param };
            self.hw.reset_channel(channel);
            if isr.is_some() {
                self.hw.enable_vector(desc.vector, priority);
            }
            return Ok(ChannelHandle { channel });
        }
        Err(NoFreeChannel)
    }

    /// Allocate a channel from thread context, outside any critical section.
    pub fn allocate(
        &self,
        selector: ChannelSelector,
        priority: u32,
        isr: Option<ChannelIsr>,
        param: usize,
    ) -> Result<ChannelHandle, NoFreeChannel> {
        let mut guard = critical::lock::<P>();
        self.allocate_locked(&mut guard, selector, priority, isr, param)
    }

    /// Release a channel; the caller is already inside a critical section.
    ///
    /// The callback registration is discarded and the channel's vector is
    /// masked. Releasing the last channel of a controller turns that
    /// controller's clock off.
    pub fn free_locked(&self, token: &mut CpuLockToken<P>, handle: ChannelHandle) {
        let channel = handle.channel;
        let state = self.state.write(token);
        assert!(
            state.allocated & (1 << channel) != 0,
            "DMA channel is not allocated"
        );
        let desc = &CHANNEL_DESCS[channel];
        state.allocated &= !(1 << channel);
        state.slots[channel] = FREE_SLOT;
        self.hw.disable_vector(desc.vector);
        if state.allocated & controller_mask(desc.controller) == 0 {
            self.hw.disable_clock(desc.controller);
        }
    }

    /// Release a channel from thread context, outside any critical section.
    pub fn free(&self, handle: ChannelHandle) {
        let mut guard = critical::lock::<P>();
        self.free_locked(&mut guard, handle);
    }

    /// Service the interrupt of one channel.
    ///
    /// Reads the channel's flag group, clears it in hardware, and invokes
    /// the registered callback with the captured flags. A channel with no
    /// registered callback still gets its flags cleared. Must run in
    /// interrupt context, inside the handler bracket.
    pub fn serve_interrupt(&self, channel: usize) {
        assert!(channel < CHANNEL_COUNT, "DMA channel index out of range");
        let desc = &CHANNEL_DESCS[channel];
        let status = self.hw.read_status(desc.controller, desc.word);
        let flags = ChannelFlags::from_bits_truncate(status >> desc.shift);
        self.hw
            .clear_status(desc.controller, desc.word, ChannelFlags::all().bits() << desc.shift);
        let slot = {
            let token = critical::lock_from_interrupt::<P>();
            self.state.read(&*token).slots[channel]
        };
        if let Some(isr) = slot.isr {
            isr(slot.param, flags);
        }
    }
}
