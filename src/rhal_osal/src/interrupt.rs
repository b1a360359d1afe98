//! The mandatory interrupt-handler bracket.
use crate::port::PortInterrupts;

/// Run the body of an interrupt handler.
///
/// Every interrupt handler that may invoke one of this crate's primitives
/// must wrap its body in this function. On entry the deferred
/// higher-priority-thread-woken flag is cleared; on exit a context-switch
/// yield is requested if any primitive invoked inside the body set it.
///
/// ```ignore
/// fn dma1_stream3_handler() {
///     interrupt::scope::<SystemPort, _>(|| {
///         DMA.serve_interrupt(3);
///     });
/// }
/// ```
pub fn scope<P: PortInterrupts, R>(body: impl FnOnce() -> R) -> R {
    P::clear_pending_wakeup();
    let value = body();
    P::yield_if_wakeup_pending();
    value
}
