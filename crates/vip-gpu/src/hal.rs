//! Seam between the driver core and whatever is actually behind the MMIO
//! window: real hardware in production, a software model in the tests.

/// 32-bit register access to the core's MMIO window.
///
/// After initialization only the device thread writes registers; reads of the
/// identity registers happen once during bring-up.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// What woke the interrupt thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptWake {
    /// The core raised its interrupt line; read `IRQ_ACK` to learn why.
    Irq,
    /// [`InterruptSource::unblock`] was called; the thread should exit.
    Shutdown,
}

/// Blocking source of interrupt notifications.
pub trait InterruptSource: Send + Sync {
    /// Block until the core interrupts or the source is shut down.
    fn wait(&self) -> InterruptWake;

    /// Make the current (and every future) `wait` return
    /// [`InterruptWake::Shutdown`]. Callable from any thread.
    fn unblock(&self);
}
