//! Kernel-style driver core for a tiled 3D GPU.
//!
//! The core feeds the hardware through a single command ring: the fetch
//! engine idles on a WAIT-LINK pair, and each submission is published by
//! rewriting that LINK to point at the new work. Completion comes back as
//! one of 30 hardware event interrupts. Per-client isolation is a private
//! two-level page table selected through the chip's page-table array.
//!
//! All hardware state is owned by a dedicated device thread
//! ([`device::Device`] spawns it); clients and the interrupt thread talk to
//! it over a request channel.
#![forbid(unsafe_code)]

pub mod batch;
pub mod connection;
pub mod device;
pub mod events;
pub mod hal;
pub mod instr;
pub mod progress;
pub mod regs;
pub mod ring;

pub use batch::{BatchFence, BatchResource, BatchStatus, CommandBuffer, SubmitError};
pub use connection::{Connection, Context, ContextId, GpuMapping, MapError};
pub use device::{
    ChipIdentity, ConnectError, Device, DeviceConfig, DeviceDump, DeviceInitError, Query,
    CLIENT_GPU_ADDR_BASE, CLIENT_GPU_ADDR_SIZE, RING_GPU_ADDR, RING_SIZE,
};
pub use hal::{InterruptSource, InterruptWake, RegisterIo};
