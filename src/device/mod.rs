//! Device kinds, contexts and the allocator seam
//!
//! The runtime is kind-agnostic: everything a device binding must provide
//! is the small capability set of [`DeviceAllocator`] (allocate, free,
//! copy between host and device). Real accelerator bindings implement the
//! trait in their own crate; [`EmulatedDevice`] is the built-in
//! host-memory-backed stand-in.

pub mod emulated;
pub mod host;

pub use emulated::EmulatedDevice;

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::Serialize;

use crate::error::ForgeResult;

/// A class of physical memory a buffer may be materialized on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceKind {
    /// Host RAM
    Host,
    /// A specific accelerator's memory, by device id
    Accelerator(u32),
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Host => write!(f, "host"),
            DeviceKind::Accelerator(id) => write!(f, "accelerator:{}", id),
        }
    }
}

/// Capability set an accelerator binding exposes to the runtime.
///
/// Implementations must be synchronous from the caller's point of view:
/// when a copy returns, the destination bytes are readable. An async
/// binding synchronizes internally before returning.
pub trait DeviceAllocator: Send + Sync {
    /// Device id the allocator serves
    fn device_id(&self) -> u32;

    /// Allocate `nbytes` of device memory
    fn allocate(&self, nbytes: usize) -> ForgeResult<NonNull<u8>>;

    /// Free memory previously returned by [`DeviceAllocator::allocate`]
    /// with the same `nbytes`
    fn deallocate(&self, ptr: NonNull<u8>, nbytes: usize);

    /// Copy `nbytes` from a host buffer into device memory
    fn copy_host_to_device(
        &self,
        src: NonNull<u8>,
        dst: NonNull<u8>,
        nbytes: usize,
    ) -> ForgeResult<()>;

    /// Copy `nbytes` from device memory into a host buffer
    fn copy_device_to_host(
        &self,
        src: NonNull<u8>,
        dst: NonNull<u8>,
        nbytes: usize,
    ) -> ForgeResult<()>;

    /// Copy `nbytes` between two device buffers on this device
    fn copy_device_to_device(
        &self,
        src: NonNull<u8>,
        dst: NonNull<u8>,
        nbytes: usize,
    ) -> ForgeResult<()>;
}

/// Runtime device context passed to data-access calls.
///
/// Plays the role of the compile-time device context parameter of the
/// classic engines: it selects a [`DeviceKind`] and, for accelerators,
/// carries the allocator that backs it.
#[derive(Clone)]
pub enum DeviceContext {
    /// Host RAM
    Host,
    /// An accelerator, through its allocator binding
    Accelerator(Arc<dyn DeviceAllocator>),
}

impl DeviceContext {
    /// The device kind this context selects
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceContext::Host => DeviceKind::Host,
            DeviceContext::Accelerator(alloc) => DeviceKind::Accelerator(alloc.device_id()),
        }
    }

    /// The allocator, for accelerator contexts
    pub fn accelerator(&self) -> Option<&Arc<dyn DeviceAllocator>> {
        match self {
            DeviceContext::Host => None,
            DeviceContext::Accelerator(alloc) => Some(alloc),
        }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceContext({})", self.kind())
    }
}
