//! Unified host/accelerator memory with lazy synchronization
//!
//! A `UnifiedMemory` tracks one logical value materialized as up to two
//! physical copies, one per device kind. The state machine records which
//! copy is authoritative; reads on a stale kind trigger at most one
//! transfer per staleness event, and writes invalidate every other kind.

use std::ptr::NonNull;
use std::sync::Arc;

use serde::Serialize;

use crate::device::{host, DeviceAllocator, DeviceContext, DeviceKind};
use crate::error::{ForgeResult, TensorForgeError};

/// Which physical copies currently hold the logical value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemoryState {
    /// No copy holds a value yet
    Uninitialized,
    /// The host copy is authoritative
    HostValid,
    /// The accelerator copy is authoritative
    DeviceValid,
    /// Host and accelerator copies agree
    Synchronized,
}

struct HostBlock {
    ptr: NonNull<u8>,
    owned: bool,
}

struct DeviceBlock {
    ptr: NonNull<u8>,
    owned: bool,
    allocator: Arc<dyn DeviceAllocator>,
}

/// One logical buffer, materialized on up to two device kinds.
///
/// Either exclusively owned by one tensor or pooled by a workspace and
/// borrowed by tensors; ownership bookkeeping lives in [`crate::tensor`].
pub struct UnifiedMemory {
    nbytes: usize,
    state: MemoryState,
    host: Option<HostBlock>,
    device: Option<DeviceBlock>,
}

// SAFETY: the raw block pointers are only dereferenced through &mut self
// (or handed to callers who take over synchronization), and the device
// allocator is Send + Sync by trait bound.
unsafe impl Send for UnifiedMemory {}

impl UnifiedMemory {
    /// Create an unmaterialized buffer of `nbytes`
    pub fn new(nbytes: usize) -> Self {
        UnifiedMemory {
            nbytes,
            state: MemoryState::Uninitialized,
            host: None,
            device: None,
        }
    }

    /// Logical size in bytes
    pub fn size(&self) -> usize {
        self.nbytes
    }

    /// Current synchronization state
    pub fn state(&self) -> MemoryState {
        self.state
    }

    /// Device id of the accelerator copy, if one exists
    pub fn device_id(&self) -> Option<u32> {
        self.device.as_ref().map(|d| d.allocator.device_id())
    }

    /// Return whether the given kind currently holds the value
    pub fn is_valid_on(&self, kind: DeviceKind) -> bool {
        match (kind, self.state) {
            (_, MemoryState::Uninitialized) => false,
            (_, MemoryState::Synchronized) => true,
            (DeviceKind::Host, MemoryState::HostValid) => true,
            (DeviceKind::Accelerator(id), MemoryState::DeviceValid) => {
                self.device_id() == Some(id)
            }
            _ => false,
        }
    }

    /// Return a pointer valid for the context's device kind, allocating a
    /// copy if absent and synchronizing from whichever kind is valid if
    /// the requested kind is stale.
    pub fn ensure(&mut self, ctx: &DeviceContext) -> ForgeResult<*mut u8> {
        match ctx {
            DeviceContext::Host => self.ensure_host(),
            DeviceContext::Accelerator(alloc) => self.ensure_device(alloc),
        }
    }

    fn ensure_host(&mut self) -> ForgeResult<*mut u8> {
        let host_ptr = match &self.host {
            Some(block) => block.ptr,
            None => {
                let ptr = host::alloc_host(self.nbytes)?;
                tracing::trace!(nbytes = self.nbytes, "materialized host copy");
                self.host = Some(HostBlock { ptr, owned: true });
                ptr
            }
        };
        match self.state {
            MemoryState::DeviceValid => {
                let dev = self.device.as_ref().ok_or_else(|| {
                    TensorForgeError::Internal(
                        "device-valid state without a device copy".to_string(),
                    )
                })?;
                dev.allocator
                    .copy_device_to_host(dev.ptr, host_ptr, self.nbytes)?;
                tracing::debug!(nbytes = self.nbytes, "synchronized device -> host");
                self.state = MemoryState::Synchronized;
            }
            MemoryState::Uninitialized => self.state = MemoryState::HostValid,
            MemoryState::HostValid | MemoryState::Synchronized => {}
        }
        Ok(host_ptr.as_ptr())
    }

    fn ensure_device(&mut self, alloc: &Arc<dyn DeviceAllocator>) -> ForgeResult<*mut u8> {
        let dev_ptr = match &self.device {
            Some(dev) => {
                if dev.allocator.device_id() != alloc.device_id() {
                    return Err(TensorForgeError::Internal(format!(
                        "memory already materialized on accelerator:{}, requested accelerator:{}",
                        dev.allocator.device_id(),
                        alloc.device_id()
                    )));
                }
                dev.ptr
            }
            None => {
                let ptr = alloc.allocate(self.nbytes)?;
                tracing::trace!(
                    nbytes = self.nbytes,
                    device = alloc.device_id(),
                    "materialized device copy"
                );
                self.device = Some(DeviceBlock {
                    ptr,
                    owned: true,
                    allocator: Arc::clone(alloc),
                });
                ptr
            }
        };
        match self.state {
            MemoryState::HostValid => {
                let host_ptr = self.host.as_ref().map(|b| b.ptr).ok_or_else(|| {
                    TensorForgeError::Internal("host-valid state without a host copy".to_string())
                })?;
                alloc.copy_host_to_device(host_ptr, dev_ptr, self.nbytes)?;
                tracing::debug!(nbytes = self.nbytes, "synchronized host -> device");
                self.state = MemoryState::Synchronized;
            }
            MemoryState::Uninitialized => self.state = MemoryState::DeviceValid,
            MemoryState::DeviceValid | MemoryState::Synchronized => {}
        }
        Ok(dev_ptr.as_ptr())
    }

    /// Host copy pointer, when the host copy currently holds the value
    pub fn valid_host_ptr(&self) -> Option<NonNull<u8>> {
        if matches!(
            self.state,
            MemoryState::HostValid | MemoryState::Synchronized
        ) {
            self.host.as_ref().map(|b| b.ptr)
        } else {
            None
        }
    }

    /// Declare the given kind authoritative and all other kinds stale.
    ///
    /// Must be called by any caller that writes through a pointer returned
    /// by [`UnifiedMemory::ensure`]; the abstraction cannot observe writes.
    pub fn mark_dirty(&mut self, kind: DeviceKind) {
        match kind {
            DeviceKind::Host if self.host.is_some() => self.state = MemoryState::HostValid,
            DeviceKind::Accelerator(id) if self.device_id() == Some(id) => {
                self.state = MemoryState::DeviceValid
            }
            _ => tracing::warn!(%kind, "mark_dirty without backing storage, ignored"),
        }
    }

    /// Bind a caller-owned buffer for the context's device kind without
    /// taking ownership. The adopted kind becomes authoritative; other
    /// kinds still allocate and copy as usual, but the adopted buffer is
    /// never freed here.
    pub fn adopt_external(
        &mut self,
        ptr: NonNull<u8>,
        nbytes: usize,
        ctx: &DeviceContext,
    ) -> ForgeResult<()> {
        if nbytes < self.nbytes {
            return Err(TensorForgeError::CapacityExceeded {
                required: self.nbytes,
                available: nbytes,
            });
        }
        match ctx {
            DeviceContext::Host => {
                self.release_host();
                self.host = Some(HostBlock { ptr, owned: false });
                self.state = MemoryState::HostValid;
            }
            DeviceContext::Accelerator(alloc) => {
                self.release_device();
                self.device = Some(DeviceBlock {
                    ptr,
                    owned: false,
                    allocator: Arc::clone(alloc),
                });
                self.state = MemoryState::DeviceValid;
            }
        }
        tracing::debug!(nbytes, kind = %ctx.kind(), "adopted external buffer");
        Ok(())
    }

    fn release_host(&mut self) {
        if let Some(block) = self.host.take() {
            if block.owned {
                // SAFETY: owned blocks came from alloc_host(self.nbytes)
                unsafe { host::free_host(block.ptr, self.nbytes) };
            }
        }
    }

    fn release_device(&mut self) {
        if let Some(block) = self.device.take() {
            if block.owned {
                block.allocator.deallocate(block.ptr, self.nbytes);
            }
        }
    }
}

impl Drop for UnifiedMemory {
    fn drop(&mut self) {
        self.release_host();
        self.release_device();
    }
}

impl std::fmt::Debug for UnifiedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedMemory")
            .field("nbytes", &self.nbytes)
            .field("state", &self.state)
            .field("host", &self.host.is_some())
            .field("device", &self.device_id())
            .finish()
    }
}
