//! Host-memory-backed accelerator stand-in
//!
//! `EmulatedDevice` implements [`DeviceAllocator`] on top of ordinary host
//! memory. It keeps per-direction transfer counters and a failure-injection
//! knob, which makes it the reference backend for exercising the unified
//! memory state machine where no real accelerator binding is linked.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::device::{host, DeviceAllocator, DeviceContext, DeviceKind};
use crate::error::{ForgeResult, TensorForgeError};

/// A software accelerator: device memory is host memory with bookkeeping.
#[derive(Debug, Default)]
pub struct EmulatedDevice {
    device_id: u32,
    allocations: AtomicUsize,
    live_bytes: AtomicUsize,
    h2d_copies: AtomicUsize,
    d2h_copies: AtomicUsize,
    d2d_copies: AtomicUsize,
    fail_next_allocation: AtomicBool,
}

impl EmulatedDevice {
    /// Create an emulated accelerator with the given device id
    pub fn new(device_id: u32) -> Arc<Self> {
        Arc::new(EmulatedDevice {
            device_id,
            ..Default::default()
        })
    }

    /// A [`DeviceContext`] selecting this device
    pub fn context(self: &Arc<Self>) -> DeviceContext {
        DeviceContext::Accelerator(Arc::clone(self) as Arc<dyn DeviceAllocator>)
    }

    /// Number of allocations served
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Bytes currently allocated and not yet freed
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    /// Host-to-device transfers performed
    pub fn host_to_device_copies(&self) -> usize {
        self.h2d_copies.load(Ordering::SeqCst)
    }

    /// Device-to-host transfers performed
    pub fn device_to_host_copies(&self) -> usize {
        self.d2h_copies.load(Ordering::SeqCst)
    }

    /// Device-to-device transfers performed
    pub fn device_to_device_copies(&self) -> usize {
        self.d2d_copies.load(Ordering::SeqCst)
    }

    /// Make the next allocation fail, simulating device memory pressure
    pub fn fail_next_allocation(&self) {
        self.fail_next_allocation.store(true, Ordering::SeqCst);
    }
}

impl DeviceAllocator for EmulatedDevice {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn allocate(&self, nbytes: usize) -> ForgeResult<NonNull<u8>> {
        if self.fail_next_allocation.swap(false, Ordering::SeqCst) {
            return Err(TensorForgeError::AllocationFailed {
                nbytes,
                device: DeviceKind::Accelerator(self.device_id),
                reason: "injected allocation failure".to_string(),
            });
        }
        let ptr = host::alloc_host(nbytes).map_err(|_| TensorForgeError::AllocationFailed {
            nbytes,
            device: DeviceKind::Accelerator(self.device_id),
            reason: "backing host allocation failed".to_string(),
        })?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(nbytes, Ordering::SeqCst);
        tracing::trace!(
            device = self.device_id,
            nbytes,
            "emulated device allocation"
        );
        Ok(ptr)
    }

    fn deallocate(&self, ptr: NonNull<u8>, nbytes: usize) {
        self.live_bytes.fetch_sub(nbytes, Ordering::SeqCst);
        // SAFETY: ptr came from allocate() which used alloc_host(nbytes)
        unsafe { host::free_host(ptr, nbytes) };
    }

    fn copy_host_to_device(
        &self,
        src: NonNull<u8>,
        dst: NonNull<u8>,
        nbytes: usize,
    ) -> ForgeResult<()> {
        self.h2d_copies.fetch_add(1, Ordering::SeqCst);
        // SAFETY: both regions are nbytes long and do not overlap (distinct
        // allocations)
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), nbytes) };
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        src: NonNull<u8>,
        dst: NonNull<u8>,
        nbytes: usize,
    ) -> ForgeResult<()> {
        self.d2h_copies.fetch_add(1, Ordering::SeqCst);
        // SAFETY: see copy_host_to_device
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), nbytes) };
        Ok(())
    }

    fn copy_device_to_device(
        &self,
        src: NonNull<u8>,
        dst: NonNull<u8>,
        nbytes: usize,
    ) -> ForgeResult<()> {
        if src == dst {
            return Ok(());
        }
        self.d2d_copies.fetch_add(1, Ordering::SeqCst);
        // SAFETY: see copy_host_to_device
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), nbytes) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_tracks_live_bytes() {
        let dev = EmulatedDevice::new(0);
        let ptr = dev.allocate(128).expect("allocation");
        assert_eq!(dev.allocations(), 1);
        assert_eq!(dev.live_bytes(), 128);
        dev.deallocate(ptr, 128);
        assert_eq!(dev.live_bytes(), 0);
    }

    #[test]
    fn test_transfer_counters() {
        let dev = EmulatedDevice::new(0);
        let d = dev.allocate(16).expect("allocation");
        let mut host = [7u8; 16];
        let host_ptr = NonNull::new(host.as_mut_ptr()).expect("non-null");
        dev.copy_host_to_device(host_ptr, d, 16).expect("h2d");
        dev.copy_device_to_host(d, host_ptr, 16).expect("d2h");
        assert_eq!(dev.host_to_device_copies(), 1);
        assert_eq!(dev.device_to_host_copies(), 1);
        dev.deallocate(d, 16);
    }

    #[test]
    fn test_injected_allocation_failure_is_one_shot() {
        let dev = EmulatedDevice::new(0);
        dev.fail_next_allocation();
        assert!(dev.allocate(64).is_err());
        let ptr = dev.allocate(64).expect("second attempt succeeds");
        dev.deallocate(ptr, 64);
    }
}
