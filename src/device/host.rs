//! Aligned host allocation helpers
//!
//! Host blocks are allocated through the global allocator at a fixed
//! 64-byte alignment so SIMD kernels can assume aligned loads.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::device::DeviceKind;
use crate::error::{ForgeResult, TensorForgeError};

/// Alignment of every host block handed out by the runtime
pub const HOST_ALIGNMENT: usize = 64;

fn layout_for(nbytes: usize) -> ForgeResult<Layout> {
    Layout::from_size_align(nbytes, HOST_ALIGNMENT).map_err(|e| {
        TensorForgeError::AllocationFailed {
            nbytes,
            device: DeviceKind::Host,
            reason: e.to_string(),
        }
    })
}

/// Allocate an aligned host block of `nbytes`
pub fn alloc_host(nbytes: usize) -> ForgeResult<NonNull<u8>> {
    if nbytes == 0 {
        return Err(TensorForgeError::AllocationFailed {
            nbytes,
            device: DeviceKind::Host,
            reason: "zero-size allocation".to_string(),
        });
    }
    let layout = layout_for(nbytes)?;
    // SAFETY: layout has non-zero size
    let raw = unsafe { alloc(layout) };
    NonNull::new(raw).ok_or_else(|| TensorForgeError::AllocationFailed {
        nbytes,
        device: DeviceKind::Host,
        reason: "host allocator returned null".to_string(),
    })
}

/// Free a block previously returned by [`alloc_host`] with the same size.
///
/// # Safety
/// `ptr` must come from `alloc_host(nbytes)` and must not be used afterwards.
pub unsafe fn free_host(ptr: NonNull<u8>, nbytes: usize) {
    if let Ok(layout) = Layout::from_size_align(nbytes, HOST_ALIGNMENT) {
        dealloc(ptr.as_ptr(), layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_aligned() {
        let ptr = alloc_host(100).expect("host allocation");
        assert_eq!(ptr.as_ptr() as usize % HOST_ALIGNMENT, 0);
        unsafe { free_host(ptr, 100) };
    }

    #[test]
    fn test_zero_size_alloc_fails() {
        let err = alloc_host(0).unwrap_err();
        assert!(matches!(
            err,
            TensorForgeError::AllocationFailed { nbytes: 0, .. }
        ));
    }
}
