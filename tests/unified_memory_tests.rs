//! Integration tests for the host/accelerator synchronization state machine

use std::ptr::NonNull;

use anyhow::Result;
use tensorforge::{
    DeviceContext, DeviceKind, EmulatedDevice, MemoryState, Tensor, TensorForgeError,
    UnifiedMemory,
};

#[test]
fn test_round_trip_through_accelerator() -> Result<()> {
    let dev = EmulatedDevice::new(0);
    let ctx = dev.context();
    let mut mem = UnifiedMemory::new(32);

    // Write on the host
    let host = mem.ensure(&DeviceContext::Host)?;
    unsafe { std::slice::from_raw_parts_mut(host, 32).fill(0xAB) };
    mem.mark_dirty(DeviceKind::Host);

    // Read and overwrite on the device
    let dev_ptr = mem.ensure(&ctx)?;
    let on_device = unsafe { std::slice::from_raw_parts_mut(dev_ptr, 32) };
    assert_eq!(on_device, &[0xABu8; 32], "device read sees host writes");
    on_device.fill(0xCD);
    mem.mark_dirty(DeviceKind::Accelerator(0));

    // Read back on the host
    let host = mem.ensure(&DeviceContext::Host)?;
    let on_host = unsafe { std::slice::from_raw_parts(host as *const u8, 32) };
    assert_eq!(on_host, &[0xCDu8; 32], "host read sees device writes");
    assert_eq!(mem.state(), MemoryState::Synchronized);
    assert_eq!(dev.host_to_device_copies(), 1);
    assert_eq!(dev.device_to_host_copies(), 1);
    Ok(())
}

#[test]
fn test_repeated_reads_transfer_nothing() -> Result<()> {
    let dev = EmulatedDevice::new(0);
    let ctx = dev.context();
    let mut mem = UnifiedMemory::new(16);
    mem.ensure(&DeviceContext::Host)?;
    mem.mark_dirty(DeviceKind::Host);
    mem.ensure(&ctx)?;
    assert_eq!(dev.host_to_device_copies(), 1);

    for _ in 0..5 {
        mem.ensure(&ctx)?;
        mem.ensure(&DeviceContext::Host)?;
    }
    assert_eq!(
        dev.host_to_device_copies(),
        1,
        "synchronized reads must not transfer"
    );
    assert_eq!(dev.device_to_host_copies(), 0);
    Ok(())
}

#[test]
fn test_adopted_host_buffer_copies_to_device_once() -> Result<()> {
    let dev = EmulatedDevice::new(0);
    let ctx = dev.context();

    let mut backing = vec![7u8; 24];
    let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();

    let mut mem = UnifiedMemory::new(24);
    mem.adopt_external(ptr, 24, &DeviceContext::Host)?;
    assert_eq!(mem.state(), MemoryState::HostValid);

    let dev_ptr = mem.ensure(&ctx)?;
    assert_eq!(dev.host_to_device_copies(), 1);
    let on_device = unsafe { std::slice::from_raw_parts(dev_ptr as *const u8, 24) };
    assert_eq!(on_device, &[7u8; 24]);

    // Second read: already synchronized
    mem.ensure(&ctx)?;
    assert_eq!(dev.host_to_device_copies(), 1);

    drop(mem);
    assert_eq!(backing, vec![7u8; 24], "adopted buffer survives the drop");
    Ok(())
}

#[test]
fn test_device_allocations_freed_on_drop() -> Result<()> {
    let dev = EmulatedDevice::new(0);
    let ctx = dev.context();
    {
        let mut mem = UnifiedMemory::new(256);
        mem.ensure(&ctx)?;
        assert_eq!(dev.live_bytes(), 256);
    }
    assert_eq!(dev.live_bytes(), 0, "owned device memory freed on drop");
    Ok(())
}

#[test]
fn test_allocation_failure_leaves_tensor_usable() -> Result<()> {
    let dev = EmulatedDevice::new(0);
    let ctx = dev.context();
    dev.fail_next_allocation();

    let mut t = Tensor::with_name("pressured");
    t.reshape(&[16])?;
    let err = t.mutable_data::<f32>(&ctx).unwrap_err();
    assert!(matches!(err, TensorForgeError::AllocationFailed { .. }));
    assert!(err.is_recoverable(), "allocation pressure is recoverable");

    // Retry after the pressure clears
    t.mutable_data::<f32>(&ctx)?;
    assert_eq!(dev.live_bytes(), 16 * std::mem::size_of::<f32>());
    Ok(())
}

#[test]
fn test_tensor_data_synchronizes_lazily() -> Result<()> {
    let dev = EmulatedDevice::new(0);
    let ctx = dev.context();

    let mut t = Tensor::with_name("synced");
    t.copy_from_slice(&[1.0f32, 2.0, 3.0, 4.0])?;
    assert_eq!(dev.host_to_device_copies(), 0, "host writes touch no device");

    // A device read triggers exactly one upload
    let dev_ptr = t.data::<f32>(&ctx)?;
    assert_eq!(dev.host_to_device_copies(), 1);
    let on_device = unsafe { std::slice::from_raw_parts(dev_ptr, 4) };
    assert_eq!(on_device, &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.memory_state()?, MemoryState::Synchronized);

    // Another device read is free
    t.data::<f32>(&ctx)?;
    assert_eq!(dev.host_to_device_copies(), 1);
    Ok(())
}

#[test]
fn test_device_write_invalidates_host_view() -> Result<()> {
    let dev = EmulatedDevice::new(0);
    let ctx = dev.context();

    let mut t = Tensor::with_name("dirty");
    t.copy_from_slice(&[0u8; 8])?;
    let dev_ptr = t.mutable_data::<u8>(&ctx)?;
    unsafe { std::slice::from_raw_parts_mut(dev_ptr, 8).fill(3) };
    assert_eq!(t.memory_state()?, MemoryState::DeviceValid);

    let back = t.copy_to_vec::<u8>()?;
    assert_eq!(back, vec![3u8; 8], "host read downloads the device writes");
    assert_eq!(dev.device_to_host_copies(), 1);
    Ok(())
}
