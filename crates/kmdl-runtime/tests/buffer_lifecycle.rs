//! Buffer map/sync behavior and host↔device transfers

use kmdl_core::{Datatype, Shape};
use kmdl_runtime::{
    device_tensor, host_allocator, host_tensor, AllocateOptions, ErrorKind, MapAccess, MemoryPool,
    SyncOp, SyncStatus,
};

#[test]
fn bytes_read_equal_bytes_last_written() {
    let buffer = host_allocator()
        .allocate(32, &AllocateOptions::default())
        .unwrap()
        .as_host()
        .unwrap();

    for round in 0..3u8 {
        {
            let mut map = buffer.map(MapAccess::WRITE).unwrap();
            for (i, b) in map.as_mut_slice().unwrap().iter_mut().enumerate() {
                *b = round.wrapping_mul(31).wrapping_add(i as u8);
            }
            map.unmap().unwrap();
        }
        let map = buffer.map(MapAccess::READ).unwrap();
        let expected: Vec<u8> = (0..32)
            .map(|i| round.wrapping_mul(31).wrapping_add(i as u8))
            .collect();
        assert_eq!(map.as_slice(), expected.as_slice());
    }
}

#[test]
fn unmap_without_map_is_invalid_operation() {
    let buffer = host_allocator()
        .allocate(8, &AllocateOptions::default())
        .unwrap()
        .as_host()
        .unwrap();
    assert_eq!(buffer.unmap().unwrap_err().kind(), ErrorKind::InvalidOperation);
}

#[test]
fn shared_buffer_tracks_device_staleness() {
    let buffer = host_allocator()
        .allocate(16, &AllocateOptions::pool(MemoryPool::Shared))
        .unwrap()
        .as_host()
        .unwrap();
    assert_eq!(buffer.device_sync_status(), Some(SyncStatus::Valid));

    drop(buffer.map(MapAccess::READ).unwrap());
    assert_eq!(buffer.device_sync_status(), Some(SyncStatus::Valid));

    drop(buffer.map(MapAccess::READ_WRITE).unwrap());
    assert_eq!(buffer.device_sync_status(), Some(SyncStatus::NeedsWriteBack));

    // A redundant write-back is a no-op, a needed one clears the flag.
    buffer.sync(SyncOp::WriteBack, false).unwrap();
    assert_eq!(buffer.device_sync_status(), Some(SyncStatus::Valid));
}

#[test]
fn physical_address_requires_shared_pool() {
    let shared = host_allocator()
        .allocate(16, &AllocateOptions::pool(MemoryPool::Shared))
        .unwrap()
        .as_host()
        .unwrap();
    assert!(shared.physical_address().is_ok());

    let local = host_allocator()
        .allocate(16, &AllocateOptions::pool(MemoryPool::CpuOnly))
        .unwrap()
        .as_host()
        .unwrap();
    assert_eq!(
        local.physical_address().unwrap_err().kind(),
        ErrorKind::NotSupported
    );
}

// Fill a host tensor with 0..16, copy to a device tensor of the same
// layout, read back, and expect identical bytes.
#[test]
fn host_device_copy_and_readback() {
    let values: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let host = host_tensor::from_elems(Shape::from_slice(&[16]), &values).unwrap();

    let device = device_tensor::create(Datatype::Float32, Shape::from_slice(&[16]), 0, 0).unwrap();
    host.copy_to(&device).unwrap();

    let back = device.to_host().unwrap();
    assert_eq!(back.shape(), host.shape());
    assert_eq!(back.datatype(), host.datatype());

    let host_map = host.map(MapAccess::READ).unwrap();
    let back_map = back.map(MapAccess::READ).unwrap();
    assert_eq!(host_map.as_slice(), back_map.as_slice());
}

#[test]
fn to_host_preserves_shape_and_datatype() {
    for dims in [&[][..], &[3][..], &[2, 3][..], &[2, 1, 4][..]] {
        let device = device_tensor::create(Datatype::Int16, Shape::from_slice(dims), 0, 0).unwrap();
        let host = device.to_host().unwrap();
        assert_eq!(host.shape(), device.shape());
        assert_eq!(host.datatype(), device.datatype());
        assert!(host.is_host());
    }
}

#[test]
fn strided_device_copy_respects_layout() {
    // Column-major source view copied into a contiguous device tensor.
    let src = host_tensor::create_strided(
        Datatype::Float32,
        Shape::from_slice(&[2, 3]),
        Shape::from_slice(&[1, 2]),
        MemoryPool::CpuOnly,
    )
    .unwrap();
    {
        let mut map = src.map(MapAccess::WRITE).unwrap();
        let bytes: Vec<u8> = [1.0f32, 4.0, 2.0, 5.0, 3.0, 6.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        map.as_mut_slice().unwrap().copy_from_slice(&bytes);
    }

    let device = device_tensor::create(Datatype::Float32, Shape::from_slice(&[2, 3]), 0, 0).unwrap();
    src.copy_to(&device).unwrap();
    let back = device.to_host().unwrap();

    let map = back.map(MapAccess::READ).unwrap();
    let values: Vec<f32> = map
        .as_slice()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    // Row-major readout of the logical [2, 3] view.
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}
