//! Device buffers backed by a cmodel-style private region
//!
//! Without real accelerator hardware the device side is emulated with a
//! private host allocation, so staging and sync semantics stay observable:
//! the device region is only reachable through `copy_to`, never through a
//! host pointer.

use crate::buffer::allocator::{AllocateOptions, MemoryPool, HOST_BUFFER_ALLOCATE_SHARED};
use crate::buffer::host::{
    copy_host_to_host, HostBuffer, MapAccess, MapTarget, MappedBuffer, SyncOp, SyncStatus,
};
use crate::buffer::{copy_strided, host_allocator};
use crate::error::{Result, RuntimeError};
use kmdl_core::{default_strides, max_addressable, Datatype};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

struct DeviceState {
    device_sync: SyncStatus,
    access_stack: SmallVec<[MapAccess; 2]>,
    wrote: bool,
}

/// A device-memory buffer with its own sync status
pub struct DeviceBuffer {
    memory: Mutex<Box<[u8]>>,
    size_bytes: usize,
    device_type: i32,
    device_id: i32,
    state: Mutex<DeviceState>,
}

impl DeviceBuffer {
    /// Allocate device memory on `(device_type, device_id)`
    pub fn allocate(size_bytes: usize, device_type: i32, device_id: i32) -> Result<DeviceBuffer> {
        Ok(DeviceBuffer {
            memory: Mutex::new(vec![0u8; size_bytes].into_boxed_slice()),
            size_bytes,
            device_type,
            device_id,
            state: Mutex::new(DeviceState {
                device_sync: SyncStatus::Valid,
                access_stack: SmallVec::new(),
                wrote: false,
            }),
        })
    }

    /// Buffer size in bytes
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Device type this buffer lives on
    pub fn device_type(&self) -> i32 {
        self.device_type
    }

    /// Device instance this buffer lives on
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Current device view status
    pub fn device_sync_status(&self) -> SyncStatus {
        self.state.lock().device_sync
    }

    /// Overwrite the device view status (used by host copies)
    pub fn set_device_sync_status(&self, status: SyncStatus) {
        self.state.lock().device_sync = status;
    }

    /// Map the device memory for CPU access.
    ///
    /// On the cmodel backing this exposes the private region directly; a
    /// real device port would bounce through a DMA window here.
    pub fn map(self: &Arc<Self>, access: MapAccess) -> Result<MappedBuffer> {
        if access.is_empty() {
            return Err(RuntimeError::invalid_argument("map with empty access"));
        }
        let mut state = self.state.lock();
        if access.contains(MapAccess::WRITE)
            && state.access_stack.iter().any(|a| a.contains(MapAccess::WRITE))
        {
            return Err(RuntimeError::invalid_operation("overlapping write mapping"));
        }
        if state.access_stack.is_empty() && state.device_sync == SyncStatus::NeedsInvalidate {
            state.device_sync = SyncStatus::Valid;
        }
        state.access_stack.push(access);
        if access.contains(MapAccess::WRITE) {
            state.wrote = true;
        }
        drop(state);

        let mut memory = self.memory.lock();
        Ok(MappedBuffer {
            target: MapTarget::Device(self.clone()),
            ptr: memory.as_mut_ptr(),
            len: memory.len(),
            access,
            active: true,
        })
    }

    /// Revoke the most recent mapping
    pub fn unmap(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.access_stack.pop().is_none() {
            return Err(RuntimeError::invalid_operation("unmap without map"));
        }
        if state.access_stack.is_empty() && state.wrote {
            state.wrote = false;
            state.device_sync = SyncStatus::NeedsWriteBack;
        }
        Ok(())
    }

    /// Reconcile the device view
    pub fn sync(&self, op: SyncOp, force: bool) -> Result<()> {
        let mut state = self.state.lock();
        match op {
            SyncOp::Invalidate => {
                if state.device_sync == SyncStatus::NeedsInvalidate || force {
                    state.device_sync = SyncStatus::Valid;
                }
            }
            SyncOp::WriteBack => {
                if state.device_sync == SyncStatus::NeedsWriteBack || force {
                    state.device_sync = SyncStatus::Valid;
                }
            }
        }
        Ok(())
    }

    fn with_memory<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.memory.lock())
    }

    fn with_memory_mut<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> T {
        f(&mut self.memory.lock())
    }
}

// Whether a host buffer can feed the device directly (DMA-visible)
fn dma_visible(buffer: &HostBuffer) -> bool {
    !matches!(buffer.pool(), MemoryPool::CpuOnly)
}

/// Copy host → device, staging through shared memory when the source is
/// not DMA-visible
#[allow(clippy::too_many_arguments)]
pub(crate) fn copy_host_to_device(
    src: &Arc<HostBuffer>,
    src_start: usize,
    dest: &Arc<DeviceBuffer>,
    dest_start: usize,
    datatype: Datatype,
    shape: &[usize],
    src_strides: &[usize],
    dest_strides: &[usize],
) -> Result<()> {
    let elem = datatype.size_bytes();

    let (staged, staged_start) = if dma_visible(src) {
        (src.clone(), src_start)
    } else {
        // Stage into a shared buffer the device can read from.
        let contiguous = default_strides(shape);
        let staging_bytes = max_addressable(shape, &contiguous) * elem;
        let staging = host_allocator()
            .allocate(staging_bytes, &AllocateOptions { flags: HOST_BUFFER_ALLOCATE_SHARED })?
            .as_host()
            .unwrap();
        copy_host_to_host(
            src,
            src_start,
            &staging,
            0,
            datatype,
            shape,
            src_strides,
            &contiguous,
        )?;
        staging.sync(SyncOp::WriteBack, true)?;
        return copy_host_to_device(
            &staging,
            0,
            dest,
            dest_start,
            datatype,
            shape,
            &contiguous,
            dest_strides,
        );
    };

    staged.sync(SyncOp::WriteBack, false)?;
    let src_len = max_addressable(shape, src_strides) * elem;
    let src_map = staged.map_range(MapAccess::READ, staged_start, src_len)?;
    dest.with_memory_mut(|memory| -> Result<()> {
        let dest_len = max_addressable(shape, dest_strides) * elem;
        let region = memory
            .get_mut(dest_start..dest_start + dest_len)
            .ok_or_else(|| RuntimeError::invalid_argument("device copy out of range"))?;
        copy_strided(src_map.as_slice(), region, elem, shape, src_strides, dest_strides);
        Ok(())
    })?;
    dest.set_device_sync_status(SyncStatus::Valid);
    src_map.unmap()
}

/// Copy device → host; the host view is marked for invalidation when the
/// destination is device-visible
#[allow(clippy::too_many_arguments)]
pub(crate) fn copy_device_to_host(
    src: &Arc<DeviceBuffer>,
    src_start: usize,
    dest: &Arc<HostBuffer>,
    dest_start: usize,
    datatype: Datatype,
    shape: &[usize],
    src_strides: &[usize],
    dest_strides: &[usize],
) -> Result<()> {
    let elem = datatype.size_bytes();
    src.sync(SyncOp::WriteBack, false)?;

    let dest_len = max_addressable(shape, dest_strides) * elem;
    let mut dest_map = dest.map_range(MapAccess::WRITE, dest_start, dest_len)?;
    src.with_memory(|memory| -> Result<()> {
        let src_len = max_addressable(shape, src_strides) * elem;
        let region = memory
            .get(src_start..src_start + src_len)
            .ok_or_else(|| RuntimeError::invalid_argument("device copy out of range"))?;
        copy_strided(region, dest_map.as_mut_slice()?, elem, shape, src_strides, dest_strides);
        Ok(())
    })?;
    dest_map.unmap()
}

/// Copy device → device through a host staging allocation
#[allow(clippy::too_many_arguments)]
pub(crate) fn copy_device_to_device(
    src: &Arc<DeviceBuffer>,
    src_start: usize,
    dest: &Arc<DeviceBuffer>,
    dest_start: usize,
    datatype: Datatype,
    shape: &[usize],
    src_strides: &[usize],
    dest_strides: &[usize],
) -> Result<()> {
    let elem = datatype.size_bytes();
    let contiguous = default_strides(shape);
    let staging_bytes = max_addressable(shape, &contiguous) * elem;
    let staging = host_allocator()
        .allocate(staging_bytes, &AllocateOptions { flags: HOST_BUFFER_ALLOCATE_SHARED })?
        .as_host()
        .unwrap();
    copy_device_to_host(
        src, src_start, &staging, 0, datatype, shape, src_strides, &contiguous,
    )?;
    copy_host_to_device(
        &staging, 0, dest, dest_start, datatype, shape, &contiguous, dest_strides,
    )
}
