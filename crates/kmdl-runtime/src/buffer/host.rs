//! Host buffers with map/sync lifecycle

use crate::buffer::allocator::{DataDeleter, MemoryPool};
use crate::buffer::device::DeviceBuffer;
use crate::buffer::copy_strided;
use crate::error::{Result, RuntimeError};
use bitflags::bitflags;
use kmdl_core::{max_addressable, Datatype};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

bitflags! {
    /// Access requested by a map call
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapAccess: u8 {
        /// The mapping will be read through
        const READ = 1;
        /// The mapping will be written through
        const WRITE = 2;
    }
}

impl MapAccess {
    /// Read and write access
    pub const READ_WRITE: MapAccess = MapAccess::from_bits_truncate(3);
}

/// Coherence state of one view of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The view is coherent
    Valid,
    /// The view must be invalidated before reading
    NeedsInvalidate,
    /// The view holds data that must be written back
    NeedsWriteBack,
}

/// Direction of an explicit sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// Discard the stale view and refetch
    Invalidate,
    /// Flush pending writes to the other side
    WriteBack,
}

// Backing memory: either owned by the buffer or attached external memory
// released through a caller-supplied deleter.
struct Storage {
    ptr: *mut u8,
    len: usize,
    kind: StorageKind,
}

enum StorageKind {
    Owned,
    Attached { deleter: Option<DataDeleter> },
}

impl Storage {
    fn owned(len: usize) -> Result<Storage> {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Ok(Storage {
            ptr,
            len,
            kind: StorageKind::Owned,
        })
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        match &mut self.kind {
            StorageKind::Owned => unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.ptr, self.len,
                )));
            },
            StorageKind::Attached { deleter } => {
                if let Some(deleter) = deleter {
                    deleter(self.ptr);
                }
            }
        }
    }
}

unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

struct MapState {
    host_sync: SyncStatus,
    device_sync: Option<SyncStatus>,
    access_stack: SmallVec<[MapAccess; 2]>,
    wrote: bool,
}

/// A mappable host-memory buffer.
///
/// Nested maps are allowed and tracked by an access stack; the last unmap
/// after any write mapping marks the device view stale. Purely host-local
/// buffers carry no device view and sync calls on them are no-ops.
pub struct HostBuffer {
    storage: Storage,
    size_bytes: usize,
    pool: MemoryPool,
    physical: Option<usize>,
    state: Mutex<MapState>,
}

impl HostBuffer {
    /// Allocate a zero-initialized host buffer
    pub fn allocate(size_bytes: usize, pool: MemoryPool) -> Result<HostBuffer> {
        let storage = Storage::owned(size_bytes)?;
        // Shared allocations emulate a stable physical mapping with the
        // virtual address; a real port maps DMA memory here.
        let physical = match pool {
            MemoryPool::Shared | MemoryPool::SharedFirst => Some(storage.ptr as usize),
            MemoryPool::CpuOnly => None,
        };
        Ok(HostBuffer {
            size_bytes,
            pool,
            physical,
            storage,
            state: Mutex::new(MapState {
                host_sync: SyncStatus::Valid,
                device_sync: matches!(pool, MemoryPool::Shared | MemoryPool::SharedFirst)
                    .then_some(SyncStatus::Valid),
                access_stack: SmallVec::new(),
                wrote: false,
            }),
        })
    }

    /// Wrap externally owned memory.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of `size_bytes` bytes
    /// until the buffer is dropped.
    pub unsafe fn attach(
        ptr: *mut u8,
        size_bytes: usize,
        pool: MemoryPool,
        physical: Option<usize>,
        deleter: Option<DataDeleter>,
    ) -> Result<HostBuffer> {
        if ptr.is_null() {
            return Err(RuntimeError::invalid_argument("attach of null pointer"));
        }
        Ok(HostBuffer {
            storage: Storage {
                ptr,
                len: size_bytes,
                kind: StorageKind::Attached { deleter },
            },
            size_bytes,
            pool,
            physical,
            state: Mutex::new(MapState {
                host_sync: SyncStatus::Valid,
                device_sync: matches!(pool, MemoryPool::Shared | MemoryPool::SharedFirst)
                    .then_some(SyncStatus::Valid),
                access_stack: SmallVec::new(),
                wrote: false,
            }),
        })
    }

    /// Buffer size in bytes
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Pool this buffer was allocated from
    pub fn pool(&self) -> MemoryPool {
        self.pool
    }

    /// Current host view status
    pub fn host_sync_status(&self) -> SyncStatus {
        self.state.lock().host_sync
    }

    /// Overwrite the host view status (used by device copies)
    pub fn set_host_sync_status(&self, status: SyncStatus) {
        self.state.lock().host_sync = status;
    }

    /// Device view status; `None` for purely host-local buffers
    pub fn device_sync_status(&self) -> Option<SyncStatus> {
        self.state.lock().device_sync
    }

    /// Stable physical address, for shared buffers only
    pub fn physical_address(&self) -> Result<usize> {
        self.physical.ok_or_else(|| {
            RuntimeError::not_supported("physical address of a non-shared buffer")
        })
    }

    /// Map the whole buffer
    pub fn map(self: &Arc<Self>, access: MapAccess) -> Result<MappedBuffer> {
        self.map_range(access, 0, self.size_bytes)
    }

    /// Map a byte range of the buffer
    pub fn map_range(
        self: &Arc<Self>,
        access: MapAccess,
        start: usize,
        length: usize,
    ) -> Result<MappedBuffer> {
        if access.is_empty() {
            return Err(RuntimeError::invalid_argument("map with empty access"));
        }
        if start + length > self.size_bytes {
            return Err(RuntimeError::invalid_argument(format!(
                "map range [{}, {}) exceeds buffer of {} bytes",
                start,
                start + length,
                self.size_bytes
            )));
        }

        let mut state = self.state.lock();
        if access.contains(MapAccess::WRITE)
            && state.access_stack.iter().any(|a| a.contains(MapAccess::WRITE))
        {
            return Err(RuntimeError::invalid_operation(
                "overlapping write mapping",
            ));
        }
        if state.access_stack.is_empty() && state.host_sync == SyncStatus::NeedsInvalidate {
            // First map of a stale host view invalidates before exposing
            // the pointer. The cmodel backing needs no cache maintenance.
            state.host_sync = SyncStatus::Valid;
        }
        state.access_stack.push(access);
        if access.contains(MapAccess::WRITE) {
            state.wrote = true;
        }
        drop(state);

        Ok(MappedBuffer {
            target: MapTarget::Host(self.clone()),
            ptr: unsafe { self.storage.ptr.add(start) },
            len: length,
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
            if state.device_sync.is_some() {
                state.device_sync = Some(SyncStatus::NeedsWriteBack);
            }
        }
        Ok(())
    }

    /// Reconcile the host and device views
    pub fn sync(&self, op: SyncOp, force: bool) -> Result<()> {
        let mut state = self.state.lock();
        match op {
            SyncOp::Invalidate => {
                if state.host_sync == SyncStatus::NeedsInvalidate || force {
                    state.host_sync = SyncStatus::Valid;
                }
            }
            SyncOp::WriteBack => {
                if let Some(device_sync) = state.device_sync {
                    if device_sync == SyncStatus::NeedsWriteBack || force {
                        state.device_sync = Some(SyncStatus::Valid);
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) enum MapTarget {
    Host(Arc<HostBuffer>),
    Device(Arc<DeviceBuffer>),
}

impl MapTarget {
    fn unmap(&self) -> Result<()> {
        match self {
            MapTarget::Host(b) => b.unmap(),
            MapTarget::Device(b) => b.unmap(),
        }
    }
}

/// A scoped CPU-visible view of a buffer.
///
/// Dropping the guard unmaps regardless of exit path; `unmap` surfaces the
/// result explicitly.
pub struct MappedBuffer {
    pub(crate) target: MapTarget,
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
    pub(crate) access: MapAccess,
    pub(crate) active: bool,
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("access", &self.access)
            .field("active", &self.active)
            .finish()
    }
}

impl MappedBuffer {
    /// The mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The mapped bytes, writable; requires a WRITE mapping
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.access.contains(MapAccess::WRITE) {
            return Err(RuntimeError::invalid_operation(
                "write through a read-only mapping",
            ));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) })
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unmap explicitly, surfacing any lifecycle error
    pub fn unmap(mut self) -> Result<()> {
        self.active = false;
        self.target.unmap()
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.target.unmap() {
                log::warn!("implicit unmap failed: {}", err);
            }
        }
    }
}

/// Strided copy between two host buffers
#[allow(clippy::too_many_arguments)]
pub(crate) fn copy_host_to_host(
    src: &Arc<HostBuffer>,
    src_start: usize,
    dest: &Arc<HostBuffer>,
    dest_start: usize,
    datatype: Datatype,
    shape: &[usize],
    src_strides: &[usize],
    dest_strides: &[usize],
) -> Result<()> {
    let elem = datatype.size_bytes();
    let src_len = max_addressable(shape, src_strides) * elem;
    let dest_len = max_addressable(shape, dest_strides) * elem;

    let src_map = src.map_range(MapAccess::READ, src_start, src_len)?;
    let mut dest_map = dest.map_range(MapAccess::WRITE, dest_start, dest_len)?;
    copy_strided(
        src_map.as_slice(),
        dest_map.as_mut_slice()?,
        elem,
        shape,
        src_strides,
        dest_strides,
    );
    dest_map.unmap()?;
    src_map.unmap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(len: usize, pool: MemoryPool) -> Arc<HostBuffer> {
        Arc::new(HostBuffer::allocate(len, pool).unwrap())
    }

    #[test]
    fn test_map_write_read_roundtrip() {
        let b = buffer(8, MemoryPool::CpuOnly);
        {
            let mut map = b.map(MapAccess::WRITE).unwrap();
            map.as_mut_slice().unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
            map.unmap().unwrap();
        }
        let map = b.map(MapAccess::READ).unwrap();
        assert_eq!(map.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_unmap_without_map() {
        let b = buffer(4, MemoryPool::CpuOnly);
        let err = b.unmap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_nested_maps() {
        let b = buffer(4, MemoryPool::Shared);
        let outer = b.map(MapAccess::READ).unwrap();
        let inner = b.map(MapAccess::WRITE).unwrap();
        drop(inner);
        // The write view is still outstanding through `outer`? No: outer
        // was read-only, and the stack is not yet empty, so the device
        // view stays valid until the last unmap.
        assert_eq!(b.device_sync_status(), Some(SyncStatus::Valid));
        drop(outer);
        assert_eq!(b.device_sync_status(), Some(SyncStatus::NeedsWriteBack));
    }

    #[test]
    fn test_overlapping_write_rejected() {
        let b = buffer(4, MemoryPool::CpuOnly);
        let _first = b.map(MapAccess::WRITE).unwrap();
        let err = b.map(MapAccess::WRITE).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_write_unmap_marks_device_stale_only_when_shared() {
        let local = buffer(4, MemoryPool::CpuOnly);
        drop(local.map(MapAccess::WRITE).unwrap());
        assert_eq!(local.device_sync_status(), None);

        let shared = buffer(4, MemoryPool::Shared);
        drop(shared.map(MapAccess::WRITE).unwrap());
        assert_eq!(shared.device_sync_status(), Some(SyncStatus::NeedsWriteBack));
        shared.sync(SyncOp::WriteBack, false).unwrap();
        assert_eq!(shared.device_sync_status(), Some(SyncStatus::Valid));
    }

    #[test]
    fn test_first_map_invalidates_stale_host_view() {
        let b = buffer(4, MemoryPool::Shared);
        b.set_host_sync_status(SyncStatus::NeedsInvalidate);
        let map = b.map(MapAccess::READ).unwrap();
        drop(map);
        assert_eq!(b.host_sync_status(), SyncStatus::Valid);
    }

    #[test]
    fn test_read_only_mapping_rejects_writes() {
        let b = buffer(4, MemoryPool::CpuOnly);
        let mut map = b.map(MapAccess::READ).unwrap();
        assert!(map.as_mut_slice().is_err());
    }

    #[test]
    fn test_map_range_bounds() {
        let b = buffer(8, MemoryPool::CpuOnly);
        assert!(b.map_range(MapAccess::READ, 4, 4).is_ok());
        assert!(b.map_range(MapAccess::READ, 4, 5).is_err());
    }
}
