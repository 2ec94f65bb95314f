//! Host and device buffers
//!
//! Buffers are reference-counted and kind-tagged. A [`BufferSlice`] holds a
//! strong reference plus a byte window; tensors address their storage
//! through slices. Copies between heterogeneous buffers stage through host
//! memory when no direct path exists.

pub mod allocator;
pub mod device;
pub mod host;

pub use allocator::{
    host_allocator, register_allocator, AllocateOptions, AttachOptions, BufferAllocator,
    DataDeleter, MemoryPool, HOST_BUFFER_ALLOCATE_CPU_ONLY, HOST_BUFFER_ALLOCATE_SHARED,
    HOST_BUFFER_ATTACH_SHARED,
};
pub use device::DeviceBuffer;
pub use host::{HostBuffer, MapAccess, MappedBuffer, SyncOp, SyncStatus};

use crate::error::{Result, RuntimeError};
use kmdl_core::{Datatype, ObjectKind};
use std::sync::Arc;

/// Shared, kind-tagged buffer handle
#[derive(Clone)]
pub enum BufferRef {
    /// Host-memory buffer
    Host(Arc<HostBuffer>),
    /// Device-memory buffer
    Device(Arc<DeviceBuffer>),
}

impl BufferRef {
    /// Dynamic object kind
    pub fn kind(&self) -> ObjectKind {
        match self {
            BufferRef::Host(_) => ObjectKind::HostBuffer,
            BufferRef::Device(_) => ObjectKind::DeviceBuffer,
        }
    }

    /// Total buffer size in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            BufferRef::Host(b) => b.size_bytes(),
            BufferRef::Device(b) => b.size_bytes(),
        }
    }

    /// Downcast to a host buffer
    pub fn as_host(&self) -> Option<Arc<HostBuffer>> {
        match self {
            BufferRef::Host(b) => Some(b.clone()),
            BufferRef::Device(_) => None,
        }
    }

    /// Downcast to a device buffer
    pub fn as_device(&self) -> Option<Arc<DeviceBuffer>> {
        match self {
            BufferRef::Device(b) => Some(b.clone()),
            BufferRef::Host(_) => None,
        }
    }

    /// Whether two handles refer to the same buffer object
    pub fn same_buffer(&self, other: &BufferRef) -> bool {
        match (self, other) {
            (BufferRef::Host(a), BufferRef::Host(b)) => Arc::ptr_eq(a, b),
            (BufferRef::Device(a), BufferRef::Device(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A byte window into a shared buffer
#[derive(Clone)]
pub struct BufferSlice {
    buffer: BufferRef,
    start: usize,
    length: usize,
}

impl BufferSlice {
    /// Slice covering a whole buffer
    pub fn whole(buffer: BufferRef) -> Self {
        let length = buffer.size_bytes();
        Self {
            buffer,
            start: 0,
            length,
        }
    }

    /// Slice covering `[start, start + length)`
    pub fn new(buffer: BufferRef, start: usize, length: usize) -> Result<Self> {
        if start + length > buffer.size_bytes() {
            return Err(RuntimeError::invalid_argument(format!(
                "slice [{}, {}) exceeds buffer of {} bytes",
                start,
                start + length,
                buffer.size_bytes()
            )));
        }
        Ok(Self {
            buffer,
            start,
            length,
        })
    }

    /// The underlying buffer handle
    pub fn buffer(&self) -> &BufferRef {
        &self.buffer
    }

    /// Window start offset in bytes
    pub fn start(&self) -> usize {
        self.start
    }

    /// Window length in bytes
    pub fn size_bytes(&self) -> usize {
        self.length
    }

    /// Copy a strided tensor view from this slice into `dest`.
    ///
    /// Shapes are in elements; strides are element strides. Heterogeneous
    /// copies (host↔device) stage and sync as needed.
    pub fn copy_to(
        &self,
        dest: &BufferSlice,
        datatype: Datatype,
        shape: &[usize],
        src_strides: &[usize],
        dest_strides: &[usize],
    ) -> Result<()> {
        match (&self.buffer, &dest.buffer) {
            (BufferRef::Host(src), BufferRef::Host(dst)) => host::copy_host_to_host(
                src, self.start, dst, dest.start, datatype, shape, src_strides, dest_strides,
            ),
            (BufferRef::Host(src), BufferRef::Device(dst)) => device::copy_host_to_device(
                src, self.start, dst, dest.start, datatype, shape, src_strides, dest_strides,
            ),
            (BufferRef::Device(src), BufferRef::Host(dst)) => device::copy_device_to_host(
                src, self.start, dst, dest.start, datatype, shape, src_strides, dest_strides,
            ),
            (BufferRef::Device(src), BufferRef::Device(dst)) => device::copy_device_to_device(
                src, self.start, dst, dest.start, datatype, shape, src_strides, dest_strides,
            ),
        }
    }
}

/// Strided element-wise copy between two byte regions.
///
/// Offsets advance by `elem_size * stride` per index step; when both
/// innermost strides are 1 whole rows are copied at once.
pub(crate) fn copy_strided(
    src: &[u8],
    dest: &mut [u8],
    elem_size: usize,
    shape: &[usize],
    src_strides: &[usize],
    dest_strides: &[usize],
) {
    if shape.is_empty() {
        dest[..elem_size].copy_from_slice(&src[..elem_size]);
        return;
    }
    if shape.iter().any(|&d| d == 0) {
        return;
    }

    let rank = shape.len();
    let row_fast = src_strides[rank - 1] == 1 && dest_strides[rank - 1] == 1;
    let row_len = shape[rank - 1];
    let outer_rank = rank - 1;
    let mut index = vec![0usize; outer_rank];

    loop {
        let mut src_off = 0;
        let mut dest_off = 0;
        for i in 0..outer_rank {
            src_off += index[i] * src_strides[i];
            dest_off += index[i] * dest_strides[i];
        }

        if row_fast {
            let src_byte = src_off * elem_size;
            let dest_byte = dest_off * elem_size;
            let bytes = row_len * elem_size;
            dest[dest_byte..dest_byte + bytes].copy_from_slice(&src[src_byte..src_byte + bytes]);
        } else {
            for j in 0..row_len {
                let src_byte = (src_off + j * src_strides[rank - 1]) * elem_size;
                let dest_byte = (dest_off + j * dest_strides[rank - 1]) * elem_size;
                dest[dest_byte..dest_byte + elem_size]
                    .copy_from_slice(&src[src_byte..src_byte + elem_size]);
            }
        }

        // Odometer over the outer dimensions.
        let mut axis = outer_rank;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}
