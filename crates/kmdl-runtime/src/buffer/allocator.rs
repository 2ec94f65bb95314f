//! Buffer allocators and the process-wide allocator registry

use crate::buffer::host::HostBuffer;
use crate::buffer::BufferRef;
use crate::error::{Result, RuntimeError};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Allocate flag: host-only memory, no device visibility required
pub const HOST_BUFFER_ALLOCATE_CPU_ONLY: usize = 1;

/// Allocate flag: memory the target can access directly (DMA-capable)
pub const HOST_BUFFER_ALLOCATE_SHARED: usize = 2;

/// Attach flag: the attached range is device-visible
pub const HOST_BUFFER_ATTACH_SHARED: usize = 1;

/// Memory pool a host tensor allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPool {
    /// Host-only memory
    #[default]
    CpuOnly,
    /// Device-visible memory
    Shared,
    /// Prefer shared, fall back to host-only
    SharedFirst,
}

/// Options for [`BufferAllocator::allocate`]
#[derive(Default)]
pub struct AllocateOptions {
    /// Allocation flags (`HOST_BUFFER_ALLOCATE_*`)
    pub flags: usize,
}

impl AllocateOptions {
    /// Options for a pool
    pub fn pool(pool: MemoryPool) -> Self {
        let flags = match pool {
            MemoryPool::CpuOnly => HOST_BUFFER_ALLOCATE_CPU_ONLY,
            MemoryPool::Shared | MemoryPool::SharedFirst => HOST_BUFFER_ALLOCATE_SHARED,
        };
        Self { flags }
    }
}

/// Deleter invoked when an attached buffer is destroyed
pub type DataDeleter = Box<dyn FnMut(*mut u8) + Send>;

/// Options for [`BufferAllocator::attach`]
#[derive(Default)]
pub struct AttachOptions {
    /// Attach flags (`HOST_BUFFER_ATTACH_*`)
    pub flags: usize,
    /// Stable physical address of the range, when known
    pub physical_address: usize,
    /// Invoked with the data pointer at buffer destruction
    pub deleter: Option<DataDeleter>,
}

/// Allocates and wraps buffers
pub trait BufferAllocator: Send + Sync {
    /// Allocate a zero-initialized buffer
    fn allocate(&self, size_bytes: usize, options: &AllocateOptions) -> Result<BufferRef>;

    /// Wrap an externally owned byte range.
    ///
    /// # Safety
    ///
    /// `data` must point to `size_bytes` of readable and writable memory
    /// that stays valid until the returned buffer is dropped (at which
    /// point the deleter, if any, runs).
    unsafe fn attach(
        &self,
        data: *mut u8,
        size_bytes: usize,
        options: AttachOptions,
    ) -> Result<BufferRef>;

    /// Advisory reclaim of cached memory
    fn shrink_memory_pool(&self) {}
}

/// The built-in host allocator
#[derive(Default)]
pub struct HostAllocator;

impl BufferAllocator for HostAllocator {
    fn allocate(&self, size_bytes: usize, options: &AllocateOptions) -> Result<BufferRef> {
        let pool = if options.flags & HOST_BUFFER_ALLOCATE_SHARED != 0 {
            MemoryPool::Shared
        } else {
            MemoryPool::CpuOnly
        };
        let buffer = HostBuffer::allocate(size_bytes, pool)?;
        Ok(BufferRef::Host(Arc::new(buffer)))
    }

    unsafe fn attach(
        &self,
        data: *mut u8,
        size_bytes: usize,
        options: AttachOptions,
    ) -> Result<BufferRef> {
        let pool = if options.flags & HOST_BUFFER_ATTACH_SHARED != 0 {
            MemoryPool::Shared
        } else {
            MemoryPool::CpuOnly
        };
        let physical = if options.physical_address != 0 {
            Some(options.physical_address)
        } else {
            None
        };
        let buffer = HostBuffer::attach(data, size_bytes, pool, physical, options.deleter)?;
        Ok(BufferRef::Host(Arc::new(buffer)))
    }
}

static HOST_ALLOCATOR: Lazy<HostAllocator> = Lazy::new(HostAllocator::default);

static ALLOCATORS: Lazy<RwLock<HashMap<&'static str, &'static (dyn BufferAllocator)>>> =
    Lazy::new(|| {
        let mut map: HashMap<&'static str, &'static (dyn BufferAllocator)> = HashMap::new();
        map.insert("host", &*HOST_ALLOCATOR);
        RwLock::new(map)
    });

/// The process-wide host allocator
pub fn host_allocator() -> &'static dyn BufferAllocator {
    &*HOST_ALLOCATOR
}

/// Register a named allocator.
///
/// Intended to run once at startup, before any interpreter exists.
pub fn register_allocator(name: &'static str, allocator: &'static dyn BufferAllocator) {
    ALLOCATORS.write().insert(name, allocator);
}

/// Look up a named allocator
pub fn allocator(name: &str) -> Result<&'static dyn BufferAllocator> {
    ALLOCATORS
        .read()
        .get(name)
        .copied()
        .ok_or_else(|| RuntimeError::not_found(format!("allocator '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_pools() {
        let cpu = host_allocator()
            .allocate(64, &AllocateOptions { flags: HOST_BUFFER_ALLOCATE_CPU_ONLY })
            .unwrap();
        let host = cpu.as_host().unwrap();
        assert_eq!(host.pool(), MemoryPool::CpuOnly);
        assert!(host.physical_address().is_err());

        let shared = host_allocator()
            .allocate(64, &AllocateOptions { flags: HOST_BUFFER_ALLOCATE_SHARED })
            .unwrap();
        let host = shared.as_host().unwrap();
        assert_eq!(host.pool(), MemoryPool::Shared);
        assert!(host.physical_address().is_ok());
    }

    #[test]
    fn test_attach_with_deleter() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;

        let mut backing = vec![5u8; 32].into_boxed_slice();
        let freed = StdArc::new(AtomicBool::new(false));
        let freed_flag = freed.clone();
        let ptr = backing.as_mut_ptr();
        std::mem::forget(backing);

        let buffer = unsafe {
            host_allocator().attach(
                ptr,
                32,
                AttachOptions {
                    flags: 0,
                    physical_address: 0,
                    deleter: Some(Box::new(move |p| {
                        freed_flag.store(true, Ordering::SeqCst);
                        unsafe { drop(Box::from_raw(std::slice::from_raw_parts_mut(p, 32))) };
                    })),
                },
            )
        }
        .unwrap();

        assert_eq!(buffer.size_bytes(), 32);
        drop(buffer);
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_registry() {
        assert!(allocator("host").is_ok());
        assert!(allocator("npu0").is_err());
    }
}
