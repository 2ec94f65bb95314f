//! Runtime tensors: datatype + shape + strides over a buffer slice

use crate::buffer::{
    host_allocator, AllocateOptions, AttachOptions, BufferRef, BufferSlice, DeviceBuffer,
    MapAccess, MappedBuffer, MemoryPool, SyncOp,
};
use crate::error::{Result, RuntimeError};
use kmdl_core::{
    bytes_of_strided, default_strides, is_contiguous, Datatype, Shape, Strides, TensorType, Type,
};
use std::sync::Arc;

/// A typed, strided view over a buffer slice
#[derive(Clone)]
pub struct RuntimeTensor {
    dtype: Datatype,
    shape: Shape,
    strides: Strides,
    slice: BufferSlice,
}

impl RuntimeTensor {
    /// Create a tensor view.
    ///
    /// The slice must cover every element the strided view can address.
    pub fn new(
        dtype: Datatype,
        shape: impl Into<Shape>,
        strides: impl Into<Strides>,
        slice: BufferSlice,
    ) -> Result<RuntimeTensor> {
        let shape = shape.into();
        let strides = strides.into();
        if strides.len() != shape.len() {
            return Err(RuntimeError::invalid_argument(format!(
                "strides rank {} does not match shape rank {}",
                strides.len(),
                shape.len()
            )));
        }
        let needed = bytes_of_strided(dtype, &shape, &strides);
        if slice.size_bytes() < needed {
            return Err(RuntimeError::invalid_argument(format!(
                "buffer slice of {} bytes cannot back a view needing {}",
                slice.size_bytes(),
                needed
            )));
        }
        Ok(RuntimeTensor {
            dtype,
            shape,
            strides,
            slice,
        })
    }

    /// Element datatype
    pub fn datatype(&self) -> Datatype {
        self.dtype
    }

    /// Shape in elements
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element strides
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// The backing buffer slice
    pub fn buffer_slice(&self) -> &BufferSlice {
        &self.slice
    }

    /// Static type of this tensor
    pub fn ty(&self) -> Type {
        Type::Tensor(TensorType::new(self.dtype, self.shape.clone()))
    }

    /// Whether the backing buffer is host memory
    pub fn is_host(&self) -> bool {
        matches!(self.slice.buffer(), BufferRef::Host(_))
    }

    /// Whether strides are exactly row-major for the shape
    pub fn is_contiguous(&self) -> bool {
        is_contiguous(&self.shape, &self.strides)
    }

    /// Whether a copy to `dest` needs no intermediate staging
    pub fn can_copy_to_without_staging(&self, dest: &RuntimeTensor) -> bool {
        match (self.slice.buffer(), dest.slice.buffer()) {
            (BufferRef::Host(_), BufferRef::Host(_)) => true,
            (BufferRef::Host(src), BufferRef::Device(_)) => {
                !matches!(src.pool(), MemoryPool::CpuOnly)
            }
            (BufferRef::Device(_), BufferRef::Host(_)) => true,
            (BufferRef::Device(_), BufferRef::Device(_)) => false,
        }
    }

    /// Copy this tensor's contents into `dest`.
    ///
    /// Shapes must match exactly; datatype conversion is not a copy and is
    /// rejected with `NotSupported`. Contiguous same-layout copies
    /// degenerate to one memcpy; otherwise the copy walks both stride
    /// patterns. Host↔device transfers stage and sync as required.
    pub fn copy_to(&self, dest: &RuntimeTensor) -> Result<()> {
        if self.shape != dest.shape {
            return Err(RuntimeError::invalid_argument(format!(
                "copy between different shapes {:?} and {:?}",
                self.shape.as_slice(),
                dest.shape.as_slice()
            )));
        }
        if self.dtype != dest.dtype {
            return Err(RuntimeError::not_supported(format!(
                "copy from {} to {}",
                self.dtype, dest.dtype
            )));
        }
        self.slice
            .copy_to(&dest.slice, self.dtype, &self.shape, &self.strides, &dest.strides)
    }

    /// Clone into host memory; a no-op handle clone when already there
    pub fn to_host(&self) -> Result<RuntimeTensor> {
        if self.is_host() {
            return Ok(self.clone());
        }
        let dest = host_tensor::create(self.dtype, self.shape.clone(), MemoryPool::CpuOnly)?;
        self.copy_to(&dest)?;
        Ok(dest)
    }

    /// Map a host tensor's bytes
    pub fn map(&self, access: MapAccess) -> Result<MappedBuffer> {
        match self.slice.buffer() {
            BufferRef::Host(buffer) => {
                buffer.map_range(access, self.slice.start(), self.slice.size_bytes())
            }
            BufferRef::Device(_) => Err(RuntimeError::invalid_operation(
                "map of a device tensor; copy to host first",
            )),
        }
    }

    /// Sync a host tensor's backing buffer
    pub fn sync(&self, op: SyncOp, force: bool) -> Result<()> {
        match self.slice.buffer() {
            BufferRef::Host(buffer) => buffer.sync(op, force),
            BufferRef::Device(buffer) => buffer.sync(op, force),
        }
    }
}

/// Host tensor constructors
pub mod host_tensor {
    use super::*;

    /// Allocate a host tensor with row-major layout
    pub fn create(
        dtype: Datatype,
        shape: impl Into<Shape>,
        pool: MemoryPool,
    ) -> Result<RuntimeTensor> {
        let shape = shape.into();
        let strides = default_strides(&shape);
        create_strided(dtype, shape, strides, pool)
    }

    /// Allocate a host tensor with explicit strides
    pub fn create_strided(
        dtype: Datatype,
        shape: impl Into<Shape>,
        strides: impl Into<Strides>,
        pool: MemoryPool,
    ) -> Result<RuntimeTensor> {
        let shape = shape.into();
        let strides = strides.into();
        let bytes = bytes_of_strided(dtype, &shape, &strides);
        let buffer = host_allocator().allocate(bytes, &AllocateOptions::pool(pool))?;
        RuntimeTensor::new(dtype, shape, strides, BufferSlice::whole(buffer))
    }

    /// Allocate a host tensor and copy `data` into it
    pub fn create_with_data(
        dtype: Datatype,
        shape: impl Into<Shape>,
        data: &[u8],
        pool: MemoryPool,
    ) -> Result<RuntimeTensor> {
        let tensor = create(dtype, shape, pool)?;
        let expected = tensor.slice.size_bytes();
        if data.len() != expected {
            return Err(RuntimeError::invalid_argument(format!(
                "data of {} bytes does not fill a tensor of {} bytes",
                data.len(),
                expected
            )));
        }
        {
            let mut map = tensor.map(MapAccess::WRITE)?;
            map.as_mut_slice()?.copy_from_slice(data);
            map.unmap()?;
        }
        Ok(tensor)
    }

    /// Allocate a host tensor from typed elements
    pub fn from_elems<T: kmdl_core::IntoDatatype + pod::Pod>(
        shape: impl Into<Shape>,
        elems: &[T],
    ) -> Result<RuntimeTensor> {
        let shape = shape.into();
        if kmdl_core::num_elements(&shape) != elems.len() {
            return Err(RuntimeError::invalid_argument(
                "element count does not match shape",
            ));
        }
        create_with_data(T::DATATYPE, shape, pod::as_bytes(elems), MemoryPool::CpuOnly)
    }

    /// Wrap externally owned memory without copying.
    ///
    /// # Safety
    ///
    /// `data` must stay valid for `len` bytes until the tensor (and every
    /// clone of it) is dropped; the deleter, if any, then runs.
    pub unsafe fn attach(
        dtype: Datatype,
        shape: impl Into<Shape>,
        data: *mut u8,
        len: usize,
        options: AttachOptions,
    ) -> Result<RuntimeTensor> {
        let shape = shape.into();
        let strides = default_strides(&shape);
        let buffer = host_allocator().attach(data, len, options)?;
        RuntimeTensor::new(dtype, shape, strides, BufferSlice::whole(buffer))
    }

    /// Minimal plain-old-data byte viewing for element slices; the scalar
    /// kinds used here are all layout-stable.
    pub mod pod {
        /// Marker for scalar element types safe to view as bytes
        pub trait Pod: Copy {}
        impl Pod for i8 {}
        impl Pod for i16 {}
        impl Pod for i32 {}
        impl Pod for i64 {}
        impl Pod for u8 {}
        impl Pod for u16 {}
        impl Pod for u32 {}
        impl Pod for u64 {}
        impl Pod for f32 {}
        impl Pod for f64 {}
        impl Pod for half::f16 {}
        impl Pod for half::bf16 {}

        /// View a slice of scalars as little-endian bytes
        pub fn as_bytes<T: Pod>(elems: &[T]) -> &[u8] {
            unsafe {
                std::slice::from_raw_parts(
                    elems.as_ptr() as *const u8,
                    std::mem::size_of_val(elems),
                )
            }
        }
    }
}

/// Device tensor constructors
pub mod device_tensor {
    use super::*;

    /// Allocate a device tensor with row-major layout
    pub fn create(
        dtype: Datatype,
        shape: impl Into<Shape>,
        device_type: i32,
        device_id: i32,
    ) -> Result<RuntimeTensor> {
        let shape = shape.into();
        let strides = default_strides(&shape);
        let bytes = bytes_of_strided(dtype, &shape, &strides);
        let buffer = Arc::new(DeviceBuffer::allocate(bytes, device_type, device_id)?);
        RuntimeTensor::new(dtype, shape, strides, BufferSlice::whole(BufferRef::Device(buffer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmdl_core::Shape;

    fn filled(dims: &[usize]) -> RuntimeTensor {
        let n = kmdl_core::num_elements(dims);
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        host_tensor::from_elems(Shape::from_slice(dims), &data).unwrap()
    }

    fn read_f32(tensor: &RuntimeTensor) -> Vec<f32> {
        let map = tensor.map(MapAccess::READ).unwrap();
        map.as_slice()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_contiguous_copy() {
        let src = filled(&[2, 3]);
        let dest = host_tensor::create(Datatype::Float32, Shape::from_slice(&[2, 3]), MemoryPool::CpuOnly).unwrap();
        src.copy_to(&dest).unwrap();
        assert_eq!(read_f32(&dest), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_strided_copy() {
        let src = filled(&[2, 3]);
        // Column-major destination layout.
        let dest = host_tensor::create_strided(
            Datatype::Float32,
            Shape::from_slice(&[2, 3]),
            Shape::from_slice(&[1, 2]),
            MemoryPool::CpuOnly,
        )
        .unwrap();
        assert!(!dest.is_contiguous());
        src.copy_to(&dest).unwrap();
        assert_eq!(read_f32(&dest), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_copy_shape_and_dtype_checks() {
        let src = filled(&[4]);
        let wrong_shape =
            host_tensor::create(Datatype::Float32, Shape::from_slice(&[5]), MemoryPool::CpuOnly).unwrap();
        assert_eq!(
            src.copy_to(&wrong_shape).unwrap_err().kind(),
            crate::error::ErrorKind::InvalidArgument
        );

        let wrong_dtype =
            host_tensor::create(Datatype::Int32, Shape::from_slice(&[4]), MemoryPool::CpuOnly).unwrap();
        assert_eq!(
            src.copy_to(&wrong_dtype).unwrap_err().kind(),
            crate::error::ErrorKind::NotSupported
        );
    }

    #[test]
    fn test_device_roundtrip() {
        let host = filled(&[16]);
        let device = device_tensor::create(Datatype::Float32, Shape::from_slice(&[16]), 0, 0).unwrap();
        host.copy_to(&device).unwrap();

        let back = device.to_host().unwrap();
        assert_eq!(back.shape(), host.shape());
        assert_eq!(back.datatype(), host.datatype());
        assert_eq!(read_f32(&back), read_f32(&host));
    }

    #[test]
    fn test_to_host_is_identity_for_host_tensors() {
        let t = filled(&[2]);
        let h = t.to_host().unwrap();
        assert!(h.buffer_slice().buffer().same_buffer(t.buffer_slice().buffer()));
    }

    #[test]
    fn test_view_invariant() {
        let buffer = host_allocator().allocate(8, &AllocateOptions::default()).unwrap();
        let slice = BufferSlice::whole(buffer);
        // A [2, 2] f32 view needs 16 bytes; the slice has 8.
        assert!(RuntimeTensor::new(
            Datatype::Float32,
            Shape::from_slice(&[2, 2]),
            Shape::from_slice(&[2, 1]),
            slice
        )
        .is_err());
    }

    #[test]
    fn test_scalar_tensor() {
        let t = host_tensor::from_elems(Shape::new(), &[42.0f32]).unwrap();
        assert!(t.shape().is_empty());
        assert!(t.is_contiguous());
        assert_eq!(read_f32(&t), vec![42.0]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Copying through a reversed-stride layout and back recovers
            // the original bytes for any small shape.
            #[test]
            fn strided_copy_roundtrips(dims in proptest::collection::vec(1usize..5, 1..4)) {
                let shape = Shape::from_slice(&dims);
                let n = kmdl_core::num_elements(&shape);
                let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
                let src = host_tensor::from_elems(shape.clone(), &data).unwrap();

                // Strides of the axis-reversed layout, applied back to the
                // original axis order: innermost becomes outermost.
                let mut scrambled: Shape = shape.clone();
                scrambled.reverse();
                let mut strides = kmdl_core::default_strides(&scrambled);
                strides.reverse();

                let via = host_tensor::create_strided(
                    Datatype::Float32,
                    shape.clone(),
                    strides,
                    MemoryPool::CpuOnly,
                )
                .unwrap();
                src.copy_to(&via).unwrap();

                let back = host_tensor::create(Datatype::Float32, shape, MemoryPool::CpuOnly).unwrap();
                via.copy_to(&back).unwrap();
                prop_assert_eq!(read_f32(&back), data);
            }
        }
    }
}
