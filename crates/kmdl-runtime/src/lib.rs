//! KMDL runtime
//!
//! Loads versioned model images and executes them on a resource-constrained
//! target: a multi-module loader with pinned and streamed section access, a
//! stack-based virtual machine for the default module kind, host/device
//! tensor buffers with a map/sync lifecycle, and the function-invocation
//! interface. Every fallible call threads a [`Result`]; no panics cross the
//! runtime boundary.
//!
//! A single [`Interpreter`] is not safe for concurrent invocation; give
//! each thread its own. The module-kind, custom-call, and allocator
//! registries are process-wide and meant to be populated before the first
//! interpreter is constructed.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod function;
pub mod interpreter;
pub mod module;
pub mod section;
pub mod stackvm;
pub mod tensor;
pub mod value;

pub use buffer::{
    host_allocator, register_allocator, AllocateOptions, AttachOptions, BufferAllocator,
    BufferRef, BufferSlice, DeviceBuffer, HostBuffer, MapAccess, MappedBuffer, MemoryPool,
    SyncOp, SyncStatus,
};
pub use error::{ErrorKind, Result, RuntimeError};
pub use function::{FunctionBase, RuntimeFunction};
pub use interpreter::{Interpreter, OptionsDict, TensorDesc};
pub use module::{
    create_module, lookup_custom_call, register_custom_call, register_module_kind, CustomCallFn,
    ModuleFactory, ModuleSummary, RuntimeModule,
};
pub use section::{
    FunctionInitContext, ModelBytes, ModelData, ModuleInitContext, ReadSeek, ResolvedSection,
    SectionOrigin,
};
pub use tensor::{device_tensor, host_tensor, RuntimeTensor};
pub use value::{conforms, Value};

/// Runtime crate version for compatibility checking
pub const RUNTIME_VERSION: u32 = 1;
