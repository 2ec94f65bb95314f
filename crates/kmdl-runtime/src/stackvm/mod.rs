//! The default module kind: a stack-based virtual machine
//!
//! Function text is a byte stream of single-opcode instructions with
//! unaligned little-endian immediates. The VM evaluates over a fixed-depth
//! stack of tagged cells; tensor instructions dispatch into the reference
//! kernels with descriptors decoded from immediates.

pub mod arith;
pub mod kernels;
pub mod module;
pub mod opcode;
pub(crate) mod vm;

pub use arith::{carry_shift, clamp, mul_and_carry_shift};
pub use module::{
    create_stackvm_module, encode_name_table, CONSTS_SECTION, CUSTOM_SECTION, DATA_SECTION,
    FUNCNAME_SECTION, STACKVM_MODULE_KIND,
};
pub use opcode::{
    BinaryOpKind, BranchFixup, Emitter, Inst, Opcode, PadDim, RuntimeShape4, SliceDim, TensorOp,
    MAX_STACK,
};
pub use vm::StackCell;
