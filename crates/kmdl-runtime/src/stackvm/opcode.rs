//! Stack VM instruction encoding
//!
//! Instructions are a single opcode byte followed by fixed-shape immediate
//! operands, unaligned and little-endian. Branch instructions pack a 24-bit
//! signed offset, relative to the start of the instruction, into the three
//! bytes after the opcode. Tensor instructions carry rank-4 shape/stride
//! descriptors and per-dimension configuration decoded from immediates.

use crate::error::{Result, RuntimeError};
use kmdl_core::{Datatype, Shape, Strides};
use kmdl_model::{ModelRead, SpanReader};

/// Maximum evaluation stack depth
pub const MAX_STACK: usize = 64;

macro_rules! define_opcodes {
    ($($name:ident = $value:expr),* $(,)?) => {
        /// Opcode byte values
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        #[allow(missing_docs, non_camel_case_types)]
        pub enum Opcode {
            $($name = $value),*
        }

        impl TryFrom<u8> for Opcode {
            type Error = RuntimeError;

            fn try_from(byte: u8) -> Result<Opcode> {
                match byte {
                    $($value => Ok(Opcode::$name),)*
                    _ => Err(RuntimeError::invalid_program(format!(
                        "unknown opcode {:#04x}", byte
                    ))),
                }
            }
        }
    };
}

define_opcodes! {
    Nop = 0x00,
    LdcI4 = 0x01,
    LdcR4 = 0x02,
    LdcR4_0 = 0x03,
    LdcR4_1 = 0x04,
    LdcTensor = 0x05,

    LdindI1 = 0x10,
    LdindI4 = 0x11,
    LdindU1 = 0x12,
    LdindBr2 = 0x13,
    LdindR4 = 0x14,
    StindI1 = 0x18,
    StindI4 = 0x19,
    StindBr2 = 0x1A,
    StindR4 = 0x1B,

    Ldarg = 0x20,
    Ldarg0 = 0x21,
    Ldarg1 = 0x22,
    Ldarg2 = 0x23,
    Ldarg3 = 0x24,
    Dup = 0x28,
    Pop = 0x29,

    Neg = 0x30,
    Not = 0x31,
    Add = 0x32,
    Sub = 0x33,
    Mul = 0x34,
    Div = 0x35,
    DivU = 0x36,
    Rem = 0x37,
    RemU = 0x38,

    Clt = 0x40,
    CltU = 0x41,
    Cle = 0x42,
    CleU = 0x43,
    Ceq = 0x44,
    Cge = 0x45,
    CgeU = 0x46,
    Cgt = 0x47,
    CgtU = 0x48,
    Cne = 0x49,

    ConvI1 = 0x50,
    ConvI4 = 0x51,
    ConvU1 = 0x52,
    ConvU4 = 0x53,
    ConvBr2 = 0x54,
    ConvR4 = 0x55,

    Br = 0x60,
    BrTrue = 0x61,
    BrFalse = 0x62,
    Call = 0x63,
    CusCall = 0x64,
    Ret = 0x65,
    Throw = 0x66,

    BinaryT = 0x70,
    PadT = 0x71,
    SortAscT = 0x72,
    SortDescT = 0x73,
    TransposeT = 0x74,
    SliceT = 0x75,
    ConvertT = 0x76,
    BroadcastT = 0x77,
    QuantizeT = 0x78,
    DequantizeT = 0x79,
    ClampT = 0x7A,
}

/// Elementwise binary operation selector of `binary_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinaryOpKind {
    /// Addition
    Add = 0,
    /// Subtraction
    Sub = 1,
    /// Multiplication
    Mul = 2,
    /// Division
    Div = 3,
    /// Elementwise minimum
    Min = 4,
    /// Elementwise maximum
    Max = 5,
}

impl TryFrom<u8> for BinaryOpKind {
    type Error = RuntimeError;

    fn try_from(byte: u8) -> Result<BinaryOpKind> {
        match byte {
            0 => Ok(BinaryOpKind::Add),
            1 => Ok(BinaryOpKind::Sub),
            2 => Ok(BinaryOpKind::Mul),
            3 => Ok(BinaryOpKind::Div),
            4 => Ok(BinaryOpKind::Min),
            5 => Ok(BinaryOpKind::Max),
            _ => Err(RuntimeError::invalid_program(format!(
                "unknown binary op {}",
                byte
            ))),
        }
    }
}

/// Rank-4 shape/stride descriptor of a tensor operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeShape4 {
    /// Dimensions, leading 1s for lower-rank tensors
    pub dims: [u32; 4],
    /// Element strides matching `dims`
    pub strides: [u32; 4],
}

impl RuntimeShape4 {
    /// Encoded size in bytes
    pub const SIZE: usize = 32;

    /// Descriptor for a row-major tensor, padding the rank to 4 with
    /// leading 1s
    pub fn from_shape(shape: &[usize]) -> Result<RuntimeShape4> {
        if shape.len() > 4 {
            return Err(RuntimeError::not_supported(format!(
                "tensor instruction on rank {} (max 4)",
                shape.len()
            )));
        }
        let mut dims = [1u32; 4];
        let pad = 4 - shape.len();
        for (i, &d) in shape.iter().enumerate() {
            dims[pad + i] = d as u32;
        }
        let mut strides = [0u32; 4];
        let mut acc = 1u32;
        for i in (0..4).rev() {
            strides[i] = acc;
            acc *= dims[i];
        }
        Ok(RuntimeShape4 { dims, strides })
    }

    /// Dimensions as a shape
    pub fn shape(&self) -> Shape {
        self.dims.iter().map(|&d| d as usize).collect()
    }

    /// Strides as element strides
    pub fn element_strides(&self) -> Strides {
        self.strides.iter().map(|&s| s as usize).collect()
    }

    /// Number of elements
    pub fn num_elements(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for d in self.dims {
            out.extend_from_slice(&d.to_le_bytes());
        }
        for s in self.strides {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }

    fn decode(reader: &mut SpanReader<'_>) -> Result<RuntimeShape4> {
        let mut dims = [0u32; 4];
        let mut strides = [0u32; 4];
        for d in &mut dims {
            *d = reader.read_u32().map_err(RuntimeError::from)?;
        }
        for s in &mut strides {
            *s = reader.read_u32().map_err(RuntimeError::from)?;
        }
        Ok(RuntimeShape4 { dims, strides })
    }
}

/// Per-dimension padding of `pad_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadDim {
    /// Elements inserted before the dimension
    pub before: i32,
    /// Elements inserted after the dimension
    pub after: i32,
}

/// Per-dimension slice bounds of `slice_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceDim {
    /// First element index
    pub start: u32,
    /// One past the last element index (for positive strides)
    pub end: u32,
    /// Step; negative steps walk backwards from `start`
    pub stride: i32,
}

/// A decoded tensor instruction
#[derive(Debug, Clone, PartialEq)]
pub enum TensorOp {
    /// Elementwise binary with broadcasting
    Binary {
        /// Operation selector
        op: BinaryOpKind,
        /// Element datatype of both sources and the destination
        dtype: Datatype,
        /// Left operand descriptor
        src1: RuntimeShape4,
        /// Right operand descriptor
        src2: RuntimeShape4,
        /// Destination descriptor
        dest: RuntimeShape4,
    },
    /// Constant-value padding
    Pad {
        /// Element datatype
        dtype: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination descriptor
        dest: RuntimeShape4,
        /// Per-dimension padding
        dims: [PadDim; 4],
        /// Padding value
        value: f32,
    },
    /// Sort along one dimension
    Sort {
        /// Element datatype
        dtype: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination descriptor
        dest: RuntimeShape4,
        /// Dimension to sort along
        dim: u8,
        /// Sort descending instead of ascending
        descending: bool,
    },
    /// Dimension permutation
    Transpose {
        /// Element datatype
        dtype: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination descriptor
        dest: RuntimeShape4,
        /// Permutation: output dim i reads input dim `perm[i]`
        perm: [u8; 4],
    },
    /// Strided slicing
    Slice {
        /// Element datatype
        dtype: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination descriptor
        dest: RuntimeShape4,
        /// Per-dimension bounds
        dims: [SliceDim; 4],
    },
    /// Elementwise datatype conversion
    Convert {
        /// Source element datatype
        src_type: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination element datatype
        dest_type: Datatype,
        /// Destination descriptor
        dest: RuntimeShape4,
    },
    /// Broadcast to a larger shape
    Broadcast {
        /// Element datatype
        dtype: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination descriptor
        dest: RuntimeShape4,
    },
    /// Affine quantization to an integer datatype
    Quantize {
        /// Source element datatype
        src_type: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination element datatype
        dest_type: Datatype,
        /// Destination descriptor
        dest: RuntimeShape4,
        /// Quantization scale
        scale: f32,
        /// Quantization zero point
        zero_point: i32,
    },
    /// Affine dequantization to a float datatype
    Dequantize {
        /// Source element datatype
        src_type: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination element datatype
        dest_type: Datatype,
        /// Destination descriptor
        dest: RuntimeShape4,
        /// Quantization scale
        scale: f32,
        /// Quantization zero point
        zero_point: i32,
    },
    /// Clamp into `[min, max]`
    Clamp {
        /// Element datatype
        dtype: Datatype,
        /// Source descriptor
        src: RuntimeShape4,
        /// Destination descriptor
        dest: RuntimeShape4,
        /// Lower bound
        min: f32,
        /// Upper bound
        max: f32,
    },
}

impl TensorOp {
    /// Number of tensor operands this instruction pops
    pub fn input_count(&self) -> usize {
        match self {
            TensorOp::Binary { .. } => 2,
            _ => 1,
        }
    }

    /// The destination descriptor
    pub fn dest(&self) -> &RuntimeShape4 {
        match self {
            TensorOp::Binary { dest, .. }
            | TensorOp::Pad { dest, .. }
            | TensorOp::Sort { dest, .. }
            | TensorOp::Transpose { dest, .. }
            | TensorOp::Slice { dest, .. }
            | TensorOp::Convert { dest, .. }
            | TensorOp::Broadcast { dest, .. }
            | TensorOp::Quantize { dest, .. }
            | TensorOp::Dequantize { dest, .. }
            | TensorOp::Clamp { dest, .. } => dest,
        }
    }

    /// Element datatype of the destination
    pub fn dest_type(&self) -> Datatype {
        match self {
            TensorOp::Binary { dtype, .. }
            | TensorOp::Pad { dtype, .. }
            | TensorOp::Sort { dtype, .. }
            | TensorOp::Transpose { dtype, .. }
            | TensorOp::Slice { dtype, .. }
            | TensorOp::Broadcast { dtype, .. }
            | TensorOp::Clamp { dtype, .. } => *dtype,
            TensorOp::Convert { dest_type, .. }
            | TensorOp::Quantize { dest_type, .. }
            | TensorOp::Dequantize { dest_type, .. } => *dest_type,
        }
    }
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq)]
#[allow(non_camel_case_types)]
pub enum Inst {
    /// No operation
    Nop,
    /// Push an i32 immediate
    LdcI4(i32),
    /// Push an f32 immediate
    LdcR4(f32),
    /// Push 0.0f32
    LdcR4_0,
    /// Push 1.0f32
    LdcR4_1,
    /// Push a tensor read from the module's constant section
    LdcTensor {
        /// Element datatype
        dtype: Datatype,
        /// Byte offset into the constant section
        offset: u32,
        /// Tensor shape
        shape: Shape,
    },
    /// Load an i8 from the data region, sign-extended
    LdindI1(i32),
    /// Load an i32 from the data region
    LdindI4(i32),
    /// Load a u8 from the data region, zero-extended
    LdindU1(i32),
    /// Load a bf16 from the data region
    LdindBr2(i32),
    /// Load an f32 from the data region
    LdindR4(i32),
    /// Store the popped value's low byte into the data region
    StindI1(i32),
    /// Store the popped value as i32 into the data region
    StindI4(i32),
    /// Store the popped value as bf16 into the data region
    StindBr2(i32),
    /// Store the popped value as f32 into the data region
    StindR4(i32),
    /// Push a copy of argument `n` of the current frame
    Ldarg(u8),
    /// Duplicate the stack top
    Dup,
    /// Discard the stack top
    Pop,
    /// Arithmetic negation
    Neg,
    /// Bitwise complement
    Not,
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Signed division (C semantics)
    Div,
    /// Unsigned division
    DivU,
    /// Signed remainder (C semantics)
    Rem,
    /// Unsigned remainder
    RemU,
    /// Less-than comparison
    Clt,
    /// Unsigned less-than comparison
    CltU,
    /// Less-or-equal comparison
    Cle,
    /// Unsigned less-or-equal comparison
    CleU,
    /// Equality comparison
    Ceq,
    /// Greater-or-equal comparison
    Cge,
    /// Unsigned greater-or-equal comparison
    CgeU,
    /// Greater-than comparison
    Cgt,
    /// Unsigned greater-than comparison
    CgtU,
    /// Inequality comparison
    Cne,
    /// Convert to i8, pushed sign-extended
    ConvI1,
    /// Convert to i32
    ConvI4,
    /// Convert to u8, pushed zero-extended
    ConvU1,
    /// Convert to u32
    ConvU4,
    /// Convert to bf16
    ConvBr2,
    /// Convert to f32
    ConvR4,
    /// Unconditional branch (offset from instruction start)
    Br(i32),
    /// Branch when the popped value is nonzero
    BrTrue(i32),
    /// Branch when the popped value is zero
    BrFalse(i32),
    /// Push a frame and jump (offset from instruction start)
    Call {
        /// Branch offset from the instruction start
        offset: i32,
        /// Arguments the callee takes from the stack
        args: u8,
    },
    /// Invoke a registered custom call
    CusCall {
        /// Index into the module's custom-call table
        index: u16,
        /// Arguments popped from the stack
        args: u8,
    },
    /// Return from the current frame
    Ret,
    /// Terminate with an invalid-program error
    Throw,
    /// A tensor instruction
    Tensor(TensorOp),
}

fn read_i24(reader: &mut SpanReader<'_>) -> Result<i32> {
    let bytes = reader.read_bytes(3).map_err(RuntimeError::from)?;
    let raw = bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16;
    // Sign-extend from 24 bits.
    Ok(((raw << 8) as i32) >> 8)
}

fn write_i24(out: &mut Vec<u8>, value: i32) {
    debug_assert!((-(1 << 23)..(1 << 23)).contains(&value));
    let raw = value as u32;
    out.push(raw as u8);
    out.push((raw >> 8) as u8);
    out.push((raw >> 16) as u8);
}

fn read_dtype(reader: &mut SpanReader<'_>) -> Result<Datatype> {
    let code = reader.read_u8().map_err(RuntimeError::from)?;
    Datatype::from_typecode(code)
        .ok_or_else(|| RuntimeError::invalid_program(format!("unknown typecode {}", code)))
}

impl Inst {
    /// Decode the instruction at the reader's position.
    ///
    /// Branch offsets are relative to the instruction's first byte; the VM
    /// resolves them against the offset it decoded from.
    pub fn decode(reader: &mut SpanReader<'_>) -> Result<Inst> {
        let opcode = Opcode::try_from(reader.read_u8().map_err(RuntimeError::from)?)?;
        let inst = match opcode {
            Opcode::Nop => Inst::Nop,
            Opcode::LdcI4 => Inst::LdcI4(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::LdcR4 => Inst::LdcR4(reader.read_f32().map_err(RuntimeError::from)?),
            Opcode::LdcR4_0 => Inst::LdcR4_0,
            Opcode::LdcR4_1 => Inst::LdcR4_1,
            Opcode::LdcTensor => {
                let dtype = read_dtype(reader)?;
                let rank = reader.read_u8().map_err(RuntimeError::from)? as usize;
                if rank > 4 {
                    return Err(RuntimeError::invalid_program("tensor constant rank > 4"));
                }
                let offset = reader.read_u32().map_err(RuntimeError::from)?;
                let mut shape = Shape::with_capacity(rank);
                for _ in 0..rank {
                    shape.push(reader.read_u32().map_err(RuntimeError::from)? as usize);
                }
                Inst::LdcTensor {
                    dtype,
                    offset,
                    shape,
                }
            }
            Opcode::LdindI1 => Inst::LdindI1(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::LdindI4 => Inst::LdindI4(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::LdindU1 => Inst::LdindU1(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::LdindBr2 => Inst::LdindBr2(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::LdindR4 => Inst::LdindR4(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::StindI1 => Inst::StindI1(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::StindI4 => Inst::StindI4(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::StindBr2 => Inst::StindBr2(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::StindR4 => Inst::StindR4(reader.read_i32().map_err(RuntimeError::from)?),
            Opcode::Ldarg => Inst::Ldarg(reader.read_u8().map_err(RuntimeError::from)?),
            Opcode::Ldarg0 => Inst::Ldarg(0),
            Opcode::Ldarg1 => Inst::Ldarg(1),
            Opcode::Ldarg2 => Inst::Ldarg(2),
            Opcode::Ldarg3 => Inst::Ldarg(3),
            Opcode::Dup => Inst::Dup,
            Opcode::Pop => Inst::Pop,
            Opcode::Neg => Inst::Neg,
            Opcode::Not => Inst::Not,
            Opcode::Add => Inst::Add,
            Opcode::Sub => Inst::Sub,
            Opcode::Mul => Inst::Mul,
            Opcode::Div => Inst::Div,
            Opcode::DivU => Inst::DivU,
            Opcode::Rem => Inst::Rem,
            Opcode::RemU => Inst::RemU,
            Opcode::Clt => Inst::Clt,
            Opcode::CltU => Inst::CltU,
            Opcode::Cle => Inst::Cle,
            Opcode::CleU => Inst::CleU,
            Opcode::Ceq => Inst::Ceq,
            Opcode::Cge => Inst::Cge,
            Opcode::CgeU => Inst::CgeU,
            Opcode::Cgt => Inst::Cgt,
            Opcode::CgtU => Inst::CgtU,
            Opcode::Cne => Inst::Cne,
            Opcode::ConvI1 => Inst::ConvI1,
            Opcode::ConvI4 => Inst::ConvI4,
            Opcode::ConvU1 => Inst::ConvU1,
            Opcode::ConvU4 => Inst::ConvU4,
            Opcode::ConvBr2 => Inst::ConvBr2,
            Opcode::ConvR4 => Inst::ConvR4,
            Opcode::Br => Inst::Br(read_i24(reader)?),
            Opcode::BrTrue => Inst::BrTrue(read_i24(reader)?),
            Opcode::BrFalse => Inst::BrFalse(read_i24(reader)?),
            Opcode::Call => {
                let offset = read_i24(reader)?;
                let args = reader.read_u8().map_err(RuntimeError::from)?;
                Inst::Call { offset, args }
            }
            Opcode::CusCall => {
                let index = reader.read_u16().map_err(RuntimeError::from)?;
                let args = reader.read_u8().map_err(RuntimeError::from)?;
                Inst::CusCall { index, args }
            }
            Opcode::Ret => Inst::Ret,
            Opcode::Throw => Inst::Throw,
            Opcode::BinaryT => {
                let op = BinaryOpKind::try_from(reader.read_u8().map_err(RuntimeError::from)?)?;
                let dtype = read_dtype(reader)?;
                Inst::Tensor(TensorOp::Binary {
                    op,
                    dtype,
                    src1: RuntimeShape4::decode(reader)?,
                    src2: RuntimeShape4::decode(reader)?,
                    dest: RuntimeShape4::decode(reader)?,
                })
            }
            Opcode::PadT => {
                let dtype = read_dtype(reader)?;
                let src = RuntimeShape4::decode(reader)?;
                let dest = RuntimeShape4::decode(reader)?;
                let mut dims = [PadDim::default(); 4];
                for dim in &mut dims {
                    dim.before = reader.read_i32().map_err(RuntimeError::from)?;
                    dim.after = reader.read_i32().map_err(RuntimeError::from)?;
                }
                let value = reader.read_f32().map_err(RuntimeError::from)?;
                Inst::Tensor(TensorOp::Pad {
                    dtype,
                    src,
                    dest,
                    dims,
                    value,
                })
            }
            Opcode::SortAscT | Opcode::SortDescT => {
                let dtype = read_dtype(reader)?;
                let src = RuntimeShape4::decode(reader)?;
                let dest = RuntimeShape4::decode(reader)?;
                let dim = reader.read_u8().map_err(RuntimeError::from)?;
                Inst::Tensor(TensorOp::Sort {
                    dtype,
                    src,
                    dest,
                    dim,
                    descending: opcode == Opcode::SortDescT,
                })
            }
            Opcode::TransposeT => {
                let dtype = read_dtype(reader)?;
                let src = RuntimeShape4::decode(reader)?;
                let dest = RuntimeShape4::decode(reader)?;
                let perm = reader.read_array::<4>().map_err(RuntimeError::from)?;
                Inst::Tensor(TensorOp::Transpose {
                    dtype,
                    src,
                    dest,
                    perm,
                })
            }
            Opcode::SliceT => {
                let dtype = read_dtype(reader)?;
                let src = RuntimeShape4::decode(reader)?;
                let dest = RuntimeShape4::decode(reader)?;
                let mut dims = [SliceDim {
                    start: 0,
                    end: 0,
                    stride: 1,
                }; 4];
                for dim in &mut dims {
                    dim.start = reader.read_u32().map_err(RuntimeError::from)?;
                    dim.end = reader.read_u32().map_err(RuntimeError::from)?;
                    dim.stride = reader.read_i32().map_err(RuntimeError::from)?;
                }
                Inst::Tensor(TensorOp::Slice {
                    dtype,
                    src,
                    dest,
                    dims,
                })
            }
            Opcode::ConvertT => {
                let src_type = read_dtype(reader)?;
                let src = RuntimeShape4::decode(reader)?;
                let dest_type = read_dtype(reader)?;
                let dest = RuntimeShape4::decode(reader)?;
                Inst::Tensor(TensorOp::Convert {
                    src_type,
                    src,
                    dest_type,
                    dest,
                })
            }
            Opcode::BroadcastT => {
                let dtype = read_dtype(reader)?;
                Inst::Tensor(TensorOp::Broadcast {
                    dtype,
                    src: RuntimeShape4::decode(reader)?,
                    dest: RuntimeShape4::decode(reader)?,
                })
            }
            Opcode::QuantizeT | Opcode::DequantizeT => {
                let src_type = read_dtype(reader)?;
                let src = RuntimeShape4::decode(reader)?;
                let dest_type = read_dtype(reader)?;
                let dest = RuntimeShape4::decode(reader)?;
                let scale = reader.read_f32().map_err(RuntimeError::from)?;
                let zero_point = reader.read_i32().map_err(RuntimeError::from)?;
                if opcode == Opcode::QuantizeT {
                    Inst::Tensor(TensorOp::Quantize {
                        src_type,
                        src,
                        dest_type,
                        dest,
                        scale,
                        zero_point,
                    })
                } else {
                    Inst::Tensor(TensorOp::Dequantize {
                        src_type,
                        src,
                        dest_type,
                        dest,
                        scale,
                        zero_point,
                    })
                }
            }
            Opcode::ClampT => {
                let dtype = read_dtype(reader)?;
                let src = RuntimeShape4::decode(reader)?;
                let dest = RuntimeShape4::decode(reader)?;
                let min = reader.read_f32().map_err(RuntimeError::from)?;
                let max = reader.read_f32().map_err(RuntimeError::from)?;
                Inst::Tensor(TensorOp::Clamp {
                    dtype,
                    src,
                    dest,
                    min,
                    max,
                })
            }
        };
        Ok(inst)
    }

    /// Encode this instruction, appending to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Inst::Nop => out.push(Opcode::Nop as u8),
            Inst::LdcI4(v) => {
                out.push(Opcode::LdcI4 as u8);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Inst::LdcR4(v) => {
                out.push(Opcode::LdcR4 as u8);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Inst::LdcR4_0 => out.push(Opcode::LdcR4_0 as u8),
            Inst::LdcR4_1 => out.push(Opcode::LdcR4_1 as u8),
            Inst::LdcTensor {
                dtype,
                offset,
                shape,
            } => {
                out.push(Opcode::LdcTensor as u8);
                out.push(dtype.typecode());
                out.push(shape.len() as u8);
                out.extend_from_slice(&offset.to_le_bytes());
                for &d in shape.iter() {
                    out.extend_from_slice(&(d as u32).to_le_bytes());
                }
            }
            Inst::LdindI1(a) => encode_i32_imm(out, Opcode::LdindI1, *a),
            Inst::LdindI4(a) => encode_i32_imm(out, Opcode::LdindI4, *a),
            Inst::LdindU1(a) => encode_i32_imm(out, Opcode::LdindU1, *a),
            Inst::LdindBr2(a) => encode_i32_imm(out, Opcode::LdindBr2, *a),
            Inst::LdindR4(a) => encode_i32_imm(out, Opcode::LdindR4, *a),
            Inst::StindI1(a) => encode_i32_imm(out, Opcode::StindI1, *a),
            Inst::StindI4(a) => encode_i32_imm(out, Opcode::StindI4, *a),
            Inst::StindBr2(a) => encode_i32_imm(out, Opcode::StindBr2, *a),
            Inst::StindR4(a) => encode_i32_imm(out, Opcode::StindR4, *a),
            Inst::Ldarg(index) => match index {
                0 => out.push(Opcode::Ldarg0 as u8),
                1 => out.push(Opcode::Ldarg1 as u8),
                2 => out.push(Opcode::Ldarg2 as u8),
                3 => out.push(Opcode::Ldarg3 as u8),
                _ => {
                    out.push(Opcode::Ldarg as u8);
                    out.push(*index);
                }
            },
            Inst::Dup => out.push(Opcode::Dup as u8),
            Inst::Pop => out.push(Opcode::Pop as u8),
            Inst::Neg => out.push(Opcode::Neg as u8),
            Inst::Not => out.push(Opcode::Not as u8),
            Inst::Add => out.push(Opcode::Add as u8),
            Inst::Sub => out.push(Opcode::Sub as u8),
            Inst::Mul => out.push(Opcode::Mul as u8),
            Inst::Div => out.push(Opcode::Div as u8),
            Inst::DivU => out.push(Opcode::DivU as u8),
            Inst::Rem => out.push(Opcode::Rem as u8),
            Inst::RemU => out.push(Opcode::RemU as u8),
            Inst::Clt => out.push(Opcode::Clt as u8),
            Inst::CltU => out.push(Opcode::CltU as u8),
            Inst::Cle => out.push(Opcode::Cle as u8),
            Inst::CleU => out.push(Opcode::CleU as u8),
            Inst::Ceq => out.push(Opcode::Ceq as u8),
            Inst::Cge => out.push(Opcode::Cge as u8),
            Inst::CgeU => out.push(Opcode::CgeU as u8),
            Inst::Cgt => out.push(Opcode::Cgt as u8),
            Inst::CgtU => out.push(Opcode::CgtU as u8),
            Inst::Cne => out.push(Opcode::Cne as u8),
            Inst::ConvI1 => out.push(Opcode::ConvI1 as u8),
            Inst::ConvI4 => out.push(Opcode::ConvI4 as u8),
            Inst::ConvU1 => out.push(Opcode::ConvU1 as u8),
            Inst::ConvU4 => out.push(Opcode::ConvU4 as u8),
            Inst::ConvBr2 => out.push(Opcode::ConvBr2 as u8),
            Inst::ConvR4 => out.push(Opcode::ConvR4 as u8),
            Inst::Br(offset) => {
                out.push(Opcode::Br as u8);
                write_i24(out, *offset);
            }
            Inst::BrTrue(offset) => {
                out.push(Opcode::BrTrue as u8);
                write_i24(out, *offset);
            }
            Inst::BrFalse(offset) => {
                out.push(Opcode::BrFalse as u8);
                write_i24(out, *offset);
            }
            Inst::Call { offset, args } => {
                out.push(Opcode::Call as u8);
                write_i24(out, *offset);
                out.push(*args);
            }
            Inst::CusCall { index, args } => {
                out.push(Opcode::CusCall as u8);
                out.extend_from_slice(&index.to_le_bytes());
                out.push(*args);
            }
            Inst::Ret => out.push(Opcode::Ret as u8),
            Inst::Throw => out.push(Opcode::Throw as u8),
            Inst::Tensor(op) => encode_tensor_op(out, op),
        }
    }
}

fn encode_i32_imm(out: &mut Vec<u8>, opcode: Opcode, value: i32) {
    out.push(opcode as u8);
    out.extend_from_slice(&value.to_le_bytes());
}

fn encode_tensor_op(out: &mut Vec<u8>, op: &TensorOp) {
    match op {
        TensorOp::Binary {
            op,
            dtype,
            src1,
            src2,
            dest,
        } => {
            out.push(Opcode::BinaryT as u8);
            out.push(*op as u8);
            out.push(dtype.typecode());
            src1.encode(out);
            src2.encode(out);
            dest.encode(out);
        }
        TensorOp::Pad {
            dtype,
            src,
            dest,
            dims,
            value,
        } => {
            out.push(Opcode::PadT as u8);
            out.push(dtype.typecode());
            src.encode(out);
            dest.encode(out);
            for dim in dims {
                out.extend_from_slice(&dim.before.to_le_bytes());
                out.extend_from_slice(&dim.after.to_le_bytes());
            }
            out.extend_from_slice(&value.to_le_bytes());
        }
        TensorOp::Sort {
            dtype,
            src,
            dest,
            dim,
            descending,
        } => {
            out.push(if *descending {
                Opcode::SortDescT as u8
            } else {
                Opcode::SortAscT as u8
            });
            out.push(dtype.typecode());
            src.encode(out);
            dest.encode(out);
            out.push(*dim);
        }
        TensorOp::Transpose {
            dtype,
            src,
            dest,
            perm,
        } => {
            out.push(Opcode::TransposeT as u8);
            out.push(dtype.typecode());
            src.encode(out);
            dest.encode(out);
            out.extend_from_slice(perm);
        }
        TensorOp::Slice {
            dtype,
            src,
            dest,
            dims,
        } => {
            out.push(Opcode::SliceT as u8);
            out.push(dtype.typecode());
            src.encode(out);
            dest.encode(out);
            for dim in dims {
                out.extend_from_slice(&dim.start.to_le_bytes());
                out.extend_from_slice(&dim.end.to_le_bytes());
                out.extend_from_slice(&dim.stride.to_le_bytes());
            }
        }
        TensorOp::Convert {
            src_type,
            src,
            dest_type,
            dest,
        } => {
            out.push(Opcode::ConvertT as u8);
            out.push(src_type.typecode());
            src.encode(out);
            out.push(dest_type.typecode());
            dest.encode(out);
        }
        TensorOp::Broadcast { dtype, src, dest } => {
            out.push(Opcode::BroadcastT as u8);
            out.push(dtype.typecode());
            src.encode(out);
            dest.encode(out);
        }
        TensorOp::Quantize {
            src_type,
            src,
            dest_type,
            dest,
            scale,
            zero_point,
        }
        | TensorOp::Dequantize {
            src_type,
            src,
            dest_type,
            dest,
            scale,
            zero_point,
        } => {
            out.push(if matches!(op, TensorOp::Quantize { .. }) {
                Opcode::QuantizeT as u8
            } else {
                Opcode::DequantizeT as u8
            });
            out.push(src_type.typecode());
            src.encode(out);
            out.push(dest_type.typecode());
            dest.encode(out);
            out.extend_from_slice(&scale.to_le_bytes());
            out.extend_from_slice(&zero_point.to_le_bytes());
        }
        TensorOp::Clamp {
            dtype,
            src,
            dest,
            min,
            max,
        } => {
            out.push(Opcode::ClampT as u8);
            out.push(dtype.typecode());
            src.encode(out);
            dest.encode(out);
            out.extend_from_slice(&min.to_le_bytes());
            out.extend_from_slice(&max.to_le_bytes());
        }
    }
}

/// Assembles instruction sequences into function text
#[derive(Default)]
pub struct Emitter {
    text: Vec<u8>,
}

/// A reserved branch slot awaiting its target
#[derive(Debug, Clone, Copy)]
pub struct BranchFixup {
    at: usize,
}

impl Emitter {
    /// Create an empty emitter
    pub fn new() -> Self {
        Self::default()
    }

    /// Current text offset
    pub fn position(&self) -> usize {
        self.text.len()
    }

    /// Append an instruction
    pub fn emit(&mut self, inst: &Inst) -> &mut Self {
        inst.encode(&mut self.text);
        self
    }

    /// Emit a branch with a placeholder offset, to be patched later
    pub fn emit_branch_placeholder(&mut self, opcode: Opcode) -> BranchFixup {
        debug_assert!(matches!(
            opcode,
            Opcode::Br | Opcode::BrTrue | Opcode::BrFalse
        ));
        let at = self.text.len();
        self.text.push(opcode as u8);
        write_i24(&mut self.text, 0);
        BranchFixup { at }
    }

    /// Patch a reserved branch to target the current position
    pub fn patch_branch(&mut self, fixup: BranchFixup) {
        let offset = self.text.len() as i32 - fixup.at as i32;
        let mut encoded = Vec::with_capacity(3);
        write_i24(&mut encoded, offset);
        self.text[fixup.at + 1..fixup.at + 4].copy_from_slice(&encoded);
    }

    /// Finish and take the text
    pub fn finish(self) -> Vec<u8> {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(inst: Inst) {
        let mut bytes = Vec::new();
        inst.encode(&mut bytes);
        let mut reader = SpanReader::new(&bytes);
        let decoded = Inst::decode(&mut reader).unwrap();
        assert_eq!(decoded, inst);
        assert!(reader.is_empty(), "trailing bytes after {:?}", decoded);
    }

    #[test]
    fn test_scalar_instruction_roundtrip() {
        roundtrip(Inst::Nop);
        roundtrip(Inst::LdcI4(-123456));
        roundtrip(Inst::LdcR4(3.25));
        roundtrip(Inst::Ldarg(7));
        roundtrip(Inst::LdindI4(16));
        roundtrip(Inst::StindR4(-4));
        roundtrip(Inst::Br(-5));
        roundtrip(Inst::BrTrue(1 << 20));
        roundtrip(Inst::Call { offset: -300, args: 2 });
        roundtrip(Inst::CusCall { index: 3, args: 1 });
    }

    #[test]
    fn test_short_ldarg_forms() {
        let mut bytes = Vec::new();
        Inst::Ldarg(2).encode(&mut bytes);
        assert_eq!(bytes, vec![Opcode::Ldarg2 as u8]);

        let mut bytes = Vec::new();
        Inst::Ldarg(9).encode(&mut bytes);
        assert_eq!(bytes, vec![Opcode::Ldarg as u8, 9]);
    }

    #[test]
    fn test_i24_sign_extension() {
        let mut bytes = Vec::new();
        write_i24(&mut bytes, -2);
        let mut reader = SpanReader::new(&bytes);
        assert_eq!(read_i24(&mut reader).unwrap(), -2);
    }

    #[test]
    fn test_tensor_op_roundtrip() {
        let shape = RuntimeShape4::from_shape(&[2, 3]).unwrap();
        assert_eq!(shape.dims, [1, 1, 2, 3]);
        assert_eq!(shape.strides, [6, 6, 3, 1]);

        roundtrip(Inst::Tensor(TensorOp::Binary {
            op: BinaryOpKind::Sub,
            dtype: Datatype::Float32,
            src1: RuntimeShape4::from_shape(&[2, 1, 3]).unwrap(),
            src2: RuntimeShape4::from_shape(&[1, 2, 3]).unwrap(),
            dest: RuntimeShape4::from_shape(&[2, 2, 3]).unwrap(),
        }));
        roundtrip(Inst::Tensor(TensorOp::Slice {
            dtype: Datatype::Int8,
            src: RuntimeShape4::from_shape(&[8]).unwrap(),
            dest: RuntimeShape4::from_shape(&[4]).unwrap(),
            dims: [
                SliceDim { start: 0, end: 1, stride: 1 },
                SliceDim { start: 0, end: 1, stride: 1 },
                SliceDim { start: 0, end: 1, stride: 1 },
                SliceDim { start: 0, end: 8, stride: 2 },
            ],
        }));
        roundtrip(Inst::Tensor(TensorOp::Quantize {
            src_type: Datatype::Float32,
            src: RuntimeShape4::from_shape(&[4]).unwrap(),
            dest_type: Datatype::UInt8,
            dest: RuntimeShape4::from_shape(&[4]).unwrap(),
            scale: 0.5,
            zero_point: 128,
        }));
    }

    #[test]
    fn test_ldc_tensor_roundtrip() {
        roundtrip(Inst::LdcTensor {
            dtype: Datatype::Float32,
            offset: 64,
            shape: Shape::from_slice(&[2, 3]),
        });
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let bytes = [0xEE];
        let mut reader = SpanReader::new(&bytes);
        let err = Inst::decode(&mut reader).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidProgram);
    }

    #[test]
    fn test_emitter_branch_patching() {
        let mut emitter = Emitter::new();
        emitter.emit(&Inst::LdcI4(1));
        let fixup = emitter.emit_branch_placeholder(Opcode::BrFalse);
        emitter.emit(&Inst::LdcI4(100)).emit(&Inst::Ret);
        emitter.patch_branch(fixup);
        emitter.emit(&Inst::LdcI4(200)).emit(&Inst::Ret);
        let text = emitter.finish();

        // Decode the branch and check its target lands on the second ldc.
        let mut reader = SpanReader::new(&text);
        reader.seek(5).unwrap();
        let inst = Inst::decode(&mut reader).unwrap();
        match inst {
            Inst::BrFalse(offset) => assert_eq!(5 + offset as usize, 5 + 4 + 6),
            other => panic!("expected br_false, got {:?}", other),
        }
    }
}
