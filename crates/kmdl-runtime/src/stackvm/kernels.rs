//! Reference kernels for the tensor instructions
//!
//! These stand in for the external kernel library: plain byte-level loops
//! driven by the rank-4 descriptors the VM decodes from immediates. The VM
//! maps operand tensors and hands kernels raw little-endian element
//! regions; a kernel never touches buffers or the stack.

use super::arith::clamp;
use super::opcode::{BinaryOpKind, RuntimeShape4, TensorOp};
use crate::error::{Result, RuntimeError};
use half::{bf16, f16};
use kmdl_core::Datatype;

/// Kernel entry signature: operand regions in, destination region out
pub type Kernel = fn(&TensorOp, &[&[u8]], &mut [u8]) -> Result<()>;

/// Look up the kernel for a decoded tensor instruction
pub fn kernel_for(op: &TensorOp) -> Kernel {
    match op {
        TensorOp::Binary { .. } => binary,
        TensorOp::Pad { .. } => pad,
        TensorOp::Sort { .. } => sort,
        TensorOp::Transpose { .. } => transpose,
        TensorOp::Slice { .. } => slice,
        TensorOp::Convert { .. } => convert,
        TensorOp::Broadcast { .. } => broadcast,
        TensorOp::Quantize { .. } => quantize,
        TensorOp::Dequantize { .. } => dequantize,
        TensorOp::Clamp { .. } => clamp_kernel,
    }
}

// One element value, wide enough for every scalar kind.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    F(f64),
    I(i64),
    U(u64),
}

impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::F(v) => v,
            Num::I(v) => v as f64,
            Num::U(v) => v as f64,
        }
    }
}

fn read_num(bytes: &[u8], dtype: Datatype, index: usize) -> Result<Num> {
    let size = dtype.size_bytes();
    let at = index * size;
    let span = bytes
        .get(at..at + size)
        .ok_or_else(|| RuntimeError::invalid_program("kernel read out of range"))?;
    Ok(match dtype {
        Datatype::Int8 => Num::I(span[0] as i8 as i64),
        Datatype::Int16 => Num::I(i16::from_le_bytes(span.try_into().unwrap()) as i64),
        Datatype::Int32 => Num::I(i32::from_le_bytes(span.try_into().unwrap()) as i64),
        Datatype::Int64 => Num::I(i64::from_le_bytes(span.try_into().unwrap())),
        Datatype::UInt8 | Datatype::Bool => Num::U(span[0] as u64),
        Datatype::UInt16 => Num::U(u16::from_le_bytes(span.try_into().unwrap()) as u64),
        Datatype::UInt32 => Num::U(u32::from_le_bytes(span.try_into().unwrap()) as u64),
        Datatype::UInt64 => Num::U(u64::from_le_bytes(span.try_into().unwrap())),
        Datatype::Float16 => Num::F(f16::from_le_bytes(span.try_into().unwrap()).to_f64()),
        Datatype::BFloat16 => Num::F(bf16::from_le_bytes(span.try_into().unwrap()).to_f64()),
        Datatype::Float32 => Num::F(f32::from_le_bytes(span.try_into().unwrap()) as f64),
        Datatype::Float64 => Num::F(f64::from_le_bytes(span.try_into().unwrap())),
    })
}

fn write_num(bytes: &mut [u8], dtype: Datatype, index: usize, value: Num) -> Result<()> {
    let size = dtype.size_bytes();
    let at = index * size;
    let span = bytes
        .get_mut(at..at + size)
        .ok_or_else(|| RuntimeError::invalid_program("kernel write out of range"))?;
    match dtype {
        Datatype::Int8 => span[0] = to_i64(value) as i8 as u8,
        Datatype::Int16 => span.copy_from_slice(&(to_i64(value) as i16).to_le_bytes()),
        Datatype::Int32 => span.copy_from_slice(&(to_i64(value) as i32).to_le_bytes()),
        Datatype::Int64 => span.copy_from_slice(&to_i64(value).to_le_bytes()),
        Datatype::UInt8 => span[0] = to_u64(value) as u8,
        Datatype::Bool => span[0] = (to_u64(value) != 0) as u8,
        Datatype::UInt16 => span.copy_from_slice(&(to_u64(value) as u16).to_le_bytes()),
        Datatype::UInt32 => span.copy_from_slice(&(to_u64(value) as u32).to_le_bytes()),
        Datatype::UInt64 => span.copy_from_slice(&to_u64(value).to_le_bytes()),
        Datatype::Float16 => {
            span.copy_from_slice(&f16::from_f64(value.to_f64()).to_le_bytes())
        }
        Datatype::BFloat16 => {
            span.copy_from_slice(&bf16::from_f64(value.to_f64()).to_le_bytes())
        }
        Datatype::Float32 => span.copy_from_slice(&(value.to_f64() as f32).to_le_bytes()),
        Datatype::Float64 => span.copy_from_slice(&value.to_f64().to_le_bytes()),
    }
    Ok(())
}

fn to_i64(value: Num) -> i64 {
    match value {
        Num::F(v) => v as i64,
        Num::I(v) => v,
        Num::U(v) => v as i64,
    }
}

fn to_u64(value: Num) -> u64 {
    match value {
        Num::F(v) => v as u64,
        Num::I(v) => v as u64,
        Num::U(v) => v,
    }
}

fn offset(index: [usize; 4], strides: &[u32; 4]) -> usize {
    index
        .iter()
        .zip(strides)
        .map(|(&i, &s)| i * s as usize)
        .sum()
}

// Source index under broadcasting: size-1 dimensions pin to 0.
fn broadcast_index(index: [usize; 4], src: &RuntimeShape4) -> [usize; 4] {
    let mut out = index;
    for (i, dim) in src.dims.iter().enumerate() {
        if *dim == 1 {
            out[i] = 0;
        }
    }
    out
}

fn for_each_index(
    dims: [u32; 4],
    mut body: impl FnMut([usize; 4]) -> Result<()>,
) -> Result<()> {
    for n in 0..dims[0] as usize {
        for c in 0..dims[1] as usize {
            for h in 0..dims[2] as usize {
                for w in 0..dims[3] as usize {
                    body([n, c, h, w])?;
                }
            }
        }
    }
    Ok(())
}

fn apply_binary(op: BinaryOpKind, dtype: Datatype, lhs: Num, rhs: Num) -> Result<Num> {
    if dtype.is_float() {
        let (a, b) = (lhs.to_f64(), rhs.to_f64());
        let v = match op {
            BinaryOpKind::Add => a + b,
            BinaryOpKind::Sub => a - b,
            BinaryOpKind::Mul => a * b,
            BinaryOpKind::Div => a / b,
            BinaryOpKind::Min => a.min(b),
            BinaryOpKind::Max => a.max(b),
        };
        Ok(Num::F(v))
    } else if dtype.is_signed_int() {
        let (a, b) = (to_i64(lhs), to_i64(rhs));
        let v = match op {
            BinaryOpKind::Add => a.wrapping_add(b),
            BinaryOpKind::Sub => a.wrapping_sub(b),
            BinaryOpKind::Mul => a.wrapping_mul(b),
            BinaryOpKind::Div => {
                if b == 0 {
                    return Err(RuntimeError::invalid_program("integer division by zero"));
                }
                a.wrapping_div(b)
            }
            BinaryOpKind::Min => a.min(b),
            BinaryOpKind::Max => a.max(b),
        };
        Ok(Num::I(v))
    } else {
        let (a, b) = (to_u64(lhs), to_u64(rhs));
        let v = match op {
            BinaryOpKind::Add => a.wrapping_add(b),
            BinaryOpKind::Sub => a.wrapping_sub(b),
            BinaryOpKind::Mul => a.wrapping_mul(b),
            BinaryOpKind::Div => {
                if b == 0 {
                    return Err(RuntimeError::invalid_program("integer division by zero"));
                }
                a / b
            }
            BinaryOpKind::Min => a.min(b),
            BinaryOpKind::Max => a.max(b),
        };
        Ok(Num::U(v))
    }
}

fn binary(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Binary { op: kind, dtype, src1, src2, dest } = op else {
        unreachable!()
    };
    for_each_index(dest.dims, |index| {
        let a = read_num(inputs[0], *dtype, offset(broadcast_index(index, src1), &src1.strides))?;
        let b = read_num(inputs[1], *dtype, offset(broadcast_index(index, src2), &src2.strides))?;
        let v = apply_binary(*kind, *dtype, a, b)?;
        write_num(output, *dtype, offset(index, &dest.strides), v)
    })
}

fn pad(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Pad { dtype, src, dest, dims, value } = op else {
        unreachable!()
    };
    for_each_index(dest.dims, |index| {
        let mut src_index = [0usize; 4];
        let mut inside = true;
        for i in 0..4 {
            let shifted = index[i] as i64 - dims[i].before as i64;
            if shifted < 0 || shifted >= src.dims[i] as i64 {
                inside = false;
                break;
            }
            src_index[i] = shifted as usize;
        }
        let v = if inside {
            read_num(inputs[0], *dtype, offset(src_index, &src.strides))?
        } else {
            Num::F(*value as f64)
        };
        write_num(output, *dtype, offset(index, &dest.strides), v)
    })
}

fn sort(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Sort { dtype, src, dest, dim, descending } = op else {
        unreachable!()
    };
    let axis = *dim as usize;
    if axis >= 4 {
        return Err(RuntimeError::invalid_program("sort dimension out of range"));
    }

    let mut outer = src.dims;
    outer[axis] = 1;
    let lane = src.dims[axis] as usize;

    for_each_index(outer, |base| {
        let mut values = Vec::with_capacity(lane);
        for i in 0..lane {
            let mut index = base;
            index[axis] = i;
            values.push(read_num(inputs[0], *dtype, offset(index, &src.strides))?);
        }
        values.sort_by(|a, b| {
            a.to_f64()
                .partial_cmp(&b.to_f64())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if *descending {
            values.reverse();
        }
        for (i, v) in values.into_iter().enumerate() {
            let mut index = base;
            index[axis] = i;
            write_num(output, *dtype, offset(index, &dest.strides), v)?;
        }
        Ok(())
    })
}

fn transpose(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Transpose { dtype, src, dest, perm } = op else {
        unreachable!()
    };
    let mut seen = [false; 4];
    for &p in perm {
        if p as usize >= 4 || seen[p as usize] {
            return Err(RuntimeError::invalid_program("invalid permutation"));
        }
        seen[p as usize] = true;
    }
    for_each_index(dest.dims, |index| {
        let mut src_index = [0usize; 4];
        for i in 0..4 {
            src_index[perm[i] as usize] = index[i];
        }
        let v = read_num(inputs[0], *dtype, offset(src_index, &src.strides))?;
        write_num(output, *dtype, offset(index, &dest.strides), v)
    })
}

fn slice(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Slice { dtype, src, dest, dims } = op else {
        unreachable!()
    };
    for_each_index(dest.dims, |index| {
        let mut src_index = [0usize; 4];
        for i in 0..4 {
            let at = dims[i].start as i64 + index[i] as i64 * dims[i].stride as i64;
            if at < 0 || at >= src.dims[i] as i64 {
                return Err(RuntimeError::invalid_program("slice index out of range"));
            }
            src_index[i] = at as usize;
        }
        let v = read_num(inputs[0], *dtype, offset(src_index, &src.strides))?;
        write_num(output, *dtype, offset(index, &dest.strides), v)
    })
}

fn convert(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Convert { src_type, src, dest_type, dest } = op else {
        unreachable!()
    };
    for_each_index(dest.dims, |index| {
        let v = read_num(inputs[0], *src_type, offset(broadcast_index(index, src), &src.strides))?;
        write_num(output, *dest_type, offset(index, &dest.strides), v)
    })
}

fn broadcast(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Broadcast { dtype, src, dest } = op else {
        unreachable!()
    };
    for_each_index(dest.dims, |index| {
        let v = read_num(inputs[0], *dtype, offset(broadcast_index(index, src), &src.strides))?;
        write_num(output, *dtype, offset(index, &dest.strides), v)
    })
}

fn integer_range(dtype: Datatype) -> (i64, i64) {
    match dtype {
        Datatype::Int8 => (i8::MIN as i64, i8::MAX as i64),
        Datatype::Int16 => (i16::MIN as i64, i16::MAX as i64),
        Datatype::Int32 => (i32::MIN as i64, i32::MAX as i64),
        Datatype::Int64 => (i64::MIN, i64::MAX),
        Datatype::UInt8 | Datatype::Bool => (0, u8::MAX as i64),
        Datatype::UInt16 => (0, u16::MAX as i64),
        Datatype::UInt32 => (0, u32::MAX as i64),
        Datatype::UInt64 => (0, i64::MAX),
        _ => (i64::MIN, i64::MAX),
    }
}

fn quantize(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Quantize { src_type, src, dest_type, dest, scale, zero_point } = op else {
        unreachable!()
    };
    let (lo, hi) = integer_range(*dest_type);
    for_each_index(dest.dims, |index| {
        let x = read_num(inputs[0], *src_type, offset(broadcast_index(index, src), &src.strides))?
            .to_f64();
        let q = (x / *scale as f64).round() as i64 + *zero_point as i64;
        write_num(output, *dest_type, offset(index, &dest.strides), Num::I(clamp(q, lo, hi)))
    })
}

fn dequantize(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Dequantize { src_type, src, dest_type, dest, scale, zero_point } = op else {
        unreachable!()
    };
    for_each_index(dest.dims, |index| {
        let q = read_num(inputs[0], *src_type, offset(broadcast_index(index, src), &src.strides))?;
        let x = (to_i64(q) - *zero_point as i64) as f64 * *scale as f64;
        write_num(output, *dest_type, offset(index, &dest.strides), Num::F(x))
    })
}

fn clamp_kernel(op: &TensorOp, inputs: &[&[u8]], output: &mut [u8]) -> Result<()> {
    let TensorOp::Clamp { dtype, src, dest, min, max } = op else {
        unreachable!()
    };
    for_each_index(dest.dims, |index| {
        let x = read_num(inputs[0], *dtype, offset(broadcast_index(index, src), &src.strides))?
            .to_f64();
        let v = clamp(x, *min as f64, *max as f64);
        write_num(output, *dtype, offset(index, &dest.strides), Num::F(v))
    })
}

#[cfg(test)]
mod tests {
    use super::super::opcode::{PadDim, SliceDim};
    use super::*;

    fn f32s(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn as_f32s(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_binary_broadcast_sub() {
        let op = TensorOp::Binary {
            op: BinaryOpKind::Sub,
            dtype: Datatype::Float32,
            src1: RuntimeShape4::from_shape(&[2, 1, 3]).unwrap(),
            src2: RuntimeShape4::from_shape(&[1, 2, 3]).unwrap(),
            dest: RuntimeShape4::from_shape(&[2, 2, 3]).unwrap(),
        };
        let lhs = f32s(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rhs = f32s(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        let mut out = vec![0u8; 12 * 4];
        (kernel_for(&op))(&op, &[&lhs, &rhs], &mut out).unwrap();
        assert_eq!(
            as_f32s(&out),
            vec![
                -9.0, -18.0, -27.0, -39.0, -48.0, -57.0, //
                -6.0, -15.0, -24.0, -36.0, -45.0, -54.0,
            ]
        );
    }

    #[test]
    fn test_binary_int_division_by_zero() {
        let op = TensorOp::Binary {
            op: BinaryOpKind::Div,
            dtype: Datatype::Int32,
            src1: RuntimeShape4::from_shape(&[1]).unwrap(),
            src2: RuntimeShape4::from_shape(&[1]).unwrap(),
            dest: RuntimeShape4::from_shape(&[1]).unwrap(),
        };
        let lhs = 7i32.to_le_bytes().to_vec();
        let rhs = 0i32.to_le_bytes().to_vec();
        let mut out = vec![0u8; 4];
        let err = (kernel_for(&op))(&op, &[&lhs, &rhs], &mut out).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidProgram);
    }

    #[test]
    fn test_pad() {
        let op = TensorOp::Pad {
            dtype: Datatype::Float32,
            src: RuntimeShape4::from_shape(&[2]).unwrap(),
            dest: RuntimeShape4::from_shape(&[5]).unwrap(),
            dims: [
                PadDim::default(),
                PadDim::default(),
                PadDim::default(),
                PadDim { before: 1, after: 2 },
            ],
            value: -1.0,
        };
        let src = f32s(&[7.0, 8.0]);
        let mut out = vec![0u8; 5 * 4];
        (kernel_for(&op))(&op, &[&src], &mut out).unwrap();
        assert_eq!(as_f32s(&out), vec![-1.0, 7.0, 8.0, -1.0, -1.0]);
    }

    #[test]
    fn test_transpose() {
        let op = TensorOp::Transpose {
            dtype: Datatype::Float32,
            src: RuntimeShape4::from_shape(&[2, 3]).unwrap(),
            dest: RuntimeShape4::from_shape(&[3, 2]).unwrap(),
            // Identity on the padded dims, swap the last two.
            perm: [0, 1, 3, 2],
        };
        let src = f32s(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut out = vec![0u8; 6 * 4];
        (kernel_for(&op))(&op, &[&src], &mut out).unwrap();
        assert_eq!(as_f32s(&out), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_slice_with_stride() {
        let op = TensorOp::Slice {
            dtype: Datatype::Float32,
            src: RuntimeShape4::from_shape(&[8]).unwrap(),
            dest: RuntimeShape4::from_shape(&[3]).unwrap(),
            dims: [
                SliceDim { start: 0, end: 1, stride: 1 },
                SliceDim { start: 0, end: 1, stride: 1 },
                SliceDim { start: 0, end: 1, stride: 1 },
                SliceDim { start: 1, end: 7, stride: 2 },
            ],
        };
        let src = f32s(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let mut out = vec![0u8; 3 * 4];
        (kernel_for(&op))(&op, &[&src], &mut out).unwrap();
        assert_eq!(as_f32s(&out), vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_sort_descending() {
        let op = TensorOp::Sort {
            dtype: Datatype::Int32,
            src: RuntimeShape4::from_shape(&[4]).unwrap(),
            dest: RuntimeShape4::from_shape(&[4]).unwrap(),
            dim: 3,
            descending: true,
        };
        let src: Vec<u8> = [3i32, 1, 4, 1].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = vec![0u8; 16];
        (kernel_for(&op))(&op, &[&src], &mut out).unwrap();
        let values: Vec<i32> = out
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![4, 3, 1, 1]);
    }

    #[test]
    fn test_quantize_dequantize() {
        let q = TensorOp::Quantize {
            src_type: Datatype::Float32,
            src: RuntimeShape4::from_shape(&[4]).unwrap(),
            dest_type: Datatype::UInt8,
            dest: RuntimeShape4::from_shape(&[4]).unwrap(),
            scale: 0.5,
            zero_point: 10,
        };
        let src = f32s(&[0.0, 1.0, 2.0, 200.0]);
        let mut out = vec![0u8; 4];
        (kernel_for(&q))(&q, &[&src], &mut out).unwrap();
        // 200/0.5 + 10 saturates at u8::MAX.
        assert_eq!(out, vec![10, 12, 14, 255]);

        let dq = TensorOp::Dequantize {
            src_type: Datatype::UInt8,
            src: RuntimeShape4::from_shape(&[4]).unwrap(),
            dest_type: Datatype::Float32,
            dest: RuntimeShape4::from_shape(&[4]).unwrap(),
            scale: 0.5,
            zero_point: 10,
        };
        let mut back = vec![0u8; 16];
        (kernel_for(&dq))(&dq, &[&out], &mut back).unwrap();
        assert_eq!(as_f32s(&back), vec![0.0, 1.0, 2.0, 122.5]);
    }

    #[test]
    fn test_convert_truncates() {
        let op = TensorOp::Convert {
            src_type: Datatype::Float32,
            src: RuntimeShape4::from_shape(&[3]).unwrap(),
            dest_type: Datatype::Int32,
            dest: RuntimeShape4::from_shape(&[3]).unwrap(),
        };
        let src = f32s(&[1.9, -1.9, 7.0]);
        let mut out = vec![0u8; 12];
        (kernel_for(&op))(&op, &[&src], &mut out).unwrap();
        let values: Vec<i32> = out
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![1, -1, 7]);
    }

    #[test]
    fn test_clamp() {
        let op = TensorOp::Clamp {
            dtype: Datatype::Float32,
            src: RuntimeShape4::from_shape(&[4]).unwrap(),
            dest: RuntimeShape4::from_shape(&[4]).unwrap(),
            min: 0.0,
            max: 6.0,
        };
        let src = f32s(&[-3.0, 0.5, 5.0, 9.0]);
        let mut out = vec![0u8; 16];
        (kernel_for(&op))(&op, &[&src], &mut out).unwrap();
        assert_eq!(as_f32s(&out), vec![0.0, 0.5, 5.0, 6.0]);
    }
}
