//! The `tensors` dialect: layout and datatype rearrangement
//!
//! These operators take their configuration (target shapes, permutations,
//! slice bounds, typecodes) as constant arguments; when such an argument is
//! not a constant the result shape is unknowable at compile time and the
//! inferencer reports `Any`.

use crate::expr::{ExprNode, ExprRef};
use crate::infer::{
    constant_dims_argument, constant_u8_argument, tensor_argument, InferContext,
};
use crate::op::{NodeKind, Op, OpSpec, ParameterInfo};
use kmdl_core::{num_elements, Datatype, Shape, TensorType, Type};

macro_rules! define_kinds {
    ($($const_name:ident = ($id:expr, $name:expr)),* $(,)?) => {
        $(
            #[doc = concat!("`", $name, "` operator kind")]
            pub const $const_name: NodeKind = NodeKind { id: $id, name: $name };
        )*
    };
}

define_kinds! {
    CAST = (0x0200, "tensors.cast"),
    RESHAPE = (0x0201, "tensors.reshape"),
    TRANSPOSE = (0x0202, "tensors.transpose"),
    SLICE = (0x0203, "tensors.slice"),
    BROADCAST = (0x0204, "tensors.broadcast"),
    PAD = (0x0205, "tensors.pad"),
    QUANTIZE = (0x0206, "tensors.quantize"),
    DEQUANTIZE = (0x0207, "tensors.dequantize"),
}

const CAST_PARAMS: &[ParameterInfo] = &[
    ParameterInfo::new("input", 0),
    ParameterInfo::new("new_type", 1),
];

const RESHAPE_PARAMS: &[ParameterInfo] = &[
    ParameterInfo::new("input", 0),
    ParameterInfo::new("new_shape", 1),
];

const TRANSPOSE_PARAMS: &[ParameterInfo] = &[
    ParameterInfo::new("input", 0),
    ParameterInfo::new("perm", 1),
];

const SLICE_PARAMS: &[ParameterInfo] = &[
    ParameterInfo::new("input", 0),
    ParameterInfo::new("begins", 1),
    ParameterInfo::new("ends", 2),
    ParameterInfo::new("strides", 3),
];

const BROADCAST_PARAMS: &[ParameterInfo] = &[
    ParameterInfo::new("input", 0),
    ParameterInfo::new("new_shape", 1),
];

const PAD_PARAMS: &[ParameterInfo] = &[
    ParameterInfo::new("input", 0),
    ParameterInfo::new("pads", 1),
    ParameterInfo::new("pad_value", 2),
];

const QUANTIZE_PARAMS: &[ParameterInfo] = &[
    ParameterInfo::new("input", 0),
    ParameterInfo::new("new_type", 1),
    ParameterInfo::new("scale", 2),
    ParameterInfo::new("zero_point", 3),
];

fn infer_cast(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &CAST_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    match constant_u8_argument(context, &CAST_PARAMS[1]).map(Datatype::from_typecode) {
        Some(Some(dt)) => Type::tensor(dt, input.shape),
        Some(None) => Type::invalid("unknown typecode"),
        None => Type::Any,
    }
}

fn infer_reshape(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &RESHAPE_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    let dims = match constant_dims_argument(context, &RESHAPE_PARAMS[1]) {
        Some(dims) => dims,
        None => return Type::Any,
    };

    // One dimension may be -1 and is inferred from the element count.
    let known: i64 = dims.iter().filter(|&&d| d >= 0).product();
    let wildcards = dims.iter().filter(|&&d| d < 0).count();
    let total = num_elements(&input.shape) as i64;
    let shape: Option<Shape> = match wildcards {
        0 if known == total => Some(dims.iter().map(|&d| d as usize).collect()),
        1 if known > 0 && total % known == 0 => Some(
            dims.iter()
                .map(|&d| if d < 0 { (total / known) as usize } else { d as usize })
                .collect(),
        ),
        _ => None,
    };
    match shape {
        Some(shape) => Type::tensor(input.dtype, shape),
        None => Type::invalid("reshape target does not match element count"),
    }
}

fn infer_transpose(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &TRANSPOSE_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    let perm = match constant_dims_argument(context, &TRANSPOSE_PARAMS[1]) {
        Some(perm) => perm,
        None => return Type::Any,
    };
    if perm.len() != input.shape.len() {
        return Type::invalid("permutation rank mismatch");
    }
    let mut seen = vec![false; perm.len()];
    let mut shape = Shape::from_elem(0, perm.len());
    for (i, &axis) in perm.iter().enumerate() {
        let axis = axis as usize;
        if axis >= perm.len() || seen[axis] {
            return Type::invalid("invalid permutation");
        }
        seen[axis] = true;
        shape[i] = input.shape[axis];
    }
    Type::tensor(input.dtype, shape)
}

fn infer_slice(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &SLICE_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    let (begins, ends, strides) = match (
        constant_dims_argument(context, &SLICE_PARAMS[1]),
        constant_dims_argument(context, &SLICE_PARAMS[2]),
        constant_dims_argument(context, &SLICE_PARAMS[3]),
    ) {
        (Some(b), Some(e), Some(s)) => (b, e, s),
        _ => return Type::Any,
    };
    let rank = input.shape.len();
    if begins.len() != rank || ends.len() != rank || strides.len() != rank {
        return Type::invalid("slice config rank mismatch");
    }

    let mut shape = Shape::from_elem(0, rank);
    for i in 0..rank {
        let dim = input.shape[i] as i64;
        let (begin, end, stride) = (begins[i], ends[i], strides[i]);
        if stride <= 0 {
            return Type::invalid("slice stride must be positive");
        }
        if begin < 0 || end < begin || end > dim {
            return Type::invalid("slice bounds out of range");
        }
        shape[i] = ((end - begin + stride - 1) / stride) as usize;
    }
    Type::tensor(input.dtype, shape)
}

fn infer_broadcast(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &BROADCAST_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    let dims = match constant_dims_argument(context, &BROADCAST_PARAMS[1]) {
        Some(dims) => dims,
        None => return Type::Any,
    };
    if dims.iter().any(|&d| d < 0) {
        return Type::invalid("broadcast target must be nonnegative");
    }
    let target: Shape = dims.iter().map(|&d| d as usize).collect();
    let target_type = TensorType::new(input.dtype, target.clone());
    match kmdl_core::broadcast(&input, &target_type) {
        Type::Tensor(t) if t.shape == target => Type::Tensor(t),
        Type::Tensor(_) => Type::invalid("input not broadcastable to target shape"),
        other => other,
    }
}

fn infer_pad(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &PAD_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    let value = match tensor_argument(context, &PAD_PARAMS[2]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    if value.dtype != input.dtype || !value.is_scalar() {
        return Type::invalid("pad value must be a scalar of the input datatype");
    }
    let pads = match constant_dims_argument(context, &PAD_PARAMS[1]) {
        Some(p) => p,
        None => return Type::Any,
    };
    let rank = input.shape.len();
    if pads.len() != rank * 2 {
        return Type::invalid("pads must hold a before/after pair per dimension");
    }
    let mut shape = Shape::from_elem(0, rank);
    for i in 0..rank {
        let (before, after) = (pads[i * 2], pads[i * 2 + 1]);
        let dim = input.shape[i] as i64 + before + after;
        if dim < 0 {
            return Type::invalid("negative padded dimension");
        }
        shape[i] = dim as usize;
    }
    Type::tensor(input.dtype, shape)
}

fn infer_quantize(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &QUANTIZE_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    if !input.dtype.is_float() {
        return Type::invalid("quantize input must be floating point");
    }
    match constant_u8_argument(context, &QUANTIZE_PARAMS[1]).map(Datatype::from_typecode) {
        Some(Some(dt)) if dt.is_signed_int() || dt.is_unsigned_int() => {
            Type::tensor(dt, input.shape)
        }
        Some(_) => Type::invalid("quantize target must be an integer datatype"),
        None => Type::Any,
    }
}

fn infer_dequantize(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &QUANTIZE_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    if !input.dtype.is_signed_int() && !input.dtype.is_unsigned_int() {
        return Type::invalid("dequantize input must be an integer datatype");
    }
    match constant_u8_argument(context, &QUANTIZE_PARAMS[1]).map(Datatype::from_typecode) {
        Some(Some(dt)) if dt.is_float() => Type::tensor(dt, input.shape),
        Some(_) => Type::invalid("dequantize target must be floating point"),
        None => Type::Any,
    }
}

/// Build a `cast` call; `new_type` is a scalar u8 typecode constant
pub fn cast(input: ExprRef, new_type: Datatype) -> ExprRef {
    let op = Op::new(CAST, CAST_PARAMS, infer_cast);
    let code = ExprNode::constant_scalar(new_type.typecode());
    ExprNode::call(ExprNode::op(op), vec![input, code])
}

/// Build a `reshape` call; the target shape is a constant i64 tensor
pub fn reshape(input: ExprRef, new_shape: ExprRef) -> ExprRef {
    let op = Op::new(RESHAPE, RESHAPE_PARAMS, infer_reshape);
    ExprNode::call(ExprNode::op(op), vec![input, new_shape])
}

/// Build a `transpose` call
pub fn transpose(input: ExprRef, perm: ExprRef) -> ExprRef {
    let op = Op::new(TRANSPOSE, TRANSPOSE_PARAMS, infer_transpose);
    ExprNode::call(ExprNode::op(op), vec![input, perm])
}

/// Build a `slice` call
pub fn slice(input: ExprRef, begins: ExprRef, ends: ExprRef, strides: ExprRef) -> ExprRef {
    let op = Op::new(SLICE, SLICE_PARAMS, infer_slice);
    ExprNode::call(ExprNode::op(op), vec![input, begins, ends, strides])
}

/// Build a `broadcast` call
pub fn broadcast_to(input: ExprRef, new_shape: ExprRef) -> ExprRef {
    let op = Op::new(BROADCAST, BROADCAST_PARAMS, infer_broadcast);
    ExprNode::call(ExprNode::op(op), vec![input, new_shape])
}

/// Build a `pad` call; `pads` holds a before/after pair per dimension
pub fn pad(input: ExprRef, pads: ExprRef, pad_value: ExprRef) -> ExprRef {
    let op = Op::new(PAD, PAD_PARAMS, infer_pad);
    ExprNode::call(ExprNode::op(op), vec![input, pads, pad_value])
}

/// Build a `quantize` call
pub fn quantize(input: ExprRef, new_type: Datatype, scale: ExprRef, zero_point: ExprRef) -> ExprRef {
    let op = Op::new(QUANTIZE, QUANTIZE_PARAMS, infer_quantize);
    let code = ExprNode::constant_scalar(new_type.typecode());
    ExprNode::call(ExprNode::op(op), vec![input, code, scale, zero_point])
}

/// Build a `dequantize` call
pub fn dequantize(
    input: ExprRef,
    new_type: Datatype,
    scale: ExprRef,
    zero_point: ExprRef,
) -> ExprRef {
    let op = Op::new(DEQUANTIZE, QUANTIZE_PARAMS, infer_dequantize);
    let code = ExprNode::constant_scalar(new_type.typecode());
    ExprNode::call(ExprNode::op(op), vec![input, code, scale, zero_point])
}

/// Registry specs for the tensors dialect
pub fn specs() -> Vec<OpSpec> {
    vec![
        OpSpec { kind: CAST, parameters: CAST_PARAMS, infer: infer_cast },
        OpSpec { kind: RESHAPE, parameters: RESHAPE_PARAMS, infer: infer_reshape },
        OpSpec { kind: TRANSPOSE, parameters: TRANSPOSE_PARAMS, infer: infer_transpose },
        OpSpec { kind: SLICE, parameters: SLICE_PARAMS, infer: infer_slice },
        OpSpec { kind: BROADCAST, parameters: BROADCAST_PARAMS, infer: infer_broadcast },
        OpSpec { kind: PAD, parameters: PAD_PARAMS, infer: infer_pad },
        OpSpec { kind: QUANTIZE, parameters: QUANTIZE_PARAMS, infer: infer_quantize },
        OpSpec { kind: DEQUANTIZE, parameters: QUANTIZE_PARAMS, infer: infer_dequantize },
    ]
}
