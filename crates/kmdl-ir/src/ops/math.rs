//! The `math` dialect: elementwise arithmetic, comparison, and clamping
//!
//! Binary and comparison operators broadcast their operands NumPy style.
//! Comparison results are boolean tensors of the broadcast shape.

use crate::expr::{ExprNode, ExprRef};
use crate::infer::{tensor_argument, InferContext};
use crate::op::{InferFn, NodeKind, Op, OpSpec, ParameterInfo};
use kmdl_core::{broadcast, Datatype, TensorType, Type};

macro_rules! define_kinds {
    ($($const_name:ident = ($id:expr, $name:expr)),* $(,)?) => {
        $(
            #[doc = concat!("`", $name, "` operator kind")]
            pub const $const_name: NodeKind = NodeKind { id: $id, name: $name };
        )*
    };
}

define_kinds! {
    ADD = (0x0100, "math.add"),
    SUB = (0x0101, "math.sub"),
    MUL = (0x0102, "math.mul"),
    DIV = (0x0103, "math.div"),
    MIN = (0x0104, "math.min"),
    MAX = (0x0105, "math.max"),

    NEG = (0x0110, "math.neg"),
    ABS = (0x0111, "math.abs"),
    EXP = (0x0112, "math.exp"),
    LOG = (0x0113, "math.log"),
    SQRT = (0x0114, "math.sqrt"),
    SQUARE = (0x0115, "math.square"),
    ROUND = (0x0116, "math.round"),

    CLAMP = (0x0120, "math.clamp"),

    EQ = (0x0130, "math.equal"),
    NE = (0x0131, "math.not_equal"),
    LT = (0x0132, "math.less"),
    LE = (0x0133, "math.less_equal"),
    GT = (0x0134, "math.greater"),
    GE = (0x0135, "math.greater_equal"),
}

const BINARY_PARAMS: &[ParameterInfo] =
    &[ParameterInfo::new("lhs", 0), ParameterInfo::new("rhs", 1)];

const UNARY_PARAMS: &[ParameterInfo] = &[ParameterInfo::new("input", 0)];

const CLAMP_PARAMS: &[ParameterInfo] = &[
    ParameterInfo::new("input", 0),
    ParameterInfo::new("min", 1),
    ParameterInfo::new("max", 2),
];

/// Binary operator kinds, in the order the rest of the toolchain relies on
pub const BINARY_KINDS: [NodeKind; 6] = [ADD, SUB, MUL, DIV, MIN, MAX];

/// Unary operator kinds
pub const UNARY_KINDS: [NodeKind; 7] = [NEG, ABS, EXP, LOG, SQRT, SQUARE, ROUND];

/// Comparison operator kinds
pub const COMPARE_KINDS: [NodeKind; 6] = [EQ, NE, LT, LE, GT, GE];

fn infer_binary(_op: &Op, context: &mut dyn InferContext) -> Type {
    let lhs = match tensor_argument(context, &BINARY_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    let rhs = match tensor_argument(context, &BINARY_PARAMS[1]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    broadcast(&lhs, &rhs)
}

fn infer_compare(op: &Op, context: &mut dyn InferContext) -> Type {
    match infer_binary(op, context) {
        Type::Tensor(t) => Type::Tensor(TensorType::new(Datatype::Bool, t.shape)),
        other => other,
    }
}

fn infer_unary(_op: &Op, context: &mut dyn InferContext) -> Type {
    match tensor_argument(context, &UNARY_PARAMS[0]) {
        Ok(t) => Type::Tensor(t),
        Err(short) => short,
    }
}

fn infer_clamp(_op: &Op, context: &mut dyn InferContext) -> Type {
    let input = match tensor_argument(context, &CLAMP_PARAMS[0]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    let min = match tensor_argument(context, &CLAMP_PARAMS[1]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    let max = match tensor_argument(context, &CLAMP_PARAMS[2]) {
        Ok(t) => t,
        Err(short) => return short,
    };
    match broadcast(&input, &min) {
        Type::Tensor(t) => broadcast(&t, &max),
        other => other,
    }
}

/// Construct a binary operator descriptor
pub fn binary_op(kind: NodeKind) -> Op {
    debug_assert!(BINARY_KINDS.contains(&kind));
    Op::new(kind, BINARY_PARAMS, infer_binary as InferFn)
}

/// Construct a unary operator descriptor
pub fn unary_op(kind: NodeKind) -> Op {
    debug_assert!(UNARY_KINDS.contains(&kind));
    Op::new(kind, UNARY_PARAMS, infer_unary as InferFn)
}

/// Construct a comparison operator descriptor
pub fn compare_op(kind: NodeKind) -> Op {
    debug_assert!(COMPARE_KINDS.contains(&kind));
    Op::new(kind, BINARY_PARAMS, infer_compare as InferFn)
}

/// Construct the clamp operator descriptor
pub fn clamp_op() -> Op {
    Op::new(CLAMP, CLAMP_PARAMS, infer_clamp as InferFn)
}

macro_rules! define_binary_builders {
    ($($fn_name:ident => $kind:ident),* $(,)?) => {
        $(
            #[doc = concat!("Build a `", stringify!($fn_name), "` call")]
            pub fn $fn_name(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
                ExprNode::call(ExprNode::op(binary_op($kind)), vec![lhs, rhs])
            }
        )*
    };
}

macro_rules! define_unary_builders {
    ($($fn_name:ident => $kind:ident),* $(,)?) => {
        $(
            #[doc = concat!("Build a `", stringify!($fn_name), "` call")]
            pub fn $fn_name(input: ExprRef) -> ExprRef {
                ExprNode::call(ExprNode::op(unary_op($kind)), vec![input])
            }
        )*
    };
}

macro_rules! define_compare_builders {
    ($($fn_name:ident => $kind:ident),* $(,)?) => {
        $(
            #[doc = concat!("Build a `", stringify!($fn_name), "` comparison call")]
            pub fn $fn_name(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
                ExprNode::call(ExprNode::op(compare_op($kind)), vec![lhs, rhs])
            }
        )*
    };
}

define_binary_builders! {
    add => ADD,
    sub => SUB,
    mul => MUL,
    div => DIV,
    min => MIN,
    max => MAX,
}

define_unary_builders! {
    neg => NEG,
    abs => ABS,
    exp => EXP,
    log => LOG,
    sqrt => SQRT,
    square => SQUARE,
    round => ROUND,
}

define_compare_builders! {
    equal => EQ,
    not_equal => NE,
    less => LT,
    less_equal => LE,
    greater => GT,
    greater_equal => GE,
}

/// Build a `clamp` call
pub fn clamp(input: ExprRef, min: ExprRef, max: ExprRef) -> ExprRef {
    ExprNode::call(ExprNode::op(clamp_op()), vec![input, min, max])
}

/// Registry specs for the math dialect
pub fn specs() -> Vec<OpSpec> {
    let mut specs = Vec::new();
    for kind in BINARY_KINDS {
        specs.push(OpSpec { kind, parameters: BINARY_PARAMS, infer: infer_binary });
    }
    for kind in UNARY_KINDS {
        specs.push(OpSpec { kind, parameters: UNARY_PARAMS, infer: infer_unary });
    }
    for kind in COMPARE_KINDS {
        specs.push(OpSpec { kind, parameters: BINARY_PARAMS, infer: infer_compare });
    }
    specs.push(OpSpec { kind: CLAMP, parameters: CLAMP_PARAMS, infer: infer_clamp });
    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::infer_type;
    use smallvec::smallvec;

    #[test]
    fn test_compare_yields_bool() {
        let lhs = ExprNode::var("lhs", Type::tensor(Datatype::Float32, smallvec![2, 3]));
        let rhs = ExprNode::var("rhs", Type::tensor(Datatype::Float32, smallvec![3]));
        let body = less(lhs.clone(), rhs.clone());
        let f = ExprNode::function("f", vec![lhs, rhs], body.clone());
        assert!(infer_type(&f));
        assert_eq!(body.checked_type(), Some(Type::tensor(Datatype::Bool, smallvec![2, 3])));
    }

    #[test]
    fn test_clamp_broadcasts_bounds() {
        let x = ExprNode::var("x", Type::tensor(Datatype::Float32, smallvec![4, 4]));
        let body = clamp(
            x.clone(),
            ExprNode::constant_scalar(0.0f32),
            ExprNode::constant_scalar(6.0f32),
        );
        let f = ExprNode::function("f", vec![x], body.clone());
        assert!(infer_type(&f));
        assert_eq!(body.checked_type(), Some(Type::tensor(Datatype::Float32, smallvec![4, 4])));
    }

    #[test]
    fn test_unary_preserves_type() {
        let x = ExprNode::var("x", Type::tensor(Datatype::Int32, smallvec![5]));
        let body = abs(x.clone());
        let f = ExprNode::function("f", vec![x], body.clone());
        assert!(infer_type(&f));
        assert_eq!(body.checked_type(), Some(Type::tensor(Datatype::Int32, smallvec![5])));
    }
}
