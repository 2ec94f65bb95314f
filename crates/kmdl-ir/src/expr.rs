//! Expression nodes
//!
//! Nodes are shared through [`ExprRef`] (a strong reference); a DAG may hold
//! multiple incoming edges on one node. Identity for traversal memoization
//! is the node's address, exposed as [`ExprId`]. Mutation is restricted to
//! the documented hooks (`Function::set_body`, `Call::set_target`,
//! `Var::set_type_annotation`) and must not run concurrently with a
//! traversal.

use crate::op::Op;
use crate::{IrError, Result};
use kmdl_core::{bytes_of, Datatype, ObjectKind, Scalar, Shape, TensorType, Type};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared strong reference to an expression node
pub type ExprRef = Rc<ExprNode>;

/// Stable identity of a node, derived from its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(usize);

/// An expression node: variant payload plus the inferred type slot
#[derive(Debug)]
pub struct ExprNode {
    payload: ExprPayload,
    checked_type: RefCell<Option<Type>>,
}

/// The expression variants
#[derive(Debug)]
pub enum ExprPayload {
    /// A formal parameter or let-bound name
    Var(Var),
    /// An immutable literal tensor
    Constant(Constant),
    /// Application of an op or function
    Call(Call),
    /// A λ whose parameters shadow any outer name
    Function(Function),
    /// Fixed-arity product
    Tuple(Tuple),
    /// Operator descriptor; stateless with respect to arguments
    Op(Op),
}

/// Variable node
#[derive(Debug)]
pub struct Var {
    name: String,
    type_annotation: RefCell<Type>,
}

/// Constant node
#[derive(Debug)]
pub struct Constant {
    value_type: Type,
    data: Vec<u8>,
}

/// Call node
#[derive(Debug)]
pub struct Call {
    target: RefCell<ExprRef>,
    arguments: Vec<ExprRef>,
}

/// Function node
#[derive(Debug)]
pub struct Function {
    name: String,
    parameters: Vec<ExprRef>,
    body: RefCell<ExprRef>,
}

/// Tuple node
#[derive(Debug)]
pub struct Tuple {
    fields: Vec<ExprRef>,
}

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(0);

impl ExprNode {
    fn new(payload: ExprPayload) -> ExprRef {
        Rc::new(ExprNode {
            payload,
            checked_type: RefCell::new(None),
        })
    }

    /// Create a named variable with a type annotation
    pub fn var(name: impl Into<String>, type_annotation: Type) -> ExprRef {
        Self::new(ExprPayload::Var(Var {
            name: name.into(),
            type_annotation: RefCell::new(type_annotation),
        }))
    }

    /// Create a variable with an auto-generated name and `Any` annotation
    pub fn fresh_var() -> ExprRef {
        let id = NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed);
        Self::var(format!("%{}", id), Type::Any)
    }

    /// Create a constant from a declared type and raw little-endian data.
    ///
    /// The payload length must match the declared tensor type exactly.
    pub fn constant(value_type: Type, data: Vec<u8>) -> Result<ExprRef> {
        if let Type::Tensor(t) = &value_type {
            let expected = bytes_of(t.dtype, &t.shape);
            if data.len() != expected {
                return Err(IrError::ConstantSizeMismatch {
                    expected,
                    actual: data.len(),
                });
            }
        }
        Ok(Self::new(ExprPayload::Constant(Constant { value_type, data })))
    }

    /// Create a scalar constant (empty shape)
    pub fn constant_scalar(value: impl Into<Scalar>) -> ExprRef {
        let scalar = value.into();
        let value_type = Type::scalar_tensor(scalar.dtype());
        Self::new(ExprPayload::Constant(Constant {
            value_type,
            data: scalar.to_le_bytes().to_vec(),
        }))
    }

    /// Create a tensor constant from typed elements
    pub fn constant_tensor<T>(shape: impl Into<Shape>, elems: &[T]) -> Result<ExprRef>
    where
        T: Into<Scalar> + Copy,
    {
        let shape = shape.into();
        let mut data = Vec::new();
        let mut dtype = None;
        for &e in elems {
            let s: Scalar = e.into();
            dtype = Some(s.dtype());
            data.extend_from_slice(&s.to_le_bytes());
        }
        let dtype = dtype.ok_or_else(|| IrError::Message("empty constant tensor".into()))?;
        Self::constant(Type::Tensor(TensorType::new(dtype, shape)), data)
    }

    /// Create a call
    pub fn call(target: ExprRef, arguments: Vec<ExprRef>) -> ExprRef {
        Self::new(ExprPayload::Call(Call {
            target: RefCell::new(target),
            arguments,
        }))
    }

    /// Create a named function
    pub fn function(name: impl Into<String>, parameters: Vec<ExprRef>, body: ExprRef) -> ExprRef {
        debug_assert!(parameters.iter().all(|p| p.as_var().is_some()));
        Self::new(ExprPayload::Function(Function {
            name: name.into(),
            parameters,
            body: RefCell::new(body),
        }))
    }

    /// Create a tuple
    pub fn tuple(fields: Vec<ExprRef>) -> ExprRef {
        Self::new(ExprPayload::Tuple(Tuple { fields }))
    }

    /// Create an operator descriptor node
    pub fn op(op: Op) -> ExprRef {
        Self::new(ExprPayload::Op(op))
    }

    /// The variant payload
    pub fn payload(&self) -> &ExprPayload {
        &self.payload
    }

    /// Dynamic object kind of this node
    pub fn kind(&self) -> ObjectKind {
        match self.payload {
            ExprPayload::Var(_) => ObjectKind::Var,
            ExprPayload::Constant(_) => ObjectKind::Constant,
            ExprPayload::Call(_) => ObjectKind::Call,
            ExprPayload::Function(_) => ObjectKind::Function,
            ExprPayload::Tuple(_) => ObjectKind::Tuple,
            ExprPayload::Op(_) => ObjectKind::Op,
        }
    }

    /// Downcast to a variable
    pub fn as_var(&self) -> Option<&Var> {
        match &self.payload {
            ExprPayload::Var(v) => Some(v),
            _ => None,
        }
    }

    /// Downcast to a constant
    pub fn as_constant(&self) -> Option<&Constant> {
        match &self.payload {
            ExprPayload::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// Downcast to a call
    pub fn as_call(&self) -> Option<&Call> {
        match &self.payload {
            ExprPayload::Call(c) => Some(c),
            _ => None,
        }
    }

    /// Downcast to a function
    pub fn as_function(&self) -> Option<&Function> {
        match &self.payload {
            ExprPayload::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Downcast to a tuple
    pub fn as_tuple(&self) -> Option<&Tuple> {
        match &self.payload {
            ExprPayload::Tuple(t) => Some(t),
            _ => None,
        }
    }

    /// Downcast to an operator descriptor
    pub fn as_op(&self) -> Option<&Op> {
        match &self.payload {
            ExprPayload::Op(o) => Some(o),
            _ => None,
        }
    }

    /// Inferred type, if inference has run
    pub fn checked_type(&self) -> Option<Type> {
        self.checked_type.borrow().clone()
    }

    /// Record the inferred type
    pub fn set_checked_type(&self, ty: Type) {
        *self.checked_type.borrow_mut() = Some(ty);
    }

    /// Identity of a node, for traversal memoization.
    ///
    /// The address of the shared node; two handles compare equal exactly
    /// when they point at the same allocation.
    pub fn id(&self) -> ExprId {
        ExprId(self as *const ExprNode as usize)
    }
}

impl Var {
    /// Name of the variable; not globally unique, binding is positional
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current type annotation
    pub fn type_annotation(&self) -> Type {
        self.type_annotation.borrow().clone()
    }

    /// Replace the type annotation (mutator hook)
    pub fn set_type_annotation(&self, ty: Type) {
        *self.type_annotation.borrow_mut() = ty;
    }
}

impl Constant {
    /// Declared type of the literal
    pub fn value_type(&self) -> &Type {
        &self.value_type
    }

    /// Raw little-endian payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Read the payload as a vector of dimension-like integers.
    ///
    /// Accepts i32, i64, u32, and u64 tensors; used by operators that take
    /// shapes, axes, or permutations as constant arguments.
    pub fn as_dims(&self) -> Option<Vec<i64>> {
        let t = self.value_type.as_tensor()?;
        let n = kmdl_core::num_elements(&t.shape);
        let mut dims = Vec::with_capacity(n);
        match t.dtype {
            Datatype::Int32 => {
                for chunk in self.data.chunks_exact(4) {
                    dims.push(i32::from_le_bytes(chunk.try_into().unwrap()) as i64);
                }
            }
            Datatype::Int64 => {
                for chunk in self.data.chunks_exact(8) {
                    dims.push(i64::from_le_bytes(chunk.try_into().unwrap()));
                }
            }
            Datatype::UInt32 => {
                for chunk in self.data.chunks_exact(4) {
                    dims.push(u32::from_le_bytes(chunk.try_into().unwrap()) as i64);
                }
            }
            Datatype::UInt64 => {
                for chunk in self.data.chunks_exact(8) {
                    dims.push(u64::from_le_bytes(chunk.try_into().unwrap()) as i64);
                }
            }
            _ => return None,
        }
        Some(dims)
    }

    /// Read a scalar u8 payload (e.g. a typecode argument)
    pub fn as_u8_scalar(&self) -> Option<u8> {
        let t = self.value_type.as_tensor()?;
        if t.is_scalar() && t.dtype == Datatype::UInt8 {
            self.data.first().copied()
        } else {
            None
        }
    }
}

impl Call {
    /// Current call target
    pub fn target(&self) -> ExprRef {
        self.target.borrow().clone()
    }

    /// Replace the call target (mutator hook)
    pub fn set_target(&self, target: ExprRef) {
        *self.target.borrow_mut() = target;
    }

    /// Arguments in declared parameter order
    pub fn arguments(&self) -> &[ExprRef] {
        &self.arguments
    }
}

impl Function {
    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Formal parameters (all `Var` nodes)
    pub fn parameters(&self) -> &[ExprRef] {
        &self.parameters
    }

    /// Current body expression
    pub fn body(&self) -> ExprRef {
        self.body.borrow().clone()
    }

    /// Replace the body (mutator hook)
    pub fn set_body(&self, body: ExprRef) {
        *self.body.borrow_mut() = body;
    }
}

impl Tuple {
    /// Tuple fields
    pub fn fields(&self) -> &[ExprRef] {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_scalar_constant() {
        let c = ExprNode::constant_scalar(2.0f32);
        let constant = c.as_constant().unwrap();
        assert_eq!(constant.value_type(), &Type::scalar_tensor(Datatype::Float32));
        assert_eq!(constant.data(), &2.0f32.to_le_bytes());
    }

    #[test]
    fn test_constant_size_checked() {
        let bad = ExprNode::constant(Type::tensor(Datatype::Float32, smallvec![2]), vec![0u8; 3]);
        assert!(matches!(bad, Err(IrError::ConstantSizeMismatch { expected: 8, actual: 3 })));
    }

    #[test]
    fn test_shared_identity() {
        let shared = ExprNode::constant_scalar(1i32);
        let other = ExprNode::constant_scalar(1i32);
        assert_eq!(shared.id(), shared.clone().id());
        assert_ne!(shared.id(), other.id());
    }

    #[test]
    fn test_mutator_hooks() {
        let v = ExprNode::var("x", Type::Any);
        v.as_var().unwrap().set_type_annotation(Type::scalar_tensor(Datatype::Float32));
        assert_eq!(
            v.as_var().unwrap().type_annotation(),
            Type::scalar_tensor(Datatype::Float32)
        );

        let body = ExprNode::constant_scalar(0i32);
        let f = ExprNode::function("f", vec![v], body);
        let replacement = ExprNode::constant_scalar(1i32);
        f.as_function().unwrap().set_body(replacement.clone());
        assert_eq!(f.as_function().unwrap().body().id(), replacement.id());
    }

    #[test]
    fn test_dims_extraction() {
        let c = ExprNode::constant_tensor(smallvec![3usize], &[2i64, 3, 4]).unwrap();
        assert_eq!(c.as_constant().unwrap().as_dims(), Some(vec![2, 3, 4]));

        let f = ExprNode::constant_scalar(1.0f32);
        assert_eq!(f.as_constant().unwrap().as_dims(), None);
    }

    #[test]
    fn test_kinds() {
        let v = ExprNode::fresh_var();
        assert_eq!(v.kind(), ObjectKind::Var);
        assert!(v.kind().is_a(ObjectKind::Expr));
        assert!(v.as_call().is_none());
    }
}
