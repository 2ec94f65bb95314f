//! Runtime values: tensors and tuples of values

use crate::error::{Result, RuntimeError};
use crate::tensor::RuntimeTensor;
use kmdl_core::Type;
use std::fmt;

/// A value passed into or out of a runtime function.
///
/// Scalars are zero-rank tensors.
#[derive(Clone)]
pub enum Value {
    /// A tensor value
    Tensor(RuntimeTensor),
    /// A fixed-arity product of values
    Tuple(Vec<Value>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(t) => f.debug_tuple("Tensor").field(&t.ty()).finish(),
            Value::Tuple(fields) => f.debug_tuple("Tuple").field(fields).finish(),
        }
    }
}

impl Value {
    /// Static type of this value
    pub fn ty(&self) -> Type {
        match self {
            Value::Tensor(t) => t.ty(),
            Value::Tuple(fields) => Type::Tuple(fields.iter().map(Value::ty).collect()),
        }
    }

    /// View as a tensor
    pub fn as_tensor(&self) -> Result<&RuntimeTensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            Value::Tuple(_) => Err(RuntimeError::invalid_argument("expected a tensor value")),
        }
    }

    /// View as tuple fields
    pub fn as_tuple(&self) -> Result<&[Value]> {
        match self {
            Value::Tuple(fields) => Ok(fields),
            Value::Tensor(_) => Err(RuntimeError::invalid_argument("expected a tuple value")),
        }
    }

    /// Copy this value's contents into `dest`, field by field for tuples
    pub fn copy_to(&self, dest: &Value) -> Result<()> {
        match (self, dest) {
            (Value::Tensor(src), Value::Tensor(dst)) => src.copy_to(dst),
            (Value::Tuple(src), Value::Tuple(dst)) if src.len() == dst.len() => {
                for (s, d) in src.iter().zip(dst) {
                    s.copy_to(d)?;
                }
                Ok(())
            }
            _ => Err(RuntimeError::invalid_argument(
                "value copy between mismatched kinds",
            )),
        }
    }
}

impl From<RuntimeTensor> for Value {
    fn from(tensor: RuntimeTensor) -> Value {
        Value::Tensor(tensor)
    }
}

/// Whether `value` conforms to a declared parameter or return type.
///
/// `Any` matches everything, tensors must agree on datatype and shape, and
/// tuples match field by field.
pub fn conforms(value: &Type, declared: &Type) -> bool {
    match (value, declared) {
        (_, Type::Any) => true,
        (Type::Tensor(v), Type::Tensor(d)) => v.dtype == d.dtype && v.shape == d.shape,
        (Type::Tuple(v), Type::Tuple(d)) => {
            v.len() == d.len() && v.iter().zip(d).all(|(a, b)| conforms(a, b))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::host_tensor;
    use kmdl_core::{Datatype, Shape};

    #[test]
    fn test_value_types() {
        let t = host_tensor::from_elems(Shape::from_slice(&[2]), &[1.0f32, 2.0]).unwrap();
        let v = Value::Tensor(t);
        assert_eq!(v.ty(), Type::tensor(Datatype::Float32, Shape::from_slice(&[2])));

        let pair = Value::Tuple(vec![v.clone(), v]);
        assert!(matches!(pair.ty(), Type::Tuple(fields) if fields.len() == 2));
        assert!(pair.as_tensor().is_err());
    }

    #[test]
    fn test_conformance() {
        let tensor = Type::tensor(Datatype::Float32, Shape::from_slice(&[2, 3]));
        assert!(conforms(&tensor, &Type::Any));
        assert!(conforms(&tensor, &tensor.clone()));
        assert!(!conforms(&tensor, &Type::tensor(Datatype::Float32, Shape::from_slice(&[3, 2]))));
        assert!(!conforms(&tensor, &Type::tensor(Datatype::Int32, Shape::from_slice(&[2, 3]))));

        let tuple = Type::Tuple(vec![tensor.clone(), Type::Any]);
        let value = Type::Tuple(vec![tensor.clone(), tensor.clone()]);
        assert!(conforms(&value, &tuple));
        assert!(!conforms(&value, &Type::Tuple(vec![tensor])));
    }
}
