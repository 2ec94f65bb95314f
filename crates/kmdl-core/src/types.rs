//! The type lattice: any at the top, invalid at the bottom

use crate::datatypes::Datatype;
use crate::shape::Shape;
use core::fmt;

/// Type of a tensor-valued expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    /// Element datatype
    pub dtype: Datatype,
    /// Shape; empty for scalar tensors
    pub shape: Shape,
}

impl TensorType {
    /// Create a tensor type
    pub fn new(dtype: Datatype, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    /// Scalar tensor type (empty shape)
    pub fn scalar(dtype: Datatype) -> Self {
        Self {
            dtype,
            shape: Shape::new(),
        }
    }

    /// Whether this is a scalar type
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }
}

/// The type of an expression or runtime value.
///
/// `Any` is the top of the lattice (used before inference resolves a
/// concrete type), `Invalid` the bottom (a failed inference step, carrying a
/// human-readable reason). Comparison is structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Unresolved; matches anything
    Any,
    /// Failed inference, with the upstream reason
    Invalid(String),
    /// A bare scalar datatype
    Prim(Datatype),
    /// A tensor with element datatype and shape
    Tensor(TensorType),
    /// A fixed-arity product of types; may nest
    Tuple(Vec<Type>),
}

impl Type {
    /// Construct an invalid type with a reason
    pub fn invalid(reason: impl Into<String>) -> Type {
        Type::Invalid(reason.into())
    }

    /// Tensor type shorthand
    pub fn tensor(dtype: Datatype, shape: impl Into<Shape>) -> Type {
        Type::Tensor(TensorType::new(dtype, shape))
    }

    /// Scalar tensor type shorthand
    pub fn scalar_tensor(dtype: Datatype) -> Type {
        Type::Tensor(TensorType::scalar(dtype))
    }

    /// Whether this is the `Any` type
    pub fn is_any(&self) -> bool {
        matches!(self, Type::Any)
    }

    /// Whether this is an `Invalid` type
    pub fn is_invalid(&self) -> bool {
        matches!(self, Type::Invalid(_))
    }

    /// View as a tensor type, if it is one
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// View as tuple fields, if this is a tuple type
    pub fn as_tuple(&self) -> Option<&[Type]> {
        match self {
            Type::Tuple(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<TensorType> for Type {
    fn from(t: TensorType) -> Type {
        Type::Tensor(t)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.shape.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Any => write!(f, "any"),
            Type::Invalid(reason) => write!(f, "invalid({})", reason),
            Type::Prim(dt) => write!(f, "{}", dt),
            Type::Tensor(t) => write!(f, "{}", t),
            Type::Tuple(fields) => {
                write!(f, "(")?;
                for (i, t) in fields.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Broadcast two tensor types, NumPy style.
///
/// Shapes are aligned by the right; corresponding dimensions must be equal
/// or one of them 1. Datatypes must match.
pub fn broadcast(lhs: &TensorType, rhs: &TensorType) -> Type {
    if lhs.dtype != rhs.dtype {
        return Type::invalid("datatype mismatch");
    }

    let rank = lhs.shape.len().max(rhs.shape.len());
    let mut dims = Shape::from_elem(0, rank);
    for i in 0..rank {
        let l = dim_from_right(&lhs.shape, rank, i);
        let r = dim_from_right(&rhs.shape, rank, i);
        dims[i] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return Type::invalid("shapes not broadcastable"),
        };
    }
    Type::tensor(lhs.dtype, dims)
}

// Dimension at aligned position `i` (0 = leftmost of the result), with
// missing leading dims read as 1.
fn dim_from_right(shape: &[usize], rank: usize, i: usize) -> usize {
    let pad = rank - shape.len();
    if i < pad {
        1
    } else {
        shape[i - pad]
    }
}
