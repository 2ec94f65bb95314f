//! Tagged scalar values
//!
//! Used by the interpreter options dict and by scalar constant
//! construction. A scalar knows its datatype and can serialize itself to
//! little-endian bytes.

use crate::datatypes::Datatype;
use half::{bf16, f16};
use smallvec::SmallVec;

/// A single typed scalar value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// Signed 8-bit value
    I8(i8),
    /// Signed 16-bit value
    I16(i16),
    /// Signed 32-bit value
    I32(i32),
    /// Signed 64-bit value
    I64(i64),
    /// Unsigned 8-bit value
    U8(u8),
    /// Unsigned 16-bit value
    U16(u16),
    /// Unsigned 32-bit value
    U32(u32),
    /// Unsigned 64-bit value
    U64(u64),
    /// Half-precision float value
    F16(f16),
    /// Brain-float value
    BF16(bf16),
    /// Single-precision float value
    F32(f32),
    /// Double-precision float value
    F64(f64),
    /// Boolean value
    Bool(bool),
}

impl Scalar {
    /// Datatype of this scalar
    pub const fn dtype(&self) -> Datatype {
        match self {
            Scalar::I8(_) => Datatype::Int8,
            Scalar::I16(_) => Datatype::Int16,
            Scalar::I32(_) => Datatype::Int32,
            Scalar::I64(_) => Datatype::Int64,
            Scalar::U8(_) => Datatype::UInt8,
            Scalar::U16(_) => Datatype::UInt16,
            Scalar::U32(_) => Datatype::UInt32,
            Scalar::U64(_) => Datatype::UInt64,
            Scalar::F16(_) => Datatype::Float16,
            Scalar::BF16(_) => Datatype::BFloat16,
            Scalar::F32(_) => Datatype::Float32,
            Scalar::F64(_) => Datatype::Float64,
            Scalar::Bool(_) => Datatype::Bool,
        }
    }

    /// Little-endian bytes of this scalar, `dtype().size_bytes()` long
    pub fn to_le_bytes(&self) -> SmallVec<[u8; 8]> {
        match *self {
            Scalar::I8(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::I16(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::I32(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::I64(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::U8(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::U16(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::U32(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::U64(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::F16(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::BF16(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::F32(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::F64(v) => SmallVec::from_slice(&v.to_le_bytes()),
            Scalar::Bool(v) => SmallVec::from_slice(&[v as u8]),
        }
    }
}

/// Typed extraction from a [`Scalar`]
pub trait FromScalar: Sized {
    /// Extract `Self` if the scalar holds exactly this type
    fn from_scalar(scalar: &Scalar) -> Option<Self>;
}

macro_rules! impl_scalar_conversions {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Scalar {
                fn from(v: $t) -> Scalar {
                    Scalar::$variant(v)
                }
            }

            impl FromScalar for $t {
                fn from_scalar(scalar: &Scalar) -> Option<$t> {
                    match scalar {
                        Scalar::$variant(v) => Some(*v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_scalar_conversions! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f16 => F16,
    bf16 => BF16,
    f32 => F32,
    f64 => F64,
    bool => Bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_and_bytes() {
        let s = Scalar::F32(1.5);
        assert_eq!(s.dtype(), Datatype::Float32);
        assert_eq!(s.to_le_bytes().as_slice(), &1.5f32.to_le_bytes());
        assert_eq!(s.to_le_bytes().len(), s.dtype().size_bytes());
    }

    #[test]
    fn test_conversions() {
        let s: Scalar = 42i32.into();
        assert_eq!(i32::from_scalar(&s), Some(42));
        assert_eq!(f32::from_scalar(&s), None);

        let b: Scalar = true.into();
        assert_eq!(b.to_le_bytes().as_slice(), &[1]);
    }
}
