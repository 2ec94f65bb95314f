//! Core primitives shared by the KMDL compiler and runtime
//!
//! This crate holds the vocabulary both sides of the toolchain speak:
//! scalar datatypes with stable wire codes, small-vector shapes and strides,
//! the type lattice used by inference and by runtime argument checking, and
//! the object-kind tags used for safe downcasting of shared handles.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod datatypes;
pub mod object;
pub mod scalar;
pub mod shape;
pub mod types;

pub use datatypes::{Datatype, IntoDatatype};
pub use object::ObjectKind;
pub use scalar::{FromScalar, Scalar};
pub use shape::{
    bytes_of, bytes_of_strided, default_strides, is_contiguous, max_addressable, num_elements,
    Shape, Strides,
};
pub use types::{broadcast, TensorType, Type};

/// Core crate version for compatibility checking
pub const CORE_VERSION: u32 = 1;
