//! KMDL intermediate representation
//!
//! A typed expression graph with shared subexpressions, the data model every
//! compiler pass rewrites. Nodes are held by shared strong references and
//! are immutable after construction except for a small set of documented
//! mutator hooks; traversals memoize on node identity so each node is
//! visited once.
//!
//! Layout:
//! - [`expr`]: the expression node sum and its constructors
//! - [`op`]: operator descriptors, parameter info, and the op registry
//! - [`ops`]: the built-in `math` and `tensors` dialects
//! - [`infer`]: bottom-up type inference
//! - [`visitor`]: memoized expression and type traversals
//! - [`module`]: the function container

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod expr;
pub mod infer;
pub mod module;
pub mod op;
pub mod ops;
pub mod visitor;

pub use expr::{Call, Constant, ExprId, ExprNode, ExprPayload, ExprRef, Function, Tuple, Var};
pub use infer::{infer_type, InferContext};
pub use module::IrModule;
pub use op::{InferFn, NodeKind, Op, OpSpec, ParameterInfo};
pub use visitor::{ExprVisitor, TypeVisitor, Traversal};

/// IR-wide result type
pub type Result<T> = std::result::Result<T, IrError>;

/// IR construction errors
#[derive(thiserror::Error, Debug)]
pub enum IrError {
    /// Constant payload does not match its declared type
    #[error("Constant data size mismatch: expected {expected} bytes, got {actual}")]
    ConstantSizeMismatch {
        /// Bytes the declared type requires
        expected: usize,
        /// Bytes actually supplied
        actual: usize,
    },

    /// A call target that is neither an op nor a function
    #[error("Invalid call target: {kind:?}")]
    InvalidCallTarget {
        /// Kind of the offending node
        kind: kmdl_core::ObjectKind,
    },

    /// Generic IR error
    #[error("IR error: {0}")]
    Message(String),
}
