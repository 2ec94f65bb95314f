//! Built-in operator dialects

pub mod math;
pub mod tensors;

use crate::op::OpSpec;

/// All built-in operator specs, used to seed the op registry
pub fn builtin_ops() -> Vec<OpSpec> {
    let mut specs = math::specs();
    specs.extend(tensors::specs());
    specs
}
