//! KMDL compiler: lowering from the typed IR to loadable model images
//!
//! Public responsibilities:
//! - Type inference gate: every function must infer cleanly before lowering
//! - Lowering (`compile_module` / `lower_function`): walk a function body
//!   and emit stack-VM text, collecting tensor constants into the module's
//!   constant section
//! - Serialization: assemble a single `"stackvm"` module image through the
//!   model builder, with the entry function and function name table
//!
//! The lowering is deliberately narrow: scalar arithmetic and comparisons,
//! tensor constants, and the tensor-instruction dialect. Accelerator code
//! generation lives behind module kinds and is out of scope here.

#![deny(missing_docs)]

mod codegen;

use kmdl_ir::{infer_type, IrModule};
use kmdl_model::{FunctionBuilder, ModelBuilder, ModuleBuilder};
use kmdl_runtime::stackvm::{encode_name_table, CONSTS_SECTION, FUNCNAME_SECTION, STACKVM_MODULE_KIND};

pub use codegen::{lower_function, LoweredFunction};

/// Compiler error type
#[derive(thiserror::Error, Debug)]
pub enum CompilerError {
    /// A function failed type inference
    #[error("Type inference failed for function '{function}'")]
    TypeInference {
        /// Name of the offending function
        function: String,
    },

    /// An operator the lowering cannot express in the VM dialect
    #[error("Unsupported op in lowering: {kind}")]
    UnsupportedOp {
        /// Operator kind name
        kind: String,
    },

    /// A construct the lowering does not handle
    #[error("Unsupported construct: {0}")]
    Unsupported(String),

    /// An operator configuration argument that must be constant is not
    #[error("Expected a constant {what}")]
    NotConstant {
        /// What kind of argument was expected to be constant
        what: String,
    },

    /// The module has no entry function
    #[error("Module has no entry function")]
    MissingEntry,

    /// IR layer error
    #[error("IR error: {0}")]
    Ir(#[from] kmdl_ir::IrError),

    /// Model serialization error
    #[error("Model error: {0}")]
    Model(#[from] kmdl_model::FormatError),
}

/// Result alias for compiler operations
pub type Result<T> = std::result::Result<T, CompilerError>;

/// Compile an IR module into a loadable model image.
///
/// Produces one `"stackvm"` module holding every function; the IR entry
/// becomes the model entry and function names land in the name table.
pub fn compile_module(module: &IrModule) -> Result<Vec<u8>> {
    let entry = module.entry_index().ok_or(CompilerError::MissingEntry)?;

    let mut consts = Vec::new();
    let mut names = Vec::new();
    let mut functions = Vec::new();
    for function_expr in module.functions() {
        let function = function_expr
            .as_function()
            .expect("module members are functions");
        if !infer_type(function_expr) {
            return Err(CompilerError::TypeInference {
                function: function.name().to_string(),
            });
        }
        log::debug!("lowering function '{}'", function.name());
        names.push(function.name().to_string());
        functions.push(codegen::lower_function(function_expr, &mut consts)?);
    }

    let mut builder = ModelBuilder::new();
    let mut module_builder = ModuleBuilder::new(STACKVM_MODULE_KIND, 1);
    if !consts.is_empty() {
        module_builder.add_merged_section(CONSTS_SECTION, consts);
    }
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    module_builder.add_section(FUNCNAME_SECTION, encode_name_table(&name_refs));
    for lowered in functions {
        module_builder.add_function(
            FunctionBuilder::new(lowered.parameter_types, lowered.return_type)
                .text(lowered.text),
        );
    }
    let module_index = builder.add_module(module_builder);
    builder.set_entry(module_index, entry as u32);
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmdl_ir::ops::math;
    use kmdl_ir::ExprNode;

    #[test]
    fn test_missing_entry_rejected() {
        let module = IrModule::new();
        assert!(matches!(compile_module(&module), Err(CompilerError::MissingEntry)));
    }

    #[test]
    fn test_type_inference_gate() {
        use kmdl_core::{Datatype, Shape, Type};
        let lhs = ExprNode::var("lhs", Type::tensor(Datatype::Float32, Shape::from_slice(&[2])));
        let rhs = ExprNode::var("rhs", Type::tensor(Datatype::Int32, Shape::from_slice(&[2])));
        let body = math::add(lhs.clone(), rhs.clone());
        let f = ExprNode::function("bad", vec![lhs, rhs], body);

        let mut module = IrModule::new();
        let index = module.add_function(f).unwrap();
        module.set_entry(index).unwrap();

        assert!(matches!(
            compile_module(&module),
            Err(CompilerError::TypeInference { .. })
        ));
    }
}
