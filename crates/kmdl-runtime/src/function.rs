//! Runtime functions and the invocation protocol

use crate::error::{Result, RuntimeError};
use crate::value::{conforms, Value};
use kmdl_core::Type;
use kmdl_model::FunctionHeader;

/// Signature and header state shared by every function implementation
pub struct FunctionBase {
    header: FunctionHeader,
    parameter_types: Vec<Type>,
    return_type: Type,
}

impl FunctionBase {
    /// Create from a parsed record
    pub fn new(header: FunctionHeader, parameter_types: Vec<Type>, return_type: Type) -> Self {
        Self {
            header,
            parameter_types,
            return_type,
        }
    }

    /// The function record header
    pub fn header(&self) -> &FunctionHeader {
        &self.header
    }

    /// Number of declared parameters
    pub fn parameters_size(&self) -> u32 {
        self.parameter_types.len() as u32
    }

    /// Declared type of parameter `index`
    pub fn parameter_type(&self, index: usize) -> Result<&Type> {
        self.parameter_types.get(index).ok_or_else(|| {
            RuntimeError::invalid_argument(format!(
                "parameter index {} out of range ({} declared)",
                index,
                self.parameter_types.len()
            ))
        })
    }

    /// Declared return type
    pub fn return_type(&self) -> &Type {
        &self.return_type
    }
}

/// A loaded, invocable function.
///
/// `invoke` validates arguments against the declared signature and then
/// dispatches to the module-specific `invoke_core`. On failure the error is
/// returned and any output tensors must be considered invalid.
pub trait RuntimeFunction: Send {
    /// Shared signature state
    fn base(&self) -> &FunctionBase;

    /// Module-specific execution
    fn invoke_core(
        &mut self,
        parameters: &[Value],
        return_value: Option<Value>,
    ) -> Result<Value>;

    /// Number of declared parameters
    fn parameters_size(&self) -> u32 {
        self.base().parameters_size()
    }

    /// Declared type of parameter `index`
    fn parameter_type(&self, index: usize) -> Result<Type> {
        self.base().parameter_type(index).cloned()
    }

    /// Declared return type
    fn return_type(&self) -> Type {
        self.base().return_type().clone()
    }

    /// Validate arguments and execute.
    ///
    /// When `return_value` is given the result is written into it in place
    /// and the filled value is returned; otherwise the implementation
    /// allocates a result matching the declared return type.
    fn invoke(&mut self, parameters: &[Value], return_value: Option<Value>) -> Result<Value> {
        let base = self.base();
        if parameters.len() != base.parameters_size() as usize {
            return Err(RuntimeError::invalid_argument(format!(
                "function expects {} parameters, got {}",
                base.parameters_size(),
                parameters.len()
            )));
        }
        for (index, value) in parameters.iter().enumerate() {
            let declared = base.parameter_type(index)?;
            let actual = value.ty();
            if !conforms(&actual, declared) {
                return Err(RuntimeError::invalid_argument(format!(
                    "parameter {} has type {}, declared {}",
                    index, actual, declared
                )));
            }
        }
        if let Some(ret) = &return_value {
            if !conforms(&ret.ty(), base.return_type()) {
                return Err(RuntimeError::invalid_argument(format!(
                    "return value has type {}, declared {}",
                    ret.ty(),
                    base.return_type()
                )));
            }
        }
        self.invoke_core(parameters, return_value)
    }
}
