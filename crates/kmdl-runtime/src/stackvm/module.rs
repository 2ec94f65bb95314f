//! The `"stackvm"` runtime module kind

use super::vm::{cell_to_value, execute, VmContext};
use crate::error::{Result, RuntimeError};
use crate::function::{FunctionBase, RuntimeFunction};
use crate::module::{lookup_custom_call, CustomCallFn, RuntimeModule};
use crate::section::{FunctionInitContext, ModelBytes, ModuleInitContext};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Kind tag of the stack VM module
pub const STACKVM_MODULE_KIND: &str = "stackvm";

/// Name of the constant-tensor section
pub const CONSTS_SECTION: &str = ".consts";

/// Name of the mutable data section
pub const DATA_SECTION: &str = ".data";

/// Name of the custom-call name table section
pub const CUSTOM_SECTION: &str = ".custom";

/// Name of the function name table section
pub const FUNCNAME_SECTION: &str = ".funcname";

/// Factory registered for the `"stackvm"` kind
pub fn create_stackvm_module() -> Box<dyn RuntimeModule> {
    Box::new(StackVmModule {
        shared: Arc::new(StackVmShared {
            state: RwLock::new(StackVmState {
                consts: None,
                custom: Vec::new(),
                text: Vec::new(),
            }),
            data: Mutex::new(Vec::new()),
        }),
        names: Vec::new(),
        function_count: 0,
    })
}

struct StackVmState {
    consts: Option<ModelBytes>,
    custom: Vec<CustomCallFn>,
    // Per-function text, indexed by load order.
    text: Vec<ModelBytes>,
}

struct StackVmShared {
    state: RwLock<StackVmState>,
    // The module's indirect-addressing region, sized by the .data
    // section's memory_size and shared by every function.
    data: Mutex<Vec<u8>>,
}

struct StackVmModule {
    shared: Arc<StackVmShared>,
    names: Vec<String>,
    function_count: usize,
}

impl RuntimeModule for StackVmModule {
    fn kind(&self) -> &str {
        STACKVM_MODULE_KIND
    }

    fn initialize_before_functions(&mut self, context: &mut ModuleInitContext<'_>) -> Result<()> {
        let mut state = self.shared.state.write();

        if let Some(section) = optional_section(context, CONSTS_SECTION)? {
            log::debug!(
                "stackvm: constant section of {} bytes ({:?})",
                section.bytes.len(),
                section.origin
            );
            state.consts = Some(section.bytes);
        }

        if let Some(section) = optional_section(context, DATA_SECTION)? {
            let mut data = vec![0u8; section.header.memory_size as usize];
            let init = section.bytes.as_slice();
            if init.len() > data.len() {
                return Err(RuntimeError::invalid_program(
                    ".data body exceeds its memory size",
                ));
            }
            data[..init.len()].copy_from_slice(init);
            *self.shared.data.lock() = data;
        }

        if let Some(section) = optional_section(context, CUSTOM_SECTION)? {
            for name in parse_name_table(section.bytes.as_slice())? {
                state.custom.push(lookup_custom_call(STACKVM_MODULE_KIND, &name)?);
            }
        }

        drop(state);
        if let Some(section) = optional_section(context, FUNCNAME_SECTION)? {
            self.names = parse_name_table(section.bytes.as_slice())?;
        }

        Ok(())
    }

    fn create_function(
        &mut self,
        base: FunctionBase,
        context: &mut FunctionInitContext<'_, '_>,
    ) -> Result<Box<dyn RuntimeFunction>> {
        if base.header().entrypoint > base.header().text_size {
            return Err(RuntimeError::invalid_program(
                "entrypoint outside function text",
            ));
        }
        let text = context.text()?;
        let mut state = self.shared.state.write();
        let index = state.text.len();
        state.text.push(text);
        drop(state);
        self.function_count += 1;

        Ok(Box::new(StackVmFunction {
            base,
            index,
            shared: self.shared.clone(),
        }))
    }

    fn initialize_after_functions(&mut self, _context: &mut ModuleInitContext<'_>) -> Result<()> {
        if !self.names.is_empty() && self.names.len() != self.function_count {
            return Err(RuntimeError::invalid_program(format!(
                "function name table has {} entries for {} functions",
                self.names.len(),
                self.function_count
            )));
        }
        Ok(())
    }

    fn function_names(&self) -> &[String] {
        &self.names
    }
}

struct StackVmFunction {
    base: FunctionBase,
    index: usize,
    shared: Arc<StackVmShared>,
}

impl RuntimeFunction for StackVmFunction {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn invoke_core(
        &mut self,
        parameters: &[Value],
        return_value: Option<Value>,
    ) -> Result<Value> {
        let state = self.shared.state.read();
        let text = state.text[self.index].clone();
        let consts = state.consts.clone();
        let custom = state.custom.clone();
        drop(state);

        let context = VmContext {
            text: text.as_slice(),
            consts: consts.as_ref(),
            data: &self.shared.data,
            custom: &custom,
        };
        let cell = execute(&context, self.base.header().entrypoint as usize, parameters)?;
        let result = cell_to_value(cell, self.base.return_type())?;

        match return_value {
            Some(out) => {
                result.copy_to(&out)?;
                Ok(out)
            }
            None => Ok(result),
        }
    }
}

// A section that may legitimately be absent; any failure other than
// NotFound still aborts the load.
fn optional_section(
    context: &mut ModuleInitContext<'_>,
    name: &str,
) -> Result<Option<crate::section::ResolvedSection>> {
    match context.section(name) {
        Ok(section) => Ok(Some(section)),
        Err(err) if err.kind() == crate::error::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

// Null-terminated names back to back; the table ends with an empty name or
// at the end of the section.
fn parse_name_table(bytes: &[u8]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut rest = bytes;
    while let Some(end) = rest.iter().position(|&b| b == 0) {
        if end == 0 {
            break;
        }
        let name = std::str::from_utf8(&rest[..end])
            .map_err(|_| RuntimeError::invalid_program("non-UTF-8 name in name table"))?;
        names.push(name.to_string());
        rest = &rest[end + 1..];
    }
    Ok(names)
}

/// Encode a name table section body
pub fn encode_name_table(names: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_table_roundtrip() {
        let bytes = encode_name_table(&["main", "helper"]);
        let names = parse_name_table(&bytes).unwrap();
        assert_eq!(names, vec!["main".to_string(), "helper".to_string()]);

        assert!(parse_name_table(&[]).unwrap().is_empty());
        assert!(parse_name_table(&[0]).unwrap().is_empty());
    }
}
