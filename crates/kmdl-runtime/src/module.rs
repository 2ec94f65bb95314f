//! Runtime modules, the module-kind registry, and the custom-call registry

use crate::error::{Result, RuntimeError};
use crate::function::{FunctionBase, RuntimeFunction};
use crate::section::{FunctionInitContext, ModuleInitContext};
use crate::value::Value;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Summary of a loaded module, visible to other modules during the
/// cross-resolution pass
pub struct ModuleSummary {
    /// Module kind tag
    pub kind: String,
    /// Number of functions the module loaded
    pub functions: usize,
}

/// A unit of loadable code with its sections and functions.
///
/// Initialization order per module: `initialize_before_functions`, one
/// `create_function` per function record, `initialize_after_functions`.
/// After every module exists, `resolve` runs once per module with a
/// directory of all modules.
pub trait RuntimeModule: Send {
    /// The kind tag this module executes
    fn kind(&self) -> &str;

    /// Read module-global sections before any function loads
    fn initialize_before_functions(&mut self, context: &mut ModuleInitContext<'_>) -> Result<()> {
        let _ = context;
        Ok(())
    }

    /// Build one function from its record
    fn create_function(
        &mut self,
        base: FunctionBase,
        context: &mut FunctionInitContext<'_, '_>,
    ) -> Result<Box<dyn RuntimeFunction>>;

    /// Finish initialization after all functions are loaded
    fn initialize_after_functions(&mut self, context: &mut ModuleInitContext<'_>) -> Result<()> {
        let _ = context;
        Ok(())
    }

    /// Bind references to other modules by index
    fn resolve(&mut self, directory: &[ModuleSummary]) -> Result<()> {
        let _ = directory;
        Ok(())
    }

    /// Names of this module's functions, parallel to their indices.
    ///
    /// Modules without a name table report an empty slice.
    fn function_names(&self) -> &[String] {
        &[]
    }
}

impl fmt::Debug for dyn RuntimeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RuntimeModule").field(&self.kind()).finish()
    }
}

/// Factory creating an empty module of some kind
pub type ModuleFactory = fn() -> Box<dyn RuntimeModule>;

static MODULE_KINDS: Lazy<RwLock<HashMap<String, ModuleFactory>>> = Lazy::new(|| {
    let mut map: HashMap<String, ModuleFactory> = HashMap::new();
    map.insert(
        crate::stackvm::STACKVM_MODULE_KIND.to_string(),
        crate::stackvm::create_stackvm_module,
    );
    RwLock::new(map)
});

/// Register a module kind.
///
/// Intended to run at startup, before any interpreter is constructed.
pub fn register_module_kind(kind: &str, factory: ModuleFactory) {
    MODULE_KINDS.write().insert(kind.to_string(), factory);
}

/// Instantiate an empty module for a kind tag
pub fn create_module(kind: &str) -> Result<Box<dyn RuntimeModule>> {
    let factory = MODULE_KINDS
        .read()
        .get(kind)
        .copied()
        .ok_or_else(|| RuntimeError::not_found(format!("module kind '{}'", kind)))?;
    Ok(factory())
}

/// A named native extension reachable through the VM's custom-call path
pub type CustomCallFn = fn(&[Value]) -> Result<Value>;

static CUSTOM_CALLS: Lazy<RwLock<HashMap<(String, String), CustomCallFn>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a named custom call for a module kind.
///
/// Intended to run at startup; modules resolve their custom-call tables
/// against this registry while loading.
pub fn register_custom_call(kind: &str, name: &str, function: CustomCallFn) {
    CUSTOM_CALLS
        .write()
        .insert((kind.to_string(), name.to_string()), function);
}

/// Look up a custom call by module kind and name
pub fn lookup_custom_call(kind: &str, name: &str) -> Result<CustomCallFn> {
    CUSTOM_CALLS
        .read()
        .get(&(kind.to_string(), name.to_string()))
        .copied()
        .ok_or_else(|| RuntimeError::not_found(format!("custom call '{}' for kind '{}'", name, kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stackvm_kind_registered() {
        assert!(create_module("stackvm").is_ok());
        let err = create_module("npu").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_custom_call_registry() {
        fn noop(args: &[Value]) -> Result<Value> {
            Ok(args[0].clone())
        }
        register_custom_call("stackvm", "test.identity", noop);
        assert!(lookup_custom_call("stackvm", "test.identity").is_ok());
        assert!(lookup_custom_call("stackvm", "test.missing").is_err());
    }
}
