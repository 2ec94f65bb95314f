//! The function container

use crate::expr::ExprRef;
use crate::{IrError, Result};

/// A module: named functions plus one entry point.
///
/// The entry is the public symbol the runtime invokes; it must be one of
/// the contained functions.
#[derive(Default)]
pub struct IrModule {
    functions: Vec<ExprRef>,
    entry: Option<usize>,
}

impl IrModule {
    /// Create an empty module
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a function, returning its index
    pub fn add_function(&mut self, function: ExprRef) -> Result<usize> {
        if function.as_function().is_none() {
            return Err(IrError::Message("module members must be functions".into()));
        }
        self.functions.push(function);
        Ok(self.functions.len() - 1)
    }

    /// Contained functions, in insertion order
    pub fn functions(&self) -> &[ExprRef] {
        &self.functions
    }

    /// Find a function by name
    pub fn find_function(&self, name: &str) -> Option<&ExprRef> {
        self.functions
            .iter()
            .find(|f| f.as_function().map(|f| f.name()) == Some(name))
    }

    /// The entry function, if one has been set
    pub fn entry(&self) -> Option<&ExprRef> {
        self.entry.map(|i| &self.functions[i])
    }

    /// Index of the entry function
    pub fn entry_index(&self) -> Option<usize> {
        self.entry
    }

    /// Mark a contained function as the entry
    pub fn set_entry(&mut self, index: usize) -> Result<()> {
        if index >= self.functions.len() {
            return Err(IrError::Message(format!(
                "entry index {} out of range ({} functions)",
                index,
                self.functions.len()
            )));
        }
        self.entry = Some(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprNode;
    use kmdl_core::Type;

    fn sample_function(name: &str) -> ExprRef {
        ExprNode::function(name, vec![], ExprNode::constant_scalar(0i32))
    }

    #[test]
    fn test_add_and_entry() {
        let mut module = IrModule::new();
        let main = module.add_function(sample_function("main")).unwrap();
        module.add_function(sample_function("helper")).unwrap();
        module.set_entry(main).unwrap();

        assert_eq!(module.functions().len(), 2);
        let entry = module.entry().unwrap();
        assert_eq!(entry.as_function().unwrap().name(), "main");
        assert!(module.find_function("helper").is_some());
        assert!(module.find_function("missing").is_none());
    }

    #[test]
    fn test_entry_must_be_member() {
        let mut module = IrModule::new();
        module.add_function(sample_function("main")).unwrap();
        assert!(module.set_entry(3).is_err());
    }

    #[test]
    fn test_members_must_be_functions() {
        let mut module = IrModule::new();
        let not_a_function = ExprNode::var("x", Type::Any);
        assert!(module.add_function(not_a_function).is_err());
    }
}
