//! Operator descriptors and the process-wide op registry

use crate::infer::InferContext;
use kmdl_core::Type;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Globally unique operator kind within a dialect.
///
/// Compared and hashed by `id` only; the name is diagnostic.
#[derive(Debug, Clone, Copy)]
pub struct NodeKind {
    /// Unique numeric id
    pub id: u32,
    /// Dialect-qualified name, e.g. `"math.add"`
    pub name: &'static str,
}

impl PartialEq for NodeKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeKind {}

impl Hash for NodeKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Declared parameter of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterInfo {
    /// Parameter name, for diagnostics and context lookups
    pub name: &'static str,
    /// Zero-based position in the argument list
    pub index: usize,
}

impl ParameterInfo {
    /// Create a parameter descriptor
    pub const fn new(name: &'static str, index: usize) -> Self {
        Self { name, index }
    }
}

/// Type inferencer of an operator: computes the call's result type from the
/// argument types (and, for some operators, constant argument values)
pub type InferFn = fn(&Op, &mut dyn InferContext) -> Type;

/// Operator descriptor payload of an `Op` expression node
#[derive(Clone)]
pub struct Op {
    kind: NodeKind,
    parameters: &'static [ParameterInfo],
    infer: InferFn,
}

impl Op {
    /// Create an operator descriptor
    pub const fn new(kind: NodeKind, parameters: &'static [ParameterInfo], infer: InferFn) -> Self {
        Self {
            kind,
            parameters,
            infer,
        }
    }

    /// Operator kind
    pub fn node_kind(&self) -> NodeKind {
        self.kind
    }

    /// Declared parameters, in order
    pub fn parameters(&self) -> &'static [ParameterInfo] {
        self.parameters
    }

    /// Run this operator's type inferencer
    pub fn infer(&self, context: &mut dyn InferContext) -> Type {
        (self.infer)(self, context)
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("kind", &self.kind)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Registry entry for an operator kind
#[derive(Debug, Clone)]
pub struct OpSpec {
    /// Operator kind
    pub kind: NodeKind,
    /// Declared parameters
    pub parameters: &'static [ParameterInfo],
    /// Type inferencer
    pub infer: InferFn,
}

impl OpSpec {
    /// Instantiate an [`Op`] from this spec
    pub fn instantiate(&self) -> Op {
        Op::new(self.kind, self.parameters, self.infer)
    }
}

static OP_REGISTRY: Lazy<RwLock<HashMap<u32, OpSpec>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for spec in crate::ops::builtin_ops() {
        map.insert(spec.kind.id, spec);
    }
    RwLock::new(map)
});

/// Register an additional operator kind.
///
/// Intended to run at startup, before any lookup; later registrations for
/// an existing id replace the previous spec.
pub fn register_op(spec: OpSpec) {
    OP_REGISTRY.write().insert(spec.kind.id, spec);
}

/// Look up an operator spec by kind
pub fn lookup_op(kind: NodeKind) -> Option<OpSpec> {
    OP_REGISTRY.read().get(&kind.id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;

    #[test]
    fn test_node_kind_identity() {
        let a = NodeKind { id: 7, name: "math.add" };
        let renamed = NodeKind { id: 7, name: "other" };
        let b = NodeKind { id: 8, name: "math.add" };
        assert_eq!(a, renamed);
        assert_ne!(a, b);
    }

    #[test]
    fn test_builtin_lookup() {
        let spec = lookup_op(ops::math::ADD).expect("add registered");
        assert_eq!(spec.kind, ops::math::ADD);
        assert_eq!(spec.parameters.len(), 2);
        assert!(lookup_op(NodeKind { id: 0xDEAD_BEEF, name: "missing" }).is_none());
    }

    #[test]
    fn test_register_custom() {
        const KIND: NodeKind = NodeKind { id: 0x7000_0001, name: "custom.noop" };
        const PARAMS: &[ParameterInfo] = &[ParameterInfo::new("input", 0)];
        fn infer(_: &Op, _: &mut dyn InferContext) -> Type {
            Type::Any
        }
        register_op(OpSpec { kind: KIND, parameters: PARAMS, infer });
        let spec = lookup_op(KIND).expect("registered");
        assert_eq!(spec.parameters[0].name, "input");
    }
}
