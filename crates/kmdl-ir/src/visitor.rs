//! Memoized traversals over expressions and types
//!
//! A [`Traversal`] walks a DAG depth-first in post-order, visiting every
//! node exactly once; repeat encounters of a shared subexpression return the
//! order number recorded on first visit.

use crate::expr::{Call, Constant, ExprId, ExprPayload, ExprRef, Function, Tuple, Var};
use crate::op::Op;
use kmdl_core::{TensorType, Type};
use std::collections::HashMap;

/// Per-variant visitor callbacks; override the arms you need
#[allow(unused_variables)]
pub trait ExprVisitor {
    /// Visit a variable node
    fn visit_var(&mut self, expr: &ExprRef, var: &Var) {}
    /// Visit a constant node
    fn visit_constant(&mut self, expr: &ExprRef, constant: &Constant) {}
    /// Visit a call node (children already visited)
    fn visit_call(&mut self, expr: &ExprRef, call: &Call) {}
    /// Visit a function node (parameters and body already visited)
    fn visit_function(&mut self, expr: &ExprRef, function: &Function) {}
    /// Visit a tuple node (fields already visited)
    fn visit_tuple(&mut self, expr: &ExprRef, tuple: &Tuple) {}
    /// Visit an operator descriptor node
    fn visit_op(&mut self, expr: &ExprRef, op: &Op) {}
}

/// Single-visit traversal state
#[derive(Default)]
pub struct Traversal {
    visited: HashMap<ExprId, usize>,
    next_order: usize,
}

impl Traversal {
    /// Create an empty traversal
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct nodes visited so far
    pub fn visited_count(&self) -> usize {
        self.next_order
    }

    /// Order number recorded for a node, if it has been visited
    pub fn order_of(&self, expr: &ExprRef) -> Option<usize> {
        self.visited.get(&expr.id()).copied()
    }

    /// Walk `expr` depth-first post-order, visiting each node once.
    ///
    /// Returns the node's visit order number. Children are visited in
    /// declared order: a call's target before its arguments, a function's
    /// parameters before its body.
    pub fn walk<V: ExprVisitor>(&mut self, expr: &ExprRef, visitor: &mut V) -> usize {
        if let Some(&order) = self.visited.get(&expr.id()) {
            return order;
        }

        match expr.payload() {
            ExprPayload::Var(var) => visitor.visit_var(expr, var),
            ExprPayload::Constant(constant) => visitor.visit_constant(expr, constant),
            ExprPayload::Op(op) => visitor.visit_op(expr, op),
            ExprPayload::Call(call) => {
                self.walk(&call.target(), visitor);
                for arg in call.arguments() {
                    self.walk(arg, visitor);
                }
                visitor.visit_call(expr, call);
            }
            ExprPayload::Function(function) => {
                for param in function.parameters() {
                    self.walk(param, visitor);
                }
                self.walk(&function.body(), visitor);
                visitor.visit_function(expr, function);
            }
            ExprPayload::Tuple(tuple) => {
                for field in tuple.fields() {
                    self.walk(field, visitor);
                }
                visitor.visit_tuple(expr, tuple);
            }
        }

        let order = self.next_order;
        self.next_order += 1;
        self.visited.insert(expr.id(), order);
        order
    }
}

/// Per-variant visitor over the type sum
#[allow(unused_variables)]
pub trait TypeVisitor {
    /// Visit the `Any` type
    fn visit_any(&mut self) {}
    /// Visit an `Invalid` type
    fn visit_invalid(&mut self, reason: &str) {}
    /// Visit a primitive type
    fn visit_prim(&mut self, dtype: kmdl_core::Datatype) {}
    /// Visit a tensor type
    fn visit_tensor(&mut self, tensor: &TensorType) {}
    /// Visit a tuple type (fields already visited)
    fn visit_tuple_type(&mut self, fields: &[Type]) {}
}

/// Walk a type depth-first, dispatching per variant
pub fn walk_type<V: TypeVisitor>(ty: &Type, visitor: &mut V) {
    match ty {
        Type::Any => visitor.visit_any(),
        Type::Invalid(reason) => visitor.visit_invalid(reason),
        Type::Prim(dt) => visitor.visit_prim(*dt),
        Type::Tensor(t) => visitor.visit_tensor(t),
        Type::Tuple(fields) => {
            for field in fields {
                walk_type(field, visitor);
            }
            visitor.visit_tuple_type(fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprNode;
    use crate::ops::math;
    use kmdl_core::Datatype;

    #[derive(Default)]
    struct Counter {
        vars: usize,
        constants: usize,
        calls: usize,
        ops: usize,
    }

    impl ExprVisitor for Counter {
        fn visit_var(&mut self, _: &ExprRef, _: &Var) {
            self.vars += 1;
        }
        fn visit_constant(&mut self, _: &ExprRef, _: &Constant) {
            self.constants += 1;
        }
        fn visit_call(&mut self, _: &ExprRef, _: &Call) {
            self.calls += 1;
        }
        fn visit_op(&mut self, _: &ExprRef, _: &Op) {
            self.ops += 1;
        }
    }

    #[test]
    fn test_shared_node_visited_once() {
        let x = ExprNode::var("x", Type::scalar_tensor(Datatype::Float32));
        let shared = math::mul(x.clone(), x.clone());
        let body = math::add(shared.clone(), shared.clone());
        let f = ExprNode::function("f", vec![x], body);

        let mut counter = Counter::default();
        let mut traversal = Traversal::new();
        traversal.walk(&f, &mut counter);

        // x once, shared mul once, outer add once, two op nodes.
        assert_eq!(counter.vars, 1);
        assert_eq!(counter.calls, 2);
        assert_eq!(counter.ops, 2);
    }

    #[test]
    fn test_post_order_numbers() {
        let a = ExprNode::constant_scalar(1.0f32);
        let b = ExprNode::constant_scalar(2.0f32);
        let sum = math::add(a.clone(), b.clone());

        let mut counter = Counter::default();
        let mut traversal = Traversal::new();
        let root_order = traversal.walk(&sum, &mut counter);

        let a_order = traversal.order_of(&a).unwrap();
        let b_order = traversal.order_of(&b).unwrap();
        assert!(a_order < root_order);
        assert!(b_order < root_order);
        assert!(a_order < b_order);
        // Revisiting returns the recorded number without revisiting children.
        assert_eq!(traversal.walk(&sum, &mut counter), root_order);
        assert_eq!(counter.constants, 2);
    }

    #[test]
    fn test_type_visitor() {
        #[derive(Default)]
        struct Tensors(usize);
        impl TypeVisitor for Tensors {
            fn visit_tensor(&mut self, _: &TensorType) {
                self.0 += 1;
            }
        }

        let ty = Type::Tuple(vec![
            Type::scalar_tensor(Datatype::Float32),
            Type::Tuple(vec![Type::scalar_tensor(Datatype::Int8), Type::Any]),
        ]);
        let mut v = Tensors::default();
        walk_type(&ty, &mut v);
        assert_eq!(v.0, 2);
    }
}
