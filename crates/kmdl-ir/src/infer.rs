//! Bottom-up type inference over the expression graph

use crate::expr::{ExprId, ExprNode, ExprPayload, ExprRef};
use crate::op::ParameterInfo;
use kmdl_core::{TensorType, Type};
use std::collections::HashMap;

/// Lookup surface handed to operator inferencers.
///
/// Both the argument's type and the argument expression itself are
/// reachable; the latter matters for operators that compute their result
/// shape from a constant argument (reshape targets, permutations, slices).
/// A missing argument reads as `Invalid`.
pub trait InferContext {
    /// Inferred type of the argument bound to `param`
    fn argument_type(&mut self, param: &ParameterInfo) -> Type;

    /// The argument expression bound to `param`, if present
    fn argument(&self, param: &ParameterInfo) -> Option<ExprRef>;
}

/// Reduce an argument to a tensor type, or short-circuit.
///
/// `Any` passes through as `Err(Any)`; invalid or non-tensor arguments
/// short-circuit to `Err(Invalid)`, preserving an upstream reason if one
/// exists.
pub fn tensor_argument(
    context: &mut dyn InferContext,
    param: &ParameterInfo,
) -> std::result::Result<TensorType, Type> {
    match context.argument_type(param) {
        Type::Any => Err(Type::Any),
        Type::Invalid(reason) => Err(Type::Invalid(reason)),
        Type::Tensor(t) => Ok(t),
        _ => Err(Type::invalid(format!("{} must be a tensor", param.name))),
    }
}

/// Read an argument as a constant vector of dimension-like integers.
///
/// Returns `None` when the argument is not a constant (the caller should
/// then report `Any`, since the value is only known at run time).
pub fn constant_dims_argument(
    context: &dyn InferContext,
    param: &ParameterInfo,
) -> Option<Vec<i64>> {
    context
        .argument(param)
        .and_then(|expr| expr.as_constant().and_then(|c| c.as_dims()))
}

/// Read an argument as a constant scalar u8 (a typecode, a dim index)
pub fn constant_u8_argument(context: &dyn InferContext, param: &ParameterInfo) -> Option<u8> {
    context
        .argument(param)
        .and_then(|expr| expr.as_constant().and_then(|c| c.as_u8_scalar()))
}

/// Run type inference on a function expression.
///
/// Traverses the body bottom-up with memoization on node identity, storing
/// every node's inferred type into its `checked_type` slot. Returns `false`
/// when any reachable node infers to `Invalid` (the function is unfit).
/// Running twice yields identical results.
pub fn infer_type(function: &ExprRef) -> bool {
    let mut pass = InferPass::default();
    let ty = pass.infer(function);
    let fit = !pass.saw_invalid && !ty.is_invalid();
    if !fit {
        if let Some(f) = function.as_function() {
            log::debug!("function '{}' failed type inference: {}", f.name(), ty);
        }
    }
    fit
}

#[derive(Default)]
struct InferPass {
    memo: HashMap<ExprId, Type>,
    saw_invalid: bool,
}

impl InferPass {
    fn infer(&mut self, expr: &ExprRef) -> Type {
        if let Some(ty) = self.memo.get(&expr.id()) {
            return ty.clone();
        }

        let ty = match expr.payload() {
            ExprPayload::Var(var) => var.type_annotation(),
            ExprPayload::Constant(constant) => constant.value_type().clone(),
            ExprPayload::Tuple(tuple) => {
                let mut fields = Vec::with_capacity(tuple.fields().len());
                let mut invalid = None;
                for field in tuple.fields() {
                    let field_ty = self.infer(field);
                    if invalid.is_none() {
                        if let Type::Invalid(reason) = &field_ty {
                            invalid = Some(reason.clone());
                        }
                    }
                    fields.push(field_ty);
                }
                match invalid {
                    Some(reason) => Type::Invalid(reason),
                    None => Type::Tuple(fields),
                }
            }
            ExprPayload::Function(function) => {
                for param in function.parameters() {
                    let ty = self.infer(param);
                    param.set_checked_type(ty);
                }
                self.infer(&function.body())
            }
            ExprPayload::Op(_) => Type::Any,
            ExprPayload::Call(call) => self.infer_call(expr, call),
        };

        if ty.is_invalid() {
            self.saw_invalid = true;
        }
        expr.set_checked_type(ty.clone());
        self.memo.insert(expr.id(), ty.clone());
        ty
    }

    fn infer_call(&mut self, _expr: &ExprRef, call: &crate::expr::Call) -> Type {
        let target = call.target();
        match target.payload() {
            ExprPayload::Op(op) => {
                if call.arguments().len() != op.parameters().len() {
                    return Type::invalid(format!(
                        "{} expects {} arguments, got {}",
                        op.node_kind(),
                        op.parameters().len(),
                        call.arguments().len()
                    ));
                }
                // Infer arguments first so the context is a plain lookup.
                let mut types = Vec::with_capacity(call.arguments().len());
                for arg in call.arguments() {
                    types.push(self.infer(arg));
                }
                let mut context = CallContext {
                    arguments: call.arguments(),
                    types,
                };
                let op = op.clone();
                op.infer(&mut context)
            }
            ExprPayload::Function(function) => {
                if call.arguments().len() != function.parameters().len() {
                    return Type::invalid(format!(
                        "function '{}' expects {} arguments, got {}",
                        function.name(),
                        function.parameters().len(),
                        call.arguments().len()
                    ));
                }
                for arg in call.arguments() {
                    self.infer(arg);
                }
                self.infer(&target)
            }
            _ => Type::invalid("call target must be an op or a function"),
        }
    }
}

struct CallContext<'a> {
    arguments: &'a [ExprRef],
    types: Vec<Type>,
}

impl InferContext for CallContext<'_> {
    fn argument_type(&mut self, param: &ParameterInfo) -> Type {
        match self.types.get(param.index) {
            Some(ty) => ty.clone(),
            None => Type::invalid(format!("missing argument '{}'", param.name)),
        }
    }

    fn argument(&self, param: &ParameterInfo) -> Option<ExprRef> {
        self.arguments.get(param.index).cloned()
    }
}
