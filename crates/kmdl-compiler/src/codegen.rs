//! Lowering of one typed function body to stack-VM text

use crate::{CompilerError, Result};
use kmdl_core::{bytes_of, Datatype, TensorType, Type};
use kmdl_ir::ops::{math, tensors};
use kmdl_ir::{ExprId, ExprNode, ExprPayload, ExprRef, NodeKind};
use kmdl_runtime::stackvm::{
    BinaryOpKind, Emitter, Inst, PadDim, RuntimeShape4, SliceDim, TensorOp,
};

/// A function lowered to text, ready for the model builder
pub struct LoweredFunction {
    /// Declared parameter types (from the variable annotations)
    pub parameter_types: Vec<Type>,
    /// Inferred return type
    pub return_type: Type,
    /// Stack-VM text
    pub text: Vec<u8>,
}

/// Lower a type-checked function expression.
///
/// Tensor constants are appended to `consts`, the module-wide constant
/// section body; instruction immediates reference them by offset.
pub fn lower_function(function_expr: &ExprRef, consts: &mut Vec<u8>) -> Result<LoweredFunction> {
    let function = function_expr
        .as_function()
        .ok_or_else(|| CompilerError::Unsupported("lowering a non-function".into()))?;

    let mut parameter_types = Vec::with_capacity(function.parameters().len());
    let mut params = Vec::with_capacity(function.parameters().len());
    for parameter in function.parameters() {
        let var = parameter
            .as_var()
            .ok_or_else(|| CompilerError::Unsupported("non-var parameter".into()))?;
        parameter_types.push(var.type_annotation());
        params.push(parameter.id());
    }
    if params.len() > u8::MAX as usize {
        return Err(CompilerError::Unsupported("more than 255 parameters".into()));
    }

    let return_type = function_expr
        .checked_type()
        .ok_or_else(|| CompilerError::Unsupported("lowering before inference".into()))?;

    let mut codegen = Codegen {
        emitter: Emitter::new(),
        consts,
        params,
    };
    codegen.gen(&function.body())?;
    codegen.emitter.emit(&Inst::Ret);

    Ok(LoweredFunction {
        parameter_types,
        return_type,
        text: codegen.emitter.finish(),
    })
}

struct Codegen<'a> {
    emitter: Emitter,
    consts: &'a mut Vec<u8>,
    params: Vec<ExprId>,
}

impl Codegen<'_> {
    // Generate code leaving one value on the evaluation stack.
    fn gen(&mut self, expr: &ExprRef) -> Result<()> {
        match expr.payload() {
            ExprPayload::Var(_) => self.gen_ldarg(expr),
            ExprPayload::Constant(constant) => {
                let t = tensor_type(constant.value_type())?;
                // Scalars of the VM's immediate kinds stay on the stack;
                // everything else goes through the constant section.
                if t.is_scalar() && t.dtype == Datatype::Float32 {
                    let v = f32::from_le_bytes(constant.data()[..4].try_into().unwrap());
                    let inst = if v == 0.0 && v.is_sign_positive() {
                        Inst::LdcR4_0
                    } else if v == 1.0 {
                        Inst::LdcR4_1
                    } else {
                        Inst::LdcR4(v)
                    };
                    self.emitter.emit(&inst);
                    Ok(())
                } else if t.is_scalar() && t.dtype == Datatype::Int32 {
                    let v = i32::from_le_bytes(constant.data()[..4].try_into().unwrap());
                    self.emitter.emit(&Inst::LdcI4(v));
                    Ok(())
                } else {
                    self.gen_tensor_constant(expr)
                }
            }
            ExprPayload::Call(call) => self.gen_call(expr, call),
            ExprPayload::Tuple(_) => {
                Err(CompilerError::Unsupported("tuple construction".into()))
            }
            ExprPayload::Function(_) | ExprPayload::Op(_) => Err(CompilerError::Unsupported(
                "first-class functions and operators".into(),
            )),
        }
    }

    fn gen_call(&mut self, expr: &ExprRef, call: &kmdl_ir::Call) -> Result<()> {
        let target = call.target();
        let op = match target.payload() {
            ExprPayload::Op(op) => op.clone(),
            ExprPayload::Function(_) => {
                return Err(CompilerError::Unsupported(
                    "calls to functions in lowering".into(),
                ))
            }
            _ => return Err(CompilerError::Unsupported("invalid call target".into())),
        };
        let kind = op.node_kind();
        let args = call.arguments();
        let result = checked_tensor_type(expr)?;

        if math::BINARY_KINDS.contains(&kind) {
            let scalar_form = scalar_binary_inst(kind);
            if result.is_scalar() && scalar_form.is_some() {
                self.gen(&args[0])?;
                self.gen(&args[1])?;
                self.emitter.emit(&scalar_form.unwrap());
                return Ok(());
            }
            self.gen_tensor_operand(&args[0])?;
            self.gen_tensor_operand(&args[1])?;
            self.emitter.emit(&Inst::Tensor(TensorOp::Binary {
                op: tensor_binary_kind(kind),
                dtype: result.dtype,
                src1: shape4_of(&args[0])?,
                src2: shape4_of(&args[1])?,
                dest: shape4(&result)?,
            }));
            return Ok(());
        }

        if math::COMPARE_KINDS.contains(&kind) {
            if !result.is_scalar() {
                return Err(CompilerError::UnsupportedOp {
                    kind: format!("{} on tensors", kind),
                });
            }
            self.gen(&args[0])?;
            self.gen(&args[1])?;
            self.emitter.emit(&compare_inst(kind));
            return Ok(());
        }

        if kind == math::NEG && result.is_scalar() {
            self.gen(&args[0])?;
            self.emitter.emit(&Inst::Neg);
            Ok(())
        } else if kind == math::SQUARE && result.is_scalar() {
            self.gen(&args[0])?;
            self.emitter.emit(&Inst::Dup).emit(&Inst::Mul);
            Ok(())
        } else if kind == math::CLAMP {
            self.gen_tensor_operand(&args[0])?;
            self.emitter.emit(&Inst::Tensor(TensorOp::Clamp {
                dtype: result.dtype,
                src: shape4_of(&args[0])?,
                dest: shape4(&result)?,
                min: const_scalar_f32(&args[1])?,
                max: const_scalar_f32(&args[2])?,
            }));
            Ok(())
        } else if kind == tensors::CAST {
            self.gen_tensor_operand(&args[0])?;
            self.emitter.emit(&Inst::Tensor(TensorOp::Convert {
                src_type: checked_tensor_type(&args[0])?.dtype,
                src: shape4_of(&args[0])?,
                dest_type: result.dtype,
                dest: shape4(&result)?,
            }));
            Ok(())
        } else if kind == tensors::TRANSPOSE {
            let src = checked_tensor_type(&args[0])?;
            let perm = const_dims(&args[1])?;
            let pad = 4 - src.shape.len();
            let mut perm4 = [0u8, 1, 2, 3];
            for (i, &axis) in perm.iter().enumerate() {
                perm4[pad + i] = (pad + axis as usize) as u8;
            }
            self.gen_tensor_operand(&args[0])?;
            self.emitter.emit(&Inst::Tensor(TensorOp::Transpose {
                dtype: result.dtype,
                src: shape4(&src)?,
                dest: shape4(&result)?,
                perm: perm4,
            }));
            Ok(())
        } else if kind == tensors::SLICE {
            let src = checked_tensor_type(&args[0])?;
            let begins = const_dims(&args[1])?;
            let ends = const_dims(&args[2])?;
            let strides = const_dims(&args[3])?;
            let pad = 4 - src.shape.len();
            let mut dims = [SliceDim { start: 0, end: 1, stride: 1 }; 4];
            for i in 0..src.shape.len() {
                dims[pad + i] = SliceDim {
                    start: begins[i] as u32,
                    end: ends[i] as u32,
                    stride: strides[i] as i32,
                };
            }
            self.gen_tensor_operand(&args[0])?;
            self.emitter.emit(&Inst::Tensor(TensorOp::Slice {
                dtype: result.dtype,
                src: shape4(&src)?,
                dest: shape4(&result)?,
                dims,
            }));
            Ok(())
        } else if kind == tensors::BROADCAST {
            self.gen_tensor_operand(&args[0])?;
            self.emitter.emit(&Inst::Tensor(TensorOp::Broadcast {
                dtype: result.dtype,
                src: shape4_of(&args[0])?,
                dest: shape4(&result)?,
            }));
            Ok(())
        } else if kind == tensors::PAD {
            let src = checked_tensor_type(&args[0])?;
            let pads = const_dims(&args[1])?;
            let pad = 4 - src.shape.len();
            let mut dims = [PadDim::default(); 4];
            for i in 0..src.shape.len() {
                dims[pad + i] = PadDim {
                    before: pads[i * 2] as i32,
                    after: pads[i * 2 + 1] as i32,
                };
            }
            self.gen_tensor_operand(&args[0])?;
            self.emitter.emit(&Inst::Tensor(TensorOp::Pad {
                dtype: result.dtype,
                src: shape4(&src)?,
                dest: shape4(&result)?,
                dims,
                value: const_scalar_f32(&args[2])?,
            }));
            Ok(())
        } else if kind == tensors::QUANTIZE || kind == tensors::DEQUANTIZE {
            let src = checked_tensor_type(&args[0])?;
            let scale = const_scalar_f32(&args[2])?;
            let zero_point = const_scalar_i32(&args[3])?;
            self.gen_tensor_operand(&args[0])?;
            let op = if kind == tensors::QUANTIZE {
                TensorOp::Quantize {
                    src_type: src.dtype,
                    src: shape4(&src)?,
                    dest_type: result.dtype,
                    dest: shape4(&result)?,
                    scale,
                    zero_point,
                }
            } else {
                TensorOp::Dequantize {
                    src_type: src.dtype,
                    src: shape4(&src)?,
                    dest_type: result.dtype,
                    dest: shape4(&result)?,
                    scale,
                    zero_point,
                }
            };
            self.emitter.emit(&Inst::Tensor(op));
            Ok(())
        } else {
            Err(CompilerError::UnsupportedOp {
                kind: kind.to_string(),
            })
        }
    }

    fn gen_ldarg(&mut self, expr: &ExprRef) -> Result<()> {
        let index = self
            .params
            .iter()
            .position(|&id| id == expr.id())
            .ok_or_else(|| CompilerError::Unsupported("free variable in body".into()))?;
        self.emitter.emit(&Inst::Ldarg(index as u8));
        Ok(())
    }

    // Generate an operand for a tensor instruction; the stack must end up
    // holding a value reference, never a bare scalar cell.
    fn gen_tensor_operand(&mut self, expr: &ExprRef) -> Result<()> {
        match expr.payload() {
            ExprPayload::Var(_) => self.gen_ldarg(expr),
            ExprPayload::Constant(_) => self.gen_tensor_constant(expr),
            ExprPayload::Call(call) => {
                if checked_tensor_type(expr)?.is_scalar() {
                    return Err(CompilerError::Unsupported(
                        "scalar intermediate feeding a tensor instruction".into(),
                    ));
                }
                self.gen_call(expr, call)
            }
            _ => Err(CompilerError::Unsupported(
                "invalid tensor operand".into(),
            )),
        }
    }

    fn gen_tensor_constant(&mut self, expr: &ExprRef) -> Result<()> {
        let constant = expr.as_constant().unwrap();
        let t = tensor_type(constant.value_type())?;
        if t.shape.len() > 4 {
            return Err(CompilerError::Unsupported(
                "tensor constant of rank > 4".into(),
            ));
        }
        let offset = self.add_const(constant.data());
        debug_assert_eq!(constant.data().len(), bytes_of(t.dtype, &t.shape));
        self.emitter.emit(&Inst::LdcTensor {
            dtype: t.dtype,
            offset,
            shape: t.shape.clone(),
        });
        Ok(())
    }

    fn add_const(&mut self, data: &[u8]) -> u32 {
        let aligned = (self.consts.len() + 7) & !7;
        self.consts.resize(aligned, 0);
        self.consts.extend_from_slice(data);
        aligned as u32
    }
}

fn tensor_type(ty: &Type) -> Result<TensorType> {
    match ty {
        Type::Tensor(t) => Ok(t.clone()),
        other => Err(CompilerError::Unsupported(format!(
            "expected a tensor type, found {}",
            other
        ))),
    }
}

fn checked_tensor_type(expr: &ExprRef) -> Result<TensorType> {
    let ty = expr
        .checked_type()
        .ok_or_else(|| CompilerError::Unsupported("lowering before inference".into()))?;
    tensor_type(&ty)
}

fn shape4(t: &TensorType) -> Result<RuntimeShape4> {
    RuntimeShape4::from_shape(&t.shape).map_err(|_| {
        CompilerError::Unsupported(format!("tensor of rank {} in the VM dialect", t.shape.len()))
    })
}

fn shape4_of(expr: &ExprRef) -> Result<RuntimeShape4> {
    shape4(&checked_tensor_type(expr)?)
}

fn scalar_binary_inst(kind: NodeKind) -> Option<Inst> {
    if kind == math::ADD {
        Some(Inst::Add)
    } else if kind == math::SUB {
        Some(Inst::Sub)
    } else if kind == math::MUL {
        Some(Inst::Mul)
    } else if kind == math::DIV {
        Some(Inst::Div)
    } else {
        None
    }
}

fn tensor_binary_kind(kind: NodeKind) -> BinaryOpKind {
    if kind == math::ADD {
        BinaryOpKind::Add
    } else if kind == math::SUB {
        BinaryOpKind::Sub
    } else if kind == math::MUL {
        BinaryOpKind::Mul
    } else if kind == math::DIV {
        BinaryOpKind::Div
    } else if kind == math::MIN {
        BinaryOpKind::Min
    } else {
        debug_assert_eq!(kind, math::MAX);
        BinaryOpKind::Max
    }
}

fn compare_inst(kind: NodeKind) -> Inst {
    if kind == math::LT {
        Inst::Clt
    } else if kind == math::LE {
        Inst::Cle
    } else if kind == math::EQ {
        Inst::Ceq
    } else if kind == math::GE {
        Inst::Cge
    } else if kind == math::GT {
        Inst::Cgt
    } else {
        debug_assert_eq!(kind, math::NE);
        Inst::Cne
    }
}

fn const_dims(expr: &ExprRef) -> Result<Vec<i64>> {
    expr.as_constant()
        .and_then(|c| c.as_dims())
        .ok_or(CompilerError::NotConstant {
            what: "dimension list".into(),
        })
}

fn const_scalar_f32(expr: &ExprRef) -> Result<f32> {
    let constant = expr.as_constant().ok_or(CompilerError::NotConstant {
        what: "f32 scalar".into(),
    })?;
    match constant.value_type() {
        Type::Tensor(t) if t.is_scalar() && t.dtype == Datatype::Float32 => Ok(f32::from_le_bytes(
            constant.data()[..4].try_into().unwrap(),
        )),
        _ => Err(CompilerError::NotConstant {
            what: "f32 scalar".into(),
        }),
    }
}

fn const_scalar_i32(expr: &ExprRef) -> Result<i32> {
    let constant = expr.as_constant().ok_or(CompilerError::NotConstant {
        what: "i32 scalar".into(),
    })?;
    match constant.value_type() {
        Type::Tensor(t) if t.is_scalar() && t.dtype == Datatype::Int32 => Ok(i32::from_le_bytes(
            constant.data()[..4].try_into().unwrap(),
        )),
        _ => Err(CompilerError::NotConstant {
            what: "i32 scalar".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmdl_ir::infer_type;

    #[test]
    fn test_scalar_add_lowering() {
        let body = math::add(
            ExprNode::constant_scalar(2.0f32),
            ExprNode::constant_scalar(3.0f32),
        );
        let f = ExprNode::function("f", vec![], body);
        assert!(infer_type(&f));

        let mut consts = Vec::new();
        let lowered = lower_function(&f, &mut consts).unwrap();
        assert!(consts.is_empty());
        // ldc_r4 2.0; ldc_r4 3.0; add; ret
        assert_eq!(lowered.text.len(), 5 + 5 + 1 + 1);
        assert_eq!(lowered.text[0], 0x02);
    }

    #[test]
    fn test_special_float_immediates() {
        let body = math::add(
            ExprNode::constant_scalar(0.0f32),
            ExprNode::constant_scalar(1.0f32),
        );
        let f = ExprNode::function("f", vec![], body);
        assert!(infer_type(&f));
        let mut consts = Vec::new();
        let lowered = lower_function(&f, &mut consts).unwrap();
        // ldc_r4_0; ldc_r4_1; add; ret, all single-byte.
        assert_eq!(lowered.text.len(), 4);
    }

    #[test]
    fn test_tensor_constants_deduplicate_into_section() {
        use kmdl_core::Shape;
        let lhs = ExprNode::constant_tensor(Shape::from_slice(&[2]), &[1.0f32, 2.0]).unwrap();
        let rhs = ExprNode::constant_tensor(Shape::from_slice(&[2]), &[3.0f32, 4.0]).unwrap();
        let f = ExprNode::function("f", vec![], math::add(lhs, rhs));
        assert!(infer_type(&f));

        let mut consts = Vec::new();
        let lowered = lower_function(&f, &mut consts).unwrap();
        assert_eq!(consts.len(), 16);
        assert!(!lowered.text.is_empty());
    }

    #[test]
    fn test_unsupported_op_reported() {
        let x = ExprNode::var(
            "x",
            Type::tensor(Datatype::Float32, kmdl_core::Shape::from_slice(&[2])),
        );
        let f = ExprNode::function("f", vec![x.clone()], math::exp(x));
        assert!(infer_type(&f));
        let mut consts = Vec::new();
        assert!(matches!(
            lower_function(&f, &mut consts),
            Err(CompilerError::UnsupportedOp { .. })
        ));
    }
}
