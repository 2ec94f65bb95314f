//! The stack VM execution loop
//!
//! One invocation owns an evaluation stack of tagged cells and a frame
//! stack; the text is immutable. All decode errors, bad branch targets,
//! stack misuse, and `throw` surface as `InvalidProgram`.

use super::kernels::kernel_for;
use super::opcode::{Inst, TensorOp, MAX_STACK};
use crate::buffer::MapAccess;
use crate::error::{Result, RuntimeError};
use crate::module::CustomCallFn;
use crate::section::ModelBytes;
use crate::tensor::{host_tensor, RuntimeTensor};
use crate::value::Value;
use crate::buffer::MemoryPool;
use half::bf16;
use kmdl_core::{bytes_of, Datatype};
use kmdl_model::SpanReader;
use parking_lot::Mutex;

/// One evaluation-stack cell
#[derive(Clone, Debug)]
pub enum StackCell {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// Brain-float scalar
    BF16(bf16),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Reference to a value (tensor or tuple)
    Ref(Value),
}

// Numeric view of a cell after unboxing
#[derive(Clone, Copy)]
enum Num {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

struct Frame {
    return_ip: usize,
    arg_base: usize,
    args: u8,
}

/// Everything one invocation needs from the enclosing module
pub(crate) struct VmContext<'a> {
    /// Function text
    pub text: &'a [u8],
    /// Constant section bytes, when the module has one
    pub consts: Option<&'a ModelBytes>,
    /// The module's mutable data region
    pub data: &'a Mutex<Vec<u8>>,
    /// Resolved custom-call table
    pub custom: &'a [CustomCallFn],
}

pub(crate) fn execute(
    context: &VmContext<'_>,
    entrypoint: usize,
    parameters: &[Value],
) -> Result<StackCell> {
    let mut vm = Vm {
        context,
        stack: Vec::with_capacity(MAX_STACK.min(16)),
        frames: vec![Frame {
            return_ip: usize::MAX,
            arg_base: 0,
            args: parameters.len() as u8,
        }],
        ip: entrypoint,
    };
    for parameter in parameters {
        vm.push(StackCell::Ref(parameter.clone()))?;
    }
    vm.run()
}

struct Vm<'a, 'c> {
    context: &'a VmContext<'c>,
    stack: Vec<StackCell>,
    frames: Vec<Frame>,
    ip: usize,
}

impl Vm<'_, '_> {
    fn run(&mut self) -> Result<StackCell> {
        let text = self.context.text;
        loop {
            if self.ip >= text.len() {
                return Err(RuntimeError::invalid_program(
                    "instruction pointer outside text",
                ));
            }
            let inst_start = self.ip;
            let mut reader = SpanReader::new(text);
            reader.seek(inst_start).map_err(RuntimeError::from)?;
            let inst = Inst::decode(&mut reader)?;
            self.ip = reader.position();
            log::trace!("vm: {:06x} {:?}", inst_start, inst);

            match inst {
                Inst::Nop => {}
                Inst::LdcI4(v) => self.push(StackCell::I32(v))?,
                Inst::LdcR4(v) => self.push(StackCell::F32(v))?,
                Inst::LdcR4_0 => self.push(StackCell::F32(0.0))?,
                Inst::LdcR4_1 => self.push(StackCell::F32(1.0))?,
                Inst::LdcTensor {
                    dtype,
                    offset,
                    shape,
                } => {
                    let consts = self.context.consts.ok_or_else(|| {
                        RuntimeError::invalid_program("tensor constant without constant section")
                    })?;
                    let len = bytes_of(dtype, &shape);
                    let bytes = consts.slice(offset as u64, len as u64)?;
                    let tensor = host_tensor::create_with_data(
                        dtype,
                        shape,
                        bytes.as_slice(),
                        MemoryPool::CpuOnly,
                    )?;
                    self.push(StackCell::Ref(Value::Tensor(tensor)))?;
                }

                Inst::LdindI1(addr) => {
                    let b = self.data_read(addr, 1)?[0];
                    self.push(StackCell::I32(b as i8 as i32))?;
                }
                Inst::LdindU1(addr) => {
                    let b = self.data_read(addr, 1)?[0];
                    self.push(StackCell::I32(b as i32))?;
                }
                Inst::LdindI4(addr) => {
                    let bytes = self.data_read(addr, 4)?;
                    self.push(StackCell::I32(i32::from_le_bytes(bytes.try_into().unwrap())))?;
                }
                Inst::LdindBr2(addr) => {
                    let bytes = self.data_read(addr, 2)?;
                    self.push(StackCell::BF16(bf16::from_le_bytes(bytes.try_into().unwrap())))?;
                }
                Inst::LdindR4(addr) => {
                    let bytes = self.data_read(addr, 4)?;
                    self.push(StackCell::F32(f32::from_le_bytes(bytes.try_into().unwrap())))?;
                }
                Inst::StindI1(addr) => {
                    let v = self.pop_num()?;
                    self.data_write(addr, &[as_i64(v) as u8])?;
                }
                Inst::StindI4(addr) => {
                    let v = self.pop_num()?;
                    self.data_write(addr, &(as_i64(v) as i32).to_le_bytes())?;
                }
                Inst::StindBr2(addr) => {
                    let v = self.pop_num()?;
                    self.data_write(addr, &bf16::from_f32(as_f64(v) as f32).to_le_bytes())?;
                }
                Inst::StindR4(addr) => {
                    let v = self.pop_num()?;
                    self.data_write(addr, &(as_f64(v) as f32).to_le_bytes())?;
                }

                Inst::Ldarg(index) => {
                    let frame = self.frames.last().unwrap();
                    if index >= frame.args {
                        return Err(RuntimeError::invalid_program(format!(
                            "ldarg {} with {} arguments",
                            index, frame.args
                        )));
                    }
                    let cell = self.stack[frame.arg_base + index as usize].clone();
                    self.push(cell)?;
                }
                Inst::Dup => {
                    let top = self.peek()?.clone();
                    self.push(top)?;
                }
                Inst::Pop => {
                    self.pop()?;
                }

                Inst::Neg => {
                    let v = self.pop_num()?;
                    let cell = match v {
                        Num::I32(x) => StackCell::I32(x.wrapping_neg()),
                        Num::I64(x) => StackCell::I64(x.wrapping_neg()),
                        Num::F32(x) => StackCell::F32(-x),
                        Num::F64(x) => StackCell::F64(-x),
                    };
                    self.push(cell)?;
                }
                Inst::Not => {
                    let v = self.pop_num()?;
                    let cell = match v {
                        Num::I32(x) => StackCell::I32(!x),
                        Num::I64(x) => StackCell::I64(!x),
                        _ => {
                            return Err(RuntimeError::invalid_program(
                                "bitwise not on a float",
                            ))
                        }
                    };
                    self.push(cell)?;
                }
                Inst::Add => self.binary_arith(|a, b| a.wrapping_add(b), |a, b| a + b)?,
                Inst::Sub => self.binary_arith(|a, b| a.wrapping_sub(b), |a, b| a - b)?,
                Inst::Mul => self.binary_arith(|a, b| a.wrapping_mul(b), |a, b| a * b)?,
                Inst::Div => self.divide(false, false)?,
                Inst::DivU => self.divide(false, true)?,
                Inst::Rem => self.divide(true, false)?,
                Inst::RemU => self.divide(true, true)?,

                Inst::Clt => self.compare(|o| o == std::cmp::Ordering::Less, false)?,
                Inst::CltU => self.compare(|o| o == std::cmp::Ordering::Less, true)?,
                Inst::Cle => self.compare(|o| o != std::cmp::Ordering::Greater, false)?,
                Inst::CleU => self.compare(|o| o != std::cmp::Ordering::Greater, true)?,
                Inst::Ceq => self.compare(|o| o == std::cmp::Ordering::Equal, false)?,
                Inst::Cge => self.compare(|o| o != std::cmp::Ordering::Less, false)?,
                Inst::CgeU => self.compare(|o| o != std::cmp::Ordering::Less, true)?,
                Inst::Cgt => self.compare(|o| o == std::cmp::Ordering::Greater, false)?,
                Inst::CgtU => self.compare(|o| o == std::cmp::Ordering::Greater, true)?,
                Inst::Cne => self.compare(|o| o != std::cmp::Ordering::Equal, false)?,

                Inst::ConvI1 => {
                    let v = self.pop_num()?;
                    self.push(StackCell::I32(as_i64(v) as i8 as i32))?;
                }
                Inst::ConvU1 => {
                    let v = self.pop_num()?;
                    self.push(StackCell::I32(as_i64(v) as u8 as i32))?;
                }
                Inst::ConvI4 => {
                    let v = self.pop_num()?;
                    self.push(StackCell::I32(as_i64(v) as i32))?;
                }
                Inst::ConvU4 => {
                    let v = self.pop_num()?;
                    self.push(StackCell::I32(as_i64(v) as u32 as i32))?;
                }
                Inst::ConvBr2 => {
                    let v = self.pop_num()?;
                    self.push(StackCell::BF16(bf16::from_f32(as_f64(v) as f32)))?;
                }
                Inst::ConvR4 => {
                    let v = self.pop_num()?;
                    self.push(StackCell::F32(as_f64(v) as f32))?;
                }

                Inst::Br(offset) => {
                    self.ip = self.branch_target(inst_start, offset)?;
                }
                Inst::BrTrue(offset) => {
                    let v = self.pop_num()?;
                    if num_is_true(v) {
                        self.ip = self.branch_target(inst_start, offset)?;
                    }
                }
                Inst::BrFalse(offset) => {
                    let v = self.pop_num()?;
                    if !num_is_true(v) {
                        self.ip = self.branch_target(inst_start, offset)?;
                    }
                }
                Inst::Call { offset, args } => {
                    let target = self.branch_target(inst_start, offset)?;
                    if (args as usize) > self.stack.len() {
                        return Err(RuntimeError::invalid_program(
                            "call with more arguments than stacked values",
                        ));
                    }
                    self.frames.push(Frame {
                        return_ip: self.ip,
                        arg_base: self.stack.len() - args as usize,
                        args,
                    });
                    self.ip = target;
                }
                Inst::CusCall { index, args } => {
                    let function = self
                        .context
                        .custom
                        .get(index as usize)
                        .copied()
                        .ok_or_else(|| {
                            RuntimeError::invalid_program(format!(
                                "custom call index {} out of table",
                                index
                            ))
                        })?;
                    let mut values = Vec::with_capacity(args as usize);
                    for _ in 0..args {
                        values.push(self.pop_ref()?);
                    }
                    values.reverse();
                    let result = function(&values)?;
                    self.push(StackCell::Ref(result))?;
                }
                Inst::Ret => {
                    let frame = self.frames.pop().unwrap();
                    let result = self.pop()?;
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    if self.stack.len() < frame.arg_base {
                        return Err(RuntimeError::invalid_program("frame underflow at ret"));
                    }
                    self.stack.truncate(frame.arg_base);
                    self.push(result)?;
                    self.ip = frame.return_ip;
                }
                Inst::Throw => {
                    return Err(RuntimeError::invalid_program("throw"));
                }

                Inst::Tensor(op) => self.tensor_op(op)?,
            }
        }
    }

    fn tensor_op(&mut self, op: TensorOp) -> Result<()> {
        let mut inputs = Vec::with_capacity(op.input_count());
        for _ in 0..op.input_count() {
            let value = self.pop_ref()?;
            let tensor = value.as_tensor()?.to_host()?;
            inputs.push(tensor);
        }
        inputs.reverse();

        let dest_type = op.dest_type();
        let dest = host_tensor::create(dest_type, op.dest().shape(), MemoryPool::CpuOnly)?;

        {
            let maps = inputs
                .iter()
                .map(|t| t.map(MapAccess::READ))
                .collect::<Result<Vec<_>>>()?;
            let input_slices: Vec<&[u8]> = maps.iter().map(|m| m.as_slice()).collect();
            let mut dest_map = dest.map(MapAccess::WRITE)?;
            (kernel_for(&op))(&op, &input_slices, dest_map.as_mut_slice()?)?;
        }

        self.push(StackCell::Ref(Value::Tensor(dest)))
    }

    fn branch_target(&self, inst_start: usize, offset: i32) -> Result<usize> {
        let target = inst_start as i64 + offset as i64;
        if target < 0 || target >= self.context.text.len() as i64 {
            return Err(RuntimeError::invalid_program(format!(
                "branch target {} outside text of {} bytes",
                target,
                self.context.text.len()
            )));
        }
        Ok(target as usize)
    }

    fn data_read(&self, addr: i32, len: usize) -> Result<Vec<u8>> {
        let data = self.context.data.lock();
        let start = usize::try_from(addr)
            .map_err(|_| RuntimeError::invalid_program("negative data address"))?;
        data.get(start..start + len)
            .map(|s| s.to_vec())
            .ok_or_else(|| RuntimeError::invalid_program("data read out of range"))
    }

    fn data_write(&self, addr: i32, bytes: &[u8]) -> Result<()> {
        let mut data = self.context.data.lock();
        let start = usize::try_from(addr)
            .map_err(|_| RuntimeError::invalid_program("negative data address"))?;
        data.get_mut(start..start + bytes.len())
            .map(|s| s.copy_from_slice(bytes))
            .ok_or_else(|| RuntimeError::invalid_program("data write out of range"))
    }

    fn push(&mut self, cell: StackCell) -> Result<()> {
        if self.stack.len() >= MAX_STACK {
            return Err(RuntimeError::invalid_program("evaluation stack overflow"));
        }
        self.stack.push(cell);
        Ok(())
    }

    fn pop(&mut self) -> Result<StackCell> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::invalid_program("evaluation stack underflow"))
    }

    fn peek(&self) -> Result<&StackCell> {
        self.stack
            .last()
            .ok_or_else(|| RuntimeError::invalid_program("evaluation stack underflow"))
    }

    fn pop_ref(&mut self) -> Result<Value> {
        match self.pop()? {
            StackCell::Ref(value) => Ok(value),
            _ => Err(RuntimeError::invalid_program(
                "expected a value reference on the stack",
            )),
        }
    }

    fn pop_num(&mut self) -> Result<Num> {
        let cell = self.pop()?;
        cell_to_num(&cell)
    }

    fn binary_arith(
        &mut self,
        int_op: impl Fn(i64, i64) -> i64,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> Result<()> {
        let b = self.pop_num()?;
        let a = self.pop_num()?;
        let cell = match promote(a, b) {
            Promoted::I32(x, y) => StackCell::I32(int_op(x as i64, y as i64) as i32),
            Promoted::I64(x, y) => StackCell::I64(int_op(x, y)),
            Promoted::F32(x, y) => StackCell::F32(float_op(x as f64, y as f64) as f32),
            Promoted::F64(x, y) => StackCell::F64(float_op(x, y)),
        };
        self.push(cell)
    }

    fn divide(&mut self, remainder: bool, unsigned: bool) -> Result<()> {
        let b = self.pop_num()?;
        let a = self.pop_num()?;
        let cell = match promote(a, b) {
            Promoted::F32(x, y) if !unsigned => {
                StackCell::F32(if remainder { x % y } else { x / y })
            }
            Promoted::F64(x, y) if !unsigned => {
                StackCell::F64(if remainder { x % y } else { x / y })
            }
            Promoted::F32(..) | Promoted::F64(..) => {
                return Err(RuntimeError::invalid_program(
                    "unsigned division on floats",
                ))
            }
            Promoted::I32(x, y) => {
                if y == 0 {
                    return Err(RuntimeError::invalid_program("integer division by zero"));
                }
                let v = if unsigned {
                    let (x, y) = (x as u32, y as u32);
                    (if remainder { x % y } else { x / y }) as i32
                } else if remainder {
                    x.wrapping_rem(y)
                } else {
                    x.wrapping_div(y)
                };
                StackCell::I32(v)
            }
            Promoted::I64(x, y) => {
                if y == 0 {
                    return Err(RuntimeError::invalid_program("integer division by zero"));
                }
                let v = if unsigned {
                    let (x, y) = (x as u64, y as u64);
                    (if remainder { x % y } else { x / y }) as i64
                } else if remainder {
                    x.wrapping_rem(y)
                } else {
                    x.wrapping_div(y)
                };
                StackCell::I64(v)
            }
        };
        self.push(cell)
    }

    fn compare(
        &mut self,
        test: impl Fn(std::cmp::Ordering) -> bool,
        unsigned: bool,
    ) -> Result<()> {
        let b = self.pop_num()?;
        let a = self.pop_num()?;
        let ordering = match promote(a, b) {
            Promoted::I32(x, y) => {
                if unsigned {
                    (x as u32).cmp(&(y as u32))
                } else {
                    x.cmp(&y)
                }
            }
            Promoted::I64(x, y) => {
                if unsigned {
                    (x as u64).cmp(&(y as u64))
                } else {
                    x.cmp(&y)
                }
            }
            Promoted::F32(x, y) => x
                .partial_cmp(&y)
                .unwrap_or(std::cmp::Ordering::Greater),
            Promoted::F64(x, y) => x
                .partial_cmp(&y)
                .unwrap_or(std::cmp::Ordering::Greater),
        };
        self.push(StackCell::I32(test(ordering) as i32))
    }
}

enum Promoted {
    I32(i32, i32),
    I64(i64, i64),
    F32(f32, f32),
    F64(f64, f64),
}

fn promote(a: Num, b: Num) -> Promoted {
    use Num::*;
    match (a, b) {
        (F64(x), y) => Promoted::F64(x, as_f64(y)),
        (x, F64(y)) => Promoted::F64(as_f64(x), y),
        (F32(x), y) => Promoted::F32(x, as_f64(y) as f32),
        (x, F32(y)) => Promoted::F32(as_f64(x) as f32, y),
        (I64(x), y) => Promoted::I64(x, as_i64(y)),
        (x, I64(y)) => Promoted::I64(as_i64(x), y),
        (I32(x), I32(y)) => Promoted::I32(x, y),
    }
}

fn as_i64(v: Num) -> i64 {
    match v {
        Num::I32(x) => x as i64,
        Num::I64(x) => x,
        Num::F32(x) => x as i64,
        Num::F64(x) => x as i64,
    }
}

fn as_f64(v: Num) -> f64 {
    match v {
        Num::I32(x) => x as f64,
        Num::I64(x) => x as f64,
        Num::F32(x) => x as f64,
        Num::F64(x) => x,
    }
}

fn num_is_true(v: Num) -> bool {
    match v {
        Num::I32(x) => x != 0,
        Num::I64(x) => x != 0,
        Num::F32(x) => x != 0.0,
        Num::F64(x) => x != 0.0,
    }
}

// Unbox a cell for arithmetic: scalar host tensors read their one element.
fn cell_to_num(cell: &StackCell) -> Result<Num> {
    match cell {
        StackCell::I32(v) => Ok(Num::I32(*v)),
        StackCell::I64(v) => Ok(Num::I64(*v)),
        StackCell::BF16(v) => Ok(Num::F32(v.to_f32())),
        StackCell::F32(v) => Ok(Num::F32(*v)),
        StackCell::F64(v) => Ok(Num::F64(*v)),
        StackCell::Ref(value) => scalar_tensor_num(value),
    }
}

fn scalar_tensor_num(value: &Value) -> Result<Num> {
    let tensor = value.as_tensor().map_err(|_| {
        RuntimeError::invalid_program("arithmetic on a tuple reference")
    })?;
    if !tensor.shape().is_empty() {
        return Err(RuntimeError::invalid_program(
            "arithmetic on a non-scalar tensor reference",
        ));
    }
    let host = tensor.to_host()?;
    let map = host.map(MapAccess::READ)?;
    let bytes = map.as_slice();
    Ok(match host.datatype() {
        Datatype::Int8 => Num::I32(bytes[0] as i8 as i32),
        Datatype::Int16 => Num::I32(i16::from_le_bytes(bytes[..2].try_into().unwrap()) as i32),
        Datatype::Int32 => Num::I32(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
        Datatype::Int64 => Num::I64(i64::from_le_bytes(bytes[..8].try_into().unwrap())),
        Datatype::UInt8 | Datatype::Bool => Num::I32(bytes[0] as i32),
        Datatype::UInt16 => Num::I32(u16::from_le_bytes(bytes[..2].try_into().unwrap()) as i32),
        Datatype::UInt32 => {
            Num::I32(u32::from_le_bytes(bytes[..4].try_into().unwrap()) as i32)
        }
        Datatype::UInt64 => {
            Num::I64(u64::from_le_bytes(bytes[..8].try_into().unwrap()) as i64)
        }
        Datatype::Float16 => Num::F32(
            half::f16::from_le_bytes(bytes[..2].try_into().unwrap()).to_f32(),
        ),
        Datatype::BFloat16 => {
            Num::F32(bf16::from_le_bytes(bytes[..2].try_into().unwrap()).to_f32())
        }
        Datatype::Float32 => Num::F32(f32::from_le_bytes(bytes[..4].try_into().unwrap())),
        Datatype::Float64 => Num::F64(f64::from_le_bytes(bytes[..8].try_into().unwrap())),
    })
}

/// Turn the VM's result cell into a runtime value of the declared type.
///
/// Numeric cells become scalar host tensors, converted to the declared
/// scalar datatype when necessary; tensor references whose shape is a
/// leading-1 padding of the declared shape are re-viewed.
pub(crate) fn cell_to_value(cell: StackCell, declared: &kmdl_core::Type) -> Result<Value> {
    use kmdl_core::Type;

    if let StackCell::Ref(value) = cell {
        if let (Value::Tensor(tensor), Type::Tensor(want)) = (&value, declared) {
            let have = tensor.shape();
            if have != want.shape.as_slice()
                && tensor.datatype() == want.dtype
                && kmdl_core::num_elements(have) == kmdl_core::num_elements(&want.shape)
                && tensor.is_contiguous()
                && is_leading_one_padding(have, &want.shape)
            {
                let reshaped = RuntimeTensor::new(
                    tensor.datatype(),
                    want.shape.clone(),
                    kmdl_core::default_strides(&want.shape),
                    tensor.buffer_slice().clone(),
                )?;
                return Ok(Value::Tensor(reshaped));
            }
        }
        return Ok(value);
    }

    let num = cell_to_num(&cell)?;
    let dtype = match declared {
        Type::Tensor(t) if t.is_scalar() => t.dtype,
        _ => match num {
            Num::I32(_) => Datatype::Int32,
            Num::I64(_) => Datatype::Int64,
            Num::F32(_) => Datatype::Float32,
            Num::F64(_) => Datatype::Float64,
        },
    };
    let bytes: Vec<u8> = match dtype {
        Datatype::Int8 => vec![as_i64(num) as i8 as u8],
        Datatype::Int16 => (as_i64(num) as i16).to_le_bytes().to_vec(),
        Datatype::Int32 => (as_i64(num) as i32).to_le_bytes().to_vec(),
        Datatype::Int64 => as_i64(num).to_le_bytes().to_vec(),
        Datatype::UInt8 => vec![as_i64(num) as u8],
        Datatype::Bool => vec![(as_i64(num) != 0) as u8],
        Datatype::UInt16 => (as_i64(num) as u16).to_le_bytes().to_vec(),
        Datatype::UInt32 => (as_i64(num) as u32).to_le_bytes().to_vec(),
        Datatype::UInt64 => (as_i64(num) as u64).to_le_bytes().to_vec(),
        Datatype::Float16 => half::f16::from_f64(as_f64(num)).to_le_bytes().to_vec(),
        Datatype::BFloat16 => bf16::from_f64(as_f64(num)).to_le_bytes().to_vec(),
        Datatype::Float32 => (as_f64(num) as f32).to_le_bytes().to_vec(),
        Datatype::Float64 => as_f64(num).to_le_bytes().to_vec(),
    };
    let tensor = host_tensor::create_with_data(dtype, kmdl_core::Shape::new(), &bytes, MemoryPool::CpuOnly)?;
    Ok(Value::Tensor(tensor))
}

fn is_leading_one_padding(have: &[usize], want: &[usize]) -> bool {
    if have.len() < want.len() {
        return false;
    }
    let pad = have.len() - want.len();
    have[..pad].iter().all(|&d| d == 1) && &have[pad..] == want
}
