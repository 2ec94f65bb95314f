//! Executing hand-assembled stack-VM models through the interpreter

use kmdl_core::{Datatype, Type};
use kmdl_model::{FunctionBuilder, ModelBuilder, ModuleBuilder};
use kmdl_runtime::stackvm::{Emitter, Inst, Opcode};
use kmdl_runtime::{Interpreter, MapAccess, Value};

fn scalar_model(text: Vec<u8>, return_type: Type) -> Vec<u8> {
    let mut builder = ModelBuilder::new();
    let mut module = ModuleBuilder::new("stackvm", 1);
    module.add_function(FunctionBuilder::new(vec![], return_type).text(text));
    let index = builder.add_module(module);
    builder.set_entry(index, 0);
    builder.build().unwrap()
}

fn run_scalar_i32(text: Vec<u8>) -> i32 {
    let image = scalar_model(text, Type::scalar_tensor(Datatype::Int32));
    let mut interp = Interpreter::new();
    interp.load_model(&image).unwrap();
    let result = interp.entry_function().unwrap().invoke(&[], None).unwrap();
    read_i32_scalar(&result)
}

fn read_i32_scalar(value: &Value) -> i32 {
    let tensor = value.as_tensor().unwrap();
    let map = tensor.map(MapAccess::READ).unwrap();
    i32::from_le_bytes(map.as_slice()[..4].try_into().unwrap())
}

// Branch on a comparison that holds: 1 + 2 == 3, so br_false falls
// through and the first arm returns.
#[test]
fn conditional_branch_not_taken() {
    let mut e = Emitter::new();
    e.emit(&Inst::LdcI4(1))
        .emit(&Inst::LdcI4(2))
        .emit(&Inst::Add)
        .emit(&Inst::LdcI4(3))
        .emit(&Inst::Ceq);
    let taken = e.emit_branch_placeholder(Opcode::BrFalse);
    e.emit(&Inst::LdcI4(100)).emit(&Inst::Ret);
    e.patch_branch(taken);
    e.emit(&Inst::LdcI4(200)).emit(&Inst::Ret);

    assert_eq!(run_scalar_i32(e.finish()), 100);
}

// The comparison fails (1 + 2 != 4), br_false jumps to the second arm.
#[test]
fn conditional_branch_taken() {
    let mut e = Emitter::new();
    e.emit(&Inst::LdcI4(1))
        .emit(&Inst::LdcI4(2))
        .emit(&Inst::Add)
        .emit(&Inst::LdcI4(4))
        .emit(&Inst::Ceq);
    let taken = e.emit_branch_placeholder(Opcode::BrFalse);
    e.emit(&Inst::LdcI4(100)).emit(&Inst::Ret);
    e.patch_branch(taken);
    e.emit(&Inst::LdcI4(200)).emit(&Inst::Ret);

    assert_eq!(run_scalar_i32(e.finish()), 200);
}

#[test]
fn backward_branch_loops() {
    // Sum 1..=5 with a data-region accumulator and counter.
    let mut e = Emitter::new();
    e.emit(&Inst::LdcI4(5)).emit(&Inst::StindI4(0)); // counter = 5
    let loop_start = e.position();
    // acc += counter
    e.emit(&Inst::LdindI4(4))
        .emit(&Inst::LdindI4(0))
        .emit(&Inst::Add)
        .emit(&Inst::StindI4(4));
    // counter -= 1
    e.emit(&Inst::LdindI4(0))
        .emit(&Inst::LdcI4(1))
        .emit(&Inst::Sub)
        .emit(&Inst::StindI4(0));
    // while counter != 0
    e.emit(&Inst::LdindI4(0));
    let branch_at = e.position();
    e.emit(&Inst::BrTrue(loop_start as i32 - branch_at as i32));
    e.emit(&Inst::LdindI4(4)).emit(&Inst::Ret);

    let mut builder = ModelBuilder::new();
    let mut module = ModuleBuilder::new("stackvm", 1);
    // The accumulator and counter live in the zero-initialized .data tail.
    module.add_section_with_memory(".data", vec![], 16);
    module.add_function(
        FunctionBuilder::new(vec![], Type::scalar_tensor(Datatype::Int32)).text(e.finish()),
    );
    let index = builder.add_module(module);
    builder.set_entry(index, 0);
    let image = builder.build().unwrap();

    let mut interp = Interpreter::new();
    interp.load_model(&image).unwrap();
    let result = interp.entry_function().unwrap().invoke(&[], None).unwrap();
    assert_eq!(read_i32_scalar(&result), 15);
}

#[test]
fn nested_call_frames() {
    // main: ldc 5; ldc 7; call max2; ret
    // max2(a, b): a >= b ? a : b
    let mut e = Emitter::new();
    e.emit(&Inst::LdcI4(5)).emit(&Inst::LdcI4(7));
    let call_at = e.position();
    e.emit(&Inst::Call { offset: 0, args: 2 });
    e.emit(&Inst::Ret);

    let callee = e.position();
    e.emit(&Inst::Ldarg(0)).emit(&Inst::Ldarg(1)).emit(&Inst::Cge);
    let else_arm = e.emit_branch_placeholder(Opcode::BrFalse);
    e.emit(&Inst::Ldarg(0)).emit(&Inst::Ret);
    e.patch_branch(else_arm);
    e.emit(&Inst::Ldarg(1)).emit(&Inst::Ret);

    let mut text = e.finish();
    let offset = (callee - call_at) as u32;
    text[call_at + 1] = offset as u8;
    text[call_at + 2] = (offset >> 8) as u8;
    text[call_at + 3] = (offset >> 16) as u8;

    assert_eq!(run_scalar_i32(text), 7);
}

#[test]
fn throw_surfaces_invalid_program() {
    let mut e = Emitter::new();
    e.emit(&Inst::Throw);
    let image = scalar_model(e.finish(), Type::scalar_tensor(Datatype::Int32));
    let mut interp = Interpreter::new();
    interp.load_model(&image).unwrap();
    let err = interp.entry_function().unwrap().invoke(&[], None).unwrap_err();
    assert_eq!(err.kind(), kmdl_runtime::ErrorKind::InvalidProgram);
}

#[test]
fn malformed_text_is_rejected_at_run_time() {
    // An opcode outside the table.
    let image = scalar_model(vec![0xEE], Type::scalar_tensor(Datatype::Int32));
    let mut interp = Interpreter::new();
    interp.load_model(&image).unwrap();
    let err = interp.entry_function().unwrap().invoke(&[], None).unwrap_err();
    assert_eq!(err.kind(), kmdl_runtime::ErrorKind::InvalidProgram);

    // A branch past the end of the text.
    let mut e = Emitter::new();
    e.emit(&Inst::Br(1000));
    let image = scalar_model(e.finish(), Type::scalar_tensor(Datatype::Int32));
    let mut interp = Interpreter::new();
    interp.load_model(&image).unwrap();
    let err = interp.entry_function().unwrap().invoke(&[], None).unwrap_err();
    assert_eq!(err.kind(), kmdl_runtime::ErrorKind::InvalidProgram);
}

#[test]
fn unknown_module_kind_fails_to_load() {
    let mut builder = ModelBuilder::new();
    builder.add_module(ModuleBuilder::new("gpu-npu-9000", 1));
    let image = builder.build().unwrap();

    let mut interp = Interpreter::new();
    let err = interp.load_model(&image).unwrap_err();
    assert_eq!(err.kind(), kmdl_runtime::ErrorKind::NotFound);
    // The interpreter keeps its pre-load state.
    assert_eq!(interp.modules_size(), 0);
}
