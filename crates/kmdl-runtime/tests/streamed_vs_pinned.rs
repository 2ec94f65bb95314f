//! Pinned and streamed loading of the same model must behave identically

use kmdl_core::{Datatype, Shape, Type};
use kmdl_model::{FunctionBuilder, ModelBuilder, ModuleBuilder};
use kmdl_runtime::stackvm::{BinaryOpKind, Emitter, Inst, RuntimeShape4, TensorOp};
use kmdl_runtime::{host_tensor, Interpreter, MapAccess, Value};
use std::io::Write;

// f(lhs, rhs) = lhs - rhs with broadcasting, plus a constant bias pulled
// from the merged constant section.
fn broadcast_model() -> Vec<u8> {
    let lhs_t = Type::tensor(Datatype::Float32, Shape::from_slice(&[2, 1, 3]));
    let rhs_t = Type::tensor(Datatype::Float32, Shape::from_slice(&[1, 2, 3]));
    let out_t = Type::tensor(Datatype::Float32, Shape::from_slice(&[2, 2, 3]));

    let bias: Vec<u8> = [100.0f32; 12].iter().flat_map(|v| v.to_le_bytes()).collect();

    let mut e = Emitter::new();
    e.emit(&Inst::Ldarg(0)).emit(&Inst::Ldarg(1));
    e.emit(&Inst::Tensor(TensorOp::Binary {
        op: BinaryOpKind::Sub,
        dtype: Datatype::Float32,
        src1: RuntimeShape4::from_shape(&[2, 1, 3]).unwrap(),
        src2: RuntimeShape4::from_shape(&[1, 2, 3]).unwrap(),
        dest: RuntimeShape4::from_shape(&[2, 2, 3]).unwrap(),
    }));
    e.emit(&Inst::LdcTensor {
        dtype: Datatype::Float32,
        offset: 0,
        shape: Shape::from_slice(&[2, 2, 3]),
    });
    e.emit(&Inst::Tensor(TensorOp::Binary {
        op: BinaryOpKind::Add,
        dtype: Datatype::Float32,
        src1: RuntimeShape4::from_shape(&[2, 2, 3]).unwrap(),
        src2: RuntimeShape4::from_shape(&[2, 2, 3]).unwrap(),
        dest: RuntimeShape4::from_shape(&[2, 2, 3]).unwrap(),
    }));
    e.emit(&Inst::Ret);

    let mut builder = ModelBuilder::new();
    let mut module = ModuleBuilder::new("stackvm", 1);
    module.add_merged_section(".consts", bias);
    module.add_function(FunctionBuilder::new(vec![lhs_t, rhs_t], out_t).text(e.finish()));
    let index = builder.add_module(module);
    builder.set_entry(index, 0);
    builder.build().unwrap()
}

fn inputs() -> Vec<Value> {
    let lhs = host_tensor::from_elems(
        Shape::from_slice(&[2, 1, 3]),
        &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0],
    )
    .unwrap();
    let rhs = host_tensor::from_elems(
        Shape::from_slice(&[1, 2, 3]),
        &[10.0f32, 20.0, 30.0, 40.0, 50.0, 60.0],
    )
    .unwrap();
    vec![Value::Tensor(lhs), Value::Tensor(rhs)]
}

fn result_bytes(interp: &mut Interpreter) -> Vec<u8> {
    let result = interp
        .entry_function()
        .unwrap()
        .invoke(&inputs(), None)
        .unwrap();
    let tensor = result.as_tensor().unwrap();
    let map = tensor.map(MapAccess::READ).unwrap();
    map.as_slice().to_vec()
}

#[test]
fn streamed_and_pinned_results_are_bit_identical() {
    let image = broadcast_model();

    let mut pinned = Interpreter::new();
    pinned.load_model(&image).unwrap();
    let pinned_bytes = result_bytes(&mut pinned);

    let mut streamed = Interpreter::new();
    streamed
        .load_model_stream(std::io::Cursor::new(image.clone()))
        .unwrap();
    let streamed_bytes = result_bytes(&mut streamed);

    assert_eq!(pinned_bytes, streamed_bytes);

    // Spot-check the actual numbers behind the bytes.
    let values: Vec<f32> = pinned_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(
        values,
        vec![
            91.0, 82.0, 73.0, 61.0, 52.0, 43.0, //
            94.0, 85.0, 76.0, 64.0, 55.0, 46.0,
        ]
    );
}

#[test]
fn mmap_loading_matches_in_memory_loading() {
    let image = broadcast_model();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file.flush().unwrap();

    let mut mapped = Interpreter::new();
    mapped.load_model_file(file.path()).unwrap();
    let mapped_bytes = result_bytes(&mut mapped);

    let mut in_memory = Interpreter::new();
    in_memory.load_model(&image).unwrap();
    assert_eq!(mapped_bytes, result_bytes(&mut in_memory));
}

#[test]
fn repeated_invocations_are_deterministic() {
    let image = broadcast_model();
    let mut interp = Interpreter::new();
    interp.load_model(&image).unwrap();

    let first = result_bytes(&mut interp);
    let second = result_bytes(&mut interp);
    assert_eq!(first, second);
}
