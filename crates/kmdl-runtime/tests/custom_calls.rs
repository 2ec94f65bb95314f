//! Named native extensions reached through the VM's custom-call path

use kmdl_core::{Datatype, Shape, Type};
use kmdl_model::{FunctionBuilder, ModelBuilder, ModuleBuilder};
use kmdl_runtime::stackvm::{encode_name_table, Emitter, Inst, CUSTOM_SECTION};
use kmdl_runtime::{
    host_tensor, register_custom_call, ErrorKind, Interpreter, MapAccess, MemoryPool, Result,
    Value,
};

fn scale_by_two(args: &[Value]) -> Result<Value> {
    let input = args[0].as_tensor()?.to_host()?;
    let output = host_tensor::create(
        input.datatype(),
        Shape::from_slice(input.shape()),
        MemoryPool::CpuOnly,
    )?;
    {
        let src = input.map(MapAccess::READ)?;
        let mut dst = output.map(MapAccess::WRITE)?;
        for (s, d) in src
            .as_slice()
            .chunks_exact(4)
            .zip(dst.as_mut_slice()?.chunks_exact_mut(4))
        {
            let v = f32::from_le_bytes(s.try_into().unwrap()) * 2.0;
            d.copy_from_slice(&v.to_le_bytes());
        }
    }
    Ok(Value::Tensor(output))
}

fn custom_call_model() -> Vec<u8> {
    let tensor = Type::tensor(Datatype::Float32, Shape::from_slice(&[4]));
    let mut e = Emitter::new();
    e.emit(&Inst::Ldarg(0))
        .emit(&Inst::CusCall { index: 0, args: 1 })
        .emit(&Inst::Ret);

    let mut builder = ModelBuilder::new();
    let mut module = ModuleBuilder::new("stackvm", 1);
    module.add_section(CUSTOM_SECTION, encode_name_table(&["test.scale_by_two"]));
    module.add_function(FunctionBuilder::new(vec![tensor.clone()], tensor).text(e.finish()));
    let index = builder.add_module(module);
    builder.set_entry(index, 0);
    builder.build().unwrap()
}

#[test]
fn registered_custom_call_is_dispatched() {
    register_custom_call("stackvm", "test.scale_by_two", scale_by_two);

    let mut interp = Interpreter::new();
    interp.load_model(&custom_call_model()).unwrap();

    let input = host_tensor::from_elems(Shape::from_slice(&[4]), &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    let result = interp
        .entry_function()
        .unwrap()
        .invoke(&[Value::Tensor(input)], None)
        .unwrap();

    let tensor = result.as_tensor().unwrap();
    let map = tensor.map(MapAccess::READ).unwrap();
    let values: Vec<f32> = map
        .as_slice()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(values, vec![2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn unknown_custom_call_fails_at_load() {
    let tensor = Type::tensor(Datatype::Float32, Shape::from_slice(&[4]));
    let mut e = Emitter::new();
    e.emit(&Inst::Ldarg(0)).emit(&Inst::Ret);

    let mut builder = ModelBuilder::new();
    let mut module = ModuleBuilder::new("stackvm", 1);
    module.add_section(CUSTOM_SECTION, encode_name_table(&["test.never_registered"]));
    module.add_function(FunctionBuilder::new(vec![tensor.clone()], tensor).text(e.finish()));
    let index = builder.add_module(module);
    builder.set_entry(index, 0);
    let image = builder.build().unwrap();

    let mut interp = Interpreter::new();
    let err = interp.load_model(&image).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
