//! Loader/builder round-trip over complete model images

use kmdl_core::{Datatype, Shape, Type};
use kmdl_model::{
    FunctionBuilder, ModelBuilder, ModelHeader, ModuleBuilder, ParsedModel, MODEL_IDENTIFIER,
};

fn two_module_model() -> Vec<u8> {
    let mut builder = ModelBuilder::new().alignment(16);

    let mut main = ModuleBuilder::new("stackvm", 1);
    main.add_merged_section(".consts", (0u8..40).collect());
    main.add_section_with_memory(".data", vec![1, 2, 3, 4], 64);
    main.add_function(
        FunctionBuilder::new(
            vec![Type::tensor(Datatype::Float32, Shape::from_slice(&[2, 3]))],
            Type::tensor(Datatype::Float32, Shape::from_slice(&[2, 3])),
        )
        .text(vec![0x65]),
    );
    main.add_function(
        FunctionBuilder::new(vec![], Type::scalar_tensor(Datatype::Int32))
            .entrypoint(2)
            .text(vec![0x00, 0x00, 0x65]),
    );
    let main_index = builder.add_module(main);

    let mut aux = ModuleBuilder::new("custom-npu", 3);
    aux.add_section(".weights", vec![0xAB; 100]);
    builder.add_module(aux);

    builder.set_entry(main_index, 1);
    builder.build().unwrap()
}

#[test]
fn parse_preserves_every_observable_field() {
    let image = two_module_model();
    let model = ParsedModel::parse(&image).unwrap();

    assert_eq!(model.header.alignment, 16);
    assert_eq!(model.header.modules, 2);
    assert_eq!(model.entry(), Some((0, 1)));

    let main = &model.modules[0];
    assert_eq!(main.kind(), "stackvm");
    assert_eq!(main.header.version, 1);
    let consts = main.section(".consts").unwrap();
    assert!(consts.header.is_merged_into_rdata());
    assert_eq!(consts.body, (0u8..40).collect::<Vec<_>>());
    let data = main.section(".data").unwrap();
    assert_eq!(data.header.memory_size, 64);
    assert_eq!(data.body, vec![1, 2, 3, 4]);

    assert_eq!(main.functions[0].parameter_types.len(), 1);
    assert_eq!(
        main.functions[0].return_type,
        Type::tensor(Datatype::Float32, Shape::from_slice(&[2, 3]))
    );
    assert_eq!(main.functions[1].header.entrypoint, 2);
    assert_eq!(main.functions[1].text, vec![0x00, 0x00, 0x65]);

    let aux = &model.modules[1];
    assert_eq!(aux.kind(), "custom-npu");
    assert_eq!(aux.section(".weights").unwrap().body.len(), 100);
}

#[test]
fn rebuild_is_bit_exact() {
    let image = two_module_model();
    let model = ParsedModel::parse(&image).unwrap();
    let rebuilt = model.to_builder().build().unwrap();
    assert_eq!(rebuilt, image);

    // And again through a second parse, to be sure nothing drifts.
    let again = ParsedModel::parse(&rebuilt).unwrap().to_builder().build().unwrap();
    assert_eq!(again, image);
}

#[test]
fn version_gate() {
    let mut image = two_module_model();
    // The version field sits right after the identifier.
    image[4..8].copy_from_slice(&5u32.to_le_bytes());
    let err = ParsedModel::parse(&image).unwrap_err();
    assert!(matches!(err, kmdl_model::FormatError::UnsupportedVersion { version: 5, .. }));
}

#[test]
fn identifier_encodes_kmdl() {
    assert_eq!(&MODEL_IDENTIFIER.to_le_bytes(), b"KMDL");
    let image = two_module_model();
    let header = ModelHeader::from_bytes(image[..ModelHeader::SIZE].try_into().unwrap());
    assert_eq!(header.identifier, MODEL_IDENTIFIER);
}

#[test]
fn truncation_points_all_fail_cleanly() {
    let image = two_module_model();
    for cut in [0, 5, ModelHeader::SIZE - 1, ModelHeader::SIZE + 10, image.len() - 1] {
        assert!(ParsedModel::parse(&image[..cut]).is_err(), "cut at {}", cut);
    }
}
