//! Header layouts and the type signature codec
//!
//! All records are little-endian and contiguous. Headers encode and decode
//! field-by-field through byte arrays so the layout is independent of host
//! struct padding and alignment.

use crate::error::{FormatError, Result};
use crate::reader::ModelRead;
use kmdl_core::{Datatype, Shape, Type};

/// Magic identifier, `'KMDL'` read little-endian
pub const MODEL_IDENTIFIER: u32 = 0x4C44_4D4B;

/// Model format version this build reads and writes
pub const MODEL_VERSION: u32 = 7;

/// `entry_module` value for models with no entry point
pub const MODEL_HAS_NO_ENTRY: u32 = 0xFFFF_FFFF;

/// Maximum length of a section name
pub const MAX_SECTION_NAME_LENGTH: usize = 16;

/// Maximum length of a module kind tag
pub const MAX_MODULE_KIND_LENGTH: usize = 16;

/// Section flag: the body lives in the module's `.rdata` region and
/// `body_start`/`body_size` address into it
pub const SECTION_MERGED_INTO_RDATA: u32 = 1;

/// Top-level model header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHeader {
    /// Magic identifier, must equal [`MODEL_IDENTIFIER`]
    pub identifier: u32,
    /// Format version, must equal [`MODEL_VERSION`]
    pub version: u32,
    /// Model flags; none are currently assigned
    pub flags: u32,
    /// Power-of-two byte alignment the loader must observe for section
    /// bodies mapped in place
    pub alignment: u32,
    /// Number of module records following this header
    pub modules: u32,
    /// Index of the entry module, or [`MODEL_HAS_NO_ENTRY`]
    pub entry_module: u32,
    /// Index of the entry function within the entry module
    pub entry_function: u32,
    /// Reserved, must be zero
    pub reserved0: u32,
}

impl ModelHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 32;

    /// Encode into the wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let fields = [
            self.identifier,
            self.version,
            self.flags,
            self.alignment,
            self.modules,
            self.entry_module,
            self.entry_function,
            self.reserved0,
        ];
        for (i, f) in fields.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        out
    }

    /// Decode from the wire layout without validation
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let field = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        Self {
            identifier: field(0),
            version: field(1),
            flags: field(2),
            alignment: field(3),
            modules: field(4),
            entry_module: field(5),
            entry_function: field(6),
            reserved0: field(7),
        }
    }

    /// Read and validate a header
    pub fn read(reader: &mut impl ModelRead) -> Result<Self> {
        let header = Self::from_bytes(reader.read_array()?);
        header.validate()?;
        Ok(header)
    }

    /// Validate identifier, version, and alignment
    pub fn validate(&self) -> Result<()> {
        if self.identifier != MODEL_IDENTIFIER {
            return Err(FormatError::InvalidIdentifier {
                expected: MODEL_IDENTIFIER,
                found: self.identifier,
            });
        }
        if self.version != MODEL_VERSION {
            return Err(FormatError::UnsupportedVersion {
                version: self.version,
                supported: MODEL_VERSION,
            });
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(FormatError::invalid_format(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Per-module record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHeader {
    /// Module kind tag, zero-padded; selects the runtime executor
    pub kind: [u8; MAX_MODULE_KIND_LENGTH],
    /// Module kind version
    pub version: u32,
    /// Number of section records in this module
    pub sections: u32,
    /// Number of function records in this module
    pub functions: u32,
    /// Reserved, must be zero
    pub reserved0: u32,
    /// Total size of this module record in bytes, header included
    pub size: u64,
}

impl ModuleHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 40;

    /// Encode into the wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..16].copy_from_slice(&self.kind);
        out[16..20].copy_from_slice(&self.version.to_le_bytes());
        out[20..24].copy_from_slice(&self.sections.to_le_bytes());
        out[24..28].copy_from_slice(&self.functions.to_le_bytes());
        out[28..32].copy_from_slice(&self.reserved0.to_le_bytes());
        out[32..40].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Decode from the wire layout
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            kind: bytes[0..16].try_into().unwrap(),
            version: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            sections: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            functions: u32::from_le_bytes(bytes[24..28].try_into().unwrap()),
            reserved0: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
        }
    }

    /// Read a header
    pub fn read(reader: &mut impl ModelRead) -> Result<Self> {
        Ok(Self::from_bytes(reader.read_array()?))
    }
}

/// Section descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section name, zero-padded
    pub name: [u8; MAX_SECTION_NAME_LENGTH],
    /// Section flags; see [`SECTION_MERGED_INTO_RDATA`]
    pub flags: u32,
    /// Reserved, must be zero
    pub reserved0: u32,
    /// Bytes the section body occupies in the file (0 when merged)
    pub size: u64,
    /// Body offset: from the start of the owning record, or into the
    /// module's `.rdata` region when the merged flag is set
    pub body_start: u64,
    /// Logical body length in bytes
    pub body_size: u64,
    /// Bytes to reserve for this section at run time (≥ `body_size`)
    pub memory_size: u64,
}

impl SectionHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 56;

    /// Whether the body lives in the module's `.rdata` region
    pub fn is_merged_into_rdata(&self) -> bool {
        self.flags & SECTION_MERGED_INTO_RDATA != 0
    }

    /// Encode into the wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..16].copy_from_slice(&self.name);
        out[16..20].copy_from_slice(&self.flags.to_le_bytes());
        out[20..24].copy_from_slice(&self.reserved0.to_le_bytes());
        out[24..32].copy_from_slice(&self.size.to_le_bytes());
        out[32..40].copy_from_slice(&self.body_start.to_le_bytes());
        out[40..48].copy_from_slice(&self.body_size.to_le_bytes());
        out[48..56].copy_from_slice(&self.memory_size.to_le_bytes());
        out
    }

    /// Decode from the wire layout
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            name: bytes[0..16].try_into().unwrap(),
            flags: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            reserved0: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            body_start: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            body_size: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
            memory_size: u64::from_le_bytes(bytes[48..56].try_into().unwrap()),
        }
    }

    /// Read a header
    pub fn read(reader: &mut impl ModelRead) -> Result<Self> {
        Ok(Self::from_bytes(reader.read_array()?))
    }
}

/// Function record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHeader {
    /// Number of encoded parameter types following this header
    pub parameters: u32,
    /// Number of per-function section records
    pub sections: u32,
    /// Entry offset into the function text
    pub entrypoint: u64,
    /// Text length in bytes
    pub text_size: u64,
    /// Total size of this function record in bytes, header included
    pub size: u64,
}

impl FunctionHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 32;

    /// Encode into the wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.parameters.to_le_bytes());
        out[4..8].copy_from_slice(&self.sections.to_le_bytes());
        out[8..16].copy_from_slice(&self.entrypoint.to_le_bytes());
        out[16..24].copy_from_slice(&self.text_size.to_le_bytes());
        out[24..32].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Decode from the wire layout
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            parameters: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            sections: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            entrypoint: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            text_size: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
        }
    }

    /// Read a header
    pub fn read(reader: &mut impl ModelRead) -> Result<Self> {
        Ok(Self::from_bytes(reader.read_array()?))
    }
}

// Type signature tags. `Invalid` never appears on the wire.
const TYPE_TAG_ANY: u8 = 0;
const TYPE_TAG_PRIM: u8 = 1;
const TYPE_TAG_TENSOR: u8 = 2;
const TYPE_TAG_TUPLE: u8 = 3;

/// Encode a type signature into `out`.
///
/// Tensor shapes are encoded as `{count: u32, dims: u32 * count}`.
pub fn encode_type(ty: &Type, out: &mut Vec<u8>) -> Result<()> {
    match ty {
        Type::Any => out.push(TYPE_TAG_ANY),
        Type::Invalid(reason) => {
            return Err(FormatError::invalid_format(format!(
                "cannot encode invalid type: {}",
                reason
            )))
        }
        Type::Prim(dt) => {
            out.push(TYPE_TAG_PRIM);
            out.push(dt.typecode());
        }
        Type::Tensor(t) => {
            out.push(TYPE_TAG_TENSOR);
            out.push(t.dtype.typecode());
            out.extend_from_slice(&(t.shape.len() as u32).to_le_bytes());
            for &dim in &t.shape {
                out.extend_from_slice(&(dim as u32).to_le_bytes());
            }
        }
        Type::Tuple(fields) => {
            out.push(TYPE_TAG_TUPLE);
            out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
            for field in fields {
                encode_type(field, out)?;
            }
        }
    }
    Ok(())
}

/// Encoded length of a type signature in bytes
pub fn encoded_type_len(ty: &Type) -> usize {
    match ty {
        Type::Any => 1,
        Type::Invalid(_) => 0,
        Type::Prim(_) => 2,
        Type::Tensor(t) => 2 + 4 + 4 * t.shape.len(),
        Type::Tuple(fields) => 1 + 4 + fields.iter().map(encoded_type_len).sum::<usize>(),
    }
}

/// Decode one type signature
pub fn decode_type(reader: &mut impl ModelRead) -> Result<Type> {
    match reader.read_u8()? {
        TYPE_TAG_ANY => Ok(Type::Any),
        TYPE_TAG_PRIM => {
            let code = reader.read_u8()?;
            let dt = decode_datatype(code)?;
            Ok(Type::Prim(dt))
        }
        TYPE_TAG_TENSOR => {
            let code = reader.read_u8()?;
            let dt = decode_datatype(code)?;
            let count = reader.read_u32()? as usize;
            let mut shape = Shape::with_capacity(count);
            for _ in 0..count {
                shape.push(reader.read_u32()? as usize);
            }
            Ok(Type::tensor(dt, shape))
        }
        TYPE_TAG_TUPLE => {
            let count = reader.read_u32()? as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(decode_type(reader)?);
            }
            Ok(Type::Tuple(fields))
        }
        tag => Err(FormatError::invalid_format(format!(
            "unknown type tag {}",
            tag
        ))),
    }
}

fn decode_datatype(code: u8) -> Result<Datatype> {
    Datatype::from_typecode(code)
        .ok_or_else(|| FormatError::invalid_format(format!("unknown typecode {}", code)))
}

/// Round `value` up to the next multiple of `alignment`
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::SpanReader;
    use crate::section_name;
    use kmdl_core::Shape;

    #[test]
    fn test_model_header_roundtrip() {
        let header = ModelHeader {
            identifier: MODEL_IDENTIFIER,
            version: MODEL_VERSION,
            flags: 0,
            alignment: 8,
            modules: 2,
            entry_module: 0,
            entry_function: 1,
            reserved0: 0,
        };
        let decoded = ModelHeader::from_bytes(header.to_bytes());
        assert_eq!(decoded, header);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_model_header_validation() {
        let mut header = ModelHeader {
            identifier: MODEL_IDENTIFIER,
            version: MODEL_VERSION,
            flags: 0,
            alignment: 8,
            modules: 0,
            entry_module: MODEL_HAS_NO_ENTRY,
            entry_function: 0,
            reserved0: 0,
        };
        header.identifier = 0x1234;
        assert!(matches!(
            header.validate(),
            Err(FormatError::InvalidIdentifier { .. })
        ));

        header.identifier = MODEL_IDENTIFIER;
        header.version = 5;
        assert!(matches!(
            header.validate(),
            Err(FormatError::UnsupportedVersion { version: 5, supported: 7 })
        ));

        header.version = MODEL_VERSION;
        header.alignment = 3;
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_section_header_roundtrip() {
        let header = SectionHeader {
            name: section_name(".text"),
            flags: SECTION_MERGED_INTO_RDATA,
            reserved0: 0,
            size: 0,
            body_start: 64,
            body_size: 128,
            memory_size: 256,
        };
        let decoded = SectionHeader::from_bytes(header.to_bytes());
        assert_eq!(decoded, header);
        assert!(decoded.is_merged_into_rdata());
    }

    #[test]
    fn test_function_header_roundtrip() {
        let header = FunctionHeader {
            parameters: 2,
            sections: 0,
            entrypoint: 16,
            text_size: 80,
            size: 144,
        };
        assert_eq!(FunctionHeader::from_bytes(header.to_bytes()), header);
    }

    #[test]
    fn test_type_codec_roundtrip() {
        let types = [
            Type::Any,
            Type::Prim(Datatype::Int64),
            Type::scalar_tensor(Datatype::Float32),
            Type::tensor(Datatype::UInt8, Shape::from_slice(&[2, 3, 4])),
            Type::Tuple(vec![
                Type::tensor(Datatype::Float32, Shape::from_slice(&[16])),
                Type::Tuple(vec![Type::Any]),
            ]),
        ];
        for ty in &types {
            let mut bytes = Vec::new();
            encode_type(ty, &mut bytes).unwrap();
            assert_eq!(bytes.len(), encoded_type_len(ty));
            let decoded = decode_type(&mut SpanReader::new(&bytes)).unwrap();
            assert_eq!(&decoded, ty);
        }
    }

    #[test]
    fn test_invalid_type_not_encodable() {
        let mut bytes = Vec::new();
        assert!(encode_type(&Type::invalid("nope"), &mut bytes).is_err());
    }

    #[test]
    fn test_unknown_typecode_rejected() {
        let bytes = [TYPE_TAG_PRIM, 0xEE];
        assert!(decode_type(&mut SpanReader::new(&bytes)).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 4), 12);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_tensor_type() -> impl Strategy<Value = Type> {
            (0u8..13, proptest::collection::vec(0u32..1000, 0..4)).prop_map(|(code, dims)| {
                let dt = Datatype::from_typecode(code).unwrap();
                Type::tensor(dt, dims.iter().map(|&d| d as usize).collect::<Shape>())
            })
        }

        proptest! {
            #[test]
            fn type_codec_roundtrips(ty in proptest::strategy::Union::new(vec![
                Just(Type::Any).boxed(),
                arb_tensor_type().boxed(),
                proptest::collection::vec(arb_tensor_type(), 0..4)
                    .prop_map(Type::Tuple)
                    .boxed(),
            ])) {
                let mut bytes = Vec::new();
                encode_type(&ty, &mut bytes).unwrap();
                prop_assert_eq!(bytes.len(), encoded_type_len(&ty));
                let decoded = decode_type(&mut SpanReader::new(&bytes)).unwrap();
                prop_assert_eq!(decoded, ty);
            }

            #[test]
            fn align_up_is_idempotent_and_monotone(value in 0u64..1 << 40, shift in 0u32..12) {
                let alignment = 1u64 << shift;
                let aligned = align_up(value, alignment);
                prop_assert!(aligned >= value);
                prop_assert!(aligned - value < alignment);
                prop_assert_eq!(align_up(aligned, alignment), aligned);
            }
        }
    }
}
