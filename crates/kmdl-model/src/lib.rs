//! KMDL model binary format
//!
//! A model is a contiguous little-endian image: a model header, then one
//! record per runtime module. Each module record carries a kind tag, its
//! section table, and its function records; section bodies either live
//! inline in the module record or are merged into the module's read-only
//! data region (`.rdata`) and referenced by offset.
//!
//! This crate owns the byte-level layout: header codecs, the type
//! signature encoding, unaligned span/stream readers, a structural parser,
//! and the builder that emits loadable images.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod error;
pub mod format;
pub mod parse;
pub mod reader;

pub use builder::{FunctionBuilder, ModelBuilder, ModuleBuilder};
pub use error::{FormatError, Result};
pub use format::{
    align_up, decode_type, encode_type, encoded_type_len, FunctionHeader, ModelHeader, ModuleHeader,
    SectionHeader, MAX_MODULE_KIND_LENGTH, MAX_SECTION_NAME_LENGTH, MODEL_HAS_NO_ENTRY,
    MODEL_IDENTIFIER, MODEL_VERSION, SECTION_MERGED_INTO_RDATA,
};
pub use parse::{ParsedFunction, ParsedModel, ParsedModule, ParsedSection};
pub use reader::{ModelRead, SpanReader, StreamReader};

/// Fixed-size array holding a module kind tag
pub type ModuleKind = [u8; MAX_MODULE_KIND_LENGTH];

/// Build a module kind tag from a string, zero-padded
pub fn module_kind(name: &str) -> ModuleKind {
    let mut kind = [0u8; MAX_MODULE_KIND_LENGTH];
    let bytes = name.as_bytes();
    assert!(bytes.len() <= MAX_MODULE_KIND_LENGTH, "module kind too long");
    kind[..bytes.len()].copy_from_slice(bytes);
    kind
}

/// Build a section name array from a string, zero-padded
pub fn section_name(name: &str) -> [u8; MAX_SECTION_NAME_LENGTH] {
    let mut out = [0u8; MAX_SECTION_NAME_LENGTH];
    let bytes = name.as_bytes();
    assert!(bytes.len() <= MAX_SECTION_NAME_LENGTH, "section name too long");
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// Read a zero-padded name array back into a `&str`
pub fn name_to_str(name: &[u8]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    std::str::from_utf8(&name[..end]).unwrap_or("")
}
