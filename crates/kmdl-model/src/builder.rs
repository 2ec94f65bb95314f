//! Model image builder
//!
//! Builders are append-only: sections and functions keep the order they
//! were added in, so the same inputs always produce the same bytes. When a
//! module carries merged sections their bodies are packed into an implicit
//! `.rdata` section that is appended last to the section table.

use crate::error::{FormatError, Result};
use crate::format::{
    align_up, encode_type, encoded_type_len, FunctionHeader, ModelHeader, ModuleHeader,
    SectionHeader, MODEL_HAS_NO_ENTRY, MODEL_IDENTIFIER, MODEL_VERSION, SECTION_MERGED_INTO_RDATA,
};
use crate::{module_kind, section_name, ModuleKind};
use kmdl_core::Type;

/// Name of the implicit read-only data section
pub const RDATA_SECTION: &str = ".rdata";

/// Default section body alignment
pub const DEFAULT_ALIGNMENT: u32 = 8;

struct SectionEntry {
    name: [u8; 16],
    body: Vec<u8>,
    memory_size: u64,
    merged: bool,
}

/// Builds one function record
pub struct FunctionBuilder {
    parameter_types: Vec<Type>,
    return_type: Type,
    entrypoint: u64,
    text: Vec<u8>,
    sections: Vec<SectionEntry>,
}

impl FunctionBuilder {
    /// Create a function with the given signature
    pub fn new(parameter_types: Vec<Type>, return_type: Type) -> Self {
        Self {
            parameter_types,
            return_type,
            entrypoint: 0,
            text: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// Set the function text
    pub fn text(mut self, text: Vec<u8>) -> Self {
        self.text = text;
        self
    }

    /// Set the entry offset into the text (defaults to 0)
    pub fn entrypoint(mut self, entrypoint: u64) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    /// Add a per-function section.
    ///
    /// Function section bodies always live in the module's `.rdata` region;
    /// the record carries only the descriptor.
    pub fn add_merged_section(mut self, name: &str, body: Vec<u8>, memory_size: u64) -> Self {
        self.sections.push(SectionEntry {
            name: section_name(name),
            body,
            memory_size,
            merged: true,
        });
        self
    }

    fn types_len(&self) -> Result<usize> {
        let mut len = 0;
        for ty in self.parameter_types.iter().chain(Some(&self.return_type)) {
            if matches!(ty, Type::Invalid(_)) {
                return Err(FormatError::invalid_format("invalid type in signature"));
            }
            len += encoded_type_len(ty);
        }
        Ok(len)
    }
}

/// Builds one module record
pub struct ModuleBuilder {
    kind: ModuleKind,
    version: u32,
    sections: Vec<SectionEntry>,
    functions: Vec<FunctionBuilder>,
}

impl ModuleBuilder {
    /// Create a module of the given kind
    pub fn new(kind: &str, version: u32) -> Self {
        Self {
            kind: module_kind(kind),
            version,
            sections: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Add a section with an inline body
    pub fn add_section(&mut self, name: &str, body: Vec<u8>) -> &mut Self {
        let memory_size = body.len() as u64;
        self.add_section_with_memory(name, body, memory_size)
    }

    /// Add a section with an inline body and an explicit runtime reservation
    pub fn add_section_with_memory(
        &mut self,
        name: &str,
        body: Vec<u8>,
        memory_size: u64,
    ) -> &mut Self {
        self.sections.push(SectionEntry {
            name: section_name(name),
            body,
            memory_size,
            merged: false,
        });
        self
    }

    /// Add a section whose body is packed into the module's `.rdata` region
    pub fn add_merged_section(&mut self, name: &str, body: Vec<u8>) -> &mut Self {
        let memory_size = body.len() as u64;
        self.sections.push(SectionEntry {
            name: section_name(name),
            body,
            memory_size,
            merged: true,
        });
        self
    }

    /// Append a function record
    pub fn add_function(&mut self, function: FunctionBuilder) -> &mut Self {
        self.functions.push(function);
        self
    }

    fn has_merged(&self) -> bool {
        self.sections.iter().any(|s| s.merged)
            || self.functions.iter().any(|f| !f.sections.is_empty())
    }

    fn encode(&self, alignment: u64) -> Result<Vec<u8>> {
        // Pack merged bodies into the rdata region first so their offsets
        // are known when the descriptors are written. Module-level merged
        // sections come first, then per-function sections in order.
        let mut rdata = Vec::new();
        let mut merged_offsets = Vec::new();
        let mut fn_merged_offsets: Vec<Vec<u64>> = Vec::new();
        for entry in self.sections.iter().filter(|s| s.merged) {
            merged_offsets.push(pack_into(&mut rdata, &entry.body, alignment));
        }
        for function in &self.functions {
            let mut offsets = Vec::new();
            for entry in &function.sections {
                offsets.push(pack_into(&mut rdata, &entry.body, alignment));
            }
            fn_merged_offsets.push(offsets);
        }

        let has_rdata = self.has_merged();
        if has_rdata
            && self
                .sections
                .iter()
                .any(|s| crate::name_to_str(&s.name) == RDATA_SECTION)
        {
            return Err(FormatError::invalid_format(
                "modules with merged sections emit .rdata implicitly",
            ));
        }
        let table_len = self.sections.len() + usize::from(has_rdata);

        // Function record sizes are needed to place section bodies.
        let mut fn_sizes = Vec::with_capacity(self.functions.len());
        for function in &self.functions {
            let size = FunctionHeader::SIZE
                + function.types_len()?
                + function.sections.len() * SectionHeader::SIZE
                + function.text.len();
            fn_sizes.push(size as u64);
        }

        let bodies_start = ModuleHeader::SIZE as u64
            + (table_len * SectionHeader::SIZE) as u64
            + fn_sizes.iter().sum::<u64>();

        // Place non-merged bodies (including the implicit .rdata, last).
        let mut cursor = bodies_start;
        let mut placed = Vec::new();
        for entry in self.sections.iter().filter(|s| !s.merged) {
            let start = align_up(cursor, alignment);
            placed.push(start);
            cursor = start + entry.body.len() as u64;
        }
        let rdata_start = if has_rdata {
            let start = align_up(cursor, alignment);
            cursor = start + rdata.len() as u64;
            Some(start)
        } else {
            None
        };
        let total_size = cursor;

        let mut out = Vec::with_capacity(total_size as usize);
        let header = ModuleHeader {
            kind: self.kind,
            version: self.version,
            sections: table_len as u32,
            functions: self.functions.len() as u32,
            reserved0: 0,
            size: total_size,
        };
        out.extend_from_slice(&header.to_bytes());

        // Section table, in add order; implicit .rdata goes last.
        let mut placed_iter = placed.iter();
        let mut merged_iter = merged_offsets.iter();
        for entry in &self.sections {
            let (flags, size, body_start) = if entry.merged {
                (SECTION_MERGED_INTO_RDATA, 0, *merged_iter.next().unwrap())
            } else {
                let start = *placed_iter.next().unwrap();
                (0, entry.body.len() as u64, start)
            };
            let header = SectionHeader {
                name: entry.name,
                flags,
                reserved0: 0,
                size,
                body_start,
                body_size: entry.body.len() as u64,
                memory_size: entry.memory_size,
            };
            out.extend_from_slice(&header.to_bytes());
        }
        if has_rdata {
            let header = SectionHeader {
                name: section_name(RDATA_SECTION),
                flags: 0,
                reserved0: 0,
                size: rdata.len() as u64,
                body_start: rdata_start.unwrap(),
                body_size: rdata.len() as u64,
                memory_size: rdata.len() as u64,
            };
            out.extend_from_slice(&header.to_bytes());
        }

        // Function records.
        for (i, function) in self.functions.iter().enumerate() {
            let header = FunctionHeader {
                parameters: function.parameter_types.len() as u32,
                sections: function.sections.len() as u32,
                entrypoint: function.entrypoint,
                text_size: function.text.len() as u64,
                size: fn_sizes[i],
            };
            out.extend_from_slice(&header.to_bytes());
            for ty in &function.parameter_types {
                encode_type(ty, &mut out)?;
            }
            encode_type(&function.return_type, &mut out)?;
            for (entry, &offset) in function.sections.iter().zip(&fn_merged_offsets[i]) {
                let header = SectionHeader {
                    name: entry.name,
                    flags: SECTION_MERGED_INTO_RDATA,
                    reserved0: 0,
                    size: 0,
                    body_start: offset,
                    body_size: entry.body.len() as u64,
                    memory_size: entry.memory_size,
                };
                out.extend_from_slice(&header.to_bytes());
            }
            out.extend_from_slice(&function.text);
        }

        // Section bodies.
        for entry in self.sections.iter().filter(|s| !s.merged) {
            pad_to(&mut out, alignment);
            out.extend_from_slice(&entry.body);
        }
        if has_rdata {
            pad_to(&mut out, alignment);
            out.extend_from_slice(&rdata);
        }

        debug_assert_eq!(out.len() as u64, total_size);
        Ok(out)
    }
}

/// Builds a complete model image
pub struct ModelBuilder {
    alignment: u32,
    flags: u32,
    entry: Option<(u32, u32)>,
    modules: Vec<ModuleBuilder>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    /// Create a builder with the default alignment
    pub fn new() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            flags: 0,
            entry: None,
            modules: Vec::new(),
        }
    }

    /// Override the section body alignment (must be a power of two)
    pub fn alignment(mut self, alignment: u32) -> Self {
        assert!(alignment.is_power_of_two());
        self.alignment = alignment;
        self
    }

    /// Append a module, returning its index
    pub fn add_module(&mut self, module: ModuleBuilder) -> u32 {
        self.modules.push(module);
        self.modules.len() as u32 - 1
    }

    /// Set the entry function
    pub fn set_entry(&mut self, module: u32, function: u32) -> &mut Self {
        self.entry = Some((module, function));
        self
    }

    /// Emit the model image
    pub fn build(&self) -> Result<Vec<u8>> {
        let (entry_module, entry_function) = self.entry.unwrap_or((MODEL_HAS_NO_ENTRY, 0));
        if let Some((module, function)) = self.entry {
            let functions = self
                .modules
                .get(module as usize)
                .map(|m| m.functions.len() as u32)
                .ok_or_else(|| FormatError::invalid_format("entry module out of range"))?;
            if function >= functions {
                return Err(FormatError::invalid_format("entry function out of range"));
            }
        }

        let header = ModelHeader {
            identifier: MODEL_IDENTIFIER,
            version: MODEL_VERSION,
            flags: self.flags,
            alignment: self.alignment,
            modules: self.modules.len() as u32,
            entry_module,
            entry_function,
            reserved0: 0,
        };

        let mut out = Vec::new();
        out.extend_from_slice(&header.to_bytes());
        for module in &self.modules {
            pad_to(&mut out, self.alignment as u64);
            let record = module.encode(self.alignment as u64)?;
            out.extend_from_slice(&record);
        }
        log::debug!("built model image: {} modules, {} bytes", self.modules.len(), out.len());
        Ok(out)
    }
}

fn pack_into(rdata: &mut Vec<u8>, body: &[u8], alignment: u64) -> u64 {
    let start = align_up(rdata.len() as u64, alignment);
    rdata.resize(start as usize, 0);
    rdata.extend_from_slice(body);
    start
}

fn pad_to(out: &mut Vec<u8>, alignment: u64) {
    let target = align_up(out.len() as u64, alignment);
    out.resize(target as usize, 0);
}
