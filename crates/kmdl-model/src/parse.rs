//! Structural parser for model images
//!
//! Parses a pinned byte image into an owned structure, resolving merged
//! section bodies against the module's `.rdata` region. The parse keeps
//! every semantically observable field, so a parsed model can be fed back
//! through the builder and reproduce the original image byte for byte.

use crate::builder::{FunctionBuilder, ModelBuilder, ModuleBuilder, RDATA_SECTION};
use crate::error::{FormatError, Result};
use crate::format::{
    align_up, decode_type, FunctionHeader, ModelHeader, ModuleHeader, SectionHeader,
    MODEL_HAS_NO_ENTRY,
};
use crate::reader::{ModelRead, SpanReader};
use crate::name_to_str;
use kmdl_core::Type;

/// A parsed section with its resolved body
#[derive(Debug, Clone)]
pub struct ParsedSection {
    /// The section descriptor as read from the image
    pub header: SectionHeader,
    /// Resolved body bytes (looked up in `.rdata` for merged sections)
    pub body: Vec<u8>,
}

impl ParsedSection {
    /// Section name
    pub fn name(&self) -> &str {
        name_to_str(&self.header.name)
    }
}

/// A parsed function record
#[derive(Debug, Clone)]
pub struct ParsedFunction {
    /// The function record header
    pub header: FunctionHeader,
    /// Declared parameter types
    pub parameter_types: Vec<Type>,
    /// Declared return type
    pub return_type: Type,
    /// Per-function sections (bodies resolved in `.rdata`)
    pub sections: Vec<ParsedSection>,
    /// Function text
    pub text: Vec<u8>,
}

/// A parsed module record
#[derive(Debug, Clone)]
pub struct ParsedModule {
    /// The module record header
    pub header: ModuleHeader,
    /// Module sections, in table order
    pub sections: Vec<ParsedSection>,
    /// Function records, in order
    pub functions: Vec<ParsedFunction>,
}

impl ParsedModule {
    /// Module kind tag as a string
    pub fn kind(&self) -> &str {
        name_to_str(&self.header.kind)
    }

    /// Find a section by name
    pub fn section(&self, name: &str) -> Option<&ParsedSection> {
        self.sections.iter().find(|s| s.name() == name)
    }
}

/// A fully parsed model image
#[derive(Debug, Clone)]
pub struct ParsedModel {
    /// The model header
    pub header: ModelHeader,
    /// Module records, in order
    pub modules: Vec<ParsedModule>,
}

impl ParsedModel {
    /// Parse a pinned model image
    pub fn parse(image: &[u8]) -> Result<ParsedModel> {
        let mut reader = SpanReader::new(image);
        let header = ModelHeader::read(&mut reader)?;
        let alignment = header.alignment as u64;

        let mut modules = Vec::with_capacity(header.modules as usize);
        for _ in 0..header.modules {
            let module_start = align_up(reader.position() as u64, alignment) as usize;
            reader.seek(module_start)?;
            let module_header = ModuleHeader::read(&mut reader)?;
            let module_end = module_start as u64 + module_header.size;
            if module_end > image.len() as u64 {
                return Err(FormatError::invalid_format("module record overruns image"));
            }
            let module_span = &image[module_start..module_end as usize];
            modules.push(parse_module(module_header, module_span)?);
            reader.seek(module_end as usize)?;
        }

        if header.entry_module != MODEL_HAS_NO_ENTRY {
            let functions = modules
                .get(header.entry_module as usize)
                .map(|m| m.functions.len() as u32)
                .ok_or_else(|| FormatError::invalid_format("entry module out of range"))?;
            if header.entry_function >= functions {
                return Err(FormatError::invalid_format("entry function out of range"));
            }
        }

        Ok(ParsedModel { header, modules })
    }

    /// Reconstruct a builder that reproduces this image
    pub fn to_builder(&self) -> ModelBuilder {
        let mut builder = ModelBuilder::new().alignment(self.header.alignment);
        for module in &self.modules {
            let mut mb = ModuleBuilder::new(module.kind(), module.header.version);
            let implicit_rdata = module.sections.iter().any(|s| s.header.is_merged_into_rdata())
                || module.functions.iter().any(|f| !f.sections.is_empty());
            for section in &module.sections {
                if section.header.is_merged_into_rdata() {
                    mb.add_merged_section(section.name(), section.body.clone());
                } else if !(implicit_rdata && section.name() == RDATA_SECTION) {
                    mb.add_section_with_memory(
                        section.name(),
                        section.body.clone(),
                        section.header.memory_size,
                    );
                }
            }
            for function in &module.functions {
                let mut fb = FunctionBuilder::new(
                    function.parameter_types.clone(),
                    function.return_type.clone(),
                )
                .entrypoint(function.header.entrypoint)
                .text(function.text.clone());
                for section in &function.sections {
                    fb = fb.add_merged_section(
                        section.name(),
                        section.body.clone(),
                        section.header.memory_size,
                    );
                }
                mb.add_function(fb);
            }
            builder.add_module(mb);
        }
        if self.header.entry_module != MODEL_HAS_NO_ENTRY {
            builder.set_entry(self.header.entry_module, self.header.entry_function);
        }
        builder
    }

    /// The entry function as `(module, function)` indices, if declared
    pub fn entry(&self) -> Option<(u32, u32)> {
        if self.header.entry_module == MODEL_HAS_NO_ENTRY {
            None
        } else {
            Some((self.header.entry_module, self.header.entry_function))
        }
    }
}

fn parse_module(header: ModuleHeader, span: &[u8]) -> Result<ParsedModule> {
    let mut reader = SpanReader::new(span);
    reader.seek(ModuleHeader::SIZE)?;

    let mut section_headers = Vec::with_capacity(header.sections as usize);
    for _ in 0..header.sections {
        section_headers.push(SectionHeader::read(&mut reader)?);
    }

    let mut functions = Vec::with_capacity(header.functions as usize);
    for _ in 0..header.functions {
        let record_start = reader.position();
        let fn_header = FunctionHeader::read(&mut reader)?;
        let mut parameter_types = Vec::with_capacity(fn_header.parameters as usize);
        for _ in 0..fn_header.parameters {
            parameter_types.push(decode_type(&mut reader)?);
        }
        let return_type = decode_type(&mut reader)?;
        let mut fn_sections = Vec::with_capacity(fn_header.sections as usize);
        for _ in 0..fn_header.sections {
            fn_sections.push(SectionHeader::read(&mut reader)?);
        }
        let text = reader.read_bytes(fn_header.text_size as usize)?.to_vec();
        if reader.position() as u64 - record_start as u64 != fn_header.size {
            return Err(FormatError::invalid_format("function record size mismatch"));
        }
        functions.push((fn_header, parameter_types, return_type, fn_sections, text));
    }

    // Resolve bodies: .rdata first, then everything that points into it.
    let rdata = section_headers
        .iter()
        .find(|s| name_to_str(&s.name) == RDATA_SECTION && !s.is_merged_into_rdata())
        .map(|s| resolve_local(span, s))
        .transpose()?;

    let resolve = |header: &SectionHeader| -> Result<Vec<u8>> {
        if header.is_merged_into_rdata() {
            let rdata = rdata
                .as_deref()
                .ok_or_else(|| FormatError::invalid_format("merged section without .rdata"))?;
            slice_checked(rdata, header.body_start, header.body_size, "merged section")
        } else {
            resolve_local(span, header)
        }
    };

    let mut sections = Vec::with_capacity(section_headers.len());
    for header in &section_headers {
        sections.push(ParsedSection {
            header: header.clone(),
            body: resolve(header)?,
        });
    }

    let functions = functions
        .into_iter()
        .map(|(fn_header, parameter_types, return_type, fn_sections, text)| {
            let sections = fn_sections
                .iter()
                .map(|h| {
                    Ok(ParsedSection {
                        header: h.clone(),
                        body: resolve(h)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ParsedFunction {
                header: fn_header,
                parameter_types,
                return_type,
                sections,
                text,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ParsedModule {
        header,
        sections,
        functions,
    })
}

fn resolve_local(span: &[u8], header: &SectionHeader) -> Result<Vec<u8>> {
    slice_checked(span, header.body_start, header.body_size, "section body")
}

fn slice_checked(data: &[u8], start: u64, len: u64, what: &str) -> Result<Vec<u8>> {
    let end = start
        .checked_add(len)
        .filter(|&end| end <= data.len() as u64)
        .ok_or_else(|| FormatError::invalid_format(format!("{} out of range", what)))?;
    Ok(data[start as usize..end as usize].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmdl_core::{Datatype, Shape, Type};

    fn sample_model() -> Vec<u8> {
        let mut builder = ModelBuilder::new().alignment(16);
        let mut module = ModuleBuilder::new("stackvm", 1);
        module.add_section(".data", vec![0xAB; 24]);
        module.add_merged_section(".consts", vec![0xCD; 9]);
        module.add_function(
            FunctionBuilder::new(
                vec![
                    Type::tensor(Datatype::Float32, Shape::from_slice(&[2, 3])),
                    Type::Any,
                ],
                Type::tensor(Datatype::Float32, Shape::from_slice(&[2, 3])),
            )
            .entrypoint(4)
            .text(vec![0x90; 32]),
        );
        let index = builder.add_module(module);
        builder.set_entry(index, 0);
        builder.build().unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let image = sample_model();
        let model = ParsedModel::parse(&image).unwrap();

        assert_eq!(model.header.modules, 1);
        assert_eq!(model.entry(), Some((0, 0)));

        let module = &model.modules[0];
        assert_eq!(module.kind(), "stackvm");
        // .data, .consts, and the implicit .rdata
        assert_eq!(module.sections.len(), 3);
        assert_eq!(module.section(".data").unwrap().body, vec![0xAB; 24]);
        assert_eq!(module.section(".consts").unwrap().body, vec![0xCD; 9]);
        assert!(module.section(".consts").unwrap().header.is_merged_into_rdata());
        assert!(module.section(RDATA_SECTION).is_some());

        let function = &module.functions[0];
        assert_eq!(function.header.entrypoint, 4);
        assert_eq!(function.parameter_types.len(), 2);
        assert_eq!(function.text, vec![0x90; 32]);
    }

    #[test]
    fn test_bit_exact_roundtrip() {
        let image = sample_model();
        let model = ParsedModel::parse(&image).unwrap();
        let rebuilt = model.to_builder().build().unwrap();
        assert_eq!(rebuilt, image);
    }

    #[test]
    fn test_truncated_image_rejected() {
        let image = sample_model();
        assert!(ParsedModel::parse(&image[..image.len() - 1]).is_err());
        assert!(ParsedModel::parse(&image[..10]).is_err());
    }

    #[test]
    fn test_bad_identifier_rejected() {
        let mut image = sample_model();
        image[0] ^= 0xFF;
        assert!(matches!(
            ParsedModel::parse(&image),
            Err(FormatError::InvalidIdentifier { .. })
        ));
    }
}
