//! Model images, section bytes, and the section contexts handed to module
//! and function initializers
//!
//! A model loads from either a pinned byte image (owned bytes or a memory
//! map) or a seekable stream. [`ModelBytes`] abstracts over the two: in
//! pinned mode it is a zero-copy window into the image, in streamed mode an
//! owned allocation read on demand.

use crate::buffer::{host_allocator, AllocateOptions, AttachOptions, BufferSlice, MapAccess};
use crate::error::{Result, RuntimeError};
use crate::buffer::{HOST_BUFFER_ALLOCATE_CPU_ONLY, HOST_BUFFER_ALLOCATE_SHARED};
use kmdl_model::{
    name_to_str, FunctionHeader, ModelRead, ModuleHeader, SectionHeader, StreamReader,
};
use std::io::{Read, Seek};
use std::ops::Range;
use std::sync::Arc;

/// A pinned model image
pub struct ModelData {
    inner: ModelDataInner,
}

enum ModelDataInner {
    Owned(Vec<u8>),
    Mapped(memmap2::Mmap),
}

impl ModelData {
    /// Wrap owned bytes
    pub fn from_vec(bytes: Vec<u8>) -> ModelData {
        ModelData {
            inner: ModelDataInner::Owned(bytes),
        }
    }

    /// Wrap a memory-mapped file
    pub fn from_mmap(map: memmap2::Mmap) -> ModelData {
        ModelData {
            inner: ModelDataInner::Mapped(map),
        }
    }

    /// The image bytes
    pub fn as_slice(&self) -> &[u8] {
        match &self.inner {
            ModelDataInner::Owned(v) => v,
            ModelDataInner::Mapped(m) => m,
        }
    }
}

/// Bytes of a section or text region, zero-copy when pinned
#[derive(Clone)]
pub struct ModelBytes {
    source: BytesSource,
    range: Range<usize>,
}

#[derive(Clone)]
enum BytesSource {
    Image(Arc<ModelData>),
    Owned(Arc<Vec<u8>>),
}

impl ModelBytes {
    /// Wrap owned bytes
    pub fn from_vec(bytes: Vec<u8>) -> ModelBytes {
        let range = 0..bytes.len();
        ModelBytes {
            source: BytesSource::Owned(Arc::new(bytes)),
            range,
        }
    }

    pub(crate) fn from_image(image: Arc<ModelData>, range: Range<usize>) -> Result<ModelBytes> {
        if range.end > image.as_slice().len() || range.start > range.end {
            return Err(RuntimeError::invalid_program("range outside model image"));
        }
        Ok(ModelBytes {
            source: BytesSource::Image(image),
            range,
        })
    }

    /// The bytes
    pub fn as_slice(&self) -> &[u8] {
        match &self.source {
            BytesSource::Image(image) => &image.as_slice()[self.range.clone()],
            BytesSource::Owned(bytes) => &bytes[self.range.clone()],
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// A sub-window sharing the same backing
    pub fn slice(&self, start: u64, len: u64) -> Result<ModelBytes> {
        let begin = self.range.start as u64 + start;
        let end = begin + len;
        if end > self.range.end as u64 {
            return Err(RuntimeError::invalid_program("slice outside section"));
        }
        Ok(ModelBytes {
            source: self.source.clone(),
            range: begin as usize..end as usize,
        })
    }
}

/// Read + Seek trait object bound for streamed model sources
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A model byte source: pinned image or owned stream
pub(crate) enum Source {
    Pinned {
        image: Arc<ModelData>,
        pos: usize,
    },
    Streamed(StreamReader<Box<dyn ReadSeek>>),
}

impl Source {
    pub(crate) fn pinned(image: Arc<ModelData>) -> Source {
        Source::Pinned { image, pos: 0 }
    }

    pub(crate) fn streamed(reader: Box<dyn ReadSeek>) -> Source {
        Source::Streamed(StreamReader::new(reader))
    }

    pub(crate) fn is_pinned(&self) -> bool {
        matches!(self, Source::Pinned { .. })
    }

    pub(crate) fn position(&mut self) -> Result<u64> {
        match self {
            Source::Pinned { pos, .. } => Ok(*pos as u64),
            Source::Streamed(reader) => Ok(reader.position()?),
        }
    }

    pub(crate) fn seek(&mut self, target: u64) -> Result<()> {
        match self {
            Source::Pinned { image, pos } => {
                if target > image.as_slice().len() as u64 {
                    return Err(RuntimeError::invalid_program("seek outside model image"));
                }
                *pos = target as usize;
                Ok(())
            }
            Source::Streamed(reader) => {
                reader.seek(target)?;
                Ok(())
            }
        }
    }

    /// Fetch a byte region without disturbing the current position
    pub(crate) fn bytes_at(&mut self, start: u64, len: u64) -> Result<ModelBytes> {
        match self {
            Source::Pinned { image, .. } => {
                ModelBytes::from_image(image.clone(), start as usize..(start + len) as usize)
            }
            Source::Streamed(reader) => {
                let saved = reader.position()?;
                reader.seek(start)?;
                let bytes = reader.read_vec(len as usize)?;
                reader.seek(saved)?;
                Ok(ModelBytes::from_vec(bytes))
            }
        }
    }
}

impl ModelRead for Source {
    fn read_exact(&mut self, buf: &mut [u8]) -> kmdl_model::Result<()> {
        match self {
            Source::Pinned { image, pos } => {
                let data = image.as_slice();
                if *pos + buf.len() > data.len() {
                    return Err(kmdl_model::FormatError::UnexpectedEof {
                        needed: buf.len(),
                        available: data.len().saturating_sub(*pos),
                    });
                }
                buf.copy_from_slice(&data[*pos..*pos + buf.len()]);
                *pos += buf.len();
                Ok(())
            }
            Source::Streamed(reader) => reader.read_exact(buf),
        }
    }

    fn skip(&mut self, count: u64) -> kmdl_model::Result<()> {
        match self {
            Source::Pinned { image, pos } => {
                let target = *pos as u64 + count;
                if target > image.as_slice().len() as u64 {
                    return Err(kmdl_model::FormatError::UnexpectedEof {
                        needed: count as usize,
                        available: image.as_slice().len() - *pos,
                    });
                }
                *pos = target as usize;
                Ok(())
            }
            Source::Streamed(reader) => reader.skip(count),
        }
    }
}

/// Where a resolved section's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionOrigin {
    /// Within the owning record's own bytes
    Local,
    /// Within the module's read-only data region
    Rdata,
}

/// A section resolved to its bytes
pub struct ResolvedSection {
    /// Where the bytes were found
    pub origin: SectionOrigin,
    /// The descriptor as read from the image
    pub header: SectionHeader,
    /// The section bytes
    pub bytes: ModelBytes,
}

/// Section access handed to a module while it initializes
pub struct ModuleInitContext<'a> {
    pub(crate) source: &'a mut Source,
    pub(crate) module_base: u64,
    pub(crate) header: ModuleHeader,
    pub(crate) section_headers: Vec<SectionHeader>,
    rdata_cache: Option<ModelBytes>,
}

impl<'a> ModuleInitContext<'a> {
    pub(crate) fn new(
        source: &'a mut Source,
        module_base: u64,
        header: ModuleHeader,
        section_headers: Vec<SectionHeader>,
    ) -> Self {
        Self {
            source,
            module_base,
            header,
            section_headers,
            rdata_cache: None,
        }
    }

    /// The module record header
    pub fn header(&self) -> &ModuleHeader {
        &self.header
    }

    /// Whether sections are directly addressable in a loaded image
    pub fn is_pinned(&self) -> bool {
        self.source.is_pinned()
    }

    /// Descriptor of a named section
    pub fn section_header(&self, name: &str) -> Result<&SectionHeader> {
        self.section_headers
            .iter()
            .find(|h| name_to_str(&h.name) == name)
            .ok_or_else(|| RuntimeError::not_found(format!("section '{}'", name)))
    }

    /// Resolve a named section to its bytes
    pub fn section(&mut self, name: &str) -> Result<ResolvedSection> {
        let header = self.section_header(name)?.clone();
        self.resolve(&header)
    }

    /// Resolve an arbitrary descriptor against this module
    pub fn resolve(&mut self, header: &SectionHeader) -> Result<ResolvedSection> {
        if header.is_merged_into_rdata() {
            let rdata = self.rdata()?;
            Ok(ResolvedSection {
                origin: SectionOrigin::Rdata,
                header: header.clone(),
                bytes: rdata.slice(header.body_start, header.body_size)?,
            })
        } else {
            let bytes = self
                .source
                .bytes_at(self.module_base + header.body_start, header.body_size)?;
            Ok(ResolvedSection {
                origin: SectionOrigin::Local,
                header: header.clone(),
                bytes,
            })
        }
    }

    /// The section bytes as a host buffer slice.
    ///
    /// Pinned images are wrapped without copying (the buffer keeps the
    /// image alive); streamed sections are read into a fresh host
    /// allocation, shared when `allocate_shared` is set.
    pub fn get_or_read_section(&mut self, name: &str, allocate_shared: bool) -> Result<BufferSlice> {
        let resolved = self.section(name)?;
        let flags = if allocate_shared {
            HOST_BUFFER_ALLOCATE_SHARED
        } else {
            HOST_BUFFER_ALLOCATE_CPU_ONLY
        };
        match (&resolved.bytes.source, self.source.is_pinned()) {
            (BytesSource::Image(image), true) => {
                // Zero-copy attach; the deleter keeps the image alive for
                // the buffer's lifetime. The region is read-only by
                // convention.
                let keepalive = image.clone();
                let slice = resolved.bytes.as_slice();
                let buffer = unsafe {
                    host_allocator().attach(
                        slice.as_ptr() as *mut u8,
                        slice.len(),
                        AttachOptions {
                            flags: 0,
                            physical_address: 0,
                            deleter: Some(Box::new(move |_| {
                                let _ = &keepalive;
                            })),
                        },
                    )?
                };
                Ok(BufferSlice::whole(buffer))
            }
            _ => {
                let buffer =
                    host_allocator().allocate(resolved.bytes.len(), &AllocateOptions { flags })?;
                let host = buffer.as_host().unwrap();
                let mut map = host.map(MapAccess::WRITE)?;
                map.as_mut_slice()?.copy_from_slice(resolved.bytes.as_slice());
                map.unmap()?;
                Ok(BufferSlice::whole(buffer))
            }
        }
    }

    fn rdata(&mut self) -> Result<ModelBytes> {
        if let Some(rdata) = &self.rdata_cache {
            return Ok(rdata.clone());
        }
        let header = self
            .section_headers
            .iter()
            .find(|h| name_to_str(&h.name) == ".rdata" && !h.is_merged_into_rdata())
            .cloned()
            .ok_or_else(|| {
                RuntimeError::invalid_program("merged section but module has no .rdata")
            })?;
        let bytes = self
            .source
            .bytes_at(self.module_base + header.body_start, header.body_size)?;
        self.rdata_cache = Some(bytes.clone());
        Ok(bytes)
    }
}

/// Section access handed to a function while it initializes
pub struct FunctionInitContext<'a, 'b> {
    pub(crate) module: &'a mut ModuleInitContext<'b>,
    pub(crate) header: FunctionHeader,
    pub(crate) section_headers: Vec<SectionHeader>,
    pub(crate) text_start: u64,
}

impl<'a, 'b> FunctionInitContext<'a, 'b> {
    /// The function record header
    pub fn header(&self) -> &FunctionHeader {
        &self.header
    }

    /// The function text
    pub fn text(&mut self) -> Result<ModelBytes> {
        self.module
            .source
            .bytes_at(self.text_start, self.header.text_size)
    }

    /// Resolve a per-function section (always merged into module rdata)
    pub fn section(&mut self, name: &str) -> Result<ResolvedSection> {
        let header = self
            .section_headers
            .iter()
            .find(|h| name_to_str(&h.name) == name)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found(format!("function section '{}'", name)))?;
        self.module.resolve(&header)
    }

    /// The owning module's init context
    pub fn module(&mut self) -> &mut ModuleInitContext<'b> {
        self.module
    }
}
