//! Unaligned little-endian readers over byte slices and streams

use crate::error::{FormatError, Result};
use std::io::{Read, Seek, SeekFrom};

/// Primitive little-endian reads shared by pinned and streamed sources.
///
/// Every implementation is bounds-checked and reads unaligned.
pub trait ModelRead {
    /// Read exactly enough bytes to fill `buf`
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Skip `count` bytes forward
    fn skip(&mut self, count: u64) -> Result<()>;

    /// Read exactly `count` bytes into a new vector
    fn read_vec(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a fixed-size byte array
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a little-endian `u8`
    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a little-endian `u16`
    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `u32`
    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `u64`
    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `i8`
    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_array::<1>()?[0] as i8)
    }

    /// Read a little-endian `i16`
    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `i32`
    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `i64`
    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `f32`
    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `f64`
    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }
}

/// Reader over a borrowed byte span
pub struct SpanReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SpanReader<'a> {
    /// Create a reader positioned at the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Whether all bytes have been consumed
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Bytes remaining
    pub fn avail(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current offset from the start of the span
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Jump to an absolute offset
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(FormatError::UnexpectedEof {
                needed: pos,
                available: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Borrow the next `count` bytes and advance
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.avail() {
            return Err(FormatError::UnexpectedEof {
                needed: count,
                available: self.avail(),
            });
        }
        let span = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(span)
    }

    /// Peek the next byte without advancing
    pub fn peek_u8(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(FormatError::UnexpectedEof {
                needed: 1,
                available: 0,
            })
    }
}

impl ModelRead for SpanReader<'_> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let span = self.read_bytes(buf.len())?;
        buf.copy_from_slice(span);
        Ok(())
    }

    fn skip(&mut self, count: u64) -> Result<()> {
        let target = self
            .pos
            .checked_add(count as usize)
            .ok_or(FormatError::UnexpectedEof {
                needed: usize::MAX,
                available: self.avail(),
            })?;
        self.seek(target)
    }
}

/// Reader over a seekable byte stream
pub struct StreamReader<R> {
    inner: R,
}

impl<R: Read + Seek> StreamReader<R> {
    /// Wrap a seekable stream
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Unwrap the inner stream
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Current stream position
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    /// Jump to an absolute position
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

impl<R: Read + Seek> ModelRead for StreamReader<R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        Ok(())
    }

    fn skip(&mut self, count: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Current(count as i64))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_span_reader_primitives() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x11223344u32.to_le_bytes());
        data.extend_from_slice(&1.5f32.to_le_bytes());
        data.push(0x7F);

        let mut reader = SpanReader::new(&data);
        assert_eq!(reader.read_u32().unwrap(), 0x11223344);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.peek_u8().unwrap(), 0x7F);
        assert_eq!(reader.read_u8().unwrap(), 0x7F);
        assert!(reader.is_empty());
        assert!(matches!(reader.read_u8(), Err(FormatError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_span_reader_misaligned() {
        // A u32 at offset 1 must decode despite the misalignment.
        let data = [0u8, 0x78, 0x56, 0x34, 0x12];
        let mut reader = SpanReader::new(&data);
        reader.skip(1).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 0x12345678);
    }

    #[test]
    fn test_span_reader_seek_bounds() {
        let data = [0u8; 4];
        let mut reader = SpanReader::new(&data);
        assert!(reader.seek(4).is_ok());
        assert!(reader.seek(5).is_err());
    }

    #[test]
    fn test_stream_reader_matches_span() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xCAFEu16.to_le_bytes());
        data.extend_from_slice(&(-5i64).to_le_bytes());
        data.extend_from_slice(b"tail");

        let mut span = SpanReader::new(&data);
        let mut stream = StreamReader::new(Cursor::new(data.clone()));

        assert_eq!(span.read_u16().unwrap(), stream.read_u16().unwrap());
        assert_eq!(span.read_i64().unwrap(), stream.read_i64().unwrap());
        assert_eq!(span.read_bytes(4).unwrap(), stream.read_vec(4).unwrap().as_slice());
    }

    #[test]
    fn test_stream_reader_seek() {
        let data = vec![1u8, 2, 3, 4, 5];
        let mut stream = StreamReader::new(Cursor::new(data));
        stream.seek(3).unwrap();
        assert_eq!(stream.read_u8().unwrap(), 4);
        assert_eq!(stream.position().unwrap(), 4);
    }
}
