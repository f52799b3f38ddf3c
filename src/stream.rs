//! Endian-correct byte stream primitives (component A).
//!
//! Every marker and packet reader/writer in this crate goes through a
//! `Stream`, never through raw slice indexing, so that truncation and
//! seek failures surface uniformly as `CodecError::IoError`. All scalar
//! I/O on the code-stream is big-endian, matching the JPEG 2000 wire
//! format.

use crate::error::{CodecError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// A seekable byte sink or source backing the code-stream.
///
/// Decompression streams are read-only; compression streams must support
/// `seek` so that `Psot` and the TLM marker can be back-patched once a
/// tile-part's length is known.
pub trait Stream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn skip(&mut self, n: i64) -> Result<()>;
    fn seek(&mut self, pos: u64) -> Result<()>;
    fn tell(&mut self) -> Result<u64>;
    fn flush(&mut self) -> Result<()>;
    fn num_bytes_left(&mut self) -> Result<u64>;

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.read(buf)?;
        if n != buf.len() {
            return Err(CodecError::IoError(format!(
                "truncated stream: wanted {} bytes, got {}",
                buf.len(),
                n
            )));
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write(&[v])?;
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write(&v.to_be_bytes())?;
        Ok(())
    }
}

/// An in-memory stream backed by a growable buffer, used both to hold a
/// whole code-stream read from disk and to build one being compressed.
pub struct MemStream {
    cursor: Cursor<Vec<u8>>,
    len_known: Option<u64>,
}

impl MemStream {
    pub fn new_reader(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        MemStream {
            cursor: Cursor::new(data),
            len_known: Some(len),
        }
    }

    pub fn new_writer() -> Self {
        MemStream {
            cursor: Cursor::new(Vec::new()),
            len_known: None,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.cursor.into_inner()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.cursor.get_ref()
    }
}

impl Stream for MemStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.cursor.read(buf).map_err(CodecError::from)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.cursor.write(buf).map_err(CodecError::from)?)
    }

    fn skip(&mut self, n: i64) -> Result<()> {
        self.cursor
            .seek(SeekFrom::Current(n))
            .map_err(CodecError::from)?;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.cursor
            .seek(SeekFrom::Start(pos))
            .map_err(CodecError::from)?;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.cursor.stream_position().map_err(CodecError::from)?)
    }

    fn flush(&mut self) -> Result<()> {
        self.cursor.flush().map_err(CodecError::from)?;
        Ok(())
    }

    fn num_bytes_left(&mut self) -> Result<u64> {
        let total = match self.len_known {
            Some(n) => n,
            None => self.cursor.get_ref().len() as u64,
        };
        let pos = self.tell()?;
        Ok(total.saturating_sub(pos))
    }
}

/// A file-backed stream, used by collaborators that stream to/from disk.
/// The core only requires `Read + Write + Seek`; which concrete file type
/// backs it is the caller's concern.
pub struct FileStream<F> {
    inner: F,
}

impl<F: Read + Write + Seek> FileStream<F> {
    pub fn new(inner: F) -> Self {
        FileStream { inner }
    }
}

impl<F: Read + Write + Seek> Stream for FileStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.inner.read(buf).map_err(CodecError::from)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.inner.write(buf).map_err(CodecError::from)?)
    }

    fn skip(&mut self, n: i64) -> Result<()> {
        self.inner
            .seek(SeekFrom::Current(n))
            .map_err(CodecError::from)?;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(pos)).map_err(CodecError::from)?;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position().map_err(CodecError::from)?)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush().map_err(CodecError::from)?;
        Ok(())
    }

    fn num_bytes_left(&mut self) -> Result<u64> {
        let pos = self.inner.stream_position().map_err(CodecError::from)?;
        let end = self.inner.seek(SeekFrom::End(0)).map_err(CodecError::from)?;
        self.inner
            .seek(SeekFrom::Start(pos))
            .map_err(CodecError::from)?;
        Ok(end.saturating_sub(pos))
    }
}

// Convenience re-exports so call sites can `use crate::stream::{ReadBytesExt, WriteBytesExt}`
// when they need to read/write through a plain `Cursor` without the `Stream` trait (e.g. PLT
// comma-coded lengths, which are not a fixed scalar width).
pub use byteorder::{BigEndian as Be, ReadBytesExt as ReadExt, WriteBytesExt as WriteExt};
