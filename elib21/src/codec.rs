//!
//! # Elib Primitive Decoding
//!
//! Byte-order and width-aware reading of the integers, floats and strings
//! from which every ELIB record is built.
//!

// Std-Lib Imports
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

// Crates.io
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use memmap2::Mmap;

// Local Imports
use crate::data::{ElibError, ElibResult};
use crate::header::{detect_magic, DecodeContext, Endian, Magic};

/// # Elib Source Data
/// Either a memory-mapped file, or an in-memory byte vector
pub enum ElibSource {
    Mapped(Mmap),
    Bytes(Vec<u8>),
}
impl AsRef<[u8]> for ElibSource {
    fn as_ref(&self) -> &[u8] {
        match self {
            ElibSource::Mapped(m) => m.as_ref(),
            ElibSource::Bytes(b) => b.as_ref(),
        }
    }
}

/// # ElibReader
/// Decodes primitive values, in the byte-order and integer-widths declared by a file's header.
pub struct ElibReader {
    /// Data being read
    file: Cursor<ElibSource>,
    /// Decode context. Defaults until [ElibReader::read_header] is called.
    ctx: DecodeContext,
    /// Number of values clipped while narrowing wider on-disk integers
    pub(crate) clipped: usize,
}
impl ElibReader {
    /// Create an [ElibReader], opening [File] at path `fname`
    pub fn open(fname: impl AsRef<Path>) -> ElibResult<ElibReader> {
        Self::from_file(File::open(fname)?)
    }
    /// Create an [ElibReader] of [File] `file`
    pub fn from_file(file: File) -> ElibResult<ElibReader> {
        // This is our one line of `unsafe`, for loading memory-mapped data.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self::new(ElibSource::Mapped(mmap)))
    }
    /// Create an [ElibReader] of in-memory `bytes`
    pub fn from_bytes(bytes: Vec<u8>) -> ElibReader {
        Self::new(ElibSource::Bytes(bytes))
    }
    fn new(src: ElibSource) -> ElibReader {
        ElibReader {
            file: Cursor::new(src),
            ctx: DecodeContext::new(Magic::Magic12, Endian::Big),
            clipped: 0,
        }
    }
    /// Read the magic number and any explicit widths.
    /// Sets and returns our [DecodeContext].
    pub fn read_header(&mut self) -> ElibResult<DecodeContext> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes)?;
        let (magic, endian) = detect_magic(bytes)?;
        let mut ctx = DecodeContext::new(magic, endian);
        if ctx.caps.int_widths {
            ctx.small_size = self.read_byte()?;
            ctx.big_size = self.read_byte()?;
        }
        if ctx.caps.char_width {
            ctx.char_size = self.read_byte()?;
        }
        let pos = self.pos();
        for (what, w) in [("small integer", ctx.small_size), ("big integer", ctx.big_size)] {
            if !(1..=8).contains(&w) {
                return Err(format_err(format!("Unsupported {} width {}", what, w), pos));
            }
        }
        if ctx.char_size != 1 {
            return Err(format_err(
                format!("Unsupported character width {}", ctx.char_size),
                pos,
            ));
        }
        self.ctx = ctx;
        Ok(ctx)
    }
    /// Get our [DecodeContext]
    pub fn ctx(&self) -> &DecodeContext {
        &self.ctx
    }
    /// Read a single unsigned byte
    pub fn read_byte(&mut self) -> ElibResult<u8> {
        let pos = self.pos();
        self.file.read_u8().map_err(|e| eof(e, pos))
    }
    /// Read a "small" integer, narrowed to 16 bits
    pub fn read_small(&mut self) -> ElibResult<i16> {
        match self.ctx.small_size {
            2 => {
                let pos = self.pos();
                let rv = match self.ctx.endian {
                    Endian::Big => self.file.read_i16::<BigEndian>(),
                    Endian::Little => self.file.read_i16::<LittleEndian>(),
                };
                rv.map_err(|e| eof(e, pos))
            }
            w => Ok(self.read_sized(w, 2)? as i16),
        }
    }
    /// Read a "big" integer, narrowed to 32 bits
    pub fn read_big(&mut self) -> ElibResult<i32> {
        match self.ctx.big_size {
            4 => {
                let pos = self.pos();
                let rv = match self.ctx.endian {
                    Endian::Big => self.file.read_i32::<BigEndian>(),
                    Endian::Little => self.file.read_i32::<LittleEndian>(),
                };
                rv.map_err(|e| eof(e, pos))
            }
            w => Ok(self.read_sized(w, 4)? as i32),
        }
    }
    /// Read a `width`-byte signed integer into `target` bytes.
    /// Narrower values are sign-extended. Wider values keep their low-order bytes,
    /// and are counted as clipped unless the discarded bytes are all 0x00 or all 0xFF.
    fn read_sized(&mut self, width: u8, target: u8) -> ElibResult<i64> {
        let w = width as usize;
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf[..w])?;
        let bytes = &buf[..w];
        if width <= target {
            return Ok(match self.ctx.endian {
                Endian::Big => BigEndian::read_int(bytes, w),
                Endian::Little => LittleEndian::read_int(bytes, w),
            });
        }
        let t = target as usize;
        let (high, low) = match self.ctx.endian {
            Endian::Big => (&bytes[..w - t], &bytes[w - t..]),
            Endian::Little => (&bytes[t..], &bytes[..t]),
        };
        if !(high.iter().all(|b| *b == 0x00) || high.iter().all(|b| *b == 0xFF)) {
            self.clipped += 1;
        }
        Ok(match self.ctx.endian {
            Endian::Big => BigEndian::read_int(low, t),
            Endian::Little => LittleEndian::read_int(low, t),
        })
    }
    /// Read a 32-bit float
    pub fn read_float(&mut self) -> ElibResult<f32> {
        let pos = self.pos();
        let rv = match self.ctx.endian {
            Endian::Big => self.file.read_f32::<BigEndian>(),
            Endian::Little => self.file.read_f32::<LittleEndian>(),
        };
        rv.map_err(|e| eof(e, pos))
    }
    /// Read a 64-bit float
    pub fn read_double(&mut self) -> ElibResult<f64> {
        let pos = self.pos();
        let rv = match self.ctx.endian {
            Endian::Big => self.file.read_f64::<BigEndian>(),
            Endian::Little => self.file.read_f64::<LittleEndian>(),
        };
        rv.map_err(|e| eof(e, pos))
    }
    /// Read a length-prefixed string.
    /// Non-positive lengths produce empty strings.
    /// Content is decoded as UTF-8, falling back to Latin-1.
    pub fn read_string(&mut self) -> ElibResult<String> {
        let len = self.read_big()?;
        if len <= 0 {
            return Ok(String::new());
        }
        let len = len as usize;
        if len as u64 > self.remaining() {
            return Err(ElibError::Truncated {
                bytepos: self.len(),
                ctx: Vec::new(),
            });
        }
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)?;
        let s = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => e.as_bytes().iter().map(|&b| b as char).collect(),
        };
        Ok(s)
    }
    /// Read exactly `buf.len()` bytes
    fn read_exact(&mut self, buf: &mut [u8]) -> ElibResult<()> {
        let pos = self.pos();
        self.file.read_exact(buf).map_err(|e| eof(e, pos))
    }
    /// Get the current file position
    #[inline(always)]
    pub fn pos(&self) -> u64 {
        self.file.position()
    }
    /// Total length of our data, in bytes
    pub fn len(&self) -> u64 {
        self.file.get_ref().as_ref().len() as u64
    }
    /// Boolean indication of empty source data
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Number of bytes remaining
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.pos())
    }
    /// Check that `count` records of at least `min_size` bytes each fit in the remaining data.
    /// Returns `count` if so, a [ElibError::Truncated] if not.
    pub fn check_fits(&self, count: usize, min_size: u64) -> ElibResult<usize> {
        match (count as u64).checked_mul(min_size) {
            Some(need) if need <= self.remaining() => Ok(count),
            _ => Err(ElibError::Truncated {
                bytepos: self.len(),
                ctx: Vec::new(),
            }),
        }
    }
}
/// Create a positional [ElibError::Format]
fn format_err(msg: String, bytepos: u64) -> ElibError {
    ElibError::Format {
        msg,
        bytepos,
        ctx: Vec::new(),
    }
}
/// Convert IO errors, particularly end-of-file, into [ElibError]s
fn eof(e: std::io::Error, pos: u64) -> ElibError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ElibError::Truncated {
            bytepos: pos,
            ctx: Vec::new(),
        },
        _ => e.into(),
    }
}
