//! Byte cursor over a WebAssembly binary.
//!
//! Provides sequential reads of raw bytes, little-endian fixed-width
//! integers, and the LEB128 variable-length encodings used throughout the
//! binary format.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io;

/// A positioned reader over an in-memory byte buffer.
pub struct Reader {
    bytes: Vec<u8>,
    pos: usize,
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "no more bytes to read")
}

impl Reader {
    pub fn new(bytes: Vec<u8>) -> Reader {
        Reader { bytes, pos: 0 }
    }

    // Basic operations --------------------------------------------------------

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn has_at_least(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn skip(&mut self, len: usize) {
        self.pos += len;
    }

    pub fn read_byte(&mut self) -> Result<u8, io::Error> {
        let byte = *self.bytes.get(self.pos).ok_or_else(eof)?;
        self.pos += 1;
        Ok(byte)
    }

    /// Looks at the next byte without consuming it.
    pub fn peek_byte(&self) -> Result<u8, io::Error> {
        self.bytes.get(self.pos).copied().ok_or_else(eof)
    }

    /// Copies the bytes between two positions already visited. Used to
    /// capture raw spans such as constant expressions.
    pub fn bytes_between(&self, start: usize, end: usize) -> Vec<u8> {
        self.bytes[start..end].to_vec()
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, io::Error> {
        if !self.has_at_least(len) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "not enough bytes to read",
            ));
        }
        let vec = self.bytes[self.pos..self.pos + len].to_vec();
        self.skip(len);
        Ok(vec)
    }

    // Read and interpret types ------------------------------------------------

    pub fn read_u32(&mut self) -> Result<u32, io::Error> {
        if !self.has_at_least(4) {
            return Err(eof());
        }
        let mut slice = &self.bytes[self.pos..self.pos + 4];
        let num = slice.read_u32::<LittleEndian>()?;
        self.skip(4);
        Ok(num)
    }

    /// Unsigned LEB128, at most 32 bits.
    pub fn read_vu32(&mut self) -> Result<u32, io::Error> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            if shift >= 32 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "LEB128 u32 too long",
                ));
            }
            result |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Unsigned LEB128, at most 64 bits.
    pub fn read_vu64(&mut self) -> Result<u64, io::Error> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            if shift >= 64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "LEB128 u64 too long",
                ));
            }
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Signed LEB128, at most 33 bits. Heap-type encodings use this; a
    /// non-negative result is a defined-type index.
    pub fn read_vs33(&mut self) -> Result<i64, io::Error> {
        self.read_signed(33)
    }

    /// Signed LEB128, at most 32 bits.
    pub fn read_vs32(&mut self) -> Result<i32, io::Error> {
        Ok(self.read_signed(32)? as i32)
    }

    /// Signed LEB128, at most 64 bits.
    pub fn read_vs64(&mut self) -> Result<i64, io::Error> {
        self.read_signed(64)
    }

    fn read_signed(&mut self, max_bits: u32) -> Result<i64, io::Error> {
        let mut result: i64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            if shift >= max_bits {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "LEB128 integer too long",
                ));
            }
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    pub fn read_string(&mut self) -> Result<String, io::Error> {
        let len = self.read_vu32()?;
        let bytes = self.read_bytes(len as usize)?;
        String::from_utf8(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 sequence"))
    }
}
