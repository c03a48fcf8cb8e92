//! Bounds-checked reading and writing of message payloads
//!
//! All integers and floats are big-endian and fixed width; strings are a
//! `u32` byte length followed by raw UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Why a payload could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    #[error("empty message")]
    Empty,

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Cursor over one received payload.
#[derive(Debug, Clone)]
pub struct MessageReader {
    buf: Bytes,
}

impl MessageReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, needed: usize) -> Result<(), ParseError> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(ParseError::Truncated { needed, remaining });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, ParseError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u32(&mut self) -> Result<u32, ParseError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64, ParseError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_f32(&mut self) -> Result<f32, ParseError> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, ParseError> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_string(&mut self) -> Result<String, ParseError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::InvalidUtf8)
    }

    /// Fail unless the payload was consumed exactly.
    pub fn finish(self) -> Result<(), ParseError> {
        match self.buf.remaining() {
            0 => Ok(()),
            extra => Err(ParseError::TrailingBytes(extra)),
        }
    }
}

/// Builder for one outgoing payload.
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(tag: u8) -> Self {
        let mut writer = Self::new();
        writer.write_u8(tag);
        writer
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32(value);
        self
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_u32(value.len() as u32);
        self.write_bytes(value.as_bytes())
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
