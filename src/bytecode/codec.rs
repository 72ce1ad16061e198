//! Inline operand encoding.
//!
//! All multi-byte integers are little-endian. A value is a tag byte
//! ([`VBType`]) followed by its payload:
//!
//! ```text
//! Boolean  tag 1:u8 (1 = true)
//! Number   tag f64 (IEEE-754)
//! String   tag len:u16 (UTF-16 code units) unit:u16 * len
//! List     tag count:u16 value * count
//! ```

use crate::lang::value::{VBType, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("cannot encode a void value")]
    Void,

    #[error("{what} is too long to encode ({len} > {max})")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("invalid opcode byte {byte:#04x} at offset {offset}")]
    InvalidOpcode { byte: u8, offset: usize },

    #[error("invalid type tag {byte:#04x} at offset {offset}")]
    InvalidTypeTag { byte: u8, offset: usize },

    #[error("void value encoded at offset {offset}")]
    VoidValue { offset: usize },

    #[error("truncated operand at offset {offset}: need {needed} bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("invalid UTF-16 string at offset {offset}")]
    InvalidString { offset: usize },

    #[error("expected a string at offset {offset}")]
    ExpectedString { offset: usize },

    #[error("jump target {target} at offset {offset} is not an instruction boundary")]
    BadJumpTarget { target: u32, offset: usize },
}

impl DecodeError {
    /// Byte offset the problem was found at.
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::InvalidOpcode { offset, .. }
            | DecodeError::InvalidTypeTag { offset, .. }
            | DecodeError::VoidValue { offset }
            | DecodeError::Truncated { offset, .. }
            | DecodeError::InvalidString { offset }
            | DecodeError::ExpectedString { offset }
            | DecodeError::BadJumpTarget { offset, .. } => *offset,
        }
    }
}

pub fn encode_i32(out: &mut Vec<u8>, n: i32) {
    out.extend_from_slice(&n.to_le_bytes());
}

pub fn encode_u16(out: &mut Vec<u8>, n: u16) {
    out.extend_from_slice(&n.to_le_bytes());
}

pub fn encode_type(out: &mut Vec<u8>, ty: VBType) {
    out.push(ty.as_byte());
}

pub fn encode_value(out: &mut Vec<u8>, value: &Value) -> Result<(), EncodeError> {
    match value {
        Value::Boolean(b) => {
            encode_type(out, VBType::Boolean);
            out.push(u8::from(*b));
        }
        Value::Number(n) => {
            encode_type(out, VBType::Number);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::String(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            let len = length_u16("string", units.len())?;
            encode_type(out, VBType::String);
            encode_u16(out, len);
            for unit in units {
                encode_u16(out, unit);
            }
        }
        Value::List(items) => {
            let count = length_u16("list", items.len())?;
            encode_type(out, VBType::List);
            encode_u16(out, count);
            for item in items {
                encode_value(out, item)?;
            }
        }
        Value::Void => return Err(EncodeError::Void),
    }
    Ok(())
}

pub(crate) fn length_u16(what: &'static str, len: usize) -> Result<u16, EncodeError> {
    u16::try_from(len).map_err(|_| EncodeError::TooLong {
        what,
        len,
        max: u16::MAX as usize,
    })
}

/// Borrowing reader over an encoded byte slice.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8], pos: usize) -> Self {
        Reader { bytes, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
            }),
        }
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn vb_type(&mut self) -> Result<VBType, DecodeError> {
        let offset = self.pos;
        let byte = self.u8()?;
        VBType::from_byte(byte).ok_or(DecodeError::InvalidTypeTag { byte, offset })
    }

    pub fn value(&mut self) -> Result<Value, DecodeError> {
        let offset = self.pos;
        match self.vb_type()? {
            VBType::Boolean => Ok(Value::Boolean(self.u8()? == 1)),
            VBType::Number => Ok(Value::Number(self.f64()?)),
            VBType::String => {
                let len = self.u16()? as usize;
                let mut units = Vec::with_capacity(len);
                for _ in 0..len {
                    units.push(self.u16()?);
                }
                String::from_utf16(&units)
                    .map(Value::String)
                    .map_err(|_| DecodeError::InvalidString { offset })
            }
            VBType::List => {
                let count = self.u16()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value()?);
                }
                Ok(Value::List(items))
            }
            VBType::Void => Err(DecodeError::VoidValue { offset }),
        }
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let offset = self.pos;
        match self.value()? {
            Value::String(s) => Ok(s),
            _ => Err(DecodeError::ExpectedString { offset }),
        }
    }
}
