use crate::bytecode::codec::{self, DecodeError, EncodeError, Reader};
use crate::bytecode::op::{Instruction, OpCode};
use crate::lang::value::{VBType, Value};

/// A compiled bytecode program.
///
/// Layout: byte 0 is `Jump`, bytes 1..5 the little-endian address of the
/// first top-level instruction, then procedure bodies, then top-level code.
/// Immutable once built; recompiling produces a new buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytecode {
    bytes: Vec<u8>,
}

impl Bytecode {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn byte_at(&self, index: usize) -> Option<u8> {
        self.bytes.get(index).copied()
    }

    /// Interpret the byte at `index` as an opcode.
    ///
    /// Only valid at instruction boundaries; operand bytes frequently happen
    /// to look like opcodes.
    pub fn opcode_at(&self, index: usize) -> Result<OpCode, DecodeError> {
        let byte = self.byte_at(index).ok_or(DecodeError::Truncated {
            offset: index,
            needed: 1,
        })?;
        OpCode::from_byte(byte).ok_or(DecodeError::InvalidOpcode {
            byte,
            offset: index,
        })
    }

    pub fn read_i32(&self, index: usize) -> Result<i32, DecodeError> {
        Reader::new(&self.bytes, index).i32()
    }

    pub fn read_value(&self, index: usize) -> Result<(Value, usize), DecodeError> {
        let mut reader = Reader::new(&self.bytes, index);
        let value = reader.value()?;
        Ok((value, reader.pos()))
    }

    /// Address the entry jump at byte 0 skips to.
    pub fn entry_point(&self) -> Result<u32, DecodeError> {
        match self.decode_at(0)? {
            (Instruction::Jump(addr), _) => Ok(addr),
            _ => Err(DecodeError::InvalidOpcode {
                byte: self.bytes[0],
                offset: 0,
            }),
        }
    }

    /// Decode the instruction starting at `index`.
    ///
    /// Returns the instruction and the offset of the one after it.
    pub fn decode_at(&self, index: usize) -> Result<(Instruction, usize), DecodeError> {
        let op = self.opcode_at(index)?;
        let mut r = Reader::new(&self.bytes, index + 1);

        let instruction = match op {
            OpCode::Jump => Instruction::Jump(read_address(&mut r)?),
            OpCode::JumpIf => Instruction::JumpIf(read_address(&mut r)?),
            OpCode::Call => Instruction::Call(read_address(&mut r)?),
            OpCode::Push => Instruction::Push(r.value()?),
            OpCode::Pop => Instruction::Pop,
            OpCode::Dup => Instruction::Dup,
            OpCode::Add => Instruction::Add,
            OpCode::Sub => Instruction::Sub,
            OpCode::Mul => Instruction::Mul,
            OpCode::Div => Instruction::Div,
            OpCode::Less => Instruction::Less,
            OpCode::LessEqual => Instruction::LessEqual,
            OpCode::Greater => Instruction::Greater,
            OpCode::GreaterEqual => Instruction::GreaterEqual,
            OpCode::Equal => Instruction::Equal,
            OpCode::NotEqual => Instruction::NotEqual,
            OpCode::Load => Instruction::Load(r.u8()?),
            OpCode::Store => Instruction::Store(r.u8()?),
            OpCode::Free => Instruction::Free(r.u8()?),
            OpCode::Invert => Instruction::Invert,
            OpCode::Negate => Instruction::Negate,
            OpCode::Convert => Instruction::Convert(r.vb_type()?),
            OpCode::Return => Instruction::Return,
            OpCode::CallExtern => Instruction::CallExtern(r.string()?),
            OpCode::MakeList => Instruction::MakeList(r.u16()?),
            OpCode::GetItem => Instruction::GetItem(r.vb_type()?),
            OpCode::SetItem => Instruction::SetItem,
        };

        Ok((instruction, r.pos()))
    }

    /// Iterate over every instruction from byte 0, in layout order.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            code: self,
            offset: 0,
            failed: false,
        }
    }
}

fn read_address(r: &mut Reader<'_>) -> Result<u32, DecodeError> {
    let offset = r.pos();
    let addr = r.i32()?;
    u32::try_from(addr).map_err(|_| DecodeError::BadJumpTarget {
        target: addr as u32,
        offset,
    })
}

pub struct Instructions<'a> {
    code: &'a Bytecode,
    offset: usize,
    failed: bool,
}

impl Iterator for Instructions<'_> {
    type Item = Result<(usize, Instruction), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.code.len() {
            return None;
        }

        match self.code.decode_at(self.offset) {
            Ok((instruction, next)) => {
                let at = self.offset;
                self.offset = next;
                Some(Ok((at, instruction)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// SEGMENT - growable emission buffer used by the compiler
// =============================================================================

/// One region of code under construction.
///
/// Addresses written into a segment are either absolute or, when the
/// segment's final position is not yet known, relative to its start and
/// recorded as relocations to rebase at assembly time.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    code: Vec<u8>,
    relocations: Vec<usize>,
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn clear(&mut self) {
        self.code.clear();
        self.relocations.clear();
    }

    pub fn emit_op(&mut self, op: OpCode) {
        self.code.push(op.as_byte());
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, n: u16) {
        codec::encode_u16(&mut self.code, n);
    }

    pub fn emit_type(&mut self, ty: VBType) {
        codec::encode_type(&mut self.code, ty);
    }

    pub fn emit_value(&mut self, value: &Value) -> Result<(), EncodeError> {
        let mark = self.code.len();
        let result = codec::encode_value(&mut self.code, value);
        if result.is_err() {
            self.code.truncate(mark);
        }
        result
    }

    /// Emit an address that is final as written.
    pub fn emit_absolute(&mut self, addr: u32) {
        codec::encode_i32(&mut self.code, addr as i32);
    }

    /// Emit an offset into this segment, rebased when the segment is placed.
    pub fn emit_relocated(&mut self, offset: u32) {
        self.relocations.push(self.code.len());
        self.emit_absolute(offset);
    }

    /// Reserve four bytes for an address patched later; returns their offset.
    pub fn reserve_address(&mut self, relocated: bool) -> usize {
        let pos = self.code.len();
        if relocated {
            self.emit_relocated(0);
        } else {
            self.emit_absolute(0);
        }
        pos
    }

    /// Overwrite the 4-byte little-endian integer at `pos`.
    pub fn patch_i32(&mut self, pos: usize, value: i32) {
        self.code[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Append this segment's bytes to `out`, which currently ends where the
    /// segment is placed, adding the placement to every relocated address.
    pub fn place_into(&self, out: &mut Vec<u8>) {
        let base = out.len() as i32;
        let start = out.len();
        out.extend_from_slice(&self.code);
        for &pos in &self.relocations {
            let at = start + pos;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&out[at..at + 4]);
            let rebased = i32::from_le_bytes(raw) + base;
            out[at..at + 4].copy_from_slice(&rebased.to_le_bytes());
        }
    }
}
