use crate::bytecode::codec::{self, EncodeError};
use crate::lang::value::{VBType, Value};

// =============================================================================
// OPCODE - one byte at the start of every instruction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // control flow, absolute i32 address operand
    Jump = 0,
    JumpIf = 1,

    // stack
    Push = 2,
    Pop = 3,
    Dup = 4,

    // arithmetic
    Add = 5,
    Sub = 6,
    Mul = 7,
    Div = 8,

    // comparison
    Less = 9,
    LessEqual = 10,
    Greater = 11,
    GreaterEqual = 12,
    Equal = 13,
    NotEqual = 14,

    // local slots, u8 operand
    Load = 15,
    Store = 16,

    Invert = 17,
    Negate = 18,
    Convert = 19,
    Free = 20,

    // procedures
    Call = 21,
    Return = 22,
    CallExtern = 23,

    // lists
    MakeList = 24,
    GetItem = 25,
    SetItem = 26,
}

impl OpCode {
    const ALL: [OpCode; 27] = [
        OpCode::Jump,
        OpCode::JumpIf,
        OpCode::Push,
        OpCode::Pop,
        OpCode::Dup,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Less,
        OpCode::LessEqual,
        OpCode::Greater,
        OpCode::GreaterEqual,
        OpCode::Equal,
        OpCode::NotEqual,
        OpCode::Load,
        OpCode::Store,
        OpCode::Invert,
        OpCode::Negate,
        OpCode::Convert,
        OpCode::Free,
        OpCode::Call,
        OpCode::Return,
        OpCode::CallExtern,
        OpCode::MakeList,
        OpCode::GetItem,
        OpCode::SetItem,
    ];

    pub fn from_byte(byte: u8) -> Option<OpCode> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Jump => "JUMP",
            OpCode::JumpIf => "JUMP_IF",
            OpCode::Push => "PUSH",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Less => "LESS",
            OpCode::LessEqual => "LESS_EQ",
            OpCode::Greater => "GREATER",
            OpCode::GreaterEqual => "GREATER_EQ",
            OpCode::Equal => "EQUAL",
            OpCode::NotEqual => "NOT_EQUAL",
            OpCode::Load => "LOAD",
            OpCode::Store => "STORE",
            OpCode::Invert => "INVERT",
            OpCode::Negate => "NEGATE",
            OpCode::Convert => "CONVERT",
            OpCode::Free => "FREE",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::CallExtern => "CALL_EXTERN",
            OpCode::MakeList => "MAKE_LIST",
            OpCode::GetItem => "GET_ITEM",
            OpCode::SetItem => "SET_ITEM",
        }
    }
}

// =============================================================================
// INSTRUCTION - an opcode together with its decoded operands
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Jump(u32),
    /// Pop a boolean; jump only if it is true.
    JumpIf(u32),

    Push(Value),
    Pop,
    Dup,

    Add,
    Sub,
    Mul,
    Div,

    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,

    Load(u8),
    Store(u8),

    Invert,
    Negate,
    Convert(VBType),
    /// Marks a slot as released by the compiler's scope bookkeeping.
    Free(u8),

    Call(u32),
    Return,
    CallExtern(String),

    MakeList(u16),
    GetItem(VBType),
    SetItem,
}

impl Instruction {
    pub fn opcode(&self) -> OpCode {
        match self {
            Instruction::Jump(_) => OpCode::Jump,
            Instruction::JumpIf(_) => OpCode::JumpIf,
            Instruction::Push(_) => OpCode::Push,
            Instruction::Pop => OpCode::Pop,
            Instruction::Dup => OpCode::Dup,
            Instruction::Add => OpCode::Add,
            Instruction::Sub => OpCode::Sub,
            Instruction::Mul => OpCode::Mul,
            Instruction::Div => OpCode::Div,
            Instruction::Less => OpCode::Less,
            Instruction::LessEqual => OpCode::LessEqual,
            Instruction::Greater => OpCode::Greater,
            Instruction::GreaterEqual => OpCode::GreaterEqual,
            Instruction::Equal => OpCode::Equal,
            Instruction::NotEqual => OpCode::NotEqual,
            Instruction::Load(_) => OpCode::Load,
            Instruction::Store(_) => OpCode::Store,
            Instruction::Invert => OpCode::Invert,
            Instruction::Negate => OpCode::Negate,
            Instruction::Convert(_) => OpCode::Convert,
            Instruction::Free(_) => OpCode::Free,
            Instruction::Call(_) => OpCode::Call,
            Instruction::Return => OpCode::Return,
            Instruction::CallExtern(_) => OpCode::CallExtern,
            Instruction::MakeList(_) => OpCode::MakeList,
            Instruction::GetItem(_) => OpCode::GetItem,
            Instruction::SetItem => OpCode::SetItem,
        }
    }

    /// Append the encoded instruction to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        out.push(self.opcode().as_byte());
        match self {
            Instruction::Jump(addr) | Instruction::JumpIf(addr) | Instruction::Call(addr) => {
                codec::encode_i32(out, *addr as i32)
            }
            Instruction::Push(value) => codec::encode_value(out, value)?,
            Instruction::Load(slot) | Instruction::Store(slot) | Instruction::Free(slot) => {
                out.push(*slot)
            }
            Instruction::Convert(ty) | Instruction::GetItem(ty) => codec::encode_type(out, *ty),
            Instruction::CallExtern(name) => {
                codec::encode_value(out, &Value::String(name.clone()))?
            }
            Instruction::MakeList(count) => codec::encode_u16(out, *count),
            _ => {}
        }
        Ok(())
    }

    /// Absolute address this instruction may transfer control to.
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Instruction::Jump(addr) | Instruction::JumpIf(addr) | Instruction::Call(addr) => {
                Some(*addr)
            }
            _ => None,
        }
    }
}
