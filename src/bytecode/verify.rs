use std::collections::HashSet;

use thiserror::Error;

use crate::bytecode::{
    codec::DecodeError,
    ir::Bytecode,
    op::{Instruction, OpCode},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("bytecode is empty")]
    Empty,

    #[error("bytecode must start with a jump to its entry point")]
    MissingEntryJump,

    #[error("{} at {offset} targets {target}, which is not an instruction", .op.mnemonic())]
    BadTarget {
        op: OpCode,
        offset: usize,
        target: u32,
    },
}

impl VerifyError {
    /// Offset of the offending instruction.
    pub fn offset(&self) -> usize {
        match self {
            VerifyError::Decode(err) => err.offset(),
            VerifyError::Empty | VerifyError::MissingEntryJump => 0,
            VerifyError::BadTarget { offset, .. } => *offset,
        }
    }
}

/// Check that a buffer decodes cleanly from start to end and that every
/// jump and call lands on an instruction boundary.
///
/// Returns the number of instructions.
///
/// NOTE: operand stack heights are not checked. Straight-line height
/// counting is unsound across the compiler's short-circuit and loop jumps,
/// so underflow is left to the VM.
pub fn verify(code: &Bytecode) -> Result<usize, VerifyError> {
    if code.is_empty() {
        return Err(VerifyError::Empty);
    }

    let mut boundaries = HashSet::new();
    let mut transfers = Vec::new();

    for item in code.instructions() {
        let (offset, instruction) = item?;
        if offset == 0 && !matches!(instruction, Instruction::Jump(_)) {
            return Err(VerifyError::MissingEntryJump);
        }
        boundaries.insert(offset);
        if let Some(target) = instruction.jump_target() {
            transfers.push((offset, instruction.opcode(), target));
        }
    }

    for (offset, op, target) in transfers {
        if !boundaries.contains(&(target as usize)) {
            return Err(VerifyError::BadTarget { op, offset, target });
        }
    }

    Ok(boundaries.len())
}
