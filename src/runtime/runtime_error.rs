use thiserror::Error;

use crate::bytecode::{codec::DecodeError, verify::VerifyError};

/// Errors raised while executing bytecode.
///
/// `Fatal` means the bytecode broke the VM's contract (the compiler or the
/// buffer is faulty). `Runtime` problems come from the program's data or
/// from the host, and are reported to the user like any other diagnostic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("fatal error at {ip}: {message}")]
    Fatal { message: String, ip: usize },

    #[error("runtime error: {message}{}", format_call_stack(.call_stack))]
    Runtime {
        message: String,
        /// Return addresses of the active calls, innermost last.
        call_stack: Vec<usize>,
    },
}

impl VmError {
    pub fn fatal(message: impl Into<String>, ip: usize) -> Self {
        VmError::Fatal {
            message: message.into(),
            ip,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime {
            message: message.into(),
            call_stack: Vec::new(),
        }
    }

    pub fn with_call_stack(self, frames: &[usize]) -> Self {
        match self {
            VmError::Runtime { message, .. } => VmError::Runtime {
                message,
                call_stack: frames.to_vec(),
            },
            fatal => fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::Fatal { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            VmError::Fatal { message, .. } | VmError::Runtime { message, .. } => message,
        }
    }
}

impl From<DecodeError> for VmError {
    fn from(err: DecodeError) -> Self {
        VmError::fatal(err.to_string(), err.offset())
    }
}

impl From<VerifyError> for VmError {
    fn from(err: VerifyError) -> Self {
        VmError::fatal(format!("rejected bytecode: {}", err), err.offset())
    }
}

fn format_call_stack(frames: &[usize]) -> String {
    if frames.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n  call stack:");
    for (i, frame) in frames.iter().rev().enumerate() {
        out.push_str(&format!("\n    {}: returning to {:04}", i, frame));
    }
    out
}

pub fn stack_underflow(ip: usize) -> VmError {
    VmError::fatal("operand stack underflow", ip)
}

pub fn tag_mismatch(expected: &str, got: &str, ip: usize) -> VmError {
    VmError::fatal(format!("expected {} on the stack, found {}", expected, got), ip)
}

pub fn empty_slot(slot: u8, ip: usize) -> VmError {
    VmError::fatal(format!("load from empty slot {}", slot), ip)
}
