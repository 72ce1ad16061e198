use crate::lang::value::VBType;
use thiserror::Error;

/// Everything the compiler can refuse.
///
/// All variants except [`CompileError::Internal`] are diagnostics about the
/// user's program. `Internal` means the compiler itself is broken and must
/// never be shown as if the user made a mistake.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("compile error: you never said what '{name}' was")]
    UnknownVariable { name: String },

    #[error("compile error: I don't know how to {name}")]
    UnknownProcedure { name: String },

    #[error("compile error: {context}: expected {}, got {}", .expected.describe(), .found.describe())]
    TypeMismatch {
        context: String,
        expected: VBType,
        found: VBType,
    },

    #[error("compile error: '{name}' takes {expected} argument(s), but {found} were given")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("compile error: you already told me how to {name}")]
    Redefinition { name: String },

    #[error("compile error: there is already something called '{name}'")]
    AlreadyDeclared { name: String },

    #[error("compile error: not enough information to know what '{param}' of '{procedure}' is")]
    UnresolvedParameter { procedure: String, param: String },

    #[error("compile error: not enough information to know what {what} is")]
    NotEnoughInformation { what: String },

    #[error("compile error: the prior statement didn't result in anything")]
    NoPriorResult,

    #[error("compile error: {what} doesn't give back anything to use")]
    NoValue { what: String },

    #[error("compile error: {construct} {reason}")]
    InvalidPosition {
        construct: &'static str,
        reason: &'static str,
    },

    #[error("compile error: I can't turn {} into {}", .from.describe(), .to.describe())]
    InvalidConversion { from: VBType, to: VBType },

    #[error("compile error: '{procedure}' might finish without giving back {}", .ty.describe())]
    MissingReturn { procedure: String, ty: VBType },

    #[error("compile error: too many variables are alive at once (at most 255)")]
    TooManySlots,

    #[error("compile error: {0}")]
    TooLarge(String),

    #[error("compile error: internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn mismatch(context: impl Into<String>, expected: VBType, found: VBType) -> Self {
        CompileError::TypeMismatch {
            context: context.into(),
            expected,
            found,
        }
    }

    pub fn unknown_variable(name: &str) -> Self {
        CompileError::UnknownVariable {
            name: name.to_string(),
        }
    }

    pub fn unknown_procedure(name: &str) -> Self {
        CompileError::UnknownProcedure {
            name: name.to_string(),
        }
    }

    pub fn not_enough_information(what: impl Into<String>) -> Self {
        CompileError::NotEnoughInformation { what: what.into() }
    }

    pub fn no_value(what: impl Into<String>) -> Self {
        CompileError::NoValue { what: what.into() }
    }

    pub fn proc_in_block() -> Self {
        CompileError::InvalidPosition {
            construct: "procedure definitions",
            reason: "must be at the top level, not inside a block or another procedure",
        }
    }

    pub fn return_outside_proc() -> Self {
        CompileError::InvalidPosition {
            construct: "return",
            reason: "can only be used inside a procedure",
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    /// True for compiler bugs, false for problems with the program.
    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal(_))
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CompileError::UnknownVariable { .. } => {
                Some("declare it first: variable name, a number, from 0")
            }
            CompileError::UnresolvedParameter { .. } => {
                Some("give the parameter a type: given x, a number")
            }
            CompileError::NotEnoughInformation { .. } => {
                Some("use it where its type is clear, or convert it explicitly")
            }
            CompileError::MissingReturn { .. } => {
                Some("end every path of the procedure with a return")
            }
            CompileError::InvalidConversion { .. } => {
                Some("numbers and booleans convert to strings; strings convert to numbers and booleans")
            }
            _ => None,
        }
    }
}
