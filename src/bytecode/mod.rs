pub mod codec;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod scope;
pub mod verify;

pub use compile::Compiler;
pub use compile_error::CompileError;
pub use ir::Bytecode;
pub use op::{Instruction, OpCode};
