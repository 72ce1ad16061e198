//! # VeryBasic language model
//!
//! Values, static types, and the abstract syntax tree handed over by the
//! parser. The AST is consumed by the bytecode compiler in
//! [`crate::bytecode::compile`].

pub mod node;
pub mod program;
pub mod value;
