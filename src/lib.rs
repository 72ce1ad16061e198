//! VeryBasic: a bytecode compiler and stack virtual machine for a small,
//! English-flavoured teaching language.
//!
//! The parser hands over a [`lang::program::Program`]; the
//! [`bytecode::Compiler`] turns it into a [`bytecode::Bytecode`] buffer and
//! the [`runtime::VirtualMachine`] executes that buffer, calling back into
//! the host through an [`runtime::ExternTable`].

pub mod bytecode;
pub mod demo;
pub mod lang;
pub mod runtime;
