use std::collections::BTreeMap;

use log::debug;
use thiserror::Error;

use crate::bytecode::{compile::Compiler, compile_error::CompileError, ir::Bytecode};
use crate::lang::{program::Program, value::Value};
use crate::runtime::externs::ExternTable;
use crate::runtime::runtime_error::VmError;
use crate::runtime::vm_bc::{VirtualMachine, VmConfig};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Vm(#[from] VmError),
}

impl SessionError {
    /// True when the fault lies with the toolchain rather than the program.
    pub fn is_internal(&self) -> bool {
        match self {
            SessionError::Compile(e) => e.is_internal(),
            SessionError::Vm(e) => e.is_fatal(),
        }
    }
}

/// A compiler and a VM sharing one set of variables and procedures.
///
/// Each call to [`Session::run`] compiles a unit against everything defined
/// so far and hot-swaps the result into the VM, the way a REPL feeds one
/// entry at a time.
#[derive(Debug)]
pub struct Session {
    compiler: Compiler,
    vm: VirtualMachine,
    last: Option<Bytecode>,
    /// Compiler state from before the unit awaiting execution.
    checkpoint: Option<Compiler>,
}

impl Session {
    pub fn new(externs: ExternTable) -> Self {
        Self::with_config(externs, VmConfig::default())
    }

    pub fn with_config(externs: ExternTable, config: VmConfig) -> Self {
        Session {
            compiler: Compiler::new(externs.signatures()),
            vm: VirtualMachine::with_config(externs, config),
            last: None,
            checkpoint: None,
        }
    }

    /// Compile a unit without running it.
    ///
    /// Its declarations stay provisional until [`Session::execute`] runs the
    /// code to completion.
    pub fn compile(&mut self, program: &Program) -> Result<Bytecode, SessionError> {
        let checkpoint = self.compiler.clone();
        let code = self.compiler.compile(program)?;
        self.checkpoint = Some(checkpoint);
        self.last = Some(code.clone());
        Ok(code)
    }

    /// Compile, load and execute a unit.
    ///
    /// A compile error leaves both halves of the session untouched. After a
    /// runtime error the unit's declarations are withdrawn and "the result"
    /// is unavailable. Assignments to existing variables made before the
    /// failure are kept.
    pub fn run(&mut self, program: &Program) -> Result<(), SessionError> {
        let code = self.compile(program)?;
        self.execute(code)
    }

    /// Hot-swap `code` into the VM and run it.
    pub fn execute(&mut self, code: Bytecode) -> Result<(), SessionError> {
        debug!("running {} bytes", code.len());
        let outcome = self.vm.load(code).and_then(|_| self.vm.run());
        let checkpoint = self.checkpoint.take();
        if let Err(e) = outcome {
            if let Some(checkpoint) = checkpoint {
                self.compiler = checkpoint;
            }
            self.compiler.forget_result();
            debug!("run failed, declarations withdrawn: {}", e.message());
            return Err(e.into());
        }
        Ok(())
    }

    /// Value of "the result" after the last statement that produced one.
    pub fn result(&self) -> Option<&Value> {
        self.vm.result()
    }

    /// Bytecode produced by the most recent successful compile.
    pub fn last_bytecode(&self) -> Option<&Bytecode> {
        self.last.as_ref()
    }

    /// Procedure names by address, for the disassembler.
    pub fn procedure_labels(&self) -> BTreeMap<u32, String> {
        self.compiler.procedure_labels()
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn vm(&self) -> &VirtualMachine {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut VirtualMachine {
        &mut self.vm
    }
}
