use log::{debug, trace};

use crate::bytecode::{
    ir::Bytecode,
    op::Instruction,
    scope::{RESULT_SLOT, SLOT_COUNT},
    verify::verify,
};
use crate::lang::value::{VBType, Value, format_number};
use crate::runtime::externs::ExternTable;
use crate::runtime::runtime_error::{VmError, empty_slot, stack_underflow, tag_mismatch};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
    /// Run the bytecode verifier on every buffer passed to `load`.
    pub verify: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
            verify: true,
        }
    }
}

/// Stack machine executing [`Bytecode`].
///
/// Local slots and the operand stack outlive a single buffer: `load` swaps
/// the code and rewinds to byte 0 while keeping everything else, which is
/// how a REPL session sees values computed by earlier entries.
pub struct VirtualMachine {
    code: Bytecode,
    ip: usize,
    stack: Vec<Value>,
    /// Return addresses of active calls.
    call_stack: Vec<usize>,
    locals: Vec<Option<Value>>,
    externs: ExternTable,
    config: VmConfig,
    steps: usize,
}

impl VirtualMachine {
    pub fn new(externs: ExternTable) -> Self {
        Self::with_config(externs, VmConfig::default())
    }

    pub fn with_config(externs: ExternTable, config: VmConfig) -> Self {
        Self {
            code: Bytecode::default(),
            ip: 0,
            stack: Vec::new(),
            call_stack: Vec::new(),
            locals: vec![None; SLOT_COUNT],
            externs,
            config,
            steps: 0,
        }
    }

    /// Hot-swap the program. Stacks and locals are kept.
    pub fn load(&mut self, code: Bytecode) -> Result<(), VmError> {
        if self.config.verify {
            let count = verify(&code)?;
            debug!("verified {} instructions", count);
        }
        debug!("loaded {} bytes of bytecode", code.len());
        self.code = code;
        self.ip = 0;
        Ok(())
    }

    /// Execute from the current position until the top-level `Return` or
    /// the end of the buffer.
    ///
    /// On error the operand and call stacks are discarded so the next
    /// loaded program starts clean; locals survive.
    pub fn run(&mut self) -> Result<(), VmError> {
        self.steps = 0;
        let result = self.run_inner();
        if let Err(e) = &result {
            debug!("execution stopped at {}: {}", self.ip, e.message());
            self.stack.clear();
            self.call_stack.clear();
        }
        result
    }

    fn run_inner(&mut self) -> Result<(), VmError> {
        while self.ip < self.code.len() {
            self.check_limits()?;
            if !self.step().map_err(|e| e.with_call_stack(&self.call_stack))? {
                break;
            }
        }
        Ok(())
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn local(&self, slot: u8) -> Option<&Value> {
        self.locals.get(slot as usize).and_then(Option::as_ref)
    }

    /// The top-level result cell.
    pub fn result(&self) -> Option<&Value> {
        self.local(RESULT_SLOT)
    }

    pub fn externs_mut(&mut self) -> &mut ExternTable {
        &mut self.externs
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: VmConfig) {
        self.config = config;
    }

    /// Drop all state, including locals.
    pub fn reset(&mut self) {
        self.ip = 0;
        self.stack.clear();
        self.call_stack.clear();
        self.locals.iter_mut().for_each(|slot| *slot = None);
        self.steps = 0;
    }

    // Execution

    fn check_limits(&mut self) -> Result<(), VmError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(VmError::runtime(format!(
                    "execution step limit exceeded ({})",
                    max
                )));
            }
        }

        if self.stack.len() > self.config.max_stack_size {
            return Err(VmError::runtime(format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            )));
        }

        Ok(())
    }

    /// Execute one instruction. Returns false once the program has halted.
    fn step(&mut self) -> Result<bool, VmError> {
        let at = self.ip;
        let (instruction, next) = self.code.decode_at(at)?;
        trace!("{:04} {:?}", at, instruction);
        self.ip = next;

        match instruction {
            Instruction::Jump(target) => self.jump(target, at)?,
            Instruction::JumpIf(target) => {
                if self.pop_bool(at)? {
                    self.jump(target, at)?;
                }
            }

            Instruction::Push(value) => self.push(value),
            Instruction::Pop => {
                self.pop(at)?;
            }
            Instruction::Dup => {
                let top = self.stack.last().cloned().ok_or_else(|| stack_underflow(at))?;
                self.push(top);
            }

            // Arithmetic
            Instruction::Add => self.arithmetic(at, |a, b| a + b)?,
            Instruction::Sub => self.arithmetic(at, |a, b| a - b)?,
            Instruction::Mul => self.arithmetic(at, |a, b| a * b)?,
            Instruction::Div => self.arithmetic(at, |a, b| a / b)?,

            // Comparison
            Instruction::Less => self.comparison(at, |a, b| a < b)?,
            Instruction::LessEqual => self.comparison(at, |a, b| a <= b)?,
            Instruction::Greater => self.comparison(at, |a, b| a > b)?,
            Instruction::GreaterEqual => self.comparison(at, |a, b| a >= b)?,
            Instruction::Equal => {
                let equal = self.pop_same_type(at)?;
                self.push(Value::Boolean(equal));
            }
            Instruction::NotEqual => {
                let equal = self.pop_same_type(at)?;
                self.push(Value::Boolean(!equal));
            }

            // Locals
            Instruction::Load(slot) => {
                let value = self.local(slot).cloned().ok_or_else(|| empty_slot(slot, at))?;
                self.push(value);
            }
            Instruction::Store(slot) => {
                let value = self.pop(at)?;
                self.locals[slot as usize] = Some(value);
            }
            Instruction::Free(slot) => self.locals[slot as usize] = None,

            Instruction::Invert => {
                let b = self.pop_bool(at)?;
                self.push(Value::Boolean(!b));
            }
            Instruction::Negate => {
                let n = self.pop_number(at)?;
                self.push(Value::Number(-n));
            }
            Instruction::Convert(target) => {
                let value = self.pop(at)?;
                if !value.vb_type().converts_to(target) {
                    return Err(VmError::fatal(
                        format!("cannot convert {} to {}", value.vb_type(), target),
                        at,
                    ));
                }
                let converted = value
                    .convert(target)
                    .map_err(|e| VmError::runtime(e.to_string()))?;
                self.push(converted);
            }

            // Procedures
            Instruction::Call(target) => {
                if self.call_stack.len() >= self.config.max_call_depth {
                    return Err(VmError::runtime(format!(
                        "call depth limit exceeded ({}) - possible infinite recursion",
                        self.config.max_call_depth
                    )));
                }
                self.call_stack.push(next);
                self.jump(target, at)?;
            }
            Instruction::Return => match self.call_stack.pop() {
                Some(addr) if addr <= self.code.len() => self.ip = addr,
                Some(addr) => {
                    return Err(VmError::fatal(format!("bad return address {}", addr), at));
                }
                None => return Ok(false),
            },
            Instruction::CallExtern(name) => self.call_extern(&name, at)?,

            // Lists
            Instruction::MakeList(count) => {
                let count = count as usize;
                if self.stack.len() < count {
                    return Err(stack_underflow(at));
                }
                let items = self.stack.split_off(self.stack.len() - count);
                self.push(Value::List(items));
            }
            Instruction::GetItem(expected) => {
                let index = self.pop_number(at)?;
                let mut items = self.pop_list(at)?;
                let i = list_index(index, items.len())?;
                let item = items.swap_remove(i);
                if item.vb_type() != expected {
                    return Err(VmError::runtime(format!(
                        "item #{} is {}, not {}",
                        format_number(index),
                        item.vb_type().describe(),
                        expected.describe()
                    )));
                }
                self.push(item);
            }
            Instruction::SetItem => {
                let value = self.pop(at)?;
                let index = self.pop_number(at)?;
                let mut items = self.pop_list(at)?;
                let i = list_index(index, items.len())?;
                items[i] = value;
                self.push(Value::List(items));
            }
        }

        Ok(true)
    }

    fn jump(&mut self, target: u32, at: usize) -> Result<(), VmError> {
        let target = target as usize;
        if target > self.code.len() {
            return Err(VmError::fatal(format!("jump to {} is out of range", target), at));
        }
        self.ip = target;
        Ok(())
    }

    fn call_extern(&mut self, name: &str, at: usize) -> Result<(), VmError> {
        let signature = self
            .externs
            .signature(name)
            .cloned()
            .ok_or_else(|| VmError::fatal(format!("unknown extern '{}'", name), at))?;

        let count = signature.params.len();
        if self.stack.len() < count {
            return Err(stack_underflow(at));
        }
        let args = self.stack.split_off(self.stack.len() - count);
        for (arg, expected) in args.iter().zip(&signature.params) {
            if arg.vb_type() != *expected {
                return Err(tag_mismatch(
                    expected.describe(),
                    arg.vb_type().describe(),
                    at,
                ));
            }
        }

        let returned = self
            .externs
            .call(name, &args)
            .ok_or_else(|| VmError::fatal(format!("unknown extern '{}'", name), at))?
            .map_err(|e| VmError::runtime(format!("{}: {}", name, e)))?;

        match (signature.ret, returned) {
            (VBType::Void, _) => {}
            (expected, Some(value)) if value.vb_type() == expected => self.push(value),
            (expected, Some(value)) => {
                return Err(VmError::runtime(format!(
                    "'{}' gave back {} instead of {}",
                    name,
                    value.vb_type().describe(),
                    expected.describe()
                )));
            }
            (expected, None) => {
                return Err(VmError::runtime(format!(
                    "'{}' gave back nothing instead of {}",
                    name,
                    expected.describe()
                )));
            }
        }
        Ok(())
    }

    fn arithmetic(&mut self, at: usize, op: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let b = self.pop_number(at)?;
        let a = self.pop_number(at)?;
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn comparison(&mut self, at: usize, op: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let b = self.pop_number(at)?;
        let a = self.pop_number(at)?;
        self.push(Value::Boolean(op(a, b)));
        Ok(())
    }

    /// Pop two values of one type and report whether they are equal.
    fn pop_same_type(&mut self, at: usize) -> Result<bool, VmError> {
        let b = self.pop(at)?;
        let a = self.pop(at)?;
        if a.vb_type() != b.vb_type() {
            return Err(tag_mismatch(
                a.vb_type().describe(),
                b.vb_type().describe(),
                at,
            ));
        }
        Ok(a == b)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self, at: usize) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| stack_underflow(at))
    }

    fn pop_number(&mut self, at: usize) -> Result<f64, VmError> {
        match self.pop(at)? {
            Value::Number(n) => Ok(n),
            other => Err(tag_mismatch("a number", other.vb_type().describe(), at)),
        }
    }

    fn pop_bool(&mut self, at: usize) -> Result<bool, VmError> {
        match self.pop(at)? {
            Value::Boolean(b) => Ok(b),
            other => Err(tag_mismatch("a boolean", other.vb_type().describe(), at)),
        }
    }

    fn pop_list(&mut self, at: usize) -> Result<Vec<Value>, VmError> {
        match self.pop(at)? {
            Value::List(items) => Ok(items),
            other => Err(tag_mismatch("a list", other.vb_type().describe(), at)),
        }
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("ip", &self.ip)
            .field("code_len", &self.code.len())
            .field("stack", &self.stack)
            .field("call_stack", &self.call_stack)
            .field("externs", &self.externs)
            .finish()
    }
}

/// Turn a 1-based VeryBasic position into a vector index.
fn list_index(index: f64, len: usize) -> Result<usize, VmError> {
    if index.fract() != 0.0 || index < 1.0 || index > len as f64 {
        return Err(VmError::runtime(format!(
            "there is no item #{} in a list of {} item(s)",
            format_number(index),
            len
        )));
    }
    Ok(index as usize - 1)
}
