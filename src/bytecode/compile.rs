use std::collections::{BTreeMap, HashMap};

use log::{debug, trace};

use crate::{
    bytecode::{
        codec::{self, EncodeError},
        compile_error::CompileError,
        ir::{Bytecode, Segment},
        op::OpCode,
        scope::{RESULT_SLOT, ScopeTable, Slot, SlotAllocator, Variable},
    },
    lang::{
        node::{BinOp, Node, Param, UnaryOp, block_always_returns},
        program::Program,
        value::{VBType, Value},
    },
    runtime::externs::Signature,
};

/// Address of the first procedure body: right after the entry `Jump`.
pub const PROLOGUE_BASE: u32 = 5;

const VOID: Option<VBType> = Some(VBType::Void);

#[derive(Debug, Clone)]
struct Parameter {
    name: String,
    ty: Option<VBType>,
    slot: Slot,
}

#[derive(Debug, Clone)]
struct Procedure {
    address: u32,
    params: Vec<Parameter>,
    return_type: Option<VBType>,
    /// Return type written in the definition; `return` must match it exactly.
    declared_return: bool,
    /// Type a recursive call inside the body committed to before any
    /// `return` settled it. The finished body must agree.
    assumed_return: Option<VBType>,
    /// Slot holding "the result" inside this procedure, allocated on first use.
    result_slot: Option<Slot>,
}

/// Single-pass compiler from VeryBasic ASTs to [`Bytecode`].
///
/// A `Compiler` is a session: variables, procedures and the compiled
/// procedure bodies (the prologue) survive from one [`Compiler::compile`]
/// call to the next, so a REPL can feed it one entry at a time and hot-swap
/// each result into the same VM. A failed compile leaves the session
/// exactly as it was before the call.
#[derive(Debug, Clone)]
pub struct Compiler {
    externs: HashMap<String, Signature>,
    procedures: HashMap<String, Procedure>,

    /// Procedure bodies, placed at `PROLOGUE_BASE`. Addresses are absolute.
    prologue: Segment,
    /// Top-level code of the current unit. Addresses are relocated.
    tail: Segment,

    scopes: ScopeTable,
    slots: SlotAllocator,

    /// Procedure whose body is being compiled.
    current: Option<String>,
    /// Type of the previous statement in the current block.
    prior: VBType,
}

impl Compiler {
    pub fn new(externs: HashMap<String, Signature>) -> Self {
        Self {
            externs,
            procedures: HashMap::new(),
            prologue: Segment::new(),
            tail: Segment::new(),
            scopes: ScopeTable::new(),
            slots: SlotAllocator::new(),
            current: None,
            prior: VBType::Void,
        }
    }

    /// Compile one unit against the session state.
    ///
    /// The returned bytecode contains every procedure defined so far, in
    /// this call or an earlier one, followed by this unit's top-level code.
    pub fn compile(&mut self, program: &Program) -> Result<Bytecode, CompileError> {
        let checkpoint = self.clone();
        match self.compile_unit(program) {
            Ok(code) => Ok(code),
            Err(e) => {
                debug!("compile failed, session restored: {}", e);
                *self = checkpoint;
                Err(e)
            }
        }
    }

    /// Signature of a procedure defined in this session.
    ///
    /// Parameter and return types are always settled once the defining
    /// compile has succeeded.
    pub fn procedure(&self, name: &str) -> Option<Signature> {
        self.procedures.get(name).map(|proc| Signature {
            params: proc
                .params
                .iter()
                .map(|p| p.ty.unwrap_or(VBType::Void))
                .collect(),
            ret: proc.return_type.unwrap_or(VBType::Void),
        })
    }

    pub fn procedure_address(&self, name: &str) -> Option<u32> {
        self.procedures.get(name).map(|proc| proc.address)
    }

    /// Every defined procedure keyed by the address of its body.
    pub fn procedure_labels(&self) -> BTreeMap<u32, String> {
        self.procedures
            .iter()
            .map(|(name, proc)| (proc.address, name.clone()))
            .collect()
    }

    /// A variable visible at the top level of the session.
    pub fn variable(&self, name: &str) -> Option<Variable> {
        self.scopes.get(name).copied()
    }

    /// Make "the result" unavailable until the next statement produces one.
    ///
    /// Used after a unit fails at run time, when the result cell may hold a
    /// value of a type the compiler no longer knows.
    pub fn forget_result(&mut self) {
        self.prior = VBType::Void;
    }

    pub fn prologue_len(&self) -> usize {
        self.prologue.len()
    }

    fn compile_unit(&mut self, program: &Program) -> Result<Bytecode, CompileError> {
        self.tail.clear();
        for statement in &program.statements {
            self.compile_statement(statement)?;
        }
        self.tail.emit_op(OpCode::Return);
        self.assemble()
    }

    fn assemble(&self) -> Result<Bytecode, CompileError> {
        let entry = PROLOGUE_BASE as usize + self.prologue.len();
        let entry_addr = i32::try_from(entry)
            .map_err(|_| CompileError::TooLarge("the program is too large to address".into()))?;

        let mut out = Vec::with_capacity(entry + self.tail.len());
        out.push(OpCode::Jump.as_byte());
        codec::encode_i32(&mut out, entry_addr);
        self.prologue.place_into(&mut out);
        self.tail.place_into(&mut out);

        debug!(
            "assembled {} bytes (prologue {}, top level {})",
            out.len(),
            self.prologue.len(),
            self.tail.len()
        );
        Ok(Bytecode::new(out))
    }

    // =========================================================================
    // Statements and blocks
    // =========================================================================

    fn compile_statement(&mut self, node: &Node) -> Result<(), CompileError> {
        let ty = match self.compile_node(node, None)? {
            Some(ty) => ty,
            // a procedure calling itself as a statement gives back nothing
            None if self.is_self_call(node) => {
                self.assume_return(VBType::Void)?;
                VBType::Void
            }
            None => {
                return Err(CompileError::not_enough_information(format!(
                    "the value of this {}",
                    node.kind()
                )));
            }
        };

        if ty != VBType::Void {
            let slot = self.result_slot()?;
            self.emit_slot(OpCode::Store, slot);
        }
        self.prior = ty;
        Ok(())
    }

    fn compile_block(&mut self, block: &[Node]) -> Result<(), CompileError> {
        let outer = std::mem::replace(&mut self.prior, VBType::Void);
        self.scopes.enter();
        for statement in block {
            self.compile_statement(statement)?;
        }
        self.leave_scope();
        self.prior = outer;
        Ok(())
    }

    fn leave_scope(&mut self) {
        for slot in self.scopes.leave() {
            self.slots.release(slot);
            self.emit_slot(OpCode::Free, slot);
        }
    }

    /// Compile `node`, leaving its value (if any) on the operand stack.
    ///
    /// `want` is the type the surrounding context needs, used to settle
    /// parameters and recursive return types that are still unknown.
    /// `Ok(None)` means the type could not be determined yet.
    fn compile_node(
        &mut self,
        node: &Node,
        want: Option<VBType>,
    ) -> Result<Option<VBType>, CompileError> {
        trace!("compiling {} (want {:?})", node.kind(), want);

        match node {
            Node::Value(value) => {
                self.emit_push(value)?;
                Ok(Some(value.vb_type()))
            }
            Node::Unary { op, expr } => self.compile_unary(*op, expr),
            Node::Binary { left, op, right } => self.compile_binary(left, *op, right),
            Node::TheResult => self.compile_the_result(),
            Node::VarRef(name) => self.compile_var_ref(name, want),
            Node::VarDecl { name, ty, value } => self
                .compile_declaration(name, *ty, value.as_deref())
                .map(|_| VOID),
            Node::VarSet { name, value } => self.compile_assignment(name, value).map(|_| VOID),
            Node::If {
                condition,
                then,
                otherwise,
            } => self
                .compile_if(condition, then, otherwise.as_deref())
                .map(|_| VOID),
            Node::While { condition, body } => self.compile_while(condition, body).map(|_| VOID),
            Node::Repeat { times, body } => self.compile_repeat(times, body).map(|_| VOID),
            Node::Call { name, args } => self.compile_call(name, args, want),
            Node::ProcDef {
                name,
                params,
                return_type,
                body,
            } => self
                .compile_proc_def(name, params, *return_type, body)
                .map(|_| VOID),
            Node::Convert { expr, target } => self.compile_convert(expr, *target),
            Node::Return(expr) => self.compile_return(expr.as_deref()).map(|_| VOID),
            Node::List(items) => self.compile_list(items),
            Node::ListGet { index, list } => self.compile_list_get(index, list, want),
            Node::ListSet { index, list, value } => {
                self.compile_list_set(index, list, value).map(|_| VOID)
            }
        }
    }

    // =========================================================================
    // Type checking helpers
    // =========================================================================

    /// Check that `node`, which compiled to `found`, has type `want`.
    fn expect(
        &mut self,
        node: &Node,
        found: Option<VBType>,
        want: VBType,
        context: &str,
    ) -> Result<(), CompileError> {
        match found {
            Some(ty) if ty == want => Ok(()),
            Some(ty) => Err(CompileError::mismatch(context, want, ty)),
            None => self.settle(node, want),
        }
    }

    /// Compile an operand that must have type `want`.
    fn operand(&mut self, node: &Node, want: VBType, context: &str) -> Result<(), CompileError> {
        let found = self.compile_node(node, Some(want))?;
        self.expect(node, found, want, context)
    }

    /// Compile a value-producing expression, requiring `expected` when it is
    /// known, and return its type.
    fn compile_value(
        &mut self,
        node: &Node,
        expected: Option<VBType>,
        what: &str,
    ) -> Result<VBType, CompileError> {
        let found = self.compile_node(node, expected)?;
        let ty = match (expected, found) {
            (Some(ty), found) => {
                self.expect(node, found, ty, what)?;
                ty
            }
            (None, Some(ty)) => ty,
            (None, None) => return Err(CompileError::not_enough_information(what)),
        };
        if ty == VBType::Void {
            return Err(CompileError::no_value(what));
        }
        Ok(ty)
    }

    /// Fix the type of an expression whose type was still open.
    fn settle(&mut self, node: &Node, ty: VBType) -> Result<(), CompileError> {
        match node {
            Node::VarRef(name) => {
                if let Some(index) = self.param_index(name) {
                    self.resolve_param(index, ty);
                    return Ok(());
                }
            }
            Node::Call { name, .. } if self.current.as_deref() == Some(name.as_str()) => {
                return self.assume_return(ty);
            }
            _ => {}
        }
        Err(CompileError::internal(format!(
            "no open type to settle on a {}",
            node.kind()
        )))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn compile_unary(&mut self, op: UnaryOp, expr: &Node) -> Result<Option<VBType>, CompileError> {
        let (ty, opcode, context) = match op {
            UnaryOp::Negate => (VBType::Number, OpCode::Negate, "negation"),
            UnaryOp::Invert => (VBType::Boolean, OpCode::Invert, "'not'"),
        };
        self.operand(expr, ty, context)?;
        self.code().emit_op(opcode);
        Ok(Some(ty))
    }

    fn compile_binary(
        &mut self,
        left: &Node,
        op: BinOp,
        right: &Node,
    ) -> Result<Option<VBType>, CompileError> {
        let (opcode, result) = match op {
            BinOp::Add => (OpCode::Add, VBType::Number),
            BinOp::Sub => (OpCode::Sub, VBType::Number),
            BinOp::Mul => (OpCode::Mul, VBType::Number),
            BinOp::Div => (OpCode::Div, VBType::Number),
            BinOp::Less => (OpCode::Less, VBType::Boolean),
            BinOp::LessEqual => (OpCode::LessEqual, VBType::Boolean),
            BinOp::Greater => (OpCode::Greater, VBType::Boolean),
            BinOp::GreaterEqual => (OpCode::GreaterEqual, VBType::Boolean),
            BinOp::Equal => return self.compile_equality(left, OpCode::Equal, op, right),
            BinOp::NotEqual => return self.compile_equality(left, OpCode::NotEqual, op, right),
            BinOp::And | BinOp::Or => return self.compile_logical(left, op, right),
        };

        let context = format!("'{}'", op.symbol());
        self.operand(left, VBType::Number, &context)?;
        self.operand(right, VBType::Number, &context)?;
        self.code().emit_op(opcode);
        Ok(Some(result))
    }

    /// Both sides must have the same type, whichever it is.
    fn compile_equality(
        &mut self,
        left: &Node,
        opcode: OpCode,
        op: BinOp,
        right: &Node,
    ) -> Result<Option<VBType>, CompileError> {
        let context = format!("'{}'", op.symbol());

        let l = self.compile_node(left, None)?;
        if l == VOID {
            return Err(CompileError::no_value(format!("the left side of {}", context)));
        }
        let r = self.compile_node(right, l)?;
        if r == VOID {
            return Err(CompileError::no_value(format!("the right side of {}", context)));
        }

        match (l, r) {
            (Some(a), Some(b)) if a != b => return Err(CompileError::mismatch(&context, a, b)),
            (Some(_), Some(_)) => {}
            (None, Some(b)) => self.settle(left, b)?,
            (Some(a), None) => self.settle(right, a)?,
            (None, None) => {
                return Err(CompileError::not_enough_information(format!(
                    "the two sides of {}",
                    context
                )));
            }
        }

        self.code().emit_op(opcode);
        Ok(Some(VBType::Boolean))
    }

    /// `and` / `or` with short-circuit jumps.
    ///
    /// ```text
    /// and:  L  INVERT  JUMP_IF F  R  JUMP E  F: PUSH false  E:
    /// or:   L          JUMP_IF T  R  JUMP E  T: PUSH true   E:
    /// ```
    fn compile_logical(
        &mut self,
        left: &Node,
        op: BinOp,
        right: &Node,
    ) -> Result<Option<VBType>, CompileError> {
        let context = format!("'{}'", op.symbol());
        let is_and = matches!(op, BinOp::And);

        self.operand(left, VBType::Boolean, &context)?;
        if is_and {
            self.code().emit_op(OpCode::Invert);
        }
        let short_circuit = self.emit_jump_placeholder(OpCode::JumpIf);
        self.operand(right, VBType::Boolean, &context)?;
        let end = self.emit_jump_placeholder(OpCode::Jump);

        self.patch_here(short_circuit);
        self.emit_push(&Value::Boolean(!is_and))?;
        self.patch_here(end);

        Ok(Some(VBType::Boolean))
    }

    fn compile_the_result(&mut self) -> Result<Option<VBType>, CompileError> {
        if self.prior == VBType::Void {
            return Err(CompileError::NoPriorResult);
        }
        let slot = self.result_slot()?;
        self.emit_slot(OpCode::Load, slot);
        Ok(Some(self.prior))
    }

    fn compile_var_ref(
        &mut self,
        name: &str,
        want: Option<VBType>,
    ) -> Result<Option<VBType>, CompileError> {
        if let Some(index) = self.param_index(name) {
            let (slot, ty) = self.param_at(index)?;
            self.emit_slot(OpCode::Load, slot);
            if ty.is_none() {
                if let Some(want) = want {
                    self.resolve_param(index, want);
                    return Ok(Some(want));
                }
            }
            return Ok(ty);
        }

        let var = self
            .scopes
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::unknown_variable(name))?;
        self.emit_slot(OpCode::Load, var.slot);
        Ok(Some(var.ty))
    }

    fn compile_convert(
        &mut self,
        expr: &Node,
        target: VBType,
    ) -> Result<Option<VBType>, CompileError> {
        let what = "the value being converted";
        let from = self
            .compile_node(expr, None)?
            .ok_or_else(|| CompileError::not_enough_information(what))?;
        if from == VBType::Void {
            return Err(CompileError::no_value(what));
        }
        if !from.converts_to(target) {
            return Err(CompileError::InvalidConversion { from, to: target });
        }

        let code = self.code();
        code.emit_op(OpCode::Convert);
        code.emit_type(target);
        Ok(Some(target))
    }

    fn compile_call(
        &mut self,
        name: &str,
        args: &[Node],
        want: Option<VBType>,
    ) -> Result<Option<VBType>, CompileError> {
        if let Some(proc) = self.procedures.get(name) {
            let address = proc.address;
            check_arity(name, proc.params.len(), args.len())?;

            for (i, arg) in args.iter().enumerate() {
                // re-read each time: an earlier argument may have settled a later parameter
                let expected = self
                    .procedures
                    .get(name)
                    .and_then(|p| p.params.get(i))
                    .and_then(|p| p.ty);
                let what = format!("argument {} of '{}'", i + 1, name);
                let ty = self.compile_value(arg, expected, &what)?;
                if expected.is_none() {
                    // only a procedure calling itself can still have open parameters
                    self.resolve_param(i, ty);
                }
            }

            let code = self.code();
            code.emit_op(OpCode::Call);
            code.emit_absolute(address);

            let ret = self.procedures.get(name).and_then(|p| p.return_type);
            return Ok(match (ret, want) {
                (Some(ty), _) => Some(ty),
                (None, Some(want)) => {
                    self.assume_return(want)?;
                    Some(want)
                }
                (None, None) => None,
            });
        }

        if let Some(sig) = self.externs.get(name).cloned() {
            check_arity(name, sig.params.len(), args.len())?;
            for (i, (arg, ty)) in args.iter().zip(&sig.params).enumerate() {
                let what = format!("argument {} of '{}'", i + 1, name);
                self.compile_value(arg, Some(*ty), &what)?;
            }

            self.code().emit_op(OpCode::CallExtern);
            self.code()
                .emit_value(&Value::String(name.to_string()))
                .map_err(encode_error)?;
            return Ok(Some(sig.ret));
        }

        Err(CompileError::unknown_procedure(name))
    }

    /// Literal lists made only of constants are inlined as one value;
    /// anything else is built at run time.
    fn compile_list(&mut self, items: &[Node]) -> Result<Option<VBType>, CompileError> {
        let constants: Option<Vec<Value>> = items
            .iter()
            .map(|item| match item {
                Node::Value(value) => Some(value.clone()),
                _ => None,
            })
            .collect();
        if let Some(values) = constants {
            self.emit_push(&Value::List(values))?;
            return Ok(Some(VBType::List));
        }

        let count = codec::length_u16("list", items.len()).map_err(encode_error)?;
        for (i, item) in items.iter().enumerate() {
            self.compile_value(item, None, &format!("item {} of the list", i + 1))?;
        }
        let code = self.code();
        code.emit_op(OpCode::MakeList);
        code.emit_u16(count);
        Ok(Some(VBType::List))
    }

    /// Lists are untyped, so the item type comes from the context and is
    /// checked by the VM.
    fn compile_list_get(
        &mut self,
        index: &Node,
        list: &Node,
        want: Option<VBType>,
    ) -> Result<Option<VBType>, CompileError> {
        self.operand(list, VBType::List, "the list in '#... of'")?;
        self.operand(index, VBType::Number, "the position in '#... of'")?;

        let ty = match want {
            Some(VBType::Void) => return Err(CompileError::no_value("a list item")),
            Some(ty) => ty,
            None => return Err(CompileError::not_enough_information("this list item")),
        };
        let code = self.code();
        code.emit_op(OpCode::GetItem);
        code.emit_type(ty);
        Ok(Some(ty))
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_declaration(
        &mut self,
        name: &str,
        declared: Option<VBType>,
        value: Option<&Node>,
    ) -> Result<(), CompileError> {
        if self.is_visible(name) {
            return Err(CompileError::AlreadyDeclared {
                name: name.to_string(),
            });
        }

        let slot = self.slots.allocate().ok_or(CompileError::TooManySlots)?;
        let what = format!("the value for '{}'", name);
        let ty = match value {
            Some(value) => self.compile_value(value, declared, &what)?,
            None => {
                let ty = declared
                    .ok_or_else(|| CompileError::not_enough_information(format!("'{}'", name)))?;
                let default = Value::default_for(ty).ok_or_else(|| CompileError::no_value(&what))?;
                self.emit_push(&default)?;
                ty
            }
        };

        self.emit_slot(OpCode::Store, slot);
        self.scopes.declare(name, ty, slot);
        trace!("declared '{}' as {} in slot {}", name, ty, slot);
        Ok(())
    }

    fn compile_assignment(&mut self, name: &str, value: &Node) -> Result<(), CompileError> {
        let what = format!("the new value of '{}'", name);

        if let Some(index) = self.param_index(name) {
            let (slot, declared) = self.param_at(index)?;
            let ty = self.compile_value(value, declared, &what)?;
            if declared.is_none() {
                self.resolve_param(index, ty);
            }
            self.emit_slot(OpCode::Store, slot);
            return Ok(());
        }

        let var = self
            .scopes
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::unknown_variable(name))?;
        self.compile_value(value, Some(var.ty), &what)?;
        self.emit_slot(OpCode::Store, var.slot);
        Ok(())
    }

    /// `set #i of xs to v` rewrites the whole list back into its variable.
    fn compile_list_set(
        &mut self,
        index: &Node,
        list: &Node,
        value: &Node,
    ) -> Result<(), CompileError> {
        let Node::VarRef(name) = list else {
            return Err(CompileError::InvalidPosition {
                construct: "setting a list item",
                reason: "needs a variable holding the list",
            });
        };

        self.operand(list, VBType::List, &format!("'{}'", name))?;
        let slot = self.slot_of(name)?;
        self.operand(index, VBType::Number, "the position in 'set #...'")?;
        self.compile_value(value, None, "the new item")?;

        self.code().emit_op(OpCode::SetItem);
        self.emit_slot(OpCode::Store, slot);
        Ok(())
    }

    fn compile_if(
        &mut self,
        condition: &Node,
        then: &[Node],
        otherwise: Option<&[Node]>,
    ) -> Result<(), CompileError> {
        self.operand(condition, VBType::Boolean, "the condition of 'if'")?;
        self.code().emit_op(OpCode::Invert);
        let skip_then = self.emit_jump_placeholder(OpCode::JumpIf);

        self.compile_block(then)?;

        match otherwise {
            Some(otherwise) => {
                let skip_else = self.emit_jump_placeholder(OpCode::Jump);
                self.patch_here(skip_then);
                self.compile_block(otherwise)?;
                self.patch_here(skip_else);
            }
            None => self.patch_here(skip_then),
        }
        Ok(())
    }

    fn compile_while(&mut self, condition: &Node, body: &[Node]) -> Result<(), CompileError> {
        let head = self.here();
        self.operand(condition, VBType::Boolean, "the condition of 'while'")?;
        self.code().emit_op(OpCode::Invert);
        let exit = self.emit_jump_placeholder(OpCode::JumpIf);

        self.compile_block(body)?;
        self.emit_jump_to(OpCode::Jump, head);
        self.patch_here(exit);
        Ok(())
    }

    /// Counted loop. The count and the iteration counter live in two scratch
    /// slots owned by the loop, so the operand stack is empty while the body
    /// runs.
    ///
    /// ```text
    ///        N  DUP  PUSH 0  LESS_EQ  JUMP_IF SKIP
    ///        STORE t  PUSH 0  STORE i
    /// TOP:   body
    ///        LOAD i  PUSH 1  ADD  DUP  STORE i  LOAD t  LESS  JUMP_IF TOP
    ///        JUMP END
    /// SKIP:  POP
    /// END:   FREE t  FREE i
    /// ```
    fn compile_repeat(&mut self, times: &Node, body: &[Node]) -> Result<(), CompileError> {
        self.scopes.enter();

        self.operand(times, VBType::Number, "the count of 'repeat'")?;
        self.code().emit_op(OpCode::Dup);
        self.emit_push(&Value::Number(0.0))?;
        self.code().emit_op(OpCode::LessEqual);
        let skip = self.emit_jump_placeholder(OpCode::JumpIf);

        let threshold = self.scratch_slot()?;
        let counter = self.scratch_slot()?;
        self.emit_slot(OpCode::Store, threshold);
        self.emit_push(&Value::Number(0.0))?;
        self.emit_slot(OpCode::Store, counter);

        let top = self.here();
        self.compile_block(body)?;

        self.emit_slot(OpCode::Load, counter);
        self.emit_push(&Value::Number(1.0))?;
        self.code().emit_op(OpCode::Add);
        self.code().emit_op(OpCode::Dup);
        self.emit_slot(OpCode::Store, counter);
        self.emit_slot(OpCode::Load, threshold);
        self.code().emit_op(OpCode::Less);
        self.emit_jump_to(OpCode::JumpIf, top);
        let end = self.emit_jump_placeholder(OpCode::Jump);

        self.patch_here(skip);
        self.code().emit_op(OpCode::Pop);
        self.patch_here(end);

        self.leave_scope();
        Ok(())
    }

    fn compile_proc_def(
        &mut self,
        name: &str,
        params: &[Param],
        return_type: Option<VBType>,
        body: &[Node],
    ) -> Result<(), CompileError> {
        if self.current.is_some() || self.scopes.depth() > 0 {
            return Err(CompileError::proc_in_block());
        }
        if self.procedures.contains_key(name) || self.externs.contains_key(name) {
            return Err(CompileError::Redefinition {
                name: name.to_string(),
            });
        }
        for (i, param) in params.iter().enumerate() {
            if params[..i].iter().any(|p| p.name == param.name) {
                return Err(CompileError::AlreadyDeclared {
                    name: param.name.clone(),
                });
            }
        }

        let address = u32::try_from(PROLOGUE_BASE as usize + self.prologue.len())
            .map_err(|_| CompileError::TooLarge("the program is too large to address".into()))?;

        let mut parameters = Vec::with_capacity(params.len());
        for param in params {
            let slot = self.slots.allocate().ok_or(CompileError::TooManySlots)?;
            parameters.push(Parameter {
                name: param.name.clone(),
                ty: param.ty,
                slot,
            });
        }

        // arguments are pushed in order, so the last one is on top
        for param in parameters.iter().rev() {
            self.prologue.emit_op(OpCode::Store);
            self.prologue.emit_u8(param.slot);
        }

        self.procedures.insert(
            name.to_string(),
            Procedure {
                address,
                params: parameters,
                return_type,
                declared_return: return_type.is_some(),
                assumed_return: None,
                result_slot: None,
            },
        );
        self.current = Some(name.to_string());

        let outer = std::mem::replace(&mut self.prior, VBType::Void);
        self.scopes.enter();
        for statement in body {
            self.compile_statement(statement)?;
        }
        self.leave_scope();
        self.prior = outer;
        self.current = None;

        let proc = self
            .procedures
            .get_mut(name)
            .ok_or_else(|| CompileError::internal(format!("procedure '{}' vanished", name)))?;
        if let Some(open) = proc.params.iter().find(|p| p.ty.is_none()) {
            return Err(CompileError::UnresolvedParameter {
                procedure: name.to_string(),
                param: open.name.clone(),
            });
        }
        let ret = *proc.return_type.get_or_insert(VBType::Void);
        if let Some(assumed) = proc.assumed_return {
            if assumed != ret {
                return Err(CompileError::mismatch(
                    format!("the recursive call to '{}'", name),
                    assumed,
                    ret,
                ));
            }
        }

        let returns = block_always_returns(body);
        if ret != VBType::Void && !returns {
            return Err(CompileError::MissingReturn {
                procedure: name.to_string(),
                ty: ret,
            });
        }
        if !returns {
            self.prologue.emit_op(OpCode::Return);
        }

        debug!(
            "procedure '{}' at {} ({} bytes), giving back {}",
            name,
            address,
            PROLOGUE_BASE as usize + self.prologue.len() - address as usize,
            ret
        );
        Ok(())
    }

    fn compile_return(&mut self, expr: Option<&Node>) -> Result<(), CompileError> {
        let (name, current, declared) = match (self.current.clone(), self.current_proc()) {
            (Some(name), Some(proc)) => (name, proc.return_type, proc.declared_return),
            _ => return Err(CompileError::return_outside_proc()),
        };
        let what = format!("the value '{}' gives back", name);

        let ty = match expr {
            Some(expr) if declared => self.compile_value(expr, current, &what)?,
            Some(expr) => {
                // the type so far only fills in what the expression leaves open
                let hint = current.filter(|ty| *ty != VBType::Void);
                let ty = self
                    .compile_node(expr, hint)?
                    .ok_or_else(|| CompileError::not_enough_information(&what))?;
                if ty == VBType::Void {
                    return Err(CompileError::no_value(&what));
                }
                ty
            }
            None => VBType::Void,
        };

        if declared {
            if current != Some(ty) {
                return Err(CompileError::mismatch(
                    format!("return from '{}'", name),
                    current.unwrap_or(VBType::Void),
                    ty,
                ));
            }
        } else if let Some(proc) = self.current_proc_mut() {
            // the last `return` compiled decides
            proc.return_type = Some(ty);
        }

        self.code().emit_op(OpCode::Return);
        Ok(())
    }

    // =========================================================================
    // Names and slots
    // =========================================================================

    fn current_proc(&self) -> Option<&Procedure> {
        self.procedures.get(self.current.as_deref()?)
    }

    fn current_proc_mut(&mut self) -> Option<&mut Procedure> {
        let name = self.current.as_deref()?;
        self.procedures.get_mut(name)
    }

    fn is_self_call(&self, node: &Node) -> bool {
        matches!(node, Node::Call { name, .. } if self.current.as_deref() == Some(name.as_str()))
    }

    /// Record the return type a recursive call relies on while the
    /// procedure's own type is still open.
    fn assume_return(&mut self, ty: VBType) -> Result<(), CompileError> {
        let name = self.current.clone().unwrap_or_default();
        let proc = self
            .current_proc_mut()
            .ok_or_else(|| CompileError::internal("recursive call outside a procedure"))?;
        match proc.assumed_return {
            Some(prev) if prev != ty => Err(CompileError::mismatch(
                format!("the recursive call to '{}'", name),
                prev,
                ty,
            )),
            _ => {
                proc.assumed_return = Some(ty);
                proc.return_type.get_or_insert(ty);
                Ok(())
            }
        }
    }

    fn param_index(&self, name: &str) -> Option<usize> {
        self.current_proc()?
            .params
            .iter()
            .position(|p| p.name == name)
    }

    fn param_at(&self, index: usize) -> Result<(Slot, Option<VBType>), CompileError> {
        self.current_proc()
            .and_then(|proc| proc.params.get(index))
            .map(|p| (p.slot, p.ty))
            .ok_or_else(|| CompileError::internal(format!("no parameter #{}", index)))
    }

    fn resolve_param(&mut self, index: usize, ty: VBType) {
        if let Some(param) = self
            .current_proc_mut()
            .and_then(|proc| proc.params.get_mut(index))
        {
            trace!("parameter '{}' is {}", param.name, ty);
            param.ty = Some(ty);
        }
    }

    fn is_visible(&self, name: &str) -> bool {
        self.param_index(name).is_some() || self.scopes.get(name).is_some()
    }

    fn slot_of(&self, name: &str) -> Result<Slot, CompileError> {
        if let Some(index) = self.param_index(name) {
            return self.param_at(index).map(|(slot, _)| slot);
        }
        self.scopes
            .get(name)
            .map(|var| var.slot)
            .ok_or_else(|| CompileError::unknown_variable(name))
    }

    fn result_slot(&mut self) -> Result<Slot, CompileError> {
        let Some(name) = self.current.as_deref() else {
            return Ok(RESULT_SLOT);
        };
        let proc = self
            .procedures
            .get_mut(name)
            .ok_or_else(|| CompileError::internal(format!("procedure '{}' vanished", name)))?;
        if let Some(slot) = proc.result_slot {
            return Ok(slot);
        }
        let slot = self.slots.allocate().ok_or(CompileError::TooManySlots)?;
        proc.result_slot = Some(slot);
        Ok(slot)
    }

    fn scratch_slot(&mut self) -> Result<Slot, CompileError> {
        let slot = self.slots.allocate().ok_or(CompileError::TooManySlots)?;
        self.scopes.add_scratch(slot);
        Ok(slot)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn in_tail(&self) -> bool {
        self.current.is_none()
    }

    fn code(&mut self) -> &mut Segment {
        if self.in_tail() {
            &mut self.tail
        } else {
            &mut self.prologue
        }
    }

    /// Jump target for the next instruction emitted.
    fn here(&self) -> u32 {
        if self.in_tail() {
            self.tail.len() as u32
        } else {
            PROLOGUE_BASE + self.prologue.len() as u32
        }
    }

    fn emit_jump_to(&mut self, op: OpCode, target: u32) {
        let relocated = self.in_tail();
        let code = self.code();
        code.emit_op(op);
        if relocated {
            code.emit_relocated(target);
        } else {
            code.emit_absolute(target);
        }
    }

    fn emit_jump_placeholder(&mut self, op: OpCode) -> usize {
        let relocated = self.in_tail();
        let code = self.code();
        code.emit_op(op);
        code.reserve_address(relocated)
    }

    fn patch_here(&mut self, pos: usize) {
        let target = self.here() as i32;
        self.code().patch_i32(pos, target);
    }

    fn emit_slot(&mut self, op: OpCode, slot: Slot) {
        let code = self.code();
        code.emit_op(op);
        code.emit_u8(slot);
    }

    fn emit_push(&mut self, value: &Value) -> Result<(), CompileError> {
        let code = self.code();
        code.emit_op(OpCode::Push);
        code.emit_value(value).map_err(encode_error)
    }
}

fn check_arity(name: &str, expected: usize, found: usize) -> Result<(), CompileError> {
    if expected == found {
        Ok(())
    } else {
        Err(CompileError::ArityMismatch {
            name: name.to_string(),
            expected,
            found,
        })
    }
}

fn encode_error(err: EncodeError) -> CompileError {
    match err {
        EncodeError::Void => CompileError::internal("void values cannot be inlined"),
        EncodeError::TooLong { .. } => CompileError::TooLarge(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{op::Instruction, scope::SLOT_COUNT};
    use pretty_assertions::assert_eq;

    fn compiler() -> Compiler {
        let mut externs = HashMap::new();
        externs.insert(
            "print".to_string(),
            Signature::new(vec![VBType::String], VBType::Void),
        );
        externs.insert(
            "ask".to_string(),
            Signature::new(vec![VBType::String], VBType::String),
        );
        Compiler::new(externs)
    }

    fn compile(nodes: Vec<Node>) -> Result<Bytecode, CompileError> {
        compiler().compile(&Program::new(nodes))
    }

    fn decode(code: &Bytecode) -> Vec<(usize, Instruction)> {
        code.instructions().map(|r| r.unwrap()).collect()
    }

    fn ops(code: &Bytecode) -> Vec<Instruction> {
        decode(code).into_iter().map(|(_, i)| i).collect()
    }

    /// Instructions of the top-level code only.
    fn tail_ops(code: &Bytecode) -> Vec<Instruction> {
        let entry = code.entry_point().unwrap() as usize;
        decode(code)
            .into_iter()
            .filter(|(at, _)| *at >= entry)
            .map(|(_, i)| i)
            .collect()
    }

    fn offset_of(code: &Bytecode, wanted: &Instruction, nth: usize) -> u32 {
        decode(code)
            .into_iter()
            .filter(|(_, i)| i == wanted)
            .nth(nth)
            .map(|(at, _)| at as u32)
            .unwrap()
    }

    fn print(s: &str) -> Node {
        Node::call("print", vec![Node::string(s)])
    }

    fn proc_def(name: &str, params: Vec<Param>, ret: Option<VBType>, body: Vec<Node>) -> Node {
        Node::ProcDef {
            name: name.to_string(),
            params,
            return_type: ret,
            body,
        }
    }

    fn if_else(condition: Node, then: Vec<Node>, otherwise: Option<Vec<Node>>) -> Node {
        Node::If {
            condition: Box::new(condition),
            then,
            otherwise,
        }
    }

    fn push(n: f64) -> Instruction {
        Instruction::Push(Value::Number(n))
    }

    fn print_op() -> Instruction {
        Instruction::CallExtern("print".to_string())
    }

    // =========================================================================
    // Layout
    // =========================================================================

    #[test]
    fn test_empty_program() {
        let code = compile(vec![]).unwrap();
        assert_eq!(code.as_bytes(), &[0, 5, 0, 0, 0, OpCode::Return.as_byte()]);
    }

    #[test]
    fn test_expression_statement_stores_result() {
        let code = compile(vec![Node::binary(
            Node::number(1.0),
            BinOp::Add,
            Node::number(2.0),
        )])
        .unwrap();

        assert_eq!(
            ops(&code),
            vec![
                Instruction::Jump(5),
                push(1.0),
                push(2.0),
                Instruction::Add,
                Instruction::Store(RESULT_SLOT),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_operators_emit_their_own_opcode() {
        let cases = [
            (BinOp::Mul, Instruction::Mul),
            (BinOp::Div, Instruction::Div),
            (BinOp::Sub, Instruction::Sub),
            (BinOp::GreaterEqual, Instruction::GreaterEqual),
            (BinOp::LessEqual, Instruction::LessEqual),
            (BinOp::Greater, Instruction::Greater),
        ];
        for (op, expected) in cases {
            let code = compile(vec![Node::binary(Node::number(6.0), op, Node::number(3.0))])
                .unwrap();
            assert_eq!(tail_ops(&code)[2], expected);
        }
    }

    #[test]
    fn test_the_result_loads_prior_statement() {
        let code = compile(vec![
            Node::number(5.0),
            Node::binary(Node::TheResult, BinOp::Add, Node::number(1.0)),
        ])
        .unwrap();

        assert_eq!(
            tail_ops(&code),
            vec![
                push(5.0),
                Instruction::Store(0),
                Instruction::Load(0),
                push(1.0),
                Instruction::Add,
                Instruction::Store(0),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_the_result_after_void_statement() {
        let err = compile(vec![print("hi"), Node::TheResult]).unwrap_err();
        assert_eq!(err, CompileError::NoPriorResult);

        let err = compile(vec![Node::TheResult]).unwrap_err();
        assert_eq!(err, CompileError::NoPriorResult);
    }

    #[test]
    fn test_the_result_at_block_start() {
        let err = compile(vec![
            Node::number(1.0),
            if_else(Node::boolean(true), vec![Node::TheResult], None),
        ])
        .unwrap_err();
        assert_eq!(err, CompileError::NoPriorResult);
    }

    // =========================================================================
    // Variables and scopes
    // =========================================================================

    #[test]
    fn test_declaration_and_default() {
        let code = compile(vec![
            Node::declare("x", Some(VBType::Number), Node::number(5.0)),
            Node::VarDecl {
                name: "s".to_string(),
                ty: Some(VBType::String),
                value: None,
            },
        ])
        .unwrap();

        assert_eq!(
            tail_ops(&code),
            vec![
                push(5.0),
                Instruction::Store(1),
                Instruction::Push(Value::from("")),
                Instruction::Store(2),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_declaration_without_type_or_value() {
        let err = compile(vec![Node::VarDecl {
            name: "x".to_string(),
            ty: None,
            value: None,
        }])
        .unwrap_err();
        assert!(matches!(err, CompileError::NotEnoughInformation { .. }));
    }

    #[test]
    fn test_declaration_type_mismatch() {
        let err = compile(vec![Node::declare(
            "x",
            Some(VBType::Number),
            Node::string("five"),
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch {
                expected: VBType::Number,
                found: VBType::String,
                ..
            }
        ));
    }

    #[test]
    fn test_declaring_from_void_call() {
        let err = compile(vec![Node::declare("x", None, print("a"))]).unwrap_err();
        assert!(matches!(err, CompileError::NoValue { .. }));
    }

    #[test]
    fn test_redeclaration() {
        let err = compile(vec![
            Node::declare("x", None, Node::number(1.0)),
            Node::declare("x", None, Node::number(2.0)),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            CompileError::AlreadyDeclared {
                name: "x".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_variable() {
        let err = compile(vec![Node::var("nope")]).unwrap_err();
        assert_eq!(err, CompileError::unknown_variable("nope"));
    }

    #[test]
    fn test_assignment_must_keep_type() {
        let err = compile(vec![
            Node::declare("x", None, Node::number(1.0)),
            Node::assign("x", Node::boolean(true)),
        ])
        .unwrap_err();
        assert!(matches!(err, CompileError::TypeMismatch { .. }));
    }

    #[test]
    fn test_scope_exit_frees_and_reuses_slot() {
        let mut compiler = compiler();
        let code = compiler
            .compile(&Program::new(vec![
                if_else(
                    Node::boolean(true),
                    vec![Node::declare("a", None, Node::number(1.0))],
                    None,
                ),
                Node::declare("b", None, Node::number(2.0)),
            ]))
            .unwrap();

        let tail = tail_ops(&code);
        assert!(tail.contains(&Instruction::Free(1)));
        assert_eq!(compiler.variable("b").unwrap().slot, 1);
        assert!(compiler.variable("a").is_none());
    }

    #[test]
    fn test_inner_variable_invisible_after_block() {
        let err = compile(vec![
            if_else(
                Node::boolean(true),
                vec![Node::declare("a", None, Node::number(1.0))],
                None,
            ),
            Node::var("a"),
        ])
        .unwrap_err();
        assert_eq!(err, CompileError::unknown_variable("a"));
    }

    #[test]
    fn test_slot_exhaustion() {
        // slot 0 is the result, leaving SLOT_COUNT - 1 for variables
        let decls: Vec<Node> = (0..SLOT_COUNT)
            .map(|i| Node::declare(format!("v{}", i), None, Node::number(0.0)))
            .collect();
        let err = compile(decls).unwrap_err();
        assert_eq!(err, CompileError::TooManySlots);

        let decls: Vec<Node> = (0..SLOT_COUNT - 1)
            .map(|i| Node::declare(format!("v{}", i), None, Node::number(0.0)))
            .collect();
        assert!(compile(decls).is_ok());
    }

    #[test]
    fn test_declaration_claims_slot_before_initializer() {
        // with no slot left the initializer is never looked at
        let mut decls: Vec<Node> = (0..SLOT_COUNT - 1)
            .map(|i| Node::declare(format!("v{}", i), None, Node::number(0.0)))
            .collect();
        decls.push(Node::declare("last", None, Node::var("missing")));
        let err = compile(decls).unwrap_err();
        assert_eq!(err, CompileError::TooManySlots);

        let code = compile(vec![proc_def(
            "f",
            vec![],
            None,
            vec![
                Node::number(1.0),
                Node::declare(
                    "y",
                    None,
                    Node::binary(Node::TheResult, BinOp::Add, Node::number(1.0)),
                ),
            ],
        )])
        .unwrap();
        let all = ops(&code);
        assert!(all.contains(&Instruction::Load(1)));
        assert!(all.contains(&Instruction::Store(2)));
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    #[test]
    fn test_if_else_layout() {
        let code = compile(vec![if_else(
            Node::boolean(true),
            vec![print("a")],
            Some(vec![print("b")]),
        )])
        .unwrap();

        let else_start = offset_of(&code, &Instruction::Push(Value::from("b")), 0);
        let end = offset_of(&code, &Instruction::Return, 0);

        assert_eq!(
            tail_ops(&code),
            vec![
                Instruction::Push(Value::Boolean(true)),
                Instruction::Invert,
                Instruction::JumpIf(else_start),
                Instruction::Push(Value::from("a")),
                print_op(),
                Instruction::Jump(end),
                Instruction::Push(Value::from("b")),
                print_op(),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_if_without_else_skips_to_end() {
        let code = compile(vec![if_else(Node::boolean(false), vec![print("a")], None)]).unwrap();
        let end = offset_of(&code, &Instruction::Return, 0);
        assert_eq!(tail_ops(&code)[2], Instruction::JumpIf(end));
    }

    #[test]
    fn test_if_condition_must_be_boolean() {
        let err = compile(vec![if_else(Node::number(1.0), vec![], None)]).unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch {
                expected: VBType::Boolean,
                ..
            }
        ));
    }

    #[test]
    fn test_while_jumps_back_to_condition() {
        let code = compile(vec![Node::While {
            condition: Box::new(Node::boolean(false)),
            body: vec![print("x")],
        }])
        .unwrap();

        let head = code.entry_point().unwrap();
        let end = offset_of(&code, &Instruction::Return, 0);
        assert_eq!(
            tail_ops(&code),
            vec![
                Instruction::Push(Value::Boolean(false)),
                Instruction::Invert,
                Instruction::JumpIf(end),
                Instruction::Push(Value::from("x")),
                print_op(),
                Instruction::Jump(head),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_repeat_layout() {
        let code = compile(vec![Node::Repeat {
            times: Box::new(Node::number(3.0)),
            body: vec![print("hi")],
        }])
        .unwrap();

        let top = offset_of(&code, &Instruction::Push(Value::from("hi")), 0);
        let skip = offset_of(&code, &Instruction::Pop, 0);
        let end = offset_of(&code, &Instruction::Free(1), 0);

        assert_eq!(
            tail_ops(&code),
            vec![
                push(3.0),
                Instruction::Dup,
                push(0.0),
                Instruction::LessEqual,
                Instruction::JumpIf(skip),
                Instruction::Store(1),
                push(0.0),
                Instruction::Store(2),
                Instruction::Push(Value::from("hi")),
                print_op(),
                Instruction::Load(2),
                push(1.0),
                Instruction::Add,
                Instruction::Dup,
                Instruction::Store(2),
                Instruction::Load(1),
                Instruction::Less,
                Instruction::JumpIf(top),
                Instruction::Jump(end),
                Instruction::Pop,
                Instruction::Free(1),
                Instruction::Free(2),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_and_short_circuits() {
        let code = compile(vec![Node::binary(
            Node::boolean(true),
            BinOp::And,
            Node::boolean(false),
        )])
        .unwrap();

        let falsy = offset_of(&code, &Instruction::Push(Value::Boolean(false)), 1);
        let end = offset_of(&code, &Instruction::Store(0), 0);
        assert_eq!(
            tail_ops(&code),
            vec![
                Instruction::Push(Value::Boolean(true)),
                Instruction::Invert,
                Instruction::JumpIf(falsy),
                Instruction::Push(Value::Boolean(false)),
                Instruction::Jump(end),
                Instruction::Push(Value::Boolean(false)),
                Instruction::Store(0),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_or_short_circuits() {
        let code = compile(vec![Node::binary(
            Node::boolean(false),
            BinOp::Or,
            Node::boolean(false),
        )])
        .unwrap();

        let tail = tail_ops(&code);
        assert!(!tail.contains(&Instruction::Invert));
        assert_eq!(tail[4], Instruction::Push(Value::Boolean(true)));
    }

    // =========================================================================
    // Procedures
    // =========================================================================

    fn double() -> Node {
        proc_def(
            "double",
            vec![Param::typed("n", VBType::Number)],
            Some(VBType::Number),
            vec![Node::ret(Some(Node::binary(
                Node::var("n"),
                BinOp::Mul,
                Node::number(2.0),
            )))],
        )
    }

    #[test]
    fn test_procedure_layout() {
        let code = compile(vec![double(), Node::call("double", vec![Node::number(4.0)])]).unwrap();

        let entry = code.entry_point().unwrap();
        assert_eq!(
            ops(&code),
            vec![
                Instruction::Jump(entry),
                Instruction::Store(1),
                Instruction::Load(1),
                push(2.0),
                Instruction::Mul,
                Instruction::Return,
                push(4.0),
                Instruction::Call(5),
                Instruction::Store(0),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_parameters_stored_in_reverse() {
        let code = compile(vec![proc_def(
            "pair",
            vec![
                Param::typed("a", VBType::Number),
                Param::typed("b", VBType::Number),
            ],
            None,
            vec![],
        )])
        .unwrap();

        assert_eq!(
            ops(&code)[1..4],
            [
                Instruction::Store(2),
                Instruction::Store(1),
                Instruction::Return
            ]
        );
    }

    #[test]
    fn test_procedure_after_top_level_code() {
        let code = compile(vec![
            Node::While {
                condition: Box::new(Node::boolean(false)),
                body: vec![],
            },
            double(),
            Node::call("double", vec![Node::number(1.0)]),
        ])
        .unwrap();

        // the loop lives in the tail, after the procedure body
        let head = code.entry_point().unwrap();
        assert!(head > 5);
        assert!(tail_ops(&code).contains(&Instruction::Jump(head)));
        assert!(tail_ops(&code).contains(&Instruction::Call(5)));
    }

    #[test]
    fn test_infers_parameter_from_use() {
        let mut compiler = compiler();
        compiler
            .compile(&Program::new(vec![proc_def(
                "greet",
                vec![Param::untyped("name")],
                None,
                vec![Node::call("print", vec![Node::var("name")])],
            )]))
            .unwrap();

        assert_eq!(
            compiler.procedure("greet"),
            Some(Signature::new(vec![VBType::String], VBType::Void))
        );

        let err = compiler
            .compile(&Program::new(vec![Node::call(
                "greet",
                vec![Node::number(5.0)],
            )]))
            .unwrap_err();
        assert!(matches!(err, CompileError::TypeMismatch { .. }));
    }

    #[test]
    fn test_infers_number_from_arithmetic() {
        let mut compiler = compiler();
        compiler
            .compile(&Program::new(vec![proc_def(
                "half",
                vec![Param::untyped("x")],
                None,
                vec![Node::ret(Some(Node::binary(
                    Node::var("x"),
                    BinOp::Div,
                    Node::number(2.0),
                )))],
            )]))
            .unwrap();
        assert_eq!(
            compiler.procedure("half"),
            Some(Signature::new(vec![VBType::Number], VBType::Number))
        );
    }

    #[test]
    fn test_parameter_used_as_number_and_boolean() {
        let err = compile(vec![proc_def(
            "muddled",
            vec![Param::untyped("x")],
            None,
            vec![
                Node::binary(Node::var("x"), BinOp::Add, Node::number(1.0)),
                Node::unary(UnaryOp::Invert, Node::var("x")),
            ],
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch {
                expected: VBType::Boolean,
                found: VBType::Number,
                ..
            }
        ));
    }

    #[test]
    fn test_infers_through_equality() {
        let mut compiler = compiler();
        compiler
            .compile(&Program::new(vec![proc_def(
                "is zero",
                vec![Param::untyped("x")],
                None,
                vec![Node::ret(Some(Node::binary(
                    Node::var("x"),
                    BinOp::Equal,
                    Node::number(0.0),
                )))],
            )]))
            .unwrap();

        assert_eq!(
            compiler.procedure("is zero"),
            Some(Signature::new(vec![VBType::Number], VBType::Boolean))
        );
    }

    #[test]
    fn test_equality_between_unknowns() {
        let err = compile(vec![proc_def(
            "same",
            vec![Param::untyped("a"), Param::untyped("b")],
            None,
            vec![Node::ret(Some(Node::binary(
                Node::var("a"),
                BinOp::Equal,
                Node::var("b"),
            )))],
        )])
        .unwrap_err();
        assert!(matches!(err, CompileError::NotEnoughInformation { .. }));
    }

    #[test]
    fn test_unresolved_parameter() {
        let err = compile(vec![proc_def(
            "f",
            vec![Param::untyped("x")],
            None,
            vec![print("hi")],
        )])
        .unwrap_err();
        assert_eq!(
            err,
            CompileError::UnresolvedParameter {
                procedure: "f".to_string(),
                param: "x".to_string()
            }
        );
    }

    #[test]
    fn test_arity() {
        let err = compile(vec![double(), Node::call("double", vec![])]).unwrap_err();
        assert!(matches!(
            err,
            CompileError::ArityMismatch {
                expected: 1,
                found: 0,
                ..
            }
        ));

        let err = compile(vec![Node::call("print", vec![])]).unwrap_err();
        assert!(matches!(err, CompileError::ArityMismatch { .. }));
    }

    #[test]
    fn test_unknown_procedure() {
        let err = compile(vec![Node::call("fly", vec![])]).unwrap_err();
        assert_eq!(err, CompileError::unknown_procedure("fly"));
    }

    #[test]
    fn test_redefinition() {
        let err = compile(vec![double(), double()]).unwrap_err();
        assert!(matches!(err, CompileError::Redefinition { .. }));

        let err = compile(vec![proc_def("print", vec![], None, vec![])]).unwrap_err();
        assert!(matches!(err, CompileError::Redefinition { .. }));
    }

    #[test]
    fn test_procedure_inside_block() {
        let err = compile(vec![if_else(
            Node::boolean(true),
            vec![proc_def("f", vec![], None, vec![])],
            None,
        )])
        .unwrap_err();
        assert_eq!(err, CompileError::proc_in_block());

        let err = compile(vec![proc_def(
            "outer",
            vec![],
            None,
            vec![proc_def("inner", vec![], None, vec![])],
        )])
        .unwrap_err();
        assert_eq!(err, CompileError::proc_in_block());
    }

    #[test]
    fn test_return_outside_procedure() {
        let err = compile(vec![Node::ret(None)]).unwrap_err();
        assert_eq!(err, CompileError::return_outside_proc());
    }

    #[test]
    fn test_missing_return() {
        let err = compile(vec![proc_def(
            "maybe",
            vec![Param::typed("c", VBType::Boolean)],
            Some(VBType::Number),
            vec![if_else(
                Node::var("c"),
                vec![Node::ret(Some(Node::number(1.0)))],
                None,
            )],
        )])
        .unwrap_err();
        assert!(matches!(err, CompileError::MissingReturn { .. }));

        let ok = compile(vec![proc_def(
            "surely",
            vec![Param::typed("c", VBType::Boolean)],
            Some(VBType::Number),
            vec![if_else(
                Node::var("c"),
                vec![Node::ret(Some(Node::number(1.0)))],
                Some(vec![Node::ret(Some(Node::number(2.0)))]),
            )],
        )]);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_last_return_decides_type() {
        let mut compiler = compiler();
        compiler
            .compile(&Program::new(vec![proc_def(
                "confused",
                vec![Param::typed("c", VBType::Boolean)],
                None,
                vec![if_else(
                    Node::var("c"),
                    vec![Node::ret(Some(Node::number(1.0)))],
                    Some(vec![Node::ret(Some(Node::string("one")))]),
                )],
            )]))
            .unwrap();
        assert_eq!(
            compiler.procedure("confused"),
            Some(Signature::new(vec![VBType::Boolean], VBType::String))
        );
    }

    #[test]
    fn test_declared_return_type_is_binding() {
        let err = compile(vec![proc_def(
            "count",
            vec![],
            Some(VBType::Number),
            vec![Node::ret(Some(Node::string("three")))],
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch {
                expected: VBType::Number,
                found: VBType::String,
                ..
            }
        ));
    }

    #[test]
    fn test_recursive_return_type_from_context() {
        // how to "fact" given n, a number:
        //   if n <= 1: return 1 else: return n * fact(n - 1)
        let body = vec![if_else(
            Node::binary(Node::var("n"), BinOp::LessEqual, Node::number(1.0)),
            vec![Node::ret(Some(Node::number(1.0)))],
            Some(vec![Node::ret(Some(Node::binary(
                Node::var("n"),
                BinOp::Mul,
                Node::call(
                    "fact",
                    vec![Node::binary(Node::var("n"), BinOp::Sub, Node::number(1.0))],
                ),
            )))]),
        )];

        let mut compiler = compiler();
        compiler
            .compile(&Program::new(vec![proc_def(
                "fact",
                vec![Param::typed("n", VBType::Number)],
                None,
                body,
            )]))
            .unwrap();
        assert_eq!(
            compiler.procedure("fact"),
            Some(Signature::new(vec![VBType::Number], VBType::Number))
        );
    }

    #[test]
    fn test_recursive_statement_call_is_void() {
        // how to "countdown" given n: if n > 0: print n as string. countdown n - 1
        let mut compiler = compiler();
        compiler
            .compile(&Program::new(vec![proc_def(
                "countdown",
                vec![Param::untyped("n")],
                None,
                vec![if_else(
                    Node::binary(Node::var("n"), BinOp::Greater, Node::number(0.0)),
                    vec![
                        Node::call(
                            "print",
                            vec![Node::convert(Node::var("n"), VBType::String)],
                        ),
                        Node::call(
                            "countdown",
                            vec![Node::binary(Node::var("n"), BinOp::Sub, Node::number(1.0))],
                        ),
                    ],
                    None,
                )],
            )]))
            .unwrap();
        assert_eq!(
            compiler.procedure("countdown"),
            Some(Signature::new(vec![VBType::Number], VBType::Void))
        );
    }

    #[test]
    fn test_recursive_statement_call_conflicts_with_value_return() {
        let err = compile(vec![proc_def(
            "again",
            vec![Param::typed("n", VBType::Number)],
            None,
            vec![
                Node::call("again", vec![Node::var("n")]),
                Node::ret(Some(Node::var("n"))),
            ],
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch {
                expected: VBType::Void,
                found: VBType::Number,
                ..
            }
        ));
    }

    #[test]
    fn test_procedure_statements_use_own_result_slot() {
        let code = compile(vec![proc_def(
            "f",
            vec![],
            None,
            vec![
                Node::number(1.0),
                Node::binary(Node::TheResult, BinOp::Add, Node::number(1.0)),
            ],
        )])
        .unwrap();

        let all = ops(&code);
        assert!(all.contains(&Instruction::Store(1)));
        assert!(all.contains(&Instruction::Load(1)));
        assert!(!all.contains(&Instruction::Store(0)));
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    #[test]
    fn test_session_keeps_procedures_and_variables() {
        let mut compiler = compiler();
        let first = compiler
            .compile(&Program::new(vec![
                double(),
                Node::declare("x", None, Node::number(3.0)),
            ]))
            .unwrap();
        let second = compiler
            .compile(&Program::new(vec![Node::call(
                "double",
                vec![Node::var("x")],
            )]))
            .unwrap();

        let prologue = PROLOGUE_BASE as usize + compiler.prologue_len();
        assert_eq!(first.as_bytes()[1..prologue], second.as_bytes()[1..prologue]);
        assert_eq!(
            tail_ops(&second),
            vec![
                Instruction::Load(2),
                Instruction::Call(5),
                Instruction::Store(0),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_failed_compile_restores_session() {
        let mut compiler = compiler();
        compiler
            .compile(&Program::new(vec![Node::declare(
                "x",
                None,
                Node::number(1.0),
            )]))
            .unwrap();
        let prologue = compiler.prologue_len();

        let err = compiler
            .compile(&Program::new(vec![
                Node::declare("y", None, Node::number(2.0)),
                double(),
                Node::var("nope"),
            ]))
            .unwrap_err();
        assert_eq!(err, CompileError::unknown_variable("nope"));

        assert!(compiler.variable("y").is_none());
        assert!(compiler.procedure("double").is_none());
        assert_eq!(compiler.prologue_len(), prologue);

        // and the session is still usable
        let code = compiler
            .compile(&Program::new(vec![Node::declare(
                "y",
                None,
                Node::var("x"),
            )]))
            .unwrap();
        assert_eq!(
            tail_ops(&code),
            vec![
                Instruction::Load(1),
                Instruction::Store(2),
                Instruction::Return
            ]
        );
    }

    #[test]
    fn test_the_result_carries_across_compiles() {
        let mut compiler = compiler();
        compiler
            .compile(&Program::new(vec![Node::number(2.0)]))
            .unwrap();
        let code = compiler
            .compile(&Program::new(vec![Node::TheResult]))
            .unwrap();
        assert_eq!(tail_ops(&code)[0], Instruction::Load(0));
    }

    // =========================================================================
    // Lists and conversions
    // =========================================================================

    #[test]
    fn test_constant_list_is_inlined() {
        let code = compile(vec![Node::List(vec![Node::number(1.0), Node::string("a")])]).unwrap();
        assert_eq!(
            tail_ops(&code)[0],
            Instruction::Push(Value::List(vec![Value::Number(1.0), Value::from("a")]))
        );
    }

    #[test]
    fn test_dynamic_list_is_built() {
        let code = compile(vec![
            Node::declare("x", None, Node::number(1.0)),
            Node::List(vec![Node::var("x"), Node::number(2.0)]),
        ])
        .unwrap();
        assert_eq!(
            tail_ops(&code)[2..5],
            [Instruction::Load(1), push(2.0), Instruction::MakeList(2)]
        );
    }

    #[test]
    fn test_list_get_needs_context() {
        let xs = Node::declare("xs", None, Node::List(vec![Node::number(1.0)]));
        let item = Node::ListGet {
            index: Box::new(Node::number(1.0)),
            list: Box::new(Node::var("xs")),
        };

        let err = compile(vec![xs.clone(), item.clone()]).unwrap_err();
        assert!(matches!(err, CompileError::NotEnoughInformation { .. }));

        let code = compile(vec![xs, Node::declare("n", Some(VBType::Number), item)]).unwrap();
        assert!(tail_ops(&code).contains(&Instruction::GetItem(VBType::Number)));
    }

    #[test]
    fn test_list_set_writes_back() {
        let code = compile(vec![
            Node::declare("xs", None, Node::List(vec![Node::number(1.0)])),
            Node::ListSet {
                index: Box::new(Node::number(1.0)),
                list: Box::new(Node::var("xs")),
                value: Box::new(Node::number(9.0)),
            },
        ])
        .unwrap();

        assert_eq!(
            tail_ops(&code)[2..7],
            [
                Instruction::Load(1),
                push(1.0),
                push(9.0),
                Instruction::SetItem,
                Instruction::Store(1),
            ]
        );
    }

    #[test]
    fn test_list_set_needs_list_variable() {
        let err = compile(vec![
            Node::declare("n", None, Node::number(1.0)),
            Node::ListSet {
                index: Box::new(Node::number(1.0)),
                list: Box::new(Node::var("n")),
                value: Box::new(Node::number(9.0)),
            },
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch {
                expected: VBType::List,
                ..
            }
        ));

        let err = compile(vec![Node::ListSet {
            index: Box::new(Node::number(1.0)),
            list: Box::new(Node::List(vec![])),
            value: Box::new(Node::number(9.0)),
        }])
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidPosition { .. }));
    }

    #[test]
    fn test_conversions() {
        let code = compile(vec![Node::convert(Node::number(1.0), VBType::String)]).unwrap();
        assert_eq!(tail_ops(&code)[1], Instruction::Convert(VBType::String));

        let err = compile(vec![Node::convert(Node::number(1.0), VBType::List)]).unwrap_err();
        assert_eq!(
            err,
            CompileError::InvalidConversion {
                from: VBType::Number,
                to: VBType::List
            }
        );
    }

    #[test]
    fn test_extern_call_encodes_name() {
        let code = compile(vec![Node::declare(
            "answer",
            None,
            Node::call("ask", vec![Node::string("name?")]),
        )])
        .unwrap();
        assert_eq!(
            tail_ops(&code),
            vec![
                Instruction::Push(Value::from("name?")),
                Instruction::CallExtern("ask".to_string()),
                Instruction::Store(1),
                Instruction::Return,
            ]
        );
    }
}
