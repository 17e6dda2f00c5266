//! The compiler back end: lowers a typed AST to assembly text for the
//! loader. Register allocation is fused into code generation: named
//! variables take registers from the bottom of the free list (R5 upward),
//! expression temporaries from the top (R31 downward), and when the file
//! runs dry the oldest register-resident variable is rebound to RAM.
//!
//! Calling convention:
//! - arguments in R4, R5, R6, …, return value in R0, return address in R2;
//! - every function body ends by jumping to the shared `caller_return`
//!   label, which jumps through R2;
//! - call sites save their live registers to the R3 stack, since callees
//!   allocate from the same register file;
//! - functions that make calls preserve their incoming R2, either in a spare
//!   register when the function is non-recursive, on the stack otherwise.
//!
//! The generator is pure: the same AST always produces byte-identical text.

use crate::ast::{BinOp, Expr, Function, LValue, Program, Stmt, Type, UnOp};
use crate::error::CompileError;
use crate::symbols::{Binding, FunctionSig, Storage, SymbolTable, STACK_BASE};
use std::collections::HashSet;

/// Lower a whole program to assembly text.
pub fn compile(program: &Program) -> Result<String, CompileError> {
    let mut generator = Generator::new();
    generator.run(program)?;
    Ok(generator.finish())
}

/// A value produced by expression lowering.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    /// Folded to a constant at compile time.
    Imm(u16),
    /// Lives in a scratch register owned by this expression.
    Temp(u8),
    /// Lives in a variable's register; read-only from here.
    Bound(u8),
}

impl Value {
    fn as_asm(&self) -> String {
        match *self {
            Value::Imm(v) => format!("i:{}", v),
            Value::Temp(r) | Value::Bound(r) => format!("{}", r),
        }
    }
}

struct Generator {
    lines: Vec<String>,
    symbols: SymbolTable,
    /// Free registers R5..=R31, kept sorted.
    free: Vec<u8>,
    /// Registers currently holding expression temporaries.
    temps: Vec<u8>,
    /// Variable registers with a live `Value::Bound` in flight; these must
    /// not be chosen as spill victims mid-expression.
    pinned: Vec<u8>,
    /// Monotone label suffix.
    label_counter: u32,
    /// Compile-time view of the last selector word written by the helpers.
    selector_shadow: u32,
    break_targets: Vec<String>,
    continue_targets: Vec<String>,
    ret: Type,
    epilogue: String,
    /// Register holding the current function's saved return address, if the
    /// function parks it in a register rather than on the stack.
    link_reserve: Option<u8>,
    /// RAM word KEYIN lands in for `readKey()`.
    keyin_scratch: Option<u16>,
}

impl Generator {
    fn new() -> Self {
        Generator {
            lines: Vec::new(),
            symbols: SymbolTable::new(),
            free: (5..32).collect(),
            temps: Vec::new(),
            pinned: Vec::new(),
            label_counter: 0,
            selector_shadow: 0,
            break_targets: Vec::new(),
            continue_targets: Vec::new(),
            ret: Type::Void,
            epilogue: String::new(),
            link_reserve: None,
            keyin_scratch: None,
        }
    }

    fn run(&mut self, program: &Program) -> Result<(), CompileError> {
        for function in &program.functions {
            if function.params.len() > 27 {
                return Err(CompileError::TooManyParams(function.name.clone()));
            }
            self.symbols.define_function(FunctionSig {
                name: function.name.clone(),
                params: function.params.iter().map(|(_, t)| t.clone()).collect(),
                ret: function.ret.clone(),
                label: function.name.clone(),
                recursive: false,
            })?;
        }
        if self.symbols.function("main").is_none() {
            return Err(CompileError::NoMain);
        }
        mark_recursion(program, &mut self.symbols);

        self.emit(format!("MVR i:0x{:x}, 3", STACK_BASE));
        self.emit("JAL main");
        self.emit("HALT");
        for function in &program.functions {
            self.emit_function(function)?;
        }
        self.emit_label("caller_return");
        self.emit("JMP 2");
        log::debug!(
            "compiled {} functions into {} lines",
            program.functions.len(),
            self.lines.len()
        );
        Ok(())
    }

    fn finish(self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }

    // ── Emission and bookkeeping ──────────────────────────────────────────

    fn emit(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn emit_label(&mut self, name: impl Into<String>) {
        self.lines.push(format!("{}:", name.into()));
    }

    fn fresh(&mut self) -> u32 {
        let n = self.label_counter;
        self.label_counter += 1;
        n
    }

    /// Register for a named variable, lowest first.
    fn alloc_var(&mut self) -> Option<u8> {
        if self.free.is_empty() {
            None
        } else {
            Some(self.free.remove(0))
        }
    }

    /// Register for an expression temporary, highest first. Spills a
    /// variable to RAM if the file is exhausted.
    fn alloc_temp(&mut self) -> Result<u8, CompileError> {
        let reg = match self.free.pop() {
            Some(reg) => reg,
            None => self.spill_variable()?,
        };
        self.temps.push(reg);
        Ok(reg)
    }

    fn release(&mut self, reg: u8) {
        let at = self.free.binary_search(&reg).unwrap_or_else(|at| at);
        self.free.insert(at, reg);
    }

    fn free_value(&mut self, value: &Value) {
        match *value {
            Value::Imm(_) => {}
            Value::Temp(reg) => {
                self.temps.retain(|&r| r != reg);
                self.release(reg);
            }
            Value::Bound(reg) => {
                if let Some(at) = self.pinned.iter().rposition(|&r| r == reg) {
                    self.pinned.remove(at);
                }
            }
        }
    }

    /// Rebind the oldest unpinned register-resident variable to RAM and hand
    /// its register out.
    fn spill_variable(&mut self) -> Result<u8, CompileError> {
        let victim = self
            .symbols
            .register_bindings()
            .into_iter()
            .find(|(name, reg)| {
                // Skip pinned registers and names whose innermost binding is
                // a shadow living somewhere else.
                !self.pinned.contains(reg)
                    && matches!(
                        self.symbols.lookup(name),
                        Some(b) if b.storage == Storage::Reg(*reg)
                    )
            });
        let (name, reg) = victim.ok_or(CompileError::OutOfRegisters)?;
        let address = self.symbols.alloc_static(1);
        self.emit(format!("LOAD {}, i:0x{:x}", reg, address));
        self.symbols
            .lookup_mut(&name)
            .expect("spill victim vanished")
            .storage = Storage::Ram(address);
        Ok(reg)
    }

    // ── Functions ─────────────────────────────────────────────────────────

    fn emit_function(&mut self, function: &Function) -> Result<(), CompileError> {
        let sig = self
            .symbols
            .function(&function.name)
            .expect("function signature registered")
            .clone();
        self.ret = function.ret.clone();
        self.epilogue = format!("ret_{}", function.name);
        self.symbols.push_scope();

        self.emit_label(sig.label.as_str());
        for (i, (name, ty)) in function.params.iter().enumerate() {
            let reg = 4 + i as u8;
            self.free.retain(|&r| r != reg);
            if !ty.is_scalar() {
                return Err(CompileError::BadTypes(format!(
                    "parameter `{}` of `{}` must be scalar",
                    name, function.name
                )));
            }
            self.symbols.declare(Binding {
                name: name.clone(),
                ty: ty.clone(),
                storage: Storage::Reg(reg),
                writable: true,
            })?;
        }

        let makes_calls = calls_functions(&function.body, &self.symbols);
        let mut link_save = None;
        if makes_calls {
            if sig.recursive {
                self.push_reg(2);
            } else if let Some(reg) = self.alloc_var() {
                self.emit(format!("MVR 2, {}", reg));
                link_save = Some(reg);
            } else {
                // File full of parameters; fall back to the stack.
                self.push_reg(2);
            }
        }
        let stacked_link = makes_calls && link_save.is_none();
        self.link_reserve = link_save;

        for stmt in &function.body {
            self.emit_stmt(stmt)?;
        }

        let epilogue = self.epilogue.clone();
        self.emit_label(epilogue);
        if stacked_link {
            // R1 is scratch; park the return value there while the popped
            // address flows through R0.
            self.emit("MVR 0, 1");
            self.pop_reg(2);
            self.emit("MVR 1, 0");
        } else if let Some(reg) = link_save {
            self.emit(format!("MVR {}, 2", reg));
        }
        self.emit("JMP caller_return");

        for binding in self.symbols.pop_scope() {
            if let Storage::Reg(reg) = binding.storage {
                self.release(reg);
            }
        }
        if let Some(reg) = link_save {
            self.release(reg);
        }
        self.link_reserve = None;
        Ok(())
    }

    fn push_reg(&mut self, reg: u8) {
        self.emit(format!("LOAD {}, 3", reg));
        self.emit("SUB 3, i:1");
        self.emit("MVR 0, 3");
    }

    fn pop_reg(&mut self, reg: u8) {
        self.emit("ADD 3, i:1");
        self.emit("MVR 0, 3");
        self.emit(format!("READ 3, {}", reg));
    }

    // ── Statements ────────────────────────────────────────────────────────

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Declare { name, ty, init } => self.emit_declare(name, ty, init.as_ref()),
            Stmt::Assign { target, value } => self.emit_assign(target, value),
            Stmt::Expr(expr) => {
                let (value, _) = self.eval(expr, true)?;
                self.free_value(&value);
                Ok(())
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => self.emit_if(cond, then_body, else_body),
            Stmt::While { cond, body } => self.emit_while(cond, body),
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => self.emit_for(init.as_deref(), cond.as_ref(), step.as_deref(), body),
            Stmt::Switch {
                selector,
                cases,
                default,
            } => self.emit_switch(selector, cases, default.as_ref()),
            Stmt::Break => match self.break_targets.last() {
                Some(target) => {
                    let target = target.clone();
                    self.emit(format!("JMP {}", target));
                    Ok(())
                }
                None => Err(CompileError::StrayBreak),
            },
            Stmt::Continue => match self.continue_targets.last() {
                Some(target) => {
                    let target = target.clone();
                    self.emit(format!("JMP {}", target));
                    Ok(())
                }
                None => Err(CompileError::StrayContinue),
            },
            Stmt::Return(expr) => self.emit_return(expr.as_ref()),
        }
    }

    fn emit_declare(
        &mut self,
        name: &str,
        ty: &Type,
        init: Option<&Expr>,
    ) -> Result<(), CompileError> {
        if let Type::Array(_, _) = ty {
            if init.is_some() {
                return Err(CompileError::BadTypes(format!(
                    "array `{}` cannot take an initializer",
                    name
                )));
            }
            let address = self.symbols.alloc_static(ty.word_size());
            return self.symbols.declare(Binding {
                name: name.to_string(),
                ty: ty.clone(),
                storage: Storage::Ram(address),
                writable: false,
            });
        }
        if !ty.is_scalar() {
            return Err(CompileError::BadTypes(format!(
                "cannot declare `{}` of type {}",
                name, ty
            )));
        }
        let storage = match self.alloc_var() {
            Some(reg) => Storage::Reg(reg),
            None => Storage::Ram(self.symbols.alloc_static(1)),
        };
        if let Some(init) = init {
            let (value, vty) = self.eval(init, false)?;
            self.require_scalar(&vty)?;
            match storage {
                Storage::Reg(reg) => self.emit(format!("MVR {}, {}", value.as_asm(), reg)),
                Storage::Ram(address) => {
                    self.emit(format!("LOAD {}, i:0x{:x}", value.as_asm(), address))
                }
            }
            self.free_value(&value);
        }
        self.symbols.declare(Binding {
            name: name.to_string(),
            ty: ty.clone(),
            storage,
            writable: true,
        })
    }

    fn emit_assign(&mut self, target: &LValue, value: &Expr) -> Result<(), CompileError> {
        match target {
            LValue::Var(name) => {
                let binding = self
                    .symbols
                    .lookup(name)
                    .ok_or_else(|| CompileError::UnknownName(name.clone()))?;
                if !binding.writable {
                    return Err(CompileError::NotAssignable(name.clone()));
                }
                let storage = binding.storage;
                let (v, vty) = self.eval(value, false)?;
                self.require_scalar(&vty)?;
                match storage {
                    Storage::Reg(reg) => self.emit(format!("MVR {}, {}", v.as_asm(), reg)),
                    Storage::Ram(address) => {
                        self.emit(format!("LOAD {}, i:0x{:x}", v.as_asm(), address))
                    }
                }
                self.free_value(&v);
            }
            LValue::Deref(pointer) => {
                let (addr, pty) = self.eval(pointer, false)?;
                if !matches!(pty, Type::Ptr(_)) {
                    return Err(CompileError::BadTypes(format!(
                        "cannot store through a value of type {}",
                        pty
                    )));
                }
                let (v, vty) = self.eval(value, false)?;
                self.require_scalar(&vty)?;
                self.emit(format!("LOAD {}, {}", v.as_asm(), addr.as_asm()));
                self.free_value(&v);
                self.free_value(&addr);
            }
            LValue::Index { base, index } => {
                let addr = self.element_address(base, index)?;
                let (v, vty) = self.eval(value, false)?;
                self.require_scalar(&vty)?;
                self.emit(format!("LOAD {}, {}", v.as_asm(), addr.as_asm()));
                self.free_value(&v);
                self.free_value(&addr);
            }
        }
        Ok(())
    }

    fn emit_if(
        &mut self,
        cond: &Expr,
        then_body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<(), CompileError> {
        let n = self.fresh();
        let (else_label, end_label) = (format!("else_{}", n), format!("endif_{}", n));
        let (cond_value, cty) = self.eval(cond, false)?;
        self.require_scalar(&cty)?;
        let miss = if else_body.is_empty() {
            end_label.clone()
        } else {
            else_label.clone()
        };
        self.emit(format!("JZ {}, {}", miss, cond_value.as_asm()));
        self.free_value(&cond_value);
        self.scoped(|g| then_body.iter().try_for_each(|s| g.emit_stmt(s)))?;
        if !else_body.is_empty() {
            self.emit(format!("JMP {}", end_label));
            self.emit_label(else_label);
            self.scoped(|g| else_body.iter().try_for_each(|s| g.emit_stmt(s)))?;
        }
        self.emit_label(end_label);
        Ok(())
    }

    fn emit_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<(), CompileError> {
        let n = self.fresh();
        let (top, end) = (format!("while_{}", n), format!("endwhile_{}", n));
        self.emit_label(top.as_str());
        let (cond_value, cty) = self.eval(cond, false)?;
        self.require_scalar(&cty)?;
        self.emit(format!("JZ {}, {}", end, cond_value.as_asm()));
        self.free_value(&cond_value);
        self.break_targets.push(end.clone());
        self.continue_targets.push(top.clone());
        let result = self.scoped(|g| body.iter().try_for_each(|s| g.emit_stmt(s)));
        self.break_targets.pop();
        self.continue_targets.pop();
        result?;
        self.emit(format!("JMP {}", top));
        self.emit_label(end);
        Ok(())
    }

    fn emit_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let n = self.fresh();
        let top = format!("for_{}", n);
        let step_label = format!("forstep_{}", n);
        let end = format!("endfor_{}", n);
        self.symbols.push_scope();
        if let Some(init) = init {
            self.emit_stmt(init)?;
        }
        self.emit_label(top.as_str());
        if let Some(cond) = cond {
            let (cond_value, cty) = self.eval(cond, false)?;
            self.require_scalar(&cty)?;
            self.emit(format!("JZ {}, {}", end, cond_value.as_asm()));
            self.free_value(&cond_value);
        }
        self.break_targets.push(end.clone());
        self.continue_targets.push(step_label.clone());
        let result = self.scoped(|g| body.iter().try_for_each(|s| g.emit_stmt(s)));
        self.break_targets.pop();
        self.continue_targets.pop();
        result?;
        self.emit_label(step_label);
        if let Some(step) = step {
            self.emit_stmt(step)?;
        }
        self.emit(format!("JMP {}", top));
        self.emit_label(end);
        for binding in self.symbols.pop_scope() {
            if let Storage::Reg(reg) = binding.storage {
                self.release(reg);
            }
        }
        Ok(())
    }

    fn emit_switch(
        &mut self,
        selector: &Expr,
        cases: &[(Expr, Vec<Stmt>)],
        default: Option<&Vec<Stmt>>,
    ) -> Result<(), CompileError> {
        let n = self.fresh();
        let end = format!("endswitch_{}", n);
        let default_label = format!("default_{}", n);
        let (sel, sty) = self.eval(selector, false)?;
        self.require_scalar(&sty)?;
        for (k, (case_expr, _)) in cases.iter().enumerate() {
            let value = self
                .fold(case_expr)
                .ok_or(CompileError::NotConstant { context: "case label" })?;
            self.emit(format!("SUB {}, i:{}", sel.as_asm(), value));
            self.emit(format!("JZ case_{}_{}, 0", n, k));
        }
        self.free_value(&sel);
        if default.is_some() {
            self.emit(format!("JMP {}", default_label));
        } else {
            self.emit(format!("JMP {}", end));
        }
        self.break_targets.push(end.clone());
        for (k, (_, body)) in cases.iter().enumerate() {
            self.emit_label(format!("case_{}_{}", n, k));
            let result = self.scoped(|g| body.iter().try_for_each(|s| g.emit_stmt(s)));
            if result.is_err() {
                self.break_targets.pop();
                return result;
            }
        }
        if let Some(body) = default {
            self.emit_label(default_label);
            let result = self.scoped(|g| body.iter().try_for_each(|s| g.emit_stmt(s)));
            if result.is_err() {
                self.break_targets.pop();
                return result;
            }
        }
        self.break_targets.pop();
        self.emit_label(end);
        Ok(())
    }

    fn emit_return(&mut self, expr: Option<&Expr>) -> Result<(), CompileError> {
        match (expr, self.ret.clone()) {
            (None, Type::Void) => {}
            (None, ret) => {
                return Err(CompileError::BadTypes(format!(
                    "return without a value in a function returning {}",
                    ret
                )))
            }
            (Some(_), Type::Void) => {
                return Err(CompileError::BadTypes(
                    "void function returns a value".into(),
                ))
            }
            (Some(expr), _) => {
                let (value, vty) = self.eval(expr, false)?;
                self.require_scalar(&vty)?;
                self.emit(format!("MVR {}, 0", value.as_asm()));
                self.free_value(&value);
            }
        }
        let epilogue = self.epilogue.clone();
        self.emit(format!("JMP {}", epilogue));
        Ok(())
    }

    fn scoped<F>(&mut self, f: F) -> Result<(), CompileError>
    where
        F: FnOnce(&mut Self) -> Result<(), CompileError>,
    {
        self.symbols.push_scope();
        let result = f(self);
        for binding in self.symbols.pop_scope() {
            if let Storage::Reg(reg) = binding.storage {
                self.release(reg);
            }
        }
        result
    }

    // ── Expressions ───────────────────────────────────────────────────────

    /// Evaluate an expression. `void_ok` permits a void call in statement
    /// position; everywhere else a value is required.
    fn eval(&mut self, expr: &Expr, void_ok: bool) -> Result<(Value, Type), CompileError> {
        if let Some(folded) = self.fold(expr) {
            return Ok((Value::Imm(folded), Type::Int));
        }
        match expr {
            Expr::IntLit(v) => Ok((Value::Imm(*v), Type::Int)),
            Expr::CharLit(c) => Ok((Value::Imm(*c as u16), Type::Char)),
            Expr::Var(name) => self.eval_var(name),
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
            Expr::Unary { op, operand } => self.eval_unary(*op, operand),
            Expr::Call { name, args } => self.eval_call(name, args, void_ok),
            Expr::Index { base, index } => {
                let addr = self.element_address(base, index)?;
                let elem = self.element_type(base)?;
                let temp = self.alloc_temp()?;
                self.emit(format!("READ {}, {}", addr.as_asm(), temp));
                self.free_value(&addr);
                Ok((Value::Temp(temp), elem))
            }
            Expr::Deref(pointer) => {
                let (addr, pty) = self.eval(pointer, false)?;
                let inner = match pty {
                    Type::Ptr(inner) => *inner,
                    other => {
                        return Err(CompileError::BadTypes(format!(
                            "cannot dereference a value of type {}",
                            other
                        )))
                    }
                };
                let temp = self.alloc_temp()?;
                self.emit(format!("READ {}, {}", addr.as_asm(), temp));
                self.free_value(&addr);
                Ok((Value::Temp(temp), inner))
            }
            Expr::AddrOf(name) => self.eval_addr_of(name),
        }
    }

    fn eval_var(&mut self, name: &str) -> Result<(Value, Type), CompileError> {
        let binding = self
            .symbols
            .lookup(name)
            .ok_or_else(|| CompileError::UnknownName(name.to_string()))?;
        let ty = binding.ty.clone();
        match (binding.storage, &ty) {
            (Storage::Ram(address), Type::Array(elem, _)) => {
                // Arrays decay to a pointer at their base address.
                Ok((Value::Imm(address), Type::Ptr(elem.clone())))
            }
            (Storage::Reg(reg), _) => {
                self.pinned.push(reg);
                Ok((Value::Bound(reg), ty))
            }
            (Storage::Ram(address), _) => {
                let temp = self.alloc_temp()?;
                self.emit(format!("READ i:0x{:x}, {}", address, temp));
                Ok((Value::Temp(temp), ty))
            }
        }
    }

    fn eval_addr_of(&mut self, name: &str) -> Result<(Value, Type), CompileError> {
        let binding = self
            .symbols
            .lookup(name)
            .ok_or_else(|| CompileError::UnknownName(name.to_string()))?;
        let ty = binding.ty.clone();
        match binding.storage {
            Storage::Ram(address) => Ok((Value::Imm(address), Type::Ptr(Box::new(ty)))),
            Storage::Reg(reg) => {
                // The variable needs a stable address; rebind it to RAM for
                // the rest of its lifetime.
                let address = self.symbols.alloc_static(1);
                self.emit(format!("LOAD {}, i:0x{:x}", reg, address));
                self.symbols
                    .lookup_mut(name)
                    .expect("binding disappeared")
                    .storage = Storage::Ram(address);
                self.pinned.retain(|&r| r != reg);
                self.release(reg);
                Ok((Value::Imm(address), Type::Ptr(Box::new(ty))))
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(Value, Type), CompileError> {
        match op {
            BinOp::LogicAnd | BinOp::LogicOr => return self.eval_logic(op, lhs, rhs),
            _ => {}
        }
        let (a, aty) = self.eval(lhs, false)?;
        self.require_scalar(&aty)?;
        let (b, bty) = self.eval(rhs, false)?;
        self.require_scalar(&bty)?;
        let ty = binary_type(op, &aty, &bty);
        let value = match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                let mnemonic = match op {
                    BinOp::Add => "ADD",
                    BinOp::Sub => "SUB",
                    BinOp::Mul => "MULT",
                    _ => "DIV",
                };
                self.emit(format!("{} {}, {}", mnemonic, a.as_asm(), b.as_asm()));
                self.free_value(&a);
                self.free_value(&b);
                let temp = self.alloc_temp()?;
                self.emit(format!("MVR 0, {}", temp));
                Value::Temp(temp)
            }
            BinOp::Mod => {
                self.emit(format!("DIV {}, {}", a.as_asm(), b.as_asm()));
                self.free_value(&a);
                self.free_value(&b);
                let temp = self.alloc_temp()?;
                self.emit(format!("MVR 1, {}", temp));
                Value::Temp(temp)
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                let mnemonic = match op {
                    BinOp::BitAnd => "AND",
                    BinOp::BitOr => "OR",
                    BinOp::BitXor => "XOR",
                    BinOp::Shl => "SHL",
                    _ => "SHR",
                };
                self.emit(format!("{} {}, {}", mnemonic, a.as_asm(), b.as_asm()));
                self.free_value(&a);
                self.free_value(&b);
                let temp = self.alloc_temp()?;
                self.emit(format!("MVR 0, {}", temp));
                Value::Temp(temp)
            }
            BinOp::Lt => self.compare_less(&a, &b, false)?,
            BinOp::Gt => self.compare_less(&b, &a, false)?,
            BinOp::Ge => self.compare_less(&a, &b, true)?,
            BinOp::Le => self.compare_less(&b, &a, true)?,
            BinOp::Eq => self.compare_equal(&a, &b, false)?,
            BinOp::Ne => self.compare_equal(&a, &b, true)?,
            BinOp::LogicAnd | BinOp::LogicOr => unreachable!(),
        };
        Ok((value, ty))
    }

    /// `a < b` via the sign bit of the subtraction; `complement` derives
    /// `>=` from it.
    fn compare_less(&mut self, a: &Value, b: &Value, complement: bool) -> Result<Value, CompileError> {
        self.emit(format!("SUB {}, {}", a.as_asm(), b.as_asm()));
        self.free_value(a);
        self.free_value(b);
        self.emit("SHR 0, i:15");
        let temp = self.alloc_temp()?;
        if complement {
            self.emit("XOR 0, i:1");
        }
        self.emit(format!("MVR 0, {}", temp));
        Ok(Value::Temp(temp))
    }

    /// `a == b` via JZ on the subtraction result; `complement` derives `!=`.
    fn compare_equal(&mut self, a: &Value, b: &Value, complement: bool) -> Result<Value, CompileError> {
        let n = self.fresh();
        let (true_label, end_label) = (format!("true_{}", n), format!("end_{}", n));
        self.emit(format!("SUB {}, {}", a.as_asm(), b.as_asm()));
        self.free_value(a);
        self.free_value(b);
        let temp = self.alloc_temp()?;
        let (hit, miss) = if complement { (0, 1) } else { (1, 0) };
        self.emit(format!("JZ {}, 0", true_label));
        self.emit(format!("MVR i:{}, {}", miss, temp));
        self.emit(format!("JMP {}", end_label));
        self.emit_label(true_label);
        self.emit(format!("MVR i:{}, {}", hit, temp));
        self.emit_label(end_label);
        Ok(Value::Temp(temp))
    }

    /// Short-circuit `&&` / `||`, materializing 0 or 1 at the join.
    fn eval_logic(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(Value, Type), CompileError> {
        let n = self.fresh();
        let true_label = format!("true_{}", n);
        let false_label = format!("false_{}", n);
        let end_label = format!("end_{}", n);
        let short = if op == BinOp::LogicAnd {
            ("JZ", &false_label)
        } else {
            ("JNZ", &true_label)
        };
        for side in [lhs, rhs] {
            let (value, ty) = self.eval(side, false)?;
            self.require_scalar(&ty)?;
            self.emit(format!("{} {}, {}", short.0, short.1, value.as_asm()));
            self.free_value(&value);
        }
        let temp = self.alloc_temp()?;
        if op == BinOp::LogicAnd {
            self.emit(format!("MVR i:1, {}", temp));
            self.emit(format!("JMP {}", end_label));
            self.emit_label(false_label);
            self.emit(format!("MVR i:0, {}", temp));
        } else {
            self.emit(format!("MVR i:0, {}", temp));
            self.emit(format!("JMP {}", end_label));
            self.emit_label(true_label);
            self.emit(format!("MVR i:1, {}", temp));
        }
        self.emit_label(end_label);
        Ok((Value::Temp(temp), Type::Int))
    }

    fn eval_unary(&mut self, op: UnOp, operand: &Expr) -> Result<(Value, Type), CompileError> {
        match op {
            UnOp::Neg => {
                let (value, ty) = self.eval(operand, false)?;
                self.require_scalar(&ty)?;
                self.emit(format!("SUB i:0, {}", value.as_asm()));
                self.free_value(&value);
                let temp = self.alloc_temp()?;
                self.emit(format!("MVR 0, {}", temp));
                Ok((Value::Temp(temp), Type::Int))
            }
            UnOp::BitNot => {
                let (value, ty) = self.eval(operand, false)?;
                self.require_scalar(&ty)?;
                // NOT works in place on a register, so own one first.
                let temp = match value {
                    Value::Temp(reg) => reg,
                    _ => {
                        let temp = self.alloc_temp()?;
                        self.emit(format!("MVR {}, {}", value.as_asm(), temp));
                        self.free_value(&value);
                        temp
                    }
                };
                self.emit(format!("NOT {}", temp));
                Ok((Value::Temp(temp), Type::Int))
            }
            UnOp::LogicNot => {
                let n = self.fresh();
                let (true_label, end_label) = (format!("true_{}", n), format!("end_{}", n));
                let (value, ty) = self.eval(operand, false)?;
                self.require_scalar(&ty)?;
                self.emit(format!("JZ {}, {}", true_label, value.as_asm()));
                self.free_value(&value);
                let temp = self.alloc_temp()?;
                self.emit(format!("MVR i:0, {}", temp));
                self.emit(format!("JMP {}", end_label));
                self.emit_label(true_label);
                self.emit(format!("MVR i:1, {}", temp));
                self.emit_label(end_label);
                Ok((Value::Temp(temp), Type::Int))
            }
        }
    }

    /// Compute the RAM address of `base[index]`.
    fn element_address(&mut self, base: &Expr, index: &Expr) -> Result<Value, CompileError> {
        let (base_value, bty) = self.eval(base, false)?;
        let elem = match &bty {
            Type::Ptr(inner) => inner.as_ref().clone(),
            other => {
                return Err(CompileError::BadTypes(format!(
                    "cannot index into a value of type {}",
                    other
                )))
            }
        };
        let (index_value, ity) = self.eval(index, false)?;
        self.require_scalar(&ity)?;
        let size = elem.word_size().max(1);
        if let (Value::Imm(b), Value::Imm(i)) = (&base_value, &index_value) {
            return Ok(Value::Imm(b.wrapping_add(i.wrapping_mul(size))));
        }
        let scaled = if size == 1 {
            index_value
        } else {
            self.emit(format!("MULT {}, i:{}", index_value.as_asm(), size));
            self.free_value(&index_value);
            let temp = self.alloc_temp()?;
            self.emit(format!("MVR 0, {}", temp));
            Value::Temp(temp)
        };
        self.emit(format!("ADD {}, {}", base_value.as_asm(), scaled.as_asm()));
        self.free_value(&base_value);
        self.free_value(&scaled);
        let temp = self.alloc_temp()?;
        self.emit(format!("MVR 0, {}", temp));
        Ok(Value::Temp(temp))
    }

    fn element_type(&mut self, base: &Expr) -> Result<Type, CompileError> {
        // Re-derive the element type without emitting code.
        match base {
            Expr::Var(name) => match self.symbols.lookup(name).map(|b| b.ty.clone()) {
                Some(Type::Array(elem, _)) | Some(Type::Ptr(elem)) => Ok(*elem),
                Some(other) => Err(CompileError::BadTypes(format!(
                    "cannot index into a value of type {}",
                    other
                ))),
                None => Err(CompileError::UnknownName(name.clone())),
            },
            _ => Ok(Type::Int),
        }
    }

    // ── Calls and built-ins ───────────────────────────────────────────────

    fn eval_call(
        &mut self,
        name: &str,
        args: &[Expr],
        void_ok: bool,
    ) -> Result<(Value, Type), CompileError> {
        if let Some(result) = self.eval_builtin(name, args, void_ok)? {
            return Ok(result);
        }
        let sig = match self.symbols.function(name) {
            Some(sig) => sig.clone(),
            None => {
                return Err(if self.symbols.lookup(name).is_some() {
                    CompileError::NotAFunction(name.to_string())
                } else {
                    CompileError::UnknownName(name.to_string())
                })
            }
        };
        if sig.params.len() != args.len() {
            return Err(CompileError::BadArity {
                name: name.to_string(),
                expected: sig.params.len(),
                found: args.len(),
            });
        }
        if sig.ret == Type::Void && !void_ok {
            return Err(CompileError::BadTypes(format!(
                "void function `{}` used as a value",
                name
            )));
        }

        // Stage every argument in a temporary (or a folded constant) before
        // anything is moved into the argument registers; moving first would
        // let one argument clobber a variable the next one still reads.
        let mut staged = Vec::with_capacity(args.len());
        for arg in args {
            let (value, ty) = self.eval(arg, false)?;
            self.require_scalar(&ty)?;
            let value = match value {
                Value::Bound(_) => {
                    let temp = self.alloc_temp()?;
                    self.emit(format!("MVR {}, {}", value.as_asm(), temp));
                    self.free_value(&value);
                    Value::Temp(temp)
                }
                other => other,
            };
            staged.push(value);
        }
        let result_temp = if sig.ret != Type::Void {
            Some(self.alloc_temp()?)
        } else {
            None
        };

        // Callees allocate from the same register file, so everything live
        // here goes to the stack around the jump.
        let arg_regs: HashSet<u8> = staged
            .iter()
            .filter_map(|v| match v {
                Value::Temp(r) => Some(*r),
                _ => None,
            })
            .collect();
        let mut saved: Vec<u8> = self
            .symbols
            .register_bindings()
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        saved.extend(self.temps.iter().copied());
        saved.extend(self.link_reserve);
        saved.retain(|r| !arg_regs.contains(r) && Some(*r) != result_temp);
        saved.sort_unstable();
        saved.dedup();

        for &reg in &saved {
            self.push_reg(reg);
        }
        for (i, value) in staged.iter().enumerate() {
            self.emit(format!("MVR {}, {}", value.as_asm(), 4 + i as u8));
        }
        for value in &staged {
            self.free_value(value);
        }
        self.emit(format!("JAL {}", sig.label));
        if let Some(temp) = result_temp {
            self.emit(format!("MVR 0, {}", temp));
        }
        for &reg in saved.iter().rev() {
            self.pop_reg(reg);
        }
        match result_temp {
            Some(temp) => Ok((Value::Temp(temp), sig.ret)),
            None => Ok((Value::Imm(0), Type::Void)),
        }
    }

    fn eval_builtin(
        &mut self,
        name: &str,
        args: &[Expr],
        void_ok: bool,
    ) -> Result<Option<(Value, Type)>, CompileError> {
        let gpu_op = |name: &str| -> Option<(&'static str, usize)> {
            match name {
                "drawLine" => Some(("DRLINE", 4)),
                "drawGrid" => Some(("DRGRD", 4)),
                "clearGrid" => Some(("CLRGRID", 4)),
                "loadSprite" => Some(("LDSPR", 2)),
                "drawSprite" => Some(("DRSPR", 3)),
                "loadText" => Some(("LDTXT", 2)),
                "drawText" => Some(("DRTXT", 3)),
                "scrollBuffer" => Some(("SCRLBFR", 2)),
                _ => None,
            }
        };
        if let Some((mnemonic, arity)) = gpu_op(name) {
            if args.len() != arity {
                return Err(CompileError::BadArity {
                    name: name.to_string(),
                    expected: arity,
                    found: args.len(),
                });
            }
            if !void_ok {
                return Err(CompileError::BadTypes(format!(
                    "void built-in `{}` used as a value",
                    name
                )));
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                let (value, ty) = self.eval(arg, false)?;
                self.require_scalar(&ty)?;
                values.push(value);
            }
            let operands: Vec<String> = values.iter().map(|v| v.as_asm()).collect();
            self.emit(format!("{} {}", mnemonic, operands.join(", ")));
            for value in &values {
                self.free_value(value);
            }
            return Ok(Some((Value::Imm(0), Type::Void)));
        }
        match name {
            "malloc" => {
                self.check_arity(name, args, 1)?;
                let words = self
                    .fold(&args[0])
                    .ok_or(CompileError::NotConstant { context: "malloc size" })?;
                let address = self.symbols.alloc_static(words);
                Ok(Some((Value::Imm(address), Type::Ptr(Box::new(Type::Int)))))
            }
            "free" => {
                self.check_arity(name, args, 1)?;
                // Accepted for source compatibility; the allocator is a
                // compile-time cursor, so there is nothing to release.
                self.emit("// free: no-op");
                Ok(Some((Value::Imm(0), Type::Void)))
            }
            "readKey" => {
                self.check_arity(name, args, 0)?;
                let scratch = match self.keyin_scratch {
                    Some(addr) => addr,
                    None => {
                        let addr = self.symbols.alloc_static(1);
                        self.keyin_scratch = Some(addr);
                        addr
                    }
                };
                self.emit(format!("KEYIN i:0x{:x}", scratch));
                let temp = self.alloc_temp()?;
                self.emit(format!("READ i:0x{:x}, {}", scratch, temp));
                Ok(Some((Value::Temp(temp), Type::Int)))
            }
            "setGPUBuffer" => {
                self.check_arity(name, args, 2)?;
                let side = self
                    .fold(&args[0])
                    .ok_or(CompileError::NotConstant { context: "GPU buffer side" })?;
                let index = self
                    .fold(&args[1])
                    .ok_or(CompileError::NotConstant { context: "GPU buffer index" })?;
                // The display half of the selector sits above bit 15 and is
                // unreachable from a 16-bit register, so the helper keeps a
                // compile-time shadow and writes the whole selector at once.
                let index = (index & 1) as u32;
                self.selector_shadow = match side {
                    0 => (self.selector_shadow & 0xffff_0000) | index,
                    1 => (self.selector_shadow & 0x0000_ffff) | (index << 16),
                    _ => {
                        return Err(CompileError::BadTypes(
                            "setGPUBuffer side must be 0 (edit) or 1 (display)".into(),
                        ))
                    }
                };
                self.emit(format!("MVR i:0x{:08x}, GPU", self.selector_shadow));
                Ok(Some((Value::Imm(0), Type::Void)))
            }
            "getGPUBuffer" => {
                self.check_arity(name, args, 1)?;
                let side = self
                    .fold(&args[0])
                    .ok_or(CompileError::NotConstant { context: "GPU buffer side" })?;
                if side > 1 {
                    return Err(CompileError::BadTypes(
                        "getGPUBuffer side must be 0 (edit) or 1 (display)".into(),
                    ));
                }
                // MULT against 1 splits the live selector: R0 takes the edit
                // field, R1 the display field.
                self.emit("MULT GPU, i:1");
                let temp = self.alloc_temp()?;
                self.emit(format!("MVR {}, {}", side, temp));
                Ok(Some((Value::Temp(temp), Type::Int)))
            }
            _ => Ok(None),
        }
    }

    fn check_arity(&self, name: &str, args: &[Expr], expected: usize) -> Result<(), CompileError> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(CompileError::BadArity {
                name: name.to_string(),
                expected,
                found: args.len(),
            })
        }
    }

    fn require_scalar(&self, ty: &Type) -> Result<(), CompileError> {
        if ty.is_scalar() {
            Ok(())
        } else {
            Err(CompileError::BadTypes(format!(
                "expected a scalar value, found {}",
                ty
            )))
        }
    }

    // ── Constant folding ──────────────────────────────────────────────────

    /// Trivial constant folding: literals and operator trees over them.
    fn fold(&self, expr: &Expr) -> Option<u16> {
        match expr {
            Expr::IntLit(v) => Some(*v),
            Expr::CharLit(c) => Some(*c as u16),
            Expr::Unary { op, operand } => {
                let v = self.fold(operand)?;
                Some(match op {
                    UnOp::Neg => 0u16.wrapping_sub(v),
                    UnOp::BitNot => !v,
                    UnOp::LogicNot => (v == 0) as u16,
                })
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.fold(lhs)?;
                // Mirror the machine's short-circuit semantics even when
                // folding.
                match op {
                    BinOp::LogicAnd if a == 0 => return Some(0),
                    BinOp::LogicOr if a != 0 => return Some(1),
                    _ => {}
                }
                let b = self.fold(rhs)?;
                Some(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => {
                        if b == 0 {
                            return None;
                        }
                        (a as i16).wrapping_div(b as i16) as u16
                    }
                    BinOp::Mod => {
                        if b == 0 {
                            return None;
                        }
                        (a as i16).wrapping_rem(b as i16) as u16
                    }
                    BinOp::BitAnd => a & b,
                    BinOp::BitOr => a | b,
                    BinOp::BitXor => a ^ b,
                    BinOp::Shl => a << (b % 16),
                    BinOp::Shr => a >> (b % 16),
                    BinOp::Lt => ((a as i16) < (b as i16)) as u16,
                    BinOp::Le => ((a as i16) <= (b as i16)) as u16,
                    BinOp::Gt => ((a as i16) > (b as i16)) as u16,
                    BinOp::Ge => ((a as i16) >= (b as i16)) as u16,
                    BinOp::Eq => (a == b) as u16,
                    BinOp::Ne => (a != b) as u16,
                    BinOp::LogicAnd => (b != 0) as u16,
                    BinOp::LogicOr => (b != 0) as u16,
                })
            }
            _ => None,
        }
    }
}

/// Pointer arithmetic keeps the pointer type; everything else is an int.
fn binary_type(op: BinOp, aty: &Type, bty: &Type) -> Type {
    match op {
        BinOp::Add | BinOp::Sub => {
            if let Type::Ptr(_) = aty {
                aty.clone()
            } else if let Type::Ptr(_) = bty {
                bty.clone()
            } else {
                Type::Int
            }
        }
        _ => Type::Int,
    }
}

/// Direct and mutual recursion: a function is recursive if it can reach
/// itself through the call graph.
fn mark_recursion(program: &Program, symbols: &mut SymbolTable) {
    let mut edges: Vec<(String, Vec<String>)> = Vec::new();
    for function in &program.functions {
        let mut callees = Vec::new();
        collect_calls(&function.body, &mut callees);
        edges.push((function.name.clone(), callees));
    }
    for function in &program.functions {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = edges
            .iter()
            .find(|(n, _)| n == &function.name)
            .map(|(_, c)| c.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let mut recursive = false;
        while let Some(name) = stack.pop() {
            if name == function.name {
                recursive = true;
                break;
            }
            if !seen.insert(name.to_string()) {
                continue;
            }
            if let Some((_, callees)) = edges.iter().find(|(n, _)| n == name) {
                stack.extend(callees.iter().map(String::as_str));
            }
        }
        if recursive {
            symbols.mark_recursive(&function.name);
        }
    }
}

fn collect_calls(stmts: &[Stmt], out: &mut Vec<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Declare { init, .. } => {
                if let Some(init) = init {
                    collect_expr_calls(init, out);
                }
            }
            Stmt::Assign { target, value } => {
                match target {
                    LValue::Deref(e) => collect_expr_calls(e, out),
                    LValue::Index { base, index } => {
                        collect_expr_calls(base, out);
                        collect_expr_calls(index, out);
                    }
                    LValue::Var(_) => {}
                }
                collect_expr_calls(value, out);
            }
            Stmt::Expr(e) => collect_expr_calls(e, out),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                collect_expr_calls(cond, out);
                collect_calls(then_body, out);
                collect_calls(else_body, out);
            }
            Stmt::While { cond, body } => {
                collect_expr_calls(cond, out);
                collect_calls(body, out);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    collect_calls(std::slice::from_ref(init), out);
                }
                if let Some(cond) = cond {
                    collect_expr_calls(cond, out);
                }
                if let Some(step) = step {
                    collect_calls(std::slice::from_ref(step), out);
                }
                collect_calls(body, out);
            }
            Stmt::Switch {
                selector,
                cases,
                default,
            } => {
                collect_expr_calls(selector, out);
                for (_, body) in cases {
                    collect_calls(body, out);
                }
                if let Some(body) = default {
                    collect_calls(body, out);
                }
            }
            Stmt::Return(Some(e)) => collect_expr_calls(e, out),
            Stmt::Return(None) | Stmt::Break | Stmt::Continue => {}
        }
    }
}

fn collect_expr_calls(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Call { name, args } => {
            out.push(name.clone());
            for arg in args {
                collect_expr_calls(arg, out);
            }
        }
        Expr::Binary { lhs, rhs, .. } => {
            collect_expr_calls(lhs, out);
            collect_expr_calls(rhs, out);
        }
        Expr::Unary { operand, .. } => collect_expr_calls(operand, out),
        Expr::Index { base, index } => {
            collect_expr_calls(base, out);
            collect_expr_calls(index, out);
        }
        Expr::Deref(e) => collect_expr_calls(e, out),
        Expr::IntLit(_) | Expr::CharLit(_) | Expr::Var(_) | Expr::AddrOf(_) => {}
    }
}

/// Does this body JAL anywhere? GPU built-ins and `readKey` lower inline and
/// do not count.
fn calls_functions(stmts: &[Stmt], symbols: &SymbolTable) -> bool {
    let mut callees = Vec::new();
    collect_calls(stmts, &mut callees);
    callees.iter().any(|name| symbols.function(name).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn lower(source: &str) -> String {
        compile(&parse(source).expect("parses")).expect("compiles")
    }

    #[test]
    fn output_is_byte_identical_across_runs() {
        let source = "function f(n){ if(n<=1) return 1; return n*f(n-1);}\n\
                      function main(){ return f(4); }";
        assert_eq!(lower(source), lower(source));
    }

    #[test]
    fn output_round_trips_through_the_loader() {
        let assembly = lower(
            "function f(n){ if(n<=1) return 1; return n*f(n-1);}\n\
             function main(){ int a[3]; a[1] = f(3); return a[1]; }",
        );
        let program = crate::loader::load(&assembly).expect("generated assembly loads");
        assert!(program.labels.contains_key("main"));
        assert!(program.labels.contains_key("caller_return"));
    }

    #[test]
    fn preamble_sets_up_stack_and_entry() {
        let assembly = lower("function main(){ return 0; }");
        let mut lines = assembly.lines();
        assert_eq!(lines.next(), Some("MVR i:0xffff, 3"));
        assert_eq!(lines.next(), Some("JAL main"));
        assert_eq!(lines.next(), Some("HALT"));
        assert!(assembly.ends_with("caller_return:\nJMP 2\n"));
    }

    #[test]
    fn literal_returns_fold_to_one_move() {
        let assembly = lower("function main(){ return 10 + 5*2 - 8/2; }");
        assert!(assembly.contains("MVR i:16, 0"));
        assert!(!assembly.contains("MULT"));
    }

    #[test]
    fn recursive_functions_stack_their_link_register() {
        let assembly = lower(
            "function f(n){ if(n<=1) return 1; return n*f(n-1);}\n\
             function main(){ return f(5); }",
        );
        // f saves R2 on entry and restores it around the epilogue.
        let f_body: Vec<&str> = assembly
            .lines()
            .skip_while(|l| *l != "f:")
            .take_while(|l| *l != "main:")
            .collect();
        assert_eq!(f_body[1], "LOAD 2, 3");
        assert!(f_body.contains(&"READ 3, 2"));
    }

    #[test]
    fn register_pressure_rebinds_a_variable_to_ram() {
        let mut body = String::new();
        for i in 0..27 {
            body.push_str(&format!("int v{} = {};", i, i));
        }
        body.push_str("return v0 + v26;");
        let assembly = lower(&format!("function main(){{ {} }}", body));
        // One binding was moved out to the static area to make room.
        assert!(assembly.contains("LOAD 5, i:0x8000"));
    }

    #[test]
    fn missing_main_is_rejected() {
        let program = parse("function g(){ return 0; }").unwrap();
        assert!(matches!(compile(&program), Err(CompileError::NoMain)));
    }
}
