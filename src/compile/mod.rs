//! The macro-expanding compiler.
//!
//! [`compile`] turns one source value into a [`FuncDef`] for the virtual
//! machine. Dispatch works on the value's shape: tuples headed by a special
//! form go to the special's handler, tuples headed by a macro binding are
//! expanded (through the [`CallVm`] interface) and re-dispatched, remaining
//! tuples compile as calls, and everything else compiles as a constant, a
//! constructor, or a symbol resolved through the scope stack.
//!
//! The compiler is single-shot: the first error latches with its source
//! mapping and every later step short-circuits without touching it.

mod emit;
mod intrinsics;
mod scope;
mod specials;

use std::fmt;
use std::rc::Rc;

use crate::bytecode::{FUNCDEF_FLAG_NEEDSENV, FuncDef, Opcode, SourceMapping, op0};
use crate::env::{Binding, CallVm, Environment, NativeCaller};
use crate::intern::{Symbol, SymbolTable};
use crate::value::Value;
use crate::{MAX_MACRO_EXPANSIONS, MAX_RECURSION_DEPTH};

use scope::{
    SCOPE_CLOSURE, SCOPE_ENV, SCOPE_FUNCTION, SCOPE_TOP, SCOPE_UNUSED, Scope, SymPair,
};

// Slot flags. The low 17 bits are the set of kinds the slot may hold.
pub(crate) const SLOTTYPE_ANY: u32 = 0x1FFFF;
pub(crate) const SLOT_CONSTANT: u32 = 0x20000;
pub(crate) const SLOT_NAMED: u32 = 0x40000;
pub(crate) const SLOT_MUTABLE: u32 = 0x80000;
pub(crate) const SLOT_REF: u32 = 0x100000;
pub(crate) const SLOT_RETURNED: u32 = 0x200000;
pub(crate) const SLOT_SPLICED: u32 = 0x400000;

// Per-form compile options.
pub(crate) const FOPTS_TAIL: u32 = 0x20000;
pub(crate) const FOPTS_HINT: u32 = 0x40000;
pub(crate) const FOPTS_DROP: u32 = 0x80000;
pub(crate) const FOPTS_ACCEPT_SPLICE: u32 = 0x100000;

/// A compile-time location: a register in the current function, an upvalue
/// in a captured environment, a constant, or a reference cell. Slots are
/// value-like and cheap to copy.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub flags: u32,
    /// Register index; -1 when the slot is not in a register
    pub index: i32,
    /// Captured-environment index; -1 for a local
    pub envindex: i32,
    /// Payload for constant and ref slots
    pub constant: Value,
}

impl Slot {
    pub fn constant(x: Value) -> Slot {
        Slot {
            flags: (1u32 << x.kind() as u8) | SLOT_CONSTANT,
            index: -1,
            envindex: -1,
            constant: x,
        }
    }

    pub fn nil() -> Slot {
        Slot::constant(Value::Nil)
    }
}

/// Options for compiling a single form: a tail/hint/drop flag word plus the
/// preferred destination slot when hinting.
#[derive(Clone)]
pub(crate) struct Fopts {
    pub flags: u32,
    pub hint: Slot,
}

/// A failed compilation: the message, the source mapping the compiler had
/// when the error latched, and the macro fiber when a macro signaled.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub line: i32,
    pub column: i32,
    pub fiber: Option<Value>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "compile error: {}", self.message)?;
        if self.line > 0 {
            write!(f, " at line {}, column {}", self.line, self.column)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

pub(crate) struct LoopFrame {
    /// Offsets of break jumps waiting for the loop end
    pub break_jumps: Vec<usize>,
    /// Breaks inside the tail-call loop transform return nil instead
    pub is_tail_iife: bool,
}

enum Expansion {
    /// Not a macro or special call; dispatch on the value itself
    Plain,
    /// A special form; compile through its handler
    Special(&'static specials::Special),
    /// One macro expansion step produced a new form
    Expanded(Value),
}

pub(crate) struct Compiler<'a> {
    pub(crate) scopes: Vec<Scope>,
    pub(crate) buffer: Vec<u32>,
    pub(crate) mapbuffer: Vec<SourceMapping>,
    pub(crate) recursion_guard: i32,
    pub(crate) env: &'a mut Environment,
    pub(crate) symbols: Rc<SymbolTable>,
    pub(crate) vm: &'a mut dyn CallVm,
    pub(crate) source: Option<Rc<str>>,
    pub(crate) current_mapping: SourceMapping,
    pub(crate) error: Option<CompileError>,
    pub(crate) loops: Vec<LoopFrame>,
}

impl<'a> Compiler<'a> {
    fn new(
        env: &'a mut Environment,
        symbols: Rc<SymbolTable>,
        vm: &'a mut dyn CallVm,
        source_name: Option<&str>,
    ) -> Compiler<'a> {
        Compiler {
            scopes: Vec::new(),
            buffer: Vec::new(),
            mapbuffer: Vec::new(),
            recursion_guard: MAX_RECURSION_DEPTH,
            env,
            symbols,
            vm,
            source: source_name.map(Rc::from),
            current_mapping: SourceMapping::default(),
            error: None,
            loops: Vec::new(),
        }
    }

    /// Latch an error. Only the first one is kept.
    pub(crate) fn cerror(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(CompileError {
                message: message.into(),
                line: self.current_mapping.line,
                column: self.current_mapping.column,
                fiber: None,
            });
        }
    }

    pub(crate) fn cerror_fiber(&mut self, message: String, fiber: Option<Value>) {
        if self.error.is_none() {
            self.error = Some(CompileError {
                message,
                line: self.current_mapping.line,
                column: self.current_mapping.column,
                fiber,
            });
        }
    }

    pub(crate) fn fopts_default(&self) -> Fopts {
        Fopts {
            flags: 0,
            hint: Slot::nil(),
        }
    }

    pub(crate) fn scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("no current scope")
    }

    pub(crate) fn pushscope(&mut self, flags: u32, name: &'static str) {
        let mut scope = Scope::new(name, flags, self.buffer.len());
        if flags & SCOPE_FUNCTION == 0
            && let Some(parent) = self.scopes.last()
        {
            scope.ra = parent.ra.inherit();
        }
        self.scopes.push(scope);
    }

    /// Leave a scope. A lexical scope merges its register high-water mark
    /// and its kept (captured) bindings into the parent; function and
    /// throwaway scopes release everything.
    pub(crate) fn popscope(&mut self) {
        let old = self.scopes.pop().expect("scope stack underflow");
        if old.flags & (SCOPE_FUNCTION | SCOPE_UNUSED) == 0
            && let Some(parent) = self.scopes.last_mut()
        {
            // A closure created inside a lexical scope is a closure in the
            // parent too; while loops rely on this
            if old.flags & SCOPE_CLOSURE != 0 {
                parent.flags |= SCOPE_CLOSURE;
            }
            if parent.ra.max < old.ra.max {
                parent.ra.max = old.ra.max;
            }
            for pair in old.syms {
                if pair.keep {
                    // Still captured below, but no longer lexically visible
                    parent.ra.touch(pair.slot.index);
                    parent.syms.push(SymPair {
                        sym: None,
                        keep: pair.keep,
                        slot: pair.slot,
                    });
                }
            }
        }
    }

    /// Leave a scope but keep the given result slot allocated in the parent.
    pub(crate) fn popscope_keepslot(&mut self, ret: &Slot) {
        self.popscope();
        if ret.envindex < 0
            && ret.index >= 0
            && let Some(scope) = self.scopes.last_mut()
        {
            scope.ra.touch(ret.index);
        }
    }

    /// Release a slot's register, unless it is constant, named or captured.
    pub(crate) fn freeslot(&mut self, s: &Slot) {
        if s.flags & (SLOT_CONSTANT | SLOT_REF | SLOT_NAMED) != 0 {
            return;
        }
        if s.envindex >= 0 {
            return;
        }
        self.scope_mut().ra.free(s.index);
    }

    pub(crate) fn freeslots(&mut self, slots: Vec<Slot>) {
        for s in &slots {
            self.freeslot(s);
        }
    }

    /// Bind a symbol to a slot in the current scope.
    pub(crate) fn nameslot(&mut self, sym: Symbol, mut slot: Slot) {
        slot.flags |= SLOT_NAMED;
        self.scope_mut().syms.push(SymPair {
            sym: Some(sym),
            keep: false,
            slot,
        });
    }

    /// Allocate an anonymous local slot.
    pub(crate) fn farslot(&mut self) -> Slot {
        Slot {
            flags: SLOTTYPE_ANY,
            index: self.allocfar(),
            envindex: -1,
            constant: Value::Nil,
        }
    }

    /// Resolve a symbol through the scope stack, recording upvalue captures
    /// on the way, and falling back to the environment.
    pub(crate) fn resolve(&mut self, sym: &Symbol) -> Slot {
        let mut found_local = true;
        let mut unused = false;
        let mut found: Option<(usize, usize)> = None;
        'search: for si in (0..self.scopes.len()).rev() {
            let scope = &self.scopes[si];
            if scope.flags & SCOPE_UNUSED != 0 {
                unused = true;
            }
            for pi in (0..scope.syms.len()).rev() {
                if scope.syms[pi].sym.as_ref() == Some(sym) {
                    found = Some((si, pi));
                    break 'search;
                }
            }
            if scope.flags & SCOPE_FUNCTION != 0 {
                found_local = false;
            }
        }

        let Some((si, pi)) = found else {
            return self.resolve_global(sym);
        };

        let mut ret = self.scopes[si].syms[pi].slot.clone();

        // Constants and refs are stateless; hand them straight back
        if ret.flags & (SLOT_CONSTANT | SLOT_REF) != 0 {
            return ret;
        }

        // References from dead code and references within the current
        // function do not capture anything
        if unused || found_local {
            ret.envindex = -1;
            return ret;
        }

        // The defining function must expose its environment, and every
        // function between it and us needs an upvalue entry
        self.scopes[si].syms[pi].keep = true;
        let mut fi = si;
        while fi > 0 && self.scopes[fi].flags & SCOPE_FUNCTION == 0 {
            fi -= 1;
        }
        self.scopes[fi].flags |= SCOPE_ENV;

        let mut envindex: i32 = -1;
        for sj in (fi + 1)..self.scopes.len() {
            if self.scopes[sj].flags & SCOPE_FUNCTION == 0 {
                continue;
            }
            let envs = &mut self.scopes[sj].envs;
            match envs.iter().position(|&e| e == envindex) {
                Some(at) => envindex = at as i32,
                None => {
                    envs.push(envindex);
                    envindex = (envs.len() - 1) as i32;
                }
            }
        }
        ret.envindex = envindex;
        ret
    }

    fn resolve_global(&mut self, sym: &Symbol) -> Slot {
        let binding = self.env.resolve(sym).cloned();
        match binding {
            None => {
                self.cerror(format!("unknown symbol {}", sym.text()));
                Slot::nil()
            }
            // A macro referenced outside call position behaves like a def
            Some(Binding::Def(v)) | Some(Binding::Macro(v)) => Slot::constant(v),
            Some(Binding::DefRef(cell)) => {
                let mut s = Slot::constant(cell);
                s.flags &= !SLOT_CONSTANT;
                s.flags |= SLOT_REF | SLOT_NAMED | SLOTTYPE_ANY;
                s
            }
            Some(Binding::Var(cell)) => {
                let mut s = Slot::constant(cell);
                s.flags &= !SLOT_CONSTANT;
                s.flags |= SLOT_REF | SLOT_NAMED | SLOT_MUTABLE | SLOTTYPE_ANY;
                s
            }
        }
    }

    /// Emit the return instruction for a slot unless it already returned.
    pub(crate) fn do_return(&mut self, mut s: Slot) -> Slot {
        if s.flags & SLOT_RETURNED == 0 {
            if s.flags & SLOT_CONSTANT != 0 && matches!(s.constant, Value::Nil) {
                self.emit(op0(Opcode::ReturnNil));
            } else {
                self.emit_s(Opcode::Return, &s, false);
            }
            s.flags |= SLOT_RETURNED;
        }
        s
    }

    /// Pick a destination slot: the hint when it is a near register,
    /// otherwise a fresh local.
    pub(crate) fn gettarget(&mut self, opts: &Fopts) -> Slot {
        if opts.flags & FOPTS_HINT != 0
            && opts.hint.envindex < 0
            && opts.hint.index >= 0
            && opts.hint.index <= 0xFF
        {
            opts.hint.clone()
        } else {
            Slot {
                flags: 0,
                index: self.allocfar(),
                envindex: -1,
                constant: Value::Nil,
            }
        }
    }

    /// Compile each value to a slot, allowing splices.
    pub(crate) fn toslots(&mut self, vals: &[Value]) -> Vec<Slot> {
        let mut subopts = self.fopts_default();
        subopts.flags |= FOPTS_ACCEPT_SPLICE;
        vals.iter()
            .map(|v| self.value(subopts.clone(), v.clone()))
            .collect()
    }

    /// Compile key/value pairs to alternating slots.
    pub(crate) fn toslots_kv(&mut self, pairs: &[(Value, Value)]) -> Vec<Slot> {
        let subopts = self.fopts_default();
        let mut out = Vec::with_capacity(pairs.len() * 2);
        for (k, v) in pairs {
            out.push(self.value(subopts.clone(), k.clone()));
            out.push(self.value(subopts.clone(), v.clone()));
        }
        out
    }

    /// Push argument slots for a call or constructor. Runs of plain slots
    /// use the grouped push instructions; spliced slots push whole arrays.
    pub(crate) fn pushslots(&mut self, slots: &[Slot]) {
        let mut i = 0;
        while i < slots.len() {
            if slots[i].flags & SLOT_SPLICED != 0 {
                self.emit_s(Opcode::PushArray, &slots[i], false);
                i += 1;
                continue;
            }
            let run_end = slots[i..]
                .iter()
                .position(|s| s.flags & SLOT_SPLICED != 0)
                .map_or(slots.len(), |p| i + p);
            let mut j = i;
            while run_end - j >= 3 {
                self.emit_sss(Opcode::Push3, &slots[j], &slots[j + 1], &slots[j + 2], false);
                j += 3;
            }
            if run_end - j == 2 {
                self.emit_ss(Opcode::Push2, &slots[j], &slots[j + 1], false);
            } else if run_end - j == 1 {
                self.emit_s(Opcode::Push, &slots[j], false);
            }
            i = run_end;
        }
    }

    /// Compile a form whose result is discarded along with its code. Keeps
    /// dead branches well-formed without emitting them.
    pub(crate) fn throwaway(&mut self, opts: Fopts, x: &Value) {
        let bufstart = self.buffer.len();
        let mapstart = self.mapbuffer.len();
        self.pushscope(SCOPE_UNUSED, "unused");
        self.value(opts, x.clone());
        self.popscope();
        self.buffer.truncate(bufstart);
        self.mapbuffer.truncate(mapstart);
    }

    /// Compile a call with already-computed argument slots. Calls to
    /// constant native functions may reduce to single instructions through
    /// the intrinsic table; tail calls emit `tailcall` and yield a slot
    /// marked as already returned.
    pub(crate) fn call(&mut self, opts: &Fopts, slots: Vec<Slot>, fun: Slot) -> Slot {
        let mut specialized = None;
        let has_splice = slots.iter().any(|s| s.flags & SLOT_SPLICED != 0);
        if !has_splice
            && fun.flags & SLOT_CONSTANT != 0
            && let Some(intrinsic) = intrinsics::find(&fun.constant)
        {
            specialized = (intrinsic.compile)(self, opts, &slots);
        }
        let ret = match specialized {
            Some(ret) => ret,
            None => {
                self.pushslots(&slots);
                if opts.flags & FOPTS_TAIL != 0 {
                    self.emit_s(Opcode::TailCall, &fun, false);
                    let mut ret = Slot::nil();
                    ret.flags |= SLOT_RETURNED;
                    ret
                } else {
                    let target = self.gettarget(opts);
                    self.emit_ss(Opcode::Call, &target, &fun, true);
                    target
                }
            }
        };
        self.freeslots(slots);
        ret
    }

    /// Emit a container constructor from pushed slots.
    pub(crate) fn maker(&mut self, opts: &Fopts, slots: Vec<Slot>, op: Opcode) -> Slot {
        self.pushslots(&slots);
        self.freeslots(slots);
        let target = self.gettarget(opts);
        self.emit_s(op, &target, true);
        target
    }

    fn compile_symbol(&mut self, sym: &Symbol) -> Slot {
        let text = sym.text();
        if !text.is_empty() && !text.starts_with(':') {
            self.resolve(sym)
        } else if let Some(tail) = text.strip_prefix(':') {
            let keyword = self.symbols.intern(tail);
            Slot::constant(Value::Keyword(keyword))
        } else {
            Slot::constant(Value::Symbol(sym.clone()))
        }
    }

    /// Expand one step: identify a special form, or run a macro binding
    /// through the VM once.
    fn macroexpand1(&mut self, x: &Value) -> Expansion {
        let Value::Tuple(form) = x else {
            return Expansion::Plain;
        };
        if form.is_empty() || form.bracketed() {
            return Expansion::Plain;
        }
        // Refine the source cursor whenever we see a mapped tuple
        if form.line() > 0 {
            self.current_mapping = SourceMapping {
                line: form.line(),
                column: form.column(),
            };
        }
        let Value::Symbol(name) = &form.items()[0] else {
            return Expansion::Plain;
        };
        if let Some(special) = specials::find(name.text()) {
            return Expansion::Special(special);
        }
        let macro_fn = match self.env.resolve(name) {
            Some(Binding::Macro(m)) if matches!(m, Value::Function(_) | Value::CFunction(_)) => {
                m.clone()
            }
            _ => return Expansion::Plain,
        };
        match self.vm.call(&macro_fn, &form.items()[1..]) {
            Ok(expanded) => Expansion::Expanded(expanded),
            Err(e) => {
                self.cerror_fiber(format!("(macro) {}", e.message), e.fiber);
                Expansion::Plain
            }
        }
    }

    /// Compile a single value into a slot. This is the dispatch loop at the
    /// heart of the compiler.
    pub(crate) fn value(&mut self, opts: Fopts, x: Value) -> Slot {
        if self.error.is_some() {
            return Slot::nil();
        }
        self.recursion_guard -= 1;
        if self.recursion_guard <= 0 {
            self.recursion_guard += 1;
            self.cerror("recursed too deeply");
            return Slot::nil();
        }
        let saved_mapping = self.current_mapping;

        let mut x = x;
        let mut special = None;
        let mut expansions = MAX_MACRO_EXPANSIONS;
        loop {
            if expansions <= 0 {
                self.cerror("recursed too deeply in macro expansion");
                self.recursion_guard += 1;
                return Slot::nil();
            }
            match self.macroexpand1(&x) {
                Expansion::Plain => break,
                Expansion::Special(s) => {
                    special = Some(s);
                    break;
                }
                Expansion::Expanded(next) => {
                    x = next;
                    expansions -= 1;
                }
            }
            if self.error.is_some() {
                self.recursion_guard += 1;
                return Slot::nil();
            }
        }
        if self.error.is_some() {
            self.recursion_guard += 1;
            return Slot::nil();
        }

        let mut ret = if let Some(special) = special {
            let Value::Tuple(form) = &x else {
                unreachable!("specials only match tuples")
            };
            let args = form.items()[1..].to_vec();
            (special.compile)(self, &opts, &args)
        } else {
            match &x {
                Value::Tuple(form) if form.bracketed() => {
                    let slots = self.toslots(form.items());
                    self.maker(&opts, slots, Opcode::MakeTuple)
                }
                Value::Tuple(form) => {
                    if form.is_empty() {
                        Slot::constant(x.clone())
                    } else {
                        let subopts = self.fopts_default();
                        let head = self.value(subopts, form.items()[0].clone());
                        let slots = self.toslots(&form.items()[1..]);
                        let ret = self.call(&opts, slots, head.clone());
                        self.freeslot(&head);
                        ret
                    }
                }
                Value::Symbol(sym) => {
                    let sym = sym.clone();
                    self.compile_symbol(&sym)
                }
                Value::Array(items) => {
                    let items = items.borrow().clone();
                    let slots = self.toslots(&items);
                    self.maker(&opts, slots, Opcode::MakeArray)
                }
                Value::Struct(map) => {
                    let pairs = map.entries().to_vec();
                    let slots = self.toslots_kv(&pairs);
                    self.maker(&opts, slots, Opcode::MakeStruct)
                }
                Value::Table(map) => {
                    let mut pairs: Vec<(Value, Value)> = map
                        .borrow()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    pairs.sort_by(|a, b| a.0.cmp(&b.0));
                    let slots = self.toslots_kv(&pairs);
                    self.maker(&opts, slots, Opcode::MakeTable)
                }
                Value::Buffer(bytes) => {
                    let contents = Value::string_from_bytes(&bytes.borrow());
                    let slots = self.toslots(&[contents]);
                    self.maker(&opts, slots, Opcode::MakeBuffer)
                }
                _ => Slot::constant(x.clone()),
            }
        };

        if self.error.is_some() {
            self.recursion_guard += 1;
            return Slot::nil();
        }
        self.current_mapping = saved_mapping;
        if opts.flags & FOPTS_TAIL != 0 {
            ret = self.do_return(ret);
        }
        if opts.flags & FOPTS_HINT != 0 {
            self.copy(&opts.hint, &ret);
            ret = opts.hint.clone();
        }
        self.recursion_guard += 1;
        ret
    }

    /// Add a nested definition to the enclosing function scope.
    pub(crate) fn add_funcdef(&mut self, def: Rc<FuncDef>) -> usize {
        let scope = self
            .scopes
            .iter_mut()
            .rev()
            .find(|s| s.flags & SCOPE_FUNCTION != 0)
            .expect("no enclosing function scope");
        scope.defs.push(def);
        scope.defs.len() - 1
    }

    /// Finalize the current function scope into an immutable definition:
    /// bytecode and source maps are split out of the shared buffers, the
    /// growable pools shrink to fixed arrays, and the slot count comes from
    /// the allocator's high-water mark.
    pub(crate) fn pop_funcdef(&mut self) -> FuncDef {
        let scope = self.scopes.last_mut().expect("no scope to pop");
        debug_assert!(
            scope.flags & SCOPE_FUNCTION != 0,
            "expected a function scope"
        );
        let slot_count = scope.ra.max + 1;
        let environments = std::mem::take(&mut scope.envs).into_boxed_slice();
        let constants = std::mem::take(&mut scope.consts).into_boxed_slice();
        let defs = std::mem::take(&mut scope.defs).into_boxed_slice();
        let flags = if scope.flags & SCOPE_ENV != 0 {
            FUNCDEF_FLAG_NEEDSENV
        } else {
            0
        };
        let start = scope.bytecode_start;
        let bytecode = self.buffer.split_off(start).into_boxed_slice();
        let source_map = self.mapbuffer.split_off(start).into_boxed_slice();
        self.popscope();
        FuncDef {
            bytecode,
            constants,
            defs,
            environments,
            arity: 0,
            flags,
            slot_count,
            name: None,
            source: self.source.clone(),
            source_map,
        }
    }
}

/// Compile one source value against an environment, expanding macros with
/// the given VM. Top-level `def` and `var` forms insert bindings into the
/// environment as they compile.
pub fn compile_with(
    source: Value,
    env: &mut Environment,
    symbols: &Rc<SymbolTable>,
    source_name: Option<&str>,
    vm: &mut dyn CallVm,
) -> Result<Rc<FuncDef>, CompileError> {
    let mut c = Compiler::new(env, symbols.clone(), vm, source_name);
    c.pushscope(SCOPE_FUNCTION | SCOPE_TOP, "root");
    let opts = Fopts {
        flags: FOPTS_TAIL,
        hint: Slot::nil(),
    };
    c.value(opts, source);
    match c.error.take() {
        Some(err) => {
            // Unwind whatever error paths left behind; allocator state must
            // be released even on failure
            while !c.scopes.is_empty() {
                c.popscope();
            }
            Err(err)
        }
        None => {
            let mut def = c.pop_funcdef();
            def.name = Some(Rc::from("_thunk"));
            Ok(Rc::new(def))
        }
    }
}

/// Compile with the default macro runner, which can call native macros but
/// reports an error for bytecode-compiled ones.
pub fn compile(
    source: Value,
    env: &mut Environment,
    symbols: &Rc<SymbolTable>,
    source_name: Option<&str>,
) -> Result<Rc<FuncDef>, CompileError> {
    let mut vm = NativeCaller;
    compile_with(source, env, symbols, source_name, &mut vm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{FUNCDEF_FLAG_FIXARITY, FUNCDEF_FLAG_VARARG, field_wide};
    use crate::env::{Arity, core_env};
    use crate::parser::{Parser, ParserStatus};
    use crate::value::NativeFn;
    use Opcode::*;

    fn parse_one(symbols: &Rc<SymbolTable>, src: &str) -> Value {
        let mut p = Parser::new(symbols.clone());
        p.consume_bytes(src.as_bytes());
        p.eof();
        assert_ne!(p.status(), ParserStatus::Error, "bad test source {src:?}");
        p.produce().unwrap_or_else(|| panic!("no value in {src:?}"))
    }

    fn compile_core(src: &str) -> Result<Rc<FuncDef>, CompileError> {
        let symbols = SymbolTable::shared();
        let mut env = core_env(&symbols);
        let source = parse_one(&symbols, src);
        compile(source, &mut env, &symbols, Some("test"))
    }

    fn compile_core_ok(src: &str) -> Rc<FuncDef> {
        compile_core(src).unwrap_or_else(|e| panic!("{src:?} failed to compile: {e}"))
    }

    #[test]
    fn test_constants_compile_to_load_and_return() {
        let cases: Vec<(&str, Vec<Opcode>)> = vec![
            ("nil", vec![ReturnNil]),
            ("42", vec![LoadInteger, Return]),
            ("true", vec![LoadTrue, Return]),
            (":kw", vec![LoadConstant, Return]),
            ("\"str\"", vec![LoadConstant, Return]),
            // Integers outside 16 bits go through the pool
            ("70000", vec![LoadConstant, Return]),
        ];
        for (i, (src, expected)) in cases.iter().enumerate() {
            let def = compile_core_ok(src);
            assert_eq!(&def.opcodes(), expected, "case {i}: {src}\n{}", def.disassemble());
        }
    }

    #[test]
    fn test_plain_call_pushes_args_and_tailcalls() {
        // A callee that is not intrinsic compiles as push + tailcall
        let symbols = SymbolTable::shared();
        let mut env = Environment::new();
        env.register_native(&symbols, "f", Arity::AtLeast(0), |_| Ok(Value::Nil));
        let source = parse_one(&symbols, "(f 1 2)");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        assert_eq!(
            def.opcodes(),
            vec![LoadInteger, LoadInteger, Push2, LoadConstant, TailCall],
            "{}",
            def.disassemble()
        );
        // The callee is in the constant pool exactly once
        assert_eq!(def.constants.len(), 1);
    }

    #[test]
    fn test_push_grouping() {
        let symbols = SymbolTable::shared();
        let mut env = Environment::new();
        env.register_native(&symbols, "f", Arity::AtLeast(0), |_| Ok(Value::Nil));
        let cases: Vec<(&str, Vec<Opcode>)> = vec![
            ("(f 1)", vec![LoadInteger, Push, LoadConstant, TailCall]),
            (
                "(f 1 2 3)",
                vec![LoadInteger, LoadInteger, LoadInteger, Push3, LoadConstant, TailCall],
            ),
            (
                "(f 1 2 3 4)",
                vec![
                    LoadInteger, LoadInteger, LoadInteger, Push3, LoadInteger, Push,
                    LoadConstant, TailCall,
                ],
            ),
        ];
        for (i, (src, expected)) in cases.iter().enumerate() {
            let source = parse_one(&symbols, src);
            let def = compile(source, &mut env, &symbols, None).unwrap();
            assert_eq!(&def.opcodes(), expected, "case {i}: {src}\n{}", def.disassemble());
        }
    }

    #[test]
    fn test_intrinsic_arithmetic_reduces_to_instructions() {
        let cases: Vec<(&str, Vec<Opcode>)> = vec![
            ("(+ 1 2)", vec![LoadInteger, LoadInteger, Add, Return]),
            (
                "(+ 1 2 3)",
                vec![LoadInteger, LoadInteger, Add, LoadInteger, Add, Return],
            ),
            // Unary minus is 0 - x
            ("(- 5)", vec![LoadInteger, LoadInteger, Subtract, Return]),
            ("(+)", vec![LoadInteger, Return]),
            ("(* 2 3)", vec![LoadInteger, LoadInteger, Multiply, Return]),
            ("(shl 1 4)", vec![LoadInteger, LoadInteger, ShiftLeft, Return]),
            (
                "(length \"abc\")",
                vec![LoadConstant, Length, Return],
            ),
            ("(error \"x\")", vec![LoadConstant, Signal, Return]),
        ];
        for (i, (src, expected)) in cases.iter().enumerate() {
            let def = compile_core_ok(src);
            assert_eq!(&def.opcodes(), expected, "case {i}: {src}\n{}", def.disassemble());
        }
    }

    #[test]
    fn test_fn_produces_nested_funcdef() {
        let def = compile_core_ok("(fn [x] x)");
        assert_eq!(def.opcodes(), vec![Closure, Return]);
        assert_eq!(def.defs.len(), 1);
        let inner = &def.defs[0];
        assert_eq!(inner.arity, 1);
        assert_ne!(inner.flags & FUNCDEF_FLAG_FIXARITY, 0);
        assert_eq!(inner.opcodes(), vec![Return]);
        assert!(inner.slot_count >= 1);

        // Array parameters mean flexible arity; & means varargs
        let def = compile_core_ok("(fn [x & rest] rest)");
        let inner = &def.defs[0];
        assert_eq!(inner.arity, 1);
        assert_ne!(inner.flags & FUNCDEF_FLAG_VARARG, 0);

        // A named function records its name
        let def = compile_core_ok("(fn loop-fn [] nil)");
        assert_eq!(def.defs[0].name.as_deref(), Some("loop-fn"));
    }

    #[test]
    fn test_upvalue_capture_chain() {
        // One intervening function: one upvalue entry each side
        let def = compile_core_ok("(fn [x] (fn [y] (+ x y)))");
        let outer = &def.defs[0];
        assert_ne!(
            outer.flags & FUNCDEF_FLAG_NEEDSENV,
            0,
            "outer function must expose its environment"
        );
        assert_eq!(outer.defs.len(), 1);
        let inner = &outer.defs[0];
        assert_eq!(&*inner.environments, &[-1]);
        assert!(inner.opcodes().contains(&LoadUpvalue));

        // Two function scopes above: the chain threads one entry per level
        let def = compile_core_ok("(fn [x] (fn [] (fn [] x)))");
        let outer = &def.defs[0];
        let mid = &outer.defs[0];
        let innermost = &mid.defs[0];
        assert_ne!(outer.flags & FUNCDEF_FLAG_NEEDSENV, 0);
        assert_eq!(&*mid.environments, &[-1]);
        assert_eq!(&*innermost.environments, &[0]);
        assert!(innermost.opcodes().contains(&LoadUpvalue));
    }

    #[test]
    fn test_var_set_and_read_through_cells() {
        let symbols = SymbolTable::shared();
        let mut env = core_env(&symbols);

        // Top-level var: initialization writes the cell
        let source = parse_one(&symbols, "(var x 1)");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        assert!(def.opcodes().contains(&PutIndex), "{}", def.disassemble());
        assert!(matches!(
            env.resolve(&symbols.intern("x")),
            Some(Binding::Var(_))
        ));

        // set writes through put-index on the same cell
        let source = parse_one(&symbols, "(set x 2)");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        assert!(def.opcodes().contains(&PutIndex), "{}", def.disassemble());

        // Reading a var loads the cell and indexes it
        let source = parse_one(&symbols, "x");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        assert_eq!(
            def.opcodes(),
            vec![LoadConstant, GetIndex, Return],
            "{}",
            def.disassemble()
        );

        // The backing cell is shared with the environment binding
        let Some(Binding::Var(cell)) = env.resolve(&symbols.intern("x")) else {
            panic!("x should still be a var");
        };
        assert_eq!(cell.len(), 1);
    }

    #[test]
    fn test_top_level_def_bindings() {
        let symbols = SymbolTable::shared();
        let mut env = core_env(&symbols);

        // Constant value: bound directly
        let source = parse_one(&symbols, "(def k 7)");
        compile(source, &mut env, &symbols, None).unwrap();
        assert!(matches!(
            env.resolve(&symbols.intern("k")),
            Some(Binding::Def(Value::Integer(7)))
        ));

        // Runtime value: bound through a cell
        let source = parse_one(&symbols, "(def r (+ k 1))");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        assert!(def.opcodes().contains(&PutIndex));
        assert!(matches!(
            env.resolve(&symbols.intern("r")),
            Some(Binding::DefRef(_))
        ));

        // Defs reject set
        let source = parse_one(&symbols, "(set k 9)");
        let err = compile(source, &mut env, &symbols, None).unwrap_err();
        assert_eq!(err.message, "cannot set constant");
        let source = parse_one(&symbols, "(set r 9)");
        let err = compile(source, &mut env, &symbols, None).unwrap_err();
        assert_eq!(err.message, "cannot set constant");
    }

    #[test]
    fn test_local_def_and_destructuring() {
        // Inside a function, def makes a named local
        let def = compile_core_ok("(fn [p] (do (def q p) q))");
        let inner = &def.defs[0];
        assert!(inner.opcodes().contains(&MoveNear), "{}", inner.disassemble());

        // Tuple patterns bind through get-index
        let def = compile_core_ok("(fn [p] (do (def [a b] p) (+ a b)))");
        let inner = &def.defs[0];
        let ops = inner.opcodes();
        assert_eq!(
            ops.iter().filter(|&&op| op == GetIndex).count(),
            2,
            "{}",
            inner.disassemble()
        );

        // Struct patterns bind through get
        let def = compile_core_ok("(fn [p] (do (def {:a a} p) a))");
        assert!(def.defs[0].opcodes().contains(&Get));
    }

    #[test]
    fn test_if_shapes() {
        // Non-constant condition: conditional jump plus join jump
        let def = compile_core_ok("(fn [c] (if c 1 2))");
        let inner = &def.defs[0];
        let ops = inner.opcodes();
        assert!(ops.contains(&JumpIfNot), "{}", inner.disassemble());
        // Both branches return in tail position, so no join jump
        assert_eq!(ops.iter().filter(|&&op| op == Return).count(), 2);

        // Non-tail if keeps a join jump
        let def = compile_core_ok("(fn [c] (+ 1 (if c 1 2)))");
        let inner = &def.defs[0];
        assert!(inner.opcodes().contains(&Jump), "{}", inner.disassemble());

        // Constant conditions fold away the test and the dead branch
        let def = compile_core_ok("(if true 1 2)");
        assert_eq!(def.opcodes(), vec![LoadInteger, Return]);
        let def = compile_core_ok("(if false 1 2)");
        assert_eq!(def.opcodes(), vec![LoadInteger, Return]);
        // The dead branch is still checked for well-formedness
        let err = compile_core("(if true 1 (undefined-sym))").unwrap_err();
        assert_eq!(err.message, "unknown symbol undefined-sym");
    }

    #[test]
    fn test_while_and_break() {
        // Infinite loop: body jump back, break jumps out
        let def = compile_core_ok("(while true (break))");
        assert_eq!(def.opcodes(), vec![Jump, Jump, ReturnNil], "{}", def.disassemble());
        // The break jumps forward past the loop, the loop jumps back
        assert_eq!(field_wide(def.bytecode[0]), 2);
        assert_eq!(field_wide(def.bytecode[1]), -1);

        // Conditioned loop checks and exits
        let def = compile_core_ok("(fn [c] (while c 1))");
        let inner = &def.defs[0];
        let ops = inner.opcodes();
        assert!(ops.contains(&JumpIfNot) && ops.contains(&Jump), "{}", inner.disassemble());

        let err = compile_core("(break)").unwrap_err();
        assert_eq!(err.message, "break outside of a loop");
    }

    #[test]
    fn test_while_closure_becomes_tail_recursive_function() {
        // A closure over the loop variable forces the loop into a
        // tail-recursive immediately-called function
        let def = compile_core_ok("(do (var i 0) (while true (fn [] i)))");
        let while_def = def
            .defs
            .iter()
            .find(|d| d.name.as_deref() == Some("_while"))
            .expect("loop should compile to a _while function");
        let ops = while_def.opcodes();
        assert!(ops.contains(&LoadSelf), "{}", while_def.disassemble());
        assert!(ops.contains(&TailCall), "{}", while_def.disassemble());
        // The loop body's closure lives inside the loop function
        assert_eq!(while_def.defs.len(), 1);
        // And the outer code instantiates and calls the loop closure
        let outer_ops = def.opcodes();
        assert!(outer_ops.contains(&Closure) && outer_ops.contains(&Call));
    }

    #[test]
    fn test_quote_and_quasiquote() {
        // quote yields the literal
        let def = compile_core_ok("'(a b)");
        assert_eq!(def.opcodes(), vec![LoadConstant, Return]);
        assert_eq!(format!("{}", def.constants[0]), "(a b)");

        // quasiquote with no unquotes rebuilds the template structurally
        let def = compile_core_ok("~(a b)");
        assert!(def.opcodes().contains(&MakeTuple));

        // unquote splices compiled code into the template
        let def = compile_core_ok("~(a ,(+ 1 2))");
        let ops = def.opcodes();
        assert!(ops.contains(&Add) && ops.contains(&MakeTuple), "{}", def.disassemble());
        // The template symbol is a constant, not a resolved binding
        assert!(
            def.constants.iter().any(|c| format!("{c}") == "a"),
            "template symbols stay literal"
        );

        // Nested quasiquote protects its unquotes one level deeper
        let def = compile_core_ok("~~(a ,(undefined-sym))");
        assert!(def.opcodes().contains(&MakeTuple));

        // Splice spreads into calls and constructors
        let def = compile_core_ok("~(a ;[1 2])");
        assert!(def.opcodes().contains(&PushArray), "{}", def.disassemble());
        let symbols = SymbolTable::shared();
        let mut env = Environment::new();
        env.register_native(&symbols, "f", Arity::AtLeast(0), |_| Ok(Value::Nil));
        let source = parse_one(&symbols, "(f ;[1 2] 3)");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        assert!(def.opcodes().contains(&PushArray), "{}", def.disassemble());

        // Splice and unquote are rejected outside their context
        let err = compile_core(";x").unwrap_err();
        assert_eq!(
            err.message,
            "splice can only be used in function calls and data constructors"
        );
        let err = compile_core(",x").unwrap_err();
        assert_eq!(err.message, "cannot use unquote outside of quasiquote");
    }

    #[test]
    fn test_data_literals_compile_to_constructors() {
        let cases: Vec<(&str, Opcode)> = vec![
            ("[1 2]", MakeTuple),
            ("@[1 2]", MakeArray),
            ("{:a 1}", MakeStruct),
            ("@{:a 1}", MakeTable),
            ("@\"bytes\"", MakeBuffer),
        ];
        for (i, (src, expected)) in cases.iter().enumerate() {
            let def = compile_core_ok(src);
            assert!(
                def.opcodes().contains(expected),
                "case {i}: {src} should emit {expected:?}\n{}",
                def.disassemble()
            );
        }
        // The empty tuple is a plain constant
        let def = compile_core_ok("()");
        assert_eq!(def.opcodes(), vec![LoadConstant, Return]);
    }

    #[test]
    fn test_macro_expansion() {
        let symbols = SymbolTable::shared();
        let mut env = core_env(&symbols);

        // (twice x) expands to (+ x x)
        let plus = symbols.intern("+");
        let twice = Value::CFunction(NativeFn::new(
            "twice",
            Rc::new(move |args: &[Value]| {
                Ok(Value::tuple_from(vec![
                    Value::Symbol(plus.clone()),
                    args[0].clone(),
                    args[0].clone(),
                ]))
            }),
        ));
        env.define_macro(symbols.intern("twice"), twice);

        let source = parse_one(&symbols, "(twice 21)");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        assert!(def.opcodes().contains(&Add), "{}", def.disassemble());

        // A macro referenced outside call position is an ordinary value
        let source = parse_one(&symbols, "twice");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        assert_eq!(def.opcodes(), vec![LoadConstant, Return]);
    }

    #[test]
    fn test_macro_errors_and_expansion_limit() {
        let symbols = SymbolTable::shared();
        let mut env = core_env(&symbols);

        let boom = Value::CFunction(NativeFn::new(
            "boom",
            Rc::new(|_: &[Value]| Err(crate::Error::EvalError("exploded".into()))),
        ));
        env.define_macro(symbols.intern("boom"), boom);
        let source = parse_one(&symbols, "(boom)");
        let err = compile(source, &mut env, &symbols, None).unwrap_err();
        assert_eq!(err.message, "(macro) exploded");

        // A macro that expands to itself hits the expansion bound
        let loop_sym = symbols.intern("loop-macro");
        let loop_sym_inner = loop_sym.clone();
        let looping = Value::CFunction(NativeFn::new(
            "loop-macro",
            Rc::new(move |_: &[Value]| {
                Ok(Value::tuple_from(vec![Value::Symbol(loop_sym_inner.clone())]))
            }),
        ));
        env.define_macro(loop_sym, looping);
        let source = parse_one(&symbols, "(loop-macro)");
        let err = compile(source, &mut env, &symbols, None).unwrap_err();
        assert_eq!(err.message, "recursed too deeply in macro expansion");
    }

    #[test]
    fn test_unknown_symbol_reports_source_position() {
        let symbols = SymbolTable::shared();
        let mut env = Environment::new();
        let source = parse_one(&symbols, "\n\n  (mystery)");
        let err = compile(source, &mut env, &symbols, Some("test.fern")).unwrap_err();
        assert_eq!(err.message, "unknown symbol mystery");
        assert_eq!((err.line, err.column), (3, 3));
    }

    #[test]
    fn test_first_error_wins() {
        // Both arms are broken; only the first latches
        let err = compile_core("(do (first-missing) (second-missing))").unwrap_err();
        assert_eq!(err.message, "unknown symbol first-missing");
    }

    #[test]
    fn test_recursion_guard() {
        // Deeply nested source trips the recursion guard. The compiler
        // recurses per nesting level up to the guard, so give the test
        // thread generous stack room for unoptimized builds.
        let worker = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| {
                let mut src = String::new();
                for _ in 0..2000 {
                    src.push_str("(+ 1 ");
                }
                src.push('1');
                for _ in 0..2000 {
                    src.push(')');
                }
                compile_core(&src).unwrap_err().message
            })
            .expect("spawn test thread");
        let message = worker.join().expect("deep compile completed");
        assert_eq!(message, "recursed too deeply");
    }

    #[test]
    fn test_constant_pool_dedup() {
        let symbols = SymbolTable::shared();
        let mut env = Environment::new();
        env.register_native(&symbols, "f", Arity::AtLeast(0), |_| Ok(Value::Nil));
        let source = parse_one(&symbols, "(f \"dup\" \"dup\" \"dup\")");
        let def = compile(source, &mut env, &symbols, None).unwrap();
        // One string entry plus the callee
        assert_eq!(def.constants.len(), 2, "{:?}", def.constants);
    }

    #[test]
    fn test_every_instruction_has_a_source_mapping() {
        let def = compile_core_ok("(fn [x]\n  (if x\n    (+ x 1)\n    2))");
        assert_eq!(def.bytecode.len(), def.source_map.len());
        for inner in def.defs.iter() {
            assert_eq!(inner.bytecode.len(), inner.source_map.len());
            // Mapped positions come from the actual source
            assert!(inner.source_map.iter().all(|m| m.line >= 1));
        }
    }

    #[test]
    fn test_funcdef_names_and_source() {
        let def = compile_core_ok("42");
        assert_eq!(def.name.as_deref(), Some("_thunk"));
        assert_eq!(def.source.as_deref(), Some("test"));
    }
}
