//! Special-form compilation.
//!
//! Specials bypass macro expansion and compile with built-in semantics.
//! They are the only code that emits branch and upvalue instructions
//! directly, and each handler owns its scope pushes and pops on every exit
//! path, including errors.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::{
    FUNCDEF_FLAG_FIXARITY, FUNCDEF_FLAG_VARARG, Opcode, op0, op1, op2,
};
use crate::intern::Symbol;
use crate::value::{Kind, Value};

use super::scope::{RegTemp, SCOPE_CLOSURE, SCOPE_FUNCTION, SCOPE_TOP, SCOPE_UNUSED};
use super::{
    Compiler, FOPTS_DROP, FOPTS_HINT, FOPTS_TAIL, Fopts, LoopFrame, SLOT_CONSTANT, SLOT_MUTABLE,
    SLOT_NAMED, SLOT_RETURNED, SLOT_SPLICED, Slot,
};

pub(crate) type SpecialFn =
    for<'a, 'b> fn(&'a mut Compiler<'b>, &'a Fopts, &'a [Value]) -> Slot;

pub(crate) struct Special {
    pub name: &'static str,
    pub compile: SpecialFn,
}

// Keep in lexicographic order for the binary search.
static SPECIALS: &[Special] = &[
    Special { name: "break", compile: s_break },
    Special { name: "def", compile: s_def },
    Special { name: "do", compile: s_do },
    Special { name: "fn", compile: s_fn },
    Special { name: "if", compile: s_if },
    Special { name: "quasiquote", compile: s_quasiquote },
    Special { name: "quote", compile: s_quote },
    Special { name: "set", compile: s_set },
    Special { name: "splice", compile: s_splice },
    Special { name: "unquote", compile: s_unquote },
    Special { name: "var", compile: s_var },
    Special { name: "while", compile: s_while },
];

pub(crate) fn find(name: &str) -> Option<&'static Special> {
    SPECIALS
        .binary_search_by(|s| s.name.cmp(name))
        .ok()
        .map(|at| &SPECIALS[at])
}

fn s_quote(c: &mut Compiler, _opts: &Fopts, argv: &[Value]) -> Slot {
    if argv.len() != 1 {
        c.cerror("expected 1 argument");
        return Slot::nil();
    }
    Slot::constant(argv[0].clone())
}

// --- def / var ---

type LeafFn = for<'a, 'b> fn(&'a mut Compiler<'b>, &'a Symbol, Slot) -> bool;

/// Bind a slot to a name in a local scope, copying into a fresh named local
/// first. Returns whether the incoming slot can be freed.
fn name_local(c: &mut Compiler, sym: &Symbol, flags: u32, ret: Slot) -> bool {
    let unnamed_register = ret.flags & SLOT_NAMED == 0 && ret.index > 0 && ret.envindex >= 0;
    let mut ret = ret;
    if !unnamed_register {
        let local = c.farslot();
        c.copy(&local, &ret);
        ret = local;
    }
    ret.flags |= flags;
    c.nameslot(sym.clone(), ret);
    !unnamed_register
}

fn new_cell() -> Value {
    Value::Array(Rc::new(RefCell::new(vec![Value::Nil])))
}

fn def_leaf(c: &mut Compiler, sym: &Symbol, s: Slot) -> bool {
    if c.scopes.last().map(|sc| sc.flags & SCOPE_TOP != 0) == Some(true) {
        if s.flags & SLOT_CONSTANT != 0 {
            // The value is known now; bind it directly
            c.env.define(sym.clone(), s.constant.clone());
        } else {
            // Runtime-only value: bind a cell the chunk writes through
            let cell = new_cell();
            c.env.define_ref(sym.clone(), cell.clone());
            let refslot = Slot::constant(cell);
            c.emit_ssu(Opcode::PutIndex, &refslot, &s, 0, false);
        }
        true
    } else {
        name_local(c, sym, 0, s)
    }
}

fn var_leaf(c: &mut Compiler, sym: &Symbol, s: Slot) -> bool {
    if c.scopes.last().map(|sc| sc.flags & SCOPE_TOP != 0) == Some(true) {
        let cell = c.env.define_var(sym.clone(), Value::Nil);
        let refslot = Slot::constant(cell);
        c.emit_ssu(Opcode::PutIndex, &refslot, &s, 0, false);
        true
    } else {
        name_local(c, sym, SLOT_MUTABLE, s)
    }
}

/// Bind a pattern against a slot: symbols are leaves, tuples and arrays
/// bind element-wise through indexed gets, structs and tables bind through
/// keyed gets. Returns whether `right` can be freed.
fn destructure(c: &mut Compiler, left: &Value, right: Slot, leaf: LeafFn) -> bool {
    match left {
        Value::Symbol(sym) => {
            let sym = sym.clone();
            leaf(c, &sym, right)
        }
        Value::Tuple(_) | Value::Array(_) => {
            let items: Vec<Value> = match left {
                Value::Tuple(t) => t.items().to_vec(),
                Value::Array(a) => a.borrow().clone(),
                _ => unreachable!(),
            };
            for (i, sub) in items.iter().enumerate() {
                let nextright = c.farslot();
                if i < 0x100 {
                    c.emit_ssu(Opcode::GetIndex, &nextright, &right, i as u8, true);
                } else {
                    let key = Slot::constant(Value::Integer(i as i32));
                    c.emit_sss(Opcode::Get, &nextright, &right, &key, true);
                }
                if destructure(c, sub, nextright.clone(), leaf) {
                    c.freeslot(&nextright);
                }
            }
            true
        }
        Value::Struct(_) | Value::Table(_) => {
            let pairs: Vec<(Value, Value)> = match left {
                Value::Struct(s) => s.entries().to_vec(),
                Value::Table(t) => {
                    let mut pairs: Vec<(Value, Value)> = t
                        .borrow()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    pairs.sort_by(|a, b| a.0.cmp(&b.0));
                    pairs
                }
                _ => unreachable!(),
            };
            for (key, pattern) in pairs {
                let nextright = c.farslot();
                let dopts = c.fopts_default();
                let keyslot = c.value(dopts, key);
                c.emit_sss(Opcode::Get, &nextright, &right, &keyslot, true);
                if destructure(c, &pattern, nextright.clone(), leaf) {
                    c.freeslot(&nextright);
                }
            }
            true
        }
        _ => {
            c.cerror("unexpected type in destructuring");
            true
        }
    }
}

/// Validate binding metadata (docstrings and flag symbols between the name
/// and the value). The metadata itself is not retained.
fn check_attributes(c: &mut Compiler, argv: &[Value]) {
    for attr in &argv[1..argv.len() - 1] {
        match attr {
            Value::Symbol(_) | Value::Keyword(_) | Value::String(_) => {}
            _ => c.cerror("could not add metadata to binding"),
        }
    }
}

/// Shared head of def and var: compile the value expression (the last
/// argument) without tail or drop semantics.
fn do_head(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Option<(Value, Slot)> {
    if argv.len() < 2 {
        c.cerror("expected at least 2 arguments");
        return None;
    }
    let head = argv[0].clone();
    let mut subopts = c.fopts_default();
    subopts.flags = opts.flags & !(FOPTS_TAIL | FOPTS_DROP);
    subopts.hint = opts.hint.clone();
    let ret = c.value(subopts, argv[argv.len() - 1].clone());
    Some((head, ret))
}

fn s_def(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Slot {
    let mut opts = opts.clone();
    opts.flags &= !FOPTS_HINT;
    let Some((head, ret)) = do_head(c, &opts, argv) else {
        return Slot::nil();
    };
    check_attributes(c, argv);
    if c.error.is_some() {
        return Slot::nil();
    }
    if destructure(c, &head, ret.clone(), def_leaf) {
        c.freeslot(&ret);
    }
    Slot::nil()
}

fn s_var(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Slot {
    let Some((head, ret)) = do_head(c, opts, argv) else {
        return Slot::nil();
    };
    check_attributes(c, argv);
    if c.error.is_some() {
        return Slot::nil();
    }
    if destructure(c, &head, ret.clone(), var_leaf) {
        c.freeslot(&ret);
    }
    Slot::nil()
}

fn s_set(c: &mut Compiler, _opts: &Fopts, argv: &[Value]) -> Slot {
    if argv.len() != 2 {
        c.cerror("expected 2 arguments");
        return Slot::nil();
    }
    match &argv[0] {
        Value::Symbol(sym) => {
            let sym = sym.clone();
            let dest = c.resolve(&sym);
            if dest.flags & SLOT_MUTABLE == 0 {
                c.cerror("cannot set constant");
                return Slot::nil();
            }
            let mut subopts = c.fopts_default();
            subopts.flags |= FOPTS_HINT;
            subopts.hint = dest.clone();
            let ret = c.value(subopts, argv[1].clone());
            c.copy(&dest, &ret);
            ret
        }
        Value::Tuple(form) if !form.bracketed() && form.len() == 2 => {
            // (set (ds key) value) writes an indexed place
            let subopts = c.fopts_default();
            let ds = c.value(subopts.clone(), form.items()[0].clone());
            let key = c.value(subopts.clone(), form.items()[1].clone());
            let value = c.value(subopts, argv[1].clone());
            c.emit_sss(Opcode::Put, &ds, &key, &value, false);
            c.freeslot(&key);
            c.freeslot(&ds);
            value
        }
        _ => {
            c.cerror("expected symbol or indexed place");
            Slot::nil()
        }
    }
}

// --- control flow ---

/*
 * :condition
 * ...
 * jump-if-not condition :right
 * :left
 * ...
 * jump done (only if not tail)
 * :right
 * ...
 * :done
 */
fn s_if(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Slot {
    if argv.len() < 2 || argv.len() > 3 {
        c.cerror("expected 2 or 3 arguments to if");
        return Slot::nil();
    }
    let truebody = argv[1].clone();
    let falsebody = argv.get(2).cloned().unwrap_or(Value::Nil);
    let tail = opts.flags & FOPTS_TAIL != 0;
    let drop = opts.flags & FOPTS_DROP != 0;

    let condopts = c.fopts_default();
    let bodyopts = opts.clone();
    let target = if drop || tail {
        Slot::nil()
    } else {
        c.gettarget(opts)
    };

    c.pushscope(0, "if");
    let cond = c.value(condopts, argv[0].clone());

    // A constant condition picks its branch now; the dead branch still
    // compiles for well-formedness but its code is discarded
    if cond.flags & SLOT_CONSTANT != 0 {
        let (live, dead) = if cond.constant.is_truthy() {
            (truebody, falsebody)
        } else {
            (falsebody, truebody)
        };
        c.pushscope(0, "if-body");
        let picked = c.value(bodyopts.clone(), live);
        c.popscope();
        c.popscope_keepslot(&picked);
        c.throwaway(bodyopts, &dead);
        return picked;
    }

    let labeljr = c.emit_si(Opcode::JumpIfNot, &cond, 0, false);

    c.pushscope(0, "if-true");
    let left = c.value(bodyopts.clone(), truebody);
    if !drop && !tail {
        c.copy(&target, &left);
    }
    c.popscope();

    let labeljd = c.buffer.len();
    if !tail {
        c.emit(op0(Opcode::Jump));
    }

    let labelr = c.buffer.len();
    c.pushscope(0, "if-false");
    let right = c.value(bodyopts, falsebody);
    if !drop && !tail {
        c.copy(&target, &right);
    }
    c.popscope();

    c.popscope();

    let labeld = c.buffer.len();
    c.patch_cond_jump(labeljr, labelr);
    if !tail {
        c.patch_jump(labeljd, labeld);
    }

    let mut target = target;
    if tail {
        target.flags |= SLOT_RETURNED;
    }
    target
}

/// Sequence; the value is the last expression's.
fn s_do(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Slot {
    let mut ret = Slot::nil();
    c.pushscope(0, "do");
    for (i, arg) in argv.iter().enumerate() {
        let subopts = if i != argv.len() - 1 {
            let mut subopts = c.fopts_default();
            subopts.flags |= FOPTS_DROP;
            subopts
        } else {
            opts.clone()
        };
        ret = c.value(subopts, arg.clone());
        if i != argv.len() - 1 {
            c.freeslot(&ret);
        }
    }
    c.popscope_keepslot(&ret);
    ret
}

/*
 * :whiletop
 * :condition
 * jump-if-not cond :done
 * ...
 * jump :whiletop
 * :done
 */
fn s_while(c: &mut Compiler, _opts: &Fopts, argv: &[Value]) -> Slot {
    if argv.len() < 2 {
        c.cerror("expected at least 2 arguments");
        return Slot::nil();
    }

    let labelwt = c.buffer.len();
    c.pushscope(0, "while");

    let condopts = c.fopts_default();
    let cond = c.value(condopts, argv[0].clone());

    let mut infinite = false;
    if cond.flags & SLOT_CONSTANT != 0 {
        if !cond.constant.is_truthy() {
            // The loop never executes
            c.popscope();
            return Slot::nil();
        }
        infinite = true;
    }

    let labelc = if infinite {
        0
    } else {
        c.emit_si(Opcode::JumpIfNot, &cond, 0, false)
    };

    c.loops.push(LoopFrame {
        break_jumps: Vec::new(),
        is_tail_iife: false,
    });
    for arg in &argv[1..] {
        let mut subopts = c.fopts_default();
        subopts.flags |= FOPTS_DROP;
        let s = c.value(subopts, arg.clone());
        c.freeslot(&s);
    }
    let loop_frame = c.loops.pop().expect("loop frame pushed above");

    // If the body created a closure, locals may escape an iteration; the
    // loop is recompiled as a tail-recursive immediately-called function
    if c.scope_mut().flags & SCOPE_CLOSURE != 0 {
        c.scope_mut().flags |= SCOPE_UNUSED;
        c.popscope();
        c.buffer.truncate(labelwt);
        c.mapbuffer.truncate(labelwt);
        drop(loop_frame);

        c.pushscope(SCOPE_FUNCTION, "while-iife");
        let condopts = c.fopts_default();
        let cond = c.value(condopts, argv[0].clone());
        if cond.flags & SLOT_CONSTANT == 0 {
            // Condition false: return nil out of the loop function
            c.emit_si(Opcode::JumpIf, &cond, 2, false);
            c.emit(op0(Opcode::ReturnNil));
        }
        c.loops.push(LoopFrame {
            break_jumps: Vec::new(),
            is_tail_iife: true,
        });
        for arg in &argv[1..] {
            let mut subopts = c.fopts_default();
            subopts.flags |= FOPTS_DROP;
            let s = c.value(subopts, arg.clone());
            c.freeslot(&s);
        }
        c.loops.pop();

        let tempself = c.scope_mut().ra.temp(RegTemp::Temp0);
        c.emit(op1(Opcode::LoadSelf, tempself as u32));
        c.emit(op1(Opcode::TailCall, tempself as u32));
        let mut def = c.pop_funcdef();
        def.name = Some(Rc::from("_while"));
        let defindex = c.add_funcdef(Rc::new(def));

        // Instantiate and call the loop closure here
        let cloreg = c.scope_mut().ra.temp(RegTemp::Temp0);
        c.emit(op2(Opcode::Closure, cloreg as u32, defindex as u32));
        c.emit(op2(Opcode::Call, cloreg as u32, cloreg as u32));
        c.scope_mut().ra.free_temp(cloreg, RegTemp::Temp0);
        c.scope_mut().flags |= SCOPE_CLOSURE;
        return Slot::nil();
    }

    let labeljt = c.buffer.len();
    c.emit(op0(Opcode::Jump));
    let labeld = c.buffer.len();
    if !infinite {
        c.patch_cond_jump(labelc, labeld);
    }
    c.patch_jump(labeljt, labelwt);
    for jump in loop_frame.break_jumps {
        c.patch_jump(jump, labeld);
    }
    c.popscope();
    Slot::nil()
}

/// Exit the enclosing loop. Inside the tail-call loop transform this
/// returns nil from the loop function instead of jumping.
fn s_break(c: &mut Compiler, _opts: &Fopts, argv: &[Value]) -> Slot {
    if argv.len() > 1 {
        c.cerror("expected at most 1 argument");
        return Slot::nil();
    }
    if let Some(value) = argv.first() {
        let mut subopts = c.fopts_default();
        subopts.flags |= FOPTS_DROP;
        let s = c.value(subopts, value.clone());
        c.freeslot(&s);
    }
    let Some(is_iife) = c.loops.last().map(|frame| frame.is_tail_iife) else {
        c.cerror("break outside of a loop");
        return Slot::nil();
    };
    if is_iife {
        c.emit(op0(Opcode::ReturnNil));
    } else {
        let label = c.buffer.len();
        c.emit(op0(Opcode::Jump));
        c.loops
            .last_mut()
            .expect("loop frame exists")
            .break_jumps
            .push(label);
    }
    Slot::nil()
}

// --- functions ---

fn s_fn(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Slot {
    c.scope_mut().flags |= SCOPE_CLOSURE;
    c.pushscope(SCOPE_FUNCTION, "function");
    // Enclosing loops are not breakable from inside the function body
    let outer_loops = std::mem::take(&mut c.loops);
    let ret = match fn_inner(c, opts, argv) {
        Ok(slot) => slot,
        Err(msg) => {
            if !msg.is_empty() {
                c.cerror(msg);
            }
            c.popscope();
            Slot::nil()
        }
    };
    c.loops = outer_loops;
    ret
}

fn fn_inner(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Result<Slot, &'static str> {
    if argv.len() < 2 {
        return Err("expected at least 2 arguments to function literal");
    }

    // An optional leading symbol names the function for self-reference
    let selfref = matches!(&argv[0], Value::Symbol(_));
    let parami = usize::from(selfref);
    if parami >= argv.len() {
        return Err("expected function parameters");
    }
    let (params, fixarity): (Vec<Value>, bool) = match &argv[parami] {
        Value::Tuple(t) => (t.items().to_vec(), true),
        Value::Array(a) => (a.borrow().clone(), false),
        _ => return Err("expected function parameters"),
    };

    let mut arity: i32 = 0;
    let mut varargs = false;
    for (i, param) in params.iter().enumerate() {
        if let Value::Symbol(sym) = param {
            if sym.text() == "&" {
                if i + 2 != params.len() {
                    return Err("variable argument symbol in unexpected location");
                }
                varargs = true;
                arity -= 1;
                continue;
            }
            let slot = c.farslot();
            c.nameslot(sym.clone(), slot);
        } else {
            let slot = c.farslot();
            destructure(c, param, slot, def_leaf);
        }
        arity += 1;
    }

    if selfref {
        let Value::Symbol(head) = &argv[0] else {
            unreachable!("selfref implies a symbol head")
        };
        let head = head.clone();
        let mut slot = c.farslot();
        slot.flags = SLOT_NAMED | (1u32 << Kind::Function as u8);
        c.emit_s(Opcode::LoadSelf, &slot, true);
        c.nameslot(head, slot);
    }

    if parami + 1 == argv.len() {
        c.emit(op0(Opcode::ReturnNil));
    } else {
        for (i, body) in argv[parami + 1..].iter().enumerate() {
            let last = parami + 1 + i == argv.len() - 1;
            let mut subopts = c.fopts_default();
            subopts.flags |= if last { FOPTS_TAIL } else { FOPTS_DROP };
            c.value(subopts, body.clone());
            if c.error.is_some() {
                // Already latched; unwind the function scope
                return Err("");
            }
        }
    }

    let mut def = c.pop_funcdef();
    def.arity = arity;
    if varargs {
        def.flags |= FUNCDEF_FLAG_VARARG;
    } else if fixarity {
        def.flags |= FUNCDEF_FLAG_FIXARITY;
    }
    if selfref && let Value::Symbol(head) = &argv[0] {
        def.name = Some(head.as_rc().clone());
    }
    // Argument copying needs at least arity slots even for a trivial body
    if arity + i32::from(varargs) > def.slot_count {
        def.slot_count = arity + i32::from(varargs);
    }
    let defindex = c.add_funcdef(Rc::new(def));

    let target = c.gettarget(opts);
    c.emit_su(Opcode::Closure, &target, defindex as u16, true);
    Ok(target)
}

// --- templates ---

/// Match `(head x)` two-element call-shaped tuples.
fn tagged_form(x: &Value, head_name: &str) -> Option<Value> {
    let Value::Tuple(t) = x else { return None };
    if t.bracketed() || t.len() != 2 {
        return None;
    }
    let Value::Symbol(head) = &t.items()[0] else {
        return None;
    };
    if head.text() == head_name {
        Some(t.items()[1].clone())
    } else {
        None
    }
}

/// Compile one template element, honoring splices at unquoting depth.
fn qq_element(c: &mut Compiler, x: &Value, depth: i32) -> Slot {
    if depth == 1
        && let Some(inner) = tagged_form(x, "splice")
    {
        let subopts = c.fopts_default();
        let mut s = c.value(subopts, inner);
        s.flags |= SLOT_SPLICED;
        return s;
    }
    let opts = c.fopts_default();
    qq(c, &opts, x, depth)
}

fn qq_seq(c: &mut Compiler, opts: &Fopts, items: &[Value], depth: i32, op: Opcode) -> Slot {
    let slots: Vec<Slot> = items.iter().map(|it| qq_element(c, it, depth)).collect();
    c.maker(opts, slots, op)
}

fn qq_pairs(
    c: &mut Compiler,
    opts: &Fopts,
    pairs: Vec<(Value, Value)>,
    depth: i32,
    op: Opcode,
) -> Slot {
    let mut slots = Vec::with_capacity(pairs.len() * 2);
    for (k, v) in pairs {
        slots.push(qq_element(c, &k, depth));
        slots.push(qq_element(c, &v, depth));
    }
    c.maker(opts, slots, op)
}

/// Compile a quasiquote template. `depth` counts enclosing quasiquotes;
/// an unquote at depth 1 compiles its argument as code, and containers
/// rebuild through constructor instructions so unquoted pieces slot in.
fn qq(c: &mut Compiler, opts: &Fopts, x: &Value, depth: i32) -> Slot {
    match x {
        Value::Tuple(t) if !t.is_empty() => {
            if let Some(inner) = tagged_form(x, "unquote") {
                if depth == 1 {
                    let subopts = c.fopts_default();
                    return c.value(subopts, inner);
                }
                return qq_seq(c, opts, t.items(), depth - 1, Opcode::MakeTuple);
            }
            if tagged_form(x, "quasiquote").is_some() {
                return qq_seq(c, opts, t.items(), depth + 1, Opcode::MakeTuple);
            }
            qq_seq(c, opts, t.items(), depth, Opcode::MakeTuple)
        }
        Value::Array(a) => {
            let items = a.borrow().clone();
            qq_seq(c, opts, &items, depth, Opcode::MakeArray)
        }
        Value::Struct(s) => qq_pairs(c, opts, s.entries().to_vec(), depth, Opcode::MakeStruct),
        Value::Table(t) => {
            let mut pairs: Vec<(Value, Value)> = t
                .borrow()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            qq_pairs(c, opts, pairs, depth, Opcode::MakeTable)
        }
        // Leaves (and the empty tuple) are themselves
        _ => Slot::constant(x.clone()),
    }
}

fn s_quasiquote(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Slot {
    if argv.len() != 1 {
        c.cerror("expected 1 argument");
        return Slot::nil();
    }
    qq(c, opts, &argv[0], 1)
}

fn s_unquote(c: &mut Compiler, _opts: &Fopts, _argv: &[Value]) -> Slot {
    c.cerror("cannot use unquote outside of quasiquote");
    Slot::nil()
}

fn s_splice(c: &mut Compiler, opts: &Fopts, argv: &[Value]) -> Slot {
    if opts.flags & super::FOPTS_ACCEPT_SPLICE == 0 {
        c.cerror("splice can only be used in function calls and data constructors");
        return Slot::nil();
    }
    if argv.len() != 1 {
        c.cerror("expected 1 argument");
        return Slot::nil();
    }
    let subopts = c.fopts_default();
    let mut s = c.value(subopts, argv[0].clone());
    s.flags |= SLOT_SPLICED;
    s
}
