//! Intrinsic reductions for calls to known native functions.
//!
//! When a call's callee resolves to a constant slot holding one of the core
//! natives, the call can compile to dedicated instructions instead of an
//! argument push and a call: arithmetic folds pairwise into a target
//! register, `get` chains indexed loads, `error`/`yield` become signals,
//! `apply` pushes its argument array directly. A handler may decline (for
//! example on an unsupported arity), in which case the ordinary call path
//! runs.

use crate::bytecode::Opcode;
use crate::value::Value;

use super::{Compiler, Fopts, FOPTS_TAIL, Slot, SLOT_RETURNED};

pub(crate) type IntrinsicFn =
    for<'a, 'b> fn(&'a mut Compiler<'b>, &'a Fopts, &'a [Slot]) -> Option<Slot>;

pub(crate) struct Intrinsic {
    pub name: &'static str,
    pub compile: IntrinsicFn,
}

/// Look up an intrinsic by the callee's constant value. Native functions
/// are identified by their registered name.
pub(crate) fn find(fun: &Value) -> Option<&'static Intrinsic> {
    let Value::CFunction(nf) = fun else {
        return None;
    };
    INTRINSICS.iter().find(|i| i.name == &*nf.name)
}

type UnaryFn = fn(&mut Compiler, &Fopts, &Slot) -> Slot;

/// `target = leftval op s`
fn generic_sss(c: &mut Compiler, opts: &Fopts, op: Opcode, leftval: Value, s: &Slot) -> Slot {
    let target = c.gettarget(opts);
    let left = Slot::constant(leftval);
    c.emit_sss(op, &target, &left, s, true);
    target
}

/// `target = op s`
fn generic_ss(c: &mut Compiler, opts: &Fopts, op: Opcode, s: &Slot) -> Slot {
    let target = c.gettarget(opts);
    c.emit_ss(op, &target, s, true);
    target
}

/// `target = s op imm`
fn generic_ssu(c: &mut Compiler, opts: &Fopts, op: Opcode, s: &Slot, imm: u8) -> Slot {
    let target = c.gettarget(opts);
    c.emit_ssu(op, &target, s, imm, true);
    target
}

/// Fold a variadic operation pairwise into a target register.
fn opreduce(
    c: &mut Compiler,
    opts: &Fopts,
    args: &[Slot],
    op: Opcode,
    zero_arity: Value,
    unary: Option<UnaryFn>,
) -> Slot {
    match args.len() {
        0 => Slot::constant(zero_arity),
        1 => match unary {
            Some(f) => f(c, opts, &args[0]),
            None => args[0].clone(),
        },
        _ => {
            let target = c.gettarget(opts);
            c.emit_sss(op, &target, &args[0], &args[1], true);
            for arg in &args[2..] {
                let acc = target.clone();
                c.emit_sss(op, &target, &acc, arg, true);
            }
            target
        }
    }
}

fn sub_unary(c: &mut Compiler, opts: &Fopts, s: &Slot) -> Slot {
    generic_sss(c, opts, Opcode::Subtract, Value::Integer(0), s)
}

fn div_unary(c: &mut Compiler, opts: &Fopts, s: &Slot) -> Slot {
    generic_sss(c, opts, Opcode::Divide, Value::Integer(1), s)
}

fn i_add(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    Some(opreduce(c, opts, args, Opcode::Add, Value::Integer(0), None))
}

fn i_sub(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    Some(opreduce(
        c,
        opts,
        args,
        Opcode::Subtract,
        Value::Integer(0),
        Some(sub_unary),
    ))
}

fn i_mul(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    Some(opreduce(
        c,
        opts,
        args,
        Opcode::Multiply,
        Value::Integer(1),
        None,
    ))
}

fn i_div(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    Some(opreduce(
        c,
        opts,
        args,
        Opcode::Divide,
        Value::Integer(1),
        Some(div_unary),
    ))
}

fn i_band(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    Some(opreduce(c, opts, args, Opcode::Band, Value::Integer(-1), None))
}

fn i_bor(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    Some(opreduce(c, opts, args, Opcode::Bor, Value::Integer(0), None))
}

fn i_bxor(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    Some(opreduce(c, opts, args, Opcode::Bxor, Value::Integer(0), None))
}

fn shift(c: &mut Compiler, opts: &Fopts, args: &[Slot], op: Opcode) -> Option<Slot> {
    if args.len() != 2 {
        return None;
    }
    let target = c.gettarget(opts);
    c.emit_sss(op, &target, &args[0], &args[1], true);
    Some(target)
}

fn i_shl(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    shift(c, opts, args, Opcode::ShiftLeft)
}

fn i_shr(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    shift(c, opts, args, Opcode::ShiftRight)
}

fn i_shru(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    shift(c, opts, args, Opcode::ShiftRightUnsigned)
}

fn i_get(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    Some(opreduce(c, opts, args, Opcode::Get, Value::Nil, None))
}

fn i_put(c: &mut Compiler, _opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    if args.len() != 3 {
        return None;
    }
    c.emit_sss(Opcode::Put, &args[0], &args[1], &args[2], false);
    Some(args[0].clone())
}

fn i_length(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    if args.len() != 1 {
        return None;
    }
    Some(generic_ss(c, opts, Opcode::Length, &args[0]))
}

fn i_error(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    if args.len() != 1 {
        return None;
    }
    Some(generic_ssu(c, opts, Opcode::Signal, &args[0], 1))
}

fn i_yield(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    if args.len() > 1 {
        return None;
    }
    let value = args.first().cloned().unwrap_or_else(Slot::nil);
    Some(generic_ssu(c, opts, Opcode::Signal, &value, 3))
}

fn i_resume(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    if args.is_empty() || args.len() > 2 {
        return None;
    }
    let value = args.get(1).cloned().unwrap_or_else(Slot::nil);
    let target = c.gettarget(opts);
    c.emit_sss(Opcode::Resume, &target, &args[0], &value, true);
    Some(target)
}

fn i_apply(c: &mut Compiler, opts: &Fopts, args: &[Slot]) -> Option<Slot> {
    if args.len() != 2 {
        return None;
    }
    // Push phase: the argument array spreads onto the stack
    c.emit_s(Opcode::PushArray, &args[1], false);
    if opts.flags & FOPTS_TAIL != 0 {
        c.emit_s(Opcode::TailCall, &args[0], false);
        let mut ret = Slot::nil();
        ret.flags |= SLOT_RETURNED;
        Some(ret)
    } else {
        let target = c.gettarget(opts);
        c.emit_ss(Opcode::Call, &target, &args[0], true);
        Some(target)
    }
}

static INTRINSICS: &[Intrinsic] = &[
    Intrinsic { name: "+", compile: i_add },
    Intrinsic { name: "-", compile: i_sub },
    Intrinsic { name: "*", compile: i_mul },
    Intrinsic { name: "/", compile: i_div },
    Intrinsic { name: "band", compile: i_band },
    Intrinsic { name: "bor", compile: i_bor },
    Intrinsic { name: "bxor", compile: i_bxor },
    Intrinsic { name: "shl", compile: i_shl },
    Intrinsic { name: "shr", compile: i_shr },
    Intrinsic { name: "shru", compile: i_shru },
    Intrinsic { name: "get", compile: i_get },
    Intrinsic { name: "put", compile: i_put },
    Intrinsic { name: "length", compile: i_length },
    Intrinsic { name: "error", compile: i_error },
    Intrinsic { name: "yield", compile: i_yield },
    Intrinsic { name: "resume", compile: i_resume },
    Intrinsic { name: "apply", compile: i_apply },
];
