//! Environments and the compiler's view of the outside world.
//!
//! An [`Environment`] maps symbols to binding descriptors: immutable `def`s,
//! mutable `var` cells (one-element arrays written through indexed get/put),
//! and macros. Environments chain through a parent pointer, so an embedder
//! can layer a scratch environment over the core bindings.
//!
//! The compiler calls macros through the [`CallVm`] interface rather than a
//! concrete interpreter; [`NativeCaller`] is the batteries-included
//! implementation that can run native functions (which is all the compiler
//! itself ever needs). A real virtual machine implements the same trait to
//! make bytecode-compiled macros callable.

use std::cell::RefCell;
use std::rc::Rc;

use fnv::FnvHashMap;

use crate::Error;
use crate::intern::{Symbol, SymbolTable};
use crate::value::{NativeFn, Value};

/// What a symbol means at the top level.
#[derive(Clone)]
pub enum Binding {
    /// An immutable definition with a compile-time-known value
    Def(Value),
    /// An immutable definition backed by a one-element cell, for top-level
    /// `def`s whose value only exists at run time. Reads go through
    /// `get-index`; `set` rejects it.
    DefRef(Value),
    /// A mutable variable: a one-element cell read and written through
    /// indexed get/put
    Var(Value),
    /// A macro: a callable invoked by the compiler during expansion
    Macro(Value),
}

/// Argument-count contract for a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Range(usize, usize),
}

impl Arity {
    pub fn validate(&self, got: usize) -> Result<(), Error> {
        let ok = match self {
            Arity::Exact(n) => got == *n,
            Arity::AtLeast(n) => got >= *n,
            Arity::Range(lo, hi) => got >= *lo && got <= *hi,
        };
        if ok {
            return Ok(());
        }
        let expected = match self {
            Arity::Exact(n) => n.to_string(),
            Arity::AtLeast(n) => format!("at least {n}"),
            Arity::Range(lo, hi) => format!("{lo} to {hi}"),
        };
        Err(Error::ArityError { expected, got })
    }
}

/// A failed call through the VM interface. Carries the fiber that was
/// executing, when there is one, so compile errors can attach a traceback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message: String,
    pub fiber: Option<Value>,
}

/// The call interface the compiler consumes for macro expansion. The
/// virtual machine implements this; the compiler does not own it.
pub trait CallVm {
    fn call(&mut self, f: &Value, args: &[Value]) -> Result<Value, CallError>;
}

/// A [`CallVm`] that can run native functions only. Compiled functions need
/// a real interpreter and are reported as errors.
#[derive(Default)]
pub struct NativeCaller;

impl CallVm for NativeCaller {
    fn call(&mut self, f: &Value, args: &[Value]) -> Result<Value, CallError> {
        match f {
            Value::CFunction(nf) => nf.call(args).map_err(|e| CallError {
                message: e.to_string(),
                fiber: None,
            }),
            Value::Function(_) => Err(CallError {
                message: "cannot call compiled function without an interpreter".into(),
                fiber: None,
            }),
            other => Err(CallError {
                message: format!("{other} is not callable"),
                fiber: None,
            }),
        }
    }
}

/// A mapping from symbols to bindings, with an optional parent layer.
#[derive(Default)]
pub struct Environment {
    bindings: FnvHashMap<Symbol, Binding>,
    parent: Option<Box<Environment>>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment::default()
    }

    pub fn with_parent(parent: Environment) -> Environment {
        Environment {
            bindings: FnvHashMap::default(),
            parent: Some(Box::new(parent)),
        }
    }

    /// Bind `name` as an immutable definition.
    pub fn define(&mut self, name: Symbol, value: Value) {
        self.bindings.insert(name, Binding::Def(value));
    }

    /// Bind `name` as an immutable definition backed by a reference cell.
    pub fn define_ref(&mut self, name: Symbol, cell: Value) {
        self.bindings.insert(name, Binding::DefRef(cell));
    }

    /// Bind `name` as a mutable variable. Returns the backing cell.
    pub fn define_var(&mut self, name: Symbol, initial: Value) -> Value {
        let cell = Value::Array(Rc::new(RefCell::new(vec![initial])));
        self.bindings.insert(name, Binding::Var(cell.clone()));
        cell
    }

    /// Bind `name` as a macro.
    pub fn define_macro(&mut self, name: Symbol, callable: Value) {
        self.bindings.insert(name, Binding::Macro(callable));
    }

    /// Look `name` up here or in any parent layer.
    pub fn resolve(&self, name: &Symbol) -> Option<&Binding> {
        self.bindings
            .get(name)
            .or_else(|| self.parent.as_ref().and_then(|p| p.resolve(name)))
    }

    /// Register a native function under `name` with arity enforcement.
    ///
    /// The function sees the canonical `&[Value]` argument slice; its errors
    /// surface through macro expansion with the message preserved.
    pub fn register_native(
        &mut self,
        symbols: &SymbolTable,
        name: &str,
        arity: Arity,
        fun: fn(&[Value]) -> Result<Value, Error>,
    ) {
        let value = native_value(name, arity, fun);
        self.define(symbols.intern(name), value);
    }

    /// Register a native function as a macro under `name`.
    pub fn register_native_macro(
        &mut self,
        symbols: &SymbolTable,
        name: &str,
        arity: Arity,
        fun: fn(&[Value]) -> Result<Value, Error>,
    ) {
        let value = native_value(name, arity, fun);
        self.define_macro(symbols.intern(name), value);
    }
}

fn native_value(name: &str, arity: Arity, fun: fn(&[Value]) -> Result<Value, Error>) -> Value {
    let wrapped = move |args: &[Value]| {
        arity.validate(args.len())?;
        fun(args)
    };
    Value::CFunction(NativeFn::new(name, Rc::new(wrapped)))
}

// --- core native functions ---

enum Num {
    Int(i32),
    Real(f64),
}

fn as_num(v: &Value) -> Result<Num, Error> {
    match v {
        Value::Integer(i) => Ok(Num::Int(*i)),
        Value::Real(r) => Ok(Num::Real(*r)),
        other => Err(Error::TypeError(format!("expected number, got {other}"))),
    }
}

fn num_value(n: Num) -> Value {
    match n {
        Num::Int(i) => Value::Integer(i),
        Num::Real(r) => Value::Real(r),
    }
}

/// Fold a binary numeric op over the arguments. Integer overflow promotes
/// to reals rather than wrapping.
fn reduce_numeric(
    args: &[Value],
    identity: i32,
    int_op: fn(i32, i32) -> Option<i32>,
    real_op: fn(f64, f64) -> f64,
) -> Result<Value, Error> {
    let mut acc = match args.len() {
        0 => return Ok(Value::Integer(identity)),
        1 => {
            // Unary folds against the identity: (- x) is 0-x, (/ x) is 1/x
            let acc = fold_one(Num::Int(identity), &args[0], int_op, real_op)?;
            return Ok(num_value(acc));
        }
        _ => as_num(&args[0])?,
    };
    for arg in &args[1..] {
        acc = fold_one(acc, arg, int_op, real_op)?;
    }
    Ok(num_value(acc))
}

fn fold_one(
    acc: Num,
    arg: &Value,
    int_op: fn(i32, i32) -> Option<i32>,
    real_op: fn(f64, f64) -> f64,
) -> Result<Num, Error> {
    let rhs = as_num(arg)?;
    Ok(match (acc, rhs) {
        (Num::Int(a), Num::Int(b)) => match int_op(a, b) {
            Some(c) => Num::Int(c),
            None => Num::Real(real_op(a as f64, b as f64)),
        },
        (a, b) => {
            let a = match a {
                Num::Int(i) => i as f64,
                Num::Real(r) => r,
            };
            let b = match b {
                Num::Int(i) => i as f64,
                Num::Real(r) => r,
            };
            Num::Real(real_op(a, b))
        }
    })
}

fn native_add(args: &[Value]) -> Result<Value, Error> {
    reduce_numeric(args, 0, i32::checked_add, |a, b| a + b)
}

fn native_sub(args: &[Value]) -> Result<Value, Error> {
    reduce_numeric(args, 0, i32::checked_sub, |a, b| a - b)
}

fn native_mul(args: &[Value]) -> Result<Value, Error> {
    reduce_numeric(args, 1, i32::checked_mul, |a, b| a * b)
}

fn native_div(args: &[Value]) -> Result<Value, Error> {
    fn int_div(a: i32, b: i32) -> Option<i32> {
        if b == 0 { None } else { a.checked_div(b) }
    }
    reduce_numeric(args, 1, int_div, |a, b| a / b)
}

fn as_int(v: &Value) -> Result<i32, Error> {
    match v {
        Value::Integer(i) => Ok(*i),
        other => Err(Error::TypeError(format!("expected integer, got {other}"))),
    }
}

fn reduce_bitwise(args: &[Value], identity: i32, op: fn(i32, i32) -> i32) -> Result<Value, Error> {
    let mut acc = identity;
    for arg in args {
        acc = op(acc, as_int(arg)?);
    }
    Ok(Value::Integer(acc))
}

fn native_band(args: &[Value]) -> Result<Value, Error> {
    reduce_bitwise(args, -1, |a, b| a & b)
}

fn native_bor(args: &[Value]) -> Result<Value, Error> {
    reduce_bitwise(args, 0, |a, b| a | b)
}

fn native_bxor(args: &[Value]) -> Result<Value, Error> {
    reduce_bitwise(args, 0, |a, b| a ^ b)
}

fn native_shl(args: &[Value]) -> Result<Value, Error> {
    Ok(Value::Integer(as_int(&args[0])? << (as_int(&args[1])? & 31)))
}

fn native_shr(args: &[Value]) -> Result<Value, Error> {
    Ok(Value::Integer(as_int(&args[0])? >> (as_int(&args[1])? & 31)))
}

fn native_shru(args: &[Value]) -> Result<Value, Error> {
    let a = as_int(&args[0])? as u32;
    Ok(Value::Integer((a >> (as_int(&args[1])? & 31)) as i32))
}

fn native_get(args: &[Value]) -> Result<Value, Error> {
    // Extra keys chain lookups: (get x k1 k2) is (get (get x k1) k2)
    let mut current = args[0].clone();
    for key in &args[1..] {
        current = current.get(key);
    }
    Ok(current)
}

fn native_put(args: &[Value]) -> Result<Value, Error> {
    args[0].put(args[1].clone(), args[2].clone());
    Ok(args[0].clone())
}

fn native_length(args: &[Value]) -> Result<Value, Error> {
    Ok(Value::Integer(args[0].len()))
}

fn native_error(args: &[Value]) -> Result<Value, Error> {
    Err(Error::EvalError(format!("{}", args[0])))
}

fn native_yield(_args: &[Value]) -> Result<Value, Error> {
    Err(Error::EvalError("cannot yield outside a fiber".into()))
}

fn native_resume(_args: &[Value]) -> Result<Value, Error> {
    Err(Error::EvalError("cannot resume without an interpreter".into()))
}

fn native_apply(_args: &[Value]) -> Result<Value, Error> {
    Err(Error::EvalError("cannot apply without an interpreter".into()))
}

/// Build the environment with the core bindings. The arithmetic and data
/// natives registered here are also the ones the compiler knows how to
/// reduce to single instructions when called directly.
pub fn core_env(symbols: &SymbolTable) -> Environment {
    let mut env = Environment::new();
    env.register_native(symbols, "+", Arity::AtLeast(0), native_add);
    env.register_native(symbols, "-", Arity::AtLeast(0), native_sub);
    env.register_native(symbols, "*", Arity::AtLeast(0), native_mul);
    env.register_native(symbols, "/", Arity::AtLeast(0), native_div);
    env.register_native(symbols, "band", Arity::AtLeast(0), native_band);
    env.register_native(symbols, "bor", Arity::AtLeast(0), native_bor);
    env.register_native(symbols, "bxor", Arity::AtLeast(0), native_bxor);
    env.register_native(symbols, "shl", Arity::Exact(2), native_shl);
    env.register_native(symbols, "shr", Arity::Exact(2), native_shr);
    env.register_native(symbols, "shru", Arity::Exact(2), native_shru);
    env.register_native(symbols, "get", Arity::AtLeast(1), native_get);
    env.register_native(symbols, "put", Arity::Exact(3), native_put);
    env.register_native(symbols, "length", Arity::Exact(1), native_length);
    env.register_native(symbols, "error", Arity::Exact(1), native_error);
    env.register_native(symbols, "yield", Arity::Range(0, 1), native_yield);
    env.register_native(symbols, "resume", Arity::Range(1, 2), native_resume);
    env.register_native(symbols, "apply", Arity::AtLeast(1), native_apply);
    env
}
