//! The value model shared by the reader, the compiler and the runtime.
//!
//! [`Value`] is a tagged sum over every kind the language knows about.
//! Equality is structural for strings, identifiers, tuples, structs and
//! numbers, and reference identity for mutable containers and opaque types.
//! Ordering is total across all kinds: comparisons between different kinds
//! fall back to a fixed kind order, and NaN sorts below every other real so
//! the order stays total.
//!
//! Mutable containers are cheap shared handles (`Rc<RefCell<..>>`); cloning a
//! `Value` never deep-copies.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use fnv::{FnvHashMap, FnvHasher};

use crate::Error;
use crate::intern::Symbol;

/// The kinds of values, in comparison order. Cross-kind comparisons are
/// decided by this order alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Nil,
    False,
    True,
    Fiber,
    Integer,
    Real,
    String,
    Symbol,
    Keyword,
    Array,
    Tuple,
    Table,
    Struct,
    Buffer,
    Function,
    CFunction,
    Abstract,
}

/// A mutable table handle. Keys are arbitrary values; nil keys are rejected
/// at the construction sites that care.
pub type TableRef = Rc<RefCell<FnvHashMap<Value, Value>>>;

/// A mutable array handle.
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

/// A mutable byte buffer handle.
pub type BufferRef = Rc<RefCell<Vec<u8>>>;

#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    /// Immutable byte string. Not required to be valid UTF-8.
    String(Rc<[u8]>),
    Symbol(Symbol),
    Keyword(Symbol),
    Array(ArrayRef),
    Tuple(Rc<Tuple>),
    Table(TableRef),
    Struct(Rc<StructMap>),
    Buffer(BufferRef),
    Function(Rc<Function>),
    CFunction(NativeFn),
    Fiber(Rc<Fiber>),
    Abstract(Rc<AbstractValue>),
}

/// An immutable ordered sequence of values.
///
/// Tuples carry the source line/column of their opening delimiter when they
/// came from the reader (zero otherwise), and cache their hash after the
/// first computation: zero means "unset" and is filled lazily.
pub struct Tuple {
    items: Box<[Value]>,
    hash: Cell<u32>,
    line: i32,
    column: i32,
    bracketed: bool,
}

impl Tuple {
    pub fn new(items: Vec<Value>) -> Tuple {
        Tuple::with_source(items, 0, 0, false)
    }

    pub fn with_source(items: Vec<Value>, line: i32, column: i32, bracketed: bool) -> Tuple {
        Tuple {
            items: items.into_boxed_slice(),
            hash: Cell::new(0),
            line,
            column,
            bracketed,
        }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Source line of the opening delimiter, or 0 when unknown.
    pub fn line(&self) -> i32 {
        self.line
    }

    /// Source column of the opening delimiter, or 0 when unknown.
    pub fn column(&self) -> i32 {
        self.column
    }

    /// True for tuples read with square brackets. The compiler turns these
    /// into tuple constructors instead of function calls.
    pub fn bracketed(&self) -> bool {
        self.bracketed
    }

    pub(crate) fn cached_hash(&self) -> u32 {
        let cached = self.hash.get();
        if cached != 0 {
            return cached;
        }
        let mut hasher = FnvHasher::default();
        for item in self.items.iter() {
            hasher.write_u32(item.hash32());
        }
        let mut h = hasher.finish() as u32;
        if h == 0 {
            h = 1;
        }
        self.hash.set(h);
        h
    }
}

/// An immutable map with deterministic entry order.
///
/// Entries are kept sorted by the total value order, so structurally equal
/// structs have identical layouts and equality/ordering lift entry-wise.
pub struct StructMap {
    entries: Box<[(Value, Value)]>,
    hash: Cell<u32>,
    line: i32,
    column: i32,
}

impl StructMap {
    pub fn new(pairs: Vec<(Value, Value)>) -> StructMap {
        StructMap::with_source(pairs, 0, 0)
    }

    pub fn with_source(pairs: Vec<(Value, Value)>, line: i32, column: i32) -> StructMap {
        let mut entries: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            if matches!(key, Value::Nil) {
                continue;
            }
            match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(at) => entries[at] = (key, value),
                Err(at) => entries.insert(at, (key, value)),
            }
        }
        StructMap {
            entries: entries.into_boxed_slice(),
            hash: Cell::new(0),
            line,
            column,
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|at| &self.entries[at].1)
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn line(&self) -> i32 {
        self.line
    }

    pub fn column(&self) -> i32 {
        self.column
    }

    pub(crate) fn cached_hash(&self) -> u32 {
        let cached = self.hash.get();
        if cached != 0 {
            return cached;
        }
        let mut hasher = FnvHasher::default();
        for (k, v) in self.entries.iter() {
            hasher.write_u32(k.hash32());
            hasher.write_u32(v.hash32());
        }
        let mut h = hasher.finish() as u32;
        if h == 0 {
            h = 1;
        }
        self.hash.set(h);
        h
    }
}

/// A compiled function value. Closure instantiation (pairing a definition
/// with captured environments) is the interpreter's concern; the compiler
/// only ever reads the definition.
pub struct Function {
    pub def: Rc<crate::bytecode::FuncDef>,
}

/// A native function registered in an environment.
///
/// Identity is the registered name, not the function pointer, so natives
/// compare and deduplicate predictably.
#[derive(Clone)]
pub struct NativeFn {
    pub name: Rc<str>,
    pub fun: Rc<dyn Fn(&[Value]) -> Result<Value, Error>>,
}

impl NativeFn {
    pub fn new(name: &str, fun: Rc<dyn Fn(&[Value]) -> Result<Value, Error>>) -> NativeFn {
        NativeFn {
            name: Rc::from(name),
            fun,
        }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, Error> {
        (self.fun)(args)
    }
}

/// A suspended execution context, produced by the virtual machine. The core
/// only carries fibers around (most notably on macro errors, for tracebacks);
/// it never runs them.
pub struct Fiber {
    /// Call trace captured when the fiber stopped, innermost frame first.
    pub trace: Vec<TraceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub name: Option<Rc<str>>,
    pub line: i32,
    pub column: i32,
}

/// An opaque host value with reference identity.
pub struct AbstractValue {
    pub type_name: &'static str,
    pub data: Rc<dyn Any>,
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Nil => Kind::Nil,
            Value::Boolean(false) => Kind::False,
            Value::Boolean(true) => Kind::True,
            Value::Fiber(_) => Kind::Fiber,
            Value::Integer(_) => Kind::Integer,
            Value::Real(_) => Kind::Real,
            Value::String(_) => Kind::String,
            Value::Symbol(_) => Kind::Symbol,
            Value::Keyword(_) => Kind::Keyword,
            Value::Array(_) => Kind::Array,
            Value::Tuple(_) => Kind::Tuple,
            Value::Table(_) => Kind::Table,
            Value::Struct(_) => Kind::Struct,
            Value::Buffer(_) => Kind::Buffer,
            Value::Function(_) => Kind::Function,
            Value::CFunction(_) => Kind::CFunction,
            Value::Abstract(_) => Kind::Abstract,
        }
    }

    /// Everything is truthy except nil and false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn string(text: &str) -> Value {
        Value::String(Rc::from(text.as_bytes()))
    }

    pub fn string_from_bytes(bytes: &[u8]) -> Value {
        Value::String(Rc::from(bytes))
    }

    pub fn tuple_from(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(Tuple::new(items)))
    }

    pub fn array_from(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn buffer_from(bytes: &[u8]) -> Value {
        Value::Buffer(Rc::new(RefCell::new(bytes.to_vec())))
    }

    pub fn struct_from(pairs: Vec<(Value, Value)>) -> Value {
        Value::Struct(Rc::new(StructMap::new(pairs)))
    }

    pub fn table_from(pairs: Vec<(Value, Value)>) -> Value {
        let mut map = FnvHashMap::default();
        for (k, v) in pairs {
            if matches!(k, Value::Nil) {
                continue;
            }
            map.insert(k, v);
        }
        Value::Table(Rc::new(RefCell::new(map)))
    }

    /// Length of a string-like or container value, 0 for everything else.
    pub fn len(&self) -> i32 {
        match self {
            Value::String(s) => s.len() as i32,
            Value::Symbol(s) | Value::Keyword(s) => s.text().len() as i32,
            Value::Array(a) => a.borrow().len() as i32,
            Value::Buffer(b) => b.borrow().len() as i32,
            Value::Tuple(t) => t.len() as i32,
            Value::Struct(s) => s.len() as i32,
            Value::Table(t) => t.borrow().len() as i32,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look a key up in an associative or indexed value. Invalid data
    /// structures and missing keys give nil.
    pub fn get(&self, key: &Value) -> Value {
        match self {
            Value::Array(a) => {
                if let Value::Integer(i) = key
                    && *i >= 0
                    && let Some(v) = a.borrow().get(*i as usize)
                {
                    return v.clone();
                }
                Value::Nil
            }
            Value::Tuple(t) => {
                if let Value::Integer(i) = key
                    && *i >= 0
                    && let Some(v) = t.items().get(*i as usize)
                {
                    return v.clone();
                }
                Value::Nil
            }
            Value::Buffer(b) => {
                if let Value::Integer(i) = key
                    && *i >= 0
                    && let Some(byte) = b.borrow().get(*i as usize)
                {
                    return Value::Integer(*byte as i32);
                }
                Value::Nil
            }
            Value::String(s) => {
                if let Value::Integer(i) = key
                    && *i >= 0
                    && let Some(byte) = s.get(*i as usize)
                {
                    return Value::Integer(*byte as i32);
                }
                Value::Nil
            }
            Value::Struct(s) => s.get(key).cloned().unwrap_or(Value::Nil),
            Value::Table(t) => t.borrow().get(key).cloned().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    /// Write a key into a mutable associative or indexed value. Writes to
    /// immutable or non-indexable values are ignored, as are out-of-domain
    /// keys. Arrays and buffers grow as needed.
    pub fn put(&self, key: Value, value: Value) {
        match self {
            Value::Array(a) => {
                let Value::Integer(i) = key else { return };
                if i < 0 || i == i32::MAX {
                    return;
                }
                let index = i as usize;
                let mut items = a.borrow_mut();
                if index >= items.len() {
                    items.resize(index + 1, Value::Nil);
                }
                items[index] = value;
            }
            Value::Buffer(b) => {
                let Value::Integer(i) = key else { return };
                let Value::Integer(byte) = value else { return };
                if i < 0 || i == i32::MAX {
                    return;
                }
                let index = i as usize;
                let mut bytes = b.borrow_mut();
                if index >= bytes.len() {
                    bytes.resize(index + 1, 0);
                }
                bytes[index] = (byte & 0xFF) as u8;
            }
            Value::Table(t) => {
                if matches!(key, Value::Nil) {
                    return;
                }
                t.borrow_mut().insert(key, value);
            }
            _ => {}
        }
    }

    /// The raw text of a value: string and buffer contents pass through
    /// unquoted, identifiers give their text, everything else its printed
    /// form. This is what string coercion means at the reader boundary.
    pub fn to_text_bytes(&self) -> Vec<u8> {
        match self {
            Value::String(s) => s.to_vec(),
            Value::Buffer(b) => b.borrow().clone(),
            Value::Symbol(s) | Value::Keyword(s) => s.text().as_bytes().to_vec(),
            other => format!("{other}").into_bytes(),
        }
    }

    /// A 32-bit structural hash, consistent with `==`.
    pub(crate) fn hash32(&self) -> u32 {
        fn bytes_hash(bytes: &[u8]) -> u32 {
            let mut hasher = FnvHasher::default();
            hasher.write(bytes);
            hasher.finish() as u32
        }
        fn pointer_hash(p: usize) -> u32 {
            ((p >> 3) as u32) ^ ((p as u64 >> 32) as u32)
        }
        match self {
            Value::Nil => 0,
            Value::Boolean(false) => 1,
            Value::Boolean(true) => 2,
            Value::Integer(i) => *i as u32,
            Value::Real(r) => {
                // Canonicalize NaN and -0.0 so equal reals hash alike
                let bits = if r.is_nan() {
                    f64::NAN.to_bits()
                } else if *r == 0.0 {
                    0
                } else {
                    r.to_bits()
                };
                ((bits >> 32) as u32) ^ (bits as u32)
            }
            Value::String(s) => bytes_hash(s),
            Value::Symbol(s) | Value::Keyword(s) => bytes_hash(s.text().as_bytes()),
            Value::Tuple(t) => t.cached_hash(),
            Value::Struct(s) => s.cached_hash(),
            Value::Array(a) => pointer_hash(Rc::as_ptr(a) as usize),
            Value::Table(t) => pointer_hash(Rc::as_ptr(t) as usize),
            Value::Buffer(b) => pointer_hash(Rc::as_ptr(b) as usize),
            Value::Function(f) => pointer_hash(Rc::as_ptr(f) as usize),
            Value::CFunction(nf) => bytes_hash(nf.name.as_bytes()),
            Value::Fiber(f) => pointer_hash(Rc::as_ptr(f) as usize),
            Value::Abstract(a) => pointer_hash(Rc::as_ptr(a) as usize),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            // NaN equals NaN so equality stays consistent with the total order
            (Value::Real(a), Value::Real(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => {
                Rc::ptr_eq(a, b)
                    || (a.cached_hash() == b.cached_hash() && a.items() == b.items())
            }
            (Value::Struct(a), Value::Struct(b)) => {
                Rc::ptr_eq(a, b) || a.entries() == b.entries()
            }
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Buffer(a), Value::Buffer(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::CFunction(a), Value::CFunction(b)) => a.name == b.name,
            (Value::Fiber(a), Value::Fiber(b)) => Rc::ptr_eq(a, b),
            (Value::Abstract(a), Value::Abstract(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.kind() as u8);
        state.write_u32(self.hash32());
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        fn real_cmp(a: f64, b: f64) -> Ordering {
            // NaNs sort below all reals; two NaNs are equal
            match (a.is_nan(), b.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            }
        }
        fn pointer_cmp<T>(a: &Rc<T>, b: &Rc<T>) -> Ordering {
            (Rc::as_ptr(a) as usize).cmp(&(Rc::as_ptr(b) as usize))
        }
        let kinds = self.kind().cmp(&other.kind());
        if kinds != Ordering::Equal {
            return kinds;
        }
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::Boolean(_), Value::Boolean(_)) => Ordering::Equal,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => real_cmp(*a, *b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Symbol(a), Value::Symbol(b)) => a.cmp(b),
            (Value::Keyword(a), Value::Keyword(b)) => a.cmp(b),
            (Value::Tuple(a), Value::Tuple(b)) => a.items().cmp(b.items()),
            (Value::Struct(a), Value::Struct(b)) => {
                let lens = a.len().cmp(&b.len());
                if lens != Ordering::Equal {
                    return lens;
                }
                a.entries().cmp(b.entries())
            }
            (Value::Array(a), Value::Array(b)) => pointer_cmp(a, b),
            (Value::Table(a), Value::Table(b)) => pointer_cmp(a, b),
            (Value::Buffer(a), Value::Buffer(b)) => pointer_cmp(a, b),
            (Value::Function(a), Value::Function(b)) => pointer_cmp(a, b),
            (Value::CFunction(a), Value::CFunction(b)) => a.name.as_bytes().cmp(b.name.as_bytes()),
            (Value::Fiber(a), Value::Fiber(b)) => pointer_cmp(a, b),
            (Value::Abstract(a), Value::Abstract(b)) => pointer_cmp(a, b),
            _ => Ordering::Equal,
        }
    }
}

fn write_escaped(f: &mut fmt::Formatter, bytes: &[u8]) -> fmt::Result {
    for &b in bytes {
        match b {
            b'"' => write!(f, "\\\"")?,
            b'\\' => write!(f, "\\\\")?,
            b'\n' => write!(f, "\\n")?,
            b'\t' => write!(f, "\\t")?,
            b'\r' => write!(f, "\\r")?,
            0 => write!(f, "\\0")?,
            0x0c => write!(f, "\\f")?,
            0x0b => write!(f, "\\v")?,
            0x1b => write!(f, "\\e")?,
            0x20..=0x7e => write!(f, "{}", b as char)?,
            other => write!(f, "\\x{other:02X}")?,
        }
    }
    Ok(())
}

fn write_real(f: &mut fmt::Formatter, r: f64) -> fmt::Result {
    if r.is_nan() {
        write!(f, "nan")
    } else if r.is_infinite() {
        write!(f, "{}", if r < 0.0 { "-inf" } else { "inf" })
    } else if r.fract() == 0.0 && r.abs() < 1e15 {
        // Keep a decimal point so the printed form reads back as a real
        write!(f, "{r:.1}")
    } else {
        write!(f, "{r}")
    }
}

fn write_seq(f: &mut fmt::Formatter, items: &[Value], open: &str, close: &str) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "{close}")
}

fn write_pairs(
    f: &mut fmt::Formatter,
    pairs: &[(Value, Value)],
    open: &str,
    close: &str,
) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{k} {v}")?;
    }
    write!(f, "{close}")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write_real(f, *r),
            Value::String(s) => {
                write!(f, "\"")?;
                write_escaped(f, s)?;
                write!(f, "\"")
            }
            Value::Symbol(s) => write!(f, "{}", s.text()),
            Value::Keyword(s) => write!(f, ":{}", s.text()),
            Value::Tuple(t) => {
                if t.bracketed() {
                    write_seq(f, t.items(), "[", "]")
                } else {
                    write_seq(f, t.items(), "(", ")")
                }
            }
            Value::Array(a) => write_seq(f, &a.borrow(), "@[", "]"),
            Value::Struct(s) => write_pairs(f, s.entries(), "{", "}"),
            Value::Table(t) => {
                // Sort for a deterministic printed form
                let mut pairs: Vec<(Value, Value)> = t
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                write_pairs(f, &pairs, "@{", "}")
            }
            Value::Buffer(b) => {
                write!(f, "@\"")?;
                write_escaped(f, &b.borrow())?;
                write!(f, "\"")
            }
            Value::Function(func) => match &func.def.name {
                Some(name) => write!(f, "<function {name}>"),
                None => write!(f, "<function>"),
            },
            Value::CFunction(nf) => write!(f, "<cfunction {}>", nf.name),
            Value::Fiber(_) => write!(f, "<fiber>"),
            Value::Abstract(a) => write!(f, "<abstract {}>", a.type_name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Value {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Value {
        Value::Real(r)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::string(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::SymbolTable;

    fn sym(table: &SymbolTable, text: &str) -> Value {
        Value::Symbol(table.intern(text))
    }

    #[test]
    fn test_kind_order_is_total_across_kinds() {
        let table = SymbolTable::new();
        // One representative per kind, in expected order
        let ladder = vec![
            Value::Nil,
            Value::Boolean(false),
            Value::Boolean(true),
            Value::Integer(99),
            Value::Real(-1.5),
            Value::string("s"),
            sym(&table, "s"),
            Value::Keyword(table.intern("s")),
            Value::array_from(vec![]),
            Value::tuple_from(vec![]),
            Value::table_from(vec![]),
            Value::struct_from(vec![]),
            Value::buffer_from(b""),
        ];
        for (i, a) in ladder.iter().enumerate() {
            for (j, b) in ladder.iter().enumerate() {
                assert_eq!(
                    a.cmp(b),
                    i.cmp(&j),
                    "kind order mismatch between {a} and {b}"
                );
            }
        }
    }

    #[test]
    fn test_equality_data_driven() {
        let table = SymbolTable::new();
        let shared_array = Value::array_from(vec![Value::Integer(1)]);
        let cases: Vec<(Value, Value, bool)> = vec![
            (Value::Nil, Value::Nil, true),
            (Value::Integer(1), Value::Integer(1), true),
            (Value::Integer(1), Value::Integer(2), false),
            (Value::Integer(1), Value::Real(1.0), false),
            (Value::Real(f64::NAN), Value::Real(f64::NAN), true),
            (Value::Real(0.0), Value::Real(-0.0), true),
            (Value::string("ab"), Value::string("ab"), true),
            (Value::string("ab"), Value::string("ac"), false),
            (sym(&table, "x"), sym(&table, "x"), true),
            (sym(&table, "x"), sym(&table, "y"), false),
            (
                Value::Keyword(table.intern("x")),
                Value::Keyword(table.intern("x")),
                true,
            ),
            // Symbols and keywords with equal text are different kinds
            (sym(&table, "x"), Value::Keyword(table.intern("x")), false),
            (
                Value::tuple_from(vec![Value::Integer(1), Value::Integer(2)]),
                Value::tuple_from(vec![Value::Integer(1), Value::Integer(2)]),
                true,
            ),
            (
                Value::tuple_from(vec![Value::Integer(1)]),
                Value::tuple_from(vec![Value::Integer(2)]),
                false,
            ),
            (
                Value::struct_from(vec![(Value::Integer(1), Value::Integer(2))]),
                Value::struct_from(vec![(Value::Integer(1), Value::Integer(2))]),
                true,
            ),
            // Mutable containers compare by identity
            (shared_array.clone(), shared_array.clone(), true),
            (
                Value::array_from(vec![Value::Integer(1)]),
                Value::array_from(vec![Value::Integer(1)]),
                false,
            ),
        ];
        for (i, (a, b, expected)) in cases.iter().enumerate() {
            assert_eq!(a == b, *expected, "case {i}: {a} == {b}");
            if *expected {
                assert_eq!(a.hash32(), b.hash32(), "case {i}: equal values must hash alike");
                assert_eq!(a.cmp(b), Ordering::Equal, "case {i}: order inconsistent");
            }
        }
    }

    #[test]
    fn test_struct_entry_order_is_insertion_independent() {
        let table = SymbolTable::new();
        let ka = Value::Keyword(table.intern("a"));
        let kb = Value::Keyword(table.intern("b"));
        let forward = Value::struct_from(vec![
            (ka.clone(), Value::Integer(1)),
            (kb.clone(), Value::Integer(2)),
        ]);
        let backward = Value::struct_from(vec![
            (kb.clone(), Value::Integer(2)),
            (ka.clone(), Value::Integer(1)),
        ]);
        assert_eq!(forward, backward);
        assert_eq!(format!("{forward}"), format!("{backward}"));
        if let Value::Struct(s) = &forward {
            assert_eq!(s.get(&ka), Some(&Value::Integer(1)));
            assert_eq!(s.get(&kb), Some(&Value::Integer(2)));
            assert_eq!(s.get(&Value::Integer(9)), None);
        } else {
            unreachable!()
        }
    }

    #[test]
    fn test_tuple_hash_is_cached_and_nonzero() {
        let t = Tuple::new(vec![Value::Integer(1), Value::string("x")]);
        let first = t.cached_hash();
        assert_ne!(first, 0);
        assert_eq!(t.cached_hash(), first);
    }

    #[test]
    fn test_nan_sorts_below_all_reals() {
        let nan = Value::Real(f64::NAN);
        for r in [-f64::INFINITY, -1.0, 0.0, 1.0, f64::INFINITY] {
            assert_eq!(nan.cmp(&Value::Real(r)), Ordering::Less, "nan vs {r}");
            assert_eq!(Value::Real(r).cmp(&nan), Ordering::Greater);
        }
        assert_eq!(nan.cmp(&Value::Real(f64::NAN)), Ordering::Equal);
    }

    #[test]
    fn test_display_data_driven() {
        let table = SymbolTable::new();
        let cases: Vec<(Value, &str)> = vec![
            (Value::Nil, "nil"),
            (Value::Boolean(true), "true"),
            (Value::Integer(-42), "-42"),
            (Value::Real(1.0), "1.0"),
            (Value::Real(2.5), "2.5"),
            (Value::string("a\"b\n"), "\"a\\\"b\\n\""),
            (sym(&table, "foo"), "foo"),
            (Value::Keyword(table.intern("bar")), ":bar"),
            (
                Value::tuple_from(vec![sym(&table, "f"), Value::Integer(1)]),
                "(f 1)",
            ),
            (
                Value::array_from(vec![Value::Integer(1), Value::Integer(2)]),
                "@[1 2]",
            ),
            (Value::buffer_from(b"hi"), "@\"hi\""),
            (
                Value::struct_from(vec![(
                    Value::Keyword(table.intern("a")),
                    Value::Integer(1),
                )]),
                "{:a 1}",
            ),
            (
                Value::table_from(vec![(
                    Value::Keyword(table.intern("a")),
                    Value::Integer(1),
                )]),
                "@{:a 1}",
            ),
        ];
        for (i, (value, expected)) in cases.iter().enumerate() {
            assert_eq!(&format!("{value}"), expected, "case {i}");
        }
    }

    #[test]
    fn test_get_and_put() {
        let arr = Value::array_from(vec![Value::Integer(10)]);
        assert_eq!(arr.get(&Value::Integer(0)), Value::Integer(10));
        assert_eq!(arr.get(&Value::Integer(5)), Value::Nil);
        arr.put(Value::Integer(2), Value::Integer(30));
        // Array grew with nil fill
        assert_eq!(arr.get(&Value::Integer(1)), Value::Nil);
        assert_eq!(arr.get(&Value::Integer(2)), Value::Integer(30));

        let tab = Value::table_from(vec![]);
        tab.put(Value::string("k"), Value::Integer(1));
        assert_eq!(tab.get(&Value::string("k")), Value::Integer(1));
        // Nil keys are ignored
        tab.put(Value::Nil, Value::Integer(2));
        assert_eq!(tab.len(), 1);

        let buf = Value::buffer_from(b"a");
        buf.put(Value::Integer(0), Value::Integer(0x62));
        assert_eq!(buf.get(&Value::Integer(0)), Value::Integer(0x62));
    }
}
