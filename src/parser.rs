//! The streaming reader.
//!
//! The parser is an explicit state machine fed one byte at a time. Each open
//! construct is a frame on a stack; the top frame's consumer decides what the
//! current byte means. Finished top-level values accumulate in a queue that
//! callers drain with [`Parser::produce`], so input can arrive in arbitrary
//! chunks - a REPL line, a network packet, a whole file - without the parser
//! caring.
//!
//! Errors latch: after the first parse error further bytes are ignored until
//! [`Parser::error`] or [`Parser::flush`] clears the state. [`Parser::eof`]
//! seals the parser; a seal in the middle of a form is itself an error.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use fnv::FnvHashMap;
use smallvec::{SmallVec, smallvec};

use crate::intern::SymbolTable;
use crate::number;
use crate::value::{StructMap, Tuple, Value};

const FLAG_CONTAINER: u32 = 0x100;
const FLAG_BUFFER: u32 = 0x200;
const FLAG_PARENS: u32 = 0x400;
const FLAG_SQRBRACKETS: u32 = 0x800;
const FLAG_CURLYBRACKETS: u32 = 0x1000;
const FLAG_STRING: u32 = 0x2000;
const FLAG_LONGSTRING: u32 = 0x4000;
const FLAG_READERMAC: u32 = 0x8000;
const FLAG_ATSYM: u32 = 0x10000;
const FLAG_COMMENT: u32 = 0x20000;
const FLAG_TOKEN: u32 = 0x40000;
const FLAG_INSTRING: u32 = 0x100000;
const FLAG_END_CANDIDATE: u32 = 0x200000;

/// What the top frame is currently consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consumer {
    Root,
    Token,
    StringChar,
    Escape1,
    EscapeHex,
    Comment,
    LongString,
    AtSign,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    consumer: Consumer,
    flags: u32,
    counter: i32,
    argn: i32,
    line: usize,
    column: usize,
}

/// Parser status, observable between any two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserStatus {
    /// Nothing in progress; a value may have just finished
    Root,
    /// Partway through a form
    Pending,
    /// A parse error is latched
    Error,
    /// EOF observed; the parser is sealed
    Dead,
}

impl fmt::Display for ParserStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ParserStatus::Root => "root",
            ParserStatus::Pending => "pending",
            ParserStatus::Error => "error",
            ParserStatus::Dead => "dead",
        };
        write!(f, "{text}")
    }
}

fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r' | b'\0' | 0x0b | 0x0c)
}

/// Symbol characters: alphanumerics, `!$&*+-./:<=>@\^_~|`, and every byte
/// at or above 0x80 (tentatively UTF-8, validated when the token ends).
fn is_symbol_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || c >= 0x80
        || matches!(
            c,
            b'!' | b'$'
                | b'&'
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'/'
                | b':'
                | b'<'
                | b'='
                | b'>'
                | b'@'
                | b'\\'
                | b'^'
                | b'_'
                | b'~'
                | b'|'
        )
}

/// Validate UTF-8 encoding only: 1-4 byte sequences, well-formed
/// continuation bytes, no overlong forms. Code-point validity (surrogates,
/// upper range) is deliberately not checked.
fn valid_utf8(bytes: &[u8]) -> bool {
    let len = bytes.len();
    let mut i = 0;
    while i < len {
        let c = bytes[i];
        let next = if c < 0x80 {
            i + 1
        } else if c >> 5 == 0x06 {
            i + 2
        } else if c >> 4 == 0x0e {
            i + 3
        } else if c >> 3 == 0x1e {
            i + 4
        } else {
            return false;
        };
        if next > len {
            return false;
        }
        for j in (i + 1)..next {
            if bytes[j] >> 6 != 2 {
                return false;
            }
        }
        if next == i + 2 && c < 0xC2 {
            return false;
        }
        if c == 0xE0 && bytes[i + 1] < 0xA0 {
            return false;
        }
        if c == 0xF0 && bytes[i + 1] < 0x90 {
            return false;
        }
        i = next;
    }
    true
}

fn check_escape(c: u8) -> Option<u8> {
    match c {
        b'n' => Some(b'\n'),
        b't' => Some(b'\t'),
        b'r' => Some(b'\r'),
        b'0' => Some(0),
        b'z' => Some(0),
        b'f' => Some(0x0c),
        b'v' => Some(0x0b),
        b'e' => Some(27),
        b'"' => Some(b'"'),
        b'\\' => Some(b'\\'),
        _ => None,
    }
}

fn hex_digit(c: u8) -> Option<i32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as i32),
        b'A'..=b'F' => Some((c - b'A') as i32 + 10),
        b'a'..=b'f' => Some((c - b'a') as i32 + 10),
        _ => None,
    }
}

/// The streaming reader. Cloning gives an independent deep copy so a caller
/// can speculatively parse and roll back.
#[derive(Clone)]
pub struct Parser {
    symbols: Rc<SymbolTable>,
    frames: SmallVec<[Frame; 8]>,
    args: Vec<Value>,
    buf: Vec<u8>,
    error: Option<&'static str>,
    pending: usize,
    lookback: Option<u8>,
    line: usize,
    column: usize,
    dead: bool,
}

impl Parser {
    pub fn new(symbols: Rc<SymbolTable>) -> Parser {
        let root = Frame {
            consumer: Consumer::Root,
            flags: FLAG_CONTAINER,
            counter: 0,
            argn: 0,
            line: 1,
            column: 0,
        };
        Parser {
            symbols,
            frames: smallvec![root],
            args: Vec::new(),
            buf: Vec::new(),
            error: None,
            pending: 0,
            lookback: None,
            line: 1,
            column: 0,
            dead: false,
        }
    }

    /// Feed one byte. A latched error or a sealed parser makes this a no-op.
    pub fn consume(&mut self, c: u8) {
        if self.dead || self.error.is_some() {
            return;
        }
        if c == b'\r' {
            self.line += 1;
            self.column = 0;
        } else if c == b'\n' {
            self.column = 0;
            if self.lookback != Some(b'\r') {
                self.line += 1;
            }
        } else {
            self.column += 1;
        }
        let mut consumed = false;
        while !consumed && self.error.is_none() {
            let top = self.frames.len() - 1;
            consumed = match self.frames[top].consumer {
                Consumer::Root => self.root(top, c),
                Consumer::Token => self.token(top, c),
                Consumer::StringChar => self.string_char(top, c),
                Consumer::Escape1 => self.escape1(top, c),
                Consumer::EscapeHex => self.escape_hex(top, c),
                Consumer::Comment => self.comment(c),
                Consumer::LongString => self.long_string(top, c),
                Consumer::AtSign => self.at_sign(c),
            };
        }
        self.lookback = Some(c);
    }

    /// Feed a slice of bytes, stopping early if the parser latches an error
    /// or dies. Returns the number of bytes actually read.
    pub fn consume_bytes(&mut self, bytes: &[u8]) -> usize {
        for (i, &b) in bytes.iter().enumerate() {
            self.consume(b);
            match self.status() {
                ParserStatus::Root | ParserStatus::Pending => {}
                _ => return i + 1,
            }
        }
        bytes.len()
    }

    /// Signal end of input. Seals the parser; ending in the middle of a form
    /// latches "unexpected end of source".
    pub fn eof(&mut self) {
        if self.dead || self.error.is_some() {
            self.dead = true;
            return;
        }
        let old_line = self.line;
        let old_column = self.column;
        // A trailing newline finishes any token in flight
        self.consume(b'\n');
        if self.error.is_none() && self.frames.len() > 1 {
            self.error = Some("unexpected end of source");
        }
        self.line = old_line;
        self.column = old_column;
        self.dead = true;
    }

    pub fn status(&self) -> ParserStatus {
        if self.error.is_some() {
            ParserStatus::Error
        } else if self.dead {
            ParserStatus::Dead
        } else if self.frames.len() > 1 {
            ParserStatus::Pending
        } else {
            ParserStatus::Root
        }
    }

    /// Take the latched error message, if any, flushing parser state so
    /// parsing can resume.
    pub fn error(&mut self) -> Option<&'static str> {
        let e = self.error.take()?;
        self.flush();
        Some(e)
    }

    /// Discard all partial state and the value queue. Line and column
    /// counters are kept; create a new parser for a fresh context.
    pub fn flush(&mut self) {
        self.args.clear();
        self.frames.truncate(1);
        self.frames[0].argn = 0;
        self.buf.clear();
        self.pending = 0;
    }

    /// Dequeue the next fully parsed top-level value.
    pub fn produce(&mut self) -> Option<Value> {
        if self.pending == 0 {
            return None;
        }
        self.pending -= 1;
        self.frames[0].argn -= 1;
        Some(self.args.remove(0))
    }

    /// True when the queue holds at least one finished value.
    pub fn has_more(&self) -> bool {
        self.pending > 0
    }

    /// Current (line, column) of the read head.
    pub fn location(&self) -> (usize, usize) {
        (self.line, self.column)
    }

    /// Insert a value as if it had been parsed. Inside a container the value
    /// becomes an element; inside a string or long string its text is
    /// appended to the buffer. A token in flight is finished first.
    pub fn insert(&mut self, value: Value) -> Result<(), &'static str> {
        if self.frames.last().map(|f| f.consumer) == Some(Consumer::Token) {
            self.consume(b' ');
            self.column -= 1;
        }
        let top = self.frames.len() - 1;
        let flags = self.frames[top].flags;
        if flags & FLAG_CONTAINER != 0 {
            self.frames[top].argn += 1;
            if self.frames.len() == 1 {
                self.pending += 1;
            }
            self.args.push(value);
            Ok(())
        } else if flags & (FLAG_STRING | FLAG_LONGSTRING) != 0 {
            self.buf.extend_from_slice(&value.to_text_bytes());
            Ok(())
        } else {
            Err("cannot insert value into parser")
        }
    }

    /// A machine-readable snapshot of the whole parser state: a table with
    /// `:frames` (innermost last) and `:delimiters` (the closers that would
    /// balance the open frames, useful for REPL prompts).
    pub fn state(&self) -> Value {
        let mut map = FnvHashMap::default();
        map.insert(self.kw("frames"), self.frames_state());
        map.insert(self.kw("delimiters"), self.delimiters_state());
        Value::Table(Rc::new(RefCell::new(map)))
    }

    /// One component of [`Parser::state`]: `"frames"` or `"delimiters"`.
    pub fn state_of(&self, key: &str) -> Option<Value> {
        match key {
            "frames" => Some(self.frames_state()),
            "delimiters" => Some(self.delimiters_state()),
            _ => None,
        }
    }

    fn kw(&self, text: &str) -> Value {
        Value::Keyword(self.symbols.intern(text))
    }

    fn delimiters_state(&self) -> Value {
        let mut out = Vec::new();
        for frame in &self.frames {
            if frame.flags & FLAG_PARENS != 0 {
                out.push(b'(');
            } else if frame.flags & FLAG_SQRBRACKETS != 0 {
                out.push(b'[');
            } else if frame.flags & FLAG_CURLYBRACKETS != 0 {
                out.push(b'{');
            } else if frame.flags & FLAG_STRING != 0 {
                out.push(b'"');
            } else if frame.flags & FLAG_LONGSTRING != 0 {
                for _ in 0..frame.argn {
                    out.push(b'`');
                }
            }
        }
        Value::String(Rc::from(&out[..]))
    }

    fn frames_state(&self) -> Value {
        // Each container frame owns a span of the args queue; spans stack
        // bottom to top.
        let mut offsets = Vec::with_capacity(self.frames.len());
        let mut acc = 0usize;
        for frame in &self.frames {
            offsets.push(acc);
            acc += frame.argn as usize;
        }
        let frames = self
            .frames
            .iter()
            .zip(offsets)
            .map(|(frame, offset)| self.frame_state(frame, offset))
            .collect();
        Value::array_from(frames)
    }

    fn frame_state(&self, frame: &Frame, args_offset: usize) -> Value {
        let mut map = FnvHashMap::default();
        let mut add_buffer = false;
        let type_name = if frame.flags & (FLAG_PARENS | FLAG_SQRBRACKETS) != 0 {
            let span = &self.args[args_offset..args_offset + frame.argn as usize];
            map.insert(self.kw("args"), Value::array_from(span.to_vec()));
            if frame.flags & FLAG_ATSYM != 0 {
                "array"
            } else {
                "tuple"
            }
        } else if frame.flags & FLAG_CURLYBRACKETS != 0 {
            let span = &self.args[args_offset..args_offset + frame.argn as usize];
            map.insert(self.kw("args"), Value::array_from(span.to_vec()));
            if frame.flags & FLAG_ATSYM != 0 {
                "table"
            } else {
                "struct"
            }
        } else if frame.flags & (FLAG_STRING | FLAG_LONGSTRING) != 0 {
            add_buffer = true;
            if frame.flags & FLAG_BUFFER != 0 {
                "buffer"
            } else {
                "string"
            }
        } else if frame.flags & FLAG_COMMENT != 0 {
            add_buffer = true;
            "comment"
        } else if frame.flags & FLAG_TOKEN != 0 {
            add_buffer = true;
            "token"
        } else if frame.flags & FLAG_ATSYM != 0 {
            "at"
        } else if frame.flags & FLAG_READERMAC != 0 {
            match (frame.flags & 0xFF) as u8 {
                b'\'' => "quote",
                b',' => "unquote",
                b';' => "splice",
                b'~' => "quasiquote",
                _ => "<reader>",
            }
        } else {
            // The root frame is also a container
            let span = &self.args[args_offset..args_offset + frame.argn as usize];
            map.insert(self.kw("args"), Value::array_from(span.to_vec()));
            "root"
        };
        if add_buffer {
            map.insert(self.kw("buffer"), Value::String(Rc::from(&self.buf[..])));
        }
        map.insert(self.kw("type"), self.kw(type_name));
        map.insert(self.kw("line"), Value::Integer(frame.line as i32));
        map.insert(self.kw("column"), Value::Integer(frame.column as i32));
        Value::Table(Rc::new(RefCell::new(map)))
    }

    // --- state machine internals ---

    fn push_frame(&mut self, consumer: Consumer, flags: u32) {
        self.frames.push(Frame {
            consumer,
            flags,
            counter: 0,
            argn: 0,
            line: self.line,
            column: self.column,
        });
    }

    /// Deliver a finished value to the enclosing frame, unwinding any
    /// reader-macro frames on the way.
    fn popstate(&mut self, mut val: Value) {
        loop {
            self.frames.pop();
            let top = self.frames.len() - 1;
            let flags = self.frames[top].flags;
            if flags & FLAG_CONTAINER != 0 {
                self.frames[top].argn += 1;
                if self.frames.len() == 1 {
                    self.pending += 1;
                }
                self.args.push(val);
                return;
            } else if flags & FLAG_READERMAC != 0 {
                let which = match (flags & 0xFF) as u8 {
                    b'\'' => "quote",
                    b',' => "unquote",
                    b';' => "splice",
                    b'|' => "short-fn",
                    b'~' => "quasiquote",
                    _ => "<unknown>",
                };
                let head = Value::Symbol(self.symbols.intern(which));
                let frame = self.frames[top];
                val = Value::Tuple(Rc::new(Tuple::with_source(
                    vec![head, val],
                    frame.line as i32,
                    frame.column as i32,
                    false,
                )));
                // Loop pops the reader-macro frame next
            } else {
                return;
            }
        }
    }

    fn root(&mut self, top: usize, c: u8) -> bool {
        match c {
            b'\'' | b',' | b';' | b'~' | b'|' => {
                self.push_frame(Consumer::Root, FLAG_READERMAC | c as u32);
                true
            }
            b'"' => {
                self.push_frame(Consumer::StringChar, FLAG_STRING);
                true
            }
            b'#' => {
                self.push_frame(Consumer::Comment, FLAG_COMMENT);
                true
            }
            b'@' => {
                self.push_frame(Consumer::AtSign, FLAG_ATSYM);
                true
            }
            b'`' => {
                self.push_frame(Consumer::LongString, FLAG_LONGSTRING);
                true
            }
            b')' | b']' | b'}' => {
                self.close_delimiter(top, c);
                true
            }
            b'(' => {
                self.push_frame(Consumer::Root, FLAG_CONTAINER | FLAG_PARENS);
                true
            }
            b'[' => {
                self.push_frame(Consumer::Root, FLAG_CONTAINER | FLAG_SQRBRACKETS);
                true
            }
            b'{' => {
                self.push_frame(Consumer::Root, FLAG_CONTAINER | FLAG_CURLYBRACKETS);
                true
            }
            _ => {
                if is_whitespace(c) {
                    true
                } else if !is_symbol_char(c) {
                    self.error = Some("unexpected character");
                    true
                } else {
                    self.push_frame(Consumer::Token, FLAG_TOKEN);
                    false
                }
            }
        }
    }

    fn close_delimiter(&mut self, top: usize, c: u8) {
        if self.frames.len() == 1 {
            self.error = Some("unexpected delimiter");
            return;
        }
        let state = self.frames[top];
        let closed = if (c == b')' && state.flags & FLAG_PARENS != 0)
            || (c == b']' && state.flags & FLAG_SQRBRACKETS != 0)
        {
            if state.flags & FLAG_ATSYM != 0 {
                self.close_array(&state)
            } else {
                self.close_tuple(&state, c == b']')
            }
        } else if c == b'}' && state.flags & FLAG_CURLYBRACKETS != 0 {
            if state.argn & 1 == 1 {
                self.error = Some("struct and table literals expect even number of arguments");
                return;
            }
            if state.flags & FLAG_ATSYM != 0 {
                self.close_table(&state)
            } else {
                self.close_struct(&state)
            }
        } else {
            self.error = Some("mismatched delimiter");
            return;
        };
        self.popstate(closed);
    }

    fn drain_args(&mut self, frame: &Frame) -> Vec<Value> {
        self.args.split_off(self.args.len() - frame.argn as usize)
    }

    fn close_tuple(&mut self, frame: &Frame, bracketed: bool) -> Value {
        let items = self.drain_args(frame);
        Value::Tuple(Rc::new(Tuple::with_source(
            items,
            frame.line as i32,
            frame.column as i32,
            bracketed,
        )))
    }

    fn close_array(&mut self, frame: &Frame) -> Value {
        Value::array_from(self.drain_args(frame))
    }

    fn pair_up(items: Vec<Value>) -> Vec<(Value, Value)> {
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k, v));
        }
        pairs
    }

    fn close_struct(&mut self, frame: &Frame) -> Value {
        let pairs = Parser::pair_up(self.drain_args(frame));
        Value::Struct(Rc::new(StructMap::with_source(
            pairs,
            frame.line as i32,
            frame.column as i32,
        )))
    }

    fn close_table(&mut self, frame: &Frame) -> Value {
        Value::table_from(Parser::pair_up(self.drain_args(frame)))
    }

    fn token(&mut self, top: usize, c: u8) -> bool {
        if is_symbol_char(c) {
            self.buf.push(c);
            if c > 127 {
                // Remember we saw a high byte so the tail gets validated
                self.frames[top].argn = 1;
            }
            return true;
        }
        // The terminator is not ours; classify and bounce it to the parent
        match self.classify_token(self.frames[top].argn != 0) {
            Ok(value) => {
                self.buf.clear();
                self.popstate(value);
            }
            Err(msg) => self.error = Some(msg),
        }
        false
    }

    fn classify_token(&self, saw_high_byte: bool) -> Result<Value, &'static str> {
        let buf = &self.buf[..];
        let first = buf[0];
        let start_digit = first.is_ascii_digit();
        let start_num = start_digit || first == b'-' || first == b'+' || first == b'.';
        if first == b':' {
            if saw_high_byte && !valid_utf8(&buf[1..]) {
                return Err("invalid utf-8 in keyword");
            }
            let text = std::str::from_utf8(&buf[1..]).map_err(|_| "invalid utf-8 in keyword")?;
            return Ok(Value::Keyword(self.symbols.intern(text)));
        }
        if start_num && let Some(num) = number::scan_number(buf) {
            return Ok(num);
        }
        match buf {
            b"nil" => Ok(Value::Nil),
            b"true" => Ok(Value::Boolean(true)),
            b"false" => Ok(Value::Boolean(false)),
            _ => {
                if start_digit {
                    return Err("symbol literal cannot start with a digit");
                }
                if saw_high_byte && !valid_utf8(buf) {
                    return Err("invalid utf-8 in symbol");
                }
                let text = std::str::from_utf8(buf).map_err(|_| "invalid utf-8 in symbol")?;
                Ok(Value::Symbol(self.symbols.intern(text)))
            }
        }
    }

    fn string_char(&mut self, top: usize, c: u8) -> bool {
        match c {
            b'\\' => self.frames[top].consumer = Consumer::Escape1,
            b'"' => self.string_end(top),
            // Raw newlines inside plain strings are stripped
            b'\n' | b'\r' => {}
            _ => self.buf.push(c),
        }
        true
    }

    fn escape1(&mut self, top: usize, c: u8) -> bool {
        if c == b'x' {
            self.frames[top].counter = 2;
            self.frames[top].argn = 0;
            self.frames[top].consumer = Consumer::EscapeHex;
            return true;
        }
        match check_escape(c) {
            Some(byte) => {
                self.buf.push(byte);
                self.frames[top].consumer = Consumer::StringChar;
            }
            None => self.error = Some("invalid string escape sequence"),
        }
        true
    }

    fn escape_hex(&mut self, top: usize, c: u8) -> bool {
        let Some(digit) = hex_digit(c) else {
            self.error = Some("invalid hex digit in hex escape");
            return true;
        };
        let frame = &mut self.frames[top];
        frame.argn = (frame.argn << 4) + digit;
        frame.counter -= 1;
        if frame.counter == 0 {
            let byte = (frame.argn & 0xFF) as u8;
            frame.argn = 0;
            frame.consumer = Consumer::StringChar;
            self.buf.push(byte);
        }
        true
    }

    fn string_end(&mut self, top: usize) {
        let frame = self.frames[top];
        let mut start = 0usize;
        let mut end = self.buf.len();
        if frame.flags & FLAG_LONGSTRING != 0 {
            // Strip one newline hugging each delimiter
            if self.buf.first() == Some(&b'\n') {
                start += 1;
            }
            if end > start && self.buf[end - 1] == b'\n' {
                end -= 1;
            }
        }
        let bytes = &self.buf[start..end];
        let value = if frame.flags & FLAG_BUFFER != 0 {
            Value::buffer_from(bytes)
        } else {
            Value::String(Rc::from(bytes))
        };
        self.buf.clear();
        self.popstate(value);
    }

    fn long_string(&mut self, top: usize, c: u8) -> bool {
        let flags = self.frames[top].flags;
        if flags & FLAG_INSTRING != 0 {
            if c == b'`' {
                self.frames[top].flags = (flags | FLAG_END_CANDIDATE) & !FLAG_INSTRING;
                self.frames[top].counter = 1;
            } else {
                self.buf.push(c);
            }
            true
        } else if flags & FLAG_END_CANDIDATE != 0 {
            // counter tracks backticks seen in this candidate run; the
            // string ends only on a run of exactly argn backticks
            if self.frames[top].counter == self.frames[top].argn {
                self.string_end(top);
                return false;
            }
            if c == b'`' && self.frames[top].counter < self.frames[top].argn {
                self.frames[top].counter += 1;
                return true;
            }
            // Shorter run: it was literal content after all
            for _ in 0..self.frames[top].counter {
                self.buf.push(b'`');
            }
            self.buf.push(c);
            self.frames[top].counter = 0;
            self.frames[top].flags = (flags & !FLAG_END_CANDIDATE) | FLAG_INSTRING;
            true
        } else {
            // Still reading the opening backtick run
            self.frames[top].argn += 1;
            if c != b'`' {
                self.frames[top].flags |= FLAG_INSTRING;
                self.buf.push(c);
            }
            true
        }
    }

    fn comment(&mut self, c: u8) -> bool {
        if c == b'\n' {
            self.frames.pop();
            self.buf.clear();
        } else {
            self.buf.push(c);
        }
        true
    }

    fn at_sign(&mut self, c: u8) -> bool {
        self.frames.pop();
        match c {
            b'{' => {
                self.push_frame(
                    Consumer::Root,
                    FLAG_CONTAINER | FLAG_CURLYBRACKETS | FLAG_ATSYM,
                );
                true
            }
            b'"' => {
                self.push_frame(Consumer::StringChar, FLAG_BUFFER | FLAG_STRING);
                true
            }
            b'`' => {
                self.push_frame(Consumer::LongString, FLAG_BUFFER | FLAG_LONGSTRING);
                true
            }
            b'[' => {
                self.push_frame(
                    Consumer::Root,
                    FLAG_CONTAINER | FLAG_SQRBRACKETS | FLAG_ATSYM,
                );
                true
            }
            b'(' => {
                self.push_frame(Consumer::Root, FLAG_CONTAINER | FLAG_PARENS | FLAG_ATSYM);
                true
            }
            _ => {
                // Not a data constructor: a token that starts with '@'
                self.push_frame(Consumer::Token, FLAG_TOKEN);
                self.buf.push(b'@');
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Kind;

    fn parse_all_with(
        symbols: &Rc<SymbolTable>,
        input: &str,
    ) -> Result<Vec<Value>, &'static str> {
        let mut p = Parser::new(symbols.clone());
        for &b in input.as_bytes() {
            p.consume(b);
            if p.status() == ParserStatus::Error {
                return Err(p.error().unwrap());
            }
        }
        p.eof();
        if p.status() == ParserStatus::Error {
            return Err(p.error().unwrap());
        }
        let mut out = Vec::new();
        while let Some(v) = p.produce() {
            out.push(v);
        }
        Ok(out)
    }

    fn parse_all(input: &str) -> Result<Vec<Value>, &'static str> {
        parse_all_with(&SymbolTable::shared(), input)
    }

    fn parse_one_with(symbols: &Rc<SymbolTable>, input: &str) -> Value {
        let mut values =
            parse_all_with(symbols, input).unwrap_or_else(|e| panic!("{input:?}: {e}"));
        assert_eq!(values.len(), 1, "{input:?} should parse to one value");
        values.remove(0)
    }

    fn parse_one(input: &str) -> Value {
        parse_one_with(&SymbolTable::shared(), input)
    }

    enum Expected {
        /// Parses to a single value whose printed form matches
        Prints(&'static str),
        /// Parses to a single value of this kind
        KindIs(Kind),
        /// Latches this error
        Fails(&'static str),
    }
    use Expected::*;

    #[test]
    #[expect(clippy::too_many_lines)] // the table is the documentation
    fn test_reader_comprehensive() {
        let cases: Vec<(&str, Expected)> = vec![
            // Leaves
            ("nil", Prints("nil")),
            ("true", Prints("true")),
            ("false", Prints("false")),
            ("42", Prints("42")),
            ("-7", Prints("-7")),
            ("0x10", Prints("16")),
            ("2r101", Prints("5")),
            ("1.5", Prints("1.5")),
            ("2147483648", Prints("2147483648.0")),
            ("foo", Prints("foo")),
            ("foo-bar", Prints("foo-bar")),
            ("@token", Prints("@token")),
            ("-", Prints("-")),
            (".", Prints(".")),
            (":kw", Prints(":kw")),
            (":", Prints(":")),
            // Strings and escapes
            (r#""hello""#, Prints(r#""hello""#)),
            (r#""a\nb""#, Prints(r#""a\nb""#)),
            (r#""a\tb""#, Prints(r#""a\tb""#)),
            (r#""q\"q""#, Prints(r#""q\"q""#)),
            (r#""s\\s""#, Prints(r#""s\\s""#)),
            (r#""\x41""#, Prints(r#""A""#)),
            (r#""\e""#, Prints(r#""\e""#)),
            ("\"a\nb\"", Prints(r#""ab""#)), // raw newline stripped
            (r#""bad\q""#, Fails("invalid string escape sequence")),
            (r#""bad\xg0""#, Fails("invalid hex digit in hex escape")),
            // Long strings
            ("`abc`", Prints(r#""abc""#)),
            ("``abc``", Prints(r#""abc""#)),
            ("``a`b``", Prints(r#""a`b""#)),
            ("```abc`def```", Prints(r#""abc`def""#)),
            ("`\nabc\n`", Prints(r#""abc""#)),
            ("`a\"b`", Prints(r#""a\"b""#)),
            // Containers
            ("()", Prints("()")),
            ("(1 2 3)", Prints("(1 2 3)")),
            ("(f (g 1) [2 3])", Prints("(f (g 1) [2 3])")),
            ("[1 2]", Prints("[1 2]")),
            ("{:a 1}", Prints("{:a 1}")),
            ("@[1 2]", Prints("@[1 2]")),
            ("@(1 2)", Prints("@[1 2]")),
            ("@{:a 1}", Prints("@{:a 1}")),
            ("@\"bytes\"", Prints("@\"bytes\"")),
            ("@`raw`", Prints("@\"raw\"")),
            ("{}", KindIs(Kind::Struct)),
            ("@{}", KindIs(Kind::Table)),
            // Reader macros
            ("'x", Prints("(quote x)")),
            (",x", Prints("(unquote x)")),
            (";x", Prints("(splice x)")),
            ("~x", Prints("(quasiquote x)")),
            ("|x", Prints("(short-fn x)")),
            ("''x", Prints("(quote (quote x))")),
            ("'(1 2)", Prints("(quote (1 2))")),
            ("~{:a ,b}", Prints("(quasiquote {:a (unquote b)})")),
            // Comments
            ("# a comment\n42", Prints("42")),
            ("#only a comment\n", KindIs(Kind::Nil)), // sentinel, see below
            // Errors
            ("(foo]", Fails("mismatched delimiter")),
            ("[foo)", Fails("mismatched delimiter")),
            ("{:a 1)", Fails("mismatched delimiter")),
            (")", Fails("unexpected delimiter")),
            ("{:a}", Fails("struct and table literals expect even number of arguments")),
            ("@{:a}", Fails("struct and table literals expect even number of arguments")),
            ("(1 2", Fails("unexpected end of source")),
            ("\"open", Fails("unexpected end of source")),
            ("`open", Fails("unexpected end of source")),
            ("'", Fails("unexpected end of source")),
            ("12foo", Fails("symbol literal cannot start with a digit")),
            ("?", Fails("unexpected character")),
            ("%", Fails("unexpected character")),
        ];
        for (i, (input, expected)) in cases.iter().enumerate() {
            match expected {
                Prints(text) => {
                    let v = parse_one(input);
                    assert_eq!(&format!("{v}"), text, "case {i}: {input:?}");
                }
                KindIs(kind) => {
                    if *kind == Kind::Nil {
                        // Comment-only input parses to no values at all
                        assert!(
                            parse_all(input).unwrap().is_empty(),
                            "case {i}: {input:?} should produce nothing"
                        );
                    } else {
                        assert_eq!(parse_one(input).kind(), *kind, "case {i}: {input:?}");
                    }
                }
                Fails(msg) => match parse_all(input) {
                    Err(e) => assert_eq!(&e, msg, "case {i}: {input:?}"),
                    Ok(v) => panic!("case {i}: {input:?} should fail, parsed {v:?}"),
                },
            }
        }
    }

    #[test]
    fn test_print_parse_round_trip() {
        // Printed forms of parsed data re-parse to equal values. One intern
        // table is shared so identifier equality can hold across parses.
        let symbols = SymbolTable::shared();
        let inputs = [
            "nil",
            "(1 2 (3 4) [5])",
            "{:a 1 :b (c d)}",
            "@[1 @[2] \"three\"]",
            "\"\\x01\\xFFz\"",
            "(quote (a b))",
            "0.5",
            "-12",
        ];
        for input in inputs {
            let first = parse_one_with(&symbols, input);
            let second = parse_one_with(&symbols, &format!("{first}"));
            // Mutable containers compare by identity, so equality of the
            // printed forms is the right notion of "same value" here
            assert_eq!(
                format!("{first}"),
                format!("{second}"),
                "round trip through {input}"
            );
            if !matches!(
                first,
                Value::Array(_) | Value::Table(_) | Value::Buffer(_)
            ) {
                assert_eq!(first, second, "round trip through {input}");
            }
        }
    }

    #[test]
    fn test_streaming_equivalence() {
        // Any split of the input yields the same value queue
        let symbols = SymbolTable::shared();
        let input = "(def x 10) @{:k \"v\"} `long``er` [1 2 3] ; tail";
        let whole = parse_all_with(&symbols, input).unwrap();
        assert!(!whole.is_empty());
        for split in 0..input.len() {
            let mut p = Parser::new(symbols.clone());
            p.consume_bytes(&input.as_bytes()[..split]);
            p.consume_bytes(&input.as_bytes()[split..]);
            p.eof();
            assert_ne!(p.status(), ParserStatus::Error, "split at {split}");
            let mut got = Vec::new();
            while let Some(v) = p.produce() {
                got.push(v);
            }
            // Compare printed forms: mutable containers from separate runs
            // can never be identical, only structurally the same
            let render = |vs: &[Value]| -> Vec<String> {
                vs.iter().map(|v| format!("{v}")).collect()
            };
            assert_eq!(render(&got), render(&whole), "split at {split}");
        }
    }

    #[test]
    fn test_status_transitions_and_latching() {
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        assert_eq!(p.status(), ParserStatus::Root);
        p.consume(b'(');
        assert_eq!(p.status(), ParserStatus::Pending);
        p.consume(b']');
        assert_eq!(p.status(), ParserStatus::Error);
        // Latched: further bytes are ignored
        p.consume(b'1');
        assert_eq!(p.status(), ParserStatus::Error);
        assert_eq!(p.error(), Some("mismatched delimiter"));
        // error() flushed; parsing resumes
        assert_eq!(p.status(), ParserStatus::Root);
        p.consume_bytes(b"42 ");
        assert_eq!(p.produce(), Some(Value::Integer(42)));
        p.eof();
        assert_eq!(p.status(), ParserStatus::Dead);
    }

    #[test]
    fn test_where_tracks_lines_and_columns() {
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"abc");
        assert_eq!(p.location(), (1, 3));
        p.consume_bytes(b"\n12");
        assert_eq!(p.location(), (2, 2));
        // \r\n coalesces into one line advance
        p.consume_bytes(b"\r\nx");
        assert_eq!(p.location(), (3, 1));
    }

    #[test]
    fn test_mismatched_delimiter_location() {
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"(foo]");
        assert_eq!(p.status(), ParserStatus::Error);
        // where() reports the column of the offending `]`
        assert_eq!(p.location(), (1, 5));
    }

    #[test]
    fn test_source_mapping_on_tuples() {
        let v = parse_one("\n  (f 1)");
        let Value::Tuple(t) = v else { panic!("expected tuple") };
        assert_eq!((t.line(), t.column()), (2, 3));
        // Reader-macro wrappers carry their own position
        let v = parse_one("'(f)");
        let Value::Tuple(t) = v else { panic!("expected tuple") };
        assert_eq!((t.line(), t.column()), (1, 1));
    }

    #[test]
    fn test_clone_allows_speculative_parsing() {
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"(1 2");
        let mut fork = p.clone();
        fork.consume_bytes(b")");
        assert!(fork.has_more());
        assert_eq!(format!("{}", fork.produce().unwrap()), "(1 2)");
        // The original is still mid-form
        assert_eq!(p.status(), ParserStatus::Pending);
        assert!(!p.has_more());
        p.consume_bytes(b" 3)");
        assert_eq!(format!("{}", p.produce().unwrap()), "(1 2 3)");
    }

    #[test]
    fn test_insert_into_container_and_string() {
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"(1 ");
        p.insert(Value::Integer(99)).unwrap();
        p.consume_bytes(b" 2)");
        assert_eq!(format!("{}", p.produce().unwrap()), "(1 99 2)");

        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"\"ab");
        p.insert(Value::string("cd")).unwrap();
        p.consume_bytes(b"e\"");
        assert_eq!(format!("{}", p.produce().unwrap()), "\"abcde\"");

        // A token in flight is finished by the insert
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"(foo");
        p.insert(Value::Integer(1)).unwrap();
        p.consume_bytes(b")");
        assert_eq!(format!("{}", p.produce().unwrap()), "(foo 1)");
    }

    #[test]
    fn test_state_snapshot() {
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"([\"");
        let delims = p.state_of("delimiters").unwrap();
        assert_eq!(format!("{delims}"), "\"([\\\"\"");
        let frames = p.state_of("frames").unwrap();
        let Value::Array(frames) = frames else {
            panic!("frames should be an array")
        };
        let frames = frames.borrow();
        assert_eq!(frames.len(), 4); // root, tuple, bracket tuple, string
        let kw = |s: &str| Value::Keyword(p.symbols.intern(s));
        assert_eq!(frames[0].get(&kw("type")), kw("root"));
        assert_eq!(frames[1].get(&kw("type")), kw("tuple"));
        assert_eq!(frames[2].get(&kw("type")), kw("tuple"));
        assert_eq!(frames[3].get(&kw("type")), kw("string"));
        // Long-string frames contribute their full backtick run
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"@{``");
        let delims = p.state_of("delimiters").unwrap();
        assert_eq!(format!("{delims}"), "\"{``\"");
    }

    #[test]
    fn test_utf8_symbols_and_validation() {
        // Well-formed UTF-8 identifiers pass
        let v = parse_one("\u{3bb}x");
        assert_eq!(format!("{v}"), "\u{3bb}x");
        let v = parse_one(":\u{e9}t\u{e9}");
        assert_eq!(v.kind(), Kind::Keyword);
        // A lone continuation byte fails
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"a\x80b ");
        assert_eq!(p.status(), ParserStatus::Error);
        assert_eq!(p.error(), Some("invalid utf-8 in symbol"));
        // Overlong encoding fails
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        p.consume_bytes(b"\xC0\xAF ");
        assert_eq!(p.status(), ParserStatus::Error);
    }

    #[test]
    fn test_consume_bytes_reports_progress() {
        let symbols = SymbolTable::shared();
        let mut p = Parser::new(symbols);
        // Error at the 5th byte stops consumption there
        let n = p.consume_bytes(b"(foo] (bar)");
        assert_eq!(n, 5);
        assert_eq!(p.status(), ParserStatus::Error);
    }
}
