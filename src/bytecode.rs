//! The instruction set and the function-definition artifact.
//!
//! Every instruction is one little-endian 32-bit word. The low 8 bits are
//! the opcode; the remaining 24 bits carry up to three 8-bit fields, or one
//! 8-bit field plus a 16-bit immediate, or a single wide field. Each emitted
//! word has a parallel [`SourceMapping`] entry.
//!
//! [`FuncDef`] is what the compiler hands the virtual machine: bytecode,
//! constants, nested definitions, captured-environment indices and debug
//! information, all frozen into fixed arrays at finalization.

use std::fmt;
use std::rc::Rc;

use crate::value::Value;

/// Operand layout of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpArgs {
    /// No operands
    Zero,
    /// One slot, up to 24 bits
    Slot,
    /// One signed 24-bit jump offset
    Label,
    /// Slot (8 bits), slot (16 bits)
    SlotSlot,
    /// Slot (8 bits), signed 16-bit jump offset
    SlotLabel,
    /// Slot (8 bits), signed 16-bit immediate
    SlotImm,
    /// Slot (8 bits), 16-bit nested-funcdef index
    SlotFuncDef,
    /// Slot (8 bits), unsigned 16-bit immediate
    SlotUImm,
    /// Slot (8 bits), 16-bit constant index
    SlotConstant,
    /// Three 8-bit slots
    SlotSlotSlot,
    /// Slot, slot, signed 8-bit immediate
    SlotSlotImm,
    /// Slot, slot, unsigned 8-bit immediate
    SlotSlotUImm,
    /// Slot, 8-bit environment index, 8-bit far slot
    SlotEnvSlot,
}

macro_rules! define_opcodes {
    ($(
        $(#[$meta:meta])*
        $name:ident = $num:literal, $args:ident, $text:literal;
    )*) => {
        /// The documented opcode set.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {$(
            $(#[$meta])*
            $name = $num,
        )*}

        impl Opcode {
            pub fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $num => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Operand layout for this opcode.
            pub fn operands(self) -> OpArgs {
                match self {
                    $( Opcode::$name => OpArgs::$args, )*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $text, )*
                }
            }
        }
    };
}

define_opcodes! {
    Noop = 0, Zero, "noop";
    /// Raise signal C with value in B, result into A when resumed
    Signal = 1, SlotSlotUImm, "signal";
    Return = 2, Slot, "return";
    ReturnNil = 3, Zero, "return-nil";

    AddInteger = 4, SlotSlotSlot, "add-integer";
    AddImmediate = 5, SlotSlotImm, "add-immediate";
    AddReal = 6, SlotSlotSlot, "add-real";
    Add = 7, SlotSlotSlot, "add";
    SubtractInteger = 8, SlotSlotSlot, "subtract-integer";
    SubtractReal = 9, SlotSlotSlot, "subtract-real";
    Subtract = 10, SlotSlotSlot, "subtract";
    MultiplyInteger = 11, SlotSlotSlot, "multiply-integer";
    MultiplyImmediate = 12, SlotSlotImm, "multiply-immediate";
    MultiplyReal = 13, SlotSlotSlot, "multiply-real";
    Multiply = 14, SlotSlotSlot, "multiply";
    DivideInteger = 15, SlotSlotSlot, "divide-integer";
    DivideImmediate = 16, SlotSlotImm, "divide-immediate";
    DivideReal = 17, SlotSlotSlot, "divide-real";
    Divide = 18, SlotSlotSlot, "divide";

    Band = 19, SlotSlotSlot, "band";
    Bor = 20, SlotSlotSlot, "bor";
    Bxor = 21, SlotSlotSlot, "bxor";
    Bnot = 22, SlotSlot, "bnot";
    ShiftLeft = 23, SlotSlotSlot, "shift-left";
    ShiftLeftImmediate = 24, SlotSlotUImm, "shift-left-immediate";
    ShiftRight = 25, SlotSlotSlot, "shift-right";
    ShiftRightImmediate = 26, SlotSlotUImm, "shift-right-immediate";
    ShiftRightUnsigned = 27, SlotSlotSlot, "shift-right-unsigned";
    ShiftRightUnsignedImmediate = 28, SlotSlotUImm, "shift-right-unsigned-immediate";

    MoveFar = 29, SlotSlot, "move-far";
    MoveNear = 30, SlotSlot, "move-near";
    Jump = 31, Label, "jump";
    JumpIf = 32, SlotLabel, "jump-if";
    JumpIfNot = 33, SlotLabel, "jump-if-not";

    GreaterThan = 34, SlotSlotSlot, "greater-than";
    GreaterThanInteger = 35, SlotSlotSlot, "greater-than-integer";
    GreaterThanImmediate = 36, SlotSlotImm, "greater-than-immediate";
    GreaterThanReal = 37, SlotSlotSlot, "greater-than-real";
    GreaterThanEqualReal = 38, SlotSlotSlot, "greater-than-equal-real";
    LessThan = 39, SlotSlotSlot, "less-than";
    LessThanInteger = 40, SlotSlotSlot, "less-than-integer";
    LessThanImmediate = 41, SlotSlotImm, "less-than-immediate";
    LessThanReal = 42, SlotSlotSlot, "less-than-real";
    LessThanEqualReal = 43, SlotSlotSlot, "less-than-equal-real";
    Equals = 44, SlotSlotSlot, "equals";
    EqualsInteger = 45, SlotSlotSlot, "equals-integer";
    EqualsImmediate = 46, SlotSlotImm, "equals-immediate";
    EqualsReal = 47, SlotSlotSlot, "equals-real";
    Compare = 48, SlotSlotSlot, "compare";

    LoadNil = 49, Slot, "load-nil";
    LoadTrue = 50, Slot, "load-true";
    LoadFalse = 51, Slot, "load-false";
    LoadInteger = 52, SlotImm, "load-integer";
    LoadConstant = 53, SlotConstant, "load-constant";
    LoadUpvalue = 54, SlotEnvSlot, "load-upvalue";
    LoadSelf = 55, Slot, "load-self";
    SetUpvalue = 56, SlotEnvSlot, "set-upvalue";
    Closure = 57, SlotFuncDef, "closure";

    Push = 58, Slot, "push";
    Push2 = 59, SlotSlot, "push-2";
    Push3 = 60, SlotSlotSlot, "push-3";
    PushArray = 61, Slot, "push-array";
    Call = 62, SlotSlot, "call";
    TailCall = 63, Slot, "tailcall";
    Resume = 64, SlotSlotSlot, "resume";

    Get = 65, SlotSlotSlot, "get";
    Put = 66, SlotSlotSlot, "put";
    GetIndex = 67, SlotSlotUImm, "get-index";
    PutIndex = 68, SlotSlotUImm, "put-index";
    Length = 69, SlotSlot, "length";

    MakeArray = 70, Slot, "make-array";
    MakeBuffer = 71, Slot, "make-buffer";
    MakeString = 72, Slot, "make-string";
    MakeStruct = 73, Slot, "make-struct";
    MakeTable = 74, Slot, "make-table";
    MakeTuple = 75, Slot, "make-tuple";
}

/// Pack an instruction with no operands.
pub fn op0(op: Opcode) -> u32 {
    op as u32
}

/// Pack an instruction with one wide field (up to 24 bits).
pub fn op1(op: Opcode, a: u32) -> u32 {
    op as u32 | (a << 8)
}

/// Pack an instruction with an 8-bit field and a 16-bit field. The second
/// field is masked, so signed immediates pass through two's-complement.
pub fn op2(op: Opcode, a: u32, b: u32) -> u32 {
    op as u32 | ((a & 0xFF) << 8) | ((b & 0xFFFF) << 16)
}

/// Pack an instruction with three 8-bit fields.
pub fn op3(op: Opcode, a: u32, b: u32, c: u32) -> u32 {
    op as u32 | ((a & 0xFF) << 8) | ((b & 0xFF) << 16) | ((c & 0xFF) << 24)
}

/// Decode the opcode of a word.
pub fn opcode(word: u32) -> Option<Opcode> {
    Opcode::from_u8((word & 0xFF) as u8)
}

/// First 8-bit field.
pub fn field_a(word: u32) -> u32 {
    (word >> 8) & 0xFF
}

/// Second 8-bit field.
pub fn field_b(word: u32) -> u32 {
    (word >> 16) & 0xFF
}

/// Third 8-bit field.
pub fn field_c(word: u32) -> u32 {
    (word >> 24) & 0xFF
}

/// Wide 24-bit field, sign extended.
pub fn field_wide(word: u32) -> i32 {
    (word as i32) >> 8
}

/// 16-bit field at the top, unsigned.
pub fn field_bc(word: u32) -> u32 {
    word >> 16
}

/// 16-bit field at the top, sign extended.
pub fn field_bc_signed(word: u32) -> i32 {
    (word as i32) >> 16
}

/// Render one instruction word, e.g. `load-integer r0 1`.
pub fn disassemble_word(word: u32) -> String {
    let Some(op) = opcode(word) else {
        return format!("invalid 0x{word:08x}");
    };
    let name = op.mnemonic();
    match op.operands() {
        OpArgs::Zero => name.to_string(),
        OpArgs::Slot => format!("{name} r{}", field_wide(word)),
        OpArgs::Label => format!("{name} {}", field_wide(word)),
        OpArgs::SlotSlot => format!("{name} r{} r{}", field_a(word), field_bc(word)),
        OpArgs::SlotLabel => format!("{name} r{} {}", field_a(word), field_bc_signed(word)),
        OpArgs::SlotImm => format!("{name} r{} {}", field_a(word), field_bc_signed(word)),
        OpArgs::SlotUImm => format!("{name} r{} {}", field_a(word), field_bc(word)),
        OpArgs::SlotFuncDef => format!("{name} r{} d{}", field_a(word), field_bc(word)),
        OpArgs::SlotConstant => format!("{name} r{} c{}", field_a(word), field_bc(word)),
        OpArgs::SlotSlotSlot => format!(
            "{name} r{} r{} r{}",
            field_a(word),
            field_b(word),
            field_c(word)
        ),
        OpArgs::SlotSlotImm => format!(
            "{name} r{} r{} {}",
            field_a(word),
            field_b(word),
            (word as i32) >> 24
        ),
        OpArgs::SlotSlotUImm => format!(
            "{name} r{} r{} {}",
            field_a(word),
            field_b(word),
            field_c(word)
        ),
        OpArgs::SlotEnvSlot => format!(
            "{name} r{} e{} r{}",
            field_a(word),
            field_b(word),
            field_c(word)
        ),
    }
}

/// One (line, column) pair per instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceMapping {
    pub line: i32,
    pub column: i32,
}

/// The compiled function accepts any number of extra arguments past its
/// declared arity.
pub const FUNCDEF_FLAG_VARARG: u32 = 0x1;
/// The compiled function rejects calls that do not match its arity exactly.
pub const FUNCDEF_FLAG_FIXARITY: u32 = 0x2;
/// The compiled function's locals are captured by nested closures, so the
/// interpreter must keep its environment alive on return.
pub const FUNCDEF_FLAG_NEEDSENV: u32 = 0x4;

/// The immutable function-definition artifact handed to the interpreter.
pub struct FuncDef {
    pub bytecode: Box<[u32]>,
    pub constants: Box<[Value]>,
    /// Nested function definitions, indexed by the closure instruction
    pub defs: Box<[Rc<FuncDef>]>,
    /// Captured environments: each entry is an index into the parent
    /// function's environments, or -1 for the parent's own locals
    pub environments: Box<[i32]>,
    pub arity: i32,
    pub flags: u32,
    /// Number of registers the function needs
    pub slot_count: i32,
    pub name: Option<Rc<str>>,
    pub source: Option<Rc<str>>,
    /// Parallel to `bytecode`
    pub source_map: Box<[SourceMapping]>,
}

impl FuncDef {
    pub fn vararg(&self) -> bool {
        self.flags & FUNCDEF_FLAG_VARARG != 0
    }

    pub fn needs_env(&self) -> bool {
        self.flags & FUNCDEF_FLAG_NEEDSENV != 0
    }

    /// Mnemonic listing of the bytecode, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, &word) in self.bytecode.iter().enumerate() {
            let map = self.source_map.get(i).copied().unwrap_or_default();
            out.push_str(&format!(
                "{i:04} {} ; {}:{}\n",
                disassemble_word(word),
                map.line,
                map.column
            ));
        }
        out
    }

    /// Just the opcodes, for structural assertions.
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.bytecode
            .iter()
            .filter_map(|&word| opcode(word))
            .collect()
    }
}

impl fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "FuncDef(name={:?}, arity={}, slots={}, flags={:#x}, {} words, {} constants, {} defs)",
            self.name,
            self.arity,
            self.slot_count,
            self.flags,
            self.bytecode.len(),
            self.constants.len(),
            self.defs.len()
        )
    }
}
