//! Instruction emission.
//!
//! Emitters take slots and produce instruction words, materializing slots
//! into byte-addressable registers as needed: constants load through the
//! pool (with small-integer and nil/true/false shortcuts), ref slots load
//! their backing cell and index it, upvalues go through the upvalue
//! load/store instructions, and far registers get shuffled through reserved
//! near temporaries. Every emitted word records the compiler's current
//! source mapping.

use crate::MAX_CONSTANTS;
use crate::bytecode::{Opcode, op1, op2, op3};
use crate::value::Value;

use super::scope::{RegTemp, SCOPE_FUNCTION};
use super::{Compiler, SLOT_CONSTANT, SLOT_REF, Slot};

impl Compiler<'_> {
    /// Append one instruction word with the current source mapping.
    pub(crate) fn emit(&mut self, word: u32) {
        self.buffer.push(word);
        self.mapbuffer.push(self.current_mapping);
    }

    /// Allocate a register anywhere in the 16-bit range.
    pub(crate) fn allocfar(&mut self) -> i32 {
        let reg = self.scope_mut().ra.alloc();
        if reg > 0xFFFF {
            self.cerror("ran out of internal registers");
        }
        reg
    }

    /// Allocate a byte-addressable temporary register.
    pub(crate) fn allocnear(&mut self, tag: RegTemp) -> i32 {
        self.scope_mut().ra.temp(tag)
    }

    /// Intern a constant in the enclosing function's pool, deduplicating by
    /// structural equality. The pool is capped at 65,535 entries.
    pub(crate) fn add_constant(&mut self, x: Value) -> i32 {
        let scope = self
            .scopes
            .iter_mut()
            .rev()
            .find(|s| s.flags & SCOPE_FUNCTION != 0)
            .expect("no enclosing function scope");
        if let Some(&at) = scope.const_map.get(&x) {
            return at;
        }
        if scope.consts.len() >= MAX_CONSTANTS {
            self.cerror("too many constants");
            return 0;
        }
        let at = scope.consts.len() as i32;
        scope.consts.push(x.clone());
        scope.const_map.insert(x, at);
        at
    }

    /// Load a constant value into a near register, using the immediate
    /// forms when they fit.
    pub(crate) fn load_constant(&mut self, k: Value, reg: i32) {
        let reg = reg as u32;
        match k {
            Value::Nil => self.emit(op1(Opcode::LoadNil, reg)),
            Value::Boolean(true) => self.emit(op1(Opcode::LoadTrue, reg)),
            Value::Boolean(false) => self.emit(op1(Opcode::LoadFalse, reg)),
            Value::Integer(i) if (i16::MIN as i32..=i16::MAX as i32).contains(&i) => {
                self.emit(op2(Opcode::LoadInteger, reg, i as u32));
            }
            other => {
                let at = self.add_constant(other);
                self.emit(op2(Opcode::LoadConstant, reg, at as u32));
            }
        }
    }

    /// Move a slot's value into a near register.
    pub(crate) fn movenear(&mut self, dest: i32, src: &Slot) {
        if src.flags & (SLOT_CONSTANT | SLOT_REF) != 0 {
            self.load_constant(src.constant.clone(), dest);
            // A ref slot holds its one-element cell; dereference it
            if src.flags & SLOT_REF != 0 {
                self.emit(op3(Opcode::GetIndex, dest as u32, dest as u32, 0));
            }
        } else if src.envindex >= 0 {
            self.emit(op3(
                Opcode::LoadUpvalue,
                dest as u32,
                src.envindex as u32,
                src.index as u32,
            ));
        } else if src.index > 0xFF || src.index != dest {
            self.emit(op2(Opcode::MoveNear, dest as u32, src.index as u32));
        }
    }

    /// Move a near register's value back into a slot.
    pub(crate) fn moveback(&mut self, dest: &Slot, src: i32) {
        if dest.flags & SLOT_REF != 0 {
            let refreg = self.allocnear(RegTemp::Temp5);
            self.load_constant(dest.constant.clone(), refreg);
            self.emit(op3(Opcode::PutIndex, refreg as u32, src as u32, 0));
            self.scope_mut().ra.free_temp(refreg, RegTemp::Temp5);
        } else if dest.envindex >= 0 {
            self.emit(op3(
                Opcode::SetUpvalue,
                src as u32,
                dest.envindex as u32,
                dest.index as u32,
            ));
        } else if dest.index != src {
            self.emit(op2(Opcode::MoveFar, src as u32, dest.index as u32));
        }
    }

    /// Release a register acquired for an instruction operand.
    fn free_regnear(&mut self, s: &Slot, reg: i32, tag: RegTemp) {
        if reg != s.index || s.envindex >= 0 || s.flags & (SLOT_CONSTANT | SLOT_REF) != 0 {
            // It was a temporary, not the slot's own register
            self.scope_mut().ra.free_temp(reg, tag);
        }
    }

    /// Materialize a slot into any 16-bit register.
    fn regfar(&mut self, s: &Slot, tag: RegTemp) -> i32 {
        if s.envindex < 0 && s.index >= 0 {
            return s.index;
        }
        let near = self.allocnear(tag);
        self.movenear(near, s);
        if near >= 0xF0 {
            let far = self.allocfar();
            self.emit(op2(Opcode::MoveFar, near as u32, far as u32));
            self.scope_mut().ra.free_temp(near, tag);
            far
        } else {
            self.scope_mut().ra.free_temp(near, tag);
            self.scope_mut().ra.touch(near);
            near
        }
    }

    /// Materialize a slot into a byte-addressable register.
    fn regnear(&mut self, s: &Slot, tag: RegTemp) -> i32 {
        if s.envindex < 0 && s.index >= 0 && s.index <= 0xFF {
            return s.index;
        }
        let reg = self.allocnear(tag);
        self.movenear(reg, s);
        reg
    }

    fn slots_equal(lhs: &Slot, rhs: &Slot) -> bool {
        let type_mask = !super::SLOTTYPE_ANY;
        if lhs.flags & type_mask == rhs.flags & type_mask
            && lhs.index == rhs.index
            && lhs.envindex == rhs.envindex
        {
            if lhs.flags & (SLOT_CONSTANT | SLOT_REF) != 0 {
                lhs.constant == rhs.constant
            } else {
                true
            }
        } else {
            false
        }
    }

    /// Move a value between slots. The destination must be writable.
    pub(crate) fn copy(&mut self, dest: &Slot, src: &Slot) {
        if dest.flags & SLOT_CONSTANT != 0 {
            self.cerror("cannot write to constant");
            return;
        }
        if Compiler::slots_equal(dest, src) {
            return;
        }
        // Near destination: load straight in
        if dest.envindex < 0 && dest.index >= 0 && dest.index <= 0xFF {
            self.movenear(dest.index, src);
            return;
        }
        // Near source: store straight out
        if src.envindex < 0 && src.index >= 0 && src.index <= 0xFF {
            self.moveback(dest, src.index);
            return;
        }
        // Neither is near: bounce through a temporary
        let near = self.allocnear(RegTemp::Temp3);
        self.movenear(near, src);
        self.moveback(dest, near);
        self.scope_mut().ra.free_temp(near, RegTemp::Temp3);
    }

    /// Emit `op` with one wide slot operand. Returns the instruction label.
    pub(crate) fn emit_s(&mut self, op: Opcode, s: &Slot, write_back: bool) -> usize {
        let reg = self.regfar(s, RegTemp::Temp0);
        let label = self.buffer.len();
        self.emit(op1(op, reg as u32));
        if write_back {
            self.moveback(s, reg);
        }
        self.free_regnear(s, reg, RegTemp::Temp0);
        label
    }

    /// Emit `op` with a near slot and a far slot.
    pub(crate) fn emit_ss(&mut self, op: Opcode, s1: &Slot, s2: &Slot, write_back: bool) -> usize {
        let reg1 = self.regnear(s1, RegTemp::Temp0);
        let reg2 = self.regfar(s2, RegTemp::Temp1);
        let label = self.buffer.len();
        self.emit(op2(op, reg1 as u32, reg2 as u32));
        self.free_regnear(s2, reg2, RegTemp::Temp1);
        if write_back {
            self.moveback(s1, reg1);
        }
        self.free_regnear(s1, reg1, RegTemp::Temp0);
        label
    }

    /// Emit `op` with a near slot and a 16-bit immediate (signed or not;
    /// the caller controls the bit pattern).
    fn emit_1s(&mut self, op: Opcode, s: &Slot, rest: i32, write_back: bool) -> usize {
        let reg = self.regnear(s, RegTemp::Temp0);
        let label = self.buffer.len();
        self.emit(op2(op, reg as u32, rest as u32));
        if write_back {
            self.moveback(s, reg);
        }
        self.free_regnear(s, reg, RegTemp::Temp0);
        label
    }

    pub(crate) fn emit_si(&mut self, op: Opcode, s: &Slot, immediate: i16, write_back: bool) -> usize {
        self.emit_1s(op, s, immediate as i32, write_back)
    }

    pub(crate) fn emit_su(&mut self, op: Opcode, s: &Slot, immediate: u16, write_back: bool) -> usize {
        self.emit_1s(op, s, immediate as i32, write_back)
    }

    fn emit_2s(&mut self, op: Opcode, s1: &Slot, s2: &Slot, rest: i32, write_back: bool) -> usize {
        let reg1 = self.regnear(s1, RegTemp::Temp0);
        let reg2 = self.regnear(s2, RegTemp::Temp1);
        let label = self.buffer.len();
        self.emit(op3(op, reg1 as u32, reg2 as u32, rest as u32));
        self.free_regnear(s2, reg2, RegTemp::Temp1);
        if write_back {
            self.moveback(s1, reg1);
        }
        self.free_regnear(s1, reg1, RegTemp::Temp0);
        label
    }

    pub(crate) fn emit_ssi(
        &mut self,
        op: Opcode,
        s1: &Slot,
        s2: &Slot,
        immediate: i8,
        write_back: bool,
    ) -> usize {
        self.emit_2s(op, s1, s2, immediate as i32, write_back)
    }

    pub(crate) fn emit_ssu(
        &mut self,
        op: Opcode,
        s1: &Slot,
        s2: &Slot,
        immediate: u8,
        write_back: bool,
    ) -> usize {
        self.emit_2s(op, s1, s2, immediate as i32, write_back)
    }

    /// Emit `op` with three near slots.
    pub(crate) fn emit_sss(
        &mut self,
        op: Opcode,
        s1: &Slot,
        s2: &Slot,
        s3: &Slot,
        write_back: bool,
    ) -> usize {
        let reg1 = self.regnear(s1, RegTemp::Temp0);
        let reg2 = self.regnear(s2, RegTemp::Temp1);
        let reg3 = self.regnear(s3, RegTemp::Temp2);
        let label = self.buffer.len();
        self.emit(op3(op, reg1 as u32, reg2 as u32, reg3 as u32));
        self.free_regnear(s2, reg2, RegTemp::Temp1);
        self.free_regnear(s3, reg3, RegTemp::Temp2);
        if write_back {
            self.moveback(s1, reg1);
        }
        self.free_regnear(s1, reg1, RegTemp::Temp0);
        label
    }

    /// Patch a previously emitted jump at `label` to target `to`, for the
    /// wide 24-bit offset form.
    pub(crate) fn patch_jump(&mut self, label: usize, to: usize) {
        let delta = to as i32 - label as i32;
        self.buffer[label] |= ((delta as u32) & 0xFFFFFF) << 8;
    }

    /// Patch a conditional jump's 16-bit offset field.
    pub(crate) fn patch_cond_jump(&mut self, label: usize, to: usize) {
        let delta = to as i32 - label as i32;
        if !(i16::MIN as i32..=i16::MAX as i32).contains(&delta) {
            self.cerror("jump is too far");
            return;
        }
        self.buffer[label] |= ((delta as u32) & 0xFFFF) << 16;
    }
}
