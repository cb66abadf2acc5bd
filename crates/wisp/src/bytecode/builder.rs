//! Emits bytecode for one function: opcode/operand encoding, forward-jump
//! patching, running/maximum operand-stack depth, the position table, and
//! the defer/catch protected-region tables.
//!
//! There is no intermediate control-flow graph: statements and
//! expressions are lowered directly into the byte vector, with forward
//! jumps tracked as [`JumpLabel`]s patched once their target is known
//! (the same shape as a conventional single-pass bytecode emitter). This
//! works because the source language's structured control flow never
//! needs a join point the direct-emission order can't express; see
//! `DESIGN.md` for why the block-graph linearization described for the
//! compiler is implemented this way instead.

use crate::{
    bytecode::{
        code::{Funcode, ProtectedRegion},
        encoding::{encode_jump_operand, write_uleb128},
        op::Opcode,
    },
    pos::{Pos, PositionTableBuilder},
};

/// A position reserved by [`CodeBuilder::emit_jump`]; pass it to
/// [`CodeBuilder::patch_jump`] once the destination is known.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

#[derive(Debug, Clone, Copy)]
enum Pc1 {
    FunctionEnd,
}

#[derive(Debug)]
struct PendingRegion {
    pc0: u32,
    start_pc: u32,
    pc1: Pc1,
}

#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytecode: Vec<u8>,
    positions: PositionTableBuilder,
    current_pos: Option<Pos>,
    stack_depth: i32,
    max_stack: u32,
    protected_scope: Vec<Pc1>,
    defers: Vec<PendingRegion>,
    catches: Vec<PendingRegion>,
    cells: Vec<u32>,
    freevars: Vec<String>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        u32::try_from(self.bytecode.len()).expect("bytecode exceeds u32 addressable range")
    }

    pub fn set_pos(&mut self, pos: Pos) {
        self.current_pos = Some(pos);
    }

    fn start_instruction(&mut self) {
        if let Some(pos) = self.current_pos {
            self.positions.record(self.offset(), pos);
        }
    }

    pub fn adjust_stack(&mut self, delta: i32) {
        self.stack_depth += delta;
        assert!(self.stack_depth >= 0, "operand stack underflow during emission");
        #[allow(clippy::cast_sign_loss)]
        let depth = self.stack_depth as u32;
        self.max_stack = self.max_stack.max(depth);
    }

    /// Emits a bare opcode with its table-declared fixed stack effect.
    pub fn emit(&mut self, op: Opcode) {
        assert!(!op.takes_operand() && !op.is_jump(), "{op:?} requires an operand");
        self.start_instruction();
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an opcode with a ULEB128 operand and its table-declared fixed
    /// stack effect (i.e. not one of `CALL*`/`MAKETUPLE`/`MAKEARRAY`/`MAKEMAP`).
    pub fn emit_arg(&mut self, op: Opcode, value: u32) {
        assert!(op.takes_operand() && !op.is_jump(), "{op:?} is not a ULEB128-operand opcode");
        self.start_instruction();
        self.bytecode.push(op as u8);
        write_uleb128(&mut self.bytecode, u64::from(value));
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an opcode whose stack effect depends on a runtime arity
    /// (`CALL<n>`, `CALL_VAR<n>`, `MAKETUPLE<n>`, `MAKEARRAY<n>`, `MAKEMAP<n>`).
    pub fn emit_arg_with_effect(&mut self, op: Opcode, value: u32, effect: i32) {
        assert!(op.has_variable_effect(), "{op:?} has a fixed stack effect; use emit_arg");
        self.start_instruction();
        self.bytecode.push(op as u8);
        write_uleb128(&mut self.bytecode, u64::from(value));
        self.adjust_stack(effect);
    }

    /// Emits a forward jump with a placeholder 4-byte operand, to be
    /// filled in by [`Self::patch_jump`]. `effect` is the caller-supplied
    /// stack effect for the path being modeled (jump opcodes have
    /// asymmetric effects across the branch/fall-through edges, so the
    /// compiler tracks that explicitly rather than relying on a table).
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode, effect: i32) -> JumpLabel {
        assert!(op.is_jump(), "{op:?} is not a jump opcode");
        self.start_instruction();
        self.bytecode.push(op as u8);
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.extend_from_slice(&[0u8; 4]);
        self.adjust_stack(effect);
        label
    }

    /// Fills in a jump reserved by [`Self::emit_jump`] with the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        self.patch_jump_to(label, self.offset());
    }

    pub fn patch_jump_to(&mut self, label: JumpLabel, target: u32) {
        let bytes = encode_jump_operand(target);
        self.bytecode[label.0..label.0 + 4].copy_from_slice(&bytes);
    }

    /// Emits a backward jump whose target is already known.
    pub fn emit_jump_to(&mut self, op: Opcode, target: u32, effect: i32) {
        assert!(op.is_jump(), "{op:?} is not a jump opcode");
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&encode_jump_operand(target));
        self.adjust_stack(effect);
    }

    pub fn mark_cell(&mut self, local_index: u32) {
        if !self.cells.contains(&local_index) {
            self.cells.push(local_index);
        }
    }

    pub fn add_freevar(&mut self, name: impl Into<String>) -> u32 {
        let name = name.into();
        if let Some(idx) = self.freevars.iter().position(|f| *f == name) {
            return u32::try_from(idx).unwrap();
        }
        let idx = u32::try_from(self.freevars.len()).unwrap();
        self.freevars.push(name);
        idx
    }

    /// Pushes the protected-region bound for declarations nested inside a
    /// `defer`/`catch` body currently being emitted: the same bound as
    /// the enclosing scope, since entering a handler body doesn't widen
    /// or narrow the effective protected range of anything declared
    /// inside it.
    pub fn push_protected_scope(&mut self) {
        let top = self.protected_scope.last().copied().unwrap_or(Pc1::FunctionEnd);
        self.protected_scope.push(top);
    }

    pub fn pop_protected_scope(&mut self) {
        self.protected_scope.pop();
    }

    /// Records a `defer`/`catch` protected region declared at the current
    /// lexical point. `pc0` is the jump target just past the leading
    /// `JMP<after>` over the handler body (the point where the remainder
    /// of the enclosing block resumes); `start_pc` is the handler body's
    /// first instruction.
    pub fn record_defer(&mut self, pc0: u32, start_pc: u32) {
        let pc1 = self.protected_scope.last().copied().unwrap_or(Pc1::FunctionEnd);
        self.defers.push(PendingRegion { pc0, start_pc, pc1 });
    }

    pub fn record_catch(&mut self, pc0: u32, start_pc: u32) {
        let pc1 = self.protected_scope.last().copied().unwrap_or(Pc1::FunctionEnd);
        self.catches.push(PendingRegion { pc0, start_pc, pc1 });
    }

    #[must_use]
    pub fn stack_depth(&self) -> i32 {
        self.stack_depth
    }

    #[must_use]
    pub fn build(self, name: impl Into<String>, num_locals: u32, num_params: u32, has_varargs: bool) -> Funcode {
        let len = self.offset();
        let resolve = |r: PendingRegion| ProtectedRegion {
            pc0: r.pc0,
            pc1: match r.pc1 {
                Pc1::FunctionEnd => len,
            },
            start_pc: r.start_pc,
        };
        Funcode {
            name: name.into(),
            code: self.bytecode,
            num_locals,
            cells: self.cells,
            freevars: self.freevars,
            defers: self.defers.into_iter().map(resolve).collect(),
            catches: self.catches.into_iter().map(resolve).collect(),
            max_stack: self.max_stack,
            num_params,
            has_varargs,
            position_table: self.positions.build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_tracks_running_and_max_stack_depth() {
        let mut b = CodeBuilder::new();
        b.emit(Opcode::Nil); // +1
        b.emit(Opcode::True); // +1
        b.emit(Opcode::Plus); // -1
        assert_eq!(b.stack_depth(), 1);
        let code = b.build("f", 0, 0, false);
        assert_eq!(code.max_stack, 2);
    }

    #[test]
    #[should_panic(expected = "operand stack underflow")]
    fn popping_below_zero_panics() {
        let mut b = CodeBuilder::new();
        b.emit(Opcode::Pop);
    }

    #[test]
    fn forward_jump_patches_to_current_offset() {
        let mut b = CodeBuilder::new();
        let label = b.emit_jump(Opcode::Jmp, 0);
        b.emit(Opcode::Nil);
        let target = b.offset();
        b.patch_jump(label);
        let code = b.build("f", 0, 0, false);
        // JMP opcode byte, then a 4-byte padded operand encoding `target`.
        assert_eq!(code.code[0], Opcode::Jmp as u8);
        let operand: [u8; 4] = code.code[1..5].try_into().unwrap();
        assert_eq!(crate::bytecode::encoding::decode_jump_operand(operand), target);
    }

    #[test]
    fn record_defer_resolves_function_end_at_build_time() {
        let mut b = CodeBuilder::new();
        b.emit(Opcode::Nil);
        let pc0 = b.offset();
        b.record_defer(pc0, pc0);
        b.emit(Opcode::Pop);
        let end = b.offset();
        let code = b.build("f", 0, 0, false);
        assert_eq!(code.defers.len(), 1);
        assert_eq!(code.defers[0].pc0, pc0);
        assert_eq!(code.defers[0].pc1, end);
        assert_eq!(code.defers[0].start_pc, pc0);
    }

    #[test]
    fn nested_protected_scope_inherits_enclosing_bound() {
        let mut b = CodeBuilder::new();
        let outer_pc0 = b.offset();
        b.push_protected_scope();
        b.record_defer(outer_pc0, outer_pc0);
        // A defer declared while already inside another protected scope
        // inherits the same pc1, not a narrower one of its own.
        b.record_catch(outer_pc0, outer_pc0);
        b.pop_protected_scope();
        b.emit(Opcode::Nop);
        let end = b.offset();
        let code = b.build("f", 0, 0, false);
        assert_eq!(code.defers[0].pc1, end);
        assert_eq!(code.catches[0].pc1, end);
    }

    #[test]
    fn add_freevar_deduplicates_by_name() {
        let mut b = CodeBuilder::new();
        let first = b.add_freevar("x");
        let second = b.add_freevar("y");
        let third = b.add_freevar("x");
        assert_eq!(first, third);
        assert_ne!(first, second);
        let code = b.build("f", 0, 0, false);
        assert_eq!(code.freevars, vec!["x".to_string(), "y".to_string()]);
    }
}
