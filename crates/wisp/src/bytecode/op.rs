//! The closed opcode set and the static stack-effect table that backs
//! stack-depth inference in [`super::builder::CodeBuilder`].
//!
//! Opcodes are partitioned into a no-argument prefix and an argument-
//! bearing suffix; [`Opcode::ARG_MIN`] is the first argument-bearing
//! discriminant. `NOP` is deliberately opcode `0`: the jump-operand
//! padding scheme depends on a zero byte reading back as `NOP`.

/// First discriminant that takes an operand. Every opcode below this is
/// a bare zero-operand instruction.
pub const ARG_MIN: u8 = 41;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // --- no-operand opcodes: must stay below ARG_MIN ---
    Nop = 0,
    Dup,
    Dup2,
    Pop,
    Exch,
    Lt,
    Le,
    Gt,
    Ge,
    Eql,
    Neq,
    /// `lhs in rhs`. Not in the summary table's operator list (which names
    /// `in` as a binary-dispatch behavior, not a symbol with its own row);
    /// see `DESIGN.md`.
    In,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Circumflex,
    Ampersand,
    Pipe,
    LtLt,
    GtGt,
    UPlus,
    UMinus,
    UTilde,
    Not,
    Len,
    Nil,
    True,
    False,
    Index,
    SetIndex,
    SetMap,
    IterPush,
    IterPop,
    Return,
    RunDefer,
    DeferExit,
    /// `throw expr`: pops a value, raises it as a catchable `UserError`.
    /// Not named in the summary table's closed list; see `DESIGN.md` for
    /// why the core needs it to implement `throw` at all.
    Throw,
    /// Bare `throw` (re-raise): re-arms the in-flight error most recently
    /// cleared by the active `catch` handler. Valid only where the resolver
    /// allows a bare `throw`.
    Rethrow,

    // --- ULEB128-operand opcodes ---
    Constant,
    MakeTuple,
    MakeArray,
    MakeMap,
    MakeFunc,
    Local,
    SetLocal,
    LocalCell,
    SetLocalCell,
    Free,
    FreeCell,
    /// Writes through a captured free variable's cell. Not named in the
    /// closed set's summary table but required by its own symmetry (every
    /// other read opcode there has a `Set`-prefixed sibling) and by the
    /// closure-mutation scenario in the testable-properties list — see
    /// `DESIGN.md`.
    SetFreeCell,
    Predeclared,
    Universal,
    Attr,
    SetField,
    Call,
    CallVar,
    Load,

    // --- 4-byte padded-varint jump opcodes ---
    Jmp,
    CJmp,
    IterJmp,
    CatchJmp,
}

/// The static, argument-independent stack effect of an opcode, or `None`
/// when the effect depends on a runtime arity (`CALL*`, `MAKETUPLE`,
/// `MAKEARRAY`, `MAKEMAP`, `MAKEFUNC`, `ITERJMP`).
impl Opcode {
    /// Decodes a raw opcode byte, or `None` if it names no opcode (the VM
    /// treats that as an internal/corrupt-bytecode error, never a guest
    /// fault — a resolved, compiled program never emits one).
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Opcode> {
        const TABLE: [Opcode; 64] = [
            Opcode::Nop,
            Opcode::Dup,
            Opcode::Dup2,
            Opcode::Pop,
            Opcode::Exch,
            Opcode::Lt,
            Opcode::Le,
            Opcode::Gt,
            Opcode::Ge,
            Opcode::Eql,
            Opcode::Neq,
            Opcode::In,
            Opcode::Plus,
            Opcode::Minus,
            Opcode::Star,
            Opcode::Slash,
            Opcode::SlashSlash,
            Opcode::Percent,
            Opcode::Circumflex,
            Opcode::Ampersand,
            Opcode::Pipe,
            Opcode::LtLt,
            Opcode::GtGt,
            Opcode::UPlus,
            Opcode::UMinus,
            Opcode::UTilde,
            Opcode::Not,
            Opcode::Len,
            Opcode::Nil,
            Opcode::True,
            Opcode::False,
            Opcode::Index,
            Opcode::SetIndex,
            Opcode::SetMap,
            Opcode::IterPush,
            Opcode::IterPop,
            Opcode::Return,
            Opcode::RunDefer,
            Opcode::DeferExit,
            Opcode::Throw,
            Opcode::Rethrow,
            Opcode::Constant,
            Opcode::MakeTuple,
            Opcode::MakeArray,
            Opcode::MakeMap,
            Opcode::MakeFunc,
            Opcode::Local,
            Opcode::SetLocal,
            Opcode::LocalCell,
            Opcode::SetLocalCell,
            Opcode::Free,
            Opcode::FreeCell,
            Opcode::SetFreeCell,
            Opcode::Predeclared,
            Opcode::Universal,
            Opcode::Attr,
            Opcode::SetField,
            Opcode::Call,
            Opcode::CallVar,
            Opcode::Load,
            Opcode::Jmp,
            Opcode::CJmp,
            Opcode::IterJmp,
            Opcode::CatchJmp,
        ];
        TABLE.get(b as usize).copied()
    }

    #[must_use]
    pub fn takes_operand(self) -> bool {
        (self as u8) >= ARG_MIN
    }

    #[must_use]
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::CJmp | Opcode::IterJmp | Opcode::CatchJmp)
    }

    /// `MAKEFUNC<i>` is *not* here even though it closes over a variable
    /// number of free variables: by the time it runs, the compiler has
    /// already packed them into a single tuple with `MAKETUPLE<n>`, so
    /// `MAKEFUNC` always pops exactly one value and pushes one.
    #[must_use]
    pub fn has_variable_effect(self) -> bool {
        matches!(
            self,
            Opcode::Call | Opcode::CallVar | Opcode::IterJmp | Opcode::MakeTuple | Opcode::MakeArray | Opcode::MakeMap
        )
    }

    /// `None` for opcodes with [`Self::has_variable_effect`]; the compiler
    /// computes those from the operand/target metadata instead.
    #[must_use]
    pub fn stack_effect(self) -> Option<i32> {
        use Opcode::{
            Ampersand, Attr, CJmp, CatchJmp, Circumflex, Constant, Dup, Dup2, DeferExit, Eql, Exch, False, Free,
            FreeCell, Ge, Gt, GtGt, In, Index, IterPop, IterPush, Jmp, Le, Len, Local, LocalCell, Lt, LtLt, Minus,
            Neq, Nil, Nop, Not, Percent, Pipe, Plus, Pop, Predeclared, Rethrow, Return, RunDefer, SetField,
            SetFreeCell, SetIndex, SetLocal, SetLocalCell, SetMap, Slash, SlashSlash, Star, Throw, True, UMinus,
            UPlus, UTilde, Universal,
        };
        Some(match self {
            Nop | RunDefer | DeferExit | Return | Rethrow => 0,
            Dup => 1,
            Dup2 => 2,
            Pop => -1,
            Exch => 0,
            Lt | Le | Gt | Ge | Eql | Neq | In => -1,
            Plus | Minus | Star | Slash | SlashSlash | Percent | Circumflex | Ampersand | Pipe | LtLt | GtGt => -1,
            UPlus | UMinus | UTilde | Not | Len => 0,
            Nil | True | False | Constant | Local | LocalCell | Free | FreeCell | Predeclared | Universal => 1,
            Opcode::MakeFunc => 0,
            SetLocal | SetLocalCell | SetFreeCell => -1,
            Index => -1,
            SetIndex | SetMap => -3,
            Attr => 0,
            SetField => -2,
            IterPush => -1,
            IterPop => 0,
            Jmp => 0,
            CJmp => -1,
            CatchJmp => 0,
            Throw => -1,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_byte_round_trips_every_table_entry() {
        for b in 0..64u8 {
            let op = Opcode::from_byte(b).unwrap_or_else(|| panic!("byte {b} decodes to no opcode"));
            assert_eq!(op as u8, b, "opcode {op:?} round-trips to a different byte");
        }
        assert!(Opcode::from_byte(64).is_none());
    }

    #[test]
    fn arg_min_splits_the_table_correctly() {
        for b in 0..64u8 {
            let op = Opcode::from_byte(b).unwrap();
            assert_eq!(op.takes_operand(), b >= ARG_MIN, "{op:?} disagrees with ARG_MIN split at byte {b}");
        }
    }

    #[test]
    fn jump_opcodes_take_operands_and_are_not_variable_effect() {
        for op in [Opcode::Jmp, Opcode::CJmp, Opcode::IterJmp, Opcode::CatchJmp] {
            assert!(op.is_jump());
            assert!(op.takes_operand());
        }
        // IterJmp's effect depends on whether the iterator yields, so it's
        // excluded from the static stack_effect table despite being a jump.
        assert!(Opcode::IterJmp.has_variable_effect());
        assert!(Opcode::IterJmp.stack_effect().is_none());
    }

    #[test]
    fn nop_is_opcode_zero() {
        assert_eq!(Opcode::Nop as u8, 0);
    }

    #[test]
    fn variable_effect_opcodes_have_no_static_stack_effect() {
        for op in [Opcode::Call, Opcode::CallVar, Opcode::MakeTuple, Opcode::MakeArray, Opcode::MakeMap] {
            assert!(op.has_variable_effect());
            assert!(op.stack_effect().is_none());
        }
        // MakeFunc pops one tuple of cells and pushes one function value,
        // a fixed net-zero effect despite closing over a variable freevar count.
        assert!(!Opcode::MakeFunc.has_variable_effect());
        assert_eq!(Opcode::MakeFunc.stack_effect(), Some(0));
    }
}
