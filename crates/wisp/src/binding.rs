//! The binding model produced by the resolver.
//!
//! A [`Binding`] is created once, while the resolver walks a declaration,
//! and shared (via [`BindingRef`]) by every [`crate::ast::IdentExpr`] that
//! refers to it. Sharing the same cell is what lets the resolver promote a
//! `Local` to `Cell` the first time a nested function captures it and have
//! every earlier-resolved reference observe the change — the scope field
//! is the only part of a `Binding` that is allowed to change after it is
//! first assigned.

use std::{cell::RefCell, rc::Rc};

use crate::pos::Pos;

/// Shared handle to a [`Binding`]; cloning is cheap (`Rc` bump).
pub type BindingRef = Rc<RefCell<Binding>>;

/// What an identifier or label resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Resolution failed; a `ResolveError` has been recorded.
    Undefined,
    /// A slot in the owning function's `Locals` table.
    Local,
    /// Like `Local`, but boxed in a [`crate::value::Value::Cell`] because a
    /// nested function captures it.
    Cell,
    /// A slot in the current function's `FreeVars` table, pointing at an
    /// enclosing function's cell.
    Free,
    /// A name looked up in the thread's `Predeclared` map at runtime.
    Predeclared,
    /// A name looked up in the process-wide `Universe` table at runtime.
    Universal,
    /// A `goto` target: a slot in the function's `Labels` table.
    Label,
    /// A label immediately preceding a loop, valid for `break`/`continue`.
    LoopLabel,
}

/// A single name/label binding, mutable only in its `scope` field and only
/// from `Local` to `Cell`.
#[derive(Debug, Clone)]
pub struct Binding {
    pub scope: Scope,
    pub is_const: bool,
    /// Meaning depends on `scope`: index into `Locals`/`FreeVars`/`Labels`;
    /// `0` for `Predeclared`/`Universal`/`Undefined`.
    pub index: u32,
    /// Where this binding was introduced (or first referenced, for globals).
    pub decl: Pos,
    /// The declared name, kept for diagnostics.
    pub name: String,
}

impl Binding {
    #[must_use]
    pub fn new(scope: Scope, is_const: bool, index: u32, decl: Pos, name: impl Into<String>) -> BindingRef {
        Rc::new(RefCell::new(Self {
            scope,
            is_const,
            index,
            decl,
            name: name.into(),
        }))
    }

    /// Promotes a `Local` binding to `Cell` in place. No-op if already `Cell`.
    ///
    /// # Panics
    ///
    /// Panics if called on a binding whose scope is neither `Local` nor
    /// `Cell` — the resolver never attempts to capture anything else by
    /// value (free variables are captured by `Free`, not by re-promoting).
    pub fn promote_to_cell(this: &BindingRef) {
        let mut b = this.borrow_mut();
        match b.scope {
            Scope::Cell => {}
            Scope::Local => b.scope = Scope::Cell,
            other => panic!("cannot promote binding with scope {other:?} to Cell"),
        }
    }

    /// Promotes a plain `Label` to `LoopLabel` in place, once the resolver
    /// discovers the label it just declared immediately precedes a loop
    /// statement. No-op if already `LoopLabel`.
    ///
    /// # Panics
    ///
    /// Panics if called on a binding whose scope isn't `Label`/`LoopLabel`.
    pub fn promote_to_loop_label(this: &BindingRef) {
        let mut b = this.borrow_mut();
        match b.scope {
            Scope::LoopLabel => {}
            Scope::Label => b.scope = Scope::LoopLabel,
            other => panic!("cannot promote binding with scope {other:?} to LoopLabel"),
        }
    }
}

/// Where a function's `FreeVars` entry gets its cell from, relative to the
/// *directly* enclosing function (one hop up, not the ultimate owner).
///
/// Threading a capture down through several nested functions produces one
/// of these per hop: the function adjacent to the owner sees `Local` (the
/// owner's own, now-`Cell`, local slot); every function further out sees
/// `Free` (its parent's own `FreeVars` slot, itself either case
/// recursively).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeVarSource {
    /// Index into the enclosing function's `Locals` (a `Cell`-scope slot).
    Local(u32),
    /// Index into the enclosing function's own `FreeVars`.
    Free(u32),
}

/// Per-function output of the resolver, attached to a [`crate::ast::FuncDef`]
/// or [`crate::ast::Chunk`] once resolution completes.
#[derive(Debug, Clone, Default)]
pub struct ResolvedFunctionInfo {
    pub num_locals: u32,
    /// Indices into `Locals` that were promoted to `Cell`.
    pub cells: Vec<u32>,
    /// Names of captured free variables, in `FreeVars` order.
    pub freevars: Vec<String>,
    /// Parallel to `freevars`: where the enclosing function supplies each
    /// captured cell from. Consumed by the compiler when emitting the
    /// `FREE`/`LOCAL` pushes that precede `MAKEFUNC`.
    pub freevar_sources: Vec<FreeVarSource>,
    pub num_labels: u32,
}
