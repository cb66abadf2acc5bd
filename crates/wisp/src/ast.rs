//! The AST shape the core consumes. Scanning and parsing are external
//! collaborators; this module only defines the interface they hand off.
//!
//! Every [`IdentExpr`] and [`LabelRef`] starts with `binding: None` and is
//! filled in by [`crate::resolver::resolve`]; the compiler panics (a
//! programming error, not a user-facing one) if it ever encounters `None`
//! here.

use std::cell::RefCell;

use crate::{
    binding::{BindingRef, ResolvedFunctionInfo},
    pos::Pos,
};

/// A source-level identifier occurrence.
#[derive(Debug, Clone)]
pub struct IdentExpr {
    pub name: String,
    pub pos: Pos,
    pub binding: RefCell<Option<BindingRef>>,
}

impl IdentExpr {
    #[must_use]
    pub fn new(name: impl Into<String>, pos: Pos) -> Self {
        Self {
            name: name.into(),
            pos,
            binding: RefCell::new(None),
        }
    }
}

/// A `break`/`continue`/`goto` target name.
#[derive(Debug, Clone)]
pub struct LabelRef {
    pub name: String,
    pub pos: Pos,
    pub binding: RefCell<Option<BindingRef>>,
}

impl LabelRef {
    #[must_use]
    pub fn new(name: impl Into<String>, pos: Pos) -> Self {
        Self {
            name: name.into(),
            pos,
            binding: RefCell::new(None),
        }
    }
}

/// A label declaration site (`label:`). Carries its own binding so the
/// compiler can recover the label's index without re-deriving it by
/// re-walking the tree in lockstep with the resolver.
#[derive(Debug, Clone)]
pub struct LabelDecl {
    pub name: String,
    pub pos: Pos,
    pub binding: RefCell<Option<BindingRef>>,
}

impl LabelDecl {
    #[must_use]
    pub fn new(name: impl Into<String>, pos: Pos) -> Self {
        Self {
            name: name.into(),
            pos,
            binding: RefCell::new(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Xor,
    BitAnd,
    BitOr,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Plus,
    Minus,
    BitNot,
    Not,
    Len,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(String),
    Ident(IdentExpr),
    Unary {
        op: UnOp,
        expr: Box<Expr>,
        pos: Pos,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        pos: Pos,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        pos: Pos,
    },
    Index {
        recv: Box<Expr>,
        key: Box<Expr>,
        pos: Pos,
    },
    Attr {
        recv: Box<Expr>,
        name: String,
        pos: Pos,
    },
    Tuple(Vec<Expr>),
    Array(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    FuncLit(Box<FuncDef>),
}

impl Expr {
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Expr::Nil)
    }
}

/// An lvalue usable on the left of `=` / augmented assignment / as a
/// `for`-loop target.
#[derive(Debug, Clone)]
pub enum Target {
    Ident(IdentExpr),
    Index { recv: Box<Expr>, key: Box<Expr>, pos: Pos },
    Attr { recv: Box<Expr>, name: String, pos: Pos },
    Tuple(Vec<Target>),
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub has_varargs: bool,
    pub body: Block,
    pub pos: Pos,
    /// Filled in by [`crate::resolver::resolve`].
    pub resolved: RefCell<Option<ResolvedFunctionInfo>>,
    /// The binding `Stmt::FuncDef`'s own name was declared under in the
    /// enclosing block (`None` for a bare `FuncLit` expression, which
    /// declares nothing). Lets the compiler recover where to store the
    /// compiled function value without re-deriving it.
    pub self_binding: RefCell<Option<BindingRef>>,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    /// `(field name, initializer)` pairs, in source order.
    pub fields: Vec<(String, Expr)>,
    /// `(method name, def)` pairs, in source order.
    pub methods: Vec<(String, FuncDef)>,
    pub pos: Pos,
    /// The binding `name` was declared under in the enclosing block.
    pub binding: RefCell<Option<BindingRef>>,
}

#[derive(Debug, Clone)]
pub struct Block(pub Vec<Stmt>);

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Expr),
    Let {
        target: Target,
        is_const: bool,
        value: Expr,
    },
    Assign {
        target: Target,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    If {
        /// `Some` when the condition is a `let`/`const` declaration whose
        /// bindings are scoped to `then` only.
        cond_decl: Option<(Target, bool, Expr)>,
        cond: Option<Expr>,
        then: Block,
        else_: Option<Block>,
    },
    Guard {
        target: Target,
        is_const: bool,
        value: Expr,
        else_: Block,
    },
    For3 {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        post: Option<Box<Stmt>>,
        body: Block,
    },
    ForIn {
        targets: Vec<Target>,
        iter: Expr,
        body: Block,
    },
    FuncDef(Box<FuncDef>),
    ClassDef(Box<ClassDef>),
    Defer(Block),
    Catch(Block),
    Return(Option<Expr>),
    Break(Option<LabelRef>),
    Continue(Option<LabelRef>),
    Goto(LabelRef),
    LabelDecl(LabelDecl),
    /// `throw expr` raises; bare `throw` (expr = None) re-raises inside a catch.
    Throw(Option<Expr>, Pos),
    Block(Block),
}

/// A parsed, not-yet-resolved chunk: a whole source file or REPL entry.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub filename: String,
    pub body: Block,
    /// Filled in by [`crate::resolver::resolve`].
    pub resolved: RefCell<Option<ResolvedFunctionInfo>>,
}
