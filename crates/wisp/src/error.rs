//! Error kinds and runtime error carriers.
//!
//! These are hand-rolled with `strum` for the string conversions rather
//! than pulled in through `thiserror` — there is no error-derive machinery
//! here beyond what `strum::Display`/`EnumString` already give us for free.

use std::fmt;

use strum::{Display as StrumDisplay, EnumString, IntoStaticStr};

use crate::{pos::Pos, value::Value};

/// The closed set of error kinds a running program can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString, IntoStaticStr)]
pub enum ErrorKind {
    TypeError,
    IndexError,
    KeyError,
    DivideByZero,
    AttrError,
    NameError,
    UserError,
    /// Never observable by a `catch` protected region.
    RecursionLimit,
    /// Never observable by a `catch` protected region.
    Cancelled,
}

impl ErrorKind {
    /// Whether a `catch` protected region is allowed to observe this kind.
    #[must_use]
    pub fn is_catchable(self) -> bool {
        !matches!(self, ErrorKind::RecursionLimit | ErrorKind::Cancelled)
    }
}

/// An error produced while running a program.
///
/// `Raised` carries a position (the active pc's source location, if the
/// position table has one) alongside the kind and a short message.
/// `Internal` signals a compiler/VM invariant violation rather than a
/// guest-observable fault — a resolved AST is expected to always compile,
/// so this variant marks a bug rather than a user mistake.
#[derive(Debug, Clone)]
pub enum RunError {
    Raised {
        kind: ErrorKind,
        message: String,
        pos: Option<Pos>,
        /// The original value passed to `throw`, preserved so a `catch` body
        /// could in principle inspect it. `None` for errors the VM itself
        /// raises (type errors, index errors, ...).
        payload: Option<Value>,
    },
    Internal(String),
}

impl RunError {
    #[must_use]
    pub fn raised(kind: ErrorKind, message: impl Into<String>, pos: Option<Pos>) -> Self {
        Self::Raised {
            kind,
            message: message.into(),
            pos,
            payload: None,
        }
    }

    #[must_use]
    pub fn thrown(message: impl Into<String>, pos: Option<Pos>, payload: Value) -> Self {
        Self::Raised {
            kind: ErrorKind::UserError,
            message: message.into(),
            pos,
            payload: Some(payload),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Raised { kind, .. } => Some(*kind),
            Self::Internal(_) => None,
        }
    }

    /// Whether a `catch` region may observe and clear this error. A
    /// non-catchable error still runs every pending `defer` on its way out.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Raised { kind, .. } if kind.is_catchable())
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raised { kind, message, pos, .. } => {
                if let Some(pos) = pos {
                    write!(f, "{kind}: {message} (line {}, col {})", pos.line, pos.col)
                } else {
                    write!(f, "{kind}: {message}")
                }
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for RunError {}

/// One failure recorded by the resolver.
#[derive(Debug, Clone)]
pub struct ResolveIssue {
    pub pos: Pos,
    pub message: String,
}

impl fmt::Display for ResolveIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.pos.line, self.pos.col, self.message)
    }
}

/// All resolve-time failures for a compilation unit.
#[derive(Debug, Clone, Default)]
pub struct ResolveError {
    pub issues: Vec<ResolveIssue>,
}

impl ResolveError {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn push(&mut self, pos: Pos, message: impl Into<String>) {
        self.issues.push(ResolveIssue {
            pos,
            message: message.into(),
        });
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ResolveError {}
