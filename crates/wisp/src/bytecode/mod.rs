//! Bytecode representation: opcode set, operand encoding, the compiled
//! `Program`/`Funcode` types, the emitting `CodeBuilder`, and the
//! AST-to-bytecode compiler.
//!
//! # Module structure
//!
//! - `op` — the closed opcode set and its stack-effect table
//! - `encoding` — ULEB128 and padded-jump operand codecs
//! - `code` — `Program`, `Funcode`, `Constant`, `ProtectedRegion`
//! - `builder` — `CodeBuilder`, the single-pass bytecode emitter
//! - `compiler` — lowers a resolved AST into a `Program`

pub use code::{Constant, Funcode, Program};
pub use compiler::compile;
pub use op::Opcode;

pub mod builder;
pub mod code;
pub mod compiler;
pub mod encoding;
pub mod op;
