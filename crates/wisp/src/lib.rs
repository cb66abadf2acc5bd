#![doc = include_str!("../../../README.md")]

pub mod ast;
pub mod asm;
pub mod binding;
pub mod bytecode;
pub mod error;
pub mod intern;
pub mod pos;
pub mod resolver;
pub mod trace;
pub mod value;
pub mod vm;

pub use crate::{
    bytecode::{compile, Constant, Funcode, Program},
    error::{ErrorKind, ResolveError, ResolveIssue, RunError},
    resolver::resolve,
    trace::{NoopTracer, RecordingTracer, TraceEvent, Tracer},
    value::{ExternValue, FunctionValue, Value, ValueMap},
    vm::{run_program, CancelHandle, Thread, ThreadOptions},
};
