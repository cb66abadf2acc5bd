//! VM execution tracing hooks.
//!
//! [`Tracer`] gives an embedder a window into the interpreter loop without
//! the VM depending on `tracing`/`log` directly: every hook has a no-op
//! default, so [`NoopTracer`] compiles away entirely and the VM stays
//! generic (`Vm<Tr: Tracer>`) rather than paying for a trait object on
//! the hot path.

use crate::{bytecode::Opcode, error::RunError};

/// Hook points the interpreter loop calls at opcode/call/defer boundaries.
///
/// Every method defaults to doing nothing; implementations override only
/// the hooks they care about.
pub trait Tracer {
    /// Called immediately before decoding the opcode at `pc`.
    #[inline(always)]
    fn on_opcode(&mut self, _pc: u32, _opcode: Opcode, _frame_depth: usize) {}

    /// Called after a new frame has been pushed for a function call.
    #[inline(always)]
    fn on_call(&mut self, _func_name: &str, _frame_depth: usize) {}

    /// Called after a frame has been popped on normal return.
    #[inline(always)]
    fn on_return(&mut self, _frame_depth: usize) {}

    /// Called when a `defer` protected region's handler starts running.
    #[inline(always)]
    fn on_defer_enter(&mut self, _start_pc: u32) {}

    /// Called when a `catch` protected region's handler starts running.
    #[inline(always)]
    fn on_catch_enter(&mut self, _start_pc: u32) {}

    /// Called when an opcode raises a runtime error, before the
    /// defer/catch scan runs.
    #[inline(always)]
    fn on_error(&mut self, _err: &RunError) {}
}

/// Zero-cost default tracer. Every hook is an empty inline function, so
/// this monomorphizes to nothing extra in the interpreter loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// One event recorded by [`RecordingTracer`].
#[derive(Debug, Clone)]
pub enum TraceEvent {
    Opcode { pc: u32, opcode: Opcode, frame_depth: usize },
    Call { func_name: String, frame_depth: usize },
    Return { frame_depth: usize },
    DeferEnter { start_pc: u32 },
    CatchEnter { start_pc: u32 },
    Error { message: String },
}

/// Collects every hook call into a `Vec`, in order. Used by tests that
/// assert defer/catch ordering (spec §8 "Defer total ordering") or that a
/// particular call/return sequence happened.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for RecordingTracer {
    fn on_opcode(&mut self, pc: u32, opcode: Opcode, frame_depth: usize) {
        self.events.push(TraceEvent::Opcode { pc, opcode, frame_depth });
    }

    fn on_call(&mut self, func_name: &str, frame_depth: usize) {
        self.events.push(TraceEvent::Call { func_name: func_name.to_owned(), frame_depth });
    }

    fn on_return(&mut self, frame_depth: usize) {
        self.events.push(TraceEvent::Return { frame_depth });
    }

    fn on_defer_enter(&mut self, start_pc: u32) {
        self.events.push(TraceEvent::DeferEnter { start_pc });
    }

    fn on_catch_enter(&mut self, start_pc: u32) {
        self.events.push(TraceEvent::CatchEnter { start_pc });
    }

    fn on_error(&mut self, err: &RunError) {
        self.events.push(TraceEvent::Error { message: err.to_string() });
    }
}
