//! The virtual machine: `Thread`, `Frame`, and the opcode dispatch loop.
//!
//! The loop is flat, not recursive: a `CALL` pushes a [`Frame`] onto
//! [`Thread::call_stack`] and lets the same loop keep running with the new
//! frame on top, so guest call depth is bounded by `MaxCallStackDepth`
//! rather than the host stack (spec §4.5 "Frames are allocated from a
//! free-list embedded in the thread's call stack slack").

mod call;
pub mod exceptions;

use std::{
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ahash::AHashMap;

use crate::{
    ast::UnOp,
    bytecode::{
        code::{Constant, Program},
        encoding::{decode_jump_operand, read_uleb128},
        Opcode,
    },
    error::{ErrorKind, RunError},
    pos::Pos,
    trace::{NoopTracer, Tracer},
    value::{CellRef, FunctionValue, Value, ValueMap},
};

use self::exceptions::{DeferExitOutcome, DeferStack, TransferOutcome};
use crate::vm::{
    binary::{binary, unary},
    collections::{get_attr, get_index, make_iter, set_field, set_index, set_map_literal_entry, ValueIter},
    compare::{compare, contains},
};

pub mod binary;
pub mod collections;
pub mod compare;

/// Construction-time knobs for a [`Thread`] (spec §6 "Thread configuration").
///
/// `max_steps`/`max_call_stack_depth` of `None` mean "unlimited", matching
/// the source table's "`≤ 0` means unlimited" convention translated into
/// an `Option`.
pub struct ThreadOptions {
    pub name: String,
    pub max_steps: Option<u64>,
    pub disable_recursion: bool,
    pub max_call_stack_depth: Option<u32>,
    pub max_compare_depth: u32,
    pub predeclared: AHashMap<String, Value>,
    /// Invoked by `LOAD<n>` with the requested module name.
    pub load: Option<Box<dyn FnMut(&str) -> Result<Value, RunError>>>,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_steps: None,
            disable_recursion: false,
            max_call_stack_depth: None,
            max_compare_depth: 64,
            predeclared: AHashMap::default(),
            load: None,
        }
    }
}

/// A handle an embedder can hold independently of the `Thread` (and send
/// to another thread, unlike `Thread` itself) to request cooperative
/// cancellation (spec §5 "an external cancel... sets an atomic boolean").
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// `{ callable, pc }` (spec §4.5) plus the operand stack, locals, and
/// protected-region bookkeeping every concrete implementation needs beside
/// those two fields.
pub struct Frame {
    func: Rc<FunctionValue>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    pc: u32,
    defer_stack: DeferStack,
    in_flight_err: Option<RunError>,
    /// The value a `RETURN`/`DEFEREXIT`/`CATCHJMP(0)` is trying to produce,
    /// held here while a chain of handlers runs before it actually exits.
    pending_result: Option<Value>,
    /// Errors cleared by entering a `catch`, most-recently-entered last, so
    /// a bare `throw` (re-raise) inside that catch's body can re-arm the
    /// right one.
    caught_stack: Vec<RunError>,
    /// Index into `Thread::iter_stack` where this frame's own iterators
    /// begin; on any exit path, every iterator at or above this index is
    /// popped and `done()`'d.
    iter_base: usize,
    /// Address of the `CALL`/`CALL_VAR` in the *caller* that pushed this
    /// frame; meaningless for the outermost frame.
    call_site_pc: u32,
}

impl Frame {
    fn pos_at(&self, pc: u32) -> Option<Pos> {
        self.func.funcode.position_table.lookup(pc)
    }
}

/// A process-scoped execution context (spec §3 "Thread"): one call stack,
/// one iterator stack, generic over the [`Tracer`] it reports through.
pub struct Thread<Tr: Tracer = NoopTracer> {
    options: ThreadOptions,
    call_stack: Vec<Frame>,
    iter_stack: Vec<ValueIter>,
    steps: u64,
    cancelled: Arc<AtomicBool>,
    /// Set once by [`run_program`]; every function's constant/name pool
    /// lookups resolve through it, since [`FunctionValue`] itself carries
    /// only a `Funcode`, not a back-reference to its owning `Program`.
    program: Option<Rc<Program>>,
    /// Process-wide language built-ins (spec §9 "Global state"). Not part
    /// of `ThreadOptions` because it is meant to be constructed once by the
    /// embedder and shared (by `Rc` clone, not by a global) across every
    /// `Thread` it creates — see `DESIGN.md`.
    universe: Rc<AHashMap<String, Value>>,
    tracer: Tr,
}

impl<Tr: Tracer + Default> Thread<Tr> {
    #[must_use]
    pub fn new(options: ThreadOptions) -> Self {
        Self {
            options,
            call_stack: Vec::new(),
            iter_stack: Vec::new(),
            steps: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
            program: None,
            universe: Rc::new(AHashMap::default()),
            tracer: Tr::default(),
        }
    }
}

impl<Tr: Tracer> Thread<Tr> {
    #[must_use]
    pub fn with_tracer(options: ThreadOptions, tracer: Tr) -> Self {
        Self {
            options,
            call_stack: Vec::new(),
            iter_stack: Vec::new(),
            steps: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
            program: None,
            universe: Rc::new(AHashMap::default()),
            tracer,
        }
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    /// Shares a process-wide built-ins table across this and any other
    /// `Thread` the embedder constructs from the same `Rc`.
    pub fn set_universe(&mut self, universe: Rc<AHashMap<String, Value>>) {
        self.universe = universe;
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    #[must_use]
    pub fn tracer_mut(&mut self) -> &mut Tr {
        &mut self.tracer
    }

    fn program(&self) -> &Rc<Program> {
        self.program.as_ref().expect("opcode executed outside run_program")
    }

    /// `Call(th, v, args)` (spec §4.5 "Call entry"): rejects a non-callable
    /// `v` immediately, otherwise runs it (and anything it calls) to
    /// completion before returning.
    pub fn call(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, RunError> {
        let base_depth = self.call_stack.len();
        call::push_call(self, callee, args, 0)?;
        run_until_depth(self, base_depth)
    }
}

/// `RunProgram(thread, program)` (spec §6): creates the top-level function
/// and invokes it with zero arguments.
pub fn run_program<Tr: Tracer>(th: &mut Thread<Tr>, program: Rc<Program>) -> Result<Value, RunError> {
    let toplevel = Value::Function(Rc::new(FunctionValue {
        funcode: program.toplevel().clone(),
        freevars: Vec::new(),
    }));
    th.program = Some(program);
    th.call(toplevel, Vec::new())
}

fn constant_to_value(c: &Constant) -> Value {
    match c {
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::Str(Rc::from(s.as_str())),
    }
}

fn opcode_to_unop(op: Opcode) -> UnOp {
    match op {
        Opcode::UPlus => UnOp::Plus,
        Opcode::UMinus => UnOp::Minus,
        Opcode::UTilde => UnOp::BitNot,
        Opcode::Len => UnOp::Len,
        _ => unreachable!("opcode_to_unop called with a non-unary opcode"),
    }
}

fn opcode_to_binop(op: Opcode) -> crate::ast::BinOp {
    use crate::ast::BinOp;
    match op {
        Opcode::Plus => BinOp::Add,
        Opcode::Minus => BinOp::Sub,
        Opcode::Star => BinOp::Mul,
        Opcode::Slash => BinOp::Div,
        Opcode::SlashSlash => BinOp::FloorDiv,
        Opcode::Percent => BinOp::Mod,
        Opcode::Circumflex => BinOp::Xor,
        Opcode::Ampersand => BinOp::BitAnd,
        Opcode::Pipe => BinOp::BitOr,
        Opcode::LtLt => BinOp::Shl,
        Opcode::GtGt => BinOp::Shr,
        _ => unreachable!("opcode_to_binop called with a non-binary opcode"),
    }
}

fn apply_unary(op: Opcode, x: &Value) -> Result<Value, RunError> {
    let unop = opcode_to_unop(op);
    if let Some(v) = unary(unop, x)? {
        return Ok(v);
    }
    if let Value::Extern(e) = x {
        if let Some(r) = e.borrow().unary(unop) {
            return r;
        }
    }
    Err(RunError::raised(ErrorKind::TypeError, format!("unsupported unary op on '{}'", x.type_name()), None))
}

fn apply_binary(op: Opcode, x: &Value, y: &Value) -> Result<Value, RunError> {
    if let Some(v) = binary(op, x, y)? {
        return Ok(v);
    }
    let binop = opcode_to_binop(op);
    if let Value::Extern(e) = x {
        if let Some(r) = e.borrow().binary(binop, y, true) {
            return r;
        }
    }
    if let Value::Extern(e) = y {
        if let Some(r) = e.borrow().binary(binop, x, false) {
            return r;
        }
    }
    Err(RunError::raised(
        ErrorKind::TypeError,
        format!("unsupported binary op between '{}' and '{}'", x.type_name(), y.type_name()),
        None,
    ))
}

/// Wraps [`exceptions::on_transfer`], additionally tracking when the
/// transfer diverted into a `catch` (detected by the in-flight error going
/// from `Some` to `None`) so a bare `throw` inside that handler can
/// re-arm it.
fn scan_transfer<Tr: Tracer>(th: &mut Thread<Tr>, idx: usize, from: u32, to: Option<u32>) -> TransferOutcome {
    let cleared_err = th.call_stack[idx].in_flight_err.clone();
    let frame = &mut th.call_stack[idx];
    let outcome = exceptions::on_transfer(
        &frame.func.funcode.defers,
        &frame.func.funcode.catches,
        &mut frame.defer_stack,
        &mut frame.in_flight_err,
        from,
        to,
    );
    let became_none = frame.in_flight_err.is_none();

    if let TransferOutcome::Diverted(start_pc) = outcome {
        if became_none {
            if let Some(err) = cleared_err {
                th.call_stack[idx].caught_stack.push(err);
                th.tracer.on_catch_enter(start_pc);
                return outcome;
            }
        }
        th.tracer.on_defer_enter(start_pc);
    }
    outcome
}

/// Same wrapping as [`scan_transfer`], for [`exceptions::on_defer_exit`].
fn scan_defer_exit<Tr: Tracer>(th: &mut Thread<Tr>, idx: usize, current_pc: u32) -> DeferExitOutcome {
    let cleared_err = th.call_stack[idx].in_flight_err.clone();
    let frame = &mut th.call_stack[idx];
    let outcome = exceptions::on_defer_exit(
        &frame.func.funcode.defers,
        &frame.func.funcode.catches,
        &mut frame.defer_stack,
        &mut frame.in_flight_err,
        current_pc,
    );
    let became_none = frame.in_flight_err.is_none();

    if let DeferExitOutcome::Diverted(start_pc) = outcome {
        if became_none {
            if let Some(err) = cleared_err {
                th.call_stack[idx].caught_stack.push(err);
                th.tracer.on_catch_enter(start_pc);
                return outcome;
            }
        }
        th.tracer.on_defer_enter(start_pc);
    }
    outcome
}

/// What the dispatch loop should do next after handling one control-flow
/// event (a diversion decision, a frame exit, or plain fallthrough).
enum Flow {
    Resume,
    Finished(Result<Value, RunError>),
}

/// Pops the finished frame at `idx`, cleans up its iterators, and either
/// hands its result to the now-current top frame (pushing on success,
/// re-running that frame's own defer/catch scan on failure) or, if `idx`
/// was `base_depth`, reports the whole `run_until_depth` call's outcome.
fn exit_frame<Tr: Tracer>(th: &mut Thread<Tr>, mut idx: usize, base_depth: usize, mut result: Result<Value, RunError>) -> Flow {
    loop {
        let call_site_pc = th.call_stack[idx].call_site_pc;
        let iter_base = th.call_stack[idx].iter_base;
        while th.iter_stack.len() > iter_base {
            if let Some(mut it) = th.iter_stack.pop() {
                it.done();
            }
        }
        th.call_stack.pop();
        th.tracer.on_return(idx);

        if idx == base_depth {
            return Flow::Finished(result);
        }
        let caller_idx = idx - 1;
        match result {
            Ok(v) => {
                th.call_stack[caller_idx].stack.push(v);
                return Flow::Resume;
            }
            Err(e) => {
                th.call_stack[caller_idx].in_flight_err = Some(e);
                match scan_transfer(th, caller_idx, call_site_pc, None) {
                    TransferOutcome::Diverted(start_pc) => {
                        th.call_stack[caller_idx].pc = start_pc;
                        return Flow::Resume;
                    }
                    TransferOutcome::Proceed => {
                        // No handler in the caller either: it exits too, with
                        // the same error. Loop instead of recursing, so an
                        // error unwinding the entire call stack never grows
                        // the host stack.
                        let e = th.call_stack[caller_idx].in_flight_err.take().expect("in-flight error present");
                        idx = caller_idx;
                        result = Err(e);
                    }
                }
            }
        }
    }
}

/// Raises `err` as having occurred at `pc` in frame `idx`: fills in a
/// missing source position, runs the defer/catch scan, and either diverts
/// or lets the frame (and everything above `base_depth`) unwind.
fn raise_in_frame<Tr: Tracer>(th: &mut Thread<Tr>, idx: usize, pc: u32, base_depth: usize, mut err: RunError) -> Flow {
    if let RunError::Raised { pos, .. } = &mut err {
        if pos.is_none() {
            *pos = th.call_stack[idx].pos_at(pc);
        }
    }
    th.tracer.on_error(&err);
    th.call_stack[idx].in_flight_err = Some(err);
    match scan_transfer(th, idx, pc, None) {
        TransferOutcome::Diverted(start_pc) => {
            th.call_stack[idx].pc = start_pc;
            Flow::Resume
        }
        TransferOutcome::Proceed => {
            let e = th.call_stack[idx].in_flight_err.take().expect("in-flight error present");
            exit_frame(th, idx, base_depth, Err(e))
        }
    }
}

fn pop1(stack: &mut Vec<Value>) -> Value {
    stack.pop().expect("operand stack underflow")
}

/// Runs the flat dispatch loop until `Thread::call_stack` shrinks back to
/// `base_depth`, returning the result the frame at that depth produced.
fn run_until_depth<Tr: Tracer>(th: &mut Thread<Tr>, base_depth: usize) -> Result<Value, RunError> {
    loop {
        let idx = th.call_stack.len() - 1;
        let pc = th.call_stack[idx].pc;

        th.steps += 1;
        let step_limit_hit = th.options.max_steps.is_some_and(|max| th.steps >= max);
        if step_limit_hit || th.cancelled.load(Ordering::Relaxed) {
            let err = RunError::raised(ErrorKind::Cancelled, "execution cancelled", th.call_stack[idx].pos_at(pc));
            match raise_in_frame(th, idx, pc, base_depth, err) {
                Flow::Resume => continue,
                Flow::Finished(r) => return r,
            }
        }

        let code = &th.call_stack[idx].func.funcode.code;
        let Some(op) = Opcode::from_byte(code[pc as usize]) else {
            panic!("corrupt bytecode: invalid opcode byte at pc {pc}");
        };
        th.tracer.on_opcode(pc, op, idx + 1);

        let (operand, jump_target, next_pc) = if op.is_jump() {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&code[pc as usize + 1..pc as usize + 5]);
            (0u32, decode_jump_operand(bytes), pc + 5)
        } else if op.takes_operand() {
            let mut p = pc as usize + 1;
            let v = read_uleb128(code, &mut p);
            (u32::try_from(v).expect("operand exceeds u32 range"), 0, u32::try_from(p).expect("pc exceeds u32 range"))
        } else {
            (0, 0, pc + 1)
        };

        macro_rules! raise {
            ($err:expr) => {
                match raise_in_frame(th, idx, pc, base_depth, $err) {
                    Flow::Resume => continue,
                    Flow::Finished(r) => return r,
                }
            };
        }
        macro_rules! fallible {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => raise!(e),
                }
            };
        }

        match op {
            Opcode::Nop => th.call_stack[idx].pc = next_pc,
            Opcode::Dup => {
                let frame = &mut th.call_stack[idx];
                let v = frame.stack.last().expect("DUP with empty stack").clone();
                frame.stack.push(v);
                frame.pc = next_pc;
            }
            Opcode::Dup2 => {
                let frame = &mut th.call_stack[idx];
                let len = frame.stack.len();
                assert!(len >= 2, "DUP2 with fewer than 2 values");
                let (a, b) = (frame.stack[len - 2].clone(), frame.stack[len - 1].clone());
                frame.stack.push(a);
                frame.stack.push(b);
                frame.pc = next_pc;
            }
            Opcode::Pop => {
                let frame = &mut th.call_stack[idx];
                pop1(&mut frame.stack);
                frame.pc = next_pc;
            }
            Opcode::Exch => {
                let frame = &mut th.call_stack[idx];
                let len = frame.stack.len();
                assert!(len >= 2, "EXCH with fewer than 2 values");
                frame.stack.swap(len - 1, len - 2);
                frame.pc = next_pc;
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge | Opcode::Eql | Opcode::Neq => {
                let frame = &mut th.call_stack[idx];
                let y = pop1(&mut frame.stack);
                let x = pop1(&mut frame.stack);
                let max_depth = th.options.max_compare_depth;
                let b = fallible!(compare(op, &x, &y, max_depth));
                th.call_stack[idx].stack.push(Value::Bool(b));
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::In => {
                let frame = &mut th.call_stack[idx];
                let haystack = pop1(&mut frame.stack);
                let needle = pop1(&mut frame.stack);
                let max_depth = th.options.max_compare_depth;
                let b = fallible!(contains(&needle, &haystack, max_depth));
                th.call_stack[idx].stack.push(Value::Bool(b));
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::Plus
            | Opcode::Minus
            | Opcode::Star
            | Opcode::Slash
            | Opcode::SlashSlash
            | Opcode::Percent
            | Opcode::Circumflex
            | Opcode::Ampersand
            | Opcode::Pipe
            | Opcode::LtLt
            | Opcode::GtGt => {
                let frame = &mut th.call_stack[idx];
                let y = pop1(&mut frame.stack);
                let x = pop1(&mut frame.stack);
                let v = fallible!(apply_binary(op, &x, &y));
                th.call_stack[idx].stack.push(v);
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::UPlus | Opcode::UMinus | Opcode::UTilde | Opcode::Len => {
                let frame = &mut th.call_stack[idx];
                let x = pop1(&mut frame.stack);
                let v = fallible!(apply_unary(op, &x));
                th.call_stack[idx].stack.push(v);
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::Not => {
                let frame = &mut th.call_stack[idx];
                let x = pop1(&mut frame.stack);
                frame.stack.push(Value::Bool(!x.truthy()));
                frame.pc = next_pc;
            }
            Opcode::Nil => {
                let frame = &mut th.call_stack[idx];
                frame.stack.push(Value::Nil);
                frame.pc = next_pc;
            }
            Opcode::True => {
                let frame = &mut th.call_stack[idx];
                frame.stack.push(Value::Bool(true));
                frame.pc = next_pc;
            }
            Opcode::False => {
                let frame = &mut th.call_stack[idx];
                frame.stack.push(Value::Bool(false));
                frame.pc = next_pc;
            }
            Opcode::Index => {
                let frame = &mut th.call_stack[idx];
                let key = pop1(&mut frame.stack);
                let recv = pop1(&mut frame.stack);
                let v = fallible!(get_index(&recv, &key));
                th.call_stack[idx].stack.push(v);
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::SetIndex => {
                let frame = &mut th.call_stack[idx];
                let value = pop1(&mut frame.stack);
                let key = pop1(&mut frame.stack);
                let recv = pop1(&mut frame.stack);
                fallible!(set_index(&recv, key, value));
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::SetMap => {
                let frame = &mut th.call_stack[idx];
                let value = pop1(&mut frame.stack);
                let key = pop1(&mut frame.stack);
                let recv = pop1(&mut frame.stack);
                fallible!(set_map_literal_entry(&recv, key, value));
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::IterPush => {
                let v = pop1(&mut th.call_stack[idx].stack);
                let it = fallible!(make_iter(&v));
                th.iter_stack.push(it);
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::IterPop => {
                if let Some(mut it) = th.iter_stack.pop() {
                    it.done();
                }
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::IterJmp => {
                let next_val = th.iter_stack.last_mut().expect("ITERJMP with empty iterator stack").next();
                match next_val {
                    Some(v) => {
                        let frame = &mut th.call_stack[idx];
                        frame.stack.push(v);
                        frame.pc = next_pc;
                    }
                    None => match scan_transfer(th, idx, pc, Some(jump_target)) {
                        TransferOutcome::Diverted(start_pc) => th.call_stack[idx].pc = start_pc,
                        TransferOutcome::Proceed => th.call_stack[idx].pc = jump_target,
                    },
                }
            }
            Opcode::Return => {
                let v = pop1(&mut th.call_stack[idx].stack);
                th.call_stack[idx].pending_result = Some(v);
                match scan_transfer(th, idx, pc, None) {
                    TransferOutcome::Diverted(start_pc) => th.call_stack[idx].pc = start_pc,
                    TransferOutcome::Proceed => {
                        let v = th.call_stack[idx].pending_result.take().unwrap_or(Value::Nil);
                        match exit_frame(th, idx, base_depth, Ok(v)) {
                            Flow::Resume => {}
                            Flow::Finished(r) => return r,
                        }
                    }
                }
            }
            Opcode::RunDefer => {
                // Vestigial in this implementation: the scan that the
                // reference design defers to the opcode after RETURN
                // already ran inline at RETURN itself. See
                // `exceptions` module docs.
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::DeferExit => match scan_defer_exit(th, idx, pc) {
                DeferExitOutcome::Diverted(start_pc) => th.call_stack[idx].pc = start_pc,
                DeferExitOutcome::Resume(addr) => th.call_stack[idx].pc = addr,
                DeferExitOutcome::ExitFunction => {
                    let frame = &mut th.call_stack[idx];
                    let result = match frame.in_flight_err.take() {
                        Some(e) => Err(e),
                        None => Ok(frame.pending_result.take().unwrap_or(Value::Nil)),
                    };
                    match exit_frame(th, idx, base_depth, result) {
                        Flow::Resume => {}
                        Flow::Finished(r) => return r,
                    }
                }
            },
            Opcode::CatchJmp => {
                let frame = &mut th.call_stack[idx];
                frame.in_flight_err = None;
                frame.caught_stack.pop();
                let to = if jump_target == 0 { None } else { Some(jump_target) };
                if to.is_none() {
                    frame.pending_result = Some(Value::Nil);
                }
                match scan_transfer(th, idx, pc, to) {
                    TransferOutcome::Diverted(start_pc) => th.call_stack[idx].pc = start_pc,
                    TransferOutcome::Proceed => match to {
                        Some(addr) => th.call_stack[idx].pc = addr,
                        None => {
                            let v = th.call_stack[idx].pending_result.take().unwrap_or(Value::Nil);
                            match exit_frame(th, idx, base_depth, Ok(v)) {
                                Flow::Resume => {}
                                Flow::Finished(r) => return r,
                            }
                        }
                    },
                }
            }
            Opcode::Throw => {
                let payload = pop1(&mut th.call_stack[idx].stack);
                let message = match &payload {
                    Value::Str(s) => s.to_string(),
                    other => other.to_display_string(4),
                };
                let pos = th.call_stack[idx].pos_at(pc);
                let err = RunError::thrown(message, pos, payload);
                raise!(err);
            }
            Opcode::Rethrow => {
                let err = th.call_stack[idx]
                    .caught_stack
                    .last()
                    .cloned()
                    .expect("RETHROW outside an active catch");
                raise!(err);
            }
            Opcode::Constant => {
                let v = constant_to_value(&th.program().constants[operand as usize]);
                let frame = &mut th.call_stack[idx];
                frame.stack.push(v);
                frame.pc = next_pc;
            }
            Opcode::MakeTuple => {
                let frame = &mut th.call_stack[idx];
                let n = operand as usize;
                let len = frame.stack.len();
                let items: Vec<Value> = frame.stack.drain(len - n..).collect();
                frame.stack.push(Value::Tuple(Rc::from(items)));
                frame.pc = next_pc;
            }
            Opcode::MakeArray => {
                let frame = &mut th.call_stack[idx];
                let n = operand as usize;
                let len = frame.stack.len();
                let items: Vec<Value> = frame.stack.drain(len - n..).collect();
                frame.stack.push(Value::Array(Rc::new(std::cell::RefCell::new(items))));
                frame.pc = next_pc;
            }
            Opcode::MakeMap => {
                let frame = &mut th.call_stack[idx];
                let n = operand as usize;
                let len = frame.stack.len();
                let flat: Vec<Value> = frame.stack.drain(len - 2 * n..).collect();
                let mut map = ValueMap::new();
                for pair in flat.chunks_exact(2) {
                    let key = fallible!(crate::value::value_key(&pair[0]));
                    map.insert(key, pair[0].clone(), pair[1].clone());
                }
                th.call_stack[idx].stack.push(Value::Map(Rc::new(std::cell::RefCell::new(map))));
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::MakeFunc => {
                let tuple = pop1(&mut th.call_stack[idx].stack);
                let Value::Tuple(cells) = tuple else {
                    panic!("MAKEFUNC operand is not a tuple of captured cells");
                };
                let freevars: Vec<CellRef> = cells
                    .iter()
                    .map(|v| match v {
                        Value::Cell(c) => c.clone(),
                        _ => panic!("MAKEFUNC captured value is not a Cell"),
                    })
                    .collect();
                let funcode = th.program().functions[operand as usize].clone();
                let frame = &mut th.call_stack[idx];
                frame.stack.push(Value::Function(Rc::new(FunctionValue { funcode, freevars })));
                frame.pc = next_pc;
            }
            Opcode::Local => {
                let frame = &mut th.call_stack[idx];
                let v = frame.locals[operand as usize].clone();
                frame.stack.push(v);
                frame.pc = next_pc;
            }
            Opcode::SetLocal => {
                let frame = &mut th.call_stack[idx];
                let v = pop1(&mut frame.stack);
                frame.locals[operand as usize] = v;
                frame.pc = next_pc;
            }
            Opcode::LocalCell => {
                let frame = &mut th.call_stack[idx];
                let Value::Cell(c) = &frame.locals[operand as usize] else {
                    panic!("LOCALCELL on a non-Cell local slot");
                };
                let v = c.borrow().clone();
                frame.stack.push(v);
                frame.pc = next_pc;
            }
            Opcode::SetLocalCell => {
                let frame = &mut th.call_stack[idx];
                let v = pop1(&mut frame.stack);
                let Value::Cell(c) = &frame.locals[operand as usize] else {
                    panic!("SETLOCALCELL on a non-Cell local slot");
                };
                *c.borrow_mut() = v;
                frame.pc = next_pc;
            }
            Opcode::Free => {
                let frame = &mut th.call_stack[idx];
                let c = frame.func.freevars[operand as usize].clone();
                frame.stack.push(Value::Cell(c));
                frame.pc = next_pc;
            }
            Opcode::FreeCell => {
                let frame = &mut th.call_stack[idx];
                let v = frame.func.freevars[operand as usize].borrow().clone();
                frame.stack.push(v);
                frame.pc = next_pc;
            }
            Opcode::SetFreeCell => {
                let frame = &mut th.call_stack[idx];
                let v = pop1(&mut frame.stack);
                *frame.func.freevars[operand as usize].borrow_mut() = v;
                frame.pc = next_pc;
            }
            Opcode::Predeclared => {
                let name = th.program().names.get(crate::intern::NameId(operand)).to_owned();
                match th.options.predeclared.get(&name).cloned() {
                    Some(v) => {
                        let frame = &mut th.call_stack[idx];
                        frame.stack.push(v);
                        frame.pc = next_pc;
                    }
                    None => raise!(RunError::raised(ErrorKind::NameError, format!("undefined name '{name}'"), None)),
                }
            }
            Opcode::Universal => {
                let name = th.program().names.get(crate::intern::NameId(operand)).to_owned();
                match th.universe.get(&name).cloned() {
                    Some(v) => {
                        let frame = &mut th.call_stack[idx];
                        frame.stack.push(v);
                        frame.pc = next_pc;
                    }
                    None => raise!(RunError::raised(ErrorKind::NameError, format!("undefined name '{name}'"), None)),
                }
            }
            Opcode::Attr => {
                let name = th.program().names.get(crate::intern::NameId(operand)).to_owned();
                let recv = pop1(&mut th.call_stack[idx].stack);
                let v = fallible!(get_attr(&recv, &name));
                th.call_stack[idx].stack.push(v);
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::SetField => {
                let name = th.program().names.get(crate::intern::NameId(operand)).to_owned();
                let frame = &mut th.call_stack[idx];
                let value = pop1(&mut frame.stack);
                let recv = pop1(&mut frame.stack);
                fallible!(set_field(&recv, &name, value));
                th.call_stack[idx].pc = next_pc;
            }
            Opcode::Call | Opcode::CallVar => {
                let n = operand as usize;
                let frame = &mut th.call_stack[idx];
                let mut args: Vec<Value> = frame.stack.split_off(frame.stack.len() - n);
                let callee = pop1(&mut frame.stack);
                if op == Opcode::CallVar {
                    if let Some(spread) = args.pop() {
                        match spread {
                            Value::Tuple(t) => args.extend(t.iter().cloned()),
                            Value::Array(a) => args.extend(a.borrow().iter().cloned()),
                            other => raise!(RunError::raised(
                                ErrorKind::TypeError,
                                format!("CALL_VAR spread operand must be a tuple or array, not '{}'", other.type_name()),
                                None
                            )),
                        }
                    }
                }
                th.call_stack[idx].pc = next_pc;
                match call::push_call(th, callee, args, pc) {
                    Ok(()) => {}
                    Err(e) => raise!(e),
                }
            }
            Opcode::Load => {
                let entry = th.program().loads[operand as usize].clone();
                let name = th.program().names.get(entry.name).to_owned();
                let result = match th.options.load.as_mut() {
                    Some(cb) => cb(&name),
                    None => Err(RunError::raised(ErrorKind::NameError, format!("no module loader configured for '{name}'"), None)),
                };
                match result {
                    Ok(v) => {
                        let frame = &mut th.call_stack[idx];
                        frame.stack.push(v);
                        frame.pc = next_pc;
                    }
                    Err(e) => raise!(e),
                }
            }
            Opcode::Jmp => match scan_transfer(th, idx, pc, Some(jump_target)) {
                TransferOutcome::Diverted(start_pc) => th.call_stack[idx].pc = start_pc,
                TransferOutcome::Proceed => th.call_stack[idx].pc = jump_target,
            },
            Opcode::CJmp => {
                let cond = pop1(&mut th.call_stack[idx].stack);
                if cond.truthy() {
                    match scan_transfer(th, idx, pc, Some(jump_target)) {
                        TransferOutcome::Diverted(start_pc) => th.call_stack[idx].pc = start_pc,
                        TransferOutcome::Proceed => th.call_stack[idx].pc = jump_target,
                    }
                } else {
                    th.call_stack[idx].pc = next_pc;
                }
            }
        }
    }
}
