//! Frame construction: argument binding (`setArgs`), cell spilling, and the
//! recursion/call-depth guards that gate pushing a new [`Frame`] onto a
//! [`Thread`]'s call stack.
//!
//! There is no Rust-level recursion here: a guest `CALL` pushes a [`Frame`]
//! and lets the interpreter loop in [`super::dispatch`] keep running with
//! the new frame on top, so guest recursion depth is bounded only by
//! `MaxCallStackDepth`, never by the host stack.

use std::rc::Rc;

use crate::{
    error::{ErrorKind, RunError},
    value::{FunctionValue, Value},
    vm::exceptions::DeferStack,
    vm::{Frame, Thread},
};

/// Binds `args` into a fresh locals array per the function's arity:
/// nullary errors on any argument, fixed-arity errors only on *too many*
/// (fewer than `NumParams` pad the remaining locals with `Nil`, which is
/// already their zero value), variadic packs the trailing arguments into a
/// `Tuple` at the last parameter slot.
fn bind_args(func: &FunctionValue, args: Vec<Value>) -> Result<Vec<Value>, RunError> {
    let fcode = &func.funcode;
    let num_params = fcode.num_params as usize;
    let mut locals = vec![Value::Nil; fcode.num_locals as usize];

    if fcode.has_varargs {
        let fixed = num_params.saturating_sub(1);
        if args.len() < fixed {
            return Err(RunError::raised(
                ErrorKind::TypeError,
                format!("'{}' expects at least {fixed} argument(s), got {}", fcode.name, args.len()),
                None,
            ));
        }
        let mut it = args.into_iter();
        for slot in locals.iter_mut().take(fixed) {
            *slot = it.next().expect("fixed-arity prefix checked above");
        }
        let rest: Vec<Value> = it.collect();
        locals[fixed] = Value::Tuple(Rc::from(rest));
    } else if num_params == 0 {
        if !args.is_empty() {
            return Err(RunError::raised(
                ErrorKind::TypeError,
                format!("'{}' takes no arguments, got {}", fcode.name, args.len()),
                None,
            ));
        }
    } else {
        if args.len() > num_params {
            return Err(RunError::raised(
                ErrorKind::TypeError,
                format!("'{}' expects at most {num_params} argument(s), got {}", fcode.name, args.len()),
                None,
            ));
        }
        for (slot, arg) in locals.iter_mut().zip(args) {
            *slot = arg;
        }
    }
    Ok(locals)
}

/// Boxes every `Cells`-listed local in a fresh `Cell`, so `LOCALCELL`/
/// `SETLOCALCELL` always see a `Value::Cell` regardless of whether the slot
/// started life as a parameter or a plain `let`.
fn spill_cells(fcode: &crate::bytecode::Funcode, locals: &mut [Value]) {
    for &idx in &fcode.cells {
        let idx = idx as usize;
        let prior = std::mem::replace(&mut locals[idx], Value::Nil);
        locals[idx] = Value::Cell(Rc::new(std::cell::RefCell::new(prior)));
    }
}

/// Pushes a new frame for calling `callee` with `args`, or returns the
/// runtime error that rejects the call outright (not callable, recursion
/// guard, call-stack depth cap, or a `setArgs` arity mismatch) without ever
/// touching the call stack.
///
/// `call_site_pc` is the address of the `CALL`/`CALL_VAR` instruction in
/// the *caller* (meaningless, and unused, for the outermost call made by
/// [`super::run_program`]) — it is what the callee's eventual error
/// propagation scans the caller's protected regions from.
pub fn push_call<Tr: crate::trace::Tracer>(
    th: &mut Thread<Tr>,
    callee: Value,
    args: Vec<Value>,
    call_site_pc: u32,
) -> Result<(), RunError> {
    let Value::Function(func) = callee else {
        return Err(RunError::raised(
            ErrorKind::TypeError,
            format!("'{}' is not callable", callee.type_name()),
            None,
        ));
    };

    if let Some(max) = th.options.max_call_stack_depth {
        if max > 0 && th.call_stack.len() >= max as usize {
            return Err(RunError::raised(ErrorKind::RecursionLimit, "maximum call stack depth exceeded", None));
        }
    }
    if th.options.disable_recursion && th.call_stack.iter().any(|f| Rc::ptr_eq(&f.func.funcode, &func.funcode)) {
        return Err(RunError::raised(
            ErrorKind::RecursionLimit,
            format!("recursive call into '{}' rejected (DisableRecursion)", func.funcode.name),
            None,
        ));
    }

    let mut locals = bind_args(&func, args)?;
    spill_cells(&func.funcode, &mut locals);

    th.tracer.on_call(&func.funcode.name, th.call_stack.len() + 1);
    let stack_hint = func.funcode.max_stack as usize;
    th.call_stack.push(Frame {
        func,
        locals,
        stack: Vec::with_capacity(stack_hint),
        pc: 0,
        defer_stack: DeferStack::default(),
        in_flight_err: None,
        pending_result: None,
        caught_stack: Vec::new(),
        iter_base: th.iter_stack.len(),
        call_site_pc,
    });
    Ok(())
}
