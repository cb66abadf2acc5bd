//! The protected-region state machine behind `defer`/`catch`: deciding,
//! on every control transfer, whether a still-pending handler must run
//! first, and driving `DEFEREXIT`'s "what happens after a handler
//! finishes" logic.
//!
//! The reference design in spec §4.5.1 drives this off a `runDefer` flag
//! consulted by the opcode immediately following `RETURN`. This crate
//! calls the same decision function directly at every control-transfer
//! opcode (`RETURN`, `JMP`, a taken `CJMP`, an exhausted `ITERJMP`,
//! `CATCHJMP`, and at the point a runtime error is raised) instead of
//! threading a flag through one extra dispatch step — an implementation
//! simplification, not a behavioral one: the externally observable
//! sequence of handler entries is identical, which is what §8's "Defer
//! total ordering" property actually constrains.

use crate::{bytecode::code::ProtectedRegion, error::RunError};

fn covers(r: &ProtectedRegion, pc: u32) -> bool {
    r.pc0 <= pc && pc <= r.pc1
}

/// Picks the innermost (greatest `StartPC`) region that covers `from` but
/// not `to` — the "not yet run, and leaving its scope" handler — scanning
/// `catches` too when `consider_catches` is set (i.e. an error is in
/// flight and is catchable).
fn find_handler(
    defers: &[ProtectedRegion],
    catches: &[ProtectedRegion],
    from: u32,
    to: Option<u32>,
    consider_catches: bool,
) -> Option<(bool, ProtectedRegion)> {
    let to_covered = |r: &ProtectedRegion| to.is_some_and(|t| covers(r, t));
    let mut best: Option<(bool, ProtectedRegion)> = None;
    for &r in defers {
        if covers(&r, from) && !to_covered(&r) && best.is_none_or(|(_, b)| r.start_pc > b.start_pc) {
            best = Some((false, r));
        }
    }
    if consider_catches {
        for &r in catches {
            if covers(&r, from) && !to_covered(&r) && best.is_none_or(|(_, b)| r.start_pc > b.start_pc) {
                best = Some((true, r));
            }
        }
    }
    best
}

/// Per-frame protected-region bookkeeping: the stack of pending resume
/// targets a chain of diverted handlers must eventually unwind back
/// through. `-1` is the "exit the function" sentinel (spec §4.5.1).
#[derive(Debug, Default)]
pub struct DeferStack {
    targets: Vec<i64>,
}

impl DeferStack {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Outcome of a control transfer (`RETURN`/`JMP`/taken-`CJMP`/exhausted-
/// `ITERJMP`/`CATCHJMP`, or a just-raised error) once the defer/catch
/// scan has run.
pub enum TransferOutcome {
    /// A handler was entered; resume execution at this pc.
    Diverted(u32),
    /// No covering handler; the original transfer proceeds.
    Proceed,
}

/// Evaluates a control transfer from `from` to `to` (`None` means "exit
/// the function"). If a covering, not-yet-run handler exists, pushes `to`
/// onto `stack` and returns where to jump; a diverted catch also clears
/// `in_flight_err`.
pub fn on_transfer(
    defers: &[ProtectedRegion],
    catches: &[ProtectedRegion],
    stack: &mut DeferStack,
    in_flight_err: &mut Option<RunError>,
    from: u32,
    to: Option<u32>,
) -> TransferOutcome {
    let consider_catches = in_flight_err.as_ref().is_some_and(RunError::is_catchable);
    match find_handler(defers, catches, from, to, consider_catches) {
        Some((is_catch, region)) => {
            stack.targets.push(to.map_or(-1, i64::from));
            if is_catch {
                *in_flight_err = None;
            }
            TransferOutcome::Diverted(region.start_pc)
        }
        None => TransferOutcome::Proceed,
    }
}

/// Outcome of executing `DEFEREXIT`.
pub enum DeferExitOutcome {
    /// Another not-yet-run handler covers the current exit; jump there
    /// (the pending-targets stack is unchanged).
    Diverted(u32),
    /// The chain is exhausted and the popped target was a real address;
    /// resume there.
    Resume(u32),
    /// The chain is exhausted and the popped target was `-1`: exit the
    /// function with its current result/error.
    ExitFunction,
}

/// `DEFEREXIT`: ends a `defer`/`catch` handler body. Peeks the pending
/// target, looks for a still-covering handler at the handler body's own
/// exit point, and otherwise unwinds one level.
///
/// # Panics
///
/// Panics if `stack` is empty — every entry into a handler pushes exactly
/// one target, so a well-formed program never executes `DEFEREXIT`
/// without one pending (a compiler/resolver invariant, not a user fault).
pub fn on_defer_exit(
    defers: &[ProtectedRegion],
    catches: &[ProtectedRegion],
    stack: &mut DeferStack,
    in_flight_err: &mut Option<RunError>,
    current_pc: u32,
) -> DeferExitOutcome {
    let return_to = *stack.targets.last().expect("DEFEREXIT with no pending defer target");
    let to = u32::try_from(return_to).ok();
    let consider_catches = in_flight_err.as_ref().is_some_and(RunError::is_catchable);
    if let Some((is_catch, region)) = find_handler(defers, catches, current_pc, to, consider_catches) {
        if is_catch {
            *in_flight_err = None;
        }
        return DeferExitOutcome::Diverted(region.start_pc);
    }
    stack.targets.pop();
    match to {
        Some(addr) => DeferExitOutcome::Resume(addr),
        None => DeferExitOutcome::ExitFunction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(pc0: u32, pc1: u32, start_pc: u32) -> ProtectedRegion {
        ProtectedRegion { pc0, pc1, start_pc }
    }

    #[test]
    fn nested_defers_run_in_reverse_entry_order() {
        // A wraps B wraps C: ranges [pc0_a,100] ⊃ [pc0_b,100] ⊃ [pc0_c,100].
        let defers = vec![region(10, 100, 50), region(20, 100, 60), region(30, 100, 70)];
        let catches: Vec<ProtectedRegion> = vec![];
        let mut stack = DeferStack::default();
        let mut err = None;

        // Function exit attempted from pc=90, to=None (exit).
        let TransferOutcome::Diverted(pc) = on_transfer(&defers, &catches, &mut stack, &mut err, 90, None) else {
            panic!("expected a diversion");
        };
        assert_eq!(pc, 70); // C, the innermost (greatest start_pc).

        // C's DEFEREXIT runs at pc=25: covered by A and B's ranges but not
        // C's own [30,100), so C itself is no longer a candidate and B
        // (the next-greatest start_pc among the remaining covering regions)
        // is picked.
        let DeferExitOutcome::Diverted(pc) = on_defer_exit(&defers, &catches, &mut stack, &mut err, 25) else {
            panic!("expected another diversion");
        };
        assert_eq!(pc, 60); // B

        let DeferExitOutcome::Diverted(pc) = on_defer_exit(&defers, &catches, &mut stack, &mut err, 15) else {
            panic!("expected another diversion");
        };
        assert_eq!(pc, 50); // A

        let outcome = on_defer_exit(&defers, &catches, &mut stack, &mut err, 5);
        assert!(matches!(outcome, DeferExitOutcome::ExitFunction));
        assert!(stack.is_empty());
    }

    #[test]
    fn catch_clears_in_flight_error_when_diverted() {
        let catches = vec![region(0, 100, 50)];
        let mut stack = DeferStack::default();
        let mut err = Some(RunError::raised(crate::error::ErrorKind::TypeError, "boom", None));
        let outcome = on_transfer(&[], &catches, &mut stack, &mut err, 10, None);
        assert!(matches!(outcome, TransferOutcome::Diverted(50)));
        assert!(err.is_none());
    }

    #[test]
    fn noncatchable_error_skips_catches_but_runs_defers() {
        let defers = vec![region(0, 100, 40)];
        let catches = vec![region(0, 100, 50)];
        let mut stack = DeferStack::default();
        let mut err = Some(RunError::raised(crate::error::ErrorKind::Cancelled, "cancelled", None));
        let outcome = on_transfer(&defers, &catches, &mut stack, &mut err, 10, None);
        assert!(matches!(outcome, TransferOutcome::Diverted(40)));
        assert!(err.is_some(), "non-catchable error must survive running a defer");
    }
}
