//! Lowers a resolved AST into a [`Program`]: constant/name interning, and
//! per-function bytecode emission via [`CodeBuilder`].
//!
//! Every lowering decision here is driven entirely by what the resolver
//! already computed (`Binding.scope`, `FreeVarSource`, label indices) — the
//! compiler itself never re-derives scoping. See `DESIGN.md` for the
//! opcode-selection rules this file implements (identifier read/write
//! dispatch, closure capture, the `defer`/`catch` lowering shape, and so on).

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    ast::{BinOp, Block, Chunk, ClassDef, Expr, FuncDef, IdentExpr, Stmt, Target, UnOp},
    binding::{BindingRef, FreeVarSource, ResolvedFunctionInfo, Scope},
    bytecode::{
        builder::{CodeBuilder, JumpLabel},
        code::{Constant, Funcode, Program},
        op::Opcode,
    },
    intern::Interner,
    pos::PositionTable,
};

/// Lowers a resolved chunk into a compiled program.
///
/// # Panics
///
/// Panics if `chunk` was never run through [`crate::resolver::resolve`], or
/// if resolution failed — both are programming errors in the caller, not
/// user-facing failures.
#[must_use]
pub fn compile(chunk: &Chunk) -> Program {
    let mut prog = ProgramCompiler {
        names: Interner::new(),
        constants: ConstPool::default(),
        functions: Vec::new(),
    };
    let toplevel_idx = prog.alloc_slot();
    assert_eq!(toplevel_idx, 0, "toplevel function must occupy slot 0");

    let info = chunk.resolved.borrow().clone().expect("compiling an unresolved chunk");
    let mut fc = FuncCompiler::new(&info, 0, false);
    fc.compile_block(&mut prog, &chunk.body);
    fc.emit_implicit_return();
    let funcode = fc.finish(chunk.filename.clone());
    prog.set_slot(0, funcode);

    Program {
        filename: chunk.filename.clone(),
        loads: Vec::new(),
        names: prog.names.finish(),
        constants: prog.constants.finish(),
        functions: prog.functions,
        toplevel: 0,
    }
}

/// State shared across every function compiled for one program: the name
/// and constant pools, and the growing table of compiled functions.
struct ProgramCompiler {
    names: Interner,
    constants: ConstPool,
    functions: Vec<Rc<Funcode>>,
}

impl ProgramCompiler {
    /// Reserves a function-table slot before the function's body is
    /// compiled, so a nested `FuncLit` can be assigned its final index up
    /// front (needed for `MAKEFUNC<i>`) while its body is compiled after.
    fn alloc_slot(&mut self) -> u32 {
        let idx = u32::try_from(self.functions.len()).expect("program has too many functions");
        self.functions.push(Rc::new(Funcode {
            name: String::new(),
            code: Vec::new(),
            num_locals: 0,
            cells: Vec::new(),
            freevars: Vec::new(),
            defers: Vec::new(),
            catches: Vec::new(),
            max_stack: 0,
            num_params: 0,
            has_varargs: false,
            position_table: PositionTable::default(),
        }));
        idx
    }

    fn set_slot(&mut self, idx: u32, f: Funcode) {
        self.functions[idx as usize] = Rc::new(f);
    }
}

/// Deduplicating constant pool builder.
#[derive(Default)]
struct ConstPool {
    constants: Vec<Constant>,
    ints: AHashMap<i64, u32>,
    floats: AHashMap<u64, u32>,
    strs: AHashMap<String, u32>,
}

impl ConstPool {
    fn int(&mut self, v: i64) -> u32 {
        if let Some(&i) = self.ints.get(&v) {
            return i;
        }
        let idx = u32::try_from(self.constants.len()).expect("too many constants");
        self.constants.push(Constant::Int(v));
        self.ints.insert(v, idx);
        idx
    }

    fn float(&mut self, v: f64) -> u32 {
        let bits = v.to_bits();
        if let Some(&i) = self.floats.get(&bits) {
            return i;
        }
        let idx = u32::try_from(self.constants.len()).expect("too many constants");
        self.constants.push(Constant::Float(v));
        self.floats.insert(bits, idx);
        idx
    }

    fn str(&mut self, v: &str) -> u32 {
        if let Some(&i) = self.strs.get(v) {
            return i;
        }
        let idx = u32::try_from(self.constants.len()).expect("too many constants");
        self.constants.push(Constant::Str(v.to_owned()));
        self.strs.insert(v.to_owned(), idx);
        idx
    }

    fn finish(self) -> Vec<Constant> {
        self.constants
    }
}

/// Where a `continue` inside a loop should land.
enum ContinueTarget {
    /// Already known (a `for-in`'s re-check, which sits before the body).
    Known(u32),
    /// Not known yet (a 3-part `for`'s `post` clause, compiled after the
    /// body): forward jumps collected here are patched once `post` starts.
    Forward(Vec<JumpLabel>),
}

struct LoopCtx {
    /// `None` for an unlabeled loop; `Some` ties `break`/`continue` with a
    /// matching `LabelRef.binding` to this loop specifically.
    label: Option<BindingRef>,
    continue_target: ContinueTarget,
    break_jumps: Vec<JumpLabel>,
}

/// Compiles one function body (or the toplevel chunk) into a [`Funcode`].
struct FuncCompiler {
    code: CodeBuilder,
    num_locals: u32,
    num_params: u32,
    has_varargs: bool,
    loop_stack: Vec<LoopCtx>,
    /// Byte offset of each already-seen `LabelDecl`, by label index.
    label_addrs: AHashMap<u32, u32>,
    /// Forward `goto`s waiting on a `LabelDecl` not yet reached, by label index.
    pending_gotos: AHashMap<u32, Vec<JumpLabel>>,
}

impl FuncCompiler {
    fn new(info: &ResolvedFunctionInfo, num_params: u32, has_varargs: bool) -> Self {
        let mut code = CodeBuilder::new();
        for &idx in &info.cells {
            code.mark_cell(idx);
        }
        for name in &info.freevars {
            code.add_freevar(name);
        }
        Self {
            code,
            num_locals: info.num_locals,
            num_params,
            has_varargs,
            loop_stack: Vec::new(),
            label_addrs: AHashMap::new(),
            pending_gotos: AHashMap::new(),
        }
    }

    fn alloc_temp(&mut self) -> u32 {
        let idx = self.num_locals;
        self.num_locals += 1;
        idx
    }

    fn emit_implicit_return(&mut self) {
        self.code.emit(Opcode::Nil);
        self.code.emit(Opcode::Return);
    }

    fn finish(self, name: impl Into<String>) -> Funcode {
        assert!(self.pending_gotos.is_empty(), "unresolved forward goto at function end");
        self.code.build(name, self.num_locals, self.num_params, self.has_varargs)
    }

    fn emit_int_const(&mut self, prog: &mut ProgramCompiler, v: i64) {
        let idx = prog.constants.int(v);
        self.code.emit_arg(Opcode::Constant, idx);
    }

    // ---- identifier read/write ----

    fn read_binding_ref(&mut self, prog: &mut ProgramCompiler, binding: &BindingRef) {
        let b = binding.borrow();
        match b.scope {
            Scope::Local => self.code.emit_arg(Opcode::Local, b.index),
            Scope::Cell => self.code.emit_arg(Opcode::LocalCell, b.index),
            Scope::Free => self.code.emit_arg(Opcode::FreeCell, b.index),
            Scope::Predeclared => {
                let nid = prog.names.intern(&b.name);
                self.code.emit_arg(Opcode::Predeclared, nid.0);
            }
            Scope::Universal => {
                let nid = prog.names.intern(&b.name);
                self.code.emit_arg(Opcode::Universal, nid.0);
            }
            Scope::Undefined => self.code.emit(Opcode::Nil),
            Scope::Label | Scope::LoopLabel => unreachable!("label used as a value"),
        }
    }

    fn write_binding_ref(&mut self, binding: &BindingRef) {
        let b = binding.borrow();
        match b.scope {
            Scope::Local => self.code.emit_arg(Opcode::SetLocal, b.index),
            Scope::Cell => self.code.emit_arg(Opcode::SetLocalCell, b.index),
            Scope::Free => self.code.emit_arg(Opcode::SetFreeCell, b.index),
            Scope::Undefined => self.code.emit(Opcode::Pop),
            Scope::Predeclared | Scope::Universal => unreachable!("assignment to a constant binding"),
            Scope::Label | Scope::LoopLabel => unreachable!("label used as an assignment target"),
        }
    }

    fn read_binding(&mut self, prog: &mut ProgramCompiler, id: &IdentExpr) {
        let binding = id.binding.borrow().clone().expect("unresolved identifier");
        self.read_binding_ref(prog, &binding);
    }

    fn write_binding(&mut self, id: &IdentExpr) {
        let binding = id.binding.borrow().clone().expect("unresolved identifier");
        self.write_binding_ref(&binding);
    }

    // ---- expressions ----

    fn compile_expr(&mut self, prog: &mut ProgramCompiler, e: &Expr) {
        match e {
            Expr::Nil => self.code.emit(Opcode::Nil),
            Expr::True => self.code.emit(Opcode::True),
            Expr::False => self.code.emit(Opcode::False),
            Expr::Int(v) => self.emit_int_const(prog, *v),
            Expr::Float(v) => {
                let idx = prog.constants.float(*v);
                self.code.emit_arg(Opcode::Constant, idx);
            }
            Expr::Str(s) => {
                let idx = prog.constants.str(s);
                self.code.emit_arg(Opcode::Constant, idx);
            }
            Expr::Ident(id) => self.read_binding(prog, id),
            Expr::Unary { op, expr, pos } => {
                self.compile_expr(prog, expr);
                self.code.set_pos(*pos);
                self.code.emit(unop_opcode(*op));
            }
            Expr::Binary { op, lhs, rhs, pos } => {
                self.compile_expr(prog, lhs);
                self.compile_expr(prog, rhs);
                self.code.set_pos(*pos);
                self.code.emit(binop_opcode(*op));
            }
            Expr::And(lhs, rhs) => self.compile_and(prog, lhs, rhs),
            Expr::Or(lhs, rhs) => self.compile_or(prog, lhs, rhs),
            Expr::Call { callee, args, pos } => {
                self.compile_expr(prog, callee);
                for a in args {
                    self.compile_expr(prog, a);
                }
                self.code.set_pos(*pos);
                let n = u32::try_from(args.len()).expect("too many call arguments");
                #[allow(clippy::cast_possible_wrap)]
                let effect = 1 - (n as i32 + 1);
                self.code.emit_arg_with_effect(Opcode::Call, n, effect);
            }
            Expr::Index { recv, key, pos } => {
                self.compile_expr(prog, recv);
                self.compile_expr(prog, key);
                self.code.set_pos(*pos);
                self.code.emit(Opcode::Index);
            }
            Expr::Attr { recv, name, pos } => {
                self.compile_expr(prog, recv);
                self.code.set_pos(*pos);
                let nid = prog.names.intern(name);
                self.code.emit_arg(Opcode::Attr, nid.0);
            }
            Expr::Tuple(items) => self.compile_seq_literal(prog, items, Opcode::MakeTuple),
            Expr::Array(items) => self.compile_seq_literal(prog, items, Opcode::MakeArray),
            Expr::Map(pairs) => self.compile_map_literal(prog, pairs),
            Expr::FuncLit(def) => self.compile_funclit(prog, def),
        }
    }

    fn compile_seq_literal(&mut self, prog: &mut ProgramCompiler, items: &[Expr], op: Opcode) {
        for it in items {
            self.compile_expr(prog, it);
        }
        let n = u32::try_from(items.len()).expect("too many sequence elements");
        #[allow(clippy::cast_possible_wrap)]
        let effect = 1 - n as i32;
        self.code.emit_arg_with_effect(op, n, effect);
    }

    fn compile_map_literal(&mut self, prog: &mut ProgramCompiler, pairs: &[(Expr, Expr)]) {
        self.code.emit_arg_with_effect(Opcode::MakeMap, 0, 1);
        for (k, v) in pairs {
            self.code.emit(Opcode::Dup);
            self.compile_expr(prog, k);
            self.compile_expr(prog, v);
            self.code.emit(Opcode::SetMap);
        }
    }

    /// `or`: `DUP; CJMP(short); POP; rhs;`. On the short-circuit path the
    /// duplicate is consumed by `CJMP` itself, leaving the original
    /// (truthy) `lhs` as the result.
    fn compile_or(&mut self, prog: &mut ProgramCompiler, lhs: &Expr, rhs: &Expr) {
        self.compile_expr(prog, lhs);
        self.code.emit(Opcode::Dup);
        let short = self.code.emit_jump(Opcode::CJmp, -1);
        self.code.emit(Opcode::Pop);
        self.compile_expr(prog, rhs);
        self.code.patch_jump(short);
    }

    /// `and`: same shape as `or`, but the guard is inverted with `NOT`
    /// first so the short-circuit fires on a falsy `lhs`.
    fn compile_and(&mut self, prog: &mut ProgramCompiler, lhs: &Expr, rhs: &Expr) {
        self.compile_expr(prog, lhs);
        self.code.emit(Opcode::Dup);
        self.code.emit(Opcode::Not);
        let short = self.code.emit_jump(Opcode::CJmp, -1);
        self.code.emit(Opcode::Pop);
        self.compile_expr(prog, rhs);
        self.code.patch_jump(short);
    }

    fn compile_funclit(&mut self, prog: &mut ProgramCompiler, def: &FuncDef) {
        let info = def.resolved.borrow().clone().expect("unresolved function literal");
        for src in &info.freevar_sources {
            match *src {
                FreeVarSource::Local(idx) => self.code.emit_arg(Opcode::Local, idx),
                FreeVarSource::Free(idx) => self.code.emit_arg(Opcode::Free, idx),
            }
        }
        let n = u32::try_from(info.freevar_sources.len()).expect("too many captured variables");
        #[allow(clippy::cast_possible_wrap)]
        let effect = 1 - n as i32;
        self.code.emit_arg_with_effect(Opcode::MakeTuple, n, effect);

        let slot = prog.alloc_slot();
        let num_params = u32::try_from(def.params.len()).expect("too many parameters");
        let mut nested = FuncCompiler::new(&info, num_params, def.has_varargs);
        nested.compile_block(prog, &def.body);
        nested.emit_implicit_return();
        let name = def.name.clone().unwrap_or_else(|| "<anonymous>".to_owned());
        let funcode = nested.finish(name);
        prog.set_slot(slot, funcode);

        self.code.emit_arg(Opcode::MakeFunc, slot);
    }

    // ---- assignment targets ----

    /// Stores the value currently on top of the operand stack into `target`.
    fn compile_store_tos(&mut self, prog: &mut ProgramCompiler, target: &Target) {
        match target {
            Target::Ident(id) => self.write_binding(id),
            Target::Index { recv, key, pos } => {
                let tmp = self.alloc_temp();
                self.code.emit_arg(Opcode::SetLocal, tmp);
                self.compile_expr(prog, recv);
                self.compile_expr(prog, key);
                self.code.emit_arg(Opcode::Local, tmp);
                self.code.set_pos(*pos);
                self.code.emit(Opcode::SetIndex);
            }
            Target::Attr { recv, name, pos } => {
                let tmp = self.alloc_temp();
                self.code.emit_arg(Opcode::SetLocal, tmp);
                self.compile_expr(prog, recv);
                self.code.emit_arg(Opcode::Local, tmp);
                self.code.set_pos(*pos);
                let nid = prog.names.intern(name);
                self.code.emit_arg(Opcode::SetField, nid.0);
            }
            Target::Tuple(items) => {
                let tmp = self.alloc_temp();
                self.code.emit_arg(Opcode::SetLocal, tmp);
                for (i, item) in items.iter().enumerate() {
                    self.code.emit_arg(Opcode::Local, tmp);
                    #[allow(clippy::cast_possible_wrap)]
                    self.emit_int_const(prog, i as i64);
                    self.code.emit(Opcode::Index);
                    self.compile_store_tos(prog, item);
                }
            }
        }
    }

    /// Augmented assignment: the target's address is evaluated exactly
    /// once, then read, combined with `value`, and stored back.
    fn compile_aug_assign(&mut self, prog: &mut ProgramCompiler, target: &Target, op: BinOp, value: &Expr) {
        match target {
            Target::Ident(id) => {
                self.read_binding(prog, id);
                self.compile_expr(prog, value);
                self.code.emit(binop_opcode(op));
                self.write_binding(id);
            }
            Target::Index { recv, key, pos } => {
                self.compile_expr(prog, recv);
                self.compile_expr(prog, key);
                self.code.emit(Opcode::Dup2);
                self.code.set_pos(*pos);
                self.code.emit(Opcode::Index);
                self.compile_expr(prog, value);
                self.code.emit(binop_opcode(op));
                self.code.emit(Opcode::SetIndex);
            }
            Target::Attr { recv, name, pos } => {
                self.compile_expr(prog, recv);
                self.code.emit(Opcode::Dup);
                self.code.set_pos(*pos);
                let nid = prog.names.intern(name);
                self.code.emit_arg(Opcode::Attr, nid.0);
                self.compile_expr(prog, value);
                self.code.emit(binop_opcode(op));
                self.code.emit_arg(Opcode::SetField, nid.0);
            }
            Target::Tuple(_) => unreachable!("augmented assignment to a tuple target"),
        }
    }

    // ---- statements ----

    fn compile_block(&mut self, prog: &mut ProgramCompiler, block: &Block) {
        let mut pending_label: Option<BindingRef> = None;
        for stmt in &block.0 {
            if let Stmt::LabelDecl(decl) = stmt {
                self.compile_label_decl(decl);
                pending_label = decl.binding.borrow().clone();
                continue;
            }
            let loop_label = pending_label.take();
            self.compile_stmt(prog, stmt, loop_label);
        }
    }

    fn compile_label_decl(&mut self, decl: &crate::ast::LabelDecl) {
        let binding = decl.binding.borrow().clone().expect("unresolved label");
        let idx = binding.borrow().index;
        let addr = self.code.offset();
        self.label_addrs.insert(idx, addr);
        if let Some(pending) = self.pending_gotos.remove(&idx) {
            for j in pending {
                self.code.patch_jump(j);
            }
        }
    }

    fn compile_stmt(&mut self, prog: &mut ProgramCompiler, stmt: &Stmt, loop_label: Option<BindingRef>) {
        match stmt {
            Stmt::Expr(e) => {
                self.compile_expr(prog, e);
                self.code.emit(Opcode::Pop);
            }
            Stmt::Let { target, value, .. } | Stmt::Assign { target, value } => {
                self.compile_expr(prog, value);
                self.compile_store_tos(prog, target);
            }
            Stmt::AugAssign { target, op, value } => self.compile_aug_assign(prog, target, *op, value),
            Stmt::If { cond_decl, cond, then, else_ } => self.compile_if(prog, cond_decl, cond, then, else_),
            Stmt::Guard { target, value, else_, .. } => self.compile_guard(prog, target, value, else_),
            Stmt::For3 { init, cond, post, body, .. } => self.compile_for3(prog, init, cond, post, body, loop_label),
            Stmt::ForIn { targets, iter, body, .. } => self.compile_for_in(prog, targets, iter, body, loop_label),
            Stmt::FuncDef(def) => {
                self.compile_funclit(prog, def);
                let binding = def.self_binding.borrow().clone().expect("unresolved function binding");
                self.write_binding_ref(&binding);
            }
            Stmt::ClassDef(def) => self.compile_classdef(prog, def),
            Stmt::Defer(body) => self.compile_defer(prog, body),
            Stmt::Catch(body) => self.compile_catch(prog, body),
            Stmt::Return(value) => {
                match value {
                    Some(e) => self.compile_expr(prog, e),
                    None => self.code.emit(Opcode::Nil),
                }
                self.code.emit(Opcode::Return);
            }
            Stmt::Break(label) => {
                let idx = self.resolve_loop_index(label);
                let j = self.code.emit_jump(Opcode::Jmp, 0);
                self.loop_stack[idx].break_jumps.push(j);
            }
            Stmt::Continue(label) => {
                let idx = self.resolve_loop_index(label);
                match &mut self.loop_stack[idx].continue_target {
                    ContinueTarget::Known(addr) => {
                        let addr = *addr;
                        self.code.emit_jump_to(Opcode::Jmp, addr, 0);
                    }
                    ContinueTarget::Forward(pending) => {
                        let j = self.code.emit_jump(Opcode::Jmp, 0);
                        pending.push(j);
                    }
                }
            }
            Stmt::Goto(lbl) => {
                let binding = lbl.binding.borrow().clone().expect("unresolved goto target");
                let idx = binding.borrow().index;
                if let Some(&addr) = self.label_addrs.get(&idx) {
                    self.code.emit_jump_to(Opcode::Jmp, addr, 0);
                } else {
                    let j = self.code.emit_jump(Opcode::Jmp, 0);
                    self.pending_gotos.entry(idx).or_default().push(j);
                }
            }
            Stmt::LabelDecl(_) => unreachable!("handled by compile_block"),
            Stmt::Throw(value, pos) => match value {
                Some(e) => {
                    self.compile_expr(prog, e);
                    self.code.set_pos(*pos);
                    self.code.emit(Opcode::Throw);
                }
                None => {
                    self.code.set_pos(*pos);
                    self.code.emit(Opcode::Rethrow);
                }
            },
            Stmt::Block(b) => self.compile_block(prog, b),
        }
    }

    fn resolve_loop_index(&self, label: &Option<crate::ast::LabelRef>) -> usize {
        match label {
            None => self.loop_stack.len().checked_sub(1).expect("break/continue outside a loop"),
            Some(lbl) => {
                let target = lbl.binding.borrow().clone().expect("unresolved label reference");
                self.loop_stack
                    .iter()
                    .rposition(|ctx| ctx.label.as_ref().is_some_and(|b| Rc::ptr_eq(b, &target)))
                    .expect("break/continue label not found on the loop stack")
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_if(
        &mut self,
        prog: &mut ProgramCompiler,
        cond_decl: &Option<(Target, bool, Expr)>,
        cond: &Option<Expr>,
        then: &Block,
        else_: &Option<Block>,
    ) {
        if let Some((target, _, value)) = cond_decl {
            self.compile_expr(prog, value);
            self.code.emit(Opcode::Dup);
            self.code.emit(Opcode::Not);
            let to_else = self.code.emit_jump(Opcode::CJmp, -1);
            self.compile_store_tos(prog, target);
            self.compile_block(prog, then);
            let done = self.code.emit_jump(Opcode::Jmp, 0);
            self.code.patch_jump(to_else);
            self.code.emit(Opcode::Pop);
            if let Some(e) = else_ {
                self.compile_block(prog, e);
            }
            self.code.patch_jump(done);
            return;
        }
        let Some(c) = cond else {
            self.compile_block(prog, then);
            if let Some(e) = else_ {
                self.compile_block(prog, e);
            }
            return;
        };
        self.compile_expr(prog, c);
        self.code.emit(Opcode::Not);
        let to_else = self.code.emit_jump(Opcode::CJmp, -1);
        self.compile_block(prog, then);
        if let Some(e) = else_ {
            let done = self.code.emit_jump(Opcode::Jmp, 0);
            self.code.patch_jump(to_else);
            self.compile_block(prog, e);
            self.code.patch_jump(done);
        } else {
            self.code.patch_jump(to_else);
        }
    }

    /// `guard let target = value else BLK end`: `else_` is expected to
    /// diverge (`return`/`break`/`continue`/`throw`); `target` is bound in
    /// the enclosing block for everything that follows the guard.
    fn compile_guard(&mut self, prog: &mut ProgramCompiler, target: &Target, value: &Expr, else_: &Block) {
        self.compile_expr(prog, value);
        self.code.emit(Opcode::Dup);
        self.code.emit(Opcode::Not);
        let to_else = self.code.emit_jump(Opcode::CJmp, -1);
        self.compile_store_tos(prog, target);
        let after = self.code.emit_jump(Opcode::Jmp, 0);
        self.code.patch_jump(to_else);
        self.code.emit(Opcode::Pop);
        self.compile_block(prog, else_);
        self.code.patch_jump(after);
    }

    fn compile_for3(
        &mut self,
        prog: &mut ProgramCompiler,
        init: &Option<Box<Stmt>>,
        cond: &Option<Expr>,
        post: &Option<Box<Stmt>>,
        body: &Block,
        loop_label: Option<BindingRef>,
    ) {
        if let Some(init) = init {
            self.compile_stmt(prog, init, None);
        }
        let head = self.code.offset();
        let mut done_jump = None;
        if let Some(c) = cond {
            self.compile_expr(prog, c);
            self.code.emit(Opcode::Not);
            done_jump = Some(self.code.emit_jump(Opcode::CJmp, -1));
        }
        self.loop_stack.push(LoopCtx {
            label: loop_label,
            continue_target: ContinueTarget::Forward(Vec::new()),
            break_jumps: Vec::new(),
        });
        self.compile_block(prog, body);
        let post_start = self.code.offset();
        if let Some(post) = post {
            self.compile_stmt(prog, post, None);
        }
        self.code.emit_jump_to(Opcode::Jmp, head, 0);
        if let Some(j) = done_jump {
            self.code.patch_jump(j);
        }
        let done = self.code.offset();
        let ctx = self.loop_stack.pop().expect("loop stack underflow");
        match ctx.continue_target {
            ContinueTarget::Forward(jumps) => {
                for j in jumps {
                    self.code.patch_jump_to(j, post_start);
                }
            }
            ContinueTarget::Known(_) => unreachable!("for3 always starts with a Forward continue target"),
        }
        for j in ctx.break_jumps {
            self.code.patch_jump_to(j, done);
        }
    }

    fn compile_for_in(
        &mut self,
        prog: &mut ProgramCompiler,
        targets: &[Target],
        iter: &Expr,
        body: &Block,
        loop_label: Option<BindingRef>,
    ) {
        self.compile_expr(prog, iter);
        self.code.emit(Opcode::IterPush);
        let head = self.code.offset();
        let exhaust = self.code.emit_jump(Opcode::IterJmp, 1);
        if targets.len() == 1 {
            self.compile_store_tos(prog, &targets[0]);
        } else {
            let tmp = self.alloc_temp();
            self.code.emit_arg(Opcode::SetLocal, tmp);
            for (i, t) in targets.iter().enumerate() {
                self.code.emit_arg(Opcode::Local, tmp);
                #[allow(clippy::cast_possible_wrap)]
                self.emit_int_const(prog, i as i64);
                self.code.emit(Opcode::Index);
                self.compile_store_tos(prog, t);
            }
        }
        self.loop_stack.push(LoopCtx {
            label: loop_label,
            continue_target: ContinueTarget::Known(head),
            break_jumps: Vec::new(),
        });
        self.compile_block(prog, body);
        self.code.emit_jump_to(Opcode::Jmp, head, 0);
        self.code.patch_jump(exhaust);
        let done = self.code.offset();
        let ctx = self.loop_stack.pop().expect("loop stack underflow");
        for j in ctx.break_jumps {
            self.code.patch_jump_to(j, done);
        }
        self.code.emit(Opcode::IterPop);
    }

    /// A class is a plain `Map` of fields plus methods (ordinary closures):
    /// the resolver's synthetic class block never binds field/method names
    /// into any runtime scope, so there's no separate object representation
    /// for the VM to support.
    fn compile_classdef(&mut self, prog: &mut ProgramCompiler, def: &ClassDef) {
        self.code.emit_arg_with_effect(Opcode::MakeMap, 0, 1);
        for (name, init) in &def.fields {
            self.code.emit(Opcode::Dup);
            let kidx = prog.constants.str(name);
            self.code.emit_arg(Opcode::Constant, kidx);
            self.compile_expr(prog, init);
            self.code.emit(Opcode::SetMap);
        }
        for (name, method) in &def.methods {
            self.code.emit(Opcode::Dup);
            let kidx = prog.constants.str(name);
            self.code.emit_arg(Opcode::Constant, kidx);
            self.compile_funclit(prog, method);
            self.code.emit(Opcode::SetMap);
        }
        let binding = def.binding.borrow().clone().expect("unresolved class binding");
        self.write_binding_ref(&binding);
    }

    /// `defer BLK end`: a forward jump skips the handler body in the normal
    /// path; the body itself ends with `DEFEREXIT`. `record_defer` is
    /// called with the protected scope as it stood *outside* this `defer`'s
    /// own body (i.e. after popping it), so `PC1` reflects whatever
    /// `defer`/`catch` encloses this statement, if any.
    fn compile_defer(&mut self, prog: &mut ProgramCompiler, body: &Block) {
        let after_jump = self.code.emit_jump(Opcode::Jmp, 0);
        let start_pc = self.code.offset();
        self.code.push_protected_scope();
        self.compile_block(prog, body);
        self.code.emit(Opcode::DeferExit);
        self.code.pop_protected_scope();
        self.code.patch_jump(after_jump);
        let pc0 = self.code.offset();
        self.code.record_defer(pc0, start_pc);
    }

    /// `catch BLK end`: same shape as `defer`, but the body ends with
    /// `CATCHJMP<after>` instead of `DEFEREXIT` — both the leading skip-jump
    /// and the trailing `CATCHJMP` target the same "after" address, since
    /// normal completion of the handler resumes exactly where the skip
    /// would have landed.
    fn compile_catch(&mut self, prog: &mut ProgramCompiler, body: &Block) {
        let after_jump = self.code.emit_jump(Opcode::Jmp, 0);
        let start_pc = self.code.offset();
        self.code.push_protected_scope();
        self.compile_block(prog, body);
        let catchjmp = self.code.emit_jump(Opcode::CatchJmp, 0);
        self.code.pop_protected_scope();
        self.code.patch_jump(after_jump);
        self.code.patch_jump(catchjmp);
        let pc0 = self.code.offset();
        self.code.record_catch(pc0, start_pc);
    }
}

fn binop_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Plus,
        BinOp::Sub => Opcode::Minus,
        BinOp::Mul => Opcode::Star,
        BinOp::Div => Opcode::Slash,
        BinOp::FloorDiv => Opcode::SlashSlash,
        BinOp::Mod => Opcode::Percent,
        BinOp::Xor => Opcode::Circumflex,
        BinOp::BitAnd => Opcode::Ampersand,
        BinOp::BitOr => Opcode::Pipe,
        BinOp::Shl => Opcode::LtLt,
        BinOp::Shr => Opcode::GtGt,
        BinOp::Lt => Opcode::Lt,
        BinOp::Le => Opcode::Le,
        BinOp::Gt => Opcode::Gt,
        BinOp::Ge => Opcode::Ge,
        BinOp::Eq => Opcode::Eql,
        BinOp::Ne => Opcode::Neq,
        BinOp::In => Opcode::In,
    }
}

fn unop_opcode(op: UnOp) -> Opcode {
    match op {
        UnOp::Plus => Opcode::UPlus,
        UnOp::Minus => Opcode::UMinus,
        UnOp::BitNot => Opcode::UTilde,
        UnOp::Not => Opcode::Not,
        UnOp::Len => Opcode::Len,
    }
}
