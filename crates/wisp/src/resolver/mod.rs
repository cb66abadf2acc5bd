//! Transforms a parsed AST into one where every [`IdentExpr`] carries a
//! fully-determined [`Binding`] and every label carries its target kind.
//!
//! The resolver walks the tree maintaining a stack of function contexts,
//! each owning a stack of lexical blocks. Declaration (`bind`) and lookup
//! (`use`) are the two primitive operations everything else is built from;
//! see [`FunctionCtx::bind`] and [`Resolver::use_name`].

use ahash::AHashMap;

use crate::{
    ast::{Block, Chunk, ClassDef, Expr, FuncDef, IdentExpr, LabelRef, Stmt, Target},
    binding::{Binding, BindingRef, FreeVarSource, ResolvedFunctionInfo, Scope},
    error::ResolveError,
    pos::Pos,
};

/// What a block's surrounding construct was, for `break`/`continue`/`goto`/
/// `throw` validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LcdKind {
    Loop,
    Catch,
    Defer,
}

struct LexScope {
    bindings: AHashMap<String, BindingRef>,
    lbindings: AHashMap<String, BindingRef>,
    pending_labels: AHashMap<String, Vec<Pos>>,
    is_defer_catch: bool,
}

impl LexScope {
    fn new(is_defer_catch: bool) -> Self {
        Self {
            bindings: AHashMap::new(),
            lbindings: AHashMap::new(),
            pending_labels: AHashMap::new(),
            is_defer_catch,
        }
    }
}

struct FunctionCtx {
    locals: Vec<BindingRef>,
    freevars: Vec<BindingRef>,
    /// Parallel to `freevars`: how the directly enclosing function supplies
    /// each captured cell. See [`FreeVarSource`].
    freevar_sources: Vec<FreeVarSource>,
    labels: Vec<BindingRef>,
    blocks: Vec<LexScope>,
    lcd_stack: Vec<LcdKind>,
    /// Set while resolving a `defer` body; `return` is rejected there.
    in_defer: bool,
    /// Set while resolving a `catch` body; a bare `throw` is only valid there.
    in_catch: bool,
}

impl FunctionCtx {
    fn new() -> Self {
        Self {
            locals: Vec::new(),
            freevars: Vec::new(),
            freevar_sources: Vec::new(),
            labels: Vec::new(),
            blocks: vec![LexScope::new(false)],
            lcd_stack: Vec::new(),
            in_defer: false,
            in_catch: false,
        }
    }

    fn push_block(&mut self, is_defer_catch: bool) {
        self.blocks.push(LexScope::new(is_defer_catch));
    }

    fn pop_block(&mut self) -> Vec<(String, Pos)> {
        let block = self.blocks.pop().expect("unbalanced block stack");
        block.pending_labels.into_iter().map(|(name, mut pos)| (name, pos.remove(0))).collect()
    }

    /// Declares a new local in the current block.
    fn bind(&mut self, name: &str, is_const: bool, pos: Pos, errors: &mut ResolveError) -> BindingRef {
        let block = self.blocks.last_mut().expect("no current block");
        if block.bindings.contains_key(name) {
            errors.push(pos, format!("'{name}' already declared in this block"));
        }
        let index = u32::try_from(self.locals.len()).expect("too many locals");
        let binding = Binding::new(Scope::Local, is_const, index, pos, name);
        self.locals.push(binding.clone());
        self.blocks.last_mut().unwrap().bindings.insert(name.to_owned(), binding.clone());
        binding
    }

    /// Looks up `name` within this function's own blocks only (innermost out).
    fn lookup_local(&self, name: &str) -> Option<BindingRef> {
        for block in self.blocks.iter().rev() {
            if let Some(b) = block.bindings.get(name) {
                return Some(b.clone());
            }
        }
        None
    }

    fn add_freevar(&mut self, name: &str, pos: Pos, is_const: bool, source: FreeVarSource) -> BindingRef {
        let index = u32::try_from(self.freevars.len()).expect("too many free variables");
        let binding = Binding::new(Scope::Free, is_const, index, pos, name);
        self.freevars.push(binding.clone());
        self.freevar_sources.push(source);
        self.blocks.last_mut().unwrap().bindings.insert(name.to_owned(), binding.clone());
        binding
    }

    fn declare_label(&mut self, name: &str, pos: Pos, is_loop: bool, errors: &mut ResolveError) -> BindingRef {
        // Any variable with the same name in scope between here and the
        // enclosing function/defer-catch barrier makes the label invalid.
        for block in self.blocks.iter().rev() {
            if block.bindings.contains_key(name) {
                errors.push(pos, format!("label '{name}' collides with a variable of the same name in scope"));
                break;
            }
            if block.is_defer_catch {
                break;
            }
        }
        let index = u32::try_from(self.labels.len()).expect("too many labels");
        let scope = if is_loop { Scope::LoopLabel } else { Scope::Label };
        let binding = Binding::new(scope, false, index, pos, name);
        self.labels.push(binding.clone());
        self.blocks.last_mut().unwrap().lbindings.insert(name.to_owned(), binding.clone());
        binding
    }

    fn lookup_label(&self, name: &str) -> Option<BindingRef> {
        for block in self.blocks.iter().rev() {
            if let Some(b) = block.lbindings.get(name) {
                return Some(b.clone());
            }
            if block.is_defer_catch {
                // A jump across a defer/catch barrier is invalid; stop here
                // so an enclosing label is never (wrongly) resolved.
                return None;
            }
        }
        None
    }

    fn record_pending_label(&mut self, name: &str, pos: Pos) {
        self.blocks.last_mut().unwrap().pending_labels.entry(name.to_owned()).or_default().push(pos);
    }
}

/// Resolves a whole chunk against the host's predeclared/universal name
/// sets. Returns the recorded issues; on success they're empty and the
/// chunk's `IdentExpr`/`LabelRef`/`FuncDef`/`Chunk` nodes have all been
/// mutated in place.
pub fn resolve(
    chunk: &Chunk,
    predeclared: &dyn Fn(&str) -> bool,
    universal: &dyn Fn(&str) -> bool,
) -> Result<(), ResolveError> {
    let mut r = Resolver {
        func_stack: vec![FunctionCtx::new()],
        errors: ResolveError::default(),
        predeclared,
        universal,
    };
    r.resolve_block(&chunk.body);
    let info = r.finish_function();
    *chunk.resolved.borrow_mut() = Some(info);
    if r.errors.is_empty() { Ok(()) } else { Err(r.errors) }
}

struct Resolver<'a> {
    func_stack: Vec<FunctionCtx>,
    errors: ResolveError,
    predeclared: &'a dyn Fn(&str) -> bool,
    universal: &'a dyn Fn(&str) -> bool,
}

impl<'a> Resolver<'a> {
    fn cur(&mut self) -> &mut FunctionCtx {
        self.func_stack.last_mut().expect("no current function")
    }

    fn finish_function(&mut self) -> ResolvedFunctionInfo {
        let f = self.func_stack.pop().expect("no current function");
        for (name, pos) in f.blocks.into_iter().flat_map(LexScope::pending_unused) {
            self.errors.push(pos, format!("undefined label '{name}'"));
        }
        let cells = f
            .locals
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b.borrow().scope, Scope::Cell))
            .map(|(i, _)| u32::try_from(i).unwrap())
            .collect();
        ResolvedFunctionInfo {
            num_locals: u32::try_from(f.locals.len()).unwrap(),
            cells,
            freevars: f.freevars.iter().map(|b| b.borrow().name.clone()).collect(),
            freevar_sources: f.freevar_sources,
            num_labels: u32::try_from(f.labels.len()).unwrap(),
        }
    }

    /// `use`: resolves an identifier occurrence, walking outward through
    /// blocks of the current function, then enclosing functions, then the
    /// predeclared/universal namespaces.
    fn use_name(&mut self, name: &str, pos: Pos) -> BindingRef {
        if let Some(b) = self.cur().lookup_local(name) {
            return b;
        }
        // Walk enclosing functions looking for an owning binding, then
        // thread a Free binding back down through every function in between.
        let mut owner_depth = None;
        for depth in (0..self.func_stack.len() - 1).rev() {
            if self.func_stack[depth].lookup_local(name).is_some() {
                owner_depth = Some(depth);
                break;
            }
        }
        if let Some(owner_depth) = owner_depth {
            let owner_binding = self.func_stack[owner_depth].lookup_local(name).unwrap();
            Binding::promote_to_cell(&owner_binding);
            let owner_index = owner_binding.borrow().index;
            let mut source = FreeVarSource::Local(owner_index);
            let mut carried = owner_binding;
            for depth in (owner_depth + 1)..self.func_stack.len() {
                let is_const = carried.borrow().is_const;
                carried = self.func_stack[depth].add_freevar(name, pos, is_const, source);
                source = FreeVarSource::Free(carried.borrow().index);
            }
            return carried;
        }
        if (self.predeclared)(name) {
            return Binding::new(Scope::Predeclared, true, 0, pos, name);
        }
        if (self.universal)(name) {
            return Binding::new(Scope::Universal, true, 0, pos, name);
        }
        self.errors.push(pos, format!("undefined name '{name}'"));
        Binding::new(Scope::Undefined, false, 0, pos, name)
    }

    fn resolve_ident(&mut self, id: &IdentExpr) {
        let binding = self.use_name(&id.name, id.pos);
        *id.binding.borrow_mut() = Some(binding);
    }

    fn resolve_label_ref(&mut self, lbl: &LabelRef, want_loop: bool) {
        match self.cur().lookup_label(&lbl.name) {
            Some(b) => {
                if want_loop && !matches!(b.borrow().scope, Scope::LoopLabel) {
                    self.errors.push(lbl.pos, format!("'{}' is not a loop label", lbl.name));
                }
                *lbl.binding.borrow_mut() = Some(b);
            }
            None => {
                self.cur().record_pending_label(&lbl.name, lbl.pos);
            }
        }
    }

    /// Walks a block's statements in order, bridging a [`Stmt::LabelDecl`]
    /// to the statement immediately following it: if that statement turns
    /// out to be a loop, the label is promoted from `Label` to `LoopLabel`
    /// (spec §4.3 "Labels are `LoopLabel` iff they immediately precede a
    /// loop statement").
    fn resolve_block(&mut self, block: &Block) {
        let mut pending_label: Option<BindingRef> = None;
        for stmt in &block.0 {
            if let Stmt::LabelDecl(decl) = stmt {
                let binding = self.cur().declare_label(&decl.name, decl.pos, false, &mut self.errors);
                *decl.binding.borrow_mut() = Some(binding.clone());
                pending_label = Some(binding);
                continue;
            }
            let loop_label = pending_label.take();
            self.resolve_stmt(stmt, loop_label);
        }
    }

    fn resolve_target_decl(&mut self, target: &Target, is_const: bool) {
        match target {
            Target::Ident(id) => {
                let binding = self.cur().bind(&id.name, is_const, id.pos, &mut self.errors);
                *id.binding.borrow_mut() = Some(binding);
            }
            Target::Tuple(items) => {
                for t in items {
                    self.resolve_target_decl(t, is_const);
                }
            }
            Target::Index { recv, key, .. } => {
                self.resolve_expr(recv);
                self.resolve_expr(key);
            }
            Target::Attr { recv, .. } => self.resolve_expr(recv),
        }
    }

    fn resolve_target_assign(&mut self, target: &Target) {
        match target {
            Target::Ident(id) => {
                self.resolve_ident(id);
                if let Some(binding) = id.binding.borrow().clone() {
                    if binding.borrow().is_const {
                        self.errors.push(id.pos, format!("cannot assign to constant '{}'", id.name));
                    }
                }
            }
            Target::Tuple(items) => items.iter().for_each(|t| self.resolve_target_assign(t)),
            Target::Index { recv, key, .. } => {
                self.resolve_expr(recv);
                self.resolve_expr(key);
            }
            Target::Attr { recv, .. } => self.resolve_expr(recv),
        }
    }

    fn resolve_expr(&mut self, e: &Expr) {
        match e {
            Expr::Nil | Expr::True | Expr::False | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
            Expr::Ident(id) => self.resolve_ident(id),
            Expr::Unary { expr, .. } => self.resolve_expr(expr),
            Expr::Binary { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                self.resolve_expr(lhs);
                self.resolve_expr(rhs);
            }
            Expr::Call { callee, args, .. } => {
                self.resolve_expr(callee);
                args.iter().for_each(|a| self.resolve_expr(a));
            }
            Expr::Index { recv, key, .. } => {
                self.resolve_expr(recv);
                self.resolve_expr(key);
            }
            Expr::Attr { recv, .. } => self.resolve_expr(recv),
            Expr::Tuple(items) | Expr::Array(items) => items.iter().for_each(|i| self.resolve_expr(i)),
            Expr::Map(pairs) => pairs.iter().for_each(|(k, v)| {
                self.resolve_expr(k);
                self.resolve_expr(v);
            }),
            Expr::FuncLit(def) => self.resolve_funcdef(def),
        }
    }

    fn resolve_funcdef(&mut self, def: &FuncDef) {
        self.func_stack.push(FunctionCtx::new());
        for p in &def.params {
            self.cur().bind(p, false, def.pos, &mut self.errors);
        }
        self.resolve_block(&def.body);
        let info = self.finish_function();
        *def.resolved.borrow_mut() = Some(info);
    }

    fn resolve_classdef(&mut self, def: &ClassDef) {
        // All fields then all methods are bound in a synthetic class block
        // so methods can reference each other and fields regardless of order.
        self.cur().push_block(false);
        for (_, init) in &def.fields {
            self.resolve_expr(init);
        }
        for (_, method) in &def.methods {
            self.resolve_funcdef(method);
        }
        let pending = self.cur().pop_block();
        for (name, pos) in pending {
            self.errors.push(pos, format!("undefined label '{name}'"));
        }
    }

    /// `loop_label` is the binding of a [`Stmt::LabelDecl`] that
    /// immediately preceded `stmt` in its block, if any (see
    /// [`Self::resolve_block`]); only `For3`/`ForIn` consume it.
    fn resolve_stmt(&mut self, stmt: &Stmt, loop_label: Option<BindingRef>) {
        match stmt {
            Stmt::Expr(e) => self.resolve_expr(e),
            Stmt::Let { target, is_const, value } => {
                self.resolve_expr(value);
                self.resolve_target_decl(target, *is_const);
            }
            Stmt::Assign { target, value } => {
                self.resolve_expr(value);
                self.resolve_target_assign(target);
            }
            Stmt::AugAssign { target, value, .. } => {
                self.resolve_target_assign(target);
                self.resolve_expr(value);
            }
            Stmt::If { cond_decl, cond, then, else_ } => {
                if let Some((target, is_const, value)) = cond_decl {
                    self.resolve_expr(value);
                    self.cur().push_block(false);
                    self.resolve_target_decl(target, *is_const);
                    self.resolve_block(then);
                    self.close_block();
                } else {
                    if let Some(c) = cond {
                        self.resolve_expr(c);
                    }
                    self.resolve_block(then);
                }
                if let Some(e) = else_ {
                    self.resolve_block(e);
                }
            }
            Stmt::Guard { target, is_const, value, else_ } => {
                self.resolve_expr(value);
                self.resolve_block(else_);
                // declared names are visible in the enclosing block after the guard
                self.resolve_target_decl(target, *is_const);
            }
            Stmt::For3 { init, cond, post, body } => {
                if let Some(label) = &loop_label {
                    Binding::promote_to_loop_label(label);
                }
                self.cur().push_block(false);
                if let Some(init) = init {
                    self.resolve_stmt(init, None);
                }
                if let Some(c) = cond {
                    self.resolve_expr(c);
                }
                if let Some(post) = post {
                    self.resolve_stmt(post, None);
                }
                self.cur().lcd_stack.push(LcdKind::Loop);
                self.resolve_block(body);
                self.cur().lcd_stack.pop();
                self.close_block();
            }
            Stmt::ForIn { targets, iter, body } => {
                self.resolve_expr(iter);
                if let Some(label) = &loop_label {
                    Binding::promote_to_loop_label(label);
                }
                self.cur().push_block(false);
                for t in targets {
                    match t {
                        Target::Ident(id) => {
                            let b = self.cur().bind(&id.name, false, id.pos, &mut self.errors);
                            *id.binding.borrow_mut() = Some(b);
                        }
                        other => self.resolve_target_assign(other),
                    }
                }
                self.cur().lcd_stack.push(LcdKind::Loop);
                self.resolve_block(body);
                self.cur().lcd_stack.pop();
                self.close_block();
            }
            Stmt::FuncDef(def) => {
                let binding = self.cur().bind(def.name.as_deref().unwrap_or("<anonymous>"), false, def.pos, &mut self.errors);
                *def.self_binding.borrow_mut() = Some(binding);
                self.resolve_funcdef(def);
            }
            Stmt::ClassDef(def) => {
                let binding = self.cur().bind(&def.name, false, def.pos, &mut self.errors);
                *def.binding.borrow_mut() = Some(binding);
                self.resolve_classdef(def);
            }
            Stmt::Defer(body) => {
                let was_defer = self.cur().in_defer;
                self.cur().in_defer = true;
                self.cur().lcd_stack.push(LcdKind::Defer);
                self.cur().push_block(true);
                self.resolve_block(body);
                self.close_block();
                self.cur().lcd_stack.pop();
                self.cur().in_defer = was_defer;
            }
            Stmt::Catch(body) => {
                let was_catch = self.cur().in_catch;
                self.cur().in_catch = true;
                self.cur().lcd_stack.push(LcdKind::Catch);
                self.cur().push_block(true);
                self.resolve_block(body);
                self.close_block();
                self.cur().lcd_stack.pop();
                self.cur().in_catch = was_catch;
            }
            Stmt::Return(value) => {
                if self.cur().in_defer {
                    let pos = value.as_ref().map_or(Pos::default(), |_| Pos::default());
                    self.errors.push(pos, "'return' is not allowed inside a defer block".to_owned());
                }
                if let Some(v) = value {
                    self.resolve_expr(v);
                }
            }
            Stmt::Break(label) | Stmt::Continue(label) => {
                if let Some(lbl) = label {
                    self.resolve_label_ref(lbl, true);
                } else if !self.cur().lcd_stack.iter().any(|k| *k == LcdKind::Loop) {
                    self.errors.push(Pos::default(), "break/continue outside a loop".to_owned());
                }
            }
            Stmt::Goto(lbl) => self.resolve_label_ref(lbl, false),
            Stmt::LabelDecl(_) => unreachable!("handled by resolve_block's lookahead"),
            Stmt::Throw(value, pos) => {
                if value.is_none() && !self.cur().in_catch {
                    self.errors.push(*pos, "bare 'throw' is only valid inside a catch block".to_owned());
                }
                if let Some(v) = value {
                    self.resolve_expr(v);
                }
            }
            Stmt::Block(b) => self.resolve_block(b),
        }
    }

    fn close_block(&mut self) {
        let pending = self.cur().pop_block();
        for (name, pos) in pending {
            self.errors.push(pos, format!("undefined label '{name}'"));
        }
    }
}

impl LexScope {
    fn pending_unused(self) -> Vec<(String, Pos)> {
        self.pending_labels.into_iter().map(|(name, mut pos)| (name, pos.remove(0))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::resolve;
    use crate::ast::{Block, Chunk, Expr, FuncDef, IdentExpr, Stmt, Target};
    use crate::binding::Scope;
    use crate::pos::Pos;
    use std::cell::RefCell;

    fn pos() -> Pos {
        Pos::new(1, 1)
    }

    fn chunk(body: Vec<Stmt>) -> Chunk {
        Chunk {
            filename: "test".into(),
            body: Block(body),
            resolved: RefCell::new(None),
        }
    }

    fn no_predeclared(_: &str) -> bool {
        false
    }

    fn no_universal(_: &str) -> bool {
        false
    }

    #[test]
    fn let_binding_resolves_local() {
        let ident_use = IdentExpr::new("x", pos());
        let c = chunk(vec![
            Stmt::Let { target: Target::Ident(IdentExpr::new("x", pos())), is_const: false, value: Expr::Int(1) },
            Stmt::Expr(Expr::Ident(ident_use.clone())),
        ]);
        resolve(&c, &no_predeclared, &no_universal).unwrap();
        let b = ident_use.binding.borrow().clone().unwrap();
        assert_eq!(b.borrow().scope, Scope::Local);
    }

    #[test]
    fn unbound_name_falls_back_to_predeclared() {
        let ident_use = IdentExpr::new("env", pos());
        let c = chunk(vec![Stmt::Expr(Expr::Ident(ident_use.clone()))]);
        resolve(&c, &|n| n == "env", &no_universal).unwrap();
        let b = ident_use.binding.borrow().clone().unwrap();
        assert_eq!(b.borrow().scope, Scope::Predeclared);
    }

    #[test]
    fn unbound_name_with_no_fallback_is_undefined_and_errors() {
        let ident_use = IdentExpr::new("nope", pos());
        let c = chunk(vec![Stmt::Expr(Expr::Ident(ident_use.clone()))]);
        let err = resolve(&c, &no_predeclared, &no_universal).unwrap_err();
        assert!(!err.is_empty());
        let b = ident_use.binding.borrow().clone().unwrap();
        assert_eq!(b.borrow().scope, Scope::Undefined);
    }

    #[test]
    fn captured_local_is_promoted_to_cell() {
        let inner_use = IdentExpr::new("x", pos());
        let inner_fn = FuncDef {
            name: None,
            params: vec![],
            has_varargs: false,
            body: Block(vec![Stmt::Expr(Expr::Ident(inner_use.clone()))]),
            pos: pos(),
            resolved: RefCell::new(None),
            self_binding: RefCell::new(None),
        };
        let outer_use = IdentExpr::new("x", pos());
        let c = chunk(vec![
            Stmt::Let { target: Target::Ident(IdentExpr::new("x", pos())), is_const: false, value: Expr::Int(1) },
            Stmt::FuncDef(Box::new(inner_fn)),
            Stmt::Expr(Expr::Ident(outer_use.clone())),
        ]);
        resolve(&c, &no_predeclared, &no_universal).unwrap();
        let outer_binding = outer_use.binding.borrow().clone().unwrap();
        assert_eq!(outer_binding.borrow().scope, Scope::Cell);
    }

    #[test]
    fn bare_throw_outside_catch_errors() {
        let c = chunk(vec![Stmt::Throw(None, pos())]);
        let err = resolve(&c, &no_predeclared, &no_universal).unwrap_err();
        assert!(err.to_string().contains("bare 'throw'"));
    }
}
