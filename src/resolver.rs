// File: src/resolver.rs
//
// Scope resolution for the Alto compiler.
// Walks the parsed AST once, binding every name reference to a slot,
// detecting closure captures, and laying out stack and closure-frame
// storage for the emitter.

use crate::ast::{
    Block, CatchClause, Expr, FunctionLit, Program, ScopeId, SlotId, Span, Stmt, TableKey,
};
use crate::errors::{AltoError, ErrorKind};
use ahash::RandomState;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Function,
    Block,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Import,
    Variable,
    Parameter,
}

/// Where a slot's initial value comes from at scope entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSource {
    None,
    Argument(usize),
    ArgumentSlice(usize),
}

/// Where a slot lives at runtime. Imports resolve to a data pool index
/// assigned by the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStorage {
    None,
    Local(usize),
    Closure(usize),
}

#[derive(Debug)]
pub struct Slot {
    pub name: String,
    pub scope: ScopeId,
    pub kind: SlotKind,
    pub source: SlotSource,
    pub storage: SlotStorage,
    pub closure_scope: Option<ScopeId>,
    pub read_only: bool,
    pub written: bool,
    pub captured: bool,
}

#[derive(Debug)]
pub struct LexicalScope {
    pub kind: ScopeKind,
    pub outer: Option<ScopeId>,
    pub inner: Vec<ScopeId>,
    pub slots: Vec<SlotId>,
    /// Captured slots whose frame this scope owns, in frame index order
    pub closure_layout: Vec<SlotId>,
    names: HashMap<String, SlotId, RandomState>,
    /// Nesting depth of the enclosing function; the module body is depth 1
    pub function_depth: usize,
    /// True when code in this function reaches slots of an outer function
    pub contains_closure_references: bool,
    pub local_base: usize,
    pub local_count: usize,
    /// For function scopes: total stack slots the activation reserves
    pub stack_allocation: usize,
}

/// The resolver's output: scope and slot arenas referenced by the
/// annotations it left in the AST
#[derive(Debug)]
pub struct Resolution {
    pub scopes: Vec<LexicalScope>,
    pub slots: Vec<Slot>,
}

impl Resolution {
    pub fn scope(&self, id: ScopeId) -> &LexicalScope {
        &self.scopes[id]
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id]
    }
}

pub fn resolve(program: &Program) -> Result<Resolution, AltoError> {
    let mut resolver = Resolver {
        scopes: Vec::new(),
        slots: Vec::new(),
        current: 0,
        in_finally: false,
    };
    let root = resolver.enter_scope(ScopeKind::Function, None);
    program.scope.set(Some(root));
    resolver.walk_stmts(&program.body)?;
    Ok(resolver.finalize())
}

struct Resolver {
    scopes: Vec<LexicalScope>,
    slots: Vec<Slot>,
    current: ScopeId,
    /// Variables declared while this is set must live in closure frames:
    /// finally bodies run with transient values on the operand stack, so
    /// absolute stack slots are unusable there
    in_finally: bool,
}

impl Resolver {
    fn enter_scope(&mut self, kind: ScopeKind, outer: Option<ScopeId>) -> ScopeId {
        let function_depth = match outer {
            Some(o) => {
                self.scopes[o].function_depth + if kind == ScopeKind::Function { 1 } else { 0 }
            }
            None => 1,
        };
        let id = self.scopes.len();
        self.scopes.push(LexicalScope {
            kind,
            outer,
            inner: Vec::new(),
            slots: Vec::new(),
            closure_layout: Vec::new(),
            names: HashMap::with_hasher(RandomState::new()),
            function_depth,
            contains_closure_references: false,
            local_base: 0,
            local_count: 0,
            stack_allocation: 0,
        });
        if let Some(o) = outer {
            self.scopes[o].inner.push(id);
        }
        self.current = id;
        id
    }

    fn push_scope(&mut self, kind: ScopeKind) -> ScopeId {
        self.enter_scope(kind, Some(self.current))
    }

    fn pop_scope(&mut self) {
        self.current = self.scopes[self.current].outer.expect("cannot leave the root scope");
    }

    fn declare(
        &mut self,
        name: &str,
        kind: SlotKind,
        source: SlotSource,
        read_only: bool,
        span: &Span,
    ) -> Result<SlotId, AltoError> {
        // Redeclaring any visible name is an error; there is no shadowing
        let mut scope = Some(self.current);
        while let Some(id) = scope {
            if self.scopes[id].names.contains_key(name) {
                return Err(AltoError::new(
                    ErrorKind::ParseError,
                    format!("'{}' is already declared", name),
                    span.location(),
                )
                .with_source(span.line.to_string()));
            }
            scope = self.scopes[id].outer;
        }

        let id = self.slots.len();
        self.slots.push(Slot {
            name: name.to_string(),
            scope: self.current,
            kind,
            source,
            storage: SlotStorage::None,
            closure_scope: None,
            read_only,
            written: false,
            captured: self.in_finally && kind == SlotKind::Variable,
        });
        self.scopes[self.current].slots.push(id);
        self.scopes[self.current].names.insert(name.to_string(), id);
        Ok(id)
    }

    fn reference(&mut self, name: &str, span: &Span) -> Result<SlotId, AltoError> {
        let mut scope = Some(self.current);
        let slot = loop {
            let Some(id) = scope else {
                return Err(AltoError::resolve_error(
                    format!("'{}' is not defined", name),
                    span.location(),
                )
                .with_source(span.line.to_string()));
            };
            if let Some(&slot) = self.scopes[id].names.get(name) {
                break slot;
            }
            scope = self.scopes[id].outer;
        };

        // A reference from a deeper function than the declaration captures
        // the slot; every function between must carry the closure chain
        let declared_depth = self.scopes[self.slots[slot].scope].function_depth;
        if self.scopes[self.current].function_depth > declared_depth {
            self.slots[slot].captured = true;
            let mut id = self.current;
            loop {
                let scope = &mut self.scopes[id];
                if scope.function_depth <= declared_depth {
                    break;
                }
                if scope.kind == ScopeKind::Function {
                    scope.contains_closure_references = true;
                }
                id = scope.outer.expect("walked past the root scope");
            }
        }

        Ok(slot)
    }

    fn walk_stmts(&mut self, stmts: &[Stmt]) -> Result<(), AltoError> {
        for stmt in stmts {
            self.walk_stmt(stmt)?;
        }
        Ok(())
    }

    fn walk_block(&mut self, block: &Block, kind: ScopeKind) -> Result<(), AltoError> {
        let scope = self.push_scope(kind);
        block.scope.set(Some(scope));
        self.walk_stmts(&block.body)?;
        self.pop_scope();
        Ok(())
    }

    fn walk_stmt(&mut self, stmt: &Stmt) -> Result<(), AltoError> {
        match stmt {
            Stmt::Expr(expr) => self.walk_expr(expr),
            Stmt::Var(decl) => {
                let slot = self.declare(
                    &decl.name,
                    SlotKind::Variable,
                    SlotSource::None,
                    decl.read_only,
                    &decl.span,
                )?;
                decl.slot.set(Some(slot));
                self.slots[slot].written = true;
                if let Some(init) = &decl.init {
                    self.walk_expr(init)?;
                }
                Ok(())
            }
            Stmt::Block(block) => self.walk_block(block, ScopeKind::Block),
            Stmt::If { condition, then, otherwise, .. } => {
                self.walk_expr(condition)?;
                self.walk_block(then, ScopeKind::Block)?;
                if let Some(otherwise) = otherwise {
                    self.walk_stmt(otherwise)?;
                }
                Ok(())
            }
            Stmt::While { condition, body, .. } => {
                self.walk_expr(condition)?;
                self.walk_block(body, ScopeKind::Loop)
            }
            Stmt::For { init, condition, next, body, scope, .. } => {
                let loop_scope = self.push_scope(ScopeKind::Loop);
                scope.set(Some(loop_scope));
                if let Some(init) = init {
                    self.walk_stmt(init)?;
                }
                if let Some(condition) = condition {
                    self.walk_expr(condition)?;
                }
                if let Some(next) = next {
                    self.walk_expr(next)?;
                }
                self.walk_block(body, ScopeKind::Block)?;
                self.pop_scope();
                Ok(())
            }
            Stmt::Try { body, catch, finally, .. } => {
                self.walk_block(body, ScopeKind::Block)?;
                if let Some(CatchClause { binding, body }) = catch {
                    let scope = self.push_scope(ScopeKind::Block);
                    body.scope.set(Some(scope));
                    if let Some(binding) = binding {
                        let slot = self.declare(
                            &binding.name,
                            SlotKind::Variable,
                            SlotSource::None,
                            false,
                            &binding.span,
                        )?;
                        self.slots[slot].written = true;
                        binding.slot.set(Some(slot));
                    }
                    self.walk_stmts(&body.body)?;
                    self.pop_scope();
                }
                if let Some(finally) = finally {
                    let saved = self.in_finally;
                    self.in_finally = true;
                    self.walk_block(finally, ScopeKind::Block)?;
                    self.in_finally = saved;
                }
                Ok(())
            }
            Stmt::Break(_) | Stmt::Continue(_) => Ok(()),
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.walk_expr(value)?;
                }
                Ok(())
            }
            Stmt::Import { name, span, slot, .. } => {
                let id =
                    self.declare(name, SlotKind::Import, SlotSource::None, true, span)?;
                slot.set(Some(id));
                Ok(())
            }
            Stmt::Export { name, value, span, slot } => {
                let id =
                    self.declare(name, SlotKind::Variable, SlotSource::None, true, span)?;
                slot.set(Some(id));
                self.slots[id].written = true;
                self.walk_expr(value)
            }
        }
    }

    fn walk_expr(&mut self, expr: &Expr) -> Result<(), AltoError> {
        match expr {
            Expr::Null(_)
            | Expr::Boolean(_, _)
            | Expr::Number(_, _)
            | Expr::Str(_, _)
            | Expr::This(_) => Ok(()),
            Expr::Name(name) => {
                let slot = self.reference(&name.name, &name.span)?;
                name.slot.set(Some(slot));
                Ok(())
            }
            Expr::List { items, .. } => {
                for item in items {
                    self.walk_expr(item)?;
                }
                Ok(())
            }
            Expr::Table { entries, .. } => {
                for (key, value) in entries {
                    if let TableKey::Computed(key) = key {
                        self.walk_expr(key)?;
                    }
                    self.walk_expr(value)?;
                }
                Ok(())
            }
            Expr::Function(lit) => self.walk_function(lit),
            Expr::Unary { operand, .. } => self.walk_expr(operand),
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                self.walk_expr(left)?;
                self.walk_expr(right)
            }
            Expr::Conditional { condition, then, otherwise, .. } => {
                self.walk_expr(condition)?;
                self.walk_expr(then)?;
                self.walk_expr(otherwise)
            }
            Expr::Assign { target, value, span, .. } => {
                match target.as_ref() {
                    Expr::Name(name) => {
                        let slot = self.reference(&name.name, &name.span)?;
                        if self.slots[slot].read_only {
                            return Err(AltoError::new(
                                ErrorKind::ParseError,
                                format!("cannot assign to constant '{}'", name.name),
                                span.location(),
                            )
                            .with_source(span.line.to_string()));
                        }
                        self.slots[slot].written = true;
                        name.slot.set(Some(slot));
                    }
                    Expr::Member { object, key, .. } => {
                        self.walk_expr(object)?;
                        self.walk_expr(key)?;
                    }
                    other => {
                        return Err(AltoError::new(
                            ErrorKind::ParseError,
                            "invalid assignment target".to_string(),
                            other.span().location(),
                        )
                        .with_source(other.span().line.to_string()));
                    }
                }
                self.walk_expr(value)
            }
            Expr::Member { object, key, .. } => {
                self.walk_expr(object)?;
                self.walk_expr(key)
            }
            Expr::Call { callee, args, .. } => {
                self.walk_expr(callee)?;
                for arg in args {
                    self.walk_expr(arg)?;
                }
                Ok(())
            }
            Expr::Throw { value, .. } => self.walk_expr(value),
        }
    }

    fn walk_function(&mut self, lit: &FunctionLit) -> Result<(), AltoError> {
        let scope = self.push_scope(ScopeKind::Function);
        lit.scope.set(Some(scope));

        // Function bodies stand apart from any enclosing finally block
        let saved = self.in_finally;
        self.in_finally = false;

        for (index, param) in lit.params.iter().enumerate() {
            let source = if param.rest {
                SlotSource::ArgumentSlice(index)
            } else {
                SlotSource::Argument(index)
            };
            let slot =
                self.declare(&param.name, SlotKind::Parameter, source, false, &param.span)?;
            param.slot.set(Some(slot));
        }

        self.walk_stmts(&lit.body)?;
        self.in_finally = saved;
        self.pop_scope();
        Ok(())
    }

    fn finalize(mut self) -> Resolution {
        // Assign captured slots to closure frames. The frame lives on the
        // innermost enclosing function-or-loop scope, so per-iteration
        // loop frames keep per-iteration captures.
        for id in 0..self.slots.len() {
            if !self.slots[id].captured {
                continue;
            }
            let mut scope = self.slots[id].scope;
            while self.scopes[scope].kind == ScopeKind::Block {
                scope = self.scopes[scope].outer.expect("block scopes have an outer scope");
            }
            let index = self.scopes[scope].closure_layout.len();
            self.scopes[scope].closure_layout.push(id);
            self.slots[id].closure_scope = Some(scope);
            self.slots[id].storage = SlotStorage::Closure(index);
        }

        // Dense stack layout per function, reusing indexes across sibling
        // scopes
        for id in 0..self.scopes.len() {
            if self.scopes[id].kind == ScopeKind::Function {
                let max = self.layout_scope(id, 0);
                self.scopes[id].stack_allocation = max;
            }
        }

        Resolution { scopes: self.scopes, slots: self.slots }
    }

    fn layout_scope(&mut self, scope: ScopeId, base: usize) -> usize {
        let slot_ids = self.scopes[scope].slots.clone();
        let mut next = base;
        for id in slot_ids {
            let slot = &mut self.slots[id];
            if slot.captured {
                continue;
            }
            let needs_stack = match slot.kind {
                SlotKind::Variable => true,
                SlotKind::Parameter => slot.written,
                SlotKind::Import => false,
            };
            if needs_stack {
                slot.storage = SlotStorage::Local(next);
                next += 1;
            }
        }
        self.scopes[scope].local_base = base;
        self.scopes[scope].local_count = next - base;

        let mut max = next;
        let inner = self.scopes[scope].inner.clone();
        for child in inner {
            if self.scopes[child].kind == ScopeKind::Function {
                continue;
            }
            max = max.max(self.layout_scope(child, next));
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_program;

    fn resolve_source(source: &str) -> Resolution {
        let program = parse_program(tokenize(source).unwrap()).unwrap();
        resolve(&program).unwrap_or_else(|e| panic!("resolve error:\n{}", e))
    }

    fn slot_named<'r>(resolution: &'r Resolution, name: &str) -> &'r Slot {
        resolution
            .slots
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no slot named '{}'", name))
    }

    #[test]
    fn captured_variables_move_to_closure_frames() {
        let resolution = resolve_source("var n = 0\nvar f = () => n");
        let n = slot_named(&resolution, "n");
        assert!(n.captured);
        assert!(matches!(n.storage, SlotStorage::Closure(0)));
        let f = slot_named(&resolution, "f");
        assert!(!f.captured);
    }

    #[test]
    fn capturing_functions_are_marked() {
        let resolution = resolve_source("var n = 0\nvar f = () => n\nvar g = () => 1");
        let marked: Vec<bool> = resolution
            .scopes
            .iter()
            .filter(|s| s.kind == ScopeKind::Function && s.function_depth == 2)
            .map(|s| s.contains_closure_references)
            .collect();
        assert_eq!(marked, vec![true, false]);
    }

    #[test]
    fn sibling_blocks_reuse_stack_slots() {
        let resolution = resolve_source("{ var a = 1 }\n{ var b = 2 }");
        let a = slot_named(&resolution, "a");
        let b = slot_named(&resolution, "b");
        assert_eq!(a.storage, SlotStorage::Local(0));
        assert_eq!(b.storage, SlotStorage::Local(0));
        let root = &resolution.scopes[0];
        assert_eq!(root.stack_allocation, 1);
    }

    #[test]
    fn unwritten_parameters_stay_argument_sourced() {
        let resolution = resolve_source("var f = function(a, b) { return a }");
        let a = slot_named(&resolution, "a");
        assert_eq!(a.storage, SlotStorage::None);
        assert_eq!(a.source, SlotSource::Argument(0));
    }

    #[test]
    fn written_parameters_get_stack_slots() {
        let resolution = resolve_source("var f = function(a) { a = 1 }");
        let a = slot_named(&resolution, "a");
        assert!(a.written);
        assert!(matches!(a.storage, SlotStorage::Local(_)));
    }

    #[test]
    fn rest_parameters_carry_their_slice_index() {
        let resolution = resolve_source("var f = function(a, ...rest) { return rest }");
        let rest = slot_named(&resolution, "rest");
        assert_eq!(rest.source, SlotSource::ArgumentSlice(1));
    }

    #[test]
    fn loop_scopes_own_their_captures() {
        let resolution =
            resolve_source("var f = null\nwhile (true) { var n = 1\nf = () => n }");
        let n = slot_named(&resolution, "n");
        let frame_scope = n.closure_scope.expect("n is captured");
        assert_eq!(resolution.scopes[frame_scope].kind, ScopeKind::Loop);
    }

    #[test]
    fn block_captures_hoist_to_the_function_frame() {
        let resolution = resolve_source("var f = null\n{ var n = 1\nf = () => n }");
        let n = slot_named(&resolution, "n");
        let frame_scope = n.closure_scope.expect("n is captured");
        assert_eq!(resolution.scopes[frame_scope].kind, ScopeKind::Function);
    }

    #[test]
    fn finally_variables_live_in_closure_frames() {
        let resolution = resolve_source("try { } finally { var t = 1 }");
        let t = slot_named(&resolution, "t");
        assert!(t.captured);
        assert!(matches!(t.storage, SlotStorage::Closure(_)));
    }

    #[test]
    fn imports_are_read_only_globals() {
        let resolution = resolve_source("import console from 'console'");
        let slot = slot_named(&resolution, "console");
        assert_eq!(slot.kind, SlotKind::Import);
        assert!(slot.read_only);
        assert_eq!(slot.storage, SlotStorage::None);
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let program = parse_program(tokenize("var x = 1\nvar x = 2").unwrap()).unwrap();
        let err = resolve(&program).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::ParseError);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let program = parse_program(tokenize("ghost = 1").unwrap()).unwrap();
        let err = resolve(&program).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::ResolveError);
    }

    #[test]
    fn nested_scopes_extend_the_stack() {
        let resolution = resolve_source("var a = 1\n{ var b = 2\n{ var c = 3 } }");
        assert_eq!(slot_named(&resolution, "a").storage, SlotStorage::Local(0));
        assert_eq!(slot_named(&resolution, "b").storage, SlotStorage::Local(1));
        assert_eq!(slot_named(&resolution, "c").storage, SlotStorage::Local(2));
        assert_eq!(resolution.scopes[0].stack_allocation, 3);
    }
}
