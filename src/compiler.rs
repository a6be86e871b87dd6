// File: src/compiler.rs
//
// Bytecode emitter for the Alto compiler.
// Walks the resolved AST and produces a Module: instructions, data pool,
// and source map. Code is built as a tree of sections whose addresses are
// assigned in a first pass and resolved in a second, so jumps and
// try/finally exits never need placeholder patching.

use crate::ast::{
    Block, CatchClause, Expr, FunctionLit, Program, ScopeId, SlotId, Span, Stmt, TableKey, UnaryOp,
};
use crate::bytecode::{OpCode, Instruction, VALUE_MAX, VALUE_MIN};
use crate::errors::{AltoError, ErrorKind, SourceLocation};
use crate::lexer;
use crate::module::{FrameInfo, MapEntry, Module, SourceMap, VariableInfo, VariablePlace};
use crate::parser;
use crate::resolver::{self, Resolution, ScopeKind, SlotSource, SlotStorage};
use crate::value::{Import, Value};
use ahash::RandomState;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Compile source text all the way to an executable module
pub fn compile(source: &str) -> Result<Module, AltoError> {
    let tokens = lexer::tokenize(source)?;
    let program = parser::parse_program(tokens)?;
    let resolution = resolver::resolve(&program)?;
    Emitter::new(resolution).emit_program(&program)
}

type SectionId = usize;

enum Item {
    Instr { op: OpCode, param: u8, value: i32, map: Rc<MapEntry> },
    /// Instruction whose value is the resolved address of a section
    Target { op: OpCode, param: u8, section: SectionId, map: Rc<MapEntry> },
    Child(SectionId),
}

#[derive(Default)]
struct Section {
    items: Vec<Item>,
    address: usize,
}

/// Control-flow context used to route break/continue/return through
/// intervening try and scope boundaries
#[derive(Clone, Copy)]
enum Flow {
    Scope {
        scope: ScopeId,
    },
    Loop {
        scope: ScopeId,
        continue_to: SectionId,
        break_to: SectionId,
        /// Whether continuing leaves the loop scope (a while body does,
        /// a for statement does not)
        exit_scope_on_continue: bool,
    },
    Try {
        finally: Option<SectionId>,
    },
}

struct PendingFn {
    lit: Rc<FunctionLit>,
    section: SectionId,
    chain: Vec<ScopeId>,
}

struct Emitter {
    resolution: Resolution,
    sections: Vec<Section>,
    root: SectionId,
    cursor: Vec<SectionId>,

    data: Vec<Value>,
    strings: HashMap<String, usize, RandomState>,
    numbers: HashMap<u64, usize, RandomState>,
    imports: HashMap<SlotId, usize, RandomState>,
    import_names: Vec<String>,

    pending: VecDeque<PendingFn>,

    // Per-function emission state
    chain: Vec<ScopeId>,
    flow: Vec<Flow>,
    fn_name: String,
    fn_params: Vec<String>,
    frames: Vec<Rc<FrameInfo>>,

    row: usize,
    column: usize,
    map_cache: Option<Rc<MapEntry>>,
}

impl Emitter {
    fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            sections: vec![Section::default()],
            root: 0,
            cursor: vec![0],
            data: Vec::new(),
            strings: HashMap::with_hasher(RandomState::new()),
            numbers: HashMap::with_hasher(RandomState::new()),
            imports: HashMap::with_hasher(RandomState::new()),
            import_names: Vec::new(),
            pending: VecDeque::new(),
            chain: Vec::new(),
            flow: Vec::new(),
            fn_name: String::new(),
            fn_params: Vec::new(),
            frames: Vec::new(),
            row: 0,
            column: 0,
            map_cache: None,
        }
    }

    fn emit_program(mut self, program: &Program) -> Result<Module, AltoError> {
        let scope = program.scope.get().expect("program was not resolved");

        self.fn_name = "main".to_string();
        self.fn_params = Vec::new();
        self.frames = vec![Rc::new(FrameInfo::toplevel("main"))];
        self.row = program.span.row;
        self.column = program.span.column;

        self.scope_entry(scope, None)?;
        for stmt in &program.body {
            self.emit_stmt(stmt)?;
        }
        self.emit(OpCode::Null, 0, 0);
        self.emit(OpCode::Return, 0, 0);

        // Function bodies follow the main body in the code array
        while let Some(pending) = self.pending.pop_front() {
            let root = self.root;
            self.sections[root].items.push(Item::Child(pending.section));
            self.emit_function_body(pending)?;
        }

        self.assemble()
    }

    fn emit_function_body(&mut self, pending: PendingFn) -> Result<(), AltoError> {
        let PendingFn { lit, section, chain } = pending;
        let scope = lit.scope.get().expect("function literal was not resolved");

        self.chain = chain;
        self.flow = Vec::new();
        self.fn_name = lit.trace_name();
        self.fn_params = lit.params.iter().map(|p| p.name.clone()).collect();
        self.cursor = vec![section];

        self.row = lit.span.row;
        self.column = lit.span.column;
        self.map_cache = None;
        self.frames = vec![Rc::new(FrameInfo {
            function: self.fn_name.clone(),
            parameters: self.fn_params.clone(),
            variables: Vec::new(),
            globals: self.import_names.clone(),
        })];

        self.scope_entry(scope, None)?;
        for stmt in &lit.body {
            self.emit_stmt(stmt)?;
        }
        self.emit(OpCode::Null, 0, 0);
        self.emit(OpCode::Return, 0, 0);
        Ok(())
    }

    // ----- sections -----

    fn new_section(&mut self) -> SectionId {
        let id = self.sections.len();
        self.sections.push(Section::default());
        id
    }

    /// Place a section at the current point and start emitting into it
    fn begin(&mut self) -> SectionId {
        let id = self.new_section();
        self.enter(id);
        id
    }

    fn enter(&mut self, id: SectionId) {
        let cur = *self.cursor.last().expect("emitter has a cursor");
        self.sections[cur].items.push(Item::Child(id));
        self.cursor.push(id);
    }

    fn finish(&mut self) {
        self.cursor.pop();
    }

    /// Place a section as an empty marker; jumps to it land on whatever
    /// follows this point
    fn place(&mut self, id: SectionId) {
        let cur = *self.cursor.last().expect("emitter has a cursor");
        self.sections[cur].items.push(Item::Child(id));
    }

    // ----- instruction emission -----

    fn at(&mut self, span: &Span) {
        if self.row != span.row || self.column != span.column {
            self.row = span.row;
            self.column = span.column;
            self.map_cache = None;
        }
    }

    fn map_entry(&mut self) -> Rc<MapEntry> {
        if let Some(entry) = &self.map_cache {
            return Rc::clone(entry);
        }
        let entry = Rc::new(MapEntry {
            row: self.row,
            column: self.column,
            frame: Rc::clone(self.frames.last().expect("emitter has a frame")),
        });
        self.map_cache = Some(Rc::clone(&entry));
        entry
    }

    fn emit(&mut self, op: OpCode, param: u8, value: i32) {
        let map = self.map_entry();
        let cur = *self.cursor.last().expect("emitter has a cursor");
        self.sections[cur].items.push(Item::Instr { op, param, value, map });
    }

    fn emit_to(&mut self, op: OpCode, param: u8, section: SectionId) {
        let map = self.map_entry();
        let cur = *self.cursor.last().expect("emitter has a cursor");
        self.sections[cur].items.push(Item::Target { op, param, section, map });
    }

    // ----- data pool -----

    fn intern_string(&mut self, text: &str) -> i32 {
        if let Some(&index) = self.strings.get(text) {
            return index as i32;
        }
        let index = self.data.len();
        self.data.push(Value::string(text));
        self.strings.insert(text.to_string(), index);
        index as i32
    }

    fn intern_number(&mut self, number: f64) -> i32 {
        if let Some(&index) = self.numbers.get(&number.to_bits()) {
            return index as i32;
        }
        let index = self.data.len();
        self.data.push(Value::Number(number));
        self.numbers.insert(number.to_bits(), index);
        index as i32
    }

    // ----- scopes and variables -----

    fn closure_depth(&self, scope: ScopeId, span: &Span) -> Result<u8, AltoError> {
        let position = self
            .chain
            .iter()
            .rev()
            .position(|&s| s == scope)
            .expect("closure scope missing from the emission chain");
        let depth = position + 1;
        if depth > 15 {
            return Err(AltoError::new(
                ErrorKind::ParseError,
                "closure nesting exceeds the supported depth".to_string(),
                span.location(),
            )
            .with_source(span.line.to_string()));
        }
        Ok(depth as u8)
    }

    /// Emit scope-entry code: reserve stack locals, then build the closure
    /// frame when the scope owns one. `preset` names a slot whose value is
    /// already sitting in its stack position (the catch binding).
    fn scope_entry(&mut self, scope: ScopeId, preset: Option<SlotId>) -> Result<(), AltoError> {
        let slot_ids = self.resolution.scope(scope).slots.clone();
        for id in slot_ids {
            let slot = self.resolution.slot(id);
            if !matches!(slot.storage, SlotStorage::Local(_)) {
                continue;
            }
            if preset == Some(id) {
                continue;
            }
            match slot.source {
                SlotSource::Argument(i) => self.emit(OpCode::LoadArgument, 0, i as i32),
                SlotSource::ArgumentSlice(i) => self.emit(OpCode::LoadArgumentList, 0, i as i32),
                SlotSource::None => self.emit(OpCode::Null, 0, 0),
            }
        }

        let layout = self.resolution.scope(scope).closure_layout.clone();
        if !layout.is_empty() {
            for id in &layout {
                match self.resolution.slot(*id).source {
                    SlotSource::Argument(i) => self.emit(OpCode::LoadArgument, 0, i as i32),
                    SlotSource::ArgumentSlice(i) => {
                        self.emit(OpCode::LoadArgumentList, 0, i as i32)
                    }
                    SlotSource::None => self.emit(OpCode::Null, 0, 0),
                }
            }
            self.emit(OpCode::EnterClosure, 0, layout.len() as i32);
            self.chain.push(scope);
        }

        self.frames.push(Rc::new(self.build_frame(scope)));
        self.map_cache = None;
        Ok(())
    }

    fn scope_exit(&mut self, scope: ScopeId) {
        if !self.resolution.scope(scope).closure_layout.is_empty() {
            self.emit(OpCode::LeaveClosure, 0, 0);
            self.chain.pop();
        }
        let locals = self.resolution.scope(scope).local_count;
        if locals > 0 {
            self.emit(OpCode::Drop, 0, locals as i32);
        }
        self.frames.pop();
        self.map_cache = None;
    }

    /// Emit the stack/chain cleanup for leaving a scope inside an exit
    /// route, without touching the frame-info stack
    fn route_scope_exit(&mut self, scope: ScopeId, drop_locals: bool) {
        if !self.resolution.scope(scope).closure_layout.is_empty() {
            self.emit(OpCode::LeaveClosure, 0, 0);
        }
        if drop_locals {
            let locals = self.resolution.scope(scope).local_count;
            if locals > 0 {
                self.emit(OpCode::Drop, 0, locals as i32);
            }
        }
    }

    fn build_frame(&self, scope: ScopeId) -> FrameInfo {
        let mut variables = Vec::new();
        let mut crossed_function = false;
        let mut current = Some(scope);
        while let Some(id) = current {
            let lexical = self.resolution.scope(id);
            for &slot_id in &lexical.slots {
                let slot = self.resolution.slot(slot_id);
                match slot.storage {
                    SlotStorage::Local(index) if !crossed_function => {
                        variables.push(VariableInfo {
                            name: slot.name.clone(),
                            place: VariablePlace::Local(index),
                        });
                    }
                    SlotStorage::Closure(index) => {
                        let closure_scope =
                            slot.closure_scope.expect("captured slots have a closure scope");
                        if let Some(position) =
                            self.chain.iter().rev().position(|&s| s == closure_scope)
                        {
                            variables.push(VariableInfo {
                                name: slot.name.clone(),
                                place: VariablePlace::Closure {
                                    depth: position + 1,
                                    index,
                                },
                            });
                        }
                    }
                    _ => {}
                }
            }
            if lexical.kind == ScopeKind::Function {
                crossed_function = true;
            }
            current = lexical.outer;
        }
        FrameInfo {
            function: self.fn_name.clone(),
            parameters: self.fn_params.clone(),
            variables,
            globals: self.import_names.clone(),
        }
    }

    fn load_slot(&mut self, id: SlotId, span: &Span) -> Result<(), AltoError> {
        let slot = self.resolution.slot(id);
        match slot.storage {
            SlotStorage::Local(index) => self.emit(OpCode::LoadVariable, 0, index as i32),
            SlotStorage::Closure(index) => {
                let scope = slot.closure_scope.expect("captured slots have a closure scope");
                let depth = self.closure_depth(scope, span)?;
                self.emit(OpCode::LoadVariable, depth, index as i32);
            }
            SlotStorage::None => match slot.kind {
                resolver::SlotKind::Import => {
                    let index = *self.imports.get(&id).expect("import slot has a pool index");
                    self.emit(OpCode::LoadGlobal, 0, index as i32);
                }
                _ => match slot.source {
                    SlotSource::Argument(i) => self.emit(OpCode::LoadArgument, 0, i as i32),
                    SlotSource::ArgumentSlice(i) => {
                        self.emit(OpCode::LoadArgumentList, 0, i as i32)
                    }
                    SlotSource::None => {
                        panic!("slot '{}' resolved without storage", slot.name)
                    }
                },
            },
        }
        Ok(())
    }

    fn store_slot(&mut self, id: SlotId, span: &Span) -> Result<(), AltoError> {
        let slot = self.resolution.slot(id);
        match slot.storage {
            SlotStorage::Local(index) => self.emit(OpCode::StoreVariable, 0, index as i32),
            SlotStorage::Closure(index) => {
                let scope = slot.closure_scope.expect("captured slots have a closure scope");
                let depth = self.closure_depth(scope, span)?;
                self.emit(OpCode::StoreVariable, depth, index as i32);
            }
            SlotStorage::None => panic!("slot '{}' written without storage", slot.name),
        }
        Ok(())
    }

    // ----- statements -----

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), AltoError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.at(expr.span());
                self.emit_expr(expr)?;
                // A throw never yields a value to discard
                if !matches!(expr, Expr::Throw { .. }) {
                    self.emit(OpCode::Drop, 0, 1);
                }
                Ok(())
            }
            Stmt::Var(decl) => {
                self.at(&decl.span);
                match &decl.init {
                    Some(init) => self.emit_expr(init)?,
                    None => self.emit(OpCode::Null, 0, 0),
                }
                let slot = decl.slot.get().expect("declaration was not resolved");
                self.store_slot(slot, &decl.span)?;
                self.emit(OpCode::Drop, 0, 1);
                Ok(())
            }
            Stmt::Block(block) => self.emit_block(block),
            Stmt::If { condition, then, otherwise, span } => {
                self.at(span);
                self.emit_expr(condition)?;
                let end = self.new_section();
                match otherwise {
                    None => {
                        self.emit_to(OpCode::ConditionalJump, 0, end);
                        self.emit_block(then)?;
                    }
                    Some(otherwise) => {
                        let else_s = self.new_section();
                        self.emit_to(OpCode::ConditionalJump, 0, else_s);
                        self.emit_block(then)?;
                        self.emit_to(OpCode::Jump, 0, end);
                        self.place(else_s);
                        self.emit_stmt(otherwise)?;
                    }
                }
                self.place(end);
                Ok(())
            }
            Stmt::While { condition, body, span } => {
                self.at(span);
                let end = self.new_section();
                let scope = body.scope.get().expect("loop body was not resolved");

                let cond = self.begin();
                self.emit_expr(condition)?;
                self.emit_to(OpCode::ConditionalJump, 0, end);
                self.finish();

                let body_s = self.new_section();
                self.enter(body_s);
                self.flow.push(Flow::Loop {
                    scope,
                    continue_to: cond,
                    break_to: end,
                    exit_scope_on_continue: true,
                });
                self.scope_entry(scope, None)?;
                for stmt in &body.body {
                    self.emit_stmt(stmt)?;
                }
                self.scope_exit(scope);
                self.emit_to(OpCode::Jump, 0, cond);
                self.flow.pop();
                self.finish();

                self.place(end);
                Ok(())
            }
            Stmt::For { init, condition, next, body, span, scope } => {
                self.at(span);
                let loop_scope = scope.get().expect("loop was not resolved");
                let next_s = self.new_section();
                let exit_s = self.new_section();
                let after = self.new_section();

                self.scope_entry(loop_scope, None)?;
                if let Some(init) = init {
                    self.emit_stmt(init)?;
                }

                let cond = self.begin();
                if let Some(condition) = condition {
                    self.emit_expr(condition)?;
                    self.emit_to(OpCode::ConditionalJump, 0, exit_s);
                }
                self.finish();

                self.flow.push(Flow::Loop {
                    scope: loop_scope,
                    continue_to: next_s,
                    break_to: after,
                    exit_scope_on_continue: false,
                });
                self.emit_block(body)?;

                self.enter(next_s);
                if let Some(next) = next {
                    self.at(next.span());
                    self.emit_expr(next)?;
                    self.emit(OpCode::Drop, 0, 1);
                }
                self.emit_to(OpCode::Jump, 0, cond);
                self.finish();
                self.flow.pop();

                self.place(exit_s);
                self.scope_exit(loop_scope);
                self.place(after);
                Ok(())
            }
            Stmt::Try { body, catch, finally, span } => {
                self.at(span);
                match (catch, finally) {
                    (Some(catch), None) => self.emit_try_catch(body, catch),
                    (None, Some(finally)) => {
                        self.emit_try_finally(finally, |emitter| emitter.emit_block(body))
                    }
                    (Some(catch), Some(finally)) => self.emit_try_finally(finally, |emitter| {
                        emitter.emit_try_catch(body, catch)
                    }),
                    (None, None) => self.emit_block(body),
                }
            }
            Stmt::Break(span) => {
                self.at(span);
                self.emit_loop_exit(true);
                Ok(())
            }
            Stmt::Continue(span) => {
                self.at(span);
                self.emit_loop_exit(false);
                Ok(())
            }
            Stmt::Return { value, span } => {
                self.at(span);
                match value {
                    Some(value) => self.emit_expr(value)?,
                    None => self.emit(OpCode::Null, 0, 0),
                }
                self.emit_return_route();
                self.emit(OpCode::Return, 0, 0);
                Ok(())
            }
            Stmt::Import { name, path, span, slot } => {
                self.at(span);
                let slot = slot.get().expect("import was not resolved");
                let index = self.data.len();
                self.data.push(Value::Import(Rc::new(Import::new(path.clone()))));
                self.imports.insert(slot, index);
                self.import_names.push(name.clone());
                Ok(())
            }
            Stmt::Export { name, value, span, slot } => {
                self.at(span);
                self.emit_expr(value)?;
                let slot = slot.get().expect("export was not resolved");
                self.store_slot(slot, span)?;
                // Mirror the binding into the exports table: this.name = value
                self.emit(OpCode::LoadReceiver, 0, 0);
                self.emit(OpCode::Swap, 0, 0);
                let key = self.intern_string(name);
                self.emit(OpCode::LoadGlobal, 0, key);
                self.emit(OpCode::Swap, 0, 0);
                self.emit(OpCode::StoreElement, 0, 0);
                self.emit(OpCode::Drop, 0, 1);
                Ok(())
            }
        }
    }

    fn emit_block(&mut self, block: &Block) -> Result<(), AltoError> {
        let scope = block.scope.get().expect("block was not resolved");
        self.scope_entry(scope, None)?;
        self.flow.push(Flow::Scope { scope });
        for stmt in &block.body {
            self.emit_stmt(stmt)?;
        }
        self.flow.pop();
        self.scope_exit(scope);
        Ok(())
    }

    fn emit_try_catch(&mut self, body: &Block, catch: &CatchClause) -> Result<(), AltoError> {
        let handler = self.new_section();
        let after = self.new_section();

        self.emit_to(OpCode::EnterTry, 0, handler);
        self.flow.push(Flow::Try { finally: None });
        self.emit_block(body)?;
        self.flow.pop();
        self.emit_to(OpCode::LeaveTry, 0, after);

        // The handler is entered with the thrown exception on top of the
        // stack, sitting exactly where the catch scope's first local goes
        self.enter(handler);
        let scope = catch.body.scope.get().expect("catch was not resolved");
        let preset = match &catch.binding {
            Some(binding) => {
                let slot = binding.slot.get().expect("catch binding was not resolved");
                match self.resolution.slot(slot).storage {
                    SlotStorage::Local(_) => Some(slot),
                    _ => {
                        // Captured binding: store through the closure frame
                        // and drop the operand
                        self.store_slot(slot, &binding.span)?;
                        self.emit(OpCode::Drop, 0, 1);
                        None
                    }
                }
            }
            None => {
                self.emit(OpCode::Drop, 0, 1);
                None
            }
        };
        self.scope_entry(scope, preset)?;
        self.flow.push(Flow::Scope { scope });
        for stmt in &catch.body.body {
            self.emit_stmt(stmt)?;
        }
        self.flow.pop();
        self.scope_exit(scope);
        self.finish();

        self.place(after);
        Ok(())
    }

    fn emit_try_finally(
        &mut self,
        finally: &Block,
        body: impl FnOnce(&mut Self) -> Result<(), AltoError>,
    ) -> Result<(), AltoError> {
        let fin = self.new_section();
        let fin_handler = self.new_section();
        let fin_normal = self.new_section();
        let after = self.new_section();

        self.emit_to(OpCode::EnterTry, 0, fin_handler);
        self.flow.push(Flow::Try { finally: Some(fin) });
        body(self)?;
        self.flow.pop();
        self.emit_to(OpCode::LeaveTry, 0, fin_normal);

        // Exception path: run the finally, then rethrow
        self.enter(fin_handler);
        self.emit_to(OpCode::EnterFinally, 0, fin);
        self.emit(OpCode::Throw, 0, 0);
        self.finish();

        // Normal path: run the finally, then continue past the statement
        self.enter(fin_normal);
        self.emit_to(OpCode::EnterFinally, 0, fin);
        self.emit_to(OpCode::Jump, 0, after);
        self.finish();

        self.enter(fin);
        self.emit_block(finally)?;
        self.emit(OpCode::LeaveFinally, 0, 0);
        self.finish();

        self.place(after);
        Ok(())
    }

    /// Route a break or continue through every intervening scope and try
    /// boundary out to the innermost loop
    fn emit_loop_exit(&mut self, is_break: bool) {
        let mut entered = 0usize;
        for index in (0..self.flow.len()).rev() {
            match self.flow[index] {
                Flow::Scope { scope } => {
                    self.route_scope_exit(scope, true);
                }
                Flow::Try { finally } => {
                    let next = self.new_section();
                    self.emit_to(OpCode::LeaveTry, 0, next);
                    self.enter(next);
                    entered += 1;
                    if let Some(fin) = finally {
                        self.emit_to(OpCode::EnterFinally, 0, fin);
                    }
                }
                Flow::Loop { scope, continue_to, break_to, exit_scope_on_continue } => {
                    let target = if is_break { break_to } else { continue_to };
                    if is_break || exit_scope_on_continue {
                        self.route_scope_exit(scope, true);
                    }
                    self.emit_to(OpCode::Jump, 0, target);
                    break;
                }
            }
        }
        for _ in 0..entered {
            self.finish();
        }
    }

    /// Route a return through every enclosing finally, popping closure
    /// frames so each finally body sees the chain it was compiled against.
    /// Stack locals are left in place beneath the return value.
    fn emit_return_route(&mut self) {
        let mut entered = 0usize;
        for index in (0..self.flow.len()).rev() {
            match self.flow[index] {
                Flow::Scope { scope } | Flow::Loop { scope, .. } => {
                    self.route_scope_exit(scope, false);
                }
                Flow::Try { finally } => {
                    let next = self.new_section();
                    self.emit_to(OpCode::LeaveTry, 0, next);
                    self.enter(next);
                    entered += 1;
                    if let Some(fin) = finally {
                        self.emit_to(OpCode::EnterFinally, 0, fin);
                    }
                }
            }
        }
        for _ in 0..entered {
            self.finish();
        }
    }

    // ----- expressions -----

    fn emit_expr(&mut self, expr: &Expr) -> Result<(), AltoError> {
        self.at(expr.span());
        match expr {
            Expr::Null(_) => self.emit(OpCode::Null, 0, 0),
            Expr::Boolean(b, _) => self.emit(OpCode::Boolean, 0, *b as i32),
            Expr::Number(n, _) => self.emit_number(*n),
            Expr::Str(s, _) => {
                let index = self.intern_string(s);
                self.emit(OpCode::LoadGlobal, 0, index);
            }
            Expr::This(_) => self.emit(OpCode::LoadReceiver, 0, 0),
            Expr::Name(name) => {
                let slot = name.slot.get().expect("name was not resolved");
                self.load_slot(slot, &name.span)?;
            }
            Expr::List { items, .. } => {
                for item in items {
                    self.emit_expr(item)?;
                }
                self.emit(OpCode::List, 0, items.len() as i32);
            }
            Expr::Table { entries, .. } => {
                for (key, value) in entries {
                    match key {
                        TableKey::Word(word) => {
                            let index = self.intern_string(word);
                            self.emit(OpCode::LoadGlobal, 0, index);
                        }
                        TableKey::Computed(key) => self.emit_expr(key)?,
                    }
                    self.emit_expr(value)?;
                }
                self.emit(OpCode::Table, 0, entries.len() as i32);
            }
            Expr::Function(lit) => {
                let scope = lit.scope.get().expect("function literal was not resolved");
                let captures = self.resolution.scope(scope).contains_closure_references;
                let section = self.new_section();
                self.emit_to(OpCode::Function, captures as u8, section);
                let chain = if captures { self.chain.clone() } else { Vec::new() };
                self.pending.push_back(PendingFn { lit: Rc::clone(lit), section, chain });
            }
            Expr::Unary { op, operand, .. } => match op {
                UnaryOp::Plus => {
                    self.emit(OpCode::Number, 0, 0);
                    self.emit_expr(operand)?;
                    self.emit(OpCode::Add, 0, 0);
                }
                UnaryOp::Negate => {
                    self.emit_expr(operand)?;
                    self.emit(OpCode::Negate, 0, 0);
                }
                UnaryOp::Not => {
                    self.emit_expr(operand)?;
                    self.emit(OpCode::Not, 0, 0);
                }
            },
            Expr::Binary { op, left, right, .. } => {
                self.emit_expr(left)?;
                self.emit_expr(right)?;
                self.emit_binary_op(*op);
            }
            Expr::Logical { and, left, right, .. } => {
                let end = self.new_section();
                self.emit_expr(left)?;
                let op = if *and { OpCode::ConditionalAnd } else { OpCode::ConditionalOr };
                self.emit_to(op, 0, end);
                self.emit_expr(right)?;
                self.place(end);
            }
            Expr::Conditional { condition, then, otherwise, .. } => {
                let else_s = self.new_section();
                let end = self.new_section();
                self.emit_expr(condition)?;
                self.emit_to(OpCode::ConditionalJump, 0, else_s);
                self.emit_expr(then)?;
                self.emit_to(OpCode::Jump, 0, end);
                self.place(else_s);
                self.emit_expr(otherwise)?;
                self.place(end);
            }
            Expr::Assign { target, op, value, span } => match target.as_ref() {
                Expr::Name(name) => {
                    let slot = name.slot.get().expect("assignment target was not resolved");
                    if let Some(op) = op {
                        self.load_slot(slot, &name.span)?;
                        self.emit_expr(value)?;
                        self.emit_binary_op(*op);
                    } else {
                        self.emit_expr(value)?;
                    }
                    self.at(span);
                    self.store_slot(slot, span)?;
                }
                Expr::Member { object, key, .. } => {
                    self.emit_expr(object)?;
                    self.emit_expr(key)?;
                    if let Some(op) = op {
                        self.emit(OpCode::Copy, 0, 2);
                        self.emit(OpCode::LoadElement, 0, 0);
                        self.emit_expr(value)?;
                        self.emit_binary_op(*op);
                    } else {
                        self.emit_expr(value)?;
                    }
                    self.at(span);
                    self.emit(OpCode::StoreElement, 0, 0);
                }
                _ => panic!("invalid assignment target survived resolution"),
            },
            Expr::Member { object, key, .. } => {
                self.emit_expr(object)?;
                self.emit_expr(key)?;
                self.emit(OpCode::LoadElement, 0, 0);
            }
            Expr::Call { callee, args, span } => {
                match callee.as_ref() {
                    // Member calls bind the container as receiver
                    Expr::Member { object, key, .. } => {
                        self.emit_expr(object)?;
                        self.emit(OpCode::Copy, 0, 1);
                        self.emit_expr(key)?;
                        self.emit(OpCode::LoadElement, 0, 0);
                        self.emit(OpCode::Swap, 0, 0);
                    }
                    other => {
                        self.emit_expr(other)?;
                        self.emit(OpCode::Null, 0, 0);
                    }
                }
                for arg in args {
                    self.emit_expr(arg)?;
                }
                self.at(span);
                self.emit(OpCode::Call, 0, args.len() as i32);
            }
            Expr::Throw { value, .. } => {
                self.emit_expr(value)?;
                self.emit(OpCode::Throw, 0, 0);
            }
        }
        Ok(())
    }

    fn emit_number(&mut self, n: f64) {
        if n.fract() == 0.0 && n >= VALUE_MIN as f64 && n <= VALUE_MAX as f64 {
            self.emit(OpCode::Number, 0, n as i32);
        } else {
            let index = self.intern_number(n);
            self.emit(OpCode::LoadGlobal, 0, index);
        }
    }

    fn emit_binary_op(&mut self, op: crate::ast::BinaryOp) {
        use crate::ast::BinaryOp::*;
        match op {
            Add => self.emit(OpCode::Add, 0, 0),
            Subtract => self.emit(OpCode::Subtract, 0, 0),
            Multiply => self.emit(OpCode::Multiply, 0, 0),
            Divide => self.emit(OpCode::Divide, 0, 0),
            Remainder => self.emit(OpCode::Remainder, 0, 0),
            And => self.emit(OpCode::And, 0, 0),
            Or => self.emit(OpCode::Or, 0, 0),
            Xor => self.emit(OpCode::Xor, 0, 0),
            Equal => self.emit(OpCode::Equal, 0, 0),
            NotEqual => {
                self.emit(OpCode::Equal, 0, 0);
                self.emit(OpCode::Not, 0, 0);
            }
            Less => self.emit(OpCode::Less, 0, 0),
            LessOrEqual => self.emit(OpCode::LessOrEqual, 0, 0),
            Greater => self.emit(OpCode::Greater, 0, 0),
            GreaterOrEqual => self.emit(OpCode::GreaterOrEqual, 0, 0),
        }
    }

    // ----- assembly -----

    fn assemble(mut self) -> Result<Module, AltoError> {
        let mut address = 0usize;
        layout(&mut self.sections, self.root, &mut address);
        if address > VALUE_MAX as usize {
            return Err(AltoError::new(
                ErrorKind::ParseError,
                "program exceeds the addressable code size".to_string(),
                SourceLocation::unknown(),
            ));
        }

        let mut code = Vec::with_capacity(address);
        let mut map = SourceMap::new();
        flatten(&self.sections, self.root, &mut code, &mut map);
        Ok(Module::new(code, self.data, map))
    }
}

/// First pass: assign addresses to every section in tree order
fn layout(sections: &mut [Section], id: SectionId, address: &mut usize) {
    sections[id].address = *address;
    let children: Vec<Option<SectionId>> = sections[id]
        .items
        .iter()
        .map(|item| match item {
            Item::Child(child) => Some(*child),
            _ => None,
        })
        .collect();
    for child in children {
        match child {
            Some(child) => layout(sections, child, address),
            None => *address += 1,
        }
    }
}

/// Second pass: emit instructions, resolving section targets to addresses
fn flatten(sections: &[Section], id: SectionId, code: &mut Vec<Instruction>, map: &mut SourceMap) {
    for item in &sections[id].items {
        match item {
            Item::Instr { op, param, value, map: entry } => {
                code.push(Instruction::new(*op, *param, *value));
                map.push(Rc::clone(entry));
            }
            Item::Target { op, param, section, map: entry } => {
                code.push(Instruction::new(*op, *param, sections[*section].address as i32));
                map.push(Rc::clone(entry));
            }
            Item::Child(child) => flatten(sections, *child, code, map),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opcodes(module: &Module) -> Vec<(OpCode, u8, i32)> {
        module
            .code()
            .iter()
            .map(|instr| (instr.opcode().expect("defined opcode"), instr.param(), instr.value()))
            .collect()
    }

    #[test]
    fn small_integers_are_inlined() {
        let module = compile("return 42").unwrap();
        assert!(opcodes(&module).contains(&(OpCode::Number, 0, 42)));
        assert_eq!(module.data_len(), 0);
    }

    #[test]
    fn fractions_and_strings_go_through_the_pool() {
        let module = compile("var a = 0.5\nvar b = 'text'\nreturn a").unwrap();
        assert_eq!(module.data_len(), 2);
        assert!(module.global(0).unwrap().op_equal(&Value::Number(0.5)));
        assert_eq!(module.global(1).unwrap().as_str().unwrap(), "text");
    }

    #[test]
    fn repeated_constants_are_interned_once() {
        let module = compile("var a = 'x'\nvar b = 'x'\nvar c = 1.5\nvar d = 1.5").unwrap();
        assert_eq!(module.data_len(), 2);
    }

    #[test]
    fn capturing_functions_set_the_capture_flag() {
        let module = compile("var n = 0\nvar f = () => n\nvar g = () => 1").unwrap();
        let functions: Vec<u8> = opcodes(&module)
            .iter()
            .filter(|(op, _, _)| *op == OpCode::Function)
            .map(|(_, param, _)| *param)
            .collect();
        assert_eq!(functions, vec![1, 0]);
    }

    #[test]
    fn jump_targets_stay_inside_the_code() {
        let source = r#"
            var total = 0
            for (var i = 0; i < 5; i += 1) {
                if (i % 2 == 0) { continue }
                try { total += i } finally { total += 1 }
            }
            return total
        "#;
        let module = compile(source).unwrap();
        let len = module.code().len() as i32;
        for (op, _, value) in opcodes(&module) {
            match op {
                OpCode::Jump
                | OpCode::ConditionalJump
                | OpCode::ConditionalAnd
                | OpCode::ConditionalOr
                | OpCode::Function
                | OpCode::EnterTry
                | OpCode::LeaveTry
                | OpCode::EnterFinally => {
                    assert!(value >= 0 && value < len, "{:?} target {} out of range", op, value);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn compound_member_assignment_duplicates_operands() {
        let module = compile("var t = {}\nt.a += 1").unwrap();
        assert!(opcodes(&module).contains(&(OpCode::Copy, 0, 2)));
    }

    #[test]
    fn member_calls_bind_the_receiver() {
        let module = compile("var t = {}\nt.f()").unwrap();
        let ops: Vec<OpCode> = opcodes(&module).iter().map(|(op, _, _)| *op).collect();
        let call_at = ops.iter().position(|&op| op == OpCode::Call).unwrap();
        // The container is duplicated, the member loaded, and the pair
        // swapped into (callee, receiver) order
        assert!(opcodes(&module).contains(&(OpCode::Copy, 0, 1)));
        assert_eq!(&ops[call_at - 2..call_at], &[OpCode::LoadElement, OpCode::Swap]);
    }

    #[test]
    fn source_map_rows_follow_the_source() {
        let module = compile("var a = 1\nvar b = 2").unwrap();
        let map = module.source_map();
        assert_eq!(map.len(), module.code().len());
        let rows: Vec<usize> =
            (0..map.len()).map(|ip| map.entry(ip).unwrap().row).collect();
        assert!(rows.contains(&1));
        assert!(rows.contains(&2));
        assert!(rows.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn every_body_ends_with_an_explicit_return() {
        let module = compile("var f = () => 1\nvar g = function() { }").unwrap();
        let ops = opcodes(&module);
        let last = ops.last().unwrap();
        assert_eq!(last.0, OpCode::Return);
    }
}
