// File: src/module.rs
//
// Compiled module representation: code, data pool, source map, and the
// exports table user code reaches through its receiver. Imports sit in
// the data pool as placeholders until the first run fixes them up.

use crate::bytecode::Instruction;
use crate::errors::{AltoError, ErrorKind, SourceLocation};
use crate::value::{Import, Value};
use crate::vm::{self, VmError};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Handler invoked for each unresolved import before the first run; the
/// handler satisfies the import by writing `import.resolved`
pub type ImportingFn = Box<dyn Fn(&Module, &Import)>;

/// Where a visible variable lives, for the inspector and stack traces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariablePlace {
    Local(usize),
    Closure { depth: usize, index: usize },
}

#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub name: String,
    pub place: VariablePlace,
}

/// Static context shared by every instruction emitted in one scope region
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub function: String,
    pub parameters: Vec<String>,
    pub variables: Vec<VariableInfo>,
    pub globals: Vec<String>,
}

impl FrameInfo {
    pub fn toplevel(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            parameters: Vec::new(),
            variables: Vec::new(),
            globals: Vec::new(),
        }
    }
}

/// Per-instruction source record
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub row: usize,
    pub column: usize,
    pub frame: Rc<FrameInfo>,
}

/// Per-instruction source map; entries parallel the code array
#[derive(Debug, Default)]
pub struct SourceMap {
    entries: Vec<Rc<MapEntry>>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: Rc<MapEntry>) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, ip: usize) -> Option<&Rc<MapEntry>> {
        self.entries.get(ip)
    }

    /// Function name recorded for an instruction, for naming function
    /// values created at runtime
    pub fn function_name(&self, ip: usize) -> String {
        self.entry(ip).map(|e| e.frame.function.clone()).unwrap_or_else(|| "anonymous".to_string())
    }

    /// One stack-trace line for the instruction at `ip`
    pub fn frame_line(&self, ip: usize) -> String {
        match self.entry(ip) {
            Some(entry) => {
                format!("  at {} ({}:{})", entry.frame.function, entry.row, entry.column)
            }
            None => "  at <unknown>".to_string(),
        }
    }
}

struct ModuleInner {
    code: Vec<Instruction>,
    data: RefCell<Vec<Value>>,
    source_map: SourceMap,
    exports: Value,
    resolved: Cell<bool>,
    importing: RefCell<Option<ImportingFn>>,
}

/// A compiled module; cloning shares the same code, data, and exports
#[derive(Clone)]
pub struct Module {
    inner: Rc<ModuleInner>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").finish_non_exhaustive()
    }
}

impl Module {
    pub fn new(code: Vec<Instruction>, data: Vec<Value>, source_map: SourceMap) -> Self {
        Self {
            inner: Rc::new(ModuleInner {
                code,
                data: RefCell::new(data),
                source_map,
                exports: Value::table(),
                resolved: Cell::new(false),
                importing: RefCell::new(None),
            }),
        }
    }

    pub fn code(&self) -> &[Instruction] {
        &self.inner.code
    }

    pub fn source_map(&self) -> &SourceMap {
        &self.inner.source_map
    }

    pub fn exports(&self) -> &Value {
        &self.inner.exports
    }

    /// Read a data pool slot; unresolved imports read through to their
    /// resolution value
    pub fn global(&self, index: usize) -> Option<Value> {
        let data = self.inner.data.borrow();
        data.get(index).map(|value| match value {
            Value::Import(import) => import.resolved.borrow().clone(),
            other => other.clone(),
        })
    }

    pub fn data_len(&self) -> usize {
        self.inner.data.borrow().len()
    }

    /// Register the import-resolution hook consulted on the first run
    pub fn set_importing(&self, handler: impl Fn(&Module, &Import) + 'static) {
        *self.inner.importing.borrow_mut() = Some(Box::new(handler));
    }

    /// Resolve all imports in the data pool, replacing each placeholder
    /// in place so later loads are plain. Runs once.
    pub fn resolve_imports(&self) -> Result<(), AltoError> {
        if self.inner.resolved.get() {
            return Ok(());
        }

        let pending: Vec<(usize, Rc<Import>)> = self
            .inner
            .data
            .borrow()
            .iter()
            .enumerate()
            .filter_map(|(index, value)| match value {
                Value::Import(import) => Some((index, Rc::clone(import))),
                _ => None,
            })
            .collect();

        for (index, import) in pending {
            if import.resolved.borrow().is_null() {
                if let Some(handler) = self.inner.importing.borrow().as_ref() {
                    handler(self, &import);
                }
            }
            let resolved = import.resolved.borrow().clone();
            if resolved.is_null() {
                return Err(AltoError::new(
                    ErrorKind::ImportUnresolved,
                    format!("import '{}' was not resolved", import.name),
                    SourceLocation::unknown(),
                ));
            }
            self.inner.data.borrow_mut()[index] = resolved;
        }

        self.inner.resolved.set(true);
        Ok(())
    }

    /// Execute the module body with the exports table as receiver
    pub fn main(&self, args: &[Value]) -> Result<Value, AltoError> {
        self.resolve_imports()?;
        match vm::run_script(self, 0, None, self.inner.exports.clone(), args) {
            Ok(value) => Ok(value),
            Err(VmError::Exception(value)) => {
                let exc = crate::value::to_exception(value);
                let trace = exc.trace.borrow().clone();
                let mut error = AltoError::new(
                    ErrorKind::UnhandledException,
                    exc.message.clone(),
                    SourceLocation::unknown(),
                );
                if !trace.is_empty() {
                    error = error.with_trace(trace);
                }
                Err(error)
            }
            Err(VmError::Fault(error)) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, OpCode};

    fn entry(row: usize, frame: &Rc<FrameInfo>) -> Rc<MapEntry> {
        Rc::new(MapEntry { row, column: 1, frame: Rc::clone(frame) })
    }

    #[test]
    fn frame_lines_name_the_function_and_position() {
        let frame = Rc::new(FrameInfo::toplevel("worker"));
        let mut map = SourceMap::new();
        map.push(entry(3, &frame));
        assert_eq!(map.frame_line(0), "  at worker (3:1)");
        assert_eq!(map.frame_line(9), "  at <unknown>");
    }

    #[test]
    fn modules_without_imports_resolve_trivially() {
        let code = vec![
            Instruction::new(OpCode::Null, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ];
        let module = Module::new(code, Vec::new(), SourceMap::new());
        assert!(module.resolve_imports().is_ok());
        assert!(module.main(&[]).unwrap().is_null());
    }

    #[test]
    fn unresolved_imports_are_reported_by_path() {
        let data = vec![Value::Import(Rc::new(Import::new("deps/missing".to_string())))];
        let module = Module::new(Vec::new(), data, SourceMap::new());
        let err = module.main(&[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ImportUnresolved);
        assert!(err.message.contains("deps/missing"));
    }

    #[test]
    fn import_fixup_replaces_the_pool_slot() {
        let data = vec![Value::Import(Rc::new(Import::new("lib".to_string())))];
        let module = Module::new(Vec::new(), data, SourceMap::new());
        module.set_importing(|_, import| {
            *import.resolved.borrow_mut() = Value::Number(8.0);
        });
        module.resolve_imports().unwrap();
        assert!(module.global(0).unwrap().op_equal(&Value::Number(8.0)));
    }
}
