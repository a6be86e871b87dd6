// File: src/vm.rs
//
// Stack interpreter for Alto bytecode.
// One Interpreter executes one function activation; calls construct a
// nested Interpreter on the host stack and run it to completion.

use crate::bytecode::OpCode;
use crate::errors::AltoError;
use crate::module::Module;
use crate::value::{self, Function, FunctionKind, Table, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// A frame of captured variables; frames chain toward the enclosing
/// function scope and are shared by every function created inside it
pub struct Closure {
    pub parent: Option<Rc<Closure>>,
    pub values: RefCell<Vec<Value>>,
}

/// How a run can fail: a user-level exception searching for a handler, or
/// an internal fault that aborts the run outright
#[derive(Debug)]
pub enum VmError {
    Exception(Value),
    Fault(AltoError),
}

impl VmError {
    pub fn fault(message: impl Into<String>) -> Self {
        VmError::Fault(AltoError::fault(message.into()))
    }
}

/// Exception handler registered by EnterTry; enough state to rewind the
/// interpreter to the try entry
struct Handler {
    ip: usize,
    stack_len: usize,
    closure: Option<Rc<Closure>>,
}

/// Run a compiled function body to completion
pub fn run_script(
    module: &Module,
    entry: usize,
    closure: Option<Rc<Closure>>,
    receiver: Value,
    args: &[Value],
) -> Result<Value, VmError> {
    Interpreter::new(module.clone(), receiver, args.to_vec(), entry, closure).run()
}

/// A single function activation: operand stack, closure chain, handler
/// chain, and instruction pointer over the module's code
pub struct Interpreter {
    module: Module,
    receiver: Value,
    arguments: Vec<Value>,
    stack: Vec<Value>,
    closure: Option<Rc<Closure>>,
    handlers: Vec<Handler>,
    ip: usize,
}

impl Interpreter {
    pub fn new(
        module: Module,
        receiver: Value,
        arguments: Vec<Value>,
        entry: usize,
        closure: Option<Rc<Closure>>,
    ) -> Self {
        Self {
            module,
            receiver,
            arguments,
            stack: Vec::new(),
            closure,
            handlers: Vec::new(),
            ip: entry,
        }
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| VmError::fault("operand stack underflow"))
    }

    fn pop_many(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < count {
            return Err(VmError::fault("operand stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    /// Dispatch an exception: coerce, record the frame, and unwind to the
    /// innermost handler or out of this activation
    fn raise(&mut self, thrown: Value) -> Result<(), VmError> {
        let exc = value::to_exception(thrown);
        exc.push_frame(&self.module.source_map().frame_line(self.ip.saturating_sub(1)));

        match self.handlers.pop() {
            Some(handler) => {
                self.stack.truncate(handler.stack_len);
                self.closure = handler.closure;
                self.stack.push(Value::Exception(exc));
                self.ip = handler.ip;
                Ok(())
            }
            None => Err(VmError::Exception(Value::Exception(exc))),
        }
    }

    /// Route a result that may carry an exception through the handler
    /// chain as if it had been thrown at the current instruction
    fn absorb(&mut self, result: Result<Value, VmError>) -> Result<Option<Value>, VmError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(VmError::Exception(thrown)) => {
                self.raise(thrown)?;
                Ok(None)
            }
            Err(fault) => Err(fault),
        }
    }

    fn closure_frame(&self, depth: u8) -> Result<Rc<Closure>, VmError> {
        let mut frame =
            self.closure.clone().ok_or_else(|| VmError::fault("no closure frame in scope"))?;
        for _ in 1..depth {
            let parent = frame
                .parent
                .clone()
                .ok_or_else(|| VmError::fault("closure chain shorter than access depth"))?;
            frame = parent;
        }
        Ok(frame)
    }

    pub fn run(&mut self) -> Result<Value, VmError> {
        loop {
            let Some(&instr) = self.module.code().get(self.ip) else {
                // Falling off the end of the code returns null
                return Ok(Value::Null);
            };
            self.ip += 1;

            let opcode = match instr.opcode() {
                Ok(op) => op,
                Err(raw) => {
                    return Err(VmError::fault(format!("undefined opcode {}", raw)));
                }
            };

            match opcode {
                OpCode::Null => self.stack.push(Value::Null),
                OpCode::Boolean => self.stack.push(Value::Boolean(instr.value() != 0)),
                OpCode::Number => self.stack.push(Value::Number(instr.value() as f64)),

                OpCode::Swap => {
                    let len = self.stack.len();
                    if len < 2 {
                        return Err(VmError::fault("operand stack underflow"));
                    }
                    self.stack.swap(len - 1, len - 2);
                }
                OpCode::Copy => {
                    let count = instr.value() as usize;
                    if count > self.stack.len() {
                        return Err(VmError::fault("operand stack underflow"));
                    }
                    let start = self.stack.len() - count;
                    self.stack.extend_from_within(start..);
                }
                OpCode::Drop => {
                    let count = instr.value() as usize;
                    if count > self.stack.len() {
                        return Err(VmError::fault("operand stack underflow"));
                    }
                    self.stack.truncate(self.stack.len() - count);
                }

                OpCode::List => {
                    let items = self.pop_many(instr.value() as usize)?;
                    self.stack.push(Value::list(items));
                }
                OpCode::Table => {
                    let pairs = self.pop_many(2 * instr.value() as usize)?;
                    let mut table = Table::new();
                    for pair in pairs.chunks_exact(2) {
                        table.insert(pair[0].clone(), pair[1].clone());
                    }
                    self.stack.push(Value::Table(Rc::new(RefCell::new(table))));
                }

                OpCode::EnterClosure => {
                    let values = self.pop_many(instr.value() as usize)?;
                    self.closure = Some(Rc::new(Closure {
                        parent: self.closure.take(),
                        values: RefCell::new(values),
                    }));
                }
                OpCode::LeaveClosure => {
                    let current = self
                        .closure
                        .take()
                        .ok_or_else(|| VmError::fault("no closure frame to leave"))?;
                    self.closure = current.parent.clone();
                }

                OpCode::Function => {
                    let entry = instr.value() as usize;
                    let captured = if instr.param() == 1 { self.closure.clone() } else { None };
                    let name = self.module.source_map().function_name(entry);
                    self.stack.push(Value::Function(Rc::new(Function {
                        name,
                        kind: FunctionKind::Script {
                            module: self.module.clone(),
                            entry,
                            closure: captured,
                        },
                    })));
                }

                OpCode::LoadArgument => {
                    let index = instr.value() as usize;
                    self.stack.push(self.arguments.get(index).cloned().unwrap_or(Value::Null));
                }
                OpCode::LoadArgumentList => {
                    let index = (instr.value() as usize).min(self.arguments.len());
                    self.stack.push(Value::list(self.arguments[index..].to_vec()));
                }
                OpCode::LoadReceiver => {
                    self.stack.push(self.receiver.clone());
                }
                OpCode::LoadGlobal => {
                    let index = instr.value() as usize;
                    let value = self
                        .module
                        .global(index)
                        .ok_or_else(|| VmError::fault("data pool index out of range"))?;
                    self.stack.push(value);
                }

                OpCode::LoadVariable => {
                    let index = instr.value() as usize;
                    let value = if instr.param() == 0 {
                        self.stack
                            .get(index)
                            .cloned()
                            .ok_or_else(|| VmError::fault("local slot out of range"))?
                    } else {
                        let frame = self.closure_frame(instr.param())?;
                        let values = frame.values.borrow();
                        values
                            .get(index)
                            .cloned()
                            .ok_or_else(|| VmError::fault("closure slot out of range"))?
                    };
                    self.stack.push(value);
                }
                OpCode::StoreVariable => {
                    let index = instr.value() as usize;
                    let value = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or_else(|| VmError::fault("operand stack underflow"))?;
                    if instr.param() == 0 {
                        if index >= self.stack.len() {
                            return Err(VmError::fault("local slot out of range"));
                        }
                        self.stack[index] = value;
                    } else {
                        let frame = self.closure_frame(instr.param())?;
                        let mut values = frame.values.borrow_mut();
                        if index >= values.len() {
                            return Err(VmError::fault("closure slot out of range"));
                        }
                        values[index] = value;
                    }
                }

                OpCode::LoadElement => {
                    let key = self.pop()?;
                    let container = self.pop()?;
                    if let Some(value) = self.absorb(container.get(&key))? {
                        self.stack.push(value);
                    }
                }
                OpCode::StoreElement => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let container = self.pop()?;
                    let result = container.set(key, value.clone()).map(|_| value);
                    if let Some(value) = self.absorb(result)? {
                        self.stack.push(value);
                    }
                }

                OpCode::Negate => {
                    let a = self.pop()?;
                    self.stack.push(Value::Number(-a.to_number()));
                }
                OpCode::Add | OpCode::Subtract | OpCode::Multiply | OpCode::Divide
                | OpCode::Remainder => {
                    let b = self.pop()?.to_number();
                    let a = self.pop()?.to_number();
                    let result = match opcode {
                        OpCode::Add => a + b,
                        OpCode::Subtract => a - b,
                        OpCode::Multiply => a * b,
                        OpCode::Divide => a / b,
                        _ => a % b,
                    };
                    self.stack.push(Value::Number(result));
                }

                OpCode::Not => {
                    let a = self.pop()?;
                    self.stack.push(Value::Boolean(!a.truthy()));
                }
                OpCode::And | OpCode::Or | OpCode::Xor => {
                    let b = self.pop()?.truthy();
                    let a = self.pop()?.truthy();
                    let result = match opcode {
                        OpCode::And => a && b,
                        OpCode::Or => a || b,
                        _ => a != b,
                    };
                    self.stack.push(Value::Boolean(result));
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Boolean(a.op_equal(&b)));
                }
                OpCode::Less | OpCode::LessOrEqual | OpCode::Greater | OpCode::GreaterOrEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    // Ordering is defined for numbers only
                    let result = match (a.as_number(), b.as_number()) {
                        (Some(x), Some(y)) => match opcode {
                            OpCode::Less => x < y,
                            OpCode::LessOrEqual => x <= y,
                            OpCode::Greater => x > y,
                            _ => x >= y,
                        },
                        _ => false,
                    };
                    self.stack.push(Value::Boolean(result));
                }

                OpCode::Jump => {
                    self.ip = instr.value() as usize;
                }
                OpCode::ConditionalJump => {
                    let condition = self.pop()?;
                    if condition.truthy() == (instr.param() != 0) {
                        self.ip = instr.value() as usize;
                    }
                }
                OpCode::ConditionalAnd => {
                    let condition = self
                        .stack
                        .last()
                        .ok_or_else(|| VmError::fault("operand stack underflow"))?;
                    if !condition.truthy() {
                        self.ip = instr.value() as usize;
                    } else {
                        self.stack.pop();
                    }
                }
                OpCode::ConditionalOr => {
                    let condition = self
                        .stack
                        .last()
                        .ok_or_else(|| VmError::fault("operand stack underflow"))?;
                    if condition.truthy() {
                        self.ip = instr.value() as usize;
                    } else {
                        self.stack.pop();
                    }
                }

                OpCode::Throw => {
                    let thrown = self.pop()?;
                    self.raise(thrown)?;
                }
                OpCode::EnterTry => {
                    self.handlers.push(Handler {
                        ip: instr.value() as usize,
                        stack_len: self.stack.len(),
                        closure: self.closure.clone(),
                    });
                }
                OpCode::LeaveTry => {
                    self.handlers
                        .pop()
                        .ok_or_else(|| VmError::fault("no handler to leave"))?;
                    self.ip = instr.value() as usize;
                }
                OpCode::EnterFinally => {
                    self.stack.push(Value::Number(self.ip as f64));
                    self.ip = instr.value() as usize;
                }
                OpCode::LeaveFinally => {
                    let resume = self.pop()?;
                    match resume.as_number() {
                        Some(ip) if ip >= 0.0 && ip.fract() == 0.0 => self.ip = ip as usize,
                        _ => return Err(VmError::fault("finally resume address missing")),
                    }
                }

                OpCode::Call => {
                    let argc = instr.value() as usize;
                    let args = self.pop_many(argc)?;
                    let receiver = self.pop()?;
                    let callee = self.pop()?;
                    if let Some(result) = self.absorb(callee.call(receiver, &args))? {
                        self.stack.push(result);
                    }
                }
                OpCode::Apply => {
                    let arg_list = self.pop()?;
                    let receiver = self.pop()?;
                    let callee = self.pop()?;
                    if let Some(result) = self.absorb(callee.apply(receiver, arg_list))? {
                        self.stack.push(result);
                    }
                }

                OpCode::Return => {
                    return self.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    /// Helper to compile Alto code and run it through the VM
    fn run_vm_code(code: &str) -> Result<Value, VmError> {
        let module = compile(code).unwrap_or_else(|e| panic!("compile error:\n{}", e));
        run_script(&module, 0, None, module.exports().clone(), &[])
    }

    fn number_of(result: Result<Value, VmError>) -> f64 {
        match result {
            Ok(Value::Number(n)) => n,
            Ok(other) => panic!("expected a number, got {:?}", other),
            Err(VmError::Exception(e)) => panic!("unexpected exception: {:?}", e),
            Err(VmError::Fault(e)) => panic!("unexpected fault: {}", e),
        }
    }

    #[test]
    fn simple_return() {
        assert_eq!(number_of(run_vm_code("return 40 + 2")), 42.0);
    }

    #[test]
    fn locals_survive_expression_evaluation() {
        let code = r#"
            var a = 1
            var b = 2
            var c = a + b * 10
            return c - a
        "#;
        assert_eq!(number_of(run_vm_code(code)), 20.0);
    }

    #[test]
    fn closure_counters_keep_state() {
        let code = r#"
            var count = 0
            var inc = function() { count += 1; return count }
            inc()
            inc()
            return inc()
        "#;
        assert_eq!(number_of(run_vm_code(code)), 3.0);
    }

    #[test]
    fn handlers_restore_the_operand_stack() {
        let code = r#"
            var a = 5
            try { throw 'x' } catch { }
            return a
        "#;
        assert_eq!(number_of(run_vm_code(code)), 5.0);
    }

    #[test]
    fn thrown_aggregates_keep_their_identity() {
        let code = r#"
            var r = null
            try { throw {code: 7} } catch (e) { r = e.value.code }
            return r
        "#;
        assert_eq!(number_of(run_vm_code(code)), 7.0);
    }

    #[test]
    fn escaping_exceptions_carry_traces() {
        let result = run_vm_code("var f = function() { throw 'out' }\nf()");
        match result {
            Err(VmError::Exception(value)) => {
                let exc = value.as_exception().expect("coerced to an exception");
                assert_eq!(exc.message, "out");
                assert!(exc.trace.borrow().contains("at f"));
            }
            other => panic!("expected an escaping exception, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn reentrancy_through_natives() {
        // A native that calls back into an interpreted function
        let module = compile("var double = function(x) { return x * 2 }\nreturn double").unwrap();
        let doubler = run_script(&module, 0, None, Value::Null, &[]).ok().unwrap();
        let via_native = Value::native("trampoline", move |_, args| {
            doubler.call(Value::Null, args)
        });
        let result = via_native.call(Value::Null, &[Value::Number(21.0)]).ok().unwrap();
        assert!(result.op_equal(&Value::Number(42.0)));
    }

    #[test]
    fn deep_recursion_is_plain_nesting() {
        // Run on a thread with a larger stack: 200 nested unoptimized
        // Interpreter activations exceed the default test-thread stack size.
        std::thread::Builder::new()
            .stack_size(16 * 1024 * 1024)
            .spawn(|| {
                let code = r#"
                    var down = function(n) {
                        if (n <= 0) { return 0 }
                        return down(n - 1) + 1
                    }
                    return down(200)
                "#;
                assert_eq!(number_of(run_vm_code(code)), 200.0);
            })
            .unwrap()
            .join()
            .unwrap();
    }
}
