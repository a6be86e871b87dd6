// File: src/value.rs
//
// Runtime value types for the Alto language.
// Value is a small tagged union; aggregate variants hold reference-counted
// shared state, so cloning a Value duplicates the handle, not the contents.

use crate::prototypes;
use crate::vm::{self, Closure, VmError};
use ahash::RandomState;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Signature of host-native functions: receiver plus argument slice.
/// Errors are coerced into Exception values before handler dispatch, so a
/// failing native is indistinguishable from a `throw`.
pub type NativeFn = dyn Fn(Value, &[Value]) -> Result<Value, VmError>;

/// Runtime values in the Alto interpreter
#[derive(Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    /// IEEE 754 double; the only numeric type
    Number(f64),
    String(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Table(Rc<RefCell<Table>>),
    Function(Rc<Function>),
    /// Placeholder in a module's data pool until import fix-up runs
    Import(Rc<Import>),
    /// Getter/setter indirection; never escapes the member access API
    Property(Rc<Property>),
    Exception(Rc<Exception>),
}

/// Insertion-order preserving mapping from structural keys to values
pub struct Table {
    entries: IndexMap<TableKey, Value, RandomState>,
}

impl Table {
    pub fn new() -> Self {
        Self { entries: IndexMap::with_hasher(RandomState::new()) }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries.get(&TableKey(key.clone())).cloned()
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        self.entries.insert(TableKey(key), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (&k.0, v))
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

/// Table key wrapper giving Values structural equality and hashing
#[derive(Clone)]
pub struct TableKey(pub Value);

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.structural_eq(&other.0)
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.structural_hash(state);
    }
}

/// A callable value: either a host native or a compiled function
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
}

pub enum FunctionKind {
    Native(Box<NativeFn>),
    Script {
        module: crate::module::Module,
        entry: usize,
        closure: Option<Rc<Closure>>,
    },
}

impl Function {
    pub fn invoke(&self, receiver: Value, args: &[Value]) -> Result<Value, VmError> {
        match &self.kind {
            FunctionKind::Native(native) => native(receiver, args),
            FunctionKind::Script { module, entry, closure } => {
                vm::run_script(module, *entry, closure.clone(), receiver, args)
            }
        }
    }
}

/// An unresolved module import in the data pool
pub struct Import {
    pub name: String,
    pub resolved: RefCell<Value>,
}

impl Import {
    pub fn new(name: String) -> Self {
        Self { name, resolved: RefCell::new(Value::Null) }
    }
}

/// A getter/setter/plain-value indirection stored inside tables or
/// prototype entries
pub struct Property {
    pub getter: Option<Value>,
    pub setter: Option<Value>,
    pub value: Option<Value>,
}

impl Property {
    pub fn with_getter(getter: Value) -> Self {
        Self { getter: Some(getter), setter: None, value: None }
    }

    /// Read through the property: invoke the getter when present, else the
    /// plain value, else null
    pub fn read(&self, receiver: &Value) -> Result<Value, VmError> {
        if let Some(getter) = &self.getter {
            getter.call(receiver.clone(), &[])
        } else if let Some(value) = &self.value {
            Ok(value.clone())
        } else {
            Ok(Value::Null)
        }
    }

    /// Write through the property; without a setter the write is dropped
    pub fn write(&self, receiver: &Value, value: Value) -> Result<(), VmError> {
        if let Some(setter) = &self.setter {
            setter.call(receiver.clone(), &[value])?;
        }
        Ok(())
    }
}

/// A user-visible exception with an accumulated stack trace
pub struct Exception {
    pub message: String,
    /// The originally thrown payload when it was not already an exception
    pub value: Value,
    pub trace: RefCell<String>,
}

impl Exception {
    pub fn new(message: impl Into<String>, value: Value) -> Self {
        Self { message: message.into(), value, trace: RefCell::new(String::new()) }
    }

    pub fn push_frame(&self, line: &str) {
        let mut trace = self.trace.borrow_mut();
        if !trace.is_empty() {
            trace.push('\n');
        }
        trace.push_str(line);
    }
}

impl Value {
    pub fn string(text: impl Into<Rc<str>>) -> Self {
        Value::String(text.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn table() -> Self {
        Value::Table(Rc::new(RefCell::new(Table::new())))
    }

    pub fn native(name: impl Into<String>, f: impl Fn(Value, &[Value]) -> Result<Value, VmError> + 'static) -> Self {
        Value::Function(Rc::new(Function { name: name.into(), kind: FunctionKind::Native(Box::new(f)) }))
    }

    pub fn exception(message: impl Into<String>, value: Value) -> Self {
        Value::Exception(Rc::new(Exception::new(message, value)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Import(_) => "import",
            Value::Property(_) => "property",
            Value::Exception(_) => "exception",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Rc<RefCell<Vec<Value>>>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Rc<RefCell<Table>>> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<Function>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_exception(&self) -> Option<&Rc<Exception>> {
        match self {
            Value::Exception(e) => Some(e),
            _ => None,
        }
    }

    /// Truthiness: null, false, 0, and NaN are false; everything else is
    /// true
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n < 0.0 || 0.0 < *n,
            _ => true,
        }
    }

    /// Numeric coercion: numbers pass through, everything else is NaN
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            _ => f64::NAN,
        }
    }

    /// Equality in the `==` sense: NaN is unequal to itself, strings
    /// compare by content, aggregates by handle identity
    pub fn op_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Import(a), Value::Import(b)) => Rc::ptr_eq(a, b),
            (Value::Property(a), Value::Property(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural equality used for table keys; differs from `==` in that
    /// NaN equals itself and lists/tables compare by contents
    pub fn structural_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => {
                if a.is_nan() && b.is_nan() {
                    true
                } else {
                    a == b
                }
            }
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.structural_eq(y))
            }
            (Value::Table(a), Value::Table(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka.structural_eq(kb) && va.structural_eq(vb))
            }
            _ => self.op_equal(other),
        }
    }

    /// Hash consistent with structural_eq
    pub fn structural_hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Boolean(b) => {
                state.write_u8(1);
                state.write_u8(*b as u8);
            }
            Value::Number(n) => {
                state.write_u8(2);
                // Canonicalize NaN and fold -0.0 into 0.0 so equal numbers
                // hash alike
                let bits = if n.is_nan() {
                    f64::NAN.to_bits()
                } else if *n == 0.0 {
                    0u64
                } else {
                    n.to_bits()
                };
                state.write_u64(bits);
            }
            Value::String(s) => {
                state.write_u8(3);
                s.hash(state);
            }
            Value::List(l) => {
                state.write_u8(4);
                let items = l.borrow();
                state.write_usize(items.len());
                for item in items.iter() {
                    item.structural_hash(state);
                }
            }
            Value::Table(t) => {
                state.write_u8(5);
                let table = t.borrow();
                state.write_usize(table.len());
                for (k, v) in table.iter() {
                    k.structural_hash(state);
                    v.structural_hash(state);
                }
            }
            Value::Function(f) => {
                state.write_u8(6);
                state.write_usize(Rc::as_ptr(f) as usize);
            }
            Value::Import(i) => {
                state.write_u8(7);
                state.write_usize(Rc::as_ptr(i) as usize);
            }
            Value::Property(p) => {
                state.write_u8(8);
                state.write_usize(Rc::as_ptr(p) as usize);
            }
            Value::Exception(e) => {
                state.write_u8(9);
                state.write_usize(Rc::as_ptr(e) as usize);
            }
        }
    }

    /// Member read. Missing keys read as null so member chains never fail;
    /// only a throwing getter can produce an error here.
    pub fn get(&self, key: &Value) -> Result<Value, VmError> {
        match self {
            Value::Table(table) => {
                let found = table.borrow().get(key);
                match found {
                    Some(Value::Property(property)) => property.read(self),
                    Some(value) => Ok(value),
                    None => Ok(Value::Null),
                }
            }
            Value::List(list) => {
                if let Value::Number(n) = key {
                    if n.fract() == 0.0 && *n >= 0.0 {
                        let items = list.borrow();
                        return Ok(items.get(*n as usize).cloned().unwrap_or(Value::Null));
                    }
                    if n.fract() == 0.0 {
                        return Ok(Value::Null);
                    }
                }
                self.prototype_get(key)
            }
            Value::String(_)
            | Value::Number(_)
            | Value::Boolean(_)
            | Value::Function(_)
            | Value::Exception(_) => self.prototype_get(key),
            _ => Ok(Value::Null),
        }
    }

    fn prototype_get(&self, key: &Value) -> Result<Value, VmError> {
        match prototypes::lookup(self, key) {
            Some(Value::Property(property)) => property.read(self),
            Some(value) => Ok(value),
            None => Ok(Value::Null),
        }
    }

    /// Member write. Property setters are invoked; anything without a
    /// writable destination is a silent no-op.
    pub fn set(&self, key: Value, value: Value) -> Result<(), VmError> {
        match self {
            Value::Table(table) => {
                let existing = table.borrow().get(&key);
                if let Some(Value::Property(property)) = existing {
                    property.write(self, value)
                } else {
                    table.borrow_mut().insert(key, value);
                    Ok(())
                }
            }
            Value::List(list) => {
                if let Value::Number(n) = &key {
                    if n.fract() == 0.0 && *n >= 0.0 {
                        let mut items = list.borrow_mut();
                        let index = *n as usize;
                        if index < items.len() {
                            items[index] = value;
                        }
                        return Ok(());
                    }
                    if n.fract() == 0.0 {
                        return Ok(());
                    }
                }
                self.prototype_set(&key, value)
            }
            Value::String(_)
            | Value::Number(_)
            | Value::Boolean(_)
            | Value::Function(_)
            | Value::Exception(_) => self.prototype_set(&key, value),
            _ => Ok(()),
        }
    }

    fn prototype_set(&self, key: &Value, value: Value) -> Result<(), VmError> {
        if let Some(Value::Property(property)) = prototypes::lookup(self, key) {
            property.write(self, value)?;
        }
        Ok(())
    }

    /// Invoke this value: functions directly, otherwise through the
    /// value's `call` member
    pub fn call(&self, receiver: Value, args: &[Value]) -> Result<Value, VmError> {
        if let Value::Function(function) = self {
            return function.invoke(receiver, args);
        }
        let target = self.get(&Value::string("call"))?;
        if let Value::Function(function) = target {
            return function.invoke(self.clone(), args);
        }
        Err(VmError::Exception(Value::exception(
            format!("{} is not callable", self.type_name()),
            self.clone(),
        )))
    }

    /// Invoke with arguments taken from a list value
    pub fn apply(&self, receiver: Value, arg_list: Value) -> Result<Value, VmError> {
        let args = match &arg_list {
            Value::List(list) => list.borrow().clone(),
            _ => {
                return Err(VmError::Exception(Value::exception(
                    format!("apply arguments must be a list, not {}", arg_list.type_name()),
                    arg_list.clone(),
                )))
            }
        };
        self.call(receiver, &args)
    }

    /// Type-driven stringification, falling through to a `toString` member
    /// when a table provides one
    pub fn to_display_string(&self) -> String {
        if let Value::Table(table) = self {
            let override_fn = table.borrow().get(&Value::string("toString"));
            if let Some(Value::Function(function)) = override_fn {
                if let Ok(result) = function.invoke(self.clone(), &[]) {
                    if let Value::String(s) = &result {
                        return s.to_string();
                    }
                    return display(&result, 0);
                }
            }
        }
        display(self, 0)
    }
}

/// Render a number the way the language prints it: integral values without
/// a fraction, NaN and infinities by name
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

const MAX_DISPLAY_DEPTH: usize = 4;

fn display(value: &Value, depth: usize) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => s.to_string(),
        Value::List(list) => {
            if depth >= MAX_DISPLAY_DEPTH {
                return "[\u{2026}]".to_string();
            }
            let items = list.borrow();
            let rendered: Vec<String> = items.iter().map(|v| display(v, depth + 1)).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Table(table) => {
            if depth >= MAX_DISPLAY_DEPTH {
                return "{\u{2026}}".to_string();
            }
            let table = table.borrow();
            let rendered: Vec<String> = table
                .iter()
                .map(|(k, v)| format!("{}: {}", display(k, depth + 1), display(v, depth + 1)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
        Value::Function(f) => format!("[function {}]", f.name),
        Value::Import(i) => format!("[import {}]", i.name),
        Value::Property(_) => "[property]".to_string(),
        Value::Exception(e) => e.message.clone(),
    }
}

/// Coerce any thrown value into an exception; non-exception payloads keep
/// the original value reachable through `.value`
pub fn to_exception(value: Value) -> Rc<Exception> {
    match value {
        Value::Exception(e) => e,
        other => Rc::new(Exception::new(other.to_display_string(), other)),
    }
}

// Shallow debug formatting; aggregates print their size, not their contents
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::List(l) => write!(f, "List[{}]", l.borrow().len()),
            Value::Table(t) => write!(f, "Table{{{}}}", t.borrow().len()),
            Value::Function(func) => write!(f, "Function({})", func.name),
            Value::Import(i) => write!(f, "Import({})", i.name),
            Value::Property(_) => write!(f, "Property"),
            Value::Exception(e) => write!(f, "Exception({})", e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHasher;

    fn hash_of(value: &Value) -> u64 {
        let mut hasher = AHasher::default();
        value.structural_hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn nan_is_unequal_under_op_equal_but_structurally_equal() {
        let nan = Value::Number(f64::NAN);
        assert!(!nan.op_equal(&nan));
        assert!(nan.structural_eq(&nan));
    }

    #[test]
    fn structural_equality_implies_equal_hashes() {
        let pairs = [
            (Value::Number(0.0), Value::Number(-0.0)),
            (Value::Number(f64::NAN), Value::Number(f64::NAN)),
            (Value::string("abc"), Value::string("abc")),
            (
                Value::list(vec![Value::Number(1.0), Value::string("x")]),
                Value::list(vec![Value::Number(1.0), Value::string("x")]),
            ),
        ];
        for (a, b) in pairs {
            assert!(a.structural_eq(&b), "{:?} should equal {:?}", a, b);
            assert_eq!(hash_of(&a), hash_of(&b), "hash mismatch for {:?}", a);
        }
    }

    #[test]
    fn truthiness_rules() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Boolean(false).truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(Value::Number(-1.0).truthy());
        assert!(Value::string("").truthy());
        assert!(Value::list(vec![]).truthy());
    }

    #[test]
    fn cross_variant_equality_is_false() {
        let values = [
            Value::Null,
            Value::Boolean(false),
            Value::Number(0.0),
            Value::string(""),
            Value::list(vec![]),
            Value::table(),
        ];
        for (i, a) in values.iter().enumerate() {
            for (j, b) in values.iter().enumerate() {
                if i != j {
                    assert!(!a.op_equal(b), "{:?} == {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn lists_compare_by_identity_under_op_equal() {
        let a = Value::list(vec![Value::Number(1.0)]);
        let b = Value::list(vec![Value::Number(1.0)]);
        assert!(!a.op_equal(&b));
        assert!(a.op_equal(&a.clone()));
        assert!(a.structural_eq(&b));
    }

    #[test]
    fn null_is_a_valid_table_key() {
        let table = Value::table();
        table.set(Value::Null, Value::Number(7.0)).unwrap();
        let got = table.get(&Value::Null).unwrap();
        assert!(got.op_equal(&Value::Number(7.0)));
    }

    #[test]
    fn missing_members_read_as_null() {
        let table = Value::table();
        assert!(table.get(&Value::string("missing")).unwrap().is_null());
        assert!(Value::Null.get(&Value::Null).unwrap().is_null());

        let list = Value::list(vec![Value::Number(1.0)]);
        assert!(list.get(&Value::Number(5.0)).unwrap().is_null());
    }

    #[test]
    fn out_of_range_list_writes_are_dropped() {
        let list = Value::list(vec![Value::Number(1.0)]);
        list.set(Value::Number(9.0), Value::Number(2.0)).unwrap();
        assert_eq!(list.as_list().unwrap().borrow().len(), 1);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(3.5), "3.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::INFINITY), "Infinity");
    }

    #[test]
    fn table_with_call_member_is_callable() {
        let table = Value::table();
        table
            .set(
                Value::string("call"),
                Value::native("call", |recv, _| {
                    // The callable table becomes the receiver
                    assert!(matches!(recv, Value::Table(_)));
                    Ok(Value::Number(42.0))
                }),
            )
            .unwrap();
        let result = table.call(Value::Null, &[]).unwrap();
        assert!(result.op_equal(&Value::Number(42.0)));
    }

    #[test]
    fn non_callable_values_raise() {
        let err = Value::Number(3.0).call(Value::Null, &[]);
        assert!(matches!(err, Err(VmError::Exception(_))));
    }

    #[test]
    fn apply_requires_a_list() {
        let f = Value::native("id", |_, args| Ok(args.first().cloned().unwrap_or(Value::Null)));
        let ok = f.apply(Value::Null, Value::list(vec![Value::Number(5.0)])).unwrap();
        assert!(ok.op_equal(&Value::Number(5.0)));
        assert!(matches!(f.apply(Value::Null, Value::Number(1.0)), Err(VmError::Exception(_))));
    }

    #[test]
    fn thrown_non_exception_values_are_wrapped() {
        let exc = to_exception(Value::Number(1.0));
        assert_eq!(exc.message, "1");
        assert!(exc.value.op_equal(&Value::Number(1.0)));
    }

    #[test]
    fn table_tostring_override_routes_display() {
        let table = Value::table();
        table
            .set(Value::string("toString"), Value::native("toString", |_, _| Ok(Value::string("custom"))))
            .unwrap();
        assert_eq!(table.to_display_string(), "custom");
    }
}
