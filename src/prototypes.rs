// File: src/prototypes.rs
//
// Per-kind prototype tables for member access on non-table values.
// These back expressions like `s.length` and `e.message`; tables resolve
// members against their own entries instead.

use crate::value::{Property, Value};
use crate::vm::VmError;
use ahash::RandomState;
use once_cell::unsync::Lazy;
use std::collections::HashMap;
use std::rc::Rc;

type ProtoMap = HashMap<&'static str, Value, RandomState>;

thread_local! {
    static STRING_PROTO: Lazy<ProtoMap> = Lazy::new(string_proto);
    static NUMBER_PROTO: Lazy<ProtoMap> = Lazy::new(number_proto);
    static BOOLEAN_PROTO: Lazy<ProtoMap> = Lazy::new(boolean_proto);
    static LIST_PROTO: Lazy<ProtoMap> = Lazy::new(list_proto);
    static FUNCTION_PROTO: Lazy<ProtoMap> = Lazy::new(function_proto);
    static EXCEPTION_PROTO: Lazy<ProtoMap> = Lazy::new(exception_proto);
}

/// Find the prototype entry for a member name on a non-table value.
/// Non-string keys and kinds without a prototype resolve to nothing.
pub fn lookup(value: &Value, key: &Value) -> Option<Value> {
    let name = key.as_str()?.to_string();
    match value {
        Value::String(_) => STRING_PROTO.with(|m| m.get(name.as_str()).cloned()),
        Value::Number(_) => NUMBER_PROTO.with(|m| m.get(name.as_str()).cloned()),
        Value::Boolean(_) => BOOLEAN_PROTO.with(|m| m.get(name.as_str()).cloned()),
        Value::List(_) => LIST_PROTO.with(|m| m.get(name.as_str()).cloned()),
        Value::Function(_) => FUNCTION_PROTO.with(|m| m.get(name.as_str()).cloned()),
        Value::Exception(_) => EXCEPTION_PROTO.with(|m| m.get(name.as_str()).cloned()),
        _ => None,
    }
}

fn getter(name: &'static str, f: impl Fn(Value, &[Value]) -> Result<Value, VmError> + 'static) -> Value {
    Value::Property(Rc::new(Property::with_getter(Value::native(name, f))))
}

fn proto_map() -> ProtoMap {
    HashMap::with_hasher(RandomState::new())
}

fn string_proto() -> ProtoMap {
    let mut map = proto_map();
    map.insert(
        "length",
        getter("length", |recv, _| {
            let count = recv.as_str().map(|s| s.chars().count()).unwrap_or(0);
            Ok(Value::Number(count as f64))
        }),
    );
    map.insert("toString", Value::native("toString", |recv, _| Ok(recv)));
    map
}

fn number_proto() -> ProtoMap {
    let mut map = proto_map();
    map.insert(
        "toString",
        Value::native("toString", |recv, _| {
            Ok(Value::string(crate::value::format_number(recv.to_number())))
        }),
    );
    map
}

fn boolean_proto() -> ProtoMap {
    let mut map = proto_map();
    map.insert(
        "toString",
        Value::native("toString", |recv, _| Ok(Value::string(recv.to_display_string()))),
    );
    map
}

fn list_proto() -> ProtoMap {
    let mut map = proto_map();
    map.insert(
        "length",
        getter("length", |recv, _| {
            let count = recv.as_list().map(|l| l.borrow().len()).unwrap_or(0);
            Ok(Value::Number(count as f64))
        }),
    );
    map.insert(
        "toString",
        Value::native("toString", |recv, _| Ok(Value::string(recv.to_display_string()))),
    );
    map
}

fn function_proto() -> ProtoMap {
    let mut map = proto_map();
    map.insert(
        "call",
        Value::native("call", |recv, args| {
            let receiver = args.first().cloned().unwrap_or(Value::Null);
            let rest = if args.is_empty() { &[] } else { &args[1..] };
            recv.call(receiver, rest)
        }),
    );
    map.insert(
        "apply",
        Value::native("apply", |recv, args| {
            let receiver = args.first().cloned().unwrap_or(Value::Null);
            let arg_list = args.get(1).cloned().unwrap_or_else(|| Value::list(Vec::new()));
            recv.apply(receiver, arg_list)
        }),
    );
    map.insert(
        "toString",
        Value::native("toString", |recv, _| Ok(Value::string(recv.to_display_string()))),
    );
    map
}

fn exception_proto() -> ProtoMap {
    let mut map = proto_map();
    map.insert(
        "message",
        getter("message", |recv, _| {
            let message =
                recv.as_exception().map(|e| e.message.clone()).unwrap_or_default();
            Ok(Value::string(message))
        }),
    );
    map.insert(
        "value",
        getter("value", |recv, _| {
            Ok(recv.as_exception().map(|e| e.value.clone()).unwrap_or(Value::Null))
        }),
    );
    map.insert(
        "stack",
        getter("stack", |recv, _| {
            let trace =
                recv.as_exception().map(|e| e.trace.borrow().clone()).unwrap_or_default();
            Ok(Value::string(trace))
        }),
    );
    map.insert(
        "toString",
        Value::native("toString", |recv, _| {
            let message =
                recv.as_exception().map(|e| e.message.clone()).unwrap_or_default();
            Ok(Value::string(message))
        }),
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_length_counts_codepoints() {
        let s = Value::string("héllo");
        let len = s.get(&Value::string("length")).unwrap();
        assert!(len.op_equal(&Value::Number(5.0)));
    }

    #[test]
    fn exception_members_expose_payload() {
        let exc = Value::exception("boom", Value::Number(3.0));
        assert!(exc.get(&Value::string("value")).unwrap().op_equal(&Value::Number(3.0)));
        assert_eq!(exc.get(&Value::string("message")).unwrap().as_str().unwrap(), "boom");
    }

    #[test]
    fn function_call_member_forwards_receiver_and_args() {
        let f = Value::native("probe", |recv, args| {
            assert!(recv.op_equal(&Value::Number(1.0)));
            Ok(args[0].clone())
        });
        let call = f.get(&Value::string("call")).unwrap();
        let result = call
            .as_function()
            .unwrap()
            .invoke(f.clone(), &[Value::Number(1.0), Value::string("x")])
            .unwrap();
        assert_eq!(result.as_str().unwrap(), "x");
    }

    #[test]
    fn prototype_writes_without_setters_are_dropped() {
        let s = Value::string("abc");
        s.set(Value::string("length"), Value::Number(0.0)).unwrap();
        let len = s.get(&Value::string("length")).unwrap();
        assert!(len.op_equal(&Value::Number(3.0)));
    }
}
