// Integration tests driving the VM through assembled bytecode.
//
// The assembler exercises the instruction set below the compiler: stack
// shuffling, closures, exception handlers, and the finally protocol.

use alto::assembler::assemble;
use alto::errors::ErrorKind;
use alto::value::Value;

fn run(source: &str) -> Value {
    let module = assemble(source).unwrap_or_else(|e| panic!("assembly error:\n{}", e));
    module.main(&[]).unwrap_or_else(|e| panic!("runtime error:\n{}", e))
}

fn run_with(source: &str, args: &[Value]) -> Value {
    let module = assemble(source).unwrap_or_else(|e| panic!("assembly error:\n{}", e));
    module.main(args).unwrap_or_else(|e| panic!("runtime error:\n{}", e))
}

#[test]
fn stack_shuffling() {
    let result = run(
        "
        number 1
        number 2
        swap            ; 2 1
        subtract        ; 1
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(1.0)));

    let result = run(
        "
        number 7
        copy 1
        multiply
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(49.0)));

    let result = run(
        "
        number 1
        number 2
        number 3
        drop 2
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(1.0)));
}

#[test]
fn aggregate_construction() {
    let result = run(
        "
        number 4
        number 5
        list 2
        return
        ",
    );
    let list = result.as_list().expect("a list");
    assert_eq!(list.borrow().len(), 2);

    let result = run(
        "
        global key 'answer'
        loadglobal key
        number 42
        table 1
        loadglobal key
        loadelement
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(42.0)));
}

#[test]
fn closure_frames_store_and_load() {
    let result = run(
        "
        null
        enterclosure 1
        number 9
        storevariable 1 0
        drop 1
        loadvariable 1 0
        leaveclosure
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(9.0)));
}

#[test]
fn arguments_read_as_null_past_the_end() {
    let result = run_with(
        "
        loadargument 0
        loadargument 5
        list 2
        return
        ",
        &[Value::Number(3.0)],
    );
    let list = result.as_list().unwrap();
    assert!(list.borrow()[0].op_equal(&Value::Number(3.0)));
    assert!(list.borrow()[1].is_null());
}

#[test]
fn argument_slices_materialize_lists() {
    let result = run_with(
        "
        loadargumentlist 1
        return
        ",
        &[Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
    );
    assert_eq!(result.as_list().unwrap().borrow().len(), 2);
}

#[test]
fn thrown_values_reach_the_handler() {
    let result = run(
        "
        entertry handler
        number 3
        throw
        number 1        ; skipped
        return
        handler:
        drop 1          ; discard the exception
        number 2
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(2.0)));
}

#[test]
fn leavetry_pops_the_handler() {
    let module = assemble(
        "
        entertry handler
        leavetry done
        handler:
        drop 1
        number 1
        return
        done:
        number 9
        throw           ; no handler anymore
        ",
    )
    .unwrap();
    let err = module.main(&[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnhandledException);
    assert_eq!(err.message, "9");
}

#[test]
fn unhandled_throws_surface_as_errors() {
    let module = assemble(
        "
        global message 'broken'
        loadglobal message
        throw
        ",
    )
    .unwrap();
    let err = module.main(&[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnhandledException);
    assert_eq!(err.message, "broken");
}

#[test]
fn finally_protocol_round_trips() {
    let result = run(
        "
        enterfinally fin
        number 1
        return
        fin:
        leavefinally
        ",
    );
    assert!(result.op_equal(&Value::Number(1.0)));
}

#[test]
fn a_returning_finally_wins() {
    let result = run(
        "
        enterfinally fin
        number 1
        return
        fin:
        number 42
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(42.0)));
}

#[test]
fn functions_capture_and_run() {
    let result = run(
        "
        function entry
        null
        number 20
        number 22
        call 2
        return
        entry:
        loadargument 0
        loadargument 1
        add
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(42.0)));
}

#[test]
fn conditional_jumps_consume_their_condition() {
    let result = run(
        "
        boolean true
        conditionaljump 1 yes
        number 1
        return
        yes:
        number 2
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(2.0)));
}

#[test]
fn conditional_and_keeps_falsy_values() {
    let result = run(
        "
        number 0
        conditionaland done
        boolean true    ; skipped
        done:
        return
        ",
    );
    assert!(result.op_equal(&Value::Number(0.0)));
}

#[test]
fn comparisons_on_non_numbers_are_false() {
    let result = run(
        "
        global a 'x'
        loadglobal a
        number 1
        less
        return
        ",
    );
    assert!(result.op_equal(&Value::Boolean(false)));
}

#[test]
fn imports_resolve_through_the_pool() {
    let module = assemble(
        "
        import lib 'lib'
        loadglobal lib
        return
        ",
    )
    .unwrap();
    module.set_importing(|_, import| {
        *import.resolved.borrow_mut() = Value::Number(5.0);
    });
    let result = module.main(&[]).unwrap();
    assert!(result.op_equal(&Value::Number(5.0)));
}

#[test]
fn malformed_words_fault_instead_of_throwing() {
    // Stack underflow is an internal fault, not a catchable exception
    let module = assemble(
        "
        entertry handler
        add
        handler:
        number 1
        return
        ",
    )
    .unwrap();
    let err = module.main(&[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeFault);
}
