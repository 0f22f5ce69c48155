//! The five error kinds end-to-end (spec §7): lexical, grammar, safety
//! gate, evaluation, and digest scheduler faults.

use reactive_core::error::{DigestError, EngineError, EvalError, SafetyError};
use reactive_core::scope::Scope;
use reactive_core::value::{Mapping, NativeFn, Value};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn lex_error_surfaces_through_engine_error() {
    let root = Scope::new_root();
    let err = root.eval("@", None).unwrap_err();
    assert!(matches!(err, EngineError::Parse(_)));
}

#[test]
fn parse_error_surfaces_through_engine_error() {
    let root = Scope::new_root();
    let err = root.eval("1 =", None).unwrap_err();
    assert!(matches!(err, EngineError::Parse(_)));
}

#[test]
fn safety_gate_rejects_constructor_access() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("a", Value::object(Mapping::new()));
    let err = root.eval("a.constructor", None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Eval(EvalError::Safety(SafetyError::DisallowedField { .. }))
    ));
}

#[test]
fn safety_gate_rejects_proto_access() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("a", Value::object(Mapping::new()));
    let err = root.eval("a.__proto__", None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Eval(EvalError::Safety(SafetyError::DisallowedField { .. }))
    ));
}

struct Noop;
impl NativeFn for Noop {
    fn call(&self, _this: Option<Value>, _args: &[Value]) -> Result<Value, EvalError> {
        Ok(Value::Undefined)
    }
}

#[test]
fn safety_gate_rejects_call_bind_apply_on_a_callable() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("f", Value::Callable(Rc::new(Noop)));
    for builtin in ["call", "bind", "apply"] {
        let err = root.eval(&format!("f.{builtin}"), None).unwrap_err();
        assert!(
            matches!(err, EngineError::Eval(EvalError::Safety(SafetyError::DisallowedBuiltin { .. }))),
            "expected DisallowedBuiltin for {builtin}, got {err:?}"
        );
    }
}

#[test]
fn property_of_non_object_is_a_runtime_fault_not_a_panic() {
    let root = Scope::new_root();
    let err = root.eval("a.b", None).unwrap_err();
    assert!(matches!(err, EngineError::Eval(EvalError::PropertyOfNonObject { .. })));
}

#[test]
fn calling_a_non_function_is_a_runtime_fault() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("a", Value::Number(1.0));
    let err = root.eval("a()", None).unwrap_err();
    assert!(matches!(err, EngineError::Eval(EvalError::NotCallable { .. })));
}

#[test]
fn ttl_exceeded_is_reported_as_a_digest_error() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("counterA", Value::Number(0.0));
    root.properties().borrow_mut().insert("counterB", Value::Number(0.0));

    let a_scope = root.clone();
    let _watch_a = root
        .watch(
            "counterA",
            Some(Rc::new(move |_new, _old, _scope| {
                let props = a_scope.properties();
                let next = props.borrow().get("counterB").and_then(Value::as_number).unwrap_or(0.0) + 1.0;
                props.borrow_mut().insert("counterB", Value::Number(next));
                Ok(())
            })),
            false,
        )
        .unwrap();
    let b_scope = root.clone();
    let _watch_b = root
        .watch(
            "counterB",
            Some(Rc::new(move |_new, _old, _scope| {
                let props = b_scope.properties();
                let next = props.borrow().get("counterA").and_then(Value::as_number).unwrap_or(0.0) + 1.0;
                props.borrow_mut().insert("counterA", Value::Number(next));
                Ok(())
            })),
            false,
        )
        .unwrap();

    assert_eq!(root.digest().unwrap_err(), DigestError::TtlExceeded);
}

#[test]
fn digesting_from_inside_a_watch_listener_is_rejected_as_reentrant() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("x", Value::Number(1.0));

    let nested_result: Rc<RefCell<Option<Result<(), DigestError>>>> = Rc::new(RefCell::new(None));
    let nested_result_clone = nested_result.clone();
    let inner_scope = root.clone();
    let _d = root
        .watch(
            "x",
            Some(Rc::new(move |_new, _old, _scope| {
                *nested_result_clone.borrow_mut() = Some(inner_scope.digest());
                Ok(())
            })),
            false,
        )
        .unwrap();

    root.digest().unwrap();
    let captured = nested_result.borrow_mut().take().expect("listener ran");
    assert_eq!(captured.unwrap_err(), DigestError::ReentrantPhase { phase: "$digest" });
}

#[test]
fn applying_from_inside_an_apply_is_rejected_as_reentrant() {
    let root = Scope::new_root();
    let inner_scope = root.clone();
    let nested_result: Rc<RefCell<Option<Result<Value, EngineError>>>> = Rc::new(RefCell::new(None));

    struct TriggerApply {
        scope: Scope,
        result: Rc<RefCell<Option<Result<Value, EngineError>>>>,
    }
    impl NativeFn for TriggerApply {
        fn call(&self, _this: Option<Value>, _args: &[Value]) -> Result<Value, EvalError> {
            *self.result.borrow_mut() = Some(self.scope.apply("1", None));
            Ok(Value::Undefined)
        }
    }

    root.properties().borrow_mut().insert(
        "trigger",
        Value::Callable(Rc::new(TriggerApply { scope: inner_scope, result: nested_result.clone() })),
    );

    root.apply("trigger()", None).unwrap();
    let captured = nested_result.borrow_mut().take().expect("trigger ran");
    let err = captured.unwrap_err();
    assert_eq!(err, EngineError::Digest(DigestError::ReentrantPhase { phase: "$apply" }));
}
