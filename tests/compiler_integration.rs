//! End-to-end expression scenarios (spec §8 "End-to-end scenarios").

use reactive_core::filter::{native_filter, FilterRegistry};
use reactive_core::scope::Scope;
use reactive_core::value::Value;
use reactive_core::{Compiler, EvalError};
use std::rc::Rc;

#[test]
fn arithmetic_precedence_scenario() {
    let expr = reactive_core::compile("2 + 3 * 5").unwrap();
    let root = Scope::new_root();
    assert_eq!(expr.eval(&root, None).unwrap().as_number(), Some(17.0));
}

#[test]
fn ternary_with_strict_equality_scenario() {
    let expr = reactive_core::compile(r#"a === 42 ? "y" : "n""#).unwrap();
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("a", Value::Number(42.0));
    assert_eq!(expr.eval(&root, None).unwrap().as_str(), Some("y"));
}

#[test]
fn array_filter_predicate_scenario() {
    let expr = reactive_core::compile(r#"arr | filter:"o""#).unwrap();
    let root = Scope::new_root();
    root.properties().borrow_mut().insert(
        "arr",
        Value::array(vec![Value::string("quick"), Value::string("BROWN"), Value::string("fox")]),
    );
    let result = expr.eval(&root, None).unwrap();
    let Value::Array(items) = result else { panic!("expected array") };
    let items = items.borrow();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_str(), Some("BROWN"));
    assert_eq!(items[1].as_str(), Some("fox"));
}

#[test]
fn custom_filter_chain_scenario() {
    let mut registry = FilterRegistry::new();
    registry.register(
        "upcase",
        native_filter(|input, _args| match input {
            Value::String(s) => Ok(Value::string(s.to_uppercase())),
            other => Err(EvalError::Custom(format!("upcase expects a string, got {}", other.type_name()))),
        }),
    );
    registry.register(
        "exclamate",
        native_filter(|input, _args| match input {
            Value::String(s) => Ok(Value::string(format!("{s}!"))),
            other => Err(EvalError::Custom(format!("exclamate expects a string, got {}", other.type_name()))),
        }),
    );

    let compiler = Compiler::new(Rc::new(registry));
    let expr = compiler.compile(r#""hello" | upcase | exclamate"#).unwrap();
    let root = Scope::new_root();
    assert_eq!(expr.eval(&root, None).unwrap().as_str(), Some("HELLO!"));
}

#[test]
fn mutually_recursive_watchers_exceed_ttl_scenario() {
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

    assert!(root.digest().is_err());
}

#[test]
fn isolation_breaks_inheritance_but_apply_still_digests_from_root_scenario() {
    let r = Scope::new_root();
    let c1 = r.new_child(false);
    let c2 = c1.new_child(true);
    let g = c2.new_child(false);
    r.properties().borrow_mut().insert("x", Value::Number(1.0));

    assert!(g.get("x").is_undefined());

    let fired = Rc::new(std::cell::Cell::new(0u32));
    let fired_clone = fired.clone();
    let _d = r
        .watch(
            "x",
            Some(Rc::new(move |_new, _old, _scope| {
                fired_clone.set(fired_clone.get() + 1);
                Ok(())
            })),
            false,
        )
        .unwrap();
    g.apply("1", None).unwrap();
    assert_eq!(fired.get(), 1);
}

// ============================================
// Round-trip laws
// ============================================

#[test]
fn literal_array_and_object_expressions_evaluate_to_their_host_equivalent() {
    let expr = reactive_core::compile("[1, 2, 3]").unwrap();
    let root = Scope::new_root();
    let Value::Array(items) = expr.eval(&root, None).unwrap() else { panic!("expected array") };
    assert_eq!(items.borrow().len(), 3);

    let expr = reactive_core::compile("{a: 1, b: 'two'}").unwrap();
    let Value::Object(obj) = expr.eval(&root, None).unwrap() else { panic!("expected object") };
    assert_eq!(obj.borrow().get("a").and_then(Value::as_number), Some(1.0));
    assert_eq!(obj.borrow().get("b").and_then(Value::as_str), Some("two"));
}

#[test]
fn assign_then_read_round_trips_through_plain_mappings() {
    let expr = reactive_core::compile("a.b.c").unwrap();
    let root = Scope::new_root();
    expr.assign(&root, Value::Number(7.0), None).unwrap();
    assert_eq!(expr.eval(&root, None).unwrap().as_number(), Some(7.0));
}

#[test]
fn recompiling_the_same_source_yields_extensionally_equal_evaluators() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("a", Value::Number(3.0));
    let first = reactive_core::compile("a * 2").unwrap();
    let second = reactive_core::compile("a * 2").unwrap();
    assert_eq!(
        first.eval(&root, None).unwrap().as_number(),
        second.eval(&root, None).unwrap().as_number()
    );
}
