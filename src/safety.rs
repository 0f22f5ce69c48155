//! The safety gate: the single source of truth for member-name and
//! receiver prohibitions (spec §4.3, §9 "Safety gate as single source of
//! truth"). The lexer and parser never reason about forbidden names;
//! only the compiler's evaluator closures call into here.

use crate::error::SafetyError;
use crate::value::Value;

const DISALLOWED_FIELDS: &[&str] = &[
    "constructor",
    "__proto__",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

const DISALLOWED_BUILTINS: &[&str] = &["call", "bind", "apply"];

/// Fails if `name` is a forbidden member name, for either a read or a
/// write.
pub fn check_field_name(name: &str) -> Result<(), SafetyError> {
    if DISALLOWED_FIELDS.contains(&name) {
        return Err(SafetyError::DisallowedField { name: name.to_string() });
    }
    Ok(())
}

/// Fails if `name` names a disallowed builtin on a callable (`call`,
/// `bind`, `apply`).
pub fn check_builtin_name(name: &str) -> Result<(), SafetyError> {
    if DISALLOWED_BUILTINS.contains(&name) {
        return Err(SafetyError::DisallowedBuiltin { name: name.to_string() });
    }
    Ok(())
}

/// Heuristic for "looks like the self-referential global environment
/// handle": an object whose `window` field points back at itself.
fn looks_like_global(value: &Value) -> bool {
    let Value::Object(obj) = value else { return false };
    let borrowed = obj.borrow();
    match borrowed.get("window") {
        Some(Value::Object(window)) => std::rc::Rc::ptr_eq(obj, window),
        _ => false,
    }
}

/// Heuristic for "looks like a DOM node": has `children` and either
/// `nodeName` or all of `prop`/`find`/`attr` (spec §4.3).
fn looks_like_dom_node(value: &Value) -> bool {
    let Value::Object(obj) = value else { return false };
    let borrowed = obj.borrow();
    if !borrowed.contains_key("children") {
        return false;
    }
    borrowed.contains_key("nodeName")
        || (borrowed.contains_key("prop") && borrowed.contains_key("find") && borrowed.contains_key("attr"))
}

/// A value equal to its own `constructor` field (spec §4.3: "a value
/// equal to its own constructor").
fn equals_own_constructor(value: &Value) -> bool {
    let Value::Object(obj) = value else { return false };
    match obj.borrow().get("constructor") {
        Some(other) => value.reference_eq(other),
        None => false,
    }
}

/// Marker trait for the root `Object` value so hosts can flag their
/// single canonical instance; the engine refuses it if reached.
pub fn is_root_object(value: &Value, root_object: Option<&Value>) -> bool {
    match root_object {
        Some(root) => value.reference_eq(root),
        None => false,
    }
}

/// Runs every receiver/value-level check (spec §4.3); called whenever a
/// value is about to be used as a receiver, argument, or return value
/// that the evaluator has just produced.
pub fn check_value(value: &Value, root_object: Option<&Value>) -> Result<(), SafetyError> {
    if looks_like_global(value) {
        return Err(SafetyError::DisallowedGlobal);
    }
    if looks_like_dom_node(value) {
        return Err(SafetyError::DisallowedDomLike);
    }
    if equals_own_constructor(value) {
        return Err(SafetyError::DisallowedConstructor);
    }
    if is_root_object(value, root_object) {
        return Err(SafetyError::DisallowedRootObject);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Mapping;

    #[test]
    fn rejects_constructor_and_proto_fields() {
        assert!(check_field_name("constructor").is_err());
        assert!(check_field_name("__proto__").is_err());
        assert!(check_field_name("name").is_ok());
    }

    #[test]
    fn rejects_call_bind_apply_builtins() {
        assert!(check_builtin_name("call").is_err());
        assert!(check_builtin_name("bind").is_err());
        assert!(check_builtin_name("apply").is_err());
        assert!(check_builtin_name("map").is_ok());
    }

    #[test]
    fn detects_self_referential_global() {
        let mut m = Mapping::new();
        let value = Value::object(Mapping::new());
        if let Value::Object(obj) = &value {
            m.insert("window", value.clone());
            *obj.borrow_mut() = m;
        }
        assert!(check_value(&value, None).is_err());
    }

    #[test]
    fn detects_dom_like_node() {
        let mut m = Mapping::new();
        m.insert("children", Value::array(vec![]));
        m.insert("nodeName", Value::string("div"));
        let value = Value::object(m);
        assert!(check_value(&value, None).is_err());
    }

    #[test]
    fn plain_object_passes() {
        let mut m = Mapping::new();
        m.insert("a", Value::Number(1.0));
        let value = Value::object(m);
        assert!(check_value(&value, None).is_ok());
    }

    #[test]
    fn detects_root_object() {
        let root = Value::object(Mapping::new());
        assert!(check_value(&root, Some(&root)).is_err());
    }
}
