//! The dynamic value model shared by the expression engine and the scope
//! graph.
//!
//! Every quantity that flows through a compiled expression — a scope
//! property, a literal, a call argument, a watcher's last-seen value — is a
//! [`Value`]. Compound values (`Array`, `Object`) are reference types
//! (`Rc<RefCell<..>>`), matching the host semantics the expression grammar
//! is modeled on: two scope properties that alias the same array mutate
//! together, and identity comparison is meaningful.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// An ordered string-keyed map, preserving insertion order so that
/// iteration (e.g. in `$watchCollection`) is deterministic.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mapping {
    entries: Vec<(String, Value)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Inserts or overwrites `key`, preserving its original position on
    /// overwrite and appending on insert.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A callable host or user value. Receiver binding (for member calls vs.
/// bare calls) is resolved by the caller; `call` only sees the already
/// bound `this`.
pub trait NativeFn {
    fn call(&self, this: Option<Value>, args: &[Value]) -> Result<Value, crate::error::EvalError>;

    /// A human-readable name, used by the safety gate and in diagnostics.
    fn name(&self) -> &str {
        "<anonymous>"
    }
}

impl fmt::Debug for dyn NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({})", self.name())
    }
}

/// Any value reachable from an expression. Arrays and objects are
/// reference-counted and interior-mutable so that shared bindings alias
/// correctly, the way object/array references behave in the host
/// language this grammar is modeled on.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<Mapping>>),
    Callable(Rc<dyn NativeFn>),
    /// An opaque host object that the safety gate may need to inspect
    /// structurally (e.g. "has `children` and `nodeName`") but which the
    /// value model does not otherwise interpret.
    Opaque(Rc<dyn std::any::Any>),
}

/// A fully-derivable stand-in for [`Value`] used only for serialization.
/// `Callable` and `Opaque` have no JSON representation and never appear
/// here; a `Value` holding one fails to serialize instead.
#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
enum ValueRepr {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ValueRepr>),
    Object(Vec<(String, ValueRepr)>),
}

#[cfg(feature = "serde")]
impl ValueRepr {
    fn from_value(value: &Value) -> Result<ValueRepr, String> {
        Ok(match value {
            Value::Null => ValueRepr::Null,
            Value::Undefined => ValueRepr::Undefined,
            Value::Bool(b) => ValueRepr::Bool(*b),
            Value::Number(n) => ValueRepr::Number(*n),
            Value::String(s) => ValueRepr::String(s.to_string()),
            Value::Array(a) => ValueRepr::Array(
                a.borrow().iter().map(ValueRepr::from_value).collect::<Result<_, _>>()?,
            ),
            Value::Object(o) => ValueRepr::Object(
                o.borrow()
                    .iter()
                    .map(|(k, v)| ValueRepr::from_value(v).map(|r| (k.to_string(), r)))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Callable(_) => return Err("cannot serialize a callable value".into()),
            Value::Opaque(_) => return Err("cannot serialize an opaque value".into()),
        })
    }

    fn into_value(self) -> Value {
        match self {
            ValueRepr::Null => Value::Null,
            ValueRepr::Undefined => Value::Undefined,
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Number(n) => Value::Number(n),
            ValueRepr::String(s) => Value::string(s),
            ValueRepr::Array(items) => {
                Value::array(items.into_iter().map(ValueRepr::into_value).collect())
            }
            ValueRepr::Object(entries) => {
                let mut mapping = Mapping::new();
                for (k, v) in entries {
                    mapping.insert(k, v.into_value());
                }
                Value::object(mapping)
            }
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let repr = ValueRepr::from_value(self).map_err(serde::ser::Error::custom)?;
        serde::Serialize::serialize(&repr, serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        <ValueRepr as serde::Deserialize>::deserialize(deserializer).map(ValueRepr::into_value)
    }
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(map: Mapping) -> Self {
        Value::Object(Rc::new(RefCell::new(map)))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// "Array-like" per §4.8/§4.3: a `Value::Array`. (The value model has
    /// no separate host-array-vs-plain-object distinction beyond this.)
    pub fn is_array_like(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_plain_object(&self) -> bool {
        matches!(self, Value::Object(_))
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

    /// Truthiness used by `&&`, `||`, `? :` and `!`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Undefined => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Callable(_) | Value::Opaque(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Callable(_) => "function",
            Value::Opaque(_) => "object",
        }
    }

    /// Coerces to a number the way unary `+`/`-` and additive `+`/`-` do:
    /// `undefined` substitutes `0` (spec §4.5, §8 boundary behaviour);
    /// anything else that is not already numeric yields `NaN`.
    pub fn to_number_for_arith(&self) -> f64 {
        match self {
            Value::Undefined => 0.0,
            Value::Number(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Null => 0.0,
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    /// Coerces to a number the way multiplicative, relational, and
    /// comparison operators do: `undefined` yields `NaN` (spec §8 boundary
    /// behaviour: "`a * b` with either operand `undefined` evaluates to
    /// `NaN`"), distinct from [`Value::to_number_for_arith`]'s
    /// zero-substitution used by additive operators.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Number(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Null => 0.0,
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    /// Structural equality: deep value comparison. `NaN` is not equal to
    /// itself here, matching ordinary numeric `==`.
    pub fn structural_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.structural_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|bv| v.structural_eq(bv)))
            }
            (Value::Callable(a), Value::Callable(b)) => Rc::ptr_eq(a, b),
            (Value::Opaque(a), Value::Opaque(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Reference-mode equality: identity for compound values, value
    /// equality for scalars, with `NaN === NaN` (spec §3, §4.6).
    pub fn reference_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Callable(a), Value::Callable(b)) => Rc::ptr_eq(a, b),
            (Value::Opaque(a), Value::Opaque(b)) => Rc::ptr_eq(a, b),
            _ => self.scalar_eq(other),
        }
    }

    fn scalar_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }

    /// A deep clone that preserves structural shape but shares no
    /// allocations with the original — used when a `valueEq` watcher
    /// snapshots `last`.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Array(a) => Value::array(a.borrow().iter().map(Value::deep_clone).collect()),
            Value::Object(o) => {
                let mut cloned = Mapping::new();
                for (k, v) in o.borrow().iter() {
                    cloned.insert(k, v.deep_clone());
                }
                Value::object(cloned)
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Undefined => write!(f, "undefined"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Object(o) => {
                write!(f, "{{")?;
                for (i, (k, v)) in o.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "}}")
            }
            Value::Callable(c) => write!(f, "function {}()", c.name()),
            Value::Opaque(_) => write!(f, "[object]"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_reference_equal_to_itself() {
        let nan = Value::Number(f64::NAN);
        assert!(nan.reference_eq(&Value::Number(f64::NAN)));
    }

    #[test]
    fn nan_is_not_structural_equal_to_itself() {
        let nan = Value::Number(f64::NAN);
        assert!(!nan.structural_eq(&Value::Number(f64::NAN)));
    }

    #[test]
    fn arrays_compare_by_identity_under_reference_eq() {
        let a = Value::array(vec![Value::Number(1.0)]);
        let b = Value::array(vec![Value::Number(1.0)]);
        assert!(!a.reference_eq(&b));
        assert!(a.structural_eq(&b));
        let c = a.clone();
        assert!(a.reference_eq(&c));
    }

    #[test]
    fn deep_clone_breaks_aliasing() {
        let a = Value::array(vec![Value::Number(1.0)]);
        let cloned = a.deep_clone();
        if let Value::Array(inner) = &a {
            inner.borrow_mut().push(Value::Number(2.0));
        }
        assert_eq!(cloned.structural_eq(&Value::array(vec![Value::Number(1.0)])), true);
    }

    #[test]
    fn undefined_substitutes_zero_for_arithmetic() {
        assert_eq!(Value::Undefined.to_number_for_arith(), 0.0);
    }

    #[test]
    fn undefined_coerces_to_nan_outside_additive_context() {
        assert!(Value::Undefined.to_number().is_nan());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn value_round_trips_through_json() {
        let original = Value::object({
            let mut m = Mapping::new();
            m.insert("name", Value::string("ok"));
            m.insert("tags", Value::array(vec![Value::Number(1.0), Value::Null]));
            m
        });
        let json = serde_json::to_string(&original).unwrap();
        let restored: Value = serde_json::from_str(&json).unwrap();
        assert!(original.structural_eq(&restored));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn callable_values_refuse_to_serialize() {
        struct Noop;
        impl crate::value::NativeFn for Noop {
            fn call(&self, _this: Option<Value>, _args: &[Value]) -> Result<Value, crate::error::EvalError> {
                Ok(Value::Undefined)
            }
        }
        let callable = Value::Callable(Rc::new(Noop));
        assert!(serde_json::to_string(&callable).is_err());
    }

    #[test]
    fn mapping_preserves_insertion_order() {
        let mut m = Mapping::new();
        m.insert("b", Value::Number(1.0));
        m.insert("a", Value::Number(2.0));
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
