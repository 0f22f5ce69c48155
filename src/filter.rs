//! The filter registry collaborator (spec §2, §6).
//!
//! The core only depends on this through two operations: `register` at
//! startup and `filter(name)` lookup at evaluation time. The always-present
//! `filter` built-in (array predicate filtering) lives here too since the
//! spec requires it to exist with no registration step.

use crate::error::EvalError;
use crate::value::Value;
use std::collections::HashMap;
use std::rc::Rc;

/// A filter is a callable taking the piped value plus any `:arg` operands.
pub trait Filter {
    fn call(&self, input: &Value, args: &[Value]) -> Result<Value, EvalError>;

    /// Stateful filters (those whose output can vary for the same inputs,
    /// e.g. depending on wall-clock time) are never treated as constant
    /// by AST analysis (spec §4.4).
    fn is_stateful(&self) -> bool {
        false
    }
}

impl<F> Filter for F
where
    F: Fn(&Value, &[Value]) -> Result<Value, EvalError>,
{
    fn call(&self, input: &Value, args: &[Value]) -> Result<Value, EvalError> {
        (self)(input, args)
    }
}

/// Name → filter mapping, consulted by the compiler at evaluation time.
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<String, Rc<dyn Filter>>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = FilterRegistry { filters: HashMap::new() };
        registry.register("filter", Rc::new(ArrayFilter));
        registry
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Rc<dyn Filter>) {
        self.filters.insert(name.into(), factory);
    }

    pub fn register_many(&mut self, entries: impl IntoIterator<Item = (String, Rc<dyn Filter>)>) {
        for (name, filter) in entries {
            self.filters.insert(name, filter);
        }
    }

    pub fn filter(&self, name: &str) -> Option<Rc<dyn Filter>> {
        self.filters.get(name).cloned()
    }

    pub fn is_stateful(&self, name: &str) -> bool {
        self.filters.get(name).is_some_and(|f| f.is_stateful())
    }
}

/// The built-in `filter` array predicate (spec §6 "Filter built-in").
struct ArrayFilter;

fn to_lowercase_substring_match(haystack: &Value, needle: &str) -> bool {
    match haystack {
        Value::String(s) => s.to_lowercase().contains(&needle.to_lowercase()),
        Value::Number(n) => n.to_string().to_lowercase().contains(&needle.to_lowercase()),
        Value::Bool(b) => b.to_string().contains(&needle.to_lowercase()),
        _ => false,
    }
}

/// Evaluates one criterion key/value pair against `item`'s corresponding
/// field(s). `key == "$"` means "any field at this level".
fn matches_mapping_criterion(item: &Value, key: &str, criterion: &Value) -> bool {
    if let Value::String(s) = criterion {
        if let Some(negated) = s.strip_prefix('!') {
            return !matches_primitive(item, key, &Value::string(negated));
        }
    }
    matches_primitive(item, key, criterion)
}

fn matches_primitive(item: &Value, key: &str, criterion: &Value) -> bool {
    if key == "$" {
        return match item {
            Value::Object(o) => o.borrow().iter().any(|(_, v)| matches_value(v, criterion)),
            other => matches_value(other, criterion),
        };
    }
    let field = match item {
        Value::Object(o) => o.borrow().get(key).cloned().unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    };
    matches_value(&field, criterion)
}

fn matches_value(field: &Value, criterion: &Value) -> bool {
    if field.is_undefined() {
        return false;
    }
    match criterion {
        Value::Null => field.is_null(),
        Value::String(needle) => to_lowercase_substring_match(field, needle),
        other => field.structural_eq(other),
    }
}

fn matches_deep(item: &Value, criterion: &Value) -> bool {
    match criterion {
        Value::Object(crit) => crit
            .borrow()
            .iter()
            .all(|(k, v)| matches_mapping_criterion(item, k, v)),
        Value::String(s) => {
            if let Some(negated) = s.strip_prefix('!') {
                !matches_primitive(item, "$", &Value::string(negated))
            } else {
                matches_primitive(item, "$", criterion)
            }
        }
        Value::Null => matches_primitive(item, "$", criterion),
        other => item.structural_eq(other),
    }
}

impl Filter for ArrayFilter {
    fn call(&self, input: &Value, args: &[Value]) -> Result<Value, EvalError> {
        let Value::Array(items) = input else {
            return Ok(Value::array(Vec::new()));
        };
        let criterion = args.first().cloned().unwrap_or(Value::Undefined);
        let comparator = args.get(1).cloned();

        let predicate: Box<dyn Fn(&Value) -> bool> = match (&criterion, &comparator) {
            (Value::Callable(f), _) => {
                let f = f.clone();
                Box::new(move |item: &Value| {
                    f.call(None, std::slice::from_ref(item))
                        .map(|v| v.is_truthy())
                        .unwrap_or(false)
                })
            }
            (_, Some(Value::Callable(cmp))) => {
                let cmp = cmp.clone();
                let criterion = criterion.clone();
                Box::new(move |item: &Value| {
                    cmp.call(None, &[item.clone(), criterion.clone()])
                        .map(|v| v.is_truthy())
                        .unwrap_or(false)
                })
            }
            (_, Some(Value::Bool(true))) => {
                let criterion = criterion.clone();
                Box::new(move |item: &Value| item.structural_eq(&criterion))
            }
            _ => {
                let criterion = criterion.clone();
                Box::new(move |item: &Value| matches_deep(item, &criterion))
            }
        };

        let filtered: Vec<Value> = items.borrow().iter().filter(|v| predicate(v)).cloned().collect();
        Ok(Value::array(filtered))
    }
}

/// Convenience for tests and host integrations registering plain closures.
pub fn native_filter<F>(f: F) -> Rc<dyn Filter>
where
    F: Fn(&Value, &[Value]) -> Result<Value, EvalError> + 'static,
{
    Rc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(items: Vec<Value>) -> Value {
        Value::array(items)
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let registry = FilterRegistry::new();
        let f = registry.filter("filter").unwrap();
        let input = arr(vec![Value::string("quick"), Value::string("BROWN"), Value::string("fox")]);
        let result = f.call(&input, &[Value::string("o")]).unwrap();
        if let Value::Array(items) = result {
            let items = items.borrow();
            assert_eq!(items.len(), 2);
            assert_eq!(items[0].as_str(), Some("BROWN"));
            assert_eq!(items[1].as_str(), Some("fox"));
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn bang_prefix_negates_substring_match() {
        let registry = FilterRegistry::new();
        let f = registry.filter("filter").unwrap();
        let input = arr(vec![Value::string("quick"), Value::string("BROWN"), Value::string("fox")]);
        let result = f.call(&input, &[Value::string("!o")]).unwrap();
        if let Value::Array(items) = result {
            assert_eq!(items.borrow().len(), 1);
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn null_string_criterion_does_not_match_null_value() {
        let registry = FilterRegistry::new();
        let f = registry.filter("filter").unwrap();
        let input = arr(vec![Value::Null, Value::string("null")]);
        let result = f.call(&input, &[Value::string("null")]).unwrap();
        if let Value::Array(items) = result {
            // "null" the string matches the string "null" via substring,
            // but not the Value::Null element (undefined/null never match
            // a string criterion via substring coercion).
            assert_eq!(items.borrow().len(), 1);
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn undefined_elements_never_match() {
        let registry = FilterRegistry::new();
        let f = registry.filter("filter").unwrap();
        let input = arr(vec![Value::Undefined, Value::string("a")]);
        let result = f.call(&input, &[Value::string("a")]).unwrap();
        if let Value::Array(items) = result {
            assert_eq!(items.borrow().len(), 1);
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn built_in_filter_is_always_present() {
        let registry = FilterRegistry::new();
        assert!(registry.filter("filter").is_some());
        assert!(registry.filter("nonexistent").is_none());
    }
}
