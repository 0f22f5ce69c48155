//! AST → evaluator (spec §4.5). The "compile" step here is AST-walking:
//! a [`CompiledExpr`] closes over the analysed tree and a shared filter
//! registry, and each call to [`CompiledExpr::eval`] dispatches directly
//! over the tree (spec §9 "Evaluator production" — no bytecode or code
//! generation is needed for this grammar).

use crate::analysis::{analyze, classify};
use crate::ast::{BinaryOp, LogicalOp, Node, NodeKind, ObjectKey, UnaryOp};
use crate::error::{EvalError, ParseError};
use crate::filter::FilterRegistry;
use crate::parser::{parse, strip_one_time_prefix};
use crate::safety;
use crate::scope::Scope;
use crate::value::{Mapping, Value};
use std::rc::Rc;

/// Which watch-registration strategy a compiled expression requests
/// (spec §4.6's `$$watchDelegate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchDelegate {
    Constant,
    OneTime,
    OneTimeLiteral,
    Inputs,
}

/// A compiled expression: the analysed AST plus the metadata spec §3's
/// "Compiled Expression" requires (`constant`, `literal`, `inputs`,
/// `assign?`, `$$watchDelegate?`).
#[derive(Clone)]
pub struct CompiledExpr {
    program: Node,
    filters: Rc<FilterRegistry>,
    root_object: Option<Value>,
    pub is_constant: bool,
    pub is_literal: bool,
    pub is_one_time: bool,
    pub inputs: Option<Vec<CompiledExpr>>,
    pub watch_delegate: Option<WatchDelegate>,
}

impl CompiledExpr {
    /// Evaluates the expression against `scope` and an optional `locals`
    /// overlay, returning the last statement's value (spec §4.2 "program
    /// is a semicolon-separated list").
    pub fn eval(&self, scope: &Scope, locals: Option<&Value>) -> Result<Value, EvalError> {
        let NodeKind::Program(body) = &self.program.kind else {
            unreachable!("CompiledExpr always wraps a Program node")
        };
        let mut result = Value::Undefined;
        for stmt in body {
            result = eval_node(stmt, scope, locals, &self.filters, self.root_object.as_ref())?;
        }
        guard(result, self.root_object.as_ref())
    }

    /// Emits the setter side of an assignable single-statement program
    /// (spec §4.5 "Assignment target"). Returns an error if the program
    /// is not a single Identifier/Member statement.
    pub fn assign(&self, scope: &Scope, value: Value, locals: Option<&Value>) -> Result<Value, EvalError> {
        let NodeKind::Program(body) = &self.program.kind else {
            unreachable!()
        };
        match body.as_slice() {
            [stmt] if stmt.is_assignable() => {
                assign_node(stmt, value, scope, locals, &self.filters, self.root_object.as_ref())
            }
            _ => Err(EvalError::Custom("expression is not assignable".to_string())),
        }
    }

    pub fn is_assignable(&self) -> bool {
        let NodeKind::Program(body) = &self.program.kind else { return false };
        matches!(body.as_slice(), [stmt] if stmt.is_assignable())
    }
}

/// Compiles expression text into a [`CompiledExpr`] against a shared
/// filter registry.
#[derive(Clone)]
pub struct Compiler {
    filters: Rc<FilterRegistry>,
    root_object: Option<Value>,
}

impl Compiler {
    pub fn new(filters: Rc<FilterRegistry>) -> Self {
        Compiler { filters, root_object: None }
    }

    /// Installs the host's canonical root-`Object` marker, so the safety
    /// gate can refuse it if reached (spec §4.3).
    pub fn with_root_object(mut self, root_object: Value) -> Self {
        self.root_object = Some(root_object);
        self
    }

    pub fn compile(&self, source: &str) -> Result<CompiledExpr, ParseError> {
        let (is_one_time, rest) = strip_one_time_prefix(source);
        let mut program = parse(rest)?;
        analyze(&mut program, &self.filters);
        let shape = classify(&program);

        let inputs = shape.inputs.as_ref().map(|nodes| {
            nodes
                .iter()
                .map(|n| {
                    let wrapped = Node::new(NodeKind::Program(vec![n.clone()]), n.span);
                    CompiledExpr {
                        program: wrapped,
                        filters: self.filters.clone(),
                        root_object: self.root_object.clone(),
                        is_constant: n.constant,
                        is_literal: false,
                        is_one_time: false,
                        inputs: None,
                        watch_delegate: None,
                    }
                })
                .collect::<Vec<_>>()
        });

        let watch_delegate = if is_one_time {
            Some(if shape.literal { WatchDelegate::OneTimeLiteral } else { WatchDelegate::OneTime })
        } else if shape.constant {
            Some(WatchDelegate::Constant)
        } else if inputs.is_some() {
            Some(WatchDelegate::Inputs)
        } else {
            None
        };

        Ok(CompiledExpr {
            program,
            filters: self.filters.clone(),
            root_object: self.root_object.clone(),
            is_constant: shape.constant,
            is_literal: shape.literal,
            is_one_time,
            inputs,
            watch_delegate,
        })
    }
}

fn guard(value: Value, root_object: Option<&Value>) -> Result<Value, EvalError> {
    safety::check_value(&value, root_object)?;
    Ok(value)
}

fn resolve_member_key(
    property: &Node,
    computed: bool,
    scope: &Scope,
    locals: Option<&Value>,
    filters: &FilterRegistry,
    root_object: Option<&Value>,
) -> Result<String, EvalError> {
    if computed {
        let key_value = eval_node(property, scope, locals, filters, root_object)?;
        Ok(match key_value {
            Value::String(s) => s.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n >= 0.0 {
                    (n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            other => other.to_string(),
        })
    } else {
        match &property.kind {
            NodeKind::Identifier(name) => Ok(name.clone()),
            _ => unreachable!("non-computed member property is always an Identifier"),
        }
    }
}

fn read_member(object: &Value, key: &str) -> Result<Value, EvalError> {
    safety::check_field_name(key)?;
    match object {
        Value::Object(m) => Ok(m.borrow().get(key).cloned().unwrap_or(Value::Undefined)),
        Value::Array(items) => {
            if key == "length" {
                return Ok(Value::Number(items.borrow().len() as f64));
            }
            match key.parse::<usize>() {
                Ok(idx) => Ok(items.borrow().get(idx).cloned().unwrap_or(Value::Undefined)),
                Err(_) => Ok(Value::Undefined),
            }
        }
        Value::String(s) => {
            if key == "length" {
                return Ok(Value::Number(s.chars().count() as f64));
            }
            Ok(Value::Undefined)
        }
        Value::Null | Value::Undefined => Err(EvalError::PropertyOfNonObject {
            property: key.to_string(),
            receiver: object.type_name(),
        }),
        _ => Ok(Value::Undefined),
    }
}

fn ensure_object_property(container: &std::rc::Rc<std::cell::RefCell<Mapping>>, key: &str) -> std::rc::Rc<std::cell::RefCell<Mapping>> {
    if let Some(Value::Object(existing)) = container.borrow().get(key) {
        return existing.clone();
    }
    let created = std::rc::Rc::new(std::cell::RefCell::new(Mapping::new()));
    container.borrow_mut().insert(key, Value::Object(created.clone()));
    created
}

/// Resolves the settable container for `node`, creating intermediate
/// mappings as needed (spec §4.5 "Member access... Writes... create
/// missing nested mappings").
fn eval_as_container(
    node: &Node,
    scope: &Scope,
    locals: Option<&Value>,
    filters: &FilterRegistry,
    root_object: Option<&Value>,
) -> Result<std::rc::Rc<std::cell::RefCell<Mapping>>, EvalError> {
    match &node.kind {
        NodeKind::Identifier(name) => {
            safety::check_field_name(name)?;
            let owner = scope.resolve_write_owner(name);
            Ok(ensure_object_property(&owner, name))
        }
        NodeKind::This => Ok(scope.properties()),
        NodeKind::Locals => match locals {
            Some(Value::Object(m)) => Ok(m.clone()),
            _ => Err(EvalError::Custom("$locals is not available for assignment".to_string())),
        },
        NodeKind::Member { object, property, computed } => {
            let container = eval_as_container(object, scope, locals, filters, root_object)?;
            let key = resolve_member_key(property, *computed, scope, locals, filters, root_object)?;
            safety::check_field_name(&key)?;
            Ok(ensure_object_property(&container, &key))
        }
        _ => unreachable!("eval_as_container is only called on assignable subtrees"),
    }
}

fn assign_node(
    node: &Node,
    value: Value,
    scope: &Scope,
    locals: Option<&Value>,
    filters: &FilterRegistry,
    root_object: Option<&Value>,
) -> Result<Value, EvalError> {
    match &node.kind {
        NodeKind::Identifier(name) => {
            safety::check_field_name(name)?;
            let owner = scope.resolve_write_owner(name);
            owner.borrow_mut().insert(name.clone(), value.clone());
            Ok(value)
        }
        NodeKind::Member { object, property, computed } => {
            let container = eval_as_container(object, scope, locals, filters, root_object)?;
            let key = resolve_member_key(property, *computed, scope, locals, filters, root_object)?;
            safety::check_field_name(&key)?;
            container.borrow_mut().insert(key, value.clone());
            Ok(value)
        }
        NodeKind::Assignment { left, right } => {
            let rhs = eval_node(right, scope, locals, filters, root_object)?;
            assign_node(left, rhs, scope, locals, filters, root_object)?;
            assign_node(left, value, scope, locals, filters, root_object)
        }
        _ => Err(EvalError::Custom("invalid assignment target".to_string())),
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Value {
    match op {
        BinaryOp::Add => {
            if left.is_undefined() || right.is_undefined() {
                Value::Number(left.to_number_for_arith() + right.to_number_for_arith())
            } else if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
                Value::string(format!("{left}{right}"))
            } else {
                Value::Number(left.to_number_for_arith() + right.to_number_for_arith())
            }
        }
        BinaryOp::Sub => Value::Number(left.to_number_for_arith() - right.to_number_for_arith()),
        BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Mod => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Lt => Value::Bool(compare(&left, &right).is_some_and(|o| o.is_lt())),
        BinaryOp::Gt => Value::Bool(compare(&left, &right).is_some_and(|o| o.is_gt())),
        BinaryOp::Le => Value::Bool(compare(&left, &right).is_some_and(|o| o.is_le())),
        BinaryOp::Ge => Value::Bool(compare(&left, &right).is_some_and(|o| o.is_ge())),
        BinaryOp::Eq => Value::Bool(loose_eq(&left, &right)),
        BinaryOp::NotEq => Value::Bool(!loose_eq(&left, &right)),
        BinaryOp::StrictEq => Value::Bool(left.structural_eq(&right)),
        BinaryOp::StrictNotEq => Value::Bool(!left.structural_eq(&right)),
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Some(a.cmp(b));
    }
    left.to_number().partial_cmp(&right.to_number())
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    let left_nullish = left.is_null() || left.is_undefined();
    let right_nullish = right.is_null() || right.is_undefined();
    if left_nullish || right_nullish {
        return left_nullish && right_nullish;
    }
    left.structural_eq(right)
}

fn eval_node(
    node: &Node,
    scope: &Scope,
    locals: Option<&Value>,
    filters: &FilterRegistry,
    root_object: Option<&Value>,
) -> Result<Value, EvalError> {
    match &node.kind {
        NodeKind::Literal(v) => Ok(v.clone()),
        NodeKind::Identifier(name) => {
            if let Some(Value::Object(m)) = locals {
                if m.borrow().contains_key(name) {
                    let local = m.borrow().get(name).cloned().unwrap_or(Value::Undefined);
                    return guard(local, root_object);
                }
            }
            guard(scope.get(name), root_object)
        }
        NodeKind::This => Ok(Value::Object(scope.properties())),
        NodeKind::Locals => Ok(locals.cloned().unwrap_or(Value::Undefined)),
        NodeKind::ValueParameter => Ok(Value::Undefined),
        NodeKind::Array(elements) => {
            let mut items = Vec::with_capacity(elements.len());
            for el in elements {
                items.push(eval_node(el, scope, locals, filters, root_object)?);
            }
            Ok(Value::array(items))
        }
        NodeKind::Object(props) => {
            let mut map = Mapping::new();
            for prop in props {
                let key = match &prop.key {
                    ObjectKey::Identifier(s) => s.clone(),
                    ObjectKey::Literal(v) => v.to_string(),
                };
                let value = eval_node(&prop.value, scope, locals, filters, root_object)?;
                map.insert(key, value);
            }
            Ok(Value::object(map))
        }
        NodeKind::Member { object, property, computed } => {
            let obj_value = guard(eval_node(object, scope, locals, filters, root_object)?, root_object)?;
            let key = resolve_member_key(property, *computed, scope, locals, filters, root_object)?;
            let result = read_member(&obj_value, &key)?;
            guard(result, root_object)
        }
        NodeKind::Call { callee, arguments, filter } => {
            if let Some(name) = filter {
                let f = filters
                    .filter(name)
                    .ok_or_else(|| EvalError::NotCallable { name: name.clone() })?;
                let mut evaluated = Vec::with_capacity(arguments.len());
                for arg in arguments {
                    evaluated.push(guard(eval_node(arg, scope, locals, filters, root_object)?, root_object)?);
                }
                let input = evaluated.remove(0);
                let result = f.call(&input, &evaluated)?;
                return guard(result, root_object);
            }

            let (callable, this) = match &callee.kind {
                NodeKind::Member { object, property, computed } => {
                    let receiver = guard(eval_node(object, scope, locals, filters, root_object)?, root_object)?;
                    let key = resolve_member_key(property, *computed, scope, locals, filters, root_object)?;
                    if matches!(receiver, Value::Callable(_)) {
                        safety::check_builtin_name(&key)?;
                    }
                    let f = read_member(&receiver, &key)?;
                    (f, Some(receiver))
                }
                NodeKind::Identifier(name) => {
                    let has_local = matches!(locals, Some(Value::Object(m)) if m.borrow().contains_key(name));
                    let this = if has_local {
                        locals.cloned().unwrap_or(Value::Undefined)
                    } else {
                        Value::Object(scope.properties())
                    };
                    let f = eval_node(callee, scope, locals, filters, root_object)?;
                    (f, Some(this))
                }
                _ => {
                    let f = eval_node(callee, scope, locals, filters, root_object)?;
                    (f, None)
                }
            };

            let Value::Callable(f) = callable else {
                return Err(EvalError::NotCallable { name: describe_callee(callee) });
            };

            let mut evaluated = Vec::with_capacity(arguments.len());
            for arg in arguments {
                evaluated.push(guard(eval_node(arg, scope, locals, filters, root_object)?, root_object)?);
            }
            let result = f.call(this, &evaluated)?;
            guard(result, root_object)
        }
        NodeKind::Assignment { left, right } => {
            let value = eval_node(right, scope, locals, filters, root_object)?;
            assign_node(left, value, scope, locals, filters, root_object)
        }
        NodeKind::Unary { operator, argument } => {
            let arg = eval_node(argument, scope, locals, filters, root_object)?;
            Ok(match operator {
                UnaryOp::Plus => Value::Number(arg.to_number_for_arith()),
                UnaryOp::Minus => Value::Number(0.0 - arg.to_number_for_arith()),
                UnaryOp::Not => Value::Bool(!arg.is_truthy()),
            })
        }
        NodeKind::Binary { operator, left, right } => {
            let l = eval_node(left, scope, locals, filters, root_object)?;
            let r = eval_node(right, scope, locals, filters, root_object)?;
            Ok(eval_binary(*operator, l, r))
        }
        NodeKind::Logical { operator, left, right } => {
            let l = eval_node(left, scope, locals, filters, root_object)?;
            match operator {
                LogicalOp::And => {
                    if !l.is_truthy() {
                        Ok(Value::Bool(false))
                    } else {
                        let r = eval_node(right, scope, locals, filters, root_object)?;
                        Ok(Value::Bool(r.is_truthy()))
                    }
                }
                LogicalOp::Or => {
                    if l.is_truthy() {
                        Ok(Value::Bool(true))
                    } else {
                        let r = eval_node(right, scope, locals, filters, root_object)?;
                        Ok(Value::Bool(r.is_truthy()))
                    }
                }
            }
        }
        NodeKind::Conditional { test, consequent, alternate } => {
            let t = eval_node(test, scope, locals, filters, root_object)?;
            if t.is_truthy() {
                eval_node(consequent, scope, locals, filters, root_object)
            } else {
                eval_node(alternate, scope, locals, filters, root_object)
            }
        }
        NodeKind::Program(_) => unreachable!("nested Program nodes never occur"),
    }
}

fn describe_callee(node: &Node) -> String {
    match &node.kind {
        NodeKind::Identifier(name) => name.clone(),
        NodeKind::Member { property, computed: false, .. } => match &property.kind {
            NodeKind::Identifier(name) => name.clone(),
            _ => "<expr>".to_string(),
        },
        _ => "<expr>".to_string(),
    }
}
