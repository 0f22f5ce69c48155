//! Single post-order pass over a parsed AST that sets `constant` and
//! `to_watch` on every node (spec §4.4), and the downstream classification
//! of a whole program into `literal` / `constant` / `inputs`.

use crate::ast::{Node, NodeKind};
use crate::filter::FilterRegistry;

/// Recursively analyses `node`, filling in `constant` and `to_watch` on it
/// and every descendant.
pub fn analyze(node: &mut Node, filters: &FilterRegistry) {
    match &mut node.kind {
        NodeKind::Literal(_) => {
            node.constant = true;
            node.to_watch.clear();
        }
        NodeKind::This | NodeKind::Locals | NodeKind::ValueParameter => {
            node.constant = false;
            node.to_watch.clear();
        }
        NodeKind::Identifier(_) => {
            node.constant = false;
            node.to_watch = vec![node.clone_without_watch()];
        }
        NodeKind::Array(elements) => {
            for el in elements.iter_mut() {
                analyze(el, filters);
            }
            node.constant = elements.iter().all(|e| e.constant);
            node.to_watch = elements
                .iter()
                .filter(|e| !e.constant)
                .flat_map(|e| e.to_watch.clone())
                .collect();
        }
        NodeKind::Object(props) => {
            for prop in props.iter_mut() {
                analyze(&mut prop.value, filters);
            }
            node.constant = props.iter().all(|p| p.value.constant);
            node.to_watch = props
                .iter()
                .filter(|p| !p.value.constant)
                .flat_map(|p| p.value.to_watch.clone())
                .collect();
        }
        NodeKind::Member { object, property, computed } => {
            analyze(object, filters);
            if *computed {
                analyze(property, filters);
            }
            let constant = object.constant && (!*computed || property.constant);
            node.constant = constant;
            node.to_watch = vec![node.clone_without_watch()];
        }
        NodeKind::Assignment { left, right } => {
            analyze(left, filters);
            analyze(right, filters);
            node.constant = left.constant && right.constant;
            node.to_watch = vec![node.clone_without_watch()];
        }
        NodeKind::Unary { argument, .. } => {
            analyze(argument, filters);
            node.constant = argument.constant;
            node.to_watch = argument.to_watch.clone();
        }
        NodeKind::Binary { left, right, .. } => {
            analyze(left, filters);
            analyze(right, filters);
            node.constant = left.constant && right.constant;
            node.to_watch = left.to_watch.iter().chain(right.to_watch.iter()).cloned().collect();
        }
        NodeKind::Logical { left, right, .. } => {
            analyze(left, filters);
            analyze(right, filters);
            node.constant = left.constant && right.constant;
            node.to_watch = vec![node.clone_without_watch()];
        }
        NodeKind::Conditional { test, consequent, alternate } => {
            analyze(test, filters);
            analyze(consequent, filters);
            analyze(alternate, filters);
            node.constant = test.constant && consequent.constant && alternate.constant;
            node.to_watch = vec![node.clone_without_watch()];
        }
        NodeKind::Call { callee, arguments, filter } => {
            for arg in arguments.iter_mut() {
                analyze(arg, filters);
            }
            match filter {
                Some(name) if !filters.is_stateful(name) => {
                    node.constant = arguments.iter().all(|a| a.constant);
                    node.to_watch = arguments.iter().flat_map(|a| a.to_watch.clone()).collect();
                }
                _ => {
                    analyze(callee, filters);
                    node.constant = false;
                    node.to_watch = vec![node.clone_without_watch()];
                }
            }
        }
        NodeKind::Program(body) => {
            for stmt in body.iter_mut() {
                analyze(stmt, filters);
            }
            node.constant = body.iter().all(|s| s.constant);
            node.to_watch = body.iter().flat_map(|s| s.to_watch.clone()).collect();
        }
    }
}

impl Node {
    /// A clone of this node with an empty `to_watch`, used when a node
    /// needs to reference itself inside its own `to_watch` set without
    /// infinite recursion.
    fn clone_without_watch(&self) -> Node {
        let mut clone = self.clone();
        clone.to_watch.clear();
        clone
    }
}

/// How a compiled expression was classified by analysis (spec §4.4).
#[derive(Debug, Clone)]
pub struct ProgramShape {
    /// Body is empty, or a single Literal/Array/Object at the top.
    pub literal: bool,
    pub constant: bool,
    /// Present iff the program has exactly one statement whose
    /// `to_watch` is exactly one node distinct from the statement itself.
    pub inputs: Option<Vec<Node>>,
}

fn is_literal_node(node: &Node) -> bool {
    matches!(node.kind, NodeKind::Literal(_) | NodeKind::Array(_) | NodeKind::Object(_))
}

/// Classifies an already-analysed `Program` node.
pub fn classify(program: &Node) -> ProgramShape {
    let NodeKind::Program(body) = &program.kind else {
        panic!("classify expects a Program node");
    };

    let literal = body.is_empty() || (body.len() == 1 && is_literal_node(&body[0]));
    let constant = program.constant;

    let inputs = if body.len() == 1 {
        let stmt = &body[0];
        let distinct_from_self = stmt.to_watch.len() == 1 && stmt.to_watch[0].span != stmt.span;
        if distinct_from_self {
            Some(stmt.to_watch.clone())
        } else {
            None
        }
    } else {
        None
    };

    ProgramShape { literal, constant, inputs }
}
