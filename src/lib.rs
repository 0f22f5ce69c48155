//! # reactive-core
//!
//! The reactive core of a dynamic data-binding framework: a sandboxed
//! expression engine paired with a scope-graph digest scheduler.
//!
//! Two pieces carry almost all the engineering. The [`compiler`] (fed by
//! [`lexer`], [`parser`], and [`analysis`]) turns expression text into a
//! [`compiler::CompiledExpr`] that can be evaluated against a
//! [`scope::Scope`] and reports back which sub-expressions it depends on.
//! The [`scope`] module hosts the tree of mutable contexts, runs the
//! `$digest` fixed-point loop against registered watchers, and dispatches
//! a small event bus (`$on`/`$emit`/`$broadcast`).
//!
//! ```
//! use reactive_core::scope::Scope;
//! use std::rc::Rc;
//!
//! let root = Scope::new_root();
//! root.properties().borrow_mut().insert("a", 42.0.into());
//!
//! let fired = Rc::new(std::cell::Cell::new(false));
//! let fired2 = fired.clone();
//! root.watch("a === 42 ? 'y' : 'n'", Some(Rc::new(move |_new, _old, _scope| {
//!     fired2.set(true);
//!     Ok(())
//! })), false).unwrap();
//!
//! root.digest().unwrap();
//! assert!(fired.get());
//! ```
//!
//! ## Modules
//!
//! - [`value`]: the dynamic tagged value model shared by everything
//! - [`error`]: the typed error hierarchy for every fallible stage
//! - [`lexer`]: expression text to tokens
//! - [`ast`]: the parsed node tree
//! - [`pratt`]: binding-power table for the flat binary/logical tiers
//! - [`parser`]: recursive-descent AST builder
//! - [`safety`]: the single source of truth for sandboxing rules
//! - [`analysis`]: the `constant`/`toWatch` pass and program classification
//! - [`filter`]: the filter registry collaborator (`| name:arg`)
//! - [`compiler`]: AST to evaluator
//! - [`scope`]: the scope tree, digest scheduler, and event bus

#![warn(missing_docs)]

pub mod analysis;
pub mod ast;
pub mod compiler;
pub mod error;
pub mod filter;
pub mod lexer;
pub mod parser;
pub mod pratt;
pub mod safety;
pub mod scope;
pub mod value;

pub use compiler::{Compiler, CompiledExpr, WatchDelegate};
pub use error::{DigestError, EngineError, EvalError, LexError, ParseError, SafetyError, Span};
pub use filter::{Filter, FilterRegistry};
pub use scope::{ErrorSink, Scope};
pub use value::{Mapping, Value};

/// Compiles `source` against a fresh registry holding only the built-in
/// `filter` filter. Most hosts instead build their own [`FilterRegistry`]
/// up front and share it across many [`Compiler::compile`] calls; this is
/// a convenience for one-off evaluation.
pub fn compile(source: &str) -> Result<CompiledExpr, ParseError> {
    Compiler::new(std::rc::Rc::new(FilterRegistry::new())).compile(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_and_evaluates_a_literal_expression() {
        let expr = compile("2 + 3 * 5").unwrap();
        let root = Scope::new_root();
        assert_eq!(expr.eval(&root, None).unwrap().as_number(), Some(17.0));
    }
}
