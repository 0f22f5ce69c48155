//! reactor-eval - Evaluate an expression against a JSON context.
//!
//! A small demo/debugging CLI for the expression engine: reads an
//! expression (inline or from a file), an optional JSON context object,
//! evaluates it against a fresh root scope, and prints the result.
//!
//! # Usage
//!
//! ```bash
//! reactor-eval '2 + 3 * 5'
//! reactor-eval --context '{"a":42}' 'a === 42 ? "y" : "n"'
//! reactor-eval --file expr.txt --context-file context.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use reactive_core::scope::Scope;
use reactive_core::value::{Mapping, Value};
use std::path::PathBuf;
use std::process::ExitCode;

/// Evaluate an expression against a JSON context.
#[derive(Parser, Debug)]
#[command(name = "reactor-eval")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The expression text, unless --file is given.
    expression: Option<String>,

    /// Read the expression from a file instead of the command line.
    #[arg(long)]
    file: Option<PathBuf>,

    /// A JSON object literal used as the scope's initial properties.
    #[arg(long)]
    context: Option<String>,

    /// Read the JSON context from a file instead of --context.
    #[arg(long)]
    context_file: Option<PathBuf>,

    /// Print the compiled expression's metadata (constant/literal/delegate).
    #[arg(long)]
    explain: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let source = match (&args.expression, &args.file) {
        (Some(expr), None) => expr.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (Some(_), Some(_)) => anyhow::bail!("pass either an inline expression or --file, not both"),
        (None, None) => anyhow::bail!("an expression is required"),
    };

    let context_json = match (&args.context, &args.context_file) {
        (Some(raw), None) => Some(raw.clone()),
        (None, Some(path)) => Some(
            std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?,
        ),
        (Some(_), Some(_)) => anyhow::bail!("pass either --context or --context-file, not both"),
        (None, None) => None,
    };

    let root = Scope::new_root();
    if let Some(raw) = context_json {
        let parsed: serde_json::Value = serde_json::from_str(&raw).context("invalid JSON context")?;
        let mapping = json_to_mapping(&parsed)?;
        *root.properties().borrow_mut() = mapping;
    }

    let compiled = reactive_core::compile(&source).context("parse error")?;

    if args.explain {
        println!(
            "{} constant={} literal={} one_time={} delegate={:?}",
            "compiled:".bold(),
            compiled.is_constant,
            compiled.is_literal,
            compiled.is_one_time,
            compiled.watch_delegate
        );
    }

    let result = compiled.eval(&root, None).context("evaluation error")?;
    println!("{}", result.to_string().green());
    Ok(())
}

fn json_to_mapping(value: &serde_json::Value) -> Result<Mapping> {
    match value {
        serde_json::Value::Object(obj) => {
            let mut mapping = Mapping::new();
            for (k, v) in obj {
                mapping.insert(k.clone(), json_to_value(v));
            }
            Ok(mapping)
        }
        _ => anyhow::bail!("context must be a JSON object"),
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::string(s.clone()),
        serde_json::Value::Array(items) => Value::array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(obj) => {
            let mut mapping = Mapping::new();
            for (k, v) in obj {
                mapping.insert(k.clone(), json_to_value(v));
            }
            Value::object(mapping)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_nested_json_context() {
        let parsed: serde_json::Value = serde_json::from_str(r#"{"a":{"b":1}}"#).unwrap();
        let mapping = json_to_mapping(&parsed).unwrap();
        let Value::Object(b) = mapping.get("a").unwrap() else { panic!("expected object") };
        assert_eq!(b.borrow().get("b").unwrap().as_number(), Some(1.0));
    }
}
