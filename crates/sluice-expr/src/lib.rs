//! # Sluice Expressions
//!
//! The rule language evaluated against records: boolean predicates for rule
//! conditions and value expressions for dynamic field mappings. The grammar
//! is small and fixed: literals, arithmetic, comparisons, logic, ternary,
//! null-coalescing, `row["field"]` access, and a closed set of methods,
//! compiled once per distinct source string and cached.
//!
//! ```
//! use sluice_core::schema::Schema;
//! use sluice_core::types::{FieldType, FieldValue};
//! use sluice_core::record::Record;
//! use sluice_expr::CompiledExpr;
//!
//! let schema = Schema::builder().field("age", FieldType::Int32).build().unwrap();
//! let mut buf = vec![0u8; schema.row_size()];
//! let mut record = Record::new(&mut buf, &schema);
//! record.set(0, FieldValue::Int32(21)).unwrap();
//!
//! let expr = CompiledExpr::compile(r#"row["age"] >= 18"#).unwrap();
//! assert!(expr.eval_bool(&record, 1).unwrap());
//! ```

mod eval;
pub mod lexer;
pub mod parser;
mod value;

pub use value::Value;

use parser::Expr;
use sluice_core::record::Record;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// An expression that failed to parse. Raised eagerly, at pipeline
/// construction.
#[derive(Debug, Clone, Error)]
#[error("{message} (at offset {position})")]
pub struct CompileError {
    pub position: usize,
    pub message: String,
}

impl CompileError {
    pub(crate) fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// A runtime evaluation failure, carrying the offending expression and the
/// record's line number.
#[derive(Debug, Clone, Error)]
#[error("expression `{expr}` failed on line {line}: {message}")]
pub struct EvalError {
    pub expr: String,
    pub line: u64,
    pub message: String,
}

/// A parsed expression, ready to evaluate any number of times.
#[derive(Debug)]
pub struct CompiledExpr {
    source: String,
    root: Expr,
}

impl CompiledExpr {
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let root = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one record. `line` is the record's source line,
    /// reported on failure.
    pub fn eval(&self, record: &Record<'_>, line: u64) -> Result<Value, EvalError> {
        eval::eval(&self.root, record).map_err(|message| EvalError {
            expr: self.source.clone(),
            line,
            message,
        })
    }

    /// Evaluate as a predicate. Anything but a boolean is an invalid
    /// condition.
    pub fn eval_bool(&self, record: &Record<'_>, line: u64) -> Result<bool, EvalError> {
        match self.eval(record, line)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError {
                expr: self.source.clone(),
                line,
                message: format!("invalid condition: expected a boolean, got {}", other.kind()),
            }),
        }
    }
}

/// Concurrency-safe cache of compiled expressions, keyed by source string.
#[derive(Debug, Default)]
pub struct ExprCache {
    map: RwLock<HashMap<String, Arc<CompiledExpr>>>,
}

impl ExprCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the compiled form of `source`, compiling at most once per
    /// distinct string.
    pub fn get_or_compile(&self, source: &str) -> Result<Arc<CompiledExpr>, CompileError> {
        if let Some(found) = self.map.read().expect("expression cache poisoned").get(source) {
            return Ok(Arc::clone(found));
        }
        let compiled = Arc::new(CompiledExpr::compile(source)?);
        let mut map = self.map.write().expect("expression cache poisoned");
        // A racing compile of the same source wins or loses harmlessly.
        let entry = map
            .entry(source.to_string())
            .or_insert_with(|| Arc::clone(&compiled));
        Ok(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("expression cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
