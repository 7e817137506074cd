//! Restricted expression language for rule conditions.
//!
//! Conditions are parsed once into an AST and evaluated against a read-only
//! view of the snapshot. The only things reachable from an expression are the
//! snapshot, the rule itself, the evaluation instant and a handful of lookup
//! helpers; there is no way to reach the process, filesystem or network.

mod interp;
mod lexer;
mod parser;
mod value;

use crate::metrics::Metrics;
use crate::rules::Rule;
use crate::state::StateSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use parser::{parse, Expr};
use value::Value;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected character {ch:?} at {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unterminated string starting at {pos}")]
    UnterminatedString { pos: usize },
    #[error("invalid number at {pos}")]
    InvalidNumber { pos: usize },
    #[error("unexpected {found} at {pos}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        pos: usize,
    },
    #[error("expression nested deeper than {limit} levels")]
    TooDeep { limit: usize },
    #[error("expression longer than {limit} tokens")]
    TooLong { limit: usize },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("{0} is not defined")]
    UnknownIdentifier(String),
    #[error("{0} is not a function")]
    UnknownFunction(String),
    #[error("helper {0} must be called")]
    HelperNotCalled(String),
    #[error("cannot read property '{property}' of null")]
    NullMember { property: String },
    #[error("{method} is not a method of {receiver}")]
    UnknownMethod {
        method: String,
        receiver: &'static str,
    },
    #[error("{0} expects an arrow function argument")]
    ExpectedCallback(String),
    #[error("value of type {0} is not callable")]
    NotCallable(&'static str),
    #[error("arrow functions can only be passed to array methods")]
    BareLambda,
    #[error("callbacks nested too deeply")]
    TooDeep,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("evaluation error: {0}")]
    Eval(#[from] EvalError),
}

/// Snapshot converted once per pass into the language's value model.
pub struct SnapshotView {
    state: Value,
    now_ms: i64,
}

impl SnapshotView {
    pub fn new(snapshot: &StateSnapshot, now_ms: i64) -> Self {
        let state = match serde_json::to_value(snapshot) {
            Ok(json) => Value::from_json(&json),
            Err(err) => {
                warn!(error = %err, "snapshot could not be converted, evaluating against an empty state");
                Value::Null
            }
        };
        Self { state, now_ms }
    }
}

/// Compiles conditions on first use and caches the AST by source text.
#[derive(Default)]
pub struct ConditionEvaluator {
    compiled: HashMap<String, Result<Arc<Expr>, ParseError>>,
    metrics: Option<Arc<Metrics>>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether the rule's condition holds. Never fails: any parse or
    /// evaluation error is logged and counts as `false`.
    pub fn evaluate(&mut self, rule: &Rule, view: &SnapshotView) -> bool {
        match self.try_evaluate(rule, view) {
            Ok(result) => result,
            Err(err) => {
                warn!(rule_id = %rule.id, condition = %rule.condition, error = %err, "rule evaluation error");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_condition_error(&rule.id);
                }
                false
            }
        }
    }

    fn try_evaluate(&mut self, rule: &Rule, view: &SnapshotView) -> Result<bool, ConditionError> {
        let expr = self.compile(&rule.condition)?;
        let rule_value = serde_json::to_value(rule)
            .map(|json| Value::from_json(&json))
            .unwrap_or_default();
        let ctx = interp::Context {
            state: &view.state,
            rule: &rule_value,
            now_ms: view.now_ms,
        };
        let value = interp::Interpreter::new(&ctx).eval(&expr)?;
        Ok(value.truthy())
    }

    fn compile(&mut self, condition: &str) -> Result<Arc<Expr>, ParseError> {
        self.compiled
            .entry(condition.to_string())
            .or_insert_with(|| parse(condition).map(Arc::new))
            .clone()
    }
}

/// Parses a condition without evaluating it; used for config linting.
pub fn check_syntax(condition: &str) -> Result<(), ParseError> {
    parse(condition).map(|_| ())
}
