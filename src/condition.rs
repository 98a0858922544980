// src/condition.rs

//! Node guard evaluation.
//!
//! Expressions use minijinja's expression syntax and see two variables:
//! `up` (dependency id to result) and `params` (the node's params), e.g.
//! `up.fetch.status == 200 and params.mode != "dry"`.
//!
//! Evaluation is a convenience, not a sandbox. A malformed or failing
//! expression yields [`Evaluation::Failed`]; callers decide the fallback.

use std::sync::LazyLock;

use minijinja::{Environment, Value as MjValue, context};
use serde_json::{Map, Value};

use crate::dag::Condition;
use crate::types::Params;

static ENV: LazyLock<Environment<'static>> = LazyLock::new(Environment::new);

/// Outcome of a best-effort evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation<T> {
    Ok(T),
    Failed(String),
}

impl<T> Evaluation<T> {
    /// The evaluated value, or `fallback` if evaluation failed.
    pub fn unwrap_or(self, fallback: T) -> T {
        match self {
            Evaluation::Ok(v) => v,
            Evaluation::Failed(_) => fallback,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Evaluation::Failed(_))
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            Evaluation::Ok(_) => None,
            Evaluation::Failed(msg) => Some(msg),
        }
    }
}

/// Evaluate a node's condition. An absent condition is satisfied.
pub fn evaluate(
    condition: Option<&Condition>,
    upstream: &Map<String, Value>,
    params: &Params,
) -> Evaluation<bool> {
    match condition {
        None => Evaluation::Ok(true),
        Some(Condition::Bool(b)) => Evaluation::Ok(*b),
        Some(Condition::Expr(src)) => evaluate_expr(src, upstream, params),
    }
}

fn evaluate_expr(src: &str, upstream: &Map<String, Value>, params: &Params) -> Evaluation<bool> {
    let src = src.trim();
    if src.is_empty() {
        return Evaluation::Ok(true);
    }

    let expr = match ENV.compile_expression(src) {
        Ok(expr) => expr,
        Err(e) => return Evaluation::Failed(format!("invalid condition '{src}': {e}")),
    };

    let ctx = context! {
        up => MjValue::from_serialize(upstream),
        params => MjValue::from_serialize(params),
    };

    match expr.eval(ctx) {
        Ok(v) => Evaluation::Ok(v.is_true()),
        Err(e) => Evaluation::Failed(format!("evaluating condition '{src}': {e}")),
    }
}
