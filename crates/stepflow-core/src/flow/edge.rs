use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{StepResult, StepStatus};

/// An edge connecting two nodes of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must hold to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse only if the source step succeeded.
    OnSuccess,
    /// Traverse only if the source step failed.
    OnFailure,
    /// Traverse if the expression matches the result fields.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
        }
    }

    /// Create an edge that fires on success.
    pub fn on_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnSuccess,
        }
    }

    /// Create an edge that fires on failure.
    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnFailure,
        }
    }

    /// Create a conditional edge.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Conditional { expr: expr.into() },
        }
    }

    pub fn is_unconditional(&self) -> bool {
        matches!(self.condition, EdgeCondition::Always)
    }

    /// Whether this edge fires for the given result.
    pub fn matches(&self, result: &StepResult) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => result.status == StepStatus::Succeeded,
            EdgeCondition::OnFailure => result.status == StepStatus::Failed,
            EdgeCondition::Conditional { expr } => {
                evaluate_condition(expr, &result.routing_fields())
            }
        }
    }
}

/// Evaluate a simple conditional expression against result fields.
///
/// Supported expressions:
/// - `key == "value"` (exact match)
/// - `key != "value"` (not equal)
/// - `key contains "substr"` (substring match)
///
/// Strings, booleans and numbers compare by their text form.
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return scalar(context, key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return scalar(context, key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return scalar(context, key).is_some_and(|s| s == value);
    }

    false
}

/// Check that an expression uses one of the supported operators.
pub fn is_well_formed(expr: &str) -> bool {
    let expr = expr.trim();
    ["contains", "!=", "=="]
        .iter()
        .any(|op| parse_operator(expr, op).is_some_and(|(key, _)| !key.is_empty()))
}

fn scalar(context: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    match context.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    Some((key.trim(), val.trim().trim_matches('"')))
}
