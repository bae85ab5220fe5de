use serde::{Deserialize, Serialize};

use crate::types::{BudgetOverride, StepResult};

/// How the navigator treats a node once its step finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKind {
    /// Follow `next` or the outgoing edges.
    #[default]
    Linear,
    /// Repeat against `loop_target` until success, no-help, or the iteration cap.
    Microloop,
    /// Choose among rules and conditional edges.
    Branch,
}

/// Success predicate for a microloop: the named field equals one of the values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessPredicate {
    pub field: String,
    pub values: Vec<String>,
}

impl SuccessPredicate {
    pub fn new(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            values,
        }
    }

    /// Case-insensitive match of the result field against the configured values.
    pub fn matches(&self, result: &StepResult) -> bool {
        let actual = match self.field.as_str() {
            "status" => Some(result.status.as_str().to_string()),
            field => result.field_str(field),
        };
        actual.is_some_and(|v| {
            let v = v.trim();
            self.values.iter().any(|want| want.eq_ignore_ascii_case(v))
        })
    }
}

/// What a matching routing rule does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Continue to `target` inside the current flow.
    #[default]
    Continue,
    /// Detour to `target` inside the current flow.
    Detour,
    /// Inject the catalog flow named by `target`.
    InjectFlow,
}

/// Explicit conditional mapping from result fields to a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Condition expression, e.g. `verdict == "fail"`.
    pub when: String,
    /// Node id, or flow id for `inject_flow`.
    pub target: String,
    #[serde(default)]
    pub kind: RuleKind,
    /// Justification recorded with deviating rules.
    #[serde(default)]
    pub reason: Option<String>,
}

impl RoutingRule {
    pub fn continue_to(when: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            when: when.into(),
            target: target.into(),
            kind: RuleKind::Continue,
            reason: None,
        }
    }

    pub fn detour(
        when: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            when: when.into(),
            target: target.into(),
            kind: RuleKind::Detour,
            reason: Some(reason.into()),
        }
    }

    pub fn inject_flow(
        when: impl Into<String>,
        flow_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            when: when.into(),
            target: flow_id.into(),
            kind: RuleKind::InjectFlow,
            reason: Some(reason.into()),
        }
    }

    /// True when the target names a node in the same flow.
    pub fn targets_node(&self) -> bool {
        !matches!(self.kind, RuleKind::InjectFlow)
    }
}

/// A step in a flow.
///
/// A node carries the role whose worker executes it, how to route after it
/// finishes, and optional budget and timeout overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the flow.
    pub id: String,
    /// Producing role, used for history priority classification.
    pub role: String,
    /// Worker keys assigned to this step.
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default)]
    pub routing: RoutingKind,
    /// Default continuation.
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub loop_target: Option<String>,
    #[serde(default)]
    pub success: Option<SuccessPredicate>,
    /// Result field reporting whether another iteration can help.
    /// `false` or `"no"` exits the loop.
    #[serde(default)]
    pub can_help_field: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(default)]
    pub budgets: Option<BudgetOverride>,
    /// Instructional text delivered to the engine in full.
    #[serde(default)]
    pub teaching: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_max_iterations() -> u32 {
    3
}

impl Node {
    /// Create a linear node with minimal configuration.
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            workers: vec![],
            routing: RoutingKind::Linear,
            next: None,
            loop_target: None,
            success: None,
            can_help_field: None,
            max_iterations: default_max_iterations(),
            rules: vec![],
            budgets: None,
            teaching: None,
            timeout_secs: None,
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_workers(mut self, workers: Vec<String>) -> Self {
        self.workers = workers;
        self
    }

    /// Turn this node into a microloop against `loop_target`.
    pub fn microloop(mut self, loop_target: impl Into<String>, max_iterations: u32) -> Self {
        self.routing = RoutingKind::Microloop;
        self.loop_target = Some(loop_target.into());
        self.max_iterations = max_iterations;
        self
    }

    pub fn branch(mut self) -> Self {
        self.routing = RoutingKind::Branch;
        self
    }

    pub fn with_success(mut self, field: impl Into<String>, values: &[&str]) -> Self {
        self.success = Some(SuccessPredicate::new(
            field,
            values.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn with_can_help_field(mut self, field: impl Into<String>) -> Self {
        self.can_help_field = Some(field.into());
        self
    }

    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_budgets(mut self, budgets: BudgetOverride) -> Self {
        self.budgets = Some(budgets);
        self
    }

    pub fn with_teaching(mut self, teaching: impl Into<String>) -> Self {
        self.teaching = Some(teaching.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn is_microloop(&self) -> bool {
        self.routing == RoutingKind::Microloop
    }

    /// True when the result reports that another iteration cannot help.
    pub fn reports_no_help(&self, result: &StepResult) -> bool {
        let Some(field) = &self.can_help_field else {
            return false;
        };
        match result.fields.get(field) {
            Some(serde_json::Value::Bool(b)) => !b,
            Some(serde_json::Value::String(s)) => {
                let s = s.trim();
                s.eq_ignore_ascii_case("no") || s.eq_ignore_ascii_case("false")
            }
            _ => false,
        }
    }
}
