use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::Node;
use crate::routing::RoutingDecision;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    /// Completed and failed runs never execute again.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stopped and paused runs can be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier of a history item. Ordering is low < medium < high < critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// All tiers, highest first.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a prior step, as seen by later steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Journal sequence of the step_end event that produced this item.
    /// This is the chronological ordering key.
    pub sequence: u64,
    pub node_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Explicit tier; when absent the budget manager classifies by role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl HistoryItem {
    pub fn new(
        sequence: u64,
        node_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            node_id: node_id.into(),
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Size in characters (not bytes).
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Character budgets applied to history selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub total: usize,
    pub recent: usize,
    pub older: usize,
}

impl ContextBudget {
    pub fn new(total: usize, recent: usize, older: usize) -> Self {
        Self {
            total,
            recent,
            older,
        }
    }

    /// Apply an override on top of this budget.
    pub fn with_override(self, ov: Option<&BudgetOverride>) -> Self {
        match ov {
            Some(o) => Self {
                total: o.total_chars.unwrap_or(self.total),
                recent: o.recent_chars.unwrap_or(self.recent),
                older: o.older_chars.unwrap_or(self.older),
            },
            None => self,
        }
    }
}

/// Per-flow or per-node budget override. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetOverride {
    #[serde(default)]
    pub total_chars: Option<usize>,
    #[serde(default)]
    pub recent_chars: Option<usize>,
    #[serde(default)]
    pub older_chars: Option<usize>,
}

/// A history item as delivered to the step engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedItem {
    pub sequence: u64,
    pub node_id: String,
    pub role: String,
    pub priority: Priority,
    pub content: String,
    /// Characters in the original item.
    pub original_chars: usize,
    /// True if the content was clipped to its per-item cap.
    pub clipped: bool,
}

/// Observability record for one history selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TruncationReport {
    pub steps_included: usize,
    pub steps_total: usize,
    pub chars_used: usize,
    pub budget: Option<ContextBudget>,
    /// Any item omitted or clipped.
    pub truncated: bool,
    /// Sequences of items included but clipped to their cap.
    pub clipped: Vec<u64>,
    /// Sequences of items not included.
    pub omitted: Vec<u64>,
    /// Count of included items per tier.
    pub tiers: BTreeMap<Priority, usize>,
    pub note: String,
    /// Budget clamping and malformed-item warnings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Outcome status reported by a step engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Resource counters reported by the engine for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub calls: u32,
}

/// Result of one step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub summary: String,
    /// Text that becomes the history item for later steps.
    #[serde(default)]
    pub output: String,
    /// Structured fields consulted by routing (e.g. a verification verdict).
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub usage: ResourceUsage,
    /// Engine-proposed routing deviation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_override: Option<RoutingDecision>,
}

impl StepResult {
    pub fn succeeded(output: impl Into<String>) -> Self {
        let output = output.into();
        Self {
            status: StepStatus::Succeeded,
            summary: String::new(),
            output,
            fields: serde_json::Map::new(),
            duration_ms: 0,
            usage: ResourceUsage::default(),
            routing_override: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        let mut result = Self::succeeded(error.clone());
        result.status = StepStatus::Failed;
        result.summary = error;
        result
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_override(mut self, decision: RoutingDecision) -> Self {
        self.routing_override = Some(decision);
        self
    }

    /// Size counted against the result cap: summary, output, and fields.
    pub fn byte_size(&self) -> usize {
        let fields = serde_json::to_string(&self.fields)
            .map(|s| s.len())
            .unwrap_or(0);
        self.summary.len() + self.output.len() + fields
    }

    /// Fields as routing sees them. `status` is always present.
    pub fn routing_fields(&self) -> HashMap<String, serde_json::Value> {
        let mut map: HashMap<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert(
            "status".to_string(),
            serde_json::Value::String(self.status.as_str().to_string()),
        );
        map
    }

    /// Read a field as a string; numbers and booleans are stringified.
    pub fn field_str(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A single line of an engine transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl TranscriptEntry {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            detail: None,
        }
    }
}

/// A backend-specific fact emitted during a step, journaled as `engine_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Everything a step engine returns for one invocation.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub result: StepResult,
    pub events: Vec<EngineEvent>,
    pub transcript: Vec<TranscriptEntry>,
}

impl StepOutput {
    pub fn new(result: StepResult) -> Self {
        Self {
            result,
            events: vec![],
            transcript: vec![],
        }
    }
}

/// Input bundle for one step engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    pub run_id: RunId,
    pub flow_id: String,
    pub node_id: String,
    pub role: String,
    pub workers: Vec<String>,
    /// Step number within the run (1-based).
    pub step_seq: u64,
    /// Completed iterations of this node in the current frame.
    pub iteration: u32,
    /// Goal context inherited down the graph stack.
    #[serde(default)]
    pub goal: Option<String>,
    /// Flow and node teaching notes. Never truncated.
    #[serde(default)]
    pub teaching: Vec<String>,
    pub history: Vec<SelectedItem>,
    pub report: TruncationReport,
}

/// Durable record of one step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub engine: String,
    pub backend_id: String,
    pub step_id: String,
    pub step_seq: u64,
    pub flow_id: String,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: StepStatus,
    pub usage: ResourceUsage,
    #[serde(default)]
    pub transcript_reference: Option<String>,
}

/// One entry of a run's graph stack. Depth 0 is the root flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStackFrame {
    pub flow_id: String,
    pub flow_version: u32,
    /// Where execution resumes in this flow once the frame above it pops.
    #[serde(default)]
    pub paused_at_node: Option<String>,
    /// Microloop iteration counters, per node, scoped to this frame.
    #[serde(default)]
    pub iteration_counters: BTreeMap<String, u32>,
    #[serde(default)]
    pub inherited_goal_context: Option<String>,
    /// Nodes added to this frame by EXTEND_GRAPH decisions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Node>,
}

impl GraphStackFrame {
    pub fn new(flow_id: impl Into<String>, flow_version: u32) -> Self {
        Self {
            flow_id: flow_id.into(),
            flow_version,
            paused_at_node: None,
            iteration_counters: BTreeMap::new(),
            inherited_goal_context: None,
            extensions: vec![],
        }
    }

    pub fn with_goal(mut self, goal: Option<String>) -> Self {
        self.inherited_goal_context = goal;
        self
    }

    pub fn counter(&self, node_id: &str) -> u32 {
        self.iteration_counters.get(node_id).copied().unwrap_or(0)
    }
}
