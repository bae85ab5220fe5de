use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};
use crate::flow::FlowGraph;
use crate::routing::RoutingDecision;
use crate::types::{
    EngineEvent, GraphStackFrame, Receipt, RunId, StepResult, TruncationReport,
};

/// Fixed vocabulary of journaled facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    RunStarted,
    RunPaused,
    RunResumed,
    RunStopping,
    RunStopped,
    RunCompleted,
    RunFailed,
    ContextSelected,
    StepStart,
    StepEnd,
    StepError,
    EngineEvent,
    ReceiptWritten,
    RouteDecision,
    RouteEscalated,
    StackPush,
    StackPop,
    StackOverflowPrevented,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        Self::RunCreated,
        Self::RunStarted,
        Self::RunPaused,
        Self::RunResumed,
        Self::RunStopping,
        Self::RunStopped,
        Self::RunCompleted,
        Self::RunFailed,
        Self::ContextSelected,
        Self::StepStart,
        Self::StepEnd,
        Self::StepError,
        Self::EngineEvent,
        Self::ReceiptWritten,
        Self::RouteDecision,
        Self::RouteEscalated,
        Self::StackPush,
        Self::StackPop,
        Self::StackOverflowPrevented,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::RunStarted => "run_started",
            Self::RunPaused => "run_paused",
            Self::RunResumed => "run_resumed",
            Self::RunStopping => "run_stopping",
            Self::RunStopped => "run_stopped",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::ContextSelected => "context_selected",
            Self::StepStart => "step_start",
            Self::StepEnd => "step_end",
            Self::StepError => "step_error",
            Self::EngineEvent => "engine_event",
            Self::ReceiptWritten => "receipt_written",
            Self::RouteDecision => "route_decision",
            Self::RouteEscalated => "route_escalated",
            Self::StackPush => "stack_push",
            Self::StackPop => "stack_pop",
            Self::StackOverflowPrevented => "stack_overflow_prevented",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable journaled fact. `sequence` is the ordering key within a run;
/// `timestamp` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl Event {
    /// Decode the payload into its typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            StepflowError::Journal(format!(
                "run {} event {} ({}): bad payload: {}",
                self.run_id, self.sequence, self.kind, e
            ))
        })
    }
}

/// `run_created`: pins the graph snapshot and run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCreated {
    pub graph: FlowGraph,
    pub entry: String,
    #[serde(default)]
    pub goal: Option<String>,
    pub engine: String,
    pub max_stack_depth: usize,
}

/// Lifecycle transitions that only carry a reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTransition {
    #[serde(default)]
    pub reason: Option<String>,
}

impl RunTransition {
    pub fn because(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSelected {
    pub node_id: String,
    pub step_seq: u64,
    pub report: TruncationReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStart {
    pub node_id: String,
    pub flow_id: String,
    pub step_seq: u64,
    pub iteration: u32,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEnd {
    pub node_id: String,
    pub flow_id: String,
    pub step_seq: u64,
    pub role: String,
    pub result: StepResult,
}

/// `step_error`: engine error, timeout, invalid or oversized result, or an
/// invocation interrupted by stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepErrorRecord {
    pub node_id: String,
    pub flow_id: String,
    pub step_seq: u64,
    pub role: String,
    pub error_kind: String,
    pub message: String,
    /// The invocation was abandoned by stop; the step will run again on resume.
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEventRecord {
    pub node_id: String,
    pub step_seq: u64,
    pub event: EngineEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptWritten {
    pub receipt: Receipt,
    pub path: String,
}

/// Microloop counter value after a decision. Zero means reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterUpdate {
    pub node_id: String,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecisionRecord {
    pub from_node: String,
    pub flow_id: String,
    pub step_seq: u64,
    pub decision: RoutingDecision,
    /// Node that runs next after all stack operations, `None` when the run completes.
    pub next_node: Option<String>,
    #[serde(default)]
    pub counter: Option<CounterUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEscalated {
    pub node_id: String,
    pub flow_id: String,
    pub error: String,
}

/// `stack_push`: carries the full graph entered so replay needs no catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackPush {
    pub frame: GraphStackFrame,
    pub graph: FlowGraph,
    pub entry: String,
    /// Where the parent frame resumes once this one pops.
    pub parent_resume_at: Option<String>,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackPop {
    pub flow_id: String,
    pub resume_at: Option<String>,
    pub depth_after: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackOverflowPrevented {
    pub attempted: String,
    pub depth: usize,
    pub max: usize,
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive every journaled event.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, payload: serde_json::Value) -> Event {
        Event {
            sequence: 1,
            run_id: RunId::from_string("r1"),
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(EventKind::parse("nope"), None);
    }

    #[test]
    fn test_decode_typed_payload() {
        let payload = serde_json::to_value(StackPop {
            flow_id: "sub".into(),
            resume_at: Some("next".into()),
            depth_after: 0,
        })
        .unwrap();
        let ev = event(EventKind::StackPop, payload);
        let pop: StackPop = ev.decode().unwrap();
        assert_eq!(pop.resume_at.as_deref(), Some("next"));
    }

    #[test]
    fn test_decode_bad_payload_is_journal_error() {
        let ev = event(EventKind::StackPop, serde_json::json!({"x": 1}));
        let err = ev.decode::<StackPop>().unwrap_err();
        assert_eq!(err.kind(), "journal");
    }

    #[tokio::test]
    async fn test_bus_fans_out() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(event(EventKind::RunStarted, serde_json::json!({})));
        assert_eq!(a.recv().await.unwrap().kind, EventKind::RunStarted);
        assert_eq!(b.recv().await.unwrap().kind, EventKind::RunStarted);
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(event(EventKind::RunStarted, serde_json::json!({})));
    }
}
