use std::sync::Arc;

use chrono::{DateTime, Utc};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::{
    Event, EventKind, ReceiptWritten, RouteDecisionRecord, RouteEscalated, RunCreated,
    RunTransition, StackPop, StackPush, StepEnd, StepErrorRecord, StepStart,
};
use stepflow_core::routing::DecisionKind;
use stepflow_core::types::{HistoryItem, RunId, RunStatus, StepResult};

use crate::navigator::GraphStack;

/// A step whose result is journaled but whose routing decision is not.
#[derive(Debug, Clone)]
pub struct UnroutedStep {
    pub node_id: String,
    pub flow_id: String,
    pub step_seq: u64,
    pub result: StepResult,
    /// Sequence of the `step_end` or `step_error` event.
    pub end_sequence: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Receipt path relative to the run directory, once journaled.
    pub receipt_path: Option<String>,
}

/// In-memory state of one run.
///
/// Only ever changed by applying journaled events, so replaying a run's
/// journal reconstructs it exactly.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub stack: GraphStack,
    /// Node that runs next. `None` once the run has completed.
    pub current_node: Option<String>,
    pub goal: Option<String>,
    pub engine: String,
    pub history: Vec<HistoryItem>,
    /// Highest step sequence started so far.
    pub steps_started: u64,
    pub step_started_at: Option<DateTime<Utc>>,
    pub unrouted: Option<UnroutedStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sequence: u64,
    pub error: Option<String>,
}

impl RunState {
    /// Initial state from a `run_created` event.
    pub fn created(event: &Event) -> Result<Self> {
        if event.kind != EventKind::RunCreated {
            return Err(StepflowError::Journal(format!(
                "run {} starts with {} instead of run_created",
                event.run_id, event.kind
            )));
        }
        let created: RunCreated = event.decode()?;
        Ok(Self {
            run_id: event.run_id.clone(),
            status: RunStatus::Running,
            stack: GraphStack::new(
                Arc::new(created.graph),
                created.goal.clone(),
                created.max_stack_depth,
            ),
            current_node: Some(created.entry),
            goal: created.goal,
            engine: created.engine,
            history: vec![],
            steps_started: 0,
            step_started_at: None,
            unrouted: None,
            created_at: event.timestamp,
            updated_at: event.timestamp,
            last_sequence: event.sequence,
            error: None,
        })
    }

    /// Rebuild a run from its full journal.
    pub fn replay(events: &[Event]) -> Result<Self> {
        let (first, rest) = events
            .split_first()
            .ok_or_else(|| StepflowError::Journal("cannot replay an empty journal".into()))?;
        let mut state = Self::created(first)?;
        for event in rest {
            state.apply(event)?;
        }
        Ok(state)
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn apply(&mut self, event: &Event) -> Result<()> {
        if event.sequence <= self.last_sequence {
            return Err(StepflowError::Journal(format!(
                "run {} event {} applied after {}",
                self.run_id, event.sequence, self.last_sequence
            )));
        }
        self.last_sequence = event.sequence;
        self.updated_at = event.timestamp;

        match event.kind {
            EventKind::RunStarted | EventKind::RunResumed => self.status = RunStatus::Running,
            EventKind::RunPaused => self.status = RunStatus::Paused,
            EventKind::RunStopping => self.status = RunStatus::Stopping,
            EventKind::RunStopped => self.status = RunStatus::Stopped,
            EventKind::RunCompleted => {
                self.status = RunStatus::Completed;
                self.current_node = None;
            }
            EventKind::RunFailed => {
                let t: RunTransition = event.decode()?;
                self.status = RunStatus::Failed;
                self.unrouted = None;
                if t.reason.is_some() {
                    self.error = t.reason;
                }
            }
            EventKind::StepStart => {
                let s: StepStart = event.decode()?;
                self.steps_started = self.steps_started.max(s.step_seq);
                self.step_started_at = Some(event.timestamp);
                self.unrouted = None;
                self.current_node = Some(s.node_id);
            }
            EventKind::StepEnd => {
                let s: StepEnd = event.decode()?;
                self.finish_step(event, &s.node_id, &s.flow_id, s.step_seq, s.result.clone());
                self.history.push(HistoryItem {
                    sequence: event.sequence,
                    node_id: s.node_id,
                    role: s.role,
                    content: s.result.output,
                    timestamp: event.timestamp,
                    priority: None,
                });
            }
            EventKind::StepError => {
                let s: StepErrorRecord = event.decode()?;
                if !s.interrupted {
                    let failed = StepResult::failed(s.message.clone());
                    self.finish_step(event, &s.node_id, &s.flow_id, s.step_seq, failed);
                    self.history.push(HistoryItem {
                        sequence: event.sequence,
                        node_id: s.node_id,
                        role: s.role,
                        content: format!("step failed ({}): {}", s.error_kind, s.message),
                        timestamp: event.timestamp,
                        priority: None,
                    });
                }
            }
            EventKind::RouteDecision => {
                let d: RouteDecisionRecord = event.decode()?;
                let frame = self.stack.top_mut();
                if let Some(counter) = d.counter {
                    if counter.value == 0 {
                        frame.iteration_counters.remove(&counter.node_id);
                    } else {
                        frame.iteration_counters.insert(counter.node_id, counter.value);
                    }
                }
                if d.decision.kind == DecisionKind::ExtendGraph {
                    frame.extensions.extend(d.decision.nodes);
                }
                self.current_node = d.next_node;
                self.unrouted = None;
            }
            EventKind::RouteEscalated => {
                let e: RouteEscalated = event.decode()?;
                self.error = Some(e.error);
                self.unrouted = None;
            }
            EventKind::ReceiptWritten => {
                let r: ReceiptWritten = event.decode()?;
                if let Some(step) = &mut self.unrouted {
                    if step.step_seq == r.receipt.step_seq {
                        step.receipt_path = Some(r.path);
                    }
                }
            }
            EventKind::StackPush => {
                let p: StackPush = event.decode()?;
                self.stack.top_mut().paused_at_node = p.parent_resume_at;
                self.stack
                    .push(p.frame, Arc::new(p.graph))
                    .map_err(|e| StepflowError::Journal(format!("event {}: {}", event.sequence, e)))?;
                self.current_node = Some(p.entry);
            }
            EventKind::StackPop => {
                let p: StackPop = event.decode()?;
                if self.stack.pop().is_none() {
                    return Err(StepflowError::Journal(format!(
                        "event {}: stack_pop at the root flow",
                        event.sequence
                    )));
                }
                self.stack.top_mut().paused_at_node = None;
                self.current_node = p.resume_at;
            }
            EventKind::RunCreated => {
                return Err(StepflowError::Journal(format!(
                    "run {} has a second run_created at {}",
                    self.run_id, event.sequence
                )));
            }
            EventKind::ContextSelected
            | EventKind::EngineEvent
            | EventKind::StackOverflowPrevented => {}
        }
        Ok(())
    }

    fn finish_step(
        &mut self,
        event: &Event,
        node_id: &str,
        flow_id: &str,
        step_seq: u64,
        result: StepResult,
    ) {
        self.unrouted = Some(UnroutedStep {
            node_id: node_id.to_string(),
            flow_id: flow_id.to_string(),
            step_seq,
            result,
            end_sequence: event.sequence,
            started_at: self.step_started_at.unwrap_or(event.timestamp),
            completed_at: event.timestamp,
            receipt_path: None,
        });
    }
}
