use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stepflow_core::error::Result;
use stepflow_core::event::{
    Event, EventKind, ReceiptWritten, RouteDecisionRecord, RouteEscalated, RunCreated,
    RunTransition, StackPop, StackPush, StepEnd, StepErrorRecord, StepStart,
};
use stepflow_core::types::RunStatus;

pub const STEP_RUNNING: &str = "running";
pub const STEP_INTERRUPTED: &str = "interrupted";

/// Projected summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: String,
    pub flow_id: String,
    pub flow_version: u32,
    pub status: RunStatus,
    pub current_node: Option<String>,
    pub depth: usize,
    pub steps_completed: u64,
    pub created_at: String,
    pub updated_at: String,
    pub last_sequence: u64,
    pub error: Option<String>,
}

/// Projected state of one step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRow {
    pub run_id: String,
    pub step_seq: u64,
    pub node_id: String,
    pub flow_id: String,
    /// `running`, `succeeded`, `failed`, `skipped`, `error`, or `interrupted`.
    pub status: String,
    pub started_sequence: Option<u64>,
    pub ended_sequence: Option<u64>,
    pub summary: Option<String>,
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRow {
    pub run_id: String,
    pub sequence: u64,
    pub step_seq: u64,
    pub from_node: String,
    pub flow_id: String,
    pub kind: String,
    pub target: Option<String>,
    pub source: String,
    pub justification: Option<String>,
    pub evidence: Vec<String>,
    pub resulting_depth: usize,
    pub next_node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRow {
    pub run_id: String,
    pub step_seq: u64,
    pub step_id: String,
    pub engine: String,
    pub backend_id: String,
    pub status: String,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub path: String,
}

/// Everything the projection holds about one run.
///
/// Built only by folding journal events, so replaying the same journal
/// always yields the same projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProjection {
    pub run: Option<RunRow>,
    pub steps: BTreeMap<u64, StepRow>,
    pub decisions: Vec<DecisionRow>,
    pub receipts: Vec<ReceiptRow>,
}

impl RunProjection {
    pub fn from_events(events: &[Event]) -> Result<Self> {
        let mut projection = Self::default();
        for event in events {
            projection.apply(event)?;
        }
        Ok(projection)
    }

    /// Continue from an already-projected run row.
    pub fn resume_from(run: Option<RunRow>) -> Self {
        Self {
            run,
            ..Self::default()
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.run.as_ref().map_or(0, |r| r.last_sequence)
    }

    pub fn apply(&mut self, event: &Event) -> Result<()> {
        let ts = event.timestamp.to_rfc3339();
        let run_id = event.run_id.to_string();

        if event.kind == EventKind::RunCreated {
            let created: RunCreated = event.decode()?;
            self.run = Some(RunRow {
                run_id: run_id.clone(),
                flow_id: created.graph.id,
                flow_version: created.graph.version,
                status: RunStatus::Running,
                current_node: Some(created.entry),
                depth: 0,
                steps_completed: 0,
                created_at: ts.clone(),
                updated_at: ts.clone(),
                last_sequence: event.sequence,
                error: None,
            });
            return Ok(());
        }

        // Events before run_created carry nothing to project.
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        run.last_sequence = event.sequence;
        run.updated_at = ts;

        match event.kind {
            EventKind::RunStarted | EventKind::RunResumed => run.status = RunStatus::Running,
            EventKind::RunPaused => run.status = RunStatus::Paused,
            EventKind::RunStopping => run.status = RunStatus::Stopping,
            EventKind::RunStopped => run.status = RunStatus::Stopped,
            EventKind::RunCompleted => {
                run.status = RunStatus::Completed;
                run.current_node = None;
            }
            EventKind::RunFailed => {
                let t: RunTransition = event.decode()?;
                run.status = RunStatus::Failed;
                if t.reason.is_some() {
                    run.error = t.reason;
                }
            }
            EventKind::StepStart => {
                let s: StepStart = event.decode()?;
                run.current_node = Some(s.node_id.clone());
                run.depth = s.depth;
                // An earlier step still running never finished: the process died.
                for (_, row) in self.steps.range_mut(..s.step_seq) {
                    if row.status == STEP_RUNNING {
                        row.status = STEP_INTERRUPTED.into();
                    }
                }
                self.steps.insert(
                    s.step_seq,
                    StepRow {
                        run_id,
                        step_seq: s.step_seq,
                        node_id: s.node_id,
                        flow_id: s.flow_id,
                        status: STEP_RUNNING.into(),
                        started_sequence: Some(event.sequence),
                        ended_sequence: None,
                        summary: None,
                        error_kind: None,
                    },
                );
            }
            EventKind::StepEnd => {
                let s: StepEnd = event.decode()?;
                run.steps_completed += 1;
                let row = step_row(&mut self.steps, &run_id, s.step_seq, &s.node_id, &s.flow_id);
                row.status = s.result.status.as_str().to_string();
                row.ended_sequence = Some(event.sequence);
                row.summary = Some(s.result.summary);
            }
            EventKind::StepError => {
                let s: StepErrorRecord = event.decode()?;
                if !s.interrupted {
                    run.steps_completed += 1;
                }
                let row = step_row(&mut self.steps, &run_id, s.step_seq, &s.node_id, &s.flow_id);
                row.status = if s.interrupted { STEP_INTERRUPTED } else { "error" }.to_string();
                row.ended_sequence = Some(event.sequence);
                row.summary = Some(s.message);
                row.error_kind = Some(s.error_kind);
            }
            EventKind::ReceiptWritten => {
                let r: ReceiptWritten = event.decode()?;
                self.receipts.push(ReceiptRow {
                    run_id,
                    step_seq: r.receipt.step_seq,
                    step_id: r.receipt.step_id,
                    engine: r.receipt.engine,
                    backend_id: r.receipt.backend_id,
                    status: r.receipt.status.as_str().to_string(),
                    duration_ms: r.receipt.duration_ms,
                    input_tokens: r.receipt.usage.input_tokens,
                    output_tokens: r.receipt.usage.output_tokens,
                    path: r.path,
                });
            }
            EventKind::RouteDecision => {
                let d: RouteDecisionRecord = event.decode()?;
                run.current_node = d.next_node.clone();
                self.decisions.push(DecisionRow {
                    run_id,
                    sequence: event.sequence,
                    step_seq: d.step_seq,
                    from_node: d.from_node,
                    flow_id: d.flow_id,
                    kind: d.decision.kind.as_str().to_string(),
                    target: d.decision.target,
                    source: d.decision.source.as_str().to_string(),
                    justification: d.decision.justification,
                    evidence: d.decision.evidence,
                    resulting_depth: d.decision.resulting_stack_depth,
                    next_node: d.next_node,
                });
            }
            EventKind::RouteEscalated => {
                let e: RouteEscalated = event.decode()?;
                run.error = Some(e.error);
            }
            EventKind::StackPush => {
                let p: StackPush = event.decode()?;
                run.depth = p.depth;
                run.current_node = Some(p.entry);
            }
            EventKind::StackPop => {
                let p: StackPop = event.decode()?;
                run.depth = p.depth_after;
                run.current_node = p.resume_at;
            }
            EventKind::RunCreated
            | EventKind::ContextSelected
            | EventKind::EngineEvent
            | EventKind::StackOverflowPrevented => {}
        }
        Ok(())
    }
}

/// Row for a step whose start may have been projected in an earlier pass.
fn step_row<'a>(
    steps: &'a mut BTreeMap<u64, StepRow>,
    run_id: &str,
    step_seq: u64,
    node_id: &str,
    flow_id: &str,
) -> &'a mut StepRow {
    steps.entry(step_seq).or_insert_with(|| StepRow {
        run_id: run_id.to_string(),
        step_seq,
        node_id: node_id.to_string(),
        flow_id: flow_id.to_string(),
        status: STEP_RUNNING.into(),
        started_sequence: None,
        ended_sequence: None,
        summary: None,
        error_kind: None,
    })
}
