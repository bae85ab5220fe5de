//! Shared mocks and fixtures for Stepflow tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use stepflow_core::config::AppConfig;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::{Event, EventKind};
use stepflow_core::flow::{FlowGraph, Node};
use stepflow_core::traits::{Journal, StepEngine};
use stepflow_core::types::{
    EngineEvent, HistoryItem, RunId, StepContext, StepOutput, StepResult, TranscriptEntry,
};

/// One scripted engine response.
#[derive(Debug, Clone)]
pub struct Reply {
    output: std::result::Result<StepOutput, String>,
    delay: Duration,
    honor_cancel: bool,
}

impl Reply {
    pub fn ok(output: impl Into<String>) -> Self {
        Self::result(StepResult::succeeded(output))
    }

    pub fn result(result: StepResult) -> Self {
        Self {
            output: Ok(StepOutput::new(result)),
            delay: Duration::ZERO,
            honor_cancel: true,
        }
    }

    /// The engine call itself fails.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: Err(message.into()),
            delay: Duration::ZERO,
            honor_cancel: true,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep sleeping through a stop request.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn with_event(mut self, kind: &str, payload: serde_json::Value) -> Self {
        if let Ok(out) = &mut self.output {
            out.events.push(EngineEvent {
                kind: kind.to_string(),
                payload,
            });
        }
        self
    }

    pub fn with_transcript(mut self, role: &str, content: &str) -> Self {
        if let Ok(out) = &mut self.output {
            out.transcript.push(TranscriptEntry::new(role, content));
        }
        self
    }
}

/// A step engine that replays canned replies per node.
///
/// Queued replies for a node are used first, then its sticky reply, then a
/// default success whose output names the node.
pub struct ScriptedEngine {
    name: String,
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    sticky: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<StepContext>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            queued: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            calls: Mutex::new(vec![]),
        }
    }

    /// Queue a one-shot reply for a node.
    pub fn on(self, node_id: &str, reply: Reply) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(node_id.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used for a node whenever its queue is empty.
    pub fn always(self, node_id: &str, reply: Reply) -> Self {
        self.sticky
            .lock()
            .unwrap()
            .insert(node_id.to_string(), reply);
        self
    }

    pub fn calls(&self) -> Vec<StepContext> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.node_id == node_id)
            .count()
    }

    fn next_reply(&self, node_id: &str) -> Reply {
        if let Some(reply) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(node_id)
            .and_then(|q| q.pop_front())
        {
            return reply;
        }
        if let Some(reply) = self.sticky.lock().unwrap().get(node_id) {
            return reply.clone();
        }
        Reply::ok(format!("{} done", node_id))
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StepEngine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_id(&self) -> &str {
        "scripted-v1"
    }

    fn run_step(
        &self,
        ctx: StepContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<StepOutput>> {
        let reply = self.next_reply(&ctx.node_id);
        self.calls.lock().unwrap().push(ctx);
        Box::pin(async move {
            if !reply.delay.is_zero() {
                if reply.honor_cancel {
                    tokio::select! {
                        _ = tokio::time::sleep(reply.delay) => {}
                        _ = cancel.cancelled() => return Err(StepflowError::Cancelled),
                    }
                } else {
                    tokio::time::sleep(reply.delay).await;
                }
            }
            reply.output.map_err(StepflowError::Engine)
        })
    }
}

/// Journal wrapper whose appends start failing after a set number succeed.
pub struct FailingJournal {
    inner: Arc<dyn Journal>,
    remaining: AtomicUsize,
}

impl FailingJournal {
    pub fn new(inner: Arc<dyn Journal>, successful_appends: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(successful_appends),
        }
    }
}

impl Journal for FailingJournal {
    fn append(&self, run_id: &RunId, kind: EventKind, payload: serde_json::Value) -> Result<Event> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StepflowError::Journal(format!("disk full while appending {}", kind)));
        }
        self.inner.append(run_id, kind, payload)
    }

    fn read_all(&self, run_id: &RunId) -> Result<Vec<Event>> {
        self.inner.read_all(run_id)
    }

    fn read_since(&self, run_id: &RunId, after: u64) -> Result<Vec<Event>> {
        self.inner.read_since(run_id, after)
    }

    fn head(&self, run_id: &RunId) -> Result<u64> {
        self.inner.head(run_id)
    }

    fn run_ids(&self) -> Result<Vec<RunId>> {
        self.inner.run_ids()
    }
}

/// Config rooted in a temp directory, with short stop grace for tests.
pub fn test_config(dir: &Path) -> AppConfig {
    let toml = format!(
        r#"
[orchestrator]
step_timeout_secs = 5
stop_grace_secs = 1

[storage]
data_dir = "{}"
"#,
        dir.display()
    );
    AppConfig::from_toml_str(&toml).unwrap()
}

/// author -> critic -> publisher
pub fn linear_flow(id: &str) -> FlowGraph {
    FlowGraph::linear(
        id,
        vec![
            Node::new("draft", "author"),
            Node::new("critique", "critic"),
            Node::new("publish", "publisher"),
        ],
    )
}

/// draft <-> critique microloop, then publish.
pub fn review_loop_flow(max_iterations: u32) -> FlowGraph {
    FlowGraph::linear(
        "review",
        vec![
            Node::new("draft", "author"),
            Node::new("critique", "critic")
                .microloop("draft", max_iterations)
                .with_success("verdict", &["approved"])
                .with_can_help_field("can_further_iteration_help"),
            Node::new("publish", "publisher"),
        ],
    )
}

/// A history item with `chars` characters of content.
pub fn history_item(sequence: u64, role: &str, chars: usize) -> HistoryItem {
    HistoryItem {
        sequence,
        node_id: format!("n{}", sequence),
        role: role.to_string(),
        content: "x".repeat(chars),
        timestamp: Utc::now(),
        priority: None,
    }
}

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}
