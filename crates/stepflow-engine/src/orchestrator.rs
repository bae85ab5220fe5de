//! Run lifecycle: create, advance, start, stop, pause, resume and recover.
//!
//! Every state change is journaled before it is applied. The orchestrator
//! appends an event, folds it into the run's [`RunState`], and only then
//! publishes it on the event bus. A failed append is fatal to the run.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepflow_core::config::{AppConfig, OrchestratorConfig};
use stepflow_core::error::{Result, RoutingError, StepflowError};
use stepflow_core::event::{
    ContextSelected, EngineEventRecord, Event, EventBus, EventKind, ReceiptWritten,
    RouteDecisionRecord, RouteEscalated, RunCreated, RunTransition, StackOverflowPrevented,
    StepEnd, StepErrorRecord, StepStart,
};
use stepflow_core::flow::FlowGraph;
use stepflow_core::routing::{DecisionSource, RoutingDecision};
use stepflow_core::traits::{Journal, StepEngine};
use stepflow_core::types::{
    ContextBudget, Receipt, RunId, RunStatus, StepContext, StepOutput, StepResult,
};
use stepflow_journal::{ArtifactStore, ProjectionStore, SqliteJournal};

use crate::budget::ContextBudgetManager;
use crate::catalog::FlowCatalog;
use crate::navigator::{Escalation, Navigator, StepFacts};
use crate::registry::{RunHandle, RunRegistry};
use crate::state::{RunState, UnroutedStep};

/// Parameters for a new run.
pub struct RunParams {
    pub engine: Arc<dyn StepEngine>,
    pub goal: Option<String>,
    pub run_id: Option<RunId>,
}

impl RunParams {
    pub fn new(engine: Arc<dyn StepEngine>) -> Self {
        Self {
            engine,
            goal: None,
            run_id: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// What a single `advance` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A step ran and the run moves on to `next_node`.
    Advanced { node_id: String, next_node: String },
    Completed,
    Paused,
    Stopped,
    Failed { error: String },
}

impl StepOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Advanced { .. })
    }
}

/// Wires the orchestrator's collaborators together. Anything not supplied
/// is built from the config.
pub struct OrchestratorBuilder {
    config: AppConfig,
    journal: Option<Arc<dyn Journal>>,
    artifacts: Option<ArtifactStore>,
    catalog: Option<Arc<FlowCatalog>>,
    projection: Option<Arc<ProjectionStore>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            journal: None,
            artifacts: None,
            catalog: None,
            projection: None,
        }
    }

    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn catalog(mut self, catalog: Arc<FlowCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn projection(mut self, projection: Arc<ProjectionStore>) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let journal: Arc<dyn Journal> = match self.journal {
            Some(j) => j,
            None => Arc::new(SqliteJournal::open(&self.config.storage.journal_path())?),
        };
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| ArtifactStore::new(self.config.storage.runs_path()));
        let catalog = self.catalog.unwrap_or_default();

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                budget: ContextBudgetManager::from_config(&self.config)?,
                base_budget: self.config.budget.budget(),
                navigator: Navigator::new(catalog.clone()),
                bus: EventBus::new(self.config.orchestrator.event_bus_capacity),
                config: self.config.orchestrator,
                journal,
                artifacts,
                catalog,
                projection: self.projection,
                runs: RunRegistry::new(),
            }),
        })
    }
}

/// The run orchestrator. Cheap to clone; clones share every run.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    budget: ContextBudgetManager,
    base_budget: ContextBudget,
    journal: Arc<dyn Journal>,
    artifacts: ArtifactStore,
    catalog: Arc<FlowCatalog>,
    projection: Option<Arc<ProjectionStore>>,
    navigator: Navigator,
    runs: RunRegistry,
    bus: EventBus,
}

enum Invocation {
    Finished(Result<StepOutput>),
    /// Abandoned by stop: the engine gave up or the grace period ran out.
    Interrupted,
}

impl Orchestrator {
    pub fn builder(config: AppConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn catalog(&self) -> &Arc<FlowCatalog> {
        &self.inner.catalog
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.inner.journal
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    pub fn projection(&self) -> Option<&Arc<ProjectionStore>> {
        self.inner.projection.as_ref()
    }

    /// Every journaled event, as it is appended.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    pub fn runs(&self) -> Vec<RunId> {
        self.inner.runs.ids()
    }

    /// Pin a validated graph to a new run. The run starts out `running`
    /// at the graph's entry node, but nothing executes until it is advanced
    /// or started.
    pub async fn create_run(&self, graph: Arc<FlowGraph>, params: RunParams) -> Result<RunId> {
        graph.validate()?;
        let entry = graph
            .entry_node()
            .ok_or_else(|| StepflowError::InvalidFlow {
                flow_id: graph.id.clone(),
                problems: vec!["flow has no entry node".into()],
            })?
            .to_string();

        let run_id = params.run_id.unwrap_or_default();
        if self.inner.runs.get(&run_id).is_some() || self.inner.journal.head(&run_id)? > 0 {
            return Err(StepflowError::InvalidState {
                run_id: run_id.to_string(),
                status: "existing".into(),
                action: "be created again".into(),
            });
        }

        let payload = RunCreated {
            graph: graph.as_ref().clone(),
            entry,
            goal: params.goal,
            engine: params.engine.name().to_string(),
            max_stack_depth: self.inner.config.max_stack_depth,
        };
        let event = self.inner.journal.append(
            &run_id,
            EventKind::RunCreated,
            serde_json::to_value(&payload)?,
        )?;
        let state = RunState::created(&event)?;
        self.inner
            .runs
            .insert(Arc::new(RunHandle::new(state, params.engine)));
        self.inner.bus.publish(event);
        self.inner.sync_projection(&run_id);

        info!(run_id = %run_id, flow_id = %graph.id, version = graph.version, "Run created");
        Ok(run_id)
    }

    /// Execute exactly one step of a running run.
    pub async fn advance(&self, run_id: &RunId) -> Result<StepOutcome> {
        let handle = self.handle(run_id)?;
        let mut state = handle.state.lock().await;
        self.inner.advance_locked(&handle, &mut state).await
    }

    /// Drive the run in the background until it completes, fails, pauses or
    /// stops.
    pub async fn start(&self, run_id: &RunId) -> Result<()> {
        let handle = self.handle(run_id)?;
        if handle.is_driving() {
            return Ok(());
        }
        {
            let mut state = handle.state.lock().await;
            if state.status != RunStatus::Running {
                return Err(invalid_state(&state, "start"));
            }
            self.inner.record(
                &handle,
                &mut state,
                EventKind::RunStarted,
                &RunTransition::default(),
            )?;
        }
        info!(run_id = %run_id, "Run started");
        self.spawn_worker(handle);
        Ok(())
    }

    /// Request a stop and return immediately.
    ///
    /// An in-flight step gets the configured grace period to finish; after
    /// that it is abandoned and will run again on resume.
    pub async fn stop(&self, run_id: &RunId) -> Result<()> {
        let handle = self.handle(run_id)?;
        let status = handle.status();
        if status.is_finished() || status == RunStatus::Stopped {
            return Ok(());
        }
        info!(run_id = %run_id, status = %status, "Stop requested");
        handle.request_stop();

        // Finalize runs that have no step in flight. A driving worker gets
        // there first and this becomes a no-op.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut state = handle.state.lock().await;
            let live = matches!(
                state.status,
                RunStatus::Running | RunStatus::Paused | RunStatus::Stopping
            );
            if live && handle.stop_requested() {
                if let Err(e) = inner.finish_stop(&handle, &mut state) {
                    error!(run_id = %handle.run_id, error = %e, "Failed to finalize stop");
                }
            }
        });
        Ok(())
    }

    /// Request a pause at the next step boundary and return immediately.
    pub async fn pause(&self, run_id: &RunId) -> Result<()> {
        let handle = self.handle(run_id)?;
        match handle.status() {
            RunStatus::Paused => return Ok(()),
            RunStatus::Running => {}
            other => {
                return Err(StepflowError::InvalidState {
                    run_id: run_id.to_string(),
                    status: other.to_string(),
                    action: "pause".into(),
                })
            }
        }
        info!(run_id = %run_id, "Pause requested");
        handle.request_pause();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut state = handle.state.lock().await;
            if state.status == RunStatus::Running && handle.take_pause() {
                let paused = inner.record(
                    &handle,
                    &mut state,
                    EventKind::RunPaused,
                    &RunTransition::because("pause requested"),
                );
                if let Err(e) = paused {
                    error!(run_id = %handle.run_id, error = %e, "Failed to pause run");
                }
                inner.sync_projection(&handle.run_id);
            }
        });
        Ok(())
    }

    /// Continue a paused or stopped run in the background.
    pub async fn resume(&self, run_id: &RunId) -> Result<()> {
        let handle = self.handle(run_id)?;
        {
            let mut state = handle.state.lock().await;
            if !state.status.is_resumable() {
                return Err(invalid_state(&state, "resume"));
            }
            handle.reset_stop();
            handle.clear_pause();
            self.inner.record(
                &handle,
                &mut state,
                EventKind::RunResumed,
                &RunTransition::default(),
            )?;
            info!(run_id = %run_id, node = ?state.current_node, "Run resumed");
        }
        self.spawn_worker(handle);
        Ok(())
    }

    pub fn status(&self, run_id: &RunId) -> Result<RunStatus> {
        Ok(self.handle(run_id)?.status())
    }

    pub fn watch_status(&self, run_id: &RunId) -> Result<watch::Receiver<RunStatus>> {
        Ok(self.handle(run_id)?.watch_status())
    }

    /// A copy of the run's state. Waits for any in-flight step.
    pub async fn snapshot(&self, run_id: &RunId) -> Result<RunState> {
        let handle = self.handle(run_id)?;
        let state = handle.state.lock().await;
        Ok(state.clone())
    }

    /// Wait for the background worker to exit, then report the status.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatus> {
        let handle = self.handle(run_id)?;
        if let Some(worker) = handle.take_worker() {
            if let Err(e) = worker.await {
                error!(run_id = %run_id, error = %e, "Run worker panicked");
            }
        }
        Ok(handle.status())
    }

    /// Route the run's next transition to `decision` instead of the
    /// navigator's own choice.
    pub fn override_next(&self, run_id: &RunId, decision: RoutingDecision) -> Result<()> {
        decision.validate()?;
        let handle = self.handle(run_id)?;
        let status = handle.status();
        if status.is_finished() {
            return Err(StepflowError::InvalidState {
                run_id: run_id.to_string(),
                status: status.to_string(),
                action: "accept an override".into(),
            });
        }
        info!(run_id = %run_id, kind = %decision.kind, target = ?decision.target, "Routing override queued");
        handle.set_override(decision.with_source(DecisionSource::Override));
        Ok(())
    }

    /// Rebuild a run from its journal and register it.
    ///
    /// A run caught mid-stop is finalized as stopped. A step whose result
    /// was journaled but not yet routed is routed now and never runs again.
    /// A step with no journaled result runs again from its node.
    pub async fn recover(&self, run_id: &RunId, engine: Arc<dyn StepEngine>) -> Result<RunStatus> {
        if let Some(existing) = self.inner.runs.get(run_id) {
            if existing.is_driving() {
                return Err(StepflowError::InvalidState {
                    run_id: run_id.to_string(),
                    status: existing.status().to_string(),
                    action: "be recovered while driving".into(),
                });
            }
        }

        let events = self.inner.journal.read_all(run_id)?;
        if events.is_empty() {
            return Err(StepflowError::RunNotFound(run_id.to_string()));
        }
        let state = RunState::replay(&events)?;
        let handle = Arc::new(RunHandle::new(state, engine));
        let status = {
            let mut state = handle.state.lock().await;
            if state.status == RunStatus::Stopping {
                self.inner.record(
                    &handle,
                    &mut state,
                    EventKind::RunStopped,
                    &RunTransition::because("recovered during stop"),
                )?;
            }
            if state.unrouted.is_some() && !state.status.is_finished() {
                self.inner.route_recovered(&handle, &mut state).await?;
            }
            info!(
                run_id = %run_id,
                events = events.len(),
                status = %state.status,
                node = ?state.current_node,
                "Run recovered"
            );
            state.status
        };
        self.inner.runs.insert(handle);
        self.inner.sync_projection(run_id);
        Ok(status)
    }

    fn handle(&self, run_id: &RunId) -> Result<Arc<RunHandle>> {
        self.inner
            .runs
            .get(run_id)
            .ok_or_else(|| StepflowError::RunNotFound(run_id.to_string()))
    }

    fn spawn_worker(&self, handle: Arc<RunHandle>) {
        let inner = self.inner.clone();
        let driven = handle.clone();
        let task = tokio::spawn(async move {
            loop {
                let outcome = {
                    let mut state = driven.state.lock().await;
                    inner.advance_locked(&driven, &mut state).await
                };
                match outcome {
                    Ok(StepOutcome::Advanced { .. }) => tokio::task::yield_now().await,
                    Ok(outcome) => {
                        debug!(run_id = %driven.run_id, outcome = ?outcome, "Run worker finished");
                        break;
                    }
                    Err(e) => {
                        error!(run_id = %driven.run_id, error = %e, "Run worker stopped on error");
                        break;
                    }
                }
            }
        });
        handle.set_worker(task);
    }
}

impl Inner {
    /// Append, apply, publish. A failed append marks the run failed in
    /// memory and is returned as a journal error.
    fn record<T: Serialize>(
        &self,
        handle: &RunHandle,
        state: &mut RunState,
        kind: EventKind,
        payload: &T,
    ) -> Result<Event> {
        let value = serde_json::to_value(payload)?;
        let event = match self.journal.append(&state.run_id, kind, value) {
            Ok(event) => event,
            Err(e) => {
                error!(run_id = %state.run_id, kind = %kind, error = %e, "Journal append failed, failing run");
                state.status = RunStatus::Failed;
                state.error = Some(e.to_string());
                handle.publish_status(RunStatus::Failed);
                return Err(if matches!(e, StepflowError::Journal(_)) {
                    e
                } else {
                    StepflowError::Journal(e.to_string())
                });
            }
        };
        state.apply(&event)?;
        handle.publish_status(state.status);
        self.bus.publish(event.clone());
        Ok(event)
    }

    fn finish_stop(&self, handle: &RunHandle, state: &mut RunState) -> Result<StepOutcome> {
        self.record(
            handle,
            state,
            EventKind::RunStopped,
            &RunTransition::because("stop requested"),
        )?;
        info!(run_id = %state.run_id, node = ?state.current_node, "Run stopped");
        self.sync_projection(&state.run_id);
        Ok(StepOutcome::Stopped)
    }

    fn sync_projection(&self, run_id: &RunId) {
        if let Some(projection) = &self.projection {
            if let Err(e) = projection.sync(run_id) {
                warn!(run_id = %run_id, error = %e, "Projection sync failed; a rebuild will recover it");
            }
        }
    }

    async fn advance_locked(&self, handle: &RunHandle, state: &mut RunState) -> Result<StepOutcome> {
        match state.status {
            RunStatus::Completed => return Ok(StepOutcome::Completed),
            RunStatus::Failed => {
                return Ok(StepOutcome::Failed {
                    error: state.error.clone().unwrap_or_default(),
                })
            }
            RunStatus::Paused => return Ok(StepOutcome::Paused),
            RunStatus::Stopped => return Ok(StepOutcome::Stopped),
            RunStatus::Stopping => return self.finish_stop(handle, state),
            RunStatus::Running => {}
        }
        if handle.stop_requested() {
            return self.finish_stop(handle, state);
        }
        if handle.take_pause() {
            self.record(
                handle,
                state,
                EventKind::RunPaused,
                &RunTransition::because("pause requested"),
            )?;
            self.sync_projection(&state.run_id);
            return Ok(StepOutcome::Paused);
        }

        if state.unrouted.is_some() {
            let outcome = self.route_recovered(handle, state).await;
            self.sync_projection(&state.run_id);
            return outcome;
        }

        let Some(node_id) = state.current_node.clone() else {
            self.record(handle, state, EventKind::RunCompleted, &RunTransition::default())?;
            return Ok(StepOutcome::Completed);
        };
        if state.steps_started >= self.config.max_steps_per_run as u64 {
            let limit = RoutingError::StepLimitExceeded(self.config.max_steps_per_run);
            return self.escalate(handle, state, &node_id, limit.into());
        }

        let outcome = self.run_step(handle, state, node_id).await;
        self.sync_projection(&state.run_id);
        outcome
    }

    /// Journal a refused routing decision and fail the run.
    fn escalate(
        &self,
        handle: &RunHandle,
        state: &mut RunState,
        node_id: &str,
        escalation: Escalation,
    ) -> Result<StepOutcome> {
        if let RoutingError::StackOverflow { depth, max } = &escalation.error {
            self.record(
                handle,
                state,
                EventKind::StackOverflowPrevented,
                &StackOverflowPrevented {
                    attempted: escalation.attempted.clone().unwrap_or_default(),
                    depth: *depth,
                    max: *max,
                },
            )?;
        }
        let message = escalation.to_string();
        error!(run_id = %state.run_id, node_id, error = %message, "Routing escalated");
        self.record(
            handle,
            state,
            EventKind::RouteEscalated,
            &RouteEscalated {
                node_id: node_id.to_string(),
                flow_id: state.stack.top().flow_id.clone(),
                error: message.clone(),
            },
        )?;
        self.record(
            handle,
            state,
            EventKind::RunFailed,
            &RunTransition::because(message.clone()),
        )?;
        self.sync_projection(&state.run_id);
        Ok(StepOutcome::Failed { error: message })
    }

    async fn run_step(
        &self,
        handle: &RunHandle,
        state: &mut RunState,
        node_id: String,
    ) -> Result<StepOutcome> {
        let graph = state.stack.top_graph().clone();
        let Some(node) = state.stack.node(&node_id).cloned() else {
            let missing = RoutingError::UnknownTarget {
                flow: graph.id.clone(),
                target: node_id.clone(),
            };
            return self.escalate(handle, state, &node_id, missing.into());
        };
        let flow_id = state.stack.top().flow_id.clone();
        let step_seq = state.steps_started + 1;
        let iteration = state.stack.top().counter(&node.id);

        let budget = self
            .base_budget
            .with_override(graph.budgets.as_ref())
            .with_override(node.budgets.as_ref());
        let (history, report) = self.budget.select(&state.history, budget);

        self.record(
            handle,
            state,
            EventKind::ContextSelected,
            &ContextSelected {
                node_id: node.id.clone(),
                step_seq,
                report: report.clone(),
            },
        )?;
        self.record(
            handle,
            state,
            EventKind::StepStart,
            &StepStart {
                node_id: node.id.clone(),
                flow_id: flow_id.clone(),
                step_seq,
                iteration,
                depth: state.depth(),
            },
        )?;
        info!(
            run_id = %state.run_id,
            node_id = %node.id,
            role = %node.role,
            step_seq,
            depth = state.depth(),
            history = history.len(),
            "Step started"
        );

        let mut teaching = graph.teaching.clone();
        teaching.extend(node.teaching.clone());
        let ctx = StepContext {
            run_id: state.run_id.clone(),
            flow_id: flow_id.clone(),
            node_id: node.id.clone(),
            role: node.role.clone(),
            workers: node.workers.clone(),
            step_seq,
            iteration,
            goal: state
                .stack
                .top()
                .inherited_goal_context
                .clone()
                .or_else(|| state.goal.clone()),
            teaching,
            history,
            report,
        };

        let clock = Instant::now();
        let timeout_secs = node.timeout_secs.unwrap_or(self.config.step_timeout_secs);
        let invocation = self
            .invoke(handle, state, ctx, &node.id, timeout_secs)
            .await?;

        let finished = match invocation {
            Invocation::Finished(res) => res,
            Invocation::Interrupted => {
                warn!(
                    run_id = %state.run_id,
                    node_id = %node.id,
                    grace_secs = self.config.stop_grace_secs,
                    "Step interrupted by stop"
                );
                self.record(
                    handle,
                    state,
                    EventKind::StepError,
                    &StepErrorRecord {
                        node_id: node.id.clone(),
                        flow_id,
                        step_seq,
                        role: node.role.clone(),
                        error_kind: StepflowError::Cancelled.kind().to_string(),
                        message: "interrupted by stop; the step runs again on resume".into(),
                        interrupted: true,
                    },
                )?;
                return self.finish_stop(handle, state);
            }
        };
        let duration_ms = clock.elapsed().as_millis() as u64;

        let (mut result, events, transcript, failure) =
            match finished.and_then(|out| self.check_output(&node.id, out)) {
                Ok(out) => (out.result, out.events, out.transcript, None),
                Err(e) => {
                    warn!(run_id = %state.run_id, node_id = %node.id, error = %e, "Step failed");
                    (StepResult::failed(e.to_string()), vec![], vec![], Some(e))
                }
            };
        if result.duration_ms == 0 {
            result.duration_ms = duration_ms;
        }

        for event in events {
            self.record(
                handle,
                state,
                EventKind::EngineEvent,
                &EngineEventRecord {
                    node_id: node.id.clone(),
                    step_seq,
                    event,
                },
            )?;
        }

        let transcript_reference = if transcript.is_empty() {
            None
        } else {
            match self
                .artifacts
                .write_transcript(&state.run_id, step_seq, &node.id, &transcript)
                .await
            {
                Ok(rel) => Some(rel),
                Err(e) => {
                    warn!(run_id = %state.run_id, node_id = %node.id, error = %e, "Transcript not written");
                    None
                }
            }
        };

        let elapsed_ms = result.duration_ms;
        match &failure {
            None => self.record(
                handle,
                state,
                EventKind::StepEnd,
                &StepEnd {
                    node_id: node.id.clone(),
                    flow_id: flow_id.clone(),
                    step_seq,
                    role: node.role.clone(),
                    result,
                },
            )?,
            Some(e) => self.record(
                handle,
                state,
                EventKind::StepError,
                &StepErrorRecord {
                    node_id: node.id.clone(),
                    flow_id: flow_id.clone(),
                    step_seq,
                    role: node.role.clone(),
                    error_kind: e.kind().to_string(),
                    message: e.to_string(),
                    interrupted: false,
                },
            )?,
        };
        // step_error records carry no timing.
        if let Some(step) = state.unrouted.as_mut() {
            step.result.duration_ms = elapsed_ms;
        }
        self.conclude_step(handle, state, transcript_reference).await
    }

    /// Receipt and route the step the journal shows as finished.
    async fn conclude_step(
        &self,
        handle: &RunHandle,
        state: &mut RunState,
        transcript_reference: Option<String>,
    ) -> Result<StepOutcome> {
        let Some(step) = state.unrouted.clone() else {
            return Err(StepflowError::Journal(format!(
                "run {} has no finished step to route",
                state.run_id
            )));
        };
        let receipt_path = match &step.receipt_path {
            Some(path) => path.clone(),
            None => {
                self.write_receipt(handle, state, &step, transcript_reference)
                    .await?
            }
        };

        let override_decision = handle
            .take_override()
            .or_else(|| step.result.routing_override.clone());
        let facts = StepFacts {
            node_id: &step.node_id,
            step_seq: step.step_seq,
            result: &step.result,
            evidence: vec![
                format!("receipt:{}", receipt_path),
                format!("event:{}", step.end_sequence),
            ],
            override_decision,
        };
        let transition = match self.navigator.decide(&state.stack, facts) {
            Ok(t) => t,
            Err(escalation) => return self.escalate(handle, state, &step.node_id, escalation),
        };

        let next_node = transition.next_node.clone();
        self.record(
            handle,
            state,
            EventKind::RouteDecision,
            &RouteDecisionRecord {
                from_node: step.node_id.clone(),
                flow_id: step.flow_id.clone(),
                step_seq: step.step_seq,
                decision: transition.decision,
                next_node: next_node.clone(),
                counter: transition.counter,
            },
        )?;
        if let Some(push) = transition.push {
            info!(
                run_id = %state.run_id,
                flow_id = %push.graph.id,
                depth = push.depth,
                resume_at = ?push.parent_resume_at,
                "Entering nested flow"
            );
            self.record(handle, state, EventKind::StackPush, &push)?;
        }
        for pop in transition.pops {
            debug!(run_id = %state.run_id, flow_id = %pop.flow_id, depth = pop.depth_after, "Leaving nested flow");
            self.record(handle, state, EventKind::StackPop, &pop)?;
        }

        let Some(next_node) = next_node else {
            self.record(handle, state, EventKind::RunCompleted, &RunTransition::default())?;
            info!(run_id = %state.run_id, steps = step.step_seq, "Run completed");
            return Ok(StepOutcome::Completed);
        };

        if handle.stop_requested() {
            return self.finish_stop(handle, state);
        }
        if handle.take_pause() {
            self.record(
                handle,
                state,
                EventKind::RunPaused,
                &RunTransition::because("pause requested"),
            )?;
            return Ok(StepOutcome::Paused);
        }
        Ok(StepOutcome::Advanced {
            node_id: step.node_id,
            next_node,
        })
    }

    /// Write and journal a step's receipt. Returns its path relative to the
    /// run directory. A failed write fails the run.
    async fn write_receipt(
        &self,
        handle: &RunHandle,
        state: &mut RunState,
        step: &UnroutedStep,
        transcript_reference: Option<String>,
    ) -> Result<String> {
        let receipt = Receipt {
            engine: handle.engine.name().to_string(),
            backend_id: handle.engine.backend_id().to_string(),
            step_id: step.node_id.clone(),
            step_seq: step.step_seq,
            flow_id: step.flow_id.clone(),
            run_id: state.run_id.clone(),
            started_at: step.started_at,
            completed_at: step.completed_at,
            duration_ms: step.result.duration_ms,
            status: step.result.status,
            usage: step.result.usage.clone(),
            transcript_reference,
        };
        let receipt_path = match self.artifacts.write_receipt(&receipt).await {
            Ok(path) => path,
            Err(e) => {
                error!(run_id = %state.run_id, node_id = %step.node_id, error = %e, "Receipt write failed");
                self.record(
                    handle,
                    state,
                    EventKind::RunFailed,
                    &RunTransition::because(format!("receipt write failed: {}", e)),
                )?;
                return Err(e);
            }
        };
        let path = self.relative_to_run(&state.run_id, &receipt_path);
        self.record(
            handle,
            state,
            EventKind::ReceiptWritten,
            &ReceiptWritten {
                receipt,
                path: path.clone(),
            },
        )?;
        Ok(path)
    }

    /// Route a step that finished before a restart. A receipt or transcript
    /// already on disk is adopted rather than written again.
    async fn route_recovered(&self, handle: &RunHandle, state: &mut RunState) -> Result<StepOutcome> {
        let Some(step) = state.unrouted.clone() else {
            return Err(StepflowError::Journal(format!(
                "run {} has no finished step to route",
                state.run_id
            )));
        };
        let mut transcript_reference = None;
        if step.receipt_path.is_none() {
            let existing = self
                .artifacts
                .existing_receipt(&state.run_id, step.step_seq, &step.node_id)
                .await?;
            match existing {
                Some((receipt, path)) => {
                    let path = self.relative_to_run(&state.run_id, &path);
                    self.record(
                        handle,
                        state,
                        EventKind::ReceiptWritten,
                        &ReceiptWritten { receipt, path },
                    )?;
                }
                None => {
                    transcript_reference = self
                        .artifacts
                        .existing_transcript(&state.run_id, step.step_seq, &step.node_id)
                        .await?;
                }
            }
        }
        let outcome = self.conclude_step(handle, state, transcript_reference).await?;
        info!(
            run_id = %state.run_id,
            node_id = %step.node_id,
            step_seq = step.step_seq,
            outcome = ?outcome,
            "Routed step finished before restart"
        );
        Ok(outcome)
    }

    fn relative_to_run(&self, run_id: &RunId, path: &Path) -> String {
        let run_dir = self.artifacts.run_dir(run_id);
        path.strip_prefix(&run_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Call the engine under the step timeout, honoring stop requests.
    async fn invoke(
        &self,
        handle: &RunHandle,
        state: &mut RunState,
        ctx: StepContext,
        node_id: &str,
        timeout_secs: u64,
    ) -> Result<Invocation> {
        let stop = handle.stop_token();
        let cancel: CancellationToken = stop.child_token();
        let engine = handle.engine.clone();
        let mut call = engine.run_step(ctx, cancel.clone());

        let invocation = tokio::select! {
            biased;
            res = &mut call => Invocation::Finished(res),
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                cancel.cancel();
                Invocation::Finished(Err(StepflowError::StepTimeout {
                    node: node_id.to_string(),
                    timeout_secs,
                }))
            }
            _ = stop.cancelled() => {
                self.record(
                    handle,
                    state,
                    EventKind::RunStopping,
                    &RunTransition::because("stop requested during step"),
                )?;
                let grace = Duration::from_secs(self.config.stop_grace_secs);
                match tokio::time::timeout(grace, &mut call).await {
                    Ok(Err(StepflowError::Cancelled)) | Err(_) => Invocation::Interrupted,
                    Ok(res) => Invocation::Finished(res),
                }
            }
        };
        Ok(invocation)
    }

    fn check_output(&self, node_id: &str, output: StepOutput) -> Result<StepOutput> {
        let bytes = output.result.byte_size();
        if bytes > self.config.max_result_bytes {
            return Err(StepflowError::OversizedResult {
                node: node_id.to_string(),
                bytes,
                limit: self.config.max_result_bytes,
            });
        }
        // Routing reads `status` from the result itself.
        if output.result.fields.contains_key("status") {
            return Err(StepflowError::InvalidResult(format!(
                "{} set the reserved field 'status'",
                node_id
            )));
        }
        Ok(output)
    }
}

fn invalid_state(state: &RunState, action: &str) -> StepflowError {
    StepflowError::InvalidState {
        run_id: state.run_id.to_string(),
        status: state.status.to_string(),
        action: action.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_core::flow::{Node, RoutingRule};
    use stepflow_journal::MemoryJournal;
    use stepflow_test_utils::{
        linear_flow, review_loop_flow, test_config, FailingJournal, Reply, ScriptedEngine,
    };

    fn build(dir: &std::path::Path, config: AppConfig, journal: Arc<dyn Journal>) -> Orchestrator {
        Orchestrator::builder(config)
            .journal(journal)
            .artifacts(ArtifactStore::new(dir.join("runs")))
            .build()
            .unwrap()
    }

    fn orchestrator(dir: &std::path::Path) -> Orchestrator {
        build(dir, test_config(dir), Arc::new(MemoryJournal::new()))
    }

    async fn create(orch: &Orchestrator, engine: &Arc<ScriptedEngine>, graph: FlowGraph) -> RunId {
        orch.create_run(Arc::new(graph), RunParams::new(engine.clone()))
            .await
            .unwrap()
    }

    fn kinds(orch: &Orchestrator, run_id: &RunId) -> Vec<EventKind> {
        orch.journal()
            .read_all(run_id)
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect()
    }

    fn first_of(orch: &Orchestrator, run_id: &RunId, kind: EventKind) -> Option<Event> {
        orch.journal()
            .read_all(run_id)
            .unwrap()
            .into_iter()
            .find(|e| e.kind == kind)
    }

    #[tokio::test]
    async fn test_linear_run_advances_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new().on("draft", Reply::ok("first draft")));
        let run_id = create(&orch, &engine, linear_flow("docs")).await;

        assert_eq!(
            orch.advance(&run_id).await.unwrap(),
            StepOutcome::Advanced {
                node_id: "draft".into(),
                next_node: "critique".into()
            }
        );
        assert!(!orch.advance(&run_id).await.unwrap().is_terminal());
        assert_eq!(orch.advance(&run_id).await.unwrap(), StepOutcome::Completed);
        assert_eq!(orch.status(&run_id).unwrap(), RunStatus::Completed);
        assert_eq!(orch.advance(&run_id).await.unwrap(), StepOutcome::Completed);

        let calls = engine.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].history.is_empty());
        assert_eq!(calls[1].history[0].content, "first draft");
        assert_eq!(calls[2].step_seq, 3);

        let receipts = orch.artifacts().list_receipts(&run_id).await.unwrap();
        assert_eq!(receipts.len(), 3);
        assert_eq!(receipts[0].backend_id, "scripted-v1");
        assert_eq!(kinds(&orch, &run_id).last(), Some(&EventKind::RunCompleted));
    }

    #[tokio::test]
    async fn test_sequences_are_gapless() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new());
        let run_id = create(&orch, &engine, linear_flow("docs")).await;
        orch.start(&run_id).await.unwrap();
        assert_eq!(orch.wait(&run_id).await.unwrap(), RunStatus::Completed);

        let seqs: Vec<u64> = orch
            .journal()
            .read_all(&run_id)
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
        assert_eq!(kinds(&orch, &run_id)[1], EventKind::RunStarted);
    }

    #[tokio::test]
    async fn test_microloop_iterates_up_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new().always(
            "critique",
            Reply::result(StepResult::succeeded("still wrong").with_field("verdict", json!("rejected"))),
        ));
        let run_id = create(&orch, &engine, review_loop_flow(3)).await;
        orch.start(&run_id).await.unwrap();

        assert_eq!(orch.wait(&run_id).await.unwrap(), RunStatus::Completed);
        assert_eq!(engine.call_count("critique"), 3);
        assert_eq!(engine.call_count("draft"), 3);
        assert_eq!(engine.call_count("publish"), 1);

        let iterations: Vec<u32> = engine
            .calls()
            .iter()
            .filter(|c| c.node_id == "critique")
            .map(|c| c.iteration)
            .collect();
        assert_eq!(iterations, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_engine_failure_is_routed() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new().on("draft", Reply::error("model unavailable")));
        let run_id = create(&orch, &engine, linear_flow("docs")).await;

        orch.advance(&run_id).await.unwrap();
        let err = first_of(&orch, &run_id, EventKind::StepError).unwrap();
        let record: StepErrorRecord = err.decode().unwrap();
        assert_eq!(record.error_kind, "engine");
        assert!(!record.interrupted);

        let receipts = orch.artifacts().list_receipts(&run_id).await.unwrap();
        assert_eq!(receipts[0].status, stepflow_core::types::StepStatus::Failed);
        let snapshot = orch.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.current_node.as_deref(), Some("critique"));
        assert!(snapshot.history[0].content.contains("model unavailable"));
    }

    #[tokio::test]
    async fn test_step_timeout_and_oversized_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.orchestrator.max_result_bytes = 64;
        let orch = build(dir.path(), config, Arc::new(MemoryJournal::new()));
        let engine = Arc::new(
            ScriptedEngine::new()
                .on("slow", Reply::ok("late").with_delay(Duration::from_secs(3)))
                .on("big", Reply::ok("x".repeat(500))),
        );
        let graph = FlowGraph::linear(
            "limits",
            vec![Node::new("slow", "author").with_timeout(1), Node::new("big", "author")],
        );
        let run_id = create(&orch, &engine, graph).await;
        orch.start(&run_id).await.unwrap();
        assert_eq!(orch.wait(&run_id).await.unwrap(), RunStatus::Completed);

        let errors: Vec<String> = orch
            .journal()
            .read_all(&run_id)
            .unwrap()
            .iter()
            .filter(|e| e.kind == EventKind::StepError)
            .map(|e| e.decode::<StepErrorRecord>().unwrap().error_kind)
            .collect();
        assert_eq!(errors, vec!["timeout".to_string(), "oversized_result".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_abandons_step_after_grace_then_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new().on(
            "draft",
            Reply::ok("never").with_delay(Duration::from_secs(30)).ignoring_cancel(),
        ));
        let run_id = create(&orch, &engine, linear_flow("docs")).await;
        let mut events = orch.subscribe();
        orch.start(&run_id).await.unwrap();
        while events.recv().await.unwrap().kind != EventKind::StepStart {}

        orch.stop(&run_id).await.unwrap();
        assert_eq!(orch.wait(&run_id).await.unwrap(), RunStatus::Stopped);

        let journal = kinds(&orch, &run_id);
        assert_eq!(journal.last(), Some(&EventKind::RunStopped));
        assert!(journal.contains(&EventKind::RunStopping));
        assert!(!journal.contains(&EventKind::ReceiptWritten));
        let interrupted: StepErrorRecord = first_of(&orch, &run_id, EventKind::StepError)
            .unwrap()
            .decode()
            .unwrap();
        assert!(interrupted.interrupted);
        let snapshot = orch.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.current_node.as_deref(), Some("draft"));
        assert!(snapshot.history.is_empty());

        orch.resume(&run_id).await.unwrap();
        assert_eq!(orch.wait(&run_id).await.unwrap(), RunStatus::Completed);
        assert_eq!(engine.call_count("draft"), 2);
    }

    #[tokio::test]
    async fn test_stop_idle_run() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new());
        let run_id = create(&orch, &engine, linear_flow("docs")).await;

        let mut status = orch.watch_status(&run_id).unwrap();
        orch.stop(&run_id).await.unwrap();
        status.wait_for(|s| *s == RunStatus::Stopped).await.unwrap();
        assert_eq!(orch.advance(&run_id).await.unwrap(), StepOutcome::Stopped);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pause_at_step_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new().on(
            "draft",
            Reply::ok("v1").with_delay(Duration::from_millis(200)),
        ));
        let run_id = create(&orch, &engine, linear_flow("docs")).await;
        let mut events = orch.subscribe();
        orch.start(&run_id).await.unwrap();
        while events.recv().await.unwrap().kind != EventKind::StepStart {}

        orch.pause(&run_id).await.unwrap();
        assert_eq!(orch.wait(&run_id).await.unwrap(), RunStatus::Paused);
        let snapshot = orch.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.current_node.as_deref(), Some("critique"));
        assert_eq!(engine.calls().len(), 1);

        assert!(orch.pause(&run_id).await.is_ok());
        orch.resume(&run_id).await.unwrap();
        assert_eq!(orch.wait(&run_id).await.unwrap(), RunStatus::Completed);
        assert!(orch.resume(&run_id).await.is_err());
    }

    #[tokio::test]
    async fn test_operator_override() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new());
        let run_id = create(&orch, &engine, linear_flow("docs")).await;
        orch.advance(&run_id).await.unwrap();

        let unjustified = RoutingDecision::detour("draft", "", vec!["receipt:1".into()]);
        assert!(matches!(
            orch.override_next(&run_id, unjustified),
            Err(StepflowError::Routing(RoutingError::MissingJustification { .. }))
        ));

        orch.override_next(
            &run_id,
            RoutingDecision::detour("draft", "critic asked for a rewrite", vec!["receipts/0001-draft.json".into()]),
        )
        .unwrap();
        assert_eq!(
            orch.advance(&run_id).await.unwrap(),
            StepOutcome::Advanced {
                node_id: "critique".into(),
                next_node: "draft".into()
            }
        );
        let decisions: Vec<RouteDecisionRecord> = orch
            .journal()
            .read_all(&run_id)
            .unwrap()
            .iter()
            .filter(|e| e.kind == EventKind::RouteDecision)
            .map(|e| e.decode().unwrap())
            .collect();
        assert_eq!(decisions[1].decision.source, DecisionSource::Override);
        assert_eq!(
            decisions[1].decision.justification.as_deref(),
            Some("critic asked for a rewrite")
        );
    }

    #[tokio::test]
    async fn test_stack_overflow_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.orchestrator.max_stack_depth = 1;
        let orch = build(dir.path(), config, Arc::new(MemoryJournal::new()));
        orch.catalog()
            .register(FlowGraph::linear(
                "fix",
                vec![Node::new("patch", "fixer").with_rule(RoutingRule::inject_flow(
                    "status == \"failed\"",
                    "fix",
                    "patch failed",
                ))],
            ))
            .unwrap();
        let main = FlowGraph::linear(
            "main",
            vec![
                Node::new("build", "builder").with_rule(RoutingRule::inject_flow(
                    "status == \"failed\"",
                    "fix",
                    "build failed",
                )),
                Node::new("ship", "deployer"),
            ],
        );
        let engine = Arc::new(
            ScriptedEngine::new()
                .always("build", Reply::error("compile error"))
                .always("patch", Reply::error("still broken")),
        );
        let run_id = create(&orch, &engine, main).await;

        orch.advance(&run_id).await.unwrap();
        assert_eq!(orch.snapshot(&run_id).await.unwrap().depth(), 1);
        let outcome = orch.advance(&run_id).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { .. }));

        let journal = kinds(&orch, &run_id);
        let n = journal.len();
        assert_eq!(
            &journal[n - 3..],
            &[
                EventKind::StackOverflowPrevented,
                EventKind::RouteEscalated,
                EventKind::RunFailed
            ]
        );
        let prevented: StackOverflowPrevented =
            first_of(&orch, &run_id, EventKind::StackOverflowPrevented)
                .unwrap()
                .decode()
                .unwrap();
        assert_eq!(prevented.attempted, "fix");
        assert_eq!((prevented.depth, prevented.max), (1, 1));
    }

    #[tokio::test]
    async fn test_step_limit_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.orchestrator.max_steps_per_run = 2;
        let orch = build(dir.path(), config, Arc::new(MemoryJournal::new()));
        let engine = Arc::new(ScriptedEngine::new());
        let run_id = create(&orch, &engine, linear_flow("docs")).await;

        orch.advance(&run_id).await.unwrap();
        orch.advance(&run_id).await.unwrap();
        match orch.advance(&run_id).await.unwrap() {
            StepOutcome::Failed { error } => assert!(error.contains("ceiling of 2 steps")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(engine.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_journal_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(FailingJournal::new(Arc::new(MemoryJournal::new()), 3));
        let orch = build(dir.path(), test_config(dir.path()), journal);
        let engine = Arc::new(ScriptedEngine::new());
        let run_id = create(&orch, &engine, linear_flow("docs")).await;

        let err = orch.advance(&run_id).await.unwrap_err();
        assert!(matches!(err, StepflowError::Journal(_)));
        assert_eq!(orch.status(&run_id).unwrap(), RunStatus::Failed);
        assert_eq!(orch.journal().head(&run_id).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_recover_continues_from_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("journal.db");
        let engine = Arc::new(ScriptedEngine::new().on("draft", Reply::ok("persisted draft")));

        let run_id = {
            let journal = Arc::new(stepflow_journal::SqliteJournal::open(&journal_path).unwrap());
            let orch = build(dir.path(), test_config(dir.path()), journal);
            let run_id = create(&orch, &engine, linear_flow("docs")).await;
            orch.advance(&run_id).await.unwrap();
            run_id
        };

        let journal = Arc::new(stepflow_journal::SqliteJournal::open(&journal_path).unwrap());
        let orch = build(dir.path(), test_config(dir.path()), journal);
        assert!(matches!(
            orch.advance(&run_id).await,
            Err(StepflowError::RunNotFound(_))
        ));
        assert_eq!(
            orch.recover(&run_id, engine.clone()).await.unwrap(),
            RunStatus::Running
        );
        let snapshot = orch.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.current_node.as_deref(), Some("critique"));
        assert_eq!(snapshot.history[0].content, "persisted draft");

        orch.start(&run_id).await.unwrap();
        assert_eq!(orch.wait(&run_id).await.unwrap(), RunStatus::Completed);
        let receipts = orch.artifacts().list_receipts(&run_id).await.unwrap();
        assert_eq!(receipts.len(), 3);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_graph() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new());
        let graph = FlowGraph::new("bad").with_node(Node::new("a", "author").with_next("ghost"));
        let err = orch
            .create_run(Arc::new(graph), RunParams::new(engine))
            .await
            .unwrap_err();
        assert!(matches!(err, StepflowError::InvalidFlow { .. }));
        assert!(orch.runs().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_status_field_fails_step() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new().on(
            "draft",
            Reply::result(StepResult::succeeded("ok").with_field("status", json!("failed"))),
        ));
        let run_id = create(&orch, &engine, linear_flow("docs")).await;
        orch.advance(&run_id).await.unwrap();

        let record: StepErrorRecord = first_of(&orch, &run_id, EventKind::StepError)
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(record.error_kind, "invalid_result");
    }

    #[tokio::test]
    async fn test_invalid_engine_override_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let engine = Arc::new(ScriptedEngine::new().on(
            "draft",
            Reply::result(
                StepResult::succeeded("skip ahead")
                    .with_override(RoutingDecision::detour("publish", "", vec!["x".into()])),
            ),
        ));
        let run_id = create(&orch, &engine, linear_flow("docs")).await;

        assert!(matches!(
            orch.advance(&run_id).await.unwrap(),
            StepOutcome::Failed { .. }
        ));
        let journal = kinds(&orch, &run_id);
        assert!(journal.contains(&EventKind::StepEnd));
        assert!(!journal.contains(&EventKind::RouteDecision));
        assert_eq!(journal.last(), Some(&EventKind::RunFailed));
    }
}
