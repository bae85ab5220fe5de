use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stepflow_core::routing::RoutingDecision;
use stepflow_core::traits::StepEngine;
use stepflow_core::types::{RunId, RunStatus};

use crate::state::RunState;

/// Everything the orchestrator holds for one live run.
///
/// `state` is the single-writer lock: whoever advances the run holds it for
/// the whole step. Control requests (stop, pause, override) go through the
/// other fields so they never wait on an in-flight step.
pub struct RunHandle {
    pub run_id: RunId,
    pub engine: Arc<dyn StepEngine>,
    pub state: tokio::sync::Mutex<RunState>,
    status: watch::Sender<RunStatus>,
    stop: Mutex<CancellationToken>,
    pause_requested: AtomicBool,
    pending_override: Mutex<Option<RoutingDecision>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    pub fn new(state: RunState, engine: Arc<dyn StepEngine>) -> Self {
        let (status, _) = watch::channel(state.status);
        Self {
            run_id: state.run_id.clone(),
            engine,
            state: tokio::sync::Mutex::new(state),
            status,
            stop: Mutex::new(CancellationToken::new()),
            pause_requested: AtomicBool::new(false),
            pending_override: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn publish_status(&self, status: RunStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Token for the current execution window.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn request_stop(&self) {
        self.stop_token().cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_token().is_cancelled()
    }

    /// Fresh token for a resumed run.
    pub fn reset_stop(&self) {
        let mut token = self.stop.lock().unwrap_or_else(|e| e.into_inner());
        *token = CancellationToken::new();
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending pause request.
    pub fn take_pause(&self) -> bool {
        self.pause_requested.swap(false, Ordering::SeqCst)
    }

    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn set_override(&self, decision: RoutingDecision) {
        let mut slot = self
            .pending_override
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(decision);
    }

    pub fn take_override(&self) -> Option<RoutingDecision> {
        self.pending_override
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Whether a background worker is currently driving this run.
    pub fn is_driving(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn set_worker(&self, handle: JoinHandle<()>) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        *worker = Some(handle);
    }

    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Live runs, keyed by id.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<RunHandle>) {
        let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
        runs.insert(handle.run_id.clone(), handle);
    }

    pub fn get(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
    }

    pub fn remove(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id)
    }

    pub fn ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self
            .runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
