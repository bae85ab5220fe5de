use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::types::*;

/// Step engine: the pluggable backend that executes one step.
///
/// Implementations are injected at run creation and never named by the
/// kernel. The cancellation token fires when the run is asked to stop; an
/// engine should wind down and return promptly once it does.
pub trait StepEngine: Send + Sync + 'static {
    /// Engine name recorded in receipts.
    fn name(&self) -> &str;

    /// Model or backend identifier recorded in receipts.
    fn backend_id(&self) -> &str {
        self.name()
    }

    /// Execute a step with the given context.
    fn run_step(
        &self,
        ctx: StepContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<StepOutput>>;
}

/// Event journal: append-only, per-run ordered log.
///
/// `append` assigns the next sequence number for the run and returns the
/// stored event. A failed append must surface as an error; callers treat
/// it as fatal to the run.
pub trait Journal: Send + Sync + 'static {
    fn append(
        &self,
        run_id: &RunId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Event>;

    /// Every event of the run, in sequence order.
    fn read_all(&self, run_id: &RunId) -> Result<Vec<Event>>;

    /// Events with a sequence strictly greater than `after`.
    fn read_since(&self, run_id: &RunId, after: u64) -> Result<Vec<Event>>;

    /// Highest sequence for the run, 0 if it has no events.
    fn head(&self, run_id: &RunId) -> Result<u64>;

    /// Every run with at least one event.
    fn run_ids(&self) -> Result<Vec<RunId>>;
}
