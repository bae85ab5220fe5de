//! Stepflow: a stepwise workflow execution kernel.
//!
//! Runs walk a validated [`FlowGraph`] one step at a time. Each step hands a
//! budgeted slice of prior output to a pluggable [`StepEngine`], journals
//! what happened, writes a receipt, and asks the [`Navigator`] where to go
//! next. Flows can inject nested flows up to a bounded stack depth.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stepflow::{AppConfig, FlowGraph, Node, Orchestrator, RunParams, StepEngine};
//!
//! # async fn demo(engine: Arc<dyn StepEngine>) -> stepflow::Result<()> {
//! let orchestrator = Orchestrator::builder(AppConfig::default()).build()?;
//! let graph = FlowGraph::linear(
//!     "docs",
//!     vec![Node::new("draft", "author"), Node::new("review", "critic")],
//! );
//! let run_id = orchestrator
//!     .create_run(Arc::new(graph), RunParams::new(engine))
//!     .await?;
//! orchestrator.start(&run_id).await?;
//! orchestrator.wait(&run_id).await?;
//! # Ok(())
//! # }
//! ```

pub use stepflow_core as kernel;
pub use stepflow_engine as engine;
pub use stepflow_journal as journal;

pub use stepflow_core::{
    AppConfig, DecisionKind, DecisionSource, Event, EventBus, EventKind, FlowGraph, Journal, Node,
    Result, RoutingDecision, RoutingError, StepEngine, StepflowError,
};
pub use stepflow_core::types::{
    ContextBudget, HistoryItem, Priority, Receipt, RunId, RunStatus, StepContext, StepOutput,
    StepResult, StepStatus, TruncationReport,
};
pub use stepflow_engine::{
    ContextBudgetManager, FlowCatalog, Navigator, Orchestrator, OrchestratorBuilder, RunParams,
    RunState, StepOutcome,
};
pub use stepflow_journal::{ArtifactStore, MemoryJournal, ProjectionStore, SqliteJournal};
