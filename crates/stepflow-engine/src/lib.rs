pub mod budget;
pub mod catalog;
pub mod navigator;
pub mod orchestrator;
pub mod registry;
pub mod state;

pub use budget::{ContextBudgetManager, PriorityClassifier, TRUNCATION_MARKER};
pub use catalog::FlowCatalog;
pub use navigator::{Escalation, GraphStack, Navigator, StepFacts, Transition};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunParams, StepOutcome};
pub use registry::{RunHandle, RunRegistry};
pub use state::{RunState, UnroutedStep};
