pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod routing;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, RoutingError, StepflowError};
pub use event::{Event, EventBus, EventKind};
pub use flow::{FlowGraph, Node};
pub use routing::{DecisionKind, DecisionSource, RoutingDecision};
pub use traits::{Journal, StepEngine};
pub use types::*;
