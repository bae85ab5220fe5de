use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepflowError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Flow model errors
    #[error("Invalid flow '{flow_id}': {}", problems.join("; "))]
    InvalidFlow { flow_id: String, problems: Vec<String> },

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Node '{node}' not found in flow '{flow}'")]
    NodeNotFound { flow: String, node: String },

    // Run lifecycle errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} cannot {action} while {status}")]
    InvalidState {
        run_id: String,
        status: String,
        action: String,
    },

    // Step errors
    #[error("Step engine failed: {0}")]
    Engine(String),

    #[error("Step timeout after {timeout_secs}s: {node}")]
    StepTimeout { node: String, timeout_secs: u64 },

    #[error("Step result for {node} is {bytes} bytes, limit is {limit}")]
    OversizedResult {
        node: String,
        bytes: usize,
        limit: usize,
    },

    #[error("Invalid step result: {0}")]
    InvalidResult(String),

    #[error("Step cancelled")]
    Cancelled,

    // Routing errors
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    // Durability errors
    #[error("Journal append failed: {0}")]
    Journal(String),

    #[error("Database error: {0}")]
    Database(String),

    // Projection errors
    #[error("Projection error: {0}")]
    Projection(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepflowError {
    /// Short machine-readable label, used in journal payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::InvalidFlow { .. } => "invalid_flow",
            Self::FlowNotFound(_) => "flow_not_found",
            Self::NodeNotFound { .. } => "node_not_found",
            Self::RunNotFound(_) => "run_not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Engine(_) => "engine",
            Self::StepTimeout { .. } => "timeout",
            Self::OversizedResult { .. } => "oversized_result",
            Self::InvalidResult(_) => "invalid_result",
            Self::Cancelled => "cancelled",
            Self::Routing(_) => "routing",
            Self::Journal(_) => "journal",
            Self::Database(_) => "database",
            Self::Projection(_) => "projection",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// Reasons the navigator refuses to produce a transition.
///
/// Every variant is a hard escalation: the run stops on an error state
/// instead of continuing down an undefined path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no routing rule applies at node '{node}' and it has no default edge")]
    NoApplicableRule { node: String },

    #[error("{kind} decision requires a justification")]
    MissingJustification { kind: String },

    #[error("{kind} decision requires at least one evidence reference")]
    MissingEvidence { kind: String },

    #[error("{kind} decision requires a target")]
    MissingTarget { kind: String },

    #[error("target node '{target}' does not exist in flow '{flow}'")]
    UnknownTarget { flow: String, target: String },

    #[error("injected flow '{0}' is not in the catalog")]
    UnknownFlow(String),

    #[error("graph stack depth {depth} is at its maximum of {max}")]
    StackOverflow { depth: usize, max: usize },

    #[error("invalid routing decision: {0}")]
    InvalidDecision(String),

    #[error("run exceeded its ceiling of {0} steps")]
    StepLimitExceeded(usize),
}

pub type Result<T> = std::result::Result<T, StepflowError>;
