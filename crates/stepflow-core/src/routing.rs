use serde::{Deserialize, Serialize};

use crate::error::RoutingError;
use crate::flow::Node;

/// What a routing decision does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    /// Follow the graph. A `None` target ends the current flow.
    Continue,
    /// Jump to another node of the current flow.
    Detour,
    /// Push a catalog flow onto the graph stack.
    InjectFlow,
    /// Push an ad-hoc node sequence onto the graph stack.
    InjectNodes,
    /// Splice nodes into the current flow.
    ExtendGraph,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Detour => "DETOUR",
            Self::InjectFlow => "INJECT_FLOW",
            Self::InjectNodes => "INJECT_NODES",
            Self::ExtendGraph => "EXTEND_GRAPH",
        }
    }

    /// Anything other than CONTINUE deviates from the declared graph.
    pub fn is_deviation(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the navigator reached a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Terminal node or a single unconditional edge.
    FastPath,
    /// A node-level routing rule matched.
    Rule,
    /// A conditional edge matched.
    Edge,
    /// Microloop continue/exit logic.
    Microloop,
    /// Supplied by the engine or an operator.
    Override,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastPath => "fast_path",
            Self::Rule => "rule",
            Self::Edge => "edge",
            Self::Microloop => "microloop",
            Self::Override => "override",
        }
    }
}

/// A navigator decision, journaled as `route_decision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub kind: DecisionKind,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub justification: Option<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub resulting_stack_depth: usize,
    pub source: DecisionSource,
    /// Nodes carried by INJECT_NODES and EXTEND_GRAPH.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
}

impl RoutingDecision {
    pub fn continue_to(target: Option<String>, source: DecisionSource) -> Self {
        Self {
            kind: DecisionKind::Continue,
            target,
            justification: None,
            evidence: vec![],
            resulting_stack_depth: 0,
            source,
            nodes: vec![],
        }
    }

    fn deviation(
        kind: DecisionKind,
        target: Option<String>,
        justification: impl Into<String>,
        evidence: Vec<String>,
    ) -> Self {
        Self {
            kind,
            target,
            justification: Some(justification.into()),
            evidence,
            resulting_stack_depth: 0,
            source: DecisionSource::Override,
            nodes: vec![],
        }
    }

    pub fn detour(
        target: impl Into<String>,
        justification: impl Into<String>,
        evidence: Vec<String>,
    ) -> Self {
        Self::deviation(
            DecisionKind::Detour,
            Some(target.into()),
            justification,
            evidence,
        )
    }

    pub fn inject_flow(
        flow_id: impl Into<String>,
        justification: impl Into<String>,
        evidence: Vec<String>,
    ) -> Self {
        Self::deviation(
            DecisionKind::InjectFlow,
            Some(flow_id.into()),
            justification,
            evidence,
        )
    }

    pub fn inject_nodes(
        nodes: Vec<Node>,
        justification: impl Into<String>,
        evidence: Vec<String>,
    ) -> Self {
        let mut decision =
            Self::deviation(DecisionKind::InjectNodes, None, justification, evidence);
        decision.nodes = nodes;
        decision
    }

    pub fn extend_graph(
        nodes: Vec<Node>,
        justification: impl Into<String>,
        evidence: Vec<String>,
    ) -> Self {
        let mut decision =
            Self::deviation(DecisionKind::ExtendGraph, None, justification, evidence);
        decision.nodes = nodes;
        decision
    }

    pub fn with_source(mut self, source: DecisionSource) -> Self {
        self.source = source;
        self
    }

    /// Structural checks on the decision object itself.
    ///
    /// Deviations need a non-blank justification and at least one evidence
    /// reference; each kind needs the payload it acts on.
    pub fn validate(&self) -> Result<(), RoutingError> {
        if self.kind.is_deviation() {
            let justified = self
                .justification
                .as_deref()
                .is_some_and(|j| !j.trim().is_empty());
            if !justified {
                return Err(RoutingError::MissingJustification {
                    kind: self.kind.to_string(),
                });
            }
            if !self.evidence.iter().any(|e| !e.trim().is_empty()) {
                return Err(RoutingError::MissingEvidence {
                    kind: self.kind.to_string(),
                });
            }
        }

        match self.kind {
            DecisionKind::Detour | DecisionKind::InjectFlow => {
                if self.target.as_deref().map_or(true, str::is_empty) {
                    return Err(RoutingError::MissingTarget {
                        kind: self.kind.to_string(),
                    });
                }
            }
            DecisionKind::InjectNodes | DecisionKind::ExtendGraph => {
                if self.nodes.is_empty() {
                    return Err(RoutingError::InvalidDecision(format!(
                        "{} carries no nodes",
                        self.kind
                    )));
                }
                let mut seen = std::collections::HashSet::new();
                for node in &self.nodes {
                    if node.id.is_empty() || !seen.insert(node.id.as_str()) {
                        return Err(RoutingError::InvalidDecision(format!(
                            "{} carries an empty or duplicate node id '{}'",
                            self.kind, node.id
                        )));
                    }
                }
            }
            DecisionKind::Continue => {}
        }
        Ok(())
    }
}
