//! Declarative flow graphs: nodes, edges, routing rules and load-time validation.

pub mod edge;
pub mod node;
mod validate;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};
use crate::types::BudgetOverride;

pub use edge::{evaluate_condition, Edge, EdgeCondition};
pub use node::{Node, RoutingKind, RoutingRule, RuleKind, SuccessPredicate};

/// An immutable, validated flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: Option<String>,
    /// Entry node. Defaults to the first node.
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Flow-level budget override.
    #[serde(default)]
    pub budgets: Option<BudgetOverride>,
    /// Flow-level teaching notes, delivered to every step in full.
    #[serde(default)]
    pub teaching: Vec<String>,
}

fn default_version() -> u32 {
    1
}

impl FlowGraph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            description: None,
            entry: None,
            nodes: vec![],
            edges: vec![],
            budgets: None,
            teaching: vec![],
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn with_budgets(mut self, budgets: BudgetOverride) -> Self {
        self.budgets = Some(budgets);
        self
    }

    pub fn with_teaching(mut self, note: impl Into<String>) -> Self {
        self.teaching.push(note.into());
        self
    }

    /// A linear chain of nodes wired through `next`.
    pub fn linear(id: impl Into<String>, mut nodes: Vec<Node>) -> Self {
        for i in 1..nodes.len() {
            if nodes[i - 1].next.is_none() {
                nodes[i - 1].next = Some(nodes[i].id.clone());
            }
        }
        Self {
            nodes,
            ..Self::new(id)
        }
    }

    pub fn entry_node(&self) -> Option<&str> {
        self.entry
            .as_deref()
            .or_else(|| self.nodes.first().map(|n| n.id.as_str()))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    /// The continuation taken when nothing else applies: `next`, else the
    /// first unconditional outgoing edge.
    pub fn default_next(&self, node: &Node) -> Option<String> {
        node.next.clone().or_else(|| {
            self.outgoing(&node.id)
                .find(|e| e.is_unconditional())
                .map(|e| e.to.clone())
        })
    }

    /// Parse and validate a TOML flow definition.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let graph: Self = toml::from_str(s).map_err(|e| StepflowError::InvalidFlow {
            flow_id: "<unparsed>".into(),
            problems: vec![e.to_string()],
        })?;
        graph.validate()?;
        Ok(graph)
    }

    /// Parse and validate a JSON flow definition.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let graph: Self = serde_json::from_str(s).map_err(|e| StepflowError::InvalidFlow {
            flow_id: "<unparsed>".into(),
            problems: vec![e.to_string()],
        })?;
        graph.validate()?;
        Ok(graph)
    }

    /// Load a flow file; `.json` is parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Structural checks, reporting every problem found.
    pub fn validate(&self) -> Result<()> {
        let problems = validate::problems(self);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(StepflowError::InvalidFlow {
                flow_id: self.id.clone(),
                problems,
            })
        }
    }
}
