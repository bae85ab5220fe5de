use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::flow::FlowGraph;

/// Registry of validated flow definitions, keyed by id and version.
///
/// Injection resolves flows here; once a run pins a graph the catalog is
/// no longer consulted for it.
#[derive(Default)]
pub struct FlowCatalog {
    flows: RwLock<HashMap<String, BTreeMap<u32, Arc<FlowGraph>>>>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a flow. A version can be registered only once.
    pub fn register(&self, graph: FlowGraph) -> Result<Arc<FlowGraph>> {
        graph.validate()?;
        let mut flows = self
            .flows
            .write()
            .map_err(|e| StepflowError::Config(e.to_string()))?;
        let versions = flows.entry(graph.id.clone()).or_default();
        if versions.contains_key(&graph.version) {
            return Err(StepflowError::InvalidFlow {
                flow_id: graph.id.clone(),
                problems: vec![format!("version {} is already registered", graph.version)],
            });
        }
        info!(flow_id = %graph.id, version = graph.version, nodes = graph.nodes.len(), "Flow registered");
        let graph = Arc::new(graph);
        versions.insert(graph.version, graph.clone());
        Ok(graph)
    }

    /// Load every `.toml` and `.json` flow in a directory.
    ///
    /// Files that fail to parse or validate are skipped with a warning.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("toml" | "json")))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match FlowGraph::load(&path).and_then(|g| self.register(g)) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping flow file"),
            }
        }
        Ok(loaded)
    }

    pub fn get(&self, id: &str, version: u32) -> Option<Arc<FlowGraph>> {
        let flows = self.flows.read().ok()?;
        flows.get(id)?.get(&version).cloned()
    }

    pub fn latest(&self, id: &str) -> Option<Arc<FlowGraph>> {
        let flows = self.flows.read().ok()?;
        flows.get(id)?.values().next_back().cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let Ok(flows) = self.flows.read() else {
            return vec![];
        };
        let mut ids: Vec<String> = flows.keys().cloned().collect();
        ids.sort();
        ids
    }
}
