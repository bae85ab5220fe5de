use std::sync::Arc;

use stepflow_core::error::RoutingError;
use stepflow_core::flow::{FlowGraph, Node};
use stepflow_core::types::GraphStackFrame;

/// The run's nested flow stack. Index 0 is the root flow.
///
/// Frames and their graphs are kept side by side; the frame holds the
/// per-frame mutable state, the graph is the immutable snapshot the frame
/// executes.
#[derive(Debug, Clone)]
pub struct GraphStack {
    frames: Vec<GraphStackFrame>,
    graphs: Vec<Arc<FlowGraph>>,
    max_depth: usize,
}

impl GraphStack {
    pub fn new(root: Arc<FlowGraph>, goal: Option<String>, max_depth: usize) -> Self {
        let frame = GraphStackFrame::new(root.id.clone(), root.version).with_goal(goal);
        Self {
            frames: vec![frame],
            graphs: vec![root],
            max_depth,
        }
    }

    /// Index of the top frame; the root flow alone is depth 0.
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn can_push(&self) -> bool {
        self.depth() < self.max_depth
    }

    pub fn frames(&self) -> &[GraphStackFrame] {
        &self.frames
    }

    pub fn top(&self) -> &GraphStackFrame {
        &self.frames[self.frames.len() - 1]
    }

    pub fn top_mut(&mut self) -> &mut GraphStackFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    pub fn top_graph(&self) -> &Arc<FlowGraph> {
        &self.graphs[self.graphs.len() - 1]
    }

    pub fn root_graph(&self) -> &Arc<FlowGraph> {
        &self.graphs[0]
    }

    /// Resolve a node in the top frame: its graph first, then nodes
    /// appended by graph extension.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.top_graph()
            .node(id)
            .or_else(|| self.top().extensions.iter().find(|n| n.id == id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn push(
        &mut self,
        frame: GraphStackFrame,
        graph: Arc<FlowGraph>,
    ) -> Result<(), RoutingError> {
        if !self.can_push() {
            return Err(RoutingError::StackOverflow {
                depth: self.depth(),
                max: self.max_depth,
            });
        }
        self.frames.push(frame);
        self.graphs.push(graph);
        Ok(())
    }

    /// Pop the top frame. The root frame is never popped.
    pub fn pop(&mut self) -> Option<(GraphStackFrame, Arc<FlowGraph>)> {
        if self.depth() == 0 {
            return None;
        }
        let frame = self.frames.pop()?;
        let graph = self.graphs.pop()?;
        Some((frame, graph))
    }
}
