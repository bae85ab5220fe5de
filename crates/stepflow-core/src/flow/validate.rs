use std::collections::{HashMap, HashSet, VecDeque};

use super::edge::{is_well_formed, EdgeCondition};
use super::node::{RoutingKind, RuleKind};
use super::FlowGraph;

/// Collect every structural problem in the graph.
pub(super) fn problems(graph: &FlowGraph) -> Vec<String> {
    let mut problems = Vec::new();

    if graph.id.trim().is_empty() {
        problems.push("flow id is empty".to_string());
    }
    if graph.nodes.is_empty() {
        problems.push("flow has no nodes".to_string());
        return problems;
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for node in &graph.nodes {
        if node.id.trim().is_empty() {
            problems.push("node with empty id".to_string());
        } else if !ids.insert(node.id.as_str()) {
            problems.push(format!("duplicate node '{}'", node.id));
        }
    }

    if let Some(entry) = &graph.entry {
        if !ids.contains(entry.as_str()) {
            problems.push(format!("entry '{}' does not exist", entry));
        }
    }

    for node in &graph.nodes {
        if let Some(next) = &node.next {
            if !ids.contains(next.as_str()) {
                problems.push(format!("node '{}' has dangling next '{}'", node.id, next));
            }
        }
        if let Some(target) = &node.loop_target {
            if !ids.contains(target.as_str()) {
                problems.push(format!(
                    "node '{}' has dangling loop_target '{}'",
                    node.id, target
                ));
            }
        }

        match node.routing {
            RoutingKind::Microloop => {
                if node.loop_target.is_none() {
                    problems.push(format!("microloop node '{}' has no loop_target", node.id));
                }
                if node.max_iterations == 0 {
                    problems.push(format!("microloop node '{}' has max_iterations 0", node.id));
                }
            }
            RoutingKind::Branch => {
                if node.rules.is_empty() && graph.outgoing(&node.id).next().is_none() {
                    problems.push(format!("branch node '{}' has no rules or edges", node.id));
                }
            }
            RoutingKind::Linear => {}
        }

        for rule in &node.rules {
            if !is_well_formed(&rule.when) {
                problems.push(format!(
                    "node '{}' has unparseable rule condition '{}'",
                    node.id, rule.when
                ));
            }
            if rule.targets_node() && !ids.contains(rule.target.as_str()) {
                problems.push(format!(
                    "node '{}' has rule targeting unknown node '{}'",
                    node.id, rule.target
                ));
            }
            if rule.kind != RuleKind::Continue
                && rule.reason.as_deref().map_or(true, |r| r.trim().is_empty())
            {
                problems.push(format!(
                    "node '{}' has a deviating rule to '{}' without a reason",
                    node.id, rule.target
                ));
            }
        }
    }

    for edge in &graph.edges {
        if !ids.contains(edge.from.as_str()) {
            problems.push(format!("edge from unknown node '{}'", edge.from));
        }
        if !ids.contains(edge.to.as_str()) {
            problems.push(format!("edge to unknown node '{}'", edge.to));
        }
        if let EdgeCondition::Conditional { expr } = &edge.condition {
            if !is_well_formed(expr) {
                problems.push(format!(
                    "edge '{}' -> '{}' has unparseable condition '{}'",
                    edge.from, edge.to, expr
                ));
            }
        }
    }

    // Structure checks below assume references resolve.
    if !problems.is_empty() {
        return problems;
    }

    if let Some(cycle) = find_cycle(graph) {
        problems.push(format!(
            "cycle without loop semantics: {}",
            cycle.join(" -> ")
        ));
    }

    let reachable = reachable_from_entry(graph);
    for node in &graph.nodes {
        if !reachable.contains(node.id.as_str()) {
            problems.push(format!("node '{}' is unreachable", node.id));
        }
    }

    problems
}

/// Continuation edges: `next` and declared edges. Loop targets and
/// deviating rules carry loop semantics and are left out.
fn continuation_edges(graph: &FlowGraph) -> HashMap<&str, Vec<&str>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &graph.nodes {
        let targets = adj.entry(node.id.as_str()).or_default();
        if let Some(next) = &node.next {
            targets.push(next.as_str());
        }
        for rule in &node.rules {
            if rule.kind == RuleKind::Continue {
                targets.push(rule.target.as_str());
            }
        }
    }
    for edge in &graph.edges {
        adj.entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }
    adj
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

fn find_cycle(graph: &FlowGraph) -> Option<Vec<String>> {
    let adj = continuation_edges(graph);
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for node in &graph.nodes {
        if marks.contains_key(node.id.as_str()) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        if let Some(cycle) = visit(node.id.as_str(), &adj, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    adj: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(id, Mark::Visiting);
    path.push(id);
    for &next in adj.get(id).map(Vec::as_slice).unwrap_or_default() {
        match marks.get(next) {
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(cycle) = visit(next, adj, marks, path) {
                    return Some(cycle);
                }
            }
        }
    }
    path.pop();
    marks.insert(id, Mark::Done);
    None
}

fn reachable_from_entry(graph: &FlowGraph) -> HashSet<&str> {
    let mut seen = HashSet::new();
    let Some(entry) = graph.entry_node() else {
        return seen;
    };

    let mut adj: HashMap<&str, Vec<&str>> = continuation_edges(graph);
    for node in &graph.nodes {
        let targets = adj.entry(node.id.as_str()).or_default();
        if let Some(target) = &node.loop_target {
            targets.push(target.as_str());
        }
        for rule in node.rules.iter().filter(|r| r.kind == RuleKind::Detour) {
            targets.push(rule.target.as_str());
        }
    }

    let mut queue = VecDeque::from([entry]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(targets) = adj.get(id) {
            queue.extend(targets.iter().copied());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Edge, Node, RoutingRule};

    fn problems_of(graph: &FlowGraph) -> Vec<String> {
        problems(graph)
    }

    #[test]
    fn test_valid_microloop_flow() {
        let graph = FlowGraph::linear(
            "review",
            vec![
                Node::new("author", "author"),
                Node::new("critic", "critic").microloop("author", 3),
                Node::new("publish", "publisher"),
            ],
        );
        assert!(problems_of(&graph).is_empty());
    }

    #[test]
    fn test_dangling_references_reported_together() {
        let graph = FlowGraph::new("bad")
            .with_node(Node::new("a", "r").with_next("ghost"))
            .with_node(Node::new("b", "r").microloop("phantom", 2))
            .with_edge(Edge::always("a", "nowhere"));
        let problems = problems_of(&graph);
        assert!(problems.iter().any(|p| p.contains("dangling next 'ghost'")));
        assert!(problems.iter().any(|p| p.contains("dangling loop_target 'phantom'")));
        assert!(problems.iter().any(|p| p.contains("edge to unknown node 'nowhere'")));
    }

    #[test]
    fn test_duplicate_ids() {
        let graph = FlowGraph::new("dup")
            .with_node(Node::new("a", "r"))
            .with_node(Node::new("a", "r"));
        assert_eq!(problems_of(&graph), vec!["duplicate node 'a'"]);
    }

    #[test]
    fn test_cycle_without_loop_semantics_rejected() {
        let graph = FlowGraph::new("cyc")
            .with_node(Node::new("a", "r").with_next("b"))
            .with_node(Node::new("b", "r").with_next("a"));
        let problems = problems_of(&graph);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("a -> b -> a"));
    }

    #[test]
    fn test_detour_rule_back_edge_is_not_a_cycle() {
        let graph = FlowGraph::linear(
            "fix",
            vec![
                Node::new("build", "implementer"),
                Node::new("verify", "verifier").with_rule(RoutingRule::detour(
                    r#"verdict == "fail""#,
                    "build",
                    "verification failed",
                )),
                Node::new("ship", "publisher"),
            ],
        );
        assert!(problems_of(&graph).is_empty());
    }

    #[test]
    fn test_unreachable_node() {
        let graph = FlowGraph::new("island")
            .with_node(Node::new("a", "r"))
            .with_node(Node::new("b", "r"));
        assert_eq!(problems_of(&graph), vec!["node 'b' is unreachable"]);
    }

    #[test]
    fn test_microloop_and_branch_shape() {
        let mut looped = Node::new("c", "critic").microloop("a", 0);
        looped.loop_target = None;
        let graph = FlowGraph::new("shape")
            .with_node(Node::new("a", "r").with_next("c"))
            .with_node(looped)
            .with_node(Node::new("b", "r").branch());
        let problems = problems_of(&graph);
        assert!(problems.iter().any(|p| p.contains("has no loop_target")));
        assert!(problems.iter().any(|p| p.contains("max_iterations 0")));
        assert!(problems.iter().any(|p| p.contains("branch node 'b'")));
    }

    #[test]
    fn test_deviating_rule_requires_reason() {
        let mut rule = RoutingRule::detour(r#"status == "failed""#, "a", "x");
        rule.reason = None;
        let graph = FlowGraph::new("r")
            .with_node(Node::new("a", "r").with_next("b"))
            .with_node(Node::new("b", "r").with_rule(rule));
        let problems = problems_of(&graph);
        assert!(problems.iter().any(|p| p.contains("without a reason")));
    }

    #[test]
    fn test_unparseable_condition() {
        let graph = FlowGraph::new("c")
            .with_node(Node::new("a", "r"))
            .with_node(Node::new("b", "r"))
            .with_edge(Edge::conditional("a", "b", "verdict is good"));
        let problems = problems_of(&graph);
        assert!(problems.iter().any(|p| p.contains("unparseable condition")));
    }

    #[test]
    fn test_missing_entry() {
        let graph = FlowGraph::new("e")
            .with_node(Node::new("a", "r"))
            .with_entry("zzz");
        assert!(problems_of(&graph)
            .iter()
            .any(|p| p.contains("entry 'zzz' does not exist")));
    }
}
