//! Routing: decides the next node after every step.
//!
//! Decisions are tried in a fixed order: an explicit override, the fast
//! path for trivially linear nodes, the node's routing rules, its
//! conditional edges, microloop semantics, and finally the default
//! continuation. When none applies the navigator escalates rather than
//! guessing.
//!
//! The navigator never mutates the stack. It returns a [`Transition`]
//! describing the decision and the stack operations it implies; the
//! orchestrator journals those and the run state applies them.

pub mod stack;

use std::sync::Arc;

use tracing::{debug, info};

use stepflow_core::error::RoutingError;
use stepflow_core::event::{CounterUpdate, StackPop, StackPush};
use stepflow_core::flow::{evaluate_condition, Edge, FlowGraph, Node, RoutingKind, RuleKind};
use stepflow_core::routing::{DecisionKind, DecisionSource, RoutingDecision};
use stepflow_core::types::{GraphStackFrame, StepResult};

use crate::catalog::FlowCatalog;

pub use stack::GraphStack;

/// What the navigator needs to know about the step that just finished.
#[derive(Debug, Clone)]
pub struct StepFacts<'a> {
    pub node_id: &'a str,
    pub step_seq: u64,
    pub result: &'a StepResult,
    /// References (receipt path, event sequence) attached to rule-driven
    /// deviations.
    pub evidence: Vec<String>,
    /// Operator or engine decision that bypasses normal routing.
    pub override_decision: Option<RoutingDecision>,
}

/// The outcome of one routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub decision: RoutingDecision,
    /// Node to run next after every stack operation; `None` completes the run.
    pub next_node: Option<String>,
    pub counter: Option<CounterUpdate>,
    pub push: Option<StackPush>,
    pub pops: Vec<StackPop>,
}

impl Transition {
    pub fn completes_run(&self) -> bool {
        self.next_node.is_none()
    }
}

/// A refused decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub error: RoutingError,
    /// Flow whose push was refused, for stack overflows.
    pub attempted: Option<String>,
}

impl From<RoutingError> for Escalation {
    fn from(error: RoutingError) -> Self {
        Self {
            error,
            attempted: None,
        }
    }
}

impl std::fmt::Display for Escalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.attempted {
            Some(flow) => write!(f, "{} (while entering '{}')", self.error, flow),
            None => write!(f, "{}", self.error),
        }
    }
}

pub struct Navigator {
    catalog: Arc<FlowCatalog>,
}

impl Navigator {
    pub fn new(catalog: Arc<FlowCatalog>) -> Self {
        Self { catalog }
    }

    pub fn decide(&self, stack: &GraphStack, step: StepFacts<'_>) -> Result<Transition, Escalation> {
        let graph = stack.top_graph();
        let node = stack
            .node(step.node_id)
            .ok_or_else(|| RoutingError::UnknownTarget {
                flow: graph.id.clone(),
                target: step.node_id.to_string(),
            })?;

        if let Some(decision) = step.override_decision.clone() {
            info!(node_id = %node.id, kind = %decision.kind, "Applying routing override");
            let decision = decision.with_source(DecisionSource::Override);
            let counter = loop_reset(stack, node, &decision);
            return self.apply(stack, node, decision, counter, &step);
        }

        let (decision, counter) = self.choose(stack, node, &step)?;
        let counter = counter.or_else(|| loop_reset(stack, node, &decision));
        self.apply(stack, node, decision, counter, &step)
    }

    fn choose(
        &self,
        stack: &GraphStack,
        node: &Node,
        step: &StepFacts<'_>,
    ) -> Result<(RoutingDecision, Option<CounterUpdate>), RoutingError> {
        let graph = stack.top_graph();
        let outgoing: Vec<&Edge> = graph.outgoing(&node.id).collect();

        if !node.is_microloop() && node.rules.is_empty() {
            let trivial = match outgoing.as_slice() {
                [] => true,
                [edge] => edge.is_unconditional() && node.next.is_none(),
                _ => false,
            };
            if trivial {
                let next = graph.default_next(node);
                return Ok((
                    RoutingDecision::continue_to(next, DecisionSource::FastPath),
                    None,
                ));
            }
        }

        let fields = step.result.routing_fields();
        if let Some(rule) = node
            .rules
            .iter()
            .find(|r| evaluate_condition(&r.when, &fields))
        {
            let reason = rule
                .reason
                .clone()
                .unwrap_or_else(|| format!("rule '{}' matched", rule.when));
            let decision = match rule.kind {
                RuleKind::Continue => {
                    RoutingDecision::continue_to(Some(rule.target.clone()), DecisionSource::Rule)
                }
                RuleKind::Detour => {
                    RoutingDecision::detour(rule.target.clone(), reason, step.evidence.clone())
                }
                RuleKind::InjectFlow => {
                    RoutingDecision::inject_flow(rule.target.clone(), reason, step.evidence.clone())
                }
            };
            debug!(node_id = %node.id, when = %rule.when, "Routing rule matched");
            return Ok((decision.with_source(DecisionSource::Rule), None));
        }

        if let Some(edge) = outgoing
            .iter()
            .filter(|e| !e.is_unconditional())
            .find(|e| e.matches(step.result))
        {
            return Ok((
                RoutingDecision::continue_to(Some(edge.to.clone()), DecisionSource::Edge),
                None,
            ));
        }

        let fallthrough = graph.default_next(node);

        if node.is_microloop() {
            let count = stack.top().counter(&node.id) + 1;
            let succeeded = node
                .success
                .as_ref()
                .is_some_and(|p| p.matches(step.result));
            let no_help = node.reports_no_help(step.result);
            if succeeded || no_help || count >= node.max_iterations {
                debug!(
                    node_id = %node.id,
                    iterations = count,
                    succeeded,
                    no_help,
                    "Microloop exit"
                );
                return Ok((
                    RoutingDecision::continue_to(fallthrough, DecisionSource::Microloop),
                    Some(CounterUpdate {
                        node_id: node.id.clone(),
                        value: 0,
                    }),
                ));
            }
            let target = node
                .loop_target
                .clone()
                .ok_or_else(|| RoutingError::NoApplicableRule {
                    node: node.id.clone(),
                })?;
            return Ok((
                RoutingDecision::continue_to(Some(target), DecisionSource::Microloop),
                Some(CounterUpdate {
                    node_id: node.id.clone(),
                    value: count,
                }),
            ));
        }

        match fallthrough {
            Some(next) => Ok((
                RoutingDecision::continue_to(Some(next), DecisionSource::Edge),
                None,
            )),
            // A linear node with no outgoing paths ends its flow.
            None if node.routing == RoutingKind::Linear && outgoing.is_empty() => Ok((
                RoutingDecision::continue_to(None, DecisionSource::Edge),
                None,
            )),
            None => Err(RoutingError::NoApplicableRule {
                node: node.id.clone(),
            }),
        }
    }

    fn apply(
        &self,
        stack: &GraphStack,
        node: &Node,
        mut decision: RoutingDecision,
        counter: Option<CounterUpdate>,
        step: &StepFacts<'_>,
    ) -> Result<Transition, Escalation> {
        decision.validate()?;

        let resume = stack.top_graph().default_next(node);
        let mut next_node = None;
        let mut push = None;
        let mut pops = Vec::new();
        let mut depth = stack.depth();

        match decision.kind {
            DecisionKind::Continue | DecisionKind::Detour => match decision.target.clone() {
                Some(target) => {
                    ensure_in_frame(stack, &target)?;
                    next_node = Some(target);
                }
                None => {
                    let (unwound, resume_at) = unwind(stack);
                    depth -= unwound.len();
                    pops = unwound;
                    next_node = resume_at;
                }
            },
            DecisionKind::InjectFlow => {
                let flow_id = decision.target.clone().unwrap_or_default();
                let graph = self
                    .catalog
                    .latest(&flow_id)
                    .ok_or_else(|| RoutingError::UnknownFlow(flow_id.clone()))?;
                let p = enter(stack, graph.as_ref().clone(), resume)?;
                next_node = Some(p.entry.clone());
                depth = p.depth;
                push = Some(p);
            }
            DecisionKind::InjectNodes => {
                let mut graph = FlowGraph::linear(
                    format!("{}~inject~{}", node.id, step.step_seq),
                    decision.nodes.clone(),
                );
                graph.description = decision.justification.clone();
                graph
                    .validate()
                    .map_err(|e| RoutingError::InvalidDecision(e.to_string()))?;
                let p = enter(stack, graph, resume)?;
                next_node = Some(p.entry.clone());
                depth = p.depth;
                push = Some(p);
            }
            DecisionKind::ExtendGraph => {
                decision.nodes = chain_extension(stack, decision.nodes.clone(), resume)?;
                next_node = decision.nodes.first().map(|n| n.id.clone());
            }
        }

        decision.resulting_stack_depth = depth;
        if decision.kind.is_deviation() {
            info!(
                node_id = %node.id,
                kind = %decision.kind,
                target = ?decision.target,
                depth,
                "Deviation decided"
            );
        } else {
            debug!(node_id = %node.id, next = ?next_node, source = decision.source.as_str(), "Route decided");
        }

        Ok(Transition {
            decision,
            next_node,
            counter,
            push,
            pops,
        })
    }
}

/// Clears a microloop node's counter when it routes anywhere but its loop
/// target.
fn loop_reset(stack: &GraphStack, node: &Node, decision: &RoutingDecision) -> Option<CounterUpdate> {
    if !node.is_microloop() || stack.top().counter(&node.id) == 0 {
        return None;
    }
    let loops_back = decision.kind == DecisionKind::Continue && decision.target == node.loop_target;
    (!loops_back).then(|| CounterUpdate {
        node_id: node.id.clone(),
        value: 0,
    })
}

fn ensure_in_frame(stack: &GraphStack, target: &str) -> Result<(), RoutingError> {
    if stack.contains(target) {
        Ok(())
    } else {
        Err(RoutingError::UnknownTarget {
            flow: stack.top().flow_id.clone(),
            target: target.to_string(),
        })
    }
}

/// Build the push for a child flow, refusing it at the depth limit.
fn enter(
    stack: &GraphStack,
    graph: FlowGraph,
    parent_resume_at: Option<String>,
) -> Result<StackPush, Escalation> {
    if !stack.can_push() {
        return Err(Escalation {
            error: RoutingError::StackOverflow {
                depth: stack.depth(),
                max: stack.max_depth(),
            },
            attempted: Some(graph.id),
        });
    }
    let entry = graph
        .entry_node()
        .ok_or_else(|| RoutingError::InvalidDecision(format!("flow '{}' has no entry", graph.id)))?
        .to_string();
    let frame = GraphStackFrame::new(graph.id.clone(), graph.version)
        .with_goal(stack.top().inherited_goal_context.clone());
    Ok(StackPush {
        frame,
        graph,
        entry,
        parent_resume_at,
        depth: stack.depth() + 1,
    })
}

/// Pops implied by reaching the end of the top flow. Stops at the first
/// parent with somewhere to resume; unwinding past the root completes the run.
fn unwind(stack: &GraphStack) -> (Vec<StackPop>, Option<String>) {
    let frames = stack.frames();
    let mut pops = Vec::new();
    let mut depth = stack.depth();
    while depth > 0 {
        let resume_at = frames[depth - 1].paused_at_node.clone();
        pops.push(StackPop {
            flow_id: frames[depth].flow_id.clone(),
            resume_at: resume_at.clone(),
            depth_after: depth - 1,
        });
        depth -= 1;
        if resume_at.is_some() {
            return (pops, resume_at);
        }
    }
    (pops, None)
}

/// Wire extension nodes into a chain ending at the current node's default
/// continuation.
fn chain_extension(
    stack: &GraphStack,
    mut nodes: Vec<Node>,
    resume: Option<String>,
) -> Result<Vec<Node>, RoutingError> {
    for n in &nodes {
        if stack.contains(&n.id) {
            return Err(RoutingError::InvalidDecision(format!(
                "extension node '{}' already exists in flow '{}'",
                n.id,
                stack.top().flow_id
            )));
        }
    }
    for i in 1..nodes.len() {
        if nodes[i - 1].next.is_none() {
            nodes[i - 1].next = Some(nodes[i].id.clone());
        }
    }
    if let Some(last) = nodes.last_mut() {
        if last.next.is_none() {
            last.next = resume;
        }
    }
    for n in &nodes {
        for target in [&n.next, &n.loop_target].into_iter().flatten() {
            let known = stack.contains(target) || nodes.iter().any(|m| &m.id == target);
            if !known {
                return Err(RoutingError::UnknownTarget {
                    flow: stack.top().flow_id.clone(),
                    target: target.clone(),
                });
            }
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_core::flow::{Edge, RoutingRule};

    fn evidence() -> Vec<String> {
        vec!["receipts/0001-a.json".into()]
    }

    fn facts<'a>(node_id: &'a str, result: &'a StepResult) -> StepFacts<'a> {
        StepFacts {
            node_id,
            step_seq: 1,
            result,
            evidence: evidence(),
            override_decision: None,
        }
    }

    fn navigator() -> Navigator {
        let catalog = FlowCatalog::new();
        catalog
            .register(FlowGraph::linear(
                "fix",
                vec![Node::new("patch", "fixer"), Node::new("recheck", "verifier")],
            ))
            .unwrap();
        Navigator::new(Arc::new(catalog))
    }

    fn stack(graph: FlowGraph) -> GraphStack {
        GraphStack::new(Arc::new(graph), None, 3)
    }

    fn review_loop() -> FlowGraph {
        FlowGraph::linear(
            "review",
            vec![
                Node::new("draft", "author"),
                Node::new("critique", "critic")
                    .microloop("draft", 3)
                    .with_success("verdict", &["approved"])
                    .with_can_help_field("can_further_iteration_help"),
                Node::new("publish", "publisher"),
            ],
        )
    }

    #[test]
    fn test_fast_path_and_completion() {
        let nav = navigator();
        let s = stack(FlowGraph::linear(
            "f",
            vec![Node::new("a", "author"), Node::new("b", "critic")],
        ));
        let ok = StepResult::succeeded("done");

        let t = nav.decide(&s, facts("a", &ok)).unwrap();
        assert_eq!(t.decision.source, DecisionSource::FastPath);
        assert_eq!(t.next_node.as_deref(), Some("b"));

        let t = nav.decide(&s, facts("b", &ok)).unwrap();
        assert!(t.completes_run());
        assert!(t.pops.is_empty());
    }

    #[test]
    fn test_microloop_runs_until_max_iterations() {
        let nav = navigator();
        let mut s = stack(review_loop());
        let rejected = StepResult::succeeded("nope").with_field("verdict", json!("rejected"));

        for expected in 1..=2 {
            let t = nav.decide(&s, facts("critique", &rejected)).unwrap();
            assert_eq!(t.decision.source, DecisionSource::Microloop);
            assert_eq!(t.next_node.as_deref(), Some("draft"));
            let counter = t.counter.unwrap();
            assert_eq!(counter.value, expected);
            s.top_mut()
                .iteration_counters
                .insert(counter.node_id, counter.value);
        }

        let t = nav.decide(&s, facts("critique", &rejected)).unwrap();
        assert_eq!(t.next_node.as_deref(), Some("publish"));
        assert_eq!(t.counter.unwrap().value, 0);
    }

    #[test]
    fn test_microloop_exits_on_success_or_no_help() {
        let nav = navigator();
        let s = stack(review_loop());

        let approved = StepResult::succeeded("ok").with_field("verdict", json!("APPROVED"));
        let t = nav.decide(&s, facts("critique", &approved)).unwrap();
        assert_eq!(t.next_node.as_deref(), Some("publish"));

        let stuck = StepResult::succeeded("meh")
            .with_field("verdict", json!("rejected"))
            .with_field("can_further_iteration_help", json!("no"));
        let t = nav.decide(&s, facts("critique", &stuck)).unwrap();
        assert_eq!(t.next_node.as_deref(), Some("publish"));
    }

    #[test]
    fn test_leaving_microloop_by_rule_resets_counter() {
        let nav = navigator();
        let graph = FlowGraph::linear(
            "review",
            vec![
                Node::new("draft", "author"),
                Node::new("critique", "critic")
                    .microloop("draft", 3)
                    .with_rule(RoutingRule::continue_to("verdict == \"abandon\"", "publish")),
                Node::new("publish", "publisher"),
            ],
        );
        let mut s = stack(graph);
        s.top_mut()
            .iteration_counters
            .insert("critique".into(), 2);

        let abandon = StepResult::succeeded("").with_field("verdict", json!("abandon"));
        let t = nav.decide(&s, facts("critique", &abandon)).unwrap();
        assert_eq!(t.decision.source, DecisionSource::Rule);
        assert_eq!(t.next_node.as_deref(), Some("publish"));
        assert_eq!(
            t.counter,
            Some(CounterUpdate {
                node_id: "critique".into(),
                value: 0
            })
        );

        let mut f = facts("critique", &abandon);
        f.override_decision = Some(RoutingDecision::continue_to(
            Some("draft".into()),
            DecisionSource::Override,
        ));
        let t = nav.decide(&s, f).unwrap();
        assert_eq!(t.next_node.as_deref(), Some("draft"));
        assert!(t.counter.is_none());

        s.top_mut().iteration_counters.clear();
        let t = nav.decide(&s, facts("critique", &abandon)).unwrap();
        assert!(t.counter.is_none());
    }

    #[test]
    fn test_rules_take_precedence_over_edges() {
        let nav = navigator();
        let graph = FlowGraph::new("g")
            .with_node(
                Node::new("gate", "gatekeeper")
                    .branch()
                    .with_rule(RoutingRule::detour("risk == \"high\"", "audit", "high risk needs audit")),
            )
            .with_node(Node::new("audit", "auditor"))
            .with_node(Node::new("ship", "publisher"))
            .with_edge(Edge::conditional("gate", "ship", "risk == \"low\""))
            .with_edge(Edge::conditional("gate", "audit", "risk == \"high\""));
        let s = stack(graph);

        let high = StepResult::succeeded("").with_field("risk", json!("high"));
        let t = nav.decide(&s, facts("gate", &high)).unwrap();
        assert_eq!(t.decision.kind, DecisionKind::Detour);
        assert_eq!(t.decision.source, DecisionSource::Rule);
        assert_eq!(t.decision.evidence, evidence());
        assert_eq!(t.next_node.as_deref(), Some("audit"));

        let low = StepResult::succeeded("").with_field("risk", json!("low"));
        let t = nav.decide(&s, facts("gate", &low)).unwrap();
        assert_eq!(t.decision.source, DecisionSource::Edge);
        assert_eq!(t.next_node.as_deref(), Some("ship"));

        let unknown = StepResult::succeeded("").with_field("risk", json!("medium"));
        let err = nav.decide(&s, facts("gate", &unknown)).unwrap_err();
        assert_eq!(
            err.error,
            RoutingError::NoApplicableRule {
                node: "gate".into()
            }
        );
    }

    #[test]
    fn test_unmatched_rules_on_terminal_node_end_flow() {
        let nav = navigator();
        let graph = FlowGraph::linear(
            "f",
            vec![
                Node::new("a", "author"),
                Node::new("b", "critic").with_rule(RoutingRule::detour(
                    "status == \"failed\"",
                    "a",
                    "retry the draft",
                )),
            ],
        );
        let s = stack(graph);

        let t = nav.decide(&s, facts("b", &StepResult::succeeded("fine"))).unwrap();
        assert_eq!(t.decision.source, DecisionSource::Edge);
        assert!(t.completes_run());

        let t = nav.decide(&s, facts("b", &StepResult::failed("broke"))).unwrap();
        assert_eq!(t.decision.kind, DecisionKind::Detour);
        assert_eq!(t.next_node.as_deref(), Some("a"));
    }

    #[test]
    fn test_rule_deviation_without_evidence_escalates() {
        let nav = navigator();
        let graph = FlowGraph::new("g")
            .with_node(
                Node::new("gate", "gatekeeper")
                    .with_next("ship")
                    .with_rule(RoutingRule::detour("status == \"failed\"", "ship", "skip ahead")),
            )
            .with_node(Node::new("ship", "publisher"));
        let s = stack(graph);
        let failed = StepResult::failed("boom");
        let mut f = facts("gate", &failed);
        f.evidence.clear();
        let err = nav.decide(&s, f).unwrap_err();
        assert!(matches!(err.error, RoutingError::MissingEvidence { .. }));
    }

    #[test]
    fn test_inject_flow_pushes_and_unwinds() {
        let nav = navigator();
        let graph = FlowGraph::linear(
            "main",
            vec![
                Node::new("build", "builder").with_rule(RoutingRule::inject_flow(
                    "status == \"failed\"",
                    "fix",
                    "build broke",
                )),
                Node::new("deploy", "deployer"),
            ],
        );
        let mut s = stack(graph);
        let failed = StepResult::failed("compile error");

        let t = nav.decide(&s, facts("build", &failed)).unwrap();
        let push = t.push.clone().unwrap();
        assert_eq!(t.decision.kind, DecisionKind::InjectFlow);
        assert_eq!(t.decision.resulting_stack_depth, 1);
        assert_eq!(push.parent_resume_at.as_deref(), Some("deploy"));
        assert_eq!(push.entry, "patch");
        assert_eq!(t.next_node.as_deref(), Some("patch"));

        s.top_mut().paused_at_node = push.parent_resume_at.clone();
        s.push(push.frame, Arc::new(push.graph)).unwrap();

        let ok = StepResult::succeeded("fixed");
        let t = nav.decide(&s, facts("recheck", &ok)).unwrap();
        assert_eq!(t.pops.len(), 1);
        assert_eq!(t.pops[0].flow_id, "fix");
        assert_eq!(t.next_node.as_deref(), Some("deploy"));
        assert_eq!(t.decision.resulting_stack_depth, 0);
    }

    #[test]
    fn test_inject_at_max_depth_is_refused() {
        let nav = navigator();
        let mut s = GraphStack::new(
            Arc::new(FlowGraph::linear("main", vec![Node::new("a", "author")])),
            None,
            1,
        );
        s.push(
            GraphStackFrame::new("child", 1),
            Arc::new(FlowGraph::linear("child", vec![Node::new("c", "author")])),
        )
        .unwrap();

        let ok = StepResult::succeeded("");
        let mut f = facts("c", &ok);
        f.override_decision = Some(RoutingDecision::inject_flow("fix", "again", evidence()));
        let err = nav.decide(&s, f).unwrap_err();
        assert_eq!(err.error, RoutingError::StackOverflow { depth: 1, max: 1 });
        assert_eq!(err.attempted.as_deref(), Some("fix"));
    }

    #[test]
    fn test_unknown_flow_escalates() {
        let nav = navigator();
        let s = stack(FlowGraph::linear("main", vec![Node::new("a", "author")]));
        let ok = StepResult::succeeded("");
        let mut f = facts("a", &ok);
        f.override_decision = Some(RoutingDecision::inject_flow("ghost", "why", evidence()));
        let err = nav.decide(&s, f).unwrap_err();
        assert_eq!(err.error, RoutingError::UnknownFlow("ghost".into()));
    }

    #[test]
    fn test_inject_nodes_builds_synthetic_flow() {
        let nav = navigator();
        let s = stack(FlowGraph::linear(
            "main",
            vec![Node::new("a", "author"), Node::new("b", "critic")],
        ));
        let ok = StepResult::succeeded("");
        let mut f = facts("a", &ok);
        f.override_decision = Some(RoutingDecision::inject_nodes(
            vec![Node::new("lint", "linter"), Node::new("format", "formatter")],
            "style drift",
            evidence(),
        ));
        let t = nav.decide(&s, f).unwrap();
        let push = t.push.unwrap();
        assert_eq!(push.graph.id, "a~inject~1");
        assert_eq!(push.graph.nodes[0].next.as_deref(), Some("format"));
        assert_eq!(push.parent_resume_at.as_deref(), Some("b"));
        assert_eq!(t.next_node.as_deref(), Some("lint"));
    }

    #[test]
    fn test_extend_graph_chains_to_default_continuation() {
        let nav = navigator();
        let s = stack(FlowGraph::linear(
            "main",
            vec![Node::new("a", "author"), Node::new("b", "critic")],
        ));
        let ok = StepResult::succeeded("");
        let mut f = facts("a", &ok);
        f.override_decision = Some(RoutingDecision::extend_graph(
            vec![Node::new("x1", "researcher"), Node::new("x2", "summarizer")],
            "needs background",
            evidence(),
        ));
        let t = nav.decide(&s, f).unwrap();
        assert!(t.push.is_none());
        assert_eq!(t.next_node.as_deref(), Some("x1"));
        assert_eq!(t.decision.nodes[0].next.as_deref(), Some("x2"));
        assert_eq!(t.decision.nodes[1].next.as_deref(), Some("b"));

        let mut f = facts("a", &ok);
        f.override_decision = Some(RoutingDecision::extend_graph(
            vec![Node::new("b", "dup")],
            "collides",
            evidence(),
        ));
        assert!(matches!(
            nav.decide(&s, f).unwrap_err().error,
            RoutingError::InvalidDecision(_)
        ));
    }

    #[test]
    fn test_override_validation() {
        let nav = navigator();
        let s = stack(FlowGraph::linear(
            "main",
            vec![Node::new("a", "author"), Node::new("b", "critic")],
        ));
        let ok = StepResult::succeeded("");

        let mut f = facts("a", &ok);
        f.override_decision = Some(RoutingDecision::detour("b", "  ", evidence()));
        assert!(matches!(
            nav.decide(&s, f).unwrap_err().error,
            RoutingError::MissingJustification { .. }
        ));

        let mut f = facts("a", &ok);
        f.override_decision = Some(RoutingDecision::detour("nowhere", "why", evidence()));
        assert!(matches!(
            nav.decide(&s, f).unwrap_err().error,
            RoutingError::UnknownTarget { .. }
        ));

        let mut f = facts("b", &ok);
        f.override_decision = Some(RoutingDecision::detour("a", "redo", evidence()));
        let t = nav.decide(&s, f).unwrap();
        assert_eq!(t.decision.source, DecisionSource::Override);
        assert_eq!(t.next_node.as_deref(), Some("a"));
    }
}
