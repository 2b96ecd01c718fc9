use std::collections::{BTreeMap, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use tracelink_config::TraversalConfig;
use tracelink_core::{
    ApiExposure, CodeNode, CodeNodeId, Direction, RelationshipType, graph_fingerprint,
};
use tracelink_store::{CodeNodeFilter, GraphStore};
use tracing::{debug, warn};

use crate::AnalysisError;

const ROOT_SORT_KEY: &str = "1";
/// Sort-key segment for call edges without a call_order. Sorts after every
/// zero-padded real value.
pub const MISSING_CALL_ORDER: &str = "999~";

/// How a caller names the node a query starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSelector {
    Name {
        name: String,
        service: Option<String>,
    },
    Endpoint(ApiExposure),
    Id(CodeNodeId),
}

impl NodeSelector {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name {
            name: name.into(),
            service: None,
        }
    }

    pub fn in_service(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self::Name {
            name: name.into(),
            service: Some(service.into()),
        }
    }

    /// `"POST /orders"` selects by endpoint; anything else is a node name.
    pub fn parse(reference: &str, service: Option<&str>) -> Self {
        let reference = reference.trim();
        if let Some(api) = ApiExposure::parse(reference)
            && api.path.starts_with('/')
        {
            return Self::Endpoint(api);
        }
        Self::Name {
            name: reference.to_owned(),
            service: service
                .map(str::trim)
                .filter(|service| !service.is_empty())
                .map(str::to_owned),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Name {
                name,
                service: Some(service),
            } => format!("{service}:{name}"),
            Self::Name {
                name,
                service: None,
            } => name.clone(),
            Self::Endpoint(api) => api.endpoint(),
            Self::Id(id) => format!("code:{id}"),
        }
    }
}

/// One visited path prefix. Forward depths are positive, backward depths
/// are non-positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraversalStep {
    pub depth: i32,
    pub node: CodeNode,
    pub via: Option<RelationshipType>,
    pub call_order: Option<u32>,
    pub sort_key: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    Root,
    Leaf,
    Both,
    Neither,
}

impl NodeClass {
    fn from_flags(root: bool, leaf: bool) -> Self {
        match (root, leaf) {
            (true, true) => Self::Both,
            (true, false) => Self::Root,
            (false, true) => Self::Leaf,
            (false, false) => Self::Neither,
        }
    }

    pub fn is_root(self) -> bool {
        matches!(self, Self::Root | Self::Both)
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, Self::Leaf | Self::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedNode {
    pub node: CodeNode,
    pub class: NodeClass,
}

/// Nearest API-exposed ancestor along one backward branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootAncestor {
    pub depth: i32,
    pub node: CodeNode,
    pub endpoint: Option<String>,
    pub path: String,
    /// Names from the ancestor down to the queried node.
    pub route: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallChain {
    pub depth: u32,
    pub root: String,
    pub leaf: String,
    pub nodes: Vec<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallCycle {
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct CallEdge {
    id: i64,
    kind: RelationshipType,
    from: CodeNodeId,
    to: CodeNodeId,
    call_order: Option<u32>,
}

impl CallEdge {
    fn far_end(&self, direction: Direction) -> CodeNodeId {
        match direction {
            Direction::Outgoing => self.to,
            Direction::Incoming => self.from,
        }
    }
}

struct Frame {
    node: CodeNodeId,
    depth: u32,
    via: Option<RelationshipType>,
    call_order: Option<u32>,
    sort_key: String,
    trail: Vec<CodeNodeId>,
}

/// Visited path prefix before it is turned into a public record.
struct Visit {
    node: CodeNodeId,
    depth: u32,
    via: Option<RelationshipType>,
    call_order: Option<u32>,
    sort_key: String,
    trail: Vec<CodeNodeId>,
}

/// Call-path queries over a snapshot of the code graph. The snapshot holds
/// every code node and every CALLS/API_CALLS/EXPOSES edge at load time.
pub struct TraversalEngine {
    config: TraversalConfig,
    nodes: BTreeMap<CodeNodeId, CodeNode>,
    outgoing: HashMap<CodeNodeId, Vec<CallEdge>>,
    incoming: HashMap<CodeNodeId, Vec<CallEdge>>,
    fingerprint: String,
}

impl TraversalEngine {
    pub fn load<S: GraphStore + ?Sized>(
        store: &S,
        config: &TraversalConfig,
    ) -> Result<Self, AnalysisError> {
        let nodes = store.code_nodes(&CodeNodeFilter::default())?;
        let edges = store.edges_of_types(&RelationshipType::CALL_TYPES)?;
        let fingerprint = graph_fingerprint(&nodes, &edges);

        let mut outgoing = HashMap::<CodeNodeId, Vec<CallEdge>>::new();
        let mut incoming = HashMap::<CodeNodeId, Vec<CallEdge>>::new();
        for edge in &edges {
            let call = CallEdge {
                id: edge.id,
                kind: edge.kind,
                from: edge.from.id,
                to: edge.to.id,
                call_order: edge.call_order,
            };
            outgoing.entry(call.from).or_default().push(call);
            incoming.entry(call.to).or_default().push(call);
        }
        for list in outgoing.values_mut().chain(incoming.values_mut()) {
            list.sort_by_key(|edge| (edge.call_order.is_none(), edge.call_order, edge.id));
        }

        debug!(
            nodes = nodes.len(),
            call_edges = edges.len(),
            "loaded call graph snapshot"
        );
        Ok(Self {
            config: config.clone(),
            nodes: nodes.into_iter().map(|node| (node.id, node)).collect(),
            outgoing,
            incoming,
            fingerprint,
        })
    }

    /// Fingerprint of the snapshot, comparable with stored workflow fingerprints.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn node(&self, id: CodeNodeId) -> Option<&CodeNode> {
        self.nodes.get(&id)
    }

    pub fn resolve(&self, selector: &NodeSelector) -> Result<&CodeNode, AnalysisError> {
        let candidates = match selector {
            NodeSelector::Id(id) => self.nodes.get(id).into_iter().collect::<Vec<_>>(),
            NodeSelector::Endpoint(api) => self
                .nodes
                .values()
                .filter(|node| node.api.as_ref() == Some(api))
                .collect(),
            NodeSelector::Name { name, service } => self
                .nodes
                .values()
                .filter(|node| node.name == name.trim())
                .filter(|node| {
                    service
                        .as_deref()
                        .is_none_or(|service| node.service == service.trim())
                })
                .collect(),
        };

        match candidates.as_slice() {
            [] => Err(AnalysisError::NotFound(selector.describe())),
            [node] => Ok(node),
            many => {
                let mut candidates = many
                    .iter()
                    .map(|node| node.qualified_name())
                    .collect::<Vec<_>>();
                candidates.sort();
                Err(AnalysisError::Ambiguous {
                    reference: selector.describe(),
                    candidates,
                })
            }
        }
    }

    pub fn forward(
        &self,
        selector: &NodeSelector,
        max_depth: Option<u32>,
    ) -> Result<Vec<TraversalStep>, AnalysisError> {
        let start = self.resolve(selector)?.id;
        self.forward_from(start, max_depth)
    }

    pub fn backward(
        &self,
        selector: &NodeSelector,
        max_depth: Option<u32>,
    ) -> Result<Vec<TraversalStep>, AnalysisError> {
        let target = self.resolve(selector)?.id;
        self.backward_from(target, max_depth)
    }

    /// Callees of `start` in pre-order. Children are visited by call_order,
    /// so the output is ascending by sort key.
    pub fn forward_from(
        &self,
        start: CodeNodeId,
        max_depth: Option<u32>,
    ) -> Result<Vec<TraversalStep>, AnalysisError> {
        let depth = self.config.effective_depth(max_depth);
        let visits = self.walk(start, Direction::Outgoing, depth)?;
        Ok(visits
            .into_iter()
            .filter_map(|visit| self.step(visit, Direction::Outgoing))
            .collect())
    }

    /// Callers of `target`, farthest ancestors first, then by sort key.
    pub fn backward_from(
        &self,
        target: CodeNodeId,
        max_depth: Option<u32>,
    ) -> Result<Vec<TraversalStep>, AnalysisError> {
        let depth = self.config.effective_depth(max_depth);
        let visits = self.walk(target, Direction::Incoming, depth)?;
        let mut steps = visits
            .into_iter()
            .filter_map(|visit| self.step(visit, Direction::Incoming))
            .collect::<Vec<_>>();
        steps.sort_by(|left, right| {
            left.depth
                .cmp(&right.depth)
                .then_with(|| left.sort_key.cmp(&right.sort_key))
                .then_with(|| left.path.cmp(&right.path))
        });
        Ok(steps)
    }

    /// Unbounded forward traversal, capped only by `max_depth_limit`.
    pub fn unbounded_forward(&self, start: CodeNodeId) -> Result<Vec<TraversalStep>, AnalysisError> {
        self.forward_from(start, Some(u32::MAX))
    }

    pub fn classify(&self, id: CodeNodeId) -> Option<NodeClass> {
        let node = self.nodes.get(&id)?;
        let root = node.is_api_exposed() && self.callers(id).is_empty();
        Some(NodeClass::from_flags(root, self.is_leaf(id)))
    }

    pub fn classification(&self) -> Vec<ClassifiedNode> {
        self.nodes
            .values()
            .filter_map(|node| {
                self.classify(node.id).map(|class| ClassifiedNode {
                    node: node.clone(),
                    class,
                })
            })
            .collect()
    }

    pub fn roots(&self) -> Vec<&CodeNode> {
        self.nodes
            .values()
            .filter(|node| self.classify(node.id).is_some_and(NodeClass::is_root))
            .collect()
    }

    pub fn leaves(&self) -> Vec<&CodeNode> {
        self.nodes
            .values()
            .filter(|node| self.classify(node.id).is_some_and(NodeClass::is_leaf))
            .collect()
    }

    /// First API-exposed ancestor on every backward branch of `selector`,
    /// nearest first; ties by service name, then endpoint.
    pub fn roots_of(&self, selector: &NodeSelector) -> Result<Vec<RootAncestor>, AnalysisError> {
        let target = self.resolve(selector)?;
        if target.is_api_exposed() && self.callers(target.id).is_empty() {
            return Ok(vec![RootAncestor {
                depth: 0,
                node: target.clone(),
                endpoint: target.endpoint(),
                path: target.name.clone(),
                route: vec![target.name.clone()],
            }]);
        }

        let limit = self.config.effective_depth(Some(u32::MAX));
        let visits = self.walk_until(target.id, Direction::Incoming, limit, |node| {
            node.is_api_exposed()
        })?;

        let mut nearest = BTreeMap::<CodeNodeId, RootAncestor>::new();
        for visit in visits {
            if visit.depth == 0 {
                continue;
            }
            let Some(node) = self.nodes.get(&visit.node) else {
                continue;
            };
            if !node.is_api_exposed() {
                continue;
            }
            let candidate = RootAncestor {
                depth: -(visit.depth as i32),
                node: node.clone(),
                endpoint: node.endpoint(),
                path: self.render_path(&visit.trail, Direction::Incoming),
                route: self.names(&visit.trail).into_iter().rev().collect(),
            };
            match nearest.get(&node.id) {
                Some(existing) if existing.depth >= candidate.depth => {}
                _ => {
                    nearest.insert(node.id, candidate);
                }
            }
        }

        let mut ancestors = nearest.into_values().collect::<Vec<_>>();
        ancestors.sort_by(|left, right| {
            left.depth
                .unsigned_abs()
                .cmp(&right.depth.unsigned_abs())
                .then_with(|| left.node.service.cmp(&right.node.service))
                .then_with(|| left.endpoint.cmp(&right.endpoint))
                .then_with(|| left.node.id.cmp(&right.node.id))
        });
        Ok(ancestors)
    }

    /// The `n` deepest root-to-leaf paths across every root. Roots whose
    /// traversal runs into a cycle are skipped. A chain ends at every leaf
    /// it reaches, so a node whose only outgoing edges are EXPOSES closes
    /// a chain and may also continue into a longer one.
    pub fn longest_chains(&self, n: usize) -> Result<Vec<CallChain>, AnalysisError> {
        let limit = self.config.effective_depth(Some(u32::MAX));
        let mut chains = Vec::new();
        for root in self.roots() {
            let visits = match self.walk(root.id, Direction::Outgoing, limit) {
                Ok(visits) => visits,
                Err(AnalysisError::CycleDetected { path }) => {
                    warn!(root = %root.name, %path, "skipping cyclic root in longest chains");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for visit in visits {
                if !self.is_leaf(visit.node) {
                    continue;
                }
                let nodes = self.names(&visit.trail);
                chains.push(CallChain {
                    depth: visit.depth,
                    root: root.name.clone(),
                    leaf: nodes.last().cloned().unwrap_or_default(),
                    path: nodes.join(" -> "),
                    nodes,
                });
            }
        }

        chains.sort_by(|left, right| {
            right
                .depth
                .cmp(&left.depth)
                .then_with(|| left.path.cmp(&right.path))
        });
        chains.truncate(n);
        Ok(chains)
    }

    /// Strongly connected components of the call graph that contain a cycle.
    pub fn call_cycles(&self) -> Vec<CallCycle> {
        let mut graph = DiGraph::<CodeNodeId, ()>::new();
        let mut index = HashMap::<CodeNodeId, NodeIndex>::new();
        for id in self.nodes.keys() {
            index.insert(*id, graph.add_node(*id));
        }
        for edges in self.outgoing.values() {
            for edge in edges {
                if let (Some(from), Some(to)) = (index.get(&edge.from), index.get(&edge.to)) {
                    graph.add_edge(*from, *to, ());
                }
            }
        }

        let mut cycles = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|node| graph.contains_edge(*node, *node))
            })
            .map(|component| {
                let mut nodes = component
                    .into_iter()
                    .filter_map(|node| self.nodes.get(&graph[node]))
                    .map(CodeNode::qualified_name)
                    .collect::<Vec<_>>();
                nodes.sort();
                CallCycle { nodes }
            })
            .collect::<Vec<_>>();
        cycles.sort_by(|left, right| left.nodes.cmp(&right.nodes));
        cycles
    }

    fn callees(&self, id: CodeNodeId) -> &[CallEdge] {
        self.outgoing.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// No outgoing CALLS or API_CALLS; EXPOSES edges do not count.
    fn is_leaf(&self, id: CodeNodeId) -> bool {
        !self
            .callees(id)
            .iter()
            .any(|edge| matches!(edge.kind, RelationshipType::Calls | RelationshipType::ApiCalls))
    }

    fn callers(&self, id: CodeNodeId) -> &[CallEdge] {
        self.incoming.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    fn walk(
        &self,
        start: CodeNodeId,
        direction: Direction,
        max_depth: u32,
    ) -> Result<Vec<Visit>, AnalysisError> {
        self.walk_until(start, direction, max_depth, |_| false)
    }

    /// Explicit-stack DFS emitting every path prefix in pre-order. `stop`
    /// prevents expansion past a node other than the start. Revisiting a
    /// node already on the current path is a cycle.
    fn walk_until(
        &self,
        start: CodeNodeId,
        direction: Direction,
        max_depth: u32,
        stop: impl Fn(&CodeNode) -> bool,
    ) -> Result<Vec<Visit>, AnalysisError> {
        if !self.nodes.contains_key(&start) {
            return Err(AnalysisError::NotFound(format!("code:{start}")));
        }

        let mut visits = Vec::new();
        let mut stack = vec![Frame {
            node: start,
            depth: 0,
            via: None,
            call_order: None,
            sort_key: ROOT_SORT_KEY.to_owned(),
            trail: vec![start],
        }];

        while let Some(frame) = stack.pop() {
            let halted = frame.depth > 0 && self.nodes.get(&frame.node).is_some_and(&stop);
            if frame.depth < max_depth && !halted {
                let edges = match direction {
                    Direction::Outgoing => self.callees(frame.node),
                    Direction::Incoming => self.callers(frame.node),
                };
                for edge in edges.iter().rev() {
                    let next = edge.far_end(direction);
                    if !self.nodes.contains_key(&next) {
                        continue;
                    }
                    if let Some(position) = frame.trail.iter().position(|id| *id == next) {
                        let mut cycle = frame.trail[position..].to_vec();
                        cycle.push(next);
                        return Err(AnalysisError::CycleDetected {
                            path: self.render_path(&cycle, direction),
                        });
                    }

                    let mut trail = frame.trail.clone();
                    trail.push(next);
                    stack.push(Frame {
                        node: next,
                        depth: frame.depth + 1,
                        via: Some(edge.kind),
                        call_order: edge.call_order,
                        sort_key: format!("{}.{}", frame.sort_key, sort_segment(edge.call_order)),
                        trail,
                    });
                }
            }

            visits.push(Visit {
                node: frame.node,
                depth: frame.depth,
                via: frame.via,
                call_order: frame.call_order,
                sort_key: frame.sort_key,
                trail: frame.trail,
            });
        }

        Ok(visits)
    }

    fn step(&self, visit: Visit, direction: Direction) -> Option<TraversalStep> {
        let depth = match direction {
            Direction::Outgoing => visit.depth as i32,
            Direction::Incoming => -(visit.depth as i32),
        };
        let node = self.nodes.get(&visit.node)?.clone();
        Some(TraversalStep {
            depth,
            node,
            via: visit.via,
            call_order: visit.call_order,
            path: self.render_path(&visit.trail, direction),
            sort_key: visit.sort_key,
        })
    }

    fn names(&self, trail: &[CodeNodeId]) -> Vec<String> {
        trail
            .iter()
            .map(|id| {
                self.nodes
                    .get(id)
                    .map(|node| node.name.clone())
                    .unwrap_or_else(|| format!("code:{id}"))
            })
            .collect()
    }

    fn render_path(&self, trail: &[CodeNodeId], direction: Direction) -> String {
        let separator = match direction {
            Direction::Outgoing => " -> ",
            Direction::Incoming => " <- ",
        };
        self.names(trail).join(separator)
    }
}

fn sort_segment(call_order: Option<u32>) -> String {
    match call_order {
        Some(order) => format!("{order:03}"),
        None => MISSING_CALL_ORDER.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_segments_pad_and_push_missing_orders_last() {
        assert_eq!(sort_segment(Some(1)), "001");
        assert_eq!(sort_segment(Some(42)), "042");
        assert!(sort_segment(Some(999)) < sort_segment(None));
        assert!(format!("1.{}", sort_segment(Some(2))) < format!("1.{}", sort_segment(None)));
    }

    #[test]
    fn selector_parse_distinguishes_endpoints_from_names() {
        assert_eq!(
            NodeSelector::parse("POST /orders", None),
            NodeSelector::Endpoint(ApiExposure::new("POST", "/orders"))
        );
        assert_eq!(
            NodeSelector::parse(" validate_trade ", Some("trade_service")),
            NodeSelector::in_service("validate_trade", "trade_service")
        );
        assert_eq!(
            NodeSelector::parse("place_order", Some("  ")),
            NodeSelector::name("place_order")
        );
    }

    #[test]
    fn node_class_flags_cover_all_four_classes() {
        assert_eq!(NodeClass::from_flags(true, true), NodeClass::Both);
        assert!(NodeClass::Both.is_root() && NodeClass::Both.is_leaf());
        assert!(!NodeClass::Neither.is_root() && !NodeClass::Neither.is_leaf());
        assert!(NodeClass::from_flags(false, true).is_leaf());
    }
}
