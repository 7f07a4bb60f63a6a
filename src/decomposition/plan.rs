use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a sub-question within one plan; displayed as `q{n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeId(pub u32);

impl NodeId {
    /// The `[qN]` placeholder dependents use to reference this node's answer.
    pub fn placeholder(&self) -> String {
        format!("[{}]", self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('q')
            .and_then(|n| n.parse().ok())
            .map(NodeId)
            .ok_or_else(|| format!("Invalid node id: {}", s))
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Early-stop verdict attached to a sub-question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Terminator {
    #[default]
    None,
    Unanswerable,
    Contradiction,
    LowSupport,
}

impl Terminator {
    /// Whether the verdict halts the node.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Terminator::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Terminator::None => "NONE",
            Terminator::Unanswerable => "UNANSWERABLE",
            Terminator::Contradiction => "CONTRADICTION",
            Terminator::LowSupport => "LOW_SUPPORT",
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One node of the decomposition DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuestionNode {
    pub id: NodeId,
    pub text: String,
    pub depends_on: BTreeSet<NodeId>,
    pub cognitive_load: f64,
    pub terminator: Terminator,
    /// Length of the longest dependency path ending at this node (roots are 1)
    pub depth: usize,
}

/// Structural problems in a candidate plan.
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("Plan has no nodes")]
    Empty,

    #[error("Duplicate node id: {id}")]
    DuplicateNode { id: NodeId },

    #[error("Node {node} depends on unknown node {dependency}")]
    MissingDependency { node: NodeId, dependency: NodeId },

    #[error("Dependency cycle among nodes: {nodes:?}")]
    Cycle { nodes: Vec<NodeId> },
}

/// A validated, topologically ordered plan.
///
/// Immutable once built; regenerating produces a new plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    nodes: Vec<SubQuestionNode>,
}

/// Edge `from -> to`: `to` needs the answer of `from`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanEdge {
    pub from: NodeId,
    pub to: NodeId,
}

/// Graph view of a plan, stable under serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanGraph {
    pub order: Vec<NodeId>,
    pub edges: Vec<PlanEdge>,
}

impl ExecutionPlan {
    /// Validate nodes and order them with Kahn's algorithm, smallest id first
    /// among ready nodes.
    pub fn new(nodes: Vec<SubQuestionNode>) -> Result<Self, PlanError> {
        if nodes.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut by_id: BTreeMap<NodeId, SubQuestionNode> = BTreeMap::new();
        for node in nodes {
            let id = node.id;
            if by_id.insert(id, node).is_some() {
                return Err(PlanError::DuplicateNode { id });
            }
        }

        let mut indegree: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for node in by_id.values() {
            for dep in &node.depends_on {
                if !by_id.contains_key(dep) {
                    return Err(PlanError::MissingDependency {
                        node: node.id,
                        dependency: *dep,
                    });
                }
                dependents.entry(*dep).or_default().push(node.id);
            }
            indegree.insert(node.id, node.depends_on.len());
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        let mut ordered = Vec::with_capacity(by_id.len());
        while let Some(Reverse(id)) = ready.pop() {
            ordered.push(id);
            for child in dependents.get(&id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(*child));
                    }
                }
            }
        }

        if ordered.len() != by_id.len() {
            let placed: BTreeSet<NodeId> = ordered.iter().copied().collect();
            let nodes = by_id.keys().filter(|id| !placed.contains(id)).copied().collect();
            return Err(PlanError::Cycle { nodes });
        }

        let nodes = ordered
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        Ok(Self { nodes })
    }

    /// Nodes in execution order.
    pub fn nodes(&self) -> &[SubQuestionNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&SubQuestionNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The node whose answer is the answer to the whole query.
    pub fn final_node(&self) -> Option<&SubQuestionNode> {
        self.nodes.last()
    }

    /// Nodes grouped into waves; every node's dependencies sit in earlier waves.
    pub fn waves(&self) -> Vec<Vec<NodeId>> {
        let mut level: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut waves: Vec<Vec<NodeId>> = Vec::new();
        for node in &self.nodes {
            let lvl = node
                .depends_on
                .iter()
                .filter_map(|d| level.get(d))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(node.id, lvl);
            if waves.len() <= lvl {
                waves.resize_with(lvl + 1, Vec::new);
            }
            waves[lvl].push(node.id);
        }
        waves
    }

    /// Edge list and order, for artifacts and determinism checks.
    pub fn graph(&self) -> PlanGraph {
        let mut edges: Vec<PlanEdge> = self
            .nodes
            .iter()
            .flat_map(|n| n.depends_on.iter().map(move |d| PlanEdge { from: *d, to: n.id }))
            .collect();
        edges.sort();
        PlanGraph {
            order: self.nodes.iter().map(|n| n.id).collect(),
            edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, deps: &[u32]) -> SubQuestionNode {
        SubQuestionNode {
            id: NodeId(id),
            text: format!("question {}", id),
            depends_on: deps.iter().map(|d| NodeId(*d)).collect(),
            cognitive_load: 0.1,
            terminator: Terminator::None,
            depth: 1,
        }
    }

    #[test]
    fn test_orders_dependencies_first_with_id_ties() {
        let plan = ExecutionPlan::new(vec![node(4, &[2, 3]), node(3, &[]), node(2, &[1]), node(1, &[])])
            .unwrap();
        let order: Vec<u32> = plan.nodes().iter().map(|n| n.id.0).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert_eq!(plan.final_node().map(|n| n.id), Some(NodeId(4)));
    }

    #[test]
    fn test_waves() {
        let plan =
            ExecutionPlan::new(vec![node(1, &[]), node(2, &[]), node(3, &[1]), node(4, &[2, 3])])
                .unwrap();
        assert_eq!(
            plan.waves(),
            vec![vec![NodeId(1), NodeId(2)], vec![NodeId(3)], vec![NodeId(4)]]
        );
    }

    #[test]
    fn test_rejects_cycle_missing_and_duplicate() {
        assert_eq!(
            ExecutionPlan::new(vec![node(1, &[2]), node(2, &[1])]).unwrap_err(),
            PlanError::Cycle {
                nodes: vec![NodeId(1), NodeId(2)]
            }
        );
        assert_eq!(
            ExecutionPlan::new(vec![node(1, &[7])]).unwrap_err(),
            PlanError::MissingDependency {
                node: NodeId(1),
                dependency: NodeId(7)
            }
        );
        assert_eq!(
            ExecutionPlan::new(vec![node(1, &[]), node(1, &[])]).unwrap_err(),
            PlanError::DuplicateNode { id: NodeId(1) }
        );
        assert_eq!(ExecutionPlan::new(vec![]).unwrap_err(), PlanError::Empty);
    }

    #[test]
    fn test_node_id_serializes_as_label() {
        let json = serde_json::to_string(&NodeId(3)).unwrap();
        assert_eq!(json, "\"q3\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeId(3));
        assert_eq!(NodeId(3).placeholder(), "[q3]");
    }

    #[test]
    fn test_terminator_serialization() {
        assert_eq!(
            serde_json::to_string(&Terminator::LowSupport).unwrap(),
            "\"LOW_SUPPORT\""
        );
        assert!(!Terminator::None.is_terminal());
        assert!(Terminator::Contradiction.is_terminal());
    }
}
