//! Logic-aware decomposition (LAG).
//!
//! Turns a query into a topologically ordered DAG of sub-questions, each with
//! a cognitive-load score and an optional terminator, plus artifacts that
//! explain every acceptance and termination.

mod analysis;
pub(crate) mod load;
mod plan;
pub mod terminators;

pub use analysis::{
    CartesianShape, ChainRoot, ChainShape, QueryAnalyzer, QueryShape, MAX_CARTESIAN_LEAVES, PREV,
};
pub use load::{CognitiveLoadScorer, LoadBreakdown};
pub use plan::{ExecutionPlan, NodeId, PlanEdge, PlanError, PlanGraph, SubQuestionNode, Terminator};
pub use terminators::{SnapshotProbe, SupportProbe, TerminatorRules, Verdict};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DecompositionConfig;
use crate::error::{EngineError, EngineResult};

/// What happened at one derivation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DerivationAction {
    /// The whole query was scored
    Scored { score: f64, threshold: f64 },
    /// Empty or whitespace-only query
    EmptyQuery,
    /// The query itself tripped a terminator before any split
    Screened { terminator: Terminator, rule: String },
    /// Load at or below threshold; no decomposition
    BelowThreshold,
    /// No independent dimensions found
    NoStructure,
    ChainDetected { hops: usize },
    CartesianDetected {
        entities: usize,
        axes: usize,
        temporal_anchors: usize,
    },
    /// Levels beyond `max_depth` were folded into one node
    DepthLimited { required: usize, available: usize },
    Accepted,
    Terminated { terminator: Terminator, rule: String },
    /// Dependents of a terminated chain node were not generated
    ExpansionHalted { skipped_hops: usize },
}

/// One entry of the derivation trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationStep {
    pub seq: u32,
    pub node: Option<NodeId>,
    #[serde(flatten)]
    pub action: DerivationAction,
}

/// Everything needed to reconstruct why the plan looks the way it does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionArtifacts {
    pub query_load: LoadBreakdown,
    pub plan_graph: PlanGraph,
    pub cognitive_load_map: BTreeMap<NodeId, f64>,
    pub derivation: Vec<DerivationStep>,
}

/// Result of a decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub plan: ExecutionPlan,
    pub artifacts: DecompositionArtifacts,
}

/// The decomposition engine.
pub struct Decomposer {
    config: DecompositionConfig,
    scorer: CognitiveLoadScorer,
    analyzer: QueryAnalyzer,
    rules: TerminatorRules,
}

impl Decomposer {
    /// Build a decomposer; malformed configuration is rejected here.
    pub fn new(config: &DecompositionConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            scorer: CognitiveLoadScorer::new(config.load_weights.clone()),
            analyzer: QueryAnalyzer::new()?,
            rules: TerminatorRules::new(config)?,
        })
    }

    /// Decompose a query into an execution plan.
    ///
    /// Never fails on query content; only an internally inconsistent plan
    /// (a bug) surfaces as an error.
    pub fn decompose(
        &self,
        query: &str,
        probe: Option<&dyn SupportProbe>,
    ) -> EngineResult<Decomposition> {
        let mut builder = PlanBuilder::new(self, probe);
        let query_load = self.scorer.score(query);
        let text = query.trim();

        if text.is_empty() {
            builder.step(None, DerivationAction::EmptyQuery);
            builder.push_terminated(
                String::new(),
                0.0,
                Terminator::Unanswerable,
                "empty_query".to_string(),
            );
            return builder.finish(query_load);
        }

        builder.step(
            None,
            DerivationAction::Scored {
                score: query_load.score,
                threshold: self.config.load_threshold,
            },
        );

        if let Some(verdict) = self.rules.screen(text) {
            builder.step(
                None,
                DerivationAction::Screened {
                    terminator: verdict.terminator,
                    rule: verdict.rule.clone(),
                },
            );
            builder.push_terminated(text.to_string(), query_load.score, verdict.terminator, verdict.rule);
            return builder.finish(query_load);
        }

        if query_load.score <= self.config.load_threshold {
            builder.step(None, DerivationAction::BelowThreshold);
            builder.add_node(text.to_string(), BTreeSet::new());
            return builder.finish(query_load);
        }

        let max_depth = self.config.max_depth;
        match self.analyzer.analyze(text) {
            QueryShape::Atomic => {
                builder.step(None, DerivationAction::NoStructure);
                builder.add_node(text.to_string(), BTreeSet::new());
            }
            QueryShape::Chain(chain) => {
                builder.step(None, DerivationAction::ChainDetected { hops: chain.len() });
                builder.expand_chain(&chain, max_depth, BTreeSet::new());
            }
            QueryShape::Cartesian(shape) => {
                builder.step(
                    None,
                    DerivationAction::CartesianDetected {
                        entities: shape.entities.len(),
                        axes: shape.axes.len(),
                        temporal_anchors: shape.temporal_anchors.len(),
                    },
                );
                if max_depth < 2 {
                    builder.step(
                        None,
                        DerivationAction::DepthLimited {
                            required: 2,
                            available: max_depth,
                        },
                    );
                    builder.add_node(text.to_string(), BTreeSet::new());
                } else {
                    let mut finals = BTreeSet::new();
                    for leaf in shape.leaves() {
                        let id = match self.analyzer.chain(&leaf) {
                            Some(chain) => builder.expand_chain(&chain, max_depth - 1, BTreeSet::new()),
                            None => builder.add_node(leaf, BTreeSet::new()).0,
                        };
                        finals.insert(id);
                    }
                    let refs: Vec<String> = finals.iter().map(NodeId::placeholder).collect();
                    builder.add_node(format!("{} (using {})", text, refs.join(", ")), finals);
                }
            }
        }

        builder.finish(query_load)
    }
}

struct PlanBuilder<'a> {
    decomposer: &'a Decomposer,
    probe: Option<&'a dyn SupportProbe>,
    nodes: Vec<SubQuestionNode>,
    derivation: Vec<DerivationStep>,
}

impl<'a> PlanBuilder<'a> {
    fn new(decomposer: &'a Decomposer, probe: Option<&'a dyn SupportProbe>) -> Self {
        Self {
            decomposer,
            probe,
            nodes: Vec::new(),
            derivation: Vec::new(),
        }
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32 + 1)
    }

    fn step(&mut self, node: Option<NodeId>, action: DerivationAction) {
        let seq = self.derivation.len() as u32 + 1;
        self.derivation.push(DerivationStep { seq, node, action });
    }

    fn depth_for(&self, deps: &BTreeSet<NodeId>) -> usize {
        self.nodes
            .iter()
            .filter(|n| deps.contains(&n.id))
            .map(|n| n.depth)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn push_terminated(&mut self, text: String, load: f64, terminator: Terminator, rule: String) {
        let id = self.next_id();
        self.step(Some(id), DerivationAction::Terminated { terminator, rule });
        self.nodes.push(SubQuestionNode {
            id,
            text,
            depends_on: BTreeSet::new(),
            cognitive_load: load,
            terminator,
            depth: 1,
        });
    }

    /// Score, check and accept one node.
    ///
    /// The LOW_SUPPORT probe only runs for nodes without dependencies; a
    /// dependent's text is incomplete until its inputs are answered.
    fn add_node(&mut self, text: String, depends_on: BTreeSet<NodeId>) -> (NodeId, Terminator) {
        let id = self.next_id();
        let load = self.decomposer.scorer.score(&text).score;
        let probe = if depends_on.is_empty() { self.probe } else { None };
        let verdict = self.decomposer.rules.check(&text, probe);

        let terminator = match verdict {
            Some(v) => {
                debug!(node_id = %id, terminator = %v.terminator, rule = %v.rule, "Sub-question terminated");
                self.step(
                    Some(id),
                    DerivationAction::Terminated {
                        terminator: v.terminator,
                        rule: v.rule,
                    },
                );
                v.terminator
            }
            None => {
                self.step(Some(id), DerivationAction::Accepted);
                Terminator::None
            }
        };

        let depth = self.depth_for(&depends_on);
        self.nodes.push(SubQuestionNode {
            id,
            text,
            depends_on,
            cognitive_load: load,
            terminator,
            depth,
        });
        (id, terminator)
    }

    /// Add chain hops innermost first; returns the last node created.
    fn expand_chain(&mut self, chain: &ChainShape, levels: usize, deps: BTreeSet<NodeId>) -> NodeId {
        if chain.len() > levels {
            self.step(
                None,
                DerivationAction::DepthLimited {
                    required: chain.len(),
                    available: levels,
                },
            );
        }

        let questions = chain.questions(levels);
        let total = questions.len();
        let mut deps = deps;
        let mut last = None;
        for (idx, template) in questions.into_iter().enumerate() {
            let text = match last {
                Some(prev) => template.replace(PREV, &NodeId::placeholder(&prev)),
                None => template,
            };
            let (id, terminator) = self.add_node(text, std::mem::take(&mut deps));
            last = Some(id);
            if terminator.is_terminal() {
                let skipped = total - idx - 1;
                if skipped > 0 {
                    self.step(Some(id), DerivationAction::ExpansionHalted { skipped_hops: skipped });
                }
                break;
            }
            deps = BTreeSet::from([id]);
        }
        last.unwrap_or_else(|| self.add_node(String::new(), BTreeSet::new()).0)
    }

    fn finish(self, query_load: LoadBreakdown) -> EngineResult<Decomposition> {
        let cognitive_load_map = self
            .nodes
            .iter()
            .map(|n| (n.id, n.cognitive_load))
            .collect();
        let plan = ExecutionPlan::new(self.nodes).map_err(|e| EngineError::Internal {
            message: format!("decomposition produced an invalid plan: {}", e),
        })?;
        let plan_graph = plan.graph();
        Ok(Decomposition {
            plan,
            artifacts: DecompositionArtifacts {
                query_load,
                plan_graph,
                cognitive_load_map,
                derivation: self.derivation,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use terminators::MockSupportProbe;

    fn decomposer() -> Decomposer {
        Decomposer::new(&DecompositionConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_bad_config() {
        let mut config = DecompositionConfig::default();
        config.max_depth = 0;
        assert!(Decomposer::new(&config).err().unwrap().is_configuration());
    }

    #[test]
    fn test_below_threshold_single_node() {
        let d = decomposer().decompose("What is the capital of France?", None).unwrap();
        assert_eq!(d.plan.len(), 1);
        assert_eq!(d.plan.nodes()[0].terminator, Terminator::None);
        assert!(d
            .artifacts
            .derivation
            .iter()
            .any(|s| s.action == DerivationAction::BelowThreshold));
    }

    #[test]
    fn test_chain_halts_after_terminated_hop() {
        let mut probe = MockSupportProbe::new();
        probe.expect_max_relevance().returning(|_| Some(0.0));
        let d = decomposer()
            .decompose(
                "What is the population of the capital of the country that hosted the 2024 Olympics?",
                Some(&probe),
            )
            .unwrap();
        assert_eq!(d.plan.len(), 1);
        assert_eq!(d.plan.nodes()[0].terminator, Terminator::LowSupport);
        assert!(d.artifacts.derivation.iter().any(|s| matches!(
            s.action,
            DerivationAction::ExpansionHalted { skipped_hops: 2 }
        )));
    }

    #[test]
    fn test_cartesian_aggregate_depends_on_all_leaves() {
        let d = decomposer()
            .decompose(
                "Compare the GDP and population of France and Germany in 2010 and 2020",
                None,
            )
            .unwrap();
        assert_eq!(d.plan.len(), 9);
        let last = d.plan.final_node().unwrap();
        assert_eq!(last.id, NodeId(9));
        assert_eq!(last.depends_on.len(), 8);
        assert_eq!(last.depth, 2);
        assert!(last.text.contains("[q1]"));
    }

    #[test]
    fn test_cartesian_respects_depth_one() {
        let mut config = DecompositionConfig::default();
        config.max_depth = 1;
        let d = Decomposer::new(&config)
            .unwrap()
            .decompose(
                "Compare the GDP and population of France and Germany in 2010 and 2020",
                None,
            )
            .unwrap();
        assert_eq!(d.plan.len(), 1);
    }

    #[test]
    fn test_screened_root_is_single_terminated_node() {
        let d = decomposer()
            .decompose(
                "Compare the population of the married bachelor towns of France and Germany in 2010 and 2020",
                None,
            )
            .unwrap();
        assert_eq!(d.plan.len(), 1);
        assert_eq!(d.plan.nodes()[0].terminator, Terminator::Contradiction);
    }
}
