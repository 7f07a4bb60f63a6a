//! Integration tests for query decomposition
//!
//! Covers the multi-hop example, terminators, configuration errors, cross-run
//! determinism and plan validity over arbitrary input.

use std::collections::BTreeSet;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use lag_rcr_engine::config::DecompositionConfig;
use lag_rcr_engine::decomposition::{
    Decomposer, Decomposition, DerivationAction, NodeId, SupportProbe, Terminator,
};

const OLYMPICS: &str =
    "What is the population of the capital of the country that hosted the 2024 Olympics?";

fn decomposer() -> Decomposer {
    Decomposer::new(&DecompositionConfig::default()).expect("default config is valid")
}

fn decompose(query: &str) -> Decomposition {
    decomposer().decompose(query, None).unwrap()
}

/// Every dependency appears earlier in the plan order.
fn assert_topological(d: &Decomposition) {
    let mut seen = BTreeSet::new();
    for node in d.plan.nodes() {
        for dep in &node.depends_on {
            assert!(seen.contains(dep), "{} depends on later node {}", node.id, dep);
        }
        assert!(seen.insert(node.id), "duplicate node {}", node.id);
    }
}

struct FixedProbe(Option<f64>);

impl SupportProbe for FixedProbe {
    fn max_relevance(&self, _text: &str) -> Option<f64> {
        self.0
    }
}

#[cfg(test)]
mod multi_hop_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_olympics_decomposes_into_three_ordered_hops() {
        let d = decompose(OLYMPICS);
        let nodes = d.plan.nodes();

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].text, "Which country hosted the 2024 Olympics?");
        assert_eq!(nodes[1].text, "What is the capital of [q1]?");
        assert_eq!(nodes[2].text, "What is the population of [q2]?");

        assert!(nodes[0].depends_on.is_empty());
        assert_eq!(nodes[1].depends_on, BTreeSet::from([NodeId(1)]));
        assert_eq!(nodes[2].depends_on, BTreeSet::from([NodeId(2)]));
        assert!(nodes.iter().all(|n| n.terminator == Terminator::None));
        assert_topological(&d);
    }

    #[test]
    fn test_artifacts_describe_the_plan() {
        let d = decompose(OLYMPICS);
        assert_eq!(d.artifacts.plan_graph.order, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(d.artifacts.plan_graph.edges.len(), 2);
        assert_eq!(d.artifacts.cognitive_load_map.len(), 3);
        assert!(d.artifacts.query_load.score > 0.7);
        assert!(d
            .artifacts
            .derivation
            .iter()
            .any(|s| matches!(s.action, DerivationAction::ChainDetected { hops: 3 })));
    }

    #[test]
    fn test_depth_limit_merges_outer_hops() {
        let config = DecompositionConfig {
            max_depth: 2,
            ..DecompositionConfig::default()
        };
        let d = Decomposer::new(&config).unwrap().decompose(OLYMPICS, None).unwrap();

        assert_eq!(d.plan.len(), 2);
        assert_eq!(d.plan.nodes()[1].text, "What is the population of the capital of [q1]?");
        assert!(d.artifacts.derivation.iter().any(|s| matches!(
            s.action,
            DerivationAction::DepthLimited {
                required: 3,
                available: 2
            }
        )));
    }

    #[test]
    fn test_supported_probe_keeps_full_chain() {
        let d = decomposer()
            .decompose(OLYMPICS, Some(&FixedProbe(Some(0.8))))
            .unwrap();
        assert_eq!(d.plan.len(), 3);
    }

    #[test]
    fn test_no_evidence_base_never_terminates() {
        let d = decomposer().decompose(OLYMPICS, Some(&FixedProbe(None))).unwrap();
        assert!(d.plan.nodes().iter().all(|n| n.terminator == Terminator::None));
    }
}

#[cfg(test)]
mod terminator_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_query_is_single_unanswerable_node() {
        for query in ["", "   ", "\n\t"] {
            let d = decompose(query);
            assert_eq!(d.plan.len(), 1);
            assert_eq!(d.plan.nodes()[0].terminator, Terminator::Unanswerable);
        }
    }

    #[test]
    fn test_synesthetic_query_is_unanswerable() {
        let d = decompose("What is the taste of the number seven?");
        assert_eq!(d.plan.nodes()[0].terminator, Terminator::Unanswerable);
    }

    #[test]
    fn test_introspective_query_is_unanswerable() {
        let d = decompose("What number am I thinking of right now?");
        assert_eq!(d.plan.nodes()[0].terminator, Terminator::Unanswerable);
    }

    #[test]
    fn test_contradictory_premise() {
        let d = decompose("Where does the married bachelor live?");
        assert_eq!(d.plan.nodes()[0].terminator, Terminator::Contradiction);
    }

    #[test]
    fn test_choice_between_pair_is_not_contradiction() {
        let d = decompose("Is the cat alive or dead?");
        assert_eq!(d.plan.nodes()[0].terminator, Terminator::None);
    }

    #[test]
    fn test_low_support_first_hop_halts_chain() {
        let d = decomposer()
            .decompose(OLYMPICS, Some(&FixedProbe(Some(0.0))))
            .unwrap();
        assert_eq!(d.plan.len(), 1);
        assert_eq!(d.plan.nodes()[0].terminator, Terminator::LowSupport);
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_zero_max_depth_is_configuration_error() {
        let config = DecompositionConfig {
            max_depth: 0,
            ..DecompositionConfig::default()
        };
        let err = Decomposer::new(&config).err().expect("must be rejected");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_threshold_outside_unit_interval_is_rejected() {
        for threshold in [0.0, -0.5, 1.5] {
            let config = DecompositionConfig {
                load_threshold: threshold,
                ..DecompositionConfig::default()
            };
            assert!(Decomposer::new(&config).is_err(), "threshold {}", threshold);
        }
    }

    #[test]
    fn test_threshold_of_one_never_decomposes() {
        let config = DecompositionConfig {
            load_threshold: 1.0,
            ..DecompositionConfig::default()
        };
        let d = Decomposer::new(&config).unwrap().decompose(OLYMPICS, None).unwrap();
        assert_eq!(d.plan.len(), 1);
    }
}

#[cfg(test)]
mod determinism_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_five_runs_produce_identical_plans() {
        let queries = [
            OLYMPICS,
            "Compare the GDP and population of France and Germany in 2010 and 2020",
            "What is the capital of France?",
        ];
        for query in queries {
            let runs: Vec<String> = (0..5)
                .map(|_| {
                    let d = decomposer().decompose(query, None).unwrap();
                    serde_json::to_string(&d).unwrap()
                })
                .collect();
            assert!(runs.windows(2).all(|w| w[0] == w[1]), "unstable plan for {}", query);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_plan_is_always_a_valid_dag(
        words in prop::collection::vec(
            prop::sample::select(vec![
                "what", "is", "the", "of", "capital", "population", "country", "that",
                "hosted", "and", "compare", "France", "Germany", "in", "2010", "2020",
                "which", "larger", "than", "or", "GDP", "?", ",",
            ]),
            0..30,
        ),
        max_depth in 1usize..6,
    ) {
        let query = words.join(" ");
        let config = DecompositionConfig { max_depth, ..DecompositionConfig::default() };
        let d = Decomposer::new(&config).unwrap().decompose(&query, None).unwrap();

        prop_assert!(!d.plan.is_empty());
        let mut seen = BTreeSet::new();
        for node in d.plan.nodes() {
            for dep in &node.depends_on {
                prop_assert!(seen.contains(dep));
            }
            prop_assert!(node.depth <= max_depth);
            prop_assert!((0.0..=1.0).contains(&node.cognitive_load));
            seen.insert(node.id);
        }
    }
}
