use std::collections::HashMap;

use graphmerge_core::DedupResult;
use graphmerge_graph::{KnowledgeGraph, NodeId};

use super::{sort_pairs, PairScore, Signal, SignalKind};
use crate::similarity::sparse_cosine;

const TWO_HOP_DECAY: f32 = 0.5;

/// Structural fingerprint similarity: relation and neighbour-type
/// multisets plus degrees, optionally with decayed 2-hop features.
pub struct SubgraphSignal {
    threshold: f32,
    two_hop: bool,
}

impl SubgraphSignal {
    pub fn new(threshold: f32, two_hop: bool) -> Self {
        Self { threshold, two_hop }
    }

    pub fn fingerprint(&self, graph: &KnowledgeGraph, id: &NodeId) -> HashMap<String, f32> {
        let mut features: HashMap<String, f32> = HashMap::new();
        one_hop(graph, id, 1.0, "", &mut features);

        if self.two_hop {
            for key in graph.out_edges(id) {
                if key.target != *id {
                    one_hop(graph, &key.target, TWO_HOP_DECAY, "2hop:", &mut features);
                }
            }
        }
        features
    }
}

fn one_hop(graph: &KnowledgeGraph, id: &NodeId, weight: f32, prefix: &str, features: &mut HashMap<String, f32>) {
    let out = graph.out_edges(id);
    let incoming = graph.in_edges(id);
    for key in &out {
        *features.entry(format!("{prefix}out:{}", key.relation)).or_default() += weight;
        if let Some(target) = graph.node(&key.target) {
            *features.entry(format!("{prefix}neighbor_type:{}", target.label)).or_default() += weight;
        }
    }
    for key in &incoming {
        *features.entry(format!("{prefix}in:{}", key.relation)).or_default() += weight;
        if let Some(source) = graph.node(&key.source) {
            *features.entry(format!("{prefix}neighbor_type:{}", source.label)).or_default() += weight;
        }
    }
    *features.entry(format!("{prefix}out_degree")).or_default() += weight * out.len() as f32;
    *features.entry(format!("{prefix}in_degree")).or_default() += weight * incoming.len() as f32;
}

impl Signal for SubgraphSignal {
    fn kind(&self) -> SignalKind {
        SignalKind::Subgraph
    }

    fn score_pairs(&self, graph: &KnowledgeGraph, ids: &[NodeId]) -> DedupResult<Vec<PairScore>> {
        let prints: Vec<(&NodeId, HashMap<String, f32>)> = ids
            .iter()
            .map(|id| (id, self.fingerprint(graph, id)))
            .filter(|(_, fp)| fp.values().any(|v| *v > 0.0))
            .collect();

        let mut pairs = Vec::new();
        for (i, (a, fa)) in prints.iter().enumerate() {
            for (b, fb) in &prints[i + 1..] {
                let score = sparse_cosine(fa, fb);
                if score >= self.threshold {
                    pairs.push(PairScore::new((*a).clone(), (*b).clone(), score.min(1.0)));
                }
            }
        }
        sort_pairs(&mut pairs);
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::graph_from_triples;
    use graphmerge_graph::NodeLabel;

    #[test]
    fn same_shape_scores_high() {
        let g = graph_from_triples(&[
            ("Aspirin", "treats", "pain"),
            ("ASA", "treats", "pain"),
            ("Paris", "capital_of", "France"),
            ("Paris", "located_in", "Europe"),
        ]);
        let id = |n: &str| g.find_by_name(NodeLabel::Entity, n).unwrap().clone();
        let ids = vec![id("Aspirin"), id("ASA"), id("Paris")];

        let pairs = SubgraphSignal::new(0.8, false).score_pairs(&g, &ids).unwrap();
        assert_eq!(pairs.len(), 1);
        assert!((pairs[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn two_hop_features_are_decayed() {
        let g = graph_from_triples(&[("A", "r", "B"), ("B", "s", "C")]);
        let a = g.find_by_name(NodeLabel::Entity, "A").unwrap().clone();
        let fp = SubgraphSignal::new(0.8, true).fingerprint(&g, &a);
        assert_eq!(fp["out:r"], 1.0);
        assert_eq!(fp["2hop:out:s"], 0.5);
    }
}
