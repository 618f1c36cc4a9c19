use std::collections::{BTreeSet, HashMap};

use graphmerge_core::{normalize_name, DedupResult};
use graphmerge_graph::{KnowledgeGraph, NodeId, NodeLabel};

use super::{sort_pairs, PairScore, Signal, SignalKind};

const ATTRIBUTE_KEYS: [&str; 5] = ["definition", "description", "type", "category", "schema_type"];

/// Jaccard overlap of normalised attribute tuples: the descriptive
/// properties plus `(relation, value)` for edges into attribute nodes.
pub struct AttributeSignal {
    threshold: f32,
}

impl AttributeSignal {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn tuples(graph: &KnowledgeGraph, id: &NodeId) -> BTreeSet<String> {
        let mut tuples = BTreeSet::new();
        let Some(node) = graph.node(id) else {
            return tuples;
        };
        for key in ATTRIBUTE_KEYS {
            if let Some(value) = node.get_str(key) {
                let value = normalize_name(value);
                if !value.is_empty() {
                    tuples.insert(format!("{key}={value}"));
                }
            }
        }
        for edge in graph.out_edges(id) {
            if let Some(target) = graph.node(&edge.target).filter(|t| t.label == NodeLabel::Attribute) {
                tuples.insert(format!("{}={}", edge.relation, normalize_name(target.name())));
            }
        }
        tuples
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

impl Signal for AttributeSignal {
    fn kind(&self) -> SignalKind {
        SignalKind::Attribute
    }

    fn score_pairs(&self, graph: &KnowledgeGraph, ids: &[NodeId]) -> DedupResult<Vec<PairScore>> {
        let tuples: HashMap<&NodeId, BTreeSet<String>> = ids
            .iter()
            .map(|id| (id, Self::tuples(graph, id)))
            .filter(|(_, t)| !t.is_empty())
            .collect();
        let with_tuples: Vec<&NodeId> = ids.iter().filter(|id| tuples.contains_key(id)).collect();

        let mut pairs = Vec::new();
        for (i, a) in with_tuples.iter().enumerate() {
            for b in &with_tuples[i + 1..] {
                let score = jaccard(&tuples[a], &tuples[b]);
                if score > 0.0 && score >= self.threshold {
                    pairs.push(PairScore::new((*a).clone(), (*b).clone(), score));
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
    use graphmerge_graph::parse_graph;

    #[test]
    fn shared_attributes_overlap() {
        let g = parse_graph(
            r#"[
            {"start_node": {"label": "entity", "properties": {"name": "Aspirin", "schema_type": "Drug"}},
             "relation": "dose", "end_node": {"label": "attribute", "properties": {"name": "500 mg"}}},
            {"start_node": {"label": "entity", "properties": {"name": "ASA", "schema_type": "drug"}},
             "relation": "dose", "end_node": {"label": "attribute", "properties": {"name": "500 mg"}}},
            {"start_node": {"label": "entity", "properties": {"name": "Paris", "schema_type": "city"}},
             "relation": null}
        ]"#,
        )
        .unwrap();
        let id = |n: &str| g.find_by_name(NodeLabel::Entity, n).unwrap().clone();
        let ids = vec![id("Aspirin"), id("ASA"), id("Paris")];

        let pairs = AttributeSignal::new(0.5).score_pairs(&g, &ids).unwrap();
        assert_eq!(pairs.len(), 1);
        assert!((pairs[0].score - 1.0).abs() < 1e-6);
    }
}
