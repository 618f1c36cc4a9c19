use std::collections::HashMap;

use graphmerge_core::{DedupError, DedupResult};
use graphmerge_graph::{KnowledgeGraph, NodeId};

use super::{sort_pairs, PairScore, Signal, SignalKind};
use crate::similarity::cosine_similarity;

/// Embedding cosine over pre-computed node vectors.
pub struct SemanticSignal {
    vectors: HashMap<NodeId, Vec<f32>>,
    threshold: f32,
    max_pairs: usize,
}

impl SemanticSignal {
    pub fn new(vectors: HashMap<NodeId, Vec<f32>>, threshold: f32, max_pairs: usize) -> Self {
        Self {
            vectors,
            threshold,
            max_pairs,
        }
    }
}

impl Signal for SemanticSignal {
    fn kind(&self) -> SignalKind {
        SignalKind::Semantic
    }

    fn score_pairs(&self, _graph: &KnowledgeGraph, ids: &[NodeId]) -> DedupResult<Vec<PairScore>> {
        let embedded: Vec<(&NodeId, &Vec<f32>)> =
            ids.iter().filter_map(|id| self.vectors.get(id).map(|v| (id, v))).collect();
        if embedded.is_empty() && !ids.is_empty() {
            return Err(DedupError::Embedding("no node embeddings available".to_string()));
        }

        let mut pairs = Vec::new();
        for (i, (a, va)) in embedded.iter().enumerate() {
            for (b, vb) in &embedded[i + 1..] {
                let score = cosine_similarity(va, vb);
                if score >= self.threshold {
                    pairs.push(PairScore::new((*a).clone(), (*b).clone(), score.min(1.0)));
                }
            }
        }
        sort_pairs(&mut pairs);
        pairs.truncate(self.max_pairs);
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_pairs_above_threshold_capped() {
        let g = KnowledgeGraph::new();
        let ids: Vec<NodeId> = ["n1", "n2", "n3"].into_iter().map(NodeId::from).collect();
        let vectors = HashMap::from([
            (ids[0].clone(), vec![1.0, 0.0]),
            (ids[1].clone(), vec![0.9, 0.1]),
            (ids[2].clone(), vec![0.0, 1.0]),
        ]);
        let pairs = SemanticSignal::new(vectors.clone(), 0.75, 10).score_pairs(&g, &ids).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].a.as_str(), pairs[0].b.as_str()), ("n1", "n2"));

        let capped = SemanticSignal::new(vectors, 0.0, 2).score_pairs(&g, &ids).unwrap();
        assert_eq!(capped.len(), 2);
        assert!(capped[0].score >= capped[1].score);
    }

    #[test]
    fn missing_embeddings_fail_the_signal() {
        let ids = vec![NodeId::from("n1")];
        let result = SemanticSignal::new(HashMap::new(), 0.5, 10).score_pairs(&KnowledgeGraph::new(), &ids);
        assert!(matches!(result, Err(DedupError::Embedding(_))));
    }
}
