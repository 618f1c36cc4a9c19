use std::collections::{BTreeMap, BTreeSet, HashSet};

use graphmerge_core::{AliasRelations, DedupResult};
use graphmerge_graph::{KnowledgeGraph, NodeId};

use super::{sort_pairs, PairScore, Signal, SignalKind};

const DIRECT: f32 = 1.0;
const VIA_HUB: f32 = 0.8;

/// Explicit alias edges: 1.0 for a direct alias relation between the pair,
/// 0.8 when both are alias-linked to the same hub node.
pub struct AliasSignal {
    aliases: AliasRelations,
}

impl AliasSignal {
    pub fn new(aliases: AliasRelations) -> Self {
        Self { aliases }
    }
}

impl Signal for AliasSignal {
    fn kind(&self) -> SignalKind {
        SignalKind::Alias
    }

    fn score_pairs(&self, graph: &KnowledgeGraph, ids: &[NodeId]) -> DedupResult<Vec<PairScore>> {
        let wanted: HashSet<&NodeId> = ids.iter().collect();
        let mut links: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut scores: BTreeMap<(NodeId, NodeId), f32> = BTreeMap::new();

        for (key, _) in graph.edges() {
            let Some((alias, canonical)) =
                self.aliases
                    .alias_pair(key.source.as_str(), &key.relation, key.target.as_str())
            else {
                continue;
            };
            if alias == canonical {
                continue;
            }
            let (alias, canonical) = (NodeId::new(alias), NodeId::new(canonical));
            links.entry(alias.clone()).or_default().insert(canonical.clone());
            links.entry(canonical.clone()).or_default().insert(alias.clone());
            if wanted.contains(&alias) && wanted.contains(&canonical) {
                let pair = PairScore::new(alias, canonical, DIRECT);
                scores.insert((pair.a, pair.b), DIRECT);
            }
        }

        for neighbours in links.values() {
            let members: Vec<&NodeId> = neighbours.iter().filter(|n| wanted.contains(n)).collect();
            for (i, x) in members.iter().enumerate() {
                for y in &members[i + 1..] {
                    let pair = PairScore::new((*x).clone(), (*y).clone(), VIA_HUB);
                    scores.entry((pair.a, pair.b)).or_insert(VIA_HUB);
                }
            }
        }

        let mut pairs: Vec<PairScore> = scores
            .into_iter()
            .map(|((a, b), score)| PairScore { a, b, score })
            .collect();
        sort_pairs(&mut pairs);
        Ok(pairs)
    }
}
