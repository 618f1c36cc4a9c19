//! Merge-candidate signals for global head deduplication.
//!
//! Each signal scores unordered node pairs in `[0, 1]`; [`fuse`] combines
//! whichever signals produced a result.

pub mod alias;
pub mod attribute;
pub mod fusion;
pub mod semantic;
pub mod subgraph;

use graphmerge_core::DedupResult;
use graphmerge_graph::{KnowledgeGraph, NodeId};

pub use alias::AliasSignal;
pub use attribute::AttributeSignal;
pub use fusion::{fuse, FusedPair, SignalOutput};
pub use semantic::SemanticSignal;
pub use subgraph::SubgraphSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalKind {
    Semantic,
    Subgraph,
    Alias,
    Attribute,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Semantic => "semantic",
            SignalKind::Subgraph => "subgraph",
            SignalKind::Alias => "alias",
            SignalKind::Attribute => "attribute",
        }
    }
}

/// A scored unordered pair; `a < b` always.
#[derive(Debug, Clone, PartialEq)]
pub struct PairScore {
    pub a: NodeId,
    pub b: NodeId,
    pub score: f32,
}

impl PairScore {
    pub fn new(x: NodeId, y: NodeId, score: f32) -> Self {
        if x <= y {
            Self { a: x, b: y, score }
        } else {
            Self { a: y, b: x, score }
        }
    }
}

pub trait Signal {
    fn kind(&self) -> SignalKind;

    /// Pairs among `ids` that clear this signal's threshold.
    fn score_pairs(&self, graph: &KnowledgeGraph, ids: &[NodeId]) -> DedupResult<Vec<PairScore>>;
}

/// Sort by descending score, then ids, so equal scores order stably.
pub(crate) fn sort_pairs(pairs: &mut [PairScore]) {
    pairs.sort_by(|x, y| {
        y.score
            .total_cmp(&x.score)
            .then_with(|| x.a.cmp(&y.a))
            .then_with(|| x.b.cmp(&y.b))
    });
}
