use std::collections::BTreeMap;

use tracing::warn;

use graphmerge_core::{DedupError, DedupResult, SignalWeights};
use graphmerge_graph::NodeId;

use super::{PairScore, SignalKind};

const ALIAS_BOOST_TRIGGER: f32 = 0.9;
const ALIAS_BOOST_FLOOR: f32 = 0.95;

/// Result of running one signal; failures are carried so fusion can skip them.
pub struct SignalOutput {
    pub kind: SignalKind,
    pub result: DedupResult<Vec<PairScore>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedPair {
    pub a: NodeId,
    pub b: NodeId,
    pub score: f32,
    pub signals: BTreeMap<SignalKind, f32>,
}

fn weight(weights: &SignalWeights, kind: SignalKind) -> f32 {
    match kind {
        SignalKind::Semantic => weights.semantic,
        SignalKind::Subgraph => weights.subgraph,
        SignalKind::Alias => weights.alias,
        SignalKind::Attribute => weights.attribute,
    }
}

/// Weighted mean over the signals that succeeded, normalised by their
/// weight sum. A pair with a strong alias signal is lifted to at least 0.95.
/// Failed signals are skipped; fusion only fails when every signal did.
pub fn fuse(outputs: Vec<SignalOutput>, weights: &SignalWeights) -> DedupResult<Vec<FusedPair>> {
    let mut active: Vec<(SignalKind, Vec<PairScore>)> = Vec::new();
    let mut failures = Vec::new();
    for output in outputs {
        match output.result {
            Ok(pairs) => active.push((output.kind, pairs)),
            Err(e) => {
                warn!(signal = output.kind.as_str(), error = %e, "Candidate signal failed, skipping");
                failures.push(format!("{}: {e}", output.kind.as_str()));
            }
        }
    }
    if active.is_empty() {
        return Err(DedupError::Embedding(format!(
            "no candidate signal succeeded ({})",
            failures.join("; ")
        )));
    }

    let weight_sum: f32 = active.iter().map(|(kind, _)| weight(weights, *kind)).sum();
    if weight_sum <= 0.0 {
        return Err(DedupError::Config("active signal weights sum to zero".to_string()));
    }

    let mut by_pair: BTreeMap<(NodeId, NodeId), BTreeMap<SignalKind, f32>> = BTreeMap::new();
    for (kind, pairs) in active {
        for pair in pairs {
            let slot = by_pair.entry((pair.a, pair.b)).or_default().entry(kind).or_insert(0.0);
            *slot = slot.max(pair.score);
        }
    }

    let mut fused: Vec<FusedPair> = by_pair
        .into_iter()
        .map(|((a, b), signals)| {
            let mut score = signals.iter().map(|(k, s)| weight(weights, *k) * s).sum::<f32>() / weight_sum;
            if signals.get(&SignalKind::Alias).is_some_and(|s| *s >= ALIAS_BOOST_TRIGGER) {
                score = score.max(ALIAS_BOOST_FLOOR);
            }
            FusedPair {
                a,
                b,
                score: score.min(1.0),
                signals,
            }
        })
        .collect();
    fused.sort_by(|x, y| {
        y.score
            .total_cmp(&x.score)
            .then_with(|| x.a.cmp(&y.a))
            .then_with(|| x.b.cmp(&y.b))
    });
    Ok(fused)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(a: &str, b: &str, score: f32) -> PairScore {
        PairScore::new(NodeId::from(a), NodeId::from(b), score)
    }

    #[test]
    fn normalises_by_active_weights_and_boosts_aliases() {
        let outputs = vec![
            SignalOutput {
                kind: SignalKind::Semantic,
                result: Ok(vec![pair("n1", "n2", 0.8), pair("n3", "n4", 0.9)]),
            },
            SignalOutput {
                kind: SignalKind::Alias,
                result: Ok(vec![pair("n4", "n3", 1.0)]),
            },
            SignalOutput {
                kind: SignalKind::Subgraph,
                result: Err(DedupError::Embedding("down".into())),
            },
        ];
        let fused = fuse(outputs, &SignalWeights::default()).unwrap();

        assert_eq!(fused[0].a.as_str(), "n3");
        assert!(fused[0].score >= 0.95);
        let plain = &fused[1];
        // 0.30 * 0.8 / (0.30 + 0.35)
        assert!((plain.score - 0.24 / 0.65).abs() < 1e-5);
    }

    #[test]
    fn all_signals_failing_is_an_error() {
        let outputs = vec![SignalOutput {
            kind: SignalKind::Semantic,
            result: Err(DedupError::Embedding("down".into())),
        }];
        assert!(fuse(outputs, &SignalWeights::default()).is_err());
    }
}
