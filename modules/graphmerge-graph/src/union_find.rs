//! Closure of merge decisions.
//!
//! Each decision is a directed union: the duplicate's set joins the
//! canonical's set, so the representative a model picked survives. Only when
//! two sets that are both anchored on an earlier canonical collide does the
//! structural tie-break pick the survivor.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use graphmerge_core::AliasRelations;

use crate::model::{KnowledgeGraph, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Llm,
    Validated,
    EmbeddingThreshold,
    ExistingAlias,
    ExistingAliasTransitive,
    Replay,
    External,
}

impl MergeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeMethod::Llm => "llm",
            MergeMethod::Validated => "validated",
            MergeMethod::EmbeddingThreshold => "embedding_threshold",
            MergeMethod::ExistingAlias => "existing_alias",
            MergeMethod::ExistingAliasTransitive => "existing_alias_transitive",
            MergeMethod::Replay => "replay",
            MergeMethod::External => "external",
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// "`duplicate` is the same referent as `canonical`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub duplicate: NodeId,
    pub canonical: NodeId,
    pub method: MergeMethod,
    pub confidence: f32,
    #[serde(default)]
    pub rationale: String,
}

impl MergeDecision {
    pub fn new(duplicate: NodeId, canonical: NodeId, method: MergeMethod, confidence: f32) -> Self {
        Self {
            duplicate,
            canonical,
            method,
            confidence,
            rationale: String::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }
}

/// Closed `duplicate -> canonical` mapping. No canonical is a key and no
/// entry maps a node to itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeMapping {
    targets: BTreeMap<NodeId, NodeId>,
    decisions: BTreeMap<NodeId, MergeDecision>,
}

impl MergeMapping {
    /// Build from decisions that are already closed (e.g. loaded from an
    /// artifact). Entries that would break closure are dropped with a warning.
    pub fn from_closed(decisions: impl IntoIterator<Item = MergeDecision>) -> Self {
        let mut mapping = Self::default();
        for decision in decisions {
            if decision.duplicate == decision.canonical {
                continue;
            }
            mapping.targets.insert(decision.duplicate.clone(), decision.canonical.clone());
            mapping.decisions.insert(decision.duplicate.clone(), decision);
        }
        let broken: Vec<NodeId> = mapping
            .targets
            .iter()
            .filter(|(_, canonical)| mapping.targets.contains_key(*canonical))
            .map(|(dup, _)| dup.clone())
            .collect();
        for dup in broken {
            warn!(duplicate = %dup, "Dropping non-closed merge entry");
            mapping.targets.remove(&dup);
            mapping.decisions.remove(&dup);
        }
        mapping
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeId> {
        self.targets.get(id)
    }

    /// Final canonical for `id` (itself when unmapped).
    pub fn resolve<'a>(&'a self, id: &'a NodeId) -> &'a NodeId {
        self.targets.get(id).unwrap_or(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeId)> {
        self.targets.iter()
    }

    pub fn decision(&self, duplicate: &NodeId) -> Option<&MergeDecision> {
        self.decisions.get(duplicate)
    }

    pub fn decisions(&self) -> impl Iterator<Item = &MergeDecision> {
        self.decisions.values()
    }

    pub fn canonicals(&self) -> BTreeSet<&NodeId> {
        self.targets.values().collect()
    }
}

/// Deterministic canonical preference between two nodes: higher out-degree,
/// then longer description, then more chunks, then the smaller id.
pub fn tie_break<'a>(graph: &KnowledgeGraph, a: &'a NodeId, b: &'a NodeId) -> &'a NodeId {
    let score = |id: &NodeId| {
        let node = graph.node(id);
        (
            graph.out_degree(id),
            node.map_or(0, |n| n.description().chars().count()),
            node.map_or(0, |n| n.chunk_ids().len()),
        )
    };
    match score(a).cmp(&score(b)) {
        Ordering::Greater => a,
        Ordering::Less => b,
        Ordering::Equal => {
            if a <= b {
                a
            } else {
                b
            }
        }
    }
}

/// Canonical side of an explicit alias edge between `a` and `b`, if any.
/// Outranks [`tie_break`] when orienting a pair.
pub fn explicit_canonical<'a>(
    graph: &KnowledgeGraph,
    aliases: &AliasRelations,
    a: &'a NodeId,
    b: &'a NodeId,
) -> Option<&'a NodeId> {
    let linked = |from: &'a NodeId, to: &'a NodeId| {
        graph
            .out_edges(from)
            .into_iter()
            .filter(|key| key.target == *to)
            .find_map(|key| {
                aliases
                    .alias_pair(from.as_str(), &key.relation, to.as_str())
                    .map(|(_, canonical)| if canonical == a.as_str() { a } else { b })
            })
    };
    linked(a, b).or_else(|| linked(b, a))
}

pub struct MergeResolver<'g> {
    graph: &'g KnowledgeGraph,
    parent: BTreeMap<NodeId, NodeId>,
    /// Roots that some decision named as canonical.
    anchored: BTreeSet<NodeId>,
    /// First decision naming each node as duplicate, or the decision that
    /// folded its set into another.
    reasons: BTreeMap<NodeId, MergeDecision>,
}

impl<'g> MergeResolver<'g> {
    pub fn new(graph: &'g KnowledgeGraph) -> Self {
        Self {
            graph,
            parent: BTreeMap::new(),
            anchored: BTreeSet::new(),
            reasons: BTreeMap::new(),
        }
    }

    pub fn find(&mut self, id: &NodeId) -> NodeId {
        let mut root = id.clone();
        while let Some(next) = self.parent.get(&root) {
            if *next == root {
                break;
            }
            root = next.clone();
        }
        // Path compression.
        let mut cursor = id.clone();
        while cursor != root {
            let next = self.parent.insert(cursor.clone(), root.clone());
            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        root
    }

    fn ensure(&mut self, id: &NodeId) {
        self.parent.entry(id.clone()).or_insert_with(|| id.clone());
    }

    pub fn add_decisions(&mut self, decisions: impl IntoIterator<Item = MergeDecision>) {
        for decision in decisions {
            self.add_decision(decision);
        }
    }

    pub fn add_decision(&mut self, decision: MergeDecision) {
        if decision.duplicate == decision.canonical {
            return;
        }
        self.ensure(&decision.duplicate);
        self.ensure(&decision.canonical);

        let dup_root = self.find(&decision.duplicate);
        let canon_root = self.find(&decision.canonical);

        self.reasons
            .entry(decision.duplicate.clone())
            .or_insert_with(|| decision.clone());

        if dup_root == canon_root {
            debug!(duplicate = %decision.duplicate, canonical = %decision.canonical, "Already merged");
            return;
        }

        let (loser, winner) =
            if self.anchored.contains(&dup_root) && self.anchored.contains(&canon_root) {
                let winner = tie_break(self.graph, &dup_root, &canon_root).clone();
                if winner == dup_root {
                    (canon_root, dup_root)
                } else {
                    (dup_root, canon_root)
                }
            } else {
                (dup_root, canon_root)
            };

        self.parent.insert(loser.clone(), winner.clone());
        self.anchored.remove(&loser);
        self.anchored.insert(winner.clone());
        if loser != decision.duplicate {
            let mut folded = decision;
            folded.duplicate = loser.clone();
            folded.canonical = winner;
            self.reasons.entry(loser).or_insert(folded);
        }
    }

    /// Fold explicit alias edges of the graph into the forest. Only edges
    /// touching a node that already takes part in a merge are considered.
    ///
    /// If `B` is an alias of `A` and `B` was merged into `C`, `A` is forced
    /// into `C` as well (`existing_alias_transitive`).
    pub fn fold_existing_aliases(&mut self, aliases: &AliasRelations) {
        let graph = self.graph;
        for (key, _) in graph.edges() {
            let Some((alias, canonical)) =
                aliases.alias_pair(key.source.as_str(), &key.relation, key.target.as_str())
            else {
                continue;
            };
            let alias = NodeId::new(alias);
            let canonical = NodeId::new(canonical);
            if alias == canonical {
                continue;
            }
            if !self.parent.contains_key(&alias) && !self.parent.contains_key(&canonical) {
                continue;
            }
            self.ensure(&alias);
            self.ensure(&canonical);

            let alias_root = self.find(&alias);
            let canon_root = self.find(&canonical);
            if alias_root == canon_root {
                if alias_root == alias {
                    let decision = MergeDecision::new(alias.clone(), canonical.clone(), MergeMethod::ExistingAlias, 1.0)
                        .with_rationale(format!("explicit {} relation", key.relation));
                    self.reroot(&alias, &canonical, decision);
                }
                continue;
            }

            if alias_root != alias {
                // The alias was merged elsewhere: follow it.
                let decision = MergeDecision::new(
                    canonical.clone(),
                    alias_root.clone(),
                    MergeMethod::ExistingAliasTransitive,
                    1.0,
                )
                .with_rationale(format!(
                    "{alias} --{}--> {canonical}; {alias} merged into {alias_root}",
                    key.relation
                ));
                self.force(canon_root, alias_root, decision);
            } else {
                let decision = MergeDecision::new(alias.clone(), canonical.clone(), MergeMethod::ExistingAlias, 1.0)
                    .with_rationale(format!("explicit {} relation", key.relation));
                self.force(alias_root, canon_root, decision);
            }
        }
    }

    fn force(&mut self, loser: NodeId, winner: NodeId, decision: MergeDecision) {
        self.parent.insert(loser.clone(), winner.clone());
        self.anchored.remove(&loser);
        self.anchored.insert(winner);
        // Alias evidence outranks whatever merged the loser's members earlier.
        self.reasons.insert(decision.duplicate.clone(), decision);
    }

    /// Make `new_root` the representative of the set currently rooted at
    /// `old_root`. Members still pointing at `old_root` follow it.
    fn reroot(&mut self, old_root: &NodeId, new_root: &NodeId, decision: MergeDecision) {
        debug!(from = %old_root, to = %new_root, "Re-rooting on explicit alias");
        self.parent.insert(new_root.clone(), new_root.clone());
        self.parent.insert(old_root.clone(), new_root.clone());
        self.anchored.remove(old_root);
        self.anchored.insert(new_root.clone());
        self.reasons.remove(new_root);
        self.reasons.insert(decision.duplicate.clone(), decision);
    }

    /// Closed mapping plus, for every duplicate, the decision reported in
    /// merge metadata (with its canonical rewritten to the final root).
    pub fn resolve(mut self) -> MergeMapping {
        let ids: Vec<NodeId> = self.parent.keys().cloned().collect();
        let mut mapping = MergeMapping::default();
        for id in ids {
            let root = self.find(&id);
            if root == id {
                continue;
            }
            let mut decision = self
                .reasons
                .get(&id)
                .cloned()
                .unwrap_or_else(|| MergeDecision::new(id.clone(), root.clone(), MergeMethod::Validated, 1.0));
            decision.duplicate = id.clone();
            decision.canonical = root.clone();
            mapping.targets.insert(id.clone(), root);
            mapping.decisions.insert(id, decision);
        }
        mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{named, EdgeAttrs, EdgeKey, NodeLabel};

    fn graph(names: &[&str]) -> (KnowledgeGraph, Vec<NodeId>) {
        let mut g = KnowledgeGraph::new();
        let ids = names
            .iter()
            .map(|n| g.upsert_node(NodeLabel::Entity, named(n)).unwrap())
            .collect();
        (g, ids)
    }

    fn llm(dup: &NodeId, canon: &NodeId) -> MergeDecision {
        MergeDecision::new(dup.clone(), canon.clone(), MergeMethod::Llm, 0.9)
    }

    #[test]
    fn closure_is_transitive_and_idempotent() {
        let (g, ids) = graph(&["a", "b", "c", "d"]);
        let mut resolver = MergeResolver::new(&g);
        resolver.add_decision(llm(&ids[0], &ids[1]));
        resolver.add_decision(llm(&ids[1], &ids[2]));
        resolver.add_decision(llm(&ids[3], &ids[0]));
        let mapping = resolver.resolve();

        assert_eq!(mapping.len(), 3);
        for (dup, canon) in mapping.iter() {
            assert_eq!(canon, &ids[2]);
            assert!(mapping.get(canon).is_none(), "{dup} maps to a duplicate");
        }
    }

    #[test]
    fn honours_the_chosen_representative() {
        let (mut g, ids) = graph(&["George Lucas", "G. Lucas", "hub"]);
        // Give the duplicate more structure than the canonical.
        g.add_edge(EdgeKey::new(ids[1].clone(), "r", ids[2].clone()), EdgeAttrs::default())
            .unwrap();
        let mut resolver = MergeResolver::new(&g);
        resolver.add_decision(llm(&ids[1], &ids[0]));
        let mapping = resolver.resolve();
        assert_eq!(mapping.get(&ids[1]), Some(&ids[0]));
    }

    #[test]
    fn colliding_canonicals_use_tie_break() {
        let (mut g, ids) = graph(&["a", "b", "x", "y", "hub"]);
        g.add_edge(EdgeKey::new(ids[1].clone(), "r", ids[4].clone()), EdgeAttrs::default())
            .unwrap();
        let mut resolver = MergeResolver::new(&g);
        resolver.add_decision(llm(&ids[2], &ids[0])); // x -> a
        resolver.add_decision(llm(&ids[3], &ids[1])); // y -> b
        resolver.add_decision(llm(&ids[0], &ids[1])); // a -> b, both anchored
        let mapping = resolver.resolve();
        // b has the higher out-degree.
        assert_eq!(mapping.resolve(&ids[2]), &ids[1]);
        assert_eq!(mapping.decision(&ids[0]).unwrap().canonical, ids[1]);
    }

    #[test]
    fn tie_break_falls_back_to_smaller_id() {
        let (g, ids) = graph(&["a", "b"]);
        assert_eq!(tie_break(&g, &ids[1], &ids[0]), &ids[0]);
    }

    #[test]
    fn tie_break_prefers_longer_description() {
        let mut g = KnowledgeGraph::new();
        let short = g.upsert_node(NodeLabel::Entity, named("a")).unwrap();
        let mut props = named("b");
        props.insert("description".into(), "a longer description".into());
        let long = g.upsert_node(NodeLabel::Entity, props).unwrap();
        assert_eq!(tie_break(&g, &short, &long), &long);
    }

    #[test]
    fn transitive_alias_override() {
        let (mut g, ids) = graph(&["A", "B", "C"]);
        let (a, b, c) = (&ids[0], &ids[1], &ids[2]);
        g.add_edge(EdgeKey::new(b.clone(), "alias_of", a.clone()), EdgeAttrs::default())
            .unwrap();

        let mut resolver = MergeResolver::new(&g);
        resolver.add_decision(llm(b, c));
        resolver.fold_existing_aliases(&AliasRelations::default());
        let mapping = resolver.resolve();

        assert_eq!(mapping.get(a), Some(c));
        assert_eq!(mapping.get(b), Some(c));
        assert_eq!(mapping.decision(a).unwrap().method, MergeMethod::ExistingAliasTransitive);
        assert_eq!(mapping.decision(b).unwrap().method, MergeMethod::Llm);
    }

    #[test]
    fn existing_alias_joins_its_canonical() {
        let (mut g, ids) = graph(&["Aspirin", "ASA", "Salicylate"]);
        g.add_edge(EdgeKey::new(ids[0].clone(), "别名包括", ids[1].clone()), EdgeAttrs::default())
            .unwrap();
        let mut resolver = MergeResolver::new(&g);
        resolver.add_decision(llm(&ids[2], &ids[0]));
        resolver.fold_existing_aliases(&AliasRelations::default());
        let mapping = resolver.resolve();
        assert_eq!(mapping.get(&ids[1]), Some(&ids[0]));
        assert_eq!(mapping.decision(&ids[1]).unwrap().method, MergeMethod::ExistingAlias);
    }

    #[test]
    fn unrelated_alias_edges_are_left_alone() {
        let (mut g, ids) = graph(&["A", "B", "C", "D"]);
        g.add_edge(EdgeKey::new(ids[3].clone(), "alias_of", ids[2].clone()), EdgeAttrs::default())
            .unwrap();
        let mut resolver = MergeResolver::new(&g);
        resolver.add_decision(llm(&ids[1], &ids[0]));
        resolver.fold_existing_aliases(&AliasRelations::default());
        let mapping = resolver.resolve();
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn alias_side_never_becomes_the_root() {
        let (mut g, ids) = graph(&["NYC", "New York City", "Manhattan"]);
        let (nyc, city) = (&ids[0], &ids[1]);
        // The alias edge itself gives NYC the higher out-degree.
        g.add_edge(EdgeKey::new(nyc.clone(), "alias_of", city.clone()), EdgeAttrs::default())
            .unwrap();
        g.add_edge(EdgeKey::new(ids[2].clone(), "r", city.clone()), EdgeAttrs::default())
            .unwrap();

        let mut resolver = MergeResolver::new(&g);
        resolver.add_decision(llm(city, nyc));
        resolver.add_decision(llm(&ids[2], nyc));
        resolver.fold_existing_aliases(&AliasRelations::default());
        let mapping = resolver.resolve();

        assert_eq!(mapping.get(nyc), Some(city));
        assert!(mapping.get(city).is_none());
        assert_eq!(mapping.resolve(&ids[2]), city);
        assert_eq!(mapping.decision(nyc).unwrap().method, MergeMethod::ExistingAlias);
    }

    #[test]
    fn explicit_alias_outranks_tie_break() {
        let (mut g, ids) = graph(&["NYC", "New York City"]);
        let (nyc, city) = (&ids[0], &ids[1]);
        g.add_edge(EdgeKey::new(nyc.clone(), "alias_of", city.clone()), EdgeAttrs::default())
            .unwrap();
        let aliases = AliasRelations::default();

        assert_eq!(tie_break(&g, nyc, city), nyc);
        assert_eq!(explicit_canonical(&g, &aliases, nyc, city), Some(city));
        assert_eq!(explicit_canonical(&g, &aliases, city, nyc), Some(city));

        let mut reverse = KnowledgeGraph::new();
        let a = reverse.upsert_node(NodeLabel::Entity, named("Aspirin")).unwrap();
        let b = reverse.upsert_node(NodeLabel::Entity, named("ASA")).unwrap();
        reverse
            .add_edge(EdgeKey::new(a.clone(), "has_alias", b.clone()), EdgeAttrs::default())
            .unwrap();
        assert_eq!(explicit_canonical(&reverse, &aliases, &b, &a), Some(&a));
        assert_eq!(explicit_canonical(&g, &aliases, nyc, nyc), None);
    }

    #[test]
    fn from_closed_drops_chained_entries() {
        let (_, ids) = graph(&["a", "b", "c"]);
        let mapping = MergeMapping::from_closed([llm(&ids[0], &ids[1]), llm(&ids[1], &ids[2])]);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get(&ids[1]), Some(&ids[2]));
    }
}
