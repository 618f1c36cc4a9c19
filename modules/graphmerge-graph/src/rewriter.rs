//! Applies resolved merges to the graph.
//!
//! Node merges redirect every edge of the duplicate to the canonical, keep the
//! duplicate as an alias node, and rename community members. Tail merges only
//! move one `(head, relation, tail)` edge; the old tail stays in the graph as
//! an alias of the new one, and community members are renamed only once
//! nothing but alias edges reference it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use graphmerge_core::alias::ALIAS_OF;
use graphmerge_core::{AliasRelations, GraphConfig};

use crate::model::{EdgeAttrs, EdgeKey, KnowledgeGraph, NodeId, NodeLabel};
use crate::union_find::{MergeMapping, MergeMethod};

const CREATOR: &str = "semantic_dedup";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteStats {
    pub nodes_merged: usize,
    pub edges_redirected: usize,
    pub edges_merged: usize,
    pub self_loops_suppressed: usize,
    pub alias_edges_preserved: usize,
    pub keyword_filter_updates: usize,
    pub community_updates: usize,
    pub isolated_removed: usize,
    pub skipped_references: usize,
}

impl RewriteStats {
    pub fn absorb(&mut self, other: &RewriteStats) {
        self.nodes_merged += other.nodes_merged;
        self.edges_redirected += other.edges_redirected;
        self.edges_merged += other.edges_merged;
        self.self_loops_suppressed += other.self_loops_suppressed;
        self.alias_edges_preserved += other.alias_edges_preserved;
        self.keyword_filter_updates += other.keyword_filter_updates;
        self.community_updates += other.community_updates;
        self.isolated_removed += other.isolated_removed;
        self.skipped_references += other.skipped_references;
    }
}

impl fmt::Display for RewriteStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merged {} nodes, redirected {} edges ({} folded into existing), \
             {} self-loops suppressed, {} alias edges preserved, {} keyword_filter_by rewrites, \
             {} communities updated, {} isolated removed, {} skipped references",
            self.nodes_merged,
            self.edges_redirected,
            self.edges_merged,
            self.self_loops_suppressed,
            self.alias_edges_preserved,
            self.keyword_filter_updates,
            self.community_updates,
            self.isolated_removed,
            self.skipped_references,
        )
    }
}

/// `(head, relation, duplicate_tail) -> canonical_tail`, scoped to one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeMerge {
    pub head: NodeId,
    pub relation: String,
    pub duplicate_tail: NodeId,
    pub canonical_tail: NodeId,
    pub method: MergeMethod,
    pub confidence: f32,
    #[serde(default)]
    pub rationale: String,
}

impl EdgeMerge {
    fn old_key(&self) -> EdgeKey {
        EdgeKey::new(self.head.clone(), self.relation.clone(), self.duplicate_tail.clone())
    }

    fn new_key(&self) -> EdgeKey {
        EdgeKey::new(self.head.clone(), self.relation.clone(), self.canonical_tail.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeMapping {
    entries: BTreeMap<EdgeKey, EdgeMerge>,
}

impl EdgeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, merge: EdgeMerge) {
        if merge.duplicate_tail != merge.canonical_tail {
            self.entries.insert(merge.old_key(), merge);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EdgeMerge> {
        self.entries.values()
    }

    pub fn to_vec(&self) -> Vec<EdgeMerge> {
        self.entries.values().cloned().collect()
    }
}

impl FromIterator<EdgeMerge> for EdgeMapping {
    fn from_iter<I: IntoIterator<Item = EdgeMerge>>(iter: I) -> Self {
        let mut mapping = EdgeMapping::new();
        for merge in iter {
            mapping.insert(merge);
        }
        mapping
    }
}

/// Provenance written into `aliases[]` and `dedup_metadata`.
struct Provenance<'a> {
    method: MergeMethod,
    confidence: f32,
    rationale: &'a str,
}

pub struct GraphRewriter {
    aliases: AliasRelations,
    keyword_filter_relation: String,
    remove_isolated: bool,
}

impl GraphRewriter {
    pub fn new(aliases: AliasRelations) -> Self {
        Self {
            aliases,
            keyword_filter_relation: "keyword_filter_by".to_string(),
            remove_isolated: false,
        }
    }

    pub fn from_config(config: &GraphConfig) -> Self {
        Self {
            aliases: config.alias_relations.clone(),
            keyword_filter_relation: config.keyword_filter_relation.clone(),
            remove_isolated: config.remove_isolated,
        }
    }

    pub fn with_remove_isolated(mut self, remove: bool) -> Self {
        self.remove_isolated = remove;
        self
    }

    pub fn aliases(&self) -> &AliasRelations {
        &self.aliases
    }

    /// Apply node-level merges. Re-applying the same mapping is a no-op.
    pub fn apply_merges(&self, graph: &mut KnowledgeGraph, mapping: &MergeMapping) -> RewriteStats {
        let mut stats = RewriteStats::default();

        let mut valid: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        for (dup, canonical) in mapping.iter() {
            if !graph.contains_node(dup) || !graph.contains_node(canonical) {
                warn!(duplicate = %dup, canonical = %canonical, "Merge references a vanished node, skipping");
                stats.skipped_references += 1;
                continue;
            }
            valid.insert(dup.clone(), canonical.clone());
        }
        if valid.is_empty() {
            return stats;
        }

        for (dup, canonical) in &valid {
            let provenance = match mapping.decision(dup) {
                Some(d) => Provenance {
                    method: d.method,
                    confidence: d.confidence,
                    rationale: &d.rationale,
                },
                None => Provenance {
                    method: MergeMethod::Validated,
                    confidence: 1.0,
                    rationale: "",
                },
            };
            if self.mark_alias(graph, dup, canonical, &provenance) {
                stats.nodes_merged += 1;
            }
        }

        self.redirect_edges(graph, &valid, &mut stats);

        let renames = name_renames(graph, valid.iter());
        stats.community_updates += rename_community_members(graph, &renames);

        self.remove_orphans(graph, &mut stats);
        debug!(%stats, "Applied node merges");
        stats
    }

    /// Apply tail merges scoped to `(head, relation)` pairs.
    pub fn apply_edge_merges(&self, graph: &mut KnowledgeGraph, mapping: &EdgeMapping) -> RewriteStats {
        let mut stats = RewriteStats::default();
        let mut folded: Vec<(NodeId, NodeId)> = Vec::new();

        for merge in mapping.iter() {
            let old_key = merge.old_key();
            let new_key = merge.new_key();
            if !graph.contains_node(&merge.canonical_tail) {
                warn!(edge = %old_key, canonical = %merge.canonical_tail, "Canonical tail vanished, skipping");
                stats.skipped_references += 1;
                continue;
            }
            let Some(attrs) = graph.remove_edge(&old_key) else {
                if graph.contains_edge(&new_key) {
                    debug!(edge = %old_key, "Tail merge already applied");
                } else {
                    warn!(edge = %old_key, "Edge referenced by tail merge vanished, skipping");
                    stats.skipped_references += 1;
                }
                continue;
            };

            match graph.add_edge(new_key, attrs) {
                Ok(true) => self.count_redirect(&merge.relation, &mut stats),
                Ok(false) => stats.edges_merged += 1,
                Err(e) => {
                    warn!(edge = %old_key, error = %e, "Failed to redirect tail edge");
                    stats.skipped_references += 1;
                    continue;
                }
            }

            let head_name = graph.node(&merge.head).map(|n| n.name().to_string()).unwrap_or_default();
            let dup_name = graph
                .node(&merge.duplicate_tail)
                .map(|n| n.name().to_string())
                .unwrap_or_default();
            if let Some(node) = graph.node_mut(&merge.canonical_tail) {
                node.append_unique(
                    "dedup_metadata",
                    json!({
                        "method": merge.method,
                        "role": "canonical_tail",
                        "peer": merge.duplicate_tail,
                        "peer_name": dup_name,
                        "head": head_name,
                        "relation": merge.relation,
                        "confidence": round3(merge.confidence),
                        "rationale": merge.rationale,
                    }),
                );
            }

            let Some(target) = alias_target(graph, &merge.duplicate_tail, &merge.canonical_tail) else {
                continue;
            };
            let provenance = Provenance {
                method: merge.method,
                confidence: merge.confidence,
                rationale: &merge.rationale,
            };
            if self.mark_alias(graph, &merge.duplicate_tail, &target, &provenance) {
                stats.nodes_merged += 1;
            }
            stats.alias_edges_preserved += self.collapse_alias_edges(graph, &merge.duplicate_tail, &target);
            if self.only_alias_edges(graph, &merge.duplicate_tail) {
                folded.push((merge.duplicate_tail.clone(), target));
            }
        }

        let renames = name_renames(graph, folded.iter().map(|(d, c)| (d, c)));
        stats.community_updates += rename_community_members(graph, &renames);

        self.remove_orphans(graph, &mut stats);
        debug!(%stats, "Applied tail merges");
        stats
    }

    fn count_redirect(&self, relation: &str, stats: &mut RewriteStats) {
        if relation == self.keyword_filter_relation {
            stats.keyword_filter_updates += 1;
        } else {
            stats.edges_redirected += 1;
        }
    }

    /// Retain `dup` as an alias of `canonical`. Returns whether anything changed.
    fn mark_alias(&self, graph: &mut KnowledgeGraph, dup: &NodeId, canonical: &NodeId, provenance: &Provenance<'_>) -> bool {
        let Some(dup_name) = graph.node(dup).map(|n| n.name().to_string()) else {
            return false;
        };
        let mut changed = false;

        if let Some(node) = graph.node_mut(dup) {
            if !node.is_alias() {
                node.set("node_role", "alias");
                changed = true;
            }
            if node.alias_of() != Some(canonical.as_str()) {
                node.set("alias_of", canonical.as_str());
                changed = true;
            }
        }

        match graph.add_edge(
            EdgeKey::new(dup.clone(), ALIAS_OF, canonical.clone()),
            EdgeAttrs::created_by(CREATOR),
        ) {
            Ok(created) => changed |= created,
            Err(e) => warn!(duplicate = %dup, error = %e, "Failed to add alias edge"),
        }

        if let Some(node) = graph.node_mut(canonical) {
            changed |= node.append_unique(
                "aliases",
                json!({
                    "alias_id": dup,
                    "alias_name": dup_name,
                    "confidence": round3(provenance.confidence),
                    "method": provenance.method,
                }),
            );
        }

        changed |= self.retarget_alias_nodes(graph, dup, canonical);

        if changed {
            let entry = |role: &str, peer: &NodeId| {
                json!({
                    "method": provenance.method,
                    "role": role,
                    "peer": peer,
                    "confidence": round3(provenance.confidence),
                    "rationale": provenance.rationale,
                })
            };
            if let Some(node) = graph.node_mut(dup) {
                node.append_unique("dedup_metadata", entry("duplicate", canonical));
            }
            if let Some(node) = graph.node_mut(canonical) {
                node.append_unique("dedup_metadata", entry("canonical", dup));
            }
        }
        changed
    }

    /// Alias-relation edges between `dup` and `canonical`, in either
    /// direction, become the single `dup --alias_of--> canonical` edge.
    fn collapse_alias_edges(&self, graph: &mut KnowledgeGraph, dup: &NodeId, canonical: &NodeId) -> usize {
        let preserved = EdgeKey::new(dup.clone(), ALIAS_OF, canonical.clone());
        let between: Vec<EdgeKey> = graph
            .out_edges(dup)
            .into_iter()
            .filter(|k| k.target == *canonical)
            .chain(graph.in_edges(dup).into_iter().filter(|k| k.source == *canonical))
            .filter(|k| *k != preserved && self.aliases.is_alias(&k.relation))
            .collect();

        let mut collapsed = 0;
        for key in between {
            let Some(attrs) = graph.remove_edge(&key) else {
                continue;
            };
            if let Err(e) = graph.add_edge(preserved.clone(), attrs) {
                warn!(edge = %key, error = %e, "Failed to preserve alias edge");
            }
            collapsed += 1;
        }
        collapsed
    }

    /// Nothing but alias edges still touch `id`: a tail folded away entirely.
    fn only_alias_edges(&self, graph: &KnowledgeGraph, id: &NodeId) -> bool {
        graph
            .out_edges(id)
            .iter()
            .chain(graph.in_edges(id).iter())
            .all(|k| self.aliases.is_alias(&k.relation))
    }

    /// Alias nodes that pointed at `dup` now point at `canonical`.
    fn retarget_alias_nodes(&self, graph: &mut KnowledgeGraph, dup: &NodeId, canonical: &NodeId) -> bool {
        let pointing: Vec<NodeId> = graph
            .in_edges(dup)
            .into_iter()
            .filter(|k| k.relation == ALIAS_OF)
            .map(|k| k.source)
            .filter(|src| graph.node(src).and_then(|n| n.alias_of()) == Some(dup.as_str()))
            .collect();
        if pointing.is_empty() {
            return false;
        }

        for id in &pointing {
            if let Some(node) = graph.node_mut(id) {
                node.set("alias_of", canonical.as_str());
            }
        }

        let moved: Vec<Value> = graph
            .node_mut(dup)
            .and_then(|n| n.properties.remove("aliases"))
            .and_then(|v| match v {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .unwrap_or_default();
        if let Some(node) = graph.node_mut(canonical) {
            for entry in moved {
                node.append_unique("aliases", entry);
            }
        }
        true
    }

    fn redirect_edges(&self, graph: &mut KnowledgeGraph, valid: &BTreeMap<NodeId, NodeId>, stats: &mut RewriteStats) {
        let resolve = |id: &NodeId| valid.get(id).cloned().unwrap_or_else(|| id.clone());

        for key in graph.edge_keys() {
            let source = resolve(&key.source);
            let target = resolve(&key.target);
            if source == key.source && target == key.target {
                continue;
            }
            let Some(attrs) = graph.edge(&key).cloned() else {
                continue;
            };

            if source == target {
                if self.aliases.is_alias(&key.relation) {
                    let alias_node = self.surviving_alias(&key, &source);
                    let preserved = EdgeKey::new(alias_node, ALIAS_OF, source);
                    if preserved == key {
                        continue;
                    }
                    graph.remove_edge(&key);
                    if let Err(e) = graph.add_edge(preserved, attrs) {
                        warn!(edge = %key, error = %e, "Failed to preserve alias edge");
                    }
                    stats.alias_edges_preserved += 1;
                } else {
                    graph.remove_edge(&key);
                    stats.self_loops_suppressed += 1;
                }
                continue;
            }

            let relation = key.relation.clone();
            graph.remove_edge(&key);
            match graph.add_edge(EdgeKey::new(source, relation.clone(), target), attrs) {
                Ok(true) => self.count_redirect(&relation, stats),
                Ok(false) => stats.edges_merged += 1,
                Err(e) => {
                    warn!(edge = %key, error = %e, "Failed to redirect edge");
                    stats.skipped_references += 1;
                }
            }
        }
    }

    /// For an alias edge collapsing onto `canonical`, the endpoint kept as the
    /// alias: the one that is not the canonical, or the edge's own alias side.
    fn surviving_alias(&self, key: &EdgeKey, canonical: &NodeId) -> NodeId {
        if key.source != *canonical && key.target != *canonical {
            return self
                .aliases
                .alias_pair(key.source.as_str(), &key.relation, key.target.as_str())
                .map(|(alias, _)| NodeId::new(alias))
                .unwrap_or_else(|| key.source.clone());
        }
        if key.source != *canonical {
            key.source.clone()
        } else {
            key.target.clone()
        }
    }

    fn remove_orphans(&self, graph: &mut KnowledgeGraph, stats: &mut RewriteStats) {
        if !self.remove_isolated {
            return;
        }
        let orphans: Vec<NodeId> = graph
            .nodes()
            .filter(|n| graph.is_isolated(&n.id))
            .filter(|n| !(n.label == NodeLabel::Community && !n.members().is_empty()))
            .map(|n| n.id.clone())
            .collect();
        for id in orphans {
            graph.remove_node(&id);
            stats.isolated_removed += 1;
        }
    }
}

/// Where a tail duplicate should point: the canonical, or the node the
/// canonical is itself an alias of. `None` when that chain leads back to
/// the duplicate.
fn alias_target(graph: &KnowledgeGraph, dup: &NodeId, canonical: &NodeId) -> Option<NodeId> {
    if !graph.contains_node(dup) {
        return None;
    }
    let mut target = canonical.clone();
    for _ in 0..=graph.node_count() {
        if target == *dup {
            return None;
        }
        match graph.node(&target).filter(|n| n.is_alias()).and_then(|n| n.alias_of()) {
            Some(next) if graph.contains_node(&NodeId::new(next)) => target = NodeId::new(next),
            _ => return Some(target),
        }
    }
    None
}

fn name_renames<'a>(
    graph: &KnowledgeGraph,
    pairs: impl Iterator<Item = (&'a NodeId, &'a NodeId)>,
) -> HashMap<String, String> {
    let mut renames = HashMap::new();
    for (dup, canonical) in pairs {
        let (Some(d), Some(c)) = (graph.node(dup), graph.node(canonical)) else {
            continue;
        };
        if d.name() != c.name() {
            renames
                .entry(d.name().to_string())
                .or_insert_with(|| c.name().to_string());
        }
    }
    renames
}

/// Replace duplicate names in every community's `members`, keeping first
/// occurrences. Returns the number of communities changed.
pub fn rename_community_members(graph: &mut KnowledgeGraph, renames: &HashMap<String, String>) -> usize {
    if renames.is_empty() {
        return 0;
    }
    let communities: Vec<NodeId> = graph
        .nodes_with_label(NodeLabel::Community)
        .map(|n| n.id.clone())
        .collect();

    let mut updated = 0;
    for id in communities {
        let Some(node) = graph.node_mut(&id) else {
            continue;
        };
        let members = node.members();
        let mut rewritten: Vec<String> = Vec::with_capacity(members.len());
        for member in &members {
            let name = renames.get(member).unwrap_or(member);
            if !rewritten.contains(name) {
                rewritten.push(name.clone());
            }
        }
        if rewritten != members {
            node.set("members", rewritten);
            updated += 1;
        }
    }
    updated
}

fn round3(value: f32) -> f64 {
    (f64::from(value) * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::named;
    use crate::union_find::{MergeDecision, MergeResolver};

    fn entity(g: &mut KnowledgeGraph, name: &str) -> NodeId {
        g.upsert_node(NodeLabel::Entity, named(name)).unwrap()
    }

    fn link(g: &mut KnowledgeGraph, s: &NodeId, r: &str, t: &NodeId) {
        g.add_edge(EdgeKey::new(s.clone(), r, t.clone()), EdgeAttrs::default()).unwrap();
    }

    fn mapping(pairs: &[(&NodeId, &NodeId)]) -> MergeMapping {
        MergeMapping::from_closed(
            pairs
                .iter()
                .map(|(d, c)| MergeDecision::new((*d).clone(), (*c).clone(), MergeMethod::Llm, 0.9)),
        )
    }

    fn rewriter() -> GraphRewriter {
        GraphRewriter::new(AliasRelations::default())
    }

    #[test]
    fn redirects_edges_and_keeps_alias_node() {
        let mut g = KnowledgeGraph::new();
        let film = entity(&mut g, "Star Wars");
        let lucas = entity(&mut g, "George Lucas");
        let g_lucas = entity(&mut g, "G. Lucas");
        link(&mut g, &film, "director", &lucas);
        link(&mut g, &film, "director", &g_lucas);

        let stats = rewriter().apply_merges(&mut g, &mapping(&[(&g_lucas, &lucas)]));

        assert_eq!(stats.nodes_merged, 1);
        assert_eq!(stats.edges_merged, 1);
        assert!(g.contains_edge(&EdgeKey::new(film.clone(), "director", lucas.clone())));
        assert!(!g.contains_edge(&EdgeKey::new(film, "director", g_lucas.clone())));
        assert!(g.contains_edge(&EdgeKey::new(g_lucas.clone(), ALIAS_OF, lucas.clone())));

        let alias = g.node(&g_lucas).unwrap();
        assert!(alias.is_alias());
        assert_eq!(alias.alias_of(), Some(lucas.as_str()));
        let aliases = g.node(&lucas).unwrap().properties["aliases"].as_array().unwrap();
        assert_eq!(aliases[0]["alias_name"], "G. Lucas");
        assert_eq!(aliases[0]["method"], "llm");
    }

    #[test]
    fn reapplying_a_mapping_is_a_no_op() {
        let mut g = KnowledgeGraph::new();
        let a = entity(&mut g, "A");
        let b = entity(&mut g, "B");
        let x = entity(&mut g, "X");
        link(&mut g, &b, "rel", &x);
        link(&mut g, &x, "rel", &b);
        let m = mapping(&[(&b, &a)]);

        rewriter().apply_merges(&mut g, &m);
        let once = g.clone();
        let stats = rewriter().apply_merges(&mut g, &m);

        assert_eq!(g, once);
        assert_eq!(stats, RewriteStats::default());
    }

    #[test]
    fn suppresses_non_alias_self_loops() {
        let mut g = KnowledgeGraph::new();
        let a = entity(&mut g, "A");
        let b = entity(&mut g, "B");
        link(&mut g, &a, "related_to", &b);
        let stats = rewriter().apply_merges(&mut g, &mapping(&[(&a, &b)]));
        assert_eq!(stats.self_loops_suppressed, 1);
        assert!(g.edges().all(|(k, _)| !k.is_self_loop()));
    }

    #[test]
    fn alias_edge_between_merged_nodes_survives_as_alias_of() {
        let mut g = KnowledgeGraph::new();
        let a = entity(&mut g, "A");
        let b = entity(&mut g, "B");
        link(&mut g, &a, "also_known_as", &b);

        let stats = rewriter().apply_merges(&mut g, &mapping(&[(&a, &b)]));

        assert_eq!(stats.alias_edges_preserved, 1);
        assert!(g.contains_edge(&EdgeKey::new(a.clone(), ALIAS_OF, b.clone())));
        assert!(!g.contains_edge(&EdgeKey::new(b.clone(), "also_known_as", b.clone())));
        assert_eq!(g.node(&a).unwrap().node_role(), Some("alias"));
    }

    #[test]
    fn community_members_are_renamed_and_deduplicated() {
        let mut g = KnowledgeGraph::new();
        let a = entity(&mut g, "Aspirin");
        let b = entity(&mut g, "ASA");
        let mut props = named("drugs");
        props.insert("members".into(), json!(["ASA", "Ibuprofen", "Aspirin"]));
        let community = g.upsert_node(NodeLabel::Community, props).unwrap();

        let stats = rewriter().apply_merges(&mut g, &mapping(&[(&b, &a)]));

        assert_eq!(stats.community_updates, 1);
        assert_eq!(g.node(&community).unwrap().members(), vec!["Aspirin", "Ibuprofen"]);
    }

    #[test]
    fn keyword_filter_rewrites_have_their_own_counter() {
        let mut g = KnowledgeGraph::new();
        let a = entity(&mut g, "A");
        let b = entity(&mut g, "B");
        let kw = g.upsert_node(NodeLabel::Keyword, named("kw")).unwrap();
        link(&mut g, &kw, "keyword_filter_by", &a);
        let stats = rewriter().apply_merges(&mut g, &mapping(&[(&a, &b)]));
        assert_eq!(stats.keyword_filter_updates, 1);
        assert_eq!(stats.edges_redirected, 0);
    }

    #[test]
    fn vanished_nodes_are_skipped() {
        let mut g = KnowledgeGraph::new();
        let a = entity(&mut g, "A");
        let ghost = NodeId::from("entity_404");
        let stats = rewriter().apply_merges(&mut g, &mapping(&[(&ghost, &a)]));
        assert_eq!(stats.skipped_references, 1);
        assert_eq!(g.node_count(), 1);
    }

    #[test]
    fn isolated_nodes_removed_when_configured() {
        let mut g = KnowledgeGraph::new();
        let a = entity(&mut g, "A");
        let b = entity(&mut g, "B");
        entity(&mut g, "lonely");
        link(&mut g, &a, "rel", &b);
        let stats = rewriter()
            .with_remove_isolated(true)
            .apply_merges(&mut g, &mapping(&[(&a, &b)]));
        assert_eq!(stats.isolated_removed, 1);
        assert!(g.find_by_name(NodeLabel::Entity, "lonely").is_none());
        // the alias node keeps its alias_of edge and survives
        assert!(g.contains_node(&a));
    }

    #[test]
    fn tail_merge_moves_only_the_scoped_edge() {
        let mut g = KnowledgeGraph::new();
        let hypoxia = entity(&mut g, "hypoxia");
        let other = entity(&mut g, "other");
        let fio2 = entity(&mut g, "increase FiO2");
        let fio2_b = entity(&mut g, "raise FiO2");
        link(&mut g, &hypoxia, "solution", &fio2);
        link(&mut g, &hypoxia, "solution", &fio2_b);
        link(&mut g, &other, "uses", &fio2_b);

        let edge_mapping: EdgeMapping = [EdgeMerge {
            head: hypoxia.clone(),
            relation: "solution".into(),
            duplicate_tail: fio2_b.clone(),
            canonical_tail: fio2.clone(),
            method: MergeMethod::Llm,
            confidence: 0.9,
            rationale: "same intervention".into(),
        }]
        .into_iter()
        .collect();

        let stats = rewriter().apply_edge_merges(&mut g, &edge_mapping);
        assert_eq!(stats.edges_redirected, 1);
        assert!(g.contains_edge(&EdgeKey::new(other, "uses", fio2_b.clone())));
        // still referenced elsewhere, but retained as an alias of the canonical
        let alias = g.node(&fio2_b).unwrap();
        assert!(alias.is_alias());
        assert_eq!(alias.alias_of(), Some(fio2.as_str()));
        assert!(g.contains_edge(&EdgeKey::new(fio2_b.clone(), ALIAS_OF, fio2.clone())));

        let again = rewriter().apply_edge_merges(&mut g, &edge_mapping);
        assert_eq!(again, RewriteStats::default());
    }

    #[test]
    fn isolated_tail_after_merge_becomes_alias() {
        let mut g = KnowledgeGraph::new();
        let film = entity(&mut g, "Star Wars");
        let lucas = entity(&mut g, "George Lucas");
        let g_lucas = entity(&mut g, "G. Lucas");
        link(&mut g, &film, "director", &lucas);
        link(&mut g, &film, "director", &g_lucas);

        let edge_mapping: EdgeMapping = [EdgeMerge {
            head: film.clone(),
            relation: "director".into(),
            duplicate_tail: g_lucas.clone(),
            canonical_tail: lucas.clone(),
            method: MergeMethod::Llm,
            confidence: 0.95,
            rationale: String::new(),
        }]
        .into_iter()
        .collect();
        let stats = rewriter().apply_edge_merges(&mut g, &edge_mapping);

        assert_eq!(stats.nodes_merged, 1);
        assert_eq!(g.out_degree(&film), 1);
        assert_eq!(g.node(&g_lucas).unwrap().alias_of(), Some(lucas.as_str()));
    }

    #[test]
    fn alias_edge_between_merged_tails_becomes_alias_of() {
        let mut g = KnowledgeGraph::new();
        let head = entity(&mut g, "H");
        let a = entity(&mut g, "A");
        let b = entity(&mut g, "B");
        link(&mut g, &head, "r", &a);
        link(&mut g, &head, "r", &b);
        link(&mut g, &a, "alias", &b);

        let edge_mapping: EdgeMapping = [EdgeMerge {
            head: head.clone(),
            relation: "r".into(),
            duplicate_tail: a.clone(),
            canonical_tail: b.clone(),
            method: MergeMethod::Llm,
            confidence: 0.9,
            rationale: String::new(),
        }]
        .into_iter()
        .collect();
        let stats = rewriter().apply_edge_merges(&mut g, &edge_mapping);

        assert_eq!(stats.alias_edges_preserved, 1);
        assert!(g.contains_edge(&EdgeKey::new(a.clone(), ALIAS_OF, b.clone())));
        assert!(!g.contains_edge(&EdgeKey::new(a.clone(), "alias", b.clone())));
        assert_eq!(g.node(&a).unwrap().node_role(), Some("alias"));
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn opposite_tail_merges_never_alias_each_other() {
        let mut g = KnowledgeGraph::new();
        let h1 = entity(&mut g, "H1");
        let h2 = entity(&mut g, "H2");
        let a = entity(&mut g, "A");
        let b = entity(&mut g, "B");
        for head in [&h1, &h2] {
            link(&mut g, head, "r", &a);
            link(&mut g, head, "r", &b);
        }
        let merge = |head: &NodeId, dup: &NodeId, canonical: &NodeId| EdgeMerge {
            head: head.clone(),
            relation: "r".into(),
            duplicate_tail: dup.clone(),
            canonical_tail: canonical.clone(),
            method: MergeMethod::Llm,
            confidence: 0.9,
            rationale: String::new(),
        };
        let edge_mapping: EdgeMapping = [merge(&h1, &a, &b), merge(&h2, &b, &a)].into_iter().collect();
        rewriter().apply_edge_merges(&mut g, &edge_mapping);

        let aliases = [&a, &b].iter().filter(|id| g.node(id).unwrap().is_alias()).count();
        assert_eq!(aliases, 1);
    }

    #[test]
    fn resolver_output_feeds_rewriter() {
        let mut g = KnowledgeGraph::new();
        let a = entity(&mut g, "A");
        let b = entity(&mut g, "B");
        let c = entity(&mut g, "C");
        link(&mut g, &b, "alias_of", &a);
        let mut resolver = MergeResolver::new(&g);
        resolver.add_decision(MergeDecision::new(b.clone(), c.clone(), MergeMethod::Llm, 0.9));
        resolver.fold_existing_aliases(&AliasRelations::default());
        let m = resolver.resolve();

        rewriter().apply_merges(&mut g, &m);
        let meta = g.node(&a).unwrap().properties["dedup_metadata"].as_array().unwrap();
        assert_eq!(meta[0]["method"], "existing_alias_transitive");
        assert!(g.contains_edge(&EdgeKey::new(a.clone(), ALIAS_OF, c.clone())));
    }
}
