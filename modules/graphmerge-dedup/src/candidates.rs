//! Candidate scopes for the LLM stages.
//!
//! A scope is the unit the dedup engine works on: the tails sharing one
//! `(head, relation)` pair, the members of one community, or one connected
//! component of fused head-dedup pairs. Candidates inside a scope are in a
//! stable `(name, id)` order, which fixes every downstream index.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use graphmerge_core::{GraphConfig, PromptKind, SemanticDedupConfig};
use graphmerge_graph::{KnowledgeGraph, Node, NodeId, NodeLabel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Tails of one `(head, relation)` pair; merges are edge-scoped.
    #[serde(rename = "edge")]
    Tail,
    Keyword,
    Head,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Tail => "edge",
            Stage::Keyword => "keyword",
            Stage::Head => "head",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: NodeId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub label: NodeLabel,
    /// Extra prompt context (community membership, neighbourhood).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
}

impl Candidate {
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name().to_string(),
            description: node.description().to_string(),
            label: node.label,
            context: String::new(),
        }
    }

    pub fn embedding_text(&self) -> String {
        if self.description.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.description)
        }
    }

    /// One prompt line with a 1-based index.
    pub fn prompt_line(&self, index: usize) -> String {
        let mut line = format!("[{index}] {}", self.name);
        if !self.description.is_empty() {
            line.push_str(" - ");
            line.push_str(&self.description);
        }
        if !self.context.is_empty() {
            line.push_str(&format!(" ({})", self.context));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupScope {
    pub index: usize,
    pub stage: Stage,
    /// Head node for tail scopes; the community node for keyword scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_id: Option<NodeId>,
    pub head: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub head_context: String,
    #[serde(skip)]
    pub prompt: Option<PromptKind>,
    pub candidates: Vec<Candidate>,
    /// Candidates dropped by the `max_candidates` cap.
    #[serde(default)]
    pub truncated: usize,
}

impl DedupScope {
    pub fn prompt_kind(&self) -> PromptKind {
        self.prompt.unwrap_or(match self.stage {
            Stage::Tail => PromptKind::TailGeneral,
            Stage::Keyword => PromptKind::Keyword,
            Stage::Head => PromptKind::Head,
        })
    }

    pub fn candidate_lines(&self, indices: &[usize]) -> String {
        indices
            .iter()
            .enumerate()
            .filter_map(|(pos, &i)| self.candidates.get(i).map(|c| c.prompt_line(pos + 1)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for DedupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Stage::Tail => write!(f, "{} --{}-->", self.head, self.relation),
            Stage::Keyword => write!(f, "community {}", self.head),
            Stage::Head => write!(f, "head component {}", self.index),
        }
    }
}

fn sort_and_cap(candidates: &mut Vec<Candidate>, max: usize) -> usize {
    candidates.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    candidates.dedup_by(|a, b| a.id == b.id);
    if candidates.len() > max {
        let dropped = candidates.len() - max;
        candidates.truncate(max);
        dropped
    } else {
        0
    }
}

/// Entity name -> names of the communities listing it.
fn community_index(graph: &KnowledgeGraph) -> BTreeMap<String, Vec<String>> {
    let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for community in graph.nodes_with_label(NodeLabel::Community) {
        for member in community.members() {
            index.entry(member).or_default().push(community.name().to_string());
        }
    }
    index
}

/// Head description plus up to `limit` summaries of the head's other edges.
fn head_context(graph: &KnowledgeGraph, head: &Node, skip_relation: &str, limit: usize) -> String {
    let mut lines = Vec::new();
    if !head.description().is_empty() {
        lines.push(format!("{}: {}", head.name(), head.description()));
    }
    let summaries = graph
        .out_edges(&head.id)
        .into_iter()
        .filter(|k| k.relation != skip_relation)
        .filter_map(|k| graph.node(&k.target).map(|t| format!("- {} → {}", k.relation, t.name())))
        .chain(
            graph
                .in_edges(&head.id)
                .into_iter()
                .filter_map(|k| graph.node(&k.source).map(|s| format!("- {} ← {}", k.relation, s.name()))),
        )
        .take(limit);
    lines.extend(summaries);
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

/// One scope per `(head, relation)` with at least two non-alias tails.
/// Alias relations and the keyword filter relation never form scopes.
pub fn tail_scopes(
    graph: &KnowledgeGraph,
    semantic: &SemanticDedupConfig,
    graph_config: &GraphConfig,
) -> Vec<DedupScope> {
    let communities = community_index(graph);
    let mut scopes = Vec::new();

    for head in graph.nodes() {
        let mut by_relation: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for key in graph.out_edges(&head.id) {
            if graph_config.alias_relations.is_alias(&key.relation)
                || key.relation == graph_config.keyword_filter_relation
            {
                continue;
            }
            let Some(tail) = graph.node(&key.target) else {
                continue;
            };
            if tail.is_alias() || tail.label == NodeLabel::Community || tail.id == head.id {
                continue;
            }
            let mut candidate = Candidate::from_node(tail);
            if let Some(names) = communities.get(tail.name()) {
                candidate.context = format!("community: {}", names.join(", "));
            }
            by_relation.entry(key.relation.clone()).or_default().push(candidate);
        }

        for (relation, mut candidates) in by_relation {
            if candidates.len() < 2 {
                continue;
            }
            let truncated = sort_and_cap(&mut candidates, semantic.max_candidates);
            if truncated > 0 {
                warn!(
                    head = head.name(),
                    relation = relation.as_str(),
                    kept = candidates.len(),
                    dropped = truncated,
                    "Tail scope exceeds max_candidates, truncating"
                );
            }
            let all_attributes = candidates.iter().all(|c| c.label == NodeLabel::Attribute);
            scopes.push(DedupScope {
                index: scopes.len(),
                stage: Stage::Tail,
                head_id: Some(head.id.clone()),
                head: head.name().to_string(),
                head_context: head_context(graph, head, &relation, semantic.max_head_context),
                relation,
                prompt: Some(if all_attributes {
                    PromptKind::TailAttribute
                } else {
                    PromptKind::TailGeneral
                }),
                candidates,
                truncated,
            });
        }
    }
    scopes
}

/// Resolve a community member name to a node: exact name per label first,
/// then normalised name.
fn resolve_member(graph: &KnowledgeGraph, name: &str) -> Option<NodeId> {
    const PRIORITY: [NodeLabel; 3] = [NodeLabel::Keyword, NodeLabel::Entity, NodeLabel::Attribute];
    PRIORITY
        .iter()
        .find_map(|label| graph.find_by_name(*label, name).cloned())
        .or_else(|| graph.find_by_normalized_name(name, &PRIORITY))
}

/// One scope per community with at least two resolvable, non-alias members.
pub fn keyword_scopes(graph: &KnowledgeGraph, semantic: &SemanticDedupConfig) -> Vec<DedupScope> {
    let mut scopes = Vec::new();
    for community in graph.nodes_with_label(NodeLabel::Community) {
        let mut seen = BTreeSet::new();
        let mut candidates: Vec<Candidate> = community
            .members()
            .iter()
            .filter_map(|name| resolve_member(graph, name))
            .filter(|id| seen.insert(id.clone()))
            .filter_map(|id| graph.node(&id))
            .filter(|node| !node.is_alias())
            .map(Candidate::from_node)
            .collect();
        if candidates.len() < 2 {
            continue;
        }
        let truncated = sort_and_cap(&mut candidates, semantic.max_candidates);
        if truncated > 0 {
            warn!(community = community.name(), dropped = truncated, "Community exceeds max_candidates, truncating");
        }
        let context = if community.description().is_empty() {
            "(none)".to_string()
        } else {
            community.description().to_string()
        };
        scopes.push(DedupScope {
            index: scopes.len(),
            stage: Stage::Keyword,
            head_id: Some(community.id.clone()),
            head: community.name().to_string(),
            relation: String::new(),
            head_context: context,
            prompt: Some(PromptKind::Keyword),
            candidates,
            truncated,
        });
    }
    scopes
}

/// Neighbourhood summary used as candidate context in head scopes.
pub fn neighbourhood(graph: &KnowledgeGraph, id: &NodeId, limit: usize) -> String {
    graph
        .out_edges(id)
        .into_iter()
        .filter_map(|k| graph.node(&k.target).map(|t| format!("{} → {}", k.relation, t.name())))
        .chain(
            graph
                .in_edges(id)
                .into_iter()
                .filter_map(|k| graph.node(&k.source).map(|s| format!("{} ← {}", k.relation, s.name()))),
        )
        .take(limit)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Head scopes from pre-computed components of candidate node ids.
pub fn head_scopes(graph: &KnowledgeGraph, components: &[Vec<NodeId>], max_context: usize) -> Vec<DedupScope> {
    components
        .iter()
        .filter(|component| component.len() >= 2)
        .enumerate()
        .map(|(index, component)| {
            let mut candidates: Vec<Candidate> = component
                .iter()
                .filter_map(|id| graph.node(id))
                .map(|node| {
                    let mut candidate = Candidate::from_node(node);
                    candidate.context = neighbourhood(graph, &node.id, max_context);
                    candidate
                })
                .collect();
            sort_and_cap(&mut candidates, usize::MAX);
            DedupScope {
                index,
                stage: Stage::Head,
                head_id: None,
                head: format!("candidate duplicate entities #{}", index + 1),
                relation: String::new(),
                head_context: "Entities drawn from the whole graph.".to_string(),
                prompt: Some(PromptKind::Head),
                candidates,
                truncated: 0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::graph_from_triples;
    use graphmerge_graph::parse_graph;

    fn lucas_graph() -> KnowledgeGraph {
        graph_from_triples(&[
            ("Star Wars", "director", "George Lucas"),
            ("Star Wars", "director", "G. Lucas"),
            ("Star Wars", "director", "George W. Lucas Jr."),
            ("Star Wars", "director", "J.J. Abrams"),
            ("Star Wars", "released_in", "1977"),
        ])
    }

    #[test]
    fn tail_candidates_are_sorted_by_name() {
        let g = lucas_graph();
        let scopes = tail_scopes(&g, &SemanticDedupConfig::default(), &GraphConfig::default());
        assert_eq!(scopes.len(), 1);
        let names: Vec<&str> = scopes[0].candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["G. Lucas", "George Lucas", "George W. Lucas Jr.", "J.J. Abrams"]);
        assert_eq!(scopes[0].relation, "director");
        assert!(scopes[0].head_context.contains("released_in → 1977"));
    }

    #[test]
    fn alias_relations_never_form_scopes() {
        let g = graph_from_triples(&[("A", "alias_of", "B"), ("A", "alias_of", "C")]);
        assert!(tail_scopes(&g, &SemanticDedupConfig::default(), &GraphConfig::default()).is_empty());
    }

    #[test]
    fn oversized_scopes_are_truncated_in_stable_order() {
        let g = lucas_graph();
        let config = SemanticDedupConfig {
            max_candidates: 2,
            ..Default::default()
        };
        let scopes = tail_scopes(&g, &config, &GraphConfig::default());
        assert_eq!(scopes[0].candidates.len(), 2);
        assert_eq!(scopes[0].truncated, 2);
        assert_eq!(scopes[0].candidates[1].name, "George Lucas");
    }

    #[test]
    fn attribute_tails_use_attribute_prompt() {
        let g = parse_graph(
            r#"[
            {"start_node": {"label": "entity", "properties": {"name": "Everest"}}, "relation": "height",
             "end_node": {"label": "attribute", "properties": {"name": "8848 m"}}},
            {"start_node": {"label": "entity", "properties": {"name": "Everest"}}, "relation": "height",
             "end_node": {"label": "attribute", "properties": {"name": "8,848 metres"}}}
        ]"#,
        )
        .unwrap();
        let scopes = tail_scopes(&g, &SemanticDedupConfig::default(), &GraphConfig::default());
        assert_eq!(scopes[0].prompt_kind(), PromptKind::TailAttribute);
    }

    #[test]
    fn keyword_scopes_follow_community_members() {
        let g = parse_graph(
            r#"[
            {"start_node": {"label": "keyword", "properties": {"name": "ASA"}}, "relation": "keyword_filter_by",
             "end_node": {"label": "entity", "properties": {"name": "Aspirin"}}},
            {"start_node": {"label": "entity", "properties": {"name": "acetylsalicylic acid"}}, "relation": "treats",
             "end_node": {"label": "entity", "properties": {"name": "pain"}}},
            {"start_node": {"label": "community", "properties": {"name": "analgesics",
              "members": ["Aspirin", "ASA", "acetylsalicylic acid", "unknown"]}}, "relation": null}
        ]"#,
        )
        .unwrap();
        let scopes = keyword_scopes(&g, &SemanticDedupConfig::default());
        assert_eq!(scopes.len(), 1);
        let names: Vec<&str> = scopes[0].candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ASA", "Aspirin", "acetylsalicylic acid"]);
        assert_eq!(scopes[0].candidates[0].label, NodeLabel::Keyword);
    }

    #[test]
    fn prompt_lines_are_one_based() {
        let g = lucas_graph();
        let scope = &tail_scopes(&g, &SemanticDedupConfig::default(), &GraphConfig::default())[0];
        let lines = scope.candidate_lines(&[1, 3]);
        assert_eq!(lines, "[1] George Lucas\n[2] J.J. Abrams");
    }
}
