//! Rebuild a deduplicated graph from recorded decisions, without the model.

use std::path::Path;

use ai_client::{AiError, ChatAgent, Message, MessageRole};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use graphmerge_core::{DedupResult, GraphConfig};
use graphmerge_graph::{
    EdgeMapping, EventDiscovery, GraphRewriter, KnowledgeGraph, MergeDecision, MergeMethod, MergeResolver, NodeId,
    NodeLabel, RewriteStats,
};

use crate::llm::{prompt_hash, CACHE_MISS};
use crate::store::{load_sidecar, read_json, DedupArtifact, ResponseSidecar};

/// Externally prepared clusters. The last member of each cluster is its
/// representative; members are node ids or names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupResultsFile {
    pub clusters: Vec<ExternalCluster>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalCluster {
    pub members: Vec<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl DedupResultsFile {
    pub fn load(path: &Path) -> DedupResult<Self> {
        read_json(path, "dedup results")
    }
}

pub struct ReplayEngine {
    rewriter: GraphRewriter,
}

impl ReplayEngine {
    pub fn new(rewriter: GraphRewriter) -> Self {
        Self { rewriter }
    }

    pub fn from_config(config: &GraphConfig) -> Self {
        Self::new(GraphRewriter::from_config(config))
    }

    /// Apply artifacts in stage order. References to nodes or edges the
    /// graph no longer has are skipped by the rewriter. After the last
    /// artifact of a run, event discovery is re-applied if that run used it.
    pub fn replay_artifacts(&self, graph: &mut KnowledgeGraph, artifacts: &[DedupArtifact]) -> RewriteStats {
        let mut ordered: Vec<&DedupArtifact> = artifacts.iter().collect();
        ordered.sort_by(|a, b| (a.run_id.as_str(), a.sequence).cmp(&(b.run_id.as_str(), b.sequence)));

        let mut total = RewriteStats::default();
        for (position, artifact) in ordered.iter().enumerate() {
            if !artifact.edge_merges.is_empty() {
                let mapping: EdgeMapping = artifact.edge_merges.iter().cloned().collect();
                let stats = self.rewriter.apply_edge_merges(graph, &mapping);
                info!(stage = %artifact.dedup_type, sequence = artifact.sequence, %stats, "Replayed edge merges");
                total.absorb(&stats);
            }
            if !artifact.final_merges.is_empty() {
                let stats = self.apply_decisions(graph, artifact.final_merges.iter().cloned());
                info!(stage = %artifact.dedup_type, sequence = artifact.sequence, %stats, "Replayed node merges");
                total.absorb(&stats);
            }
            let last_of_run = ordered
                .get(position + 1)
                .map_or(true, |next| next.run_id != artifact.run_id);
            if last_of_run {
                let run: Vec<&DedupArtifact> =
                    ordered.iter().filter(|a| a.run_id == artifact.run_id).copied().collect();
                replay_events(graph, &run);
            }
        }
        total
    }

    pub fn replay_dedup_results(&self, graph: &mut KnowledgeGraph, results: &DedupResultsFile) -> RewriteStats {
        let mut decisions = Vec::new();
        for (position, cluster) in results.clusters.iter().enumerate() {
            let members: Vec<NodeId> = cluster
                .members
                .iter()
                .filter_map(|member| {
                    let found = resolve_member(graph, member);
                    if found.is_none() {
                        warn!(cluster = position, member = %member, "Unknown member, skipping");
                    }
                    found
                })
                .collect();
            let Some((representative, rest)) = members.split_last() else {
                continue;
            };
            let rationale = cluster
                .rationale
                .clone()
                .unwrap_or_else(|| format!("external cluster {}", position + 1));
            for member in rest.iter().filter(|m| *m != representative) {
                decisions.push(
                    MergeDecision::new(member.clone(), representative.clone(), MergeMethod::External, 1.0)
                        .with_rationale(rationale.clone()),
                );
            }
        }
        let stats = self.apply_decisions(graph, decisions);
        info!(clusters = results.clusters.len(), %stats, "Replayed external dedup results");
        stats
    }

    fn apply_decisions(&self, graph: &mut KnowledgeGraph, decisions: impl IntoIterator<Item = MergeDecision>) -> RewriteStats {
        let mapping = {
            let mut resolver = MergeResolver::new(graph);
            resolver.add_decisions(decisions);
            resolver.resolve()
        };
        self.rewriter.apply_merges(graph, &mapping)
    }
}

/// Event discovery ran after every stage of an uncancelled run.
fn replay_events(graph: &mut KnowledgeGraph, run: &[&DedupArtifact]) {
    let Some(events) = run.iter().rev().find_map(|a| a.config.events.as_ref()) else {
        return;
    };
    if run.iter().any(|a| a.summary.cancelled) {
        info!(run_id = %run[0].run_id, "Run was cancelled before event discovery, skipping");
        return;
    }
    let (patterns, stats) = EventDiscovery::from_config(events).discover(graph);
    info!(run_id = %run[0].run_id, patterns = patterns.len(), events = stats.events, "Replayed event discovery");
}

fn resolve_member(graph: &KnowledgeGraph, member: &str) -> Option<NodeId> {
    let id = NodeId::new(member);
    if graph.contains_node(&id) {
        return Some(id);
    }
    [NodeLabel::Entity, NodeLabel::Keyword, NodeLabel::Attribute]
        .into_iter()
        .find_map(|label| graph.find_by_name(label, member).cloned())
        .or_else(|| graph.find_by_normalized_name(member, &[NodeLabel::Entity, NodeLabel::Keyword, NodeLabel::Attribute]))
}

/// Chat agent that answers from a recorded response sidecar. Lookups are
/// keyed by the hash of the system and user prompt.
pub struct CachedChat {
    sidecar: ResponseSidecar,
}

impl CachedChat {
    pub fn new(sidecar: ResponseSidecar) -> Self {
        Self { sidecar }
    }

    pub fn from_path(path: &Path) -> DedupResult<Self> {
        let sidecar = load_sidecar(path)?;
        info!(path = %path.display(), responses = sidecar.responses.len(), "Loaded cached LLM responses");
        Ok(Self::new(sidecar))
    }

    pub fn len(&self) -> usize {
        self.sidecar.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sidecar.responses.is_empty()
    }
}

#[async_trait]
impl ChatAgent for CachedChat {
    fn model(&self) -> &str {
        &self.sidecar.model
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, AiError> {
        let content = |role: MessageRole| {
            messages
                .iter()
                .filter(|m| m.role == role)
                .map(|m| m.content.as_str())
                .last()
                .unwrap_or_default()
        };
        let hash = prompt_hash(content(MessageRole::System), content(MessageRole::User));
        match self.sidecar.responses.get(&hash) {
            Some(entry) => Ok(entry.raw_response.clone()),
            None => Err(AiError::EmptyResponse(format!("{CACHE_MISS}: {hash}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::store::SidecarEntry;
    use crate::testing::graph_from_triples;
    use graphmerge_core::AliasRelations;

    #[tokio::test]
    async fn cached_chat_serves_recorded_responses() {
        let hash = prompt_hash("sys", "user");
        let sidecar = ResponseSidecar {
            run_id: "r".into(),
            model: "gpt-test".into(),
            responses: BTreeMap::from([(
                hash,
                SidecarEntry {
                    request_id: "edge:00000:0000:000".into(),
                    raw_response: "{\"groups\": []}".into(),
                },
            )]),
        };
        let chat = CachedChat::new(sidecar);
        assert_eq!(chat.model(), "gpt-test");
        assert_eq!(chat.chat_completion("sys", "user").await.unwrap(), "{\"groups\": []}");

        let miss = chat.chat_completion("sys", "other").await.unwrap_err();
        assert!(matches!(miss, AiError::EmptyResponse(ref m) if m.starts_with(CACHE_MISS)));
    }

    #[test]
    fn dedup_results_use_last_member_as_representative() {
        let mut graph = graph_from_triples(&[
            ("Star Wars", "director", "G. Lucas"),
            ("Star Wars", "director", "George Lucas"),
            ("American Graffiti", "director", "George Lucas"),
        ]);
        let results: DedupResultsFile = serde_json::from_str(
            r#"{"clusters": [{"members": ["G. Lucas", "Nobody", "George Lucas"]}]}"#,
        )
        .unwrap();
        let engine = ReplayEngine::new(GraphRewriter::new(AliasRelations::default()));
        let stats = engine.replay_dedup_results(&mut graph, &results);
        assert_eq!(stats.nodes_merged, 1);

        let star_wars = graph.find_by_name(NodeLabel::Entity, "Star Wars").cloned().unwrap();
        assert_eq!(graph.out_degree(&star_wars), 1);
    }
}
