//! Run driver: tail, keyword and head deduplication followed by event
//! discovery, with one intermediate store per run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ai_client::{ChatAgent, EmbedAgent};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use graphmerge_core::{DedupConfig, DedupError, DedupResult, PromptRegistry};
use graphmerge_graph::{
    explicit_canonical, tie_break, EdgeKey, EdgeMapping, EdgeMerge, EventDiscovery, GraphRewriter, KnowledgeGraph,
    MergeDecision, MergeMapping, MergeMethod, MergeResolver, NodeId, NodeLabel,
};

use crate::cancel::CancelFlag;
use crate::candidates::{head_scopes, keyword_scopes, tail_scopes, DedupScope, Stage};
use crate::clusterer::{Clusterer, Clustering};
use crate::embedder::{Embedder, EmbeddingCache};
use crate::engine::{DedupEngine, EngineSettings, ScopeOutcome};
use crate::llm::LlmDispatcher;
use crate::signals::{
    fuse, AliasSignal, AttributeSignal, FusedPair, SemanticSignal, Signal, SignalKind, SignalOutput, SubgraphSignal,
};
use crate::stats::{DedupSummary, StageSummary};
use crate::store::{ConfigSnapshot, DedupArtifact, ErrorRecord, IntermediateStore, ScopeRecord};

/// Outcome of a run: counters, the stage artifacts and the files written.
#[derive(Debug)]
pub struct RunReport {
    pub summary: DedupSummary,
    pub artifacts: Vec<DedupArtifact>,
    pub written: Vec<PathBuf>,
}

/// Per-run collaborators, owned by the driver for the duration of `run`.
struct RunState {
    dispatcher: LlmDispatcher,
    embedder: Embedder,
    store: IntermediateStore,
    rewriter: GraphRewriter,
    snapshot: ConfigSnapshot,
}

/// What a stage produced before it is turned into an artifact.
#[derive(Default)]
struct StageResult {
    summary: StageSummary,
    scopes: Vec<ScopeRecord>,
    final_merges: Vec<MergeDecision>,
    edge_merges: Vec<EdgeMerge>,
    errors: Vec<ErrorRecord>,
}

pub struct DedupDriver {
    config: DedupConfig,
    registry: PromptRegistry,
    chat: Arc<dyn ChatAgent>,
    embed: Arc<dyn EmbedAgent>,
    cancel: CancelFlag,
    run_id: String,
}

impl DedupDriver {
    /// Validates the configuration and prompt overrides before any work.
    pub fn new(config: DedupConfig, chat: Arc<dyn ChatAgent>, embed: Arc<dyn EmbedAgent>) -> DedupResult<Self> {
        config.validate()?;
        let registry = PromptRegistry::load(&config.prompts)?;
        Ok(Self {
            config,
            registry,
            chat,
            embed,
            cancel: CancelFlag::new(),
            run_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Deduplicate `graph` in place. Recoverable failures are counted in the
    /// summary; the intermediate store is flushed even when a stage is cut
    /// short by cancellation.
    pub async fn run(&self, graph: &mut KnowledgeGraph) -> DedupResult<RunReport> {
        let config = &self.config;
        info!(
            run_id = %self.run_id,
            dataset = %config.dataset,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            llm = self.chat.model(),
            embedding = self.embed.embedding_model(),
            "Starting dedup run"
        );

        let mut summary = DedupSummary {
            run_id: self.run_id.clone(),
            initial_nodes: graph.node_count(),
            initial_edges: graph.edge_count(),
            ..Default::default()
        };

        let mut state = self.prepare();

        let stages = [
            (Stage::Tail, config.semantic_dedup.enabled),
            (Stage::Keyword, config.keyword_dedup.enabled),
            (Stage::Head, config.head_dedup.enabled),
        ];
        for (stage, enabled) in stages {
            if !enabled {
                continue;
            }
            if self.cancel.is_cancelled() {
                warn!(stage = %stage, "Run cancelled, skipping remaining stages");
                summary.cancelled = true;
                break;
            }
            let result = match stage {
                Stage::Tail => self.tail_stage(graph, &mut state).await,
                Stage::Keyword => self.keyword_stage(graph, &mut state).await,
                Stage::Head => self.head_stage(graph, &mut state).await,
            };
            info!(
                stage = %stage,
                scopes = result.summary.scopes,
                merges = result.summary.merges,
                llm_calls = result.summary.llm_calls,
                failures = result.summary.llm_failures,
                "Stage complete"
            );
            summary.cancelled |= result.summary.cancelled;
            summary.stages.insert(stage.as_str().to_string(), result.summary.clone());
            self.record(stage, result, &mut state);
        }

        if config.events.enabled && !summary.cancelled {
            let (patterns, stats) = EventDiscovery::from_config(&config.events).discover(graph);
            info!(patterns = patterns.len(), events = stats.events, "Event discovery complete");
            summary.events = Some(stats);
        }

        if let Some(path) = &config.llm.embedding_cache_path {
            if let Err(e) = state.embedder.cache().save(path) {
                warn!(path = %path.display(), error = %e, "Failed to save embedding cache");
            }
        }

        let written = state.store.flush()?;
        summary.final_nodes = graph.node_count();
        summary.final_edges = graph.edge_count();
        info!("{summary}");

        Ok(RunReport {
            summary,
            artifacts: state.store.artifacts().to_vec(),
            written,
        })
    }

    fn prepare(&self) -> RunState {
        let config = &self.config;
        let timeout = Duration::from_secs(config.llm.timeout_secs);

        let cache = match &config.llm.embedding_cache_path {
            Some(path) => EmbeddingCache::load(path, &config.embedding_model).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Failed to load embedding cache, starting empty");
                EmbeddingCache::new(config.embedding_model.clone())
            }),
            None => EmbeddingCache::new(config.embedding_model.clone()),
        };

        RunState {
            dispatcher: LlmDispatcher::new(Arc::clone(&self.chat))
                .with_concurrency(config.llm.max_concurrency)
                .with_timeout(timeout)
                .with_cancel(self.cancel.clone()),
            embedder: Embedder::new(Arc::clone(&self.embed), cache)
                .with_batch_size(config.llm.embedding_batch_size)
                .with_concurrency(config.llm.max_concurrency)
                .with_timeout(timeout)
                .with_cancel(self.cancel.clone()),
            store: IntermediateStore::new(&config.output_dir, &config.dataset, &self.run_id)
                .with_enabled(config.semantic_dedup.save_intermediate_results)
                .with_model(self.chat.model()),
            rewriter: GraphRewriter::from_config(&config.graph),
            snapshot: ConfigSnapshot::from_config(config, self.chat.model(), &config.embedding_model),
        }
    }

    fn record(&self, stage: Stage, result: StageResult, state: &mut RunState) {
        let artifact = DedupArtifact {
            dedup_type: stage,
            run_id: self.run_id.clone(),
            dataset: self.config.dataset.clone(),
            sequence: state.store.next_sequence(),
            created_at: Utc::now(),
            config: state.snapshot.clone(),
            scopes: result.scopes,
            final_merges: result.final_merges,
            edge_merges: result.edge_merges,
            errors: result.errors,
            summary: result.summary,
        };
        state.store.record(artifact);
    }

    /// Cluster, then run the engine over every scope.
    async fn dedup_scopes(
        &self,
        stage: Stage,
        scopes: &[DedupScope],
        state: &mut RunState,
        summary: &mut StageSummary,
    ) -> Vec<ScopeOutcome> {
        let semantic = &self.config.semantic_dedup;
        let clusterer = Clusterer::new(
            semantic.clustering_method,
            semantic.threshold,
            semantic.llm_clustering_batch_size,
            &self.registry,
            &state.dispatcher,
        );
        let clusterings = clusterer
            .cluster_scopes(stage.as_str(), scopes, &mut state.embedder, &mut state.store, summary)
            .await;
        self.run_engine(stage, scopes, clusterings, state, summary).await
    }

    async fn run_engine(
        &self,
        stage: Stage,
        scopes: &[DedupScope],
        clusterings: Vec<Clustering>,
        state: &mut RunState,
        summary: &mut StageSummary,
    ) -> Vec<ScopeOutcome> {
        let engine = DedupEngine::new(
            &self.registry,
            &state.dispatcher,
            EngineSettings::from_config(&self.config.semantic_dedup),
        );
        engine.run(stage, scopes, clusterings, &mut state.store, summary).await
    }

    /// Tail merges are scoped to their `(head, relation)` edge; the duplicate
    /// tail stays in the graph as an alias of the canonical.
    async fn tail_stage(&self, graph: &mut KnowledgeGraph, state: &mut RunState) -> StageResult {
        let mut result = StageResult::default();
        let scopes = tail_scopes(graph, &self.config.semantic_dedup, &self.config.graph);
        let outcomes = self.dedup_scopes(Stage::Tail, &scopes, state, &mut result.summary).await;

        let mut edges = EdgeMapping::new();
        for mut outcome in outcomes {
            result.errors.append(&mut outcome.errors);
            let mapping = resolve(graph, outcome.decisions, None);
            outcome.record.final_merges = mapping.decisions().cloned().collect();

            if let Some(head) = outcome.record.scope.head_id.clone() {
                let relation = outcome.record.scope.relation.clone();
                for decision in mapping.decisions() {
                    let key = EdgeKey::new(head.clone(), relation.clone(), decision.duplicate.clone());
                    if !graph.contains_edge(&key) {
                        continue;
                    }
                    edges.insert(EdgeMerge {
                        head: head.clone(),
                        relation: relation.clone(),
                        duplicate_tail: decision.duplicate.clone(),
                        canonical_tail: decision.canonical.clone(),
                        method: decision.method,
                        confidence: decision.confidence,
                        rationale: decision.rationale.clone(),
                    });
                }
            }
            result.scopes.push(outcome.record);
        }

        result.summary.merges = edges.len();
        result.summary.rewrite = state.rewriter.apply_edge_merges(graph, &edges);
        result.edge_merges = edges.to_vec();
        result
    }

    async fn keyword_stage(&self, graph: &mut KnowledgeGraph, state: &mut RunState) -> StageResult {
        let mut result = StageResult::default();
        let scopes = keyword_scopes(graph, &self.config.semantic_dedup);
        let outcomes = self.dedup_scopes(Stage::Keyword, &scopes, state, &mut result.summary).await;
        self.apply_node_merges(graph, outcomes, Vec::new(), state, &mut result);
        result
    }

    /// Global entity dedup over fused candidate pairs. Pairs above the
    /// similarity threshold are either confirmed by the model per connected
    /// component or merged directly.
    async fn head_stage(&self, graph: &mut KnowledgeGraph, state: &mut RunState) -> StageResult {
        let mut result = StageResult::default();
        let head = &self.config.head_dedup;

        let fused = match self.fused_pairs(graph, state, &mut result).await {
            Ok(fused) => fused,
            Err(e) => {
                warn!(error = %e, "Head candidate generation failed, skipping stage");
                result.errors.push(ErrorRecord::new(None, "signals", e.to_string()));
                return result;
            }
        };
        let pairs: Vec<FusedPair> = fused
            .into_iter()
            .filter(|p| p.score >= head.similarity_threshold)
            .collect();
        info!(pairs = pairs.len(), threshold = head.similarity_threshold, "Head candidate pairs");

        if head.use_llm_validation {
            let components = connected_components(&pairs);
            let scopes = head_scopes(graph, &components, self.config.semantic_dedup.max_head_context);
            let clusterings = scopes.iter().map(|s| Clustering::whole(s.candidates.len())).collect();
            let outcomes = self
                .run_engine(Stage::Head, &scopes, clusterings, state, &mut result.summary)
                .await;
            self.apply_node_merges(graph, outcomes, Vec::new(), state, &mut result);
        } else {
            let view: &KnowledgeGraph = graph;
            let aliases = &self.config.graph.alias_relations;
            let direct = pairs
                .iter()
                .map(|pair| {
                    let canonical = explicit_canonical(view, aliases, &pair.a, &pair.b)
                        .unwrap_or_else(|| tie_break(view, &pair.a, &pair.b))
                        .clone();
                    let duplicate = if canonical == pair.a { pair.b.clone() } else { pair.a.clone() };
                    let rationale = pair
                        .signals
                        .iter()
                        .map(|(kind, score)| format!("{}={score:.3}", kind.as_str()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    MergeDecision::new(duplicate, canonical, MergeMethod::EmbeddingThreshold, pair.score)
                        .with_rationale(rationale)
                })
                .collect();
            self.apply_node_merges(graph, Vec::new(), direct, state, &mut result);
        }
        result
    }

    async fn fused_pairs(
        &self,
        graph: &KnowledgeGraph,
        state: &mut RunState,
        result: &mut StageResult,
    ) -> DedupResult<Vec<FusedPair>> {
        let head = &self.config.head_dedup;
        let ids: Vec<NodeId> = graph
            .nodes_with_label(NodeLabel::Entity)
            .filter(|n| !n.is_alias())
            .map(|n| n.id.clone())
            .collect();
        if ids.len() < 2 {
            return Ok(Vec::new());
        }

        let mut outputs = Vec::new();
        if head.enable_semantic_signal {
            let texts: Vec<String> = ids
                .iter()
                .filter_map(|id| graph.node(id))
                .map(|n| n.embedding_text())
                .collect();
            let signal = state.embedder.embed_all(&texts).await.map(|vectors| {
                let vectors: HashMap<NodeId, Vec<f32>> = ids.iter().cloned().zip(vectors).collect();
                SemanticSignal::new(vectors, head.semantic_threshold, head.max_semantic_candidates)
            });
            let output = match signal {
                Ok(signal) => signal.score_pairs(graph, &ids),
                Err(e) => Err(e),
            };
            outputs.push(SignalOutput {
                kind: SignalKind::Semantic,
                result: output,
            });
        }

        let mut signals: Vec<Box<dyn Signal>> = Vec::new();
        if head.enable_subgraph_signal {
            signals.push(Box::new(SubgraphSignal::new(head.subgraph_threshold, head.use_two_hop)));
        }
        if head.enable_alias_signal {
            signals.push(Box::new(AliasSignal::new(self.config.graph.alias_relations.clone())));
        }
        if head.enable_attribute_signal {
            signals.push(Box::new(AttributeSignal::new(head.attribute_threshold)));
        }
        for signal in signals {
            outputs.push(SignalOutput {
                kind: signal.kind(),
                result: signal.score_pairs(graph, &ids),
            });
        }

        for output in &outputs {
            if let Err(e) = &output.result {
                result.summary.signal_failures += 1;
                result
                    .errors
                    .push(ErrorRecord::new(None, format!("signal:{}", output.kind.as_str()), e.to_string()));
            }
        }
        if outputs.is_empty() {
            return Err(DedupError::Config("head_dedup has no enabled signal".into()));
        }
        fuse(outputs, &head.signal_weights)
    }

    /// Close keyword/head decisions into one mapping (folding explicit alias
    /// edges), rewrite the graph and attach the closed merges to each scope.
    fn apply_node_merges(
        &self,
        graph: &mut KnowledgeGraph,
        outcomes: Vec<ScopeOutcome>,
        extra: Vec<MergeDecision>,
        state: &mut RunState,
        result: &mut StageResult,
    ) {
        let mut decisions = extra;
        let mut records = Vec::with_capacity(outcomes.len());
        for mut outcome in outcomes {
            result.errors.append(&mut outcome.errors);
            decisions.extend(outcome.decisions);
            records.push(outcome.record);
        }

        let mapping = resolve(graph, decisions, Some(&state.rewriter));
        for record in &mut records {
            let members: BTreeSet<&NodeId> = record.scope.candidates.iter().map(|c| &c.id).collect();
            record.final_merges = mapping
                .decisions()
                .filter(|d| members.contains(&&d.duplicate))
                .cloned()
                .collect();
        }

        result.summary.merges = mapping.len();
        result.summary.rewrite = state.rewriter.apply_merges(graph, &mapping);
        result.final_merges = mapping.decisions().cloned().collect();
        result.scopes = records;
    }
}

fn resolve(graph: &KnowledgeGraph, decisions: Vec<MergeDecision>, aliases: Option<&GraphRewriter>) -> MergeMapping {
    let mut resolver = MergeResolver::new(graph);
    resolver.add_decisions(decisions);
    if let Some(rewriter) = aliases {
        resolver.fold_existing_aliases(rewriter.aliases());
    }
    resolver.resolve()
}

/// Connected components of the pair graph, each sorted, in order of their
/// smallest id.
fn connected_components(pairs: &[FusedPair]) -> Vec<Vec<NodeId>> {
    let mut adjacency: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
    for pair in pairs {
        adjacency.entry(&pair.a).or_default().push(&pair.b);
        adjacency.entry(&pair.b).or_default().push(&pair.a);
    }

    let mut seen: BTreeSet<&NodeId> = BTreeSet::new();
    let mut components = Vec::new();
    for start in adjacency.keys() {
        if !seen.insert(*start) {
            continue;
        }
        let mut component = vec![(*start).clone()];
        let mut stack = vec![*start];
        while let Some(node) = stack.pop() {
            for next in adjacency.get(node).into_iter().flatten() {
                if seen.insert(*next) {
                    component.push((*next).clone());
                    stack.push(*next);
                }
            }
        }
        component.sort();
        components.push(component);
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(a: &str, b: &str) -> FusedPair {
        FusedPair {
            a: NodeId::from(a),
            b: NodeId::from(b),
            score: 0.9,
            signals: BTreeMap::new(),
        }
    }

    #[test]
    fn components_follow_pair_chains() {
        let components = connected_components(&[pair("e3", "e7"), pair("e1", "e2"), pair("e2", "e5")]);
        let ids = |v: &[&str]| v.iter().map(|s| NodeId::from(*s)).collect::<Vec<_>>();
        assert_eq!(components, vec![ids(&["e1", "e2", "e5"]), ids(&["e3", "e7"])]);
    }
}
