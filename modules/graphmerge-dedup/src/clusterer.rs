//! Tentative clustering of scope candidates before the LLM dedup pass.
//!
//! Every candidate ends up in exactly one cluster. Singletons are frequent
//! and skip the dedup engine.

use std::collections::HashMap;

use ai_client::parse_lenient_json;
use serde_json::Value;
use tracing::{debug, warn};

use graphmerge_core::{ClusteringMethod, DedupError, DedupResult, LlmErrorKind, PromptKind, PromptRegistry};

use crate::candidates::DedupScope;
use crate::embedder::Embedder;
use crate::llm::{LlmDispatcher, LlmRequest};
use crate::similarity::Centroid;
use crate::stats::StageSummary;
use crate::store::{CallError, CallPurpose, ClusterRecord, ErrorRecord, IntermediateStore, LlmCallRecord};

/// Clusters of one scope plus the model calls that produced them.
#[derive(Debug, Clone, Default)]
pub struct Clustering {
    pub clusters: Vec<ClusterRecord>,
    pub llm_calls: Vec<LlmCallRecord>,
    pub errors: Vec<ErrorRecord>,
}

impl Clustering {
    pub fn singletons(len: usize) -> Self {
        Self {
            clusters: (0..len)
                .map(|i| ClusterRecord {
                    members: vec![i],
                    description: String::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn whole(len: usize) -> Self {
        Self {
            clusters: vec![ClusterRecord {
                members: (0..len).collect(),
                description: String::new(),
            }],
            ..Default::default()
        }
    }
}

/// Greedy centroid agglomeration in input order: each vector joins the first
/// cluster whose centroid clears `threshold`, else opens a new one. Missing
/// vectors become singletons.
pub fn cluster_by_embedding(vectors: &[Option<Vec<f32>>], threshold: f32) -> Vec<Vec<usize>> {
    let mut clusters: Vec<(Option<Centroid>, Vec<usize>)> = Vec::new();
    for (index, vector) in vectors.iter().enumerate() {
        let Some(vector) = vector else {
            clusters.push((None, vec![index]));
            continue;
        };
        let best = clusters
            .iter()
            .enumerate()
            .filter_map(|(ci, (centroid, _))| centroid.as_ref().map(|c| (ci, c.similarity(vector))))
            .filter(|(_, sim)| *sim >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
        match best {
            Some((ci, _)) => {
                let (centroid, members) = &mut clusters[ci];
                if let Some(c) = centroid.as_mut() {
                    c.add(vector);
                }
                members.push(index);
            }
            None => clusters.push((Some(Centroid::new(vector)), vec![index])),
        }
    }
    clusters.into_iter().map(|(_, members)| members).collect()
}

/// Parse a `{"clusters": [...]}` response over `len` candidates (1-based).
/// Out-of-range indices are ignored, an index claimed twice stays in its
/// first cluster, and unclaimed candidates become singletons.
pub fn parse_clusters(raw: &str, len: usize) -> DedupResult<Vec<ClusterRecord>> {
    let value = parse_lenient_json(raw).map_err(|e| DedupError::llm(LlmErrorKind::MalformedJson, e.to_string()))?;
    let Some(entries) = value.get("clusters").and_then(Value::as_array) else {
        return Err(DedupError::llm(LlmErrorKind::MalformedJson, "missing clusters array"));
    };

    let mut claimed = vec![false; len];
    let mut clusters = Vec::new();
    for entry in entries {
        let members: Vec<usize> = entry
            .get("members")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|v| v as usize)
                    .filter(|v| *v >= 1 && *v <= len)
                    .map(|v| v - 1)
                    .collect()
            })
            .unwrap_or_default();
        let members: Vec<usize> = members
            .into_iter()
            .filter(|m| !std::mem::replace(&mut claimed[*m], true))
            .collect();
        if members.is_empty() {
            continue;
        }
        clusters.push(ClusterRecord {
            members,
            description: entry
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    for (index, taken) in claimed.iter().enumerate() {
        if !taken {
            clusters.push(ClusterRecord {
                members: vec![index],
                description: String::new(),
            });
        }
    }
    Ok(clusters)
}

pub struct Clusterer<'a> {
    method: ClusteringMethod,
    threshold: f32,
    llm_batch_size: usize,
    registry: &'a PromptRegistry,
    dispatcher: &'a LlmDispatcher,
}

impl<'a> Clusterer<'a> {
    pub fn new(
        method: ClusteringMethod,
        threshold: f32,
        llm_batch_size: usize,
        registry: &'a PromptRegistry,
        dispatcher: &'a LlmDispatcher,
    ) -> Self {
        Self {
            method,
            threshold,
            llm_batch_size: llm_batch_size.max(1),
            registry,
            dispatcher,
        }
    }

    /// Cluster every scope. LLM clustering falls back to embedding
    /// clustering for any chunk whose call fails.
    pub async fn cluster_scopes(
        &self,
        stage: &str,
        scopes: &[DedupScope],
        embedder: &mut Embedder,
        store: &mut IntermediateStore,
        summary: &mut StageSummary,
    ) -> Vec<Clustering> {
        let mut results: Vec<Clustering> = scopes.iter().map(|_| Clustering::default()).collect();
        let mut needs_embedding: Vec<(usize, Vec<usize>)> = Vec::new();

        match self.method {
            ClusteringMethod::Embedding => {
                for (position, scope) in scopes.iter().enumerate() {
                    needs_embedding.push((position, (0..scope.candidates.len()).collect()));
                }
            }
            ClusteringMethod::Llm => {
                let fallbacks = self.cluster_with_llm(stage, scopes, &mut results, store, summary).await;
                summary.clustering_fallbacks += fallbacks.len();
                needs_embedding.extend(fallbacks);
            }
        }

        if !needs_embedding.is_empty() {
            self.embed_and_cluster(scopes, needs_embedding, embedder, &mut results).await;
        }
        for (scope, result) in scopes.iter().zip(results.iter_mut()) {
            result.clusters.sort_by_key(|c| c.members.first().copied().unwrap_or(usize::MAX));
            debug!(scope = %scope, clusters = result.clusters.len(), "Clustered scope");
        }
        results
    }

    /// Returns `(scope position, candidate indices)` chunks that need the
    /// embedding fallback.
    async fn cluster_with_llm(
        &self,
        stage: &str,
        scopes: &[DedupScope],
        results: &mut [Clustering],
        store: &mut IntermediateStore,
        summary: &mut StageSummary,
    ) -> Vec<(usize, Vec<usize>)> {
        let system = self.registry.template(PromptKind::System).to_string();
        let mut fallbacks = Vec::new();
        let mut requests = Vec::new();
        let mut pending: HashMap<String, (usize, Vec<usize>)> = HashMap::new();

        for (position, scope) in scopes.iter().enumerate() {
            let indices: Vec<usize> = (0..scope.candidates.len()).collect();
            for (chunk_index, chunk) in indices.chunks(self.llm_batch_size).enumerate() {
                let chunk = chunk.to_vec();
                if chunk.len() < 2 {
                    results[position].clusters.push(ClusterRecord {
                        members: chunk,
                        description: String::new(),
                    });
                    continue;
                }
                let lines = scope.candidate_lines(&chunk);
                let vars = HashMap::from([
                    ("head", scope.head.as_str()),
                    ("relation", scope.relation.as_str()),
                    ("candidates", lines.as_str()),
                ]);
                match self.registry.render(PromptKind::Clustering, &vars) {
                    Ok(user) => {
                        let id = format!("{stage}-cluster:{:05}:{chunk_index:04}:000", scope.index);
                        pending.insert(id.clone(), (position, chunk));
                        requests.push(LlmRequest::new(id, system.clone(), user));
                    }
                    Err(e) => {
                        warn!(scope = %scope, error = %e, "Failed to render clustering prompt");
                        fallbacks.push((position, chunk));
                    }
                }
            }
        }

        let prompts: HashMap<String, (String, String)> = requests
            .iter()
            .map(|r| (r.id.clone(), (r.system.clone(), r.user.clone())))
            .collect();
        summary.llm_calls += requests.len();
        for response in self.dispatcher.dispatch(requests).await {
            let Some((position, chunk)) = pending.remove(&response.id) else {
                continue;
            };
            let (system_prompt, user_prompt) = prompts.get(&response.id).cloned().unwrap_or_default();
            let scope = &scopes[position];
            let mut record = LlmCallRecord {
                request_id: response.id.clone(),
                purpose: CallPurpose::Clustering,
                cluster_id: 0,
                batch_indices: chunk.clone(),
                candidates: chunk.iter().map(|i| scope.candidates[*i].id.clone()).collect(),
                system_prompt,
                user_prompt,
                raw_response: None,
                parsed_groups: Vec::new(),
                error: None,
                attempt: 1,
            };

            let parsed = match response.outcome {
                Ok(raw) => {
                    store.record_response(
                        crate::llm::prompt_hash(&record.system_prompt, &record.user_prompt),
                        &response.id,
                        &raw,
                    );
                    record.raw_response = Some(raw.clone());
                    parse_clusters(&raw, chunk.len())
                }
                Err(e) => Err(e),
            };
            match parsed {
                Ok(clusters) => {
                    for cluster in clusters {
                        results[position].clusters.push(ClusterRecord {
                            members: cluster.members.iter().map(|m| chunk[*m]).collect(),
                            description: cluster.description,
                        });
                    }
                }
                Err(e) => {
                    summary.llm_failures += 1;
                    warn!(scope = %scope, request = %response.id, error = %e, "LLM clustering failed, using embeddings");
                    let error = CallError::from_error(&e);
                    results[position].errors.push(ErrorRecord::new(
                        Some(response.id.clone()),
                        error.kind.to_string(),
                        error.detail.clone(),
                    ));
                    record.error = Some(error);
                    fallbacks.push((position, chunk));
                }
            }
            results[position].llm_calls.push(record);
        }
        fallbacks
    }

    async fn embed_and_cluster(
        &self,
        scopes: &[DedupScope],
        work: Vec<(usize, Vec<usize>)>,
        embedder: &mut Embedder,
        results: &mut [Clustering],
    ) {
        let texts: Vec<String> = work
            .iter()
            .flat_map(|(position, indices)| {
                indices
                    .iter()
                    .map(move |i| scopes[*position].candidates[*i].embedding_text())
            })
            .collect();
        let vectors: Vec<Option<Vec<f32>>> = match embedder.embed_all(&texts).await {
            Ok(vectors) => vectors.into_iter().map(Some).collect(),
            Err(e) => {
                warn!(error = %e, "Embedding failed, every candidate becomes its own cluster");
                vec![None; texts.len()]
            }
        };

        let mut offset = 0;
        for (position, indices) in work {
            let slice = &vectors[offset..offset + indices.len()];
            offset += indices.len();
            for members in cluster_by_embedding(slice, self.threshold) {
                results[position].clusters.push(ClusterRecord {
                    members: members.iter().map(|m| indices[*m]).collect(),
                    description: String::new(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_clustering_is_order_stable() {
        let vectors = vec![
            Some(vec![1.0, 0.0]),
            Some(vec![0.0, 1.0]),
            Some(vec![0.95, 0.05]),
            None,
            Some(vec![0.05, 0.95]),
        ];
        let clusters = cluster_by_embedding(&vectors, 0.9);
        assert_eq!(clusters, vec![vec![0, 2], vec![1, 4], vec![3]]);
    }

    #[test]
    fn parse_clusters_repairs_coverage() {
        let raw = r#"{"clusters": [
            {"members": [1, 3, 9], "description": "Lucas variants"},
            {"members": [3, 2]}
        ]}"#;
        let clusters = parse_clusters(raw, 4).unwrap();
        let members: Vec<Vec<usize>> = clusters.iter().map(|c| c.members.clone()).collect();
        assert_eq!(members, vec![vec![0, 2], vec![1], vec![3]]);
        assert_eq!(clusters[0].description, "Lucas variants");
    }

    #[test]
    fn parse_clusters_requires_clusters_key() {
        let err = parse_clusters(r#"{"groups": []}"#, 2).unwrap_err();
        assert!(matches!(err, DedupError::Llm { kind: LlmErrorKind::MalformedJson, .. }));
    }
}
