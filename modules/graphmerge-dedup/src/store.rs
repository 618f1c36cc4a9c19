//! Intermediate artifacts: everything needed to audit or replay a run.
//!
//! The driver owns one [`IntermediateStore`] per run. Stage artifacts and raw
//! model responses are appended to it and written once, at the end of the
//! run, including runs that failed part-way or were cancelled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use graphmerge_core::{DedupConfig, DedupError, DedupResult, EventsConfig, LlmErrorKind};
use graphmerge_graph::{EdgeMerge, MergeDecision, NodeId};

use crate::candidates::{DedupScope, Stage};
use crate::engine::Group;
use crate::stats::StageSummary;
use crate::validator::Inconsistency;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub threshold: f32,
    pub max_batch_size: usize,
    pub clustering_method: String,
    pub enable_clustering_validation: bool,
    pub llm_model: String,
    pub embedding_model: String,
    #[serde(default)]
    pub head_similarity_threshold: f32,
    /// Event discovery settings, present when the run applied it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<EventsConfig>,
}

impl ConfigSnapshot {
    pub fn from_config(config: &DedupConfig, llm_model: &str, embedding_model: &str) -> Self {
        Self {
            threshold: config.semantic_dedup.threshold,
            max_batch_size: config.semantic_dedup.max_batch_size,
            clustering_method: config.semantic_dedup.clustering_method.as_str().to_string(),
            enable_clustering_validation: config.semantic_dedup.enable_clustering_validation,
            llm_model: llm_model.to_string(),
            embedding_model: embedding_model.to_string(),
            head_similarity_threshold: config.head_dedup.similarity_threshold,
            events: config.events.enabled.then(|| config.events.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Clustering,
    Dedup,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub kind: LlmErrorKind,
    pub detail: String,
}

impl CallError {
    pub fn from_error(error: &DedupError) -> Self {
        match error {
            DedupError::Llm { kind, detail } => Self {
                kind: *kind,
                detail: detail.clone(),
            },
            other => Self {
                kind: LlmErrorKind::Network,
                detail: other.to_string(),
            },
        }
    }
}

/// One exchange with the chat model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub request_id: String,
    pub purpose: CallPurpose,
    pub cluster_id: usize,
    /// Scope candidate indices in prompt order.
    pub batch_indices: Vec<usize>,
    pub candidates: Vec<NodeId>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: Option<String>,
    /// Groups over `batch_indices` positions (0-based).
    #[serde(default)]
    pub parsed_groups: Vec<Group>,
    pub error: Option<CallError>,
    pub attempt: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Scope candidate indices (0-based).
    pub members: Vec<usize>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub request_id: String,
    pub inconsistencies: Vec<Inconsistency>,
    pub corrections_applied: usize,
    pub integrity_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub scope: DedupScope,
    pub clusters: Vec<ClusterRecord>,
    pub llm_calls: Vec<LlmCallRecord>,
    /// Reconciled groups over scope candidate indices (0-based).
    pub llm_groups: Vec<Group>,
    pub validations: Vec<ValidationRecord>,
    pub final_merges: Vec<MergeDecision>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub kind: String,
    pub detail: String,
}

impl ErrorRecord {
    pub fn new(request_id: Option<String>, kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            request_id,
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupArtifact {
    pub dedup_type: Stage,
    pub run_id: String,
    pub dataset: String,
    /// Position of this stage within the run; replay applies artifacts in this order.
    pub sequence: u32,
    pub created_at: DateTime<Utc>,
    pub config: ConfigSnapshot,
    pub scopes: Vec<ScopeRecord>,
    /// Closed node-level merges (keyword and head stages).
    #[serde(default)]
    pub final_merges: Vec<MergeDecision>,
    /// Edge-scoped tail merges (edge stage).
    #[serde(default)]
    pub edge_merges: Vec<EdgeMerge>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub summary: StageSummary,
}

impl DedupArtifact {
    pub fn file_name(&self, stamp: &str) -> String {
        let infix = match self.dedup_type {
            Stage::Keyword => "dedup",
            Stage::Head => "head_dedup",
            Stage::Tail => "edge_dedup",
        };
        format!("{}_{infix}_{stamp}.json", self.dataset)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarEntry {
    pub request_id: String,
    pub raw_response: String,
}

/// Raw model responses keyed by prompt hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSidecar {
    pub run_id: String,
    pub model: String,
    pub responses: BTreeMap<String, SidecarEntry>,
}

pub struct IntermediateStore {
    output_dir: PathBuf,
    dataset: String,
    run_id: String,
    stamp: String,
    enabled: bool,
    artifacts: Vec<DedupArtifact>,
    sidecar: ResponseSidecar,
}

impl IntermediateStore {
    pub fn new(output_dir: impl Into<PathBuf>, dataset: impl Into<String>, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            output_dir: output_dir.into(),
            dataset: dataset.into(),
            stamp: file_stamp(&run_id),
            sidecar: ResponseSidecar {
                run_id: run_id.clone(),
                ..Default::default()
            },
            run_id,
            enabled: true,
            artifacts: Vec::new(),
        }
    }

    /// A disabled store still buffers artifacts but never writes them.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.sidecar.model = model.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn next_sequence(&self) -> u32 {
        self.artifacts.len() as u32
    }

    pub fn record(&mut self, artifact: DedupArtifact) {
        self.artifacts.push(artifact);
    }

    pub fn record_response(&mut self, prompt_hash: String, request_id: &str, raw_response: &str) {
        self.sidecar.responses.entry(prompt_hash).or_insert_with(|| SidecarEntry {
            request_id: request_id.to_string(),
            raw_response: raw_response.to_string(),
        });
    }

    pub fn artifacts(&self) -> &[DedupArtifact] {
        &self.artifacts
    }

    pub fn sidecar(&self) -> &ResponseSidecar {
        &self.sidecar
    }

    /// Write every buffered artifact plus the response sidecar.
    pub fn flush(&self) -> DedupResult<Vec<PathBuf>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(&self.output_dir)?;

        let mut written = Vec::new();
        for artifact in &self.artifacts {
            let path = self.output_dir.join(artifact.file_name(&self.stamp));
            write_json(&path, artifact)?;
            info!(
                path = %path.display(),
                dedup_type = %artifact.dedup_type,
                scopes = artifact.scopes.len(),
                "Wrote dedup artifact"
            );
            written.push(path);
        }

        let path = self
            .output_dir
            .join(format!("{}_semantic_results_{}.json", self.dataset, self.stamp));
        write_json(&path, &self.sidecar)?;
        info!(path = %path.display(), responses = self.sidecar.responses.len(), "Wrote response sidecar");
        written.push(path);
        Ok(written)
    }
}

/// Millisecond timestamp plus a short run id, so concurrent runs on one
/// dataset never share file names.
fn file_stamp(run_id: &str) -> String {
    let short: String = run_id.chars().filter(char::is_ascii_alphanumeric).take(8).collect();
    let now = Utc::now().format("%Y%m%d_%H%M%S_%3f");
    if short.is_empty() {
        now.to_string()
    } else {
        format!("{now}_{short}")
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> DedupResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| DedupError::Io(format!("failed to serialise {}: {e}", path.display())))?;
    std::fs::write(path, json).map_err(|e| DedupError::Io(format!("failed to write {}: {e}", path.display())))
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> DedupResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DedupError::Io(format!("failed to read {what} {}: {e}", path.display())))?;
    serde_json::from_str(&content).map_err(|e| DedupError::Io(format!("invalid {what} {}: {e}", path.display())))
}

pub fn load_artifact(path: &Path) -> DedupResult<DedupArtifact> {
    read_json(path, "artifact")
}

pub fn load_sidecar(path: &Path) -> DedupResult<ResponseSidecar> {
    read_json(path, "response sidecar")
}
