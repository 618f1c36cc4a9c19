use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::alias::AliasRelations;
use crate::error::{DedupError, DedupResult};
use crate::prompt_registry::PromptRegistry;

/// TOML-backed configuration loaded from disk. Every section is optional.
/// Secrets (API keys, endpoints) stay as env vars, see [`crate::Secrets`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    pub dataset: String,
    pub output_dir: PathBuf,
    pub embedding_model: String,
    pub llm: LlmConfig,
    pub semantic_dedup: SemanticDedupConfig,
    pub keyword_dedup: KeywordDedupConfig,
    pub head_dedup: HeadDedupConfig,
    pub graph: GraphConfig,
    pub events: EventsConfig,
    /// `[prompts.<family>] <name> = "template"` overrides.
    pub prompts: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            dataset: "graph".to_string(),
            output_dir: PathBuf::from("output"),
            embedding_model: "text-embedding-3-small".to_string(),
            llm: LlmConfig::default(),
            semantic_dedup: SemanticDedupConfig::default(),
            keyword_dedup: KeywordDedupConfig::default(),
            head_dedup: HeadDedupConfig::default(),
            graph: GraphConfig::default(),
            events: EventsConfig::default(),
            prompts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Claude,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: Option<String>,
    pub max_concurrency: usize,
    pub timeout_secs: u64,
    pub embedding_batch_size: usize,
    pub embedding_cache_path: Option<PathBuf>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            max_concurrency: 8,
            timeout_secs: 60,
            embedding_batch_size: 64,
            embedding_cache_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusteringMethod {
    Embedding,
    Llm,
}

impl ClusteringMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusteringMethod::Embedding => "embedding",
            ClusteringMethod::Llm => "llm",
        }
    }
}

/// Tail deduplication plus the engine/clusterer knobs shared by every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SemanticDedupConfig {
    pub enabled: bool,
    /// Embedding clustering threshold (centroid cosine).
    pub threshold: f32,
    pub max_batch_size: usize,
    pub max_candidates: usize,
    pub clustering_method: ClusteringMethod,
    pub enable_clustering_validation: bool,
    pub save_intermediate_results: bool,
    /// Raw-response sidecar to serve LLM calls from instead of the network.
    pub cached_results_path: Option<PathBuf>,
    pub llm_clustering_batch_size: usize,
    pub max_head_context: usize,
    /// Repeat a cluster's first candidate in every later batch so groups can
    /// be reconciled across batches.
    pub batch_pivot: bool,
}

impl Default for SemanticDedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.75,
            max_batch_size: 8,
            max_candidates: 50,
            clustering_method: ClusteringMethod::Embedding,
            enable_clustering_validation: false,
            save_intermediate_results: true,
            cached_results_path: None,
            llm_clustering_batch_size: 30,
            max_head_context: 10,
            batch_pivot: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeywordDedupConfig {
    pub enabled: bool,
}

impl Default for KeywordDedupConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignalWeights {
    pub semantic: f32,
    pub subgraph: f32,
    pub alias: f32,
    pub attribute: f32,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            semantic: 0.30,
            subgraph: 0.25,
            alias: 0.35,
            attribute: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeadDedupConfig {
    pub enabled: bool,
    pub enable_semantic_signal: bool,
    pub enable_subgraph_signal: bool,
    pub enable_alias_signal: bool,
    pub enable_attribute_signal: bool,
    pub semantic_threshold: f32,
    pub subgraph_threshold: f32,
    pub attribute_threshold: f32,
    pub max_semantic_candidates: usize,
    pub use_two_hop: bool,
    pub signal_weights: SignalWeights,
    pub use_llm_validation: bool,
    pub similarity_threshold: f32,
}

impl Default for HeadDedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enable_semantic_signal: true,
            enable_subgraph_signal: true,
            enable_alias_signal: true,
            enable_attribute_signal: true,
            semantic_threshold: 0.75,
            subgraph_threshold: 0.8,
            attribute_threshold: 0.5,
            max_semantic_candidates: 1000,
            use_two_hop: false,
            signal_weights: SignalWeights::default(),
            use_llm_validation: true,
            similarity_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    pub remove_isolated: bool,
    pub alias_relations: AliasRelations,
    pub keyword_filter_relation: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            remove_isolated: false,
            alias_relations: AliasRelations::default(),
            keyword_filter_relation: "keyword_filter_by".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    pub enabled: bool,
    pub trigger_relations: Vec<String>,
    pub event_relation: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_relations: [
                "solution",
                "solutions",
                "treatment",
                "strategy",
                "解决方案",
                "解决办法",
                "治疗",
                "治疗方法",
                "措施",
                "策略",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            event_relation: "has_event".to_string(),
        }
    }
}

impl DedupConfig {
    /// Reject configurations that cannot drive a run. Fatal, raised before any work.
    pub fn validate(&self) -> DedupResult<()> {
        let thresholds = [
            ("semantic_dedup.threshold", self.semantic_dedup.threshold),
            ("head_dedup.semantic_threshold", self.head_dedup.semantic_threshold),
            ("head_dedup.subgraph_threshold", self.head_dedup.subgraph_threshold),
            ("head_dedup.attribute_threshold", self.head_dedup.attribute_threshold),
            ("head_dedup.similarity_threshold", self.head_dedup.similarity_threshold),
        ];
        for (key, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(DedupError::Config(format!("{key} must be within [0, 1], got {value}")));
            }
        }

        let counts = [
            ("semantic_dedup.max_batch_size", self.semantic_dedup.max_batch_size),
            ("semantic_dedup.max_candidates", self.semantic_dedup.max_candidates),
            ("semantic_dedup.llm_clustering_batch_size", self.semantic_dedup.llm_clustering_batch_size),
            ("llm.max_concurrency", self.llm.max_concurrency),
            ("llm.embedding_batch_size", self.llm.embedding_batch_size),
        ];
        for (key, value) in counts {
            if value == 0 {
                return Err(DedupError::Config(format!("{key} must be greater than 0")));
            }
        }
        if self.llm.timeout_secs == 0 {
            return Err(DedupError::Config("llm.timeout_secs must be greater than 0".into()));
        }

        let w = self.head_dedup.signal_weights;
        if [w.semantic, w.subgraph, w.alias, w.attribute].iter().any(|v| *v < 0.0 || !v.is_finite()) {
            return Err(DedupError::Config("head_dedup.signal_weights must be non-negative".into()));
        }
        if self.head_dedup.enabled && self.active_weight_sum() <= 0.0 {
            return Err(DedupError::Config(
                "head_dedup has no enabled signal with a positive weight".into(),
            ));
        }

        if self.dataset.trim().is_empty() {
            return Err(DedupError::Config("dataset must not be empty".into()));
        }
        if self.graph.alias_relations.forward.is_empty() && self.graph.alias_relations.reverse.is_empty() {
            return Err(DedupError::Config("graph.alias_relations must not be empty".into()));
        }

        PromptRegistry::load(&self.prompts)?;
        Ok(())
    }

    fn active_weight_sum(&self) -> f32 {
        let h = &self.head_dedup;
        let w = h.signal_weights;
        [
            (h.enable_semantic_signal, w.semantic),
            (h.enable_subgraph_signal, w.subgraph),
            (h.enable_alias_signal, w.alias),
            (h.enable_attribute_signal, w.attribute),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, weight)| weight)
        .sum()
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<DedupConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: DedupConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config: DedupConfig = toml::from_str("").unwrap();
        assert_eq!(config.semantic_dedup.max_batch_size, 8);
        assert_eq!(config.semantic_dedup.clustering_method, ClusteringMethod::Embedding);
        assert_eq!(config.head_dedup.signal_weights, SignalWeights::default());
        config.validate().unwrap();
    }

    #[test]
    fn parses_sections_and_prompt_overrides() {
        let config: DedupConfig = toml::from_str(
            r#"
            dataset = "movies"
            embedding_model = "bge-m3"

            [llm]
            provider = "claude"
            model = "claude-sonnet"
            max_concurrency = 4

            [semantic_dedup]
            threshold = 0.8
            clustering_method = "llm"
            enable_clustering_validation = true

            [head_dedup.signal_weights]
            alias = 0.5

            [prompts.semantic_dedup]
            attribute = "{head} {relation} {candidates}"
            "#,
        )
        .unwrap();
        assert_eq!(config.dataset, "movies");
        assert_eq!(config.llm.provider, LlmProvider::Claude);
        assert_eq!(config.semantic_dedup.clustering_method, ClusteringMethod::Llm);
        assert_eq!(config.head_dedup.signal_weights.alias, 0.5);
        assert_eq!(config.head_dedup.signal_weights.semantic, 0.30);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_clustering_method_fails_to_parse() {
        let result: Result<DedupConfig, _> =
            toml::from_str("[semantic_dedup]\nclustering_method = \"kmeans\"");
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = DedupConfig::default();
        config.semantic_dedup.threshold = 1.5;
        assert!(matches!(config.validate(), Err(DedupError::Config(msg)) if msg.contains("semantic_dedup.threshold")));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = DedupConfig::default();
        config.semantic_dedup.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn all_zero_active_weights_are_rejected_when_head_dedup_runs() {
        let mut config = DedupConfig::default();
        config.head_dedup.enabled = true;
        config.head_dedup.signal_weights = SignalWeights {
            semantic: 0.0,
            subgraph: 0.0,
            alias: 0.0,
            attribute: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_prompt_placeholder_is_rejected() {
        let mut config = DedupConfig::default();
        config.prompts.insert(
            "head_dedup".into(),
            BTreeMap::from([("general".to_string(), "{head} {ontology}".to_string())]),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_config_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dataset = \"demo\"\n[graph]\nremove_isolated = true").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.dataset, "demo");
        assert!(config.graph.remove_isolated);
    }

    #[test]
    fn load_config_reports_path_on_missing_file() {
        let err = load_config(Path::new("/nonexistent/dedup.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dedup.toml"));
    }
}
