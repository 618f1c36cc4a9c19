pub mod alias;
pub mod config;
pub mod error;
pub mod file_config;
pub mod prompt_registry;
pub mod prompts;
pub mod template;
pub mod text;

pub use alias::AliasRelations;
pub use config::Secrets;
pub use error::{DedupError, DedupResult, LlmErrorKind, TemplateError};
pub use file_config::{
    load_config, ClusteringMethod, DedupConfig, EventsConfig, GraphConfig, HeadDedupConfig,
    KeywordDedupConfig, LlmConfig, LlmProvider, SemanticDedupConfig, SignalWeights,
};
pub use prompt_registry::{PromptKind, PromptRegistry};
pub use text::normalize_name;
