pub mod cancel;
pub mod candidates;
pub mod clusterer;
pub mod driver;
pub mod embedder;
pub mod engine;
pub mod llm;
pub mod replay;
pub mod signals;
pub mod similarity;
pub mod stats;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod validator;

pub use cancel::CancelFlag;
pub use candidates::{Candidate, DedupScope, Stage};
pub use driver::{DedupDriver, RunReport};
pub use embedder::{Embedder, EmbeddingCache};
pub use engine::{parse_groups, DedupEngine, Group};
pub use llm::{LlmDispatcher, LlmRequest, LlmResponse};
pub use replay::{CachedChat, DedupResultsFile, ReplayEngine};
pub use stats::{DedupSummary, StageSummary};
pub use store::{load_artifact, load_sidecar, DedupArtifact, IntermediateStore, ResponseSidecar};
