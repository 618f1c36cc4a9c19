//! Typed errors shared by every graphmerge crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an LLM exchange failed. Recorded verbatim in intermediate artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    Network,
    Timeout,
    MalformedJson,
    SchemaViolation,
    CacheMiss,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LlmErrorKind::Network => "network",
            LlmErrorKind::Timeout => "timeout",
            LlmErrorKind::MalformedJson => "malformed_json",
            LlmErrorKind::SchemaViolation => "schema_violation",
            LlmErrorKind::CacheMiss => "cache_miss",
        };
        f.write_str(s)
    }
}

/// Errors raised while loading or rendering prompt templates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown template placeholder: {{{0}}}")]
    UnknownPlaceholder(String),

    #[error("no value supplied for placeholder: {{{0}}}")]
    MissingValue(String),

    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("unmatched '}}' at byte {0} (use '}}}}' for a literal brace)")]
    UnmatchedClose(usize),
}

#[derive(Debug, Error)]
pub enum DedupError {
    /// Invalid thresholds, missing required inputs. Fatal.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unreadable graph or artifact. Fatal.
    #[error("I/O error: {0}")]
    Io(String),

    /// Graph ingest validation (a malformed graph is an unreadable graph). Fatal.
    #[error("Graph error: {0}")]
    Graph(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Model load or encode failure; the affected signal is skipped.
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("LLM error ({kind}): {detail}")]
    Llm { kind: LlmErrorKind, detail: String },

    /// Corrections that would drop or duplicate indices.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Mapping entries whose nodes vanished.
    #[error("Missing reference: {0}")]
    MissingReference(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl DedupError {
    pub fn llm(kind: LlmErrorKind, detail: impl Into<String>) -> Self {
        DedupError::Llm {
            kind,
            detail: detail.into(),
        }
    }

    /// Only configuration and I/O problems terminate a run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DedupError::Config(_) | DedupError::Io(_) | DedupError::Graph(_) | DedupError::Template(_)
        )
    }
}

impl From<std::io::Error> for DedupError {
    fn from(e: std::io::Error) -> Self {
        DedupError::Io(e.to_string())
    }
}

pub type DedupResult<T> = std::result::Result<T, DedupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_and_io_are_fatal() {
        assert!(DedupError::Config("bad threshold".into()).is_fatal());
        assert!(DedupError::Io("missing file".into()).is_fatal());
        assert!(DedupError::from(TemplateError::UnknownPlaceholder("x".into())).is_fatal());
        assert!(!DedupError::Embedding("model down".into()).is_fatal());
        assert!(!DedupError::llm(LlmErrorKind::MalformedJson, "{").is_fatal());
        assert!(!DedupError::Integrity("index 3 dropped".into()).is_fatal());
    }

    #[test]
    fn llm_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&LlmErrorKind::SchemaViolation).unwrap();
        assert_eq!(json, "\"schema_violation\"");
        assert_eq!(LlmErrorKind::CacheMiss.to_string(), "cache_miss");
    }
}
