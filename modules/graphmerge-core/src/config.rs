use std::env;

use crate::error::{DedupError, DedupResult};

/// Secrets for the LLM and embedding endpoints, loaded from the environment
/// (a `.env` file is honoured). Everything non-secret lives in the TOML file.
#[derive(Clone)]
pub struct Secrets {
    pub llm_api_key: String,
    pub llm_base_url: Option<String>,
    pub embedding_api_key: String,
    pub embedding_base_url: Option<String>,
}

impl Secrets {
    pub fn from_env() -> DedupResult<Self> {
        let _ = dotenvy::dotenv();

        let llm_api_key = required_env("LLM_API_KEY")?;
        let embedding_api_key = env::var("EMBEDDING_API_KEY").unwrap_or_else(|_| llm_api_key.clone());

        Ok(Self {
            llm_base_url: optional_env("LLM_BASE_URL"),
            embedding_base_url: optional_env("EMBEDDING_BASE_URL"),
            llm_api_key,
            embedding_api_key,
        })
    }

    /// Log which secrets are present without revealing them.
    pub fn log_redacted(&self) {
        tracing::info!(
            llm_api_key = redact(&self.llm_api_key),
            llm_base_url = self.llm_base_url.as_deref().unwrap_or("<provider default>"),
            embedding_api_key = redact(&self.embedding_api_key),
            embedding_base_url = self.embedding_base_url.as_deref().unwrap_or("<provider default>"),
            "Loaded secrets"
        );
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("llm_api_key", &redact(&self.llm_api_key))
            .field("llm_base_url", &self.llm_base_url)
            .field("embedding_api_key", &redact(&self.embedding_api_key))
            .field("embedding_base_url", &self.embedding_base_url)
            .finish()
    }
}

fn required_env(key: &str) -> DedupResult<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| DedupError::Config(format!("{key} environment variable is required")))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn redact(secret: &str) -> String {
    if secret.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}…****", &secret[..4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hides_short_and_long_secrets() {
        assert_eq!(redact("abc"), "****");
        assert_eq!(redact("sk-0123456789"), "sk-0…****");
    }

    #[test]
    fn debug_output_never_contains_the_key() {
        let secrets = Secrets {
            llm_api_key: "sk-supersecretvalue".into(),
            llm_base_url: None,
            embedding_api_key: "emb-supersecretvalue".into(),
            embedding_base_url: None,
        };
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("supersecret"));
    }
}
