use async_trait::async_trait;

use crate::error::AiError;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// =============================================================================
// ChatAgent Trait
// =============================================================================

/// A chat-completion model: a messages array in, a single text response out.
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait ChatAgent: Send + Sync {
    fn model(&self) -> &str;

    async fn chat(&self, messages: &[Message]) -> Result<String, AiError>;

    async fn chat_completion(&self, system: &str, user: &str) -> Result<String, AiError> {
        self.chat(&[Message::system(system), Message::user(user)])
            .await
    }
}

// =============================================================================
// EmbedAgent Trait
// =============================================================================

/// A text-embedding model: a batch of strings in, one dense vector per string out.
#[async_trait]
pub trait EmbedAgent: Send + Sync {
    fn embedding_model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        self.embed_batch(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AiError::EmptyResponse("no embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError>;
}
