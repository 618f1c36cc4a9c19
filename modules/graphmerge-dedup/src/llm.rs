//! Bounded fan-out of chat completions.
//!
//! Workers never touch shared state: each returns `(request_id, outcome)` and
//! the caller consumes the outcomes sorted by request id, so completion order
//! never leaks into the result.

use std::sync::Arc;
use std::time::Duration;

use ai_client::{AiError, ChatAgent};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use graphmerge_core::{DedupError, DedupResult, LlmErrorKind};

use crate::cancel::CancelFlag;

/// Prefix of the error a response cache returns for an unknown prompt.
pub const CACHE_MISS: &str = "cache miss";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    pub id: String,
    pub system: String,
    pub user: String,
}

impl LlmRequest {
    pub fn new(id: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system: system.into(),
            user: user.into(),
        }
    }

    pub fn prompt_hash(&self) -> String {
        prompt_hash(&self.system, &self.user)
    }
}

#[derive(Debug)]
pub struct LlmResponse {
    pub id: String,
    pub outcome: DedupResult<String>,
}

/// `"{stage}:{scope:05}:{cluster:04}:{batch:03}"`; zero padding keeps the
/// lexical order equal to the numeric order.
pub fn request_id(stage: &str, scope: usize, cluster: usize, batch: usize) -> String {
    format!("{stage}:{scope:05}:{cluster:04}:{batch:03}")
}

/// SHA-256 over both prompts; keys the raw-response sidecar.
pub fn prompt_hash(system: &str, user: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(system.as_bytes());
    hasher.update([0u8]);
    hasher.update(user.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn classify_ai_error(error: &AiError) -> LlmErrorKind {
    match error {
        AiError::Timeout(_) => LlmErrorKind::Timeout,
        AiError::Parse(_) => LlmErrorKind::MalformedJson,
        AiError::EmptyResponse(msg) if msg.starts_with(CACHE_MISS) => LlmErrorKind::CacheMiss,
        _ => LlmErrorKind::Network,
    }
}

pub struct LlmDispatcher {
    chat: Arc<dyn ChatAgent>,
    concurrency: usize,
    timeout: Duration,
    cancel: CancelFlag,
}

impl LlmDispatcher {
    pub fn new(chat: Arc<dyn ChatAgent>) -> Self {
        Self {
            chat,
            concurrency: 8,
            timeout: Duration::from_secs(60),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn model(&self) -> &str {
        self.chat.model()
    }

    /// Issue every request through the bounded pool. Requests that have not
    /// started when the run is cancelled resolve to `DedupError::Cancelled`.
    pub async fn dispatch(&self, requests: Vec<LlmRequest>) -> Vec<LlmResponse> {
        if requests.is_empty() {
            return Vec::new();
        }
        debug!(count = requests.len(), concurrency = self.concurrency, "Dispatching LLM requests");
        let timeout = self.timeout;

        let mut responses: Vec<LlmResponse> = stream::iter(requests.into_iter().map(|request| {
            let chat = Arc::clone(&self.chat);
            let cancel = self.cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return LlmResponse {
                        id: request.id,
                        outcome: Err(DedupError::Cancelled),
                    };
                }
                let outcome = match tokio::time::timeout(timeout, chat.chat_completion(&request.system, &request.user)).await {
                    Ok(Ok(text)) => Ok(text),
                    Ok(Err(e)) => {
                        let kind = classify_ai_error(&e);
                        warn!(request = %request.id, %kind, error = %e, "LLM call failed");
                        Err(DedupError::llm(kind, e.to_string()))
                    }
                    Err(_) => {
                        warn!(request = %request.id, timeout_secs = timeout.as_secs(), "LLM call timed out");
                        Err(DedupError::llm(
                            LlmErrorKind::Timeout,
                            format!("no response within {}s", timeout.as_secs()),
                        ))
                    }
                };
                LlmResponse { id: request.id, outcome }
            }
        }))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        responses.sort_by(|a, b| a.id.cmp(&b.id));
        responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingChat, ScriptedChat};

    #[test]
    fn request_ids_sort_numerically() {
        let mut ids = vec![
            request_id("edge", 10, 0, 0),
            request_id("edge", 2, 1, 0),
            request_id("edge", 2, 0, 11),
            request_id("edge", 2, 0, 3),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec!["edge:00002:0000:003", "edge:00002:0000:011", "edge:00002:0001:000", "edge:00010:0000:000"]
        );
    }

    #[test]
    fn prompt_hash_separates_system_and_user() {
        assert_ne!(prompt_hash("ab", "c"), prompt_hash("a", "bc"));
        assert_eq!(prompt_hash("s", "u"), prompt_hash("s", "u"));
    }

    #[test]
    fn classifies_ai_errors() {
        assert_eq!(classify_ai_error(&AiError::Timeout("slow".into())), LlmErrorKind::Timeout);
        assert_eq!(classify_ai_error(&AiError::Parse("bad".into())), LlmErrorKind::MalformedJson);
        assert_eq!(
            classify_ai_error(&AiError::EmptyResponse(format!("{CACHE_MISS}: abc"))),
            LlmErrorKind::CacheMiss
        );
        assert_eq!(
            classify_ai_error(&AiError::Api { status: 500, body: String::new() }),
            LlmErrorKind::Network
        );
    }

    #[tokio::test]
    async fn responses_come_back_in_request_id_order() {
        let chat = Arc::new(ScriptedChat::new().on("alpha", "A").on("beta", "B"));
        let dispatcher = LlmDispatcher::new(chat.clone()).with_concurrency(4);
        let responses = dispatcher
            .dispatch(vec![
                LlmRequest::new("edge:00001:0000:000", "sys", "beta"),
                LlmRequest::new("edge:00000:0000:000", "sys", "alpha"),
            ])
            .await;

        assert_eq!(responses[0].id, "edge:00000:0000:000");
        assert_eq!(responses[0].outcome.as_deref().unwrap(), "A");
        assert_eq!(responses[1].outcome.as_deref().unwrap(), "B");
        assert_eq!(chat.call_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_requests_are_never_sent() {
        let chat = Arc::new(ScriptedChat::new().on("x", "{}"));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let dispatcher = LlmDispatcher::new(chat.clone()).with_cancel(cancel);
        let responses = dispatcher.dispatch(vec![LlmRequest::new("a", "s", "x")]).await;
        assert!(matches!(responses[0].outcome, Err(DedupError::Cancelled)));
        assert_eq!(chat.call_count(), 0);
    }

    #[tokio::test]
    async fn failures_carry_their_kind() {
        let dispatcher = LlmDispatcher::new(Arc::new(FailingChat::network()));
        let responses = dispatcher.dispatch(vec![LlmRequest::new("a", "s", "u")]).await;
        assert!(matches!(
            responses[0].outcome,
            Err(DedupError::Llm { kind: LlmErrorKind::Network, .. })
        ));
    }
}
