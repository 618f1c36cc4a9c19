// Test doubles for the dedup pipeline.
//
// Three mocks matching the two model boundaries:
// - ScriptedChat (ChatAgent): prompt-substring -> scripted response(s), records calls
// - FailingChat (ChatAgent): always errors
// - HashEmbedder (EmbedAgent): deterministic hash-based vectors
//
// Plus helpers for building graphs and model responses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ai_client::{AiError, ChatAgent, EmbedAgent, Message, MessageRole};
use async_trait::async_trait;
use serde_json::json;

use graphmerge_graph::{parse_graph, KnowledgeGraph};

/// Standard embedding dimension for test vectors.
pub const TEST_EMBEDDING_DIM: usize = 32;

// ---------------------------------------------------------------------------
// ScriptedChat
// ---------------------------------------------------------------------------

struct Rule {
    needle: String,
    responses: VecDeque<String>,
}

/// Chat double. The first rule whose needle occurs in the system or user
/// prompt answers; a rule with several responses hands them out in order and
/// then repeats the last one.
#[derive(Default)]
pub struct ScriptedChat {
    rules: Mutex<Vec<Rule>>,
    fallback: Option<String>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, response: &str) -> Self {
        self.on_sequence(needle, &[response])
    }

    pub fn on_sequence(self, needle: &str, responses: &[&str]) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                needle: needle.to_string(),
                responses: responses.iter().map(|r| r.to_string()).collect(),
            });
        }
        self
    }

    /// Response for prompts no rule matches.
    pub fn otherwise(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// `(system, user)` of every call, in arrival order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatAgent for ScriptedChat {
    fn model(&self) -> &str {
        "scripted-chat"
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, AiError> {
        let pick = |role: MessageRole| {
            messages
                .iter()
                .filter(|m| m.role == role)
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };
        let system = pick(MessageRole::System);
        let user = pick(MessageRole::User);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((system.clone(), user.clone()));
        }

        let mut rules = self.rules.lock().map_err(|_| AiError::Config("poisoned".into()))?;
        for rule in rules.iter_mut() {
            if system.contains(&rule.needle) || user.contains(&rule.needle) {
                let response = if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                };
                return response.ok_or_else(|| AiError::EmptyResponse(format!("rule {:?} is empty", rule.needle)));
            }
        }
        self.fallback
            .clone()
            .ok_or_else(|| AiError::EmptyResponse("no scripted response".to_string()))
    }
}

// ---------------------------------------------------------------------------
// FailingChat
// ---------------------------------------------------------------------------

pub struct FailingChat {
    timeout: bool,
    calls: AtomicUsize,
}

impl FailingChat {
    pub fn network() -> Self {
        Self {
            timeout: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn timeout() -> Self {
        Self {
            timeout: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatAgent for FailingChat {
    fn model(&self) -> &str {
        "failing-chat"
    }

    async fn chat(&self, _messages: &[Message]) -> Result<String, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.timeout {
            Err(AiError::Timeout("scripted timeout".to_string()))
        } else {
            Err(AiError::Network("connection refused".to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// HashEmbedder
// ---------------------------------------------------------------------------

/// Deterministic embedder. Registered texts get exact vectors; a default
/// vector, when set, answers everything else; otherwise unmatched texts get a
/// hash-based vector with low similarity to everything.
pub struct HashEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    default: Option<Vec<f32>>,
    dimension: usize,
    failing: bool,
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: HashMap::new(),
            default: None,
            dimension,
            failing: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on_text(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    pub fn with_default(mut self, vector: Vec<f32>) -> Self {
        self.default = Some(vector);
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);

        let mut state = hasher.finish();
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / u32::MAX as f32) - 0.25
            })
            .collect();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbedAgent for HashEmbedder {
    fn embedding_model(&self) -> &str {
        "hash-embedder"
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(AiError::Network("embedding service unavailable".to_string()));
        }
        Ok(texts
            .iter()
            .map(|t| {
                self.vectors
                    .get(t)
                    .or(self.default.as_ref())
                    .cloned()
                    .unwrap_or_else(|| self.hash_vector(t))
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Entity graph from `(head, relation, tail)` name triples.
pub fn graph_from_triples(triples: &[(&str, &str, &str)]) -> KnowledgeGraph {
    let records: Vec<serde_json::Value> = triples
        .iter()
        .map(|(h, r, t)| {
            json!({
                "start_node": {"label": "entity", "properties": {"name": h}},
                "relation": r,
                "end_node": {"label": "entity", "properties": {"name": t}},
            })
        })
        .collect();
    match parse_graph(&serde_json::Value::Array(records).to_string()) {
        Ok(graph) => graph,
        Err(e) => panic!("test graph failed to parse: {e}"),
    }
}

/// A `{"groups": [...]}` response from `(members, representative, rationale)`
/// using 1-based indices.
pub fn groups_response(groups: &[(Vec<usize>, usize, &str)]) -> String {
    let groups: Vec<serde_json::Value> = groups
        .iter()
        .map(|(members, representative, rationale)| {
            json!({"members": members, "representative": representative, "rationale": rationale})
        })
        .collect();
    json!({ "groups": groups }).to_string()
}
