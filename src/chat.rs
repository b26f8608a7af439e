//! Conversation Router
//!
//! The orchestration entry point: validates the request, applies
//! admission control, consults the response cache, classifies the query,
//! assembles the prompt, dispatches generation (in-process provider or
//! worker bridge) and records the exchange.
//!
//! A failed or empty retrieval step silently downgrades to the
//! conversational prompt; the caller still gets a reply, just without
//! citation context. Provider and worker failures are surfaced as typed
//! errors. No retry is attempted here; retry policy belongs to the HTTP
//! caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheHit, CacheStats, CachedResponse, ResponseCache};
use crate::classify::{QueryClassifier, QueryKind};
use crate::error::ChatError;
use crate::providers::{GenerationOptions, ProviderRegistry, TokenUsage};
use crate::rate_limit::{RateDecision, RateLimiter, RateLimiterStats};
use crate::retrieval::{RetrievalAssembler, RetrievedDocument};
use crate::session::{SessionStats, SessionStore};
use crate::worker::WorkerBridge;

/// Caller input bounds
pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MAX_TOP_K: usize = 10;

const DEFAULT_TOP_K: usize = 3;
/// Turns of history injected into the prompt (ring buffer keeps 20)
const HISTORY_WINDOW: usize = 10;
/// Logical name of the worker-side chat script
const CHAT_SCRIPT: &str = "rag_chatbot";

const PERSONA_PREAMBLE: &str = "You are a helpful, knowledgeable assistant. \
Answer clearly and concisely, and stay grounded in what you actually know.";

/// Where generation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Call the provider registry directly
    InProcess,
    /// Delegate the whole generation task to the worker runtime
    WorkerBridge,
}

/// One inbound chat request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub provider_id: String,
    /// Explicit routing override; None applies the classifier
    pub use_retrieval: Option<bool>,
    pub top_k: Option<usize>,
    /// Rate-limiter key; never logged in clear text
    pub caller_id: String,
}

impl ChatRequest {
    fn validate(&self) -> Result<(), ChatError> {
        if self.message.trim().is_empty() {
            return Err(ChatError::Validation("message must not be empty".to_string()));
        }
        if self.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::Validation(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        if self.provider_id.trim().is_empty() {
            return Err(ChatError::Validation("provider_id must not be empty".to_string()));
        }
        if let Some(top_k) = self.top_k {
            if !(1..=MAX_TOP_K).contains(&top_k) {
                return Err(ChatError::Validation(format!(
                    "top_k must be between 1 and {}",
                    MAX_TOP_K
                )));
            }
        }
        Ok(())
    }
}

/// One generated (or cache-served) reply
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub message_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub provider_id: String,
    pub model_id: String,
    pub usage: TokenUsage,
    pub rag_used: bool,
    pub retrieved_documents: Vec<RetrievedDocument>,
    pub related_questions: Vec<String>,
    pub cached: bool,
    pub cache_hits: u64,
    pub cache_age_secs: u64,
}

/// Aggregated service statistics
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub rate: RateLimiterStats,
    pub sessions: SessionStats,
    /// None when the index is unreachable
    pub document_count: Option<usize>,
    pub available_providers: Vec<String>,
}

struct Generated {
    content: String,
    model_id: String,
    usage: TokenUsage,
    rag_used: bool,
    retrieved_documents: Vec<RetrievedDocument>,
    related_questions: Vec<String>,
}

/// The orchestration service. All stores are constructor-injected so
/// tests can build isolated instances.
pub struct ChatService {
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    sessions: Arc<SessionStore>,
    providers: Arc<ProviderRegistry>,
    assembler: Arc<RetrievalAssembler>,
    bridge: Arc<WorkerBridge>,
    classifier: Arc<dyn QueryClassifier>,
    strategy: ExecutionStrategy,
    options: GenerationOptions,
}

impl ChatService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        sessions: Arc<SessionStore>,
        providers: Arc<ProviderRegistry>,
        assembler: Arc<RetrievalAssembler>,
        bridge: Arc<WorkerBridge>,
        classifier: Arc<dyn QueryClassifier>,
        strategy: ExecutionStrategy,
    ) -> Self {
        Self {
            limiter,
            cache,
            sessions,
            providers,
            assembler,
            bridge,
            classifier,
            strategy,
            options: GenerationOptions::default(),
        }
    }

    /// Produce a reply for one user utterance
    pub async fn respond(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        request.validate()?;

        match self.limiter.check(&request.caller_id).await {
            RateDecision::Denied {
                reason,
                retry_after,
            } => {
                return Err(ChatError::RateLimited {
                    reason,
                    retry_after_secs: retry_after.as_secs(),
                });
            }
            RateDecision::Allowed { remaining, .. } => {
                debug!("Request admitted, {} remaining in window", remaining);
            }
        }

        let use_retrieval = request.use_retrieval.unwrap_or_else(|| {
            self.classifier.classify(&request.message) == QueryKind::InformationSeeking
        });
        let top_k = request.top_k.unwrap_or(DEFAULT_TOP_K);
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(hit) = self
            .cache
            .get(&request.message, &request.provider_id, use_retrieval, top_k)
            .await
        {
            self.sessions
                .append_exchange(&session_id, &request.message, &hit.response.content)
                .await;
            return Ok(Self::response_from_cache(session_id, &request.provider_id, hit));
        }

        let generated = match self.strategy {
            ExecutionStrategy::InProcess => {
                self.generate_in_process(&request, &session_id, use_retrieval, top_k)
                    .await?
            }
            ExecutionStrategy::WorkerBridge => {
                self.generate_via_worker(&request, &session_id, use_retrieval, top_k)
                    .await?
            }
        };

        self.sessions
            .append_exchange(&session_id, &request.message, &generated.content)
            .await;

        self.cache
            .insert(
                &request.message,
                &request.provider_id,
                use_retrieval,
                top_k,
                CachedResponse {
                    content: generated.content.clone(),
                    provider_id: request.provider_id.clone(),
                    model_id: generated.model_id.clone(),
                    usage: generated.usage.clone(),
                    rag_used: generated.rag_used,
                    retrieved_documents: generated.retrieved_documents.clone(),
                    related_questions: generated.related_questions.clone(),
                },
            )
            .await;

        Ok(ChatResponse {
            session_id,
            message_id: Uuid::new_v4().to_string(),
            role: "assistant".to_string(),
            content: generated.content,
            timestamp: Utc::now(),
            provider_id: request.provider_id,
            model_id: generated.model_id,
            usage: generated.usage,
            rag_used: generated.rag_used,
            retrieved_documents: generated.retrieved_documents,
            related_questions: generated.related_questions,
            cached: false,
            cache_hits: 0,
            cache_age_secs: 0,
        })
    }

    async fn generate_in_process(
        &self,
        request: &ChatRequest,
        session_id: &str,
        use_retrieval: bool,
        top_k: usize,
    ) -> Result<Generated, ChatError> {
        let provider = self.providers.get(&request.provider_id)?;

        let (context, documents) = if use_retrieval {
            match self.assembler.retrieve(&request.message, top_k).await {
                Ok(docs) => {
                    let context = RetrievalAssembler::build_context(&docs);
                    if context.is_empty() {
                        debug!("Retrieval yielded no usable context, using conversational prompt");
                        (None, Vec::new())
                    } else {
                        (Some(context), docs)
                    }
                }
                Err(e) => {
                    warn!("Retrieval failed, degrading to conversational prompt: {}", e);
                    (None, Vec::new())
                }
            }
        } else {
            (None, Vec::new())
        };

        let history = self
            .sessions
            .as_prompt_context(session_id, HISTORY_WINDOW)
            .await;
        let prompt = build_prompt(&history, context.as_deref(), &request.message);

        let output = provider.generate(&prompt, &self.options).await?;

        let related_questions = if documents.is_empty() {
            Vec::new()
        } else {
            self.assembler
                .related_questions(&request.message)
                .await
                .unwrap_or_else(|e| {
                    debug!("Related-question sampling failed: {}", e);
                    Vec::new()
                })
        };

        Ok(Generated {
            content: output.text,
            model_id: output.model_id,
            usage: output.usage,
            rag_used: !documents.is_empty(),
            retrieved_documents: documents,
            related_questions,
        })
    }

    async fn generate_via_worker(
        &self,
        request: &ChatRequest,
        session_id: &str,
        use_retrieval: bool,
        top_k: usize,
    ) -> Result<Generated, ChatError> {
        let args = chat_task_args(
            &request.message,
            session_id,
            &request.provider_id,
            use_retrieval,
            top_k,
        );
        let output = self.bridge.execute(CHAT_SCRIPT, &args).await?;

        let generated = match output.payload {
            Some(payload) => {
                // Handled script failures exit 0 with an error payload
                if let Some(reason) = payload.get("error").and_then(|e| e.as_str()) {
                    return Err(ChatError::Provider {
                        provider: request.provider_id.clone(),
                        reason: reason.to_string(),
                    });
                }

                let content = payload
                    .get("response")
                    .and_then(|r| r.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| output.raw_stdout.trim().to_string());
                let model_id = payload
                    .get("model")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let usage = payload
                    .get("usage")
                    .and_then(|u| serde_json::from_value(u.clone()).ok())
                    .unwrap_or_default();
                let retrieved_documents: Vec<RetrievedDocument> = payload
                    .get("retrieved_documents")
                    .and_then(|d| serde_json::from_value(d.clone()).ok())
                    .unwrap_or_default();
                let rag_used = payload
                    .get("rag_used")
                    .and_then(|r| r.as_bool())
                    .unwrap_or(use_retrieval);

                Generated {
                    content,
                    model_id,
                    usage,
                    rag_used,
                    retrieved_documents,
                    related_questions: Vec::new(),
                }
            }
            None => {
                // Unstructured worker output: keep the raw text
                let content = output.raw_stdout.trim().to_string();
                if content.is_empty() {
                    return Err(ChatError::Provider {
                        provider: request.provider_id.clone(),
                        reason: format!("worker produced no output; stderr: {}", output.stderr),
                    });
                }
                Generated {
                    content,
                    model_id: "unknown".to_string(),
                    usage: TokenUsage::default(),
                    rag_used: use_retrieval,
                    retrieved_documents: Vec::new(),
                    related_questions: Vec::new(),
                }
            }
        };

        let mut generated = generated;
        if generated.rag_used {
            generated.related_questions = self
                .assembler
                .related_questions(&request.message)
                .await
                .unwrap_or_default();
        }

        Ok(generated)
    }

    fn response_from_cache(session_id: String, provider_id: &str, hit: CacheHit) -> ChatResponse {
        ChatResponse {
            session_id,
            message_id: Uuid::new_v4().to_string(),
            role: "assistant".to_string(),
            content: hit.response.content,
            timestamp: Utc::now(),
            provider_id: provider_id.to_string(),
            model_id: hit.response.model_id,
            usage: hit.response.usage,
            rag_used: hit.response.rag_used,
            retrieved_documents: hit.response.retrieved_documents,
            related_questions: hit.response.related_questions,
            cached: true,
            cache_hits: hit.hits,
            cache_age_secs: hit.age.as_secs(),
        }
    }

    /// Aggregate statistics across the injected stores
    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats().await,
            rate: self.limiter.stats().await,
            sessions: self.sessions.stats().await,
            document_count: self.assembler.document_count().await.ok(),
            available_providers: self.providers.available_providers(),
        }
    }

    /// The worker bridge, exposed for the shutdown sweep
    pub fn bridge(&self) -> &Arc<WorkerBridge> {
        &self.bridge
    }
}

/// Positional-argument protocol for the worker-side chat task
fn chat_task_args(
    query: &str,
    session_id: &str,
    provider_id: &str,
    use_retrieval: bool,
    top_k: usize,
) -> Vec<String> {
    vec![
        "chat".to_string(),
        query.to_string(),
        session_id.to_string(),
        provider_id.to_string(),
        use_retrieval.to_string(),
        top_k.to_string(),
    ]
}

fn build_prompt(history: &str, context: Option<&str>, question: &str) -> String {
    let mut prompt = String::from(PERSONA_PREAMBLE);
    prompt.push_str("\n\n");

    if !history.is_empty() {
        prompt.push_str(history);
        prompt.push('\n');
    }

    match context {
        Some(ctx) => {
            prompt.push_str(
                "Based on the following context information, please answer the user's question.\n\
                 If the context doesn't contain relevant information, use your general knowledge \
                 to provide a helpful response.\n\n",
            );
            prompt.push_str(&format!("Context:\n{}\n\n", ctx));
            prompt.push_str(&format!("Question: {}\n\n", question));
            prompt.push_str(
                "Please provide a comprehensive and accurate answer based on the available \
                 context and your knowledge.",
            );
        }
        None => {
            prompt.push_str(&format!("[Current message:]\n{}", question));
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> ChatRequest {
        ChatRequest {
            message: "What is machine learning?".to_string(),
            session_id: None,
            provider_id: "p1".to_string(),
            use_retrieval: None,
            top_k: None,
            caller_id: "ip-A".to_string(),
        }
    }

    #[test]
    fn test_validation_accepts_good_request() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_message() {
        let request = ChatRequest {
            message: "   ".to_string(),
            ..valid_request()
        };
        assert!(matches!(request.validate(), Err(ChatError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_oversized_message() {
        let request = ChatRequest {
            message: "x".repeat(MAX_MESSAGE_CHARS + 1),
            ..valid_request()
        };
        assert!(matches!(request.validate(), Err(ChatError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_bad_top_k() {
        for top_k in [0, MAX_TOP_K + 1] {
            let request = ChatRequest {
                top_k: Some(top_k),
                ..valid_request()
            };
            assert!(
                matches!(request.validate(), Err(ChatError::Validation(_))),
                "top_k {} should be rejected",
                top_k
            );
        }
    }

    #[test]
    fn test_chat_task_args_order() {
        let args = chat_task_args("why is it failing", "s-42", "gemini", true, 5);
        assert_eq!(
            args,
            vec!["chat", "why is it failing", "s-42", "gemini", "true", "5"]
        );
    }

    #[test]
    fn test_prompt_with_context() {
        let prompt = build_prompt("", Some("Doc one.\n\nDoc two."), "How do refunds work?");
        assert!(prompt.starts_with(PERSONA_PREAMBLE));
        assert!(prompt.contains("Context:\nDoc one.\n\nDoc two."));
        assert!(prompt.contains("Question: How do refunds work?"));
    }

    #[test]
    fn test_prompt_without_context_is_conversational() {
        let history = "[Previous conversation:]\nUser: hi\nAssistant: hello\n";
        let prompt = build_prompt(history, None, "How are you?");
        assert!(prompt.contains("[Previous conversation:]"));
        assert!(prompt.contains("[Current message:]\nHow are you?"));
        assert!(!prompt.contains("Context:"));
    }
}
