//! RagChat Core
//!
//! Response-orchestration core for a retrieval-augmented chat service.
//! Turns an incoming user utterance into a generated reply while
//! coordinating caching, abuse control, retrieval-augmented context
//! assembly and execution of generation work in either an in-process
//! path or an out-of-process worker runtime.
//!
//! # Features
//!
//! - **Admission Control**: fixed-window rate limiting with escalating blocks
//! - **Response Caching**: SHA256-keyed, TTL-bounded, FIFO-evicting cache
//! - **Retrieval**: query embedding + Qdrant similarity search + context assembly
//! - **Related Questions**: offset-sampled, de-duplicated follow-up suggestions
//! - **Provider Registry**: Gemini / OpenAI / DeepSeek behind one contract
//! - **Worker Bridge**: per-request Python subprocesses with timeout and
//!   shutdown reaping
//!
//! # Architecture
//!
//! ```text
//! caller ──► RateLimiter ──► ResponseCache ──► ChatService
//!                                 (miss)           │
//!                                                  ├── QueryClassifier
//!                                                  ├── SessionStore
//!                                                  ├── RetrievalAssembler ──► Qdrant
//!                                                  ├── ProviderRegistry ──► LLM APIs
//!                                                  └── WorkerBridge ──► python scripts
//! ```

pub mod cache;
pub mod chat;
pub mod classify;
pub mod config;
pub mod error;
pub mod providers;
pub mod rate_limit;
pub mod retrieval;
pub mod session;
pub mod worker;

pub use cache::{CacheConfig, CacheHit, CacheStats, CachedResponse, ResponseCache};
pub use chat::{ChatRequest, ChatResponse, ChatService, ExecutionStrategy, ServiceStats};
pub use classify::{KeywordClassifier, QueryClassifier, QueryKind};
pub use config::Config;
pub use error::ChatError;
pub use providers::{
    GenerationOptions, GenerationOutput, GenerationProvider, ProviderRegistry, TokenUsage,
};
pub use rate_limit::{RateDecision, RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use retrieval::{
    DocumentInput, EmbeddingClient, EmbeddingConfig, IndexConfig, RelatedQuestionsConfig,
    RetrievalAssembler, RetrievedDocument, VectorIndexClient,
};
pub use session::{ConversationTurn, Role, SessionStats, SessionStore};
pub use worker::{WorkerBridge, WorkerBridgeConfig, WorkerOutput};
