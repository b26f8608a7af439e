//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;

use crate::cache::CacheConfig;
use crate::chat::ExecutionStrategy;
use crate::rate_limit::RateLimiterConfig;
use crate::retrieval::{EmbeddingConfig, IndexConfig, RelatedQuestionsConfig};
use crate::worker::WorkerBridgeConfig;

/// Service configuration, aggregated from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub rate: RateLimiterConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub related: RelatedQuestionsConfig,
    pub worker: WorkerBridgeConfig,
    /// Where generation runs by default
    pub strategy: ExecutionStrategy,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut rate = RateLimiterConfig::default();
        if let Some(v) = env_parse("RAGCHAT_RATE_MAX_REQUESTS") {
            rate.max_requests = v;
        }
        if let Some(v) = env_parse::<u64>("RAGCHAT_RATE_WINDOW_SECS") {
            rate.window = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("RAGCHAT_RATE_BLOCK_SECS") {
            rate.block_duration = Duration::from_secs(v);
        }

        let mut cache = CacheConfig::default();
        cache.enabled = std::env::var("RAGCHAT_CACHE_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);
        if let Some(v) = env_parse::<u64>("RAGCHAT_CACHE_TTL_SECS") {
            cache.ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("RAGCHAT_CACHE_MAX_ENTRIES") {
            cache.max_entries = v;
        }
        if let Some(v) = env_parse::<u64>("RAGCHAT_CACHE_SWEEP_SECS") {
            cache.sweep_interval = Duration::from_secs(v);
        }

        let mut related = RelatedQuestionsConfig::default();
        if let Some(v) = env_parse("RAGCHAT_RELATED_SKIP") {
            related.skip = v;
        }
        if let Some(v) = env_parse("RAGCHAT_RELATED_TAKE") {
            related.take = v;
        }
        if let Some(v) = env_parse("RAGCHAT_RELATED_MAX") {
            related.max = v;
        }

        let strategy = match std::env::var("RAGCHAT_EXECUTION").as_deref() {
            Ok("worker") => ExecutionStrategy::WorkerBridge,
            _ => ExecutionStrategy::InProcess,
        };

        Ok(Self {
            rate,
            cache,
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            related,
            worker: WorkerBridgeConfig::default(),
            strategy,
        })
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
