//! RagChat Core - Entry Point
//!
//! Wires the orchestration core together, runs the background sweepers,
//! and reaps outstanding worker processes on shutdown. The HTTP surface
//! lives in a separate service; this binary hosts the core itself.

use std::sync::Arc;

use ragchat_core::{
    ChatService, Config, EmbeddingClient, KeywordClassifier, ProviderRegistry, RateLimiter,
    ResponseCache, RetrievalAssembler, SessionStore, VectorIndexClient, WorkerBridge,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_env()?;

    let limiter = Arc::new(RateLimiter::new(config.rate.clone()));
    let cache = Arc::new(ResponseCache::new(config.cache.clone()));
    let sessions = Arc::new(SessionStore::new());

    let providers = Arc::new(ProviderRegistry::from_env());
    if providers.is_empty() {
        warn!("No generation providers configured; in-process generation will fail");
    }

    let embedder = Arc::new(EmbeddingClient::new(config.embedding.clone()));
    if !embedder.check_availability().await {
        warn!("Embedding service unreachable; retrieval will degrade to conversational mode");
    }

    let index = Arc::new(VectorIndexClient::new(config.index.clone()));
    if let Err(e) = index.ensure_collection(embedder.dimension()).await {
        warn!("Could not verify index collection: {}", e);
    }

    let assembler = Arc::new(RetrievalAssembler::new(
        Arc::clone(&embedder),
        index,
        config.related.clone(),
    ));

    // Missing script directory is fatal: the worker path would never work
    let bridge = Arc::new(WorkerBridge::new(config.worker.clone())?);

    let service = ChatService::new(
        Arc::clone(&limiter),
        Arc::clone(&cache),
        sessions,
        providers,
        assembler,
        Arc::clone(&bridge),
        Arc::new(KeywordClassifier),
        config.strategy,
    );

    let sweeper = cache.spawn_sweeper();
    let limit_cleaner = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                limiter.cleanup().await;
            }
        })
    };

    let stats = service.stats().await;
    info!(
        "ragchat-core ready: providers={:?}, indexed_documents={:?}",
        stats.available_providers, stats.document_count
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    sweeper.abort();
    limit_cleaner.abort();
    service.bridge().shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
