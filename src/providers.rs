//! Generation Providers
//!
//! Uniform call contract over multiple LLM backends selected by a string
//! key. Adding a provider is a registration in [`ProviderRegistry`],
//! never a branch at a call site. DeepSeek speaks the OpenAI wire format,
//! so both share one client pointed at different base URLs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ChatError;

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEEPSEEK_CHAT_URL: &str = "https://api.deepseek.com/chat/completions";

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

/// Token accounting for one generation call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Per-call generation options
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Override the provider's default model
    pub model: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 1000,
            temperature: 0.7,
        }
    }
}

/// One completed generation
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    pub model_id: String,
    pub usage: TokenUsage,
}

/// Uniform generation contract
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Registry key for this provider
    fn id(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationOutput, ChatError>;
}

/// String-keyed provider registry
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from environment keys; providers with no key
    /// configured are simply not registered.
    pub fn from_env() -> Self {
        let mut registry = Self::new();

        if let Some(key) = non_empty_env("GOOGLE_API_KEY") {
            registry.register(Arc::new(GeminiProvider::new(key)));
        }
        if let Some(key) = non_empty_env("OPENAI_API_KEY") {
            registry.register(Arc::new(OpenAiCompatProvider::openai(key)));
        }
        if let Some(key) = non_empty_env("DEEPSEEK_API_KEY") {
            registry.register(Arc::new(OpenAiCompatProvider::deepseek(key)));
        }

        registry
    }

    pub fn register(&mut self, provider: Arc<dyn GenerationProvider>) {
        debug!("Registered generation provider: {}", provider.id());
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn GenerationProvider>, ChatError> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ChatError::ProviderUnavailable(provider_id.to_string()))
    }

    /// Registered provider ids, sorted for stable reporting
    pub fn available_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .expect("Failed to create HTTP client")
}

// ---------------------------------------------------------------------------
// Gemini

/// Google Gemini over the generateContent REST endpoint
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: usize,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: usize,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: usize,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: build_client(),
            api_key,
            default_model: "gemini-2.0-flash".to_string(),
        }
    }

    fn provider_error(&self, reason: impl Into<String>) -> ChatError {
        ChatError::Provider {
            provider: self.id().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationOutput, ChatError> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let url = format!("{}/{}:generateContent", GEMINI_API_URL, model);

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: options.max_tokens,
                temperature: options.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.provider_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.provider_error(format!("HTTP {}: {}", status, body)));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error(format!("malformed response: {}", e)))?;

        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| self.provider_error("response contained no candidates"))?;

        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_default();

        Ok(GenerationOutput {
            text,
            model_id: model,
            usage,
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible (OpenAI, DeepSeek)

/// Chat-completions provider for OpenAI-compatible APIs
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    provider_id: String,
    chat_url: String,
    api_key: String,
    default_model: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

impl OpenAiCompatProvider {
    pub fn new(
        provider_id: impl Into<String>,
        chat_url: impl Into<String>,
        api_key: String,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            client: build_client(),
            provider_id: provider_id.into(),
            chat_url: chat_url.into(),
            api_key,
            default_model: default_model.into(),
        }
    }

    pub fn openai(api_key: String) -> Self {
        Self::new("openai", OPENAI_CHAT_URL, api_key, "gpt-3.5-turbo")
    }

    pub fn deepseek(api_key: String) -> Self {
        Self::new("deepseek", DEEPSEEK_CHAT_URL, api_key, "deepseek-chat")
    }

    fn provider_error(&self, reason: impl Into<String>) -> ChatError {
        ChatError::Provider {
            provider: self.provider_id.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationOutput, ChatError> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let body = ChatCompletionRequest {
            model: model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.provider_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.provider_error(format!("HTTP {}: {}", status, body)));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error(format!("malformed response: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| self.provider_error("response contained no choices"))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(GenerationOutput {
            text,
            model_id: model,
            usage,
        })
    }
}
