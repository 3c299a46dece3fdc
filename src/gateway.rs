//! Adapter around the external assistant completion service.
//!
//! Responses are validated once, here, into `Ok(text)` or
//! `Err(SyncError::AssistantUnavailable(reason))`. Network failure, non-2xx
//! status, malformed JSON and a missing text field all collapse into that one
//! error; nothing past this module inspects raw response shapes.

use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::config::AssistantConfig;
use crate::error::{Result, SyncError};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    Openai,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Gemini => write!(f, "gemini"),
            Provider::Openai => write!(f, "openai"),
        }
    }
}

impl Provider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini-1.5-flash",
            Provider::Openai => "gpt-3.5-turbo",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Openai => "OPENAI_API_KEY",
        }
    }

    pub fn default_max_output_tokens(&self) -> u32 {
        match self {
            Provider::Gemini => 2048,
            Provider::Openai => 500,
        }
    }
}

/// The query extracted from an `@ai` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub query: String,
}

impl CommandRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into() }
    }
}

/// One request/response exchange with a completion service.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Generated text, or `SyncError::AssistantUnavailable`.
    async fn complete(&self, request: &CommandRequest) -> Result<String>;
}

// -- Gemini generateContent types -------------------------------------------

#[derive(Debug, Serialize)]
pub struct GeminiPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct GeminiContent {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_k: u32,
    pub top_p: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    pub generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiCandidate {
    pub content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiCandidateContent {
    #[serde(default)]
    pub parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiResponsePart {
    pub text: Option<String>,
}

// -- OpenAI chat completion types -------------------------------------------

#[derive(Debug, Serialize)]
pub struct OpenAIChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAIChatRequest {
    pub model: String,
    pub messages: Vec<OpenAIChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResponse {
    #[serde(default)]
    pub choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub message: Option<OpenAIResponseMessage>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResponseMessage {
    pub content: Option<String>,
}

// -- Shared error body -------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    pub message: Option<String>,
}

fn unavailable(reason: impl Into<String>) -> SyncError {
    SyncError::AssistantUnavailable(reason.into())
}

fn error_body_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .filter(|m| !m.is_empty())
}

/// Validate a Gemini `generateContent` response.
pub fn parse_gemini_response(status: u16, body: &[u8]) -> Result<String> {
    if !(200..300).contains(&status) {
        return Err(unavailable(
            error_body_message(body).unwrap_or_else(|| "Failed to get AI response".to_string()),
        ));
    }
    let parsed: GeminiResponse =
        serde_json::from_slice(body).map_err(|e| unavailable(format!("malformed response: {e}")))?;
    parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| unavailable("No response generated"))
}

/// Validate an OpenAI chat completion response.
pub fn parse_openai_response(status: u16, body: &[u8]) -> Result<String> {
    if !(200..300).contains(&status) {
        return Err(unavailable(
            error_body_message(body).unwrap_or_else(|| format!("HTTP error! status: {status}")),
        ));
    }
    let parsed: OpenAIResponse =
        serde_json::from_slice(body).map_err(|e| unavailable(format!("malformed response: {e}")))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| unavailable("Invalid response format from OpenAI"))
}

/// HTTP gateway for either supported provider.
pub struct HttpGateway {
    client: reqwest::Client,
    provider: Provider,
    model: String,
    api_key: String,
    base_url: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl HttpGateway {
    /// Build from config, reading the API key from the environment.
    pub fn from_config(cfg: &AssistantConfig) -> Result<Self> {
        let api_key = cfg.api_key()?;
        Self::new(cfg, api_key)
    }

    pub fn new(cfg: &AssistantConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;
        let base_url = cfg.base_url.clone().unwrap_or_else(|| match cfg.provider {
            Provider::Gemini => GEMINI_BASE_URL.to_string(),
            Provider::Openai => OPENAI_BASE_URL.to_string(),
        });
        Ok(Self {
            client,
            provider: cfg.provider,
            model: cfg.resolved_model(),
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature: cfg.temperature,
            max_output_tokens: cfg.resolved_max_output_tokens(),
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn endpoint(&self) -> String {
        match self.provider {
            Provider::Gemini => format!("{}/{}:generateContent", self.base_url, self.model),
            Provider::Openai => format!("{}/chat/completions", self.base_url),
        }
    }

    pub fn gemini_request(&self, query: &str) -> GeminiRequest {
        GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: query.to_string() }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
                top_k: 1,
                top_p: 1.0,
            },
        }
    }

    pub fn openai_request(&self, query: &str) -> OpenAIChatRequest {
        OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![OpenAIChatMessage {
                role: "user".to_string(),
                content: query.to_string(),
            }],
            max_tokens: self.max_output_tokens,
            temperature: self.temperature,
        }
    }

    /// Authenticated POST for one query. Credentials travel in headers only.
    pub fn http_request(&self, query: &str) -> reqwest::RequestBuilder {
        let url = self.endpoint();
        match self.provider {
            Provider::Gemini => self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&self.gemini_request(query)),
            Provider::Openai => self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&self.openai_request(query)),
        }
    }
}

#[async_trait]
impl CompletionGateway for HttpGateway {
    async fn complete(&self, request: &CommandRequest) -> Result<String> {
        let builder = self.http_request(&request.query);
        // Error text reaches the transcript and logs; keep the URL out of it.
        let response = builder.send().await.map_err(|e| {
            let e = e.without_url();
            tracing::warn!(provider = %self.provider, error = %e, "completion request failed");
            unavailable(e.to_string())
        })?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.without_url().to_string()))?;

        let outcome = match self.provider {
            Provider::Gemini => parse_gemini_response(status, &body),
            Provider::Openai => parse_openai_response(status, &body),
        };
        if let Err(e) = &outcome {
            tracing::warn!(provider = %self.provider, status, error = %e, "completion rejected");
        }
        outcome
    }
}

/// Stand-in used when no provider could be configured. Every call fails
/// with the startup reason, so commands degrade into the apology entry.
pub struct UnavailableGateway {
    reason: String,
}

impl UnavailableGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl CompletionGateway for UnavailableGateway {
    async fn complete(&self, _request: &CommandRequest) -> Result<String> {
        Err(unavailable(self.reason.clone()))
    }
}
