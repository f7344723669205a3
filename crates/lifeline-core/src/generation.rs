//! ============================================================================
//! Text Generation Seam - quiet generation & per-feature model routes
//! ============================================================================
//! "Quiet" generation produces text that is never rendered as a visible turn
//! unless a caller explicitly appends it. The HTTP service speaks the
//! chat-completions dialect against a closed set of providers; there are no
//! string-keyed provider maps, the enum is the registry.
//! ============================================================================

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-request timeout; a timed-out generation is a generation failure, never
/// a fatal error
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Supported generation backends. Closed union: adding a provider means
/// extending every match below, enforced at compile time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Grok,
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Grok,
        Provider::Ollama,
    ];

    /// Chat-completions endpoint for the provider
    pub fn endpoint(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1/chat/completions",
            Provider::Anthropic => "https://api.anthropic.com/v1/chat/completions",
            Provider::Gemini => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
            }
            Provider::Grok => "https://api.x.ai/v1/chat/completions",
            Provider::Ollama => "http://127.0.0.1:11434/v1/chat/completions",
        }
    }

    /// Host settings field that stores the model override for this provider
    pub fn settings_key(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai_model",
            Provider::Anthropic => "anthropic_model",
            Provider::Gemini => "gemini_model",
            Provider::Grok => "grok_model",
            Provider::Ollama => "ollama_model",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Anthropic => "claude-3-5-haiku-latest",
            Provider::Gemini => "gemini-2.0-flash",
            Provider::Grok => "grok-3-mini",
            Provider::Ollama => "llama3.2",
        }
    }
}

/// A provider plus concrete model, used for per-feature overrides (e.g. a
/// dedicated summarization route)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationRoute {
    pub provider: Provider,
    pub model: String,
}

impl GenerationRoute {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            model: provider.default_model().to_string(),
        }
    }
}

/// Opaque text-completion capability. No side effects on the transcript.
#[async_trait]
pub trait TextGenerationService: Send + Sync {
    /// Generate on the host's default route. `speaker` names the voice the
    /// output should be written in.
    async fn quiet_generate(&self, instruction: &str, speaker: &str) -> Result<String>;

    /// Generate on an explicit route, bypassing the default
    async fn raw_generate(&self, prompt: &str, route: &GenerationRoute) -> Result<String>;
}

// ============================================================================
// HTTP chat-completions implementation
// ============================================================================

/// Chat-completions client for the providers in [`Provider`]
pub struct HttpTextService {
    client: reqwest::Client,
    api_key: String,
    default_route: GenerationRoute,
}

impl HttpTextService {
    pub fn new(api_key: String, default_route: GenerationRoute) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            default_route,
        }
    }

    async fn call_api(&self, route: &GenerationRoute, prompt: &str) -> Result<String> {
        debug!(
            "Calling {:?} ({}) with {} chars",
            route.provider,
            route.model,
            prompt.len()
        );

        let request = ChatRequest {
            model: route.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: Some(0.7),
            max_tokens: Some(1024),
        };

        let response = self
            .client
            .post(route.provider.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call generation API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Generation API error {}: {}", status, body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse API response: {}", e))?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow!("No response from API"))
    }
}

#[async_trait]
impl TextGenerationService for HttpTextService {
    async fn quiet_generate(&self, instruction: &str, speaker: &str) -> Result<String> {
        let prompt = format!(
            "{}\n\nWrite the response in the voice of {}. Output only the text itself, \
            no stage directions or quotation marks.",
            instruction, speaker
        );
        self.call_api(&self.default_route, &prompt).await
    }

    async fn raw_generate(&self, prompt: &str, route: &GenerationRoute) -> Result<String> {
        self.call_api(route, prompt).await
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

// ============================================================================
// Scripted implementation for tests
// ============================================================================

/// Replays a fixed queue of replies and records every request it saw.
/// An exhausted queue yields an error, which exercises the degraded paths.
#[cfg(test)]
#[derive(Default)]
pub struct ScriptedService {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<String, String>>>,
    requests: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, reply: &str) {
        self.replies
            .lock()
            .expect("lock")
            .push_back(Ok(reply.to_string()));
    }

    pub fn push_err(&self, message: &str) {
        self.replies
            .lock()
            .expect("lock")
            .push_back(Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("lock").clone()
    }

    fn next(&self, request: &str) -> Result<String> {
        self.requests
            .lock()
            .expect("lock")
            .push(request.to_string());
        match self.replies.lock().expect("lock").pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!("{}", message)),
            None => Err(anyhow!("no scripted reply left")),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl TextGenerationService for ScriptedService {
    async fn quiet_generate(&self, instruction: &str, _speaker: &str) -> Result<String> {
        self.next(instruction)
    }

    async fn raw_generate(&self, prompt: &str, _route: &GenerationRoute) -> Result<String> {
        self.next(prompt)
    }
}
