//! OpenAI-compatible chat-completions variant: the wire dialect spoken by
//! OpenAI itself and by most hosted/self-hosted gateways (DeepSeek, xAI,
//! Groq, vLLM, ...). Other variants that share the dialect reuse the request
//! shaping and parameter rules defined here.

use super::{EventStream, Provider, ProviderError};
use crate::tags::TagExtractor;
use crate::transport;
use crate::types::*;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

/// Model families that reject the temperature field outright. Prefix match,
/// shared by every OpenAI-compatible variant.
pub const NO_TEMPERATURE_PREFIXES: [&str; 5] = ["o1", "o3", "o4", "gpt-5", "codex-mini"];

/// The DeepSeek-R1 family degenerates at temperature 0; these are the vendor
/// recommended sampling defaults for it.
pub const DEEPSEEK_R1_TEMPERATURE: f64 = 0.6;
pub const DEEPSEEK_R1_TOP_P: f64 = 0.95;

/// Suffix on a configured model id that enables extended reasoning locally;
/// stripped before the id goes on the wire.
pub const THINKING_SUFFIX: &str = ":thinking";

const THINK_TAG: &str = "think";

pub fn allows_temperature(model_id: &str) -> bool {
    !NO_TEMPERATURE_PREFIXES
        .iter()
        .any(|p| model_id.starts_with(p))
}

pub fn is_r1_family(model_id: &str) -> bool {
    let id = model_id.to_ascii_lowercase();
    id.contains("deepseek-r1") || id.contains("deepseek-reasoner")
}

/// Derived sampling parameters for one model id: `(temperature, top_p)`.
/// An explicit setting wins over family defaults, but the denylist wins over
/// everything.
pub fn derive_sampling(model_id: &str, requested: Option<f64>) -> (Option<f64>, Option<f64>) {
    if !allows_temperature(model_id) {
        return (None, None);
    }
    if is_r1_family(model_id) {
        return (
            Some(requested.unwrap_or(DEEPSEEK_R1_TEMPERATURE)),
            Some(DEEPSEEK_R1_TOP_P),
        );
    }
    (Some(requested.unwrap_or(0.0)), None)
}

/// Split a configured model id into (wire id, reasoning enabled).
pub fn split_thinking_suffix(model_id: &str) -> (&str, bool) {
    match model_id.strip_suffix(THINKING_SUFFIX) {
        Some(base) => (base, true),
        None => (model_id, false),
    }
}

pub(crate) fn effort_str(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::Minimal => "minimal",
        ReasoningEffort::Low => "low",
        ReasoningEffort::Medium => "medium",
        ReasoningEffort::High => "high",
    }
}

pub struct OpenAiCompatibleProvider {
    pub name: String,
    base_url: String,
    api_key: Option<String>,
    model_id: String,
    model_info: ModelInfo,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
    reasoning_effort: Option<ReasoningEffort>,
    default_headers: HashMap<String, String>,
    timeout: Duration,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_MODEL: &'static str = "gpt-4.1";

    pub fn from_settings(name: &str, settings: &ProviderSettings) -> Self {
        Self {
            name: name.to_string(),
            base_url: settings
                .base_url
                .as_deref()
                .unwrap_or(Self::DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: settings.api_key.clone(),
            model_id: settings
                .model_id
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            model_info: ModelInfo::default(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            reasoning_effort: settings.reasoning_effort,
            default_headers: settings.headers.clone().unwrap_or_default(),
            timeout: Duration::from_secs(settings.timeout_secs.unwrap_or(120)),
            client: transport::http_client(),
        }
    }

    pub fn with_model_info(mut self, info: ModelInfo) -> Self {
        self.model_info = info;
        self
    }

    fn completions_url(&self) -> String {
        if self.base_url.ends_with("/chat/completions") {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        self.api_key.clone().ok_or_else(|| {
            ProviderError::AuthLoad(format!("API key required for {}", self.name))
        })
    }

    fn build_request(
        &self,
        resolved: &ResolvedModel,
        system_prompt: &str,
        messages: &[RequestMessage],
        stream: bool,
    ) -> ChatRequest {
        ChatRequest {
            model: resolved.id.clone(),
            messages: convert_messages(system_prompt, messages),
            temperature: resolved.temperature,
            top_p: resolved.top_p,
            max_tokens: self.max_tokens.or(Some(resolved.info.max_tokens)),
            stream,
            stream_options: stream.then(|| StreamOptions {
                include_usage: true,
            }),
            reasoning_effort: resolved
                .reasoning
                .as_ref()
                .map(|r| effort_str(r.effort).to_string()),
            enable_thinking: None,
        }
    }

    fn apply_headers(
        &self,
        mut req: reqwest::RequestBuilder,
        api_key: &str,
        metadata: &RequestMetadata,
    ) -> reqwest::RequestBuilder {
        req = req
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key));
        for (k, v) in &self.default_headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(task) = &metadata.task_id {
            req = req.header("X-Task-Id", task.as_str());
        }
        if let Some(org) = &metadata.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }
        req
    }
}

// ---- Wire types (OpenAI chat-completions dialect) ----

#[derive(Serialize)]
pub(crate) struct ChatRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Qwen's reasoning toggle; absent for every other dialect speaker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_thinking: Option<bool>,
}

#[derive(Serialize)]
pub(crate) struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
    /// DeepSeek-style separate reasoning channel.
    reasoning_content: Option<String>,
    /// OpenRouter-style name for the same thing.
    reasoning: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    prompt_tokens_details: Option<PromptTokensDetails>,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Usage mapping for the OpenAI dialect: `prompt_tokens` includes cached
/// tokens, and cache reads live in `prompt_tokens_details.cached_tokens`.
/// Other dialects must define their own mapping rather than reusing this one.
fn map_usage(u: &WireUsage) -> UsageSnapshot {
    UsageSnapshot {
        input_tokens: u.prompt_tokens.unwrap_or(0),
        output_tokens: u.completion_tokens.unwrap_or(0),
        cache_read_tokens: u.prompt_tokens_details.as_ref().and_then(|d| d.cached_tokens),
        cache_write_tokens: None,
        reasoning_tokens: u
            .completion_tokens_details
            .as_ref()
            .and_then(|d| d.reasoning_tokens),
        total_cost: None,
    }
}

pub(crate) fn convert_messages(
    system_prompt: &str,
    messages: &[RequestMessage],
) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(json!({"role": "system", "content": system_prompt}));
    }
    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push(json!({"role": role, "content": content_to_json(&msg.content)}));
    }
    out
}

fn content_to_json(content: &MessageContent) -> serde_json::Value {
    match content {
        MessageContent::Text(t) => json!(t),
        MessageContent::Parts(parts) => {
            if let [ContentPart::Text { text, cache: false }] = parts.as_slice() {
                return json!(text);
            }
            let items: Vec<serde_json::Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text, .. } => json!({"type": "text", "text": text}),
                    ContentPart::Image { data, mime_type } => json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{};base64,{}", mime_type, data)}
                    }),
                })
                .collect();
            json!(items)
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn resolve_model(&self) -> ResolvedModel {
        let (wire_id, thinking) = split_thinking_suffix(&self.model_id);
        let (temperature, top_p) = derive_sampling(wire_id, self.temperature);
        let reasoning = (thinking || self.reasoning_effort.is_some()).then(|| ReasoningConfig {
            effort: self.reasoning_effort.unwrap_or(ReasoningEffort::Medium),
            budget_tokens: None,
        });
        ResolvedModel {
            id: wire_id.to_string(),
            info: self.model_info.clone(),
            reasoning,
            temperature,
            top_p,
        }
    }

    fn stream_completion(
        &self,
        system_prompt: &str,
        messages: &[RequestMessage],
        metadata: &RequestMetadata,
    ) -> EventStream {
        let api_key = match self.api_key() {
            Ok(k) => k,
            Err(e) => return Box::pin(stream::once(async move { Err(e) })),
        };
        let resolved = self.resolve_model();
        let body = self.build_request(&resolved, system_prompt, messages, true);
        let req = self.apply_headers(self.client.post(self.completions_url()), &api_key, metadata);
        let timeout = self.timeout;
        let info = resolved.info.clone();

        let s = async_stream::stream! {
            let resp = match transport::send_with_timeout(req.json(&body), timeout).await {
                Ok(r) => r,
                Err(e) => { yield Err(e); return; }
            };
            if !resp.status().is_success() {
                yield Err(transport::error_for_response(resp).await);
                return;
            }
            let mut inner = sse_event_stream(resp, info);
            while let Some(event) = inner.next().await {
                yield event;
            }
        };
        Box::pin(s)
    }

    fn supports_single_shot(&self) -> bool {
        true
    }

    async fn complete_once(&self, prompt: &str) -> Result<String, ProviderError> {
        let api_key = self.api_key()?;
        let resolved = self.resolve_model();
        let messages = [RequestMessage::user(prompt)];
        let body = self.build_request(&resolved, "", &messages, false);
        let req = self.apply_headers(
            self.client.post(self.completions_url()),
            &api_key,
            &RequestMetadata::default(),
        );

        let resp = transport::send_bounded(req.json(&body), self.timeout).await?;
        if !resp.status().is_success() {
            return Err(transport::error_for_response(resp).await);
        }
        first_choice_text(resp, self.timeout).await
    }
}

fn segment_event(matched: bool, data: String) -> StreamEvent {
    if matched {
        StreamEvent::Reasoning(data)
    } else {
        StreamEvent::Text(data)
    }
}

/// Drive a successful chat-completions SSE response to normalized events.
/// Shared with every variant that speaks this dialect. Assistant text is run
/// through the think-tag extractor; the terminal usage chunk becomes the
/// final `Usage` event with the cost filled in from `info`.
pub(crate) fn sse_event_stream(resp: reqwest::Response, info: ModelInfo) -> EventStream {
    let s = async_stream::stream! {
        let mut lines = transport::SseLineReader::new();
        let mut extractor = TagExtractor::new(THINK_TAG);
        let mut usage: Option<UsageSnapshot> = None;
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield Err(ProviderError::Stream { detail: e.to_string() });
                    return;
                }
            };
            lines.push(&bytes);
            while let Some(line) = lines.next_line() {
                let Some(data) = transport::sse_data(&line) else { continue };
                let chunk: StreamChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping malformed SSE payload");
                        continue;
                    }
                };
                if let Some(u) = &chunk.usage {
                    usage = Some(map_usage(u));
                }
                for choice in &chunk.choices {
                    let Some(delta) = &choice.delta else { continue };
                    if let Some(r) = delta
                        .reasoning_content
                        .as_deref()
                        .or(delta.reasoning.as_deref())
                    {
                        if !r.is_empty() {
                            yield Ok(StreamEvent::Reasoning(r.to_string()));
                        }
                    }
                    if let Some(text) = &delta.content {
                        for seg in extractor.update(text) {
                            yield Ok(segment_event(seg.matched, seg.data));
                        }
                    }
                }
            }
        }

        for seg in extractor.finish() {
            yield Ok(segment_event(seg.matched, seg.data));
        }
        if let Some(mut u) = usage {
            u.total_cost = crate::cost::calculate_cost(&info, &u);
            yield Ok(StreamEvent::Usage(u));
        }
    };
    Box::pin(s)
}

/// Parse a successful non-streaming chat-completions response down to the
/// first choice's text.
pub(crate) async fn first_choice_text(
    resp: reqwest::Response,
    timeout: Duration,
) -> Result<String, ProviderError> {
    let parsed: ChatResponse = transport::read_json(resp, timeout).await?;
    Ok(parsed
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default())
}
