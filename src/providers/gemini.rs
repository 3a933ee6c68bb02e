//! Google Generative Language API variant (API-key auth). Speaks the
//! `generateContent` family of endpoints and is the only variant with a real
//! vendor token-counting endpoint.

use super::{estimate_tokens, EventStream, Provider, ProviderError};
use crate::cost;
use crate::transport;
use crate::types::*;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Thinking-token budget for the 2.5 generation, which takes a numeric
/// budget rather than a level string.
pub fn thinking_budget(effort: ReasoningEffort) -> u64 {
    match effort {
        ReasoningEffort::Minimal => 1024,
        ReasoningEffort::Low => 2048,
        ReasoningEffort::Medium => 8192,
        ReasoningEffort::High => 16384,
    }
}

/// Thinking level for the 3 generation, which only understands "low" and
/// "high".
pub fn thinking_level(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::Minimal | ReasoningEffort::Low => "low",
        ReasoningEffort::Medium | ReasoningEffort::High => "high",
    }
}

/// The 3 generation takes `thinkingLevel` strings; everything earlier takes a
/// numeric `thinkingBudget`. Shared with the Cloud Code Assist variant.
pub(crate) fn uses_thinking_levels(model_id: &str) -> bool {
    model_id.starts_with("gemini-3")
}

pub struct GeminiProvider {
    base_url: String,
    api_key: Option<String>,
    model_id: String,
    model_info: ModelInfo,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
    reasoning_effort: Option<ReasoningEffort>,
    timeout: Duration,
    client: Client,
}

impl GeminiProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self {
            base_url: settings
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: settings.api_key.clone(),
            model_id: settings
                .model_id
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            model_info: ModelInfo {
                context_window: 1_048_576,
                max_tokens: 65_536,
                supports_images: true,
                supports_reasoning: true,
                ..Default::default()
            },
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            reasoning_effort: settings.reasoning_effort,
            timeout: Duration::from_secs(settings.timeout_secs.unwrap_or(120)),
            client: transport::http_client(),
        }
    }

    pub fn with_model_info(mut self, info: ModelInfo) -> Self {
        self.model_info = info;
        self
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        self.api_key
            .clone()
            .ok_or_else(|| ProviderError::AuthLoad("API key required for gemini".into()))
    }

    fn endpoint(&self, model_id: &str, verb: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model_id, verb)
    }

    fn build_request(
        &self,
        resolved: &ResolvedModel,
        system_prompt: &str,
        messages: &[RequestMessage],
    ) -> serde_json::Value {
        let config = generation_config(resolved, self.max_tokens);
        let mut body = json!({
            "contents": convert_contents(messages),
            "generationConfig": config,
        });
        if !system_prompt.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_prompt}]});
        }
        body
    }
}

/// `generationConfig` shaping shared with the Cloud Code Assist variant.
pub(crate) fn generation_config(
    resolved: &ResolvedModel,
    max_tokens_override: Option<u64>,
) -> serde_json::Value {
    let mut config = json!({
        "maxOutputTokens": max_tokens_override.unwrap_or(resolved.info.max_tokens),
    });
    if let Some(t) = resolved.temperature {
        config["temperature"] = json!(t);
    }
    if let Some(p) = resolved.top_p {
        config["topP"] = json!(p);
    }
    if let Some(reasoning) = &resolved.reasoning {
        config["thinkingConfig"] = match reasoning.budget_tokens {
            Some(budget) => json!({"thinkingBudget": budget, "includeThoughts": true}),
            None => json!({
                "thinkingLevel": thinking_level(reasoning.effort),
                "includeThoughts": true,
            }),
        };
    }
    config
}

pub(crate) fn convert_contents(messages: &[RequestMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            // The API has no system role inside `contents`; anything that is
            // not from the model counts as user input.
            let role = match msg.role {
                Role::Assistant => "model",
                _ => "user",
            };
            json!({"role": role, "parts": content_to_parts(&msg.content)})
        })
        .collect()
}

fn content_to_parts(content: &MessageContent) -> Vec<serde_json::Value> {
    match content {
        MessageContent::Text(t) => vec![json!({"text": t})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text, .. } => json!({"text": text}),
                ContentPart::Image { data, mime_type } => {
                    json!({"inlineData": {"mimeType": mime_type, "data": data}})
                }
            })
            .collect(),
    }
}

// ---- Wire response types ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateChunk {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    pub content: Option<CandidateContent>,
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize)]
pub(crate) struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
pub(crate) struct ResponsePart {
    pub text: Option<String>,
    #[serde(default)]
    pub thought: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize)]
pub(crate) struct GroundingChunk {
    pub web: Option<WebSource>,
}

#[derive(Deserialize)]
pub(crate) struct WebSource {
    pub uri: Option<String>,
    pub title: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageMetadata {
    pub prompt_token_count: Option<u64>,
    pub candidates_token_count: Option<u64>,
    pub cached_content_token_count: Option<u64>,
    pub thoughts_token_count: Option<u64>,
}

/// Usage mapping for the Gemini dialect: `promptTokenCount` already includes
/// cached tokens, so the cached count goes into `cache_read_tokens` untouched.
pub(crate) fn map_usage(u: &UsageMetadata) -> UsageSnapshot {
    UsageSnapshot {
        input_tokens: u.prompt_token_count.unwrap_or(0),
        output_tokens: u.candidates_token_count.unwrap_or(0),
        cache_read_tokens: u.cached_content_token_count,
        cache_write_tokens: None,
        reasoning_tokens: u.thoughts_token_count,
        total_cost: None,
    }
}

pub(crate) fn grounding_sources(meta: &GroundingMetadata) -> Vec<GroundingSource> {
    meta.grounding_chunks
        .iter()
        .filter_map(|c| c.web.as_ref())
        .filter_map(|w| {
            let url = w.uri.clone()?;
            Some(GroundingSource {
                title: w.title.clone().unwrap_or_else(|| url.clone()),
                url,
            })
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    total_tokens: u64,
}

#[async_trait]
impl Provider for GeminiProvider {
    fn resolve_model(&self) -> ResolvedModel {
        let (wire_id, thinking) =
            super::openai_compatible::split_thinking_suffix(&self.model_id);
        let reasoning = (thinking || self.reasoning_effort.is_some()).then(|| {
            let effort = self.reasoning_effort.unwrap_or(ReasoningEffort::Medium);
            ReasoningConfig {
                effort,
                budget_tokens: (!uses_thinking_levels(wire_id))
                    .then(|| thinking_budget(effort)),
            }
        });
        ResolvedModel {
            id: wire_id.to_string(),
            info: self.model_info.clone(),
            reasoning,
            temperature: Some(self.temperature.unwrap_or(0.0)),
            top_p: None,
        }
    }

    fn stream_completion(
        &self,
        system_prompt: &str,
        messages: &[RequestMessage],
        _metadata: &RequestMetadata,
    ) -> EventStream {
        let api_key = match self.api_key() {
            Ok(k) => k,
            Err(e) => return Box::pin(stream::once(async move { Err(e) })),
        };
        let resolved = self.resolve_model();
        let body = self.build_request(&resolved, system_prompt, messages);
        let req = self
            .client
            .post(self.endpoint(&resolved.id, "streamGenerateContent"))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", api_key)
            .json(&body);
        let timeout = self.timeout;
        let info = resolved.info.clone();

        let s = async_stream::stream! {
            let resp = match transport::send_with_timeout(req, timeout).await {
                Ok(r) => r,
                Err(e) => { yield Err(e); return; }
            };
            if !resp.status().is_success() {
                yield Err(transport::error_for_response(resp).await);
                return;
            }

            let mut lines = transport::SseLineReader::new();
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
                    let chunk: GenerateChunk = match serde_json::from_str(data) {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::debug!(error = %e, "skipping malformed SSE payload");
                            continue;
                        }
                    };
                    if let Some(u) = &chunk.usage_metadata {
                        usage = Some(map_usage(u));
                    }
                    for candidate in &chunk.candidates {
                        if let Some(content) = &candidate.content {
                            for part in &content.parts {
                                let Some(text) = &part.text else { continue };
                                if text.is_empty() {
                                    continue;
                                }
                                yield Ok(if part.thought {
                                    StreamEvent::Reasoning(text.clone())
                                } else {
                                    StreamEvent::Text(text.clone())
                                });
                            }
                        }
                        if let Some(meta) = &candidate.grounding_metadata {
                            let sources = grounding_sources(meta);
                            if !sources.is_empty() {
                                yield Ok(StreamEvent::Grounding { sources });
                            }
                        }
                    }
                }
            }

            if let Some(mut u) = usage {
                u.total_cost = cost::calculate_cost(&info, &u);
                yield Ok(StreamEvent::Usage(u));
            }
        };
        Box::pin(s)
    }

    fn supports_single_shot(&self) -> bool {
        true
    }

    fn supports_token_counting(&self) -> bool {
        true
    }

    async fn complete_once(&self, prompt: &str) -> Result<String, ProviderError> {
        let api_key = self.api_key()?;
        let resolved = self.resolve_model();
        let messages = [RequestMessage::user(prompt)];
        let body = self.build_request(&resolved, "", &messages);
        let req = self
            .client
            .post(self.endpoint(&resolved.id, "generateContent"))
            .header("x-goog-api-key", api_key)
            .json(&body);

        let resp = transport::send_bounded(req, self.timeout).await?;
        if !resp.status().is_success() {
            return Err(transport::error_for_response(resp).await);
        }
        let parsed: GenerateChunk = transport::read_json(resp, self.timeout).await?;
        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter(|p| !p.thought)
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default();
        Ok(text)
    }

    /// Vendor count via `:countTokens`, falling back to the local estimate on
    /// any failure.
    async fn count_tokens(&self, content: &[ContentPart]) -> usize {
        let fallback = estimate_tokens(content);
        let Ok(api_key) = self.api_key() else {
            return fallback;
        };
        let resolved = self.resolve_model();
        let parts: Vec<serde_json::Value> = content
            .iter()
            .map(|p| match p {
                ContentPart::Text { text, .. } => json!({"text": text}),
                ContentPart::Image { data, mime_type } => {
                    json!({"inlineData": {"mimeType": mime_type, "data": data}})
                }
            })
            .collect();
        let body = json!({"contents": [{"role": "user", "parts": parts}]});
        let req = self
            .client
            .post(self.endpoint(&resolved.id, "countTokens"))
            .header("x-goog-api-key", api_key)
            .json(&body);

        let result: Result<CountTokensResponse, ProviderError> = async {
            let resp = transport::send_bounded(req, self.timeout).await?;
            if !resp.status().is_success() {
                return Err(transport::error_for_response(resp).await);
            }
            transport::read_json(resp, self.timeout).await
        }
        .await;

        match result {
            Ok(counted) => counted.total_tokens as usize,
            Err(e) => {
                tracing::debug!(error = %e, "countTokens failed; using local estimate");
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_mapping_is_monotonic() {
        assert_eq!(thinking_budget(ReasoningEffort::Minimal), 1024);
        assert_eq!(thinking_budget(ReasoningEffort::Low), 2048);
        assert_eq!(thinking_budget(ReasoningEffort::Medium), 8192);
        assert_eq!(thinking_budget(ReasoningEffort::High), 16384);
    }

    #[test]
    fn generation_picks_budget_or_level() {
        assert!(!uses_thinking_levels("gemini-2.5-pro"));
        assert!(uses_thinking_levels("gemini-3-flash"));
        assert_eq!(thinking_level(ReasoningEffort::Low), "low");
        assert_eq!(thinking_level(ReasoningEffort::High), "high");
    }

    fn provider(model: &str, effort: Option<ReasoningEffort>) -> GeminiProvider {
        GeminiProvider::from_settings(&ProviderSettings {
            provider: "gemini".into(),
            model_id: Some(model.into()),
            api_key: Some("AIzaTest".into()),
            reasoning_effort: effort,
            ..Default::default()
        })
    }

    #[test]
    fn resolve_sets_budget_for_25_generation() {
        let resolved = provider("gemini-2.5-pro", Some(ReasoningEffort::High)).resolve_model();
        let reasoning = resolved.reasoning.unwrap();
        assert_eq!(reasoning.budget_tokens, Some(16384));
    }

    #[test]
    fn resolve_uses_levels_for_3_generation() {
        let resolved = provider("gemini-3-flash", Some(ReasoningEffort::High)).resolve_model();
        let reasoning = resolved.reasoning.unwrap();
        assert_eq!(reasoning.budget_tokens, None);
    }

    #[test]
    fn request_places_thinking_config() {
        let p = provider("gemini-2.5-pro", Some(ReasoningEffort::Low));
        let resolved = p.resolve_model();
        let body = p.build_request(&resolved, "sys", &[RequestMessage::user("hi")]);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            2048
        );
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");

        let p = provider("gemini-3-flash", Some(ReasoningEffort::Low));
        let resolved = p.resolve_model();
        let body = p.build_request(&resolved, "", &[RequestMessage::user("hi")]);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingLevel"],
            "low"
        );
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn assistant_turns_map_to_model_role() {
        let wire = convert_contents(&[
            RequestMessage::user("q"),
            RequestMessage::assistant("a"),
        ]);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[1]["role"], "model");
    }

    #[test]
    fn grounding_sources_skip_chunks_without_url() {
        let meta: GroundingMetadata = serde_json::from_str(
            r#"{"groundingChunks": [
                {"web": {"uri": "https://a.example", "title": "A"}},
                {"web": {"title": "no url"}},
                {}
            ]}"#,
        )
        .unwrap();
        let sources = grounding_sources(&meta);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].url, "https://a.example");
    }

    #[test]
    fn usage_mapping_keeps_cached_inside_prompt_count() {
        let u: UsageMetadata = serde_json::from_str(
            r#"{
                "promptTokenCount": 1000,
                "candidatesTokenCount": 50,
                "cachedContentTokenCount": 800,
                "thoughtsTokenCount": 20
            }"#,
        )
        .unwrap();
        let snap = map_usage(&u);
        assert_eq!(snap.input_tokens, 1000);
        assert_eq!(snap.cache_read_tokens, Some(800));
        assert_eq!(snap.reasoning_tokens, Some(20));
    }

    #[test]
    fn thought_parts_marked() {
        let chunk: GenerateChunk = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [
                {"text": "planning", "thought": true},
                {"text": "answer"}
            ]}}]}"#,
        )
        .unwrap();
        let parts = &chunk.candidates[0].content.as_ref().unwrap().parts;
        assert!(parts[0].thought);
        assert!(!parts[1].thought);
    }
}
