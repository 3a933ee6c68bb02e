//! Cloud Code Assist variant ("Gemini CLI" auth): the same Gemini wire
//! semantics as the API-key variant, but behind the OAuth-gated
//! `cloudcode-pa` endpoint. Requests carry the credential's Google Cloud
//! project id, and a 401 is answered with exactly one refresh-and-retry.

use super::gemini::{
    self, generation_config, grounding_sources, GenerateChunk,
};
use super::openai_compatible::split_thinking_suffix;
use super::{EventStream, Provider, ProviderError};
use crate::auth::gemini_cli::GeminiCliExchanger;
use crate::auth::{AuthManager, CredentialStore, Credentials};
use crate::cost;
use crate::transport;
use crate::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const ENDPOINT: &str = "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const CLIENT_METADATA: &str = "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI";

pub struct GeminiCliProvider {
    auth: AuthManager,
    model_id: String,
    model_info: ModelInfo,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
    reasoning_effort: Option<ReasoningEffort>,
    timeout: Duration,
    client: Client,
}

impl GeminiCliProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let store = match &settings.credentials_path {
            Some(path) => CredentialStore::new(path.clone()),
            None => CredentialStore::default_for("gemini-cli"),
        };
        Self {
            auth: AuthManager::new(store, Arc::new(GeminiCliExchanger::new())),
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
}

/// Cloud Code wraps each SSE payload in a `response` envelope.
#[derive(Deserialize)]
struct CloudChunk {
    response: Option<GenerateChunk>,
}

fn build_body(
    resolved: &ResolvedModel,
    system_prompt: &str,
    messages: &[RequestMessage],
    max_tokens: Option<u64>,
    project_id: &str,
) -> serde_json::Value {
    let mut request = json!({
        "contents": gemini::convert_contents(messages),
        "generationConfig": generation_config(resolved, max_tokens),
    });
    if !system_prompt.is_empty() {
        request["systemInstruction"] = json!({"parts": [{"text": system_prompt}]});
    }
    json!({
        "model": resolved.id,
        "project": project_id,
        "user_prompt_id": uuid::Uuid::new_v4().to_string(),
        "request": request,
    })
}

fn authed_request(
    client: &Client,
    credentials: &Credentials,
    body: &serde_json::Value,
) -> reqwest::RequestBuilder {
    client
        .post(ENDPOINT)
        .query(&[("alt", "sse")])
        .header(
            "Authorization",
            format!("{} {}", credentials.token_type, credentials.access_token),
        )
        .header("Client-Metadata", CLIENT_METADATA)
        .json(body)
}

#[async_trait]
impl Provider for GeminiCliProvider {
    fn resolve_model(&self) -> ResolvedModel {
        let (wire_id, thinking) = split_thinking_suffix(&self.model_id);
        let reasoning = (thinking || self.reasoning_effort.is_some()).then(|| {
            let effort = self.reasoning_effort.unwrap_or(ReasoningEffort::Medium);
            ReasoningConfig {
                effort,
                budget_tokens: (!gemini::uses_thinking_levels(wire_id))
                    .then(|| gemini::thinking_budget(effort)),
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
        let auth = self.auth.clone();
        let client = self.client.clone();
        let resolved = self.resolve_model();
        let system_prompt = system_prompt.to_string();
        let messages = messages.to_vec();
        let max_tokens = self.max_tokens;
        let timeout = self.timeout;
        let info = resolved.info.clone();

        let s = async_stream::stream! {
            let sent = super::send_authorized(&auth, timeout, |credentials| {
                let project_id = credentials.extra_str("project_id").ok_or_else(|| {
                    ProviderError::AuthLoad("credentials are missing a project_id".into())
                })?;
                let body = build_body(
                    &resolved, &system_prompt, &messages, max_tokens, project_id,
                );
                Ok(authed_request(&client, credentials, &body))
            })
            .await;
            let resp = match sent {
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
                    let envelope: CloudChunk = match serde_json::from_str(data) {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::debug!(error = %e, "skipping malformed SSE payload");
                            continue;
                        }
                    };
                    let Some(chunk) = envelope.response else { continue };
                    if let Some(u) = &chunk.usage_metadata {
                        usage = Some(gemini::map_usage(u));
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
}
