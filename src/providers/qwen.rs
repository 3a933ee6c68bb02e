//! Qwen portal variant: OpenAI-compatible wire dialect behind OAuth device
//! tokens. The API host comes from the credential's `resource_url`, and a 401
//! gets exactly one refresh-and-retry.

use super::openai_compatible::{
    self, convert_messages, derive_sampling, effort_str, first_choice_text,
    split_thinking_suffix, ChatRequest, StreamOptions,
};
use super::{EventStream, Provider, ProviderError};
use crate::auth::qwen::{api_base_url, QwenExchanger};
use crate::auth::{AuthManager, CredentialStore, Credentials};
use crate::transport;
use crate::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MODEL: &str = "qwen3-coder-plus";

pub struct QwenProvider {
    auth: AuthManager,
    model_id: String,
    model_info: ModelInfo,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
    reasoning_effort: Option<ReasoningEffort>,
    timeout: Duration,
    client: Client,
}

impl QwenProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let store = match &settings.credentials_path {
            Some(path) => CredentialStore::new(path.clone()),
            None => CredentialStore::default_for("qwen"),
        };
        Self {
            auth: AuthManager::new(store, Arc::new(QwenExchanger::new())),
            model_id: settings
                .model_id
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            model_info: ModelInfo {
                context_window: 262_144,
                max_tokens: 65_536,
                ..Default::default()
            },
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            reasoning_effort: settings.reasoning_effort,
            timeout: Duration::from_secs(settings.timeout_secs.unwrap_or(120)),
            client: transport::http_client(),
        }
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
            enable_thinking: Some(resolved.reasoning.is_some()),
        }
    }
}

fn completions_request(
    client: &Client,
    credentials: &Credentials,
    body: &ChatRequest,
) -> reqwest::RequestBuilder {
    let url = format!("{}/chat/completions", api_base_url(credentials));
    client
        .post(url)
        .header("Content-Type", "application/json")
        .header(
            "Authorization",
            format!("{} {}", credentials.token_type, credentials.access_token),
        )
        .json(body)
}

#[async_trait]
impl Provider for QwenProvider {
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
        _metadata: &RequestMetadata,
    ) -> EventStream {
        let auth = self.auth.clone();
        let client = self.client.clone();
        let resolved = self.resolve_model();
        let body = self.build_request(&resolved, system_prompt, messages, true);
        let timeout = self.timeout;
        let info = resolved.info.clone();

        let s = async_stream::stream! {
            let sent = super::send_authorized(&auth, timeout, |credentials| {
                Ok(completions_request(&client, credentials, &body))
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

            let mut inner = openai_compatible::sse_event_stream(resp, info);
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
        let resolved = self.resolve_model();
        let messages = [RequestMessage::user(prompt)];
        let body = self.build_request(&resolved, "", &messages, false);

        let resp = super::send_authorized(&self.auth, self.timeout, |credentials| {
            Ok(completions_request(&self.client, credentials, &body).timeout(self.timeout))
        })
        .await?;
        if !resp.status().is_success() {
            return Err(transport::error_for_response(resp).await);
        }
        first_choice_text(resp, self.timeout).await
    }
}
