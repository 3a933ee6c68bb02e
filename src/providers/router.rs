//! Gateway variant for OpenRouter-style model routers: one API key fronting
//! many upstream models, with a live catalog instead of static metadata.
//! Model resolution reads the injected catalog cache synchronously and falls
//! back to a pinned default model when the catalog has nothing better.

use super::openai_compatible::{derive_sampling, effort_str, first_choice_text, split_thinking_suffix};
use super::{EventStream, Provider, ProviderError};
use crate::catalog::{cache_key, CatalogCache};
use crate::cost;
use crate::transport;
use crate::types::*;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

fn default_model_info() -> ModelInfo {
    ModelInfo {
        context_window: 200_000,
        max_tokens: 8192,
        supports_images: true,
        supports_prompt_cache: true,
        pricing: ModelPricing {
            input: Some(3.0),
            output: Some(15.0),
            cache_read: Some(0.3),
            cache_write: Some(3.75),
        },
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct RouterProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model_id: String,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
    reasoning_effort: Option<ReasoningEffort>,
    timeout: Duration,
    client: Client,
    catalog: CatalogCache,
}

impl RouterProvider {
    pub fn from_settings(name: &str, settings: &ProviderSettings, catalog: CatalogCache) -> Self {
        Self {
            name: name.to_string(),
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
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            reasoning_effort: settings.reasoning_effort,
            timeout: Duration::from_secs(settings.timeout_secs.unwrap_or(120)),
            client: transport::http_client(),
            catalog,
        }
    }

    fn cache_scope(&self) -> String {
        cache_key(
            &self.name,
            &self.base_url,
            self.api_key.as_deref().unwrap_or(""),
        )
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        self.api_key.clone().ok_or_else(|| {
            ProviderError::AuthLoad(format!("API key required for {}", self.name))
        })
    }

    /// Catalog for this provider scope, fetching through the shared cache.
    /// Never fails; degraded results are stale or empty.
    pub async fn models(&self) -> Arc<ModelCatalog> {
        let client = self.client.clone();
        let url = format!("{}/models", self.base_url);
        let api_key = self.api_key.clone().unwrap_or_default();
        let timeout = self.timeout;
        self.catalog
            .get_models(&self.cache_scope(), move || {
                async move {
                    let req = client.get(url).bearer_auth(api_key);
                    let resp = transport::send_bounded(req, timeout).await?;
                    if !resp.status().is_success() {
                        return Err(transport::error_for_response(resp).await);
                    }
                    let body: ModelsResponse = transport::read_json(resp, timeout).await?;
                    Ok(Arc::new(parse_catalog(&body)))
                }
                .boxed()
            })
            .await
    }

    /// Per-endpoint metadata for one model id, for routers that serve the
    /// same model through several backends.
    pub async fn endpoints(&self, model_id: &str) -> Arc<Vec<ModelEndpoint>> {
        let client = self.client.clone();
        let url = format!("{}/models/{}/endpoints", self.base_url, model_id);
        let api_key = self.api_key.clone().unwrap_or_default();
        let timeout = self.timeout;
        self.catalog
            .get_endpoints(&self.cache_scope(), model_id, move || {
                async move {
                    let req = client.get(url).bearer_auth(api_key);
                    let resp = transport::send_bounded(req, timeout).await?;
                    if !resp.status().is_success() {
                        return Err(transport::error_for_response(resp).await);
                    }
                    let body: EndpointsResponse = transport::read_json(resp, timeout).await?;
                    Ok(Arc::new(parse_endpoints(&body)))
                }
                .boxed()
            })
            .await
    }

    fn build_body(
        &self,
        resolved: &ResolvedModel,
        system_prompt: &str,
        messages: &[RequestMessage],
        stream: bool,
    ) -> serde_json::Value {
        let mut messages = messages.to_vec();
        if resolved.info.supports_prompt_cache {
            cost::apply_cache_breakpoints(&mut messages);
        }

        let mut body = json!({
            "model": resolved.id,
            "messages": convert_messages_cached(
                system_prompt,
                &messages,
                resolved.info.supports_prompt_cache,
            ),
            "max_tokens": self.max_tokens.unwrap_or(resolved.info.max_tokens),
            "stream": stream,
            "usage": {"include": true},
        });
        if let Some(t) = resolved.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = resolved.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(reasoning) = &resolved.reasoning {
            body["reasoning"] = json!({"effort": effort_str(reasoning.effort)});
        }
        body
    }

    fn request(
        &self,
        api_key: &str,
        body: &serde_json::Value,
        metadata: &RequestMetadata,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .bearer_auth(api_key)
            .json(body);
        if let Some(task) = &metadata.task_id {
            req = req.header("X-Task-Id", task.as_str());
        }
        if let Some(org) = &metadata.organization {
            req = req.header("X-Organization", org.as_str());
        }
        req
    }
}

/// Wire conversion that keeps cache markers: marked text parts carry the
/// `cache_control` annotation routers forward to caching-capable upstreams.
fn convert_messages_cached(
    system_prompt: &str,
    messages: &[RequestMessage],
    cache_system: bool,
) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(if cache_system {
            json!({"role": "system", "content": [{
                "type": "text",
                "text": system_prompt,
                "cache_control": {"type": "ephemeral"},
            }]})
        } else {
            json!({"role": "system", "content": system_prompt})
        });
    }
    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = match &msg.content {
            MessageContent::Text(t) => json!(t),
            MessageContent::Parts(parts) => json!(parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text, cache: false } =>
                        json!({"type": "text", "text": text}),
                    ContentPart::Text { text, cache: true } => json!({
                        "type": "text",
                        "text": text,
                        "cache_control": {"type": "ephemeral"},
                    }),
                    ContentPart::Image { data, mime_type } => json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{};base64,{}", mime_type, data)}
                    }),
                })
                .collect::<Vec<_>>()),
        };
        out.push(json!({"role": role, "content": content}));
    }
    out
}

// ---- Catalog wire types ----

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    context_length: Option<u64>,
    top_provider: Option<TopProvider>,
    architecture: Option<Architecture>,
    pricing: Option<WirePricing>,
    #[serde(default)]
    supported_parameters: Vec<String>,
}

#[derive(Deserialize)]
struct TopProvider {
    max_completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct Architecture {
    #[serde(default)]
    input_modalities: Vec<String>,
}

/// Router prices come as per-token decimal strings.
#[derive(Deserialize)]
struct WirePricing {
    prompt: Option<String>,
    completion: Option<String>,
    input_cache_read: Option<String>,
    input_cache_write: Option<String>,
}

#[derive(Deserialize)]
struct EndpointsResponse {
    data: Option<EndpointsData>,
}

#[derive(Deserialize)]
struct EndpointsData {
    #[serde(default)]
    endpoints: Vec<EndpointEntry>,
}

#[derive(Deserialize)]
struct EndpointEntry {
    provider_name: String,
    context_length: Option<u64>,
    max_completion_tokens: Option<u64>,
    pricing: Option<WirePricing>,
}

fn per_million(price: Option<&String>) -> Option<f64> {
    let per_token: f64 = price?.parse().ok()?;
    Some(per_token * 1_000_000.0)
}

fn wire_pricing(pricing: Option<&WirePricing>) -> ModelPricing {
    match pricing {
        Some(p) => ModelPricing {
            input: per_million(p.prompt.as_ref()),
            output: per_million(p.completion.as_ref()),
            cache_read: per_million(p.input_cache_read.as_ref()),
            cache_write: per_million(p.input_cache_write.as_ref()),
        },
        None => ModelPricing::default(),
    }
}

fn parse_catalog(body: &ModelsResponse) -> ModelCatalog {
    let defaults = ModelInfo::default();
    body.data
        .iter()
        .map(|entry| {
            let pricing = wire_pricing(entry.pricing.as_ref());
            let info = ModelInfo {
                context_window: entry.context_length.unwrap_or(defaults.context_window),
                max_tokens: entry
                    .top_provider
                    .as_ref()
                    .and_then(|t| t.max_completion_tokens)
                    .unwrap_or(defaults.max_tokens),
                supports_images: entry
                    .architecture
                    .as_ref()
                    .is_some_and(|a| a.input_modalities.iter().any(|m| m == "image")),
                supports_prompt_cache: pricing.cache_read.is_some(),
                supports_computer_use: false,
                supports_reasoning: entry
                    .supported_parameters
                    .iter()
                    .any(|p| p == "reasoning" || p == "include_reasoning"),
                pricing,
                tiers: Vec::new(),
            };
            (entry.id.clone(), info)
        })
        .collect()
}

fn parse_endpoints(body: &EndpointsResponse) -> Vec<ModelEndpoint> {
    let defaults = ModelInfo::default();
    body.data
        .as_ref()
        .map(|d| d.endpoints.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|e| {
            let pricing = wire_pricing(e.pricing.as_ref());
            ModelEndpoint {
                name: e.provider_name.clone(),
                info: ModelInfo {
                    context_window: e.context_length.unwrap_or(defaults.context_window),
                    max_tokens: e.max_completion_tokens.unwrap_or(defaults.max_tokens),
                    supports_prompt_cache: pricing.cache_read.is_some(),
                    pricing,
                    ..ModelInfo::default()
                },
            }
        })
        .collect()
}

#[async_trait]
impl Provider for RouterProvider {
    /// Resolution is synchronous: it reads whatever catalog snapshot the
    /// cache currently holds. An id the catalog does not know collapses to
    /// the pinned default model.
    fn resolve_model(&self) -> ResolvedModel {
        let (wire_id, thinking) = split_thinking_suffix(&self.model_id);
        let cached = self
            .catalog
            .peek_models(&self.cache_scope())
            .and_then(|catalog| catalog.get(wire_id).cloned());
        let (id, info) = match cached {
            Some(info) => (wire_id.to_string(), info),
            None => (DEFAULT_MODEL.to_string(), default_model_info()),
        };

        // Parameter rules key off the upstream slug, not the vendor prefix.
        let slug = id.rsplit('/').next().unwrap_or(&id);
        let (temperature, top_p) = derive_sampling(slug, self.temperature);
        let reasoning = (thinking || self.reasoning_effort.is_some()).then(|| ReasoningConfig {
            effort: self.reasoning_effort.unwrap_or(ReasoningEffort::Medium),
            budget_tokens: None,
        });
        ResolvedModel {
            id,
            info,
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
            Err(e) => return Box::pin(futures::stream::once(async move { Err(e) })),
        };
        let this = self.clone();
        let system_prompt = system_prompt.to_string();
        let messages = messages.to_vec();
        let metadata = metadata.clone();

        let s = async_stream::stream! {
            // Warm the catalog before resolving, so the first request already
            // sees real metadata. Fetch failures degrade inside the cache.
            this.models().await;
            let resolved = this.resolve_model();
            let body = this.build_body(&resolved, &system_prompt, &messages, true);
            let req = this.request(&api_key, &body, &metadata);
            let info = resolved.info;

            let resp = match transport::send_with_timeout(req, this.timeout).await {
                Ok(r) => r,
                Err(e) => { yield Err(e); return; }
            };
            if !resp.status().is_success() {
                yield Err(transport::error_for_response(resp).await);
                return;
            }
            let mut inner = super::openai_compatible::sse_event_stream(resp, info);
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
        self.models().await;
        let resolved = self.resolve_model();
        let messages = [RequestMessage::user(prompt)];
        let body = self.build_body(&resolved, "", &messages, false);
        let req = self.request(&api_key, &body, &RequestMetadata::default());

        let resp = transport::send_bounded(req, self.timeout).await?;
        if !resp.status().is_success() {
            return Err(transport::error_for_response(resp).await);
        }
        first_choice_text(resp, self.timeout).await
    }

    async fn refresh_models(&self) -> Arc<ModelCatalog> {
        self.models().await
    }
}
