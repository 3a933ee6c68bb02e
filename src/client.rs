//! Variant selection and dispatch. The host hands over one
//! `ProviderSettings`; everything after that goes through the `Provider`
//! trait object built here.

use crate::catalog::CatalogCache;
use crate::providers::gemini::GeminiProvider;
use crate::providers::gemini_cli::GeminiCliProvider;
use crate::providers::openai_compatible::OpenAiCompatibleProvider;
use crate::providers::qwen::QwenProvider;
use crate::providers::router::RouterProvider;
use crate::providers::{EventStream, Provider, ProviderError};
use crate::types::*;
use std::sync::Arc;

/// One configured provider instance. Cheap to clone; clones share the
/// underlying provider and catalog cache.
#[derive(Clone)]
pub struct Client {
    provider: Arc<dyn Provider>,
    provider_name: String,
    catalog: CatalogCache,
}

impl Client {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        Self::with_catalog(settings, CatalogCache::new())
    }

    /// Build a client around an existing catalog cache, so several clients
    /// (or rebuilt ones after a settings change) share fetched catalogs.
    pub fn with_catalog(
        settings: &ProviderSettings,
        catalog: CatalogCache,
    ) -> Result<Self, ProviderError> {
        if let Some(base) = &settings.base_url {
            url::Url::parse(base).map_err(|e| {
                ProviderError::Other(format!("invalid base_url {base}: {e}"))
            })?;
        }

        let name = settings.provider.as_str();
        let provider: Arc<dyn Provider> = match name {
            "openai" | "deepseek" | "xai" | "openai-compatible" => {
                Arc::new(OpenAiCompatibleProvider::from_settings(name, settings))
            }
            "gemini" => Arc::new(GeminiProvider::from_settings(settings)),
            "gemini-cli" => Arc::new(GeminiCliProvider::from_settings(settings)),
            "qwen" | "qwen-portal" => Arc::new(QwenProvider::from_settings(settings)),
            "openrouter" => Arc::new(RouterProvider::from_settings(
                name,
                settings,
                catalog.clone(),
            )),
            other => {
                return Err(ProviderError::Other(format!(
                    "unknown provider: {other}"
                )))
            }
        };
        Ok(Self {
            provider,
            provider_name: name.to_string(),
            catalog,
        })
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn catalog(&self) -> &CatalogCache {
        &self.catalog
    }

    /// The model the next request will use, with its derived parameters.
    pub fn model(&self) -> ResolvedModel {
        self.provider.resolve_model()
    }

    pub fn supports_single_shot(&self) -> bool {
        self.provider.supports_single_shot()
    }

    pub fn supports_token_counting(&self) -> bool {
        self.provider.supports_token_counting()
    }

    pub fn stream_completion(
        &self,
        system_prompt: &str,
        messages: &[RequestMessage],
        metadata: &RequestMetadata,
    ) -> EventStream {
        self.provider
            .stream_completion(system_prompt, messages, metadata)
    }

    pub async fn complete_once(&self, prompt: &str) -> Result<String, ProviderError> {
        self.provider.complete_once(prompt).await
    }

    pub async fn count_tokens(&self, content: &[ContentPart]) -> usize {
        self.provider.count_tokens(content).await
    }

    /// Fetch the provider's model catalog so later `model()` calls resolve
    /// against real metadata. Empty for variants without a discovery endpoint.
    pub async fn refresh_models(&self) -> Arc<ModelCatalog> {
        self.provider.refresh_models().await
    }
}
