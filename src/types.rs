use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Model metadata
// ---------------------------------------------------------------------------

/// Per-million-token prices (USD). A model with no price fields at all has an
/// undefined cost, which is distinct from a zero cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write: Option<f64>,
}

impl ModelPricing {
    /// True when no price field is present at all.
    pub fn is_empty(&self) -> bool {
        self.input.is_none()
            && self.output.is_none()
            && self.cache_read.is_none()
            && self.cache_write.is_none()
    }
}

/// Price override that applies to requests whose input fits within
/// `context_window` tokens. Fields left unset fall back to the base prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTier {
    pub context_window: u64,
    #[serde(flatten)]
    pub prices: ModelPricing,
}

/// Static metadata for one model. Immutable once fetched; a catalog refresh
/// replaces the whole entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub context_window: u64,
    pub max_tokens: u64,
    #[serde(default)]
    pub supports_images: bool,
    #[serde(default)]
    pub supports_prompt_cache: bool,
    #[serde(default)]
    pub supports_computer_use: bool,
    #[serde(default)]
    pub supports_reasoning: bool,
    #[serde(flatten)]
    pub pricing: ModelPricing,
    /// Tiered price overrides, ascending by `context_window`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<PricingTier>,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            max_tokens: 8192,
            supports_images: false,
            supports_prompt_cache: false,
            supports_computer_use: false,
            supports_reasoning: false,
            pricing: ModelPricing::default(),
            tiers: Vec::new(),
        }
    }
}

/// Mapping from model id to metadata, scoped to one (provider, credential,
/// organization) triple.
pub type ModelCatalog = HashMap<String, ModelInfo>;

/// One physical serving endpoint for a logical model id. Some gateways expose
/// the same model through several backends with different prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub name: String,
    pub info: ModelInfo,
}

// ---------------------------------------------------------------------------
// Request messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        /// Cache-breakpoint marker: the vendor may cache the prefix up to
        /// this part.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cache: bool,
    },
    Image {
        /// Base64-encoded image bytes.
        data: String,
        mime_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the content, ignoring non-text parts.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One conversation turn as handed to a provider. Constructed fresh per call;
/// never mutated after being given to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl RequestMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Running usage counters for one response. `total_cost` is filled in by the
/// accountant once the terminal usage chunk arrives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub total_cost: Option<f64>,
}

/// A web source cited by a grounded response.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundingSource {
    pub title: String,
    pub url: String,
}

/// Normalized streaming event. The only shape the rest of the application
/// ever sees; vendor payloads never escape the provider layer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    Reasoning(String),
    Grounding { sources: Vec<GroundingSource> },
    /// Terminal event of a successful stream.
    Usage(UsageSnapshot),
}

// ---------------------------------------------------------------------------
// Reasoning configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningConfig {
    pub effort: ReasoningEffort,
    /// Token budget for budget-based vendors; None for level-based ones.
    pub budget_tokens: Option<u64>,
}

/// Outcome of model resolution: the wire model id, its metadata, and the
/// derived request parameters.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub id: String,
    pub info: ModelInfo,
    pub reasoning: Option<ReasoningConfig>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection parameters for one provider instance, supplied by the external
/// settings store. The schema of that store is not ours; this is just the
/// slice the provider layer consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Variant selector, e.g. "openai", "gemini", "gemini-cli", "qwen-portal",
    /// "openrouter".
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// Per-call metadata forwarded to vendors as request headers.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub task_id: Option<String>,
    pub organization: Option<String>,
}
