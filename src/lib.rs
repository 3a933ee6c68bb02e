//! polyllm: one streaming interface over incompatible LLM vendor APIs.
//!
//! The host application configures a provider with [`ProviderSettings`],
//! builds a [`Client`], and consumes normalized [`StreamEvent`]s. Vendor wire
//! formats, OAuth refreshes, model catalogs, and cost accounting all stay
//! behind the [`Provider`] trait.

pub mod auth;
pub mod catalog;
pub mod client;
pub mod cost;
pub mod providers;
pub mod tags;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testutil;

pub use client::Client;
pub use providers::{EventStream, Provider, ProviderError};
pub use types::{
    ContentPart, GroundingSource, MessageContent, ModelCatalog, ModelEndpoint, ModelInfo,
    ModelPricing, ProviderSettings, ReasoningConfig, ReasoningEffort, RequestMessage,
    RequestMetadata, ResolvedModel, Role, StreamEvent, UsageSnapshot,
};
