pub mod gemini;
pub mod gemini_cli;
pub mod openai_compatible;
pub mod qwen;
pub mod router;
pub mod sanitize;

use crate::auth::{AuthManager, Credentials};
use crate::types::{
    ContentPart, ModelCatalog, RequestMessage, RequestMetadata, ResolvedModel, StreamEvent,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Errors from provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Credentials file missing or malformed. Fatal; surfaced to the user.
    #[error("failed to load credentials: {0}")]
    AuthLoad(String),

    /// Token exchange rejected, or a second 401 after a refresh-and-retry.
    #[error("authentication refresh failed: {0}")]
    AuthRefresh(String),

    /// Vendor 401 before any refresh attempt.
    #[error("unauthorized: {detail}")]
    Unauthorized { detail: String },

    /// Vendor 429. Not auto-retried by this layer.
    #[error("rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Vendor 400 with sanitized detail attached.
    #[error("bad request: {detail}")]
    BadRequest { detail: String },

    /// Network call exceeded the configured bound. Never retried here.
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Mid-stream failure after events were already emitted. Events yielded
    /// before it remain valid.
    #[error("stream failed mid-response: {detail}")]
    Stream { detail: String },

    #[error("{0}")]
    Other(String),
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// The contract every vendor variant implements.
///
/// `resolve_model` and `stream_completion` are mandatory; single-shot
/// completion and vendor token counting are optional capabilities signalled
/// by the flags rather than probed structurally.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Pure and synchronous: the wire model id, its metadata, and derived
    /// request parameters, given current settings and catalog state.
    fn resolve_model(&self) -> ResolvedModel;

    /// Open a new network stream and emit normalized events. Finite,
    /// single-pass, not restartable. Dropping the stream cancels the call
    /// and closes the connection.
    fn stream_completion(
        &self,
        system_prompt: &str,
        messages: &[RequestMessage],
        metadata: &RequestMetadata,
    ) -> EventStream;

    /// True when the variant has a real non-streaming endpoint behind
    /// `complete_once`.
    fn supports_single_shot(&self) -> bool {
        false
    }

    /// True when `count_tokens` is backed by a vendor endpoint rather than
    /// the local estimate.
    fn supports_token_counting(&self) -> bool {
        false
    }

    /// Single-shot completion. Variants without a non-streaming endpoint use
    /// this default, which drives the stream to completion and concatenates
    /// the text events.
    async fn complete_once(&self, prompt: &str) -> Result<String, ProviderError> {
        let messages = [RequestMessage::user(prompt)];
        let stream = self.stream_completion("", &messages, &RequestMetadata::default());
        collect_text(stream).await
    }

    /// Best-effort token count. Must not fail: vendor errors fall back to the
    /// local estimate.
    async fn count_tokens(&self, content: &[ContentPart]) -> usize {
        estimate_tokens(content)
    }

    /// Fetch the variant's model catalog, if it has one. Variants without a
    /// discovery endpoint return an empty catalog.
    async fn refresh_models(&self) -> Arc<ModelCatalog> {
        Arc::new(ModelCatalog::new())
    }
}

/// Send a request built from current credentials, retrying exactly once
/// through a token refresh on 401. A second 401 after the refresh is fatal:
/// the rotated token was rejected too, so retrying cannot help.
pub(crate) async fn send_authorized<F>(
    auth: &AuthManager,
    timeout: Duration,
    build: F,
) -> Result<reqwest::Response, ProviderError>
where
    F: Fn(&Credentials) -> Result<reqwest::RequestBuilder, ProviderError>,
{
    let mut credentials = auth.credentials().await?;
    for attempt in 0..2 {
        let resp = crate::transport::send_with_timeout(build(&credentials)?, timeout).await?;
        if resp.status().as_u16() != 401 {
            return Ok(resp);
        }
        if attempt == 0 {
            credentials = auth.refresh_after_unauthorized(&credentials.access_token).await?;
            continue;
        }
        let err = crate::transport::error_for_response(resp).await;
        return Err(ProviderError::AuthRefresh(err.to_string()));
    }
    Err(ProviderError::AuthRefresh(
        "still unauthorized after token refresh".into(),
    ))
}

/// Drain a stream, concatenating `Text` events. Used by the documented
/// single-shot fallback.
pub async fn collect_text(mut stream: EventStream) -> Result<String, ProviderError> {
    let mut out = String::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::Text(t) = event? {
            out.push_str(&t);
        }
    }
    Ok(out)
}

const CHARS_PER_TOKEN: usize = 4;
const IMAGE_TOKEN_ESTIMATE: usize = 300;

/// Fixed-ratio local token estimate, used directly by variants without a
/// counting endpoint and as the fallback when a vendor call fails.
pub fn estimate_tokens(content: &[ContentPart]) -> usize {
    content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text, .. } => text.chars().count().div_ceil(CHARS_PER_TOKEN),
            ContentPart::Image { .. } => IMAGE_TOKEN_ESTIMATE,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UsageSnapshot;
    use futures::stream;

    #[test]
    fn estimate_tokens_text_and_images() {
        let content = vec![
            ContentPart::Text {
                text: "abcdefgh".into(), // 8 chars -> 2 tokens
                cache: false,
            },
            ContentPart::Image {
                data: "xxx".into(),
                mime_type: "image/png".into(),
            },
        ];
        assert_eq!(estimate_tokens(&content), 2 + IMAGE_TOKEN_ESTIMATE);
    }

    #[test]
    fn estimate_tokens_rounds_up() {
        let content = vec![ContentPart::Text {
            text: "abcde".into(),
            cache: false,
        }];
        assert_eq!(estimate_tokens(&content), 2);
    }

    #[tokio::test]
    async fn collect_text_concatenates_text_only() {
        let events = vec![
            Ok(StreamEvent::Reasoning("hmm".into())),
            Ok(StreamEvent::Text("hello ".into())),
            Ok(StreamEvent::Text("world".into())),
            Ok(StreamEvent::Usage(UsageSnapshot::default())),
        ];
        let s: EventStream = Box::pin(stream::iter(events));
        assert_eq!(collect_text(s).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn collect_text_propagates_errors() {
        let events = vec![
            Ok(StreamEvent::Text("partial".into())),
            Err(ProviderError::Stream {
                detail: "cut".into(),
            }),
        ];
        let s: EventStream = Box::pin(stream::iter(events));
        assert!(collect_text(s).await.is_err());
    }

    use crate::auth::{CredentialStore, TokenExchanger};
    use crate::testutil;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RotatingExchanger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenExchanger for RotatingExchanger {
        async fn exchange(&self, current: &Credentials) -> anyhow::Result<Credentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut next = current.clone();
            next.access_token = "rotated".into();
            next.expires_at = chrono::Utc::now().timestamp_millis() + 3_600_000;
            Ok(next)
        }
    }

    fn auth_fixture(dir: &tempfile::TempDir) -> (AuthManager, Arc<RotatingExchanger>) {
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        store
            .save(&Credentials {
                access_token: "first".into(),
                refresh_token: Some("r".into()),
                token_type: "Bearer".into(),
                expires_at: chrono::Utc::now().timestamp_millis() + 3_600_000,
                resource_url: None,
                extra: std::collections::HashMap::new(),
            })
            .unwrap();
        let exchanger = Arc::new(RotatingExchanger {
            calls: AtomicUsize::new(0),
        });
        (AuthManager::new(store, exchanger.clone()), exchanger)
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (auth, exchanger) = auth_fixture(&dir);
        let (addr, hits) = testutil::serve_responses(vec![
            testutil::http_response("401 Unauthorized", "{\"error\":\"expired\"}"),
            testutil::http_response("200 OK", "{}"),
        ])
        .await;

        let client = crate::transport::http_client();
        let resp = send_authorized(&auth, Duration::from_secs(5), |credentials| {
            Ok(client
                .get(format!("http://{addr}/"))
                .bearer_auth(&credentials.access_token))
        })
        .await
        .unwrap();

        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_unauthorized_after_refresh_is_fatal_not_a_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (auth, exchanger) = auth_fixture(&dir);
        // Every request 401s, including the one with the rotated token.
        let (addr, hits) = testutil::serve_responses(vec![testutil::http_response(
            "401 Unauthorized",
            "{\"error\":\"revoked\"}",
        )])
        .await;

        let client = crate::transport::http_client();
        let got = send_authorized(&auth, Duration::from_secs(5), |credentials| {
            Ok(client
                .get(format!("http://{addr}/"))
                .bearer_auth(&credentials.access_token))
        })
        .await;

        assert!(matches!(got, Err(ProviderError::AuthRefresh(_))), "{got:?}");
        // Exactly two requests and one token exchange: no retry loop.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }
}
