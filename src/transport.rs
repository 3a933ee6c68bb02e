//! Thin HTTP and SSE plumbing shared by every provider variant.

use crate::providers::{sanitize, ProviderError};
use reqwest::Client;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Build the shared HTTP client. The overall request timeout is applied per
/// call (streaming requests bound only the header phase with it), so the
/// client itself carries just a connect timeout.
pub fn http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Await the header phase of a request within `timeout`, mapping elapsed
/// timers and reqwest timeouts to the distinct timeout error.
pub async fn send_with_timeout(
    req: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, ProviderError> {
    match tokio::time::timeout(timeout, req.send()).await {
        Err(_) => Err(ProviderError::Timeout {
            after: timeout,
        }),
        Ok(Err(e)) if e.is_timeout() => Err(ProviderError::Timeout { after: timeout }),
        Ok(Err(e)) => Err(ProviderError::Network(e)),
        Ok(Ok(resp)) => Ok(resp),
    }
}

/// Bound an entire non-streaming request, headers and body both. Streaming
/// requests keep `send_with_timeout` alone so the bound covers only the
/// header phase.
pub async fn send_bounded(
    req: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, ProviderError> {
    send_with_timeout(req.timeout(timeout), timeout).await
}

/// Read a JSON body, mapping a stalled read on a bounded request into the
/// distinct timeout error.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    timeout: Duration,
) -> Result<T, ProviderError> {
    match resp.json::<T>().await {
        Ok(v) => Ok(v),
        Err(e) if e.is_timeout() => Err(ProviderError::Timeout { after: timeout }),
        Err(e) => Err(ProviderError::Network(e)),
    }
}

/// Map a non-success HTTP response to the error taxonomy, sanitizing the
/// vendor body before it can surface anywhere.
pub async fn error_for_response(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let retry_after_ms = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64);
    let body = resp.text().await.unwrap_or_default();
    error_for_status(status, &body, retry_after_ms)
}

pub fn error_for_status(status: u16, body: &str, retry_after_ms: Option<u64>) -> ProviderError {
    let detail = sanitize::sanitize_api_error(body);
    match status {
        400 => ProviderError::BadRequest { detail },
        401 => ProviderError::Unauthorized { detail },
        429 => ProviderError::RateLimited { retry_after_ms },
        _ => ProviderError::Http {
            status,
            body: detail,
        },
    }
}

// ---------------------------------------------------------------------------
// SSE line decoding
// ---------------------------------------------------------------------------

/// Incremental line splitter over raw response bytes. Bytes that do not yet
/// end in a newline stay buffered until the next chunk, so a multibyte
/// character split across network chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseLineReader {
    buf: Vec<u8>,
}

impl SseLineReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line, trimmed, or None until more bytes arrive.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

/// Extract the payload of an SSE `data:` line. Returns None for comments,
/// event/id fields, blank lines, and the `[DONE]` sentinel.
pub fn sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    let data = rest.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_reader_handles_split_lines() {
        let mut r = SseLineReader::new();
        r.push(b"data: {\"a\":");
        assert_eq!(r.next_line(), None);
        r.push(b"1}\n\ndata: [DONE]\n");
        assert_eq!(r.next_line(), Some("data: {\"a\":1}".into()));
        assert_eq!(r.next_line(), Some("".into()));
        assert_eq!(r.next_line(), Some("data: [DONE]".into()));
        assert_eq!(r.next_line(), None);
    }

    #[test]
    fn line_reader_reassembles_multibyte_chars_split_across_chunks() {
        let bytes = "data: é\n".as_bytes();
        let mut r = SseLineReader::new();
        // Split inside the two-byte 'é'.
        r.push(&bytes[..7]);
        assert_eq!(r.next_line(), None);
        r.push(&bytes[7..]);
        assert_eq!(r.next_line(), Some("data: é".into()));
    }

    #[tokio::test]
    async fn stalled_body_read_hits_the_request_timeout() {
        // Declared length exceeds the payload, so the body read never
        // completes and must be cut off by the per-request bound.
        let stalled = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"partial\":"
            .to_string();
        let (addr, _) = crate::testutil::serve_responses(vec![stalled]).await;

        let timeout = Duration::from_millis(200);
        let client = http_client();
        let resp = send_bounded(client.get(format!("http://{addr}/")), timeout)
            .await
            .expect("headers arrive before the stall");
        let got = read_json::<serde_json::Value>(resp, timeout).await;
        assert!(matches!(got, Err(ProviderError::Timeout { .. })), "{got:?}");
    }

    #[test]
    fn sse_data_filters_done_and_non_data() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("data:{\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("data: [DONE]"), None);
        assert_eq!(sse_data("event: ping"), None);
        assert_eq!(sse_data(": comment"), None);
        assert_eq!(sse_data(""), None);
    }

    #[test]
    fn error_for_status_maps_taxonomy() {
        assert!(matches!(
            error_for_status(400, "bad field", None),
            ProviderError::BadRequest { .. }
        ));
        assert!(matches!(
            error_for_status(401, "no", None),
            ProviderError::Unauthorized { .. }
        ));
        assert!(matches!(
            error_for_status(429, "slow down", Some(2000)),
            ProviderError::RateLimited {
                retry_after_ms: Some(2000)
            }
        ));
        assert!(matches!(
            error_for_status(503, "oops", None),
            ProviderError::Http { status: 503, .. }
        ));
    }

    #[test]
    fn error_for_status_scrubs_secrets() {
        let err = error_for_status(400, "invalid key sk-abc123def", None);
        match err {
            ProviderError::BadRequest { detail } => {
                assert!(!detail.contains("sk-abc123def"));
                assert!(detail.contains("[REDACTED]"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
