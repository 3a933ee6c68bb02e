//! Token exchange for the Qwen portal backend (device-authorization flow,
//! RFC 8628). Login happens out of band; this layer only refreshes the
//! resulting tokens. The refresh response may carry a `resource_url` pointing
//! at the API host the token is scoped to.

use super::{Credentials, TokenExchanger};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";

pub struct QwenExchanger {
    client: reqwest::Client,
}

impl QwenExchanger {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for QwenExchanger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    expires_in: i64,
    #[serde(default)]
    resource_url: Option<String>,
}

#[async_trait]
impl TokenExchanger for QwenExchanger {
    async fn exchange(&self, current: &Credentials) -> anyhow::Result<Credentials> {
        let refresh = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no refresh token"))?;

        let resp = self
            .client
            .post(TOKEN_URL)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh),
                ("client_id", CLIENT_ID),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token refresh failed: {} {}", status, body);
        }

        let token: TokenResponse = resp.json().await?;
        let expires_at = chrono::Utc::now().timestamp_millis() + token.expires_in * 1000;

        Ok(Credentials {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .or_else(|| current.refresh_token.clone()),
            token_type: token.token_type.unwrap_or_else(|| "Bearer".into()),
            expires_at,
            resource_url: token
                .resource_url
                .or_else(|| current.resource_url.clone()),
            extra: HashMap::new(),
        })
    }
}

/// API base URL for a Qwen credential set: the token's `resource_url` when
/// present, the public portal host otherwise.
pub fn api_base_url(credentials: &Credentials) -> String {
    match credentials.resource_url.as_deref() {
        Some(host) if !host.is_empty() => {
            if host.starts_with("http://") || host.starts_with("https://") {
                format!("{}/v1", host.trim_end_matches('/'))
            } else {
                format!("https://{}/v1", host.trim_end_matches('/'))
            }
        }
        _ => "https://portal.qwen.ai/v1".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(resource_url: Option<&str>) -> Credentials {
        Credentials {
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            token_type: "Bearer".into(),
            expires_at: 0,
            resource_url: resource_url.map(String::from),
            extra: HashMap::new(),
        }
    }

    #[test]
    fn base_url_defaults_to_portal() {
        assert_eq!(api_base_url(&creds(None)), "https://portal.qwen.ai/v1");
        assert_eq!(api_base_url(&creds(Some(""))), "https://portal.qwen.ai/v1");
    }

    #[test]
    fn base_url_uses_resource_override() {
        assert_eq!(
            api_base_url(&creds(Some("portal-intl.qwen.ai"))),
            "https://portal-intl.qwen.ai/v1"
        );
        assert_eq!(
            api_base_url(&creds(Some("https://host.example/"))),
            "https://host.example/v1"
        );
    }

    #[tokio::test]
    async fn exchange_requires_refresh_token() {
        let mut c = creds(None);
        c.refresh_token = None;
        let err = QwenExchanger::new().exchange(&c).await.unwrap_err();
        assert!(err.to_string().contains("refresh token"));
    }
}
