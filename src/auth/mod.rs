pub mod gemini_cli;
pub mod qwen;

use crate::providers::ProviderError;
use async_trait::async_trait;
use fs2::FileExt;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Tokens are treated as expired this long before their actual expiry, so a
/// token cannot lapse between the check and the request that uses it.
pub const EXPIRY_SAFETY_MARGIN_MS: i64 = 30_000;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// One OAuth/token-exchange credential set. Immutable; refreshing produces a
/// replacement object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry, epoch milliseconds.
    pub expires_at: i64,
    /// Vendor-assigned base URL override, when the token is scoped to a
    /// specific resource host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    /// Provider-specific extras (e.g. `project_id` for Cloud Code Assist).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl Credentials {
    pub fn is_fresh_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at - EXPIRY_SAFETY_MARGIN_MS
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(chrono::Utc::now().timestamp_millis())
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// On-disk store
// ---------------------------------------------------------------------------

/// Reads and writes one provider's credentials file. The file's schema beyond
/// `Credentials` is owned by whoever wrote it; we only round-trip it.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location for a provider: `~/.polyllm/<provider>/credentials.json`.
    pub fn default_for(provider: &str) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".polyllm").join(provider).join("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Credentials, ProviderError> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            ProviderError::AuthLoad(format!("{}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ProviderError::AuthLoad(format!("{}: invalid credentials file: {}", self.path.display(), e))
        })
    }

    /// Atomic save: write a temp file, fsync, rename, under a sibling lock
    /// file so concurrent processes do not interleave writes.
    pub fn save(&self, credentials: &Credentials) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
            }
        }

        let lock_path = self.path.with_extension("json.lock");
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        FileExt::lock_exclusive(&lock_file)?;

        let result = (|| -> anyhow::Result<()> {
            let json = serde_json::to_string_pretty(credentials)?;
            let tmp_path = self.path.with_extension("json.tmp");
            {
                let mut file = fs::File::create(&tmp_path)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
            }
            fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();

        let _ = FileExt::unlock(&lock_file);
        result
    }
}

// ---------------------------------------------------------------------------
// Refresh machinery
// ---------------------------------------------------------------------------

/// Vendor-specific token exchange. Implementations talk to the vendor's token
/// endpoint and return a full replacement credential set.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, current: &Credentials) -> anyhow::Result<Credentials>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Arc<Credentials>, Arc<ProviderError>>>>;

/// Owns one provider instance's credential lifecycle: lazy load, expiry
/// checking with a safety margin, and single-flight refresh.
#[derive(Clone)]
pub struct AuthManager {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    store: CredentialStore,
    exchanger: Arc<dyn TokenExchanger>,
    current: Mutex<Option<Arc<Credentials>>>,
    inflight: Mutex<Option<RefreshFuture>>,
}

impl AuthManager {
    pub fn new(store: CredentialStore, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            inner: Arc::new(AuthInner {
                store,
                exchanger,
                current: Mutex::new(None),
                inflight: Mutex::new(None),
            }),
        }
    }

    /// Current credentials, refreshed first if inside the safety margin.
    pub async fn credentials(&self) -> Result<Arc<Credentials>, ProviderError> {
        let creds = self.inner.loaded()?;
        if creds.is_fresh() {
            return Ok(creds);
        }
        if creds.refresh_token.is_none() {
            return Err(ProviderError::AuthRefresh(
                "access token expired and no refresh token is available".into(),
            ));
        }
        self.refresh_shared().await
    }

    /// Reactive re-auth after a vendor 401. If another caller already rotated
    /// the token the failed request used, returns the rotation instead of
    /// refreshing again.
    pub async fn refresh_after_unauthorized(
        &self,
        used_access_token: &str,
    ) -> Result<Arc<Credentials>, ProviderError> {
        {
            let current = self.inner.current.lock().unwrap();
            if let Some(c) = current.as_ref() {
                if c.access_token != used_access_token {
                    return Ok(c.clone());
                }
            }
        }
        self.refresh_shared().await
    }

    /// Coalesce concurrent refreshes onto one in-flight exchange. The handle
    /// is cleared when the exchange settles, success or failure, so a failed
    /// refresh never poisons later attempts.
    async fn refresh_shared(&self) -> Result<Arc<Credentials>, ProviderError> {
        let fut = {
            let mut inflight = self.inner.inflight.lock().unwrap();
            match inflight.as_ref() {
                Some(f) => f.clone(),
                None => {
                    let inner = self.inner.clone();
                    let f: RefreshFuture = async move {
                        let result = inner.do_refresh().await;
                        *inner.inflight.lock().unwrap() = None;
                        result.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(f.clone());
                    f
                }
            }
        };
        fut.await
            .map_err(|e| ProviderError::AuthRefresh(e.to_string()))
    }
}

impl AuthInner {
    fn loaded(&self) -> Result<Arc<Credentials>, ProviderError> {
        let mut current = self.current.lock().unwrap();
        if let Some(c) = current.as_ref() {
            return Ok(c.clone());
        }
        let loaded = Arc::new(self.store.load()?);
        *current = Some(loaded.clone());
        Ok(loaded)
    }

    async fn do_refresh(self: &Arc<Self>) -> Result<Arc<Credentials>, ProviderError> {
        let creds = self.loaded()?;
        let refreshed = self
            .exchanger
            .exchange(&creds)
            .await
            .map_err(|e| ProviderError::AuthRefresh(e.to_string()))?;

        // Persistence is best-effort: the refreshed token stays usable in
        // memory even if the disk write fails.
        if let Err(e) = self.store.save(&refreshed) {
            tracing::warn!(error = %e, path = %self.store.path().display(),
                "failed to persist refreshed credentials");
        }

        let arc = Arc::new(refreshed);
        *self.current.lock().unwrap() = Some(arc.clone());
        Ok(arc)
    }
}
