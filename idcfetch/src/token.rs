use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Kind, Result};

/// A bearer credential and the instant it stops being usable. Refresh is
/// triggered a little before `expires_at` so an in-flight request never races
/// the expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Renew a little early: a request built from a token that expires in the
/// next few seconds could still be in flight past the deadline.
const EXPIRY_SKEW: chrono::Duration = chrono::Duration::seconds(30);

impl Token {
    fn needs_refresh(&self) -> bool {
        Utc::now() + EXPIRY_SKEW >= self.expires_at
    }
}

/// Holds the current token and refreshes it on demand. Readers take a shared
/// read lock for the common case (token still valid); a refresh upgrades to a
/// write lock and re-checks under it, so concurrent callers that all observed
/// an expiring token don't each fire their own refresh request; only the
/// first to acquire the write lock does, and the rest see the now-fresh token.
///
/// Mirrors the double-checked-lock shape `peoci::ocidist::Client` uses around
/// its ratelimit map: cheap read path, rare write path, no lost updates.
pub struct TokenManager {
    client: reqwest::Client,
    token_url: String,
    username: String,
    password: String,
    client_id: String,
    persist_path: Option<PathBuf>,
    state: RwLock<Option<Token>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenManager {
    pub fn new(
        client: reqwest::Client,
        token_url: String,
        username: String,
        password: String,
        client_id: String,
        persist_path: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            token_url,
            username,
            password,
            client_id,
            persist_path,
            state: RwLock::new(None),
        }
    }

    /// Load a persisted token from disk, if present and still valid. Called
    /// once at startup; a missing or stale file just means the first request
    /// triggers a normal refresh.
    pub async fn load_persisted(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let Ok(contents) = tokio::fs::read_to_string(path).await else {
            return;
        };
        let Ok(token) = serde_json::from_str::<Token>(&contents) else {
            return;
        };
        if !token.needs_refresh() {
            *self.state.write().await = Some(token);
        }
    }

    /// Returns a currently-valid access token, refreshing if necessary.
    pub async fn access_token(&self) -> Result<String> {
        {
            let guard = self.state.read().await;
            if let Some(token) = guard.as_ref() {
                if !token.needs_refresh() {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut guard = self.state.write().await;
        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.fetch_token().await?;
        self.persist(&token).await?;
        let access_token = token.access_token.clone();
        *guard = Some(token);
        Ok(access_token)
    }

    /// Persists whatever token is currently held, even if it was only ever
    /// loaded from disk and never refreshed this run. Called once at
    /// shutdown so a process that never hit a refresh still leaves the
    /// persisted credential in a consistent state. A persist failure is
    /// logged; the caller is shutting down regardless.
    pub async fn close(&self) {
        let guard = self.state.read().await;
        if let Some(token) = guard.as_ref() {
            if let Err(e) = self.persist(token).await {
                log::warn!("failed to persist token on close: {e}");
            }
        }
    }

    /// Force the next call to `access_token` to refresh, regardless of the
    /// cached token's expiry. Used when a request comes back 401 even though
    /// the local token looked valid (clock skew, server-side revocation).
    pub async fn invalidate(&self) {
        *self.state.write().await = None;
    }

    /// Every refresh re-authenticates with the password grant; the upstream
    /// wire protocol has exactly one token-issuing shape (`username`,
    /// `password`, `client_id`, `grant_type=password`), no separate
    /// refresh-token grant. The `refresh_token` field on `Token` is captured
    /// from the response and persisted, but nothing here spends it.
    async fn fetch_token(&self) -> Result<Token> {
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("client_id", self.client_id.as_str()),
            ("grant_type", "password"),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(Kind::from)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Kind::Auth(format!("token endpoint returned {status}")));
        }

        let body: TokenResponse = response.json().await.map_err(Kind::from)?;
        Ok(Token {
            access_token: body.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in.max(0)),
            refresh_token: body.refresh_token,
        })
    }

    async fn persist(&self, token: &Token) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        write_private_json(path, token).await
    }
}

/// Serialize `value` to `path` atomically via a sibling temp file, setting
/// owner-only permissions before the rename lands the real name. Same
/// write-tmp-then-rename shape as `peoci::blobcache::FileGuard`, applied to a
/// single named file rather than a keyed cache directory.
async fn write_private_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await.map_err(Kind::from)?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("token")
    ));

    let encoded = serde_json::to_vec_pretty(value)
        .map_err(|e| Kind::Filesystem(format!("encoding token: {e}")))?;
    tokio::fs::write(&tmp_path, &encoded).await.map_err(Kind::from)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(Kind::from)?;
    }

    tokio::fs::rename(&tmp_path, path).await.map_err(Kind::from)?;
    Ok(())
}

/// Exponential backoff delays for retryable requests, used by both the token
/// refresh path and the download engine.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    exp.min(cap)
}
