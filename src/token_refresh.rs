//! OIDC access-token renewal
//!
//! [`TokenRefresher`] hands out a usable access token before every JMAP call.
//! Expiring tokens are renewed through the refresh-token grant, and concurrent
//! demand is collapsed into one in-flight renewal: the first caller installs a
//! shared future in the refresher's slot, later callers await a clone of it,
//! and the future clears the slot once it settles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::OidcConfig;
use crate::errors::{JmapError, JmapResult};
use crate::oidc::{self, GrantError, IssuerMetadata};
use crate::token_store::{StoredTokens, TokenStore};

/// Seconds before `expires_at` at which a token stops being handed out
pub const EXPIRY_BUFFER_SECONDS: i64 = 60;

type RefreshFuture = Shared<BoxFuture<'static, JmapResult<StoredTokens>>>;

/// Whether `tokens` can be used right now
pub fn is_token_valid(tokens: &StoredTokens) -> bool {
    is_token_valid_at(tokens, Utc::now().timestamp())
}

/// Whether `tokens` can be used at `now` (epoch seconds)
///
/// Tokens without an expiry are assumed valid. Otherwise more than
/// [`EXPIRY_BUFFER_SECONDS`] must remain.
pub fn is_token_valid_at(tokens: &StoredTokens, now: i64) -> bool {
    tokens
        .expires_at
        .is_none_or(|expires_at| expires_at.saturating_sub(now) > EXPIRY_BUFFER_SECONDS)
}

struct Inner {
    http: Client,
    oidc: OidcConfig,
    store: TokenStore,
    timeout: Duration,
    /// Discovery results keyed by (issuer URL, client ID)
    issuers: tokio::sync::Mutex<HashMap<(String, String), IssuerMetadata>>,
    in_flight: Mutex<Option<RefreshFuture>>,
}

/// Token refresher shared by the JMAP client and the auth command
///
/// Cloning is cheap; clones share the discovery cache and the in-flight slot.
#[derive(Clone)]
pub struct TokenRefresher {
    inner: Arc<Inner>,
}

impl TokenRefresher {
    pub fn new(http: Client, oidc: OidcConfig, store: TokenStore, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                oidc,
                store,
                timeout,
                issuers: tokio::sync::Mutex::new(HashMap::new()),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.inner.store
    }

    pub fn oidc(&self) -> &OidcConfig {
        &self.inner.oidc
    }

    pub fn http(&self) -> &Client {
        &self.inner.http
    }

    /// Per-call deadline for discovery and token-endpoint requests
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Return tokens whose access token is valid beyond the expiry buffer
    ///
    /// # Errors
    ///
    /// - `oidcConfigError` if issuer or client ID is missing (no I/O happens)
    /// - `noStoredTokens` if nobody has authenticated yet
    /// - `tokenExpired` if the token is expiring and no refresh token exists,
    ///   or the provider answered the refresh with an already expired token
    /// - `refreshFailed` if the refresh grant fails
    pub async fn ensure_valid_token(&self) -> JmapResult<StoredTokens> {
        self.inner.oidc.require()?;
        let tokens = self
            .inner
            .store
            .load()?
            .ok_or_else(JmapError::no_stored_tokens)?;

        if is_token_valid(&tokens) {
            return Ok(tokens);
        }
        if tokens.refresh_token.is_none() {
            return Err(JmapError::token_expired(false));
        }

        self.refresh().await
    }

    /// Issuer metadata for the configured issuer, discovered at most once
    pub async fn get_issuer_config(&self) -> JmapResult<IssuerMetadata> {
        let (issuer, client_id) = self.inner.oidc.require()?;
        self.inner.issuer_config(issuer, client_id).await
    }

    /// Drop cached discovery results so the next use rediscovers
    pub async fn clear_cache(&self) {
        self.inner.issuers.lock().await.clear();
    }

    /// Join the in-flight refresh, or start one
    async fn refresh(&self) -> JmapResult<StoredTokens> {
        let pending = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(pending) => {
                    debug!("joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    // A refresh may have completed between the caller's load and now.
                    if let Some(tokens) = self.inner.store.load()?
                        && is_token_valid(&tokens)
                    {
                        return Ok(tokens);
                    }
                    let pending = run_refresh(self.clone()).boxed().shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }
}

async fn run_refresh(refresher: TokenRefresher) -> JmapResult<StoredTokens> {
    let result = refresher.refresh_once().await;
    *refresher
        .inner
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
    result
}

impl TokenRefresher {
    async fn refresh_once(&self) -> JmapResult<StoredTokens> {
        let inner = &self.inner;
        let (issuer, client_id) = inner.oidc.require()?;
        let current = inner.store.load()?.ok_or_else(JmapError::no_stored_tokens)?;
        let Some(refresh_token) = current.refresh_token.as_deref() else {
            return Err(JmapError::token_expired(false));
        };

        info!("refreshing OIDC access token");
        let metadata = inner
            .issuer_config(issuer, client_id)
            .await
            .map_err(|e| JmapError::refresh_failed(e.message()))?;

        let response = match oidc::refresh_grant(
            &inner.http,
            &metadata,
            client_id,
            refresh_token,
            inner.timeout,
        )
        .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("OIDC token refresh failed: {err}");
                // The token endpoint may have moved; rediscover on the next attempt.
                if !matches!(err, GrantError::Rejected { .. }) {
                    self.clear_cache().await;
                }
                return Err(JmapError::refresh_failed(err));
            }
        };

        let now = Utc::now().timestamp();
        let refreshed = response.into_stored(now, Some(&current));
        inner.store.save(&refreshed)?;
        if refreshed.expires_at.is_some_and(|at| at <= now) {
            warn!("identity provider issued an access token that is already expired");
            return Err(JmapError::token_expired(true));
        }
        info!(expires_at = ?refreshed.expires_at, "OIDC access token refreshed");
        Ok(refreshed)
    }
}

impl Inner {
    async fn issuer_config(&self, issuer: &str, client_id: &str) -> JmapResult<IssuerMetadata> {
        let key = (issuer.to_owned(), client_id.to_owned());
        // Held across discovery so concurrent first uses discover once.
        let mut cache = self.issuers.lock().await;
        if let Some(metadata) = cache.get(&key) {
            return Ok(metadata.clone());
        }
        let metadata = oidc::discover(&self.http, issuer, self.timeout).await?;
        info!(issuer, token_endpoint = %metadata.token_endpoint, "OIDC issuer discovered");
        cache.insert(key, metadata.clone());
        Ok(metadata)
    }
}
