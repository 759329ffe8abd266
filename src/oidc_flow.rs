//! Interactive OIDC authorization-code flow with PKCE
//!
//! Used only by the `auth` command. A one-shot axum listener on the loopback
//! addresses at `<redirect port>` captures the browser redirect, the code is
//! exchanged at the token endpoint, and the resulting token set is saved for
//! the [`TokenRefresher`](crate::token_refresh::TokenRefresher) to renew later.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{JmapError, JmapResult};
use crate::oidc::{self, IssuerMetadata};
use crate::token_refresh::TokenRefresher;
use crate::token_store::StoredTokens;

const SUCCESS_PAGE: &str = "<html><body><h1>Authorization complete</h1>\
<p>You can close this window and return to the terminal.</p></body></html>";
const FAILURE_PAGE: &str = "<html><body><h1>Authorization failed</h1>\
<p>Return to the terminal for details.</p></body></html>";

/// Authorization endpoint URL carrying the PKCE challenge and `state`
pub fn authorization_url(
    metadata: &IssuerMetadata,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &CsrfToken,
    challenge: PkceCodeChallenge,
) -> JmapResult<String> {
    let auth_url = AuthUrl::new(metadata.authorization_endpoint.clone()).map_err(|e| {
        JmapError::oidc_flow(
            "authorization",
            format!("invalid authorization endpoint: {e}"),
        )
    })?;
    let redirect_url = RedirectUrl::new(redirect_uri.to_owned()).map_err(|e| {
        JmapError::oidc_flow("authorization", format!("invalid redirect URI: {e}"))
    })?;

    let client = BasicClient::new(ClientId::new(client_id.to_owned()))
        .set_auth_uri(auth_url)
        .set_redirect_uri(redirect_url);
    let (url, _) = client
        .authorize_url(|| state.clone())
        .add_scopes(scope.split_whitespace().map(|s| Scope::new(s.to_owned())))
        .set_pkce_challenge(challenge)
        .url();
    Ok(url.to_string())
}

/// Query parameters of the redirect to `/callback`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Extract the authorization code after checking error and state
    pub fn into_code(self, expected_state: &str) -> JmapResult<String> {
        if let Some(error) = self.error {
            let detail = match self.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            return Err(JmapError::oidc_flow("authorization", detail));
        }
        if self.state.as_deref() != Some(expected_state) {
            return Err(JmapError::oidc_flow(
                "authorization",
                "state parameter mismatch",
            ));
        }
        self.code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| JmapError::oidc_flow("authorization", "callback carried no code"))
    }
}

#[derive(Clone)]
struct CallbackState {
    tx: mpsc::Sender<CallbackParams>,
}

fn callback_router(tx: mpsc::Sender<CallbackParams>) -> Router {
    Router::new()
        .route("/callback", get(handle_callback))
        .with_state(CallbackState { tx })
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<&'static str>) {
    let ok = params.error.is_none() && params.code.is_some();
    // Only the first redirect counts; later ones find the channel full or closed.
    if state.tx.try_send(params).is_err() {
        debug!("ignoring repeated authorization callback");
    }
    if ok {
        (StatusCode::OK, Html(SUCCESS_PAGE))
    } else {
        (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE))
    }
}

/// Run the interactive flow, opening the system browser
///
/// # Errors
///
/// - `oidcConfigError` if issuer or client ID is missing
/// - `oidcFlowError` for listener, authorization, or exchange failures
/// - `tokenStoreError` if the tokens cannot be saved
pub async fn run_authorization_flow(refresher: &TokenRefresher) -> JmapResult<StoredTokens> {
    authorize_with(refresher, open_browser).await
}

fn open_browser(url: &str) {
    eprintln!("Opening browser for sign-in. If it does not open, visit:\n\n  {url}\n");
    if let Err(err) = open::that(url) {
        warn!("could not launch browser: {err}");
    }
}

/// Bind the callback port on both loopback addresses
///
/// The redirect URI names `localhost`, which may resolve to either family.
/// IPv4 is required; IPv6 is best effort for hosts without it.
async fn bind_callback_listeners(port: u16) -> JmapResult<Vec<TcpListener>> {
    let v4 = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|e| {
            JmapError::oidc_flow("callback listener", format!("cannot bind port {port}: {e}"))
        })?;
    let mut listeners = vec![v4];
    match TcpListener::bind((Ipv6Addr::LOCALHOST, port)).await {
        Ok(v6) => listeners.push(v6),
        Err(err) => debug!("IPv6 loopback callback listener unavailable: {err}"),
    }
    Ok(listeners)
}

async fn authorize_with<F>(refresher: &TokenRefresher, launch: F) -> JmapResult<StoredTokens>
where
    F: FnOnce(&str),
{
    let config = refresher.oidc();
    let (_, client_id) = config.require()?;
    let metadata = refresher.get_issuer_config().await?;

    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let state = CsrfToken::new_random();
    let redirect_uri = config.redirect_uri();
    let url = authorization_url(
        &metadata,
        client_id,
        &redirect_uri,
        &config.scope,
        &state,
        challenge,
    )?;

    let listeners = bind_callback_listeners(config.redirect_port).await?;
    let (tx, mut rx) = mpsc::channel(1);
    let router = callback_router(tx);
    let shutdown = CancellationToken::new();
    let servers: Vec<_> = listeners
        .into_iter()
        .map(|listener| {
            let router = router.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            })
        })
        .collect();
    drop(router);
    info!(port = config.redirect_port, "waiting for authorization callback");

    launch(&url);

    let limit = Duration::from_secs(config.flow_timeout_seconds);
    let received = timeout(limit, rx.recv()).await;
    shutdown.cancel();
    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("callback listener error: {err}"),
            Err(err) => warn!("callback listener task failed: {err}"),
        }
    }

    let params = match received {
        Ok(Some(params)) => params,
        Ok(None) => {
            return Err(JmapError::oidc_flow(
                "authorization",
                "callback listener stopped unexpectedly",
            ));
        }
        Err(_) => {
            return Err(JmapError::oidc_flow(
                "authorization",
                format!("no callback received within {}s", limit.as_secs()),
            ));
        }
    };
    let code = params.into_code(state.secret())?;

    let response = oidc::exchange_code(
        refresher.http(),
        &metadata,
        client_id,
        &code,
        verifier.secret(),
        &redirect_uri,
        refresher.timeout(),
    )
    .await
    .map_err(|e| JmapError::oidc_flow("token exchange", e))?;

    let tokens = response.into_stored(Utc::now().timestamp(), None);
    refresher.store().save(&tokens)?;
    info!(path = %refresher.store().path().display(), "OIDC tokens saved");
    Ok(tokens)
}
