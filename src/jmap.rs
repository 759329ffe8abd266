//! JMAP client: session discovery, batched method calls, state tracking
//!
//! One [`JmapClient`] serves the whole process. [`JmapClient::fetch_session`]
//! must succeed before [`JmapClient::request`] is used. Every outgoing call
//! carries a freshly computed `Authorization` header; with OIDC that means a
//! token check (and possibly a refresh) per call.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, ServerConfig};
use crate::errors::{JmapError, JmapResult};
use crate::http::{build_client, decode_json, send_bounded, status_error};
use crate::models::{
    DEFAULT_CAPABILITIES, ERROR_METHOD, JmapRequest, JmapResponse, MAIL_CAPABILITY, MethodCall,
    MethodError, MethodResponse, Session, SessionResource,
};
use crate::token_refresh::TokenRefresher;
use crate::token_store::TokenStore;

/// How the `Authorization` header is produced
enum Credentials {
    /// Precomputed `Basic <base64(user:pass)>` header value
    Basic(SecretString),
    Bearer(SecretString),
    Oidc(TokenRefresher),
}

/// JMAP API client
///
/// Holds the captured session and the per-type state cache. Locks are never
/// held across an await.
pub struct JmapClient {
    http: Client,
    session_url: String,
    credentials: Credentials,
    auth_method: &'static str,
    request_timeout: Duration,
    session: RwLock<Option<Session>>,
    states: Mutex<HashMap<String, String>>,
}

impl JmapClient {
    /// Build a client with its own HTTP connection pool
    pub fn new(config: &ServerConfig) -> JmapResult<Self> {
        Ok(Self::with_http(config, build_client()?))
    }

    /// Build a client on an existing HTTP client
    ///
    /// With OIDC, a [`TokenRefresher`] sharing the same HTTP client and
    /// deadline is created over the configured token file.
    pub fn with_http(config: &ServerConfig, http: Client) -> Self {
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let credentials = match &config.auth {
            AuthConfig::Basic { username, password } => {
                let pair = format!("{username}:{}", password.expose_secret());
                let header = format!("Basic {}", STANDARD.encode(pair));
                Credentials::Basic(SecretString::new(header.into()))
            }
            AuthConfig::Bearer { token } => Credentials::Bearer(token.clone()),
            AuthConfig::Oidc => Credentials::Oidc(TokenRefresher::new(
                http.clone(),
                config.oidc.clone(),
                TokenStore::new(&config.token_file),
                request_timeout,
            )),
        };

        Self {
            http,
            session_url: config.session_url.clone(),
            credentials,
            auth_method: config.auth.method_name(),
            request_timeout,
            session: RwLock::new(None),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Configured authentication method name
    pub fn auth_method(&self) -> &'static str {
        self.auth_method
    }

    /// Discover the JMAP session and cache it
    ///
    /// Replaces any previously cached session.
    ///
    /// # Errors
    ///
    /// - HTTP status kinds (`unauthorized`, `forbidden`, `notFound`, ...)
    /// - `noMailAccount` if the mail capability has no primary account
    /// - auth-layer kinds from credential acquisition
    /// - `timeout`, `networkError`, `invalidResponse`
    pub async fn fetch_session(&self) -> JmapResult<Session> {
        let authorization = self.authorization().await?;
        debug!(url = %self.session_url, "fetching JMAP session");

        let (status, body) = send_bounded(
            self.request_timeout,
            "JMAP session fetch",
            self.http
                .get(&self.session_url)
                .header(AUTHORIZATION, authorization)
                .header(ACCEPT, "application/json"),
        )
        .await?;
        if !status.is_success() {
            return Err(status_error(status));
        }

        let resource: SessionResource = decode_json("JMAP session fetch", &body)?;
        let session = self.session_from_resource(resource)?;
        info!(
            account_id = %session.account_id,
            api_url = %session.api_url,
            "JMAP session established"
        );

        *self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(session)
    }

    fn session_from_resource(&self, resource: SessionResource) -> JmapResult<Session> {
        let account_id = resource
            .primary_accounts
            .get(MAIL_CAPABILITY)
            .filter(|id| !id.is_empty())
            .cloned()
            .ok_or_else(JmapError::no_mail_account)?;
        let api_url = resolve_url(&self.session_url, &resource.api_url)?;

        Ok(Session {
            api_url,
            account_id,
            state: resource.state,
            capabilities: resource.capabilities,
            username: resource.username,
            download_url: resource.download_url,
            upload_url: resource.upload_url,
            event_source_url: resource.event_source_url,
        })
    }

    /// Cached session, or `notFound` if [`fetch_session`](Self::fetch_session)
    /// has not succeeded yet
    pub fn get_session(&self) -> JmapResult<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(JmapError::session_not_initialized)
    }

    /// Send one batch of method calls to the API URL
    ///
    /// `using` defaults to core, mail, and submission. Method-level failures
    /// are not errors here; they come back as `error` entries for
    /// [`parse_method_response`](Self::parse_method_response) to classify.
    ///
    /// # Errors
    ///
    /// - `notFound` ("Session not initialized") before any HTTP call if no
    ///   session is cached
    /// - HTTP status kinds for a non-2xx response
    /// - auth-layer kinds, `timeout`, `networkError`, `invalidResponse`
    pub async fn request(
        &self,
        method_calls: &[MethodCall],
        using: Option<&[String]>,
    ) -> JmapResult<JmapResponse> {
        let session = self.get_session()?;
        let using = using.map_or_else(default_using, <[String]>::to_vec);
        let authorization = self.authorization().await?;

        debug!(calls = method_calls.len(), "sending JMAP request");
        let body = JmapRequest {
            using: &using,
            method_calls,
        };
        let (status, response_body) = send_bounded(
            self.request_timeout,
            "JMAP request",
            self.http
                .post(&session.api_url)
                .header(AUTHORIZATION, authorization)
                .header(ACCEPT, "application/json")
                .json(&body),
        )
        .await?;
        if !status.is_success() {
            return Err(status_error(status));
        }

        let decoded: JmapResponse = decode_json("JMAP request", &response_body)?;
        self.record_states(&decoded.method_responses);

        if let Some(current) = decoded.session_state.as_deref()
            && current != session.state
        {
            warn!(
                previous = %session.state,
                current,
                "JMAP session state changed; refetch the session to resynchronize"
            );
        }
        Ok(decoded)
    }

    /// Split a method response into its arguments or a method-level error
    pub fn parse_method_response(response: &MethodResponse) -> Result<&Value, MethodError> {
        if response.name() != ERROR_METHOD {
            return Ok(response.arguments());
        }
        let arguments = response.arguments();
        Err(MethodError {
            error_type: arguments
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned(),
            description: arguments
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }

    /// Last state token seen for `data_type`
    pub fn get_state(&self, data_type: &str) -> Option<String> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(data_type)
            .cloned()
    }

    pub fn update_state(&self, data_type: &str, state: impl Into<String>) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(data_type.to_owned(), state.into());
    }

    /// Forget the state for one type, or for all types with `None`
    pub fn clear_state(&self, data_type: Option<&str>) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        match data_type {
            Some(data_type) => {
                states.remove(data_type);
            }
            None => states.clear(),
        }
    }

    fn record_states(&self, responses: &[MethodResponse]) {
        for response in responses {
            if let (Some(data_type), Some(state)) = (response.data_type(), response.state()) {
                self.update_state(data_type, state);
            }
        }
    }

    async fn authorization(&self) -> JmapResult<HeaderValue> {
        let raw = match &self.credentials {
            Credentials::Basic(header) => header.expose_secret().to_owned(),
            Credentials::Bearer(token) => format!("Bearer {}", token.expose_secret()),
            Credentials::Oidc(refresher) => {
                format!("Bearer {}", refresher.ensure_valid_token().await?.access_token)
            }
        };
        let mut value = HeaderValue::from_str(&raw).map_err(|_| {
            JmapError::config("credentials contain characters not allowed in an HTTP header")
        })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

fn default_using() -> Vec<String> {
    DEFAULT_CAPABILITIES.iter().map(|c| (*c).to_owned()).collect()
}

/// Resolve `target` against the session URL (servers may send a relative `apiUrl`)
fn resolve_url(base: &str, target: &str) -> JmapResult<String> {
    let base = Url::parse(base)
        .map_err(|e| JmapError::config(format!("invalid JMAP_SESSION_URL '{base}': {e}")))?;
    base.join(target).map(String::from).map_err(|e| {
        JmapError::invalid_response("JMAP session fetch", format!("invalid apiUrl '{target}': {e}"))
    })
}
