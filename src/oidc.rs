//! OpenID Connect protocol calls
//!
//! Discovery of issuer metadata and the two token-endpoint grants used by the
//! crate: `authorization_code` (with PKCE verifier) and `refresh_token`.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::errors::{JmapError, JmapResult};
use crate::http::{decode_json, send_bounded};
use crate::token_store::StoredTokens;

/// Issuer metadata from the discovery document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Successful token-endpoint response (RFC 6749 section 5.1)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Convert into a persisted token set
    ///
    /// Refresh and ID tokens omitted by the provider are carried over from
    /// `previous`; many providers do not rotate them.
    pub fn into_stored(self, now: i64, previous: Option<&StoredTokens>) -> StoredTokens {
        StoredTokens {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            id_token: self
                .id_token
                .or_else(|| previous.and_then(|p| p.id_token.clone())),
            expires_at: self.expires_in.map(|secs| now.saturating_add(secs)),
        }
    }
}

/// Error body returned by the token endpoint (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Failure of a token-endpoint grant
#[derive(Debug, Error)]
pub enum GrantError {
    /// Provider rejected the grant with an OAuth error code
    #[error("{}", describe_rejection(.error, .description.as_deref()))]
    Rejected {
        error: String,
        description: Option<String>,
    },
    /// Non-success status without a parseable OAuth error body
    #[error("token endpoint returned HTTP {0}")]
    Status(u16),
    /// Timeout, transport, or decode failure
    #[error("{0}")]
    Transport(#[from] JmapError),
}

fn describe_rejection(error: &str, description: Option<&str>) -> String {
    match description {
        Some(description) if !description.is_empty() => format!("{error}: {description}"),
        _ => error.to_owned(),
    }
}

/// Discovery document URL for an issuer
pub fn discovery_url(issuer_url: &str) -> String {
    format!(
        "{}/.well-known/openid-configuration",
        issuer_url.trim_end_matches('/')
    )
}

/// Fetch issuer metadata
///
/// # Errors
///
/// - `timeout` / `networkError` for transport failures
/// - `oidcError` for a non-success status or an incomplete document
pub async fn discover(http: &Client, issuer_url: &str, limit: Duration) -> JmapResult<IssuerMetadata> {
    let url = discovery_url(issuer_url);
    debug!(%url, "fetching OIDC discovery document");
    let (status, body) = send_bounded(
        limit,
        "OIDC discovery",
        http.get(&url).header(ACCEPT, "application/json"),
    )
    .await?;
    if !status.is_success() {
        return Err(JmapError::oidc(format!(
            "discovery at {url} returned HTTP {}",
            status.as_u16()
        )));
    }

    serde_json::from_slice(&body)
        .map_err(|e| JmapError::oidc(format!("invalid discovery document at {url}: {e}")))
}

/// Run the `refresh_token` grant
pub async fn refresh_grant(
    http: &Client,
    metadata: &IssuerMetadata,
    client_id: &str,
    refresh_token: &str,
    limit: Duration,
) -> Result<TokenResponse, GrantError> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];
    token_request(http, &metadata.token_endpoint, &params, limit, "OIDC token refresh").await
}

/// Run the `authorization_code` grant with the PKCE verifier
pub async fn exchange_code(
    http: &Client,
    metadata: &IssuerMetadata,
    client_id: &str,
    code: &str,
    code_verifier: &str,
    redirect_uri: &str,
    limit: Duration,
) -> Result<TokenResponse, GrantError> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];
    token_request(http, &metadata.token_endpoint, &params, limit, "OIDC code exchange").await
}

async fn token_request(
    http: &Client,
    endpoint: &str,
    params: &[(&str, &str)],
    limit: Duration,
    operation: &str,
) -> Result<TokenResponse, GrantError> {
    debug!(%endpoint, operation, "calling token endpoint");
    let (status, body) = send_bounded(
        limit,
        operation,
        http.post(endpoint)
            .header(ACCEPT, "application/json")
            .form(params),
    )
    .await?;

    if !status.is_success() {
        return Err(match serde_json::from_slice::<OAuthErrorBody>(&body) {
            Ok(body) => GrantError::Rejected {
                error: body.error,
                description: body.error_description,
            },
            Err(_) => GrantError::Status(status.as_u16()),
        });
    }

    Ok(decode_json::<TokenResponse>(operation, &body)?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockito::{Matcher, Server};
    use reqwest::Client;
    use serde_json::json;

    use super::{GrantError, IssuerMetadata, TokenResponse, discover, discovery_url, refresh_grant};
    use crate::errors::ErrorKind;
    use crate::token_store::StoredTokens;

    const LIMIT: Duration = Duration::from_secs(5);

    fn metadata(base: &str) -> IssuerMetadata {
        IssuerMetadata {
            issuer: base.to_owned(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            userinfo_endpoint: None,
            end_session_endpoint: None,
            code_challenge_methods_supported: vec!["S256".to_owned()],
        }
    }

    #[test]
    fn discovery_url_strips_trailing_slash() {
        assert_eq!(
            discovery_url("https://sso.example.com/realms/mail/"),
            "https://sso.example.com/realms/mail/.well-known/openid-configuration"
        );
    }

    #[test]
    fn into_stored_keeps_previous_refresh_and_id_tokens() {
        let previous = StoredTokens {
            access_token: "old".to_owned(),
            refresh_token: Some("r-old".to_owned()),
            id_token: Some("id-old".to_owned()),
            expires_at: Some(100),
        };
        let response: TokenResponse =
            serde_json::from_value(json!({ "access_token": "new", "expires_in": 300 }))
                .expect("decodes");
        let stored = response.into_stored(1_000, Some(&previous));
        assert_eq!(stored.access_token, "new");
        assert_eq!(stored.refresh_token.as_deref(), Some("r-old"));
        assert_eq!(stored.id_token.as_deref(), Some("id-old"));
        assert_eq!(stored.expires_at, Some(1_300));
    }

    #[test]
    fn into_stored_saturates_huge_expiry() {
        let response: TokenResponse =
            serde_json::from_value(json!({ "access_token": "a", "expires_in": i64::MAX }))
                .expect("decodes");
        let stored = response.into_stored(1_700_000_000, None);
        assert_eq!(stored.expires_at, Some(i64::MAX));
    }

    #[test]
    fn into_stored_without_expiry_leaves_expiry_unset() {
        let response: TokenResponse = serde_json::from_value(json!({
            "access_token": "new",
            "refresh_token": "r-new"
        }))
        .expect("decodes");
        let stored = response.into_stored(1_000, None);
        assert_eq!(stored.refresh_token.as_deref(), Some("r-new"));
        assert_eq!(stored.expires_at, None);
    }

    #[tokio::test]
    async fn discover_reads_metadata() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let mock = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "issuer": base,
                    "authorization_endpoint": format!("{base}/authorize"),
                    "token_endpoint": format!("{base}/token"),
                })
                .to_string(),
            )
            .create_async()
            .await;

        let found = discover(&Client::new(), &base, LIMIT)
            .await
            .expect("discovery succeeds");
        assert_eq!(found.token_endpoint, format!("{base}/token"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn discover_maps_http_failure_to_oidc_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(404)
            .create_async()
            .await;

        let err = discover(&Client::new(), &server.url(), LIMIT)
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), &ErrorKind::OidcError);
    }

    #[tokio::test]
    async fn refresh_grant_posts_form_and_decodes_tokens() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
                Matcher::UrlEncoded("client_id".into(), "client".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"a2","token_type":"Bearer","expires_in":3600}"#)
            .create_async()
            .await;

        let tokens = refresh_grant(&Client::new(), &metadata(&server.url()), "client", "r1", LIMIT)
            .await
            .expect("grant succeeds");
        assert_eq!(tokens.access_token, "a2");
        assert_eq!(tokens.expires_in, Some(3600));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn refresh_grant_surfaces_oauth_error_body() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Token is not active"}"#)
            .create_async()
            .await;

        let err = refresh_grant(&Client::new(), &metadata(&server.url()), "client", "r1", LIMIT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, GrantError::Rejected { ref error, .. } if error == "invalid_grant"));
        assert_eq!(err.to_string(), "invalid_grant: Token is not active");
    }

    #[tokio::test]
    async fn refresh_grant_reports_bare_status() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let err = refresh_grant(&Client::new(), &metadata(&server.url()), "client", "r1", LIMIT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, GrantError::Status(502)));
    }
}
