//! Error taxonomy with remediation hints and MCP error mapping
//!
//! Every failure in the client and auth core becomes a [`JmapError`] carrying a
//! machine-readable [`ErrorKind`], a message, and a `fix` string meant to be
//! shown verbatim to the operator. Constructors are grouped by origin: HTTP
//! status, JMAP method-level errors, and local conditions.

use std::fmt;
use std::time::Duration;

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Command the operator runs to (re-)authenticate with the OIDC provider
pub const AUTH_COMMAND: &str = "jmap-mail-mcp auth";

/// Machine-readable error category
///
/// [`ErrorKind::as_str`] yields the wire-style camelCase name. JMAP
/// method-level errors keep the type string reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// HTTP 401
    Unauthorized,
    /// HTTP 403
    Forbidden,
    /// HTTP 404, or a session that was never fetched
    NotFound,
    /// HTTP 5xx
    ServerError,
    /// Any other non-success HTTP status
    HttpError,
    /// Session resource has no primary account for the mail capability
    NoMailAccount,
    /// JMAP method-level error, type taken verbatim from the server
    Method(String),
    /// Local deadline exceeded
    Timeout,
    /// Transport failure other than a timeout
    Network,
    /// Response body could not be decoded
    InvalidResponse,
    /// Access token expired and cannot be silently renewed
    TokenExpired,
    /// Refresh-token grant rejected or failed
    RefreshFailed,
    /// No persisted tokens; interactive auth has not run
    NoStoredTokens,
    /// OIDC issuer URL or client ID missing
    OidcConfigError,
    /// OIDC discovery or protocol failure
    OidcError,
    /// Interactive authorization-code flow failed at some stage
    OidcFlowError,
    /// Token file could not be read or written
    TokenStore,
    /// Invalid or missing configuration
    Config,
}

impl ErrorKind {
    /// Wire-style name of this kind (e.g. `unauthorized`, `stateMismatch`)
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "notFound",
            Self::ServerError => "serverError",
            Self::HttpError => "httpError",
            Self::NoMailAccount => "noMailAccount",
            Self::Method(error_type) => error_type.as_str(),
            Self::Timeout => "timeout",
            Self::Network => "networkError",
            Self::InvalidResponse => "invalidResponse",
            Self::TokenExpired => "tokenExpired",
            Self::RefreshFailed => "refreshFailed",
            Self::NoStoredTokens => "noStoredTokens",
            Self::OidcConfigError => "oidcConfigError",
            Self::OidcError => "oidcError",
            Self::OidcFlowError => "oidcFlowError",
            Self::TokenStore => "tokenStoreError",
            Self::Config => "configError",
        }
    }

    /// Whether this kind originates in authentication or token handling
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized
                | Self::TokenExpired
                | Self::RefreshFailed
                | Self::NoStoredTokens
                | Self::OidcConfigError
                | Self::OidcError
                | Self::OidcFlowError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error type
///
/// Cloneable so that a single failed refresh can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct JmapError {
    kind: ErrorKind,
    message: String,
    fix: String,
}

impl JmapError {
    /// Build an error from its parts
    pub fn new(kind: ErrorKind, message: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fix: fix.into(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Remediation text shown verbatim to the operator
    pub fn fix(&self) -> &str {
        &self.fix
    }

    /// Map an HTTP status to its error kind
    ///
    /// # Mappings
    ///
    /// - `401` → `unauthorized`
    /// - `403` → `forbidden`
    /// - `404` → `notFound`
    /// - `5xx` → `serverError`
    /// - anything else → `httpError`
    pub fn http_status(status: u16, status_text: &str) -> Self {
        let message = format!("HTTP {status} {status_text}").trim_end().to_owned();
        match status {
            401 => Self::new(
                ErrorKind::Unauthorized,
                message,
                format!(
                    "Check JMAP_USERNAME/JMAP_PASSWORD or JMAP_TOKEN; for OIDC re-authenticate using: {AUTH_COMMAND}"
                ),
            ),
            403 => Self::new(
                ErrorKind::Forbidden,
                message,
                "The account is not allowed to perform this operation; check its permissions on the JMAP server",
            ),
            404 => Self::new(
                ErrorKind::NotFound,
                message,
                "Verify that JMAP_SESSION_URL points at the server's JMAP session resource",
            ),
            500..=599 => Self::new(
                ErrorKind::ServerError,
                message,
                "The JMAP server failed to handle the request; retry later or contact the server administrator",
            ),
            _ => Self::new(
                ErrorKind::HttpError,
                message,
                "The JMAP server returned an unexpected HTTP status; check the server logs",
            ),
        }
    }

    /// Build an error from a JMAP method-level `error` response
    ///
    /// The kind is the server-reported type; the fix comes from a table of
    /// known RFC 8620/8621 error types with a generic fallback.
    pub fn method(error_type: &str, description: Option<&str>) -> Self {
        let message = match description {
            Some(description) if !description.is_empty() => {
                format!("JMAP method error ({error_type}): {description}")
            }
            _ => format!("JMAP method error ({error_type})"),
        };
        Self::new(
            ErrorKind::Method(error_type.to_owned()),
            message,
            method_error_fix(error_type),
        )
    }

    pub fn no_mail_account() -> Self {
        Self::new(
            ErrorKind::NoMailAccount,
            "JMAP session has no primary account for urn:ietf:params:jmap:mail",
            "Make sure the authenticated user has a mail account on the JMAP server",
        )
    }

    pub fn session_not_initialized() -> Self {
        Self::new(
            ErrorKind::NotFound,
            "Session not initialized",
            "Call fetch_session() before issuing JMAP requests",
        )
    }

    /// Local deadline exceeded for the named operation
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{operation} timed out after {}ms", after.as_millis()),
            "Check connectivity to the server or raise JMAP_REQUEST_TIMEOUT_MS",
        )
    }

    pub fn network(operation: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::Network,
            format!("{operation} failed: {detail}"),
            "Check that the server is reachable and the configured URL is correct",
        )
    }

    pub fn invalid_response(operation: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::InvalidResponse,
            format!("{operation} returned an invalid response: {detail}"),
            "The server response did not match the expected format; check the server version and URL",
        )
    }

    /// Access token expired
    ///
    /// `refresh_available` tells whether a refresh token existed; without one
    /// the only way forward is interactive re-authentication.
    pub fn token_expired(refresh_available: bool) -> Self {
        let message = if refresh_available {
            "OIDC access token expired"
        } else {
            "OIDC access token expired and no refresh token is available"
        };
        Self::new(
            ErrorKind::TokenExpired,
            message,
            format!("Re-authenticate using: {AUTH_COMMAND}"),
        )
    }

    pub fn refresh_failed(reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::RefreshFailed,
            format!("OIDC token refresh failed: {reason}"),
            format!("Re-authenticate using: {AUTH_COMMAND}"),
        )
    }

    pub fn no_stored_tokens() -> Self {
        Self::new(
            ErrorKind::NoStoredTokens,
            "No stored OIDC tokens found",
            format!("Authenticate first using: {AUTH_COMMAND}"),
        )
    }

    /// OIDC configuration incomplete; `missing` names the absent setting(s)
    pub fn oidc_config(missing: &str) -> Self {
        Self::new(
            ErrorKind::OidcConfigError,
            format!("OIDC configuration incomplete: missing {missing}"),
            "Set JMAP_OIDC_ISSUER and JMAP_OIDC_CLIENT_ID when JMAP_AUTH_METHOD=oidc",
        )
    }

    pub fn oidc(detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::OidcError,
            format!("OIDC error: {detail}"),
            "Verify JMAP_OIDC_ISSUER and that the identity provider is reachable",
        )
    }

    /// Interactive flow failure at `stage` (listener, authorization, exchange ...)
    pub fn oidc_flow(stage: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::OidcFlowError,
            format!("OIDC authorization failed during {stage}: {detail}"),
            format!("Retry using: {AUTH_COMMAND}"),
        )
    }

    pub fn token_store(operation: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::TokenStore,
            format!("token file {operation} failed: {detail}"),
            "Check permissions on the token file directory or set JMAP_TOKEN_FILE",
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Config,
            message,
            "Fix the JMAP_* environment variables and restart",
        )
    }

    /// Render message and fix for the stderr startup formatter
    pub fn to_user_message(&self) -> String {
        format!("Error [{}]: {}\nFix: {}", self.kind, self.message, self.fix)
    }

    /// Convert to MCP `ErrorData`
    ///
    /// Includes a structured `code` (the kind name) and `fix` for client
    /// error handling.
    ///
    /// # Mappings
    ///
    /// - `notFound`, `accountNotFound` → `resource_not_found`
    /// - `invalidArguments`, `configError` → `invalid_params`
    /// - auth kinds, `forbidden`, other method errors → `invalid_request`
    /// - everything else → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let data = Some(json!({ "code": self.kind.as_str(), "fix": self.fix }));
        let message = self.message.clone();
        match &self.kind {
            ErrorKind::NotFound => ErrorData::resource_not_found(message, data),
            ErrorKind::Method(t) if t == "accountNotFound" || t == "notFound" => {
                ErrorData::resource_not_found(message, data)
            }
            ErrorKind::Method(t) if t == "invalidArguments" => {
                ErrorData::invalid_params(message, data)
            }
            ErrorKind::Config => ErrorData::invalid_params(message, data),
            ErrorKind::Method(_) | ErrorKind::Forbidden => ErrorData::invalid_request(message, data),
            kind if kind.is_auth() => ErrorData::invalid_request(message, data),
            _ => ErrorData::internal_error(message, data),
        }
    }
}

/// Remediation text for JMAP method-level error types
fn method_error_fix(error_type: &str) -> &'static str {
    match error_type {
        "stateMismatch" => {
            "The server state changed since it was last read; refetch the objects and retry with the new state"
        }
        "cannotCalculateChanges" => {
            "The server cannot compute changes from the cached state; clear the cached state and resync fully"
        }
        "accountNotFound" => {
            "The account ID is unknown to the server; refetch the session to obtain a valid account ID"
        }
        "accountNotSupportedByMethod" => "This account does not support the requested method",
        "accountReadOnly" => "The account is read-only; write operations are not permitted",
        "unknownCapability" => {
            "The server does not support a requested capability; check the session capabilities"
        }
        "unknownMethod" => "The server does not implement this method",
        "invalidArguments" => "Check the method arguments against RFC 8620/8621",
        "invalidResultReference" => {
            "A result reference points at a missing or failed call; check call IDs and paths"
        }
        "forbidden" => "The account is not permitted to call this method",
        "notFound" => "The requested object does not exist; it may have been deleted",
        "requestTooLarge" => "Split the batch into smaller requests",
        "tooManyChanges" => "Request changes with a smaller maxChanges or resync fully",
        "anchorNotFound" => "The query anchor is not in the result set; retry without an anchor",
        "unsupportedSort" => "The server does not support this sort; use a different sort property",
        "unsupportedFilter" => "The server does not support this filter; simplify the filter",
        "serverFail" | "serverPartialFail" | "serverUnavailable" => {
            "The server failed to process the method; retry later"
        }
        _ => "Unexpected JMAP error; see the error description for details",
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type JmapResult<T> = Result<T, JmapError>;
