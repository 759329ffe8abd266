//! Configuration module for the JMAP endpoint and authentication
//!
//! All configuration is loaded from environment variables prefixed with
//! `JMAP_`. The authentication method selects which credential variables are
//! required. OIDC issuer and client ID are only checked when a token is
//! actually needed, so that the failure carries the OIDC-specific remediation.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::errors::{JmapError, JmapResult};
use crate::token_store;

/// Default requested OIDC scopes (`offline_access` asks for a refresh token)
const DEFAULT_OIDC_SCOPE: &str = "openid email offline_access";

/// Source of configuration values, keyed by variable name
type Lookup<'a> = &'a dyn Fn(&str) -> Result<String, VarError>;

/// Authentication method and its credentials
///
/// Secrets are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    /// HTTP Basic with username and password
    Basic {
        username: String,
        password: SecretString,
    },
    /// Static bearer token
    Bearer { token: SecretString },
    /// Bearer token obtained and renewed through OIDC (see [`OidcConfig`])
    Oidc,
}

impl AuthConfig {
    /// Name as accepted by `JMAP_AUTH_METHOD`
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Basic { .. } => "basic",
            Self::Bearer { .. } => "bearer",
            Self::Oidc => "oidc",
        }
    }
}

/// OIDC provider settings
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// Issuer URL used for discovery
    pub issuer_url: Option<String>,
    /// Public client ID registered with the provider
    pub client_id: Option<String>,
    /// Space-separated scopes requested during authorization
    pub scope: String,
    /// Local port for the authorization callback listener
    pub redirect_port: u16,
    /// How long the interactive flow waits for the browser callback
    pub flow_timeout_seconds: u64,
}

impl OidcConfig {
    /// Issuer URL and client ID, or `oidcConfigError` naming what is missing
    pub fn require(&self) -> JmapResult<(&str, &str)> {
        let issuer = self.issuer_url.as_deref().filter(|v| !v.trim().is_empty());
        let client_id = self.client_id.as_deref().filter(|v| !v.trim().is_empty());
        match (issuer, client_id) {
            (Some(issuer), Some(client_id)) => Ok((issuer, client_id)),
            (None, None) => Err(JmapError::oidc_config(
                "JMAP_OIDC_ISSUER and JMAP_OIDC_CLIENT_ID",
            )),
            (None, Some(_)) => Err(JmapError::oidc_config("JMAP_OIDC_ISSUER")),
            (Some(_), None) => Err(JmapError::oidc_config("JMAP_OIDC_CLIENT_ID")),
        }
    }

    /// Redirect URI registered for the callback listener
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.redirect_port)
    }
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer_url: None,
            client_id: None,
            scope: DEFAULT_OIDC_SCOPE.to_owned(),
            redirect_port: 3000,
            flow_timeout_seconds: 300,
        }
    }
}

/// Server-wide configuration
///
/// Shared by the JMAP client, the token refresher, and the auth command.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// JMAP session resource URL
    pub session_url: String,
    /// Selected authentication method with credentials
    pub auth: AuthConfig,
    /// OIDC provider settings (used when `auth` is `Oidc` and by `auth`)
    pub oidc: OidcConfig,
    /// Upper bound for every outgoing HTTP call in milliseconds
    pub request_timeout_ms: u64,
    /// Location of the persisted OAuth token file
    pub token_file: PathBuf,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `configError` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// JMAP_SESSION_URL=https://jmap.example.com/.well-known/jmap
    /// JMAP_AUTH_METHOD=oidc
    /// JMAP_OIDC_ISSUER=https://sso.example.com
    /// JMAP_OIDC_CLIENT_ID=jmap-mail-mcp
    /// JMAP_REQUEST_TIMEOUT_MS=30000
    /// ```
    pub fn load_from_env() -> JmapResult<Self> {
        Self::from_lookup(&|key: &str| env::var(key))
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: Lookup<'_>) -> JmapResult<Self> {
        let session_url = required_var(lookup, "JMAP_SESSION_URL")?;
        if !(session_url.starts_with("http://") || session_url.starts_with("https://")) {
            return Err(JmapError::config(format!(
                "JMAP_SESSION_URL must be an http(s) URL: '{session_url}'"
            )));
        }

        let method = optional_var(lookup, "JMAP_AUTH_METHOD")?
            .unwrap_or_else(|| "basic".to_owned());
        let auth = match method.trim().to_ascii_lowercase().as_str() {
            "basic" => AuthConfig::Basic {
                username: required_var(lookup, "JMAP_USERNAME")?,
                password: SecretString::new(required_var(lookup, "JMAP_PASSWORD")?.into()),
            },
            "bearer" => AuthConfig::Bearer {
                token: SecretString::new(required_var(lookup, "JMAP_TOKEN")?.into()),
            },
            "oidc" => AuthConfig::Oidc,
            other => {
                return Err(JmapError::config(format!(
                    "invalid JMAP_AUTH_METHOD '{other}'; expected basic, bearer, or oidc"
                )));
            }
        };

        let defaults = OidcConfig::default();
        let oidc = OidcConfig {
            issuer_url: optional_var(lookup, "JMAP_OIDC_ISSUER")?,
            client_id: optional_var(lookup, "JMAP_OIDC_CLIENT_ID")?,
            scope: optional_var(lookup, "JMAP_OIDC_SCOPE")?.unwrap_or(defaults.scope),
            redirect_port: parse_u16_var(lookup, "JMAP_OIDC_REDIRECT_PORT", defaults.redirect_port)?,
            flow_timeout_seconds: parse_u64_var(
                lookup,
                "JMAP_OIDC_FLOW_TIMEOUT_SECONDS",
                defaults.flow_timeout_seconds,
            )?,
        };

        let token_file = match optional_var(lookup, "JMAP_TOKEN_FILE")? {
            Some(path) => PathBuf::from(path),
            None => token_store::default_token_path()?,
        };

        let request_timeout_ms = parse_u64_var(lookup, "JMAP_REQUEST_TIMEOUT_MS", 30_000)?;
        if request_timeout_ms == 0 {
            return Err(JmapError::config(
                "JMAP_REQUEST_TIMEOUT_MS must be greater than zero",
            ));
        }

        Ok(Self {
            session_url,
            auth,
            oidc,
            request_timeout_ms,
            token_file,
        })
    }
}

/// Read a required variable, returning error if missing or empty
fn required_var(lookup: Lookup<'_>, key: &str) -> JmapResult<String> {
    optional_var(lookup, key)?.ok_or_else(|| {
        JmapError::config(format!("missing required environment variable {key}"))
    })
}

/// Read an optional variable; empty or whitespace-only counts as unset
fn optional_var(lookup: Lookup<'_>, key: &str) -> JmapResult<Option<String>> {
    match lookup(key) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(v.trim().to_owned())),
        Ok(_) | Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(JmapError::config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u16` variable with default fallback
///
/// # Errors
///
/// Returns `configError` if the variable is set but not a valid `u16`.
fn parse_u16_var(lookup: Lookup<'_>, key: &str, default: u16) -> JmapResult<u16> {
    match optional_var(lookup, key)? {
        Some(v) => v.parse::<u16>().map_err(|_| {
            JmapError::config(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u64` variable with default fallback
///
/// # Errors
///
/// Returns `configError` if the variable is set but not a valid `u64`.
fn parse_u64_var(lookup: Lookup<'_>, key: &str, default: u64) -> JmapResult<u64> {
    match optional_var(lookup, key)? {
        Some(v) => v.parse::<u64>().map_err(|_| {
            JmapError::config(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::env::VarError;
    use std::path::PathBuf;

    use secrecy::ExposeSecret;

    use super::{AuthConfig, ServerConfig};
    use crate::errors::ErrorKind;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, crate::errors::JmapError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(&move |key: &str| {
            map.get(key).cloned().ok_or(VarError::NotPresent)
        })
    }

    #[test]
    fn loads_basic_auth_with_defaults() {
        let config = load(&[
            ("JMAP_SESSION_URL", "https://jmap.example.com/.well-known/jmap"),
            ("JMAP_AUTH_METHOD", "basic"),
            ("JMAP_USERNAME", "u"),
            ("JMAP_PASSWORD", "p"),
            ("JMAP_TOKEN_FILE", "/tmp/tokens.json"),
        ])
        .expect("config loads");

        match &config.auth {
            AuthConfig::Basic { username, password } => {
                assert_eq!(username, "u");
                assert_eq!(password.expose_secret(), "p");
            }
            other => panic!("unexpected auth config: {other:?}"),
        }
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.oidc.redirect_port, 3000);
        assert_eq!(config.token_file, PathBuf::from("/tmp/tokens.json"));
    }

    #[test]
    fn basic_is_the_default_method() {
        let err = load(&[("JMAP_SESSION_URL", "https://jmap.example.com/session")])
            .expect_err("basic credentials are required");
        assert_eq!(err.kind(), &ErrorKind::Config);
        assert!(err.message().contains("JMAP_USERNAME"));
    }

    #[test]
    fn bearer_requires_token() {
        let err = load(&[
            ("JMAP_SESSION_URL", "https://jmap.example.com/session"),
            ("JMAP_AUTH_METHOD", "bearer"),
        ])
        .expect_err("must fail");
        assert!(err.message().contains("JMAP_TOKEN"));
    }

    #[test]
    fn oidc_settings_are_checked_lazily() {
        let config = load(&[
            ("JMAP_SESSION_URL", "https://jmap.example.com/session"),
            ("JMAP_AUTH_METHOD", "OIDC"),
            ("JMAP_OIDC_CLIENT_ID", "client"),
            ("JMAP_TOKEN_FILE", "/tmp/tokens.json"),
        ])
        .expect("incomplete OIDC settings still load");
        assert_eq!(config.auth.method_name(), "oidc");

        let err = config.oidc.require().expect_err("issuer is missing");
        assert_eq!(err.kind(), &ErrorKind::OidcConfigError);
        assert!(err.message().contains("JMAP_OIDC_ISSUER"));
    }

    #[test]
    fn rejects_unknown_auth_method_and_bad_numbers() {
        let err = load(&[
            ("JMAP_SESSION_URL", "https://jmap.example.com/session"),
            ("JMAP_AUTH_METHOD", "kerberos"),
        ])
        .expect_err("must fail");
        assert!(err.message().contains("kerberos"));

        let err = load(&[
            ("JMAP_SESSION_URL", "https://jmap.example.com/session"),
            ("JMAP_AUTH_METHOD", "bearer"),
            ("JMAP_TOKEN", "t"),
            ("JMAP_REQUEST_TIMEOUT_MS", "soon"),
        ])
        .expect_err("must fail");
        assert!(err.message().contains("JMAP_REQUEST_TIMEOUT_MS"));
    }

    #[test]
    fn rejects_non_http_session_url() {
        let err = load(&[
            ("JMAP_SESSION_URL", "ftp://jmap.example.com"),
            ("JMAP_AUTH_METHOD", "bearer"),
            ("JMAP_TOKEN", "t"),
        ])
        .expect_err("must fail");
        assert!(err.message().contains("http(s)"));
    }
}
