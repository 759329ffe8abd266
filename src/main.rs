//! jmap-mail-mcp: JMAP mail MCP server over stdio
//!
//! Exposes a JMAP mail account to MCP clients. Authentication is HTTP Basic,
//! a static bearer token, or OIDC with PKCE sign-in and automatic token
//! refresh.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, subcommands, and stdio serving
//! - [`config`]: Environment-driven configuration for endpoint and auth
//! - [`errors`]: Error taxonomy with remediation text and MCP error mapping
//! - [`http`]: Shared HTTP client and deadline wrapper
//! - [`jmap`]: Session discovery, batched requests, and state cache
//! - [`models`]: JMAP wire types and tool DTOs
//! - [`oidc`]: Discovery and token-endpoint grants
//! - [`oidc_flow`]: Interactive authorization-code flow with local callback
//! - [`token_refresh`]: Single-flight access-token renewal
//! - [`token_store`]: On-disk token persistence
//! - [`server`]: MCP tool handlers

mod config;
mod errors;
mod http;
mod jmap;
mod models;
mod oidc;
mod oidc_flow;
mod server;
mod token_refresh;
mod token_store;

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use clap::{Parser, Subcommand};
use config::ServerConfig;
use errors::JmapError;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::jmap::JmapClient;
use crate::token_refresh::TokenRefresher;
use crate::token_store::TokenStore;

#[derive(Debug, Parser)]
#[command(name = "jmap-mail-mcp", version, about = "JMAP mail MCP server over stdio")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Serve MCP over stdio (default)
    Serve,
    /// Sign in through the OIDC provider and store tokens
    Auth,
    /// Delete stored OIDC tokens
    Logout,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, and runs the selected
/// subcommand. Failures are printed to stderr with their remediation; stdout
/// carries MCP traffic only.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// JMAP_SESSION_URL=https://jmap.example.com/.well-known/jmap \
/// JMAP_USERNAME=user@example.com \
/// JMAP_PASSWORD=secret \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Command::Serve)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<JmapError>() {
                Some(jmap_err) => eprintln!("{}", jmap_err.to_user_message()),
                None => eprintln!("Error: {err}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), Box<dyn Error>> {
    let config = ServerConfig::load_from_env()?;
    match command {
        Command::Serve => serve(config).await,
        Command::Auth => authenticate(config).await,
        Command::Logout => logout(&config),
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let client = Arc::new(JmapClient::new(&config)?);
    let session = client.fetch_session().await?;
    info!(
        account_id = %session.account_id,
        auth_method = client.auth_method(),
        "starting MCP server on stdio"
    );

    let service = server::JmapMailServer::new(client).serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}

async fn authenticate(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let refresher = TokenRefresher::new(
        http::build_client()?,
        config.oidc.clone(),
        TokenStore::new(&config.token_file),
        Duration::from_millis(config.request_timeout_ms),
    );
    let tokens = oidc_flow::run_authorization_flow(&refresher).await?;

    eprintln!(
        "Authentication successful. Tokens saved to {}",
        refresher.store().path().display()
    );
    if let Some(expires) = tokens.expires_at.and_then(|at| DateTime::from_timestamp(at, 0)) {
        eprintln!("Access token expires at {}", expires.to_rfc3339());
    }
    if tokens.refresh_token.is_none() {
        eprintln!(
            "The provider issued no refresh token; include offline_access in JMAP_OIDC_SCOPE to avoid re-authenticating"
        );
    }
    Ok(())
}

fn logout(config: &ServerConfig) -> Result<(), Box<dyn Error>> {
    let store = TokenStore::new(&config.token_file);
    if store.clear()? {
        eprintln!("Removed stored tokens at {}", store.path().display());
    } else {
        eprintln!("No stored tokens at {}", store.path().display());
    }
    Ok(())
}
