//! Shared HTTP transport helpers
//!
//! Every outgoing call (JMAP, OIDC discovery, token endpoint) goes through
//! [`bounded`], which enforces the configured deadline and converts transport
//! failures into [`JmapError`] values.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::timeout;

use crate::errors::{JmapError, JmapResult};

/// Build the HTTP client shared by the JMAP client and the OIDC components
///
/// Deadlines are applied per call by [`bounded`] rather than on the client.
pub fn build_client() -> JmapResult<Client> {
    Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| JmapError::network("HTTP client setup", e))
}

/// Run a reqwest future under a deadline
///
/// # Errors
///
/// - `timeout` if the deadline elapses (the in-flight call is dropped)
/// - `invalidResponse` if the body could not be decoded
/// - `networkError` for any other transport failure
pub async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> JmapResult<T>
where
    F: Future<Output = Result<T, reqwest::Error>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| JmapError::timeout(operation, limit))
        .and_then(|r| {
            r.map_err(|e| {
                if e.is_timeout() {
                    JmapError::timeout(operation, limit)
                } else if e.is_decode() {
                    JmapError::invalid_response(operation, e)
                } else {
                    JmapError::network(operation, e)
                }
            })
        })
}

/// Send a request and read its full body under one deadline
///
/// Status handling is left to the caller so that error bodies (OAuth error
/// responses) stay readable.
pub async fn send_bounded(
    limit: Duration,
    operation: &str,
    request: RequestBuilder,
) -> JmapResult<(StatusCode, Vec<u8>)> {
    bounded(limit, operation, async {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body.to_vec()))
    })
    .await
}

/// Decode a JSON body read by [`send_bounded`]
pub fn decode_json<T: DeserializeOwned>(operation: &str, body: &[u8]) -> JmapResult<T> {
    serde_json::from_slice(body).map_err(|e| JmapError::invalid_response(operation, e))
}

/// Error for a non-success HTTP status
pub fn status_error(status: StatusCode) -> JmapError {
    JmapError::http_status(status.as_u16(), status.canonical_reason().unwrap_or(""))
}
