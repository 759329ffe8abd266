//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait over a shared [`JmapClient`] and
//! registers three tools: session inspection, mailbox listing, and a raw
//! batched JMAP request. Errors are converted to MCP `ErrorData` carrying the
//! JMAP error kind and its remediation text.

use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::errors::{JmapError, JmapResult};
use crate::jmap::JmapClient;
use crate::models::{
    MailboxInfo, Meta, MethodCall, MethodOutcome, RawRequestInput, RawRequestOutput, Session,
    SessionInfo, ToolEnvelope,
};

/// Maximum method calls accepted in one `jmap_request` batch
const MAX_METHOD_CALLS: usize = 64;
/// Mailbox properties requested by `jmap_list_mailboxes`
const MAILBOX_PROPERTIES: &[&str] = &[
    "id",
    "name",
    "parentId",
    "role",
    "totalEmails",
    "unreadEmails",
];

/// JMAP mail MCP server
///
/// Cheap to clone; all clones share one client, its session, and its token
/// refresher.
#[derive(Clone)]
pub struct JmapMailServer {
    client: Arc<JmapClient>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl JmapMailServer {
    /// Create a server over a client whose session was already fetched
    pub fn new(client: Arc<JmapClient>) -> Self {
        Self {
            client,
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: Show the discovered session
    ///
    /// Returns account ID, API URL, and capability URNs without exposing
    /// credentials.
    #[tool(
        name = "jmap_get_session",
        description = "Show the JMAP session: primary mail account, API URL, and capabilities"
    )]
    async fn get_session(&self) -> Result<Json<ToolEnvelope<SessionInfo>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.client.get_session().map(|session| {
                let info = session_info(&session, self.client.auth_method());
                (format!("JMAP account {}", info.account_id), info)
            }),
        )
    }

    /// Tool: List mailboxes of the primary mail account
    #[tool(
        name = "jmap_list_mailboxes",
        description = "List mailboxes with role and message counts"
    )]
    async fn list_mailboxes(&self) -> Result<Json<ToolEnvelope<Vec<MailboxInfo>>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.list_mailboxes_impl()
                .await
                .map(|data| (format!("{} mailbox(es)", data.len()), data)),
        )
    }

    /// Tool: Send a raw JMAP batch
    ///
    /// Each call's `accountId` defaults to the session account and its call
    /// ID to `c<index>`. Method-level failures are reported per call rather
    /// than failing the whole tool.
    #[tool(
        name = "jmap_request",
        description = "Send a batch of JMAP method calls in one round trip"
    )]
    async fn raw_request(
        &self,
        Parameters(input): Parameters<RawRequestInput>,
    ) -> Result<Json<ToolEnvelope<RawRequestOutput>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.raw_request_impl(input).await.map(|data| {
                let failed = data.responses.iter().filter(|r| r.error.is_some()).count();
                (
                    format!(
                        "{} method response(s), {failed} error(s)",
                        data.responses.len()
                    ),
                    data,
                )
            }),
        )
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for JmapMailServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.instructions = Some(
            "JMAP mail MCP server. Use jmap_get_session for the account ID, jmap_list_mailboxes for mailbox IDs, and jmap_request for any other JMAP method.".to_owned(),
        );
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

impl JmapMailServer {
    async fn list_mailboxes_impl(&self) -> JmapResult<Vec<MailboxInfo>> {
        let session = self.client.get_session()?;
        let calls = [MethodCall::new(
            "Mailbox/get",
            json!({ "accountId": session.account_id, "properties": MAILBOX_PROPERTIES }),
            "0",
        )];
        let response = self.client.request(&calls, None).await?;
        let entry = response
            .method_responses
            .first()
            .ok_or_else(|| JmapError::invalid_response("Mailbox/get", "no method response"))?;
        let data = JmapClient::parse_method_response(entry)?;

        let list = data.get("list").cloned().unwrap_or(Value::Array(Vec::new()));
        let mut mailboxes: Vec<MailboxInfo> = serde_json::from_value(list)
            .map_err(|e| JmapError::invalid_response("Mailbox/get", e))?;
        mailboxes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(mailboxes)
    }

    async fn raw_request_impl(&self, input: RawRequestInput) -> JmapResult<RawRequestOutput> {
        let session = self.client.get_session()?;
        let mut calls = build_method_calls(&input, &session.account_id)?;
        fill_since_state(&mut calls, |data_type| self.client.get_state(data_type));
        let response = self
            .client
            .request(&calls, input.using.as_deref())
            .await?;

        let responses = response
            .method_responses
            .iter()
            .map(|entry| match JmapClient::parse_method_response(entry) {
                Ok(data) => MethodOutcome {
                    call_id: entry.call_id().to_owned(),
                    method: entry.name().to_owned(),
                    data: Some(data.clone()),
                    error: None,
                },
                Err(error) => {
                    if error.error_type == "cannotCalculateChanges"
                        && let Some(data_type) = called_data_type(&calls, entry.call_id())
                    {
                        debug!(data_type, "server cannot calculate changes; dropping cached state");
                        self.client.clear_state(Some(data_type));
                    }
                    MethodOutcome {
                        call_id: entry.call_id().to_owned(),
                        method: entry.name().to_owned(),
                        data: None,
                        error: Some(error),
                    }
                }
            })
            .collect();

        Ok(RawRequestOutput {
            session_state: response.session_state,
            responses,
        })
    }
}

fn session_info(session: &Session, auth_method: &str) -> SessionInfo {
    let mut capabilities: Vec<String> = session.capabilities.keys().cloned().collect();
    capabilities.sort();
    SessionInfo {
        account_id: session.account_id.clone(),
        api_url: session.api_url.clone(),
        state: session.state.clone(),
        capabilities,
        username: session.username.clone(),
        auth_method: auth_method.to_owned(),
    }
}

/// Validate the batch and fill in `accountId` and call ID defaults
fn build_method_calls(input: &RawRequestInput, account_id: &str) -> JmapResult<Vec<MethodCall>> {
    if input.method_calls.is_empty() {
        return Err(invalid_arguments("method_calls must not be empty"));
    }
    if input.method_calls.len() > MAX_METHOD_CALLS {
        return Err(invalid_arguments(&format!(
            "at most {MAX_METHOD_CALLS} method calls per batch"
        )));
    }

    input
        .method_calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            let Some((data_type, _)) = call.name.split_once('/') else {
                return Err(invalid_arguments(&format!(
                    "method name '{}' must look like Type/method",
                    call.name
                )));
            };
            let mut arguments = call.arguments.clone();
            if data_type != "Core" {
                arguments
                    .entry("accountId")
                    .or_insert_with(|| Value::String(account_id.to_owned()));
            }
            let call_id = call.call_id.clone().unwrap_or_else(|| format!("c{index}"));
            Ok(MethodCall::new(call.name.clone(), Value::Object(arguments), call_id))
        })
        .collect()
}

/// Default `sinceState` of `/changes` calls to the last state seen for the type
fn fill_since_state(calls: &mut [MethodCall], known: impl Fn(&str) -> Option<String>) {
    for call in calls {
        let Some(data_type) = call.0.strip_suffix("/changes") else {
            continue;
        };
        let Value::Object(arguments) = &mut call.1 else {
            continue;
        };
        if !arguments.contains_key("sinceState")
            && let Some(state) = known(data_type)
        {
            arguments.insert("sinceState".to_owned(), Value::String(state));
        }
    }
}

/// Data type of the request call answered by `call_id`
fn called_data_type<'a>(calls: &'a [MethodCall], call_id: &str) -> Option<&'a str> {
    calls
        .iter()
        .find(|call| call.2 == call_id)
        .and_then(|call| call.0.split_once('/'))
        .map(|(data_type, _)| data_type)
}

fn invalid_arguments(detail: &str) -> JmapError {
    JmapError::method("invalidArguments", Some(detail))
}

/// Compute tool execution duration in milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Finalize tool result into MCP response envelope
///
/// Wraps successful results in `ToolEnvelope` with timing metadata; converts
/// errors into MCP `ErrorData`.
fn finalize_tool<T>(
    started: Instant,
    result: JmapResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => {
            warn!(kind = %e.kind(), fix = e.fix(), "tool call failed: {e}");
            Err(e.to_error_data())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use mockito::{Matcher, Server, ServerGuard};
    use reqwest::Client;
    use secrecy::SecretString;
    use serde_json::{Map, Value, json};

    use super::{JmapMailServer, build_method_calls, fill_since_state, session_info};
    use crate::config::{AuthConfig, OidcConfig, ServerConfig};
    use crate::errors::ErrorKind;
    use crate::jmap::JmapClient;
    use crate::models::{MethodCall, RawMethodCall, RawRequestInput, Session};

    fn raw_call(name: &str, arguments: Value, call_id: Option<&str>) -> RawMethodCall {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        RawMethodCall {
            name: name.to_owned(),
            arguments,
            call_id: call_id.map(str::to_owned),
        }
    }

    #[test]
    fn build_method_calls_fills_defaults() {
        let input = RawRequestInput {
            method_calls: vec![
                raw_call("Email/query", json!({ "limit": 5 }), None),
                raw_call("Email/get", json!({ "accountId": "other" }), Some("get")),
                raw_call("Core/echo", json!({ "hello": true }), None),
            ],
            using: None,
        };
        let calls = build_method_calls(&input, "acct-1").expect("valid batch");
        assert_eq!(calls[0].1, json!({ "limit": 5, "accountId": "acct-1" }));
        assert_eq!(calls[0].2, "c0");
        assert_eq!(calls[1].1["accountId"], "other");
        assert_eq!(calls[1].2, "get");
        assert_eq!(calls[2].1, json!({ "hello": true }));
    }

    #[test]
    fn build_method_calls_rejects_bad_batches() {
        let empty = RawRequestInput {
            method_calls: Vec::new(),
            using: None,
        };
        let err = build_method_calls(&empty, "a").expect_err("must fail");
        assert_eq!(err.kind(), &ErrorKind::Method("invalidArguments".to_owned()));

        let unnamed = RawRequestInput {
            method_calls: vec![raw_call("echo", json!({}), None)],
            using: None,
        };
        assert!(build_method_calls(&unnamed, "a").is_err());

        let oversized = RawRequestInput {
            method_calls: (0..65)
                .map(|_| raw_call("Core/echo", json!({}), None))
                .collect(),
            using: None,
        };
        assert!(build_method_calls(&oversized, "a").is_err());
    }

    #[test]
    fn fill_since_state_defaults_changes_calls_only() {
        let mut calls = vec![
            MethodCall::new("Email/changes", json!({ "accountId": "a" }), "0"),
            MethodCall::new("Mailbox/changes", json!({ "sinceState": "given" }), "1"),
            MethodCall::new("Thread/changes", json!({}), "2"),
            MethodCall::new("Email/get", json!({}), "3"),
        ];
        fill_since_state(&mut calls, |data_type| match data_type {
            "Email" => Some("e7".to_owned()),
            "Mailbox" => Some("m7".to_owned()),
            _ => None,
        });
        assert_eq!(calls[0].1, json!({ "accountId": "a", "sinceState": "e7" }));
        assert_eq!(calls[1].1, json!({ "sinceState": "given" }));
        assert_eq!(calls[2].1, json!({}));
        assert_eq!(calls[3].1, json!({}));
    }

    #[test]
    fn session_info_sorts_capabilities() {
        let mut capabilities = Map::new();
        capabilities.insert("urn:ietf:params:jmap:mail".to_owned(), json!({}));
        capabilities.insert("urn:ietf:params:jmap:core".to_owned(), json!({}));
        let session = Session {
            api_url: "https://jmap.example.com/api/".to_owned(),
            account_id: "acct-1".to_owned(),
            state: "s1".to_owned(),
            capabilities,
            username: Some("u@example.com".to_owned()),
            download_url: None,
            upload_url: None,
            event_source_url: None,
        };
        let info = session_info(&session, "basic");
        assert_eq!(
            info.capabilities,
            vec!["urn:ietf:params:jmap:core", "urn:ietf:params:jmap:mail"]
        );
        assert_eq!(info.auth_method, "basic");
    }

    async fn connected_client(server: &mut ServerGuard) -> Arc<JmapClient> {
        let api_url = format!("{}/api/", server.url());
        server
            .mock("GET", "/.well-known/jmap")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "capabilities": { "urn:ietf:params:jmap:mail": {} },
                    "primaryAccounts": { "urn:ietf:params:jmap:mail": "acct-1" },
                    "apiUrl": api_url,
                    "state": "s1"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = ServerConfig {
            session_url: format!("{}/.well-known/jmap", server.url()),
            auth: AuthConfig::Bearer {
                token: SecretString::new("t".into()),
            },
            oidc: OidcConfig::default(),
            request_timeout_ms: 5_000,
            token_file: PathBuf::from("unused.json"),
        };
        let client = Arc::new(JmapClient::with_http(&config, Client::new()));
        client.fetch_session().await.expect("session");
        client
    }

    #[tokio::test]
    async fn list_mailboxes_sorts_by_name() {
        let mut server = Server::new_async().await;
        let client = connected_client(&mut server).await;
        server
            .mock("POST", "/api/")
            .match_body(Matcher::Regex("Mailbox/get".to_owned()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "methodResponses": [["Mailbox/get", {
                        "accountId": "acct-1",
                        "state": "m1",
                        "list": [
                            { "id": "b", "name": "Trash", "role": "trash", "totalEmails": 3 },
                            { "id": "a", "name": "Inbox", "role": "inbox", "unreadEmails": 2 }
                        ]
                    }, "0"]],
                    "sessionState": "s1"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mcp = JmapMailServer::new(Arc::clone(&client));
        let mailboxes = mcp.list_mailboxes_impl().await.expect("mailboxes");
        let names: Vec<&str> = mailboxes.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Inbox", "Trash"]);
        assert_eq!(mailboxes[0].unread_emails, Some(2));
        assert_eq!(client.get_state("Mailbox").as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn changes_call_uses_cached_state_and_drops_it_when_rejected() {
        let mut server = Server::new_async().await;
        let client = connected_client(&mut server).await;
        let api = server
            .mock("POST", "/api/")
            .match_body(Matcher::PartialJson(json!({
                "methodCalls": [
                    ["Email/changes", { "accountId": "acct-1", "sinceState": "e1" }, "c0"]
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "methodResponses": [["error", { "type": "cannotCalculateChanges" }, "c0"]],
                    "sessionState": "s1"
                })
                .to_string(),
            )
            .create_async()
            .await;
        client.update_state("Email", "e1");
        client.update_state("Mailbox", "m1");

        let mcp = JmapMailServer::new(Arc::clone(&client));
        let output = mcp
            .raw_request_impl(RawRequestInput {
                method_calls: vec![raw_call("Email/changes", json!({}), None)],
                using: None,
            })
            .await
            .expect("batch");

        let error = output.responses[0].error.as_ref().expect("method error");
        assert_eq!(error.error_type, "cannotCalculateChanges");
        assert_eq!(client.get_state("Email"), None);
        assert_eq!(client.get_state("Mailbox").as_deref(), Some("m1"));
        api.assert_async().await;
    }
}
