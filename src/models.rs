//! JMAP wire types and MCP tool DTOs
//!
//! The wire types mirror RFC 8620 request/response envelopes. Method calls and
//! responses are `[name, arguments, callId]` triples, modelled as tuple structs
//! so serde encodes them as JSON arrays. Tool DTOs are annotated with
//! `JsonSchema` for automatic schema generation.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::JmapError;

/// Capability URN identifying mail support
pub const MAIL_CAPABILITY: &str = "urn:ietf:params:jmap:mail";

/// Capabilities sent in `using` when the caller does not specify any
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "urn:ietf:params:jmap:core",
    MAIL_CAPABILITY,
    "urn:ietf:params:jmap:submission",
];

/// Reserved method name signalling a method-level failure
pub const ERROR_METHOD: &str = "error";

/// A single JMAP method invocation: `[name, arguments, callId]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall(pub String, pub Value, pub String);

impl MethodCall {
    pub fn new(name: impl Into<String>, arguments: Value, call_id: impl Into<String>) -> Self {
        Self(name.into(), arguments, call_id.into())
    }
}

/// A single JMAP method response: `[name, arguments, callId]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResponse(pub String, pub Value, pub String);

impl MethodResponse {
    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn arguments(&self) -> &Value {
        &self.1
    }

    pub fn call_id(&self) -> &str {
        &self.2
    }

    /// Data type the method operates on (`Email` for `Email/get`)
    ///
    /// `None` for the reserved `error` response, which has no type prefix.
    pub fn data_type(&self) -> Option<&str> {
        self.0.split_once('/').map(|(data_type, _)| data_type)
    }

    /// State token carried by this response
    ///
    /// `newState` wins over `state` since it describes the server after the
    /// call (`/set`, `/changes`).
    pub fn state(&self) -> Option<&str> {
        self.1
            .get("newState")
            .and_then(Value::as_str)
            .or_else(|| self.1.get("state").and_then(Value::as_str))
    }
}

/// Request envelope posted to the API URL
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JmapRequest<'a> {
    pub using: &'a [String],
    pub method_calls: &'a [MethodCall],
}

/// Response envelope returned by the API URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JmapResponse {
    pub method_responses: Vec<MethodResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_ids: Option<Map<String, Value>>,
}

/// Session resource as served at the well-known session URL
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResource {
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    #[serde(default)]
    pub primary_accounts: HashMap<String, String>,
    pub api_url: String,
    pub state: String,
    pub username: Option<String>,
    pub download_url: Option<String>,
    pub upload_url: Option<String>,
    pub event_source_url: Option<String>,
}

/// Session captured by the client after discovery
///
/// `account_id` is the primary account for the mail capability and
/// `api_url` is absolute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub api_url: String,
    pub account_id: String,
    pub state: String,
    pub capabilities: Map<String, Value>,
    pub username: Option<String>,
    pub download_url: Option<String>,
    pub upload_url: Option<String>,
    pub event_source_url: Option<String>,
}

/// Method-level failure decoded from an `error` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MethodError {
    /// Server-reported error type (e.g. `stateMismatch`)
    #[serde(rename = "type")]
    pub error_type: String,
    /// Optional human-readable detail from the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<MethodError> for JmapError {
    fn from(err: MethodError) -> Self {
        JmapError::method(&err.error_type, err.description.as_deref())
    }
}

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Session summary returned by `jmap_get_session` (no credentials)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    /// Primary mail account ID
    pub account_id: String,
    /// API endpoint URL
    pub api_url: String,
    /// Session state token at discovery time
    pub state: String,
    /// Capability URNs advertised by the server
    pub capabilities: Vec<String>,
    /// Authenticated username, if reported
    pub username: Option<String>,
    /// Authentication method in use (`basic`, `bearer`, `oidc`)
    pub auth_method: String,
}

/// Mailbox metadata returned by `jmap_list_mailboxes`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MailboxInfo {
    pub id: String,
    pub name: String,
    /// Parent mailbox ID for nested mailboxes
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Special-use role (e.g. `inbox`, `trash`)
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub total_emails: Option<u64>,
    #[serde(default)]
    pub unread_emails: Option<u64>,
}

/// One method call in a `jmap_request` batch
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RawMethodCall {
    /// Method name (e.g. `Email/query`)
    pub name: String,
    /// Method arguments object; `accountId` defaults to the session account
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Call ID; defaults to the call's position in the batch
    pub call_id: Option<String>,
}

/// Input: raw JMAP batch
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RawRequestInput {
    /// Method calls executed in one HTTP round trip, in order
    pub method_calls: Vec<RawMethodCall>,
    /// Capability URNs for `using`; defaults to core, mail, submission
    pub using: Option<Vec<String>>,
}

/// Parsed outcome of one method response
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MethodOutcome {
    pub call_id: String,
    /// Method name as returned by the server (`error` on failure)
    pub method: String,
    /// Response arguments on success
    pub data: Option<Value>,
    /// Method-level error on failure
    pub error: Option<MethodError>,
}

/// Output of `jmap_request`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawRequestOutput {
    /// Server session state after the batch, if reported
    pub session_state: Option<String>,
    /// One entry per method response, in server order
    pub responses: Vec<MethodOutcome>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{JmapResponse, MethodCall, MethodResponse};

    #[test]
    fn method_call_serializes_as_triple() {
        let call = MethodCall::new("Mailbox/get", json!({ "accountId": "a" }), "0");
        let encoded = serde_json::to_value(&call).expect("serializes");
        assert_eq!(encoded, json!(["Mailbox/get", { "accountId": "a" }, "0"]));
    }

    #[test]
    fn response_state_prefers_new_state() {
        let set: MethodResponse = serde_json::from_value(json!([
            "Email/set",
            { "oldState": "s1", "newState": "s2" },
            "0"
        ]))
        .expect("decodes");
        assert_eq!(set.data_type(), Some("Email"));
        assert_eq!(set.state(), Some("s2"));

        let get: MethodResponse =
            serde_json::from_value(json!(["Mailbox/get", { "state": "m1", "list": [] }, "1"]))
                .expect("decodes");
        assert_eq!(get.state(), Some("m1"));

        let query: MethodResponse =
            serde_json::from_value(json!(["Email/query", { "queryState": "q" }, "2"]))
                .expect("decodes");
        assert_eq!(query.state(), None);
    }

    #[test]
    fn error_response_has_no_data_type() {
        let err: MethodResponse =
            serde_json::from_value(json!(["error", { "type": "unknownMethod" }, "3"]))
                .expect("decodes");
        assert_eq!(err.data_type(), None);
    }

    #[test]
    fn response_envelope_tolerates_missing_session_state() {
        let resp: JmapResponse = serde_json::from_value(json!({
            "methodResponses": [["Core/echo", {}, "0"]]
        }))
        .expect("decodes");
        assert_eq!(resp.method_responses.len(), 1);
        assert!(resp.session_state.is_none());
    }
}
