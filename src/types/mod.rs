//! Protocol types and capability records.
//!
//! JSON-RPC 2.0 message shapes shared by the upstream-facing transport and
//! the virtual-server runtime, plus the flat tool/prompt/resource records
//! the capability catalog indexes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC correlation id, string or integer.
///
/// Keys the per-transport pending-request table, so it must be hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Mint a fresh opaque id for proxied or internally generated requests.
    pub fn generate() -> Self {
        RequestId::String(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// MCP JSON-RPC request (carries an id, expects a response)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    pub fn new(method: impl Into<String>, params: Value, id: RequestId) -> Self {
        let params = if params.is_null() { None } else { Some(params) };
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Look up a string parameter by key.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

/// MCP JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        let params = if params.is_null() { None } else { Some(params) };
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// MCP JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl McpResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: McpError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// MCP JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {}", detail.into()))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, format!("Invalid request: {}", detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", detail.into()))
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, detail.into())
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Any JSON-RPC message that may arrive on or be written to a channel.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum McpMessage {
    Request(McpRequest),
    Response(McpResponse),
    Notification(McpNotification),
}

impl McpMessage {
    /// Classify a raw JSON value into request, response, or notification.
    ///
    /// A `method` field marks requests and notifications (split on `id`);
    /// everything else must be a response carrying `result` or `error`.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let has_method = value.get("method").map(|m| !m.is_null()).unwrap_or(false);
        let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);

        if has_method {
            if has_id {
                serde_json::from_value(value)
                    .map(McpMessage::Request)
                    .map_err(|e| e.to_string())
            } else {
                serde_json::from_value(value)
                    .map(McpMessage::Notification)
                    .map_err(|e| e.to_string())
            }
        } else {
            let response: McpResponse =
                serde_json::from_value(value).map_err(|e| e.to_string())?;
            if response.result.is_none() && response.error.is_none() {
                return Err("response carries neither result nor error".to_string());
            }
            Ok(McpMessage::Response(response))
        }
    }

    /// The correlation id, if this message carries one.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            McpMessage::Request(r) => Some(&r.id),
            McpMessage::Response(r) => r.id.as_ref(),
            McpMessage::Notification(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, McpMessage::Request(_))
    }
}

/// Capability kind discriminator used by routing maps and selection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Tool => write!(f, "tool"),
            CapabilityKind::Prompt => write!(f, "prompt"),
            CapabilityKind::Resource => write!(f, "resource"),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Tool record as exposed by an upstream.
///
/// `source` is attached at discovery time and never serialized back out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object")]
    pub input_schema: Value,
    #[serde(skip)]
    pub source: String,
}

impl Tool {
    /// Schema validation performed at catalog registration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("tool name must not be empty".to_string());
        }
        if !self.input_schema.is_object() {
            return Err(format!(
                "tool '{}' inputSchema must be an object",
                self.name
            ));
        }
        Ok(())
    }
}

/// Prompt argument descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Prompt record as exposed by an upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
    #[serde(skip)]
    pub source: String,
}

impl Prompt {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("prompt name must not be empty".to_string());
        }
        Ok(())
    }
}

/// Resource record as exposed by an upstream, keyed by uri.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip)]
    pub source: String,
}

impl Resource {
    pub fn validate(&self) -> Result<(), String> {
        if self.uri.trim().is_empty() {
            return Err("resource uri must not be empty".to_string());
        }
        Ok(())
    }
}

/// Runtime status of an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    Online,
    Offline,
    Error,
}

impl fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamStatus::Online => write!(f, "online"),
            UpstreamStatus::Offline => write!(f, "offline"),
            UpstreamStatus::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle status of a virtual server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmcpStatus {
    Stopped,
    Starting,
    Running,
    Error,
    PartiallyDegraded,
}

impl fmt::Display for VmcpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmcpStatus::Stopped => write!(f, "stopped"),
            VmcpStatus::Starting => write!(f, "starting"),
            VmcpStatus::Running => write!(f, "running"),
            VmcpStatus::Error => write!(f, "error"),
            VmcpStatus::PartiallyDegraded => write!(f, "partially_degraded"),
        }
    }
}

/// Per-source health as seen by a virtual server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderlyingServerStatus {
    pub name: String,
    pub status: UpstreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
