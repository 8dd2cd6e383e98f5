//! Error types for the Nexus gateway.

use crate::types::{McpError, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the upstream transport layer.
///
/// Every variant answers `is_retryable()`: retryable errors may succeed on a
/// later attempt once the transport has reconnected; non-retryable ones are
/// terminal for the operation that produced them.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out after {0}ms")]
    ConnectionTimeout(u64),

    #[error("Connection closed")]
    ConnectionClosed { retryable: bool },

    #[error("Message send failed: {0}")]
    MessageSendFailed(String),

    #[error("Message receive failed: {0}")]
    MessageReceiveFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectionFailed { attempts: u32 },

    #[error("Transport not connected")]
    NotConnected,

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("RPC error: {0}")]
    Rpc(McpError),

    #[error("Outbound queue full")]
    QueueFull,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::ConnectionFailed(_) => true,
            TransportError::ConnectionTimeout(_) => true,
            TransportError::ConnectionClosed { retryable } => *retryable,
            TransportError::MessageSendFailed(_) => true,
            TransportError::MessageReceiveFailed(_) => true,
            TransportError::InvalidMessage(_) => false,
            TransportError::ReconnectionFailed { .. } => false,
            TransportError::NotConnected => true,
            TransportError::Timeout(_) => true,
            TransportError::Rpc(_) => false,
            TransportError::QueueFull => true,
        }
    }
}

/// Gateway-wide error type covering configuration, capability registry,
/// discovery, and virtual-server lifecycle failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Transport already registered: {0}")]
    TransportAlreadyRegistered(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid tool: {0}")]
    InvalidTool(String),

    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Duplicate tool '{name}' for source '{source_name}'")]
    DuplicateTool { source_name: String, name: String },

    #[error("Duplicate prompt '{name}' for source '{source_name}'")]
    DuplicatePrompt { source_name: String, name: String },

    #[error("Duplicate resource '{uri}' for source '{source_name}'")]
    DuplicateResource { source_name: String, uri: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Tool discovery failed for '{upstream}': {detail}")]
    ToolsDiscoveryFailed { upstream: String, detail: String },

    #[error("Prompt discovery failed for '{upstream}': {detail}")]
    PromptsDiscoveryFailed { upstream: String, detail: String },

    #[error("Resource discovery failed for '{upstream}': {detail}")]
    ResourcesDiscoveryFailed { upstream: String, detail: String },

    #[error("Port {0} unavailable")]
    PortUnavailable(u16),

    #[error("Unknown source server: {0}")]
    UnknownSource(String),

    #[error("Virtual server has no capabilities to expose")]
    StartupNoCapabilities,

    #[error("Virtual server instance not running: {0}")]
    InstanceNotRunning(String),

    #[error("No route for {kind} '{identifier}'")]
    CapabilityUnmapped { kind: String, identifier: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_retryable(),
            Error::Http(_) => true,
            _ => false,
        }
    }

    /// Map to the closest standard JSON-RPC error for a client response.
    ///
    /// A running virtual server answers every failed proxy attempt with one
    /// of these, never by dropping the connection.
    pub fn to_rpc_error(&self) -> McpError {
        match self {
            Error::CapabilityUnmapped { kind, identifier } => McpError::new(
                METHOD_NOT_FOUND,
                format!("No {} named '{}'", kind, identifier),
            ),
            Error::ToolNotFound(name) => {
                McpError::new(METHOD_NOT_FOUND, format!("No tool named '{}'", name))
            },
            Error::PromptNotFound(name) => {
                McpError::new(METHOD_NOT_FOUND, format!("No prompt named '{}'", name))
            },
            Error::InvalidTool(msg) | Error::InvalidPrompt(msg) | Error::InvalidResource(msg) => {
                McpError::new(INVALID_PARAMS, msg.clone())
            },
            Error::Transport(TransportError::Rpc(rpc)) => rpc.clone(),
            other => McpError::new(INTERNAL_ERROR, other.to_string()),
        }
    }
}
