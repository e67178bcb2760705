//! Bridge types shared with consumers and the webview.
//!
//! These types provide a stable API surface for hosts embedding the bridge,
//! hiding the protocol plumbing underneath.

use serde::{Deserialize, Serialize};
use specta::Type;

/// Unique identifier for one agent session (UUID v4 string)
pub type SessionId = String;

/// JSON-RPC error codes (JSON-RPC 2.0 section 5.1)
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Generic implementation-defined server error
pub const SERVER_ERROR: i64 = -32000;

/// Lifecycle state of the agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Constructed, `initialize` not called yet
    Uninitialized,
    /// Agent launching or handshake in flight, or connection lost
    Initializing,
    /// Handshake complete; requests are accepted
    Ready,
    /// Old connection being torn down before a new handshake
    Restarting,
    /// Terminal state
    Disposed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Restarting => "restarting",
            SessionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Payload emitted when the session changes state
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateChangedEvent {
    pub state: SessionState,
    /// Session that reached `Ready`, if any
    pub session_id: Option<SessionId>,
}

/// A telemetry event recorded through the host facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub event_name: String,
    /// Event properties (a JSON object)
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// API errors for bridge consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
#[serde(tag = "type")]
pub enum ApiError {
    /// Invalid input parameter
    InvalidInput { message: String },
    /// IO error on the transport or while spawning the agent
    IoError { message: String },
    /// Malformed wire message; fatal to the transport it arrived on
    Decode { message: String },
    /// A request deadline elapsed before the response arrived
    Timeout { method: String, timeout_ms: u64 },
    /// Transport closed or session restarting
    Disconnected { message: String },
    /// No handler registered for an inbound request
    MethodNotFound { method: String },
    /// A request handler failed
    Handler { message: String },
    /// The peer answered with an error response
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
    /// Operation not valid in the current session state
    InvalidState { message: String },
    /// The session has been disposed
    Disposed,
}

impl ApiError {
    /// JSON-RPC error code used when this error is sent on the wire.
    pub fn code(&self) -> i64 {
        match self {
            ApiError::InvalidInput { .. } => INVALID_PARAMS,
            ApiError::Decode { .. } => PARSE_ERROR,
            ApiError::MethodNotFound { .. } => METHOD_NOT_FOUND,
            ApiError::Handler { .. } => INTERNAL_ERROR,
            ApiError::Remote { code, .. } => *code,
            _ => SERVER_ERROR,
        }
    }

    /// Shorthand for a `Disconnected` error.
    pub fn disconnected(message: impl Into<String>) -> Self {
        ApiError::Disconnected {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::InvalidInput { message } => write!(f, "Invalid input: {message}"),
            ApiError::IoError { message } => write!(f, "IO error: {message}"),
            ApiError::Decode { message } => write!(f, "Decode error: {message}"),
            ApiError::Timeout { method, timeout_ms } => {
                write!(f, "Request timed out: method={method}, after {timeout_ms}ms")
            }
            ApiError::Disconnected { message } => write!(f, "Disconnected: {message}"),
            ApiError::MethodNotFound { method } => write!(f, "Method not found: {method}"),
            ApiError::Handler { message } => write!(f, "Handler error: {message}"),
            ApiError::Remote { code, message, .. } => {
                write!(f, "Remote error: code={code}, message={message}")
            }
            ApiError::InvalidState { message } => write!(f, "Invalid state: {message}"),
            ApiError::Disposed => write!(f, "Session disposed"),
        }
    }
}

impl std::error::Error for ApiError {}
