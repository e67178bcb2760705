//! Typed request/notification descriptors.
//!
//! A descriptor ties a method name to its params and result types so the
//! facade and the router can (de)serialize payloads with serde instead of
//! passing raw JSON around.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::types::{ApiError, TelemetryEvent};

/// A request/response pair.
pub trait RequestType {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Result: Serialize + DeserializeOwned + Send + 'static;
}

/// A fire-and-forget notification.
pub trait NotificationType {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
}

/// Serialize params for the wire; `null` (e.g. `()`) means "no params".
pub fn to_params<P: Serialize>(params: &P) -> Result<Option<Value>, ApiError> {
    let value = serde_json::to_value(params).map_err(|e| ApiError::InvalidInput {
        message: format!("Failed to serialize params: {e}"),
    })?;
    Ok(if value.is_null() { None } else { Some(value) })
}

/// Deserialize inbound params; absent params are read as `null`, then as `{}`.
pub fn from_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, ApiError> {
    let parsed = match params {
        Some(value) => serde_json::from_value(value),
        None => serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Object(Default::default()))),
    };
    parsed.map_err(|e| ApiError::InvalidInput {
        message: format!("Invalid params: {e}"),
    })
}

/// Deserialize a result payload into the descriptor's result type.
pub fn from_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode {
        message: format!("Unexpected result shape for {method}: {e}"),
    })
}

/// Identity of the host process sent during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub process_id: u32,
    pub client_info: ClientInfo,
    /// Opaque agent options (extension version, IDE name, server URL, ...)
    #[serde(default)]
    pub initialization_options: Value,
}

/// `initialize` - first request of every session; the result is the agent's capabilities
pub struct InitializeRequest;

impl RequestType for InitializeRequest {
    const METHOD: &'static str = "initialize";
    type Params = InitializeParams;
    type Result = Value;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializedParams {}

/// `initialized` - sent once the capabilities response has been received
pub struct InitializedNotification;

impl NotificationType for InitializedNotification {
    const METHOD: &'static str = "initialized";
    type Params = InitializedParams;
}

/// `shutdown` - graceful stop request before the transport is closed
pub struct ShutdownRequest;

impl RequestType for ShutdownRequest {
    const METHOD: &'static str = "shutdown";
    type Params = ();
    type Result = Value;
}

/// `exit` - final notification; the agent is expected to terminate
pub struct ExitNotification;

impl NotificationType for ExitNotification {
    const METHOD: &'static str = "exit";
    type Params = ();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `logout` - sign the agent out; the host restarts the session afterwards
pub struct LogoutRequest;

impl RequestType for LogoutRequest {
    const METHOD: &'static str = "logout";
    type Params = LogoutParams;
    type Result = Value;
}

/// `telemetry` - best-effort analytics event forwarded to the agent
pub struct TelemetryNotification;

impl NotificationType for TelemetryNotification {
    const METHOD: &'static str = "telemetry";
    type Params = TelemetryEvent;
}
