//! AgentConnection trait: runtime → protocol abstraction boundary.
//!
//! The session manager drives agents through this trait without knowing
//! how messages are framed or which transport carries them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::types::ApiError;
use crate::protocols::router::Router;

/// Abstract interface for a live JSON-RPC connection to an agent.
///
/// Implemented by `RpcConnection`.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Unique id of this connection, used in logs and loss reports.
    fn id(&self) -> &str;

    /// Send a request and wait for its response.
    ///
    /// # Arguments
    /// * `method` - JSON-RPC method name
    /// * `params` - Optional params; `None` omits the field
    /// * `timeout` - Optional deadline; `None` waits until response or disconnect
    ///
    /// # Returns
    /// * `Ok(Value)` - The response result
    /// * `Err(ApiError::Remote)` - The agent answered with an error
    /// * `Err(ApiError::Timeout)` - The deadline passed
    /// * `Err(ApiError::Disconnected)` - The transport closed first
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ApiError>;

    /// Queue a notification. Fails only when the transport is closed.
    fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ApiError>;

    /// Router receiving inbound traffic of this connection.
    fn router(&self) -> Arc<Router>;

    /// Whether the transport has closed (lost or shut down).
    fn is_closed(&self) -> bool;

    /// Shutdown the connection gracefully.
    ///
    /// Sends `shutdown` and `exit`, closes the agent's stdin and waits up
    /// to `grace` for the process to exit before killing it. Outstanding
    /// requests are rejected with `Disconnected`.
    async fn shutdown(&self, grace: Duration) -> Result<(), ApiError>;
}
