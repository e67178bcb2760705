//! ConnectionHost trait: protocol → runtime callback boundary.
//!
//! The connection layer knows nothing about sessions, generations or
//! reconnect policy. When its transport dies it reports the loss through
//! this trait and the runtime decides what happens next.

use crate::api::types::ApiError;

/// Callback interface for connections to report transport-level failures.
///
/// Implemented by the runtime layer (the session manager) and passed to
/// `RpcConnection::start`.
pub trait ConnectionHost: Send + Sync {
    /// The transport of `connection_id` closed without a deliberate shutdown.
    ///
    /// Called at most once per connection, after its outstanding requests
    /// have been rejected with `Disconnected`.
    ///
    /// # Arguments
    /// * `connection_id` - Id of the connection that was lost
    /// * `reason` - EOF, IO failure, or the decode error that broke framing
    fn on_connection_lost(&self, connection_id: &str, reason: ApiError);
}
