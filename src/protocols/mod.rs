//! Protocol layer - JSON-RPC plumbing between the host and its peers.
//!
//! This module provides:
//! - `codec` and `framing`: envelopes and how they travel on a byte stream
//! - `correlation`: outstanding outbound requests and their waiters
//! - `router`: inbound dispatch by method name
//! - `rpc`: `RpcConnection`, the read loop and write queue of one transport
//! - `typed`: request/notification descriptors for serde-typed payloads
//! - `AgentConnection` trait: runtime → protocol abstraction boundary
//! - `ConnectionHost` trait: protocol → runtime callback boundary
//!
//! The protocol layer knows nothing about sessions or reconnect policy.
//! Those live in the runtime layer, behind `ConnectionHost`.

pub mod agent_connection;
pub mod codec;
pub mod correlation;
pub mod framing;
pub mod host;
pub mod router;
pub mod rpc;
pub mod typed;

pub use agent_connection::AgentConnection;
pub use host::ConnectionHost;
