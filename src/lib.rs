//! Host-side bridge between an IDE integration, its embedded webview and a
//! long-lived background agent speaking JSON-RPC 2.0 over stdio.
//!
//! ```no_run
//! use agent_bridge::runtime::config::BridgeConfig;
//! use agent_bridge::runtime::host_api::HostApi;
//! use agent_bridge::runtime::session::SessionManager;
//!
//! # async fn run() -> Result<(), agent_bridge::api::types::ApiError> {
//! let config = BridgeConfig::load("bridge.json").await?;
//! let api = HostApi::new(SessionManager::with_process(config));
//! api.initialize().await?;
//! let capabilities = api.request("codestream/bootstrap", None).await?;
//! # let _ = capabilities;
//! # Ok(())
//! # }
//! ```

pub mod api;
#[cfg(feature = "tauri")]
pub mod commands;
pub mod protocols;
pub mod runtime;

#[cfg(test)]
mod test_support;
