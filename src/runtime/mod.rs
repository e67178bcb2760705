//! Runtime modules for the agent session and its consumers.
//!
//! The runtime domain owns the agent process lifecycle, the webview
//! channel and the facade handed to the rest of the host.

pub mod config;
pub mod host_api;
pub mod launcher;
pub mod session;
pub mod telemetry;
pub mod webview;
