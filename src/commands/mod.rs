//! Tauri command handlers, available with the `tauri` feature.
//!
//! The app registers them with `tauri::generate_handler!` and manages an
//! `Arc<WebviewForwarder>` and an `Arc<HostApi>` as state.

pub mod webview;
