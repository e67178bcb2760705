//! Webview commands: the webview side of the `WebviewForwarder` channel.
//!
//! Host-to-webview traffic arrives in the UI as `webview/message` events
//! (see `TauriWebviewSink`); webview-to-host traffic comes back through
//! `webview_post`.

use std::sync::Arc;

use serde_json::Value;
use tauri::State;

use crate::api::types::{ApiError, SessionStateChangedEvent};
use crate::protocols::codec::Message;
use crate::runtime::host_api::HostApi;
use crate::runtime::webview::WebviewForwarder;

/// Inner function for testing without Tauri State wrapper.
fn webview_post_inner(forwarder: &WebviewForwarder, message: Value) -> Result<(), ApiError> {
    let message = Message::from_value(message)?;
    forwarder.dispatch_from_webview(message);
    Ok(())
}

/// Deliver one JSON-RPC message from the webview.
///
/// Async so request handlers are spawned on Tauri's tokio runtime.
#[tauri::command]
pub async fn webview_post(
    forwarder: State<'_, Arc<WebviewForwarder>>,
    message: Value,
) -> Result<(), ApiError> {
    webview_post_inner(&forwarder, message)
}

/// The webview finished loading; returns how many queued messages were flushed.
#[tauri::command]
pub fn webview_ready(forwarder: State<'_, Arc<WebviewForwarder>>) -> usize {
    forwarder.mark_ready()
}

/// The webview is reloading; gate messages until it is ready again.
#[tauri::command]
pub fn webview_reset(forwarder: State<'_, Arc<WebviewForwarder>>) {
    forwarder.reset();
}

#[tauri::command]
pub fn session_state(api: State<'_, Arc<HostApi>>) -> SessionStateChangedEvent {
    api.sessions().state_event()
}
