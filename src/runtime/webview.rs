//! Webview Forwarder - relays messages between the host and its embedded UI.
//!
//! The UI frame loads asynchronously, so messages posted before it reports
//! ready are queued (never dropped) and flushed in order by `mark_ready()`.
//! Responses to the webview's own requests bypass the gate.
//!
//! Inbound webview traffic shares the agent envelope shape and goes through
//! the forwarder's own `Router`; host-to-webview requests are correlated by
//! the forwarder's own `CorrelationTable`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;

use crate::api::types::ApiError;
use crate::protocols::codec::{decode, Message};
use crate::protocols::correlation::CorrelationTable;
use crate::protocols::router::{Responder, Router};

/// Tauri event carrying host-to-webview messages.
pub const EVENT_WEBVIEW_MESSAGE: &str = "webview/message";

/// Delivery seam to the webview.
pub trait WebviewSink: Send + Sync {
    fn post(&self, message: &Message) -> Result<(), ApiError>;
}

#[derive(Default)]
struct Channel {
    ready: bool,
    pending: VecDeque<Message>,
}

pub struct WebviewForwarder {
    sink: Arc<dyn WebviewSink>,
    table: Arc<CorrelationTable>,
    router: Arc<Router>,
    channel: Mutex<Channel>,
    self_ref: Weak<WebviewForwarder>,
}

impl WebviewForwarder {
    pub fn new(sink: Arc<dyn WebviewSink>) -> Arc<Self> {
        let table = CorrelationTable::new();
        let router = Arc::new(Router::new(table.clone()));
        Arc::new_cyclic(|self_ref| Self {
            sink,
            table,
            router,
            channel: Mutex::new(Channel::default()),
            self_ref: self_ref.clone(),
        })
    }

    fn channel(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Router handling requests and notifications coming from the webview.
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Post a message, queueing it while the webview is not ready unless `force`.
    pub fn post_to_webview(&self, message: Message, force: bool) -> Result<(), ApiError> {
        let mut channel = self.channel();
        if !channel.ready && !force {
            log::debug!(
                "Webview not ready, queueing: method={:?}, queued={}",
                message.method(),
                channel.pending.len() + 1
            );
            channel.pending.push_back(message);
            return Ok(());
        }
        // Posting under the lock keeps direct posts behind an in-progress flush.
        self.sink.post(&message)
    }

    /// The webview can receive messages: flush the queue in order.
    ///
    /// Returns the number of queued messages delivered.
    pub fn mark_ready(&self) -> usize {
        let mut channel = self.channel();
        channel.ready = true;
        let mut delivered = 0;
        while let Some(message) = channel.pending.pop_front() {
            match self.sink.post(&message) {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!(
                    "Dropping queued webview message: method={:?}, error={e}",
                    message.method()
                ),
            }
        }
        log::info!("Webview ready: flushed={delivered}");
        delivered
    }

    /// The webview reloaded: gate again until the next `mark_ready()`.
    pub fn reset(&self) {
        self.channel().ready = false;
        log::info!("Webview reset, gating messages until ready");
    }

    pub fn is_ready(&self) -> bool {
        self.channel().ready
    }

    /// Number of messages waiting for `mark_ready()`.
    pub fn queued(&self) -> usize {
        self.channel().pending.len()
    }

    fn responder(&self) -> Responder {
        let weak = self.self_ref.clone();
        Responder::new(move |message| match weak.upgrade() {
            Some(forwarder) => forwarder.post_to_webview(message, true),
            None => Err(ApiError::disconnected("webview forwarder dropped")),
        })
    }

    /// Handle a raw message sent by the webview.
    pub fn post_from_webview(&self, bytes: &[u8]) -> Result<(), ApiError> {
        let message = decode(bytes).map_err(|e| {
            log::error!("Malformed message from webview: {e}");
            e
        })?;
        self.dispatch_from_webview(message);
        Ok(())
    }

    /// Handle an already decoded webview message.
    pub fn dispatch_from_webview(&self, message: Message) {
        log::debug!("Webview message: method={:?}, id={:?}", message.method(), message.id());
        self.router.dispatch_inbound(message, &self.responder());
    }

    pub fn post_notification(
        &self,
        method: &str,
        params: Option<Value>,
        force: bool,
    ) -> Result<(), ApiError> {
        self.post_to_webview(Message::notification(method, params), force)
    }

    /// Send a request to the webview and wait for its response.
    ///
    /// The request is gated like any other message.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ApiError> {
        let (id, pending) = self.table.register(method, timeout);
        if let Err(e) = self.post_to_webview(Message::request(id.clone(), method, params), false) {
            self.table.cancel(&id);
            return Err(e);
        }
        pending.wait().await
    }
}

/// Emits every host-to-webview message as a Tauri event.
#[cfg(feature = "tauri")]
pub struct TauriWebviewSink<R: tauri::Runtime> {
    app: tauri::AppHandle<R>,
}

#[cfg(feature = "tauri")]
impl<R: tauri::Runtime> TauriWebviewSink<R> {
    pub fn new(app: tauri::AppHandle<R>) -> Self {
        Self { app }
    }
}

#[cfg(feature = "tauri")]
impl<R: tauri::Runtime> WebviewSink for TauriWebviewSink<R> {
    fn post(&self, message: &Message) -> Result<(), ApiError> {
        use tauri::Emitter;

        self.app
            .emit(EVENT_WEBVIEW_MESSAGE, message.to_value())
            .map_err(|e| {
                log::error!("Failed to emit {EVENT_WEBVIEW_MESSAGE} event: {e}");
                ApiError::IoError {
                    message: format!("Failed to emit webview message: {e}"),
                }
            })
    }
}
