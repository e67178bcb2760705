//! Router - dispatches inbound traffic by method name.
//!
//! - Responses go to the Correlation Table.
//! - Requests go to the single handler registered for their method (last
//!   registration wins), or the fallback, or are answered `MethodNotFound`.
//! - Notifications go to every observer registered for their method, in
//!   registration order, then to the catch-all observers.
//!
//! Handlers run in spawned tasks so a slow handler never stalls the read
//! loop. A failing or panicking handler becomes an error response; a
//! panicking observer is logged and skipped.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::types::ApiError;
use crate::protocols::codec::{Message, Notification, Request, Response, ResponseError};
use crate::protocols::correlation::CorrelationTable;
use crate::protocols::typed::{from_params, NotificationType, RequestType};

pub type HandlerResult = Result<Value, ApiError>;

/// Handler for inbound requests of one method.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> HandlerResult {
        (self)(params).await
    }
}

/// Handler for inbound requests whose method has no registered handler.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, method: String, params: Option<Value>) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> FallbackHandler for F
where
    F: Fn(String, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, method: String, params: Option<Value>) -> HandlerResult {
        (self)(method, params).await
    }
}

/// Observer for inbound notifications.
pub type NotificationObserver = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Where responses to inbound requests are written.
#[derive(Clone)]
pub struct Responder {
    send: Arc<dyn Fn(Message) -> Result<(), ApiError> + Send + Sync>,
}

impl Responder {
    pub fn new(send: impl Fn(Message) -> Result<(), ApiError> + Send + Sync + 'static) -> Self {
        Self {
            send: Arc::new(send),
        }
    }

    /// Responder writing into a connection's outbound queue.
    pub fn from_channel(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self::new(move |message| {
            tx.send(message)
                .map_err(|_| ApiError::disconnected("outbound queue closed"))
        })
    }

    pub fn respond(&self, response: Response) {
        let id = response.id.clone();
        if let Err(e) = (self.send)(Message::Response(response)) {
            log::warn!("Failed to send response: id={id}, error={e}");
        }
    }
}

#[derive(Default)]
struct Registry {
    next_token: u64,
    handlers: HashMap<String, (u64, Arc<dyn RequestHandler>)>,
    observers: HashMap<String, Vec<(u64, NotificationObserver)>>,
    catch_all: Vec<(u64, NotificationObserver)>,
    fallback: Option<Arc<dyn FallbackHandler>>,
}

impl Registry {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

enum RegistrationKind {
    Request(String),
    Notification(String),
    AnyNotification,
}

/// Handle returned by the `on_*` registration methods.
///
/// Dropping it keeps the registration alive; call `dispose()` to remove it.
pub struct Registration {
    registry: Weak<Mutex<Registry>>,
    kind: RegistrationKind,
    token: u64,
}

impl Registration {
    /// Remove this registration. A newer binding for the same method is left untouched.
    pub fn dispose(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock_registry(&registry);
        match &self.kind {
            RegistrationKind::Request(method) => {
                if registry
                    .handlers
                    .get(method)
                    .is_some_and(|(token, _)| *token == self.token)
                {
                    registry.handlers.remove(method);
                    log::debug!("Request handler unregistered: method={method}");
                }
            }
            RegistrationKind::Notification(method) => {
                if let Some(observers) = registry.observers.get_mut(method) {
                    observers.retain(|(token, _)| *token != self.token);
                    if observers.is_empty() {
                        registry.observers.remove(method);
                    }
                }
            }
            RegistrationKind::AnyNotification => {
                registry.catch_all.retain(|(token, _)| *token != self.token);
            }
        }
    }
}

/// Dispatch table for one connection (or for the webview channel).
pub struct Router {
    table: Arc<CorrelationTable>,
    registry: Arc<Mutex<Registry>>,
}

impl Router {
    pub fn new(table: Arc<CorrelationTable>) -> Self {
        Self {
            table,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Correlation Table that receives inbound responses.
    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    fn registration(&self, kind: RegistrationKind, token: u64) -> Registration {
        Registration {
            registry: Arc::downgrade(&self.registry),
            kind,
            token,
        }
    }

    /// Register the handler for inbound requests named `method`, replacing any previous one.
    pub fn on_request<F, Fut>(&self, method: impl Into<String>, handler: F) -> Registration
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_request_handler(method, handler)
    }

    /// `on_request` for handlers implemented as types.
    pub fn on_request_handler(
        &self,
        method: impl Into<String>,
        handler: impl RequestHandler + 'static,
    ) -> Registration {
        let method = method.into();
        let mut registry = lock_registry(&self.registry);
        let token = registry.token();
        if registry
            .handlers
            .insert(method.clone(), (token, Arc::new(handler)))
            .is_some()
        {
            log::debug!("Request handler replaced: method={method}");
        }
        drop(registry);
        self.registration(RegistrationKind::Request(method), token)
    }

    /// Register an observer for inbound notifications named `method`.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        observer: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Registration {
        let method = method.into();
        let mut registry = lock_registry(&self.registry);
        let token = registry.token();
        registry
            .observers
            .entry(method.clone())
            .or_default()
            .push((token, Arc::new(observer)));
        drop(registry);
        self.registration(RegistrationKind::Notification(method), token)
    }

    /// Register an observer for every inbound notification.
    pub fn on_any_notification(
        &self,
        observer: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Registration {
        let mut registry = lock_registry(&self.registry);
        let token = registry.token();
        registry.catch_all.push((token, Arc::new(observer)));
        drop(registry);
        self.registration(RegistrationKind::AnyNotification, token)
    }

    /// Handle requests that have no method handler instead of answering `MethodNotFound`.
    pub fn set_fallback<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.set_fallback_handler(handler);
    }

    /// `set_fallback` for handlers implemented as types.
    pub fn set_fallback_handler(&self, handler: impl FallbackHandler + 'static) {
        lock_registry(&self.registry).fallback = Some(Arc::new(handler));
    }

    /// Typed variant of `on_request`.
    pub fn on_typed_request<R, F, Fut>(&self, handler: F) -> Registration
    where
        R: RequestType,
        F: Fn(R::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Result, ApiError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_request(R::METHOD, move |params: Option<Value>| {
            let handler = handler.clone();
            async move {
                let params: R::Params = from_params(params)?;
                let result = handler(params).await?;
                serde_json::to_value(result).map_err(|e| ApiError::Handler {
                    message: format!("Failed to serialize result of {}: {e}", R::METHOD),
                })
            }
        })
    }

    /// Typed variant of `on_notification`; params that fail to deserialize are logged and dropped.
    pub fn on_typed_notification<N, F>(&self, observer: F) -> Registration
    where
        N: NotificationType,
        F: Fn(N::Params) + Send + Sync + 'static,
    {
        self.on_notification(N::METHOD, move |notification: &Notification| {
            match from_params::<N::Params>(notification.params.clone()) {
                Ok(params) => observer(params),
                Err(e) => log::warn!("Dropping notification {}: {e}", N::METHOD),
            }
        })
    }

    /// Drop every registration, including the fallback.
    pub fn clear(&self) {
        let mut registry = lock_registry(&self.registry);
        registry.handlers.clear();
        registry.observers.clear();
        registry.catch_all.clear();
        registry.fallback = None;
    }

    /// Whether a request handler is registered for `method`.
    pub fn has_handler(&self, method: &str) -> bool {
        lock_registry(&self.registry).handlers.contains_key(method)
    }

    /// Route one inbound message.
    pub fn dispatch_inbound(&self, message: Message, responder: &Responder) {
        match message {
            Message::Response(response) => {
                self.table.complete(response);
            }
            Message::Request(request) => self.dispatch_request(request, responder),
            Message::Notification(notification) => self.dispatch_notification(&notification),
        }
    }

    fn dispatch_request(&self, request: Request, responder: &Responder) {
        let (handler, fallback) = {
            let registry = lock_registry(&self.registry);
            (
                registry
                    .handlers
                    .get(&request.method)
                    .map(|(_, handler)| handler.clone()),
                registry.fallback.clone(),
            )
        };

        let Request { id, method, params } = request;
        log::debug!("Inbound request: id={id}, method={method}");

        let task: tokio::task::JoinHandle<HandlerResult> = match (handler, fallback) {
            (Some(handler), _) => tokio::spawn(async move { handler.handle(params).await }),
            (None, Some(fallback)) => {
                let method = method.clone();
                tokio::spawn(async move { fallback.handle(method, params).await })
            }
            (None, None) => {
                log::warn!("No handler for inbound request: id={id}, method={method}");
                let error = ApiError::MethodNotFound { method };
                responder.respond(Response::error(id, ResponseError::from(&error)));
                return;
            }
        };

        let responder = responder.clone();
        tokio::spawn(async move {
            let response = match task.await {
                Ok(Ok(result)) => Response::ok(id, result),
                Ok(Err(error)) => {
                    log::warn!("Request handler failed: method={method}, error={error}");
                    Response::error(id, handler_error(&error))
                }
                Err(join_error) => {
                    log::error!("Request handler panicked: method={method}, error={join_error}");
                    let error = ApiError::Handler {
                        message: format!("handler for {method} panicked"),
                    };
                    Response::error(id, ResponseError::from(&error))
                }
            };
            responder.respond(response);
        });
    }

    fn dispatch_notification(&self, notification: &Notification) {
        let observers: Vec<NotificationObserver> = {
            let registry = lock_registry(&self.registry);
            registry
                .observers
                .get(&notification.method)
                .into_iter()
                .flatten()
                .chain(registry.catch_all.iter())
                .map(|(_, observer)| observer.clone())
                .collect()
        };

        if observers.is_empty() {
            log::debug!("Unobserved notification: method={}", notification.method);
            return;
        }

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(notification))).is_err() {
                log::error!(
                    "Notification observer panicked: method={}",
                    notification.method
                );
            }
        }
    }
}

/// Wire error for a failed handler; handlers may pick their own code via
/// `Remote`, invalid params keep -32602, everything else is a handler error.
fn handler_error(error: &ApiError) -> ResponseError {
    match error {
        ApiError::Remote { .. } | ApiError::InvalidInput { .. } | ApiError::MethodNotFound { .. } => {
            ResponseError::from(error)
        }
        other => ResponseError::from(&ApiError::Handler {
            message: other.to_string(),
        }),
    }
}
