//! RpcConnection - JSON-RPC 2.0 over a framed duplex byte stream.
//!
//! One connection owns:
//! - a writer task draining the outbound queue through a `FrameWriter`
//!   (so every frame reaches the wire whole and in FIFO order)
//! - a reader task decoding one frame at a time and handing it to the Router
//! - the Correlation Table for its outbound requests
//! - optionally the agent child process
//!
//! EOF, an IO failure or a malformed frame closes the connection: every
//! outstanding request is rejected with `Disconnected` and, unless the close
//! was requested through `shutdown()`, the `ConnectionHost` is told.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::types::ApiError;
use crate::protocols::agent_connection::AgentConnection;
use crate::protocols::codec::{decode, encode, Message};
use crate::protocols::correlation::{CorrelationTable, PendingResponse};
use crate::protocols::framing::{FrameReader, FrameWriter, Framing};
use crate::protocols::host::ConnectionHost;
use crate::protocols::router::{Responder, Router};
use crate::protocols::typed::{ExitNotification, NotificationType, RequestType, ShutdownRequest};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport settings for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub framing: Framing,
    pub max_frame_bytes: usize,
}

/// A running connection to an agent.
pub struct RpcConnection {
    id: String,
    table: Arc<CorrelationTable>,
    router: Arc<Router>,
    /// Outbound queue; `None` once the connection is closed
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Set by `shutdown()`; a close while set is not reported to the host
    closing: AtomicBool,
    /// Set once, before the table is flushed
    closed: AtomicBool,
    child: tokio::sync::Mutex<Option<Child>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    host: Arc<dyn ConnectionHost>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RpcConnection {
    /// Start reading and writing on the given streams.
    ///
    /// # Arguments
    /// * `reader` - Bytes coming from the agent (its stdout)
    /// * `writer` - Bytes going to the agent (its stdin)
    /// * `child` - The agent process, if there is one; killed on shutdown
    /// * `options` - Framing and frame size limit
    /// * `host` - Receives the connection-lost report
    pub fn start(
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
        options: ConnectionOptions,
        host: Arc<dyn ConnectionHost>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let table = CorrelationTable::new();
        let router = Arc::new(Router::new(table.clone()));
        let (tx, rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            id,
            table,
            router,
            outbound: Mutex::new(Some(tx)),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(child),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
            host,
        });

        let writer_task = tokio::spawn(write_loop(
            FrameWriter::new(writer, options.framing),
            rx,
            Arc::downgrade(&connection),
        ));
        let reader_task = tokio::spawn(read_loop(
            FrameReader::new(BufReader::new(reader), options.framing, options.max_frame_bytes),
            Arc::downgrade(&connection),
        ));
        *lock(&connection.writer_task) = Some(writer_task);
        *lock(&connection.reader_task) = Some(reader_task);

        log::info!(
            "Connection started: id={}, framing={:?}",
            connection.id,
            options.framing
        );
        connection
    }

    /// Correlation Table of this connection's outbound requests.
    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    fn send_message(&self, message: Message) -> Result<(), ApiError> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| ApiError::disconnected("connection writer stopped")),
            None => Err(ApiError::disconnected(format!(
                "connection {} is closed",
                self.id
            ))),
        }
    }

    /// Register and queue a request; the returned handle resolves with its outcome.
    pub fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, ApiError> {
        let (id, pending) = self.table.register(method, timeout);
        // A close racing with registration has either flushed this entry or
        // is visible here.
        if self.closed.load(Ordering::SeqCst) {
            self.table.cancel(&id);
            return Err(ApiError::disconnected(format!(
                "connection {} is closed",
                self.id
            )));
        }
        log::debug!("Outbound request: id={id}, method={method}");
        if let Err(e) = self.send_message(Message::request(id.clone(), method, params)) {
            self.table.cancel(&id);
            return Err(e);
        }
        Ok(pending)
    }

    fn responder(self: &Arc<Self>) -> Responder {
        let weak = Arc::downgrade(self);
        Responder::new(move |message| match weak.upgrade() {
            Some(connection) => connection.send_message(message),
            None => Err(ApiError::disconnected("connection dropped")),
        })
    }

    /// Close after a transport failure. Runs once; later calls are no-ops.
    fn connection_lost(&self, reason: ApiError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.outbound).take();
        let flushed = self.table.flush_all(ApiError::disconnected(format!(
            "connection lost: {reason}"
        )));

        if self.closing.load(Ordering::SeqCst) {
            log::debug!("Connection closed during shutdown: id={}", self.id);
            return;
        }
        log::warn!(
            "Connection lost: id={}, reason={reason}, flushed={flushed}",
            self.id
        );
        self.host.on_connection_lost(&self.id, reason);
    }
}

async fn read_loop<R>(mut reader: FrameReader<R>, connection: Weak<RpcConnection>)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let responder = match connection.upgrade() {
        Some(connection) => connection.responder(),
        None => return,
    };

    let reason = loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break ApiError::disconnected("agent closed the stream"),
            Err(e) => break e,
        };
        let message = match decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                log::error!(
                    "Malformed message from agent, closing transport: {e}, frame={}",
                    String::from_utf8_lossy(&frame)
                );
                break e;
            }
        };
        let Some(connection) = connection.upgrade() else {
            return;
        };
        connection.router.dispatch_inbound(message, &responder);
    };

    if let Some(connection) = connection.upgrade() {
        connection.connection_lost(reason);
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    connection: Weak<RpcConnection>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let bytes = match encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Dropping unencodable message: method={:?}, error={e}", message.method());
                continue;
            }
        };
        if let Err(e) = writer.write_frame(&bytes).await {
            log::warn!("Write to agent failed: {e}");
            if let Some(connection) = connection.upgrade() {
                connection.connection_lost(e);
            }
            return;
        }
    }
    if let Err(e) = writer.close().await {
        log::debug!("Closing agent stdin failed: {e}");
    }
}

#[async_trait]
impl AgentConnection for RpcConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ApiError> {
        self.start_request(method, params, timeout)?.wait().await
    }

    fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ApiError> {
        log::debug!("Outbound notification: method={method}");
        self.send_message(Message::notification(method, params))
    }

    fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), ApiError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Shutting down connection: id={}", self.id);
        self.table.flush_all(ApiError::disconnected(format!(
            "connection {} is shutting down",
            self.id
        )));

        if !self.is_closed() {
            if let Err(e) = self.request(ShutdownRequest::METHOD, None, Some(grace)).await {
                log::debug!("Agent did not acknowledge shutdown: id={}, error={e}", self.id);
            }
            if let Err(e) = self.notify(ExitNotification::METHOD, None) {
                log::debug!("Failed to send exit: id={}, error={e}", self.id);
            }
        }

        // Dropping the sender lets the writer drain the queue and close stdin.
        lock(&self.outbound).take();
        let writer_task = lock(&self.writer_task).take();
        if let Some(writer_task) = writer_task {
            if tokio::time::timeout(grace, writer_task).await.is_err() {
                log::warn!("Writer did not drain within grace period: id={}", self.id);
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        self.table
            .flush_all(ApiError::disconnected(format!("connection {} shut down", self.id)));
        if let Some(reader_task) = lock(&self.reader_task).take() {
            reader_task.abort();
        }

        // Take the child out of the mutex before awaiting it.
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => log::info!("Agent exited: id={}, status={status}", self.id),
                Ok(Err(e)) => log::warn!("Failed to wait for agent: id={}, error={e}", self.id),
                Err(_) => {
                    log::warn!(
                        "Agent still running after {}ms, killing: id={}",
                        grace.as_millis(),
                        self.id
                    );
                    if let Err(e) = child.kill().await {
                        log::warn!("Failed to kill agent process: {e}");
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        for task in [&self.reader_task, &self.writer_task] {
            if let Some(task) = lock(task).take() {
                task.abort();
            }
        }
        log::debug!("RpcConnection dropped: id={}", self.id);
    }
}
