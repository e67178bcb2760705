//! Session/Lifecycle Manager - owns the agent connection and its handshake.
//!
//! States: `Uninitialized → Initializing → Ready → Disposed`, plus
//! `Restarting` while an old connection is torn down.
//!
//! Every lifecycle transition (initialize, restart, reconnect attempt,
//! dispose) runs under `lifecycle`, so at most one handshake is in flight.
//! Requests never take that lock: they read the current session and fail
//! fast when it is not `Ready`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::api::types::{ApiError, SessionId, SessionState, SessionStateChangedEvent};
use crate::protocols::agent_connection::AgentConnection;
use crate::protocols::host::ConnectionHost;
use crate::protocols::router::Router;
use crate::protocols::rpc::RpcConnection;
use crate::protocols::typed::{
    to_params, InitializeParams, InitializeRequest, InitializedNotification, InitializedParams,
    LogoutParams, LogoutRequest, NotificationType, RequestType,
};
use crate::runtime::config::BridgeConfig;
use crate::runtime::launcher::{AgentLauncher, ProcessLauncher};

/// Callback run every time a session reaches `Ready`.
pub type ReadyHook = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// One live agent connection that completed the handshake.
pub struct Session {
    id: SessionId,
    generation: u64,
    connection: Arc<dyn AgentConnection>,
    initialize_params: InitializeParams,
    capabilities: Value,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> &Arc<dyn AgentConnection> {
        &self.connection
    }

    /// Router for inbound traffic of this session's connection.
    pub fn router(&self) -> Arc<Router> {
        self.connection.router()
    }

    pub fn initialize_params(&self) -> &InitializeParams {
        &self.initialize_params
    }

    /// Result of the `initialize` request.
    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionManager {
    config: BridgeConfig,
    launcher: Arc<dyn AgentLauncher>,
    self_ref: Weak<SessionManager>,
    state: watch::Sender<SessionState>,
    current: Mutex<Option<Arc<Session>>>,
    /// Serializes initialize/restart/reconnect/dispose
    lifecycle: tokio::sync::Mutex<()>,
    /// Bumped by every handshake attempt
    generation: AtomicU64,
    ready_hooks: Mutex<Vec<(u64, ReadyHook)>>,
    next_hook: AtomicU64,
}

impl SessionManager {
    pub fn new(config: BridgeConfig, launcher: Arc<dyn AgentLauncher>) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Arc::new_cyclic(|self_ref| Self {
            config,
            launcher,
            self_ref: self_ref.clone(),
            state,
            current: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            ready_hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
        })
    }

    /// Manager spawning `config.agent` as a child process.
    pub fn with_process(config: BridgeConfig) -> Arc<Self> {
        let launcher = Arc::new(ProcessLauncher::new(config.agent.clone()));
        Self::new(config, launcher)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        lock(&self.current).clone()
    }

    /// Current state with the id of the live session, as sent to observers.
    pub fn state_event(&self) -> SessionStateChangedEvent {
        SessionStateChangedEvent {
            state: self.state(),
            session_id: self.current_session().map(|session| session.id.clone()),
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::info!("Session state changed: {previous} -> {state}");
        }
    }

    /// The live session, or the error a request should fail with.
    pub fn live_session(&self) -> Result<Arc<Session>, ApiError> {
        match self.state() {
            SessionState::Ready => self
                .current_session()
                .ok_or_else(|| ApiError::disconnected("session is not connected")),
            SessionState::Uninitialized => Err(ApiError::InvalidState {
                message: "session has not been initialized".to_string(),
            }),
            SessionState::Initializing | SessionState::Restarting => {
                Err(ApiError::disconnected("session is not ready"))
            }
            SessionState::Disposed => Err(ApiError::Disposed),
        }
    }

    /// Launch the agent and complete the handshake.
    ///
    /// Returns the existing session when already `Ready`. A failed handshake
    /// disposes the manager and returns the error.
    pub async fn initialize(&self) -> Result<Arc<Session>, ApiError> {
        if let Ok(session) = self.live_session() {
            return Ok(session);
        }

        let _lifecycle = self.lifecycle.lock().await;

        // Double-check after acquiring the lock
        match self.state() {
            SessionState::Ready => {
                if let Some(session) = self.current_session() {
                    log::debug!("Session initialized by another task: session={}", session.id);
                    return Ok(session);
                }
            }
            SessionState::Disposed => return Err(ApiError::Disposed),
            _ => {}
        }

        match self.start_session_locked().await {
            Ok(session) => Ok(session),
            Err(e) => {
                log::error!("Session initialization failed: {e}");
                self.dispose_locked().await;
                Err(e)
            }
        }
    }

    /// Tear down the current connection and run a fresh handshake.
    ///
    /// Callers that queued behind a restart which completed meanwhile get
    /// that restart's session instead of triggering another one.
    pub async fn restart(&self) -> Result<Arc<Session>, ApiError> {
        let observed = self.generation.load(Ordering::SeqCst);
        let _lifecycle = self.lifecycle.lock().await;

        if self.generation.load(Ordering::SeqCst) != observed {
            if let (SessionState::Ready, Some(session)) = (self.state(), self.current_session()) {
                log::debug!("Restart coalesced: session={}", session.id);
                return Ok(session);
            }
        }

        match self.state() {
            SessionState::Uninitialized => {
                return Err(ApiError::InvalidState {
                    message: "cannot restart a session that was never initialized".to_string(),
                })
            }
            SessionState::Disposed => return Err(ApiError::Disposed),
            _ => {}
        }

        log::info!("Restarting session");
        self.set_state(SessionState::Restarting);
        let previous = lock(&self.current).take();
        if let Some(previous) = previous {
            self.teardown(&previous).await;
        }

        match self.start_session_locked().await {
            Ok(session) => Ok(session),
            Err(e) => {
                log::error!("Session restart failed: {e}");
                self.dispose_locked().await;
                Err(e)
            }
        }
    }

    /// Ask the agent to sign out, then restart the session.
    pub async fn logout(&self, reason: Option<String>) -> Result<Arc<Session>, ApiError> {
        let session = self.live_session()?;
        let params = to_params(&LogoutParams { reason })?;
        if let Err(e) = session
            .connection
            .request(LogoutRequest::METHOD, params, Some(self.config.initialize_timeout()))
            .await
        {
            log::warn!("Agent logout failed, restarting anyway: session={}, error={e}", session.id);
        }
        self.restart().await
    }

    /// Terminal shutdown. Idempotent.
    pub async fn dispose(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.dispose_locked().await;
    }

    async fn dispose_locked(&self) {
        if self.state() == SessionState::Disposed {
            return;
        }
        self.set_state(SessionState::Disposed);
        lock(&self.ready_hooks).clear();
        let session = lock(&self.current).take();
        if let Some(session) = session {
            self.teardown(&session).await;
        }
        log::info!("Session manager disposed");
    }

    async fn teardown(&self, session: &Session) {
        log::info!("Tearing down session: session={}", session.id);
        session.router().clear();
        if let Err(e) = session.connection.shutdown(self.config.shutdown_grace()).await {
            log::warn!("Connection shutdown failed: session={}, error={e}", session.id);
        }
    }

    /// Launch, connect and handshake. Caller holds `lifecycle`.
    async fn start_session_locked(&self) -> Result<Arc<Session>, ApiError> {
        self.set_state(SessionState::Initializing);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let initialize_params = InitializeParams {
            process_id: std::process::id(),
            client_info: self.config.client.clone(),
            initialization_options: self.config.initialization_options.clone(),
        };
        let initialize = to_params(&initialize_params)?;
        let initialized = to_params(&InitializedParams {})?;

        let streams = self.launcher.launch().await?;
        let host = Arc::new(SessionConnectionHost {
            manager: self.self_ref.clone(),
            generation,
        });
        let connection: Arc<dyn AgentConnection> = RpcConnection::start(
            streams.reader,
            streams.writer,
            streams.child,
            self.config.connection_options(),
            host,
        );

        let capabilities = match connection
            .request(
                InitializeRequest::METHOD,
                initialize,
                Some(self.config.initialize_timeout()),
            )
            .await
        {
            Ok(capabilities) => capabilities,
            Err(e) => {
                log::error!("Agent initialize failed: connection={}, error={e}", connection.id());
                if let Err(e) = connection.shutdown(self.config.shutdown_grace()).await {
                    log::debug!("Shutdown after failed handshake failed: {e}");
                }
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            generation,
            connection,
            initialize_params,
            capabilities,
        });

        // A loss reported before the session is published is dropped as stale.
        if session.connection.is_closed() {
            log::warn!(
                "Agent closed the connection during the handshake: connection={}",
                session.connection.id()
            );
            self.abandon_session(&session).await;
            return Err(ApiError::disconnected("agent closed the connection during the handshake"));
        }
        *lock(&self.current) = Some(session.clone());

        // Hooks install their handlers before the agent is told it may start pushing.
        self.run_ready_hooks(&session);
        if let Err(e) = session.connection.notify(InitializedNotification::METHOD, initialized) {
            log::error!("Failed to send initialized: session={}, error={e}", session.id);
            self.abandon_session(&session).await;
            return Err(e);
        }

        let published = {
            let current = lock(&self.current);
            let live = matches!(current.as_ref(), Some(live) if live.generation == generation);
            if live {
                self.set_state(SessionState::Ready);
            }
            live
        };
        if !published {
            self.abandon_session(&session).await;
            return Err(ApiError::disconnected("agent connection lost during the handshake"));
        }

        log::info!(
            "Session ready: session={}, generation={generation}, connection={}",
            session.id,
            session.connection.id()
        );
        Ok(session)
    }

    /// Unpublish a session whose handshake failed and shut its connection down.
    async fn abandon_session(&self, session: &Arc<Session>) {
        {
            let mut current = lock(&self.current);
            if current.as_ref().is_some_and(|live| Arc::ptr_eq(live, session)) {
                current.take();
            }
        }
        self.teardown(session).await;
    }

    /// Register a hook run each time a session reaches `Ready`.
    ///
    /// When a session is already live the hook also runs immediately.
    /// Returns a token for `remove_ready_hook`.
    pub fn on_ready(&self, hook: impl Fn(&Arc<Session>) + Send + Sync + 'static) -> u64 {
        let token = self.next_hook.fetch_add(1, Ordering::Relaxed);
        let hook: ReadyHook = Arc::new(hook);
        lock(&self.ready_hooks).push((token, hook.clone()));
        if let Ok(session) = self.live_session() {
            invoke_hook(&hook, &session);
        }
        token
    }

    pub fn remove_ready_hook(&self, token: u64) -> bool {
        let mut hooks = lock(&self.ready_hooks);
        let before = hooks.len();
        hooks.retain(|(existing, _)| *existing != token);
        hooks.len() != before
    }

    fn run_ready_hooks(&self, session: &Arc<Session>) {
        let hooks: Vec<ReadyHook> = lock(&self.ready_hooks)
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            invoke_hook(&hook, session);
        }
    }

    /// Send a request on the live session.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ApiError> {
        let session = self.live_session()?;
        session.connection.request(method, params, timeout).await
    }

    /// Send a notification on the live session.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ApiError> {
        self.live_session()?.connection.notify(method, params)
    }

    fn connection_lost(&self, generation: u64, connection_id: &str, reason: ApiError) {
        // Read under the `current` lock, which also guards the switch to `Ready`.
        let (lost, was_ready) = {
            let mut current = lock(&self.current);
            match current.as_ref() {
                Some(session) if session.generation == generation => {
                    let was_ready = self.state() == SessionState::Ready;
                    if was_ready {
                        self.set_state(SessionState::Initializing);
                    }
                    (current.take(), was_ready)
                }
                _ => (None, false),
            }
        };
        let Some(session) = lost else {
            log::debug!("Ignoring loss of stale connection: connection={connection_id}");
            return;
        };

        log::warn!(
            "Agent connection lost: session={}, connection={connection_id}, reason={reason}",
            session.id
        );
        session.router().clear();

        // Reap the process behind the dead transport.
        let grace = self.config.shutdown_grace();
        tokio::spawn(async move {
            if let Err(e) = session.connection.shutdown(grace).await {
                log::debug!("Cleanup of lost connection failed: {e}");
            }
        });

        if !was_ready {
            log::debug!("Connection lost mid-handshake; the handshake reports the failure");
            return;
        }
        if !self.config.reconnect.enabled {
            log::info!("Reconnect disabled; waiting for an explicit restart");
            return;
        }
        if let Some(manager) = self.self_ref.upgrade() {
            tokio::spawn(async move { manager.reconnect().await });
        }
    }

    async fn reconnect(self: Arc<Self>) {
        let policy = self.config.reconnect.clone();
        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(Duration::from_millis(policy.backoff_ms)).await;

            let _lifecycle = self.lifecycle.lock().await;
            if self.state() != SessionState::Initializing {
                log::debug!("Reconnect no longer needed: state={}", self.state());
                return;
            }
            log::info!("Reconnecting to agent: attempt={attempt}/{}", policy.max_attempts);
            match self.start_session_locked().await {
                Ok(session) => {
                    log::info!("Reconnected: session={}", session.id);
                    return;
                }
                Err(e) => log::warn!(
                    "Reconnect attempt failed: attempt={attempt}/{}, error={e}",
                    policy.max_attempts
                ),
            }
        }

        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == SessionState::Initializing {
            log::error!(
                "Giving up on agent after {} reconnect attempt(s)",
                policy.max_attempts
            );
            self.dispose_locked().await;
        }
    }
}

fn invoke_hook(hook: &ReadyHook, session: &Arc<Session>) {
    if catch_unwind(AssertUnwindSafe(|| hook(session))).is_err() {
        log::error!("Ready hook panicked: session={}", session.id);
    }
}

/// Routes connection loss of one handshake generation back to the manager.
struct SessionConnectionHost {
    manager: Weak<SessionManager>,
    generation: u64,
}

impl ConnectionHost for SessionConnectionHost {
    fn on_connection_lost(&self, connection_id: &str, reason: ApiError) {
        if let Some(manager) = self.manager.upgrade() {
            manager.connection_lost(self.generation, connection_id, reason);
        }
    }
}
