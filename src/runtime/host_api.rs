//! Host API Facade - the typed entry point for consumers of the bridge.
//!
//! Consumers hold a `HostApi` instead of reaching for the session manager,
//! the connection or the webview forwarder directly.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::api::types::{ApiError, TelemetryEvent};
use crate::protocols::codec::{Message, Notification};
use crate::protocols::typed::{from_result, to_params, NotificationType, RequestType};
use crate::runtime::session::{Session, SessionManager};
use crate::runtime::telemetry::{AgentTelemetrySink, TelemetrySink};
use crate::runtime::webview::WebviewForwarder;

/// Sent by the webview once its UI can receive messages.
pub const WEBVIEW_DID_INITIALIZE: &str = "webview/didInitialize";
/// Pushed to the webview on every session state change.
pub const SESSION_STATE_CHANGED: &str = "bridge/sessionStateChanged";
/// Webview notifications in this namespace stay in the host.
const WEBVIEW_NAMESPACE: &str = "webview/";

pub struct HostApi {
    sessions: Arc<SessionManager>,
    telemetry: Arc<dyn TelemetrySink>,
    default_timeout: Option<Duration>,
}

impl HostApi {
    /// Facade over `sessions`; telemetry goes to the agent.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        let telemetry = Arc::new(AgentTelemetrySink::new(Arc::downgrade(&sessions)));
        let default_timeout = sessions.config().request_timeout();
        Self {
            sessions,
            telemetry,
            default_timeout,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn initialize(&self) -> Result<Arc<Session>, ApiError> {
        self.sessions.initialize().await
    }

    /// Send a typed request with the configured default deadline.
    pub async fn send<R: RequestType>(&self, params: R::Params) -> Result<R::Result, ApiError> {
        self.send_with_timeout::<R>(params, self.default_timeout).await
    }

    pub async fn send_with_timeout<R: RequestType>(
        &self,
        params: R::Params,
        timeout: Option<Duration>,
    ) -> Result<R::Result, ApiError> {
        let value = self
            .sessions
            .request(R::METHOD, to_params(&params)?, timeout)
            .await?;
        from_result(R::METHOD, value)
    }

    /// Untyped request with the configured default deadline.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ApiError> {
        self.sessions
            .request(method, params, self.default_timeout)
            .await
    }

    /// Fire-and-forget typed notification.
    ///
    /// Fails only when no session can accept traffic.
    pub fn notify<N: NotificationType>(&self, params: N::Params) -> Result<(), ApiError> {
        self.sessions.notify(N::METHOD, to_params(&params)?)
    }

    /// Record a telemetry event. Never fails; sink errors are logged.
    pub fn track(&self, event_name: impl Into<String>, properties: Value) {
        let event = TelemetryEvent {
            event_name: event_name.into(),
            properties,
        };
        match catch_unwind(AssertUnwindSafe(|| self.telemetry.track(&event))) {
            Ok(Ok(())) => log::trace!("Telemetry tracked: event={}", event.event_name),
            Ok(Err(e)) => log::warn!(
                "Dropping telemetry event: event={}, error={e}",
                event.event_name
            ),
            Err(_) => log::error!("Telemetry sink panicked: event={}", event.event_name),
        }
    }

    /// Connect a webview to the agent.
    ///
    /// - webview requests without a host handler are forwarded to the agent
    /// - webview notifications are forwarded to the agent, except the
    ///   `webview/` namespace (`webview/didInitialize` marks the webview ready)
    /// - every agent notification of every session is relayed to the webview
    /// - session state changes are pushed as `bridge/sessionStateChanged`
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach_webview(&self, forwarder: Arc<WebviewForwarder>) {
        let router = forwarder.router();

        let sessions = self.sessions.clone();
        let timeout = self.default_timeout;
        router.set_fallback(move |method: String, params: Option<Value>| {
            let sessions = sessions.clone();
            async move {
                log::debug!("Forwarding webview request to agent: method={method}");
                sessions.request(&method, params, timeout).await
            }
        });

        let weak_forwarder = Arc::downgrade(&forwarder);
        let _ready = router.on_notification(WEBVIEW_DID_INITIALIZE, move |_: &Notification| {
            if let Some(forwarder) = weak_forwarder.upgrade() {
                forwarder.mark_ready();
            }
        });

        let sessions = Arc::downgrade(&self.sessions);
        let _forward = router.on_any_notification(move |notification: &Notification| {
            if notification.method.starts_with(WEBVIEW_NAMESPACE) {
                return;
            }
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            if let Err(e) = sessions.notify(&notification.method, notification.params.clone()) {
                log::warn!(
                    "Dropping webview notification: method={}, error={e}",
                    notification.method
                );
            }
        });

        let weak_forwarder = Arc::downgrade(&forwarder);
        self.sessions.on_ready(move |session: &Arc<Session>| {
            let weak_forwarder = weak_forwarder.clone();
            let _relay = session
                .router()
                .on_any_notification(move |notification: &Notification| {
                    let Some(forwarder) = weak_forwarder.upgrade() else {
                        return;
                    };
                    let message = Message::Notification(notification.clone());
                    if let Err(e) = forwarder.post_to_webview(message, false) {
                        log::warn!(
                            "Failed to relay agent notification to webview: method={}, error={e}",
                            notification.method
                        );
                    }
                });
        });

        let mut states = self.sessions.watch_state();
        let sessions = Arc::downgrade(&self.sessions);
        let weak_forwarder = Arc::downgrade(&forwarder);
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let (Some(sessions), Some(forwarder)) = (sessions.upgrade(), weak_forwarder.upgrade())
                else {
                    break;
                };
                let event = match serde_json::to_value(sessions.state_event()) {
                    Ok(event) => event,
                    Err(e) => {
                        log::error!("Failed to serialize session state event: {e}");
                        continue;
                    }
                };
                if let Err(e) = forwarder.post_notification(SESSION_STATE_CHANGED, Some(event), false) {
                    log::warn!("Failed to post session state to webview: {e}");
                }
            }
            log::debug!("Session state relay stopped");
        });

        log::info!("Webview attached");
    }

    /// Sign the agent out and restart the session.
    pub async fn logout(&self, reason: Option<String>) -> Result<Arc<Session>, ApiError> {
        self.sessions.logout(reason).await
    }

    pub async fn restart(&self) -> Result<Arc<Session>, ApiError> {
        self.sessions.restart().await
    }

    pub async fn dispose(&self) {
        self.sessions.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{SessionState, INTERNAL_ERROR, METHOD_NOT_FOUND};
    use crate::protocols::codec::{encode, RequestId};
    use crate::protocols::typed::TelemetryNotification;
    use crate::runtime::config::BridgeConfig;
    use crate::runtime::webview::tests::RecordingSink;
    use crate::test_support::{init_logging, AgentScript, InMemoryLauncher};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::path::PathBuf;

    #[derive(Debug, Serialize, Deserialize)]
    struct GetBranchesParams {
        uri: String,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct GetBranchesResult {
        branches: Vec<String>,
    }

    struct GetBranchesRequest;

    impl RequestType for GetBranchesRequest {
        const METHOD: &'static str = "getBranches";
        type Params = GetBranchesParams;
        type Result = GetBranchesResult;
    }

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.agent.path = PathBuf::from("fake-agent");
        config.initialize_timeout_ms = 1_000;
        config.shutdown_grace_ms = 200;
        config.reconnect.enabled = false;
        config
    }

    async fn api(script: AgentScript) -> (HostApi, Arc<InMemoryLauncher>) {
        init_logging();
        let launcher = InMemoryLauncher::new(script);
        let api = HostApi::new(SessionManager::new(config(), launcher.clone()));
        api.initialize().await.unwrap();
        (api, launcher)
    }

    async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(value) = check() {
                    break value;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held")
    }

    #[tokio::test]
    async fn test_typed_send() {
        let script =
            AgentScript::default().respond("getBranches", json!({"branches": ["main", "dev"]}));
        let (api, launcher) = api(script).await;

        let result = api
            .send::<GetBranchesRequest>(GetBranchesParams {
                uri: "file:///repo".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(result.branches, vec!["main", "dev"]);

        let agent = launcher.latest();
        let Some(Message::Request(request)) = agent
            .received()
            .into_iter()
            .find(|m| m.method() == Some("getBranches"))
        else {
            panic!("agent never received getBranches");
        };
        assert_eq!(request.params, Some(json!({"uri": "file:///repo"})));
    }

    #[tokio::test]
    async fn test_send_reports_unexpected_result_shape() {
        let script = AgentScript::default().respond("getBranches", json!({"nope": true}));
        let (api, _launcher) = api(script).await;
        let result = api
            .send::<GetBranchesRequest>(GetBranchesParams {
                uri: "x".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ApiError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_send_with_timeout() {
        let script = AgentScript::default().silent("getBranches");
        let (api, launcher) = api(script).await;
        let result = api
            .send_with_timeout::<GetBranchesRequest>(
                GetBranchesParams {
                    uri: "x".to_string(),
                },
                Some(Duration::from_millis(30)),
            )
            .await;
        assert_eq!(
            result.unwrap_err(),
            ApiError::Timeout {
                method: "getBranches".to_string(),
                timeout_ms: 30
            }
        );
        launcher.latest().wait_for_method("getBranches").await;
        assert!(!api.sessions().current_session().unwrap().connection().is_closed());
    }

    #[tokio::test]
    async fn test_track_forwards_to_agent_and_never_fails() {
        let (api, launcher) = api(AgentScript::default()).await;
        api.track("Branch Switched", json!({"source": "webview"}));

        let agent = launcher.latest();
        agent.wait_for_method(TelemetryNotification::METHOD).await;
        let Some(Message::Notification(notification)) = agent
            .received()
            .into_iter()
            .find(|m| m.method() == Some("telemetry"))
        else {
            panic!("agent never received telemetry");
        };
        assert_eq!(
            notification.params,
            Some(json!({"eventName": "Branch Switched", "properties": {"source": "webview"}}))
        );

        api.dispose().await;
        api.track("After Dispose", json!({}));
    }

    #[tokio::test]
    async fn test_track_swallows_sink_panics() {
        struct PanickingSink;
        impl TelemetrySink for PanickingSink {
            fn track(&self, _event: &TelemetryEvent) -> Result<(), ApiError> {
                panic!("sink bug");
            }
        }

        let (api, _launcher) = api(AgentScript::default()).await;
        let api = api.with_telemetry(Arc::new(PanickingSink));
        api.track("Anything", Value::Null);
        assert_eq!(api.sessions().state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_webview_get_branches_round_trip() {
        let script = AgentScript::default()
            .respond("getBranches", json!({"branches": ["main", "feature/x"]}))
            .fail("getRepos", 1001, "not signed in");
        let (api, _launcher) = api(script).await;
        let sink = Arc::new(RecordingSink::default());
        let forwarder = WebviewForwarder::new(sink.clone());
        api.attach_webview(forwarder.clone());

        for (id, method) in [("1", "getBranches"), ("2", "getRepos")] {
            let request = Message::request(id, method, Some(json!({"uri": "file:///repo"})));
            forwarder
                .post_from_webview(&encode(&request).unwrap())
                .unwrap();
        }

        let responses = eventually(|| {
            let responses = sink.responses();
            (responses.len() == 2).then_some(responses)
        })
        .await;
        let response = |id: &str| {
            responses
                .iter()
                .find(|r| r.id == RequestId::from(id))
                .cloned()
                .unwrap()
        };
        assert_eq!(
            response("1").result,
            Ok(json!({"branches": ["main", "feature/x"]}))
        );
        let error = response("2").result.unwrap_err();
        assert_eq!(error.code, 1001);
        assert_eq!(error.message, "not signed in");
    }

    #[tokio::test]
    async fn test_webview_requests_fail_cleanly_without_agent_handler() {
        let (api, _launcher) = api(AgentScript::default()).await;
        let sink = Arc::new(RecordingSink::default());
        let forwarder = WebviewForwarder::new(sink.clone());
        api.attach_webview(forwarder.clone());

        forwarder.dispatch_from_webview(Message::request(7, "unknownOnAgent", None));
        let responses = eventually(|| {
            let responses = sink.responses();
            (!responses.is_empty()).then_some(responses)
        })
        .await;
        let error = responses[0].result.as_ref().unwrap_err();
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert_eq!(error.message, "Unhandled method unknownOnAgent");

        api.dispose().await;
        forwarder.dispatch_from_webview(Message::request(8, "getBranches", None));
        let responses = eventually(|| {
            let responses = sink.responses();
            (responses.len() == 2).then_some(responses)
        })
        .await;
        assert_eq!(responses[1].id, RequestId::Number(8));
        assert_eq!(responses[1].result.as_ref().unwrap_err().code, INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_agent_notifications_relay_to_webview_once_ready() {
        let (api, launcher) = api(AgentScript::default()).await;
        let sink = Arc::new(RecordingSink::default());
        let forwarder = WebviewForwarder::new(sink.clone());
        api.attach_webview(forwarder.clone());

        let agent = launcher.latest();
        for n in 1..=3 {
            agent.push(Message::notification(
                "codestream/didChangeData",
                Some(json!({"n": n})),
            ));
        }
        eventually(|| (forwarder.queued() == 3).then_some(())).await;
        assert!(sink.posted.lock().unwrap().is_empty());

        forwarder.dispatch_from_webview(Message::notification(WEBVIEW_DID_INITIALIZE, None));
        assert!(forwarder.is_ready());

        agent.push(Message::notification(
            "codestream/didChangeData",
            Some(json!({"n": 4})),
        ));
        let posted = eventually(|| {
            let posted = sink.posted.lock().unwrap().clone();
            (posted.len() == 4).then_some(posted)
        })
        .await;
        let order: Vec<Value> = posted
            .iter()
            .map(|message| match message {
                Message::Notification(n) => n.params.as_ref().unwrap()["n"].clone(),
                other => panic!("unexpected message {other:?}"),
            })
            .collect();
        assert_eq!(order, vec![json!(1), json!(2), json!(3), json!(4)]);

        // The readiness handshake itself never reaches the agent.
        assert!(!agent
            .received_methods()
            .contains(&WEBVIEW_DID_INITIALIZE.to_string()));
    }

    #[tokio::test]
    async fn test_webview_notifications_reach_agent_and_relay_survives_restart() {
        let (api, launcher) = api(AgentScript::default()).await;
        let sink = Arc::new(RecordingSink::default());
        let forwarder = WebviewForwarder::new(sink.clone());
        forwarder.mark_ready();
        api.attach_webview(forwarder.clone());

        forwarder.dispatch_from_webview(Message::notification(
            "codestream/didSelectStream",
            Some(json!({"streamId": "s1"})),
        ));
        launcher
            .latest()
            .wait_for_method("codestream/didSelectStream")
            .await;

        api.restart().await.unwrap();
        launcher
            .latest()
            .push(Message::notification("codestream/didLogin", None));
        let methods = eventually(move || {
            let methods: Vec<String> = sink
                .posted
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| m.method().map(str::to_string))
                .collect();
            methods
                .contains(&"codestream/didLogin".to_string())
                .then_some(methods)
        })
        .await;
        assert!(methods.contains(&SESSION_STATE_CHANGED.to_string()));
    }

    #[tokio::test]
    async fn test_requests_after_agent_death_are_disconnected() {
        let (api, launcher) = api(AgentScript::default().silent("slow")).await;

        let first = {
            let sessions = api.sessions().clone();
            tokio::spawn(async move { sessions.request("slow", None, None).await })
        };
        let second = {
            let sessions = api.sessions().clone();
            tokio::spawn(async move { sessions.request("slow", None, None).await })
        };
        let agent = launcher.latest();
        agent.wait_for_count("slow", 2).await;
        agent.kill();

        assert!(matches!(first.await.unwrap(), Err(ApiError::Disconnected { .. })));
        assert!(matches!(second.await.unwrap(), Err(ApiError::Disconnected { .. })));
        assert_eq!(api.sessions().state(), SessionState::Initializing);
        assert!(matches!(
            api.request("slow", None).await,
            Err(ApiError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_agent_receives_response_for_its_request() {
        let (api, launcher) = api(AgentScript::default()).await;
        let session = api.sessions().current_session().unwrap();
        let _registration = session
            .router()
            .on_request("host/getActiveEditor", |_| async { Ok(json!({"uri": "file:///a.rs"})) });

        let agent = launcher.latest();
        agent.push(Message::request(41, "host/getActiveEditor", None));
        agent.push(Message::request(42, "host/unknown", None));
        let responses = agent.wait_for_responses(2).await;
        let find = |id: i64| {
            responses
                .iter()
                .find(|r| r.id == RequestId::Number(id))
                .cloned()
                .unwrap()
        };
        assert_eq!(find(41).result, Ok(json!({"uri": "file:///a.rs"})));
        assert_eq!(find(42).result.unwrap_err().code, METHOD_NOT_FOUND);
    }
}
