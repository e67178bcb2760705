//! Telemetry sinks used by `HostApi::track`.

use std::sync::Weak;

use crate::api::types::{ApiError, TelemetryEvent};
use crate::protocols::typed::{to_params, NotificationType, TelemetryNotification};
use crate::runtime::session::SessionManager;

/// Destination of best-effort analytics events.
pub trait TelemetrySink: Send + Sync {
    fn track(&self, event: &TelemetryEvent) -> Result<(), ApiError>;
}

/// Forwards events to the agent as `telemetry` notifications.
pub struct AgentTelemetrySink {
    sessions: Weak<SessionManager>,
}

impl AgentTelemetrySink {
    pub fn new(sessions: Weak<SessionManager>) -> Self {
        Self { sessions }
    }
}

impl TelemetrySink for AgentTelemetrySink {
    fn track(&self, event: &TelemetryEvent) -> Result<(), ApiError> {
        let sessions = self.sessions.upgrade().ok_or(ApiError::Disposed)?;
        sessions.notify(TelemetryNotification::METHOD, to_params(event)?)
    }
}

/// Writes events to the log only.
pub struct LogTelemetrySink;

impl TelemetrySink for LogTelemetrySink {
    fn track(&self, event: &TelemetryEvent) -> Result<(), ApiError> {
        log::info!(
            "Telemetry: event={}, properties={}",
            event.event_name,
            event.properties
        );
        Ok(())
    }
}
