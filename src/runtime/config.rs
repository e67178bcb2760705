//! Bridge configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config
//! (apart from the agent path, which `validate()` insists on).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::types::ApiError;
use crate::protocols::framing::Framing;
use crate::protocols::rpc::ConnectionOptions;
use crate::protocols::typed::ClientInfo;
use crate::runtime::launcher::AgentCommand;

const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_INITIALIZE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Relaunch policy after the agent connection is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub agent: AgentCommand,
    pub framing: Framing,
    pub max_frame_bytes: usize,
    pub initialize_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Default deadline for facade requests; `None` waits until response or disconnect
    pub request_timeout_ms: Option<u64>,
    pub reconnect: ReconnectPolicy,
    pub client: ClientInfo,
    /// Passed to the agent verbatim in `initialize`
    pub initialization_options: Value,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            agent: AgentCommand::default(),
            framing: Framing::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            initialize_timeout_ms: DEFAULT_INITIALIZE_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            request_timeout_ms: None,
            reconnect: ReconnectPolicy::default(),
            client: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            initialization_options: Value::Object(Default::default()),
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ApiError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ApiError::InvalidInput {
            message: format!("Invalid bridge config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ApiError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ApiError::IoError {
                message: format!("Failed to read config {}: {e}", path.display()),
            })?;
        log::debug!("Loaded bridge config: path={}", path.display());
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.agent.path.as_os_str().is_empty() {
            return Err(ApiError::InvalidInput {
                message: "agent.path must not be empty".to_string(),
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(ApiError::InvalidInput {
                message: "maxFrameBytes must be greater than 0".to_string(),
            });
        }
        if self.initialize_timeout_ms == 0 {
            return Err(ApiError::InvalidInput {
                message: "initializeTimeoutMs must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            framing: self.framing,
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = BridgeConfig::from_json_str(r#"{"agent": {"path": "node"}}"#).unwrap();
        assert_eq!(config.agent.path, PathBuf::from("node"));
        assert_eq!(config.framing, Framing::Newline);
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.initialize_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_camel_case_fields() {
        let config = BridgeConfig::from_json_str(
            r#"{
                "agent": {"path": "node", "args": ["agent.js"], "logPath": "/tmp/a.log"},
                "framing": "contentLength",
                "requestTimeoutMs": 1500,
                "reconnect": {"enabled": false},
                "client": {"name": "vs", "version": "1.2.3"},
                "initializationOptions": {"ide": {"name": "Visual Studio"}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.framing, Framing::ContentLength);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(1500)));
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.client.name, "vs");
        assert_eq!(config.initialization_options, json!({"ide": {"name": "Visual Studio"}}));
        assert_eq!(config.agent.log_path, Some(PathBuf::from("/tmp/a.log")));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            BridgeConfig::from_json_str("{}"),
            Err(ApiError::InvalidInput { .. })
        ));
        assert!(matches!(
            BridgeConfig::from_json_str(r#"{"agent": {"path": "node"}, "maxFrameBytes": 0}"#),
            Err(ApiError::InvalidInput { .. })
        ));
        assert!(matches!(
            BridgeConfig::from_json_str("not json"),
            Err(ApiError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        assert!(matches!(
            BridgeConfig::load("/nonexistent/bridge.json").await,
            Err(ApiError::IoError { .. })
        ));
    }
}
