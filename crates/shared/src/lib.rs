//! Domain types shared between the kiln host and its tooling.
//!
//! Everything that crosses a module boundary inside the host (capability
//! flags, lifecycle states, validation results, tool schemas and the error
//! taxonomy) lives here so the core crate can stay focused on behaviour.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod tool;
pub mod violation;

pub use tool::ToolSchema;
pub use violation::{Location, ValidationResult, ValidationStatus, Violation, ViolationRule};

/// Crate version reported to tool servers during the MCP handshake.
pub const KILN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Permissions a tool server declares at creation time.
///
/// Flags are fixed for the lifetime of a sandbox instance; changing them
/// means rebuilding the instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub network: bool,
}

impl Capabilities {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_network() -> Self {
        Self { network: true }
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.network {
            write!(f, "network")
        } else {
            write!(f, "none")
        }
    }
}

/// Lifecycle of one AI-created server.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with `Crashed`
/// reachable from `Starting` (failed handshake) and `Running` (unexpected exit).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ServerState {
    /// States in which a second `start` must be refused.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// An AI-authored tool server as the host knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub source: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub autostart: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
    pub validation: ValidationStatus,
}

impl ServerDefinition {
    /// Only definitions whose current source passed validation may run.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.validation.valid
    }
}

/// Snapshot returned by `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub description: String,
    pub state: ServerState,
    pub capabilities: Capabilities,
    pub autostart: bool,
    pub tools: Vec<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// Error taxonomy shared by every public operation of the host.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum KilnError {
    #[error("Code validation failed: {}", violation::join(.0))]
    Validation(Vec<Violation>),
    #[error("Server '{id}' tried to import blocked module '{module}'")]
    RuntimeImportBlocked { id: String, module: String },
    #[error("Server '{id}' failed to start: {reason}{}", tail_suffix(.log_tail))]
    ProcessStartFailure {
        id: String,
        reason: String,
        log_tail: Vec<String>,
    },
    #[error("Server '{id}' is not running (state: {state})")]
    NotRunning { id: String, state: ServerState },
    #[error("Tool '{tool}' timed out after {secs}s")]
    DispatchTimeout { tool: String, secs: u64 },
    #[error("Manifest is corrupt: {0}")]
    ManifestCorruption(String),
    #[error("Server '{0}' does not exist")]
    ServerNotFound(String),
    #[error("Unknown tool '{0}'")]
    ToolNotFound(String),
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),
    #[error("Server '{0}' already exists")]
    AlreadyExists(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Tool error: {0}")]
    Tool(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

fn tail_suffix(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n--- server.log (last {} lines) ---\n{}", tail.len(), tail.join("\n"))
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<anyhow::Error> for KilnError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

pub type KilnResult<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(ServerState::Starting.is_active());
        assert!(ServerState::Running.is_active());
        assert!(!ServerState::Stopped.is_active());
        assert!(!ServerState::Stopping.is_active());
        assert!(!ServerState::Crashed.is_active());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ServerState::Crashed).unwrap();
        assert_eq!(json, "\"crashed\"");
    }

    #[test]
    fn test_capabilities_default_has_no_network() {
        let caps: Capabilities = serde_json::from_str("{}").unwrap();
        assert!(!caps.network);
        assert_eq!(caps.to_string(), "none");
        assert_eq!(Capabilities::with_network().to_string(), "network");
    }

    #[test]
    fn test_start_failure_message_includes_log_tail() {
        let err = KilnError::ProcessStartFailure {
            id: "weather".into(),
            reason: "handshake timed out".into(),
            log_tail: vec!["Traceback".into(), "NameError: x".into()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Server 'weather' failed to start: handshake timed out"));
        assert!(msg.contains("NameError: x"));
    }

    #[test]
    fn test_not_running_message() {
        let err = KilnError::NotRunning {
            id: "calc".into(),
            state: ServerState::Crashed,
        };
        assert_eq!(err.to_string(), "Server 'calc' is not running (state: crashed)");
    }
}
