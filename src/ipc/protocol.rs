// IPC Protocol definitions for client-daemon communication

use crate::error::Result;
use crate::logs::LogLine;
use crate::process::ManagedProcess;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

pub use crate::process::{ProcessId, ProcessState};

/// Snapshot of one managed instance, as reported by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub app: String,
    pub instance: usize,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub uptime: Duration,
    pub restarts: usize,
    pub exit_code: Option<i32>,
    pub cpu_usage: f32,
    pub memory_usage: u64,
    pub started_at: Option<SystemTime>,
    pub last_restart: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl From<&ManagedProcess> for ProcessInfo {
    fn from(process: &ManagedProcess) -> Self {
        Self {
            id: process.id,
            app: process.app.clone(),
            instance: process.instance,
            pid: process.pid,
            state: process.state,
            uptime: process.uptime(),
            restarts: process.restarts,
            exit_code: process.exit_code,
            cpu_usage: process.cpu_usage,
            memory_usage: process.memory_usage,
            started_at: process.started_at,
            last_restart: process.last_restart,
            last_error: process.last_error.clone(),
        }
    }
}

/// Result of a start/stop/restart for one app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppOutcome {
    pub app: String,
    /// Instances affected
    pub instances: usize,
    pub error: Option<String>,
}

impl AppOutcome {
    pub fn success(app: impl Into<String>, instances: usize) -> Self {
        Self {
            app: app.into(),
            instances,
            error: None,
        }
    }

    pub fn failure(app: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            instances: 0,
            error: Some(error.into()),
        }
    }

    pub fn from_result(app: impl Into<String>, result: Result<usize>) -> Self {
        match result {
            Ok(instances) => Self::success(app, instances),
            Err(e) => Self::failure(app, e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Options for viewing logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    pub app: String,
    pub lines: usize,
}

/// All available commands. `app: None` targets every app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Start { app: Option<String> },
    Stop { app: Option<String> },
    Restart { app: Option<String> },
    Status { app: Option<String> },
    Logs(LogOptions),
    /// Re-read the daemon's config file
    Reload,
    Ping,
    /// Stop every instance and exit the daemon
    Shutdown,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    /// Per-app results of start, stop, restart and reload
    Outcomes(Vec<AppOutcome>),
    ProcessList(Vec<ProcessInfo>),
    Logs(Vec<LogLine>),
    DaemonStatus {
        pid: u32,
        uptime: Duration,
        apps: usize,
    },
    /// Generic success message
    Success(String),
}

/// Request message from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: std::result::Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShepherdError;

    #[test]
    fn test_outcome_from_result() {
        let ok = AppOutcome::from_result("web", Ok(2));
        assert!(ok.is_success());
        assert_eq!(ok.instances, 2);

        let failed = AppOutcome::from_result(
            "web",
            Err(ShepherdError::spawn("web", "failed to execute 'nope'")),
        );
        assert!(!failed.is_success());
        assert_eq!(failed.instances, 0);
        assert_eq!(
            failed.error.as_deref(),
            Some("Failed to spawn 'web': failed to execute 'nope'")
        );
    }

    #[test]
    fn test_request_wire_format() {
        let request = Request::new(
            7,
            Command::Start {
                app: Some("web".to_string()),
            },
        );
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"id":7,"command":{"Start":{"app":"web"}}}"#);
    }

    #[test]
    fn test_error_response_wire_format() {
        let response = Response::error(3, "App not found: web".to_string());
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"id":3,"result":{"Err":"App not found: web"}}"#);
    }
}
