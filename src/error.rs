use thiserror::Error;

/// Main error type for the shepherd supervisor
#[derive(Debug, Error)]
pub enum ShepherdError {
    // Configuration errors
    #[error("Invalid configuration: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Process-related errors
    #[error("Failed to spawn '{app}': {reason}")]
    Spawn { app: String, reason: String },

    #[error("'{app}' instance {instance} exited unexpectedly: {detail}")]
    RuntimeExit {
        app: String,
        instance: usize,
        detail: String,
    },

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Daemon already running on {0}")]
    DaemonAlreadyRunning(String),

    // Log-related errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("{0}")]
    Other(String),
}

impl ShepherdError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn spawn(app: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            app: app.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for shepherd operations
pub type Result<T> = std::result::Result<T, ShepherdError>;
