//! Error types for the snapshot service

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while keeping sessions alive or rendering images
#[derive(Error, Debug)]
pub enum Error {
    /// A slot never produced a 200 response within its retry budget
    #[error("Initialization of slot '{slot}' failed after {attempts} attempt(s): {last}")]
    InitializationFailure {
        slot: String,
        attempts: u32,
        last: AttemptFailure,
    },

    /// The ready selector did not appear in time
    #[error("timeout waiting for element '{selector}' after {}ms", .timeout.as_millis())]
    ReadinessTimeout { selector: String, timeout: Duration },

    /// An external transform exited unsuccessfully
    #[error("Transform '{transform}' failed: {exit}")]
    TransformFailure { transform: String, exit: ExitInfo },

    /// Scratch files could not be allocated
    #[error("Scratch resources exhausted: {0}")]
    ResourceExhausted(#[source] std::io::Error),

    /// Navigation to a target page failed before any status was observed
    #[error("Navigation failed: {0}")]
    NavigationError(String),

    /// Capturing a page region failed
    #[error("Capture failed: {0}")]
    CaptureError(String),

    /// A pipeline references inputs or artifacts it does not have
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// No configured slot or group carries this name
    #[error("Unknown slot or group '{0}'")]
    UnknownSlot(String),

    /// The manager has been shut down and no longer hands out sessions
    #[error("Session manager is shutting down")]
    ShuttingDown,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// File I/O outside of scratch allocation
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(err.to_string())
    }
}

/// The last thing that went wrong during one initialization attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The page answered, but not with 200
    Status(u16),
    /// Navigation (or opening the page) errored before a status was seen
    Error(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Status(code) => write!(f, "unexpected status {}", code),
            AttemptFailure::Error(msg) => write!(f, "{}", msg),
        }
    }
}

/// How an external transform process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitInfo {
    /// Exited with a non-zero code; carries trimmed stderr
    Code { code: i32, stderr: String },
    /// Killed by a signal (no exit code available)
    Terminated { stderr: String },
    /// The process could not be started at all
    Spawn(String),
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitInfo::Code { code, stderr } if stderr.is_empty() => write!(f, "exit code {}", code),
            ExitInfo::Code { code, stderr } => write!(f, "exit code {}: {}", code, stderr),
            ExitInfo::Terminated { stderr } if stderr.is_empty() => write!(f, "terminated by signal"),
            ExitInfo::Terminated { stderr } => write!(f, "terminated by signal: {}", stderr),
            ExitInfo::Spawn(msg) => write!(f, "could not start: {}", msg),
        }
    }
}
