use crate::lock::LockHolder;
use crate::measurement::ParseError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum PipelineError {
    Database(String),
    Broker(String),
    Config(String),
    Parse(ParseError),
    Io(std::io::Error),
    Subprocess { program: String, reason: String },
    /// The engine produced a different number of rows than the grid declares.
    Contract(String),
    LockTimeout {
        lock: String,
        waited: Duration,
        holder: Option<LockHolder>,
    },
    AlreadyRunning(PathBuf),
    NotRunning(PathBuf),
    Other(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Database(e) => write!(f, "Database error: {}", e),
            PipelineError::Broker(e) => write!(f, "Broker error: {}", e),
            PipelineError::Config(e) => write!(f, "Configuration error: {}", e),
            PipelineError::Parse(e) => write!(f, "Parse error: {}", e),
            PipelineError::Io(e) => write!(f, "IO error: {}", e),
            PipelineError::Subprocess { program, reason } => {
                write!(f, "Subprocess {} failed: {}", program, reason)
            }
            PipelineError::Contract(e) => write!(f, "Contract violation: {}", e),
            PipelineError::LockTimeout { lock, waited, holder } => {
                write!(f, "Timed out after {:?} waiting for lock {}", waited, lock)?;
                match holder {
                    Some(h) => write!(f, " (held by {})", h),
                    None => write!(f, " (holder unknown)"),
                }
            }
            PipelineError::AlreadyRunning(p) => {
                write!(f, "Service already running (PID file {} exists)", p.display())
            }
            PipelineError::NotRunning(p) => {
                write!(f, "Service is not running (no PID file at {})", p.display())
            }
            PipelineError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<ParseError> for PipelineError {
    fn from(err: ParseError) -> Self {
        PipelineError::Parse(err)
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

#[cfg(feature = "distributed")]
impl From<postgres::Error> for PipelineError {
    fn from(err: postgres::Error) -> Self {
        PipelineError::Database(err.to_string())
    }
}

#[cfg(feature = "distributed")]
impl From<rumqttc::ClientError> for PipelineError {
    fn from(err: rumqttc::ClientError) -> Self {
        PipelineError::Broker(err.to_string())
    }
}

impl From<String> for PipelineError {
    fn from(err: String) -> Self {
        PipelineError::Other(err)
    }
}

impl From<&str> for PipelineError {
    fn from(err: &str) -> Self {
        PipelineError::Other(err.to_string())
    }
}
