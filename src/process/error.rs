//! ServerProcess 에러 타입

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("Server '{0}' is not running")]
    NotRunning(String),

    #[error("No runtime available for server '{server}': {reason}")]
    RuntimeUnavailable { server: String, reason: String },

    #[error("Launch script {0} does not exist")]
    LaunchScriptMissing(PathBuf),

    #[error("Server '{0}' has been removed")]
    Removed(String),

    #[error("server.properties of '{server}': {source}")]
    Properties {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn server '{server}': {source}")]
    SpawnFailed {
        server: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::RuntimeUnavailable { .. } => "RUNTIME_UNAVAILABLE",
            Self::LaunchScriptMissing(_) => "LAUNCH_SCRIPT_MISSING",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::Removed(_) => "SERVER_REMOVED",
            Self::Properties { .. } => "PROPERTIES_IO_ERROR",
        }
    }
}
