use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Result alias for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors surfaced by the supervisor, the process launcher and the testers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("instance already started")]
    AlreadyRunning,
    #[error("instance not started")]
    NotRunning,
    #[error("invalid engine config: {0}")]
    InvalidConfig(String),
    #[error("runtime config missing socks/mixed/http inbound port")]
    MissingInboundPort,
    #[error("local proxy port {0} is already in use")]
    PortInUse(u16),
    #[error("failed to allocate tcp port: {0}")]
    PortAllocation(#[source] io::Error),
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("engine did not accept connections on port {port} within {timeout:?}")]
    EngineNotReady { port: u16, timeout: Duration },
    #[error("engine exited during startup with status {0}")]
    EngineExited(ExitStatus),
    #[error("start aborted by a concurrent stop")]
    StartAborted,
    #[error("probe failed: {0}")]
    ProbeFailure(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SupervisorError {
    pub(crate) fn invalid_config(err: impl ToString) -> Self {
        SupervisorError::InvalidConfig(err.to_string())
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        SupervisorError::EngineUnavailable(message.into())
    }

    pub(crate) fn probe(err: impl ToString) -> Self {
        SupervisorError::ProbeFailure(err.to_string())
    }
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        SupervisorError::invalid_config(err)
    }
}

impl From<reqwest::Error> for SupervisorError {
    fn from(err: reqwest::Error) -> Self {
        SupervisorError::probe(err)
    }
}
