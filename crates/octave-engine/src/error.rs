use std::fmt;

/// Failures surfaced by the supervisor to its callers.
///
/// Cloneable so a single launch outcome can be handed to every caller that
/// joined the same start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Every launch candidate failed; carries the last failure.
    LaunchFailed(String),
    /// The request's deadline elapsed before a response arrived.
    Timeout { command: String },
    /// The worker answered `ok: false`.
    Rejected(String),
    /// No live worker to talk to.
    Unavailable(String),
    /// The worker exited while the request was outstanding.
    Crashed(String),
    Io(String),
    Protocol(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::LaunchFailed(_) => "E_ENGINE_LAUNCH_FAILED",
            EngineError::Timeout { .. } => "E_ENGINE_TIMEOUT",
            EngineError::Rejected(_) => "E_ENGINE_REJECTED",
            EngineError::Unavailable(_) => "E_ENGINE_UNAVAILABLE",
            EngineError::Crashed(_) => "E_ENGINE_CRASHED",
            EngineError::Io(_) => "E_ENGINE_IO",
            EngineError::Protocol(_) => "E_ENGINE_PROTOCOL",
        }
    }

    /// Short machine-readable class, used as the trace error `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::LaunchFailed(_) | EngineError::Crashed(_) => "process",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Rejected(_) => "worker",
            EngineError::Unavailable(_) => "logic",
            EngineError::Io(_) => "io",
            EngineError::Protocol(_) => "protocol",
        }
    }

    /// Message without the code prefix, as shown to users in `last_error`.
    pub fn message(&self) -> String {
        match self {
            EngineError::Timeout { command } => format!("engine request timeout: {command}"),
            EngineError::LaunchFailed(m)
            | EngineError::Rejected(m)
            | EngineError::Unavailable(m)
            | EngineError::Crashed(m)
            | EngineError::Io(m)
            | EngineError::Protocol(m) => m.clone(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;
