use thiserror::Error;

/// Conditions that end a session before (or instead of) producing a report.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The pre-run probe got no response at all.
    #[error("target {target} is unreachable: {reason}")]
    ProbeUnreachable { target: String, reason: String },
    /// Not a single hold slot could be established.
    #[error("connection-hold pool could not establish any of {attempted} connections")]
    PoolExhausted { attempted: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid target address '{0}'")]
    InvalidTarget(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<loadsmith_common::ConfigError> for SessionError {
    fn from(e: loadsmith_common::ConfigError) -> Self {
        SessionError::InvalidConfig(e.to_string())
    }
}

/// Per-request failure; never fatal, always turned into an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Transport(String),
    /// A response arrived with a status at or above 400.
    Application(u16),
}

impl FailureKind {
    /// Text stored in the record's `error` field.
    pub fn describe(&self) -> String {
        match self {
            FailureKind::Timeout => "timeout: no response within deadline".to_string(),
            FailureKind::Transport(msg) => msg.clone(),
            FailureKind::Application(status) => format!("application error: HTTP {}", status),
        }
    }
}
