use crate::state::ServerState;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Server '{0}' already exists")]
    DuplicateServer(String),

    #[error("No server named '{0}'")]
    ServerNotFound(String),

    #[error("Server '{server}' is {state} and is not eligible to connect")]
    NotEligible { server: String, state: ServerState },

    #[error("State transition {from} -> {to} is not allowed")]
    InvalidTransition { from: ServerState, to: ServerState },

    #[error("Restart of '{server}' blocked by restart-loop guard; retry in {retry_after_secs}s")]
    RestartLoopBlocked { server: String, retry_after_secs: u64 },

    #[error("Transport failure for '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("Connection to '{server}' timed out after {timeout_secs}s")]
    ConnectTimeout { server: String, timeout_secs: u64 },

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Shutdown exceeded total timeout of {timeout_secs}s")]
    ShutdownTimeout { timeout_secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{}", failures.join("; "))]
    Aggregate { failures: Vec<String> },
}

impl ProxyError {
    /// Wraps a transport-layer error for a named server.
    pub fn transport(server: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            server: server.into(),
            message: err.to_string(),
        }
    }
}
