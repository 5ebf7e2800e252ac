//! Core types for the upstream fleet supervisor: error taxonomy, state
//! enumerations with the administrative transition table, per-server
//! connection metrics, and the restart-loop tracker.

pub mod error;
pub mod info;
pub mod machine;
pub mod restart;
pub mod state;

pub use error::ProxyError;
pub use info::ConnectionInfo;
pub use machine::{
    DEFAULT_AUTO_DISABLE_THRESHOLD, FailureOutcome, ServerStateMachine, Transition,
};
pub use restart::{RestartDecision, RestartTracker, RestartTrackerConfig};
pub use state::{AppState, ConnectionState, ServerState};

pub type Result<T> = std::result::Result<T, ProxyError>;
