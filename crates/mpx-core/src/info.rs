use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::ConnectionState;

/// Runtime metrics for one upstream connection.
///
/// Owned and mutated exclusively by the managing client; everyone else sees
/// cloned snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<DateTime<Utc>>,
    /// Name the server reported about itself during the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
    /// Effective auto-disable threshold (per-server override or global).
    pub auto_disable_threshold: u32,
    /// The operator stopped this server by hand. Never persisted.
    #[serde(skip)]
    pub user_stopped: bool,
}

impl ConnectionInfo {
    pub fn new(auto_disable_threshold: u32) -> Self {
        Self {
            auto_disable_threshold,
            ..Self::default()
        }
    }

    /// Records a failed connection attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.first_failure.is_none() {
            self.first_failure = Some(Utc::now());
        }
    }

    /// Records a successful handshake, resetting the failure streak.
    pub fn record_success(&mut self, name: Option<String>, version: Option<String>) {
        self.state = ConnectionState::Ready;
        self.last_error = None;
        self.consecutive_failures = 0;
        self.first_failure = None;
        self.last_successful_connection = Some(Utc::now());
        self.reported_name = name;
        self.reported_version = version;
    }
}
