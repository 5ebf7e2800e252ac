//! Merging desired state (config file) with runtime state (database).

use mpx_core::ServerState;

use crate::db::UpstreamRecord;

/// Resolves the effective startup mode for a server at load time.
///
/// A durable auto-disable outranks a config that would (re)connect the
/// server: editing the file back to `active` or `lazy_loading` does not
/// silently undo the protection. Explicit administrative states in the
/// config (`disabled`, `quarantined`, `auto_disabled`) always win, as does
/// any config value when the database holds no auto-disable.
pub fn reconcile_startup_mode(
    config_mode: ServerState,
    record: Option<&UpstreamRecord>,
) -> ServerState {
    match record {
        Some(r)
            if r.server_state == ServerState::AutoDisabled && config_mode.is_connectable() =>
        {
            ServerState::AutoDisabled
        }
        _ => config_mode,
    }
}
