//! Child process-group discipline.
//!
//! Every stdio upstream runs in its own process group (setsid in the child's
//! pre_exec). Termination always targets the whole group so wrapper scripts
//! cannot leave orphans behind.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default grace between SIGTERM and SIGKILL when tearing a group down.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Live process groups spawned for upstreams, keyed by server name.
///
/// The shutdown coordinator sweeps this after all clients have disconnected
/// and force-terminates anything still registered.
#[derive(Default)]
pub struct ProcessRegistry {
    groups: Mutex<HashMap<String, i32>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: &str, pgid: i32) {
        debug!(server = %server, pgid, "registered process group");
        self.lock().insert(server.to_string(), pgid);
    }

    pub fn unregister(&self, server: &str) {
        self.lock().remove(server);
    }

    pub fn active(&self) -> Vec<(String, i32)> {
        let mut groups: Vec<_> = self.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
        groups.sort();
        groups
    }

    /// Force-terminates every group still registered. Returns how many were
    /// still alive.
    pub async fn kill_lingering(&self, grace: Duration) -> usize {
        let lingering = {
            let mut groups = self.lock();
            groups.drain().collect::<Vec<_>>()
        };

        let mut killed = 0;
        for (server, pgid) in lingering {
            if group_alive(pgid) {
                warn!(server = %server, pgid, "process group survived disconnect, force-terminating");
                terminate_group(pgid, grace).await;
                killed += 1;
            }
        }
        killed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, i32>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whether any process in the group still exists.
pub fn group_alive(pgid: i32) -> bool {
    // killpg with signal 0 probes without delivering anything.
    unsafe { libc::killpg(pgid, 0) == 0 }
}

/// SIGTERM to the whole group, a bounded grace for voluntary exit, then
/// SIGKILL for whatever remains.
pub async fn terminate_group(pgid: i32, grace: Duration) {
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !group_alive(pgid) {
            return;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }

    if group_alive(pgid) {
        debug!(pgid, "grace expired, sending SIGKILL to process group");
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}
