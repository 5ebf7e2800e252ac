//! Restart-loop guard: sliding-window restart counting with cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_RESTARTS: u32 = 3;
pub const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
pub struct RestartTrackerConfig {
    /// Restarts allowed inside `time_window` before the guard trips.
    pub max_restarts: u32,
    pub time_window: Duration,
    pub cooldown: Duration,
}

impl Default for RestartTrackerConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            time_window: DEFAULT_TIME_WINDOW,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// What `record_restart` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    Allowed {
        total_restarts: u64,
    },
    /// A previous loop detection is still cooling down.
    CoolingDown {
        retry_after: Duration,
    },
    /// This attempt tripped the guard; a cooldown has been started.
    ///
    /// `restarts_in_window` includes the refused attempt itself.
    LoopDetected {
        restarts_in_window: u32,
        window: Duration,
        cooldown: Duration,
    },
}

impl RestartDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Default)]
struct ServerEntry {
    timestamps: VecDeque<Instant>,
    total: u64,
    cooldown_until: Option<Instant>,
}

/// Per-server restart accounting shared across the fleet.
pub struct RestartTracker {
    config: RestartTrackerConfig,
    entries: Mutex<HashMap<String, ServerEntry>>,
}

impl RestartTracker {
    pub fn new(config: RestartTrackerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RestartTrackerConfig {
        self.config
    }

    /// Records a restart attempt, returning whether it may proceed.
    pub fn record_restart(&self, name: &str) -> RestartDecision {
        self.record_restart_at(name, Instant::now())
    }

    /// Time-injected form of [`record_restart`](Self::record_restart).
    pub fn record_restart_at(&self, name: &str, now: Instant) -> RestartDecision {
        let mut entries = self.lock();
        let entry = entries.entry(name.to_string()).or_default();

        if let Some(until) = entry.cooldown_until {
            if now < until {
                return RestartDecision::CoolingDown {
                    retry_after: until.duration_since(now),
                };
            }
            entry.cooldown_until = None;
        }

        Self::evict_expired(entry, now, self.config.time_window);

        if entry.timestamps.len() as u32 >= self.config.max_restarts {
            entry.cooldown_until = Some(now + self.config.cooldown);
            return RestartDecision::LoopDetected {
                restarts_in_window: entry.timestamps.len() as u32 + 1,
                window: self.config.time_window,
                cooldown: self.config.cooldown,
            };
        }

        entry.timestamps.push_back(now);
        entry.total += 1;
        RestartDecision::Allowed {
            total_restarts: entry.total,
        }
    }

    /// Read-only check: would a restart be allowed right now?
    pub fn can_restart(&self, name: &str) -> bool {
        self.can_restart_at(name, Instant::now())
    }

    pub fn can_restart_at(&self, name: &str, now: Instant) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(name) else {
            return true;
        };

        if let Some(until) = entry.cooldown_until {
            if now < until {
                return false;
            }
        }
        Self::evict_expired(entry, now, self.config.time_window);
        (entry.timestamps.len() as u32) < self.config.max_restarts
    }

    /// Clears all guard state for one server (explicit user re-enable).
    pub fn reset(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn reset_all(&self) {
        self.lock().clear();
    }

    /// Lifetime restart count for a server.
    pub fn total_restarts(&self, name: &str) -> u64 {
        self.lock().get(name).map(|e| e.total).unwrap_or(0)
    }

    fn evict_expired(entry: &mut ServerEntry, now: Instant, window: Duration) {
        while let Some(front) = entry.timestamps.front() {
            if now.saturating_duration_since(*front) >= window {
                entry.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServerEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::new(RestartTrackerConfig::default())
    }
}
