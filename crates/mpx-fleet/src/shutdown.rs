//! Phased, timeout-bounded shutdown.
//!
//! Phases run in a fixed order; within a phase, handlers run by descending
//! priority. Handler failures never stop the sequence, and the whole run is
//! bounded by a total deadline. The first run's result is memoized: shutdown
//! happens at most once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{OnceCell, mpsc};
use tracing::{debug, info, warn};

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Ordered shutdown phases, outermost surface first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownPhase {
    Connections,
    WebSockets,
    Upstreams,
    Processes,
    Storage,
    Cleanup,
}

impl ShutdownPhase {
    pub const ALL: [Self; 6] = [
        Self::Connections,
        Self::WebSockets,
        Self::Upstreams,
        Self::Processes,
        Self::Storage,
        Self::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connections => "connections",
            Self::WebSockets => "websockets",
            Self::Upstreams => "upstreams",
            Self::Processes => "processes",
            Self::Storage => "storage",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress notifications for observers. Lost silently when the observer's
/// queue is full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownProgress {
    PhaseStarted(ShutdownPhase),
    HandlerFinished {
        phase: ShutdownPhase,
        name: String,
        ok: bool,
    },
    PhaseFinished(ShutdownPhase),
}

/// Result of the (single) shutdown run.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub completed_phases: Vec<ShutdownPhase>,
    /// `<phase>/<handler>: <error>` per failure, plus the timeout entry when
    /// the total deadline fired.
    pub errors: Vec<String>,
    pub timed_out: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.timed_out
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type HandlerFn = Box<dyn Fn() -> HandlerFuture + Send + Sync>;

struct Handler {
    name: String,
    phase: ShutdownPhase,
    priority: i32,
    timeout: Duration,
    func: HandlerFn,
}

/// Runs registered handlers through the phase sequence exactly once.
pub struct ShutdownCoordinator {
    handlers: Mutex<Vec<Handler>>,
    total_timeout: Duration,
    progress: Mutex<Option<mpsc::Sender<ShutdownProgress>>>,
    result: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new(total_timeout: Duration) -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            total_timeout,
            progress: Mutex::new(None),
            result: OnceCell::new(),
        }
    }

    /// Registers a handler. `timeout` of `None` uses the coordinator default.
    pub fn register<F, Fut>(
        &self,
        name: &str,
        phase: ShutdownPhase,
        priority: i32,
        timeout: Option<Duration>,
        func: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Handler {
            name: name.to_string(),
            phase,
            priority,
            timeout: timeout.unwrap_or(DEFAULT_HANDLER_TIMEOUT),
            func: Box::new(move || Box::pin(func())),
        };
        self.lock_handlers().push(handler);
    }

    /// Opens a bounded progress stream. Items that do not fit are dropped.
    pub fn progress_stream(&self, capacity: usize) -> mpsc::Receiver<ShutdownProgress> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Executes the shutdown sequence, or returns the memoized result of the
    /// first call.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.result.get_or_init(|| self.run()).await.clone()
    }

    pub fn has_run(&self) -> bool {
        self.result.get().is_some()
    }

    async fn run(&self) -> ShutdownReport {
        let deadline = tokio::time::Instant::now() + self.total_timeout;
        let mut handlers: Vec<Handler> = {
            let mut guard = self.lock_handlers();
            guard.drain(..).collect()
        };
        // Stable sort keeps registration order among equal priorities.
        handlers.sort_by_key(|h| (h.phase, std::cmp::Reverse(h.priority)));

        info!(
            handlers = handlers.len(),
            total_timeout_secs = self.total_timeout.as_secs(),
            "shutdown started"
        );

        let mut report = ShutdownReport::default();
        let mut handlers = handlers.into_iter().peekable();

        'phases: for phase in ShutdownPhase::ALL {
            let mut phase_started = false;

            while let Some(handler) = handlers.next_if(|h| h.phase == phase) {
                if !phase_started {
                    phase_started = true;
                    self.emit(ShutdownProgress::PhaseStarted(phase));
                }

                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    report.timed_out = true;
                    report.errors.push(
                        mpx_core::ProxyError::ShutdownTimeout {
                            timeout_secs: self.total_timeout.as_secs(),
                        }
                        .to_string(),
                    );
                    warn!(phase = %phase, "total shutdown timeout reached, skipping remaining phases");
                    break 'phases;
                }

                let budget = handler.timeout.min(remaining);
                debug!(phase = %phase, handler = %handler.name, "running shutdown handler");
                let outcome = tokio::time::timeout(budget, (handler.func)()).await;
                let ok = matches!(outcome, Ok(Ok(())));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        report
                            .errors
                            .push(format!("{phase}/{}: {e:#}", handler.name));
                    }
                    Err(_) => {
                        report.errors.push(format!(
                            "{phase}/{}: timed out after {}s",
                            handler.name,
                            budget.as_secs()
                        ));
                    }
                }
                self.emit(ShutdownProgress::HandlerFinished {
                    phase,
                    name: handler.name,
                    ok,
                });
            }

            report.completed_phases.push(phase);
            if phase_started {
                self.emit(ShutdownProgress::PhaseFinished(phase));
            }
        }

        info!(
            errors = report.errors.len(),
            timed_out = report.timed_out,
            "shutdown finished"
        );
        report
    }

    fn emit(&self, progress: ShutdownProgress) {
        let guard = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(progress);
        }
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Vec<Handler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_TIMEOUT)
    }
}

#[cfg(test)]
#[path = "shutdown_tests.rs"]
mod tests;
