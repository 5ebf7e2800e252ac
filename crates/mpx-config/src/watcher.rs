//! Config file watching with programmatic-write suppression.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::file::ProxyConfig;

/// Watches the config file and invokes a callback with freshly loaded
/// configs on genuine external edits.
///
/// Programmatic writes call [`suppress_next_reload`](Self::suppress_next_reload)
/// before renaming the temp file into place, so the resulting filesystem
/// event is swallowed instead of being reported as an external change.
pub struct ConfigWatcher {
    path: PathBuf,
    skip_next_reload: Arc<AtomicBool>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Starts watching `path`. `on_change` may be called from the watcher's
    /// backend thread; it must not block for long.
    pub fn spawn(
        path: impl AsRef<Path>,
        on_change: impl Fn(ProxyConfig) + Send + Sync + 'static,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let skip_next_reload = Arc::new(AtomicBool::new(false));

        let handler_path = path.clone();
        let handler_skip = Arc::clone(&skip_next_reload);
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if !is_relevant(&event, &handler_path) {
                        return;
                    }
                    if handler_skip.swap(false, Ordering::SeqCst) {
                        info!(path = %handler_path.display(), "skipping reload of our own write");
                        return;
                    }
                    match ProxyConfig::load(&handler_path) {
                        Ok(config) => {
                            info!(path = %handler_path.display(), "config file changed, reloading");
                            on_change(config);
                        }
                        Err(e) => {
                            warn!(
                                path = %handler_path.display(),
                                error = %e,
                                "config file changed but failed to load, keeping previous config"
                            );
                        }
                    }
                }
                Err(e) => error!(error = %e, "config watcher error"),
            },
        )
        .context("failed to create config watcher")?;

        // Watch the parent directory: atomic rename-over replaces the inode,
        // and watching the file itself would go stale after the first save.
        let watch_root = path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_root, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", watch_root.display()))?;

        info!(path = %path.display(), "watching config file for changes");
        Ok(Self {
            path,
            skip_next_reload,
            _watcher: watcher,
        })
    }

    /// Suppresses the next filesystem event for the watched file.
    pub fn suppress_next_reload(&self) {
        self.skip_next_reload.store(true, Ordering::SeqCst);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_relevant(event: &Event, path: &Path) -> bool {
    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
        return false;
    }
    event.paths.iter().any(|p| p == path)
}
