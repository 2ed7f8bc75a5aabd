//! Debounced artifact watcher
//!
//! Wraps the platform watcher behind a per-path debounce: bursts of raw
//! notifications for one path (editors and build tools love rewriting files
//! several times in a row) coalesce into a single [`ChangeEvent`] once the
//! path has been quiet for the debounce window.

use hotswap_core::{now_micros, HotswapError, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One coalesced change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path that changed
    pub path: PathBuf,
    /// Microseconds since epoch when the change was observed
    pub ts: u64,
}

/// Filesystem watcher with per-path debouncing.
pub struct FileWatcher {
    // Option so Drop can release the platform watcher (and with it the
    // callback's sender clone) before joining the debounce thread.
    watcher: Option<RecommendedWatcher>,
    debouncer: Option<JoinHandle<()>>,
    raw_tx: Sender<PathBuf>,
}

impl FileWatcher {
    /// Create a watcher. Returns the watcher plus the receiver of coalesced
    /// change events.
    pub fn new(debounce: Duration) -> Result<(FileWatcher, Receiver<ChangeEvent>)> {
        let (raw_tx, raw_rx) = mpsc::channel::<PathBuf>();
        let (event_tx, event_rx) = mpsc::channel::<ChangeEvent>();

        let callback_tx = raw_tx.clone();
        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for path in event.paths {
                        let _ = callback_tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watch error"),
            }
        })
        .map_err(|e| HotswapError::internal(format!("watcher init: {}", e)))?;

        let debouncer = std::thread::Builder::new()
            .name("hotswap-watch".to_string())
            .spawn(move || debounce_loop(raw_rx, event_tx, debounce))
            .map_err(|e| HotswapError::internal(format!("watcher thread spawn: {}", e)))?;

        Ok((
            FileWatcher {
                watcher: Some(watcher),
                debouncer: Some(debouncer),
                raw_tx,
            },
            event_rx,
        ))
    }

    fn platform_watcher(&mut self) -> &mut RecommendedWatcher {
        self.watcher.as_mut().expect("watcher alive until drop")
    }

    /// Watch a file or directory tree.
    pub fn watch(&mut self, path: &Path, recursive: bool) -> Result<()> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.platform_watcher()
            .watch(path, mode)
            .map_err(|e| HotswapError::invalid_argument(format!("watch {}: {}", path.display(), e)))
    }

    /// Stop watching a path.
    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.platform_watcher().unwatch(path).map_err(|e| {
            HotswapError::invalid_argument(format!("unwatch {}: {}", path.display(), e))
        })
    }

    /// Inject a synthetic change (tests and manual retriggers).
    pub fn inject(&self, path: PathBuf) {
        let _ = self.raw_tx.send(path);
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        // Release the platform watcher first so the callback's sender clone
        // dies, then drop our own sender; the closed channel lets the
        // debouncer drain and exit.
        self.watcher = None;
        let (orphan_tx, _) = mpsc::channel();
        self.raw_tx = orphan_tx;
        if let Some(handle) = self.debouncer.take() {
            let _ = handle.join();
        }
    }
}

fn debounce_loop(raw_rx: Receiver<PathBuf>, event_tx: Sender<ChangeEvent>, debounce: Duration) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let timeout = pending
            .values()
            .min()
            .map(|oldest| {
                debounce
                    .checked_sub(oldest.elapsed())
                    .unwrap_or(Duration::ZERO)
            })
            .unwrap_or(debounce);

        match raw_rx.recv_timeout(timeout) {
            Ok(path) => {
                // Every raw event restarts the path's quiet window.
                pending.insert(path, Instant::now());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                for (path, _) in pending.drain() {
                    let _ = event_tx.send(ChangeEvent {
                        path,
                        ts: now_micros(),
                    });
                }
                debug!("watcher debounce loop stopped");
                return;
            }
        }

        let now = Instant::now();
        let ready: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= debounce)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ready {
            pending.remove(&path);
            if event_tx
                .send(ChangeEvent {
                    path,
                    ts: now_micros(),
                })
                .is_err()
            {
                return;
            }
        }
    }
}
