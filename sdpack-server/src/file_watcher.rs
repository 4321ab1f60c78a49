//! File watcher module for rebuild-on-change
//!
//! Watches the directories holding the bundle's source modules and rebuilds
//! the bundle when one of them changes. The server keeps serving the previous
//! bundle until the rebuild's rename lands.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{DataChange, ModifyKind};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sdpack_core::ResolvedConfig;

use crate::{AppState, ServeError};

/// Quiet period after the last change before rebuilding
const DEBOUNCE: Duration = Duration::from_millis(150);

/// Extensions that can be part of the module graph
const WATCHED_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "json"];

/// Stops the watcher thread when told to or dropped
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
}

impl WatchHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start watching `sources` and rebuild into `state` on change
pub fn spawn_rebuild_watcher(
    config: ResolvedConfig,
    sources: Vec<PathBuf>,
    state: Arc<AppState>,
) -> Result<WatchHandle, ServeError> {
    let (tx, rx) = std::sync::mpsc::channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        Config::default().with_poll_interval(Duration::from_millis(500)),
    )?;

    let mut watched = BTreeSet::new();
    watch_source_dirs(&mut watcher, &mut watched, &sources)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    tokio::task::spawn_blocking(move || {
        let mut pending: Option<Instant> = None;

        while !stop_flag.load(Ordering::SeqCst) {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => {
                    let relevant = event
                        .paths
                        .iter()
                        .any(|path| is_relevant(&event.kind, path, &config.output.dir));
                    if relevant {
                        tracing::debug!("Change detected: {:?}", event.paths);
                        pending = Some(Instant::now());
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    tracing::info!("File watcher channel closed");
                    break;
                }
            }

            let Some(changed_at) = pending else { continue };
            if changed_at.elapsed() < DEBOUNCE {
                continue;
            }
            pending = None;

            let result = sdpack_core::bundle(&config);
            match &result {
                Ok(output) => {
                    if let Err(e) = watch_source_dirs(&mut watcher, &mut watched, &output.sources) {
                        tracing::warn!("Failed to watch new source directory: {}", e);
                    }
                }
                Err(e) => tracing::error!("Rebuild failed: {}", e),
            }
            state.build_status.blocking_write().record(&result);
        }

        tracing::info!("File watcher stopped");
    });

    Ok(WatchHandle { stop })
}

/// Watch each source's directory once
fn watch_source_dirs(
    watcher: &mut RecommendedWatcher,
    watched: &mut BTreeSet<PathBuf>,
    sources: &[PathBuf],
) -> Result<(), notify::Error> {
    for dir in sources.iter().filter_map(|s| s.parent()) {
        if watched.contains(dir) {
            continue;
        }
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        tracing::info!("Watching {}", dir.display());
        watched.insert(dir.to_path_buf());
    }
    Ok(())
}

/// Whether an event kind for one path can change the module graph
///
/// - Create: only if the path exists
/// - Modify(Name), Modify(Data(Content | Any)), Modify(Any), Remove: always
///   (macOS reports deletions as renames, inotify reports writes as Data(Any))
/// - Metadata and access events: never
fn triggers_rebuild(kind: &EventKind, path: &Path) -> bool {
    match kind {
        EventKind::Create(_) => path.exists(),
        EventKind::Remove(_)
        | EventKind::Modify(ModifyKind::Name(_))
        | EventKind::Modify(ModifyKind::Data(DataChange::Content | DataChange::Any))
        | EventKind::Modify(ModifyKind::Any) => true,
        _ => false,
    }
}

/// Whether a change at `path` should trigger a rebuild
fn is_relevant(kind: &EventKind, path: &Path, output_dir: &Path) -> bool {
    if path.starts_with(output_dir) {
        return false;
    }
    let watched_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| WATCHED_EXTENSIONS.contains(&ext));
    watched_ext && triggers_rebuild(kind, path)
}
