//! Hybrid filesystem watching.
//!
//! Each watched root is classified by the mount it lives on. Roots on
//! kernel-backed local filesystems get a recursive native watcher; roots on
//! network or FUSE mounts are polled with snapshot diffing, since remote
//! writers never surface through the local notification layer. Both paths
//! feed one debounced event pump that fans batches out to observers.

mod mounts;
mod poller;

pub use mounts::{
    FsCategory, MountEntry, MountResolver, SystemMounts, category_for_path, classify_fstype,
    parse_proc_mounts,
};

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::WatchConfig;
use crate::error::{EngineError, Result};

use poller::{collect_snapshot, diff_snapshots};

/// Canonical change classification, independent of the backend that
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
}

/// A single observed filesystem change.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl WatchEvent {
    pub fn now(kind: WatchEventKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: Utc::now(),
        }
    }
}

/// Receives debounced event batches. Implementations must not block; heavy
/// work belongs on a task queue.
pub trait WatchObserver: Send + Sync {
    fn on_events(&self, events: &[WatchEvent]);

    /// Called when watch setup fails for a mount during [`HybridWatcher::initialize`].
    fn on_error(&self, _root: &std::path::Path, _error: &EngineError) {}
}

/// Observer that drops every batch.
#[derive(Debug)]
pub struct NoopWatchObserver;

impl WatchObserver for NoopWatchObserver {
    fn on_events(&self, _events: &[WatchEvent]) {}
}

enum WatchBackend {
    Native(#[allow(dead_code)] RecommendedWatcher),
    Polled(JoinHandle<()>),
}

struct MountWatch {
    category: FsCategory,
    backend: WatchBackend,
}

type SharedObservers = Arc<Mutex<Vec<(u64, Arc<dyn WatchObserver>)>>>;

/// Handle returned by [`HybridWatcher::subscribe`]. Dropping it keeps the
/// subscription alive; call [`unsubscribe`](Subscription::unsubscribe) to
/// stop delivery.
pub struct Subscription {
    id: u64,
    observers: SharedObservers,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.observers.lock().retain(|(id, _)| *id != self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Watches a set of roots, choosing native notification or snapshot polling
/// per root based on its mount, and delivers debounced batches to
/// subscribed observers.
pub struct HybridWatcher {
    config: WatchConfig,
    resolver: Arc<dyn MountResolver>,
    watches: Mutex<HashMap<PathBuf, MountWatch>>,
    observers: SharedObservers,
    next_observer_id: AtomicU64,
    event_tx: mpsc::UnboundedSender<WatchEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HybridWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridWatcher")
            .field("roots", &self.roots())
            .finish()
    }
}

impl HybridWatcher {
    /// Create a watcher reading the live system mount table.
    pub fn new(config: WatchConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemMounts))
    }

    /// Create a watcher with a custom mount table source.
    pub fn with_resolver(config: WatchConfig, resolver: Arc<dyn MountResolver>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let observers: SharedObservers = Arc::new(Mutex::new(Vec::new()));
        let pump = tokio::spawn(run_event_pump(
            event_rx,
            Arc::clone(&observers),
            config.debounce_window_ms,
            config.max_batch_events,
        ));
        Self {
            config,
            resolver,
            watches: Mutex::new(HashMap::new()),
            observers,
            next_observer_id: AtomicU64::new(0),
            event_tx,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Register an observer for all future batches.
    pub fn subscribe(&self, observer: Arc<dyn WatchObserver>) -> Subscription {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, observer));
        Subscription {
            id,
            observers: Arc::clone(&self.observers),
        }
    }

    /// Enumerate the mount table and watch every eligible mount: kernel
    /// pseudo-filesystems are skipped, and per-mount setup failures are
    /// logged without aborting the rest.
    ///
    /// # Errors
    ///
    /// Fails only when the mount table itself cannot be read.
    pub async fn initialize(&self) -> Result<()> {
        let resolver = Arc::clone(&self.resolver);
        let mounts = tokio::task::spawn_blocking(move || resolver.mounts())
            .await
            .map_err(|join_error| EngineError::Internal(join_error.to_string()))??;
        for entry in mounts {
            if entry.category == FsCategory::Virtual {
                continue;
            }
            if let Err(error) = self
                .install_watch(entry.mount_point.clone(), entry.category)
                .await
            {
                warn!(
                    mount = %entry.mount_point.display(),
                    %error,
                    "skipping mount; watch setup failed"
                );
                let subscribers: Vec<_> = self
                    .observers
                    .lock()
                    .iter()
                    .map(|(_, observer)| Arc::clone(observer))
                    .collect();
                for observer in subscribers {
                    observer.on_error(&entry.mount_point, &error);
                }
            }
        }
        Ok(())
    }

    /// Begin watching `root` recursively, returning the mount category that
    /// decided the backend. Watching an already-watched root is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WatchSetup`] when the root does not exist or
    /// the native watcher cannot be installed.
    pub async fn watch(&self, root: impl Into<PathBuf>) -> Result<FsCategory> {
        let root = root.into();
        if let Some(existing) = self.watches.lock().get(&root) {
            return Ok(existing.category);
        }

        let resolver = Arc::clone(&self.resolver);
        let mounts = tokio::task::spawn_blocking(move || resolver.mounts())
            .await
            .map_err(|join_error| EngineError::Internal(join_error.to_string()))??;
        let category = category_for_path(&mounts, &root);
        self.install_watch(root, category).await
    }

    async fn install_watch(&self, root: PathBuf, category: FsCategory) -> Result<FsCategory> {
        if let Some(existing) = self.watches.lock().get(&root) {
            return Ok(existing.category);
        }
        if !root.is_dir() {
            return Err(EngineError::WatchSetup {
                path: root,
                message: "watch root is not an accessible directory".into(),
            });
        }

        let backend = if category.supports_reliable_watch() {
            WatchBackend::Native(self.build_native_watcher(root.clone()).await?)
        } else {
            WatchBackend::Polled(self.spawn_polling_task(root.clone()).await?)
        };
        // A concurrent watch on the same root may have registered while the
        // backend was being built; the loser's backend is torn down.
        match self.watches.lock().entry(root) {
            Entry::Occupied(existing) => {
                stop_backend(backend);
                Ok(existing.get().category)
            }
            Entry::Vacant(slot) => {
                debug!(root = %slot.key().display(), ?category, "watch registered");
                slot.insert(MountWatch { category, backend });
                Ok(category)
            }
        }
    }

    /// Stop watching `root`. Unknown roots are ignored.
    pub fn unwatch(&self, root: &std::path::Path) {
        if let Some(watch) = self.watches.lock().remove(root) {
            stop_backend(watch.backend);
            debug!(root = %root.display(), "watch removed");
        }
    }

    /// Stop all watches, polling tasks, and the event pump. Idempotent.
    pub fn close(&self) {
        let drained: Vec<_> = self.watches.lock().drain().collect();
        for (_, watch) in drained {
            stop_backend(watch.backend);
        }
        self.observers.lock().clear();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    /// Currently watched roots.
    pub fn roots(&self) -> Vec<PathBuf> {
        self.watches.lock().keys().cloned().collect()
    }

    async fn build_native_watcher(&self, root: PathBuf) -> Result<RecommendedWatcher> {
        let tx = self.event_tx.clone();
        let config = self.config.clone();
        let filter_root = root.clone();
        let setup_root = root.clone();

        // Watcher construction registers kernel resources; keep it off the
        // async workers.
        tokio::task::spawn_blocking(move || -> Result<RecommendedWatcher> {
            let mut watcher =
                notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                    match result {
                        Ok(event) => {
                            for (kind, path) in convert_event(&event) {
                                if config.is_ignored_within(&filter_root, &path) {
                                    continue;
                                }
                                // Send fails only after close; nothing to do.
                                let _ = tx.send(WatchEvent::now(kind, path));
                            }
                        }
                        Err(error) => warn!(%error, "native watcher reported an error"),
                    }
                })
                .map_err(|error| EngineError::WatchSetup {
                    path: setup_root.clone(),
                    message: error.to_string(),
                })?;
            watcher
                .watch(&setup_root, RecursiveMode::Recursive)
                .map_err(|error| EngineError::WatchSetup {
                    path: setup_root.clone(),
                    message: error.to_string(),
                })?;
            Ok(watcher)
        })
        .await
        .map_err(|join_error| EngineError::Internal(join_error.to_string()))?
    }

    /// Take the baseline snapshot before registration completes, so every
    /// change after `watch` returns is reported.
    async fn spawn_polling_task(&self, root: PathBuf) -> Result<JoinHandle<()>> {
        let tx = self.event_tx.clone();
        let config = self.config.clone();
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        let baseline = {
            let root = root.clone();
            let config = config.clone();
            tokio::task::spawn_blocking(move || collect_snapshot(&root, &config))
                .await
                .map_err(|join_error| EngineError::Internal(join_error.to_string()))?
        };

        Ok(tokio::spawn(async move {
            let mut previous = baseline;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let walk_root = root.clone();
                let walk_config = config.clone();
                let current = match tokio::task::spawn_blocking(move || {
                    collect_snapshot(&walk_root, &walk_config)
                })
                .await
                {
                    Ok(snapshot) => snapshot,
                    Err(_) => return,
                };
                for event in diff_snapshots(&previous, &current) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                previous = current;
            }
        }))
    }

    #[cfg(test)]
    fn native_count(&self) -> usize {
        self.watches
            .lock()
            .values()
            .filter(|watch| matches!(watch.backend, WatchBackend::Native(_)))
            .count()
    }

    #[cfg(test)]
    fn polling_count(&self) -> usize {
        self.watches
            .lock()
            .values()
            .filter(|watch| matches!(watch.backend, WatchBackend::Polled(_)))
            .count()
    }
}

impl Drop for HybridWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn stop_backend(backend: WatchBackend) {
    match backend {
        // Dropping the native watcher tears down its kernel registrations.
        WatchBackend::Native(_watcher) => {}
        WatchBackend::Polled(handle) => handle.abort(),
    }
}

/// Map a backend event to canonical kinds. Renames become a removal of the
/// old path and a creation of the new one; pure access events are dropped.
fn convert_event(event: &notify::Event) -> Vec<(WatchEventKind, PathBuf)> {
    use notify::EventKind;
    use notify::event::{ModifyKind, RenameMode};

    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|path| (WatchEventKind::Created, path.clone()))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|path| (WatchEventKind::Removed, path.clone()))
            .collect(),
        EventKind::Access(_) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
            (WatchEventKind::Removed, event.paths[0].clone()),
            (WatchEventKind::Created, event.paths[1].clone()),
        ],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|path| (WatchEventKind::Removed, path.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|path| (WatchEventKind::Created, path.clone()))
            .collect(),
        _ => event
            .paths
            .iter()
            .map(|path| (WatchEventKind::Modified, path.clone()))
            .collect(),
    }
}

/// Collects raw events into debounced batches and fans them out.
///
/// A batch opens on the first event, absorbs further events until the window
/// stays quiet or the batch cap is hit, then flushes.
async fn run_event_pump(
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    observers: SharedObservers,
    debounce_window_ms: u64,
    max_batch_events: usize,
) {
    let window = Duration::from_millis(debounce_window_ms);
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < max_batch_events {
            match tokio::time::timeout(window, rx.recv()).await {
                Ok(Some(event)) => batch.push(event),
                Ok(None) => {
                    flush_batch(&observers, batch);
                    return;
                }
                Err(_) => break,
            }
        }
        flush_batch(&observers, batch);
    }
}

fn flush_batch(observers: &SharedObservers, mut batch: Vec<WatchEvent>) {
    // Bursts often repeat the same change (editors write-then-sync); keep
    // the first of each consecutive repeat.
    batch.dedup_by(|a, b| a.kind == b.kind && a.path == b.path);
    debug!(events = batch.len(), "flushing watch batch");
    let subscribers: Vec<_> = observers
        .lock()
        .iter()
        .map(|(_, observer)| Arc::clone(observer))
        .collect();
    for observer in subscribers {
        observer.on_events(&batch);
    }
}
