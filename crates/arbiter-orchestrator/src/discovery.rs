//! Manifest discovery by directory scanning.
//!
//! Walks a base directory for node manifest files and tracks them across
//! scans, reporting three transitions: a file appearing (`Discovered`), its
//! content changing (`Changed`, keyed off mtime), and the file going away
//! (`Lost`). Consumers subscribe with callbacks; the registry uses these to
//! keep its node set in sync with the filesystem.

use crate::config::DiscoveryConfig;
use crate::manifest::NodeManifest;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A transition observed between two scans.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A manifest file appeared and parsed.
    Discovered {
        id: String,
        manifest: Arc<NodeManifest>,
        path: PathBuf,
    },
    /// A tracked manifest file was modified and re-parsed.
    Changed {
        id: String,
        manifest: Arc<NodeManifest>,
        path: PathBuf,
    },
    /// A tracked manifest file disappeared.
    Lost { id: String },
}

type EventCallback = Box<dyn Fn(&DiscoveryEvent) + Send + Sync>;

struct TrackedEntry {
    id: String,
    manifest: Arc<NodeManifest>,
    modified: Option<SystemTime>,
}

/// Scans a directory tree for node manifests.
///
/// One background loop at most; `scan_once()` and the loop's own passes are
/// mutually exclusive, so two walks never interleave.
pub struct DiscoveryScanner {
    base_dir: PathBuf,
    patterns: Vec<String>,
    interval: Duration,
    tracked: std::sync::Mutex<HashMap<PathBuf, TrackedEntry>>,
    callbacks: std::sync::Mutex<Vec<EventCallback>>,
    scan_lock: tokio::sync::Mutex<()>,
    scanning_active: AtomicBool,
    scan_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiscoveryScanner {
    /// Create a scanner over the given base directory with the default
    /// patterns and interval.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            patterns: DiscoveryConfig::MANIFEST_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            interval: DiscoveryConfig::SCAN_INTERVAL,
            tracked: std::sync::Mutex::new(HashMap::new()),
            callbacks: std::sync::Mutex::new(Vec::new()),
            scan_lock: tokio::sync::Mutex::new(()),
            scanning_active: AtomicBool::new(false),
            scan_task: std::sync::Mutex::new(None),
        }
    }

    /// Override the manifest file-name patterns.
    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }

    /// Override the background scan interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Register a callback fired synchronously for every event, in
    /// registration order. Callbacks must not block for long and must not
    /// re-enter `on_event`.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&DiscoveryEvent) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Run one walk now and fire callbacks for anything that changed.
    ///
    /// Takes the scan lock, so a concurrent background pass finishes first.
    pub async fn scan_once(&self) -> Vec<DiscoveryEvent> {
        let _guard = self.scan_lock.lock().await;
        let events = self.walk();
        self.fire(&events);
        events
    }

    /// Start background scanning on the configured interval.
    pub fn start_scanning(self: &Arc<Self>) {
        if self.scanning_active.swap(true, Ordering::SeqCst) {
            debug!("Discovery scanning already active");
            return;
        }

        let scanner = Arc::clone(self);
        let task = tokio::spawn(async move {
            info!(
                "Starting discovery scanning of {}",
                scanner.base_dir.display()
            );

            while scanner.scanning_active.load(Ordering::SeqCst) {
                tokio::time::sleep(scanner.interval).await;

                if !scanner.scanning_active.load(Ordering::SeqCst) {
                    break;
                }
                scanner.scan_once().await;
            }

            info!("Discovery scanning stopped");
        });
        *self.scan_task.lock().unwrap() = Some(task);
    }

    /// Stop the background loop.
    pub fn stop_scanning(&self) {
        self.scanning_active.store(false, Ordering::SeqCst);
        if let Some(task) = self.scan_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning_active.load(Ordering::SeqCst)
    }

    /// Ids of all currently tracked manifests.
    pub fn tracked_ids(&self) -> Vec<String> {
        let tracked = self.tracked.lock().unwrap();
        let mut ids: Vec<String> = tracked.values().map(|t| t.id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// The tracked manifest for a node id, if any.
    pub fn manifest(&self, id: &str) -> Option<Arc<NodeManifest>> {
        let tracked = self.tracked.lock().unwrap();
        tracked
            .values()
            .find(|t| t.id == id)
            .map(|t| t.manifest.clone())
    }

    /// Number of tracked manifest files.
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// One pass over the tree: diff against the tracked set and produce
    /// events. Callbacks are fired by the caller after the walk, outside
    /// the tracked lock.
    fn walk(&self) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        if self.base_dir.is_dir() {
            for entry in WalkDir::new(&self.base_dir) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Scan skipping unreadable entry: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if !self.patterns.iter().any(|p| p == name.as_ref()) {
                    continue;
                }

                let path = entry.path().to_path_buf();
                let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
                seen.insert(path.clone());

                let prev_modified = {
                    let tracked = self.tracked.lock().unwrap();
                    tracked.get(&path).map(|t| t.modified)
                };

                match prev_modified {
                    None => {
                        let manifest = match NodeManifest::from_file(&path) {
                            Ok(manifest) => manifest,
                            Err(e) => {
                                debug!("Skipping unparseable manifest {}: {}", path.display(), e);
                                continue;
                            }
                        };
                        if manifest.id.is_empty() {
                            warn!("Manifest {} has no id; skipping", path.display());
                            continue;
                        }

                        let manifest = Arc::new(manifest);
                        self.tracked.lock().unwrap().insert(
                            path.clone(),
                            TrackedEntry {
                                id: manifest.id.clone(),
                                manifest: manifest.clone(),
                                modified,
                            },
                        );
                        info!("Discovered node {} at {}", manifest.id, path.display());
                        events.push(DiscoveryEvent::Discovered {
                            id: manifest.id.clone(),
                            manifest,
                            path,
                        });
                    }
                    Some(prev) => {
                        let advanced = matches!((prev, modified), (Some(a), Some(b)) if b > a);
                        if !advanced {
                            continue;
                        }

                        let manifest = match NodeManifest::from_file(&path) {
                            Ok(manifest) => manifest,
                            Err(e) => {
                                // Keep the old entry; a later scan retries.
                                debug!(
                                    "Manifest {} changed but no longer parses: {}",
                                    path.display(),
                                    e
                                );
                                continue;
                            }
                        };
                        if manifest.id.is_empty() {
                            warn!("Manifest {} lost its id; keeping previous", path.display());
                            continue;
                        }

                        let manifest = Arc::new(manifest);
                        self.tracked.lock().unwrap().insert(
                            path.clone(),
                            TrackedEntry {
                                id: manifest.id.clone(),
                                manifest: manifest.clone(),
                                modified,
                            },
                        );
                        info!("Node {} changed at {}", manifest.id, path.display());
                        events.push(DiscoveryEvent::Changed {
                            id: manifest.id.clone(),
                            manifest,
                            path,
                        });
                    }
                }
            }
        } else {
            debug!(
                "Scan base directory {} does not exist",
                self.base_dir.display()
            );
        }

        let lost: Vec<(PathBuf, String)> = {
            let mut tracked = self.tracked.lock().unwrap();
            let gone: Vec<PathBuf> = tracked
                .keys()
                .filter(|path| !seen.contains(*path))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|path| tracked.remove(&path).map(|t| (path, t.id)))
                .collect()
        };
        for (path, id) in lost {
            info!("Lost node {} ({} removed)", id, path.display());
            events.push(DiscoveryEvent::Lost { id });
        }

        events
    }

    fn fire(&self, events: &[DiscoveryEvent]) {
        let callbacks = self.callbacks.lock().unwrap();
        for event in events {
            for callback in callbacks.iter() {
                callback(event);
            }
        }
    }
}
