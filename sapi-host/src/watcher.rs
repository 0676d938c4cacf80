//! Hot reload of an engine module file
//!
//! Watches one module file and, whenever it changes, registers the new
//! bytes and hot-swaps every attached instance to them.

use crate::error::EngineError;
use crate::instance::EngineInstance;
use crate::wasm::WasmModuleLoader;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use sapi_api::ModuleId;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for the module watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,
    /// Subtree carried over into the swapped-in filesystem
    pub preserve_path: Option<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            preserve_path: None,
        }
    }
}

/// Instances that follow the watched module
#[derive(Default)]
struct Subscribers {
    instances: Mutex<Vec<Weak<EngineInstance>>>,
    current: Mutex<Option<ModuleId>>,
}

impl Subscribers {
    fn live(&self) -> Vec<Arc<EngineInstance>> {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances.retain(|weak| weak.strong_count() > 0);
        instances.iter().filter_map(Weak::upgrade).collect()
    }

    fn set_current(&self, id: ModuleId) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }
}

/// Hot reload watcher for an engine module file
pub struct ModuleWatcher {
    path: PathBuf,
    subscribers: Arc<Subscribers>,
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

impl ModuleWatcher {
    /// Register the module at `path` and start watching it
    pub async fn new(
        loader: Arc<WasmModuleLoader>,
        path: impl AsRef<Path>,
        config: WatcherConfig,
    ) -> Result<Self, WatcherError> {
        let path = path.as_ref().to_path_buf();
        let subscribers = Arc::new(Subscribers::default());
        subscribers.set_current(loader.register_file(&path).await?);

        // Editors replace files rather than write in place; watch the parent
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = event_tx.blocking_send(event);
            }
        })
        .map_err(WatcherError::WatcherInit)?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(WatcherError::WatcherInit)?;
        tracing::info!(path = %path.display(), "Watching engine module");

        let task_path = path.clone();
        let task_subscribers = subscribers.clone();
        let debounce = config.debounce;
        let preserve_path = config.preserve_path;
        tokio::spawn(async move {
            let mut deadline: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Module watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        if event.paths.iter().any(|p| same_file(p, &task_path)) {
                            deadline = Some(tokio::time::Instant::now() + debounce);
                        }
                    }

                    _ = async {
                        match deadline {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        deadline = None;
                        Self::reload(
                            &loader,
                            &task_path,
                            &task_subscribers,
                            preserve_path.as_deref(),
                        )
                        .await;
                    }
                }
            }
        });

        Ok(Self {
            path,
            subscribers,
            _watcher: watcher,
            shutdown_tx,
        })
    }

    /// Hot-swap `instance` on every future change
    ///
    /// Only a weak reference is kept; dropped instances fall off.
    pub fn attach(&self, instance: &Arc<EngineInstance>) {
        self.subscribers
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(instance));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id of the most recently registered module bytes
    pub fn current_module(&self) -> Option<ModuleId> {
        self.subscribers
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop watching
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn reload(
        loader: &WasmModuleLoader,
        path: &Path,
        subscribers: &Subscribers,
        preserve_path: Option<&str>,
    ) {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Engine module removed; keeping current module");
            return;
        }
        let id = match loader.register_file(path).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to register changed module");
                return;
            }
        };
        subscribers.set_current(id.clone());

        for instance in subscribers.live() {
            match instance.hot_swap_from(loader, &id, preserve_path).await {
                Ok(()) => {
                    tracing::info!(instance = %instance.id(), module = %id, "Engine module reloaded");
                }
                Err(e) => {
                    tracing::warn!(instance = %instance.id(), error = %e, "Hot swap failed");
                }
            }
        }
    }
}

fn same_file(candidate: &Path, watched: &Path) -> bool {
    if candidate == watched {
        return true;
    }
    // notify reports canonical paths on some platforms
    match (candidate.canonicalize(), watched.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => candidate.file_name().is_some() && candidate.file_name() == watched.file_name(),
    }
}

/// Errors that can occur during watching
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}
