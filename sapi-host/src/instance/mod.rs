//! Engine instance: one loaded module, serialized execution and lifecycle
//!
//! # Lifecycle
//!
//! ```text
//!   Uninitialized ──initialize──▶ Ready ──engine fault──▶ Crashed
//!         │                        │  ▲                      │
//!         │                        │  └──hot_swap            │
//!         └────────────exit────────┴─────────────────────────┴──▶ Exited
//! ```
//!
//! Every public operation checks the state first. A crashed instance fails
//! every operation with the same [`RuntimeError::Crashed`] until it is
//! exited and replaced.
//!
//! # Example
//!
//! ```rust,ignore
//! let instance = EngineInstance::new(InstanceConfig::default());
//! instance.initialize_from(&loader, &module_id).await?;
//! instance.write_file("/var/www/index.code", "echo 'hi';").await?;
//!
//! let response = instance
//!     .execute(Request::with_script("/var/www/index.code"))
//!     .await?;
//! assert_eq!(response.status, 200);
//! ```

mod context;
mod hot_swap;

use crate::error::{
    ConfigurationError, CrashReport, EngineError, FailureSource, FsError, RuntimeError,
};
use crate::events::{
    EngineEvent, EventBus, EventKind, EventListener, HostCallbacks, ListenerId, MessageListener,
    SpawnHandler,
};
use crate::module::{BodyBuffer, EngineModule, ModuleLoader};
use crate::semaphore::Semaphore;
use crate::vfs::{ListFilesOptions, MemFs, MountHandler, RmDirOptions, Unmount};
use context::{build_context, RequestMode};
use sapi_api::abi::paths;
use sapi_api::{ExecutionContext, HeadersRecord, ModuleId, Request, RequestBody, Response};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique instance identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-instance settings written into the engine's shared config
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Server interface name handed to the engine's startup hook
    pub sapi_name: String,

    pub document_root: String,

    /// Engine memory limit, in the engine's own notation
    pub memory_limit: String,

    pub display_errors: bool,

    /// Bootstrap source the engine runs before every script
    pub auto_prepend: String,

    /// Fallback `SERVER_NAME` when the request has no `Host` header
    pub server_name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            sapi_name: "cli".to_string(),
            document_root: "/".to_string(),
            memory_limit: "256M".to_string(),
            display_errors: true,
            auto_prepend: String::new(),
            server_name: "localhost".to_string(),
        }
    }
}

impl InstanceConfig {
    /// Render the `engine.ini` baseline
    pub fn render_ini(&self) -> String {
        format!(
            "memory_limit = {}\n\
             display_errors = {}\n\
             document_root = {}\n\
             auto_prepend_file = {}\n",
            self.memory_limit,
            if self.display_errors { "On" } else { "Off" },
            self.document_root,
            paths::AUTO_PREPEND,
        )
    }
}

enum InstanceState {
    Uninitialized,
    Ready {
        module: Box<dyn EngineModule>,
        /// Whether the one-time startup hook has run
        sapi_ready: bool,
    },
    Crashed(CrashReport),
    Exited,
}

impl InstanceState {
    /// Error every operation returns in a non-ready state
    fn unavailable(&self) -> Option<RuntimeError> {
        match self {
            Self::Ready { .. } => None,
            Self::Uninitialized => Some(RuntimeError::NotInitialized),
            Self::Crashed(report) => Some(RuntimeError::Crashed(report.clone())),
            Self::Exited => Some(RuntimeError::Exited),
        }
    }
}

struct MountRecord {
    path: String,
    handler: Arc<dyn MountHandler>,
    /// Set while applied to the current module's filesystem
    unmount: Option<Unmount>,
}

struct InstanceCore {
    state: InstanceState,
    mounts: Vec<MountRecord>,
    sapi_name: String,
}

/// Wrapper owning exactly one engine module and its filesystem
pub struct EngineInstance {
    id: InstanceId,
    config: InstanceConfig,
    semaphore: Semaphore,
    core: Mutex<InstanceCore>,
    events: EventBus,
    callbacks: HostCallbacks,
}

/// Emits `RequestEnded` however an execution leaves scope
struct RequestScope<'a> {
    instance: &'a EngineInstance,
}

impl Drop for RequestScope<'_> {
    fn drop(&mut self) {
        self.instance.events.dispatch(&EngineEvent::RequestEnded {
            instance: self.instance.id,
        });
    }
}

impl EngineInstance {
    pub fn new(config: InstanceConfig) -> Self {
        let sapi_name = config.sapi_name.clone();
        Self {
            id: InstanceId::next(),
            config,
            semaphore: Semaphore::execution(),
            core: Mutex::new(InstanceCore {
                state: InstanceState::Uninitialized,
                mounts: Vec::new(),
                sapi_name,
            }),
            events: EventBus::new(),
            callbacks: HostCallbacks::new(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Install a loaded module
    ///
    /// Baseline config files are written only where absent.
    pub async fn initialize(&self, mut module: Box<dyn EngineModule>) -> Result<(), RuntimeError> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        match &core.state {
            InstanceState::Uninitialized => {}
            InstanceState::Ready { .. } => return Err(RuntimeError::AlreadyInitialized),
            other => return Err(other.unavailable().unwrap_or(RuntimeError::Exited)),
        }

        module.set_callbacks(self.callbacks.clone());
        write_baseline(module.fs_mut(), &self.config)?;
        apply_mounts(self.id, module.as_mut(), &mut core.mounts);

        tracing::info!(instance = %self.id, module = %module.id(), "Engine instance initialized");
        core.state = InstanceState::Ready {
            module,
            sapi_ready: false,
        };
        drop(guard);

        self.events
            .dispatch(&EngineEvent::RuntimeInitialized { instance: self.id });
        Ok(())
    }

    /// Load `id` through `loader` and install it
    pub async fn initialize_from(
        &self,
        loader: &dyn ModuleLoader,
        id: &ModuleId,
    ) -> Result<(), RuntimeError> {
        {
            let core = self.core.lock().await;
            match &core.state {
                InstanceState::Uninitialized => {}
                InstanceState::Ready { .. } => return Err(RuntimeError::AlreadyInitialized),
                other => return Err(other.unavailable().unwrap_or(RuntimeError::Exited)),
            }
        }
        let module = loader.load(id).await?;
        self.initialize(module).await
    }

    /// Change the server interface name; only before the first request
    pub async fn set_sapi_name(&self, name: impl Into<String>) -> Result<(), RuntimeError> {
        let mut core = self.core.lock().await;
        match &core.state {
            InstanceState::Ready {
                sapi_ready: true, ..
            } => return Err(RuntimeError::AlreadyInitialized),
            InstanceState::Crashed(report) => return Err(RuntimeError::Crashed(report.clone())),
            InstanceState::Exited => return Err(RuntimeError::Exited),
            _ => {}
        }
        core.sapi_name = name.into();
        Ok(())
    }

    pub fn add_event_listener(&self, kind: EventKind, listener: EventListener) -> ListenerId {
        self.events.add(kind, listener)
    }

    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.events.remove(kind, id)
    }

    /// Receive out-of-band messages pushed by the running program
    pub fn on_message(&self, listener: MessageListener) {
        self.callbacks.on_message(listener);
    }

    /// Intercept the program's subprocess spawns; `None` disables spawning
    pub fn set_spawn_handler(&self, handler: Option<Arc<dyn SpawnHandler>>) {
        self.callbacks.set_spawn_handler(handler);
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(self.core.lock().await.state, InstanceState::Ready { .. })
    }

    pub async fn is_crashed(&self) -> bool {
        matches!(self.core.lock().await.state, InstanceState::Crashed(_))
    }

    pub async fn crash_report(&self) -> Option<CrashReport> {
        match &self.core.lock().await.state {
            InstanceState::Crashed(report) => Some(report.clone()),
            _ => None,
        }
    }

    /// Run one request
    ///
    /// Executions on the same instance are serialized in arrival order.
    /// `RequestStarted` and `RequestEnded` bracket every call that got a
    /// turn, whatever its outcome.
    pub async fn execute(&self, request: Request) -> Result<Response, RuntimeError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| RuntimeError::Exited)?;
        let _scope = RequestScope { instance: self };
        self.events.dispatch(&EngineEvent::RequestStarted {
            instance: self.id,
            uri: &request.relative_uri,
        });

        let started = Instant::now();
        let mut guard = self.core.lock().await;
        let was_ready = matches!(guard.state, InstanceState::Ready { .. });
        let result = self.execute_locked(&mut guard, &request).await;
        drop(guard);

        match &result {
            Ok(response) => {
                tracing::debug!(
                    instance = %self.id,
                    uri = %request.relative_uri,
                    status = response.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request completed"
                );
            }
            Err(error) => {
                let source = match error {
                    RuntimeError::ExecutionFailure { origin, .. } => Some(*origin),
                    RuntimeError::Crashed(_) if was_ready => Some(FailureSource::Engine),
                    _ => None,
                };
                if let Some(source) = source {
                    tracing::debug!(
                        instance = %self.id,
                        uri = %request.relative_uri,
                        source = %source,
                        error = %error,
                        "Request failed"
                    );
                    self.events.dispatch(&EngineEvent::RequestError {
                        instance: self.id,
                        error,
                        source,
                    });
                }
            }
        }
        result
    }

    async fn execute_locked(
        &self,
        core: &mut InstanceCore,
        request: &Request,
    ) -> Result<Response, RuntimeError> {
        if let Some(error) = core.state.unavailable() {
            return Err(error);
        }
        let mode = RequestMode::from_request(request)?;

        let InstanceState::Ready { module, sapi_ready } = &mut core.state else {
            return Err(RuntimeError::NotInitialized);
        };

        let script_path = match mode {
            RequestMode::Script(path) => {
                if !module.fs().is_file(path) {
                    return Err(ConfigurationError::MissingScript(path.to_string()).into());
                }
                path
            }
            RequestMode::Code(_) => paths::EVAL_CODE,
        };

        prepare_streams(module.fs_mut())?;
        if let RequestMode::Code(code) = mode {
            module.fs_mut().write_file(paths::EVAL_CODE, code)?;
        }
        let context = build_context(request, &self.config, script_path);

        let outcome = run_engine(
            self.id,
            module.as_mut(),
            sapi_ready,
            &core.sapi_name,
            request.body.as_ref(),
            &context,
        )
        .await;

        let exit_code = match outcome {
            Ok(exit_code) => exit_code,
            Err(fault) => return Err(self.crash(&mut core.state, fault, &request.relative_uri)),
        };

        let response = collect_response(module.fs(), exit_code);
        if exit_code != 0 {
            return Err(RuntimeError::ExecutionFailure {
                response: Box::new(response),
                origin: FailureSource::from_exit_code(exit_code),
            });
        }
        Ok(response)
    }

    /// Move into the permanent crashed state
    fn crash(&self, state: &mut InstanceState, fault: EngineError, uri: &str) -> RuntimeError {
        let module = match state {
            InstanceState::Ready { module, .. } => {
                if let Err(e) = module.destroy() {
                    tracing::debug!(instance = %self.id, error = %e, "Destroy after fault failed");
                }
                Some(module.id().clone())
            }
            _ => None,
        };
        let report = CrashReport {
            reason: fault.to_string(),
            module,
            uri: Some(uri.to_string()),
        };
        tracing::error!(
            instance = %self.id,
            uri = %uri,
            error = %fault,
            "Engine crashed; instance is no longer usable"
        );
        *state = InstanceState::Crashed(report.clone());
        RuntimeError::Crashed(report)
    }

    /// Tear down the module and refuse all further work
    ///
    /// Waits for an in-flight execution to finish. Calling it again is a
    /// no-op.
    pub async fn exit(&self) -> Result<(), RuntimeError> {
        let _permit = self.semaphore.acquire().await.ok();
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if let InstanceState::Exited = core.state {
            return Ok(());
        }

        self.events
            .dispatch(&EngineEvent::BeforeDestroy { instance: self.id });

        if let InstanceState::Ready { module, .. } = &mut core.state {
            for record in core.mounts.iter_mut() {
                if let Some(unmount) = record.unmount.take() {
                    unmount(module.fs_mut());
                }
            }
            if let Err(e) = module.destroy() {
                tracing::warn!(instance = %self.id, error = %e, "Engine teardown failed");
            }
        }
        core.mounts.clear();
        core.state = InstanceState::Exited;
        self.semaphore.close();
        drop(guard);

        self.events
            .dispatch(&EngineEvent::RequestEnded { instance: self.id });
        tracing::info!(instance = %self.id, "Engine instance exited");
        Ok(())
    }

    /// Attach `handler` at `path`
    ///
    /// Before initialization the mount is recorded and applied once a module
    /// is installed; it is re-applied after every hot swap.
    pub async fn mount(
        &self,
        path: impl Into<String>,
        handler: Arc<dyn MountHandler>,
    ) -> Result<(), RuntimeError> {
        let path = path.into();
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let unmount = match &mut core.state {
            InstanceState::Uninitialized => None,
            InstanceState::Ready { module, .. } => {
                Some(handler.mount(self.id, module.fs_mut(), &path)?)
            }
            other => return Err(other.unavailable().unwrap_or(RuntimeError::Exited)),
        };
        core.mounts.push(MountRecord {
            path,
            handler,
            unmount,
        });
        Ok(())
    }

    /// Release the mount at `path`; returns whether one was registered
    pub async fn unmount(&self, path: &str) -> Result<bool, RuntimeError> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if let Some(error) = core.state.unavailable() {
            if !matches!(core.state, InstanceState::Uninitialized) {
                return Err(error);
            }
        }
        let Some(index) = core.mounts.iter().position(|record| record.path == path) else {
            return Ok(false);
        };
        let record = core.mounts.remove(index);
        if let (Some(unmount), InstanceState::Ready { module, .. }) =
            (record.unmount, &mut core.state)
        {
            unmount(module.fs_mut());
        }
        Ok(true)
    }

    async fn with_fs<T>(
        &self,
        f: impl FnOnce(&mut MemFs) -> Result<T, FsError>,
    ) -> Result<T, RuntimeError> {
        let mut core = self.core.lock().await;
        match &mut core.state {
            InstanceState::Ready { module, .. } => Ok(f(module.fs_mut())?),
            other => Err(other.unavailable().unwrap_or(RuntimeError::NotInitialized)),
        }
    }

    /// Create a directory and any missing parents
    pub async fn mkdir(&self, path: &str) -> Result<(), RuntimeError> {
        self.with_fs(|fs| fs.mkdir(path)).await
    }

    pub async fn write_file(
        &self,
        path: &str,
        data: impl AsRef<[u8]>,
    ) -> Result<(), RuntimeError> {
        self.with_fs(|fs| fs.write_file(path, data)).await
    }

    pub async fn read_file_as_text(&self, path: &str) -> Result<String, RuntimeError> {
        self.with_fs(|fs| fs.read_file_as_text(path)).await
    }

    pub async fn read_file_as_buffer(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        self.with_fs(|fs| fs.read_file(path)).await
    }

    pub async fn unlink(&self, path: &str) -> Result<(), RuntimeError> {
        self.with_fs(|fs| fs.unlink(path)).await
    }

    /// Move a file or directory
    pub async fn mv(&self, from: &str, to: &str) -> Result<(), RuntimeError> {
        self.with_fs(|fs| fs.rename(from, to)).await
    }

    pub async fn rmdir(&self, path: &str, options: RmDirOptions) -> Result<(), RuntimeError> {
        self.with_fs(|fs| fs.rmdir(path, options)).await
    }

    pub async fn list_files(
        &self,
        path: &str,
        options: ListFilesOptions,
    ) -> Result<Vec<String>, RuntimeError> {
        self.with_fs(|fs| fs.list_files(path, options)).await
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool, RuntimeError> {
        self.with_fs(|fs| Ok(fs.file_exists(path))).await
    }

    pub async fn is_dir(&self, path: &str) -> Result<bool, RuntimeError> {
        self.with_fs(|fs| Ok(fs.is_dir(path))).await
    }

    pub async fn is_file(&self, path: &str) -> Result<bool, RuntimeError> {
        self.with_fs(|fs| Ok(fs.is_file(path))).await
    }

    pub async fn chdir(&self, path: &str) -> Result<(), RuntimeError> {
        self.with_fs(|fs| fs.chdir(path)).await
    }
}

impl fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInstance")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Startup (once), body buffer, request call and buffer release
///
/// Any error here is an engine fault.
async fn run_engine(
    instance: InstanceId,
    module: &mut dyn EngineModule,
    sapi_ready: &mut bool,
    sapi_name: &str,
    body: Option<&RequestBody>,
    context: &ExecutionContext,
) -> Result<i32, EngineError> {
    if !*sapi_ready {
        module.startup(sapi_name).await?;
        *sapi_ready = true;
        tracing::debug!(instance = %instance, sapi = %sapi_name, "Server interface started");
    }

    let buffer = match body {
        Some(body) => Some(write_body(instance, module, body).await?),
        None => None,
    };

    let result = module.handle_request(context, buffer).await;

    if let Some(buffer) = buffer {
        let released = module.dealloc(buffer).await;
        if let (Ok(_), Err(e)) = (&result, released) {
            return Err(e);
        }
    }
    result
}

async fn write_body(
    instance: InstanceId,
    module: &mut dyn EngineModule,
    body: &RequestBody,
) -> Result<BodyBuffer, EngineError> {
    if let RequestBody::Text(_) = body {
        tracing::warn!(
            instance = %instance,
            "Text request bodies are deprecated; send raw bytes instead"
        );
    }
    let bytes = body.to_engine_bytes();
    let len = u32::try_from(bytes.len()).map_err(|_| {
        EngineError::MemoryAccess(format!("Request body too large: {} bytes", bytes.len()))
    })?;
    let buffer = module.alloc(len).await?;
    if let Err(e) = module.write_memory(buffer, &bytes) {
        let _ = module.dealloc(buffer).await;
        return Err(e);
    }
    Ok(buffer)
}

/// Shared config the engine reads at startup, written only where absent
fn write_baseline(fs: &mut MemFs, config: &InstanceConfig) -> Result<(), FsError> {
    fs.mkdir(paths::SHARED_DIR)?;
    if !fs.file_exists(paths::CONFIG) {
        fs.write_file(paths::CONFIG, config.render_ini())?;
    }
    if !fs.file_exists(paths::AUTO_PREPEND) {
        fs.write_file(paths::AUTO_PREPEND, &config.auto_prepend)?;
    }
    fs.mkdir(&config.document_root)?;
    Ok(())
}

/// Empty the output streams and drop the previous headers record
fn prepare_streams(fs: &mut MemFs) -> Result<(), FsError> {
    fs.write_file(paths::STDOUT, b"")?;
    fs.write_file(paths::STDERR, b"")?;
    if fs.file_exists(paths::HEADERS) {
        fs.unlink(paths::HEADERS)?;
    }
    Ok(())
}

fn collect_response(fs: &MemFs, exit_code: i32) -> Response {
    let record = match fs.read_file(paths::HEADERS) {
        Ok(bytes) => match HeadersRecord::from_json(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed headers record");
                None
            }
        },
        Err(_) => None,
    };
    let body = fs.read_file(paths::STDOUT).unwrap_or_default();
    let errors = fs.read_file_as_text(paths::STDERR).unwrap_or_default();
    Response::from_parts(record, body, errors, exit_code)
}

fn apply_mounts(instance: InstanceId, module: &mut dyn EngineModule, mounts: &mut [MountRecord]) {
    for record in mounts {
        match record.handler.mount(instance, module.fs_mut(), &record.path) {
            Ok(unmount) => record.unmount = Some(unmount),
            Err(e) => {
                tracing::warn!(instance = %instance, path = %record.path, error = %e, "Mount failed")
            }
        }
    }
}
