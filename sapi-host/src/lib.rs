//! sapi-host: runtime management layer for single-threaded wasm script engines
//!
//! This crate wraps engine modules in isolated instances with an in-memory
//! filesystem, serializes execution per instance, swaps modules in place
//! and bounds how many instances may be live at once.

pub mod error;
pub mod events;
pub mod instance;
pub mod module;
pub mod pool;
pub mod semaphore;
pub mod vfs;
pub mod wasm;
pub mod watcher;

pub use error::{
    AdmissionError, ConfigurationError, CrashReport, EngineError, FailureSource, FsError,
    RuntimeError,
};
pub use events::{
    EngineEvent, EventKind, EventListener, HostCallbacks, ListenerId, MessageListener,
    SpawnHandler,
};
pub use instance::{EngineInstance, InstanceConfig, InstanceId};
pub use module::{BodyBuffer, EngineModule, ModuleLoader};
pub use pool::{
    InstanceFactory, ModuleInstanceFactory, PoolConfig, PoolStats, PooledInstance, ProcessPool,
};
pub use semaphore::{AcquireError, Permit, Semaphore};
pub use vfs::{EntryType, HostDirMount, ListFilesOptions, MemFs, MountHandler, RmDirOptions};
pub use wasm::{WasmLoaderConfig, WasmModuleLoader};
pub use watcher::{ModuleWatcher, WatcherConfig, WatcherError};
pub use sapi_api::{ExecutionContext, ModuleId, Request, RequestBody, Response};
