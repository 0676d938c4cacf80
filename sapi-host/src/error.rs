//! Error types for the runtime layer
//!
//! Every failure mode is a distinct variant so callers can match on it;
//! nothing in this crate retries on its own.

use sapi_api::{ModuleId, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Where a failed execution originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    /// The executed program exited non-zero
    Program,
    /// The engine itself failed
    Engine,
}

impl FailureSource {
    /// Classify a non-zero exit code
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code < 0 {
            Self::Engine
        } else {
            Self::Program
        }
    }
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Program => f.write_str("program"),
            Self::Engine => f.write_str("engine"),
        }
    }
}

/// Virtual filesystem errors
#[derive(Debug, Error)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Cannot move '{from}' to '{to}' across mounts")]
    CrossMount { from: String, to: String },

    #[error("Host filesystem error at '{path}': {source}")]
    Host {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Request rejected before any engine state was touched
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Request sets both inline code and a script path; exactly one is allowed")]
    ConflictingModes,

    #[error("Request sets neither inline code nor a script path")]
    NoExecutionMode,

    #[error("Script not found in the virtual filesystem: {0}")]
    MissingScript(String),
}

/// Faults raised while loading or calling into an engine module
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Unknown module: {0}")]
    UnknownModule(ModuleId),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("ABI version mismatch: expected {expected}, got {actual}")]
    AbiVersionMismatch { expected: i32, actual: i32 },

    #[error("Engine startup returned {0}")]
    Startup(i32),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    #[error("Module has been destroyed")]
    Destroyed,

    #[error("Failed to read module {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Pool admission failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Requested more concurrent instances than the configured maximum ({max})")]
    MaxInstances { max: usize },

    #[error("Requested spawning a primary instance while another primary is already being spawned")]
    PrimarySpawnInProgress,

    #[error("Process pool has been shut down")]
    Closed,
}

/// Snapshot kept by an instance after an unrecoverable engine fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// Rendered fault
    pub reason: String,
    /// Module that faulted
    pub module: Option<ModuleId>,
    /// URI of the request in flight, if any
    pub uri: Option<String>,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(uri) = &self.uri {
            write!(f, " (while handling {})", uri)?;
        }
        Ok(())
    }
}

/// Errors surfaced by instances and the pool
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Execution failed with exit code {} ({origin})", .response.exit_code)]
    ExecutionFailure {
        response: Box<Response>,
        origin: FailureSource,
    },

    #[error("Runtime has crashed: {0}")]
    Crashed(CrashReport),

    #[error("Runtime is not initialized")]
    NotInitialized,

    #[error("Runtime is already initialized")]
    AlreadyInitialized,

    #[error("Runtime has exited")]
    Exited,

    #[error(transparent)]
    Filesystem(#[from] FsError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl RuntimeError {
    /// Partial response carried by an execution failure
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::ExecutionFailure { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crashed(_))
    }
}
