//! sapi-api: Shared types for the sapi engine runtime
//!
//! This crate defines the data-plane contract between callers, the host
//! runtime and guest engine modules. Everything that crosses wasm linear
//! memory is MessagePack encoded; the response headers record is JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

mod http;

pub use http::{HeadersRecord, Request, RequestBody, Response};

/// Engine ABI version for compatibility checking
pub const ABI_VERSION: i32 = 1;

/// Exit code an engine returns when it fails on its own, as opposed to the
/// executed program exiting non-zero. Any negative code counts as such.
pub const ENGINE_FAILURE_EXIT_CODE: i32 = -1;

/// Names and fixed locations that make up the engine module ABI
pub mod abi {
    /// Import module name for host functions
    pub const IMPORT_MODULE: &str = "sapi";

    pub const EXPORT_MEMORY: &str = "memory";
    pub const EXPORT_ABI_VERSION: &str = "sapi_abi_version";
    pub const EXPORT_ALLOC: &str = "sapi_alloc";
    pub const EXPORT_DEALLOC: &str = "sapi_dealloc";
    pub const EXPORT_STARTUP: &str = "sapi_startup";
    pub const EXPORT_HANDLE_REQUEST: &str = "sapi_handle_request";

    pub const IMPORT_FS_SIZE: &str = "fs_size";
    pub const IMPORT_FS_READ: &str = "fs_read";
    pub const IMPORT_FS_WRITE: &str = "fs_write";
    pub const IMPORT_POST_MESSAGE: &str = "post_message";
    pub const IMPORT_SPAWN: &str = "spawn";
    pub const IMPORT_TAKE_REPLY: &str = "take_reply";

    /// Fixed paths inside the engine's virtual filesystem
    pub mod paths {
        pub const INTERNAL_DIR: &str = "/internal";
        pub const SHARED_DIR: &str = "/internal/shared";
        pub const HEADERS: &str = "/internal/headers.json";
        pub const STDOUT: &str = "/internal/stdout";
        pub const STDERR: &str = "/internal/stderr";
        pub const EVAL_CODE: &str = "/internal/eval.code";
        pub const CONFIG: &str = "/internal/shared/engine.ini";
        pub const AUTO_PREPEND: &str = "/internal/shared/auto_prepend.code";
    }
}

/// Pack a pointer and length into a single i64 value
#[inline]
pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
    ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
}

/// Unpack ptr and len from a packed i64
#[inline]
pub fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

/// Identifier of a loadable engine module
///
/// Modules registered from bytes are identified by the blake3 hash of
/// their contents, so registering identical bytes twice yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    /// Create a named module id
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derive the id from module bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Hash ids are long; the prefix is enough to tell them apart in logs
        if self.0.len() == 64 && self.0.bytes().all(|b| b.is_ascii_hexdigit()) {
            write!(f, "{}", &self.0[..12])
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Normalized per-request execution context handed to the engine
///
/// Built by the host from a [`Request`]; header names are lower-cased and
/// the server mapping already contains synthesized defaults merged with
/// caller overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub method: String,
    /// Full request URI including the query string
    pub request_uri: String,
    pub query_string: Option<String>,
    pub protocol: String,
    pub port: u16,
    pub headers: BTreeMap<String, String>,
    pub cookie: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<usize>,
    pub server: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    /// Path of the script inside the virtual filesystem
    pub script_path: String,
}

impl ExecutionContext {
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Subprocess spawn attempt made by a running program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Result of a host-emulated subprocess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: Vec<u8>,
    #[serde(default)]
    pub stderr: Vec<u8>,
}

impl SpawnOutput {
    /// Exit code reported when the host has no spawn handler
    pub const UNSUPPORTED_EXIT_CODE: i32 = 127;

    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn unsupported(command: &str) -> Self {
        Self {
            exit_code: Self::UNSUPPORTED_EXIT_CODE,
            stdout: Vec::new(),
            stderr: format!("{}: spawning processes is not supported\n", command).into_bytes(),
        }
    }
}
