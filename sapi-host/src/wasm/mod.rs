//! wasmtime-backed engine modules
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      WasmModuleLoader                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  register(bytes)  ── compile once, cache by blake3 ModuleId      │
//! │  load(id)         ── fresh Store + instantiate_async             │
//! │                      └─ check sapi_abi_version                   │
//! │                                                                  │
//! │  WasmEngineModule                                                │
//! │    Store<EngineState { fs: MemFs, callbacks, reply, .. }>        │
//! │    handle_request ── MessagePack context into guest memory       │
//! │                      └─ sapi_handle_request (fuel reset per call)│
//! │                                                                  │
//! │  Host imports ("sapi")                                           │
//! │    fs_size / fs_read / fs_write  ── MemFs of the calling store   │
//! │    post_message / spawn          ── HostCallbacks, reply staged  │
//! │    take_reply                    ── copy staged reply out        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! With the `wasi` feature, WASI preview1 is linked as well and anything a
//! module writes to its stdio is appended to the internal stream files.

mod host;
mod loader;
mod module;

pub use loader::{WasmLoaderConfig, WasmModuleLoader};
pub use module::{EngineState, WasmEngineModule};
