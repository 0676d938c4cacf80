//! sapi-guest: SDK for writing engine modules
//!
//! An engine module is a wasm binary the sapi host loads and drives through
//! a small ABI. This crate generates the exports and wraps the host imports.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sapi_guest::prelude::*;
//!
//! struct EchoEngine;
//!
//! impl Engine for EchoEngine {
//!     fn handle_request(ctx: ExecutionContext, body: &[u8]) -> i32 {
//!         host::set_response(200, &["Content-Type: text/plain"]);
//!         host::echo(ctx.request_uri.as_bytes());
//!         host::echo(body);
//!         0
//!     }
//! }
//!
//! export_engine!(EchoEngine);
//! ```

use std::alloc::{alloc, dealloc, Layout};

pub use sapi_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_engine, host, memory, Engine};
    pub use sapi_api::{
        abi, ExecutionContext, SpawnOutput, SpawnRequest, ABI_VERSION, ENGINE_FAILURE_EXIT_CODE,
    };
}

/// Trait that engine modules implement
pub trait Engine {
    /// One-time server interface setup, called before the first request
    fn startup(_sapi_name: &str) -> i32 {
        0
    }

    /// Handle one request and return the exit code
    fn handle_request(ctx: ExecutionContext, body: &[u8]) -> i32;
}

/// Memory utilities for engine modules
pub mod memory {
    use super::*;

    /// Allocate memory in the wasm linear memory
    #[inline]
    pub fn sapi_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        let Ok(layout) = Layout::from_size_align(size as usize, 1) else {
            return 0;
        };
        unsafe { alloc(layout) as i32 }
    }

    /// Deallocate memory in the wasm linear memory
    ///
    /// The ptr must have been allocated by `sapi_alloc` with the same size.
    #[inline]
    pub fn sapi_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        let Ok(layout) = Layout::from_size_align(size as usize, 1) else {
            return;
        };
        unsafe { dealloc(ptr as *mut u8, layout) }
    }

    /// Borrow `len` bytes at `ptr`
    ///
    /// # Safety
    /// The region must be valid for the duration of the current call.
    pub unsafe fn bytes_from_ptr<'a>(ptr: i32, len: i32) -> &'a [u8] {
        if ptr == 0 || len <= 0 {
            return &[];
        }
        std::slice::from_raw_parts(ptr as *const u8, len as usize)
    }

    /// Read a UTF-8 string at `ptr`
    ///
    /// # Safety
    /// Same as [`bytes_from_ptr`].
    pub unsafe fn str_from_ptr(ptr: i32, len: i32) -> Option<String> {
        std::str::from_utf8(bytes_from_ptr(ptr, len))
            .ok()
            .map(str::to_string)
    }

    /// Deserialize MessagePack data at `ptr`
    ///
    /// # Safety
    /// Same as [`bytes_from_ptr`].
    pub unsafe fn deserialize_from_ptr<T: serde::de::DeserializeOwned>(
        ptr: i32,
        len: i32,
    ) -> Option<T> {
        let bytes = bytes_from_ptr(ptr, len);
        if bytes.is_empty() {
            return None;
        }
        rmp_serde::from_slice(bytes).ok()
    }
}

/// Safe wrappers over the host imports
pub mod host {
    use super::sys;
    use sapi_api::abi::paths;
    use sapi_api::{HeadersRecord, SpawnOutput, SpawnRequest};

    /// Read a file from the instance's virtual filesystem
    pub fn read_file(path: &str) -> Option<Vec<u8>> {
        let size = sys::fs_size(path);
        if size < 0 {
            return None;
        }
        let mut buf = vec![0u8; size as usize];
        let read = sys::fs_read(path, &mut buf);
        if read < 0 {
            return None;
        }
        buf.truncate(read as usize);
        Some(buf)
    }

    pub fn write_file(path: &str, data: &[u8]) -> bool {
        sys::fs_write(path, data, false) == 0
    }

    pub fn append_file(path: &str, data: &[u8]) -> bool {
        sys::fs_write(path, data, true) == 0
    }

    /// Append to the output stream
    pub fn echo(data: &[u8]) -> bool {
        append_file(paths::STDOUT, data)
    }

    /// Append to the diagnostic stream
    pub fn log_error(message: &str) -> bool {
        append_file(paths::STDERR, message.as_bytes())
    }

    /// Record status and header lines for the response
    pub fn set_response(status: u16, headers: &[&str]) -> bool {
        let record = HeadersRecord {
            status,
            headers: headers.iter().map(|h| h.to_string()).collect(),
        };
        match record.to_json() {
            Ok(json) => write_file(paths::HEADERS, &json),
            Err(_) => false,
        }
    }

    /// Push an out-of-band message to the host, returning its reply
    pub fn post_message(message: &str) -> Option<String> {
        let len = sys::post_message(message.as_bytes());
        if len <= 0 {
            return None;
        }
        let reply = take_reply(len as usize)?;
        String::from_utf8(reply).ok()
    }

    /// Ask the host to emulate a subprocess
    pub fn spawn(request: &SpawnRequest) -> SpawnOutput {
        let Ok(encoded) = rmp_serde::to_vec_named(request) else {
            return SpawnOutput::unsupported(&request.command);
        };
        let len = sys::spawn(&encoded);
        if len <= 0 {
            return SpawnOutput::unsupported(&request.command);
        }
        take_reply(len as usize)
            .and_then(|bytes| rmp_serde::from_slice(&bytes).ok())
            .unwrap_or_else(|| SpawnOutput::unsupported(&request.command))
    }

    fn take_reply(len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let read = sys::take_reply(&mut buf);
        if read < 0 {
            return None;
        }
        buf.truncate(read as usize);
        Some(buf)
    }
}

/// Raw host imports
#[cfg(target_arch = "wasm32")]
mod sys {
    mod ffi {
        #[link(wasm_import_module = "sapi")]
        extern "C" {
            pub fn fs_size(path_ptr: i32, path_len: i32) -> i64;
            pub fn fs_read(path_ptr: i32, path_len: i32, dst_ptr: i32, dst_cap: i32) -> i32;
            pub fn fs_write(
                path_ptr: i32,
                path_len: i32,
                data_ptr: i32,
                data_len: i32,
                append: i32,
            ) -> i32;
            pub fn post_message(ptr: i32, len: i32) -> i32;
            pub fn spawn(ptr: i32, len: i32) -> i32;
            pub fn take_reply(dst_ptr: i32, dst_cap: i32) -> i32;
        }
    }

    pub fn fs_size(path: &str) -> i64 {
        unsafe { ffi::fs_size(path.as_ptr() as i32, path.len() as i32) }
    }

    pub fn fs_read(path: &str, dst: &mut [u8]) -> i32 {
        unsafe {
            ffi::fs_read(
                path.as_ptr() as i32,
                path.len() as i32,
                dst.as_mut_ptr() as i32,
                dst.len() as i32,
            )
        }
    }

    pub fn fs_write(path: &str, data: &[u8], append: bool) -> i32 {
        unsafe {
            ffi::fs_write(
                path.as_ptr() as i32,
                path.len() as i32,
                data.as_ptr() as i32,
                data.len() as i32,
                append as i32,
            )
        }
    }

    pub fn post_message(message: &[u8]) -> i32 {
        unsafe { ffi::post_message(message.as_ptr() as i32, message.len() as i32) }
    }

    pub fn spawn(request: &[u8]) -> i32 {
        unsafe { ffi::spawn(request.as_ptr() as i32, request.len() as i32) }
    }

    pub fn take_reply(dst: &mut [u8]) -> i32 {
        unsafe { ffi::take_reply(dst.as_mut_ptr() as i32, dst.len() as i32) }
    }
}

/// In-process stand-in for the host imports on native targets, so engine
/// logic can be unit tested without a wasm runtime.
#[cfg(not(target_arch = "wasm32"))]
mod sys {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    thread_local! {
        static FILES: RefCell<BTreeMap<String, Vec<u8>>> = const { RefCell::new(BTreeMap::new()) };
        static REPLY: RefCell<Option<Vec<u8>>> = const { RefCell::new(None) };
    }

    pub fn fs_size(path: &str) -> i64 {
        FILES.with(|files| {
            files
                .borrow()
                .get(path)
                .map(|data| data.len() as i64)
                .unwrap_or(-1)
        })
    }

    pub fn fs_read(path: &str, dst: &mut [u8]) -> i32 {
        FILES.with(|files| match files.borrow().get(path) {
            Some(data) => {
                let n = data.len().min(dst.len());
                dst[..n].copy_from_slice(&data[..n]);
                n as i32
            }
            None => -1,
        })
    }

    pub fn fs_write(path: &str, data: &[u8], append: bool) -> i32 {
        FILES.with(|files| {
            let mut files = files.borrow_mut();
            let entry = files.entry(path.to_string()).or_default();
            if !append {
                entry.clear();
            }
            entry.extend_from_slice(data);
        });
        0
    }

    pub fn post_message(message: &[u8]) -> i32 {
        // Echo the message back so round trips are observable
        REPLY.with(|reply| *reply.borrow_mut() = Some(message.to_vec()));
        message.len() as i32
    }

    pub fn spawn(_request: &[u8]) -> i32 {
        0
    }

    pub fn take_reply(dst: &mut [u8]) -> i32 {
        REPLY.with(|reply| match reply.borrow_mut().take() {
            Some(data) => {
                let n = data.len().min(dst.len());
                dst[..n].copy_from_slice(&data[..n]);
                n as i32
            }
            None => -1,
        })
    }
}

/// Macro to export all functions the host requires
///
/// Generates `sapi_abi_version`, `sapi_alloc`, `sapi_dealloc`,
/// `sapi_startup` and `sapi_handle_request`.
#[macro_export]
macro_rules! export_engine {
    ($engine:ty) => {
        #[no_mangle]
        pub extern "C" fn sapi_abi_version() -> i32 {
            $crate::ABI_VERSION
        }

        #[no_mangle]
        pub extern "C" fn sapi_alloc(size: i32) -> i32 {
            $crate::memory::sapi_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn sapi_dealloc(ptr: i32, size: i32) {
            $crate::memory::sapi_dealloc(ptr, size)
        }

        #[no_mangle]
        pub extern "C" fn sapi_startup(name_ptr: i32, name_len: i32) -> i32 {
            let name = unsafe { $crate::memory::str_from_ptr(name_ptr, name_len) }
                .unwrap_or_default();
            <$engine as $crate::Engine>::startup(&name)
        }

        #[no_mangle]
        pub extern "C" fn sapi_handle_request(
            ctx_ptr: i32,
            ctx_len: i32,
            body_ptr: i32,
            body_len: i32,
        ) -> i32 {
            let ctx: Option<$crate::ExecutionContext> =
                unsafe { $crate::memory::deserialize_from_ptr(ctx_ptr, ctx_len) };
            let Some(ctx) = ctx else {
                return $crate::ENGINE_FAILURE_EXIT_CODE;
            };
            let body = unsafe { $crate::memory::bytes_from_ptr(body_ptr, body_len) };
            <$engine as $crate::Engine>::handle_request(ctx, body)
        }
    };
}
