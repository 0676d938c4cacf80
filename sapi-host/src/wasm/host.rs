//! Host functions imported by engine modules
//!
//! Filesystem calls return `-1` on failure. Replies to `post_message` and
//! `spawn` are staged in the store and fetched with `take_reply`, so the
//! host never calls back into the guest from inside an import. Out of
//! bounds pointers trap.

use super::module::EngineState;
use sapi_api::abi::{self, EXPORT_MEMORY, IMPORT_MODULE};
use sapi_api::SpawnRequest;
use wasmtime::{Caller, Linker, Memory};

pub(super) fn add_to_linker(linker: &mut Linker<EngineState>) -> anyhow::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        abi::IMPORT_FS_SIZE,
        |mut caller: Caller<'_, EngineState>, path_ptr: i32, path_len: i32| -> anyhow::Result<i64> {
            let memory = guest_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let path = guest_str(data, path_ptr, path_len)?;
            Ok(state.fs.file_size(&path).map(|n| n as i64).unwrap_or(-1))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        abi::IMPORT_FS_READ,
        |mut caller: Caller<'_, EngineState>,
         path_ptr: i32,
         path_len: i32,
         dst_ptr: i32,
         dst_cap: i32|
         -> anyhow::Result<i32> {
            let memory = guest_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let path = guest_str(data, path_ptr, path_len)?;
            let contents = match state.fs.read_file(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    tracing::trace!(path = %path, error = %e, "fs_read failed");
                    return Ok(-1);
                }
            };
            let dst = guest_slice_mut(data, dst_ptr, dst_cap)?;
            let n = contents.len().min(dst.len());
            dst[..n].copy_from_slice(&contents[..n]);
            Ok(n as i32)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        abi::IMPORT_FS_WRITE,
        |mut caller: Caller<'_, EngineState>,
         path_ptr: i32,
         path_len: i32,
         data_ptr: i32,
         data_len: i32,
         append: i32|
         -> anyhow::Result<i32> {
            let memory = guest_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let path = guest_str(data, path_ptr, path_len)?;
            let bytes = guest_slice(data, data_ptr, data_len)?;
            let result = if append != 0 {
                state.fs.append_file(&path, bytes)
            } else {
                state.fs.write_file(&path, bytes)
            };
            match result {
                Ok(()) => Ok(0),
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "fs_write failed");
                    Ok(-1)
                }
            }
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        abi::IMPORT_POST_MESSAGE,
        |mut caller: Caller<'_, EngineState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let memory = guest_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let message = guest_str(data, ptr, len)?;
            let reply = state.callbacks.post_message(&message);
            Ok(stage_reply(state, reply.map(String::into_bytes)))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        abi::IMPORT_SPAWN,
        |mut caller: Caller<'_, EngineState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let memory = guest_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let request: SpawnRequest = match rmp_serde::from_slice(guest_slice(data, ptr, len)?) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed spawn request");
                    return Ok(-1);
                }
            };
            tracing::debug!(command = %request.command, args = ?request.args, "Program spawn");
            let output = state.callbacks.spawn(&request);
            let encoded = rmp_serde::to_vec_named(&output)?;
            Ok(stage_reply(state, Some(encoded)))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        abi::IMPORT_TAKE_REPLY,
        |mut caller: Caller<'_, EngineState>, dst_ptr: i32, dst_cap: i32| -> anyhow::Result<i32> {
            let memory = guest_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let Some(reply) = state.reply.take() else {
                return Ok(-1);
            };
            let dst = guest_slice_mut(data, dst_ptr, dst_cap)?;
            let n = reply.len().min(dst.len());
            dst[..n].copy_from_slice(&reply[..n]);
            Ok(n as i32)
        },
    )?;

    Ok(())
}

/// Keep `reply` for `take_reply` and return its length
fn stage_reply(state: &mut EngineState, reply: Option<Vec<u8>>) -> i32 {
    match reply {
        Some(bytes) if !bytes.is_empty() => {
            let len = i32::try_from(bytes.len()).unwrap_or(i32::MAX);
            state.reply = Some(bytes);
            len
        }
        _ => {
            state.reply = None;
            0
        }
    }
}

fn guest_memory(caller: &mut Caller<'_, EngineState>) -> anyhow::Result<Memory> {
    caller
        .get_export(EXPORT_MEMORY)
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest does not export `{}`", EXPORT_MEMORY))
}

fn guest_range(data_len: usize, ptr: i32, len: i32) -> anyhow::Result<std::ops::Range<usize>> {
    if ptr < 0 || len < 0 {
        anyhow::bail!("Invalid pointer/length: ptr={}, len={}", ptr, len);
    }
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| anyhow::anyhow!("Integer overflow: ptr={}, len={}", ptr, len))?;
    if end > data_len {
        anyhow::bail!(
            "Out of bounds: ptr={}, len={}, memory_size={}",
            ptr,
            len,
            data_len
        );
    }
    Ok(start..end)
}

fn guest_slice(data: &[u8], ptr: i32, len: i32) -> anyhow::Result<&[u8]> {
    let range = guest_range(data.len(), ptr, len)?;
    Ok(&data[range])
}

fn guest_slice_mut(data: &mut [u8], ptr: i32, len: i32) -> anyhow::Result<&mut [u8]> {
    let range = guest_range(data.len(), ptr, len)?;
    Ok(&mut data[range])
}

fn guest_str(data: &[u8], ptr: i32, len: i32) -> anyhow::Result<String> {
    let bytes = guest_slice(data, ptr, len)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}
