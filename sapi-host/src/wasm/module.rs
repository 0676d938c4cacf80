//! A single instantiated engine module

use super::loader::WasmLoaderConfig;
use crate::error::EngineError;
use crate::events::HostCallbacks;
use crate::module::{BodyBuffer, EngineModule};
use crate::vfs::MemFs;
use async_trait::async_trait;
use sapi_api::{abi, ExecutionContext, ModuleId, ABI_VERSION};
use wasmtime::{Engine, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, Trap, TypedFunc};

#[cfg(feature = "wasi")]
use wasmtime_wasi::{pipe::MemoryOutputPipe, preview1::WasiP1Ctx, WasiCtxBuilder};

/// Captured stdio per request when WASI is linked
#[cfg(feature = "wasi")]
const STDIO_CAPACITY: usize = 16 * 1024 * 1024;

/// Data held by each module's store
///
/// Host imports reach the filesystem and callbacks through it.
pub struct EngineState {
    pub(super) fs: MemFs,
    pub(super) callbacks: HostCallbacks,
    /// Reply staged for `take_reply`
    pub(super) reply: Option<Vec<u8>>,
    limits: StoreLimits,
    #[cfg(feature = "wasi")]
    pub(super) wasi: WasiP1Ctx,
}

impl EngineState {
    fn new(max_memory_bytes: Option<usize>) -> Self {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(bytes) = max_memory_bytes {
            limits = limits.memory_size(bytes);
        }
        Self {
            fs: MemFs::new(),
            callbacks: HostCallbacks::default(),
            reply: None,
            limits: limits.build(),
            #[cfg(feature = "wasi")]
            wasi: WasiCtxBuilder::new().build_p1(),
        }
    }
}

/// Engine module instantiated in its own store
pub struct WasmEngineModule {
    id: ModuleId,
    store: Store<EngineState>,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
    startup_fn: Option<TypedFunc<(i32, i32), i32>>,
    handle_fn: TypedFunc<(i32, i32, i32, i32), i32>,
    fuel_limit: Option<u64>,
    destroyed: bool,
    #[cfg(feature = "wasi")]
    stdio: Option<(MemoryOutputPipe, MemoryOutputPipe)>,
}

impl WasmEngineModule {
    pub(super) async fn instantiate(
        engine: &Engine,
        linker: &Linker<EngineState>,
        module: &Module,
        id: ModuleId,
        config: &WasmLoaderConfig,
    ) -> Result<Self, EngineError> {
        let mut store = Store::new(engine, EngineState::new(config.max_memory_bytes));
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = config.fuel_limit {
            store.set_fuel(fuel).map_err(EngineError::EngineCreation)?;
        }

        let instance = linker
            .instantiate_async(&mut store, module)
            .await
            .map_err(EngineError::Instantiation)?;

        let memory = instance
            .get_memory(&mut store, abi::EXPORT_MEMORY)
            .ok_or_else(|| EngineError::FunctionNotFound(abi::EXPORT_MEMORY.to_string()))?;

        let version_fn = instance
            .get_typed_func::<(), i32>(&mut store, abi::EXPORT_ABI_VERSION)
            .map_err(|_| EngineError::FunctionNotFound(abi::EXPORT_ABI_VERSION.to_string()))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, abi::EXPORT_ALLOC)
            .map_err(|_| EngineError::FunctionNotFound(abi::EXPORT_ALLOC.to_string()))?;

        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, abi::EXPORT_DEALLOC)
            .map_err(|_| EngineError::FunctionNotFound(abi::EXPORT_DEALLOC.to_string()))?;

        let handle_fn = instance
            .get_typed_func::<(i32, i32, i32, i32), i32>(&mut store, abi::EXPORT_HANDLE_REQUEST)
            .map_err(|_| {
                EngineError::FunctionNotFound(abi::EXPORT_HANDLE_REQUEST.to_string())
            })?;

        // Optional: engines without per-interface setup skip it
        let startup_fn = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, abi::EXPORT_STARTUP)
            .ok();

        let version = version_fn
            .call_async(&mut store, ())
            .await
            .map_err(|e| call_error(abi::EXPORT_ABI_VERSION, e))?;
        if version != ABI_VERSION {
            return Err(EngineError::AbiVersionMismatch {
                expected: ABI_VERSION,
                actual: version,
            });
        }

        tracing::debug!(module = %id, "Instantiated engine module");

        Ok(Self {
            id,
            store,
            memory,
            alloc_fn,
            dealloc_fn,
            startup_fn,
            handle_fn,
            fuel_limit: config.fuel_limit,
            destroyed: false,
            #[cfg(feature = "wasi")]
            stdio: None,
        })
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.destroyed {
            return Err(EngineError::Destroyed);
        }
        Ok(())
    }

    /// Reset the fuel budget before each guest call
    fn refuel(&mut self) -> Result<(), EngineError> {
        if let Some(fuel) = self.fuel_limit {
            self.store
                .set_fuel(fuel)
                .map_err(EngineError::EngineCreation)?;
        }
        Ok(())
    }

    /// Copy `data` into a fresh guest allocation
    async fn write_guest(&mut self, data: &[u8]) -> Result<BodyBuffer, EngineError> {
        let len = u32::try_from(data.len()).map_err(|_| {
            EngineError::MemoryAccess(format!(
                "Payload too large: {} bytes exceeds u32::MAX",
                data.len()
            ))
        })?;
        let buffer = self.alloc(len).await?;
        self.write_memory(buffer, data)?;
        Ok(buffer)
    }

    #[cfg(feature = "wasi")]
    fn capture_stdio(&mut self) {
        let stdout = MemoryOutputPipe::new(STDIO_CAPACITY);
        let stderr = MemoryOutputPipe::new(STDIO_CAPACITY);
        let mut builder = WasiCtxBuilder::new();
        builder.stdout(stdout.clone()).stderr(stderr.clone());
        self.store.data_mut().wasi = builder.build_p1();
        self.stdio = Some((stdout, stderr));
    }

    #[cfg(feature = "wasi")]
    fn flush_stdio(&mut self) {
        let Some((stdout, stderr)) = self.stdio.take() else {
            return;
        };
        let fs = &mut self.store.data_mut().fs;
        for (pipe, path) in [(stdout, abi::paths::STDOUT), (stderr, abi::paths::STDERR)] {
            let contents = pipe.contents();
            if contents.is_empty() {
                continue;
            }
            if let Err(e) = fs.append_file(path, &contents) {
                tracing::warn!(path = %path, error = %e, "Failed to capture WASI output");
            }
        }
    }
}

#[async_trait]
impl EngineModule for WasmEngineModule {
    fn id(&self) -> &ModuleId {
        &self.id
    }

    fn fs(&self) -> &MemFs {
        &self.store.data().fs
    }

    fn fs_mut(&mut self) -> &mut MemFs {
        &mut self.store.data_mut().fs
    }

    fn set_callbacks(&mut self, callbacks: HostCallbacks) {
        self.store.data_mut().callbacks = callbacks;
    }

    async fn startup(&mut self, sapi_name: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        let Some(startup_fn) = self.startup_fn.clone() else {
            return Ok(());
        };

        let name = self.write_guest(sapi_name.as_bytes()).await?;
        self.refuel()?;
        let code = startup_fn
            .call_async(&mut self.store, (name.ptr as i32, name.len as i32))
            .await
            .map_err(|e| call_error(abi::EXPORT_STARTUP, e))?;
        self.dealloc(name).await?;

        if code != 0 {
            return Err(EngineError::Startup(code));
        }
        Ok(())
    }

    async fn alloc(&mut self, len: u32) -> Result<BodyBuffer, EngineError> {
        self.ensure_live()?;
        let size = i32::try_from(len).map_err(|_| {
            EngineError::MemoryAccess(format!("Allocation too large: {} bytes", len))
        })?;
        self.refuel()?;
        let ptr = self
            .alloc_fn
            .call_async(&mut self.store, size)
            .await
            .map_err(|e| call_error(abi::EXPORT_ALLOC, e))?;
        if ptr < 0 || (ptr == 0 && len > 0) {
            return Err(EngineError::MemoryAccess(format!(
                "Guest allocation of {} bytes failed (ptr={})",
                len, ptr
            )));
        }
        Ok(BodyBuffer {
            ptr: ptr as u32,
            len,
        })
    }

    fn write_memory(&mut self, buffer: BodyBuffer, data: &[u8]) -> Result<(), EngineError> {
        self.ensure_live()?;
        if data.len() > buffer.len as usize {
            return Err(EngineError::MemoryAccess(format!(
                "Write of {} bytes overflows buffer of {}",
                data.len(),
                buffer.len
            )));
        }
        self.memory
            .write(&mut self.store, buffer.ptr as usize, data)
            .map_err(|e| EngineError::MemoryAccess(format!("Failed to write buffer: {}", e)))
    }

    async fn dealloc(&mut self, buffer: BodyBuffer) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.refuel()?;
        self.dealloc_fn
            .call_async(&mut self.store, (buffer.ptr as i32, buffer.len as i32))
            .await
            .map_err(|e| call_error(abi::EXPORT_DEALLOC, e))
    }

    async fn handle_request(
        &mut self,
        context: &ExecutionContext,
        body: Option<BodyBuffer>,
    ) -> Result<i32, EngineError> {
        self.ensure_live()?;
        let encoded = context
            .to_msgpack()
            .map_err(|e| EngineError::Encoding(format!("Failed to encode context: {}", e)))?;
        let ctx = self.write_guest(&encoded).await?;
        let (body_ptr, body_len) = body
            .map(|b| (b.ptr as i32, b.len as i32))
            .unwrap_or((0, 0));

        #[cfg(feature = "wasi")]
        self.capture_stdio();

        self.refuel()?;
        let result = self
            .handle_fn
            .call_async(
                &mut self.store,
                (ctx.ptr as i32, ctx.len as i32, body_ptr, body_len),
            )
            .await
            .map_err(|e| call_error(abi::EXPORT_HANDLE_REQUEST, e));

        #[cfg(feature = "wasi")]
        self.flush_stdio();

        // Context memory is freed here only after a clean return; the body
        // buffer belongs to the caller, which frees it on every path
        if result.is_ok() {
            if let Err(e) = self.dealloc(ctx).await {
                tracing::warn!(module = %self.id, error = %e, "Failed to deallocate context memory");
            }
        }
        result
    }

    fn destroy(&mut self) -> Result<(), EngineError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.store.data_mut().reply = None;
        tracing::debug!(module = %self.id, "Destroyed engine module");
        Ok(())
    }
}

fn call_error(function: &'static str, e: anyhow::Error) -> EngineError {
    if e.downcast_ref::<Trap>()
        .is_some_and(|t| *t == Trap::OutOfFuel)
    {
        EngineError::FuelExhausted
    } else {
        EngineError::FunctionCall {
            function,
            source: e,
        }
    }
}
