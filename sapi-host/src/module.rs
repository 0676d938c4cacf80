//! Raw call interface to a loaded engine module
//!
//! An [`EngineInstance`](crate::EngineInstance) only ever talks to its
//! engine through [`EngineModule`]. The wasmtime implementation lives in
//! [`crate::wasm`]; tests drive the instance with in-process doubles.

use crate::error::EngineError;
use crate::events::HostCallbacks;
use crate::vfs::MemFs;
use async_trait::async_trait;
use sapi_api::{ExecutionContext, ModuleId};

/// A buffer allocated inside engine memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyBuffer {
    pub ptr: u32,
    pub len: u32,
}

/// One loaded engine module and the filesystem it owns
#[async_trait]
pub trait EngineModule: Send {
    fn id(&self) -> &ModuleId;

    fn fs(&self) -> &MemFs;

    fn fs_mut(&mut self) -> &mut MemFs;

    /// Route the program's messages and spawn attempts to the host
    fn set_callbacks(&mut self, callbacks: HostCallbacks);

    /// One-time server interface setup; runs before the first request
    async fn startup(&mut self, sapi_name: &str) -> Result<(), EngineError>;

    async fn alloc(&mut self, len: u32) -> Result<BodyBuffer, EngineError>;

    fn write_memory(&mut self, buffer: BodyBuffer, data: &[u8]) -> Result<(), EngineError>;

    async fn dealloc(&mut self, buffer: BodyBuffer) -> Result<(), EngineError>;

    /// Run one request and return the engine's exit code
    ///
    /// `Err` means the engine itself faulted and must not be called again.
    async fn handle_request(
        &mut self,
        context: &ExecutionContext,
        body: Option<BodyBuffer>,
    ) -> Result<i32, EngineError>;

    /// Tear down the engine; the filesystem stays readable afterwards
    fn destroy(&mut self) -> Result<(), EngineError>;
}

/// Produces loaded modules by identifier
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, id: &ModuleId) -> Result<Box<dyn EngineModule>, EngineError>;
}
