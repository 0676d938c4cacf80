//! Compiles and caches engine modules

use super::host;
use super::module::{EngineState, WasmEngineModule};
use crate::error::EngineError;
use crate::module::{EngineModule, ModuleLoader};
use async_trait::async_trait;
use sapi_api::{abi, ModuleId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use wasmtime::{Config, Engine, Linker, Module};

/// Exports every engine module must provide
const REQUIRED_EXPORTS: &[&str] = &[
    abi::EXPORT_MEMORY,
    abi::EXPORT_ABI_VERSION,
    abi::EXPORT_ALLOC,
    abi::EXPORT_DEALLOC,
    abi::EXPORT_HANDLE_REQUEST,
];

/// Configuration for the wasmtime loader
#[derive(Debug, Clone)]
pub struct WasmLoaderConfig {
    /// Fuel budget per guest call; `None` disables metering
    pub fuel_limit: Option<u64>,

    /// Maximum WASM stack size in bytes
    pub max_stack_size: usize,

    /// Upper bound on a module's linear memory in bytes
    pub max_memory_bytes: Option<usize>,
}

impl Default for WasmLoaderConfig {
    fn default() -> Self {
        Self {
            // Interpreters burn far more instructions per call than plugins
            fuel_limit: Some(1_000_000_000),
            max_stack_size: 1024 * 1024, // 1MB
            max_memory_bytes: None,
        }
    }
}

/// Loader with a shared wasmtime engine and linker
pub struct WasmModuleLoader {
    engine: Engine,
    config: WasmLoaderConfig,
    linker: Arc<Linker<EngineState>>,
    modules: RwLock<HashMap<ModuleId, Module>>,
}

impl WasmModuleLoader {
    pub fn new(config: WasmLoaderConfig) -> Result<Self, EngineError> {
        let mut engine_config = Config::new();
        engine_config.async_support(true);
        engine_config.consume_fuel(config.fuel_limit.is_some());
        engine_config.max_wasm_stack(config.max_stack_size);
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config).map_err(EngineError::EngineCreation)?;

        let mut linker: Linker<EngineState> = Linker::new(&engine);
        host::add_to_linker(&mut linker).map_err(EngineError::Instantiation)?;

        #[cfg(feature = "wasi")]
        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, |state: &mut EngineState| {
            &mut state.wasi
        })
        .map_err(|e| {
            EngineError::Instantiation(anyhow::anyhow!("Failed to add WASI to linker: {}", e))
        })?;

        Ok(Self {
            engine,
            config,
            linker: Arc::new(linker),
            modules: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &WasmLoaderConfig {
        &self.config
    }

    /// Compile module bytes (binary or text format) and cache them
    ///
    /// Registering the same bytes again returns the cached id.
    pub fn register(&self, bytes: &[u8]) -> Result<ModuleId, EngineError> {
        let id = ModuleId::from_bytes(bytes);
        if self.contains(&id) {
            tracing::debug!(module = %id, "Engine module already registered");
            return Ok(id);
        }

        let module = Module::new(&self.engine, bytes).map_err(EngineError::ModuleCompilation)?;
        for name in REQUIRED_EXPORTS {
            if module.get_export(name).is_none() {
                return Err(EngineError::FunctionNotFound(name.to_string()));
            }
        }

        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), module);
        tracing::info!(module = %id, size = bytes.len(), "Registered engine module");
        Ok(id)
    }

    /// Read and register a module file
    pub async fn register_file(&self, path: impl AsRef<Path>) -> Result<ModuleId, EngineError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.register(&bytes)
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Drop a cached module; instances already loaded from it keep running
    pub fn unregister(&self, id: &ModuleId) -> bool {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    /// Instantiate a registered module with its concrete type
    pub async fn instantiate(&self, id: &ModuleId) -> Result<WasmEngineModule, EngineError> {
        let module = {
            let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
            modules.get(id).cloned()
        }
        .ok_or_else(|| EngineError::UnknownModule(id.clone()))?;

        WasmEngineModule::instantiate(&self.engine, &self.linker, &module, id.clone(), &self.config)
            .await
    }
}

#[async_trait]
impl ModuleLoader for WasmModuleLoader {
    async fn load(&self, id: &ModuleId) -> Result<Box<dyn EngineModule>, EngineError> {
        let module = self.instantiate(id).await?;
        Ok(Box::new(module))
    }
}
