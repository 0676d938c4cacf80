//! Shared fixtures: a scripted in-process engine and WAT engine sources

#![allow(dead_code)]

use async_trait::async_trait;
use sapi_api::abi::paths;
use sapi_api::{ExecutionContext, HeadersRecord, ModuleId};
use sapi_host::{
    BodyBuffer, EngineError, EngineInstance, EngineModule, HostCallbacks, InstanceConfig, MemFs,
    ModuleLoader,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What the scripted engine does on each request
pub type Handler = Arc<
    dyn Fn(&mut MemFs, &ExecutionContext, &[u8], &HostCallbacks) -> Result<i32, EngineError>
        + Send
        + Sync,
>;

/// Observations shared between a test and its scripted modules
#[derive(Default)]
pub struct Probe {
    pub requests: AtomicUsize,
    pub startups: AtomicUsize,
    pub destroyed: AtomicUsize,
    /// Engine allocations not yet released
    pub live_buffers: AtomicUsize,
    pub sapi_names: Mutex<Vec<String>>,
    pub spans: Mutex<Vec<(Instant, Instant)>>,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn startups(&self) -> usize {
        self.startups.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::SeqCst)
    }
}

pub struct ScriptedModule {
    id: ModuleId,
    fs: MemFs,
    callbacks: HostCallbacks,
    handler: Handler,
    delay: Option<Duration>,
    startup_fault: bool,
    probe: Arc<Probe>,
    heap: HashMap<u32, Vec<u8>>,
    next_ptr: u32,
    destroyed: bool,
}

impl ScriptedModule {
    pub fn new(name: &str, handler: Handler, probe: Arc<Probe>) -> Self {
        Self {
            id: ModuleId::new(name),
            fs: MemFs::new(),
            callbacks: HostCallbacks::new(),
            handler,
            delay: None,
            startup_fault: false,
            probe,
            heap: HashMap::new(),
            next_ptr: 8,
            destroyed: false,
        }
    }

    /// Hold every request open for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_startup(mut self) -> Self {
        self.startup_fault = true;
        self
    }

    /// Seed a file before the module is installed
    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.fs
            .write_file(path, contents)
            .expect("seed file");
        self
    }

    pub fn boxed(self) -> Box<dyn EngineModule> {
        Box::new(self)
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.destroyed {
            return Err(EngineError::Destroyed);
        }
        Ok(())
    }
}

#[async_trait]
impl EngineModule for ScriptedModule {
    fn id(&self) -> &ModuleId {
        &self.id
    }

    fn fs(&self) -> &MemFs {
        &self.fs
    }

    fn fs_mut(&mut self) -> &mut MemFs {
        &mut self.fs
    }

    fn set_callbacks(&mut self, callbacks: HostCallbacks) {
        self.callbacks = callbacks;
    }

    async fn startup(&mut self, sapi_name: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.probe.startups.fetch_add(1, Ordering::SeqCst);
        self.probe
            .sapi_names
            .lock()
            .unwrap()
            .push(sapi_name.to_string());
        if self.startup_fault {
            return Err(EngineError::Startup(-1));
        }
        Ok(())
    }

    async fn alloc(&mut self, len: u32) -> Result<BodyBuffer, EngineError> {
        self.ensure_live()?;
        let ptr = self.next_ptr;
        self.next_ptr += len.max(1);
        self.heap.insert(ptr, vec![0; len as usize]);
        self.probe.live_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(BodyBuffer { ptr, len })
    }

    fn write_memory(&mut self, buffer: BodyBuffer, data: &[u8]) -> Result<(), EngineError> {
        let slot = self
            .heap
            .get_mut(&buffer.ptr)
            .ok_or_else(|| EngineError::MemoryAccess("unknown buffer".to_string()))?;
        slot[..data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn dealloc(&mut self, buffer: BodyBuffer) -> Result<(), EngineError> {
        if self.heap.remove(&buffer.ptr).is_some() {
            self.probe.live_buffers.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn handle_request(
        &mut self,
        context: &ExecutionContext,
        body: Option<BodyBuffer>,
    ) -> Result<i32, EngineError> {
        self.ensure_live()?;
        self.probe.requests.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let body = body
            .and_then(|b| self.heap.get(&b.ptr).cloned())
            .unwrap_or_default();
        let result = (self.handler)(&mut self.fs, context, &body, &self.callbacks);
        self.probe.spans.lock().unwrap().push((started, Instant::now()));
        result
    }

    fn destroy(&mut self) -> Result<(), EngineError> {
        if !self.destroyed {
            self.destroyed = true;
            self.probe.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Loader handing out scripted modules named after the requested id
pub struct ScriptedLoader {
    pub handler: Handler,
    pub probe: Arc<Probe>,
    pub loads: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new(handler: Handler, probe: Arc<Probe>) -> Self {
        Self {
            handler,
            probe,
            loads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModuleLoader for ScriptedLoader {
    async fn load(&self, id: &ModuleId) -> Result<Box<dyn EngineModule>, EngineError> {
        if id.as_str() == "missing" {
            return Err(EngineError::UnknownModule(id.clone()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedModule::new(id.as_str(), self.handler.clone(), self.probe.clone()).boxed())
    }
}

fn fs_fault(e: sapi_host::FsError) -> EngineError {
    EngineError::MemoryAccess(e.to_string())
}

/// Writes the executed source (and any body) to stdout
pub fn echo() -> Handler {
    Arc::new(
        |fs: &mut MemFs,
         context: &ExecutionContext,
         body: &[u8],
         _: &HostCallbacks|
         -> Result<i32, EngineError> {
            let source = fs.read_file(&context.script_path).unwrap_or_default();
            fs.write_file(paths::STDOUT, source).map_err(fs_fault)?;
            if !body.is_empty() {
                fs.append_file(paths::STDOUT, body).map_err(fs_fault)?;
            }
            Ok(0)
        },
    )
}

/// Sets `status`, writes some output and exits with `exit_code`
pub fn respond(status: u16, headers: &[&str], exit_code: i32) -> Handler {
    let record = HeadersRecord {
        status,
        headers: headers.iter().map(|h| h.to_string()).collect(),
    };
    Arc::new(
        move |fs: &mut MemFs,
              _: &ExecutionContext,
              _: &[u8],
              _: &HostCallbacks|
              -> Result<i32, EngineError> {
            let json = record
                .to_json()
                .map_err(|e| EngineError::Encoding(e.to_string()))?;
            fs.write_file(paths::HEADERS, json).map_err(fs_fault)?;
            fs.write_file(paths::STDOUT, "partial output").map_err(fs_fault)?;
            fs.write_file(paths::STDERR, "warning: something").map_err(fs_fault)?;
            Ok(exit_code)
        },
    )
}

/// Faults like a trapped engine
pub fn trap() -> Handler {
    Arc::new(
        |_: &mut MemFs,
         _: &ExecutionContext,
         _: &[u8],
         _: &HostCallbacks|
         -> Result<i32, EngineError> {
            Err(EngineError::FunctionCall {
                function: "sapi_handle_request",
                source: anyhow::anyhow!("wasm trap: unreachable executed"),
            })
        },
    )
}

/// Initialized instance running `module`
pub async fn instance_with(module: ScriptedModule) -> EngineInstance {
    let instance = EngineInstance::new(InstanceConfig::default());
    instance
        .initialize(module.boxed())
        .await
        .expect("initialize");
    instance
}

/// Minimal engine in WAT: fixed imports and exports, `handle` is the body
/// of `sapi_handle_request`
///
/// Data layout: `/internal/stdout` at 16, `/internal/headers.json` at 48,
/// a 16-byte greeting at 96 and a 42-byte headers record at 128.
pub fn wat_engine(abi_version: i32, handle: &str) -> String {
    format!(
        r#"(module
  (import "sapi" "fs_write" (func $fs_write (param i32 i32 i32 i32 i32) (result i32)))
  (import "sapi" "fs_size" (func $fs_size (param i32 i32) (result i64)))
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 4096))
  (data (i32.const 16) "/internal/stdout")
  (data (i32.const 48) "/internal/headers.json")
  (data (i32.const 96) "hello from wasm\n")
  (data (i32.const 128) "{{\"status\":201,\"headers\":[\"X-Engine: wat\"]}}")
  (func (export "sapi_abi_version") (result i32) (i32.const {abi_version}))
  (func (export "sapi_alloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap
      (i32.and
        (i32.add (i32.add (global.get $heap) (local.get $size)) (i32.const 7))
        (i32.const -8)))
    (local.get $ptr))
  (func (export "sapi_dealloc") (param i32 i32))
  (func (export "sapi_handle_request")
    (param $ctx i32) (param $ctx_len i32) (param $body i32) (param $body_len i32)
    (result i32)
    {handle})
)"#
    )
}

/// Greets, records a 201 with a header and echoes the body
pub const GREET: &str = r#"
    (drop (call $fs_write (i32.const 48) (i32.const 22) (i32.const 128) (i32.const 42) (i32.const 0)))
    (drop (call $fs_write (i32.const 16) (i32.const 16) (i32.const 96) (i32.const 16) (i32.const 1)))
    (if (i32.gt_s (local.get $body_len) (i32.const 0))
      (then
        (drop (call $fs_write (i32.const 16) (i32.const 16) (local.get $body) (local.get $body_len) (i32.const 1)))))
    (i32.const 0)"#;

/// Exits with a program failure after setting a status
pub const EXIT_3: &str = r#"
    (drop (call $fs_write (i32.const 48) (i32.const 22) (i32.const 128) (i32.const 42) (i32.const 0)))
    (i32.const 3)"#;

pub const UNREACHABLE: &str = "(unreachable)";

pub const SPIN: &str = "(loop $spin (br $spin)) (i32.const 0)";
