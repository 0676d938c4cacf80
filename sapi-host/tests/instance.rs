mod common;

use common::{echo, instance_with, respond, trap, Probe, ScriptedModule};
use sapi_api::abi::paths;
use sapi_api::{ExecutionContext, Request, SpawnOutput, SpawnRequest};
use sapi_host::{
    ConfigurationError, EngineError, EngineEvent, EngineInstance, EventKind, FailureSource,
    HostCallbacks, HostDirMount, InstanceConfig, ListFilesOptions, MemFs, RmDirOptions,
    RuntimeError, SpawnHandler,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn record_events(instance: &EngineInstance) -> Arc<Mutex<Vec<EventKind>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::RuntimeInitialized,
        EventKind::RequestStarted,
        EventKind::RequestEnded,
        EventKind::RequestError,
        EventKind::BeforeDestroy,
    ] {
        let seen = seen.clone();
        instance.add_event_listener(
            kind,
            Arc::new(move |event: &EngineEvent<'_>| seen.lock().unwrap().push(event.kind())),
        );
    }
    seen
}

#[tokio::test]
async fn test_execute_inline_code() {
    let probe = Probe::new();
    let instance = instance_with(ScriptedModule::new("echo", echo(), probe.clone())).await;

    let response = instance
        .execute(Request::with_code("echo 'hi';"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "echo 'hi';");
    assert_eq!(response.exit_code, 0);
    assert_eq!(
        instance.read_file_as_text(paths::EVAL_CODE).await.unwrap(),
        "echo 'hi';"
    );
    assert_eq!(probe.requests(), 1);
}

#[tokio::test]
async fn test_execute_script_with_body() {
    let probe = Probe::new();
    let instance = instance_with(ScriptedModule::new("echo", echo(), probe)).await;
    instance
        .write_file("/var/www/index.code", "<p>hi</p>")
        .await
        .unwrap();

    let response = instance
        .execute(
            Request::with_script("/var/www/index.code")
                .method("POST")
                .body(b"|payload".to_vec()),
        )
        .await
        .unwrap();

    assert_eq!(response.text(), "<p>hi</p>|payload");
}

#[tokio::test]
async fn test_legacy_text_body_reaches_engine_terminated() {
    let seen: Arc<Mutex<Option<(Vec<u8>, Option<usize>)>>> = Arc::new(Mutex::new(None));
    let capture = seen.clone();
    let handler: common::Handler = Arc::new(
        move |_: &mut MemFs,
              context: &ExecutionContext,
              body: &[u8],
              _: &HostCallbacks|
              -> Result<i32, EngineError> {
            *capture.lock().unwrap() = Some((body.to_vec(), context.content_length));
            Ok(0)
        },
    );
    let probe = Probe::new();
    let instance = instance_with(ScriptedModule::new("text", handler, probe.clone())).await;

    instance
        .execute(Request::with_code("").method("POST").text_body("a=1&b=2"))
        .await
        .unwrap();

    let (body, content_length) = seen.lock().unwrap().take().unwrap();
    assert_eq!(body, b"a=1&b=2\0".to_vec());
    assert_eq!(content_length, Some(7));
    assert_eq!(probe.live_buffers(), 0);
}

#[tokio::test]
async fn test_body_buffer_released_on_every_outcome() {
    let probe = Probe::new();
    let instance = instance_with(ScriptedModule::new("ok", echo(), probe.clone())).await;
    instance
        .execute(Request::with_code("").body(b"ok".to_vec()))
        .await
        .unwrap();
    assert_eq!(probe.live_buffers(), 0);

    let probe = Probe::new();
    let instance =
        instance_with(ScriptedModule::new("exit", respond(200, &[], 3), probe.clone())).await;
    let err = instance
        .execute(Request::with_code("").body(b"fails".to_vec()))
        .await
        .unwrap_err();
    assert!(err.response().is_some());
    assert_eq!(probe.live_buffers(), 0);

    let probe = Probe::new();
    let instance = instance_with(ScriptedModule::new("trap", trap(), probe.clone())).await;
    let err = instance
        .execute(Request::with_code("").body(b"crashes".to_vec()))
        .await
        .unwrap_err();
    assert!(err.is_crash());
    assert_eq!(probe.requests(), 1);
    assert_eq!(probe.live_buffers(), 0);
}

#[tokio::test]
async fn test_headers_record_shapes_response() {
    let probe = Probe::new();
    let handler = respond(
        201,
        &["Content-Type: text/plain", "Set-Cookie: a=1", "Set-Cookie: b=2"],
        0,
    );
    let instance = instance_with(ScriptedModule::new("respond", handler, probe)).await;

    let response = instance.execute(Request::with_code("")).await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.headers["set-cookie"], vec!["a=1", "b=2"]);
    assert_eq!(response.errors, "warning: something");
}

#[tokio::test]
async fn test_nonzero_exit_is_execution_failure_with_500() {
    let probe = Probe::new();
    let handler = respond(201, &["X-Partial: yes"], 2);
    let instance = instance_with(ScriptedModule::new("respond", handler, probe)).await;

    let err = instance.execute(Request::with_code("")).await.unwrap_err();

    let RuntimeError::ExecutionFailure { response, origin } = &err else {
        panic!("expected execution failure, got {err:?}");
    };
    assert_eq!(*origin, FailureSource::Program);
    assert_eq!(response.status, 500);
    assert_eq!(response.exit_code, 2);
    assert_eq!(response.text(), "partial output");
    assert_eq!(response.errors, "warning: something");

    // Program failures leave the instance usable
    assert!(!instance.is_crashed().await);
    assert!(instance.execute(Request::with_code("")).await.is_err());
}

#[tokio::test]
async fn test_negative_exit_is_attributed_to_engine() {
    let probe = Probe::new();
    let instance = instance_with(ScriptedModule::new("respond", respond(200, &[], -1), probe)).await;

    let err = instance.execute(Request::with_code("")).await.unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::ExecutionFailure {
            origin: FailureSource::Engine,
            ..
        }
    ));
    assert!(!instance.is_crashed().await);
}

#[tokio::test]
async fn test_missing_script_never_reaches_engine() {
    let probe = Probe::new();
    let instance = instance_with(ScriptedModule::new("echo", echo(), probe.clone())).await;

    let err = instance
        .execute(Request::with_script("/var/www/missing.code"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::Configuration(ConfigurationError::MissingScript(ref path))
            if path == "/var/www/missing.code"
    ));
    assert_eq!(probe.requests(), 0);
    assert_eq!(probe.startups(), 0);
}

#[tokio::test]
async fn test_conflicting_modes_rejected() {
    let instance = instance_with(ScriptedModule::new("echo", echo(), Probe::new())).await;
    let err = instance
        .execute(Request::with_code("1").script_path("/a.code"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Configuration(ConfigurationError::ConflictingModes)
    ));
}

#[tokio::test]
async fn test_executions_never_overlap() {
    let probe = Probe::new();
    let module =
        ScriptedModule::new("slow", echo(), probe.clone()).with_delay(Duration::from_millis(40));
    let instance = instance_with(module).await;

    let (a, b, c) = tokio::join!(
        instance.execute(Request::with_code("a")),
        instance.execute(Request::with_code("b")),
        instance.execute(Request::with_code("c")),
    );
    assert_eq!(a.unwrap().text(), "a");
    assert_eq!(b.unwrap().text(), "b");
    assert_eq!(c.unwrap().text(), "c");

    let mut spans = probe.spans.lock().unwrap().clone();
    spans.sort();
    assert_eq!(spans.len(), 3);
    for pair in spans.windows(2) {
        assert!(pair[1].0 >= pair[0].1, "executions overlapped");
    }
}

#[tokio::test]
async fn test_startup_runs_once_with_sapi_name() {
    let probe = Probe::new();
    let instance = EngineInstance::new(InstanceConfig::default());
    instance.set_sapi_name("fpm-fcgi").await.unwrap();
    instance
        .initialize(ScriptedModule::new("echo", echo(), probe.clone()).boxed())
        .await
        .unwrap();

    instance.execute(Request::with_code("1")).await.unwrap();
    instance.execute(Request::with_code("2")).await.unwrap();

    assert_eq!(probe.startups(), 1);
    assert_eq!(*probe.sapi_names.lock().unwrap(), vec!["fpm-fcgi"]);
    assert!(matches!(
        instance.set_sapi_name("cli").await,
        Err(RuntimeError::AlreadyInitialized)
    ));
}

#[tokio::test]
async fn test_startup_failure_crashes() {
    let probe = Probe::new();
    let module = ScriptedModule::new("broken", echo(), probe.clone()).failing_startup();
    let instance = instance_with(module).await;

    let err = instance.execute(Request::with_code("1")).await.unwrap_err();
    assert!(err.is_crash());
    assert_eq!(probe.requests(), 0);
}

#[tokio::test]
async fn test_crash_poisons_every_later_operation() {
    let probe = Probe::new();
    let instance = instance_with(ScriptedModule::new("trap", trap(), probe.clone())).await;

    let first = instance
        .execute(Request::with_code("boom").uri("/explode"))
        .await
        .unwrap_err();
    let RuntimeError::Crashed(report) = &first else {
        panic!("expected crash, got {first:?}");
    };
    assert!(report.reason.contains("unreachable"));
    assert_eq!(report.uri.as_deref(), Some("/explode"));
    assert!(instance.is_crashed().await);
    assert_eq!(instance.crash_report().await.as_ref(), Some(report));
    assert_eq!(probe.destroyed(), 1);

    let again = instance.execute(Request::with_code("1")).await.unwrap_err();
    assert!(matches!(&again, RuntimeError::Crashed(r) if r == report));
    assert!(matches!(
        instance.write_file("/a.txt", "x").await,
        Err(RuntimeError::Crashed(_))
    ));
    assert!(matches!(
        instance.read_file_as_text("/a.txt").await,
        Err(RuntimeError::Crashed(_))
    ));
    assert_eq!(probe.requests(), 1);
}

#[tokio::test]
async fn test_event_order_for_success_and_failure() {
    let instance = EngineInstance::new(InstanceConfig::default());
    let seen = record_events(&instance);
    instance
        .initialize(ScriptedModule::new("respond", respond(200, &[], 0), Probe::new()).boxed())
        .await
        .unwrap();

    instance.execute(Request::with_code("")).await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            EventKind::RuntimeInitialized,
            EventKind::RequestStarted,
            EventKind::RequestEnded,
        ]
    );

    seen.lock().unwrap().clear();
    instance.exit().await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![EventKind::BeforeDestroy, EventKind::RequestEnded]
    );
}

#[tokio::test]
async fn test_request_error_event_carries_source() {
    let instance = instance_with(ScriptedModule::new("fail", respond(200, &[], 7), Probe::new())).await;
    let sources = Arc::new(Mutex::new(Vec::new()));
    let kinds = record_events(&instance);
    let s = sources.clone();
    instance.add_event_listener(
        EventKind::RequestError,
        Arc::new(move |event: &EngineEvent<'_>| {
            if let EngineEvent::RequestError { source, .. } = event {
                s.lock().unwrap().push(*source);
            }
        }),
    );

    let _ = instance.execute(Request::with_code("")).await;

    assert_eq!(
        *kinds.lock().unwrap(),
        vec![
            EventKind::RequestStarted,
            EventKind::RequestError,
            EventKind::RequestEnded,
        ]
    );
    assert_eq!(*sources.lock().unwrap(), vec![FailureSource::Program]);
}

#[tokio::test]
async fn test_removed_listener_is_not_called() {
    let instance = instance_with(ScriptedModule::new("echo", echo(), Probe::new())).await;
    let count = Arc::new(Mutex::new(0));
    let c = count.clone();
    let id = instance.add_event_listener(
        EventKind::RequestStarted,
        Arc::new(move |_: &EngineEvent<'_>| *c.lock().unwrap() += 1),
    );

    instance.execute(Request::with_code("")).await.unwrap();
    assert!(instance.remove_event_listener(EventKind::RequestStarted, id));
    instance.execute(Request::with_code("")).await.unwrap();

    assert_eq!(*count.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_messages_and_spawn_reach_host() {
    let handler: common::Handler = Arc::new(
        |fs: &mut MemFs,
         _: &ExecutionContext,
         _: &[u8],
         callbacks: &HostCallbacks|
         -> Result<i32, EngineError> {
            let reply = callbacks.post_message("ping").unwrap_or_default();
            let spawned = callbacks.spawn(&SpawnRequest::new("git").arg("status"));
            let out = format!(
                "{}|{}|{}",
                reply,
                spawned.exit_code,
                String::from_utf8_lossy(&spawned.stdout)
            );
            fs.write_file(paths::STDOUT, out)
                .map_err(|e| EngineError::MemoryAccess(e.to_string()))?;
            Ok(0)
        },
    );
    let instance = instance_with(ScriptedModule::new("callbacks", handler, Probe::new())).await;

    let response = instance.execute(Request::with_code("")).await.unwrap();
    assert_eq!(response.text(), "|127|");

    instance.on_message(Arc::new(|message: &str| Some(format!("pong:{message}"))));
    let spawn: Arc<dyn SpawnHandler> = Arc::new(|request: &SpawnRequest| {
        SpawnOutput::success(format!("ran {}", request.command))
    });
    instance.set_spawn_handler(Some(spawn));

    let response = instance.execute(Request::with_code("")).await.unwrap();
    assert_eq!(response.text(), "pong:ping|0|ran git");
}

#[tokio::test]
async fn test_lifecycle_state_errors() {
    let instance = EngineInstance::new(InstanceConfig::default());
    assert!(!instance.is_initialized().await);
    assert!(matches!(
        instance.execute(Request::with_code("")).await,
        Err(RuntimeError::NotInitialized)
    ));
    assert!(matches!(
        instance.read_file_as_text("/x").await,
        Err(RuntimeError::NotInitialized)
    ));

    let probe = Probe::new();
    instance
        .initialize(ScriptedModule::new("echo", echo(), probe.clone()).boxed())
        .await
        .unwrap();
    assert!(instance.is_initialized().await);
    assert!(matches!(
        instance
            .initialize(ScriptedModule::new("echo", echo(), probe.clone()).boxed())
            .await,
        Err(RuntimeError::AlreadyInitialized)
    ));

    instance.exit().await.unwrap();
    instance.exit().await.unwrap();
    assert_eq!(probe.destroyed(), 1);
    assert!(matches!(
        instance.execute(Request::with_code("")).await,
        Err(RuntimeError::Exited)
    ));
    assert!(matches!(
        instance.file_exists("/").await,
        Err(RuntimeError::Exited)
    ));
}

#[tokio::test]
async fn test_baseline_config_written_only_where_absent() {
    let config = InstanceConfig {
        memory_limit: "64M".to_string(),
        auto_prepend: "prelude();".to_string(),
        ..InstanceConfig::default()
    };

    let instance = EngineInstance::new(config.clone());
    instance
        .initialize(ScriptedModule::new("echo", echo(), Probe::new()).boxed())
        .await
        .unwrap();
    let ini = instance.read_file_as_text(paths::CONFIG).await.unwrap();
    assert!(ini.contains("memory_limit = 64M"));
    assert_eq!(
        instance.read_file_as_text(paths::AUTO_PREPEND).await.unwrap(),
        "prelude();"
    );

    let seeded = ScriptedModule::new("echo", echo(), Probe::new()).with_file(paths::CONFIG, "custom");
    let instance = EngineInstance::new(config);
    instance.initialize(seeded.boxed()).await.unwrap();
    assert_eq!(
        instance.read_file_as_text(paths::CONFIG).await.unwrap(),
        "custom"
    );
}

#[tokio::test]
async fn test_filesystem_bridge_round_trip() {
    let instance = instance_with(ScriptedModule::new("echo", echo(), Probe::new())).await;

    instance.mkdir("/app/data").await.unwrap();
    instance.write_file("/app/data/a.txt", "alpha").await.unwrap();
    instance
        .write_file("/app/data/b.bin", [0u8, 159, 146, 150])
        .await
        .unwrap();

    assert_eq!(
        instance.read_file_as_text("/app/data/a.txt").await.unwrap(),
        "alpha"
    );
    assert_eq!(
        instance.read_file_as_buffer("/app/data/b.bin").await.unwrap(),
        vec![0u8, 159, 146, 150]
    );
    assert!(instance.is_dir("/app/data").await.unwrap());
    assert!(instance.is_file("/app/data/a.txt").await.unwrap());
    assert!(!instance.file_exists("/app/nope").await.unwrap());
    assert_eq!(
        instance
            .list_files("/app/data", ListFilesOptions::default())
            .await
            .unwrap(),
        vec!["a.txt", "b.bin"]
    );
    assert_eq!(
        instance
            .list_files("/app/data", ListFilesOptions { prepend_path: true })
            .await
            .unwrap(),
        vec!["/app/data/a.txt", "/app/data/b.bin"]
    );

    instance.mv("/app/data/a.txt", "/app/a.txt").await.unwrap();
    assert!(!instance.file_exists("/app/data/a.txt").await.unwrap());
    instance.unlink("/app/a.txt").await.unwrap();
    assert!(matches!(
        instance.read_file_as_text("/app/a.txt").await,
        Err(RuntimeError::Filesystem(ref e)) if e.is_not_found()
    ));

    instance.chdir("/app").await.unwrap();
    instance.write_file("relative.txt", "r").await.unwrap();
    assert!(instance.is_file("/app/relative.txt").await.unwrap());
    instance.chdir("/").await.unwrap();

    instance
        .rmdir("/app", RmDirOptions::default())
        .await
        .unwrap();
    assert!(!instance.file_exists("/app").await.unwrap());
}

#[tokio::test]
async fn test_host_directory_mount() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("from_host.txt"), "host data").unwrap();
    let handler = Arc::new(HostDirMount::new(temp.path().to_str().unwrap()).unwrap());

    let instance = instance_with(ScriptedModule::new("echo", echo(), Probe::new())).await;
    instance.mount("/mnt/host", handler).await.unwrap();

    assert_eq!(
        instance
            .read_file_as_text("/mnt/host/from_host.txt")
            .await
            .unwrap(),
        "host data"
    );
    instance
        .write_file("/mnt/host/from_engine.txt", "engine data")
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(temp.path().join("from_engine.txt")).unwrap(),
        "engine data"
    );

    assert!(instance.unmount("/mnt/host").await.unwrap());
    assert!(!instance.file_exists("/mnt/host/from_host.txt").await.unwrap());
    assert!(!instance.unmount("/mnt/host").await.unwrap());
}

#[tokio::test]
async fn test_mount_before_initialize_is_applied_later() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("early.txt"), "early").unwrap();

    let instance = EngineInstance::new(InstanceConfig::default());
    instance
        .mount(
            "/mnt/early",
            Arc::new(HostDirMount::new(temp.path().to_str().unwrap()).unwrap()),
        )
        .await
        .unwrap();
    instance
        .initialize(ScriptedModule::new("echo", echo(), Probe::new()).boxed())
        .await
        .unwrap();

    assert_eq!(
        instance
            .read_file_as_text("/mnt/early/early.txt")
            .await
            .unwrap(),
        "early"
    );
}

#[tokio::test]
async fn test_initialize_from_loader() {
    let probe = Probe::new();
    let loader = common::ScriptedLoader::new(echo(), probe);
    let instance = EngineInstance::new(InstanceConfig::default());

    let err = instance
        .initialize_from(&loader, &sapi_api::ModuleId::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Engine(EngineError::UnknownModule(_))
    ));
    assert!(!instance.is_initialized().await);

    instance
        .initialize_from(&loader, &sapi_api::ModuleId::new("echo"))
        .await
        .unwrap();
    let response = instance.execute(Request::with_code("ok")).await.unwrap();
    assert_eq!(response.text(), "ok");
}
