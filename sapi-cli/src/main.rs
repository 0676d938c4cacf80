//! sapi: run one request through a wasm script engine
//!
//! ```text
//! sapi --engine engine.wasm --code 'echo "hi";'
//! sapi --engine engine.wasm --script ./index.code --uri '/?page=2' -H 'Accept: text/html'
//! sapi --engine engine.wasm --script ./app.code --mount ./public:/var/www/public --json
//! ```

mod logging;

use anyhow::{bail, Context};
use clap::Parser;
use logging::{LogConfig, LogFormat};
use sapi_api::{Request, Response};
use sapi_host::{
    HostDirMount, InstanceConfig, ModuleInstanceFactory, PoolConfig, ProcessPool,
    WasmLoaderConfig, WasmModuleLoader,
};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "sapi", version, about = "Run a request through a wasm script engine")]
struct Cli {
    /// Engine module (.wasm, or .wat text)
    #[arg(long, env = "SAPI_ENGINE")]
    engine: PathBuf,

    /// Inline source to execute
    #[arg(long, conflicts_with = "script", required_unless_present = "script")]
    code: Option<String>,

    /// Host script file, copied into the document root before execution
    #[arg(long)]
    script: Option<PathBuf>,

    /// Request URI, with optional query string
    #[arg(long, default_value = "/")]
    uri: String,

    #[arg(long, short = 'X', default_value = "GET")]
    method: String,

    /// Request header as `Name: value`; repeatable
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,

    /// Request body
    #[arg(long, short = 'd')]
    body: Option<String>,

    /// Environment variable as `KEY=value`; repeatable
    #[arg(long = "env", short = 'e')]
    env: Vec<String>,

    /// Host directory mount as `HOST:GUEST`; repeatable
    #[arg(long = "mount", short = 'm')]
    mounts: Vec<String>,

    #[arg(long, env = "SAPI_DOCUMENT_ROOT", default_value = "/var/www")]
    document_root: String,

    /// Server interface name handed to the engine
    #[arg(long, default_value = "cli")]
    sapi_name: String,

    /// Fuel budget per engine call; 0 disables metering
    #[arg(long, env = "SAPI_FUEL")]
    fuel: Option<u64>,

    /// Overrides SAPI_MAX_INSTANCES
    #[arg(long)]
    max_instances: Option<usize>,

    /// Print status and headers before the body
    #[arg(long, short = 'i')]
    include: bool,

    /// Print the whole response as JSON
    #[arg(long, conflicts_with = "include")]
    json: bool,

    /// Log filter directive (default: RUST_LOG, then warn)
    #[arg(long, env = "SAPI_LOG")]
    log: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_config = LogConfig {
        level: cli.log.clone(),
        format: cli.log_format,
        ..LogConfig::default()
    };
    if let Err(e) = logging::init(&log_config) {
        eprintln!("warning: logging disabled: {e}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut loader_config = WasmLoaderConfig::default();
    if let Some(fuel) = cli.fuel {
        loader_config.fuel_limit = (fuel > 0).then_some(fuel);
    }
    let loader = Arc::new(WasmModuleLoader::new(loader_config)?);
    let module = loader
        .register_file(&cli.engine)
        .await
        .with_context(|| format!("loading engine {}", cli.engine.display()))?;

    let mut pool_config = PoolConfig::from_env();
    if let Some(max) = cli.max_instances {
        pool_config.max_instances = max;
    }
    let instance_config = InstanceConfig {
        sapi_name: cli.sapi_name.clone(),
        document_root: cli.document_root.clone(),
        ..InstanceConfig::default()
    };
    let pool = ProcessPool::new(
        ModuleInstanceFactory::new(loader, module, instance_config),
        pool_config,
    );

    let result = execute(&pool, &cli).await;
    pool.shutdown().await?;
    let response = result?;

    print_response(&cli, &response)?;
    Ok(exit_code(response.exit_code))
}

/// Run the request on the pool's primary instance
///
/// Execution failures still yield their partial response.
async fn execute(pool: &ProcessPool, cli: &Cli) -> anyhow::Result<Response> {
    let instance = pool.get_primary().await?;

    for spec in &cli.mounts {
        let (host, guest) = parse_mount(spec)?;
        let handler = HostDirMount::new(host).with_context(|| format!("mount {spec}"))?;
        instance.mount(guest, Arc::new(handler)).await?;
    }

    let mut request = match (&cli.code, &cli.script) {
        (Some(code), _) => Request::with_code(code.as_str()),
        (None, Some(script)) => {
            let source = tokio::fs::read(script)
                .await
                .with_context(|| format!("reading {}", script.display()))?;
            let name = script
                .file_name()
                .and_then(|name| name.to_str())
                .context("script path has no file name")?;
            let guest_path = format!("{}/{}", cli.document_root.trim_end_matches('/'), name);
            instance.write_file(&guest_path, source).await?;
            Request::with_script(guest_path)
        }
        (None, None) => bail!("either --code or --script is required"),
    };
    request = request.method(cli.method.as_str()).uri(cli.uri.as_str());
    for header in &cli.headers {
        let (name, value) = parse_header(header)?;
        request = request.header(name, value);
    }
    for var in &cli.env {
        let (key, value) = var
            .split_once('=')
            .with_context(|| format!("invalid env var '{var}', expected KEY=value"))?;
        request = request.env(key, value);
    }
    if let Some(body) = &cli.body {
        request = request.body(body.as_bytes().to_vec());
    }

    match instance.execute(request).await {
        Ok(response) => Ok(response),
        Err(e) => match e.response() {
            Some(response) => {
                tracing::debug!(error = %e, "Execution failed");
                Ok(response.clone())
            }
            None => Err(e.into()),
        },
    }
}

fn print_response(cli: &Cli, response: &Response) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    if cli.json {
        let value = serde_json::json!({
            "status": response.status,
            "headers": response.headers,
            "body": response.text(),
            "errors": response.errors,
            "exit_code": response.exit_code,
        });
        serde_json::to_writer_pretty(&mut stdout, &value)?;
        writeln!(stdout)?;
        return Ok(());
    }

    if cli.include {
        writeln!(stdout, "Status: {}", response.status)?;
        for (name, values) in &response.headers {
            for value in values {
                writeln!(stdout, "{name}: {value}")?;
            }
        }
        writeln!(stdout)?;
    }
    stdout.write_all(&response.body)?;
    stdout.flush()?;
    if !response.errors.is_empty() {
        eprint!("{}", response.errors);
    }
    Ok(())
}

fn parse_header(spec: &str) -> anyhow::Result<(&str, &str)> {
    match spec.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => bail!("invalid header '{spec}', expected 'Name: value'"),
    }
}

fn parse_mount(spec: &str) -> anyhow::Result<(&str, &str)> {
    match spec.rsplit_once(':') {
        Some((host, guest)) if !host.is_empty() && guest.starts_with('/') => Ok((host, guest)),
        _ => bail!("invalid mount '{spec}', expected HOST:/guest/path"),
    }
}

/// Process exit status for an engine exit code
fn exit_code(code: i32) -> ExitCode {
    match code {
        0 => ExitCode::SUCCESS,
        1..=255 => ExitCode::from(code as u8),
        _ => ExitCode::FAILURE,
    }
}
