use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use preview_rpc::{ExecutableLoader, run_worker};

const RENDER_ENTRY_ENV: &str = "PREVIEW_RENDER_ENTRY";

#[derive(Debug, PartialEq, Eq)]
struct Args {
    worker_classpath: Option<String>,
    entry: Option<String>,
    port: u16,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: preview-host [-cp <classpath>] [<entry>] <port>");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <entry>    Entry identifier passed by the spawner (ignored)");
            eprintln!("  <port>     Loopback port of the preview orchestrator");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  -cp <classpath>    Worker classpath passed by the spawner (ignored)");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  {RENDER_ENTRY_ENV}    Render entry executable name [default: preview-render]");
            return ExitCode::from(2);
        }
    };

    init_tracing();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "Preview worker failed");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut worker_classpath = None;
    let mut positional = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "-cp" | "--classpath" => {
                i += 1;
                worker_classpath = Some(args.get(i).ok_or("-cp requires a value")?.clone());
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let port = positional.pop().ok_or("missing required argument: <port>")?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port: {port}"))?;
    let entry = positional.pop();
    if let Some(extra) = positional.first() {
        return Err(format!("unexpected argument: {extra}"));
    }

    Ok(Args {
        worker_classpath,
        entry,
        port,
    })
}

fn run(args: Args) -> anyhow::Result<()> {
    tracing::debug!(
        worker_classpath = args.worker_classpath.as_deref(),
        entry = args.entry.as_deref(),
        port = args.port,
        "Starting preview worker"
    );

    let mut loader = ExecutableLoader::new();
    if let Ok(entry) = std::env::var(RENDER_ENTRY_ENV) {
        loader = loader.with_entry(entry);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime
        .block_on(run_worker(args.port, Arc::new(loader)))
        .with_context(|| format!("worker for port {} stopped", args.port))
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PREVIEW_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("preview_rpc={level},preview_host={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
