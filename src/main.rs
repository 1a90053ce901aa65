use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use tender_scout::collect::{CollectRequest, TaskStatus};
use tender_scout::core::{build_orchestrator, load_scout_config, AppState};
use tender_scout::features::captcha::{CaptchaPrompt, TerminalPrompt};
use tender_scout::features::keywords::MatchMode;
use tender_scout::trace::{compile_str, TraceKind};

fn parse_port_from_args(args: &[String]) -> Option<u16> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == "--port" {
            if let Some(p) = it.next().and_then(|v| v.parse::<u16>().ok()) {
                return Some(p);
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

/// Arguments following `flag`, up to the next `--option`.
fn flag_args<'a>(args: &'a [String], flag: &str) -> Option<Vec<&'a str>> {
    let pos = args.iter().position(|a| a == flag)?;
    Some(
        args[pos + 1..]
            .iter()
            .take_while(|a| !a.starts_with("--"))
            .map(String::as_str)
            .collect(),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args: Vec<String> = std::env::args().collect();

    if let Some(rest) = flag_args(&args, "--compile") {
        return run_compile(&rest);
    }
    if let Some(rest) = flag_args(&args, "--collect") {
        return run_collect(&rest).await;
    }

    run_server(&args).await
}

/// `--compile <recording.json> <list|detail> [out.json]`
fn run_compile(args: &[&str]) -> anyhow::Result<()> {
    let (input, kind) = match args {
        [input, kind, ..] => (*input, kind.parse::<TraceKind>()?),
        _ => anyhow::bail!("usage: tender-scout --compile <recording.json> <list|detail> [out.json]"),
    };
    let output = match args.get(2) {
        Some(out) => PathBuf::from(out),
        None => default_output_path(Path::new(input), kind),
    };

    let content = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read recording {}", input))?;
    let trace = compile_str(&content, kind)?;
    trace.validate()?;

    if output.exists() {
        let backup = backup_path(&output);
        std::fs::rename(&output, &backup)
            .with_context(|| format!("failed to back up {}", output.display()))?;
        info!("existing trace backed up to {}", backup.display());
    }
    std::fs::write(&output, trace.to_json_pretty()?)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!(
        "compiled {} trace '{}' ({} steps) -> {}",
        trace.kind,
        trace.name,
        trace.steps.len(),
        output.display()
    );
    Ok(())
}

fn default_output_path(input: &Path, kind: TraceKind) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "trace".to_string());
    input.with_file_name(format!("{}_{}.json", stem, kind))
}

fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "trace".to_string());
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    path.with_file_name(format!("{}_{}.json", stem, ts))
}

/// `--collect <source_id> <keyword>...` in the foreground.
async fn run_collect(args: &[&str]) -> anyhow::Result<()> {
    let (source_id, keywords) = match args {
        [id, keywords @ ..] if !keywords.is_empty() => (
            id.parse::<u64>()
                .with_context(|| format!("invalid source id '{}'", id))?,
            keywords.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        ),
        _ => anyhow::bail!("usage: tender-scout --collect <source_id> <keyword>..."),
    };

    let config = load_scout_config();
    let prompt = TerminalPrompt::detect().map(|p| Arc::new(p) as Arc<dyn CaptchaPrompt>);
    if prompt.is_none() {
        warn!("stdin is not a terminal; CAPTCHA failures cannot be entered manually");
    }
    let orchestrator = build_orchestrator(&config, prompt).await?;

    let task = orchestrator
        .prepare(CollectRequest {
            source_id,
            keywords,
            match_mode: MatchMode::Any,
        })
        .await?;
    let finished = orchestrator.execute(task).await;

    println!(
        "{} [{}] found={} saved={}: {}",
        finished.id, finished.status, finished.found, finished.saved, finished.message
    );
    if finished.status != TaskStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_server(args: &[String]) -> anyhow::Result<()> {
    info!("Starting tender-scout");
    let config = load_scout_config();
    let port = config.resolve_port(parse_port_from_args(args));

    let state = AppState::from_config(config, None).await?;
    let app = tender_scout::api::router(state.clone());

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PORT/TENDER_SCOUT_PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("tender-scout listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    let active = state.orchestrator.registry().active_count();
    if active > 0 {
        warn!("shutting down with {} running collection task(s)", active);
    }
}
