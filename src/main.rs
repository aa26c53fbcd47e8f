mod academic;
mod analytics;
mod bundle;
mod certificates;
mod db;
mod filters;
mod grade_import;
mod incidents;
mod ipc;
mod model;
mod text;
mod trajectory;

use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// School records sidecar: reads one JSON request per line on stdin and writes
/// one JSON response per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "escolad", version)]
struct Args {
    /// Workspace directory to open at startup.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Log level used when ESCOLAD_LOG is not set.
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("ESCOLAD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    // stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = init_tracing(&args.log_level) {
        eprintln!("escolad: {e:#}");
    }

    let mut state = ipc::AppState::default();
    if let Some(path) = args.workspace {
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            tracing::error!(error = %e, "failed to open startup workspace");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer with.
                tracing::warn!(error = %e, "bad request line");
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
