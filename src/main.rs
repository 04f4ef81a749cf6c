//! dream-decoder server binary
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:8000, 100 requests per 60 s per client
//! cargo run --bin dream-decoder
//!
//! # Explicit config file, port override
//! cargo run --bin dream-decoder -- --config dream-decoder.toml --port 9000
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter
//! - `HUGGINGFACE_API_KEY`, `OPENAI_API_KEY`, `STABILITY_API_KEY` — image providers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dream_decoder::config::{loader::load_from_file, DecoderConfig};
use dream_decoder::history::HistoryCache;
use dream_decoder::web_api::{start_server, AppState};
use dream_decoder::{init_tracing, metrics, MemoryStore, RequestPipeline};
use tracing::{info, warn};

/// How long shutdown waits for persistence and image tasks.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed CLI arguments.
struct Args {
    /// Optional TOML config file.
    config: Option<PathBuf>,
    /// Overrides `server.port`.
    port: Option<u16>,
}

/// Parse CLI arguments from `std::env::args()`.
///
/// # Returns
///
/// - `Ok(Args)` on success
/// - `Err(String)` with a usage message on failure
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut port = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a value".to_string());
                }
                config = Some(PathBuf::from(&args[i]));
            }
            "--port" | "-p" => {
                i += 1;
                if i >= args.len() {
                    return Err("--port requires a value".to_string());
                }
                port = Some(
                    args[i]
                        .parse::<u16>()
                        .map_err(|_| format!("invalid port: {}", args[i]))?,
                );
            }
            "--help" | "-h" => {
                return Err(usage());
            }
            other => {
                return Err(format!("unknown argument: {other}\n{}", usage()));
            }
        }
        i += 1;
    }

    Ok(Args { config, port })
}

fn usage() -> String {
    [
        "Usage: dream-decoder [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   TOML config file (default: built-in defaults)",
        "  --port, -p <N>        Listen port, overrides server.port",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

#[tokio::main]
async fn main() {
    let _ = init_tracing();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    let mut config = match &args.config {
        Some(path) => match load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Configuration error: {e}");
                std::process::exit(1);
            }
        },
        None => DecoderConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if let Err(e) = metrics::init_metrics() {
        warn!(error = %e, "metrics registry unavailable");
    }

    let store = Arc::new(MemoryStore::with_capacity(config.history.max_records));
    let pipeline = RequestPipeline::from_config(&config, store.clone());
    let history = Arc::new(HistoryCache::from_config(store, &config.history));

    let sweeper = pipeline
        .gate()
        .spawn_sweeper(config.rate_limit.sweep_interval());

    let providers: Vec<String> = pipeline
        .providers()
        .availability()
        .into_iter()
        .filter(|p| p.configured)
        .map(|p| p.name)
        .collect();
    info!(
        workers = config.offload.workers,
        rate_limit = config.rate_limit.requests_per_window,
        window_secs = config.rate_limit.window_secs,
        providers = ?providers,
        "dream-decoder starting"
    );

    let state = Arc::new(AppState::new(pipeline.clone(), history, config.server.clone()));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };

    let served = start_server(state, shutdown).await;

    sweeper.abort();
    if !pipeline.background().wait_idle(DRAIN_TIMEOUT).await {
        let stats = pipeline.background().stats();
        warn!(in_flight = stats.in_flight, "background tasks still running at shutdown");
    }
    pipeline.scheduler().shutdown();

    if let Err(e) = served {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
    info!("dream-decoder stopped");
}
