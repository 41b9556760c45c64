//! Novira Smoke Harness
//!
//! Installs the cache worker against the live network, then routes every URL
//! given on the command line through it and prints one JSON line per
//! request. Run more than one pass to see what the cache answers the second
//! time round.
//!
//! ```text
//! novira-smoke [--config novira.json] [--navigate] [--passes N] [--json-logs] URL...
//! ```

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use novira_common::{try_init_logging, LogConfig, NoviraError, OptionExt, Result, ResultExt};
use novira_core::NoviraConfig;
use novira_net::{Fetcher, HttpFetcher, Request};
use novira_sw::ServiceWorkerContainer;
use serde_json::json;
use tracing::{error, info};

/// Parse command line arguments
struct Args {
    config: Option<String>,
    navigate: bool,
    passes: u32,
    json_logs: bool,
    urls: Vec<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;
        let mut navigate = false;
        let mut passes = 2u32;
        let mut json_logs = false;
        let mut urls = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config = args.next();
                }
                "--navigate" => {
                    navigate = true;
                }
                "--passes" => {
                    if let Some(val) = args.next() {
                        passes = val.parse().unwrap_or(2).max(1);
                    }
                }
                "--json-logs" => {
                    json_logs = true;
                }
                _ => urls.push(arg),
            }
        }

        Self {
            config,
            navigate,
            passes,
            json_logs,
            urls,
        }
    }
}

fn round_ms(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}

async fn run(args: Args) -> Result<()> {
    let config = match args.config {
        Some(ref path) => NoviraConfig::load(path)?,
        None => NoviraConfig::default(),
    };
    config.validate()?;

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config.net)?);
    let (container, _events) = ServiceWorkerContainer::new(&config, fetcher)?;

    let started = Instant::now();
    let check = container.register(config.worker.clone()).await?;
    info!(
        ?check,
        store = %config.worker.store_name(),
        elapsed_ms = round_ms(started.elapsed().as_secs_f64() * 1000.0),
        "Worker registered"
    );

    let origin = config.worker.origin_url()?;
    let active = container.active().await.ok_or_not_found("active worker")?;
    let mut out = std::io::stdout().lock();

    for pass in 1..=args.passes {
        for raw in &args.urls {
            let url = origin
                .join(raw)
                .map_err_to(|| NoviraError::InvalidArgument(raw.clone()))?;
            let request = if args.navigate {
                Request::navigate(url)
            } else {
                Request::get(url)
            };
            let policy = active.worker().router().classify(&request);
            let target = request.url.to_string();

            let started = Instant::now();
            let result = container.fetch(request).await;
            let elapsed_ms = round_ms(started.elapsed().as_secs_f64() * 1000.0);

            let line = match result {
                Ok(response) => json!({
                    "pass": pass,
                    "url": target,
                    "policy": policy.as_str(),
                    "status": response.status.as_u16(),
                    "from_cache": response.is_from_cache(),
                    "bytes": response.body.len(),
                    "elapsed_ms": elapsed_ms,
                }),
                Err(e) => json!({
                    "pass": pass,
                    "url": target,
                    "policy": policy.as_str(),
                    "error": e.to_string(),
                    "elapsed_ms": elapsed_ms,
                }),
            };
            writeln!(out, "{}", line).context("writing result line")?;
        }

        container.drain_background().await;
    }

    writeln!(out, "{}", json!({ "caches": container.cache_names().await }))
        .context("writing cache summary")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_config = if args.json_logs {
        LogConfig::production()
    } else {
        LogConfig::from_env()
    };
    if let Err(e) = try_init_logging(log_config) {
        eprintln!("Warning: logging not initialized: {}", e);
    }

    if args.urls.is_empty() {
        eprintln!(
            "usage: novira-smoke [--config FILE] [--navigate] [--passes N] [--json-logs] URL..."
        );
        return ExitCode::from(2);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, category = e.category(), "Smoke run failed");
            ExitCode::FAILURE
        }
    }
}
