use std::io::Read;

use analysis_core::AnalysisRequest;
use analysis_orchestrator::{AnalysisOrchestrator, OrchestratorConfig};
use anyhow::{Context, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing (stderr, so stdout carries only the response)
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    // 2. Configuration
    let config = OrchestratorConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Max batch size: {}", config.max_batch_size);
    tracing::info!("  Max concurrent requests: {}", config.max_concurrent_requests);
    tracing::info!(
        "  Batch window: {} (max {} workers)",
        config.batch_window,
        config.max_concurrent_workers
    );
    tracing::info!("  Default timeout: {}ms", config.default_timeout_ms);

    // 3. Orchestrator (starts the stale handle sweeper)
    let orchestrator = AnalysisOrchestrator::from_config(config).await?;

    // 4. One request from the first argument or stdin
    let raw = match std::env::args().nth(1) {
        Some(arg) => arg,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read request from stdin")?;
            buf
        }
    };
    let request: AnalysisRequest =
        serde_json::from_str(raw.trim()).context("request is not valid JSON")?;

    let response = orchestrator.submit(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    let stats = orchestrator.stats();
    tracing::info!(
        "Served {} request(s), cache hit rate {:.0}%, avg latency {:.1}ms",
        stats.total_requests,
        stats.cache_hit_rate * 100.0,
        stats.avg_latency_ms
    );

    if !response.success {
        drop(orchestrator);
        std::process::exit(1);
    }
    Ok(())
}
