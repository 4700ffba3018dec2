mod arena;
mod docker;
mod engine;
mod local;
mod manager;
mod process;
mod source;
mod telemetry;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use arena::{Arena, DirectoryArena};
use bollard::Docker;
use chrono::Utc;
use docker::{ContainerLimits, SandboxedBackend};
use engine::ExecutionBackend;
use local::LocalBackend;
use manager::{EvalOptions, TaskManager};
use source::SourceCache;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use verdict_common::layout::TELEMETRY_FILE;
use verdict_common::metrics::{self, MetricSummary};
use verdict_common::store::{self, RunManifest};
use verdict_common::{Config, EvalError, ExecutionMode, TaskRecord};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    println!("Verdict Worker booting...");

    let config = Config::from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;

    let input = env::var("VERDICT_TASKS")
        .ok()
        .or_else(|| env::args().nth(1))
        .context("No task file given: set VERDICT_TASKS or pass a path")?;
    let output_dir =
        PathBuf::from(env::var("VERDICT_OUTPUT_DIR").unwrap_or_else(|_| "outputs".to_string()));

    let mut tasks: Vec<TaskRecord> = store::read_jsonl(Path::new(&input))
        .with_context(|| format!("Failed to read task file {}", input))?;

    println!("✓ Loaded {} tasks from {}", tasks.len(), input);
    println!(
        "✓ Mode: {} (isolation: {}, parallelism: {}, timeout: {}s)",
        config.mode,
        config.isolation,
        config.parallelism,
        config.timeout.as_secs()
    );

    telemetry::init_metrics();

    let sources = SourceCache::new(&config.cache_dir, config.git_url.clone(), config.build_timeout);
    let backend: Arc<dyn ExecutionBackend> = match config.mode {
        ExecutionMode::Local => Arc::new(LocalBackend::new(
            sources,
            config.build_timeout,
            config.output_limit_bytes,
        )),
        ExecutionMode::Sandboxed => {
            let docker = Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?;
            println!("✓ Connected to Docker");
            Arc::new(SandboxedBackend::new(
                docker,
                sources,
                config.isolation,
                ContainerLimits::new(config.memory_limit_mb, config.cpu_limit),
                config.build_timeout,
                config.output_limit_bytes,
            ))
        }
    };

    let arena = Arc::new(
        DirectoryArena::new(config.scratch_dir.as_deref(), config.isolation)
            .context("Failed to create isolation arena")?,
    );
    println!(
        "✓ Isolation arena at {} ({})",
        arena.root().display(),
        arena.strategy()
    );

    let manager = TaskManager::new(backend, arena, EvalOptions::from_config(&config))?;

    // Setup graceful shutdown
    let shutdown = manager.shutdown_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            println!("\n✓ Received shutdown signal, finishing in-flight tasks...");
            shutdown.cancel();
        }
    });
    println!();

    let started_at = Utc::now();
    let outcome = manager.evaluate(&mut tasks).await;
    let finished_at = Utc::now();

    // Nothing ran, so there is nothing to write
    if matches!(
        outcome,
        Err(EvalError::DuplicateTaskId(_) | EvalError::InvalidBatch(_) | EvalError::Config(_))
    ) {
        return outcome.map(|_| ()).context("Batch rejected");
    }

    let (records, summary) = metrics::aggregate(&tasks);
    let manifest = RunManifest {
        started_at,
        finished_at,
        mode: config.mode,
        isolation: config.isolation,
        parallelism: config.parallelism,
        timeout_secs: config.timeout.as_secs(),
        num_tasks: tasks.len(),
        num_skipped: tasks.iter().filter(|t| t.skipped.is_some()).count(),
        batch_error: outcome.as_ref().err().map(|e| e.to_string()),
    };

    let stored = store::write_results(&output_dir, &tasks, &records, &summary, &manifest);
    match &stored {
        Ok(paths) => {
            println!("✓ Task records → {}", paths.task_list.display());
            println!("✓ Metric records → {}", paths.metrics.display());
            println!("✓ Summary → {}", paths.summary.display());
        }
        Err(e) => error!(dir = %output_dir.display(), error = %e, "Failed to write results"),
    }
    write_telemetry(&output_dir);

    print_summary(&summary);

    let report = outcome.context("Batch did not complete")?;
    stored.context("Results computed but not written")?;
    println!(
        "✓ Batch complete: {} attempted, {} skipped, {} workers retired",
        report.attempted, report.skipped, report.retired_workers
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("VERDICT_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn write_telemetry(output_dir: &Path) {
    let text = match telemetry::render_metrics() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to render telemetry");
            return;
        }
    };
    if let Err(e) = std::fs::write(output_dir.join(TELEMETRY_FILE), text) {
        warn!(error = %e, "Failed to write telemetry");
    }
}

fn print_summary(summary: &MetricSummary) {
    println!();
    println!("═══════════════════════════════════════════");
    println!("SUMMARY");
    println!("═══════════════════════════════════════════");
    for (name, value) in &summary.metrics {
        println!("{:<24} {:.4}", name, value);
    }
    println!("───────────────────────────────────────────");
    println!("{:<24} {}", metrics::NUM_SAMPLES, summary.num_samples);
    println!("═══════════════════════════════════════════");
    println!();
}
