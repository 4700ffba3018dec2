/// Local Execution Backend - Host Processes in a Private Slot
///
/// **Preparation:** materialize the source tree in the cache and run the
/// environment's build command in it once. A marker records the build.
///
/// **Execution:** per (task, variant)
/// 1. Copy the prepared tree into `<slot>/repo`
/// 2. Write the variant overlay over `file_path`
/// 3. Run `compile_command` if present (non-zero exit: `compile_error`)
/// 4. Run `test_command`, judged by the task's report format
///
/// Compile and test share one deadline, `request.timeout`.
use crate::engine::{
    classify, BackendError, ExecutionBackend, ExecutionOutcome, Overlay, PreparedEnvironment,
    RunRequest,
};
use crate::process::{self, ShellOutput};
use crate::source::{self, SourceCache};
use async_trait::async_trait;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use verdict_common::layout::{self, BUILD_READY_MARKER, SOURCE_READY_MARKER};
use verdict_common::{EnvironmentSpec, ExecutionStatus};

const WORKDIR: &str = "repo";

pub struct LocalBackend {
    sources: SourceCache,
    build_timeout: Duration,
    output_limit: usize,
}

impl LocalBackend {
    pub fn new(sources: SourceCache, build_timeout: Duration, output_limit: usize) -> Self {
        Self {
            sources,
            build_timeout,
            output_limit,
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn prepare(&self, spec: &EnvironmentSpec) -> Result<PreparedEnvironment, BackendError> {
        let key = layout::environment_key(spec);
        let source_dir = self.sources.materialize(spec).await?;

        let needs_build = !spec.build_command.trim().is_empty()
            && !source_dir.join(BUILD_READY_MARKER).exists();

        if needs_build {
            info!(key = %key, command = %spec.build_command, "Building environment");
            let out = process::run_shell(
                &spec.build_command,
                &source_dir,
                self.build_timeout,
                self.output_limit,
            )
            .await?;

            if !out.succeeded() {
                // Partially built trees are never reused
                if let Err(e) = fs::remove_file(source_dir.join(SOURCE_READY_MARKER)) {
                    warn!(key = %key, error = %e, "Failed to invalidate source cache");
                }
                if out.timed_out {
                    return Err(BackendError::BuildTimedOut {
                        key,
                        secs: self.build_timeout.as_secs(),
                    });
                }
                return Err(BackendError::Build {
                    key,
                    reason: format!("exit code {:?}: {}", out.exit_code, out.tail(20)),
                });
            }
            fs::write(source_dir.join(BUILD_READY_MARKER), "")?;
        }

        Ok(PreparedEnvironment {
            key,
            source_dir,
            image: None,
        })
    }

    async fn run(&self, request: RunRequest<'_>) -> Result<ExecutionOutcome, BackendError> {
        let workdir = request.slot.path.join(WORKDIR);
        let from = request.environment.source_dir.clone();
        let to = workdir.clone();
        tokio::task::spawn_blocking(move || source::copy_tree(&from, &to))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

        if let Some(overlay) = &request.overlay {
            write_overlay(&workdir, overlay)?;
        }

        let started = Instant::now();

        if let Some(compile) = request.compile_command.filter(|c| !c.trim().is_empty()) {
            let out = process::run_shell(compile, &workdir, request.timeout, self.output_limit).await?;
            if out.timed_out {
                return Ok(ExecutionOutcome::timed_out(out.stdout, out.stderr, started.elapsed()));
            }
            if out.exit_code != Some(0) {
                return Ok(finished(ExecutionStatus::CompileError, out, started));
            }
        }

        let remaining = request.timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(ExecutionOutcome::timed_out(String::new(), String::new(), started.elapsed()));
        }

        let out = process::run_shell(request.test_command, &workdir, remaining, self.output_limit).await?;
        if out.timed_out {
            return Ok(ExecutionOutcome::timed_out(out.stdout, out.stderr, started.elapsed()));
        }

        // Killed by a signal: no exit code, never a pass
        let status = match out.exit_code {
            Some(code) => classify(request.report, code, &out.stdout, &out.stderr),
            None => ExecutionStatus::Failed,
        };
        Ok(finished(status, out, started))
    }
}

fn finished(status: ExecutionStatus, out: ShellOutput, started: Instant) -> ExecutionOutcome {
    ExecutionOutcome {
        status,
        exit_code: out.exit_code,
        stdout: out.stdout,
        stderr: out.stderr,
        duration: started.elapsed(),
    }
}

/// Write overlay contents to a path inside `root`
///
/// Absolute paths and `..` components are rejected.
pub fn write_overlay(root: &Path, overlay: &Overlay) -> Result<PathBuf, BackendError> {
    let relative = Path::new(&overlay.file_path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if overlay.file_path.is_empty() || escapes {
        return Err(BackendError::Overlay {
            path: overlay.file_path.clone(),
            reason: "path must be relative to the repository root".to_string(),
        });
    }

    let target = root.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, &overlay.contents)?;
    Ok(target)
}
