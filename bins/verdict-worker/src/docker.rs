/// Sandboxed Execution Backend - Docker Containers
///
/// **Preparation (once per environment key):**
/// 1. Reuse `verdict-env:<key>` when the image already exists
/// 2. Otherwise pull the base image and materialize the source tree
/// 3. Run a build container: copy the tree to `/repo`, run `build_command`
/// 4. Commit the container as `verdict-env:<key>`
///
/// **Execution (one container per task variant):**
/// - Networking disabled, CPU/memory limits enforced
/// - Variant code decoded over `file_path` inside the container
/// - Compile marker distinguishes `compile_error` from test failure
/// - Killed on timeout, always force-removed
///
/// With the `overlay` strategy the committed image is the shared read-only
/// base and each container's writable layer is its private overlay; code
/// travels base64-encoded in the environment. With `ephemeral` the code is
/// staged in the worker's slot directory and bind-mounted read-only.
use crate::arena::IsolationSlot;
use crate::engine::{
    bound_output, classify, BackendError, BoundedCapture, ExecutionBackend, ExecutionOutcome,
    PreparedEnvironment, RunRequest,
};
use crate::source::SourceCache;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use verdict_common::{layout, EnvironmentSpec, ExecutionStatus, IsolationStrategy};

const REPO_DIR: &str = "/repo";
const SOURCE_MOUNT: &str = "/src";
const SLOT_MOUNT: &str = "/verdict-slot";
const STAGED_OVERLAY: &str = "overlay.src";

const COMPILE_FAILED_MARKER: &str = "::verdict::compile-failed";
const OVERLAY_FAILED_MARKER: &str = "::verdict::overlay-failed";

/// Entry script of every test container
///
/// Commands arrive through the environment so they never need quoting.
const RUN_SCRIPT: &str = r#"cd /repo || exit 125
if [ -n "${VERDICT_OVERLAY_PATH:-}" ]; then
  mkdir -p "$(dirname "$VERDICT_OVERLAY_PATH")" || { echo "::verdict::overlay-failed" >&2; exit 125; }
  if [ -n "${VERDICT_OVERLAY_FILE:-}" ]; then
    cp "$VERDICT_OVERLAY_FILE" "$VERDICT_OVERLAY_PATH"
  else
    printf '%s' "${VERDICT_OVERLAY_B64:-}" | base64 -d > "$VERDICT_OVERLAY_PATH"
  fi || { echo "::verdict::overlay-failed" >&2; exit 125; }
fi
if [ -n "${VERDICT_COMPILE:-}" ]; then
  sh -c "$VERDICT_COMPILE" || { echo "::verdict::compile-failed" >&2; exit 1; }
fi
exec sh -c "$VERDICT_TEST"
"#;

/// Entry script of environment build containers
const BUILD_SCRIPT: &str = r#"set -e
mkdir -p /repo
cp -a /src/. /repo/
rm -f /repo/.verdict-*
cd /repo
if [ -n "${VERDICT_BUILD:-}" ]; then sh -c "$VERDICT_BUILD"; fi
"#;

/// Limits applied to every container
#[derive(Debug, Clone, Copy)]
pub struct ContainerLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
}

impl ContainerLimits {
    pub fn new(memory_mb: u64, cpus: f64) -> Self {
        Self {
            memory_bytes: (memory_mb as i64).saturating_mul(1024 * 1024),
            nano_cpus: (cpus * 1_000_000_000.0) as i64,
        }
    }
}

pub struct SandboxedBackend {
    docker: Docker,
    sources: SourceCache,
    strategy: IsolationStrategy,
    limits: ContainerLimits,
    build_timeout: Duration,
    output_limit: usize,
}

impl SandboxedBackend {
    pub fn new(
        docker: Docker,
        sources: SourceCache,
        strategy: IsolationStrategy,
        limits: ContainerLimits,
        build_timeout: Duration,
        output_limit: usize,
    ) -> Self {
        Self {
            docker,
            sources,
            strategy,
            limits,
            build_timeout,
            output_limit,
        }
    }

    /// Pull `image` unless it is already present
    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn build_environment(
        &self,
        spec: &EnvironmentSpec,
        base_image: &str,
        key: &str,
    ) -> Result<(), BackendError> {
        self.ensure_image(base_image).await?;
        let source_dir = self.sources.materialize(spec).await?;
        let source_dir = tokio::fs::canonicalize(&source_dir).await?;

        let name = layout::build_container_name(key, &short_id());
        let config = Config {
            image: Some(base_image.to_string()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), BUILD_SCRIPT.to_string()]),
            env: Some(vec![format!("VERDICT_BUILD={}", spec.build_command)]),
            working_dir: Some(REPO_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}:ro", source_dir.display(), SOURCE_MOUNT)]),
                memory: Some(self.limits.memory_bytes),
                nano_cpus: Some(self.limits.nano_cpus),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        let id = container.id;

        let result = self.finish_build(&id, key).await;
        self.remove(&id).await;
        result
    }

    async fn finish_build(&self, id: &str, key: &str) -> Result<(), BackendError> {
        let run = self.run_container(id, self.build_timeout).await?;
        if run.timed_out {
            return Err(BackendError::BuildTimedOut {
                key: key.to_string(),
                secs: self.build_timeout.as_secs(),
            });
        }
        if run.exit_code != Some(0) {
            let reason = format!(
                "exit code {:?}: {}",
                run.exit_code,
                bound_output(&run.stderr, 2048)
            );
            return Err(BackendError::Build {
                key: key.to_string(),
                reason,
            });
        }

        self.docker
            .commit_container(
                CommitContainerOptions {
                    container: id,
                    repo: layout::ENV_IMAGE_REPO,
                    tag: key,
                    pause: true,
                    ..Default::default()
                },
                Config::<String> {
                    working_dir: Some(REPO_DIR.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Start a created container, follow its logs up to `timeout`, collect the exit code
    async fn run_container(&self, id: &str, timeout: Duration) -> Result<ContainerRun, BackendError> {
        let started = Instant::now();
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        let mut stdout = BoundedCapture::new(self.output_limit);
        let mut stderr = BoundedCapture::new(self.output_limit);

        let follow = async {
            let options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(id, options);
            while let Some(output) = logs.next().await {
                match output {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container = id, error = %e, "Log stream ended early");
                        break;
                    }
                }
            }
        };

        let timed_out = tokio::time::timeout(timeout, follow).await.is_err();
        if timed_out {
            debug!(container = id, "Killing container after timeout");
            if let Err(e) = self
                .docker
                .kill_container(id, None::<KillContainerOptions<String>>)
                .await
            {
                warn!(container = id, error = %e, "Failed to kill container");
            }
        }

        let exit_code = self.exit_code(id).await?;
        Ok(ContainerRun {
            exit_code: if timed_out { None } else { exit_code },
            stdout: stdout.finish(),
            stderr: stderr.finish(),
            timed_out,
            duration: started.elapsed(),
        })
    }

    async fn exit_code(&self, id: &str) -> Result<Option<i32>, BackendError> {
        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut wait = self.docker.wait_container(id, options);
        match wait.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code as i32)),
            // Non-zero exits arrive as errors from the wait endpoint
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Ok(Some(code as i32))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &str) {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        if let Err(e) = self.docker.remove_container(id, options).await {
            warn!(container = id, error = %e, "Failed to remove container");
        }
    }

    async fn stage_overlay(
        &self,
        slot: &IsolationSlot,
        contents: &str,
    ) -> Result<String, BackendError> {
        let staged = slot.path.join(STAGED_OVERLAY);
        tokio::fs::write(&staged, contents).await?;
        let slot_dir = tokio::fs::canonicalize(&slot.path).await?;
        Ok(format!("{}:{}:ro", slot_dir.display(), SLOT_MOUNT))
    }
}

/// Raw result of one container run
#[derive(Debug)]
struct ContainerRun {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    timed_out: bool,
    duration: Duration,
}

#[async_trait]
impl ExecutionBackend for SandboxedBackend {
    fn name(&self) -> &'static str {
        "sandboxed"
    }

    async fn prepare(&self, spec: &EnvironmentSpec) -> Result<PreparedEnvironment, BackendError> {
        let base_image = spec.image.as_deref().filter(|i| !i.trim().is_empty()).ok_or_else(|| {
            BackendError::Unsupported(format!(
                "sandboxed mode needs an image for {}",
                spec.repo
            ))
        })?;

        let key = layout::environment_key(spec);
        let tag = layout::environment_image(&key);

        if self.docker.inspect_image(&tag).await.is_ok() {
            debug!(key = %key, image = %tag, "Environment image cached");
        } else {
            info!(key = %key, base = base_image, "Building environment image");
            self.build_environment(spec, base_image, &key).await?;
            info!(key = %key, image = %tag, "Environment image committed");
        }

        Ok(PreparedEnvironment {
            source_dir: self.sources.environment_dir(&key).join("repo"),
            key,
            image: Some(tag),
        })
    }

    async fn run(&self, request: RunRequest<'_>) -> Result<ExecutionOutcome, BackendError> {
        let image = request.environment.image.clone().ok_or_else(|| {
            BackendError::Unsupported(format!(
                "environment {} has no image",
                request.environment.key
            ))
        })?;

        let mut env = vec![format!("VERDICT_TEST={}", request.test_command)];
        if let Some(compile) = request.compile_command.filter(|c| !c.trim().is_empty()) {
            env.push(format!("VERDICT_COMPILE={}", compile));
        }

        let mut binds = Vec::new();
        if let Some(overlay) = &request.overlay {
            env.push(format!("VERDICT_OVERLAY_PATH={}", overlay.file_path));
            match self.strategy {
                IsolationStrategy::Overlay => env.push(format!(
                    "VERDICT_OVERLAY_B64={}",
                    general_purpose::STANDARD.encode(&overlay.contents)
                )),
                IsolationStrategy::Ephemeral => {
                    binds.push(self.stage_overlay(request.slot, &overlay.contents).await?);
                    env.push(format!("VERDICT_OVERLAY_FILE={}/{}", SLOT_MOUNT, STAGED_OVERLAY));
                }
            }
        }

        let config = Config {
            image: Some(image),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), RUN_SCRIPT.to_string()]),
            env: Some(env),
            working_dir: Some(REPO_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                memory: Some(self.limits.memory_bytes),
                nano_cpus: Some(self.limits.nano_cpus),
                binds: if binds.is_empty() { None } else { Some(binds) },
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = layout::container_name(request.task_id, request.variant, &short_id());
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        let id = container.id;

        let run = self.run_container(&id, request.timeout).await;
        self.remove(&id).await;
        let run = run?;

        if run.timed_out {
            return Ok(ExecutionOutcome::timed_out(run.stdout, run.stderr, run.duration));
        }
        if run.stderr.contains(OVERLAY_FAILED_MARKER) {
            return Err(BackendError::Overlay {
                path: request
                    .overlay
                    .map(|o| o.file_path)
                    .unwrap_or_default(),
                reason: bound_output(&run.stderr, 512),
            });
        }

        let status = container_status(&run, request.report);
        Ok(ExecutionOutcome {
            status,
            exit_code: run.exit_code,
            stdout: run.stdout,
            stderr: run.stderr,
            duration: run.duration,
        })
    }
}

fn container_status(run: &ContainerRun, report: verdict_common::ReportFormat) -> ExecutionStatus {
    if run.stderr.contains(COMPILE_FAILED_MARKER) {
        return ExecutionStatus::CompileError;
    }
    match run.exit_code {
        Some(code) => classify(report, code, &run.stdout, &run.stderr),
        None => ExecutionStatus::Failed,
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
