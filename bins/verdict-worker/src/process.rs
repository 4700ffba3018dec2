//! Host process execution with a hard deadline
//!
//! Commands run through `sh -c` in their own process group so a timeout can
//! take down everything the test command spawned, not only the shell.

use crate::engine::BoundedCapture;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::warn;

/// Readers get this long to drain pipes after the process is gone
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// `None` when the process was killed or ended by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ShellOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Last lines of combined output, for error details
    pub fn tail(&self, lines: usize) -> String {
        let combined = format!("{}\n{}", self.stdout, self.stderr);
        let kept: Vec<&str> = combined
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}

/// Run `command` in `cwd`, killing its process group after `timeout`
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    output_limit: usize,
) -> std::io::Result<ShellOutput> {
    run_program("sh", &["-c", command], cwd, timeout, output_limit).await
}

/// Run a program with explicit arguments, no shell involved
pub async fn run_program(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
    output_limit: usize,
) -> std::io::Result<ShellOutput> {
    let started = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let stdout_reader = child.stdout.take().map(|s| spawn_reader(s, output_limit));
    let stderr_reader = child.stderr.take().map(|s| spawn_reader(s, output_limit));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            if let Some(pid) = pid {
                kill_group(pid).await;
            }
            let _ = child.kill().await;
            (None, true)
        }
    };

    let stdout = collect(stdout_reader).await;
    let stderr = collect(stderr_reader).await;

    Ok(ShellOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: started.elapsed(),
    })
}

fn spawn_reader<R>(mut stream: R, limit: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut capture = BoundedCapture::new(limit);
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => capture.push(&chunk[..n]),
            }
        }
        capture.finish()
    })
}

/// A grandchild holding the pipe open must not stall the worker
async fn collect(reader: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader failed");
            String::new()
        }
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[cfg(unix)]
async fn kill_group(pid: u32) {
    let status = Command::new("kill")
        .arg("-KILL")
        .arg(format!("-{}", pid))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!(pid, error = %e, "Failed to kill process group");
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: u32) {}
