/// Execution Backend - Abstraction for Running Task Tests
///
/// **Core Responsibility:**
/// Prepare an environment once, then run a task's test command against a
/// variant overlay as many times as asked, capturing raw outcomes.
///
/// **Critical Architectural Boundary:**
/// - Backend knows HOW to execute (local processes, Docker containers)
/// - Backend does NOT know metric names or aggregation
/// - Backend does NOT schedule work or own isolation slots
/// - Backend enforces the per-execution timeout and reclaims what it started
///
/// Implementations: `LocalBackend` (host processes) and `SandboxedBackend`
/// (Docker), selected from configuration in `main`.
use crate::arena::IsolationSlot;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use verdict_common::report::{self, TestVerdict};
use verdict_common::{EnvironmentSpec, ExecutionStatus, ReportFormat, Variant};

/// Raw outcome of one (task, variant) execution
/// Produced by a backend, translated into the task record by the Task Manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn timed_out(stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            status: ExecutionStatus::TimedOut,
            exit_code: None,
            stdout,
            stderr,
            duration,
        }
    }
}

/// Environment ready to run tests, shared read-only by all workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEnvironment {
    pub key: String,
    /// Cached source tree on the host
    pub source_dir: PathBuf,
    /// Committed image holding the built environment (sandboxed mode)
    pub image: Option<String>,
}

/// Candidate code written over one file of the source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    pub file_path: String,
    pub contents: String,
}

/// Everything a backend needs for one execution
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub task_id: &'a str,
    pub variant: Variant,
    pub environment: &'a PreparedEnvironment,
    pub slot: &'a IsolationSlot,
    pub test_command: &'a str,
    pub compile_command: Option<&'a str>,
    /// `None` runs the untouched tree (dry run)
    pub overlay: Option<Overlay>,
    pub report: ReportFormat,
    pub timeout: Duration,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("source checkout failed for {repo}: {reason}")]
    Source { repo: String, reason: String },

    #[error("environment build failed for {key}: {reason}")]
    Build { key: String, reason: String },

    #[error("environment build for {key} timed out after {secs}s")]
    BuildTimedOut { key: String, secs: u64 },

    #[error("{0}")]
    Unsupported(String),

    #[error("overlay of {path} failed: {reason}")]
    Overlay { path: String, reason: String },

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Execution backend capability
///
/// Any implementation must guarantee:
/// 1. `prepare` is idempotent for the same spec
/// 2. `run` respects `request.timeout` and terminates what it started
/// 3. Build failures of the candidate are reported as `compile_error`
/// 4. Captured output is bounded, with truncation marked
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn prepare(&self, spec: &EnvironmentSpec) -> Result<PreparedEnvironment, BackendError>;

    async fn run(&self, request: RunRequest<'_>) -> Result<ExecutionOutcome, BackendError>;
}

/// Status of a completed test command
pub fn classify(report_format: ReportFormat, exit_code: i32, stdout: &str, stderr: &str) -> ExecutionStatus {
    match report::judge(report_format, exit_code, stdout, stderr) {
        TestVerdict::Passed => ExecutionStatus::Passed,
        TestVerdict::Failed => ExecutionStatus::Failed,
        TestVerdict::CompileError => ExecutionStatus::CompileError,
    }
}

/// Output capture that keeps the last `limit` bytes of a stream
///
/// Test runners print their summary at the end, so the tail is kept and the
/// omitted head is replaced by a marker line.
#[derive(Debug)]
pub struct BoundedCapture {
    limit: usize,
    buf: Vec<u8>,
    dropped: usize,
}

impl BoundedCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        // Compact lazily so pushes stay amortized O(n)
        if self.buf.len() > self.limit.saturating_mul(2).max(4096) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.dropped += excess;
        }
    }

    pub fn finish(mut self) -> String {
        self.compact();
        let text = String::from_utf8_lossy(&self.buf);
        if self.dropped == 0 {
            text.into_owned()
        } else {
            format!("{}{}", truncation_marker(self.dropped), text)
        }
    }
}

pub fn truncation_marker(dropped: usize) -> String {
    format!("[verdict: output truncated, {} bytes omitted]\n", dropped)
}

/// Bound an already collected string
pub fn bound_output(text: &str, limit: usize) -> String {
    let mut capture = BoundedCapture::new(limit);
    capture.push(text.as_bytes());
    capture.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_under_limit_untouched() {
        let mut capture = BoundedCapture::new(64);
        capture.push(b"hello ");
        capture.push(b"world");
        assert_eq!(capture.finish(), "hello world");
    }

    #[test]
    fn test_capture_keeps_tail_with_marker() {
        let mut capture = BoundedCapture::new(10);
        for _ in 0..1000 {
            capture.push(b"0123456789");
        }
        capture.push(b"== 1 passed");
        let text = capture.finish();

        assert!(text.starts_with("[verdict: output truncated, 10001 bytes omitted]\n"));
        assert!(text.ends_with(" 1 passed"));
        assert_eq!(text.len(), truncation_marker(10001).len() + 10);
    }

    #[test]
    fn test_bound_output_exact_limit() {
        assert_eq!(bound_output("abcdef", 6), "abcdef");
        assert_eq!(
            bound_output("abcdefgh", 6),
            format!("{}cdefgh", truncation_marker(2))
        );
    }

    #[test]
    fn test_bound_output_zero_limit() {
        assert_eq!(bound_output("abc", 0), truncation_marker(3));
    }

    #[test]
    fn test_classify_maps_verdicts() {
        assert_eq!(classify(ReportFormat::ExitCode, 0, "", ""), ExecutionStatus::Passed);
        assert_eq!(classify(ReportFormat::ExitCode, 3, "", ""), ExecutionStatus::Failed);
        assert_eq!(
            classify(ReportFormat::Pytest, 2, "==== 1 error in 0.1s ====", ""),
            ExecutionStatus::CompileError
        );
    }
}
