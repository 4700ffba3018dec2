use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Code variant substituted into a task's test harness
///
/// Ordering is the evaluation order inside a task: variants are run
/// sequentially by the worker that owns the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Generated,
    GroundTruth,
    StubPass,
    StubEmpty,
    DryRun,
}

impl Variant {
    /// Returns all variants in evaluation order
    pub fn all_variants() -> &'static [Variant] {
        &[
            Variant::Generated,
            Variant::GroundTruth,
            Variant::StubPass,
            Variant::StubEmpty,
            Variant::DryRun,
        ]
    }

    /// Parse a variant name (case-insensitive)
    ///
    /// Accepts the column names used by older datasets (`gen`, `gt`,
    /// `return_pass`, `return_empty_str`) as aliases.
    pub fn from_str(s: &str) -> Option<Variant> {
        match s.trim().to_lowercase().as_str() {
            "generated" | "gen" => Some(Variant::Generated),
            "ground_truth" | "gt" => Some(Variant::GroundTruth),
            "stub_pass" | "return_pass" => Some(Variant::StubPass),
            "stub_empty" | "return_empty_str" => Some(Variant::StubEmpty),
            "dry_run" => Some(Variant::DryRun),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Generated => "generated",
            Variant::GroundTruth => "ground_truth",
            Variant::StubPass => "stub_pass",
            Variant::StubEmpty => "stub_empty",
            Variant::DryRun => "dry_run",
        }
    }

    /// Public metric name reported when this variant passes
    pub fn pass_metric(&self) -> &'static str {
        match self {
            Variant::Generated => "pass@1",
            Variant::GroundTruth => "pass_oracle@1",
            Variant::StubPass => "pass_stub_pass@1",
            Variant::StubEmpty => "pass_stub_empty_str@1",
            Variant::DryRun => "pass_dry_run@1",
        }
    }

    /// Dry runs execute the untouched source tree
    pub fn overlays_code(&self) -> bool {
        !matches!(self, Variant::DryRun)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of one (task, variant) execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Passed,
    Failed,
    CompileError,
    TimedOut,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::CompileError => "compile_error",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Error => "error",
        }
    }

    /// The candidate was accepted by the toolchain and the tests started
    pub fn reached_tests(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Passed | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where test commands run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Inside a container built from the task's image
    Sandboxed,
    /// Directly on the host, inside the worker's scratch directory
    Local,
}

impl ExecutionMode {
    pub fn from_str(s: &str) -> Option<ExecutionMode> {
        match s.trim().to_lowercase().as_str() {
            "sandboxed" | "docker" => Some(ExecutionMode::Sandboxed),
            "local" => Some(ExecutionMode::Local),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sandboxed => write!(f, "sandboxed"),
            ExecutionMode::Local => write!(f, "local"),
        }
    }
}

/// How a worker's slot keeps concurrent executions apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationStrategy {
    /// Private writable directory per slot, wiped between executions
    Ephemeral,
    /// Shared read-only environment image with a private writable layer
    Overlay,
}

impl IsolationStrategy {
    pub fn from_str(s: &str) -> Option<IsolationStrategy> {
        match s.trim().to_lowercase().as_str() {
            "ephemeral" => Some(IsolationStrategy::Ephemeral),
            "overlay" => Some(IsolationStrategy::Overlay),
            _ => None,
        }
    }
}

impl fmt::Display for IsolationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationStrategy::Ephemeral => write!(f, "ephemeral"),
            IsolationStrategy::Overlay => write!(f, "overlay"),
        }
    }
}

/// How raw test output becomes a verdict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    ExitCode,
    Pytest,
    Cargo,
}

/// Recorded result of one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantOutcome {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl VariantOutcome {
    /// Outcome for an execution that never produced process output
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            detail: Some(detail.into()),
        }
    }

    /// Copy with the timing field zeroed, for comparing runs
    pub fn without_timing(&self) -> Self {
        Self {
            duration_ms: 0,
            ..self.clone()
        }
    }
}

/// Identity of a prepared execution environment
///
/// Tasks sharing all four fields share one preparation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub repo: String,
    pub base_commit: String,
    pub image: Option<String>,
    pub build_command: String,
}

/// Task Record (inputs immutable, outputs written once by the owning worker)
///
/// ## Lifecycle:
/// - Created by the caller from a dataset
/// - Moved into the Task Manager, owned by exactly one worker at a time
/// - Outputs written through [`TaskRecord::record_outputs`] only
/// - Handed back to the caller for aggregation and serialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub repo: String,
    #[serde(default)]
    pub base_commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub build_command: String,
    pub test_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_command: Option<String>,
    #[serde(default)]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_context: Option<String>,
    #[serde(default)]
    pub report: ReportFormat,
    #[serde(default)]
    pub variants: BTreeMap<Variant, String>,
    /// Caller data carried through untouched
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outcomes: BTreeMap<Variant, VariantOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pipeline-owned part of a task record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutputs {
    pub outcomes: BTreeMap<Variant, VariantOutcome>,
    pub skipped: Option<String>,
    pub error: Option<String>,
}

impl TaskOutputs {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: Some(reason.into()),
            ..Default::default()
        }
    }
}

impl TaskRecord {
    pub fn environment_spec(&self) -> EnvironmentSpec {
        EnvironmentSpec {
            repo: self.repo.clone(),
            base_commit: self.base_commit.clone(),
            image: self.image.clone(),
            build_command: self.build_command.clone(),
        }
    }

    /// Full file contents written for a variant's code
    ///
    /// With contexts present the code is spliced between them, otherwise it
    /// replaces the file.
    pub fn overlay_contents(&self, code: &str) -> String {
        let left = self.left_context.as_deref().unwrap_or_default();
        let right = self.right_context.as_deref().unwrap_or_default();
        let mut contents = String::with_capacity(left.len() + code.len() + right.len());
        contents.push_str(left);
        contents.push_str(code);
        contents.push_str(right);
        contents
    }

    /// Variants of this task selected by `requested`, in evaluation order
    pub fn requested_variants(&self, requested: &[Variant]) -> Vec<Variant> {
        self.variants
            .keys()
            .copied()
            .filter(|v| requested.contains(v))
            .collect()
    }

    /// Single write point for pipeline outputs
    pub fn record_outputs(&mut self, outputs: TaskOutputs) {
        self.outcomes = outputs.outcomes;
        self.skipped = outputs.skipped;
        self.error = outputs.error;
    }

    pub fn is_attempted(&self) -> bool {
        self.skipped.is_none() && !self.outcomes.is_empty()
    }

    /// Why this task cannot be dispatched with `requested` variants, if at all
    pub fn skip_reason(&self, requested: &[Variant]) -> Option<&'static str> {
        if self.task_id.trim().is_empty() {
            return Some("missing task id");
        }
        if self.test_command.trim().is_empty() {
            return Some("missing test command");
        }
        let variants = self.requested_variants(requested);
        if variants.is_empty() {
            return Some("no requested variants");
        }
        if self.file_path.trim().is_empty() && variants.iter().any(|v| v.overlays_code()) {
            return Some("missing file path");
        }
        None
    }
}
