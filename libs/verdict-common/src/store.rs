//! Result Store: record-oriented and tabular artifacts
//!
//! Pure output formatting. Per-task data is written as JSON Lines (one
//! self-describing row per task), the summary as a two-column
//! `metric,value` table. Every writer has a matching reader so artifacts
//! reload to identical values.

use crate::error::StoreError;
use crate::layout;
use crate::metrics::{MetricRecord, MetricSummary, NUM_SAMPLES};
use crate::types::{ExecutionMode, IsolationStrategy, TaskRecord};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Describes the run that produced a set of artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: ExecutionMode,
    pub isolation: IsolationStrategy,
    pub parallelism: usize,
    pub timeout_secs: u64,
    pub num_tasks: usize,
    pub num_skipped: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_error: Option<String>,
}

/// Paths of the artifacts written by [`write_results`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPaths {
    pub task_list: PathBuf,
    pub metrics: PathBuf,
    pub summary: PathBuf,
    pub manifest: PathBuf,
}

impl ResultPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            task_list: dir.join(layout::TASK_LIST_FILE),
            metrics: dir.join(layout::METRICS_FILE),
            summary: dir.join(layout::SUMMARY_FILE),
            manifest: dir.join(layout::MANIFEST_FILE),
        }
    }
}

/// Write one JSON document per line
pub fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a JSON Lines file, skipping blank lines
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

/// Write the summary as a flat `metric,value` table
///
/// Metrics appear in name order followed by `num_samples`. Values use the
/// shortest representation that parses back to the same `f64`.
pub fn write_summary(path: &Path, summary: &MetricSummary) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "metric,value")?;
    for (name, value) in &summary.metrics {
        writeln!(writer, "{},{}", name, value)?;
    }
    writeln!(writer, "{},{}", NUM_SAMPLES, summary.num_samples)?;
    writer.flush()?;
    Ok(())
}

pub fn read_summary(path: &Path) -> Result<MetricSummary, StoreError> {
    let content = fs::read_to_string(path)?;
    let mut summary = MetricSummary::default();

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        if line_no == 1 || line.trim().is_empty() {
            continue;
        }
        let (name, raw) = line.split_once(',').ok_or(StoreError::MalformedSummary {
            line: line_no,
            reason: "expected metric,value".to_string(),
        })?;

        if name == NUM_SAMPLES {
            summary.num_samples = raw.parse().map_err(|_| StoreError::MalformedSummary {
                line: line_no,
                reason: format!("num_samples is not an integer: {raw}"),
            })?;
        } else {
            let value: f64 = raw.parse().map_err(|_| StoreError::MalformedSummary {
                line: line_no,
                reason: format!("{name} is not a number: {raw}"),
            })?;
            summary.metrics.insert(name.to_string(), value);
        }
    }

    Ok(summary)
}

pub fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(path, json)?;
    Ok(())
}

/// Write every artifact of a finished batch into `dir`
pub fn write_results(
    dir: &Path,
    tasks: &[TaskRecord],
    records: &[MetricRecord],
    summary: &MetricSummary,
    manifest: &RunManifest,
) -> Result<ResultPaths, StoreError> {
    fs::create_dir_all(dir)?;
    let paths = ResultPaths::in_dir(dir);

    write_jsonl(&paths.task_list, tasks)?;
    write_jsonl(&paths.metrics, records)?;
    write_summary(&paths.summary, summary)?;
    write_manifest(&paths.manifest, manifest)?;

    Ok(paths)
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use crate::types::{ExecutionStatus, Variant, VariantOutcome};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn finished_task(id: &str, generated: ExecutionStatus) -> TaskRecord {
        let mut task = TaskRecord {
            task_id: id.to_string(),
            repo: "fake/repo".to_string(),
            test_command: "pytest".to_string(),
            variants: BTreeMap::from([(Variant::Generated, "x = 1".to_string())]),
            ..Default::default()
        };
        task.outcomes.insert(
            Variant::Generated,
            VariantOutcome {
                status: generated,
                exit_code: Some(0),
                stdout: "ok, \"quoted\"\nnext line".to_string(),
                stderr: String::new(),
                duration_ms: 7,
                detail: None,
            },
        );
        task
    }

    fn manifest(num_tasks: usize) -> RunManifest {
        let now = Utc::now();
        RunManifest {
            started_at: now,
            finished_at: now,
            mode: ExecutionMode::Local,
            isolation: IsolationStrategy::Ephemeral,
            parallelism: 2,
            timeout_secs: 60,
            num_tasks,
            num_skipped: 0,
            batch_error: None,
        }
    }

    #[test]
    fn test_metric_records_round_trip() {
        let dir = TempDir::new().unwrap();
        let tasks = vec![
            finished_task("t1", ExecutionStatus::Passed),
            finished_task("t2", ExecutionStatus::Failed),
            finished_task("t3", ExecutionStatus::Passed),
        ];
        let (records, summary) = metrics::aggregate(&tasks);

        let paths = write_results(dir.path(), &tasks, &records, &summary, &manifest(3)).unwrap();

        let records_back: Vec<MetricRecord> = read_jsonl(&paths.metrics).unwrap();
        let summary_back = read_summary(&paths.summary).unwrap();
        let tasks_back: Vec<TaskRecord> = read_jsonl(&paths.task_list).unwrap();

        assert_eq!(records_back, records);
        assert_eq!(summary_back, summary);
        assert_eq!(tasks_back, tasks);
        assert_eq!(metrics::summarize(&records_back), summary);
    }

    #[test]
    fn test_summary_round_trip_non_terminating_fraction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.csv");
        let mut summary = MetricSummary {
            num_samples: 3,
            ..Default::default()
        };
        summary.metrics.insert("pass@1".to_string(), 2.0 / 3.0);
        summary.metrics.insert("compile@1".to_string(), 1.0);

        write_summary(&path, &summary).unwrap();
        let back = read_summary(&path).unwrap();

        assert_eq!(back, summary);
    }

    #[test]
    fn test_summary_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/summary.csv");
        let mut summary = MetricSummary {
            num_samples: 4,
            ..Default::default()
        };
        summary.metrics.insert("pass@1".to_string(), 0.75);

        write_summary(&path, &summary).unwrap();
        let content = fs::read_to_string(&path).unwrap();

        assert_eq!(content, "metric,value\npass@1,0.75\nnum_samples,4\n");
    }

    #[test]
    fn test_malformed_summary_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.csv");
        fs::write(&path, "metric,value\npass@1;0.5\n").unwrap();

        let err = read_summary(&path).unwrap_err();
        assert!(matches!(err, StoreError::MalformedSummary { line: 2, .. }));
    }

    #[test]
    fn test_unwritable_destination_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a directory").unwrap();

        let result = write_summary(&blocker.join("summary.csv"), &MetricSummary::default());
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
