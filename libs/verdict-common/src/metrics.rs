/// Metrics Aggregator - Order-Independent Scoring
///
/// **Core Responsibility:**
/// Map per-variant outcomes of a finished batch to named metrics, then
/// reduce them to corpus-level rates.
///
/// **Critical Properties:**
/// - Knows nothing about Docker, processes or workers
/// - Pure function: (task records) → (metric records, summary)
/// - Independent of completion order: sums are exact counts, divided once
///
/// **Metric Rules:**
/// - `<variant pass metric>` = 1.0 if that variant passed, else 0.0
/// - `compile@1` = 1.0 if the generated variant reached its tests
/// - `execution_success` = 1.0 if no evaluated variant ended in `error`
/// - Skipped tasks are logged and excluded from records and `num_samples`
use crate::types::{ExecutionStatus, TaskRecord, Variant};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

pub const NUM_SAMPLES: &str = "num_samples";
pub const EXECUTION_SUCCESS: &str = "execution_success";
pub const COMPILE_AT_1: &str = "compile@1";

/// Metrics of one attempted task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub task_id: String,
    pub metrics: BTreeMap<String, f64>,
    pub statuses: BTreeMap<Variant, ExecutionStatus>,
}

/// Aggregate over a finished batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metrics: BTreeMap<String, f64>,
    pub num_samples: usize,
}

impl MetricSummary {
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).copied()
    }
}

/// Metric record for one task, `None` when the task was never attempted
pub fn task_metrics(task: &TaskRecord) -> Option<MetricRecord> {
    if !task.is_attempted() {
        return None;
    }

    let mut metrics = BTreeMap::new();
    let mut statuses = BTreeMap::new();
    let mut any_error = false;

    for (variant, outcome) in &task.outcomes {
        let passed = outcome.status == ExecutionStatus::Passed;
        metrics.insert(variant.pass_metric().to_string(), indicator(passed));
        statuses.insert(*variant, outcome.status);
        any_error |= outcome.status == ExecutionStatus::Error;

        if *variant == Variant::Generated {
            metrics.insert(
                COMPILE_AT_1.to_string(),
                indicator(outcome.status.reached_tests()),
            );
        }
    }
    metrics.insert(EXECUTION_SUCCESS.to_string(), indicator(!any_error));

    Some(MetricRecord {
        task_id: task.task_id.clone(),
        metrics,
        statuses,
    })
}

/// Evaluate a finished batch into per-task records and a summary
///
/// Records keep the order of `tasks`; the summary does not depend on it.
pub fn aggregate(tasks: &[TaskRecord]) -> (Vec<MetricRecord>, MetricSummary) {
    let mut records = Vec::with_capacity(tasks.len());

    for task in tasks {
        match task_metrics(task) {
            Some(record) => records.push(record),
            None => {
                info!(
                    task_id = %task.task_id,
                    reason = task.skipped.as_deref().unwrap_or("no outcomes recorded"),
                    "Task excluded from num_samples"
                );
            }
        }
    }

    let summary = summarize(&records);
    (records, summary)
}

/// Reduce metric records to their means
///
/// A metric present on only some records is averaged over those records;
/// `num_samples` counts every record.
pub fn summarize(records: &[MetricRecord]) -> MetricSummary {
    // (sum, count) per metric; values are 0.0/1.0 so sums are exact in any order
    let mut totals: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for record in records {
        for (name, value) in &record.metrics {
            let entry = totals.entry(name.as_str()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    let metrics = totals
        .into_iter()
        .map(|(name, (sum, count))| (name.to_string(), sum / count as f64))
        .collect();

    MetricSummary {
        metrics,
        num_samples: records.len(),
    }
}

fn indicator(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}
