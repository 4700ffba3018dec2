// CLI commands for preparing task files and re-rendering results
use anyhow::{bail, Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use verdict_common::layout::{REPORT_FILE, SUMMARY_FILE};
use verdict_common::metrics::{self, NUM_SAMPLES};
use verdict_common::prepare::prepare_task;
use verdict_common::store;
use verdict_common::{ExecutionStatus, MetricRecord, MetricSummary, TaskRecord, Variant};

const REPORT_TEMPLATE: &str = r#"# {{title}}

Samples evaluated: **{{num_samples}}**

| metric | value |
|--------|-------|
{{#each metrics}}
| {{name}} | {{value}} |
{{/each}}

## Outcomes by variant

| variant | passed | failed | timed_out | compile_error | error |
|---------|--------|--------|-----------|---------------|-------|
{{#each variants}}
| {{name}} | {{passed}} | {{failed}} | {{timed_out}} | {{compile_error}} | {{error}} |
{{/each}}
"#;

/// Problems found in a task file
#[derive(Debug, Default, PartialEq)]
pub struct Validation {
    pub duplicates: Vec<String>,
    /// (line number, task id, reason)
    pub skipped: Vec<(usize, String, &'static str)>,
}

impl Validation {
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Serialize)]
struct MetricRow {
    name: String,
    value: String,
}

#[derive(Serialize, Default)]
struct VariantRow {
    name: &'static str,
    passed: usize,
    failed: usize,
    timed_out: usize,
    compile_error: usize,
    error: usize,
}

#[derive(Serialize)]
struct ReportData<'a> {
    title: &'a str,
    num_samples: usize,
    metrics: Vec<MetricRow>,
    variants: Vec<VariantRow>,
}

/// Fill stub and dry-run variants and clean generated code
pub async fn prepare(input: &str, output: &str, language: Option<&str>, dry_run: bool) -> Result<()> {
    println!("🔧 Preparing tasks from {}", input);

    let mut tasks: Vec<TaskRecord> = store::read_jsonl(Path::new(input))
        .with_context(|| format!("Failed to read task file {}", input))?;

    for task in tasks.iter_mut() {
        prepare_task(task, language, dry_run);
    }

    store::write_jsonl(Path::new(output), &tasks)
        .with_context(|| format!("Failed to write task file {}", output))?;

    let with_stubs = tasks
        .iter()
        .filter(|t| t.variants.contains_key(&Variant::StubPass))
        .count();
    println!("✓ Prepared {} tasks ({} with stub variants)", tasks.len(), with_stubs);
    if dry_run {
        println!("✓ Added dry_run variant");
    }
    println!("✅ Wrote {}", output);

    Ok(())
}

/// Check a task file for duplicate ids and tasks that would be skipped
pub async fn validate(input: &str, variants: &[Variant]) -> Result<()> {
    println!("🔍 Validating {}", input);

    let tasks: Vec<TaskRecord> = store::read_jsonl(Path::new(input))
        .with_context(|| format!("Failed to read task file {}", input))?;
    let validation = validate_tasks(&tasks, variants);

    for id in &validation.duplicates {
        println!("  ✗ duplicate task id: {}", id);
    }
    for (line, id, reason) in &validation.skipped {
        println!("  ⚠ line {} ({}): {}", line, display_id(id), reason);
    }

    if validation.is_clean() {
        println!("✓ No problems found");
    }
    if !validation.duplicates.is_empty() {
        bail!(
            "{} duplicate task id(s); the batch would be rejected",
            validation.duplicates.len()
        );
    }

    let runnable = tasks.len() - validation.skipped.len();
    println!("✅ {} of {} tasks runnable", runnable, tasks.len());
    Ok(())
}

pub fn validate_tasks(tasks: &[TaskRecord], variants: &[Variant]) -> Validation {
    let mut validation = Validation::default();
    let mut seen: HashMap<&str, usize> = HashMap::new();

    for (idx, task) in tasks.iter().enumerate() {
        let count = seen.entry(task.task_id.as_str()).or_insert(0);
        *count += 1;
        if *count == 2 && !task.task_id.trim().is_empty() {
            validation.duplicates.push(task.task_id.clone());
        }
        if let Some(reason) = task.skip_reason(variants) {
            validation.skipped.push((idx + 1, task.task_id.clone(), reason));
        }
    }

    validation
}

fn display_id(id: &str) -> &str {
    if id.trim().is_empty() {
        "<no id>"
    } else {
        id
    }
}

/// Rebuild the tabular summary and markdown report from a metric record file
pub async fn summarize(metrics_file: &str, output: &str, title: &str) -> Result<()> {
    println!("📊 Summarizing {}", metrics_file);

    let records: Vec<MetricRecord> = store::read_jsonl(Path::new(metrics_file))
        .with_context(|| format!("Failed to read metric records {}", metrics_file))?;
    let summary = metrics::summarize(&records);

    let out_dir = Path::new(output);
    let summary_path = out_dir.join(SUMMARY_FILE);
    store::write_summary(&summary_path, &summary)
        .with_context(|| format!("Failed to write {}", summary_path.display()))?;
    println!("✓ Summary → {}", summary_path.display());

    let report = render_report(title, &records, &summary)?;
    let report_path = out_dir.join(REPORT_FILE);
    tokio::fs::write(&report_path, report)
        .await
        .with_context(|| format!("Failed to write {}", report_path.display()))?;
    println!("✓ Report → {}", report_path.display());

    println!("✅ {} = {}", NUM_SAMPLES, summary.num_samples);
    Ok(())
}

fn render_report(title: &str, records: &[MetricRecord], summary: &MetricSummary) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    // Markdown, not HTML
    handlebars.register_escape_fn(handlebars::no_escape);

    let data = ReportData {
        title,
        num_samples: summary.num_samples,
        metrics: summary
            .metrics
            .iter()
            .map(|(name, value)| MetricRow {
                name: name.clone(),
                value: format!("{:.4}", value),
            })
            .collect(),
        variants: variant_rows(records),
    };

    handlebars
        .render_template(REPORT_TEMPLATE, &data)
        .context("Failed to render report template")
}

fn variant_rows(records: &[MetricRecord]) -> Vec<VariantRow> {
    let mut rows = Vec::new();
    for variant in Variant::all_variants() {
        let mut row = VariantRow {
            name: variant.as_str(),
            ..Default::default()
        };
        let mut seen = false;
        for status in records.iter().filter_map(|r| r.statuses.get(variant)) {
            seen = true;
            match status {
                ExecutionStatus::Passed => row.passed += 1,
                ExecutionStatus::Failed => row.failed += 1,
                ExecutionStatus::TimedOut => row.timed_out += 1,
                ExecutionStatus::CompileError => row.compile_error += 1,
                ExecutionStatus::Error => row.error += 1,
            }
        }
        if seen {
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn task(id: &str) -> TaskRecord {
        TaskRecord {
            task_id: id.to_string(),
            repo: "org/repo".to_string(),
            base_commit: "abc123".to_string(),
            file_path: "pkg/mod.py".to_string(),
            test_command: "pytest tests/".to_string(),
            variants: BTreeMap::from([(Variant::GroundTruth, "    return 1".to_string())]),
            ..Default::default()
        }
    }

    fn record(id: &str, generated: ExecutionStatus) -> MetricRecord {
        let mut metrics = BTreeMap::new();
        let passed = if generated == ExecutionStatus::Passed { 1.0 } else { 0.0 };
        metrics.insert(Variant::Generated.pass_metric().to_string(), passed);
        let mut statuses = BTreeMap::new();
        statuses.insert(Variant::Generated, generated);
        MetricRecord {
            task_id: id.to_string(),
            metrics,
            statuses,
        }
    }

    #[test]
    fn test_validate_reports_duplicates_and_skips() {
        let mut no_command = task("b");
        no_command.test_command = String::new();
        let tasks = vec![task("a"), no_command, task("a"), task("a")];

        let validation = validate_tasks(&tasks, Variant::all_variants());

        assert_eq!(validation.duplicates, vec!["a".to_string()]);
        assert_eq!(
            validation.skipped,
            vec![(2, "b".to_string(), "missing test command")]
        );
        assert!(!validation.is_clean());
    }

    #[test]
    fn test_validate_respects_variant_selection() {
        let tasks = vec![task("a")];
        assert!(validate_tasks(&tasks, &[Variant::GroundTruth]).is_clean());

        let validation = validate_tasks(&tasks, &[Variant::Generated]);
        assert_eq!(validation.skipped[0].2, "no requested variants");
    }

    #[test]
    fn test_report_counts_statuses_per_variant() {
        let records = vec![
            record("a", ExecutionStatus::Passed),
            record("b", ExecutionStatus::CompileError),
            record("c", ExecutionStatus::Passed),
        ];
        let summary = metrics::summarize(&records);

        let report = render_report("Nightly", &records, &summary).unwrap();

        assert!(report.starts_with("# Nightly"));
        assert!(report.contains("Samples evaluated: **3**"));
        assert!(report.contains("| pass@1 | 0.6667 |"));
        assert!(report.contains("| generated | 2 | 0 | 0 | 1 | 0 |"));
        assert!(!report.contains("| ground_truth |"));
    }

    #[tokio::test]
    async fn test_prepare_writes_stub_variants() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("tasks.jsonl");
        let output = dir.path().join("prepared.jsonl");
        let mut raw = task("a");
        raw.variants.insert(
            Variant::Generated,
            "Here you go:\n```python\n    return 2\n```".to_string(),
        );
        store::write_jsonl(&input, &[raw]).unwrap();

        prepare(
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            Some("python"),
            true,
        )
        .await
        .unwrap();

        let prepared: Vec<TaskRecord> = store::read_jsonl(&output).unwrap();
        let variants = &prepared[0].variants;
        assert_eq!(variants[&Variant::Generated], "return 2");
        assert_eq!(variants[&Variant::StubPass], "    pass");
        assert_eq!(variants[&Variant::DryRun], "");
    }

    #[tokio::test]
    async fn test_summarize_writes_summary_and_report() {
        let dir = TempDir::new().unwrap();
        let metrics_file = dir.path().join("metrics.jsonl");
        store::write_jsonl(
            &metrics_file,
            &[record("a", ExecutionStatus::Passed), record("b", ExecutionStatus::Failed)],
        )
        .unwrap();
        let out = dir.path().join("report");

        summarize(metrics_file.to_str().unwrap(), out.to_str().unwrap(), "Run")
            .await
            .unwrap();

        let summary = store::read_summary(&out.join(SUMMARY_FILE)).unwrap();
        assert_eq!(summary.num_samples, 2);
        assert_eq!(summary.get("pass@1"), Some(0.5));
        assert!(out.join(REPORT_FILE).exists());
    }
}
