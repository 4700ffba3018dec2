/// Test Report Judging - Language-Agnostic Verdicts
///
/// **Core Responsibility:**
/// Turn the raw result of a test command (exit code + captured output) into
/// a verdict, according to the task's report format.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or processes
/// - Pure function: (format, exit code, output) → verdict
/// - Build errors are reported distinctly from failing tests
use crate::types::ReportFormat;
use regex::Regex;
use std::sync::OnceLock;

/// Verdict of a completed (not timed out) test run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestVerdict {
    Passed,
    Failed,
    CompileError,
}

/// Counts from a pytest terminal summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PytestSummary {
    pub passed: u32,
    pub failed: u32,
    pub error: u32,
    pub skipped: u32,
    pub xfailed: u32,
    pub xpassed: u32,
}

/// Counts from `cargo test` output, summed over all test binaries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CargoSummary {
    pub passed: u32,
    pub failed: u32,
    pub ignored: u32,
    pub compile_failed: bool,
}

pub fn judge(format: ReportFormat, exit_code: i32, stdout: &str, stderr: &str) -> TestVerdict {
    match format {
        ReportFormat::ExitCode => {
            if exit_code == 0 {
                TestVerdict::Passed
            } else {
                TestVerdict::Failed
            }
        }
        ReportFormat::Pytest => judge_pytest(stdout, stderr),
        ReportFormat::Cargo => judge_cargo(exit_code, stdout, stderr),
    }
}

fn judge_pytest(stdout: &str, stderr: &str) -> TestVerdict {
    let summary = parse_pytest_summary(stdout);
    let ran = summary.passed + summary.failed + summary.xpassed + summary.xfailed;

    // Collection errors (syntax errors in the candidate) stop pytest before any test runs
    if ran == 0
        && (summary.error > 0
            || stdout.contains("ERROR collecting")
            || stderr.contains("SyntaxError"))
    {
        return TestVerdict::CompileError;
    }

    let n_passed = summary.passed + summary.xpassed;
    let n_failed = summary.failed + summary.error + summary.xfailed;
    if n_passed > 0 && n_failed == 0 {
        TestVerdict::Passed
    } else {
        TestVerdict::Failed
    }
}

fn judge_cargo(exit_code: i32, stdout: &str, stderr: &str) -> TestVerdict {
    let mut summary = parse_cargo_output(stdout);
    let from_stderr = parse_cargo_output(stderr);
    summary.passed += from_stderr.passed;
    summary.failed += from_stderr.failed;
    summary.compile_failed |= from_stderr.compile_failed;

    if summary.compile_failed {
        TestVerdict::CompileError
    } else if exit_code == 0 && summary.passed > 0 && summary.failed == 0 {
        TestVerdict::Passed
    } else {
        TestVerdict::Failed
    }
}

/// Parse pytest's final counts ("3 passed, 1 failed, 2 errors in 0.12s")
///
/// The last occurrence of each counter wins, matching the terminal summary
/// line printed at the very end of the session.
pub fn parse_pytest_summary(output: &str) -> PytestSummary {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(\d+) (passed|failed|errors?|skipped|xfailed|xpassed)\b")
            .expect("pytest summary pattern is valid")
    });

    let mut summary = PytestSummary::default();
    for captures in pattern.captures_iter(output) {
        let count: u32 = captures[1].parse().unwrap_or(0);
        match &captures[2] {
            "passed" => summary.passed = count,
            "failed" => summary.failed = count,
            "error" | "errors" => summary.error = count,
            "skipped" => summary.skipped = count,
            "xfailed" => summary.xfailed = count,
            "xpassed" => summary.xpassed = count,
            _ => {}
        }
    }
    summary
}

/// Parse `cargo test` output
pub fn parse_cargo_output(output: &str) -> CargoSummary {
    static RESULT: OnceLock<Regex> = OnceLock::new();
    static COMPILE: OnceLock<Regex> = OnceLock::new();
    let result = RESULT.get_or_init(|| {
        Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored")
            .expect("cargo result pattern is valid")
    });
    let compile = COMPILE.get_or_init(|| {
        Regex::new(r"(?m)^error(\[E\d{4}\])?: |could not compile")
            .expect("cargo compile pattern is valid")
    });

    let mut summary = CargoSummary::default();
    for captures in result.captures_iter(output) {
        summary.passed += captures[1].parse::<u32>().unwrap_or(0);
        summary.failed += captures[2].parse::<u32>().unwrap_or(0);
        summary.ignored += captures[3].parse::<u32>().unwrap_or(0);
    }
    summary.compile_failed = compile.is_match(output) && summary.passed + summary.failed == 0;
    summary
}
