//! Variant preparation helpers
//!
//! Runs before a batch is submitted, outside the evaluation core: derives
//! the trivial stub variants from the ground truth and strips markdown
//! fences from model responses.

use crate::types::{TaskRecord, Variant};

/// Stub bodies indented like the ground truth: (`stub_pass`, `stub_empty`)
///
/// Indentation is the character count of the first non-blank line's
/// leading whitespace; tabs count as one character.
pub fn stub_variants(ground_truth: &str) -> (String, String) {
    let indent = ground_truth
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.chars().count() - line.trim_start().chars().count())
        .unwrap_or(0);
    let pad = " ".repeat(indent);
    (format!("{pad}pass"), format!("{pad}return \"\""))
}

/// Extract code from a model response
///
/// A fenced block tagged with `language` wins, then the first untagged or
/// differently tagged fenced block, then the whole trimmed text.
pub fn extract_code_block(text: &str, language: Option<&str>) -> String {
    if let Some(lang) = language {
        let tag = format!("```{lang}");
        if let Some(start) = text.find(&tag) {
            let rest = &text[start + tag.len()..];
            let body = rest.split_once("```").map(|(body, _)| body).unwrap_or(rest);
            return body.trim().to_string();
        }
    }

    let parts: Vec<&str> = text.split("```").collect();
    if parts.len() >= 3 {
        // Drop the info string on the opening fence line
        let block = parts[1];
        let body = match block.split_once('\n') {
            Some((info, body)) if !info.contains(char::is_whitespace) => body,
            _ => block,
        };
        return body.trim().to_string();
    }

    text.trim().to_string()
}

/// Fill in the derived variants of a task
///
/// - `stub_pass` / `stub_empty` from the ground truth (when present)
/// - `generated` cleaned of markdown fences
/// - `dry_run` with empty code
///
/// Existing derived variants are left as they are.
pub fn prepare_task(task: &mut TaskRecord, language: Option<&str>, dry_run: bool) {
    if let Some(generated) = task.variants.get_mut(&Variant::Generated) {
        *generated = extract_code_block(generated, language);
    }

    if let Some(ground_truth) = task.variants.get(&Variant::GroundTruth) {
        let (pass, empty) = stub_variants(ground_truth);
        task.variants.entry(Variant::StubPass).or_insert(pass);
        task.variants.entry(Variant::StubEmpty).or_insert(empty);
    }

    if dry_run {
        task.variants.entry(Variant::DryRun).or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_stub_no_indent() {
        let (pass, empty) = stub_variants("def function():\npass");
        assert_eq!(pass, "pass");
        assert_eq!(empty, "return \"\"");
    }

    #[test]
    fn test_stub_with_indent() {
        let (pass, empty) = stub_variants("    def function():\n        pass");
        assert_eq!(pass, "    pass");
        assert_eq!(empty, "    return \"\"");
    }

    #[test]
    fn test_stub_skips_leading_blank_lines() {
        let (pass, _) = stub_variants("\n\n        nested()\n        return value");
        assert_eq!(pass, "        pass");
    }

    #[test]
    fn test_stub_whitespace_only() {
        let (pass, empty) = stub_variants("   \n  \n\t\n");
        assert_eq!(pass, "pass");
        assert_eq!(empty, "return \"\"");
    }

    #[test]
    fn test_stub_mixed_indentation_counts_characters() {
        let (pass, _) = stub_variants("\t    if condition:\n\t        process()");
        assert_eq!(pass, "     pass");
    }

    #[test]
    fn test_extract_tagged_block() {
        let text = "Here is some Java code:\n```java\npublic class Test {\n    // code\n}\n```\nEnd of code.";
        assert_eq!(
            extract_code_block(text, Some("java")),
            "public class Test {\n    // code\n}"
        );
    }

    #[test]
    fn test_extract_generic_block() {
        let text = "Some text\n```\npublic class Test {}\n```\nMore text";
        assert_eq!(extract_code_block(text, Some("java")), "public class Test {}");
    }

    #[test]
    fn test_extract_tagged_block_priority() {
        let text = "```\nclass Generic {}\n```\nthen\n```java\nclass Tagged {}\n```";
        assert_eq!(extract_code_block(text, Some("java")), "class Tagged {}");
    }

    #[test]
    fn test_extract_other_language_tag_dropped() {
        let text = "```python\nx = 1\n```";
        assert_eq!(extract_code_block(text, None), "x = 1");
    }

    #[test]
    fn test_extract_plain_text() {
        assert_eq!(extract_code_block("  x = 1\n", None), "x = 1");
        assert_eq!(extract_code_block("   \n  \t  ", Some("java")), "");
    }

    #[test]
    fn test_prepare_task_fills_derived_variants() {
        let mut task = TaskRecord {
            task_id: "t1".to_string(),
            variants: BTreeMap::from([
                (Variant::Generated, "```python\n    return 2\n```".to_string()),
                (Variant::GroundTruth, "    return 1".to_string()),
            ]),
            ..Default::default()
        };

        prepare_task(&mut task, Some("python"), true);

        assert_eq!(task.variants[&Variant::Generated], "return 2");
        assert_eq!(task.variants[&Variant::StubPass], "    pass");
        assert_eq!(task.variants[&Variant::StubEmpty], "    return \"\"");
        assert_eq!(task.variants[&Variant::DryRun], "");
    }

    #[test]
    fn test_prepare_task_without_ground_truth() {
        let mut task = TaskRecord {
            task_id: "t1".to_string(),
            variants: BTreeMap::from([(Variant::Generated, "x = 1".to_string())]),
            ..Default::default()
        };

        prepare_task(&mut task, None, false);

        assert_eq!(task.variants.len(), 1);
    }
}
