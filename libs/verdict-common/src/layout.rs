use crate::types::{EnvironmentSpec, Variant};
use sha2::{Digest, Sha256};

/// Naming semantics only, no runtime logic
/// Keeps worker, CLI and cached artifacts in agreement: environment keys,
/// image tags, container names and artifact files are all derived here

pub const ENV_IMAGE_REPO: &str = "verdict-env";
pub const CONTAINER_PREFIX: &str = "verdict";
pub const SLOT_PREFIX: &str = "slot";

/// Marker files written into cached source trees; never copied into slots
pub const MARKER_PREFIX: &str = ".verdict-";
pub const SOURCE_READY_MARKER: &str = ".verdict-source";
pub const BUILD_READY_MARKER: &str = ".verdict-built";

pub const TASK_LIST_FILE: &str = "task_list.jsonl";
pub const METRICS_FILE: &str = "metrics.jsonl";
pub const SUMMARY_FILE: &str = "summary.csv";
pub const MANIFEST_FILE: &str = "run.json";
pub const TELEMETRY_FILE: &str = "telemetry.prom";
pub const REPORT_FILE: &str = "summary.md";

/// Deterministic cache key for an environment specification
///
/// Same spec, same key, in every process. The readable prefix is the
/// repository name; the hash covers every field.
pub fn environment_key(spec: &EnvironmentSpec) -> String {
    let mut hasher = Sha256::new();
    for field in [
        spec.repo.as_str(),
        spec.base_commit.as_str(),
        spec.image.as_deref().unwrap_or_default(),
        spec.build_command.as_str(),
    ] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", slug(repo_name(&spec.repo)), &digest[..16])
}

/// Docker image tag holding a prepared environment
pub fn environment_image(key: &str) -> String {
    format!("{}:{}", ENV_IMAGE_REPO, key)
}

/// Unique container name for one (task, variant) execution
pub fn container_name(task_id: &str, variant: Variant, suffix: &str) -> String {
    format!("{}-{}-{}-{}", CONTAINER_PREFIX, slug(task_id), variant, suffix)
}

/// Container name for an environment build
pub fn build_container_name(key: &str, suffix: &str) -> String {
    format!("{}-build-{}-{}", CONTAINER_PREFIX, key, suffix)
}

/// Directory name of a worker's isolation slot
pub fn slot_dir_name(worker: usize) -> String {
    format!("{}-{:03}", SLOT_PREFIX, worker)
}

fn repo_name(repo: &str) -> &str {
    repo.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(repo)
}

/// Lowercase alphanumerics and dashes, safe for image tags and container names
fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.chars().take(40).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            repo: "niklashenning/pytablericons".to_string(),
            base_commit: "29f2138c".to_string(),
            image: Some("python:3.11".to_string()),
            build_command: "pip install .".to_string(),
        }
    }

    #[test]
    fn test_environment_key_deterministic() {
        let key1 = environment_key(&spec());
        let key2 = environment_key(&spec());
        assert_eq!(key1, key2);
        assert!(key1.starts_with("pytablericons-"));
        assert_eq!(key1.len(), "pytablericons-".len() + 16);
    }

    #[test]
    fn test_environment_key_covers_every_field() {
        let base = environment_key(&spec());
        let other_commit = EnvironmentSpec {
            base_commit: "deadbeef".to_string(),
            ..spec()
        };
        let other_build = EnvironmentSpec {
            build_command: "pip install -e .".to_string(),
            ..spec()
        };
        let no_image = EnvironmentSpec {
            image: None,
            ..spec()
        };
        assert_ne!(base, environment_key(&other_commit));
        assert_ne!(base, environment_key(&other_build));
        assert_ne!(base, environment_key(&no_image));
    }

    #[test]
    fn test_local_path_repo_key() {
        let local = EnvironmentSpec {
            repo: "/tmp/My Repo/".to_string(),
            ..spec()
        };
        assert!(environment_key(&local).starts_with("my-repo-"));
    }

    #[test]
    fn test_image_and_container_names() {
        assert_eq!(environment_image("abc-123"), "verdict-env:abc-123");
        assert_eq!(
            container_name("Repo/Task#1", Variant::GroundTruth, "u1"),
            "verdict-repo-task-1-ground_truth-u1"
        );
        assert_eq!(build_container_name("k", "u2"), "verdict-build-k-u2");
    }

    #[test]
    fn test_slot_dir_name() {
        assert_eq!(slot_dir_name(0), "slot-000");
        assert_eq!(slot_dir_name(42), "slot-042");
    }
}
