//! Source tree cache
//!
//! One checkout per environment key under the cache root. Repositories are
//! cloned from the configured git host, or copied when `repo` names an
//! existing local directory. A marker file records a completed checkout, so
//! an interrupted one is redone on the next run.

use crate::engine::BackendError;
use crate::process;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use verdict_common::layout::{self, MARKER_PREFIX, SOURCE_READY_MARKER};
use verdict_common::EnvironmentSpec;
use walkdir::WalkDir;

const GIT_OUTPUT_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SourceCache {
    root: PathBuf,
    git_url: String,
    timeout: Duration,
}

impl SourceCache {
    pub fn new(root: impl Into<PathBuf>, git_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            git_url: git_url.into(),
            timeout,
        }
    }

    /// Directory holding the environment's files (source and build state)
    pub fn environment_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Make the source tree for `spec` available, returning its path
    ///
    /// Callers guarantee at most one concurrent call per environment key.
    pub async fn materialize(&self, spec: &EnvironmentSpec) -> Result<PathBuf, BackendError> {
        let key = layout::environment_key(spec);
        let dest = self.environment_dir(&key).join("repo");

        if dest.join(SOURCE_READY_MARKER).exists() {
            debug!(key = %key, "Source cache hit");
            return Ok(dest);
        }

        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::create_dir_all(&dest)?;

        let local = Path::new(&spec.repo);
        if local.is_dir() {
            info!(key = %key, repo = %spec.repo, "Copying local source tree");
            let from = local.to_path_buf();
            let to = dest.clone();
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))??;
        } else {
            info!(key = %key, repo = %spec.repo, commit = %spec.base_commit, "Cloning repository");
            self.clone_repo(spec, &dest).await?;
        }

        fs::write(dest.join(SOURCE_READY_MARKER), &spec.base_commit)?;
        Ok(dest)
    }

    fn clone_url(&self, repo: &str) -> String {
        if repo.contains("://") || repo.starts_with("git@") {
            repo.to_string()
        } else {
            format!("{}/{}.git", self.git_url.trim_end_matches('/'), repo)
        }
    }

    async fn clone_repo(&self, spec: &EnvironmentSpec, dest: &Path) -> Result<(), BackendError> {
        let url = self.clone_url(&spec.repo);
        let dest_str = dest.to_string_lossy().to_string();

        let clone = process::run_program(
            "git",
            &["clone", "--quiet", &url, &dest_str],
            &self.root,
            self.timeout,
            GIT_OUTPUT_LIMIT,
        )
        .await?;
        if !clone.succeeded() {
            return Err(source_error(spec, "git clone", &clone));
        }

        if !spec.base_commit.is_empty() {
            let checkout = process::run_program(
                "git",
                &["checkout", "--quiet", &spec.base_commit],
                dest,
                self.timeout,
                GIT_OUTPUT_LIMIT,
            )
            .await?;
            if !checkout.succeeded() {
                return Err(source_error(spec, "git checkout", &checkout));
            }
        }
        Ok(())
    }
}

fn source_error(spec: &EnvironmentSpec, step: &str, out: &process::ShellOutput) -> BackendError {
    let reason = if out.timed_out {
        format!("{} timed out", step)
    } else {
        format!("{} exited with {:?}: {}", step, out.exit_code, out.tail(5))
    };
    BackendError::Source {
        repo: spec.repo.clone(),
        reason,
    }
}

/// Recursively copy `from` into `to`, skipping cache marker files
pub fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;

    let walker = WalkDir::new(from).min_depth(1).into_iter().filter_entry(|entry| {
        !(entry.depth() == 1 && entry.file_name().to_string_lossy().starts_with(MARKER_PREFIX))
    });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    let pointee = fs::read_link(link)?;
    std::os::unix::fs::symlink(pointee, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    fs::copy(link, target).map(|_| ())
}
