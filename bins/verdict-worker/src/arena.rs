/// Isolation Arena - Private Scratch Space per Worker
///
/// **Core Responsibility:**
/// Give every worker one filesystem location nobody else touches, for the
/// worker's whole lifetime.
///
/// **Guarantees:**
/// - Slots are keyed by worker index, not task id
/// - A slot is never held by two workers at once (second acquire fails)
/// - `reset` leaves an empty directory, so nothing leaks between variants
///
/// Any error from this module is fatal for the worker that hit it, never for
/// the batch: the Task Manager retires the worker and requeues its task.
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use verdict_common::layout;
use verdict_common::IsolationStrategy;

/// Scratch area bound to one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationSlot {
    pub worker: usize,
    pub path: PathBuf,
}

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("slot for worker {0} is already in use")]
    SlotBusy(usize),

    #[error("slot IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Arena: Send + Sync {
    fn strategy(&self) -> IsolationStrategy;

    async fn acquire(&self, worker: usize) -> Result<IsolationSlot, ArenaError>;

    /// Wipe a slot's contents between executions
    async fn reset(&self, slot: &IsolationSlot) -> Result<(), ArenaError>;

    async fn release(&self, slot: IsolationSlot) -> Result<(), ArenaError>;
}

/// Arena of sibling directories under one root
pub struct DirectoryArena {
    root: PathBuf,
    strategy: IsolationStrategy,
    active: Mutex<HashSet<usize>>,
    // Held so a temporary root is removed with the arena
    _temp: Option<TempDir>,
}

impl DirectoryArena {
    /// Arena rooted at `root`, or at a fresh temporary directory
    pub fn new(root: Option<&Path>, strategy: IsolationStrategy) -> Result<Self, ArenaError> {
        let (root, temp) = match root {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.to_path_buf(), None)
            }
            None => {
                let temp = tempfile::Builder::new().prefix("verdict-arena-").tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        Ok(Self {
            root,
            strategy,
            active: Mutex::new(HashSet::new()),
            _temp: temp,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Arena for DirectoryArena {
    fn strategy(&self) -> IsolationStrategy {
        self.strategy
    }

    async fn acquire(&self, worker: usize) -> Result<IsolationSlot, ArenaError> {
        let mut active = self.active.lock().await;
        if !active.insert(worker) {
            return Err(ArenaError::SlotBusy(worker));
        }

        let path = self.root.join(layout::slot_dir_name(worker));
        let prepared = async {
            if tokio::fs::try_exists(&path).await? {
                tokio::fs::remove_dir_all(&path).await?;
            }
            tokio::fs::create_dir_all(&path).await
        }
        .await;

        if let Err(e) = prepared {
            active.remove(&worker);
            return Err(e.into());
        }

        debug!(worker, path = %path.display(), "Slot acquired");
        Ok(IsolationSlot { worker, path })
    }

    async fn reset(&self, slot: &IsolationSlot) -> Result<(), ArenaError> {
        if tokio::fs::try_exists(&slot.path).await? {
            tokio::fs::remove_dir_all(&slot.path).await?;
        }
        tokio::fs::create_dir_all(&slot.path).await?;
        Ok(())
    }

    async fn release(&self, slot: IsolationSlot) -> Result<(), ArenaError> {
        self.active.lock().await.remove(&slot.worker);
        if tokio::fs::try_exists(&slot.path).await? {
            tokio::fs::remove_dir_all(&slot.path).await?;
        }
        debug!(worker = slot.worker, "Slot released");
        Ok(())
    }
}
