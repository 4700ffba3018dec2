//! Test doubles for the Task Manager: a scripted backend and a flaky arena

use crate::arena::{Arena, ArenaError, DirectoryArena, IsolationSlot};
use crate::engine::{
    BackendError, ExecutionBackend, ExecutionOutcome, PreparedEnvironment, RunRequest,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use verdict_common::{layout, EnvironmentSpec, ExecutionStatus, IsolationStrategy, Variant};

/// Behavior of one (task, variant) execution
#[derive(Debug, Clone)]
pub enum Script {
    Pass,
    Fail,
    CompileError,
    /// Runs until the timeout, then reports `timed_out`
    Hang,
    /// Ignores the timeout entirely
    Rogue,
    /// Backend error on every attempt
    Fault,
    /// Backend error on the first attempt only
    FaultOnce,
    Panic,
    /// Passes after a delay
    Sleep(Duration),
}

/// In-memory backend driven by per-(task, variant) scripts
///
/// Unscripted executions pass. Tracks preparations per repository and the
/// slot directories in use, flagging any slot used by two runs at once.
pub struct ScriptedBackend {
    scripts: HashMap<(String, Variant), Script>,
    failing_repos: HashSet<String>,
    prepare_delay: Duration,
    prepare_calls: Mutex<HashMap<String, usize>>,
    attempts: Mutex<HashMap<(String, Variant), usize>>,
    active_slots: Mutex<HashSet<PathBuf>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    collision: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            failing_repos: HashSet::new(),
            prepare_delay: Duration::ZERO,
            prepare_calls: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            active_slots: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            collision: AtomicBool::new(false),
        }
    }

    pub fn with(mut self, task_id: &str, variant: Variant, script: Script) -> Self {
        self.scripts.insert((task_id.to_string(), variant), script);
        self
    }

    pub fn with_failing_environment(mut self, repo: &str) -> Self {
        self.failing_repos.insert(repo.to_string());
        self
    }

    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    pub fn prepare_calls(&self, repo: &str) -> usize {
        self.prepare_calls.lock().unwrap().get(repo).copied().unwrap_or(0)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn slot_collision(&self) -> bool {
        self.collision.load(Ordering::SeqCst)
    }

    fn enter(&self, slot: &IsolationSlot) -> ActiveRun<'_> {
        if !self.active_slots.lock().unwrap().insert(slot.path.clone()) {
            self.collision.store(true, Ordering::SeqCst);
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveRun {
            backend: self,
            path: slot.path.clone(),
        }
    }

    fn attempt(&self, task_id: &str, variant: Variant) -> usize {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry((task_id.to_string(), variant)).or_insert(0);
        *count += 1;
        *count
    }
}

/// Marks a slot free again, also when the run is abandoned or panics
struct ActiveRun<'a> {
    backend: &'a ScriptedBackend,
    path: PathBuf,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.backend.active_slots.lock().unwrap().remove(&self.path);
        self.backend.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn outcome(status: ExecutionStatus, exit_code: Option<i32>, started: Instant) -> ExecutionOutcome {
    ExecutionOutcome {
        status,
        exit_code,
        stdout: format!("{status}\n"),
        stderr: String::new(),
        duration: started.elapsed(),
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn prepare(&self, spec: &EnvironmentSpec) -> Result<PreparedEnvironment, BackendError> {
        *self
            .prepare_calls
            .lock()
            .unwrap()
            .entry(spec.repo.clone())
            .or_insert(0) += 1;
        tokio::time::sleep(self.prepare_delay).await;

        let key = layout::environment_key(spec);
        if self.failing_repos.contains(&spec.repo) {
            return Err(BackendError::Build {
                key,
                reason: "scripted build failure".to_string(),
            });
        }
        Ok(PreparedEnvironment {
            source_dir: PathBuf::from("/nonexistent").join(&key),
            key,
            image: spec.image.clone(),
        })
    }

    async fn run(&self, request: RunRequest<'_>) -> Result<ExecutionOutcome, BackendError> {
        let script = self
            .scripts
            .get(&(request.task_id.to_string(), request.variant))
            .cloned()
            .unwrap_or(Script::Pass);
        let attempt = self.attempt(request.task_id, request.variant);
        let started = Instant::now();

        let _active = self.enter(request.slot);
        // Stage the overlay in the slot and check nobody else touched it
        let staged = request.slot.path.join("overlay");
        let contents = request
            .overlay
            .as_ref()
            .map(|o| o.contents.clone())
            .unwrap_or_default();
        let _ = std::fs::write(&staged, &contents);

        let result = match script {
            Script::Pass => Ok(outcome(ExecutionStatus::Passed, Some(0), started)),
            Script::Fail => Ok(outcome(ExecutionStatus::Failed, Some(1), started)),
            Script::CompileError => Ok(outcome(ExecutionStatus::CompileError, Some(1), started)),
            Script::Sleep(delay) => {
                tokio::time::sleep(delay).await;
                Ok(outcome(ExecutionStatus::Passed, Some(0), started))
            }
            Script::Hang => {
                tokio::time::sleep(request.timeout).await;
                Ok(ExecutionOutcome::timed_out(String::new(), String::new(), started.elapsed()))
            }
            Script::Rogue => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(outcome(ExecutionStatus::Passed, Some(0), started))
            }
            Script::Fault => Err(BackendError::Unsupported("injected fault".to_string())),
            Script::FaultOnce if attempt == 1 => {
                Err(BackendError::Unsupported("injected fault".to_string()))
            }
            Script::FaultOnce => Ok(outcome(ExecutionStatus::Passed, Some(0), started)),
            Script::Panic => panic!("injected panic"),
        };

        if std::fs::read_to_string(&staged).ok().as_deref() != Some(contents.as_str()) {
            self.collision.store(true, Ordering::SeqCst);
        }
        result
    }
}

/// Directory arena that fails on demand for chosen workers
pub struct FlakyArena {
    inner: DirectoryArena,
    fail_acquire: HashSet<usize>,
    fail_reset: HashSet<usize>,
}

impl FlakyArena {
    pub fn new() -> Self {
        Self {
            inner: DirectoryArena::new(None, IsolationStrategy::Ephemeral).unwrap(),
            fail_acquire: HashSet::new(),
            fail_reset: HashSet::new(),
        }
    }

    pub fn fail_acquire(mut self, worker: usize) -> Self {
        self.fail_acquire.insert(worker);
        self
    }

    pub fn fail_reset(mut self, worker: usize) -> Self {
        self.fail_reset.insert(worker);
        self
    }
}

fn injected(what: &str) -> ArenaError {
    ArenaError::Io(std::io::Error::other(format!("injected {what} failure")))
}

#[async_trait]
impl Arena for FlakyArena {
    fn strategy(&self) -> IsolationStrategy {
        self.inner.strategy()
    }

    async fn acquire(&self, worker: usize) -> Result<IsolationSlot, ArenaError> {
        if self.fail_acquire.contains(&worker) {
            return Err(injected("acquire"));
        }
        self.inner.acquire(worker).await
    }

    async fn reset(&self, slot: &IsolationSlot) -> Result<(), ArenaError> {
        if self.fail_reset.contains(&slot.worker) {
            return Err(injected("reset"));
        }
        self.inner.reset(slot).await
    }

    async fn release(&self, slot: IsolationSlot) -> Result<(), ArenaError> {
        self.inner.release(slot).await
    }
}
