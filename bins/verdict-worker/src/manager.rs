/// Task Manager - Bounded Worker Pool over a Batch of Task Records
///
/// **Core Responsibility:**
/// Take a batch of task records, run every requested variant of every
/// runnable task through the execution backend, and write the outcomes back
/// into the records.
///
/// **Flow:**
/// 1. Reject duplicate task ids, record skip reasons for unrunnable tasks
/// 2. Prepare each distinct environment once (build-once gate per key)
/// 3. Spawn `parallelism` workers; each acquires its slot for its lifetime
/// 4. Workers pull tasks from a shared queue and run variants sequentially
/// 5. Finished records are reassembled by task id, not by position
///
/// **Failure Policy:**
/// - Timeout: `timed_out`, the backend reclaims its process or container
/// - Backend error or panic: `WorkerFault`, retried `fault_retries` times,
///   then recorded as `error` with the failure detail
/// - Environment build failure: every variant of the task is `error`
/// - Slot failure: the worker retires, its task goes back to the queue
/// - No workers left: `EvalError::PoolExhausted` with partial results
use crate::arena::{Arena, ArenaError, IsolationSlot};
use crate::engine::{ExecutionBackend, ExecutionOutcome, Overlay, PreparedEnvironment, RunRequest};
use crate::telemetry;
use futures_util::{stream, FutureExt, StreamExt};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, OnceCell};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use verdict_common::{
    layout, Config, ConfigError, EnvironmentSpec, EvalError, TaskOutputs, TaskRecord, Variant,
    VariantOutcome,
};

/// Skip reason recorded for tasks left in the queue at shutdown
pub const NOT_DISPATCHED_SHUTDOWN: &str = "not dispatched: shutdown requested";
/// Skip reason recorded for tasks left in the queue when no workers remain
pub const NOT_DISPATCHED_EXHAUSTED: &str = "not dispatched: worker pool exhausted";

const DEFAULT_TIMEOUT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub parallelism: usize,
    /// Per (task, variant) execution
    pub timeout: Duration,
    /// Extra attempts after a worker fault
    pub fault_retries: u32,
    pub variants: Vec<Variant>,
    /// Time a backend gets past `timeout` to reclaim what it started
    pub timeout_grace: Duration,
}

impl EvalOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parallelism: config.parallelism,
            timeout: config.timeout,
            fault_retries: config.fault_retries,
            variants: config.variants.clone(),
            timeout_grace: DEFAULT_TIMEOUT_GRACE,
        }
    }

    fn validate(&self) -> Result<(), EvalError> {
        if self.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism.into());
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("timeout").into());
        }
        if self.variants.is_empty() {
            return Err(EvalError::InvalidBatch("no variants requested".to_string()));
        }
        Ok(())
    }
}

/// What happened to a batch, besides the outcomes written into the records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub skipped: usize,
    pub retired_workers: usize,
}

type Preparation = Result<PreparedEnvironment, String>;

/// Build-once gate: one cell per environment key, shared by every batch
#[derive(Default)]
struct EnvironmentCache {
    cells: tokio::sync::Mutex<HashMap<String, Arc<OnceCell<Preparation>>>>,
}

impl EnvironmentCache {
    async fn get_or_prepare(&self, backend: &dyn ExecutionBackend, spec: &EnvironmentSpec) -> Preparation {
        let key = layout::environment_key(spec);
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(key.clone()).or_default().clone()
        };

        cell.get_or_init(|| async {
            let started = Instant::now();
            let result = match AssertUnwindSafe(backend.prepare(spec)).catch_unwind().await {
                Ok(Ok(env)) => Ok(env),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("preparation panicked: {}", panic_message(&*panic))),
            };
            telemetry::record_preparation(result.is_ok());
            match &result {
                Ok(_) => info!(
                    key = %key,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Environment ready"
                ),
                Err(reason) => error!(key = %key, reason = %reason, "Environment preparation failed"),
            }
            result
        })
        .await
        .clone()
    }
}

/// Unit of work handed to a worker
struct Pending {
    record: TaskRecord,
    environment: Preparation,
}

/// Shared queue of pending tasks
///
/// A worker finding it empty waits while other tasks are in flight, since a
/// retiring worker can push its task back.
struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

struct QueueState {
    items: VecDeque<Pending>,
    in_flight: usize,
}

impl WorkQueue {
    fn new(items: VecDeque<Pending>) -> Self {
        Self {
            state: Mutex::new(QueueState { items, in_flight: 0 }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next task, or `None` once the queue is drained or shutdown was requested
    async fn pop(&self, shutdown: &CancellationToken) -> Option<Pending> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            let notified = {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    state.in_flight += 1;
                    return Some(item);
                }
                if state.in_flight == 0 {
                    return None;
                }
                // Registered before the lock is released, so no wakeup is lost
                self.changed.notified()
            };
            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Mark a popped task done, optionally putting it back at the front
    fn finish(&self, requeue: Option<Pending>) {
        {
            let mut state = self.lock();
            if let Some(item) = requeue {
                state.items.push_front(item);
            }
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    fn drain(&self) -> Vec<Pending> {
        self.lock().items.drain(..).collect()
    }
}

/// Record coming back from a worker
struct Finished {
    record: TaskRecord,
    outputs: TaskOutputs,
}

enum WorkerExit {
    Drained,
    Retired,
}

/// Everything a worker needs, shared by the pool
struct WorkerContext {
    backend: Arc<dyn ExecutionBackend>,
    arena: Arc<dyn Arena>,
    options: EvalOptions,
    queue: WorkQueue,
    shutdown: CancellationToken,
    faults: AtomicUsize,
}

pub struct TaskManager {
    backend: Arc<dyn ExecutionBackend>,
    arena: Arc<dyn Arena>,
    options: EvalOptions,
    environments: EnvironmentCache,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        arena: Arc<dyn Arena>,
        options: EvalOptions,
    ) -> Result<Self, EvalError> {
        options.validate()?;
        Ok(Self {
            backend,
            arena,
            options,
            environments: EnvironmentCache::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops dispatching new tasks when cancelled
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Evaluate a batch in place
    ///
    /// On `Ok` every task either carries an outcome for each requested
    /// variant or a skip reason. On `PoolExhausted` the tasks that ran carry
    /// their outcomes and the rest are marked as not dispatched.
    pub async fn evaluate(&self, tasks: &mut [TaskRecord]) -> Result<BatchReport, EvalError> {
        check_unique_ids(tasks)?;

        let mut report = BatchReport::default();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut runnable = Vec::new();

        for (index, task) in tasks.iter_mut().enumerate() {
            positions.insert(task.task_id.clone(), index);
            match task.skip_reason(&self.options.variants) {
                Some(reason) => {
                    warn!(task_id = %task.task_id, reason, "Skipping task");
                    telemetry::record_task_skipped();
                    task.record_outputs(TaskOutputs::skipped(reason));
                    report.skipped += 1;
                }
                None => runnable.push(index),
            }
        }

        if runnable.is_empty() {
            return Ok(report);
        }

        let environments = self.prepare_environments(tasks, &runnable).await;

        let mut items = VecDeque::with_capacity(runnable.len());
        let mut dispatched_ids = Vec::with_capacity(runnable.len());
        for index in runnable {
            let record = std::mem::take(&mut tasks[index]);
            dispatched_ids.push((record.task_id.clone(), index));
            let key = layout::environment_key(&record.environment_spec());
            let environment = environments
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Err(format!("environment {key} was not prepared")));
            items.push_back(Pending { record, environment });
        }
        let dispatched = items.len();

        let ctx = Arc::new(WorkerContext {
            backend: Arc::clone(&self.backend),
            arena: Arc::clone(&self.arena),
            options: self.options.clone(),
            queue: WorkQueue::new(items),
            shutdown: self.shutdown.clone(),
            faults: AtomicUsize::new(0),
        });

        info!(
            tasks = dispatched,
            parallelism = self.options.parallelism,
            backend = self.backend.name(),
            "Dispatching batch"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        for worker in 0..self.options.parallelism {
            let ctx = Arc::clone(&ctx);
            let tx = tx.clone();
            workers.spawn(run_worker(worker, ctx, tx));
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(WorkerExit::Drained) => {}
                Ok(WorkerExit::Retired) => report.retired_workers += 1,
                Err(e) => {
                    error!(error = %e, "Worker task aborted");
                    report.retired_workers += 1;
                }
            }
        }

        let mut returned = HashSet::new();
        while let Some(finished) = rx.recv().await {
            let Finished { mut record, outputs } = finished;
            record.record_outputs(outputs);
            returned.insert(record.task_id.clone());
            report.attempted += 1;
            if let Some(&index) = positions.get(&record.task_id) {
                tasks[index] = record;
            }
        }

        let leftover = ctx.queue.drain();
        let pending = leftover.len();
        let shutting_down = self.shutdown.is_cancelled();
        let reason = if shutting_down {
            NOT_DISPATCHED_SHUTDOWN
        } else {
            NOT_DISPATCHED_EXHAUSTED
        };
        for Pending { mut record, .. } in leftover {
            record.record_outputs(TaskOutputs::skipped(reason));
            telemetry::record_task_skipped();
            returned.insert(record.task_id.clone());
            report.skipped += 1;
            if let Some(&index) = positions.get(&record.task_id) {
                tasks[index] = record;
            }
        }

        // A record can only vanish if a worker task itself died
        for (task_id, index) in dispatched_ids {
            if !returned.contains(&task_id) {
                error!(task_id = %task_id, "Task record lost by an aborted worker");
                tasks[index].task_id = task_id;
                tasks[index].error = Some("task record lost by an aborted worker".to_string());
            }
        }

        info!(
            attempted = report.attempted,
            skipped = report.skipped,
            retired_workers = report.retired_workers,
            worker_faults = ctx.faults.load(Ordering::Relaxed),
            "Batch finished"
        );

        if pending > 0 && !shutting_down {
            return Err(EvalError::PoolExhausted {
                completed: report.attempted,
                pending,
            });
        }
        Ok(report)
    }

    /// Prepare each distinct environment of the runnable tasks
    async fn prepare_environments(
        &self,
        tasks: &[TaskRecord],
        runnable: &[usize],
    ) -> HashMap<String, Preparation> {
        let mut specs: HashMap<String, EnvironmentSpec> = HashMap::new();
        for &index in runnable {
            let spec = tasks[index].environment_spec();
            specs.entry(layout::environment_key(&spec)).or_insert(spec);
        }
        debug!(environments = specs.len(), "Preparing environments");

        let backend = self.backend.as_ref();
        let cache = &self.environments;
        stream::iter(specs)
            .map(|(key, spec)| async move {
                let prepared = cache.get_or_prepare(backend, &spec).await;
                (key, prepared)
            })
            .buffer_unordered(self.options.parallelism)
            .collect()
            .await
    }
}

fn check_unique_ids(tasks: &[TaskRecord]) -> Result<(), EvalError> {
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.task_id.as_str()) {
            return Err(EvalError::DuplicateTaskId(task.task_id.clone()));
        }
    }
    Ok(())
}

async fn run_worker(
    worker: usize,
    ctx: Arc<WorkerContext>,
    results: mpsc::UnboundedSender<Finished>,
) -> WorkerExit {
    let slot = match ctx.arena.acquire(worker).await {
        Ok(slot) => slot,
        Err(e) => {
            error!(worker, error = %e, "Failed to acquire isolation slot, retiring worker");
            telemetry::record_worker_retired();
            return WorkerExit::Retired;
        }
    };
    debug!(worker, path = %slot.path.display(), "Worker started");

    while let Some(pending) = ctx.queue.pop(&ctx.shutdown).await {
        match evaluate_task(&ctx, &slot, &pending).await {
            Ok(outputs) => {
                let finished = Finished {
                    record: pending.record,
                    outputs,
                };
                if results.send(finished).is_err() {
                    error!(worker, "Result channel closed");
                }
                ctx.queue.finish(None);
            }
            Err(e) => {
                error!(
                    worker,
                    task_id = %pending.record.task_id,
                    error = %e,
                    "Isolation slot failed, retiring worker"
                );
                ctx.queue.finish(Some(pending));
                telemetry::record_worker_retired();
                if let Err(e) = ctx.arena.release(slot).await {
                    warn!(worker, error = %e, "Failed to release slot of retired worker");
                }
                return WorkerExit::Retired;
            }
        }
    }

    if let Err(e) = ctx.arena.release(slot).await {
        warn!(worker, error = %e, "Failed to release slot");
    }
    debug!(worker, "Worker drained");
    WorkerExit::Drained
}

/// Run every requested variant of one task, in variant order
///
/// Only slot failures escape; everything else becomes an outcome.
async fn evaluate_task(
    ctx: &WorkerContext,
    slot: &IsolationSlot,
    pending: &Pending,
) -> Result<TaskOutputs, ArenaError> {
    let task = &pending.record;
    let variants = task.requested_variants(&ctx.options.variants);
    let mut outputs = TaskOutputs::default();

    let environment = match &pending.environment {
        Ok(env) => env,
        Err(reason) => {
            let detail = format!("environment build failed: {reason}");
            for variant in variants {
                telemetry::record_variant(variant.as_str(), "error", 0);
                outputs.outcomes.insert(variant, VariantOutcome::error(detail.clone()));
            }
            outputs.error = Some(detail);
            return Ok(outputs);
        }
    };

    for variant in variants {
        let outcome = run_variant(ctx, slot, environment, task, variant).await?;
        info!(
            task_id = %task.task_id,
            variant = %variant,
            worker = slot.worker,
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            "Variant evaluated"
        );
        telemetry::record_variant(variant.as_str(), outcome.status.as_str(), outcome.duration_ms);
        outputs.outcomes.insert(variant, outcome);
    }
    Ok(outputs)
}

async fn run_variant(
    ctx: &WorkerContext,
    slot: &IsolationSlot,
    environment: &PreparedEnvironment,
    task: &TaskRecord,
    variant: Variant,
) -> Result<VariantOutcome, ArenaError> {
    let overlay = if variant.overlays_code() {
        let code = task.variants.get(&variant).map(String::as_str).unwrap_or_default();
        Some(Overlay {
            file_path: task.file_path.clone(),
            contents: task.overlay_contents(code),
        })
    } else {
        None
    };

    let bound = ctx.options.timeout + ctx.options.timeout_grace;
    let mut last_fault = String::new();

    for attempt in 0..=ctx.options.fault_retries {
        ctx.arena.reset(slot).await?;

        let request = RunRequest {
            task_id: &task.task_id,
            variant,
            environment,
            slot,
            test_command: &task.test_command,
            compile_command: task.compile_command.as_deref(),
            overlay: overlay.clone(),
            report: task.report,
            timeout: ctx.options.timeout,
        };

        let started = Instant::now();
        let run = AssertUnwindSafe(ctx.backend.run(request)).catch_unwind();
        match tokio::time::timeout(bound, run).await {
            Ok(Ok(Ok(outcome))) => return Ok(recorded(outcome)),
            Ok(Ok(Err(e))) => last_fault = e.to_string(),
            Ok(Err(panic)) => last_fault = format!("backend panicked: {}", panic_message(&*panic)),
            Err(_) => {
                // Dropping the future reclaims spawned processes (kill_on_drop)
                warn!(
                    task_id = %task.task_id,
                    variant = %variant,
                    "Backend overran its timeout, abandoning execution"
                );
                return Ok(VariantOutcome {
                    detail: Some("backend did not stop at the timeout".to_string()),
                    ..recorded(ExecutionOutcome::timed_out(
                        String::new(),
                        String::new(),
                        started.elapsed(),
                    ))
                });
            }
        }

        ctx.faults.fetch_add(1, Ordering::Relaxed);
        telemetry::record_worker_fault();
        warn!(
            task_id = %task.task_id,
            variant = %variant,
            attempt = attempt + 1,
            error = %last_fault,
            "Worker fault"
        );
    }

    Ok(VariantOutcome::error(last_fault))
}

fn recorded(outcome: ExecutionOutcome) -> VariantOutcome {
    VariantOutcome {
        status: outcome.status,
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        duration_ms: outcome.duration.as_millis() as u64,
        detail: None,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
