use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use octave_observability::{safe_eprintln, TraceError, Tracer};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    broadcaster::{Broadcaster, Phase, StatusSnapshot, Subscription},
    candidates::{self, LaunchCandidate},
    config::EngineConfig,
    error::{EngineError, EngineResult},
    launcher::{
        ProcessLauncher, WorkerHandle, WorkerInput, WorkerLauncher, WorkerProcess, WorkerStdout,
    },
    pending::PendingTable,
    protocol::{commands, decode_line, LineReader},
};

const TRACE_STAGE: &str = "Engine";
// Responses written right before exit are still routed if they arrive within this window.
const EXIT_DRAIN: Duration = Duration::from_millis(500);

type StartFuture = Shared<BoxFuture<'static, EngineResult<()>>>;

pub struct SupervisorDeps {
    pub launcher: Arc<dyn WorkerLauncher>,
    pub resolve_candidates: fn(&EngineConfig) -> Vec<LaunchCandidate>,
    pub tracer: Tracer,
}

impl SupervisorDeps {
    pub fn for_config(cfg: &EngineConfig) -> Self {
        let tracer = Tracer::from_env(cfg.data_dir.clone());
        Self {
            launcher: Arc::new(ProcessLauncher::new(cfg, tracer.clone())),
            resolve_candidates: candidates::resolve_candidates,
            tracer,
        }
    }
}

struct LiveWorker {
    generation: u64,
    pid: Option<u32>,
    input: WorkerInput,
    pending: PendingTable,
    alive: AtomicBool,
    stopping: AtomicBool,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl LiveWorker {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct State {
    worker: Option<Arc<LiveWorker>>,
    starting: Option<StartFuture>,
    generation: u64,
    worker_command: Option<String>,
}

struct Inner {
    config: EngineConfig,
    deps: SupervisorDeps,
    broadcaster: Broadcaster,
    state: Mutex<State>,
    abandoned: AtomicBool,
}

/// Shared by every `Supervisor` clone. Background tasks hold `Inner` but not
/// this, so it drops with the last handle and takes the worker down with it.
struct Owner {
    inner: Weak<Inner>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.abandoned.store(true, Ordering::SeqCst);
        if let Some(worker) = inner.lock_state().worker.clone() {
            worker.stopping.store(true, Ordering::SeqCst);
            worker.kill.cancel();
        };
    }
}

/// Owns at most one worker process and multiplexes requests over it.
///
/// Cloning is cheap; all clones drive the same worker. Dropping the last
/// clone kills the worker without the polite `engine.stop`; call
/// [`Supervisor::stop`] first for a graceful shutdown.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
    _owner: Arc<Owner>,
}

impl Supervisor {
    pub fn new(config: EngineConfig) -> Self {
        let deps = SupervisorDeps::for_config(&config);
        Self::with_deps(config, deps)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(EngineConfig::from_env()?))
    }

    pub fn with_deps(config: EngineConfig, deps: SupervisorDeps) -> Self {
        let inner = Arc::new(Inner {
            config,
            deps,
            broadcaster: Broadcaster::new(),
            state: Mutex::new(State::default()),
            abandoned: AtomicBool::new(false),
        });
        let owner = Arc::new(Owner {
            inner: Arc::downgrade(&inner),
        });
        Self {
            inner,
            _owner: owner,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Candidates a start would try right now, in order.
    pub fn candidates(&self) -> Vec<LaunchCandidate> {
        (self.inner.deps.resolve_candidates)(&self.inner.config)
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.inner.broadcaster.snapshot()
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.broadcaster.watch()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.inner.broadcaster.subscribe(topic)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.broadcaster.unsubscribe(id)
    }

    /// Payload of the most recent `engine.runtime` event.
    pub fn last_runtime(&self) -> Option<Value> {
        self.inner.broadcaster.last_runtime()
    }

    /// Command line of the worker that last started successfully.
    pub fn worker_command(&self) -> Option<String> {
        self.inner.lock_state().worker_command.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.current_worker().is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner
            .current_worker()
            .map(|w| w.pending.len())
            .unwrap_or(0)
    }

    /// Returns once a worker is up. Concurrent callers share one launch
    /// sequence and all observe its outcome.
    pub async fn ensure_started(&self) -> EngineResult<()> {
        let start = {
            let mut st = self.inner.lock_state();
            if st.worker.as_ref().is_some_and(|w| w.is_alive()) {
                return Ok(());
            }
            if let Some(start) = st.starting.clone() {
                start
            } else {
                st.generation += 1;
                let generation = st.generation;
                let inner = Arc::clone(&self.inner);
                // Spawned so the launch completes even if every caller goes away.
                let task = tokio::spawn(inner.start_sequence(generation));
                let start = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(EngineError::LaunchFailed(format!(
                            "engine start task failed: {e}"
                        )))
                    })
                }
                .boxed()
                .shared();
                st.starting = Some(start.clone());
                start
            }
        };
        start.await
    }

    pub async fn request(&self, command: &str, payload: Value) -> EngineResult<Value> {
        self.request_with_timeout(command, payload, self.inner.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        command: &str,
        payload: Value,
        timeout: Duration,
    ) -> EngineResult<Value> {
        self.ensure_started().await?;
        let worker = self
            .inner
            .current_worker()
            .filter(|w| w.input.is_writable())
            .ok_or_else(|| EngineError::Unavailable("Engine is not available".to_string()))?;

        let res = worker
            .pending
            .submit(&worker.input, command, &payload, timeout)
            .await;
        if let Err(e) = &res {
            self.inner.deps.tracer.event_err(
                None,
                TRACE_STAGE,
                "ENGINE.request",
                TraceError {
                    kind: e.kind().to_string(),
                    code: e.code().to_string(),
                    message: e.message(),
                },
                Some(json!({
                    "command": command,
                    "timeout_ms": timeout.as_millis(),
                    "pid": worker.pid,
                })),
            );
        }
        res
    }

    /// Asks the worker to shut down, then terminates it. Safe to call when
    /// already stopped and while a start is in flight.
    pub async fn stop(&self) {
        let starting = self.inner.lock_state().starting.clone();
        if let Some(start) = starting {
            let _ = start.await;
        }
        let Some(worker) = self.inner.lock_state().worker.clone() else {
            return;
        };
        if worker.stopping.swap(true, Ordering::SeqCst) {
            worker.exited.cancelled().await;
            return;
        }

        let span = self.inner.deps.tracer.span(
            None,
            TRACE_STAGE,
            "ENGINE.stop",
            Some(json!({"pid": worker.pid})),
        );
        if worker.is_alive() && worker.input.is_writable() {
            let stop_timeout = self.inner.config.stop_timeout;
            let polite = tokio::time::timeout(
                stop_timeout,
                worker
                    .pending
                    .submit(&worker.input, commands::ENGINE_STOP, &json!({}), stop_timeout),
            )
            .await;
            match polite {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => safe_eprintln!("[engine] stop request failed, killing: {e}"),
                Err(_) => safe_eprintln!("[engine] stop request timed out, killing"),
            }
        }
        worker.kill.cancel();
        worker.exited.cancelled().await;
        span.ok(None);
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_worker(&self) -> Option<Arc<LiveWorker>> {
        self.lock_state()
            .worker
            .clone()
            .filter(|w| w.is_alive())
    }

    async fn start_sequence(self: Arc<Self>, generation: u64) -> EngineResult<()> {
        let span = self.deps.tracer.span(
            None,
            TRACE_STAGE,
            "ENGINE.start",
            Some(json!({"generation": generation})),
        );
        self.broadcaster.update_status(|s| {
            s.connected = false;
            s.running = false;
            s.phase = Phase::Launching;
        });
        self.broadcaster.publish_status();

        let candidates = (self.deps.resolve_candidates)(&self.config);
        let mut last_err = None;
        for (attempt, candidate) in candidates.iter().enumerate() {
            match self.deps.launcher.launch(candidate).await {
                Ok(handle) => {
                    let pid = handle.process.id();
                    self.install(generation, handle);
                    span.ok(Some(json!({
                        "attempt": attempt + 1,
                        "command": candidate.display(),
                        "pid": pid,
                    })));
                    return Ok(());
                }
                Err(e) => {
                    safe_eprintln!("[engine] candidate {} failed: {e}", candidate.display());
                    last_err = Some(e);
                }
            }
        }

        let message = last_err
            .map(|e| e.message())
            .unwrap_or_else(|| "Unable to start engine".to_string());
        self.lock_state().starting = None;
        self.broadcaster.update_status(|s| {
            *s = StatusSnapshot {
                connected: false,
                running: false,
                phase: Phase::Error,
                last_error: message.clone(),
            };
        });
        self.broadcaster.publish_status();

        let err = EngineError::LaunchFailed(message);
        span.err(
            err.kind(),
            err.code(),
            &err.message(),
            Some(json!({"candidates": candidates.len()})),
        );
        Err(err)
    }

    fn install(self: &Arc<Self>, generation: u64, handle: WorkerHandle) {
        let WorkerHandle {
            candidate,
            process,
            stdin,
            stdout,
            stderr,
            ready,
        } = handle;
        let worker = Arc::new(LiveWorker {
            generation,
            pid: process.id(),
            input: WorkerInput::new(stdin),
            pending: PendingTable::new(),
            alive: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            kill: CancellationToken::new(),
            exited: CancellationToken::new(),
        });
        {
            let mut st = self.lock_state();
            st.worker = Some(Arc::clone(&worker));
            st.starting = None;
            st.worker_command = Some(candidate.display());
        }
        self.broadcaster.on_event(ready);
        // Every handle went away while this start was in flight.
        if self.abandoned.load(Ordering::SeqCst) {
            worker.stopping.store(true, Ordering::SeqCst);
            worker.kill.cancel();
        }

        let reader = tokio::spawn(read_loop(Arc::clone(self), Arc::clone(&worker), stdout));
        if let Some(rx) = stderr {
            tokio::spawn(stderr_loop(Arc::clone(self), rx));
        }
        tokio::spawn(watch_exit(Arc::clone(self), worker, process, reader));
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    worker: Arc<LiveWorker>,
    mut stdout: LineReader<WorkerStdout>,
) {
    loop {
        match stdout.next_line().await {
            Ok(Some(line)) => match decode_line(&line) {
                Some(msg) => inner.broadcaster.on_message(msg, &worker.pending),
                None => {
                    if !line.trim().is_empty() {
                        safe_eprintln!("[engine] stdout: {}", line.trim_end());
                    }
                }
            },
            Ok(None) => break,
            Err(e) => {
                safe_eprintln!("[engine] read stdout failed: {e}");
                break;
            }
        }
    }
}

async fn stderr_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if !line.trim().is_empty() {
            safe_eprintln!("[engine] {}", line.trim_end());
        }
        inner.broadcaster.on_stderr(&line);
    }
}

async fn watch_exit(
    inner: Arc<Inner>,
    worker: Arc<LiveWorker>,
    mut process: Box<dyn WorkerProcess>,
    reader: JoinHandle<()>,
) {
    let exit = tokio::select! {
        res = process.wait() => res,
        _ = worker.kill.cancelled() => process.kill().await,
    };
    worker.alive.store(false, Ordering::SeqCst);
    worker.input.close().await;

    let drain = reader.abort_handle();
    if tokio::time::timeout(EXIT_DRAIN, reader).await.is_err() {
        drain.abort();
    }

    let detail = match &exit {
        Ok(info) => info.to_string(),
        Err(e) => format!("({})", e.message()),
    };
    let failed = worker
        .pending
        .fail_all(EngineError::Crashed(format!("Engine process exited {detail}")));
    let explicit = worker.stopping.load(Ordering::SeqCst);

    let current = {
        let mut st = inner.lock_state();
        let current = st
            .worker
            .as_ref()
            .is_some_and(|w| w.generation == worker.generation);
        if current {
            st.worker = None;
        }
        current
    };
    safe_eprintln!("[engine] process exited {detail} (explicit={explicit})");
    inner.deps.tracer.event(
        None,
        TRACE_STAGE,
        "ENGINE.exit",
        "ok",
        Some(json!({
            "pid": worker.pid,
            "exit": detail,
            "explicit": explicit,
            "failed_requests": failed,
        })),
    );

    // A newer worker already owns the snapshot.
    if current {
        inner.broadcaster.update_status(|s| {
            s.connected = false;
            s.running = false;
            if explicit || s.phase != Phase::Error {
                s.phase = Phase::Stopped;
            }
        });
        inner.broadcaster.publish_status();
    }
    worker.exited.cancel();
}
