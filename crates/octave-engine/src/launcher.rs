use std::{
    fmt,
    path::PathBuf,
    process::Stdio,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use octave_observability::{data_dir::DATA_DIR_ENV, safe_eprintln, Tracer};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    process::{Child, Command},
    sync::{mpsc, Mutex as AsyncMutex},
};

use crate::{
    candidates::LaunchCandidate,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    pending::LineSink,
    protocol::{decode_line, InboundMessage, LineReader, WorkerEvent, EVENT_READY},
};

pub type WorkerStdin = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerStdout = Box<dyn AsyncRead + Send + Unpin>;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt(v: Option<i32>) -> String {
            v.map(|n| n.to_string()).unwrap_or_else(|| "null".to_string())
        }
        write!(f, "({}, {})", opt(self.code), opt(self.signal))
    }
}

/// The running worker process, as far as the supervisor needs it.
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;
    /// Resolves once the process has exited.
    async fn wait(&mut self) -> EngineResult<ExitInfo>;
    /// Terminates the process and reaps it.
    async fn kill(&mut self) -> EngineResult<ExitInfo>;
}

#[async_trait]
impl WorkerProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    async fn wait(&mut self) -> EngineResult<ExitInfo> {
        Child::wait(self)
            .await
            .map(ExitInfo::from)
            .map_err(|e| EngineError::Io(format!("wait for engine process failed: {e}")))
    }

    async fn kill(&mut self) -> EngineResult<ExitInfo> {
        // Fails only when the process is already gone; the wait below reaps either way.
        let _ = self.start_kill();
        WorkerProcess::wait(self).await
    }
}

/// A worker that completed the handshake. Ownership moves to the supervisor.
pub struct WorkerHandle {
    pub candidate: LaunchCandidate,
    pub process: Box<dyn WorkerProcess>,
    pub stdin: WorkerStdin,
    /// Same reader the handshake used; nothing buffered is lost.
    pub stdout: LineReader<WorkerStdout>,
    /// Diagnostic lines, already being drained so the pipe never fills up.
    pub stderr: Option<mpsc::UnboundedReceiver<String>>,
    /// The readiness event that completed the handshake.
    pub ready: WorkerEvent,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// One attempt with one candidate. On failure the process is already dead.
    async fn launch(&self, candidate: &LaunchCandidate) -> EngineResult<WorkerHandle>;
}

/// Reads stdout until the first `engine.ready` event, the process exits, or
/// `timeout` elapses. Non-protocol lines and other events are skipped.
pub async fn await_ready(
    stdout: &mut LineReader<WorkerStdout>,
    process: &mut dyn WorkerProcess,
    timeout: Duration,
) -> EngineResult<WorkerEvent> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = stdout.next_line() => match line {
                Ok(Some(line)) => match decode_line(&line) {
                    Some(InboundMessage::Event(ev)) if ev.name == EVENT_READY => return Ok(ev),
                    Some(_) => {}
                    None => {
                        if !line.trim().is_empty() {
                            safe_eprintln!("[engine] stdout: {}", line.trim_end());
                        }
                    }
                },
                Ok(None) => {
                    // Output closed: the process is on its way out. Prefer its exit status.
                    let exit = tokio::time::timeout(Duration::from_secs(2), process.wait()).await;
                    return Err(match exit {
                        Ok(Ok(info)) => EngineError::LaunchFailed(format!("Engine exited early {info}")),
                        _ => EngineError::LaunchFailed("Engine closed its output before ready".to_string()),
                    });
                }
                Err(e) => {
                    return Err(EngineError::LaunchFailed(format!(
                        "read engine output failed: {e}"
                    )))
                }
            },
            exit = process.wait() => {
                let detail = match exit {
                    Ok(info) => info.to_string(),
                    Err(e) => e.message(),
                };
                return Err(EngineError::LaunchFailed(format!("Engine exited early {detail}")));
            }
            _ = &mut deadline => {
                return Err(EngineError::LaunchFailed("Engine startup timed out".to_string()));
            }
        }
    }
}

/// Launches candidates as real child processes.
pub struct ProcessLauncher {
    data_dir: PathBuf,
    startup_timeout: Duration,
    tracer: Tracer,
}

impl ProcessLauncher {
    pub fn new(cfg: &EngineConfig, tracer: Tracer) -> Self {
        Self {
            data_dir: cfg.data_dir.clone(),
            startup_timeout: cfg.startup_timeout,
            tracer,
        }
    }

    fn command_for(&self, candidate: &LaunchCandidate) -> Command {
        let mut cmd = Command::new(&candidate.command);
        cmd.args(candidate.argv())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env(DATA_DIR_ENV, &self.data_dir)
            .kill_on_drop(true);
        if let Some(dir) = candidate.working_dir() {
            cmd.current_dir(dir);
        }
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }
}

fn forward_stderr(stderr: WorkerStdout) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = LineReader::new(stderr);
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, candidate: &LaunchCandidate) -> EngineResult<WorkerHandle> {
        let span = self.tracer.span(
            None,
            "Engine",
            "ENGINE.launch",
            Some(serde_json::json!({
                "command": candidate.command,
                "args": candidate.argv(),
                "prebuilt": candidate.prebuilt,
                "cwd": candidate.working_dir().map(|p| p.display().to_string()),
            })),
        );
        safe_eprintln!("[engine] spawning: {}", candidate.display());

        let mut child = match self.command_for(candidate).spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = EngineError::LaunchFailed(format!(
                    "failed to spawn engine '{}': {e}",
                    candidate.command
                ));
                span.err(err.kind(), err.code(), &err.message(), None);
                return Err(err);
            }
        };
        let pid = child.id();

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(i), Some(o), Some(e)) => (i, o, e),
                _ => {
                    let _ = WorkerProcess::kill(&mut child).await;
                    let err = EngineError::LaunchFailed("engine stdio pipes missing".to_string());
                    span.err(err.kind(), err.code(), &err.message(), None);
                    return Err(err);
                }
            };

        let stderr_rx = forward_stderr(Box::new(stderr));
        let mut stdout = LineReader::new(Box::new(stdout) as WorkerStdout);

        match await_ready(&mut stdout, &mut child, self.startup_timeout).await {
            Ok(ready) => {
                safe_eprintln!("[engine] ready signal received (pid={pid:?})");
                span.ok(Some(serde_json::json!({"pid": pid})));
                Ok(WorkerHandle {
                    candidate: candidate.clone(),
                    process: Box::new(child),
                    stdin: Box::new(stdin),
                    stdout,
                    stderr: Some(stderr_rx),
                    ready,
                })
            }
            Err(err) => {
                let _ = WorkerProcess::kill(&mut child).await;
                safe_eprintln!("[engine] startup failed: {err}");
                span.err(
                    err.kind(),
                    err.code(),
                    &err.message(),
                    Some(serde_json::json!({"pid": pid})),
                );
                Err(err)
            }
        }
    }
}

/// Serialized writer over the worker's stdin.
///
/// One lock holder at a time, one full line per hold. A failed write marks the
/// input unwritable so later requests fail fast.
pub struct WorkerInput {
    stdin: AsyncMutex<Option<WorkerStdin>>,
    writable: AtomicBool,
}

impl WorkerInput {
    pub fn new(stdin: WorkerStdin) -> Self {
        Self {
            stdin: AsyncMutex::new(Some(stdin)),
            writable: AtomicBool::new(true),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.writable.store(false, Ordering::SeqCst);
    }

    /// Closes stdin. If a writer is still blocked on a full pipe the handle
    /// stays with it until that writer's deadline.
    pub async fn close(&self) {
        self.mark_closed();
        let Ok(mut guard) = self.stdin.try_lock() else {
            return;
        };
        if let Some(mut stdin) = guard.take() {
            let _ = stdin.shutdown().await;
        }
    }
}

#[async_trait]
impl LineSink for WorkerInput {
    async fn write_line(&self, line: &str) -> EngineResult<()> {
        if !self.is_writable() {
            return Err(EngineError::Unavailable("Engine is not available".to_string()));
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(EngineError::Unavailable("Engine is not available".to_string()));
        };
        let res = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = res {
            self.mark_closed();
            return Err(EngineError::Io(format!("write engine request failed: {e}")));
        }
        Ok(())
    }

    fn mark_broken(&self) {
        self.mark_closed();
    }
}
