//! In-memory worker for unit tests: duplex pipes instead of a child process.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::{mpsc, watch, Mutex as AsyncMutex},
};

use crate::{
    candidates::LaunchCandidate,
    error::{EngineError, EngineResult},
    launcher::{await_ready, ExitInfo, WorkerHandle, WorkerLauncher, WorkerProcess, WorkerStdout},
    protocol::{commands, LineReader},
};

pub(crate) const FAKE_PID: u32 = 4242;

#[derive(Clone)]
pub(crate) struct ExitSwitch {
    tx: Arc<watch::Sender<Option<ExitInfo>>>,
}

impl ExitSwitch {
    fn set(&self, info: ExitInfo) {
        // First exit wins, like a real process.
        self.tx.send_if_modified(|cur| {
            if cur.is_some() {
                return false;
            }
            *cur = Some(info);
            true
        });
    }

    pub(crate) fn exit(&self, code: i32) {
        self.set(ExitInfo {
            code: Some(code),
            signal: None,
        });
    }

    pub(crate) fn exit_info(&self) -> Option<ExitInfo> {
        *self.tx.borrow()
    }

    pub(crate) async fn exited(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }
}

pub(crate) struct FakeProcess {
    switch: ExitSwitch,
    rx: watch::Receiver<Option<ExitInfo>>,
}

impl FakeProcess {
    pub(crate) fn new() -> (Self, ExitSwitch) {
        let (tx, rx) = watch::channel(None);
        let switch = ExitSwitch { tx: Arc::new(tx) };
        (
            Self {
                switch: switch.clone(),
                rx,
            },
            switch,
        )
    }
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(FAKE_PID)
    }

    async fn wait(&mut self) -> EngineResult<ExitInfo> {
        self.rx
            .wait_for(Option::is_some)
            .await
            .map(|info| (*info).unwrap_or_default())
            .map_err(|_| EngineError::Io("fake process vanished".to_string()))
    }

    async fn kill(&mut self) -> EngineResult<ExitInfo> {
        self.switch.set(ExitInfo {
            code: None,
            signal: Some(9),
        });
        self.wait().await
    }
}

/// What the fake worker does with one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(Value),
    Reject(String),
    /// Never answer.
    Ignore,
    /// Answer ok after a delay, without blocking later requests.
    After(Duration, Value),
    /// Write these raw lines, then answer ok.
    Lines(Vec<String>, Value),
    /// Exit with this code without answering.
    Exit(i32),
    /// Stop reading input for good; the pipe fills up behind it.
    Stall,
}

pub(crate) type Script = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

pub(crate) fn echo_script() -> Script {
    Arc::new(|cmd: &str, payload: &Value| Reply::Ok(json!({"cmd": cmd, "payload": payload})))
}

pub(crate) struct FakeLauncher {
    script: Script,
    missing: Vec<String>,
    never_ready: Vec<String>,
    delay: Duration,
    startup_timeout: Duration,
    stdin_capacity: usize,
    launches: AtomicUsize,
    attempted: Mutex<Vec<LaunchCandidate>>,
    switches: Mutex<Vec<ExitSwitch>>,
}

impl FakeLauncher {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            missing: Vec::new(),
            never_ready: Vec::new(),
            delay: Duration::ZERO,
            startup_timeout: Duration::from_millis(50),
            stdin_capacity: 1 << 16,
            launches: AtomicUsize::new(0),
            attempted: Mutex::new(Vec::new()),
            switches: Mutex::new(Vec::new()),
        }
    }

    /// Commands that fail to spawn.
    pub(crate) fn with_missing(mut self, commands: &[&str]) -> Self {
        self.missing = commands.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Commands that spawn but never signal readiness.
    pub(crate) fn never_ready_for(mut self, commands: &[&str]) -> Self {
        self.never_ready = commands.iter().map(|s| s.to_string()).collect();
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Bytes the worker's stdin pipe buffers before writes block.
    pub(crate) fn with_stdin_capacity(mut self, bytes: usize) -> Self {
        self.stdin_capacity = bytes;
        self
    }

    /// Processes actually started (spawn failures excluded).
    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn attempted(&self) -> Vec<String> {
        self.attempted_candidates()
            .into_iter()
            .map(|c| c.command)
            .collect()
    }

    pub(crate) fn attempted_candidates(&self) -> Vec<LaunchCandidate> {
        self.attempted.lock().unwrap().clone()
    }

    pub(crate) fn last_switch(&self) -> Option<ExitSwitch> {
        self.switches.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, candidate: &LaunchCandidate) -> EngineResult<WorkerHandle> {
        self.attempted.lock().unwrap().push(candidate.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.missing.contains(&candidate.command) {
            return Err(EngineError::LaunchFailed(format!(
                "failed to spawn engine '{}': No such file or directory",
                candidate.command
            )));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (sup_stdin, worker_stdin) = tokio::io::duplex(self.stdin_capacity);
        let (worker_stdout, sup_stdout) = tokio::io::duplex(1 << 16);
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (mut process, switch) = FakeProcess::new();
        self.switches.lock().unwrap().push(switch.clone());

        let ready = !self.never_ready.contains(&candidate.command);
        tokio::spawn(run_worker(
            Arc::clone(&self.script),
            ready,
            worker_stdin,
            worker_stdout,
            stderr_tx,
            switch,
        ));

        let mut stdout = LineReader::new(Box::new(sup_stdout) as WorkerStdout);
        let ready = match await_ready(&mut stdout, &mut process, self.startup_timeout).await {
            Ok(ready) => ready,
            Err(e) => {
                let _ = process.kill().await;
                return Err(e);
            }
        };
        Ok(WorkerHandle {
            candidate: candidate.clone(),
            process: Box::new(process),
            stdin: Box::new(sup_stdin),
            stdout,
            stderr: Some(stderr_rx),
            ready,
        })
    }
}

type SharedOut = Arc<AsyncMutex<DuplexStream>>;

async fn write_line(out: &SharedOut, line: &str) {
    let mut out = out.lock().await;
    let _ = out.write_all(format!("{line}\n").as_bytes()).await;
}

fn response(id: &Value, ok: bool, data: Value) -> String {
    json!({"type": "response", "id": id, "ok": ok, "data": data}).to_string()
}

async fn run_worker(
    script: Script,
    ready: bool,
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: mpsc::UnboundedSender<String>,
    switch: ExitSwitch,
) {
    let out: SharedOut = Arc::new(AsyncMutex::new(stdout));
    write_line(&out, "warming up model...").await;
    if !ready {
        switch.exited().await;
        return;
    }
    write_line(
        &out,
        &json!({"type": "engine.ready", "data": {"pid": FAKE_PID}}).to_string(),
    )
    .await;
    let _ = stderr.send("fake worker booted".to_string());

    let mut lines = LineReader::new(stdin);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
            _ = switch.exited() => break,
        };
        let Ok(req) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = req["id"].clone();
        let cmd = req["cmd"].as_str().unwrap_or_default().to_string();
        let reply = script(&cmd, &req["payload"]);

        // A stop that is answered also ends the process.
        if cmd == commands::ENGINE_STOP && !matches!(reply, Reply::Ignore) {
            switch.exit(0);
            write_line(&out, &response(&id, true, json!({}))).await;
            break;
        }
        match reply {
            Reply::Ok(data) => write_line(&out, &response(&id, true, data)).await,
            Reply::Reject(reason) => {
                write_line(&out, &response(&id, false, json!({"error": reason}))).await
            }
            Reply::Ignore => {}
            Reply::After(delay, data) => {
                let out = Arc::clone(&out);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_line(&out, &response(&id, true, data)).await;
                });
            }
            Reply::Lines(raw, data) => {
                for line in raw {
                    write_line(&out, &line).await;
                }
                write_line(&out, &response(&id, true, data)).await;
            }
            Reply::Exit(code) => {
                switch.exit(code);
                break;
            }
            Reply::Stall => {
                switch.exited().await;
                break;
            }
        }
    }
}
