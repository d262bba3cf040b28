use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use serde_json::Value;

const TRACE_FILE: &str = "trace.jsonl";
const DEFAULT_TRACE_MAX_BYTES: u64 = 10_000_000; // 10MB
const DEFAULT_TRACE_MAX_FILES: usize = 5;
const DEFAULT_BACKTRACE_MAX_CHARS: usize = 12_000;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            match t.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => default,
            }
        }
        Err(_) => default,
    }
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(v) => v.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct TraceSettings {
    pub enabled: bool,
    pub backtrace: bool,
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backtrace: true,
            max_bytes: DEFAULT_TRACE_MAX_BYTES,
            max_files: DEFAULT_TRACE_MAX_FILES,
        }
    }
}

impl TraceSettings {
    pub fn from_env() -> Self {
        // Both switches default to on; set OCTAVE_TRACE_ENABLED=0 to silence the file.
        Self {
            enabled: env_bool("OCTAVE_TRACE_ENABLED", true),
            backtrace: env_bool("OCTAVE_TRACE_BACKTRACE", true),
            max_bytes: env_u64("OCTAVE_TRACE_MAX_BYTES", DEFAULT_TRACE_MAX_BYTES),
            max_files: env_usize("OCTAVE_TRACE_MAX_FILES", DEFAULT_TRACE_MAX_FILES),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String,    // process|io|protocol|timeout|worker|logic
    pub code: String,    // E_*
    pub message: String, // short
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub correlation_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

struct TracerInner {
    dir: PathBuf,
    settings: TraceSettings,
}

/// Appends JSONL trace records to `<dir>/trace.jsonl`, rotating by size.
///
/// Every write is best-effort: failures are reported on stderr and otherwise
/// ignored so tracing can never take the supervisor down.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("dir", &self.inner.dir)
            .field("enabled", &self.inner.settings.enabled)
            .finish()
    }
}

fn trace_write_lock() -> &'static Mutex<()> {
    static TRACE_WRITE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    TRACE_WRITE_LOCK.get_or_init(|| Mutex::new(()))
}

pub fn trace_path(dir: &Path) -> PathBuf {
    dir.join(TRACE_FILE)
}

impl Tracer {
    pub fn new(dir: impl Into<PathBuf>, settings: TraceSettings) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                dir: dir.into(),
                settings,
            }),
        }
    }

    pub fn from_env(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, TraceSettings::from_env())
    }

    /// A tracer that never touches the filesystem.
    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), TraceSettings::disabled())
    }

    pub fn path(&self) -> PathBuf {
        trace_path(&self.inner.dir)
    }

    pub fn event(
        &self,
        correlation_id: Option<&str>,
        stage: &str,
        step_id: &str,
        status: &str,
        ctx: Option<Value>,
    ) {
        self.emit(&TraceEvent {
            ts_ms: now_ms(),
            correlation_id: correlation_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        });
    }

    pub fn event_err(
        &self,
        correlation_id: Option<&str>,
        stage: &str,
        step_id: &str,
        error: TraceError,
        ctx: Option<Value>,
    ) {
        self.emit(&TraceEvent {
            ts_ms: now_ms(),
            correlation_id: correlation_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: "err".to_string(),
            duration_ms: None,
            error: Some(error),
            ctx,
        });
    }

    pub fn span(
        &self,
        correlation_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Span {
        Span::start(self.clone(), correlation_id, stage, step_id, ctx)
    }

    pub fn emit(&self, ev: &TraceEvent) {
        if !self.inner.settings.enabled {
            return;
        }
        let dir = &self.inner.dir;
        let _guard = trace_write_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = std::fs::create_dir_all(dir);
        self.rotate_if_needed_best_effort();

        let p = trace_path(dir);
        let mut f = match OpenOptions::new().create(true).append(true).open(&p) {
            Ok(f) => f,
            Err(e) => {
                crate::safe_eprintln!("trace: open failed: {}: {e}", p.display());
                return;
            }
        };
        let mut line = match serde_json::to_string(ev) {
            Ok(s) => s,
            Err(e) => {
                crate::safe_eprintln!("trace: serialize failed: {e}");
                return;
            }
        };
        line.push('\n');
        if let Err(e) = f.write_all(line.as_bytes()) {
            crate::safe_eprintln!("trace: write failed: {e}");
        }
    }

    fn rotate_if_needed_best_effort(&self) {
        let dir = &self.inner.dir;
        let max_f = self.inner.settings.max_files;
        if max_f == 0 {
            return;
        }
        let p = trace_path(dir);
        let len = match std::fs::metadata(&p) {
            Ok(m) => m.len(),
            Err(_) => return,
        };
        if len <= self.inner.settings.max_bytes {
            return;
        }

        // Oldest goes first so renames on Windows never hit an existing target.
        let oldest = dir.join(format!("{TRACE_FILE}.{max_f}"));
        if oldest.exists() {
            let _ = std::fs::remove_file(&oldest);
        }
        for i in (1..max_f).rev() {
            let src = dir.join(format!("{TRACE_FILE}.{i}"));
            let dst = dir.join(format!("{TRACE_FILE}.{}", i + 1));
            if src.exists() {
                let _ = std::fs::rename(&src, &dst);
            }
        }
        let _ = std::fs::rename(&p, dir.join(format!("{TRACE_FILE}.1")));
    }

    fn backtrace_string(&self) -> Option<String> {
        if !self.inner.settings.backtrace {
            return None;
        }
        let bt = std::backtrace::Backtrace::force_capture();
        let s = format!("{bt:?}");
        Some(clamp_chars(
            &redact_user_paths(&s),
            DEFAULT_BACKTRACE_MAX_CHARS,
        ))
    }

    fn ctx_with_backtrace(&self, extra: Option<Value>) -> Option<Value> {
        match self.backtrace_string() {
            None => extra,
            Some(bt) => {
                let mut m = serde_json::Map::new();
                m.insert("backtrace".to_string(), Value::String(bt));
                Some(merge_ctx(m, extra))
            }
        }
    }
}

pub(crate) fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|ch| *ch != '\0').take(max_chars).collect()
}

/// Scrubs the user name out of common home-directory prefixes.
pub fn redact_user_paths(s: &str) -> String {
    fn scrub_after(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut i = 0;
        while let Some(pos) = hay[i..].find(marker) {
            let abs = i + pos;
            out.push_str(&hay[i..abs]);
            out.push_str(marker);
            let name_start = abs + marker.len();
            let name_len = hay[name_start..]
                .find(sep)
                .unwrap_or(hay.len() - name_start);
            out.push_str("<redacted>");
            i = name_start + name_len;
        }
        out.push_str(&hay[i..]);
        out
    }

    let mut t = scrub_after(s, "\\Users\\", '\\');
    t = scrub_after(&t, "/Users/", '/');
    scrub_after(&t, "/home/", '/')
}

fn merge_ctx(base: serde_json::Map<String, Value>, extra: Option<Value>) -> Value {
    let mut out = base;
    match extra {
        None => {}
        Some(Value::Object(m)) => out.extend(m),
        Some(v) => {
            out.insert("extra".to_string(), v);
        }
    }
    Value::Object(out)
}

/// A start/end pair in the trace file. Dropping a span without finishing it
/// records an `aborted` end.
pub struct Span {
    tracer: Tracer,
    correlation_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    fn start(
        tracer: Tracer,
        correlation_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let span = Self {
            tracer,
            correlation_id: correlation_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        };
        span.emit_record("start", "ok", None, ctx);
        span
    }

    fn emit_record(&self, op: &str, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        let duration_ms = (op == "end").then(|| self.t0.elapsed().as_millis());
        self.tracer.emit(&TraceEvent {
            ts_ms: now_ms(),
            correlation_id: self.correlation_id.clone(),
            stage: self.stage.clone(),
            step_id: self.step_id.clone(),
            op: op.to_string(),
            status: status.to_string(),
            duration_ms,
            error,
            ctx,
        });
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.finished = true;
        self.emit_record("end", "ok", None, ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        self.finished = true;
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        let ctx = self.tracer.ctx_with_backtrace(ctx);
        self.emit_record("end", "err", Some(error), ctx);
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        let ctx = self.tracer.ctx_with_backtrace(None);
        self.emit_record("end", "aborted", Some(error), ctx);
    }
}
