mod safe_print;

pub mod data_dir;
pub mod trace;

pub use trace::{Span, TraceError, TraceEvent, TraceSettings, Tracer};

#[cfg(test)]
pub(crate) fn test_env_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}
