//! Supervisor for the out-of-process recognition engine.
//!
//! The worker is a separate program speaking newline-delimited JSON over
//! stdio. [`Supervisor`] launches it on demand, correlates requests with
//! responses, tracks its status and fans its events out to subscribers.

pub mod broadcaster;
pub mod candidates;
pub mod config;
pub mod error;
pub mod launcher;
pub mod pending;
pub mod protocol;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use broadcaster::{Phase, StatusSnapshot, Subscription, ALL_EVENTS};
pub use candidates::{resolve_candidates, LaunchCandidate};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use protocol::{commands, WorkerEvent};
pub use supervisor::{Supervisor, SupervisorDeps};

#[cfg(test)]
pub(crate) fn test_env_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}
