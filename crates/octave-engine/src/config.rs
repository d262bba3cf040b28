use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use octave_observability::{data_dir, trace};

pub const PYTHON_OVERRIDE_ENV: &str = "OCTAVE_PYTHON_BIN";
pub const PACKAGED_ENV: &str = "OCTAVE_PACKAGED";
pub const INSTALL_ROOT_ENV: &str = "OCTAVE_INSTALL_ROOT";
pub const RESOURCES_DIR_ENV: &str = "OCTAVE_RESOURCES_DIR";
pub const STARTUP_TIMEOUT_ENV: &str = "OCTAVE_ENGINE_STARTUP_TIMEOUT_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "OCTAVE_ENGINE_REQUEST_TIMEOUT_MS";
pub const STOP_TIMEOUT_ENV: &str = "OCTAVE_ENGINE_STOP_TIMEOUT_MS";

// Model loading in the worker routinely takes several seconds.
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    pub fn exe_name(&self, stem: &str) -> String {
        match self {
            Platform::Windows => format!("{stem}.exe"),
            Platform::Unix => stem.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Launch command override; blank means unset.
    pub python_override: Option<String>,
    /// Packaged deployments look for a pre-built worker binary first.
    pub packaged: bool,
    pub install_root: PathBuf,
    pub resources_dir: Option<PathBuf>,
    pub working_dir: PathBuf,
    /// Handed to the worker and used for trace files.
    pub data_dir: PathBuf,
    pub platform: Platform,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            python_override: None,
            packaged: false,
            install_root: working_dir.clone(),
            resources_dir: None,
            data_dir: working_dir.join("tmp").join("octave-data"),
            working_dir,
            platform: Platform::current(),
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        }
    }
}

fn env_nonblank(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    Some(t.to_string())
}

fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    // Zero would make every request time out instantly.
    Duration::from_millis(trace::env_u64(key, default_ms).max(1))
}

fn default_install_root() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("resolve current executable failed")?;
    Ok(exe
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".")))
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let working_dir = std::env::current_dir().context("resolve current dir failed")?;
        let install_root = match env_nonblank(INSTALL_ROOT_ENV) {
            Some(p) => PathBuf::from(p),
            None => default_install_root()?,
        };
        Ok(Self {
            python_override: env_nonblank(PYTHON_OVERRIDE_ENV),
            packaged: trace::env_bool(PACKAGED_ENV, false),
            install_root,
            resources_dir: env_nonblank(RESOURCES_DIR_ENV).map(PathBuf::from),
            working_dir,
            data_dir: data_dir::data_dir()?,
            platform: Platform::current(),
            startup_timeout: env_duration_ms(STARTUP_TIMEOUT_ENV, DEFAULT_STARTUP_TIMEOUT_MS),
            request_timeout: env_duration_ms(REQUEST_TIMEOUT_ENV, DEFAULT_REQUEST_TIMEOUT_MS),
            stop_timeout: env_duration_ms(STOP_TIMEOUT_ENV, DEFAULT_STOP_TIMEOUT_MS),
        })
    }
}
