use std::path::PathBuf;

use anyhow::{Context, Result};

pub const DATA_DIR_ENV: &str = "OCTAVE_DATA_DIR";

/// Directory for trace files; also handed to the worker.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(raw) = std::env::var(DATA_DIR_ENV) {
        let t = raw.trim();
        if !t.is_empty() {
            return Ok(PathBuf::from(t));
        }
    }
    // Dev default: <cwd>/tmp/octave-data
    let cwd = std::env::current_dir().context("resolve current dir for data dir failed")?;
    Ok(cwd.join("tmp").join("octave-data"))
}
