use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{EngineConfig, Platform};

pub const WORKER_SCRIPT: &str = "service.py";
const WORKER_SCRIPT_SUBDIR: &str = "python_engine";
const BUNDLE_SUBDIR: [&str; 2] = ["python_dist", "service"];
const BUNDLE_STEM: &str = "service";

/// One way of starting the worker.
///
/// Interpreter candidates carry the discovered script path; pre-built
/// binaries are launched bare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchCandidate {
    pub command: String,
    pub args: Vec<String>,
    pub prebuilt: bool,
    pub script: Option<PathBuf>,
}

impl LaunchCandidate {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        if let Some(script) = &self.script {
            argv.push(script.display().to_string());
        }
        argv
    }

    /// Directory of the binary for pre-built workers, of the script otherwise.
    pub fn working_dir(&self) -> Option<PathBuf> {
        let anchor = if self.prebuilt {
            Path::new(&self.command)
        } else {
            self.script.as_deref()?
        };
        anchor
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.argv());
        parts.join(" ")
    }
}

pub fn bundled_binary_locations(cfg: &EngineConfig) -> Vec<PathBuf> {
    let exe = cfg.platform.exe_name(BUNDLE_STEM);
    let mut roots = vec![cfg.install_root.clone()];
    roots.extend(cfg.resources_dir.clone());
    roots
        .into_iter()
        .map(|root| {
            BUNDLE_SUBDIR
                .iter()
                .fold(root, |p, seg| p.join(seg))
                .join(&exe)
        })
        .collect()
}

pub fn bundled_binary(cfg: &EngineConfig) -> Option<PathBuf> {
    if !cfg.packaged {
        return None;
    }
    bundled_binary_locations(cfg).into_iter().find(|p| p.is_file())
}

pub fn script_locations(cfg: &EngineConfig) -> Vec<PathBuf> {
    let mut roots = vec![cfg.install_root.clone()];
    roots.extend(cfg.resources_dir.clone());
    roots.push(cfg.working_dir.clone());
    roots
        .into_iter()
        .flat_map(|root| {
            [
                root.join(WORKER_SCRIPT),
                root.join(WORKER_SCRIPT_SUBDIR).join(WORKER_SCRIPT),
            ]
        })
        .collect()
}

/// First existing script location, else the first listed one so the spawn
/// fails with a clear "not found" for that path.
pub fn pick_script_path(cfg: &EngineConfig) -> PathBuf {
    let locations = script_locations(cfg);
    locations
        .iter()
        .find(|p| p.is_file())
        .or_else(|| locations.first())
        .cloned()
        .unwrap_or_else(|| PathBuf::from(WORKER_SCRIPT))
}

fn interpreter_chain(platform: Platform) -> Vec<(&'static str, Vec<String>)> {
    match platform {
        Platform::Windows => vec![("python", Vec::new()), ("py", vec!["-3".to_string()])],
        Platform::Unix => vec![("python3", Vec::new()), ("python", Vec::new())],
    }
}

/// Ordered launch candidates for the current environment. Never empty.
pub fn resolve_candidates(cfg: &EngineConfig) -> Vec<LaunchCandidate> {
    if let Some(cmd) = cfg
        .python_override
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return vec![LaunchCandidate {
            command: cmd.to_string(),
            args: Vec::new(),
            prebuilt: false,
            script: Some(pick_script_path(cfg)),
        }];
    }

    if let Some(exe) = bundled_binary(cfg) {
        return vec![LaunchCandidate {
            command: exe.display().to_string(),
            args: Vec::new(),
            prebuilt: true,
            script: None,
        }];
    }

    let script = pick_script_path(cfg);
    interpreter_chain(cfg.platform)
        .into_iter()
        .map(|(command, args)| LaunchCandidate {
            command: command.to_string(),
            args,
            prebuilt: false,
            script: Some(script.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_in(root: &Path) -> EngineConfig {
        EngineConfig {
            install_root: root.join("app"),
            resources_dir: Some(root.join("resources")),
            working_dir: root.join("cwd"),
            data_dir: root.join("data"),
            platform: Platform::Unix,
            ..EngineConfig::default()
        }
    }

    fn touch(p: &Path) {
        std::fs::create_dir_all(p.parent().unwrap_or(Path::new("."))).expect("mkdir");
        std::fs::write(p, b"x").expect("write");
    }

    #[test]
    fn blank_override_is_ignored_and_bundled_binary_wins() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = cfg_in(td.path());
        cfg.python_override = Some("   ".to_string());
        cfg.packaged = true;
        let exe = td
            .path()
            .join("resources")
            .join("python_dist")
            .join("service")
            .join("service");
        touch(&exe);

        let got = resolve_candidates(&cfg);
        assert_eq!(got.len(), 1);
        assert!(got[0].prebuilt);
        assert_eq!(got[0].command, exe.display().to_string());
        assert!(got[0].argv().is_empty());
        assert_eq!(got[0].working_dir().as_deref(), exe.parent());
    }

    #[test]
    fn override_yields_single_candidate() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = cfg_in(td.path());
        cfg.python_override = Some("/opt/venv/bin/python".to_string());
        cfg.packaged = true;
        touch(&bundled_binary_locations(&cfg)[0]);

        let got = resolve_candidates(&cfg);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].command, "/opt/venv/bin/python");
        assert!(got[0].args.is_empty());
        assert!(!got[0].prebuilt);
    }

    #[test]
    fn bundled_binary_is_ignored_in_development() {
        let td = tempfile::tempdir().expect("tempdir");
        let cfg = cfg_in(td.path());
        touch(&bundled_binary_locations(&cfg)[0]);

        let got = resolve_candidates(&cfg);
        assert!(got.iter().all(|c| !c.prebuilt));
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn unix_chain_tries_python3_then_python_with_script() {
        let td = tempfile::tempdir().expect("tempdir");
        let cfg = cfg_in(td.path());
        let script = td.path().join("cwd").join("python_engine").join(WORKER_SCRIPT);
        touch(&script);

        let got = resolve_candidates(&cfg);
        let commands: Vec<&str> = got.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(commands, vec!["python3", "python"]);
        for c in &got {
            assert_eq!(c.argv().last(), Some(&script.display().to_string()));
            assert_eq!(c.working_dir().as_deref(), script.parent());
        }
    }

    #[test]
    fn windows_chain_uses_py_launcher_fallback() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = cfg_in(td.path());
        cfg.platform = Platform::Windows;

        let got = resolve_candidates(&cfg);
        assert_eq!(got[0].command, "python");
        assert_eq!(got[1].command, "py");
        assert_eq!(got[1].args, vec!["-3".to_string()]);
    }

    #[test]
    fn script_discovery_prefers_install_root_over_cwd() {
        let td = tempfile::tempdir().expect("tempdir");
        let cfg = cfg_in(td.path());
        let in_root = td.path().join("app").join(WORKER_SCRIPT);
        touch(&in_root);
        touch(&td.path().join("cwd").join(WORKER_SCRIPT));

        assert_eq!(pick_script_path(&cfg), in_root);
    }

    #[test]
    fn missing_script_falls_back_to_first_location() {
        let td = tempfile::tempdir().expect("tempdir");
        let cfg = cfg_in(td.path());
        assert_eq!(pick_script_path(&cfg), td.path().join("app").join(WORKER_SCRIPT));
    }

    #[test]
    fn windows_bundle_name_has_exe_suffix() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = cfg_in(td.path());
        cfg.platform = Platform::Windows;
        let locations = bundled_binary_locations(&cfg);
        assert_eq!(locations.len(), 2);
        assert!(locations.iter().all(|p| p.ends_with("service.exe")));
    }
}
