//! Layered configuration files for the session default runner.
//!
//! Three optional locations, highest priority first: project
//! (`.tasktree-config.yml`, found by walking up from the working
//! directory), user (`~/.config/tasktree/config.yml`), machine
//! (`/etc/tasktree/config.yml`). A config file may define exactly one
//! runner, named `default`. Files that fail to parse log a warning and
//! are ignored; explicit runners in the recipe always win.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::core::loader::normalize_runner;
use crate::core::types::{RawRunner, Runner};

pub const PROJECT_CONFIG_NAME: &str = ".tasktree-config.yml";

/// User-level config path, honouring `XDG_CONFIG_HOME` on POSIX and
/// `APPDATA` on Windows.
pub fn user_config_path(env: &HashMap<String, String>) -> Option<PathBuf> {
    if cfg!(windows) {
        env.get("APPDATA")
            .map(|base| Path::new(base).join("tasktree").join("config.yml"))
    } else if let Some(xdg) = env.get("XDG_CONFIG_HOME").filter(|s| !s.is_empty()) {
        Some(Path::new(xdg).join("tasktree").join("config.yml"))
    } else {
        env.get("HOME")
            .map(|home| Path::new(home).join(".config").join("tasktree").join("config.yml"))
    }
}

/// Machine-level (system-wide) config path.
pub fn machine_config_path(env: &HashMap<String, String>) -> Option<PathBuf> {
    if cfg!(windows) {
        env.get("PROGRAMDATA")
            .map(|base| Path::new(base).join("tasktree").join("config.yml"))
    } else {
        Some(PathBuf::from("/etc/tasktree/config.yml"))
    }
}

/// Walk up from `start_dir` looking for the project config file.
pub fn find_project_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    loop {
        let candidate = current.join(PROJECT_CONFIG_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Parse a config file and return its `default` runner, if any.
///
/// Missing file and empty file are both `None`. Structural problems are
/// errors so the caller can decide to warn.
pub fn parse_config_file(path: &Path) -> Result<Option<Runner>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    if content.trim().is_empty() {
        return Ok(None);
    }

    let doc: serde_yaml_ng::Value = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid YAML in {}: {}", path.display(), e))?;
    let Some(runners) = doc.get("runners") else {
        return Ok(None);
    };
    let Some(map) = runners.as_mapping() else {
        return Err(format!("{}: 'runners' must be a mapping", path.display()));
    };

    let mut default = None;
    for (key, value) in map {
        let name = key.as_str().unwrap_or_default();
        if name != "default" {
            return Err(format!(
                "{}: config files may only define a runner named 'default', found '{}'",
                path.display(),
                name
            ));
        }
        let raw: RawRunner = serde_yaml_ng::from_value(value.clone())
            .map_err(|e| format!("{}: invalid runner 'default': {}", path.display(), e))?;
        let runner = normalize_runner("default", &raw, path)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        default = Some(runner);
    }

    match default {
        Some(runner) => Ok(Some(runner)),
        None => Err(format!(
            "{}: 'runners' section must contain a runner named 'default'",
            path.display()
        )),
    }
}

/// Resolve the layered default runner: project beats user beats machine.
/// Every layer that fails to parse is skipped with a warning.
pub fn layered_default_runner(
    start_dir: &Path,
    env: &HashMap<String, String>,
) -> Option<Runner> {
    let mut layers: Vec<(&str, Option<PathBuf>)> = vec![
        ("project", find_project_config(start_dir)),
        ("user", user_config_path(env)),
        ("machine", machine_config_path(env)),
    ];

    for (level, path) in layers.drain(..) {
        let Some(path) = path else { continue };
        match parse_config_file(&path) {
            Ok(Some(runner)) => {
                debug!(level, path = %path.display(), "using configured default runner");
                return Some(runner);
            }
            Ok(None) => trace!(level, path = %path.display(), "no default runner here"),
            Err(reason) => warn!(level, %reason, "ignoring unparseable config file"),
        }
    }
    None
}
