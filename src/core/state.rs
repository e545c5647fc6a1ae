//! State file management — load, atomic save, pruning.
//!
//! `.tasktree-state` at the project root is a JSON array of entries keyed
//! by `(def_hash, arg_hash)`. It is the only shared mutable resource
//! across `tt` processes (host and containers); correctness relies on
//! sequential execution, not locks. Every write goes to a temp file in
//! the same directory, is parsed back, then renamed over the original.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::StateError;

pub const STATE_FILE_NAME: &str = ".tasktree-state";

/// Environment variable overriding the state file location; set by the
/// driver for processes inside containers.
pub const STATE_PATH_ENV: &str = "TT_STATE_FILE_PATH";

/// Set when the process runs inside a container runner.
pub const CONTAINERIZED_ENV: &str = "TT_CONTAINERIZED_RUNNER";

/// One task execution record.
///
/// Unknown fields written by a later schema ride along in `extra` and are
/// preserved on rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub def_hash: String,
    pub arg_hash: String,
    pub last_run_unix: u64,
    /// Observed input path → mtime in nanoseconds, in glob-expansion order.
    pub inputs: IndexMap<String, u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// In-memory view of the state file.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    entries: Vec<StateEntry>,
}

impl StateFile {
    /// Resolve the state file location for this process.
    ///
    /// `TT_STATE_FILE_PATH` (valid only together with
    /// `TT_CONTAINERIZED_RUNNER`) wins over the project-root default.
    pub fn resolve_path(
        project_root: &Path,
        env: &std::collections::HashMap<String, String>,
    ) -> Result<PathBuf, StateError> {
        match (env.get(STATE_PATH_ENV), env.get(CONTAINERIZED_ENV)) {
            (Some(path), Some(_)) => Ok(PathBuf::from(path)),
            (Some(_), None) => Err(StateError::OrphanStatePathOverride),
            (None, _) => Ok(project_root.join(STATE_FILE_NAME)),
        }
    }

    /// Load the state file. Missing file yields an empty state; a file
    /// that exists but does not parse fails loudly rather than silently
    /// discarding history.
    pub fn load(path: PathBuf) -> Result<Self, StateError> {
        if !path.exists() {
            trace!(path = %path.display(), "no state file, starting empty");
            return Ok(Self {
                path,
                entries: Vec::new(),
            });
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StateError::StateFileCorrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let entries: Vec<StateEntry> =
            serde_json::from_str(&content).map_err(|e| StateError::StateFileCorrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        trace!(path = %path.display(), entries = entries.len(), "loaded state");
        Ok(Self { path, entries })
    }

    /// Re-read from disk, discarding the in-memory view. A nested `tt`
    /// invocation may have rewritten the file while a task ran.
    pub fn reload(&mut self) -> Result<(), StateError> {
        *self = Self::load(self.path.clone())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[StateEntry] {
        &self.entries
    }

    pub fn get(&self, def_hash: &str, arg_hash: &str) -> Option<&StateEntry> {
        self.entries
            .iter()
            .find(|e| e.def_hash == def_hash && e.arg_hash == arg_hash)
    }

    /// Insert or replace the entry for `(def_hash, arg_hash)`.
    pub fn upsert(&mut self, entry: StateEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.def_hash == entry.def_hash && e.arg_hash == entry.arg_hash)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Drop entries whose definition hash no longer appears in the
    /// recipe. Returns how many were removed.
    pub fn prune(&mut self, valid_def_hashes: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| valid_def_hashes.contains(&e.def_hash));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "pruned state entries for departed definitions");
        }
        removed
    }

    /// Atomic write: temp file in the same directory, parse-back check,
    /// then rename. Partial files never become canonical state.
    pub fn save(&self) -> Result<(), StateError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let json = serde_json::to_string_pretty(&self.entries).map_err(|e| {
            StateError::StateFileWriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            StateError::StateFileWriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.flush())
            .map_err(|e| StateError::StateFileWriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        // Verify the temp file parses before it can replace the original.
        let written = std::fs::read_to_string(tmp.path()).map_err(|e| {
            StateError::StateFileWriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;
        serde_json::from_str::<Vec<StateEntry>>(&written).map_err(|e| {
            StateError::StateFileWriteFailed {
                path: self.path.clone(),
                reason: format!("temp file verification failed: {}", e),
            }
        })?;

        tmp.persist(&self.path)
            .map_err(|e| StateError::StateFileWriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        trace!(path = %self.path.display(), entries = self.entries.len(), "saved state");
        Ok(())
    }

    /// Delete the state file (`tt --clean`).
    pub fn clear(path: &Path) -> Result<bool, StateError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::StateFileWriteFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(def: &str, arg: &str, run: u64) -> StateEntry {
        StateEntry {
            def_hash: def.to_string(),
            arg_hash: arg.to_string(),
            last_run_unix: run,
            inputs: IndexMap::from([("src/main.rs".to_string(), 12345_u64)]),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::load(dir.path().join(STATE_FILE_NAME)).unwrap();
        assert!(state.entries().is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let mut state = StateFile::load(path.clone()).unwrap();
        state.upsert(entry("blake3:aaa", "blake3:bbb", 100));
        state.save().unwrap();

        let loaded = StateFile::load(path).unwrap();
        assert_eq!(loaded.entries(), state.entries());
        assert_eq!(
            loaded.get("blake3:aaa", "blake3:bbb").unwrap().last_run_unix,
            100
        );
    }

    #[test]
    fn upsert_replaces_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateFile::load(dir.path().join(STATE_FILE_NAME)).unwrap();
        state.upsert(entry("d", "a", 1));
        state.upsert(entry("d", "a", 2));
        assert_eq!(state.entries().len(), 1);
        assert_eq!(state.get("d", "a").unwrap().last_run_unix, 2);
    }

    #[test]
    fn distinct_arg_hashes_are_distinct_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateFile::load(dir.path().join(STATE_FILE_NAME)).unwrap();
        state.upsert(entry("d", "a1", 1));
        state.upsert(entry("d", "a2", 2));
        assert_eq!(state.entries().len(), 2);
    }

    #[test]
    fn prune_drops_departed_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateFile::load(dir.path().join(STATE_FILE_NAME)).unwrap();
        state.upsert(entry("keep", "a", 1));
        state.upsert(entry("drop", "a", 1));
        let valid: HashSet<String> = ["keep".to_string()].into();
        state.prune(&valid);
        assert_eq!(state.entries().len(), 1);
        assert!(state.get("keep", "a").is_some());
    }

    #[test]
    fn corrupt_file_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        std::fs::write(&path, "{ not json ]").unwrap();
        assert!(matches!(
            StateFile::load(path),
            Err(StateError::StateFileCorrupt { .. })
        ));
    }

    #[test]
    fn unknown_fields_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        std::fs::write(
            &path,
            r#"[{"def_hash":"d","arg_hash":"a","last_run_unix":5,"inputs":{},"future_field":"kept"}]"#,
        )
        .unwrap();
        let state = StateFile::load(path.clone()).unwrap();
        state.save().unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("future_field"));
        assert!(raw.contains("kept"));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let mut state = StateFile::load(path.clone()).unwrap();
        state.upsert(entry("d", "a", 1));
        state.save().unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![STATE_FILE_NAME.to_string()]);
    }

    #[test]
    fn resolve_path_default() {
        let env = HashMap::new();
        let path = StateFile::resolve_path(Path::new("/proj"), &env).unwrap();
        assert_eq!(path, PathBuf::from("/proj/.tasktree-state"));
    }

    #[test]
    fn resolve_path_container_override() {
        let env: HashMap<String, String> = [
            (STATE_PATH_ENV.to_string(), "/tasktree/.tasktree-state".to_string()),
            (CONTAINERIZED_ENV.to_string(), "build-env".to_string()),
        ]
        .into();
        let path = StateFile::resolve_path(Path::new("/proj"), &env).unwrap();
        assert_eq!(path, PathBuf::from("/tasktree/.tasktree-state"));
    }

    #[test]
    fn resolve_path_orphan_override_rejected() {
        let env: HashMap<String, String> =
            [(STATE_PATH_ENV.to_string(), "/x".to_string())].into();
        assert!(matches!(
            StateFile::resolve_path(Path::new("/proj"), &env),
            Err(StateError::OrphanStatePathOverride)
        ));
    }

    #[test]
    fn clear_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        assert!(!StateFile::clear(&path).unwrap());
        std::fs::write(&path, "[]").unwrap();
        assert!(StateFile::clear(&path).unwrap());
        assert!(!path.exists());
    }
}
