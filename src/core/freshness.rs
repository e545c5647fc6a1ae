//! Freshness classification: decide whether a node needs to run.
//!
//! Pure classification against the persisted state and the file system;
//! the execution driver is the sole mutator of state. Checks, in order:
//! force flag, the no-inputs-no-outputs trivial case, a missing state
//! entry, the dependency cascade, input timestamp/set changes, and
//! missing declared outputs.

use std::fmt;
use std::path::Path;
use std::time::UNIX_EPOCH;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::core::state::StateFile;
use crate::core::types::IoEntry;

/// Why a node will (or will not) run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Fresh,
    Forced,
    /// Neither inputs nor outputs: nothing to compare, always stale.
    NoInputsOutputs,
    NeverRun,
    /// A direct dependency executed earlier in this invocation.
    DependencyRan,
    InputsChanged(Vec<String>),
    OutputsMissing(Vec<String>),
}

impl Reason {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Forced => write!(f, "forced"),
            Self::NoInputsOutputs => write!(f, "no inputs or outputs"),
            Self::NeverRun => write!(f, "never run"),
            Self::DependencyRan => write!(f, "dependency ran"),
            Self::InputsChanged(files) => write!(f, "inputs changed: {}", files.join(", ")),
            Self::OutputsMissing(globs) => write!(f, "outputs missing: {}", globs.join(", ")),
        }
    }
}

/// Classify one node. `inputs` are its effective inputs, `outputs` its
/// declared outputs, both fully template-expanded.
#[allow(clippy::too_many_arguments)]
pub fn classify(
    task: &str,
    def_hash: &str,
    arg_hash: &str,
    state: &StateFile,
    project_root: &Path,
    working_dir: &str,
    inputs: &[IoEntry],
    outputs: &[IoEntry],
    force: bool,
    dependency_ran: bool,
) -> Reason {
    if force {
        return Reason::Forced;
    }
    if inputs.is_empty() && outputs.is_empty() {
        return Reason::NoInputsOutputs;
    }

    let Some(entry) = state.get(def_hash, arg_hash) else {
        return Reason::NeverRun;
    };

    if dependency_ran {
        return Reason::DependencyRan;
    }

    let current = expand_input_globs(project_root, working_dir, inputs);
    let mut changed: Vec<String> = Vec::new();
    for (path, mtime) in &current {
        match entry.inputs.get(path) {
            Some(stored) if mtime <= stored => {}
            Some(_) => changed.push(path.clone()),
            None => changed.push(format!("{} (new)", path)),
        }
    }
    for path in entry.inputs.keys() {
        if !current.contains_key(path) {
            changed.push(format!("{} (removed)", path));
        }
    }
    if !changed.is_empty() {
        debug!(task, files = ?changed, "inputs changed");
        return Reason::InputsChanged(changed);
    }

    let missing = missing_output_globs(project_root, working_dir, outputs);
    if !missing.is_empty() {
        warn!(
            task,
            globs = ?missing,
            "re-running because declared outputs are missing"
        );
        return Reason::OutputsMissing(missing);
    }

    Reason::Fresh
}

/// Expand input globs relative to `working_dir` under the project root,
/// returning `relative path -> mtime_ns` in glob-expansion order. Missing
/// globs are permitted but logged.
pub fn expand_input_globs(
    project_root: &Path,
    working_dir: &str,
    entries: &[IoEntry],
) -> IndexMap<String, u64> {
    let base = project_root.join(working_dir);
    let mut files = IndexMap::new();

    for entry in entries {
        let pattern = base.join(&entry.glob);
        let pattern_str = pattern.to_string_lossy();
        let walker = match glob::glob(&pattern_str) {
            Ok(walker) => walker,
            Err(e) => {
                warn!(glob = %entry.glob, error = %e, "invalid input glob, skipping");
                continue;
            }
        };

        let mut matched = false;
        for path in walker.flatten() {
            if !path.is_file() {
                continue;
            }
            matched = true;
            let rel = path
                .strip_prefix(&base)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            if let Some(mtime) = mtime_ns(&path) {
                files.insert(rel, mtime);
            }
        }
        if !matched {
            debug!(glob = %entry.glob, "input glob matched no files");
        }
    }
    files
}

/// Declared output globs with zero matches.
pub fn missing_output_globs(
    project_root: &Path,
    working_dir: &str,
    outputs: &[IoEntry],
) -> Vec<String> {
    let base = project_root.join(working_dir);
    outputs
        .iter()
        .filter(|entry| {
            let pattern = base.join(&entry.glob);
            match glob::glob(&pattern.to_string_lossy()) {
                Ok(mut walker) => walker.next().is_none(),
                Err(_) => false,
            }
        })
        .map(|entry| entry.glob.clone())
        .collect()
}

/// Modification time in nanoseconds since the epoch.
pub fn mtime_ns(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{StateEntry, StateFile};

    fn state_with(
        dir: &Path,
        def: &str,
        arg: &str,
        inputs: IndexMap<String, u64>,
    ) -> StateFile {
        let mut state = StateFile::load(dir.join(".tasktree-state")).unwrap();
        state.upsert(StateEntry {
            def_hash: def.to_string(),
            arg_hash: arg.to_string(),
            last_run_unix: 100,
            inputs,
            extra: serde_json::Map::new(),
        });
        state
    }

    fn empty_state(dir: &Path) -> StateFile {
        StateFile::load(dir.join(".tasktree-state")).unwrap()
    }

    #[test]
    fn no_inputs_no_outputs_always_stale() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), "d", "a", IndexMap::new());
        let reason = classify(
            "t", "d", "a", &state, dir.path(), ".", &[], &[], false, false,
        );
        assert_eq!(reason, Reason::NoInputsOutputs);
        assert!(reason.is_stale());
    }

    #[test]
    fn missing_state_entry_is_never_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        let state = empty_state(dir.path());
        let inputs = [IoEntry::anonymous("in.txt")];
        let reason = classify(
            "t", "d", "a", &state, dir.path(), ".", &inputs, &[], false, false,
        );
        assert_eq!(reason, Reason::NeverRun);
    }

    #[test]
    fn unchanged_inputs_are_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("in.txt");
        std::fs::write(&file, "x").unwrap();
        let mtime = mtime_ns(&file).unwrap();

        let state = state_with(
            dir.path(),
            "d",
            "a",
            IndexMap::from([("in.txt".to_string(), mtime)]),
        );
        let inputs = [IoEntry::anonymous("in.txt")];
        let reason = classify(
            "t", "d", "a", &state, dir.path(), ".", &inputs, &[], false, false,
        );
        assert_eq!(reason, Reason::Fresh);
        assert!(!reason.is_stale());
    }

    #[test]
    fn newer_mtime_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("in.txt");
        std::fs::write(&file, "x").unwrap();
        let mtime = mtime_ns(&file).unwrap();

        let state = state_with(
            dir.path(),
            "d",
            "a",
            IndexMap::from([("in.txt".to_string(), mtime - 1)]),
        );
        let inputs = [IoEntry::anonymous("in.txt")];
        match classify(
            "t", "d", "a", &state, dir.path(), ".", &inputs, &[], false, false,
        ) {
            Reason::InputsChanged(files) => assert_eq!(files, vec!["in.txt"]),
            other => panic!("expected InputsChanged, got {:?}", other),
        }
    }

    #[test]
    fn changed_path_set_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("new.txt");
        std::fs::write(&file, "x").unwrap();
        let mtime = mtime_ns(&file).unwrap();

        // State remembers a file that no longer matches, and the new file
        // is unknown.
        let state = state_with(
            dir.path(),
            "d",
            "a",
            IndexMap::from([("old.txt".to_string(), mtime)]),
        );
        let inputs = [IoEntry::anonymous("*.txt")];
        match classify(
            "t", "d", "a", &state, dir.path(), ".", &inputs, &[], false, false,
        ) {
            Reason::InputsChanged(files) => {
                assert!(files.iter().any(|f| f.contains("new.txt")));
                assert!(files.iter().any(|f| f.contains("old.txt")));
            }
            other => panic!("expected InputsChanged, got {:?}", other),
        }
    }

    #[test]
    fn dependency_cascade_marks_stale() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("in.txt");
        std::fs::write(&file, "x").unwrap();
        let mtime = mtime_ns(&file).unwrap();

        let state = state_with(
            dir.path(),
            "d",
            "a",
            IndexMap::from([("in.txt".to_string(), mtime)]),
        );
        let inputs = [IoEntry::anonymous("in.txt")];
        let reason = classify(
            "t", "d", "a", &state, dir.path(), ".", &inputs, &[], false, true,
        );
        assert_eq!(reason, Reason::DependencyRan);
    }

    #[test]
    fn force_wins_over_everything() {
        let dir = tempfile::tempdir().unwrap();
        let state = empty_state(dir.path());
        let reason = classify(
            "t", "d", "a", &state, dir.path(), ".", &[], &[], true, false,
        );
        assert_eq!(reason, Reason::Forced);
    }

    #[test]
    fn missing_outputs_trigger_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("in.txt");
        std::fs::write(&file, "x").unwrap();
        let mtime = mtime_ns(&file).unwrap();

        let state = state_with(
            dir.path(),
            "d",
            "a",
            IndexMap::from([("in.txt".to_string(), mtime)]),
        );
        let inputs = [IoEntry::anonymous("in.txt")];
        let outputs = [IoEntry::anonymous("out.bin")];
        match classify(
            "t", "d", "a", &state, dir.path(), ".", &inputs, &outputs, false, false,
        ) {
            Reason::OutputsMissing(globs) => assert_eq!(globs, vec!["out.bin"]),
            other => panic!("expected OutputsMissing, got {:?}", other),
        }
    }

    #[test]
    fn present_outputs_stay_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("in.txt");
        std::fs::write(&file, "x").unwrap();
        std::fs::write(dir.path().join("out.bin"), "o").unwrap();
        let mtime = mtime_ns(&file).unwrap();

        let state = state_with(
            dir.path(),
            "d",
            "a",
            IndexMap::from([("in.txt".to_string(), mtime)]),
        );
        let inputs = [IoEntry::anonymous("in.txt")];
        let outputs = [IoEntry::anonymous("out.bin")];
        let reason = classify(
            "t", "d", "a", &state, dir.path(), ".", &inputs, &outputs, false, false,
        );
        assert_eq!(reason, Reason::Fresh);
    }

    #[test]
    fn glob_expansion_is_relative_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("srv");
        std::fs::create_dir_all(sub.join("src")).unwrap();
        std::fs::write(sub.join("src/a.rs"), "x").unwrap();
        std::fs::write(sub.join("src/b.rs"), "y").unwrap();

        let entries = [IoEntry::anonymous("src/*.rs")];
        let files = expand_input_globs(dir.path(), "srv", &entries);
        let mut names: Vec<_> = files.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn missing_glob_yields_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let entries = [IoEntry::anonymous("nothing/*.c")];
        let files = expand_input_globs(dir.path(), ".", &entries);
        assert!(files.is_empty());
    }

    #[test]
    fn directories_are_not_inputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        let entries = [IoEntry::anonymous("*")];
        let files = expand_input_globs(dir.path(), ".", &entries);
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["file.txt"]);
    }
}
