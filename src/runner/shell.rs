//! Local shell execution of a materialised script.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use tracing::trace;

use super::process::{ExecOutput, ProcessRunner};
use crate::error::ExecError;

/// Run a script in `working_dir` with exactly the given environment.
pub fn exec_script(
    script: &Path,
    working_dir: &Path,
    env: &HashMap<String, String>,
    process: &dyn ProcessRunner,
    task: &str,
) -> Result<ExecOutput, ExecError> {
    trace!(task, script = %script.display(), cwd = %working_dir.display(), "spawning");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(script);
        c
    } else {
        Command::new(script)
    };
    cmd.current_dir(working_dir).env_clear().envs(env);

    process.run(&mut cmd).map_err(|e| ExecError::ProcessSpawnFailed {
        task: task.to_string(),
        source: e,
    })
}
