//! Temporary script materialisation.
//!
//! Commands run through a script file: shebang (POSIX), the runner's
//! preamble, then the command body. The file lives for the node's
//! lifetime and is removed on every exit path, including panics, via
//! `Drop`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A materialised script, deleted when dropped.
#[derive(Debug)]
pub struct TempScript {
    path: PathBuf,
}

impl TempScript {
    /// Write shebang + preamble + cmd to a fresh temp file and make it
    /// executable. The file handle is closed before execution so the
    /// kernel never sees a write-open executable.
    pub fn materialize(cmd: &str, preamble: &str, shell: &str) -> io::Result<Self> {
        let suffix = if cfg!(windows) { ".bat" } else { ".sh" };
        let mut file = tempfile::Builder::new()
            .prefix("tt-script-")
            .suffix(suffix)
            .tempfile()?;

        if !cfg!(windows) && !cmd.starts_with("#!") {
            writeln!(file, "#!/usr/bin/env {}", shell)?;
        }
        if !preamble.is_empty() {
            file.write_all(preamble.as_bytes())?;
            if !preamble.ends_with('\n') {
                file.write_all(b"\n")?;
            }
        }
        file.write_all(cmd.as_bytes())?;
        file.flush()?;

        let temp_path = file.into_temp_path();
        let path = temp_path.keep()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempScript {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_shebang_preamble_and_cmd() {
        let script = TempScript::materialize("echo hi", "set -euo pipefail", "bash").unwrap();
        let content = std::fs::read_to_string(script.path()).unwrap();
        if cfg!(unix) {
            assert!(content.starts_with("#!/usr/bin/env bash\n"));
        }
        assert!(content.contains("set -euo pipefail\n"));
        assert!(content.ends_with("echo hi"));
    }

    #[test]
    fn existing_shebang_is_kept() {
        let script = TempScript::materialize("#!/bin/sh\necho hi", "", "bash").unwrap();
        let content = std::fs::read_to_string(script.path()).unwrap();
        assert!(content.starts_with("#!/bin/sh\n"));
        assert_eq!(content.matches("#!").count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn script_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let script = TempScript::materialize("true", "", "bash").unwrap();
        let mode = std::fs::metadata(script.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn removed_on_drop() {
        let path = {
            let script = TempScript::materialize("true", "", "bash").unwrap();
            script.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn script_executes() {
        let script = TempScript::materialize("exit 7", "", "sh").unwrap();
        let status = std::process::Command::new(script.path())
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(7));
    }
}
