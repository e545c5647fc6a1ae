//! Container runner: image building and `docker run` execution.
//!
//! Images build lazily, cached per invocation on a key derived from the
//! Dockerfile contents and the build args; `volumes` and `env` are run
//! settings and stay out of the key. The state file is bind-mounted
//! read/write at a reserved path so a nested `tt` inside the container
//! shares it with the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use indexmap::IndexMap;
use tracing::{debug, trace};

use super::process::{ExecOutput, ProcessRunner};
use crate::core::hash;
use crate::error::ExecError;

/// Where the host state file appears inside every container. Part of the
/// contract with nested `tt` invocations.
pub const CONTAINER_STATE_PATH: &str = "/tasktree/.tasktree-state";

/// Where the materialised script is mounted.
pub const CONTAINER_SCRIPT_PATH: &str = "/tasktree/run.sh";

/// Project root mount point when the runner declares no `working_dir`.
pub const DEFAULT_CONTAINER_ROOT: &str = "/workspace";

/// Borrowed view of a `Runner::Container` definition plus its name.
#[derive(Debug, Clone, Copy)]
pub struct ContainerSpec<'a> {
    pub name: &'a str,
    pub dockerfile: &'a str,
    pub context: &'a str,
    pub volumes: &'a [String],
    pub ports: &'a [String],
    pub build_args: &'a IndexMap<String, String>,
    pub working_dir: Option<&'a str>,
    pub run_as_root: bool,
    pub shell: Option<&'a str>,
}

impl ContainerSpec<'_> {
    pub fn container_root(&self) -> &str {
        self.working_dir.unwrap_or(DEFAULT_CONTAINER_ROOT)
    }

    pub fn container_shell(&self) -> &str {
        self.shell.unwrap_or("sh")
    }
}

/// Builds images on demand and runs containers. One per invocation; the
/// build cache lives for its lifetime.
pub struct ContainerManager {
    project_root: PathBuf,
    built: HashMap<String, String>,
}

impl ContainerManager {
    pub fn new(project_root: PathBuf) -> Self {
        Self {
            project_root,
            built: HashMap::new(),
        }
    }

    /// Build the image unless an identical one was already built in this
    /// invocation. Returns the image tag.
    pub fn ensure_image(
        &mut self,
        spec: &ContainerSpec,
        process: &dyn ProcessRunner,
    ) -> Result<String, ExecError> {
        let dockerfile_path = self.project_root.join(spec.dockerfile);
        let contents =
            std::fs::read_to_string(&dockerfile_path).map_err(|e| ExecError::RunnerBuildFailed {
                runner: spec.name.to_string(),
                reason: format!("cannot read {}: {}", dockerfile_path.display(), e),
            })?;

        let key = image_cache_key(&contents, spec.build_args);
        if let Some(tag) = self.built.get(&key) {
            trace!(runner = spec.name, tag, "image already built this invocation");
            return Ok(tag.clone());
        }

        let tag = image_tag(&key);
        let context = self.project_root.join(spec.context);
        let mut args: Vec<String> = vec![
            "build".into(),
            "-f".into(),
            dockerfile_path.display().to_string(),
            "-t".into(),
            tag.clone(),
        ];
        for (k, v) in spec.build_args {
            args.push("--build-arg".into());
            args.push(format!("{}={}", k, v));
        }
        args.push(context.display().to_string());

        debug!(runner = spec.name, tag, "building container image");
        let mut cmd = Command::new("docker");
        cmd.args(&args);
        let out = process.run(&mut cmd).map_err(|e| ExecError::RunnerBuildFailed {
            runner: spec.name.to_string(),
            reason: e.to_string(),
        })?;
        if !out.success() {
            return Err(ExecError::RunnerBuildFailed {
                runner: spec.name.to_string(),
                reason: if out.stderr.trim().is_empty() {
                    format!("docker build exited with code {}", out.exit_code)
                } else {
                    out.stderr.trim().to_string()
                },
            });
        }

        self.built.insert(key, tag.clone());
        Ok(tag)
    }

    /// Run a materialised script inside the container.
    pub fn run_script(
        &mut self,
        spec: &ContainerSpec,
        tag: &str,
        script: &Path,
        state_path: &Path,
        task_working_dir: &str,
        env: &IndexMap<String, String>,
        process: &dyn ProcessRunner,
        task: &str,
    ) -> Result<ExecOutput, ExecError> {
        validate_volumes(spec.name, spec.volumes)?;

        // Docker turns a missing host path into a directory mount; make
        // sure the state file exists as a file first.
        if !state_path.exists() {
            if let Some(parent) = state_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            std::fs::write(state_path, "[]").map_err(|e| ExecError::ProcessSpawnFailed {
                task: task.to_string(),
                source: e,
            })?;
        }

        let user = if spec.run_as_root { None } else { host_uid_gid() };
        let args = docker_run_args(
            spec,
            tag,
            &self.project_root,
            script,
            state_path,
            task_working_dir,
            env,
            user.as_deref(),
        );

        trace!(task, tag, "docker run");
        let mut cmd = Command::new("docker");
        cmd.args(&args);
        process.run(&mut cmd).map_err(|e| ExecError::ProcessSpawnFailed {
            task: task.to_string(),
            source: e,
        })
    }
}

/// Cache key over the image build inputs only.
pub fn image_cache_key(dockerfile_contents: &str, build_args: &IndexMap<String, String>) -> String {
    let mut sorted: Vec<(&String, &String)> = build_args.iter().collect();
    sorted.sort();
    let canonical = serde_json::to_string(&sorted).expect("build args serialise");
    hash::hash_string(&format!("{}\0{}", dockerfile_contents, canonical))
}

/// `tt-<12 hex chars>` derived from the cache key.
pub fn image_tag(cache_key: &str) -> String {
    let hex = cache_key.strip_prefix("blake3:").unwrap_or(cache_key);
    format!("tt-{}", &hex[..12])
}

/// Reject user volumes that would shadow the reserved state mount.
pub fn validate_volumes(runner: &str, volumes: &[String]) -> Result<(), ExecError> {
    for volume in volumes {
        let mut parts = volume.splitn(3, ':');
        let _host = parts.next();
        let Some(target) = parts.next() else { continue };
        let shadows = target == CONTAINER_STATE_PATH
            || CONTAINER_STATE_PATH.starts_with(&format!("{}/", target.trim_end_matches('/')));
        if shadows {
            return Err(ExecError::ReservedVolumePath {
                runner: runner.to_string(),
                target: target.to_string(),
            });
        }
    }
    Ok(())
}

/// Assemble the full `docker run` argument vector. Pure, for tests.
#[allow(clippy::too_many_arguments)]
pub fn docker_run_args(
    spec: &ContainerSpec,
    tag: &str,
    project_root: &Path,
    script: &Path,
    state_path: &Path,
    task_working_dir: &str,
    env: &IndexMap<String, String>,
    user: Option<&str>,
) -> Vec<String> {
    let root = spec.container_root();
    let mut args: Vec<String> = vec!["run".into(), "--rm".into()];

    args.push("-v".into());
    args.push(format!("{}:{}", project_root.display(), root));
    args.push("-v".into());
    args.push(format!("{}:{}:ro", script.display(), CONTAINER_SCRIPT_PATH));
    args.push("-v".into());
    args.push(format!("{}:{}", state_path.display(), CONTAINER_STATE_PATH));
    for volume in spec.volumes {
        args.push("-v".into());
        args.push(volume.clone());
    }
    for port in spec.ports {
        args.push("-p".into());
        args.push(port.clone());
    }
    for (k, v) in env {
        args.push("-e".into());
        args.push(format!("{}={}", k, v));
    }
    if let Some(user) = user {
        args.push("--user".into());
        args.push(user.to_string());
    }

    let workdir = if task_working_dir == "." || task_working_dir.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), task_working_dir)
    };
    args.push("-w".into());
    args.push(workdir);

    args.push(tag.to_string());
    args.push(spec.container_shell().to_string());
    args.push(CONTAINER_SCRIPT_PATH.to_string());
    args
}

/// Host UID:GID for container user mapping, POSIX only.
pub fn host_uid_gid() -> Option<String> {
    if cfg!(windows) {
        return None;
    }
    let read = |flag: &str| -> Option<String> {
        let out = Command::new("id").arg(flag).output().ok()?;
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
    };
    Some(format!("{}:{}", read("-u")?, read("-g")?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(volumes: &'a [String], build_args: &'a IndexMap<String, String>) -> ContainerSpec<'a> {
        ContainerSpec {
            name: "build-env",
            dockerfile: "docker/Dockerfile",
            context: ".",
            volumes,
            ports: &[],
            build_args,
            working_dir: None,
            run_as_root: false,
            shell: None,
        }
    }

    #[test]
    fn cache_key_tracks_dockerfile_and_build_args() {
        let empty = IndexMap::new();
        let mut with_arg = IndexMap::new();
        with_arg.insert("VERSION".to_string(), "1".to_string());

        let k1 = image_cache_key("FROM alpine", &empty);
        let k2 = image_cache_key("FROM debian", &empty);
        let k3 = image_cache_key("FROM alpine", &with_arg);
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1, image_cache_key("FROM alpine", &empty));
    }

    #[test]
    fn image_tag_shape() {
        let key = image_cache_key("FROM alpine", &IndexMap::new());
        let tag = image_tag(&key);
        assert!(tag.starts_with("tt-"));
        assert_eq!(tag.len(), 3 + 12);
    }

    #[test]
    fn reserved_volume_target_rejected() {
        let volumes = vec![format!("./data:{}", CONTAINER_STATE_PATH)];
        assert!(matches!(
            validate_volumes("r", &volumes),
            Err(ExecError::ReservedVolumePath { .. })
        ));

        // A parent directory of the reserved path shadows it too.
        let volumes = vec!["./data:/tasktree".to_string()];
        assert!(matches!(
            validate_volumes("r", &volumes),
            Err(ExecError::ReservedVolumePath { .. })
        ));
    }

    #[test]
    fn ordinary_volumes_accepted() {
        let volumes = vec![
            "./data:/data".to_string(),
            "cache-vol:/var/cache:ro".to_string(),
        ];
        assert!(validate_volumes("r", &volumes).is_ok());
    }

    #[test]
    fn run_args_mount_state_and_script() {
        let empty_args = IndexMap::new();
        let volumes: Vec<String> = vec![];
        let spec = spec(&volumes, &empty_args);
        let mut env = IndexMap::new();
        env.insert("TT_CONTAINERIZED_RUNNER".to_string(), "build-env".to_string());

        let args = docker_run_args(
            &spec,
            "tt-abcdef123456",
            Path::new("/proj"),
            Path::new("/tmp/tt-script-1.sh"),
            Path::new("/proj/.tasktree-state"),
            ".",
            &env,
            Some("1000:1000"),
        );

        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm"));
        assert!(joined.contains(&format!("/proj:{}", DEFAULT_CONTAINER_ROOT)));
        assert!(joined.contains(&format!("/proj/.tasktree-state:{}", CONTAINER_STATE_PATH)));
        assert!(joined.contains(&format!("/tmp/tt-script-1.sh:{}:ro", CONTAINER_SCRIPT_PATH)));
        assert!(joined.contains("-e TT_CONTAINERIZED_RUNNER=build-env"));
        assert!(joined.contains("--user 1000:1000"));
        assert!(joined.ends_with(&format!("tt-abcdef123456 sh {}", CONTAINER_SCRIPT_PATH)));
    }

    #[test]
    fn run_args_respect_task_working_dir() {
        let empty_args = IndexMap::new();
        let volumes: Vec<String> = vec![];
        let spec = spec(&volumes, &empty_args);
        let args = docker_run_args(
            &spec,
            "tt-x",
            Path::new("/proj"),
            Path::new("/tmp/s.sh"),
            Path::new("/proj/.tasktree-state"),
            "services/api",
            &IndexMap::new(),
            None,
        );
        let pos = args.iter().position(|a| a == "-w").unwrap();
        assert_eq!(args[pos + 1], format!("{}/services/api", DEFAULT_CONTAINER_ROOT));
        assert!(!args.contains(&"--user".to_string()));
    }

    #[test]
    fn run_as_root_spec_keeps_no_user_flag() {
        let empty_args = IndexMap::new();
        let volumes: Vec<String> = vec![];
        let mut s = spec(&volumes, &empty_args);
        s.run_as_root = true;
        // ensure_image/run_script decide user mapping; args builder just
        // reflects what it's given.
        let args = docker_run_args(
            &s,
            "tt-x",
            Path::new("/p"),
            Path::new("/s.sh"),
            Path::new("/p/.tasktree-state"),
            ".",
            &IndexMap::new(),
            None,
        );
        assert!(!args.contains(&"--user".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn host_uid_gid_shape() {
        let mapping = host_uid_gid().unwrap();
        let (uid, gid) = mapping.split_once(':').unwrap();
        assert!(uid.chars().all(|c| c.is_ascii_digit()));
        assert!(gid.chars().all(|c| c.is_ascii_digit()));
    }
}
