//! Recipe loading: discovery, YAML parsing, imports, variable evaluation
//! and normalisation into an immutable `Recipe`.
//!
//! Parsing and validation are split: serde gets the document into raw
//! shapes, then `normalize_*` functions enforce the structural rules and
//! produce the resolved model with full error context.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::core::template::{self, Scope};
use crate::core::types::{
    ArgSpec, ArgType, DepBinding, DepInvocation, IoEntry, RawArgBody, RawArgSpec,
    RawDep, RawDepBinding, RawIoEntry, RawRunner, RawVariable, Recipe, RecipeDoc, Runner,
    Task, TOP_LEVEL_KEYS,
};
use crate::error::LoadError;

/// Recipe file names, highest priority first. `*.tasks` is the fallback.
const RECIPE_NAMES: &[&str] = &["tasktree.yaml", "tasktree.yml", "tt.yaml"];

/// Loader knobs.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// When false (read-only introspection such as `--list`), `{eval:}`
    /// variables are not executed; they resolve to a placeholder.
    pub eval_enabled: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { eval_enabled: true }
    }
}

/// Search the working directory and each ancestor for a recipe file.
pub fn find_recipe_file(start_dir: &Path) -> Result<PathBuf, LoadError> {
    let mut current = start_dir.to_path_buf();
    loop {
        for name in RECIPE_NAMES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        let mut tasks_matches: Vec<PathBuf> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&current) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some("tasks")
                {
                    tasks_matches.push(path);
                }
            }
        }
        match tasks_matches.len() {
            0 => {}
            1 => return Ok(tasks_matches.remove(0)),
            _ => {
                tasks_matches.sort();
                return Err(LoadError::AmbiguousRecipe {
                    dir: current,
                    candidates: tasks_matches
                        .iter()
                        .filter_map(|p| p.file_name())
                        .map(|n| n.to_string_lossy().to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }

        if !current.pop() {
            return Err(LoadError::RecipeNotFound);
        }
    }
}

/// Load and resolve a recipe, following imports.
pub fn load_recipe(
    recipe_path: &Path,
    env: &HashMap<String, String>,
    opts: &LoadOptions,
) -> Result<Recipe, LoadError> {
    let recipe_path = recipe_path
        .canonicalize()
        .map_err(|e| LoadError::Io {
            path: recipe_path.to_path_buf(),
            source: e,
        })?;
    let project_root = recipe_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut loader = Loader {
        project_root: project_root.clone(),
        env,
        opts,
        visiting: Vec::new(),
        tasks: IndexMap::new(),
        runners: IndexMap::new(),
        variables: IndexMap::new(),
        default_runner: None,
    };
    loader.load_file(&recipe_path, None, None)?;

    debug!(
        tasks = loader.tasks.len(),
        runners = loader.runners.len(),
        variables = loader.variables.len(),
        root = %project_root.display(),
        "recipe loaded"
    );

    Ok(Recipe {
        tasks: loader.tasks,
        runners: loader.runners,
        variables: loader.variables,
        recipe_dir: project_root.clone(),
        project_root,
        default_runner: loader.default_runner,
    })
}

struct Loader<'a> {
    project_root: PathBuf,
    env: &'a HashMap<String, String>,
    opts: &'a LoadOptions,
    /// Canonical paths currently being loaded, for cycle detection.
    visiting: Vec<PathBuf>,
    tasks: IndexMap<String, Task>,
    runners: IndexMap<String, Runner>,
    variables: IndexMap<String, String>,
    default_runner: Option<String>,
}

impl Loader<'_> {
    fn load_file(
        &mut self,
        path: &Path,
        namespace: Option<&str>,
        run_in: Option<&str>,
    ) -> Result<(), LoadError> {
        let canonical = path.canonicalize().map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if self.visiting.contains(&canonical) {
            let mut trace: Vec<String> = self
                .visiting
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            trace.push(canonical.display().to_string());
            return Err(LoadError::ImportCycle {
                trace: trace.join(" -> "),
            });
        }
        self.visiting.push(canonical.clone());

        let content = std::fs::read_to_string(&canonical).map_err(|e| LoadError::Io {
            path: canonical.clone(),
            source: e,
        })?;
        let doc = parse_document(&content, &canonical)?;
        let file_dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        // Imports first, so the importing file's definitions win on clash.
        for import in &doc.imports {
            let child_ns = match namespace {
                Some(ns) => format!("{}.{}", ns, import.namespace),
                None => import.namespace.clone(),
            };
            let child_run_in = import.run_in.as_deref().or(run_in);
            let import_path = file_dir.join(&import.file);
            if !import_path.exists() {
                return Err(LoadError::ImportNotFound {
                    file: import.file.clone(),
                    from: canonical.clone(),
                });
            }
            trace!(file = %import_path.display(), namespace = %child_ns, "loading import");
            self.load_file(&import_path, Some(&child_ns), child_run_in)?;
        }

        self.load_runners(&doc, namespace, &canonical)?;
        self.load_variables(&doc, namespace, &file_dir, &canonical)?;
        self.load_tasks(&doc, namespace, run_in, &file_dir, &canonical)?;

        self.visiting.pop();
        Ok(())
    }

    fn load_runners(
        &mut self,
        doc: &RecipeDoc,
        namespace: Option<&str>,
        path: &Path,
    ) -> Result<(), LoadError> {
        for (name, raw) in &doc.runners {
            let runner = normalize_runner(name, raw, path)?;
            let full_name = qualify(namespace, name);
            if namespace.is_none() && name == "default" {
                self.default_runner = Some(full_name.clone());
            }
            self.runners.insert(full_name, runner);
        }
        Ok(())
    }

    fn load_variables(
        &mut self,
        doc: &RecipeDoc,
        namespace: Option<&str>,
        file_dir: &Path,
        path: &Path,
    ) -> Result<(), LoadError> {
        // The eval shell is this file's own default shell runner when it
        // has one; containers never run evals, the host does.
        let eval_shell = doc
            .runners
            .get("default")
            .and_then(|r| r.shell.clone())
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    "cmd".to_string()
                } else {
                    "bash".to_string()
                }
            });

        let builtins = load_time_builtins(&self.project_root, file_dir, self.env);

        for (name, decl) in &doc.variables {
            let context = format!("variable '{}'", name);
            let value = match decl {
                RawVariable::FromEnv { env, default } => match self.env.get(env) {
                    Some(v) => v.clone(),
                    None => default.clone().ok_or_else(|| LoadError::VariableNotSet {
                        name: name.clone(),
                        env: env.clone(),
                    })?,
                },
                RawVariable::FromFile { read } => {
                    let target = expand_tilde(read, self.env);
                    let file_path = if Path::new(&target).is_absolute() {
                        PathBuf::from(&target)
                    } else {
                        file_dir.join(&target)
                    };
                    let bytes =
                        std::fs::read(&file_path).map_err(|e| LoadError::VariableReadFailed {
                            name: name.clone(),
                            path: file_path.clone(),
                            reason: e.to_string(),
                        })?;
                    let text =
                        String::from_utf8(bytes).map_err(|e| LoadError::VariableReadFailed {
                            name: name.clone(),
                            path: file_path.clone(),
                            reason: format!("not valid UTF-8: {}", e),
                        })?;
                    strip_one_trailing_newline(text)
                }
                RawVariable::FromEval { eval } => {
                    if self.opts.eval_enabled {
                        self.eval_variable(name, eval, &eval_shell, file_dir)?
                    } else {
                        format!("<eval: {}>", eval)
                    }
                }
                RawVariable::Scalar(value) => match value.as_str() {
                    Some(template_text) => {
                        // Template string: substitute against variables
                        // defined so far, env, and load-time built-ins.
                        let scope = Scope {
                            context: &context,
                            namespace,
                            vars: Some(&self.variables),
                            env: Some(self.env),
                            builtins: Some(&builtins),
                            ..Default::default()
                        };
                        template::substitute(template_text, &scope).map_err(|e| {
                            LoadError::SchemaViolation {
                                path: path.to_path_buf(),
                                reason: e.to_string(),
                            }
                        })?
                    }
                    None => yaml_scalar_to_string(value).ok_or_else(|| {
                        LoadError::SchemaViolation {
                            path: path.to_path_buf(),
                            reason: format!(
                                "variable '{}' must be a scalar or an env/read/eval mapping",
                                name
                            ),
                        }
                    })?,
                },
            };
            self.variables.insert(qualify(namespace, name), value);
        }
        Ok(())
    }

    fn eval_variable(
        &self,
        name: &str,
        cmd: &str,
        shell: &str,
        file_dir: &Path,
    ) -> Result<String, LoadError> {
        let output = Command::new(shell)
            .arg(if cfg!(windows) { "/C" } else { "-c" })
            .arg(cmd)
            .current_dir(file_dir)
            .output()
            .map_err(|e| LoadError::VariableEvalFailed {
                name: name.to_string(),
                code: -1,
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(LoadError::VariableEvalFailed {
                name: name.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(strip_one_trailing_newline(
            String::from_utf8_lossy(&output.stdout).to_string(),
        ))
    }

    fn load_tasks(
        &mut self,
        doc: &RecipeDoc,
        namespace: Option<&str>,
        run_in: Option<&str>,
        file_dir: &Path,
        path: &Path,
    ) -> Result<(), LoadError> {
        let default_working_dir = file_dir
            .strip_prefix(&self.project_root)
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        for (name, raw) in &doc.tasks {
            if name.contains('.') {
                return Err(LoadError::InvalidTaskName {
                    name: name.clone(),
                    path: path.to_path_buf(),
                });
            }
            let full_name = qualify(namespace, name);

            let deps = raw
                .deps
                .iter()
                .map(|d| normalize_dep(d, namespace, &full_name, path))
                .collect::<Result<Vec<_>, _>>()?;

            let inputs = normalize_io_entries(&raw.inputs, &full_name, path)?;
            let outputs = normalize_io_entries(&raw.outputs, &full_name, path)?;
            let args = raw
                .args
                .iter()
                .map(|a| normalize_arg_spec(a, &full_name))
                .collect::<Result<Vec<_>, _>>()?;

            let working_dir = raw
                .working_dir
                .clone()
                .unwrap_or_else(|| default_working_dir.clone());

            let runner = raw
                .runner
                .as_ref()
                .map(|r| qualify_reference(namespace, r));

            self.tasks.insert(
                full_name.clone(),
                Task {
                    name: full_name,
                    description: raw.description.clone(),
                    deps,
                    inputs,
                    outputs,
                    working_dir,
                    runner,
                    pin_runner: raw.pin_runner,
                    import_run_in: run_in.map(str::to_string),
                    args,
                    cmd: raw.cmd.clone(),
                    private: raw.private,
                    task_output: raw.task_output,
                    namespace: namespace.map(str::to_string),
                    source_file: path.to_path_buf(),
                },
            );
        }
        Ok(())
    }
}

/// Parse a document, rejecting unknown top-level keys before serde maps
/// the recognised sections.
fn parse_document(content: &str, path: &Path) -> Result<RecipeDoc, LoadError> {
    if content.trim().is_empty() {
        return Ok(RecipeDoc::default());
    }
    let value: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(content).map_err(|e| LoadError::Yaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    if value.is_null() {
        return Ok(RecipeDoc::default());
    }

    if let Some(mapping) = value.as_mapping() {
        for key in mapping.keys() {
            let key_str = key.as_str().unwrap_or_default();
            if !TOP_LEVEL_KEYS.contains(&key_str) {
                return Err(LoadError::UnknownTopLevelKey {
                    key: key_str.to_string(),
                    path: path.to_path_buf(),
                });
            }
        }
    }

    serde_yaml_ng::from_value(value).map_err(|e| LoadError::Yaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Validate and convert a raw runner. Exactly one of `shell` /
/// `dockerfile` must discriminate the kind.
pub fn normalize_runner(name: &str, raw: &RawRunner, path: &Path) -> Result<Runner, LoadError> {
    match (&raw.shell, &raw.dockerfile) {
        (Some(shell), None) => {
            if !raw.volumes.is_empty()
                || !raw.ports.is_empty()
                || !raw.build_args.is_empty()
                || raw.run_as_root
            {
                return Err(LoadError::RunnerDefinitionInvalid {
                    runner: name.to_string(),
                    path: path.to_path_buf(),
                    reason: "container fields (volumes, ports, build_args, run_as_root) require a dockerfile".to_string(),
                });
            }
            Ok(Runner::Shell {
                shell: shell.clone(),
                preamble: raw.preamble.clone().unwrap_or_default(),
            })
        }
        (shell, Some(dockerfile)) => Ok(Runner::Container {
            dockerfile: dockerfile.clone(),
            context: raw.context.clone().unwrap_or_else(|| ".".to_string()),
            volumes: raw.volumes.clone(),
            ports: raw.ports.clone(),
            build_args: raw.build_args.clone(),
            env: raw.env.clone(),
            working_dir: raw.working_dir.clone(),
            run_as_root: raw.run_as_root,
            shell: shell.clone(),
            preamble: raw.preamble.clone().unwrap_or_default(),
        }),
        (None, None) => Err(LoadError::RunnerDefinitionInvalid {
            runner: name.to_string(),
            path: path.to_path_buf(),
            reason: "must specify either 'shell' or 'dockerfile'".to_string(),
        }),
    }
}

fn normalize_dep(
    raw: &RawDep,
    namespace: Option<&str>,
    task: &str,
    path: &Path,
) -> Result<DepInvocation, LoadError> {
    match raw {
        RawDep::Name(name) => Ok(DepInvocation {
            task: qualify_reference(namespace, name),
            binding: DepBinding::Defaults,
        }),
        RawDep::Bound(map) => {
            if map.len() != 1 {
                return Err(LoadError::SchemaViolation {
                    path: path.to_path_buf(),
                    reason: format!(
                        "task '{}': a bound dependency entry must name exactly one task",
                        task
                    ),
                });
            }
            let (name, binding) = map.iter().next().expect("len checked");
            let binding = match binding {
                RawDepBinding::Positional(values) => {
                    if values.is_empty() {
                        return Err(LoadError::SchemaViolation {
                            path: path.to_path_buf(),
                            reason: format!(
                                "task '{}': dependency '{}' binds an empty argument list; omit the list to use defaults",
                                task, name
                            ),
                        });
                    }
                    let values = values
                        .iter()
                        .map(|v| {
                            yaml_scalar_to_string(v).ok_or_else(|| LoadError::SchemaViolation {
                                path: path.to_path_buf(),
                                reason: format!(
                                    "task '{}': dependency '{}' argument values must be scalars",
                                    task, name
                                ),
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    DepBinding::Positional(values)
                }
                RawDepBinding::Named(entries) => {
                    let mut named = IndexMap::new();
                    for (arg, value) in entries {
                        let value = yaml_scalar_to_string(value).ok_or_else(|| {
                            LoadError::SchemaViolation {
                                path: path.to_path_buf(),
                                reason: format!(
                                    "task '{}': dependency '{}' argument '{}' must be a scalar",
                                    task, name, arg
                                ),
                            }
                        })?;
                        named.insert(arg.clone(), value);
                    }
                    DepBinding::Named(named)
                }
            };
            Ok(DepInvocation {
                task: qualify_reference(namespace, name),
                binding,
            })
        }
    }
}

fn normalize_io_entries(
    raw: &[RawIoEntry],
    task: &str,
    path: &Path,
) -> Result<Vec<IoEntry>, LoadError> {
    raw.iter()
        .map(|entry| match entry {
            RawIoEntry::Anonymous(glob) => Ok(IoEntry::anonymous(glob.clone())),
            RawIoEntry::Named(map) => {
                if map.len() != 1 {
                    return Err(LoadError::SchemaViolation {
                        path: path.to_path_buf(),
                        reason: format!(
                            "task '{}': a named input/output entry must have exactly one key",
                            task
                        ),
                    });
                }
                let (name, glob) = map.iter().next().expect("len checked");
                Ok(IoEntry::named(name.clone(), glob.clone()))
            }
        })
        .collect()
}

/// Normalise one argument spec, inferring the type where absent.
pub fn normalize_arg_spec(raw: &RawArgSpec, task: &str) -> Result<ArgSpec, LoadError> {
    match raw {
        RawArgSpec::Short(text) => normalize_short_arg(text, task),
        RawArgSpec::Full(map) => {
            if map.len() != 1 {
                return Err(LoadError::InvalidArgSpec {
                    task: task.to_string(),
                    arg: format!("{:?}", map.keys().collect::<Vec<_>>()),
                    reason: "an argument entry must have exactly one key".to_string(),
                });
            }
            let (name, body) = map.iter().next().expect("len checked");
            normalize_full_arg(name, body, task)
        }
    }
}

/// Short form: `name[:type][=default]`, `$name` marks an exported arg.
fn normalize_short_arg(text: &str, task: &str) -> Result<ArgSpec, LoadError> {
    let (name_type, default) = match text.split_once('=') {
        Some((head, default)) => (head.trim(), Some(default.trim().to_string())),
        None => (text.trim(), None),
    };
    let (name, ty_name) = match name_type.split_once(':') {
        Some((name, ty)) => (name.trim(), Some(ty.trim())),
        None => (name_type, None),
    };

    let (name, exported) = split_exported(name);
    check_arg_name(&name, text, task)?;

    if exported && ty_name.is_some() {
        return Err(LoadError::InvalidArgSpec {
            task: task.to_string(),
            arg: text.to_string(),
            reason: "exported arguments are always strings and may not declare a type".to_string(),
        });
    }

    let ty = match ty_name {
        Some(t) => ArgType::parse_name(t).ok_or_else(|| LoadError::InvalidArgSpec {
            task: task.to_string(),
            arg: text.to_string(),
            reason: format!("unknown type '{}'", t),
        })?,
        None => ArgType::Str,
    };

    if let Some(ref default) = default {
        check_default_against_type(&name, default, ty, task)?;
    }

    Ok(ArgSpec {
        name,
        exported,
        ty,
        default,
        choices: Vec::new(),
        min: None,
        max: None,
    })
}

fn normalize_full_arg(name: &str, body: &RawArgBody, task: &str) -> Result<ArgSpec, LoadError> {
    let (name, exported) = split_exported(name);
    check_arg_name(&name, &name, task)?;

    if exported && body.ty.is_some() {
        return Err(LoadError::InvalidArgSpec {
            task: task.to_string(),
            arg: name,
            reason: "exported arguments are always strings and may not declare a type".to_string(),
        });
    }

    if body.choices.is_some() && (body.min.is_some() || body.max.is_some()) {
        return Err(LoadError::InvalidArgSpec {
            task: task.to_string(),
            arg: name,
            reason: "'choices' and 'min'/'max' are mutually exclusive".to_string(),
        });
    }

    let explicit_ty = match &body.ty {
        Some(t) => Some(ArgType::parse_name(t).ok_or_else(|| LoadError::InvalidArgSpec {
            task: task.to_string(),
            arg: name.clone(),
            reason: format!("unknown type '{}'", t),
        })?),
        None => None,
    };

    // Inference sources in priority order; every present source must agree.
    let inferred: Vec<ArgType> = [
        body.default.as_ref().map(infer_scalar_type),
        body.min.as_ref().map(infer_scalar_type),
        body.max.as_ref().map(infer_scalar_type),
        body.choices
            .as_ref()
            .and_then(|c| c.first())
            .map(infer_scalar_type),
    ]
    .into_iter()
    .flatten()
    .collect();

    let ty = match explicit_ty {
        Some(t) => t,
        None => {
            let mut candidates = inferred.iter().copied();
            let first = candidates.next().unwrap_or(ArgType::Str);
            if inferred.iter().any(|t| *t != first) {
                return Err(LoadError::InvalidArgSpec {
                    task: task.to_string(),
                    arg: name,
                    reason: "default, min, max and choices imply conflicting types".to_string(),
                });
            }
            first
        }
    };

    if (body.min.is_some() || body.max.is_some())
        && !matches!(ty, ArgType::Int | ArgType::Float)
    {
        return Err(LoadError::InvalidArgSpec {
            task: task.to_string(),
            arg: name,
            reason: "'min'/'max' apply only to numeric types".to_string(),
        });
    }

    let default = body
        .default
        .as_ref()
        .map(|v| {
            yaml_scalar_to_string(v).ok_or_else(|| LoadError::InvalidArgSpec {
                task: task.to_string(),
                arg: name.clone(),
                reason: "default must be a scalar".to_string(),
            })
        })
        .transpose()?;

    let choices = body
        .choices
        .as_ref()
        .map(|values| {
            values
                .iter()
                .map(|v| {
                    yaml_scalar_to_string(v).ok_or_else(|| LoadError::InvalidArgSpec {
                        task: task.to_string(),
                        arg: name.clone(),
                        reason: "choices must be scalars".to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    let min = body
        .min
        .as_ref()
        .map(|v| {
            scalar_to_f64(v).ok_or_else(|| LoadError::InvalidArgSpec {
                task: task.to_string(),
                arg: name.clone(),
                reason: "min must be numeric".to_string(),
            })
        })
        .transpose()?;
    let max = body
        .max
        .as_ref()
        .map(|v| {
            scalar_to_f64(v).ok_or_else(|| LoadError::InvalidArgSpec {
                task: task.to_string(),
                arg: name.clone(),
                reason: "max must be numeric".to_string(),
            })
        })
        .transpose()?;

    if let Some(ref default) = default {
        check_default_against_type(&name, default, ty, task)?;
        if !choices.is_empty() && !choices.contains(default) {
            return Err(LoadError::InvalidArgSpec {
                task: task.to_string(),
                arg: name,
                reason: format!("default '{}' is not one of the choices", default),
            });
        }
        if min.is_some() || max.is_some() {
            let value: f64 = default.parse().map_err(|_| LoadError::InvalidArgSpec {
                task: task.to_string(),
                arg: name.clone(),
                reason: format!("default '{}' is not numeric", default),
            })?;
            if min.is_some_and(|m| value < m) || max.is_some_and(|m| value > m) {
                return Err(LoadError::InvalidArgSpec {
                    task: task.to_string(),
                    arg: name,
                    reason: format!("default '{}' violates min/max", default),
                });
            }
        }
    }

    Ok(ArgSpec {
        name,
        exported,
        ty,
        default,
        choices,
        min,
        max,
    })
}

fn split_exported(name: &str) -> (String, bool) {
    match name.strip_prefix('$') {
        Some(rest) => (rest.to_string(), true),
        None => (name.to_string(), false),
    }
}

fn check_arg_name(name: &str, raw: &str, task: &str) -> Result<(), LoadError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(LoadError::InvalidArgSpec {
            task: task.to_string(),
            arg: raw.to_string(),
            reason: format!("'{}' is not a valid identifier", name),
        })
    }
}

fn check_default_against_type(
    name: &str,
    default: &str,
    ty: ArgType,
    task: &str,
) -> Result<(), LoadError> {
    if crate::core::graph::value_matches_type(default, ty) {
        Ok(())
    } else {
        Err(LoadError::InvalidArgSpec {
            task: task.to_string(),
            arg: name.to_string(),
            reason: format!("default '{}' is not a valid {}", default, ty),
        })
    }
}

fn infer_scalar_type(value: &serde_yaml_ng::Value) -> ArgType {
    match value {
        serde_yaml_ng::Value::Bool(_) => ArgType::Bool,
        serde_yaml_ng::Value::Number(n) if n.is_i64() || n.is_u64() => ArgType::Int,
        serde_yaml_ng::Value::Number(_) => ArgType::Float,
        _ => ArgType::Str,
    }
}

fn scalar_to_f64(value: &serde_yaml_ng::Value) -> Option<f64> {
    value.as_f64()
}

/// Canonical text form of a YAML scalar.
pub fn yaml_scalar_to_string(value: &serde_yaml_ng::Value) -> Option<String> {
    match value {
        serde_yaml_ng::Value::String(s) => Some(s.clone()),
        serde_yaml_ng::Value::Number(n) => Some(n.to_string()),
        serde_yaml_ng::Value::Bool(b) => Some(b.to_string()),
        serde_yaml_ng::Value::Null => Some(String::new()),
        _ => None,
    }
}

fn qualify(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}.{}", ns, name),
        None => name.to_string(),
    }
}

/// Qualify a reference from inside an imported file: already-dotted names
/// stay as written, bare names get the namespace prefix.
fn qualify_reference(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !name.contains('.') => format!("{}.{}", ns, name),
        _ => name.to_string(),
    }
}

fn strip_one_trailing_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
    s
}

fn expand_tilde(path: &str, env: &HashMap<String, String>) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = env
            .get("HOME")
            .or_else(|| env.get("USERPROFILE"))
            .cloned()
            .unwrap_or_default();
        format!("{}/{}", home, rest)
    } else {
        path.to_string()
    }
}

/// Built-ins available while resolving `variables` (no task in scope yet).
fn load_time_builtins(
    project_root: &Path,
    recipe_dir: &Path,
    env: &HashMap<String, String>,
) -> std::collections::BTreeMap<String, String> {
    let mut builtins = std::collections::BTreeMap::new();
    builtins.insert(
        "project_root".to_string(),
        project_root.display().to_string(),
    );
    builtins.insert("recipe_dir".to_string(), recipe_dir.display().to_string());
    if let Some(home) = env.get("HOME").or_else(|| env.get("USERPROFILE")) {
        builtins.insert("user_home".to_string(), home.clone());
    }
    let user = env
        .get("USER")
        .or_else(|| env.get("USERNAME"))
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    builtins.insert("user_name".to_string(), user);
    builtins
}

/// Definition hashes of every task in the recipe, for state pruning.
pub fn all_definition_hashes(
    recipe: &Recipe,
    runner_override: Option<&str>,
    layered_default: Option<&Runner>,
) -> HashSet<String> {
    let mut hashes = HashSet::new();
    for task in recipe.tasks.values() {
        if let Ok(h) = crate::core::graph::task_definition_hash(
            recipe,
            task,
            runner_override,
            layered_default,
        ) {
            hashes.insert(h);
        }
    }
    hashes
}
