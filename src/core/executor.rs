//! Execution driver — the orchestration loop.
//!
//! Walks the node list in topological order, single-threaded: classify,
//! then for stale nodes materialise the command into a temp script,
//! compose the child environment, spawn through the chosen runner, and
//! record success in the state file (re-read first, then atomically
//! rewritten). A failure stops further scheduling but leaves earlier
//! state updates intact.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::core::clock::Clock;
use crate::core::freshness::{self, Reason};
use crate::core::graph::{self, GraphNode};
use crate::core::loader;
use crate::core::state::{StateEntry, StateFile, CONTAINERIZED_ENV, STATE_PATH_ENV};
use crate::core::template::{self, Scope};
use crate::core::types::{IoEntry, Recipe, Runner, Task, TaskOutput};
use crate::error::{Error, ExecError, TemplateError};
use crate::runner::container::{
    ContainerManager, ContainerSpec, CONTAINER_STATE_PATH,
};
use crate::runner::process::make_process_runner;
use crate::runner::script::TempScript;
use crate::runner::shell;

/// Names of tasks currently executing across nested invocations,
/// comma-separated.
pub const CALL_CHAIN_ENV: &str = "TT_CALL_CHAIN";

/// Environment variables exported args may never override.
pub const PROTECTED_ENV_VARS: &[&str] = &[
    "PATH",
    "LD_LIBRARY_PATH",
    "LD_PRELOAD",
    "HOME",
    "SHELL",
    "USER",
    "LOGNAME",
];

/// Per-invocation execution knobs.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub force: bool,
    /// Run only the requested node, skipping dependencies; implies force.
    pub only: bool,
    pub runner_override: Option<String>,
    pub task_output: Option<TaskOutput>,
}

/// What happened to one node.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub display: String,
    pub reason: Reason,
    pub ran: bool,
}

pub struct Executor<'a> {
    recipe: &'a Recipe,
    state: StateFile,
    clock: &'a dyn Clock,
    /// Captured process environment; template `env.*` and child
    /// environments both derive from it.
    env: HashMap<String, String>,
    layered_default: Option<Runner>,
    containers: ContainerManager,
}

impl<'a> Executor<'a> {
    pub fn new(
        recipe: &'a Recipe,
        state: StateFile,
        clock: &'a dyn Clock,
        env: HashMap<String, String>,
        layered_default: Option<Runner>,
    ) -> Self {
        let containers = ContainerManager::new(recipe.project_root.clone());
        Self {
            recipe,
            state,
            clock,
            env,
            layered_default,
            containers,
        }
    }

    /// Run the stale subset of `nodes` in order. Returns a report per
    /// node, keyed by node identity, in execution order.
    pub fn execute(
        &mut self,
        nodes: &[GraphNode],
        opts: &ExecOptions,
    ) -> Result<IndexMap<String, NodeReport>, Error> {
        // Entries of definitions that left the recipe are dropped before
        // the first node runs.
        let valid = loader::all_definition_hashes(
            self.recipe,
            opts.runner_override.as_deref(),
            self.layered_default.as_ref(),
        );
        if self.state.prune(&valid) > 0 {
            self.state.save()?;
        }

        let selected: &[GraphNode] = if opts.only {
            &nodes[nodes.len().saturating_sub(1)..]
        } else {
            nodes
        };
        let force = opts.force || opts.only;

        let mut executed: HashSet<String> = HashSet::new();
        let mut reports = IndexMap::new();

        for node in selected {
            let task = self
                .recipe
                .task(&node.task)
                .expect("graph nodes reference known tasks");
            let prepared = self.prepare(node, task, opts)?;

            let dependency_ran = node.dep_keys.iter().any(|k| executed.contains(k));
            let reason = freshness::classify(
                &node.task,
                &prepared.def_hash,
                node.arg_hash(),
                &self.state,
                &self.recipe.project_root,
                &prepared.working_dir,
                &prepared.inputs,
                &prepared.outputs,
                force,
                dependency_ran,
            );

            let ran = reason.is_stale();
            if ran {
                info!(task = %node.display(), %reason, "running");
                self.run_node(node, task, &prepared, opts)?;
                self.record_success(node, &prepared)?;
                executed.insert(node.key());
            } else {
                debug!(task = %node.display(), "fresh, skipping");
            }
            reports.insert(
                node.key(),
                NodeReport {
                    display: node.display(),
                    reason,
                    ran,
                },
            );
        }
        Ok(reports)
    }

    /// Everything both classification and execution need, resolved once
    /// per node with one timestamp.
    fn prepare(
        &self,
        node: &GraphNode,
        task: &Task,
        opts: &ExecOptions,
    ) -> Result<PreparedNode, Error> {
        let (runner_name, runner) = graph::resolve_runner(
            self.recipe,
            task,
            opts.runner_override.as_deref(),
            self.layered_default.as_ref(),
        )?;
        let def_hash = graph::task_definition_hash(
            self.recipe,
            task,
            opts.runner_override.as_deref(),
            self.layered_default.as_ref(),
        )?;

        let now = self.clock.now();
        let mut builtins = self.base_builtins(&task.name, now);

        let regular_args: BTreeMap<String, String> = node
            .binding
            .iter()
            .filter(|(name, _)| {
                task.args
                    .iter()
                    .any(|s| s.name == **name && !s.exported)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let exported_args: BTreeMap<String, String> = node
            .binding
            .iter()
            .filter(|(name, _)| {
                task.args.iter().any(|s| s.name == **name && s.exported)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let exported_names: HashSet<String> = exported_args.keys().cloned().collect();

        let self_inputs = graph::var_expanded_entries(self.recipe, task, &task.inputs)?;
        let self_outputs = graph::var_expanded_entries(self.recipe, task, &task.outputs)?;
        let dep_outputs = graph::dep_outputs_for(self.recipe, task)?;

        // The working_dir field must not reference the builtin it defines.
        if contains_working_dir_builtin(&task.working_dir) {
            return Err(TemplateError::WorkingDirSelfReference {
                context: task.name.clone(),
            }
            .into());
        }
        let working_dir = {
            let scope = Scope {
                context: &task.name,
                namespace: task.namespace.as_deref(),
                vars: Some(&self.recipe.variables),
                args: Some(&regular_args),
                exported_args: Some(&exported_names),
                env: Some(&self.env),
                builtins: Some(&builtins),
                dep_outputs: Some(&dep_outputs),
                inputs: Some(&self_inputs),
                outputs: Some(&self_outputs),
            };
            template::substitute(&task.working_dir, &scope)?
        };
        let abs_working_dir = self.recipe.project_root.join(&working_dir);
        builtins.insert(
            "working_dir".to_string(),
            abs_working_dir.display().to_string(),
        );

        // Effective inputs (declared + inherited) and declared outputs,
        // fully expanded for globbing.
        let scope = Scope {
            context: &task.name,
            namespace: task.namespace.as_deref(),
            vars: Some(&self.recipe.variables),
            args: Some(&regular_args),
            exported_args: Some(&exported_names),
            env: Some(&self.env),
            builtins: Some(&builtins),
            dep_outputs: Some(&dep_outputs),
            inputs: Some(&self_inputs),
            outputs: Some(&self_outputs),
        };
        let inputs = expand_entry_templates(&node.effective_inputs, &scope)?;
        let outputs = expand_entry_templates(&self_outputs, &scope)?;
        let cmd = template::substitute(&task.cmd, &scope)?;

        Ok(PreparedNode {
            runner_name,
            runner,
            def_hash,
            working_dir,
            abs_working_dir,
            inputs,
            outputs,
            cmd,
            exported_args,
        })
    }

    fn run_node(
        &mut self,
        node: &GraphNode,
        task: &Task,
        prepared: &PreparedNode,
        opts: &ExecOptions,
    ) -> Result<(), Error> {
        // Recursion guard before extending the chain.
        let chain = self
            .env
            .get(CALL_CHAIN_ENV)
            .map(|c| c.split(',').map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default();
        if chain.iter().any(|name| name == &task.name) {
            let mut display = chain.clone();
            display.push(task.name.clone());
            return Err(ExecError::RecursionDetected {
                chain: display.join(" -> "),
            }
            .into());
        }
        let mut new_chain = chain;
        new_chain.push(task.name.clone());
        let new_chain = new_chain.join(",");

        let policy = opts
            .task_output
            .or(task.task_output)
            .unwrap_or_default();
        let process = make_process_runner(policy);

        let output = match &prepared.runner {
            Runner::Shell { shell, preamble } => {
                let env = self.compose_shell_env(task, prepared, &new_chain)?;
                let script = TempScript::materialize(&prepared.cmd, preamble, shell)
                    .map_err(|e| ExecError::ScriptWriteFailed {
                        task: task.name.clone(),
                        source: e,
                    })?;
                shell::exec_script(
                    script.path(),
                    &prepared.abs_working_dir,
                    &env,
                    process.as_ref(),
                    &task.name,
                )?
            }
            Runner::Container {
                dockerfile,
                context,
                volumes,
                ports,
                build_args,
                env: runner_env,
                working_dir,
                run_as_root,
                shell: container_shell,
                preamble,
            } => {
                let spec = ContainerSpec {
                    name: &prepared.runner_name,
                    dockerfile,
                    context,
                    volumes,
                    ports,
                    build_args,
                    working_dir: working_dir.as_deref(),
                    run_as_root: *run_as_root,
                    shell: container_shell.as_deref(),
                };

                match self.env.get(CONTAINERIZED_ENV) {
                    // Same container runner: run in place with its shell
                    // and preamble, no nested container launch.
                    Some(current) if current == &prepared.runner_name => {
                        let env = self.compose_shell_env(task, prepared, &new_chain)?;
                        let script = TempScript::materialize(
                            &prepared.cmd,
                            preamble,
                            spec.container_shell(),
                        )
                        .map_err(|e| ExecError::ScriptWriteFailed {
                            task: task.name.clone(),
                            source: e,
                        })?;
                        shell::exec_script(
                            script.path(),
                            &prepared.abs_working_dir,
                            &env,
                            process.as_ref(),
                            &task.name,
                        )?
                    }
                    Some(current) => {
                        return Err(ExecError::NestedContainerSwitch {
                            current: current.clone(),
                            task: task.name.clone(),
                            requested: prepared.runner_name.clone(),
                        }
                        .into())
                    }
                    None => {
                        let tag = self.containers.ensure_image(&spec, process.as_ref())?;
                        let container_env =
                            self.compose_container_env(task, prepared, runner_env, &new_chain)?;
                        let script = TempScript::materialize(
                            &prepared.cmd,
                            preamble,
                            spec.container_shell(),
                        )
                        .map_err(|e| ExecError::ScriptWriteFailed {
                            task: task.name.clone(),
                            source: e,
                        })?;
                        let state_path = self.state.path().to_path_buf();
                        self.containers.run_script(
                            &spec,
                            &tag,
                            script.path(),
                            &state_path,
                            &prepared.working_dir,
                            &container_env,
                            process.as_ref(),
                            &task.name,
                        )?
                    }
                }
            }
        };

        if !output.success() {
            if policy == TaskOutput::OnErr && !output.stderr.is_empty() {
                eprint!("{}", output.stderr);
            }
            return Err(ExecError::TaskFailed {
                task: task.name.clone(),
                code: output.exit_code,
            }
            .into());
        }
        debug!(task = %node.display(), "completed");
        Ok(())
    }

    /// Parent env + exported args + internal `TT_*` variables, for shell
    /// execution (host, or in place inside a container).
    fn compose_shell_env(
        &self,
        task: &Task,
        prepared: &PreparedNode,
        call_chain: &str,
    ) -> Result<HashMap<String, String>, Error> {
        let mut env = self.env.clone();
        apply_exported(&mut env, task, &prepared.exported_args)?;
        env.insert(CALL_CHAIN_ENV.to_string(), call_chain.to_string());
        env.entry(STATE_PATH_ENV.to_string())
            .or_insert_with(|| self.state.path().display().to_string());
        Ok(env)
    }

    /// Runner env + exported args + internal `TT_*` variables, passed to
    /// `docker run` via `-e`. The container sees the state file at the
    /// reserved mount path.
    fn compose_container_env(
        &self,
        task: &Task,
        prepared: &PreparedNode,
        runner_env: &IndexMap<String, String>,
        call_chain: &str,
    ) -> Result<IndexMap<String, String>, Error> {
        let mut env: IndexMap<String, String> = runner_env.clone();
        {
            // Exported args beat runner env; protected names stay off
            // limits either way.
            let mut flat: HashMap<String, String> = env.clone().into_iter().collect();
            apply_exported(&mut flat, task, &prepared.exported_args)?;
            for (k, v) in flat {
                env.insert(k, v);
            }
        }
        env.insert(CALL_CHAIN_ENV.to_string(), call_chain.to_string());
        env.insert(
            CONTAINERIZED_ENV.to_string(),
            prepared.runner_name.clone(),
        );
        env.insert(
            STATE_PATH_ENV.to_string(),
            CONTAINER_STATE_PATH.to_string(),
        );
        Ok(env)
    }

    /// Record a successful run: re-read the state file (a nested `tt` may
    /// have rewritten it), then upsert and atomically rewrite.
    fn record_success(&mut self, node: &GraphNode, prepared: &PreparedNode) -> Result<(), Error> {
        self.state.reload()?;
        let inputs = freshness::expand_input_globs(
            &self.recipe.project_root,
            &prepared.working_dir,
            &prepared.inputs,
        );
        self.state.upsert(StateEntry {
            def_hash: prepared.def_hash.clone(),
            arg_hash: node.arg_hash().to_string(),
            last_run_unix: self.clock.now_unix(),
            inputs,
            extra: serde_json::Map::new(),
        });
        self.state.save()?;
        Ok(())
    }

    fn base_builtins(
        &self,
        task_name: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> BTreeMap<String, String> {
        use chrono::SecondsFormat;
        let mut builtins = BTreeMap::new();
        builtins.insert(
            "project_root".to_string(),
            self.recipe.project_root.display().to_string(),
        );
        builtins.insert(
            "recipe_dir".to_string(),
            self.recipe.recipe_dir.display().to_string(),
        );
        builtins.insert("task_name".to_string(), task_name.to_string());
        builtins.insert(
            "timestamp".to_string(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        builtins.insert(
            "timestamp_unix".to_string(),
            now.timestamp().to_string(),
        );
        if let Some(home) = self.env.get("HOME").or_else(|| self.env.get("USERPROFILE")) {
            builtins.insert("user_home".to_string(), home.clone());
        }
        let user = self
            .env
            .get("USER")
            .or_else(|| self.env.get("USERNAME"))
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        builtins.insert("user_name".to_string(), user);
        builtins
    }
}

/// Per-node context shared by classification and execution.
struct PreparedNode {
    runner_name: String,
    runner: Runner,
    def_hash: String,
    /// Template-resolved, relative to the project root.
    working_dir: String,
    abs_working_dir: PathBuf,
    /// Effective inputs, fully expanded.
    inputs: Vec<IoEntry>,
    /// Declared outputs, fully expanded.
    outputs: Vec<IoEntry>,
    cmd: String,
    exported_args: BTreeMap<String, String>,
}

fn apply_exported(
    env: &mut HashMap<String, String>,
    task: &Task,
    exported: &BTreeMap<String, String>,
) -> Result<(), ExecError> {
    for (name, value) in exported {
        if PROTECTED_ENV_VARS.contains(&name.as_str()) {
            return Err(ExecError::ProtectedEnvOverride {
                task: task.name.clone(),
                arg: name.clone(),
            });
        }
        env.insert(name.clone(), value.clone());
    }
    Ok(())
}

fn expand_entry_templates(entries: &[IoEntry], scope: &Scope) -> Result<Vec<IoEntry>, Error> {
    entries
        .iter()
        .map(|e| {
            Ok(IoEntry {
                name: e.name.clone(),
                glob: template::substitute(&e.glob, scope)?,
            })
        })
        .collect()
}

/// `{{ tt.working_dir }}` inside the working_dir field, whitespace-blind.
fn contains_working_dir_builtin(text: &str) -> bool {
    let squeezed: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    squeezed.contains("{{tt.working_dir}}")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::clock::FixedClock;
    use crate::core::loader::{load_recipe, LoadOptions};
    use crate::core::state::STATE_FILE_NAME;
    use std::path::Path;

    fn env() -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.remove(CALL_CHAIN_ENV);
        env.remove(CONTAINERIZED_ENV);
        env.remove(STATE_PATH_ENV);
        env
    }

    fn recipe_from(dir: &Path, content: &str) -> Recipe {
        let path = dir.join("tasktree.yaml");
        std::fs::write(&path, content).unwrap();
        load_recipe(&path, &env(), &LoadOptions::default()).unwrap()
    }

    fn run(
        recipe: &Recipe,
        task: &str,
        opts: &ExecOptions,
    ) -> Result<IndexMap<String, NodeReport>, Error> {
        run_with_env(recipe, task, opts, env())
    }

    fn run_with_env(
        recipe: &Recipe,
        task: &str,
        opts: &ExecOptions,
        env: HashMap<String, String>,
    ) -> Result<IndexMap<String, NodeReport>, Error> {
        let nodes = graph::build_graph(
            recipe,
            task,
            &[],
            &IndexMap::new(),
            &env,
            &BTreeMap::new(),
        )?;
        let state = StateFile::load(recipe.project_root.join(STATE_FILE_NAME)).unwrap();
        let clock = FixedClock(1_700_000_000);
        let mut executor = Executor::new(recipe, state, &clock, env, None);
        executor.execute(&nodes, opts)
    }

    fn ran_tasks(reports: &IndexMap<String, NodeReport>) -> Vec<String> {
        reports
            .values()
            .filter(|r| r.ran)
            .map(|r| r.display.clone())
            .collect()
    }

    #[test]
    fn executes_and_creates_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "payload").unwrap();
        let recipe = recipe_from(
            dir.path(),
            "tasks:\n  copy:\n    cmd: \"cp {{ self.inputs.src }} {{ self.outputs.dst }}\"\n    inputs:\n      - src: in.txt\n    outputs:\n      - dst: out.txt\n    task_output: none\n",
        );
        let reports = run(&recipe, "copy", &ExecOptions::default()).unwrap();
        assert_eq!(ran_tasks(&reports), vec!["copy"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn incremental_second_run_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        let content = "tasks:\n  work:\n    cmd: \"cp in.txt out.txt\"\n    inputs: [in.txt]\n    outputs: [out.txt]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);

        let first = run(&recipe, "work", &ExecOptions::default()).unwrap();
        assert_eq!(ran_tasks(&first).len(), 1);

        let second = run(&recipe, "work", &ExecOptions::default()).unwrap();
        assert!(ran_tasks(&second).is_empty());
        assert_eq!(second.values().next().unwrap().reason, Reason::Fresh);
    }

    #[test]
    fn incrementality_cascade_scenario() {
        // build has no inputs/outputs (always stale); test re-runs
        // because build executed.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.txt"), "t").unwrap();
        let content = "tasks:\n  build:\n    cmd: \"echo hi\"\n    task_output: none\n  test:\n    cmd: \"echo testing\"\n    inputs: [test.txt]\n    outputs: [report.txt]\n    deps: [build]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);

        let first = run(&recipe, "test", &ExecOptions::default()).unwrap();
        assert_eq!(ran_tasks(&first), vec!["build", "test"]);

        let second = run(&recipe, "test", &ExecOptions::default()).unwrap();
        assert_eq!(ran_tasks(&second), vec!["build", "test"]);
        let test_report = second.values().nth(1).unwrap();
        assert_eq!(test_report.reason, Reason::DependencyRan);
    }

    #[test]
    fn definition_hash_survives_rename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        let recipe = recipe_from(
            dir.path(),
            "tasks:\n  test:\n    cmd: \"touch out.txt\"\n    inputs: [in.txt]\n    outputs: [out.txt]\n    task_output: none\n",
        );
        let first = run(&recipe, "test", &ExecOptions::default()).unwrap();
        assert_eq!(ran_tasks(&first).len(), 1);

        // Same contract, new name: the state entry keyed by hash remains
        // valid, so the renamed task is fresh.
        let renamed = recipe_from(
            dir.path(),
            "tasks:\n  check:\n    cmd: \"touch out.txt\"\n    inputs: [in.txt]\n    outputs: [out.txt]\n    task_output: none\n",
        );
        let second = run(&renamed, "check", &ExecOptions::default()).unwrap();
        assert!(ran_tasks(&second).is_empty());
    }

    #[test]
    fn parameterised_nodes_keep_separate_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.c"), "int main(){}").unwrap();
        let content = "tasks:\n  compile:\n    cmd: \"touch {{ arg.target }}.bin\"\n    args: [target]\n    inputs: [src.c]\n    outputs: [\"{{ arg.target }}.bin\"]\n    task_output: none\n  all:\n    cmd: \"echo done\"\n    deps:\n      - compile: [x86]\n      - compile: [arm]\n    outputs: [x86.bin, arm.bin]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);

        let first = run(&recipe, "all", &ExecOptions::default()).unwrap();
        assert_eq!(
            ran_tasks(&first),
            vec!["compile(target=x86)", "compile(target=arm)", "all"]
        );

        let second = run(&recipe, "all", &ExecOptions::default()).unwrap();
        assert!(ran_tasks(&second).is_empty(), "{:?}", ran_tasks(&second));
    }

    #[test]
    fn failure_stops_scheduling_and_keeps_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let content = "tasks:\n  good:\n    cmd: \"cp a.txt a.out\"\n    inputs: [a.txt]\n    outputs: [a.out]\n    task_output: none\n  bad:\n    cmd: \"exit 3\"\n    deps: [good]\n    task_output: none\n  after:\n    cmd: \"touch never.txt\"\n    deps: [bad]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);

        let err = run(&recipe, "after", &ExecOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Exec(ExecError::TaskFailed { code: 3, .. })
        ));
        assert!(!dir.path().join("never.txt").exists());

        // good's state survived: a second run of good alone is fresh.
        let reports = run(&recipe, "good", &ExecOptions::default()).unwrap();
        assert!(ran_tasks(&reports).is_empty());
    }

    #[test]
    fn force_reruns_fresh_nodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        let content = "tasks:\n  work:\n    cmd: \"cp in.txt out.txt\"\n    inputs: [in.txt]\n    outputs: [out.txt]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        run(&recipe, "work", &ExecOptions::default()).unwrap();

        let forced = run(
            &recipe,
            "work",
            &ExecOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ran_tasks(&forced).len(), 1);
        assert_eq!(forced.values().next().unwrap().reason, Reason::Forced);
    }

    #[test]
    fn only_skips_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  dep:\n    cmd: \"touch dep.txt\"\n    task_output: none\n  main:\n    cmd: \"touch main.txt\"\n    deps: [dep]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        let reports = run(
            &recipe,
            "main",
            &ExecOptions {
                only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ran_tasks(&reports), vec!["main"]);
        assert!(!dir.path().join("dep.txt").exists());
        assert!(dir.path().join("main.txt").exists());
    }

    #[test]
    fn exported_args_become_environment() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  show:\n    cmd: \"echo $DEPLOY_TOKEN > token.txt\"\n    args: [$DEPLOY_TOKEN]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        let nodes = graph::build_graph(
            &recipe,
            "show",
            &["sekrit".to_string()],
            &IndexMap::new(),
            &env(),
            &BTreeMap::new(),
        )
        .unwrap();
        let state = StateFile::load(recipe.project_root.join(STATE_FILE_NAME)).unwrap();
        let clock = FixedClock(1_700_000_000);
        let mut executor = Executor::new(&recipe, state, &clock, env(), None);
        executor.execute(&nodes, &ExecOptions::default()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("token.txt"))
                .unwrap()
                .trim(),
            "sekrit"
        );
    }

    #[test]
    fn exported_arg_cannot_override_protected() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  evil:\n    cmd: \"echo $PATH\"\n    args: [$PATH=/tmp]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        let err = run(&recipe, "evil", &ExecOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Exec(ExecError::ProtectedEnvOverride { .. })
        ));
    }

    #[test]
    fn recursion_detected_via_call_chain() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  a:\n    cmd: \"echo nested\"\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        let mut env = env();
        env.insert(CALL_CHAIN_ENV.to_string(), "c,b,a".to_string());
        let err = run_with_env(&recipe, "a", &ExecOptions::default(), env).unwrap_err();
        match err {
            Error::Exec(ExecError::RecursionDetected { chain }) => {
                assert_eq!(chain, "c -> b -> a -> a");
            }
            other => panic!("expected RecursionDetected, got {:?}", other),
        }
    }

    #[test]
    fn call_chain_extends_for_children() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  probe:\n    cmd: \"echo $TT_CALL_CHAIN > chain.txt\"\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        let mut env = env();
        env.insert(CALL_CHAIN_ENV.to_string(), "outer".to_string());
        run_with_env(&recipe, "probe", &ExecOptions::default(), env).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("chain.txt"))
                .unwrap()
                .trim(),
            "outer,probe"
        );
    }

    #[test]
    fn nested_container_switch_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile.other"), "FROM alpine\n").unwrap();
        let content = "runners:\n  img2:\n    dockerfile: Dockerfile.other\ntasks:\n  child:\n    cmd: \"echo hi\"\n    runner: img2\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        let mut env = env();
        env.insert(CONTAINERIZED_ENV.to_string(), "img1".to_string());
        env.insert(
            STATE_PATH_ENV.to_string(),
            dir.path().join(STATE_FILE_NAME).display().to_string(),
        );
        let err = run_with_env(&recipe, "child", &ExecOptions::default(), env).unwrap_err();
        match err {
            Error::Exec(ExecError::NestedContainerSwitch {
                current, requested, ..
            }) => {
                assert_eq!(current, "img1");
                assert_eq!(requested, "img2");
            }
            other => panic!("expected NestedContainerSwitch, got {:?}", other),
        }
    }

    #[test]
    fn same_container_runner_runs_in_place() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let content = "runners:\n  img1:\n    dockerfile: Dockerfile\n    shell: sh\ntasks:\n  inside:\n    cmd: \"touch ran-inside.txt\"\n    runner: img1\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        let mut env = env();
        env.insert(CONTAINERIZED_ENV.to_string(), "img1".to_string());
        env.insert(
            STATE_PATH_ENV.to_string(),
            dir.path().join(STATE_FILE_NAME).display().to_string(),
        );
        run_with_env(&recipe, "inside", &ExecOptions::default(), env).unwrap();
        assert!(dir.path().join("ran-inside.txt").exists());
    }

    #[test]
    fn working_dir_self_reference_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  broken:\n    cmd: \"echo hi\"\n    working_dir: \"{{ tt.working_dir }}/sub\"\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        let err = run(&recipe, "broken", &ExecOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Template(TemplateError::WorkingDirSelfReference { .. })
        ));
    }

    #[test]
    fn working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let content = "tasks:\n  here:\n    cmd: \"touch made-here.txt\"\n    working_dir: sub\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        run(&recipe, "here", &ExecOptions::default()).unwrap();
        assert!(dir.path().join("sub/made-here.txt").exists());
    }

    #[test]
    fn builtin_timestamps_are_consistent_within_task() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  stamp:\n    cmd: \"echo {{ tt.timestamp_unix }}-{{ tt.timestamp_unix }} > stamp.txt\"\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        run(&recipe, "stamp", &ExecOptions::default()).unwrap();
        let content = std::fs::read_to_string(dir.path().join("stamp.txt")).unwrap();
        let (a, b) = content.trim().split_once('-').unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "1700000000");
    }

    #[test]
    fn state_prune_drops_departed_tasks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        let recipe = recipe_from(
            dir.path(),
            "tasks:\n  old:\n    cmd: \"cp in.txt out.txt\"\n    inputs: [in.txt]\n    outputs: [out.txt]\n    task_output: none\n",
        );
        run(&recipe, "old", &ExecOptions::default()).unwrap();
        let state = StateFile::load(dir.path().join(STATE_FILE_NAME)).unwrap();
        assert_eq!(state.entries().len(), 1);

        // New recipe without the old task: its entry is pruned on the
        // next invocation, leaving only the new task's entry.
        let old_def_hash = state.entries()[0].def_hash.clone();
        let replaced = recipe_from(
            dir.path(),
            "tasks:\n  fresh:\n    cmd: \"echo hi\"\n    task_output: none\n",
        );
        run(&replaced, "fresh", &ExecOptions::default()).unwrap();
        let state = StateFile::load(dir.path().join(STATE_FILE_NAME)).unwrap();
        assert_eq!(state.entries().len(), 1);
        assert_ne!(state.entries()[0].def_hash, old_def_hash);
    }

    #[test]
    fn on_err_policy_fails_with_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  noisy:\n    cmd: \"echo problem >&2; exit 5\"\n    task_output: on-err\n";
        let recipe = recipe_from(dir.path(), content);
        let err = run(&recipe, "noisy", &ExecOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Exec(ExecError::TaskFailed { code: 5, .. })
        ));
    }

    #[test]
    fn dep_output_reference_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let content = "tasks:\n  build:\n    cmd: \"echo bin > app.bin\"\n    outputs:\n      - bin: app.bin\n    task_output: none\n  package:\n    cmd: \"cp {{ dep.build.outputs.bin }} packaged.bin\"\n    deps: [build]\n    outputs: [packaged.bin]\n    task_output: none\n";
        let recipe = recipe_from(dir.path(), content);
        run(&recipe, "package", &ExecOptions::default()).unwrap();
        assert!(dir.path().join("packaged.bin").exists());
    }
}
