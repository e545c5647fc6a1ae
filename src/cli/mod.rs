//! Flag-based CLI: `tt [TASK [ARG|name=value ...]]` plus introspection
//! and maintenance flags.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use clap::Parser;
use indexmap::IndexMap;

use crate::core::clock::SystemClock;
use crate::core::config;
use crate::core::executor::{ExecOptions, Executor};
use crate::core::graph;
use crate::core::loader::{self, LoadOptions};
use crate::core::state::StateFile;
use crate::core::types::{DepBinding, Recipe, Runner, Task, TaskOutput};
use crate::error::{Error, ExecError, GraphError, LoadError};

#[derive(Parser, Debug)]
#[command(
    name = "tt",
    version,
    about = "Task automation with incremental execution",
    after_help = "Examples:\n  tt build                     Run the 'build' task\n  tt deploy prod region=us-1   Run 'deploy' with arguments\n  tt --list                    List all tasks\n  tt --tree test               Show the dependency tree for 'test'"
)]
pub struct Cli {
    /// Task name followed by its arguments (positional or name=value).
    #[arg(value_name = "TASK [ARGS]")]
    pub task_args: Vec<String>,

    /// Path to the recipe file (skips discovery).
    #[arg(short = 'T', long = "tasks", value_name = "FILE")]
    pub tasks_file: Option<PathBuf>,

    /// List all available tasks.
    #[arg(short, long)]
    pub list: bool,

    /// Show one task's definition.
    #[arg(short, long, value_name = "TASK")]
    pub show: Option<String>,

    /// Show the dependency tree of a task.
    #[arg(short, long, value_name = "TASK")]
    pub tree: Option<String>,

    /// Create a blank tasktree.yaml in the current directory.
    #[arg(short, long)]
    pub init: bool,

    /// Remove the state file (reset the task cache).
    #[arg(short, long)]
    pub clean: bool,

    /// Force re-run, ignoring freshness.
    #[arg(short, long)]
    pub force: bool,

    /// Run only the named task, skipping dependencies (implies --force).
    #[arg(short, long)]
    pub only: bool,

    /// Override the runner for all tasks.
    #[arg(short, long, value_name = "RUNNER")]
    pub runner: Option<String>,

    /// Control task subprocess output.
    #[arg(short = 'O', long, value_enum, value_name = "MODE")]
    pub task_output: Option<TaskOutput>,

    /// Verbosity of diagnostic messages.
    #[arg(short = 'L', long, default_value = "info", value_name = "LEVEL")]
    pub log_level: String,
}

/// Dispatch a parsed command line. Returns the process outcome.
pub fn dispatch(cli: Cli) -> Result<(), Error> {
    let env: HashMap<String, String> = std::env::vars().collect();

    if cli.init {
        return cmd_init(Path::new("."));
    }
    if cli.clean {
        let recipe = load(&cli, &env, false)?;
        return cmd_clean(&recipe, &env);
    }
    if cli.list {
        let recipe = load(&cli, &env, false)?;
        return cmd_list(&recipe);
    }
    if let Some(name) = &cli.show {
        let recipe = load(&cli, &env, false)?;
        return cmd_show(&recipe, name);
    }
    if let Some(name) = &cli.tree {
        let recipe = load(&cli, &env, false)?;
        return cmd_tree(&recipe, name);
    }

    if cli.task_args.is_empty() {
        let recipe = load(&cli, &env, false)?;
        println!("Available tasks:");
        let mut names = recipe.public_task_names();
        names.sort_unstable();
        for name in names {
            println!("  - {}", name);
        }
        println!("\nUse `tt --list` for details, `tt <task>` to run one.");
        return Ok(());
    }

    let recipe = load(&cli, &env, true)?;
    cmd_run(&cli, &recipe, env)
}

fn load(cli: &Cli, env: &HashMap<String, String>, eval: bool) -> Result<Recipe, Error> {
    let path = match &cli.tasks_file {
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| LoadError::Io {
                path: PathBuf::from("."),
                source: e,
            })?;
            loader::find_recipe_file(&cwd)?
        }
    };
    let opts = LoadOptions { eval_enabled: eval };
    Ok(loader::load_recipe(&path, env, &opts)?)
}

fn cmd_init(dir: &Path) -> Result<(), Error> {
    let path = dir.join("tasktree.yaml");
    if path.exists() {
        return Err(LoadError::SchemaViolation {
            path: path.clone(),
            reason: "already exists; remove it first".to_string(),
        }
        .into());
    }
    let template = r#"# Task Tree recipe. Run `tt --list` to see tasks, `tt <task>` to run one.

variables: {}

runners: {}

tasks:
  hello:
    description: Starter task
    cmd: echo hello from tasktree
"#;
    std::fs::write(&path, template).map_err(|e| LoadError::Io {
        path: path.clone(),
        source: e,
    })?;
    println!("Created {}", path.display());
    Ok(())
}

fn cmd_clean(recipe: &Recipe, env: &HashMap<String, String>) -> Result<(), Error> {
    let path = StateFile::resolve_path(&recipe.project_root, env)?;
    if StateFile::clear(&path)? {
        println!("Removed {}", path.display());
    } else {
        println!("No state file at {}", path.display());
    }
    Ok(())
}

fn cmd_list(recipe: &Recipe) -> Result<(), Error> {
    let mut names = recipe.public_task_names();
    names.sort_unstable();
    if names.is_empty() {
        println!("No tasks defined.");
        return Ok(());
    }
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0);
    for name in names {
        let task = recipe.task(name).expect("listed tasks exist");
        match &task.description {
            Some(desc) => println!("  {:width$}  {}", name, desc, width = width),
            None => println!("  {}", name),
        }
    }
    Ok(())
}

fn cmd_show(recipe: &Recipe, name: &str) -> Result<(), Error> {
    let task = recipe.task(name).ok_or_else(|| GraphError::UnknownTask {
        name: name.to_string(),
        hint: String::new(),
    })?;

    println!("{}", task.name);
    if let Some(desc) = &task.description {
        println!("  description: {}", desc);
    }
    if !task.deps.is_empty() {
        let deps: Vec<String> = task.deps.iter().map(render_dep).collect();
        println!("  deps: {}", deps.join(", "));
    }
    for (label, entries) in [("inputs", &task.inputs), ("outputs", &task.outputs)] {
        if !entries.is_empty() {
            let rendered: Vec<String> = entries
                .iter()
                .map(|e| match &e.name {
                    Some(n) => format!("{}: {}", n, e.glob),
                    None => e.glob.clone(),
                })
                .collect();
            println!("  {}: {}", label, rendered.join(", "));
        }
    }
    if !task.args.is_empty() {
        println!("  args:");
        for spec in &task.args {
            let mut line = format!(
                "    {}{}: {}",
                if spec.exported { "$" } else { "" },
                spec.name,
                spec.ty
            );
            if let Some(default) = &spec.default {
                line.push_str(&format!(" = {}", default));
            }
            if !spec.choices.is_empty() {
                line.push_str(&format!(" (choices: {})", spec.choices.join(", ")));
            }
            println!("{}", line);
        }
    }
    if let Some(runner) = &task.runner {
        println!(
            "  runner: {}{}",
            runner,
            if task.pin_runner { " (pinned)" } else { "" }
        );
    }
    println!("  working_dir: {}", task.working_dir);
    println!("  cmd: |");
    for line in task.cmd.lines() {
        println!("    {}", line);
    }
    Ok(())
}

fn render_dep(dep: &crate::core::types::DepInvocation) -> String {
    match &dep.binding {
        DepBinding::Defaults => dep.task.clone(),
        DepBinding::Positional(values) => format!("{}({})", dep.task, values.join(", ")),
        DepBinding::Named(map) => {
            let pairs: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            format!("{}({})", dep.task, pairs.join(", "))
        }
    }
}

fn cmd_tree(recipe: &Recipe, name: &str) -> Result<(), Error> {
    let task = recipe.task(name).ok_or_else(|| GraphError::UnknownTask {
        name: name.to_string(),
        hint: String::new(),
    })?;
    print_tree(recipe, task, 0, &mut Vec::new());
    Ok(())
}

fn print_tree(recipe: &Recipe, task: &Task, depth: usize, path: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    if path.contains(&task.name) {
        println!("{}{} (cycle)", indent, task.name);
        return;
    }
    println!("{}{}", indent, task.name);
    path.push(task.name.clone());
    for dep in &task.deps {
        match recipe.task(&dep.task) {
            Some(dep_task) => print_tree(recipe, dep_task, depth + 1, path),
            None => println!("{}  {} (unknown)", indent, dep.task),
        }
    }
    path.pop();
}

fn cmd_run(cli: &Cli, recipe: &Recipe, env: HashMap<String, String>) -> Result<(), Error> {
    let task_name = &cli.task_args[0];
    let (positional, named) = parse_task_tokens(&cli.task_args[1..]);

    if let Some(name) = &cli.runner {
        if recipe.runner(name).is_none() {
            return Err(ExecError::RunnerNotFound {
                runner: name.clone(),
            }
            .into());
        }
    }

    let layered_default = layered_default(recipe, &env);
    let builtins = graph_builtins(recipe, &env);
    let nodes = graph::build_graph(recipe, task_name, &positional, &named, &env, &builtins)?;

    let state_path = StateFile::resolve_path(&recipe.project_root, &env)?;
    let state = StateFile::load(state_path)?;
    let clock = SystemClock;
    let mut executor = Executor::new(recipe, state, &clock, env, layered_default);

    let opts = ExecOptions {
        force: cli.force,
        only: cli.only,
        runner_override: cli.runner.clone(),
        task_output: cli.task_output,
    };
    let reports = executor.execute(&nodes, &opts)?;

    let ran = reports.values().filter(|r| r.ran).count();
    let fresh = reports.len() - ran;
    println!(
        "Task '{}' completed ({} run, {} fresh)",
        task_name, ran, fresh
    );
    Ok(())
}

/// Only the recipe-less layers matter when the recipe declares its own
/// default runner.
fn layered_default(recipe: &Recipe, env: &HashMap<String, String>) -> Option<Runner> {
    if recipe.default_runner.is_some() {
        return None;
    }
    config::layered_default_runner(&recipe.project_root, env)
}

/// `tt.*` values usable while binding dependency arguments (nothing
/// task-execution-specific).
fn graph_builtins(recipe: &Recipe, env: &HashMap<String, String>) -> BTreeMap<String, String> {
    let mut builtins = BTreeMap::new();
    builtins.insert(
        "project_root".to_string(),
        recipe.project_root.display().to_string(),
    );
    builtins.insert(
        "recipe_dir".to_string(),
        recipe.recipe_dir.display().to_string(),
    );
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

/// Split CLI task arguments into positional values and `name=value`
/// pairs, preserving order within each group.
pub fn parse_task_tokens(tokens: &[String]) -> (Vec<String>, IndexMap<String, String>) {
    let mut positional = Vec::new();
    let mut named = IndexMap::new();
    for token in tokens {
        match token.split_once('=') {
            Some((name, value)) if is_identifier(name) => {
                named.insert(name.to_string(), value.to_string());
            }
            _ => positional.push(token.clone()),
        }
    }
    (positional, named)
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.chars().next().is_some_and(|c| c.is_ascii_digit())
}
