//! Dependency graph construction.
//!
//! Expands parameterised dependency invocations depth-first from the
//! requested task, binds and validates arguments, detects cycles, applies
//! automatic input inheritance, and emits nodes in topological order
//! (dependencies first, ties broken by declaration order).
//!
//! A node is `(task, sorted argument binding)`; two invocations of the
//! same task with different bound arguments are distinct nodes with
//! separate state entries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use indexmap::IndexMap;

use crate::core::hash;
use crate::core::template::{self, Scope};
use crate::core::types::{
    ArgSpec, ArgType, DepBinding, IoEntry, Recipe, Runner, Task,
};
use crate::error::{Error, ExecError, GraphError};

/// Unit of scheduling: a task plus its bound arguments.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub task: String,
    /// Validated, stringified argument values, sorted by name.
    pub binding: BTreeMap<String, String>,
    /// Declared inputs plus every output glob of every direct dependency,
    /// `var`-expanded. Inheritance is direct-only.
    pub effective_inputs: Vec<IoEntry>,
    /// Node keys of direct dependencies, for the execution cascade.
    pub dep_keys: Vec<String>,
    arg_hash: String,
}

impl GraphNode {
    /// Stable identity within one invocation.
    pub fn key(&self) -> String {
        format!("{}#{}", self.task, self.arg_hash)
    }

    pub fn arg_hash(&self) -> &str {
        &self.arg_hash
    }

    /// Render like `compile(target=x86)` for logs and listings.
    pub fn display(&self) -> String {
        if self.binding.is_empty() {
            return self.task.clone();
        }
        let args: Vec<String> = self
            .binding
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}({})", self.task, args.join(", "))
    }
}

/// Build the topologically ordered node list for one requested task.
///
/// `positional` and `named` are the caller-supplied arguments for the
/// requested task; the graph scope (`var`, `env`, `tt`) comes from the
/// recipe and the captured environment.
pub fn build_graph(
    recipe: &Recipe,
    task_name: &str,
    positional: &[String],
    named: &IndexMap<String, String>,
    env: &HashMap<String, String>,
    builtins: &BTreeMap<String, String>,
) -> Result<Vec<GraphNode>, Error> {
    let task = recipe.task(task_name).ok_or_else(|| {
        let mut names = recipe.public_task_names();
        names.sort_unstable();
        GraphError::UnknownTask {
            name: task_name.to_string(),
            hint: if names.is_empty() {
                String::new()
            } else {
                format!("; available: {}", names.join(", "))
            },
        }
    })?;

    let mut builder = Builder {
        recipe,
        env,
        builtins,
        order: Vec::new(),
        done: HashSet::new(),
        stack: Vec::new(),
    };

    // Bind the root exactly like a dependency invocation, with an empty
    // caller argument scope.
    let root_binding = bind_args(recipe, task, positional, named, &BTreeMap::new(), env, builtins)?;
    builder.visit(task, root_binding)?;

    let mut nodes: Vec<GraphNode> = builder.order;
    // The requested node is last by post-order construction.
    debug_assert_eq!(nodes.last().map(|n| n.task.as_str()), Some(task_name));
    for node in &mut nodes {
        node.effective_inputs = effective_inputs(recipe, recipe.task(&node.task).expect("known"))?;
    }
    Ok(nodes)
}

struct Builder<'a> {
    recipe: &'a Recipe,
    env: &'a HashMap<String, String>,
    builtins: &'a BTreeMap<String, String>,
    order: Vec<GraphNode>,
    done: HashSet<String>,
    /// `(node_key, task_name)` for the DFS path, to report cycles.
    stack: Vec<(String, String)>,
}

impl Builder<'_> {
    fn visit(&mut self, task: &Task, binding: BTreeMap<String, String>) -> Result<String, Error> {
        let arg_hash = hash::binding_hash(&binding);
        let key = format!("{}#{}", task.name, arg_hash);

        if let Some(pos) = self.stack.iter().position(|(k, _)| *k == key) {
            let mut ring: Vec<String> =
                self.stack[pos..].iter().map(|(_, t)| t.clone()).collect();
            ring.push(task.name.clone());
            return Err(GraphError::DependencyCycle {
                ring: ring.join(" -> "),
            }
            .into());
        }
        if self.done.contains(&key) {
            return Ok(key);
        }
        self.stack.push((key.clone(), task.name.clone()));

        // Regular (non-exported) args form the caller scope for binding
        // dependency arguments.
        let caller_args: BTreeMap<String, String> = binding
            .iter()
            .filter(|(name, _)| {
                task.args
                    .iter()
                    .any(|spec| spec.name == **name && !spec.exported)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut dep_keys = Vec::new();
        for dep in &task.deps {
            let dep_task = self.recipe.task(&dep.task).ok_or_else(|| GraphError::UnknownTask {
                name: dep.task.clone(),
                hint: format!(" (dependency of '{}')", task.name),
            })?;

            let (positional, named): (Vec<String>, IndexMap<String, String>) =
                match &dep.binding {
                    DepBinding::Defaults => (Vec::new(), IndexMap::new()),
                    DepBinding::Positional(values) => (values.clone(), IndexMap::new()),
                    DepBinding::Named(map) => (Vec::new(), map.clone()),
                };
            let dep_binding = bind_args(
                self.recipe,
                dep_task,
                &positional,
                &named,
                &caller_args,
                self.env,
                self.builtins,
            )?;
            let dep_key = self.visit(dep_task, dep_binding)?;
            if !dep_keys.contains(&dep_key) {
                dep_keys.push(dep_key);
            }
        }

        self.stack.pop();
        self.done.insert(key.clone());
        self.order.push(GraphNode {
            task: task.name.clone(),
            binding,
            effective_inputs: Vec::new(),
            dep_keys,
            arg_hash,
        });
        Ok(key)
    }
}

/// Bind an argument list against a task's specs: positional by index,
/// named by name, defaults for the rest. Values are template-expanded in
/// the caller's scope, then validated.
pub fn bind_args(
    recipe: &Recipe,
    task: &Task,
    positional: &[String],
    named: &IndexMap<String, String>,
    caller_args: &BTreeMap<String, String>,
    env: &HashMap<String, String>,
    builtins: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, Error> {
    if positional.len() > task.args.len() {
        return Err(GraphError::TooManyArguments {
            task: task.name.clone(),
            given: positional.len(),
            accepted: task.args.len(),
        }
        .into());
    }

    let mut raw: IndexMap<&str, String> = IndexMap::new();
    for (spec, value) in task.args.iter().zip(positional.iter()) {
        raw.insert(spec.name.as_str(), value.clone());
    }
    for (name, value) in named {
        let spec = task
            .args
            .iter()
            .find(|s| &s.name == name)
            .ok_or_else(|| GraphError::UnknownArgument {
                task: task.name.clone(),
                arg: name.clone(),
            })?;
        if raw.insert(spec.name.as_str(), value.clone()).is_some() {
            return Err(GraphError::UnknownArgument {
                task: task.name.clone(),
                arg: format!("{} (bound twice)", name),
            }
            .into());
        }
    }

    let scope = Scope {
        context: &task.name,
        namespace: task.namespace.as_deref(),
        vars: Some(&recipe.variables),
        args: Some(caller_args),
        env: Some(env),
        builtins: Some(builtins),
        ..Default::default()
    };

    let mut binding = BTreeMap::new();
    for spec in &task.args {
        let value = match raw.get(spec.name.as_str()) {
            Some(value) => template::substitute(value, &scope)?,
            None => spec
                .default
                .clone()
                .ok_or_else(|| GraphError::MissingArgument {
                    task: task.name.clone(),
                    arg: spec.name.clone(),
                })?,
        };
        let value = validate_bound_value(&task.name, spec, value)?;
        binding.insert(spec.name.clone(), value);
    }
    Ok(binding)
}

/// Type/choices/range validation of one bound value.
pub fn validate_bound_value(
    task: &str,
    spec: &ArgSpec,
    value: String,
) -> Result<String, GraphError> {
    if !value_matches_type(&value, spec.ty) {
        return Err(GraphError::ArgumentTypeMismatch {
            task: task.to_string(),
            arg: spec.name.clone(),
            value,
            ty: spec.ty.to_string(),
        });
    }
    if !spec.choices.is_empty() && !spec.choices.contains(&value) {
        return Err(GraphError::ArgumentNotInChoices {
            task: task.to_string(),
            arg: spec.name.clone(),
            value,
            choices: spec.choices.join(", "),
        });
    }
    if spec.min.is_some() || spec.max.is_some() {
        let number: f64 = value.parse().map_err(|_| GraphError::ArgumentTypeMismatch {
            task: task.to_string(),
            arg: spec.name.clone(),
            value: value.clone(),
            ty: spec.ty.to_string(),
        })?;
        if spec.min.is_some_and(|m| number < m) || spec.max.is_some_and(|m| number > m) {
            return Err(GraphError::ArgumentOutOfRange {
                task: task.to_string(),
                arg: spec.name.clone(),
                value,
                min: spec.min.map(fmt_num).unwrap_or_else(|| "-inf".into()),
                max: spec.max.map(fmt_num).unwrap_or_else(|| "+inf".into()),
            });
        }
    }
    Ok(value)
}

fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Does `value` parse as `ty`?
pub fn value_matches_type(value: &str, ty: ArgType) -> bool {
    match ty {
        ArgType::Str => true,
        ArgType::Int => value.parse::<i64>().is_ok(),
        ArgType::Float => value.parse::<f64>().is_ok(),
        ArgType::Bool => matches!(value, "true" | "false"),
        ArgType::Path => !value.is_empty(),
        ArgType::DateTime => parse_datetime(value),
        ArgType::Ip => value.parse::<IpAddr>().is_ok(),
        ArgType::Ipv4 => value.parse::<Ipv4Addr>().is_ok(),
        ArgType::Ipv6 => value.parse::<Ipv6Addr>().is_ok(),
        ArgType::Email => is_email(value),
        ArgType::Hostname => is_hostname(value),
    }
}

fn parse_datetime(value: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(value).is_ok()
        || chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
        || chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

fn is_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !local.contains(char::is_whitespace) && is_hostname(domain)
        }
        None => false,
    }
}

fn is_hostname(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

/// Declared inputs plus direct dependencies' output globs, `var`-expanded.
pub fn effective_inputs(recipe: &Recipe, task: &Task) -> Result<Vec<IoEntry>, Error> {
    let mut entries = var_expanded_entries(recipe, task, &task.inputs)?;
    for dep in &task.deps {
        if let Some(dep_task) = recipe.task(&dep.task) {
            for out in var_expanded_entries(recipe, dep_task, &dep_task.outputs)? {
                if !entries.iter().any(|e| e.glob == out.glob) {
                    entries.push(IoEntry::anonymous(out.glob));
                }
            }
        }
    }
    Ok(entries)
}

/// I/O entries with their `var` references expanded, so later `self` and
/// `dep` substitution inserts resolved paths.
pub fn var_expanded_entries(
    recipe: &Recipe,
    task: &Task,
    entries: &[IoEntry],
) -> Result<Vec<IoEntry>, Error> {
    entries
        .iter()
        .map(|entry| {
            let scope = Scope {
                context: &task.name,
                namespace: task.namespace.as_deref(),
                vars: Some(&recipe.variables),
                ..Default::default()
            };
            Ok(IoEntry {
                name: entry.name.clone(),
                glob: template::substitute_vars(&entry.glob, &scope)?,
            })
        })
        .collect()
}

/// Direct dependencies' named outputs for `dep.*.outputs.*` resolution,
/// keyed by dependency task name.
pub fn dep_outputs_for(
    recipe: &Recipe,
    task: &Task,
) -> Result<HashMap<String, IndexMap<String, String>>, Error> {
    let mut map = HashMap::new();
    for dep in &task.deps {
        if let Some(dep_task) = recipe.task(&dep.task) {
            let mut outputs = IndexMap::new();
            for entry in var_expanded_entries(recipe, dep_task, &dep_task.outputs)? {
                if let Some(name) = entry.name {
                    outputs.insert(name, entry.glob);
                }
            }
            map.insert(dep.task.clone(), outputs);
        }
    }
    Ok(map)
}

// ============================================================================
// Runner resolution and definition hashing
// ============================================================================

/// Resolve the runner for a task. Priority, highest first: CLI override,
/// pinned task runner, import-level `run_in`, unpinned task runner,
/// recipe default, layered config default, platform default.
pub fn resolve_runner(
    recipe: &Recipe,
    task: &Task,
    cli_override: Option<&str>,
    layered_default: Option<&Runner>,
) -> Result<(String, Runner), ExecError> {
    let lookup = |name: &str| -> Result<(String, Runner), ExecError> {
        recipe
            .runner(name)
            .cloned()
            .map(|r| (name.to_string(), r))
            .ok_or_else(|| ExecError::RunnerNotFound {
                runner: name.to_string(),
            })
    };

    if let Some(name) = cli_override {
        return lookup(name);
    }
    if task.pin_runner {
        if let Some(name) = &task.runner {
            return lookup(name);
        }
    }
    if let Some(name) = &task.import_run_in {
        return lookup(name);
    }
    if let Some(name) = &task.runner {
        return lookup(name);
    }
    if let Some(name) = &recipe.default_runner {
        return lookup(name);
    }
    if let Some(runner) = layered_default {
        return Ok(("default".to_string(), runner.clone()));
    }
    Ok((
        "__platform_default__".to_string(),
        Runner::platform_default(),
    ))
}

/// Binding-independent definition hash of a task.
///
/// `cmd`, `outputs` and `working_dir` get their `var`/`dep`/`self`
/// references expanded first, so a variable participating in the contract
/// invalidates cached state, while `arg`/`env`/`tt` spans stay literal.
/// Name, description, `inputs` and `deps` never influence the hash.
pub fn task_definition_hash(
    recipe: &Recipe,
    task: &Task,
    cli_override: Option<&str>,
    layered_default: Option<&Runner>,
) -> Result<String, Error> {
    let (_, runner) = resolve_runner(recipe, task, cli_override, layered_default)?;
    let runner_hash = hash::runner_hash(&runner);

    let inputs = var_expanded_entries(recipe, task, &task.inputs)?;
    let outputs = var_expanded_entries(recipe, task, &task.outputs)?;
    let dep_outputs = dep_outputs_for(recipe, task)?;

    let scope = Scope {
        context: &task.name,
        namespace: task.namespace.as_deref(),
        vars: Some(&recipe.variables),
        dep_outputs: Some(&dep_outputs),
        inputs: Some(&inputs),
        outputs: Some(&outputs),
        ..Default::default()
    };

    let cmd = template::substitute_static(&task.cmd, &scope)?;
    let working_dir = template::substitute_static(&task.working_dir, &scope)?;
    let output_globs: Vec<String> = outputs.into_iter().map(|e| e.glob).collect();

    Ok(hash::definition_hash(
        &cmd,
        &output_globs,
        &task.args,
        &working_dir,
        &runner_hash,
    ))
}
