//! Template substitution over `{{ prefix.path }}` occurrences.
//!
//! Two-pass design: a scanner identifies candidate spans, then resolution
//! happens in a fixed prefix order — `var`, then `dep`, then `self`, then
//! `arg`/`env`/`tt` together. Each pass operates on the output of the
//! prior, so an input path may contain `{{ var.x }}` and still be reached
//! through `{{ self.inputs.name }}`.
//!
//! Substitution is literal text replacement; no shell quoting is applied.
//! A span is only treated as a template when its trimmed body looks like
//! `prefix.path` with a known prefix; anything else (awk bodies, nested
//! braces) passes through untouched.

use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::IndexMap;

use crate::core::types::IoEntry;
use crate::error::TemplateError;

/// One resolution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Var,
    Dep,
    SelfRef,
    /// `arg`, `env` and `tt`, resolved together last.
    Late,
}

const ALL_PASSES: &[Pass] = &[Pass::Var, Pass::Dep, Pass::SelfRef, Pass::Late];
const STATIC_PASSES: &[Pass] = &[Pass::Var, Pass::Dep, Pass::SelfRef];

/// Everything a template may draw values from. Absent maps simply make the
/// corresponding prefix undefined.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    /// Task or variable name, used in error messages.
    pub context: &'a str,

    /// Namespace of the task being expanded; `var` lookups try
    /// `namespace.name` before the bare name.
    pub namespace: Option<&'a str>,

    pub vars: Option<&'a IndexMap<String, String>>,

    /// Regular (non-exported) bound arguments.
    pub args: Option<&'a BTreeMap<String, String>>,

    /// Names of exported arguments; referencing one as a template is an
    /// error rather than an undefined lookup.
    pub exported_args: Option<&'a HashSet<String>>,

    pub env: Option<&'a HashMap<String, String>>,

    /// `tt.*` built-ins.
    pub builtins: Option<&'a BTreeMap<String, String>>,

    /// Dependency task name → its named outputs (name → glob, already
    /// `var`-expanded).
    pub dep_outputs: Option<&'a HashMap<String, IndexMap<String, String>>>,

    /// Own entries, already `var`-expanded.
    pub inputs: Option<&'a [IoEntry]>,
    pub outputs: Option<&'a [IoEntry]>,
}

/// Resolve every prefix in the documented order.
pub fn substitute(text: &str, scope: &Scope) -> Result<String, TemplateError> {
    run_passes(text, scope, ALL_PASSES, true)
}

/// Resolve only the recipe-derivable prefixes (`var`, `dep`, `self`),
/// leaving `arg`/`env`/`tt` spans literal. Used for definition hashing.
pub fn substitute_static(text: &str, scope: &Scope) -> Result<String, TemplateError> {
    run_passes(text, scope, STATIC_PASSES, false)
}

/// Resolve only `var` spans. I/O entry globs are pre-expanded with this
/// before `self`/`dep` references can pick them up.
pub fn substitute_vars(text: &str, scope: &Scope) -> Result<String, TemplateError> {
    run_passes(text, scope, &[Pass::Var], false)
}

fn run_passes(
    text: &str,
    scope: &Scope,
    passes: &[Pass],
    strict: bool,
) -> Result<String, TemplateError> {
    let mut out = text.to_string();
    for (i, pass) in passes.iter().enumerate() {
        let last = strict && i == passes.len() - 1;
        out = run_pass(&out, scope, *pass, last)?;
    }
    Ok(out)
}

/// A single scan. Spans whose prefix belongs to a later pass are left in
/// place; on the final strict pass, leftover known-shape spans with an
/// unrecognised prefix are errors.
fn run_pass(
    text: &str,
    scope: &Scope,
    pass: Pass,
    final_pass: bool,
) -> Result<String, TemplateError> {
    let mut result = text.to_string();
    let mut start = 0;

    while let Some(rel) = result[start..].find("{{") {
        let open = start + rel;
        let Some(rel_close) = result[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + rel_close + 2;
        let body = result[open + 2..close - 2].trim().to_string();

        if !looks_like_reference(&body) {
            // Literal braces; rescan just past the opener so a nested
            // `{{` still gets considered.
            start = open + 2;
            continue;
        }

        let (prefix, path) = body.split_once('.').expect("reference has a dot");

        let handled = match (pass, prefix) {
            (Pass::Var, "var") => Some(resolve_var(scope, path)?),
            (Pass::Dep, "dep") => Some(resolve_dep(scope, path, &body)?),
            (Pass::SelfRef, "self") => Some(resolve_self(scope, path, &body)?),
            (Pass::Late, "arg") => Some(resolve_arg(scope, path)?),
            (Pass::Late, "env") => Some(resolve_env(scope, path)?),
            (Pass::Late, "tt") => Some(resolve_builtin(scope, path)?),
            _ => None,
        };

        match handled {
            Some(value) => {
                result.replace_range(open..close, &value);
                start = open + value.len();
            }
            None => {
                let known = matches!(prefix, "var" | "dep" | "self" | "arg" | "env" | "tt");
                if final_pass && !known {
                    return Err(TemplateError::UnknownPrefix {
                        context: scope.context.to_string(),
                        token: body,
                    });
                }
                start = close;
            }
        }
    }

    Ok(result)
}

/// `prefix.path` where every segment is identifier-ish. Keeps shell and
/// awk brace soup out of the template machinery.
fn looks_like_reference(body: &str) -> bool {
    let Some((prefix, path)) = body.split_once('.') else {
        return false;
    };
    if prefix.is_empty() || path.is_empty() {
        return false;
    }
    let ident = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    };
    ident(prefix) && path.split('.').all(ident)
}

fn resolve_var(scope: &Scope, name: &str) -> Result<String, TemplateError> {
    if let Some(vars) = scope.vars {
        if let Some(ns) = scope.namespace {
            if let Some(v) = vars.get(&format!("{}.{}", ns, name)) {
                return Ok(v.clone());
            }
        }
        if let Some(v) = vars.get(name) {
            return Ok(v.clone());
        }
    }
    Err(TemplateError::UndefinedVariable {
        context: scope.context.to_string(),
        name: name.to_string(),
    })
}

fn resolve_arg(scope: &Scope, name: &str) -> Result<String, TemplateError> {
    // Exported args are env vars of the child process, never template
    // values; the error text points that out.
    let exported = scope
        .exported_args
        .is_some_and(|names| names.contains(name));
    if !exported {
        if let Some(args) = scope.args {
            if let Some(v) = args.get(name) {
                return Ok(v.clone());
            }
        }
    }
    Err(TemplateError::UndefinedArg {
        context: scope.context.to_string(),
        name: name.to_string(),
    })
}

fn resolve_env(scope: &Scope, name: &str) -> Result<String, TemplateError> {
    scope
        .env
        .and_then(|env| env.get(name).cloned())
        .ok_or_else(|| TemplateError::UndefinedEnv {
            context: scope.context.to_string(),
            name: name.to_string(),
        })
}

fn resolve_builtin(scope: &Scope, name: &str) -> Result<String, TemplateError> {
    scope
        .builtins
        .and_then(|b| b.get(name).cloned())
        .ok_or_else(|| TemplateError::UndefinedBuiltin {
            context: scope.context.to_string(),
            name: name.to_string(),
        })
}

/// `dep.<task>.outputs.<name>` — the task segment may itself be namespaced.
fn resolve_dep(scope: &Scope, path: &str, body: &str) -> Result<String, TemplateError> {
    // Path shape: `<task>.outputs.<name>`, where the task segment may
    // itself contain dots (namespaced imports).
    let Some((task_part, out_name)) = path
        .rsplit_once('.')
        .and_then(|(head, name)| head.strip_suffix(".outputs").map(|task| (task, name)))
        .filter(|(task, name)| !task.is_empty() && !name.is_empty())
    else {
        return Err(TemplateError::UnknownPrefix {
            context: scope.context.to_string(),
            token: body.to_string(),
        });
    };

    let outputs = scope.dep_outputs;
    let lookup = |task: &str| outputs.and_then(|m| m.get(task));

    let qualified = scope.namespace.map(|ns| format!("{}.{}", ns, task_part));
    let dep_map = qualified
        .as_deref()
        .and_then(lookup)
        .or_else(|| lookup(task_part));

    match dep_map.and_then(|m| m.get(out_name)) {
        Some(glob) => Ok(glob.clone()),
        None => Err(TemplateError::UndefinedDependencyOutput {
            context: scope.context.to_string(),
            dep: task_part.to_string(),
            name: out_name.to_string(),
        }),
    }
}

/// `self.inputs.<n>` / `self.outputs.<n>` by name or zero-based index.
fn resolve_self(scope: &Scope, path: &str, body: &str) -> Result<String, TemplateError> {
    let (kind, selector) = match path.split_once('.') {
        Some(("inputs", sel)) => ("input", sel),
        Some(("outputs", sel)) => ("output", sel),
        _ => {
            return Err(TemplateError::UnknownPrefix {
                context: scope.context.to_string(),
                token: body.to_string(),
            })
        }
    };

    let entries: &[IoEntry] = match kind {
        "input" => scope.inputs.unwrap_or(&[]),
        _ => scope.outputs.unwrap_or(&[]),
    };

    // Named entries are simultaneously indexable; anonymous entries are
    // indexable only.
    if selector.starts_with('-') && selector[1..].chars().all(|c| c.is_ascii_digit()) {
        return Err(TemplateError::SelfRefIndexOutOfRange {
            context: scope.context.to_string(),
            kind: if kind == "input" { "input" } else { "output" },
            index: usize::MAX,
            len: entries.len(),
        });
    }

    if selector.chars().all(|c| c.is_ascii_digit()) {
        let index: usize = selector.parse().map_err(|_| {
            TemplateError::SelfRefIndexOutOfRange {
                context: scope.context.to_string(),
                kind: if kind == "input" { "input" } else { "output" },
                index: usize::MAX,
                len: entries.len(),
            }
        })?;
        return entries
            .get(index)
            .map(|e| e.glob.clone())
            .ok_or_else(|| TemplateError::SelfRefIndexOutOfRange {
                context: scope.context.to_string(),
                kind: if kind == "input" { "input" } else { "output" },
                index,
                len: entries.len(),
            });
    }

    entries
        .iter()
        .find(|e| e.name.as_deref() == Some(selector))
        .map(|e| e.glob.clone())
        .ok_or_else(|| TemplateError::UndefinedSelfRef {
            context: scope.context.to_string(),
            kind: if kind == "input" { "input" } else { "output" },
            name: selector.to_string(),
        })
}
