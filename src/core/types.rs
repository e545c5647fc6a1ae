//! Recipe data model.
//!
//! Defines the YAML schema types for tasks, runners, variables, argument
//! specs and dependency invocations, plus the fully-resolved `Recipe`.
//! Raw `Raw*` types mirror the YAML shapes (string-or-map forms via
//! untagged enums); the loader normalises them into the resolved types.

use std::fmt;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Raw YAML shapes
// ============================================================================

/// Top-level recipe document as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeDoc {
    #[serde(default)]
    pub imports: Vec<ImportSpec>,

    #[serde(default)]
    pub runners: IndexMap<String, RawRunner>,

    #[serde(default)]
    pub variables: IndexMap<String, RawVariable>,

    #[serde(default)]
    pub tasks: IndexMap<String, RawTask>,
}

/// Recognised top-level keys; anything else is a validation error.
pub const TOP_LEVEL_KEYS: &[&str] = &["imports", "runners", "variables", "tasks"];

/// An `imports:` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportSpec {
    /// Path to the imported recipe, relative to the importing file.
    pub file: String,

    /// Namespace prefix applied to the import's tasks and runners.
    #[serde(rename = "as")]
    pub namespace: String,

    /// Overrides the runner of every non-pinned task from this import.
    #[serde(default)]
    pub run_in: Option<String>,
}

/// A task as written in YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTask {
    pub cmd: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub deps: Vec<RawDep>,

    #[serde(default)]
    pub inputs: Vec<RawIoEntry>,

    #[serde(default)]
    pub outputs: Vec<RawIoEntry>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub runner: Option<String>,

    #[serde(default)]
    pub pin_runner: bool,

    #[serde(default)]
    pub args: Vec<RawArgSpec>,

    #[serde(default)]
    pub private: bool,

    #[serde(default)]
    pub task_output: Option<TaskOutput>,
}

/// A dependency entry: bare name, `{name: [positional]}`, or `{name: {named}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawDep {
    Name(String),
    Bound(IndexMap<String, RawDepBinding>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawDepBinding {
    Positional(Vec<serde_yaml_ng::Value>),
    Named(IndexMap<String, serde_yaml_ng::Value>),
}

/// An input/output entry: a bare glob or a single-key `{name: glob}` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawIoEntry {
    Anonymous(String),
    Named(IndexMap<String, String>),
}

/// An argument spec: short form `name[:type][=default]` or a full map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawArgSpec {
    Short(String),
    Full(IndexMap<String, RawArgBody>),
}

/// Body of the map form of an argument spec.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawArgBody {
    #[serde(default, rename = "type")]
    pub ty: Option<String>,

    #[serde(default)]
    pub default: Option<serde_yaml_ng::Value>,

    #[serde(default)]
    pub choices: Option<Vec<serde_yaml_ng::Value>>,

    #[serde(default)]
    pub min: Option<serde_yaml_ng::Value>,

    #[serde(default)]
    pub max: Option<serde_yaml_ng::Value>,
}

/// A variable declaration: env/read/eval map forms, or a scalar.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawVariable {
    FromEnv {
        env: String,
        #[serde(default)]
        default: Option<String>,
    },
    FromFile {
        read: String,
    },
    FromEval {
        eval: String,
    },
    Scalar(serde_yaml_ng::Value),
}

/// A runner as written in YAML: `shell` and `dockerfile` discriminate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRunner {
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub preamble: Option<String>,

    #[serde(default)]
    pub dockerfile: Option<String>,

    #[serde(default)]
    pub context: Option<String>,

    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default)]
    pub build_args: IndexMap<String, String>,

    #[serde(default)]
    pub env: IndexMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub run_as_root: bool,
}

// ============================================================================
// Resolved model
// ============================================================================

/// A fully-resolved recipe. Constructed once per invocation, immutable after.
#[derive(Debug, Clone)]
pub struct Recipe {
    /// Tasks in declaration order, keyed by (possibly namespaced) name.
    pub tasks: IndexMap<String, Task>,

    /// Runners, keyed by (possibly namespaced) name.
    pub runners: IndexMap<String, Runner>,

    /// Variables after evaluation; always strings. Imported variables are
    /// stored under `namespace.name`.
    pub variables: IndexMap<String, String>,

    /// Directory containing the root recipe file.
    pub recipe_dir: PathBuf,

    /// Where the state file lives.
    pub project_root: PathBuf,

    /// Name of the recipe's `default` runner, if declared.
    pub default_runner: Option<String>,
}

impl Recipe {
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn runner(&self, name: &str) -> Option<&Runner> {
        self.runners.get(name)
    }

    /// Task names visible in listings (private tasks filtered out).
    pub fn public_task_names(&self) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|t| !t.private)
            .map(|t| t.name.as_str())
            .collect()
    }
}

/// A resolved task definition.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub description: Option<String>,
    pub deps: Vec<DepInvocation>,
    pub inputs: Vec<IoEntry>,
    pub outputs: Vec<IoEntry>,
    /// Relative to the project root; defaults to the defining file's directory.
    pub working_dir: String,
    pub runner: Option<String>,
    pub pin_runner: bool,
    /// Import-level `run_in` override recorded at load time.
    pub import_run_in: Option<String>,
    pub args: Vec<ArgSpec>,
    pub cmd: String,
    pub private: bool,
    pub task_output: Option<TaskOutput>,
    /// Namespace this task was imported under, if any.
    pub namespace: Option<String>,
    /// File that defined this task, for error messages.
    pub source_file: PathBuf,
}

impl Task {
    /// Look up a named entry in a list of I/O entries.
    pub fn named_entry<'a>(entries: &'a [IoEntry], name: &str) -> Option<&'a IoEntry> {
        entries.iter().find(|e| e.name.as_deref() == Some(name))
    }
}

/// One input or output. Named entries are referenceable via
/// `self.inputs.<name>`; both kinds participate in freshness and globbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoEntry {
    pub name: Option<String>,
    pub glob: String,
}

impl IoEntry {
    pub fn anonymous(glob: impl Into<String>) -> Self {
        Self {
            name: None,
            glob: glob.into(),
        }
    }

    pub fn named(name: impl Into<String>, glob: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            glob: glob.into(),
        }
    }
}

/// A dependency reference plus the way the dependency's args are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepInvocation {
    pub task: String,
    pub binding: DepBinding,
}

/// How a dependency invocation binds the target task's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepBinding {
    /// No list/map given; every arg must have a default.
    Defaults,
    /// Bound by position; trailing defaulted args may be omitted.
    Positional(Vec<String>),
    /// Bound by name; unknown names fail.
    Named(IndexMap<String, String>),
}

/// Supported argument types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    Str,
    Int,
    Float,
    Bool,
    Path,
    DateTime,
    Ip,
    Ipv4,
    Ipv6,
    Email,
    Hostname,
}

impl ArgType {
    pub fn parse_name(s: &str) -> Option<Self> {
        Some(match s {
            "str" => Self::Str,
            "int" => Self::Int,
            "float" => Self::Float,
            "bool" => Self::Bool,
            "path" => Self::Path,
            "datetime" => Self::DateTime,
            "ip" => Self::Ip,
            "ipv4" => Self::Ipv4,
            "ipv6" => Self::Ipv6,
            "email" => Self::Email,
            "hostname" => Self::Hostname,
            _ => return None,
        })
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Path => "path",
            Self::DateTime => "datetime",
            Self::Ip => "ip",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Email => "email",
            Self::Hostname => "hostname",
        };
        write!(f, "{}", s)
    }
}

/// A normalised argument spec.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArgSpec {
    pub name: String,

    /// Exported args (declared `$name`) become environment variables of the
    /// child process instead of template values. Always strings.
    pub exported: bool,

    pub ty: ArgType,

    pub default: Option<String>,

    /// Mutually exclusive with `min`/`max`.
    pub choices: Vec<String>,

    pub min: Option<f64>,

    pub max: Option<f64>,
}

impl ArgSpec {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exported: false,
            ty: ArgType::Str,
            default: None,
            choices: Vec::new(),
            min: None,
            max: None,
        }
    }
}

/// Where task output goes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TaskOutput {
    /// Stream both stdout and stderr.
    #[default]
    All,
    /// Stream stdout only.
    Out,
    /// Stream stderr only.
    Err,
    /// Buffer stderr; emit it only on non-zero exit. Stdout is suppressed.
    OnErr,
    /// Suppress both.
    None,
}

impl fmt::Display for TaskOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::Out => "out",
            Self::Err => "err",
            Self::OnErr => "on-err",
            Self::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// A named execution context for task commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Runner {
    Shell {
        shell: String,
        preamble: String,
    },
    Container {
        dockerfile: String,
        context: String,
        volumes: Vec<String>,
        ports: Vec<String>,
        build_args: IndexMap<String, String>,
        env: IndexMap<String, String>,
        working_dir: Option<String>,
        run_as_root: bool,
        /// Shell used for scripts executed inside the container.
        shell: Option<String>,
        preamble: String,
    },
}

impl Runner {
    /// Platform default: bash on POSIX, cmd on Windows.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::Shell {
                shell: "cmd".to_string(),
                preamble: String::new(),
            }
        } else {
            Self::Shell {
                shell: "bash".to_string(),
                preamble: String::new(),
            }
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Self::Container { .. })
    }
}
