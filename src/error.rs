//! Error types for every pipeline stage.
//!
//! Each stage owns one enum; `Error` composes them so `main` can map an
//! error family to an exit code. Messages carry the offending task or
//! variable name plus the source file where it helps.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error, one variant per pipeline stage.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl Error {
    /// Process exit code for this error family.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Load(_) | Self::Template(_) => 2,
            Self::Graph(_) => 3,
            Self::Exec(_) => 4,
            Self::State(_) => 5,
        }
    }
}

/// Recipe loading and validation failures. Fatal before any task runs.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no recipe file found (tasktree.yaml, tasktree.yml, tt.yaml, or *.tasks); run `tt --init` to create one")]
    RecipeNotFound,

    #[error("multiple recipe files match in {dir}: {candidates}; keep exactly one")]
    AmbiguousRecipe { dir: PathBuf, candidates: String },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {message}")]
    Yaml { path: PathBuf, message: String },

    #[error("unknown top-level key '{key}' in {path}; expected imports, runners, variables, or tasks")]
    UnknownTopLevelKey { key: String, path: PathBuf },

    #[error("invalid task name '{name}' in {path}: '.' is reserved for import namespacing")]
    InvalidTaskName { name: String, path: PathBuf },

    #[error("task '{task}': invalid argument spec '{arg}': {reason}")]
    InvalidArgSpec {
        task: String,
        arg: String,
        reason: String,
    },

    #[error("runner '{runner}' in {path} is invalid: {reason}")]
    RunnerDefinitionInvalid {
        runner: String,
        path: PathBuf,
        reason: String,
    },

    #[error("{path}: {reason}")]
    SchemaViolation { path: PathBuf, reason: String },

    #[error("import cycle: {trace}; remove one of the import edges")]
    ImportCycle { trace: String },

    #[error("import '{file}' referenced from {from} not found")]
    ImportNotFound { file: String, from: PathBuf },

    #[error("variable '{name}': environment variable '{env}' is not set and no default was given")]
    VariableNotSet { name: String, env: String },

    #[error("variable '{name}': cannot read {path}: {reason}")]
    VariableReadFailed {
        name: String,
        path: PathBuf,
        reason: String,
    },

    #[error("variable '{name}': eval command failed with exit code {code}: {stderr}")]
    VariableEvalFailed {
        name: String,
        code: i32,
        stderr: String,
    },
}

/// Template substitution failures. Carry the task (or variable) being
/// expanded and the missing identifier.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("in '{context}': undefined variable '{name}'; define it under `variables` before use")]
    UndefinedVariable { context: String, name: String },

    #[error("in '{context}': undefined environment variable '{name}'")]
    UndefinedEnv { context: String, name: String },

    #[error("in '{context}': undefined argument '{name}'; exported ($) args are not usable as templates")]
    UndefinedArg { context: String, name: String },

    #[error("in '{context}': unknown built-in 'tt.{name}'")]
    UndefinedBuiltin { context: String, name: String },

    #[error("in '{context}': dependency '{dep}' declares no output named '{name}'")]
    UndefinedDependencyOutput {
        context: String,
        dep: String,
        name: String,
    },

    #[error("in '{context}': no {kind} named '{name}'; only named entries are referenceable")]
    UndefinedSelfRef {
        context: String,
        kind: &'static str,
        name: String,
    },

    #[error("in '{context}': {kind} index {index} out of range (valid: 0..{len})")]
    SelfRefIndexOutOfRange {
        context: String,
        kind: &'static str,
        index: usize,
        len: usize,
    },

    #[error("in '{context}': unknown template prefix in '{{{{ {token} }}}}'")]
    UnknownPrefix { context: String, token: String },

    #[error("in '{context}': cannot use {{{{ tt.working_dir }}}} inside the working_dir field")]
    WorkingDirSelfReference { context: String },
}

/// Graph construction and argument binding failures.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task '{name}' not found{hint}")]
    UnknownTask { name: String, hint: String },

    #[error("task '{task}' takes no argument named '{arg}'")]
    UnknownArgument { task: String, arg: String },

    #[error("task '{task}': missing required argument '{arg}'")]
    MissingArgument { task: String, arg: String },

    #[error("task '{task}': too many positional arguments ({given} given, {accepted} accepted)")]
    TooManyArguments {
        task: String,
        given: usize,
        accepted: usize,
    },

    #[error("task '{task}': argument '{arg}' = '{value}' is not a valid {ty}")]
    ArgumentTypeMismatch {
        task: String,
        arg: String,
        value: String,
        ty: String,
    },

    #[error("task '{task}': argument '{arg}' = {value} is outside {min}..={max}")]
    ArgumentOutOfRange {
        task: String,
        arg: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("task '{task}': argument '{arg}' = '{value}' is not one of: {choices}")]
    ArgumentNotInChoices {
        task: String,
        arg: String,
        value: String,
        choices: String,
    },

    #[error("dependency cycle: {ring}")]
    DependencyCycle { ring: String },
}

/// Execution driver failures. Prior successful state updates stay valid.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("runner '{runner}': image build failed: {reason}")]
    RunnerBuildFailed { runner: String, reason: String },

    #[error("runner '{runner}' is not defined in the recipe")]
    RunnerNotFound { runner: String },

    #[error("task '{task}': failed to spawn process: {source}")]
    ProcessSpawnFailed {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task '{task}' failed with exit code {code}")]
    TaskFailed { task: String, code: i32 },

    #[error("recursive task invocation: {chain}")]
    RecursionDetected { chain: String },

    #[error("cannot switch container runners in a nested invocation: currently inside '{current}', task '{task}' wants '{requested}'")]
    NestedContainerSwitch {
        current: String,
        task: String,
        requested: String,
    },

    #[error("runner '{runner}': volume target '{target}' collides with the reserved state mount")]
    ReservedVolumePath { runner: String, target: String },

    #[error("task '{task}': exported argument '{arg}' would override protected environment variable")]
    ProtectedEnvOverride { task: String, arg: String },

    #[error("task '{task}': cannot write temporary script: {source}")]
    ScriptWriteFailed {
        task: String,
        #[source]
        source: std::io::Error,
    },
}

/// State file failures.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} is corrupt: {reason}; fix or remove it with `tt --clean`")]
    StateFileCorrupt { path: PathBuf, reason: String },

    #[error("cannot write state file {path}: {reason}")]
    StateFileWriteFailed { path: PathBuf, reason: String },

    #[error("TT_STATE_FILE_PATH is set but TT_CONTAINERIZED_RUNNER is not; the container environment is misconfigured")]
    OrphanStatePathOverride,
}
