//! BLAKE3 hashing for task definitions, argument bindings, and runners.
//!
//! All hashes render as `"blake3:{hex}"`. Canonicalisation goes through
//! JSON with sorted collections so the same definition produces the same
//! hash across processes and machines of the same platform.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::types::{ArgSpec, Runner};

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash a byte buffer. Returns `"blake3:{hex}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}

/// Canonical serialisation of a task's contract.
///
/// Covers `cmd`, `outputs`, `args`, `working_dir` and the resolved runner
/// hash. Task name, description, `inputs` and `deps` stay out: the first
/// two are documentation, the last two are tracked by timestamps and
/// scheduling respectively.
#[derive(Serialize)]
struct DefinitionRecord<'a> {
    cmd: &'a str,
    outputs: Vec<&'a str>,
    args: Vec<CanonicalArg<'a>>,
    working_dir: &'a str,
    runner: &'a str,
}

#[derive(Serialize)]
struct CanonicalArg<'a> {
    name: &'a str,
    exported: bool,
    ty: String,
    default: Option<&'a str>,
    choices: &'a [String],
    min: Option<f64>,
    max: Option<f64>,
}

/// Compute the definition hash of a task.
///
/// `cmd`, `outputs` and `working_dir` must already have their
/// recipe-derivable prefixes (`var`, `dep`, `self`) expanded; `arg`, `env`
/// and `tt` references stay literal so runtime-only values never leak into
/// the key.
pub fn definition_hash(
    cmd: &str,
    outputs: &[String],
    args: &[ArgSpec],
    working_dir: &str,
    runner_hash: &str,
) -> String {
    let mut sorted_outputs: Vec<&str> = outputs.iter().map(String::as_str).collect();
    sorted_outputs.sort_unstable();

    let mut canonical_args: Vec<CanonicalArg> = args
        .iter()
        .map(|a| CanonicalArg {
            name: &a.name,
            exported: a.exported,
            ty: a.ty.to_string(),
            default: a.default.as_deref(),
            choices: &a.choices,
            min: a.min,
            max: a.max,
        })
        .collect();
    canonical_args.sort_by(|a, b| a.name.cmp(b.name));

    let record = DefinitionRecord {
        cmd,
        outputs: sorted_outputs,
        args: canonical_args,
        working_dir,
        runner: runner_hash,
    };

    // serde_json emits struct fields in declaration order; stable.
    let serialized = serde_json::to_string(&record).expect("definition record serialises");
    hash_string(&serialized)
}

/// Compute the hash of a resolved runner definition.
pub fn runner_hash(runner: &Runner) -> String {
    let serialized = serde_json::to_string(runner).expect("runner serialises");
    hash_string(&serialized)
}

/// Compute the hash of a node's bound arguments.
///
/// The binding is already sorted by name (`BTreeMap`), so serialisation is
/// canonical. An empty binding hashes to a fixed value shared by all
/// argument-less nodes of a task.
pub fn binding_hash(binding: &BTreeMap<String, String>) -> String {
    let serialized = serde_json::to_string(binding).expect("binding serialises");
    hash_string(&serialized)
}
