//! Loader for two-document experiment sweep manifests.
//!
//! A manifest pairs a SLURM job descriptor with an experiment descriptor.
//! The experiment may import a shared base section via `import_path` /
//! `import_exp`; its `params` override the base recursively, and optional
//! `grid` (cartesian) and `list` (zipped) mappings expand the merged
//! configuration into one run per expansion point per repetition seed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, SweepError>;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("reference error: {0}")]
    Reference(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("consistency error: {0}")]
    Consistency(String),
}

impl SweepError {
    /// Stable machine-readable code for each variant, used by the CLI's
    /// JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            SweepError::Io(_) => "io_error",
            SweepError::Parse(_) => "parse_error",
            SweepError::Reference(_) => "reference_error",
            SweepError::Schema(_) => "schema_error",
            SweepError::Consistency(_) => "consistency_error",
        }
    }
}

/// Wall-time budget of a job. SLURM accepts either a bare minute count or a
/// clock string such as `24:00:00`; both spellings round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeBudget {
    Minutes(u64),
    Clock(String),
}

impl TimeBudget {
    /// Budget in minutes, if the clock string is well-formed
    /// (`MM`, `HH:MM` or `HH:MM:SS`).
    pub fn minutes(&self) -> Option<u64> {
        match self {
            TimeBudget::Minutes(m) => Some(*m),
            TimeBudget::Clock(s) => {
                let parts: Vec<&str> = s.split(':').collect();
                let nums: Vec<u64> = parts
                    .iter()
                    .map(|p| p.parse::<u64>())
                    .collect::<std::result::Result<_, _>>()
                    .ok()?;
                match nums.as_slice() {
                    [m] => Some(*m),
                    [h, m] => Some(h * 60 + m),
                    [h, m, _s] => Some(h * 60 + m),
                    _ => None,
                }
            }
        }
    }
}

impl fmt::Display for TimeBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBudget::Minutes(m) => write!(f, "{}", m),
            TimeBudget::Clock(s) => write!(f, "{}", s),
        }
    }
}

/// Cluster-level settings of document 1. Immutable once loaded; the
/// `sbatch_args` mapping is opaque and passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub partition: String,
    #[serde(rename = "job-name", default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_parallel_jobs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntasks: Option<u64>,
    #[serde(
        rename = "cpus-per-task",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cpus_per_task: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeBudget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus_per_rep: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default, deserialize_with = "mapping_or_empty")]
    pub sbatch_args: Mapping,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experiment_copy_src: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_copy_auto_dst: Option<String>,
}

/// Experiment settings of document 2. Unrecognized top-level keys are
/// ignored; `params`, `grid` and `list` keep their declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetitions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reps_per_job: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reps_in_parallel: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_checkpoints: Option<u64>,
    #[serde(default, deserialize_with = "mapping_or_empty")]
    pub params: Mapping,
    #[serde(default, deserialize_with = "mapping_or_empty")]
    pub grid: Mapping,
    #[serde(default, deserialize_with = "mapping_or_empty")]
    pub list: Mapping,
}

/// One manifest file: at most one SLURM document plus exactly one
/// experiment document (or a single merged mapping, split by key).
#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub job: Option<JobDescriptor>,
    pub experiment: ExperimentDescriptor,
}

/// Result of following the import chain: the merged experiment, the
/// nearest job descriptor along the chain, and the chain itself
/// (importing file first).
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedExperiment {
    pub job: JobDescriptor,
    pub experiment: ExperimentDescriptor,
    pub import_chain: Vec<PathBuf>,
}

/// One concrete run: the merged params with a single expansion point
/// applied, plus the seed index. Serializing and re-parsing yields an
/// identical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRunConfig {
    pub run_name: String,
    pub experiment: String,
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_checkpoints: Option<u64>,
    pub params: Mapping,
    #[serde(default, deserialize_with = "mapping_or_empty")]
    pub assignment: Mapping,
}

/// Top-level keys that belong to the job schema. Used to split a
/// single-document merged mapping into job and experiment halves;
/// `name` stays with the experiment in that case.
const JOB_KEYS: &[&str] = &[
    "partition",
    "job-name",
    "num_parallel_jobs",
    "ntasks",
    "cpus-per-task",
    "time",
    "gpus_per_rep",
    "scheduler",
    "sbatch_args",
    "experiment_copy_src",
    "experiment_copy_auto_dst",
];

const JOB_DOCUMENT_NAME: &str = "SLURM";

/// Leaf key inside `params` that is tied to the experiment-level
/// `iterations` count. The manifests share this value via anchor/alias;
/// the loader asserts the two spellings agree instead of trusting it.
const LINKED_ITERATIONS_LEAF: &str = "total_train_steps";

fn mapping_or_empty<'de, D>(deserializer: D) -> std::result::Result<Mapping, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(Mapping::new()),
        Some(Value::Mapping(m)) => Ok(m),
        Some(_) => Err(serde::de::Error::custom("expected a mapping")),
    }
}

fn read_documents(path: &Path) -> Result<Vec<Mapping>> {
    let text = fs::read_to_string(path)?;
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&text) {
        let mut value = Value::deserialize(document)
            .map_err(|e| SweepError::Parse(format!("{}: {}", path.display(), e)))?;
        value
            .apply_merge()
            .map_err(|e| SweepError::Parse(format!("{}: {}", path.display(), e)))?;
        match value {
            Value::Null => continue,
            Value::Mapping(m) => docs.push(m),
            _ => {
                return Err(SweepError::Parse(format!(
                    "{}: every document must be a mapping",
                    path.display()
                )))
            }
        }
    }
    Ok(docs)
}

fn doc_name(mapping: &Mapping) -> Option<&str> {
    mapping.get("name").and_then(Value::as_str)
}

fn parse_job(mapping: Mapping) -> Result<JobDescriptor> {
    serde_yaml::from_value(Value::Mapping(mapping))
        .map_err(|e| SweepError::Parse(format!("invalid SLURM document: {}", e)))
}

fn parse_experiment(mapping: Mapping) -> Result<ExperimentDescriptor> {
    serde_yaml::from_value(Value::Mapping(mapping))
        .map_err(|e| SweepError::Parse(format!("invalid experiment document: {}", e)))
}

fn split_merged_mapping(mapping: Mapping) -> (Option<Mapping>, Mapping) {
    let mut job = Mapping::new();
    let mut experiment = Mapping::new();
    for (key, value) in mapping {
        let is_job_key = key
            .as_str()
            .map(|s| JOB_KEYS.contains(&s))
            .unwrap_or(false);
        if is_job_key {
            job.insert(key, value);
        } else {
            experiment.insert(key, value);
        }
    }
    if job.is_empty() {
        (None, experiment)
    } else {
        job.insert(
            Value::String("name".to_string()),
            Value::String(JOB_DOCUMENT_NAME.to_string()),
        );
        (Some(job), experiment)
    }
}

impl Manifest {
    /// Parses a manifest file. Every `---` document is read; the document
    /// named `SLURM` becomes the job descriptor and the remaining one the
    /// experiment. A single-document file is treated as a merged mapping
    /// and split by top-level key.
    pub fn load(path: &Path) -> Result<Manifest> {
        let docs = read_documents(path)?;
        if docs.is_empty() {
            return Err(SweepError::Parse(format!(
                "{}: manifest contains no documents",
                path.display()
            )));
        }

        let mut job_docs = Vec::new();
        let mut exp_docs = Vec::new();
        for doc in docs {
            if doc_name(&doc) == Some(JOB_DOCUMENT_NAME) {
                job_docs.push(doc);
            } else {
                exp_docs.push(doc);
            }
        }
        if job_docs.len() > 1 {
            return Err(SweepError::Parse(format!(
                "{}: more than one SLURM document",
                path.display()
            )));
        }

        let (job_mapping, exp_mapping) = if job_docs.is_empty() && exp_docs.len() == 1 {
            split_merged_mapping(exp_docs.remove(0))
        } else {
            if exp_docs.len() != 1 {
                return Err(SweepError::Parse(format!(
                    "{}: expected exactly one experiment document, found {}",
                    path.display(),
                    exp_docs.len()
                )));
            }
            (job_docs.pop(), exp_docs.remove(0))
        };

        let job = job_mapping.map(parse_job).transpose()?;
        let experiment = parse_experiment(exp_mapping)?;

        match (&experiment.import_path, &experiment.import_exp) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(SweepError::Parse(format!(
                    "{}: import_path and import_exp must be given together",
                    path.display()
                )));
            }
            _ => {}
        }
        if job.is_none() && experiment.import_path.is_none() {
            return Err(SweepError::Parse(format!(
                "{}: manifest has no SLURM document and no import_path",
                path.display()
            )));
        }

        check_linked_iterations(&experiment)?;
        debug!(
            manifest = %path.display(),
            experiment = %experiment.name,
            "loaded manifest"
        );

        Ok(Manifest {
            path: path.to_path_buf(),
            job,
            experiment,
        })
    }

    /// Follows the import chain and merges this manifest's experiment over
    /// its base, innermost base first. The job descriptor is the manifest's
    /// own if present, otherwise the nearest one found along the chain.
    pub fn resolve(&self) -> Result<ResolvedExperiment> {
        let start = fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        let mut visited = vec![start];
        let (job, experiment) = resolve_descriptor(
            &self.path,
            self.job.clone(),
            self.experiment.clone(),
            &mut visited,
        )?;
        let job = job.ok_or_else(|| {
            SweepError::Parse(format!(
                "{}: no SLURM document in manifest or its import chain",
                self.path.display()
            ))
        })?;

        let repetitions = experiment.repetitions.ok_or_else(|| {
            SweepError::Parse(format!(
                "experiment '{}' has no repetitions after resolution",
                experiment.name
            ))
        })?;
        if repetitions == 0 {
            return Err(SweepError::Parse(format!(
                "experiment '{}': repetitions must be at least 1",
                experiment.name
            )));
        }

        check_linked_iterations(&experiment)?;
        check_expansion_keys(&experiment)?;

        if let Some(reps_per_job) = experiment.reps_per_job {
            if reps_per_job > repetitions {
                warn!(
                    experiment = %experiment.name,
                    reps_per_job,
                    repetitions,
                    "reps_per_job exceeds repetitions"
                );
            }
            if let Some(reps_in_parallel) = experiment.reps_in_parallel {
                if reps_in_parallel > reps_per_job {
                    warn!(
                        experiment = %experiment.name,
                        reps_in_parallel,
                        reps_per_job,
                        "reps_in_parallel exceeds reps_per_job"
                    );
                }
            }
        }

        Ok(ResolvedExperiment {
            job,
            experiment,
            import_chain: visited,
        })
    }
}

fn resolve_descriptor(
    path: &Path,
    job: Option<JobDescriptor>,
    experiment: ExperimentDescriptor,
    visited: &mut Vec<PathBuf>,
) -> Result<(Option<JobDescriptor>, ExperimentDescriptor)> {
    let (import_path, import_exp) = match (&experiment.import_path, &experiment.import_exp) {
        (Some(p), Some(e)) => (p.clone(), e.clone()),
        _ => return Ok((job, experiment)),
    };

    let base_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&import_path);
    let canonical = fs::canonicalize(&base_path).map_err(|_| {
        SweepError::Reference(format!("import_path not found: {}", base_path.display()))
    })?;
    if visited.contains(&canonical) {
        return Err(SweepError::Reference(format!(
            "cyclic import via {}",
            base_path.display()
        )));
    }
    visited.push(canonical.clone());
    debug!(
        from = %path.display(),
        base = %canonical.display(),
        section = %import_exp,
        "following import"
    );

    let docs = read_documents(&canonical)?;
    let base_mapping = docs
        .iter()
        .find(|doc| doc_name(doc) == Some(import_exp.as_str()))
        .cloned()
        .ok_or_else(|| {
            SweepError::Reference(format!(
                "experiment '{}' not found in {}",
                import_exp,
                base_path.display()
            ))
        })?;
    let base_job = docs
        .into_iter()
        .find(|doc| doc_name(doc) == Some(JOB_DOCUMENT_NAME))
        .map(parse_job)
        .transpose()?;
    let base_experiment = parse_experiment(base_mapping)?;

    // The base may import further; resolve it fully before merging over it.
    let (chain_job, base_resolved) =
        resolve_descriptor(&canonical, base_job, base_experiment, visited)?;
    let merged = merge_over_base(experiment, base_resolved, &import_exp)?;
    Ok((job.or(chain_job), merged))
}

fn merge_over_base(
    child: ExperimentDescriptor,
    base: ExperimentDescriptor,
    base_name: &str,
) -> Result<ExperimentDescriptor> {
    check_override_keys(&child.params, &base.params, base_name)?;

    let mut params = base.params;
    deep_merge(&mut params, &child.params);
    let mut grid = base.grid;
    deep_merge(&mut grid, &child.grid);
    let mut list = base.list;
    deep_merge(&mut list, &child.list);

    Ok(ExperimentDescriptor {
        name: child.name,
        import_path: None,
        import_exp: None,
        repetitions: child.repetitions.or(base.repetitions),
        reps_per_job: child.reps_per_job.or(base.reps_per_job),
        reps_in_parallel: child.reps_in_parallel.or(base.reps_in_parallel),
        iterations: child.iterations.or(base.iterations),
        num_checkpoints: child.num_checkpoints.or(base.num_checkpoints),
        params,
        grid,
        list,
    })
}

fn deep_merge(base: &mut Mapping, over: &Mapping) {
    for (key, value) in over {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(base_child)), Value::Mapping(over_child)) => {
                deep_merge(base_child, over_child);
                continue;
            }
            _ => {}
        }
        base.insert(key.clone(), value.clone());
    }
}

fn check_override_keys(over: &Mapping, base: &Mapping, base_name: &str) -> Result<()> {
    let mut leaves = Vec::new();
    collect_leaf_paths(over, &[], &mut leaves);
    for (path, _) in leaves {
        if lookup_path(base, &path).is_none() {
            return Err(SweepError::Schema(format!(
                "override key `{}` does not exist in base experiment '{}'",
                path.join("."),
                base_name
            )));
        }
    }
    Ok(())
}

fn check_expansion_keys(experiment: &ExperimentDescriptor) -> Result<()> {
    for (mapping, kind) in [(&experiment.grid, "grid"), (&experiment.list, "list")] {
        let mut leaves = Vec::new();
        collect_leaf_paths(mapping, &[], &mut leaves);
        for (path, _) in leaves {
            if lookup_path(&experiment.params, &path).is_none() {
                return Err(SweepError::Schema(format!(
                    "{} key `{}` does not exist in params of experiment '{}'",
                    kind,
                    path.join("."),
                    experiment.name
                )));
            }
        }
    }
    Ok(())
}

fn check_linked_iterations(experiment: &ExperimentDescriptor) -> Result<()> {
    let Some(iterations) = experiment.iterations else {
        return Ok(());
    };
    let mut leaves = Vec::new();
    collect_leaf_paths(&experiment.params, &[], &mut leaves);
    for (path, value) in leaves {
        if path.last().map(String::as_str) != Some(LINKED_ITERATIONS_LEAF) {
            continue;
        }
        if value.as_u64() != Some(iterations) {
            return Err(SweepError::Consistency(format!(
                "experiment '{}': params.{} = {} diverges from iterations = {}",
                experiment.name,
                path.join("."),
                scalar_string(&value),
                iterations
            )));
        }
    }
    Ok(())
}

fn collect_leaf_paths(mapping: &Mapping, prefix: &[String], out: &mut Vec<(Vec<String>, Value)>) {
    for (key, value) in mapping {
        let mut path = prefix.to_vec();
        path.push(scalar_string(key));
        match value {
            Value::Mapping(child) if !child.is_empty() => {
                collect_leaf_paths(child, &path, out);
            }
            _ => out.push((path, value.clone())),
        }
    }
}

fn lookup_path<'a>(mapping: &'a Mapping, path: &[String]) -> Option<&'a Value> {
    let (head, rest) = path.split_first()?;
    let value = mapping.get(head.as_str())?;
    if rest.is_empty() {
        Some(value)
    } else {
        value.as_mapping().and_then(|m| lookup_path(m, rest))
    }
}

fn set_path(mapping: &mut Mapping, path: &[String], value: Value) {
    if path.is_empty() {
        return;
    }
    let key = Value::String(path[0].clone());
    if path.len() == 1 {
        mapping.insert(key, value);
        return;
    }
    if !matches!(mapping.get(&key), Some(Value::Mapping(_))) {
        mapping.insert(key.clone(), Value::Mapping(Mapping::new()));
    }
    if let Some(Value::Mapping(child)) = mapping.get_mut(&key) {
        set_path(child, &path[1..], value);
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim()
            .to_string(),
    }
}

#[derive(Debug, Clone)]
struct Axis {
    path: Vec<String>,
    values: Vec<Value>,
}

/// Lazy, finite, restartable sweep expansion. `iter()` may be called any
/// number of times and always starts from the first run; nothing persists
/// across process restarts.
#[derive(Debug, Clone)]
pub struct RunExpansion {
    experiment: String,
    iterations: Option<u64>,
    num_checkpoints: Option<u64>,
    params: Mapping,
    grid_axes: Vec<Axis>,
    list_axes: Vec<Axis>,
    list_len: usize,
    repetitions: usize,
}

/// Validates the `grid` and `list` structure of an experiment and prepares
/// the flattened sequence: the cartesian product of all grid value lists
/// (first declared axis outermost), times the zipped list entries, times
/// `repetitions` seed indices (seeds innermost).
pub fn expand(experiment: &ExperimentDescriptor, repetitions: u64) -> Result<RunExpansion> {
    if repetitions == 0 {
        return Err(SweepError::Parse(format!(
            "experiment '{}': repetitions must be at least 1",
            experiment.name
        )));
    }
    let grid_axes = collect_axes(&experiment.grid, "grid")?;
    let list_axes = collect_axes(&experiment.list, "list")?;

    let list_len = match list_axes.first() {
        None => 1,
        Some(first) => {
            let len = first.values.len();
            for axis in &list_axes {
                if axis.values.len() != len {
                    return Err(SweepError::Parse(format!(
                        "list entry `{}` has {} values, expected {} (list entries zip in lockstep)",
                        axis.path.join("."),
                        axis.values.len(),
                        len
                    )));
                }
            }
            len
        }
    };

    for axis in grid_axes.iter().chain(list_axes.iter()) {
        if lookup_path(&experiment.params, &axis.path).is_none() {
            return Err(SweepError::Schema(format!(
                "expansion key `{}` does not exist in params of experiment '{}'",
                axis.path.join("."),
                experiment.name
            )));
        }
    }

    Ok(RunExpansion {
        experiment: experiment.name.clone(),
        iterations: experiment.iterations,
        num_checkpoints: experiment.num_checkpoints,
        params: experiment.params.clone(),
        grid_axes,
        list_axes,
        list_len,
        repetitions: repetitions as usize,
    })
}

fn collect_axes(mapping: &Mapping, kind: &str) -> Result<Vec<Axis>> {
    let mut leaves = Vec::new();
    collect_leaf_paths(mapping, &[], &mut leaves);
    let mut axes = Vec::new();
    for (path, value) in leaves {
        let values = match value {
            Value::Sequence(seq) => seq,
            _ => {
                return Err(SweepError::Parse(format!(
                    "{} entry `{}` must be a list of values",
                    kind,
                    path.join(".")
                )))
            }
        };
        if values.is_empty() {
            return Err(SweepError::Parse(format!(
                "{} entry `{}` has no values",
                kind,
                path.join(".")
            )));
        }
        axes.push(Axis { path, values });
    }
    Ok(axes)
}

impl RunExpansion {
    pub fn total_runs(&self) -> usize {
        let grid: usize = self.grid_axes.iter().map(|a| a.values.len()).product();
        grid * self.list_len * self.repetitions
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    pub fn grid_axes(&self) -> Vec<(String, usize)> {
        self.grid_axes
            .iter()
            .map(|a| (a.path.join("."), a.values.len()))
            .collect()
    }

    pub fn list_axes(&self) -> Vec<(String, usize)> {
        self.list_axes
            .iter()
            .map(|a| (a.path.join("."), a.values.len()))
            .collect()
    }

    pub fn iter(&self) -> RunIter<'_> {
        RunIter {
            expansion: self,
            index: 0,
            total: self.total_runs(),
        }
    }

    fn config_at(&self, index: usize) -> ResolvedRunConfig {
        let seed = (index % self.repetitions) as u64;
        let mut rest = index / self.repetitions;
        let list_index = rest % self.list_len;
        rest /= self.list_len;

        let mut grid_indices = vec![0usize; self.grid_axes.len()];
        for i in (0..self.grid_axes.len()).rev() {
            let len = self.grid_axes[i].values.len();
            grid_indices[i] = rest % len;
            rest /= len;
        }

        let mut params = self.params.clone();
        let mut assignment = Mapping::new();
        for (axis, chosen) in self.grid_axes.iter().zip(&grid_indices) {
            let value = axis.values[*chosen].clone();
            set_path(&mut params, &axis.path, value.clone());
            assignment.insert(Value::String(axis.path.join(".")), value);
        }
        for axis in &self.list_axes {
            let value = axis.values[list_index].clone();
            set_path(&mut params, &axis.path, value.clone());
            assignment.insert(Value::String(axis.path.join(".")), value);
        }

        ResolvedRunConfig {
            run_name: run_name(&self.experiment, &assignment),
            experiment: self.experiment.clone(),
            seed,
            iterations: self.iterations,
            num_checkpoints: self.num_checkpoints,
            params,
            assignment,
        }
    }
}

pub struct RunIter<'a> {
    expansion: &'a RunExpansion,
    index: usize,
    total: usize,
}

impl Iterator for RunIter<'_> {
    type Item = ResolvedRunConfig;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.total {
            return None;
        }
        let config = self.expansion.config_at(self.index);
        self.index += 1;
        Some(config)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RunIter<'_> {}

fn run_name(experiment: &str, assignment: &Mapping) -> String {
    if assignment.is_empty() {
        return experiment.to_string();
    }
    let mut parts = vec![experiment.to_string()];
    for (key, value) in assignment {
        let key = scalar_string(key);
        let leaf = key.rsplit('.').next().unwrap_or(&key).to_string();
        parts.push(format!("{}-{}", leaf, scalar_string(value)));
    }
    parts.join("__")
}

/// Sweep summary for human and JSON output.
#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub experiment: String,
    pub partition: String,
    pub job_name: Option<String>,
    pub time: Option<String>,
    pub repetitions: u64,
    pub reps_per_job: Option<u64>,
    pub reps_in_parallel: Option<u64>,
    pub iterations: Option<u64>,
    pub num_checkpoints: Option<u64>,
    pub param_count: usize,
    pub grid_axes: Vec<(String, usize)>,
    pub list_axes: Vec<(String, usize)>,
    pub total_runs: usize,
    pub import_chain: Vec<PathBuf>,
}

impl ResolvedExperiment {
    /// Expands with the experiment's own `repetitions`. `resolve` has
    /// already checked that the count is present and nonzero.
    pub fn expand(&self) -> Result<RunExpansion> {
        expand(&self.experiment, self.experiment.repetitions.unwrap_or(1))
    }

    pub fn summary(&self, expansion: &RunExpansion) -> SweepSummary {
        let mut leaves = Vec::new();
        collect_leaf_paths(&self.experiment.params, &[], &mut leaves);
        SweepSummary {
            experiment: self.experiment.name.clone(),
            partition: self.job.partition.clone(),
            job_name: self.job.job_name.clone(),
            time: self.job.time.as_ref().map(|t| t.to_string()),
            repetitions: self.experiment.repetitions.unwrap_or(1),
            reps_per_job: self.experiment.reps_per_job,
            reps_in_parallel: self.experiment.reps_in_parallel,
            iterations: self.experiment.iterations,
            num_checkpoints: self.experiment.num_checkpoints,
            param_count: leaves.len(),
            grid_axes: expansion.grid_axes(),
            list_axes: expansion.list_axes(),
            total_runs: expansion.total_runs(),
            import_chain: self.import_chain.clone(),
        }
    }

    /// Digest of the resolved experiment, stable across identical inputs.
    pub fn config_digest(&self) -> Result<String> {
        let value = serde_json::to_value(&self.experiment)
            .map_err(|e| SweepError::Parse(format!("experiment not serializable: {}", e)))?;
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| SweepError::Parse(format!("experiment not serializable: {}", e)))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Writes the flattened expansion as a `run_plan_v1` JSON artifact for the
/// external cluster launcher, via a temp file and rename.
pub fn write_run_plan(
    path: &Path,
    resolved: &ResolvedExperiment,
    expansion: &RunExpansion,
) -> Result<()> {
    let runs = expansion
        .iter()
        .map(|run| {
            serde_json::to_value(&run)
                .map_err(|e| SweepError::Parse(format!("run not serializable: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;
    let payload = json!({
        "schema_version": "run_plan_v1",
        "generated_at": Utc::now().to_rfc3339(),
        "experiment": resolved.experiment.name,
        "config_digest": resolved.config_digest()?,
        "total_runs": expansion.total_runs(),
        "runs": runs,
    });
    let bytes = serde_json::to_vec_pretty(&payload)
        .map_err(|e| SweepError::Parse(format!("run plan not serializable: {}", e)))?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml_mapping(text: &str) -> Mapping {
        serde_yaml::from_str(text).expect("valid yaml mapping")
    }

    fn experiment_from_yaml(text: &str) -> ExperimentDescriptor {
        parse_experiment(yaml_mapping(text)).expect("valid experiment")
    }

    #[test]
    fn time_budget_accepts_minutes_and_clock_strings() {
        let minutes: TimeBudget = serde_yaml::from_str("1440").expect("minutes");
        assert_eq!(minutes, TimeBudget::Minutes(1440));
        assert_eq!(minutes.minutes(), Some(1440));

        let clock: TimeBudget = serde_yaml::from_str("\"24:00:00\"").expect("clock");
        assert_eq!(clock, TimeBudget::Clock("24:00:00".to_string()));
        assert_eq!(clock.minutes(), Some(1440));

        let short: TimeBudget = serde_yaml::from_str("\"2:30\"").expect("clock");
        assert_eq!(short.minutes(), Some(150));

        let bad = TimeBudget::Clock("soon".to_string());
        assert_eq!(bad.minutes(), None);
    }

    #[test]
    fn split_merged_mapping_separates_job_and_experiment_keys() {
        let merged = yaml_mapping(
            r#"
name: "exp"
partition: "gpu"
cpus-per-task: 8
repetitions: 4
params:
  lr: 0.001
"#,
        );
        let (job, experiment) = split_merged_mapping(merged);
        let job = job.expect("job half");
        assert_eq!(doc_name(&job), Some(JOB_DOCUMENT_NAME));
        assert!(job.get("partition").is_some());
        assert!(job.get("cpus-per-task").is_some());
        assert_eq!(doc_name(&experiment), Some("exp"));
        assert!(experiment.get("repetitions").is_some());
        assert!(experiment.get("partition").is_none());
    }

    #[test]
    fn split_merged_mapping_without_job_keys_yields_no_job() {
        let merged = yaml_mapping("name: \"exp\"\nrepetitions: 2\n");
        let (job, _experiment) = split_merged_mapping(merged);
        assert!(job.is_none());
    }

    #[test]
    fn deep_merge_overrides_scalars_and_merges_nested_mappings() {
        let mut base = yaml_mapping(
            r#"
algorithm:
  lr: 0.001
  batch_size: 64
env:
  id: "reach-v2"
"#,
        );
        let over = yaml_mapping(
            r#"
algorithm:
  lr: 0.0003
"#,
        );
        deep_merge(&mut base, &over);
        assert_eq!(
            lookup_path(&base, &["algorithm".into(), "lr".into()]).and_then(Value::as_f64),
            Some(0.0003)
        );
        assert_eq!(
            lookup_path(&base, &["algorithm".into(), "batch_size".into()]).and_then(Value::as_u64),
            Some(64)
        );
        assert_eq!(
            lookup_path(&base, &["env".into(), "id".into()]).and_then(Value::as_str),
            Some("reach-v2")
        );
    }

    #[test]
    fn deep_merge_replaces_lists_wholesale() {
        let mut base = yaml_mapping("layers: [64, 64]\n");
        let over = yaml_mapping("layers: [256]\n");
        deep_merge(&mut base, &over);
        let layers = base.get("layers").and_then(Value::as_sequence).expect("seq");
        assert_eq!(layers.len(), 1);
    }

    #[test]
    fn check_override_keys_rejects_unknown_leaf() {
        let base = yaml_mapping("algorithm:\n  lr: 0.001\n");
        let over = yaml_mapping("algorithm:\n  lrr: 0.001\n");
        let err = check_override_keys(&over, &base, "base").expect_err("unknown key");
        assert!(matches!(err, SweepError::Schema(_)), "got {}", err);
        assert!(err.to_string().contains("algorithm.lrr"));
    }

    #[test]
    fn linked_iterations_must_agree_with_params_leaf() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
iterations: 2000
params:
  projection:
    args:
      total_train_steps: 1000
"#,
        );
        let err = check_linked_iterations(&experiment).expect_err("diverging");
        assert!(matches!(err, SweepError::Consistency(_)), "got {}", err);

        let consistent = experiment_from_yaml(
            r#"
name: "exp"
iterations: 2000
params:
  projection:
    args:
      total_train_steps: 2000
"#,
        );
        check_linked_iterations(&consistent).expect("matching values");
    }

    #[test]
    fn expand_without_axes_yields_one_config_per_seed() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
params:
  lr: 0.001
"#,
        );
        let expansion = expand(&experiment, 8).expect("expansion");
        assert_eq!(expansion.total_runs(), 8);
        let configs: Vec<ResolvedRunConfig> = expansion.iter().collect();
        assert_eq!(configs.len(), 8);
        for (i, config) in configs.iter().enumerate() {
            assert_eq!(config.seed, i as u64);
            assert_eq!(config.run_name, "exp");
            assert_eq!(config.params, configs[0].params);
        }
    }

    #[test]
    fn expand_orders_grid_axes_outer_to_inner() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
params:
  a: 0
  b: "x"
grid:
  a: [1, 2]
  b: ["x", "y"]
"#,
        );
        let expansion = expand(&experiment, 1).expect("expansion");
        let points: Vec<(u64, String)> = expansion
            .iter()
            .map(|c| {
                (
                    c.params.get("a").and_then(Value::as_u64).expect("a"),
                    c.params
                        .get("b")
                        .and_then(Value::as_str)
                        .expect("b")
                        .to_string(),
                )
            })
            .collect();
        assert_eq!(
            points,
            vec![
                (1, "x".to_string()),
                (1, "y".to_string()),
                (2, "x".to_string()),
                (2, "y".to_string()),
            ]
        );
    }

    #[test]
    fn expand_puts_seeds_innermost() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
params:
  a: 0
grid:
  a: [1, 2]
"#,
        );
        let expansion = expand(&experiment, 2).expect("expansion");
        let seeds: Vec<u64> = expansion.iter().map(|c| c.seed).collect();
        assert_eq!(seeds, vec![0, 1, 0, 1]);
    }

    #[test]
    fn expand_is_restartable() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
params:
  a: 0
grid:
  a: [1, 2, 3]
"#,
        );
        let expansion = expand(&experiment, 2).expect("expansion");
        let first: Vec<ResolvedRunConfig> = expansion.iter().collect();
        let second: Vec<ResolvedRunConfig> = expansion.iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn expand_zips_list_entries_in_lockstep() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
params:
  env: "a"
  steps: 0
list:
  env: ["a", "b"]
  steps: [100, 200]
"#,
        );
        let expansion = expand(&experiment, 1).expect("expansion");
        assert_eq!(expansion.total_runs(), 2);
        let pairs: Vec<(String, u64)> = expansion
            .iter()
            .map(|c| {
                (
                    c.params
                        .get("env")
                        .and_then(Value::as_str)
                        .expect("env")
                        .to_string(),
                    c.params.get("steps").and_then(Value::as_u64).expect("steps"),
                )
            })
            .collect();
        assert_eq!(pairs, vec![("a".to_string(), 100), ("b".to_string(), 200)]);
    }

    #[test]
    fn expand_rejects_unequal_list_lengths() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
params:
  env: "a"
  steps: 0
list:
  env: ["a", "b"]
  steps: [100]
"#,
        );
        let err = expand(&experiment, 1).expect_err("length mismatch");
        assert!(matches!(err, SweepError::Parse(_)), "got {}", err);
    }

    #[test]
    fn expand_rejects_non_list_grid_leaf() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
params:
  lr: 0.001
grid:
  lr: 0.01
"#,
        );
        let err = expand(&experiment, 1).expect_err("scalar grid leaf");
        assert!(matches!(err, SweepError::Parse(_)), "got {}", err);
    }

    #[test]
    fn expand_rejects_grid_key_missing_from_params() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
params:
  lr: 0.001
grid:
  momentum: [0.9, 0.99]
"#,
        );
        let err = expand(&experiment, 1).expect_err("unknown grid key");
        assert!(matches!(err, SweepError::Schema(_)), "got {}", err);
    }

    #[test]
    fn run_names_encode_the_expansion_point() {
        let experiment = experiment_from_yaml(
            r#"
name: "ppo"
params:
  algorithm:
    lr: 0.001
grid:
  algorithm:
    lr: [0.001, 0.01]
"#,
        );
        let expansion = expand(&experiment, 1).expect("expansion");
        let names: Vec<String> = expansion.iter().map(|c| c.run_name).collect();
        assert_eq!(names, vec!["ppo__lr-0.001", "ppo__lr-0.01"]);
    }

    #[test]
    fn resolved_run_config_round_trips_through_yaml() {
        let experiment = experiment_from_yaml(
            r#"
name: "exp"
iterations: 100
params:
  algorithm:
    lr: 0.001
grid:
  algorithm:
    lr: [0.001, 0.01]
"#,
        );
        let expansion = expand(&experiment, 2).expect("expansion");
        for config in expansion.iter() {
            let value = serde_yaml::to_value(&config).expect("serialize");
            let back: ResolvedRunConfig = serde_yaml::from_value(value).expect("reparse");
            assert_eq!(back, config);
        }
    }
}
