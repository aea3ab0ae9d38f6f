use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use sweep_config::{expand, Manifest, SweepError, SweepSummary};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sweep", version = "0.2.0", about = "Experiment sweep manifest tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (sets log level to DEBUG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, resolve and summarize a manifest
    Describe {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Load, resolve and expand a manifest, reporting the first error
    Validate {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Flatten a manifest into its concrete run list
    Expand {
        manifest: PathBuf,
        /// Override the manifest's repetition count
        #[arg(long)]
        repetitions: Option<u64>,
        /// Write the run plan JSON artifact to this path
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write a commented starter manifest
    Init {
        #[arg(long, default_value = "sweep.yml")]
        out: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG in the environment takes precedence; --verbose falls back to DEBUG.
    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();

    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { manifest, json } => {
            let loaded = Manifest::load(&manifest)?;
            let resolved = loaded.resolve()?;
            let expansion = resolved.expand()?;
            let summary = resolved.summary(&expansion);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Validate { manifest, json } => {
            let loaded = Manifest::load(&manifest)?;
            let resolved = loaded.resolve()?;
            let expansion = resolved.expand()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "experiment": resolved.experiment.name,
                    "total_runs": expansion.total_runs(),
                    "config_digest": resolved.config_digest()?,
                })));
            }
            println!("ok");
            println!("experiment: {}", resolved.experiment.name);
            println!("total_runs: {}", expansion.total_runs());
        }
        Commands::Expand {
            manifest,
            repetitions,
            out,
            json,
        } => {
            let loaded = Manifest::load(&manifest)?;
            let resolved = loaded.resolve()?;
            let expansion = match repetitions {
                Some(reps) => expand(&resolved.experiment, reps)?,
                None => resolved.expand()?,
            };
            if let Some(out) = &out {
                sweep_config::write_run_plan(out, &resolved, &expansion)?;
            }
            if json {
                let runs = expansion
                    .iter()
                    .map(|run| serde_json::to_value(&run))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                return Ok(Some(json!({
                    "ok": true,
                    "command": "expand",
                    "experiment": resolved.experiment.name,
                    "total_runs": expansion.total_runs(),
                    "plan_path": out.as_ref().map(|p| p.display().to_string()),
                    "runs": runs,
                })));
            }
            println!("experiment: {}", resolved.experiment.name);
            println!("total_runs: {}", expansion.total_runs());
            for run in expansion.iter() {
                println!("{} seed={}", run.run_name, run.seed);
            }
            if let Some(out) = &out {
                println!("plan: {}", out.display());
            }
        }
        Commands::Init { out, force } => {
            if out.exists() && !force {
                return Err(anyhow::anyhow!(
                    "{} already exists (use --force to overwrite)",
                    out.display()
                ));
            }
            if let Some(parent) = out.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&out, STARTER_MANIFEST)?;
            println!("wrote {}", out.display());
        }
    }
    Ok(None)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Validate { json, .. }
        | Commands::Expand { json, .. } => *json,
        _ => false,
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<SweepError>() {
        Some(sweep) => sweep.code(),
        None => "command_failed",
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn summary_to_json(summary: &SweepSummary) -> Value {
    json!({
        "experiment": summary.experiment,
        "partition": summary.partition,
        "job_name": summary.job_name,
        "time": summary.time,
        "repetitions": summary.repetitions,
        "reps_per_job": summary.reps_per_job,
        "reps_in_parallel": summary.reps_in_parallel,
        "iterations": summary.iterations,
        "num_checkpoints": summary.num_checkpoints,
        "param_count": summary.param_count,
        "grid_axes": summary
            .grid_axes
            .iter()
            .map(|(path, len)| json!({"path": path, "values": len}))
            .collect::<Vec<_>>(),
        "list_axes": summary
            .list_axes
            .iter()
            .map(|(path, len)| json!({"path": path, "values": len}))
            .collect::<Vec<_>>(),
        "total_runs": summary.total_runs,
        "import_chain": summary
            .import_chain
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
    })
}

fn print_summary(summary: &SweepSummary) {
    println!("experiment: {}", summary.experiment);
    println!("partition: {}", summary.partition);
    if let Some(job_name) = &summary.job_name {
        println!("job-name: {}", job_name);
    }
    if let Some(time) = &summary.time {
        println!("time: {}", time);
    }
    println!("repetitions: {}", summary.repetitions);
    if let Some(reps_per_job) = summary.reps_per_job {
        println!("reps_per_job: {}", reps_per_job);
    }
    if let Some(reps_in_parallel) = summary.reps_in_parallel {
        println!("reps_in_parallel: {}", reps_in_parallel);
    }
    if let Some(iterations) = summary.iterations {
        println!("iterations: {}", iterations);
    }
    if let Some(num_checkpoints) = summary.num_checkpoints {
        println!("num_checkpoints: {}", num_checkpoints);
    }
    println!("params: {} leaves", summary.param_count);
    for (path, len) in &summary.grid_axes {
        println!("grid: {} ({} values)", path, len);
    }
    for (path, len) in &summary.list_axes {
        println!("list: {} ({} values)", path, len);
    }
    println!("total_runs: {}", summary.total_runs);
    for path in &summary.import_chain {
        println!("import: {}", path.display());
    }
}

const STARTER_MANIFEST: &str = r#"---
# Cluster/job settings, consumed by the external cluster launcher.
name: "SLURM"              # REQUIRED: marks this document as the job descriptor
partition: "accelerated"   # REQUIRED
job-name: "my_sweep"
num_parallel_jobs: 50
ntasks: 1
cpus-per-task: 8
time: 1440                 # minutes, or a clock string like "24:00:00"
gpus_per_rep: 0.25
scheduler: "horeka"
sbatch_args:
  gres: "gpu:1"
  account: "my_account"
experiment_copy_src:
  - "./src"
experiment_copy_auto_dst: "/tmp/experiments"

---
# Experiment sweep settings.
name: "my_experiment"      # REQUIRED
# import_path: "../shared/base.yml"
# import_exp: "base"
repetitions: 8
reps_per_job: 8
reps_in_parallel: 1
iterations: &iterations 2000
num_checkpoints: 10
params:
  algorithm:
    lr: 0.001
    batch_size: 64
  projection:
    args:
      total_train_steps: *iterations   # shared with iterations via anchor
# grid:
#   algorithm:
#     lr: [0.0003, 0.001, 0.003]
"#;
