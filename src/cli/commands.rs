//! CLI command definitions for prover-eval.
//!
//! `run` evaluates one shard, `merge` combines finished shards, `summarize`
//! reports on a single shard directory, `report` writes readable outputs,
//! `inspect` browses results problem by problem and `check` validates the
//! setup.

use crate::config::EvalConfig;
use crate::error::EvalError;
use crate::eval::store::METRICS_DIR;
use crate::eval::{
    read_json, write_json_atomic, PartitionKind, ProblemResult, ResultStore, ShardOrchestrator,
    ShardResult,
};
use crate::extract::LeanBlockExtractor;
use crate::metrics::{
    load_shards, merge, summarize, write_report, write_run_outputs, MergedResult, MetricsSummary,
    RunReport,
};
use crate::model::{ModelClient, OpenAiCompatClient, DEFAULT_MODEL};
use crate::problem::{ProblemSet, PromptMode};
use crate::sandbox::{ProcessRegistry, ProcessSandbox};
use crate::verifier::{OutcomeKind, Verifier, VerifierCommand};
use clap::Parser;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Machine-generated proof evaluator.
#[derive(Parser)]
#[command(name = "prover-eval")]
#[command(about = "Evaluate model-generated Lean proofs with sharded, sandboxed verification")]
#[command(version)]
#[command(
    long_about = "prover-eval samples proofs from a language model, verifies each one with the Lean toolchain in an isolated process group, and reports Pass@k.\n\nExample usage:\n  SHARD_COUNT=4 SHARD_ID=0 prover-eval run --problems-dir ./minif2f --output ./results\n  prover-eval merge ./results/noncot --problems-dir ./minif2f"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Evaluate this shard's share of the problem set.
    Run(Box<RunArgs>),

    /// Merge finished shards and compute run-wide metrics.
    ///
    /// Shard directories are only read. The merged result set and report are
    /// written under `<root>/merged/`.
    Merge(MergeArgs),

    /// Print metrics for a single shard directory.
    Summarize(SummarizeArgs),

    /// Write summary.csv, OVERVIEW.md and per-problem success/failure files.
    Report(ReportArgs),

    /// List problems or show one problem's attempts.
    Inspect(InspectArgs),

    /// Check the verifier project, verifier binary and problem set.
    Check(Box<CheckArgs>),
}

/// Options shared by every command that builds an [`EvalConfig`].
///
/// Unset options keep the value from `--config` or the built-in default.
#[derive(Parser, Debug, Default)]
pub struct ConfigArgs {
    /// YAML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Prompt mode (noncot, cot).
    #[arg(long)]
    pub mode: Option<PromptMode>,

    /// Attempts per problem.
    #[arg(short = 'n', long, env = "NUM_SAMPLES")]
    pub num_samples: Option<u32>,

    /// Pass@k values, comma separated.
    #[arg(short = 'k', long, value_delimiter = ',')]
    pub k: Option<Vec<u32>>,

    /// Stop sampling a problem after its first success.
    #[arg(long, env = "EARLY_STOP_ON_SUCCESS")]
    pub early_stop_on_success: Option<bool>,

    /// Total number of shards.
    #[arg(long, env = "SHARD_COUNT")]
    pub shard_count: Option<usize>,

    /// This shard's id, in [0, shard_count).
    #[arg(long, env = "SHARD_ID")]
    pub shard_id: Option<usize>,

    /// Partition strategy (modulo, cost_balanced).
    #[arg(long)]
    pub partition: Option<PartitionKind>,

    /// Output root.
    #[arg(short = 'o', long, env = "EVAL_OUTPUT_DIR")]
    pub output: Option<PathBuf>,

    /// Directory of .lean problem files.
    #[arg(long, env = "PROBLEMS_DIR")]
    pub problems_dir: Option<PathBuf>,

    /// JSON object mapping problem id to expected seconds per attempt.
    #[arg(long)]
    pub costs: Option<PathBuf>,

    /// Re-run problems even if finished artifacts exist.
    #[arg(long)]
    pub no_resume: bool,

    /// Lean project the verifier runs in.
    #[arg(long, env = "VERIFIER_PROJECT_ROOT")]
    pub verifier_project_root: Option<PathBuf>,

    /// Verifier command line; `{input}` is replaced with the staged file.
    #[arg(long)]
    pub verifier_command: Option<String>,

    /// Allow a project root without a lakefile or lean-toolchain.
    #[arg(long)]
    pub no_require_manifest: bool,

    /// Verification timeout in seconds.
    #[arg(long, env = "VERIFICATION_TIMEOUT")]
    pub verification_timeout: Option<u64>,

    /// Model generation timeout in seconds.
    #[arg(long, env = "MODEL_GENERATION_TIMEOUT")]
    pub generation_timeout: Option<u64>,

    /// Seconds between SIGTERM and SIGKILL when tearing down a verifier.
    #[arg(long)]
    pub grace_period: Option<u64>,
}

impl ConfigArgs {
    /// Defaults, then the YAML file, then flags and environment.
    pub fn resolve(&self) -> anyhow::Result<EvalConfig> {
        let mut config = match &self.config {
            Some(path) => EvalConfig::from_yaml_file(path)?,
            None => EvalConfig::default(),
        };

        if let Some(mode) = self.mode {
            config = config.with_mode(mode);
        }
        if let Some(n) = self.num_samples {
            config = config.with_num_samples(n);
        }
        if let Some(k) = &self.k {
            config = config.with_k_values(k.clone());
        }
        if let Some(early) = self.early_stop_on_success {
            config = config.with_early_stop(early);
        }
        if let Some(count) = self.shard_count {
            config.shard_count = count;
        }
        if let Some(id) = self.shard_id {
            config.shard_id = id;
        }
        if let Some(partition) = self.partition {
            config = config.with_partition(partition);
        }
        if let Some(output) = &self.output {
            config = config.with_output_dir(output.clone());
        }
        if let Some(dir) = &self.problems_dir {
            config = config.with_problems_dir(dir.clone());
        }
        if let Some(costs) = &self.costs {
            config.costs_file = Some(costs.clone());
        }
        if self.no_resume {
            config = config.with_resume(false);
        }
        if let Some(root) = &self.verifier_project_root {
            config = config.with_verifier_project_root(root.clone());
        }
        if let Some(line) = &self.verifier_command {
            let command = VerifierCommand::parse(line)
                .ok_or_else(|| EvalError::InvalidConfig("verifier command is empty".into()))?;
            config = config.with_verifier_command(command);
        }
        if self.no_require_manifest {
            config = config.with_require_manifest(false);
        }
        if let Some(secs) = self.verification_timeout {
            config = config.with_verification_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.generation_timeout {
            config = config.with_generation_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.grace_period {
            config = config.with_grace_period(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }
}

/// Model endpoint options.
#[derive(Parser, Debug, Default)]
pub struct ModelArgs {
    /// OpenAI-compatible API base URL.
    #[arg(long, env = "MODEL_API_BASE")]
    pub api_base: Option<String>,

    /// API key for the model endpoint.
    #[arg(long, env = "MODEL_API_KEY")]
    pub api_key: Option<String>,

    /// Model name sent with each request.
    #[arg(short = 'm', long, env = "MODEL_NAME")]
    pub model: Option<String>,
}

/// Arguments for `prover-eval run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Print the shard summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `prover-eval merge`.
#[derive(Parser, Debug)]
pub struct MergeArgs {
    /// Directory holding the `shard_<id>` directories of one mode.
    pub root: PathBuf,

    /// Problem set the shards were cut from; enables exact coverage checks.
    #[arg(long, env = "PROBLEMS_DIR")]
    pub problems_dir: Option<PathBuf>,

    /// Pass@k values, comma separated.
    #[arg(short = 'k', long, value_delimiter = ',', default_value = "1,8,32")]
    pub k: Vec<u32>,

    /// Print the summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `prover-eval summarize`.
#[derive(Parser, Debug)]
pub struct SummarizeArgs {
    /// A `shard_<id>` directory.
    pub shard_dir: PathBuf,

    /// Pass@k values, comma separated.
    #[arg(short = 'k', long, value_delimiter = ',', default_value = "1,8,32")]
    pub k: Vec<u32>,

    /// Print the summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `prover-eval report`.
#[derive(Parser, Debug)]
pub struct ReportArgs {
    /// `merged.json`, `shard.json`, a shard directory, or a mode directory
    /// holding `merged/merged.json`.
    pub source: PathBuf,

    /// Output directory.
    #[arg(short = 'o', long)]
    pub out: PathBuf,

    /// Pass@k values, comma separated.
    #[arg(short = 'k', long, value_delimiter = ',', default_value = "1,8,32")]
    pub k: Vec<u32>,
}

/// Arguments for `prover-eval inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Same sources as `report`.
    pub source: PathBuf,

    /// Show every attempt of this problem.
    #[arg(short = 'p', long)]
    pub problem: Option<String>,

    /// Only problems that passed.
    #[arg(long, conflicts_with = "failed")]
    pub passed: bool,

    /// Only problems that did not pass.
    #[arg(long)]
    pub failed: bool,

    /// Only problems with a timed-out attempt.
    #[arg(long)]
    pub timeouts: bool,

    /// Maximum problems listed.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Print full details and verified units instead of excerpts.
    #[arg(long)]
    pub full: bool,
}

/// Arguments for `prover-eval check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub model: ModelArgs,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_shard_command(*args).await,
        Commands::Merge(args) => run_merge_command(args),
        Commands::Summarize(args) => run_summarize_command(args),
        Commands::Report(args) => run_report_command(args),
        Commands::Inspect(args) => run_inspect_command(args),
        Commands::Check(args) => run_check_command(*args).await,
    }
}

// ============================================================================
// Run
// ============================================================================

async fn run_shard_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.config.resolve()?;
    let problems = load_problems(&config)?;
    let model = build_model(&args.model)?;

    let registry = ProcessRegistry::new();
    let signals = spawn_signal_listener(registry.clone());

    let k_values = config.k_values.clone();
    let orchestrator = ShardOrchestrator::new(
        config,
        model,
        Arc::new(LeanBlockExtractor::new()),
        registry.clone(),
    )?;
    let outcome = orchestrator.run_shard(&problems).await;
    signals.abort();

    match outcome {
        Ok(shard) => {
            let summary = summarize(&shard.results, &k_values, shard.num_samples);
            print_summary(&summary, args.json)?;
            Ok(())
        }
        Err(EvalError::Cancelled) => {
            let killed = registry.terminate_all();
            warn!(killed, "Shard cancelled; finished problems remain on disk");
            Err(EvalError::Cancelled.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Cancels `registry` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(registry: ProcessRegistry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("Shutdown signal received, cancelling shard");
        registry.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn load_problems(config: &EvalConfig) -> anyhow::Result<ProblemSet> {
    let problems = ProblemSet::load_dir(&config.problems_dir)?;
    match &config.costs_file {
        Some(path) => {
            let costs: HashMap<String, f64> = read_json(path)?;
            info!(path = %path.display(), entries = costs.len(), "Loaded cost hints");
            Ok(problems.with_costs(&costs))
        }
        None => Ok(problems),
    }
}

fn build_model(args: &ModelArgs) -> anyhow::Result<Arc<dyn ModelClient>> {
    let api_base = args.api_base.clone().ok_or_else(|| {
        anyhow::anyhow!("Missing model endpoint. Provide --api-base or set MODEL_API_BASE.")
    })?;
    let model = args.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
    info!(api_base = %api_base, model = %model, "Using OpenAI-compatible model endpoint");
    Ok(Arc::new(OpenAiCompatClient::new(api_base, args.api_key.clone(), model)?))
}

// ============================================================================
// Merge / summarize
// ============================================================================

fn run_merge_command(args: MergeArgs) -> anyhow::Result<()> {
    let shards = load_shards(&args.root)?;
    info!(root = %args.root.display(), shards = shards.len(), "Loaded shard results");

    let expected = args
        .problems_dir
        .as_deref()
        .map(ProblemSet::load_dir)
        .transpose()?;
    if expected.is_none() {
        warn!("No --problems-dir given; coverage is checked against the shards' own records only");
    }
    let merged = merge(shards, expected.as_ref())?;

    let out_dir = args.root.join("merged");
    write_json_atomic(&out_dir.join("merged.json"), &merged)?;

    let summary = summarize(&merged.results, &args.k, merged.num_samples);
    let report = RunReport::merged(merged.mode, merged.shards.clone(), summary);
    let path = write_report(&out_dir.join(METRICS_DIR), &report)?;
    info!(
        problems = merged.results.len(),
        shards = merged.shards.len(),
        report = %path.display(),
        "Merge complete"
    );
    print_summary(&report.summary, args.json)
}

fn run_summarize_command(args: SummarizeArgs) -> anyhow::Result<()> {
    let loaded = shard_results(&args.shard_dir)?;
    let summary = summarize(&loaded.results, &args.k, loaded.num_samples);
    print_summary(&summary, args.json)
}

/// A result set read back from disk.
struct LoadedResults {
    mode: PromptMode,
    num_samples: u32,
    results: Vec<ProblemResult>,
}

impl From<MergedResult> for LoadedResults {
    fn from(merged: MergedResult) -> Self {
        Self {
            mode: merged.mode,
            num_samples: merged.num_samples,
            results: merged.results,
        }
    }
}

impl From<ShardResult> for LoadedResults {
    fn from(shard: ShardResult) -> Self {
        Self {
            mode: shard.mode,
            num_samples: shard.num_samples,
            results: shard.results,
        }
    }
}

/// Results of one shard: `shard.json` when the shard finished, otherwise
/// whatever problems are done so far.
fn shard_results(dir: &Path) -> anyhow::Result<LoadedResults> {
    let store = ResultStore::new(dir);
    if store.shard_file().exists() {
        return Ok(store.load_shard()?.into());
    }

    let results = store.completed_results()?;
    let Some(first) = results.first() else {
        anyhow::bail!("No results found under {}", dir.display());
    };
    warn!(
        dir = %dir.display(),
        finished = results.len(),
        "Shard has not completed; using finished problems only"
    );
    Ok(LoadedResults {
        mode: first.mode,
        num_samples: results.iter().map(|r| r.num_samples).max().unwrap_or(1),
        results,
    })
}

/// Reads a merged result file, a shard file, a shard directory, or the
/// merged output under a mode directory.
fn load_results(source: &Path) -> anyhow::Result<LoadedResults> {
    if source.is_file() {
        let value: serde_json::Value = read_json(source)?;
        let loaded = if value.get("run_id").is_some() {
            serde_json::from_value::<ShardResult>(value)?.into()
        } else {
            serde_json::from_value::<MergedResult>(value)?.into()
        };
        return Ok(loaded);
    }
    let merged = source.join("merged").join("merged.json");
    if merged.is_file() {
        info!(path = %merged.display(), "Reading merged results");
        return Ok(read_json::<MergedResult>(&merged)?.into());
    }
    shard_results(source)
}

// ============================================================================
// Report / inspect
// ============================================================================

fn run_report_command(args: ReportArgs) -> anyhow::Result<()> {
    let loaded = load_results(&args.source)?;
    let summary = summarize(&loaded.results, &args.k, loaded.num_samples);
    let outputs = write_run_outputs(&args.out, loaded.mode, &loaded.results, &summary)?;
    println!("Summary:   {}", outputs.summary_csv.display());
    println!("Overview:  {}", outputs.overview.display());
    println!(
        "Problems:  {} solved in {}/, {} unsolved in {}/",
        outputs.successes,
        crate::metrics::export::SUCCESSES_DIR,
        outputs.failures,
        crate::metrics::export::FAILURES_DIR
    );
    Ok(())
}

/// Characters of a detail shown when not in `--full` mode.
const DETAIL_EXCERPT: usize = 300;

fn run_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let loaded = load_results(&args.source)?;

    if let Some(id) = &args.problem {
        let result = loaded
            .results
            .iter()
            .find(|r| &r.problem_id == id)
            .ok_or_else(|| anyhow::anyhow!("Problem '{}' not found in {}", id, args.source.display()))?;
        print!("{}", problem_details(result, args.full));
        return Ok(());
    }

    let selected: Vec<&ProblemResult> = loaded
        .results
        .iter()
        .filter(|r| !args.passed || r.passed)
        .filter(|r| !args.failed || !r.passed)
        .filter(|r| !args.timeouts || r.has_timeout())
        .collect();
    let shown = args.limit.unwrap_or(selected.len()).min(selected.len());

    println!(
        "{:<40} {:<7} {:>6} {:>9} {:>9} {:>10}",
        "PROBLEM", "PASSED", "FIRST", "ATTEMPTS", "TIMEOUTS", "MEAN (s)"
    );
    for result in &selected[..shown] {
        let mean = if result.attempts.is_empty() {
            0.0
        } else {
            result.total_time_secs / result.attempts.len() as f64
        };
        println!(
            "{:<40} {:<7} {:>6} {:>9} {:>9} {:>10.2}",
            result.problem_id,
            if result.passed { "yes" } else { "no" },
            result
                .first_success_index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "-".to_string()),
            format!("{}/{}", result.num_attempts, result.num_samples),
            result
                .attempts
                .iter()
                .filter(|a| a.outcome == OutcomeKind::Timeout)
                .count(),
            mean
        );
    }
    if shown < selected.len() {
        println!("... and {} more", selected.len() - shown);
    }
    println!("{} of {} problems listed ({} mode)", shown, loaded.results.len(), loaded.mode);
    Ok(())
}

/// Attempt-by-attempt view of one problem.
fn problem_details(result: &ProblemResult, full: bool) -> String {
    let excerpt = |text: &str| -> String {
        if full || text.chars().count() <= DETAIL_EXCERPT {
            text.to_string()
        } else {
            let cut: String = text.chars().take(DETAIL_EXCERPT).collect();
            format!("{}...", cut)
        }
    };

    let mut out = format!(
        "Problem {}: {}\n",
        result.problem_id,
        match result.first_success_index {
            Some(i) => format!("passed (first success at attempt {})", i),
            None => "not passed".to_string(),
        }
    );
    out.push_str(&format!(
        "Attempts: {}/{}{}\n",
        result.num_attempts,
        result.num_samples,
        if result.early_stopped { " (early stopped)" } else { "" }
    ));
    for attempt in &result.attempts {
        out.push_str(&format!(
            "\n#{} {}  generation {:.2}s  verification {:.2}s\n",
            attempt.attempt_index,
            attempt.outcome,
            attempt.generation_time_secs,
            attempt.verification_time_secs
        ));
        if let Some(detail) = &attempt.error_detail {
            out.push_str(&format!("  {}\n", excerpt(detail).replace('\n', "\n  ")));
        }
        if full {
            if let Some(unit) = &attempt.extracted_unit {
                out.push_str(&format!("  ---\n  {}\n", unit.replace('\n', "\n  ")));
            }
        }
    }
    out
}

fn print_summary(summary: &MetricsSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

// ============================================================================
// Check
// ============================================================================

async fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let config = args.config.resolve()?;
    let verifier = Verifier::new(
        ProcessSandbox::new(config.sandbox_config(), ProcessRegistry::new()),
        config.verifier_config(),
    );

    verifier.check_project()?;
    println!("Verifier project: {}", config.verifier_project_root.display());

    let version = verifier.probe_program().await?;
    println!(
        "Verifier binary:  {} ({})",
        config.verifier_command.program,
        if version.is_empty() { "no version output" } else { &version }
    );

    let problems = load_problems(&config)?;
    let assigned = crate::eval::select(
        problems.problems(),
        config.partition.strategy().as_ref(),
        config.shard_count,
        config.shard_id,
    );
    println!(
        "Problems:         {} in {} ({} assigned to shard {}/{})",
        problems.len(),
        config.problems_dir.display(),
        assigned.len(),
        config.shard_id,
        config.shard_count
    );

    match &args.model.api_base {
        Some(base) => println!("Model endpoint:   {}", base),
        None => println!("Model endpoint:   not configured (set MODEL_API_BASE)"),
    }
    Ok(())
}
