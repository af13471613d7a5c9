mod config;
mod dispatch;
mod job;
mod nodes;
mod pairing;

use clap::Parser;
use config::{ConfigErrors, RunParameters, RunnerConfig};
use dispatch::{
    CommandSubmitter, DispatchError, Dispatcher, DryRunSubmitter, FailurePolicy, Submitter,
};
use job::JobDescription;
use nodes::{load_nodes, InputError};
use pairing::pair_nodes;
use rand::{rngs::StdRng, SeedableRng};
use std::{path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Pair up compute nodes and submit one point-to-point benchmark job per pair
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// file with one node name per line
    nodelist: PathBuf,
    /// benchmark module to load, e.g. `omb/7.3`
    module: String,
    /// command used to launch the benchmark, e.g. `srun --mpi=pmix`
    launch_command: String,
    /// optional YAML configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// directory for job scripts and logs
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// benchmark subcommand, e.g. `osu_latency`
    #[arg(long)]
    benchmark: Option<String>,
    /// fix the seed used for pairing
    #[arg(long)]
    seed: Option<u64>,
    /// command that receives each job script, e.g. `sbatch`
    #[arg(long)]
    submit_command: Option<String>,
    /// write job scripts without submitting them
    #[arg(long)]
    dry_run: bool,
    /// keep going after a pair failed instead of aborting the run
    #[arg(long)]
    continue_on_error: bool,
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("{0} pair(s) could not be submitted")]
    FailedPairs(usize),
}

impl Cli {
    /// load the config file if any and apply command line overrides
    fn runner_config(&self) -> Result<RunnerConfig, ConfigErrors> {
        let mut config = match self.config {
            Some(ref path) => RunnerConfig::load(path)?,
            None => RunnerConfig::default(),
        };

        if let Some(ref output_dir) = self.output_dir {
            config.output_dir = output_dir.clone();
        }
        if let Some(ref benchmark) = self.benchmark {
            config.benchmark = benchmark.clone();
        }
        if let Some(ref command) = self.submit_command {
            config.submit.command = command.clone();
        }
        if self.continue_on_error {
            config.policy = FailurePolicy::Continue;
        }

        if config.preflight_checks() {
            Err(ConfigErrors::InvalidValues)
        } else {
            Ok(config)
        }
    }
}

fn run(cli: Cli) -> Result<(), RunError> {
    let config = cli.runner_config()?;
    let params = config.parameters(&cli.module, &cli.launch_command)?;

    let nodes = load_nodes(&cli.nodelist)?;
    info!(nodes = nodes.len(), path = ?cli.nodelist, "Loaded node list");

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let result = pair_nodes(nodes, &mut rng);

    if result.pairs.is_empty() {
        warn!("Not enough nodes to form a single pair, nothing to submit");

        return Ok(());
    }
    info!(
        pairs = result.pairs.len(),
        excluded = ?result.excluded.as_deref(),
        "Created node pairs"
    );

    let jobs = result
        .pairs
        .into_iter()
        .enumerate()
        .map(|(index, pair)| JobDescription::build(index, pair, &params));

    if cli.dry_run {
        dispatch(DryRunSubmitter, config.policy, jobs, &params)
    } else {
        dispatch(
            CommandSubmitter::load(&config.submit),
            config.policy,
            jobs,
            &params,
        )
    }
}

fn dispatch<S, I>(
    submitter: S,
    policy: FailurePolicy,
    jobs: I,
    params: &RunParameters,
) -> Result<(), RunError>
where
    S: Submitter,
    I: IntoIterator<Item = JobDescription>,
{
    let report = Dispatcher::new(submitter, policy).dispatch_all(jobs)?;

    info!(
        submitted = report.submitted.len(),
        output_dir = ?params.output_dir,
        "Done with dispatching"
    );

    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(RunError::FailedPairs(report.failed.len()))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            // walk the source chain, the top level message alone hides the io error
            let mut message = error.to_string();
            let mut source = std::error::Error::source(&error);
            while let Some(cause) = source {
                message.push_str(&format!(": {cause}"));
                source = cause.source();
            }
            error!("{message}");

            ExitCode::FAILURE
        }
    }
}
