use crate::dispatch::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to open config file {path:?}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Config file could not be parsed")]
    InvalidConfig(#[from] serde_yaml::Error),
    #[error("Configuration contains invalid values, see the log above")]
    InvalidValues,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // directory for job scripts and scheduler logs, relative to the working directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    // subcommand handed to the launch command, e.g. osu_bibw or osu_latency
    #[serde(default = "default_benchmark")]
    pub benchmark: String,
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default)]
    pub resources: JobResources,
    #[serde(default)]
    pub submit: SubmitConfig,
}

/// Resource request written into every job script.
///
/// A pair always spans two nodes, so `nodes` only accepts 2. Everything else is site policy.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct JobResources {
    pub nodes: u32,
    pub tasks_per_node: u32,
    pub gpus_per_node: u32,
    pub cpus_per_task: u32,
    // passed verbatim, so both `1` and `00:01:00` work
    pub time_limit: String,
    pub partition: Option<String>,
    pub qos: Option<String>,
    pub reservation: Option<String>,
    pub export: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SubmitConfig {
    #[serde(default = "default_submit_command")]
    pub command: String,
    // placed before the script path
    #[serde(default)]
    pub args: Vec<String>,
    // treat a non-zero exit of the submit command as a failed pair
    #[serde(default)]
    pub strict: bool,
    // in milliseconds
    pub timeout: Option<u64>,
}

/// Read-only parameters shared by every job of a run
#[derive(Clone, Debug)]
pub struct RunParameters {
    pub module: String,
    pub launch_command: String,
    pub benchmark: String,
    pub job_prefix: String,
    pub output_dir: PathBuf,
    pub resources: JobResources,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            benchmark: default_benchmark(),
            job_prefix: default_job_prefix(),
            policy: FailurePolicy::default(),
            resources: JobResources::default(),
            submit: SubmitConfig::default(),
        }
    }
}

impl Default for JobResources {
    fn default() -> Self {
        Self {
            nodes: 2,
            tasks_per_node: 1,
            gpus_per_node: 1,
            cpus_per_task: 1,
            time_limit: String::from("1"),
            partition: Some(String::from("htc")),
            qos: Some(String::from("public")),
            reservation: Some(String::from("maint")),
            export: Some(String::from("NONE")),
        }
    }
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            command: default_submit_command(),
            args: Vec::new(),
            strict: false,
            timeout: None,
        }
    }
}

impl SubmitConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|source| ConfigErrors::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Validate the loaded configuration, returns true if any error was found.
    ///
    /// Every problem is logged instead of stopping at the first one.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;
        let resources = &mut self.resources;

        if resources.nodes != 2 {
            error!(
                "resources.nodes is {} but a pair always spans exactly 2 nodes",
                resources.nodes
            );
            contains_error = true;
        }

        if resources.tasks_per_node == 0 {
            error!("resources.tasks_per_node cannot be 0");
            contains_error = true;
        } else if resources
            .nodes
            .checked_mul(resources.tasks_per_node)
            .is_none()
        {
            error!(
                "resources.tasks_per_node {} is too large, the total task count overflows",
                resources.tasks_per_node
            );
            contains_error = true;
        }

        if resources.cpus_per_task == 0 {
            error!("resources.cpus_per_task cannot be 0");
            contains_error = true;
        }

        if resources.gpus_per_node == 0 {
            warn!("resources.gpus_per_node is 0, jobs will not request any accelerator");
        }

        resources.time_limit = resources.time_limit.trim().to_string();
        if resources.time_limit.is_empty() {
            error!("resources.time_limit cannot be empty");
            contains_error = true;
        }

        // empty optional directives are dropped instead of rendering `--qos=`
        for value in [
            &mut resources.partition,
            &mut resources.qos,
            &mut resources.reservation,
            &mut resources.export,
        ] {
            if value.as_deref().map(str::trim) == Some("") {
                *value = None;
            }
        }

        if self.benchmark.trim().is_empty() {
            error!("benchmark cannot be empty");
            contains_error = true;
        }

        if self.job_prefix.is_empty() || self.job_prefix.contains(['/', '\\']) {
            error!(
                "job_prefix '{}' must be non-empty and must not contain path separators",
                self.job_prefix
            );
            contains_error = true;
        }

        if self.submit.command.trim().is_empty() {
            error!("submit.command cannot be empty");
            contains_error = true;
        }

        if self.submit.timeout == Some(0) {
            error!("submit.timeout cannot be 0, leave it out to wait without limit");
            contains_error = true;
        }

        contains_error
    }

    /// bind the configuration to the module and launch command of this run
    pub fn parameters(
        &self,
        module: &str,
        launch_command: &str,
    ) -> Result<RunParameters, ConfigErrors> {
        let module = module.trim();
        let launch_command = launch_command.trim();

        if module.is_empty() || launch_command.is_empty() {
            error!("Both the benchmark module and the launch command must be non-empty");

            return Err(ConfigErrors::InvalidValues);
        }

        Ok(RunParameters {
            module: module.to_string(),
            launch_command: launch_command.to_string(),
            benchmark: self.benchmark.trim().to_string(),
            job_prefix: self.job_prefix.clone(),
            output_dir: self.output_dir.clone(),
            resources: self.resources.clone(),
        })
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("log")
}

fn default_benchmark() -> String {
    String::from("osu_bibw")
}

fn default_job_prefix() -> String {
    String::from("bibw")
}

fn default_submit_command() -> String {
    String::from("sbatch")
}
