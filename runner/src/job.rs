use crate::{config::RunParameters, pairing::Pair};
use std::path::{Path, PathBuf};

/// Everything needed to submit the benchmark for one pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescription {
    /// position of the pair in this run
    pub index: usize,
    pub pair: Pair,
    pub job_name: String,
    /// scheduler log destination, `%j` is expanded to the job id by the scheduler
    pub log_path: PathBuf,
    pub script_path: PathBuf,
    pub script: String,
}

/// replace path separators so a module or node name can be embedded in file names
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', '\\'], "-")
}

impl JobDescription {
    pub fn build(index: usize, pair: Pair, params: &RunParameters) -> Self {
        let tag = sanitize_name(&params.module);
        // the node list directive keeps the raw names
        let (first, second) = (sanitize_name(pair.first()), sanitize_name(pair.second()));

        let job_name = format!("{}_{tag}_{first}_{second}", params.job_prefix);
        let log_path = params
            .output_dir
            .join(format!("{index}_{tag}_{first}_{second}_%j.out"));
        let script_path = params.output_dir.join(format!(
            "{}_{index}_{tag}_{first}_{second}.sh",
            params.job_prefix
        ));
        let script = render_script(&job_name, &log_path, &pair, params);

        Self {
            index,
            pair,
            job_name,
            log_path,
            script_path,
            script,
        }
    }
}

fn directive(option: &str, value: impl std::fmt::Display) -> String {
    format!("#SBATCH --{option}={value}")
}

fn render_script(
    job_name: &str,
    log_path: &Path,
    pair: &Pair,
    params: &RunParameters,
) -> String {
    let resources = &params.resources;
    let mut lines = vec![String::from("#!/bin/bash"), directive("job-name", job_name)];

    if let Some(ref reservation) = resources.reservation {
        lines.push(directive("reservation", reservation));
    }
    if let Some(ref partition) = resources.partition {
        lines.push(directive("partition", partition));
    }
    if let Some(ref qos) = resources.qos {
        lines.push(directive("qos", qos));
    }

    lines.extend([
        directive("time", &resources.time_limit),
        directive("ntasks-per-node", resources.tasks_per_node),
        directive("gpus-per-node", resources.gpus_per_node),
        directive("nodes", resources.nodes),
        directive(
            "ntasks",
            resources.nodes.saturating_mul(resources.tasks_per_node),
        ),
        directive("cpus-per-task", resources.cpus_per_task),
        directive("nodelist", pair),
        directive("output", log_path.display()),
    ]);

    if let Some(ref export) = resources.export {
        lines.push(directive("export", export));
    }

    lines.extend([
        String::new(),
        format!(
            "echo \"Running on nodes {} and {} with {}\"",
            pair.first(),
            pair.second(),
            params.module
        ),
        format!("module load {}", params.module),
        format!("{} \"{}\"", params.launch_command, params.benchmark),
    ]);

    let mut script = lines.join("\n");
    script.push('\n');

    script
}
