use crate::{config::SubmitConfig, job::JobDescription, pairing::Pair};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Failed to spawn submit command {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to wait for the submit command")]
    Wait(#[source] std::io::Error),
    #[error("Submit command exited with {0}")]
    ExitStatus(ExitStatus),
    #[error("Submit command did not return within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("pair #{index} ({pair}): failed to create output directory {path:?}")]
    CreateDir {
        index: usize,
        pair: Pair,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pair #{index} ({pair}): failed to write job script {path:?}")]
    Write {
        index: usize,
        pair: Pair,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pair #{index} ({pair}): failed to submit {path:?}")]
    Submit {
        index: usize,
        pair: Pair,
        path: PathBuf,
        #[source]
        source: SubmissionError,
    },
}

/// what happens with the remaining pairs once one of them failed
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Continue,
}

/// Hands a written job script over to the batch scheduler
pub trait Submitter {
    fn submit(&mut self, script: &Path) -> Result<(), SubmissionError>;
}

/// Submits by running an external command (usually `sbatch`) with the script as last argument
#[derive(Debug, Clone)]
pub struct CommandSubmitter {
    command: String,
    args: Vec<String>,
    strict: bool,
    timeout: Option<Duration>,
}

impl CommandSubmitter {
    pub fn load(config: &SubmitConfig) -> Self {
        Self {
            command: config.command.trim().to_string(),
            args: config.args.clone(),
            strict: config.strict,
            timeout: config.timeout(),
        }
    }
}

impl Submitter for CommandSubmitter {
    #[instrument(level = "debug", skip(self))]
    fn submit(&mut self, script: &Path) -> Result<(), SubmissionError> {
        let mut child = Command::new(&self.command)
            .args(self.args.iter())
            .arg(script)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SubmissionError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // only the submit command is awaited, never the submitted job
        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    stop_child(&mut child);

                    return Err(SubmissionError::Timeout(timeout));
                }
                Err(error) => {
                    stop_child(&mut child);

                    return Err(SubmissionError::Wait(error));
                }
            },
            None => child.wait().map_err(SubmissionError::Wait)?,
        };

        if status.success() {
            debug!("Submit command finished: {status}");

            Ok(())
        } else if self.strict {
            Err(SubmissionError::ExitStatus(status))
        } else {
            warn!(
                script = ?script,
                "Submit command exited with {status}, the job might not be queued"
            );

            Ok(())
        }
    }
}

/// kill and reap a submit command that is no longer waited for
fn stop_child(child: &mut Child) {
    if let Err(error) = child.kill() {
        warn!(error = ?error, "Failed to kill submit command");
    }

    if let Err(error) = child.wait() {
        warn!(error = ?error, "Failed to reap submit command");
    }
}

/// Writes the scripts but never contacts the scheduler
#[derive(Debug, Default)]
pub struct DryRunSubmitter;

impl Submitter for DryRunSubmitter {
    fn submit(&mut self, script: &Path) -> Result<(), SubmissionError> {
        info!(script = ?script, "Dry run, not submitting");

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// script paths in submission order
    pub submitted: Vec<PathBuf>,
    /// only filled with `FailurePolicy::Continue`
    pub failed: Vec<DispatchError>,
}

#[derive(Debug)]
pub struct Dispatcher<S> {
    submitter: S,
    policy: FailurePolicy,
}

impl<S: Submitter> Dispatcher<S> {
    pub fn new(submitter: S, policy: FailurePolicy) -> Self {
        Self { submitter, policy }
    }

    #[cfg(test)]
    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    /// Write the job script of a single pair and submit it.
    ///
    /// The script is written next to its destination and renamed into place, so an
    /// interrupted run never leaves a truncated script under the final name. A stale
    /// `.partial` file is left behind if writing fails.
    #[instrument(level = "debug", skip_all, fields(index = job.index, pair = %job.pair))]
    pub fn dispatch(&mut self, job: JobDescription) -> Result<PathBuf, DispatchError> {
        let JobDescription {
            index,
            pair,
            job_name,
            log_path,
            script_path,
            script,
        } = job;

        if let Some(dir) = script_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            // no-op for an existing directory
            if let Err(source) = fs::create_dir_all(dir) {
                return Err(DispatchError::CreateDir {
                    index,
                    pair,
                    path: dir.to_path_buf(),
                    source,
                });
            }
        }

        let mut partial = script_path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        if let Err(source) = fs::write(&partial, script.as_bytes()) {
            return Err(DispatchError::Write {
                index,
                pair,
                path: partial,
                source,
            });
        }

        // the script goes through the submit command, so a missing executable bit is survivable
        if let Err(error) = fs::set_permissions(&partial, fs::Permissions::from_mode(0o755)) {
            warn!(error = ?error, path = ?partial, "Failed to mark job script as executable");
        }

        if let Err(source) = fs::rename(&partial, &script_path) {
            return Err(DispatchError::Write {
                index,
                pair,
                path: script_path,
                source,
            });
        }

        debug!(path = ?script_path, job_name = %job_name, log = ?log_path, "Wrote job script");

        match self.submitter.submit(&script_path) {
            Ok(()) => {
                info!(path = ?script_path, "Dispatched job for pair #{index} ({pair})");

                Ok(script_path)
            }
            Err(source) => Err(DispatchError::Submit {
                index,
                pair,
                path: script_path,
                source,
            }),
        }
    }

    /// dispatch jobs one after another in the given order
    pub fn dispatch_all<I>(&mut self, jobs: I) -> Result<DispatchReport, DispatchError>
    where
        I: IntoIterator<Item = JobDescription>,
    {
        let mut report = DispatchReport::default();

        for job in jobs {
            match self.dispatch(job) {
                Ok(path) => report.submitted.push(path),
                Err(error) => match self.policy {
                    FailurePolicy::Abort => return Err(error),
                    FailurePolicy::Continue => {
                        error!("{error}, continuing with the next pair");
                        report.failed.push(error);
                    }
                },
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod dispatch_test;
