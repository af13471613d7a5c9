use super::{
    CommandSubmitter, DispatchError, Dispatcher, DryRunSubmitter, FailurePolicy, SubmissionError,
    Submitter,
};
use crate::{
    config::{RunParameters, RunnerConfig, SubmitConfig},
    job::JobDescription,
    nodes::Node,
    pairing::{pair_nodes, Pair},
};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::BTreeSet,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// records every script instead of talking to a scheduler
#[derive(Debug, Default)]
struct RecordingSubmitter {
    submitted: Vec<PathBuf>,
    // submissions with these indices fail
    fail_at: BTreeSet<usize>,
}

impl Submitter for RecordingSubmitter {
    fn submit(&mut self, script: &Path) -> Result<(), SubmissionError> {
        let call = self.submitted.len();
        self.submitted.push(script.to_path_buf());

        if self.fail_at.contains(&call) {
            Err(SubmissionError::Timeout(std::time::Duration::from_millis(1)))
        } else {
            Ok(())
        }
    }
}

fn params(output_dir: PathBuf) -> RunParameters {
    let config = RunnerConfig {
        output_dir,
        ..RunnerConfig::default()
    };

    config.parameters("omb/7.3", "srun").unwrap()
}

fn nodes(names: &[&str]) -> Vec<Node> {
    names.iter().map(|name| Node::new(*name)).collect()
}

fn jobs(names: &[&str], params: &RunParameters, seed: u64) -> (Vec<JobDescription>, Option<Node>) {
    let result = pair_nodes(nodes(names), &mut StdRng::seed_from_u64(seed));
    let jobs: Vec<JobDescription> = result
        .pairs
        .into_iter()
        .enumerate()
        .map(|(index, pair)| JobDescription::build(index, pair, params))
        .collect();

    (jobs, result.excluded)
}

fn job(index: usize, first: &str, second: &str, params: &RunParameters) -> JobDescription {
    let pair = Pair::new(Node::new(first), Node::new(second)).unwrap();

    JobDescription::build(index, pair, params)
}

#[test]
pub fn four_nodes_end_to_end() {
    let dir = TempDir::new().unwrap();
    let params = params(dir.path().join("log"));
    let (jobs, excluded) = jobs(&["n1", "n2", "n3", "n4"], &params, 1234);
    let expected = jobs.clone();

    assert!(excluded.is_none());
    assert_eq!(jobs.len(), 2);

    let mut dispatcher = Dispatcher::new(RecordingSubmitter::default(), FailurePolicy::Abort);
    let report = dispatcher.dispatch_all(jobs).unwrap();

    assert!(report.failed.is_empty());
    assert_eq!(report.submitted, dispatcher.submitter().submitted);

    let mut covered = BTreeSet::new();
    for job in expected.iter() {
        assert!(report.submitted.contains(&job.script_path));

        let content = fs::read_to_string(&job.script_path).unwrap();
        assert_eq!(content, job.script);
        assert!(content.contains(&format!(
            "--nodelist={},{}",
            job.pair.first(),
            job.pair.second()
        )));
        assert!(content.contains(&format!(
            "--output={}/{}_omb-7.3_",
            params.output_dir.display(),
            job.index
        )));

        let mode = fs::metadata(&job.script_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        covered.insert(job.pair.first().clone());
        covered.insert(job.pair.second().clone());
    }

    assert_eq!(covered.len(), 4);
    assert_eq!(fs::read_dir(&params.output_dir).unwrap().count(), 2);
}

#[test]
pub fn three_nodes_end_to_end() {
    let dir = TempDir::new().unwrap();
    let params = params(dir.path().join("log"));
    let (jobs, excluded) = jobs(&["n1", "n2", "n3"], &params, 99);

    assert!(excluded.is_some());
    assert_eq!(jobs.len(), 1);

    let mut dispatcher = Dispatcher::new(RecordingSubmitter::default(), FailurePolicy::Abort);
    let report = dispatcher.dispatch_all(jobs).unwrap();

    assert_eq!(report.submitted.len(), 1);
    assert_eq!(fs::read_dir(&params.output_dir).unwrap().count(), 1);
}

#[test]
pub fn existing_directory_is_reused() {
    let dir = TempDir::new().unwrap();
    let params = params(dir.path().join("log"));
    let mut dispatcher = Dispatcher::new(DryRunSubmitter, FailurePolicy::Abort);

    dispatcher.dispatch(job(0, "a", "b", &params)).unwrap();
    dispatcher.dispatch(job(1, "c", "d", &params)).unwrap();
    // same artifact again overwrites in place
    dispatcher.dispatch(job(0, "a", "b", &params)).unwrap();

    assert_eq!(fs::read_dir(&params.output_dir).unwrap().count(), 2);
}

#[test]
pub fn unwritable_directory_names_the_pair() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("log");
    fs::write(&blocker, "not a directory").unwrap();

    let params = params(blocker);
    let mut dispatcher = Dispatcher::new(RecordingSubmitter::default(), FailurePolicy::Abort);

    let error = dispatcher.dispatch(job(4, "a", "b", &params)).unwrap_err();

    assert!(matches!(error, DispatchError::CreateDir { index: 4, .. }));
    assert!(error.to_string().contains("pair #4 (a,b)"));
    assert!(dispatcher.submitter().submitted.is_empty());
}

#[test]
pub fn blocked_script_path_is_a_write_error() {
    let dir = TempDir::new().unwrap();
    let params = params(dir.path().join("log"));
    let job = job(2, "a", "b", &params);

    // a non-empty directory where the script should land makes the rename fail
    fs::create_dir_all(job.script_path.join("occupied")).unwrap();
    let script_path = job.script_path.clone();
    let mut dispatcher = Dispatcher::new(RecordingSubmitter::default(), FailurePolicy::Abort);

    let error = dispatcher.dispatch(job).unwrap_err();

    match error {
        DispatchError::Write {
            index, ref path, ..
        } => {
            assert_eq!(index, 2);
            assert_eq!(path, &script_path);
        }
        ref other => panic!("expected a write error, got {other:?}"),
    }
    assert!(error.to_string().contains("pair #2 (a,b)"));
    assert!(dispatcher.submitter().submitted.is_empty());
}

#[test]
pub fn abort_stops_at_first_failure() {
    let dir = TempDir::new().unwrap();
    let params = params(dir.path().join("log"));
    let submitter = RecordingSubmitter {
        fail_at: BTreeSet::from([1]),
        ..RecordingSubmitter::default()
    };
    let mut dispatcher = Dispatcher::new(submitter, FailurePolicy::Abort);

    let jobs = vec![
        job(0, "a", "b", &params),
        job(1, "c", "d", &params),
        job(2, "e", "f", &params),
    ];

    let error = dispatcher.dispatch_all(jobs).unwrap_err();

    assert!(matches!(error, DispatchError::Submit { index: 1, .. }));
    assert_eq!(dispatcher.submitter().submitted.len(), 2);
}

#[test]
pub fn continue_reports_failures() {
    let dir = TempDir::new().unwrap();
    let params = params(dir.path().join("log"));
    let submitter = RecordingSubmitter {
        fail_at: BTreeSet::from([0]),
        ..RecordingSubmitter::default()
    };
    let mut dispatcher = Dispatcher::new(submitter, FailurePolicy::Continue);

    let report = dispatcher
        .dispatch_all(vec![job(0, "a", "b", &params), job(1, "c", "d", &params)])
        .unwrap();

    assert_eq!(report.submitted, vec![job(1, "c", "d", &params).script_path]);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0], DispatchError::Submit { index: 0, .. }));
}

fn command(command: &str, args: &[&str], strict: bool, timeout: Option<u64>) -> CommandSubmitter {
    CommandSubmitter::load(&SubmitConfig {
        command: command.to_string(),
        args: args.iter().map(|arg| arg.to_string()).collect(),
        strict,
        timeout,
    })
}

#[test]
pub fn command_receives_script_as_last_argument() {
    let dir = TempDir::new().unwrap();
    let record = dir.path().join("record");
    let script = dir.path().join("job.sh");
    let mut submitter = command(
        "sh",
        &["-c", &format!("echo \"$1\" > {}", record.display()), "sh"],
        true,
        None,
    );

    submitter.submit(&script).unwrap();

    assert_eq!(
        fs::read_to_string(&record).unwrap().trim(),
        script.display().to_string()
    );
}

#[test]
pub fn command_exit_status_only_fails_when_strict() {
    let script = Path::new("job.sh");

    assert!(command("false", &[], false, None).submit(script).is_ok());
    assert!(matches!(
        command("false", &[], true, None).submit(script),
        Err(SubmissionError::ExitStatus(_))
    ));
}

#[test]
pub fn command_spawn_failure() {
    let result = command("/nonexistent/sbatch", &[], false, None).submit(Path::new("job.sh"));

    assert!(matches!(result, Err(SubmissionError::Spawn { .. })));
}

#[test]
pub fn command_timeout() {
    let result = command("sh", &["-c", "sleep 5", "sh"], false, Some(50)).submit(Path::new("job.sh"));

    assert!(matches!(result, Err(SubmissionError::Timeout(_))));
}
