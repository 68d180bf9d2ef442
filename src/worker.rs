use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::domain::Subject;
use crate::error::XnatError;
use crate::fs_util::write_if_not_empty;
use crate::job::{DownloadJob, DownloadedScan, JobSender};
use crate::pool::CancelToken;

const CHILD_POLL: Duration = Duration::from_millis(50);
/// How long output readers may lag behind a killed command.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Everything a subject worker needs besides its subject.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub command: Vec<String>,
    pub log_dir: PathBuf,
    pub command_timeout: Option<Duration>,
    pub cancel: CancelToken,
    pub queue: JobSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectState {
    Done,
    DownloadFailed,
    CommandFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject_id: String,
    pub label: String,
    pub state: SubjectState,
    pub scans: Vec<DownloadedScan>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub logs: Vec<PathBuf>,
}

impl SubjectReport {
    fn new(subject: &Subject) -> Self {
        Self {
            subject_id: subject.id.clone(),
            label: subject.label.clone(),
            state: SubjectState::Done,
            scans: Vec::new(),
            exit_code: None,
            error: None,
            logs: Vec::new(),
        }
    }

    pub fn failed(subject: &Subject, state: SubjectState, error: String) -> Self {
        Self {
            state,
            error: Some(error),
            ..Self::new(subject)
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == SubjectState::Done
    }
}

/// Output of one external command run.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.is_some_and(|s| s.success())
    }
}

/// Runs the whole lifecycle of one subject: request the download, wait for
/// it, run the command on the downloaded tree and write the logs.
///
/// The temporary download directory outlives the command.
pub fn process_subject(ctx: &WorkerContext, subject: Subject) -> SubjectReport {
    let temp_dir = match tempfile::Builder::new().prefix("xnat-tools-").tempdir() {
        Ok(dir) => dir,
        Err(err) => {
            let err = XnatError::fs(err);
            return download_failed(ctx, &subject, err);
        }
    };

    let (job, ticket) = DownloadJob::new(subject.clone(), temp_dir.path());
    debug!(subject = %subject, dir = %temp_dir.path().display(), "awaiting download");
    if ctx.queue.send(job).is_err() {
        return download_failed(ctx, &subject, XnatError::CoordinatorGone);
    }

    let scans = match ticket.wait() {
        Ok(scans) => scans,
        Err(err) => return download_failed(ctx, &subject, err),
    };

    info!(subject = %subject, scans = scans.len(), "running command");
    let mut report = SubjectReport::new(&subject);
    report.scans = scans;

    let output = run_command(
        &ctx.command,
        temp_dir.path(),
        &subject.label,
        ctx.command_timeout,
        &ctx.cancel,
    );
    match output {
        Ok(output) => {
            report.exit_code = output.status.and_then(|s| s.code());
            let mut stderr = output.stderr.clone();
            if let Some(note) = failure_note(&output, ctx.command_timeout) {
                warn!(subject = %subject, "{note}");
                push_line(&mut stderr, &note);
                report.state = SubjectState::CommandFailed;
                report.error = Some(note);
            }
            write_logs(ctx, &subject, &output.stdout, &stderr, &mut report);
        }
        Err(err) => {
            error!(subject = %subject, error = %err, "command could not be started");
            let message = format!("Error while running command: {err}\n");
            report.state = SubjectState::CommandFailed;
            report.error = Some(err.to_string());
            write_logs(ctx, &subject, b"", message.as_bytes(), &mut report);
        }
    }

    if let Err(err) = temp_dir.close() {
        warn!(subject = %subject, error = %err, "failed to remove download directory");
    }
    info!(subject = %subject, state = ?report.state, "subject finished");
    report
}

/// Spawns `command + [scan_dir, label]` and collects both output streams.
///
/// On unix the command leads its own process group, and the whole group is
/// killed when `timeout` elapses or `cancel` fires.
pub fn run_command(
    command: &[String],
    scan_dir: &Path,
    label: &str,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<CommandOutput, XnatError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| XnatError::InvalidConfig("command is empty".to_string()))?;
    let mut process = Command::new(program);
    process
        .args(args)
        .arg(scan_dir)
        .arg(label)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        process.process_group(0);
    }
    let mut child = process
        .spawn()
        .map_err(|err| XnatError::Command(format!("{program}: {err}")))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(err) => return Err(XnatError::Command(err.to_string())),
        }
        if timeout.is_some_and(|limit| started.elapsed() >= limit) {
            timed_out = true;
        } else if cancel.is_cancelled() {
            cancelled = true;
        }
        if timed_out || cancelled {
            kill_process_group(&mut child);
            break child.wait().ok();
        }
        thread::sleep(CHILD_POLL);
    };

    let killed = timed_out || cancelled;
    Ok(CommandOutput {
        status,
        stdout: stdout.map(|rx| collect(rx, killed)).unwrap_or_default(),
        stderr: stderr.map(|rx| collect(rx, killed)).unwrap_or_default(),
        timed_out,
        cancelled,
    })
}

fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!(pid = child.id(), error = %err, "failed to kill process group");
        }
    }
    let _ = child.kill();
}

fn drain<R: Read + Send + 'static>(mut stream: R) -> Receiver<Vec<u8>> {
    let (sender, receiver) = bounded(1);
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        let _ = sender.send(buf);
    });
    receiver
}

/// Output of a killed command is only awaited for [`DRAIN_GRACE`], since a
/// process that left the group may still hold the pipe.
fn collect(output: Receiver<Vec<u8>>, killed: bool) -> Vec<u8> {
    if killed {
        output.recv_timeout(DRAIN_GRACE).unwrap_or_default()
    } else {
        output.recv().unwrap_or_default()
    }
}

fn failure_note(output: &CommandOutput, timeout: Option<Duration>) -> Option<String> {
    if output.timed_out {
        let limit = timeout.unwrap_or_default();
        return Some(XnatError::CommandTimeout(limit).to_string());
    }
    if output.cancelled {
        return Some(XnatError::Cancelled.to_string());
    }
    match output.status {
        Some(status) if status.success() => None,
        Some(status) => Some(format!("command exited with {status}")),
        None => Some("command exit status unavailable".to_string()),
    }
}

fn push_line(buf: &mut Vec<u8>, line: &str) {
    if !buf.is_empty() && !buf.ends_with(b"\n") {
        buf.push(b'\n');
    }
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
}

fn download_failed(ctx: &WorkerContext, subject: &Subject, err: XnatError) -> SubjectReport {
    error!(subject = %subject, error = %err, "download failed, skipping command");
    let mut report = SubjectReport::failed(subject, SubjectState::DownloadFailed, err.to_string());
    let message = format!("Error while downloading scans: {err}\n");
    write_logs(ctx, subject, b"", message.as_bytes(), &mut report);
    report
}

fn write_logs(
    ctx: &WorkerContext,
    subject: &Subject,
    stdout: &[u8],
    stderr: &[u8],
    report: &mut SubjectReport,
) {
    let logs = [
        (log_path(&ctx.log_dir, &subject.label, "out"), stdout),
        (log_path(&ctx.log_dir, &subject.label, "err"), stderr),
    ];
    for (path, content) in logs {
        match write_if_not_empty(&path, content) {
            Ok(true) => report.logs.push(path),
            Ok(false) => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to write log"),
        }
    }
}

pub fn log_path(log_dir: &Path, label: &str, stream: &str) -> PathBuf {
    log_dir.join(format!("{label}.{stream}.log"))
}
