use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use serde::Serialize;

use crate::domain::Subject;
use crate::error::XnatError;

/// One scan as it landed on disk.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadedScan {
    /// Mapping key, or experiment id when no mapping is configured.
    pub group: String,
    pub scan_id: String,
    pub scan_label: String,
    pub path: PathBuf,
    pub files: usize,
}

pub type JobOutcome = Result<Vec<DownloadedScan>, XnatError>;

/// Download request for one subject, handed from a worker to the coordinator.
///
/// `finish` consumes the job, so a job is signalled at most once. A job that
/// is dropped unfinished disconnects its ticket, which the waiting worker
/// observes as [`XnatError::CoordinatorGone`].
#[derive(Debug)]
pub struct DownloadJob {
    subject: Subject,
    destination: PathBuf,
    completion: Sender<JobOutcome>,
}

impl DownloadJob {
    pub fn new(subject: Subject, destination: impl Into<PathBuf>) -> (Self, JobTicket) {
        let (completion, receiver) = bounded(1);
        let job = Self {
            subject,
            destination: destination.into(),
            completion,
        };
        (job, JobTicket { receiver })
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn finish(self, outcome: JobOutcome) {
        // The worker only goes away early if it panicked.
        let _ = self.completion.send(outcome);
    }
}

/// The worker's side of a [`DownloadJob`].
#[derive(Debug)]
pub struct JobTicket {
    receiver: Receiver<JobOutcome>,
}

impl JobTicket {
    /// Blocks until the coordinator finishes the job or drops it.
    pub fn wait(self) -> JobOutcome {
        self.receiver
            .recv()
            .unwrap_or(Err(XnatError::CoordinatorGone))
    }
}

pub type JobSender = Sender<DownloadJob>;
pub type JobReceiver = Receiver<DownloadJob>;

/// Multi-producer queue from the subject workers to the coordinator.
pub fn job_queue() -> (JobSender, JobReceiver) {
    unbounded()
}
