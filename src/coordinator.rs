use std::path::Path;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info};

use crate::archive::{ArchiveSession, subject_scans};
use crate::domain::{Project, Scan, Subject};
use crate::download::download_scan;
use crate::error::XnatError;
use crate::job::{DownloadJob, DownloadedScan, JobReceiver};
use crate::pool::CancelToken;
use crate::resolver::{filter_excluded, resolve};
use crate::rules::{Mapping, Rule};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Serves download jobs on the thread that owns the archive session.
pub struct Coordinator<'a, S: ArchiveSession + ?Sized> {
    session: &'a S,
    project: &'a Project,
    mapping: Option<&'a Mapping>,
    exclusions: &'a [Rule],
    allow_incomplete: bool,
    cancel: CancelToken,
    poll_interval: Duration,
}

impl<'a, S: ArchiveSession + ?Sized> Coordinator<'a, S> {
    pub fn new(session: &'a S, project: &'a Project) -> Self {
        Self {
            session,
            project,
            mapping: None,
            exclusions: &[],
            allow_incomplete: false,
            cancel: CancelToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn mapping(mut self, mapping: Option<&'a Mapping>) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn exclusions(mut self, exclusions: &'a [Rule]) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn allow_incomplete(mut self, allow: bool) -> Self {
        self.allow_incomplete = allow;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Serves jobs until `all_done` reports that no worker is left, or every
    /// sender is gone. The bounded wait lets the loop notice completion
    /// without a separate shutdown message. Returns the number of jobs served.
    pub fn run<F>(&self, jobs: &JobReceiver, all_done: F) -> usize
    where
        F: Fn() -> bool,
    {
        let mut served = 0usize;
        while !all_done() {
            match jobs.recv_timeout(self.poll_interval) {
                Ok(job) => {
                    self.handle(job);
                    served += 1;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(served, "download coordinator finished");
        served
    }

    /// Fetches the scans for one job and signals it, whatever the outcome.
    pub fn handle(&self, job: DownloadJob) {
        let outcome = if self.cancel.is_cancelled() {
            Err(XnatError::Cancelled)
        } else {
            self.fetch(job.subject(), job.destination())
        };
        match &outcome {
            Ok(scans) => info!(subject = %job.subject(), scans = scans.len(), "downloads finished"),
            Err(err) => error!(subject = %job.subject(), error = %err, "downloads failed"),
        }
        job.finish(outcome);
    }

    /// Resolves and downloads every selected scan of `subject` below
    /// `destination`: `<type>/<scan>` with a mapping, `<experiment>/<scan>`
    /// without one.
    pub fn fetch(
        &self,
        subject: &Subject,
        destination: &Path,
    ) -> Result<Vec<DownloadedScan>, XnatError> {
        let scans = subject_scans(self.session, self.project, subject)?;

        let mut selected: Vec<(String, Scan)> = Vec::new();
        match self.mapping {
            Some(mapping) => {
                let mapped = resolve(scans, mapping, self.exclusions, self.allow_incomplete)?;
                for bucket in mapped.buckets {
                    for scan in bucket.scans {
                        selected.push((bucket.key.clone(), scan));
                    }
                }
            }
            None => {
                for scan in filter_excluded(scans, self.exclusions)? {
                    selected.push((scan.experiment_id.clone(), scan));
                }
            }
        }

        let mut downloaded = Vec::with_capacity(selected.len());
        for (group, scan) in selected {
            if self.cancel.is_cancelled() {
                return Err(XnatError::Cancelled);
            }
            let path = destination.join(&group).join(&scan.id);
            let files = download_scan(self.session, &scan, &path)?;
            downloaded.push(DownloadedScan {
                group,
                scan_id: scan.id.clone(),
                scan_label: scan.label(),
                path,
                files: files.len(),
            });
        }
        Ok(downloaded)
    }
}
