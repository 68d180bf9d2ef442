use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::archive::{ArchiveSession, find_project, resolve_subjects};
use crate::coordinator::{Coordinator, DEFAULT_POLL_INTERVAL};
use crate::domain::Project;
use crate::error::XnatError;
use crate::job::job_queue;
use crate::pool::{CancelToken, WorkerPool, panic_message};
use crate::rules::{Exclusions, Mapping};
use crate::worker::{SubjectReport, SubjectState, WorkerContext, process_subject};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub command: Vec<String>,
    pub workers: usize,
    pub subjects: Option<Vec<String>>,
    pub mapping: Option<Mapping>,
    pub exclusions: Exclusions,
    pub allow_incomplete: bool,
    pub log_dir: PathBuf,
    pub command_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl BatchOptions {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            workers: 1,
            subjects: None,
            mapping: None,
            exclusions: Vec::new(),
            allow_incomplete: false,
            log_dir: PathBuf::from("."),
            command_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub project: Project,
    pub workers: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub subjects: Vec<SubjectReport>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &SubjectReport> {
        self.subjects.iter().filter(|report| !report.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Runs one command per subject on a bounded pool while the calling thread
/// performs every archive download.
#[derive(Debug)]
pub struct BatchProcessor {
    options: BatchOptions,
    cancel: CancelToken,
}

impl BatchProcessor {
    pub fn new(options: BatchOptions) -> Result<Self, XnatError> {
        if options.command.is_empty() {
            return Err(XnatError::InvalidConfig("command must not be empty".to_string()));
        }
        if options.workers == 0 {
            return Err(XnatError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            options,
            cancel: CancelToken::new(),
        })
    }

    /// Cancelling stops further downloads and kills running commands.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run<S: ArchiveSession + ?Sized>(
        &self,
        session: &S,
        project: &str,
    ) -> Result<BatchReport, XnatError> {
        let started_at = Utc::now();
        let options = &self.options;

        let project = find_project(session, project)?;
        let subjects = resolve_subjects(session, &project, options.subjects.as_deref())?;
        fs::create_dir_all(&options.log_dir).map_err(XnatError::fs)?;
        info!(
            project = %project.id,
            subjects = subjects.len(),
            workers = options.workers,
            "starting batch"
        );

        // Declared before the queue so that on unwind the queue is dropped
        // first and blocked workers are released before the pool joins them.
        let pool = WorkerPool::new(options.workers)?;
        let (queue, jobs) = job_queue();
        let context = WorkerContext {
            command: options.command.clone(),
            log_dir: options.log_dir.clone(),
            command_timeout: options.command_timeout,
            cancel: self.cancel.clone(),
            queue,
        };

        let handles = subjects
            .iter()
            .map(|subject| {
                let context = context.clone();
                let subject = subject.clone();
                pool.submit(move || process_subject(&context, subject))
            })
            .collect::<Vec<_>>();
        drop(context);

        Coordinator::new(session, &project)
            .mapping(options.mapping.as_ref())
            .exclusions(&options.exclusions)
            .allow_incomplete(options.allow_incomplete)
            .cancel_token(self.cancel.clone())
            .poll_interval(options.poll_interval)
            .run(&jobs, || handles.iter().all(|handle| handle.is_done()));

        pool.shutdown();

        let reports = subjects
            .iter()
            .zip(handles)
            .map(|(subject, handle)| {
                handle.join().unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(subject = %subject, error = %message, "subject worker panicked");
                    SubjectReport::failed(subject, SubjectState::CommandFailed, message)
                })
            })
            .collect::<Vec<_>>();

        let report = BatchReport {
            project,
            workers: options.workers,
            started_at,
            finished_at: Utc::now(),
            subjects: reports,
        };
        info!(
            subjects = report.subjects.len(),
            failed = report.failed().count(),
            "batch finished"
        );
        Ok(report)
    }
}
