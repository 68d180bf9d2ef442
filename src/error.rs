use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum XnatError {
    #[error("XNAT project does not exist: {0}")]
    UnknownProject(String),

    #[error("XNAT subject does not exist in project {project}: {subject}")]
    UnknownSubject { project: String, subject: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid pattern for attribute `{attribute}`: {message}")]
    InvalidPattern { attribute: String, message: String },

    #[error("XNAT request failed: {0}")]
    ArchiveHttp(String),

    #[error("XNAT returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("unexpected XNAT response: {0}")]
    ArchiveResponse(String),

    #[error("mapping incomplete: missing {missing:?} in {considered:?}")]
    #[diagnostic(help("set allow_incomplete to accept subjects with missing scan types"))]
    MappingIncomplete {
        missing: Vec<String>,
        considered: Vec<String>,
    },

    #[error("scan rule failed: {0}")]
    Predicate(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("download coordinator stopped before finishing the job")]
    CoordinatorGone,

    #[error("batch cancelled")]
    Cancelled,
}

impl XnatError {
    pub(crate) fn fs(err: impl std::fmt::Display) -> Self {
        XnatError::Filesystem(err.to_string())
    }
}
