use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::batch::BatchOptions;
use crate::coordinator::DEFAULT_POLL_INTERVAL;
use crate::error::XnatError;
use crate::rules::{Mapping, Rule};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub url: String,
    pub project: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub subjects: Option<Vec<String>>,
    #[serde(default)]
    pub mapping: Option<Mapping>,
    #[serde(default)]
    pub exclusions: Vec<Rule>,
    #[serde(default)]
    pub allow_incomplete: bool,
    #[serde(default)]
    pub log_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub url: String,
    pub project: String,
    pub command: Vec<String>,
    pub workers: usize,
    pub subjects: Option<Vec<String>>,
    pub mapping: Option<Mapping>,
    pub exclusions: Vec<Rule>,
    pub allow_incomplete: bool,
    pub log_dir: Utf8PathBuf,
    pub user: Option<String>,
    pub command_timeout: Option<Duration>,
    pub request_timeout: Duration,
}

impl ResolvedConfig {
    pub fn batch_options(&self) -> Result<BatchOptions, XnatError> {
        if self.command.is_empty() {
            return Err(XnatError::InvalidConfig(
                "`command` is required for batch processing".to_string(),
            ));
        }
        Ok(BatchOptions {
            command: self.command.clone(),
            workers: self.workers,
            subjects: self.subjects.clone(),
            mapping: self.mapping.clone(),
            exclusions: self.exclusions.clone(),
            allow_incomplete: self.allow_incomplete,
            log_dir: PathBuf::from(self.log_dir.as_std_path()),
            command_timeout: self.command_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: &Path) -> Result<ResolvedConfig, XnatError> {
        let content =
            fs::read_to_string(path).map_err(|_| XnatError::ConfigRead(path.to_path_buf()))?;
        Self::resolve_str(&content)
    }

    pub fn resolve_str(content: &str) -> Result<ResolvedConfig, XnatError> {
        let config: Config =
            serde_json::from_str(content).map_err(|err| XnatError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, XnatError> {
        if config.url.trim().is_empty() {
            return Err(XnatError::InvalidConfig("`url` must not be empty".to_string()));
        }
        if config.project.trim().is_empty() {
            return Err(XnatError::InvalidConfig(
                "`project` must not be empty".to_string(),
            ));
        }

        let workers = config.workers.unwrap_or(1);
        if workers == 0 {
            return Err(XnatError::InvalidConfig(
                "`workers` must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            url: config.url.trim().to_string(),
            project: config.project,
            command: config.command,
            workers,
            subjects: config.subjects.filter(|subjects| !subjects.is_empty()),
            mapping: config.mapping.filter(|mapping| !mapping.is_empty()),
            exclusions: config.exclusions,
            allow_incomplete: config.allow_incomplete,
            log_dir: config.log_dir.unwrap_or_else(|| Utf8PathBuf::from(".")),
            user: config.user.filter(|user| !user.trim().is_empty()),
            command_timeout: config.command_timeout_secs.map(Duration::from_secs),
            request_timeout: Duration::from_secs(
                config
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
        })
    }
}
