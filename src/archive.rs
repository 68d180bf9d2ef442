use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::{Experiment, Project, Scan, Subject};
use crate::error::XnatError;

/// Blocking access to the archive.
///
/// Implementations are not required to be `Send` or `Sync`: the download
/// coordinator is the only code that ever holds a session, and it runs on the
/// thread that opened it.
pub trait ArchiveSession {
    fn projects(&self) -> Result<Vec<Project>, XnatError>;
    fn subjects(&self, project: &Project) -> Result<Vec<Subject>, XnatError>;
    fn experiments(
        &self,
        project: &Project,
        subject: &Subject,
    ) -> Result<Vec<Experiment>, XnatError>;
    fn scans(&self, experiment: &Experiment) -> Result<Vec<Scan>, XnatError>;
    /// Stores the zipped files of `scan` at `destination`.
    fn download_scan(&self, scan: &Scan, destination: &Path) -> Result<(), XnatError>;
}

pub fn find_project<S: ArchiveSession + ?Sized>(
    session: &S,
    key: &str,
) -> Result<Project, XnatError> {
    session
        .projects()?
        .into_iter()
        .find(|project| project.is_named(key))
        .ok_or_else(|| XnatError::UnknownProject(key.to_string()))
}

/// Resolves the requested subjects (ids or labels) against the project, or
/// returns every subject of the project when none are requested.
pub fn resolve_subjects<S: ArchiveSession + ?Sized>(
    session: &S,
    project: &Project,
    requested: Option<&[String]>,
) -> Result<Vec<Subject>, XnatError> {
    let members = session.subjects(project)?;
    let Some(requested) = requested.filter(|keys| !keys.is_empty()) else {
        return Ok(members);
    };

    requested
        .iter()
        .map(|key| {
            members
                .iter()
                .find(|subject| subject.is_named(key))
                .cloned()
                .ok_or_else(|| XnatError::UnknownSubject {
                    project: project.id.clone(),
                    subject: key.clone(),
                })
        })
        .collect()
}

/// Every scan of every experiment of the subject, in archive order.
pub fn subject_scans<S: ArchiveSession + ?Sized>(
    session: &S,
    project: &Project,
    subject: &Subject,
) -> Result<Vec<Scan>, XnatError> {
    let mut scans = Vec::new();
    for experiment in session.experiments(project, subject)? {
        scans.extend(session.scans(&experiment)?);
    }
    Ok(scans)
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// XNAT REST client. Holds a JSESSION for its whole lifetime and releases it
/// on drop.
pub struct XnatClient {
    client: Client,
    base_url: Url,
    session_id: Option<String>,
}

impl XnatClient {
    pub fn connect(
        url: &str,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<Self, XnatError> {
        let base_url = Url::parse(url.trim_end_matches('/'))
            .map_err(|err| XnatError::InvalidConfig(format!("invalid url {url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(XnatError::InvalidConfig(format!("invalid url {url}")));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("xnat-tools/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| XnatError::ArchiveHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| XnatError::ArchiveHttp(err.to_string()))?;

        let mut this = Self {
            client,
            base_url,
            session_id: None,
        };

        if let Some(credentials) = credentials {
            let url = this.endpoint(&["data", "JSESSION"], None)?;
            let response = this.send_with_retries(|| {
                this.client
                    .post(url.clone())
                    .basic_auth(&credentials.user, Some(&credentials.password))
            })?;
            let session_id = Self::handle_status(response)?
                .text()
                .map_err(|err| XnatError::ArchiveHttp(err.to_string()))?
                .trim()
                .to_string();
            if session_id.is_empty() || session_id.contains('<') {
                return Err(XnatError::ArchiveResponse(
                    "login did not return a session id".to_string(),
                ));
            }
            info!(user = %credentials.user, "logged in to XNAT");
            this.session_id = Some(session_id);
        }

        Ok(this)
    }

    fn endpoint(&self, segments: &[&str], format: Option<&str>) -> Result<Url, XnatError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| XnatError::InvalidConfig(format!("invalid url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        if let Some(format) = format {
            url.query_pairs_mut().append_pair("format", format);
        }
        Ok(url)
    }

    fn get(&self, url: &Url) -> RequestBuilder {
        let request = self.client.get(url.clone());
        match &self.session_id {
            Some(id) => request.header(COOKIE, format!("JSESSIONID={id}")),
            None => request,
        }
    }

    fn handle_status(response: Response) -> Result<Response, XnatError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "XNAT request failed".to_string());
        Err(XnatError::ArchiveStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, XnatError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, attempt, "retrying XNAT request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(error = %err, attempt, "retrying XNAT request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(XnatError::ArchiveHttp(err.to_string()));
                }
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, XnatError> {
        let url = self.endpoint(segments, Some("json"))?;
        let response = self.send_with_retries(|| self.get(&url))?;
        Self::handle_status(response)?
            .json::<T>()
            .map_err(|err| XnatError::ArchiveResponse(format!("{url}: {err}")))
    }

    fn result_set<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<Vec<T>, XnatError> {
        let envelope: ResultSetEnvelope<T> = self.get_json(segments)?;
        Ok(envelope.result_set.result)
    }
}

impl ArchiveSession for XnatClient {
    fn projects(&self) -> Result<Vec<Project>, XnatError> {
        let rows: Vec<ProjectRow> = self.result_set(&["data", "projects"])?;
        Ok(rows
            .into_iter()
            .map(|row| Project {
                id: row.id,
                name: row.name,
            })
            .collect())
    }

    fn subjects(&self, project: &Project) -> Result<Vec<Subject>, XnatError> {
        let rows: Vec<LabelledRow> =
            self.result_set(&["data", "projects", &project.id, "subjects"])?;
        Ok(rows
            .into_iter()
            .map(|row| Subject {
                id: row.id,
                label: row.label,
            })
            .collect())
    }

    fn experiments(
        &self,
        project: &Project,
        subject: &Subject,
    ) -> Result<Vec<Experiment>, XnatError> {
        let rows: Vec<LabelledRow> = self.result_set(&[
            "data",
            "projects",
            &project.id,
            "subjects",
            &subject.id,
            "experiments",
        ])?;
        Ok(rows
            .into_iter()
            .map(|row| Experiment {
                id: row.id,
                label: row.label,
            })
            .collect())
    }

    fn scans(&self, experiment: &Experiment) -> Result<Vec<Scan>, XnatError> {
        let rows: Vec<ScanRow> =
            self.result_set(&["data", "experiments", &experiment.id, "scans"])?;
        let mut scans = Vec::with_capacity(rows.len());
        for row in rows {
            let detail: ItemsEnvelope =
                self.get_json(&["data", "experiments", &experiment.id, "scans", &row.id])?;
            let mut scan = Scan::new(row.id, experiment);
            if let Some(item) = detail.items.into_iter().next() {
                for (name, value) in item.data_fields {
                    if let Some(value) = scalar_to_string(&value) {
                        scan.attributes.insert(name, value);
                    }
                }
            }
            scans.push(scan);
        }
        Ok(scans)
    }

    fn download_scan(&self, scan: &Scan, destination: &Path) -> Result<(), XnatError> {
        let url = self.endpoint(
            &[
                "data",
                "experiments",
                &scan.experiment_id,
                "scans",
                &scan.id,
                "files",
            ],
            Some("zip"),
        )?;
        let response = self
            .get(&url)
            .send()
            .map_err(|err| XnatError::ArchiveHttp(err.to_string()))?;
        let mut response = Self::handle_status(response)?;
        let mut file = File::create(destination).map_err(XnatError::fs)?;
        std::io::copy(&mut response, &mut file).map_err(XnatError::fs)?;
        Ok(())
    }
}

impl Drop for XnatClient {
    fn drop(&mut self) {
        let Some(id) = self.session_id.take() else {
            return;
        };
        let Ok(url) = self.endpoint(&["data", "JSESSION"], None) else {
            return;
        };
        let result = self
            .client
            .delete(url)
            .header(COOKIE, format!("JSESSIONID={id}"))
            .send();
        match result {
            Ok(_) => debug!("closed XNAT session"),
            Err(err) => warn!(error = %err, "failed to close XNAT session"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResultSetEnvelope<T> {
    #[serde(rename = "ResultSet")]
    result_set: ResultSet<T>,
}

#[derive(Debug, Deserialize)]
struct ResultSet<T> {
    #[serde(rename = "Result", default = "Vec::new")]
    result: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ProjectRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct LabelledRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct ScanRow {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ItemsEnvelope {
    #[serde(default)]
    items: Vec<ScanItem>,
}

#[derive(Debug, Deserialize)]
struct ScanItem {
    #[serde(default)]
    data_fields: serde_json::Map<String, Value>,
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
