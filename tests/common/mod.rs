#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use xnat_tools::archive::ArchiveSession;
use xnat_tools::domain::{Experiment, Project, Scan, Subject};
use xnat_tools::error::XnatError;

/// In-memory archive. Every scan downloads as a zip holding two files below a
/// nested directory.
#[derive(Default)]
pub struct MockArchive {
    projects: Vec<Project>,
    subjects: BTreeMap<String, Vec<Subject>>,
    experiments: BTreeMap<String, Vec<Experiment>>,
    scans: BTreeMap<String, Vec<Scan>>,
    failing: HashSet<String>,
    pub downloads: Mutex<Vec<String>>,
}

impl MockArchive {
    pub fn new(project: &str) -> Self {
        Self {
            projects: vec![Project {
                id: project.to_string(),
                name: format!("{project} study"),
            }],
            ..Self::default()
        }
    }

    pub fn subject(mut self, label: &str, scans: Vec<Vec<(&str, &str)>>) -> Self {
        let project = self.projects[0].id.clone();
        let subject = Subject {
            id: format!("XNAT_S_{label}"),
            label: label.to_string(),
        };
        let experiment = Experiment {
            id: format!("XNAT_E_{label}"),
            label: format!("{label}_MR1"),
        };
        let scans = scans
            .into_iter()
            .enumerate()
            .map(|(i, attributes)| {
                attributes.into_iter().fold(
                    Scan::new((i + 1).to_string(), &experiment),
                    |scan, (name, value)| scan.with_attribute(name, value),
                )
            })
            .collect();
        self.scans.insert(experiment.id.clone(), scans);
        self.experiments
            .insert(subject.id.clone(), vec![experiment]);
        self.subjects.entry(project).or_default().push(subject);
        self
    }

    /// Makes downloads of `scan_id` in the experiment of `label` fail.
    pub fn failing_download(mut self, label: &str, scan_id: &str) -> Self {
        self.failing.insert(format!("XNAT_E_{label}/{scan_id}"));
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl ArchiveSession for MockArchive {
    fn projects(&self) -> Result<Vec<Project>, XnatError> {
        Ok(self.projects.clone())
    }

    fn subjects(&self, project: &Project) -> Result<Vec<Subject>, XnatError> {
        Ok(self.subjects.get(&project.id).cloned().unwrap_or_default())
    }

    fn experiments(
        &self,
        _project: &Project,
        subject: &Subject,
    ) -> Result<Vec<Experiment>, XnatError> {
        Ok(self.experiments.get(&subject.id).cloned().unwrap_or_default())
    }

    fn scans(&self, experiment: &Experiment) -> Result<Vec<Scan>, XnatError> {
        Ok(self.scans.get(&experiment.id).cloned().unwrap_or_default())
    }

    fn download_scan(&self, scan: &Scan, destination: &Path) -> Result<(), XnatError> {
        let key = format!("{}/{}", scan.experiment_id, scan.id);
        self.downloads.lock().unwrap().push(key.clone());
        if self.failing.contains(&key) {
            return Err(XnatError::ArchiveStatus {
                status: 500,
                message: format!("cannot export {key}"),
            });
        }
        write_scan_zip(destination, &scan.id);
        Ok(())
    }
}

pub fn write_scan_zip(destination: &Path, scan_id: &str) {
    let file = File::create(destination).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for index in 1..=2 {
        zip.start_file(
            format!("{scan_id}/resources/DICOM/files/{scan_id}_{index}.dcm"),
            options,
        )
        .unwrap();
        zip.write_all(format!("scan {scan_id} slice {index}").as_bytes())
            .unwrap();
    }
    zip.finish().unwrap();
}

pub fn t1() -> Vec<(&'static str, &'static str)> {
    vec![("series_description", "T1_MPRAGE"), ("quality", "usable")]
}

pub fn t2() -> Vec<(&'static str, &'static str)> {
    vec![("series_description", "T2_SPACE"), ("quality", "usable")]
}

pub fn bad_t1() -> Vec<(&'static str, &'static str)> {
    vec![("series_description", "T1_MPRAGE"), ("quality", "bad motion")]
}
