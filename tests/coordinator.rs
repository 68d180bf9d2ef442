mod common;

use std::fs;
use std::path::Path;

use assert_matches::assert_matches;

use xnat_tools::archive::{ArchiveSession, find_project, resolve_subjects};
use xnat_tools::coordinator::Coordinator;
use xnat_tools::domain::Subject;
use xnat_tools::download::download_scan;
use xnat_tools::error::XnatError;
use xnat_tools::fs_util::list_files;
use xnat_tools::pool::CancelToken;
use xnat_tools::rules::{Mapping, Rule};

use common::{MockArchive, bad_t1, t1, t2};

fn t1_mapping() -> Mapping {
    Mapping::new()
        .with(
            "T1",
            Rule::patterns([("series_description", "T1")]).unwrap(),
        )
        .unwrap()
}

fn subject(archive: &MockArchive, label: &str) -> Subject {
    let project = find_project(archive, "ProjA").unwrap();
    resolve_subjects(archive, &project, Some(&[label.to_string()]))
        .unwrap()
        .remove(0)
}

fn names(dir: &Path) -> Vec<String> {
    list_files(dir)
        .unwrap()
        .iter()
        .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn mapped_subject_gets_one_tree_per_type() {
    let archive = MockArchive::new("ProjA")
        .subject("S1", vec![t1(), t2()])
        .subject("S2", vec![t2()]);
    let project = find_project(&archive, "ProjA").unwrap();
    let mapping = t1_mapping();
    let coordinator = Coordinator::new(&archive, &project).mapping(Some(&mapping));

    let temp = tempfile::tempdir().unwrap();
    let scans = coordinator
        .fetch(&subject(&archive, "S1"), temp.path())
        .unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].group, "T1");
    assert_eq!(scans[0].scan_label, "1 (T1_MPRAGE)");
    assert_eq!(scans[0].files, 2);
    assert_eq!(scans[0].path, temp.path().join("T1").join("1"));
    assert_eq!(names(&scans[0].path), vec!["1_1.dcm", "1_2.dcm"]);
    assert!(!temp.path().join("T1").join("1.zip").exists());

    let err = coordinator
        .fetch(&subject(&archive, "S2"), temp.path())
        .unwrap_err();
    assert_matches!(err, XnatError::MappingIncomplete { missing, considered } => {
        assert_eq!(missing, vec!["T1".to_string()]);
        assert_eq!(considered, vec!["1 (T2_SPACE)".to_string()]);
    });
    assert_eq!(archive.download_count(), 1);
}

#[test]
fn incomplete_subject_is_accepted_when_allowed() {
    let archive = MockArchive::new("ProjA").subject("S2", vec![t2()]);
    let project = find_project(&archive, "ProjA").unwrap();
    let mapping = t1_mapping();
    let temp = tempfile::tempdir().unwrap();

    let scans = Coordinator::new(&archive, &project)
        .mapping(Some(&mapping))
        .allow_incomplete(true)
        .fetch(&subject(&archive, "S2"), temp.path())
        .unwrap();
    assert!(scans.is_empty());
    assert_eq!(archive.download_count(), 0);
}

#[test]
fn excluded_scans_are_never_downloaded() {
    let archive = MockArchive::new("ProjA").subject("S1", vec![bad_t1(), t1()]);
    let project = find_project(&archive, "ProjA").unwrap();
    let mapping = t1_mapping();
    let exclusions = vec![Rule::patterns([("quality", "bad.*")]).unwrap()];
    let temp = tempfile::tempdir().unwrap();

    let scans = Coordinator::new(&archive, &project)
        .mapping(Some(&mapping))
        .exclusions(&exclusions)
        .fetch(&subject(&archive, "S1"), temp.path())
        .unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].scan_id, "2");
    assert!(!temp.path().join("T1").join("1").exists());
    assert_eq!(*archive.downloads.lock().unwrap(), vec!["XNAT_E_S1/2"]);
}

#[test]
fn ambiguous_type_keeps_every_match() {
    let archive = MockArchive::new("ProjA").subject("S1", vec![t1(), t1()]);
    let project = find_project(&archive, "ProjA").unwrap();
    let mapping = t1_mapping();
    let temp = tempfile::tempdir().unwrap();

    let scans = Coordinator::new(&archive, &project)
        .mapping(Some(&mapping))
        .fetch(&subject(&archive, "S1"), temp.path())
        .unwrap();
    let ids = scans.iter().map(|scan| scan.scan_id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["1", "2"]);
    assert!(temp.path().join("T1").join("2").join("2_1.dcm").exists());
}

#[test]
fn unmapped_scans_are_grouped_by_experiment() {
    let archive = MockArchive::new("ProjA").subject("S1", vec![t1(), t2()]);
    let project = find_project(&archive, "ProjA").unwrap();
    let temp = tempfile::tempdir().unwrap();

    let scans = Coordinator::new(&archive, &project)
        .fetch(&subject(&archive, "S1"), temp.path())
        .unwrap();
    assert_eq!(scans.len(), 2);
    assert!(scans.iter().all(|scan| scan.group == "XNAT_E_S1"));
    assert!(temp.path().join("XNAT_E_S1").join("2").join("2_2.dcm").exists());
}

#[test]
fn failed_download_fails_the_job() {
    let archive = MockArchive::new("ProjA")
        .subject("S1", vec![t1()])
        .failing_download("S1", "1");
    let project = find_project(&archive, "ProjA").unwrap();
    let temp = tempfile::tempdir().unwrap();

    let err = Coordinator::new(&archive, &project)
        .fetch(&subject(&archive, "S1"), temp.path())
        .unwrap_err();
    assert_matches!(err, XnatError::ArchiveStatus { status: 500, .. });
}

#[test]
fn cancelled_coordinator_downloads_nothing() {
    let archive = MockArchive::new("ProjA").subject("S1", vec![t1()]);
    let project = find_project(&archive, "ProjA").unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let temp = tempfile::tempdir().unwrap();

    let err = Coordinator::new(&archive, &project)
        .cancel_token(cancel)
        .fetch(&subject(&archive, "S1"), temp.path())
        .unwrap_err();
    assert_matches!(err, XnatError::Cancelled);
    assert_eq!(archive.download_count(), 0);
}

#[test]
fn repeated_download_leaves_the_same_files() {
    let archive = MockArchive::new("ProjA").subject("S1", vec![t1()]);
    let project = find_project(&archive, "ProjA").unwrap();
    let subject = subject(&archive, "S1");
    let experiment = archive.experiments(&project, &subject).unwrap().remove(0);
    let scan = archive.scans(&experiment).unwrap().remove(0);
    let temp = tempfile::tempdir().unwrap();
    let target = temp.path().join("T1").join("1");

    let first = download_scan(&archive, &scan, &target).unwrap();
    let second = download_scan(&archive, &scan, &target).unwrap();
    assert_eq!(first, second);
    assert_eq!(names(&target), vec!["1_1.dcm", "1_2.dcm"]);
    assert_eq!(
        fs::read_to_string(target.join("1_2.dcm")).unwrap(),
        "scan 1 slice 2"
    );
    assert!(!temp.path().join("T1").join("1.zip").exists());
}
