use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use tracing::info;

use crate::archive::{ArchiveSession, find_project, resolve_subjects, subject_scans};
use crate::domain::Scan;
use crate::error::XnatError;
use crate::resolver::{filter_excluded, resolve};
use crate::rules::{Mapping, Rule};

/// Distinct values seen per attribute.
pub type AttributeValues = BTreeMap<String, BTreeSet<String>>;

/// Aggregated scan metadata, keyed by scan type when a mapping is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataSummary {
    Mapped(Vec<(String, AttributeValues)>),
    Flat(AttributeValues),
}

impl MetadataSummary {
    pub fn values(&self, key: Option<&str>) -> Option<&AttributeValues> {
        match (self, key) {
            (MetadataSummary::Flat(values), None) => Some(values),
            (MetadataSummary::Mapped(groups), Some(key)) => groups
                .iter()
                .find(|(group, _)| group == key)
                .map(|(_, values)| values),
            _ => None,
        }
    }
}

impl Serialize for MetadataSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetadataSummary::Flat(values) => values.serialize(serializer),
            MetadataSummary::Mapped(groups) => {
                let mut map = serializer.serialize_map(Some(groups.len()))?;
                for (key, values) in groups {
                    map.serialize_entry(key, values)?;
                }
                map.end()
            }
        }
    }
}

fn add_scan(values: &mut AttributeValues, scan: &Scan) {
    for (attribute, value) in &scan.attributes {
        values
            .entry(attribute.clone())
            .or_default()
            .insert(value.clone());
    }
}

/// Collects every attribute value of the selected scans without downloading
/// anything. Mapped scan types tolerate subjects with missing types.
pub fn collect_metadata<S: ArchiveSession + ?Sized>(
    session: &S,
    project: &str,
    subjects: Option<&[String]>,
    mapping: Option<&Mapping>,
    exclusions: &[Rule],
) -> Result<MetadataSummary, XnatError> {
    let project = find_project(session, project)?;
    let subjects = resolve_subjects(session, &project, subjects)?;
    let mut grouped = mapping
        .map(|mapping| {
            mapping
                .keys()
                .map(|key| (key.to_string(), AttributeValues::new()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let mut flat = AttributeValues::new();

    let total = subjects.len();
    for (i, subject) in subjects.iter().enumerate() {
        info!("Adding data for subject {} ({}/{})", subject.label, i + 1, total);
        let scans = subject_scans(session, &project, subject)?;

        if let Some(mapping) = mapping {
            let mapped = resolve(scans, mapping, exclusions, true)?;
            for ((_, values), bucket) in grouped.iter_mut().zip(&mapped.buckets) {
                for scan in &bucket.scans {
                    add_scan(values, scan);
                }
            }
        } else {
            for scan in filter_excluded(scans, exclusions)? {
                add_scan(&mut flat, &scan);
            }
        }
    }

    Ok(match mapping {
        Some(_) => MetadataSummary::Mapped(grouped),
        None => MetadataSummary::Flat(flat),
    })
}
