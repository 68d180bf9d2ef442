use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::Scan;
use crate::error::XnatError;
use crate::rules::{Mapping, Rule, is_excluded};

#[derive(Debug, Clone, Serialize)]
pub struct ScanBucket {
    pub key: String,
    pub scans: Vec<Scan>,
}

/// More than one scan matched a single scan type. All matches are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ambiguity {
    pub key: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappedScans {
    /// One bucket per mapping key, in mapping order.
    pub buckets: Vec<ScanBucket>,
    /// Labels of every scan that survived the exclusions.
    pub considered: Vec<String>,
    pub ambiguous: Vec<Ambiguity>,
    pub missing: Vec<String>,
}

impl MappedScans {
    pub fn get(&self, key: &str) -> Option<&[Scan]> {
        self.buckets
            .iter()
            .find(|bucket| bucket.key == key)
            .map(|bucket| bucket.scans.as_slice())
    }
}

/// Buckets the scans of one subject by scan type.
///
/// Scans are visited in archive order. A scan that matches any exclusion is
/// dropped before mapping and does not count towards completeness. A scan
/// may land in several buckets. Empty buckets fail the resolution unless
/// `allow_incomplete` is set, in which case they are only reported.
pub fn resolve<I>(
    scans: I,
    mapping: &Mapping,
    exclusions: &[Rule],
    allow_incomplete: bool,
) -> Result<MappedScans, XnatError>
where
    I: IntoIterator<Item = Scan>,
{
    let mut buckets = mapping
        .keys()
        .map(|key| ScanBucket {
            key: key.to_string(),
            scans: Vec::new(),
        })
        .collect::<Vec<_>>();
    let mut considered = Vec::new();

    for scan in scans {
        if is_excluded(&scan, exclusions)? {
            debug!(scan = %scan.label(), "excluding scan");
            continue;
        }

        considered.push(scan.label());
        for (bucket, (_, rule)) in buckets.iter_mut().zip(mapping.iter()) {
            if rule.matches(&scan)? {
                bucket.scans.push(scan.clone());
            }
        }
    }

    let ambiguous = buckets
        .iter()
        .filter(|bucket| bucket.scans.len() > 1)
        .map(|bucket| Ambiguity {
            key: bucket.key.clone(),
            labels: bucket.scans.iter().map(Scan::label).collect(),
        })
        .collect::<Vec<_>>();
    for ambiguity in &ambiguous {
        warn!(
            key = %ambiguity.key,
            matches = ?ambiguity.labels,
            "multiple scans match one scan type"
        );
    }

    let missing = buckets
        .iter()
        .filter(|bucket| bucket.scans.is_empty())
        .map(|bucket| bucket.key.clone())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        if !allow_incomplete {
            return Err(XnatError::MappingIncomplete {
                missing,
                considered,
            });
        }
        warn!(missing = ?missing, considered = ?considered, "mapping incomplete");
    }

    Ok(MappedScans {
        buckets,
        considered,
        ambiguous,
        missing,
    })
}

/// The unmapped path: every scan that no exclusion rule matches.
pub fn filter_excluded<I>(scans: I, exclusions: &[Rule]) -> Result<Vec<Scan>, XnatError>
where
    I: IntoIterator<Item = Scan>,
{
    let mut kept = Vec::new();
    for scan in scans {
        if is_excluded(&scan, exclusions)? {
            debug!(scan = %scan.label(), "excluding scan");
            continue;
        }
        kept.push(scan);
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::Experiment;

    fn scan(id: &str, description: &str, quality: &str) -> Scan {
        let experiment = Experiment {
            id: "E1".to_string(),
            label: "MR1".to_string(),
        };
        Scan::new(id, &experiment)
            .with_attribute("series_description", description)
            .with_attribute("quality", quality)
    }

    fn t1_mapping() -> Mapping {
        Mapping::new()
            .with(
                "T1",
                Rule::patterns([("series_description", "T1.*")]).unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn every_key_gets_a_bucket() {
        let mapping = t1_mapping()
            .with(
                "FLAIR",
                Rule::patterns([("series_description", "FLAIR")]).unwrap(),
            )
            .unwrap();
        let scans = vec![scan("1", "T1_MPRAGE", "usable")];
        let mapped = resolve(scans, &mapping, &[], true).unwrap();
        assert_eq!(mapped.buckets.len(), 2);
        assert_eq!(mapped.get("T1").unwrap().len(), 1);
        assert!(mapped.get("FLAIR").unwrap().is_empty());
        assert_eq!(mapped.missing, vec!["FLAIR".to_string()]);
    }

    #[test]
    fn incomplete_mapping_is_fatal_when_not_allowed() {
        let scans = vec![scan("1", "FLAIR", "usable"), scan("2", "DWI", "usable")];
        let err = resolve(scans, &t1_mapping(), &[], false).unwrap_err();
        assert_matches!(
            err,
            XnatError::MappingIncomplete { ref missing, ref considered }
                if missing == &["T1".to_string()]
                    && considered == &["1 (FLAIR)".to_string(), "2 (DWI)".to_string()]
        );
    }

    #[test]
    fn exclusion_wins_over_mapping() {
        let exclusions = vec![Rule::patterns([("quality", "bad.*")]).unwrap()];
        let scans = vec![scan("1", "T1_MPRAGE", "bad_scan")];
        let mapped = resolve(scans, &t1_mapping(), &exclusions, true).unwrap();
        assert!(mapped.get("T1").unwrap().is_empty());
        assert!(mapped.considered.is_empty());
    }

    #[test]
    fn ambiguous_matches_are_reported_and_kept() {
        let scans = vec![
            scan("1", "T1_MPRAGE", "usable"),
            scan("2", "T1_SE", "usable"),
        ];
        let mapped = resolve(scans, &t1_mapping(), &[], false).unwrap();
        assert_eq!(mapped.get("T1").unwrap().len(), 2);
        assert_eq!(
            mapped.ambiguous,
            vec![Ambiguity {
                key: "T1".to_string(),
                labels: vec!["1 (T1_MPRAGE)".to_string(), "2 (T1_SE)".to_string()],
            }]
        );
    }

    #[test]
    fn one_scan_can_fill_several_buckets() {
        let mapping = t1_mapping()
            .with("ANY", Rule::patterns([("quality", "usable")]).unwrap())
            .unwrap();
        let mapped = resolve(vec![scan("1", "T1", "usable")], &mapping, &[], false).unwrap();
        assert_eq!(mapped.get("T1").unwrap()[0].id, "1");
        assert_eq!(mapped.get("ANY").unwrap()[0].id, "1");
    }

    #[test]
    fn filter_drops_excluded_scans() {
        let exclusions = vec![Rule::patterns([("quality", "bad.*")]).unwrap()];
        let kept = filter_excluded(
            vec![scan("1", "T1", "bad_scan"), scan("2", "T2", "usable")],
            &exclusions,
        )
        .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "2");
    }
}
