use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
}

impl Project {
    /// Projects are addressed by either their XNAT id or their display name.
    pub fn is_named(&self, key: &str) -> bool {
        self.id == key || self.name == key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Subject {
    pub id: String,
    pub label: String,
}

impl Subject {
    pub fn is_named(&self, key: &str) -> bool {
        self.id == key || self.label == key
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Experiment {
    pub id: String,
    pub label: String,
}

/// One imaging series. Attribute values are kept as the archive renders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scan {
    pub id: String,
    pub experiment_id: String,
    pub experiment_label: String,
    pub attributes: BTreeMap<String, String>,
}

impl Scan {
    pub fn new(id: impl Into<String>, experiment: &Experiment) -> Self {
        Self {
            id: id.into(),
            experiment_id: experiment.id.clone(),
            experiment_label: experiment.label.clone(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Missing attributes read as the empty string.
    pub fn attribute(&self, name: &str) -> &str {
        self.attributes.get(name).map(String::as_str).unwrap_or("")
    }

    /// Human readable name used in diagnostics, e.g. `3 (T1_MPRAGE)`.
    pub fn label(&self) -> String {
        match self.attributes.get("series_description") {
            Some(description) => format!("{} ({description})", self.id),
            None => self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment() -> Experiment {
        Experiment {
            id: "XNAT_E00001".to_string(),
            label: "MR1".to_string(),
        }
    }

    #[test]
    fn scan_label_includes_series_description() {
        let scan = Scan::new("3", &experiment()).with_attribute("series_description", "T1_MPRAGE");
        assert_eq!(scan.label(), "3 (T1_MPRAGE)");

        let bare = Scan::new("4", &experiment());
        assert_eq!(bare.label(), "4");
    }

    #[test]
    fn missing_attribute_is_empty() {
        let scan = Scan::new("3", &experiment());
        assert_eq!(scan.attribute("quality"), "");
    }

    #[test]
    fn subject_matches_id_or_label() {
        let subject = Subject {
            id: "XNAT_S00001".to_string(),
            label: "patient01".to_string(),
        };
        assert!(subject.is_named("XNAT_S00001"));
        assert!(subject.is_named("patient01"));
        assert!(!subject.is_named("patient02"));
    }
}
