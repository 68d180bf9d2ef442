use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use crate::domain::Scan;
use crate::error::XnatError;

pub type ScanPredicate = dyn Fn(&Scan) -> Result<bool, XnatError> + Send + Sync;

/// A scan selection rule: either conjunctive attribute patterns from the
/// config file, or an arbitrary predicate supplied through the library API.
#[derive(Clone)]
pub enum Rule {
    Pattern(PatternRule),
    Predicate(Arc<ScanPredicate>),
}

impl Rule {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Scan) -> Result<bool, XnatError> + Send + Sync + 'static,
    {
        Rule::Predicate(Arc::new(f))
    }

    pub fn patterns<I, K, V>(entries: I) -> Result<Self, XnatError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        PatternRule::new(entries).map(Rule::Pattern)
    }

    pub fn matches(&self, scan: &Scan) -> Result<bool, XnatError> {
        match self {
            Rule::Pattern(rule) => Ok(rule.matches(scan)),
            Rule::Predicate(f) => f(scan),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Pattern(rule) => f.debug_tuple("Pattern").field(rule).finish(),
            Rule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        PatternRule::deserialize(deserializer).map(Rule::Pattern)
    }
}

#[derive(Debug, Clone)]
struct AttributePattern {
    attribute: String,
    regex: Regex,
}

/// Attribute name to regular expression. Patterns are anchored at the start
/// of the value only, so `T1` matches `T1_MPRAGE`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>")]
pub struct PatternRule {
    patterns: Vec<AttributePattern>,
}

impl PatternRule {
    pub fn new<I, K, V>(entries: I) -> Result<Self, XnatError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let patterns = entries
            .into_iter()
            .map(|(attribute, pattern)| {
                let attribute = attribute.into();
                let regex = Regex::new(&format!("^(?:{})", pattern.as_ref())).map_err(|err| {
                    XnatError::InvalidPattern {
                        attribute: attribute.clone(),
                        message: err.to_string(),
                    }
                })?;
                Ok(AttributePattern { attribute, regex })
            })
            .collect::<Result<Vec<_>, XnatError>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, scan: &Scan) -> bool {
        self.patterns
            .iter()
            .all(|p| p.regex.is_match(scan.attribute(&p.attribute)))
    }
}

impl TryFrom<BTreeMap<String, String>> for PatternRule {
    type Error = XnatError;

    fn try_from(value: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        PatternRule::new(value)
    }
}

pub type Exclusions = Vec<Rule>;

/// Ordered scan type label to rule table. Keys are unique.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: Vec<(String, Rule)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, rule: Rule) -> Result<(), XnatError> {
        let key = key.into();
        if self.entries.iter().any(|(existing, _)| *existing == key) {
            return Err(XnatError::InvalidConfig(format!(
                "duplicate mapping key: {key}"
            )));
        }
        self.entries.push((key, rule));
        Ok(())
    }

    pub fn with(mut self, key: impl Into<String>, rule: Rule) -> Result<Self, XnatError> {
        self.insert(key, rule)?;
        Ok(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.entries.iter().map(|(key, rule)| (key.as_str(), rule))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'de> Deserialize<'de> for Mapping {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = Mapping;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping scan types to attribute patterns")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut mapping = Mapping::new();
                while let Some((key, rule)) = access.next_entry::<String, Rule>()? {
                    mapping.insert(key, rule).map_err(de::Error::custom)?;
                }
                Ok(mapping)
            }
        }

        deserializer.deserialize_map(MappingVisitor)
    }
}

pub fn match_scan(scan: &Scan, rule: &Rule) -> Result<bool, XnatError> {
    rule.matches(scan)
}

pub fn is_excluded(scan: &Scan, exclusions: &[Rule]) -> Result<bool, XnatError> {
    for rule in exclusions {
        if rule.matches(scan)? {
            return Ok(true);
        }
    }
    Ok(false)
}
