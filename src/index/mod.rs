// chronicle_core/src/index/mod.rs
//
// Inverted label index: (name, value) -> posting list of series IDs,
// plus the name/value enumerations behind the label metadata
// endpoints.
//
// Matcher resolution: Eq and Regex matchers build the candidate set
// (intersection of postings / unions over a name's values); NotEq and
// NotRegex filter it. With no positive matcher the candidate set is
// every indexed series. Intersection and filtering commute, so the
// result is independent of matcher order.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::RwLock;
use regex::Regex;

use crate::error::{ChronicleError, Result};
use crate::types::LabelSet;

/// A predicate over one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// `name == value`
    Eq(String, String),
    /// `name != value`
    NotEq(String, String),
    /// value of `name` matches the anchored pattern
    Regex(String, String),
    /// value of `name` does not match the anchored pattern
    NotRegex(String, String),
}

impl Matcher {
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq(name.into(), value.into())
    }

    pub fn not_eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::NotEq(name.into(), value.into())
    }

    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Regex(name.into(), pattern.into())
    }

    pub fn not_regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::NotRegex(name.into(), pattern.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Eq(n, _) | Self::NotEq(n, _) | Self::Regex(n, _) | Self::NotRegex(n, _) => n,
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(n, v) => write!(f, "{n}=\"{v}\""),
            Self::NotEq(n, v) => write!(f, "{n}!=\"{v}\""),
            Self::Regex(n, p) => write!(f, "{n}=~\"{p}\""),
            Self::NotRegex(n, p) => write!(f, "{n}!~\"{p}\""),
        }
    }
}

/// Compile a matcher pattern fully anchored, the Prometheus
/// convention: `a|b` matches exactly "a" or "b", never "ab".
fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
        ChronicleError::invalid(format!("bad matcher pattern {pattern:?}: {e}"))
    })
}

#[derive(Default)]
struct IndexInner {
    postings: HashMap<(String, String), BTreeSet<u64>>,
    values: HashMap<String, BTreeSet<String>>,
    all: BTreeSet<u64>,
}

/// Process-wide (engine-scoped) inverted index.
#[derive(Default)]
pub struct LabelIndex {
    inner: RwLock<IndexInner>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `series_id` under every label of `labels`.
    pub fn insert(&self, series_id: u64, labels: &LabelSet) {
        let mut inner = self.inner.write();
        inner.all.insert(series_id);
        for label in labels.iter() {
            inner
                .postings
                .entry((label.name.clone(), label.value.clone()))
                .or_default()
                .insert(series_id);
            inner
                .values
                .entry(label.name)
                .or_default()
                .insert(label.value);
        }
    }

    /// Inverse of `insert`. Empty postings and value sets are pruned
    /// so the enumerations never surface dead entries.
    pub fn remove(&self, series_id: u64, labels: &LabelSet) {
        let mut inner = self.inner.write();
        inner.all.remove(&series_id);
        for label in labels.iter() {
            let key = (label.name, label.value);
            let emptied = match inner.postings.get_mut(&key) {
                Some(ids) => {
                    ids.remove(&series_id);
                    ids.is_empty()
                }
                None => false,
            };
            if emptied {
                inner.postings.remove(&key);
                let (name, value) = key;
                if let Some(values) = inner.values.get_mut(&name) {
                    values.remove(&value);
                    if values.is_empty() {
                        inner.values.remove(&name);
                    }
                }
            }
        }
    }

    /// Resolve matchers to the set of matching series IDs.
    pub fn matches(&self, matchers: &[Matcher]) -> Result<BTreeSet<u64>> {
        let inner = self.inner.read();

        // Positive matchers narrow the candidate set.
        let mut candidates: Option<BTreeSet<u64>> = None;
        let narrow = |candidates: &mut Option<BTreeSet<u64>>, ids: BTreeSet<u64>| {
            *candidates = Some(match candidates.take() {
                None => ids,
                Some(prev) => prev.intersection(&ids).copied().collect(),
            });
        };

        for matcher in matchers {
            match matcher {
                Matcher::Eq(name, value) => {
                    let ids = inner
                        .postings
                        .get(&(name.clone(), value.clone()))
                        .cloned()
                        .unwrap_or_default();
                    narrow(&mut candidates, ids);
                }
                Matcher::Regex(name, pattern) => {
                    let re = compile_anchored(pattern)?;
                    let mut ids = BTreeSet::new();
                    if let Some(values) = inner.values.get(name) {
                        for value in values {
                            if re.is_match(value) {
                                if let Some(posting) =
                                    inner.postings.get(&(name.clone(), value.clone()))
                                {
                                    ids.extend(posting);
                                }
                            }
                        }
                    }
                    narrow(&mut candidates, ids);
                }
                Matcher::NotEq(..) | Matcher::NotRegex(..) => {}
            }
        }

        let mut result = candidates.unwrap_or_else(|| inner.all.clone());

        // Negative matchers filter it.
        for matcher in matchers {
            match matcher {
                Matcher::NotEq(name, value) => {
                    if let Some(ids) = inner.postings.get(&(name.clone(), value.clone())) {
                        for id in ids {
                            result.remove(id);
                        }
                    }
                }
                Matcher::NotRegex(name, pattern) => {
                    let re = compile_anchored(pattern)?;
                    if let Some(values) = inner.values.get(name) {
                        for value in values {
                            if re.is_match(value) {
                                if let Some(ids) =
                                    inner.postings.get(&(name.clone(), value.clone()))
                                {
                                    for id in ids {
                                        result.remove(id);
                                    }
                                }
                            }
                        }
                    }
                }
                Matcher::Eq(..) | Matcher::Regex(..) => {}
            }
        }

        Ok(result)
    }

    /// All indexed label names, sorted.
    pub fn label_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.values.keys().cloned().collect();
        names.sort();
        names
    }

    /// All values indexed under `name`, sorted. Unknown names yield an
    /// empty list, not an error.
    pub fn label_values(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .values
            .get(name)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of indexed series.
    pub fn series_count(&self) -> usize {
        self.inner.read().all.len()
    }
}
