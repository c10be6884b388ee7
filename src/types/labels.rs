// chronicle_core/src/types/labels.rs
//
// Labels and the canonical series identity.
//
// A series ID is the 64-bit FNV-1a hash of the label set's CANONICAL
// string form (labels sorted by name). Hashing the natural insertion
// order instead is a known failure mode: two label sets built in
// different orders get different IDs and reads cannot find their own
// writes. The canonical form is the sole hash input, always.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ChronicleError, Result};

/// Reserved label name carrying the metric identity.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single label: non-empty name, non-empty value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=\"{}\"", self.name, self.value)
    }
}

/// 64-bit FNV-1a over the canonical label string. Stable across
/// processes and runs; no per-process seed.
pub fn series_id_for(canonical: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in canonical.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// An unordered set of labels with unique names.
///
/// Equality and hashing are insensitive to insertion order: the
/// sorted canonical rendering `{a="1",b="2"}` is computed once, cached,
/// and used for both the `Display` form and the series-ID hash.
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
    // BTreeMap keeps names unique and already sorted for canonical().
    labels: BTreeMap<String, String>,
    // Cache invalidated on mutation. OnceLock keeps LabelSet Sync so
    // sealed blocks can be shared across reader threads.
    canonical: std::sync::OnceLock<String>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, value)` pairs. Later duplicates overwrite.
    pub fn from_pairs<N, V, I>(pairs: I) -> Result<Self>
    where
        N: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (N, V)>,
    {
        let mut set = Self::new();
        for (name, value) in pairs {
            set.add(name, value)?;
        }
        Ok(set)
    }

    /// Insert or overwrite a label. Empty names and values are rejected.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() {
            return Err(ChronicleError::invalid("label name must not be empty"));
        }
        if value.is_empty() {
            return Err(ChronicleError::invalid(format!(
                "label {name:?} has an empty value"
            )));
        }
        self.labels.insert(name, value);
        self.canonical = std::sync::OnceLock::new();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// The metric name (`__name__`), if present.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Iterate labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = Label> + '_ {
        self.labels
            .iter()
            .map(|(n, v)| Label::new(n.clone(), v.clone()))
    }

    /// Canonical string form: labels sorted lexicographically by name,
    /// rendered `{a="1",b="2"}`. Computed once per label set.
    pub fn canonical(&self) -> &str {
        self.canonical.get_or_init(|| {
            let mut out = String::with_capacity(2 + self.labels.len() * 16);
            out.push('{');
            for (i, (name, value)) in self.labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(value);
                out.push('"');
            }
            out.push('}');
            out
        })
    }

    /// The series ID: FNV-1a of the canonical form.
    pub fn id(&self) -> u64 {
        series_id_for(self.canonical())
    }
}

impl PartialEq for LabelSet {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
    }
}

impl Eq for LabelSet {}

impl std::hash::Hash for LabelSet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Delegate to the map's ordered contents so LabelSet hashing
        // agrees with equality regardless of insertion order.
        for (name, value) in &self.labels {
            name.hash(state);
            value.hash(state);
        }
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}
