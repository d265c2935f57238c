use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::DetectError;

/// Backend class id -> label mapping. Loaded once with the backend and
/// read-only afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassTaxonomy {
    labels: BTreeMap<u32, String>,
}

impl ClassTaxonomy {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels
                .into_iter()
                .enumerate()
                .map(|(id, label)| (id as u32, label.into()))
                .collect(),
        }
    }

    /// Read a labels file: one label per line, line number = class id.
    /// Blank lines keep their id but get the generated `class_<id>` label.
    pub fn from_labels_file(path: &Path) -> Result<Self, DetectError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DetectError::Initialization(format!(
                "failed to read labels file {}: {}",
                path.display(),
                e
            ))
        })?;
        let labels = raw
            .lines()
            .enumerate()
            .filter_map(|(id, line)| {
                let label = line.trim();
                (!label.is_empty()).then(|| (id as u32, label.to_string()))
            })
            .collect();
        Ok(Self { labels })
    }

    /// Generated `class_<id>` labels for a model without a labels file.
    pub fn numbered(class_count: u32) -> Self {
        Self {
            labels: (0..class_count).map(|id| (id, format!("class_{id}"))).collect(),
        }
    }

    pub fn label(&self, class_id: u32) -> String {
        self.labels
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn labels(&self) -> BTreeSet<String> {
        self.labels.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Substring allowlist of in-scope class labels, case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetClasses {
    terms: Vec<String>,
}

impl TargetClasses {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            terms: terms
                .into_iter()
                .map(|term| term.as_ref().trim().to_lowercase())
                .filter(|term| !term.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        self.terms.iter().any(|term| label.contains(term.as_str()))
    }
}
