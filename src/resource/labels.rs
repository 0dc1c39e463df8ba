// SPDX-License-Identifier: MIT OR Apache-2.0

//! Labels, annotations and label queries.
//!
//! Labels are queryable key/value pairs; annotations share the same shape
//! but are never queried. Queries support equality and existence terms only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered string→string map used for both labels and annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Create an empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a label, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove a label. Returns the previous value, if any.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Get a label value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Check whether a key is present, regardless of value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A single query term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelTerm {
    /// The key must be present with exactly this value.
    Equals(String, String),
    /// The key must be present with any value.
    Exists(String),
}

impl LabelTerm {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            LabelTerm::Equals(key, value) => labels.get(key) == Some(value.as_str()),
            LabelTerm::Exists(key) => labels.contains(key),
        }
    }
}

/// A conjunction of label terms. An empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQuery {
    terms: Vec<LabelTerm>,
}

impl LabelQuery {
    /// Create a query that matches every resource.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Require key = value.
    #[must_use]
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Equals(key.into(), value.into()));
        self
    }

    /// Require key to exist.
    #[must_use]
    pub fn has(mut self, key: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Exists(key.into()));
        self
    }

    /// Evaluate the query against a label set.
    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        self.terms.iter().all(|t| t.matches(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_set_get() {
        let mut labels = Labels::new();
        labels.set("cluster", "c1");
        assert_eq!(labels.get("cluster"), Some("c1"));
        assert!(labels.contains("cluster"));
        assert!(!labels.contains("machine-set"));

        labels.set("cluster", "c2");
        assert_eq!(labels.get("cluster"), Some("c2"));
        assert_eq!(labels.len(), 1);

        assert_eq!(labels.remove("cluster"), Some("c2".to_string()));
        assert!(labels.is_empty());
    }

    #[test]
    fn test_query_empty_matches_all() {
        let labels: Labels = [("a", "1")].into_iter().collect();
        assert!(LabelQuery::all().matches(&labels));
        assert!(LabelQuery::all().matches(&Labels::new()));
    }

    #[test]
    fn test_query_terms() {
        let labels: Labels = [("cluster", "c1"), ("role", "worker")].into_iter().collect();

        assert!(LabelQuery::all().eq("cluster", "c1").matches(&labels));
        assert!(!LabelQuery::all().eq("cluster", "c2").matches(&labels));
        assert!(LabelQuery::all().has("role").matches(&labels));
        assert!(!LabelQuery::all().has("locked").matches(&labels));
        assert!(LabelQuery::all()
            .eq("cluster", "c1")
            .has("role")
            .matches(&labels));
        assert!(!LabelQuery::all()
            .eq("cluster", "c1")
            .has("locked")
            .matches(&labels));
    }
}
