//! Taxon registry: the stable bijection between leaf labels and bit positions.
//!
//! Node IDs are assigned during tree parsing and differ across trees; taxon
//! names are consistent. Labels are sorted alphabetically so identical taxa
//! always map to the same bit positions, no matter which tree the registry was
//! derived from.

use std::collections::HashMap;

use itertools::Itertools;
use phylotree::tree::Tree as PhyloTree;

use crate::bitset::Bitset;
use crate::error::{CcdError, Result};

/// Immutable label ↔ index mapping shared by every clade of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonRegistry {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl TaxonRegistry {
    /// Build a registry from a set of labels.
    ///
    /// Labels are sorted and must be unique.
    ///
    /// # Errors
    /// `TaxonSetMismatch` for an empty label set or duplicate labels.
    pub fn from_labels<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(CcdError::mismatch("taxon registry needs at least one label"));
        }
        labels.sort();
        if let Some(dup) = labels.windows(2).find(|w| w[0] == w[1]) {
            return Err(CcdError::mismatch(format!("duplicate taxon label '{}'", dup[0])));
        }

        let index = labels
            .iter()
            .enumerate()
            .map(|(idx, label)| (label.clone(), idx))
            .collect();

        Ok(TaxonRegistry { labels, index })
    }

    /// Derive the registry from the leaf labels of a reference tree
    /// (usually the first tree kept after burn-in).
    pub fn from_tree(tree: &PhyloTree) -> Result<Self> {
        let mut labels = Vec::new();
        for leaf_id in tree.get_leaves() {
            let name = tree
                .get(&leaf_id)?
                .name
                .clone()
                .ok_or_else(|| CcdError::mismatch(format!("leaf node {leaf_id} has no label")))?;
            labels.push(name);
        }
        Self::from_labels(labels)
    }

    /// Number of taxa in the universe.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of u64 words every clade bitset of this run uses.
    pub fn words(&self) -> usize {
        self.labels.len().div_ceil(64)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// The root clade's taxon set.
    pub fn universe(&self) -> Bitset {
        Bitset::full(self.labels.len())
    }

    /// Encode a set of labels as a bitset.
    ///
    /// # Errors
    /// `TaxonSetMismatch` if a label is not part of the registry.
    pub fn encode<'a, I>(&self, labels: I) -> Result<Bitset>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut bits = Bitset::zeros(self.words());
        for label in labels {
            let idx = self
                .index_of(label)
                .ok_or_else(|| CcdError::mismatch(format!("unknown taxon '{label}'")))?;
            bits.set(idx);
        }
        Ok(bits)
    }

    /// Render a taxon set as `{A,B,C}` for messages and tables.
    pub fn describe(&self, bits: &Bitset) -> String {
        format!("{{{}}}", bits.ones().filter_map(|idx| self.label(idx)).join(","))
    }
}
