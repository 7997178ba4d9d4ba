//! Crate-wide error type built on `thiserror`.
//!
//! Decomposition errors (`TaxonSetMismatch`, `MalformedTree`) reject a single
//! tree; query errors (`IncompleteClade`, `EmptyDistribution`,
//! `UnsupportedVariant`) fail a single MAP or probability query. None of them
//! leave the distribution in a modified state.

use phylotree::tree::TreeError;
use thiserror::Error;

use crate::ccd::Variant;

#[derive(Error, Debug)]
pub enum CcdError {
    /// Leaf labels of a tree differ from the registry's taxon universe
    #[error("Taxon set mismatch: {message}")]
    TaxonSetMismatch { message: String },

    /// Internal node without exactly two children, or a single-node tree
    #[error("Malformed tree: {message}")]
    MalformedTree { message: String },

    /// Mutation attempted after `finalize`
    #[error("Distribution is frozen, no further trees can be ingested")]
    FrozenDistribution,

    /// A non-leaf clade reached by the MAP search has no recorded split
    #[error("Clade {clade} has no recorded split under its context")]
    IncompleteClade { clade: String },

    #[error("No trees have been ingested into the distribution")]
    EmptyDistribution,

    #[error("{variant} does not support {operation}")]
    UnsupportedVariant {
        variant: Variant,
        operation: &'static str,
    },

    /// Errors reported by `phylotree` while walking a parsed tree
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No trees left in {source_name} after burn-in removal")]
    NoTrees { source_name: String },

    #[error("Burn-in fraction must lie in [0, 1), got {0}")]
    InvalidBurnin(f64),
}

/// Type alias for Results using CcdError
pub type Result<T> = std::result::Result<T, CcdError>;

impl CcdError {
    /// Create a taxon set mismatch error
    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::TaxonSetMismatch {
            message: message.into(),
        }
    }

    /// Create a malformed tree error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedTree {
            message: message.into(),
        }
    }

    pub fn unsupported(variant: Variant, operation: &'static str) -> Self {
        Self::UnsupportedVariant { variant, operation }
    }

    /// True for errors that only reject the offending input tree.
    pub fn is_tree_rejection(&self) -> bool {
        matches!(
            self,
            Self::TaxonSetMismatch { .. } | Self::MalformedTree { .. } | Self::Tree(_)
        )
    }
}
