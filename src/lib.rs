//! Crate root: module orchestration and public re-exports.
//!
//! Modules:
//! - `taxa`: label ↔ bit-position registry shared by a run.
//! - `bitset`, `clade`: canonical clade encoding and splits.
//! - `decompose`: one rooted binary tree → post-order clade/split observations.
//! - `store`: clade id arena with per-clade counts; partial stores merge.
//! - `ccd`: variants (CCD0/1/2, tCCD), builder and the frozen distribution.
//! - `map`: memoized MAP-tree search.
//! - `sample`: drawing trees from a distribution.
//! - `transmission`: block and ancestry tags for transmission trees.
//! - `io`: reading BEAST/NEXUS tree files, writing NEXUS and TSV output.
//! - `error`: crate error type.
//! - `api`: Python bindings via `pyo3` (gated behind "python" feature).

pub mod bitset;
pub mod ccd;
pub mod clade;
pub mod decompose;
pub mod error;
pub mod io;
pub mod map;
pub mod sample;
pub mod store;
pub mod taxa;
pub mod transmission;

#[cfg(feature = "python")]
pub mod api;

// Re-export frequently used types & functions
pub use bitset::Bitset;
pub use ccd::{
    BuildOutcome, CcdBuilder, ConditionalCladeDistribution, Variant, build_distribution,
    build_from_files, build_from_sample,
};
pub use clade::{Clade, CladeTag, Split};
pub use decompose::{Decomposition, TopologyGroup, TreeDecomposer};
pub use error::{CcdError, Result};
pub use io::{ReadOptions, read_beast_trees, write_clade_table_tsv, write_map_nexus};
pub use map::{MapTree, map_tree};
pub use taxa::TaxonRegistry;
