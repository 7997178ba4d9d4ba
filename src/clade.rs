//! Clades and splits.
//!
//! A [`Clade`] is a taxon bitset plus a [`CladeTag`]. Plain CCDs leave the tag
//! at [`CladeTag::None`]; the transmission-tree variant uses it to keep
//! structurally identical taxon sets with different infection histories apart.

use std::cmp::Ordering;
use std::fmt;

use crate::bitset::Bitset;
use crate::taxa::TaxonRegistry;

/// Opaque identity extension carried next to the taxon bitset.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CladeTag {
    #[default]
    None,
    /// Whether the branch above the clade carries a transmission block
    Block(bool),
    /// Label of the host the clade's lineage was infected by
    Ancestor(String),
}

impl fmt::Display for CladeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CladeTag::None => Ok(()),
            CladeTag::Block(has_block) => write!(f, "block={has_block}"),
            CladeTag::Ancestor(label) => write!(f, "ancestor={label}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Clade {
    pub taxa: Bitset,
    pub tag: CladeTag,
}

impl Clade {
    pub fn new(taxa: Bitset) -> Self {
        Clade { taxa, tag: CladeTag::None }
    }

    pub fn with_tag(taxa: Bitset, tag: CladeTag) -> Self {
        Clade { taxa, tag }
    }

    /// Number of taxa in the clade.
    pub fn len(&self) -> usize {
        self.taxa.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty()
    }

    pub fn is_leaf(&self) -> bool {
        self.len() == 1
    }

    /// Fewer taxa first, then ascending member sequence, then tag.
    pub fn tie_order(&self, other: &Clade) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then_with(|| self.taxa.cmp_members(&other.taxa))
            .then_with(|| self.tag.cmp(&other.tag))
    }

    pub fn describe(&self, registry: &TaxonRegistry) -> String {
        match self.tag {
            CladeTag::None => registry.describe(&self.taxa),
            _ => format!("{}[{}]", registry.describe(&self.taxa), self.tag),
        }
    }
}

/// The partition of a parent clade into its two children.
///
/// Stored canonically: `left` holds the smallest taxon index of the parent,
/// so `(A,B)` and `(B,A)` are the same split.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Split {
    pub left: Clade,
    pub right: Clade,
}

impl Split {
    pub fn new(a: Clade, b: Clade) -> Self {
        if a.taxa.first_one() <= b.taxa.first_one() {
            Split { left: a, right: b }
        } else {
            Split { left: b, right: a }
        }
    }

    /// Union of both sides' taxa.
    pub fn parent_taxa(&self) -> Bitset {
        self.left.taxa.union(&self.right.taxa)
    }

    /// The side with fewer taxa (ties by member order).
    pub fn smaller(&self) -> &Clade {
        Self::smaller_of(&self.left, &self.right)
    }

    /// Same as [`Split::smaller`] on two loose sides.
    pub fn smaller_of<'c>(a: &'c Clade, b: &'c Clade) -> &'c Clade {
        if a.tie_order(b) == Ordering::Greater { b } else { a }
    }
}
