//! Compact bitset representation for taxon sets (clades).
//!
//! # Overview
//! A bitset is an efficient way to represent which taxa belong to a clade.
//! Each bit position corresponds to a taxon index handed out by the
//! [`TaxonRegistry`](crate::taxa::TaxonRegistry).
//!
//! # Example
//! For a sample with taxa [A, B, C, D] mapped to indices [0, 1, 2, 3]:
//! - Clade {A, C} → bitset `0b0101` (bits 0 and 2 set)
//! - Clade {B, C, D} → bitset `0b1110` (bits 1, 2, 3 set)

use std::cmp::Ordering;

/// A compact bitset for representing which taxa belong to a clade.
///
/// Internally stores bits in `Vec<u64>` words to support arbitrarily large trees.
/// Each u64 word holds 64 taxon indices. All bitsets of one run share the same
/// word count, so the derived `Eq`/`Hash`/`Ord` are consistent map keys.
///
/// # Memory efficiency
/// - Traditional HashSet<usize>: ~24 bytes per element + overhead
/// - Bitset: 1 bit per possible element (8 bytes per 64 taxa)
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset(pub Vec<u64>);

impl Bitset {
    /// Creates a new bitset with all bits set to 0.
    ///
    /// # Parameters
    /// - `words`: Number of u64 words needed. Calculate as `num_taxa.div_ceil(64)`
    ///
    /// # Example
    /// ```
    /// # use rust_python_ccd::bitset::Bitset;
    /// // For a sample with 100 taxa, need 2 words (128 bits)
    /// let bs = Bitset::zeros(2);
    /// assert_eq!(bs.0.len(), 2);
    /// ```
    pub fn zeros(words: usize) -> Self {
        Bitset(vec![0u64; words])
    }

    /// Creates the bitset with the first `n` bits set: the full taxon universe.
    ///
    /// # Example
    /// ```
    /// # use rust_python_ccd::bitset::Bitset;
    /// let all = Bitset::full(70);
    /// assert_eq!(all.count_ones(), 70);
    /// assert_eq!(all.0.len(), 2);
    /// ```
    pub fn full(n: usize) -> Self {
        let mut bs = Bitset::zeros(n.div_ceil(64));
        for (w, word) in bs.0.iter_mut().enumerate() {
            let remaining = n - w * 64;
            *word = if remaining >= 64 { u64::MAX } else { (1u64 << remaining) - 1 };
        }
        bs
    }

    /// Encodes a subset of taxon indices.
    ///
    /// # Example
    /// ```
    /// # use rust_python_ccd::bitset::Bitset;
    /// let bs = Bitset::from_indices(1, [0, 2]);
    /// assert_eq!(bs.0[0], 0b101);
    /// ```
    pub fn from_indices<I: IntoIterator<Item = usize>>(words: usize, indices: I) -> Self {
        let mut bs = Bitset::zeros(words);
        for idx in indices {
            bs.set(idx);
        }
        bs
    }

    /// Sets the bit at the given index to 1.
    ///
    /// Marks a taxon as present in this clade.
    ///
    /// # Example
    /// ```
    /// # use rust_python_ccd::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);  // Mark taxon 0 as present
    /// bs.set(5);  // Mark taxon 5 as present
    /// assert_eq!(bs.0[0], 0b00100001);
    /// ```
    #[inline]
    pub fn set(&mut self, idx: usize) {
        let word = idx >> 6;     // Equivalent to idx / 64
        let bit = idx & 63;      // Equivalent to idx % 64
        self.0[word] |= 1u64 << bit;
    }

    /// Returns true if taxon `idx` is a member.
    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        let word = idx >> 6;
        word < self.0.len() && (self.0[word] >> (idx & 63)) & 1 == 1
    }

    /// Performs bitwise OR with another bitset (union operation).
    ///
    /// Merges two taxon sets: `self` becomes `self ∪ other`
    ///
    /// # Example
    /// ```
    /// # use rust_python_ccd::bitset::Bitset;
    /// let mut left = Bitset::zeros(1);
    /// left.set(0);   // {0}
    ///
    /// let mut right = Bitset::zeros(1);
    /// right.set(1);  // {1}
    ///
    /// left.or_assign(&right);  // {0} ∪ {1} = {0, 1}
    /// assert_eq!(left.0[0], 0b11);
    /// ```
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    /// Union as a new bitset.
    pub fn union(&self, other: &Bitset) -> Bitset {
        let mut out = self.clone();
        out.or_assign(other);
        out
    }

    /// Intersection as a new bitset.
    pub fn intersection(&self, other: &Bitset) -> Bitset {
        Bitset(self.0.iter().zip(&other.0).map(|(a, b)| a & b).collect())
    }

    /// Members of `self` that are not in `other`.
    pub fn difference(&self, other: &Bitset) -> Bitset {
        Bitset(self.0.iter().zip(&other.0).map(|(a, b)| a & !b).collect())
    }

    /// Returns true if every member of `self` is also in `other`.
    ///
    /// # Example
    /// ```
    /// # use rust_python_ccd::bitset::Bitset;
    /// let ab = Bitset::from_indices(1, [0, 1]);
    /// let abc = Bitset::from_indices(1, [0, 1, 2]);
    /// assert!(ab.is_subset(&abc));
    /// assert!(!abc.is_subset(&ab));
    /// ```
    pub fn is_subset(&self, other: &Bitset) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a & !b == 0)
    }

    /// Returns true if the two sets share no member.
    pub fn is_disjoint(&self, other: &Bitset) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a & b == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Counts the number of set bits (population count).
    ///
    /// Returns how many taxa are in this clade.
    ///
    /// # Example
    /// ```
    /// # use rust_python_ccd::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);
    /// bs.set(2);
    /// bs.set(5);
    /// assert_eq!(bs.count_ones(), 3);
    /// ```
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates over member indices in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(w, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(w * 64 + bit)
            })
        })
    }

    /// Smallest member index, `None` for the empty set.
    pub fn first_one(&self) -> Option<usize> {
        self.ones().next()
    }

    /// Lexicographic comparison of the ascending member sequences.
    ///
    /// Unlike the derived `Ord` (which compares raw words), this orders
    /// `{0, 3}` before `{1, 2}` because the first member 0 < 1.
    ///
    /// # Example
    /// ```
    /// # use rust_python_ccd::bitset::Bitset;
    /// # use std::cmp::Ordering;
    /// let a = Bitset::from_indices(1, [0, 3]);
    /// let b = Bitset::from_indices(1, [1, 2]);
    /// assert_eq!(a.cmp_members(&b), Ordering::Less);
    /// ```
    pub fn cmp_members(&self, other: &Bitset) -> Ordering {
        self.ones().cmp(other.ones())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basic() {
        let mut bs = Bitset::zeros(1);
        bs.set(0);
        bs.set(2);
        assert_eq!(bs.0[0], 0b0101);
        assert!(bs.contains(2));
        assert!(!bs.contains(1));
        assert!(!bs.contains(500));
    }

    #[test]
    fn test_bitset_or() {
        let mut bs1 = Bitset::zeros(1);
        bs1.set(0);
        bs1.set(1);

        let mut bs2 = Bitset::zeros(1);
        bs2.set(2);
        bs2.set(3);

        bs1.or_assign(&bs2);
        assert_eq!(bs1.0[0], 0b1111);
    }

    /// Visual example: how a split of a clade looks in bits
    ///
    /// ```text
    ///           {A,B,C,D}
    ///          /         \
    ///       {A,B}       {C,D}
    /// ```
    ///
    /// Taxon mapping: A=0, B=1, C=2, D=3
    #[test]
    fn test_split_algebra() {
        let parent = Bitset::from_indices(1, [0, 1, 2, 3]);
        let left = Bitset::from_indices(1, [0, 1]);
        let right = parent.difference(&left);

        assert_eq!(right.0[0], 0b1100);
        assert!(left.is_disjoint(&right));
        assert!(left.is_subset(&parent));
        assert_eq!(left.union(&right), parent);
        assert!(left.intersection(&right).is_empty());
    }

    #[test]
    fn test_full_and_ones() {
        let all = Bitset::full(64);
        assert_eq!(all.0, vec![u64::MAX]);

        let bs = Bitset::from_indices(2, [127, 3, 64]);
        assert_eq!(bs.ones().collect::<Vec<_>>(), vec![3, 64, 127]);
        assert_eq!(bs.first_one(), Some(3));
        assert_eq!(Bitset::zeros(2).first_one(), None);
    }

    #[test]
    fn test_member_order() {
        let a = Bitset::from_indices(1, [0, 1]);
        let b = Bitset::from_indices(1, [3]);
        // Raw words: 0b0011 < 0b1000 agrees here, but not for {0,3} vs {1,2}
        assert_eq!(a.cmp_members(&b), Ordering::Less);

        let c = Bitset::from_indices(1, [0, 3]);
        let d = Bitset::from_indices(1, [1, 2]);
        assert_eq!(c.cmp_members(&d), Ordering::Less);
        assert_eq!(c.cmp(&d), Ordering::Greater);

        // A prefix sorts first
        let e = Bitset::from_indices(1, [0]);
        assert_eq!(e.cmp_members(&c), Ordering::Less);
    }

    #[test]
    fn test_large_tree() {
        // Test with more than 64 taxa (multiple words)
        let mut bs = Bitset::zeros(2);
        bs.set(0);    // First word
        bs.set(63);   // Last bit of first word
        bs.set(64);   // First bit of second word
        bs.set(127);  // Last bit of second word

        assert_eq!(bs.count_ones(), 4);
        assert_eq!(bs.0[0], 1u64 | (1u64 << 63));
        assert_eq!(bs.0[1], 1u64 | (1u64 << 63));
        assert!(bs.is_subset(&Bitset::full(128)));
    }
}
