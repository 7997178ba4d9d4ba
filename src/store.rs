//! Clade distribution store: clade → dense id arena with flat records.
//!
//! Every first-seen clade gets the next integer id; records, splits and MAP
//! memo tables are then plain vectors indexed by that id, so wide bitsets are
//! hashed once per observation instead of on every lookup.
//!
//! A store built from a subset of the trees is a *partial table*. Partial
//! tables merge with [`CladeStore::merge`], which is associative, and which
//! assigns ids in first-seen order of the left operand followed by the right
//! one, so any reduction tree over an ordered sequence of partial tables
//! yields the same ids as a single sequential pass.

use std::collections::{BTreeMap, HashMap};

use crate::ccd::Variant;
use crate::clade::Clade;
use crate::decompose::{Decomposition, LeafObservation, Observation};

pub type CladeId = usize;

/// A split of a clade under one conditioning context, as arena ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SplitKey {
    pub left: CladeId,
    pub right: CladeId,
    /// Sibling clade for CCD2; `None` for first-order variants and at the root.
    pub context: Option<CladeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRecord {
    pub key: SplitKey,
    pub count: u64,
}

/// Statistics of one clade.
#[derive(Debug, Clone, Default)]
pub struct CladeRecord {
    count: u64,
    splits: Vec<SplitRecord>,
    split_index: HashMap<SplitKey, usize>,
    contexts: HashMap<Option<CladeId>, u64>,
    branch_length_sum: f64,
    branch_length_count: u64,
    blockcounts: Vec<i64>,
}

impl CladeRecord {
    /// Number of times the clade occurred.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Recorded splits in first-seen order.
    pub fn splits(&self) -> &[SplitRecord] {
        &self.splits
    }

    /// Number of split observations made under `context`.
    pub fn context_count(&self, context: Option<CladeId>) -> u64 {
        self.contexts.get(&context).copied().unwrap_or(0)
    }

    /// Mean length of the branch above the clade.
    pub fn mean_branch_length(&self) -> Option<f64> {
        (self.branch_length_count > 0)
            .then(|| self.branch_length_sum / self.branch_length_count as f64)
    }

    /// Median over observed block counts that are not −1.
    pub fn median_blockcount(&self) -> Option<f64> {
        let mut blocks: Vec<i64> = self.blockcounts.iter().copied().filter(|&b| b != -1).collect();
        if blocks.is_empty() {
            return None;
        }
        blocks.sort_unstable();
        let mid = blocks.len() / 2;
        Some(if blocks.len() % 2 == 0 {
            (blocks[mid - 1] + blocks[mid]) as f64 / 2.0
        } else {
            blocks[mid] as f64
        })
    }

    fn add_split(&mut self, key: SplitKey, count: u64) {
        match self.split_index.get(&key) {
            Some(&i) => self.splits[i].count += count,
            None => {
                self.split_index.insert(key, self.splits.len());
                self.splits.push(SplitRecord { key, count });
            }
        }
        *self.contexts.entry(key.context).or_insert(0) += count;
    }

    fn add_branch(&mut self, branch_length: Option<f64>, blockcount: Option<i64>) {
        if let Some(length) = branch_length {
            self.branch_length_sum += length;
            self.branch_length_count += 1;
        }
        if let Some(block) = blockcount {
            self.blockcounts.push(block);
        }
    }
}

/// Counts of one clade keyed by clade values rather than ids, for comparing
/// stores whose ids were assigned in different orders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CladeCounts {
    pub count: u64,
    pub splits: BTreeMap<(Clade, Clade, Option<Clade>), u64>,
}

pub type CountTable = BTreeMap<Clade, CladeCounts>;

#[derive(Debug, Clone, Default)]
pub struct CladeStore {
    clades: Vec<Clade>,
    ids: HashMap<Clade, CladeId>,
    records: Vec<CladeRecord>,
    trees: u64,
}

impl CladeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct clades.
    pub fn len(&self) -> usize {
        self.clades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clades.is_empty()
    }

    /// Number of trees ingested.
    pub fn tree_count(&self) -> u64 {
        self.trees
    }

    pub fn id_of(&self, clade: &Clade) -> Option<CladeId> {
        self.ids.get(clade).copied()
    }

    pub fn clade(&self, id: CladeId) -> &Clade {
        &self.clades[id]
    }

    pub fn record(&self, id: CladeId) -> &CladeRecord {
        &self.records[id]
    }

    /// All clades with their ids, in id order.
    pub fn clades(&self) -> impl Iterator<Item = (CladeId, &Clade)> {
        self.clades.iter().enumerate()
    }

    fn intern(&mut self, clade: &Clade) -> CladeId {
        if let Some(&id) = self.ids.get(clade) {
            return id;
        }
        let id = self.clades.len();
        self.clades.push(clade.clone());
        self.ids.insert(clade.clone(), id);
        self.records.push(CladeRecord::default());
        id
    }

    /// Add one decomposed tree.
    ///
    /// Every observation increments its clade's count; variants that record
    /// splits also increment the (split, context) entry and the context total.
    pub fn ingest(&mut self, decomposition: &Decomposition, variant: Variant) {
        for leaf in &decomposition.leaves {
            self.observe_leaf(leaf);
        }
        for obs in &decomposition.observations {
            self.observe(obs, variant);
        }
        self.trees += 1;
    }

    fn observe_leaf(&mut self, leaf: &LeafObservation) {
        let id = self.intern(&leaf.clade);
        let record = &mut self.records[id];
        record.count += 1;
        record.add_branch(leaf.branch_length, leaf.blockcount);
    }

    fn observe(&mut self, obs: &Observation, variant: Variant) {
        let id = self.intern(&obs.clade);
        if variant.records_splits() {
            let left = self.intern(&obs.split.left);
            let right = self.intern(&obs.split.right);
            let context = variant
                .context(obs.sibling.as_ref())
                .map(|sibling| self.intern(sibling));
            self.records[id].add_split(SplitKey { left, right, context }, 1);
        }
        let record = &mut self.records[id];
        record.count += 1;
        record.add_branch(obs.branch_length, obs.blockcount);
    }

    /// Fold another partial table into this one.
    ///
    /// Counts add up, so merging is associative and commutative with respect
    /// to the resulting [`CountTable`]; ids of `other`'s new clades are
    /// appended in `other`'s id order.
    pub fn merge(&mut self, other: CladeStore) {
        let remap: Vec<CladeId> = other.clades.iter().map(|c| self.intern(c)).collect();

        for (old_id, theirs) in other.records.into_iter().enumerate() {
            let ours = &mut self.records[remap[old_id]];
            ours.count += theirs.count;
            ours.branch_length_sum += theirs.branch_length_sum;
            ours.branch_length_count += theirs.branch_length_count;
            ours.blockcounts.extend(theirs.blockcounts);
            for split in theirs.splits {
                let key = SplitKey {
                    left: remap[split.key.left],
                    right: remap[split.key.right],
                    context: split.key.context.map(|c| remap[c]),
                };
                ours.add_split(key, split.count);
            }
        }
        self.trees += other.trees;
    }

    /// Id-independent view of all counts.
    pub fn count_table(&self) -> CountTable {
        self.records
            .iter()
            .enumerate()
            .map(|(id, record)| {
                let splits = record
                    .splits
                    .iter()
                    .map(|s| {
                        let key = (
                            self.clades[s.key.left].clone(),
                            self.clades[s.key.right].clone(),
                            s.key.context.map(|c| self.clades[c].clone()),
                        );
                        (key, s.count)
                    })
                    .collect();
                (self.clades[id].clone(), CladeCounts { count: record.count, splits })
            })
            .collect()
    }
}
