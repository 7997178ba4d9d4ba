//! Conditional clade distributions: variants, builder, frozen distribution.
//!
//! # Variants
//! ```text
//! Ccd0          clade frequencies only, no split statistics
//! Ccd1          P(split | parent clade)
//! Ccd2          P(split | parent clade, sibling of the parent clade)
//! Transmission  Ccd1 over clades tagged with transmission information
//! ```
//!
//! # Building
//! Trees are decomposed independently (see [`crate::decompose`]) and folded
//! into partial [`CladeStore`]s on the rayon pool. Partial stores are reduced
//! pairwise with the order-preserving [`CladeStore::merge`], so the parallel
//! build assigns the same clade ids as a sequential pass over the sample.
//!
//! # Probabilities
//! `P(split | context) = count(split, context) / count(context)`, where the
//! context count is the number of times the clade was split under that
//! context. For first-order variants this is the clade's occurrence count.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use phylotree::tree::Tree as PhyloTree;
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::clade::{Clade, Split};
use crate::decompose::{Decomposition, TopologyGroup, TreeDecomposer, group_topologies};
use crate::error::{CcdError, Result};
use crate::io::{NodeAnnotation, ReadOptions, SampledTree, read_tree_files};
use crate::map::{self, MapTree};
use crate::sample;
use crate::store::{CladeId, CladeStore, SplitRecord};
use crate::taxa::TaxonRegistry;
use crate::transmission::{TransmissionHistory, TransmissionKind};

/// Which conditioning structure a distribution records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Ccd0,
    Ccd1,
    Ccd2,
    Transmission(TransmissionKind),
}

impl Variant {
    /// Whether split counts are recorded at all.
    pub fn records_splits(self) -> bool {
        !matches!(self, Variant::Ccd0)
    }

    /// Whether split statistics are conditioned on the parent's sibling.
    pub fn conditions_on_sibling(self) -> bool {
        matches!(self, Variant::Ccd2)
    }

    pub fn is_tagged(self) -> bool {
        matches!(self, Variant::Transmission(_))
    }

    pub fn transmission(self) -> Option<TransmissionKind> {
        match self {
            Variant::Transmission(kind) => Some(kind),
            _ => None,
        }
    }

    /// Context key of a clade whose sibling in the observed tree is `sibling`.
    pub fn context<'a>(self, sibling: Option<&'a Clade>) -> Option<&'a Clade> {
        if self.conditions_on_sibling() {
            sibling
        } else {
            None
        }
    }

    /// Same as [`Variant::context`] on arena ids.
    pub fn context_id(self, sibling: CladeId) -> Option<CladeId> {
        self.conditions_on_sibling().then_some(sibling)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Ccd0 => write!(f, "CCD0"),
            Variant::Ccd1 => write!(f, "CCD1"),
            Variant::Ccd2 => write!(f, "CCD2"),
            Variant::Transmission(TransmissionKind::Blocks) => write!(f, "tCCD (blocks)"),
            Variant::Transmission(TransmissionKind::Ancestry) => write!(f, "tCCD (ancestry)"),
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ccd0" => Ok(Variant::Ccd0),
            "ccd1" => Ok(Variant::Ccd1),
            "ccd2" => Ok(Variant::Ccd2),
            "tccd-blocks" | "tccd" => Ok(Variant::Transmission(TransmissionKind::Blocks)),
            "tccd-ancestry" => Ok(Variant::Transmission(TransmissionKind::Ancestry)),
            other => Err(format!(
                "unknown variant '{other}' (expected ccd0, ccd1, ccd2, tccd-blocks or tccd-ancestry)"
            )),
        }
    }
}

/// Decompose one tree with the tagger its variant needs.
pub fn decompose_tree(
    registry: &TaxonRegistry,
    variant: Variant,
    tree: &PhyloTree,
    annotations: &[NodeAnnotation],
) -> Result<Decomposition> {
    let decomposer = TreeDecomposer::new(registry);
    match variant.transmission() {
        None => decomposer.decompose(tree),
        Some(kind) => decomposer.decompose_with(tree, |topology| {
            TransmissionHistory::from_topology(topology, registry, annotations, kind)
        }),
    }
}

/// A decomposition must cover exactly the registry's universe.
fn check_decomposition(registry: &TaxonRegistry, decomposition: &Decomposition) -> Result<()> {
    let universe = registry.universe();
    match decomposition.root() {
        Some(root) if root.clade.taxa == universe => Ok(()),
        Some(root) => Err(CcdError::mismatch(format!(
            "tree covers {} taxa, registry has {}",
            root.clade.len(),
            registry.len()
        ))),
        None => Err(CcdError::malformed("tree has no internal node")),
    }
}

/// Incremental, mutable side of a distribution.
#[derive(Debug)]
pub struct CcdBuilder {
    registry: Arc<TaxonRegistry>,
    variant: Variant,
    store: CladeStore,
    frozen: bool,
}

impl CcdBuilder {
    pub fn new(registry: Arc<TaxonRegistry>, variant: Variant) -> Self {
        CcdBuilder {
            registry,
            variant,
            store: CladeStore::new(),
            frozen: false,
        }
    }

    pub fn registry(&self) -> &Arc<TaxonRegistry> {
        &self.registry
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn tree_count(&self) -> u64 {
        self.store.tree_count()
    }

    pub fn store(&self) -> &CladeStore {
        &self.store
    }

    fn ensure_open(&self) -> Result<()> {
        if self.frozen {
            Err(CcdError::FrozenDistribution)
        } else {
            Ok(())
        }
    }

    /// Add one decomposed tree. Validation happens before any count changes.
    pub fn ingest(&mut self, decomposition: &Decomposition) -> Result<()> {
        self.ensure_open()?;
        check_decomposition(&self.registry, decomposition)?;
        self.store.ingest(decomposition, self.variant);
        Ok(())
    }

    /// Decompose and add one parsed tree.
    pub fn ingest_tree(&mut self, tree: &PhyloTree, annotations: &[NodeAnnotation]) -> Result<()> {
        self.ensure_open()?;
        let decomposition = decompose_tree(&self.registry, self.variant, tree, annotations)?;
        self.ingest(&decomposition)
    }

    /// Fold another builder's trees into this one (after this builder's own).
    pub fn merge(&mut self, other: CcdBuilder) -> Result<()> {
        self.ensure_open()?;
        other.ensure_open()?;
        if other.variant != self.variant {
            return Err(CcdError::mismatch(format!(
                "cannot merge a {} builder into a {} builder",
                other.variant, self.variant
            )));
        }
        if other.registry != self.registry {
            return Err(CcdError::mismatch("builders use different taxon registries"));
        }
        self.store.merge(other.store);
        Ok(())
    }

    /// Freeze the builder into an immutable distribution.
    ///
    /// # Errors
    /// `FrozenDistribution` if called twice.
    pub fn finalize(&mut self) -> Result<ConditionalCladeDistribution> {
        self.ensure_open()?;
        self.frozen = true;
        let store = std::mem::take(&mut self.store);
        Ok(ConditionalCladeDistribution::from_store(
            Arc::clone(&self.registry),
            self.variant,
            store,
        ))
    }
}

/// Marginal frequency of one clade.
#[derive(Debug, Clone, PartialEq)]
pub struct CladeFrequency {
    pub clade: Clade,
    pub count: u64,
    pub frequency: f64,
}

/// Immutable distribution; safe to query from many threads at once.
#[derive(Debug, Clone)]
pub struct ConditionalCladeDistribution {
    registry: Arc<TaxonRegistry>,
    variant: Variant,
    store: CladeStore,
    roots: Vec<CladeId>,
}

impl ConditionalCladeDistribution {
    fn from_store(registry: Arc<TaxonRegistry>, variant: Variant, store: CladeStore) -> Self {
        let universe = registry.universe();
        let mut roots: Vec<CladeId> = store
            .clades()
            .filter(|(_, clade)| clade.taxa == universe)
            .map(|(id, _)| id)
            .collect();
        roots.sort_by(|&a, &b| store.clade(a).cmp(store.clade(b)));

        ConditionalCladeDistribution {
            registry,
            variant,
            store,
            roots,
        }
    }

    pub fn registry(&self) -> &Arc<TaxonRegistry> {
        &self.registry
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn tree_count(&self) -> u64 {
        self.store.tree_count()
    }

    pub fn store(&self) -> &CladeStore {
        &self.store
    }

    /// Ids of the root clades (one per observed root tag).
    pub fn roots(&self) -> &[CladeId] {
        &self.roots
    }

    /// Number of distinct clades, leaves included.
    pub fn clade_count(&self) -> usize {
        self.store.len()
    }

    fn ensure_splits(&self, operation: &'static str) -> Result<()> {
        if self.variant.records_splits() {
            Ok(())
        } else {
            Err(CcdError::unsupported(self.variant, operation))
        }
    }

    fn ensure_trees(&self) -> Result<()> {
        if self.tree_count() == 0 {
            Err(CcdError::EmptyDistribution)
        } else {
            Ok(())
        }
    }

    /// `count(clade) / trees`, 0 for unseen clades.
    pub fn clade_frequency(&self, clade: &Clade) -> f64 {
        match (self.store.id_of(clade), self.tree_count()) {
            (Some(id), trees) if trees > 0 => self.store.record(id).count() as f64 / trees as f64,
            _ => 0.0,
        }
    }

    /// Frequencies of all non-leaf clades, largest clades first, then by
    /// descending frequency.
    pub fn clade_frequencies(&self) -> Vec<CladeFrequency> {
        let trees = self.tree_count().max(1) as f64;
        let mut rows: Vec<CladeFrequency> = self
            .store
            .clades()
            .filter(|(_, clade)| !clade.is_leaf())
            .map(|(id, clade)| {
                let count = self.store.record(id).count();
                CladeFrequency {
                    clade: clade.clone(),
                    count,
                    frequency: count as f64 / trees,
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            b.clade
                .len()
                .cmp(&a.clade.len())
                .then_with(|| b.count.cmp(&a.count))
                .then_with(|| a.clade.tie_order(&b.clade))
        });
        rows
    }

    /// Conditional probability of a split record of clade `id`.
    pub(crate) fn split_probability_of(&self, id: CladeId, split: &SplitRecord) -> f64 {
        let total = self.store.record(id).context_count(split.key.context);
        if total == 0 {
            0.0
        } else {
            split.count as f64 / total as f64
        }
    }

    /// Split records of clade `id` observed under `context`.
    pub(crate) fn splits_under(
        &self,
        id: CladeId,
        context: Option<CladeId>,
    ) -> impl Iterator<Item = &SplitRecord> + '_ {
        self.store
            .record(id)
            .splits()
            .iter()
            .filter(move |s| s.key.context == context)
    }

    /// Resolve a clade context to an arena id; the outer `None` means the
    /// context clade was never observed.
    fn resolve_context(&self, context: Option<&Clade>) -> Option<Option<CladeId>> {
        match self.variant.context(context) {
            None => Some(None),
            Some(sibling) => self.store.id_of(sibling).map(Some),
        }
    }

    /// `P(split | parent, context)`; `context` is the parent's sibling and is
    /// ignored by first-order variants. Unseen splits have probability 0.
    ///
    /// # Errors
    /// `UnsupportedVariant` under CCD0.
    pub fn split_probability(
        &self,
        parent: &Clade,
        split: &Split,
        context: Option<&Clade>,
    ) -> Result<f64> {
        self.ensure_splits("split probabilities")?;
        let ids = (
            self.store.id_of(parent),
            self.store.id_of(&split.left),
            self.store.id_of(&split.right),
            self.resolve_context(context),
        );
        let (Some(id), Some(left), Some(right), Some(context)) = ids else {
            return Ok(0.0);
        };
        Ok(self
            .splits_under(id, context)
            .find(|s| s.key.left == left && s.key.right == right)
            .map(|s| self.split_probability_of(id, s))
            .unwrap_or(0.0))
    }

    /// All splits of `clade` under `context` with their probabilities, in
    /// first-seen order.
    pub fn splits_of(&self, clade: &Clade, context: Option<&Clade>) -> Result<Vec<(Split, f64)>> {
        self.ensure_splits("split distributions")?;
        let (Some(id), Some(context)) = (self.store.id_of(clade), self.resolve_context(context)) else {
            return Ok(Vec::new());
        };
        Ok(self
            .splits_under(id, context)
            .map(|s| {
                let split = Split::new(
                    self.store.clade(s.key.left).clone(),
                    self.store.clade(s.key.right).clone(),
                );
                (split, self.split_probability_of(id, s))
            })
            .collect())
    }

    /// Log root-clade probability; 0 for untagged variants.
    pub(crate) fn root_log_probability(&self, root: CladeId) -> f64 {
        if self.variant.is_tagged() {
            (self.store.record(root).count() as f64 / self.tree_count() as f64).ln()
        } else {
            0.0
        }
    }

    /// Log-probability of a decomposed tree; `-inf` if it contains a clade
    /// or split never observed in the sample.
    pub fn log_probability(&self, decomposition: &Decomposition) -> Result<f64> {
        self.ensure_splits("tree probabilities")?;
        self.ensure_trees()?;
        check_decomposition(&self.registry, decomposition)?;

        let mut log_p = 0.0;
        for obs in decomposition.iter() {
            let p = self.split_probability(&obs.clade, &obs.split, obs.sibling.as_ref())?;
            if p == 0.0 {
                return Ok(f64::NEG_INFINITY);
            }
            log_p += p.ln();
        }
        if let Some(root) = decomposition.root() {
            match self.store.id_of(&root.clade) {
                Some(id) => log_p += self.root_log_probability(id),
                None => return Ok(f64::NEG_INFINITY),
            }
        }
        Ok(log_p)
    }

    /// Entropy of the tree distribution in nats.
    ///
    /// `H(C | x) = Σ p · (−ln p + H(L | R) + H(R | L))` over the splits of C
    /// under context x; leaves contribute 0. Tagged variants add the entropy
    /// of the root-tag mixture.
    pub fn entropy(&self) -> Result<f64> {
        self.ensure_splits("entropy")?;
        self.ensure_trees()?;

        let mut memo = HashMap::new();
        let mut total = 0.0;
        for &root in &self.roots {
            let weight = if self.variant.is_tagged() {
                self.store.record(root).count() as f64 / self.tree_count() as f64
            } else {
                1.0
            };
            total += weight * (-weight.ln() + self.clade_entropy(root, None, &mut memo)?);
        }
        Ok(total)
    }

    fn clade_entropy(
        &self,
        id: CladeId,
        context: Option<CladeId>,
        memo: &mut HashMap<(CladeId, Option<CladeId>), f64>,
    ) -> Result<f64> {
        if self.store.clade(id).is_leaf() {
            return Ok(0.0);
        }
        if let Some(&h) = memo.get(&(id, context)) {
            return Ok(h);
        }

        let mut h = 0.0;
        let mut any = false;
        for split in self.splits_under(id, context) {
            any = true;
            let p = self.split_probability_of(id, split);
            let left = self.clade_entropy(
                split.key.left,
                self.variant.context_id(split.key.right),
                memo,
            )?;
            let right = self.clade_entropy(
                split.key.right,
                self.variant.context_id(split.key.left),
                memo,
            )?;
            h += p * (-p.ln() + left + right);
        }
        if !any {
            return Err(CcdError::IncompleteClade {
                clade: self.store.clade(id).describe(&self.registry),
            });
        }

        memo.insert((id, context), h);
        Ok(h)
    }

    /// The most probable tree; see [`crate::map`].
    pub fn map_tree(&self) -> Result<MapTree> {
        map::map_tree(self)
    }

    /// Draw `n` trees proportionally to their probability; see [`crate::sample`].
    pub fn sample_trees<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Vec<Decomposition>> {
        (0..n).map(|_| sample::sample_tree(self, rng)).collect()
    }
}

/// Count decompositions on the rayon pool; partial stores are reduced in
/// sample order.
fn count_decompositions(decompositions: &[Decomposition], variant: Variant) -> CladeStore {
    decompositions
        .par_iter()
        .fold(CladeStore::new, |mut store, d| {
            store.ingest(d, variant);
            store
        })
        .reduce(CladeStore::new, |mut left, right| {
            left.merge(right);
            left
        })
}

/// Build a distribution from already decomposed trees on the rayon pool.
///
/// # Errors
/// `TaxonSetMismatch` if any decomposition does not cover the registry.
pub fn build_distribution(
    registry: Arc<TaxonRegistry>,
    variant: Variant,
    decompositions: &[Decomposition],
) -> Result<ConditionalCladeDistribution> {
    decompositions
        .par_iter()
        .try_for_each(|d| check_decomposition(&registry, d))?;

    let store = count_decompositions(decompositions, variant);
    debug!(
        "Built {} from {} trees: {} clades",
        variant,
        store.tree_count(),
        store.len()
    );
    Ok(ConditionalCladeDistribution::from_store(registry, variant, store))
}

/// A tree excluded from the distribution.
#[derive(Debug)]
pub struct RejectedTree {
    pub index: usize,
    pub name: String,
    pub error: CcdError,
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub distribution: ConditionalCladeDistribution,
    pub rejected: Vec<RejectedTree>,
    /// Distinct topologies among the accepted trees, by sample index
    pub topologies: Vec<TopologyGroup>,
}

/// Decompose a parsed sample and count it in parallel. Trees that fail to
/// decompose are reported in [`BuildOutcome::rejected`]; the rest still
/// contribute.
///
/// `phylotree` trees are not `Sync`, so decomposition runs on the calling
/// thread and only the `Sync` decompositions go to the rayon pool.
pub fn build_from_sample(
    registry: Arc<TaxonRegistry>,
    variant: Variant,
    trees: &[SampledTree],
) -> Result<BuildOutcome> {
    let mut decompositions = Vec::with_capacity(trees.len());
    let mut accepted = Vec::with_capacity(trees.len());
    let mut rejected = Vec::new();
    for (index, sampled) in trees.iter().enumerate() {
        let result = decompose_tree(&registry, variant, &sampled.tree, &sampled.annotations)
            .and_then(|d| check_decomposition(&registry, &d).map(|()| d));
        match result {
            Ok(decomposition) => {
                accepted.push(index);
                decompositions.push(decomposition);
            }
            Err(error) if error.is_tree_rejection() => {
                warn!("Rejected tree {}: {}", sampled.name, error);
                rejected.push(RejectedTree {
                    index,
                    name: sampled.name.clone(),
                    error,
                });
            }
            Err(error) => return Err(error),
        }
    }

    let store = count_decompositions(&decompositions, variant);
    let topologies = group_topologies(accepted.iter().copied().zip(&decompositions));
    info!(
        "Ingested {} of {} trees into {} ({} clades, {} unique topologies)",
        store.tree_count(),
        trees.len(),
        variant,
        store.len(),
        topologies.len()
    );

    Ok(BuildOutcome {
        distribution: ConditionalCladeDistribution::from_store(registry, variant, store),
        rejected,
        topologies,
    })
}

/// Read tree files and build one distribution over them. The first tree kept
/// after burn-in defines the taxon universe; trees that do not match it are
/// rejected without failing the build.
pub fn build_from_files<P: AsRef<Path>>(
    paths: &[P],
    variant: Variant,
    options: &ReadOptions,
) -> Result<BuildOutcome> {
    let trees = read_tree_files(paths, options)?;
    let first = trees.first().ok_or_else(|| CcdError::NoTrees {
        source_name: "the provided files".to_string(),
    })?;
    let registry = Arc::new(TaxonRegistry::from_tree(&first.tree)?);

    let outcome = build_from_sample(registry, variant, &trees)?;
    if !outcome.rejected.is_empty() {
        warn!("{} of {} trees were rejected", outcome.rejected.len(), trees.len());
    }
    Ok(outcome)
}
