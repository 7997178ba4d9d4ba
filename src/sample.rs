//! Drawing trees from a distribution.
//!
//! A tree is drawn top-down. Tagged variants first pick a root clade by its
//! count; every non-leaf clade then picks one split with probability
//! `count(split, context) / count(context)`, where CCD2 hands each child its
//! sibling as context. Draws are made on integer counts, so a split seen k out
//! of n times is chosen with probability exactly k/n.
//!
//! Sampled trees come back as [`Decomposition`]s in post-order, ready for
//! [`ConditionalCladeDistribution::log_probability`] or a second builder.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::ccd::ConditionalCladeDistribution;
use crate::clade::Split;
use crate::decompose::{Decomposition, LeafObservation, Observation};
use crate::error::{CcdError, Result};
use crate::store::CladeId;

/// Pick one item with probability proportional to its weight.
fn draw<T, R: Rng + ?Sized>(rng: &mut R, weighted: Vec<(T, u64)>) -> Option<T> {
    let total: u64 = weighted.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return None;
    }
    let mut r = rng.gen_range(0..total);
    for (item, weight) in weighted {
        if r < weight {
            return Some(item);
        }
        r -= weight;
    }
    None
}

/// Draw one tree.
///
/// # Errors
/// - `UnsupportedVariant` for CCD0
/// - `EmptyDistribution` if no tree was ingested
/// - `IncompleteClade` if a drawn clade has no split under its context
pub fn sample_tree<R: Rng + ?Sized>(
    ccd: &ConditionalCladeDistribution,
    rng: &mut R,
) -> Result<Decomposition> {
    let variant = ccd.variant();
    if !variant.records_splits() {
        return Err(CcdError::unsupported(variant, "tree sampling"));
    }
    let store = ccd.store();
    let roots = ccd
        .roots()
        .iter()
        .map(|&r| (r, store.record(r).count()))
        .collect();
    let root = draw(rng, roots).ok_or(CcdError::EmptyDistribution)?;

    let mut decomposition = Decomposition::default();
    // (clade, its sibling), popped in pre-order
    let mut pending: Vec<(CladeId, Option<CladeId>)> = vec![(root, None)];
    while let Some((id, sibling)) = pending.pop() {
        let clade = store.clade(id).clone();
        let branch_length = store.record(id).mean_branch_length();
        if clade.is_leaf() {
            decomposition.leaves.push(LeafObservation {
                clade,
                branch_length,
                blockcount: None,
            });
            continue;
        }

        let context = sibling.and_then(|s| variant.context_id(s));
        let splits = ccd
            .splits_under(id, context)
            .map(|s| (s.key, s.count))
            .collect();
        let key = draw(rng, splits).ok_or_else(|| CcdError::IncompleteClade {
            clade: clade.describe(ccd.registry()),
        })?;

        decomposition.observations.push(Observation {
            clade,
            split: Split::new(store.clade(key.left).clone(), store.clade(key.right).clone()),
            sibling: sibling.map(|s| store.clade(s).clone()),
            branch_length,
            blockcount: None,
        });
        pending.push((key.right, Some(key.left)));
        pending.push((key.left, Some(key.right)));
    }

    // Reversed pre-order puts children before parents and the root last
    decomposition.observations.reverse();
    Ok(decomposition)
}

/// Draw `n` trees on the rayon pool; tree `i` uses its own generator seeded
/// with `seed + i`, so results do not depend on the thread count.
pub fn sample_trees_seeded(
    ccd: &ConditionalCladeDistribution,
    n: usize,
    seed: u64,
) -> Result<Vec<Decomposition>> {
    (0..n)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            sample_tree(ccd, &mut rng)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ccd::{CcdBuilder, Variant};
    use crate::clade::Clade;
    use crate::taxa::TaxonRegistry;
    use phylotree::tree::Tree as PhyloTree;

    fn build(labels: &[&str], variant: Variant, trees: &[&str]) -> ConditionalCladeDistribution {
        let registry = Arc::new(TaxonRegistry::from_labels(labels.iter().copied()).unwrap());
        let mut builder = CcdBuilder::new(registry, variant);
        for nwk in trees {
            builder
                .ingest_tree(&PhyloTree::from_newick(nwk).unwrap(), &[])
                .unwrap();
        }
        builder.finalize().unwrap()
    }

    fn clade(ccd: &ConditionalCladeDistribution, labels: &[&str]) -> Clade {
        Clade::new(ccd.registry().encode(labels.iter().copied()).unwrap())
    }

    #[test]
    fn test_split_frequencies_follow_probabilities() {
        let ccd = build(
            &["A", "B", "C", "D"],
            Variant::Ccd1,
            &[
                "((A:1,B:1):1,(C:1,D:1):1);",
                "((A:1,B:1):1,(C:1,D:1):1);",
                "(((A:1,B:1):1,C:1):1,D:1);",
            ],
        );
        let mut rng = StdRng::seed_from_u64(7);
        let n = 3000;
        let balanced = Split::new(clade(&ccd, &["A", "B"]), clade(&ccd, &["C", "D"]));

        let mut hits = 0;
        for _ in 0..n {
            let tree = ccd.sample_trees(1, &mut rng).unwrap().remove(0);
            assert_eq!(tree.len(), 3);
            assert!(ccd.log_probability(&tree).unwrap().is_finite());
            if tree.root().unwrap().split == balanced {
                hits += 1;
            }
        }
        let frequency = hits as f64 / n as f64;
        assert!((frequency - 2.0 / 3.0).abs() < 0.04, "balanced root drawn {frequency}");
    }

    #[test]
    fn test_ccd2_draws_respect_sibling_context() {
        // Under CCD2 the split of {A,B,C} is fixed by its sibling, so only the
        // two input trees can be drawn; CCD1 would also mix them
        let trees = [
            "((((A:1,B:1):1,C:1):1,D:1):1,E:1);",
            "((((A:1,C:1):1,B:1):1,E:1):1,D:1);",
        ];
        let labels = ["A", "B", "C", "D", "E"];
        let ccd2 = build(&labels, Variant::Ccd2, &trees);
        let ccd1 = build(&labels, Variant::Ccd1, &trees);

        let samples = sample_trees_seeded(&ccd2, 200, 11).unwrap();
        for tree in &samples {
            let log_p = ccd2.log_probability(tree).unwrap();
            assert!((log_p - 0.5f64.ln()).abs() < 1e-12);
        }

        let mixed = sample_trees_seeded(&ccd1, 200, 11).unwrap();
        assert!(
            mixed
                .iter()
                .any(|t| ccd2.log_probability(t).unwrap() == f64::NEG_INFINITY)
        );
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let ccd = build(
            &["A", "B", "C", "D"],
            Variant::Ccd1,
            &["((A:1,B:1):1,(C:1,D:1):1);", "(((A:1,C:1):1,B:1):1,D:1);"],
        );
        assert_eq!(
            sample_trees_seeded(&ccd, 50, 3).unwrap(),
            sample_trees_seeded(&ccd, 50, 3).unwrap()
        );
    }

    #[test]
    fn test_sampling_errors() {
        let ccd0 = build(&["A", "B", "C"], Variant::Ccd0, &["((A:1,B:1):1,C:1);"]);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            sample_tree(&ccd0, &mut rng),
            Err(CcdError::UnsupportedVariant { .. })
        ));

        let registry = Arc::new(TaxonRegistry::from_labels(["A", "B"]).unwrap());
        let empty = CcdBuilder::new(registry, Variant::Ccd1).finalize().unwrap();
        assert!(matches!(
            sample_tree(&empty, &mut rng),
            Err(CcdError::EmptyDistribution)
        ));
    }
}
