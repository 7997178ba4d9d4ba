//! MAP-tree search: the most probable tree under a distribution.
//!
//! # Algorithm
//! A memoized recursion over clades, starting at the root clade(s):
//! ```text
//! best(C | x) = 0                                             if C is a leaf
//!             = max_i  ln P(L_i|R_i | C, x) + best(L_i | R_i) + best(R_i | L_i)
//! ```
//! The child contexts are only used by CCD2; first-order variants look the
//! children up without context, so every clade is solved once. Tagged
//! variants may see several root clades (one per root tag); the search picks
//! the one maximizing `ln(count(r)/trees) + best(r)`.
//!
//! # Ties
//! Scores within a relative tolerance of 1e-12 are tied. Ties go to the split
//! with the higher raw count, then to the split whose smaller side (the one
//! with fewer taxa) has the lexicographically smaller member sequence, then
//! to the overall clade order including tags. Every clade of the result whose choice needed
//! this rule is counted in [`MapTree::tie_breaks`].
//!
//! Each query owns its memo, so concurrent queries on one distribution are fine.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::{debug, warn};

use crate::ccd::{ConditionalCladeDistribution, Variant};
use crate::clade::{Clade, CladeTag, Split};
use crate::error::{CcdError, Result};
use crate::store::{CladeId, SplitKey};
use crate::taxa::TaxonRegistry;

const TIE_TOLERANCE: f64 = 1e-12;

/// One node of a MAP tree.
#[derive(Debug, Clone, PartialEq)]
pub struct MapNode {
    pub clade: Clade,
    /// Indices into [`MapTree::nodes`]; `None` for leaves.
    pub children: Option<[usize; 2]>,
    /// Conditional probability of the chosen split; `None` for leaves.
    pub split_probability: Option<f64>,
    pub mean_branch_length: Option<f64>,
    pub median_blockcount: Option<f64>,
}

/// The reconstructed tree, nodes in pre-order (root first).
#[derive(Debug, Clone, PartialEq)]
pub struct MapTree {
    nodes: Vec<MapNode>,
    log_probability: f64,
    tie_breaks: usize,
    variant: Variant,
}

impl MapTree {
    pub fn root(&self) -> &MapNode {
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[MapNode] {
        &self.nodes
    }

    /// Log-probability of the tree under the distribution.
    pub fn log_probability(&self) -> f64 {
        self.log_probability
    }

    /// Number of clades whose split was chosen by the tie-break rule.
    pub fn tie_breaks(&self) -> usize {
        self.tie_breaks
    }

    /// Clades of all internal nodes.
    pub fn clades(&self) -> impl Iterator<Item = &Clade> {
        self.nodes
            .iter()
            .filter(|n| n.children.is_some())
            .map(|n| &n.clade)
    }

    /// Render as Newick with mean branch lengths.
    ///
    /// Transmission trees carry `[&blockcount=<median>,transmission.ancestor=<label>]`
    /// on every node (`-1` when no block was observed).
    pub fn to_newick(&self, registry: &TaxonRegistry) -> String {
        let mut out = String::new();
        self.write_node(0, registry, &mut out);
        out.push(';');
        out
    }

    fn write_node(&self, idx: usize, registry: &TaxonRegistry, out: &mut String) {
        let node = &self.nodes[idx];
        match node.children {
            Some([left, right]) => {
                out.push('(');
                self.write_node(left, registry, out);
                out.push(',');
                self.write_node(right, registry, out);
                out.push(')');
            }
            None => {
                let label = node
                    .clade
                    .taxa
                    .first_one()
                    .and_then(|i| registry.label(i))
                    .unwrap_or_default();
                out.push_str(&quote_label(label));
            }
        }

        if self.variant.is_tagged() {
            let block = node.median_blockcount.unwrap_or(-1.0);
            let _ = write!(out, "[&blockcount={block}");
            if let CladeTag::Ancestor(host) = &node.clade.tag {
                let _ = write!(out, ",transmission.ancestor={}", quote_label(host));
            }
            out.push(']');
        }
        if let Some(length) = node.mean_branch_length {
            let _ = write!(out, ":{length}");
        }
    }
}

/// Quote a Newick label if it contains reserved characters.
fn quote_label(label: &str) -> String {
    const RESERVED: &[char] = &['(', ')', '[', ']', ':', ';', ',', '\'', ' ', '\t'];
    if label.contains(RESERVED) {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}

fn scores_tied(a: f64, b: f64) -> bool {
    (a - b).abs() <= TIE_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

#[derive(Debug, Clone, Copy)]
struct Choice {
    score: f64,
    /// `None` for leaves
    split: Option<SplitKey>,
    probability: f64,
    count: u64,
    tied: bool,
}

impl Choice {
    const LEAF: Choice = Choice {
        score: 0.0,
        split: None,
        probability: 1.0,
        count: 0,
        tied: false,
    };
}

struct MapSearch<'a> {
    ccd: &'a ConditionalCladeDistribution,
    /// First-order variants: one entry per clade id
    dense: Vec<Option<Choice>>,
    /// CCD2: keyed by (clade, sibling)
    keyed: HashMap<(CladeId, Option<CladeId>), Choice>,
}

impl<'a> MapSearch<'a> {
    fn new(ccd: &'a ConditionalCladeDistribution) -> Self {
        let dense = if ccd.variant().conditions_on_sibling() {
            Vec::new()
        } else {
            vec![None; ccd.clade_count()]
        };
        MapSearch {
            ccd,
            dense,
            keyed: HashMap::new(),
        }
    }

    fn lookup(&self, id: CladeId, context: Option<CladeId>) -> Option<Choice> {
        if self.ccd.variant().conditions_on_sibling() {
            self.keyed.get(&(id, context)).copied()
        } else {
            self.dense[id]
        }
    }

    fn remember(&mut self, id: CladeId, context: Option<CladeId>, choice: Choice) {
        if self.ccd.variant().conditions_on_sibling() {
            self.keyed.insert((id, context), choice);
        } else {
            self.dense[id] = Some(choice);
        }
    }

    fn best(&mut self, id: CladeId, context: Option<CladeId>) -> Result<Choice> {
        if let Some(choice) = self.lookup(id, context) {
            return Ok(choice);
        }

        let ccd = self.ccd;
        let variant = ccd.variant();
        let clade = ccd.store().clade(id);

        let choice = if clade.is_leaf() {
            Choice::LEAF
        } else {
            let mut best: Option<Choice> = None;
            for split in ccd.splits_under(id, context) {
                let key = split.key;
                let left = self.best(key.left, variant.context_id(key.right))?;
                let right = self.best(key.right, variant.context_id(key.left))?;
                let probability = ccd.split_probability_of(id, split);
                let candidate = Choice {
                    score: probability.ln() + left.score + right.score,
                    split: Some(key),
                    probability,
                    count: split.count,
                    tied: false,
                };
                best = Some(match best {
                    None => candidate,
                    Some(current) => self.prefer(current, candidate),
                });
            }
            best.ok_or_else(|| CcdError::IncompleteClade {
                clade: clade.describe(ccd.registry()),
            })?
        };

        self.remember(id, context, choice);
        Ok(choice)
    }

    /// Keep the better of two choices for the same clade.
    fn prefer(&self, current: Choice, candidate: Choice) -> Choice {
        if !scores_tied(current.score, candidate.score) {
            return if candidate.score > current.score {
                candidate
            } else {
                current
            };
        }

        let take_candidate = match candidate.count.cmp(&current.count) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (candidate.split, current.split) {
                (Some(a), Some(b)) => self.split_order(a, b) == Ordering::Less,
                _ => false,
            },
        };
        let mut winner = if take_candidate { candidate } else { current };
        winner.tied = true;
        winner
    }

    /// Smaller sides by members, then both sides in clade order.
    fn split_order(&self, a: SplitKey, b: SplitKey) -> Ordering {
        let store = self.ccd.store();
        let smaller = |key: SplitKey| Split::smaller_of(store.clade(key.left), store.clade(key.right));
        let (sa, sb) = (smaller(a), smaller(b));
        sa.taxa
            .cmp_members(&sb.taxa)
            .then_with(|| sa.tag.cmp(&sb.tag))
            .then_with(|| store.clade(a.left).cmp(store.clade(b.left)))
            .then_with(|| store.clade(a.right).cmp(store.clade(b.right)))
    }

    /// Pick the root clade; returns (root id, total log-probability, tied).
    fn choose_root(&mut self) -> Result<(CladeId, f64, bool)> {
        let ccd = self.ccd;
        let store = ccd.store();
        let mut chosen: Option<(CladeId, f64, bool)> = None;

        for &root in ccd.roots() {
            let score = ccd.root_log_probability(root) + self.best(root, None)?.score;
            chosen = Some(match chosen {
                None => (root, score, false),
                Some((current, current_score, _)) if scores_tied(score, current_score) => {
                    let by_count = store.record(root).count().cmp(&store.record(current).count());
                    let take = match by_count {
                        Ordering::Equal => {
                            store.clade(root).tie_order(store.clade(current)) == Ordering::Less
                        }
                        other => other == Ordering::Greater,
                    };
                    if take {
                        (root, score, true)
                    } else {
                        (current, current_score, true)
                    }
                }
                Some((current, current_score, tied)) => {
                    if score > current_score {
                        (root, score, false)
                    } else {
                        (current, current_score, tied)
                    }
                }
            });
        }

        chosen.ok_or(CcdError::EmptyDistribution)
    }

    /// Emit the chosen subtree of `id` in pre-order; returns its node index.
    fn emit(
        &mut self,
        id: CladeId,
        context: Option<CladeId>,
        nodes: &mut Vec<MapNode>,
        tie_breaks: &mut usize,
    ) -> Result<usize> {
        let choice = self.best(id, context)?;
        let ccd = self.ccd;
        let store = ccd.store();
        let record = store.record(id);

        let idx = nodes.len();
        nodes.push(MapNode {
            clade: store.clade(id).clone(),
            children: None,
            split_probability: choice.split.map(|_| choice.probability),
            mean_branch_length: record.mean_branch_length(),
            median_blockcount: record.median_blockcount(),
        });
        if choice.tied {
            *tie_breaks += 1;
            debug!("Tie-break applied at clade {}", store.clade(id).describe(ccd.registry()));
        }

        if let Some(key) = choice.split {
            let variant = ccd.variant();
            let left = self.emit(key.left, variant.context_id(key.right), nodes, tie_breaks)?;
            let right = self.emit(key.right, variant.context_id(key.left), nodes, tie_breaks)?;
            nodes[idx].children = Some([left, right]);
        }
        Ok(idx)
    }
}

/// Find the MAP tree of a distribution.
///
/// # Errors
/// - `UnsupportedVariant` for CCD0
/// - `EmptyDistribution` if no tree was ingested
/// - `IncompleteClade` if a reachable non-leaf clade has no split under its context
pub fn map_tree(ccd: &ConditionalCladeDistribution) -> Result<MapTree> {
    if !ccd.variant().records_splits() {
        return Err(CcdError::unsupported(ccd.variant(), "MAP trees"));
    }
    if ccd.tree_count() == 0 {
        return Err(CcdError::EmptyDistribution);
    }

    let mut search = MapSearch::new(ccd);
    let (root, log_probability, root_tied) = search.choose_root()?;

    let mut nodes = Vec::with_capacity(2 * ccd.registry().len());
    let mut tie_breaks = usize::from(root_tied);
    search.emit(root, None, &mut nodes, &mut tie_breaks)?;

    if tie_breaks > 0 {
        warn!("MAP tree needed the tie-break rule at {tie_breaks} clade(s)");
    }
    debug!(
        "MAP tree over {} taxa: log-probability {log_probability:.6}",
        ccd.registry().len()
    );

    Ok(MapTree {
        nodes,
        log_probability,
        tie_breaks,
        variant: ccd.variant(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ccd::CcdBuilder;
    use crate::io::NodeAnnotation;
    use crate::transmission::TransmissionKind;
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

    fn internal_clades(map: &MapTree, ccd: &ConditionalCladeDistribution) -> Vec<String> {
        let mut clades: Vec<String> = map.clades().map(|c| c.describe(ccd.registry())).collect();
        clades.sort();
        clades
    }

    #[test]
    fn test_single_topology() {
        let tree = "((T1:1,T2:1):1,T3:2);";
        let ccd = build(&["T1", "T2", "T3"], Variant::Ccd1, &[tree, tree, tree]);
        let map = map_tree(&ccd).unwrap();

        assert_eq!(map.log_probability(), 0.0);
        assert_eq!(map.tie_breaks(), 0);
        assert_eq!(map.nodes().len(), 5);
        assert_eq!(map.to_newick(ccd.registry()), "((T1:1,T2:1):1,T3:2);");
    }

    #[test]
    fn test_majority_topology_wins() {
        let ccd = build(
            &["T1", "T2", "T3", "T4"],
            Variant::Ccd1,
            &[
                "((T1:1,T2:1):1,(T3:1,T4:1):1);",
                "((T1:1,T2:1):1,(T3:1,T4:1):1);",
                "(((T1:1,T2:1):1,T3:1):1,T4:1);",
            ],
        );
        let map = ccd.map_tree().unwrap();

        assert_eq!(internal_clades(&map, &ccd), ["{T1,T2,T3,T4}", "{T1,T2}", "{T3,T4}"]);
        assert!((map.log_probability() - (2.0f64 / 3.0).ln()).abs() < 1e-12);
        let root = map.root();
        assert!((root.split_probability.unwrap() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_equal_scores_prefer_lexicographically_smaller_side() {
        // {1,2}|{3,4} and {1,2,3}|{4} once each: scores and counts tie.
        // Smaller sides are {1,2} and {4}; [0,1] precedes [3], so the
        // balanced tree wins even though {4} has fewer taxa
        let ccd = build(
            &["T1", "T2", "T3", "T4"],
            Variant::Ccd1,
            &["((T1:1,T2:1):1,(T3:1,T4:1):1);", "(((T1:1,T2:1):1,T3:1):1,T4:1);"],
        );
        let map = map_tree(&ccd).unwrap();

        assert_eq!(internal_clades(&map, &ccd), ["{T1,T2,T3,T4}", "{T1,T2}", "{T3,T4}"]);
        assert_eq!(map.tie_breaks(), 1);
        assert!((map.log_probability() - 0.5f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_smaller_side_is_chosen_by_size() {
        // {1,2,3,4}|{5} against {1,3}|{2,4,5}: the smaller sides are {5} and
        // {1,3}, and [0,2] < [4]. Comparing the larger side [0,1,2,3] instead
        // would pick the caterpillar.
        let ccd = build(
            &["T1", "T2", "T3", "T4", "T5"],
            Variant::Ccd1,
            &[
                "((((T1:1,T2:1):1,T3:1):1,T4:1):1,T5:1);",
                "((T1:1,T3:1):1,((T2:1,T4:1):1,T5:1):1);",
            ],
        );
        let map = map_tree(&ccd).unwrap();
        assert_eq!(
            internal_clades(&map, &ccd),
            ["{T1,T2,T3,T4,T5}", "{T1,T3}", "{T2,T4,T5}", "{T2,T4}"]
        );
        assert_eq!(map.tie_breaks(), 1);
    }

    #[test]
    fn test_equal_size_sides_compare_by_members() {
        // {A,B}|{C,D} and {A,C}|{B,D}: both smaller sides have two taxa,
        // {A,B} precedes {A,C}
        let ccd = build(
            &["A", "B", "C", "D"],
            Variant::Ccd1,
            &["((A:1,C:1):1,(B:1,D:1):1);", "((A:1,B:1):1,(C:1,D:1):1);"],
        );
        let map = map_tree(&ccd).unwrap();
        assert_eq!(internal_clades(&map, &ccd), ["{A,B,C,D}", "{A,B}", "{C,D}"]);
    }

    #[test]
    fn test_higher_count_breaks_score_tie() {
        // Root: {A,B,C}|{D,E} twice, {A,B}|{C,D,E} once.
        // {A,B,C} splits {A,B}|{C} once and {A,C}|{B} once.
        // Scores: ln(2/3) + ln(1/2) = ln(1/3) = ln(1/3) + 0, counts 2 vs 1.
        let ccd = build(
            &["A", "B", "C", "D", "E"],
            Variant::Ccd1,
            &[
                "(((A:1,B:1):1,C:1):1,(D:1,E:1):1);",
                "(((A:1,C:1):1,B:1):1,(D:1,E:1):1);",
                "((A:1,B:1):1,((C:1,D:1):1,E:1):1);",
            ],
        );
        let map = map_tree(&ccd).unwrap();
        let clades = internal_clades(&map, &ccd);

        assert!(clades.contains(&"{A,B,C}".to_string()));
        assert!(clades.contains(&"{D,E}".to_string()));
        // inside {A,B,C}: equal counts, smaller side {B} beats {C}
        assert!(clades.contains(&"{A,C}".to_string()));
        assert!((map.log_probability() - (1.0f64 / 3.0).ln()).abs() < 1e-12);
        assert_eq!(map.tie_breaks(), 2);
    }

    #[test]
    fn test_repeated_queries_are_identical() {
        let ccd = build(
            &["A", "B", "C", "D"],
            Variant::Ccd2,
            &["((A:1,C:1):1,(B:1,D:1):1);", "((A:1,B:1):1,(C:1,D:1):1);"],
        );
        let first = map_tree(&ccd).unwrap();
        for _ in 0..5 {
            assert_eq!(map_tree(&ccd).unwrap(), first);
        }
    }

    #[test]
    fn test_query_errors() {
        let registry = Arc::new(TaxonRegistry::from_labels(["A", "B"]).unwrap());
        let empty = CcdBuilder::new(registry, Variant::Ccd1).finalize().unwrap();
        assert!(matches!(map_tree(&empty), Err(CcdError::EmptyDistribution)));

        let ccd0 = build(&["A", "B", "C"], Variant::Ccd0, &["((A:1,B:1):1,C:1);"]);
        assert!(matches!(
            map_tree(&ccd0),
            Err(CcdError::UnsupportedVariant { .. })
        ));
    }

    #[test]
    fn test_ccd2_incomplete_context() {
        // {A,B,C} is only split next to D; no tree splits it next to E, but
        // the MAP search never asks for that context.
        let ccd = build(
            &["A", "B", "C", "D", "E"],
            Variant::Ccd2,
            &["((((A:1,B:1):1,C:1):1,D:1):1,E:1);"],
        );
        let map = map_tree(&ccd).unwrap();
        assert_eq!(map.log_probability(), 0.0);
        assert_eq!(map.clades().count(), 4);
    }

    #[test]
    fn test_transmission_newick_annotations() {
        let registry = Arc::new(TaxonRegistry::from_labels(["A", "B", "C"]).unwrap());
        let mut builder = CcdBuilder::new(
            Arc::clone(&registry),
            Variant::Transmission(TransmissionKind::Ancestry),
        );
        let annotations: Vec<NodeAnnotation> = [(vec!["A"], "-1"), (vec!["B"], "0"), (vec!["C"], "1")]
            .into_iter()
            .map(|(leaves, block)| NodeAnnotation {
                leaves: leaves.into_iter().map(String::from).collect(),
                fields: [("blockcount".to_string(), block.to_string())].into(),
            })
            .collect();
        let tree = PhyloTree::from_newick("((A:1,B:1):1,C:2);").unwrap();
        builder.ingest_tree(&tree, &annotations).unwrap();
        let ccd = builder.finalize().unwrap();

        let map = map_tree(&ccd).unwrap();
        assert_eq!(map.log_probability(), 0.0);
        assert_eq!(
            map.to_newick(&registry),
            "((A[&blockcount=-1,transmission.ancestor=A]:1,\
             B[&blockcount=0,transmission.ancestor=A]:1)\
             [&blockcount=-1,transmission.ancestor=A]:1,\
             C[&blockcount=1,transmission.ancestor=Unknown-0]:2)\
             [&blockcount=-1,transmission.ancestor=A];"
        );
    }

    #[test]
    fn test_quote_label() {
        assert_eq!(quote_label("Human"), "Human");
        assert_eq!(quote_label("Homo sapiens"), "'Homo sapiens'");
        assert_eq!(quote_label("it's"), "'it''s'");
    }
}
