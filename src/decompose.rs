//! Decompose one rooted binary tree into clade/split observations.
//!
//! # Overview
//! Every internal node of a rooted binary tree defines a clade (the taxa below
//! it) and a split of that clade into its two children's clades:
//! ```text
//!            root {A,B,C,D}        observation: {A,B,C,D} → {A,B} | {C,D}
//!           /              \
//!       {A,B}              {C,D}   observations: {A,B} → {A}|{B}, {C,D} → {C}|{D}
//!       /   \              /   \
//!      A     B            C     D
//! ```
//! A tree over n taxa therefore yields exactly n − 1 observations. They are
//! produced in post-order, so the root observation is always the last one.
//!
//! Decomposition is a pure function of the tree and the registry: it never
//! touches shared state, which is what lets the builder run it in parallel.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use phylotree::tree::Tree as PhyloTree;

use crate::bitset::Bitset;
use crate::clade::{Clade, CladeTag, Split};
use crate::error::{CcdError, Result};
use crate::taxa::TaxonRegistry;

/// Supplies the identity extension of each node's clade.
///
/// Plain CCDs use [`Untagged`]; the transmission variant supplies block and
/// ancestry tags (see [`crate::transmission`]).
pub trait CladeTagger {
    fn tag(&self, node: usize) -> CladeTag;

    /// Number of transmission events minus one on the branch above `node`.
    fn blockcount(&self, _node: usize) -> Option<i64> {
        None
    }
}

/// Tagger for CCD0, CCD1 and CCD2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Untagged;

impl CladeTagger for Untagged {
    fn tag(&self, _node: usize) -> CladeTag {
        CladeTag::None
    }
}

/// The validated shape of one tree: binary, labelled with exactly the
/// registry's taxa, with the taxon set of every node.
#[derive(Debug, Clone)]
pub struct Topology {
    root: usize,
    postorder: Vec<usize>,
    children: HashMap<usize, [usize; 2]>,
    taxa: HashMap<usize, Bitset>,
    parent_edges: HashMap<usize, Option<f64>>,
}

impl Topology {
    /// Walk the tree once (iterative DFS) and build the taxon set of every node.
    ///
    /// # Errors
    /// - `MalformedTree` if a node has one or more than two children, or the
    ///   tree is a single node
    /// - `TaxonSetMismatch` if a leaf is unlabelled, unknown to the registry,
    ///   appears twice, or registry taxa are missing from the tree
    pub fn from_tree(tree: &PhyloTree, registry: &TaxonRegistry) -> Result<Self> {
        let root = tree.get_root()?;
        let words = registry.words();

        let mut postorder = Vec::new();
        let mut children = HashMap::new();
        let mut taxa: HashMap<usize, Bitset> = HashMap::new();
        let mut parent_edges = HashMap::new();
        let mut seen = Bitset::zeros(words);

        // (node, children already visited)
        let mut stack = vec![(root, false)];
        while let Some((node_id, expanded)) = stack.pop() {
            if expanded {
                let [a, b] = children[&node_id];
                let bits = taxa[&a].union(&taxa[&b]);
                taxa.insert(node_id, bits);
                postorder.push(node_id);
                continue;
            }

            let node = tree.get(&node_id)?;
            parent_edges.insert(node_id, node.parent_edge);

            match node.children.as_slice() {
                [] => {
                    let name = node.name.as_deref().ok_or_else(|| {
                        CcdError::mismatch(format!("leaf node {node_id} has no label"))
                    })?;
                    let idx = registry.index_of(name).ok_or_else(|| {
                        CcdError::mismatch(format!("taxon '{name}' is not in the registry"))
                    })?;
                    if seen.contains(idx) {
                        return Err(CcdError::mismatch(format!("taxon '{name}' appears twice")));
                    }
                    seen.set(idx);
                    taxa.insert(node_id, Bitset::from_indices(words, [idx]));
                    postorder.push(node_id);
                }
                &[a, b] => {
                    children.insert(node_id, [a, b]);
                    stack.push((node_id, true));
                    stack.push((b, false));
                    stack.push((a, false));
                }
                other => {
                    return Err(CcdError::malformed(format!(
                        "node {node_id} has {} children, expected 2",
                        other.len()
                    )));
                }
            }
        }

        if !children.contains_key(&root) {
            return Err(CcdError::malformed("tree consists of a single node"));
        }

        let missing = registry.universe().difference(&seen);
        if !missing.is_empty() {
            return Err(CcdError::mismatch(format!(
                "tree lacks taxa {}",
                registry.describe(&missing)
            )));
        }

        Ok(Topology {
            root,
            postorder,
            children,
            taxa,
            parent_edges,
        })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    /// Node ids, children before parents.
    pub fn postorder(&self) -> &[usize] {
        &self.postorder
    }

    /// Node ids, parents before children.
    pub fn preorder(&self) -> impl Iterator<Item = usize> + '_ {
        self.postorder.iter().rev().copied()
    }

    /// Both children of an internal node, `None` for leaves.
    pub fn children(&self, node: usize) -> Option<[usize; 2]> {
        self.children.get(&node).copied()
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        !self.children.contains_key(&node)
    }

    pub fn taxa(&self, node: usize) -> Option<&Bitset> {
        self.taxa.get(&node)
    }

    pub fn parent_edge(&self, node: usize) -> Option<f64> {
        self.parent_edges.get(&node).copied().flatten()
    }

    /// Child → parent map.
    pub fn parents(&self) -> HashMap<usize, usize> {
        self.children
            .iter()
            .flat_map(|(&parent, kids)| kids.iter().map(move |&kid| (kid, parent)))
            .collect()
    }

    /// Taxon set → node id. Taxon sets are unique within a binary tree.
    pub fn nodes_by_taxa(&self) -> HashMap<&Bitset, usize> {
        self.taxa.iter().map(|(&node, bits)| (bits, node)).collect()
    }
}

/// One internal node seen as a clade undergoing a split.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub clade: Clade,
    pub split: Split,
    /// The other child of this clade's parent; `None` at the root.
    pub sibling: Option<Clade>,
    pub branch_length: Option<f64>,
    pub blockcount: Option<i64>,
}

/// One leaf; carries no split, only branch statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafObservation {
    pub clade: Clade,
    pub branch_length: Option<f64>,
    pub blockcount: Option<i64>,
}

/// The complete observation sequence of one tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposition {
    pub observations: Vec<Observation>,
    pub leaves: Vec<LeafObservation>,
}

impl Decomposition {
    /// The root observation (last in post-order).
    pub fn root(&self) -> Option<&Observation> {
        self.observations.last()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.observations.iter()
    }

    /// Sorted internal clades; two trees share a topology iff their keys match.
    pub fn topology_key(&self) -> Vec<&Clade> {
        let mut key: Vec<&Clade> = self.observations.iter().map(|o| &o.clade).collect();
        key.sort();
        key
    }
}

/// Sample trees sharing one topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyGroup {
    /// Sample index of the first tree with this topology
    pub first: usize,
    /// Sample indices of the later repeats
    pub repeats: Vec<usize>,
}

impl TopologyGroup {
    pub fn count(&self) -> usize {
        1 + self.repeats.len()
    }
}

/// Group indexed decompositions by topology, in order of first occurrence.
pub fn group_topologies<'a, I>(decompositions: I) -> Vec<TopologyGroup>
where
    I: IntoIterator<Item = (usize, &'a Decomposition)>,
{
    let mut seen: HashMap<Vec<&'a Clade>, usize> = HashMap::new();
    let mut groups: Vec<TopologyGroup> = Vec::new();
    for (index, decomposition) in decompositions {
        match seen.entry(decomposition.topology_key()) {
            Entry::Occupied(entry) => groups[*entry.get()].repeats.push(index),
            Entry::Vacant(entry) => {
                entry.insert(groups.len());
                groups.push(TopologyGroup {
                    first: index,
                    repeats: Vec::new(),
                });
            }
        }
    }
    groups
}

impl IntoIterator for Decomposition {
    type Item = Observation;
    type IntoIter = std::vec::IntoIter<Observation>;

    fn into_iter(self) -> Self::IntoIter {
        self.observations.into_iter()
    }
}

/// Decomposes trees over one fixed taxon registry.
#[derive(Debug, Clone, Copy)]
pub struct TreeDecomposer<'a> {
    registry: &'a TaxonRegistry,
}

impl<'a> TreeDecomposer<'a> {
    pub fn new(registry: &'a TaxonRegistry) -> Self {
        TreeDecomposer { registry }
    }

    pub fn registry(&self) -> &'a TaxonRegistry {
        self.registry
    }

    /// Decompose an untagged tree.
    pub fn decompose(&self, tree: &PhyloTree) -> Result<Decomposition> {
        let topology = Topology::from_tree(tree, self.registry)?;
        Ok(Self::observe(&topology, &Untagged))
    }

    /// Decompose a tree whose tagger needs the validated topology first
    /// (e.g. transmission ancestry labelling).
    pub fn decompose_with<T, F>(&self, tree: &PhyloTree, make_tagger: F) -> Result<Decomposition>
    where
        T: CladeTagger,
        F: FnOnce(&Topology) -> Result<T>,
    {
        let topology = Topology::from_tree(tree, self.registry)?;
        let tagger = make_tagger(&topology)?;
        Ok(Self::observe(&topology, &tagger))
    }

    /// Emit observations in post-order.
    fn observe<T: CladeTagger>(topology: &Topology, tagger: &T) -> Decomposition {
        let clades: HashMap<usize, Clade> = topology
            .taxa
            .iter()
            .map(|(&node, bits)| (node, Clade::with_tag(bits.clone(), tagger.tag(node))))
            .collect();

        let mut siblings: HashMap<usize, usize> = HashMap::new();
        for &[a, b] in topology.children.values() {
            siblings.insert(a, b);
            siblings.insert(b, a);
        }

        let mut decomposition = Decomposition::default();
        for &node in &topology.postorder {
            let clade = clades[&node].clone();
            let branch_length = topology.parent_edge(node);
            let blockcount = tagger.blockcount(node);

            match topology.children(node) {
                None => decomposition.leaves.push(LeafObservation {
                    clade,
                    branch_length,
                    blockcount,
                }),
                Some([a, b]) => decomposition.observations.push(Observation {
                    clade,
                    split: Split::new(clades[&a].clone(), clades[&b].clone()),
                    sibling: siblings.get(&node).map(|s| clades[s].clone()),
                    branch_length,
                    blockcount,
                }),
            }
        }
        decomposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(labels: &[&str]) -> TaxonRegistry {
        TaxonRegistry::from_labels(labels.iter().copied()).unwrap()
    }

    /// Caterpillar over five taxa
    ///
    /// ```text
    ///              root
    ///             /    \
    ///         node1     E
    ///         /   \
    ///     node2    D
    ///     /   \
    ///    A    node3
    ///         /   \
    ///        B     C
    /// ```
    ///
    /// Post-order observations: {B,C}, {A,B,C}, {A,B,C,D}, {A,B,C,D,E}
    #[test]
    fn test_caterpillar_observations() {
        let reg = registry(&["A", "B", "C", "D", "E"]);
        let tree =
            PhyloTree::from_newick("(((A:1,(B:1,C:1):1):1,D:1):1,E:1);").unwrap();
        let d = TreeDecomposer::new(&reg).decompose(&tree).unwrap();

        assert_eq!(d.len(), 4);
        assert_eq!(d.leaves.len(), 5);

        let sizes: Vec<usize> = d.iter().map(|o| o.clade.len()).collect();
        assert_eq!(sizes, vec![2, 3, 4, 5]);

        let root = d.root().unwrap();
        assert_eq!(root.clade.taxa, reg.universe());
        assert!(root.sibling.is_none());
        assert_eq!(root.split.right.taxa, reg.encode(["E"]).unwrap());

        // {A,B,C}'s sibling inside {A,B,C,D} is D
        let abc = &d.observations[1];
        assert_eq!(abc.sibling.as_ref().unwrap().taxa, reg.encode(["D"]).unwrap());
        assert_eq!(abc.branch_length, Some(1.0));
    }

    #[test]
    fn test_every_observation_is_a_proper_split() {
        let reg = registry(&["A", "B", "C", "D", "E", "F"]);
        let tree = PhyloTree::from_newick(
            "((A:1,(B:1,C:1):1):1,((D:1,E:1):1,F:1):1);",
        )
        .unwrap();
        let d = TreeDecomposer::new(&reg).decompose(&tree).unwrap();

        assert_eq!(d.len(), reg.len() - 1);
        for obs in d.iter() {
            let left = &obs.split.left.taxa;
            let right = &obs.split.right.taxa;
            assert!(left.is_disjoint(right));
            assert_eq!(left.union(right), obs.clade.taxa);
            assert!(!left.is_empty() && !right.is_empty());
            // canonical orientation: left holds the smallest taxon
            assert_eq!(left.first_one(), obs.clade.taxa.first_one());
        }
    }

    #[test]
    fn test_decomposition_is_pure() {
        let reg = registry(&["A", "B", "C", "D"]);
        let tree = PhyloTree::from_newick("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
        let decomposer = TreeDecomposer::new(&reg);
        assert_eq!(decomposer.decompose(&tree).unwrap(), decomposer.decompose(&tree).unwrap());
    }

    #[test]
    fn test_unknown_taxon_is_rejected() {
        let reg = registry(&["A", "B", "C"]);
        let tree = PhyloTree::from_newick("((A:1,B:1):1,X:1);").unwrap();
        let err = TreeDecomposer::new(&reg).decompose(&tree).unwrap_err();
        assert!(matches!(err, CcdError::TaxonSetMismatch { .. }));
    }

    #[test]
    fn test_missing_taxon_is_rejected() {
        let reg = registry(&["A", "B", "C", "D"]);
        let tree = PhyloTree::from_newick("((A:1,B:1):1,C:1);").unwrap();
        let err = TreeDecomposer::new(&reg).decompose(&tree).unwrap_err();
        assert!(matches!(err, CcdError::TaxonSetMismatch { .. }));
    }

    #[test]
    fn test_multifurcation_is_rejected() {
        let reg = registry(&["A", "B", "C"]);
        let tree = PhyloTree::from_newick("(A:1,B:1,C:1);").unwrap();
        let err = TreeDecomposer::new(&reg).decompose(&tree).unwrap_err();
        assert!(matches!(err, CcdError::MalformedTree { .. }));
    }

    #[test]
    fn test_group_topologies() {
        let reg = registry(&["A", "B", "C", "D"]);
        let decomposer = TreeDecomposer::new(&reg);
        let trees: Vec<Decomposition> = [
            "((A:1,B:1):1,(C:1,D:1):1);",
            "(((A:1,B:1):1,C:1):1,D:1);",
            "((D:2,C:2):1,(B:1,A:1):1);",
            "((A:1,B:1):1,(C:1,D:1):1);",
        ]
        .iter()
        .map(|nwk| decomposer.decompose(&PhyloTree::from_newick(nwk).unwrap()).unwrap())
        .collect();

        // Child order and branch lengths do not matter
        let groups = group_topologies(trees.iter().enumerate());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], TopologyGroup { first: 0, repeats: vec![2, 3] });
        assert_eq!(groups[1].first, 1);
        assert_eq!(groups[1].count(), 1);
    }
}
