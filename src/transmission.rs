//! Transmission-tree clade tags (tCCD).
//!
//! Transmission trees sampled by BEAST carry a `blockcount` annotation on every
//! node: the number of transmission events on the branch above the node minus
//! one. `-1` means the branch stays within one host, `0` means exactly one
//! transmission, larger values mean unsampled intermediate hosts.
//!
//! Two tagging schemes turn that into clade identity:
//! - [`TransmissionKind::Blocks`]: whether the branch above the clade carries
//!   any transmission.
//! - [`TransmissionKind::Ancestry`]: which host infected the clade's lineage.
//!
//! # Ancestry labelling
//! Nodes joined by `-1` branches live in the same host. A host containing a
//! sampled leaf is named after it (smallest taxon index if several), any other
//! host gets a fresh `Unknown-k` label in pre-order.
//! ```text
//!            root           host h0 = "A"
//!           /    \
//!       {A,B}     C [1]     C: unknown intermediate → "Unknown-0"
//!       /   \
//!   A [-1]  B [0]           B: infected by its parent's host → "A"
//! ```

use std::collections::HashMap;

use crate::bitset::Bitset;
use crate::clade::CladeTag;
use crate::decompose::{CladeTagger, Topology};
use crate::error::{CcdError, Result};
use crate::io::NodeAnnotation;
use crate::taxa::TaxonRegistry;

const BLOCKCOUNT_KEY: &str = "blockcount";
const NO_BLOCK: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionKind {
    Blocks,
    Ancestry,
}

/// Block counts and ancestry labels of one tree's nodes.
#[derive(Debug, Clone)]
pub struct TransmissionHistory {
    kind: TransmissionKind,
    blockcounts: HashMap<usize, i64>,
    ancestors: HashMap<usize, String>,
}

impl TransmissionHistory {
    /// Resolve annotations against a validated topology.
    ///
    /// Annotations are keyed by the leaf labels below the annotated node.
    /// Nodes without a `blockcount` count as `-1`; the root is always `-1`.
    ///
    /// # Errors
    /// - `TaxonSetMismatch` if an annotation names unknown taxa or a clade
    ///   that is not part of the tree
    /// - `MalformedTree` if a block count is not a number
    pub fn from_topology(
        topology: &Topology,
        registry: &TaxonRegistry,
        annotations: &[NodeAnnotation],
        kind: TransmissionKind,
    ) -> Result<Self> {
        let nodes = topology.nodes_by_taxa();

        let mut blockcounts = HashMap::new();
        for annotation in annotations {
            let Some(raw) = annotation.fields.get(BLOCKCOUNT_KEY) else {
                continue;
            };
            let block = parse_blockcount(raw)?;
            let bits = registry.encode(annotation.leaves.iter().map(String::as_str))?;
            let node = nodes.get(&bits).copied().ok_or_else(|| {
                CcdError::mismatch(format!(
                    "annotated clade {} is not part of the tree",
                    registry.describe(&bits)
                ))
            })?;
            blockcounts.insert(node, block);
        }
        blockcounts.insert(topology.root(), NO_BLOCK);

        let ancestors = match kind {
            TransmissionKind::Ancestry => label_ancestry(topology, registry, &blockcounts),
            TransmissionKind::Blocks => HashMap::new(),
        };

        Ok(TransmissionHistory {
            kind,
            blockcounts,
            ancestors,
        })
    }

    pub fn kind(&self) -> TransmissionKind {
        self.kind
    }

    pub fn block(&self, node: usize) -> i64 {
        self.blockcounts.get(&node).copied().unwrap_or(NO_BLOCK)
    }

    /// Ancestry label of a node (only populated for the Ancestry scheme).
    pub fn ancestor(&self, node: usize) -> Option<&str> {
        self.ancestors.get(&node).map(String::as_str)
    }
}

impl CladeTagger for TransmissionHistory {
    fn tag(&self, node: usize) -> CladeTag {
        match self.kind {
            TransmissionKind::Blocks => CladeTag::Block(self.block(node) != NO_BLOCK),
            TransmissionKind::Ancestry => {
                CladeTag::Ancestor(self.ancestor(node).unwrap_or_default().to_string())
            }
        }
    }

    fn blockcount(&self, node: usize) -> Option<i64> {
        Some(self.block(node))
    }
}

fn parse_blockcount(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    raw.parse::<i64>()
        .or_else(|_| raw.parse::<f64>().map(|v| v.round() as i64))
        .map_err(|_| CcdError::malformed(format!("blockcount '{raw}' is not a number")))
}

/// Names hosts lazily so unknown hosts are numbered in request order.
struct HostNames<'a> {
    registry: &'a TaxonRegistry,
    leaf: Vec<Option<usize>>,
    names: Vec<Option<String>>,
    unknowns: usize,
}

impl HostNames<'_> {
    fn host(&mut self, host: usize) -> String {
        if let Some(name) = &self.names[host] {
            return name.clone();
        }
        let name = match self.leaf[host].and_then(|idx| self.registry.label(idx)) {
            Some(label) => label.to_string(),
            None => self.fresh(),
        };
        self.names[host] = Some(name.clone());
        name
    }

    fn fresh(&mut self) -> String {
        let name = format!("Unknown-{}", self.unknowns);
        self.unknowns += 1;
        name
    }
}

fn label_ancestry(
    topology: &Topology,
    registry: &TaxonRegistry,
    blockcounts: &HashMap<usize, i64>,
) -> HashMap<usize, String> {
    let parents = topology.parents();
    let block = |node: usize| blockcounts.get(&node).copied().unwrap_or(NO_BLOCK);

    // Host components along -1 branches, parents before children
    let mut host_of: HashMap<usize, usize> = HashMap::new();
    let mut host_leaf: Vec<Option<usize>> = Vec::new();
    for node in topology.preorder() {
        let host = match parents.get(&node) {
            Some(parent) if block(node) == NO_BLOCK => host_of[parent],
            _ => {
                host_leaf.push(None);
                host_leaf.len() - 1
            }
        };
        host_of.insert(node, host);

        if topology.is_leaf(node) {
            if let Some(idx) = topology.taxa(node).and_then(Bitset::first_one) {
                let slot = &mut host_leaf[host];
                *slot = Some(slot.map_or(idx, |cur| cur.min(idx)));
            }
        }
    }

    let mut names = HostNames {
        registry,
        names: vec![None; host_leaf.len()],
        leaf: host_leaf,
        unknowns: 0,
    };

    let mut ancestors = HashMap::new();
    for node in topology.preorder() {
        let label = match (parents.get(&node), block(node)) {
            (None, _) | (Some(_), NO_BLOCK) => names.host(host_of[&node]),
            (Some(parent), 0) => names.host(host_of[parent]),
            _ => names.fresh(),
        };
        ancestors.insert(node, label);
    }
    ancestors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::decompose::TreeDecomposer;
    use phylotree::tree::Tree as PhyloTree;

    fn annotation(leaves: &[&str], block: i64) -> NodeAnnotation {
        NodeAnnotation {
            leaves: leaves.iter().map(|s| s.to_string()).collect(),
            fields: BTreeMap::from([(BLOCKCOUNT_KEY.to_string(), block.to_string())]),
        }
    }

    fn setup(blocks: &[(&[&str], i64)]) -> (TaxonRegistry, Topology, Vec<NodeAnnotation>) {
        let registry = TaxonRegistry::from_labels(["A", "B", "C"]).unwrap();
        let tree = PhyloTree::from_newick("((A:1,B:1):1,C:2);").unwrap();
        let topology = Topology::from_tree(&tree, &registry).unwrap();
        let annotations = blocks.iter().map(|(l, b)| annotation(l, *b)).collect();
        (registry, topology, annotations)
    }

    fn node(topology: &Topology, registry: &TaxonRegistry, leaves: &[&str]) -> usize {
        let bits = registry.encode(leaves.iter().copied()).unwrap();
        topology.nodes_by_taxa()[&bits]
    }

    #[test]
    fn test_ancestry_labels() {
        let (registry, topology, annotations) =
            setup(&[(&["A"], -1), (&["B"], 0), (&["A", "B"], -1), (&["C"], 1)]);
        let history = TransmissionHistory::from_topology(
            &topology,
            &registry,
            &annotations,
            TransmissionKind::Ancestry,
        )
        .unwrap();

        let label = |leaves: &[&str]| history.ancestor(node(&topology, &registry, leaves));
        assert_eq!(label(&["A", "B", "C"]), Some("A"));
        assert_eq!(label(&["A", "B"]), Some("A"));
        assert_eq!(label(&["A"]), Some("A"));
        assert_eq!(label(&["B"]), Some("A"));
        assert_eq!(label(&["C"]), Some("Unknown-0"));
    }

    #[test]
    fn test_unsampled_root_host() {
        let (registry, topology, annotations) =
            setup(&[(&["A"], 0), (&["B"], 0), (&["A", "B"], -1), (&["C"], 0)]);
        let history = TransmissionHistory::from_topology(
            &topology,
            &registry,
            &annotations,
            TransmissionKind::Ancestry,
        )
        .unwrap();

        for leaves in [&["A"][..], &["B"], &["C"], &["A", "B"], &["A", "B", "C"]] {
            assert_eq!(
                history.ancestor(node(&topology, &registry, leaves)),
                Some("Unknown-0")
            );
        }
    }

    #[test]
    fn test_block_tags_in_decomposition() {
        let registry = TaxonRegistry::from_labels(["A", "B", "C"]).unwrap();
        let tree = PhyloTree::from_newick("((A:1,B:1):1,C:2);").unwrap();
        let annotations = vec![annotation(&["A", "B"], 0), annotation(&["C"], -1)];

        let d = TreeDecomposer::new(&registry)
            .decompose_with(&tree, |topology| {
                TransmissionHistory::from_topology(
                    topology,
                    &registry,
                    &annotations,
                    TransmissionKind::Blocks,
                )
            })
            .unwrap();

        let root = d.root().unwrap();
        assert_eq!(root.clade.tag, CladeTag::Block(false));
        assert_eq!(root.split.left.tag, CladeTag::Block(true));
        assert_eq!(root.split.right.tag, CladeTag::Block(false));
        assert_eq!(d.observations[0].blockcount, Some(0));
    }

    #[test]
    fn test_foreign_annotation_is_rejected() {
        let (registry, topology, _) = setup(&[]);
        let err = TransmissionHistory::from_topology(
            &topology,
            &registry,
            &[annotation(&["A", "C"], 0)],
            TransmissionKind::Blocks,
        )
        .unwrap_err();
        assert!(matches!(err, CcdError::TaxonSetMismatch { .. }));
    }

    #[test]
    fn test_parse_blockcount() {
        assert_eq!(parse_blockcount("-1").unwrap(), -1);
        assert_eq!(parse_blockcount(" 2.0 ").unwrap(), 2);
        assert!(parse_blockcount("many").is_err());
    }
}
