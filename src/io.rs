//! Reading BEAST/NEXUS tree samples and writing CCD results.
//!
//! BEAST writes trees as
//! ```text
//! begin trees;
//!     translate
//!         1 'Human',
//!         2 'Chimp'
//!     ;
//!     tree STATE_1000 = [&R] ((1[&blockcount=-1]:1.0,2[&blockcount=0]:1.0):0.5,3:1.5);
//! end;
//! ```
//! `phylotree` does not understand the `[&...]` comments, so they are removed
//! before parsing. Node annotations are not thrown away: [`split_annotations`]
//! collects them keyed by the leaf labels below the annotated node, which
//! survives parsing unchanged and lets the transmission tagger map them back
//! onto the parsed tree.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use phylotree::tree::Tree;
use tracing::{debug, warn};

use crate::ccd::CladeFrequency;
use crate::error::{CcdError, Result};
use crate::map::MapTree;
use crate::taxa::TaxonRegistry;

/// Burn-in and labelling options of the reader.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReadOptions {
    /// Drop the first N trees
    pub burnin_trees: usize,
    /// Keep only trees with STATE_ > value
    pub burnin_states: usize,
    /// Drop this leading fraction of the trees left after the other filters
    pub burnin_fraction: f64,
    /// Rename leaves through the TRANSLATE block
    pub use_real_taxa: bool,
}

/// `[&key=value,...]` attached to one node, keyed by its leaf labels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeAnnotation {
    pub leaves: Vec<String>,
    pub fields: BTreeMap<String, String>,
}

/// One tree of a posterior sample.
#[derive(Debug, Clone)]
pub struct SampledTree {
    pub name: String,
    pub state: Option<usize>,
    pub tree: Tree,
    pub annotations: Vec<NodeAnnotation>,
}

#[derive(Debug, Clone)]
pub struct TreeSample {
    /// TRANSLATE block (id → label); empty if the file has none
    pub taxa: HashMap<String, String>,
    pub trees: Vec<SampledTree>,
}

/// Remove `[...]` comments from a Newick string, returning the stripped
/// string and every `[&...]` node annotation.
///
/// The annotation of a node follows the node itself (`A[&x=1]:1.0`,
/// `(...)[&x=1]:1.0`) or its colon (`A:[&x=1]1.0`). Annotations in front of
/// the tree (`[&R]`, `[&lnP=...]`) are dropped.
pub fn split_annotations(newick: &str) -> (String, Vec<NodeAnnotation>) {
    let mut stripped = String::with_capacity(newick.len());
    let mut annotations = Vec::new();

    // leaf labels collected per open parenthesis
    let mut groups: Vec<Vec<String>> = Vec::new();
    // leaves below the most recently completed node
    let mut last: Option<Vec<String>> = None;
    let mut label = String::new();
    let mut expect_leaf = true;

    let mut chars = newick.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                stripped.push(ch);
                while let Some(quoted) = chars.next() {
                    stripped.push(quoted);
                    if quoted == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            stripped.push('\'');
                            label.push('\'');
                            continue;
                        }
                        break;
                    }
                    if expect_leaf {
                        label.push(quoted);
                    }
                }
            }
            '[' => {
                finish_leaf(&mut label, &mut expect_leaf, &mut groups, &mut last);
                let mut body = String::new();
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    body.push(inner);
                }
                if let (Some(fields), Some(leaves)) = (body.strip_prefix('&'), &last) {
                    annotations.push(NodeAnnotation {
                        leaves: leaves.clone(),
                        fields: parse_fields(fields),
                    });
                }
            }
            '(' => {
                groups.push(Vec::new());
                last = None;
                expect_leaf = true;
                stripped.push(ch);
            }
            ',' => {
                finish_leaf(&mut label, &mut expect_leaf, &mut groups, &mut last);
                last = None;
                expect_leaf = true;
                stripped.push(ch);
            }
            ')' => {
                finish_leaf(&mut label, &mut expect_leaf, &mut groups, &mut last);
                let group = groups.pop().unwrap_or_default();
                if let Some(parent) = groups.last_mut() {
                    parent.extend(group.iter().cloned());
                }
                last = Some(group);
                expect_leaf = false;
                stripped.push(ch);
            }
            ':' | ';' => {
                finish_leaf(&mut label, &mut expect_leaf, &mut groups, &mut last);
                stripped.push(ch);
            }
            c if c.is_whitespace() => stripped.push(c),
            c => {
                if expect_leaf {
                    label.push(c);
                }
                stripped.push(c);
            }
        }
    }

    (stripped, annotations)
}

fn finish_leaf(
    label: &mut String,
    expect_leaf: &mut bool,
    groups: &mut [Vec<String>],
    last: &mut Option<Vec<String>>,
) {
    if !*expect_leaf || label.is_empty() {
        return;
    }
    let name = std::mem::take(label);
    if let Some(group) = groups.last_mut() {
        group.push(name.clone());
    }
    *last = Some(vec![name]);
    *expect_leaf = false;
}

/// Split `key=value,key={a,b}` at top-level commas.
fn parse_fields(body: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut push = |item: &str| {
        let item = item.trim().trim_start_matches('&');
        if let Some((key, value)) = item.split_once('=') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        } else if !item.is_empty() {
            fields.insert(item.to_string(), String::new());
        }
    };
    for (i, ch) in body.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    push(&body[start..]);
    fields
}

/// Read a BEAST `.trees` file.
///
/// Trees are named `<file>_tree_STATE<n>`. Trees `phylotree` cannot parse are
/// skipped with a warning.
///
/// # Errors
/// - `Io` if the file cannot be read
/// - `InvalidBurnin` for a burn-in fraction outside `[0, 1)`
/// - `NoTrees` if nothing is left after burn-in
pub fn read_beast_trees<P: AsRef<Path>>(path: P, options: &ReadOptions) -> Result<TreeSample> {
    if !(0.0..1.0).contains(&options.burnin_fraction) {
        return Err(CcdError::InvalidBurnin(options.burnin_fraction));
    }

    let path = path.as_ref();
    let content = fs::read_to_string(path)?;

    let base_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.trim_end_matches(".trees"))
        .unwrap_or("unknown");

    let taxa = parse_taxon_block(&content);

    let mut blocks: Vec<(usize, TreeBlock<'_>, Option<usize>)> = collect_tree_blocks(&content)
        .into_iter()
        .enumerate()
        .map(|(idx, block)| {
            let state = extract_state(block.header);
            (idx, block, state)
        })
        .filter(|(idx, _, state)| {
            let state = state.unwrap_or(0);
            (options.burnin_trees == 0 && options.burnin_states == 0)
                || (options.burnin_trees > 0 && *idx >= options.burnin_trees)
                || (options.burnin_states > 0 && state > options.burnin_states)
        })
        .collect();

    let fraction_burnin = (blocks.len() as f64 * options.burnin_fraction).floor() as usize;
    blocks.drain(..fraction_burnin);

    let trees: Vec<SampledTree> = blocks
        .into_iter()
        .filter_map(|(idx, block, state)| {
            let (newick, mut annotations) = split_annotations(&block.body);
            let mut tree = match Tree::from_newick(newick.trim()) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Failed to parse tree {} at index {}: {}", path.display(), idx, e);
                    return None;
                }
            };

            if options.use_real_taxa && !taxa.is_empty() {
                rename_leaf_nodes(&mut tree, &taxa);
                for annotation in &mut annotations {
                    for leaf in &mut annotation.leaves {
                        if let Some(label) = taxa.get(leaf.as_str()) {
                            leaf.clone_from(label);
                        }
                    }
                }
            }

            let name = format!("{base_name}_tree_STATE{}", state.unwrap_or(0));
            Some(SampledTree {
                name,
                state,
                tree,
                annotations,
            })
        })
        .collect();

    if trees.is_empty() {
        return Err(CcdError::NoTrees {
            source_name: path.display().to_string(),
        });
    }

    debug!("Read {} trees from {}", trees.len(), path.display());
    Ok(TreeSample { taxa, trees })
}

/// Read several files into one sample; tree names get a `file<k>_` prefix.
pub fn read_tree_files<P: AsRef<Path>>(paths: &[P], options: &ReadOptions) -> Result<Vec<SampledTree>> {
    let mut all = Vec::new();
    for (file_idx, path) in paths.iter().enumerate() {
        let sample = read_beast_trees(path, options)?;
        all.extend(sample.trees.into_iter().map(|mut t| {
            if paths.len() > 1 {
                t.name = format!("file{file_idx}_{}", t.name);
            }
            t
        }));
    }
    if all.is_empty() {
        return Err(CcdError::NoTrees {
            source_name: "the provided files".to_string(),
        });
    }
    Ok(all)
}

fn extract_state(header: &str) -> Option<usize> {
    let start = header.to_ascii_uppercase().find("STATE_")?;
    header[start + 6..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()
}

struct TreeBlock<'a> {
    header: &'a str,
    body: String,
}

fn collect_tree_blocks(content: &str) -> Vec<TreeBlock<'_>> {
    content
        .lines()
        .skip_while(|line| !line.trim_start().to_ascii_uppercase().starts_with("TREE "))
        .take_while(|line| !line.trim().to_ascii_uppercase().starts_with("END;"))
        .filter_map(|line| {
            let (header, body) = line.split_once(" = ")?;
            Some(TreeBlock {
                header: header.trim(),
                body: body.trim().to_string(),
            })
        })
        .collect()
}

fn parse_taxon_block(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .skip_while(|line| !line.trim().to_ascii_uppercase().starts_with("TRANSLATE"))
        .skip(1)
        .take_while(|line| !line.trim().starts_with(';'))
        // 1 '1959.M.CD.59.ZR59',
        .filter_map(|line| {
            let line = line.trim().trim_end_matches([',', ';']);
            let (id, label) = line.split_once(char::is_whitespace)?;
            let label = label.trim().trim_matches('\'');
            Some((id.to_string(), label.to_string()))
        })
        .collect()
}

/// Replace leaf labels through a translation table; unknown labels are kept.
pub fn rename_leaf_nodes(tree: &mut Tree, translate: &HashMap<String, String>) {
    for leaf_id in tree.get_leaves() {
        if let Ok(node) = tree.get_mut(&leaf_id) {
            if let Some(label) = node.name.as_ref().and_then(|n| translate.get(n)) {
                node.name = Some(label.clone());
            }
        }
    }
}

/// Open an output sink: `-` is stdout, a `.gz` suffix gzip-compresses.
fn open_output(path: &Path) -> io::Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout().lock())));
    }
    let file = File::create(path)?;
    if path.to_string_lossy().ends_with(".gz") {
        Ok(Box::new(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Write a MAP tree as a one-tree NEXUS file.
pub fn write_map_nexus<P: AsRef<Path>>(
    path: P,
    name: &str,
    map: &MapTree,
    registry: &TaxonRegistry,
) -> Result<()> {
    let mut out = open_output(path.as_ref())?;
    writeln!(out, "#NEXUS")?;
    writeln!(out)?;
    writeln!(out, "BEGIN TREES;")?;
    writeln!(
        out,
        "\ttree {name} = [&lnP={},tie_breaks={}] {}",
        map.log_probability(),
        map.tie_breaks(),
        map.to_newick(registry)
    )?;
    writeln!(out, "END;")?;
    out.flush()?;
    Ok(())
}

/// Write clade frequencies as TSV: clade, size, count, frequency.
pub fn write_clade_table_tsv<P: AsRef<Path>>(
    path: P,
    rows: &[CladeFrequency],
    registry: &TaxonRegistry,
) -> Result<()> {
    let mut out = open_output(path.as_ref())?;
    writeln!(out, "clade\tsize\tcount\tfrequency")?;
    for row in rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            row.clade.describe(registry),
            row.clade.len(),
            row.count,
            row.frequency
        )?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::path::PathBuf;

    use flate2::read::GzDecoder;

    const BEAST: &str = "#NEXUS

Begin taxa;
\tDimensions ntax=3;
End;

Begin trees;
\tTranslate
\t\t1 'Homo sapiens',
\t\t2 Chimp,
\t\t3 Gorilla
\t\t;
tree STATE_0 = [&lnP=-10.5] ((1[&blockcount=-1]:1.0,2[&blockcount=0]:1.0)[&blockcount=-1]:1.0,3[&blockcount=1]:2.0);
tree STATE_1000 = [&lnP=-9.5] ((1:1.0,3:1.0):1.0,2:2.0);
tree STATE_2000 = [&lnP=-9.0] ((2:1.0,3:1.0):1.0,1:2.0);
tree STATE_3000 = [&lnP=-8.5] ((1:1.0,2:1.0):1.0,3:2.0);
End;
";

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ccd_io_{}_{name}", std::process::id()))
    }

    fn write_sample(name: &str) -> PathBuf {
        let path = temp_path(name);
        fs::write(&path, BEAST).unwrap();
        path
    }

    #[test]
    fn test_split_annotations() {
        let (stripped, annotations) = split_annotations(
            "[&R] ((A[&blockcount=-1]:1.0,B:[&blockcount=0,rate={1,2}]1.0)[&blockcount=2]:1.0,C:2.0);",
        );
        assert_eq!(stripped, " ((A:1.0,B:1.0):1.0,C:2.0);");
        assert_eq!(annotations.len(), 3);

        assert_eq!(annotations[0].leaves, ["A"]);
        assert_eq!(annotations[0].fields["blockcount"], "-1");
        assert_eq!(annotations[1].leaves, ["B"]);
        assert_eq!(annotations[1].fields["rate"], "{1,2}");
        assert_eq!(annotations[2].leaves, ["A", "B"]);
        assert_eq!(annotations[2].fields["blockcount"], "2");
    }

    #[test]
    fn test_split_annotations_quoted_labels() {
        let (stripped, annotations) = split_annotations("(('a b'[&x=1]:1,c:1):1,d:1);");
        assert_eq!(stripped, "(('a b':1,c:1):1,d:1);");
        assert_eq!(annotations[0].leaves, ["a b"]);
    }

    #[test]
    fn test_extract_state() {
        assert_eq!(extract_state("tree STATE_1200"), Some(1200));
        assert_eq!(extract_state("tree TREE1"), None);
    }

    #[test]
    fn test_read_with_translate_and_annotations() {
        let path = write_sample("translate.trees");
        let options = ReadOptions {
            use_real_taxa: true,
            ..ReadOptions::default()
        };
        let sample = read_beast_trees(&path, &options).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(sample.taxa.len(), 3);
        assert_eq!(sample.taxa["1"], "Homo sapiens");
        assert_eq!(sample.trees.len(), 4);

        let first = &sample.trees[0];
        assert!(first.name.ends_with("_tree_STATE0"));
        assert_eq!(first.state, Some(0));
        let registry = TaxonRegistry::from_tree(&first.tree).unwrap();
        assert_eq!(registry.labels(), ["Chimp", "Gorilla", "Homo sapiens"]);

        let pair = first
            .annotations
            .iter()
            .find(|a| a.leaves.len() == 2)
            .unwrap();
        assert_eq!(pair.leaves, ["Homo sapiens", "Chimp"]);
        assert_eq!(pair.fields["blockcount"], "-1");
    }

    #[test]
    fn test_burnin_filters() {
        let path = write_sample("burnin.trees");
        let read = |options: ReadOptions| {
            read_beast_trees(&path, &options)
                .unwrap()
                .trees
                .iter()
                .map(|t| t.state.unwrap())
                .collect::<Vec<_>>()
        };

        let by_count = read(ReadOptions { burnin_trees: 1, ..ReadOptions::default() });
        let by_state = read(ReadOptions { burnin_states: 1000, ..ReadOptions::default() });
        let by_fraction = read(ReadOptions { burnin_fraction: 0.5, ..ReadOptions::default() });
        let too_much = read_beast_trees(&path, &ReadOptions { burnin_trees: 10, ..ReadOptions::default() });
        let invalid = read_beast_trees(&path, &ReadOptions { burnin_fraction: 1.0, ..ReadOptions::default() });
        fs::remove_file(&path).ok();

        assert_eq!(by_count, [1000, 2000, 3000]);
        assert_eq!(by_state, [2000, 3000]);
        assert_eq!(by_fraction, [2000, 3000]);
        assert!(matches!(too_much, Err(CcdError::NoTrees { .. })));
        assert!(matches!(invalid, Err(CcdError::InvalidBurnin(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = read_beast_trees(temp_path("does_not_exist.trees"), &ReadOptions::default())
            .unwrap_err();
        assert!(matches!(err, CcdError::Io(_)));
    }

    #[test]
    fn test_clade_table_gz() {
        let registry = TaxonRegistry::from_labels(["A", "B", "C"]).unwrap();
        let rows = vec![CladeFrequency {
            clade: crate::clade::Clade::new(registry.encode(["A", "B"]).unwrap()),
            count: 3,
            frequency: 0.75,
        }];
        let path = temp_path("clades.tsv.gz");
        write_clade_table_tsv(&path, &rows, &registry).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(text, "clade\tsize\tcount\tfrequency\n{A,B}\t2\t3\t0.75\n");
    }
}
