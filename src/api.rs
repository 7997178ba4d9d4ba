//! Python binding layer for CCD summaries.
//!
//! Provides Python functions for building conditional clade distributions
//! from BEAST/NEXUS tree files and extracting MAP trees.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::ccd::{ConditionalCladeDistribution, Variant, build_from_files};
use crate::error::CcdError;
use crate::io::ReadOptions;

fn to_py(e: CcdError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// Read all files and build one distribution over them.
fn build(
    paths: &[String],
    variant: &str,
    burnin_trees: usize,
    burnin_states: usize,
    use_real_taxa: bool,
) -> PyResult<ConditionalCladeDistribution> {
    let variant: Variant = variant.parse().map_err(PyValueError::new_err)?;
    let options = ReadOptions {
        burnin_trees,
        burnin_states,
        use_real_taxa,
        ..ReadOptions::default()
    };
    let outcome = build_from_files(paths, variant, &options).map_err(to_py)?;
    Ok(outcome.distribution)
}

/// Compute the MAP tree of a conditional clade distribution.
///
/// Args:
///     paths: List of file paths to BEAST/NEXUS tree files
///     variant: "ccd1", "ccd2", "tccd-blocks" or "tccd-ancestry" (default: "ccd1")
///     burnin_trees: Number of trees to skip at the beginning of each file (default: 0)
///     burnin_states: Minimum STATE value to keep trees (default: 0)
///     use_real_taxa: Use TRANSLATE block for taxon names when available (default: True)
///
/// Returns:
///     A tuple of (newick, log_probability)
///
/// Raises:
///     ValueError: If no trees are found or the variant has no MAP tree.
///     Trees that do not match the taxon set are skipped with a warning.
#[pyfunction]
#[pyo3(signature = (paths, variant="ccd1", burnin_trees=0, burnin_states=0, use_real_taxa=true))]
fn map_tree(
    paths: Vec<String>,
    variant: &str,
    burnin_trees: usize,
    burnin_states: usize,
    use_real_taxa: bool,
) -> PyResult<(String, f64)> {
    let ccd = build(&paths, variant, burnin_trees, burnin_states, use_real_taxa)?;
    let map = ccd.map_tree().map_err(to_py)?;
    Ok((map.to_newick(ccd.registry()), map.log_probability()))
}

/// Marginal frequencies of all non-leaf clades.
///
/// Returns:
///     A list of (taxa, frequency) tuples, largest clades first
#[pyfunction]
#[pyo3(signature = (paths, variant="ccd0", burnin_trees=0, burnin_states=0, use_real_taxa=true))]
fn clade_frequencies(
    paths: Vec<String>,
    variant: &str,
    burnin_trees: usize,
    burnin_states: usize,
    use_real_taxa: bool,
) -> PyResult<Vec<(Vec<String>, f64)>> {
    let ccd = build(&paths, variant, burnin_trees, burnin_states, use_real_taxa)?;
    let registry = ccd.registry();
    Ok(ccd
        .clade_frequencies()
        .into_iter()
        .map(|row| {
            let taxa = row
                .clade
                .taxa
                .ones()
                .filter_map(|i| registry.label(i).map(str::to_string))
                .collect();
            (taxa, row.frequency)
        })
        .collect())
}

/// Python module definition
#[pymodule]
fn rust_python_ccd(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(map_tree, m)?)?;
    m.add_function(wrap_pyfunction!(clade_frequencies, m)?)?;
    Ok(())
}
