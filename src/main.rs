use clap::{Parser, ValueEnum};
use rust_python_ccd::ccd::{Variant, build_from_sample};
use rust_python_ccd::io::{ReadOptions, read_beast_trees, write_clade_table_tsv, write_map_nexus};
use rust_python_ccd::taxa::TaxonRegistry;
use rust_python_ccd::transmission::TransmissionKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Level, error, info, warn};

/// Build a conditional clade distribution from a BEAST/NEXUS tree sample and
/// write its MAP tree (NEXUS) or, for CCD0, its clade frequency table (TSV).
#[derive(Parser, Debug)]
#[command(name = "rust-python-ccd", version, about = "CCD MAP trees for BEAST tree samples")]
struct Args {
    /// Path to BEAST .trees (NEXUS) file
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output path (`-` for stdout, `.gz` suffix for gzip)
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Burn-in by number of trees (drop first N trees)
    #[arg(short = 't', long = "burnin-trees", default_value_t = 0)]
    burnin_trees: usize,

    /// Burn-in by state (keep trees with STATE_ > value)
    #[arg(short = 's', long = "burnin-states", default_value_t = 0)]
    burnin_states: usize,

    /// Burn-in as a leading fraction of the remaining trees, in [0, 1)
    #[arg(short = 'b', long = "burnin-fraction", default_value_t = 0.0)]
    burnin_fraction: f64,

    /// Use TRANSLATE block to map taxon IDs to labels when available
    #[arg(long = "use-real-taxa", default_value_t = false)]
    use_real_taxa: bool,

    /// Distribution to build: ccd0 | ccd1 | ccd2 | tccd-blocks | tccd-ancestry
    #[arg(long = "variant", value_enum, default_value_t = VariantArg::Ccd1)]
    variant: VariantArg,

    /// Name of the MAP tree in the NEXUS output
    #[arg(long = "tree-name", default_value = "CCD_MAP")]
    tree_name: String,

    /// Also write the clade frequency table to this path
    #[arg(long = "clade-table")]
    clade_table: Option<PathBuf>,

    /// Quiet mode: only warnings and errors
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,

    /// Verbose mode: debug messages
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum VariantArg {
    Ccd0,
    Ccd1,
    Ccd2,
    TccdBlocks,
    TccdAncestry,
}

impl From<VariantArg> for Variant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Ccd0 => Variant::Ccd0,
            VariantArg::Ccd1 => Variant::Ccd1,
            VariantArg::Ccd2 => Variant::Ccd2,
            VariantArg::TccdBlocks => Variant::Transmission(TransmissionKind::Blocks),
            VariantArg::TccdAncestry => Variant::Transmission(TransmissionKind::Ancestry),
        }
    }
}

fn init_logging(quiet: bool, verbose: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::WARN,
        (false, true) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.quiet, args.verbose);
    let variant = Variant::from(args.variant);

    // Read trees with names
    let t0 = Instant::now();
    let options = ReadOptions {
        burnin_trees: args.burnin_trees,
        burnin_states: args.burnin_states,
        burnin_fraction: args.burnin_fraction,
        use_real_taxa: args.use_real_taxa,
    };
    let sample = match read_beast_trees(&args.input, &options) {
        Ok(s) => s,
        Err(e) => {
            error!("No trees parsed from {:?}: {e}", args.input);
            std::process::exit(2);
        }
    };
    info!("Reading in beast {:.3}s", t0.elapsed().as_secs_f64());
    info!("Read in {} taxons for {} trees", sample.taxa.len(), sample.trees.len());

    // The first tree kept after burn-in defines the taxon universe
    let registry = match TaxonRegistry::from_tree(&sample.trees[0].tree) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("Failed to derive taxa from {}: {e}", sample.trees[0].name);
            std::process::exit(3);
        }
    };

    let t1 = Instant::now();
    let outcome = match build_from_sample(Arc::clone(&registry), variant, &sample.trees) {
        Ok(o) => o,
        Err(e) => {
            error!("Failed to build {variant}: {e}");
            std::process::exit(3);
        }
    };
    let ccd = outcome.distribution;
    info!(
        "Building {variant} from {} trees over {} taxa {:.3}s",
        ccd.tree_count(),
        registry.len(),
        t1.elapsed().as_secs_f64()
    );
    if !outcome.rejected.is_empty() {
        warn!("{} of {} trees were rejected", outcome.rejected.len(), sample.trees.len());
    }

    if let Some(path) = &args.clade_table {
        if let Err(e) = write_clade_table_tsv(path, &ccd.clade_frequencies(), &registry) {
            error!("Failed to write clade table {path:?}: {e}");
            std::process::exit(5);
        }
    }

    if !variant.records_splits() {
        let t2 = Instant::now();
        if let Err(e) = write_clade_table_tsv(&args.output, &ccd.clade_frequencies(), &registry) {
            error!("Failed to write output {:?}: {e}", args.output);
            std::process::exit(5);
        }
        log_write_done(&args.output, t2.elapsed().as_secs_f64());
        return;
    }

    let t2 = Instant::now();
    let map = match ccd.map_tree() {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to compute the MAP tree: {e}");
            std::process::exit(4);
        }
    };
    info!(
        "Determining MAP tree {:.3}s, log-probability {:.6}",
        t2.elapsed().as_secs_f64(),
        map.log_probability()
    );
    match ccd.entropy() {
        Ok(h) => info!("Entropy of the {variant} {h:.6}"),
        Err(e) => warn!("Entropy unavailable: {e}"),
    }

    let t3 = Instant::now();
    if let Err(e) = write_map_nexus(&args.output, &args.tree_name, &map, &registry) {
        error!("Failed to write output {:?}: {e}", args.output);
        std::process::exit(5);
    }
    log_write_done(&args.output, t3.elapsed().as_secs_f64());
}

fn log_write_done(output: &PathBuf, secs: f64) {
    if output.as_os_str() == "-" {
        info!("Writing to stdout {secs:.3}s");
    } else {
        info!("Writing to output {secs:.3}s");
    }
}
