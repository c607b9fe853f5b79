/// Success-only finalization of raw tool output into served artifacts.
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use log::{debug, info};

use crate::config::defs::{PipelineError, PostProcess, Stage};
use crate::utils::fastx::{read_stockholm, write_fasta_file};
use crate::utils::tree::Tree;


/// What to do with a stage's raw output once its tool has exited.
#[derive(Debug, Clone, PartialEq)]
pub enum PostProcessor {
    /// Rewrite a Stockholm alignment as FASTA.
    StockholmToFasta { fasta_path: PathBuf },
    /// Root, ladderize and rename a raw Newick tree, then write Newick and
    /// PhyloXML copies.
    CleanupTree {
        clean_path: PathBuf,
        make_rooted: bool,
        root_name: String,
        xml_path: PathBuf,
    },
}

impl PostProcessor {
    pub fn kind(&self) -> PostProcess {
        match self {
            PostProcessor::StockholmToFasta { .. } => PostProcess::StockholmToFasta,
            PostProcessor::CleanupTree { .. } => PostProcess::CleanupTree,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            PostProcessor::StockholmToFasta { .. } => Stage::Alignment,
            PostProcessor::CleanupTree { .. } => Stage::Tree,
        }
    }

    /// Runs the step against `raw_path` if `exit_code` is zero; otherwise
    /// does nothing.
    ///
    /// # Returns
    /// Ok(true) if the step ran, Ok(false) if skipped, PostProcessing on
    /// any parse or write failure.
    pub fn apply(&self, raw_path: &Path, exit_code: i32) -> Result<bool, PipelineError> {
        if exit_code != 0 {
            debug!("Skipping {:?} post-processing after exit code {}", self.kind(), exit_code);
            return Ok(false);
        }
        let result = match self {
            PostProcessor::StockholmToFasta { fasta_path } => stockholm_to_fasta(raw_path, fasta_path),
            PostProcessor::CleanupTree { clean_path, make_rooted, root_name, xml_path } => {
                cleanup_tree(raw_path, clean_path, *make_rooted, root_name, xml_path)
            }
        };
        result.map(|_| true).map_err(|e| match e {
            PipelineError::PostProcessing { .. } => e,
            other => PipelineError::PostProcessing { stage: self.stage(), error: other.to_string() },
        })
    }
}


/// Converts a Stockholm alignment to FASTA.
///
/// # Returns
/// Number of alignment rows written.
pub fn stockholm_to_fasta(stockholm_path: &Path, fasta_path: &Path) -> Result<usize, PipelineError> {
    let reader = BufReader::new(File::open(stockholm_path)?);
    let rows = read_stockholm(reader)?;
    write_fasta_file(fasta_path, &rows)?;
    info!("Wrote {} aligned sequences to {}", rows.len(), fasta_path.display());
    Ok(rows.len())
}

/// Cleans a raw tree: optional midpoint rooting, ladderizing, root naming.
/// Both outputs are written from the same in-memory tree.
///
/// # Arguments
///
/// * `raw_path` - Newick output of the tree builder.
/// * `clean_path` - Destination for the cleaned Newick tree.
/// * `make_rooted` - Re-root at the midpoint before ladderizing.
/// * `root_name` - Name given to the root node.
/// * `xml_path` - Destination for the PhyloXML tree.
///
/// # Returns
/// Number of terminals in the tree.
pub fn cleanup_tree(
    raw_path: &Path,
    clean_path: &Path,
    make_rooted: bool,
    root_name: &str,
    xml_path: &Path,
) -> Result<usize, PipelineError> {
    let text = fs::read_to_string(raw_path)?;
    let mut tree = Tree::from_newick(&text)?;
    if make_rooted {
        tree.root_at_midpoint();
    }
    tree.ladderize();
    tree.set_root_name(root_name);

    let newick = tree.to_newick();
    let xml = tree.to_phyloxml()?;
    fs::write(clean_path, newick)?;
    fs::write(xml_path, xml)?;

    let terminals = tree.leaf_names().len();
    info!("Wrote tree of {} terminals to {}", terminals, clean_path.display());
    Ok(terminals)
}
