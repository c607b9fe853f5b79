use clap::{Parser, ValueEnum};

use crate::config::defs::SequenceType;
use crate::pipelines::orchestrator::TreeFormat;

#[derive(Debug, Clone, ValueEnum, Default, PartialEq)]
pub enum SeqTypeArg {
    #[value(name = "DNA")]
    Dna,
    #[default]
    Peptide,
}

#[derive(Debug, Clone, ValueEnum, Default, PartialEq)]
pub enum TreeFormatArg {
    #[default]
    Newick,
    Phyloxml,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "phylo-pipelines", version, about = "Queue alignment and tree-building runs over sequence collections")]
pub struct Arguments {

    #[arg(short, long, help = "One of: ingest, hmm, calculate, status, log, alignment, tree, families, delete, check_tools, config")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, help = "Settings file (YAML or JSON). Falls back to $PHYLO_SETTINGS")]
    pub config: Option<String>,

    #[arg(long = "data", help = "Overrides the data_path setting")]
    pub data_path: Option<String>,

    #[arg(long)]
    pub threads: Option<usize>,

    #[arg(short = 'c', long)]
    pub collection: Option<String>,

    #[arg(short = 's', long)]
    pub subcollection: Option<String>,

    #[arg(short = 'k', long, help = "aligner, tree builder, or aligner_builder, e.g. hmmalign_FastTree")]
    pub calculation: Option<String>,

    #[arg(short = 'i', long = "input", help = "FASTA file to ingest (plain or gzipped), or HMM for the hmm module")]
    pub input: Option<String>,

    #[arg(long = "seq_type", default_value = "peptide", value_enum)]
    pub seq_type: SeqTypeArg,

    #[arg(long = "data_name", default_value = "sequences")]
    pub data_name: String,

    #[arg(short = 't', long, help = "Tool whose stage to query, e.g. hmmalign or FastTree")]
    pub tool: Option<String>,

    #[arg(long, default_value = "newick", value_enum)]
    pub format: TreeFormatArg,
}

impl From<&SeqTypeArg> for SequenceType {
    fn from(arg: &SeqTypeArg) -> Self {
        match arg {
            SeqTypeArg::Dna => SequenceType::Dna,
            SeqTypeArg::Peptide => SequenceType::Peptide,
        }
    }
}

impl From<&TreeFormatArg> for TreeFormat {
    fn from(arg: &TreeFormatArg) -> Self {
        match arg {
            TreeFormatArg::Newick => TreeFormat::Newick,
            TreeFormatArg::Phyloxml => TreeFormat::PhyloXml,
        }
    }
}
