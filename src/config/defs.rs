use std::collections::HashMap;
use std::fmt;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// External software
pub const HMMALIGN_TAG: &str = "hmmalign";
pub const FASTTREE_TAG: &str = "FastTree";
pub const RAXML_TAG: &str = "RAxML";
pub const HMMSTAT_TAG: &str = "hmmstat";
pub const CALCULATION_SEPARATOR: char = '_';

// Static Filenames
pub const SEQUENCES_NAME: &str = "sequences";
pub const ALIGNMENT_NAME: &str = "alignment";
pub const RUN_LOG_NAME: &str = "run_log.txt";
pub const STATUS_NAME: &str = "status.txt";
pub const STOCKHOLM_NAME: &str = "alignment.stockholm";
pub const RAW_TREE_NAME: &str = "tree_raw.nwk";
pub const TREE_NAME: &str = "tree.nwk";
pub const PHYLOXML_NAME: &str = "tree.xml";
pub const SEQUENCE_DATA_NAME: &str = "sequence_data.json";
pub const HMM_FILENAME: &str = "family.hmm";
pub const HMMSTATS_NAME: &str = "hmmstats.json";
pub const FAMILIES_NAME: &str = "families.json";

// Static Parameters
pub const STATUS_RUNNING: i32 = -1;
pub const THREADS_ENV_VAR: &str = "OMP_NUM_THREADS";
pub const RAXML_RUN_NAME: &str = "production";
pub const DEFAULT_DIR_MODE: u32 = 0o755;


/// Sequence alphabets a collection may hold. `ORDER` is the lookup order used
/// whenever both variants are on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceType {
    #[serde(rename = "DNA")]
    Dna,
    #[serde(rename = "peptide")]
    Peptide,
}

impl SequenceType {
    pub const ORDER: [SequenceType; 2] = [SequenceType::Dna, SequenceType::Peptide];

    pub fn tag(&self) -> &'static str {
        match self {
            SequenceType::Dna => "DNA",
            SequenceType::Peptide => "peptide",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SequenceType::Dna => "fna",
            SequenceType::Peptide => "faa",
        }
    }

    /// hmmalign alphabet switch.
    pub fn hmm_switch(&self) -> &'static str {
        match self {
            SequenceType::Dna => "--dna",
            SequenceType::Peptide => "--amino",
        }
    }

    pub fn file_name(&self, base: &str) -> String {
        format!("{}.{}", base, self.extension())
    }

    pub fn from_tag(tag: &str) -> Result<SequenceType, PipelineError> {
        SequenceType::ORDER
            .into_iter()
            .find(|t| t.tag().eq_ignore_ascii_case(tag) || t.extension() == tag)
            .ok_or_else(|| PipelineError::InvalidInput(format!("Unrecognized sequence type: {}", tag)))
    }
}

impl fmt::Display for SequenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Alignment,
    Tree,
}

impl Stage {
    pub fn tag(&self) -> &'static str {
        match self {
            Stage::Alignment => "alignment",
            Stage::Tree => "tree",
        }
    }

    /// Placeholder run-time estimate in seconds.
    pub fn estimated_seconds(&self) -> u64 {
        match self {
            Stage::Alignment => 10,
            Stage::Tree => 60,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tool {
    #[serde(rename = "hmmalign")]
    Hmmalign,
    #[serde(rename = "FastTree")]
    FastTree,
    #[serde(rename = "RAxML")]
    RAxML,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcess {
    StockholmToFasta,
    CleanupTree,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub tool: Tool,
    pub stage: Stage,
    pub post_process: PostProcess,
    pub version_switch: &'static str,
}

lazy_static! {
    pub static ref TOOL_TABLE: HashMap<&'static str, ToolSpec> = {
        let mut m = HashMap::new();
        m.insert(HMMALIGN_TAG, ToolSpec {
            tool: Tool::Hmmalign,
            stage: Stage::Alignment,
            post_process: PostProcess::StockholmToFasta,
            version_switch: "-h",
        });
        m.insert(FASTTREE_TAG, ToolSpec {
            tool: Tool::FastTree,
            stage: Stage::Tree,
            post_process: PostProcess::CleanupTree,
            version_switch: "-expert",
        });
        m.insert(RAXML_TAG, ToolSpec {
            tool: Tool::RAxML,
            stage: Stage::Tree,
            post_process: PostProcess::CleanupTree,
            version_switch: "-v",
        });
        m
    };

    /// Names that may never be used for a collection or sub-collection,
    /// since they would shadow an artifact or a tree-builder directory.
    pub static ref RESERVED_NAMES: Vec<String> = {
        let mut names = vec![String::new()];
        for seq_type in SequenceType::ORDER {
            names.push(seq_type.file_name(ALIGNMENT_NAME));
            names.push(seq_type.file_name(SEQUENCES_NAME));
        }
        for name in [
            HMM_FILENAME, STATUS_NAME, SEQUENCE_DATA_NAME, RUN_LOG_NAME, STOCKHOLM_NAME,
            HMMSTATS_NAME, FAMILIES_NAME, PHYLOXML_NAME, TREE_NAME, RAW_TREE_NAME,
        ] {
            names.push(name.to_string());
        }
        for tool in Tool::ALL {
            names.push(tool.tag().to_string());
        }
        names
    };
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::Hmmalign, Tool::FastTree, Tool::RAxML];

    pub fn tag(&self) -> &'static str {
        match self {
            Tool::Hmmalign => HMMALIGN_TAG,
            Tool::FastTree => FASTTREE_TAG,
            Tool::RAxML => RAXML_TAG,
        }
    }

    pub fn from_tag(tag: &str) -> Result<Tool, PipelineError> {
        TOOL_TABLE
            .get(tag)
            .map(|spec| spec.tool)
            .ok_or_else(|| PipelineError::UnknownTool(tag.to_string()))
    }

    pub fn spec(&self) -> &'static ToolSpec {
        &TOOL_TABLE[self.tag()]
    }

    pub fn stage(&self) -> Stage {
        self.spec().stage
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.iter().any(|reserved| reserved == name)
}


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Reserved name: \"{0}\"")]
    ReservedName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown calculation: {0}")]
    UnknownCalculation(String),

    #[error("Stage already queued or running in {0}")]
    AlreadyRunning(String),

    #[error("{tool} exited with status {code}")]
    ExternalProcessFailure { tool: String, code: i32 },

    #[error("Post-processing of {stage} failed: {error}")]
    PostProcessing { stage: Stage, error: String },

    #[error("{tool} could not be run: {error}")]
    ToolNotFound { tool: String, error: String },

    #[error("{tool} ran but its output was not recognized: {output}")]
    UnrecognizedToolOutput { tool: String, output: String },

    #[error("Job {job} exceeded its {seconds} second limit")]
    Timeout { job: String, seconds: u64 },

    #[error("Job {job} not run because dependency {dependency} failed")]
    DependencyFailed { job: String, dependency: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tool execution failed for {tool}: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    IOError(String),
}

impl PipelineError {
    /// Status code the HTTP boundary is expected to answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineError::ReservedName(_) => 403,
            PipelineError::NotFound(_)
            | PipelineError::UnknownTool(_)
            | PipelineError::UnknownCalculation(_) => 404,
            PipelineError::InvalidInput(_) => 406,
            PipelineError::AlreadyRunning(_) => 409,
            _ => 500,
        }
    }

    /// True for errors raised synchronously, before anything is queued.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            PipelineError::ReservedName(_)
                | PipelineError::NotFound(_)
                | PipelineError::UnknownTool(_)
                | PipelineError::UnknownCalculation(_)
                | PipelineError::AlreadyRunning(_)
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}
