//! Run-time settings for the calculation pipeline.
//!
//! Values come from built-in defaults, then an optional YAML or JSON settings
//! file, then `PHYLO_*` environment overrides for the scalar fields.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::defs::{PipelineError, SequenceType, Stage, Tool, DEFAULT_DIR_MODE};

pub const ENV_PREFIX: &str = "PHYLO_";
pub const SETTINGS_ENV_VAR: &str = "PHYLO_SETTINGS";


#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root under which every collection directory lives
    pub data_path: PathBuf,

    /// Threads handed to external tools, 0 = use all available
    pub threads: usize,

    pub alignment_queue: String,
    pub tree_queue: String,

    pub alignment_timeout_secs: u64,
    pub tree_timeout_secs: u64,

    /// Worker tasks started per named queue
    pub workers_per_queue: usize,

    /// Prefix placed ahead of every external executable, e.g. `nice`
    pub wrapper: Vec<String>,

    pub dir_mode: u32,

    pub tools: ToolsConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/"),
            threads: 0,
            alignment_queue: "alignment".to_string(),
            tree_queue: "treebuilding".to_string(),
            alignment_timeout_secs: 1000,
            tree_timeout_secs: 4 * 60 * 60,
            workers_per_queue: 1,
            wrapper: vec!["nice".to_string()],
            dir_mode: DEFAULT_DIR_MODE,
            tools: ToolsConfig::default(),
        }
    }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub hmmalign: CommandSettings,
    /// Model checker run on uploaded HMMs
    pub hmmstat: CommandSettings,
    #[serde(rename = "FastTree")]
    pub fasttree: TreeBuilderSettings,
    #[serde(rename = "RAxML")]
    pub raxml: TreeBuilderSettings,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            hmmalign: CommandSettings {
                executable: "hmmalign".to_string(),
                args: strings(&["--trim", "--informat", "FASTA"]),
            },
            hmmstat: CommandSettings {
                executable: "hmmstat".to_string(),
                args: Vec::new(),
            },
            fasttree: TreeBuilderSettings {
                executable: "FastTree".to_string(),
                peptide: strings(&["-nopr", "-log", "peptide.log"]),
                dna: strings(&["-nt", "-gtr", "-log", "nucleotide.log", "-nopr"]),
            },
            raxml: TreeBuilderSettings {
                executable: "raxmlHPC".to_string(),
                peptide: strings(&["-b", "12345", "-p", "12345", "-N", "10", "-m", "PROTGAMMABLOSUM62"]),
                dna: strings(&["-d"]),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandSettings {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TreeBuilderSettings {
    pub executable: String,
    #[serde(default)]
    pub peptide: Vec<String>,
    #[serde(default, rename = "DNA")]
    pub dna: Vec<String>,
}

impl TreeBuilderSettings {
    pub fn args_for(&self, seq_type: SequenceType) -> &[String] {
        match seq_type {
            SequenceType::Dna => &self.dna,
            SequenceType::Peptide => &self.peptide,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}


impl Settings {
    /// Load settings from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "json" => Self::from_json(&contents),
            // YAML is a superset of JSON
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(yaml).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    /// Builds the effective settings: defaults, then the settings file (an
    /// explicit path wins over `PHYLO_SETTINGS`), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(SETTINGS_ENV_VAR).map(PathBuf::from));
        let mut settings = match file {
            Some(file) => {
                debug!("Reading settings from {}", file.display());
                Self::from_file(&file)?
            }
            None => Self::default(),
        };
        let vars: HashMap<String, String> = std::env::vars().collect();
        settings.apply_overrides(&vars)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `PHYLO_<FIELD>` overrides from the given variables.
    pub fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<(), PipelineError> {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "DATA_PATH" => self.data_path = PathBuf::from(value),
                "THREADS" => self.threads = parse_override(key, value)?,
                "ALIGNMENT_QUEUE" => self.alignment_queue = value.clone(),
                "TREE_QUEUE" => self.tree_queue = value.clone(),
                "ALIGNMENT_TIMEOUT_SECS" => self.alignment_timeout_secs = parse_override(key, value)?,
                "TREE_TIMEOUT_SECS" => self.tree_timeout_secs = parse_override(key, value)?,
                "WORKERS_PER_QUEUE" => self.workers_per_queue = parse_override(key, value)?,
                _ => continue,
            }
            debug!("Setting {} overridden from environment", field);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.alignment_queue.is_empty() || self.tree_queue.is_empty() {
            return Err(PipelineError::InvalidConfig("Queue names must not be empty".to_string()));
        }
        if self.alignment_timeout_secs == 0 || self.tree_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig("Stage timeouts must be > 0".to_string()));
        }
        if self.workers_per_queue == 0 {
            return Err(PipelineError::InvalidConfig("workers_per_queue must be > 0".to_string()));
        }
        for tool in Tool::ALL {
            if self.executable(tool).is_empty() {
                return Err(PipelineError::InvalidConfig(format!("No executable configured for {}", tool)));
            }
        }
        if self.tools.hmmstat.executable.is_empty() {
            return Err(PipelineError::InvalidConfig("No executable configured for hmmstat".to_string()));
        }
        Ok(())
    }

    pub fn executable(&self, tool: Tool) -> &str {
        match tool {
            Tool::Hmmalign => &self.tools.hmmalign.executable,
            Tool::FastTree => &self.tools.fasttree.executable,
            Tool::RAxML => &self.tools.raxml.executable,
        }
    }

    pub fn queue_name(&self, stage: Stage) -> &str {
        match stage {
            Stage::Alignment => &self.alignment_queue,
            Stage::Tree => &self.tree_queue,
        }
    }

    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Alignment => Duration::from_secs(self.alignment_timeout_secs),
            Stage::Tree => Duration::from_secs(self.tree_timeout_secs),
        }
    }

    /// Thread count with 0 resolved to the number of available cores.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 { self.threads } else { num_cpus::get() }
    }

    /// Extra environment for child processes.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if self.threads > 0 {
            env.push((crate::config::defs::THREADS_ENV_VAR.to_string(), self.threads.to_string()));
        }
        env
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PipelineError> {
    value
        .parse()
        .map_err(|_| PipelineError::InvalidConfig(format!("Cannot parse {}={}", key, value)))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.queue_name(Stage::Tree), "treebuilding");
        assert_eq!(settings.stage_timeout(Stage::Alignment), Duration::from_secs(1000));
        assert!(settings.child_env().is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "threads: 4\ntools:\n  FastTree:\n    executable: FastTree-double\n    DNA: [\"-nt\"]\n";
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.threads, 4);
        assert_eq!(settings.tools.fasttree.executable, "FastTree-double");
        assert_eq!(settings.tools.fasttree.args_for(SequenceType::Dna), ["-nt".to_string()]);
        assert!(settings.tools.fasttree.peptide.is_empty());
        assert_eq!(settings.tools.hmmalign.executable, "hmmalign");
        assert_eq!(settings.tools.hmmstat.executable, "hmmstat");
        assert_eq!(settings.child_env(), vec![("OMP_NUM_THREADS".to_string(), "4".to_string())]);
    }

    #[test]
    fn test_json_settings() {
        let settings = Settings::from_json(r#"{"tree_queue": "trees", "workers_per_queue": 3}"#).unwrap();
        assert_eq!(settings.tree_queue, "trees");
        assert_eq!(settings.workers_per_queue, 3);
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        let vars = HashMap::from([
            ("PHYLO_THREADS".to_string(), "8".to_string()),
            ("PHYLO_TREE_QUEUE".to_string(), "slow".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        settings.apply_overrides(&vars).unwrap();
        assert_eq!(settings.threads, 8);
        assert_eq!(settings.tree_queue, "slow");
        assert_eq!(settings.effective_threads(), 8);

        let bad = HashMap::from([("PHYLO_THREADS".to_string(), "many".to_string())]);
        assert!(matches!(settings.apply_overrides(&bad), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let settings = Settings { workers_per_queue: 0, ..Settings::default() };
        assert!(matches!(settings.validate(), Err(PipelineError::InvalidConfig(_))));
    }
}
