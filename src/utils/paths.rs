/// Mapping of collection names onto working directories under the data root.
use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, warn};

use crate::config::defs::{is_reserved_name, PipelineError, Stage, Tool, HMM_FILENAME};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// The directory must already exist.
    Existing,
    /// The directory is created with the given permission bits if absent,
    /// replacing any plain file in its way.
    Create(u32),
}

/// A resolved collection or sub-collection directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDir {
    pub collection: String,
    pub subcollection: Option<String>,
    pub path: PathBuf,
}

impl WorkingDir {
    /// Model file path relative to this directory. Sub-collections share
    /// the parent collection's HMM.
    pub fn model_path(&self) -> PathBuf {
        match self.subcollection {
            Some(_) => Path::new("..").join(HMM_FILENAME),
            None => PathBuf::from(HMM_FILENAME),
        }
    }

    /// Directory a tool writes into: the collection itself for alignment,
    /// a tool-named subdirectory for tree building.
    pub fn stage_dir(&self, tool: Tool) -> PathBuf {
        match tool.stage() {
            Stage::Alignment => self.path.clone(),
            Stage::Tree => self.path.join(tool.tag()),
        }
    }

    pub fn display_name(&self) -> String {
        match &self.subcollection {
            Some(sub) => format!("{}.{}", self.collection, sub),
            None => self.collection.clone(),
        }
    }
}


/// Rejects names that collide with artifacts or could escape the data root.
/// Performs no I/O.
pub fn check_name(name: &str) -> Result<(), PipelineError> {
    if is_reserved_name(name) || name == "." || name == ".." {
        return Err(PipelineError::ReservedName(name.to_string()));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(PipelineError::InvalidInput(format!("Name may not contain path separators: {:?}", name)));
    }
    Ok(())
}

/// Resolves a (collection, sub-collection) pair to its working directory.
///
/// # Arguments
///
/// * `data_root` - Directory holding all collections.
/// * `collection` - Collection name.
/// * `subcollection` - Optional nested sub-collection name.
/// * `mode` - Whether the directory must exist or may be created.
///
/// # Returns
/// WorkingDir, or ReservedName/NotFound.
pub fn resolve(
    data_root: &Path,
    collection: &str,
    subcollection: Option<&str>,
    mode: ResolveMode,
) -> Result<WorkingDir, PipelineError> {
    check_name(collection)?;
    if let Some(sub) = subcollection {
        check_name(sub)?;
    }

    let collection_path = data_root.join(collection);
    let path = match subcollection {
        Some(sub) => collection_path.join(sub),
        None => collection_path.clone(),
    };

    match mode {
        ResolveMode::Existing => {
            if !path.is_dir() {
                return Err(PipelineError::NotFound(format!("Directory {} was not previously created", path.display())));
            }
        }
        ResolveMode::Create(dir_mode) => {
            if subcollection.is_some() && !collection_path.is_dir() {
                return Err(PipelineError::NotFound(format!("Collection {} does not exist", collection)));
            }
            create_dir_replacing_file(&path, dir_mode)?;
        }
    }

    Ok(WorkingDir {
        collection: collection.to_string(),
        subcollection: subcollection.map(str::to_string),
        path,
    })
}

/// Creates the tree-building directory for `tool` beneath an existing
/// working directory.
pub fn ensure_stage_dir(working_dir: &WorkingDir, tool: Tool, dir_mode: u32) -> Result<PathBuf, PipelineError> {
    if !working_dir.path.is_dir() {
        return Err(PipelineError::NotFound(format!("Directory {} does not exist", working_dir.path.display())));
    }
    let stage_dir = working_dir.stage_dir(tool);
    create_dir_replacing_file(&stage_dir, dir_mode)?;
    Ok(stage_dir)
}

/// Creates the data root (and parents) if it does not exist.
pub fn init_data_dir(data_root: &Path, mode: u32) -> Result<(), PipelineError> {
    if !data_root.is_dir() {
        debug!("Creating data directory {}", data_root.display());
        dir_builder(mode).recursive(true).create(data_root)?;
    }
    Ok(())
}

fn create_dir_replacing_file(path: &Path, dir_mode: u32) -> Result<(), PipelineError> {
    if path.exists() && !path.is_dir() {
        warn!("Removing existing file in data path name {}", path.display());
        fs::remove_file(path)?;
    }
    if !path.is_dir() {
        debug!("Creating directory {}", path.display());
        dir_builder(dir_mode).create(path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn dir_builder(mode: u32) -> fs::DirBuilder {
    use std::os::unix::fs::DirBuilderExt;
    let mut builder = fs::DirBuilder::new();
    builder.mode(mode);
    builder
}

#[cfg(not(unix))]
fn dir_builder(_mode: u32) -> fs::DirBuilder {
    fs::DirBuilder::new()
}
