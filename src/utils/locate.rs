use std::path::{Path, PathBuf};

use crate::config::defs::{PipelineError, SequenceType};


/// Finds which sequence-type variant of `base_name` exists in `dir`.
/// Nucleotide is checked before peptide, so it wins if both are present.
///
/// # Arguments
///
/// * `dir` - Working directory to inspect.
/// * `base_name` - Artifact base name, e.g. `sequences` or `alignment`.
///
/// # Returns
/// (SequenceType, file name relative to `dir`), or NotFound.
pub fn locate(dir: &Path, base_name: &str) -> Result<(SequenceType, PathBuf), PipelineError> {
    for seq_type in SequenceType::ORDER {
        let file_name = seq_type.file_name(base_name);
        if dir.join(&file_name).is_file() {
            return Ok((seq_type, PathBuf::from(file_name)));
        }
    }
    Err(PipelineError::NotFound(format!(
        "No {}.{{{}}} file in {}",
        base_name,
        SequenceType::ORDER.map(|t| t.extension()).join(","),
        dir.display()
    )))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_locate_peptide() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("sequences.faa"), ">a\nMK\n")?;
        let (seq_type, rel) = locate(dir.path(), "sequences")?;
        assert_eq!(seq_type, SequenceType::Peptide);
        assert_eq!(rel, PathBuf::from("sequences.faa"));
        Ok(())
    }

    #[test]
    fn test_locate_prefers_nucleotide() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("alignment.faa"), ">a\nMK\n")?;
        fs::write(dir.path().join("alignment.fna"), ">a\nAC\n")?;
        for _ in 0..3 {
            let (seq_type, rel) = locate(dir.path(), "alignment")?;
            assert_eq!(seq_type, SequenceType::Dna);
            assert_eq!(rel, PathBuf::from("alignment.fna"));
        }
        Ok(())
    }

    #[test]
    fn test_locate_missing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        assert!(matches!(locate(dir.path(), "sequences"), Err(PipelineError::NotFound(_))));
        Ok(())
    }
}
