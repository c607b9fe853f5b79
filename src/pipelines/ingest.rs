/// Accepting uploaded sequences into collection directories.
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::defs::{
    PipelineError, SequenceType, ALIGNMENT_NAME, HMMSTATS_NAME, HMM_FILENAME, SEQUENCES_NAME, SEQUENCE_DATA_NAME,
};
use crate::config::settings::Settings;
use crate::utils::command::{run_hmmstat, HmmStats};
use crate::utils::fastx::{read_fasta_file, write_fasta_file, SequenceRecord};
use crate::utils::paths::{check_name, resolve, ResolveMode};


/// Summary written to `sequence_data.json` beside the stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub sequences: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_sequences: Option<usize>,
    pub max_length: usize,
    pub min_length: usize,
    pub total_length: usize,
    pub overwrite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcollection_name: Option<String>,
}

impl SequenceSummary {
    pub fn read(dir: &Path) -> Result<SequenceSummary, PipelineError> {
        let text = fs::read_to_string(dir.join(SEQUENCE_DATA_NAME))?;
        serde_json::from_str(&text).map_err(|e| PipelineError::IOError(e.to_string()))
    }
}


/// Stores `records` as `<data_name>.<ext>` in a collection or sub-collection,
/// creating the directory if needed.
///
/// Sub-collection records whose id lacks the sub-collection name as a prefix
/// are renamed `<sub>.<id>`, and the parent collection's file of the same
/// name is merged in (parent records win on duplicate ids).
///
/// # Arguments
///
/// * `settings` - Data root and directory mode.
/// * `collection` - Collection name.
/// * `subcollection` - Optional sub-collection name.
/// * `seq_type` - Sequence type of the upload, fixes the file extension.
/// * `data_name` - `sequences` or `alignment`.
/// * `records` - Parsed upload.
///
/// # Returns
/// Summary of the upload; ReservedName, InvalidInput for empty input or
/// duplicate ids, NotFound if a sub-collection's parent does not exist.
pub fn accept_sequences(
    settings: &Settings,
    collection: &str,
    subcollection: Option<&str>,
    seq_type: SequenceType,
    data_name: &str,
    mut records: Vec<SequenceRecord>,
) -> Result<SequenceSummary, PipelineError> {
    check_name(collection)?;
    if let Some(sub) = subcollection {
        check_name(sub)?;
    }
    if data_name != SEQUENCES_NAME && data_name != ALIGNMENT_NAME {
        return Err(PipelineError::InvalidInput(format!("Unrecognized data name {}", data_name)));
    }
    if records.is_empty() {
        return Err(PipelineError::InvalidInput(format!("Empty FASTA for collection {}", collection)));
    }
    if let Some(sub) = subcollection {
        for record in records.iter_mut() {
            if !record.id.starts_with(sub) {
                record.id = format!("{}.{}", sub, record.id);
            }
        }
    }
    let mut seen = HashSet::new();
    if let Some(dup) = records.iter().find(|r| !seen.insert(r.id.clone())) {
        return Err(PipelineError::InvalidInput(format!("Duplicate sequence id {}", dup.id)));
    }

    let data_root = settings.data_path.as_path();
    let working_dir = resolve(data_root, collection, subcollection, ResolveMode::Create(settings.dir_mode))?;
    let lengths: Vec<usize> = records.iter().map(SequenceRecord::len).collect();
    let file_name = seq_type.file_name(data_name);

    let mut sub_sequences = None;
    if subcollection.is_some() {
        let parent_file = data_root.join(collection).join(&file_name);
        let parent = if parent_file.is_file() {
            read_fasta_file(&parent_file)?
        } else {
            debug!("No {} in parent collection {}", file_name, collection);
            Vec::new()
        };
        sub_sequences = Some(parent.len());
        merge_records(&mut records, parent);
    }

    let target = working_dir.path.join(&file_name);
    let overwrite = target.exists();
    if overwrite {
        warn!("Overwriting existing FASTA file {}", target.display());
    }

    let summary = SequenceSummary {
        sequences: records.len(),
        sub_sequences,
        max_length: lengths.iter().copied().max().unwrap_or(0),
        min_length: lengths.iter().copied().min().unwrap_or(0),
        total_length: lengths.iter().sum(),
        overwrite,
        subcollection_name: subcollection.map(str::to_string),
    };

    write_fasta_file(&target, &records)?;
    let json = serde_json::to_string(&summary).map_err(|e| PipelineError::IOError(e.to_string()))?;
    fs::write(working_dir.path.join(SEQUENCE_DATA_NAME), json)?;
    info!("Saved {} sequences to {}", summary.sequences, target.display());
    Ok(summary)
}

/// Reads a plain or gzipped FASTA file and stores it with [`accept_sequences`].
pub fn accept_fasta_file(
    settings: &Settings,
    collection: &str,
    subcollection: Option<&str>,
    seq_type: SequenceType,
    data_name: &str,
    fasta: &Path,
) -> Result<SequenceSummary, PipelineError> {
    if !fasta.is_file() {
        return Err(PipelineError::NotFound(format!("{}", fasta.display())));
    }
    let records = read_fasta_file(fasta)?;
    accept_sequences(settings, collection, subcollection, seq_type, data_name, records)
}

/// Stores `model` as the collection's HMM and writes its `hmmstat` summary
/// beside it. Sub-collections use their parent's model, so only collections
/// take one.
///
/// # Returns
/// The model's stats; NotFound if the collection does not exist. When
/// hmmstat is missing, rejects the model or prints something unreadable the
/// stored model is removed and the error returned.
pub async fn accept_hmm(settings: &Settings, collection: &str, model: &[u8]) -> Result<HmmStats, PipelineError> {
    let working_dir = resolve(&settings.data_path, collection, None, ResolveMode::Existing)?;
    let hmm_path = working_dir.path.join(HMM_FILENAME);
    fs::write(&hmm_path, model)?;

    let stats = match run_hmmstat(settings, &working_dir.path).await {
        Ok(stats) => stats,
        Err(e) => {
            warn!("Removing HMM of collection {}: {}", collection, e);
            fs::remove_file(&hmm_path)?;
            return Err(e);
        }
    };
    let json = serde_json::to_string(&stats).map_err(|e| PipelineError::IOError(e.to_string()))?;
    fs::write(working_dir.path.join(HMMSTATS_NAME), json)?;
    info!("Saved HMM {} ({} match states) for collection {}", stats.name, stats.model_length, collection);
    Ok(stats)
}

/// Reads an HMM file and stores it with [`accept_hmm`].
pub async fn accept_hmm_file(settings: &Settings, collection: &str, hmm: &Path) -> Result<HmmStats, PipelineError> {
    if !hmm.is_file() {
        return Err(PipelineError::NotFound(format!("{}", hmm.display())));
    }
    let model = fs::read(hmm)?;
    accept_hmm(settings, collection, &model).await
}

fn merge_records(records: &mut Vec<SequenceRecord>, other: Vec<SequenceRecord>) {
    let mut index: HashMap<String, usize> = records.iter().enumerate().map(|(i, r)| (r.id.clone(), i)).collect();
    for record in other {
        match index.get(&record.id) {
            Some(&i) => records[i] = record,
            None => {
                index.insert(record.id.clone(), records.len());
                records.push(record);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    fn settings(root: &Path) -> Settings {
        Settings { data_path: root.to_path_buf(), ..Settings::default() }
    }

    fn rec(id: &str, seq: &str) -> SequenceRecord {
        SequenceRecord { id: id.to_string(), desc: None, seq: seq.as_bytes().to_vec() }
    }

    #[test]
    fn test_accept_into_new_collection() -> anyhow::Result<()> {
        let data = tempdir()?;
        let summary = accept_sequences(
            &settings(data.path()), "legA", None, SequenceType::Peptide, SEQUENCES_NAME,
            vec![rec("a", "MKV"), rec("b", "MKVLL")],
        )?;
        assert_eq!(summary.sequences, 2);
        assert_eq!((summary.min_length, summary.max_length, summary.total_length), (3, 5, 8));
        assert!(!summary.overwrite);
        assert!(data.path().join("legA/sequences.faa").is_file());
        assert_eq!(SequenceSummary::read(&data.path().join("legA"))?, summary);

        let again = accept_sequences(&settings(data.path()), "legA", None, SequenceType::Peptide, SEQUENCES_NAME, vec![rec("a", "M")])?;
        assert!(again.overwrite);
        Ok(())
    }

    #[test]
    fn test_subcollection_merges_parent() -> anyhow::Result<()> {
        let data = tempdir()?;
        accept_sequences(&settings(data.path()), "legA", None, SequenceType::Dna, SEQUENCES_NAME, vec![rec("p1", "ACGT"), rec("p2", "AC")])?;
        let summary = accept_sequences(
            &settings(data.path()), "legA", Some("sub"), SequenceType::Dna, SEQUENCES_NAME,
            vec![rec("x", "ACG"), rec("sub.y", "A")],
        )?;
        assert_eq!(summary.sequences, 4);
        assert_eq!(summary.sub_sequences, Some(2));
        assert_eq!(summary.subcollection_name.as_deref(), Some("sub"));

        let stored = read_fasta_file(&data.path().join("legA/sub/sequences.fna"))?;
        let ids: Vec<&str> = stored.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["sub.x", "sub.y", "p1", "p2"]);
        Ok(())
    }

    #[test]
    fn test_rejections() -> anyhow::Result<()> {
        let data = tempdir()?;
        let root = data.path();
        assert!(matches!(
            accept_sequences(&settings(root), "family.hmm", None, SequenceType::Dna, SEQUENCES_NAME, vec![rec("a", "A")]),
            Err(PipelineError::ReservedName(_))
        ));
        assert!(matches!(
            accept_sequences(&settings(root), "legA", None, SequenceType::Dna, SEQUENCES_NAME, vec![]),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            accept_sequences(&settings(root), "legA", None, SequenceType::Dna, SEQUENCES_NAME, vec![rec("a", "A"), rec("a", "C")]),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            accept_sequences(&settings(root), "legA", Some("sub"), SequenceType::Dna, SEQUENCES_NAME, vec![rec("a", "A")]),
            Err(PipelineError::NotFound(_))
        ));
        accept_sequences(&settings(root), "legB", None, SequenceType::Dna, SEQUENCES_NAME, vec![rec("p", "A")])?;
        assert!(matches!(
            accept_sequences(&settings(root), "legB", Some("sub"), SequenceType::Dna, SEQUENCES_NAME, vec![rec("x", "A"), rec("sub.x", "C")]),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(!root.join("legB/sub").exists());
        assert!(!root.join("legA").exists());
        Ok(())
    }

    #[test]
    fn test_gzipped_upload_replaces_stray_file() -> anyhow::Result<()> {
        let data = tempdir()?;
        fs::write(data.path().join("legA"), "not a directory")?;
        let upload = data.path().join("upload.fa.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&upload)?, Compression::default());
        encoder.write_all(b">a\nMKV\n>b\nMK\n")?;
        encoder.finish()?;

        let summary = accept_fasta_file(&settings(data.path()), "legA", None, SequenceType::Peptide, ALIGNMENT_NAME, &upload)?;
        assert_eq!(summary.sequences, 2);
        assert!(data.path().join("legA").is_dir());
        assert!(data.path().join("legA/alignment.faa").is_file());
        Ok(())
    }

    const HMMSTAT_SCRIPT: &str = r##"
test -s "$1" || exit 1
echo "# idx  name  accession  nseq eff_nseq M relent info p relE compKL"
echo "      1 lectin  PF00139.22  71  2.66  236  0.59  0.57  0.52  0.04"
"##;

    fn hmm_settings(root: &Path, script: &str) -> anyhow::Result<Settings> {
        let script_path = root.join("hmmstat.sh");
        fs::write(&script_path, script)?;
        let mut configured = settings(root);
        configured.tools.hmmstat.executable = "sh".to_string();
        configured.tools.hmmstat.args = vec![script_path.to_string_lossy().into_owned()];
        Ok(configured)
    }

    #[tokio::test]
    async fn test_accept_hmm_writes_stats() -> anyhow::Result<()> {
        let data = tempdir()?;
        let configured = hmm_settings(data.path(), HMMSTAT_SCRIPT)?;
        fs::create_dir(data.path().join("legA"))?;

        let stats = accept_hmm(&configured, "legA", b"HMMER3/f [3.3.2]\n").await?;
        assert_eq!(stats.name, "lectin");
        assert_eq!(stats.model_length, 236);
        assert!(data.path().join("legA/family.hmm").is_file());
        let written: HmmStats = serde_json::from_str(&fs::read_to_string(data.path().join("legA/hmmstats.json"))?)?;
        assert_eq!(written, stats);

        assert!(matches!(accept_hmm(&configured, "missing", b"HMMER3/f\n").await, Err(PipelineError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_hmm_is_removed() -> anyhow::Result<()> {
        let data = tempdir()?;
        fs::create_dir(data.path().join("legA"))?;
        let hmm_path = data.path().join("legA/family.hmm");

        // hmmstat exits non-zero on an empty model.
        let strict = hmm_settings(data.path(), HMMSTAT_SCRIPT)?;
        assert!(matches!(accept_hmm(&strict, "legA", b"").await, Err(PipelineError::InvalidInput(_))));
        assert!(!hmm_path.exists());

        let garbled = hmm_settings(data.path(), "echo 'Error: unexpected format'\n")?;
        let result = accept_hmm(&garbled, "legA", b"HMMER3/f\n").await;
        assert!(matches!(result, Err(PipelineError::UnrecognizedToolOutput { .. })));
        assert!(!hmm_path.exists());

        let mut missing = settings(data.path());
        missing.tools.hmmstat.executable = "no-such-hmmstat-on-path".to_string();
        let result = accept_hmm(&missing, "legA", b"HMMER3/f\n").await;
        assert!(matches!(result, Err(PipelineError::ToolNotFound { .. })));
        assert!(!hmm_path.exists());
        assert!(!data.path().join("legA/hmmstats.json").exists());
        Ok(())
    }
}
