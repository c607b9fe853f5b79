use seq_io::fasta::{Reader as FastaReader, Record};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use flate2::read::GzDecoder;

use crate::config::defs::PipelineError;


/// A single FASTA record, or one row of a multiple alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub id: String,
    pub desc: Option<String>,
    pub seq: Vec<u8>,
}

impl SequenceRecord {
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}


/// Parses a FASTA header.
///
///
/// # Arguments
///
/// * `head` - Header line of a FASTA record.
/// * 'prefix' - Leading, defining character of the header.
///
/// # Returns
/// Tuple: (id, desc) split of header on whitespace.
///
fn parse_header(head: &[u8], prefix: char) -> (String, Option<String>) {
    let head_str = String::from_utf8_lossy(head).into_owned();
    let parts: Vec<&str> = head_str.splitn(2, |c: char| c.is_whitespace()).collect();
    let id = parts[0].trim_start_matches(prefix).to_string();
    let desc = parts.get(1).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    (id, desc)
}

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reads every record from a FASTA stream.
///
/// # Returns
/// Records in file order; InvalidInput if the stream is not FASTA.
pub fn read_fasta<R: Read>(reader: R) -> Result<Vec<SequenceRecord>, PipelineError> {
    let mut reader = FastaReader::new(reader);
    let mut records = Vec::new();
    while let Some(result) = reader.next() {
        let record = result.map_err(|e| PipelineError::InvalidInput(format!("Unparseable FASTA: {}", e)))?;
        let (id, desc) = parse_header(record.head(), '>');
        records.push(SequenceRecord {
            id,
            desc,
            seq: record.full_seq().into_owned(),
        });
    }
    Ok(records)
}

/// Reads a plain or gzipped FASTA file.
pub fn read_fasta_file(path: &Path) -> Result<Vec<SequenceRecord>, PipelineError> {
    let file = File::open(path)?;
    if is_gzipped(path)? {
        read_fasta(GzDecoder::new(file))
    } else {
        read_fasta(BufReader::new(file))
    }
}

pub fn write_fasta_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
) -> io::Result<()> {
    // Write header
    writer.write_all(b">")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;

    // Write sequence (with line wrapping, e.g., 80 chars per line)
    for chunk in seq.chunks(80) {
        writer.write_all(chunk)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

pub fn write_fasta_file(path: &Path, records: &[SequenceRecord]) -> Result<(), PipelineError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        write_fasta_record(&mut writer, &record.id, record.desc.as_deref(), &record.seq)?;
    }
    writer.flush()?;
    Ok(())
}


/// Parses the first alignment of a Stockholm file.
///
/// Interleaved blocks are concatenated per sequence id; `#=GS <id> DE`
/// lines become descriptions; other markup is ignored.
///
/// # Returns
/// Alignment rows in order of first appearance, or InvalidInput.
pub fn read_stockholm<R: BufRead>(reader: R) -> Result<Vec<SequenceRecord>, PipelineError> {
    let mut rows: Vec<SequenceRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut descriptions: HashMap<String, String> = HashMap::new();
    let mut seen_header = false;
    let mut terminated = false;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !seen_header {
            if !trimmed.starts_with("# STOCKHOLM") {
                return Err(PipelineError::InvalidInput("Missing '# STOCKHOLM' header".to_string()));
            }
            seen_header = true;
            continue;
        }
        if trimmed == "//" {
            terminated = true;
            break;
        }
        if let Some(gs) = trimmed.strip_prefix("#=GS") {
            let mut fields = gs.split_whitespace();
            if let (Some(id), Some("DE")) = (fields.next(), fields.next()) {
                let desc = fields.collect::<Vec<_>>().join(" ");
                descriptions.insert(id.to_string(), desc);
            }
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let (Some(id), Some(seq), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(PipelineError::InvalidInput(format!("Malformed Stockholm line {}: {}", line_no + 1, trimmed)));
        };
        match index.get(id) {
            Some(&i) => rows[i].seq.extend_from_slice(seq.as_bytes()),
            None => {
                index.insert(id.to_string(), rows.len());
                rows.push(SequenceRecord { id: id.to_string(), desc: None, seq: seq.as_bytes().to_vec() });
            }
        }
    }

    if !seen_header {
        return Err(PipelineError::InvalidInput("Empty Stockholm file".to_string()));
    }
    if !terminated {
        return Err(PipelineError::InvalidInput("Stockholm alignment not terminated by '//'".to_string()));
    }
    if rows.is_empty() {
        return Err(PipelineError::InvalidInput("Stockholm alignment has no sequences".to_string()));
    }
    let width = rows[0].len();
    if let Some(row) = rows.iter().find(|r| r.len() != width) {
        return Err(PipelineError::InvalidInput(format!(
            "Alignment row {} has length {}, expected {}", row.id, row.len(), width
        )));
    }
    for row in rows.iter_mut() {
        row.desc = descriptions.remove(&row.id);
    }
    Ok(rows)
}
