/// Single-integer status files, one per stage directory.
///
/// `-1` marks a run in progress (or one that died without finishing); any
/// other value is the exit code of the most recent completed run.
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::config::defs::PipelineError;


/// Overwrites `path` with `code` followed by a newline.
pub fn write_status(path: &Path, code: i32) -> Result<(), PipelineError> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", code)?;
    file.sync_all()?;
    Ok(())
}

/// Reads the status code, `None` if no status file exists.
pub fn read_status(path: &Path) -> Result<Option<i32>, PipelineError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    contents
        .trim()
        .parse::<i32>()
        .map(Some)
        .map_err(|_| PipelineError::IOError(format!("Malformed status file {}: {:?}", path.display(), contents)))
}
