/// Functions and structs for working with creating command-line arguments

use std::path::Path;
use std::process::Stdio;
use log::debug;
use serde::{Deserialize, Serialize};
use crate::config::defs::{PipelineError, SequenceType, Tool, FASTTREE_TAG, HMMALIGN_TAG, HMMSTAT_TAG, HMM_FILENAME, RAXML_TAG};
use crate::config::settings::Settings;


/// Per-invocation inputs to the argument generators. All paths are relative
/// to the working directory the tool will be started in.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub seq_type: SequenceType,
    pub input: &'a Path,
    pub model: Option<&'a Path>,
}


mod hmmalign {
    use crate::config::defs::{PipelineError, HMMALIGN_TAG};
    use crate::config::settings::Settings;
    use super::CommandContext;

    pub fn arg_generator(settings: &Settings, ctx: &CommandContext) -> Result<Vec<String>, PipelineError> {
        let model = ctx.model.ok_or_else(|| PipelineError::ToolExecution {
            tool: HMMALIGN_TAG.to_string(),
            error: "no model path given".to_string(),
        })?;
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.extend(settings.tools.hmmalign.args.iter().cloned());
        args_vec.push(ctx.seq_type.hmm_switch().to_string());
        args_vec.push(model.to_string_lossy().to_string());
        args_vec.push(ctx.input.to_string_lossy().to_string());
        Ok(args_vec)
    }
}

mod fasttree {
    use crate::config::settings::Settings;
    use super::CommandContext;

    pub fn arg_generator(settings: &Settings, ctx: &CommandContext) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.extend(settings.tools.fasttree.args_for(ctx.seq_type).iter().cloned());
        args_vec.push(ctx.input.to_string_lossy().to_string());
        args_vec
    }
}

mod raxml {
    use crate::config::defs::RAXML_RUN_NAME;
    use crate::config::settings::Settings;
    use super::CommandContext;

    pub fn arg_generator(settings: &Settings, ctx: &CommandContext) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.extend(settings.tools.raxml.args_for(ctx.seq_type).iter().cloned());
        args_vec.push("-n".to_string());
        args_vec.push(RAXML_RUN_NAME.to_string());
        args_vec.push("-T".to_string());
        args_vec.push(settings.effective_threads().to_string());
        args_vec.push("-s".to_string());
        args_vec.push(ctx.input.to_string_lossy().to_string());
        args_vec
    }
}

/// Builds the full argument vector for `tool`: wrapper, executable, then the
/// tool's own arguments. Performs no I/O.
///
/// # Arguments
///
/// * `tool` - Tool tag, e.g. `hmmalign` or `FastTree`.
/// * `settings` - Configured executables, default arguments and thread count.
/// * `ctx` - Sequence type and working-directory-relative paths.
///
/// # Returns
/// Vec<String> argv, or UnknownTool.
pub fn generate_cli(tool: &str, settings: &Settings, ctx: &CommandContext) -> Result<Vec<String>, PipelineError> {
    let tool_args = match tool {
        HMMALIGN_TAG => hmmalign::arg_generator(settings, ctx)?,
        FASTTREE_TAG => fasttree::arg_generator(settings, ctx),
        RAXML_TAG => raxml::arg_generator(settings, ctx),
        _ => return Err(PipelineError::UnknownTool(tool.to_string())),
    };

    let mut cmd = settings.wrapper.clone();
    cmd.push(settings.executable(Tool::from_tag(tool)?).to_string());
    cmd.extend(tool_args);
    Ok(cmd)
}


/// Runs the configured executable with its version switch and pulls a
/// version number out of whatever it prints.
///
/// # Returns
/// Version string; ToolNotFound if it could not be started,
/// UnrecognizedToolOutput if it ran but printed no recognizable version.
pub async fn check_version(tool: Tool, settings: &Settings) -> Result<String, PipelineError> {
    let executable = settings.executable(tool);
    let output = tokio::process::Command::new(executable)
        .arg(tool.spec().version_switch)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| PipelineError::ToolNotFound {
            tool: tool.tag().to_string(),
            error: format!("{}: {}", executable, e),
        })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    parse_version(&text).ok_or_else(|| PipelineError::UnrecognizedToolOutput {
        tool: tool.tag().to_string(),
        output: text.lines().next().unwrap_or("").to_string(),
    })
}

/// Finds the token following `version` or `HMMER` that starts with a digit.
fn parse_version(text: &str) -> Option<String> {
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        for pair in tokens.windows(2) {
            let marker = pair[0];
            if marker.eq_ignore_ascii_case("version") || marker == "HMMER" {
                let candidate = pair[1].trim_end_matches(|c: char| c == ',' || c == ';' || c == ':');
                if candidate.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                    return Some(candidate.to_string());
                }
            }
        }
    }
    None
}


/// Summary line `hmmstat` prints for a profile HMM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmmStats {
    pub idx: String,
    pub name: String,
    pub accession: String,
    pub nseq: u64,
    pub eff_nseq: f64,
    /// Model length in match states
    #[serde(rename = "M")]
    pub model_length: u64,
    pub relent: f64,
    pub info: f64,
    #[serde(rename = "relE")]
    pub rel_e: f64,
    #[serde(rename = "compKL")]
    pub comp_kl: f64,
}

/// Runs `hmmstat` on the `family.hmm` in `dir`.
///
/// # Returns
/// Stats of the last model in the file; ToolNotFound if hmmstat could not be
/// started, InvalidInput if it rejected the model, UnrecognizedToolOutput if
/// it ran but its table could not be read.
pub async fn run_hmmstat(settings: &Settings, dir: &Path) -> Result<HmmStats, PipelineError> {
    let hmmstat = &settings.tools.hmmstat;
    debug!("Running {} {:?} {} in {}", hmmstat.executable, hmmstat.args, HMM_FILENAME, dir.display());
    let output = tokio::process::Command::new(&hmmstat.executable)
        .args(&hmmstat.args)
        .arg(HMM_FILENAME)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| PipelineError::ToolNotFound {
            tool: HMMSTAT_TAG.to_string(),
            error: format!("{}: {}", hmmstat.executable, e),
        })?;

    if !output.status.success() {
        return Err(PipelineError::InvalidInput(format!("Not a valid HMM file, hmmstat {}", output.status)));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_hmmstat(&text).ok_or_else(|| PipelineError::UnrecognizedToolOutput {
        tool: HMMSTAT_TAG.to_string(),
        output: text.lines().find(|l| !l.trim().is_empty() && !l.starts_with('#')).unwrap_or("").to_string(),
    })
}

/// Reads the model table of `hmmstat` output. Every non-comment line must
/// parse; the last one is returned.
fn parse_hmmstat(text: &str) -> Option<HmmStats> {
    let mut stats = None;
    for line in text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }
        stats = Some(HmmStats {
            idx: fields[0].to_string(),
            name: fields[1].to_string(),
            accession: fields[2].to_string(),
            nseq: fields[3].parse().ok()?,
            eff_nseq: fields[4].parse().ok()?,
            model_length: fields[5].parse().ok()?,
            relent: fields[6].parse().ok()?,
            info: fields[7].parse().ok()?,
            rel_e: fields[8].parse().ok()?,
            comp_kl: fields[9].parse().ok()?,
        });
    }
    stats
}
