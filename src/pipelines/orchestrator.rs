//! Calculation submission and artifact queries.
//!
//! A calculation identifier names an aligner, a tree builder, or both joined
//! by `_` (e.g. `hmmalign_FastTree`). Submission resolves the working
//! directory, locates the input, builds each command line and queues one or
//! two [`StageJob`]s, the tree job depending on the alignment job.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use log::{debug, info, warn};

use crate::config::defs::{
    PipelineError, SequenceType, Stage, Tool, ALIGNMENT_NAME, CALCULATION_SEPARATOR, PHYLOXML_NAME,
    RAW_TREE_NAME, RUN_LOG_NAME, SEQUENCES_NAME, STATUS_NAME, STATUS_RUNNING, STOCKHOLM_NAME, TREE_NAME,
};
use crate::config::settings::Settings;
use crate::pipelines::queue::{JobHandle, JobInfo, JobMeta, JobQueue};
use crate::utils::command::{generate_cli, CommandContext};
use crate::utils::locate::locate;
use crate::utils::paths::{check_name, ensure_stage_dir, resolve, ResolveMode, WorkingDir};
use crate::utils::postprocess::PostProcessor;
use crate::utils::runner::{run_with_status, RunSpec};
use crate::utils::status::{read_status, write_status};

/// Status recorded when a job is killed at its time limit (128 + SIGKILL).
pub const TIMEOUT_STATUS: i32 = 137;


/// The stages a calculation identifier asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calculation {
    pub aligner: Option<Tool>,
    pub tree_builder: Option<Tool>,
}

impl FromStr for Calculation {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || PipelineError::UnknownCalculation(s.to_string());
        let tool_for = |tag: &str, stage: Stage| {
            Tool::from_tag(tag).ok().filter(|t| t.stage() == stage).ok_or_else(unknown)
        };

        let parts: Vec<&str> = s.split(CALCULATION_SEPARATOR).collect();
        match parts.as_slice() {
            [aligner, builder] => Ok(Calculation {
                aligner: Some(tool_for(*aligner, Stage::Alignment)?),
                tree_builder: Some(tool_for(*builder, Stage::Tree)?),
            }),
            [single] => {
                let tool = Tool::from_tag(single).map_err(|_| unknown())?;
                Ok(match tool.stage() {
                    Stage::Alignment => Calculation { aligner: Some(tool), tree_builder: None },
                    Stage::Tree => Calculation { aligner: None, tree_builder: Some(tool) },
                })
            }
            _ => Err(unknown()),
        }
    }
}


/// Stage directories that currently own a queued or running job.
#[derive(Debug, Default)]
pub struct StageLocks {
    claimed: Mutex<HashSet<PathBuf>>,
}

impl StageLocks {
    /// Claims every path or none of them.
    ///
    /// # Returns
    /// One claim per path, released on drop; AlreadyRunning naming the first
    /// path that is already claimed.
    pub fn claim(self: &Arc<Self>, paths: &[PathBuf]) -> Result<Vec<StageClaim>, PipelineError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = paths.iter().find(|p| claimed.contains(*p)) {
            return Err(PipelineError::AlreadyRunning(busy.display().to_string()));
        }
        let mut claims = Vec::with_capacity(paths.len());
        for path in paths {
            claimed.insert(path.clone());
            claims.push(StageClaim { locks: Arc::clone(self), path: path.clone() });
        }
        Ok(claims)
    }

    pub fn is_claimed(&self, path: &Path) -> bool {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner()).contains(path)
    }

    /// True if any claimed path lies under `dir`.
    pub fn any_under(&self, dir: &Path) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|p| p.starts_with(dir))
    }
}

#[derive(Debug)]
pub struct StageClaim {
    locks: Arc<StageLocks>,
    path: PathBuf,
}

impl Drop for StageClaim {
    fn drop(&mut self) {
        self.locks
            .claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
        debug!("Released {}", self.path.display());
    }
}


/// One stage execution: the external command, then its post-processor.
#[derive(Debug)]
pub struct StageJob {
    pub tool: Tool,
    pub working_dir: WorkingDir,
    pub run: RunSpec,
    pub post_process: Option<PostProcessor>,
    /// Shared with the post-processing task, which may outlive the job
    pub claims: Vec<Arc<StageClaim>>,
}

impl StageJob {
    pub fn meta(&self) -> JobMeta {
        let stage = self.tool.stage();
        let target = match &self.working_dir.subcollection {
            Some(_) => format!("sub-collection {}", self.working_dir.display_name()),
            None => format!("collection {}", self.working_dir.collection),
        };
        JobMeta {
            description: format!("{} {} of {}", self.tool, stage, target),
            stage,
            tool: self.tool,
            collection: self.working_dir.collection.clone(),
            subcollection: self.working_dir.subcollection.clone(),
        }
    }

    /// Runs the command and, on a zero exit, the post-processor.
    ///
    /// # Returns
    /// ExternalProcessFailure on a non-zero exit, PostProcessing if the
    /// output could not be finalized.
    pub async fn execute(&self) -> Result<(), PipelineError> {
        let code = run_with_status(&self.run).await?;
        if code != 0 {
            return Err(PipelineError::ExternalProcessFailure { tool: self.tool.to_string(), code });
        }
        if let Some(post_process) = self.post_process.clone() {
            let stage = post_process.stage();
            let raw = self.run.stdout_path.clone();
            let held = self.claims.clone();
            tokio::task::spawn_blocking(move || {
                let applied = post_process.apply(&raw, code);
                drop(held);
                applied
            })
                .await
                .map_err(|e| PipelineError::PostProcessing { stage, error: e.to_string() })??;
        }
        Ok(())
    }

    /// Records the kill status, unless the tool had already exited and its
    /// own exit code is on file.
    pub fn record_timeout(&self) -> Result<(), PipelineError> {
        match read_status(&self.run.status_path)? {
            None | Some(STATUS_RUNNING) => write_status(&self.run.status_path, TIMEOUT_STATUS),
            Some(code) => {
                debug!("{} timed out after exiting with {}", self.tool, code);
                Ok(())
            }
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeFormat {
    Newick,
    PhyloXml,
}

impl TreeFormat {
    pub fn file_name(&self) -> &'static str {
        match self {
            TreeFormat::Newick => TREE_NAME,
            TreeFormat::PhyloXml => PHYLOXML_NAME,
        }
    }
}


pub struct Orchestrator {
    settings: Arc<Settings>,
    queue: Arc<JobQueue>,
    locks: Arc<StageLocks>,
}

impl Orchestrator {
    pub fn new(settings: Arc<Settings>, queue: Arc<JobQueue>) -> Self {
        Orchestrator { settings, queue, locks: Arc::new(StageLocks::default()) }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn locks(&self) -> &Arc<StageLocks> {
        &self.locks
    }

    fn data_root(&self) -> &Path {
        &self.settings.data_path
    }

    /// Builds the jobs a calculation needs without touching the filesystem
    /// beyond existence checks.
    ///
    /// # Arguments
    ///
    /// * `collection` - Collection name.
    /// * `subcollection` - Optional sub-collection name.
    /// * `calculation` - Aligner, tree builder, or `aligner_builder`.
    ///
    /// # Returns
    /// Alignment job first, tree job last; UnknownCalculation, ReservedName or
    /// NotFound on a failed precondition.
    pub fn plan(
        &self,
        collection: &str,
        subcollection: Option<&str>,
        calculation: &str,
    ) -> Result<Vec<StageJob>, PipelineError> {
        let calc: Calculation = calculation.parse()?;
        let working_dir = resolve(self.data_root(), collection, subcollection, ResolveMode::Existing)?;
        let env = self.settings.child_env();
        let mut jobs = Vec::new();

        let seq_type = match calc.aligner {
            Some(aligner) => {
                let (seq_type, seqfile) = locate(&working_dir.path, SEQUENCES_NAME)?;
                let model = working_dir.model_path();
                let ctx = CommandContext { seq_type, input: &seqfile, model: Some(&model) };
                let command = generate_cli(aligner.tag(), &self.settings, &ctx)?;
                debug!("Alignment command line is {:?}", command);

                let dir = working_dir.stage_dir(aligner);
                jobs.push(StageJob {
                    tool: aligner,
                    working_dir: working_dir.clone(),
                    run: RunSpec {
                        command,
                        cwd: dir.clone(),
                        stdout_path: dir.join(STOCKHOLM_NAME),
                        stderr_path: dir.join(RUN_LOG_NAME),
                        status_path: dir.join(STATUS_NAME),
                        env: env.clone(),
                    },
                    post_process: Some(PostProcessor::StockholmToFasta {
                        fasta_path: dir.join(seq_type.file_name(ALIGNMENT_NAME)),
                    }),
                    claims: Vec::new(),
                });
                seq_type
            }
            None => locate(&working_dir.path, ALIGNMENT_NAME)?.0,
        };

        if let Some(builder) = calc.tree_builder {
            let input = Path::new("..").join(seq_type.file_name(ALIGNMENT_NAME));
            let ctx = CommandContext { seq_type, input: &input, model: None };
            let command = generate_cli(builder.tag(), &self.settings, &ctx)?;
            debug!("Tree builder command line is {:?}", command);

            let dir = working_dir.stage_dir(builder);
            jobs.push(StageJob {
                tool: builder,
                working_dir: working_dir.clone(),
                run: RunSpec {
                    command,
                    cwd: dir.clone(),
                    stdout_path: dir.join(RAW_TREE_NAME),
                    stderr_path: dir.join(RUN_LOG_NAME),
                    status_path: dir.join(STATUS_NAME),
                    env,
                },
                post_process: Some(PostProcessor::CleanupTree {
                    clean_path: dir.join(TREE_NAME),
                    make_rooted: true,
                    root_name: working_dir.collection.clone(),
                    xml_path: dir.join(PHYLOXML_NAME),
                }),
                claims: Vec::new(),
            });
        }
        Ok(jobs)
    }

    /// Queues a calculation. Every precondition is checked before anything
    /// is queued; a tree job is chained on the alignment job when both run.
    ///
    /// # Returns
    /// Metadata of the last job queued (the tree job if there is one).
    pub async fn submit(
        &self,
        collection: &str,
        subcollection: Option<&str>,
        calculation: &str,
    ) -> Result<JobInfo, PipelineError> {
        let mut jobs = self.plan(collection, subcollection, calculation)?;

        let dirs: Vec<PathBuf> = jobs.iter().map(|j| j.run.cwd.clone()).collect();
        let claims = self.locks.claim(&dirs)?;
        for job in jobs.iter() {
            if job.tool.stage() == Stage::Tree {
                ensure_stage_dir(&job.working_dir, job.tool, self.settings.dir_mode)?;
            }
        }
        for (job, claim) in jobs.iter_mut().zip(claims) {
            job.claims.push(Arc::new(claim));
        }

        let mut last: Option<JobHandle> = None;
        for job in jobs {
            let stage = job.tool.stage();
            let handle = self
                .queue
                .enqueue(
                    self.settings.queue_name(stage),
                    job,
                    self.settings.stage_timeout(stage),
                    last.as_ref().map(|h| h.id),
                )
                .await?;
            last = Some(handle);
        }

        let handle = last.ok_or_else(|| PipelineError::UnknownCalculation(calculation.to_string()))?;
        info!("Submitted {} for {} as {}", calculation, collection, handle.id);
        self.queue
            .info(handle.id)
            .await
            .ok_or_else(|| PipelineError::NotFound(format!("Job {}", handle.id)))
    }

    /// Last recorded status of a stage: `None` if it never ran, `-1` while
    /// running, otherwise the tool's exit code.
    pub fn stage_status(&self, collection: &str, subcollection: Option<&str>, tool: Tool) -> Result<Option<i32>, PipelineError> {
        let working_dir = resolve(self.data_root(), collection, subcollection, ResolveMode::Existing)?;
        read_status(&working_dir.stage_dir(tool).join(STATUS_NAME))
    }

    pub fn run_log(&self, collection: &str, subcollection: Option<&str>, tool: Tool) -> Result<String, PipelineError> {
        let working_dir = resolve(self.data_root(), collection, subcollection, ResolveMode::Existing)?;
        read_artifact(&working_dir.stage_dir(tool).join(RUN_LOG_NAME))
    }

    /// Collection directory names, sorted.
    pub fn list_collections(&self) -> Result<Vec<String>, PipelineError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.data_root())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Finished FASTA alignment text, with its sequence type.
    pub fn alignment(&self, collection: &str, subcollection: Option<&str>) -> Result<(SequenceType, String), PipelineError> {
        let working_dir = resolve(self.data_root(), collection, subcollection, ResolveMode::Existing)?;
        let (seq_type, file) = locate(&working_dir.path, ALIGNMENT_NAME)?;
        Ok((seq_type, read_artifact(&working_dir.path.join(file))?))
    }

    pub fn tree(
        &self,
        collection: &str,
        subcollection: Option<&str>,
        tool: Tool,
        format: TreeFormat,
    ) -> Result<String, PipelineError> {
        if tool.stage() != Stage::Tree {
            return Err(PipelineError::UnknownTool(tool.to_string()));
        }
        let working_dir = resolve(self.data_root(), collection, subcollection, ResolveMode::Existing)?;
        read_artifact(&working_dir.stage_dir(tool).join(format.file_name()))
    }

    /// Removes a sub-collection and everything in it.
    ///
    /// # Returns
    /// ReservedName, NotFound if it does not exist, AlreadyRunning if one of
    /// its stages owns a job.
    pub fn delete_subcollection(&self, collection: &str, subcollection: &str) -> Result<(), PipelineError> {
        check_name(subcollection)?;
        let working_dir = resolve(self.data_root(), collection, Some(subcollection), ResolveMode::Existing)?;
        if self.locks.any_under(&working_dir.path) {
            return Err(PipelineError::AlreadyRunning(working_dir.path.display().to_string()));
        }
        warn!("Deleting sub-collection {}", working_dir.display_name());
        fs::remove_dir_all(&working_dir.path)?;
        Ok(())
    }
}

fn read_artifact(path: &Path) -> Result<String, PipelineError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PipelineError::NotFound(format!("{}", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}
