use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::Result;
use tempfile::{tempdir, TempDir};

use phylo_pipelines::config::defs::{PipelineError, SequenceType, Tool, SEQUENCES_NAME};
use phylo_pipelines::config::settings::Settings;
use phylo_pipelines::pipelines::ingest::accept_sequences;
use phylo_pipelines::pipelines::orchestrator::{Orchestrator, TreeFormat};
use phylo_pipelines::pipelines::queue::{JobQueue, JobState};
use phylo_pipelines::utils::fastx::{read_fasta_file, SequenceRecord};
use phylo_pipelines::utils::status::read_status;


const ALIGN_SCRIPT: &str = r#"
test "$1" = "--amino" || { echo "unexpected type switch $1" >&2; exit 3; }
test -e "$2" || { echo "no model at $2" >&2; exit 4; }
cat status.txt > seen_status.txt
echo "aligning $3" >&2
cat <<EOF
# STOCKHOLM 1.0

a  MKV-L
b  MK-AL
c  MKVAL
//
EOF
"#;

const TREE_SCRIPT: &str = r#"
test -e "$1" || { echo "missing $1" >&2; exit 5; }
echo "(a:0.1,b:0.2,c:0.35);"
"#;

struct Fixture {
    data: TempDir,
    _tools: TempDir,
    settings: Arc<Settings>,
}

/// Data directory with a peptide collection `legA`, and settings whose tools
/// are shell scripts.
fn fixture(align_script: &str, tree_script: &str) -> Result<Fixture> {
    let data = tempdir()?;
    let tools = tempdir()?;
    let align = tools.path().join("align.sh");
    let tree = tools.path().join("tree.sh");
    fs::write(&align, align_script)?;
    fs::write(&tree, tree_script)?;

    let mut settings = Settings {
        data_path: data.path().to_path_buf(),
        wrapper: vec![],
        ..Settings::default()
    };
    settings.tools.hmmalign.executable = "sh".to_string();
    settings.tools.hmmalign.args = vec![path_arg(&align)];
    settings.tools.fasttree.executable = "sh".to_string();
    settings.tools.fasttree.peptide = vec![path_arg(&tree)];
    settings.tools.fasttree.dna = vec![path_arg(&tree)];

    let records = vec![
        SequenceRecord { id: "a".to_string(), desc: None, seq: b"MKVL".to_vec() },
        SequenceRecord { id: "b".to_string(), desc: None, seq: b"MKAL".to_vec() },
        SequenceRecord { id: "c".to_string(), desc: None, seq: b"MKVAL".to_vec() },
    ];
    accept_sequences(&settings, "legA", None, SequenceType::Peptide, SEQUENCES_NAME, records)?;
    fs::write(data.path().join("legA").join("family.hmm"), "HMMER3/f [3.3.2]\n")?;

    Ok(Fixture { data, _tools: tools, settings: Arc::new(settings) })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Fixture {
    fn collection(&self) -> PathBuf {
        self.data.path().join("legA")
    }

    fn orchestrator(&self) -> (Orchestrator, Arc<JobQueue>) {
        let queue = Arc::new(JobQueue::new());
        (Orchestrator::new(Arc::clone(&self.settings), Arc::clone(&queue)), queue)
    }
}

async fn start(queue: &Arc<JobQueue>) {
    queue.start(&["alignment", "treebuilding"], 1).await;
}


#[tokio::test]
async fn test_combined_calculation() -> Result<()> {
    let fx = fixture(ALIGN_SCRIPT, TREE_SCRIPT)?;
    let (orch, queue) = fx.orchestrator();
    start(&queue).await;

    let info = orch.submit("legA", None, "hmmalign_FastTree").await?;
    assert_eq!(info.tool_name, Tool::FastTree);
    assert_eq!(info.queue_name, "treebuilding");

    queue.join_idle().await?;
    let jobs = queue.jobs().await;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].tool_name, Tool::Hmmalign);
    assert_eq!(jobs[1].depends_on, Some(jobs[0].id));
    assert!(jobs.iter().all(|j| j.status == JobState::Finished), "{:?}", jobs);

    let collection = fx.collection();
    assert_eq!(fs::read_to_string(collection.join("seen_status.txt"))?, "-1\n");
    assert_eq!(read_status(&collection.join("status.txt"))?, Some(0));
    assert!(fs::read_to_string(collection.join("run_log.txt"))?.contains("aligning sequences.faa"));
    let aligned = read_fasta_file(&collection.join("alignment.faa"))?;
    assert_eq!(aligned.len(), 3);

    let tree_dir = collection.join("FastTree");
    assert_eq!(read_status(&tree_dir.join("status.txt"))?, Some(0));
    let newick = orch.tree("legA", None, Tool::FastTree, TreeFormat::Newick)?;
    assert!(newick.trim_end().ends_with(")legA;"), "{}", newick);
    let xml = orch.tree("legA", None, Tool::FastTree, TreeFormat::PhyloXml)?;
    assert!(xml.contains("<name>legA</name>"));

    let (seq_type, text) = orch.alignment("legA", None)?;
    assert_eq!(seq_type, SequenceType::Peptide);
    assert!(text.starts_with(">a"));
    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_scenario_command_lines() -> Result<()> {
    let fx = fixture(ALIGN_SCRIPT, TREE_SCRIPT)?;
    let settings = Settings { data_path: fx.data.path().to_path_buf(), ..Settings::default() };
    let orch = Orchestrator::new(Arc::new(settings), Arc::new(JobQueue::new()));

    let info = orch.submit("legA", None, "hmmalign_FastTree").await?;
    let jobs = orch.queue().jobs().await;
    assert_eq!(jobs.len(), 2);
    assert_eq!(info.id, jobs[1].id);

    let align = orch.queue().command(jobs[0].id).await.unwrap();
    assert_eq!(&align[align.len() - 3..], &["--amino", "family.hmm", "sequences.faa"]);
    let tree = orch.queue().command(jobs[1].id).await.unwrap();
    assert!(tree.iter().any(|a| a == "FastTree"));
    let input = PathBuf::from(tree.last().unwrap());
    assert_eq!(input.file_name().unwrap(), "alignment.faa");
    assert!(input.is_relative());

    // Nothing has run yet.
    assert_eq!(orch.stage_status("legA", None, Tool::Hmmalign)?, None);
    assert_eq!(orch.stage_status("legA", None, Tool::FastTree)?, None);
    Ok(())
}

#[tokio::test]
async fn test_single_stage_has_no_dependency() -> Result<()> {
    let fx = fixture(ALIGN_SCRIPT, TREE_SCRIPT)?;
    let (orch, queue) = fx.orchestrator();
    let info = orch.submit("legA", None, "hmmalign").await?;
    assert_eq!(info.depends_on, None);
    assert_eq!(info.status, JobState::Queued);
    assert_eq!(info.queue_position, 0);
    assert_eq!(queue.jobs().await.len(), 1);
    assert!(!fx.collection().join("FastTree").exists());
    Ok(())
}

#[tokio::test]
async fn test_failed_alignment_blocks_tree() -> Result<()> {
    let fx = fixture("echo 'Error: bad model' >&2; exit 1\n", TREE_SCRIPT)?;
    let (orch, queue) = fx.orchestrator();
    start(&queue).await;

    orch.submit("legA", None, "hmmalign_FastTree").await?;
    queue.join_idle().await?;
    let jobs = queue.jobs().await;
    assert!(jobs[0].is_failed);
    assert!(jobs[1].is_failed);
    assert!(jobs[1].started_at.is_none());

    assert_eq!(orch.stage_status("legA", None, Tool::Hmmalign)?, Some(1));
    assert_eq!(orch.stage_status("legA", None, Tool::FastTree)?, None);
    assert!(orch.run_log("legA", None, Tool::Hmmalign)?.contains("bad model"));
    assert!(!fx.collection().join("alignment.faa").exists());

    // Claims are released once the jobs are done.
    assert!(!orch.locks().any_under(&fx.collection()));
    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_postprocessing_failure_fails_job() -> Result<()> {
    let fx = fixture("echo 'not an alignment'\n", TREE_SCRIPT)?;
    let (orch, queue) = fx.orchestrator();
    start(&queue).await;

    let info = orch.submit("legA", None, "hmmalign").await?;
    let done = queue.wait(info.id).await?;
    assert!(done.is_failed);
    assert!(done.error.unwrap_or_default().contains("Post-processing"));
    // The tool itself succeeded.
    assert_eq!(orch.stage_status("legA", None, Tool::Hmmalign)?, Some(0));
    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_precondition_failures_queue_nothing() -> Result<()> {
    let fx = fixture(ALIGN_SCRIPT, TREE_SCRIPT)?;
    let (orch, queue) = fx.orchestrator();

    let bogus = orch.submit("legA", None, "bogus").await;
    assert!(matches!(bogus, Err(PipelineError::UnknownCalculation(_))));
    assert_eq!(bogus.unwrap_err().http_status(), 404);
    assert!(!fx.collection().join("status.txt").exists());

    let missing = orch.submit("nothere", None, "FastTree").await;
    assert!(matches!(missing, Err(PipelineError::NotFound(_))));
    assert!(!fx.data.path().join("nothere").exists());

    let reserved = orch.submit("legA", Some("alignment.faa"), "hmmalign").await;
    assert!(matches!(reserved, Err(PipelineError::ReservedName(_))));

    // No alignment yet, so a tree-only run has no input.
    let tree_only = orch.submit("legA", None, "RAxML").await;
    assert!(matches!(tree_only, Err(PipelineError::NotFound(_))));
    assert!(!fx.collection().join("RAxML").exists());

    assert!(queue.jobs().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_resubmission_while_queued() -> Result<()> {
    let fx = fixture(ALIGN_SCRIPT, TREE_SCRIPT)?;
    let (orch, queue) = fx.orchestrator();

    orch.submit("legA", None, "hmmalign").await?;
    let again = orch.submit("legA", None, "hmmalign_FastTree").await;
    assert!(matches!(again, Err(PipelineError::AlreadyRunning(_))));
    assert_eq!(queue.jobs().await.len(), 1);

    start(&queue).await;
    queue.join_idle().await?;
    let info = orch.submit("legA", None, "FastTree").await?;
    let done = queue.wait(info.id).await?;
    assert!(done.is_finished, "{:?}", done);
    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stage_timeout() -> Result<()> {
    let fx = fixture("sleep 20\n", TREE_SCRIPT)?;
    let mut settings = (*fx.settings).clone();
    settings.alignment_timeout_secs = 1;
    let queue = Arc::new(JobQueue::new());
    let orch = Orchestrator::new(Arc::new(settings), Arc::clone(&queue));
    start(&queue).await;

    let info = orch.submit("legA", None, "hmmalign_FastTree").await?;
    queue.join_idle().await?;
    let jobs = queue.jobs().await;
    assert!(jobs[0].error.as_deref().unwrap_or_default().contains("exceeded"));
    assert!(queue.info(info.id).await.unwrap().is_failed);
    assert_eq!(orch.stage_status("legA", None, Tool::Hmmalign)?, Some(137));
    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_subcollection_pipeline() -> Result<()> {
    let fx = fixture(ALIGN_SCRIPT, TREE_SCRIPT)?;
    let records = vec![SequenceRecord { id: "d".to_string(), desc: None, seq: b"MKV".to_vec() }];
    let summary = accept_sequences(&fx.settings, "legA", Some("sub1"), SequenceType::Peptide, SEQUENCES_NAME, records)?;
    assert_eq!(summary.sequences, 4);

    let (orch, queue) = fx.orchestrator();
    start(&queue).await;
    let info = orch.submit("legA", Some("sub1"), "hmmalign_FastTree").await?;
    assert_eq!(info.subcollection.as_deref(), Some("sub1"));
    queue.join_idle().await?;
    assert!(queue.jobs().await.iter().all(|j| j.is_finished));
    assert!(fx.collection().join("sub1/FastTree/tree.nwk").is_file());

    orch.delete_subcollection("legA", "sub1")?;
    assert!(!fx.collection().join("sub1").exists());
    assert_eq!(orch.list_collections()?, vec!["legA"]);
    queue.shutdown().await;
    Ok(())
}
