use std::fs::File;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use log::{debug, error};
use tokio::process::Command;

use crate::config::defs::{PipelineError, STATUS_RUNNING};
use crate::utils::status::write_status;

/// Exit code recorded when the executable could not be started at all.
pub const SPAWN_FAILURE_CODE: i32 = 127;


/// One external invocation and where its output and status go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub status_path: PathBuf,
    /// Merged over the ambient environment
    pub env: Vec<(String, String)>,
}

/// Runs an external command to completion, recording its status.
///
/// `-1` is written to the status file before the child starts and the real
/// exit code after it ends. A non-zero exit is returned as data, not as an
/// error. The child is killed if the returned future is dropped.
///
/// # Arguments
///
/// * `spec` - Command, working directory, output and status paths.
///
/// # Returns
/// The child's exit code (128 + signal number if it was killed by a signal,
/// 127 if it could not be spawned).
pub async fn run_with_status(spec: &RunSpec) -> Result<i32, PipelineError> {
    let (program, args) = spec.command.split_first().ok_or_else(|| PipelineError::ToolExecution {
        tool: String::new(),
        error: "empty command line".to_string(),
    })?;

    let stdout = File::create(&spec.stdout_path)?;
    let stderr = File::create(&spec.stderr_path)?;
    write_status(&spec.status_path, STATUS_RUNNING)?;

    debug!("Running {:?} in {}", spec.command, spec.cwd.display());
    let spawned = Command::new(program)
        .args(args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn();

    let code = match spawned {
        Ok(mut child) => {
            let status = child.wait().await?;
            exit_code(status)
        }
        Err(e) => {
            error!("Failed to spawn {}: {}", program, e);
            std::fs::write(&spec.stderr_path, format!("Failed to spawn {}: {}\n", program, e))?;
            SPAWN_FAILURE_CODE
        }
    };

    write_status(&spec.status_path, code)?;
    debug!("{} exited with status {}", program, code);
    Ok(code)
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    SPAWN_FAILURE_CODE
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;
    use crate::utils::status::read_status;

    fn spec(dir: &Path, script: &str, env: Vec<(String, String)>) -> RunSpec {
        RunSpec {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: dir.to_path_buf(),
            stdout_path: dir.join("out.txt"),
            stderr_path: dir.join("run_log.txt"),
            status_path: dir.join("status.txt"),
            env,
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_data() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let code = run_with_status(&spec(dir.path(), "echo hi; echo oops >&2; exit 3", vec![])).await?;
        assert_eq!(code, 3);
        assert_eq!(read_status(&dir.path().join("status.txt"))?, Some(3));
        assert_eq!(fs::read_to_string(dir.path().join("out.txt"))?, "hi\n");
        assert_eq!(fs::read_to_string(dir.path().join("run_log.txt"))?, "oops\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_running_marker_visible_to_child() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("status.txt"), "0\n")?;
        let code = run_with_status(&spec(dir.path(), "cat status.txt > seen.txt", vec![])).await?;
        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(dir.path().join("seen.txt"))?, "-1\n");
        assert_eq!(read_status(&dir.path().join("status.txt"))?, Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn test_env_and_cwd() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let env = vec![("OMP_NUM_THREADS".to_string(), "4".to_string())];
        run_with_status(&spec(dir.path(), "echo $OMP_NUM_THREADS; ls", env)).await?;
        let out = fs::read_to_string(dir.path().join("out.txt"))?;
        assert!(out.starts_with("4\n"));
        assert!(out.contains("status.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_executable() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut s = spec(dir.path(), "", vec![]);
        s.command = vec!["no-such-program-anywhere".to_string()];
        let code = run_with_status(&s).await?;
        assert_eq!(code, SPAWN_FAILURE_CODE);
        assert_eq!(read_status(&s.status_path)?, Some(SPAWN_FAILURE_CODE));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_command() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut s = spec(dir.path(), "", vec![]);
        s.command.clear();
        assert!(run_with_status(&s).await.is_err());
        assert!(!s.status_path.exists());
        Ok(())
    }
}
