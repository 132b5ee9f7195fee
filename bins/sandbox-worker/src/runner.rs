/// Language Runner - prepare, compile, run, finalize
///
/// Turns one job attempt into launcher invocations using the language
/// profile table. Outcomes of the submitted program (compile errors, crashes,
/// timeouts) come back as an `ExecutionResult`; only sandbox failures come
/// back as `RunnerError`.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sandbox_common::{ExecutionResult, ExecutionStatus, JobRequest, LanguageProfile};
use tempfile::{Builder, TempDir};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::launcher::{ContainerLauncher, LaunchError, LaunchOutput, LaunchSpec};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("workspace preparation failed: {0}")]
    Workspace(#[from] std::io::Error),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Exclusive scratch directory for one attempt, mounted at /sandbox.
/// Dropping it removes the directory, so every exit path cleans up.
pub struct Workspace {
    dir: TempDir,
    stem: String,
}

impl Workspace {
    pub fn prepare(root: &Path, profile: &LanguageProfile, source: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = Builder::new().prefix("sandbox-").tempdir_in(root)?;

        // The container runs as an unprivileged uid that must write build output here
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777))?;
        }

        let stem = profile.source_stem(source);
        std::fs::write(dir.path().join(profile.source_file_name(&stem)), source)?;

        Ok(Self { dir, stem })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Remove now and log instead of silently ignoring a failed removal
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(workspace = %path.display(), error = %e, "Workspace removal failed");
        }
    }
}

pub struct LanguageRunner {
    launcher: Arc<dyn ContainerLauncher>,
    scratch_root: PathBuf,
    compile_timeout: Duration,
}

impl LanguageRunner {
    pub fn new(
        launcher: Arc<dyn ContainerLauncher>,
        scratch_root: impl Into<PathBuf>,
        compile_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            scratch_root: scratch_root.into(),
            compile_timeout,
        }
    }

    pub async fn execute(&self, job: &JobRequest) -> Result<ExecutionResult, RunnerError> {
        let profile = job.language.profile();
        let workspace = Workspace::prepare(&self.scratch_root, profile, &job.source_code)?;
        debug!(job_id = %job.id, workspace = %workspace.path().display(), "Workspace ready");

        let outcome = self.execute_in(&workspace, profile, job).await;
        workspace.close();
        outcome
    }

    async fn execute_in(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        job: &JobRequest,
    ) -> Result<ExecutionResult, RunnerError> {
        if let Some(command) = profile.compile_command(workspace.stem()) {
            let compiled = self
                .launcher
                .launch(LaunchSpec {
                    workspace: workspace.path().to_path_buf(),
                    command,
                    env: profile.environment(),
                    stdin: String::new(),
                    timeout: self.compile_timeout,
                })
                .await?;

            if compiled.status() != ExecutionStatus::Success {
                info!(job_id = %job.id, status = ?compiled.status(), "Compilation failed");
                return Ok(compile_failure(compiled));
            }
        }

        let output = self
            .launcher
            .launch(LaunchSpec {
                workspace: workspace.path().to_path_buf(),
                command: profile.run_command(workspace.stem()),
                env: profile.environment(),
                stdin: job.stdin.clone(),
                timeout: Duration::from_millis(job.timeout_ms),
            })
            .await?;

        Ok(to_result(output))
    }
}

fn to_result(output: LaunchOutput) -> ExecutionResult {
    ExecutionResult {
        status: output.status(),
        stdout: output.stdout,
        stderr: output.stderr,
        runtime_ms: output.runtime.as_millis() as u64,
        memory_kb: output.peak_memory_bytes / 1024,
        killed: output.killed,
        truncated: output.truncated,
    }
}

/// Compilers write diagnostics to either stream; merge them into stderr
fn compile_failure(output: LaunchOutput) -> ExecutionResult {
    let mut result = to_result(output);
    if !result.stdout.is_empty() {
        let stdout = std::mem::take(&mut result.stdout);
        result.stderr = if result.stderr.is_empty() {
            stdout
        } else {
            format!("{}\n{}", stdout, result.stderr)
        };
    }
    if result.status == ExecutionStatus::Timeout && result.stderr.is_empty() {
        result.stderr = "Compilation timed out".to_string();
    }
    result
}
