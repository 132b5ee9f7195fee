/// Container Launcher - one throwaway container per compile or run step
///
/// The launcher knows HOW to run a command in isolation. It does not know
/// languages, jobs or retries: the runner decides what to run, the worker
/// decides what a failure means.
///
/// Isolation applied to every container:
/// - no network, read-only root filesystem, all capabilities dropped
/// - no-new-privileges, unprivileged user, bounded pids/memory/cpu
/// - only the job workspace is mounted (at /sandbox) plus a small /tmp tmpfs
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use sandbox_common::language::SANDBOX_DIR;
use sandbox_common::{ExecutionStatus, ResourceLimits};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::deadline::{Bounded, Deadline};
use crate::output::OutputCapture;

/// nobody:nogroup
const SANDBOX_USER: &str = "65534:65534";
const TMPFS_OPTIONS: &str = "rw,nosuid,nodev,size=64m";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container setup did not finish within {0:?}")]
    SetupTimedOut(Duration),
}

impl From<bollard::errors::Error> for LaunchError {
    fn from(err: bollard::errors::Error) -> Self {
        LaunchError::Unavailable(err.to_string())
    }
}

/// What to run and where
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Host directory mounted read-write at /sandbox
    pub workspace: PathBuf,
    pub command: Vec<String>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub stdin: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the container was killed or the exit code was unreadable
    pub exit_code: Option<i64>,
    pub killed: bool,
    pub truncated: bool,
    pub runtime: Duration,
    pub peak_memory_bytes: u64,
}

impl LaunchOutput {
    pub fn status(&self) -> ExecutionStatus {
        if self.killed {
            ExecutionStatus::Timeout
        } else if self.exit_code == Some(0) {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Error
        }
    }
}

/// Swappable container backend. Errors mean the sandbox itself failed, never
/// that the submitted program failed.
#[async_trait]
pub trait ContainerLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchOutput, LaunchError>;

    /// Whether the backend can currently accept launches
    async fn ping(&self) -> bool {
        true
    }
}

pub struct DockerLauncher {
    docker: Docker,
    image: String,
    limits: ResourceLimits,
    setup_timeout: Duration,
}

impl DockerLauncher {
    pub fn connect(
        image: impl Into<String>,
        limits: ResourceLimits,
        setup_timeout: Duration,
    ) -> Result<Self, LaunchError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, image, limits, setup_timeout))
    }

    pub fn with_client(
        docker: Docker,
        image: impl Into<String>,
        limits: ResourceLimits,
        setup_timeout: Duration,
    ) -> Self {
        Self {
            docker,
            image: image.into(),
            limits,
            setup_timeout,
        }
    }

    /// Pull the sandbox image if it is not present locally
    pub async fn ensure_image(&self) -> Result<(), LaunchError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }

        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn bounded<F, T>(&self, step: F) -> Result<T, LaunchError>
    where
        F: std::future::Future<Output = Result<T, bollard::errors::Error>>,
    {
        match Deadline::after(self.setup_timeout).run(step).await {
            Bounded::Finished(result) => Ok(result?),
            Bounded::Expired => Err(LaunchError::SetupTimedOut(self.setup_timeout)),
        }
    }

    async fn supervise(&self, id: &str, spec: LaunchSpec) -> Result<LaunchOutput, LaunchError> {
        let attach = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        // Attach before start so no early output is lost
        let AttachContainerResults {
            mut output,
            mut input,
        } = self
            .bounded(self.docker.attach_container(id, Some(attach)))
            .await?;

        self.bounded(
            self.docker
                .start_container(id, None::<StartContainerOptions<String>>),
        )
        .await?;

        let deadline = Deadline::after(spec.timeout);
        let sampler = MemorySampler::spawn(self.docker.clone(), id.to_string());
        let mut capture = OutputCapture::new(self.limits.output_limit_bytes);
        let stdin = spec.stdin;

        let io = async {
            let feed = async {
                if !stdin.is_empty() {
                    if let Err(e) = input.write_all(stdin.as_bytes()).await {
                        debug!(container = id, error = %e, "Stdin closed early");
                    }
                }
                let _ = input.shutdown().await;
            };
            let drain = async {
                while let Some(frame) = output.next().await {
                    match frame {
                        Ok(LogOutput::StdOut { message }) => capture.stdout.push(&message),
                        Ok(LogOutput::StdErr { message }) => capture.stderr.push(&message),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(container = id, error = %e, "Output stream broke");
                            break;
                        }
                    }
                }
            };
            tokio::join!(feed, drain);
            self.exit_code(id).await
        };

        let (exit_code, killed) = match deadline.run(io).await {
            Bounded::Finished(code) => (code, false),
            Bounded::Expired => {
                self.kill(id).await;
                (None, true)
            }
        };
        let runtime = deadline.elapsed();
        let peak_memory_bytes = sampler.finish();

        let truncated = capture.truncated();
        Ok(LaunchOutput {
            stdout: capture.stdout.into_string(),
            stderr: capture.stderr.into_string(),
            exit_code,
            killed,
            truncated,
            runtime,
            peak_memory_bytes,
        })
    }

    async fn exit_code(&self, id: &str) -> Option<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => {
                warn!(container = id, error = %e, "Could not read exit code");
                None
            }
            None => None,
        }
    }

    /// SIGKILL, then wait (bounded) until the container is really gone
    async fn kill(&self, id: &str) {
        let options = KillContainerOptions { signal: "SIGKILL" };
        if let Err(e) = self
            .bounded(self.docker.kill_container(id, Some(options)))
            .await
        {
            debug!(container = id, error = %e, "Kill failed, container may have exited");
        }
        if let Bounded::Expired = Deadline::after(self.setup_timeout)
            .run(self.exit_code(id))
            .await
        {
            warn!(container = id, "Container did not stop after SIGKILL");
        }
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.bounded(self.docker.remove_container(id, Some(options))).await {
            Ok(()) => debug!(container = id, "Container removed"),
            Err(e) => warn!(container = id, error = %e, "Container removal failed"),
        }
    }
}

#[async_trait]
impl ContainerLauncher for DockerLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchOutput, LaunchError> {
        let name = format!("sandbox-{}", Uuid::new_v4());
        let config = container_config(&self.image, &self.limits, &spec);
        let create = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let outcome = match self
            .bounded(self.docker.create_container(Some(create), config))
            .await
        {
            Ok(created) => self.supervise(&created.id, spec).await,
            Err(e) => Err(e),
        };

        // By name: covers a create call that timed out but still landed
        self.remove(&name).await;
        outcome
    }

    async fn ping(&self) -> bool {
        matches!(
            Deadline::after(self.setup_timeout)
                .run(self.docker.ping())
                .await,
            Bounded::Finished(Ok(_))
        )
    }
}

/// Container definition for one step. Pure so the isolation policy can be
/// checked without a Docker daemon.
pub fn container_config(image: &str, limits: &ResourceLimits, spec: &LaunchSpec) -> Config<String> {
    let memory = (limits.memory_mb * 1024 * 1024) as i64;
    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), TMPFS_OPTIONS.to_string());

    Config {
        image: Some(image.to_string()),
        cmd: Some(spec.command.clone()),
        env: Some(spec.env.clone()),
        working_dir: Some(SANDBOX_DIR.to_string()),
        user: Some(SANDBOX_USER.to_string()),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        tty: Some(false),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.workspace.display(),
                SANDBOX_DIR
            )]),
            memory: Some(memory),
            // equal to memory: no swap on top
            memory_swap: Some(memory),
            nano_cpus: Some((limits.cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(limits.pids_limit),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            privileged: Some(false),
            tmpfs: Some(tmpfs),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Best-effort peak memory from the Docker stats stream
struct MemorySampler {
    handle: JoinHandle<()>,
    peak: Arc<AtomicU64>,
}

impl MemorySampler {
    fn spawn(docker: Docker, id: String) -> Self {
        let peak = Arc::new(AtomicU64::new(0));
        let seen = peak.clone();
        let handle = tokio::spawn(async move {
            let options = StatsOptions {
                stream: true,
                one_shot: false,
            };
            let mut stats = docker.stats(&id, Some(options));
            while let Some(Ok(sample)) = stats.next().await {
                let usage = sample
                    .memory_stats
                    .max_usage
                    .or(sample.memory_stats.usage)
                    .unwrap_or(0);
                seen.fetch_max(usage, Ordering::Relaxed);
            }
        });
        Self { handle, peak }
    }

    fn finish(self) -> u64 {
        self.handle.abort();
        self.peak.load(Ordering::Relaxed)
    }
}
