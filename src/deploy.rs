//! Subprocess plumbing: the command-runner seam, the containerized oracle
//! deployer, and supporting-service restarts.

use std::path::PathBuf;
use std::process::Stdio;

use eyre::{eyre, Result, WrapErr};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SshConfig;

/// Output marker that flags a failed deployer invocation even when the
/// process exits zero; the tool is not trustworthy about exit codes.
const DEPLOY_FAILURE_MARKER: &str = "Failed";

/// Captured result of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Whether the process exited zero.
    pub status_ok: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether either stream contains `marker`.
    pub fn mentions(&self, marker: &str) -> bool {
        self.stdout.contains(marker) || self.stderr.contains(marker)
    }
}

/// Runs shell commands. Tests substitute fakes at this seam.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Runs `command`, capturing both streams. `label` names the operation
    /// in logs. Only spawn-level problems are errors; a nonzero exit is
    /// reported through [`CommandOutput::status_ok`].
    async fn run(&self, label: &str, command: &str) -> Result<CommandOutput>;
}

/// [`CommandRunner`] that executes through `bash -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    async fn run(&self, label: &str, command: &str) -> Result<CommandOutput> {
        debug!(label, command, "running command");
        let output = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .wrap_err_with(|| format!("failed to spawn {label}"))?;

        let result = CommandOutput {
            status_ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(label, status_ok = result.status_ok, "command finished");
        Ok(result)
    }
}

/// Drives the containerized oracle deployer tool.
///
/// The tool's exit code alone is not sufficient evidence of success, so
/// every invocation is also scanned for its failure marker.
#[derive(Debug)]
pub struct OracleDeployer<R> {
    runner: R,
    image: String,
    config_dir: PathBuf,
    env_file: PathBuf,
    skip_version_check: bool,
}

impl<R: CommandRunner> OracleDeployer<R> {
    /// Creates a deployer running `image` with the given config mount and
    /// environment file.
    pub fn new(
        runner: R,
        image: impl Into<String>,
        config_dir: PathBuf,
        env_file: PathBuf,
        skip_version_check: bool,
    ) -> Self {
        Self { runner, image: image.into(), config_dir, env_file, skip_version_check }
    }

    fn command(&self, action: &str) -> String {
        let mut parts = vec![
            "docker run -i --rm".to_string(),
            format!("--env-file {}", self.env_file.display()),
            "-e USER_ID=$(id -u) -e GROUP_ID=$(id -g)".to_string(),
            format!("-v {}:/app/config", self.config_dir.display()),
            format!("-v {}:/app/output", self.config_dir.display()),
            format!("{} {action}", self.image),
        ];
        if self.skip_version_check {
            parts.push("--skip-version-check".to_string());
        }
        parts.join(" ")
    }

    async fn invoke(&self, action: &str) -> Result<()> {
        let output = self.runner.run("oracle deployer", &self.command(action)).await?;
        if !output.status_ok || output.mentions(DEPLOY_FAILURE_MARKER) {
            return Err(eyre!(
                "oracle deployer {action} failed: {}",
                if output.stderr.is_empty() { &output.stdout } else { &output.stderr }
            ));
        }
        Ok(())
    }

    /// Deploys the oracle service. On a first failure the old deployment is
    /// removed and the deploy retried exactly once; a second failure is
    /// returned to the caller as fatal.
    pub async fn deploy(&self) -> Result<()> {
        info!(image = %self.image, "deploying oracle service");
        match self.invoke("deploy").await {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(%error, "deploy failed, removing old deployment and retrying");
                if let Err(error) = self.remove().await {
                    warn!(%error, "pre-retry removal failed");
                }
                self.invoke("deploy")
                    .await
                    .wrap_err("oracle deployment failed twice, giving up")
            }
        }
    }

    /// Removes the oracle deployment.
    pub async fn remove(&self) -> Result<()> {
        self.invoke("remove").await
    }
}

/// Restarts the supporting docker services (chain node, mocked API) before
/// a run, either locally or over SSH.
#[derive(Debug)]
pub struct ServiceManager<R> {
    runner: R,
    ssh: SshConfig,
}

impl<R: CommandRunner> ServiceManager<R> {
    /// Creates a manager targeting the host described by `ssh`.
    pub fn new(runner: R, ssh: SshConfig) -> Self {
        Self { runner, ssh }
    }

    /// Tears down and redeploys the service stack. Failures are surfaced
    /// but a run may proceed on a best-effort basis.
    pub async fn restart_services(&self) -> Result<()> {
        info!(host = %self.ssh.remote_host, "restarting services");
        let stack = format!(
            "docker stack rm services || true; sleep 10; docker stack deploy -c {} services",
            self.ssh.yaml_path.display()
        );
        let command = if self.ssh.is_local() {
            stack
        } else {
            format!(
                "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no \
                 -i {} -p {} {}@{} '{stack} || true; sleep 20;'",
                self.ssh.key_path.display(),
                self.ssh.port,
                self.ssh.user,
                self.ssh.remote_host,
            )
        };

        let output = self.runner.run("restart services", &command).await?;
        eyre::ensure!(output.status_ok, "service restart failed: {}", output.stderr);
        Ok(())
    }
}
