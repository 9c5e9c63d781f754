//! Access to the node the installer runs on.
//!
//! Host-level steps (packages, container runtime, kubeadm) go through the
//! [`Host`] trait; [`SystemHost`] runs real commands.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Captured result of a host command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the command exited with status 0.
    pub success: bool,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Turn a failed command into an error mentioning `what`.
    ///
    /// # Errors
    ///
    /// Returns an error carrying stderr when the command failed.
    pub fn check(self, what: &str) -> Result<Self> {
        if !self.success {
            anyhow::bail!("{what} failed: {}", self.stderr.trim());
        }
        Ok(self)
    }
}

/// Operations host-level steps perform on the local machine.
#[async_trait]
pub trait Host: Send + Sync {
    /// Whether a binary is on `PATH`.
    fn has_binary(&self, name: &str) -> bool;

    /// Whether a file exists.
    fn file_exists(&self, path: &Path) -> bool;

    /// Read a file, `None` if it does not exist.
    async fn read_file(&self, path: &Path) -> Result<Option<String>>;

    /// Write a file, creating parent directories.
    async fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Run a program with arguments and capture its output.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a program from `dir` with extra environment variables.
    ///
    /// Arguments are passed as-is; nothing goes through a shell.
    async fn run_in(
        &self,
        dir: &Path,
        env: &[(&str, &str)],
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput>;

    /// Install apt packages non-interactively.
    async fn apt_install(&self, packages: &[&str]) -> Result<()> {
        self.run("apt-get", &["update", "-qq"])
            .await?
            .check("apt-get update")?;
        let mut args = vec!["install", "-y", "-qq"];
        args.extend_from_slice(packages);
        self.run("apt-get", &args)
            .await?
            .check("apt-get install")?;
        Ok(())
    }
}

/// [`Host`] implementation running real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

#[async_trait]
impl Host for SystemHost {
    fn has_binary(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(program, ?args, "Running command");
        let mut cmd = Command::new(program);
        cmd.args(args);
        capture(cmd, program).await
    }

    async fn run_in(
        &self,
        dir: &Path,
        env: &[(&str, &str)],
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        debug!(program, ?args, dir = %dir.display(), "Running command");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(dir)
            .envs(env.iter().copied());
        capture(cmd, program).await
    }
}

async fn capture(mut cmd: Command, program: &str) -> Result<CommandOutput> {
    let output = cmd
        .env("DEBIAN_FRONTEND", "noninteractive")
        .output()
        .await
        .with_context(|| format!("Failed to run {program}"))?;

    let result = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    if !result.success {
        info!(program, status = ?output.status, "Command exited unsuccessfully");
    }
    Ok(result)
}

/// Whether the current process runs with effective UID 0.
#[must_use]
pub fn is_root() -> bool {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|uids| uids.split_whitespace().nth(1))
            .is_some_and(|euid| euid == "0"),
        Err(_) => std::env::var("USER").is_ok_and(|u| u == "root"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_passes_success_through() {
        let out = CommandOutput {
            success: true,
            stdout: "ok".into(),
            stderr: String::new(),
        };
        assert_eq!(out.check("noop").unwrap().stdout, "ok");
    }

    #[test]
    fn test_check_reports_stderr() {
        let out = CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: "E: Unable to locate package\n".into(),
        };
        let err = out.check("apt-get install").unwrap_err();
        assert_eq!(err.to_string(), "apt-get install failed: E: Unable to locate package");
    }

    #[tokio::test]
    async fn test_system_host_reads_missing_file_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let host = SystemHost;
        assert!(host.read_file(&dir.path().join("absent")).await.unwrap().is_none());

        let path = dir.path().join("nested/file.txt");
        host.write_file(&path, "hello").await.unwrap();
        assert_eq!(host.read_file(&path).await.unwrap().as_deref(), Some("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_in_uses_directory_and_env() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = SystemHost
            .run_in(
                dir.path(),
                &[("RUNNER_ALLOW_RUNASROOT", "1")],
                "sh",
                &["-c", "pwd; echo \"$RUNNER_ALLOW_RUNASROOT\"; echo \"$1\"", "sh", "a b; c"],
            )
            .await
            .unwrap()
            .check("sh")
            .unwrap();

        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(
            std::fs::canonicalize(lines[0]).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(lines[1], "1");
        assert_eq!(lines[2], "a b; c");
    }
}
