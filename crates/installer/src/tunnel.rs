//! Scoped `kubectl port-forward` tunnels.
//!
//! [`PortForward`] owns the background `kubectl` process. The process is
//! killed when the guard is closed or dropped, including when the owning
//! future is cancelled by Ctrl-C.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::poll::{wait_until, WaitPolicy};

/// A running port-forward. Dropping it terminates the tunnel.
#[derive(Debug)]
pub struct PortForward {
    child: Child,
    local_port: u16,
}

impl PortForward {
    /// Forward `localhost:local_port` to `target` (e.g. `svc/opencti-server`)
    /// in `namespace` and wait until the local port accepts connections.
    ///
    /// # Errors
    ///
    /// Returns an error if kubectl cannot be started or the port never opens.
    pub async fn open(
        kubeconfig: Option<&Path>,
        namespace: &str,
        target: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Self> {
        let mut cmd = Command::new("kubectl");
        if let Some(path) = kubeconfig {
            cmd.arg("--kubeconfig").arg(path);
        }
        cmd.args([
            "port-forward",
            "-n",
            namespace,
            target,
            &format!("{local_port}:{remote_port}"),
        ]);

        info!(namespace, target, local_port, remote_port, "Opening port-forward");
        Self::spawn(cmd, local_port, WaitPolicy::new(Duration::from_secs(30)).with_interval(Duration::from_millis(500)))
            .await
            .with_context(|| format!("Port-forward to {namespace}/{target} did not come up"))
    }

    /// Spawn `cmd` as the tunnel process and wait for `local_port` to open.
    pub(crate) async fn spawn(mut cmd: Command, local_port: u16, policy: WaitPolicy) -> Result<Self> {
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn port-forward process")?;
        let mut tunnel = Self { child, local_port };

        let outcome = wait_until(policy, || async move {
            Ok(TcpStream::connect(("127.0.0.1", local_port)).await.is_ok())
        })
        .await;

        if !outcome.is_ready() {
            tunnel.close().await;
            anyhow::bail!("local port {local_port} never accepted connections");
        }
        if let Some(status) = tunnel.child.try_wait().context("Failed to poll port-forward process")? {
            anyhow::bail!("port-forward exited early with {status}");
        }

        debug!(local_port, "Port-forward ready");
        Ok(tunnel)
    }

    /// Local port the tunnel listens on.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Base URL for HTTP requests through the tunnel.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }

    /// Kill and reap the tunnel process.
    pub async fn close(mut self) {
        self.terminate().await;
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Port-forward process already gone");
        }
        debug!(local_port = self.local_port, "Port-forward closed");
    }

    #[cfg(test)]
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Pick a free local port for a tunnel.
///
/// # Errors
///
/// Returns an error if no ephemeral port can be bound.
pub fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).context("Failed to bind an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        cmd
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut tunnel = PortForward::spawn(sleeper(), port, WaitPolicy::new(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(tunnel.is_running());
        assert_eq!(tunnel.url(), format!("http://127.0.0.1:{port}"));

        tunnel.terminate().await;
        assert!(!tunnel.is_running());
    }

    #[tokio::test]
    async fn test_port_that_never_opens_fails() {
        let port = free_local_port().unwrap();
        let policy = WaitPolicy::new(Duration::from_millis(300)).with_interval(Duration::from_millis(100));

        let err = PortForward::spawn(sleeper(), port, policy).await.unwrap_err();
        assert!(err.to_string().contains("never accepted connections"));
    }
}
