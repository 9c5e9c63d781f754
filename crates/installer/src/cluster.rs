//! Kubernetes access for installation steps.
//!
//! Steps talk to the cluster only through the [`Cluster`] trait so the
//! sequencer can be exercised against an in-memory fake. [`KubectlCluster`]
//! is the production implementation: manifests and rollouts go through
//! `kubectl`/`helm` subprocesses, while Secrets are read and written through
//! the `kube` client so TLS material never passes through argv.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::poll::RetryPolicy;

/// Errors from cluster operations that callers need to distinguish.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A command-line tool exited unsuccessfully.
    #[error("{tool} {action} failed: {stderr}")]
    Command {
        tool: &'static str,
        action: String,
        stderr: String,
    },

    /// The Kubernetes API rejected a request.
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// The cluster could not be reached at all.
    #[error("Cluster unreachable: {0}")]
    Unreachable(String),
}

/// A Helm release to install or upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmRelease {
    /// Release name.
    pub name: String,
    /// Target namespace (created if missing).
    pub namespace: String,
    /// Chart reference (`repo/chart`, `oci://…`, or a local path).
    pub chart: String,
    /// Repository to register as `(alias, url)` before installing.
    pub repo: Option<(String, String)>,
    /// Pinned chart version.
    pub version: Option<String>,
    /// Inline values YAML.
    pub values: Option<String>,
    /// Values file on disk.
    pub values_file: Option<PathBuf>,
    /// `--set` overrides.
    pub set: Vec<(String, String)>,
}

impl HelmRelease {
    /// Create a release description.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, chart: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            chart: chart.into(),
            repo: None,
            version: None,
            values: None,
            values_file: None,
            set: Vec::new(),
        }
    }

    /// Register a chart repository before installing.
    #[must_use]
    pub fn with_repo(mut self, alias: impl Into<String>, url: impl Into<String>) -> Self {
        self.repo = Some((alias.into(), url.into()));
        self
    }

    /// Pin the chart version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Provide inline values.
    #[must_use]
    pub fn with_values(mut self, values: impl Into<String>) -> Self {
        self.values = Some(values.into());
        self
    }

    /// Provide a values file.
    #[must_use]
    pub fn with_values_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.values_file = Some(path.into());
        self
    }

    /// Add a `--set` override.
    #[must_use]
    pub fn with_set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set.push((key.into(), value.into()));
        self
    }

    /// Arguments for `helm upgrade --install`, excluding the inline values file.
    #[must_use]
    pub fn upgrade_args(&self) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            self.name.clone(),
            self.chart.clone(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--create-namespace".to_string(),
        ];
        if let Some(ref version) = self.version {
            args.push("--version".into());
            args.push(version.clone());
        }
        if let Some(ref file) = self.values_file {
            args.push("--values".into());
            args.push(file.display().to_string());
        }
        for (key, value) in &self.set {
            args.push("--set".into());
            args.push(format!("{key}={value}"));
        }
        args
    }
}

/// Kinds of workload whose rollout can be awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl WorkloadKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::DaemonSet => "daemonset",
            Self::StatefulSet => "statefulset",
        }
    }
}

/// Operations installation steps perform against the cluster.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Check the API server answers at all.
    async fn is_reachable(&self) -> Result<bool>;

    /// Whether a namespace exists.
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Whether a resource exists (`kind` as accepted by `kubectl get`).
    async fn resource_exists(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<bool>;

    /// Whether a Helm release is in the `deployed` state.
    async fn helm_release_deployed(&self, release: &str, namespace: &str) -> Result<bool>;

    /// Install or upgrade a Helm release.
    async fn helm_upgrade(&self, release: &HelmRelease) -> Result<()>;

    /// Apply a multi-document manifest.
    async fn apply_manifest(&self, yaml: &str) -> Result<()>;

    /// Whether a workload has finished rolling out.
    async fn workload_ready(&self, kind: WorkloadKind, name: &str, namespace: &str) -> Result<bool>;

    /// Whether a resource reports a `Ready=True` condition.
    async fn condition_ready(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<bool>;

    /// Whether every node reports `Ready=True`.
    async fn nodes_ready(&self) -> Result<bool>;

    /// Fetch a Secret, `None` if absent.
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>>;

    /// Create or replace a Secret.
    async fn put_secret(&self, secret: Secret, namespace: &str) -> Result<()>;
}

/// Production [`Cluster`] backed by `kubectl`, `helm`, and the `kube` client.
pub struct KubectlCluster {
    kubeconfig: Option<PathBuf>,
    client: OnceCell<Client>,
}

impl KubectlCluster {
    /// Create a cluster handle. `None` uses the default kubeconfig loading rules.
    #[must_use]
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            client: OnceCell::new(),
        }
    }

    /// Kubeconfig path passed to subprocesses, if any.
    #[must_use]
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let config = if let Some(ref path) = self.kubeconfig {
                    let kubeconfig = Kubeconfig::read_from(path)
                        .with_context(|| format!("Failed to read kubeconfig from {}", path.display()))?;
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .context("Failed to create Kubernetes config from kubeconfig")?
                } else {
                    Config::infer()
                        .await
                        .context("Failed to infer Kubernetes config")?
                };
                Client::try_from(config).context("Failed to create Kubernetes client")
            })
            .await
    }

    fn kubectl_command(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        cmd.arg(KUBECTL_REQUEST_TIMEOUT).kill_on_drop(true);
        if let Some(ref path) = self.kubeconfig {
            cmd.arg("--kubeconfig").arg(path);
        }
        cmd
    }

    fn helm_command(&self) -> Command {
        let mut cmd = Command::new("helm");
        cmd.kill_on_drop(true);
        if let Some(ref path) = self.kubeconfig {
            cmd.env("KUBECONFIG", path);
        }
        cmd
    }

    /// Run kubectl and return stdout, failing on a non-zero exit.
    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        let output = self
            .kubectl_command()
            .args(args)
            .output()
            .await
            .context("Failed to execute kubectl")?;

        if !output.status.success() {
            return Err(ClusterError::Command {
                tool: "kubectl",
                action: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run kubectl and report only whether it succeeded.
    async fn kubectl_ok(&self, args: &[&str]) -> Result<bool> {
        let status = self
            .kubectl_command()
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("Failed to execute kubectl")?;
        Ok(status.success())
    }

    async fn helm(&self, args: &[String]) -> Result<String> {
        let output = self
            .helm_command()
            .args(args)
            .output()
            .await
            .context("Failed to execute helm")?;

        if !output.status.success() {
            return Err(ClusterError::Command {
                tool: "helm",
                action: args.first().cloned().unwrap_or_default(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Cluster for KubectlCluster {
    async fn is_reachable(&self) -> Result<bool> {
        self.kubectl_ok(&["get", "--raw", "/readyz", "--request-timeout=10s"])
            .await
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        self.kubectl_ok(&["get", "namespace", name]).await
    }

    async fn resource_exists(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<bool> {
        let mut args = vec!["get", kind, name];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        self.kubectl_ok(&args).await
    }

    async fn helm_release_deployed(&self, release: &str, namespace: &str) -> Result<bool> {
        let args = ["status", release, "-n", namespace, "-o", "json"].map(String::from);
        let Ok(stdout) = self.helm(&args).await else {
            return Ok(false);
        };
        let status: serde_json::Value =
            serde_json::from_str(&stdout).context("Failed to parse helm status output")?;
        Ok(status["info"]["status"].as_str() == Some("deployed"))
    }

    async fn helm_upgrade(&self, release: &HelmRelease) -> Result<()> {
        if let Some((ref alias, ref url)) = release.repo {
            // Re-adding an existing repo alias fails harmlessly.
            if let Err(e) = self
                .helm(&["repo".into(), "add".into(), alias.clone(), url.clone()])
                .await
            {
                debug!(repo = %alias, error = %e, "helm repo add failed");
            }
            self.helm(&["repo".into(), "update".into(), alias.clone()])
                .await?;
        }

        let mut args = release.upgrade_args();
        let values_file = match release.values {
            Some(ref values) => {
                let mut file = tempfile::Builder::new()
                    .prefix(&format!("{}-values-", release.name))
                    .suffix(".yaml")
                    .tempfile()
                    .context("Failed to create temporary values file")?;
                std::io::Write::write_all(&mut file, values.as_bytes())
                    .context("Failed to write temporary values file")?;
                args.push("--values".into());
                args.push(file.path().display().to_string());
                Some(file)
            }
            None => None,
        };

        info!(release = %release.name, namespace = %release.namespace, chart = %release.chart, "helm upgrade --install");
        self.helm(&args).await?;
        drop(values_file);
        Ok(())
    }

    async fn apply_manifest(&self, yaml: &str) -> Result<()> {
        let mut child = self
            .kubectl_command()
            .args(["apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn kubectl")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(yaml.as_bytes())
                .await
                .context("Failed to write manifest to kubectl stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for kubectl")?;

        if !output.status.success() {
            return Err(ClusterError::Command {
                tool: "kubectl",
                action: "apply".into(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn workload_ready(&self, kind: WorkloadKind, name: &str, namespace: &str) -> Result<bool> {
        let target = format!("{}/{name}", kind.as_str());
        self.kubectl_ok(&["rollout", "status", &target, "-n", namespace, "--timeout=5s"])
            .await
    }

    async fn condition_ready(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<bool> {
        let mut args = vec![
            "get",
            kind,
            name,
            "-o",
            "jsonpath={.status.conditions[?(@.type=='Ready')].status}",
        ];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        let status = self.kubectl(&args).await?;
        Ok(status.trim() == "True")
    }

    async fn nodes_ready(&self) -> Result<bool> {
        let status = self
            .kubectl(&[
                "get",
                "nodes",
                "-o",
                "jsonpath={.items[*].status.conditions[?(@.type=='Ready')].status}",
            ])
            .await?;
        let statuses: Vec<&str> = status.split_whitespace().collect();
        Ok(!statuses.is_empty() && statuses.iter().all(|s| *s == "True"))
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client().await?.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(ClusterError::from)
            .with_context(|| format!("Failed to read secret {namespace}/{name}"))
    }

    async fn put_secret(&self, secret: Secret, namespace: &str) -> Result<()> {
        let secret = writable(secret, namespace);
        let api: Api<Secret> = Api::namespaced(self.client().await?.clone(), namespace);
        write_secret(&api, &secret, &RetryPolicy::default())
            .await
            .with_context(|| {
                format!(
                    "Failed to write secret {namespace}/{}",
                    secret.metadata.name.as_deref().unwrap_or_default()
                )
            })
    }
}

/// Field manager recorded for server-side applies.
const FIELD_MANAGER: &str = "june";

/// Upper bound for a single kubectl request.
const KUBECTL_REQUEST_TIMEOUT: &str = "--request-timeout=30s";

/// Secret operations [`write_secret`] is built from.
#[async_trait]
trait SecretWriter: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Secret>>;
    async fn apply(&self, name: &str, secret: &Secret) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn create(&self, secret: &Secret) -> Result<()>;
}

#[async_trait]
impl SecretWriter for Api<Secret> {
    async fn get(&self, name: &str) -> Result<Option<Secret>> {
        Ok(self.get_opt(name).await.map_err(ClusterError::from)?)
    }

    async fn apply(&self, name: &str, secret: &Secret) -> Result<()> {
        self.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(secret))
            .await
            .map_err(ClusterError::from)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        Api::delete(self, name, &DeleteParams::default())
            .await
            .map_err(ClusterError::from)?;
        Ok(())
    }

    async fn create(&self, secret: &Secret) -> Result<()> {
        Api::create(self, &PostParams::default(), secret)
            .await
            .map_err(ClusterError::from)?;
        Ok(())
    }
}

/// Strip server-owned metadata so the secret can be applied or created.
fn writable(mut secret: Secret, namespace: &str) -> Secret {
    let meta = &mut secret.metadata;
    meta.namespace = Some(namespace.to_string());
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    secret
}

/// Create or update a secret without a window where it is missing.
///
/// Updates go through server-side apply. Only a change of `type`, which the
/// API server refuses in place, replaces the secret; if the replacement
/// cannot be created the previous secret is put back.
async fn write_secret(api: &dyn SecretWriter, secret: &Secret, retry: &RetryPolicy) -> Result<()> {
    let name = secret
        .metadata
        .name
        .as_deref()
        .context("Secret has no metadata.name")?;

    let current = match api.get(name).await? {
        Some(current) if current.type_ != secret.type_ => current,
        _ => return api.apply(name, secret).await,
    };

    info!(
        secret = name,
        from = current.type_.as_deref().unwrap_or("Opaque"),
        to = secret.type_.as_deref().unwrap_or("Opaque"),
        "Replacing secret to change its type"
    );
    api.delete(name).await?;

    let Err(e) = retry.run("create secret", || api.create(secret)).await else {
        return Ok(());
    };
    let namespace = current.metadata.namespace.clone().unwrap_or_default();
    match api.create(&writable(current, &namespace)).await {
        Ok(()) => {
            warn!(secret = name, "Replacement failed; previous secret restored");
            Err(e.context("previous secret restored"))
        }
        Err(restore) => Err(e.context(format!("previous secret could not be restored: {restore:#}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_helm_upgrade_args() {
        let release = HelmRelease::new("ingress-nginx", "ingress-nginx", "ingress-nginx/ingress-nginx")
            .with_repo("ingress-nginx", "https://kubernetes.github.io/ingress-nginx")
            .with_version("4.10.1")
            .with_set("controller.replicaCount", "1");

        assert_eq!(
            release.upgrade_args(),
            vec![
                "upgrade",
                "--install",
                "ingress-nginx",
                "ingress-nginx/ingress-nginx",
                "--namespace",
                "ingress-nginx",
                "--create-namespace",
                "--version",
                "4.10.1",
                "--set",
                "controller.replicaCount=1",
            ]
        );
    }

    #[test]
    fn test_kubectl_requests_are_bounded() {
        let cluster = KubectlCluster::new(Some(PathBuf::from("/etc/kubernetes/admin.conf")));
        let cmd = cluster.kubectl_command();
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(
            args,
            vec![KUBECTL_REQUEST_TIMEOUT, "--kubeconfig", "/etc/kubernetes/admin.conf"]
        );
    }

    /// Single-secret store that can be told to fail creates.
    #[derive(Default)]
    struct FakeSecrets {
        stored: Mutex<Option<Secret>>,
        failing_creates: Mutex<u32>,
        ops: Mutex<Vec<&'static str>>,
    }

    impl FakeSecrets {
        fn holding(secret: Secret) -> Self {
            let fake = Self::default();
            *fake.stored.lock().unwrap() = Some(secret);
            fake
        }

        fn fail_creates(&self, times: u32) {
            *self.failing_creates.lock().unwrap() = times;
        }

        fn stored(&self) -> Option<Secret> {
            self.stored.lock().unwrap().clone()
        }

        fn ops(&self) -> Vec<&'static str> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SecretWriter for FakeSecrets {
        async fn get(&self, _name: &str) -> Result<Option<Secret>> {
            Ok(self.stored())
        }

        async fn apply(&self, _name: &str, secret: &Secret) -> Result<()> {
            self.ops.lock().unwrap().push("apply");
            *self.stored.lock().unwrap() = Some(secret.clone());
            Ok(())
        }

        async fn delete(&self, _name: &str) -> Result<()> {
            self.ops.lock().unwrap().push("delete");
            *self.stored.lock().unwrap() = None;
            Ok(())
        }

        async fn create(&self, secret: &Secret) -> Result<()> {
            self.ops.lock().unwrap().push("create");
            let mut failing = self.failing_creates.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("admission webhook timed out");
            }
            *self.stored.lock().unwrap() = Some(secret.clone());
            Ok(())
        }
    }

    fn secret(type_: &str, value: &str) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some("june-example-com-tls".into());
        secret.metadata.namespace = Some("june".into());
        secret.type_ = Some(type_.into());
        secret.string_data = Some([("tls.crt".to_string(), value.to_string())].into());
        secret
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_secret_same_type_is_applied_in_place() {
        let fake = FakeSecrets::holding(secret("kubernetes.io/tls", "old"));
        fake.fail_creates(u32::MAX);

        write_secret(&fake, &secret("kubernetes.io/tls", "new"), &quick_retry())
            .await
            .unwrap();

        assert_eq!(fake.ops(), vec!["apply"]);
        assert_eq!(fake.stored().unwrap(), secret("kubernetes.io/tls", "new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_secret_type_change_retries_create() {
        let fake = FakeSecrets::holding(secret("Opaque", "old"));
        fake.fail_creates(2);

        write_secret(&fake, &secret("kubernetes.io/tls", "new"), &quick_retry())
            .await
            .unwrap();

        assert_eq!(fake.ops(), vec!["delete", "create", "create", "create"]);
        assert_eq!(fake.stored().unwrap(), secret("kubernetes.io/tls", "new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_secret_restores_previous_when_create_keeps_failing() {
        let fake = FakeSecrets::holding(secret("Opaque", "old"));
        fake.fail_creates(3);

        let err = write_secret(&fake, &secret("kubernetes.io/tls", "new"), &quick_retry())
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("previous secret restored"));
        assert_eq!(fake.stored().unwrap(), secret("Opaque", "old"));
    }

    #[test]
    fn test_helm_values_file_arg() {
        let release = HelmRelease::new("june", "june", "oci://ghcr.io/june/charts/june")
            .with_values_file("/root/june-values.yaml");
        let args = release.upgrade_args();
        let pos = args.iter().position(|a| a == "--values").unwrap();
        assert_eq!(args[pos + 1], "/root/june-values.yaml");
    }
}
