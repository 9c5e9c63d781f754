//! Host preparation: container runtime, Kubernetes packages, Helm, kubeadm.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::wait_policy;
use crate::poll::WaitPolicy;
use crate::sequencer::{DerivedConfig, Step, StepContext};

const CONTAINERD_CONFIG: &str = "/etc/containerd/config.toml";
const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
const K8S_KEYRING: &str = "/etc/apt/keyrings/kubernetes-apt-keyring.gpg";
const K8S_SOURCES: &str = "/etc/apt/sources.list.d/kubernetes.list";
const K8S_KEY_DOWNLOAD: &str = "/tmp/kubernetes-release.key";
const HELM_INSTALLER: &str = "https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3";
const HELM_INSTALLER_DOWNLOAD: &str = "/tmp/get-helm-3";

const KERNEL_MODULES: &str = "overlay\nbr_netfilter\n";
const SYSCTL_SETTINGS: &str = "net.bridge.bridge-nf-call-iptables  = 1\n\
                               net.bridge.bridge-nf-call-ip6tables = 1\n\
                               net.ipv4.ip_forward                 = 1\n";

/// Installs containerd with the systemd cgroup driver.
pub struct ContainerRuntime;

#[async_trait]
impl Step for ContainerRuntime {
    fn name(&self) -> &'static str {
        "container-runtime"
    }

    fn description(&self) -> String {
        "Install containerd with systemd cgroups".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        if !ctx.host.has_binary("containerd") {
            return Ok(false);
        }
        let config = ctx.host.read_file(Path::new(CONTAINERD_CONFIG)).await?;
        Ok(config.is_some_and(|c| uses_systemd_cgroup(&c)))
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let host = &ctx.host;

        host.write_file(Path::new("/etc/modules-load.d/k8s.conf"), KERNEL_MODULES)
            .await?;
        for module in ["overlay", "br_netfilter"] {
            host.run("modprobe", &[module]).await?.check("modprobe")?;
        }
        host.write_file(Path::new("/etc/sysctl.d/99-kubernetes-cri.conf"), SYSCTL_SETTINGS)
            .await?;
        host.run("sysctl", &["--system"]).await?.check("sysctl --system")?;

        // kubelet refuses to start with swap enabled.
        host.run("swapoff", &["-a"]).await?.check("swapoff")?;
        if let Some(fstab) = host.read_file(Path::new("/etc/fstab")).await? {
            let disabled = disable_swap_entries(&fstab);
            if disabled != fstab {
                host.write_file(Path::new("/etc/fstab"), &disabled).await?;
            }
        }

        host.apt_install(&["containerd"]).await?;

        let default_config = host
            .run("containerd", &["config", "default"])
            .await?
            .check("containerd config default")?
            .stdout;
        host.write_file(Path::new(CONTAINERD_CONFIG), &enable_systemd_cgroup(&default_config))
            .await?;

        host.run("systemctl", &["restart", "containerd"])
            .await?
            .check("restart containerd")?;
        host.run("systemctl", &["enable", "containerd"])
            .await?
            .check("enable containerd")?;

        info!("containerd configured with SystemdCgroup = true");
        Ok(DerivedConfig::new())
    }
}

/// Installs kubeadm, kubelet, and kubectl from pkgs.k8s.io.
pub struct KubernetesTools;

#[async_trait]
impl Step for KubernetesTools {
    fn name(&self) -> &'static str {
        "kubernetes-tools"
    }

    fn description(&self) -> String {
        "Install kubeadm, kubelet and kubectl".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        Ok(["kubeadm", "kubelet", "kubectl"]
            .iter()
            .all(|b| ctx.host.has_binary(b)))
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let host = &ctx.host;
        let version = ctx.config.kubernetes_minor()?;
        let repo = format!("https://pkgs.k8s.io/core:/stable:/v{version}/deb/");

        host.apt_install(&["apt-transport-https", "ca-certificates", "curl", "gpg"])
            .await?;
        host.run("mkdir", &["-p", "-m", "755", "/etc/apt/keyrings"])
            .await?
            .check("create keyring directory")?;

        let key_url = format!("{repo}Release.key");
        host.run("curl", &["-fsSL", "-o", K8S_KEY_DOWNLOAD, &key_url])
            .await?
            .check("fetch Kubernetes signing key")?;
        host.run("gpg", &["--dearmor", "--yes", "-o", K8S_KEYRING, K8S_KEY_DOWNLOAD])
            .await?
            .check("import Kubernetes signing key")?;
        host.write_file(
            Path::new(K8S_SOURCES),
            &format!("deb [signed-by={K8S_KEYRING}] {repo} /\n"),
        )
        .await?;

        host.apt_install(&["kubelet", "kubeadm", "kubectl"]).await?;
        host.run("apt-mark", &["hold", "kubelet", "kubeadm", "kubectl"])
            .await?
            .check("apt-mark hold")?;
        host.run("systemctl", &["enable", "--now", "kubelet"])
            .await?
            .check("enable kubelet")?;

        info!(version, "Kubernetes packages installed");
        Ok(DerivedConfig::new())
    }
}

/// Installs the Helm CLI.
pub struct HelmCli;

#[async_trait]
impl Step for HelmCli {
    fn name(&self) -> &'static str {
        "helm"
    }

    fn description(&self) -> String {
        "Install Helm".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        Ok(ctx.host.has_binary("helm"))
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let host = &ctx.host;
        host.run("curl", &["-fsSL", "-o", HELM_INSTALLER_DOWNLOAD, HELM_INSTALLER])
            .await?
            .check("download Helm installer")?;
        host.run("bash", &[HELM_INSTALLER_DOWNLOAD])
            .await?
            .check("Helm installer")?;
        Ok(DerivedConfig::new())
    }
}

/// Initialises the single-node control plane with kubeadm.
pub struct ClusterInit;

#[async_trait]
impl Step for ClusterInit {
    fn name(&self) -> &'static str {
        "cluster-init"
    }

    fn description(&self) -> String {
        "Initialise the Kubernetes control plane".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        Ok(ctx.host.file_exists(Path::new(ADMIN_KUBECONFIG)))
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let host = &ctx.host;
        let cidr = format!("--pod-network-cidr={}", ctx.config.pod_network_cidr);

        host.run("kubeadm", &["init", &cidr, "--upload-certs"])
            .await?
            .check("kubeadm init")?;

        let admin = host
            .read_file(Path::new(ADMIN_KUBECONFIG))
            .await?
            .context("kubeadm init did not write admin.conf")?;
        let target = user_kubeconfig(ctx);
        host.write_file(&target, &admin).await?;
        info!(path = %target.display(), "Kubeconfig installed");

        // A single node must also schedule workloads.
        let untaint = host
            .run(
                "kubectl",
                &[
                    "--kubeconfig",
                    ADMIN_KUBECONFIG,
                    "taint",
                    "nodes",
                    "--all",
                    "node-role.kubernetes.io/control-plane-",
                ],
            )
            .await?;
        if !untaint.success {
            debug!(stderr = %untaint.stderr.trim(), "Control-plane taint already removed");
        }

        Ok(DerivedConfig::new())
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        ctx.cluster.is_reachable().await
    }
}

/// Kubeconfig path for the invoking user.
fn user_kubeconfig(ctx: &StepContext) -> PathBuf {
    ctx.config.kubeconfig.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".kube/config")
    })
}

fn uses_systemd_cgroup(config: &str) -> bool {
    config
        .lines()
        .map(str::trim)
        .any(|l| l.replace(' ', "") == "SystemdCgroup=true")
}

fn enable_systemd_cgroup(config: &str) -> String {
    if uses_systemd_cgroup(config) {
        return config.to_string();
    }
    let replaced = config.replace("SystemdCgroup = false", "SystemdCgroup = true");
    if uses_systemd_cgroup(&replaced) {
        return replaced;
    }
    // Older defaults omit the option entirely.
    let section = "[plugins.\"io.containerd.grpc.v1.cri\".containerd.runtimes.runc.options]";
    let mut out = replaced;
    if !out.contains(section) {
        out.push('\n');
        out.push_str(section);
        out.push('\n');
    }
    out.replace(section, &format!("{section}\n            SystemdCgroup = true"))
}

fn disable_swap_entries(fstab: &str) -> String {
    let mut out: String = fstab
        .lines()
        .map(|line| {
            let is_swap = line.split_whitespace().nth(2) == Some("swap");
            if is_swap && !line.trim_start().starts_with('#') {
                format!("# {line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    if fstab.ends_with('\n') {
        out.push('\n');
    }
    out
}
