//! Optional components: GPU time-slicing, CI runner, OpenCTI, the June app.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{generate_secret, render, require_cluster, required, wait_policy, yaml_escape, yaml_list};
use crate::cluster::{HelmRelease, WorkloadKind};
use crate::config::keys;
use crate::poll::WaitPolicy;
use crate::sequencer::{DerivedConfig, Step, StepContext};
use crate::store::Category;
use crate::tunnel::{free_local_port, PortForward};

const GPU_NAMESPACE: &str = "gpu-operator";

const GITHUB_API: &str = "https://api.github.com";
const RUNNER_DIR: &str = "/opt/actions-runner";
const RUNNER_VERSION: &str = "2.319.1";
const RUNNER_LABELS: &str = "self-hosted,linux,x64,june";

/// NVIDIA GPU operator with time-slicing.
pub struct GpuOperator;

#[async_trait]
impl Step for GpuOperator {
    fn name(&self) -> &'static str {
        "gpu-operator"
    }

    fn description(&self) -> String {
        "Install the NVIDIA GPU operator with time-slicing".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        ctx.cluster
            .helm_release_deployed("gpu-operator", GPU_NAMESPACE)
            .await
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let slices = ctx.config.gpu_slices.to_string();
        let time_slicing = render(
            include_str!("../../manifests/gpu-time-slicing.yaml"),
            &[("SLICES", &slices)],
        );
        ctx.cluster.apply_manifest(&time_slicing).await?;

        let release = HelmRelease::new("gpu-operator", GPU_NAMESPACE, "nvidia/gpu-operator")
            .with_repo("nvidia", "https://helm.ngc.nvidia.com/nvidia")
            .with_set("devicePlugin.config.name", "time-slicing-config")
            .with_set("devicePlugin.config.default", "any");
        ctx.cluster.helm_upgrade(&release).await?;

        info!(slices = ctx.config.gpu_slices, "GPU operator installed");
        Ok(DerivedConfig::new())
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        ctx.cluster
            .workload_ready(WorkloadKind::DaemonSet, "nvidia-device-plugin-daemonset", GPU_NAMESPACE)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationToken {
    token: String,
}

/// GitHub Actions self-hosted runner, installed as a systemd service.
pub struct GithubRunner {
    api_base: String,
    runner_dir: PathBuf,
}

impl Default for GithubRunner {
    fn default() -> Self {
        Self {
            api_base: GITHUB_API.into(),
            runner_dir: PathBuf::from(RUNNER_DIR),
        }
    }
}

impl GithubRunner {
    /// Runner against a different API base and install directory.
    #[must_use]
    pub fn with_locations(api_base: impl Into<String>, runner_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_base: api_base.into(),
            runner_dir: runner_dir.into(),
        }
    }

    /// Request a short-lived registration token.
    async fn registration_token(&self, runner_url: &str, github_token: &str) -> Result<String> {
        let endpoint = registration_endpoint(&self.api_base, runner_url)?;
        let response = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?
            .post(&endpoint)
            .bearer_auth(github_token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "june-installer")
            .send()
            .await
            .context("Failed to reach the GitHub API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API returned {status} for runner registration: {}", body.trim());
        }
        let token: RegistrationToken = response
            .json()
            .await
            .context("Failed to parse registration token response")?;
        Ok(token.token)
    }
}

#[async_trait]
impl Step for GithubRunner {
    fn name(&self) -> &'static str {
        "github-runner"
    }

    fn description(&self) -> String {
        "Register the GitHub Actions self-hosted runner".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        Ok(ctx.host.file_exists(&self.runner_dir.join(".runner")))
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let runner_url = required(ctx.config.runner_url.as_deref(), "Runner URL")?;
        let github_token = required(ctx.config.github_token.as_deref(), "GitHub token")?;
        let token = self.registration_token(runner_url, github_token).await?;

        let dir = self.runner_dir.to_string_lossy();
        let host = &ctx.host;
        host.run("mkdir", &["-p", &dir]).await?.check("create runner directory")?;

        if !host.file_exists(&self.runner_dir.join("config.sh")) {
            let tarball = format!(
                "https://github.com/actions/runner/releases/download/v{RUNNER_VERSION}/actions-runner-linux-x64-{RUNNER_VERSION}.tar.gz"
            );
            let archive = self.runner_dir.join("actions-runner.tar.gz");
            let archive = archive.to_string_lossy();
            host.run("curl", &["-fsSL", "-o", &archive, &tarball])
                .await?
                .check("download runner")?;
            host.run("tar", &["xzf", &archive, "-C", &dir])
                .await?
                .check("unpack runner")?;
        }

        let hostname = host.run("hostname", &[]).await?.check("hostname")?.stdout;
        let config_sh = self.runner_dir.join("config.sh");
        host.run_in(
            &self.runner_dir,
            &[("RUNNER_ALLOW_RUNASROOT", "1")],
            &config_sh.to_string_lossy(),
            &[
                "--unattended",
                "--replace",
                "--url",
                runner_url,
                "--token",
                &token,
                "--name",
                hostname.trim(),
                "--labels",
                RUNNER_LABELS,
            ],
        )
        .await?
        .check("runner registration")?;

        let svc_sh = self.runner_dir.join("svc.sh");
        for action in ["install", "start"] {
            host.run_in(&self.runner_dir, &[], &svc_sh.to_string_lossy(), &[action])
                .await?
                .check("runner service install")?;
        }

        info!(url = runner_url, "Self-hosted runner registered");
        Ok(DerivedConfig::new())
    }
}

/// GitHub endpoint minting registration tokens for a repository or organisation URL.
fn registration_endpoint(api_base: &str, runner_url: &str) -> Result<String> {
    let path = runner_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .split("github.com/")
        .nth(1)
        .with_context(|| format!("Runner URL is not a github.com URL: {runner_url}"))?;
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let api_base = api_base.trim_end_matches('/');
    match parts.as_slice() {
        [org] => Ok(format!("{api_base}/orgs/{org}/actions/runners/registration-token")),
        [owner, repo] => Ok(format!(
            "{api_base}/repos/{owner}/{repo}/actions/runners/registration-token"
        )),
        _ => anyhow::bail!("Runner URL must name an organisation or repository: {runner_url}"),
    }
}

/// OpenCTI threat-intelligence platform.
pub struct OpenCti;

impl OpenCti {
    /// HTTP health check through a temporary port-forward.
    async fn healthy_through_tunnel(ctx: &StepContext) -> Result<bool> {
        let tunnel = PortForward::open(
            ctx.config.kubeconfig.as_deref(),
            &ctx.config.app_namespace,
            "svc/opencti-server",
            free_local_port()?,
            80,
        )
        .await?;

        let result = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?
            .get(format!("{}/graphql", tunnel.url()))
            .send()
            .await;
        tunnel.close().await;

        match result {
            Ok(response) => {
                debug!(status = %response.status(), "OpenCTI health check");
                Ok(!response.status().is_server_error())
            }
            Err(e) => {
                debug!(error = %e, "OpenCTI not answering yet");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Step for OpenCti {
    fn name(&self) -> &'static str {
        "opencti"
    }

    fn description(&self) -> String {
        "Install OpenCTI".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        ctx.cluster
            .helm_release_deployed("opencti", &ctx.config.app_namespace)
            .await
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let domain = required(ctx.config.domain.as_deref(), "Primary domain")?;
        let email = required(ctx.config.acme_email.as_deref(), "Admin email")?;
        let secret_name = ctx
            .config
            .cert_secret_name()
            .context("Primary domain is not configured")?;

        let secrets = ctx.store.load(Category::Secrets)?;
        let password = secrets
            .get(keys::OPENCTI_ADMIN_PASSWORD)
            .cloned()
            .unwrap_or_else(|| generate_secret(24));
        let token = secrets
            .get(keys::OPENCTI_ADMIN_TOKEN)
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let host = format!("cti.{domain}");

        let values = render(
            include_str!("../../manifests/opencti-values.yaml"),
            &[
                ("EMAIL", &yaml_escape(email)),
                ("PASSWORD", &yaml_escape(&password)),
                ("TOKEN", &yaml_escape(&token)),
                ("HOST", &host),
                ("SECRET_NAME", &secret_name),
            ],
        );
        let release = HelmRelease::new("opencti", &ctx.config.app_namespace, "opencti/opencti")
            .with_repo("opencti", "https://devops-ia.github.io/helm-opencti")
            .with_values(values);
        ctx.cluster.helm_upgrade(&release).await?;

        info!(%host, "OpenCTI installed");
        Ok(DerivedConfig::new()
            .with(Category::Secrets, keys::OPENCTI_ADMIN_PASSWORD, password)
            .with(Category::Secrets, keys::OPENCTI_ADMIN_TOKEN, token))
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        if !ctx
            .cluster
            .workload_ready(WorkloadKind::Deployment, "opencti-server", &ctx.config.app_namespace)
            .await?
        {
            return Ok(false);
        }
        Self::healthy_through_tunnel(ctx).await
    }
}

/// The June application chart.
pub struct JuneApp;

impl JuneApp {
    fn values(ctx: &StepContext) -> Result<String> {
        let secret_name = ctx
            .config
            .cert_secret_name()
            .context("Primary domain is not configured")?;
        let hosts: Vec<String> = ctx
            .config
            .certificate_domains()
            .into_iter()
            .filter(|d| !d.starts_with("*."))
            .collect();
        let stunner = ctx.store.load(Category::Stunner)?;
        let realm = stunner
            .get(keys::STUNNER_REALM)
            .cloned()
            .or_else(|| ctx.config.domain.clone())
            .unwrap_or_default();
        let port = stunner
            .get(keys::STUNNER_PORT)
            .cloned()
            .unwrap_or_else(|| "3478".into());

        Ok(render(
            include_str!("../../manifests/june-app-values.yaml"),
            &[
                ("HOSTS", &yaml_list(&hosts)),
                ("SECRET_NAME", &secret_name),
                ("TURN_REALM", &yaml_escape(&realm)),
                ("TURN_PORT", &port),
                (
                    "GEMINI_API_KEY",
                    &yaml_escape(ctx.config.gemini_api_key.as_deref().unwrap_or_default()),
                ),
            ],
        ))
    }
}

#[async_trait]
impl Step for JuneApp {
    fn name(&self) -> &'static str {
        "june-app"
    }

    fn description(&self) -> String {
        "Deploy the June application".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        ctx.cluster
            .helm_release_deployed("june", &ctx.config.app_namespace)
            .await
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let chart = required(ctx.config.app_chart.as_deref(), "Application chart")?;
        let mut release = HelmRelease::new("june", &ctx.config.app_namespace, chart);
        if let Some(ref file) = ctx.config.app_values {
            if !Path::new(file).exists() {
                anyhow::bail!("Values file {} does not exist", file.display());
            }
            release = release.with_values_file(file);
        }
        // Inline values come last so the derived ingress settings win.
        release = release.with_values(Self::values(ctx)?);
        ctx.cluster.helm_upgrade(&release).await?;

        info!(chart, namespace = %ctx.config.app_namespace, "June application deployed");
        Ok(DerivedConfig::new())
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        ctx.cluster
            .workload_ready(WorkloadKind::Deployment, "june", &ctx.config.app_namespace)
            .await
    }
}
