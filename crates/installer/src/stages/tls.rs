//! TLS: cert-manager, the Let's Encrypt issuer, and the platform certificate.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    namespace_manifest, opaque_secret, render, require_cluster, required, wait_policy, webhook_retry,
    yaml_escape, yaml_list,
};
use crate::certs::CertificateBackups;
use crate::cluster::{HelmRelease, WorkloadKind};
use crate::config::keys;
use crate::poll::WaitPolicy;
use crate::sequencer::{DerivedConfig, Step, StepContext};
use crate::store::Category;

const CERT_MANAGER_NAMESPACE: &str = "cert-manager";
const CERT_MANAGER_VERSION: &str = "v1.15.3";
const CLOUDFLARE_SECRET: &str = "cloudflare-api-token-secret";

/// Installs cert-manager with its CRDs.
pub struct CertManager;

#[async_trait]
impl Step for CertManager {
    fn name(&self) -> &'static str {
        "cert-manager"
    }

    fn description(&self) -> String {
        "Install cert-manager".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        ctx.cluster
            .helm_release_deployed("cert-manager", CERT_MANAGER_NAMESPACE)
            .await
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let release = HelmRelease::new("cert-manager", CERT_MANAGER_NAMESPACE, "jetstack/cert-manager")
            .with_repo("jetstack", "https://charts.jetstack.io")
            .with_version(CERT_MANAGER_VERSION)
            .with_set("crds.enabled", "true")
            // DNS-01 self-checks must not hit the node's own split-horizon resolver.
            .with_set("extraArgs[0]", "--dns01-recursive-nameservers-only")
            .with_set("extraArgs[1]", "--dns01-recursive-nameservers=1.1.1.1:53\\,8.8.8.8:53");
        ctx.cluster.helm_upgrade(&release).await?;
        Ok(DerivedConfig::new())
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        ctx.cluster
            .workload_ready(WorkloadKind::Deployment, "cert-manager-webhook", CERT_MANAGER_NAMESPACE)
            .await
    }
}

/// Creates the Cloudflare DNS-01 `ClusterIssuer`.
pub struct ClusterIssuer;

#[async_trait]
impl Step for ClusterIssuer {
    fn name(&self) -> &'static str {
        "cluster-issuer"
    }

    fn description(&self) -> String {
        "Create the Let's Encrypt cluster issuer".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        ctx.cluster
            .resource_exists("clusterissuer", ctx.config.acme.issuer_name(), None)
            .await
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let token = required(ctx.config.cf_api_token.as_deref(), "Cloudflare API token")?;
        let email = required(ctx.config.acme_email.as_deref(), "Let's Encrypt email")?;

        ctx.cluster
            .put_secret(
                opaque_secret(CLOUDFLARE_SECRET, &[("api-token", token)]),
                CERT_MANAGER_NAMESPACE,
            )
            .await?;

        let issuer = render(
            include_str!("../../manifests/cluster-issuer.yaml"),
            &[
                ("ISSUER_NAME", ctx.config.acme.issuer_name()),
                ("ACME_SERVER", ctx.config.acme.server()),
                ("EMAIL", &yaml_escape(email)),
                ("TOKEN_SECRET", CLOUDFLARE_SECRET),
            ],
        );
        webhook_retry()
            .run("apply ClusterIssuer", || ctx.cluster.apply_manifest(&issuer))
            .await?;

        info!(issuer = ctx.config.acme.issuer_name(), "ClusterIssuer applied");
        Ok(DerivedConfig::new())
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        ctx.cluster
            .condition_ready("clusterissuer", ctx.config.acme.issuer_name(), None)
            .await
    }
}

/// Provisions the platform certificate, reusing the newest local backup.
pub struct CertificateStep;

impl CertificateStep {
    fn secret_name(ctx: &StepContext) -> Result<String> {
        ctx.config
            .cert_secret_name()
            .ok_or_else(|| anyhow::anyhow!("Primary domain is not configured"))
    }
}

#[async_trait]
impl Step for CertificateStep {
    fn name(&self) -> &'static str {
        "certificate"
    }

    fn description(&self) -> String {
        "Issue the platform TLS certificate".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        let secret = Self::secret_name(ctx)?;
        Ok(ctx
            .cluster
            .get_secret(&secret, &ctx.config.app_namespace)
            .await?
            .is_some())
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let secret = Self::secret_name(ctx)?;
        let namespace = &ctx.config.app_namespace;
        let domains = ctx.config.certificate_domains();

        ctx.cluster
            .apply_manifest(&namespace_manifest(namespace))
            .await?;

        // A restored secret lets cert-manager adopt the existing certificate
        // instead of requesting a new one.
        let backups = CertificateBackups::new(&ctx.config.certs_dir);
        match backups.latest_for(&secret) {
            Ok(Some(latest)) => match backups.restore(ctx.cluster.as_ref(), &latest.path, namespace).await {
                Ok(name) => info!(secret = %name, path = %latest.path.display(), "Restored certificate from backup"),
                Err(e) => warn!(error = %e, "Could not restore certificate backup; requesting a new one"),
            },
            Ok(None) => info!(secret = %secret, "No certificate backup found"),
            Err(e) => warn!(error = %e, "Could not read certificate backups"),
        }

        let certificate = render(
            include_str!("../../manifests/certificate.yaml"),
            &[
                ("SECRET_NAME", &secret),
                ("NAMESPACE", namespace),
                ("COMMON_NAME", &yaml_escape(&domains[0])),
                ("DNS_NAMES", &yaml_list(&domains)),
                ("ISSUER_NAME", ctx.config.acme.issuer_name()),
            ],
        );
        ctx.cluster.apply_manifest(&certificate).await?;

        info!(secret = %secret, domains = ?domains, "Certificate requested");
        Ok(DerivedConfig::new().with(Category::Domain, keys::CERT_SECRET_NAME, secret))
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        let secret = Self::secret_name(ctx)?;
        ctx.cluster
            .condition_ready("certificate", &secret, Some(&ctx.config.app_namespace))
            .await
    }

    async fn after_ready(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let secret = Self::secret_name(ctx)?;
        let record = CertificateBackups::new(&ctx.config.certs_dir)
            .backup(ctx.cluster.as_ref(), &secret, &ctx.config.app_namespace)
            .await?;
        info!(path = %record.path.display(), "Certificate backed up");
        Ok(DerivedConfig::new())
    }
}
