//! STUNner TURN gateway for the application's media traffic.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{generate_secret, render, require_cluster, wait_policy, webhook_retry, yaml_escape};
use crate::cluster::{HelmRelease, WorkloadKind};
use crate::config::keys;
use crate::poll::WaitPolicy;
use crate::sequencer::{DerivedConfig, Step, StepContext};
use crate::store::{Category, ConfigMap};

const OPERATOR_NAMESPACE: &str = "stunner-system";
const GATEWAY_NAMESPACE: &str = "stunner";
const DEFAULT_TURN_PORT: &str = "3478";
const DEFAULT_USERNAME: &str = "june";

/// TURN credentials, generated once and then reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TurnCredentials {
    pub realm: String,
    pub username: String,
    pub password: String,
    pub port: String,
}

impl TurnCredentials {
    /// Reuse stored credentials, filling any gaps.
    pub(crate) fn resolve(stored: &ConfigMap, domain: Option<&str>) -> Self {
        let get = |key: &str| stored.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            realm: get(keys::STUNNER_REALM)
                .or_else(|| domain.map(String::from))
                .unwrap_or_else(|| "june".into()),
            username: get(keys::STUNNER_USERNAME).unwrap_or_else(|| DEFAULT_USERNAME.into()),
            password: get(keys::STUNNER_PASSWORD).unwrap_or_else(|| generate_secret(32)),
            port: get(keys::STUNNER_PORT).unwrap_or_else(|| DEFAULT_TURN_PORT.into()),
        }
    }

    fn into_derived(self) -> DerivedConfig {
        DerivedConfig::new()
            .with(Category::Stunner, keys::STUNNER_REALM, self.realm)
            .with(Category::Stunner, keys::STUNNER_USERNAME, self.username)
            .with(Category::Stunner, keys::STUNNER_PASSWORD, self.password)
            .with(Category::Stunner, keys::STUNNER_PORT, self.port)
    }
}

/// Installs the STUNner gateway operator and the TURN gateway.
pub struct Stunner;

#[async_trait]
impl Step for Stunner {
    fn name(&self) -> &'static str {
        "stunner"
    }

    fn description(&self) -> String {
        "Install the STUNner TURN gateway".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        Ok(ctx
            .cluster
            .helm_release_deployed("stunner-gateway-operator", OPERATOR_NAMESPACE)
            .await?
            && ctx
                .cluster
                .resource_exists("gateway", "udp-gateway", Some(GATEWAY_NAMESPACE))
                .await?)
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let stored = ctx.store.load(Category::Stunner)?;
        let creds = TurnCredentials::resolve(&stored, ctx.config.domain.as_deref());

        let release = HelmRelease::new(
            "stunner-gateway-operator",
            OPERATOR_NAMESPACE,
            "stunner/stunner-gateway-operator",
        )
        .with_repo("stunner", "https://l7mp.io/stunner");
        ctx.cluster.helm_upgrade(&release).await?;

        let manifest = render(
            include_str!("../../manifests/stunner.yaml"),
            &[
                ("REALM", &yaml_escape(&creds.realm)),
                ("USERNAME", &yaml_escape(&creds.username)),
                ("PASSWORD", &yaml_escape(&creds.password)),
                ("PORT", &creds.port),
                ("APP_NAMESPACE", &ctx.config.app_namespace),
            ],
        );
        webhook_retry()
            .run("apply STUNner gateway", || ctx.cluster.apply_manifest(&manifest))
            .await?;

        info!(realm = %creds.realm, port = %creds.port, "STUNner gateway configured");
        Ok(creds.into_derived())
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        ctx.cluster
            .workload_ready(
                WorkloadKind::Deployment,
                "stunner-gateway-operator-controller-manager",
                OPERATOR_NAMESPACE,
            )
            .await
    }
}
