//! Cluster networking: pod network, ingress controller, load balancer.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{render, require_cluster, wait_policy, webhook_retry};
use crate::cluster::{HelmRelease, WorkloadKind};
use crate::config::{keys, DEFAULT_POD_NETWORK_CIDR};
use crate::environment::EnvironmentDetector;
use crate::poll::{RetryPolicy, WaitPolicy};
use crate::sequencer::{DerivedConfig, Step, StepContext};
use crate::store::Category;

const FLANNEL_MANIFEST_URL: &str =
    "https://github.com/flannel-io/flannel/releases/download/v0.25.6/kube-flannel.yml";
const FLANNEL_NAMESPACE: &str = "kube-flannel";
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(60);

const INGRESS_NAMESPACE: &str = "ingress-nginx";
const INGRESS_VERSION: &str = "4.11.2";

const METALLB_NAMESPACE: &str = "metallb-system";
const METALLB_VERSION: &str = "0.14.8";
const METALLB_POOL: &str = "june-pool";

/// Installs the flannel CNI.
pub struct PodNetwork {
    manifest_url: String,
    fetch_timeout: Duration,
    retry: RetryPolicy,
}

impl Default for PodNetwork {
    fn default() -> Self {
        Self::with_manifest_url(FLANNEL_MANIFEST_URL)
    }
}

impl PodNetwork {
    /// Use a different flannel manifest location.
    #[must_use]
    pub fn with_manifest_url(url: impl Into<String>) -> Self {
        Self {
            manifest_url: url.into(),
            fetch_timeout: MANIFEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    async fn fetch_manifest(&self) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(self.fetch_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        self.retry
            .run("download flannel manifest", || async {
                let response = client.get(&self.manifest_url).send().await?.error_for_status()?;
                Ok::<_, anyhow::Error>(response.text().await?)
            })
            .await
    }
}

#[async_trait]
impl Step for PodNetwork {
    fn name(&self) -> &'static str {
        "pod-network"
    }

    fn description(&self) -> String {
        "Install the flannel pod network".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        ctx.cluster.namespace_exists(FLANNEL_NAMESPACE).await
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let manifest = self.fetch_manifest().await?;
        let manifest = manifest.replace(DEFAULT_POD_NETWORK_CIDR, &ctx.config.pod_network_cidr);
        ctx.cluster.apply_manifest(&manifest).await?;
        info!(cidr = %ctx.config.pod_network_cidr, "flannel applied");
        Ok(DerivedConfig::new())
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        Ok(ctx
            .cluster
            .workload_ready(WorkloadKind::DaemonSet, "kube-flannel-ds", FLANNEL_NAMESPACE)
            .await?
            && ctx.cluster.nodes_ready().await?)
    }
}

/// Installs ingress-nginx behind a LoadBalancer service.
pub struct IngressNginx;

#[async_trait]
impl Step for IngressNginx {
    fn name(&self) -> &'static str {
        "ingress-nginx"
    }

    fn description(&self) -> String {
        "Install the ingress-nginx controller".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        ctx.cluster
            .helm_release_deployed("ingress-nginx", INGRESS_NAMESPACE)
            .await
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let release = HelmRelease::new("ingress-nginx", INGRESS_NAMESPACE, "ingress-nginx/ingress-nginx")
            .with_repo("ingress-nginx", "https://kubernetes.github.io/ingress-nginx")
            .with_version(INGRESS_VERSION)
            .with_set("controller.service.type", "LoadBalancer")
            .with_set("controller.service.externalTrafficPolicy", "Local")
            .with_set("controller.allowSnippetAnnotations", "false");
        ctx.cluster.helm_upgrade(&release).await?;
        Ok(DerivedConfig::new())
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        ctx.cluster
            .workload_ready(WorkloadKind::Deployment, "ingress-nginx-controller", INGRESS_NAMESPACE)
            .await
    }
}

/// Installs MetalLB and its layer-2 address pool.
pub struct MetalLb;

impl MetalLb {
    /// Configured range, or the node's own address.
    async fn address_range(ctx: &StepContext) -> Result<String> {
        if let Some(ref range) = ctx.config.metallb_range {
            return Ok(range.clone());
        }
        let env = EnvironmentDetector::new()?.detect().await;
        info!(platform = %env.platform, "No MetalLB range configured; using the node address");
        env.single_address_range()
            .context("Could not determine the node address for MetalLB (set --metallb-range)")
    }
}

#[async_trait]
impl Step for MetalLb {
    fn name(&self) -> &'static str {
        "metallb"
    }

    fn description(&self) -> String {
        "Install MetalLB and its address pool".into()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        require_cluster(ctx).await?;
        Ok(ctx
            .cluster
            .helm_release_deployed("metallb", METALLB_NAMESPACE)
            .await?
            && ctx
                .cluster
                .resource_exists("ipaddresspool", METALLB_POOL, Some(METALLB_NAMESPACE))
                .await?)
    }

    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig> {
        let range = Self::address_range(ctx).await?;

        let release = HelmRelease::new("metallb", METALLB_NAMESPACE, "metallb/metallb")
            .with_repo("metallb", "https://metallb.github.io/metallb")
            .with_version(METALLB_VERSION);
        ctx.cluster.helm_upgrade(&release).await?;

        let pool = render(
            include_str!("../../manifests/metallb-pool.yaml"),
            &[("ADDRESS_RANGE", &range)],
        );
        // The pool is validated by MetalLB's webhook, which starts after the chart.
        webhook_retry()
            .run("apply MetalLB address pool", || ctx.cluster.apply_manifest(&pool))
            .await?;

        info!(%range, "MetalLB address pool configured");
        Ok(DerivedConfig::new().with(Category::Networking, keys::METALLB_ADDRESS_RANGE, range))
    }

    fn wait_policy(&self, ctx: &StepContext) -> Option<WaitPolicy> {
        Some(wait_policy(ctx))
    }

    async fn poll_ready(&self, ctx: &StepContext) -> Result<bool> {
        ctx.cluster
            .workload_ready(WorkloadKind::Deployment, "metallb-controller", METALLB_NAMESPACE)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::stages::testing::{context, FakeHost};
    use std::sync::Arc;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FLANNEL: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: kube-flannel\n---\n\
        apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: kube-flannel-cfg\n  namespace: kube-flannel\n\
        data:\n  net-conf.json: '{\"Network\": \"10.244.0.0/16\"}'\n";

    #[tokio::test]
    async fn test_pod_network_patches_cidr() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kube-flannel.yml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FLANNEL))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let mut ctx = context(&dir, Arc::clone(&cluster), Arc::new(FakeHost::default()));
        ctx.config.pod_network_cidr = "10.50.0.0/16".into();

        let step = PodNetwork::with_manifest_url(format!("{}/kube-flannel.yml", server.uri()));
        assert!(!step.is_satisfied(&ctx).await.unwrap());
        step.apply(&ctx).await.unwrap();

        assert_eq!(
            cluster.calls(),
            vec!["apply:Namespace/kube-flannel", "apply:ConfigMap/kube-flannel-cfg"]
        );
    }

    #[tokio::test]
    async fn test_stalled_manifest_download_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(FLANNEL)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let step = PodNetwork {
            manifest_url: format!("{}/kube-flannel.yml", server.uri()),
            fetch_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                backoff_multiplier: 1.0,
            },
        };

        let started = std::time::Instant::now();
        let err = step.fetch_manifest().await.unwrap_err();
        assert!(format!("{err:#}").contains("after 2 attempts"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_aborts() {
        let dir = TempDir::new().unwrap();
        let cluster = Arc::new(FakeCluster {
            unreachable: true,
            ..FakeCluster::default()
        });
        let ctx = context(&dir, cluster, Arc::new(FakeHost::default()));

        let err = IngressNginx.is_satisfied(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("Cluster unreachable"));
    }

    #[tokio::test]
    async fn test_ingress_skipped_when_deployed() {
        let dir = TempDir::new().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_release("ingress-nginx", "ingress-nginx");
        let ctx = context(&dir, cluster, Arc::new(FakeHost::default()));

        assert!(IngressNginx.is_satisfied(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_metallb_applies_pool_and_derives_range() {
        let dir = TempDir::new().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let ctx = context(&dir, Arc::clone(&cluster), Arc::new(FakeHost::default()));

        assert!(!MetalLb.is_satisfied(&ctx).await.unwrap());
        let derived = MetalLb.apply(&ctx).await.unwrap();

        assert_eq!(
            cluster.calls(),
            vec![
                "helm:metallb",
                "apply:IPAddressPool/june-pool",
                "apply:L2Advertisement/june-l2"
            ]
        );
        let networking: Vec<_> = derived.iter().collect();
        assert_eq!(networking.len(), 1);
        assert_eq!(networking[0].0, Category::Networking);
        assert_eq!(
            networking[0].1.get(keys::METALLB_ADDRESS_RANGE).map(String::as_str),
            Some("192.168.1.240-192.168.1.250")
        );
        assert!(MetalLb.is_satisfied(&ctx).await.unwrap());
    }
}
