//! The June installation plan.
//!
//! Each submodule holds the steps for one layer of the platform. [`plan`]
//! puts them in dependency order; [`disabled_steps`] lists the ones the
//! configuration turns off.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crate::cluster::ClusterError;
use crate::config::InstallConfig;
use crate::poll::{RetryPolicy, WaitPolicy};
use crate::sequencer::{Step, StepContext};

mod addons;
mod network;
mod node;
mod stunner;
mod tls;

pub use addons::{GithubRunner, GpuOperator, JuneApp, OpenCti};
pub use network::{IngressNginx, MetalLb, PodNetwork};
pub use node::{ClusterInit, ContainerRuntime, HelmCli, KubernetesTools};
pub use stunner::Stunner;
pub use tls::{CertManager, CertificateStep, ClusterIssuer};

/// Step names in plan order.
pub const STEP_NAMES: [&str; 15] = [
    "container-runtime",
    "kubernetes-tools",
    "helm",
    "cluster-init",
    "pod-network",
    "ingress-nginx",
    "metallb",
    "cert-manager",
    "cluster-issuer",
    "certificate",
    "stunner",
    "gpu-operator",
    "github-runner",
    "opencti",
    "june-app",
];

/// Build the full installation plan.
#[must_use]
pub fn plan() -> Vec<Box<dyn Step>> {
    vec![
        Box::new(ContainerRuntime),
        Box::new(KubernetesTools),
        Box::new(HelmCli),
        Box::new(ClusterInit),
        Box::new(PodNetwork::default()),
        Box::new(IngressNginx),
        Box::new(MetalLb),
        Box::new(CertManager),
        Box::new(ClusterIssuer),
        Box::new(CertificateStep),
        Box::new(Stunner),
        Box::new(GpuOperator),
        Box::new(GithubRunner::default()),
        Box::new(OpenCti),
        Box::new(JuneApp),
    ]
}

/// Steps turned off by the operator or by optional components left disabled.
#[must_use]
pub fn disabled_steps(config: &InstallConfig) -> Vec<String> {
    let mut disabled = config.skip_steps.clone();
    if !config.enable_gpu {
        disabled.push("gpu-operator".into());
    }
    if config.runner_url.is_none() {
        disabled.push("github-runner".into());
    }
    if !config.enable_opencti {
        disabled.push("opencti".into());
    }
    if config.app_chart.is_none() {
        disabled.push("june-app".into());
    }
    disabled.sort();
    disabled.dedup();
    disabled
}

/// Reject `--skip` values that do not name a step.
///
/// # Errors
///
/// Returns an error listing the valid names.
pub fn check_step_names(names: &[String]) -> Result<()> {
    for name in names {
        if !STEP_NAMES.contains(&name.as_str()) {
            anyhow::bail!(
                "Unknown step '{name}'. Valid steps: {}",
                STEP_NAMES.join(", ")
            );
        }
    }
    Ok(())
}

/// Readiness wait used by every cluster step.
pub(crate) fn wait_policy(ctx: &StepContext) -> WaitPolicy {
    WaitPolicy::new(ctx.config.wait_timeout()).with_interval(Duration::from_secs(5))
}

/// Retry policy for applying resources whose CRD webhooks may still be starting.
pub(crate) fn webhook_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 6,
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    }
}

/// Fail the precondition check when the API server is down.
pub(crate) async fn require_cluster(ctx: &StepContext) -> Result<()> {
    if ctx.cluster.is_reachable().await? {
        Ok(())
    } else {
        Err(ClusterError::Unreachable(
            "the Kubernetes API server did not answer; check that cluster-init succeeded".into(),
        )
        .into())
    }
}

/// Substitute `{{KEY}}` placeholders in an embedded template.
pub(crate) fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{{key}}}}}"), value)
    })
}

/// Escape a value for use inside a double-quoted YAML scalar.
pub(crate) fn yaml_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Render a list as a YAML flow sequence of double-quoted strings.
pub(crate) fn yaml_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| format!("\"{}\"", yaml_escape(i))).collect();
    format!("[{}]", quoted.join(", "))
}

/// Namespace manifest.
pub(crate) fn namespace_manifest(name: &str) -> String {
    render(include_str!("../../manifests/namespace.yaml"), &[("NAMESPACE", name)])
}

/// Opaque secret from string values.
pub(crate) fn opaque_secret(name: &str, values: &[(&str, &str)]) -> Secret {
    let data: BTreeMap<String, ByteString> = values
        .iter()
        .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
        .collect();
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".into()),
        data: Some(data),
        ..Secret::default()
    }
}

/// A required config value, or an error naming the flag that sets it.
pub(crate) fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{what} is not configured"))
}

/// Alphanumeric secret generated from random UUIDs.
pub(crate) fn generate_secret(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        out.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    out.truncate(len);
    out
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for step tests.

    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::cluster::fake::FakeCluster;
    use crate::config::InstallConfig;
    use crate::host::{CommandOutput, Host};
    use crate::sequencer::StepContext;
    use crate::store::ConfigStore;

    /// One recorded command with its arguments kept apart.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Invocation {
        pub dir: Option<PathBuf>,
        pub env: Vec<(String, String)>,
        pub program: String,
        pub args: Vec<String>,
    }

    /// In-memory [`Host`] recording every command.
    #[derive(Default)]
    pub struct FakeHost {
        pub binaries: Mutex<Vec<String>>,
        pub files: Mutex<BTreeMap<PathBuf, String>>,
        pub commands: Mutex<Vec<String>>,
        pub invocations: Mutex<Vec<Invocation>>,
        pub outputs: Mutex<BTreeMap<String, String>>,
    }

    impl FakeHost {
        pub fn with_binaries(names: &[&str]) -> Self {
            let host = Self::default();
            host.binaries
                .lock()
                .unwrap()
                .extend(names.iter().map(|n| (*n).to_string()));
            host
        }

        pub fn add_file(&self, path: &str, contents: &str) {
            self.files
                .lock()
                .unwrap()
                .insert(PathBuf::from(path), contents.to_string());
        }

        pub fn file(&self, path: &str) -> Option<String> {
            self.files.lock().unwrap().get(Path::new(path)).cloned()
        }

        /// Canned stdout for the command line starting with `prefix`.
        pub fn set_output(&self, prefix: &str, stdout: &str) {
            self.outputs
                .lock()
                .unwrap()
                .insert(prefix.to_string(), stdout.to_string());
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        pub fn invocations(&self) -> Vec<Invocation> {
            self.invocations.lock().unwrap().clone()
        }

        fn record(&self, invocation: Invocation) -> CommandOutput {
            let line = std::iter::once(invocation.program.as_str())
                .chain(invocation.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            self.commands.lock().unwrap().push(line.clone());
            self.invocations.lock().unwrap().push(invocation);
            let stdout = self
                .outputs
                .lock()
                .unwrap()
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or_default();
            CommandOutput {
                success: true,
                stdout,
                stderr: String::new(),
            }
        }
    }

    #[async_trait]
    impl Host for FakeHost {
        fn has_binary(&self, name: &str) -> bool {
            self.binaries.lock().unwrap().iter().any(|b| b == name)
        }

        fn file_exists(&self, path: &Path) -> bool {
            self.files.lock().unwrap().contains_key(path)
        }

        async fn read_file(&self, path: &Path) -> Result<Option<String>> {
            Ok(self.files.lock().unwrap().get(path).cloned())
        }

        async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), contents.to_string());
            Ok(())
        }

        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            Ok(self.record(Invocation {
                dir: None,
                env: Vec::new(),
                program: program.to_string(),
                args: args.iter().map(|a| (*a).to_string()).collect(),
            }))
        }

        async fn run_in(
            &self,
            dir: &Path,
            env: &[(&str, &str)],
            program: &str,
            args: &[&str],
        ) -> Result<CommandOutput> {
            Ok(self.record(Invocation {
                dir: Some(dir.to_path_buf()),
                env: env
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                program: program.to_string(),
                args: args.iter().map(|a| (*a).to_string()).collect(),
            }))
        }
    }

    /// A fully configured context over fakes.
    pub fn context(dir: &TempDir, cluster: Arc<FakeCluster>, host: Arc<FakeHost>) -> StepContext {
        let mut config =
            InstallConfig::with_defaults(dir.path().join("config"), dir.path().join("certs"));
        config.domain = Some("june.example.com".into());
        config.acme_email = Some("ops@example.com".into());
        config.cf_api_token = Some("cf-token".into());
        config.metallb_range = Some("192.168.1.240-192.168.1.250".into());
        StepContext::new(config, ConfigStore::new(dir.path().join("config")), cluster, host)
    }
}
