//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tempfile::TempDir;

use june_installer::cluster::{Cluster, HelmRelease, WorkloadKind};
use june_installer::host::{CommandOutput, Host};
use june_installer::{ConfigStore, InstallConfig, StepContext};

pub const CERT_PEM: &[u8] = include_bytes!("../fixtures/example-com.crt");
pub const KEY_PEM: &[u8] = include_bytes!("../fixtures/example-com.key");

/// A `kubernetes.io/tls` secret holding the fixture certificate.
pub fn tls_secret(name: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert("tls.crt".to_string(), ByteString(CERT_PEM.to_vec()));
    data.insert("tls.key".to_string(), ByteString(KEY_PEM.to_vec()));
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Secret::default()
    }
}

/// In-memory cluster. Applying a `Certificate` behaves like cert-manager
/// and creates its TLS secret.
#[derive(Default)]
pub struct MemoryCluster {
    resources: Mutex<BTreeSet<String>>,
    releases: Mutex<BTreeSet<String>>,
    not_ready: Mutex<BTreeSet<String>>,
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    mutations: Mutex<Vec<String>>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn mark_not_ready(&self, name: &str) {
        self.not_ready.lock().unwrap().insert(name.to_string());
    }

    fn record(&self, what: String) {
        self.mutations.lock().unwrap().push(what);
    }

    fn store_secret(&self, mut secret: Secret, namespace: &str) -> Result<()> {
        let name = secret.metadata.name.clone().context("Secret has no name")?;
        secret.metadata.namespace = Some(namespace.to_string());
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), secret);
        Ok(())
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn is_reachable(&self) -> Result<bool> {
        Ok(true)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.resources.lock().unwrap().contains(&format!("namespace/{name}")))
    }

    async fn resource_exists(&self, kind: &str, name: &str, _namespace: Option<&str>) -> Result<bool> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .contains(&format!("{}/{name}", kind.to_lowercase())))
    }

    async fn helm_release_deployed(&self, release: &str, namespace: &str) -> Result<bool> {
        Ok(self
            .releases
            .lock()
            .unwrap()
            .contains(&format!("{namespace}/{release}")))
    }

    async fn helm_upgrade(&self, release: &HelmRelease) -> Result<()> {
        self.record(format!("helm:{}", release.name));
        self.releases
            .lock()
            .unwrap()
            .insert(format!("{}/{}", release.namespace, release.name));
        Ok(())
    }

    async fn apply_manifest(&self, yaml: &str) -> Result<()> {
        for doc in yaml.split("\n---") {
            let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(doc) else {
                continue;
            };
            let (Some(kind), Some(name)) = (value["kind"].as_str(), value["metadata"]["name"].as_str())
            else {
                continue;
            };
            self.record(format!("apply:{kind}/{name}"));
            self.resources
                .lock()
                .unwrap()
                .insert(format!("{}/{name}", kind.to_lowercase()));

            if kind == "Certificate" {
                let secret_name = value["spec"]["secretName"].as_str().context("no secretName")?;
                let namespace = value["metadata"]["namespace"].as_str().unwrap_or("default");
                self.store_secret(tls_secret(secret_name), namespace)?;
            }
        }
        Ok(())
    }

    async fn workload_ready(&self, _kind: WorkloadKind, name: &str, _namespace: &str) -> Result<bool> {
        Ok(!self.not_ready.lock().unwrap().contains(name))
    }

    async fn condition_ready(&self, _kind: &str, name: &str, _namespace: Option<&str>) -> Result<bool> {
        Ok(!self.not_ready.lock().unwrap().contains(name))
    }

    async fn nodes_ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn put_secret(&self, secret: Secret, namespace: &str) -> Result<()> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.record(format!("secret:{namespace}/{name}"));
        self.store_secret(secret, namespace)
    }
}

/// Host that refuses to run anything.
pub struct InertHost;

#[async_trait]
impl Host for InertHost {
    fn has_binary(&self, _name: &str) -> bool {
        true
    }

    fn file_exists(&self, _path: &Path) -> bool {
        false
    }

    async fn read_file(&self, _path: &Path) -> Result<Option<String>> {
        Ok(None)
    }

    async fn write_file(&self, path: &Path, _contents: &str) -> Result<()> {
        anyhow::bail!("unexpected write to {}", path.display())
    }

    async fn run(&self, program: &str, _args: &[&str]) -> Result<CommandOutput> {
        anyhow::bail!("unexpected command {program}")
    }

    async fn run_in(
        &self,
        _dir: &Path,
        _env: &[(&str, &str)],
        program: &str,
        _args: &[&str],
    ) -> Result<CommandOutput> {
        anyhow::bail!("unexpected command {program}")
    }
}

/// Configuration for `june.example.com` rooted in `dir`.
pub fn config(dir: &TempDir) -> InstallConfig {
    let mut config = InstallConfig::with_defaults(dir.path().join("config"), dir.path().join("certs"));
    config.domain = Some("june.example.com".into());
    config.acme_email = Some("ops@example.com".into());
    config.cf_api_token = Some("cf-token".into());
    config.wait_timeout_secs = 20;
    config
}

/// A step context over `cluster`, with the store in `dir/config`.
pub fn context(dir: &TempDir, cluster: Arc<MemoryCluster>) -> StepContext {
    let config = config(dir);
    let store = ConfigStore::new(&config.config_dir);
    StepContext::new(config, store, cluster, Arc::new(InertHost))
}
