//! Installation configuration types.
//!
//! [`InstallConfig`] is the typed view over the configuration store. It is
//! built once per run (store values, then environment/flags, then prompts)
//! and passed explicitly to every step. Derived values such as the
//! certificate secret name have exactly one derivation each in this module.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::{Category, ConfigMap, ConfigStore, StoreError};

/// Default pod network CIDR (matches the flannel default).
pub const DEFAULT_POD_NETWORK_CIDR: &str = "10.244.0.0/16";
/// Default Kubernetes minor version installed from pkgs.k8s.io.
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.30";
/// Default number of GPU time slices advertised per physical GPU.
pub const DEFAULT_GPU_SLICES: u32 = 4;
/// Default namespace for the June application and its certificate.
pub const DEFAULT_APP_NAMESPACE: &str = "june";
/// Default readiness timeout applied to every step wait.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// Store keys, grouped by category.
pub mod keys {
    pub const POD_NETWORK_CIDR: &str = "POD_NETWORK_CIDR";
    pub const KUBERNETES_VERSION: &str = "K8S_VERSION";
    pub const ENABLE_GPU: &str = "ENABLE_GPU";
    pub const GPU_SLICES: &str = "GPU_TIME_SLICES";
    pub const ENABLE_OPENCTI: &str = "ENABLE_OPENCTI";
    pub const GITHUB_RUNNER_URL: &str = "GITHUB_RUNNER_URL";
    pub const APP_CHART: &str = "JUNE_APP_CHART";
    pub const APP_VALUES: &str = "JUNE_APP_VALUES";

    pub const DOMAIN: &str = "DOMAIN";
    pub const EXTRA_DOMAINS: &str = "EXTRA_DOMAINS";
    pub const LETSENCRYPT_EMAIL: &str = "LETSENCRYPT_EMAIL";
    pub const ACME_STAGING: &str = "ACME_STAGING";
    pub const CERT_SECRET_NAME: &str = "CERT_SECRET_NAME";
    pub const APP_NAMESPACE: &str = "JUNE_NAMESPACE";

    pub const METALLB_ADDRESS_RANGE: &str = "METALLB_ADDRESS_RANGE";

    pub const CF_API_TOKEN: &str = "CF_API_TOKEN";
    pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
    pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
    pub const OPENCTI_ADMIN_PASSWORD: &str = "OPENCTI_ADMIN_PASSWORD";
    pub const OPENCTI_ADMIN_TOKEN: &str = "OPENCTI_ADMIN_TOKEN";

    pub const STUNNER_REALM: &str = "STUNNER_REALM";
    pub const STUNNER_USERNAME: &str = "STUNNER_USERNAME";
    pub const STUNNER_PASSWORD: &str = "STUNNER_PASSWORD";
    pub const STUNNER_PORT: &str = "STUNNER_PORT";
}

/// Which Let's Encrypt endpoint to issue certificates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AcmeEnvironment {
    /// Production endpoint (trusted certificates, strict rate limits).
    #[default]
    Production,
    /// Staging endpoint (untrusted certificates, relaxed limits).
    Staging,
}

impl AcmeEnvironment {
    /// Name of the ClusterIssuer for this environment.
    #[must_use]
    pub const fn issuer_name(self) -> &'static str {
        match self {
            Self::Production => "letsencrypt-prod",
            Self::Staging => "letsencrypt-staging",
        }
    }

    /// ACME directory URL.
    #[must_use]
    pub const fn server(self) -> &'static str {
        match self {
            Self::Production => "https://acme-v02.api.letsencrypt.org/directory",
            Self::Staging => "https://acme-staging-v02.api.letsencrypt.org/directory",
        }
    }
}

/// Full installation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallConfig {
    // Paths
    /// Directory holding the configuration store and run state.
    pub config_dir: PathBuf,
    /// Directory holding certificate backups.
    pub certs_dir: PathBuf,
    /// Kubeconfig used for cluster access (None = default loading rules).
    pub kubeconfig: Option<PathBuf>,

    // Infrastructure
    /// Pod network CIDR passed to kubeadm and the CNI.
    pub pod_network_cidr: String,
    /// Kubernetes minor version (e.g. "1.30").
    pub kubernetes_version: String,

    // Domain
    /// Primary domain (e.g. "june.example.com").
    pub domain: Option<String>,
    /// Extra domains added to the certificate.
    pub extra_domains: Vec<String>,
    /// Let's Encrypt account email.
    pub acme_email: Option<String>,
    /// Which ACME endpoint to use.
    pub acme: AcmeEnvironment,
    /// Namespace of the June application and its TLS secret.
    pub app_namespace: String,

    // Networking
    /// MetalLB address range ("a.b.c.d-a.b.c.e" or a CIDR). None = node IP.
    pub metallb_range: Option<String>,

    // Secrets
    /// Cloudflare API token for DNS-01 validation.
    pub cf_api_token: Option<String>,
    /// GitHub token used to mint runner registration tokens.
    pub github_token: Option<String>,
    /// Gemini API key passed to the June application.
    pub gemini_api_key: Option<String>,

    // Optional components
    /// Install the NVIDIA GPU operator with time-slicing.
    pub enable_gpu: bool,
    /// Time slices per physical GPU.
    pub gpu_slices: u32,
    /// Repository or organisation URL the self-hosted runner registers with.
    pub runner_url: Option<String>,
    /// Install OpenCTI.
    pub enable_opencti: bool,
    /// Helm chart reference of the June application.
    pub app_chart: Option<String>,
    /// Values file for the June application chart.
    pub app_values: Option<PathBuf>,

    // Sequencing
    /// Steps disabled by the operator.
    pub skip_steps: Vec<String>,
    /// Readiness timeout for every step wait.
    pub wait_timeout_secs: u64,
}

impl InstallConfig {
    /// Create a config with defaults rooted at the given directories.
    #[must_use]
    pub fn with_defaults(config_dir: PathBuf, certs_dir: PathBuf) -> Self {
        Self {
            config_dir,
            certs_dir,
            kubeconfig: None,
            pod_network_cidr: DEFAULT_POD_NETWORK_CIDR.into(),
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.into(),
            domain: None,
            extra_domains: Vec::new(),
            acme_email: None,
            acme: AcmeEnvironment::default(),
            app_namespace: DEFAULT_APP_NAMESPACE.into(),
            metallb_range: None,
            cf_api_token: None,
            github_token: None,
            gemini_api_key: None,
            enable_gpu: false,
            gpu_slices: DEFAULT_GPU_SLICES,
            runner_url: None,
            enable_opencti: false,
            app_chart: None,
            app_values: None,
            skip_steps: Vec::new(),
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
        }
    }

    /// Default config directory (`~/.june-config`, `/root/.june-config` for root).
    #[must_use]
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".june-config")
    }

    /// Default certificate backup directory (`~/.june-certs`).
    #[must_use]
    pub fn default_certs_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".june-certs")
    }

    /// Overlay values previously persisted in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if a store file cannot be read.
    pub fn merge_store(&mut self, store: &ConfigStore) -> Result<(), StoreError> {
        let infra = store.load(Category::Infrastructure)?;
        if let Some(v) = infra.get(keys::POD_NETWORK_CIDR) {
            self.pod_network_cidr.clone_from(v);
        }
        if let Some(v) = infra.get(keys::KUBERNETES_VERSION) {
            self.kubernetes_version.clone_from(v);
        }
        if let Some(v) = infra.get(keys::ENABLE_GPU) {
            self.enable_gpu = parse_bool(v);
        }
        if let Some(n) = infra.get(keys::GPU_SLICES).and_then(|v| v.parse().ok()) {
            self.gpu_slices = n;
        }
        if let Some(v) = infra.get(keys::ENABLE_OPENCTI) {
            self.enable_opencti = parse_bool(v);
        }
        set_opt(&mut self.runner_url, infra.get(keys::GITHUB_RUNNER_URL));
        set_opt(&mut self.app_chart, infra.get(keys::APP_CHART));
        if let Some(v) = non_empty(infra.get(keys::APP_VALUES)) {
            self.app_values = Some(PathBuf::from(v));
        }

        let domain = store.load(Category::Domain)?;
        set_opt(&mut self.domain, domain.get(keys::DOMAIN));
        if let Some(v) = domain.get(keys::EXTRA_DOMAINS) {
            self.extra_domains = split_list(v);
        }
        set_opt(&mut self.acme_email, domain.get(keys::LETSENCRYPT_EMAIL));
        if let Some(v) = domain.get(keys::ACME_STAGING) {
            self.acme = if parse_bool(v) {
                AcmeEnvironment::Staging
            } else {
                AcmeEnvironment::Production
            };
        }
        if let Some(v) = non_empty(domain.get(keys::APP_NAMESPACE)) {
            self.app_namespace = v.to_string();
        }

        let networking = store.load(Category::Networking)?;
        set_opt(&mut self.metallb_range, networking.get(keys::METALLB_ADDRESS_RANGE));

        let secrets = store.load(Category::Secrets)?;
        set_opt(&mut self.cf_api_token, secrets.get(keys::CF_API_TOKEN));
        set_opt(&mut self.github_token, secrets.get(keys::GITHUB_TOKEN));
        set_opt(&mut self.gemini_api_key, secrets.get(keys::GEMINI_API_KEY));

        Ok(())
    }

    /// Persist the operator-supplied values so later runs do not re-prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if a store transaction fails.
    pub fn persist(&self, store: &ConfigStore) -> Result<(), StoreError> {
        for (category, values) in self.to_entries() {
            if !values.is_empty() {
                store.save(category, &values)?;
            }
        }
        Ok(())
    }

    /// Project the config into per-category store entries.
    #[must_use]
    pub fn to_entries(&self) -> Vec<(Category, ConfigMap)> {
        let mut infra = ConfigMap::new();
        infra.insert(keys::POD_NETWORK_CIDR.into(), self.pod_network_cidr.clone());
        infra.insert(keys::KUBERNETES_VERSION.into(), self.kubernetes_version.clone());
        infra.insert(keys::ENABLE_GPU.into(), self.enable_gpu.to_string());
        infra.insert(keys::GPU_SLICES.into(), self.gpu_slices.to_string());
        infra.insert(keys::ENABLE_OPENCTI.into(), self.enable_opencti.to_string());
        put_opt(&mut infra, keys::GITHUB_RUNNER_URL, self.runner_url.as_deref());
        put_opt(&mut infra, keys::APP_CHART, self.app_chart.as_deref());
        put_opt(
            &mut infra,
            keys::APP_VALUES,
            self.app_values.as_ref().and_then(|p| p.to_str()),
        );

        let mut domain = ConfigMap::new();
        put_opt(&mut domain, keys::DOMAIN, self.domain.as_deref());
        if !self.extra_domains.is_empty() {
            domain.insert(keys::EXTRA_DOMAINS.into(), self.extra_domains.join(","));
        }
        put_opt(&mut domain, keys::LETSENCRYPT_EMAIL, self.acme_email.as_deref());
        domain.insert(
            keys::ACME_STAGING.into(),
            (self.acme == AcmeEnvironment::Staging).to_string(),
        );
        domain.insert(keys::APP_NAMESPACE.into(), self.app_namespace.clone());
        if let Some(name) = self.cert_secret_name() {
            domain.insert(keys::CERT_SECRET_NAME.into(), name);
        }

        let mut networking = ConfigMap::new();
        put_opt(&mut networking, keys::METALLB_ADDRESS_RANGE, self.metallb_range.as_deref());

        let mut secrets = ConfigMap::new();
        put_opt(&mut secrets, keys::CF_API_TOKEN, self.cf_api_token.as_deref());
        put_opt(&mut secrets, keys::GITHUB_TOKEN, self.github_token.as_deref());
        put_opt(&mut secrets, keys::GEMINI_API_KEY, self.gemini_api_key.as_deref());

        vec![
            (Category::Infrastructure, infra),
            (Category::Domain, domain),
            (Category::Networking, networking),
            (Category::Secrets, secrets),
        ]
    }

    /// Canonical TLS secret name for the primary domain.
    #[must_use]
    pub fn cert_secret_name(&self) -> Option<String> {
        self.domain.as_deref().map(cert_secret_name)
    }

    /// Canonical certificate domain list.
    #[must_use]
    pub fn certificate_domains(&self) -> Vec<String> {
        self.domain
            .as_deref()
            .map(|d| certificate_domains(d, &self.extra_domains))
            .unwrap_or_default()
    }

    /// Readiness timeout as a duration.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Kubernetes `MAJOR.MINOR` release, without a leading `v`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the configured version is two dot-separated
    /// numbers, optionally prefixed with `v`.
    pub fn kubernetes_minor(&self) -> anyhow::Result<&str> {
        let version = self.kubernetes_version.trim().trim_start_matches('v');
        let valid = match version.split_once('.') {
            Some((major, minor)) => [major, minor]
                .iter()
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit())),
            None => false,
        };
        if !valid {
            anyhow::bail!(
                "Invalid Kubernetes version '{}' (expected MAJOR.MINOR, e.g. 1.31)",
                self.kubernetes_version
            );
        }
        Ok(version)
    }

    /// Path of the persisted run state.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.config_dir.join("install-state.json")
    }

    /// Check the values every run needs are present.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing value.
    pub fn validate(&self) -> anyhow::Result<()> {
        let domain = self
            .domain
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Primary domain is required (--domain or DOMAIN)"))?;
        validate_domain(domain)?;
        for extra in &self.extra_domains {
            validate_domain(extra.trim_start_matches("*."))?;
        }
        if self.acme_email.as_deref().is_none_or(|e| !e.contains('@')) {
            anyhow::bail!("A valid Let's Encrypt email is required (--email or LETSENCRYPT_EMAIL)");
        }
        if self.cf_api_token.as_deref().is_none_or(str::is_empty) {
            anyhow::bail!("Cloudflare API token is required (--cf-api-token or CF_API_TOKEN)");
        }
        if !self.pod_network_cidr.contains('/') {
            anyhow::bail!("Invalid pod network CIDR: {}", self.pod_network_cidr);
        }
        self.kubernetes_minor()?;
        if self.enable_gpu && self.gpu_slices == 0 {
            anyhow::bail!("GPU time slices must be at least 1");
        }
        if self.runner_url.is_some() && self.github_token.is_none() {
            anyhow::bail!("A GitHub token is required to register the self-hosted runner");
        }
        Ok(())
    }
}

/// Canonical certificate secret name for a primary domain.
///
/// Lowercases the domain, strips a leading wildcard, and maps every
/// non-alphanumeric character to `-` before appending `-tls`:
/// `June.Example.com` → `june-example-com-tls`.
#[must_use]
pub fn cert_secret_name(primary_domain: &str) -> String {
    let base: String = primary_domain
        .trim()
        .trim_start_matches("*.")
        .trim_end_matches('.')
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}-tls", base.trim_matches('-'))
}

/// Canonical certificate domain list: the primary domain, its wildcard, and
/// any extras, lowercased and de-duplicated in order.
#[must_use]
pub fn certificate_domains(primary_domain: &str, extra: &[String]) -> Vec<String> {
    let primary = primary_domain
        .trim()
        .trim_start_matches("*.")
        .trim_end_matches('.')
        .to_lowercase();
    let mut domains = vec![primary.clone(), format!("*.{primary}")];
    for d in extra {
        let d = d.trim().trim_end_matches('.').to_lowercase();
        if !d.is_empty() && !domains.contains(&d) {
            domains.push(d);
        }
    }
    domains
}

fn validate_domain(domain: &str) -> anyhow::Result<()> {
    let valid = domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid {
        anyhow::bail!("Invalid domain name: {domain}");
    }
    Ok(())
}

/// Parse the boolean spellings that appear in hand-edited env files.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

fn set_opt(target: &mut Option<String>, value: Option<&String>) {
    if let Some(v) = non_empty(value) {
        *target = Some(v.to_string());
    }
}

fn put_opt(map: &mut ConfigMap, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        map.insert(key.to_string(), v.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> InstallConfig {
        InstallConfig::with_defaults(dir.path().join("config"), dir.path().join("certs"))
    }

    #[test]
    fn test_cert_secret_name_is_canonical() {
        assert_eq!(cert_secret_name("example.com"), "example-com-tls");
        assert_eq!(cert_secret_name("June.Example.com"), "june-example-com-tls");
        assert_eq!(cert_secret_name("*.example.com"), "example-com-tls");
        assert_eq!(cert_secret_name("example.com."), "example-com-tls");
    }

    #[test]
    fn test_certificate_domains() {
        let domains = certificate_domains(
            "Example.com",
            &["turn.example.com".into(), "example.com".into(), "*.example.com".into()],
        );
        assert_eq!(domains, vec!["example.com", "*.example.com", "turn.example.com"]);
    }

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        assert_eq!(config.pod_network_cidr, DEFAULT_POD_NETWORK_CIDR);
        assert_eq!(config.app_namespace, "june");
        assert_eq!(config.acme.issuer_name(), "letsencrypt-prod");
        assert_eq!(config.state_file(), dir.path().join("config/install-state.json"));
    }

    #[test]
    fn test_persist_then_merge_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config"));

        let mut config = config_in(&dir);
        config.domain = Some("june.example.com".into());
        config.extra_domains = vec!["turn.example.com".into()];
        config.acme_email = Some("ops@example.com".into());
        config.acme = AcmeEnvironment::Staging;
        config.cf_api_token = Some("cf-token".into());
        config.metallb_range = Some("192.168.1.240-192.168.1.250".into());
        config.enable_gpu = true;
        config.gpu_slices = 8;
        config.persist(&store).unwrap();

        let mut loaded = config_in(&dir);
        loaded.merge_store(&store).unwrap();

        assert_eq!(loaded.domain.as_deref(), Some("june.example.com"));
        assert_eq!(loaded.extra_domains, vec!["turn.example.com".to_string()]);
        assert_eq!(loaded.acme, AcmeEnvironment::Staging);
        assert_eq!(loaded.cf_api_token.as_deref(), Some("cf-token"));
        assert_eq!(loaded.metallb_range.as_deref(), Some("192.168.1.240-192.168.1.250"));
        assert!(loaded.enable_gpu);
        assert_eq!(loaded.gpu_slices, 8);
        assert_eq!(
            store.get(Category::Domain, keys::CERT_SECRET_NAME).unwrap().as_deref(),
            Some("june-example-com-tls")
        );
    }

    #[test]
    fn test_validate_requires_inputs() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        assert!(config.validate().is_err());

        config.domain = Some("june.example.com".into());
        config.acme_email = Some("ops@example.com".into());
        assert!(config.validate().unwrap_err().to_string().contains("Cloudflare"));

        config.cf_api_token = Some("token".into());
        assert!(config.validate().is_ok());

        config.domain = Some("bad_domain".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kubernetes_version_must_be_major_minor() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.domain = Some("june.example.com".into());
        config.acme_email = Some("ops@example.com".into());
        config.cf_api_token = Some("token".into());

        config.kubernetes_version = "v1.31".into();
        assert_eq!(config.kubernetes_minor().unwrap(), "1.31");
        assert!(config.validate().is_ok());

        for bad in ["1.30; rm -rf /", "1.30.2", "latest", "1.", "v.31", "1 .30"] {
            config.kubernetes_version = bad.into();
            assert!(config.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("YES"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
