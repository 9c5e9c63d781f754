//! TLS certificate backup and restore.
//!
//! A backup is the YAML manifest of a `kubernetes.io/tls` Secret with its
//! server-managed metadata stripped, stored as `<secret>-<timestamp>.yaml`.
//! Reapplying the manifest restores the secret under the name recorded in
//! the manifest itself. Only the newest [`DEFAULT_RETENTION`] backups per
//! secret are kept.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::extensions::GeneralName;

use crate::cluster::Cluster;

/// Number of backups kept per secret.
pub const DEFAULT_RETENTION: usize = 5;

/// Certificate data key in a TLS secret.
pub const TLS_CRT: &str = "tls.crt";
/// Private key data key in a TLS secret.
pub const TLS_KEY: &str = "tls.key";

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%9f";

/// Errors raised by certificate backup and restore.
#[derive(Error, Debug)]
pub enum CertError {
    /// The secret to back up does not exist.
    #[error("Secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// The secret or backup file is not a usable TLS secret.
    #[error("Invalid TLS secret: {0}")]
    Validation(String),

    /// Reading or writing a backup file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serializing the backup manifest failed.
    #[error("Failed to serialize backup: {0}")]
    Serialize(#[from] serde_yaml::Error),

    /// The cluster call itself failed.
    #[error("Cluster error: {0:#}")]
    Cluster(anyhow::Error),
}

impl CertError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of a successful backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    /// Backup file written.
    pub path: PathBuf,
    /// DNS names covered by the certificate.
    pub domains: Vec<String>,
    /// Certificate expiry, if the certificate could be parsed.
    pub not_after: Option<DateTime<Utc>>,
}

/// A backup file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    /// Backup file.
    pub path: PathBuf,
    /// Secret name encoded in the file name.
    pub secret_name: String,
    /// When the backup was taken.
    pub taken_at: DateTime<Utc>,
}

/// Directory of certificate backups with a retention policy.
#[derive(Debug, Clone)]
pub struct CertificateBackups {
    dir: PathBuf,
    retention: usize,
}

impl CertificateBackups {
    /// Create a backup directory handle keeping [`DEFAULT_RETENTION`] backups.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Override the number of backups kept per secret (minimum 1).
    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Backup directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Export a TLS secret to a timestamped backup file, then prune old backups.
    ///
    /// # Errors
    ///
    /// [`CertError::NotFound`] if the secret is absent, [`CertError::Validation`]
    /// if it lacks TLS data, or an I/O/cluster error.
    pub async fn backup(
        &self,
        cluster: &dyn Cluster,
        secret_name: &str,
        namespace: &str,
    ) -> Result<BackupRecord, CertError> {
        let secret = cluster
            .get_secret(secret_name, namespace)
            .await
            .map_err(CertError::Cluster)?
            .ok_or_else(|| CertError::NotFound {
                namespace: namespace.to_string(),
                name: secret_name.to_string(),
            })?;

        let crt = tls_field(&secret, TLS_CRT)?;
        tls_field(&secret, TLS_KEY)?;

        let (domains, not_after) = match inspect_certificate(crt) {
            Some((domains, not_after)) => (domains, Some(not_after)),
            None => {
                warn!(secret = secret_name, "Could not parse certificate; backing up without metadata");
                (Vec::new(), None)
            }
        };

        let manifest = portable_secret(secret, secret_name);
        let mut contents = format!(
            "# June certificate backup\n# secret: {secret_name}\n# namespace: {namespace}\n# domains: {}\n# not-after: {}\n",
            domains.join(","),
            not_after.map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339()),
        );
        contents.push_str(&serde_yaml::to_string(&manifest)?);

        fs::create_dir_all(&self.dir).map_err(|e| CertError::io(&self.dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| CertError::io(&self.dir, e))?;
        }

        let path = self.next_backup_path(secret_name);
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| CertError::io(&self.dir, e))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| CertError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| CertError::io(&path, e.error))?;

        info!(
            secret = secret_name,
            namespace,
            path = %path.display(),
            domains = ?domains,
            "Backed up TLS secret"
        );

        self.prune(secret_name)?;

        Ok(BackupRecord {
            path,
            domains,
            not_after,
        })
    }

    /// Reapply a backup into `namespace`, returning the restored secret name.
    ///
    /// The name always comes from the manifest, never from the file name.
    ///
    /// # Errors
    ///
    /// [`CertError::Validation`] on malformed input, or an I/O/cluster error.
    pub async fn restore(
        &self,
        cluster: &dyn Cluster,
        path: &Path,
        namespace: &str,
    ) -> Result<String, CertError> {
        let contents = fs::read_to_string(path).map_err(|e| CertError::io(path, e))?;
        let secret = parse_backup(&contents)?;
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or_else(|| CertError::Validation("manifest has no metadata.name".into()))?;

        cluster
            .put_secret(secret, namespace)
            .await
            .map_err(CertError::Cluster)?;

        info!(secret = %name, namespace, path = %path.display(), "Restored TLS secret");
        Ok(name)
    }

    /// List backups, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<BackupEntry>, CertError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| CertError::io(&self.dir, e))? {
            let entry = entry.map_err(|e| CertError::io(&self.dir, e))?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((secret_name, taken_at)) = parse_backup_file_name(file_name) {
                entries.push(BackupEntry {
                    path,
                    secret_name,
                    taken_at,
                });
            }
        }

        entries.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(entries)
    }

    /// Newest backup of a given secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn latest_for(&self, secret_name: &str) -> Result<Option<BackupEntry>, CertError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|e| e.secret_name == secret_name))
    }

    /// Read the certificate metadata of a backup file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a TLS secret.
    pub fn inspect(&self, path: &Path) -> Result<(Vec<String>, Option<DateTime<Utc>>), CertError> {
        let contents = fs::read_to_string(path).map_err(|e| CertError::io(path, e))?;
        let secret = parse_backup(&contents)?;
        let crt = tls_field(&secret, TLS_CRT)?;
        Ok(inspect_certificate(crt).map_or((Vec::new(), None), |(d, t)| (d, Some(t))))
    }

    /// Delete all but the newest `retention` backups of a secret.
    fn prune(&self, secret_name: &str) -> Result<(), CertError> {
        let stale: Vec<BackupEntry> = self
            .list()?
            .into_iter()
            .filter(|e| e.secret_name == secret_name)
            .skip(self.retention)
            .collect();

        for entry in stale {
            fs::remove_file(&entry.path).map_err(|e| CertError::io(&entry.path, e))?;
            debug!(path = %entry.path.display(), "Pruned old certificate backup");
        }
        Ok(())
    }

    /// A fresh backup path, strictly newer than any existing one for this secret.
    fn next_backup_path(&self, secret_name: &str) -> PathBuf {
        let newest = self
            .list()
            .ok()
            .and_then(|entries| entries.into_iter().find(|e| e.secret_name == secret_name))
            .map(|e| e.taken_at);

        let mut taken_at = Utc::now();
        if let Some(newest) = newest {
            if taken_at <= newest {
                taken_at = newest + TimeDelta::nanoseconds(1);
            }
        }

        loop {
            let path = self.dir.join(backup_file_name(secret_name, taken_at));
            if !path.exists() {
                return path;
            }
            taken_at += TimeDelta::nanoseconds(1);
        }
    }
}

/// Backup file name for a secret at a point in time.
#[must_use]
pub fn backup_file_name(secret_name: &str, taken_at: DateTime<Utc>) -> String {
    format!("{secret_name}-{}.yaml", taken_at.format(TIMESTAMP_FORMAT))
}

/// Split a backup file name into secret name and timestamp.
fn parse_backup_file_name(file_name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = file_name.strip_suffix(".yaml")?;
    let mut parts = stem.rsplitn(4, '-');
    let nanos = parts.next()?;
    let time = parts.next()?;
    let date = parts.next()?;
    let secret_name = parts.next()?;
    if secret_name.is_empty() {
        return None;
    }

    let stamp = format!("{date}-{time}-{nanos}");
    let naive = NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT).ok()?;
    Some((secret_name.to_string(), naive.and_utc()))
}

/// Return a non-empty TLS data field.
fn tls_field<'a>(secret: &'a Secret, key: &str) -> Result<&'a [u8], CertError> {
    let has_crt = has_field(secret, TLS_CRT);
    let has_key = has_field(secret, TLS_KEY);
    if !has_crt && !has_key {
        return Err(CertError::Validation(format!(
            "secret has neither {TLS_CRT} nor {TLS_KEY}"
        )));
    }

    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.as_slice())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| CertError::Validation(format!("secret is missing {key}")))
}

fn has_field(secret: &Secret, key: &str) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .is_some_and(|b| !b.0.is_empty())
}

/// Strip server-managed metadata so the manifest can be applied anywhere.
fn portable_secret(secret: Secret, name: &str) -> Secret {
    let labels = secret.metadata.labels.filter(|l| !l.is_empty());
    let annotations: Option<BTreeMap<String, String>> = secret
        .metadata
        .annotations
        .map(|a| {
            a.into_iter()
                .filter(|(k, _)| k != "kubectl.kubernetes.io/last-applied-configuration")
                .collect::<BTreeMap<_, _>>()
        })
        .filter(|a| !a.is_empty());

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels,
            annotations,
            ..ObjectMeta::default()
        },
        type_: secret.type_.or_else(|| Some("kubernetes.io/tls".to_string())),
        data: secret.data,
        immutable: secret.immutable,
        string_data: None,
    }
}

/// Parse and validate a backup manifest.
fn parse_backup(contents: &str) -> Result<Secret, CertError> {
    let value: serde_yaml::Value = serde_yaml::from_str(contents)
        .map_err(|e| CertError::Validation(format!("backup is not valid YAML: {e}")))?;

    match value.get("kind").and_then(serde_yaml::Value::as_str) {
        Some("Secret") => {}
        Some(other) => {
            return Err(CertError::Validation(format!(
                "expected kind Secret, found {other}"
            )))
        }
        None => return Err(CertError::Validation("manifest has no kind".into())),
    }

    let secret: Secret = serde_yaml::from_value(value)
        .map_err(|e| CertError::Validation(format!("malformed Secret manifest: {e}")))?;

    if secret.metadata.name.as_deref().is_none_or(str::is_empty) {
        return Err(CertError::Validation("manifest has no metadata.name".into()));
    }
    tls_field(&secret, TLS_CRT)?;
    tls_field(&secret, TLS_KEY)?;

    Ok(Secret {
        metadata: ObjectMeta {
            namespace: None,
            resource_version: None,
            uid: None,
            ..secret.metadata
        },
        ..secret
    })
}

/// Extract SAN DNS names (falling back to the subject CN) and expiry from a PEM certificate.
#[must_use]
pub fn inspect_certificate(pem_bytes: &[u8]) -> Option<(Vec<String>, DateTime<Utc>)> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_bytes).ok()?;
    let cert = pem.parse_x509().ok()?;

    let mut domains = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                domains.push((*dns).to_string());
            }
        }
    }
    if domains.is_empty() {
        domains.extend(
            cert.subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(String::from),
        );
    }

    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)?;
    Some((domains, not_after))
}
