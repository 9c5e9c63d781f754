//! Durable category-scoped configuration store.
//!
//! Configuration lives in flat `KEY=value` files (one per [`Category`]) so an
//! operator can still read, edit, or `source` them from a shell. All writes go
//! through [`ConfigStore::update`], a read-modify-write transaction guarded by
//! an exclusive advisory lock and committed with an atomic rename.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// A flat key/value mapping as stored in one category file.
pub type ConfigMap = BTreeMap<String, String>;

/// Name of the lock file guarding all writes in a store directory.
const LOCK_FILE: &str = ".store.lock";

/// Errors raised by the configuration store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Reading or writing a store file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A category file exists but could not be parsed.
    #[error("Malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    /// A key is not a valid shell identifier.
    #[error("Invalid config key '{0}': keys must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidKey(String),

    /// A value cannot be written to a single env-file line.
    #[error("Value for '{0}' contains a line break")]
    MultilineValue(String),

    /// A category name could not be recognised.
    #[error("Unknown config category '{0}'. Supported: infrastructure, domain, networking, secrets, stunner")]
    UnknownCategory(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Configuration category, one file each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Cluster-level settings (pod CIDR, Kubernetes version, component toggles).
    Infrastructure,
    /// Domains, ACME email, derived certificate secret name.
    Domain,
    /// MetalLB and ingress settings.
    Networking,
    /// Credentials and API tokens.
    Secrets,
    /// STUNner TURN relay settings.
    Stunner,
}

impl Category {
    /// All categories in display order.
    pub const ALL: [Self; 5] = [
        Self::Infrastructure,
        Self::Domain,
        Self::Networking,
        Self::Secrets,
        Self::Stunner,
    ];

    /// File name backing this category.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure.env",
            Self::Domain => "domain-config.env",
            Self::Networking => "networking.env",
            Self::Secrets => "secrets.env",
            Self::Stunner => "stunner-config.env",
        }
    }

    /// Whether values in this category should be masked and kept private.
    #[must_use]
    pub const fn is_sensitive(self) -> bool {
        matches!(self, Self::Secrets)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Infrastructure => "infrastructure",
            Self::Domain => "domain",
            Self::Networking => "networking",
            Self::Secrets => "secrets",
            Self::Stunner => "stunner",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for Category {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().trim_end_matches(".env") {
            "infrastructure" | "infra" => Ok(Self::Infrastructure),
            "domain" | "domain-config" => Ok(Self::Domain),
            "networking" | "network" => Ok(Self::Networking),
            "secrets" | "secret" => Ok(Self::Secrets),
            "stunner" | "stunner-config" => Ok(Self::Stunner),
            _ => Err(StoreError::UnknownCategory(s.to_string())),
        }
    }
}

/// File-backed configuration store rooted at one directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Create a store rooted at `dir`. The directory is created lazily on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `category`.
    #[must_use]
    pub fn path(&self, category: Category) -> PathBuf {
        self.dir.join(category.file_name())
    }

    /// Load a category. A missing file yields an empty mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self, category: Category) -> Result<ConfigMap, StoreError> {
        read_env_file(&self.path(category))
    }

    /// Load a single value.
    ///
    /// # Errors
    ///
    /// Returns an error if the category file cannot be read.
    pub fn get(&self, category: Category, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load(category)?.remove(key))
    }

    /// Merge `values` into a category. Keys not present in `values` are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid or the file cannot be written.
    pub fn save(&self, category: Category, values: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.update(category, |current| {
            for (key, value) in values {
                current.insert(key.clone(), value.clone());
            }
        })
    }

    /// Remove keys from a category.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub fn remove(&self, category: Category, keys: &[&str]) -> Result<ConfigMap, StoreError> {
        self.update(category, |current| {
            for key in keys {
                current.remove(*key);
            }
        })
    }

    /// Run a read-modify-write transaction on one category.
    ///
    /// The whole transaction holds an exclusive lock on the store directory,
    /// and the new contents replace the old file atomically. Returns the
    /// committed mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if locking, reading, validating, or writing fails.
    pub fn update<F>(&self, category: Category, mutate: F) -> Result<ConfigMap, StoreError>
    where
        F: FnOnce(&mut ConfigMap),
    {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let _lock = StoreLock::acquire(&self.dir)?;

        let path = self.path(category);
        let mut values = read_env_file(&path)?;
        mutate(&mut values);

        if let Some(bad) = values.keys().find(|k| !is_valid_key(k)) {
            return Err(StoreError::InvalidKey(bad.clone()));
        }
        if let Some((key, _)) = values.iter().find(|(_, v)| v.contains(['\n', '\r'])) {
            return Err(StoreError::MultilineValue(key.clone()));
        }

        write_env_file(&self.dir, &path, category, &values)?;
        debug!(
            category = %category,
            keys = values.len(),
            "Committed config transaction"
        );
        Ok(values)
    }

    /// Load every category that has at least one value.
    ///
    /// # Errors
    ///
    /// Returns an error if any existing file cannot be read.
    pub fn load_all(&self) -> Result<BTreeMap<Category, ConfigMap>, StoreError> {
        let mut all = BTreeMap::new();
        for category in Category::ALL {
            let values = self.load(category)?;
            if !values.is_empty() {
                all.insert(category, values);
            }
        }
        Ok(all)
    }
}

/// Exclusive advisory lock held for the duration of a transaction.
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| StoreError::io(&path, e))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Check a key is a valid shell identifier.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn read_env_file(path: &Path) -> Result<ConfigMap, StoreError> {
    if !path.exists() {
        return Ok(ConfigMap::new());
    }

    let iter = dotenvy::from_path_iter(path).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut values = ConfigMap::new();
    for item in iter {
        let (key, value) = item.map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        values.insert(key, value);
    }
    Ok(values)
}

fn write_env_file(
    dir: &Path,
    path: &Path,
    category: Category,
    values: &ConfigMap,
) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(render_env(category, values).as_bytes())
        .map_err(|e| StoreError::io(tmp.path(), e))?;

    #[cfg(unix)]
    if category.is_sensitive() {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| StoreError::io(tmp.path(), e))?;
    }

    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Render a mapping as a shell-compatible env file.
#[must_use]
pub fn render_env(category: Category, values: &ConfigMap) -> String {
    let mut out = format!("# June platform {category} configuration (managed by june)\n");
    for (key, value) in values {
        out.push_str(key);
        out.push('=');
        out.push_str(&quote_value(value));
        out.push('\n');
    }
    out
}

/// Quote a single-line value so that both `dotenvy` and a POSIX shell read
/// it back verbatim.
///
/// Anything beyond a conservative bare set is single-quoted, where neither
/// reader expands `$` or backticks. Embedded single quotes become `'\''`.
fn quote_value(value: &str) -> String {
    let bare = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@,+%".contains(c));
    if bare {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
