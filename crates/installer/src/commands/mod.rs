pub mod cert;
pub mod config;
pub mod install;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use june_installer::certs::CertificateBackups;
use june_installer::store::ConfigStore;
use june_installer::InstallConfig;

/// How a command finished, mapped to the process exit status by `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Everything succeeded.
    Clean,
    /// The install finished but at least one step is DEGRADED.
    Degraded,
}

/// Locations shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration store directory
    #[arg(long, global = true, env = "JUNE_CONFIG_DIR", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Certificate backup directory
    #[arg(long, global = true, env = "JUNE_CERTS_DIR", value_name = "DIR")]
    pub certs_dir: Option<PathBuf>,

    /// Kubeconfig used to reach the cluster
    #[arg(long, global = true, env = "KUBECONFIG", value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,
}

impl GlobalArgs {
    fn config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(InstallConfig::default_config_dir)
    }

    fn certs_dir(&self) -> PathBuf {
        self.certs_dir
            .clone()
            .unwrap_or_else(InstallConfig::default_certs_dir)
    }

    /// The configuration store.
    pub fn store(&self) -> ConfigStore {
        ConfigStore::new(self.config_dir())
    }

    /// The certificate backup directory.
    pub fn backups(&self) -> CertificateBackups {
        CertificateBackups::new(self.certs_dir())
    }

    /// Defaults overlaid with whatever earlier runs persisted.
    pub fn load_config(&self) -> Result<InstallConfig> {
        let mut config = InstallConfig::with_defaults(self.config_dir(), self.certs_dir());
        config
            .merge_store(&self.store())
            .context("Failed to read the configuration store")?;
        config.kubeconfig.clone_from(&self.kubeconfig);
        Ok(config)
    }
}
