use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use colored::Colorize;

use june_installer::cluster::KubectlCluster;
use june_installer::ui;

use super::{GlobalArgs, Outcome};

/// Back up and restore the platform TLS certificate
#[derive(Args, Debug)]
pub struct CertCommand {
    #[command(subcommand)]
    action: CertAction,
}

#[derive(Subcommand, Debug)]
enum CertAction {
    /// Export the TLS secret to the backup directory
    Backup {
        /// Secret name (defaults to the one derived from the configured domain)
        #[arg(long)]
        secret: Option<String>,

        /// Namespace holding the secret
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Re-create a TLS secret from a backup file
    Restore {
        /// Backup file to restore
        path: PathBuf,

        /// Target namespace
        #[arg(long)]
        namespace: Option<String>,
    },

    /// List local backups, newest first
    List,
}

impl CertCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<Outcome> {
        let config = global.load_config()?;
        let backups = global.backups();

        match &self.action {
            CertAction::Backup { secret, namespace } => {
                let secret = secret
                    .clone()
                    .or_else(|| config.cert_secret_name())
                    .context("No secret given and no domain configured (use --secret)")?;
                let namespace = namespace.as_deref().unwrap_or(&config.app_namespace);

                let cluster = KubectlCluster::new(config.kubeconfig.clone());
                let record = backups.backup(&cluster, &secret, namespace).await?;

                ui::print_success(&format!("Backed up {namespace}/{secret}"));
                ui::print_kv("File", &record.path.display().to_string());
                if !record.domains.is_empty() {
                    ui::print_kv("Domains", &record.domains.join(", "));
                }
                if let Some(not_after) = record.not_after {
                    ui::print_kv("Expires", &not_after.to_rfc3339());
                }
            }
            CertAction::Restore { path, namespace } => {
                let namespace = namespace.as_deref().unwrap_or(&config.app_namespace);
                let cluster = KubectlCluster::new(config.kubeconfig.clone());
                let name = backups.restore(&cluster, path, namespace).await?;
                ui::print_success(&format!("Restored {namespace}/{name} from {}", path.display()));
            }
            CertAction::List => {
                let entries = backups.list()?;
                if entries.is_empty() {
                    ui::print_info(&format!("No backups in {}", backups.dir().display()));
                    return Ok(Outcome::Clean);
                }

                let now = Utc::now();
                for entry in entries {
                    let expiry = match backups.inspect(&entry.path) {
                        Ok((_, Some(not_after))) if not_after < now => {
                            format!("expired {}", not_after.format("%Y-%m-%d")).red().to_string()
                        }
                        Ok((_, Some(not_after))) => {
                            let days = (not_after - now).num_days();
                            format!("expires {} ({days}d)", not_after.format("%Y-%m-%d"))
                        }
                        Ok((_, None)) => "expiry unknown".bright_black().to_string(),
                        Err(e) => format!("unreadable: {e}").yellow().to_string(),
                    };
                    println!(
                        "  {} {}  {}  {}",
                        "•".cyan(),
                        entry.secret_name.bold(),
                        entry.taken_at.format("%Y-%m-%d %H:%M:%S"),
                        expiry
                    );
                    println!("    {}", entry.path.display().to_string().bright_black());
                }
            }
        }
        Ok(Outcome::Clean)
    }
}
