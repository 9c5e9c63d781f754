use anyhow::Result;
use clap::Args;
use colored::Colorize;

use june_installer::cluster::{Cluster, KubectlCluster};
use june_installer::state::RunState;
use june_installer::ui;

use super::{GlobalArgs, Outcome};

/// Show the result of the last installation run
#[derive(Args, Debug)]
pub struct StatusCommand {
    /// Also check whether the Kubernetes API answers
    #[arg(long)]
    check_cluster: bool,
}

impl StatusCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<Outcome> {
        let config = global.load_config()?;

        ui::print_section("June Platform Status");
        ui::print_kv("Domain", config.domain.as_deref().unwrap_or("not configured"));
        ui::print_kv(
            "Certificate secret",
            config.cert_secret_name().as_deref().unwrap_or("-"),
        );
        ui::print_kv("Config directory", &config.config_dir.display().to_string());

        let backups = global.backups().list()?;
        match backups.first() {
            Some(latest) => ui::print_kv(
                "Latest backup",
                &format!("{} ({} total)", latest.taken_at.format("%Y-%m-%d %H:%M:%S"), backups.len()),
            ),
            None => ui::print_kv("Latest backup", "none"),
        }

        if self.check_cluster {
            let cluster = KubectlCluster::new(config.kubeconfig.clone());
            let reachable = cluster.is_reachable().await.unwrap_or(false);
            ui::print_check_result("Kubernetes API", reachable, None);
        }

        let Some(state) = RunState::load(&config.state_file())? else {
            println!();
            ui::print_info("No installation has run yet. Start one with `june install`.");
            return Ok(Outcome::Clean);
        };

        ui::print_kv("Last run started", &state.started_at);
        ui::print_kv("Last updated", &state.updated_at);
        ui::print_report(&state.report());

        if let Some(ref step) = state.aborted_at {
            ui::print_error(&format!(
                "Run aborted at '{step}': {}",
                state.last_error.as_deref().unwrap_or("unknown error")
            ));
            return Ok(Outcome::Degraded);
        }
        if !state.completed {
            println!("{}", "The last run did not finish.".yellow());
            return Ok(Outcome::Degraded);
        }
        if state.degraded().next().is_some() {
            return Ok(Outcome::Degraded);
        }
        Ok(Outcome::Clean)
    }
}
