use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password};
use tracing::info;

use june_installer::cluster::KubectlCluster;
use june_installer::host::SystemHost;
use june_installer::sequencer::{SequenceError, Sequencer, StepContext, StepStatus};
use june_installer::stages::{self, check_step_names, disabled_steps};
use june_installer::validator::PrerequisitesValidator;
use june_installer::{ui, AcmeEnvironment, InstallConfig};

use super::{GlobalArgs, Outcome};

/// Install the June platform on this host
#[derive(Args, Debug)]
pub struct InstallCommand {
    /// Primary domain served by the platform
    #[arg(long, env = "DOMAIN", value_name = "DOMAIN")]
    domain: Option<String>,

    /// Let's Encrypt account email
    #[arg(long, env = "LETSENCRYPT_EMAIL", value_name = "EMAIL")]
    email: Option<String>,

    /// Additional domain for the certificate (repeatable)
    #[arg(long = "extra-domain", value_name = "DOMAIN")]
    extra_domains: Vec<String>,

    /// Cloudflare API token for DNS-01 validation
    #[arg(long, env = "CF_API_TOKEN", value_name = "TOKEN", hide_env_values = true)]
    cf_api_token: Option<String>,

    /// Pod network CIDR
    #[arg(long, env = "POD_NETWORK_CIDR", value_name = "CIDR")]
    pod_network_cidr: Option<String>,

    /// MetalLB address range (defaults to the node address)
    #[arg(long, env = "METALLB_ADDRESS_RANGE", value_name = "RANGE")]
    metallb_range: Option<String>,

    /// Use the Let's Encrypt staging endpoint
    #[arg(long)]
    acme_staging: bool,

    /// Install the NVIDIA GPU operator with time-slicing
    #[arg(long)]
    enable_gpu: bool,

    /// Turn off the GPU operator even if the stored configuration enables it
    #[arg(long, conflicts_with = "enable_gpu")]
    disable_gpu: bool,

    /// Time slices advertised per physical GPU
    #[arg(long, value_name = "N")]
    gpu_slices: Option<u32>,

    /// Repository or organisation URL for a self-hosted GitHub runner
    #[arg(long, env = "GITHUB_RUNNER_URL", value_name = "URL")]
    runner_url: Option<String>,

    /// GitHub token used to register the runner
    #[arg(long, env = "GITHUB_TOKEN", value_name = "TOKEN", hide_env_values = true)]
    runner_token: Option<String>,

    /// Install OpenCTI
    #[arg(long)]
    enable_opencti: bool,

    /// Turn off OpenCTI even if the stored configuration enables it
    #[arg(long, conflicts_with = "enable_opencti")]
    disable_opencti: bool,

    /// Helm chart reference of the June application
    #[arg(long, value_name = "CHART")]
    app_chart: Option<String>,

    /// Values file for the June application chart
    #[arg(long, value_name = "FILE")]
    app_values: Option<PathBuf>,

    /// Gemini API key passed to the June application
    #[arg(long, env = "GEMINI_API_KEY", value_name = "KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    /// Skip a step by name (repeatable)
    #[arg(long = "skip", value_name = "STEP")]
    skip: Vec<String>,

    /// Readiness timeout per step, in seconds
    #[arg(long, value_name = "SECS")]
    wait_timeout: Option<u64>,

    /// Skip interactive prompts
    #[arg(long)]
    non_interactive: bool,

    /// Show what would run without changing anything
    #[arg(long)]
    dry_run: bool,
}

impl InstallCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<Outcome> {
        ui::print_banner();
        ui::print_section("June Platform Installation");

        ui::print_progress_step(1, 3, "Checking prerequisites");
        let validator = PrerequisitesValidator::new();
        if self.dry_run {
            if let Err(e) = validator.validate() {
                ui::print_warning(&format!("{e} (continuing because of --dry-run)"));
            }
        } else {
            validator.validate()?;
        }

        ui::print_progress_step(2, 3, "Configuring installation");
        let store = global.store();
        let mut config = global.load_config()?;
        self.apply_flags(&mut config);
        if !self.non_interactive {
            Self::prompt_missing(&mut config)?;
        }
        check_step_names(&config.skip_steps)?;
        config.validate()?;

        println!();
        print_config_summary(&config);
        println!();

        if !self.non_interactive && !self.dry_run {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Proceed with installation?")
                .default(true)
                .interact()?;

            if !proceed {
                println!("{}", "Installation cancelled.".yellow());
                return Ok(Outcome::Clean);
            }
        }

        let disabled = disabled_steps(&config);
        let state_file = config.state_file();
        let cluster = Arc::new(KubectlCluster::new(config.kubeconfig.clone()));

        if self.dry_run {
            let ctx = StepContext::new(config, store, cluster, Arc::new(SystemHost));
            let sequencer = Sequencer::new(stages::plan()).with_disabled(disabled);
            ui::print_section("Dry run");
            for planned in sequencer.plan(&ctx).await {
                let action = match planned.status {
                    StepStatus::Skipped => "skip".bright_black().to_string(),
                    _ => "run".green().bold().to_string(),
                };
                let detail = planned
                    .detail
                    .map(|d| format!(" ({d})").bright_black().to_string())
                    .unwrap_or_default();
                println!("  {action:>5}  {:<18} {}{detail}", planned.name, planned.description);
            }
            println!();
            return Ok(Outcome::Clean);
        }

        config
            .persist(&store)
            .context("Failed to save configuration")?;
        info!(config_dir = %store.dir().display(), "Configuration saved");

        ui::print_progress_step(3, 3, "Running installation steps");
        let mut ctx = StepContext::new(config, store, cluster, Arc::new(SystemHost));
        let sequencer = Sequencer::new(stages::plan())
            .with_disabled(disabled)
            .with_state_file(state_file)
            .with_progress(true);

        match sequencer.run(&mut ctx).await {
            Ok(report) => {
                ui::print_report(&report);
                if report.is_clean() {
                    ui::print_success("Installation complete!");
                    Ok(Outcome::Clean)
                } else {
                    Ok(Outcome::Degraded)
                }
            }
            Err(SequenceError::Aborted {
                step,
                source,
                report,
            }) => {
                ui::print_report(&report);
                Err(source.context(format!("Installation aborted at step '{step}'")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flags and environment variables take precedence over stored values.
    fn apply_flags(&self, config: &mut InstallConfig) {
        override_opt(&mut config.domain, self.domain.as_ref());
        override_opt(&mut config.acme_email, self.email.as_ref());
        override_opt(&mut config.cf_api_token, self.cf_api_token.as_ref());
        override_opt(&mut config.metallb_range, self.metallb_range.as_ref());
        override_opt(&mut config.runner_url, self.runner_url.as_ref());
        override_opt(&mut config.github_token, self.runner_token.as_ref());
        override_opt(&mut config.app_chart, self.app_chart.as_ref());
        override_opt(&mut config.gemini_api_key, self.gemini_api_key.as_ref());
        if let Some(ref cidr) = self.pod_network_cidr {
            config.pod_network_cidr.clone_from(cidr);
        }
        if !self.extra_domains.is_empty() {
            config.extra_domains.clone_from(&self.extra_domains);
        }
        if self.acme_staging {
            config.acme = AcmeEnvironment::Staging;
        }
        if let Some(on) = toggle(self.enable_gpu, self.disable_gpu) {
            config.enable_gpu = on;
        }
        if let Some(slices) = self.gpu_slices {
            config.gpu_slices = slices;
        }
        if let Some(on) = toggle(self.enable_opencti, self.disable_opencti) {
            config.enable_opencti = on;
        }
        if let Some(ref values) = self.app_values {
            config.app_values = Some(values.clone());
        }
        if let Some(secs) = self.wait_timeout {
            config.wait_timeout_secs = secs;
        }
        config.skip_steps.clone_from(&self.skip);
    }

    fn prompt_missing(config: &mut InstallConfig) -> Result<()> {
        let theme = ColorfulTheme::default();

        if config.domain.is_none() || config.acme_email.is_none() || config.cf_api_token.is_none() {
            println!();
            println!("{}", "Let's configure your June installation.".cyan().bold());
            println!();
        }

        if config.domain.is_none() {
            let domain: String = Input::with_theme(&theme)
                .with_prompt("Primary domain (e.g. june.example.com)")
                .interact_text()?;
            config.domain = Some(domain.trim().to_string());
        }

        if config.acme_email.is_none() {
            let email: String = Input::with_theme(&theme)
                .with_prompt("Let's Encrypt email")
                .validate_with(|input: &String| {
                    if input.contains('@') {
                        Ok(())
                    } else {
                        Err("Enter a valid email address")
                    }
                })
                .interact_text()?;
            config.acme_email = Some(email.trim().to_string());
        }

        if config.cf_api_token.is_none() {
            println!(
                "{}",
                "The Cloudflare token needs Zone:DNS:Edit on the domain's zone.".bright_black()
            );
            let token = Password::with_theme(&theme)
                .with_prompt("Cloudflare API token")
                .interact()?;
            config.cf_api_token = Some(token);
        }

        if config.runner_url.is_some() && config.github_token.is_none() {
            let token = Password::with_theme(&theme)
                .with_prompt("GitHub token for runner registration")
                .interact()?;
            config.github_token = Some(token);
        }

        Ok(())
    }
}

/// Explicit on/off from an `--enable-*`/`--disable-*` pair; `None` keeps the stored value.
const fn toggle(enable: bool, disable: bool) -> Option<bool> {
    match (enable, disable) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn override_opt(target: &mut Option<String>, value: Option<&String>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        *target = Some(v.clone());
    }
}

fn print_config_summary(config: &InstallConfig) {
    println!("{}", "Installation Configuration:".bold());
    ui::print_kv("Domain", config.domain.as_deref().unwrap_or("-"));
    ui::print_kv("Certificate domains", &config.certificate_domains().join(", "));
    ui::print_kv(
        "Certificate secret",
        config.cert_secret_name().as_deref().unwrap_or("-"),
    );
    ui::print_kv("ACME issuer", config.acme.issuer_name());
    ui::print_kv("Pod network", &config.pod_network_cidr);
    ui::print_kv(
        "MetalLB range",
        config.metallb_range.as_deref().unwrap_or("node address"),
    );
    ui::print_kv("Namespace", &config.app_namespace);

    let enabled = |on: bool| if on { "enabled" } else { "disabled" };
    ui::print_kv(
        "GPU time-slicing",
        &if config.enable_gpu {
            format!("{} slices per GPU", config.gpu_slices)
        } else {
            "disabled".to_string()
        },
    );
    ui::print_kv(
        "GitHub runner",
        config.runner_url.as_deref().unwrap_or("disabled"),
    );
    ui::print_kv("OpenCTI", enabled(config.enable_opencti));
    ui::print_kv("June app", config.app_chart.as_deref().unwrap_or("disabled"));
    if !config.skip_steps.is_empty() {
        ui::print_kv("Skipped steps", &config.skip_steps.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Wrapper {
        #[command(flatten)]
        install: InstallCommand,
    }

    fn parse(args: &[&str]) -> InstallCommand {
        let mut argv = vec!["june"];
        argv.extend_from_slice(args);
        Wrapper::parse_from(argv).install
    }

    #[test]
    fn test_flags_override_stored_values() {
        let mut config = InstallConfig::with_defaults("/tmp/c".into(), "/tmp/k".into());
        config.domain = Some("old.example.com".into());
        config.acme_email = Some("old@example.com".into());

        let cmd = parse(&[
            "--domain",
            "june.example.com",
            "--acme-staging",
            "--skip",
            "helm",
            "--extra-domain",
            "media.example.org",
            "--gpu-slices",
            "8",
        ]);
        cmd.apply_flags(&mut config);

        assert_eq!(config.domain.as_deref(), Some("june.example.com"));
        assert_eq!(config.acme_email.as_deref(), Some("old@example.com"));
        assert_eq!(config.acme, AcmeEnvironment::Staging);
        assert_eq!(config.skip_steps, vec!["helm"]);
        assert_eq!(config.extra_domains, vec!["media.example.org"]);
        assert_eq!(config.gpu_slices, 8);
    }

    #[test]
    fn test_disable_flags_turn_off_stored_components() {
        let mut config = InstallConfig::with_defaults("/tmp/c".into(), "/tmp/k".into());
        config.enable_gpu = true;
        config.enable_opencti = true;

        parse(&[]).apply_flags(&mut config);
        assert!(config.enable_gpu);
        assert!(config.enable_opencti);

        parse(&["--disable-gpu", "--disable-opencti"]).apply_flags(&mut config);
        assert!(!config.enable_gpu);
        assert!(!config.enable_opencti);

        parse(&["--enable-gpu"]).apply_flags(&mut config);
        assert!(config.enable_gpu);
        assert!(!config.enable_opencti);
    }

    #[test]
    fn test_enable_and_disable_conflict() {
        let err = Wrapper::try_parse_from(["install", "--enable-gpu", "--disable-gpu"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_empty_flag_keeps_stored_value() {
        let mut config = InstallConfig::with_defaults("/tmp/c".into(), "/tmp/k".into());
        config.cf_api_token = Some("stored".into());

        override_opt(&mut config.cf_api_token, Some(&String::new()));
        assert_eq!(config.cf_api_token.as_deref(), Some("stored"));
    }
}
