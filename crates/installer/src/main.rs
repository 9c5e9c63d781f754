//! June Platform Installer CLI.
//!
//! Installs Kubernetes and the June platform on a single bare-metal node,
//! and manages its configuration store and certificate backups.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::cert::CertCommand;
use commands::config::ConfigCommand;
use commands::install::InstallCommand;
use commands::status::StatusCommand;
use commands::{GlobalArgs, Outcome};
use june_installer::ui;

/// June Platform - Single-Node Bare Metal Installer.
#[derive(Parser)]
#[command(
    name = "june",
    version,
    about = "June Platform single-node bare metal installer",
    long_about = "Install the June platform on a single bare metal server.\n\n\
                  Sets up containerd, kubeadm, networking, TLS, the STUNner TURN\n\
                  gateway and the optional GPU, runner, OpenCTI and app components.\n\n\
                  All steps are idempotent - re-running `june install` skips what\n\
                  is already in place and retries what degraded."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "JUNE_JSON_LOGS")]
    json_logs: bool,

    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[allow(clippy::large_enum_variant)] // Install is the primary command, boxing adds indirection
enum Commands {
    /// Install the June platform on this host.
    ///
    /// Runs every installation step in order; steps whose end state already
    /// holds are skipped.
    Install(InstallCommand),

    /// Inspect or edit the stored configuration.
    Config(ConfigCommand),

    /// Back up, restore, or list TLS certificate backups.
    Cert(CertCommand),

    /// Show the result of the last installation run.
    Status(StatusCommand),
}

fn init_tracing(verbose: bool, json: bool) {
    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,june_installer=debug,june=debug")
        } else {
            EnvFilter::new("warn,june_installer=info,june=info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(cli: &Cli) -> Result<Outcome> {
    match &cli.command {
        Commands::Install(cmd) => cmd.run(&cli.global).await,
        Commands::Config(cmd) => cmd.run(&cli.global),
        Commands::Cert(cmd) => cmd.run(&cli.global).await,
        Commands::Status(cmd) => cmd.run(&cli.global).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    // Dropping the command future on Ctrl-C runs the drop guards of any
    // open port-forward tunnels.
    let result = tokio::select! {
        result = dispatch(&cli) => result,
        _ = tokio::signal::ctrl_c() => {
            ui::print_warning("Interrupted; re-run the same command to resume.");
            return ExitCode::from(130);
        }
    };

    match result {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::Degraded) => ExitCode::from(2),
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
