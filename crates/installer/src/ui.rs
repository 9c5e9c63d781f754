//! UI helpers for the installer CLI.
//!
//! Provides consistent formatting for console output during installation.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::sequencer::{InstallReport, StepStatus};

/// Print the June banner.
pub fn print_banner() {
    println!();
    println!(
        "{}",
        r"
       _
      | |_   _ _ __   ___
   _  | | | | | '_ \ / _ \
  | |_| | |_| | | | |  __/
   \___/ \__,_|_| |_|\___|
"
        .cyan()
    );
    println!("  {}", "Single-Node Bare Metal Platform".bright_black());
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a progress step with step number.
pub fn print_progress_step(current: usize, total: usize, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print prerequisite check result.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print a list item.
pub fn print_list_item(item: &str) {
    println!("  {} {item}", "•".bright_black());
}

/// Start a spinner for a readiness wait. Hidden when stderr is not a terminal.
#[must_use]
pub fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("  {spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

/// Coloured label for a step status.
#[must_use]
pub fn status_label(status: StepStatus) -> String {
    let label = format!("{:<8}", status.to_string());
    match status {
        StepStatus::Ok => label.green().bold().to_string(),
        StepStatus::Skipped => label.bright_black().to_string(),
        StepStatus::Degraded => label.yellow().bold().to_string(),
        StepStatus::Pending | StepStatus::Running => label.cyan().to_string(),
    }
}

/// Print the per-step summary of a run.
pub fn print_report(report: &InstallReport) {
    print_section("Installation Summary");
    for record in &report.steps {
        let detail = record
            .detail
            .as_deref()
            .map(|d| format!(" {}", d.bright_black()))
            .unwrap_or_default();
        println!(
            "  {} {:<20} {:>7.1}s{detail}",
            status_label(record.status),
            record.name,
            record.elapsed_secs,
        );
    }
    println!();

    if report.is_clean() {
        print_success("All steps completed");
    } else {
        let degraded: Vec<&str> = report.degraded().map(|r| r.name.as_str()).collect();
        print_warning(&format!(
            "{} step(s) degraded: {}. Re-run `june install` once the cause is fixed.",
            degraded.len(),
            degraded.join(", ")
        ));
    }
}
