use anyhow::Result;
use colored::Colorize;
use sysinfo::System;

use crate::host::is_root;
use crate::ui;

/// Minimum memory for kubeadm plus the platform services.
const MIN_MEMORY_GB: u64 = 4;
/// kubeadm refuses to initialise with fewer CPUs.
const MIN_CPUS: usize = 2;

/// Validates prerequisites for a June installation
pub struct PrerequisitesValidator {
    requirements: Vec<Requirement>,
}

/// One prerequisite.
pub struct Requirement {
    name: String,
    check: Box<dyn Fn() -> bool + Send + Sync>,
    install_instructions: String,
    critical: bool,
}

impl Requirement {
    /// A requirement that blocks installation when unmet.
    pub fn critical(
        name: impl Into<String>,
        instructions: impl Into<String>,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Box::new(check),
            install_instructions: instructions.into(),
            critical: true,
        }
    }

    /// A requirement that only produces a warning.
    pub fn optional(
        name: impl Into<String>,
        instructions: impl Into<String>,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            critical: false,
            ..Self::critical(name, instructions, check)
        }
    }
}

fn on_path(binary: &'static str) -> impl Fn() -> bool + Send + Sync {
    move || which::which(binary).is_ok()
}

impl PrerequisitesValidator {
    /// Host requirements for a bare-metal installation.
    pub fn new() -> Self {
        Self::with_requirements(vec![
            Requirement::critical("root privileges", "Re-run with sudo or as root", is_root),
            Requirement::critical(
                "apt-get",
                "A Debian or Ubuntu host is required",
                on_path("apt-get"),
            ),
            Requirement::critical(
                "systemctl",
                "A systemd-based host is required",
                on_path("systemctl"),
            ),
            Requirement::critical("curl", "Install with: apt-get install -y curl", on_path("curl")),
            Requirement::critical(
                "System Memory",
                format!("At least {MIN_MEMORY_GB}GB of RAM required"),
                || {
                    let mut sys = System::new();
                    sys.refresh_memory();
                    // Usable memory reads slightly below the installed amount.
                    sys.total_memory() / 1024 / 1024 / 1024 >= MIN_MEMORY_GB - 1
                },
            ),
            Requirement::critical(
                "CPU cores",
                format!("At least {MIN_CPUS} CPU cores required by kubeadm"),
                || System::new_all().cpus().len() >= MIN_CPUS,
            ),
            Requirement::optional(
                "nvidia-smi",
                "Only needed with --enable-gpu; install the NVIDIA driver first",
                on_path("nvidia-smi"),
            ),
        ])
    }

    /// Validator over an explicit list of requirements.
    pub fn with_requirements(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    /// Names of unmet requirements, split into (critical, optional).
    pub fn failures(&self) -> (Vec<&str>, Vec<&str>) {
        let mut critical = Vec::new();
        let mut optional = Vec::new();
        for requirement in &self.requirements {
            if !(requirement.check)() {
                if requirement.critical {
                    critical.push(requirement.name.as_str());
                } else {
                    optional.push(requirement.name.as_str());
                }
            }
        }
        (critical, optional)
    }

    pub fn validate(&self) -> Result<()> {
        println!();
        let mut failures = Vec::new();

        for requirement in &self.requirements {
            if (requirement.check)() {
                ui::print_check_result(&requirement.name, true, None);
            } else {
                ui::print_check_result(&requirement.name, false, None);
                failures.push(requirement);
            }
        }

        println!();

        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
        } else {
            ui::print_warning("Some prerequisites are not met:");
            println!();
            for failure in &failures {
                if failure.critical {
                    println!(
                        "  {} {} - {}",
                        "✗".red(),
                        failure.name.red(),
                        failure.install_instructions.bright_black()
                    );
                } else {
                    println!(
                        "  {} {} - {}",
                        "⚠".yellow(),
                        failure.name.yellow(),
                        failure.install_instructions.bright_black()
                    );
                }
            }
            println!();

            if failures.iter().any(|f| f.critical) {
                return Err(anyhow::anyhow!(
                    "Critical prerequisites not met. Please fix them and try again."
                ));
            }
        }

        Ok(())
    }
}

impl Default for PrerequisitesValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_failure_does_not_block() {
        let validator = PrerequisitesValidator::with_requirements(vec![
            Requirement::critical("always", "", || true),
            Requirement::optional("gpu", "", || false),
        ]);
        assert_eq!(validator.failures(), (vec![], vec!["gpu"]));
        assert!(validator.validate().is_ok());
    }

    #[test]
    fn test_critical_failure_blocks() {
        let validator = PrerequisitesValidator::with_requirements(vec![Requirement::critical(
            "root privileges",
            "Re-run with sudo",
            || false,
        )]);
        assert_eq!(validator.failures().0, vec!["root privileges"]);
        assert!(validator.validate().is_err());
    }
}
