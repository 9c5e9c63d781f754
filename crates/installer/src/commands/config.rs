use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use june_installer::store::{is_valid_key, Category, ConfigMap};
use june_installer::ui;

use super::{GlobalArgs, Outcome};

/// Inspect and edit the configuration store
#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show stored values, optionally for one category
    Show {
        /// infrastructure, domain, networking, secrets or stunner
        category: Option<Category>,

        /// Print secret values instead of masking them
        #[arg(long)]
        reveal: bool,
    },

    /// Print one value
    Get {
        category: Category,
        key: String,
    },

    /// Set one or more values
    Set {
        category: Category,

        /// KEY=VALUE pairs
        #[arg(required = true, value_name = "KEY=VALUE")]
        pairs: Vec<String>,
    },

    /// Remove one or more keys
    Unset {
        category: Category,

        #[arg(required = true, value_name = "KEY")]
        keys: Vec<String>,
    },
}

impl ConfigCommand {
    pub fn run(&self, global: &GlobalArgs) -> Result<Outcome> {
        let store = global.store();
        match &self.action {
            ConfigAction::Show { category, reveal } => {
                let categories = category.map_or_else(|| Category::ALL.to_vec(), |c| vec![c]);
                for category in categories {
                    let values = store.load(category)?;
                    println!(
                        "{} {}",
                        category.to_string().cyan().bold(),
                        store.path(category).display().to_string().bright_black()
                    );
                    if values.is_empty() {
                        println!("  {}", "(empty)".bright_black());
                    }
                    for (key, value) in &values {
                        let shown = if category.is_sensitive() && !reveal {
                            mask(value)
                        } else {
                            value.clone()
                        };
                        ui::print_kv(key, &shown);
                    }
                    println!();
                }
            }
            ConfigAction::Get { category, key } => {
                let value = store
                    .get(*category, key)?
                    .with_context(|| format!("{key} is not set in {category}"))?;
                println!("{value}");
            }
            ConfigAction::Set { category, pairs } => {
                let values = parse_pairs(pairs)?;
                store.save(*category, &values)?;
                ui::print_success(&format!("Updated {} key(s) in {category}", values.len()));
            }
            ConfigAction::Unset { category, keys } => {
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                store.remove(*category, &keys)?;
                ui::print_success(&format!("Removed {} key(s) from {category}", keys.len()));
            }
        }
        Ok(Outcome::Clean)
    }
}

fn parse_pairs(pairs: &[String]) -> Result<ConfigMap> {
    let mut values = ConfigMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{pair}'"))?;
        let key = key.trim();
        if !is_valid_key(key) {
            anyhow::bail!("Invalid config key '{key}'");
        }
        values.insert(key.to_string(), value.to_string());
    }
    Ok(values)
}

fn mask(value: &str) -> String {
    if value.chars().count() <= 4 {
        "****".to_string()
    } else {
        let tail: String = value.chars().skip(value.chars().count() - 4).collect();
        format!("****{tail}")
    }
}
