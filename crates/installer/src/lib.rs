//! June Platform Installer Library.
//!
//! Installs the June platform on a single bare-metal Kubernetes node. The
//! installation is a fixed plan of idempotent steps (see [`stages`]) run by
//! the [`Sequencer`], which skips what is already in place, degrades instead
//! of failing on slow rollouts, and persists derived values in the
//! [`ConfigStore`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use june_installer::{stages, ConfigStore, InstallConfig, Sequencer, StepContext};
//! use june_installer::cluster::KubectlCluster;
//! use june_installer::host::SystemHost;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = InstallConfig::with_defaults(
//!         InstallConfig::default_config_dir(),
//!         InstallConfig::default_certs_dir(),
//!     );
//!     let store = ConfigStore::new(&config.config_dir);
//!     config.merge_store(&store)?;
//!
//!     let disabled = stages::disabled_steps(&config);
//!     let mut ctx = StepContext::new(config, store, Arc::new(KubectlCluster::new(None)), Arc::new(SystemHost));
//!     let report = Sequencer::new(stages::plan()).with_disabled(disabled).run(&mut ctx).await?;
//!     println!("clean: {}", report.is_clean());
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow async functions that don't use await (trait seams are async)
#![allow(clippy::unused_async)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod certs;
pub mod cluster;
pub mod config;
pub mod environment;
pub mod host;
pub mod poll;
pub mod sequencer;
pub mod stages;
pub mod state;
pub mod store;
pub mod tunnel;
pub mod ui;
pub mod validator;

// Re-export commonly used types at the crate root
pub use certs::CertificateBackups;
pub use config::{AcmeEnvironment, InstallConfig};
pub use sequencer::{InstallReport, Sequencer, Step, StepContext, StepStatus};
pub use state::RunState;
pub use store::{Category, ConfigStore};
