//! Installation sequencer.
//!
//! Runs an ordered list of [`Step`]s. For every step the sequencer:
//!
//! 1. skips it when the operator disabled it;
//! 2. skips it when its end state already holds;
//! 3. otherwise applies it, waits for readiness with a bounded timeout, and
//!    persists the configuration values the step derived.
//!
//! Only a failing precondition check aborts the run. Action failures and
//! readiness timeouts mark the step `DEGRADED` and the run continues, so one
//! slow rollout never blocks the rest of the platform.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::config::InstallConfig;
use crate::host::Host;
use crate::poll::{wait_until, WaitOutcome, WaitPolicy};
use crate::state::RunState;
use crate::store::{Category, ConfigMap, ConfigStore};
use crate::ui;

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Ok,
    Skipped,
    Degraded,
}

impl StepStatus {
    /// Whether the step has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Skipped | Self::Degraded)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Skipped | Self::Running) | (Self::Running, Self::Ok | Self::Degraded)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Ok => "OK",
            Self::Skipped => "SKIPPED",
            Self::Degraded => "DEGRADED",
        };
        f.write_str(s)
    }
}

/// Errors that stop a run.
#[derive(Error, Debug)]
pub enum SequenceError {
    /// A precondition check failed; nothing after this step ran.
    #[error("Installation aborted at step '{step}': {source:#}")]
    Aborted {
        step: String,
        #[source]
        source: anyhow::Error,
        /// Steps completed before the abort.
        report: InstallReport,
    },

    /// A step was driven through an impossible state change.
    #[error("Step '{step}' cannot move from {from} to {to}")]
    IllegalTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step identifier.
    pub name: String,
    /// Current status.
    pub status: StepStatus,
    /// Why the step was skipped or degraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Wall-clock time spent on the step.
    #[serde(default)]
    pub elapsed_secs: f64,
}

impl StepRecord {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            detail: None,
            elapsed_secs: 0.0,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::IllegalTransition`] for an invalid move.
    pub fn transition(&mut self, next: StepStatus) -> Result<(), SequenceError> {
        if !self.status.can_transition_to(next) {
            return Err(SequenceError::IllegalTransition {
                step: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Ordered outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallReport {
    /// One record per step, in plan order.
    pub steps: Vec<StepRecord>,
}

impl InstallReport {
    /// True when no step is degraded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.degraded().next().is_none()
    }

    /// Degraded steps.
    pub fn degraded(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|r| r.status == StepStatus::Degraded)
    }

    /// Status of a step by name.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.steps.iter().find(|r| r.name == name).map(|r| r.status)
    }
}

/// Configuration values produced by a step, grouped by store category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedConfig {
    entries: BTreeMap<Category, ConfigMap>,
}

impl DerivedConfig {
    /// Empty set of derived values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value.
    #[must_use]
    pub fn with(mut self, category: Category, key: &str, value: impl Into<String>) -> Self {
        self.entries
            .entry(category)
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    /// Merge another set of values into this one.
    pub fn extend(&mut self, other: Self) {
        for (category, values) in other.entries {
            self.entries.entry(category).or_default().extend(values);
        }
    }

    /// Whether nothing was derived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(ConfigMap::is_empty)
    }

    /// Values per category.
    pub fn iter(&self) -> impl Iterator<Item = (Category, &ConfigMap)> {
        self.entries.iter().map(|(c, m)| (*c, m))
    }
}

/// Everything a step may touch.
#[derive(Clone)]
pub struct StepContext {
    /// Resolved configuration for this run.
    pub config: InstallConfig,
    /// Persistent configuration store.
    pub store: ConfigStore,
    /// Target cluster.
    pub cluster: Arc<dyn Cluster>,
    /// Local machine.
    pub host: Arc<dyn Host>,
}

impl StepContext {
    /// Create a context.
    #[must_use]
    pub fn new(
        config: InstallConfig,
        store: ConfigStore,
        cluster: Arc<dyn Cluster>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            config,
            store,
            cluster,
            host,
        }
    }
}

/// One installation phase.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable identifier, used by `--skip` and in reports.
    fn name(&self) -> &'static str;

    /// Human-readable description for progress output.
    fn description(&self) -> String {
        self.name().to_string()
    }

    /// Whether the step's end state already holds.
    ///
    /// An `Err` means the installation cannot continue at all.
    async fn is_satisfied(&self, ctx: &StepContext) -> Result<bool>;

    /// Perform the step, returning configuration values to persist.
    async fn apply(&self, ctx: &StepContext) -> Result<DerivedConfig>;

    /// Readiness wait after `apply`. `None` means no wait.
    fn wait_policy(&self, _ctx: &StepContext) -> Option<WaitPolicy> {
        None
    }

    /// One readiness check.
    async fn poll_ready(&self, _ctx: &StepContext) -> Result<bool> {
        Ok(true)
    }

    /// Work that needs the step to be ready, run after a successful wait.
    async fn after_ready(&self, _ctx: &StepContext) -> Result<DerivedConfig> {
        Ok(DerivedConfig::new())
    }
}

/// What a run would do, without doing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    /// Step identifier.
    pub name: String,
    /// Step description.
    pub description: String,
    /// `Skipped` or `Pending` (would run).
    pub status: StepStatus,
    /// Why the step would be skipped.
    pub detail: Option<String>,
}

/// Runs steps in order.
pub struct Sequencer {
    steps: Vec<Box<dyn Step>>,
    disabled: BTreeSet<String>,
    state_file: Option<PathBuf>,
    show_progress: bool,
}

impl Sequencer {
    /// Create a sequencer over `steps`.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            disabled: BTreeSet::new(),
            state_file: None,
            show_progress: false,
        }
    }

    /// Disable steps by name.
    #[must_use]
    pub fn with_disabled<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled.extend(names.into_iter().map(Into::into));
        self
    }

    /// Write the run state to `path` after every step.
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Print progress lines and spinners.
    #[must_use]
    pub const fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Step names in plan order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Evaluate skips and preconditions without applying anything.
    ///
    /// A failing precondition does not stop planning: on a fresh host the
    /// cluster steps cannot be checked until earlier steps have run, so they
    /// are listed as pending with the check error as detail.
    pub async fn plan(&self, ctx: &StepContext) -> Vec<PlannedStep> {
        let mut planned = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let (status, detail) = if self.disabled.contains(step.name()) {
                (StepStatus::Skipped, Some("disabled by configuration".to_string()))
            } else {
                match step.is_satisfied(ctx).await {
                    Ok(true) => (StepStatus::Skipped, Some("already satisfied".to_string())),
                    Ok(false) => (StepStatus::Pending, None),
                    Err(e) => {
                        debug!(step = step.name(), error = %e, "Precondition check failed during planning");
                        (StepStatus::Pending, Some(format!("precondition check failed: {e}")))
                    }
                }
            };
            planned.push(PlannedStep {
                name: step.name().to_string(),
                description: step.description(),
                status,
                detail,
            });
        }
        planned
    }

    /// Run every step.
    ///
    /// Derived values are written to the store and merged back into
    /// `ctx.config` so later steps see them.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::Aborted`] when a precondition check fails.
    pub async fn run(&self, ctx: &mut StepContext) -> Result<InstallReport, SequenceError> {
        let mut report = InstallReport::default();
        let mut state = RunState::new();
        let total = self.steps.len();

        for (index, step) in self.steps.iter().enumerate() {
            let name = step.name();
            let started = Instant::now();
            let mut record = StepRecord::pending(name);

            if self.show_progress {
                ui::print_progress_step(index + 1, total, &step.description());
            }

            if self.disabled.contains(name) {
                info!(step = name, "Step disabled by configuration");
                record.transition(StepStatus::Skipped)?;
                record.detail = Some("disabled by configuration".into());
                self.finish(&mut report, &mut state, record, started);
                continue;
            }

            match step.is_satisfied(ctx).await {
                Ok(true) => {
                    info!(step = name, "Already satisfied, skipping");
                    record.transition(StepStatus::Skipped)?;
                    record.detail = Some("already satisfied".into());
                    self.finish(&mut report, &mut state, record, started);
                    continue;
                }
                Ok(false) => {}
                Err(source) => {
                    error!(step = name, error = %format!("{source:#}"), "Precondition check failed");
                    state.abort(name, &format!("{source:#}"));
                    self.save_state(&state);
                    return Err(SequenceError::Aborted {
                        step: name.to_string(),
                        source,
                        report,
                    });
                }
            }

            record.transition(StepStatus::Running)?;
            info!(step = name, "Running step");

            let (outcome, derived) = self.execute(step.as_ref(), ctx).await;
            let persisted = self.persist(name, &derived, ctx);
            let (status, detail) = match (outcome, persisted) {
                (Ok(()), Ok(())) => (StepStatus::Ok, None),
                (Err(detail), _) | (Ok(()), Err(detail)) => (StepStatus::Degraded, Some(detail)),
            };

            record.transition(status)?;
            record.detail = detail;
            self.finish(&mut report, &mut state, record, started);
        }

        state.complete();
        self.save_state(&state);
        Ok(report)
    }

    /// Apply, wait, and run post-ready work.
    ///
    /// Returns the outcome (`Err` carries the degraded detail) together with
    /// the values derived so far, which are persisted either way.
    async fn execute(&self, step: &dyn Step, ctx: &StepContext) -> (Result<(), String>, DerivedConfig) {
        let name = step.name();
        let mut derived = match step.apply(ctx).await {
            Ok(derived) => derived,
            Err(e) => {
                warn!(step = name, error = %format!("{e:#}"), "Step action failed");
                return (Err(format!("{e:#}")), DerivedConfig::new());
            }
        };

        let Some(policy) = step.wait_policy(ctx) else {
            return (Ok(()), derived);
        };

        let spinner = self
            .show_progress
            .then(|| ui::spinner(&format!("Waiting for {name} to become ready")));
        let outcome = wait_until(policy, || step.poll_ready(ctx)).await;
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }

        match outcome {
            WaitOutcome::Ready { attempts, elapsed } => {
                debug!(step = name, attempts, elapsed_secs = elapsed.as_secs(), "Step ready");
            }
            WaitOutcome::TimedOut { elapsed, .. } => {
                warn!(
                    step = name,
                    timeout_secs = policy.timeout.as_secs(),
                    "Timed out waiting for readiness"
                );
                return (Err(format!("not ready after {}s", elapsed.as_secs())), derived);
            }
        }

        match step.after_ready(ctx).await {
            Ok(extra) => {
                derived.extend(extra);
                (Ok(()), derived)
            }
            Err(e) => {
                warn!(step = name, error = %format!("{e:#}"), "Post-ready work failed");
                (Err(format!("{e:#}")), derived)
            }
        }
    }

    /// Persist derived values and fold them back into the run's config.
    fn persist(&self, name: &str, derived: &DerivedConfig, ctx: &mut StepContext) -> Result<(), String> {
        if derived.is_empty() {
            return Ok(());
        }
        let mut failures = Vec::new();
        for (category, values) in derived.iter() {
            match ctx.store.save(category, values) {
                Ok(_) => {
                    debug!(step = name, %category, keys = ?values.keys().collect::<Vec<_>>(), "Persisted derived configuration");
                }
                Err(e) => {
                    warn!(step = name, %category, error = %e, "Failed to persist derived configuration");
                    failures.push(format!("{category}: {e}"));
                }
            }
        }
        ctx.config
            .merge_store(&ctx.store)
            .map_err(|e| format!("failed to reload configuration: {e}"))?;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(format!("failed to persist configuration: {}", failures.join("; ")))
        }
    }

    fn finish(&self, report: &mut InstallReport, state: &mut RunState, mut record: StepRecord, started: Instant) {
        record.elapsed_secs = started.elapsed().as_secs_f64();

        if self.show_progress {
            match record.status {
                StepStatus::Ok => ui::print_success(&format!("{} ready", record.name)),
                StepStatus::Skipped => ui::print_info(&format!(
                    "{} skipped ({})",
                    record.name,
                    record.detail.as_deref().unwrap_or_default()
                )),
                StepStatus::Degraded => ui::print_warning(&format!(
                    "{} degraded: {}",
                    record.name,
                    record.detail.as_deref().unwrap_or_default()
                )),
                StepStatus::Pending | StepStatus::Running => {}
            }
        }

        state.record(record.clone());
        self.save_state(state);
        report.steps.push(record);
    }

    fn save_state(&self, state: &RunState) {
        if let Some(ref path) = self.state_file {
            if let Err(e) = state.save(path) {
                warn!(path = %path.display(), error = %format!("{e:#}"), "Failed to write run state");
            }
        }
    }
}
