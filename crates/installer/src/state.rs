//! Run state persistence.
//!
//! The sequencer writes `install-state.json` after every step, so an
//! interrupted or aborted run leaves an accurate record that `june status`
//! can show.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::sequencer::{InstallReport, StepRecord, StepStatus};

/// Record of the most recent installation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// When the run started (RFC 3339).
    pub started_at: String,
    /// Last time the state was written (RFC 3339).
    pub updated_at: String,
    /// Whether every step was visited.
    #[serde(default)]
    pub completed: bool,
    /// Step whose precondition check aborted the run.
    #[serde(default)]
    pub aborted_at: Option<String>,
    /// Abort reason.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Per-step results, in plan order.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    /// Start a new run record.
    #[must_use]
    pub fn new() -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            started_at: now.clone(),
            updated_at: now,
            completed: false,
            aborted_at: None,
            last_error: None,
            steps: Vec::new(),
        }
    }

    /// Load state from file if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        let state: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", path.display()))?;
        debug!(steps = state.steps.len(), completed = state.completed, "Loaded run state");
        Ok(Some(state))
    }

    /// Save state to file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        let mut state = self.clone();
        state.updated_at = chrono::Utc::now().to_rfc3339();

        let content = serde_json::to_string_pretty(&state).context("Failed to serialize state")?;
        let mut tmp = NamedTempFile::new_in(parent).context("Failed to create state file")?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write state file")?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Record a finished step, replacing an earlier record of the same name.
    pub fn record(&mut self, record: StepRecord) {
        if let Some(existing) = self.steps.iter_mut().find(|r| r.name == record.name) {
            *existing = record;
        } else {
            self.steps.push(record);
        }
    }

    /// Mark the run as aborted at `step`.
    pub fn abort(&mut self, step: &str, error: &str) {
        self.aborted_at = Some(step.to_string());
        self.last_error = Some(error.to_string());
    }

    /// Mark the run as having visited every step.
    pub fn complete(&mut self) {
        self.completed = true;
    }

    /// Steps left degraded by the last run.
    pub fn degraded(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|r| r.status == StepStatus::Degraded)
    }

    /// The recorded steps as a report.
    #[must_use]
    pub fn report(&self) -> InstallReport {
        InstallReport {
            steps: self.steps.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, status: StepStatus) -> StepRecord {
        StepRecord {
            name: name.into(),
            status,
            detail: None,
            elapsed_secs: 1.5,
        }
    }

    #[test]
    fn test_missing_state_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(RunState::load(&dir.path().join("install-state.json")).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("install-state.json");

        let mut state = RunState::new();
        state.record(record("helm", StepStatus::Skipped));
        state.record(record("metallb", StepStatus::Degraded));
        state.complete();
        state.save(&path).unwrap();

        let loaded = RunState::load(&path).unwrap().unwrap();
        assert!(loaded.completed);
        assert_eq!(loaded.steps, state.steps);
        assert_eq!(loaded.degraded().count(), 1);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"DEGRADED\""));
    }

    #[test]
    fn test_save_replaces_file_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("install-state.json");

        let mut state = RunState::new();
        state.record(record("helm", StepStatus::Ok));
        state.save(&path).unwrap();
        state.abort("metallb", "cluster unreachable");
        state.save(&path).unwrap();

        let loaded = RunState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.aborted_at.as_deref(), Some("metallb"));
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("install-state.json")]);
    }

    #[test]
    fn test_record_replaces_same_step() {
        let mut state = RunState::new();
        state.record(record("metallb", StepStatus::Degraded));
        state.record(record("metallb", StepStatus::Ok));
        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.steps[0].status, StepStatus::Ok);
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("install-state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(RunState::load(&path).is_err());
    }
}
