//! Shared fixtures for the resumable provisioning scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rebootstrap::test_support::{Operation, ScriptedProvisioner};
use rebootstrap::{FileStatusStore, RunOutcome, StatusRecord};
use rstest::fixture;
use tempfile::TempDir;

/// State carried between steps. Each simulated boot gets a fresh
/// provisioner; only the status file survives.
#[derive(Clone, Debug)]
pub struct ResumeContext {
    pub path: Utf8PathBuf,
    pub provisioner: ScriptedProvisioner,
    pub last_calls: Vec<Operation>,
    pub outcome: Option<RunOutcome>,
    pub seeded: Option<String>,
    _tmp: Arc<TempDir>,
}

impl ResumeContext {
    pub fn store(&self) -> FileStatusStore {
        FileStatusStore::new(self.path.clone())
    }

    pub fn persisted(&self) -> Option<StatusRecord> {
        self.store().try_load().ok().flatten()
    }

    pub fn raw(&self) -> Option<String> {
        std::fs::read_to_string(&self.path).ok()
    }
}

#[fixture]
pub fn resume_context() -> ResumeContext {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("state").join("status.json"))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
    ResumeContext {
        path,
        provisioner: ScriptedProvisioner::new(),
        last_calls: Vec::new(),
        outcome: None,
        seeded: None,
        _tmp: Arc::new(tmp),
    }
}

pub fn record_with_phase(phase: &str) -> String {
    format!(
        r#"{{
  "phase": "{phase}",
  "started": "2026-03-01T08:00:00Z",
  "updated": "2026-03-01T08:05:00Z",
  "steps": {{
    "upgrade": {{"status": "skipped", "detail": ""}},
    "driver-fix": {{"status": "skipped", "detail": ""}},
    "token-init": {{"status": "pending", "detail": ""}},
    "environment-start": {{"status": "pending", "detail": ""}},
    "backup": {{"status": "pending", "detail": ""}}
  }}
}}"#
    )
}
