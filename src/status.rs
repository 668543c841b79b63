//! Persisted provisioning status.
//!
//! A [`StatusRecord`] holds the phase cursor (the next phase to execute, or the
//! terminal sentinel) together with one [`StepResult`] per provisioning step.
//! The step set is fixed at compile time so a record can never gain or lose a
//! step through a malformed file.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cursor value stored once every phase has run.
pub const COMPLETE: &str = "complete";

/// Provisioning phases, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Operating system upgrade.
    Upgrade,
    /// Graphics driver kernel-argument fix.
    DriverFix,
    /// Smartcard service restart and hardware token detection.
    TokenInit,
    /// Container environment start.
    EnvironmentStart,
    /// User data backup.
    Backup,
}

impl Phase {
    /// Every phase in execution order.
    pub const ALL: [Self; 5] = [
        Self::Upgrade,
        Self::DriverFix,
        Self::TokenInit,
        Self::EnvironmentStart,
        Self::Backup,
    ];

    /// Phase a fresh record starts from.
    pub const FIRST: Self = Self::Upgrade;

    /// Returns the persisted name of the phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::DriverFix => "driver-fix",
            Self::TokenInit => "token-init",
            Self::EnvironmentStart => "environment-start",
            Self::Backup => "backup",
        }
    }

    /// Returns the cursor that follows this phase.
    #[must_use]
    pub const fn next(self) -> PhaseCursor {
        match self {
            Self::Upgrade => PhaseCursor::At(Self::DriverFix),
            Self::DriverFix => PhaseCursor::At(Self::TokenInit),
            Self::TokenInit => PhaseCursor::At(Self::EnvironmentStart),
            Self::EnvironmentStart => PhaseCursor::At(Self::Backup),
            Self::Backup => PhaseCursor::Complete,
        }
    }

    /// Looks up a phase by its persisted name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| phase.as_str() == name)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a run within the phase sequence.
///
/// Unknown names are kept verbatim rather than rejected at load time so the
/// orchestrator can surface them as an anomaly instead of the store quietly
/// replacing the record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PhaseCursor {
    /// The named phase runs next.
    At(Phase),
    /// Every phase has run.
    Complete,
    /// A name matching neither a phase nor the terminal sentinel.
    Unknown(String),
}

impl PhaseCursor {
    /// Returns the cursor value as persisted.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::At(phase) => phase.as_str(),
            Self::Complete => COMPLETE,
            Self::Unknown(name) => name,
        }
    }
}

impl From<String> for PhaseCursor {
    fn from(value: String) -> Self {
        if value == COMPLETE {
            return Self::Complete;
        }
        Phase::from_name(&value).map_or(Self::Unknown(value), Self::At)
    }
}

impl From<PhaseCursor> for String {
    fn from(value: PhaseCursor) -> Self {
        match value {
            PhaseCursor::Unknown(name) => name,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for PhaseCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not attempted yet.
    #[default]
    Pending,
    /// External work is in progress.
    Running,
    /// Work was performed.
    Done,
    /// Work was performed and the machine must restart before the next phase.
    DoneNeedsRestart,
    /// Nothing to do; the goal was already satisfied.
    Skipped,
    /// The external command failed; the phase will be retried on the next run.
    Failed,
}

impl StepStatus {
    /// Returns `true` for the two outcomes allowed in a completed record.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

/// Outcome of one step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepResult {
    /// Current status.
    pub status: StepStatus,
    /// Human-readable note about the outcome; empty until set.
    #[serde(default)]
    pub detail: String,
}

impl StepResult {
    /// Marks the step as running and clears any detail left by a failed
    /// attempt.
    pub fn begin(&mut self) {
        self.status = StepStatus::Running;
        self.detail.clear();
    }

    /// Records the final status of the step.
    pub fn finish(&mut self, status: StepStatus, detail: impl Into<String>) {
        self.status = status;
        self.detail = detail.into();
    }
}

/// The fixed set of provisioning steps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Steps {
    /// Result of [`Phase::Upgrade`].
    pub upgrade: StepResult,
    /// Result of [`Phase::DriverFix`].
    pub driver_fix: StepResult,
    /// Result of [`Phase::TokenInit`].
    pub token_init: StepResult,
    /// Result of [`Phase::EnvironmentStart`].
    pub environment_start: StepResult,
    /// Result of [`Phase::Backup`].
    pub backup: StepResult,
}

impl Steps {
    /// Returns the result slot for `phase`.
    #[must_use]
    pub const fn get(&self, phase: Phase) -> &StepResult {
        match phase {
            Phase::Upgrade => &self.upgrade,
            Phase::DriverFix => &self.driver_fix,
            Phase::TokenInit => &self.token_init,
            Phase::EnvironmentStart => &self.environment_start,
            Phase::Backup => &self.backup,
        }
    }

    /// Returns the mutable result slot for `phase`.
    pub const fn get_mut(&mut self, phase: Phase) -> &mut StepResult {
        match phase {
            Phase::Upgrade => &mut self.upgrade,
            Phase::DriverFix => &mut self.driver_fix,
            Phase::TokenInit => &mut self.token_init,
            Phase::EnvironmentStart => &mut self.environment_start,
            Phase::Backup => &mut self.backup,
        }
    }

    /// Iterates over the steps in phase order.
    pub fn iter(&self) -> impl Iterator<Item = (Phase, &StepResult)> {
        Phase::ALL.into_iter().map(|phase| (phase, self.get(phase)))
    }
}

/// The single persisted provisioning record for this machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusRecord {
    /// Next phase to execute, or the terminal sentinel.
    pub phase: PhaseCursor,
    /// When the record was created.
    pub started: DateTime<Utc>,
    /// When the record was last saved.
    pub updated: DateTime<Utc>,
    /// Per-step results.
    pub steps: Steps,
}

impl StatusRecord {
    /// Builds a fresh record pointing at the first phase.
    #[must_use]
    pub fn fresh() -> Self {
        Self::fresh_at(Utc::now())
    }

    /// Builds a fresh record stamped with `now`.
    #[must_use]
    pub fn fresh_at(now: DateTime<Utc>) -> Self {
        Self {
            phase: PhaseCursor::At(Phase::FIRST),
            started: now,
            updated: now,
            steps: Steps::default(),
        }
    }

    /// Returns the result for `phase`.
    #[must_use]
    pub const fn step(&self, phase: Phase) -> &StepResult {
        self.steps.get(phase)
    }

    /// Returns the mutable result for `phase`.
    pub const fn step_mut(&mut self, phase: Phase) -> &mut StepResult {
        self.steps.get_mut(phase)
    }

    /// Moves the cursor past `phase`.
    pub fn advance_past(&mut self, phase: Phase) {
        self.phase = phase.next();
    }

    /// Returns `true` when the cursor is terminal and every step settled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == PhaseCursor::Complete
            && self.steps.iter().all(|(_, step)| step.status.is_settled())
    }

    /// Settles steps that were waiting for a restart as [`StepStatus::Done`]
    /// and returns their phases.
    ///
    /// A resumed run is the restart those steps asked for, so a completed
    /// record only ever holds `done` or `skipped` steps.
    pub fn settle_restarts(&mut self) -> Vec<Phase> {
        let mut settled = Vec::new();
        for phase in Phase::ALL {
            let step = self.step_mut(phase);
            if step.status == StepStatus::DoneNeedsRestart {
                step.status = StepStatus::Done;
                settled.push(phase);
            }
        }
        settled
    }

    /// Stamps `updated`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated {
            self.updated = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    #[rstest]
    #[case(Phase::Upgrade, PhaseCursor::At(Phase::DriverFix))]
    #[case(Phase::DriverFix, PhaseCursor::At(Phase::TokenInit))]
    #[case(Phase::TokenInit, PhaseCursor::At(Phase::EnvironmentStart))]
    #[case(Phase::EnvironmentStart, PhaseCursor::At(Phase::Backup))]
    #[case(Phase::Backup, PhaseCursor::Complete)]
    fn next_follows_execution_order(#[case] phase: Phase, #[case] expected: PhaseCursor) {
        assert_eq!(phase.next(), expected);
    }

    #[rstest]
    #[case("upgrade", PhaseCursor::At(Phase::Upgrade))]
    #[case("environment-start", PhaseCursor::At(Phase::EnvironmentStart))]
    #[case("complete", PhaseCursor::Complete)]
    #[case("reboot", PhaseCursor::Unknown(String::from("reboot")))]
    #[case("", PhaseCursor::Unknown(String::new()))]
    fn cursor_parses_persisted_names(#[case] name: &str, #[case] expected: PhaseCursor) {
        assert_eq!(PhaseCursor::from(name.to_owned()), expected);
    }

    #[test]
    fn unknown_cursor_round_trips_verbatim() {
        let cursor = PhaseCursor::Unknown(String::from("Driver-Fix"));
        assert_eq!(String::from(cursor), "Driver-Fix");
    }

    #[test]
    fn fresh_record_has_every_step_pending() {
        let record = StatusRecord::fresh();

        assert_eq!(record.phase, PhaseCursor::At(Phase::Upgrade));
        assert_eq!(record.started, record.updated);
        assert!(
            record
                .steps
                .iter()
                .all(|(_, step)| step.status == StepStatus::Pending && step.detail.is_empty())
        );
    }

    #[test]
    fn record_serialises_with_kebab_case_step_keys() {
        let record = StatusRecord::fresh();
        let value = serde_json::to_value(&record).expect("serialise record");

        assert_eq!(value["phase"], "upgrade");
        for phase in Phase::ALL {
            assert_eq!(value["steps"][phase.as_str()]["status"], "pending");
        }
    }

    #[test]
    fn done_needs_restart_uses_snake_case() {
        let value = serde_json::to_value(StepStatus::DoneNeedsRestart).expect("serialise");
        assert_eq!(value, "done_needs_restart");
    }

    #[test]
    fn steps_reject_unrecognised_keys() {
        let raw = r#"{
            "upgrade": {"status": "pending", "detail": ""},
            "driver-fix": {"status": "pending", "detail": ""},
            "token-init": {"status": "pending", "detail": ""},
            "environment-start": {"status": "pending", "detail": ""},
            "backup": {"status": "pending", "detail": ""},
            "kleopatra": {"status": "pending", "detail": ""}
        }"#;

        assert!(serde_json::from_str::<Steps>(raw).is_err());
    }

    #[test]
    fn is_complete_requires_settled_steps() {
        let mut record = StatusRecord::fresh();
        record.phase = PhaseCursor::Complete;
        assert!(!record.is_complete());

        for phase in Phase::ALL {
            record.step_mut(phase).finish(StepStatus::Done, "");
        }
        record.step_mut(Phase::Upgrade).finish(StepStatus::Skipped, "");
        assert!(record.is_complete());
    }

    #[test]
    fn touch_never_moves_updated_backwards() {
        let mut record = StatusRecord::fresh();
        let first_stamp = record.updated;

        record.touch(first_stamp - Duration::seconds(30));
        assert_eq!(record.updated, first_stamp);

        record.touch(first_stamp + Duration::seconds(30));
        assert_eq!(record.updated, first_stamp + Duration::seconds(30));
    }

    #[test]
    fn settle_restarts_promotes_only_restart_steps() {
        let mut record = StatusRecord::fresh();
        record
            .step_mut(Phase::Upgrade)
            .finish(StepStatus::DoneNeedsRestart, "upgrade staged");
        record.step_mut(Phase::DriverFix).finish(StepStatus::Skipped, "");

        let settled = record.settle_restarts();

        assert_eq!(settled, vec![Phase::Upgrade]);
        let upgrade = record.step(Phase::Upgrade);
        assert_eq!(upgrade.status, StepStatus::Done);
        assert_eq!(upgrade.detail, "upgrade staged");
        assert_eq!(record.step(Phase::DriverFix).status, StepStatus::Skipped);
        assert!(record.settle_restarts().is_empty());
    }

    #[test]
    fn begin_clears_previous_failure_detail() {
        let mut step = StepResult::default();
        step.finish(StepStatus::Failed, "exit status 1");

        step.begin();

        assert_eq!(step.status, StepStatus::Running);
        assert!(step.detail.is_empty());
    }
}
