//! Phase functions of the provisioning state machine.
//!
//! Each phase mutates its own step and the record's cursor, then tells the
//! orchestrator whether to carry on. A phase that needs a restart marks its
//! step [`StepStatus::DoneNeedsRestart`], moves the cursor to the *next*
//! phase, and pauses, so the next invocation after the reboot resumes there.
//! A failed phase leaves the cursor where it is so the next invocation
//! retries it.

use tracing::{info, warn};

use crate::provision::Provisioner;
use crate::runner::{CommandOutput, RunnerError};
use crate::status::{Phase, StatusRecord, StepStatus};

/// Output fragments printed by `rpm-ostree upgrade` when a new deployment has
/// been staged and only takes effect after a reboot. Lowercase; output is
/// compared case-insensitively.
pub const STAGED_UPGRADE_MARKERS: [&str; 2] = ["systemctl reboot", "staging deployment"];

/// What the orchestrator does after a phase returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Run the phase the cursor now points at.
    Continue,
    /// Stop this run: a restart is required or the phase failed.
    Pause,
}

/// Returns `true` when upgrade output reports a staged deployment.
///
/// `rpm-ostree` has no machine-readable "reboot required" signal on the
/// `upgrade` verb, so this matches its human-readable output.
///
/// # Examples
///
/// ```
/// use rebootstrap::phases::upgrade_staged;
///
/// assert!(upgrade_staged("Run \"systemctl reboot\" to start a reboot"));
/// assert!(!upgrade_staged("No upgrade available."));
/// ```
#[must_use]
pub fn upgrade_staged(output: &str) -> bool {
    let lowered = output.to_ascii_lowercase();
    STAGED_UPGRADE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Runs `phase` against `record`.
///
/// Collaborator faults are recorded as a failed step rather than propagated,
/// so the record always reflects what happened and the phase is retried on the
/// next run.
pub fn run_phase<P: Provisioner>(
    phase: Phase,
    record: &mut StatusRecord,
    provisioner: &P,
    detail_limit: usize,
) -> Transition {
    let ctx = PhaseContext {
        phase,
        detail_limit,
    };
    match phase {
        Phase::Upgrade => upgrade(&ctx, record, provisioner),
        Phase::DriverFix => driver_fix(&ctx, record, provisioner),
        Phase::TokenInit => finish_required(
            &ctx,
            record,
            provisioner.init_hardware_token(),
            "hardware token initialisation",
            "hardware token initialised",
        ),
        Phase::EnvironmentStart => finish_required(
            &ctx,
            record,
            provisioner.start_environment(),
            "environment start",
            "environment started",
        ),
        Phase::Backup => finish_required(
            &ctx,
            record,
            provisioner.run_backup(),
            "backup",
            "backup completed",
        ),
    }
}

struct PhaseContext {
    phase: Phase,
    detail_limit: usize,
}

impl PhaseContext {
    fn proceed(&self, record: &mut StatusRecord, status: StepStatus, detail: &str) -> Transition {
        record.step_mut(self.phase).finish(status, detail);
        record.advance_past(self.phase);
        if status == StepStatus::DoneNeedsRestart {
            info!(phase = %self.phase, next = %record.phase, "restart required before next phase");
            return Transition::Pause;
        }
        Transition::Continue
    }

    fn fail(&self, record: &mut StatusRecord, detail: String) -> Transition {
        warn!(phase = %self.phase, detail = %detail, "phase failed");
        record.step_mut(self.phase).finish(StepStatus::Failed, detail);
        Transition::Pause
    }

    fn fail_output(
        &self,
        record: &mut StatusRecord,
        action: &str,
        output: &CommandOutput,
    ) -> Transition {
        let detail = failure_detail(action, output, self.detail_limit);
        self.fail(record, detail)
    }

    fn fail_spawn(&self, record: &mut StatusRecord, err: &RunnerError) -> Transition {
        self.fail(record, truncate(&err.to_string(), self.detail_limit))
    }
}

fn upgrade<P: Provisioner>(
    ctx: &PhaseContext,
    record: &mut StatusRecord,
    provisioner: &P,
) -> Transition {
    match provisioner.upgrade_system() {
        Err(err) => ctx.fail_spawn(record, &err),
        Ok(output) if !output.is_success() => ctx.fail_output(record, "system upgrade", &output),
        Ok(output) if upgrade_staged(&output.combined()) => ctx.proceed(
            record,
            StepStatus::DoneNeedsRestart,
            "upgrade staged; restart required",
        ),
        Ok(_) => ctx.proceed(record, StepStatus::Skipped, "system already up to date"),
    }
}

fn driver_fix<P: Provisioner>(
    ctx: &PhaseContext,
    record: &mut StatusRecord,
    provisioner: &P,
) -> Transition {
    match provisioner.probe_driver_health() {
        Err(err) => return ctx.fail_spawn(record, &err),
        Ok(true) => return ctx.proceed(record, StepStatus::Skipped, "driver already functional"),
        Ok(false) => {}
    }

    match provisioner.apply_driver_fix() {
        Err(err) => ctx.fail_spawn(record, &err),
        Ok(output) if !output.is_success() => ctx.fail_output(record, "driver fix", &output),
        Ok(_) => ctx.proceed(
            record,
            StepStatus::DoneNeedsRestart,
            "kernel arguments applied; restart required",
        ),
    }
}

fn finish_required(
    ctx: &PhaseContext,
    record: &mut StatusRecord,
    result: Result<CommandOutput, RunnerError>,
    action: &str,
    success_detail: &str,
) -> Transition {
    match result {
        Err(err) => ctx.fail_spawn(record, &err),
        Ok(output) if !output.is_success() => ctx.fail_output(record, action, &output),
        Ok(_) => ctx.proceed(record, StepStatus::Done, success_detail),
    }
}

fn failure_detail(action: &str, output: &CommandOutput, limit: usize) -> String {
    let stderr = output.stderr.trim();
    let reason = if stderr.is_empty() {
        String::from("no error output")
    } else {
        truncate(stderr, limit)
    };
    format!("{action} failed with {}: {reason}", output.status_text())
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", text.get(..cut).unwrap_or(text)),
        None => text.to_owned(),
    }
}
