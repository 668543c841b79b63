//! BDD step definitions for resumable provisioning.

use rebootstrap::test_support::{Operation, ScriptedProvisioner};
use rebootstrap::{Orchestrator, Phase, PhaseCursor, RunOutcome, StatusRecord, StepStatus};
use rstest_bdd_macros::{given, then, when};
use serde_json::Value;

use super::test_helpers::{ResumeContext, record_with_phase};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn parse_phase(name: &str) -> Result<Phase, StepError> {
    Phase::from_name(name.trim())
        .ok_or_else(|| StepError::Setup(format!("unknown phase in feature: {name}")))
}

fn parse_status(name: &str) -> Result<StepStatus, StepError> {
    serde_json::from_value(Value::String(name.trim().to_owned()))
        .map_err(|err| StepError::Setup(format!("unknown step status {name}: {err}")))
}

fn persisted(resume_context: &ResumeContext) -> Result<StatusRecord, StepError> {
    resume_context
        .persisted()
        .ok_or_else(|| StepError::Assertion(String::from("status file is missing or unreadable")))
}

fn expect_outcome(resume_context: &ResumeContext, expected: &RunOutcome) -> Result<(), StepError> {
    match &resume_context.outcome {
        Some(actual) if actual == expected => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {expected:?}, got {other:?}"
        ))),
    }
}

#[given("an empty status directory")]
fn empty_status_directory(resume_context: ResumeContext) -> ResumeContext {
    resume_context
}

#[given("the upgrade stages a new deployment")]
fn upgrade_stages(resume_context: ResumeContext) -> ResumeContext {
    resume_context.provisioner.push_staged_upgrade();
    resume_context
}

#[given("the graphics driver probe fails")]
fn driver_probe_fails(resume_context: ResumeContext) -> ResumeContext {
    resume_context.provisioner.push_unhealthy_driver();
    resume_context
}

#[given("the backup fails with exit status {code:i32}")]
fn backup_fails(resume_context: ResumeContext, code: i32) -> ResumeContext {
    resume_context
        .provisioner
        .push_failure(Operation::Backup, code, "rsync: connection unexpectedly closed");
    resume_context
}

#[given("a status file from a completed run")]
fn completed_status_file(resume_context: ResumeContext) -> Result<ResumeContext, StepError> {
    let report = Orchestrator::new(resume_context.store(), ScriptedProvisioner::new())
        .run_setup()
        .map_err(|err| StepError::Setup(err.to_string()))?;
    if report.outcome != RunOutcome::Complete {
        return Err(StepError::Setup(format!(
            "seed run did not complete: {}",
            report.outcome
        )));
    }
    Ok(resume_context)
}

#[given("a status file whose phase is \"{phase}\"")]
fn status_file_with_phase(
    mut resume_context: ResumeContext,
    phase: String,
) -> Result<ResumeContext, StepError> {
    let contents = record_with_phase(phase.trim());
    let parent = resume_context
        .path
        .parent()
        .ok_or_else(|| StepError::Setup(String::from("status path has no parent")))?;
    std::fs::create_dir_all(parent).map_err(|err| StepError::Setup(err.to_string()))?;
    std::fs::write(&resume_context.path, &contents)
        .map_err(|err| StepError::Setup(err.to_string()))?;
    resume_context.seeded = Some(contents);
    Ok(resume_context)
}

#[when("the machine boots and runs setup")]
fn boot_and_run(mut resume_context: ResumeContext) -> Result<ResumeContext, StepError> {
    let provisioner = std::mem::take(&mut resume_context.provisioner);
    let report = Orchestrator::new(resume_context.store(), provisioner.clone())
        .run_setup()
        .map_err(|err| StepError::Assertion(format!("run_setup failed: {err}")))?;
    resume_context.last_calls = provisioner.calls();
    resume_context.outcome = Some(report.outcome);
    Ok(resume_context)
}

#[then("the run completes")]
fn run_completes(resume_context: &ResumeContext) -> Result<(), StepError> {
    expect_outcome(resume_context, &RunOutcome::Complete)
}

#[then("the run pauses and resumes at \"{phase}\"")]
fn run_pauses(resume_context: &ResumeContext, phase: String) -> Result<(), StepError> {
    let next = PhaseCursor::At(parse_phase(&phase)?);
    expect_outcome(resume_context, &RunOutcome::Paused { next })
}

#[then("the run fails at \"{phase}\"")]
fn run_fails(resume_context: &ResumeContext, phase: String) -> Result<(), StepError> {
    let failed = parse_phase(&phase)?;
    expect_outcome(resume_context, &RunOutcome::Failed { phase: failed })
}

#[then("the run reports the unknown phase \"{phase}\"")]
fn run_reports_anomaly(resume_context: &ResumeContext, phase: String) -> Result<(), StepError> {
    let anomaly = RunOutcome::Anomaly {
        phase: phase.trim().to_owned(),
    };
    expect_outcome(resume_context, &anomaly)
}

#[then("the \"{phase}\" step is \"{status}\"")]
fn step_has_status(
    resume_context: &ResumeContext,
    phase: String,
    status: String,
) -> Result<(), StepError> {
    let step_phase = parse_phase(&phase)?;
    let expected = parse_status(&status)?;
    let record = persisted(resume_context)?;
    let actual = record.step(step_phase).status;
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {step_phase} to be {expected:?}, got {actual:?}"
        )))
    }
}

#[then("the upgrade was not run again")]
fn upgrade_not_rerun(resume_context: &ResumeContext) -> Result<(), StepError> {
    if resume_context.last_calls.contains(&Operation::Upgrade) {
        return Err(StepError::Assertion(format!(
            "upgrade ran again: {:?}",
            resume_context.last_calls
        )));
    }
    Ok(())
}

#[then("only the backup was run")]
fn only_backup_ran(resume_context: &ResumeContext) -> Result<(), StepError> {
    if resume_context.last_calls == [Operation::Backup] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected only the backup, got {:?}",
            resume_context.last_calls
        )))
    }
}

#[then("no collaborator was invoked")]
fn nothing_invoked(resume_context: &ResumeContext) -> Result<(), StepError> {
    if resume_context.last_calls.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected calls: {:?}",
            resume_context.last_calls
        )))
    }
}

#[then("every step has settled")]
fn every_step_settled(resume_context: &ResumeContext) -> Result<(), StepError> {
    let record = persisted(resume_context)?;
    if record.is_complete() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "record is not complete: {record:?}"
        )))
    }
}

#[then("the status file is unchanged")]
fn status_file_unchanged(resume_context: &ResumeContext) -> Result<(), StepError> {
    if resume_context.raw() == resume_context.seeded {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "status file was rewritten",
        )))
    }
}
