//! BDD scenarios for resumable provisioning.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ResumeContext, resume_context};

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Resume at the driver fix after a staged upgrade"
)]
fn scenario_resume_after_staged_upgrade(resume_context: ResumeContext) {
    let _ = resume_context;
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Restart twice before completing"
)]
fn scenario_restart_twice(resume_context: ResumeContext) {
    let _ = resume_context;
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Retry a failed phase on the next boot"
)]
fn scenario_retry_failed_phase(resume_context: ResumeContext) {
    let _ = resume_context;
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Start over after a completed run"
)]
fn scenario_start_over_after_completion(resume_context: ResumeContext) {
    let _ = resume_context;
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Leave an unknown phase untouched"
)]
fn scenario_unknown_phase_untouched(resume_context: ResumeContext) {
    let _ = resume_context;
}
