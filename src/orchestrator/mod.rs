//! Drives the provisioning phases from the persisted cursor.
//!
//! A run loads the status record, starts over when the previous run
//! completed, then executes phases in order until one pauses or the cursor
//! becomes terminal. The record is saved before each phase starts its
//! external work and again after the phase returns, so a process killed by a
//! reboot resumes from the last recorded decision.

use std::fmt;

use thiserror::Error;
use tracing::{error, info, info_span};

use crate::phases::{Transition, run_phase};
use crate::provision::{Action, Provisioner};
use crate::runner::{CommandOutput, RunnerError};
use crate::status::{Phase, PhaseCursor, StatusRecord, StepStatus};
use crate::store::{StatusStore, StoreError};

/// Default number of stderr characters kept in a failed step's detail.
pub const DEFAULT_DETAIL_LIMIT: usize = 500;

/// Errors surfaced by an orchestrator run.
///
/// Phase failures are not errors: they are recorded on the step and reported
/// through [`RunOutcome::Failed`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Raised when the record cannot be checkpointed.
    #[error("failed to checkpoint status: {0}")]
    Store(#[from] StoreError),
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every phase has run.
    Complete,
    /// A phase needs a restart; the next run starts at `next`.
    Paused {
        /// Phase the cursor now points at.
        next: PhaseCursor,
    },
    /// A phase failed; the next run retries it.
    Failed {
        /// Phase that failed.
        phase: Phase,
    },
    /// The persisted cursor names no known phase. Nothing was executed.
    Anomaly {
        /// Cursor value as persisted.
        phase: String,
    },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("provisioning complete"),
            Self::Paused { next } => write!(f, "restart required; next run resumes at {next}"),
            Self::Failed { phase } => write!(f, "phase {phase} failed; next run retries it"),
            Self::Anomaly { phase } => {
                write!(f, "status names unknown phase {phase:?}; inspect or reset the record")
            }
        }
    }
}

/// Result of [`Orchestrator::run_setup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    /// Record as last persisted.
    pub record: StatusRecord,
    /// How the run ended.
    pub outcome: RunOutcome,
}

/// Executes the phase sequence against a store and a provisioner.
#[derive(Debug)]
pub struct Orchestrator<S, P> {
    store: S,
    provisioner: P,
    detail_limit: usize,
}

impl<S, P> Orchestrator<S, P>
where
    S: StatusStore,
    P: Provisioner,
{
    /// Creates an orchestrator with the default detail limit.
    #[must_use]
    pub const fn new(store: S, provisioner: P) -> Self {
        Self {
            store,
            provisioner,
            detail_limit: DEFAULT_DETAIL_LIMIT,
        }
    }

    /// Overrides how many stderr characters a failed step keeps.
    #[must_use]
    pub const fn with_detail_limit(mut self, limit: usize) -> Self {
        self.detail_limit = limit;
        self
    }

    /// Runs phases from the persisted cursor until a pause, a failure, or
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] when a checkpoint cannot be
    /// written. The run stops at that point because a later phase must never
    /// run ahead of the persisted record.
    pub fn run_setup(&self) -> Result<RunReport, OrchestratorError> {
        let mut record = self.store.load();
        if record.phase == PhaseCursor::Complete {
            info!("previous run completed; starting a fresh record");
            record = StatusRecord::fresh();
            self.store.save(&mut record)?;
        }
        if matches!(record.phase, PhaseCursor::At(_)) {
            for phase in record.settle_restarts() {
                info!(phase = %phase, "resumed after restart");
            }
        }

        loop {
            let phase = match &record.phase {
                PhaseCursor::At(phase) => *phase,
                PhaseCursor::Complete => {
                    info!("all phases finished");
                    return Ok(RunReport {
                        record,
                        outcome: RunOutcome::Complete,
                    });
                }
                PhaseCursor::Unknown(name) => {
                    error!(phase = %name, "status names an unknown phase; refusing to guess");
                    let phase = name.clone();
                    return Ok(RunReport {
                        record,
                        outcome: RunOutcome::Anomaly { phase },
                    });
                }
            };

            if self.execute(phase, &mut record)? == Transition::Pause {
                let outcome = if record.step(phase).status == StepStatus::Failed {
                    RunOutcome::Failed { phase }
                } else {
                    RunOutcome::Paused {
                        next: record.phase.clone(),
                    }
                };
                return Ok(RunReport { record, outcome });
            }
        }
    }

    fn execute(
        &self,
        phase: Phase,
        record: &mut StatusRecord,
    ) -> Result<Transition, OrchestratorError> {
        let span = info_span!("phase", name = %phase);
        let _entered = span.enter();

        record.step_mut(phase).begin();
        self.store.save(record)?;
        info!("phase started");

        let transition = run_phase(phase, record, &self.provisioner, self.detail_limit);
        self.store.save(record)?;
        info!(status = ?record.step(phase).status, "phase finished");
        Ok(transition)
    }

    /// Returns the persisted record, or a fresh one when none is stored.
    #[must_use]
    pub fn status(&self) -> StatusRecord {
        self.store.load()
    }

    /// Replaces the persisted record with a fresh one and returns it.
    ///
    /// Callers are responsible for not resetting while a run is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] when the fresh record cannot be
    /// written.
    pub fn reset(&self) -> Result<StatusRecord, OrchestratorError> {
        let mut record = StatusRecord::fresh();
        self.store.save(&mut record)?;
        info!("status reset");
        Ok(record)
    }

    /// Runs a single collaborator action outside the phase sequence. The
    /// status record is neither read nor written.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the action's command cannot be started.
    pub fn run_action(&self, action: Action) -> Result<CommandOutput, RunnerError> {
        let span = info_span!("action", name = %action);
        let _entered = span.enter();
        let output = action.perform(&self.provisioner)?;
        info!(status = %output.status_text(), "action finished");
        Ok(output)
    }
}
