//! HTTP front end for the orchestrator.
//!
//! `POST /setup` starts a run on a blocking task and returns at once.
//! `POST /actions/{name}` starts a single collaborator action the same way.
//! `GET /status` and `POST /status/reset` read and replace the persisted
//! record. Runs and actions share one in-flight slot; a trigger that finds it
//! taken is refused with `409 Conflict`. Reads and resets are not
//! synchronised with a run, so a reader may observe a step in the `running`
//! state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::orchestrator::{Orchestrator, OrchestratorError, RunReport};
use crate::provision::{Action, Provisioner};
use crate::runner::{CommandOutput, RunnerError};
use crate::status::StatusRecord;
use crate::store::StatusStore;

/// Acknowledgement returned when a run starts.
pub const SETUP_STARTED: &str = "setup_started";

/// Acknowledgement returned when a run is already in flight.
pub const SETUP_ALREADY_RUNNING: &str = "setup_already_running";

/// Acknowledgement returned when an action is refused because a run or
/// another action is in flight.
pub const RUN_IN_PROGRESS: &str = "run_in_progress";

/// Operations the HTTP layer exposes.
pub trait SetupService: Send + Sync + 'static {
    /// Runs the phase sequence to its next stopping point.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when a checkpoint cannot be written.
    fn run_setup(&self) -> Result<RunReport, OrchestratorError>;

    /// Returns the persisted record.
    fn status(&self) -> StatusRecord;

    /// Replaces the persisted record with a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the record cannot be written.
    fn reset(&self) -> Result<StatusRecord, OrchestratorError>;

    /// Runs one collaborator action.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the action's command cannot be started.
    fn run_action(&self, action: Action) -> Result<CommandOutput, RunnerError>;
}

impl<S, P> SetupService for Orchestrator<S, P>
where
    S: StatusStore + Send + Sync + 'static,
    P: Provisioner + Send + Sync + 'static,
{
    fn run_setup(&self) -> Result<RunReport, OrchestratorError> {
        Orchestrator::run_setup(self)
    }

    fn status(&self) -> StatusRecord {
        Orchestrator::status(self)
    }

    fn reset(&self) -> Result<StatusRecord, OrchestratorError> {
        Orchestrator::reset(self)
    }

    fn run_action(&self, action: Action) -> Result<CommandOutput, RunnerError> {
        Orchestrator::run_action(self, action)
    }
}

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Raised when the status store rejects a write.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    /// Raised when a route names no known action.
    #[error("unknown action: {0}")]
    UnknownAction(String),
    /// Raised when a blocking task panics or is cancelled.
    #[error("background task failed: {0}")]
    Task(String),
    /// Raised when the listener cannot bind.
    #[error("failed to bind {addr}: {message}")]
    Bind {
        /// Requested socket address.
        addr: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the server stops with an I/O error.
    #[error("server error: {0}")]
    Serve(String),
}

#[derive(Debug, Serialize)]
struct Acknowledgement {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::UnknownAction(_) => StatusCode::NOT_FOUND,
            Self::Orchestrator(_) | Self::Task(_) | Self::Bind { .. } | Self::Serve(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "request rejected");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    service: Arc<dyn SetupService>,
    running: Arc<AtomicBool>,
}

impl AppState {
    /// Wraps `service` for the router.
    #[must_use]
    pub fn new(service: impl SetupService) -> Self {
        Self {
            service: Arc::new(service),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `true` while a triggered run is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn try_claim(&self) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(Arc::clone(&self.running)))
    }
}

/// Clears the in-flight flag when the run ends, including by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Builds the router with every route mounted.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/setup", post(start_setup))
        .route("/actions/{name}", post(start_action))
        .route("/status", get(read_status))
        .route("/status/reset", post(reset_status))
        .with_state(state)
}

async fn start_setup(State(state): State<AppState>) -> (StatusCode, Json<Acknowledgement>) {
    let Some(guard) = state.try_claim() else {
        info!("setup trigger refused; a run is already in flight");
        return (
            StatusCode::CONFLICT,
            Json(Acknowledgement {
                status: SETUP_ALREADY_RUNNING,
            }),
        );
    };

    let service = Arc::clone(&state.service);
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        match service.run_setup() {
            Ok(report) => info!(outcome = %report.outcome, "setup run finished"),
            Err(err) => error!(error = %err, "setup run aborted"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(Acknowledgement {
            status: SETUP_STARTED,
        }),
    )
}

async fn start_action(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Acknowledgement>), ServerError> {
    let Some(action) = Action::from_name(&name) else {
        return Err(ServerError::UnknownAction(name));
    };
    let Some(guard) = state.try_claim() else {
        info!(action = %action, "action refused; a run is already in flight");
        return Ok((
            StatusCode::CONFLICT,
            Json(Acknowledgement {
                status: RUN_IN_PROGRESS,
            }),
        ));
    };

    let service = Arc::clone(&state.service);
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        match service.run_action(action) {
            Ok(output) => {
                info!(action = %action, status = %output.status_text(), "action finished");
            }
            Err(err) => error!(action = %action, error = %err, "action could not start"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(Acknowledgement {
            status: action.acknowledgement(),
        }),
    ))
}

async fn read_status(State(state): State<AppState>) -> Result<Json<StatusRecord>, ServerError> {
    let service = Arc::clone(&state.service);
    let record = tokio::task::spawn_blocking(move || service.status())
        .await
        .map_err(|err| ServerError::Task(err.to_string()))?;
    Ok(Json(record))
}

async fn reset_status(State(state): State<AppState>) -> Result<Json<StatusRecord>, ServerError> {
    let service = Arc::clone(&state.service);
    let record = tokio::task::spawn_blocking(move || service.reset())
        .await
        .map_err(|err| ServerError::Task(err.to_string()))??;
    Ok(Json(record))
}

/// Serves the router on `addr` until Ctrl-C.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] when the address cannot be bound, or
/// [`ServerError::Serve`] when the server stops with an I/O error.
pub async fn serve(addr: &str, state: AppState) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| ServerError::Bind {
            addr: addr.to_owned(),
            message: err.to_string(),
        })?;
    if let Ok(local) = listener.local_addr() {
        info!(addr = %local, "listening");
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| ServerError::Serve(err.to_string()))?;
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
