//! HTTP surface

mod api_error;
mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::code::CodeService;
use crate::codelog::CodeLogService;
use crate::coderun::CodeRunService;
use crate::coderunner::CodeRunner;
use crate::health::HealthChecker;
use crate::workerpool::WorkerPool;

pub use api_error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub codes: CodeService,
    pub runs: CodeRunService,
    pub logs: CodeLogService,
    pub runner: CodeRunner,
    pub pool: Arc<WorkerPool>,
    pub health: Arc<HealthChecker>,
    pub metrics: PrometheusHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/code", get(handlers::list_codes).post(handlers::create_code))
        .route(
            "/code/{id}",
            get(handlers::get_code).delete(handlers::delete_code),
        )
        .route(
            "/action/endpoint/{code_id}",
            get(handlers::action_endpoint).post(handlers::action_endpoint),
        )
        .route("/run/{code_id}", post(handlers::run_code))
        .route("/coderun", get(handlers::list_runs))
        .route("/coderun/{id}", get(handlers::get_run))
        .route("/codelog", get(handlers::list_logs))
        .route("/codelog/{id}", get(handlers::get_log))
        .with_state(state)
}
