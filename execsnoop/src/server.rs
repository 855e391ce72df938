use std::{net::SocketAddr, sync::Arc};

use aya::maps::MapError;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    decode::{ExecRecord, ProcessRecord},
    maps::{DropCounters, DropSnapshot, ExecTable, ProcessStats},
    probes::Probes,
    store::ExecutionStorage,
};

/// Where the per-pid counters and drop counters are read from.
pub trait StatsSource: Send + Sync + 'static {
    /// `(pid, count)` pairs sorted by pid.
    fn process_counts(&self) -> Result<Vec<(u32, u64)>, MapError>;

    fn process_count(&self, pid: u32) -> Result<Option<u64>, MapError>;

    fn drops(&self) -> Result<DropSnapshot, MapError>;

    /// Correlation table occupancy, when it can be observed.
    fn table(&self) -> Option<TableStats> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub pending: usize,
    pub overwritten: u64,
}

/// Counters of the in-process maps.
pub struct HostStats {
    pub stats: Arc<ProcessStats>,
    pub drops: Arc<DropCounters>,
    pub execs: Arc<ExecTable>,
}

impl HostStats {
    pub fn of(probes: &Probes) -> Self {
        Self {
            stats: Arc::clone(probes.stats()),
            drops: Arc::clone(probes.drops()),
            execs: Arc::clone(probes.execs()),
        }
    }
}

impl StatsSource for HostStats {
    fn process_counts(&self) -> Result<Vec<(u32, u64)>, MapError> {
        Ok(self.stats.snapshot())
    }

    fn process_count(&self, pid: u32) -> Result<Option<u64>, MapError> {
        Ok(self.stats.get(pid))
    }

    fn drops(&self) -> Result<DropSnapshot, MapError> {
        Ok(self.drops.snapshot())
    }

    fn table(&self) -> Option<TableStats> {
        Some(TableStats {
            pending: self.execs.pending(),
            overwritten: self.execs.overwritten(),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub storage: ExecutionStorage,
    pub stats: Arc<dyn StatsSource>,
}

#[derive(Debug, Serialize)]
pub struct ProcessCount {
    pub pid: u32,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct DropReport {
    #[serde(flatten)]
    pub drops: DropSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableStats>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/executions", get(get_all_executions))
        .route("/executions/:pid", get(get_executions_by_pid))
        .route("/processes", get(get_processes))
        .route("/stats", get(get_stats))
        .route("/stats/:pid", get(get_stats_by_pid))
        .route("/drops", get(get_drops))
        .with_state(state)
}

pub async fn start_http_server(
    listen: SocketAddr,
    state: AppState,
) -> anyhow::Result<JoinHandle<()>> {
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("HTTP server starting on http://{listen}");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    info!("API endpoints:");
    info!("  GET /executions - most recent executions");
    info!("  GET /executions/:pid - executions of one PID");
    info!("  GET /processes - most recent fork/exec/exit records");
    info!("  GET /stats - lifecycle record count per PID");
    info!("  GET /stats/:pid - lifecycle record count of one PID");
    info!("  GET /drops - probe invocations that produced no record");

    Ok(server_handle)
}

async fn get_all_executions(State(state): State<AppState>) -> Json<Vec<ExecRecord>> {
    let executions = state.storage.executions().await;
    info!("Returning {} executions", executions.len());
    Json(executions)
}

async fn get_executions_by_pid(
    Path(pid): Path<u32>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExecRecord>>, StatusCode> {
    let executions = state.storage.executions_by_pid(pid);
    if executions.is_empty() {
        info!("No executions found for PID {}", pid);
        Err(StatusCode::NOT_FOUND)
    } else {
        info!("Returning {} executions for PID {}", executions.len(), pid);
        Ok(Json(executions))
    }
}

async fn get_processes(State(state): State<AppState>) -> Json<Vec<ProcessRecord>> {
    Json(state.storage.processes().await)
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<Vec<ProcessCount>>, StatusCode> {
    let counts = state.stats.process_counts().map_err(internal)?;
    Ok(Json(
        counts
            .into_iter()
            .map(|(pid, count)| ProcessCount { pid, count })
            .collect(),
    ))
}

async fn get_stats_by_pid(
    Path(pid): Path<u32>,
    State(state): State<AppState>,
) -> Result<Json<ProcessCount>, StatusCode> {
    match state.stats.process_count(pid).map_err(internal)? {
        Some(count) => Ok(Json(ProcessCount { pid, count })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn get_drops(State(state): State<AppState>) -> Result<Json<DropReport>, StatusCode> {
    let drops = state.stats.drops().map_err(internal)?;
    Ok(Json(DropReport {
        drops,
        table: state.stats.table(),
    }))
}

fn internal(e: MapError) -> StatusCode {
    error!("failed to read map: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}
