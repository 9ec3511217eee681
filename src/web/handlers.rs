//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, Host, HostStatus, ProbeResult, RangeStats};
use crate::probe::is_valid_hostname;
use crate::scheduler::{CycleReport, SchedulerState};
use crate::status::current_status;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

const MAX_NAME_LEN: usize = 255;
pub const DEFAULT_PING_DATA_LIMIT: usize = 1000;
pub const MAX_PING_DATA_LIMIT: usize = 10_000;

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": detail.into() }))).into_response()
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    tracing::error!("{}: {}", context, e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, context)
}

// ============================================================================
// API: Hosts
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HostsResponse {
    pub hosts: Vec<Host>,
}

pub async fn handle_list_hosts(State(state): State<AppState>) -> Response {
    match state.store.list_hosts(false) {
        Ok(hosts) => Json(HostsResponse { hosts }).into_response(),
        Err(e) => internal_error("Failed to fetch hosts", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateHostRequest {
    pub hostname: String,
    pub display_name: String,
}

pub async fn handle_create_host(
    State(state): State<AppState>,
    Json(req): Json<CreateHostRequest>,
) -> Response {
    let hostname = req.hostname.trim();
    let display_name = req.display_name.trim();

    if hostname.is_empty() || display_name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "hostname and display_name are required");
    }
    if hostname.len() > MAX_NAME_LEN || display_name.len() > MAX_NAME_LEN {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("hostname and display_name must be at most {} bytes", MAX_NAME_LEN),
        );
    }
    if !is_valid_hostname(hostname) {
        return error_response(StatusCode::BAD_REQUEST, "hostname is not valid");
    }

    match state.store.create_host(hostname, display_name) {
        Ok(host) => {
            tracing::info!("Added new host: {} ({})", host.hostname, host.display_name);
            (StatusCode::CREATED, Json(host)).into_response()
        }
        Err(e @ DbError::Conflict(_)) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => internal_error("Failed to add host", e),
    }
}

pub async fn handle_get_host(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.get_host(id) {
        Ok(Some(host)) => Json(host).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Host not found"),
        Err(e) => internal_error("Failed to fetch host", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateHostRequest {
    pub enabled: bool,
}

pub async fn handle_update_host(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateHostRequest>,
) -> Response {
    match state.store.set_host_enabled(id, req.enabled) {
        Ok(host) => {
            tracing::info!(
                "Host {} {}",
                host.hostname,
                if host.enabled { "enabled" } else { "disabled" }
            );
            Json(host).into_response()
        }
        Err(DbError::NotFound) => error_response(StatusCode::NOT_FOUND, "Host not found"),
        Err(e) => internal_error("Failed to update host", e),
    }
}

pub async fn handle_delete_host(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.delete_host(id) {
        Ok(host) => {
            tracing::info!("Deleted host {} (id {})", host.hostname, id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(DbError::NotFound) => error_response(StatusCode::NOT_FOUND, "Host not found"),
        Err(e) => internal_error("Failed to delete host", e),
    }
}

// ============================================================================
// API: Status and data
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CurrentStatusResponse {
    pub hosts: Vec<HostStatus>,
}

pub async fn handle_current_status(State(state): State<AppState>) -> Response {
    match current_status(&state.store) {
        Ok(hosts) => Json(CurrentStatusResponse { hosts }).into_response(),
        Err(e) => internal_error("Failed to fetch current status", e),
    }
}

/// Range query in epoch milliseconds, inclusive on both ends.
#[derive(Debug, Deserialize)]
pub struct PingDataQuery {
    pub start: i64,
    pub end: i64,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PingDataResponse {
    pub host: String,
    pub data: Vec<ProbeResult>,
    pub stats: RangeStats,
}

pub async fn handle_ping_data(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
    Query(query): Query<PingDataQuery>,
) -> Response {
    if query.start > query.end {
        return error_response(StatusCode::BAD_REQUEST, "start must not be after end");
    }
    let limit = query.limit.unwrap_or(DEFAULT_PING_DATA_LIMIT);
    if !(1..=MAX_PING_DATA_LIMIT).contains(&limit) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {}", MAX_PING_DATA_LIMIT),
        );
    }

    let data = match state.store.query_results(&hostname, query.start, query.end, limit) {
        Ok(data) => data,
        Err(e) => return internal_error("Failed to fetch ping data", e),
    };
    let stats = match state.store.range_stats(&hostname, query.start, query.end) {
        Ok(stats) => stats,
        Err(e) => return internal_error("Failed to fetch ping data", e),
    };

    Json(PingDataResponse {
        host: hostname,
        data,
        stats,
    })
    .into_response()
}

pub async fn handle_manual_ping(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Response {
    if !is_valid_hostname(&hostname) {
        return error_response(StatusCode::BAD_REQUEST, "hostname is not valid");
    }
    match state.scheduler.ping_now(&hostname).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => internal_error("Failed to execute ping", e),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scheduler: SchedulerState,
    pub scheduler_running: bool,
    pub cleanup_running: bool,
    pub last_cycle_completed_at: Option<i64>,
    pub last_cycle: Option<CycleReport>,
    pub ping_interval: u64,
}

pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let health = state.scheduler.health();
    Json(HealthResponse {
        status: "healthy",
        scheduler: health.state,
        scheduler_running: health.state == SchedulerState::Running,
        cleanup_running: health.cleanup_running,
        last_cycle_completed_at: health.last_cycle_completed_at,
        last_cycle: health.last_cycle,
        ping_interval: state.config.ping_interval,
    })
}

// ============================================================================
// API: Admin
// ============================================================================

pub async fn handle_cleanup(State(state): State<AppState>) -> Response {
    match state.scheduler.retention().cleanup_now() {
        Ok(report) => {
            tracing::info!("Manual cleanup deleted {} records", report.deleted_count);
            Json(json!({
                "success": true,
                "deleted_count": report.deleted_count,
                "cutoff": report.cutoff,
                "timestamp": report.timestamp,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!("Manual cleanup failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn handle_vacuum(State(state): State<AppState>) -> Response {
    match state.scheduler.retention().vacuum_now() {
        Ok(timestamp) => Json(json!({ "success": true, "timestamp": timestamp })).into_response(),
        Err(e) => {
            tracing::error!("Manual vacuum failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn handle_cleanup_status(State(state): State<AppState>) -> Response {
    Json(state.scheduler.retention().status()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::{temp_store, Store};
    use crate::probe::testing::ScriptedPinger;
    use crate::probe::Prober;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn app_state(store: &Store) -> AppState {
        let config = ServerConfig::default();
        let prober = Prober::with_pinger(Arc::new(ScriptedPinger::new()), Duration::from_secs(1), 0);
        let store = Arc::new(store.clone());
        let scheduler = Arc::new(Scheduler::new(store.clone(), prober, SchedulerConfig::from(&config)));
        AppState {
            config: Arc::new(config),
            store,
            scheduler,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_request(hostname: &str, display_name: &str) -> Json<CreateHostRequest> {
        Json(CreateHostRequest {
            hostname: hostname.to_string(),
            display_name: display_name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_and_list_hosts() {
        let (_dir, store) = temp_store();
        let state = app_state(&store);

        let response = handle_create_host(State(state.clone()), create_request("8.8.8.8", "Google DNS")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["hostname"], "8.8.8.8");
        assert_eq!(created["enabled"], true);

        let response = handle_create_host(State(state.clone()), create_request("8.8.8.8", "Again")).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = handle_create_host(State(state.clone()), create_request("  ", "Blank")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let listed = body_json(handle_list_hosts(State(state)).await).await;
        assert_eq!(listed["hosts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flag_like_hostnames_rejected() {
        let (_dir, store) = temp_store();
        let state = app_state(&store);

        let response = handle_create_host(State(state.clone()), create_request("-h", "Flag")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["detail"], "hostname is not valid");

        let response = handle_create_host(State(state.clone()), create_request("bad host", "Spaces")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_manual_ping(State(state), Path("-f".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.list_hosts(false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_host() {
        let (_dir, store) = temp_store();
        let state = app_state(&store);
        let host = store.create_host("9.9.9.9", "Quad9").unwrap();

        let response = handle_get_host(State(state.clone()), Path(host.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["hostname"], "9.9.9.9");
        assert_eq!(body["display_name"], "Quad9");

        let response = handle_get_host(State(state), Path(host.id + 1)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_and_delete_host() {
        let (_dir, store) = temp_store();
        let state = app_state(&store);
        let host = store.create_host("10.0.0.1", "Gateway").unwrap();

        let response = handle_update_host(
            State(state.clone()),
            Path(host.id),
            Json(UpdateHostRequest { enabled: false }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["enabled"], false);

        let response = handle_update_host(
            State(state.clone()),
            Path(host.id + 100),
            Json(UpdateHostRequest { enabled: true }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handle_delete_host(State(state.clone()), Path(host.id)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = handle_delete_host(State(state), Path(host.id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ping_data_validation() {
        let (_dir, store) = temp_store();
        let state = app_state(&store);

        let inverted = PingDataQuery { start: 10, end: 5, limit: None };
        let response = handle_ping_data(State(state.clone()), Path("h".to_string()), Query(inverted)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        for limit in [0, MAX_PING_DATA_LIMIT + 1] {
            let query = PingDataQuery { start: 0, end: 5, limit: Some(limit) };
            let response = handle_ping_data(State(state.clone()), Path("h".to_string()), Query(query)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_ping_data_returns_range_and_stats() {
        let (_dir, store) = temp_store();
        let state = app_state(&store);
        store.insert_result(&ProbeResult::succeeded("h", 100, 10.0)).unwrap();
        store.insert_result(&ProbeResult::failed("h", 200, "timeout")).unwrap();
        store.insert_result(&ProbeResult::succeeded("h", 300, 30.0)).unwrap();
        store.insert_result(&ProbeResult::succeeded("h", 400, 99.0)).unwrap();

        let query = PingDataQuery { start: 100, end: 300, limit: None };
        let response = handle_ping_data(State(state), Path("h".to_string()), Query(query)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["host"], "h");
        let timestamps: Vec<i64> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
        assert_eq!(body["data"][1]["latency"], Value::Null);
        assert_eq!(body["stats"]["avg_latency"], 20.0);
        assert_eq!(body["stats"]["success_rate"], 66.67);
    }

    #[tokio::test]
    async fn test_manual_ping_and_current_status() {
        let (_dir, store) = temp_store();
        let state = app_state(&store);
        store.create_host("1.1.1.1", "Cloudflare").unwrap();

        let response = handle_manual_ping(State(state.clone()), Path("1.1.1.1".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);

        let body = body_json(handle_current_status(State(state)).await).await;
        let hosts = body["hosts"].as_array().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0]["success"], true);
        assert_eq!(hosts[0]["uptime_24h"], 100.0);
    }

    #[tokio::test]
    async fn test_health_reports_scheduler_state() {
        let (_dir, store) = temp_store();
        let Json(health) = handle_health(State(app_state(&store))).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.scheduler, SchedulerState::Stopped);
        assert!(!health.scheduler_running);
        assert!(health.last_cycle_completed_at.is_none());
    }

    #[tokio::test]
    async fn test_admin_cleanup_and_status() {
        let (_dir, store) = temp_store();
        let state = app_state(&store);
        let now = Utc::now().timestamp_millis();
        store.insert_result(&ProbeResult::succeeded("h", now - 200 * 86_400_000, 1.0)).unwrap();
        store.insert_result(&ProbeResult::succeeded("h", now, 1.0)).unwrap();

        let body = body_json(handle_cleanup(State(state.clone())).await).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["deleted_count"], 1);

        let body = body_json(handle_cleanup(State(state.clone())).await).await;
        assert_eq!(body["deleted_count"], 0);

        let body = body_json(handle_vacuum(State(state.clone())).await).await;
        assert_eq!(body["success"], true);

        let status = body_json(handle_cleanup_status(State(state)).await).await;
        assert_eq!(status["retention_days"], 120);
        assert_eq!(status["last_deleted"], 0);
        assert!(!status["last_vacuum"].is_null());
        assert_eq!(status["storage"]["result_count"], 1);
    }
}
