use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::cache::SnapshotCache;
use crate::db::{Db, MAX_RANGE_ROWS};
use crate::error::{error_body, IngestError, ProvisionError};
use crate::ingest::Ingestor;
use crate::model::{NewUnit, Reading, Unit, UnitId, UnitStatus};
use crate::provision::Provisioner;
use crate::state::SharedState;
use crate::ws;

const DEFAULT_RANGE_LIMIT: u32 = 500;
const DEFAULT_RANGE_HOURS: i64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub cache: Arc<SnapshotCache>,
    pub broadcaster: Arc<Broadcaster>,
    pub ingestor: Arc<Ingestor>,
    pub provisioner: Arc<Provisioner>,
    pub shared: SharedState,
    /// Fires when the hub is stopping; open sockets close on it.
    pub shutdown: CancellationToken,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/units/data", post(submit_data))
        .route("/api/units/list", get(list_units))
        .route("/api/units/create", post(create_unit))
        .route("/api/units/{id}", delete(delete_unit))
        .route("/api/units/{id}/data", get(unit_data))
        .route("/api/units/{id}/readings", get(unit_readings))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    let now = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(json!({ "status": "ok", "timestamp": now }))
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let units = state.cache.len().await;
    let clients = state.broadcaster.client_count().await;
    let st = state.shared.read().await;
    Json(st.to_status(units, clients))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// `X-API-Key`, falling back to `Authorization: Bearer <key>`.
fn api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(v);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
}

async fn submit_data(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let result = state.ingestor.submit_raw(api_key(&headers), &body).await;

    match result {
        Ok(ack) => {
            let mut st = state.shared.write().await;
            if ack.came_online {
                st.record_presence(ack.unit_id, UnitStatus::Online);
            }
            st.record_reading(&ack.reading);
            drop(st);
            Json(ack).into_response()
        }
        Err(e) => {
            if matches!(e, IngestError::Storage(_)) {
                warn!(error = %e, "http ingest failed");
            }
            state
                .shared
                .write()
                .await
                .record_rejected(format!("http: {}", e.public_message()));
            e.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnitSummary {
    #[serde(flatten)]
    unit: Unit,
    status: UnitStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    last_seen_at: Option<OffsetDateTime>,
}

async fn list_units(State(state): State<AppState>) -> impl IntoResponse {
    let units: Vec<UnitSummary> = state
        .cache
        .units()
        .await
        .into_iter()
        .map(|(unit, status, last_seen_at)| UnitSummary {
            unit,
            status,
            last_seen_at,
        })
        .collect();
    Json(json!({ "success": true, "units": units }))
}

async fn create_unit(State(state): State<AppState>, body: Bytes) -> Response {
    let req: NewUnit = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return ProvisionError::Invalid(format!("invalid request: {e}")).into_response(),
    };

    match state.provisioner.create(req).await {
        Ok((unit, api_key)) => {
            state
                .shared
                .write()
                .await
                .record_unit(format!("unit {} '{}' created", unit.id, unit.name));
            (
                StatusCode::CREATED,
                Json(json!({ "success": true, "unit": unit, "apiKey": api_key })),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

fn parse_id(raw: &str) -> Result<UnitId, Response> {
    raw.parse()
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, format!("invalid unit id '{raw}'")))
}

async fn delete_unit(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.provisioner.delete(id).await {
        Ok(unit) => {
            state
                .shared
                .write()
                .await
                .record_unit(format!("unit {} '{}' deleted", unit.id, unit.name));
            Json(json!({ "success": true, "unitId": id })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn unit_data(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.cache.get(id).await {
        Some(current) => Json(current).into_response(),
        None => ProvisionError::NotFound(id).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    from: Option<String>,
    to: Option<String>,
    limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RangeResponse {
    success: bool,
    unit_id: UnitId,
    #[serde(with = "time::serde::rfc3339")]
    from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    to: OffsetDateTime,
    readings: Vec<Reading>,
}

fn parse_bound(name: &str, raw: Option<&str>) -> Result<Option<OffsetDateTime>, Response> {
    raw.map(|s| {
        OffsetDateTime::parse(s, &Rfc3339).map_err(|_| {
            error_body(
                StatusCode::BAD_REQUEST,
                format!("{name} must be an RFC 3339 timestamp"),
            )
        })
    })
    .transpose()
}

async fn unit_readings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if state.cache.get(id).await.is_none() {
        return ProvisionError::NotFound(id).into_response();
    }

    let (from, to) = match (
        parse_bound("from", params.from.as_deref()),
        parse_bound("to", params.to.as_deref()),
    ) {
        (Ok(from), Ok(to)) => (from, to),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    let to = to.unwrap_or_else(OffsetDateTime::now_utc);
    let from = from.unwrap_or(to - time::Duration::hours(DEFAULT_RANGE_HOURS));
    if from > to {
        return error_body(StatusCode::BAD_REQUEST, "from must not be after to");
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RANGE_LIMIT)
        .clamp(1, MAX_RANGE_ROWS);

    match state.db.readings_between(id, from, to, limit).await {
        Ok(readings) => Json(RangeResponse {
            success: true,
            unit_id: id,
            from,
            to,
            readings,
        })
        .into_response(),
        Err(e) => {
            warn!(unit_id = id, error = %format!("{e:#}"), "range query failed");
            error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage unavailable, retry later",
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until `state.shutdown` fires, then drain in-flight requests.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(%addr, "http listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("web server error")?;

    info!("http stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ingest::tests::fixture;
    use crate::state::new_shared;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    /// Hub with one unit (id 1, api key "key-1", one float switch).
    pub(crate) async fn app_state() -> AppState {
        let f = fixture(1).await;
        let provisioner = Provisioner::new(f.db.clone(), f.cache.clone(), f.broadcaster.clone());
        AppState {
            db: f.db,
            cache: f.cache,
            broadcaster: f.broadcaster,
            ingestor: Arc::new(f.ingestor),
            provisioner: Arc::new(provisioner),
            shared: new_shared(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_data(key: Option<&str>, body: &str) -> Request<Body> {
        let mut req = Request::post("/api/units/data").header("content-type", "application/json");
        if let Some(key) = key {
            req = req.header("x-api-key", key);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    const VALID: &str = r#"{"waterLevel":63.5,"temperature":22.1,"vibration":false,"floatSwitches":[true]}"#;

    #[tokio::test]
    async fn health_reports_ok() {
        let state = app_state().await;
        let (status, body) = send(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn submit_then_query_returns_reading() {
        let state = app_state().await;

        let (status, body) = send(&state, post_data(Some("key-1"), VALID)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["unitId"], 1);
        assert!(body["timestamp"].is_string());

        let (status, body) = send(&state, get("/api/units/1/data")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ONLINE");
        assert_eq!(body["waterLevel"], 63.5);
        assert_eq!(body["temperature"], 22.1);
        assert_eq!(body["isVibrating"], false);
        assert_eq!(body["floatSwitches"], serde_json::json!([true]));
        assert!(body["lastSeenAt"].is_string());

        let (_, status_body) = send(&state, get("/api/status")).await;
        assert_eq!(status_body["readingsAccepted"], 1);
    }

    #[tokio::test]
    async fn bearer_token_is_accepted() {
        let state = app_state().await;
        let req = Request::post("/api/units/data")
            .header("authorization", "Bearer key-1")
            .body(Body::from(VALID))
            .unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn ingest_errors_map_to_status_codes() {
        let state = app_state().await;

        let (status, body) = send(&state, post_data(None, VALID)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, body) = send(&state, post_data(Some("wrong"), VALID)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!body["error"].as_str().unwrap().contains("wrong"));

        let bad_len = r#"{"waterLevel":50,"temperature":20,"floatSwitches":[true,false]}"#;
        let (status, _) = send(&state, post_data(Some("key-1"), bad_len)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, post_data(Some("key-1"), "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // nothing was recorded
        let (_, body) = send(&state, get("/api/units/1/data")).await;
        assert_eq!(body["status"], "OFFLINE");
        assert!(body["timestamp"].is_null());
        assert_eq!(body["waterLevel"], 0.0);
        assert_eq!(state.db.count_readings(1).await.unwrap(), 0);

        sqlx::query("DROP TABLE readings")
            .execute(state.db.pool())
            .await
            .unwrap();
        let (status, body) = send(&state, post_data(Some("key-1"), VALID)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "storage unavailable, retry later");
    }

    #[tokio::test]
    async fn bad_credentials_win_over_bad_body() {
        let state = app_state().await;

        let (status, body) = send(&state, post_data(Some("revoked-key"), "{not json")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = send(&state, post_data(None, "[1,2]")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // a valid key with a broken body is still a validation failure
        let (status, _) = send(&state, post_data(Some("key-1"), "[1,2]")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_unit_is_404() {
        let state = app_state().await;
        let (status, body) = send(&state, get("/api/units/42/data")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, _) = send(&state, get("/api/units/abc/data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_list_delete_unit() {
        let state = app_state().await;

        let req = Request::post("/api/units/create")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"name":"Cistern B","location":"Yard","type":"CISTERNA","numberOfSensors":2}"#,
            ))
            .unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["unit"]["type"], "CISTERN");
        let key = body["apiKey"].as_str().unwrap().to_string();
        let id = body["unit"]["id"].as_i64().unwrap();

        let (_, list) = send(&state, get("/api/units/list")).await;
        let units = list["units"].as_array().unwrap();
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| u.get("apiKey").is_none()));
        assert_eq!(units[1]["status"], "OFFLINE");

        let body = r#"{"waterLevel":10,"temperature":30,"floatSwitches":[0,1]}"#;
        let (status, _) = send(&state, post_data(Some(&key), body)).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::delete(format!("/api/units/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&state, post_data(Some(&key), body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&state, get(&format!("/api/units/{id}/data"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.db.count_readings(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_bad_input() {
        let state = app_state().await;
        let create = |body: &'static str| {
            Request::post("/api/units/create")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let (status, _) = send(&state, create(r#"{"name":"tank-1","type":"TANK"}"#)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&state, create(r#"{"name":"x","type":"LAKE"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(&state, create(r#"{"type":"TANK"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn readings_range_query() {
        let state = app_state().await;
        for level in [10, 20, 30] {
            let body = format!(r#"{{"waterLevel":{level},"temperature":20,"floatSwitches":[true]}}"#);
            let (status, _) = send(&state, post_data(Some("key-1"), &body)).await;
            assert_eq!(status, StatusCode::OK);
        }

        let all = "/api/units/1/readings?from=2000-01-01T00:00:00Z&to=2100-01-01T00:00:00Z";
        let (status, body) = send(&state, get(all)).await;
        assert_eq!(status, StatusCode::OK);
        let readings = body["readings"].as_array().unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0]["waterLevel"], 10.0);
        assert_eq!(readings[2]["waterLevel"], 30.0);

        let (_, body) = send(&state, get(&format!("{all}&limit=2"))).await;
        assert_eq!(body["readings"].as_array().unwrap().len(), 2);

        let (status, body) = send(&state, get("/api/units/1/readings")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["readings"].as_array().unwrap().len() <= 3);

        let (_, body) = send(
            &state,
            get("/api/units/1/readings?from=2000-01-01T00:00:00Z&to=2000-01-02T00:00:00Z"),
        )
        .await;
        assert!(body["readings"].as_array().unwrap().is_empty());

        let (status, _) = send(&state, get("/api/units/1/readings?from=yesterday")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, get("/api/units/7/readings")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
