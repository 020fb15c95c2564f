use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relaynode_core::config::NodeConfig;
use relaynode_core::envelope::PacketEnvelope;
use relaynode_core::node::{HealthState, NodeRegistration};
use relaynode_monitor::{HealthMonitor, MetricsCollector};
use relaynode_tunnel::SessionRegistry;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::session;

/// Shared handles for every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub registry: SessionRegistry,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsCollector>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/metrics/latest", get(latest_metrics))
        .route("/metrics/fleet", get(fleet_metrics))
        .route("/metrics/prometheus", get(prometheus))
        .route("/nodes", get(nodes))
        .route("/register", post(register))
        // Fixed routes win over `/tunnel/{session_id}`; the registry refuses
        // their names as session ids.
        .route("/tunnel/packet", post(submit_packet))
        .route("/tunnel/stats", get(tunnel_stats))
        .route("/tunnel/stats/{session_id}", get(session_stats))
        .route("/tunnel/{session_id}", get(tunnel_upgrade))
        .with_state(state)
}

// ============================================================================
// Health and fleet
// ============================================================================

async fn health(State(state): State<AppState>) -> Response {
    let status = match state.health.get_health_status() {
        Some(status) => status,
        None => state.health.tick().await,
    };
    let code = if status.status == HealthState::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

#[derive(Debug, Deserialize)]
struct NodesQuery {
    region: Option<String>,
}

async fn nodes(
    State(state): State<AppState>,
    Query(query): Query<NodesQuery>,
) -> Result<Json<Value>, ApiError> {
    let nodes = match query.region.as_deref() {
        Some(region) => state.health.get_nodes_by_region(region).await?,
        None => state.health.get_all_nodes().await?,
    };
    Ok(Json(json!({ "nodes": nodes })))
}

async fn register(
    State(state): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> Result<Json<Value>, ApiError> {
    let node = state.health.register_node(registration).await?;
    Ok(Json(json!({ "success": true, "node": node })))
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Deserialize)]
struct RangeQuery {
    range_ms: Option<u64>,
}

async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Value>, ApiError> {
    let range = query.range_ms.map(Duration::from_millis);
    let latest = state.metrics.get_latest_metrics().await?;
    let history = state.metrics.get_metrics(range).await?;
    Ok(Json(json!({ "latest": latest, "history": history })))
}

async fn latest_metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.metrics.get_latest_metrics().await? {
        Some(sample) => Ok(Json(sample).into_response()),
        None => Err(ApiError::NotFound("no metrics collected yet".into())),
    }
}

#[derive(Debug, Deserialize)]
struct FleetQuery {
    regions: Option<String>,
}

async fn fleet_metrics(
    State(state): State<AppState>,
    Query(query): Query<FleetQuery>,
) -> Result<Response, ApiError> {
    let regions: Option<Vec<String>> = query.regions.map(|r| {
        r.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    });
    let aggregate = state
        .metrics
        .get_aggregated_metrics(regions.as_deref())
        .await?;
    Ok(Json(aggregate).into_response())
}

async fn prometheus(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.registry.prometheus_exposition(),
    )
}

// ============================================================================
// Tunnel
// ============================================================================

async fn submit_packet(
    State(state): State<AppState>,
    Json(envelope): Json<PacketEnvelope>,
) -> Result<Json<Value>, ApiError> {
    let session_id = envelope.session_id.clone();
    state.registry.forward(&session_id, envelope).await?;
    Ok(Json(json!({ "success": true })))
}

async fn tunnel_stats(State(state): State<AppState>) -> Response {
    Json(state.registry.connection_summary()).into_response()
}

async fn session_stats(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    state
        .registry
        .connection_metrics(&session_id)
        .map(|m| Json(m).into_response())
        .ok_or_else(|| ApiError::NotFound(format!("session {}", session_id)))
}

async fn tunnel_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    let buffer = state.config.tunnel.channel_buffer;
    ws.on_upgrade(move |socket| session::serve(socket, session_id, registry, buffer))
}


#[cfg(test)]
mod tests {
    use super::testing::state;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use relaynode_tunnel::ClientChannel;
    use tower::ServiceExt;

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    // ========================================================================
    // Health
    // ========================================================================

    #[tokio::test]
    async fn test_health_runs_first_check_on_demand() {
        let (state, _store) = state();
        assert!(state.health.get_health_status().is_none());

        let (status, body) = get_json(router(state.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["checks"]["store"].is_object());
        assert!(body["checks"].get("backend").is_none());
        assert!(state.health.get_health_status().is_some());
    }

    #[tokio::test]
    async fn test_health_503_when_store_down() {
        let (state, store) = state();
        store.set_offline(true);

        let (status, body) = get_json(router(state), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_register_and_list_nodes() {
        let (state, _store) = state();
        let (status, body) = post_json(
            router(state.clone()),
            "/register",
            json!({ "id": "node-b", "region": "us-east" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["node"]["id"], "node-b");
        assert_eq!(body["node"]["port"], 8080);

        state.health.publish_heartbeat().await.unwrap();
        let (_, body) = get_json(router(state.clone()), "/nodes").await;
        assert_eq!(body["nodes"].as_array().unwrap().len(), 1);
        assert_eq!(body["nodes"][0]["id"], "node-test");

        let (_, body) = get_json(router(state), "/nodes?region=us-east").await;
        assert!(body["nodes"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_fails_when_store_down() {
        let (state, store) = state();
        store.set_offline(true);
        let (status, body) = post_json(router(state), "/register", json!({})).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    #[tokio::test]
    async fn test_metrics_before_and_after_collection() {
        let (state, _store) = state();
        let (status, _) = get_json(router(state.clone()), "/metrics/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get_json(router(state.clone()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["latest"].is_null());
        assert!(body["history"].as_array().unwrap().is_empty());

        state.metrics.collect().await.unwrap();
        let (status, body) = get_json(router(state.clone()), "/metrics?range_ms=60000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["latest"]["nodeId"], "node-test");
        assert_eq!(body["history"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(router(state), "/metrics/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["region"], "eu-west");
    }

    #[tokio::test]
    async fn test_fleet_metrics_region_filter() {
        let (state, _store) = state();
        let (_, body) = get_json(router(state.clone()), "/metrics/fleet").await;
        assert_eq!(body["totalNodes"], 0);
        assert!(body["regions"].as_array().unwrap().is_empty());

        state.metrics.collect().await.unwrap();
        let (_, body) = get_json(router(state.clone()), "/metrics/fleet?regions=eu-west,ap-south").await;
        assert_eq!(body["totalNodes"], 1);
        assert_eq!(body["regions"][0], "eu-west");

        let (_, body) = get_json(router(state), "/metrics/fleet?regions=ap-south").await;
        assert_eq!(body["totalNodes"], 0);
    }

    #[tokio::test]
    async fn test_prometheus_exposition() {
        let (state, _store) = state();
        let req = Request::builder()
            .uri("/metrics/prometheus")
            .body(Body::empty())
            .unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("relaynode_active_sessions 0"));
    }

    // ========================================================================
    // Tunnel
    // ========================================================================

    fn envelope(session_id: &str, dest_port: u16) -> Value {
        json!({
            "sessionId": session_id,
            "sourceIp": "192.168.1.2",
            "sourcePort": 50000,
            "destIp": "127.0.0.1",
            "destPort": dest_port,
            "protocol": "udp",
            "data": "aGVsbG8=",
            "timestamp": relaynode_core::time::now_ms(),
        })
    }

    #[tokio::test]
    async fn test_packet_for_unknown_session_is_500() {
        let (state, _store) = state();
        let (status, body) = post_json(router(state), "/tunnel/packet", envelope("ghost", 9)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_packet_submission_forwards_datagram() {
        let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();

        let (state, _store) = state();
        let (channel, _rx) = ClientChannel::new("s1", 8);
        state.registry.attach("s1", channel).unwrap();

        let (status, body) = post_json(router(state.clone()), "/tunnel/packet", envelope("s1", port)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));

        let mut buf = [0u8; 64];
        let (n, _) = upstream.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        let (_, body) = get_json(router(state.clone()), "/tunnel/stats").await;
        assert_eq!(body["totalConnections"], 1);
        assert_eq!(body["totalPackets"], 1);
        assert_eq!(body["totalBytes"], 5);

        let (status, body) = get_json(router(state.clone()), "/tunnel/stats/s1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["packetsForwarded"], 1);
        assert_eq!(body["activeConnections"], 1);

        let (status, _) = get_json(router(state), "/tunnel/stats/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fixed_tunnel_routes_shadow_session_upgrade() {
        let (state, _store) = state();
        for id in relaynode_tunnel::registry::RESERVED_SESSION_IDS {
            assert!(state.registry.attach(id, ClientChannel::new(id, 4).0).is_err());
        }

        let upgrade = |uri: &str| {
            Request::builder()
                .uri(uri)
                .header("connection", "upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-version", "13")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                .body(Body::empty())
                .unwrap()
        };
        let (status, body) = send(router(state.clone()), upgrade("/tunnel/stats")).await;
        assert_eq!(status, StatusCode::OK);
        let summary: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary["totalConnections"], 0);

        let (status, _) = send(router(state), upgrade("/tunnel/packet")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_malformed_packet_rejected() {
        let (state, _store) = state();
        let req = Request::builder()
            .method("POST")
            .uri("/tunnel/packet")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"sessionId":"s1"}"#))
            .unwrap();
        let (status, _) = send(router(state), req).await;
        assert!(status.is_client_error());
    }
}
