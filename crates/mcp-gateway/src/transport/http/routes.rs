//! HTTP route handlers for the gateway.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::BridgeError;
use crate::health::HealthReport;
use crate::rpc::protocol::RpcReply;
use crate::service::GatewayService;

/// Body of `POST /rpc`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcCallRequest {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

async fn rpc_call(
    State(service): State<Arc<GatewayService>>,
    body: Option<Json<RpcCallRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = body else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "detail": [{
                    "loc": ["body"],
                    "msg": "request body with a method field is required",
                    "type": "value_error"
                }]
            })),
        );
    };

    let timeout = match parse_timeout(request.timeout_seconds) {
        Ok(timeout) => timeout,
        Err(detail) => return (StatusCode::UNPROCESSABLE_ENTITY, Json(detail)),
    };

    respond(service.call(&request.method, request.params, timeout).await)
}

async fn list_tools(State(service): State<Arc<GatewayService>>) -> impl IntoResponse {
    respond(service.call("tools/list", None, None).await)
}

async fn health_check(State(service): State<Arc<GatewayService>>) -> Json<HealthReport> {
    Json(service.health().await)
}

async fn shutdown(State(service): State<Arc<GatewayService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(json!({})))
}

fn parse_timeout(seconds: Option<f64>) -> Result<Option<Duration>, Value> {
    let Some(seconds) = seconds else {
        return Ok(None);
    };
    let invalid = || {
        json!({
            "detail": [{
                "loc": ["body", "timeout_seconds"],
                "msg": "timeout_seconds must be a positive number of seconds",
                "type": "value_error"
            }]
        })
    };
    if seconds <= 0.0 {
        return Err(invalid());
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) => Ok(Some(timeout)),
        Err(_) => Err(invalid()),
    }
}

/// Child replies are data (200 either way); bridge failures map to status
/// codes, with a `bridge_error` body so callers can tell the layers apart.
fn respond(outcome: Result<RpcReply, BridgeError>) -> (StatusCode, Json<Value>) {
    match outcome {
        Ok(RpcReply::Result(result)) => (StatusCode::OK, Json(json!({"result": result}))),
        Ok(RpcReply::Error(error)) => (StatusCode::OK, Json(json!({"error": error}))),
        Err(err) => {
            let status = match &err {
                BridgeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                BridgeError::ChildExited { .. }
                | BridgeError::Transport(_)
                | BridgeError::Framing(_) => StatusCode::BAD_GATEWAY,
                BridgeError::Startup(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(kind = err.kind(), error = %err, "Call failed in the bridge");
            (
                status,
                Json(json!({
                    "bridge_error": {
                        "kind": err.kind(),
                        "message": err.to_string(),
                    }
                })),
            )
        }
    }
}

pub fn routes(service: Arc<GatewayService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/rpc", post(rpc_call))
        .route("/tools", get(list_tools))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
