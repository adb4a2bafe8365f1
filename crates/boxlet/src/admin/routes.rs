//! Admin route handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::envelope::Cmd;
use crate::group::GroupOccupancy;
use crate::health::Health;
use crate::proxy::Proxy;
use crate::stats::RouteStats;
use crate::version::VersionInfo;

#[derive(Clone)]
pub struct AdminState {
    proxy: Arc<Proxy>,
    token: Arc<str>,
}

impl AdminState {
    pub fn new(proxy: Arc<Proxy>, token: impl Into<Arc<str>>) -> Self {
        Self {
            proxy,
            token: token.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: Health,
    pub started_at: DateTime<Utc>,
    pub version: VersionInfo,
}

pub type GroupsResponse = BTreeMap<String, GroupOccupancy>;

async fn require_token(State(state): State<AdminState>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token_matches(token.as_bytes(), state.token.as_bytes()) => next.run(req).await,
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "Admin request with wrong token");
            unauthorized()
        }
        None => unauthorized(),
    }
}

/// Compares every byte regardless of where the first mismatch is.
fn token_matches(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(serde_json::json!({"error": "unauthorized"})),
    )
        .into_response()
}

async fn stats(State(state): State<AdminState>) -> Json<BTreeMap<Cmd, RouteStats>> {
    Json(state.proxy.stats().snapshot())
}

async fn groups(State(state): State<AdminState>) -> Json<GroupsResponse> {
    Json(state.proxy.occupancy().into_iter().collect())
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.proxy.health(),
        started_at: state.proxy.started_at(),
        version: state.proxy.version(),
    })
}

pub fn routes(state: AdminState) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/groups", get(groups))
        .route("/health", get(health))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}
