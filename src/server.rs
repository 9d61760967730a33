//! HTTP endpoints for health checks, relay info, and the admin API.

use anyhow::Result;
use axum::{
    extract::{Query as AxumQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};

use crate::config::SettingsStore;
use crate::db::DbPool;
use crate::users;

/// Shared state for the HTTP routes.
#[derive(Clone)]
pub struct ApiState {
    pub pool: DbPool,
    pub settings: SettingsStore,
    /// Key gating the admin endpoint; unset disables it entirely.
    pub api_key: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Start an HTTP server exposing `/healthz`, `/user`, and relay info.
pub async fn serve_http(
    addr: SocketAddr,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/user", get(user_balance))
        .with_state(Arc::new(state));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    description: String,
    software: String,
    version: String,
    limitation: Limitation,
}

#[derive(Serialize, Deserialize)]
struct Limitation {
    payment_required: bool,
    min_pow_difficulty: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_content_length: Option<u64>,
}

/// Relay information document derived from the active settings.
async fn relay_info(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let settings = state.settings.current();
    // Advertise the first universal content bound, if one is configured.
    let max_content_length = settings
        .limits
        .event
        .content
        .records()
        .iter()
        .find(|r| r.kinds.is_none() && r.max_length > 0)
        .map(|r| r.max_length);
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: settings.info.name.clone(),
            description: settings.info.description.clone(),
            software: "tollr".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            limitation: Limitation {
                payment_required: settings.payments.enabled,
                min_pow_difficulty: settings.limits.event.event_id.min_leading_zero_bits,
                max_content_length,
            },
        }),
    )
}

#[derive(Deserialize)]
struct UserParams {
    token: Option<String>,
    pubkey: Option<String>,
}

/// Admin lookup of a submitter's balance, gated by the relay API key.
async fn user_balance(
    State(state): State<Arc<ApiState>>,
    AxumQuery(params): AxumQuery<UserParams>,
) -> Response {
    let Some(api_key) = &state.api_key else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let Some(token) = &params.token else {
        return StatusCode::FORBIDDEN.into_response();
    };
    if token != api_key {
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(pubkey) = &params.pubkey else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match users::fetch_balance(&state.pool, pubkey).await {
        Ok(Some(balance)) => Json(serde_json::json!({ "balance": balance })).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "balance lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
