//! Sandbox control API, served over the machine's unix socket.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};

use meridian_rs::api::{routes, ErrorBody, ForwardRequest, GuestHealth, HealthStatus};
use mdn_forward::RuleError;

use crate::agent::HostAgent;

type AgentState = State<Arc<HostAgent>>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = if err.downcast_ref::<RuleError>().is_some() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ApiError::new(status, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody::new(self.message))).into_response()
    }
}

fn check_name(agent: &HostAgent, name: &str) -> Result<(), ApiError> {
    if agent.name() != name {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("machine {name:?} is not served by this sandbox"),
        ));
    }
    Ok(())
}

pub fn router(agent: Arc<HostAgent>) -> Router {
    async fn not_found() -> impl IntoResponse {
        StatusCode::NOT_FOUND
    }

    Router::new()
        .route(routes::HEALTHZ, get(healthz))
        .route(routes::FORWARD, post(add_forward).delete(remove_forward))
        .route(routes::VM_STOP, put(stop_vm))
        .route(routes::GUEST_HEALTH, get(guest_health))
        .fallback(not_found)
        .with_state(agent)
}

async fn healthz(State(agent): AgentState) -> Json<HealthStatus> {
    Json(agent.health())
}

async fn add_forward(
    State(agent): AgentState,
    Path(name): Path<String>,
    Json(req): Json<ForwardRequest>,
) -> Result<Json<HealthStatus>, ApiError> {
    check_name(&agent, &name)?;
    agent.forward(&req.forwards).await?;
    Ok(Json(agent.health()))
}

async fn remove_forward(
    State(agent): AgentState,
    Path(name): Path<String>,
    Json(req): Json<ForwardRequest>,
) -> Result<Json<HealthStatus>, ApiError> {
    check_name(&agent, &name)?;
    agent.unforward(&req.forwards).await?;
    Ok(Json(agent.health()))
}

async fn stop_vm(State(agent): AgentState, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    check_name(&agent, &name)?;
    agent.request_stop();
    Ok(StatusCode::ACCEPTED)
}

async fn guest_health(State(agent): AgentState) -> Json<GuestHealth> {
    Json(agent.guest_health().await)
}
