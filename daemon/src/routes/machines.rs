use axum::extract::{Path, State};
use axum::Json;
use http::StatusCode;
use serde::Deserialize;

use meridian_rs::api::ForwardRequest;
use meridian_rs::machine::Machine;
use meridian_rs::spec::VmSpec;

use crate::error::VmError;
use crate::serve::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateMachine {
    pub name: String,
    #[serde(default)]
    pub spec: VmSpec,
    /// Start the machine once it is initialized.
    #[serde(default)]
    pub run: bool,
}

#[derive(Debug, Deserialize)]
pub struct Protect {
    pub protected: bool,
}

// -- list

pub async fn list(State(state): State<AppState>) -> Json<Vec<Machine>> {
    Json(state.mgr().list().await)
}

// -- create

#[tracing::instrument(skip(state, request), fields(name = %request.name))]
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateMachine>,
) -> Result<(StatusCode, Json<Machine>), VmError> {
    let machine = if request.run {
        state.mgr().run(&request.name, request.spec).await?
    } else {
        state.mgr().create(&request.name, request.spec).await?
    };
    Ok((StatusCode::CREATED, Json(machine)))
}

// -- get

pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Machine>, VmError> {
    Ok(Json(state.mgr().get(&name).await?))
}

// -- destroy

#[tracing::instrument(skip(state))]
pub async fn destroy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, VmError> {
    state.mgr().destroy(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- start / stop

#[tracing::instrument(skip(state))]
pub async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Machine>), VmError> {
    let machine = state.mgr().start(&name).await?;
    Ok((StatusCode::ACCEPTED, Json(machine)))
}

#[tracing::instrument(skip(state))]
pub async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Machine>, VmError> {
    Ok(Json(state.mgr().stop(&name).await?))
}

// -- protect

pub async fn protect(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<Protect>,
) -> Result<Json<Machine>, VmError> {
    Ok(Json(state.mgr().protect(&name, request.protected).await?))
}

// -- forwards

pub async fn add_forwards(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ForwardRequest>,
) -> Result<Json<Machine>, VmError> {
    Ok(Json(state.mgr().forward(&name, request.forwards, true).await?))
}

pub async fn remove_forwards(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ForwardRequest>,
) -> Result<Json<Machine>, VmError> {
    Ok(Json(state.mgr().forward(&name, request.forwards, false).await?))
}
