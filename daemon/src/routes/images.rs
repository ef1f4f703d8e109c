use axum::extract::{Path, State};
use axum::Json;
use http::StatusCode;
use serde::Serialize;

use meridian_rs::image::Image;

use crate::error::VmError;
use crate::serve::AppState;

#[derive(Debug, Serialize)]
pub struct PullAccepted {
    pub name: String,
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Image>>, VmError> {
    Ok(Json(state.images().list().await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Image>, VmError> {
    state
        .images()
        .get(&name)
        .await?
        .map(Json)
        .ok_or(VmError::UnknownImage(name))
}

/// Start a pull in the background. Progress shows up in the image's status.
#[tracing::instrument(skip(state))]
pub async fn pull(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<PullAccepted>), VmError> {
    let pulling = state
        .images()
        .pull(&name)
        .map_err(|e| VmError::UnknownImage(e.0))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(PullAccepted {
            name: pulling.name().to_string(),
        }),
    ))
}
