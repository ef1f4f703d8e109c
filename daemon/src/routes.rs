mod images;
mod machines;
mod workers;

use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use http::StatusCode;
use tower_http::trace::TraceLayer;

use meridian_rs::api::ErrorBody;

use crate::error::VmError;
use crate::serve::AppState;

pub const API_PREFIX: &str = "/apis/meridian.dev/v1";

pub fn build_router(state: AppState) -> Router<()> {
    Router::new()
        .nest(API_PREFIX, api_router())
        // utility
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn api_router() -> Router<AppState> {
    Router::new()
        // machine group
        //  GET /machines
        //  POST /machines
        .route("/machines", get(machines::list).post(machines::create))
        //  GET /machines/{name}
        //  DELETE /machines/{name}
        .route(
            "/machines/{name}",
            get(machines::get).delete(machines::destroy),
        )
        //  PUT /machines/{name}/start
        .route("/machines/{name}/start", put(machines::start))
        //  PUT /machines/{name}/stop
        .route("/machines/{name}/stop", put(machines::stop))
        //  PUT /machines/{name}/protect
        .route("/machines/{name}/protect", put(machines::protect))
        //  POST /machines/{name}/forwards
        //  DELETE /machines/{name}/forwards
        .route(
            "/machines/{name}/forwards",
            post(machines::add_forwards).delete(machines::remove_forwards),
        )
        // image group
        //  GET /images
        .route("/images", get(images::list))
        //  GET /images/{name}
        .route("/images/{name}", get(images::get))
        //  POST /images/{name}/pull
        .route("/images/{name}/pull", post(images::pull))
        // worker pool group
        //  GET /workers
        .route("/workers", get(workers::info))
        //  PUT /workers/size
        .route("/workers/size", put(workers::resize))
        //  PUT /workers/freeze
        .route("/workers/freeze", put(workers::freeze))
        //  PUT /workers/unfreeze
        .route("/workers/unfreeze", put(workers::unfreeze))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new("no such route")))
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

impl IntoResponse for VmError {
    fn into_response(self) -> Response {
        let status = match self {
            VmError::AlreadyExists(_)
            | VmError::InvalidTransition { .. }
            | VmError::Protected(_)
            | VmError::Initializing(_) => StatusCode::CONFLICT,
            VmError::NotFound(_) | VmError::UnknownImage(_) => StatusCode::NOT_FOUND,
            VmError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            VmError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            VmError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, format!("{self:#}"))
    }
}
