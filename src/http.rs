//!
//! HTTP API router
//! ----------------
//! `GET /data` and `GET /data/<path...>` project the Store through the
//! `AccessEngine` under the fixed `{"public"}` role set. The URL path,
//! `data` segment included, is decoded as the literal key sequence passed
//! to the Store — `/data` itself is `Get(["data"], {"public"})`, not a
//! bare prefix stripped before projecting. Everything else is a catch-all
//! 404. Grounded on `clarium::server::run_with_ports`'s
//! `Router::new().route(...)` registration style and `query_handler`'s
//! status-code branching (`src/server.rs`).

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::access::RoleSet;
use crate::service::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/data", get(get_data_root))
        .route("/data/{*path}", get(get_data))
        .fallback(not_found)
}

async fn get_data_root(State(state): State<AppState>) -> Response {
    project(&state, vec!["data".to_string()])
}

async fn get_data(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let mut keys = vec!["data".to_string()];
    keys.extend(path.split('/').filter(|segment| !segment.is_empty()).map(str::to_string));
    project(&state, keys)
}

fn project(state: &AppState, keys: Vec<String>) -> Response {
    let public: RoleSet = ["public".to_string()].into_iter().collect();
    let value = state.store.get(&keys, &public);
    json_ok(value)
}

async fn not_found() -> Response {
    let mut response = (StatusCode::NOT_FOUND, Json(json!({"message": "No such resource defined"}))).into_response();
    response.headers_mut().insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
    response
}

/// `200 OK` with the handler's JSON body, `Content-Type: application/json`,
/// and `Access-Control-Allow-Origin: *` — the uniform wrapper every
/// registered resource in this revision goes through.
fn json_ok(value: serde_json::Value) -> Response {
    let mut response = (StatusCode::OK, Json(value)).into_response();
    response.headers_mut().insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".parse().unwrap());
    response
}
