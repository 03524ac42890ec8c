pub mod admin;
pub mod live_ws;
pub mod status;
pub mod tracking;

pub use admin::*;
pub use live_ws::*;
pub use status::*;
pub use tracking::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

/// Consistent JSON error envelope across the HTTP surface.
pub fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (
        status,
        Json(json!({
            "errors": message
        })),
    )
}
