use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use serde_json::Value;

type Handler = fn(&mut AppState, &Request) -> Option<Value>;

const HANDLERS: &[Handler] = &[
    handlers::core::try_handle,
    handlers::config::try_handle,
    handlers::classes::try_handle,
    handlers::templates::try_handle,
    handlers::students::try_handle,
    handlers::grades::try_handle,
    handlers::assessments::try_handle,
    handlers::attendance::try_handle,
    handlers::academic::try_handle,
    handlers::incidents::try_handle,
    handlers::follow_ups::try_handle,
    handlers::analytics::try_handle,
    handlers::certificates::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    for handler in HANDLERS {
        if let Some(resp) = handler(state, &req) {
            return resp;
        }
    }

    tracing::warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
