//! Control endpoint.
//!
//! Every method and path lands in one fallback handler: the request
//! method names the command, the path marks the wildcard form and the
//! body carries the `Key=Value` parameters.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use clusterlb_core::{Command, CommandKind, McmpError, McmpResult};
use tracing::warn;

use crate::engine::{Format, ManagerEngine, Reply};

const TYPE_HEADER: HeaderName = HeaderName::from_static("type");
const MESS_HEADER: HeaderName = HeaderName::from_static("mess");

/// Shared state for the control handler.
#[derive(Clone)]
pub struct ControlState {
    pub engine: Arc<ManagerEngine>,
}

/// Build the control router.
pub fn control_router(engine: Arc<ManagerEngine>) -> Router {
    Router::new()
        .fallback(handle_command)
        .with_state(ControlState { engine })
}

pub async fn handle_command(
    State(state): State<ControlState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !state.engine.accepts_commands() {
        warn!(%method, "control command refused, MCMP receive is disabled");
        return StatusCode::FORBIDDEN.into_response();
    }

    let format = Format::from_accept(headers.get(ACCEPT).and_then(|v| v.to_str().ok()));
    match dispatch(&state.engine, &method, &uri, &body, format).await {
        Ok(reply) => ([(CONTENT_TYPE, reply.content_type())], reply.body).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn dispatch(
    engine: &ManagerEngine,
    method: &Method,
    uri: &Uri,
    body: &str,
    format: Format,
) -> McmpResult<Reply> {
    let kind: CommandKind = method.as_str().parse()?;
    let cmd = Command::parse(kind, uri.path(), body)?;
    engine.handle(&cmd, format).await
}

/// HTTP 500 carrying the error class and message in headers.
pub fn error_response(err: &McmpError) -> Response {
    let mut response =
        (StatusCode::INTERNAL_SERVER_ERROR, [(CONTENT_TYPE, "text/plain")]).into_response();
    let headers = response.headers_mut();
    headers.insert(TYPE_HEADER, HeaderValue::from_static(err.kind.as_str()));
    if let Ok(mess) = HeaderValue::from_str(&err.header_message()) {
        headers.insert(MESS_HEADER, mess);
    }
    response
}
