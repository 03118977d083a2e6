//! Response assembly: JSON bodies, SSE bodies, identification headers.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use grelay_core::GatewayError;

pub const PROXY_HEADER: &str = "x-proxied-by";
pub const SELECTED_KEY_HEADER: &str = "x-selected-key-id";
pub const PROXY_NAME: &str = "grelay";

pub fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
    selected_key_id: Option<&str>,
) -> Response {
    let body = match serde_json::to_vec(value) {
        Ok(body) => Bytes::from(body),
        Err(err) => return error_response(GatewayError::internal(err.to_string())),
    };
    json_bytes_response(status, body, selected_key_id)
}

pub fn json_bytes_response(
    status: StatusCode,
    body: Bytes,
    selected_key_id: Option<&str>,
) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    apply_identity_headers(&mut resp, selected_key_id);
    resp
}

pub fn error_response(err: GatewayError) -> Response {
    json_bytes_response(err.status, err.body, None)
}

/// SSE response over a single-writer channel. Each channel item is one
/// complete frame, so frames can never interleave on the wire.
pub fn sse_response(rx: mpsc::Receiver<Bytes>, selected_key_id: Option<&str>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut resp = Response::new(Body::from_stream(stream));
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // Hint common reverse proxies to avoid buffering SSE responses.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    apply_identity_headers(&mut resp, selected_key_id);
    resp
}

fn apply_identity_headers(resp: &mut Response, selected_key_id: Option<&str>) {
    resp.headers_mut()
        .insert(PROXY_HEADER, HeaderValue::from_static(PROXY_NAME));
    if let Some(key_id) = selected_key_id
        && let Ok(value) = HeaderValue::from_str(key_id)
    {
        resp.headers_mut().insert(SELECTED_KEY_HEADER, value);
    }
}
