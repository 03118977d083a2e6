use bytes::Bytes;
use http::StatusCode;

use grelay_protocol::openai::error::ErrorEnvelope;

/// Status-carrying error returned to the client, body already in the
/// OpenAI error envelope shape.
#[derive(Debug)]
pub struct GatewayError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl GatewayError {
    pub fn new(status: StatusCode, envelope: &ErrorEnvelope) -> Self {
        let body = serde_json::to_vec(envelope)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(b"{\"error\":{\"message\":\"internal\"}}"));
        Self { status, body }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            &ErrorEnvelope::invalid_request(message),
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            &ErrorEnvelope::new("authentication_error", message),
        )
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, &ErrorEnvelope::upstream(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ErrorEnvelope::new("internal_error", message),
        )
    }
}
