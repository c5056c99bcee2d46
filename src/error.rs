use http::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    /// No circuit registered for the upstream; a server misconfiguration.
    CircuitNotFound(String),
    /// Primary answered 429 or 5xx. Triggers fallback, never surfaced.
    UpstreamStatus(u16),
    UpstreamTimeout,
    UpstreamConnect(String),
    /// The client request could not be read.
    BadRequest(String),
    Internal(String),
}

impl GatewayError {
    /// Status returned downstream when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::CircuitNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamStatus(status) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::CircuitNotFound(id) => write!(f, "circuit does not exist: {}", id),
            GatewayError::UpstreamStatus(status) => write!(f, "upstream returned status {}", status),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// 429 and every 5xx count as an upstream fault on the primary path.
pub fn is_upstream_fault(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
