use super::GatewayState;
use crate::proxy::context::{json_error, response_with, BoxBody};
use crate::upstream::{Circuit, CircuitStore};
use http::{Method, StatusCode};
use hyper::{Request, Response};

pub fn handle_admin<B>(req: &Request<B>, state: &GatewayState) -> Response<BoxBody> {
    let path = req.uri().path();
    let method = req.method();

    match path {
        "/health" | "/healthz" => json(StatusCode::OK, r#"{"status":"ok"}"#.to_string()),

        "/ready" | "/readyz" => json(
            StatusCode::OK,
            serde_json::json!({
                "status": "ready",
                "upstreams": state.routes.len(),
            })
            .to_string(),
        ),

        "/metrics" => response_with(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            state.metrics.render(),
        ),

        "/version" => response_with(
            StatusCode::OK,
            "text/plain",
            state.config.app_version.clone(),
        ),

        // API keys serialize redacted.
        "/settings" => match serde_json::to_string_pretty(&*state.config) {
            Ok(body) => json(StatusCode::OK, body),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },

        "/circuits" => {
            if method != Method::GET {
                return json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            }
            let circuits: Vec<serde_json::Value> = state
                .executor
                .store()
                .circuits()
                .iter()
                .map(circuit_view)
                .collect();
            json(StatusCode::OK, serde_json::Value::from(circuits).to_string())
        }

        _ => match path.strip_prefix("/circuits/") {
            Some(rest) => handle_circuit(method, rest, state),
            None => json_error(StatusCode::NOT_FOUND, "not found"),
        },
    }
}

/// `/circuits/{id}`, `/circuits/{id}/trip`, `/circuits/{id}/reset`.
fn handle_circuit(method: &Method, rest: &str, state: &GatewayState) -> Response<BoxBody> {
    let (id, action) = match rest.split_once('/') {
        Some((id, action)) => (id, Some(action)),
        None => (rest, None),
    };
    if id.is_empty() {
        return json_error(StatusCode::NOT_FOUND, "not found");
    }

    let expected = match action {
        None => Method::GET,
        Some("trip") | Some("reset") => Method::POST,
        Some(_) => return json_error(StatusCode::NOT_FOUND, "not found"),
    };
    if method != expected {
        return json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let circuit = match action {
        Some("trip") => {
            tracing::warn!("admin: manual trip, circuit={}", id);
            state.executor.trip_circuit(id)
        }
        Some("reset") => {
            tracing::info!("admin: manual reset, circuit={}", id);
            state.executor.reset_circuit(id)
        }
        _ => state.executor.get_circuit(id),
    };

    match circuit {
        Some(c) => json(StatusCode::OK, circuit_view(&c).to_string()),
        None => json_error(StatusCode::NOT_FOUND, "circuit not found"),
    }
}

fn circuit_view(c: &Circuit) -> serde_json::Value {
    serde_json::json!({
        "identifier": c.identifier(),
        "open": c.is_open(),
        "failure_count": c.failure_count(),
        "failure_threshold": c.failure_threshold(),
        "retry_timeout_secs": c.retry_timeout().as_secs(),
        "last_failure_unix_ms": c.last_failure().map(|t| t.as_millis() as u64),
    })
}

fn json(status: StatusCode, body: String) -> Response<BoxBody> {
    response_with(status, "application/json", body)
}
