use crate::error::GatewayError;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// A response with the given status and content type.
pub fn response_with(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> hyper::Response<BoxBody> {
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

/// `{"error": msg}` with the given status.
pub fn json_error(status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
    let body = serde_json::json!({ "error": msg }).to_string();
    response_with(status, "application/json", body)
}

/// Per-request bookkeeping for metrics and the access log.
pub struct RequestContext {
    pub uri_path: String,
    pub method: String,
    /// Matched upstream name; empty until routing succeeds.
    pub upstream: String,
    /// `primary` or `fallback` once a backend answered; empty otherwise.
    pub served_by: &'static str,
    pub client_ip: IpAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(uri_path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            uri_path,
            method,
            upstream: String::new(),
            served_by: "",
            client_ip,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.finalize_metrics(status.as_u16());
        json_error(status, msg)
    }

    /// Error response whose status and message come from `err`.
    pub fn gateway_error_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        self.error_response(err.status_code(), &err.to_string())
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "upstream" => self.upstream.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "served_by" => self.served_by,
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "upstream" => self.upstream.clone(),
            "served_by" => self.served_by,
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "upstream" => self.upstream.clone(),
                "served_by" => self.served_by,
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        if !self.upstream.is_empty() {
            metrics::gauge!(
                "gateway_http_requests_in_flight",
                "upstream" => self.upstream.clone(),
            )
            .decrement(1.0);
        }
    }
}
