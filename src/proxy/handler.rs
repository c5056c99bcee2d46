use crate::error::{is_upstream_fault, GatewayError};
use crate::proxy::context::{response_with, BoxBody, RequestContext};
use crate::routing::UpstreamRoute;
use crate::server::GatewayState;
use crate::upstream::{FailoverError, ForwardRequest};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

/// A backend response tagged with the backend that produced it.
type Served = (Response<Incoming>, &'static str);

/// Handle an inbound request:
///
/// 1. ROUTE_MATCH  longest path prefix, or the built-in liveness paths
/// 2. VALIDATE     method allowlist and body size
/// 3. FAILOVER     primary under the upstream's circuit, fallback otherwise
/// 4. LOG          metrics and access log
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let uri_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    // Left-most X-Forwarded-For entry when present (a trusted proxy in
    // front), otherwise the TCP peer.
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let mut ctx = RequestContext::new(uri_path, method, client_ip);

    let route = match state.routes.match_route(&ctx.uri_path) {
        Some(r) => r,
        None => return Ok(phase_no_route(&ctx)),
    };

    ctx.upstream = route.name.clone();
    metrics::gauge!(
        "gateway_http_requests_in_flight",
        "upstream" => ctx.upstream.clone(),
    )
    .increment(1.0);

    if !route.allows_method(req.method()) {
        debug!(
            "proxy: method not allowed, method={}, upstream={}",
            ctx.method, ctx.upstream
        );
        return Ok(ctx.error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    let fwd = match phase_buffer_request(req, &ctx, &route).await {
        Ok(fwd) => fwd,
        Err(resp) => return Ok(resp),
    };

    ctx.upstream_start = Some(Instant::now());
    let result = state
        .executor
        .execute(
            &route.name,
            || forward_primary(&route, &fwd),
            || forward_fallback(&route, &fwd),
        )
        .await;

    match result {
        Ok((resp, served_by)) => {
            ctx.served_by = served_by;
            let final_resp = build_downstream_response(resp);
            phase_log(&ctx, &final_resp);
            Ok(final_resp)
        }
        Err(FailoverError::CircuitNotFound(id)) => {
            let err = GatewayError::CircuitNotFound(id);
            Ok(ctx.error_response(err.status_code(), &err.to_string()))
        }
        Err(FailoverError::Fallback(e)) => {
            ctx.served_by = "fallback";
            warn!(
                "proxy: fallback failed, upstream={}, path={}, error={}",
                ctx.upstream, ctx.uri_path, e
            );
            Ok(ctx.error_response(fallback_failure_status(&e), &e.to_string()))
        }
    }
}

fn phase_no_route(ctx: &RequestContext) -> Response<BoxBody> {
    // Liveness for load balancers probing the proxy port.
    if ctx.uri_path == "/" || ctx.uri_path == "/status" {
        return response_with(StatusCode::OK, "text/plain", "OK");
    }

    debug!("proxy: no route matched, uri={}", ctx.uri_path);
    ctx.error_response(StatusCode::NOT_FOUND, "not found")
}

/// Buffer the body so it can be replayed to the fallback, enforcing
/// `max_body_bytes` on both the declared and the actual size.
#[allow(clippy::result_large_err)]
async fn phase_buffer_request(
    req: Request<Incoming>,
    ctx: &RequestContext,
    route: &UpstreamRoute,
) -> Result<ForwardRequest, Response<BoxBody>> {
    if let Some(max_bytes) = route.max_body_bytes {
        if let Some(cl) = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if cl > max_bytes {
                debug!(
                    "proxy: request body too large, content_length={}, max={}, upstream={}",
                    cl, max_bytes, ctx.upstream
                );
                return Err(ctx.error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
            }
        }
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let path_and_query = route.forward_path(path_and_query);
    let headers = select_forward_headers(req.headers(), &route.forward_headers);
    let (parts, body) = req.into_parts();

    let body: Bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(
                "proxy: failed to read request body, upstream={}, error={}",
                ctx.upstream, e
            );
            return Err(ctx.gateway_error_response(&GatewayError::BadRequest(
                "failed to read request body".to_string(),
            )));
        }
    };
    if let Some(max) = route.max_body_bytes {
        if body.len() as u64 > max {
            debug!(
                "proxy: buffered body too large, size={}, max={}, upstream={}",
                body.len(),
                max,
                ctx.upstream
            );
            return Err(ctx.error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
        }
    }

    Ok(ForwardRequest {
        method: parts.method,
        path_and_query,
        headers,
        body,
    })
}

/// A 429 or 5xx from the primary is a failure for its circuit.
async fn forward_primary(route: &UpstreamRoute, fwd: &ForwardRequest) -> Result<Served, GatewayError> {
    let resp = route.primary.send(fwd, &route.api_key_header).await?;
    let status = resp.status();
    if is_upstream_fault(status) {
        debug!(
            "proxy: primary returned status {}, upstream={}",
            status.as_u16(),
            route.name
        );
        return Err(GatewayError::UpstreamStatus(status.as_u16()));
    }
    Ok((resp, "primary"))
}

/// The fallback is the last tier: any status is returned as-is.
async fn forward_fallback(route: &UpstreamRoute, fwd: &ForwardRequest) -> Result<Served, GatewayError> {
    let resp = route.fallback.send(fwd, &route.api_key_header).await?;
    Ok((resp, "fallback"))
}

fn fallback_failure_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Copy only the allowlisted headers, keeping repeated values.
fn select_forward_headers(headers: &HeaderMap, allowed: &[HeaderName]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(allowed.len());
    for name in allowed {
        for value in headers.get_all(name) {
            out.append(name.clone(), value.clone());
        }
    }
    remove_hop_headers(&mut out);
    out
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

fn phase_log(ctx: &RequestContext, resp: &Response<BoxBody>) {
    let resp_status = resp.status().as_u16();

    if let Some(cl) = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
    {
        metrics::histogram!(
            "gateway_http_response_size_bytes",
            "upstream" => ctx.upstream.clone(),
            "served_by" => ctx.served_by,
        )
        .record(cl);
    }

    ctx.finalize_metrics(resp_status);

    let total_ms = ctx.start.elapsed().as_millis();
    let upstream_ms = ctx
        .upstream_start
        .map(|t| t.elapsed().as_millis())
        .unwrap_or_default();

    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.uri_path,
        status = resp_status,
        upstream = %ctx.upstream,
        served_by = ctx.served_by,
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );
}
