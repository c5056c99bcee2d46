use crate::config::{BackendConfig, KeepalivePoolConfig};
use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody};
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

/// A rustls `ServerCertVerifier` that accepts any certificate without validation.
/// Used when `tls_verify = false`, for backends behind self-signed certificates.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The parts of an inbound request that are replayed to each backend.
///
/// The body is buffered so the same request can go to the primary and then
/// to the fallback.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path and query, already stripped of the route prefix if configured.
    pub path_and_query: String,
    /// Allowlisted request headers.
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One outbound target: base URL, credential and a pooled client.
pub struct Backend {
    role: &'static str,
    base_url: String,
    host: HeaderValue,
    api_key: Option<HeaderValue>,
    timeout: Duration,
    http_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

impl Backend {
    /// `role` is `primary` or `fallback` and only shows up in logs.
    pub fn from_config(role: &'static str, config: &BackendConfig) -> anyhow::Result<Self> {
        let base_url = config.url.trim_end_matches('/').to_string();
        let uri: http::Uri = base_url.parse()?;
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow::anyhow!("{} url '{}' has no host", role, config.url))?;
        let host = HeaderValue::from_str(authority.as_str())?;

        let api_key = match config.api_key {
            Some(ref secret) => {
                let mut value = HeaderValue::from_str(secret.expose())
                    .map_err(|_| anyhow::anyhow!("{} api key is not a valid header value", role))?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        Ok(Self {
            role,
            base_url,
            host,
            api_key,
            timeout: Duration::from_secs_f64(config.timeout_secs),
            http_client: build_backend_http_client(
                &config.keepalive_pool,
                config.tls_verify,
                config.connect_timeout_secs,
            ),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full outbound URL for a path and query.
    pub fn target_url(&self, path_and_query: &str) -> String {
        let mut url = String::with_capacity(self.base_url.len() + path_and_query.len());
        url.push_str(&self.base_url);
        url.push_str(path_and_query);
        url
    }

    /// Send `req` to this backend. Any status is returned as a response;
    /// only transport failures and the deadline become errors.
    pub async fn send(
        &self,
        req: &ForwardRequest,
        api_key_header: &HeaderName,
    ) -> Result<Response<Incoming>, GatewayError> {
        let url = self.target_url(&req.path_and_query);

        let mut builder = Request::builder().method(req.method.clone()).uri(&url);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(req.headers.clone());
            headers.insert(HOST, self.host.clone());
            if let Some(ref key) = self.api_key {
                headers.insert(api_key_header.clone(), key.clone());
            }
        }
        let upstream_req = builder
            .body(full_body(req.body.clone()))
            .map_err(|e| GatewayError::Internal(format!("failed to build request: {}", e)))?;

        match tokio::time::timeout(self.timeout, self.http_client.request(upstream_req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                tracing::warn!(
                    "upstream: request failed, backend={}, url={}, error={}",
                    self.role,
                    url,
                    e
                );
                Err(GatewayError::UpstreamConnect(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    "upstream: request timed out, backend={}, url={}, timeout={:?}",
                    self.role,
                    url,
                    self.timeout
                );
                Err(GatewayError::UpstreamTimeout)
            }
        }
    }
}

/// Build a hyper `Client` for both `http://` and `https://` backends.
/// HTTP/2 is negotiated via ALPN on TLS connections; plain connections stay
/// on HTTP/1.1.
fn build_backend_http_client(
    pool_cfg: &KeepalivePoolConfig,
    tls_verify: bool,
    connect_timeout_secs: f64,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(pool_cfg.idle_timeout)));
    http.set_connect_timeout(Some(Duration::from_secs_f64(connect_timeout_secs)));
    http.enforce_http(false);

    let https = if tls_verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool_cfg.idle_timeout))
        .pool_max_idle_per_host(pool_cfg.size)
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    fn config(url: &str) -> BackendConfig {
        BackendConfig {
            url: url.to_string(),
            ..BackendConfig::default()
        }
    }

    fn forward(path: &str) -> ForwardRequest {
        ForwardRequest {
            method: Method::GET,
            path_and_query: path.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn target_url_trims_trailing_slash() {
        let backend = Backend::from_config("primary", &config("https://api.example.com/")).unwrap();
        assert_eq!(backend.base_url(), "https://api.example.com");
        assert_eq!(
            backend.target_url("/openai/v1/chat?x=1"),
            "https://api.example.com/openai/v1/chat?x=1"
        );
    }

    #[tokio::test]
    async fn base_path_is_kept() {
        let backend =
            Backend::from_config("fallback", &config("http://10.0.0.1:8080/base/")).unwrap();
        assert_eq!(backend.target_url("/v1"), "http://10.0.0.1:8080/base/v1");
        assert_eq!(backend.host, "10.0.0.1:8080");
        assert_eq!(backend.role, "fallback");
    }

    #[tokio::test]
    async fn timeout_from_config() {
        let mut cfg = config("http://a.internal");
        cfg.timeout_secs = 2.5;
        let backend = Backend::from_config("primary", &cfg).unwrap();
        assert_eq!(backend.timeout, Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn missing_host_is_rejected() {
        assert!(Backend::from_config("primary", &config("/only/a/path")).is_err());
    }

    #[tokio::test]
    async fn invalid_api_key_is_rejected() {
        let mut cfg = config("http://a.internal");
        cfg.api_key = Some(Secret::new("bad\nkey"));
        let err = Backend::from_config("primary", &cfg).err().unwrap();
        assert!(!err.to_string().contains("bad\nkey"));
    }

    #[tokio::test]
    async fn insecure_client_builds() {
        let mut cfg = config("https://self-signed.internal");
        cfg.tls_verify = false;
        assert!(Backend::from_config("primary", &cfg).is_ok());
    }

    #[tokio::test]
    async fn connection_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = Backend::from_config("primary", &config(&format!("http://{}", addr))).unwrap();
        let header = HeaderName::from_static("api-key");
        let err = backend.send(&forward("/"), &header).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamConnect(_)));
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        // Accepted by the kernel backlog but never answered.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut cfg = config(&format!("http://{}", addr));
        cfg.timeout_secs = 0.2;
        let backend = Backend::from_config("primary", &cfg).unwrap();
        let header = HeaderName::from_static("api-key");
        let err = backend.send(&forward("/"), &header).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTimeout));
        drop(listener);
    }
}
