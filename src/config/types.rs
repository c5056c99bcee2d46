use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Reported by the admin `/version` endpoint.
    #[serde(default = "default_app_version")]
    pub app_version: String,

    /// Breaker defaults for every upstream without its own override.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstreams: Vec<UpstreamConfig>,
}

pub(crate) fn default_app_version() -> String {
    "UNKNOWN_VERSION".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive primary failures before the circuit opens.
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown after the most recent failure before the primary is probed.
    #[serde(default = "default_cb_retry_timeout")]
    pub retry_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_cb_failure_threshold(),
            retry_timeout_secs: default_cb_retry_timeout(),
        }
    }
}

fn default_cb_failure_threshold() -> u32 {
    3
}

fn default_cb_retry_timeout() -> u64 {
    10
}

/// One logical upstream: a primary and a fallback backend behind one circuit.
/// The upstream name is the circuit identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,

    /// Inbound path prefix. Empty means `/{name}`.
    #[serde(default)]
    pub prefix: String,

    /// Remove `prefix` from the path before forwarding. The full inbound
    /// path is forwarded by default.
    #[serde(default)]
    pub strip_prefix: bool,

    /// Allowed HTTP methods.
    #[serde(default = "default_methods", deserialize_with = "deserialize_methods")]
    pub methods: Vec<String>,

    /// Request headers copied to the backend. Everything else is dropped;
    /// some clients send more headers than backends accept.
    #[serde(default = "default_forward_headers")]
    pub forward_headers: Vec<String>,

    /// Header carrying the backend's API key.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Requests exceeding this limit are rejected with 413. `None` means no limit.
    #[serde(default)]
    pub max_body_bytes: Option<u64>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    pub primary: BackendConfig,

    pub fallback: BackendConfig,
}

impl UpstreamConfig {
    /// An upstream with defaults and empty backends, used when env vars
    /// describe an upstream that is absent from the file.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: String::new(),
            strip_prefix: false,
            methods: default_methods(),
            forward_headers: default_forward_headers(),
            api_key_header: default_api_key_header(),
            max_body_bytes: None,
            circuit_breaker: None,
            primary: BackendConfig::default(),
            fallback: BackendConfig::default(),
        }
    }

    pub fn effective_prefix(&self) -> String {
        if self.prefix.is_empty() {
            format!("/{}", self.name)
        } else {
            self.prefix.clone()
        }
    }

    pub fn effective_circuit_breaker<'a>(
        &'a self,
        defaults: &'a CircuitBreakerConfig,
    ) -> &'a CircuitBreakerConfig {
        self.circuit_breaker.as_ref().unwrap_or(defaults)
    }
}

fn default_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn deserialize_methods<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let methods: Vec<String> = deserialize_null_default(deserializer)?;
    if methods.is_empty() {
        return Ok(default_methods());
    }
    Ok(methods.into_iter().map(|m| m.to_ascii_uppercase()).collect())
}

fn default_forward_headers() -> Vec<String> {
    ["accept", "content-type", "accept-encoding"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_api_key_header() -> String {
    "api-key".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://primary.example.com`. A path component is
    /// kept and the request path is appended to it.
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub api_key: Option<Secret>,

    /// Whole-request deadline: connect, send and response headers.
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,

    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            tls_verify: default_tls_verify(),
            keepalive_pool: KeepalivePoolConfig::default(),
        }
    }
}

fn default_timeout() -> f64 {
    60.0
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_tls_verify() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            size: default_pool_size(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    64
}

/// A credential that never shows up in logs or the `/settings` endpoint.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

const REDACTED: &str = "**********";

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", REDACTED)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}
