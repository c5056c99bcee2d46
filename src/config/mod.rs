pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

/// Upstream targeted by the `FAILOVER_PRIMARY_*` / `FAILOVER_FALLBACK_*`
/// variables unless `FAILOVER_UPSTREAM_NAME` says otherwise.
pub const DEFAULT_ENV_UPSTREAM: &str = "openai";

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used and the environment must describe at least one upstream.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            upstreams = config.upstreams.len(),
            failure_threshold = config.circuit_breaker.failure_threshold,
            retry_timeout_secs = config.circuit_breaker.retry_timeout_secs,
            "loaded gateway configuration"
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `FAILOVER_*` overrides read through `lookup`.
    ///
    /// Host and API key variables target a single upstream (named by
    /// `FAILOVER_UPSTREAM_NAME`, default `openai`), which is created when the
    /// file does not define it.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FAILOVER_APP_VERSION") {
            self.app_version = v;
        }

        // Circuit breaker defaults
        if let Some(v) = lookup("FAILOVER_CIRCUIT_FAILURE_THRESHOLD") {
            match v.trim().parse::<u32>() {
                Ok(n) => self.circuit_breaker.failure_threshold = n,
                Err(_) => tracing::warn!(
                    "config: ignoring FAILOVER_CIRCUIT_FAILURE_THRESHOLD, not an integer: {}",
                    v
                ),
            }
        }
        if let Some(v) = lookup("FAILOVER_CIRCUIT_RETRY_TIMEOUT") {
            match v.trim().parse::<u64>() {
                Ok(n) => self.circuit_breaker.retry_timeout_secs = n,
                Err(_) => tracing::warn!(
                    "config: ignoring FAILOVER_CIRCUIT_RETRY_TIMEOUT, not an integer: {}",
                    v
                ),
            }
        }

        // Backends
        let primary_host = lookup("FAILOVER_PRIMARY_HOST");
        let primary_key = lookup("FAILOVER_PRIMARY_API_KEY");
        let fallback_host = lookup("FAILOVER_FALLBACK_HOST");
        let fallback_key = lookup("FAILOVER_FALLBACK_API_KEY");

        if primary_host.is_none()
            && primary_key.is_none()
            && fallback_host.is_none()
            && fallback_key.is_none()
        {
            return;
        }

        let name = lookup("FAILOVER_UPSTREAM_NAME")
            .unwrap_or_else(|| DEFAULT_ENV_UPSTREAM.to_string());
        let idx = match self.upstreams.iter().position(|u| u.name == name) {
            Some(idx) => idx,
            None => {
                self.upstreams.push(UpstreamConfig::named(&name));
                self.upstreams.len() - 1
            }
        };
        let upstream = &mut self.upstreams[idx];

        if let Some(v) = primary_host {
            upstream.primary.url = v;
        }
        if let Some(v) = primary_key {
            upstream.primary.api_key = Some(Secret::new(v));
        }
        if let Some(v) = fallback_host {
            upstream.fallback.url = v;
        }
        if let Some(v) = fallback_key {
            upstream.fallback.api_key = Some(Secret::new(v));
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_circuit_breaker("circuit_breaker", &self.circuit_breaker)?;

        if self.upstreams.is_empty() {
            anyhow::bail!(
                "no upstreams configured; define [[upstreams]] or set FAILOVER_PRIMARY_HOST and FAILOVER_FALLBACK_HOST"
            );
        }

        let mut names: HashSet<&str> = HashSet::new();
        let mut prefixes: HashSet<String> = HashSet::new();

        for upstream in &self.upstreams {
            if upstream.name.is_empty() {
                anyhow::bail!("upstream has an empty name");
            }
            if !names.insert(upstream.name.as_str()) {
                anyhow::bail!("duplicate upstream name '{}'", upstream.name);
            }

            let prefix = upstream.effective_prefix();
            if !prefix.starts_with('/') {
                anyhow::bail!(
                    "upstream '{}': prefix '{}' must start with '/'",
                    upstream.name, prefix
                );
            }
            if !prefixes.insert(prefix.clone()) {
                anyhow::bail!(
                    "upstream '{}': prefix '{}' is already used by another upstream",
                    upstream.name, prefix
                );
            }

            for method in &upstream.methods {
                if http::Method::from_bytes(method.as_bytes()).is_err() {
                    anyhow::bail!("upstream '{}': invalid method '{}'", upstream.name, method);
                }
            }
            for header in upstream
                .forward_headers
                .iter()
                .chain(std::iter::once(&upstream.api_key_header))
            {
                if http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                    anyhow::bail!("upstream '{}': invalid header name '{}'", upstream.name, header);
                }
            }

            if let Some(ref cb) = upstream.circuit_breaker {
                validate_circuit_breaker(&format!("upstream '{}'", upstream.name), cb)?;
            }

            validate_backend(&upstream.name, "primary", &upstream.primary)?;
            validate_backend(&upstream.name, "fallback", &upstream.fallback)?;
        }
        Ok(())
    }
}

fn validate_circuit_breaker(scope: &str, cb: &CircuitBreakerConfig) -> Result<()> {
    if cb.failure_threshold == 0 {
        anyhow::bail!("{}: failure_threshold must be greater than 0", scope);
    }
    if cb.retry_timeout_secs == 0 {
        anyhow::bail!("{}: retry_timeout_secs must be greater than 0", scope);
    }
    Ok(())
}

fn validate_backend(upstream: &str, role: &str, backend: &BackendConfig) -> Result<()> {
    if backend.url.is_empty() {
        anyhow::bail!("upstream '{}': {} url is not set", upstream, role);
    }
    let uri: http::Uri = backend.url.parse().map_err(|e| {
        anyhow::anyhow!("upstream '{}': invalid {} url '{}': {}", upstream, role, backend.url, e)
    })?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => anyhow::bail!(
            "upstream '{}': {} url '{}' must use http or https",
            upstream,
            role,
            backend.url
        ),
    }
    if uri.host().map_or(true, str::is_empty) {
        anyhow::bail!("upstream '{}': {} url '{}' has no host", upstream, role, backend.url);
    }
    if !is_positive(backend.timeout_secs) || !is_positive(backend.connect_timeout_secs) {
        anyhow::bail!("upstream '{}': {} timeouts must be greater than 0", upstream, role);
    }
    Ok(())
}

fn is_positive(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            app_version: types::default_app_version(),
            circuit_breaker: CircuitBreakerConfig::default(),
            upstreams: Vec::new(),
        }
    }
}
