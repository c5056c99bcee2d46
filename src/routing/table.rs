use crate::config::UpstreamConfig;
use crate::upstream::Backend;
use http::{HeaderName, Method};
use std::sync::Arc;

/// A compiled upstream: what the proxy needs per request, parsed once at
/// startup. `name` doubles as the circuit identifier.
pub struct UpstreamRoute {
    pub name: String,
    pub prefix: String,
    pub strip_prefix: bool,
    pub methods: Vec<Method>,
    pub forward_headers: Vec<HeaderName>,
    pub api_key_header: HeaderName,
    pub max_body_bytes: Option<u64>,
    pub primary: Backend,
    pub fallback: Backend,
}

impl UpstreamRoute {
    pub fn from_config(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let methods = cfg
            .methods
            .iter()
            .map(|m| Method::from_bytes(m.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let forward_headers = cfg
            .forward_headers
            .iter()
            .map(|h| HeaderName::from_bytes(h.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: cfg.name.clone(),
            prefix: cfg.effective_prefix(),
            strip_prefix: cfg.strip_prefix,
            methods,
            forward_headers,
            api_key_header: HeaderName::from_bytes(cfg.api_key_header.as_bytes())?,
            max_body_bytes: cfg.max_body_bytes,
            primary: Backend::from_config("primary", &cfg.primary)?,
            fallback: Backend::from_config("fallback", &cfg.fallback)?,
        })
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    /// Prefix match on a segment boundary: `/openai` matches `/openai` and
    /// `/openai/v1` but not `/openai2`.
    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/'),
            None => false,
        }
    }

    /// Outbound path and query for an inbound one.
    pub fn forward_path(&self, path_and_query: &str) -> String {
        if !self.strip_prefix {
            return path_and_query.to_string();
        }
        let prefix = self.prefix.trim_end_matches('/');
        let rest = path_and_query.strip_prefix(prefix).unwrap_or(path_and_query);
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    }
}

/// Upstreams ordered by prefix length, longest first, so the most specific
/// prefix wins.
pub struct RouteTable {
    routes: Vec<Arc<UpstreamRoute>>,
}

impl RouteTable {
    pub fn new(upstreams: &[UpstreamConfig]) -> anyhow::Result<Self> {
        let mut routes = Vec::with_capacity(upstreams.len());
        for cfg in upstreams {
            let route = UpstreamRoute::from_config(cfg)
                .map_err(|e| anyhow::anyhow!("upstream '{}': {}", cfg.name, e))?;
            tracing::debug!(
                "routing: compiled upstream, name={}, prefix={}, strip_prefix={}, primary={}, fallback={}",
                route.name,
                route.prefix,
                route.strip_prefix,
                route.primary.base_url(),
                route.fallback.base_url(),
            );
            routes.push(Arc::new(route));
        }
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self { routes })
    }

    pub fn match_route(&self, path: &str) -> Option<Arc<UpstreamRoute>> {
        self.routes.iter().find(|r| r.matches(path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
