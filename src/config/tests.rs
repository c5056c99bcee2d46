use super::types::*;
use super::GatewayConfig;
use std::collections::HashMap;
use std::path::Path;

fn backend(url: &str) -> BackendConfig {
    BackendConfig {
        url: url.to_string(),
        ..BackendConfig::default()
    }
}

fn upstream(name: &str) -> UpstreamConfig {
    UpstreamConfig {
        primary: backend("http://primary.internal"),
        fallback: backend("http://fallback.internal:8443/base"),
        ..UpstreamConfig::named(name)
    }
}

fn config_with(upstreams: Vec<UpstreamConfig>) -> GatewayConfig {
    GatewayConfig {
        upstreams,
        ..GatewayConfig::default()
    }
}

fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_load_toml_config() {
    let cfg = GatewayConfig::load(Path::new("config.toml")).unwrap();
    assert_eq!(cfg.upstreams.len(), 1);
    assert_eq!(cfg.upstreams[0].name, "openai");
    assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "app_version": "1.2.3",
        "circuit_breaker": { "failure_threshold": 5, "retry_timeout_secs": 30 },
        "upstreams": [{
            "name": "openai",
            "primary": { "url": "http://127.0.0.1:8081", "api_key": "k1" },
            "fallback": { "url": "http://127.0.0.1:8082" }
        }]
    }"#;
    let tmp = std::env::temp_dir().join("failover_gateway_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.app_version, "1.2.3");
    assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
    assert_eq!(cfg.circuit_breaker.retry_timeout_secs, 30);
    let up = &cfg.upstreams[0];
    assert_eq!(up.effective_prefix(), "/openai");
    assert_eq!(up.primary.api_key.as_ref().map(Secret::expose), Some("k1"));
    assert!(up.fallback.api_key.is_none());
}

#[test]
fn test_unsupported_extension_fails() {
    let tmp = std::env::temp_dir().join("failover_gateway_test_config.yaml");
    std::fs::write(&tmp, "upstreams: []").unwrap();
    let result = GatewayConfig::load(&tmp);
    std::fs::remove_file(&tmp).ok();
    assert!(result.is_err());
}

#[test]
fn test_upstream_defaults_from_toml() {
    let cfg: GatewayConfig = toml::from_str(
        r#"
        [[upstreams]]
        name = "openai"
        methods = ["get", "post"]
        [upstreams.primary]
        url = "https://a.example.com"
        [upstreams.fallback]
        url = "https://b.example.com"
        "#,
    )
    .unwrap();

    assert_eq!(cfg.app_version, "UNKNOWN_VERSION");
    assert_eq!(cfg.circuit_breaker, CircuitBreakerConfig::default());
    let up = &cfg.upstreams[0];
    assert_eq!(up.methods, vec!["GET", "POST"]);
    assert_eq!(up.forward_headers, vec!["accept", "content-type", "accept-encoding"]);
    assert_eq!(up.api_key_header, "api-key");
    assert!(!up.strip_prefix);
    assert!(up.primary.tls_verify);
    assert_eq!(up.primary.timeout_secs, 60.0);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_null_methods_fall_back_to_defaults() {
    let cfg: GatewayConfig = serde_json::from_str(
        r#"{"upstreams": [{
            "name": "a", "methods": null,
            "primary": {"url": "http://a"}, "fallback": {"url": "http://b"}
        }]}"#,
    )
    .unwrap();
    assert_eq!(cfg.upstreams[0].methods, vec!["GET", "POST", "PUT", "DELETE"]);
}

#[test]
fn test_effective_circuit_breaker_override() {
    let defaults = CircuitBreakerConfig::default();
    let mut up = upstream("openai");
    assert_eq!(up.effective_circuit_breaker(&defaults), &defaults);

    let custom = CircuitBreakerConfig {
        failure_threshold: 9,
        retry_timeout_secs: 1,
    };
    up.circuit_breaker = Some(custom.clone());
    assert_eq!(up.effective_circuit_breaker(&defaults), &custom);
}

#[test]
fn test_env_overrides_create_upstream() {
    let mut cfg = GatewayConfig::default();
    cfg.apply_overrides_from(env(&[
        ("FAILOVER_APP_VERSION", "2.0.0"),
        ("FAILOVER_CIRCUIT_FAILURE_THRESHOLD", "4"),
        ("FAILOVER_CIRCUIT_RETRY_TIMEOUT", "20"),
        ("FAILOVER_PRIMARY_HOST", "https://primary.example.com"),
        ("FAILOVER_PRIMARY_API_KEY", "primary-key"),
        ("FAILOVER_FALLBACK_HOST", "https://fallback.example.com"),
        ("FAILOVER_FALLBACK_API_KEY", "fallback-key"),
    ]));

    assert_eq!(cfg.app_version, "2.0.0");
    assert_eq!(cfg.circuit_breaker.failure_threshold, 4);
    assert_eq!(cfg.circuit_breaker.retry_timeout_secs, 20);
    assert_eq!(cfg.upstreams.len(), 1);
    let up = &cfg.upstreams[0];
    assert_eq!(up.name, "openai");
    assert_eq!(up.effective_prefix(), "/openai");
    assert_eq!(up.primary.url, "https://primary.example.com");
    assert_eq!(up.primary.api_key, Some(Secret::new("primary-key")));
    assert_eq!(up.fallback.url, "https://fallback.example.com");
    assert_eq!(up.fallback.api_key, Some(Secret::new("fallback-key")));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_env_overrides_target_existing_upstream() {
    let mut cfg = config_with(vec![upstream("openai"), upstream("search")]);
    cfg.apply_overrides_from(env(&[
        ("FAILOVER_UPSTREAM_NAME", "search"),
        ("FAILOVER_FALLBACK_HOST", "http://other-fallback"),
    ]));

    assert_eq!(cfg.upstreams.len(), 2);
    assert_eq!(cfg.upstreams[0].fallback.url, "http://fallback.internal:8443/base");
    assert_eq!(cfg.upstreams[1].fallback.url, "http://other-fallback");
    assert_eq!(cfg.upstreams[1].primary.url, "http://primary.internal");
}

#[test]
fn test_env_invalid_numbers_are_ignored() {
    let mut cfg = GatewayConfig::default();
    cfg.apply_overrides_from(env(&[
        ("FAILOVER_CIRCUIT_FAILURE_THRESHOLD", "many"),
        ("FAILOVER_CIRCUIT_RETRY_TIMEOUT", "-1"),
    ]));
    assert_eq!(cfg.circuit_breaker, CircuitBreakerConfig::default());
    assert!(cfg.upstreams.is_empty());
}

#[test]
fn test_validate_valid_config() {
    assert!(config_with(vec![upstream("openai")]).validate().is_ok());
}

#[test]
fn test_validate_no_upstreams_fails() {
    assert!(GatewayConfig::default().validate().is_err());
}

#[test]
fn test_validate_duplicate_name_fails() {
    let mut second = upstream("openai");
    second.prefix = "/other".into();
    assert!(config_with(vec![upstream("openai"), second]).validate().is_err());
}

#[test]
fn test_validate_duplicate_prefix_fails() {
    let mut second = upstream("search");
    second.prefix = "/openai".into();
    assert!(config_with(vec![upstream("openai"), second]).validate().is_err());
}

#[test]
fn test_validate_prefix_without_slash_fails() {
    let mut up = upstream("openai");
    up.prefix = "openai".into();
    assert!(config_with(vec![up]).validate().is_err());
}

#[test]
fn test_validate_missing_fallback_url_fails() {
    let mut up = upstream("openai");
    up.fallback.url = String::new();
    let err = config_with(vec![up]).validate().unwrap_err();
    assert!(err.to_string().contains("fallback url is not set"));
}

#[test]
fn test_validate_non_http_url_fails() {
    let mut up = upstream("openai");
    up.primary.url = "ftp://primary.internal".into();
    assert!(config_with(vec![up]).validate().is_err());

    let mut up = upstream("openai");
    up.primary.url = "/relative/only".into();
    assert!(config_with(vec![up]).validate().is_err());
}

#[test]
fn test_validate_zero_threshold_fails() {
    let mut cfg = config_with(vec![upstream("openai")]);
    cfg.circuit_breaker.failure_threshold = 0;
    assert!(cfg.validate().is_err());

    let mut up = upstream("openai");
    up.circuit_breaker = Some(CircuitBreakerConfig {
        failure_threshold: 3,
        retry_timeout_secs: 0,
    });
    assert!(config_with(vec![up]).validate().is_err());
}

#[test]
fn test_validate_bad_timeout_fails() {
    let mut up = upstream("openai");
    up.primary.timeout_secs = 0.0;
    assert!(config_with(vec![up]).validate().is_err());

    let mut up = upstream("openai");
    up.fallback.connect_timeout_secs = f64::NAN;
    assert!(config_with(vec![up]).validate().is_err());
}

#[test]
fn test_validate_bad_method_and_header_fail() {
    let mut up = upstream("openai");
    up.methods = vec!["GE T".into()];
    assert!(config_with(vec![up]).validate().is_err());

    let mut up = upstream("openai");
    up.forward_headers = vec!["bad header".into()];
    assert!(config_with(vec![up]).validate().is_err());
}

#[test]
fn test_secret_is_redacted() {
    let secret = Secret::new("sk-very-secret");
    assert_eq!(format!("{:?}", secret), "Secret(**********)");
    assert_eq!(serde_json::to_string(&secret).unwrap(), r#""**********""#);
    assert_eq!(secret.expose(), "sk-very-secret");

    let mut up = upstream("openai");
    up.primary.api_key = Some(secret);
    let rendered = serde_json::to_string(&up).unwrap();
    assert!(!rendered.contains("sk-very-secret"));
}
