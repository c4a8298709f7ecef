//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{GatekeeperError, Result};
use crate::throttle::{KeyStrategy, LockoutPolicy, Preset, RateLimiterConfig};

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Request rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Failed login lockout policy
    #[serde(default)]
    pub login_throttle: LockoutPolicy,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Take the client address from `X-Forwarded-For` when present
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_proxy_headers: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Limiter for paths no route matches
    #[serde(default = "default_limiter")]
    pub default: LimiterSpec,

    /// Limiters attached to path prefixes
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteRule>,

    /// Path prefixes that bypass rate limiting
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,

    /// How often idle keys are evicted
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default: default_limiter(),
            routes: default_routes(),
            skip_paths: default_skip_paths(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_limiter() -> LimiterSpec {
    LimiterSpec::preset("default", Preset::Default)
}

fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule {
            prefix: "/auth/".to_string(),
            limiter: LimiterSpec::preset("auth", Preset::Strict),
        },
        RouteRule {
            prefix: "/api/".to_string(),
            limiter: LimiterSpec::preset("api", Preset::Api),
        },
    ]
}

fn default_skip_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

fn default_sweep_interval() -> u64 {
    60 * 1000
}

/// One limiter as written in configuration.
///
/// Explicit `max_requests` / `window_ms` override the preset's values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSpec {
    /// Key namespace, unique per limiter
    pub name: String,

    #[serde(default)]
    pub preset: Option<Preset>,

    #[serde(default)]
    pub max_requests: Option<u32>,

    #[serde(default)]
    pub window_ms: Option<u64>,

    /// How requests are grouped into buckets
    #[serde(default)]
    pub key: KeyStrategy,
}

impl LimiterSpec {
    pub fn preset(name: &str, preset: Preset) -> Self {
        Self {
            name: name.to_string(),
            preset: Some(preset),
            max_requests: None,
            window_ms: None,
            key: KeyStrategy::default(),
        }
    }

    /// Resolve preset and overrides into a validated limiter policy.
    pub fn to_limiter_config(&self) -> Result<RateLimiterConfig> {
        let preset = self.preset.unwrap_or(Preset::Default);
        let config = RateLimiterConfig::new(
            self.name.clone(),
            self.max_requests.unwrap_or_else(|| preset.max_requests()),
            self.window_ms.unwrap_or_else(|| preset.window_ms()),
        )
        .with_key_strategy(self.key.clone());

        config.validate()?;
        Ok(config)
    }
}

/// A limiter attached to a path prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    pub limiter: LimiterSpec,
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional YAML file under `GATEKEEPER__*` environment variables.
    ///
    /// `GATEKEEPER__LOGIN_THROTTLE__MAX_ATTEMPTS=3` overrides
    /// `login_throttle.max_attempts`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: GatekeeperConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every policy without building anything.
    pub fn validate(&self) -> Result<()> {
        self.login_throttle.validate()?;

        if self.rate_limiting.sweep_interval_ms == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.sweep_interval_ms must be greater than 0".to_string(),
            ));
        }

        let mut min_window_ms = self.rate_limiting.default.to_limiter_config()?.window_ms;
        let mut names = vec![self.rate_limiting.default.name.as_str()];
        for route in &self.rate_limiting.routes {
            if !route.prefix.starts_with('/') {
                return Err(GatekeeperError::Config(format!(
                    "route prefix '{}' must start with '/'",
                    route.prefix
                )));
            }
            let limiter = route.limiter.to_limiter_config()?;
            min_window_ms = min_window_ms.min(limiter.window_ms);
            if names.contains(&route.limiter.name.as_str()) {
                return Err(GatekeeperError::Config(format!(
                    "duplicate limiter name '{}'",
                    route.limiter.name
                )));
            }
            names.push(route.limiter.name.as_str());
        }

        if self.rate_limiting.sweep_interval_ms > min_window_ms {
            return Err(GatekeeperError::Config(format!(
                "rate_limiting.sweep_interval_ms ({}) must not exceed the shortest limiter window ({})",
                self.rate_limiting.sweep_interval_ms, min_window_ms
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert!(!config.server.trust_proxy_headers);
        assert_eq!(config.rate_limiting.routes.len(), 2);
        assert_eq!(config.rate_limiting.skip_paths, vec!["/health"]);
        assert_eq!(config.login_throttle.max_attempts, 5);
        assert_ok!(config.validate());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = assert_ok!(GatekeeperConfig::from_yaml("{}"));
        assert_eq!(config.rate_limiting.default.name, "default");
        assert_eq!(config.rate_limiting.sweep_interval_ms, 60_000);
    }

    #[test]
    fn test_preset_overrides() {
        let spec: LimiterSpec = serde_yaml::from_str(
            r#"
name: api
preset: api
max_requests: 5
key:
  type: header
  name: x-api-key
"#,
        )
        .unwrap();
        let limiter = spec.to_limiter_config().unwrap();
        assert_eq!(limiter.max_requests, 5);
        assert_eq!(limiter.window_ms, 60_000);
        assert_eq!(
            spec.key,
            KeyStrategy::Header {
                name: "x-api-key".to_string()
            }
        );
    }

    #[test]
    fn test_login_throttle_section() {
        let yaml = r#"
login_throttle:
  max_attempts: 3
  base_lockout_ms: 60000
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.login_throttle.max_attempts, 3);
        assert_eq!(config.login_throttle.base_lockout_ms, 60_000);
        assert_eq!(config.login_throttle.escalation_cap, 8);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_window = r#"
rate_limiting:
  default:
    name: default
    window_ms: 0
"#;
        assert!(matches!(
            GatekeeperConfig::from_yaml(zero_window),
            Err(GatekeeperError::Config(_))
        ));

        let zero_attempts = "login_throttle:\n  max_attempts: 0\n";
        assert!(GatekeeperConfig::from_yaml(zero_attempts).is_err());

        let bad_prefix = r#"
rate_limiting:
  routes:
    - prefix: api
      limiter:
        name: api
"#;
        assert!(GatekeeperConfig::from_yaml(bad_prefix).is_err());

        let duplicate = r#"
rate_limiting:
  routes:
    - prefix: /a/
      limiter:
        name: default
"#;
        assert!(GatekeeperConfig::from_yaml(duplicate).is_err());
    }

    #[test]
    fn test_sweep_interval_bounded_by_shortest_window() {
        let too_slow = r#"
rate_limiting:
  sweep_interval_ms: 120000
"#;
        assert!(matches!(
            GatekeeperConfig::from_yaml(too_slow),
            Err(GatekeeperError::Config(_))
        ));

        let short_route = r#"
rate_limiting:
  sweep_interval_ms: 5000
  routes:
    - prefix: /api/
      limiter:
        name: api
        window_ms: 1000
"#;
        assert!(GatekeeperConfig::from_yaml(short_route).is_err());

        let matching = r#"
rate_limiting:
  sweep_interval_ms: 1000
  routes:
    - prefix: /api/
      limiter:
        name: api
        window_ms: 1000
"#;
        assert_ok!(GatekeeperConfig::from_yaml(matching));
    }

    #[test]
    fn test_load_layers_env_over_file() {
        let path = std::env::temp_dir().join(format!("gatekeeper-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "server:\n  http_addr: 0.0.0.0:9000\nlogin_throttle:\n  max_attempts: 7\n",
        )
        .unwrap();
        std::env::set_var("GATEKEEPER__LOGIN_THROTTLE__MAX_ATTEMPTS", "3");

        let config = GatekeeperConfig::load(Some(&path));

        std::env::remove_var("GATEKEEPER__LOGIN_THROTTLE__MAX_ATTEMPTS");
        std::fs::remove_file(&path).unwrap();

        let config = assert_ok!(config);
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.login_throttle.max_attempts, 3);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            GatekeeperConfig::from_file("/nonexistent/gatekeeper.yaml"),
            Err(GatekeeperError::Io(_))
        ));
    }
}
