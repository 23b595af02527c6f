use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, net::SocketAddr, time::Duration};
use crate::{
    error::{GovernanceError, Result},
    utils::Unit,
};

/// Top-level configuration, loaded once at process start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Sliding-window admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window (N)
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in seconds (W)
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Paths that bypass rate limiting entirely
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    /// Per-route overrides, keyed by path prefix
    #[serde(default)]
    pub route_limits: HashMap<String, RouteLimitSpec>,

    /// Prefix of the ledger keys in the backend
    #[serde(default = "default_ledger_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
            exempt_paths: default_exempt_paths(),
            route_limits: HashMap::new(),
            key_prefix: default_ledger_prefix(),
        }
    }
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_seconds() -> u64 {
    60
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/".to_string(), "/favicon.ico".to_string()]
}

fn default_ledger_prefix() -> String {
    "rate_limit".to_string()
}

impl RateLimitConfig {
    /// The global limit.
    pub fn default_limit(&self) -> RouteLimit {
        RouteLimit {
            max_requests: self.max_requests,
            window_seconds: self.window_seconds,
        }
    }

    /// Whether a request path bypasses rate limiting.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| p == path)
    }

    /// Compile the route overrides, validating every expression.
    pub fn compile_routes(&self) -> Result<RouteLimits> {
        let mut routes = Vec::with_capacity(self.route_limits.len());
        for (route, spec) in &self.route_limits {
            if !route.starts_with('/') {
                return Err(GovernanceError::Config(format!(
                    "route limit path '{}' must start with '/'",
                    route
                )));
            }
            routes.push((route.trim_end_matches('/').to_string(), spec.to_limit()?));
        }
        // Longest prefix first so lookups can stop at the first hit.
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Ok(RouteLimits { routes })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(GovernanceError::Config(
                "rate_limit.max_requests must be greater than zero".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(GovernanceError::Config(
                "rate_limit.window_seconds must be greater than zero".to_string(),
            ));
        }
        self.compile_routes().map(|_| ())
    }
}

/// A resolved `N requests per W seconds` limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLimit {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RouteLimit {
    /// Parse a limit expression like `100/minute` or `5/30s`.
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            GovernanceError::Config(format!("invalid limit '{}': {}", expr, reason))
        };

        let (count, period) = expr
            .split_once('/')
            .ok_or_else(|| invalid("expected '<count>/<period>'"))?;
        let max_requests: u32 = count
            .trim()
            .parse()
            .map_err(|_| invalid("count is not a number"))?;

        let period = period.trim();
        let digits = period.chars().take_while(|c| c.is_ascii_digit()).count();
        let multiplier: u64 = if digits == 0 {
            1
        } else {
            period[..digits]
                .parse()
                .map_err(|_| invalid("period multiplier is not a number"))?
        };
        let unit: Unit = period[digits..].parse().map_err(|e: String| invalid(&e))?;

        let window_seconds = multiplier
            .checked_mul(unit.to_seconds())
            .ok_or_else(|| invalid("period is too long"))?;
        let limit = Self {
            max_requests,
            window_seconds,
        };
        if limit.max_requests == 0 || limit.window_seconds == 0 {
            return Err(invalid("count and period must be greater than zero"));
        }
        Ok(limit)
    }
}

impl fmt::Display for RouteLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.max_requests, self.window_seconds)
    }
}

/// Route limit as written in configuration: either `"10/minute"` or an
/// explicit `{max_requests, window_seconds}` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteLimitSpec {
    Expression(String),
    Explicit(RouteLimit),
}

impl RouteLimitSpec {
    pub fn to_limit(&self) -> Result<RouteLimit> {
        match self {
            RouteLimitSpec::Expression(expr) => RouteLimit::parse(expr),
            RouteLimitSpec::Explicit(limit) if limit.max_requests > 0 && limit.window_seconds > 0 => {
                Ok(*limit)
            }
            RouteLimitSpec::Explicit(limit) => Err(GovernanceError::Config(format!(
                "route limit {} must have a non-zero count and window",
                limit
            ))),
        }
    }
}

/// Route → limit registry consulted before the global limit.
#[derive(Debug, Clone, Default)]
pub struct RouteLimits {
    routes: Vec<(String, RouteLimit)>,
}

impl RouteLimits {
    /// Find the override for a request path. The longest matching prefix wins;
    /// a prefix only matches on a path segment boundary.
    pub fn resolve(&self, path: &str) -> Option<(&str, RouteLimit)> {
        self.routes
            .iter()
            .find(|(route, _)| {
                route.is_empty()
                    || path == route
                    || path
                        .strip_prefix(route.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(|(route, limit)| (route.as_str(), *limit))
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

/// Cache TTLs and behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_domain_cache_ttl")]
    pub domain_ttl_secs: u64,

    /// Coalesce concurrent misses for the same key inside this process
    #[serde(default)]
    pub single_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            domain_ttl_secs: default_domain_cache_ttl(),
            single_flight: false,
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_domain_cache_ttl() -> u64 {
    86400
}

/// Which store serves the cache and the shared ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

/// Connection parameters for the networked backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    #[serde(default = "default_backend_url")]
    pub url: String,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            url: default_backend_url(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl BackendConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Redis
}

fn default_backend_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    100
}

/// Credential verification settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_secret_key")]
    pub secret_key: String,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: default_secret_key(),
            algorithm: default_algorithm(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret_key", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

fn default_secret_key() -> String {
    "your-super-secret-key-change-in-production".to_string()
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

impl GovernanceConfig {
    /// Layered load: built-in defaults, then the optional file, then
    /// `GOVERNANCE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GOVERNANCE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("rate_limit.exempt_paths"),
        );

        let config: GovernanceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GovernanceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GovernanceError::Config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;
        if self.backend.probe_timeout_ms == 0 || self.backend.command_timeout_ms == 0 {
            return Err(GovernanceError::Config(
                "backend timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_settings() {
        let config = GovernanceConfig::default();
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window_seconds, 60);
        assert_eq!(config.cache.default_ttl_secs, 3600);
        assert_eq!(config.cache.domain_ttl_secs, 86400);
        assert!(config.rate_limit.is_exempt("/health"));
        assert!(!config.rate_limit.is_exempt("/api/v1/pca"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_yaml() {
        let yaml = r#"
rate_limit:
  max_requests: 3
  window_seconds: 60
  exempt_paths: ["/health"]
  route_limits:
    /api/v1/contratacoes: "10/minute"
    /api/v1/contratacoes/sync:
      max_requests: 5
      window_seconds: 60
backend:
  kind: memory
cache:
  single_flight: true
"#;

        let config = GovernanceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert!(config.cache.single_flight);
        assert_eq!(config.cache.default_ttl_secs, 3600);

        let routes = config.rate_limit.compile_routes().unwrap();
        assert_eq!(routes.len(), 2);
        let (route, limit) = routes.resolve("/api/v1/contratacoes/sync").unwrap();
        assert_eq!(route, "/api/v1/contratacoes/sync");
        assert_eq!(limit.max_requests, 5);
        let (route, limit) = routes.resolve("/api/v1/contratacoes/42").unwrap();
        assert_eq!(route, "/api/v1/contratacoes");
        assert_eq!(limit, RouteLimit { max_requests: 10, window_seconds: 60 });
    }

    #[test]
    fn test_route_resolution_respects_segments() {
        let mut config = RateLimitConfig::default();
        config
            .route_limits
            .insert("/api/v1/ata".to_string(), RouteLimitSpec::Expression("1/second".into()));
        let routes = config.compile_routes().unwrap();

        assert!(routes.resolve("/api/v1/ata").is_some());
        assert!(routes.resolve("/api/v1/ata/7").is_some());
        assert!(routes.resolve("/api/v1/atas").is_none());
        assert!(routes.resolve("/api/v1/pca").is_none());
    }

    #[test]
    fn test_parse_limit_expressions() {
        assert_eq!(
            RouteLimit::parse("100/minute").unwrap(),
            RouteLimit { max_requests: 100, window_seconds: 60 }
        );
        assert_eq!(
            RouteLimit::parse("5 / 30s").unwrap(),
            RouteLimit { max_requests: 5, window_seconds: 30 }
        );
        assert_eq!(RouteLimit::parse("1000/hour").unwrap().window_seconds, 3600);
        assert!(RouteLimit::parse("100").is_err());
        assert!(RouteLimit::parse("abc/minute").is_err());
        assert!(RouteLimit::parse("0/minute").is_err());
        assert!(RouteLimit::parse("10/week").is_err());
        assert!(matches!(
            RouteLimit::parse("1/99999999999999999day"),
            Err(GovernanceError::Config(msg)) if msg.contains("too long")
        ));
    }

    #[test]
    fn test_validation_rejects_zero_window() {
        let yaml = "rate_limit:\n  window_seconds: 0\n";
        assert!(matches!(
            GovernanceConfig::from_yaml(yaml),
            Err(GovernanceError::Config(_))
        ));
    }

    #[test]
    fn test_auth_debug_redacts_secret() {
        let rendered = format!("{:?}", AuthConfig::default());
        assert!(!rendered.contains("change-in-production"));
    }
}
