use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstreams: UpstreamConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub forwarding: ForwardingConfig,
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Base URLs for each upstream target class. Deployment-provided; any of
/// these may be absent, in which case requests routed to that class are
/// answered with a 503 configuration error.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UpstreamConfig {
    pub rest_base: Option<String>,
    pub stream_base: Option<String>,
    pub third_party_base: Option<String>,
    pub socket_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub exclude_paths: Vec<String>,
    /// Server-held credential injected on protected routes. Never accepted
    /// from the client side.
    pub api_key: Option<String>,
    pub protected_prefix: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8888".to_string(),
            ],
            exclude_paths: vec![
                "/_assets/".to_string(),
                "/favicon.ico".to_string(),
                "/health".to_string(),
            ],
            api_key: None,
            protected_prefix: "/api".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(with = "duration_serde")]
    pub window: Duration,
    pub capacity: u32,
    pub sweep_threshold: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            capacity: 100,
            sweep_threshold: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Per-attempt deadline for buffered REST forwards.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Connect-only timeout for streaming targets; no data timeout is
    /// imposed once a stream is established.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_serde")]
    pub backoff_base: Duration,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 2,
            backoff_base: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub enabled: bool,
    pub queue_size: usize,
    /// Exchanges whose combined body size exceeds this are dropped.
    pub max_body_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_size: 256,
            max_body_bytes: 4_182_425,
        }
    }
}

impl Config {
    /// Load configuration from file, then apply environment overrides.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from defaults plus environment overrides, for
    /// deployments that provide everything through the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Deployment-provided values win over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("API_GATEWAY_URL") {
            if !url.is_empty() {
                self.upstreams.rest_base = Some(url);
            }
        }
        if let Ok(url) = std::env::var("SSE_FUNCTION_URL") {
            if !url.is_empty() {
                self.upstreams.stream_base = Some(url);
            }
        }
        if let Ok(url) = std::env::var("THIRD_PARTY_URL") {
            if !url.is_empty() {
                self.upstreams.third_party_base = Some(url);
            }
        }
        if let Ok(url) = std::env::var("SOCKET_URL") {
            if !url.is_empty() {
                self.upstreams.socket_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("GATEWAY_API_KEY") {
            if !key.is_empty() {
                self.security.api_key = Some(key);
            }
        }
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            if !origins.is_empty() {
                self.security.allowed_origins =
                    origins.split(',').map(|o| o.trim().to_string()).collect();
            }
        }
        if let Ok(max) = std::env::var("RATE_LIMIT_MAX") {
            if let Ok(max) = max.parse() {
                self.rate_limit.capacity = max;
            }
        }
        if let Ok(window) = std::env::var("RATE_LIMIT_WINDOW_SECS") {
            if let Ok(secs) = window.parse() {
                self.rate_limit.window = Duration::from_secs(secs);
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.rate_limit.capacity == 0 {
            anyhow::bail!("Rate limit capacity cannot be zero");
        }

        if self.rate_limit.window.is_zero() {
            anyhow::bail!("Rate limit window cannot be zero");
        }

        for (name, base) in [
            ("rest_base", &self.upstreams.rest_base),
            ("stream_base", &self.upstreams.stream_base),
            ("third_party_base", &self.upstreams.third_party_base),
        ] {
            if let Some(url) = base {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    anyhow::bail!("Upstream {} must be an http(s) URL: {}", name, url);
                }
            }
        }

        if let Some(url) = &self.upstreams.socket_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                anyhow::bail!("Upstream socket_url must be a ws(s) URL: {}", url);
            }
        }

        if !self.security.protected_prefix.starts_with('/') {
            anyhow::bail!("protected_prefix must start with '/'");
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        // "ms" must be checked before "s"
        if s.ends_with("ms") {
            let num: u64 = s.trim_end_matches("ms").parse()?;
            Ok(Duration::from_millis(num))
        } else if s.ends_with('s') {
            let num: u64 = s.trim_end_matches('s').parse()?;
            Ok(Duration::from_secs(num))
        } else if s.ends_with('m') {
            let num: u64 = s.trim_end_matches('m').parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if s.ends_with('h') {
            let num: u64 = s.trim_end_matches('h').parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            let num: u64 = s.parse()?;
            Ok(Duration::from_secs(num))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_units() {
            assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
            assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
            assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
            assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
            assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        }
    }
}
