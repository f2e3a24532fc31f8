use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{GatewayError, Result};

// CLI argument structure; every flag can also come from an APP_* env var
#[derive(Parser, Debug, Clone)]
#[command(name = "api-gateway")]
#[command(about = "Rate-limiting, response-caching gateway for the user service")]
pub struct Args {
    // Address to bind the server on
    #[arg(long, env = "APP_SERVER_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    // Port to run the server on
    #[arg(short, long, env = "APP_SERVER_PORT", default_value_t = 8080)]
    pub port: u16,

    // Proxies whose X-Forwarded-For header is trusted (comma-separated)
    #[arg(
        long,
        env = "APP_SERVER_TRUSTED_PROXIES",
        value_delimiter = ',',
        default_value = "127.0.0.1"
    )]
    pub trusted_proxies: Vec<IpAddr>,

    // CORS allowed origins (comma-separated)
    #[arg(
        long,
        env = "APP_SERVER_ALLOW_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:8080,http://127.0.0.1:8080"
    )]
    pub allow_origins: Vec<String>,

    #[arg(long, env = "APP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    // Where cached responses live
    #[arg(long, env = "APP_CACHE_BACKEND", value_enum, default_value_t = CacheBackend::Redis)]
    pub cache_backend: CacheBackend,

    #[arg(long, env = "APP_REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    pub redis_url: String,

    // Cache TTL in seconds, 0 disables caching
    #[arg(short, long, env = "APP_CACHE_DURATION", default_value_t = 60)]
    pub cache_duration: u64,

    // Upper bound on a single cache read
    #[arg(long, env = "APP_CACHE_LOOKUP_TIMEOUT_MS", default_value_t = 500)]
    pub cache_lookup_timeout_ms: u64,

    #[arg(long, env = "APP_RATE_LIMIT_REQUESTS_PER_MINUTE", default_value_t = 100)]
    pub requests_per_minute: u32,

    #[arg(long, env = "APP_RATE_LIMIT_BURST_SIZE", default_value_t = 100)]
    pub burst_size: u32,

    // Idle client eviction interval in minutes
    #[arg(long, env = "APP_RATE_LIMIT_CLEANUP_INTERVAL", default_value_t = 5)]
    pub cleanup_interval: u64,

    #[arg(long, env = "APP_RATE_LIMIT_DISABLED")]
    pub disable_rate_limit: bool,

    // Backend user service
    #[arg(long, env = "APP_USER_SERVICE_BASE_URL", default_value = "http://localhost:8081")]
    pub user_service_url: String,

    // Backend request timeout in seconds
    #[arg(long, env = "APP_USER_SERVICE_TIMEOUT", default_value_t = 30)]
    pub user_service_timeout: u64,

    // Serve canned users instead of calling the backend
    #[arg(long, env = "APP_USER_SERVICE_MOCK")]
    pub user_service_mock: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Redis,
    Memory,
}

/// Validated token bucket parameters shared by every client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    /// Maximum burst size (bucket capacity)
    pub burst_size: u32,
    /// Tokens added per second
    pub refill_per_second: f64,
    /// Idle time after which a client is forgotten; also the sweep period
    pub cleanup_interval: Duration,
}

impl RateLimitSettings {
    pub fn new(requests_per_minute: u32, burst_size: u32, cleanup_interval: Duration) -> Result<Self> {
        if requests_per_minute == 0 {
            return Err(GatewayError::Config(
                "requests_per_minute must be greater than 0".to_string(),
            ));
        }
        if burst_size == 0 {
            return Err(GatewayError::Config(
                "burst_size must be at least 1".to_string(),
            ));
        }
        if cleanup_interval.is_zero() {
            return Err(GatewayError::Config(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            burst_size,
            refill_per_second: f64::from(requests_per_minute) / 60.0,
            cleanup_interval,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub lookup_timeout: Duration,
}

impl CacheSettings {
    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }
}

impl Args {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// `None` means admission control is switched off and every request passes.
    pub fn rate_limit_settings(&self) -> Result<Option<RateLimitSettings>> {
        if self.disable_rate_limit {
            return Ok(None);
        }
        RateLimitSettings::new(
            self.requests_per_minute,
            self.burst_size,
            Duration::from_secs(self.cleanup_interval.saturating_mul(60)),
        )
        .map(Some)
    }

    pub fn cache_settings(&self) -> Result<CacheSettings> {
        if self.cache_lookup_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "cache_lookup_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(CacheSettings {
            ttl: Duration::from_secs(self.cache_duration),
            lookup_timeout: Duration::from_millis(self.cache_lookup_timeout_ms),
        })
    }

    pub fn user_service_timeout(&self) -> Duration {
        Duration::from_secs(self.user_service_timeout)
    }

    pub fn allow_origins(&self) -> Vec<String> {
        let origins: Vec<String> = self
            .allow_origins
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        // at least one origin is always allowed
        if origins.is_empty() {
            vec!["http://localhost:8080".to_string()]
        } else {
            origins
        }
    }
}

// add http:// if no scheme is present
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["api-gateway"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_refill_rate_from_requests_per_minute() {
        let settings = RateLimitSettings::new(60, 5, Duration::from_secs(300)).unwrap();
        assert_eq!(settings.refill_per_second, 1.0);
        assert_eq!(settings.burst_size, 5);

        let settings = RateLimitSettings::new(90, 1, Duration::from_secs(60)).unwrap();
        assert_eq!(settings.refill_per_second, 1.5);
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(RateLimitSettings::new(0, 5, Duration::from_secs(60)).is_err());
        assert!(RateLimitSettings::new(60, 0, Duration::from_secs(60)).is_err());
        assert!(RateLimitSettings::new(60, 5, Duration::ZERO).is_err());
    }

    #[test]
    fn test_rate_limit_from_args() {
        let args = parse(&[
            "--requests-per-minute",
            "60",
            "--burst-size",
            "5",
            "--cleanup-interval",
            "2",
        ]);
        let settings = args.rate_limit_settings().unwrap().unwrap();
        assert_eq!(settings.cleanup_interval, Duration::from_secs(120));
        assert_eq!(settings.burst_size, 5);
    }

    #[test]
    fn test_disabled_rate_limit_has_no_settings() {
        let args = parse(&["--disable-rate-limit", "--requests-per-minute", "0"]);
        assert_eq!(args.rate_limit_settings().unwrap(), None);
    }

    #[test]
    fn test_invalid_rate_limit_is_fatal() {
        let args = parse(&["--burst-size", "0"]);
        assert!(matches!(
            args.rate_limit_settings(),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_cache_duration_zero_disables() {
        let args = parse(&["--cache-duration", "0"]);
        assert!(!args.cache_settings().unwrap().is_enabled());

        let args = parse(&["--cache-duration", "2"]);
        let settings = args.cache_settings().unwrap();
        assert!(settings.is_enabled());
        assert_eq!(settings.ttl, Duration::from_secs(2));
    }

    #[test]
    fn test_list_flags_are_comma_separated() {
        let args = parse(&[
            "--trusted-proxies",
            "10.0.0.1,10.0.0.2",
            "--allow-origins",
            "https://a.example, ,https://b.example",
        ]);
        assert_eq!(args.trusted_proxies.len(), 2);
        assert_eq!(
            args.allow_origins(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("localhost:8081"), "http://localhost:8081");
        assert_eq!(normalize_base_url("https://users.internal/"), "https://users.internal");
    }
}
