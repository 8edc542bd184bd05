use {
    crate::store::RetryPolicy,
    anyhow::{bail, Context},
    axum::http::HeaderValue,
    clap::Parser,
    std::time::Duration,
};

pub const MEMORY_SCHEME: &str = "memory://";

/// Instance configuration. Every option can come from a flag or from the
/// environment variable of the same name.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Realtime chat relay instance")]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 5555)]
    pub port: u16,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "CORS_ORIGIN", default_value = "http://localhost:3000")]
    pub cors_origin: String,

    /// `redis://`, or `memory://` for an in-process store. TLS endpoints are
    /// not supported.
    #[arg(long, env = "REDIS_ENDPOINT")]
    pub redis_endpoint: Option<String>,

    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value_t = 2000)]
    pub shutdown_grace_ms: u64,

    #[arg(long, env = "STORE_RETRIES", default_value_t = 2)]
    pub store_retries: u32,

    #[arg(long, env = "STORE_RETRY_BACKOFF_MS", default_value_t = 50)]
    pub store_retry_backoff_ms: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Reads flags and environment. Exits with usage on unparsable input;
    /// semantic checks are left to [`Config::validate`].
    pub fn parse_env() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let endpoint = self.endpoint()?;
        if endpoint.starts_with("rediss://") {
            bail!("TLS store endpoints are not supported: {endpoint}");
        }
        if !["redis://", MEMORY_SCHEME]
            .iter()
            .any(|scheme| endpoint.starts_with(scheme))
        {
            bail!("unsupported store endpoint {endpoint}");
        }
        self.cors_header()?;
        Ok(())
    }

    pub fn endpoint(&self) -> anyhow::Result<&str> {
        self.redis_endpoint
            .as_deref()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .context("missing store endpoint (REDIS_ENDPOINT)")
    }

    pub fn uses_memory_store(&self) -> bool {
        self.redis_endpoint
            .as_deref()
            .is_some_and(|endpoint| endpoint.starts_with(MEMORY_SCHEME))
    }

    pub fn cors_header(&self) -> anyhow::Result<HeaderValue> {
        HeaderValue::from_str(&self.cors_origin)
            .with_context(|| format!("invalid CORS origin {:?}", self.cors_origin))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store_retries,
            Duration::from_millis(self.store_retry_backoff_ms),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5555,
            host: "0.0.0.0".into(),
            cors_origin: "http://localhost:3000".into(),
            redis_endpoint: None,
            shutdown_grace_ms: 2000,
            store_retries: 2,
            store_retry_backoff_ms: 50,
            log_level: "info".into(),
        }
    }
}
