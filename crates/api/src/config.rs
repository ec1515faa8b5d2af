use std::str::FromStr;
use std::time::Duration;

use spektra_telemetry::TelemetryTtl;

#[derive(Debug, thiserror::Error)]
#[error("{name} must be a valid {expected}, got {value:?}")]
pub struct ConfigError {
    name: &'static str,
    expected: &'static str,
    value: String,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Grace period for background loops after the listener closes.
    pub shutdown_timeout_secs: u64,
    pub telemetry_ttl: TelemetryTtl,
    /// Interval between sweeps of expired telemetry (default: `300`).
    pub telemetry_sweep_interval_secs: u64,
    /// Age after which a PENDING job without a task handle is re-enqueued.
    pub orphan_recovery_after_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".into()],
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            telemetry_ttl: TelemetryTtl::default(),
            telemetry_sweep_interval_secs: 300,
            orphan_recovery_after_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                 |
    /// |---------------------------------|-------------------------|
    /// | `HOST`                          | `0.0.0.0`               |
    /// | `PORT`                          | `3000`                  |
    /// | `CORS_ORIGINS`                  | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`          | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`         | `30`                    |
    /// | `TELEMETRY_LOG_TTL_SECS`        | `604800`                |
    /// | `TELEMETRY_PROGRESS_TTL_SECS`   | `86400`                 |
    /// | `TELEMETRY_SWEEP_INTERVAL_SECS` | `300`                   |
    /// | `ORPHAN_RECOVERY_AFTER_SECS`    | `60`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        let cors_origins = env_string("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_parse("PORT", "3000", "u16")?,
            cors_origins,
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", "30", "u64")?,
            shutdown_timeout_secs: env_parse("SHUTDOWN_TIMEOUT_SECS", "30", "u64")?,
            telemetry_ttl: TelemetryTtl {
                log: Duration::from_secs(env_parse("TELEMETRY_LOG_TTL_SECS", "604800", "u64")?),
                progress: Duration::from_secs(env_parse("TELEMETRY_PROGRESS_TTL_SECS", "86400", "u64")?),
            },
            telemetry_sweep_interval_secs: env_parse("TELEMETRY_SWEEP_INTERVAL_SECS", "300", "u64")?,
            orphan_recovery_after_secs: env_parse("ORPHAN_RECOVERY_AFTER_SECS", "60", "u64")?,
        })
    }

    pub fn telemetry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_sweep_interval_secs.max(1))
    }

    pub fn orphan_recovery_after(&self) -> Duration {
        Duration::from_secs(self.orphan_recovery_after_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parse<T: FromStr>(name: &'static str, default: &str, expected: &'static str) -> Result<T, ConfigError> {
    let value = env_string(name, default);
    value.parse().map_err(|_| ConfigError {
        name,
        expected,
        value,
    })
}
