use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::engine::PgSslMode;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Log format: "compact" or "json".
    pub log_format: String,
    /// Lease granted to a freshly connected session before its first authenticated call.
    pub session_lease_seconds: u64,
    /// Lease applied on every authenticated request.
    pub session_renewal_seconds: u64,
    /// Upper bound for opening a database connection.
    pub connect_timeout_seconds: u64,
    /// Deadline for a single query or exec statement round trip.
    pub statement_timeout_seconds: u64,
    /// Deadline for BEGIN / COMMIT / ROLLBACK (and their savepoint forms).
    pub transaction_timeout_seconds: u64,
    /// Port used when `/connect` omits one.
    pub default_database_port: u16,
    /// PostgreSQL SSL mode: disable, prefer, require, verify-ca, verify-full.
    pub database_ssl_mode: String,
    /// Maximum accepted request body size in bytes.
    pub max_request_bytes: usize,
    pub status_enabled: bool,
    pub status_host: String,
    pub status_port: u16,
    pub status_path_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_format: "compact".to_string(),
            session_lease_seconds: 3600,
            session_renewal_seconds: 120,
            connect_timeout_seconds: 10,
            statement_timeout_seconds: 60,
            transaction_timeout_seconds: 60,
            default_database_port: 5432,
            database_ssl_mode: "disable".to_string(),
            max_request_bytes: 16 * 1024 * 1024,
            status_enabled: false,
            status_host: "127.0.0.1".to_string(),
            status_port: 3001,
            status_path_prefix: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("SWANGATE"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: ServerConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve bind address for {addr}"))
    }

    pub fn session_lease(&self) -> Duration {
        Duration::from_secs(self.session_lease_seconds)
    }

    pub fn session_renewal(&self) -> Duration {
        Duration::from_secs(self.session_renewal_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_seconds)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_seconds)
    }

    pub fn ssl_mode(&self) -> anyhow::Result<PgSslMode> {
        self.database_ssl_mode
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown database_ssl_mode {:?}", self.database_ssl_mode))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("session_lease_seconds", self.session_lease_seconds),
            ("session_renewal_seconds", self.session_renewal_seconds),
            ("connect_timeout_seconds", self.connect_timeout_seconds),
            ("statement_timeout_seconds", self.statement_timeout_seconds),
            ("transaction_timeout_seconds", self.transaction_timeout_seconds),
        ];
        for (name, value) in durations {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.max_request_bytes == 0 {
            anyhow::bail!("max_request_bytes must be greater than zero");
        }
        self.ssl_mode()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;

    #[test]
    fn defaults_validate_and_expose_durations() -> Result<()> {
        let config = ServerConfig::default();
        config.validate()?;
        assert_eq!(config.session_lease(), Duration::from_secs(3600));
        assert_eq!(config.session_renewal(), Duration::from_secs(120));
        assert_eq!(config.transaction_timeout(), Duration::from_secs(60));
        assert_eq!(config.ssl_mode()?, PgSslMode::Disable);
        Ok(())
    }

    #[test]
    fn validate_rejects_zero_windows() -> Result<()> {
        let config = ServerConfig {
            session_renewal_seconds: 0,
            ..ServerConfig::default()
        };
        let err = config
            .validate()
            .err()
            .ok_or_else(|| anyhow!("expected zero renewal window to be rejected"))?;
        assert!(err.to_string().contains("session_renewal_seconds"));
        Ok(())
    }

    #[test]
    fn validate_rejects_unknown_ssl_mode() {
        let config = ServerConfig {
            database_ssl_mode: "sometimes".to_string(),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bind_addr_resolves_host_and_port() -> Result<()> {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8123,
            ..ServerConfig::default()
        };
        let addr = config.bind_addr()?;
        assert_eq!(addr.port(), 8123);
        assert!(addr.ip().is_loopback());
        Ok(())
    }
}
