use std::time::Duration;

use redis::{ConnectionInfo, IntoConnectionInfo};
use serde::Deserialize;

use crate::utils::{BroadcastError, Result};

/// Top-level configuration settings for the application.
///
/// Includes settings for the listening server, the broadcast service and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broadcast: BroadcastSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the broadcast service.
///
/// `redis` selects the Redis broker when present; otherwise messages stay in
/// process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BroadcastSettings {
    /// URL path on which WebSocket upgrades are accepted.
    pub path: String,
    /// Buffer of each connection's delivery channel.
    pub upstream_capacity: usize,
    /// How long the router waits on a full subscriber. Zero waits forever.
    pub send_timeout_ms: u64,
    pub redis: Option<RedisSettings>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RedisSettings {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broadcast: Option<PartialBroadcastSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBroadcastSettings {
    pub path: Option<String>,
    pub upstream_capacity: Option<usize>,
    pub send_timeout_ms: Option<u64>,
    pub redis: Option<PartialRedisSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRedisSettings {
    pub addr: Option<String>,
    pub password: Option<String>,
    pub db: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broadcast: BroadcastSettings {
                path: "/ws".to_string(),
                upstream_capacity: 1,
                send_timeout_ms: 5000,
                redis: None,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Fill every value missing from `partial` with its default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.as_ref();
        let broadcast = partial.broadcast.as_ref();

        Settings {
            server: ServerSettings {
                host: server
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server.and_then(|s| s.port).unwrap_or(default.server.port),
            },
            broadcast: BroadcastSettings {
                path: broadcast
                    .and_then(|b| b.path.clone())
                    .unwrap_or(default.broadcast.path),
                upstream_capacity: broadcast
                    .and_then(|b| b.upstream_capacity)
                    .unwrap_or(default.broadcast.upstream_capacity),
                send_timeout_ms: broadcast
                    .and_then(|b| b.send_timeout_ms)
                    .unwrap_or(default.broadcast.send_timeout_ms),
                redis: broadcast
                    .and_then(|b| b.redis.as_ref())
                    .map(|r| RedisSettings {
                        addr: r.addr.clone().unwrap_or_default(),
                        password: r.password.clone().unwrap_or_default(),
                        db: r.db.unwrap_or(0),
                    }),
            },
            log: LogSettings {
                level: partial
                    .log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        let broadcast = &self.broadcast;

        if broadcast.path.is_empty() {
            return Err(BroadcastError::InvalidConfig(
                "broadcast.path must not be empty".into(),
            ));
        }
        if !broadcast.path.starts_with('/') {
            return Err(BroadcastError::InvalidConfig(format!(
                "broadcast.path must start with '/', got {:?}",
                broadcast.path
            )));
        }
        if broadcast.upstream_capacity == 0 {
            return Err(BroadcastError::InvalidConfig(
                "broadcast.upstream_capacity must be at least 1".into(),
            ));
        }
        if let Some(redis) = &broadcast.redis {
            redis.validate()?;
        }
        Ok(())
    }
}

impl ServerSettings {
    /// `host:port` to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl BroadcastSettings {
    pub fn send_timeout(&self) -> Option<Duration> {
        match self.send_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl RedisSettings {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            password: String::new(),
            db: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.trim().is_empty() {
            return Err(BroadcastError::InvalidConfig(
                "broadcast.redis.addr must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Connection parameters for the `redis` crate. The password is set on the
    /// parsed info rather than embedded in the URL, so it is taken verbatim.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        let mut info = format!("redis://{}/{}", self.addr, self.db).into_connection_info()?;
        if !self.password.is_empty() {
            info.redis.password = Some(self.password.clone());
        }
        Ok(info)
    }
}
