//! Environment-driven configuration (`.env` is loaded by `main` via dotenvy).

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 25;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("ping interval ({ping:?}) must be shorter than the read timeout ({read:?})")]
    PingNotBelowReadTimeout { ping: Duration, read: Duration },
}

/// Timers governing one WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    /// Rolling deadline; any inbound frame pushes it forward.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval >= self.read_timeout {
            return Err(ConfigError::PingNotBelowReadTimeout {
                ping: self.ping_interval,
                read: self.read_timeout,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub session: SessionConfig,
    /// Broadcast a `subscribed` notice to every connection on each subscribe command.
    pub announce_subscriptions: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr: SocketAddr = match lookup("BIND_ADDR") {
            Some(v) => parse("BIND_ADDR", &v)?,
            None => DEFAULT_BIND_ADDR
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("BIND_ADDR", DEFAULT_BIND_ADDR, e.to_string()))?,
        };
        let session = SessionConfig {
            ping_interval: secs(&lookup, "WS_PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS)?,
            read_timeout: secs(&lookup, "WS_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS)?,
            write_timeout: secs(&lookup, "WS_WRITE_TIMEOUT_SECS", DEFAULT_WRITE_TIMEOUT_SECS)?,
        };
        session.validate()?;
        let announce_subscriptions = match lookup("WS_ANNOUNCE_SUBSCRIPTIONS") {
            Some(v) => parse_bool("WS_ANNOUNCE_SUBSCRIPTIONS", &v)?,
            None => false,
        };
        Ok(Self {
            bind_addr,
            session,
            announce_subscriptions,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| invalid(key, value, e.to_string()))
}

fn secs<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let n = match lookup(key) {
        Some(v) => {
            let n: u64 = parse(key, &v)?;
            if n == 0 {
                return Err(invalid(key, &v, "must be at least 1 second"));
            }
            n
        }
        None => default,
    };
    Ok(Duration::from_secs(n))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}
