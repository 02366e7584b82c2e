//! Relay service configuration.
//!
//! Configuration is loaded from environment variables. Every setting has a
//! default; limits must be at least 1.

use crate::actors::directory::DirectoryConfig;
use crate::session::{is_valid_room_name, RoomPolicy};

use std::collections::{HashMap, HashSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health and metrics bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default inbound messages per connection per second.
pub const DEFAULT_MAX_MESSAGES_PER_SECOND: usize = 30;

/// Default connections per room.
pub const DEFAULT_MAX_CONNECTIONS_PER_ROOM: usize = 16;

/// Room used by `/ws`.
pub const DEFAULT_ROOM: &str = "lobby";

/// Default inbound frame size cap.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Default idle period before a room hibernates.
pub const DEFAULT_ROOM_IDLE_SECONDS: u64 = 60;

/// Default number of rooms per relay.
pub const DEFAULT_MAX_ROOMS: usize = 10_000;

/// Default relay instance ID prefix.
pub const DEFAULT_RELAY_ID_PREFIX: &str = "relay";

/// Relay service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket listener (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health and metrics listener (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this relay instance.
    pub relay_id: String,

    /// Allowed `Origin` values; empty allows every origin.
    pub allowed_origins: HashSet<String>,

    pub max_messages_per_second: usize,

    pub max_connections_per_room: usize,

    /// Room used when the path names none.
    pub default_room: String,

    /// Largest inbound WebSocket message accepted.
    pub max_message_bytes: usize,

    /// Idle period before a room hibernates or, if empty, is removed.
    pub room_idle_timeout: Duration,

    pub max_rooms: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RELAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let allowed_origins = vars
            .get("RELAY_ALLOWED_ORIGINS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let max_messages_per_second = parse_positive(
            vars,
            "RELAY_MAX_MESSAGES_PER_SECOND",
            DEFAULT_MAX_MESSAGES_PER_SECOND,
        )?;

        let max_connections_per_room = parse_positive(
            vars,
            "RELAY_MAX_CONNECTIONS_PER_ROOM",
            DEFAULT_MAX_CONNECTIONS_PER_ROOM,
        )?;

        let max_message_bytes =
            parse_positive(vars, "RELAY_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?;

        let room_idle_seconds =
            parse_positive(vars, "RELAY_ROOM_IDLE_SECONDS", DEFAULT_ROOM_IDLE_SECONDS)?;

        let max_rooms = parse_positive(vars, "RELAY_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;

        let default_room = vars
            .get("RELAY_DEFAULT_ROOM")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ROOM.to_string());
        if !is_valid_room_name(&default_room) {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_DEFAULT_ROOM must be 1-64 characters of [A-Za-z0-9_-], got '{default_room}'"
            )));
        }

        // Generate relay instance ID
        let relay_id = vars.get("RELAY_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RELAY_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            health_bind_address,
            relay_id,
            allowed_origins,
            max_messages_per_second,
            max_connections_per_room,
            default_room,
            max_message_bytes,
            room_idle_timeout: Duration::from_secs(room_idle_seconds),
            max_rooms,
        })
    }

    /// Limits applied to every room.
    #[must_use]
    pub fn room_policy(&self) -> RoomPolicy {
        RoomPolicy {
            max_connections: self.max_connections_per_room,
            max_messages_per_second: self.max_messages_per_second,
            allowed_origins: self.allowed_origins.clone(),
        }
    }

    #[must_use]
    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            policy: self.room_policy(),
            room_idle_timeout: self.room_idle_timeout,
            max_rooms: self.max_rooms,
        }
    }
}

/// Parse an optional positive integer, falling back to `default` when unset.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };

    let value: T = raw.trim().parse().map_err(|_| {
        ConfigError::InvalidValue(format!("{name} must be a positive integer, got '{raw}'"))
    })?;

    if value <= T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be at least 1, got '{raw}'"
        )));
    }

    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.max_messages_per_second, 30);
        assert_eq!(config.max_connections_per_room, 16);
        assert_eq!(config.default_room, "lobby");
        assert_eq!(config.max_message_bytes, 65536);
        assert_eq!(config.room_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_rooms, 10_000);
        // Relay ID should be auto-generated
        assert!(config.relay_id.starts_with("relay-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string()),
            (
                "RELAY_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:9001".to_string(),
            ),
            ("RELAY_ID".to_string(), "relay-custom-001".to_string()),
            (
                "RELAY_ALLOWED_ORIGINS".to_string(),
                "https://a.example, https://b.example,".to_string(),
            ),
            ("RELAY_MAX_MESSAGES_PER_SECOND".to_string(), "5".to_string()),
            ("RELAY_MAX_CONNECTIONS_PER_ROOM".to_string(), "2".to_string()),
            ("RELAY_DEFAULT_ROOM".to_string(), "main-hall".to_string()),
            ("RELAY_MAX_MESSAGE_BYTES".to_string(), "1024".to_string()),
            ("RELAY_ROOM_IDLE_SECONDS".to_string(), "5".to_string()),
            ("RELAY_MAX_ROOMS".to_string(), "3".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.health_bind_address, "127.0.0.1:9001");
        assert_eq!(config.relay_id, "relay-custom-001");
        assert_eq!(
            config.allowed_origins,
            HashSet::from([
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
        assert_eq!(config.max_messages_per_second, 5);
        assert_eq!(config.max_connections_per_room, 2);
        assert_eq!(config.default_room, "main-hall");
        assert_eq!(config.max_message_bytes, 1024);
        assert_eq!(config.room_idle_timeout, Duration::from_secs(5));
        assert_eq!(config.max_rooms, 3);

        let policy = config.room_policy();
        assert_eq!(policy.max_connections, 2);
        assert_eq!(policy.max_messages_per_second, 5);
        assert_eq!(config.directory_config().max_rooms, 3);
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        for name in [
            "RELAY_MAX_MESSAGES_PER_SECOND",
            "RELAY_MAX_CONNECTIONS_PER_ROOM",
            "RELAY_MAX_MESSAGE_BYTES",
            "RELAY_ROOM_IDLE_SECONDS",
            "RELAY_MAX_ROOMS",
        ] {
            let vars = HashMap::from([(name.to_string(), "0".to_string())]);
            let result = Config::from_vars(&vars);
            assert!(
                matches!(&result, Err(ConfigError::InvalidValue(msg)) if msg.contains(name)),
                "{name} = 0 should be rejected"
            );
        }
    }

    #[test]
    fn test_non_numeric_limit_is_rejected() {
        let vars = HashMap::from([(
            "RELAY_MAX_CONNECTIONS_PER_ROOM".to_string(),
            "lots".to_string(),
        )]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let vars = HashMap::from([(
            "RELAY_MAX_MESSAGES_PER_SECOND".to_string(),
            "-3".to_string(),
        )]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_invalid_default_room_is_rejected() {
        let vars = HashMap::from([("RELAY_DEFAULT_ROOM".to_string(), "no spaces".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
