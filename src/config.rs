use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::network::packet::HEAD_SIZE;
use crate::network::PumpConfig;
use crate::world::MAX_ZONES_PER_SIDE;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: String,
    /// Size of the region the arena manages.
    pub memory_bytes: usize,
    pub max_connections: u16,
    pub max_clients: u16,
    pub write_buffer_bytes: usize,
    pub reception_buffer_bytes: usize,
    pub sending_buffer_bytes: usize,
    /// Seconds a connection may stay unauthenticated.
    pub authentication_grace_secs: f32,
    pub tick_rate: u32,
    /// The world is `world_zones` zones on each side.
    pub world_zones: u16,
    pub world_seed: Option<u64>,
    pub max_characters: u32,
    pub poll_timeout_ms: u64,
    pub send_stall_timeout_ms: u64,
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 25000,
            bind_address: "0.0.0.0".into(),
            memory_bytes: 64 * 1024 * 1024,
            max_connections: 256,
            max_clients: 128,
            write_buffer_bytes: 64 * 1024,
            reception_buffer_bytes: 64 * 1024,
            sending_buffer_bytes: 64 * 1024,
            authentication_grace_secs: 10.0,
            tick_rate: 20,
            world_zones: 4,
            world_seed: None,
            max_characters: 128,
            poll_timeout_ms: 1000,
            send_stall_timeout_ms: 2000,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(&'static str),
}
impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config: {e}"),
            Self::Parse(e) => write!(f, "failed to parse config: {e}"),
            Self::Invalid(what) => write!(f, "invalid config: {what}"),
        }
    }
}
impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json(&text)
    }
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what| Err(ConfigError::Invalid(what));
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.max_clients == 0 {
            return invalid("max_clients must be at least 1");
        }
        if self.tick_rate == 0 {
            return invalid("tick_rate must be at least 1");
        }
        if self.world_zones == 0 || self.world_zones > MAX_ZONES_PER_SIDE {
            return invalid("world_zones must be between 1 and 255");
        }
        if [self.write_buffer_bytes, self.reception_buffer_bytes, self.sending_buffer_bytes]
            .iter()
            .any(|&b| b <= HEAD_SIZE)
        {
            return invalid("packet buffers must hold at least one packet head");
        }
        if !(self.authentication_grace_secs > 0.0) {
            return invalid("authentication_grace_secs must be positive");
        }
        if self.bind_address.parse::<IpAddr>().is_err() {
            return invalid("bind_address is not an IP address");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    pub fn pump(&self) -> Result<PumpConfig, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid("bind_address is not an IP address"))?;
        Ok(PumpConfig {
            bind: SocketAddr::new(ip, self.port),
            max_connections: self.max_connections,
            reception_buffer_bytes: self.reception_buffer_bytes,
            sending_buffer_bytes: self.sending_buffer_bytes,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            send_stall_timeout: Duration::from_millis(self.send_stall_timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = ServerConfig::from_json(r#"{ "port": 4000, "world_seed": 9 }"#).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.world_seed, Some(9));
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.write_buffer_bytes, 64 * 1024);
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn unknown_fields_and_bad_values_are_refused() {
        assert!(matches!(ServerConfig::from_json(r#"{ "prot": 1 }"#), Err(ConfigError::Parse(_))));
        assert!(matches!(
            ServerConfig::from_json(r#"{ "max_clients": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_json(r#"{ "write_buffer_bytes": 6 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_json(r#"{ "bind_address": "localhost" }"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn pump_settings_follow_the_server_config() {
        let config =
            ServerConfig { port: 0, bind_address: "127.0.0.1".into(), ..Default::default() };
        let pump = config.pump().unwrap();
        assert_eq!(pump.bind, "127.0.0.1:0".parse().unwrap());
        assert_eq!(pump.poll_timeout, Duration::from_secs(1));
        assert_eq!(pump.max_connections, 256);
    }
}
