use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

/// Default UDP port of the tunnel server.
pub const DEFAULT_PORT: u16 = 5732;
/// Default MTU configured on the client's virtual adapter.
pub const DEFAULT_MTU: u16 = 1500;

mod option_u16 {
    use serde::{self, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;

        match value {
            Some(s) => {
                let port: u16 = s.parse().map_err(serde::de::Error::custom)?;
                Ok(Some(port))
            }
            None => Ok(None),
        }
    }
}

mod option_bool {
    use serde::{self, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;

        match value.as_deref() {
            None => Ok(None),
            Some("true") | Some("yes") | Some("1") | Some("on") => Ok(Some(true)),
            Some("false") | Some("no") | Some("0") | Some("off") => Ok(Some(false)),
            Some(other) => Err(serde::de::Error::custom(format!(
                "not a boolean value: {other:?}"
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("parsing error")]
    ParseError,
    #[error("I/O error: {0}")]
    Io(String),
}

/// Configuration of a server/client deployment, read from an INI file
/// with `[server]` and `[client]` sections. All values are optional and
/// fall back to the documented defaults through the accessors.
#[derive(Deserialize, Clone, Default)]
pub struct VpnConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// Local address the UDP socket binds to.
    #[serde(default)]
    pub listen: Option<IpAddr>,

    /// UDP port, 5732 when unset.
    #[serde(default, with = "option_u16")]
    pub port: Option<u16>,

    /// Whether packets for destinations outside the virtual network are
    /// forwarded to their real address instead of being dropped.
    #[serde(default, with = "option_bool")]
    pub tunnel: Option<bool>,
}

impl ServerConfig {
    pub fn listen(&self) -> IpAddr {
        self.listen
            .unwrap_or_else(|| IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn tunnel(&self) -> bool {
        self.tunnel.unwrap_or(false)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen(), self.port())
    }
}

#[derive(Deserialize, Clone, Default)]
pub struct ClientConfig {
    /// Server endpoint to connect to.
    #[serde(default)]
    pub server: Option<SocketAddr>,

    /// Name of the virtual adapter; handed to the OS layer, not used by
    /// the core.
    #[serde(default)]
    pub interface: Option<String>,

    #[serde(default, with = "option_u16")]
    pub mtu: Option<u16>,
}

impl ClientConfig {
    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or("tun0")
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }
}

impl VpnConfig {
    fn from_map(
        map: HashMap<String, HashMap<String, Option<String>>>,
    ) -> Result<Self, ConfigError> {
        let json = serde_json::to_string(&map).map_err(|_| ConfigError::ParseError)?;

        serde_json::from_str(&json).map_err(|_| ConfigError::ParseError)
    }

    /// The config is plain INI. Parsing goes through a hashmap and then
    /// json to be deserialized with serde.
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config = configparser::ini::Ini::new();
        let config = config.read(raw.to_string()).map_err(|e| {
            log::error!("Cannot parse the following config, got {e:?}\n{raw}");
            ConfigError::ParseError
        })?;
        Self::from_map(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_str(&raw)
    }
}
