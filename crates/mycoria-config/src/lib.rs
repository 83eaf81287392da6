//! # mycoria-config
//!
//! The YAML configuration file: the `router` section with the persisted
//! identity and peering policy, and the `system` section with host-side
//! settings. The `services`, `friends` and `resolve` sections are parsed
//! but carried opaquely for their out-of-process consumers.

use std::net::Ipv6Addr;
use std::path::Path;

use mycoria_addr::address::{HashAlg, KeyType, PrivateIdentity};
use serde::{Deserialize, Serialize};

/// Error types for configuration handling.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_norway::Error),

    #[error("config validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Bounds and default of `router.minAutoConnect`.
pub const MIN_AUTO_CONNECT_RANGE: std::ops::RangeInclusive<usize> = 1..=25;

/// Complete configuration file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub system: SystemConfig,
    /// Service announcements; consumed by the dashboard and DNS responder.
    #[serde(default)]
    pub services: serde_norway::Value,
    /// Operator-declared trusted peers.
    #[serde(default)]
    pub friends: serde_norway::Value,
    /// Resolver overrides for `.myco` names.
    #[serde(default)]
    pub resolve: serde_norway::Value,
}

/// The `router` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Persisted identity; absent until first generation.
    #[serde(default)]
    pub address: Option<AddressConfig>,
    /// Overlay partition; routers in different universes do not peer.
    #[serde(default = "default_universe")]
    pub universe: String,
    /// Shared secret gating membership of a closed universe.
    #[serde(default)]
    pub universe_secret: String,
    /// Listener URLs.
    #[serde(default)]
    pub listen: Vec<String>,
    /// Globally reachable hostnames or IPs to advertise.
    #[serde(default)]
    pub iana: Vec<String>,
    /// Peers to always connect to.
    #[serde(default)]
    pub connect: Vec<String>,
    /// Automatically connect to nearby routers.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Target link count for auto-connect (1..=25).
    #[serde(default = "default_min_auto_connect")]
    pub min_auto_connect: usize,
    /// Fallback peers when no link can be established.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Advertise this router as a dead end.
    #[serde(default)]
    pub stub: bool,
    /// Request reduced background traffic from peers.
    #[serde(default)]
    pub lite: bool,
    /// Do not talk to the clearnet at all.
    #[serde(default)]
    pub isolate: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            address: None,
            universe: default_universe(),
            universe_secret: String::new(),
            listen: Vec::new(),
            iana: Vec::new(),
            connect: Vec::new(),
            auto_connect: true,
            min_auto_connect: default_min_auto_connect(),
            bootstrap: Vec::new(),
            stub: false,
            lite: false,
            isolate: false,
        }
    }
}

/// The persisted identity record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressConfig {
    pub ip: Ipv6Addr,
    pub hash: HashAlg,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    /// Hex-encoded public key.
    pub public: String,
    /// Hex-encoded private key; opaque to everything but the router.
    pub private: String,
    #[serde(default)]
    pub easing: u64,
}

/// The `system` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    /// TUN interface name.
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
    /// Inner MTU.
    #[serde(default = "default_mtu")]
    pub tun_mtu: u16,
    /// Listen address of the internal HTTP API.
    #[serde(default)]
    pub api_listen: String,
    /// Path of the persisted state file.
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            tun_name: default_tun_name(),
            tun_mtu: default_mtu(),
            api_listen: String::new(),
            state_path: default_state_path(),
        }
    }
}

fn default_universe() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_auto_connect() -> usize {
    2
}

fn default_tun_name() -> String {
    "myco0".to_string()
}

fn default_mtu() -> u16 {
    9000
}

fn default_state_path() -> String {
    "state.json".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse and validate configuration text.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut config: Config = serde_norway::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to YAML, e.g. after identity generation.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_norway::to_string(self)?)
    }

    /// Validate and normalize. Failures here abort startup.
    pub fn validate(&mut self) -> Result<()> {
        self.router.min_auto_connect = self
            .router
            .min_auto_connect
            .clamp(*MIN_AUTO_CONNECT_RANGE.start(), *MIN_AUTO_CONNECT_RANGE.end());

        if self.system.tun_mtu < 1280 {
            return Err(ConfigError::Validation(format!(
                "tunMtu {} below the IPv6 minimum of 1280",
                self.system.tun_mtu
            )));
        }
        if let Some(address) = &self.router.address {
            // Surface corrupt identities at startup rather than at first use.
            address.to_identity()?;
        }
        Ok(())
    }
}

impl AddressConfig {
    /// Reconstruct the private identity, verifying the recorded address.
    pub fn to_identity(&self) -> Result<PrivateIdentity> {
        let private = hex::decode(&self.private)
            .map_err(|e| ConfigError::Validation(format!("bad private key hex: {e}")))?;
        let secret: [u8; 32] = private
            .try_into()
            .map_err(|_| ConfigError::Validation("private key must be 32 bytes".into()))?;

        let identity = PrivateIdentity::from_parts(&secret, self.easing);
        if identity.ip() != self.ip {
            return Err(ConfigError::Validation(format!(
                "recorded address {} does not match the key (derives {})",
                self.ip,
                identity.ip()
            )));
        }
        let public = hex::encode(identity.address().public_key.as_bytes());
        if public != self.public.to_lowercase() {
            return Err(ConfigError::Validation(
                "recorded public key does not match the private key".into(),
            ));
        }
        identity
            .address()
            .verify()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(identity)
    }

    /// Persist an identity.
    pub fn from_identity(identity: &PrivateIdentity) -> Self {
        let address = identity.address();
        Self {
            ip: address.ip,
            hash: address.hash,
            key_type: address.key_type,
            public: hex::encode(address.public_key.as_bytes()),
            private: hex::encode(identity.secret_bytes()),
            easing: address.easing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycoria_addr::generate::{generate, GenerateConfig};

    fn generated_identity() -> PrivateIdentity {
        generate(&GenerateConfig {
            max_tries: 1_000_000,
            ..GenerateConfig::default()
        })
        .expect("generate identity")
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("router: {}\n").expect("parse");
        assert_eq!(config.router.universe, "main");
        assert!(config.router.auto_connect);
        assert_eq!(config.router.min_auto_connect, 2);
        assert_eq!(config.system.tun_mtu, 9000);
        assert_eq!(config.system.tun_name, "myco0");
        assert!(config.router.address.is_none());
    }

    #[test]
    fn test_min_auto_connect_clamped() {
        let config = Config::parse("router:\n  minAutoConnect: 500\n").expect("parse");
        assert_eq!(config.router.min_auto_connect, 25);
        let config = Config::parse("router:\n  minAutoConnect: 0\n").expect("parse");
        assert_eq!(config.router.min_auto_connect, 1);
    }

    #[test]
    fn test_full_router_section() {
        let raw = "\
router:
  universe: test
  universeSecret: s3cret
  listen:
    - tcp:47369
  iana:
    - node1.example.com
  connect:
    - tcp://192.0.2.1:47369
  autoConnect: false
  bootstrap:
    - tcp://192.0.2.2:47369
  stub: true
  lite: true
system:
  tunName: myco1
  apiListen: '[fd00::b909]:80'
";
        let config = Config::parse(raw).expect("parse");
        assert_eq!(config.router.universe, "test");
        assert_eq!(config.router.universe_secret, "s3cret");
        assert_eq!(config.router.listen, vec!["tcp:47369"]);
        assert!(!config.router.auto_connect);
        assert!(config.router.stub);
        assert!(config.router.lite);
        assert_eq!(config.system.tun_name, "myco1");
    }

    #[test]
    fn test_mtu_validation() {
        assert!(Config::parse("system:\n  tunMtu: 500\n").is_err());
    }

    #[test]
    fn test_identity_roundtrip() {
        let identity = generated_identity();
        let record = AddressConfig::from_identity(&identity);
        let restored = record.to_identity().expect("restore");
        assert_eq!(restored.ip(), identity.ip());
    }

    #[test]
    fn test_identity_tamper_detected() {
        let identity = generated_identity();
        let mut record = AddressConfig::from_identity(&identity);
        record.easing += 1;
        assert!(record.to_identity().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_with_identity() {
        let identity = generated_identity();
        let mut config = Config::default();
        config.router.address = Some(AddressConfig::from_identity(&identity));
        let yaml = config.to_yaml().expect("to yaml");
        let restored = Config::parse(&yaml).expect("parse");
        let address = restored.router.address.expect("address");
        assert_eq!(address.ip, identity.ip());
    }
}
