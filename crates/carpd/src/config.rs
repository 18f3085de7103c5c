//! Configuration loading and validation for carpd

use carp::{Balancing, CARP_MAX_SKEW, CARP_MAXNODES, CarpOptions, MacAddr, VhidConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),
}

impl From<ConfigError> for common::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::IoError(e) => common::Error::Io(e),
            other => common::Error::config(other),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub options: CarpOptions,

    #[serde(default)]
    pub interfaces: Vec<InterfaceSettings>,

    #[serde(default)]
    pub coordinators: Vec<CoordinatorSettings>,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        for iface in &self.interfaces {
            iface.validate()?;
        }
        for sc in &self.coordinators {
            sc.validate()?;
        }
        self.metrics.validate()?;
        self.check_references()
    }
}

/// A parent link the daemon opens sockets on
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InterfaceSettings {
    #[validate(length(min = 1, max = 15))]
    pub name: String,

    /// Hardware address; read from sysfs when absent
    #[validate(custom = "validate_lladdr")]
    pub lladdr: Option<String>,

    /// The link does not echo our own multicast back
    #[serde(default = "default_simplex")]
    pub simplex: bool,
}

/// A carp interface and its virtual hosts
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CoordinatorSettings {
    #[validate(length(min = 1, max = 15))]
    pub name: String,

    /// Parent link, one of `interfaces`
    #[validate(length(min = 1))]
    pub carpdev: String,

    #[validate(length(min = 1), custom = "validate_vhid_list")]
    pub vhids: Vec<VhidConfig>,

    #[serde(default = "default_advbase")]
    #[validate(range(max = 255))]
    pub advbase: u32,

    #[serde(default)]
    pub passphrase: Option<String>,

    /// Unicast peer instead of the multicast group
    #[serde(default)]
    pub peer: Option<Ipv4Addr>,

    #[serde(default)]
    pub balancing: Option<Balancing>,

    #[serde(default)]
    pub addresses: Vec<IpAddr>,

    /// Interface groups besides the implicit "carp"
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    /// `text` or `json`
    pub format: Option<String>,
}

impl LoggingSettings {
    pub fn json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

// Default implementations

fn default_simplex() -> bool {
    true
}

fn default_advbase() -> u32 {
    1
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9128".to_string(),
        }
    }
}

// Custom validators

/// Parse `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(text: &str) -> Option<MacAddr> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in &mut mac {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

fn validate_lladdr(lladdr: &str) -> Result<(), ValidationError> {
    match parse_mac(lladdr) {
        Some(mac) if mac[0] & 1 == 0 => Ok(()),
        Some(_) => Err(ValidationError::new("lladdr_multicast")),
        None => Err(ValidationError::new("lladdr_invalid_format")),
    }
}

fn validate_vhid_list(vhids: &[VhidConfig]) -> Result<(), ValidationError> {
    if vhids.len() > CARP_MAXNODES {
        return Err(ValidationError::new("too_many_vhids"));
    }
    let mut seen = HashSet::new();
    for v in vhids {
        if v.vhid == 0 {
            return Err(ValidationError::new("vhid_zero"));
        }
        if v.advskew > CARP_MAX_SKEW {
            return Err(ValidationError::new("advskew_out_of_range"));
        }
        if !seen.insert(v.vhid) {
            return Err(ValidationError::new("duplicate_vhid"));
        }
    }
    Ok(())
}

fn validate_listen_addr(listen: &str) -> Result<(), ValidationError> {
    listen
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => Err(ConfigError::FileNotFound),
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/carp/carpd.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./carpd.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/carp/carpd.yaml"))
    }

    /// Names must be unique and every carpdev must be a declared interface.
    /// Vhids may not repeat between coordinators sharing a parent.
    fn check_references(&self) -> Result<(), ValidationErrors> {
        let fail = |field: &'static str, code: &'static str| -> Result<(), ValidationErrors> {
            let mut errors = ValidationErrors::new();
            errors.add(field, ValidationError::new(code));
            Err(errors)
        };

        let mut names = HashSet::new();
        for iface in &self.interfaces {
            if !names.insert(iface.name.as_str()) {
                return fail("interfaces", "duplicate_interface");
            }
        }

        let mut vhids = HashSet::new();
        for sc in &self.coordinators {
            if !names.insert(sc.name.as_str()) {
                return fail("coordinators", "duplicate_name");
            }
            if !self.interfaces.iter().any(|i| i.name == sc.carpdev) {
                return fail("coordinators", "unknown_carpdev");
            }
            for v in &sc.vhids {
                if !vhids.insert((sc.carpdev.as_str(), v.vhid)) {
                    return fail("coordinators", "vhid_clash");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
options:
  preempt: true

interfaces:
  - name: eth0
    lladdr: "52:54:00:12:34:56"

coordinators:
  - name: carp0
    carpdev: eth0
    vhids:
      - vhid: 1
      - vhid: 2
        advskew: 100
    passphrase: secret
    addresses: [192.0.2.1, "2001:db8::1"]
    groups: [web]

metrics:
  enabled: true
  listen: "0.0.0.0:9128"

logging:
  level: debug
  format: json
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.options.allow);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_valid_yaml_parsing() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert!(config.options.preempt);
        assert!(config.options.allow);

        assert_eq!(config.interfaces.len(), 1);
        assert!(config.interfaces[0].simplex);

        let sc = &config.coordinators[0];
        assert_eq!(sc.advbase, 1);
        assert_eq!(sc.vhids, vec![VhidConfig::new(1, 0), VhidConfig::new(2, 100)]);
        assert_eq!(sc.addresses.len(), 2);
        assert_eq!(sc.balancing, None);

        assert!(config.metrics.enabled);
        assert!(config.logging.json());
    }

    #[test]
    fn test_balancing_names() {
        let yaml = SAMPLE.replace("passphrase: secret", "passphrase: secret\n    balancing: ip-stealth");
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.coordinators[0].balancing, Some(Balancing::IpStealth));
    }

    #[test]
    fn test_unknown_carpdev_rejected() {
        let yaml = SAMPLE.replace("carpdev: eth0", "carpdev: eth9");
        assert!(matches!(Config::from_yaml(&yaml), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_duplicate_vhid_rejected() {
        let yaml = SAMPLE.replace("- vhid: 2", "- vhid: 1");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_vhid_clash_between_coordinators_rejected() {
        let yaml = SAMPLE.replace(
            "metrics:",
            "  - name: carp1\n    carpdev: eth0\n    vhids: [{vhid: 2}]\n\nmetrics:",
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_skew_out_of_range_rejected() {
        let yaml = SAMPLE.replace("advskew: 100", "advskew: 255");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_advbase_out_of_range_rejected() {
        let yaml = SAMPLE.replace("passphrase: secret", "passphrase: secret\n    advbase: 300");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_listen_addr_validation() {
        assert!(validate_listen_addr("127.0.0.1:9128").is_ok());
        assert!(validate_listen_addr("[::1]:9128").is_ok());
        assert!(validate_listen_addr("localhost").is_err());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("52:54:00:12:34:56"), Some([0x52, 0x54, 0, 0x12, 0x34, 0x56]));
        assert_eq!(parse_mac("0:0:5e:0:1:1\n"), Some([0, 0, 0x5e, 0, 1, 1]));
        assert_eq!(parse_mac("52:54:00:12:34"), None);
        assert_eq!(parse_mac("52:54:00:12:34:56:78"), None);
        assert_eq!(parse_mac("zz:54:00:12:34:56"), None);

        assert!(validate_lladdr("01:00:5e:00:00:12").is_err());
    }

    #[test]
    fn test_config_error_into_common() {
        let err: common::Error = Config::from_yaml("coordinators: 7").unwrap_err().into();
        assert!(matches!(err, common::Error::Config(_)));

        let err: common::Error = Config::load_from_file("/nonexistent/carpd.yaml").unwrap_err().into();
        assert!(matches!(err, common::Error::Io(_)));
    }
}
