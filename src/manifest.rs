//! Configuration file parsing for sitenet
//!
//! Parses `sitenet.toml` configuration files using serde

use crate::error::{Error, Result};
use crate::network::mac::{DEFAULT_MAC_PREFIX, validate_prefix};
use crate::probe::PingStyle;
use crate::remap::{NetworkRule, Resolver};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Load configuration from a file
pub fn load(path: &Path) -> Result<SitenetConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config: SitenetConfig = toml::from_str(&content)?;

    // Relative store paths live next to the config file
    if config.config.store.is_relative() {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.config.store = dir.join(&config.config.store);
        }
    }

    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SitenetConfig {
    /// Global configuration settings
    #[serde(default)]
    pub config: GlobalConfig,

    /// Site definitions
    #[serde(default)]
    pub sites: Vec<SiteConfig>,

    /// Network placement rules, in priority order
    #[serde(default)]
    pub networks: Vec<NetworkRule>,
}

impl SitenetConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Check for duplicate site ids
        let mut ids = HashSet::new();
        for site in &self.sites {
            if !ids.insert(&site.id) {
                return Err(Error::ConfigValidation(format!("Duplicate site id: {}", site.id)));
            }
        }

        for (idx, rule) in self.networks.iter().enumerate() {
            let Some(cidr) = rule.cidr else {
                continue;
            };
            if let Some(ip) = rule.first_static_ip.filter(|ip| !cidr.contains(*ip)) {
                return Err(Error::ConfigValidation(format!(
                    "networks[{}]: first_static_ip {} is outside {}",
                    idx, ip, cidr
                )));
            }
            if let Some(gw) = rule.gw.filter(|gw| !cidr.contains(*gw)) {
                return Err(Error::ConfigValidation(format!(
                    "networks[{}]: gw {} is outside {}",
                    idx, gw, cidr
                )));
            }
        }

        self.config.validate()
    }

    /// Get a site definition by id
    pub fn get_site(&self, id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.id == id)
    }

    /// Build the rule resolver for this configuration
    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.networks.clone())
    }
}

/// Global configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// JSON file holding network records
    #[serde(default = "default_store")]
    pub store: PathBuf,

    /// Binary used for liveness probes
    #[serde(default = "default_ping_command")]
    pub ping_command: String,

    /// Flag and exit conventions of `ping_command` ("linux" or "bsd")
    #[serde(default = "PingStyle::native")]
    pub ping_style: PingStyle,

    /// Echo requests per probe
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,

    /// Per-reply timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,

    /// Candidates probed concurrently
    #[serde(default = "default_probe_window")]
    pub probe_window: usize,

    /// Threads probing a window
    #[serde(default = "default_probe_workers")]
    pub probe_workers: usize,

    /// Reservations created when a virtual pool runs dry
    #[serde(default = "default_pool_expansion")]
    pub pool_expansion: usize,

    /// Fail allocation when probing itself fails
    #[serde(default)]
    pub strict_probe: bool,

    /// Two-byte prefix for derived virtual MACs
    #[serde(default = "default_mac_prefix")]
    pub mac_prefix: String,

    /// Interfaces whose addressing survives decommission
    #[serde(default = "default_protected_interfaces")]
    pub protected_interfaces: Vec<String>,
}

impl GlobalConfig {
    fn validate(&self) -> Result<()> {
        let counts = [
            ("probe_count", self.probe_count as usize),
            ("probe_timeout", self.probe_timeout as usize),
            ("probe_window", self.probe_window),
            ("probe_workers", self.probe_workers),
            ("pool_expansion", self.pool_expansion),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(Error::ConfigValidation(format!("{} must be at least 1", name)));
        }

        if self.ping_command.trim().is_empty() {
            return Err(Error::ConfigValidation("ping_command is empty".into()));
        }

        validate_prefix(&self.mac_prefix)
            .map_err(|e| Error::ConfigValidation(format!("mac_prefix: {}", e)))
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            ping_command: default_ping_command(),
            ping_style: PingStyle::native(),
            probe_count: default_probe_count(),
            probe_timeout: default_probe_timeout(),
            probe_window: default_probe_window(),
            probe_workers: default_probe_workers(),
            pool_expansion: default_pool_expansion(),
            strict_probe: false,
            mac_prefix: default_mac_prefix(),
            protected_interfaces: default_protected_interfaces(),
        }
    }
}

fn default_store() -> PathBuf {
    PathBuf::from("sitenet-records.json")
}

fn default_ping_command() -> String {
    "ping".to_string()
}

fn default_probe_count() -> u32 {
    2
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_probe_window() -> usize {
    4
}

fn default_probe_workers() -> usize {
    4
}

fn default_pool_expansion() -> usize {
    5
}

fn default_mac_prefix() -> String {
    DEFAULT_MAC_PREFIX.to_string()
}

fn default_protected_interfaces() -> Vec<String> {
    vec!["ipmi".to_string()]
}

/// A physical site
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site identifier, as used in domains (`prod.<site>.example.com`)
    pub id: String,

    /// Where the virtual reservation pool starts on an empty vlan
    pub first_virtual_ip: Option<Ipv4Addr>,

    #[serde(default)]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[[networks]]
vlan = 100
cidr = "10.10.0.0/24"
"#;

        let config: SitenetConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.networks.len(), 1);
        assert_eq!(config.config.probe_count, 2);
        assert_eq!(config.config.pool_expansion, 5);
        assert_eq!(config.config.mac_prefix, "14:6E");
        assert_eq!(config.config.protected_interfaces, vec!["ipmi"]);
        assert!(!config.config.strict_probe);
        assert_eq!(config.config.ping_style, PingStyle::native());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[config]
store = "/var/db/sitenet.json"
ping_command = "/sbin/ping"
ping_style = "bsd"
probe_count = 1
probe_timeout = 1
probe_window = 8
probe_workers = 8
pool_expansion = 10
strict_probe = true
mac_prefix = "02:AA"
protected_interfaces = ["ipmi", "bmc"]

[[sites]]
id = "iad1"
first_virtual_ip = "10.60.0.10"
description = "Ashburn"

[[networks]]
site_id = "iad1"
vlan = 100
nic = "eth0"
cidr = "10.10.0.0/24"
domain = "prod.iad1.example.com"
gw = "10.10.0.1"
realm = "prod"
first_static_ip = "10.10.0.10"
rack = "r12"
"#;

        let config: SitenetConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.config.store, PathBuf::from("/var/db/sitenet.json"));
        assert!(config.config.strict_probe);
        assert_eq!(config.config.ping_style, PingStyle::Bsd);
        assert_eq!(
            config.get_site("iad1").and_then(|s| s.first_virtual_ip),
            Some("10.60.0.10".parse().unwrap())
        );

        let rule = &config.networks[0];
        assert_eq!(rule.interface.as_deref(), Some("eth0"));
        assert_eq!(rule.column("rack").as_deref(), Some("r12"));
    }

    #[test]
    fn test_duplicate_site_error() {
        let toml = r#"
[[sites]]
id = "iad1"

[[sites]]
id = "iad1"
"#;

        let config: SitenetConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate site id"));
    }

    #[test]
    fn test_first_static_outside_cidr() {
        let toml = r#"
[[networks]]
vlan = 100
cidr = "10.10.0.0/24"
first_static_ip = "10.11.0.10"
"#;

        let config: SitenetConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_zero_probe_settings_rejected() {
        let toml = r#"
[config]
probe_window = 0
"#;

        let config: SitenetConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("probe_window"));
    }

    #[test]
    fn test_bad_mac_prefix_rejected() {
        let toml = r#"
[config]
mac_prefix = "14:6E:00"
"#;

        let config: SitenetConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_load_resolves_store_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sitenet.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[config]\nstore = \"records.json\"").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.config.store, dir.path().join("records.json"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/sitenet.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
