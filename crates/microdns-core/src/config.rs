use crate::error::ConfigError;
use crate::types::InstanceMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level config tree, loaded from a single TOML file (the `ConfigLoader`
/// boundary named in §2; see SPEC_FULL §2.1/§6 for why TOML+serde stands in
/// for the ISC-like text grammar the original daemons parsed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub instance: InstanceConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub dhcp: Option<DhcpConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    #[serde(default)]
    pub mode: InstanceMode,
}

/// A single DNS server process serves both roles per datagram: it tries the
/// authoritative zones named here, then the cache, then forwards upstream
/// (§4.12). The donor split this into a separate authoritative daemon and a
/// separate recursor daemon, each with its own listener; this config merges
/// them into the one pipeline the spec describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dns_listen")]
    pub listen: String,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    /// Per-zone forwarders: domain suffix -> upstream `host:port` list (§4.12, donor `forward.rs`).
    #[serde(default)]
    pub forward_zones: HashMap<String, Vec<String>>,
    /// Default upstream used when no `forward_zones` entry matches.
    #[serde(default = "default_upstreams")]
    pub upstream: Vec<String>,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u32,
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_dns_listen(),
            zones: Vec::new(),
            forward_zones: HashMap::new(),
            upstream: default_upstreams(),
            cache_size: default_cache_size(),
            cache_ttl_secs: default_cache_ttl(),
            forward_timeout_secs: default_forward_timeout(),
        }
    }
}

/// Corresponds to §6's `zone "<name>" { type master; file "<f>"; };` blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    #[serde(default)]
    pub v4: Option<DhcpV4Config>,
    #[serde(default)]
    pub v6: Option<DhcpV6Config>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpV4Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interface: String,
    #[serde(default = "default_lease_file_v4")]
    pub lease_file: PathBuf,
    #[serde(default = "default_workers_v4")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_check_interval")]
    pub expiration_check_interval_secs: u64,
    pub pools: Vec<DhcpV4Pool>,
    #[serde(default)]
    pub reservations: Vec<DhcpReservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpV4Pool {
    pub range_start: String,
    pub range_end: String,
    pub subnet: String,
    pub router: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub ntp: Vec<String>,
    #[serde(default)]
    pub netbios: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_lease_time")]
    pub default_lease_time_secs: u32,
    #[serde(default = "default_max_lease_time")]
    pub max_lease_time_secs: u32,
    #[serde(default)]
    pub t1_secs: Option<u32>,
    #[serde(default)]
    pub t2_secs: Option<u32>,
    #[serde(default = "default_true")]
    pub authoritative: bool,
    /// `ping-check` in ISC-dhcpd terms: whether to ICMP-probe before offering.
    #[serde(default = "default_true")]
    pub ping_check: bool,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Parsed but not acted upon (DDNS-from-DHCP is a Non-goal, §1).
    #[serde(default)]
    pub ddns_update_style: Option<String>,
    #[serde(default)]
    pub next_server: Option<String>,
    #[serde(default)]
    pub boot_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpReservation {
    pub mac: String,
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpV6Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interface: String,
    #[serde(default = "default_lease_file_v6")]
    pub lease_file: PathBuf,
    #[serde(default = "default_workers_v6")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_check_interval")]
    pub expiration_check_interval_secs: u64,
    pub pools: Vec<DhcpV6Pool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpV6Pool {
    /// `subnet6 <addr>/<plen>` in §6's grammar.
    pub subnet: String,
    pub subnet_prefix_len: u8,
    /// `range6 <start>-<end>` within the subnet.
    pub range_start: String,
    pub range_end: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_lease_time")]
    pub default_lease_time_secs: u32,
    #[serde(default = "default_max_lease_time")]
    pub max_lease_time_secs: u32,
    #[serde(default = "default_true")]
    pub ping_check: bool,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// `prefix6 <start>-<end> /<dplen>` — optional Prefix Delegation pool.
    #[serde(default)]
    pub pd: Option<DhcpV6PdPool>,
    #[serde(default)]
    pub sntp: Vec<String>,
    #[serde(default)]
    pub info_refresh_secs: Option<u32>,
    #[serde(default)]
    pub preference: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpV6PdPool {
    pub range_start: String,
    pub range_end: String,
    pub delegated_prefix_len: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_dns_listen() -> String {
    "0.0.0.0:53".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_cache_size() -> usize {
    10_000
}
fn default_cache_ttl() -> u32 {
    60
}
fn default_forward_timeout() -> u64 {
    2
}
fn default_upstreams() -> Vec<String> {
    vec!["8.8.8.8:53".to_string(), "1.1.1.1:53".to_string()]
}
fn default_lease_time() -> u32 {
    3600
}
fn default_max_lease_time() -> u32 {
    7200
}
fn default_ping_timeout_ms() -> u64 {
    750
}
fn default_workers_v4() -> usize {
    4
}
fn default_workers_v6() -> usize {
    8
}
fn default_queue_capacity() -> usize {
    256
}
fn default_check_interval() -> u64 {
    60
}
fn default_lease_file_v4() -> PathBuf {
    PathBuf::from("/var/lib/microdns/dhcpv4.leases")
}
fn default_lease_file_v6() -> PathBuf {
    PathBuf::from("/var/lib/microdns/dhcpv6.leases")
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: Box::new(e),
        })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_str = r#"
[instance]
id = "test-01"
mode = "standalone"

[logging]
level = "debug"
format = "text"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.instance.id, "test-01");
        assert_eq!(config.instance.mode, InstanceMode::Standalone);
    }

    #[test]
    fn parses_dhcp_v4_pool_with_reservations() {
        let toml_str = r#"
[instance]
id = "test-dhcp"

[dhcp.v4]
interface = "eth0"

[[dhcp.v4.pools]]
range_start = "192.168.1.100"
range_end = "192.168.1.199"
subnet = "192.168.1.0/24"
router = "192.168.1.1"
dns = ["192.168.1.1"]

[[dhcp.v4.reservations]]
mac = "AA:BB:CC:DD:EE:FF"
ip = "192.168.1.10"
hostname = "server1"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let v4 = config.dhcp.unwrap().v4.unwrap();
        assert_eq!(v4.workers, 4);
        assert_eq!(v4.pools[0].router, "192.168.1.1");
        assert_eq!(v4.reservations[0].hostname.as_deref(), Some("server1"));
    }

    #[test]
    fn parses_dhcp_v6_pool_with_pd() {
        let toml_str = r#"
[instance]
id = "test-dhcp6"

[dhcp.v6]
interface = "eth0"

[[dhcp.v6.pools]]
subnet = "2001:db8:1::"
subnet_prefix_len = 64
range_start = "2001:db8:1::100"
range_end = "2001:db8:1::1ff"

[dhcp.v6.pools.pd]
range_start = "2001:db8:3::"
range_end = "2001:db8:3:ff00::"
delegated_prefix_len = 56
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let v6 = config.dhcp.unwrap().v6.unwrap();
        assert_eq!(v6.workers, 8);
        let pd = v6.pools[0].pd.as_ref().unwrap();
        assert_eq!(pd.delegated_prefix_len, 56);
    }

    #[test]
    fn parses_dns_sections() {
        let toml_str = r#"
[instance]
id = "test-dns"

[dns]
zones = [{ name = "example.com", file = "/etc/microdns/zones/example.com.zone" }]
upstream = ["8.8.8.8:53"]

[dns.forward_zones]
"corp.local" = ["10.0.1.1:53"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dns.zones[0].name, "example.com");
        assert!(config.dns.forward_zones.contains_key("corp.local"));
        assert_eq!(config.dns.upstream, vec!["8.8.8.8:53".to_string()]);
    }
}
