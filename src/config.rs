use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::ia::IaType;

pub const DEFAULT_LISTEN_PORT: u16 = 547;
pub const DEFAULT_ALLOCATION_ATTEMPTS: u32 = 100;
pub const DEFAULT_PREFIX_ALLOCATION_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_duid: String,
    pub listen_port: u16,
    pub interfaces: Vec<InterfaceConfig>,
    pub leases_file: String,
    pub lease_commit_interval_ms: u64,
    pub expiry_interval_seconds: u64,
    pub prefix_length_mode: PrefixLengthMode,
    pub allocation_attempts: u32,
    pub prefix_allocation_attempts: u32,
    pub release_on_roam: bool,
    pub rate_limit_per_second: u32,
    pub options: ScopeOptions,
    pub shared_networks: Vec<SharedNetworkConfig>,
    pub classes: Vec<ClassConfig>,
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    #[serde(default)]
    pub index: Option<u32>,
    pub shared_network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedNetworkConfig {
    pub name: String,
    pub subnets: Vec<SubnetConfig>,
    #[serde(default)]
    pub ponds: Vec<PondConfig>,
    #[serde(default)]
    pub options: ScopeOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub prefix: Ipv6Net,
    #[serde(default)]
    pub options: ScopeOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PondConfig {
    #[serde(default)]
    pub permit: Vec<Permit>,
    #[serde(default)]
    pub prohibit: Vec<Permit>,
    #[serde(default)]
    pub use_eui64: bool,
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub options: ScopeOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub kind: IaType,
    pub range: PoolRange,
    #[serde(default)]
    pub prefix_length: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoolRange {
    Cidr(Ipv6Net),
    Span { start: Ipv6Addr, end: Ipv6Addr },
}

/// Client predicate used in a pond's permit and prohibit lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permit {
    KnownClients,
    UnknownClients,
    AllClients,
    Class(String),
}

/// Server-wide policy for matching a client's prefix-length hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixLengthMode {
    Ignore,
    Prefer,
    #[default]
    Exact,
    Minimum,
    Maximum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    pub duid_prefix: String,
    #[serde(default)]
    pub options: ScopeOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub duid: String,
    #[serde(default)]
    pub fixed_addresses: Vec<Ipv6Addr>,
    #[serde(default)]
    pub fixed_prefixes: Vec<Ipv6Net>,
    #[serde(default)]
    pub options: ScopeOptions,
}

/// Option values settable at any scope. Unset fields inherit from the
/// enclosing scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_lease_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_lifetime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebinding_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_tee_times: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_threshold: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_addrs_per_ia: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_prefs_per_ia: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_threshold_high: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_threshold_low: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_updates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_static_leases: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unicast: Option<Ipv6Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rapid_commit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preference: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_servers: Option<Vec<Ipv6Addr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_search: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub information_refresh_time: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_commit: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_expiry: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_release: Vec<String>,
}

/// Parses a DUID written as hex, with or without colon separators.
pub fn parse_duid(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| *c != ':').collect();
    let duid = hex::decode(&digits)
        .map_err(|error| Error::InvalidConfig(format!("invalid DUID {:?}: {}", text, error)))?;
    if duid.is_empty() {
        return Err(Error::InvalidConfig("DUID must not be empty".to_string()));
    }
    Ok(duid)
}

/// Formats a DUID as colon-separated hex.
pub fn format_duid(duid: &[u8]) -> String {
    duid.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Generates a DUID-UUID (RFC 6355) from random bytes.
pub fn generate_duid() -> String {
    let mut duid = vec![0u8, 4];
    duid.extend_from_slice(&rand::random::<[u8; 16]>());
    format_duid(&duid)
}

impl Default for Config {
    fn default() -> Self {
        let lan = Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 0);
        Self {
            server_duid: generate_duid(),
            listen_port: DEFAULT_LISTEN_PORT,
            interfaces: vec![InterfaceConfig {
                name: "eth0".to_string(),
                index: None,
                shared_network: "lan".to_string(),
            }],
            leases_file: "leases6.json".to_string(),
            lease_commit_interval_ms: 5000,
            expiry_interval_seconds: 60,
            prefix_length_mode: PrefixLengthMode::Exact,
            allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
            prefix_allocation_attempts: DEFAULT_PREFIX_ALLOCATION_ATTEMPTS,
            release_on_roam: false,
            rate_limit_per_second: 10,
            options: ScopeOptions {
                default_lease_time: Some(43200),
                set_tee_times: Some(true),
                dns_servers: Some(vec![Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)]),
                ..Default::default()
            },
            shared_networks: vec![SharedNetworkConfig {
                name: "lan".to_string(),
                subnets: Ipv6Net::new(lan, 64)
                    .into_iter()
                    .map(|prefix| SubnetConfig {
                        prefix,
                        options: ScopeOptions::default(),
                    })
                    .collect(),
                ponds: vec![PondConfig {
                    pools: vec![PoolConfig {
                        kind: IaType::Na,
                        range: PoolRange::Span {
                            start: Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 0x1000),
                            end: Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 0x1fff),
                        },
                        prefix_length: None,
                    }],
                    ..Default::default()
                }],
                options: ScopeOptions::default(),
            }],
            classes: Vec::new(),
            hosts: Vec::new(),
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn server_duid_bytes(&self) -> Result<Vec<u8>> {
        parse_duid(&self.server_duid)
    }

    pub fn validate(&self) -> Result<()> {
        self.server_duid_bytes()?;

        if self.allocation_attempts == 0 || self.prefix_allocation_attempts == 0 {
            return Err(Error::InvalidConfig(
                "allocation attempts must be greater than 0".to_string(),
            ));
        }

        self.options.validate("global")?;

        let mut names = HashSet::new();
        for network in &self.shared_networks {
            if !names.insert(network.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate shared network {}",
                    network.name
                )));
            }
            network.validate()?;
        }

        for interface in &self.interfaces {
            if !names.contains(interface.shared_network.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "interface {} refers to unknown shared network {}",
                    interface.name, interface.shared_network
                )));
            }
        }

        for class in &self.classes {
            hex::decode(class.duid_prefix.replace(':', "")).map_err(|error| {
                Error::InvalidConfig(format!("class {} has invalid duid_prefix: {}", class.name, error))
            })?;
            class.options.validate(&class.name)?;
        }

        for host in &self.hosts {
            parse_duid(&host.duid)?;
            host.options.validate(&host.name)?;
            for address in &host.fixed_addresses {
                if self.subnet_containing(*address).is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "fixed address {} for host {} is not inside any subnet",
                        address, host.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn subnet_containing(&self, address: Ipv6Addr) -> Option<&SubnetConfig> {
        self.shared_networks
            .iter()
            .flat_map(|network| network.subnets.iter())
            .find(|subnet| subnet.prefix.contains(&address))
    }
}

impl SharedNetworkConfig {
    fn validate(&self) -> Result<()> {
        if self.subnets.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "shared network {} has no subnets",
                self.name
            )));
        }
        self.options.validate(&self.name)?;
        for subnet in &self.subnets {
            subnet.options.validate(&subnet.prefix.to_string())?;
        }

        for pond in &self.ponds {
            pond.options.validate(&self.name)?;
            for pool in &pond.pools {
                pool.validate()?;
                let (start, end) = pool.range.bounds();
                let inside = self
                    .subnets
                    .iter()
                    .any(|subnet| subnet.prefix.contains(&start) && subnet.prefix.contains(&end));
                if pool.kind != IaType::Pd && !inside {
                    return Err(Error::InvalidConfig(format!(
                        "pool {}-{} is not inside any subnet of shared network {}",
                        start, end, self.name
                    )));
                }
                if pond.use_eui64 && pool.kind != IaType::Na {
                    return Err(Error::InvalidConfig(format!(
                        "EUI-64 pond in shared network {} may only contain address pools",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        let (start, end) = self.range.bounds();
        if u128::from(start) > u128::from(end) {
            return Err(Error::InvalidConfig(format!(
                "pool start {} must be less than or equal to end {}",
                start, end
            )));
        }

        match (self.kind, self.prefix_length) {
            (IaType::Pd, None) => Err(Error::InvalidConfig(format!(
                "prefix pool {}-{} needs a prefix_length",
                start, end
            ))),
            (IaType::Pd, Some(length)) => {
                let PoolRange::Cidr(net) = self.range else {
                    return Err(Error::InvalidConfig(
                        "prefix pools must be given as a CIDR range".to_string(),
                    ));
                };
                if length < net.prefix_len() || length > 128 {
                    return Err(Error::InvalidConfig(format!(
                        "prefix_length {} does not fit inside {}",
                        length, net
                    )));
                }
                Ok(())
            }
            (_, Some(_)) => Err(Error::InvalidConfig(
                "prefix_length is only valid for prefix pools".to_string(),
            )),
            (_, None) => Ok(()),
        }
    }
}

impl PoolRange {
    /// First and last address covered by the range.
    pub fn bounds(&self) -> (Ipv6Addr, Ipv6Addr) {
        match self {
            Self::Cidr(net) => (net.network(), net.broadcast()),
            Self::Span { start, end } => (*start, *end),
        }
    }

    /// Splits the range into the fewest aligned CIDR blocks covering it.
    pub fn to_cidrs(&self) -> Vec<Ipv6Net> {
        match self {
            Self::Cidr(net) => vec![net.trunc()],
            Self::Span { start, end } => ipnet::Ipv6Subnets::new(*start, *end, 0).collect(),
        }
    }
}

impl ScopeOptions {
    fn validate(&self, scope: &str) -> Result<()> {
        for (name, value) in [
            ("log_threshold_high", self.log_threshold_high),
            ("log_threshold_low", self.log_threshold_low),
        ] {
            if value.is_some_and(|percent| percent > 100) {
                return Err(Error::InvalidConfig(format!(
                    "{} in {} must be between 0 and 100",
                    name, scope
                )));
            }
        }

        if self.cache_threshold.is_some_and(|percent| percent >= 100) {
            return Err(Error::InvalidConfig(format!(
                "cache_threshold in {} must be between 0 and 99",
                scope
            )));
        }

        if self.default_lease_time == Some(0) {
            return Err(Error::InvalidConfig(format!(
                "default_lease_time in {} must be greater than 0",
                scope
            )));
        }

        Ok(())
    }
}
