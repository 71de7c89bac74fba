//! Network topology and the shared-network resolver.
//!
//! The topology is built once from the configuration and never changes
//! afterwards. Shared networks, subnets, classes and hosts are addressed by
//! flat indices, which double as their [`ScopeRef`](crate::scope::ScopeRef)
//! indices.

use ipnet::Ipv6Net;
use std::net::Ipv6Addr;

use crate::config::{Config, parse_duid};
use crate::error::{Error, Result};
use crate::packet::{Dhcp6Packet, ReceiveInfo, RelayPacket};

#[derive(Debug, Clone)]
pub struct SharedNetwork {
    pub name: String,
    pub subnets: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub prefix: Ipv6Net,
    pub network: usize,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: Option<u32>,
    pub network: usize,
}

/// A client class matched by DUID prefix.
#[derive(Debug, Clone)]
pub struct ClientClass {
    pub name: String,
    pub duid_prefix: Vec<u8>,
}

/// A host reservation.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: usize,
    pub name: String,
    pub duid: Vec<u8>,
    pub fixed_addresses: Vec<Ipv6Addr>,
    pub fixed_prefixes: Vec<Ipv6Net>,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub networks: Vec<SharedNetwork>,
    pub subnets: Vec<Subnet>,
    pub interfaces: Vec<Interface>,
    pub classes: Vec<ClientClass>,
    pub hosts: Vec<Host>,
}

impl Topology {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut topology = Topology::default();

        for (network_id, network) in config.shared_networks.iter().enumerate() {
            let mut subnets = Vec::with_capacity(network.subnets.len());
            for subnet in &network.subnets {
                subnets.push(topology.subnets.len());
                topology.subnets.push(Subnet {
                    prefix: subnet.prefix.trunc(),
                    network: network_id,
                });
            }
            topology.networks.push(SharedNetwork {
                name: network.name.clone(),
                subnets,
            });
        }

        for interface in &config.interfaces {
            let network = topology
                .network_by_name(&interface.shared_network)
                .ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "interface {} refers to unknown shared network {}",
                        interface.name, interface.shared_network
                    ))
                })?;
            topology.interfaces.push(Interface {
                name: interface.name.clone(),
                index: interface.index,
                network,
            });
        }

        for class in &config.classes {
            let digits = class.duid_prefix.replace(':', "");
            let duid_prefix = hex::decode(&digits).map_err(|error| {
                Error::InvalidConfig(format!("class {}: {}", class.name, error))
            })?;
            topology.classes.push(ClientClass {
                name: class.name.clone(),
                duid_prefix,
            });
        }

        for (id, host) in config.hosts.iter().enumerate() {
            topology.hosts.push(Host {
                id,
                name: host.name.clone(),
                duid: parse_duid(&host.duid)?,
                fixed_addresses: host.fixed_addresses.clone(),
                fixed_prefixes: host.fixed_prefixes.iter().map(|net| net.trunc()).collect(),
            });
        }

        Ok(topology)
    }

    pub fn network_by_name(&self, name: &str) -> Option<usize> {
        self.networks.iter().position(|network| network.name == name)
    }

    pub fn network_name(&self, network: usize) -> &str {
        self.networks
            .get(network)
            .map(|n| n.name.as_str())
            .unwrap_or("(no name)")
    }

    /// Finds the subnet containing `address`, in any shared network.
    pub fn subnet_for_address(&self, address: Ipv6Addr) -> Option<usize> {
        self.subnets
            .iter()
            .position(|subnet| subnet.prefix.contains(&address))
    }

    /// Finds the subnet of `network` containing `address`.
    pub fn subnet_in_network(&self, network: usize, address: Ipv6Addr) -> Option<usize> {
        self.networks.get(network).and_then(|shared| {
            shared
                .subnets
                .iter()
                .copied()
                .find(|id| self.subnets[*id].prefix.contains(&address))
        })
    }

    pub fn has_subnets(&self, network: usize) -> bool {
        self.networks
            .get(network)
            .is_some_and(|shared| !shared.subnets.is_empty())
    }

    /// Maps a message to the shared network whose pools it may draw from.
    ///
    /// `relays` is the chain of enclosing Relay-Forward messages, outermost
    /// first. The relay nearest the client with a usable link address wins;
    /// unspecified and link-local link addresses are skipped. Without one,
    /// the receiving interface decides.
    pub fn resolve(&self, relays: &[RelayPacket], info: &ReceiveInfo) -> Option<usize> {
        let link = relays.iter().rev().map(|relay| relay.link_address).find(|address| {
            !address.is_unspecified() && !address.is_unicast_link_local()
        });

        if let Some(address) = link {
            return self
                .subnet_for_address(address)
                .map(|subnet| self.subnets[subnet].network);
        }

        let name = info.interface.as_deref()?;
        self.interfaces
            .iter()
            .find(|interface| interface.name == name)
            .map(|interface| interface.network)
    }

    /// Maps a message to a shared network through the first address or
    /// prefix the client put in its IAs: IA_NA, then IA_PD, then IA_TA.
    pub fn resolve_by_requested_address(&self, packet: &Dhcp6Packet) -> Option<usize> {
        let requested = packet
            .ia_na()
            .find_map(|ia| ia.addresses().next().map(|a| a.address))
            .or_else(|| {
                packet
                    .ia_pd()
                    .find_map(|ia| ia.prefixes().next().map(|p| p.prefix))
            })
            .or_else(|| {
                packet
                    .ia_ta()
                    .find_map(|ia| ia.addresses().next().map(|a| a.address))
            })?;

        self.subnet_for_address(requested)
            .map(|subnet| self.subnets[subnet].network)
    }

    /// Host reservations for a client DUID, in declaration order.
    pub fn find_hosts(&self, duid: &[u8]) -> Vec<&Host> {
        self.hosts.iter().filter(|host| host.duid == duid).collect()
    }

    /// Narrows host reservations to the one usable on `network`.
    ///
    /// A host whose fixed address lies in one of the network's subnets
    /// wins; otherwise the first host without fixed addresses is used as a
    /// soft match.
    pub fn seek_shared_host<'a>(&self, hosts: &[&'a Host], network: usize) -> Option<&'a Host> {
        hosts
            .iter()
            .find(|host| {
                host.fixed_addresses
                    .iter()
                    .any(|address| self.subnet_in_network(network, *address).is_some())
            })
            .or_else(|| hosts.iter().find(|host| host.fixed_addresses.is_empty()))
            .copied()
    }

    /// Returns the indices of the classes whose DUID prefix matches.
    pub fn classify(&self, duid: &[u8]) -> Vec<usize> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(_, class)| duid.starts_with(&class.duid_prefix))
            .map(|(index, _)| index)
            .collect()
    }
}
