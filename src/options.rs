//! DHCPv6 options as defined in RFC 3315 and RFC 3633.
//!
//! Every DHCPv6 option is a 2-byte code, a 2-byte length and `length` bytes
//! of payload, all integers big-endian. The identity association options
//! (IA_NA, IA_TA, IA_PD) and the address/prefix options they carry
//! (IAADDR, IAPREFIX) nest further options inside their payload.
//!
//! This module implements parsing and encoding for the options a server
//! needs. Unknown options are preserved as [`Dhcp6Option::Unknown`] so that
//! relay and echo handling can forward them untouched.
//!
//! # References
//!
//! - RFC 3315: Dynamic Host Configuration Protocol for IPv6 (DHCPv6)
//! - RFC 3633: IPv6 Prefix Options for DHCPv6
//! - RFC 3646: DNS Configuration options for DHCPv6
//! - RFC 4994: DHCPv6 Relay Agent Echo Request Option
//! - RFC 8357: Generalized UDP Source Port for DHCP Relay

use std::net::Ipv6Addr;

use crate::error::{Error, Result};

/// Lifetime value meaning "never expires" (RFC 3315 §5.6).
pub const INFINITE_LIFETIME: u32 = 0xffff_ffff;

/// Size of an option header (code + length).
pub const OPTION_HEADER_SIZE: usize = 4;

/// Fixed part of an IA_NA/IA_PD payload: IAID, T1, T2.
pub const IA_NA_FIXED_SIZE: usize = 12;

/// Fixed part of an IA_TA payload: IAID.
pub const IA_TA_FIXED_SIZE: usize = 4;

/// Fixed part of an IAADDR payload: address, preferred, valid.
pub const IAADDR_FIXED_SIZE: usize = 24;

/// Fixed part of an IAPREFIX payload: preferred, valid, length, prefix.
pub const IAPREFIX_FIXED_SIZE: usize = 25;

/// DHCPv6 option codes.
///
/// Only codes used by this implementation are defined; unknown codes
/// are handled via [`Dhcp6Option::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OptionCode {
    /// Client DUID (RFC 3315 §22.2).
    ClientId = 1,
    /// Server DUID (RFC 3315 §22.3).
    ServerId = 2,
    /// Identity association for non-temporary addresses (RFC 3315 §22.4).
    IaNa = 3,
    /// Identity association for temporary addresses (RFC 3315 §22.5).
    IaTa = 4,
    /// Address inside an IA_NA or IA_TA (RFC 3315 §22.6).
    IaAddr = 5,
    /// Option request list (RFC 3315 §22.7).
    OptionRequest = 6,
    /// Server preference (RFC 3315 §22.8).
    Preference = 7,
    /// Elapsed time (RFC 3315 §22.9).
    ElapsedTime = 8,
    /// Encapsulated message inside a relay message (RFC 3315 §22.10).
    RelayMessage = 9,
    /// Server unicast address (RFC 3315 §22.12).
    Unicast = 12,
    /// Status code (RFC 3315 §22.13).
    StatusCode = 13,
    /// Rapid commit (RFC 3315 §22.14).
    RapidCommit = 14,
    /// Relay interface identifier (RFC 3315 §22.18).
    InterfaceId = 18,
    /// Reconfigure accept (RFC 3315 §22.20).
    ReconfigureAccept = 20,
    /// Recursive DNS servers (RFC 3646 §3).
    DnsServers = 23,
    /// Domain search list (RFC 3646 §4).
    DomainSearch = 24,
    /// Identity association for prefix delegation (RFC 3633 §9).
    IaPd = 25,
    /// Prefix inside an IA_PD (RFC 3633 §10).
    IaPrefix = 26,
    /// Information refresh time (RFC 4242).
    InformationRefreshTime = 32,
    /// Relay echo request (RFC 4994).
    EchoRequest = 43,
    /// Relay source port (RFC 8357).
    RelaySourcePort = 135,
}

impl TryFrom<u16> for OptionCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ClientId),
            2 => Ok(Self::ServerId),
            3 => Ok(Self::IaNa),
            4 => Ok(Self::IaTa),
            5 => Ok(Self::IaAddr),
            6 => Ok(Self::OptionRequest),
            7 => Ok(Self::Preference),
            8 => Ok(Self::ElapsedTime),
            9 => Ok(Self::RelayMessage),
            12 => Ok(Self::Unicast),
            13 => Ok(Self::StatusCode),
            14 => Ok(Self::RapidCommit),
            18 => Ok(Self::InterfaceId),
            20 => Ok(Self::ReconfigureAccept),
            23 => Ok(Self::DnsServers),
            24 => Ok(Self::DomainSearch),
            25 => Ok(Self::IaPd),
            26 => Ok(Self::IaPrefix),
            32 => Ok(Self::InformationRefreshTime),
            43 => Ok(Self::EchoRequest),
            135 => Ok(Self::RelaySourcePort),
            other => Err(other),
        }
    }
}

/// DHCPv6 message types (RFC 3315 §5.3, RFC 7341).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client multicast to locate servers.
    Solicit = 1,
    /// Server offer in response to SOLICIT.
    Advertise = 2,
    /// Client request for the advertised resources.
    Request = 3,
    /// Client asks whether its addresses are still on-link.
    Confirm = 4,
    /// Client extends leases with the server that granted them.
    Renew = 5,
    /// Client extends leases with any server.
    Rebind = 6,
    /// Server response carrying bindings or status.
    Reply = 7,
    /// Client gives leases back.
    Release = 8,
    /// Client reports an address as already in use.
    Decline = 9,
    /// Server asks the client to reconfigure.
    Reconfigure = 10,
    /// Client requests configuration without addresses.
    InformationRequest = 11,
    /// Relay agent forwarding a client message.
    RelayForw = 12,
    /// Server reply through a relay agent.
    RelayRepl = 13,
    /// Leasequery request (RFC 5007).
    Leasequery = 14,
    /// Leasequery reply (RFC 5007).
    LeasequeryReply = 15,
    /// DHCPv4 query over DHCPv6 (RFC 7341).
    Dhcpv4Query = 20,
    /// DHCPv4 response over DHCPv6 (RFC 7341).
    Dhcpv4Response = 21,
}

impl MessageType {
    /// Returns true for the relay message types, which use the relay header.
    pub fn is_relay(self) -> bool {
        matches!(self, Self::RelayForw | Self::RelayRepl)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Solicit),
            2 => Ok(Self::Advertise),
            3 => Ok(Self::Request),
            4 => Ok(Self::Confirm),
            5 => Ok(Self::Renew),
            6 => Ok(Self::Rebind),
            7 => Ok(Self::Reply),
            8 => Ok(Self::Release),
            9 => Ok(Self::Decline),
            10 => Ok(Self::Reconfigure),
            11 => Ok(Self::InformationRequest),
            12 => Ok(Self::RelayForw),
            13 => Ok(Self::RelayRepl),
            14 => Ok(Self::Leasequery),
            15 => Ok(Self::LeasequeryReply),
            20 => Ok(Self::Dhcpv4Query),
            21 => Ok(Self::Dhcpv4Response),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Solicit => "SOLICIT",
            Self::Advertise => "ADVERTISE",
            Self::Request => "REQUEST",
            Self::Confirm => "CONFIRM",
            Self::Renew => "RENEW",
            Self::Rebind => "REBIND",
            Self::Reply => "REPLY",
            Self::Release => "RELEASE",
            Self::Decline => "DECLINE",
            Self::Reconfigure => "RECONFIGURE",
            Self::InformationRequest => "INFORMATION-REQUEST",
            Self::RelayForw => "RELAY-FORW",
            Self::RelayRepl => "RELAY-REPL",
            Self::Leasequery => "LEASEQUERY",
            Self::LeasequeryReply => "LEASEQUERY-REPLY",
            Self::Dhcpv4Query => "DHCPV4-QUERY",
            Self::Dhcpv4Response => "DHCPV4-RESPONSE",
        };
        write!(f, "{}", name)
    }
}

/// Status codes carried in the Status Code option (RFC 3315 §24.4, RFC 3633 §16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Success = 0,
    UnspecFail = 1,
    NoAddrsAvail = 2,
    NoBinding = 3,
    NotOnLink = 4,
    UseMulticast = 5,
    NoPrefixAvail = 6,
}

impl TryFrom<u16> for StatusCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::UnspecFail),
            2 => Ok(Self::NoAddrsAvail),
            3 => Ok(Self::NoBinding),
            4 => Ok(Self::NotOnLink),
            5 => Ok(Self::UseMulticast),
            6 => Ok(Self::NoPrefixAvail),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::UnspecFail => "UnspecFail",
            Self::NoAddrsAvail => "NoAddrsAvail",
            Self::NoBinding => "NoBinding",
            Self::NotOnLink => "NotOnLink",
            Self::UseMulticast => "UseMulticast",
            Self::NoPrefixAvail => "NoPrefixAvail",
        };
        write!(f, "{}", name)
    }
}

/// An IA_NA or IA_PD option: IAID, T1, T2 and nested options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaNa {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub options: Vec<Dhcp6Option>,
}

/// An IA_TA option: IAID and nested options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaTa {
    pub iaid: u32,
    pub options: Vec<Dhcp6Option>,
}

/// An IA_PD option has the same shape as an IA_NA.
pub type IaPd = IaNa;

/// An IAADDR option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaAddress {
    pub address: Ipv6Addr,
    pub preferred: u32,
    pub valid: u32,
    pub options: Vec<Dhcp6Option>,
}

/// An IAPREFIX option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaPrefix {
    pub preferred: u32,
    pub valid: u32,
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
    pub options: Vec<Dhcp6Option>,
}

/// Returns the first status code found among nested options.
pub fn find_status(options: &[Dhcp6Option]) -> Option<(u16, &str)> {
    options.iter().find_map(|option| match option {
        Dhcp6Option::StatusCode(code, message) => Some((*code, message.as_str())),
        _ => None,
    })
}

impl IaNa {
    /// Iterates over the IAADDR options inside this IA.
    pub fn addresses(&self) -> impl Iterator<Item = &IaAddress> {
        self.options.iter().filter_map(|option| match option {
            Dhcp6Option::IaAddr(address) => Some(address),
            _ => None,
        })
    }

    /// Iterates over the IAPREFIX options inside this IA.
    pub fn prefixes(&self) -> impl Iterator<Item = &IaPrefix> {
        self.options.iter().filter_map(|option| match option {
            Dhcp6Option::IaPrefix(prefix) => Some(prefix),
            _ => None,
        })
    }

    pub fn status(&self) -> Option<(u16, &str)> {
        find_status(&self.options)
    }
}

impl IaTa {
    /// Iterates over the IAADDR options inside this IA.
    pub fn addresses(&self) -> impl Iterator<Item = &IaAddress> {
        self.options.iter().filter_map(|option| match option {
            Dhcp6Option::IaAddr(address) => Some(address),
            _ => None,
        })
    }

    pub fn status(&self) -> Option<(u16, &str)> {
        find_status(&self.options)
    }
}

/// A parsed DHCPv6 option.
///
/// Each variant corresponds to a specific option code. Unknown options are
/// preserved as [`Unknown`](Self::Unknown) to allow forwarding in relay
/// scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dhcp6Option {
    /// Client DUID (Option 1).
    ClientId(Vec<u8>),
    /// Server DUID (Option 2).
    ServerId(Vec<u8>),
    /// Non-temporary address IA (Option 3).
    IaNa(IaNa),
    /// Temporary address IA (Option 4).
    IaTa(IaTa),
    /// Address with lifetimes (Option 5).
    IaAddr(IaAddress),
    /// Requested option codes (Option 6).
    OptionRequest(Vec<u16>),
    /// Server preference, higher wins (Option 7).
    Preference(u8),
    /// Time since the client began the exchange, in 1/100 s (Option 8).
    ElapsedTime(u16),
    /// Encapsulated message bytes (Option 9).
    RelayMessage(Vec<u8>),
    /// Address the client may unicast to (Option 12).
    Unicast(Ipv6Addr),
    /// Raw status code and UTF-8 message (Option 13).
    StatusCode(u16, String),
    /// Rapid commit, empty payload (Option 14).
    RapidCommit,
    /// Opaque relay interface identifier (Option 18).
    InterfaceId(Vec<u8>),
    /// Reconfigure accept, empty payload (Option 20).
    ReconfigureAccept,
    /// Recursive DNS server addresses (Option 23).
    DnsServers(Vec<Ipv6Addr>),
    /// Domain search list (Option 24).
    DomainSearch(Vec<String>),
    /// Prefix delegation IA (Option 25).
    IaPd(IaPd),
    /// Delegated prefix with lifetimes (Option 26).
    IaPrefix(IaPrefix),
    /// Seconds until the client should refresh configuration (Option 32).
    InformationRefreshTime(u32),
    /// Option codes a relay wants echoed (Option 43).
    EchoRequest(Vec<u16>),
    /// Relay UDP source port (Option 135).
    RelaySourcePort(u16),
    /// Unknown option with raw code and data, preserved for forwarding.
    Unknown(u16, Vec<u8>),
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_address(data: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

fn parse_code_list(data: &[u8], what: &str) -> Result<Vec<u16>> {
    if !data.len().is_multiple_of(2) {
        return Err(Error::InvalidPacket(format!("Invalid {} length", what)));
    }
    Ok(data
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Decodes a sequence of uncompressed RFC 1035 names.
fn parse_domain_list(data: &[u8]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut labels: Vec<String> = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let len = data[offset] as usize;
        offset += 1;
        if len == 0 {
            names.push(labels.join("."));
            labels.clear();
            continue;
        }
        if len > 63 || offset + len > data.len() {
            return Err(Error::InvalidPacket("Invalid domain name label".to_string()));
        }
        labels.push(String::from_utf8_lossy(&data[offset..offset + len]).to_string());
        offset += len;
    }

    if !labels.is_empty() {
        return Err(Error::InvalidPacket(
            "Domain name missing root label".to_string(),
        ));
    }
    Ok(names)
}

fn encode_domain_list(names: &[String], out: &mut Vec<u8>) {
    for name in names {
        for label in name.split('.').filter(|label| !label.is_empty()) {
            let bytes = label.as_bytes();
            let len = bytes.len().min(63);
            out.push(len as u8);
            out.extend_from_slice(&bytes[..len]);
        }
        out.push(0);
    }
}

/// Parses a buffer of back-to-back options.
///
/// # Errors
///
/// Returns [`Error::InvalidPacket`] if an option header is truncated, an
/// option's length runs past the end of the buffer, or any option payload
/// is malformed.
pub fn parse_options(data: &[u8]) -> Result<Vec<Dhcp6Option>> {
    let mut options = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + OPTION_HEADER_SIZE > data.len() {
            return Err(Error::InvalidPacket("Truncated option header".to_string()));
        }
        let code = read_u16(data, offset);
        let len = read_u16(data, offset + 2) as usize;
        offset += OPTION_HEADER_SIZE;

        if offset + len > data.len() {
            return Err(Error::InvalidPacket(format!(
                "Option {} length {} exceeds remaining {} bytes",
                code,
                len,
                data.len() - offset
            )));
        }

        options.push(Dhcp6Option::parse(code, &data[offset..offset + len])?);
        offset += len;
    }

    Ok(options)
}

/// Appends the wire encoding of every option to `out`.
pub fn encode_options(options: &[Dhcp6Option], out: &mut Vec<u8>) {
    for option in options {
        option.encode_into(out);
    }
}

impl Dhcp6Option {
    /// Returns the option code for this option.
    pub fn option_code(&self) -> u16 {
        match self {
            Self::ClientId(_) => OptionCode::ClientId as u16,
            Self::ServerId(_) => OptionCode::ServerId as u16,
            Self::IaNa(_) => OptionCode::IaNa as u16,
            Self::IaTa(_) => OptionCode::IaTa as u16,
            Self::IaAddr(_) => OptionCode::IaAddr as u16,
            Self::OptionRequest(_) => OptionCode::OptionRequest as u16,
            Self::Preference(_) => OptionCode::Preference as u16,
            Self::ElapsedTime(_) => OptionCode::ElapsedTime as u16,
            Self::RelayMessage(_) => OptionCode::RelayMessage as u16,
            Self::Unicast(_) => OptionCode::Unicast as u16,
            Self::StatusCode(_, _) => OptionCode::StatusCode as u16,
            Self::RapidCommit => OptionCode::RapidCommit as u16,
            Self::InterfaceId(_) => OptionCode::InterfaceId as u16,
            Self::ReconfigureAccept => OptionCode::ReconfigureAccept as u16,
            Self::DnsServers(_) => OptionCode::DnsServers as u16,
            Self::DomainSearch(_) => OptionCode::DomainSearch as u16,
            Self::IaPd(_) => OptionCode::IaPd as u16,
            Self::IaPrefix(_) => OptionCode::IaPrefix as u16,
            Self::InformationRefreshTime(_) => OptionCode::InformationRefreshTime as u16,
            Self::EchoRequest(_) => OptionCode::EchoRequest as u16,
            Self::RelaySourcePort(_) => OptionCode::RelaySourcePort as u16,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Builds a Status Code option.
    pub fn status(code: StatusCode, message: &str) -> Self {
        Self::StatusCode(code as u16, message.to_string())
    }

    /// Parses a DHCPv6 option from its code and raw payload.
    ///
    /// # Arguments
    ///
    /// * `code` - The option code (first two bytes of the TLV)
    /// * `data` - The option payload (after the code and length fields)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the payload length is invalid for
    /// the option type (e.g. an IAADDR shorter than 24 bytes) or a nested
    /// option is malformed.
    pub fn parse(code: u16, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::ClientId) => {
                if data.is_empty() {
                    return Err(Error::InvalidPacket("Empty client identifier".to_string()));
                }
                Ok(Self::ClientId(data.to_vec()))
            }
            Ok(OptionCode::ServerId) => {
                if data.is_empty() {
                    return Err(Error::InvalidPacket("Empty server identifier".to_string()));
                }
                Ok(Self::ServerId(data.to_vec()))
            }
            Ok(OptionCode::IaNa) | Ok(OptionCode::IaPd) => {
                if data.len() < IA_NA_FIXED_SIZE {
                    return Err(Error::InvalidPacket(format!(
                        "Invalid IA option {} length",
                        code
                    )));
                }
                let ia = IaNa {
                    iaid: read_u32(data, 0),
                    t1: read_u32(data, 4),
                    t2: read_u32(data, 8),
                    options: parse_options(&data[IA_NA_FIXED_SIZE..])?,
                };
                if code == OptionCode::IaNa as u16 {
                    Ok(Self::IaNa(ia))
                } else {
                    Ok(Self::IaPd(ia))
                }
            }
            Ok(OptionCode::IaTa) => {
                if data.len() < IA_TA_FIXED_SIZE {
                    return Err(Error::InvalidPacket("Invalid IA_TA length".to_string()));
                }
                Ok(Self::IaTa(IaTa {
                    iaid: read_u32(data, 0),
                    options: parse_options(&data[IA_TA_FIXED_SIZE..])?,
                }))
            }
            Ok(OptionCode::IaAddr) => {
                if data.len() < IAADDR_FIXED_SIZE {
                    return Err(Error::InvalidPacket("Invalid IAADDR length".to_string()));
                }
                Ok(Self::IaAddr(IaAddress {
                    address: read_address(data, 0),
                    preferred: read_u32(data, 16),
                    valid: read_u32(data, 20),
                    options: parse_options(&data[IAADDR_FIXED_SIZE..])?,
                }))
            }
            Ok(OptionCode::IaPrefix) => {
                if data.len() < IAPREFIX_FIXED_SIZE {
                    return Err(Error::InvalidPacket("Invalid IAPREFIX length".to_string()));
                }
                let prefix_len = data[8];
                if prefix_len > 128 {
                    return Err(Error::InvalidPacket(format!(
                        "Invalid prefix length {}",
                        prefix_len
                    )));
                }
                Ok(Self::IaPrefix(IaPrefix {
                    preferred: read_u32(data, 0),
                    valid: read_u32(data, 4),
                    prefix_len,
                    prefix: read_address(data, 9),
                    options: parse_options(&data[IAPREFIX_FIXED_SIZE..])?,
                }))
            }
            Ok(OptionCode::OptionRequest) => {
                Ok(Self::OptionRequest(parse_code_list(data, "option request")?))
            }
            Ok(OptionCode::Preference) => {
                if data.len() != 1 {
                    return Err(Error::InvalidPacket("Invalid preference length".to_string()));
                }
                Ok(Self::Preference(data[0]))
            }
            Ok(OptionCode::ElapsedTime) => {
                if data.len() != 2 {
                    return Err(Error::InvalidPacket(
                        "Invalid elapsed time length".to_string(),
                    ));
                }
                Ok(Self::ElapsedTime(read_u16(data, 0)))
            }
            Ok(OptionCode::RelayMessage) => Ok(Self::RelayMessage(data.to_vec())),
            Ok(OptionCode::Unicast) => {
                if data.len() != 16 {
                    return Err(Error::InvalidPacket("Invalid unicast length".to_string()));
                }
                Ok(Self::Unicast(read_address(data, 0)))
            }
            Ok(OptionCode::StatusCode) => {
                if data.len() < 2 {
                    return Err(Error::InvalidPacket(
                        "Invalid status code length".to_string(),
                    ));
                }
                let message = String::from_utf8(data[2..].to_vec()).map_err(|_| {
                    Error::InvalidPacket("Invalid UTF-8 in status message".to_string())
                })?;
                Ok(Self::StatusCode(read_u16(data, 0), message))
            }
            Ok(OptionCode::RapidCommit) => {
                if !data.is_empty() {
                    return Err(Error::InvalidPacket(
                        "Rapid commit must be empty".to_string(),
                    ));
                }
                Ok(Self::RapidCommit)
            }
            Ok(OptionCode::InterfaceId) => Ok(Self::InterfaceId(data.to_vec())),
            Ok(OptionCode::ReconfigureAccept) => {
                if !data.is_empty() {
                    return Err(Error::InvalidPacket(
                        "Reconfigure accept must be empty".to_string(),
                    ));
                }
                Ok(Self::ReconfigureAccept)
            }
            Ok(OptionCode::DnsServers) => {
                if !data.len().is_multiple_of(16) {
                    return Err(Error::InvalidPacket(
                        "Invalid DNS servers length".to_string(),
                    ));
                }
                Ok(Self::DnsServers(
                    (0..data.len() / 16)
                        .map(|index| read_address(data, index * 16))
                        .collect(),
                ))
            }
            Ok(OptionCode::DomainSearch) => Ok(Self::DomainSearch(parse_domain_list(data)?)),
            Ok(OptionCode::InformationRefreshTime) => {
                if data.len() != 4 {
                    return Err(Error::InvalidPacket(
                        "Invalid information refresh time length".to_string(),
                    ));
                }
                Ok(Self::InformationRefreshTime(read_u32(data, 0)))
            }
            Ok(OptionCode::EchoRequest) => {
                Ok(Self::EchoRequest(parse_code_list(data, "echo request")?))
            }
            Ok(OptionCode::RelaySourcePort) => {
                if data.len() != 2 {
                    return Err(Error::InvalidPacket(
                        "Invalid relay source port length".to_string(),
                    ));
                }
                Ok(Self::RelaySourcePort(read_u16(data, 0)))
            }
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    /// Encodes the option to its wire format (code + length + payload).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Appends the option's wire format to `out`.
    ///
    /// The length field is patched once the payload is written. Message
    /// encoding bounds the whole message to 65535 bytes, which bounds every
    /// option inside it.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.option_code().to_be_bytes());
        out.extend_from_slice(&[0, 0]);

        match self {
            Self::ClientId(data)
            | Self::ServerId(data)
            | Self::RelayMessage(data)
            | Self::InterfaceId(data)
            | Self::Unknown(_, data) => out.extend_from_slice(data),
            Self::IaNa(ia) | Self::IaPd(ia) => {
                out.extend_from_slice(&ia.iaid.to_be_bytes());
                out.extend_from_slice(&ia.t1.to_be_bytes());
                out.extend_from_slice(&ia.t2.to_be_bytes());
                encode_options(&ia.options, out);
            }
            Self::IaTa(ia) => {
                out.extend_from_slice(&ia.iaid.to_be_bytes());
                encode_options(&ia.options, out);
            }
            Self::IaAddr(address) => {
                out.extend_from_slice(&address.address.octets());
                out.extend_from_slice(&address.preferred.to_be_bytes());
                out.extend_from_slice(&address.valid.to_be_bytes());
                encode_options(&address.options, out);
            }
            Self::IaPrefix(prefix) => {
                out.extend_from_slice(&prefix.preferred.to_be_bytes());
                out.extend_from_slice(&prefix.valid.to_be_bytes());
                out.push(prefix.prefix_len);
                out.extend_from_slice(&prefix.prefix.octets());
                encode_options(&prefix.options, out);
            }
            Self::OptionRequest(codes) | Self::EchoRequest(codes) => {
                for code in codes {
                    out.extend_from_slice(&code.to_be_bytes());
                }
            }
            Self::Preference(value) => out.push(*value),
            Self::ElapsedTime(value) | Self::RelaySourcePort(value) => {
                out.extend_from_slice(&value.to_be_bytes())
            }
            Self::Unicast(address) => out.extend_from_slice(&address.octets()),
            Self::StatusCode(code, message) => {
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(message.as_bytes());
            }
            Self::RapidCommit | Self::ReconfigureAccept => {}
            Self::DnsServers(addresses) => {
                for address in addresses {
                    out.extend_from_slice(&address.octets());
                }
            }
            Self::DomainSearch(names) => encode_domain_list(names, out),
            Self::InformationRefreshTime(value) => out.extend_from_slice(&value.to_be_bytes()),
        }

        let len = (out.len() - start - OPTION_HEADER_SIZE) as u16;
        out[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
    }
}
