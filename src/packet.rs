//! DHCPv6 message parsing and encoding per RFC 3315.
//!
//! Client and server messages share a 4-byte header followed by options.
//! Relay agents wrap messages in Relay-Forward/Relay-Reply envelopes that
//! carry a hop count and two addresses; the encapsulated message travels
//! inside the Relay Message option.
//!
//! # Message Structure
//!
//! ```text
//! Client/server message:
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    msg-type   |               transaction-id                  |
//! +---------------+-----------------------------------------------+
//! |                       options (variable)                      |
//! +---------------------------------------------------------------+
//!
//! Relay message:
//! +---------------+---------------+
//! |    msg-type   |   hop-count   |
//! +---------------+---------------+-------------------------------+
//! |                      link-address (16)                        |
//! +---------------------------------------------------------------+
//! |                      peer-address (16)                        |
//! +---------------------------------------------------------------+
//! |                       options (variable)                      |
//! +---------------------------------------------------------------+
//! ```
//!
//! # References
//!
//! - RFC 3315: Dynamic Host Configuration Protocol for IPv6 (DHCPv6)
//! - RFC 4994: DHCPv6 Relay Agent Echo Request Option

use std::net::Ipv6Addr;

use crate::error::{Error, Result};
use crate::options::{
    Dhcp6Option, IaNa, IaPd, IaTa, MessageType, OptionCode, encode_options, parse_options,
};

/// Size of the client/server message header (type + transaction ID).
const CLIENT_HEADER_SIZE: usize = 4;

/// Size of the relay message header (type + hop count + two addresses).
const RELAY_HEADER_SIZE: usize = 34;

/// Maximum number of relay agents a message may have passed through.
///
/// RFC 3315 §5.1 `HOP_COUNT_LIMIT`. Deeper relay nesting is rejected.
pub const HOP_COUNT_LIMIT: u8 = 32;

/// Largest message the server will build or accept.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// A client or server message (everything except the relay types).
///
/// Use [`parse`](Self::parse) for incoming bytes and
/// [`create_reply`](Self::create_reply) to start a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dhcp6Packet {
    pub msg_type: MessageType,

    /// Transaction ID chosen by the client, echoed in replies.
    pub transaction_id: [u8; 3],

    pub options: Vec<Dhcp6Option>,
}

/// A Relay-Forward or Relay-Reply message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPacket {
    pub msg_type: MessageType,

    /// Number of relay agents that have already relayed this message.
    pub hop_count: u8,

    /// Address identifying the link the client is on. Unspecified when the
    /// relay could not supply a global or ULA address for the link.
    pub link_address: Ipv6Addr,

    /// Address of the client or relay the message was received from.
    pub peer_address: Ipv6Addr,

    pub options: Vec<Dhcp6Option>,
}

/// Any DHCPv6 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Client(Dhcp6Packet),
    Relay(RelayPacket),
}

/// Metadata about how a message reached the server.
///
/// Not part of the wire format; filled in by the listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveInfo {
    /// Name of the receiving interface, if known.
    pub interface: Option<String>,

    /// True when the datagram was sent to a unicast destination address
    /// rather than to a multicast group.
    pub unicast: bool,
}

impl Message {
    /// Parses any DHCPv6 message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if:
    /// - The message is empty or longer than [`MAX_MESSAGE_SIZE`]
    /// - The message type is unknown
    /// - The header is truncated
    /// - A relay hop count exceeds [`HOP_COUNT_LIMIT`]
    /// - Options are malformed
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidPacket("Empty message".to_string()));
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Message too long: {} bytes (maximum {})",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let msg_type = MessageType::try_from(data[0])
            .map_err(|code| Error::InvalidPacket(format!("Unknown message type {}", code)))?;

        if msg_type.is_relay() {
            RelayPacket::parse(data).map(Self::Relay)
        } else {
            Dhcp6Packet::parse(data).map(Self::Client)
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Client(packet) => packet.msg_type,
            Self::Relay(relay) => relay.msg_type,
        }
    }

    pub fn options(&self) -> &[Dhcp6Option] {
        match self {
            Self::Client(packet) => &packet.options,
            Self::Relay(relay) => &relay.options,
        }
    }

    /// Encodes the message to bytes for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSpace`] if the message exceeds [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Client(packet) => packet.encode(),
            Self::Relay(relay) => relay.encode(),
        }
    }
}

fn check_size(encoded: Vec<u8>) -> Result<Vec<u8>> {
    if encoded.len() > MAX_MESSAGE_SIZE {
        return Err(Error::NoSpace);
    }
    Ok(encoded)
}

impl Dhcp6Packet {
    /// Parses a client/server message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the header is truncated, the
    /// message type is unknown or a relay type, or options are malformed.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CLIENT_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                CLIENT_HEADER_SIZE
            )));
        }

        let msg_type = MessageType::try_from(data[0])
            .map_err(|code| Error::InvalidPacket(format!("Unknown message type {}", code)))?;
        if msg_type.is_relay() {
            return Err(Error::InvalidPacket(format!(
                "{} is not a client/server message",
                msg_type
            )));
        }

        let transaction_id = [data[1], data[2], data[3]];
        let options = parse_options(&data[CLIENT_HEADER_SIZE..])?;

        Ok(Self {
            msg_type,
            transaction_id,
            options,
        })
    }

    /// Encodes the message to bytes for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSpace`] if the message exceeds [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut packet = Vec::with_capacity(512);
        packet.push(self.msg_type as u8);
        packet.extend_from_slice(&self.transaction_id);
        encode_options(&self.options, &mut packet);
        check_size(packet)
    }

    /// Returns the transaction ID as an integer, for logging.
    pub fn xid(&self) -> u32 {
        u32::from_be_bytes([
            0,
            self.transaction_id[0],
            self.transaction_id[1],
            self.transaction_id[2],
        ])
    }

    /// Returns the Client Identifier (Option 1) DUID if present.
    pub fn client_id(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            Dhcp6Option::ClientId(duid) => Some(duid.as_slice()),
            _ => None,
        })
    }

    /// Returns the Server Identifier (Option 2) DUID if present.
    pub fn server_id(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            Dhcp6Option::ServerId(duid) => Some(duid.as_slice()),
            _ => None,
        })
    }

    /// Iterates over IA_NA options in arrival order.
    pub fn ia_na(&self) -> impl Iterator<Item = &IaNa> {
        self.options.iter().filter_map(|opt| match opt {
            Dhcp6Option::IaNa(ia) => Some(ia),
            _ => None,
        })
    }

    /// Iterates over IA_TA options in arrival order.
    pub fn ia_ta(&self) -> impl Iterator<Item = &IaTa> {
        self.options.iter().filter_map(|opt| match opt {
            Dhcp6Option::IaTa(ia) => Some(ia),
            _ => None,
        })
    }

    /// Iterates over IA_PD options in arrival order.
    pub fn ia_pd(&self) -> impl Iterator<Item = &IaPd> {
        self.options.iter().filter_map(|opt| match opt {
            Dhcp6Option::IaPd(ia) => Some(ia),
            _ => None,
        })
    }

    /// Returns true if any IA_NA, IA_TA or IA_PD option is present.
    pub fn has_ia(&self) -> bool {
        self.options.iter().any(|opt| {
            matches!(
                opt,
                Dhcp6Option::IaNa(_) | Dhcp6Option::IaTa(_) | Dhcp6Option::IaPd(_)
            )
        })
    }

    /// Returns the option codes listed in the Option Request option.
    ///
    /// Returns an empty slice when the client sent no ORO.
    pub fn option_request(&self) -> &[u16] {
        self.options
            .iter()
            .find_map(|opt| match opt {
                Dhcp6Option::OptionRequest(codes) => Some(codes.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn has_rapid_commit(&self) -> bool {
        self.options
            .iter()
            .any(|opt| matches!(opt, Dhcp6Option::RapidCommit))
    }

    pub fn has_reconfigure_accept(&self) -> bool {
        self.options
            .iter()
            .any(|opt| matches!(opt, Dhcp6Option::ReconfigureAccept))
    }

    /// Creates an empty reply to `request` with the same transaction ID.
    pub fn create_reply(request: &Dhcp6Packet, msg_type: MessageType) -> Self {
        Self {
            msg_type,
            transaction_id: request.transaction_id,
            options: Vec::new(),
        }
    }
}

impl RelayPacket {
    /// Parses a Relay-Forward or Relay-Reply message.
    ///
    /// The encapsulated message is kept as raw bytes in the Relay Message
    /// option; see [`inner_message`](Self::inner_message).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if:
    /// - The message is shorter than the 34-byte relay header
    /// - The message type is not a relay type
    /// - The hop count exceeds [`HOP_COUNT_LIMIT`]
    /// - Options are malformed
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RELAY_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Relay message too short: {} bytes (minimum {})",
                data.len(),
                RELAY_HEADER_SIZE
            )));
        }

        let msg_type = MessageType::try_from(data[0])
            .map_err(|code| Error::InvalidPacket(format!("Unknown message type {}", code)))?;
        if !msg_type.is_relay() {
            return Err(Error::InvalidPacket(format!(
                "{} is not a relay message",
                msg_type
            )));
        }

        let hop_count = data[1];
        if hop_count > HOP_COUNT_LIMIT {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hop_count, HOP_COUNT_LIMIT
            )));
        }

        let mut link = [0u8; 16];
        link.copy_from_slice(&data[2..18]);
        let mut peer = [0u8; 16];
        peer.copy_from_slice(&data[18..34]);

        let options = parse_options(&data[RELAY_HEADER_SIZE..])?;

        Ok(Self {
            msg_type,
            hop_count,
            link_address: Ipv6Addr::from(link),
            peer_address: Ipv6Addr::from(peer),
            options,
        })
    }

    /// Encodes the relay message to bytes for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSpace`] if the message exceeds [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut packet = Vec::with_capacity(RELAY_HEADER_SIZE + 512);
        packet.push(self.msg_type as u8);
        packet.push(self.hop_count);
        packet.extend_from_slice(&self.link_address.octets());
        packet.extend_from_slice(&self.peer_address.octets());
        encode_options(&self.options, &mut packet);
        check_size(packet)
    }

    /// Returns the raw encapsulated message (Option 9) if present.
    pub fn relay_message(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            Dhcp6Option::RelayMessage(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// Parses the encapsulated message, if the Relay Message option exists.
    pub fn inner_message(&self) -> Option<Result<Message>> {
        self.relay_message().map(Message::parse)
    }

    /// Returns the Interface-ID (Option 18) if present.
    pub fn interface_id(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            Dhcp6Option::InterfaceId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    /// Returns the relay's UDP source port (Option 135) if present.
    pub fn relay_source_port(&self) -> Option<u16> {
        self.options.iter().find_map(|opt| match opt {
            Dhcp6Option::RelaySourcePort(port) => Some(*port),
            _ => None,
        })
    }

    /// Returns the option codes the relay asked to have echoed.
    pub fn echo_request(&self) -> &[u16] {
        self.options
            .iter()
            .find_map(|opt| match opt {
                Dhcp6Option::EchoRequest(codes) => Some(codes.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Creates a Relay-Reply for this Relay-Forward wrapping `inner`.
    ///
    /// # Preserved Fields
    ///
    /// - `hop_count`, `link_address` and `peer_address`
    /// - Interface-ID and Relay Source Port options
    /// - Every option listed in the Echo Request option, except the
    ///   Relay Message itself
    pub fn create_reply(&self, inner: Vec<u8>) -> Self {
        let mut options = Vec::new();

        if let Some(id) = self.interface_id() {
            options.push(Dhcp6Option::InterfaceId(id.to_vec()));
        }
        if let Some(port) = self.relay_source_port() {
            options.push(Dhcp6Option::RelaySourcePort(port));
        }

        for code in self.echo_request() {
            let already_present = options.iter().any(|opt| opt.option_code() == *code);
            if already_present || *code == OptionCode::RelayMessage as u16 {
                continue;
            }
            if let Some(option) = self.options.iter().find(|opt| opt.option_code() == *code) {
                options.push(option.clone());
            }
        }

        options.push(Dhcp6Option::RelayMessage(inner));

        Self {
            msg_type: MessageType::RelayRepl,
            hop_count: self.hop_count,
            link_address: self.link_address,
            peer_address: self.peer_address,
            options,
        }
    }
}
