//! Message validation (RFC 3315 §15) and unicast rejection.
//!
//! Every client message passes one of the three gates below before any
//! allocation work starts. A message that fails is dropped without a reply;
//! the returned [`Discard`] only serves the debug log.

use tracing::error;

use crate::context::ServerContext;
use crate::options::{Dhcp6Option, MessageType, StatusCode};
use crate::packet::{Dhcp6Packet, ReceiveInfo, RelayPacket};
use crate::scope::{OptionName, ScopeRef};

/// Why a message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Discard {
    #[error("client identifier missing")]
    MissingClientId,

    #[error("packet sent unicast")]
    Unicast,

    #[error("server identifier found")]
    UnexpectedServerId,

    #[error("server identifier missing")]
    MissingServerId,

    #[error("not our server identifier")]
    WrongServerId,

    #[error("{0} option present")]
    IaPresent(&'static str),
}

/// Gate for Solicit, Confirm and Rebind: a Client Identifier is required,
/// the message must have been multicast and must not name a server.
pub fn validate_client_message(packet: &Dhcp6Packet, unicast: bool) -> Result<&[u8], Discard> {
    let client_id = packet.client_id().ok_or(Discard::MissingClientId)?;
    if unicast {
        return Err(Discard::Unicast);
    }
    if packet.server_id().is_some() {
        return Err(Discard::UnexpectedServerId);
    }
    Ok(client_id)
}

/// Gate for Request, Renew, Release and Decline: both identifiers are
/// required and the Server Identifier must be ours.
pub fn validate_client_response<'a>(
    packet: &'a Dhcp6Packet,
    server_duid: &[u8],
) -> Result<&'a [u8], Discard> {
    let client_id = packet.client_id().ok_or(Discard::MissingClientId)?;
    let server_id = packet.server_id().ok_or(Discard::MissingServerId)?;
    if server_id != server_duid {
        return Err(Discard::WrongServerId);
    }
    Ok(client_id)
}

/// Gate for Information-Request. The Client Identifier is optional and is
/// returned when present.
pub fn validate_information_request<'a>(
    packet: &'a Dhcp6Packet,
    unicast: bool,
    server_duid: &[u8],
) -> Result<Option<&'a [u8]>, Discard> {
    if unicast {
        return Err(Discard::Unicast);
    }
    if packet.ia_na().next().is_some() {
        return Err(Discard::IaPresent("IA_NA"));
    }
    if packet.ia_ta().next().is_some() {
        return Err(Discard::IaPresent("IA_TA"));
    }
    if packet.ia_pd().next().is_some() {
        return Err(Discard::IaPresent("IA_PD"));
    }
    if packet.server_id().is_some_and(|id| id != server_duid) {
        return Err(Discard::WrongServerId);
    }
    Ok(packet.client_id())
}

/// Whether a unicast Request, Renew, Release or Decline may be answered.
///
/// The message is mapped to a shared network by the first address or
/// prefix in its IAs, falling back to the relay chain and the receiving
/// interface. Unicast is allowed when the server unicast option is set for
/// that network. A message that maps to no network is rejected.
pub fn is_unicast_permitted(
    context: &ServerContext,
    packet: &Dhcp6Packet,
    relays: &[RelayPacket],
    info: &ReceiveInfo,
) -> bool {
    let topology = &context.topology;
    let Some(network) = topology
        .resolve_by_requested_address(packet)
        .or_else(|| topology.resolve(relays, info))
    else {
        error!("Cannot attribute {} to a network for the unicast check", packet.msg_type);
        return false;
    };

    let scopes = [ScopeRef::Global, ScopeRef::SharedNetwork(network)];
    context
        .evaluator
        .evaluate(OptionName::Unicast, &scopes)
        .is_some()
}

/// The reply to a unicast message the server does not accept: Client ID,
/// Server ID and a UseMulticast status, nothing else.
pub fn use_multicast_reply(packet: &Dhcp6Packet, client_id: &[u8], server_duid: &[u8]) -> Dhcp6Packet {
    let mut reply = Dhcp6Packet::create_reply(packet, MessageType::Reply);
    reply.options.push(Dhcp6Option::ClientId(client_id.to_vec()));
    reply.options.push(Dhcp6Option::ServerId(server_duid.to_vec()));
    reply.options.push(Dhcp6Option::status(
        StatusCode::UseMulticast,
        "Unicast not allowed by server.",
    ));
    reply
}
