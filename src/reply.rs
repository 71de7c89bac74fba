//! Reply builder for Solicit, Request, Renew and Rebind.
//!
//! [`lease_to_client`] walks every IA the client sent (IA_NA, then IA_TA,
//! then IA_PD) and decides, address by address, what to hand back. Each IA
//! is built as a structured [`IaReply`] and only turned into an option once
//! its lifetimes are final, so the reuse policy can shorten them after the
//! fact without touching encoded bytes.
//!
//! Per-IA outcomes:
//!
//! - granted resources are committed (for a Reply) and the IA is swapped
//!   into the repository
//! - a *canceled* IA carries only a status code and commits nothing
//! - an `Err` aborts the whole reply

use std::net::Ipv6Addr;
use std::sync::Arc;

use ipnet::Ipv6Net;
use tracing::{debug, error, info};

use crate::config::{PrefixLengthMode, format_duid};
use crate::context::ServerContext;
use crate::engine::EngineState;
use crate::error::{Error, Result};
use crate::ia::{IaKey, IaRecord, IaType, detect_roam};
use crate::network::Host;
use crate::options::{
    Dhcp6Option, INFINITE_LIFETIME, IaAddress, IaNa, IaPd, IaPrefix, IaTa, MessageType,
    OptionCode, StatusCode,
};
use crate::packet::Dhcp6Packet;
use crate::pool::{ClientIdentity, LeaseId, LeaseState, MAX_TIME, SubLease};
use crate::reuse::{reuse_age, shorten_lifetimes};
use crate::scope::{OptionName, OptionValue, ScopeRef};

/// Valid lifetime used when neither the client nor the configuration
/// supplies one (12 hours).
pub const DEFAULT_LEASE_TIME: u32 = 43200;

/// Where an address or prefix in a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    /// A dynamic sub-lease.
    Lease(LeaseId),
    /// A fixed address or prefix from a host reservation.
    Fixed,
    /// A client value echoed back with zero lifetimes.
    Echo,
}

/// One IAADDR or IAPREFIX in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEntry {
    pub address: Ipv6Addr,
    /// Zero for addresses.
    pub prefix_len: u8,
    pub preferred: u32,
    pub valid: u32,
    pub source: EntrySource,
}

impl ReplyEntry {
    fn describe(&self) -> String {
        if self.prefix_len != 0 {
            format!("prefix {}/{}", self.address, self.prefix_len)
        } else {
            format!("address {}", self.address)
        }
    }
}

/// An IA being answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaReply {
    pub ia_type: IaType,
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub entries: Vec<ReplyEntry>,
    pub status: Option<(StatusCode, String)>,
}

impl IaReply {
    pub fn new(ia_type: IaType, iaid: u32) -> Self {
        Self {
            ia_type,
            iaid,
            t1: 0,
            t2: 0,
            entries: Vec::new(),
            status: None,
        }
    }

    /// Sub-leases referenced by this IA, in reply order.
    pub fn leases(&self) -> Vec<LeaseId> {
        self.entries
            .iter()
            .filter_map(|entry| match entry.source {
                EntrySource::Lease(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Encodes the IA as an IA_NA, IA_TA or IA_PD option.
    pub fn to_option(&self) -> Dhcp6Option {
        let mut options: Vec<Dhcp6Option> = self
            .entries
            .iter()
            .map(|entry| match self.ia_type {
                IaType::Pd => Dhcp6Option::IaPrefix(IaPrefix {
                    preferred: entry.preferred,
                    valid: entry.valid,
                    prefix_len: entry.prefix_len,
                    prefix: entry.address,
                    options: Vec::new(),
                }),
                IaType::Na | IaType::Ta => Dhcp6Option::IaAddr(IaAddress {
                    address: entry.address,
                    preferred: entry.preferred,
                    valid: entry.valid,
                    options: Vec::new(),
                }),
            })
            .collect();

        if let Some((code, message)) = &self.status {
            options.push(Dhcp6Option::status(*code, message));
        }

        match self.ia_type {
            IaType::Na => Dhcp6Option::IaNa(IaNa {
                iaid: self.iaid,
                t1: self.t1,
                t2: self.t2,
                options,
            }),
            IaType::Ta => Dhcp6Option::IaTa(IaTa {
                iaid: self.iaid,
                options,
            }),
            IaType::Pd => Dhcp6Option::IaPd(IaPd {
                iaid: self.iaid,
                t1: self.t1,
                t2: self.t2,
                options,
            }),
        }
    }
}

/// Computes the (preferred, valid) lifetimes to grant.
///
/// The valid lifetime is the configured default lease time, or
/// [`DEFAULT_LEASE_TIME`]. Client hints may only shorten it. A valid
/// lifetime whose absolute end would pass [`MAX_TIME`] is sent as
/// infinite. When the preferred lifetime would not be below the valid one
/// it becomes 5/8 of it. A configured preferred lifetime wins.
pub fn finalize_lifetimes(
    client_preferred: u32,
    client_valid: u32,
    default_lease_time: Option<u32>,
    preferred_lifetime: Option<u32>,
    now: i64,
) -> (u32, u32) {
    let mut valid = default_lease_time.unwrap_or(DEFAULT_LEASE_TIME);
    if client_valid != 0 && client_valid < valid {
        valid = client_valid;
    }
    if valid == INFINITE_LIFETIME || now + i64::from(valid) > MAX_TIME {
        valid = INFINITE_LIFETIME;
    }

    let mut preferred = if client_preferred != 0 {
        client_preferred
    } else {
        valid
    };
    if preferred >= valid && valid != INFINITE_LIFETIME {
        preferred = valid / 2 + valid / 8;
    }
    if let Some(configured) = preferred_lifetime {
        preferred = configured;
    }

    (preferred.min(valid), valid)
}

/// Computes T1 and T2 for an IA whose shortest preferred lifetime is
/// `min_preferred`.
///
/// Configured renewal and rebinding times are used as given. Otherwise,
/// when `set_tee_times` is on, T1 is half and T2 four fifths of the
/// preferred lifetime; otherwise both are zero.
pub fn tee_times(
    min_preferred: u32,
    renewal_time: Option<u32>,
    rebinding_time: Option<u32>,
    set_tee_times: bool,
) -> (u32, u32) {
    let computed = |value: fn(u32) -> u32| {
        if !set_tee_times {
            0
        } else if min_preferred == INFINITE_LIFETIME {
            INFINITE_LIFETIME
        } else {
            value(min_preferred)
        }
    };
    let t1 = renewal_time.unwrap_or_else(|| computed(|p| p / 2));
    let t2 = rebinding_time.unwrap_or_else(|| computed(|p| p - p / 5));
    (t1, t2)
}

/// Starts a reply to `packet`: message type, identifiers and the options
/// every reply of that type carries.
///
/// A Solicit is answered with Advertise unless the client asked for rapid
/// commit and the server grants it.
pub fn start_reply(
    context: &ServerContext,
    packet: &Dhcp6Packet,
    client_id: Option<&[u8]>,
    scopes: &[ScopeRef],
) -> Dhcp6Packet {
    let evaluator = &context.evaluator;
    let rapid_commit = packet.msg_type == MessageType::Solicit
        && packet.has_rapid_commit()
        && evaluator.flag(OptionName::RapidCommit, scopes) == Some(true);
    let msg_type = if packet.msg_type == MessageType::Solicit && !rapid_commit {
        MessageType::Advertise
    } else {
        MessageType::Reply
    };

    let mut reply = Dhcp6Packet::create_reply(packet, msg_type);
    reply
        .options
        .push(Dhcp6Option::ServerId(context.server_duid.clone()));
    if let Some(client_id) = client_id {
        reply.options.push(Dhcp6Option::ClientId(client_id.to_vec()));
    }
    if rapid_commit {
        reply.options.push(Dhcp6Option::RapidCommit);
    }
    if packet.has_reconfigure_accept() {
        reply.options.push(Dhcp6Option::ReconfigureAccept);
    }
    if msg_type == MessageType::Advertise
        && let Some(preference) = evaluator.number(OptionName::Preference, scopes)
    {
        let preference = u8::try_from(preference).unwrap_or(u8::MAX);
        reply.options.push(Dhcp6Option::Preference(preference));
    }
    if let Some(OptionValue::Address(address)) = evaluator.evaluate(OptionName::Unicast, scopes) {
        reply.options.push(Dhcp6Option::Unicast(address));
    }
    reply
}

/// Appends the top-level options the client listed in its Option Request
/// option and the configuration supplies. Options already in the reply
/// are not repeated.
pub fn add_requested_options(
    context: &ServerContext,
    packet: &Dhcp6Packet,
    reply: &mut Dhcp6Packet,
    scopes: &[ScopeRef],
) {
    let evaluator = &context.evaluator;
    for code in packet.option_request() {
        if reply.options.iter().any(|option| option.option_code() == *code) {
            continue;
        }
        let option = match OptionCode::try_from(*code) {
            Ok(OptionCode::DnsServers) => match evaluator.evaluate(OptionName::DnsServers, scopes) {
                Some(OptionValue::Addresses(servers)) => Some(Dhcp6Option::DnsServers(servers)),
                _ => None,
            },
            Ok(OptionCode::DomainSearch) => match evaluator.evaluate(OptionName::DomainSearch, scopes) {
                Some(OptionValue::Names(names)) => Some(Dhcp6Option::DomainSearch(names)),
                _ => None,
            },
            Ok(OptionCode::InformationRefreshTime)
                if packet.msg_type == MessageType::InformationRequest =>
            {
                evaluator
                    .number(OptionName::InformationRefreshTime, scopes)
                    .map(Dhcp6Option::InformationRefreshTime)
            }
            _ => None,
        };
        if let Some(option) = option {
            reply.options.push(option);
        }
    }
}

/// Builds the Advertise or Reply for a Solicit, Request, Renew or Rebind.
///
/// Returns `Ok(None)` when nothing should be sent: the message maps to no
/// shared network, or it carries no IA at all.
///
/// # Errors
///
/// Returns an error when a pool or repository invariant does not hold.
/// Running out of addresses is not an error; it is reported to the client
/// with a status code.
pub fn lease_to_client(
    context: &ServerContext,
    state: &mut EngineState,
    packet: &Dhcp6Packet,
    client_id: &[u8],
    network: Option<usize>,
    now: i64,
) -> Result<Option<Dhcp6Packet>> {
    let Some(network) = network else {
        debug!(
            "Discarding {} from {}: no shared network",
            packet.msg_type,
            format_duid(client_id)
        );
        return Ok(None);
    };
    if !packet.has_ia() {
        debug!(
            "Discarding {} from {}: no IA options",
            packet.msg_type,
            format_duid(client_id)
        );
        return Ok(None);
    }

    let topology = &context.topology;
    let hosts = topology.find_hosts(client_id);
    let host = topology.seek_shared_host(&hosts, network);
    let classes = topology.classify(client_id);

    let mut tail: Vec<ScopeRef> = classes.iter().map(|class| ScopeRef::Class(*class)).collect();
    if let Some(host) = host {
        tail.push(ScopeRef::Host(host.id));
    }
    let mut base = vec![ScopeRef::Global, ScopeRef::SharedNetwork(network)];
    base.extend_from_slice(&tail);

    let client = ClientIdentity {
        duid: client_id,
        classes: classes
            .iter()
            .map(|class| topology.classes[*class].name.as_str())
            .collect(),
        known: !hosts.is_empty(),
    };

    let reply = start_reply(context, packet, Some(client_id), &base);
    let reply_type = reply.msg_type;
    let builder = ReplyBuilder {
        context,
        state,
        packet,
        network,
        host,
        client,
        base,
        tail,
        reply_type,
        reply,
        now,
        granted_any: false,
    };
    builder.build()
}

enum Owned {
    Fixed,
    Lease(LeaseId),
}

/// Working state for one IA.
struct IaWork {
    key: IaKey,
    /// The IA as indexed before this message, never modified.
    old: Option<IaRecord>,
    reply: IaReply,
    fixed: Option<Ipv6Addr>,
    fixed_prefixes: Vec<Ipv6Net>,
    client_preferred: u32,
    client_valid: u32,
    /// Resources granted so far.
    client_resources: u32,
    /// Set once anything, zero-lifetime echoes included, went into the IA.
    resources_included: bool,
    canceled: bool,
    /// The first prefix length the client hinted at.
    preflen: Option<u8>,
    scopes: Vec<ScopeRef>,
}

impl IaWork {
    /// Keeps the shortest non-zero lifetimes the client proposed.
    fn hint(&mut self, preferred: u32, valid: u32) {
        if preferred != 0 && (self.client_preferred == 0 || preferred < self.client_preferred) {
            self.client_preferred = preferred;
        }
        if valid != 0 && (self.client_valid == 0 || valid < self.client_valid) {
            self.client_valid = valid;
        }
    }

    fn clear(&mut self) {
        self.reply.entries.clear();
        self.client_resources = 0;
        self.resources_included = false;
    }

    /// Empties the IA down to a status code and stops processing it.
    fn cancel(&mut self, code: StatusCode, message: &str) {
        self.clear();
        self.reply.status = Some((code, message.to_string()));
        self.canceled = true;
    }

    /// Tells the client to stop using `address`.
    fn echo_zero(&mut self, address: Ipv6Addr, prefix_len: u8) {
        self.reply.entries.push(ReplyEntry {
            address,
            prefix_len,
            preferred: 0,
            valid: 0,
            source: EntrySource::Echo,
        });
        self.resources_included = true;
    }

    fn min_preferred(&self) -> u32 {
        self.reply
            .entries
            .iter()
            .filter(|entry| entry.source != EntrySource::Echo)
            .map(|entry| entry.preferred)
            .min()
            .unwrap_or(0)
    }
}

struct ReplyBuilder<'a> {
    context: &'a ServerContext,
    state: &'a mut EngineState,
    packet: &'a Dhcp6Packet,
    network: usize,
    host: Option<&'a Host>,
    client: ClientIdentity<'a>,
    /// Global and shared network, then classes and host.
    base: Vec<ScopeRef>,
    /// Class and host scopes, innermost last.
    tail: Vec<ScopeRef>,
    reply_type: MessageType,
    reply: Dhcp6Packet,
    now: i64,
    granted_any: bool,
}

impl<'a> ReplyBuilder<'a> {
    fn build(mut self) -> Result<Option<Dhcp6Packet>> {
        let packet = self.packet;
        let mut ias = Vec::new();

        for ia in packet.ia_na() {
            let mut work = self.start_ia(IaType::Na, ia.iaid)?;
            for address in ia.addresses() {
                work.hint(address.preferred, address.valid);
                if work.canceled {
                    break;
                }
                self.process_address(&mut work, address.address)?;
            }
            ias.extend(self.finish_ia(work)?);
        }

        for ia in packet.ia_ta() {
            let mut work = self.start_ia(IaType::Ta, ia.iaid)?;
            self.process_temporaries(&mut work, ia)?;
            ias.extend(self.finish_ia(work)?);
        }

        for ia in packet.ia_pd() {
            let mut work = self.start_ia(IaType::Pd, ia.iaid)?;
            for prefix in ia.prefixes() {
                work.hint(prefix.preferred, prefix.valid);
                if work.canceled {
                    break;
                }
                self.process_prefix(&mut work, prefix)?;
            }
            ias.extend(self.finish_ia(work)?);
        }

        if packet.msg_type == MessageType::Solicit && !self.granted_any {
            return Ok(Some(self.no_resources_advertise()));
        }
        if ias.is_empty() {
            debug!(
                "Discarding {} from {}: no IA to answer",
                packet.msg_type,
                format_duid(self.client.duid)
            );
            return Ok(None);
        }

        let mut reply = self.reply;
        reply.options.extend(ias.iter().map(IaReply::to_option));
        add_requested_options(self.context, packet, &mut reply, &self.base);
        Ok(Some(reply))
    }

    /// The Advertise for a Solicit that got nothing in any IA.
    fn no_resources_advertise(&self) -> Dhcp6Packet {
        let packet = self.packet;
        let prefixes_only = packet.ia_na().next().is_none() && packet.ia_ta().next().is_none();
        let (code, message) = if prefixes_only {
            (StatusCode::NoPrefixAvail, "No prefixes available for this interface.")
        } else {
            (StatusCode::NoAddrsAvail, "No addresses available for this interface.")
        };

        let mut reply = Dhcp6Packet::create_reply(packet, MessageType::Advertise);
        reply
            .options
            .push(Dhcp6Option::ServerId(self.context.server_duid.clone()));
        reply
            .options
            .push(Dhcp6Option::ClientId(self.client.duid.to_vec()));
        reply.options.push(Dhcp6Option::status(code, message));
        reply
    }

    fn start_ia(&self, ia_type: IaType, iaid: u32) -> Result<IaWork> {
        let key = IaKey::new(ia_type, iaid, self.client.duid);
        let old = self.state.repository.lookup(&key).cloned();

        let mut fixed = None;
        let mut fixed_prefixes = Vec::new();
        if let Some(host) = self.host {
            match ia_type {
                IaType::Na if !host.fixed_addresses.is_empty() => {
                    let topology = &self.context.topology;
                    let address = host
                        .fixed_addresses
                        .iter()
                        .copied()
                        .find(|address| topology.subnet_in_network(self.network, *address).is_some())
                        .ok_or_else(|| {
                            Error::Internal(format!(
                                "host {} has no fixed address on shared network {}",
                                host.name,
                                topology.network_name(self.network)
                            ))
                        })?;
                    fixed = Some(address);
                }
                IaType::Pd => fixed_prefixes = host.fixed_prefixes.clone(),
                _ => {}
            }
        }

        Ok(IaWork {
            reply: IaReply::new(ia_type, iaid),
            key,
            old,
            fixed,
            fixed_prefixes,
            client_preferred: 0,
            client_valid: 0,
            client_resources: 0,
            resources_included: false,
            canceled: false,
            preflen: None,
            scopes: self.base.clone(),
        })
    }

    fn is_on_link(&self, address: Ipv6Addr) -> bool {
        self.context
            .topology
            .subnet_in_network(self.network, address)
            .is_some()
            && !self.state.arena.eui64_conflict(address, self.client.duid)
    }

    /// Answers Advertise instead of Reply for this Solicit.
    fn disable_rapid_commit(&mut self) {
        if self.reply_type == MessageType::Reply && self.packet.msg_type == MessageType::Solicit {
            debug!("Disabling rapid commit: client asked for an address not on this link");
            self.reply_type = MessageType::Advertise;
            self.reply.msg_type = MessageType::Advertise;
            self.reply
                .options
                .retain(|option| !matches!(option, Dhcp6Option::RapidCommit));
        }
    }

    /// The old IA's lease at `address/prefix_len`, if it may still be
    /// handed back on this shared network.
    fn owned_lease(&self, work: &IaWork, address: Ipv6Addr, prefix_len: u8) -> Option<LeaseId> {
        let arena = &self.state.arena;
        work.old.as_ref()?.leases.iter().copied().find(|id| {
            arena.lease(*id).is_some_and(|lease| {
                lease.address == address
                    && lease.prefix_len == prefix_len
                    && lease.state != LeaseState::Abandoned
                    && arena.pool(lease.pool).network == self.network
                    && arena.is_usable(*id)
                    && arena.lease_permitted(lease, &self.client)
            })
        })
    }

    /// The best of the old IA's leases still usable on this network.
    fn best_old_lease(&self, work: &IaWork) -> Option<LeaseId> {
        let arena = &self.state.arena;
        let old = work.old.as_ref()?;
        old.leases
            .iter()
            .filter_map(|id| arena.lease(*id))
            .filter(|lease| {
                arena.pool(lease.pool).network == self.network
                    && arena.is_usable(lease.id)
                    && arena.lease_permitted(lease, &self.client)
            })
            .fold(None, |best: Option<&SubLease>, lease| match best {
                Some(best) if !lease.better_than(best) => Some(best),
                _ => Some(lease),
            })
            .map(|lease| lease.id)
    }

    fn ia_limit(&self, ia_type: IaType) -> u32 {
        let name = match ia_type {
            IaType::Pd => OptionName::LimitPrefsPerIa,
            _ => OptionName::LimitAddrsPerIa,
        };
        self.context.evaluator.number(name, &self.base).unwrap_or(1)
    }

    fn limit_reached(&self, work: &IaWork) -> bool {
        work.client_resources != 0 && work.client_resources >= self.ia_limit(work.key.ia_type)
    }

    fn process_address(&mut self, work: &mut IaWork, address: Ipv6Addr) -> Result<()> {
        if address.is_unspecified() {
            return Ok(());
        }

        if !self.is_on_link(address) {
            match self.packet.msg_type {
                MessageType::Solicit => self.disable_rapid_commit(),
                MessageType::Request => {
                    work.cancel(StatusCode::NotOnLink, "Address not for use on this link.");
                }
                MessageType::Renew | MessageType::Rebind => work.echo_zero(address, 0),
                other => {
                    return Err(Error::Internal(format!(
                        "address processing reached for {}",
                        other
                    )));
                }
            }
            return Ok(());
        }

        let owned = if work.fixed == Some(address) {
            Some(Owned::Fixed)
        } else {
            self.owned_lease(work, address, 0).map(Owned::Lease)
        };
        if owned.is_none() && self.packet.msg_type == MessageType::Renew {
            work.cancel(StatusCode::NoBinding, "Address not bound to this interface.");
            return Ok(());
        }
        if self.limit_reached(work) {
            return Ok(());
        }

        let owned = match owned {
            Some(owned) => owned,
            None => match self.packet.msg_type {
                MessageType::Solicit | MessageType::Request | MessageType::Rebind => {
                    match self.state.arena.try_address(
                        self.network,
                        address,
                        &work.key,
                        &self.client,
                        self.now,
                    ) {
                        Ok(id) => Owned::Lease(id),
                        Err(Error::AddressInUse(_) | Error::NotInPool(_)) => {
                            if self.packet.msg_type == MessageType::Rebind {
                                work.echo_zero(address, 0);
                            }
                            return Ok(());
                        }
                        Err(error) => return Err(error),
                    }
                }
                other => {
                    return Err(Error::Internal(format!(
                        "address processing reached for {}",
                        other
                    )));
                }
            },
        };

        self.grant(work, owned, address, 0);
        Ok(())
    }

    /// Keeps the temporary addresses the client still owns. If any of them
    /// cannot be kept, all are dropped and a fresh set is allocated.
    fn process_temporaries(&mut self, work: &mut IaWork, ia: &IaTa) -> Result<()> {
        for address in ia.addresses() {
            work.hint(address.preferred, address.valid);
            if address.address.is_unspecified() {
                continue;
            }

            let mut owned = None;
            if self.is_on_link(address.address) {
                owned = self.owned_lease(work, address.address, 0);
                if owned.is_none() && self.packet.msg_type != MessageType::Renew {
                    owned = self
                        .state
                        .arena
                        .try_address(self.network, address.address, &work.key, &self.client, self.now)
                        .ok();
                }
            }

            match owned {
                Some(id) => self.grant(work, Owned::Lease(id), address.address, 0),
                None => {
                    work.clear();
                    break;
                }
            }
        }
        Ok(())
    }

    fn process_prefix(&mut self, work: &mut IaWork, prefix: &IaPrefix) -> Result<()> {
        if prefix.prefix_len == 0 {
            return Ok(());
        }
        if work.preflen.is_none() {
            work.preflen = Some(prefix.prefix_len);
        }
        if prefix.prefix.is_unspecified() {
            return Ok(());
        }
        let fixed = work
            .fixed_prefixes
            .iter()
            .any(|net| net.addr() == prefix.prefix && net.prefix_len() == prefix.prefix_len);
        let owned = if fixed {
            Some(Owned::Fixed)
        } else {
            self.owned_lease(work, prefix.prefix, prefix.prefix_len)
                .map(Owned::Lease)
        };
        if owned.is_none() && self.packet.msg_type == MessageType::Renew {
            work.cancel(StatusCode::NoBinding, "Prefix not bound to this interface.");
            return Ok(());
        }
        if self.limit_reached(work) {
            return Ok(());
        }

        let owned = match owned {
            Some(owned) => owned,
            None => match self.packet.msg_type {
                MessageType::Solicit | MessageType::Request | MessageType::Rebind => {
                    match self.state.arena.try_prefix(
                        self.network,
                        prefix.prefix,
                        prefix.prefix_len,
                        &work.key,
                        &self.client,
                        self.now,
                    ) {
                        Ok(id) => Owned::Lease(id),
                        Err(Error::AddressInUse(_) | Error::NotInPool(_)) => {
                            if self.packet.msg_type == MessageType::Rebind {
                                work.echo_zero(prefix.prefix, prefix.prefix_len);
                            }
                            return Ok(());
                        }
                        Err(error) => return Err(error),
                    }
                }
                other => {
                    return Err(Error::Internal(format!(
                        "prefix processing reached for {}",
                        other
                    )));
                }
            },
        };

        self.grant(work, owned, prefix.prefix, prefix.prefix_len);
        Ok(())
    }

    fn lease_scopes(&self, id: LeaseId) -> Vec<ScopeRef> {
        let arena = &self.state.arena;
        let mut scopes = vec![ScopeRef::Global, ScopeRef::SharedNetwork(self.network)];
        if let Some(lease) = arena.lease(id) {
            if let Some(subnet) = self.context.topology.subnet_in_network(self.network, lease.address) {
                scopes.push(ScopeRef::Subnet(subnet));
            }
            scopes.push(ScopeRef::Pond(arena.pool(lease.pool).pond.0));
        }
        scopes.extend_from_slice(&self.tail);
        scopes
    }

    fn fixed_scopes(&self, address: Ipv6Addr) -> Vec<ScopeRef> {
        let mut scopes = vec![ScopeRef::Global, ScopeRef::SharedNetwork(self.network)];
        if let Some(subnet) = self.context.topology.subnet_in_network(self.network, address) {
            scopes.push(ScopeRef::Subnet(subnet));
        }
        scopes.extend_from_slice(&self.tail);
        scopes
    }

    /// Finalizes lifetimes for one granted address or prefix and adds it to
    /// the IA.
    fn grant(&self, work: &mut IaWork, owned: Owned, address: Ipv6Addr, prefix_len: u8) {
        let (scopes, source) = match owned {
            Owned::Fixed => (self.fixed_scopes(address), EntrySource::Fixed),
            Owned::Lease(id) => (self.lease_scopes(id), EntrySource::Lease(id)),
        };

        let evaluator = &self.context.evaluator;
        let (preferred, valid) = finalize_lifetimes(
            work.client_preferred,
            work.client_valid,
            evaluator.number(OptionName::DefaultLeaseTime, &scopes),
            evaluator.number(OptionName::PreferredLifetime, &scopes),
            self.now,
        );

        work.reply.entries.push(ReplyEntry {
            address,
            prefix_len,
            preferred,
            valid,
            source,
        });
        work.client_resources += 1;
        work.resources_included = true;
        work.scopes = scopes;
    }

    /// Default allocation for an IA the client's own values did not fill.
    fn find_client_resources(&mut self, work: &mut IaWork) -> Result<()> {
        match work.key.ia_type {
            IaType::Na => self.find_client_address(work),
            IaType::Ta => {
                let config = &self.context.config;
                let leases = self.state.arena.allocate_temporaries(
                    self.network,
                    &work.key,
                    &self.client,
                    config.allocation_attempts,
                    self.now,
                )?;
                for id in leases {
                    if let Some(address) = self.state.arena.lease(id).map(|lease| lease.address) {
                        self.grant(work, Owned::Lease(id), address, 0);
                    }
                }
                Ok(())
            }
            IaType::Pd => self.find_client_prefix(work),
        }
    }

    fn find_client_address(&mut self, work: &mut IaWork) -> Result<()> {
        if let Some(address) = work.fixed {
            self.grant(work, Owned::Fixed, address, 0);
            return Ok(());
        }

        let best = self
            .best_old_lease(work)
            .and_then(|id| self.state.arena.lease(id))
            .map(|lease| (lease.id, lease.address, lease.state));
        if let Some((id, address, state)) = best
            && state != LeaseState::Abandoned
        {
            self.grant(work, Owned::Lease(id), address, 0);
            return Ok(());
        }

        let attempts = self.context.config.allocation_attempts;
        match self
            .state
            .arena
            .allocate_address(self.network, &work.key, &self.client, attempts, self.now)
        {
            Ok(id) => {
                let address = self
                    .state
                    .arena
                    .lease(id)
                    .map(|lease| lease.address)
                    .ok_or_else(|| Error::Internal(format!("allocated lease {} vanished", id)))?;
                self.grant(work, Owned::Lease(id), address, 0);
                Ok(())
            }
            Err(Error::NoResources) if best.is_some() => {
                error!(
                    "Best match for DUID {} is an abandoned address. This may be a result of multiple clients attempting to use this DUID",
                    format_duid(self.client.duid)
                );
                Err(Error::NoResources)
            }
            Err(error) => Err(error),
        }
    }

    fn find_client_prefix(&mut self, work: &mut IaWork) -> Result<()> {
        let preflen = work.preflen.unwrap_or(0);

        if !work.fixed_prefixes.is_empty() {
            let chosen = work
                .fixed_prefixes
                .iter()
                .find(|net| net.prefix_len() == preflen)
                .or_else(|| work.fixed_prefixes.first())
                .copied();
            if let Some(net) = chosen {
                self.grant(work, Owned::Fixed, net.addr(), net.prefix_len());
                return Ok(());
            }
        }

        let mode = self.context.config.prefix_length_mode;
        let best = self
            .best_old_lease(work)
            .and_then(|id| self.state.arena.lease(id))
            .filter(|lease| {
                preflen == 0
                    || mode == PrefixLengthMode::Ignore
                    || lease.prefix_len == preflen
                    || self.packet.msg_type == MessageType::Rebind
            })
            .map(|lease| (lease.id, lease.address, lease.prefix_len, lease.state));
        if let Some((id, prefix, prefix_len, state)) = best
            && state != LeaseState::Abandoned
        {
            self.grant(work, Owned::Lease(id), prefix, prefix_len);
            return Ok(());
        }

        let attempts = self.context.config.prefix_allocation_attempts;
        let id = self.state.arena.allocate_prefix(
            self.network,
            &work.key,
            &self.client,
            preflen,
            mode,
            attempts,
            self.now,
        )?;
        let (prefix, prefix_len) = self
            .state
            .arena
            .lease(id)
            .map(|lease| (lease.address, lease.prefix_len))
            .ok_or_else(|| Error::Internal(format!("allocated lease {} vanished", id)))?;
        self.grant(work, Owned::Lease(id), prefix, prefix_len);
        Ok(())
    }

    /// Completes one IA: default allocation, commit and T1/T2. Returns
    /// `None` when the IA is left out of the reply.
    fn finish_ia(&mut self, mut work: IaWork) -> Result<Option<IaReply>> {
        let ia_type = work.key.ia_type;

        if !work.canceled && work.client_resources == 0 {
            match self.find_client_resources(&mut work) {
                Ok(()) => {}
                Err(Error::NoResources) => match self.packet.msg_type {
                    MessageType::Solicit | MessageType::Request => {
                        work.clear();
                        let (code, message) = match ia_type {
                            IaType::Pd => {
                                (StatusCode::NoPrefixAvail, "No prefixes available for this interface.")
                            }
                            _ => (StatusCode::NoAddrsAvail, "No addresses available for this interface."),
                        };
                        work.reply.status = Some((code, message.to_string()));
                    }
                    _ if !work.resources_included => return Ok(None),
                    _ => {}
                },
                Err(error) => return Err(error),
            }
        }

        if work.canceled || work.client_resources == 0 {
            return Ok(Some(work.reply));
        }

        self.handle_fixed(&work);
        if self.reply_type == MessageType::Reply && !work.reply.leases().is_empty() {
            self.commit(&mut work)?;
        }

        let duid = format_duid(self.client.duid);
        for entry in &work.reply.entries {
            if entry.source != EntrySource::Echo {
                info!(
                    "{} {}: {} to client with duid {} iaid = {} valid for {} seconds",
                    self.reply_type,
                    ia_type,
                    entry.describe(),
                    duid,
                    work.key.iaid,
                    entry.valid
                );
            }
        }

        if ia_type != IaType::Ta {
            let evaluator = &self.context.evaluator;
            let (t1, t2) = tee_times(
                work.min_preferred(),
                evaluator.number(OptionName::RenewalTime, &work.scopes),
                evaluator.number(OptionName::RebindingTime, &work.scopes),
                evaluator.flag(OptionName::SetTeeTimes, &work.scopes) == Some(true),
            );
            work.reply.t1 = t1;
            work.reply.t2 = t2;
        }

        self.granted_any = true;
        Ok(Some(work.reply))
    }

    /// Fixed addresses and prefixes are never stored; they only get DNS
    /// updates and, for a Reply, their on-commit hooks.
    fn handle_fixed(&self, work: &IaWork) {
        let evaluator = &self.context.evaluator;
        for entry in work.reply.entries.iter().filter(|e| e.source == EntrySource::Fixed) {
            let scopes = self.fixed_scopes(entry.address);
            info!(
                "Fixed {} for {} from host reservation",
                entry.describe(),
                work.key
            );
            if evaluator.flag(OptionName::UpdateStaticLeases, &scopes) == Some(true) {
                self.context.ddns.submit_static(&work.key, entry.address);
            }
            if self.reply_type == MessageType::Reply {
                evaluator
                    .collect_hooks(&scopes)
                    .run_commit(&entry.describe());
            }
        }
    }

    /// Binds every dynamic lease of a Reply to the new IA, renewing those
    /// the reuse policy does not cover, and swaps the IA into the
    /// repository.
    fn commit(&mut self, work: &mut IaWork) -> Result<()> {
        let evaluator = Arc::clone(&self.context.evaluator);
        let network_name = self.context.topology.network_name(self.network).to_string();
        let mut must_commit = false;

        for index in 0..work.reply.entries.len() {
            let EntrySource::Lease(id) = work.reply.entries[index].source else {
                continue;
            };
            let scopes = self.lease_scopes(id);
            let vanished = || Error::Internal(format!("lease {} vanished during commit", id));

            let lease = self.state.arena.lease(id).ok_or_else(vanished)?;
            let subject = lease.describe();
            let threshold = evaluator.number(OptionName::CacheThreshold, &scopes);
            let reused = reuse_age(lease, threshold, self.now);

            let mut hooks = evaluator.collect_hooks(&scopes);
            hooks.run_commit(&subject);
            let ddns = evaluator.flag(OptionName::DdnsUpdates, &scopes) != Some(false);

            let entry = &mut work.reply.entries[index];
            if let Some(age) = reused {
                let (preferred, valid) = shorten_lifetimes(entry.preferred, entry.valid, age);
                debug!(
                    "Sending shortened lifetimes for {}: preferred {} valid {}",
                    subject, preferred, valid
                );
                entry.preferred = preferred;
                entry.valid = valid;
            }

            let lease = self.state.arena.lease_mut(id).ok_or_else(vanished)?;
            lease.holder = Some(work.key.clone());
            lease.hooks = hooks;
            if reused.is_none() {
                lease.preferred = entry.preferred;
                lease.valid = entry.valid;
                lease.soft_end = if entry.valid == INFINITE_LIFETIME {
                    MAX_TIME
                } else {
                    (self.now + i64::from(entry.valid)).min(MAX_TIME)
                };
            }
            let pending = ddns && self.context.ddns.submit(&work.key, lease);
            lease.ddns_pending = pending;

            // A reused lease keeps its expiry and stays out of the journal.
            if reused.is_some() {
                continue;
            }

            self.state.arena.renew_lease(id)?;
            must_commit = true;
            self.state.arena.check_pool_threshold(
                id,
                evaluator.number(OptionName::LogThresholdHigh, &scopes),
                evaluator.number(OptionName::LogThresholdLow, &scopes),
                &network_name,
            );
        }

        let mut record = IaRecord::new(work.key.clone());
        record.leases = work.reply.leases();
        if let Some(old) = &work.old {
            self.release_on_roam(old, &record)?;
        }

        self.state
            .repository
            .replace(Some(&work.key), record, self.now);
        if must_commit && let Some(record) = self.state.repository.lookup(&work.key) {
            self.state.journal.write_ia(record, &self.state.arena);
        }
        Ok(())
    }

    /// Releases the old IA's leases when the client shows up on another
    /// shared network. Returns true if it did.
    fn release_on_roam(&mut self, old: &IaRecord, new: &IaRecord) -> Result<bool> {
        if !self.context.config.release_on_roam
            || old.leases.is_empty()
            || !detect_roam(old, &self.state.arena, self.network)
        {
            return Ok(false);
        }

        for id in old.leases.iter().filter(|id| !new.leases.contains(id)) {
            let Some(lease) = self.state.arena.lease(*id) else {
                continue;
            };
            info!(
                "Client {} moved to shared network {}, releasing {}",
                old.key,
                self.context.topology.network_name(self.network),
                lease.describe()
            );
            self.state.arena.release_lease(*id, self.now)?;
        }

        let mut released = old.clone();
        released.cltt = self.now;
        self.state.journal.write_ia(&released, &self.state.arena);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::packet::Dhcp6Packet;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_default_lifetimes() {
        assert_eq!(finalize_lifetimes(0, 0, None, None, NOW), (27000, 43200));
        assert_eq!(finalize_lifetimes(0, 0, Some(3600), None, NOW), (2250, 3600));
    }

    #[test]
    fn test_client_hints_and_overrides() {
        assert_eq!(finalize_lifetimes(1000, 2000, None, None, NOW), (1000, 2000));
        assert_eq!(finalize_lifetimes(1000, 2000, Some(7200), None, NOW), (1000, 2000));
        assert_eq!(finalize_lifetimes(0, 90000, Some(7200), None, NOW), (4500, 7200));
        assert_eq!(finalize_lifetimes(0, 0, Some(3600), Some(9000), NOW), (3600, 3600));
        assert_eq!(finalize_lifetimes(0, 0, Some(3600), Some(600), NOW), (600, 3600));
    }

    #[test]
    fn test_client_cannot_extend_lifetimes() {
        assert_eq!(
            finalize_lifetimes(INFINITE_LIFETIME, INFINITE_LIFETIME, None, None, NOW),
            (27000, 43200)
        );
        assert_eq!(finalize_lifetimes(0, 50000, None, None, NOW), (27000, 43200));
    }

    #[test]
    fn test_lifetimes_past_max_time_are_infinite() {
        let (preferred, valid) = finalize_lifetimes(0, 0, Some(0x7000_0000), None, NOW);
        assert_eq!(valid, INFINITE_LIFETIME);
        assert_eq!(preferred, INFINITE_LIFETIME);

        let (preferred, valid) = finalize_lifetimes(3600, 0, Some(INFINITE_LIFETIME), None, NOW);
        assert_eq!((preferred, valid), (3600, INFINITE_LIFETIME));
    }

    #[test]
    fn test_tee_times() {
        assert_eq!(tee_times(27000, None, None, true), (13500, 21600));
        assert_eq!(tee_times(27000, None, None, false), (0, 0));
        assert_eq!(tee_times(27000, Some(100), None, false), (100, 0));
        assert_eq!(tee_times(27000, Some(100), Some(200), true), (100, 200));
        assert_eq!(
            tee_times(INFINITE_LIFETIME, None, None, true),
            (INFINITE_LIFETIME, INFINITE_LIFETIME)
        );
    }

    #[test]
    fn test_ia_reply_encoding() {
        let mut ia = IaReply::new(IaType::Pd, 3);
        ia.t1 = 10;
        ia.t2 = 20;
        ia.entries.push(ReplyEntry {
            address: "2001:db8:100::".parse().unwrap(),
            prefix_len: 56,
            preferred: 100,
            valid: 200,
            source: EntrySource::Lease(LeaseId(4)),
        });
        let Dhcp6Option::IaPd(pd) = ia.to_option() else {
            panic!("expected IA_PD");
        };
        assert_eq!((pd.iaid, pd.t1, pd.t2), (3, 10, 20));
        let prefix = pd.prefixes().next().unwrap();
        assert_eq!(prefix.prefix_len, 56);
        assert_eq!(ia.leases(), vec![LeaseId(4)]);

        let mut na = IaReply::new(IaType::Na, 9);
        na.status = Some((StatusCode::NoBinding, "gone".to_string()));
        let Dhcp6Option::IaNa(na) = na.to_option() else {
            panic!("expected IA_NA");
        };
        assert_eq!(na.addresses().count(), 0);
        assert_eq!(na.status(), Some((StatusCode::NoBinding as u16, "gone")));
    }

    fn request(msg_type: MessageType, options: Vec<Dhcp6Option>) -> Dhcp6Packet {
        Dhcp6Packet {
            msg_type,
            transaction_id: [9, 9, 9],
            options,
        }
    }

    #[test]
    fn test_start_reply_rapid_commit() {
        let mut config = Config::default();
        let scopes = [ScopeRef::Global];
        let solicit = request(MessageType::Solicit, vec![Dhcp6Option::RapidCommit]);

        let context = ServerContext::builder(config.clone()).build().unwrap();
        let reply = start_reply(&context, &solicit, Some(&[0, 1]), &scopes);
        assert_eq!(reply.msg_type, MessageType::Advertise);
        assert!(!reply.has_rapid_commit());

        config.options.rapid_commit = Some(true);
        config.options.preference = Some(255);
        let context = ServerContext::builder(config).build().unwrap();
        let reply = start_reply(&context, &solicit, Some(&[0, 1]), &scopes);
        assert_eq!(reply.msg_type, MessageType::Reply);
        assert!(reply.has_rapid_commit());
        assert!(!reply.options.contains(&Dhcp6Option::Preference(255)));
        assert_eq!(reply.transaction_id, [9, 9, 9]);
        assert_eq!(reply.server_id(), Some(context.server_duid.as_slice()));
    }

    #[test]
    fn test_requested_options() {
        let mut config = Config::default();
        config.options.domain_search = Some(vec!["example.com".to_string()]);
        config.options.information_refresh_time = Some(86400);
        let context = ServerContext::builder(config).build().unwrap();
        let scopes = [ScopeRef::Global];

        let oro = Dhcp6Option::OptionRequest(vec![23, 24, 32]);
        let info = request(MessageType::InformationRequest, vec![oro.clone()]);
        let mut reply = start_reply(&context, &info, None, &scopes);
        add_requested_options(&context, &info, &mut reply, &scopes);
        assert!(reply.options.iter().any(|o| matches!(o, Dhcp6Option::DnsServers(_))));
        assert!(reply.options.contains(&Dhcp6Option::DomainSearch(vec!["example.com".to_string()])));
        assert!(reply.options.contains(&Dhcp6Option::InformationRefreshTime(86400)));

        let renew = request(MessageType::Renew, vec![oro]);
        let mut reply = start_reply(&context, &renew, Some(&[0, 1]), &scopes);
        add_requested_options(&context, &renew, &mut reply, &scopes);
        add_requested_options(&context, &renew, &mut reply, &scopes);
        assert!(!reply.options.iter().any(|o| matches!(o, Dhcp6Option::InformationRefreshTime(_))));
        let dns = reply
            .options
            .iter()
            .filter(|o| matches!(o, Dhcp6Option::DnsServers(_)))
            .count();
        assert_eq!(dns, 1);
    }
}
