//! Message dispatch.
//!
//! The [`Engine`] owns the mutable allocation state behind one async mutex
//! and turns a received datagram into the datagram to send back, if any.
//! Relay-Forward messages are unwrapped recursively and the reply is
//! wrapped back into a Relay-Reply for every hop.
//!
//! Solicit, Request, Renew and Rebind go through
//! [`lease_to_client`](crate::reply::lease_to_client); Confirm, Decline,
//! Release and Information-Request are answered here.

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::format_duid;
use crate::context::ServerContext;
use crate::error::Result;
use crate::ia::{IaKey, IaRepository, IaType};
use crate::lease::LeaseJournal;
use crate::options::{Dhcp6Option, MessageType, StatusCode};
use crate::packet::{Dhcp6Packet, HOP_COUNT_LIMIT, Message, ReceiveInfo, RelayPacket};
use crate::pool::PoolArena;
use crate::reply::{EntrySource, IaReply, ReplyEntry, add_requested_options, lease_to_client, start_reply};
use crate::scope::ScopeRef;
use crate::validate::{
    Discard, is_unicast_permitted, use_multicast_reply, validate_client_message,
    validate_client_response, validate_information_request,
};

/// Everything a request may mutate.
#[derive(Debug)]
pub struct EngineState {
    pub arena: PoolArena,
    pub repository: IaRepository,
    pub journal: LeaseJournal,
}

impl EngineState {
    /// Builds the arena from the configuration and replays the journal
    /// into it.
    pub fn restore(context: &ServerContext, journal: LeaseJournal) -> Result<Self> {
        let mut arena = PoolArena::from_config(&context.config)?;
        let mut repository = IaRepository::new();
        let restored = journal.restore(&mut arena, &mut repository);
        if restored > 0 {
            info!("Restored {} IAs from the lease journal", restored);
        }
        Ok(Self {
            arena,
            repository,
            journal,
        })
    }

    /// Runs the pool timers: drops stale soft bindings, expires committed
    /// leases and rewrites the IAs that held them. Returns the number of
    /// leases touched.
    pub fn expire(&mut self, now: i64) -> usize {
        let expired = self.arena.expire_leases(now);

        let holders: HashSet<IaKey> = expired
            .iter()
            .filter(|expiration| !expiration.dropped)
            .filter_map(|expiration| expiration.holder.clone())
            .collect();
        for key in &holders {
            if let Some(record) = self.repository.lookup(key) {
                self.journal.write_ia(record, &self.arena);
            }
        }

        expired.len()
    }
}

/// Which way a client hands a binding back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GiveBack {
    Decline,
    Release,
}

/// The DHCPv6 protocol engine.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use dhcp6lease::{Config, Engine, LeaseJournal, ReceiveInfo, ServerContext};
///
/// # async fn example(datagram: &[u8]) -> dhcp6lease::Result<()> {
/// let config = Config::default();
/// let journal = LeaseJournal::load(&config.leases_file, Duration::from_secs(5)).await?;
/// let context = Arc::new(ServerContext::builder(config).build()?);
/// let engine = Engine::new(context, journal)?;
///
/// let info = ReceiveInfo { interface: Some("eth0".to_string()), unicast: false };
/// if let Some(reply) = engine.handle(datagram, &info, chrono::Utc::now().timestamp()).await {
///     // send `reply` back to the client
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Engine {
    context: Arc<ServerContext>,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(context: Arc<ServerContext>, journal: LeaseJournal) -> Result<Self> {
        let state = EngineState::restore(&context, journal)?;
        Ok(Self {
            context,
            state: Mutex::new(state),
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Direct access to the allocation state, for inspection and
    /// maintenance.
    pub fn state(&self) -> &Mutex<EngineState> {
        &self.state
    }

    /// Handles one received datagram and returns the reply to send.
    ///
    /// Malformed and discarded messages produce no reply. A request that
    /// trips an internal error is logged and dropped; the server keeps
    /// running.
    pub async fn handle(&self, data: &[u8], info: &ReceiveInfo, now: i64) -> Option<Vec<u8>> {
        let message = match Message::parse(data) {
            Ok(message) => message,
            Err(error) => {
                debug!("Dropping malformed message: {}", error);
                return None;
            }
        };

        let mut state = self.state.lock().await;
        let mut relays = Vec::new();
        let reply = match self.dispatch(&mut state, message, &mut relays, info, now) {
            Ok(reply) => reply,
            Err(error) => {
                error!("Failed to build reply: {}", error);
                None
            }
        };

        if let Err(error) = state.journal.commit_timed().await {
            error!("Failed to save lease journal: {}", error);
        }
        drop(state);

        match reply?.encode() {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                warn!("Failed to encode reply: {}", error);
                None
            }
        }
    }

    /// Runs the expiry sweep under the state lock.
    pub async fn expire_leases(&self, now: i64) -> usize {
        let mut state = self.state.lock().await;
        state.expire(now)
    }

    /// Saves the journal if the commit interval has passed.
    pub async fn commit_timed(&self) -> Result<()> {
        self.state.lock().await.journal.commit_timed().await
    }

    /// Saves the journal now.
    pub async fn save(&self) -> Result<()> {
        self.state.lock().await.journal.save().await
    }

    fn dispatch(
        &self,
        state: &mut EngineState,
        message: Message,
        relays: &mut Vec<RelayPacket>,
        info: &ReceiveInfo,
        now: i64,
    ) -> Result<Option<Message>> {
        match message {
            Message::Relay(relay) => self.relay_forward(state, relay, relays, info, now),
            Message::Client(packet) => Ok(self
                .client_message(state, &packet, relays, info, now)?
                .map(Message::Client)),
        }
    }

    fn relay_forward(
        &self,
        state: &mut EngineState,
        relay: RelayPacket,
        relays: &mut Vec<RelayPacket>,
        info: &ReceiveInfo,
        now: i64,
    ) -> Result<Option<Message>> {
        if relay.msg_type != MessageType::RelayForw {
            debug!("Discarding {} from {}", relay.msg_type, relay.peer_address);
            return Ok(None);
        }
        if relays.len() >= usize::from(HOP_COUNT_LIMIT) {
            debug!("Discarding relayed message from {}: too many hops", relay.peer_address);
            return Ok(None);
        }

        let inner = match relay.inner_message() {
            Some(Ok(inner)) => inner,
            Some(Err(error)) => {
                debug!(
                    "Discarding relayed message from {}: {}",
                    relay.peer_address, error
                );
                return Ok(None);
            }
            None => {
                debug!(
                    "Discarding {} from {}: no relay message option",
                    relay.msg_type, relay.peer_address
                );
                return Ok(None);
            }
        };
        if inner.msg_type() == MessageType::Dhcpv4Query {
            debug!(
                "Discarding DHCPv4-over-DHCPv6 query relayed by {}",
                relay.peer_address
            );
            return Ok(None);
        }

        relays.push(relay.clone());
        let reply = self.dispatch(state, inner, relays, info, now);
        relays.pop();

        let Some(reply) = reply? else {
            return Ok(None);
        };
        Ok(Some(Message::Relay(relay.create_reply(reply.encode()?))))
    }

    fn client_message(
        &self,
        state: &mut EngineState,
        packet: &Dhcp6Packet,
        relays: &[RelayPacket],
        info: &ReceiveInfo,
        now: i64,
    ) -> Result<Option<Dhcp6Packet>> {
        let context = &*self.context;
        let unicast = relays.is_empty() && info.unicast;

        match packet.msg_type {
            MessageType::Solicit | MessageType::Rebind => {
                let client_id = match validate_client_message(packet, unicast) {
                    Ok(client_id) => client_id,
                    Err(reason) => return Ok(discard(packet, reason)),
                };
                let network = context.topology.resolve(relays, info);
                lease_to_client(context, state, packet, client_id, network, now)
            }
            MessageType::Request
            | MessageType::Renew
            | MessageType::Release
            | MessageType::Decline => {
                let client_id = match validate_client_response(packet, &context.server_duid) {
                    Ok(client_id) => client_id,
                    Err(reason) => return Ok(discard(packet, reason)),
                };
                if unicast && !is_unicast_permitted(context, packet, relays, info) {
                    debug!(
                        "Rejecting unicast {} from {}",
                        packet.msg_type,
                        format_duid(client_id)
                    );
                    return Ok(Some(use_multicast_reply(packet, client_id, &context.server_duid)));
                }

                let network = context.topology.resolve(relays, info);
                match packet.msg_type {
                    MessageType::Release => {
                        self.give_back(state, packet, client_id, network, GiveBack::Release, now)
                    }
                    MessageType::Decline => {
                        self.give_back(state, packet, client_id, network, GiveBack::Decline, now)
                    }
                    _ => lease_to_client(context, state, packet, client_id, network, now),
                }
            }
            MessageType::Confirm => {
                let client_id = match validate_client_message(packet, unicast) {
                    Ok(client_id) => client_id,
                    Err(reason) => return Ok(discard(packet, reason)),
                };
                let network = context.topology.resolve(relays, info);
                Ok(self.confirm(packet, client_id, network))
            }
            MessageType::InformationRequest => {
                let client_id =
                    match validate_information_request(packet, unicast, &context.server_duid) {
                        Ok(client_id) => client_id,
                        Err(reason) => return Ok(discard(packet, reason)),
                    };
                let network = context.topology.resolve(relays, info);
                Ok(Some(self.information_request(packet, client_id, network)))
            }
            other => {
                debug!("Discarding {} message: not a client message", other);
                Ok(None)
            }
        }
    }

    /// Scopes for a reply that is not tied to a lease: global, the shared
    /// network if known, then the client's classes and host.
    fn client_scopes(&self, client_id: Option<&[u8]>, network: Option<usize>) -> Vec<ScopeRef> {
        let topology = &self.context.topology;
        let mut scopes = vec![ScopeRef::Global];
        if let Some(network) = network {
            scopes.push(ScopeRef::SharedNetwork(network));
        }
        if let Some(client_id) = client_id {
            scopes.extend(topology.classify(client_id).into_iter().map(ScopeRef::Class));
            let hosts = topology.find_hosts(client_id);
            let host = match network {
                Some(network) => topology.seek_shared_host(&hosts, network),
                None => hosts.first().copied(),
            };
            if let Some(host) = host {
                scopes.push(ScopeRef::Host(host.id));
            }
        }
        scopes
    }

    /// Answers whether the client's addresses are still on its link.
    fn confirm(
        &self,
        packet: &Dhcp6Packet,
        client_id: &[u8],
        network: Option<usize>,
    ) -> Option<Dhcp6Packet> {
        let topology = &self.context.topology;
        let Some(network) = network.filter(|network| topology.has_subnets(*network)) else {
            debug!(
                "Discarding Confirm from {}: no shared network with subnets",
                format_duid(client_id)
            );
            return None;
        };

        let addresses: Vec<Ipv6Addr> = packet
            .ia_na()
            .flat_map(|ia| ia.addresses().map(|address| address.address))
            .chain(
                packet
                    .ia_ta()
                    .flat_map(|ia| ia.addresses().map(|address| address.address)),
            )
            .collect();
        if addresses.is_empty() {
            debug!(
                "Discarding Confirm from {}: no addresses to confirm",
                format_duid(client_id)
            );
            return None;
        }

        let off_link = addresses
            .iter()
            .find(|address| topology.subnet_in_network(network, **address).is_none());
        let scopes = self.client_scopes(Some(client_id), Some(network));
        let mut reply = start_reply(&self.context, packet, Some(client_id), &scopes);
        match off_link {
            Some(address) => {
                debug!("Confirm from {}: {} is not on link", format_duid(client_id), address);
                reply.options.push(Dhcp6Option::status(
                    StatusCode::NotOnLink,
                    "Some of the addresses are not on link.",
                ));
            }
            None => reply.options.push(Dhcp6Option::status(
                StatusCode::Success,
                "All addresses still on link.",
            )),
        }
        add_requested_options(&self.context, packet, &mut reply, &scopes);
        Some(reply)
    }

    /// Handles Decline (IA_NA only) and Release (IA_NA and IA_PD).
    ///
    /// Every address or prefix the client still holds is echoed with zero
    /// lifetimes. An IA holding none of them gets a NoBinding status.
    fn give_back(
        &self,
        state: &mut EngineState,
        packet: &Dhcp6Packet,
        client_id: &[u8],
        network: Option<usize>,
        action: GiveBack,
        now: i64,
    ) -> Result<Option<Dhcp6Packet>> {
        let hosts = self.context.topology.find_hosts(client_id);
        let duid = format_duid(client_id);

        let mut requested: Vec<(IaType, u32, Vec<(Ipv6Addr, u8)>)> = packet
            .ia_na()
            .map(|ia| {
                let addresses = ia.addresses().map(|a| (a.address, 0)).collect();
                (IaType::Na, ia.iaid, addresses)
            })
            .collect();
        if action == GiveBack::Release {
            requested.extend(packet.ia_pd().map(|ia| {
                let prefixes = ia.prefixes().map(|p| (p.prefix, p.prefix_len)).collect();
                (IaType::Pd, ia.iaid, prefixes)
            }));
        }

        let mut ias = Vec::with_capacity(requested.len());
        for (ia_type, iaid, values) in requested {
            let key = IaKey::new(ia_type, iaid, client_id);
            let old = state.repository.lookup(&key).cloned();
            let mut ia = IaReply::new(ia_type, iaid);

            for (address, prefix_len) in values {
                let fixed = hosts.iter().any(|host| match ia_type {
                    IaType::Pd => host
                        .fixed_prefixes
                        .iter()
                        .any(|net| net.addr() == address && net.prefix_len() == prefix_len),
                    _ => host.fixed_addresses.contains(&address),
                });
                let lease = old.as_ref().and_then(|old| {
                    old.leases.iter().copied().find(|id| {
                        state.arena.lease(*id).is_some_and(|lease| {
                            lease.address == address
                                && (ia_type != IaType::Pd || lease.prefix_len == prefix_len)
                        })
                    })
                });
                if !fixed && lease.is_none() {
                    continue;
                }

                match action {
                    GiveBack::Decline => {
                        error!(
                            "Client {} reports address {} is already in use by another host!",
                            duid, address
                        );
                        if let Some(id) = lease {
                            state.arena.decline_lease(id)?;
                        }
                    }
                    GiveBack::Release => {
                        info!("Client {} releases {} iaid = {}", duid, address, iaid);
                        if let Some(id) = lease {
                            state.arena.release_lease(id, now)?;
                        }
                    }
                }
                ia.entries.push(ReplyEntry {
                    address,
                    prefix_len,
                    preferred: 0,
                    valid: 0,
                    source: EntrySource::Echo,
                });
            }

            if ia.entries.is_empty() {
                let message = match (action, ia_type) {
                    (GiveBack::Decline, _) => "Decline for unknown address.",
                    (GiveBack::Release, IaType::Pd) => "Release for unknown prefix.",
                    (GiveBack::Release, _) => "Release for unknown address.",
                };
                ia.status = Some((StatusCode::NoBinding, message.to_string()));
            } else if old.is_some() {
                state.repository.touch(&key, now);
                if let Some(record) = state.repository.lookup(&key) {
                    state.journal.write_ia(record, &state.arena);
                }
            }
            ias.push(ia);
        }

        let scopes = self.client_scopes(Some(client_id), network);
        let mut reply = start_reply(&self.context, packet, Some(client_id), &scopes);
        let message = match action {
            GiveBack::Decline => "Decline received.",
            GiveBack::Release => "Release received.",
        };
        reply
            .options
            .push(Dhcp6Option::status(StatusCode::Success, message));
        reply.options.extend(ias.iter().map(IaReply::to_option));
        add_requested_options(&self.context, packet, &mut reply, &scopes);
        Ok(Some(reply))
    }

    fn information_request(
        &self,
        packet: &Dhcp6Packet,
        client_id: Option<&[u8]>,
        network: Option<usize>,
    ) -> Dhcp6Packet {
        let scopes = self.client_scopes(client_id, network);
        let mut reply = start_reply(&self.context, packet, client_id, &scopes);
        add_requested_options(&self.context, packet, &mut reply, &scopes);
        reply
    }
}

fn discard(packet: &Dhcp6Packet, reason: Discard) -> Option<Dhcp6Packet> {
    debug!("Discarding {} message: {}", packet.msg_type, reason);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, InterfaceConfig, PondConfig, PoolConfig, PoolRange, PrefixLengthMode,
        SharedNetworkConfig, SubnetConfig,
    };
    use crate::context::DdnsUpdater;
    use crate::options::{IaAddress, IaNa, IaPrefix, IaTa, find_status};
    use crate::pool::{LeaseState, SubLease};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000;
    const CLIENT: [u8; 10] = [0, 3, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];
    const OTHER: [u8; 10] = [0, 3, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02];

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
            let _ = std::fs::remove_file(format!("{}.tmp", self.0));
        }
    }

    fn na_pool(start: &str, end: &str) -> PoolConfig {
        PoolConfig {
            kind: IaType::Na,
            range: PoolRange::Span {
                start: start.parse().unwrap(),
                end: end.parse().unwrap(),
            },
            prefix_length: None,
        }
    }

    fn test_config(name: &str) -> (Config, TestGuard) {
        let path = format!("test_engine_{}.json", name);
        let mut config = Config::default();
        config.server_duid = "00:01:00:01:11:22:33:44:00:0c:29:aa:bb:cc".to_string();
        config.leases_file = path.clone();
        let network = &mut config.shared_networks[0];
        network.subnets = vec![SubnetConfig {
            prefix: "2001:db8::/64".parse().unwrap(),
            options: Default::default(),
        }];
        network.ponds = vec![PondConfig {
            pools: vec![na_pool("2001:db8::10", "2001:db8::1f")],
            ..Default::default()
        }];
        (config, TestGuard(path))
    }

    fn engine(config: Config) -> Engine {
        let journal = LeaseJournal::new(&config.leases_file, Duration::from_secs(3600));
        let context = Arc::new(ServerContext::builder(config).build().unwrap());
        Engine::new(context, journal).unwrap()
    }

    fn eth0() -> ReceiveInfo {
        ReceiveInfo {
            interface: Some("eth0".to_string()),
            unicast: false,
        }
    }

    fn ia_na(iaid: u32, addresses: &[&str]) -> Dhcp6Option {
        Dhcp6Option::IaNa(IaNa {
            iaid,
            t1: 0,
            t2: 0,
            options: addresses
                .iter()
                .map(|address| {
                    Dhcp6Option::IaAddr(IaAddress {
                        address: address.parse().unwrap(),
                        preferred: 0,
                        valid: 0,
                        options: vec![],
                    })
                })
                .collect(),
        })
    }

    fn packet(msg_type: MessageType, client: &[u8], mut options: Vec<Dhcp6Option>) -> Dhcp6Packet {
        options.insert(0, Dhcp6Option::ClientId(client.to_vec()));
        Dhcp6Packet {
            msg_type,
            transaction_id: [0x12, 0x34, 0x56],
            options,
        }
    }

    /// A client response carrying the engine's server identifier.
    fn to_server(engine: &Engine, msg_type: MessageType, client: &[u8], mut options: Vec<Dhcp6Option>) -> Dhcp6Packet {
        options.insert(0, Dhcp6Option::ServerId(engine.context().server_duid.clone()));
        packet(msg_type, client, options)
    }

    async fn exchange(engine: &Engine, packet: &Dhcp6Packet, info: &ReceiveInfo, now: i64) -> Option<Dhcp6Packet> {
        let bytes = engine.handle(&packet.encode().unwrap(), info, now).await?;
        match Message::parse(&bytes).unwrap() {
            Message::Client(reply) => Some(reply),
            Message::Relay(_) => panic!("unexpected relay reply"),
        }
    }

    fn granted(reply: &Dhcp6Packet) -> IaAddress {
        reply.ia_na().next().unwrap().addresses().next().unwrap().clone()
    }

    async fn request_address(engine: &Engine, client: &[u8], now: i64) -> Ipv6Addr {
        let request = to_server(engine, MessageType::Request, client, vec![ia_na(7, &[])]);
        let reply = exchange(engine, &request, &eth0(), now).await.unwrap();
        granted(&reply).address
    }

    #[tokio::test]
    async fn test_fresh_request_binds_address() {
        let (config, _guard) = test_config("fresh");
        let engine = engine(config);

        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_na(7, &[])]);
        let reply = exchange(&engine, &request, &eth0(), NOW).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Reply);
        assert_eq!(reply.transaction_id, [0x12, 0x34, 0x56]);
        assert_eq!(reply.client_id(), Some(&CLIENT[..]));

        let ia = reply.ia_na().next().unwrap();
        assert_eq!(ia.iaid, 7);
        assert_eq!(ia.status(), None);
        assert_eq!((ia.t1, ia.t2), (13500, 21600));
        let addresses: Vec<_> = ia.addresses().collect();
        assert_eq!(addresses.len(), 1);
        let segment = addresses[0].address.segments()[7];
        assert!((0x10..=0x1f).contains(&segment));
        assert_eq!((addresses[0].preferred, addresses[0].valid), (27000, 43200));

        let state = engine.state().lock().await;
        let key = IaKey::new(IaType::Na, 7, &CLIENT);
        let record = state.repository.lookup(&key).unwrap();
        assert_eq!(record.cltt, NOW);
        let lease = state.arena.lease(record.leases[0]).unwrap();
        assert!(lease.committed);
        assert_eq!(lease.hard_end, NOW + 43200);
        assert!(state.journal.get(&key).is_some());
    }

    #[tokio::test]
    async fn test_solicit_then_request_keeps_address() {
        let (config, _guard) = test_config("solicit_request");
        let engine = engine(config);

        let solicit = packet(MessageType::Solicit, &CLIENT, vec![ia_na(7, &[])]);
        let advertise = exchange(&engine, &solicit, &eth0(), NOW).await.unwrap();
        assert_eq!(advertise.msg_type, MessageType::Advertise);
        let offered = granted(&advertise).address;
        {
            let state = engine.state().lock().await;
            assert!(state.repository.is_empty());
            assert!(state.journal.is_empty());
        }

        assert_eq!(request_address(&engine, &CLIENT, NOW + 5).await, offered);
    }

    #[tokio::test]
    async fn test_renew_of_unknown_address() {
        let (config, _guard) = test_config("renew_unknown");
        let engine = engine(config);

        let renew = to_server(&engine, MessageType::Renew, &CLIENT, vec![ia_na(7, &["2001:db8::50"])]);
        let reply = exchange(&engine, &renew, &eth0(), NOW).await.unwrap();
        let ia = reply.ia_na().next().unwrap();
        assert_eq!(ia.iaid, 7);
        assert_eq!(ia.addresses().count(), 0);
        assert_eq!(ia.status().map(|(code, _)| code), Some(StatusCode::NoBinding as u16));
    }

    #[tokio::test]
    async fn test_renew_off_link_address_gets_zero_lifetimes() {
        let (config, _guard) = test_config("renew_off_link");
        let engine = engine(config);

        let renew = to_server(&engine, MessageType::Renew, &CLIENT, vec![ia_na(7, &["2001:db8:99::1"])]);
        let reply = exchange(&engine, &renew, &eth0(), NOW).await.unwrap();
        let ia = reply.ia_na().next().unwrap();
        let echoed: Vec<_> = ia.addresses().collect();
        assert!(echoed.iter().any(|a| a.address == "2001:db8:99::1".parse::<Ipv6Addr>().unwrap() && a.valid == 0));
        assert!(echoed.iter().any(|a| a.valid == 43200));
    }

    #[tokio::test]
    async fn test_request_off_link_is_not_on_link() {
        let (config, _guard) = test_config("request_off_link");
        let engine = engine(config);

        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_na(7, &["2001:db8:99::1"])]);
        let reply = exchange(&engine, &request, &eth0(), NOW).await.unwrap();
        let ia = reply.ia_na().next().unwrap();
        assert_eq!(ia.addresses().count(), 0);
        assert_eq!(ia.status().map(|(code, _)| code), Some(StatusCode::NotOnLink as u16));
        assert!(engine.state().lock().await.repository.is_empty());
    }

    #[tokio::test]
    async fn test_decline_abandons_lease() {
        let (config, _guard) = test_config("decline");
        let engine = engine(config);
        let address = request_address(&engine, &CLIENT, NOW).await;

        let decline = to_server(
            &engine,
            MessageType::Decline,
            &CLIENT,
            vec![ia_na(7, &[&address.to_string()])],
        );
        let reply = exchange(&engine, &decline, &eth0(), NOW + 10).await.unwrap();
        assert_eq!(find_status(&reply.options), Some((0, "Decline received.")));
        let ia = reply.ia_na().next().unwrap();
        assert_eq!(ia.status(), None);
        let echoed = ia.addresses().next().unwrap();
        assert_eq!((echoed.address, echoed.preferred, echoed.valid), (address, 0, 0));

        let state = engine.state().lock().await;
        let lease = state.arena.lease_at(IaType::Na, address).unwrap();
        assert_eq!(lease.state, LeaseState::Abandoned);
        let stored = state.journal.get(&IaKey::new(IaType::Na, 7, &CLIENT)).unwrap();
        assert_eq!(stored.leases[0].state, LeaseState::Abandoned);
        assert_eq!(stored.cltt, NOW + 10);
    }

    #[tokio::test]
    async fn test_decline_of_unknown_address() {
        let (config, _guard) = test_config("decline_unknown");
        let engine = engine(config);

        let decline = to_server(&engine, MessageType::Decline, &CLIENT, vec![ia_na(3, &["2001:db8::11"])]);
        let reply = exchange(&engine, &decline, &eth0(), NOW).await.unwrap();
        let ia = reply.ia_na().next().unwrap();
        assert_eq!((ia.t1, ia.t2), (0, 0));
        assert_eq!(
            ia.status(),
            Some((StatusCode::NoBinding as u16, "Decline for unknown address."))
        );
    }

    #[tokio::test]
    async fn test_release_frees_address() {
        let (config, _guard) = test_config("release");
        let engine = engine(config);
        let address = request_address(&engine, &CLIENT, NOW).await;

        let release = to_server(
            &engine,
            MessageType::Release,
            &CLIENT,
            vec![ia_na(7, &[&address.to_string()]), ia_na(8, &["2001:db8::1e"])],
        );
        let reply = exchange(&engine, &release, &eth0(), NOW + 10).await.unwrap();
        assert_eq!(find_status(&reply.options), Some((0, "Release received.")));
        let ias: Vec<_> = reply.ia_na().collect();
        assert_eq!(ias[0].status(), None);
        assert_eq!(
            ias[1].status(),
            Some((StatusCode::NoBinding as u16, "Release for unknown address."))
        );

        {
            let state = engine.state().lock().await;
            assert_eq!(state.arena.lease_at(IaType::Na, address).unwrap().state, LeaseState::Released);
        }

        let other = to_server(&engine, MessageType::Request, &OTHER, vec![ia_na(7, &[&address.to_string()])]);
        let reply = exchange(&engine, &other, &eth0(), NOW + 20).await.unwrap();
        assert_eq!(granted(&reply).address, address);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_addresses() {
        let (config, _guard) = test_config("concurrent");
        let engine = Arc::new(engine(config));

        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..8u8 {
            let engine = Arc::clone(&engine);
            tasks.spawn(async move {
                let client = [0, 3, 0, 1, 0x10, 0x20, 0x30, 0x40, 0x50, index];
                request_address(&engine, &client, NOW).await
            });
        }

        let mut addresses = HashSet::new();
        while let Some(address) = tasks.join_next().await {
            assert!(addresses.insert(address.unwrap()));
        }
        assert_eq!(addresses.len(), 8);
        assert_eq!(engine.state().lock().await.repository.len(), 8);
    }

    #[tokio::test]
    async fn test_solicit_exhaustion() {
        let (mut config, _guard) = test_config("exhaustion");
        config.shared_networks[0].ponds[0].pools = vec![na_pool("2001:db8::10", "2001:db8::10")];
        let engine = engine(config);
        request_address(&engine, &CLIENT, NOW).await;

        let solicit = packet(MessageType::Solicit, &OTHER, vec![ia_na(1, &[])]);
        let advertise = exchange(&engine, &solicit, &eth0(), NOW).await.unwrap();
        assert_eq!(advertise.msg_type, MessageType::Advertise);
        assert_eq!(advertise.options.len(), 3);
        assert!(advertise.ia_na().next().is_none());
        assert_eq!(
            find_status(&advertise.options).map(|(code, _)| code),
            Some(StatusCode::NoAddrsAvail as u16)
        );
    }

    fn pd_config(name: &str) -> (Config, TestGuard) {
        let (mut config, guard) = test_config(name);
        config.prefix_length_mode = PrefixLengthMode::Maximum;
        config.shared_networks[0].ponds.push(PondConfig {
            pools: vec![
                PoolConfig {
                    kind: IaType::Pd,
                    range: PoolRange::Cidr("2001:db8:100::/40".parse().unwrap()),
                    prefix_length: Some(48),
                },
                PoolConfig {
                    kind: IaType::Pd,
                    range: PoolRange::Cidr("2001:db8:200::/48".parse().unwrap()),
                    prefix_length: Some(60),
                },
            ],
            ..Default::default()
        });
        (config, guard)
    }

    fn ia_pd_hint(iaid: u32, prefix_len: u8) -> Dhcp6Option {
        Dhcp6Option::IaPd(IaNa {
            iaid,
            t1: 0,
            t2: 0,
            options: vec![Dhcp6Option::IaPrefix(IaPrefix {
                preferred: 0,
                valid: 0,
                prefix_len,
                prefix: Ipv6Addr::UNSPECIFIED,
                options: vec![],
            })],
        })
    }

    #[tokio::test]
    async fn test_prefix_policy_maximum_picks_shorter_prefix() {
        let (config, _guard) = pd_config("pd_maximum");
        let engine = engine(config);

        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_pd_hint(1, 56)]);
        let reply = exchange(&engine, &request, &eth0(), NOW).await.unwrap();
        let pd = reply.ia_pd().next().unwrap();
        let prefix = pd.prefixes().next().unwrap();
        assert_eq!(prefix.prefix_len, 48);
        assert!("2001:db8:100::/40".parse::<ipnet::Ipv6Net>().unwrap().contains(&prefix.prefix));
    }

    #[tokio::test]
    async fn test_exhausted_na_alongside_granted_pd() {
        let (mut config, _guard) = pd_config("na_exhausted_pd_ok");
        config.shared_networks[0].ponds[0].pools = vec![na_pool("2001:db8::10", "2001:db8::10")];
        let engine = engine(config);
        request_address(&engine, &CLIENT, NOW).await;

        let solicit = packet(MessageType::Solicit, &OTHER, vec![ia_na(1, &[]), ia_pd_hint(2, 48)]);
        let advertise = exchange(&engine, &solicit, &eth0(), NOW).await.unwrap();
        let na = advertise.ia_na().next().unwrap();
        assert_eq!(na.status().map(|(code, _)| code), Some(StatusCode::NoAddrsAvail as u16));
        let pd = advertise.ia_pd().next().unwrap();
        assert_eq!(pd.prefixes().count(), 1);
    }

    #[tokio::test]
    async fn test_renew_within_cache_threshold_reuses_lease() {
        let (mut config, _guard) = test_config("reuse");
        config.options.cache_threshold = Some(25);
        let engine = engine(config);
        let address = request_address(&engine, &CLIENT, NOW).await;

        let renew = to_server(&engine, MessageType::Renew, &CLIENT, vec![ia_na(7, &[&address.to_string()])]);
        let reply = exchange(&engine, &renew, &eth0(), NOW + 600).await.unwrap();
        let renewed = granted(&reply);
        assert_eq!(renewed.address, address);
        assert_eq!((renewed.preferred, renewed.valid), (27000 - 600, 43200 - 600));

        let state = engine.state().lock().await;
        let lease = state.arena.lease_at(IaType::Na, address).unwrap();
        assert_eq!(lease.hard_end, NOW + 43200);
        let key = IaKey::new(IaType::Na, 7, &CLIENT);
        assert_eq!(state.repository.lookup(&key).unwrap().cltt, NOW + 600);
        assert_eq!(state.journal.get(&key).unwrap().cltt, NOW);
    }

    #[tokio::test]
    async fn test_renew_past_threshold_extends_lease() {
        let (mut config, _guard) = test_config("renew_extend");
        config.options.cache_threshold = Some(25);
        let engine = engine(config);
        let address = request_address(&engine, &CLIENT, NOW).await;

        let renew = to_server(&engine, MessageType::Renew, &CLIENT, vec![ia_na(7, &[&address.to_string()])]);
        let reply = exchange(&engine, &renew, &eth0(), NOW + 20000).await.unwrap();
        assert_eq!(granted(&reply).valid, 43200);

        let state = engine.state().lock().await;
        assert_eq!(state.arena.lease_at(IaType::Na, address).unwrap().hard_end, NOW + 20000 + 43200);
    }

    #[tokio::test]
    async fn test_confirm() {
        let (config, _guard) = test_config("confirm");
        let engine = engine(config);

        let on_link = packet(MessageType::Confirm, &CLIENT, vec![ia_na(7, &["2001:db8::11"])]);
        let reply = exchange(&engine, &on_link, &eth0(), NOW).await.unwrap();
        assert_eq!(
            find_status(&reply.options),
            Some((StatusCode::Success as u16, "All addresses still on link."))
        );

        let off_link = packet(
            MessageType::Confirm,
            &CLIENT,
            vec![ia_na(7, &["2001:db8::11", "2001:db8:99::1"])],
        );
        let reply = exchange(&engine, &off_link, &eth0(), NOW).await.unwrap();
        assert_eq!(
            find_status(&reply.options).map(|(code, _)| code),
            Some(StatusCode::NotOnLink as u16)
        );

        let empty = packet(MessageType::Confirm, &CLIENT, vec![ia_na(7, &[])]);
        assert!(exchange(&engine, &empty, &eth0(), NOW).await.is_none());

        let nowhere = ReceiveInfo {
            interface: Some("wlan9".to_string()),
            unicast: false,
        };
        assert!(exchange(&engine, &on_link, &nowhere, NOW).await.is_none());
    }

    #[tokio::test]
    async fn test_unicast_request_rejected_without_permission() {
        let (config, _guard) = test_config("unicast");
        let engine = engine(config);
        let unicast = ReceiveInfo {
            interface: Some("eth0".to_string()),
            unicast: true,
        };

        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_na(7, &[])]);
        let reply = exchange(&engine, &request, &unicast, NOW).await.unwrap();
        assert_eq!(
            find_status(&reply.options),
            Some((StatusCode::UseMulticast as u16, "Unicast not allowed by server."))
        );
        assert!(reply.ia_na().next().is_none());
        assert!(engine.state().lock().await.repository.is_empty());

        let solicit = packet(MessageType::Solicit, &CLIENT, vec![ia_na(7, &[])]);
        assert!(exchange(&engine, &solicit, &unicast, NOW).await.is_none());
    }

    #[tokio::test]
    async fn test_unicast_request_allowed_with_server_unicast() {
        let (mut config, _guard) = test_config("unicast_allowed");
        config.shared_networks[0].options.unicast = Some("2001:db8::1".parse().unwrap());
        let engine = engine(config);
        let unicast = ReceiveInfo {
            interface: Some("eth0".to_string()),
            unicast: true,
        };

        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_na(7, &["2001:db8::12"])]);
        let reply = exchange(&engine, &request, &unicast, NOW).await.unwrap();
        assert_eq!(granted(&reply).address, "2001:db8::12".parse::<Ipv6Addr>().unwrap());
        assert!(reply.options.contains(&Dhcp6Option::Unicast("2001:db8::1".parse().unwrap())));
    }

    #[tokio::test]
    async fn test_relayed_request() {
        let (config, _guard) = test_config("relay");
        let engine = engine(config);

        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_na(7, &[])]);
        let relay = RelayPacket {
            msg_type: MessageType::RelayForw,
            hop_count: 0,
            link_address: "2001:db8::1".parse().unwrap(),
            peer_address: "fe80::1".parse().unwrap(),
            options: vec![
                Dhcp6Option::InterfaceId(b"port7".to_vec()),
                Dhcp6Option::RelayMessage(request.encode().unwrap()),
            ],
        };

        let bytes = engine
            .handle(&relay.encode().unwrap(), &ReceiveInfo::default(), NOW)
            .await
            .unwrap();
        let Message::Relay(reply) = Message::parse(&bytes).unwrap() else {
            panic!("expected a relay reply");
        };
        assert_eq!(reply.msg_type, MessageType::RelayRepl);
        assert_eq!(reply.interface_id(), Some(&b"port7"[..]));
        let Some(Ok(Message::Client(inner))) = reply.inner_message() else {
            panic!("expected an encapsulated reply");
        };
        assert_eq!(inner.msg_type, MessageType::Reply);
        assert_eq!(inner.ia_na().next().unwrap().addresses().count(), 1);
    }

    #[tokio::test]
    async fn test_relay_without_message_is_dropped() {
        let (config, _guard) = test_config("relay_empty");
        let engine = engine(config);
        let relay = RelayPacket {
            msg_type: MessageType::RelayForw,
            hop_count: 0,
            link_address: "2001:db8::1".parse().unwrap(),
            peer_address: "fe80::1".parse().unwrap(),
            options: vec![],
        };
        assert!(engine.handle(&relay.encode().unwrap(), &eth0(), NOW).await.is_none());
    }

    #[tokio::test]
    async fn test_information_request() {
        let (config, _guard) = test_config("info");
        let engine = engine(config);

        let info = Dhcp6Packet {
            msg_type: MessageType::InformationRequest,
            transaction_id: [1, 1, 1],
            options: vec![Dhcp6Option::OptionRequest(vec![23])],
        };
        let reply = exchange(&engine, &info, &eth0(), NOW).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Reply);
        assert!(reply.client_id().is_none());
        assert!(reply.options.iter().any(|o| matches!(o, Dhcp6Option::DnsServers(_))));

        let with_ia = packet(MessageType::InformationRequest, &CLIENT, vec![ia_na(1, &[])]);
        assert!(exchange(&engine, &with_ia, &eth0(), NOW).await.is_none());
    }

    #[tokio::test]
    async fn test_reply_types_are_discarded() {
        let (config, _guard) = test_config("reply_types");
        let engine = engine(config);
        let advertise = packet(MessageType::Advertise, &CLIENT, vec![]);
        assert!(exchange(&engine, &advertise, &eth0(), NOW).await.is_none());
        assert!(engine.handle(&[0xff, 0, 0, 0], &eth0(), NOW).await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let (config, _guard) = test_config("expiry");
        let engine = engine(config);
        let address = request_address(&engine, &CLIENT, NOW).await;
        let solicit = packet(MessageType::Solicit, &OTHER, vec![ia_na(1, &[])]);
        exchange(&engine, &solicit, &eth0(), NOW).await.unwrap();

        assert_eq!(engine.expire_leases(NOW + 200).await, 1);
        assert_eq!(engine.expire_leases(NOW + 43200).await, 1);

        let state = engine.state().lock().await;
        assert_eq!(state.arena.lease_at(IaType::Na, address).unwrap().state, LeaseState::Expired);
        let stored = state.journal.get(&IaKey::new(IaType::Na, 7, &CLIENT)).unwrap();
        assert_eq!(stored.leases[0].state, LeaseState::Expired);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let (config, _guard) = test_config("restart");
        let address;
        {
            let engine = engine(config.clone());
            address = request_address(&engine, &CLIENT, NOW).await;
            engine.save().await.unwrap();
        }

        let journal = LeaseJournal::load(&config.leases_file, Duration::from_secs(5)).await.unwrap();
        let context = Arc::new(ServerContext::builder(config).build().unwrap());
        let engine = Engine::new(context, journal).unwrap();
        let renew = to_server(&engine, MessageType::Renew, &CLIENT, vec![ia_na(7, &[&address.to_string()])]);
        let reply = exchange(&engine, &renew, &eth0(), NOW + 100).await.unwrap();
        assert_eq!(granted(&reply).address, address);
        assert_eq!(reply.ia_na().next().unwrap().status(), None);
    }

    #[tokio::test]
    async fn test_renew_of_declined_address_is_not_bound() {
        let (config, _guard) = test_config("renew_declined");
        let engine = engine(config);
        let address = request_address(&engine, &CLIENT, NOW).await;

        let decline = to_server(&engine, MessageType::Decline, &CLIENT, vec![ia_na(7, &[&address.to_string()])]);
        exchange(&engine, &decline, &eth0(), NOW + 10).await.unwrap();

        let renew = to_server(&engine, MessageType::Renew, &CLIENT, vec![ia_na(7, &[&address.to_string()])]);
        let reply = exchange(&engine, &renew, &eth0(), NOW + 20).await.unwrap();
        let ia = reply.ia_na().next().unwrap();
        assert_eq!(ia.addresses().count(), 0);
        assert_eq!(
            ia.status(),
            Some((StatusCode::NoBinding as u16, "Address not bound to this interface."))
        );

        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_na(7, &[&address.to_string()])]);
        let reply = exchange(&engine, &request, &eth0(), NOW + 30).await.unwrap();
        assert_ne!(granted(&reply).address, address);

        let state = engine.state().lock().await;
        let lease = state.arena.lease_at(IaType::Na, address).unwrap();
        assert_eq!(lease.state, LeaseState::Abandoned);
    }

    #[tokio::test]
    async fn test_renew_over_limit_still_checks_ownership() {
        let (config, _guard) = test_config("renew_limit");
        let engine = engine(config);
        let address = request_address(&engine, &CLIENT, NOW).await;
        let unknown = if address.segments()[7] == 0x1e { "2001:db8::1d" } else { "2001:db8::1e" };

        let renew = to_server(
            &engine,
            MessageType::Renew,
            &CLIENT,
            vec![ia_na(7, &[&address.to_string(), unknown])],
        );
        let reply = exchange(&engine, &renew, &eth0(), NOW + 100).await.unwrap();
        let ia = reply.ia_na().next().unwrap();
        assert_eq!(ia.addresses().count(), 0);
        assert_eq!(ia.status().map(|(code, _)| code), Some(StatusCode::NoBinding as u16));
    }

    #[derive(Default)]
    struct CountingDdns(AtomicUsize);

    impl DdnsUpdater for CountingDdns {
        fn submit(&self, _key: &IaKey, _lease: &SubLease) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn submit_static(&self, _key: &IaKey, _address: Ipv6Addr) {}
    }

    #[tokio::test]
    async fn test_reused_lease_still_gets_ddns_update() {
        let (mut config, _guard) = test_config("reuse_ddns");
        config.options.cache_threshold = Some(25);
        let journal = LeaseJournal::new(&config.leases_file, Duration::from_secs(3600));
        let ddns = Arc::new(CountingDdns::default());
        let context = ServerContext::builder(config)
            .ddns(Arc::clone(&ddns) as Arc<dyn DdnsUpdater>)
            .build()
            .unwrap();
        let engine = Engine::new(Arc::new(context), journal).unwrap();

        let address = request_address(&engine, &CLIENT, NOW).await;
        assert_eq!(ddns.0.load(Ordering::SeqCst), 1);

        let renew = to_server(&engine, MessageType::Renew, &CLIENT, vec![ia_na(7, &[&address.to_string()])]);
        let reply = exchange(&engine, &renew, &eth0(), NOW + 600).await.unwrap();
        assert_eq!(granted(&reply).valid, 43200 - 600);
        assert_eq!(ddns.0.load(Ordering::SeqCst), 2);

        let state = engine.state().lock().await;
        let key = IaKey::new(IaType::Na, 7, &CLIENT);
        let lease = state.arena.lease_at(IaType::Na, address).unwrap();
        assert_eq!(lease.holder.as_ref(), Some(&key));
        assert_eq!(lease.hard_end, NOW + 43200);
        assert_eq!(state.journal.get(&key).unwrap().cltt, NOW);
    }

    #[tokio::test]
    async fn test_rebind_of_foreign_address_gets_zero_lifetimes() {
        let (config, _guard) = test_config("rebind_foreign");
        let engine = engine(config);
        let taken = request_address(&engine, &OTHER, NOW).await;

        let rebind = packet(MessageType::Rebind, &CLIENT, vec![ia_na(7, &[&taken.to_string()])]);
        let reply = exchange(&engine, &rebind, &eth0(), NOW + 10).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Reply);
        let ia = reply.ia_na().next().unwrap();
        let addresses: Vec<_> = ia.addresses().collect();
        assert!(addresses.iter().any(|a| a.address == taken && (a.preferred, a.valid) == (0, 0)));
        assert!(addresses.iter().any(|a| a.address != taken && a.valid == 43200));

        let state = engine.state().lock().await;
        let lease = state.arena.lease_at(IaType::Na, taken).unwrap();
        assert_eq!(lease.holder, Some(IaKey::new(IaType::Na, 7, &OTHER)));
        assert_eq!(lease.state, LeaseState::Active);
    }

    #[tokio::test]
    async fn test_rebind_with_nothing_owned() {
        let (mut config, _guard) = test_config("rebind_nothing");
        config.shared_networks[0].ponds[0].pools = vec![na_pool("2001:db8::10", "2001:db8::10")];
        let engine = engine(config);
        request_address(&engine, &OTHER, NOW).await;

        let rebind = packet(MessageType::Rebind, &CLIENT, vec![ia_na(7, &[])]);
        assert!(exchange(&engine, &rebind, &eth0(), NOW + 10).await.is_none());

        let rebind = packet(MessageType::Rebind, &CLIENT, vec![ia_na(7, &["2001:db8:99::1"])]);
        let reply = exchange(&engine, &rebind, &eth0(), NOW + 10).await.unwrap();
        let ia = reply.ia_na().next().unwrap();
        let echoed: Vec<_> = ia.addresses().collect();
        assert_eq!(echoed.len(), 1);
        assert_eq!(
            (echoed[0].address, echoed[0].preferred, echoed[0].valid),
            ("2001:db8:99::1".parse::<Ipv6Addr>().unwrap(), 0, 0)
        );
        assert!(engine.state().lock().await.repository.lookup(&IaKey::new(IaType::Na, 7, &CLIENT)).is_none());
    }

    fn ia_ta(iaid: u32, addresses: &[Ipv6Addr]) -> Dhcp6Option {
        Dhcp6Option::IaTa(IaTa {
            iaid,
            options: addresses
                .iter()
                .map(|address| {
                    Dhcp6Option::IaAddr(IaAddress {
                        address: *address,
                        preferred: 0,
                        valid: 0,
                        options: vec![],
                    })
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_temporary_addresses_request_and_renew() {
        let (mut config, _guard) = test_config("temporary");
        config.shared_networks[0].ponds[0].pools.push(PoolConfig {
            kind: IaType::Ta,
            range: PoolRange::Cidr("2001:db8:0:0:1::/80".parse().unwrap()),
            prefix_length: None,
        });
        let engine = engine(config);
        let pool: ipnet::Ipv6Net = "2001:db8:0:0:1::/80".parse().unwrap();

        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_ta(9, &[])]);
        let reply = exchange(&engine, &request, &eth0(), NOW).await.unwrap();
        let ia = reply.ia_ta().next().unwrap();
        assert_eq!(ia.iaid, 9);
        let temporary = ia.addresses().next().unwrap().clone();
        assert!(pool.contains(&temporary.address));
        assert_eq!(temporary.valid, 43200);
        {
            let state = engine.state().lock().await;
            let key = IaKey::new(IaType::Ta, 9, &CLIENT);
            assert_eq!(state.repository.lookup(&key).unwrap().leases.len(), 1);
            assert!(state.journal.get(&key).is_some());
        }

        let renew = to_server(&engine, MessageType::Renew, &CLIENT, vec![ia_ta(9, &[temporary.address])]);
        let reply = exchange(&engine, &renew, &eth0(), NOW + 100).await.unwrap();
        let renewed: Vec<_> = reply.ia_ta().next().unwrap().addresses().cloned().collect();
        assert_eq!(renewed.len(), 1);
        assert_eq!((renewed[0].address, renewed[0].valid), (temporary.address, 43200));

        let state = engine.state().lock().await;
        let lease = state.arena.lease_at(IaType::Ta, temporary.address).unwrap();
        assert_eq!(lease.hard_end, NOW + 100 + 43200);
    }

    #[tokio::test]
    async fn test_rapid_commit_solicit_commits_lease() {
        let (mut config, _guard) = test_config("rapid_commit");
        config.options.rapid_commit = Some(true);
        let engine = engine(config);

        let solicit = packet(
            MessageType::Solicit,
            &CLIENT,
            vec![Dhcp6Option::RapidCommit, ia_na(7, &[])],
        );
        let reply = exchange(&engine, &solicit, &eth0(), NOW).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Reply);
        assert!(reply.options.contains(&Dhcp6Option::RapidCommit));
        let address = granted(&reply).address;

        let state = engine.state().lock().await;
        let key = IaKey::new(IaType::Na, 7, &CLIENT);
        assert_eq!(state.repository.lookup(&key).unwrap().cltt, NOW);
        let lease = state.arena.lease_at(IaType::Na, address).unwrap();
        assert!(lease.committed);
        assert_eq!(lease.hard_end, NOW + 43200);
        assert!(state.journal.get(&key).is_some());
    }

    #[tokio::test]
    async fn test_roaming_client_releases_old_lease() {
        let (mut config, _guard) = test_config("roam");
        config.release_on_roam = true;
        config.interfaces.push(InterfaceConfig {
            name: "eth1".to_string(),
            index: None,
            shared_network: "wan".to_string(),
        });
        config.shared_networks.push(SharedNetworkConfig {
            name: "wan".to_string(),
            subnets: vec![SubnetConfig {
                prefix: "2001:db8:2::/64".parse().unwrap(),
                options: Default::default(),
            }],
            ponds: vec![PondConfig {
                pools: vec![na_pool("2001:db8:2::10", "2001:db8:2::1f")],
                ..Default::default()
            }],
            options: Default::default(),
        });
        let engine = engine(config);
        let home = request_address(&engine, &CLIENT, NOW).await;

        let eth1 = ReceiveInfo {
            interface: Some("eth1".to_string()),
            unicast: false,
        };
        let request = to_server(&engine, MessageType::Request, &CLIENT, vec![ia_na(7, &[])]);
        let reply = exchange(&engine, &request, &eth1, NOW + 50).await.unwrap();
        let roamed = granted(&reply).address;
        assert!("2001:db8:2::/64".parse::<ipnet::Ipv6Net>().unwrap().contains(&roamed));

        let state = engine.state().lock().await;
        assert_eq!(state.arena.lease_at(IaType::Na, home).unwrap().state, LeaseState::Released);
        assert_eq!(state.arena.lease_at(IaType::Na, roamed).unwrap().state, LeaseState::Active);
        let record = state.repository.lookup(&IaKey::new(IaType::Na, 7, &CLIENT)).unwrap();
        assert_eq!(record.leases.len(), 1);
    }
}
