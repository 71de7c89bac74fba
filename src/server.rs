//! UDP listener: multicast and unicast sockets, rate limiting and the lease maintenance timer.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Config, format_duid};
use crate::context::ServerContext;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::lease::LeaseJournal;
use crate::packet::{MAX_MESSAGE_SIZE, Message, ReceiveInfo};

/// All_DHCP_Relay_Agents_and_Servers (RFC 3315 §5.1).
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// All_DHCP_Servers (RFC 3315 §5.1).
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 1, 3);

const RATE_LIMIT_WINDOW_SECS: u64 = 1;
const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 1000;

pub struct Dhcp6Server {
    engine: Arc<Engine>,
    handler: Arc<PacketHandler>,
    /// The wildcard multicast listener first, then one socket per server
    /// unicast address.
    sockets: Vec<(Arc<UdpSocket>, bool)>,
}

impl Dhcp6Server {
    pub async fn new(config: Config) -> Result<Self> {
        let interval = Duration::from_millis(config.lease_commit_interval_ms);
        let journal = LeaseJournal::load(&config.leases_file, interval).await?;
        let context = Arc::new(ServerContext::builder(config).build()?);
        let engine = Arc::new(Engine::new(Arc::clone(&context), journal)?);
        let config = &context.config;

        let mut sockets = vec![(Arc::new(Self::create_socket(config, None)?), false)];
        for address in unicast_addresses(config) {
            sockets.push((Arc::new(Self::create_socket(config, Some(address))?), true));
        }

        info!(
            "DHCPv6 server starting on port {} with DUID {}",
            config.listen_port,
            format_duid(&context.server_duid)
        );
        for network in &context.topology.networks {
            info!("Shared network {}", network.name);
        }

        Ok(Self {
            handler: Arc::new(PacketHandler::new(Arc::clone(&engine), config)),
            engine,
            sockets,
        })
    }

    /// Binds the wildcard listener, which joins the DHCPv6 multicast groups
    /// on every configured interface, or a socket on one unicast address.
    fn create_socket(config: &Config, unicast: Option<Ipv6Addr>) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_only_v6(true)
            .map_err(|error| Error::Socket(format!("Failed to set IPV6_V6ONLY: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV6::new(
            unicast.unwrap_or(Ipv6Addr::UNSPECIFIED),
            config.listen_port,
            0,
            0,
        );
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        if unicast.is_none() {
            let indexes: Vec<u32> = config.interfaces.iter().filter_map(|i| i.index).collect();
            if indexes.is_empty() {
                warn!("No interface indexes configured, joining multicast groups on the default interface");
            }
            for index in if indexes.is_empty() { vec![0] } else { indexes } {
                for group in [ALL_DHCP_RELAY_AGENTS_AND_SERVERS, ALL_DHCP_SERVERS] {
                    socket.join_multicast_v6(&group, index).map_err(|error| {
                        Error::Socket(format!(
                            "Failed to join {} on interface {}: {}",
                            group, index, error
                        ))
                    })?;
                }
            }
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    pub async fn run(&self) -> Result<()> {
        let mut tasks = JoinSet::new();

        for (socket, unicast) in &self.sockets {
            let handler = Arc::clone(&self.handler);
            let socket = Arc::clone(socket);
            let unicast = *unicast;
            tasks.spawn(async move { receive_loop(handler, socket, unicast).await });
        }

        let engine = Arc::clone(&self.engine);
        tasks.spawn(async move { maintenance_loop(engine).await });

        info!("DHCPv6 server ready and listening");

        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                error!("Server task stopped: {}", error);
            }
        }
        Ok(())
    }

    pub async fn save_leases(&self) -> Result<()> {
        self.engine.save().await
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

/// Addresses the server tells clients to unicast to.
fn unicast_addresses(config: &Config) -> Vec<Ipv6Addr> {
    let mut addresses: Vec<Ipv6Addr> = std::iter::once(&config.options)
        .chain(config.shared_networks.iter().map(|network| &network.options))
        .filter_map(|options| options.unicast)
        .collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

async fn receive_loop(handler: Arc<PacketHandler>, socket: Arc<UdpSocket>, unicast: bool) {
    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((size, source)) => {
                let data = buffer[..size].to_vec();
                let handler = Arc::clone(&handler);
                let socket = Arc::clone(&socket);

                tokio::spawn(async move {
                    if let Some(reply) = handler.handle_datagram(&data, source, unicast).await {
                        if let Err(error) = socket.send_to(&reply, source).await {
                            warn!("Error sending reply to {}: {}", source, error);
                        }
                    }
                });
            }
            Err(error) => {
                error!("Error receiving packet: {}", error);
            }
        }
    }
}

/// Runs the expiry sweep and flushes the lease journal on their own
/// intervals.
async fn maintenance_loop(engine: Arc<Engine>) {
    let config = &engine.context().config;
    let mut expiry = tokio::time::interval(Duration::from_secs(config.expiry_interval_seconds.max(1)));
    let mut commit = tokio::time::interval(Duration::from_millis(config.lease_commit_interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = expiry.tick() => {
                let count = engine.expire_leases(chrono::Utc::now().timestamp()).await;
                if count > 0 {
                    debug!("Expiry sweep ended {} lease(s)", count);
                }
            }
            _ = commit.tick() => {
                if let Err(error) = engine.commit_timed().await {
                    error!("Failed to save lease journal: {}", error);
                }
            }
        }
    }
}

struct PacketHandler {
    engine: Arc<Engine>,
    /// Interface index to configured interface name.
    interfaces: HashMap<u32, String>,
    /// Used when the source carries no usable scope id.
    default_interface: Option<String>,
    rate_limit: usize,
    rate_limiter: Mutex<HashMap<Vec<u8>, Vec<Instant>>>,
}

impl PacketHandler {
    fn new(engine: Arc<Engine>, config: &Config) -> Self {
        let interfaces = config
            .interfaces
            .iter()
            .filter_map(|interface| interface.index.map(|index| (index, interface.name.clone())))
            .collect();
        let default_interface = match config.interfaces.as_slice() {
            [only] => Some(only.name.clone()),
            _ => None,
        };

        Self {
            engine,
            interfaces,
            default_interface,
            rate_limit: config.rate_limit_per_second as usize,
            rate_limiter: Mutex::new(HashMap::new()),
        }
    }

    async fn is_rate_limited(&self, client: &[u8]) -> bool {
        let mut limiter = self.rate_limiter.lock().await;
        let now = Instant::now();
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);

        if limiter.len() > RATE_LIMIT_CLEANUP_THRESHOLD {
            limiter.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < window);
                !timestamps.is_empty()
            });
        }

        let timestamps = limiter.entry(client.to_vec()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < window);

        if timestamps.len() >= self.rate_limit {
            return true;
        }

        timestamps.push(now);
        false
    }

    /// Maps the arrival of a datagram onto the receive metadata the engine
    /// resolves shared networks with.
    fn receive_info(&self, source: SocketAddr, unicast: bool) -> ReceiveInfo {
        let scope_id = match source {
            SocketAddr::V6(source) => source.scope_id(),
            SocketAddr::V4(_) => 0,
        };
        let interface = self
            .interfaces
            .get(&scope_id)
            .cloned()
            .or_else(|| self.default_interface.clone());
        ReceiveInfo { interface, unicast }
    }

    async fn handle_datagram(&self, data: &[u8], source: SocketAddr, unicast: bool) -> Option<Vec<u8>> {
        let client = client_key(data, source);
        if self.is_rate_limited(&client).await {
            warn!("Rate limited: {} from {}", format_duid(&client), source);
            return None;
        }

        let info = self.receive_info(source, unicast);
        debug!(
            "{} bytes from {} on {}",
            data.len(),
            source,
            info.interface.as_deref().unwrap_or("unknown interface")
        );
        self.engine
            .handle(data, &info, chrono::Utc::now().timestamp())
            .await
    }
}

/// The client DUID of the innermost message, or the source address for
/// messages that do not parse or carry none.
fn client_key(data: &[u8], source: SocketAddr) -> Vec<u8> {
    let mut message = Message::parse(data).ok();
    while let Some(Message::Relay(relay)) = &message {
        message = relay.inner_message().and_then(|inner| inner.ok());
    }
    match message {
        Some(Message::Client(packet)) => match packet.client_id() {
            Some(duid) => duid.to_vec(),
            None => source_key(source),
        },
        _ => source_key(source),
    }
}

fn source_key(source: SocketAddr) -> Vec<u8> {
    match source {
        SocketAddr::V6(source) => source.ip().octets().to_vec(),
        SocketAddr::V4(source) => source.ip().octets().to_vec(),
    }
}
