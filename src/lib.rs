//! # dhcp6lease
//!
//! A DHCPv6 server library implementing RFC 3315 (DHCPv6) and RFC 3633
//! (prefix delegation).
//!
//! ## Features
//!
//! - Client exchanges: SOLICIT, ADVERTISE, REQUEST, RENEW, REBIND, REPLY,
//!   CONFIRM, DECLINE, RELEASE, INFORMATION-REQUEST
//! - Non-temporary (IA_NA), temporary (IA_TA) and delegated prefix (IA_PD)
//!   leases from hash-addressed pools
//! - Shared networks with subnets, pools grouped into ponds with permit lists
//! - Host reservations with fixed addresses and prefixes
//! - Relay agent support, nested to 32 hops
//! - Lease reuse within a cache threshold
//! - Lease journal persisted across restarts
//! - Rate limiting per client DUID
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcp6lease::{Config, Dhcp6Server};
//!
//! #[tokio::main]
//! async fn main() -> dhcp6lease::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = Dhcp6Server::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Server configuration (shared networks, pools, hosts, options)
//! - [`ServerContext`] - Immutable topology, scope evaluator and DDNS hook
//! - [`Engine`] - Message dispatch over the shared allocation state
//! - [`PoolArena`] - Pools, ponds and the leases they hold
//! - [`IaRepository`] - Active identity associations
//! - [`LeaseJournal`] - Persistent copy of the IA state
//! - [`Dhcp6Server`] - UDP listener on port 547
//! - [`Message`] - DHCPv6 client and relay message codec

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod ia;
pub mod lease;
pub mod network;
pub mod options;
pub mod packet;
pub mod pool;
pub mod reply;
pub mod reuse;
pub mod scope;
pub mod server;
pub mod validate;

pub use config::Config;
pub use context::{DdnsUpdater, LoggingDdns, ServerContext};
pub use engine::{Engine, EngineState};
pub use error::{Error, Result};
pub use ia::{IaKey, IaRepository, IaType};
pub use lease::{LeaseJournal, StoredIa, StoredLease};
pub use network::Topology;
pub use options::{Dhcp6Option, MessageType, StatusCode};
pub use packet::{Dhcp6Packet, Message, ReceiveInfo, RelayPacket};
pub use pool::{LeaseState, PoolArena, SubLease};
pub use scope::{ConfigEvaluator, ScopeEvaluator};
pub use server::Dhcp6Server;
