//! Immutable server-wide context.
//!
//! Everything a request needs that never changes after startup: the
//! configuration, the network topology, the server DUID and the two
//! collaborators the engine calls out to (the scope evaluator and the DNS
//! updater). A [`ServerContext`] is assembled once by
//! [`ServerContextBuilder`] and then shared behind an `Arc`.

use std::net::Ipv6Addr;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, format_duid};
use crate::error::{Error, Result};
use crate::ia::IaKey;
use crate::network::Topology;
use crate::pool::SubLease;
use crate::scope::{ConfigEvaluator, ScopeEvaluator};

/// Submits DNS updates for leases handed out by the server.
pub trait DdnsUpdater: Send + Sync {
    /// Starts an update for a dynamic lease. Returns true while the update
    /// is still in flight, which keeps the lease from being reused.
    fn submit(&self, key: &IaKey, lease: &SubLease) -> bool;

    /// Starts an update for a fixed host address.
    fn submit_static(&self, key: &IaKey, address: Ipv6Addr);
}

/// [`DdnsUpdater`] that only records the request in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDdns;

impl DdnsUpdater for LoggingDdns {
    fn submit(&self, key: &IaKey, lease: &SubLease) -> bool {
        debug!("DDNS update for {} ({})", lease.describe(), key);
        false
    }

    fn submit_static(&self, key: &IaKey, address: Ipv6Addr) {
        debug!("DDNS update for static {} ({})", address, key);
    }
}

pub struct ServerContext {
    pub config: Config,
    pub topology: Topology,
    pub server_duid: Vec<u8>,
    pub evaluator: Arc<dyn ScopeEvaluator>,
    pub ddns: Arc<dyn DdnsUpdater>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("server_duid", &format_duid(&self.server_duid))
            .field("networks", &self.topology.networks.len())
            .finish()
    }
}

impl ServerContext {
    pub fn builder(config: Config) -> ServerContextBuilder {
        ServerContextBuilder {
            config,
            server_duid: None,
            evaluator: None,
            ddns: None,
        }
    }
}

/// Collects the pieces of a [`ServerContext`] before it is frozen.
pub struct ServerContextBuilder {
    config: Config,
    server_duid: Option<Vec<u8>>,
    evaluator: Option<Arc<dyn ScopeEvaluator>>,
    ddns: Option<Arc<dyn DdnsUpdater>>,
}

impl ServerContextBuilder {
    /// Overrides the DUID from the configuration.
    pub fn server_duid(mut self, duid: Vec<u8>) -> Self {
        self.server_duid = Some(duid);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ScopeEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn ddns(mut self, ddns: Arc<dyn DdnsUpdater>) -> Self {
        self.ddns = Some(ddns);
        self
    }

    /// Validates the configuration and freezes the context.
    ///
    /// Without an explicit evaluator the configuration's own scope options
    /// are used; without a DNS updater, updates are only logged.
    pub fn build(self) -> Result<ServerContext> {
        self.config.validate()?;

        let server_duid = match self.server_duid {
            Some(duid) if duid.is_empty() => {
                return Err(Error::InvalidConfig("server DUID must not be empty".to_string()));
            }
            Some(duid) => duid,
            None => self.config.server_duid_bytes()?,
        };

        let topology = Topology::from_config(&self.config)?;
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(ConfigEvaluator::new(&self.config)));
        let ddns = self.ddns.unwrap_or_else(|| Arc::new(LoggingDdns));

        Ok(ServerContext {
            config: self.config,
            topology,
            server_duid,
            evaluator,
            ddns,
        })
    }
}
