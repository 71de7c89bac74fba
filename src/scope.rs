//! Scoped configuration evaluation.
//!
//! Option values and hooks can be set at several nested scopes. A lookup
//! takes the chain of scopes that apply to one lease, ordered from the
//! outermost (global) to the innermost (host), and the innermost scope that
//! sets a value wins.
//!
//! The reply builder only talks to the [`ScopeEvaluator`] trait, so the
//! allocation logic never walks configuration structures itself.

use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use tracing::info;

use crate::config::{Config, ScopeOptions};

/// A reference to one configuration scope. Indices are flat across the
/// whole configuration, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeRef {
    Global,
    SharedNetwork(usize),
    Subnet(usize),
    Pond(usize),
    Class(usize),
    Host(usize),
}

/// Names of the values the engine asks the evaluator for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionName {
    DefaultLeaseTime,
    PreferredLifetime,
    RenewalTime,
    RebindingTime,
    SetTeeTimes,
    CacheThreshold,
    LimitAddrsPerIa,
    LimitPrefsPerIa,
    LogThresholdHigh,
    LogThresholdLow,
    DdnsUpdates,
    UpdateStaticLeases,
    Unicast,
    RapidCommit,
    Preference,
    DnsServers,
    DomainSearch,
    InformationRefreshTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Number(u32),
    Flag(bool),
    Address(Ipv6Addr),
    Addresses(Vec<Ipv6Addr>),
    Names(Vec<String>),
}

impl OptionValue {
    pub fn as_number(&self) -> Option<u32> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(value) => Some(*value),
            _ => None,
        }
    }
}

/// Which deferred hook list to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Commit,
    Expiry,
    Release,
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Commit => "on-commit",
            Self::Expiry => "on-expiry",
            Self::Release => "on-release",
        };
        write!(f, "{}", name)
    }
}

/// Deferred actions attached to a lease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSet {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_commit: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_expiry: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_release: Vec<String>,
}

impl HookSet {
    pub fn is_empty(&self) -> bool {
        self.on_commit.is_empty() && self.on_expiry.is_empty() && self.on_release.is_empty()
    }

    fn list(&self, kind: HookKind) -> &[String] {
        match kind {
            HookKind::Commit => &self.on_commit,
            HookKind::Expiry => &self.on_expiry,
            HookKind::Release => &self.on_release,
        }
    }

    /// Runs every hook of `kind` for the lease described by `subject`.
    pub fn run(&self, kind: HookKind, subject: &str) {
        for statement in self.list(kind) {
            info!("{} {}: {}", kind, subject, statement);
        }
    }

    /// Runs and clears the on-commit hooks, which fire once per commit.
    pub fn run_commit(&mut self, subject: &str) {
        self.run(HookKind::Commit, subject);
        self.on_commit.clear();
    }
}

/// Evaluates configuration values and hooks over a chain of scopes.
pub trait ScopeEvaluator: Send + Sync {
    /// Returns the innermost value set for `name` along `scopes`.
    fn evaluate(&self, name: OptionName, scopes: &[ScopeRef]) -> Option<OptionValue>;

    /// Collects the hooks of every scope in `scopes`, outermost first.
    /// A scope appearing twice contributes once.
    fn collect_hooks(&self, scopes: &[ScopeRef]) -> HookSet;

    fn number(&self, name: OptionName, scopes: &[ScopeRef]) -> Option<u32> {
        self.evaluate(name, scopes).and_then(|value| value.as_number())
    }

    fn flag(&self, name: OptionName, scopes: &[ScopeRef]) -> Option<bool> {
        self.evaluate(name, scopes).and_then(|value| value.as_flag())
    }
}

/// [`ScopeEvaluator`] backed by the JSON configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigEvaluator {
    global: ScopeOptions,
    networks: Vec<ScopeOptions>,
    subnets: Vec<ScopeOptions>,
    ponds: Vec<ScopeOptions>,
    classes: Vec<ScopeOptions>,
    hosts: Vec<ScopeOptions>,
}

impl ConfigEvaluator {
    pub fn new(config: &Config) -> Self {
        let networks = &config.shared_networks;
        Self {
            global: config.options.clone(),
            networks: networks.iter().map(|n| n.options.clone()).collect(),
            subnets: networks
                .iter()
                .flat_map(|n| n.subnets.iter().map(|s| s.options.clone()))
                .collect(),
            ponds: networks
                .iter()
                .flat_map(|n| n.ponds.iter().map(|p| p.options.clone()))
                .collect(),
            classes: config.classes.iter().map(|c| c.options.clone()).collect(),
            hosts: config.hosts.iter().map(|h| h.options.clone()).collect(),
        }
    }

    fn options(&self, scope: ScopeRef) -> Option<&ScopeOptions> {
        match scope {
            ScopeRef::Global => Some(&self.global),
            ScopeRef::SharedNetwork(index) => self.networks.get(index),
            ScopeRef::Subnet(index) => self.subnets.get(index),
            ScopeRef::Pond(index) => self.ponds.get(index),
            ScopeRef::Class(index) => self.classes.get(index),
            ScopeRef::Host(index) => self.hosts.get(index),
        }
    }
}

fn lookup(options: &ScopeOptions, name: OptionName) -> Option<OptionValue> {
    use OptionValue::{Address, Addresses, Flag, Names, Number};

    match name {
        OptionName::DefaultLeaseTime => options.default_lease_time.map(Number),
        OptionName::PreferredLifetime => options.preferred_lifetime.map(Number),
        OptionName::RenewalTime => options.renewal_time.map(Number),
        OptionName::RebindingTime => options.rebinding_time.map(Number),
        OptionName::SetTeeTimes => options.set_tee_times.map(Flag),
        OptionName::CacheThreshold => options.cache_threshold.map(|v| Number(v.into())),
        OptionName::LimitAddrsPerIa => options.limit_addrs_per_ia.map(Number),
        OptionName::LimitPrefsPerIa => options.limit_prefs_per_ia.map(Number),
        OptionName::LogThresholdHigh => options.log_threshold_high.map(|v| Number(v.into())),
        OptionName::LogThresholdLow => options.log_threshold_low.map(|v| Number(v.into())),
        OptionName::DdnsUpdates => options.ddns_updates.map(Flag),
        OptionName::UpdateStaticLeases => options.update_static_leases.map(Flag),
        OptionName::Unicast => options.unicast.map(Address),
        OptionName::RapidCommit => options.rapid_commit.map(Flag),
        OptionName::Preference => options.preference.map(|v| Number(v.into())),
        OptionName::DnsServers => options.dns_servers.clone().map(Addresses),
        OptionName::DomainSearch => options.domain_search.clone().map(Names),
        OptionName::InformationRefreshTime => options.information_refresh_time.map(Number),
    }
}

impl ScopeEvaluator for ConfigEvaluator {
    fn evaluate(&self, name: OptionName, scopes: &[ScopeRef]) -> Option<OptionValue> {
        scopes
            .iter()
            .rev()
            .filter_map(|scope| self.options(*scope))
            .find_map(|options| lookup(options, name))
    }

    fn collect_hooks(&self, scopes: &[ScopeRef]) -> HookSet {
        let mut hooks = HookSet::default();
        let mut visited: Vec<ScopeRef> = Vec::with_capacity(scopes.len());

        for scope in scopes {
            if visited.contains(scope) {
                continue;
            }
            visited.push(*scope);

            if let Some(options) = self.options(*scope) {
                hooks.on_commit.extend(options.on_commit.iter().cloned());
                hooks.on_expiry.extend(options.on_expiry.iter().cloned());
                hooks.on_release.extend(options.on_release.iter().cloned());
            }
        }

        hooks
    }
}
