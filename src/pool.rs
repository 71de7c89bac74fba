//! Lease pools, ponds and the sub-lease arena.
//!
//! A pond groups the pools of one shared network that share a permit and
//! prohibit list. A pool is one aligned CIDR block handing out either single
//! addresses (IA_NA, IA_TA) or delegated prefixes of a fixed length (IA_PD).
//!
//! Every sub-lease lives in the [`PoolArena`] and is referred to by its
//! [`LeaseId`]. Each pool keeps an index from address to lease id, and that
//! index is the single source of truth for whether an address is taken.
//!
//! # Allocation
//!
//! Candidates are derived by hashing the IAID and DUID of the requesting IA
//! into the pool's host bits, so a client keeps getting the same address
//! while it is free. A collision appends the candidate to the hash input and
//! tries again, up to a configured number of attempts per pool.
//!
//! Newly allocated leases are soft bindings: they hold their address for
//! [`SOFT_BINDING_SECONDS`] until a Reply commits them with
//! [`PoolArena::renew_lease`].

use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv6Addr;
use tracing::{debug, info, warn};

use crate::config::{Config, Permit, PrefixLengthMode};
use crate::error::{Error, Result};
use crate::ia::{IaKey, IaType};
use crate::scope::{HookKind, HookSet};

/// How long an uncommitted lease holds its address.
pub const SOFT_BINDING_SECONDS: i64 = 120;

/// Largest representable lease end, used for infinite and abandoned leases.
pub const MAX_TIME: i64 = 0x7fff_ffff;

/// Ponds with at least this many host bits are too large to count exactly.
const JUMBO_BITS: u8 = 64;

/// Reserved subnet anycast IIDs (RFC 2526), less the final seven bits.
const RESERVED_ANYCAST_PREFIX: [u8; 7] = [0xfd, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub u64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub usize);

/// Index of a pond. Ponds are numbered across all shared networks in
/// declaration order, matching [`ScopeRef::Pond`](crate::scope::ScopeRef).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PondId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Active,
    Expired,
    Released,
    Abandoned,
}

impl LeaseState {
    /// Active and abandoned leases keep their address out of circulation.
    pub fn occupies(self) -> bool {
        matches!(self, Self::Active | Self::Abandoned)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Released => "released",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{}", name)
    }
}

/// One address or prefix bound (softly or durably) to an IA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubLease {
    pub id: LeaseId,
    pub address: Ipv6Addr,
    /// Delegated prefix length; zero for addresses.
    pub prefix_len: u8,
    pub pool: PoolId,
    /// The IA currently holding the lease.
    pub holder: Option<IaKey>,
    pub state: LeaseState,
    pub preferred: u32,
    pub valid: u32,
    /// Unix seconds at which the current binding ends.
    pub hard_end: i64,
    /// Projected end of a binding being built, zero when none.
    pub soft_end: i64,
    /// Set once the lease has been committed by a Reply.
    pub committed: bool,
    pub hooks: HookSet,
    pub ddns_pending: bool,
}

impl SubLease {
    pub fn is_prefix(&self) -> bool {
        self.prefix_len != 0
    }

    /// `2001:db8::1` for addresses, `2001:db8:1::/56` for prefixes.
    pub fn describe(&self) -> String {
        if self.is_prefix() {
            format!("{}/{}", self.address, self.prefix_len)
        } else {
            self.address.to_string()
        }
    }

    /// Whether this lease should be preferred over `other` when choosing
    /// which of an IA's old leases to hand back.
    ///
    /// Active beats expired beats abandoned. Among active and expired leases
    /// the later end wins; among abandoned leases the one abandoned longest
    /// wins.
    pub fn better_than(&self, other: &SubLease) -> bool {
        fn rank(state: LeaseState) -> u8 {
            match state {
                LeaseState::Active => 3,
                LeaseState::Expired | LeaseState::Released => 2,
                LeaseState::Abandoned => 1,
            }
        }

        let (mine, theirs) = (rank(self.state), rank(other.state));
        if mine != theirs {
            return mine > theirs;
        }
        match self.state {
            LeaseState::Active => self.hard_end > other.hard_end,
            LeaseState::Expired | LeaseState::Released => {
                (self.hard_end, self.soft_end) > (other.hard_end, other.soft_end)
            }
            LeaseState::Abandoned => self.hard_end < other.hard_end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub kind: IaType,
    pub net: Ipv6Net,
    /// Length of each unit handed out: 128 for addresses, the delegated
    /// length for prefixes.
    pub unit_len: u8,
    pub pond: PondId,
    pub network: usize,
    leases: HashMap<Ipv6Addr, LeaseId>,
    occupied: u64,
}

impl Pool {
    /// Number of host bits, i.e. log2 of the pool's capacity.
    pub fn bits(&self) -> u8 {
        self.unit_len - self.net.prefix_len()
    }

    /// Capacity in units, or `None` when it does not fit in a `u64`.
    pub fn capacity(&self) -> Option<u64> {
        1u64.checked_shl(u32::from(self.bits()))
    }

    pub fn is_full(&self) -> bool {
        self.capacity().is_some_and(|capacity| self.occupied >= capacity)
    }

    /// Whether `address/len` is a unit of this pool.
    pub fn contains(&self, address: Ipv6Addr, len: u8) -> bool {
        len == self.unit_len && self.net.contains(&address) && mask(address, len) == address
    }
}

#[derive(Debug, Clone)]
pub struct Pond {
    pub network: usize,
    pub permit: Vec<Permit>,
    pub prohibit: Vec<Permit>,
    pub use_eui64: bool,
    pub pools: Vec<PoolId>,
    pub last_pool: usize,
    pub total: u64,
    pub jumbo: bool,
    /// Occupying leases, abandoned ones included.
    pub active: u64,
    pub abandoned: u64,
    pub logged: bool,
    pub low_threshold: u64,
}

impl Pond {
    pub fn permits(&self, client: &ClientIdentity<'_>) -> bool {
        if self.prohibit.iter().any(|permit| client.matches(permit)) {
            return false;
        }
        self.permit.is_empty() || self.permit.iter().any(|permit| client.matches(permit))
    }
}

/// What pond permit lists are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity<'a> {
    pub duid: &'a [u8],
    pub classes: Vec<&'a str>,
    /// Set when a host reservation matched the client.
    pub known: bool,
}

impl ClientIdentity<'_> {
    pub fn matches(&self, permit: &Permit) -> bool {
        match permit {
            Permit::KnownClients => self.known,
            Permit::UnknownClients => !self.known,
            Permit::AllClients => true,
            Permit::Class(name) => self.classes.iter().any(|class| class == name),
        }
    }
}

/// Counts logged when a shared network runs out of space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub total: u64,
    pub active: u64,
    pub abandoned: u64,
    pub jumbo: bool,
}

impl std::fmt::Display for PoolCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.jumbo {
            write!(f, "total: > 2^64")?;
        } else {
            write!(f, "total: {}", self.total)?;
        }
        write!(f, ", active: {}, abandoned: {}", self.active, self.abandoned)
    }
}

/// Utilization threshold crossings reported by
/// [`PoolArena::check_pool_threshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdEvent {
    Exceeded { used: u64, total: u64 },
    Reset { used: u64, total: u64 },
}

/// A lease touched by [`PoolArena::expire_leases`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiration {
    pub lease: LeaseId,
    pub holder: Option<IaKey>,
    /// The lease was an uncommitted soft binding and no longer exists.
    pub dropped: bool,
}

enum Slot {
    Free,
    Reclaim(LeaseId),
    Own(LeaseId),
    Taken,
}

#[derive(Debug)]
pub struct PoolArena {
    pools: Vec<Pool>,
    ponds: Vec<Pond>,
    leases: HashMap<LeaseId, SubLease>,
    next_id: u64,
    history: [u8; 8],
}

impl PoolArena {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut arena = PoolArena {
            pools: Vec::new(),
            ponds: Vec::new(),
            leases: HashMap::new(),
            next_id: 1,
            history: rand::random(),
        };

        for (network, shared) in config.shared_networks.iter().enumerate() {
            for pond_config in &shared.ponds {
                let pond_id = PondId(arena.ponds.len());
                let mut pond = Pond {
                    network,
                    permit: pond_config.permit.clone(),
                    prohibit: pond_config.prohibit.clone(),
                    use_eui64: pond_config.use_eui64,
                    pools: Vec::new(),
                    last_pool: 0,
                    total: 0,
                    jumbo: false,
                    active: 0,
                    abandoned: 0,
                    logged: false,
                    low_threshold: 0,
                };

                for pool_config in &pond_config.pools {
                    let unit_len = match pool_config.kind {
                        IaType::Pd => pool_config.prefix_length.ok_or_else(|| {
                            Error::InvalidConfig(format!(
                                "prefix pool in {} has no prefix length",
                                shared.name
                            ))
                        })?,
                        IaType::Na | IaType::Ta => 128,
                    };

                    for net in pool_config.range.to_cidrs() {
                        if unit_len < net.prefix_len() || unit_len > 128 {
                            return Err(Error::InvalidConfig(format!(
                                "pool {} in {} cannot hand out /{} units",
                                net, shared.name, unit_len
                            )));
                        }
                        let pool = Pool {
                            kind: pool_config.kind,
                            net,
                            unit_len,
                            pond: pond_id,
                            network,
                            leases: HashMap::new(),
                            occupied: 0,
                        };
                        match pool.capacity() {
                            Some(capacity) if pool.bits() < JUMBO_BITS => {
                                pond.total = pond.total.saturating_add(capacity);
                            }
                            _ => pond.jumbo = true,
                        }
                        pond.pools.push(PoolId(arena.pools.len()));
                        arena.pools.push(pool);
                    }
                }

                arena.ponds.push(pond);
            }
        }

        Ok(arena)
    }

    pub fn pool(&self, id: PoolId) -> &Pool {
        &self.pools[id.0]
    }

    pub fn pond(&self, id: PondId) -> &Pond {
        &self.ponds[id.0]
    }

    pub fn pools(&self) -> impl Iterator<Item = (PoolId, &Pool)> {
        self.pools.iter().enumerate().map(|(i, pool)| (PoolId(i), pool))
    }

    pub fn lease(&self, id: LeaseId) -> Option<&SubLease> {
        self.leases.get(&id)
    }

    pub fn lease_mut(&mut self, id: LeaseId) -> Option<&mut SubLease> {
        self.leases.get_mut(&id)
    }

    /// All sub-leases, ordered by id.
    pub fn leases(&self) -> Vec<&SubLease> {
        let mut leases: Vec<&SubLease> = self.leases.values().collect();
        leases.sort_by_key(|lease| lease.id);
        leases
    }

    /// The lease currently indexed at `address` in any pool of `kind`.
    pub fn lease_at(&self, kind: IaType, address: Ipv6Addr) -> Option<&SubLease> {
        self.pools
            .iter()
            .filter(|pool| pool.kind == kind)
            .find_map(|pool| pool.leases.get(&address))
            .and_then(|id| self.leases.get(id))
    }

    /// A lease is usable while its pool still indexes it.
    pub fn is_usable(&self, id: LeaseId) -> bool {
        self.leases
            .get(&id)
            .is_some_and(|lease| self.pools[lease.pool.0].leases.get(&lease.address) == Some(&id))
    }

    /// Ponds of `network` whose permit lists admit `client`, in order.
    pub fn eligible_ponds(&self, network: usize, client: &ClientIdentity<'_>) -> Vec<PondId> {
        self.ponds
            .iter()
            .enumerate()
            .filter(|(_, pond)| pond.network == network && pond.permits(client))
            .map(|(index, _)| PondId(index))
            .collect()
    }

    /// Whether a dynamic lease may still be handed back to `client`: its
    /// pond must admit the client, and an EUI-64 pond only keeps the
    /// address derived from the client's DUID.
    pub fn lease_permitted(&self, lease: &SubLease, client: &ClientIdentity<'_>) -> bool {
        let pool = &self.pools[lease.pool.0];
        let pond = &self.ponds[pool.pond.0];
        if !pond.permits(client) {
            return false;
        }
        !pond.use_eui64 || eui64_address(pool.net, client.duid) == Some(lease.address)
    }

    pub fn counts(&self, network: usize, kind: IaType) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for pond in self.ponds.iter().filter(|pond| pond.network == network) {
            if !pond.pools.iter().any(|id| self.pools[id.0].kind == kind) {
                continue;
            }
            counts.total = counts.total.saturating_add(pond.total);
            counts.active += pond.active;
            counts.abandoned += pond.abandoned;
            counts.jumbo |= pond.jumbo;
        }
        counts
    }

    /// Picks a new address for an IA_NA or IA_TA.
    ///
    /// Ponds are tried in order, and pools within a pond starting from the
    /// one that last succeeded. A pool that needed more than one attempt
    /// hands the starting position on to the next pool.
    pub fn allocate_address(
        &mut self,
        network: usize,
        key: &IaKey,
        client: &ClientIdentity<'_>,
        attempts: u32,
        now: i64,
    ) -> Result<LeaseId> {
        let kind = key.ia_type;

        for pond_id in self.eligible_ponds(network, client) {
            let (use_eui64, count, start) = {
                let pond = &self.ponds[pond_id.0];
                (pond.use_eui64, pond.pools.len(), pond.last_pool)
            };
            if count == 0 || (use_eui64 && (kind != IaType::Na || !valid_eui64_duid(client.duid))) {
                continue;
            }

            let start = start % count;
            let mut index = start;
            loop {
                let pool_id = self.ponds[pond_id.0].pools[index];
                let pool = &self.pools[pool_id.0];
                if pool.kind == kind && !pool.is_full() {
                    let created = if use_eui64 {
                        self.create_eui64(pool_id, key, now).map(|id| (id, 1))
                    } else {
                        self.create_address(pool_id, key, attempts, now)
                    };
                    if let Ok((id, tries)) = created {
                        self.ponds[pond_id.0].last_pool =
                            if tries > 1 { (index + 1) % count } else { index };
                        return Ok(id);
                    }
                }
                index = (index + 1) % count;
                if index == start {
                    break;
                }
            }
        }

        debug!(
            "Unable to pick client address: no addresses available for {} ({})",
            key,
            self.counts(network, kind)
        );
        Err(Error::NoResources)
    }

    /// Picks a new delegated prefix, honoring the client's length hint
    /// according to `mode`.
    pub fn allocate_prefix(
        &mut self,
        network: usize,
        key: &IaKey,
        client: &ClientIdentity<'_>,
        hint: u8,
        mode: PrefixLengthMode,
        attempts: u32,
        now: i64,
    ) -> Result<LeaseId> {
        use PrefixLengthMode::{Exact, Ignore, Maximum, Minimum, Prefer};

        let passes: &[PrefixLengthMode] = match mode {
            _ if hint == 0 => &[Ignore],
            Ignore => &[Ignore],
            Prefer => &[Exact, Ignore],
            Exact => &[Exact],
            Minimum => &[Exact, Minimum],
            Maximum => &[Exact, Maximum],
        };

        for pass in passes {
            if let Some(id) = self.allocate_prefix_pass(network, key, client, hint, *pass, attempts, now) {
                return Ok(id);
            }
        }

        debug!("Unable to pick client prefix: no prefixes available for {}", key);
        Err(Error::NoResources)
    }

    fn allocate_prefix_pass(
        &mut self,
        network: usize,
        key: &IaKey,
        client: &ClientIdentity<'_>,
        hint: u8,
        pass: PrefixLengthMode,
        attempts: u32,
        now: i64,
    ) -> Option<LeaseId> {
        for pond_id in self.eligible_ponds(network, client) {
            let pools = self.ponds[pond_id.0].pools.clone();
            for pool_id in pools {
                let pool = &self.pools[pool_id.0];
                if pool.kind != IaType::Pd || pool.is_full() || !prefix_length_fits(pool.unit_len, hint, pass) {
                    continue;
                }
                if let Ok(id) = self.create_prefix(pool_id, key, attempts, now) {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Picks one temporary address from every eligible IA_TA pool.
    ///
    /// All or nothing: an exhausted pool fails the whole request.
    pub fn allocate_temporaries(
        &mut self,
        network: usize,
        key: &IaKey,
        client: &ClientIdentity<'_>,
        attempts: u32,
        now: i64,
    ) -> Result<Vec<LeaseId>> {
        let mut leases = Vec::new();
        for pond_id in self.eligible_ponds(network, client) {
            let pools = self.ponds[pond_id.0].pools.clone();
            for pool_id in pools {
                if self.pools[pool_id.0].kind != IaType::Ta {
                    continue;
                }
                let (id, _) = self.create_address(pool_id, key, attempts, now)?;
                leases.push(id);
            }
        }

        if leases.is_empty() {
            debug!("Unable to pick temporary addresses for {}", key);
            return Err(Error::NoResources);
        }
        Ok(leases)
    }

    /// Whether `address` lies in an EUI-64 pond without being the address
    /// that pond derives from `duid`.
    pub fn eui64_conflict(&self, address: Ipv6Addr, duid: &[u8]) -> bool {
        self.pools
            .iter()
            .filter(|pool| pool.kind == IaType::Na && pool.net.contains(&address))
            .any(|pool| {
                self.ponds[pool.pond.0].use_eui64 && eui64_address(pool.net, duid) != Some(address)
            })
    }

    /// Tries to give the client the specific address it asked for.
    pub fn try_address(
        &mut self,
        network: usize,
        address: Ipv6Addr,
        key: &IaKey,
        client: &ClientIdentity<'_>,
        now: i64,
    ) -> Result<LeaseId> {
        if address.is_unspecified() {
            return Err(Error::NotInPool(address));
        }

        let mut in_use = false;
        for pond_id in self.eligible_ponds(network, client) {
            let pond = &self.ponds[pond_id.0];
            if pond.use_eui64 {
                let derived = pond
                    .pools
                    .iter()
                    .find_map(|id| eui64_address(self.pools[id.0].net, client.duid));
                if derived != Some(address) {
                    continue;
                }
            }
            let pools = pond.pools.clone();
            for pool_id in pools {
                let pool = &self.pools[pool_id.0];
                if pool.kind != key.ia_type || !pool.contains(address, 128) {
                    continue;
                }
                match self.bind(pool_id, address, 0, key, now) {
                    Ok(id) => return Ok(id),
                    Err(_) => in_use = true,
                }
            }
        }

        if in_use {
            Err(Error::AddressInUse(address))
        } else {
            Err(Error::NotInPool(address))
        }
    }

    /// Tries to delegate the specific prefix the client asked for.
    pub fn try_prefix(
        &mut self,
        network: usize,
        prefix: Ipv6Addr,
        prefix_len: u8,
        key: &IaKey,
        client: &ClientIdentity<'_>,
        now: i64,
    ) -> Result<LeaseId> {
        if prefix.is_unspecified() {
            return Err(Error::NotInPool(prefix));
        }

        let mut in_use = false;
        for pond_id in self.eligible_ponds(network, client) {
            let pools = self.ponds[pond_id.0].pools.clone();
            for pool_id in pools {
                let pool = &self.pools[pool_id.0];
                if pool.kind != IaType::Pd || !pool.contains(prefix, prefix_len) {
                    continue;
                }
                match self.bind(pool_id, prefix, prefix_len, key, now) {
                    Ok(id) => return Ok(id),
                    Err(_) => in_use = true,
                }
            }
        }

        if in_use {
            Err(Error::AddressInUse(prefix))
        } else {
            Err(Error::NotInPool(prefix))
        }
    }

    /// Turns the lease's projected end into its binding and marks it
    /// committed.
    pub fn renew_lease(&mut self, id: LeaseId) -> Result<()> {
        self.set_state(id, LeaseState::Active)?;
        let lease = self.lease_entry(id)?;
        lease.hard_end = lease.soft_end;
        lease.soft_end = 0;
        lease.committed = true;
        Ok(())
    }

    /// Returns an active lease to the pool and runs its on-release hooks.
    pub fn release_lease(&mut self, id: LeaseId, now: i64) -> Result<()> {
        let lease = self.lease_entry(id)?;
        if lease.state != LeaseState::Active {
            return Ok(());
        }
        lease.hooks.run(HookKind::Release, &lease.describe());
        lease.hard_end = now;
        self.set_state(id, LeaseState::Released)
    }

    /// Marks a lease the client found in use elsewhere as abandoned.
    pub fn decline_lease(&mut self, id: LeaseId) -> Result<()> {
        self.set_state(id, LeaseState::Abandoned)?;
        let lease = self.lease_entry(id)?;
        lease.hard_end = MAX_TIME;
        match &lease.holder {
            Some(holder) => warn!("Abandoning {} declined by {}", lease.describe(), holder),
            None => warn!("Abandoning {}", lease.describe()),
        }
        Ok(())
    }

    /// Ends every active lease whose binding has run out.
    ///
    /// Uncommitted soft bindings are dropped outright. Committed leases
    /// become expired and run their on-expiry hooks.
    pub fn expire_leases(&mut self, now: i64) -> Vec<Expiration> {
        let mut due: Vec<LeaseId> = self
            .leases
            .values()
            .filter(|lease| lease.state == LeaseState::Active && lease.hard_end <= now)
            .map(|lease| lease.id)
            .collect();
        due.sort();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            let Some(lease) = self.leases.get(&id) else {
                continue;
            };
            let holder = lease.holder.clone();

            if !lease.committed {
                self.remove_lease(id);
                expired.push(Expiration {
                    lease: id,
                    holder,
                    dropped: true,
                });
                continue;
            }

            if let Some(lease) = self.leases.get(&id) {
                lease.hooks.run(HookKind::Expiry, &lease.describe());
                debug!("{} expired", lease.describe());
            }
            if self.set_state(id, LeaseState::Expired).is_ok() {
                expired.push(Expiration {
                    lease: id,
                    holder,
                    dropped: false,
                });
            }
        }
        expired
    }

    /// Logs when the pond of `id` crosses its high utilization threshold,
    /// and again when usage falls back to the low threshold.
    ///
    /// `high` and `low` are percentages. Jumbo ponds are never checked.
    pub fn check_pool_threshold(
        &mut self,
        id: LeaseId,
        high: Option<u32>,
        low: Option<u32>,
        network_name: &str,
    ) -> Option<ThresholdEvent> {
        let lease = self.leases.get(&id)?;
        let address = lease.describe();
        let pond = &mut self.ponds[self.pools[lease.pool.0].pond.0];
        if pond.jumbo {
            return None;
        }

        let (used, total) = (pond.active, pond.total);
        if pond.logged {
            if used > pond.low_threshold {
                return None;
            }
            info!(
                "Pool threshold reset - shared network: {}; address: {}; low threshold {}/{}.",
                network_name, address, used, total
            );
            pond.logged = false;
            pond.low_threshold = 0;
            return Some(ThresholdEvent::Reset { used, total });
        }

        let high = high.filter(|high| (1..=100).contains(high))?;
        if used < percent(total, high) {
            return None;
        }
        warn!(
            "Pool threshold exceeded - shared network: {}; address: {}; high threshold {}% {}/{}.",
            network_name, address, high, used, total
        );

        let low = low.filter(|low| *low <= 100).unwrap_or(0);
        if low < high {
            pond.logged = true;
            pond.low_threshold = percent(total, low);
        }
        Some(ThresholdEvent::Exceeded { used, total })
    }

    /// Re-inserts a lease loaded from the journal into the pool that
    /// contains it. Returns `None` when no pool of `kind` covers it any
    /// more or when the address is already taken.
    pub fn restore_lease(&mut self, kind: IaType, mut lease: SubLease) -> Option<LeaseId> {
        let unit_len = if lease.is_prefix() { lease.prefix_len } else { 128 };
        let Some(pool_id) = self
            .pools
            .iter()
            .position(|pool| pool.kind == kind && pool.contains(lease.address, unit_len))
            .map(PoolId)
        else {
            warn!("Dropping {} lease {}: no pool contains it", kind, lease.describe());
            return None;
        };

        if self.pools[pool_id.0].leases.contains_key(&lease.address) || self.leases.contains_key(&lease.id) {
            warn!("Dropping duplicate {} lease {}", kind, lease.describe());
            return None;
        }

        let id = lease.id;
        lease.pool = pool_id;
        self.next_id = self.next_id.max(id.0 + 1);
        self.pools[pool_id.0].leases.insert(lease.address, id);
        self.account(pool_id, lease.state, true);
        self.leases.insert(id, lease);
        Some(id)
    }

    fn lease_entry(&mut self, id: LeaseId) -> Result<&mut SubLease> {
        self.leases
            .get_mut(&id)
            .ok_or_else(|| Error::LeaseNotFound(id.to_string()))
    }

    fn set_state(&mut self, id: LeaseId, state: LeaseState) -> Result<()> {
        let lease = self.lease_entry(id)?;
        let (pool, old) = (lease.pool, lease.state);
        lease.state = state;
        if old != state {
            self.account(pool, old, false);
            self.account(pool, state, true);
        }
        Ok(())
    }

    fn account(&mut self, pool_id: PoolId, state: LeaseState, add: bool) {
        let pool = &mut self.pools[pool_id.0];
        let pond = &mut self.ponds[pool.pond.0];
        let adjust = |count: &mut u64| {
            *count = if add { *count + 1 } else { count.saturating_sub(1) };
        };
        if state.occupies() {
            adjust(&mut pool.occupied);
            adjust(&mut pond.active);
        }
        if state == LeaseState::Abandoned {
            adjust(&mut pond.abandoned);
        }
    }

    fn remove_lease(&mut self, id: LeaseId) -> Option<SubLease> {
        let lease = self.leases.remove(&id)?;
        let pool = &mut self.pools[lease.pool.0];
        if pool.leases.get(&lease.address) == Some(&id) {
            pool.leases.remove(&lease.address);
        }
        self.account(lease.pool, lease.state, false);
        Some(lease)
    }

    fn slot(&self, pool: PoolId, address: Ipv6Addr, key: &IaKey) -> Slot {
        let Some(lease) = self.pools[pool.0]
            .leases
            .get(&address)
            .and_then(|id| self.leases.get(id))
        else {
            return Slot::Free;
        };

        if !lease.state.occupies() {
            Slot::Reclaim(lease.id)
        } else if lease.state == LeaseState::Active
            && !lease.committed
            && lease.holder.as_ref() == Some(key)
        {
            Slot::Own(lease.id)
        } else {
            Slot::Taken
        }
    }

    /// Soft-binds `address` to `key`, reclaiming an expired or released
    /// lease at the same address.
    fn bind(&mut self, pool: PoolId, address: Ipv6Addr, prefix_len: u8, key: &IaKey, now: i64) -> Result<LeaseId> {
        match self.slot(pool, address, key) {
            Slot::Taken => return Err(Error::AddressInUse(address)),
            Slot::Own(id) => {
                if let Some(lease) = self.leases.get_mut(&id) {
                    lease.hard_end = lease.hard_end.max(now + SOFT_BINDING_SECONDS);
                }
                return Ok(id);
            }
            Slot::Reclaim(id) => {
                self.remove_lease(id);
            }
            Slot::Free => {}
        }

        let id = LeaseId(self.next_id);
        self.next_id += 1;
        self.leases.insert(
            id,
            SubLease {
                id,
                address,
                prefix_len,
                pool,
                holder: Some(key.clone()),
                state: LeaseState::Active,
                preferred: 0,
                valid: 0,
                hard_end: now + SOFT_BINDING_SECONDS,
                soft_end: 0,
                committed: false,
                hooks: HookSet::default(),
                ddns_pending: false,
            },
        );
        self.pools[pool.0].leases.insert(address, id);
        self.account(pool, LeaseState::Active, true);
        Ok(id)
    }

    fn create_address(&mut self, pool: PoolId, key: &IaKey, attempts: u32, now: i64) -> Result<(LeaseId, u32)> {
        let (net, kind) = (self.pools[pool.0].net, self.pools[pool.0].kind);
        let mut input = key.iaid_duid();

        for attempt in 1..=attempts {
            let candidate = match kind {
                IaType::Ta => self.build_temporary(net, &input),
                _ => build_address(net, &input),
            };
            if !is_reserved_iid(candidate) {
                if let Ok(id) = self.bind(pool, candidate, 0, key, now) {
                    return Ok((id, attempt));
                }
            }
            input.extend_from_slice(&candidate.octets());
        }
        Err(Error::NoResources)
    }

    fn create_prefix(&mut self, pool: PoolId, key: &IaKey, attempts: u32, now: i64) -> Result<LeaseId> {
        let (net, unit_len) = (self.pools[pool.0].net, self.pools[pool.0].unit_len);
        let mut input = key.iaid_duid();

        for _ in 0..attempts {
            let candidate = mask(splice(net, &digest(&input)), unit_len);
            if let Ok(id) = self.bind(pool, candidate, unit_len, key, now) {
                return Ok(id);
            }
            input.extend_from_slice(&candidate.octets());
        }
        Err(Error::NoResources)
    }

    fn create_eui64(&mut self, pool: PoolId, key: &IaKey, now: i64) -> Result<LeaseId> {
        let address = eui64_address(self.pools[pool.0].net, &key.duid).ok_or(Error::NoResources)?;
        self.bind(pool, address, 0, key, now)
    }

    /// Temporary addresses mix a rolling history value into the hash, so
    /// the same IA gets a different address each time.
    fn build_temporary(&mut self, net: Ipv6Net, input: &[u8]) -> Ipv6Addr {
        let mut hasher = Sha256::new();
        hasher.update(self.history);
        hasher.update(input);
        let digest = hasher.finalize();
        self.history.copy_from_slice(&digest[16..24]);

        let mut hashed = [0u8; 16];
        hashed.copy_from_slice(&digest[..16]);
        clear_u_bit(net, splice(net, &hashed))
    }
}

fn prefix_length_fits(unit_len: u8, hint: u8, mode: PrefixLengthMode) -> bool {
    match mode {
        PrefixLengthMode::Exact => unit_len == hint,
        PrefixLengthMode::Minimum => unit_len >= hint,
        PrefixLengthMode::Maximum => unit_len <= hint,
        PrefixLengthMode::Ignore | PrefixLengthMode::Prefer => true,
    }
}

/// `percent` percent of `count`, without overflowing for huge counts.
fn percent(count: u64, percent: u32) -> u64 {
    let percent = u64::from(percent);
    if count > u64::MAX / 100 {
        count / 100 * percent
    } else {
        count * percent / 100
    }
}

fn digest(input: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(input);
    let mut hashed = [0u8; 16];
    hashed.copy_from_slice(&digest[..16]);
    hashed
}

/// Zeroes every bit of `address` past the first `len`.
fn mask(address: Ipv6Addr, len: u8) -> Ipv6Addr {
    let bits = u128::from(address);
    let mask = u128::MAX.checked_shl(128 - u32::from(len.min(128))).unwrap_or(0);
    Ipv6Addr::from(bits & mask)
}

/// Keeps the network bits of `net` and fills the host bits from `hashed`.
fn splice(net: Ipv6Net, hashed: &[u8; 16]) -> Ipv6Addr {
    let network = u128::from(net.network());
    let host = u128::from_be_bytes(*hashed) & u128::from(net.hostmask());
    Ipv6Addr::from(network | host)
}

/// Clears the universal/local bit of hashed IIDs in /64 pools.
fn clear_u_bit(net: Ipv6Net, address: Ipv6Addr) -> Ipv6Addr {
    if net.prefix_len() != 64 {
        return address;
    }
    let mut octets = address.octets();
    octets[8] &= !0x02;
    Ipv6Addr::from(octets)
}

fn build_address(net: Ipv6Net, input: &[u8]) -> Ipv6Addr {
    clear_u_bit(net, splice(net, &digest(input)))
}

/// The all-zero IID and the RFC 2526 reserved anycast IIDs are never
/// handed out.
pub fn is_reserved_iid(address: Ipv6Addr) -> bool {
    let octets = address.octets();
    octets[8..].iter().all(|byte| *byte == 0)
        || (octets[8..15] == RESERVED_ANYCAST_PREFIX && octets[15] & 0x80 != 0)
}

/// A DUID-LL carrying an EUI-64 link-layer address (hardware type 27).
pub fn valid_eui64_duid(duid: &[u8]) -> bool {
    duid.len() == 12 && duid[..4] == [0x00, 0x03, 0x00, 0x1b]
}

/// The address an EUI-64 pond gives `duid` from the /64 `net`.
pub fn eui64_address(net: Ipv6Net, duid: &[u8]) -> Option<Ipv6Addr> {
    if net.prefix_len() != 64 || !valid_eui64_duid(duid) {
        return None;
    }
    let mut octets = [0u8; 16];
    octets[..8].copy_from_slice(&net.network().octets()[..8]);
    octets[8..].copy_from_slice(&duid[4..12]);
    octets[8] |= 0x02;
    Some(Ipv6Addr::from(octets))
}
