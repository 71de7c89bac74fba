//! Identity associations and the in-memory IA index.
//!
//! An IA is keyed by (type, IAID, DUID) and lists the sub-leases the client
//! holds under it. Records in the index are never edited in place: a
//! renewal builds a fresh [`IaRecord`] and swaps it in with
//! [`IaRepository::replace`], so the previous record stays available for
//! ownership and roam comparisons while the reply is built.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::format_duid;
use crate::options::OptionCode;
use crate::pool::{LeaseId, PoolArena};

/// The three kinds of identity association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IaType {
    /// Non-temporary addresses (IA_NA).
    Na,
    /// Temporary addresses (IA_TA).
    Ta,
    /// Delegated prefixes (IA_PD).
    Pd,
}

impl IaType {
    /// The option code carrying this IA type on the wire.
    pub fn option_code(self) -> u16 {
        match self {
            Self::Na => OptionCode::IaNa as u16,
            Self::Ta => OptionCode::IaTa as u16,
            Self::Pd => OptionCode::IaPd as u16,
        }
    }
}

impl std::fmt::Display for IaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Na => "NA",
            Self::Ta => "TA",
            Self::Pd => "PD",
        };
        write!(f, "{}", name)
    }
}

/// Index key of an IA.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IaKey {
    pub ia_type: IaType,
    pub iaid: u32,
    #[serde(with = "hex")]
    pub duid: Vec<u8>,
}

impl IaKey {
    pub fn new(ia_type: IaType, iaid: u32, duid: &[u8]) -> Self {
        Self {
            ia_type,
            iaid,
            duid: duid.to_vec(),
        }
    }

    /// IAID followed by the DUID: the seed for address hashing.
    pub fn iaid_duid(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.duid.len());
        data.extend_from_slice(&self.iaid.to_be_bytes());
        data.extend_from_slice(&self.duid);
        data
    }
}

impl std::fmt::Display for IaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} iaid={} duid={}",
            self.ia_type,
            self.iaid,
            format_duid(&self.duid)
        )
    }
}

/// An identity association and the sub-leases bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaRecord {
    pub key: IaKey,
    pub leases: Vec<LeaseId>,
    /// Client last transaction time, Unix seconds.
    pub cltt: i64,
}

impl IaRecord {
    pub fn new(key: IaKey) -> Self {
        Self {
            key,
            leases: Vec::new(),
            cltt: 0,
        }
    }
}

/// Hash index of active IAs.
#[derive(Debug, Default)]
pub struct IaRepository {
    index: HashMap<IaKey, IaRecord>,
}

impl IaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &IaKey) -> Option<&IaRecord> {
        self.index.get(key)
    }

    /// Removes `old` (if any) and inserts `new` stamped with `now` as its
    /// client last transaction time.
    pub fn replace(&mut self, old: Option<&IaKey>, mut new: IaRecord, now: i64) {
        if let Some(old_key) = old {
            self.index.remove(old_key);
        }
        new.cltt = now;
        self.index.insert(new.key.clone(), new);
    }

    /// Drops a record from the index without touching its leases.
    pub fn remove(&mut self, key: &IaKey) -> Option<IaRecord> {
        self.index.remove(key)
    }

    /// Restores a record loaded from the journal, keeping its `cltt`.
    pub fn restore(&mut self, record: IaRecord) {
        self.index.insert(record.key.clone(), record);
    }

    /// Sets the client last transaction time of an indexed record.
    pub fn touch(&mut self, key: &IaKey, now: i64) {
        if let Some(record) = self.index.get_mut(key) {
            record.cltt = now;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &IaRecord> {
        self.index.values()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Returns true if the shared network owning `old`'s first sub-lease is not
/// `network`.
///
/// All sub-leases of one IA come from the same shared network, so the first
/// one decides. An IA without live sub-leases never counts as roamed.
pub fn detect_roam(old: &IaRecord, arena: &PoolArena, network: usize) -> bool {
    old.leases
        .iter()
        .find_map(|id| arena.lease(*id))
        .map(|lease| arena.pool(lease.pool).network != network)
        .unwrap_or(false)
}
