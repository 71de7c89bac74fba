//! Lease journal: persistence of committed IAs.
//!
//! The journal mirrors every IA the engine commits as a JSON document. It is
//! written back to disk lazily: mutations only mark it dirty, and
//! [`LeaseJournal::commit_timed`] flushes it once the configured interval
//! has passed. On startup the journal is replayed into the pool arena and
//! the IA repository.
//!
//! # File Format
//!
//! ```json
//! {
//!   "ias": [
//!     {
//!       "key": { "ia_type": "na", "iaid": 7, "duid": "000100011c39cf88080027fe8f95" },
//!       "cltt": 1700000000,
//!       "leases": [
//!         { "id": 1, "address": "2001:db8:1::1017", "prefix_len": 0, "state": "active",
//!           "preferred": 21600, "valid": 43200, "hard_end": 1700043200 }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::ia::{IaKey, IaRecord, IaRepository};
use crate::pool::{LeaseId, LeaseState, PoolArena, PoolId, SubLease};
use crate::scope::HookSet;

/// One sub-lease as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLease {
    pub id: u64,
    pub address: Ipv6Addr,
    #[serde(default)]
    pub prefix_len: u8,
    pub state: LeaseState,
    pub preferred: u32,
    pub valid: u32,
    /// Unix seconds at which the binding ends.
    pub hard_end: i64,
    #[serde(default, skip_serializing_if = "HookSet::is_empty")]
    pub hooks: HookSet,
}

impl StoredLease {
    fn from_lease(lease: &SubLease) -> Self {
        Self {
            id: lease.id.0,
            address: lease.address,
            prefix_len: lease.prefix_len,
            state: lease.state,
            preferred: lease.preferred,
            valid: lease.valid,
            hard_end: lease.hard_end,
            hooks: lease.hooks.clone(),
        }
    }

    fn into_lease(self, holder: &IaKey) -> SubLease {
        SubLease {
            id: LeaseId(self.id),
            address: self.address,
            prefix_len: self.prefix_len,
            pool: PoolId(0),
            holder: Some(holder.clone()),
            state: self.state,
            preferred: self.preferred,
            valid: self.valid,
            hard_end: self.hard_end,
            soft_end: 0,
            committed: true,
            hooks: self.hooks,
            ddns_pending: false,
        }
    }

    /// `2001:db8::1` for addresses, `2001:db8:1::/56` for prefixes.
    pub fn describe(&self) -> String {
        if self.prefix_len != 0 {
            format!("{}/{}", self.address, self.prefix_len)
        } else {
            self.address.to_string()
        }
    }

    /// End of the binding as a UTC timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.hard_end, 0)
    }
}

/// One IA as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIa {
    pub key: IaKey,
    /// Client last transaction time, Unix seconds.
    pub cltt: i64,
    pub leases: Vec<StoredLease>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    #[serde(default)]
    ias: Vec<StoredIa>,
}

/// In-memory copy of the lease file with a dirty flag.
#[derive(Debug)]
pub struct LeaseJournal {
    path: PathBuf,
    entries: HashMap<IaKey, StoredIa>,
    /// Whether entries changed since the last save.
    dirty: bool,
    last_save: Instant,
    interval: Duration,
}

impl LeaseJournal {
    /// Creates an empty journal that will be saved to `path`.
    pub fn new<P: AsRef<Path>>(path: P, interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: HashMap::new(),
            dirty: false,
            last_save: Instant::now(),
            interval,
        }
    }

    /// Loads the journal at `path`, or starts an empty one if the file does
    /// not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load<P: AsRef<Path>>(path: P, interval: Duration) -> Result<Self> {
        let mut journal = Self::new(path, interval);
        if journal.path.exists() {
            let content = tokio::fs::read_to_string(&journal.path).await?;
            let file: JournalFile = serde_json::from_str(&content)?;
            journal.entries = file
                .ias
                .into_iter()
                .map(|ia| (ia.key.clone(), ia))
                .collect();
            info!(
                "Loaded {} IAs from {}",
                journal.entries.len(),
                journal.path.display()
            );
        }
        Ok(journal)
    }

    /// Replays the journal into a fresh arena and repository.
    ///
    /// Leases no pool covers any more are dropped with a warning, and an IA
    /// left without leases is not restored. Returns the number of restored
    /// IAs.
    pub fn restore(&self, arena: &mut PoolArena, repository: &mut IaRepository) -> usize {
        let mut restored = 0;
        for stored in self.entries.values() {
            let leases: Vec<LeaseId> = stored
                .leases
                .iter()
                .cloned()
                .filter_map(|lease| arena.restore_lease(stored.key.ia_type, lease.into_lease(&stored.key)))
                .collect();
            if leases.is_empty() {
                debug!("Skipping {}: no lease survived", stored.key);
                continue;
            }
            repository.restore(IaRecord {
                key: stored.key.clone(),
                leases,
                cltt: stored.cltt,
            });
            restored += 1;
        }
        restored
    }

    /// Records the current state of an IA. An IA without live leases is
    /// removed from the journal.
    pub fn write_ia(&mut self, record: &IaRecord, arena: &PoolArena) {
        let leases: Vec<StoredLease> = record
            .leases
            .iter()
            .filter_map(|id| arena.lease(*id))
            .map(StoredLease::from_lease)
            .collect();

        if leases.is_empty() {
            self.entries.remove(&record.key);
        } else {
            self.entries.insert(
                record.key.clone(),
                StoredIa {
                    key: record.key.clone(),
                    cltt: record.cltt,
                    leases,
                },
            );
        }
        self.dirty = true;
    }

    pub fn get(&self, key: &IaKey) -> Option<&StoredIa> {
        self.entries.get(key)
    }

    /// All stored IAs, ordered by key.
    pub fn entries(&self) -> Vec<&StoredIa> {
        let mut entries: Vec<&StoredIa> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            (a.key.ia_type as u8, &a.key.duid, a.key.iaid).cmp(&(b.key.ia_type as u8, &b.key.duid, b.key.iaid))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Saves the journal if it is dirty and the commit interval has passed.
    pub async fn commit_timed(&mut self) -> Result<()> {
        if self.dirty && self.last_save.elapsed() >= self.interval {
            self.save().await?;
        }
        Ok(())
    }

    /// Forces an immediate save.
    ///
    /// The file is written next to its final location and renamed over it,
    /// so a crash mid-write leaves the previous journal intact.
    pub async fn save(&mut self) -> Result<()> {
        let file = JournalFile {
            ias: self.entries().into_iter().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        self.dirty = false;
        self.last_save = Instant::now();
        debug!("Saved {} IAs to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}
