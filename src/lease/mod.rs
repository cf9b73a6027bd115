//! Fixed-capacity pool of workspace + port-pair leases.
//!
//! Each slot binds one filesystem workspace and one deterministic port
//! pair to at most one run. The slot table is a single JSON record on
//! disk; every read-modify-write happens under an exclusive file lock so
//! independently-scheduled executors can never double-allocate a slot.
//!
//! Slots are released explicitly on terminal success, or reclaimed by
//! [`LeasePool::sweep`] when their heartbeat goes stale and the owning
//! run is no longer running. Reclamation is logged as a recoverable
//! anomaly, never a silent delete.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StewardConfig;
use crate::errors::LeaseError;

/// An exclusive binding of one workspace and one port pair to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub slot_index: usize,
    pub owner_run_id: String,
    pub workspace_path: PathBuf,
    pub port_pair: (u16, u16),
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// The persisted slot table, keyed by slot index.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseTable {
    slots: BTreeMap<usize, Lease>,
}

pub struct LeasePool {
    table_path: PathBuf,
    lock_path: PathBuf,
    workspace_root: PathBuf,
    capacity: usize,
    app_port_base: u16,
    proxy_port_base: u16,
    stale_after: Duration,
}

impl LeasePool {
    pub fn new(config: &StewardConfig) -> Self {
        Self {
            table_path: config.paths.state_root.join("leases.json"),
            lock_path: config.paths.state_root.join("leases.lock"),
            workspace_root: config.paths.workspace_root.clone(),
            capacity: config.pool.capacity,
            app_port_base: config.pool.app_port_base,
            proxy_port_base: config.pool.proxy_port_base,
            stale_after: Duration::seconds(config.pool.stale_after_secs as i64),
        }
    }

    /// The port pair for a slot; constant across the pool's lifetime.
    pub fn port_pair_for(&self, slot_index: usize) -> (u16, u16) {
        (
            self.app_port_base + slot_index as u16,
            self.proxy_port_base + slot_index as u16,
        )
    }

    /// Acquire a lease for `run_id`.
    ///
    /// Idempotent: a run that already owns a slot gets the same lease
    /// back (its workspace is recreated if it vanished), so resumed runs
    /// never consume a second slot.
    pub fn acquire(&self, run_id: &str) -> Result<Lease, LeaseError> {
        self.with_table(|table| {
            if let Some(existing) = table
                .slots
                .values_mut()
                .find(|l| l.owner_run_id == run_id)
            {
                if !existing.workspace_path.exists() {
                    fs::create_dir_all(&existing.workspace_path).map_err(|e| {
                        LeaseError::WorkspaceCreation {
                            path: existing.workspace_path.clone(),
                            source: e,
                        }
                    })?;
                }
                existing.heartbeat_at = Utc::now();
                debug!(run_id = %run_id, slot = existing.slot_index, "re-acquired existing lease");
                return Ok(existing.clone());
            }

            let slot_index = (0..self.capacity)
                .find(|i| !table.slots.contains_key(i))
                .ok_or(LeaseError::Exhausted {
                    capacity: self.capacity,
                })?;

            let workspace_path = self.workspace_root.join(format!("run-{}", run_id));
            fs::create_dir_all(&workspace_path).map_err(|e| LeaseError::WorkspaceCreation {
                path: workspace_path.clone(),
                source: e,
            })?;

            let now = Utc::now();
            let lease = Lease {
                slot_index,
                owner_run_id: run_id.to_string(),
                workspace_path,
                port_pair: self.port_pair_for(slot_index),
                acquired_at: now,
                heartbeat_at: now,
            };
            table.slots.insert(slot_index, lease.clone());
            debug!(run_id = %run_id, slot = slot_index, "acquired lease");
            Ok(lease)
        })
    }

    /// Release the lease owned by `run_id`. Releasing a run that holds
    /// no lease is a no-op, so cleanup paths can call this freely.
    pub fn release(&self, run_id: &str) -> Result<(), LeaseError> {
        self.with_table(|table| {
            let slot = table
                .slots
                .iter()
                .find(|(_, l)| l.owner_run_id == run_id)
                .map(|(i, _)| *i);
            if let Some(slot) = slot {
                table.slots.remove(&slot);
                debug!(run_id = %run_id, slot = slot, "released lease");
            }
            Ok(())
        })
    }

    /// Refresh the heartbeat on `run_id`'s lease so the sweep knows the
    /// owning process is alive.
    pub fn heartbeat(&self, run_id: &str) -> Result<(), LeaseError> {
        self.with_table(|table| {
            let lease = table
                .slots
                .values_mut()
                .find(|l| l.owner_run_id == run_id)
                .ok_or_else(|| LeaseError::NotHeld {
                    run_id: run_id.to_string(),
                })?;
            lease.heartbeat_at = Utc::now();
            Ok(())
        })
    }

    /// All currently-held leases, in slot order.
    pub fn list_active(&self) -> Result<Vec<Lease>, LeaseError> {
        self.with_table(|table| Ok(table.slots.values().cloned().collect()))
    }

    /// Reclaim slots whose heartbeat is older than the staleness
    /// threshold and whose owner is not in `running`. Returns the
    /// reclaimed leases.
    pub fn sweep(&self, running: &HashSet<String>, now: DateTime<Utc>) -> Result<Vec<Lease>, LeaseError> {
        self.with_table(|table| {
            let stale: Vec<usize> = table
                .slots
                .values()
                .filter(|l| {
                    now - l.heartbeat_at > self.stale_after && !running.contains(&l.owner_run_id)
                })
                .map(|l| l.slot_index)
                .collect();

            let mut reclaimed = Vec::new();
            for slot in stale {
                if let Some(lease) = table.slots.remove(&slot) {
                    warn!(
                        run_id = %lease.owner_run_id,
                        slot = slot,
                        heartbeat_at = %lease.heartbeat_at,
                        "reclaimed stale lease"
                    );
                    reclaimed.push(lease);
                }
            }
            Ok(reclaimed)
        })
    }

    /// Run `f` against the slot table under the exclusive file lock,
    /// persisting the table afterwards with a write-new-then-rename.
    fn with_table<T>(
        &self,
        f: impl FnOnce(&mut LeaseTable) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| LeaseError::TableIo {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| LeaseError::TableIo {
                path: self.lock_path.clone(),
                source: e,
            })?;
        lock_file
            .lock_exclusive()
            .map_err(|e| LeaseError::TableIo {
                path: self.lock_path.clone(),
                source: e,
            })?;

        // The lock is dropped with the file handle at the end of this
        // scope, after the table has been renamed into place.
        let mut table = self.read_table()?;
        let out = f(&mut table)?;
        self.write_table(&table)?;
        Ok(out)
    }

    fn read_table(&self) -> Result<LeaseTable, LeaseError> {
        match fs::read_to_string(&self.table_path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| LeaseError::CorruptTable {
                    path: self.table_path.clone(),
                    source: e,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LeaseTable::default()),
            Err(e) => Err(LeaseError::TableIo {
                path: self.table_path.clone(),
                source: e,
            }),
        }
    }

    fn write_table(&self, table: &LeaseTable) -> Result<(), LeaseError> {
        let content = serde_json::to_string_pretty(table).map_err(|e| LeaseError::CorruptTable {
            path: self.table_path.clone(),
            source: e,
        })?;
        let tmp = self.table_path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| LeaseError::TableIo {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &self.table_path).map_err(|e| LeaseError::TableIo {
            path: self.table_path.clone(),
            source: e,
        })
    }
}
