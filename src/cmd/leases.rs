//! `steward leases` — inspect the slot table, optionally sweep.

use std::collections::HashSet;

use anyhow::Result;
use console::style;

use steward::config::StewardConfig;
use steward::lease::LeasePool;
use steward::run::{RunStatus, RunStore};

pub fn cmd_leases(config: StewardConfig, sweep: bool) -> Result<()> {
    let pool = LeasePool::new(&config);

    if sweep {
        let store = RunStore::new(&config.paths.state_root);
        let running: HashSet<String> = store
            .list()?
            .into_iter()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.run_id)
            .collect();
        let reclaimed = pool.sweep(&running, chrono::Utc::now())?;
        if reclaimed.is_empty() {
            println!("Nothing to reclaim.");
        }
        for lease in reclaimed {
            println!(
                "Reclaimed slot {} from run {} (last heartbeat {})",
                lease.slot_index,
                style(&lease.owner_run_id).dim(),
                lease.heartbeat_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    let active = pool.list_active()?;
    if active.is_empty() {
        println!("No active leases.");
        return Ok(());
    }
    println!(
        "{:<6} {:<12} {:<14} {:<20} {}",
        "SLOT", "PORTS", "OWNER", "HEARTBEAT", "WORKSPACE"
    );
    for lease in active {
        println!(
            "{:<6} {:<12} {:<14} {:<20} {}",
            lease.slot_index,
            format!("{}/{}", lease.port_pair.0, lease.port_pair.1),
            &lease.owner_run_id[..12.min(lease.owner_run_id.len())],
            lease.heartbeat_at.format("%Y-%m-%d %H:%M:%S"),
            lease.workspace_path.display()
        );
    }
    Ok(())
}
