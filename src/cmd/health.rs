//! `steward health` — per-run triage labels with a meaningful exit code.

use anyhow::Result;
use console::style;
use futures::future::join_all;
use tracing::debug;

use steward::chain::ChainRegistry;
use steward::config::StewardConfig;
use steward::health::{HealthLabel, HealthThresholds, RunHealth, classify};
use steward::platform::{MergeRequestSnapshot, PlatformClient, TicketSnapshot};
use steward::run::{ArtifactKind, Run, RunStore};

/// Classify every non-archived run. Returns the process exit code:
/// zero when every run is healthy (or there are none).
pub async fn cmd_health(config: StewardConfig, archive: bool) -> Result<i32> {
    let store = RunStore::new(&config.paths.state_root);
    let registry = ChainRegistry::load_or_default(&config.paths.state_root)?;
    let platform = PlatformClient::new(&config.platform);
    let thresholds = HealthThresholds::from(&config.health);

    let runs = store.list()?;
    if runs.is_empty() {
        println!("No runs.");
        return Ok(0);
    }

    let snapshots = join_all(runs.iter().map(|run| snapshot(&platform, run))).await;

    let now = chrono::Utc::now();
    let mut unhealthy = 0;
    let mut reports: Vec<(RunHealth, bool)> = Vec::new();
    for (run, (ticket, mr)) in runs.iter().zip(snapshots) {
        let health = classify(
            run,
            registry.expects_merge_request(&run.chain_name),
            ticket.as_ref(),
            mr.as_ref(),
            now,
            thresholds,
        );
        if health.label != HealthLabel::Healthy {
            unhealthy += 1;
        }
        let archivable =
            health.label == HealthLabel::Healthy && run.status.is_terminal();
        reports.push((health, archivable));
    }

    println!(
        "{:<10} {:<12} {:<10} {:<16} {}",
        "RUN", "TICKET", "STATUS", "LABEL", "DETAIL"
    );
    for (health, _) in &reports {
        let label = match health.label {
            HealthLabel::Healthy => style(health.label.as_str()).green(),
            HealthLabel::Stuck | HealthLabel::BlockedCiPass => {
                style(health.label.as_str()).yellow()
            }
            HealthLabel::Failed | HealthLabel::NoRequest => style(health.label.as_str()).red(),
        };
        println!(
            "{:<10} {:<12} {:<10} {:<16} {}",
            &health.run_id[..8.min(health.run_id.len())],
            health.ticket_ref,
            health.status,
            label,
            health.detail
        );
    }

    if archive {
        for (health, archivable) in &reports {
            if *archivable {
                store.archive(&health.run_id)?;
                println!("Archived {}", style(&health.run_id).dim());
            }
        }
    }

    Ok(if unhealthy == 0 { 0 } else { 1 })
}

/// Gather platform snapshots for one run; platform failures degrade to
/// `None` so an unreachable platform never hides local state.
async fn snapshot(
    platform: &PlatformClient,
    run: &Run,
) -> (Option<TicketSnapshot>, Option<MergeRequestSnapshot>) {
    let ticket = match platform.ticket(&run.ticket_ref).await {
        Ok(ticket) => Some(ticket),
        Err(e) => {
            debug!(run_id = %run.run_id, error = %e, "ticket snapshot unavailable");
            None
        }
    };
    let mr = match run.artifacts.get(ArtifactKind::MergeRequest) {
        Some(mr_ref) => match platform.merge_request(&mr_ref).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(run_id = %run.run_id, error = %e, "merge request snapshot unavailable");
                None
            }
        },
        None => None,
    };
    (ticket, mr)
}
