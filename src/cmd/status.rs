//! `steward status` — inspect one run or the whole fleet.

use anyhow::Result;
use console::style;

use steward::config::StewardConfig;
use steward::run::{Run, RunStore};

pub fn cmd_status(config: StewardConfig, run_id: Option<&str>) -> Result<()> {
    let store = RunStore::new(&config.paths.state_root);

    match run_id {
        Some(run_id) => {
            let run = store.load(run_id)?;
            print_run_detail(&run);
        }
        None => {
            let runs = store.list()?;
            if runs.is_empty() {
                println!("No runs.");
                return Ok(());
            }
            println!(
                "{:<10} {:<12} {:<10} {:<10} {:<10} {}",
                "RUN", "TICKET", "CHAIN", "STATUS", "PHASE", "UPDATED"
            );
            for run in runs {
                println!(
                    "{:<10} {:<12} {:<10} {:<10} {:<10} {}",
                    &run.run_id[..8.min(run.run_id.len())],
                    run.ticket_ref,
                    run.chain_name,
                    run.status,
                    run.current_phase.as_deref().unwrap_or("-"),
                    run.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

fn print_run_detail(run: &Run) {
    println!("Run       {}", style(&run.run_id).cyan());
    println!("Ticket    {}", run.ticket_ref);
    println!("Chain     {} ({})", run.chain_name, run.classification.as_str());
    println!("Status    {}", run.status);
    if let Some(phase) = &run.current_phase {
        println!("Phase     {}", phase);
    }
    if let Some(lease) = &run.lease {
        println!(
            "Lease     slot {} ports {}/{} at {}",
            lease.slot_index,
            lease.port_pair.0,
            lease.port_pair.1,
            lease.workspace_path.display()
        );
    }

    if !run.phase_history.is_empty() {
        println!("History:");
        for record in &run.phase_history {
            let duration = (record.ended_at - record.started_at).num_seconds();
            println!(
                "  {:10} {:20} {:>5}s  {}",
                record.phase_name,
                record.outcome.as_str(),
                duration,
                record.detail.summary
            );
            for evidence in &record.detail.evidence {
                println!("             - {}", evidence);
            }
        }
    }

    let artifacts = [
        ("plan", run.artifacts.get(steward::run::ArtifactKind::Plan)),
        ("branch", run.artifacts.get(steward::run::ArtifactKind::Branch)),
        (
            "merge_request",
            run.artifacts.get(steward::run::ArtifactKind::MergeRequest),
        ),
        (
            "merge_commit",
            run.artifacts.get(steward::run::ArtifactKind::MergeCommit),
        ),
        (
            "test_report",
            run.artifacts.get(steward::run::ArtifactKind::TestReport),
        ),
        (
            "review_summary",
            run.artifacts.get(steward::run::ArtifactKind::ReviewSummary),
        ),
        (
            "doc_update",
            run.artifacts.get(steward::run::ArtifactKind::DocUpdate),
        ),
    ];
    let produced: Vec<_> = artifacts
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{}={}", name, v)))
        .collect();
    if !produced.is_empty() {
        println!("Artifacts {}", produced.join(" "));
    }
    if !run.next_steps.is_empty() {
        println!(
            "Next      {}",
            style(run.next_steps.join(", ")).yellow()
        );
    }
}
