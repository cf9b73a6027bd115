//! `steward recover` — operator-confirmed forced completion.
//!
//! Inspects a failed run's merge-request and CI state and, only when an
//! independent merge verification passes, offers to force-complete the
//! run. Nothing here is automatic: the operator confirms explicitly.

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};

use steward::config::StewardConfig;
use steward::lease::LeasePool;
use steward::platform::{MergeRequestState, PlatformClient};
use steward::run::{ArtifactKind, RunStatus, RunStore};
use steward::verify::merge::verify_merge_landed;

pub async fn cmd_recover(config: StewardConfig, run_id: &str) -> Result<()> {
    let store = RunStore::new(&config.paths.state_root);
    let platform = PlatformClient::new(&config.platform);
    let mut run = store.load(run_id)?;

    println!(
        "Run {} (ticket {}, chain '{}') is {}",
        style(&run.run_id).cyan(),
        run.ticket_ref,
        run.chain_name,
        style(run.status.as_str()).red()
    );
    if run.status == RunStatus::Succeeded {
        println!("Run already succeeded; nothing to recover.");
        return Ok(());
    }
    if !run.status.is_terminal() {
        println!("Run is still {}; recovery applies to terminal runs only.", run.status);
        return Ok(());
    }

    let Some(mr_ref) = run.artifacts.get(ArtifactKind::MergeRequest) else {
        println!("No merge request was produced; forced completion is not available.");
        println!("Start a fresh run for the ticket instead.");
        return Ok(());
    };

    let snapshot = platform.merge_request(&mr_ref).await?;
    println!(
        "Merge request {}: state={:?} ci={:?} commit={}",
        mr_ref,
        snapshot.state,
        snapshot.ci_rollup,
        snapshot.merge_commit.as_deref().unwrap_or("-")
    );

    if snapshot.state != MergeRequestState::Merged {
        println!("Merge request is not merged; forced completion is not available.");
        return Ok(());
    }
    let Some(merge_commit) = snapshot.merge_commit else {
        println!("Platform reports merged but exposes no merge commit; refusing.");
        return Ok(());
    };

    // Same corroboration the publish phase applies: the platform's word
    // alone never force-completes a run.
    let Some(lease) = &run.lease else {
        println!("Run has no workspace to verify the merge against; refusing.");
        return Ok(());
    };
    let verification = verify_merge_landed(
        &lease.workspace_path,
        &merge_commit,
        &config.platform.target_branch,
        &[],
    )?;
    if !verification.passed {
        let reason = verification
            .reason
            .map(|r| r.detail)
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "{} merge verification failed: {}",
            style("Refusing:").red(),
            reason
        );
        return Ok(());
    }
    for evidence in &verification.evidence {
        println!("  verified: {}", evidence);
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Force-complete this run (mark succeeded, release its lease)?")
        .default(false)
        .interact()?;
    if !confirmed {
        println!("Left unchanged.");
        return Ok(());
    }

    // Explicit operator reset: the one sanctioned path out of a
    // terminal failure.
    run.status = RunStatus::Succeeded;
    run.artifacts.merge_commit = Some(merge_commit);
    run.next_steps.clear();
    store.save(&mut run)?;
    LeasePool::new(&config).release(&run.run_id)?;
    println!("Run {} force-completed.", style(&run.run_id).green());
    Ok(())
}
